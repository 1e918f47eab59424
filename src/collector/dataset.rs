use std::path::Path;

use walkdir::WalkDir;

use crate::collector::count_images;
use crate::collector::error::{CollectError, CollectResult};
use crate::collector::filter::is_image_file;

/// Per-category tally of the dataset tree handed to the training pipeline.
/// The directory tree is the sole contract surfaced downstream; nothing is
/// handed over in memory.
#[derive(Debug, Clone)]
pub(crate) struct DatasetSummary {
    pub(crate) categories: Vec<(String, usize)>,
    pub(crate) total: usize,
}

/// Walks the dataset root and counts images per category directory.
///
/// A missing root is a setup precondition violation, not a transient
/// pipeline condition, so it surfaces as a hard configuration error instead
/// of an empty summary.
pub(crate) fn summarize(dataset_root: &Path) -> CollectResult<DatasetSummary> {
    if !dataset_root.is_dir() {
        return Err(CollectError::Config(format!(
            "dataset directory {} does not exist",
            dataset_root.display()
        )));
    }

    let mut categories = Vec::new();
    for entry in WalkDir::new(dataset_root)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let count = count_images(entry.path());
        categories.push((name, count));
    }
    categories.sort_by(|a, b| a.0.cmp(&b.0));

    let total = categories.iter().map(|(_, count)| count).sum();
    let stray = WalkDir::new(dataset_root)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && is_image_file(e.path()))
        .count();
    if stray > 0 {
        warn!("{} image(s) sit directly under the dataset root and belong to no category.", stray);
    }

    Ok(DatasetSummary { categories, total })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::tempdir;

    #[test]
    fn missing_root_is_a_hard_configuration_error() {
        let result = summarize(Path::new("definitely/not/here"));
        assert!(matches!(result, Err(CollectError::Config(_))));
    }

    #[test]
    fn counts_images_per_category() {
        let root = tempdir().unwrap();
        for (name, count) in [("cat", 2usize), ("dog", 1usize), ("empty", 0usize)] {
            let dir = root.path().join(name);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..count {
                RgbImage::from_pixel(160, 160, Rgb([i as u8, 0, 0]))
                    .save(dir.join(format!("{name}_{i:04}.jpg")))
                    .unwrap();
            }
        }
        std::fs::write(root.path().join("cat/readme.txt"), b"ignored").unwrap();

        let summary = summarize(root.path()).unwrap();

        assert_eq!(summary.total, 3);
        assert_eq!(
            summary.categories,
            vec![
                (String::from("cat"), 2),
                (String::from("dog"), 1),
                (String::from("empty"), 0),
            ]
        );
    }
}
