use std::path::{Path, PathBuf};

use image::RgbImage;
use image_hasher::{Hasher, ImageHash};

use crate::collector::store::{HashStore, perceptual_hasher};

/// Extensions the pipeline treats as images, both when scanning the scratch
/// tree and when counting the permanent dataset.
const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

pub(crate) fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|known| e.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}

/// A candidate that survived decoding, the resolution floor, and dedup.
/// The image is canonical 3-channel RGB, so hash values are stable across
/// source formats and the oracle sees a uniform input.
pub(crate) struct LoadedCandidate {
    pub(crate) image: RgbImage,
    pub(crate) hash: ImageHash,
    pub(crate) path: PathBuf,
}

/// Quality and dedup gate in front of the validation oracle.
pub(crate) struct QualityFilter {
    min_dimension: u32,
    hasher: Hasher,
}

impl QualityFilter {
    pub(crate) fn new(min_dimension: u32) -> Self {
        QualityFilter {
            min_dimension,
            hasher: perceptual_hasher(),
        }
    }

    pub(crate) fn hash(&self, image: &RgbImage) -> ImageHash {
        self.hasher.hash_image(image)
    }

    /// Loads one bounded batch of candidate files, dropping images that are
    /// unreadable, below the resolution floor, or already in the hash store.
    /// A corrupt file only costs itself; the rest of the batch survives.
    pub(crate) fn load_batch(&self, paths: &[PathBuf], store: &HashStore) -> Vec<LoadedCandidate> {
        let mut candidates = Vec::with_capacity(paths.len());

        for path in paths {
            let decoded = match image::open(path) {
                Ok(img) => img,
                Err(e) => {
                    debug!("Skipping unreadable candidate {}: {}", path.display(), e);
                    continue;
                }
            };

            let image = decoded.to_rgb8();
            let (width, height) = image.dimensions();
            if width < self.min_dimension || height < self.min_dimension {
                trace!(
                    "Rejecting {} at {}x{}, below the {}px floor.",
                    path.display(),
                    width,
                    height,
                    self.min_dimension
                );
                continue;
            }

            let hash = self.hasher.hash_image(&image);
            if store.contains(&hash) {
                trace!("Rejecting {} as an already-seen image.", path.display());
                continue;
            }

            candidates.push(LoadedCandidate {
                image,
                hash,
                path: path.clone(),
            });
        }

        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::tempdir;

    fn noisy_image(width: u32, height: u32, seed: u8) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([
                (x as u8).wrapping_mul(seed),
                (y as u8).wrapping_add(seed),
                seed,
            ])
        })
    }

    #[test]
    fn enforces_the_resolution_floor() {
        let dir = tempdir().unwrap();
        let small = dir.path().join("small.png");
        let tall = dir.path().join("tall.png");
        let ok = dir.path().join("ok.png");
        noisy_image(149, 300, 3).save(&small).unwrap();
        noisy_image(300, 149, 5).save(&tall).unwrap();
        noisy_image(150, 150, 7).save(&ok).unwrap();

        let filter = QualityFilter::new(150);
        let store = HashStore::new();
        let batch = filter.load_batch(&[small, tall, ok.clone()], &store);

        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].path, ok);
    }

    #[test]
    fn drops_candidates_already_in_the_store() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("first.png");
        let duplicate = dir.path().join("duplicate.png");
        noisy_image(200, 200, 11).save(&first).unwrap();
        noisy_image(200, 200, 11).save(&duplicate).unwrap();

        let filter = QualityFilter::new(150);
        let mut store = HashStore::new();

        let batch = filter.load_batch(&[first], &store);
        assert_eq!(batch.len(), 1);
        store.insert(batch[0].hash.clone());

        let batch = filter.load_batch(&[duplicate], &store);
        assert!(batch.is_empty());
    }

    #[test]
    fn corrupt_file_does_not_drop_the_rest_of_the_batch() {
        let dir = tempdir().unwrap();
        let corrupt = dir.path().join("corrupt.jpg");
        let good = dir.path().join("good.png");
        std::fs::write(&corrupt, b"this is not a jpeg").unwrap();
        noisy_image(180, 180, 13).save(&good).unwrap();

        let filter = QualityFilter::new(150);
        let store = HashStore::new();
        let batch = filter.load_batch(&[corrupt, good.clone()], &store);

        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].path, good);
    }

    #[test]
    fn recognizes_image_extensions_case_insensitively() {
        assert!(is_image_file(Path::new("a/b/c.JPG")));
        assert!(is_image_file(Path::new("photo.jpeg")));
        assert!(is_image_file(Path::new("photo.png")));
        assert!(!is_image_file(Path::new("photo.gif")));
        assert!(!is_image_file(Path::new("photo")));
    }
}
