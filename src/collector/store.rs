use std::collections::HashSet;
use std::path::Path;

use image_hasher::{HashAlg, Hasher, HasherConfig, ImageHash};
use walkdir::WalkDir;

use crate::collector::filter::is_image_file;

/// Builds the gradient hasher shared by seeding and filtering. A fixed
/// configuration matters here: hashes computed with a different algorithm or
/// size never collide with stored ones, which silently disables dedup.
pub(crate) fn perceptual_hasher() -> Hasher {
    HasherConfig::new()
        .hash_alg(HashAlg::Gradient)
        .hash_size(8, 8)
        .to_hasher()
}

/// In-memory set of perceptual hashes of every accepted image.
///
/// One instance per collection run, owned by the driver and passed by
/// reference into the filter stage. Append-only during a run; all insertions
/// happen on the thread finalizing acceptance, so no locking is involved.
pub(crate) struct HashStore {
    hashes: HashSet<ImageHash>,
}

impl HashStore {
    pub(crate) fn new() -> Self {
        HashStore {
            hashes: HashSet::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.hashes.len()
    }

    pub(crate) fn contains(&self, hash: &ImageHash) -> bool {
        self.hashes.contains(hash)
    }

    /// Inserts an accepted image's hash. Returns false if it was already
    /// present, which callers treat as a late duplicate.
    pub(crate) fn insert(&mut self, hash: ImageHash) -> bool {
        self.hashes.insert(hash)
    }

    /// Walks the existing dataset tree and hashes every image already on
    /// disk, so reruns are incremental. Unreadable files are logged and
    /// skipped; they will simply not protect against their duplicates.
    pub(crate) fn seed_from_dataset(&mut self, dataset_root: &Path, hasher: &Hasher) -> usize {
        if !dataset_root.exists() {
            trace!("No existing dataset at {}, starting empty.", dataset_root.display());
            return 0;
        }

        let mut seeded = 0;
        for entry in WalkDir::new(dataset_root)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !entry.file_type().is_file() || !is_image_file(path) {
                continue;
            }
            match image::open(path) {
                Ok(img) => {
                    self.hashes.insert(hasher.hash_image(&img.to_rgb8()));
                    seeded += 1;
                }
                Err(e) => {
                    warn!("Unable to hash existing image {}: {}", path.display(), e);
                }
            }
        }
        info!("Seeded hash store with {} existing images.", seeded);
        seeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::tempdir;

    fn solid_image(width: u32, height: u32, rgb: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb(rgb))
    }

    #[test]
    fn insert_and_contains() {
        let hasher = perceptual_hasher();
        let mut store = HashStore::new();
        let hash = hasher.hash_image(&solid_image(64, 64, [10, 200, 30]));

        assert!(!store.contains(&hash));
        assert!(store.insert(hash.clone()));
        assert!(store.contains(&hash));
        assert!(!store.insert(hash));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn seeds_from_existing_dataset_tree() {
        let root = tempdir().unwrap();
        let cat_dir = root.path().join("cat");
        std::fs::create_dir_all(&cat_dir).unwrap();
        solid_image(160, 160, [255, 0, 0])
            .save(cat_dir.join("cat_0000.jpg"))
            .unwrap();
        // Non-image files in the tree are ignored.
        std::fs::write(cat_dir.join("notes.txt"), b"not an image").unwrap();

        let hasher = perceptual_hasher();
        let mut store = HashStore::new();
        let seeded = store.seed_from_dataset(root.path(), &hasher);

        assert_eq!(seeded, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn missing_dataset_root_seeds_nothing() {
        let hasher = perceptual_hasher();
        let mut store = HashStore::new();
        let seeded = store.seed_from_dataset(Path::new("does/not/exist"), &hasher);
        assert_eq!(seeded, 0);
        assert_eq!(store.len(), 0);
    }
}
