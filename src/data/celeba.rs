//! The federated CelebA dataset: one client per celebrity.
//!
//! Expected layout under `<data_dir>/<dataset>/`:
//!
//! ```text
//! raw/img_align_celeba/*.jpg
//! test/all_data_niid_05_keep_0_test_9.json
//! train/all_data_niid_05_keep_0_train_9.json
//! ```

use std::path::{Path, PathBuf};

use super::{manifest::Manifest, preprocess, DataError, Dataset, ImageShape};

pub const IMAGE_DIR: &str = "raw/img_align_celeba";
pub const TEST_MANIFEST: &str = "test/all_data_niid_05_keep_0_test_9.json";
pub const TRAIN_MANIFEST: &str = "train/all_data_niid_05_keep_0_train_9.json";

/// Paths of the CelebA files for a dataset directory.
pub struct CelebaPaths {
    pub images: PathBuf,
    pub test_manifest: PathBuf,
    pub train_manifest: PathBuf,
}

impl CelebaPaths {
    pub fn new(dataset_dir: &Path) -> Self {
        Self {
            images: dataset_dir.join(IMAGE_DIR),
            test_manifest: dataset_dir.join(TEST_MANIFEST),
            train_manifest: dataset_dir.join(TRAIN_MANIFEST),
        }
    }
}

/// Load the per-user train datasets and the pooled test dataset.
///
/// The test dataset concatenates the images of every test user; the train datasets hold
/// one dataset per distinct train user, in manifest order.
pub fn get_data(dataset_dir: &Path, num_pixel: u32) -> Result<(Vec<Dataset>, Dataset), DataError> {
    let paths = CelebaPaths::new(dataset_dir);
    let shape = ImageShape::square(3, num_pixel as usize);

    let test_manifest = Manifest::load(&paths.test_manifest)?;
    let mut test_images = Vec::new();
    let mut test_labels = Vec::new();
    for (_, data) in test_manifest.iter_users() {
        for name in &data.x {
            test_images.push(preprocess::load_padded(&paths.images.join(name), num_pixel)?);
        }
        test_labels.extend_from_slice(&data.y);
    }
    let test_dataset = Dataset::from_images(shape, test_images, test_labels)?;
    debug!("loaded {} CelebA test images", test_dataset.len());

    let train_manifest = Manifest::load(&paths.train_manifest)?;
    let mut train_datasets = Vec::new();
    for (user, data) in train_manifest.iter_users() {
        let images = data
            .x
            .iter()
            .map(|name| preprocess::load_padded(&paths.images.join(name), num_pixel))
            .collect::<Result<Vec<_>, _>>()?;
        let dataset = Dataset::from_images(shape, images, data.y.clone())?;
        trace!("user {}: {} train images", user, dataset.len());
        train_datasets.push(dataset);
    }
    debug!("loaded CelebA train data of {} users", train_datasets.len());

    Ok((train_datasets, test_dataset))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{env, fs};

    use image::{Rgb, RgbImage};

    use super::*;

    /// Lay out a tiny CelebA directory: three train users (one listed twice) and two test
    /// users, with 5x7 images.
    pub fn fake_celeba() -> PathBuf {
        let root = env::temp_dir().join(format!("fedrun-celeba-{}", uuid::Uuid::new_v4()));
        let images = root.join(IMAGE_DIR);
        fs::create_dir_all(&images).unwrap();
        fs::create_dir_all(root.join("test")).unwrap();
        fs::create_dir_all(root.join("train")).unwrap();
        for i in 0..8u8 {
            RgbImage::from_pixel(5, 7, Rgb([i * 30, 100, 200]))
                .save(images.join(format!("{:06}.png", i)))
                .unwrap();
        }
        fs::write(
            root.join(TRAIN_MANIFEST),
            r#"{
                "users": ["u1", "u2", "u3", "u2"],
                "user_data": {
                    "u1": {"x": ["000000.png", "000001.png"], "y": [0, 1]},
                    "u2": {"x": ["000002.png"], "y": [1]},
                    "u3": {"x": ["000003.png", "000004.png", "000005.png"], "y": [0, 0, 1]}
                }
            }"#,
        )
        .unwrap();
        fs::write(
            root.join(TEST_MANIFEST),
            r#"{
                "users": ["t1", "t2"],
                "user_data": {
                    "t1": {"x": ["000006.png"], "y": [1]},
                    "t2": {"x": ["000007.png", "000000.png"], "y": [0, 1]}
                }
            }"#,
        )
        .unwrap();
        root
    }

    #[test]
    fn test_get_data() {
        let root = fake_celeba();
        let (train, test) = get_data(&root, 6).unwrap();

        // one dataset per distinct train user
        assert_eq!(train.len(), 3);
        assert_eq!(
            train.iter().map(Dataset::len).collect::<Vec<_>>(),
            vec![2, 1, 3]
        );
        assert_eq!(train[2].labels(), &[0, 0, 1]);

        assert_eq!(test.len(), 3);
        assert_eq!(test.labels(), &[1, 0, 1]);
        assert_eq!(test.shape(), ImageShape::square(3, 6));

        assert!(super::super::data_sanity_check(&train, &test, 3, 6).is_ok());
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_missing_image() {
        let root = fake_celeba();
        fs::remove_file(root.join(IMAGE_DIR).join("000004.png")).unwrap();
        assert!(matches!(get_data(&root, 6), Err(DataError::Image { .. })));
        fs::remove_dir_all(&root).unwrap();
    }
}
