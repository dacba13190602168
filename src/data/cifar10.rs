//! CIFAR-10 from its binary distribution.
//!
//! Expected layout under `<data_dir>/<dataset>/`:
//!
//! ```text
//! cifar-10-batches-bin/data_batch_1.bin ... data_batch_5.bin
//! cifar-10-batches-bin/test_batch.bin
//! ```
//!
//! Every record is one label byte followed by the 32x32 red, green and blue planes.

use std::{fs, path::Path};

use image::RgbImage;

use super::{
    partition::{partition_indices, Partition},
    preprocess, DataError, Dataset, ImageShape,
};
use crate::config::PartitionConfig;

pub const BATCH_DIR: &str = "cifar-10-batches-bin";
pub const TRAIN_BATCHES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];
pub const TEST_BATCH: &str = "test_batch.bin";
pub const NUM_CLASSES: usize = 10;

const SIDE: usize = 32;
const PLANE: usize = SIDE * SIDE;
const RECORD_LEN: usize = 1 + 3 * PLANE;

/// Decode the records of one binary batch.
pub fn read_batch(
    path: &Path,
    num_pixel: u32,
    inputs: &mut Vec<f32>,
    labels: &mut Vec<i64>,
) -> Result<(), DataError> {
    let bytes = fs::read(path).map_err(|source| DataError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if bytes.len() % RECORD_LEN != 0 {
        return Err(DataError::TruncatedBatch {
            path: path.to_path_buf(),
            len: bytes.len(),
        });
    }
    for record in bytes.chunks_exact(RECORD_LEN) {
        labels.push(record[0] as i64);
        let planes = &record[1..];
        if num_pixel as usize == SIDE {
            inputs.extend(planes.iter().map(|&value| value as f32 / 255.0));
        } else {
            let image = RgbImage::from_fn(SIDE as u32, SIDE as u32, |x, y| {
                let base = y as usize * SIDE + x as usize;
                image::Rgb([
                    planes[base],
                    planes[PLANE + base],
                    planes[2 * PLANE + base],
                ])
            });
            let resized = preprocess::resize(&image, num_pixel, num_pixel);
            inputs.extend(preprocess::to_chw(&resized));
        }
    }
    Ok(())
}

fn read_split(dir: &Path, files: &[&str], num_pixel: u32) -> Result<Dataset, DataError> {
    let mut inputs = Vec::new();
    let mut labels = Vec::new();
    for file in files {
        read_batch(&dir.join(file), num_pixel, &mut inputs, &mut labels)?;
    }
    Dataset::new(ImageShape::square(3, num_pixel as usize), inputs, labels)
}

/// Load CIFAR-10 and split its train set across `num_clients` clients.
pub fn get_cifar10(
    dataset_dir: &Path,
    num_pixel: u32,
    num_clients: usize,
    partition: Partition,
    seed: u64,
    params: PartitionConfig,
) -> Result<(Vec<Dataset>, Dataset), DataError> {
    let dir = dataset_dir.join(BATCH_DIR);
    let test_dataset = read_split(&dir, &[TEST_BATCH], num_pixel)?;
    let train_data = read_split(&dir, &TRAIN_BATCHES, num_pixel)?;
    debug!(
        "loaded CIFAR-10: {} train and {} test images",
        train_data.len(),
        test_dataset.len()
    );

    let parts = partition_indices(train_data.labels(), num_clients, partition, seed, params)?;
    let train_datasets: Vec<Dataset> = parts
        .iter()
        .map(|indices| train_data.subset(indices))
        .collect();
    for (client, dataset) in train_datasets.iter().enumerate() {
        info!(
            "{} partition, client {}: {} samples, classes {:?}",
            partition,
            client,
            dataset.len(),
            dataset.class_counts(NUM_CLASSES)
        );
    }
    Ok((train_datasets, test_dataset))
}
