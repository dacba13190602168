//! Datasets and their loaders.

pub mod celeba;
pub mod cifar10;
pub mod preprocess;
pub mod manifest;
pub mod partition;

use std::{fmt, io, path::PathBuf};

use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("failed to read {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("failed to decode image {path}: {source}")]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("invalid manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("user {0:?} is listed in the manifest but has no data")]
    MissingUser(String),
    #[error("{context}: {images} images but {labels} labels")]
    LabelCountMismatch {
        context: String,
        images: usize,
        labels: usize,
    },
    #[error("expected images of shape {expected} but got {actual_len} values per image")]
    ShapeMismatch {
        expected: ImageShape,
        actual_len: usize,
    },
    #[error("expected images of shape {expected} but the data holds {actual} images")]
    WrongShape {
        expected: ImageShape,
        actual: ImageShape,
    },
    #[error("pixel value {value} of sample {sample} is outside [0, 1]")]
    PixelOutOfRange { sample: usize, value: f32 },
    #[error("label {label} of sample {sample} is not a valid class")]
    InvalidLabel { sample: usize, label: i64 },
    #[error("truncated CIFAR-10 batch {path}: {len} bytes is not a multiple of the record size")]
    TruncatedBatch { path: PathBuf, len: usize },
    #[error("cannot partition data across {0} clients")]
    NoClients(usize),
    #[error("invalid dirichlet parameter {0}")]
    InvalidAlpha(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// The channel-first shape of one image.
pub struct ImageShape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl ImageShape {
    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
        }
    }

    /// A square image with `num_pixel` pixels per side.
    pub fn square(channels: usize, num_pixel: usize) -> Self {
        Self::new(channels, num_pixel, num_pixel)
    }

    /// Number of values of one image.
    pub fn len(&self) -> usize {
        self.channels * self.height * self.width
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for ImageShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.channels, self.height, self.width)
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Images paired with integer labels.
///
/// The images are stored back to back, channel-first, in a single buffer.
pub struct Dataset {
    shape: ImageShape,
    inputs: Vec<f32>,
    labels: Vec<i64>,
}

impl Dataset {
    /// Create a dataset from a flat buffer of images.
    ///
    /// # Errors
    /// Fails if the buffer does not hold exactly one image per label.
    pub fn new(shape: ImageShape, inputs: Vec<f32>, labels: Vec<i64>) -> Result<Self, DataError> {
        let image_len = shape.len();
        if image_len == 0 || inputs.len() % image_len != 0 {
            return Err(DataError::ShapeMismatch {
                expected: shape,
                actual_len: inputs.len(),
            });
        }
        let images = inputs.len() / image_len;
        if images != labels.len() {
            return Err(DataError::LabelCountMismatch {
                context: "dataset".to_string(),
                images,
                labels: labels.len(),
            });
        }
        Ok(Self {
            shape,
            inputs,
            labels,
        })
    }

    /// Create a dataset from one buffer per image.
    pub fn from_images(
        shape: ImageShape,
        images: Vec<Vec<f32>>,
        labels: Vec<i64>,
    ) -> Result<Self, DataError> {
        let mut inputs = Vec::with_capacity(images.len() * shape.len());
        for image in images {
            if image.len() != shape.len() {
                return Err(DataError::ShapeMismatch {
                    expected: shape,
                    actual_len: image.len(),
                });
            }
            inputs.extend(image);
        }
        Self::new(shape, inputs, labels)
    }

    pub fn empty(shape: ImageShape) -> Self {
        Self {
            shape,
            inputs: Vec::new(),
            labels: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn shape(&self) -> ImageShape {
        self.shape
    }

    pub fn labels(&self) -> &[i64] {
        &self.labels
    }

    /// The values of the image at `index`.
    ///
    /// # Panics
    /// Panics if `index` is out of bounds.
    pub fn input(&self, index: usize) -> &[f32] {
        let len = self.shape.len();
        &self.inputs[index * len..(index + 1) * len]
    }

    pub fn get(&self, index: usize) -> Option<(&[f32], i64)> {
        let label = *self.labels.get(index)?;
        Some((self.input(index), label))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[f32], i64)> + '_ {
        self.inputs
            .chunks_exact(self.shape.len())
            .zip(self.labels.iter().copied())
    }

    /// Copy the samples at the given indices into a new dataset.
    pub fn subset(&self, indices: &[usize]) -> Self {
        let mut inputs = Vec::with_capacity(indices.len() * self.shape.len());
        let mut labels = Vec::with_capacity(indices.len());
        for &index in indices {
            inputs.extend_from_slice(self.input(index));
            labels.push(self.labels[index]);
        }
        Self {
            shape: self.shape,
            inputs,
            labels,
        }
    }

    /// Split the sample indices in batches of at most `batch_size`.
    pub fn batches<R: Rng>(&self, batch_size: usize, shuffle: bool, rng: &mut R) -> Vec<Vec<usize>> {
        let mut indices: Vec<usize> = (0..self.len()).collect();
        if shuffle {
            indices.shuffle(rng);
        }
        indices
            .chunks(batch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    /// Number of samples of every class in `0..num_classes`. Out of range labels are ignored.
    pub fn class_counts(&self, num_classes: usize) -> Vec<usize> {
        let mut counts = vec![0; num_classes];
        for &label in &self.labels {
            if label >= 0 && (label as usize) < num_classes {
                counts[label as usize] += 1;
            }
        }
        counts
    }

    fn ensure_shape(&self, shape: ImageShape) -> Result<(), DataError> {
        if self.shape == shape {
            Ok(())
        } else {
            Err(DataError::WrongShape {
                expected: shape,
                actual: self.shape,
            })
        }
    }

    fn check(&self, shape: ImageShape) -> Result<(), DataError> {
        self.ensure_shape(shape)?;
        let images = self.inputs.len() / shape.len();
        if images != self.labels.len() {
            return Err(DataError::LabelCountMismatch {
                context: "dataset".to_string(),
                images,
                labels: self.labels.len(),
            });
        }
        for (sample, (input, label)) in self.iter().enumerate() {
            if let Some(&value) = input.iter().find(|v| !(0.0..=1.0).contains(*v)) {
                return Err(DataError::PixelOutOfRange { sample, value });
            }
            if label < 0 {
                return Err(DataError::InvalidLabel { sample, label });
            }
        }
        Ok(())
    }
}

/// Check that every dataset holds images of `shape`, without looking at the pixels.
pub fn ensure_shape(
    train_datasets: &[Dataset],
    test_dataset: &Dataset,
    shape: ImageShape,
) -> Result<(), DataError> {
    train_datasets
        .iter()
        .chain(std::iter::once(test_dataset))
        .try_for_each(|dataset| dataset.ensure_shape(shape))
}

/// Check that every dataset holds `num_channel x num_pixel x num_pixel` images with values
/// in `[0, 1]`, one label per image.
pub fn data_sanity_check(
    train_datasets: &[Dataset],
    test_dataset: &Dataset,
    num_channel: usize,
    num_pixel: usize,
) -> Result<(), DataError> {
    let shape = ImageShape::square(num_channel, num_pixel);
    for dataset in train_datasets.iter().chain(std::iter::once(test_dataset)) {
        dataset.check(shape)?;
    }
    info!(
        "data sanity check passed: {} train datasets, {} test samples of shape {}",
        train_datasets.len(),
        test_dataset.len(),
        shape
    );
    Ok(())
}
