//! Models trained by the clients.
//!
//! A model owns a flat `f32` parameter vector; federated averaging, optimizers and the RPC
//! link all work on that vector directly.

mod checkpoint;
mod cnn;
mod linear;
pub mod loss;
pub mod metric;
mod mlp;

use std::path::PathBuf;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

use crate::data::{Dataset, ImageShape};

pub use self::{
    checkpoint::Checkpoint,
    cnn::Cnn,
    linear::Linear,
    loss::{get_loss, LossFn},
    metric::{get_metric, Metric},
    mlp::Mlp,
};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown model {0:?}, expected one of: CNN, MLP, Linear")]
    UnknownModel(String),
    #[error("expected {expected} parameters but got {actual}")]
    ParameterCount { expected: usize, actual: usize },
    #[error("unknown loss {0:?}, expected one of: CrossEntropyLoss, MSELoss")]
    UnknownLoss(String),
    #[error("loss definition files are not supported ({0}), pick a built-in loss with --loss_fn_name")]
    LossFile(PathBuf),
    #[error("unknown metric {0:?}, expected: accuracy")]
    UnknownMetric(String),
    #[error("the model takes {expected} values per image, got {actual}")]
    InputLength { expected: usize, actual: usize },
    #[error("the model takes {expected} images, the data holds {actual} images")]
    InputShape {
        expected: ImageShape,
        actual: ImageShape,
    },
    #[error("label {label} is not a class of a {classes}-class model")]
    InvalidLabel { label: i64, classes: usize },
    #[error("checkpoint {path}: {message}")]
    Checkpoint { path: PathBuf, message: String },
}

/// A classifier over channel-first images.
pub trait Model: Send + Sync {
    fn name(&self) -> &'static str;

    fn num_classes(&self) -> usize;

    /// The shape of the images the model was built for.
    fn input_shape(&self) -> ImageShape;

    fn parameters(&self) -> &[f32];

    fn parameters_mut(&mut self) -> &mut [f32];

    /// Replace the parameters.
    ///
    /// # Errors
    /// Fails if `parameters` does not have the length of the model's parameter vector.
    fn set_parameters(&mut self, parameters: &[f32]) -> Result<(), ModelError> {
        let own = self.parameters_mut();
        if own.len() != parameters.len() {
            return Err(ModelError::ParameterCount {
                expected: own.len(),
                actual: parameters.len(),
            });
        }
        own.copy_from_slice(parameters);
        Ok(())
    }

    /// Fail unless `input` holds exactly one image of the model's input shape.
    fn check_input(&self, input: &[f32]) -> Result<(), ModelError> {
        let expected = self.input_shape().len();
        if input.len() == expected {
            Ok(())
        } else {
            Err(ModelError::InputLength {
                expected,
                actual: input.len(),
            })
        }
    }

    /// Fail unless `dataset` holds images of the model's input shape.
    fn check_dataset(&self, dataset: &Dataset) -> Result<(), ModelError> {
        if dataset.shape() == self.input_shape() {
            Ok(())
        } else {
            Err(ModelError::InputShape {
                expected: self.input_shape(),
                actual: dataset.shape(),
            })
        }
    }

    /// Compute the logits of one image.
    fn forward(&self, input: &[f32]) -> Result<Vec<f32>, ModelError>;

    /// Accumulate into `grad` the gradient of the parameters, given the gradient of the
    /// loss with respect to the logits of `input`.
    ///
    /// `grad_logits` has one value per class and `grad` one value per parameter.
    fn backward(&self, input: &[f32], grad_logits: &[f32], grad: &mut [f32])
        -> Result<(), ModelError>;

    fn boxed_clone(&self) -> Box<dyn Model>;
}

impl Clone for Box<dyn Model> {
    fn clone(&self) -> Self {
        self.boxed_clone()
    }
}

/// Build a freshly initialized model.
///
/// Names are matched case-insensitively.
pub fn get_model(
    name: &str,
    shape: ImageShape,
    num_classes: usize,
    seed: u64,
) -> Result<Box<dyn Model>, ModelError> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let model: Box<dyn Model> = match name.to_ascii_lowercase().as_str() {
        "cnn" => Box::new(Cnn::new(shape, num_classes, cnn::DEFAULT_FILTERS, &mut rng)),
        "mlp" => Box::new(Mlp::new(shape, num_classes, mlp::DEFAULT_HIDDEN, &mut rng)),
        "linear" | "logistic" => Box::new(Linear::new(shape, num_classes, &mut rng)),
        _ => return Err(ModelError::UnknownModel(name.to_string())),
    };
    debug!(
        "built {} model with {} parameters",
        model.name(),
        model.parameters().len()
    );
    Ok(model)
}

/// Fill `values` with draws from `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`.
pub(crate) fn uniform_init<R: Rng>(values: &mut [f32], fan_in: usize, rng: &mut R) {
    let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
    for value in values.iter_mut() {
        *value = rng.gen_range(-bound..=bound);
    }
}

/// Check a label against the number of classes of a model.
pub fn class_index(label: i64, classes: usize) -> Result<usize, ModelError> {
    usize::try_from(label)
        .ok()
        .filter(|&index| index < classes)
        .ok_or(ModelError::InvalidLabel { label, classes })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Compare `backward` with central finite differences of `loss`.
    pub fn check_gradient(model: &mut dyn Model, input: &[f32], label: usize) {
        let loss = LossFn::CrossEntropy;
        let logits = model.forward(input).unwrap();
        let mut grad_logits = vec![0.0; logits.len()];
        loss.loss_and_grad(&logits, label, &mut grad_logits);
        let mut grad = vec![0.0; model.parameters().len()];
        model.backward(input, &grad_logits, &mut grad).unwrap();

        let eps = 1e-3;
        let stride = (grad.len() / 25).max(1);
        for index in (0..grad.len()).step_by(stride) {
            let original = model.parameters()[index];
            model.parameters_mut()[index] = original + eps;
            let plus = loss.loss(&model.forward(input).unwrap(), label);
            model.parameters_mut()[index] = original - eps;
            let minus = loss.loss(&model.forward(input).unwrap(), label);
            model.parameters_mut()[index] = original;
            let numeric = (plus - minus) / (2.0 * eps);
            assert!(
                (numeric - grad[index]).abs() < 1e-2,
                "parameter {}: numeric {} vs analytic {}",
                index,
                numeric,
                grad[index]
            );
        }
    }

    #[test]
    fn test_get_model() {
        let shape = ImageShape::square(3, 4);
        for name in ["CNN", "cnn", "MLP", "Linear", "logistic"] {
            let model = get_model(name, shape, 2, 1).unwrap();
            assert_eq!(model.input_shape(), shape);
            assert_eq!(model.forward(&vec![0.5; shape.len()]).unwrap().len(), 2);
        }
        assert!(matches!(
            get_model("resnet18", shape, 2, 1),
            Err(ModelError::UnknownModel(_))
        ));
    }

    #[test]
    fn test_seeded_init() {
        let shape = ImageShape::square(3, 4);
        let first = get_model("CNN", shape, 2, 1).unwrap();
        let second = get_model("CNN", shape, 2, 1).unwrap();
        let other = get_model("CNN", shape, 2, 2).unwrap();
        assert_eq!(first.parameters(), second.parameters());
        assert_ne!(first.parameters(), other.parameters());
    }

    #[test]
    fn test_set_parameters() {
        let mut model = get_model("Linear", ImageShape::square(1, 2), 2, 1).unwrap();
        let len = model.parameters().len();
        assert!(model.set_parameters(&vec![0.0; len]).is_ok());
        assert!(model.parameters().iter().all(|p| *p == 0.0));
        assert!(matches!(
            model.set_parameters(&[0.0]),
            Err(ModelError::ParameterCount { .. })
        ));
    }

    #[test]
    fn test_rejects_inputs_of_another_shape() {
        let shape = ImageShape::square(3, 4);
        let image = vec![0.5; shape.len()];
        for name in ["CNN", "MLP", "Linear"] {
            // a 4-channel model fed 3-channel images, and the other way around
            let wider = get_model(name, ImageShape::square(4, 4), 2, 1).unwrap();
            assert!(matches!(
                wider.forward(&image),
                Err(ModelError::InputLength {
                    expected: 64,
                    actual: 48
                })
            ));
            let narrower = get_model(name, ImageShape::square(1, 4), 2, 1).unwrap();
            assert!(narrower.forward(&image).is_err());
            let mut grad = vec![0.0; narrower.parameters().len()];
            assert!(narrower.backward(&image, &[0.5, -0.5], &mut grad).is_err());
            assert!(grad.iter().all(|g| *g == 0.0));

            let data = Dataset::new(shape, image.clone(), vec![0]).unwrap();
            assert!(matches!(
                narrower.check_dataset(&data),
                Err(ModelError::InputShape { .. })
            ));
            let model = get_model(name, shape, 2, 1).unwrap();
            assert!(model.check_dataset(&data).is_ok());
        }
    }

    #[test]
    fn test_class_index() {
        assert_eq!(class_index(1, 2).unwrap(), 1);
        assert!(class_index(2, 2).is_err());
        assert!(class_index(-1, 2).is_err());
    }
}
