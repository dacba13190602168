//! Loss functions over the logits of one sample.

use std::path::Path;

use derive_more::Display;

use super::ModelError;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossFn {
    /// Softmax cross entropy.
    #[display(fmt = "CrossEntropyLoss")]
    CrossEntropy,
    /// Mean squared error against the one-hot encoded label.
    #[display(fmt = "MSELoss")]
    Mse,
}

impl Default for LossFn {
    fn default() -> Self {
        LossFn::CrossEntropy
    }
}

impl LossFn {
    /// The loss of one sample, writing its gradient with respect to the logits in `grad`.
    pub fn loss_and_grad(&self, logits: &[f32], label: usize, grad: &mut [f32]) -> f32 {
        match self {
            LossFn::CrossEntropy => {
                let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let sum: f32 = logits.iter().map(|z| (z - max).exp()).sum();
                let log_sum = max + sum.ln();
                for (k, (g, z)) in grad.iter_mut().zip(logits).enumerate() {
                    *g = (z - log_sum).exp() - if k == label { 1.0 } else { 0.0 };
                }
                log_sum - logits[label]
            }
            LossFn::Mse => {
                let n = logits.len() as f32;
                let mut loss = 0.0;
                for (k, (g, z)) in grad.iter_mut().zip(logits).enumerate() {
                    let diff = z - if k == label { 1.0 } else { 0.0 };
                    loss += diff * diff;
                    *g = 2.0 * diff / n;
                }
                loss / n
            }
        }
    }

    pub fn loss(&self, logits: &[f32], label: usize) -> f32 {
        let mut grad = vec![0.0; logits.len()];
        self.loss_and_grad(logits, label, &mut grad)
    }
}

/// Pick the loss function of an experiment.
///
/// Only the built-in losses are available: a loss definition file is rejected.
pub fn get_loss(path: Option<&Path>, name: Option<&str>) -> Result<LossFn, ModelError> {
    if let Some(path) = path {
        return Err(ModelError::LossFile(path.to_path_buf()));
    }
    match name {
        None | Some("CrossEntropyLoss") => Ok(LossFn::CrossEntropy),
        Some("MSELoss") => Ok(LossFn::Mse),
        Some(other) => Err(ModelError::UnknownLoss(other.to_string())),
    }
}
