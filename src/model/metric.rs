//! Evaluation metrics.

use derive_more::Display;

use super::ModelError;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Metric {
    /// Percentage of samples whose largest logit is the label.
    #[display(fmt = "accuracy")]
    Accuracy,
}

impl Default for Metric {
    fn default() -> Self {
        Metric::Accuracy
    }
}

impl Metric {
    /// Score of one sample, to be averaged over a dataset.
    pub fn score(&self, logits: &[f32], label: usize) -> f32 {
        match self {
            Metric::Accuracy => {
                if argmax(logits) == Some(label) {
                    100.0
                } else {
                    0.0
                }
            }
        }
    }
}

fn argmax(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (index, &value)| match best {
            Some((_, max)) if max >= value => best,
            _ => Some((index, value)),
        })
        .map(|(index, _)| index)
}

pub fn get_metric(name: Option<&str>) -> Result<Metric, ModelError> {
    match name {
        None => Ok(Metric::Accuracy),
        Some(name) if name.eq_ignore_ascii_case("accuracy") => Ok(Metric::Accuracy),
        Some(other) => Err(ModelError::UnknownMetric(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accuracy() {
        assert_eq!(Metric::Accuracy.score(&[0.1, 0.7, 0.2], 1), 100.0);
        assert_eq!(Metric::Accuracy.score(&[0.1, 0.7, 0.2], 2), 0.0);
        // ties go to the first class
        assert_eq!(Metric::Accuracy.score(&[0.5, 0.5], 0), 100.0);
    }

    #[test]
    fn test_get_metric() {
        assert_eq!(get_metric(None).unwrap(), Metric::Accuracy);
        assert_eq!(get_metric(Some("Accuracy")).unwrap(), Metric::Accuracy);
        assert!(get_metric(Some("f1")).is_err());
    }
}
