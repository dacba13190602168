use crate::{
    data::Dataset,
    model::{class_index, LossFn, Metric, Model, ModelError},
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub loss: f32,
    pub metric: f32,
    pub num_samples: usize,
}

/// Mean loss and metric of `model` over every image of `dataset`.
pub fn evaluate(
    model: &dyn Model,
    loss: LossFn,
    metric: Metric,
    dataset: &Dataset,
) -> Result<Evaluation, ModelError> {
    model.check_dataset(dataset)?;
    let mut total_loss = 0.0f64;
    let mut total_metric = 0.0f64;
    for (index, &label) in dataset.labels().iter().enumerate() {
        let label = class_index(label, model.num_classes())?;
        let logits = model.forward(dataset.input(index))?;
        total_loss += f64::from(loss.loss(&logits, label));
        total_metric += f64::from(metric.score(&logits, label));
    }
    let count = dataset.len().max(1) as f64;
    Ok(Evaluation {
        loss: (total_loss / count) as f32,
        metric: (total_metric / count) as f32,
        num_samples: dataset.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::{tests::toy_dataset, ImageShape},
        model::get_model,
    };

    #[test]
    fn test_evaluate() {
        let mut model = get_model("Linear", ImageShape::new(1, 2, 2), 2, 1).unwrap();
        // always predicts class 1
        let mut parameters = vec![0.0; model.parameters().len()];
        *parameters.last_mut().unwrap() = 1.0;
        model.set_parameters(&parameters).unwrap();

        let dataset = toy_dataset(4, 2);
        let evaluation =
            evaluate(model.as_ref(), LossFn::CrossEntropy, Metric::Accuracy, &dataset).unwrap();
        assert_eq!(evaluation.metric, 50.0);
        assert_eq!(evaluation.num_samples, 4);
        let expected = (LossFn::CrossEntropy.loss(&[0.0, 1.0], 0)
            + LossFn::CrossEntropy.loss(&[0.0, 1.0], 1))
            / 2.0;
        assert!((evaluation.loss - expected).abs() < 1e-5);
    }

    #[test]
    fn test_empty_dataset() {
        let model = get_model("CNN", ImageShape::new(1, 2, 2), 2, 1).unwrap();
        let evaluation = evaluate(
            model.as_ref(),
            LossFn::CrossEntropy,
            Metric::Accuracy,
            &Dataset::empty(ImageShape::new(1, 2, 2)),
        )
        .unwrap();
        assert_eq!(evaluation.num_samples, 0);
        assert_eq!(evaluation.metric, 0.0);
    }

    #[test]
    fn test_rejects_images_of_another_shape() {
        let model = get_model("CNN", ImageShape::square(4, 4), 2, 1).unwrap();
        let dataset = Dataset::new(ImageShape::square(3, 4), vec![0.5; 48], vec![1]).unwrap();
        let result = evaluate(model.as_ref(), LossFn::CrossEntropy, Metric::Accuracy, &dataset);
        assert!(matches!(result, Err(ModelError::InputShape { .. })));
    }
}
