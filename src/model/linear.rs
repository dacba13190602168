use rand::Rng;

use super::{uniform_init, Model, ModelError};
use crate::data::ImageShape;

#[derive(Debug, Clone)]
/// Softmax regression on the raw pixels.
///
/// Parameters: the `classes x inputs` weight matrix followed by the biases.
pub struct Linear {
    shape: ImageShape,
    inputs: usize,
    classes: usize,
    parameters: Vec<f32>,
}

impl Linear {
    pub fn new<R: Rng>(shape: ImageShape, classes: usize, rng: &mut R) -> Self {
        let inputs = shape.len();
        let mut parameters = vec![0.0; classes * inputs + classes];
        uniform_init(&mut parameters, inputs, rng);
        Self {
            shape,
            inputs,
            classes,
            parameters,
        }
    }

    fn split(&self) -> (&[f32], &[f32]) {
        self.parameters.split_at(self.classes * self.inputs)
    }
}

impl Model for Linear {
    fn name(&self) -> &'static str {
        "Linear"
    }

    fn num_classes(&self) -> usize {
        self.classes
    }

    fn input_shape(&self) -> ImageShape {
        self.shape
    }

    fn parameters(&self) -> &[f32] {
        &self.parameters
    }

    fn parameters_mut(&mut self) -> &mut [f32] {
        &mut self.parameters
    }

    fn forward(&self, input: &[f32]) -> Result<Vec<f32>, ModelError> {
        self.check_input(input)?;
        let (weights, biases) = self.split();
        Ok(weights
            .chunks_exact(self.inputs)
            .zip(biases)
            .map(|(row, bias)| bias + dot(row, input))
            .collect())
    }

    fn backward(
        &self,
        input: &[f32],
        grad_logits: &[f32],
        grad: &mut [f32],
    ) -> Result<(), ModelError> {
        self.check_input(input)?;
        let (grad_weights, grad_biases) = grad.split_at_mut(self.classes * self.inputs);
        for ((row, bias), &g) in grad_weights
            .chunks_exact_mut(self.inputs)
            .zip(grad_biases.iter_mut())
            .zip(grad_logits)
        {
            *bias += g;
            for (w, x) in row.iter_mut().zip(input) {
                *w += g * x;
            }
        }
        Ok(())
    }

    fn boxed_clone(&self) -> Box<dyn Model> {
        Box::new(self.clone())
    }
}

pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
