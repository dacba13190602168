use rand::Rng;

use super::{linear::dot, uniform_init, Model, ModelError};
use crate::data::ImageShape;

pub const DEFAULT_HIDDEN: usize = 64;

#[derive(Debug, Clone)]
/// A perceptron with one hidden ReLU layer.
///
/// Parameters: hidden weights, hidden biases, output weights, output biases.
pub struct Mlp {
    shape: ImageShape,
    inputs: usize,
    hidden: usize,
    classes: usize,
    parameters: Vec<f32>,
}

impl Mlp {
    pub fn new<R: Rng>(shape: ImageShape, classes: usize, hidden: usize, rng: &mut R) -> Self {
        let inputs = shape.len();
        let first = hidden * inputs + hidden;
        let mut parameters = vec![0.0; first + classes * hidden + classes];
        let (hidden_layer, output_layer) = parameters.split_at_mut(first);
        uniform_init(hidden_layer, inputs, rng);
        uniform_init(output_layer, hidden, rng);
        Self {
            shape,
            inputs,
            hidden,
            classes,
            parameters,
        }
    }

    /// Offsets of the hidden biases, output weights and output biases.
    fn offsets(&self) -> (usize, usize, usize) {
        let b1 = self.hidden * self.inputs;
        let w2 = b1 + self.hidden;
        let b2 = w2 + self.classes * self.hidden;
        (b1, w2, b2)
    }

    fn hidden_activations(&self, input: &[f32]) -> Vec<f32> {
        let (b1, w2, _) = self.offsets();
        self.parameters[..b1]
            .chunks_exact(self.inputs)
            .zip(&self.parameters[b1..w2])
            .map(|(row, bias)| (bias + dot(row, input)).max(0.0))
            .collect()
    }
}

impl Model for Mlp {
    fn name(&self) -> &'static str {
        "MLP"
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
        let (_, w2, b2) = self.offsets();
        let hidden = self.hidden_activations(input);
        Ok(self.parameters[w2..b2]
            .chunks_exact(self.hidden)
            .zip(&self.parameters[b2..])
            .map(|(row, bias)| bias + dot(row, &hidden))
            .collect())
    }

    fn backward(
        &self,
        input: &[f32],
        grad_logits: &[f32],
        grad: &mut [f32],
    ) -> Result<(), ModelError> {
        self.check_input(input)?;
        let (b1, w2, b2) = self.offsets();
        let hidden = self.hidden_activations(input);

        let mut grad_hidden = vec![0.0; self.hidden];
        {
            let (grad_w2, grad_b2) = grad[w2..].split_at_mut(b2 - w2);
            for (k, &g) in grad_logits.iter().enumerate() {
                grad_b2[k] += g;
                let row = &self.parameters[w2 + k * self.hidden..w2 + (k + 1) * self.hidden];
                let grad_row = &mut grad_w2[k * self.hidden..(k + 1) * self.hidden];
                for j in 0..self.hidden {
                    grad_row[j] += g * hidden[j];
                    grad_hidden[j] += g * row[j];
                }
            }
        }

        let (grad_w1, rest) = grad.split_at_mut(b1);
        let grad_b1 = &mut rest[..self.hidden];
        for (j, g) in grad_hidden.into_iter().enumerate() {
            // relu
            if hidden[j] <= 0.0 {
                continue;
            }
            grad_b1[j] += g;
            for (w, x) in grad_w1[j * self.inputs..(j + 1) * self.inputs]
                .iter_mut()
                .zip(input)
            {
                *w += g * x;
            }
        }
        Ok(())
    }

    fn boxed_clone(&self) -> Box<dyn Model> {
        Box::new(self.clone())
    }
}
