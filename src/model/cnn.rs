use rand::Rng;

use super::{linear::dot, uniform_init, Model, ModelError};
use crate::data::ImageShape;

pub const DEFAULT_FILTERS: usize = 16;

const KERNEL: usize = 3;

#[derive(Debug, Clone)]
/// A small convolutional network: one 3x3 convolution with zero padding, ReLU, global
/// average pooling and a linear head.
///
/// Parameters: convolution kernels (`filters x channels x 3 x 3`), convolution biases, head
/// weights (`classes x filters`), head biases.
pub struct Cnn {
    shape: ImageShape,
    filters: usize,
    classes: usize,
    parameters: Vec<f32>,
}

impl Cnn {
    pub fn new<R: Rng>(shape: ImageShape, classes: usize, filters: usize, rng: &mut R) -> Self {
        let kernels = filters * shape.channels * KERNEL * KERNEL;
        let conv = kernels + filters;
        let mut parameters = vec![0.0; conv + classes * filters + classes];
        let (conv_layer, head) = parameters.split_at_mut(conv);
        uniform_init(conv_layer, shape.channels * KERNEL * KERNEL, rng);
        uniform_init(head, filters, rng);
        Self {
            shape,
            filters,
            classes,
            parameters,
        }
    }

    fn kernel_len(&self) -> usize {
        self.shape.channels * KERNEL * KERNEL
    }

    /// Offsets of the convolution biases, head weights and head biases.
    fn offsets(&self) -> (usize, usize, usize) {
        let conv_b = self.filters * self.kernel_len();
        let head_w = conv_b + self.filters;
        let head_b = head_w + self.classes * self.filters;
        (conv_b, head_w, head_b)
    }

    /// Visit every in-bounds kernel tap of output pixel `(y, x)`, with the kernel index and
    /// the input index.
    fn for_each_tap(&self, y: usize, x: usize, mut f: impl FnMut(usize, usize)) {
        let ImageShape {
            channels,
            height,
            width,
        } = self.shape;
        for c in 0..channels {
            for ky in 0..KERNEL {
                let Some(iy) = (y + ky).checked_sub(1).filter(|iy| *iy < height) else {
                    continue;
                };
                for kx in 0..KERNEL {
                    let Some(ix) = (x + kx).checked_sub(1).filter(|ix| *ix < width) else {
                        continue;
                    };
                    f(
                        (c * KERNEL + ky) * KERNEL + kx,
                        (c * height + iy) * width + ix,
                    );
                }
            }
        }
    }

    /// The pre-activation feature maps and the pooled activations.
    fn features(&self, input: &[f32]) -> (Vec<f32>, Vec<f32>) {
        let (conv_b, _, _) = self.offsets();
        let area = self.shape.height * self.shape.width;
        let mut maps = vec![0.0; self.filters * area];
        let mut pooled = vec![0.0; self.filters];
        for f in 0..self.filters {
            let kernel = &self.parameters[f * self.kernel_len()..(f + 1) * self.kernel_len()];
            let bias = self.parameters[conv_b + f];
            let mut sum = 0.0;
            for y in 0..self.shape.height {
                for x in 0..self.shape.width {
                    let mut value = bias;
                    self.for_each_tap(y, x, |k, i| value += kernel[k] * input[i]);
                    maps[f * area + y * self.shape.width + x] = value;
                    sum += value.max(0.0);
                }
            }
            pooled[f] = sum / area as f32;
        }
        (maps, pooled)
    }
}

impl Model for Cnn {
    fn name(&self) -> &'static str {
        "CNN"
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
        let (_, head_w, head_b) = self.offsets();
        let (_, pooled) = self.features(input);
        Ok(self.parameters[head_w..head_b]
            .chunks_exact(self.filters)
            .zip(&self.parameters[head_b..])
            .map(|(row, bias)| bias + dot(row, &pooled))
            .collect())
    }

    fn backward(
        &self,
        input: &[f32],
        grad_logits: &[f32],
        grad: &mut [f32],
    ) -> Result<(), ModelError> {
        self.check_input(input)?;
        let (conv_b, head_w, head_b) = self.offsets();
        let (maps, pooled) = self.features(input);
        let area = self.shape.height * self.shape.width;

        let mut grad_pooled = vec![0.0; self.filters];
        for (k, &g) in grad_logits.iter().enumerate() {
            grad[head_b + k] += g;
            for f in 0..self.filters {
                let w = head_w + k * self.filters + f;
                grad[w] += g * pooled[f];
                grad_pooled[f] += g * self.parameters[w];
            }
        }

        let (grad_kernels, grad_rest) = grad.split_at_mut(conv_b);
        for (f, g) in grad_pooled.into_iter().enumerate() {
            let g = g / area as f32;
            let grad_kernel =
                &mut grad_kernels[f * self.kernel_len()..(f + 1) * self.kernel_len()];
            for y in 0..self.shape.height {
                for x in 0..self.shape.width {
                    // relu
                    if maps[f * area + y * self.shape.width + x] <= 0.0 {
                        continue;
                    }
                    grad_rest[f] += g;
                    self.for_each_tap(y, x, |k, i| grad_kernel[k] += g * input[i]);
                }
            }
        }
        Ok(())
    }

    fn boxed_clone(&self) -> Box<dyn Model> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;
    use crate::model::tests::check_gradient;

    #[test]
    fn test_parameter_count() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let model = Cnn::new(ImageShape::square(3, 8), 10, 4, &mut rng);
        assert_eq!(model.parameters().len(), 4 * 27 + 4 + 10 * 4 + 10);
    }

    #[test]
    fn test_constant_kernel() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut model = Cnn::new(ImageShape::square(1, 2), 1, 1, &mut rng);
        // all-ones kernel, zero bias, identity head
        let mut parameters = vec![1.0; 9];
        parameters.extend([0.0, 1.0, 0.0]);
        model.set_parameters(&parameters).unwrap();
        // with padding every output pixel sees the whole 2x2 image
        let logits = model.forward(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert!((logits[0] - 10.0).abs() < 1e-5);
    }

    #[test]
    fn test_gradient() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut model = Cnn::new(ImageShape::new(2, 3, 4), 3, 3, &mut rng);
        let input: Vec<f32> = (0..24).map(|i| ((i * 7) % 11) as f32 / 11.0).collect();
        check_gradient(&mut model, &input, 0);
    }
}
