//! Local optimizers over flat parameter vectors.

use crate::config::{OptimArgs, Optimizer};

const ADAM_BETA_1: f32 = 0.9;
const ADAM_BETA_2: f32 = 0.999;
const ADAM_EPS: f32 = 1e-8;

#[derive(Debug, Clone)]
pub enum LocalOptimizer {
    Sgd {
        lr: f32,
        momentum: f32,
        velocity: Vec<f32>,
    },
    Adam {
        lr: f32,
        step: i32,
        m: Vec<f32>,
        v: Vec<f32>,
    },
}

impl LocalOptimizer {
    /// A fresh optimizer for `len` parameters.
    pub fn new(kind: Optimizer, args: OptimArgs, len: usize) -> Self {
        match kind {
            Optimizer::Sgd => LocalOptimizer::Sgd {
                lr: args.lr,
                momentum: args.momentum,
                velocity: vec![0.0; len],
            },
            Optimizer::Adam => LocalOptimizer::Adam {
                lr: args.lr,
                step: 0,
                m: vec![0.0; len],
                v: vec![0.0; len],
            },
        }
    }

    pub fn lr(&self) -> f32 {
        match self {
            LocalOptimizer::Sgd { lr, .. } | LocalOptimizer::Adam { lr, .. } => *lr,
        }
    }

    /// Apply one update with the given gradient.
    pub fn step(&mut self, parameters: &mut [f32], grad: &[f32]) {
        match self {
            LocalOptimizer::Sgd {
                lr,
                momentum,
                velocity,
            } => {
                for ((p, g), b) in parameters.iter_mut().zip(grad).zip(velocity.iter_mut()) {
                    if *momentum != 0.0 {
                        *b = *momentum * *b + g;
                        *p -= *lr * *b;
                    } else {
                        *p -= *lr * g;
                    }
                }
            }
            LocalOptimizer::Adam { lr, step, m, v } => {
                *step += 1;
                let correction_1 = 1.0 - ADAM_BETA_1.powi(*step);
                let correction_2 = 1.0 - ADAM_BETA_2.powi(*step);
                for (((p, g), m), v) in parameters
                    .iter_mut()
                    .zip(grad)
                    .zip(m.iter_mut())
                    .zip(v.iter_mut())
                {
                    *m = ADAM_BETA_1 * *m + (1.0 - ADAM_BETA_1) * g;
                    *v = ADAM_BETA_2 * *v + (1.0 - ADAM_BETA_2) * g * g;
                    let m_hat = *m / correction_1;
                    let v_hat = *v / correction_2;
                    *p -= *lr * m_hat / (v_hat.sqrt() + ADAM_EPS);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sgd() {
        let args = OptimArgs {
            lr: 0.1,
            momentum: 0.0,
        };
        let mut optimizer = LocalOptimizer::new(Optimizer::Sgd, args, 2);
        let mut parameters = [1.0, -1.0];
        optimizer.step(&mut parameters, &[1.0, -2.0]);
        assert!((parameters[0] - 0.9).abs() < 1e-6);
        assert!((parameters[1] + 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_sgd_momentum() {
        let args = OptimArgs {
            lr: 1.0,
            momentum: 0.5,
        };
        let mut optimizer = LocalOptimizer::new(Optimizer::Sgd, args, 1);
        let mut parameters = [0.0];
        optimizer.step(&mut parameters, &[1.0]);
        optimizer.step(&mut parameters, &[1.0]);
        // velocity 1 then 1.5
        assert!((parameters[0] + 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_adam_first_step() {
        let args = OptimArgs {
            lr: 0.01,
            momentum: 0.0,
        };
        let mut optimizer = LocalOptimizer::new(Optimizer::Adam, args, 2);
        let mut parameters = [0.0, 0.0];
        optimizer.step(&mut parameters, &[3.0, -0.5]);
        // the first bias-corrected step has size lr whatever the gradient scale
        assert!((parameters[0] + 0.01).abs() < 1e-5);
        assert!((parameters[1] - 0.01).abs() < 1e-5);
    }
}
