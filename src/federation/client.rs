//! Local training of one client.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::{optim::LocalOptimizer, FederationError};
use crate::{
    common::ClientId,
    config::{ClientAlgorithm, Config, FedArgs},
    data::Dataset,
    model::{class_index, LossFn, Model},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The result of one round of local training.
pub struct LocalUpdate {
    pub client: ClientId,
    pub parameters: Vec<f32>,
    /// Number of local samples, used to weight the update.
    pub num_samples: usize,
    /// Mean training loss over the processed batches.
    pub loss: f32,
}

#[derive(Debug, Clone)]
/// Trains a copy of the global model on the data of one client.
pub struct LocalTrainer {
    algorithm: ClientAlgorithm,
    args: FedArgs,
    batch_size: usize,
    shuffle: bool,
    loss: LossFn,
    seed: u64,
}

impl LocalTrainer {
    pub fn new(config: &Config, loss: LossFn, seed: u64) -> Self {
        Self {
            algorithm: config.fed.clientname,
            args: config.fed.args.clone(),
            batch_size: config.train_data_batch_size,
            shuffle: config.train_data_shuffle,
            loss,
            seed,
        }
    }

    fn clips(&self) -> bool {
        self.args.clip_grad || self.args.use_dp
    }

    /// Train `model`, which holds the global parameters of `round`, on `dataset`.
    pub fn train(
        &self,
        client: ClientId,
        model: &mut dyn Model,
        dataset: &Dataset,
        round: u32,
    ) -> Result<LocalUpdate, FederationError> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed ^ (u64::from(round) << 32 | u64::from(client.0)));
        let mut optimizer =
            LocalOptimizer::new(self.args.optim, self.args.optim_args, model.parameters().len());

        model.check_dataset(dataset)?;
        if dataset.is_empty() {
            warn!("client {} has no training data, skipping local training", client);
            return Ok(LocalUpdate {
                client,
                parameters: model.parameters().to_vec(),
                num_samples: 0,
                loss: 0.0,
            });
        }

        let batches: Vec<Vec<usize>> = match self.algorithm {
            ClientAlgorithm::ClientOptim => (0..self.args.num_local_epochs)
                .flat_map(|_| dataset.batches(self.batch_size, self.shuffle, &mut rng))
                .collect(),
            ClientAlgorithm::ClientStepOptim => {
                // cycle through the data until enough steps are collected
                let steps = self.args.num_local_steps as usize;
                let mut batches = Vec::with_capacity(steps);
                while batches.len() < steps {
                    batches.extend(dataset.batches(self.batch_size, self.shuffle, &mut rng));
                }
                batches.truncate(steps);
                batches
            }
        };

        let mut grad = vec![0.0; model.parameters().len()];
        let mut grad_logits = vec![0.0; model.num_classes()];
        let mut total_loss = 0.0;
        for batch in &batches {
            grad.iter_mut().for_each(|g| *g = 0.0);
            let mut batch_loss = 0.0;
            for &index in batch {
                let input = dataset.input(index);
                let label = class_index(dataset.labels()[index], model.num_classes())?;
                let logits = model.forward(input)?;
                batch_loss += self.loss.loss_and_grad(&logits, label, &mut grad_logits);
                model.backward(input, &grad_logits, &mut grad)?;
            }
            let scale = 1.0 / batch.len() as f32;
            grad.iter_mut().for_each(|g| *g *= scale);
            if self.clips() {
                clip_grad_norm(&mut grad, self.args.clip_value, self.args.clip_norm);
            }
            optimizer.step(model.parameters_mut(), &grad);
            total_loss += batch_loss * scale;
        }

        if self.args.use_dp {
            let scale = 2.0 * self.args.clip_value * optimizer.lr() / self.args.epsilon;
            add_laplace_noise(model.parameters_mut(), scale, &mut rng);
        }

        let loss = total_loss / batches.len() as f32;
        debug!(
            "client {} round {}: {} steps, loss {:.4}",
            client,
            round,
            batches.len(),
            loss
        );
        Ok(LocalUpdate {
            client,
            parameters: model.parameters().to_vec(),
            num_samples: dataset.len(),
            loss,
        })
    }
}

/// Scale `grad` so that its `p`-norm is at most `max_norm`.
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(grad: &mut [f32], max_norm: f32, p: f32) -> f32 {
    let norm = if p.is_infinite() {
        grad.iter().fold(0.0f32, |max, g| max.max(g.abs()))
    } else {
        grad.iter().map(|g| g.abs().powf(p)).sum::<f32>().powf(1.0 / p)
    };
    let coefficient = max_norm / (norm + 1e-6);
    if coefficient < 1.0 {
        grad.iter_mut().for_each(|g| *g *= coefficient);
    }
    norm
}

/// Perturb every value with Laplace noise of the given scale.
pub fn add_laplace_noise<R: Rng>(values: &mut [f32], scale: f32, rng: &mut R) {
    for value in values.iter_mut() {
        // inverse CDF of Laplace(0, scale)
        let u: f32 = rng.gen_range(-0.5..0.5);
        *value -= scale * u.signum() * (1.0 - 2.0 * u.abs()).max(f32::MIN_POSITIVE).ln();
    }
}
