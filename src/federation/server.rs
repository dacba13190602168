//! Aggregation of the client updates into the global model.

use super::{FederationError, LocalUpdate};
use crate::config::{Config, ServerAlgorithm};

#[derive(Debug, Clone)]
/// Server-side optimizer state.
///
/// All algorithms start from the weighted average of the client parameters, weighted by
/// the number of samples of every client. `ServerFedAvg` takes the average as the new
/// global model; the others treat `average - global` as a pseudo-gradient.
pub struct ServerAggregator {
    algorithm: ServerAlgorithm,
    lr: f32,
    adapt_param: f32,
    beta_1: f32,
    beta_2: f32,
    momentum: Vec<f32>,
    variance: Vec<f32>,
}

impl ServerAggregator {
    pub fn new(config: &Config, len: usize) -> Self {
        let args = &config.fed.args;
        Self {
            algorithm: config.fed.servername,
            lr: args.server_learning_rate,
            adapt_param: args.server_adapt_param,
            beta_1: args.server_momentum_param_1,
            beta_2: args.server_momentum_param_2,
            momentum: vec![0.0; len],
            variance: vec![0.0; len],
        }
    }

    pub fn algorithm(&self) -> ServerAlgorithm {
        self.algorithm
    }

    /// Update `global` in place from the round's updates.
    pub fn aggregate(
        &mut self,
        global: &mut [f32],
        updates: &[LocalUpdate],
    ) -> Result<(), FederationError> {
        let average = weighted_average(updates, global.len())?;
        let (b1, b2) = (self.beta_1, self.beta_2);
        for (i, (g, avg)) in global.iter_mut().zip(average).enumerate() {
            let delta = avg - *g;
            let m = &mut self.momentum[i];
            let v = &mut self.variance[i];
            match self.algorithm {
                ServerAlgorithm::ServerFedAvg => {
                    *g = avg;
                    continue;
                }
                ServerAlgorithm::ServerFedAvgMomentum => {
                    *m = b1 * *m + delta;
                    *g += *m;
                    continue;
                }
                ServerAlgorithm::ServerFedAdagrad => {
                    *m = b1 * *m + (1.0 - b1) * delta;
                    *v += delta * delta;
                }
                ServerAlgorithm::ServerFedAdam => {
                    *m = b1 * *m + (1.0 - b1) * delta;
                    *v = b2 * *v + (1.0 - b2) * delta * delta;
                }
                ServerAlgorithm::ServerFedYogi => {
                    let square = delta * delta;
                    *m = b1 * *m + (1.0 - b1) * delta;
                    *v -= (1.0 - b2) * square * sign(*v - square);
                }
            }
            *g += self.lr * *m / (v.sqrt() + self.adapt_param);
        }
        Ok(())
    }
}

fn sign(value: f32) -> f32 {
    if value > 0.0 {
        1.0
    } else if value < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Average of the update parameters, weighted by the client sample counts.
///
/// When no client has any sample every update gets the same weight.
pub fn weighted_average(updates: &[LocalUpdate], len: usize) -> Result<Vec<f32>, FederationError> {
    if updates.is_empty() {
        return Err(FederationError::NoUpdates);
    }
    if let Some(update) = updates.iter().find(|u| u.parameters.len() != len) {
        return Err(FederationError::ParameterCount {
            client: update.client,
            expected: len,
            actual: update.parameters.len(),
        });
    }

    let total: usize = updates.iter().map(|u| u.num_samples).sum();
    let weights: Vec<f32> = if total == 0 {
        vec![1.0 / updates.len() as f32; updates.len()]
    } else {
        updates
            .iter()
            .map(|u| u.num_samples as f32 / total as f32)
            .collect()
    };

    let mut average = vec![0.0; len];
    for (update, weight) in updates.iter().zip(weights) {
        for (a, p) in average.iter_mut().zip(&update.parameters) {
            *a += weight * p;
        }
    }
    Ok(average)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ClientId;

    fn update(client: u32, parameters: Vec<f32>, num_samples: usize) -> LocalUpdate {
        LocalUpdate {
            client: ClientId(client),
            parameters,
            num_samples,
            loss: 0.0,
        }
    }

    fn aggregator(algorithm: ServerAlgorithm) -> ServerAggregator {
        let mut config = Config::default();
        config.fed.servername = algorithm;
        config.fed.args.server_learning_rate = 0.1;
        ServerAggregator::new(&config, 2)
    }

    #[test]
    fn test_fedavg_of_identical_updates_is_identity() {
        let mut aggregator = aggregator(ServerAlgorithm::ServerFedAvg);
        let mut global = vec![0.0, 0.0];
        let updates = vec![update(0, vec![1.5, -2.0], 3), update(1, vec![1.5, -2.0], 7)];
        aggregator.aggregate(&mut global, &updates).unwrap();
        assert!((global[0] - 1.5).abs() < 1e-6);
        assert!((global[1] + 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_fedavg_weights_follow_sample_counts() {
        let mut aggregator = aggregator(ServerAlgorithm::ServerFedAvg);
        let mut global = vec![0.0, 0.0];
        let updates = vec![update(0, vec![0.0, 4.0], 1), update(1, vec![4.0, 0.0], 3)];
        aggregator.aggregate(&mut global, &updates).unwrap();
        assert_eq!(global, vec![3.0, 1.0]);
    }

    #[test]
    fn test_no_samples_means_uniform_weights() {
        let average =
            weighted_average(&[update(0, vec![0.0], 0), update(1, vec![2.0], 0)], 1).unwrap();
        assert_eq!(average, vec![1.0]);
    }

    #[test]
    fn test_invalid_updates() {
        let mut aggregator = aggregator(ServerAlgorithm::ServerFedAdam);
        let mut global = vec![0.0, 0.0];
        assert!(matches!(
            aggregator.aggregate(&mut global, &[]),
            Err(FederationError::NoUpdates)
        ));
        assert!(matches!(
            aggregator.aggregate(&mut global, &[update(4, vec![1.0], 1)]),
            Err(FederationError::ParameterCount { expected: 2, actual: 1, .. })
        ));
    }

    #[test]
    fn test_momentum() {
        let mut aggregator = aggregator(ServerAlgorithm::ServerFedAvgMomentum);
        let mut global = vec![0.0, 0.0];
        aggregator
            .aggregate(&mut global, &[update(0, vec![1.0, 1.0], 1)])
            .unwrap();
        assert_eq!(global, vec![1.0, 1.0]);
        // delta is 0 but the momentum keeps moving the model
        aggregator
            .aggregate(&mut global, &[update(0, vec![1.0, 1.0], 1)])
            .unwrap();
        assert!((global[0] - 1.9).abs() < 1e-6);
    }

    #[test]
    fn test_adaptive_servers_move_towards_the_average() {
        for algorithm in [
            ServerAlgorithm::ServerFedAdagrad,
            ServerAlgorithm::ServerFedAdam,
            ServerAlgorithm::ServerFedYogi,
        ] {
            let mut aggregator = aggregator(algorithm);
            let mut global = vec![0.0, 0.0];
            aggregator
                .aggregate(&mut global, &[update(0, vec![1.0, -1.0], 1)])
                .unwrap();
            assert!(global[0] > 0.0 && global[1] < 0.0, "{}: {:?}", algorithm, global);
            assert!(global[0] <= 1.0, "{}: {:?}", algorithm, global);
        }
    }

    #[test]
    fn test_adam_step() {
        let mut aggregator = aggregator(ServerAlgorithm::ServerFedAdam);
        let mut global = vec![0.0, 0.0];
        aggregator
            .aggregate(&mut global, &[update(0, vec![1.0, 0.0], 1)])
            .unwrap();
        // m = 0.1, v = 0.01, step = 0.1 * 0.1 / (0.1 + 0.001)
        assert!((global[0] - 0.01 / 0.101).abs() < 1e-6);
        assert_eq!(global[1], 0.0);
    }
}
