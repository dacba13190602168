use std::time::Instant;

use super::{
    recorder::{Recorder, RoundRecord},
    RunError,
};
use crate::{
    config::Config,
    data::Dataset,
    federation::{coordinator::Aggregator, evaluate, LocalUpdate, ServerAggregator},
    model::{LossFn, Metric, Model},
};

/// The server side of a run: the global model, its optimizer and its outputs.
pub struct GlobalModel {
    model: Box<dyn Model>,
    aggregator: ServerAggregator,
    pending: Vec<LocalUpdate>,
    test_dataset: Dataset,
    loss: LossFn,
    metric: Metric,
    validation: bool,
    recorder: Recorder,
    round_start: Instant,
}

impl GlobalModel {
    pub fn new(
        model: Box<dyn Model>,
        config: &Config,
        test_dataset: Dataset,
        loss: LossFn,
        metric: Metric,
        recorder: Recorder,
    ) -> Self {
        let aggregator = ServerAggregator::new(config, model.parameters().len());
        info!(
            "global {} model with {} parameters, aggregated with {}",
            model.name(),
            model.parameters().len(),
            aggregator.algorithm()
        );
        Self {
            model,
            aggregator,
            pending: Vec::new(),
            test_dataset,
            loss,
            metric,
            validation: config.validation,
            recorder,
            round_start: Instant::now(),
        }
    }

    pub fn model(&self) -> &dyn Model {
        self.model.as_ref()
    }

    pub fn into_model(self) -> Box<dyn Model> {
        self.model
    }
}

impl Aggregator for GlobalModel {
    type Error = RunError;

    fn add_local_result(&mut self, update: LocalUpdate) -> Result<(), Self::Error> {
        self.pending.push(update);
        Ok(())
    }

    fn aggregate(&mut self, round: u32) -> Result<Vec<f32>, Self::Error> {
        let updates = std::mem::take(&mut self.pending);
        let mut parameters = self.model.parameters().to_vec();
        self.aggregator.aggregate(&mut parameters, &updates)?;
        self.model.set_parameters(&parameters)?;
        let train_time = self.round_start.elapsed().as_secs_f64();

        let test_start = Instant::now();
        let evaluation = if self.validation && !self.test_dataset.is_empty() {
            Some(evaluate(
                self.model.as_ref(),
                self.loss,
                self.metric,
                &self.test_dataset,
            )?)
        } else {
            None
        };
        let train_loss = if updates.is_empty() {
            0.0
        } else {
            updates.iter().map(|u| u.loss).sum::<f32>() / updates.len() as f32
        };
        self.recorder.record(&RoundRecord {
            round,
            train_time,
            test_time: test_start.elapsed().as_secs_f64(),
            train_loss,
            test_loss: evaluation.map(|e| e.loss),
            test_metric: evaluation.map(|e| e.metric),
            num_updates: updates.len(),
        })?;
        self.recorder.checkpoint(self.model.as_ref(), round)?;

        self.round_start = Instant::now();
        Ok(parameters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        common::ClientId,
        data::{tests::toy_dataset, ImageShape},
        federation::FederationError,
        model::get_model,
    };

    fn global() -> GlobalModel {
        let model = get_model("Linear", ImageShape::new(1, 2, 2), 2, 1).unwrap();
        GlobalModel::new(
            model,
            &Config::default(),
            toy_dataset(4, 2),
            LossFn::CrossEntropy,
            Metric::Accuracy,
            Recorder::disabled(),
        )
    }

    #[test]
    fn test_aggregate_updates_the_model() {
        let mut global = global();
        let len = global.model().parameters().len();
        for (client, value) in [(0, 1.0), (1, 3.0)] {
            global
                .add_local_result(LocalUpdate {
                    client: ClientId(client),
                    parameters: vec![value; len],
                    num_samples: 1,
                    loss: 0.5,
                })
                .unwrap();
        }
        let parameters = global.aggregate(0).unwrap();
        assert_eq!(parameters, vec![2.0; len]);
        assert_eq!(global.model().parameters(), &parameters[..]);

        // pending updates were consumed
        assert!(matches!(
            global.aggregate(1),
            Err(RunError::Federation(FederationError::NoUpdates))
        ));
    }
}
