//! Every client and the server in one process.

use super::{GlobalModel, Recorder, RunError};
use crate::{
    common::ClientId,
    config::Config,
    data::Dataset,
    federation::{coordinator::Aggregator, LocalTrainer},
    model::{LossFn, Metric, Model},
};

/// Train `config.num_epochs` rounds, training the clients one after the other.
///
/// Client `i` owns `train_datasets[i]`. Returns the final global model.
pub fn run_serial(
    config: &Config,
    model: Box<dyn Model>,
    loss: LossFn,
    metric: Metric,
    train_datasets: Vec<Dataset>,
    test_dataset: Dataset,
    seed: u64,
) -> Result<Box<dyn Model>, RunError> {
    info!(
        "running {} rounds on {} with {} clients in a single process",
        config.num_epochs,
        config.dataset,
        train_datasets.len()
    );
    let trainer = LocalTrainer::new(config, loss, seed);
    let recorder = Recorder::new(config)?;
    let mut global = GlobalModel::new(model, config, test_dataset, loss, metric, recorder);

    for round in 0..config.num_epochs {
        info!("starting round {}", round);
        for (index, dataset) in train_datasets.iter().enumerate() {
            let mut local = global.model().boxed_clone();
            let update = trainer.train(ClientId(index as u32), local.as_mut(), dataset, round)?;
            global.add_local_result(update)?;
        }
        global.aggregate(round)?;
    }
    Ok(global.into_model())
}

#[cfg(test)]
mod tests {
    use std::{env, fs};

    use super::*;
    use crate::{
        data::{tests::toy_dataset, ImageShape},
        federation::evaluate,
        model::get_model,
        runner::recorder::RoundRecord,
    };

    #[test]
    fn test_run_serial() {
        let dir = env::temp_dir().join(format!("fedrun-serial-{}", uuid::Uuid::new_v4()));
        let mut config = Config::default();
        config.num_epochs = 3;
        config.train_data_batch_size = 2;
        config.fed.args.optim_args.lr = 0.5;
        config.record_metrics = true;
        config.output_dirname = dir.display().to_string();

        let shape = ImageShape::new(1, 2, 2);
        let model = get_model("Linear", shape, 2, 1).unwrap();
        let initial = model.parameters().to_vec();
        let train = vec![toy_dataset(4, 2), toy_dataset(6, 2)];
        let test = toy_dataset(4, 2);
        let before = evaluate(model.as_ref(), LossFn::CrossEntropy, Metric::Accuracy, &test).unwrap();

        let trained = run_serial(&config, model, LossFn::CrossEntropy, Metric::Accuracy, train, test.clone(), 1)
            .unwrap();
        assert_ne!(trained.parameters(), &initial[..]);

        let content = fs::read_to_string(dir.join("result.jsonl")).unwrap();
        let records: Vec<RoundRecord> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(records.iter().map(|r| r.round).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(records.iter().all(|r| r.num_updates == 2 && r.test_loss.is_some()));
        let after = evaluate(trained.as_ref(), LossFn::CrossEntropy, Metric::Accuracy, &test).unwrap();
        assert!(after.loss.is_finite() && before.loss.is_finite());
        fs::remove_dir_all(&dir).unwrap();
    }
}
