//! Per-round outputs of the server: log lines, a JSON-lines metrics file and model
//! checkpoints.

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use super::RunError;
use crate::{
    config::Config,
    model::{Checkpoint, Model},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// What happened in one round.
pub struct RoundRecord {
    pub round: u32,
    /// Seconds from the start of the round to the end of the aggregation.
    pub train_time: f64,
    /// Seconds spent evaluating the global model.
    pub test_time: f64,
    /// Mean training loss reported by the clients.
    pub train_loss: f32,
    pub test_loss: Option<f32>,
    pub test_metric: Option<f32>,
    pub num_updates: usize,
}

struct CheckpointPolicy {
    dir: PathBuf,
    filename: String,
    interval: u32,
    rounds: u32,
}

pub struct Recorder {
    metrics: Option<(PathBuf, BufWriter<File>)>,
    checkpoints: Option<CheckpointPolicy>,
}

impl Recorder {
    /// Prepare the outputs requested by `config`.
    ///
    /// # Errors
    /// Fails if the metrics file cannot be created.
    pub fn new(config: &Config) -> Result<Self, RunError> {
        let metrics = if config.record_metrics {
            let dir = Path::new(&config.output_dirname);
            let path = dir.join(format!("{}.jsonl", config.output_filename));
            fs::create_dir_all(dir).map_err(|source| RunError::Output {
                path: dir.to_path_buf(),
                source,
            })?;
            let file = File::create(&path).map_err(|source| RunError::Output {
                path: path.clone(),
                source,
            })?;
            info!("recording metrics to {}", path.display());
            Some((path, BufWriter::new(file)))
        } else {
            None
        };
        let checkpoints = config.save_model.then(|| CheckpointPolicy {
            dir: PathBuf::from(&config.save_model_dirname),
            filename: config.save_model_filename.clone(),
            interval: config.checkpoints_interval.max(1),
            rounds: config.num_epochs,
        });
        Ok(Self {
            metrics,
            checkpoints,
        })
    }

    /// A recorder that only logs.
    pub fn disabled() -> Self {
        Self {
            metrics: None,
            checkpoints: None,
        }
    }

    pub fn record(&mut self, record: &RoundRecord) -> Result<(), RunError> {
        match (record.test_loss, record.test_metric) {
            (Some(loss), Some(metric)) => info!(
                "round {}: {} updates, train loss {:.4}, test loss {:.4}, test metric {:.2}, {:.2}s",
                record.round,
                record.num_updates,
                record.train_loss,
                loss,
                metric,
                record.train_time + record.test_time
            ),
            _ => info!(
                "round {}: {} updates, train loss {:.4}, {:.2}s",
                record.round, record.num_updates, record.train_loss, record.train_time
            ),
        }

        if let Some((path, writer)) = &mut self.metrics {
            let line = serde_json::to_string(record)?;
            writeln!(writer, "{}", line)
                .and_then(|_| writer.flush())
                .map_err(|source| RunError::Output {
                    path: path.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Save the global model after `round` (counted from 0) when it is due.
    ///
    /// Checkpoints are named after the number of completed rounds; the final model is
    /// always saved.
    pub fn checkpoint(&self, model: &dyn Model, round: u32) -> Result<Option<PathBuf>, RunError> {
        let policy = match &self.checkpoints {
            Some(policy) => policy,
            None => return Ok(None),
        };
        let completed = round + 1;
        if completed % policy.interval != 0 && completed != policy.rounds {
            return Ok(None);
        }
        let path = policy
            .dir
            .join(format!("{}_Round_{}.json", policy.filename, completed));
        Checkpoint::of(model, completed).save(&path)?;
        debug!("saved checkpoint {}", path.display());
        Ok(Some(path))
    }
}
