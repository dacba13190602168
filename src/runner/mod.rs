//! Runners of a federated experiment: everything in one process, or one process per rank
//! with the server on rank 0.

pub mod global;
pub mod grpc;
pub mod mpi;
pub mod recorder;
pub mod serial;

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use thiserror::Error;

use crate::{
    common::{settings::RpcSettings, ClientId},
    config::Config,
    data::Dataset,
    federation::{
        coordinator::{CoordinatorConfig, CoordinatorService},
        participant::{Participant, Validation},
        rpc, FederationError, LocalTrainer,
    },
    model::{Checkpoint, LossFn, Metric, Model, ModelError},
    world::World,
};

pub use self::{global::GlobalModel, recorder::Recorder};

/// Time given to the client ranks to read the last responses before the server exits.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Federation(#[from] FederationError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("failed to write {path}: {source}")]
    Output { path: PathBuf, source: io::Error },
    #[error("failed to encode metrics: {0}")]
    Metrics(#[from] serde_json::Error),
    #[error("{0}")]
    World(String),
}

/// Start `model` from the checkpoint named by the `load_model_*` settings, when enabled.
pub fn load_pretrained(config: &Config, model: &mut dyn Model) -> Result<(), RunError> {
    if !config.load_model {
        return Ok(());
    }
    let path = Path::new(&config.load_model_dirname).join(&config.load_model_filename);
    let checkpoint = Checkpoint::load(&path)?;
    checkpoint.restore(model)?;
    info!(
        "restored the {} model from {} (round {})",
        checkpoint.model,
        path.display(),
        checkpoint.round
    );
    Ok(())
}

/// Everything a server rank needs besides the world.
pub struct ServerParts {
    pub model: Box<dyn Model>,
    pub loss: LossFn,
    pub metric: Metric,
    pub test_dataset: Dataset,
}

/// Run the coordinator of a run with `num_clients` clients spread over the client ranks
/// of `world`, serving it on `rpc.server_address` until every rank is done.
async fn serve(
    config: &Config,
    rpc_settings: &RpcSettings,
    world: World,
    parts: ServerParts,
) -> Result<Box<dyn Model>, RunError> {
    let ServerParts {
        model,
        loss,
        metric,
        test_dataset,
    } = parts;
    let initial = model.parameters().to_vec();
    let mut final_model = model.boxed_clone();
    let recorder = Recorder::new(config)?;
    let global = GlobalModel::new(model, config, test_dataset, loss, metric, recorder);

    let (service, handle) = CoordinatorService::new(
        global,
        initial,
        CoordinatorConfig {
            num_clients: config.num_clients,
            rounds: config.num_epochs,
            ranks: world.client_ranks(),
        },
    );
    let (_, server) = rpc::serve(&rpc_settings.server_address, handle).await?;
    let result = service.await;
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    server.abort();

    final_model.set_parameters(&result?)?;
    Ok(final_model)
}

/// Everything a client rank needs besides the world.
pub struct ClientParts {
    pub model: Box<dyn Model>,
    pub loss: LossFn,
    pub metric: Metric,
    /// Test data for validating the global models, when enabled.
    pub test_dataset: Option<Dataset>,
    pub seed: u64,
}

/// Run a client rank owning the given clients.
async fn participate(
    config: &Config,
    rpc_settings: &RpcSettings,
    world: World,
    parts: ClientParts,
    clients: Vec<(ClientId, Dataset)>,
) -> Result<Box<dyn Model>, RunError> {
    let ClientParts {
        model,
        loss,
        metric,
        test_dataset,
        seed,
    } = parts;
    let trainer = LocalTrainer::new(config, loss, seed);
    let mut participant = Participant::new(world.rank, clients, trainer, model)
        .with_poll_interval(Duration::from_millis(rpc_settings.poll_interval_ms));
    if let Some(test_dataset) = test_dataset.filter(|_| config.validation) {
        participant = participant.with_validation(Validation {
            test_dataset: Arc::new(test_dataset),
            loss,
            metric,
        });
    }
    let client = rpc::connect(
        &rpc_settings.server_address,
        rpc_settings.connect_retries,
        Duration::from_millis(rpc_settings.connect_delay_ms),
    )
    .await?;
    Ok(participant.run(&client).await?)
}
