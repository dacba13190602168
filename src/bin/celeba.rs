#[macro_use]
extern crate tracing;

use std::time::Instant;

use anyhow::{Context, Result};
use structopt::StructOpt;
use tracing::Instrument;
use validator::Validate;

use fedrun::{
    cli::CelebaOpt,
    common::{
        logging,
        settings::{RpcSettings, Settings},
    },
    config::{Config, Device},
    data::{celeba, data_sanity_check, ensure_shape, Dataset, ImageShape},
    model::{get_loss, get_metric, get_model, LossFn, Metric, Model},
    runner::{self, mpi, serial::run_serial, ClientParts, ServerParts},
    world::{Role, World},
};

#[tokio::main]
async fn main() -> Result<()> {
    let opt = CelebaOpt::from_args();
    let Settings {
        log,
        rpc,
        experiment: mut config,
    } = Settings::new(opt.common.config.as_deref()).context("failed to load the settings")?;
    logging::configure(log);

    opt.apply(&mut config);
    let world = World::discover(opt.common.rank, opt.common.world_size)
        .context("failed to discover the rank of this process")?;
    if config.device == Device::Cuda {
        warn!("training on CUDA is not supported, falling back to the CPU");
    }

    let start = Instant::now();
    let dataset_dir = opt.common.data_dir.join(&config.dataset);
    let (train_datasets, test_dataset) = celeba::get_data(&dataset_dir, opt.num_pixel)
        .with_context(|| format!("failed to load CelebA from {}", dataset_dir.display()))?;
    if config.data_sanity {
        data_sanity_check(
            &train_datasets,
            &test_dataset,
            opt.num_channel,
            opt.num_pixel as usize,
        )?;
    }
    if opt.num_clients != train_datasets.len() {
        debug!(
            "--num_clients {} ignored, the manifest has {} train users",
            opt.num_clients,
            train_datasets.len()
        );
    }
    config.num_clients = train_datasets.len();
    config
        .validate()
        .context("invalid experiment configuration")?;

    let shape = ImageShape::square(opt.num_channel, opt.num_pixel as usize);
    ensure_shape(&train_datasets, &test_dataset, shape)
        .context("--num_channel and --num_pixel do not match the loaded images")?;
    let mut model = get_model(&opt.model, shape, opt.num_classes, config.seed)?;
    runner::load_pretrained(&config, model.as_mut())?;
    let loss = get_loss(None, None)?;
    let metric = get_metric(opt.metric.as_deref())?;
    info!(
        "Loaded Datasets and Model in {:.2}s",
        start.elapsed().as_secs_f64()
    );
    debug!("experiment configuration: {}", config);

    let span = info_span!("celeba", rank = world.rank);
    dispatch(
        config,
        rpc,
        world,
        model,
        loss,
        metric,
        train_datasets,
        test_dataset,
    )
    .instrument(span)
    .await
}

#[allow(clippy::too_many_arguments)]
async fn dispatch(
    config: Config,
    rpc: RpcSettings,
    world: World,
    model: Box<dyn Model>,
    loss: LossFn,
    metric: Metric,
    train_datasets: Vec<Dataset>,
    test_dataset: Dataset,
) -> Result<()> {
    match world.role() {
        Role::Serial => {
            run_serial(
                &config,
                model,
                loss,
                metric,
                train_datasets,
                test_dataset,
                config.seed,
            )?;
        }
        Role::Server => {
            let parts = ServerParts {
                model,
                loss,
                metric,
                test_dataset,
            };
            mpi::run_server(&config, &rpc, world, parts).await?;
        }
        Role::Client(_) => {
            // rank 0 evaluates every global model
            let parts = ClientParts {
                model,
                loss,
                metric,
                test_dataset: None,
                seed: config.seed,
            };
            mpi::run_client(&config, &rpc, world, parts, train_datasets).await?;
        }
    }
    info!("done");
    Ok(())
}
