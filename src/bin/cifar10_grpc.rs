#[macro_use]
extern crate tracing;

use std::time::Instant;

use anyhow::{bail, Context, Result};
use structopt::StructOpt;
use tracing::Instrument;
use validator::Validate;

use fedrun::{
    cli::Cifar10Opt,
    common::{logging, settings::Settings},
    config::Device,
    data::{cifar10, data_sanity_check, ensure_shape, ImageShape},
    model::{get_loss, get_metric, get_model},
    runner::{grpc, ClientParts, ServerParts},
    world::{Role, World},
};

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Cifar10Opt::from_args();
    let Settings {
        log,
        rpc,
        experiment: mut config,
    } = Settings::new(opt.common.config.as_deref()).context("failed to load the settings")?;
    logging::configure(log);

    let world = World::discover(opt.common.rank, opt.common.world_size)
        .context("failed to discover the rank of this process")?;
    if world.size < 2 {
        bail!("the CIFAR-10 driver needs a server rank and at least one client rank");
    }
    config.num_clients = world.client_ranks() as usize;
    opt.apply(&mut config);
    config
        .validate()
        .context("invalid experiment configuration")?;
    if config.device == Device::Cuda {
        warn!("training on CUDA is not supported, falling back to the CPU");
    }

    let start = Instant::now();
    let dataset_dir = opt.common.data_dir.join(&config.dataset);
    let (train_datasets, test_dataset) = cifar10::get_cifar10(
        &dataset_dir,
        opt.num_pixel,
        config.num_clients,
        opt.partition,
        opt.seed,
        config.partition,
    )
    .with_context(|| format!("failed to load CIFAR-10 from {}", dataset_dir.display()))?;
    if config.data_sanity {
        data_sanity_check(
            &train_datasets,
            &test_dataset,
            opt.num_channel,
            opt.num_pixel as usize,
        )?;
    }

    let shape = ImageShape::square(opt.num_channel, opt.num_pixel as usize);
    ensure_shape(&train_datasets, &test_dataset, shape)
        .context("--num_channel and --num_pixel do not match the loaded images")?;
    let model = get_model(&opt.model, shape, opt.num_classes, config.seed)?;
    let loss = get_loss(opt.loss_fn.as_deref(), opt.loss_fn_name.as_deref())?;
    let metric = get_metric(opt.metric.as_deref())?;
    info!(
        "Loaded Datasets and Model in {:.2}s",
        start.elapsed().as_secs_f64()
    );
    debug!("experiment configuration: {}", config);

    let span = info_span!("cifar10", rank = world.rank);
    async move {
        match world.role() {
            Role::Server => {
                let parts = ServerParts {
                    model,
                    loss,
                    metric,
                    test_dataset,
                };
                grpc::run_server(&config, &rpc, world, parts).await?;
            }
            Role::Client(_) => {
                let parts = ClientParts {
                    model,
                    loss,
                    metric,
                    test_dataset: Some(test_dataset),
                    seed: config.seed,
                };
                grpc::run_client(&config, &rpc, world, parts, train_datasets).await?;
            }
            Role::Serial => bail!("a world of size {} has no server rank", world.size),
        }
        info!("done");
        Ok::<_, anyhow::Error>(())
    }
    .instrument(span)
    .await
}
