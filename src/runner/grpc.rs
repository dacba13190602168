//! Client/server runs with exactly one client per client rank.

use super::{participate, serve, ClientParts, RunError, ServerParts};
use crate::{
    common::{settings::RpcSettings, ClientId},
    config::Config,
    data::Dataset,
    model::Model,
    world::World,
};

pub async fn run_server(
    config: &Config,
    rpc_settings: &RpcSettings,
    world: World,
    parts: ServerParts,
) -> Result<Box<dyn Model>, RunError> {
    if config.num_clients != world.client_ranks() as usize {
        return Err(RunError::World(format!(
            "{} clients need {} processes, the world has {}",
            config.num_clients,
            config.num_clients + 1,
            world.size
        )));
    }
    info!(
        "serving {} client ranks on {}",
        config.num_clients, rpc_settings.server_address
    );
    serve(config, rpc_settings, world, parts).await
}

/// Train client `rank - 1` on its own partition.
pub async fn run_client(
    config: &Config,
    rpc_settings: &RpcSettings,
    world: World,
    parts: ClientParts,
    train_datasets: Vec<Dataset>,
) -> Result<Box<dyn Model>, RunError> {
    let client = client_of_rank(world.rank, train_datasets)?;
    info!(
        "rank {} trains client {} on {} samples",
        world.rank,
        client.0,
        client.1.len()
    );
    participate(config, rpc_settings, world, parts, vec![client]).await
}

fn client_of_rank(rank: u32, train_datasets: Vec<Dataset>) -> Result<(ClientId, Dataset), RunError> {
    let num_datasets = train_datasets.len();
    rank.checked_sub(1)
        .and_then(|index| {
            train_datasets
                .into_iter()
                .nth(index as usize)
                .map(|dataset| (ClientId(index), dataset))
        })
        .ok_or_else(|| {
            RunError::World(format!(
                "rank {} has no partition, only {} were made",
                rank, num_datasets
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tests::toy_dataset;

    #[test]
    fn test_client_of_rank() {
        let datasets = || vec![toy_dataset(2, 2), toy_dataset(3, 2)];
        let (id, dataset) = client_of_rank(2, datasets()).unwrap();
        assert_eq!(id, ClientId(1));
        assert_eq!(dataset.len(), 3);

        assert!(matches!(client_of_rank(3, datasets()), Err(RunError::World(_))));
        assert!(matches!(client_of_rank(0, datasets()), Err(RunError::World(_))));
    }
}
