//! Runs launched as one process per rank: rank 0 serves, the other ranks each own a
//! contiguous group of clients.

use super::{participate, serve, ClientParts, RunError, ServerParts};
use crate::{
    common::{settings::RpcSettings, ClientId},
    config::Config,
    data::Dataset,
    model::Model,
    world::{clients_of_rank, World},
};

/// Serve `config.num_clients` clients spread over the `world.size - 1` client ranks.
pub async fn run_server(
    config: &Config,
    rpc_settings: &RpcSettings,
    world: World,
    parts: ServerParts,
) -> Result<Box<dyn Model>, RunError> {
    info!(
        "serving {} clients over {} client ranks on {}",
        config.num_clients,
        world.client_ranks(),
        rpc_settings.server_address
    );
    serve(config, rpc_settings, world, parts).await
}

/// Train the clients owned by this rank, out of the datasets of every client.
pub async fn run_client(
    config: &Config,
    rpc_settings: &RpcSettings,
    world: World,
    parts: ClientParts,
    train_datasets: Vec<Dataset>,
) -> Result<Box<dyn Model>, RunError> {
    if train_datasets.len() < config.num_clients {
        return Err(RunError::World(format!(
            "{} clients are expected but only {} train datasets were loaded",
            config.num_clients,
            train_datasets.len()
        )));
    }
    let owned = clients_of_rank(world.rank, config.num_clients, world.client_ranks());
    let clients = own_clients(train_datasets, &owned);
    info!("rank {} owns clients {:?}", world.rank, owned);
    participate(config, rpc_settings, world, parts, clients).await
}

/// Keep the datasets of the given clients.
fn own_clients(train_datasets: Vec<Dataset>, owned: &[ClientId]) -> Vec<(ClientId, Dataset)> {
    train_datasets
        .into_iter()
        .enumerate()
        .map(|(index, dataset)| (ClientId(index as u32), dataset))
        .filter(|(id, _)| owned.contains(id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tests::toy_dataset;

    #[test]
    fn test_own_clients() {
        let datasets: Vec<Dataset> = (1..=5).map(|len| toy_dataset(len, 2)).collect();
        let owned = clients_of_rank(2, 5, 2);
        let clients = own_clients(datasets, &owned);
        let ids: Vec<ClientId> = clients.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![ClientId(3), ClientId(4)]);
        assert_eq!(clients[0].1.len(), 4);
        assert_eq!(clients[1].1.len(), 5);
    }
}
