//! The federated runtime: local training, server aggregation and the coordinator that
//! drives the rounds between the server rank and the client ranks.

pub mod client;
pub mod coordinator;
pub mod evaluate;
pub mod optim;
pub mod participant;
pub mod rpc;
pub mod server;

use std::{error::Error, io};

use thiserror::Error;

use self::coordinator::RequestError;
use crate::{common::ClientId, model::ModelError};

pub use self::{
    client::{LocalTrainer, LocalUpdate},
    evaluate::{evaluate, Evaluation},
    server::ServerAggregator,
};

#[derive(Debug, Error)]
pub enum FederationError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("no client updates to aggregate")]
    NoUpdates,
    #[error("update of client {client} has {actual} parameters, expected {expected}")]
    ParameterCount {
        client: ClientId,
        expected: usize,
        actual: usize,
    },
    #[error("rejected by the coordinator: {0}")]
    Rejected(String),
    #[error("coordinator request failed: {0}")]
    Request(#[from] RequestError),
    #[error("RPC failed: {0}")]
    Rpc(#[from] tarpc::client::RpcError),
    #[error("failed to connect to {address}: {source}")]
    Connect { address: String, source: io::Error },
    #[error("failed to listen on {address}: {source}")]
    Listen { address: String, source: io::Error },
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("aggregation failed: {0}")]
    Aggregation(#[source] Box<dyn Error + Send + Sync>),
}
