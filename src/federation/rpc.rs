//! The RPC link between the server rank and the client ranks: a tarpc service, JSON over
//! TCP, forwarding every call to the [`CoordinatorHandle`].

use std::{future::Future, net::SocketAddr, time::Duration};

use futures::{future, StreamExt};
use tarpc::{
    client,
    context,
    serde_transport::tcp,
    server::{BaseChannel, Channel},
    tokio_serde::formats::Json,
};
use tokio::task::JoinHandle;

use super::{
    coordinator::{CoordinatorHandle, JoinResponse, RequestError, RoundResponse, SubmitResponse},
    FederationError, LocalUpdate,
};
use crate::common::{ClientId, Token};

mod inner {
    use crate::{
        common::{ClientId, Token},
        federation::{
            coordinator::{JoinResponse, RequestError, RoundResponse, SubmitResponse},
            LocalUpdate,
        },
    };

    #[tarpc::service]
    pub trait Federation {
        async fn join(rank: u32, clients: Vec<ClientId>) -> Result<JoinResponse, RequestError>;
        async fn round(token: Token) -> Result<RoundResponse, RequestError>;
        async fn submit(
            token: Token,
            round: u32,
            updates: Vec<LocalUpdate>,
        ) -> Result<SubmitResponse, RequestError>;
        async fn finished(token: Token) -> Result<bool, RequestError>;
    }
}
pub use inner::{Federation, FederationClient as Client};

/// A server forwarding the requests of one connection to the coordinator.
#[derive(Clone)]
struct Server(CoordinatorHandle);

impl Federation for Server {
    async fn join(
        self,
        _: context::Context,
        rank: u32,
        clients: Vec<ClientId>,
    ) -> Result<JoinResponse, RequestError> {
        debug!("handling join request of rank {}", rank);
        self.0.join(rank, clients).await
    }

    async fn round(self, _: context::Context, token: Token) -> Result<RoundResponse, RequestError> {
        trace!("handling round request");
        self.0.round(token).await
    }

    async fn submit(
        self,
        _: context::Context,
        token: Token,
        round: u32,
        updates: Vec<LocalUpdate>,
    ) -> Result<SubmitResponse, RequestError> {
        debug!("handling submission of {} updates", updates.len());
        self.0.submit(token, round, updates).await
    }

    async fn finished(self, _: context::Context, token: Token) -> Result<bool, RequestError> {
        debug!("handling finished request");
        self.0.finished(token).await
    }
}

async fn spawn(fut: impl Future<Output = ()> + Send + 'static) {
    tokio::spawn(fut);
}

/// Listen on `address` and serve every connection with the coordinator behind `handle`.
///
/// Returns the bound address and the task accepting the connections.
pub async fn serve(
    address: &str,
    handle: CoordinatorHandle,
) -> Result<(SocketAddr, JoinHandle<()>), FederationError> {
    let mut listener = tcp::listen(address, Json::default)
        .await
        .map_err(|source| FederationError::Listen {
            address: address.to_string(),
            source,
        })?;
    // models can be larger than the default frame limit
    listener.config_mut().max_frame_length(usize::MAX);
    let local_addr = listener.local_addr();
    info!("serving the federation on {}", local_addr);

    let task = tokio::spawn(
        listener
            .filter_map(|accept_result| {
                future::ready(match accept_result {
                    Ok(transport) => Some(transport),
                    Err(e) => {
                        error!("failed to accept RPC connection: {:?}", e);
                        None
                    }
                })
            })
            .map(BaseChannel::with_defaults)
            .map(move |channel| {
                let server = Server(handle.clone());
                channel.execute(server.serve()).for_each(spawn)
            })
            .for_each_concurrent(None, |connection| connection),
    );
    Ok((local_addr, task))
}

/// Connect to the server rank, retrying `retries` times every `delay` while it is not up.
pub async fn connect(
    address: &str,
    retries: u32,
    delay: Duration,
) -> Result<Client, FederationError> {
    let mut attempt = 0;
    loop {
        let mut transport = tcp::connect(address, Json::default);
        transport.config_mut().max_frame_length(usize::MAX);
        match transport.await {
            Ok(transport) => {
                info!("connected to {}", address);
                return Ok(Client::new(client::Config::default(), transport).spawn());
            }
            Err(e) if attempt < retries => {
                attempt += 1;
                debug!(
                    "failed to connect to {} ({}), retrying ({}/{})",
                    address, e, attempt, retries
                );
                tokio::time::sleep(delay).await;
            }
            Err(source) => {
                return Err(FederationError::Connect {
                    address: address.to_string(),
                    source,
                })
            }
        }
    }
}
