use std::{
    error::Error,
    future::Future,
    mem,
    pin::Pin,
    task::{Context, Poll},
};

use derive_more::Display;
use tokio::{
    sync::{mpsc, oneshot},
    task::{JoinError, JoinHandle},
};

use super::protocol::{
    CoordinatorConfig, Event, JoinResponse, Phase, Protocol, RoundState, SubmitResponse,
};
use crate::{
    common::{ClientId, Token},
    federation::{FederationError, LocalUpdate},
};

/// Turns the updates of a round into the next global model.
pub trait Aggregator {
    type Error: Error + Send + Sync + 'static;

    fn add_local_result(&mut self, update: LocalUpdate) -> Result<(), Self::Error>;

    /// Aggregate the results added since the previous call and return the new global
    /// parameters.
    fn aggregate(&mut self, round: u32) -> Result<Vec<f32>, Self::Error>;
}

/// An aggregation running on the blocking pool. The aggregator is handed back with the
/// result.
type Aggregation<A> = JoinHandle<(A, Result<Vec<f32>, <A as Aggregator>::Error>)>;

pub struct CoordinatorService<A>
where
    A: Aggregator,
{
    requests_rx: mpsc::Receiver<Request>,
    protocol: Protocol,
    /// `None` while an aggregation runs.
    aggregator: Option<A>,
    aggregation: Option<Aggregation<A>>,
    global_weights: Vec<f32>,
    /// Set once every rank acknowledged the final model.
    shut_down: bool,
    /// A failed aggregation ends the run.
    failure: Option<FederationError>,
}

impl<A> CoordinatorService<A>
where
    A: Aggregator + Send + 'static,
{
    pub fn new(
        aggregator: A,
        global_weights: Vec<f32>,
        config: CoordinatorConfig,
    ) -> (Self, CoordinatorHandle) {
        let (requests_tx, requests_rx) = mpsc::channel(2048);
        let coordinator = Self {
            requests_rx,
            protocol: Protocol::new(config),
            aggregator: Some(aggregator),
            aggregation: None,
            global_weights,
            shut_down: false,
            failure: None,
        };
        (coordinator, CoordinatorHandle::new(requests_tx))
    }

    /// Handle the pending state machine events.
    fn handle_protocol_events(&mut self) {
        while let Some(event) = self.protocol.next_event() {
            self.dispatch_event(event);
        }
    }

    /// Handle a request
    fn dispatch_request(&mut self, request: Request) {
        match request {
            Request::Join(inner_request) => self.join(inner_request),
            Request::Round(inner_request) => self.round(inner_request),
            Request::Submit(inner_request) => self.submit(inner_request),
            Request::Finished(inner_request) => self.finished(inner_request),
        }
    }

    fn join(&mut self, req: RequestMessage<JoinRequest, JoinResponse>) {
        let (JoinRequest { rank, clients }, response_sender) = req;
        let response = self.protocol.join(Token::new(), rank, clients);
        response_sender.send(response);
    }

    fn round(&mut self, req: RequestMessage<Token, RoundResponse>) {
        let (token, response_sender) = req;
        let response = match self.protocol.round(token) {
            RoundState::Reject => RoundResponse::Reject,
            RoundState::StandBy => RoundResponse::StandBy,
            RoundState::Train(round) => RoundResponse::Train {
                round,
                parameters: self.global_weights.clone(),
            },
            RoundState::Finish => RoundResponse::Finish {
                parameters: self.global_weights.clone(),
            },
        };
        response_sender.send(response);
    }

    fn submit(&mut self, req: RequestMessage<SubmitRequest, SubmitResponse>) {
        let (
            SubmitRequest {
                token,
                round,
                updates,
            },
            response_sender,
        ) = req;
        if let Some(update) = updates
            .iter()
            .find(|u| u.parameters.len() != self.global_weights.len())
        {
            response_sender.send(SubmitResponse::Reject(format!(
                "update of client {} has {} parameters, expected {}",
                update.client,
                update.parameters.len(),
                self.global_weights.len()
            )));
            return;
        }

        let clients: Vec<ClientId> = updates.iter().map(|u| u.client).collect();
        let response = self.protocol.submit(token, round, &clients);
        if response == SubmitResponse::Accept {
            // updates are only accepted while training, never during an aggregation
            if let Some(aggregator) = self.aggregator.as_mut() {
                let failures: Vec<A::Error> = updates
                    .into_iter()
                    .filter_map(|update| aggregator.add_local_result(update).err())
                    .collect();
                failures.into_iter().for_each(|e| self.fail(e));
            }
        }
        response_sender.send(response);
    }

    fn finished(&mut self, req: RequestMessage<Token, bool>) {
        let (token, response_sender) = req;
        response_sender.send(self.protocol.finished(token));
    }

    /// Dispatch an [`Event`] to the appropriate handler
    fn dispatch_event(&mut self, event: Event) {
        debug!("handling protocol event {:?}", event);
        match event {
            Event::StartRound(round) => info!("starting round {}", round),
            Event::RunAggregation(round) => self.run_aggregation(round),
            Event::Shutdown => self.shut_down = true,
        }
    }

    /// Handle a [`Event::RunAggregation`] event
    ///
    /// The aggregation runs on the blocking pool, the ranks asking for the next round get
    /// [`RoundResponse::StandBy`] until it is done.
    fn run_aggregation(&mut self, round: u32) {
        let mut aggregator = match self.aggregator.take() {
            Some(aggregator) => aggregator,
            None => {
                error!("round {} ended while an aggregation is running", round);
                return;
            }
        };
        debug!("aggregating round {}", round);
        self.aggregation = Some(tokio::task::spawn_blocking(move || {
            let result = aggregator.aggregate(round);
            (aggregator, result)
        }));
    }

    /// Take back the aggregator and publish the new global model.
    fn end_aggregation(&mut self, joined: Result<(A, Result<Vec<f32>, A::Error>), JoinError>) {
        let (aggregator, result) = match joined {
            Ok(joined) => joined,
            Err(e) => {
                error!("aggregation task failed: {}", e);
                self.failure.get_or_insert(FederationError::Task(e));
                return;
            }
        };
        self.aggregator = Some(aggregator);
        match result {
            Ok(global_weights) => {
                self.global_weights = global_weights;
                if let Phase::Aggregating(round) = self.protocol.phase() {
                    info!("aggregation of round {} ran", round);
                }
                self.protocol.end_aggregation();
            }
            Err(e) => self.fail(e),
        }
    }

    fn fail(&mut self, error: A::Error) {
        error!("aggregation failed: {}", error);
        self.failure
            .get_or_insert(FederationError::Aggregation(Box::new(error)));
    }
}

impl<A> Future for CoordinatorService<A>
where
    A: Aggregator + Send + Unpin + 'static,
{
    /// The final global parameters.
    type Output = Result<Vec<f32>, FederationError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        trace!("polling CoordinatorService");
        let pin = self.get_mut();
        loop {
            if let Some(error) = pin.failure.take() {
                return Poll::Ready(Err(error));
            }
            if pin.shut_down {
                return Poll::Ready(Ok(mem::take(&mut pin.global_weights)));
            }
            if let Some(aggregation) = pin.aggregation.as_mut() {
                if let Poll::Ready(joined) = Pin::new(aggregation).poll(cx) {
                    pin.aggregation = None;
                    pin.end_aggregation(joined);
                    pin.handle_protocol_events();
                    continue;
                }
            }
            match pin.requests_rx.poll_recv(cx) {
                Poll::Ready(Some(request)) => {
                    pin.dispatch_request(request);
                    pin.handle_protocol_events();
                }
                Poll::Ready(None) => {
                    warn!("every coordinator handle was dropped before the end of the run");
                    return Poll::Ready(Err(FederationError::Request(RequestError)));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Error returned when a request fails due to the coordinator having shut down.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[display(fmt = "the coordinator shut down")]
pub struct RequestError;

impl Error for RequestError {}

pub struct ResponseReceiver<R>(oneshot::Receiver<R>);

pub fn response_channel<R>() -> (ResponseSender<R>, ResponseReceiver<R>) {
    let (tx, rx) = oneshot::channel::<R>();
    (ResponseSender(tx), ResponseReceiver(rx))
}

impl<R> Future for ResponseReceiver<R> {
    type Output = Result<R, RequestError>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().0)
            .poll(cx)
            .map_err(|_| RequestError)
    }
}

pub struct ResponseSender<R>(oneshot::Sender<R>);

impl<R> ResponseSender<R> {
    pub fn send(self, response: R) {
        self.0.send(response).unwrap_or_else(|_| {
            warn!("failed to send response: receiver shut down");
        })
    }
}

pub type RequestMessage<P, R> = (P, ResponseSender<R>);

// join
#[derive(Debug)]
pub struct JoinRequest {
    pub rank: u32,
    pub clients: Vec<ClientId>,
}

// round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoundResponse {
    /// The rank is unknown to the coordinator.
    Reject,
    StandBy,
    Train { round: u32, parameters: Vec<f32> },
    Finish { parameters: Vec<f32> },
}

// submit
#[derive(Debug)]
pub struct SubmitRequest {
    pub token: Token,
    pub round: u32,
    pub updates: Vec<LocalUpdate>,
}

pub enum Request {
    Join(RequestMessage<JoinRequest, JoinResponse>),
    Round(RequestMessage<Token, RoundResponse>),
    Submit(RequestMessage<SubmitRequest, SubmitResponse>),
    Finished(RequestMessage<Token, bool>),
}

#[derive(Clone)]
pub struct CoordinatorHandle(mpsc::Sender<Request>);

impl CoordinatorHandle {
    pub fn new(requests_tx: mpsc::Sender<Request>) -> Self {
        Self(requests_tx)
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(ResponseSender<R>) -> Request,
    ) -> Result<R, RequestError> {
        let (resp_tx, resp_rx) = response_channel::<R>();
        self.0.send(make(resp_tx)).await.map_err(|_| RequestError)?;
        resp_rx.await
    }

    pub async fn join(
        &self,
        rank: u32,
        clients: Vec<ClientId>,
    ) -> Result<JoinResponse, RequestError> {
        self.request(|tx| Request::Join((JoinRequest { rank, clients }, tx)))
            .await
    }

    pub async fn round(&self, token: Token) -> Result<RoundResponse, RequestError> {
        self.request(|tx| Request::Round((token, tx))).await
    }

    pub async fn submit(
        &self,
        token: Token,
        round: u32,
        updates: Vec<LocalUpdate>,
    ) -> Result<SubmitResponse, RequestError> {
        self.request(|tx| {
            Request::Submit((
                SubmitRequest {
                    token,
                    round,
                    updates,
                },
                tx,
            ))
        })
        .await
    }

    pub async fn finished(&self, token: Token) -> Result<bool, RequestError> {
        self.request(|tx| Request::Finished((token, tx))).await
    }
}
