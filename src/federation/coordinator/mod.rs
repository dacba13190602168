//! The coordinator owns the state of a federated run on the server rank.
//!
//! A [`CoordinatorService`] is a future driven by the requests sent through its
//! [`CoordinatorHandle`]. Requests are processed by the [`Protocol`] state machine, which
//! answers them and emits [`Event`]s that the service then carries out: aggregations run
//! after the request that completed the round has been answered.

mod protocol;
mod service;

pub use self::{
    protocol::{CoordinatorConfig, Event, JoinResponse, Phase, Protocol, RoundState, SubmitResponse},
    service::{
        Aggregator, CoordinatorHandle, CoordinatorService, RequestError, RoundResponse,
    },
};
