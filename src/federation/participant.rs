//! The loop run by a client rank.

use std::{sync::Arc, time::Duration};

use tarpc::context;

use super::{
    coordinator::{JoinResponse, RoundResponse, SubmitResponse},
    evaluate,
    rpc::Client,
    Evaluation, FederationError, LocalTrainer, LocalUpdate,
};
use crate::{
    common::{ClientId, Token},
    data::Dataset,
    model::{LossFn, Metric, Model},
};

/// Evaluation of the global models on the test set of a client rank.
#[derive(Clone)]
pub struct Validation {
    pub test_dataset: Arc<Dataset>,
    pub loss: LossFn,
    pub metric: Metric,
}

/// A client rank, training the clients it owns.
pub struct Participant {
    rank: u32,
    clients: Arc<Vec<(ClientId, Dataset)>>,
    trainer: Arc<LocalTrainer>,
    model: Box<dyn Model>,
    validation: Option<Validation>,
    poll_interval: Duration,
}

impl Participant {
    pub fn new(
        rank: u32,
        clients: Vec<(ClientId, Dataset)>,
        trainer: LocalTrainer,
        model: Box<dyn Model>,
    ) -> Self {
        Self {
            rank,
            clients: Arc::new(clients),
            trainer: Arc::new(trainer),
            model,
            validation: None,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_validation(mut self, validation: Validation) -> Self {
        self.validation = Some(validation);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Take part in the federation until the final model is out, and return it.
    pub async fn run(mut self, client: &Client) -> Result<Box<dyn Model>, FederationError> {
        let ids: Vec<ClientId> = self.clients.iter().map(|(id, _)| *id).collect();
        let token = match client.join(context::current(), self.rank, ids).await?? {
            JoinResponse::Accept(token) => token,
            JoinResponse::Reject(reason) => return Err(FederationError::Rejected(reason)),
        };
        info!("rank {} joined the federation", self.rank);

        loop {
            match client.round(context::current(), token).await?? {
                RoundResponse::StandBy => tokio::time::sleep(self.poll_interval).await,
                RoundResponse::Train { round, parameters } => {
                    self.model.set_parameters(&parameters)?;
                    if round > 0 {
                        self.validate(round - 1).await?;
                    }
                    let updates = self.train(round).await?;
                    self.submit(client, token, round, updates).await?;
                }
                RoundResponse::Finish { parameters } => {
                    self.model.set_parameters(&parameters)?;
                    match client.finished(context::current(), token).await {
                        Ok(Ok(true)) => {}
                        Ok(Ok(false)) => warn!("the coordinator did not expect rank {} to finish", self.rank),
                        Ok(Err(e)) => warn!("failed to acknowledge the final model: {}", e),
                        Err(e) => warn!("failed to acknowledge the final model: {}", e),
                    }
                    self.validate_final().await?;
                    info!("rank {} is done", self.rank);
                    return Ok(self.model);
                }
                RoundResponse::Reject => {
                    return Err(FederationError::Rejected(format!(
                        "rank {} is unknown to the coordinator",
                        self.rank
                    )))
                }
            }
        }
    }

    /// Train every owned client from the current global model.
    async fn train(&self, round: u32) -> Result<Vec<LocalUpdate>, FederationError> {
        let clients = self.clients.clone();
        let trainer = self.trainer.clone();
        let global = self.model.clone();
        let updates = tokio::task::spawn_blocking(move || {
            clients
                .iter()
                .map(|(id, dataset)| {
                    let mut local = global.clone();
                    trainer.train(*id, local.as_mut(), dataset, round)
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .await??;
        if !updates.is_empty() {
            let loss = updates.iter().map(|u| u.loss).sum::<f32>() / updates.len() as f32;
            info!(
                "rank {} trained {} clients in round {} (mean loss {:.4})",
                self.rank,
                updates.len(),
                round,
                loss
            );
        }
        Ok(updates)
    }

    async fn submit(
        &self,
        client: &Client,
        token: Token,
        round: u32,
        updates: Vec<LocalUpdate>,
    ) -> Result<(), FederationError> {
        if updates.is_empty() {
            return Ok(());
        }
        match client
            .submit(context::current(), token, round, updates)
            .await??
        {
            SubmitResponse::Accept => Ok(()),
            SubmitResponse::Reject(reason) => Err(FederationError::Rejected(reason)),
        }
    }

    async fn evaluate(&self) -> Result<Option<Evaluation>, FederationError> {
        let validation = match &self.validation {
            Some(validation) => validation.clone(),
            None => return Ok(None),
        };
        let model = self.model.clone();
        let evaluation = tokio::task::spawn_blocking(move || {
            evaluate(
                model.as_ref(),
                validation.loss,
                validation.metric,
                &validation.test_dataset,
            )
        })
        .await??;
        Ok(Some(evaluation))
    }

    async fn validate(&self, round: u32) -> Result<(), FederationError> {
        if let Some(evaluation) = self.evaluate().await? {
            info!(
                "rank {}: global model of round {}: test loss {:.4}, test metric {:.2}",
                self.rank, round, evaluation.loss, evaluation.metric
            );
        }
        Ok(())
    }

    async fn validate_final(&self) -> Result<(), FederationError> {
        if let Some(evaluation) = self.evaluate().await? {
            info!(
                "rank {}: final model: test loss {:.4}, test metric {:.2}",
                self.rank, evaluation.loss, evaluation.metric
            );
        }
        Ok(())
    }
}
