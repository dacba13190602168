use std::collections::{HashMap, HashSet, VecDeque};

use crate::common::{ClientId, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Number of clients; every client id in `0..num_clients` must be claimed by a rank
    /// before the first round starts.
    pub num_clients: usize,
    /// Number of rounds to run.
    pub rounds: u32,
    /// Number of client ranks, numbered from 1.
    pub ranks: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Where the run is at.
pub enum Phase {
    /// Waiting for ranks to claim every client.
    Gathering,
    /// Waiting for the updates of the round.
    Training(u32),
    /// All updates of the round arrived.
    Aggregating(u32),
    /// All rounds ran, waiting for the ranks to fetch the final model.
    Finished,
}

/// Events emitted by the state machine
#[derive(Debug, PartialEq, Eq)]
pub enum Event {
    /// A new round is open for training.
    StartRound(u32),
    /// Every update of the round arrived, aggregate them.
    RunAggregation(u32),
    /// Every rank acknowledged the final model.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Response to a join request
pub enum JoinResponse {
    /// The rank is part of the federation and must use this token in its requests.
    Accept(Token),
    Reject(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What a rank should do next.
pub enum RoundState {
    /// The rank is unknown
    Reject,
    /// Nothing to do yet, ask again later.
    StandBy,
    /// Train the rank's clients on the global model of this round.
    Train(u32),
    /// Training is over, fetch the final model.
    Finish,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Response to an update submission
pub enum SubmitResponse {
    Accept,
    Reject(String),
}

/// A rank taking part in the run.
#[derive(Debug)]
struct Member {
    rank: u32,
    clients: Vec<ClientId>,
    finished: bool,
}

/// The state machine.
pub struct Protocol {
    config: CoordinatorConfig,
    phase: Phase,
    members: HashMap<Token, Member>,
    ranks: HashSet<u32>,
    /// Client ids claimed by a rank.
    claimed: HashSet<ClientId>,
    /// Clients whose update for the current round arrived.
    received: HashSet<ClientId>,
    acknowledged: u32,
    /// Events emitted by the state machine
    events: VecDeque<Event>,
}

impl Protocol {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            phase: Phase::Gathering,
            members: HashMap::new(),
            ranks: HashSet::new(),
            claimed: HashSet::new(),
            received: HashSet::new(),
            acknowledged: 0,
            events: VecDeque::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Handle a join request from `rank`, claiming `clients`.
    pub fn join(&mut self, token: Token, rank: u32, clients: Vec<ClientId>) -> JoinResponse {
        info!("join request: rank {} with clients {:?}", rank, clients);
        if rank == 0 || rank > self.config.ranks {
            return JoinResponse::Reject(format!(
                "rank {} is not one of the {} client ranks",
                rank, self.config.ranks
            ));
        }
        if self.ranks.contains(&rank) {
            return JoinResponse::Reject(format!("rank {} already joined", rank));
        }
        let mut requested = HashSet::new();
        for &client in &clients {
            if client.index() >= self.config.num_clients {
                return JoinResponse::Reject(format!(
                    "client {} is out of range, the run has {} clients",
                    client, self.config.num_clients
                ));
            }
            if self.claimed.contains(&client) || !requested.insert(client) {
                return JoinResponse::Reject(format!("client {} is already claimed", client));
            }
        }

        self.ranks.insert(rank);
        self.claimed.extend(requested);
        self.members.insert(
            token,
            Member {
                rank,
                clients,
                finished: false,
            },
        );

        if self.phase == Phase::Gathering && self.claimed.len() == self.config.num_clients {
            info!("all {} clients joined", self.config.num_clients);
            self.open_round(0);
        }
        JoinResponse::Accept(token)
    }

    /// Handle a request for the round state from the given rank.
    pub fn round(&self, token: Token) -> RoundState {
        let member = match self.members.get(&token) {
            Some(member) => member,
            None => return RoundState::Reject,
        };
        match self.phase {
            Phase::Gathering | Phase::Aggregating(_) => RoundState::StandBy,
            Phase::Training(round) => {
                if member.clients.iter().all(|c| self.received.contains(c)) {
                    RoundState::StandBy
                } else {
                    RoundState::Train(round)
                }
            }
            Phase::Finished => RoundState::Finish,
        }
    }

    /// Handle a submission of updates of `round` for the given clients.
    pub fn submit(&mut self, token: Token, round: u32, clients: &[ClientId]) -> SubmitResponse {
        let member = match self.members.get(&token) {
            Some(member) => member,
            None => return SubmitResponse::Reject("unknown token".to_string()),
        };
        debug!("rank {} submits {} updates for round {}", member.rank, clients.len(), round);
        match self.phase {
            Phase::Training(current) if current == round => {}
            phase => {
                warn!("rank {} submitted updates of round {} during {:?}", member.rank, round, phase);
                return SubmitResponse::Reject(format!("round {} is not open for updates", round));
            }
        }

        let mut submitted = HashSet::new();
        for client in clients {
            if !member.clients.contains(client) {
                return SubmitResponse::Reject(format!(
                    "client {} does not belong to rank {}",
                    client, member.rank
                ));
            }
            if self.received.contains(client) || !submitted.insert(*client) {
                return SubmitResponse::Reject(format!(
                    "duplicate update for client {} in round {}",
                    client, round
                ));
            }
        }
        self.received.extend(submitted);

        if self.received.len() == self.config.num_clients {
            info!("round {} complete", round);
            self.phase = Phase::Aggregating(round);
            self.emit_event(Event::RunAggregation(round));
        }
        SubmitResponse::Accept
    }

    /// The aggregation of the current round is done.
    pub fn end_aggregation(&mut self) {
        let round = match self.phase {
            Phase::Aggregating(round) => round,
            phase => {
                error!("not waiting for aggregation ({:?})", phase);
                return;
            }
        };
        self.open_round(round + 1);
    }

    /// Handle the acknowledgment of the final model by a rank.
    ///
    /// Returns whether the acknowledgment is accepted.
    pub fn finished(&mut self, token: Token) -> bool {
        if self.phase != Phase::Finished {
            return false;
        }
        let member = match self.members.get_mut(&token) {
            Some(member) => member,
            None => return false,
        };
        if !member.finished {
            info!("rank {} is done", member.rank);
            member.finished = true;
            self.acknowledged += 1;
            if self.acknowledged == self.config.ranks {
                self.emit_event(Event::Shutdown);
            }
        }
        true
    }

    /// Retrieve the next event
    pub fn next_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    fn open_round(&mut self, round: u32) {
        self.received.clear();
        if round >= self.config.rounds {
            info!("training complete");
            self.phase = Phase::Finished;
        } else {
            self.phase = Phase::Training(round);
            self.emit_event(Event::StartRound(round));
        }
    }

    /// Emit an event
    fn emit_event(&mut self, event: Event) {
        self.events.push_back(event);
    }
}
