use self::role_defs::*;

/// The election state machine. Consumes timer ticks and inbound RPCs,
/// produces outbound RPCs and timer re-arms; all role, term, and vote
/// changes flow through here.
use crate::common::*;
use crate::rpc::*;
use crate::system_clock;
use crate::system_clock::Instant;
use divrem::DivCeil;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, trace};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub(crate) enum Event {
    Tick(Instant),
    IncomingRpc(RpcMessage),
}

#[derive(Debug, Clone)]
pub(crate) enum Action {
    SetNextTimeout(Duration),
    OutgoingRpc(RpcMessage),
}

#[derive(Debug, Clone)]
pub(crate) enum Node {
    Leader(NodeState<Leader>),
    Follower(NodeState<Follower>),
    Candidate(NodeState<Candidate>),
}

impl Node {
    pub(crate) fn new(
        server_id: ServerId,
        other_servers: HashSet<ServerId>,
        config: &RaftConfig,
        rng: &mut ChaCha8Rng,
    ) -> (Self, FirstElectionTimeout) {
        let (initial_state, first_timer) =
            NodeState::<Follower>::new(server_id, other_servers, config, rng);

        (initial_state.into(), first_timer)
    }

    fn server_id(&self) -> ServerId {
        match self {
            Node::Leader(state) => state.server_id,
            Node::Follower(state) => state.server_id,
            Node::Candidate(state) => state.server_id,
        }
    }

    fn update_clock(&mut self) {
        match self {
            Node::Leader(state) => state.current_time = system_clock::now(),
            Node::Follower(state) => state.current_time = system_clock::now(),
            Node::Candidate(state) => state.current_time = system_clock::now(),
        }
    }

    /// Any message carrying a term newer than ours demotes us to follower in
    /// that term before the message itself is handled. This holds for
    /// requests and replies alike.
    fn demote_if_message_has_higher_term(
        self,
        storage: &mut impl PersistentStorage,
        event: &Event,
        config: &RaftConfig,
        rng: &mut ChaCha8Rng,
    ) -> Result<(Self, Vec<Action>), PersistentStorageError> {
        let (observed_newer_term, new_term) = match event {
            Event::IncomingRpc(RpcMessage::Request(r)) => {
                (r.term() > storage.current_term(), r.term())
            }
            Event::IncomingRpc(RpcMessage::Reply(r)) => {
                (r.term() > storage.current_term(), r.term())
            }
            _ => (false, storage.current_term()),
        };

        if observed_newer_term {
            info!(
                "{:?}: becoming follower, observed term {:?} newer than ours {:?}",
                self.server_id(),
                new_term,
                storage.current_term()
            );
            storage.update_term(new_term).sync()?;
            let mut follower_state: NodeState<Follower> = match self {
                Node::Leader(state) => state.transition_to(),
                Node::Follower(state) => state,
                Node::Candidate(state) => state.transition_to(),
            };

            // Whoever leads the new term (if anyone yet) will introduce
            // itself with a heartbeat.
            follower_state.inner.leader_id = None;
            let election_timeout = follower_state.reset_election_timer(config, rng);
            Ok((
                follower_state.into(),
                vec![Action::SetNextTimeout(election_timeout)],
            ))
        } else {
            Ok((self, vec![]))
        }
    }

    pub(crate) fn next(
        mut self,
        event: Event,
        storage: &mut impl PersistentStorage,
        config: &RaftConfig,
        rng: &mut ChaCha8Rng,
    ) -> Result<(Self, Vec<Action>), PersistentStorageError> {
        self.update_clock();

        self.demote_if_message_has_higher_term(storage, &event, config, rng)
            .and_then(|(node, mut demotion_timer)| {
                let (node, mut actions) = match node {
                    Self::Leader(state) => state.handle_event(event, storage, config, rng)?,
                    Self::Follower(state) => state.handle_event(event, storage, config, rng)?,
                    Self::Candidate(state) => state.handle_event(event, storage, config, rng)?,
                };

                actions.append(&mut demotion_timer);
                Ok((node, actions))
            })
    }
}

impl From<NodeState<Leader>> for Node {
    fn from(state: NodeState<Leader>) -> Self {
        Node::Leader(state)
    }
}
impl From<NodeState<Follower>> for Node {
    fn from(state: NodeState<Follower>) -> Self {
        Node::Follower(state)
    }
}
impl From<NodeState<Candidate>> for Node {
    fn from(state: NodeState<Candidate>) -> Self {
        Node::Candidate(state)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct NodeState<S: State> {
    server_id: ServerId,
    current_time: Instant,
    other_servers: HashSet<ServerId>,
    pub(crate) inner: S,
}

trait Transitions {
    fn handle_event(
        self,
        event: Event,
        storage: &mut impl PersistentStorage,
        config: &RaftConfig,
        rng: &mut ChaCha8Rng,
    ) -> Result<(Node, Vec<Action>), PersistentStorageError>;
}

trait CanTransitionTo<NewState: State> {
    fn transition_to(self) -> NodeState<NewState>;
}

trait ElectionTimer {
    fn reset_election_timer(&mut self, config: &RaftConfig, rng: &mut ChaCha8Rng) -> Duration;
}
macro_rules! has_election_timer {
    ($state:ident) => {
        impl ElectionTimer for NodeState<$state> {
            fn reset_election_timer(
                &mut self,
                config: &RaftConfig,
                rng: &mut ChaCha8Rng,
            ) -> Duration {
                let election_timeout = Duration::from_millis(rng.gen_range(
                    config.min_election_timeout_ms.into()..config.max_election_timeout_ms.into(),
                ));

                self.inner.election_timeout = election_timeout;
                self.inner.last_election_timer_started = system_clock::now();

                election_timeout
            }
        }
    };
}

mod role_defs {
    use crate::common::ServerId;
    use crate::system_clock;
    use crate::system_clock::Instant;

    use std::collections::HashSet;
    use std::fmt::Debug;
    use std::time::Duration;

    #[derive(Debug, Clone)]
    struct Priv {}

    pub(crate) trait State: Debug {}

    #[derive(Debug, Clone)]
    pub(crate) struct Leader {
        pub(crate) last_heartbeat_sent: Instant,
        _priv: Priv,
    }
    impl State for Leader {}
    impl From<Candidate> for Leader {
        fn from(_: Candidate) -> Self {
            Leader {
                last_heartbeat_sent: system_clock::now(),
                _priv: Priv {},
            }
        }
    }

    #[derive(Debug, Clone)]
    pub(crate) struct Candidate {
        pub(crate) last_election_timer_started: Instant,
        pub(crate) election_timeout: Duration,
        pub(crate) votes_received: HashSet<ServerId>,
        _priv: Priv,
    }
    impl State for Candidate {}
    impl From<Follower> for Candidate {
        fn from(_: Follower) -> Self {
            Candidate {
                last_election_timer_started: system_clock::now(),
                election_timeout: Duration::from_millis(0),
                votes_received: HashSet::new(),
                _priv: Priv {},
            }
        }
    }

    #[derive(Debug, Clone)]
    pub(crate) struct Follower {
        pub(crate) last_election_timer_started: Instant,
        pub(crate) election_timeout: Duration,
        pub(crate) leader_id: Option<ServerId>,
        _priv: Priv,
    }
    impl Follower {
        pub(crate) fn new() -> Self {
            Follower {
                last_election_timer_started: system_clock::now(),
                election_timeout: Duration::from_millis(0),
                leader_id: None,
                _priv: Priv {},
            }
        }
    }
    impl State for Follower {}
    impl From<Leader> for Follower {
        fn from(_: Leader) -> Self {
            Follower {
                last_election_timer_started: system_clock::now(),
                election_timeout: Duration::from_millis(0),
                leader_id: None,
                _priv: Priv {},
            }
        }
    }
    impl From<Candidate> for Follower {
        fn from(candidate: Candidate) -> Self {
            Follower {
                last_election_timer_started: system_clock::now(),
                election_timeout: candidate.election_timeout,
                leader_id: None,
                _priv: Priv {},
            }
        }
    }
}

impl<St: State> NodeState<St> {
    /// Votes needed to lead: strictly more than half the cluster.
    fn majority(&self) -> usize {
        let cluster_size = self.other_servers.len() + 1;
        DivCeil::div_ceil(cluster_size + 1, 2)
    }

    fn ack_append_entries(
        &self,
        storage: &impl PersistentStorage,
        append_entries_req: AppendEntries,
        success: bool,
    ) -> Vec<Action> {
        vec![Action::OutgoingRpc(RpcMessage::ack_append_entries(
            AppendEntriesAck {
                request_id: append_entries_req.request_id,
                from: self.server_id,
                to: append_entries_req.leader_id,
                term: storage.current_term(),
                success,
            },
        ))]
    }

    fn vote_no(
        &self,
        storage: &impl PersistentStorage,
        vote_req: RequestVote,
        reason: &str,
    ) -> Vec<Action> {
        debug!(
            "{server_id:?}: vote NO for candidate {candidate_id:?} because {reason:?} (my term: {my_term:?}, vote term: {candidate_term:?})",
            server_id = self.server_id,
            candidate_id = vote_req.candidate_id,
            reason = reason,
            my_term = storage.current_term(),
            candidate_term = vote_req.term,
        );
        vec![Action::OutgoingRpc(RpcMessage::vote(Vote {
            request_id: vote_req.request_id,
            from: self.server_id,
            to: vote_req.candidate_id,
            term: storage.current_term(),
            granted: false,
        }))]
    }
}

impl NodeState<Leader> {
    fn broadcast_heartbeat(
        &mut self,
        storage: &impl PersistentStorage,
        config: &RaftConfig,
    ) -> Vec<Action> {
        trace!(
            "{server_id:?}: sending heartbeat to cluster",
            server_id = self.server_id
        );

        let mut actions: Vec<Action> = self
            .other_servers
            .iter()
            .map(|other_server| {
                Action::OutgoingRpc(RpcMessage::append_entries(AppendEntries {
                    request_id: Uuid::new_v4(),
                    leader_id: self.server_id,
                    to: *other_server,
                    term: storage.current_term(),
                }))
            })
            .collect();

        self.inner.last_heartbeat_sent = self.current_time;
        actions.push(Action::SetNextTimeout(config.leader_heartbeat_interval));
        actions
    }
}

impl Transitions for NodeState<Leader> {
    fn handle_event(
        mut self,
        event: Event,
        storage: &mut impl PersistentStorage,
        config: &RaftConfig,
        _: &mut ChaCha8Rng,
    ) -> Result<(Node, Vec<Action>), PersistentStorageError> {
        match event {
            Event::Tick(now) => {
                let maybe_heartbeat =
                    if now >= self.inner.last_heartbeat_sent + config.leader_heartbeat_interval {
                        self.broadcast_heartbeat(storage, config)
                    } else {
                        vec![]
                    };

                Ok((self.into(), maybe_heartbeat))
            }

            Event::IncomingRpc(RpcMessage::Request(rpc_req)) => match rpc_req {
                Request::RequestVote(req) => {
                    let vote = self.vote_no(storage, req, "I am already leading this term");
                    Ok((self.into(), vote))
                }

                Request::AppendEntries(req) => {
                    if req.term == storage.current_term() {
                        unreachable!("two leaders elected in the same term")
                    } else if req.term < storage.current_term() {
                        let ack = self.ack_append_entries(storage, req, false);
                        Ok((self.into(), ack))
                    } else {
                        unreachable!("a newer term must demote a leader before dispatch")
                    }
                }
            },

            // Stale acks and votes; anything term-raising was already handled.
            Event::IncomingRpc(RpcMessage::Reply(_)) => Ok((self.into(), vec![])),
        }
    }
}

has_election_timer!(Candidate);
impl NodeState<Candidate> {
    fn start_new_election(
        &mut self,
        config: &RaftConfig,
        storage: &mut impl PersistentStorage,
        rng: &mut ChaCha8Rng,
    ) -> Result<Vec<Action>, PersistentStorageError> {
        trace!(
            "{server_id:?}: starting new election",
            server_id = self.server_id
        );
        // Term bump and self-vote hit disk before any vote request leaves.
        storage
            .update_term(storage.current_term().next())
            .record_vote(self.server_id)
            .sync()?;

        let election_timeout = self.reset_election_timer(config, rng);
        self.inner.votes_received = HashSet::new();
        let _ = self.inner.votes_received.insert(self.server_id);

        let mut actions = vec![Action::SetNextTimeout(election_timeout)];
        for other_server in self.other_servers.iter() {
            actions.push(Action::OutgoingRpc(RpcMessage::request_vote(RequestVote {
                request_id: Uuid::new_v4(),
                candidate_id: self.server_id,
                to: *other_server,
                term: storage.current_term(),
            })));
        }
        Ok(actions)
    }

    /// Starts a fresh candidacy, then settles the one-peer-cluster case: the
    /// self-vote alone can already be a majority, and no reply will ever
    /// arrive to tell us so.
    fn begin_candidacy(
        mut self,
        config: &RaftConfig,
        storage: &mut impl PersistentStorage,
        rng: &mut ChaCha8Rng,
    ) -> Result<(Node, Vec<Action>), PersistentStorageError> {
        let mut actions = self.start_new_election(config, storage, rng)?;

        if self.inner.votes_received.len() >= self.majority() {
            info!(
                "{server_id:?}: won election uncontested, becoming leader in term {term:?}",
                server_id = self.server_id,
                term = storage.current_term()
            );
            let mut leader_state: NodeState<Leader> = self.transition_to();
            actions.append(&mut leader_state.broadcast_heartbeat(storage, config));
            Ok((leader_state.into(), actions))
        } else {
            Ok((self.into(), actions))
        }
    }
}

impl Transitions for NodeState<Candidate> {
    fn handle_event(
        mut self,
        event: Event,
        storage: &mut impl PersistentStorage,
        config: &RaftConfig,
        rng: &mut ChaCha8Rng,
    ) -> Result<(Node, Vec<Action>), PersistentStorageError> {
        match event {
            Event::Tick(now) => {
                if now
                    >= self.inner.last_election_timer_started + self.inner.election_timeout
                {
                    trace!(
                        "{server_id:?}: candidacy timed out after {timeout:?}ms without a quorum, starting new election",
                        server_id = self.server_id,
                        timeout = self.inner.election_timeout.as_millis()
                    );
                    self.begin_candidacy(config, storage, rng)
                } else {
                    Ok((self.into(), vec![]))
                }
            }

            Event::IncomingRpc(RpcMessage::Request(rpc_req)) => match rpc_req {
                Request::RequestVote(req) => {
                    let vote_no_reason = if req.term < storage.current_term() {
                        "the request is from an older term"
                    } else {
                        "I am campaigning for the same term myself"
                    };
                    let vote = self.vote_no(storage, req, vote_no_reason);
                    Ok((self.into(), vote))
                }

                Request::AppendEntries(req) => {
                    if req.term < storage.current_term() {
                        let ack = self.ack_append_entries(storage, req, false);
                        Ok((self.into(), ack))
                    } else if req.term == storage.current_term() {
                        // Someone else won this term; fall in line behind them.
                        let mut follower_state: NodeState<Follower> = self.transition_to();
                        follower_state.inner.leader_id = Some(req.leader_id);
                        let election_timeout = follower_state.reset_election_timer(config, rng);
                        let mut actions = follower_state.ack_append_entries(storage, req, true);
                        actions.push(Action::SetNextTimeout(election_timeout));
                        Ok((follower_state.into(), actions))
                    } else {
                        unreachable!("a newer term must demote a candidate before dispatch")
                    }
                }
            },

            Event::IncomingRpc(RpcMessage::Reply(reply)) => match reply {
                ReplyTo::RequestVote(vote) => {
                    // Votes from an earlier candidacy no longer count.
                    if vote.term == storage.current_term() && vote.granted {
                        let _ = self.inner.votes_received.insert(vote.from);

                        if self.inner.votes_received.len() >= self.majority() {
                            info!(
                                "{server_id:?}: received vote from {from:?} and won election with {votes:?}, becoming leader in term {term:?}",
                                server_id = self.server_id,
                                from = vote.from,
                                votes = self.inner.votes_received,
                                term = storage.current_term()
                            );
                            let mut leader_state: NodeState<Leader> = self.transition_to();
                            let actions = leader_state.broadcast_heartbeat(storage, config);
                            Ok((leader_state.into(), actions))
                        } else {
                            debug!(
                                "{server_id:?}: received vote from {from:?}, still need {votes_needed:?} more to win term {term:?}",
                                server_id = self.server_id,
                                from = vote.from,
                                votes_needed = self.majority() - self.inner.votes_received.len(),
                                term = storage.current_term()
                            );
                            Ok((self.into(), vec![]))
                        }
                    } else {
                        Ok((self.into(), vec![]))
                    }
                }

                ReplyTo::AppendEntries(_) => Ok((self.into(), vec![])),
            },
        }
    }
}

pub(crate) struct FirstElectionTimeout(pub(crate) Duration);

has_election_timer!(Follower);
impl NodeState<Follower> {
    pub(crate) fn new(
        server_id: ServerId,
        other_servers: HashSet<ServerId>,
        config: &RaftConfig,
        rng: &mut ChaCha8Rng,
    ) -> (Self, FirstElectionTimeout) {
        let mut node_state = Self {
            current_time: system_clock::now(),
            server_id,
            other_servers,
            inner: Follower::new(),
        };
        let election_timeout = node_state.reset_election_timer(config, rng);
        (node_state, FirstElectionTimeout(election_timeout))
    }

    fn vote_in_election(
        &mut self,
        storage: &mut impl PersistentStorage,
        vote_req: RequestVote,
        config: &RaftConfig,
        rng: &mut ChaCha8Rng,
    ) -> Result<Vec<Action>, PersistentStorageError> {
        // One vote per term: grant to the first candidate asking, and keep
        // granting to that same candidate if the request is redelivered.
        let granted = match storage.voted_for() {
            None => true,
            Some(recorded_vote) => recorded_vote == vote_req.candidate_id,
        };

        let mut actions = Vec::new();
        if granted {
            info!(
                "{server_id:?}: voting for candidate {candidate_id:?} in term {term:?}",
                server_id = self.server_id,
                candidate_id = vote_req.candidate_id,
                term = vote_req.term
            );
            storage.record_vote(vote_req.candidate_id).sync()?;
            // Granting a vote counts as hearing from the cluster.
            let election_timeout = self.reset_election_timer(config, rng);
            actions.push(Action::SetNextTimeout(election_timeout));
        } else {
            debug!(
                "{server_id:?}: vote NO for candidate {candidate_id:?}, already voted for {recorded:?} in term {term:?}",
                server_id = self.server_id,
                candidate_id = vote_req.candidate_id,
                recorded = storage.voted_for(),
                term = storage.current_term()
            );
        }

        actions.push(Action::OutgoingRpc(RpcMessage::vote(Vote {
            request_id: vote_req.request_id,
            from: self.server_id,
            to: vote_req.candidate_id,
            term: storage.current_term(),
            granted,
        })));
        Ok(actions)
    }
}

impl Transitions for NodeState<Follower> {
    fn handle_event(
        mut self,
        event: Event,
        storage: &mut impl PersistentStorage,
        config: &RaftConfig,
        rng: &mut ChaCha8Rng,
    ) -> Result<(Node, Vec<Action>), PersistentStorageError> {
        match event {
            Event::Tick(now) => {
                if now >= self.inner.last_election_timer_started + self.inner.election_timeout
                {
                    info!(
                        "{server_id:?}: no heartbeat within {timeout:?}ms, becoming candidate",
                        server_id = self.server_id,
                        timeout = self.inner.election_timeout.as_millis(),
                    );
                    let new_state: NodeState<Candidate> = self.transition_to();
                    new_state.begin_candidacy(config, storage, rng)
                } else {
                    Ok((self.into(), vec![]))
                }
            }

            Event::IncomingRpc(RpcMessage::Request(rpc_req)) => match rpc_req {
                Request::RequestVote(req) => {
                    if req.term < storage.current_term() {
                        let vote = self.vote_no(storage, req, "the request is from an older term");
                        Ok((self.into(), vote))
                    } else {
                        let vote = self.vote_in_election(storage, req, config, rng)?;
                        Ok((self.into(), vote))
                    }
                }

                Request::AppendEntries(req) => {
                    if req.term < storage.current_term() {
                        // A deposed leader must not keep us from electing a
                        // live one: no timer reset here.
                        let ack = self.ack_append_entries(storage, req, false);
                        Ok((self.into(), ack))
                    } else {
                        self.inner.leader_id = Some(req.leader_id);
                        let election_timeout = self.reset_election_timer(config, rng);
                        let mut actions = self.ack_append_entries(storage, req, true);
                        actions.push(Action::SetNextTimeout(election_timeout));
                        Ok((self.into(), actions))
                    }
                }
            },

            // Followers don't send requests; any reply reaching us is a
            // leftover from an earlier role and was term-checked above.
            Event::IncomingRpc(RpcMessage::Reply(_)) => Ok((self.into(), vec![])),
        }
    }
}

impl<InState, OutState> CanTransitionTo<OutState> for NodeState<InState>
where
    InState: State,
    OutState: State + From<InState>,
{
    fn transition_to(self) -> NodeState<OutState> {
        NodeState {
            inner: self.inner.into(),
            server_id: self.server_id,
            current_time: self.current_time,
            other_servers: self.other_servers,
        }
    }
}
