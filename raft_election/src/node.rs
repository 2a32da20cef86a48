//! Hosts one election engine per OS thread and exposes the service-facing
//! surface: construction, state queries, command submission, shutdown.

use crate::common::*;
use crate::election::{Action, Event, FirstElectionTimeout, Node};
use crate::rpc::RpcMessage;
use crate::system_clock;
use rand_chacha::ChaCha8Rng;

use std::collections::HashSet;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, RwLock};
use std::thread;

use tracing::{error, info, trace};

#[derive(Debug, Clone, Copy)]
pub enum RaftNodeState {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone, Copy)]
pub struct RaftStateEvent {
    pub server_id: ServerId,
    pub current_state: RaftNodeState,
    pub current_term: TermIndex,
    pub voted_for: Option<ServerId>,
    pub leader_for_term: Option<ServerId>,
}

/// Receives a state snapshot after every iteration of a node's control loop.
/// Test harnesses use this to watch the cluster; production callers usually
/// want [`NoOpRaftEventCollector`].
pub trait RaftStateEventCollector: Send {
    fn push_event(&mut self, event: RaftStateEvent);
}

#[derive(Debug, Clone, Copy)]
pub struct NoOpRaftEventCollector;
impl RaftStateEventCollector for NoOpRaftEventCollector {
    fn push_event(&mut self, _event: RaftStateEvent) {}
}

/// A committed log entry handed to the application. Nothing is sent on the
/// apply channel until log replication sits on top of this crate; the sink
/// is accepted at construction so the interface doesn't change underneath
/// callers when it does.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ApplyMsg {
    pub index: u64,
    pub command: Vec<u8>,
}

/// Result of submitting a command. Until log replication exists no index is
/// ever assigned; `is_leader` reports whether this peer could accept the
/// command at all.
#[derive(Debug, Clone, Copy)]
pub struct SubmitOutcome {
    pub index: Option<u64>,
    pub term: TermIndex,
    pub is_leader: bool,
}

struct SharedNodeState {
    snapshot: RwLock<RaftStateEvent>,
    stop: AtomicBool,
}

/// Owner's handle to a running election engine.
pub struct RaftHandle {
    server_id: ServerId,
    shared: Arc<SharedNodeState>,
    join: Option<thread::JoinHandle<()>>,
}

impl RaftHandle {
    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    /// The current term and whether this peer believes it is the leader.
    pub fn current_state(&self) -> (TermIndex, bool) {
        let snapshot = self.state_snapshot();
        (
            snapshot.current_term,
            matches!(snapshot.current_state, RaftNodeState::Leader),
        )
    }

    /// The full state snapshot published by the last control loop iteration.
    pub fn state_snapshot(&self) -> RaftStateEvent {
        *self
            .shared
            .snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The leader this peer currently recognizes, if any.
    pub fn observed_leader(&self) -> Option<ServerId> {
        self.state_snapshot().leader_for_term
    }

    /// Asks the cluster to agree on a command. Stubbed until log replication
    /// lands: no index is assigned, and a non-leader reports that it could
    /// not accept the command.
    pub fn submit(&self, _command: Vec<u8>) -> SubmitOutcome {
        let (term, is_leader) = self.current_state();
        SubmitOutcome {
            index: None,
            term,
            is_leader,
        }
    }

    /// Whether the control loop has exited (shutdown, transport loss, or a
    /// storage failure).
    pub fn is_finished(&self) -> bool {
        self.join
            .as_ref()
            .map(|join| join.is_finished())
            .unwrap_or(true)
    }

    /// Unparks the node thread if it is parked in its transport wait. Only
    /// transports that park the thread (the simulator does) need this.
    pub fn unpark(&self) {
        if let Some(join) = &self.join {
            join.thread().unpark();
        }
    }

    /// Stops the node and waits for its thread to exit. The loop notices the
    /// stop request at its next suspension point, so this returns after at
    /// most one transport wait. Panics from the node thread are propagated.
    pub fn shutdown(mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            join.thread().unpark();
            if let Err(panic) = join.join() {
                panic::resume_unwind(panic);
            }
        }
    }
}

impl Drop for RaftHandle {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(join) = &self.join {
            join.thread().unpark();
        }
    }
}

impl std::fmt::Debug for RaftHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftHandle")
            .field("server_id", &self.server_id)
            .finish()
    }
}

fn role_of(node: &Node) -> RaftNodeState {
    match node {
        Node::Follower(_) => RaftNodeState::Follower,
        Node::Candidate(_) => RaftNodeState::Candidate,
        Node::Leader(_) => RaftNodeState::Leader,
    }
}

fn leader_seen_by(node: &Node, server_id: ServerId) -> Option<ServerId> {
    match node {
        Node::Leader(_) => Some(server_id),
        Node::Follower(follower) => follower.inner.leader_id,
        Node::Candidate(_) => None,
    }
}

/// Starts an election engine for `peers[me]` on its own thread and returns
/// immediately. `peers` is the cluster's ordered id list, identical on every
/// peer; `peers[me]` is this peer and is never contacted as a remote. The
/// engine recovers its term and vote from `storage` before doing anything
/// else. Give every peer its own RNG stream: peers drawing identical timeout
/// sequences can deadlock elections.
pub fn start_node(
    peers: &[ServerId],
    me: usize,
    mut storage: impl PersistentStorage + 'static,
    config: RaftConfig,
    mut rng: ChaCha8Rng,
    mut transport: impl RaftTransportConnector + 'static,
    apply_tx: mpsc::Sender<ApplyMsg>,
    mut event_collector: impl RaftStateEventCollector + 'static,
) -> RaftHandle {
    config.validate();
    assert!(me < peers.len(), "peer index {me} out of range");
    let server_id = peers[me];
    let other_servers: HashSet<ServerId> = peers
        .iter()
        .copied()
        .filter(|peer| *peer != server_id)
        .collect();
    assert_eq!(
        other_servers.len(),
        peers.len() - 1,
        "peer ids must be distinct"
    );

    let shared = Arc::new(SharedNodeState {
        snapshot: RwLock::new(RaftStateEvent {
            server_id,
            current_state: RaftNodeState::Follower,
            current_term: storage.current_term(),
            voted_for: storage.voted_for(),
            leader_for_term: None,
        }),
        stop: AtomicBool::new(false),
    });

    let thread_shared = Arc::clone(&shared);
    let join = thread::spawn(move || {
        // Held open for the replication layer; nothing is sent on it yet.
        let _apply_sink = apply_tx;

        let (mut node, FirstElectionTimeout(first_timeout)) =
            Node::new(server_id, other_servers, &config, &mut rng);
        info!(
            "{:?}: starting election engine as follower in term {:?}",
            server_id,
            storage.current_term(),
        );

        let mut wait_budget = first_timeout;
        'control: loop {
            if thread_shared.stop.load(Ordering::Acquire) {
                info!("{:?}: stop requested, shutting down", server_id);
                break 'control;
            }

            let waited_from = system_clock::now();
            let maybe_message = match transport.wait_for_next_incoming_message(wait_budget) {
                Ok(maybe_message) => maybe_message,
                Err(RaftTransportError::TransportShutdown) => {
                    info!("{:?}: transport shut down, exiting", server_id);
                    break 'control;
                }
            };
            if thread_shared.stop.load(Ordering::Acquire) {
                info!("{:?}: stop requested, shutting down", server_id);
                break 'control;
            }
            wait_budget = wait_budget.saturating_sub(waited_from.elapsed());

            let (next, mut actions) =
                match node.next(Event::Tick(system_clock::now()), &mut storage, &config, &mut rng)
                {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        error!("{:?}: storage failure ({err}), exiting", server_id);
                        break 'control;
                    }
                };
            node = next;

            if let Some(message) = maybe_message {
                trace!("{:?}: handling {:?}", server_id, message);
                let (next, mut more_actions) =
                    match node.next(Event::IncomingRpc(message), &mut storage, &config, &mut rng) {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            error!("{:?}: storage failure ({err}), exiting", server_id);
                            break 'control;
                        }
                    };
                node = next;
                actions.append(&mut more_actions);
            }

            for action in actions {
                match action {
                    Action::OutgoingRpc(RpcMessage::Request(request)) => {
                        if transport.enqueue_outgoing_request(request).is_err() {
                            info!("{:?}: transport shut down, exiting", server_id);
                            break 'control;
                        }
                    }
                    Action::OutgoingRpc(RpcMessage::Reply(reply)) => {
                        if transport.enqueue_reply(reply).is_err() {
                            info!("{:?}: transport shut down, exiting", server_id);
                            break 'control;
                        }
                    }
                    Action::SetNextTimeout(timer_duration) => {
                        trace!("{:?}: next timer in {:?}", server_id, timer_duration);
                        wait_budget = timer_duration;
                    }
                }
            }

            let event = RaftStateEvent {
                server_id,
                current_state: role_of(&node),
                current_term: storage.current_term(),
                voted_for: storage.voted_for(),
                leader_for_term: leader_seen_by(&node, server_id),
            };
            {
                let mut snapshot = thread_shared
                    .snapshot
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                *snapshot = event;
            }
            event_collector.push_event(event);
        }
    });

    RaftHandle {
        server_id,
        shared,
        join: Some(join),
    }
}
