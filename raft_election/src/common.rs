use crate::rpc::{ReplyTo, Request, RpcMessage};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::time::Duration;

#[derive(Eq, PartialEq, PartialOrd, Ord, Clone, Copy, Debug, Serialize, Deserialize, Hash)]
/// A unique identifier for a peer in the cluster.
pub struct ServerId(pub u64);

#[derive(
    Eq, PartialEq, PartialOrd, Ord, Clone, Copy, Debug, Default, Serialize, Deserialize, Hash,
)]
/// A leadership epoch. Terms only ever move forward on a given peer.
pub struct TermIndex(pub u64);
impl TermIndex {
    /// The term that follows this one.
    pub fn next(self) -> Self {
        TermIndex(self.0 + 1)
    }
}

#[derive(Debug, Clone, Copy)]
/// Timing parameters for a peer's election engine.
pub struct RaftConfig {
    /// How often an established leader asserts its authority with a heartbeat.
    pub leader_heartbeat_interval: Duration,
    /// Lower bound (inclusive) of the randomized election timeout, in milliseconds.
    pub min_election_timeout_ms: u32,
    /// Upper bound (exclusive) of the randomized election timeout, in milliseconds.
    pub max_election_timeout_ms: u32,
}

impl RaftConfig {
    /// Default heartbeat cadence for leaders.
    pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(50);
    /// Default lower bound of the election timeout range.
    pub const DEFAULT_MIN_ELECTION_TIMEOUT_MS: u32 = 150;
    /// Default upper bound (exclusive) of the election timeout range.
    pub const DEFAULT_MAX_ELECTION_TIMEOUT_MS: u32 = 300;

    /// Panics unless the timeouts can keep a live leader's followers quiet:
    /// the heartbeat interval must be strictly below the minimum election
    /// timeout, and the timeout range must be non-empty.
    pub fn validate(&self) {
        assert!(
            self.min_election_timeout_ms < self.max_election_timeout_ms,
            "election timeout range [{min}, {max}) is empty",
            min = self.min_election_timeout_ms,
            max = self.max_election_timeout_ms,
        );
        assert!(
            self.leader_heartbeat_interval
                < Duration::from_millis(u64::from(self.min_election_timeout_ms)),
            "heartbeat interval {interval:?} must be strictly below the minimum election timeout {min}ms",
            interval = self.leader_heartbeat_interval,
            min = self.min_election_timeout_ms,
        );
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            leader_heartbeat_interval: Self::DEFAULT_HEARTBEAT_INTERVAL,
            min_election_timeout_ms: Self::DEFAULT_MIN_ELECTION_TIMEOUT_MS,
            max_election_timeout_ms: Self::DEFAULT_MAX_ELECTION_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
/// Errors that can occur when interacting with the persistence layer.
pub enum PersistentStorageError {
    /// An error occurred while reading from or writing to disk.
    Io,
    /// The stored election record could not be encoded or decoded.
    Encoding,
}

impl fmt::Display for PersistentStorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistentStorageError::Io => write!(f, "storage I/O failure"),
            PersistentStorageError::Encoding => write!(f, "storage encoding failure"),
        }
    }
}
impl Error for PersistentStorageError {}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
/// Errors that can originate from the transport seam.
pub enum RaftTransportError {
    /// The transport was shut down and no further messages can move.
    TransportShutdown,
}

impl fmt::Display for RaftTransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaftTransportError::TransportShutdown => write!(f, "transport shut down"),
        }
    }
}
impl Error for RaftTransportError {}

/// Durable record of the election state a peer must never forget: its current
/// term and the vote it cast in that term. Implementations must make both
/// visible to `current_term`/`voted_for` after a crash once `sync` returned
/// `Ok`. A vote recorded for an earlier term is reported as no vote at all.
pub trait PersistentStorage: Send {
    /// The current term of this peer.
    fn current_term(&self) -> TermIndex;
    /// The peer this peer voted for in the current term, if any.
    fn voted_for(&self) -> Option<ServerId>;

    /// Moves the current term forward. Never called with a smaller term.
    fn update_term(&mut self, term: TermIndex) -> &mut Self;
    /// Records a vote for the current term.
    fn record_vote(&mut self, voted_for: ServerId) -> &mut Self;

    /// Flushes any pending changes to durable storage.
    fn sync(&mut self) -> Result<(), PersistentStorageError>;
}

/// The election engine's view of the network: a bidirectional, best-effort
/// message channel. Using a trait here lets tests substitute a simulated
/// network for a real one.
pub trait RaftTransportConnector: Send {
    /// Blocks for at most `max_wait` and returns the next inbound message,
    /// or `None` when the wait expired first.
    fn wait_for_next_incoming_message(
        &mut self,
        max_wait: Duration,
    ) -> Result<Option<RpcMessage>, RaftTransportError>;

    /// Enqueues a reply for delivery. Must not block on the receiving peer.
    fn enqueue_reply(&mut self, reply: ReplyTo) -> Result<(), RaftTransportError>;

    /// Enqueues a request for delivery. Must not block on the receiving peer.
    fn enqueue_outgoing_request(&mut self, request: Request) -> Result<(), RaftTransportError>;
}
