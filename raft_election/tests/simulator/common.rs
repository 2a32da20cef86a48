use lazy_static::lazy_static;
use mock_instant::MockClock;
use raft_election::rpc::RpcMessage;
use raft_election::ServerId;
use std::collections::HashSet;
use std::ops::Add;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

lazy_static! {
    static ref CLOCK_MUTEX: Mutex<()> = Mutex::new(());
}

/// The mock clock is a process-wide singleton; tests that drive it hold this
/// guard so they cannot interleave.
pub(crate) fn clock_guard() -> MutexGuard<'static, ()> {
    CLOCK_MUTEX.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(PartialEq, Eq, Debug, Clone, Copy, PartialOrd, Ord, Hash)]
pub(crate) struct SimTime(pub(crate) Duration);
impl SimTime {
    pub(crate) fn checked_sub(&self, other: &Self) -> Option<Duration> {
        self.0.checked_sub(other.0)
    }

    pub(crate) fn from_millis(millis: u64) -> Self {
        SimTime(Duration::from_millis(millis))
    }

    pub(crate) fn as_millis(&self) -> u128 {
        self.0.as_millis()
    }

    pub(crate) fn now() -> Self {
        SimTime(MockClock::time())
    }
}

impl Add<Duration> for SimTime {
    type Output = Self;
    fn add(self, rhs: Duration) -> Self::Output {
        SimTime(self.0 + rhs)
    }
}
impl From<Duration> for SimTime {
    fn from(duration: Duration) -> Self {
        SimTime(duration)
    }
}
impl From<SimTime> for Duration {
    fn from(time: SimTime) -> Self {
        time.0
    }
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub(crate) enum SimulatorAction {
    SendOverNetwork(RpcMessage),
    PartitionNetwork(Vec<HashSet<ServerId>>),
    HealNetworkPartition,
    FailNextIOOperation,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub(crate) struct SimulatorEvent {
    pub(crate) time: SimTime,
    pub(crate) action: SimulatorAction,
}
impl PartialOrd for SimulatorEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for SimulatorEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.time.0.cmp(&other.time.0)
    }
}

/// A node thread's request to be woken no later than the given simulated
/// instant, registered every time it begins a transport wait.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash)]
pub(crate) struct WakeUpAtOrBefore(pub(crate) SimTime);
