//! Leader election for a cluster of statically known peers, following the
//! election and term-management portion of the Raft consensus protocol.
//! See: <https://raft.github.io/raft.pdf> for details.
//!
//! Each peer runs a single election engine: a pure state machine driven by
//! timer ticks and incoming RPCs, hosted on its own thread. Log replication,
//! snapshotting, and the concrete network transport are left to the layers
//! around this crate; the transport and persistence seams are traits.
#[deny(
    bad_style,
    dead_code,
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    overflowing_literals,
    path_statements,
    patterns_in_fns_without_body,
    unconditional_recursion,
    unused,
    unused_allocation,
    unused_comparisons,
    unused_parens,
    while_true,
    missing_debug_implementations,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results
)]
mod common;
mod election;
mod node;
pub mod rpc;
mod storage;
pub mod system_clock;


pub use common::PersistentStorage;
pub use common::PersistentStorageError;
pub use common::RaftConfig;
pub use common::RaftTransportConnector;
pub use common::RaftTransportError;
pub use common::ServerId;
pub use common::TermIndex;
pub use node::start_node;
pub use node::ApplyMsg;
pub use node::NoOpRaftEventCollector;
pub use node::RaftHandle;
pub use node::RaftNodeState;
pub use node::RaftStateEvent;
pub use node::RaftStateEventCollector;
pub use node::SubmitOutcome;
pub use rpc::*;
pub use storage::FilePersistentStorage;
pub use storage::InMemoryStorage;
