//! Monotonic clock indirection. The `mock_time` feature swaps in a mock
//! clock that tests can drive deterministically.

#[cfg(feature = "mock_time")]
pub use mock_instant::Instant;

#[cfg(not(feature = "mock_time"))]
pub use std::time::Instant;

/// Return the current monotonic clock time.
pub fn now() -> Instant {
    Instant::now()
}
