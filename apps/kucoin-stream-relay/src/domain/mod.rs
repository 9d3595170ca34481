//! Domain Layer - Market event types and topic bookkeeping.
//!
//! Pure types with no I/O: the events the relay forwards, the upstream
//! topics they arrive on, and the reference counting that decides which
//! topics must be subscribed.

/// Ticker and candle event types.
pub mod market;

/// Upstream topic naming and candle intervals.
pub mod topic;

/// Reference-counted upstream topic demand.
pub mod subscription;
