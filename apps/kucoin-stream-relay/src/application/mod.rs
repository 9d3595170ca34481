//! Application Layer - Port definitions.
//!
//! The seams between the feed pipeline, the broadcast pool and the upstream
//! sessions. Infrastructure adapters implement these traits; tests swap in
//! mocks.

/// Port interfaces for event delivery and upstream topic control.
pub mod ports;
