//! Configuration Module
//!
//! Configuration loading for the relay service.

mod settings;

pub use settings::{
    BroadcastSettings, ConfigError, DEFAULT_REST_URL, RelayConfig, ServerSettings,
    UpstreamSettings,
};
