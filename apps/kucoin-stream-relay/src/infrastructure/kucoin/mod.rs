//! KuCoin Upstream Adapters
//!
//! Everything that talks to KuCoin's public market feed:
//!
//! - **Bootstrap**: REST calls for the connection token and symbol listing
//! - **Sessions**: WebSocket dial, welcome, subscribe, keepalive
//! - **Pipeline**: topic classification, decoding and publication

pub mod bootstrap;
pub mod classifier;
pub mod codec;
pub mod feed;
pub mod heartbeat;
pub mod messages;
pub mod pipeline;
pub mod reconnect;
pub mod session;

pub use bootstrap::{BootstrapError, BulletToken, KucoinRestClient, catalog_from_symbols};
pub use classifier::{FrameKind, classify, classify_topic};
pub use codec::{DecodeError, FrameDecoder};
pub use feed::{
    FeedCommand, FeedConnector, FeedError, FeedSession, FeedSessionConfig, FeedSnapshot,
    FeedState, SessionState,
};
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, SessionActivity};
pub use pipeline::{FeedPipeline, FrameOutcome, PipelineStats};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use session::{
    ConnectionError, RawFrame, SessionReader, SessionWriter, SubscribeError, UpstreamSession,
};
