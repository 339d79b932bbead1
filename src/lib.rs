//! Forward-protocol output with phi-accrual node health tracking.
//!
//! A [`ForwardOutput`] ships [`Chunk`]s of MessagePack encoded events to one
//! of several weighted destination nodes, reporting the outcome of each
//! delivery through a [`CommitHandle`]. Nodes are probed by TCP or UDP
//! heartbeats feeding a [`PhiFailureDetector`]; suspect nodes are detached
//! until they answer again.

pub mod ack;
pub mod commit;
pub mod config;
pub mod detector;
pub mod error;
pub mod file_config;
pub mod handshake;
pub mod heartbeat;
pub mod node;
pub mod output;
pub mod protocol;
pub mod rate_limited_warner;
pub mod selector;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod test_support;

pub use commit::{ChunkOutcome, CommitHandle, commit_channel, commit_fn};
pub use config::{ForwardConfig, ForwardOutputBuilder, SecurityConfig, ServerBuilder, ServerConfig};
pub use detector::{DetectorConfig, PhiFailureDetector};
pub use error::{ConfigError, DeliveryError};
pub use handshake::{Acceptor, ClientCredentials, HandshakeError};
pub use heartbeat::{HeartbeatStrategy, HeartbeatType};
pub use node::{Node, NodeStatus};
pub use output::{DeliveryState, ForwardOutput};
pub use protocol::{Chunk, ChunkBuilder, ChunkId, Compression, EventTime, ForwardMessage, Record};
pub use selector::NodeSelector;
