//! Error types surfaced by configuration and delivery.
//!
//! Configuration problems are fatal at construction time; delivery problems
//! are local to a single chunk and always end in a rollback so the caller can
//! retry.

use std::io;

use thiserror::Error;

use crate::handshake::HandshakeError;

/// Errors raised while validating or loading a forward configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No `server` entries were configured.
    #[error("forward output requires at least one server")]
    NoServers,
    /// DNS round robin cannot be combined with UDP heartbeats because the
    /// heartbeat socket matches replies by address.
    #[error("dns_round_robin is not supported with heartbeat_type udp")]
    DnsRoundRobinWithUdp,
    /// Invalid user supplied configuration.
    #[error("invalid forward configuration: {0}")]
    Invalid(String),
    /// Underlying I/O error whilst reading configuration or opening sockets.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Reasons a chunk could not be delivered.
///
/// Every variant results in the chunk being rolled back exactly once.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Every configured node (standby included) is currently unavailable.
    #[error("no nodes are available")]
    NoAvailableNode,
    /// The TCP connection could not be established.
    #[error("failed to connect to {node}: {source}")]
    Connect {
        node: String,
        #[source]
        source: io::Error,
    },
    /// The shared-key handshake failed.
    #[error("authentication with {node} failed: {source}")]
    Authentication {
        node: String,
        #[source]
        source: HandshakeError,
    },
    /// Writing the chunk frame failed.
    #[error("failed to send chunk to {node}: {source}")]
    Write {
        node: String,
        #[source]
        source: io::Error,
    },
    /// The node did not acknowledge the chunk before the deadline.
    #[error("no ack response from {node} within the timeout")]
    AckTimeout { node: String },
    /// The connection closed while an ack was pending.
    #[error("connection to {node} closed before the ack arrived")]
    Disconnected { node: String },
    /// The node acknowledged a different chunk.
    #[error("ack from {node} did not match chunk {expected}: got {received}")]
    AckMismatch {
        node: String,
        expected: String,
        received: String,
    },
    /// A frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The output has been closed.
    #[error("forward output is closed")]
    Closed,
}

impl DeliveryError {
    /// Whether this failure should veto the node it was attempted against.
    pub fn vetoes_node(&self) -> bool {
        matches!(
            self,
            DeliveryError::Connect { .. }
                | DeliveryError::Authentication { .. }
                | DeliveryError::Write { .. }
                | DeliveryError::AckTimeout { .. }
                | DeliveryError::Disconnected { .. }
        )
    }
}
