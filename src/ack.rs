//! Pending acknowledgements.
//!
//! Every chunk sent with `require_ack_response` is registered here until its
//! ack arrives, its deadline passes, its connection drops or the output shuts
//! down. Removal from the table decides the outcome, so whichever of those
//! happens first wins and the commit handle fires exactly once.

use std::{
    collections::HashMap,
    io,
    net::{Shutdown, TcpStream},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::{
    commit::CommitHandle, error::DeliveryError, node::Node, protocol::ChunkId,
    transport::Connection,
};

/// How a pending ack was settled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AckResolution {
    Acknowledged,
    Mismatch { received: String },
    TimedOut,
    Disconnected,
    Shutdown,
}

struct PendingAck {
    node: Arc<Node>,
    deadline: Instant,
    handle: Box<dyn CommitHandle>,
    closer: Option<TcpStream>,
}

/// Chunks awaiting an ack, keyed by chunk id.
pub struct AckTable {
    pending: Mutex<HashMap<ChunkId, PendingAck>>,
    timeout: Duration,
}

impl AckTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Track `id` until it resolves. A duplicate id is rolled back at once.
    pub fn register(
        &self,
        id: ChunkId,
        node: Arc<Node>,
        handle: Box<dyn CommitHandle>,
        closer: Option<TcpStream>,
        now: Instant,
    ) -> bool {
        let mut pending = self.pending.lock();
        if pending.contains_key(&id) {
            drop(pending);
            handle.rollback(DeliveryError::Protocol(format!(
                "chunk {id} is already awaiting an ack"
            )));
            return false;
        }
        pending.insert(
            id,
            PendingAck {
                node,
                deadline: now + self.timeout,
                handle,
                closer,
            },
        );
        true
    }

    /// Settle `id`. Returns false when it was already settled.
    pub fn resolve(&self, id: &ChunkId, resolution: AckResolution) -> bool {
        let Some(entry) = self.pending.lock().remove(id) else {
            return false;
        };
        let PendingAck {
            node,
            handle,
            closer,
            ..
        } = entry;
        let node_name = node.name().to_owned();
        match resolution {
            AckResolution::Acknowledged => {
                debug!("chunk {id} acknowledged by {node}");
                node.record_success(Instant::now());
                handle.commit();
            }
            AckResolution::Mismatch { received } => {
                warn!("ack from {node} did not match chunk {id}: received {received}");
                handle.rollback(DeliveryError::AckMismatch {
                    node: node_name,
                    expected: id.to_base64(),
                    received,
                });
            }
            AckResolution::TimedOut => {
                warn!(
                    "failed to flush the buffer chunk, timeout to commit. chunk_id={id} node={node_name}"
                );
                warn!(
                    "no response from node. regard it as unavailable. node={node_name} host={} port={}",
                    node.host(),
                    node.port()
                );
                node.disable("ack response timeout");
                handle.rollback(DeliveryError::AckTimeout { node: node_name });
            }
            AckResolution::Disconnected => {
                warn!("connection to {node} closed before chunk {id} was acknowledged");
                node.disable("connection closed while awaiting ack");
                handle.rollback(DeliveryError::Disconnected { node: node_name });
            }
            AckResolution::Shutdown => {
                handle.rollback(DeliveryError::Closed);
            }
        }
        if let Some(stream) = closer {
            let _ = stream.shutdown(Shutdown::Both);
        }
        true
    }

    /// Time out every entry whose deadline is at or before `now`.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<ChunkId> = self
            .pending
            .lock()
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired
            .iter()
            .filter(|id| self.resolve(id, AckResolution::TimedOut))
            .count()
    }

    /// Roll back everything still pending.
    pub fn rollback_all(&self) -> usize {
        let ids: Vec<ChunkId> = self.pending.lock().keys().copied().collect();
        ids.iter()
            .filter(|id| self.resolve(id, AckResolution::Shutdown))
            .count()
    }
}

/// Read the ack for `id` on its own thread and settle it in `table`.
///
/// The socket read is bounded by the ack timeout so the thread ends even if
/// the sweep never runs.
pub fn spawn_ack_reader(
    table: Arc<AckTable>,
    mut connection: Connection,
    id: ChunkId,
) -> io::Result<()> {
    let timeout = table.timeout();
    thread::Builder::new()
        .name("forward-ack-reader".into())
        .spawn(move || {
            let expected = id.to_base64();
            let resolution = match connection.read_ack(Some(timeout)) {
                Ok(ack) if ack.ack == expected => AckResolution::Acknowledged,
                Ok(ack) => AckResolution::Mismatch { received: ack.ack },
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    AckResolution::TimedOut
                }
                Err(err) => {
                    debug!("ack read from {} failed: {err}", connection.node());
                    AckResolution::Disconnected
                }
            };
            table.resolve(&id, resolution);
            connection.close();
        })
        .map(|_| ())
}
