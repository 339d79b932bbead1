//! The forward output: node selection, delivery and acknowledgement.
//!
//! [`ForwardOutput::deliver`] hands a chunk to one node and reports the
//! outcome through a [`CommitHandle`]. Without acks the chunk commits once
//! the frame is written; with acks it waits in the [`AckTable`] until the
//! per-connection reader, the timer sweep or a disconnect settles it. A
//! background timer drives heartbeats and node ticks.

mod timer;

use std::{
    borrow::Cow,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::{
    ack::{AckResolution, AckTable, spawn_ack_reader},
    commit::{CommitHandle, commit_channel},
    config::{ForwardConfig, ForwardOutputBuilder},
    detector::DetectorConfig,
    error::{ConfigError, DeliveryError},
    heartbeat::{HeartbeatStrategy, HeartbeatType},
    node::{HealthPolicy, Node, NodeDefaults, NodeStatus, Recovery, resolve_all},
    protocol::{Chunk, ChunkBuilder, encode_packed_forward},
    selector::NodeSelector,
    transport::{Connection, TransportOptions},
};

use timer::{Timer, run_tick};

/// Where a chunk stands when [`ForwardOutput::deliver`] returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryState {
    /// The handle has been committed.
    Committed,
    /// The handle will be settled by the ack reader, the sweep or shutdown.
    AwaitingAck,
    /// The handle has been rolled back.
    RolledBack,
}

/// Forward-protocol output over a set of weighted nodes.
pub struct ForwardOutput {
    config: ForwardConfig,
    selector: Arc<NodeSelector>,
    acks: Arc<AckTable>,
    transport: TransportOptions,
    timer: Mutex<Option<Timer>>,
    closed: AtomicBool,
}

impl ForwardOutput {
    pub fn builder() -> ForwardOutputBuilder {
        ForwardOutputBuilder::new()
    }

    /// Validate `config` and create its nodes without starting any thread.
    pub fn new(config: ForwardConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let epoch = Arc::new(AtomicU64::new(0));
        let defaults = node_defaults(&config);
        let now = Instant::now();
        let mut nodes = Vec::new();
        for server in &config.servers {
            for addr in expand_server(&config, &server.host, server.port) {
                nodes.push(Arc::new(Node::new(
                    server,
                    addr,
                    &defaults,
                    Arc::clone(&epoch),
                    now,
                )));
            }
        }
        let transport = TransportOptions {
            connect_timeout: config.effective_connect_timeout(),
            send_timeout: config.send_timeout,
        };
        Ok(Self {
            acks: Arc::new(AckTable::new(config.ack_response_timeout)),
            selector: Arc::new(NodeSelector::new(nodes, epoch)),
            transport,
            timer: Mutex::new(None),
            closed: AtomicBool::new(false),
            config,
        })
    }

    /// Start heartbeats and the ack sweep. Calling it twice is a no-op.
    ///
    /// No thread is started when heartbeats are off and acks are not
    /// required.
    pub fn start(&self) -> Result<(), ConfigError> {
        let mut timer = self.timer.lock();
        if timer.is_some() || self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let heartbeat = self.config.heartbeat_type;
        if heartbeat == HeartbeatType::None && !self.config.require_ack_response {
            return Ok(());
        }
        let strategy = HeartbeatStrategy::start(heartbeat, self.nodes(), self.probe_options())?;
        let acks = self
            .config
            .require_ack_response
            .then(|| Arc::clone(&self.acks));
        *timer = Some(Timer::spawn(
            self.config.heartbeat_interval,
            self.nodes().to_vec(),
            strategy,
            acks,
        )?);
        info!(
            "forward output started with {} nodes, heartbeat_type={heartbeat}",
            self.nodes().len()
        );
        Ok(())
    }

    /// TCP probes give up after one heartbeat interval (at least a second)
    /// so a dead node cannot stall the timer for the full connect timeout.
    fn probe_options(&self) -> TransportOptions {
        let cap = self.config.heartbeat_interval.max(Duration::from_secs(1));
        TransportOptions {
            connect_timeout: self.transport.connect_timeout.min(cap),
            send_timeout: self.transport.send_timeout.min(cap),
        }
    }

    pub fn config(&self) -> &ForwardConfig {
        &self.config
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        self.selector.nodes()
    }

    pub fn node_statuses(&self) -> Vec<NodeStatus> {
        self.nodes().iter().map(|node| node.status()).collect()
    }

    pub fn heartbeat_type(&self) -> HeartbeatType {
        self.config.heartbeat_type
    }

    pub fn require_ack_response(&self) -> bool {
        self.config.require_ack_response
    }

    /// How long the retry layer should wait for a delayed commit.
    pub fn delayed_commit_timeout(&self) -> Duration {
        self.config.ack_response_timeout
    }

    /// Whether the background timer is running.
    pub fn is_running(&self) -> bool {
        self.timer.lock().is_some()
    }

    pub fn pending_acks(&self) -> usize {
        self.acks.len()
    }

    /// Run node ticks and the ack sweep once, outside the timer.
    pub fn tick(&self) {
        let acks = self.config.require_ack_response.then_some(&*self.acks);
        run_tick(self.nodes(), acks, Instant::now());
    }

    /// A chunk builder encoding times the way this output sends them.
    pub fn chunk_builder(&self, tag: impl Into<String>) -> ChunkBuilder {
        ChunkBuilder::new(tag).time_as_integer(self.config.time_as_integer)
    }

    /// Send `chunk` to one node and settle `handle` exactly once.
    ///
    /// With `time_as_integer` set, chunks built with extension times are
    /// re-encoded before sending.
    pub fn deliver(&self, chunk: &Chunk, handle: Box<dyn CommitHandle>) -> DeliveryState {
        if self.closed.load(Ordering::Acquire) {
            handle.rollback(DeliveryError::Closed);
            return DeliveryState::RolledBack;
        }
        if chunk.is_empty() {
            handle.commit();
            return DeliveryState::Committed;
        }
        let node = match self.selector.pick() {
            Ok(node) => node,
            Err(err) => {
                warn!("cannot deliver chunk {}: {err}", chunk.id());
                handle.rollback(err);
                return DeliveryState::RolledBack;
            }
        };
        let convert = self.config.time_as_integer && !chunk.has_integer_times();
        let chunk: Cow<'_, Chunk> = if convert {
            match chunk.with_integer_times() {
                Ok(converted) => Cow::Owned(converted),
                Err(err) => {
                    handle.rollback(DeliveryError::Protocol(err.to_string()));
                    return DeliveryState::RolledBack;
                }
            }
        } else {
            Cow::Borrowed(chunk)
        };
        let require_ack = self.config.require_ack_response;
        let frame = match encode_packed_forward(&chunk, node.compress(), require_ack) {
            Ok(frame) => frame,
            Err(err) => {
                handle.rollback(DeliveryError::Protocol(err.to_string()));
                return DeliveryState::RolledBack;
            }
        };
        let mut connection = match Connection::open(&node, &self.transport) {
            Ok(connection) => connection,
            Err(err) => return Self::fail(&node, handle, err),
        };
        if let Err(err) = connection.send(&frame) {
            connection.close();
            return Self::fail(&node, handle, err);
        }

        if !require_ack {
            connection.close();
            node.record_success(Instant::now());
            debug!("chunk {} sent to {node}", chunk.id());
            handle.commit();
            return DeliveryState::Committed;
        }

        let id = chunk.id();
        let closer = connection.closer().ok();
        if !self
            .acks
            .register(id, Arc::clone(&node), handle, closer, Instant::now())
        {
            connection.close();
            return DeliveryState::RolledBack;
        }
        if let Err(err) = spawn_ack_reader(Arc::clone(&self.acks), connection, id) {
            warn!("failed to start ack reader for chunk {id}: {err}");
            self.acks.resolve(&id, AckResolution::Disconnected);
            return DeliveryState::RolledBack;
        }
        DeliveryState::AwaitingAck
    }

    fn fail(node: &Node, handle: Box<dyn CommitHandle>, err: DeliveryError) -> DeliveryState {
        warn!("failed to deliver chunk to {node}: {err}");
        if err.vetoes_node() {
            node.disable(&err.to_string());
        }
        handle.rollback(err);
        DeliveryState::RolledBack
    }

    /// Deliver `chunk` and block until it commits or rolls back.
    pub fn write(&self, chunk: &Chunk) -> Result<(), DeliveryError> {
        let (handle, rx) = commit_channel();
        self.deliver(chunk, handle);
        rx.recv().map_err(|_| DeliveryError::Closed)?.into_result()
    }

    /// Stop background threads and roll back every pending ack.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut timer) = self.timer.lock().take() {
            timer.stop();
        }
        let rolled_back = self.acks.rollback_all();
        if rolled_back > 0 {
            info!("forward output closed; rolled back {rolled_back} chunks awaiting ack");
        }
    }
}

impl Drop for ForwardOutput {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ForwardOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardOutput")
            .field("nodes", &self.nodes().len())
            .field("heartbeat_type", &self.config.heartbeat_type)
            .field("require_ack_response", &self.config.require_ack_response)
            .finish()
    }
}

fn node_defaults(config: &ForwardConfig) -> NodeDefaults {
    let heartbeats = config.heartbeat_type != HeartbeatType::None;
    let recovery = if heartbeats {
        Recovery::Heartbeats(config.recover_sample_size())
    } else {
        Recovery::AfterWait(config.recover_wait)
    };
    NodeDefaults {
        compress: config.compress,
        self_hostname: config.self_hostname().to_owned(),
        shared_key: config.security.as_ref().map(|s| s.shared_key.clone()),
        expire_dns_cache: config.expire_dns_cache,
        policy: Arc::new(HealthPolicy {
            phi_enabled: config.phi_failure_detector && heartbeats,
            hard_timeout: config.effective_hard_timeout(),
            recovery,
            detector: DetectorConfig::default()
                .with_threshold(config.phi_threshold)
                .with_first_heartbeat_estimate(config.heartbeat_interval),
        }),
    }
}

/// Addresses to pin nodes to; `[None]` means one node resolving `host` itself.
fn expand_server(config: &ForwardConfig, host: &str, port: u16) -> Vec<Option<SocketAddr>> {
    if !config.dns_round_robin {
        return vec![None];
    }
    match resolve_all(host, port) {
        Ok(addrs) if !addrs.is_empty() => addrs.into_iter().map(Some).collect(),
        Ok(_) => {
            warn!("{host}:{port} resolved to no addresses; using it as a single node");
            vec![None]
        }
        Err(err) => {
            warn!("failed to resolve {host}:{port} for dns_round_robin: {err}; using it as a single node");
            vec![None]
        }
    }
}
