//! Liveness probes feeding each node's failure detector.
//!
//! The strategy is chosen once when the output starts. TCP probes open a
//! short-lived (authenticated) connection per node, UDP probes send a single
//! `\0` datagram from a shared socket whose replies are collected by a
//! receiver thread, and `None` creates nothing at all.

use std::{
    fmt, io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    str::FromStr,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded};
use log::{debug, warn};

use crate::{
    node::Node,
    rate_limited_warner::RateLimitedWarner,
    transport::{Connection, TransportOptions},
};

const UDP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const UDP_PING: &[u8] = b"\0";

/// Configured heartbeat transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum HeartbeatType {
    #[default]
    Tcp,
    Udp,
    None,
}

impl HeartbeatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeartbeatType::Tcp => "tcp",
            HeartbeatType::Udp => "udp",
            HeartbeatType::None => "none",
        }
    }
}

impl fmt::Display for HeartbeatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HeartbeatType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(HeartbeatType::Tcp),
            "udp" => Ok(HeartbeatType::Udp),
            "none" => Ok(HeartbeatType::None),
            other => Err(format!("unknown heartbeat_type: {other}")),
        }
    }
}

/// A running heartbeat strategy.
pub enum HeartbeatStrategy {
    Tcp(TcpHeartbeat),
    Udp(UdpHeartbeat),
    None,
}

impl HeartbeatStrategy {
    /// Create the sockets and threads `kind` needs.
    pub fn start(
        kind: HeartbeatType,
        nodes: &[Arc<Node>],
        options: TransportOptions,
    ) -> io::Result<Self> {
        Ok(match kind {
            HeartbeatType::Tcp => HeartbeatStrategy::Tcp(TcpHeartbeat::new(options)),
            HeartbeatType::Udp => HeartbeatStrategy::Udp(UdpHeartbeat::start(nodes.to_vec())?),
            HeartbeatType::None => HeartbeatStrategy::None,
        })
    }

    pub fn kind(&self) -> HeartbeatType {
        match self {
            HeartbeatStrategy::Tcp(_) => HeartbeatType::Tcp,
            HeartbeatStrategy::Udp(_) => HeartbeatType::Udp,
            HeartbeatStrategy::None => HeartbeatType::None,
        }
    }

    /// Send one round of probes.
    pub fn probe(&self, nodes: &[Arc<Node>]) {
        match self {
            HeartbeatStrategy::Tcp(tcp) => tcp.probe(nodes),
            HeartbeatStrategy::Udp(udp) => udp.probe(nodes),
            HeartbeatStrategy::None => {}
        }
    }

    /// Stop any receiver thread.
    pub fn stop(&mut self) {
        if let HeartbeatStrategy::Udp(udp) = self {
            udp.stop();
        }
    }
}

/// Probes each node with a fresh TCP connection.
pub struct TcpHeartbeat {
    options: TransportOptions,
    warner: RateLimitedWarner,
}

impl TcpHeartbeat {
    pub fn new(options: TransportOptions) -> Self {
        Self {
            options,
            warner: RateLimitedWarner::default(),
        }
    }

    /// Probe every node concurrently and wait for all of them.
    pub fn probe(&self, nodes: &[Arc<Node>]) {
        thread::scope(|scope| {
            for node in nodes {
                scope.spawn(move || match Connection::open(node, &self.options) {
                    Ok(connection) => {
                        connection.close();
                        node.heartbeat(Instant::now());
                    }
                    Err(err) => {
                        self.warner.record();
                        self.warner.warn_if_due(Instant::now(), |count| {
                            warn!("heartbeat to {node} failed: {err} ({count} failures since last report)");
                        });
                    }
                });
            }
        });
    }
}

/// Sends UDP pings and listens for replies on one socket.
pub struct UdpHeartbeat {
    socket: UdpSocket,
    stop_tx: Option<Sender<()>>,
    receiver: Option<JoinHandle<()>>,
    warner: RateLimitedWarner,
}

impl UdpHeartbeat {
    /// Bind the shared socket and start the receiver thread.
    pub fn start(nodes: Vec<Arc<Node>>) -> io::Result<Self> {
        let now = Instant::now();
        let ipv6 = nodes
            .iter()
            .filter_map(|node| node.socket_addr(now).ok())
            .all(|addr| addr.is_ipv6())
            && !nodes.is_empty();
        let bind: SocketAddr = if ipv6 {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind)?;
        let listener = socket.try_clone()?;
        listener.set_read_timeout(Some(UDP_POLL_INTERVAL))?;
        let (stop_tx, stop_rx) = bounded(1);
        let receiver = thread::Builder::new()
            .name("forward-udp-heartbeat".into())
            .spawn(move || receive_loop(listener, nodes, stop_rx))?;
        Ok(Self {
            socket,
            stop_tx: Some(stop_tx),
            receiver: Some(receiver),
            warner: RateLimitedWarner::default(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn probe(&self, nodes: &[Arc<Node>]) {
        let now = Instant::now();
        for node in nodes {
            let sent = node
                .socket_addr(now)
                .and_then(|addr| self.socket.send_to(UDP_PING, addr));
            if let Err(err) = sent {
                self.warner.record();
                self.warner.warn_if_due(now, |count| {
                    warn!("udp heartbeat to {node} failed: {err} ({count} failures since last report)");
                });
            }
        }
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.receiver.take() {
            if handle.join().is_err() {
                warn!("udp heartbeat receiver panicked");
            }
        }
    }
}

impl Drop for UdpHeartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(socket: UdpSocket, nodes: Vec<Arc<Node>>, stop_rx: Receiver<()>) {
    let mut buf = [0u8; 64];
    loop {
        match stop_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }
        match socket.recv_from(&mut buf) {
            Ok((_, from)) => {
                let now = Instant::now();
                match nodes.iter().find(|node| node.cached_addr() == Some(from)) {
                    Some(node) => {
                        node.heartbeat(now);
                    }
                    None => debug!("ignoring heartbeat reply from unknown address {from}"),
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) => {}
            Err(err) => {
                // ICMP port unreachable surfaces as ConnectionRefused/Reset on some platforms.
                debug!("udp heartbeat receive failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ServerConfig,
        detector::DetectorConfig,
        node::{HealthPolicy, NodeDefaults, Recovery},
        protocol::Compression,
    };
    use rstest::rstest;
    use std::sync::atomic::AtomicU64;

    fn udp_node(port: u16) -> Arc<Node> {
        let mut server = ServerConfig::new("127.0.0.1");
        server.port = port;
        let defaults = NodeDefaults {
            compress: Compression::Text,
            self_hostname: "localhost".into(),
            shared_key: None,
            expire_dns_cache: None,
            policy: Arc::new(HealthPolicy {
                phi_enabled: true,
                hard_timeout: Duration::from_secs(60),
                recovery: Recovery::Heartbeats(1),
                detector: DetectorConfig::default(),
            }),
        };
        Arc::new(Node::new(
            &server,
            None,
            &defaults,
            Arc::new(AtomicU64::new(0)),
            Instant::now(),
        ))
    }

    #[rstest]
    fn late_udp_reply_still_counts_after_detach() {
        let peer = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind peer");
        peer.set_read_timeout(Some(Duration::from_secs(2)))
            .expect("peer timeout");
        let node = udp_node(peer.local_addr().expect("peer addr").port());
        let mut heartbeat = UdpHeartbeat::start(vec![Arc::clone(&node)]).expect("start udp");

        heartbeat.probe(std::slice::from_ref(&node));
        let mut buf = [0u8; 8];
        let (len, from) = peer.recv_from(&mut buf).expect("ping");
        assert_eq!(&buf[..len], UDP_PING);

        node.disable("write failed");
        assert!(!node.available());
        peer.send_to(UDP_PING, from).expect("reply");

        let deadline = Instant::now() + Duration::from_secs(2);
        while !node.available() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(node.available());
        heartbeat.stop();
    }

    #[rstest]
    #[case("tcp", HeartbeatType::Tcp)]
    #[case("UDP", HeartbeatType::Udp)]
    #[case(" none ", HeartbeatType::None)]
    fn parses_heartbeat_types(#[case] input: &str, #[case] expected: HeartbeatType) {
        assert_eq!(input.parse::<HeartbeatType>(), Ok(expected));
    }

    #[rstest]
    fn rejects_unknown_heartbeat_type() {
        assert!("icmp".parse::<HeartbeatType>().is_err());
    }

    #[rstest]
    fn none_strategy_creates_nothing() {
        let options = TransportOptions {
            connect_timeout: Duration::from_secs(1),
            send_timeout: Duration::from_secs(1),
        };
        let mut strategy =
            HeartbeatStrategy::start(HeartbeatType::None, &[], options).expect("start");
        assert_eq!(strategy.kind(), HeartbeatType::None);
        strategy.probe(&[]);
        strategy.stop();
    }
}
