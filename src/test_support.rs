//! In-process forward receiver for tests.
//!
//! [`ForwardReceiver`] listens on a loopback TCP port (and the same UDP port)
//! and decodes every forward message it receives. Its ack behaviour is
//! configurable so tests can exercise commits, timeouts, disconnects and
//! mismatched acks.

use std::{
    io::{self, Write},
    net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

use crate::{
    handshake::Acceptor,
    protocol::{AckResponse, ForwardMessage, read_message},
};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// How the receiver answers messages that request an ack.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum AckMode {
    /// Echo the chunk id.
    #[default]
    Respond,
    /// Keep the connection open and never answer.
    Ignore,
    /// Close the connection without answering.
    Disconnect,
    /// Answer with an id that matches nothing.
    Mismatch,
}

/// Receiver settings.
#[derive(Clone, Debug, Default)]
pub struct ReceiverOptions {
    pub acceptor: Option<Acceptor>,
    pub ack_mode: AckMode,
    /// Echo UDP heartbeats on the same port.
    pub udp: bool,
}

impl ReceiverOptions {
    pub fn with_acceptor(mut self, acceptor: Acceptor) -> Self {
        self.acceptor = Some(acceptor);
        self
    }

    pub fn with_ack_mode(mut self, mode: AckMode) -> Self {
        self.ack_mode = mode;
        self
    }

    pub fn with_udp(mut self) -> Self {
        self.udp = true;
        self
    }
}

#[derive(Default)]
struct Shared {
    stop: AtomicBool,
    connections: AtomicUsize,
    handshake_failures: AtomicUsize,
    udp_pings: AtomicUsize,
    held: Mutex<Vec<TcpStream>>,
}

/// A loopback forward receiver.
pub struct ForwardReceiver {
    addr: SocketAddr,
    messages: Receiver<ForwardMessage>,
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl ForwardReceiver {
    /// Receiver with default options: no auth, acks answered, no UDP.
    pub fn start_default() -> io::Result<Self> {
        Self::start(ReceiverOptions::default())
    }

    pub fn start(options: ReceiverOptions) -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let shared = Arc::new(Shared::default());
        let (tx, rx) = unbounded();

        let mut threads = Vec::new();
        if options.udp {
            let socket = UdpSocket::bind(addr)?;
            socket.set_read_timeout(Some(POLL_INTERVAL))?;
            let shared = Arc::clone(&shared);
            threads.push(thread::spawn(move || udp_loop(socket, shared)));
        }
        {
            let shared = Arc::clone(&shared);
            threads.push(thread::spawn(move || accept_loop(listener, options, shared, tx)));
        }
        Ok(Self {
            addr,
            messages: rx,
            shared,
            threads,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Wait for the next decoded message.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ForwardMessage> {
        self.messages.recv_timeout(timeout).ok()
    }

    /// Accepted TCP connections, heartbeats included.
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    pub fn handshake_failures(&self) -> usize {
        self.shared.handshake_failures.load(Ordering::SeqCst)
    }

    pub fn udp_pings(&self) -> usize {
        self.shared.udp_pings.load(Ordering::SeqCst)
    }

    /// Stop accepting and close held connections.
    pub fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        for stream in self.shared.held.lock().drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ForwardReceiver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    listener: TcpListener,
    options: ReceiverOptions,
    shared: Arc<Shared>,
    tx: Sender<ForwardMessage>,
) {
    while !shared.stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                shared.connections.fetch_add(1, Ordering::SeqCst);
                let options = options.clone();
                let shared = Arc::clone(&shared);
                let tx = tx.clone();
                thread::spawn(move || {
                    let _ = serve(stream, peer, &options, &shared, &tx);
                });
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(_) => thread::sleep(POLL_INTERVAL),
        }
    }
}

fn serve(
    mut stream: TcpStream,
    peer: SocketAddr,
    options: &ReceiverOptions,
    shared: &Shared,
    tx: &Sender<ForwardMessage>,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    if let Some(acceptor) = &options.acceptor {
        if acceptor.accept(&mut stream, peer.ip()).is_err() {
            shared.handshake_failures.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }
    }
    loop {
        // EOF here is a heartbeat probe or a sender that is done.
        let message = read_message(&mut stream)?;
        let ack = message.ack();
        let _ = tx.send(message);
        let Some(ack) = ack else { continue };
        match options.ack_mode {
            AckMode::Respond => write_ack(&mut stream, &ack)?,
            AckMode::Mismatch => write_ack(
                &mut stream,
                &AckResponse {
                    ack: "bm90LXRoaXMtY2h1bms=".into(),
                },
            )?,
            AckMode::Ignore => {
                shared.held.lock().push(stream.try_clone()?);
                return Ok(());
            }
            AckMode::Disconnect => {
                stream.shutdown(Shutdown::Both)?;
                return Ok(());
            }
        }
    }
}

fn write_ack(stream: &mut TcpStream, ack: &AckResponse) -> io::Result<()> {
    let bytes = rmp_serde::to_vec_named(ack).map_err(io::Error::other)?;
    stream.write_all(&bytes)?;
    stream.flush()
}

fn udp_loop(socket: UdpSocket, shared: Arc<Shared>) {
    let mut buf = [0u8; 64];
    while !shared.stop.load(Ordering::SeqCst) {
        if let Ok((_, from)) = socket.recv_from(&mut buf) {
            shared.udp_pings.fetch_add(1, Ordering::SeqCst);
            let _ = socket.send_to(b"\0", from);
        }
    }
}
