//! Connections to forward nodes.

use std::{
    io::{self, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    time::{Duration, Instant},
};

use crate::{
    error::DeliveryError,
    handshake::client_handshake,
    node::Node,
    protocol::{AckResponse, decode_error},
};

/// Timeouts applied to every connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    /// Write timeout, also bounds each handshake read.
    pub send_timeout: Duration,
}

/// Connect to `addr`, failing after `timeout`.
pub fn connect_tcp(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// An authenticated connection to one node.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    node: String,
}

impl Connection {
    /// Resolve, connect and (when credentials apply) authenticate.
    pub fn open(node: &Node, options: &TransportOptions) -> Result<Self, DeliveryError> {
        let connect_err = |source| DeliveryError::Connect {
            node: node.name().to_owned(),
            source,
        };
        let addr = node.socket_addr(Instant::now()).map_err(connect_err)?;
        let mut stream = connect_tcp(addr, options.connect_timeout).map_err(connect_err)?;
        stream
            .set_write_timeout(Some(options.send_timeout))
            .map_err(connect_err)?;
        if let Some(credentials) = node.credentials() {
            stream
                .set_read_timeout(Some(options.send_timeout))
                .map_err(connect_err)?;
            client_handshake(&mut stream, credentials).map_err(|source| {
                let _ = stream.shutdown(Shutdown::Both);
                DeliveryError::Authentication {
                    node: node.name().to_owned(),
                    source,
                }
            })?;
            stream.set_read_timeout(None).map_err(connect_err)?;
        }
        Ok(Self {
            stream,
            node: node.name().to_owned(),
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Write one complete frame.
    pub fn send(&mut self, frame: &[u8]) -> Result<(), DeliveryError> {
        let result = self.stream.write_all(frame).and_then(|()| self.stream.flush());
        result.map_err(|source| DeliveryError::Write {
            node: self.node.clone(),
            source,
        })
    }

    /// Handle for shutting the socket down from another thread.
    pub fn closer(&self) -> io::Result<TcpStream> {
        self.stream.try_clone()
    }

    /// Block for one `{"ack": id}` response.
    ///
    /// `timeout` of `None` waits until the peer answers or the socket is
    /// shut down.
    pub fn read_ack(&mut self, timeout: Option<Duration>) -> io::Result<AckResponse> {
        self.stream.set_read_timeout(timeout)?;
        rmp_serde::from_read(&mut self.stream).map_err(decode_error)
    }

    pub fn close(self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
