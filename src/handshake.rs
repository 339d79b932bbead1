//! Shared-key authentication handshake.
//!
//! The receiving side opens with `["HELO", {nonce, auth, keepalive}]`, the
//! sender answers `["PING", hostname, salt, digest, username, password_digest]`
//! and the receiver closes the exchange with
//! `["PONG", ok, reason, hostname, digest]`. Digests are hex encoded SHA-512
//! over the concatenated fields so neither the shared key nor the password
//! crosses the wire.

use std::{
    io::{self, Read, Write},
    net::IpAddr,
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_bytes::{ByteBuf, Bytes};
use sha2::{Digest, Sha512};
use thiserror::Error;

use crate::protocol::decode_error;

const SAME_HOSTNAME_REASON: &str = "same hostname between input and output: invalid configuration";

/// Failures raised by either side of the handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("expected {expected} message, received {received}")]
    Unexpected { expected: &'static str, received: String },
    #[error("authentication rejected: {0}")]
    Rejected(String),
    #[error("peer hostname {0:?} matches our own; refusing to forward to ourselves")]
    SameHostname(String),
    #[error("shared key digest mismatch")]
    DigestMismatch,
    #[error("client {0} is not in the allow list")]
    ClientNotAllowed(IpAddr),
}

/// Options carried by the HELO message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeloOptions {
    pub nonce: ByteBuf,
    /// Salt for the user digest; empty when user authentication is off.
    pub auth: ByteBuf,
    pub keepalive: bool,
}

type Helo = (String, HeloOptions);
type Ping = (String, String, ByteBuf, String, String, String);
type Pong = (String, bool, String, String, String);

/// Credentials presented by the sending side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientCredentials {
    pub self_hostname: String,
    pub shared_key: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Run the sending side of the handshake over an established stream.
pub fn client_handshake<S: Read + Write>(
    stream: &mut S,
    credentials: &ClientCredentials,
) -> Result<(), HandshakeError> {
    let (kind, helo): Helo = read_frame(stream)?;
    expect_kind(&kind, "HELO")?;

    let salt: [u8; 16] = rand::random();
    let digest = shared_key_digest(
        &salt,
        &credentials.self_hostname,
        &helo.nonce,
        &credentials.shared_key,
    );
    let (username, user_digest) = if helo.auth.is_empty() {
        (String::new(), String::new())
    } else {
        let username = credentials.username.clone().unwrap_or_default();
        let password = credentials.password.as_deref().unwrap_or_default();
        let user_digest = password_digest(&helo.auth, &username, password);
        (username, user_digest)
    };
    write_frame(
        stream,
        &(
            "PING",
            &credentials.self_hostname,
            Bytes::new(&salt),
            digest,
            username,
            user_digest,
        ),
    )?;

    let (kind, ok, reason, server_hostname, server_digest): Pong = read_frame(stream)?;
    expect_kind(&kind, "PONG")?;
    if !ok {
        return Err(HandshakeError::Rejected(reason));
    }
    if server_hostname == credentials.self_hostname {
        return Err(HandshakeError::SameHostname(server_hostname));
    }
    let expected = shared_key_digest(
        &salt,
        &server_hostname,
        &helo.nonce,
        &credentials.shared_key,
    );
    if expected != server_digest {
        return Err(HandshakeError::DigestMismatch);
    }
    Ok(())
}

/// Username/password pair accepted by an [`Acceptor`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserCredentials {
    pub username: String,
    pub password: String,
}

/// Receiving side of the handshake.
#[derive(Clone, Debug)]
pub struct Acceptor {
    self_hostname: String,
    shared_key: String,
    users: Vec<UserCredentials>,
    allowed_clients: Vec<IpAddr>,
}

impl Acceptor {
    pub fn new(self_hostname: impl Into<String>, shared_key: impl Into<String>) -> Self {
        Self {
            self_hostname: self_hostname.into(),
            shared_key: shared_key.into(),
            users: Vec::new(),
            allowed_clients: Vec::new(),
        }
    }

    /// Require user authentication and accept this user.
    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.push(UserCredentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Restrict connections to the listed client addresses.
    pub fn allow_client(mut self, client: IpAddr) -> Self {
        self.allowed_clients.push(client);
        self
    }

    fn user_auth(&self) -> bool {
        !self.users.is_empty()
    }

    /// Authenticate a connecting sender, returning its declared hostname.
    pub fn accept<S: Read + Write>(
        &self,
        stream: &mut S,
        peer: IpAddr,
    ) -> Result<String, HandshakeError> {
        if !self.allowed_clients.is_empty() && !self.allowed_clients.contains(&peer) {
            return Err(HandshakeError::ClientNotAllowed(peer));
        }
        let nonce: [u8; 16] = rand::random();
        let auth: Vec<u8> = if self.user_auth() {
            rand::random::<[u8; 16]>().to_vec()
        } else {
            Vec::new()
        };
        let helo = HeloOptions {
            nonce: ByteBuf::from(nonce.to_vec()),
            auth: ByteBuf::from(auth.clone()),
            keepalive: true,
        };
        write_frame(stream, &("HELO", &helo))?;

        let (kind, hostname, salt, digest, username, user_digest): Ping = read_frame(stream)?;
        expect_kind(&kind, "PING")?;

        match self.check_ping(&nonce, &auth, &hostname, &salt, &digest, &username, &user_digest) {
            None => {
                let server_digest =
                    shared_key_digest(&salt, &self.self_hostname, &nonce, &self.shared_key);
                write_frame(stream, &("PONG", true, "", &self.self_hostname, server_digest))?;
                Ok(hostname)
            }
            Some(reason) => {
                log::warn!("rejected forward client {peer} ({hostname}): {reason}");
                write_frame(stream, &("PONG", false, &reason, &self.self_hostname, ""))?;
                Err(HandshakeError::Rejected(reason))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn check_ping(
        &self,
        nonce: &[u8],
        auth: &[u8],
        hostname: &str,
        salt: &[u8],
        digest: &str,
        username: &str,
        user_digest: &str,
    ) -> Option<String> {
        if hostname == self.self_hostname {
            return Some(SAME_HOSTNAME_REASON.to_owned());
        }
        if shared_key_digest(salt, hostname, nonce, &self.shared_key) != digest {
            return Some("shared_key mismatch".to_owned());
        }
        if self.user_auth() {
            let valid = self.users.iter().any(|user| {
                user.username == username
                    && password_digest(auth, &user.username, &user.password) == user_digest
            });
            if !valid {
                return Some("username/password mismatch".to_owned());
            }
        }
        None
    }
}

/// `hex(sha512(salt + hostname + nonce + shared_key))`.
pub fn shared_key_digest(salt: &[u8], hostname: &str, nonce: &[u8], shared_key: &str) -> String {
    let mut hasher = Sha512::new();
    hasher.update(salt);
    hasher.update(hostname.as_bytes());
    hasher.update(nonce);
    hasher.update(shared_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// `hex(sha512(auth_salt + username + password))`.
pub fn password_digest(auth_salt: &[u8], username: &str, password: &str) -> String {
    let mut hasher = Sha512::new();
    hasher.update(auth_salt);
    hasher.update(username.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn expect_kind(kind: &str, expected: &'static str) -> Result<(), HandshakeError> {
    if kind == expected {
        Ok(())
    } else {
        Err(HandshakeError::Unexpected {
            expected,
            received: kind.to_owned(),
        })
    }
}

fn read_frame<S: Read, T: DeserializeOwned>(stream: &mut S) -> Result<T, HandshakeError> {
    rmp_serde::from_read(&mut *stream)
        .map_err(decode_error)
        .map_err(HandshakeError::Io)
}

fn write_frame<S: Write, T: Serialize>(stream: &mut S, value: &T) -> Result<(), HandshakeError> {
    rmp_serde::encode::write_named(stream, value).map_err(io::Error::other)?;
    stream.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        net::{Ipv4Addr, TcpListener, TcpStream},
        thread,
        time::Duration,
    };

    use rstest::rstest;

    fn credentials(shared_key: &str) -> ClientCredentials {
        ClientCredentials {
            self_hostname: "out.localhost".into(),
            shared_key: shared_key.into(),
            username: None,
            password: None,
        }
    }

    /// Run `acceptor` on one loopback connection and the client side on
    /// another thread, returning both outcomes.
    fn run_handshake(
        acceptor: Acceptor,
        credentials: ClientCredentials,
    ) -> (Result<String, HandshakeError>, Result<(), HandshakeError>) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind listener");
        let addr = listener.local_addr().expect("listener address");
        let server = thread::spawn(move || {
            let (mut stream, peer) = listener.accept().expect("accept");
            acceptor.accept(&mut stream, peer.ip())
        });
        let mut stream = TcpStream::connect(addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("set timeout");
        let client = client_handshake(&mut stream, &credentials);
        (server.join().expect("server thread"), client)
    }

    #[rstest]
    fn matching_shared_key_authenticates() {
        let (server, client) = run_handshake(
            Acceptor::new("in.localhost", "secret"),
            credentials("secret"),
        );
        assert_eq!(server.expect("server accepts"), "out.localhost");
        client.expect("client accepts");
    }

    #[rstest]
    fn wrong_shared_key_is_rejected() {
        let (server, client) = run_handshake(
            Acceptor::new("in.localhost", "secret"),
            credentials("guess"),
        );
        assert!(matches!(server, Err(HandshakeError::Rejected(_))));
        assert!(
            matches!(client, Err(HandshakeError::Rejected(ref reason)) if reason.contains("shared_key"))
        );
    }

    #[rstest]
    fn same_hostname_is_rejected() {
        let (_, client) = run_handshake(
            Acceptor::new("out.localhost", "secret"),
            credentials("secret"),
        );
        assert!(
            matches!(client, Err(HandshakeError::Rejected(ref reason)) if reason.contains("same hostname"))
        );
    }

    #[rstest]
    #[case::valid("fluentd", true)]
    #[case::wrong_password("nope", false)]
    fn user_auth(#[case] password: &str, #[case] accepted: bool) {
        let mut creds = credentials("secret");
        creds.username = Some("fluentd".into());
        creds.password = Some(password.into());
        let (_, client) = run_handshake(
            Acceptor::new("in.localhost", "secret").with_user("fluentd", "fluentd"),
            creds,
        );
        assert_eq!(client.is_ok(), accepted, "{client:?}");
    }

    #[rstest]
    fn digests_depend_on_every_field() {
        let base = shared_key_digest(b"salt", "host", b"nonce", "key");
        assert_eq!(base.len(), 128);
        assert_ne!(base, shared_key_digest(b"salt", "host2", b"nonce", "key"));
        assert_ne!(base, shared_key_digest(b"salt", "host", b"nonce", "key2"));
        assert_ne!(
            password_digest(b"a", "user", "pw"),
            password_digest(b"b", "user", "pw")
        );
    }
}
