//! Configuration for [`ForwardOutput`](crate::ForwardOutput).
//!
//! [`ForwardConfig`] holds validated values with defaults taken from the
//! `DEFAULT_*` constants. [`ForwardOutputBuilder`] and [`ServerBuilder`] offer
//! a fluent API that validates millisecond fields before producing a config.

use std::time::Duration;

use once_cell::sync::Lazy;

use crate::{
    ForwardOutput,
    detector::DEFAULT_PHI_THRESHOLD,
    error::ConfigError,
    heartbeat::HeartbeatType,
    protocol::Compression,
};

macro_rules! ensure_positive {
    ($value:expr, $field:expr) => {{
        if $value == 0 {
            Err(ConfigError::Invalid(format!(
                "{} must be greater than zero",
                $field
            )))
        } else {
            Ok($value)
        }
    }};
}

macro_rules! option_setter {
    ($(#[$meta:meta])* $fn_name:ident, $field:ident, $ty:ty) => {
        $(#[$meta])*
        pub fn $fn_name(mut self, value: $ty) -> Self {
            self.$field = Some(value);
            self
        }
    };
}

/// Default forward port.
pub const DEFAULT_PORT: u16 = 24224;
/// Default selection weight of a server.
pub const DEFAULT_WEIGHT: u32 = 60;
/// Default write timeout, also the default hard timeout.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(60);
/// Default cadence of heartbeat probes and node ticks.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
/// Default wait for an ack before rolling a chunk back.
pub const DEFAULT_ACK_RESPONSE_TIMEOUT: Duration = Duration::from_secs(190);
/// Default time a detached node needs to prove itself before recovering.
pub const DEFAULT_RECOVER_WAIT: Duration = Duration::from_secs(10);
/// Default heartbeat transport.
pub const DEFAULT_HEARTBEAT_TYPE: HeartbeatType = HeartbeatType::Tcp;

/// Hostname announced during the handshake when none is configured.
pub static DEFAULT_SELF_HOSTNAME: Lazy<String> = Lazy::new(|| {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_owned())
});

/// One destination entry.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerConfig {
    pub name: Option<String>,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub standby: bool,
    /// Overrides the security shared key for this server.
    pub shared_key: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Overrides the output-wide compression.
    pub compress: Option<Compression>,
}

impl ServerConfig {
    /// Server at `host` with default port and weight.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            name: None,
            host: host.into(),
            port: DEFAULT_PORT,
            weight: DEFAULT_WEIGHT,
            standby: false,
            shared_key: None,
            username: None,
            password: None,
            compress: None,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("server host must not be empty".into()));
        }
        ensure_positive!(self.port, "port")?;
        ensure_positive!(self.weight, "weight")?;
        if self.password.is_some() && self.username.is_none() {
            return Err(ConfigError::Invalid(format!(
                "server {} has a password but no username",
                self.host
            )));
        }
        Ok(())
    }
}

/// Handshake identity of this output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecurityConfig {
    pub self_hostname: String,
    pub shared_key: String,
}

/// Complete configuration of a forward output.
#[derive(Clone, Debug, PartialEq)]
pub struct ForwardConfig {
    pub servers: Vec<ServerConfig>,
    pub security: Option<SecurityConfig>,
    pub heartbeat_type: HeartbeatType,
    pub heartbeat_interval: Duration,
    pub phi_failure_detector: bool,
    pub phi_threshold: f64,
    /// `None` uses `send_timeout`.
    pub hard_timeout: Option<Duration>,
    pub recover_wait: Duration,
    pub require_ack_response: bool,
    pub ack_response_timeout: Duration,
    pub send_timeout: Duration,
    /// `None` uses `send_timeout`.
    pub connect_timeout: Option<Duration>,
    pub dns_round_robin: bool,
    /// `None` caches resolved addresses forever; zero disables the cache.
    pub expire_dns_cache: Option<Duration>,
    pub compress: Compression,
    pub time_as_integer: bool,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            security: None,
            heartbeat_type: DEFAULT_HEARTBEAT_TYPE,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            phi_failure_detector: true,
            phi_threshold: DEFAULT_PHI_THRESHOLD,
            hard_timeout: None,
            recover_wait: DEFAULT_RECOVER_WAIT,
            require_ack_response: false,
            ack_response_timeout: DEFAULT_ACK_RESPONSE_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            connect_timeout: None,
            dns_round_robin: false,
            expire_dns_cache: None,
            compress: Compression::Text,
            time_as_integer: false,
        }
    }
}

impl ForwardConfig {
    /// Check the configuration for values the output cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::NoServers);
        }
        if self.dns_round_robin && self.heartbeat_type == HeartbeatType::Udp {
            return Err(ConfigError::DnsRoundRobinWithUdp);
        }
        for server in &self.servers {
            server.validate()?;
        }
        if !(self.phi_threshold >= 0.0) {
            return Err(ConfigError::Invalid(
                "phi_threshold must not be negative".into(),
            ));
        }
        ensure_positive_duration(self.heartbeat_interval, "heartbeat_interval")?;
        ensure_positive_duration(self.send_timeout, "send_timeout")?;
        ensure_positive_duration(self.ack_response_timeout, "ack_response_timeout")?;
        ensure_positive_duration(self.recover_wait, "recover_wait")?;
        if let Some(timeout) = self.connect_timeout {
            ensure_positive_duration(timeout, "connect_timeout")?;
        }
        if let Some(timeout) = self.hard_timeout {
            ensure_positive_duration(timeout, "hard_timeout")?;
        }
        Ok(())
    }

    pub fn effective_hard_timeout(&self) -> Duration {
        self.hard_timeout.unwrap_or(self.send_timeout)
    }

    pub fn effective_connect_timeout(&self) -> Duration {
        self.connect_timeout.unwrap_or(self.send_timeout)
    }

    /// Heartbeats a detached node must answer before it recovers.
    pub fn recover_sample_size(&self) -> usize {
        let interval = self.heartbeat_interval.as_secs_f64();
        if interval <= 0.0 {
            return 1;
        }
        ((self.recover_wait.as_secs_f64() / interval) as usize).max(1)
    }

    pub fn self_hostname(&self) -> &str {
        self.security
            .as_ref()
            .map_or(DEFAULT_SELF_HOSTNAME.as_str(), |s| s.self_hostname.as_str())
    }
}

fn ensure_positive_duration(value: Duration, field: &str) -> Result<Duration, ConfigError> {
    ensure_positive!(value.as_nanos(), field)?;
    Ok(value)
}

/// Fluent builder for one [`ServerConfig`].
#[derive(Clone, Debug, Default)]
pub struct ServerBuilder {
    host: String,
    name: Option<String>,
    port: Option<u16>,
    weight: Option<u32>,
    standby: bool,
    shared_key: Option<String>,
    username: Option<String>,
    password: Option<String>,
    compress: Option<Compression>,
}

impl ServerBuilder {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    option_setter!(with_port, port, u16);
    option_setter!(with_weight, weight, u32);
    option_setter!(
        #[doc = "Override the output-wide compression for this server."]
        with_compress,
        compress,
        Compression
    );

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Only use this server when every primary server is unavailable.
    pub fn standby(mut self, standby: bool) -> Self {
        self.standby = standby;
        self
    }

    pub fn with_shared_key(mut self, shared_key: impl Into<String>) -> Self {
        self.shared_key = Some(shared_key.into());
        self
    }

    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn build(self) -> Result<ServerConfig, ConfigError> {
        let mut server = ServerConfig::new(self.host);
        server.name = self.name;
        if let Some(port) = self.port {
            server.port = port;
        }
        if let Some(weight) = self.weight {
            server.weight = weight;
        }
        server.standby = self.standby;
        server.shared_key = self.shared_key;
        server.username = self.username;
        server.password = self.password;
        server.compress = self.compress;
        server.validate()?;
        Ok(server)
    }
}

/// Fluent builder for [`ForwardOutput`].
#[derive(Clone, Debug, Default)]
pub struct ForwardOutputBuilder {
    servers: Vec<ServerBuilder>,
    security: Option<SecurityConfig>,
    heartbeat_type: Option<HeartbeatType>,
    heartbeat_interval_ms: Option<u64>,
    phi_failure_detector: Option<bool>,
    phi_threshold: Option<f64>,
    hard_timeout_ms: Option<u64>,
    recover_wait_ms: Option<u64>,
    require_ack_response: bool,
    ack_response_timeout_ms: Option<u64>,
    send_timeout_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    dns_round_robin: bool,
    expire_dns_cache_ms: Option<u64>,
    compress: Option<Compression>,
    time_as_integer: bool,
}

impl ForwardOutputBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a destination.
    pub fn add_server(mut self, server: ServerBuilder) -> Self {
        self.servers.push(server);
        self
    }

    /// Enable the shared-key handshake for every server.
    pub fn with_security(
        mut self,
        self_hostname: impl Into<String>,
        shared_key: impl Into<String>,
    ) -> Self {
        self.security = Some(SecurityConfig {
            self_hostname: self_hostname.into(),
            shared_key: shared_key.into(),
        });
        self
    }

    option_setter!(with_heartbeat_type, heartbeat_type, HeartbeatType);
    option_setter!(with_heartbeat_interval_ms, heartbeat_interval_ms, u64);
    option_setter!(
        #[doc = "Enable or disable phi-based detaching."]
        with_phi_failure_detector,
        phi_failure_detector,
        bool
    );
    option_setter!(with_phi_threshold, phi_threshold, f64);
    option_setter!(with_hard_timeout_ms, hard_timeout_ms, u64);
    option_setter!(with_recover_wait_ms, recover_wait_ms, u64);
    option_setter!(with_ack_response_timeout_ms, ack_response_timeout_ms, u64);
    option_setter!(with_send_timeout_ms, send_timeout_ms, u64);
    option_setter!(with_connect_timeout_ms, connect_timeout_ms, u64);
    option_setter!(
        #[doc = "Expire cached addresses after this many milliseconds; zero disables caching."]
        with_expire_dns_cache_ms,
        expire_dns_cache_ms,
        u64
    );
    option_setter!(with_compress, compress, Compression);

    /// Wait for an ack before committing each chunk.
    pub fn require_ack_response(mut self, enabled: bool) -> Self {
        self.require_ack_response = enabled;
        self
    }

    /// Give every resolved address of a hostname its own node.
    pub fn dns_round_robin(mut self, enabled: bool) -> Self {
        self.dns_round_robin = enabled;
        self
    }

    /// Encode event times as plain integers.
    pub fn time_as_integer(mut self, enabled: bool) -> Self {
        self.time_as_integer = enabled;
        self
    }

    fn validate_timeouts(&self) -> Result<(), ConfigError> {
        for (value, field) in [
            (self.heartbeat_interval_ms, "heartbeat_interval_ms"),
            (self.hard_timeout_ms, "hard_timeout_ms"),
            (self.recover_wait_ms, "recover_wait_ms"),
            (self.ack_response_timeout_ms, "ack_response_timeout_ms"),
            (self.send_timeout_ms, "send_timeout_ms"),
            (self.connect_timeout_ms, "connect_timeout_ms"),
        ] {
            if let Some(value) = value {
                ensure_positive!(value, field)?;
            }
        }
        Ok(())
    }

    /// Validate and produce the configuration without starting anything.
    pub fn build_config(&self) -> Result<ForwardConfig, ConfigError> {
        self.validate_timeouts()?;
        let servers = self
            .servers
            .iter()
            .cloned()
            .map(ServerBuilder::build)
            .collect::<Result<Vec<_>, _>>()?;
        let mut config = ForwardConfig {
            servers,
            security: self.security.clone(),
            require_ack_response: self.require_ack_response,
            dns_round_robin: self.dns_round_robin,
            time_as_integer: self.time_as_integer,
            ..ForwardConfig::default()
        };
        self.apply_optional_fields(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply_optional_fields(&self, config: &mut ForwardConfig) {
        if let Some(heartbeat_type) = self.heartbeat_type {
            config.heartbeat_type = heartbeat_type;
        }
        if let Some(ms) = self.heartbeat_interval_ms {
            config.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(enabled) = self.phi_failure_detector {
            config.phi_failure_detector = enabled;
        }
        if let Some(threshold) = self.phi_threshold {
            config.phi_threshold = threshold;
        }
        config.hard_timeout = self.hard_timeout_ms.map(Duration::from_millis);
        if let Some(ms) = self.recover_wait_ms {
            config.recover_wait = Duration::from_millis(ms);
        }
        if let Some(ms) = self.ack_response_timeout_ms {
            config.ack_response_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.send_timeout_ms {
            config.send_timeout = Duration::from_millis(ms);
        }
        config.connect_timeout = self.connect_timeout_ms.map(Duration::from_millis);
        config.expire_dns_cache = self.expire_dns_cache_ms.map(Duration::from_millis);
        if let Some(compress) = self.compress {
            config.compress = compress;
        }
    }

    /// Build the output and start its background threads.
    pub fn build(&self) -> Result<ForwardOutput, ConfigError> {
        let output = ForwardOutput::new(self.build_config()?)?;
        output.start()?;
        Ok(output)
    }
}
