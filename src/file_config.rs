//! INI configuration loading.
//!
//! ```ini
//! [forward]
//! heartbeat_type = tcp
//! require_ack_response = true
//! ack_response_timeout = 30s
//!
//! [security]
//! self_hostname = app01
//! shared_key = secret
//!
//! [server primary]
//! host = 10.0.0.1
//! weight = 60
//!
//! [server backup]
//! host = 10.0.0.2
//! standby = true
//! ```
//!
//! Durations accept `ms`, `s`, `m`, `h` and `d` suffixes; a bare number is in
//! seconds.

use std::{fs, io::ErrorKind, path::Path, str::FromStr, time::Duration};

use ini::{Ini, Properties};

use crate::{
    config::{ForwardConfig, SecurityConfig, ServerConfig},
    error::ConfigError,
};

const SERVER_PREFIX: &str = "server";

/// Load and validate a configuration file.
pub fn load_file(path: impl AsRef<Path>) -> Result<ForwardConfig, ConfigError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|err| match err.kind() {
        ErrorKind::NotFound => ConfigError::Invalid(format!("{} doesn't exist", path.display())),
        _ => ConfigError::Io(err),
    })?;
    if text.trim().is_empty() {
        return Err(ConfigError::Invalid(format!(
            "{} is an empty file",
            path.display()
        )));
    }
    parse_str(&text)
}

/// Parse and validate configuration text.
pub fn parse_str(text: &str) -> Result<ForwardConfig, ConfigError> {
    let ini = Ini::load_from_str(text)
        .map_err(|err| ConfigError::Invalid(format!("invalid ini: {err}")))?;
    let mut config = ForwardConfig::default();
    for (section, props) in ini.iter() {
        match section.map(str::trim) {
            None if props.is_empty() => {}
            None => return Err(unknown("global", props)),
            Some("forward") => apply_forward(&mut config, props)?,
            Some("security") => config.security = Some(parse_security(props)?),
            Some(other) => match server_label(other) {
                Some(label) => config.servers.push(parse_server(label, props)?),
                None => {
                    return Err(ConfigError::Invalid(format!("unknown section [{other}]")));
                }
            },
        }
    }
    config.validate()?;
    Ok(config)
}

/// `[server]` or `[server LABEL]`; anything else merely starting with
/// `server` is not a server section.
fn server_label(section: &str) -> Option<&str> {
    let rest = section.strip_prefix(SERVER_PREFIX)?;
    if rest.is_empty() {
        Some("")
    } else if rest.starts_with(char::is_whitespace) {
        Some(rest.trim())
    } else {
        None
    }
}

fn apply_forward(config: &mut ForwardConfig, props: &Properties) -> Result<(), ConfigError> {
    for (key, value) in props.iter() {
        match key {
            "heartbeat_type" => config.heartbeat_type = parse_value(key, value)?,
            "heartbeat_interval" => config.heartbeat_interval = parse_duration(key, value)?,
            "phi_failure_detector" => config.phi_failure_detector = parse_bool(key, value)?,
            "phi_threshold" => config.phi_threshold = parse_value(key, value)?,
            "hard_timeout" => config.hard_timeout = Some(parse_duration(key, value)?),
            "recover_wait" => config.recover_wait = parse_duration(key, value)?,
            "require_ack_response" => config.require_ack_response = parse_bool(key, value)?,
            "ack_response_timeout" => config.ack_response_timeout = parse_duration(key, value)?,
            "send_timeout" => config.send_timeout = parse_duration(key, value)?,
            "connect_timeout" => config.connect_timeout = Some(parse_duration(key, value)?),
            "dns_round_robin" => config.dns_round_robin = parse_bool(key, value)?,
            "expire_dns_cache" => config.expire_dns_cache = Some(parse_duration(key, value)?),
            "compress" => config.compress = parse_value(key, value)?,
            "time_as_integer" => config.time_as_integer = parse_bool(key, value)?,
            other => return Err(unknown_key("forward", other)),
        }
    }
    Ok(())
}

fn parse_security(props: &Properties) -> Result<SecurityConfig, ConfigError> {
    let mut self_hostname = None;
    let mut shared_key = None;
    for (key, value) in props.iter() {
        match key {
            "self_hostname" => self_hostname = Some(value.to_owned()),
            "shared_key" => shared_key = Some(value.to_owned()),
            other => return Err(unknown_key("security", other)),
        }
    }
    let shared_key = shared_key
        .ok_or_else(|| ConfigError::Invalid("[security] requires shared_key".into()))?;
    Ok(SecurityConfig {
        self_hostname: self_hostname
            .unwrap_or_else(|| crate::config::DEFAULT_SELF_HOSTNAME.clone()),
        shared_key,
    })
}

fn parse_server(label: &str, props: &Properties) -> Result<ServerConfig, ConfigError> {
    let host = props
        .get("host")
        .ok_or_else(|| ConfigError::Invalid(format!("[server {label}] requires host")))?;
    let mut server = ServerConfig::new(host);
    if !label.is_empty() {
        server.name = Some(label.to_owned());
    }
    for (key, value) in props.iter() {
        match key {
            "host" => {}
            "name" => server.name = Some(value.to_owned()),
            "port" => server.port = parse_value(key, value)?,
            "weight" => server.weight = parse_value(key, value)?,
            "standby" => server.standby = parse_bool(key, value)?,
            "shared_key" => server.shared_key = Some(value.to_owned()),
            "username" => server.username = Some(value.to_owned()),
            "password" => server.password = Some(value.to_owned()),
            "compress" => server.compress = Some(parse_value(key, value)?),
            other => return Err(unknown_key("server", other)),
        }
    }
    Ok(server)
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|err| ConfigError::Invalid(format!("{key} = {value:?}: {err}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(ConfigError::Invalid(format!(
            "{key} = {value:?}: expected a boolean"
        ))),
    }
}

/// Parse `500ms`, `10s`, `5m`, `1h`, `1d` or a bare (fractional) second count.
pub fn parse_duration(key: &str, value: &str) -> Result<Duration, ConfigError> {
    let value = value.trim();
    let invalid = || ConfigError::Invalid(format!("{key} = {value:?}: expected a duration"));
    let split = value
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number.trim().parse().map_err(|_| invalid())?;
    let scale = match unit {
        "ms" => 0.001,
        "" | "s" => 1.0,
        "m" => 60.0,
        "h" => 3_600.0,
        "d" => 86_400.0,
        _ => return Err(invalid()),
    };
    Duration::try_from_secs_f64(number * scale).map_err(|_| invalid())
}

fn unknown(section: &str, props: &Properties) -> ConfigError {
    let key = props.iter().next().map_or("", |(key, _)| key);
    unknown_key(section, key)
}

fn unknown_key(section: &str, key: &str) -> ConfigError {
    ConfigError::Invalid(format!("unknown key {key:?} in [{section}]"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{heartbeat::HeartbeatType, protocol::Compression};
    use rstest::rstest;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
[forward]
heartbeat_type = udp
heartbeat_interval = 500ms
require_ack_response = true
ack_response_timeout = 30s
compress = gzip

[security]
self_hostname = app01
shared_key = secret

[server primary]
host = 10.0.0.1
weight = 30

[server backup]
host = 10.0.0.2
port = 24225
standby = yes
compress = text
"#;

    #[rstest]
    fn parses_every_section() {
        let config = parse_str(SAMPLE).expect("valid config");
        assert_eq!(config.heartbeat_type, HeartbeatType::Udp);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(500));
        assert!(config.require_ack_response);
        assert_eq!(config.ack_response_timeout, Duration::from_secs(30));
        assert_eq!(config.compress, Compression::Gzip);
        assert_eq!(config.self_hostname(), "app01");
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].name.as_deref(), Some("primary"));
        assert_eq!(config.servers[0].weight, 30);
        assert_eq!(config.servers[1].port, 24225);
        assert!(config.servers[1].standby);
        assert_eq!(config.servers[1].compress, Some(Compression::Text));
    }

    #[rstest]
    #[case("[server]\nhost = a\n", None)]
    #[case("[server  edge ]\nhost = a\n", Some("edge"))]
    fn server_sections_take_an_optional_label(#[case] text: &str, #[case] name: Option<&str>) {
        let config = parse_str(text).expect("valid config");
        assert_eq!(config.servers[0].name.as_deref(), name);
    }

    #[rstest]
    fn missing_servers_is_an_error() {
        let err = parse_str("[forward]\nsend_timeout = 10s\n").unwrap_err();
        assert!(matches!(err, ConfigError::NoServers));
    }

    #[rstest]
    fn dns_round_robin_with_udp_is_an_error() {
        let err = parse_str(
            "[forward]\nheartbeat_type = udp\ndns_round_robin = true\n[server a]\nhost = localhost\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DnsRoundRobinWithUdp));
    }

    #[rstest]
    #[case("[forward]\nbogus = 1\n[server a]\nhost = x\n", "bogus")]
    #[case("[server a]\nport = 1\n", "requires host")]
    #[case("[server a]\nhost = x\nweight = many\n", "weight")]
    #[case("[clients]\nhost = x\n", "unknown section")]
    #[case("[serverfoo]\nhost = x\n", "unknown section [serverfoo]")]
    fn rejects_bad_input(#[case] text: &str, #[case] needle: &str) {
        let err = parse_str(text).unwrap_err();
        assert!(err.to_string().contains(needle), "{err}");
    }

    #[rstest]
    #[case("250ms", Duration::from_millis(250))]
    #[case("60", Duration::from_secs(60))]
    #[case("1.5s", Duration::from_millis(1_500))]
    #[case("2m", Duration::from_secs(120))]
    #[case("1h", Duration::from_secs(3_600))]
    fn parses_durations(#[case] input: &str, #[case] expected: Duration) {
        assert_eq!(parse_duration("t", input).expect("duration"), expected);
    }

    #[rstest]
    #[case("fast")]
    #[case("10 weeks")]
    #[case("-1s")]
    fn rejects_bad_durations(#[case] input: &str) {
        assert!(parse_duration("t", input).is_err());
    }

    #[rstest]
    fn loads_from_disk() {
        let mut file = NamedTempFile::new().expect("create temp ini file");
        write!(file, "{SAMPLE}").expect("write ini contents");
        let config = load_file(file.path()).expect("load config");
        assert_eq!(config.servers.len(), 2);
    }

    #[rstest]
    fn empty_file_is_rejected() {
        let file = NamedTempFile::new().expect("create temp ini file");
        let err = load_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("empty file"), "{err}");
    }
}
