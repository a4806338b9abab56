//! Transport descriptor strings (`local`, `ssh://[user@]host[:port][?key=path&os=name]`).

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

pub const LOCAL_AGENT: &str = "local";
pub const SSH_SCHEME: &str = "ssh://";
pub const DEFAULT_SSH_PORT: u16 = 22;

const QUERY_VALUE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'=')
    .add(b'?');
const USER_INFO: &AsciiSet = &QUERY_VALUE.add(b'@').add(b':').add(b'/');

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid agent '{input}': {reason}")]
pub struct TransportParseError {
    pub input: String,
    pub reason: String,
}

impl TransportParseError {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOs {
    Linux,
    Darwin,
    Windows,
}

impl RemoteOs {
    pub fn as_str(self) -> &'static str {
        match self {
            RemoteOs::Linux => "linux",
            RemoteOs::Darwin => "darwin",
            RemoteOs::Windows => "windows",
        }
    }

    pub fn is_windows(self) -> bool {
        self == RemoteOs::Windows
    }
}

impl FromStr for RemoteOs {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "linux" => Ok(RemoteOs::Linux),
            "darwin" | "macos" => Ok(RemoteOs::Darwin),
            "windows" => Ok(RemoteOs::Windows),
            other => Err(format!(
                "unsupported os '{}' (expected linux, darwin or windows)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SshTarget {
    pub host: String,
    pub user: Option<String>,
    pub port: u16,
    pub key_file: Option<PathBuf>,
    pub remote_os: Option<RemoteOs>,
}

impl SshTarget {
    /// `user@host` or `host`, as handed to the ssh client.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    pub fn is_windows(&self) -> bool {
        self.remote_os.map(RemoteOs::is_windows).unwrap_or(false)
    }
}

/// Execution context of one role, parsed once from its descriptor string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Local,
    Ssh(SshTarget),
}

impl TransportKind {
    pub fn parse(input: &str) -> Result<Self, TransportParseError> {
        let raw = input.trim();
        if raw.is_empty() {
            return Err(TransportParseError::new(input, "agent must not be empty"));
        }
        if raw.eq_ignore_ascii_case(LOCAL_AGENT) {
            return Ok(TransportKind::Local);
        }
        let rest = raw.strip_prefix(SSH_SCHEME).ok_or_else(|| {
            TransportParseError::new(input, "unknown transport (expected 'local' or 'ssh://...')")
        })?;

        let (authority, query) = match rest.split_once('?') {
            Some((authority, query)) => (authority, Some(query)),
            None => (rest, None),
        };
        let authority = authority.trim_end_matches('/');
        if authority.contains('/') {
            return Err(TransportParseError::new(
                input,
                "ssh agents do not take a path component",
            ));
        }

        let (user, host_port) = match authority.rsplit_once('@') {
            Some((user, host_port)) => {
                if user.is_empty() {
                    return Err(TransportParseError::new(input, "empty user before '@'"));
                }
                (Some(decode(input, user)?), host_port)
            }
            None => (None, authority),
        };

        let (host, port) = split_host_port(input, host_port)?;
        if host.is_empty() {
            return Err(TransportParseError::new(input, "missing host"));
        }
        let port = match port {
            None => DEFAULT_SSH_PORT,
            Some(raw_port) => match raw_port.parse::<u16>() {
                Ok(0) | Err(_) => {
                    return Err(TransportParseError::new(
                        input,
                        format!("invalid port '{}'", raw_port),
                    ))
                }
                Ok(port) => port,
            },
        };

        let mut key_file = None;
        let mut remote_os = None;
        for pair in query.unwrap_or("").split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                TransportParseError::new(input, format!("option '{}' has no value", pair))
            })?;
            let value = decode(input, value)?;
            if value.is_empty() {
                return Err(TransportParseError::new(
                    input,
                    format!("option '{}' has an empty value", key),
                ));
            }
            match key {
                "key" => key_file = Some(PathBuf::from(value)),
                "os" => {
                    remote_os = Some(
                        value
                            .parse::<RemoteOs>()
                            .map_err(|reason| TransportParseError::new(input, reason))?,
                    )
                }
                other => {
                    return Err(TransportParseError::new(
                        input,
                        format!("unknown option '{}' (expected key or os)", other),
                    ))
                }
            }
        }

        Ok(TransportKind::Ssh(SshTarget {
            host: host.to_string(),
            user,
            port,
            key_file,
            remote_os,
        }))
    }
}

impl FromStr for TransportKind {
    type Err = TransportParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        TransportKind::parse(raw)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = match self {
            TransportKind::Local => return f.write_str(LOCAL_AGENT),
            TransportKind::Ssh(target) => target,
        };
        f.write_str(SSH_SCHEME)?;
        if let Some(user) = &target.user {
            write!(f, "{}@", utf8_percent_encode(user, USER_INFO))?;
        }
        if target.host.contains(':') {
            write!(f, "[{}]", target.host)?;
        } else {
            f.write_str(&target.host)?;
        }
        if target.port != DEFAULT_SSH_PORT {
            write!(f, ":{}", target.port)?;
        }
        let mut options = Vec::new();
        if let Some(key) = &target.key_file {
            options.push(format!(
                "key={}",
                utf8_percent_encode(&key.to_string_lossy(), QUERY_VALUE)
            ));
        }
        if let Some(os) = target.remote_os {
            options.push(format!("os={}", os.as_str()));
        }
        if !options.is_empty() {
            write!(f, "?{}", options.join("&"))?;
        }
        Ok(())
    }
}

fn split_host_port<'a>(
    input: &str,
    host_port: &'a str,
) -> Result<(&'a str, Option<&'a str>), TransportParseError> {
    if let Some(bracketed) = host_port.strip_prefix('[') {
        let (host, after) = bracketed
            .split_once(']')
            .ok_or_else(|| TransportParseError::new(input, "unterminated '[' in host"))?;
        let port = match after {
            "" => None,
            other => Some(other.strip_prefix(':').ok_or_else(|| {
                TransportParseError::new(input, "unexpected text after ']'")
            })?),
        };
        return Ok((host, port));
    }
    match host_port.split_once(':') {
        Some((_, port)) if port.contains(':') => Err(TransportParseError::new(
            input,
            "IPv6 hosts must be written in brackets",
        )),
        Some((host, port)) => Ok((host, Some(port))),
        None => Ok((host_port, None)),
    }
}

fn decode(input: &str, raw: &str) -> Result<String, TransportParseError> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|value| value.into_owned())
        .map_err(|_| TransportParseError::new(input, "percent-encoded value is not valid UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ssh(raw: &str) -> SshTarget {
        match TransportKind::parse(raw).expect("ssh agent should parse") {
            TransportKind::Ssh(target) => target,
            TransportKind::Local => panic!("expected ssh agent for {}", raw),
        }
    }

    #[test]
    fn parses_local_in_any_case() {
        assert_eq!(TransportKind::parse("local").expect("local"), TransportKind::Local);
        assert_eq!(TransportKind::parse(" LOCAL ").expect("local"), TransportKind::Local);
    }

    #[test]
    fn parses_full_ssh_descriptor() {
        let target = ssh("ssh://ops@10.0.0.5:2222?key=/home/ops/.ssh/id_ed25519&os=linux");
        assert_eq!(target.host, "10.0.0.5");
        assert_eq!(target.user.as_deref(), Some("ops"));
        assert_eq!(target.port, 2222);
        assert_eq!(
            target.key_file.as_deref(),
            Some(std::path::Path::new("/home/ops/.ssh/id_ed25519"))
        );
        assert_eq!(target.remote_os, Some(RemoteOs::Linux));
        assert_eq!(target.destination(), "ops@10.0.0.5");
    }

    #[test]
    fn ssh_defaults_port_and_options() {
        let target = ssh("ssh://plc-lab");
        assert_eq!(target.host, "plc-lab");
        assert_eq!(target.user, None);
        assert_eq!(target.port, DEFAULT_SSH_PORT);
        assert_eq!(target.key_file, None);
        assert_eq!(target.remote_os, None);
    }

    #[test]
    fn parses_bracketed_ipv6_and_encoded_key() {
        let target = ssh("ssh://[fe80::1]:22?key=C%3A%5Ckeys%5Cid%20rsa&os=windows");
        assert_eq!(target.host, "fe80::1");
        assert_eq!(
            target.key_file.as_deref(),
            Some(std::path::Path::new("C:\\keys\\id rsa"))
        );
        assert!(target.is_windows());
    }

    #[test]
    fn rejects_malformed_descriptors() {
        for raw in [
            "",
            "docker://box",
            "ssh://",
            "ssh://@host",
            "ssh://host:0",
            "ssh://host:abc",
            "ssh://host:70000",
            "ssh://fe80::1",
            "ssh://host/path",
            "ssh://host?color=red",
            "ssh://host?key",
            "ssh://host?os=plan9",
        ] {
            assert!(
                TransportKind::parse(raw).is_err(),
                "descriptor should be rejected: {:?}",
                raw
            );
        }
    }

    #[test]
    fn display_round_trips_through_parse() {
        for raw in [
            "local",
            "ssh://plc-lab",
            "ssh://ops@10.0.0.5:2222",
            "ssh://ops@[fe80::1]:2200?os=darwin",
            "ssh://host?key=/keys/with%20space&os=linux",
        ] {
            let kind = TransportKind::parse(raw).expect("parse");
            let rendered = kind.to_string();
            assert_eq!(
                TransportKind::parse(&rendered).expect("reparse"),
                kind,
                "round trip through {}",
                rendered
            );
        }
        assert_eq!(
            TransportKind::parse("ssh://h:22?os=linux").expect("parse").to_string(),
            "ssh://h?os=linux"
        );
    }
}
