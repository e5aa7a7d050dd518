use anyhow::bail;
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;

use crate::protocol::{Properties, QoS};

fn default_keep_alive() -> u16 {
    60
}

fn default_clean_start() -> bool {
    true
}

fn default_ws_path() -> String {
    "/mqtt".to_string()
}

/// CONNECT parameters for an endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectOptions {
    pub client_id: String,
    /// Keep-alive interval in seconds; 0 disables the keep-alive contract.
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u16,
    /// Clean session flag (v3.1.1) / clean start flag (v5).
    #[serde(default = "default_clean_start")]
    pub clean_start: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<Vec<u8>>,
    #[serde(default)]
    pub will: Option<Will>,
    /// CONNECT properties (v5 only; ignored on v3.1.1 connections).
    #[serde(skip)]
    pub properties: Properties,
}

impl ConnectOptions {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            keep_alive: default_keep_alive(),
            clean_start: default_clean_start(),
            username: None,
            password: None,
            will: None,
            properties: Properties::default(),
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<Vec<u8>>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    pub fn with_clean_start(mut self, clean: bool) -> Self {
        self.clean_start = clean;
        self
    }

    pub fn with_will(mut self, will: Will) -> Self {
        self.will = Some(will);
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }
}

/// Last-will message registered at connect time.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Will {
    pub topic: String,
    pub payload: Vec<u8>,
    #[serde(default)]
    pub qos: QoS,
    #[serde(default)]
    pub retain: bool,
    /// Will properties (v5 only).
    #[serde(skip)]
    pub properties: Properties,
}

impl Will {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
            properties: Properties::default(),
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Transport flavor selected by URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportScheme {
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl TransportScheme {
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_lowercase().as_str() {
            "tcp" | "mqtt" | "" => Some(Self::Tcp),
            "tls" | "mqtts" | "ssl" => Some(Self::Tls),
            "ws" => Some(Self::Ws),
            "wss" => Some(Self::Wss),
            _ => None,
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Self::Tcp => 1883,
            Self::Tls => 8883,
            Self::Ws => 80,
            Self::Wss => 443,
        }
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self, Self::Ws | Self::Wss)
    }
}

/// Where and how to dial the broker.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    pub scheme: TransportScheme,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    /// HTTP path for WebSocket transports.
    #[serde(default = "default_ws_path")]
    pub path: String,
    #[serde(default)]
    pub tls: Option<TlsOptions>,
}

impl TransportConfig {
    pub fn new(scheme: TransportScheme, host: impl Into<String>) -> Self {
        Self {
            scheme,
            host: host.into(),
            port: None,
            path: default_ws_path(),
            tls: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Effective port: explicit, or the scheme default.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.scheme.default_port())
    }
}

impl FromStr for TransportConfig {
    type Err = anyhow::Error;

    /// Parses `scheme://host[:port][/path]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme_str, rest) = match s.split_once("://") {
            Some(parts) => parts,
            None => ("tcp", s),
        };
        let scheme = match TransportScheme::from_scheme(scheme_str) {
            Some(scheme) => scheme,
            None => bail!("unsupported transport scheme {scheme_str}"),
        };
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], rest[idx..].to_string()),
            None => (rest, default_ws_path()),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), Some(port.parse::<u16>()?)),
            None => (authority.to_string(), None),
        };
        if host.is_empty() {
            bail!("missing host in transport url {s}");
        }
        Ok(Self {
            scheme,
            host,
            port,
            path,
            tls: None,
        })
    }
}

/// TLS knobs for `mqtts`/`wss` transports.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsOptions {
    /// Extra PEM CA bundle trusted alongside the webpki roots.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    /// Override for the SNI / certificate name (defaults to the host).
    #[serde(default)]
    pub server_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_url_round_trip() {
        let cfg: TransportConfig = "mqtts://broker.example:8884".parse().unwrap();
        assert_eq!(cfg.scheme, TransportScheme::Tls);
        assert_eq!(cfg.host, "broker.example");
        assert_eq!(cfg.port(), 8884);

        let cfg: TransportConfig = "ws://broker.example/custom".parse().unwrap();
        assert_eq!(cfg.scheme, TransportScheme::Ws);
        assert_eq!(cfg.port(), 80);
        assert_eq!(cfg.path, "/custom");

        let cfg: TransportConfig = "broker.example".parse().unwrap();
        assert_eq!(cfg.scheme, TransportScheme::Tcp);
        assert_eq!(cfg.port(), 1883);
    }

    #[test]
    fn transport_url_rejects_garbage() {
        assert!("quic://broker".parse::<TransportConfig>().is_err());
        assert!("mqtt://".parse::<TransportConfig>().is_err());
    }
}
