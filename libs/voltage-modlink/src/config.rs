//! Link configuration
//!
//! One [`LinkConfig`] describes a codec, a transport and the connection
//! timing. Files are YAML, TOML or JSON; `MODLINK_` environment variables
//! override file values (nested keys use `__`, e.g.
//! `MODLINK_TRANSPORT__PORT=1502`).

use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::codec::ProtocolKind;
use crate::connection::ConnectionOptions;
use crate::error::{ModbusError, ModbusResult};
use crate::transport::{SerialTransportConfig, TcpTransportConfig};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "MODLINK_";

const SERIAL_INTER_REQUEST_DELAY_US: u64 = 1750;

/// Physical link settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    Tcp(TcpTransportConfig),
    Serial(SerialTransportConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Tcp(TcpTransportConfig::default())
    }
}

impl TransportConfig {
    pub fn validate(&self) -> ModbusResult<()> {
        let result = match self {
            TransportConfig::Tcp(tcp) => tcp.validate(),
            TransportConfig::Serial(serial) => serial.validate(),
        };
        result.map_err(|e| ModbusError::config(e.to_string()))
    }
}

/// Codec, transport and connection timing of one link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub protocol: ProtocolKind,
    pub transport: TransportConfig,
    /// Stop reconnecting after this long; absent retries forever
    pub connect_timeout_ms: Option<u64>,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    /// Defaults to 1750us on serial links and 0 on TCP
    pub inter_request_delay_us: Option<u64>,
    pub reconnect_min_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolKind::Tcp,
            transport: TransportConfig::default(),
            connect_timeout_ms: None,
            read_timeout_ms: 1000,
            write_timeout_ms: 1000,
            idle_timeout_ms: 6000,
            inter_request_delay_us: None,
            reconnect_min_delay_ms: 1000,
            reconnect_max_delay_ms: 60_000,
        }
    }
}

impl LinkConfig {
    pub fn tcp(protocol: ProtocolKind, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            transport: TransportConfig::Tcp(TcpTransportConfig::new(host, port)),
            ..Self::default()
        }
    }

    pub fn serial(protocol: ProtocolKind, device: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            protocol,
            transport: TransportConfig::Serial(SerialTransportConfig::new(device, baud_rate)),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> ModbusResult<()> {
        self.transport.validate()?;

        let required = [
            ("read_timeout_ms", self.read_timeout_ms),
            ("write_timeout_ms", self.write_timeout_ms),
            ("idle_timeout_ms", self.idle_timeout_ms),
            ("reconnect_min_delay_ms", self.reconnect_min_delay_ms),
        ];
        if let Some((name, _)) = required.iter().find(|(_, value)| *value == 0) {
            return Err(ModbusError::config(format!("{name} must be greater than zero")));
        }
        if self.connect_timeout_ms == Some(0) {
            return Err(ModbusError::config(
                "connect_timeout_ms must be greater than zero; omit it to retry forever",
            ));
        }
        if self.reconnect_max_delay_ms < self.reconnect_min_delay_ms {
            return Err(ModbusError::config(format!(
                "reconnect_max_delay_ms ({}) is below reconnect_min_delay_ms ({})",
                self.reconnect_max_delay_ms, self.reconnect_min_delay_ms
            )));
        }
        Ok(())
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        let inter_request_delay_us = self
            .inter_request_delay_us
            .unwrap_or(match self.transport {
                TransportConfig::Serial(_) => SERIAL_INTER_REQUEST_DELAY_US,
                TransportConfig::Tcp(_) => 0,
            });
        ConnectionOptions {
            connect_timeout: self.connect_timeout_ms.map(Duration::from_millis),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            inter_request_delay: Duration::from_micros(inter_request_delay_us),
            reconnect_min_delay: Duration::from_millis(self.reconnect_min_delay_ms),
            reconnect_max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
        }
    }
}

/// Load and validate a link configuration file, applying `MODLINK_` overrides
pub fn load_link_config(path: impl AsRef<Path>) -> ModbusResult<LinkConfig> {
    load_with_env_prefix(path.as_ref(), ENV_PREFIX)
}

fn load_with_env_prefix(path: &Path, prefix: &str) -> ModbusResult<LinkConfig> {
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(|| ModbusError::config("Config file must have an extension"))?;

    let figment = match extension {
        "toml" => Figment::new().merge(Toml::file(path)),
        "yaml" | "yml" => Figment::new().merge(Yaml::file(path)),
        "json" => Figment::new().merge(Json::file(path)),
        _ => {
            return Err(ModbusError::config(format!(
                "Unsupported config file format: {extension}"
            )))
        },
    };

    let config: LinkConfig = figment.merge(Env::prefixed(prefix).split("__")).extract()?;
    config.validate()?;
    debug!(
        "Loaded link config from {}: {} over {:?}",
        path.display(),
        config.protocol,
        config.transport
    );
    Ok(config)
}
