// src/binder.rs
//
// Binds the flat property set onto the typed connection and listener settings.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use amq_protocol_types::ShortUInt;
use serde::Serialize;
use tracing::debug;

use crate::config::{canonical_key, PropertySet};
use crate::errors::{AutoConfigError, Result};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_USERNAME: &str = "guest";
pub const DEFAULT_PASSWORD: &str = "guest";
pub const DEFAULT_VIRTUAL_HOST: &str = "/";

const KNOWN_KEYS: &[&str] = &[
    "host",
    "port",
    "username",
    "password",
    "virtual_host",
    "dynamic",
    "requested_heartbeat",
    "ssl.enabled",
    "ssl.key_store",
    "ssl.key_store_password",
    "ssl.trust_store",
    "ssl.trust_store_password",
    "listener.auto_startup",
    "listener.acknowledge_mode",
    "listener.concurrency",
    "listener.max_concurrency",
    "listener.prefetch",
    "listener.transaction_size",
];

/// How a listener container acknowledges deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AcknowledgeMode {
    /// The broker considers a delivery acknowledged as soon as it is sent.
    None,
    /// The container acknowledges once the handler returns successfully.
    #[default]
    Auto,
    /// The handler acknowledges explicitly.
    Manual,
}

impl FromStr for AcknowledgeMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(AcknowledgeMode::None),
            "auto" => Ok(AcknowledgeMode::Auto),
            "manual" => Ok(AcknowledgeMode::Manual),
            other => Err(format!("unknown acknowledge mode '{}', expected none|auto|manual", other)),
        }
    }
}

impl fmt::Display for AcknowledgeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AcknowledgeMode::None => "none",
            AcknowledgeMode::Auto => "auto",
            AcknowledgeMode::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// Everything needed to open a broker connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSpec {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub virtual_host: String,
    pub use_ssl: bool,
    pub key_store: Option<PathBuf>,
    #[serde(skip_serializing)]
    pub key_store_password: Option<String>,
    pub trust_store: Option<PathBuf>,
    #[serde(skip_serializing)]
    pub trust_store_password: Option<String>,
    /// Heartbeat in seconds; 0 leaves the choice to the client/broker negotiation.
    pub requested_heartbeat: ShortUInt,
}

impl Default for ConnectionSpec {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            username: DEFAULT_USERNAME.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
            virtual_host: DEFAULT_VIRTUAL_HOST.to_string(),
            use_ssl: false,
            key_store: None,
            key_store_password: None,
            trust_store: None,
            trust_store_password: None,
            requested_heartbeat: 0,
        }
    }
}

impl ConnectionSpec {
    /// Default settings pointed at `host:port`.
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ..Self::default()
        }
    }
}

/// Settings copied onto the default listener container factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerSpec {
    pub auto_startup: bool,
    pub acknowledge_mode: AcknowledgeMode,
    pub concurrency: Option<u32>,
    pub max_concurrency: Option<u32>,
    pub prefetch: Option<ShortUInt>,
    pub transaction_size: Option<u32>,
}

impl Default for ListenerSpec {
    fn default() -> Self {
        Self {
            auto_startup: true,
            acknowledge_mode: AcknowledgeMode::default(),
            concurrency: None,
            max_concurrency: None,
            prefetch: None,
            transaction_size: None,
        }
    }
}

/// The bound root of the RabbitMQ properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RabbitProperties {
    pub connection: ConnectionSpec,
    pub listener: ListenerSpec,
    /// Whether an admin component may declare broker topology at runtime.
    pub dynamic: bool,
}

impl Default for RabbitProperties {
    fn default() -> Self {
        Self {
            connection: ConnectionSpec::default(),
            listener: ListenerSpec::default(),
            dynamic: true,
        }
    }
}

/// Empty means the default virtual host; anything else is kept as written.
pub fn normalize_virtual_host(virtual_host: Option<&str>) -> String {
    match virtual_host {
        None | Some("") => DEFAULT_VIRTUAL_HOST.to_string(),
        Some(other) => other.to_string(),
    }
}

impl RabbitProperties {
    /// Binds every property under `prefix`, falling back to defaults for unset keys.
    pub fn bind(properties: &PropertySet, prefix: &str) -> Result<Self> {
        let binder = Binder {
            properties: properties.subset(prefix),
            prefix,
        };
        binder.report_unknown_keys();

        let defaults = ConnectionSpec::default();
        let connection = ConnectionSpec {
            host: binder.string("host").unwrap_or(defaults.host),
            port: binder.parsed("port")?.unwrap_or(defaults.port),
            username: binder.string("username").unwrap_or(defaults.username),
            password: binder.string("password").unwrap_or(defaults.password),
            virtual_host: normalize_virtual_host(binder.raw("virtual_host")),
            use_ssl: binder.flag("ssl.enabled")?.unwrap_or(false),
            key_store: binder.string("ssl.key_store").map(PathBuf::from),
            key_store_password: binder.string("ssl.key_store_password"),
            trust_store: binder.string("ssl.trust_store").map(PathBuf::from),
            trust_store_password: binder.string("ssl.trust_store_password"),
            requested_heartbeat: binder
                .parsed("requested_heartbeat")?
                .unwrap_or(defaults.requested_heartbeat),
        };

        let listener = ListenerSpec {
            auto_startup: binder.flag("listener.auto_startup")?.unwrap_or(true),
            acknowledge_mode: binder
                .parsed("listener.acknowledge_mode")?
                .unwrap_or_default(),
            concurrency: binder.parsed("listener.concurrency")?,
            max_concurrency: binder.parsed("listener.max_concurrency")?,
            prefetch: binder.parsed("listener.prefetch")?,
            transaction_size: binder.parsed("listener.transaction_size")?,
        };

        let bound = RabbitProperties {
            connection,
            listener,
            dynamic: binder.flag("dynamic")?.unwrap_or(true),
        };
        debug!(
            host = %bound.connection.host,
            port = bound.connection.port,
            virtual_host = %bound.connection.virtual_host,
            ssl = bound.connection.use_ssl,
            dynamic = bound.dynamic,
            "Bound RabbitMQ properties"
        );
        Ok(bound)
    }
}

struct Binder<'a> {
    properties: PropertySet,
    prefix: &'a str,
}

impl Binder<'_> {
    fn raw(&self, key: &str) -> Option<&str> {
        self.properties.get(key)
    }

    fn string(&self, key: &str) -> Option<String> {
        self.raw(key).map(str::to_string)
    }

    fn full_key(&self, key: &str) -> String {
        let spelled = self.properties.source_key(key).unwrap_or(key);
        if self.prefix.is_empty() {
            spelled.to_string()
        } else {
            format!("{}.{}", self.prefix, spelled)
        }
    }

    fn parsed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.raw(key) {
            None => Ok(None),
            Some(value) => value
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| AutoConfigError::invalid(&self.full_key(key), value, e.to_string())),
        }
    }

    fn flag(&self, key: &str) -> Result<Option<bool>> {
        match self.raw(key) {
            None => Ok(None),
            Some(value) => match value.trim().to_lowercase().as_str() {
                "true" => Ok(Some(true)),
                "false" => Ok(Some(false)),
                _ => Err(AutoConfigError::invalid(
                    &self.full_key(key),
                    value,
                    "expected true or false",
                )),
            },
        }
    }

    fn report_unknown_keys(&self) {
        for (key, _) in self.properties.iter() {
            let canonical = canonical_key(key);
            if !KNOWN_KEYS.iter().any(|known| canonical_key(known) == canonical) {
                debug!(key = %self.full_key(key), "Ignoring unknown property");
            }
        }
    }
}
