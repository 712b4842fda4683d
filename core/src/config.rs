//! Engine configuration and the sources it is read from.
//!
//! Keys are dotted `section.name` strings. `EnvConfig` maps them onto
//! environment variables (`network.useragent` -> `URLFETCH_NETWORK_USERAGENT`);
//! `MapConfig` is an in-memory source for tests and embedders that keep their
//! own settings store. A missing key is the normal case and means "use the
//! default".

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub const KEY_USER_AGENT: &str = "network.useragent";
pub const KEY_IMPLEMENTATION: &str = "network.implementation";

/// Read-only key lookup.
pub trait ConfigSource {
    fn lookup(&self, key: &str) -> Option<String>;
}

/// Reads `URLFETCH_<SECTION>_<NAME>` environment variables.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    prefix: String,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvConfig {
    pub fn new() -> Self {
        Self::with_prefix("URLFETCH")
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn var_name(&self, key: &str) -> String {
        let suffix: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("{}_{suffix}", self.prefix)
    }
}

impl ConfigSource for EnvConfig {
    fn lookup(&self, key: &str) -> Option<String> {
        std::env::var(self.var_name(key)).ok().filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MapConfig(HashMap<String, String>);

impl MapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }
}

impl ConfigSource for MapConfig {
    fn lookup(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }
}

/// Which transport backs every request of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Hand-written HTTP/1.1 over one socket per request.
    #[default]
    Socket,
    /// `ureq` agent with its own connection pool.
    Pooled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownTransport(pub String);

impl fmt::Display for UnknownTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown transport implementation {:?}", self.0)
    }
}

impl std::error::Error for UnknownTransport {}

impl FromStr for TransportKind {
    type Err = UnknownTransport;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" | "socket" | "urllib" => Ok(TransportKind::Socket),
            "pooled" | "requests" => Ok(TransportKind::Pooled),
            other => Err(UnknownTransport(other.to_string())),
        }
    }
}

/// Settings resolved once when an `Engine` is built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineConfig {
    /// Applied when a request sets no `User-Agent` of its own.
    pub user_agent: Option<String>,
    pub implementation: TransportKind,
}

impl EngineConfig {
    /// Read the engine settings from `source`. An unrecognised implementation
    /// name falls back to the default transport with a warning.
    pub fn load(source: &dyn ConfigSource) -> Self {
        let implementation = match source.lookup(KEY_IMPLEMENTATION) {
            Some(name) => name.parse().unwrap_or_else(|err: UnknownTransport| {
                tracing::warn!(%err, "falling back to the default transport");
                TransportKind::default()
            }),
            None => TransportKind::default(),
        };
        Self {
            user_agent: source.lookup(KEY_USER_AGENT),
            implementation,
        }
    }

    pub fn from_env() -> Self {
        Self::load(&EnvConfig::new())
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    pub fn implementation(mut self, kind: TransportKind) -> Self {
        self.implementation = kind;
        self
    }
}
