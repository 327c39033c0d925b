// Connection Configuration
// Connection settings plus the naming rules used to store and look up connections

use crate::db::traits::{DatabaseError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name used when a caller does not say which connection it wants
pub const DEFAULT_CONNECTION: &str = "default";

/// Separator between the parts of an alias key
pub const ALIAS_SEPARATOR: &str = "-";

/// Connection configuration. Fields the core does not interpret are kept in
/// `options` and passed through to the driver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub name: Option<String>,
    pub host: Option<String>,
    pub server: Option<String>,
    pub user: Option<String>,
    #[serde(skip_serializing)] // Don't serialize password
    pub password: Option<String>,
    /// Environment variable holding the password
    pub password_env: Option<String>,
    pub database: Option<String>,
    pub domain: Option<String>,
    pub port: Option<u16>,
    #[serde(flatten)]
    pub options: BTreeMap<String, serde_json::Value>,
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Address of the server, preferring `host` over `server`
    pub fn server_address(&self) -> Option<&str> {
        self.host.as_deref().or(self.server.as_deref())
    }

    /// Copy `host` into `server`, which is the field drivers read
    pub fn normalize_host(&mut self) {
        if let Some(host) = &self.host {
            self.server = Some(host.clone());
        }
    }

    /// Key derived from the physical connection parameters
    pub fn alias_key(&self) -> String {
        let port = self.port.map(|p| p.to_string());
        [
            self.server_address(),
            self.user.as_deref(),
            self.database.as_deref(),
            self.domain.as_deref(),
            port.as_deref(),
        ]
        .into_iter()
        .map(|part| part.unwrap_or(""))
        .collect::<Vec<_>>()
        .join(ALIAS_SEPARATOR)
    }

    pub fn option_bool(&self, key: &str) -> Option<bool> {
        self.options.get(key).and_then(|v| match v {
            serde_json::Value::Bool(b) => Some(*b),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        })
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(serde_json::Value::as_str)
    }

    /// Fill `password` from `password_env` when no password was given
    pub fn apply_password_env(&mut self) -> Result<()> {
        if self.password.is_some() {
            return Ok(());
        }
        if let Some(var) = &self.password_env {
            let password = std::env::var(var).map_err(|e| {
                DatabaseError::InvalidConfig(format!("Password variable {}: {}", var, e))
            })?;
            self.password = Some(password);
        }
        Ok(())
    }
}

/// How a caller refers to a connection
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ConnectionRef {
    #[default]
    Default,
    Name(String),
    Config(ConnectionConfig),
}

impl From<&str> for ConnectionRef {
    fn from(name: &str) -> Self {
        ConnectionRef::Name(name.to_string())
    }
}

impl From<String> for ConnectionRef {
    fn from(name: String) -> Self {
        ConnectionRef::Name(name)
    }
}

impl From<ConnectionConfig> for ConnectionRef {
    fn from(config: ConnectionConfig) -> Self {
        ConnectionRef::Config(config)
    }
}

impl From<&ConnectionConfig> for ConnectionRef {
    fn from(config: &ConnectionConfig) -> Self {
        ConnectionRef::Config(config.clone())
    }
}

impl<T: Into<ConnectionRef>> From<Option<T>> for ConnectionRef {
    fn from(reference: Option<T>) -> Self {
        reference.map(Into::into).unwrap_or_default()
    }
}

/// Name a configuration is stored under.
///
/// An explicit `name` always wins. Without one, the first connection becomes
/// `"default"`; once a default exists, unnamed configurations are keyed by
/// their alias key.
pub fn config_name(config: &ConnectionConfig, default_registered: bool) -> String {
    if let Some(name) = config.name.as_deref().filter(|n| !n.is_empty()) {
        name.to_string()
    } else if default_registered {
        config.alias_key()
    } else {
        DEFAULT_CONNECTION.to_string()
    }
}

/// Lookup name for any reference shape, before alias indirection
pub fn canonical_name(reference: &ConnectionRef, default_registered: bool) -> String {
    match reference {
        ConnectionRef::Default => DEFAULT_CONNECTION.to_string(),
        ConnectionRef::Name(name) => name.clone(),
        ConnectionRef::Config(config) => config_name(config, default_registered),
    }
}
