// Connection Settings
// Loads connection configurations from a TOML file:
//
//   [[connections]]
//   name = "reporting"
//   server = "db1"
//   user = "report"
//   password_env = "REPORT_PASSWORD"

use crate::db::config::ConnectionConfig;
use crate::db::traits::Result;
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

impl Settings {
    /// Parse settings, resolving `password_env` for every connection
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut settings: Settings = toml::from_str(content)?;
        for connection in &mut settings.connections {
            connection.apply_password_env()?;
        }
        Ok(settings)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading connection settings from {}", path.display());
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&content)
    }
}
