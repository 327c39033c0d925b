// Driver Traits
// The seam between the request machinery and a concrete database driver

use crate::db::config::ConnectionConfig;
use crate::db::queue::{Aborted, DuplicateAlias};
use crate::db::registry::TerminationNotifier;
use crate::db::types::{RecordSet, SqlType, Value};
use std::sync::Arc;

/// Common error type
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection with name \"{0}\" does not exist.")]
    ConnectionNotFound(String),

    #[error("Connection \"{name}\" failed to open: {source}")]
    ConnectionOpenFailed {
        name: String,
        #[source]
        source: Box<DatabaseError>,
    },

    #[error("Connection \"{0}\" has been terminated")]
    ConnectionTerminated(String),

    #[error("Connection \"{0}\" was registered again while opening")]
    RegistrationSuperseded(String),

    #[error("Query execution error: {0}")]
    QueryError(String),

    #[error("Invalid parameter \"{name}\": {reason}")]
    InvalidParam { name: String, reason: String },

    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    #[error("Pool error: {0}")]
    PoolError(String),

    #[error(transparent)]
    DuplicateStep(#[from] DuplicateAlias),

    #[error("{0}")]
    Step(String),

    #[error(transparent)]
    Aborted(#[from] Aborted),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Settings error: {0}")]
    Settings(#[from] toml::de::Error),
}

impl DatabaseError {
    /// Failure raised by user code inside a computed step
    pub fn step(message: impl Into<String>) -> Self {
        DatabaseError::Step(message.into())
    }
}

pub type Result<T> = std::result::Result<T, DatabaseError>;

/// A bound request input
#[derive(Debug, Clone, PartialEq)]
pub struct Input {
    pub name: String,
    pub ty: Option<SqlType>,
    pub value: Value,
}

/// An open physical connection (or pool) produced by a driver
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    /// Canonical name the connection was opened under
    fn connection_id(&self) -> &str;

    /// Execute one SQL statement with its bound inputs
    async fn execute(&self, sql: &str, inputs: &[Input]) -> Result<RecordSet>;

    /// Close the connection. Drivers must report the close through the
    /// notifier they were handed at open time.
    async fn close(&self) -> Result<()>;
}

/// Database driver trait - opens connections from configuration
#[async_trait::async_trait]
pub trait Driver: Send + Sync {
    fn driver_name(&self) -> &'static str;

    /// Open a connection. The notifier must be fired when the connection
    /// later closes or fails.
    async fn open(
        &self,
        config: &ConnectionConfig,
        notifier: TerminationNotifier,
    ) -> Result<Arc<dyn Connection>>;
}

/// A single request against a connection: collect inputs, then execute
pub struct Request<'a> {
    connection: &'a dyn Connection,
    inputs: Vec<Input>,
}

impl<'a> Request<'a> {
    pub fn new(connection: &'a dyn Connection) -> Self {
        Self {
            connection,
            inputs: Vec::new(),
        }
    }

    /// Bind an input, letting the driver infer its type from the value
    pub fn input(&mut self, name: impl Into<String>, value: Value) -> &mut Self {
        self.inputs.push(Input {
            name: name.into(),
            ty: None,
            value,
        });
        self
    }

    /// Bind an input with an explicit type
    pub fn input_typed(&mut self, name: impl Into<String>, ty: SqlType, value: Value) -> &mut Self {
        self.inputs.push(Input {
            name: name.into(),
            ty: Some(ty),
            value,
        });
        self
    }

    pub fn inputs(&self) -> &[Input] {
        &self.inputs
    }

    pub async fn execute(self, sql: &str) -> Result<RecordSet> {
        self.connection.execute(sql, &self.inputs).await
    }
}
