// Named SQL Server connections and ordered multi-step query requests

// Module declarations
pub mod db;

pub use db::traits::DatabaseError as Error;
pub use db::{
    ConnectionConfig, ConnectionHandle, ConnectionRef, ConnectionRegistry, Executor, QueryConfig,
    QueryText, RecordSet, RequestContext, Result, Results, SqlType, StepAction, StepOutput, Value,
};

use db::{Driver, MssqlDriver, Settings};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Step alias used by the single-query helpers
pub const RESULTS_STEP: &str = "results";

/// Entry point: register connections, then build requests against them.
///
/// ```no_run
/// # async fn run() -> mssql_steps::Result<()> {
/// use mssql_steps::{ConnectionConfig, MssqlUtil, QueryConfig, Value};
///
/// let util = MssqlUtil::mssql();
/// util.add_connection(ConnectionConfig::new().with_server("db1").with_user("sa")).await?;
///
/// let results = util
///     .get_query_context(None::<&str>)?
///     .step("user", QueryConfig::new("SELECT * FROM users WHERE id = @id").param("id", 1))
///     .step_fn("orders", |execute, so_far| async move {
///         let user_id = so_far["user"]
///             .as_rows()
///             .and_then(|rows| rows.first())
///             .and_then(|row| row.get("id"))
///             .cloned()
///             .unwrap_or(Value::Null);
///         execute
///             .execute(QueryConfig::new("SELECT * FROM orders WHERE user_id = @id").param("id", user_id))
///             .await
///     })
///     .query()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MssqlUtil {
    registry: ConnectionRegistry,
}

impl MssqlUtil {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            registry: ConnectionRegistry::new(driver),
        }
    }

    /// Facade over the SQL Server driver
    pub fn mssql() -> Self {
        Self::new(Arc::new(MssqlDriver::new()))
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub async fn add_connection(&self, config: ConnectionConfig) -> Result<Arc<ConnectionHandle>> {
        self.registry.register(config).await
    }

    /// Register every connection listed in a TOML settings file, in order.
    /// Stops at the first connection that fails to open.
    pub async fn add_connections_from_file(&self, path: impl AsRef<Path>) -> Result<Vec<Arc<ConnectionHandle>>> {
        let settings = Settings::load(path).await?;
        let mut handles = Vec::with_capacity(settings.connections.len());
        for config in settings.connections {
            handles.push(self.registry.register(config).await?);
        }
        info!("Registered {} connections from settings", handles.len());
        Ok(handles)
    }

    /// Start a request on a registered connection
    pub fn get_query_context(&self, connection: impl Into<ConnectionRef>) -> Result<RequestContext> {
        let handle = self.registry.resolve(connection)?;
        Ok(RequestContext::new(handle))
    }

    /// Run one query on the default connection; its rows land under `"results"`
    pub async fn execute(&self, query: impl Into<StepAction>) -> Result<Results> {
        self.execute_on(ConnectionRef::Default, query).await
    }

    pub async fn execute_on(
        &self,
        connection: impl Into<ConnectionRef>,
        query: impl Into<StepAction>,
    ) -> Result<Results> {
        self.get_query_context(connection)?
            .step(RESULTS_STEP, query)
            .query()
            .await
    }
}
