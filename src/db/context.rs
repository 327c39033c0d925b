// Request Context
// Binds a step queue to one connection. Steps are either a query configuration
// or a function of an executor and the results so far.

use crate::db::queue::{PendingResults, StepQueue};
use crate::db::registry::ConnectionHandle;
use crate::db::traits::{DatabaseError, Request, Result};
use crate::db::types::{Param, RecordSet, Results, SqlType, StepOutput, Value};
use futures::future::{BoxFuture, FutureExt};
use indexmap::IndexMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// SQL text, either known up front or produced later (e.g. read from a file)
pub enum QueryText {
    Literal(String),
    Deferred(BoxFuture<'static, Result<String>>),
}

impl QueryText {
    pub fn deferred<F>(text: F) -> Self
    where
        F: Future<Output = Result<String>> + Send + 'static,
    {
        QueryText::Deferred(text.boxed())
    }

    /// Read the SQL from `path` when the step runs
    pub fn from_file(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        Self::deferred(async move {
            debug!("Loading query from {}", path.display());
            Ok(tokio::fs::read_to_string(&path).await?)
        })
    }

    pub async fn resolve(self) -> Result<String> {
        match self {
            QueryText::Literal(sql) => Ok(sql),
            QueryText::Deferred(text) => text.await,
        }
    }
}

impl std::fmt::Debug for QueryText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryText::Literal(sql) => f.debug_tuple("Literal").field(sql).finish(),
            QueryText::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

impl From<&str> for QueryText {
    fn from(sql: &str) -> Self {
        QueryText::Literal(sql.to_string())
    }
}

impl From<String> for QueryText {
    fn from(sql: String) -> Self {
        QueryText::Literal(sql)
    }
}

/// One query with its named parameters, bound in insertion order
#[derive(Debug)]
pub struct QueryConfig {
    pub query: QueryText,
    pub params: IndexMap<String, Param>,
}

impl QueryConfig {
    pub fn new(query: impl Into<QueryText>) -> Self {
        Self {
            query: query.into(),
            params: IndexMap::new(),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Self {
        Self::new(QueryText::from_file(path))
    }

    /// Add a parameter whose SQL type the driver infers
    pub fn param(mut self, name: impl Into<String>, value: impl Into<Param>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Add a parameter with an explicit SQL type
    pub fn typed_param(mut self, name: impl Into<String>, ty: SqlType, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), Param::typed(ty, value));
        self
    }
}

impl From<&str> for QueryConfig {
    fn from(sql: &str) -> Self {
        Self::new(sql)
    }
}

impl From<String> for QueryConfig {
    fn from(sql: String) -> Self {
        Self::new(sql)
    }
}

pub type StepFuture = BoxFuture<'static, Result<StepOutput>>;

type ComputedStep = Box<dyn FnOnce(Executor, Results) -> StepFuture + Send>;

/// What a step does when its turn comes
pub enum StepAction {
    /// Run this query on the context's connection
    Literal(QueryConfig),
    /// Call user code with an executor and a snapshot of prior results
    Computed(ComputedStep),
}

impl StepAction {
    pub fn computed<F, Fut, O>(action: F) -> Self
    where
        F: FnOnce(Executor, Results) -> Fut + Send + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
        O: Into<StepOutput>,
    {
        StepAction::Computed(Box::new(move |executor, results| {
            action(executor, results).map(|out| out.map(Into::into)).boxed()
        }))
    }
}

impl std::fmt::Debug for StepAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepAction::Literal(config) => f.debug_tuple("Literal").field(config).finish(),
            StepAction::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

impl From<QueryConfig> for StepAction {
    fn from(config: QueryConfig) -> Self {
        StepAction::Literal(config)
    }
}

impl From<&str> for StepAction {
    fn from(sql: &str) -> Self {
        StepAction::Literal(sql.into())
    }
}

impl From<String> for StepAction {
    fn from(sql: String) -> Self {
        StepAction::Literal(sql.into())
    }
}

/// Runs queries on the connection a context is bound to
#[derive(Clone)]
pub struct Executor {
    handle: Arc<ConnectionHandle>,
}

impl Executor {
    pub fn connection_name(&self) -> &str {
        self.handle.name()
    }

    pub async fn execute(&self, config: impl Into<QueryConfig>) -> Result<RecordSet> {
        let QueryConfig { query, params } = config.into();
        let sql = query.resolve().await?;

        if !self.handle.is_open() {
            return Err(DatabaseError::ConnectionTerminated(self.handle.name().to_string()));
        }

        let mut request = Request::new(self.handle.connection().as_ref());
        for (name, param) in params {
            match param {
                Param::Inferred(value) => {
                    request.input(name, value);
                }
                Param::Typed { ty, value } => {
                    request.input_typed(name, ty, value);
                }
            }
        }
        request.execute(&sql).await
    }
}

/// Builder for a multi-step request against one connection.
///
/// `query` consumes the context, so steps cannot be added once it runs.
pub struct RequestContext {
    executor: Executor,
    queue: StepQueue<StepOutput, DatabaseError>,
    error: Option<DatabaseError>,
}

impl RequestContext {
    pub fn new(handle: Arc<ConnectionHandle>) -> Self {
        Self {
            executor: Executor { handle },
            queue: StepQueue::new(),
            error: None,
        }
    }

    pub fn connection_name(&self) -> &str {
        self.executor.connection_name()
    }

    /// Append a step. A repeated alias fails the whole request when it runs.
    pub fn step(mut self, alias: impl Into<String>, action: impl Into<StepAction>) -> Self {
        let executor = self.executor.clone();
        let action = action.into();

        let enqueued = self.queue.enqueue(alias, move |results| async move {
            match action {
                StepAction::Literal(config) => executor.execute(config).await.map(StepOutput::from),
                StepAction::Computed(action) => action(executor, results).await,
            }
        });
        if let Err(duplicate) = enqueued {
            self.error.get_or_insert(duplicate.into());
        }
        self
    }

    /// Append a computed step
    pub fn step_fn<F, Fut, O>(self, alias: impl Into<String>, action: F) -> Self
    where
        F: FnOnce(Executor, Results) -> Fut + Send + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
        O: Into<StepOutput>,
    {
        self.step(alias, StepAction::computed(action))
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Run every step in order. Settles with all results or the first error.
    pub fn query(self) -> PendingResults<StepOutput, DatabaseError> {
        if let Some(error) = self.error {
            return PendingResults::failed(error);
        }
        debug!(
            connection = %self.executor.connection_name(),
            steps = self.queue.len(),
            "Starting request"
        );
        self.queue.start()
    }
}
