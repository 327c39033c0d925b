// In-Memory Driver
// Scripted driver for tests: canned responses, injected failures, and a log
// of every request it served

use crate::db::config::ConnectionConfig;
use crate::db::registry::TerminationNotifier;
use crate::db::traits::{Connection, DatabaseError, Driver, Input, Result};
use crate::db::types::RecordSet;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// A request the driver executed
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedRequest {
    pub connection: String,
    pub sql: String,
    pub inputs: Vec<Input>,
}

#[derive(Default)]
struct MemoryState {
    responses: HashMap<String, RecordSet>,
    failures: HashMap<String, String>,
    delays: HashMap<String, Duration>,
    refuse_open: Option<String>,
    open_delay: Option<Duration>,
    opened: Vec<ConnectionConfig>,
    closed: Vec<String>,
    executed: Vec<ExecutedRequest>,
    notifiers: HashMap<String, TerminationNotifier>,
}

/// Driver that never leaves the process.
///
/// Clones share state, so a test can keep one clone for scripting and hand
/// another to the registry.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return `rows` whenever `sql` is executed
    pub fn respond(&self, sql: impl Into<String>, rows: RecordSet) -> &Self {
        self.state.lock().responses.insert(sql.into(), rows);
        self
    }

    /// Fail with a query error whenever `sql` is executed
    pub fn fail_query(&self, sql: impl Into<String>, message: impl Into<String>) -> &Self {
        self.state.lock().failures.insert(sql.into(), message.into());
        self
    }

    /// Sleep before answering `sql`
    pub fn delay(&self, sql: impl Into<String>, delay: Duration) -> &Self {
        self.state.lock().delays.insert(sql.into(), delay);
        self
    }

    /// Make every following open fail
    pub fn refuse_open(&self, message: impl Into<String>) -> &Self {
        self.state.lock().refuse_open = Some(message.into());
        self
    }

    /// Undo `refuse_open`
    pub fn allow_open(&self) -> &Self {
        self.state.lock().refuse_open = None;
        self
    }

    /// Sleep inside every following open
    pub fn delay_open(&self, delay: Duration) -> &Self {
        self.state.lock().open_delay = Some(delay);
        self
    }

    /// Names of connections closed through `Connection::close`, in order
    pub fn closed(&self) -> Vec<String> {
        self.state.lock().closed.clone()
    }

    /// Configurations passed to `open`, in order
    pub fn opened(&self) -> Vec<ConnectionConfig> {
        self.state.lock().opened.clone()
    }

    /// Requests executed so far, in order
    pub fn executed(&self) -> Vec<ExecutedRequest> {
        self.state.lock().executed.clone()
    }

    /// Notifier of the most recent open under `name`
    pub fn notifier(&self, name: &str) -> Option<TerminationNotifier> {
        self.state.lock().notifiers.get(name).cloned()
    }

    /// Simulate the server closing the connection
    pub fn close_connection(&self, name: &str) {
        if let Some(notifier) = self.notifier(name) {
            notifier.closed();
        }
    }

    /// Simulate a connection-level error
    pub fn fail_connection(&self, name: &str, message: impl Into<String>) {
        if let Some(notifier) = self.notifier(name) {
            notifier.errored(&DatabaseError::QueryError(message.into()));
        }
    }
}

#[async_trait::async_trait]
impl Driver for MemoryDriver {
    fn driver_name(&self) -> &'static str {
        "memory"
    }

    async fn open(
        &self,
        config: &ConnectionConfig,
        notifier: TerminationNotifier,
    ) -> Result<Arc<dyn Connection>> {
        let delay = self.state.lock().open_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.opened.push(config.clone());
        if let Some(message) = &state.refuse_open {
            return Err(DatabaseError::ConnectionFailed(message.clone()));
        }

        let name = notifier.name().to_string();
        state.notifiers.insert(name.clone(), notifier.clone());
        trace!("Opened in-memory connection {}", name);

        Ok(Arc::new(MemoryConnection {
            name,
            driver: self.clone(),
            notifier,
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryConnection {
    name: String,
    driver: MemoryDriver,
    notifier: TerminationNotifier,
    closed: AtomicBool,
}

#[async_trait::async_trait]
impl Connection for MemoryConnection {
    fn connection_id(&self) -> &str {
        &self.name
    }

    async fn execute(&self, sql: &str, inputs: &[Input]) -> Result<RecordSet> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DatabaseError::QueryError("Connection is closed".to_string()));
        }

        let delay = {
            let mut state = self.driver.state.lock();
            state.executed.push(ExecutedRequest {
                connection: self.name.clone(),
                sql: sql.to_string(),
                inputs: inputs.to_vec(),
            });
            state.delays.get(sql).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.driver.state.lock();
        if let Some(message) = state.failures.get(sql) {
            return Err(DatabaseError::QueryError(message.clone()));
        }
        Ok(state.responses.get(sql).cloned().unwrap_or_default())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.driver.state.lock().closed.push(self.name.clone());
        self.notifier.closed();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::types::Value;

    #[tokio::test]
    async fn test_scripted_responses_and_log() {
        let driver = MemoryDriver::new();
        driver
            .respond("SELECT 1 AS n", RecordSet::from_values(&["n"], vec![vec![Value::Int(1)]]))
            .fail_query("SELECT boom", "boom");

        let conn = driver
            .open(&ConnectionConfig::new(), TerminationNotifier::detached("t"))
            .await
            .unwrap();

        let rows = conn.execute("SELECT 1 AS n", &[]).await.unwrap();
        assert_eq!(rows.first().and_then(|r| r.get("n")), Some(&Value::Int(1)));
        assert!(conn.execute("SELECT boom", &[]).await.is_err());
        assert!(conn.execute("SELECT 2", &[]).await.unwrap().is_empty());
        assert_eq!(driver.executed().len(), 3);
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_requests() {
        let driver = MemoryDriver::new();
        let notifier = TerminationNotifier::detached("t");
        let conn = driver.open(&ConnectionConfig::new(), notifier.clone()).await.unwrap();

        conn.close().await.unwrap();
        assert!(notifier.has_fired());
        assert!(conn.execute("SELECT 1", &[]).await.is_err());
    }
}
