// Connection Registry
// Owns every open connection by canonical name, resolves aliases to names,
// and evicts connections when their driver reports close or error.

use crate::db::config::{canonical_name, config_name, ConnectionConfig, ConnectionRef, DEFAULT_CONNECTION};
use crate::db::traits::{Connection, DatabaseError, Driver, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle of a registered connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Open,
    Closing,
    Erroring,
    Removed,
}

/// Why a connection left the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Closed,
    Errored(String),
}

/// A registered connection shared by every request context built on it
pub struct ConnectionHandle {
    name: String,
    id: Uuid,
    connection: Arc<dyn Connection>,
    notifier: TerminationNotifier,
    state: Mutex<HandleState>,
}

impl ConnectionHandle {
    /// Canonical name this handle is stored under
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unique per open; a re-registered name gets a new id
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn state(&self) -> HandleState {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == HandleState::Open
    }

    fn set_state(&self, state: HandleState) {
        *self.state.lock() = state;
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Physical pool registered while opening; lives until close/error
#[derive(Debug, Clone)]
struct PoolEntry {
    id: Uuid,
    server: Option<String>,
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<String, Arc<ConnectionHandle>>,
    pools: HashMap<String, PoolEntry>,
    aliases: HashMap<String, String>,
}

impl RegistryState {
    fn default_registered(&self) -> bool {
        self.connections.contains_key(DEFAULT_CONNECTION)
    }

    /// Drop an alias this registration added, unless `name` is in use again
    fn release_alias(&mut self, alias: &str, name: &str) {
        let in_use = self.connections.contains_key(name) || self.pools.contains_key(name);
        if !in_use && self.aliases.get(alias).is_some_and(|target| target == name) {
            self.aliases.remove(alias);
        }
    }

    /// Remove `name` from every map if it still belongs to open `id`
    fn purge(&mut self, name: &str, id: Uuid, termination: &Termination) -> bool {
        debug!("Purging connection \"{}\" ({:?})", name, termination);
        let mut purged = false;
        if self.pools.get(name).is_some_and(|p| p.id == id) {
            self.pools.remove(name);
            purged = true;
        }
        if self.connections.get(name).is_some_and(|h| h.id == id) {
            if let Some(handle) = self.connections.remove(name) {
                handle.set_state(HandleState::Removed);
            }
            purged = true;
        }
        purged
    }
}

/// Handed to the driver at open time. The driver fires it when the
/// connection closes or fails; the first call wins and later calls are no-ops.
#[derive(Clone)]
pub struct TerminationNotifier {
    name: String,
    id: Uuid,
    state: Weak<RwLock<RegistryState>>,
    fired: Arc<AtomicBool>,
}

impl TerminationNotifier {
    /// Canonical name of the connection being watched
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A notifier not attached to any registry
    pub fn detached(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: Uuid::new_v4(),
            state: Weak::new(),
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    pub fn closed(&self) {
        debug!("Connection \"{}\" closed.", self.name);
        self.terminate(Termination::Closed);
    }

    pub fn errored(&self, error: &DatabaseError) {
        warn!("Error on connection: \"{}\": {}", self.name, error);
        self.terminate(Termination::Errored(error.to_string()));
    }

    fn terminate(&self, termination: Termination) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut state = state.write();
        if let Some(handle) = state.connections.get(&self.name).filter(|h| h.id == self.id) {
            handle.set_state(match termination {
                Termination::Closed => HandleState::Closing,
                Termination::Errored(_) => HandleState::Erroring,
            });
        }
        if state.purge(&self.name, self.id, &termination) {
            debug!("Removed connection \"{}\" from the registry", self.name);
        }
    }
}

/// Registry of named connections.
///
/// Cloning is cheap and every clone shares the same maps.
#[derive(Clone)]
pub struct ConnectionRegistry {
    driver: Arc<dyn Driver>,
    state: Arc<RwLock<RegistryState>>,
}

impl ConnectionRegistry {
    /// Create an empty registry opening connections through `driver`
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            state: Arc::new(RwLock::new(RegistryState::default())),
        }
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver.driver_name()
    }

    /// Open a connection and store it under its canonical name
    pub async fn register(&self, mut config: ConnectionConfig) -> Result<Arc<ConnectionHandle>> {
        let id = Uuid::new_v4();
        let (name, inserted_alias) = {
            let mut state = self.state.write();
            let name = config_name(&config, state.default_registered());
            let alias = config.alias_key();

            debug!("Creating connection: {}", name);

            let inserted_alias = if name != alias && !state.aliases.contains_key(&alias) {
                state.aliases.insert(alias.clone(), name.clone());
                Some(alias)
            } else {
                None
            };
            config.normalize_host();

            let entry = PoolEntry {
                id,
                server: config.server.clone(),
            };
            if state.pools.insert(name.clone(), entry).is_some() {
                debug!("Replacing pool registered as \"{}\"", name);
            }
            (name, inserted_alias)
        };

        let notifier = TerminationNotifier {
            name: name.clone(),
            id,
            state: Arc::downgrade(&self.state),
            fired: Arc::new(AtomicBool::new(false)),
        };

        let server = config.server.clone().unwrap_or_default();
        debug!("Connecting to {}", server);

        let connection = match self.driver.open(&config, notifier.clone()).await {
            Ok(connection) => connection,
            Err(error) => {
                debug!("Error creating connection to server {}: {}", server, error);
                let mut state = self.state.write();
                state.purge(&name, id, &Termination::Errored(error.to_string()));
                if let Some(alias) = inserted_alias {
                    state.release_alias(&alias, &name);
                }
                return Err(DatabaseError::ConnectionOpenFailed {
                    name,
                    source: Box::new(error),
                });
            }
        };

        let stored = {
            let mut state = self.state.write();
            match state.pools.get(&name).map(|entry| entry.id) {
                Some(current) if current == id => {
                    let handle = Arc::new(ConnectionHandle {
                        name: name.clone(),
                        id,
                        connection: Arc::clone(&connection),
                        notifier,
                        state: Mutex::new(HandleState::Open),
                    });
                    let previous = state.connections.insert(name.clone(), Arc::clone(&handle));
                    Ok((handle, previous))
                }
                Some(_) => Err(DatabaseError::RegistrationSuperseded(name.clone())),
                None => Err(DatabaseError::ConnectionTerminated(name.clone())),
            }
        };

        match stored {
            Ok((handle, previous)) => {
                info!("Connection ({}) made to \"{}\"", name, server);
                if let Some(previous) = previous {
                    previous.set_state(HandleState::Removed);
                    warn!("Connection \"{}\" replaced by a new registration", name);
                    if let Err(e) = previous.connection.close().await {
                        warn!("Failed to close replaced connection \"{}\": {}", name, e);
                    }
                }
                Ok(handle)
            }
            Err(error) => {
                // The open lost its slot; nothing else will ever close it
                warn!("Discarding connection \"{}\" opened to \"{}\": {}", name, server, error);
                if let Err(e) = connection.close().await {
                    warn!("Failed to close discarded connection \"{}\": {}", name, e);
                }
                Err(error)
            }
        }
    }

    /// Find the open connection a reference points at.
    ///
    /// Fails immediately with `ConnectionNotFound` when nothing is stored under
    /// the resolved name.
    pub fn resolve(&self, reference: impl Into<ConnectionRef>) -> Result<Arc<ConnectionHandle>> {
        let reference = reference.into();
        let state = self.state.read();
        let name = canonical_name(&reference, state.default_registered());
        let name = state.aliases.get(&name).cloned().unwrap_or(name);

        state
            .connections
            .get(&name)
            .cloned()
            .ok_or(DatabaseError::ConnectionNotFound(name))
    }

    /// Evict `name` if it still belongs to the open identified by `id`.
    /// Calling it again for the same open is a no-op.
    pub fn on_terminated(&self, name: &str, id: Uuid, termination: Termination) -> bool {
        self.state.write().purge(name, id, &termination)
    }

    /// Close a connection through its driver. It leaves the registry once the
    /// close is reported.
    pub async fn close(&self, reference: impl Into<ConnectionRef>) -> Result<()> {
        let handle = self.resolve(reference)?;
        handle.set_state(HandleState::Closing);
        let closed = handle.connection.close().await;
        // Drivers report the close themselves; this covers ones that do not.
        handle.notifier.closed();
        closed
    }

    /// Close every registered connection, returning the first failure
    pub async fn close_all(&self) -> Result<()> {
        let handles: Vec<Arc<ConnectionHandle>> = self.state.read().connections.values().cloned().collect();

        let mut first_error = None;
        for handle in handles {
            handle.set_state(HandleState::Closing);
            if let Err(e) = handle.connection.close().await {
                warn!("Failed to close connection \"{}\": {}", handle.name, e);
                first_error.get_or_insert(e);
            }
            handle.notifier.closed();
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.read().connections.contains_key(name)
    }

    /// Canonical names of every open connection, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().connections.keys().cloned().collect();
        names.sort();
        names
    }

    /// Canonical name an alias key points at
    pub fn alias_target(&self, alias: &str) -> Option<String> {
        self.state.read().aliases.get(alias).cloned()
    }

    /// Server address of a registered pool
    pub fn pool_server(&self, name: &str) -> Option<String> {
        self.state.read().pools.get(name).and_then(|p| p.server.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::drivers::MemoryDriver;

    fn registry() -> (MemoryDriver, ConnectionRegistry) {
        let driver = MemoryDriver::new();
        let registry = ConnectionRegistry::new(Arc::new(driver.clone()));
        (driver, registry)
    }

    fn physical() -> ConnectionConfig {
        ConnectionConfig::new()
            .with_server("db1")
            .with_user("u")
            .with_database("d")
    }

    #[tokio::test]
    async fn test_unnamed_register_then_resolve_same_handle() {
        let (_driver, registry) = registry();

        let first = registry.register(physical()).await.unwrap();
        assert_eq!(first.name(), "default");
        assert!(Arc::ptr_eq(&first, &registry.resolve(physical()).unwrap()));

        // With a default present, the next unnamed config is keyed by its alias
        let other = ConnectionConfig::new().with_server("db2").with_user("u");
        let second = registry.register(other.clone()).await.unwrap();
        assert_eq!(second.name(), "db2-u---");
        assert!(Arc::ptr_eq(&second, &registry.resolve(other).unwrap()));
    }

    #[tokio::test]
    async fn test_alias_resolves_to_named_connection() {
        let (_driver, registry) = registry();
        registry
            .register(ConnectionConfig::new().with_name("default").with_server("main"))
            .await
            .unwrap();
        let named = registry
            .register(physical().with_name("n1").with_password("one"))
            .await
            .unwrap();

        let lookalike = physical().with_password("two").with_option("encrypt", true);
        let resolved = registry.resolve(lookalike).unwrap();
        assert!(Arc::ptr_eq(&named, &resolved));
        assert_eq!(registry.alias_target("db1-u-d--").as_deref(), Some("n1"));
    }

    #[tokio::test]
    async fn test_first_alias_registration_wins() {
        let (_driver, registry) = registry();
        registry.register(physical().with_name("first")).await.unwrap();
        registry.register(physical().with_name("second")).await.unwrap();

        assert_eq!(registry.alias_target("db1-u-d--").as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_resolve_missing_fails_for_every_shape() {
        let (_driver, registry) = registry();

        for reference in [
            ConnectionRef::Default,
            ConnectionRef::from("nope"),
            ConnectionRef::from(physical()),
        ] {
            match registry.resolve(reference) {
                Err(DatabaseError::ConnectionNotFound(name)) => assert!(!name.is_empty()),
                other => panic!("expected ConnectionNotFound, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_host_is_normalized_into_server() {
        let (driver, registry) = registry();
        registry
            .register(ConnectionConfig::new().with_name("h").with_host("db7"))
            .await
            .unwrap();

        let opened = driver.opened();
        assert_eq!(opened[0].server.as_deref(), Some("db7"));
        assert_eq!(registry.pool_server("h").as_deref(), Some("db7"));
    }

    #[tokio::test]
    async fn test_open_failure_leaves_no_state() {
        let (driver, registry) = registry();
        driver.refuse_open("login failed");

        let err = registry.register(physical().with_name("broken")).await.unwrap_err();
        match err {
            DatabaseError::ConnectionOpenFailed { name, source } => {
                assert_eq!(name, "broken");
                assert!(source.to_string().contains("login failed"));
            }
            other => panic!("expected ConnectionOpenFailed, got {:?}", other),
        }
        assert!(!registry.contains("broken"));
        assert!(registry.pool_server("broken").is_none());
        assert_eq!(registry.alias_target("db1-u-d--"), None);
    }

    #[tokio::test]
    async fn test_failed_open_frees_alias_for_next_registration() {
        let (driver, registry) = registry();
        registry.register(physical().with_name("default").with_server("db0")).await.unwrap();

        driver.refuse_open("login failed");
        assert!(registry.register(physical().with_name("n1")).await.is_err());
        assert_eq!(registry.alias_target("db1-u-d--"), None);

        driver.allow_open();
        let n2 = registry.register(physical().with_name("n2")).await.unwrap();
        assert_eq!(registry.alias_target("db1-u-d--").as_deref(), Some("n2"));
        assert!(Arc::ptr_eq(&n2, &registry.resolve(physical()).unwrap()));
    }

    #[tokio::test]
    async fn test_replacing_live_connection_closes_the_old_one() {
        let (driver, registry) = registry();
        let old = registry.register(physical().with_name("n")).await.unwrap();
        let new = registry.register(physical().with_name("n")).await.unwrap();

        assert_eq!(driver.closed(), vec!["n".to_string()]);
        assert_eq!(old.state(), HandleState::Removed);
        assert_eq!(new.state(), HandleState::Open);
        assert!(Arc::ptr_eq(&new, &registry.resolve("n").unwrap()));
    }

    #[tokio::test]
    async fn test_overlapping_registrations_keep_the_latest() {
        let (driver, registry) = registry();
        driver.delay_open(std::time::Duration::from_millis(20));

        let (first, second) = tokio::join!(
            registry.register(physical().with_name("n")),
            registry.register(physical().with_name("n")),
        );

        assert!(matches!(first, Err(DatabaseError::RegistrationSuperseded(ref n)) if n == "n"));
        let second = second.unwrap();
        assert!(second.is_open());
        assert!(Arc::ptr_eq(&second, &registry.resolve("n").unwrap()));
        // The losing open is closed rather than leaked
        assert_eq!(driver.closed(), vec!["n".to_string()]);
        assert_eq!(registry.names(), vec!["n".to_string()]);
    }

    #[tokio::test]
    async fn test_unnamed_lookalike_of_named_connection_resolves_through_alias() {
        let (_driver, registry) = registry();
        registry.register(physical().with_server("db0")).await.unwrap();
        let named = registry.register(physical().with_name("reports")).await.unwrap();

        // Stored under its alias key, but lookups follow the alias to "reports"
        let unnamed = registry.register(physical()).await.unwrap();
        assert_eq!(unnamed.name(), "db1-u-d--");
        assert!(registry.contains("db1-u-d--"));
        assert!(Arc::ptr_eq(&named, &registry.resolve(physical()).unwrap()));
        assert!(Arc::ptr_eq(&named, &registry.resolve("db1-u-d--").unwrap()));
    }

    #[tokio::test]
    async fn test_close_event_purges_and_is_idempotent() {
        let (driver, registry) = registry();
        let handle = registry.register(physical().with_name("n")).await.unwrap();

        driver.close_connection("n");
        assert!(!registry.contains("n"));
        assert!(registry.pool_server("n").is_none());
        assert_eq!(handle.state(), HandleState::Removed);

        driver.close_connection("n");
        assert!(!registry.on_terminated("n", handle.id(), Termination::Closed));
        assert!(matches!(
            registry.resolve("n"),
            Err(DatabaseError::ConnectionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_error_event_purges() {
        let (driver, registry) = registry();
        registry.register(physical().with_name("n")).await.unwrap();

        driver.fail_connection("n", "socket reset");
        assert!(!registry.contains("n"));
    }

    #[tokio::test]
    async fn test_stale_notifier_does_not_evict_new_connection() {
        let (driver, registry) = registry();
        let old = registry.register(physical().with_name("n")).await.unwrap();
        let old_notifier = driver.notifier("n").unwrap();
        let new = registry.register(physical().with_name("n")).await.unwrap();

        assert_eq!(old.state(), HandleState::Removed);
        old_notifier.closed();
        assert!(registry.contains("n"));
        assert!(Arc::ptr_eq(&new, &registry.resolve("n").unwrap()));
    }

    #[tokio::test]
    async fn test_alias_survives_termination() {
        let (driver, registry) = registry();
        registry.register(physical().with_name("n")).await.unwrap();
        driver.close_connection("n");

        assert_eq!(registry.alias_target("db1-u-d--").as_deref(), Some("n"));
    }

    #[tokio::test]
    async fn test_close_and_close_all() {
        let (_driver, registry) = registry();
        registry.register(physical().with_name("a")).await.unwrap();
        registry.register(physical().with_name("b")).await.unwrap();
        registry.register(physical().with_name("c")).await.unwrap();
        assert_eq!(registry.names(), vec!["a", "b", "c"]);

        registry.close("a").await.unwrap();
        assert_eq!(registry.names(), vec!["b", "c"]);

        registry.close_all().await.unwrap();
        assert!(registry.names().is_empty());
    }

    #[test]
    fn test_detached_notifier_fires_once() {
        let notifier = TerminationNotifier::detached("x");
        assert!(!notifier.has_fired());
        notifier.closed();
        notifier.errored(&DatabaseError::QueryError("late".to_string()));
        assert!(notifier.has_fired());
    }
}
