// Database Module
// Connection registry, ordered step requests and the driver seam they run over

pub mod config;
pub mod context;
pub mod drivers;
pub mod queue;
pub mod registry;
pub mod settings;
pub mod traits;
pub mod types;

pub use config::{ConnectionConfig, ConnectionRef, DEFAULT_CONNECTION};
pub use context::{Executor, QueryConfig, QueryText, RequestContext, StepAction};
pub use drivers::{MemoryDriver, MssqlDriver};
pub use queue::{Aborted, DuplicateAlias, PendingResults, StepQueue};
pub use registry::{ConnectionHandle, ConnectionRegistry, HandleState, Termination, TerminationNotifier};
pub use settings::Settings;
pub use traits::{Connection, DatabaseError, Driver, Input, Request, Result};
pub use types::{ColumnInfo, Param, RecordSet, Results, Row, SqlType, StepOutput, Value};
