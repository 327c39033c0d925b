// Database Drivers
// SQL Server over tiberius, plus an in-process driver for tests and demos

pub mod memory;
pub mod mssql;

// Re-export drivers
pub use memory::{ExecutedRequest, MemoryDriver};
pub use mssql::MssqlDriver;
