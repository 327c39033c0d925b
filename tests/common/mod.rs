#![allow(dead_code)]

use mssql_steps::db::MemoryDriver;
use mssql_steps::{ConnectionConfig, MssqlUtil, RecordSet, Value};
use std::sync::{Arc, Once};
use tracing_subscriber::EnvFilter;

pub fn init_for_tests() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let filter = EnvFilter::from_default_env().add_directive("mssql_steps=debug".parse().unwrap());

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .init();
    });
}

/// Facade over a scripted in-memory driver
pub fn memory_util() -> (MemoryDriver, MssqlUtil) {
    init_for_tests();
    let driver = MemoryDriver::new();
    let util = MssqlUtil::new(Arc::new(driver.clone()));
    (driver, util)
}

pub fn physical_config() -> ConnectionConfig {
    ConnectionConfig::new()
        .with_server("db1")
        .with_user("u")
        .with_database("d")
}

pub fn single(column: &str, value: impl Into<Value>) -> RecordSet {
    RecordSet::from_values(&[column], vec![vec![value.into()]])
}
