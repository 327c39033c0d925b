mod common;

use common::{memory_util, physical_config, single};
use mssql_steps::{Error, QueryConfig, StepOutput, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[tokio::test]
async fn steps_run_in_declared_order_regardless_of_latency() {
    let (driver, util) = memory_util();
    util.add_connection(physical_config()).await.unwrap();
    driver
        .delay("SELECT 'x'", Duration::from_millis(40))
        .delay("SELECT 'z'", Duration::from_millis(10));

    let started: Arc<Mutex<Vec<(&'static str, Instant)>>> = Arc::default();
    let mut context = util.get_query_context(None::<&str>).unwrap();
    for (alias, sql) in [("x", "SELECT 'x'"), ("y", "SELECT 'y'"), ("z", "SELECT 'z'")] {
        let started = Arc::clone(&started);
        context = context.step_fn(alias, move |execute, _| async move {
            started.lock().unwrap().push((alias, Instant::now()));
            execute.execute(sql).await
        });
    }

    let results = context.query().await.unwrap();
    assert_eq!(results.keys().collect::<Vec<_>>(), vec!["x", "y", "z"]);

    let started = started.lock().unwrap();
    assert_eq!(started.iter().map(|(a, _)| *a).collect::<Vec<_>>(), vec!["x", "y", "z"]);
    assert!(started.windows(2).all(|w| w[0].1 <= w[1].1));

    let sql: Vec<String> = driver.executed().into_iter().map(|r| r.sql).collect();
    assert_eq!(sql, vec!["SELECT 'x'", "SELECT 'y'", "SELECT 'z'"]);
}

#[tokio::test]
async fn later_step_uses_earlier_result_as_parameter() {
    let (driver, util) = memory_util();
    util.add_connection(physical_config()).await.unwrap();
    driver
        .respond("SELECT id FROM users WHERE name = @name", single("id", 42))
        .respond("SELECT total FROM orders WHERE user_id = @id", single("total", 9.5));

    let results = util
        .get_query_context("default")
        .unwrap()
        .step("user", QueryConfig::new("SELECT id FROM users WHERE name = @name").param("name", "ann"))
        .step_fn("orders", |execute, so_far| async move {
            let id = so_far["user"]
                .as_rows()
                .and_then(|rows| rows.first())
                .and_then(|row| row.get("id"))
                .cloned()
                .ok_or_else(|| Error::step("user not found"))?;
            execute
                .execute(QueryConfig::new("SELECT total FROM orders WHERE user_id = @id").param("id", id))
                .await
        })
        .query()
        .await
        .unwrap();

    let total = results["orders"].as_rows().and_then(|r| r.first()).and_then(|r| r.get("total"));
    assert_eq!(total, Some(&Value::Float(9.5)));
    assert_eq!(driver.executed()[1].inputs[0].value, Value::Int(42));
}

#[tokio::test]
async fn first_failure_settles_request_and_skips_remaining_steps() {
    let (driver, util) = memory_util();
    util.add_connection(physical_config()).await.unwrap();
    driver.fail_query("SELECT b", "b failed");

    let ran_c = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran_c);
    let err = util
        .get_query_context(None::<&str>)
        .unwrap()
        .step("a", "SELECT a")
        .step("b", "SELECT b")
        .step_fn("c", move |execute, _| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            execute.execute("SELECT c").await
        })
        .query()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::QueryError(ref m) if m == "b failed"));
    assert_eq!(ran_c.load(Ordering::SeqCst), 0);
    assert_eq!(driver.executed().len(), 2);
}

#[tokio::test]
async fn json_step_outputs_accumulate_alongside_rows() {
    let (driver, util) = memory_util();
    util.add_connection(physical_config()).await.unwrap();
    driver.respond("SELECT 1 AS n", single("n", 1));

    let results = util
        .get_query_context(None::<&str>)
        .unwrap()
        .step("rows", "SELECT 1 AS n")
        .step_fn("summary", |_, so_far| async move {
            let count = so_far["rows"].as_rows().map(|r| r.len()).unwrap_or(0);
            Ok(serde_json::json!({ "count": count }))
        })
        .query()
        .await
        .unwrap();

    assert!(matches!(results["rows"], StepOutput::Rows(_)));
    assert_eq!(results["summary"].as_json(), Some(&serde_json::json!({ "count": 1 })));
}

#[tokio::test]
async fn contexts_on_one_connection_run_independently() {
    let (driver, util) = memory_util();
    util.add_connection(physical_config()).await.unwrap();
    driver.delay("SELECT slow", Duration::from_millis(30));

    let slow = util.get_query_context(None::<&str>).unwrap().step("s", "SELECT slow").query();
    let fast = util.get_query_context(None::<&str>).unwrap().step("f", "SELECT fast").query();

    let (slow, fast) = tokio::join!(slow, fast);
    assert!(slow.unwrap().contains_key("s"));
    assert!(fast.unwrap().contains_key("f"));
}
