use crate::types::{RunData, RunReport};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, RedisResult};

/// Redis queue semantics shared by producers and the worker
/// Keeps key names deterministic so both sides never drift

pub const QUEUE_PREFIX: &str = "gradekit:queue";
pub const RESULT_PREFIX: &str = "gradekit:result";

/// Queue holding pending test runs
pub fn run_queue() -> String {
    format!("{}:runs", QUEUE_PREFIX)
}

/// Key under which the report for a run label is stored
pub fn result_key(label: &str) -> String {
    format!("{}:{}", RESULT_PREFIX, label)
}

/// Blocking pop of the next run request; `Ok(None)` when the timeout elapses
pub async fn pop_run(
    conn: &mut ConnectionManager,
    timeout_secs: f64,
) -> RedisResult<Option<RunData>> {
    let popped: Option<(String, String)> = conn.blpop(run_queue(), timeout_secs).await?;
    match popped {
        Some((_, payload)) => serde_json::from_str(&payload).map(Some).map_err(json_error),
        None => Ok(None),
    }
}

/// Store the report for a finished run
pub async fn store_report(conn: &mut ConnectionManager, report: &RunReport) -> RedisResult<()> {
    let payload = serde_json::to_string(report).map_err(json_error)?;
    conn.set(result_key(&report.label), payload).await
}

fn json_error(err: serde_json::Error) -> RedisError {
    RedisError::from((
        redis::ErrorKind::TypeError,
        "invalid json payload",
        err.to_string(),
    ))
}
