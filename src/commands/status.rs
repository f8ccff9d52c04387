use anyhow::Result;
use serde_json::{Value, json};

use crate::dutycycle::config::load_config;
use crate::dutycycle::paths::resolve_paths;
use crate::dutycycle::scheduler::{self, WallClock};

fn snapshot() -> Result<Value> {
    let paths = resolve_paths()?;
    let cfg = load_config(&paths)?;
    let snapshot = scheduler::status(&paths, &cfg, WallClock::now())?;
    Ok(serde_json::to_value(&snapshot)?)
}

/// Always yields a document; failures are reported inline instead of through
/// the exit code.
pub fn run() -> Value {
    match snapshot() {
        Ok(value) => value,
        Err(err) => json!({
            "counter": Value::Null,
            "schedule": Value::Null,
            "due": [],
            "lock": Value::Null,
            "error": format!("{err:#}"),
        }),
    }
}
