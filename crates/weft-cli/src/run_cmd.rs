//! `weft run`: execute a workflow file to completion in-process.
//!
//! Uses the in-memory instance store, so no database is required. Prints
//! the final savepoint and exits non-zero when the instance finished with
//! errors.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use weft_core::instance::LaunchOptions;
use weft_core::runtime::{Runtime, RuntimeConfig};
use weft_core::storage::MemoryInstanceStore;
use weft_core::workflow::Workflow;
use weft_db::models::InstanceStatus;

/// Parse `key=value` parameter flags.
pub fn parse_params(raw: &[String]) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|item| {
            item.split_once('=')
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .with_context(|| format!("invalid parameter {item:?}, expected name=value"))
        })
        .collect()
}

pub async fn run_workflow(file: &str, raw_params: &[String], timeout_secs: u64) -> Result<()> {
    let xml = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read workflow file {file}"))?;

    let name = std::path::Path::new(file)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("workflow")
        .replace(|c: char| !c.is_ascii_alphanumeric() && c != '_' && c != '-', "_");

    let workflow = Workflow::from_xml(name, &xml)?;
    let parameters = parse_params(raw_params)?;

    let logs_dir = std::env::temp_dir().join(format!("weft-run-{}", std::process::id()));
    let store = Arc::new(MemoryInstanceStore::new());
    let runtime = Runtime::start(
        RuntimeConfig::ephemeral(logs_dir),
        Arc::clone(&store) as Arc<dyn weft_core::storage::InstanceStore>,
        None,
    )
    .await?;

    let instance_id = runtime
        .engine
        .launch(&workflow, &parameters, LaunchOptions::default())
        .await?;

    // Wait for the terminal savepoint.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    let record = loop {
        let record = store.get(instance_id).context("instance record vanished")?;
        if record.status != InstanceStatus::Executing {
            break record;
        }
        if tokio::time::Instant::now() >= deadline {
            runtime.engine.cancel(instance_id, true).await.ok();
            runtime.shutdown().await;
            bail!("workflow did not finish within {timeout_secs}s");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    runtime.shutdown().await;

    println!("{}", record.savepoint.as_deref().unwrap_or(""));
    eprintln!(
        "instance {} finished: {} ({} error(s))",
        instance_id,
        record.status,
        record.errors
    );

    if record.errors > 0 || record.status == InstanceStatus::Aborted {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_params_accepts_pairs() {
        let parsed = parse_params(&["a=1".to_owned(), "b=x=y".to_owned()]).unwrap();
        assert_eq!(parsed[0], ("a".to_owned(), "1".to_owned()));
        assert_eq!(parsed[1], ("b".to_owned(), "x=y".to_owned()));
    }

    #[test]
    fn parse_params_rejects_bare_names() {
        assert!(parse_params(&["oops".to_owned()]).is_err());
    }
}
