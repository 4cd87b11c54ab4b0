//! End-to-end source pipeline with a copy tool that mimics `rsync -v`.

use acqsync::{Agent, AgentConfig, SourceConfig};
use acqsync_channel::SharedState;
use acqsync_context::ContextKind;
use acqsync_worker::{CopyOutput, CopyRequest, CopyTool, Result as TransferResult};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

struct CopyingTool;

impl CopyTool for CopyingTool {
    fn copy(&mut self, request: &CopyRequest<'_>) -> TransferResult<CopyOutput> {
        fs::create_dir_all(request.destination_dir)?;
        let mut stdout = String::from("sending incremental file list\n");
        let mut sent = 0;
        for source in request.sources {
            let name = source.file_name().unwrap().to_string_lossy().into_owned();
            sent += fs::copy(source, request.destination_dir.join(&name))?;
            stdout.push_str(&name);
            stdout.push('\n');
        }
        stdout.push_str(&format!(
            "\nsent {} bytes  received 35 bytes  500.00 bytes/sec\ntotal size is {}  speedup is 1.00\n",
            sent, sent
        ));
        Ok(CopyOutput {
            exit_code: Some(0),
            stdout,
            stderr: String::new(),
        })
    }
}

/// Files get strictly increasing change times so release order is fixed.
fn write_in_order(dir: &Path, names: &[&str]) {
    for name in names {
        fs::write(dir.join(name), name.as_bytes()).unwrap();
        thread::sleep(Duration::from_millis(20));
    }
}

fn source_config(src: &Path, dest: &Path) -> SourceConfig {
    let mut source = SourceConfig::new(src, dest);
    source.name = Some("krios".to_string());
    source.poll_interval_secs = 1;
    source
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn test_tilt_series_flows_through_to_shared_state() {
    let src = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    write_in_order(
        src.path(),
        &[
            "Position_1_[0.0].mrc",
            "Position_1_[10.0].mrc",
            "Position_2_[0.0].mrc",
        ],
    );

    let config = AgentConfig {
        sources: vec![source_config(src.path(), dest.path())],
        ..AgentConfig::default()
    };
    let state = SharedState::new();
    let running = Agent::new(config, state.clone())
        .start_with(|_| CopyingTool)
        .unwrap();
    assert_eq!(
        running.sources()[0].stage_names(),
        vec![
            format!("watcher:{}", src.path().display()),
            format!("transfer:{}", src.path().display()),
            format!("analyser:{}", src.path().display()),
        ]
    );

    wait_until("three transfers", || {
        running.sources()[0].ledger().transferred_count() == 3
    });
    wait_until("group snapshot", || state.contains_key("groups.krios"));

    running.cancel();
    let summaries = running.join().unwrap();
    assert_eq!(summaries.len(), 1);
    let completed: Vec<&str> = summaries[0]
        .completions
        .iter()
        .map(|c| c.group_id.as_str())
        .collect();
    assert_eq!(completed, vec!["Position_1"]);
    assert_eq!(summaries[0].transferred, 3);
    assert_eq!(summaries[0].unchanged, 0);

    assert!(dest.path().join("Position_2_[0.0].mrc").exists());

    let progress = state.get("transfer.krios").unwrap();
    assert_eq!(progress["files_transferred"], 3);
    assert_eq!(progress["last_exit_code"], 0);

    let groups = state.get("groups.krios").unwrap();
    assert_eq!(groups["context"], "tomography");
    let states: Vec<(&str, &str)> = groups["groups"]
        .as_array()
        .unwrap()
        .iter()
        .map(|g| (g["group_id"].as_str().unwrap(), g["state"].as_str().unwrap()))
        .collect();
    assert_eq!(
        states,
        vec![("Position_1", "completed"), ("Position_2", "active")]
    );

    let registered = state.get("registered.krios").unwrap();
    let expected = dest.path().join("Position_2_[0.0].mrc");
    assert_eq!(registered, Value::String(expected.display().to_string()));
    assert!(state.get("metrics").unwrap()["copy_invocations"].as_u64().unwrap() >= 1);
}

#[test]
fn test_preset_context_skips_classification() {
    let src = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    write_in_order(src.path(), &["notes.txt"]);

    let mut source = source_config(src.path(), dest.path());
    source.context = Some(ContextKind::Spa);
    let config = AgentConfig {
        sources: vec![source],
        ..AgentConfig::default()
    };
    let state = SharedState::new();
    let running = Agent::new(config, state.clone())
        .start_with(|_| CopyingTool)
        .unwrap();

    assert_eq!(running.sources()[0].snapshot().kind(), Some(ContextKind::Spa));
    wait_until("one transfer", || {
        running.sources()[0].ledger().transferred_count() == 1
    });
    running.cancel();
    let summaries = running.join().unwrap();
    assert!(summaries[0].completions.is_empty());
}

#[test]
fn test_missing_root_stops_source_with_error() {
    let dest = TempDir::new().unwrap();
    let missing = PathBuf::from("/nonexistent/acqsync/root");
    let config = AgentConfig {
        sources: vec![source_config(&missing, dest.path())],
        ..AgentConfig::default()
    };

    let running = Agent::new(config, SharedState::new())
        .start_with(|_| CopyingTool)
        .unwrap();
    wait_until("source to stop", || running.all_finished());
    assert!(running.join().is_err());
}
