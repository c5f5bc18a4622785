use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_schedulerd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schedulerd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        !value.get("ok").and_then(|v| v.as_bool()).unwrap_or(true),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value.get("error").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn untouched_year_seeds_default_periods_exactly_once() {
    let workspace = temp_dir("schedulerd-partition-seed");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    // A year nobody ever wrote to answers with the canonical defaults.
    let first = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "periods.list",
        json!({ "semesterId": 9, "year": 2599 }),
    );
    let periods = first.get("periods").and_then(|v| v.as_array()).expect("periods");
    assert_eq!(periods.len(), 8);
    let numbers: Vec<i64> = periods
        .iter()
        .map(|p| p.get("periodNo").and_then(|v| v.as_i64()).expect("periodNo"))
        .collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(
        periods[0].get("periodName").and_then(|v| v.as_str()),
        Some("Period 1")
    );
    assert_eq!(
        periods[0].get("startTime").and_then(|v| v.as_str()),
        Some("08:00")
    );

    // Repeat call returns the same rows, not a second seeding.
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "periods.list",
        json!({ "semesterId": 9, "year": 2599 }),
    );
    let periods_again = second.get("periods").and_then(|v| v.as_array()).expect("periods");
    assert_eq!(periods_again.len(), 8);
    let ids: Vec<i64> = periods
        .iter()
        .map(|p| p.get("id").and_then(|v| v.as_i64()).expect("id"))
        .collect();
    let ids_again: Vec<i64> = periods_again
        .iter()
        .map(|p| p.get("id").and_then(|v| v.as_i64()).expect("id"))
        .collect();
    assert_eq!(ids, ids_again);
}

#[test]
fn untouched_year_entity_reads_are_empty_not_errors() {
    let workspace = temp_dir("schedulerd-partition-empty");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let cases = [
        ("teachers.list", "teachers"),
        ("classes.list", "classes"),
        ("rooms.list", "rooms"),
        ("subjects.list", "subjects"),
        ("schedules.list", "schedules"),
    ];
    for (i, (method, key)) in cases.iter().enumerate() {
        let result = request_ok(
            &mut stdin,
            &mut reader,
            &format!("e{}", i),
            method,
            json!({ "semesterId": 4, "year": 2598 }),
        );
        let rows = result.get(*key).and_then(|v| v.as_array()).expect(key);
        assert!(rows.is_empty(), "{} not empty for fresh year", method);
    }
}

#[test]
fn year_scoped_reads_require_a_year() {
    let workspace = temp_dir("schedulerd-partition-noyear");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    // No explicit year and no active year selected.
    let error = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "periods.list",
        json!({ "semesterId": 1 }),
    );
    assert_eq!(
        error.get("code").and_then(|v| v.as_str()),
        Some("no_active_year")
    );
}

#[test]
fn out_of_range_year_is_rejected_before_touching_storage() {
    let workspace = temp_dir("schedulerd-partition-badyear");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let error = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "teachers.list",
        json!({ "semesterId": 1, "year": 99999 }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("bad_params"));
}

#[test]
fn stats_for_unprovisioned_ledger_are_empty() {
    let workspace = temp_dir("schedulerd-partition-stats");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    // The ledger table for this year was never created; stats still answer.
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "substitutions.stats",
        json!({ "semesterId": 3, "year": 2602 }),
    );
    let stats = result.get("stats").and_then(|v| v.as_object()).expect("stats");
    assert!(stats.is_empty());
}
