use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_workspace(prefix: &str) -> PathBuf {
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

fn spawn_daemon() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_escolard");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn escolard");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
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
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn reassignment_replaces_rather_than_merges() {
    let workspace = temp_workspace("escolar-coordinator-assign");
    let (_child, mut stdin, mut reader) = spawn_daemon();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let level = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "levels.create",
        json!({ "name": "Primaria" }),
    );
    let grade = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grades.create",
        json!({ "levelId": level["id"], "name": "3°" }),
    );

    let mut group_ids = Vec::new();
    for (i, name) in ["A", "B", "C", "D"].iter().enumerate() {
        let group = request_ok(
            &mut stdin,
            &mut reader,
            &format!("g{}", i),
            "groups.create",
            json!({ "gradeId": grade["id"], "name": name }),
        );
        group_ids.push(group["id"].as_str().expect("group id").to_string());
    }

    let coordinator = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "coordinators.create",
        json!({ "fullName": "Lucía Prado", "email": "lucia@edu.com" }),
    );
    let coordinator_id = coordinator["id"].as_str().expect("coordinator id").to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "coordinators.assignGroups",
        json!({
            "id": coordinator_id,
            "groupIds": [group_ids[0], group_ids[1], group_ids[2]]
        }),
    );
    let first = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "coordinators.get",
        json!({ "id": coordinator_id }),
    );
    assert_eq!(
        first["assignments"].as_array().map(|a| a.len()),
        Some(3),
        "first assignment round should hold three groups"
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "coordinators.assignGroups",
        json!({
            "id": coordinator_id,
            "groupIds": [group_ids[1], group_ids[3]]
        }),
    );
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "coordinators.get",
        json!({ "id": coordinator_id }),
    );
    let mut assigned: Vec<String> = second["assignments"]
        .as_array()
        .expect("assignments array")
        .iter()
        .map(|a| {
            a.get("groupId")
                .and_then(|v| v.as_str())
                .expect("groupId")
                .to_string()
        })
        .collect();
    assigned.sort();
    let mut expected = vec![group_ids[1].clone(), group_ids[3].clone()];
    expected.sort();
    assert_eq!(assigned, expected, "reassignment must be a full replace");
}
