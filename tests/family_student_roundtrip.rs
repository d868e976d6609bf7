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

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

#[test]
fn family_and_group_navigation_round_trips_through_student() {
    let workspace = temp_workspace("escolar-family-roundtrip");
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
        json!({ "name": "Secundaria" }),
    );
    let grade = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grades.create",
        json!({ "levelId": level["id"], "name": "1°" }),
    );
    let group = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "groups.create",
        json!({ "gradeId": grade["id"], "name": "B" }),
    );

    let family = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "families.create",
        json!({ "familyNumber": "F-041", "familyName": "Domínguez" }),
    );
    let family_id = family["id"].as_str().expect("family id").to_string();
    let group_id = group["id"].as_str().expect("group id").to_string();

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.create",
        json!({
            "firstName": "Valeria",
            "paternalSurname": "Domínguez",
            "maternalSurname": "Ruiz",
            "curp": "DORV120315MDFMZL08",
            "familyId": family_id,
            "groupId": group_id
        }),
    );
    let student_id = student["id"].as_str().expect("student id").to_string();

    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "students.get",
        json!({ "id": student_id }),
    );
    assert_eq!(
        fetched["family"]["id"].as_str(),
        Some(family_id.as_str()),
        "family navigation must round-trip"
    );
    assert_eq!(
        fetched["group"]["id"].as_str(),
        Some(group_id.as_str()),
        "group navigation must round-trip"
    );
    assert_eq!(fetched["group"]["levelName"].as_str(), Some("Secundaria"));
    assert_eq!(fetched["fullName"].as_str(), Some("Valeria Domínguez Ruiz"));

    let profile = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "studentProfile.get",
        json!({ "id": student_id }),
    );
    assert_eq!(profile["family"]["id"].as_str(), Some(family_id.as_str()));
    assert_eq!(profile["level"].as_str(), Some("Secundaria"));
    assert_eq!(profile["group"].as_str(), Some("B"));
}

#[test]
fn update_requires_matching_ids_and_delete_reports_missing() {
    let workspace = temp_workspace("escolar-student-crud");
    let (_child, mut stdin, mut reader) = spawn_daemon();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "firstName": "Hugo", "paternalSurname": "Santos" }),
    );
    let student_id = student["id"].as_str().expect("student id").to_string();

    let mismatch = request(
        &mut stdin,
        &mut reader,
        "3",
        "students.update",
        json!({
            "id": student_id,
            "student": { "id": "another-id", "firstName": "Hugo", "paternalSurname": "Santos" }
        }),
    );
    assert_eq!(error_code(&mismatch), "bad_params");

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.update",
        json!({
            "id": student_id,
            "student": {
                "id": student_id,
                "firstName": "Hugo",
                "paternalSurname": "Santos",
                "city": "Mérida",
                "status": "Activo"
            }
        }),
    );
    assert_eq!(updated["city"].as_str(), Some("Mérida"));

    let missing = request(
        &mut stdin,
        &mut reader,
        "5",
        "students.delete",
        json!({ "id": "no-such-student" }),
    );
    assert_eq!(error_code(&missing), "not_found");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.delete",
        json!({ "id": student_id }),
    );
    let gone = request(
        &mut stdin,
        &mut reader,
        "7",
        "students.get",
        json!({ "id": student_id }),
    );
    assert_eq!(error_code(&gone), "not_found");
}
