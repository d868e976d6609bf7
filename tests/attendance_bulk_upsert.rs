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

#[test]
fn bulk_record_overwrites_on_the_natural_key() {
    let workspace = temp_workspace("escolar-attendance-bulk");
    let (_child, mut stdin, mut reader) = spawn_daemon();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "teachers.create",
        json!({ "fullName": "Celia Bravo" }),
    );
    let course = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "courses.create",
        json!({ "name": "Geografía", "grade": "3°", "teacherId": teacher["id"] }),
    );
    let s1 = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "firstName": "Pedro", "paternalSurname": "Islas" }),
    );
    let s2 = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.create",
        json!({ "firstName": "Rosa", "paternalSurname": "Fuentes" }),
    );

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.bulkRecord",
        json!({
            "records": [
                { "studentId": s1["id"], "courseId": course["id"], "classDate": "2025-03-10", "status": "P" },
                { "studentId": s2["id"], "courseId": course["id"], "classDate": "2025-03-10", "status": "A" }
            ]
        }),
    );
    assert_eq!(first["created"].as_i64(), Some(2));
    assert_eq!(first["updated"].as_i64(), Some(0));

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "attendance.bulkRecord",
        json!({
            "records": [
                { "studentId": s1["id"], "courseId": course["id"], "classDate": "2025-03-10", "status": "R", "note": "llegó tarde" },
                { "studentId": s2["id"], "courseId": course["id"], "classDate": "2025-03-10", "status": "P", "emotion": "tranquilo" }
            ]
        }),
    );
    assert_eq!(second["created"].as_i64(), Some(0));
    assert_eq!(second["updated"].as_i64(), Some(2));

    let day = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "attendance.byCourseDate",
        json!({ "courseId": course["id"], "classDate": "2025-03-10" }),
    );
    let rows = day["attendances"].as_array().expect("attendance rows");
    assert_eq!(rows.len(), 2, "upsert must not duplicate the day's rows");
    let rosa = rows
        .iter()
        .find(|r| r["studentId"].as_str() == s2["id"].as_str())
        .expect("rosa row");
    assert_eq!(rosa["status"].as_str(), Some("P"));
    assert_eq!(rosa["emotion"].as_str(), Some("tranquilo"));
}

#[test]
fn single_record_rejects_duplicates_for_the_same_day() {
    let workspace = temp_workspace("escolar-attendance-single");
    let (_child, mut stdin, mut reader) = spawn_daemon();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "teachers.create",
        json!({ "fullName": "Celia Bravo" }),
    );
    let course = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "courses.create",
        json!({ "name": "Física", "grade": "3°", "teacherId": teacher["id"] }),
    );
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "firstName": "Saúl", "paternalSurname": "Cortés" }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.record",
        json!({
            "studentId": student["id"],
            "courseId": course["id"],
            "classDate": "2025-03-11",
            "status": "A"
        }),
    );
    let duplicate = request(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.record",
        json!({
            "studentId": student["id"],
            "courseId": course["id"],
            "classDate": "2025-03-11",
            "status": "P"
        }),
    );
    assert_eq!(duplicate["error"]["code"].as_str(), Some("conflict"));

    let bad_status = request(
        &mut stdin,
        &mut reader,
        "7",
        "attendance.record",
        json!({
            "studentId": student["id"],
            "courseId": course["id"],
            "classDate": "2025-03-12",
            "status": "X"
        }),
    );
    assert_eq!(bad_status["error"]["code"].as_str(), Some("bad_params"));
}
