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
fn answers_replace_on_the_attempt_question_key_and_score_lands_on_student() {
    let workspace = temp_workspace("escolar-iq-attempt");
    let (_child, mut stdin, mut reader) = spawn_daemon();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let test = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "iq.tests.create",
        json!({ "name": "Razonamiento básico" }),
    );
    let q1 = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "iq.questions.create",
        json!({
            "testId": test["id"],
            "text": "Serie: 2, 4, 8, ...",
            "orderIndex": 1,
            "points": 1,
            "correctOption": "B",
            "options": { "A": "12", "B": "16", "C": "18" }
        }),
    );
    let q2 = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "iq.questions.create",
        json!({
            "testId": test["id"],
            "text": "Analogía: ala es a pájaro...",
            "orderIndex": 2,
            "points": 2,
            "correctOption": "C"
        }),
    );
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.create",
        json!({ "firstName": "Teo", "paternalSurname": "Galindo" }),
    );

    let attempt = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "iq.attempts.start",
        json!({ "testId": test["id"], "studentId": student["id"] }),
    );

    // Wrong answer first, then corrected: the second write must replace
    // the row, not add another.
    let wrong = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "iq.attempts.answer",
        json!({ "attemptId": attempt["id"], "questionId": q1["id"], "selectedOption": "A" }),
    );
    assert_eq!(wrong["isCorrect"].as_bool(), Some(false));
    assert_eq!(wrong["created"].as_bool(), Some(true));

    let fixed = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "iq.attempts.answer",
        json!({ "attemptId": attempt["id"], "questionId": q1["id"], "selectedOption": "B" }),
    );
    assert_eq!(fixed["isCorrect"].as_bool(), Some(true));
    assert_eq!(fixed["created"].as_bool(), Some(false));
    assert_eq!(fixed["id"].as_str(), wrong["id"].as_str());

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "iq.attempts.answer",
        json!({ "attemptId": attempt["id"], "questionId": q2["id"], "selectedOption": "C" }),
    );

    let submitted = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "iq.attempts.submit",
        json!({ "attemptId": attempt["id"] }),
    );
    assert_eq!(submitted["score"].as_i64(), Some(3));

    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "students.get",
        json!({ "id": student["id"] }),
    );
    assert_eq!(fetched["iqScore"].as_i64(), Some(3));

    // The attempt is closed: further answers and a second submit are conflicts.
    let late = request(
        &mut stdin,
        &mut reader,
        "12",
        "iq.attempts.answer",
        json!({ "attemptId": attempt["id"], "questionId": q2["id"], "selectedOption": "A" }),
    );
    assert_eq!(late["error"]["code"].as_str(), Some("conflict"));

    let resubmit = request(
        &mut stdin,
        &mut reader,
        "13",
        "iq.attempts.submit",
        json!({ "attemptId": attempt["id"] }),
    );
    assert_eq!(resubmit["error"]["code"].as_str(), Some("conflict"));
}
