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

struct Seeded {
    student_id: String,
    evaluation_id: String,
}

fn seed_grading(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> Seeded {
    let teacher = request_ok(
        stdin,
        reader,
        "s1",
        "teachers.create",
        json!({ "fullName": "Marta Salas" }),
    );
    let course = request_ok(
        stdin,
        reader,
        "s2",
        "courses.create",
        json!({ "name": "Matemáticas", "grade": "1°", "teacherId": teacher["id"] }),
    );
    let criteria = request_ok(
        stdin,
        reader,
        "s3",
        "grading.criteria.create",
        json!({
            "courseId": course["id"],
            "componentType": "EXAM",
            "weightPercentage": 60.0
        }),
    );
    let evaluation = request_ok(
        stdin,
        reader,
        "s4",
        "grading.evaluations.create",
        json!({ "criteriaId": criteria["id"], "title": "Parcial 1", "maxScore": 10.0 }),
    );
    let student = request_ok(
        stdin,
        reader,
        "s5",
        "students.create",
        json!({ "firstName": "Iker", "paternalSurname": "Vega" }),
    );
    Seeded {
        student_id: student["id"].as_str().expect("student id").to_string(),
        evaluation_id: evaluation["id"].as_str().expect("evaluation id").to_string(),
    }
}

#[test]
fn second_write_overwrites_instead_of_duplicating() {
    let workspace = temp_workspace("escolar-grades-upsert");
    let (_child, mut stdin, mut reader) = spawn_daemon();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seeded = seed_grading(&mut stdin, &mut reader);

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.upsert",
        json!({
            "studentId": seeded.student_id,
            "evaluationId": seeded.evaluation_id,
            "score": 7.5,
            "feedback": "Bien"
        }),
    );
    assert_eq!(first["created"].as_bool(), Some(true));
    let first_id = first["id"].as_str().expect("grade id").to_string();

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grades.upsert",
        json!({
            "studentId": seeded.student_id,
            "evaluationId": seeded.evaluation_id,
            "score": 9.0,
            "feedback": "Mucho mejor"
        }),
    );
    assert_eq!(second["created"].as_bool(), Some(false));
    assert_eq!(second["id"].as_str(), Some(first_id.as_str()));
    assert_eq!(second["score"].as_f64(), Some(9.0));
    assert_eq!(second["feedback"].as_str(), Some("Mucho mejor"));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "grades.listByEvaluation",
        json!({ "evaluationId": seeded.evaluation_id }),
    );
    let rows = listed["grades"].as_array().expect("grades array");
    assert_eq!(rows.len(), 1, "exactly one row per (student, evaluation)");
    assert_eq!(rows[0]["score"].as_f64(), Some(9.0));
}

#[test]
fn bulk_upsert_reports_created_and_updated_counts() {
    let workspace = temp_workspace("escolar-grades-bulk");
    let (_child, mut stdin, mut reader) = spawn_daemon();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seeded = seed_grading(&mut stdin, &mut reader);
    let other = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "firstName": "Nora", "paternalSurname": "Cid" }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grades.upsert",
        json!({
            "studentId": seeded.student_id,
            "evaluationId": seeded.evaluation_id,
            "score": 6.0
        }),
    );

    let bulk = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "grades.bulkUpsert",
        json!({
            "grades": [
                {
                    "studentId": seeded.student_id,
                    "evaluationId": seeded.evaluation_id,
                    "score": 8.0
                },
                {
                    "studentId": other["id"],
                    "evaluationId": seeded.evaluation_id,
                    "score": 10.0
                }
            ]
        }),
    );
    assert_eq!(bulk["updated"].as_i64(), Some(1));
    assert_eq!(bulk["created"].as_i64(), Some(1));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "grades.listByEvaluation",
        json!({ "evaluationId": seeded.evaluation_id }),
    );
    assert_eq!(listed["grades"].as_array().map(|a| a.len()), Some(2));
}
