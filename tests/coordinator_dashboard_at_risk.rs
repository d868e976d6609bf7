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

const TODAY: &str = "2025-03-15";

struct Seeded {
    coordinator_id: String,
    course_id: String,
    ana: String,
    beto: String,
    caro: String,
}

fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> Seeded {
    let level = request_ok(stdin, reader, "s1", "levels.create", json!({ "name": "Secundaria" }));
    let grade = request_ok(
        stdin,
        reader,
        "s2",
        "grades.create",
        json!({ "levelId": level["id"], "name": "2°" }),
    );
    let group = request_ok(
        stdin,
        reader,
        "s3",
        "groups.create",
        json!({ "gradeId": grade["id"], "name": "A" }),
    );
    let teacher = request_ok(
        stdin,
        reader,
        "s4",
        "teachers.create",
        json!({ "fullName": "Jorge Lira" }),
    );
    let course = request_ok(
        stdin,
        reader,
        "s5",
        "courses.create",
        json!({ "name": "Ciencias", "grade": "2°", "teacherId": teacher["id"] }),
    );

    let mut ids = Vec::new();
    for (i, first) in ["Ana", "Beto", "Caro"].iter().enumerate() {
        let student = request_ok(
            stdin,
            reader,
            &format!("st{}", i),
            "students.create",
            json!({
                "firstName": first,
                "paternalSurname": "Montes",
                "groupId": group["id"]
            }),
        );
        ids.push(student["id"].as_str().expect("student id").to_string());
    }

    let coordinator = request_ok(
        stdin,
        reader,
        "s6",
        "coordinators.create",
        json!({ "fullName": "Irma Vidal" }),
    );
    let coordinator_id = coordinator["id"].as_str().expect("coordinator id").to_string();
    let _ = request_ok(
        stdin,
        reader,
        "s7",
        "coordinators.assignGroups",
        json!({ "id": coordinator_id, "groupIds": [group["id"]] }),
    );

    Seeded {
        coordinator_id,
        course_id: course["id"].as_str().expect("course id").to_string(),
        ana: ids[0].clone(),
        beto: ids[1].clone(),
        caro: ids[2].clone(),
    }
}

fn record_absence(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    seeded: &Seeded,
    student_id: &str,
    date: &str,
    emotion: Option<&str>,
) {
    let mut params = json!({
        "studentId": student_id,
        "courseId": seeded.course_id,
        "classDate": date,
        "status": "A"
    });
    if let Some(e) = emotion {
        params["emotion"] = json!(e);
    }
    let _ = request_ok(stdin, reader, id, "attendance.record", params);
}

#[test]
fn union_of_absence_and_incident_risk_with_today_counts() {
    let workspace = temp_workspace("escolar-coordinator-dash");
    let (_child, mut stdin, mut reader) = spawn_daemon();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seeded = seed(&mut stdin, &mut reader);

    // Ana: two absences earlier in the window plus one today -> three.
    record_absence(&mut stdin, &mut reader, "a1", &seeded, &seeded.ana, "2025-03-01", None);
    record_absence(&mut stdin, &mut reader, "a2", &seeded, &seeded.ana, "2025-03-05", None);
    record_absence(&mut stdin, &mut reader, "a3", &seeded, &seeded.ana, TODAY, Some("triste"));

    // Beto: clean attendance but one incident today.
    let incident_type = request_ok(
        &mut stdin,
        &mut reader,
        "b1",
        "incidentTypes.create",
        json!({ "name": "Disrupción", "severity": "Leve" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "b2",
        "incidents.create",
        json!({
            "studentId": seeded.beto,
            "typeId": incident_type["id"],
            "title": "Interrupción en clase",
            "date": TODAY
        }),
    );

    // Caro: two absences only, stays off the risk list; present today
    // with a recorded emotion.
    record_absence(&mut stdin, &mut reader, "c1", &seeded, &seeded.caro, "2025-03-02", None);
    record_absence(&mut stdin, &mut reader, "c2", &seeded, &seeded.caro, "2025-03-06", None);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "c3",
        "attendance.record",
        json!({
            "studentId": seeded.caro,
            "courseId": seeded.course_id,
            "classDate": TODAY,
            "status": "P",
            "emotion": "contento"
        }),
    );

    let dash = request_ok(
        &mut stdin,
        &mut reader,
        "d1",
        "coordinators.dashboard",
        json!({ "id": seeded.coordinator_id, "today": TODAY }),
    );

    assert_eq!(dash["totalStudents"].as_i64(), Some(3));
    assert_eq!(dash["assignedGroupsCount"].as_i64(), Some(1));
    assert_eq!(dash["absencesToday"].as_i64(), Some(1));
    assert_eq!(dash["incidentsToday"].as_i64(), Some(1));
    assert_eq!(
        dash["emotionSummary"]["triste"].as_i64(),
        Some(1),
        "free-text emotions are grouped by value"
    );
    assert_eq!(dash["emotionSummary"]["contento"].as_i64(), Some(1));

    let at_risk: Vec<&str> = dash["atRiskStudents"]
        .as_array()
        .expect("at risk array")
        .iter()
        .map(|s| s["id"].as_str().expect("risk id"))
        .collect();
    assert_eq!(at_risk.len(), 2, "absence and incident criteria union by id");
    assert!(at_risk.contains(&seeded.ana.as_str()));
    assert!(at_risk.contains(&seeded.beto.as_str()));
    assert!(!at_risk.contains(&seeded.caro.as_str()));
    for entry in dash["atRiskStudents"].as_array().expect("at risk array") {
        assert_eq!(entry["group"].as_str(), Some("A"));
    }
}

#[test]
fn coordinator_without_groups_gets_all_zero_snapshot() {
    let workspace = temp_workspace("escolar-coordinator-empty");
    let (_child, mut stdin, mut reader) = spawn_daemon();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let coordinator = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "coordinators.create",
        json!({ "fullName": "Sin Grupos" }),
    );

    let dash = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "coordinators.dashboard",
        json!({ "id": coordinator["id"], "today": TODAY }),
    );
    assert_eq!(dash["totalStudents"].as_i64(), Some(0));
    assert_eq!(dash["assignedGroupsCount"].as_i64(), Some(0));
    assert_eq!(dash["absencesToday"].as_i64(), Some(0));
    assert_eq!(dash["incidentsToday"].as_i64(), Some(0));
    assert_eq!(
        dash["emotionSummary"].as_object().map(|m| m.len()),
        Some(0)
    );
    assert_eq!(dash["atRiskStudents"].as_array().map(|a| a.len()), Some(0));
}
