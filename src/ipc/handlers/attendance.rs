use crate::ipc::helpers::{
    check_id_match, dispatch, new_id, now_rfc3339, optional_str, parse_date, require_row,
    required_str, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

const STATUSES: [&str; 3] = ["P", "A", "R"];

struct AttendanceInput {
    student_id: String,
    course_id: String,
    class_date: String,
    status: String,
    emotion: Option<String>,
    note: Option<String>,
}

fn parse_input(payload: &serde_json::Value) -> Result<AttendanceInput, HandlerErr> {
    let status = required_str(payload, "status")?;
    if !STATUSES.contains(&status.as_str()) {
        return Err(HandlerErr::bad_params("status must be one of P, A, R"));
    }
    let class_date = required_str(payload, "classDate")?;
    parse_date(&class_date)?;
    Ok(AttendanceInput {
        student_id: required_str(payload, "studentId")?,
        course_id: required_str(payload, "courseId")?,
        class_date,
        status,
        emotion: optional_str(payload, "emotion"),
        note: optional_str(payload, "note"),
    })
}

fn attendance_row(conn: &Connection, id: &str) -> Result<Option<serde_json::Value>, HandlerErr> {
    conn.query_row(
        "SELECT id, student_id, course_id, class_date, status, emotion, note, created_at
         FROM attendances WHERE id = ?",
        [id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "courseId": r.get::<_, String>(2)?,
                "classDate": r.get::<_, String>(3)?,
                "status": r.get::<_, String>(4)?,
                "emotion": r.get::<_, Option<String>>(5)?,
                "note": r.get::<_, Option<String>>(6)?,
                "createdAt": r.get::<_, String>(7)?
            }))
        },
    )
    .optional()
    .map_err(HandlerErr::query)
}

fn existing_id(
    conn: &Connection,
    input: &AttendanceInput,
) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT id FROM attendances WHERE student_id = ? AND course_id = ? AND class_date = ?",
        (&input.student_id, &input.course_id, &input.class_date),
        |r| r.get::<_, String>(0),
    )
    .optional()
    .map_err(HandlerErr::query)
}

fn insert(conn: &Connection, input: &AttendanceInput) -> Result<String, HandlerErr> {
    let id = new_id();
    conn.execute(
        "INSERT INTO attendances(id, student_id, course_id, class_date, status, emotion, note, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &input.student_id,
            &input.course_id,
            &input.class_date,
            &input.status,
            &input.emotion,
            &input.note,
            now_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr::update(e, "attendances"))?;
    Ok(id)
}

fn record(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let input = parse_input(params)?;
    require_row(conn, "students", &input.student_id, "student")?;
    require_row(conn, "courses", &input.course_id, "course")?;
    if existing_id(conn, &input)?.is_some() {
        return Err(HandlerErr::conflict(
            "attendance already recorded for student, course and date",
        ));
    }
    let id = insert(conn, &input)?;
    Ok(attendance_row(conn, &id)?.expect("inserted attendance"))
}

/// Transactional upsert on the (student, course, date) natural key:
/// existing rows get status, emotion and note overwritten.
fn bulk_record(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let Some(records) = params.get("records").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing records"));
    };
    if records.is_empty() {
        return Err(HandlerErr::bad_params("records must not be empty"));
    }

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    let mut created = 0i64;
    let mut updated = 0i64;
    for raw in records {
        let input = parse_input(raw)?;
        require_row(&tx, "students", &input.student_id, "student")?;
        require_row(&tx, "courses", &input.course_id, "course")?;
        match existing_id(&tx, &input)? {
            Some(id) => {
                tx.execute(
                    "UPDATE attendances SET status = ?, emotion = ?, note = ? WHERE id = ?",
                    (&input.status, &input.emotion, &input.note, &id),
                )
                .map_err(|e| HandlerErr::update(e, "attendances"))?;
                updated += 1;
            }
            None => {
                insert(&tx, &input)?;
                created += 1;
            }
        }
    }
    tx.commit().map_err(HandlerErr::commit)?;
    Ok(json!({ "created": created, "updated": updated }))
}

fn list_by_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    require_row(conn, "students", &student_id, "student")?;
    let mut stmt = conn
        .prepare(
            "SELECT a.id, a.course_id, c.name, a.class_date, a.status, a.emotion, a.note
             FROM attendances a
             JOIN courses c ON c.id = a.course_id
             WHERE a.student_id = ?
             ORDER BY a.class_date DESC",
        )
        .map_err(HandlerErr::query)?;
    let attendances = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "courseId": r.get::<_, String>(1)?,
                "courseName": r.get::<_, String>(2)?,
                "classDate": r.get::<_, String>(3)?,
                "status": r.get::<_, String>(4)?,
                "emotion": r.get::<_, Option<String>>(5)?,
                "note": r.get::<_, Option<String>>(6)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "attendances": attendances }))
}

fn by_course_date(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = required_str(params, "courseId")?;
    let class_date = required_str(params, "classDate")?;
    parse_date(&class_date)?;
    require_row(conn, "courses", &course_id, "course")?;
    let mut stmt = conn
        .prepare(
            "SELECT a.id, a.student_id, s.first_name, s.paternal_surname, a.status, a.emotion, a.note
             FROM attendances a
             JOIN students s ON s.id = a.student_id
             WHERE a.course_id = ? AND a.class_date = ?
             ORDER BY s.paternal_surname, s.first_name",
        )
        .map_err(HandlerErr::query)?;
    let attendances = stmt
        .query_map((&course_id, &class_date), |r| {
            let first: String = r.get(2)?;
            let paternal: String = r.get(3)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "studentName": format!("{} {}", first, paternal),
                "status": r.get::<_, String>(4)?,
                "emotion": r.get::<_, Option<String>>(5)?,
                "note": r.get::<_, Option<String>>(6)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "attendances": attendances }))
}

fn update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let payload = params
        .get("record")
        .ok_or_else(|| HandlerErr::bad_params("missing record"))?;
    check_id_match(&id, payload)?;
    require_row(conn, "attendances", &id, "attendance")?;
    let input = parse_input(payload)?;
    conn.execute(
        "UPDATE attendances SET student_id = ?, course_id = ?, class_date = ?,
                status = ?, emotion = ?, note = ?
         WHERE id = ?",
        (
            &input.student_id,
            &input.course_id,
            &input.class_date,
            &input.status,
            &input.emotion,
            &input.note,
            &id,
        ),
    )
    .map_err(|e| HandlerErr::update(e, "attendances"))?;
    Ok(attendance_row(conn, &id)?.expect("updated attendance"))
}

fn delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let affected = conn
        .execute("DELETE FROM attendances WHERE id = ?", [&id])
        .map_err(|e| HandlerErr::update(e, "attendances"))?;
    if affected == 0 {
        return Err(HandlerErr::not_found("attendance not found"));
    }
    Ok(json!({ "deleted": id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.record" => Some(dispatch(state, req, record)),
        "attendance.bulkRecord" => Some(dispatch(state, req, bulk_record)),
        "attendance.listByStudent" => Some(dispatch(state, req, list_by_student)),
        "attendance.byCourseDate" => Some(dispatch(state, req, by_course_date)),
        "attendance.update" => Some(dispatch(state, req, update)),
        "attendance.delete" => Some(dispatch(state, req, delete)),
        _ => None,
    }
}
