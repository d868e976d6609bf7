use crate::ipc::helpers::{
    dispatch, new_id, now_rfc3339, require_row, required_str, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn list_by_course(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = required_str(params, "courseId")?;
    require_row(conn, "courses", &course_id, "course")?;
    let mut stmt = conn
        .prepare(
            "SELECT e.id, e.student_id, s.first_name, s.paternal_surname, e.enrolled_at
             FROM enrollments e
             JOIN students s ON s.id = e.student_id
             WHERE e.course_id = ?
             ORDER BY s.paternal_surname, s.first_name",
        )
        .map_err(HandlerErr::query)?;
    let enrollments = stmt
        .query_map([&course_id], |r| {
            let first: String = r.get(2)?;
            let paternal: String = r.get(3)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "studentName": format!("{} {}", first, paternal),
                "enrolledAt": r.get::<_, String>(4)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "enrollments": enrollments }))
}

fn list_by_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    require_row(conn, "students", &student_id, "student")?;
    let mut stmt = conn
        .prepare(
            "SELECT e.id, c.id, c.name, c.grade, t.full_name, e.enrolled_at
             FROM enrollments e
             JOIN courses c ON c.id = e.course_id
             JOIN teachers t ON t.id = c.teacher_id
             WHERE e.student_id = ?
             ORDER BY c.name",
        )
        .map_err(HandlerErr::query)?;
    let enrollments = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "courseId": r.get::<_, String>(1)?,
                "courseName": r.get::<_, String>(2)?,
                "grade": r.get::<_, String>(3)?,
                "teacherName": r.get::<_, String>(4)?,
                "enrolledAt": r.get::<_, String>(5)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "enrollments": enrollments }))
}

fn create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let course_id = required_str(params, "courseId")?;
    require_row(conn, "students", &student_id, "student")?;
    require_row(conn, "courses", &course_id, "course")?;

    let exists = conn
        .query_row(
            "SELECT 1 FROM enrollments WHERE student_id = ? AND course_id = ?",
            (&student_id, &course_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(HandlerErr::query)?
        .is_some();
    if exists {
        return Err(HandlerErr::conflict("student already enrolled in course"));
    }

    let id = new_id();
    let enrolled_at = now_rfc3339();
    conn.execute(
        "INSERT INTO enrollments(id, student_id, course_id, enrolled_at) VALUES(?, ?, ?, ?)",
        (&id, &student_id, &course_id, &enrolled_at),
    )
    .map_err(|e| HandlerErr::update(e, "enrollments"))?;
    Ok(json!({
        "id": id,
        "studentId": student_id,
        "courseId": course_id,
        "enrolledAt": enrolled_at
    }))
}

fn delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let affected = conn
        .execute("DELETE FROM enrollments WHERE id = ?", [&id])
        .map_err(|e| HandlerErr::update(e, "enrollments"))?;
    if affected == 0 {
        return Err(HandlerErr::not_found("enrollment not found"));
    }
    Ok(json!({ "deleted": id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "enrollments.listByCourse" => Some(dispatch(state, req, list_by_course)),
        "enrollments.listByStudent" => Some(dispatch(state, req, list_by_student)),
        "enrollments.create" => Some(dispatch(state, req, create)),
        "enrollments.delete" => Some(dispatch(state, req, delete)),
        _ => None,
    }
}
