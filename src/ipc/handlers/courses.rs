use crate::ipc::helpers::{
    check_id_match, dispatch, new_id, now_rfc3339, optional_str, require_row, required_str,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn course_row(conn: &Connection, id: &str) -> Result<Option<serde_json::Value>, HandlerErr> {
    conn.query_row(
        "SELECT c.id, c.name, c.grade, c.teacher_id, t.full_name, c.created_at
         FROM courses c
         JOIN teachers t ON t.id = c.teacher_id
         WHERE c.id = ?",
        [id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "grade": r.get::<_, String>(2)?,
                "teacherId": r.get::<_, String>(3)?,
                "teacherName": r.get::<_, String>(4)?,
                "createdAt": r.get::<_, String>(5)?
            }))
        },
    )
    .optional()
    .map_err(HandlerErr::query)
}

fn list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = optional_str(params, "teacherId");
    let (sql, args): (&str, Vec<String>) = match &teacher_id {
        Some(id) => (
            "SELECT id FROM courses WHERE teacher_id = ? ORDER BY name",
            vec![id.clone()],
        ),
        None => ("SELECT id FROM courses ORDER BY name", vec![]),
    };
    let mut stmt = conn.prepare(sql).map_err(HandlerErr::query)?;
    let ids = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), |r| {
            r.get::<_, String>(0)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    let mut courses = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(c) = course_row(conn, &id)? {
            courses.push(c);
        }
    }
    Ok(json!({ "courses": courses }))
}

fn get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    course_row(conn, &id)?.ok_or_else(|| HandlerErr::not_found("course not found"))
}

fn create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = required_str(params, "name")?;
    let grade = required_str(params, "grade")?;
    let teacher_id = required_str(params, "teacherId")?;
    require_row(conn, "teachers", &teacher_id, "teacher")?;
    let id = new_id();
    conn.execute(
        "INSERT INTO courses(id, name, grade, teacher_id, created_at) VALUES(?, ?, ?, ?, ?)",
        (&id, &name, &grade, &teacher_id, now_rfc3339()),
    )
    .map_err(|e| HandlerErr::update(e, "courses"))?;
    Ok(course_row(conn, &id)?.expect("inserted course"))
}

fn update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let payload = params
        .get("course")
        .ok_or_else(|| HandlerErr::bad_params("missing course"))?;
    check_id_match(&id, payload)?;
    require_row(conn, "courses", &id, "course")?;

    let name = required_str(payload, "name")?;
    let grade = required_str(payload, "grade")?;
    let teacher_id = required_str(payload, "teacherId")?;
    require_row(conn, "teachers", &teacher_id, "teacher")?;

    conn.execute(
        "UPDATE courses SET name = ?, grade = ?, teacher_id = ? WHERE id = ?",
        (&name, &grade, &teacher_id, &id),
    )
    .map_err(|e| HandlerErr::update(e, "courses"))?;
    Ok(course_row(conn, &id)?.expect("updated course"))
}

fn delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let affected = conn
        .execute("DELETE FROM courses WHERE id = ?", [&id])
        .map_err(|e| HandlerErr::update(e, "courses"))?;
    if affected == 0 {
        return Err(HandlerErr::not_found("course not found"));
    }
    Ok(json!({ "deleted": id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "courses.list" => Some(dispatch(state, req, list)),
        "courses.get" => Some(dispatch(state, req, get)),
        "courses.create" => Some(dispatch(state, req, create)),
        "courses.update" => Some(dispatch(state, req, update)),
        "courses.delete" => Some(dispatch(state, req, delete)),
        _ => None,
    }
}
