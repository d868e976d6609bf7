use crate::db;
use crate::ipc::helpers::{
    check_id_match, dispatch, new_id, now_rfc3339, optional_bool, optional_str, require_row,
    required_str, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

struct TeacherInput {
    full_name: String,
    email: Option<String>,
    phone: Option<String>,
    matricula: Option<String>,
    password_hash: Option<String>,
    is_active: bool,
}

fn parse_input(payload: &serde_json::Value) -> Result<TeacherInput, HandlerErr> {
    Ok(TeacherInput {
        full_name: required_str(payload, "fullName")?,
        email: optional_str(payload, "email"),
        phone: optional_str(payload, "phone"),
        matricula: optional_str(payload, "matricula"),
        password_hash: optional_str(payload, "password").map(|p| db::sha256_hex(&p)),
        is_active: optional_bool(payload, "isActive", true),
    })
}

fn teacher_row(conn: &Connection, id: &str) -> Result<Option<serde_json::Value>, HandlerErr> {
    conn.query_row(
        "SELECT id, full_name, email, phone, matricula, is_active, created_at
         FROM teachers WHERE id = ?",
        [id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "fullName": r.get::<_, String>(1)?,
                "email": r.get::<_, Option<String>>(2)?,
                "phone": r.get::<_, Option<String>>(3)?,
                "matricula": r.get::<_, Option<String>>(4)?,
                "isActive": r.get::<_, i64>(5)? != 0,
                "createdAt": r.get::<_, String>(6)?
            }))
        },
    )
    .optional()
    .map_err(HandlerErr::query)
}

fn list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id FROM teachers ORDER BY full_name")
        .map_err(HandlerErr::query)?;
    let ids = stmt
        .query_map([], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    let mut teachers = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(t) = teacher_row(conn, &id)? {
            teachers.push(t);
        }
    }
    Ok(json!({ "teachers": teachers }))
}

fn get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    teacher_row(conn, &id)?.ok_or_else(|| HandlerErr::not_found("teacher not found"))
}

fn create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let input = parse_input(params)?;
    let id = new_id();
    conn.execute(
        "INSERT INTO teachers(id, full_name, email, phone, matricula, password_hash, is_active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &input.full_name,
            &input.email,
            &input.phone,
            &input.matricula,
            &input.password_hash,
            input.is_active as i64,
            now_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr::update(e, "teachers"))?;
    Ok(teacher_row(conn, &id)?.expect("inserted teacher"))
}

fn update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let payload = params
        .get("teacher")
        .ok_or_else(|| HandlerErr::bad_params("missing teacher"))?;
    check_id_match(&id, payload)?;
    require_row(conn, "teachers", &id, "teacher")?;
    let input = parse_input(payload)?;
    conn.execute(
        "UPDATE teachers SET full_name = ?, email = ?, phone = ?, matricula = ?,
                is_active = ?, password_hash = COALESCE(?, password_hash)
         WHERE id = ?",
        (
            &input.full_name,
            &input.email,
            &input.phone,
            &input.matricula,
            input.is_active as i64,
            &input.password_hash,
            &id,
        ),
    )
    .map_err(|e| HandlerErr::update(e, "teachers"))?;
    Ok(teacher_row(conn, &id)?.expect("updated teacher"))
}

fn delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let affected = conn
        .execute("DELETE FROM teachers WHERE id = ?", [&id])
        .map_err(|e| HandlerErr::update(e, "teachers"))?;
    if affected == 0 {
        return Err(HandlerErr::not_found("teacher not found"));
    }
    Ok(json!({ "deleted": id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.list" => Some(dispatch(state, req, list)),
        "teachers.get" => Some(dispatch(state, req, get)),
        "teachers.create" => Some(dispatch(state, req, create)),
        "teachers.update" => Some(dispatch(state, req, update)),
        "teachers.delete" => Some(dispatch(state, req, delete)),
        _ => None,
    }
}
