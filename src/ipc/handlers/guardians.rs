use crate::db;
use crate::ipc::helpers::{
    check_id_match, dispatch, new_id, now_rfc3339, optional_bool, optional_str, require_row,
    required_str, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

struct GuardianInput {
    full_name: String,
    phone: Option<String>,
    email: Option<String>,
    password_hash: Option<String>,
    workplace: Option<String>,
    occupation: Option<String>,
    work_phone: Option<String>,
    mobile_phone: Option<String>,
    is_mother: bool,
    is_father: bool,
}

fn parse_input(payload: &serde_json::Value) -> Result<GuardianInput, HandlerErr> {
    Ok(GuardianInput {
        full_name: required_str(payload, "fullName")?,
        phone: optional_str(payload, "phone"),
        email: optional_str(payload, "email"),
        password_hash: optional_str(payload, "password").map(|p| db::sha256_hex(&p)),
        workplace: optional_str(payload, "workplace"),
        occupation: optional_str(payload, "occupation"),
        work_phone: optional_str(payload, "workPhone"),
        mobile_phone: optional_str(payload, "mobilePhone"),
        is_mother: optional_bool(payload, "isMother", false),
        is_father: optional_bool(payload, "isFather", false),
    })
}

fn guardian_row(conn: &Connection, id: &str) -> Result<Option<serde_json::Value>, HandlerErr> {
    conn.query_row(
        "SELECT id, full_name, phone, email, workplace, occupation, work_phone,
                mobile_phone, is_mother, is_father, created_at
         FROM guardians WHERE id = ?",
        [id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "fullName": r.get::<_, String>(1)?,
                "phone": r.get::<_, Option<String>>(2)?,
                "email": r.get::<_, Option<String>>(3)?,
                "workplace": r.get::<_, Option<String>>(4)?,
                "occupation": r.get::<_, Option<String>>(5)?,
                "workPhone": r.get::<_, Option<String>>(6)?,
                "mobilePhone": r.get::<_, Option<String>>(7)?,
                "isMother": r.get::<_, i64>(8)? != 0,
                "isFather": r.get::<_, i64>(9)? != 0,
                "createdAt": r.get::<_, String>(10)?
            }))
        },
    )
    .optional()
    .map_err(HandlerErr::query)
}

fn list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id FROM guardians ORDER BY full_name")
        .map_err(HandlerErr::query)?;
    let ids = stmt
        .query_map([], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    let mut guardians = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(g) = guardian_row(conn, &id)? {
            guardians.push(g);
        }
    }
    Ok(json!({ "guardians": guardians }))
}

fn get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    guardian_row(conn, &id)?.ok_or_else(|| HandlerErr::not_found("guardian not found"))
}

fn create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let input = parse_input(params)?;
    let id = new_id();
    conn.execute(
        "INSERT INTO guardians(id, full_name, phone, email, password_hash, workplace,
                               occupation, work_phone, mobile_phone, is_mother, is_father, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &input.full_name,
            &input.phone,
            &input.email,
            &input.password_hash,
            &input.workplace,
            &input.occupation,
            &input.work_phone,
            &input.mobile_phone,
            input.is_mother as i64,
            input.is_father as i64,
            now_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr::update(e, "guardians"))?;
    Ok(guardian_row(conn, &id)?.expect("inserted guardian"))
}

fn update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let payload = params
        .get("guardian")
        .ok_or_else(|| HandlerErr::bad_params("missing guardian"))?;
    check_id_match(&id, payload)?;
    require_row(conn, "guardians", &id, "guardian")?;
    let input = parse_input(payload)?;

    // Full replace; the digest is only touched when a new password comes in.
    conn.execute(
        "UPDATE guardians SET full_name = ?, phone = ?, email = ?, workplace = ?,
                occupation = ?, work_phone = ?, mobile_phone = ?, is_mother = ?, is_father = ?,
                password_hash = COALESCE(?, password_hash)
         WHERE id = ?",
        (
            &input.full_name,
            &input.phone,
            &input.email,
            &input.workplace,
            &input.occupation,
            &input.work_phone,
            &input.mobile_phone,
            input.is_mother as i64,
            input.is_father as i64,
            &input.password_hash,
            &id,
        ),
    )
    .map_err(|e| HandlerErr::update(e, "guardians"))?;
    Ok(guardian_row(conn, &id)?.expect("updated guardian"))
}

fn delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let affected = conn
        .execute("DELETE FROM guardians WHERE id = ?", [&id])
        .map_err(|e| HandlerErr::update(e, "guardians"))?;
    if affected == 0 {
        return Err(HandlerErr::not_found("guardian not found"));
    }
    Ok(json!({ "deleted": id }))
}

fn attach(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let guardian_id = required_str(params, "guardianId")?;
    let relationship = optional_str(params, "relationship");
    require_row(conn, "students", &student_id, "student")?;
    require_row(conn, "guardians", &guardian_id, "guardian")?;

    let exists = conn
        .query_row(
            "SELECT 1 FROM student_guardians WHERE student_id = ? AND guardian_id = ?",
            (&student_id, &guardian_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(HandlerErr::query)?
        .is_some();
    if exists {
        return Err(HandlerErr::conflict("guardian already linked to student"));
    }

    conn.execute(
        "INSERT INTO student_guardians(student_id, guardian_id, relationship, created_at)
         VALUES(?, ?, ?, ?)",
        (&student_id, &guardian_id, &relationship, now_rfc3339()),
    )
    .map_err(|e| HandlerErr::update(e, "student_guardians"))?;
    Ok(json!({ "studentId": student_id, "guardianId": guardian_id }))
}

fn detach(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let guardian_id = required_str(params, "guardianId")?;
    let affected = conn
        .execute(
            "DELETE FROM student_guardians WHERE student_id = ? AND guardian_id = ?",
            (&student_id, &guardian_id),
        )
        .map_err(|e| HandlerErr::update(e, "student_guardians"))?;
    if affected == 0 {
        return Err(HandlerErr::not_found("guardian link not found"));
    }
    Ok(json!({ "studentId": student_id, "guardianId": guardian_id }))
}

fn list_by_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    require_row(conn, "students", &student_id, "student")?;
    let mut stmt = conn
        .prepare(
            "SELECT g.id, g.full_name, g.phone, g.email, sg.relationship, g.is_mother, g.is_father
             FROM student_guardians sg
             JOIN guardians g ON g.id = sg.guardian_id
             WHERE sg.student_id = ?
             ORDER BY g.full_name",
        )
        .map_err(HandlerErr::query)?;
    let guardians = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "fullName": r.get::<_, String>(1)?,
                "phone": r.get::<_, Option<String>>(2)?,
                "email": r.get::<_, Option<String>>(3)?,
                "relationship": r.get::<_, Option<String>>(4)?,
                "isMother": r.get::<_, i64>(5)? != 0,
                "isFather": r.get::<_, i64>(6)? != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "guardians": guardians }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "guardians.list" => Some(dispatch(state, req, list)),
        "guardians.get" => Some(dispatch(state, req, get)),
        "guardians.create" => Some(dispatch(state, req, create)),
        "guardians.update" => Some(dispatch(state, req, update)),
        "guardians.delete" => Some(dispatch(state, req, delete)),
        "guardians.attach" => Some(dispatch(state, req, attach)),
        "guardians.detach" => Some(dispatch(state, req, detach)),
        "guardians.listByStudent" => Some(dispatch(state, req, list_by_student)),
        _ => None,
    }
}
