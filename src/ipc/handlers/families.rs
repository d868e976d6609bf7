use crate::ipc::helpers::{
    check_id_match, dispatch, new_id, now_rfc3339, optional_str, require_row, required_str,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn family_row(conn: &Connection, id: &str) -> Result<Option<serde_json::Value>, HandlerErr> {
    conn.query_row(
        "SELECT id, family_number, family_name, created_at, updated_at
         FROM families WHERE id = ?",
        [id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "familyNumber": r.get::<_, Option<String>>(1)?,
                "familyName": r.get::<_, Option<String>>(2)?,
                "createdAt": r.get::<_, String>(3)?,
                "updatedAt": r.get::<_, String>(4)?
            }))
        },
    )
    .optional()
    .map_err(HandlerErr::query)
}

fn list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, family_number, family_name, created_at, updated_at
             FROM families ORDER BY family_name",
        )
        .map_err(HandlerErr::query)?;
    let families = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "familyNumber": r.get::<_, Option<String>>(1)?,
                "familyName": r.get::<_, Option<String>>(2)?,
                "createdAt": r.get::<_, String>(3)?,
                "updatedAt": r.get::<_, String>(4)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "families": families }))
}

fn get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let Some(mut family) = family_row(conn, &id)? else {
        return Err(HandlerErr::not_found("family not found"));
    };

    let mut stmt = conn
        .prepare(
            "SELECT id, first_name, paternal_surname, status
             FROM students WHERE family_id = ? ORDER BY paternal_surname, first_name",
        )
        .map_err(HandlerErr::query)?;
    let students = stmt
        .query_map([&id], |r| {
            let first: String = r.get(1)?;
            let paternal: String = r.get(2)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": format!("{} {}", first, paternal),
                "status": r.get::<_, String>(3)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    family["students"] = json!(students);
    Ok(family)
}

fn create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let family_number = optional_str(params, "familyNumber");
    let family_name = optional_str(params, "familyName");
    let id = new_id();
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO families(id, family_number, family_name, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?)",
        (&id, &family_number, &family_name, &now, &now),
    )
    .map_err(|e| HandlerErr::update(e, "families"))?;
    Ok(family_row(conn, &id)?.expect("inserted family"))
}

fn update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let payload = params
        .get("family")
        .ok_or_else(|| HandlerErr::bad_params("missing family"))?;
    check_id_match(&id, payload)?;
    require_row(conn, "families", &id, "family")?;

    let family_number = optional_str(payload, "familyNumber");
    let family_name = optional_str(payload, "familyName");
    conn.execute(
        "UPDATE families SET family_number = ?, family_name = ?, updated_at = ? WHERE id = ?",
        (&family_number, &family_name, now_rfc3339(), &id),
    )
    .map_err(|e| HandlerErr::update(e, "families"))?;
    Ok(family_row(conn, &id)?.expect("updated family"))
}

fn delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let affected = conn
        .execute("DELETE FROM families WHERE id = ?", [&id])
        .map_err(|e| HandlerErr::update(e, "families"))?;
    if affected == 0 {
        return Err(HandlerErr::not_found("family not found"));
    }
    Ok(json!({ "deleted": id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "families.list" => Some(dispatch(state, req, list)),
        "families.get" => Some(dispatch(state, req, get)),
        "families.create" => Some(dispatch(state, req, create)),
        "families.update" => Some(dispatch(state, req, update)),
        "families.delete" => Some(dispatch(state, req, delete)),
        _ => None,
    }
}
