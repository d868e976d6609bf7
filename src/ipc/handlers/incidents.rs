use crate::ipc::helpers::{
    check_id_match, dispatch, new_id, now_rfc3339, optional_bool, optional_str, parse_date,
    require_row, required_str, today_utc, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn types_list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, severity, description, is_active, created_at
             FROM incident_types ORDER BY name",
        )
        .map_err(HandlerErr::query)?;
    let types = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "severity": r.get::<_, String>(2)?,
                "description": r.get::<_, Option<String>>(3)?,
                "isActive": r.get::<_, i64>(4)? != 0,
                "createdAt": r.get::<_, String>(5)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "types": types }))
}

fn types_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = required_str(params, "name")?;
    let severity = required_str(params, "severity")?;
    let description = optional_str(params, "description");
    let id = new_id();
    conn.execute(
        "INSERT INTO incident_types(id, name, severity, description, is_active, created_at)
         VALUES(?, ?, ?, ?, 1, ?)",
        (&id, &name, &severity, &description, now_rfc3339()),
    )
    .map_err(|e| HandlerErr::update(e, "incident_types"))?;
    Ok(json!({ "id": id, "name": name, "severity": severity }))
}

fn types_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    require_row(conn, "incident_types", &id, "incident type")?;
    let name = required_str(params, "name")?;
    let severity = required_str(params, "severity")?;
    let description = optional_str(params, "description");
    let is_active = optional_bool(params, "isActive", true);
    conn.execute(
        "UPDATE incident_types SET name = ?, severity = ?, description = ?, is_active = ?
         WHERE id = ?",
        (&name, &severity, &description, is_active as i64, &id),
    )
    .map_err(|e| HandlerErr::update(e, "incident_types"))?;
    Ok(json!({ "id": id }))
}

fn incident_row(conn: &Connection, id: &str) -> Result<Option<serde_json::Value>, HandlerErr> {
    conn.query_row(
        "SELECT i.id, i.student_id, s.first_name, s.paternal_surname, i.type_id, t.name,
                t.severity, i.reporter_id, i.date, i.title, i.description, i.status,
                i.action_taken, i.created_at, i.updated_at
         FROM student_incidents i
         JOIN students s ON s.id = i.student_id
         JOIN incident_types t ON t.id = i.type_id
         WHERE i.id = ?",
        [id],
        |r| {
            let first: String = r.get(2)?;
            let paternal: String = r.get(3)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "studentName": format!("{} {}", first, paternal),
                "typeId": r.get::<_, String>(4)?,
                "typeName": r.get::<_, String>(5)?,
                "severity": r.get::<_, String>(6)?,
                "reporterId": r.get::<_, Option<String>>(7)?,
                "date": r.get::<_, String>(8)?,
                "title": r.get::<_, String>(9)?,
                "description": r.get::<_, Option<String>>(10)?,
                "status": r.get::<_, String>(11)?,
                "actionTaken": r.get::<_, Option<String>>(12)?,
                "createdAt": r.get::<_, String>(13)?,
                "updatedAt": r.get::<_, String>(14)?
            }))
        },
    )
    .optional()
    .map_err(HandlerErr::query)
}

fn ids_to_rows(conn: &Connection, ids: Vec<String>) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut incidents = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(i) = incident_row(conn, &id)? {
            incidents.push(i);
        }
    }
    Ok(incidents)
}

fn list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id FROM student_incidents ORDER BY date DESC")
        .map_err(HandlerErr::query)?;
    let ids = stmt
        .query_map([], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "incidents": ids_to_rows(conn, ids)? }))
}

fn list_by_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    require_row(conn, "students", &student_id, "student")?;
    let mut stmt = conn
        .prepare("SELECT id FROM student_incidents WHERE student_id = ? ORDER BY date DESC")
        .map_err(HandlerErr::query)?;
    let ids = stmt
        .query_map([&student_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "incidents": ids_to_rows(conn, ids)? }))
}

fn get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    incident_row(conn, &id)?.ok_or_else(|| HandlerErr::not_found("incident not found"))
}

fn create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let type_id = required_str(params, "typeId")?;
    let title = required_str(params, "title")?;
    require_row(conn, "students", &student_id, "student")?;
    require_row(conn, "incident_types", &type_id, "incident type")?;

    let reporter_id = optional_str(params, "reporterId");
    if let Some(rid) = &reporter_id {
        require_row(conn, "teachers", rid, "reporter")?;
    }
    let date = match optional_str(params, "date") {
        Some(d) => {
            parse_date(&d)?;
            d
        }
        None => today_utc().to_string(),
    };
    let description = optional_str(params, "description");
    let status = optional_str(params, "status").unwrap_or_else(|| "Abierto".to_string());
    let action_taken = optional_str(params, "actionTaken");

    let id = new_id();
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO student_incidents(id, student_id, type_id, reporter_id, date, title,
                description, status, action_taken, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &id,
            &student_id,
            &type_id,
            &reporter_id,
            &date,
            &title,
            &description,
            &status,
            &action_taken,
            &now,
            &now,
        ],
    )
    .map_err(|e| HandlerErr::update(e, "student_incidents"))?;
    Ok(incident_row(conn, &id)?.expect("inserted incident"))
}

fn update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let payload = params
        .get("incident")
        .ok_or_else(|| HandlerErr::bad_params("missing incident"))?;
    check_id_match(&id, payload)?;
    require_row(conn, "student_incidents", &id, "incident")?;

    let title = required_str(payload, "title")?;
    let status = optional_str(payload, "status").unwrap_or_else(|| "Abierto".to_string());
    let description = optional_str(payload, "description");
    let action_taken = optional_str(payload, "actionTaken");
    conn.execute(
        "UPDATE student_incidents SET title = ?, status = ?, description = ?,
                action_taken = ?, updated_at = ?
         WHERE id = ?",
        (
            &title,
            &status,
            &description,
            &action_taken,
            now_rfc3339(),
            &id,
        ),
    )
    .map_err(|e| HandlerErr::update(e, "student_incidents"))?;
    Ok(incident_row(conn, &id)?.expect("updated incident"))
}

fn delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let affected = conn
        .execute("DELETE FROM student_incidents WHERE id = ?", [&id])
        .map_err(|e| HandlerErr::update(e, "student_incidents"))?;
    if affected == 0 {
        return Err(HandlerErr::not_found("incident not found"));
    }
    Ok(json!({ "deleted": id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "incidentTypes.list" => Some(dispatch(state, req, types_list)),
        "incidentTypes.create" => Some(dispatch(state, req, types_create)),
        "incidentTypes.update" => Some(dispatch(state, req, types_update)),
        "incidents.list" => Some(dispatch(state, req, list)),
        "incidents.listByStudent" => Some(dispatch(state, req, list_by_student)),
        "incidents.get" => Some(dispatch(state, req, get)),
        "incidents.create" => Some(dispatch(state, req, create)),
        "incidents.update" => Some(dispatch(state, req, update)),
        "incidents.delete" => Some(dispatch(state, req, delete)),
        _ => None,
    }
}
