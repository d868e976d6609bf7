use crate::ipc::helpers::{
    dispatch, new_id, now_rfc3339, optional_bool, optional_str, require_row, required_str,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn notification_row(conn: &Connection, id: &str) -> Result<Option<serde_json::Value>, HandlerErr> {
    conn.query_row(
        "SELECT id, student_id, title, message, type, reference_id, is_read, created_at
         FROM notifications WHERE id = ?",
        [id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "title": r.get::<_, String>(2)?,
                "message": r.get::<_, String>(3)?,
                "type": r.get::<_, String>(4)?,
                "referenceId": r.get::<_, Option<String>>(5)?,
                "isRead": r.get::<_, i64>(6)? != 0,
                "createdAt": r.get::<_, String>(7)?
            }))
        },
    )
    .optional()
    .map_err(HandlerErr::query)
}

fn list_by_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    require_row(conn, "students", &student_id, "student")?;
    let unread_only = optional_bool(params, "unreadOnly", false);

    let sql = if unread_only {
        "SELECT id FROM notifications WHERE student_id = ? AND is_read = 0
         ORDER BY datetime(created_at) DESC"
    } else {
        "SELECT id FROM notifications WHERE student_id = ?
         ORDER BY datetime(created_at) DESC"
    };
    let mut stmt = conn.prepare(sql).map_err(HandlerErr::query)?;
    let ids = stmt
        .query_map([&student_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    let mut notifications = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(n) = notification_row(conn, &id)? {
            notifications.push(n);
        }
    }
    Ok(json!({ "notifications": notifications }))
}

fn create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let title = required_str(params, "title")?;
    let message = required_str(params, "message")?;
    require_row(conn, "students", &student_id, "student")?;
    let kind = optional_str(params, "type").unwrap_or_else(|| "General".to_string());
    let reference_id = optional_str(params, "referenceId");

    let id = new_id();
    conn.execute(
        "INSERT INTO notifications(id, student_id, title, message, type, reference_id, is_read, created_at)
         VALUES(?, ?, ?, ?, ?, ?, 0, ?)",
        (&id, &student_id, &title, &message, &kind, &reference_id, now_rfc3339()),
    )
    .map_err(|e| HandlerErr::update(e, "notifications"))?;
    Ok(notification_row(conn, &id)?.expect("inserted notification"))
}

fn mark_read(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let affected = conn
        .execute("UPDATE notifications SET is_read = 1 WHERE id = ?", [&id])
        .map_err(|e| HandlerErr::update(e, "notifications"))?;
    if affected == 0 {
        return Err(HandlerErr::not_found("notification not found"));
    }
    Ok(notification_row(conn, &id)?.expect("marked notification"))
}

fn delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let affected = conn
        .execute("DELETE FROM notifications WHERE id = ?", [&id])
        .map_err(|e| HandlerErr::update(e, "notifications"))?;
    if affected == 0 {
        return Err(HandlerErr::not_found("notification not found"));
    }
    Ok(json!({ "deleted": id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "notifications.listByStudent" => Some(dispatch(state, req, list_by_student)),
        "notifications.create" => Some(dispatch(state, req, create)),
        "notifications.markRead" => Some(dispatch(state, req, mark_read)),
        "notifications.delete" => Some(dispatch(state, req, delete)),
        _ => None,
    }
}
