use crate::ipc::helpers::{
    dispatch, new_id, now_rfc3339, optional_i64, optional_str, require_row, required_str,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn categories_list(
    conn: &Connection,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, code, name, description FROM interest_categories ORDER BY name")
        .map_err(HandlerErr::query)?;
    let categories = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "code": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
                "description": r.get::<_, Option<String>>(3)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "categories": categories }))
}

fn categories_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let code = required_str(params, "code")?;
    let name = required_str(params, "name")?;
    let description = optional_str(params, "description");
    let exists = conn
        .query_row(
            "SELECT 1 FROM interest_categories WHERE code = ?",
            [&code],
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(HandlerErr::query)?
        .is_some();
    if exists {
        return Err(HandlerErr::conflict("category code already exists"));
    }
    let id = new_id();
    conn.execute(
        "INSERT INTO interest_categories(id, code, name, description) VALUES(?, ?, ?, ?)",
        (&id, &code, &name, &description),
    )
    .map_err(|e| HandlerErr::update(e, "interest_categories"))?;
    Ok(json!({ "id": id, "code": code, "name": name }))
}

fn list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT i.id, i.name, i.description, i.category_id, c.code, c.name
             FROM interests i
             JOIN interest_categories c ON c.id = i.category_id
             WHERE i.is_active = 1
             ORDER BY c.name, i.name",
        )
        .map_err(HandlerErr::query)?;
    let interests = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "description": r.get::<_, Option<String>>(2)?,
                "categoryId": r.get::<_, String>(3)?,
                "categoryCode": r.get::<_, String>(4)?,
                "categoryName": r.get::<_, String>(5)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "interests": interests }))
}

fn create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let category_id = required_str(params, "categoryId")?;
    let name = required_str(params, "name")?;
    let description = optional_str(params, "description");
    require_row(conn, "interest_categories", &category_id, "category")?;
    let id = new_id();
    conn.execute(
        "INSERT INTO interests(id, category_id, name, description, is_active)
         VALUES(?, ?, ?, ?, 1)",
        (&id, &category_id, &name, &description),
    )
    .map_err(|e| HandlerErr::update(e, "interests"))?;
    Ok(json!({ "id": id, "categoryId": category_id, "name": name }))
}

fn list_by_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    require_row(conn, "students", &student_id, "student")?;
    let mut stmt = conn
        .prepare(
            "SELECT si.id, si.interest_id, i.name, c.name, si.preference_level, si.notes
             FROM student_interests si
             JOIN interests i ON i.id = si.interest_id
             JOIN interest_categories c ON c.id = i.category_id
             WHERE si.student_id = ?
             ORDER BY i.name",
        )
        .map_err(HandlerErr::query)?;
    let interests = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "interestId": r.get::<_, String>(1)?,
                "interestName": r.get::<_, String>(2)?,
                "categoryName": r.get::<_, String>(3)?,
                "preferenceLevel": r.get::<_, Option<i64>>(4)?,
                "notes": r.get::<_, Option<String>>(5)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "interests": interests }))
}

/// Same natural-key contract as the grade upsert: one row per
/// (student, interest), second write updates preference and notes.
fn student_upsert(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let interest_id = required_str(params, "interestId")?;
    require_row(conn, "students", &student_id, "student")?;
    require_row(conn, "interests", &interest_id, "interest")?;
    let preference_level = optional_i64(params, "preferenceLevel")?;
    let notes = optional_str(params, "notes");

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM student_interests WHERE student_id = ? AND interest_id = ?",
            (&student_id, &interest_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;

    let (created, id) = match existing {
        Some(id) => {
            conn.execute(
                "UPDATE student_interests SET preference_level = ?, notes = ? WHERE id = ?",
                (preference_level, &notes, &id),
            )
            .map_err(|e| HandlerErr::update(e, "student_interests"))?;
            (false, id)
        }
        None => {
            let id = new_id();
            conn.execute(
                "INSERT INTO student_interests(id, student_id, interest_id, preference_level,
                        notes, created_at)
                 VALUES(?, ?, ?, ?, ?, ?)",
                (&id, &student_id, &interest_id, preference_level, &notes, now_rfc3339()),
            )
            .map_err(|e| HandlerErr::update(e, "student_interests"))?;
            (true, id)
        }
    };

    Ok(json!({
        "id": id,
        "studentId": student_id,
        "interestId": interest_id,
        "preferenceLevel": preference_level,
        "notes": notes,
        "created": created
    }))
}

fn student_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let affected = conn
        .execute("DELETE FROM student_interests WHERE id = ?", [&id])
        .map_err(|e| HandlerErr::update(e, "student_interests"))?;
    if affected == 0 {
        return Err(HandlerErr::not_found("student interest not found"));
    }
    Ok(json!({ "deleted": id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "interests.categories.list" => Some(dispatch(state, req, categories_list)),
        "interests.categories.create" => Some(dispatch(state, req, categories_create)),
        "interests.list" => Some(dispatch(state, req, list)),
        "interests.create" => Some(dispatch(state, req, create)),
        "interests.listByStudent" => Some(dispatch(state, req, list_by_student)),
        "interests.studentUpsert" => Some(dispatch(state, req, student_upsert)),
        "interests.studentDelete" => Some(dispatch(state, req, student_delete)),
        _ => None,
    }
}
