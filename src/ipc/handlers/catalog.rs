use crate::ipc::helpers::{
    dispatch, new_id, now_rfc3339, optional_str, require_row, required_str, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn levels_list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, name, created_at FROM school_levels ORDER BY name")
        .map_err(HandlerErr::query)?;
    let levels = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "createdAt": r.get::<_, String>(2)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "levels": levels }))
}

fn levels_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = required_str(params, "name")?;
    let exists = conn
        .query_row("SELECT 1 FROM school_levels WHERE name = ?", [&name], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(HandlerErr::query)?
        .is_some();
    if exists {
        return Err(HandlerErr::conflict("level name already exists"));
    }
    let id = new_id();
    conn.execute(
        "INSERT INTO school_levels(id, name, created_at) VALUES(?, ?, ?)",
        (&id, &name, now_rfc3339()),
    )
    .map_err(|e| HandlerErr::update(e, "school_levels"))?;
    Ok(json!({ "id": id, "name": name }))
}

fn grades_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let level_id = optional_str(params, "levelId");
    let (sql, args): (&str, Vec<String>) = match &level_id {
        Some(id) => (
            "SELECT id, level_id, name, created_at FROM school_grades WHERE level_id = ? ORDER BY name",
            vec![id.clone()],
        ),
        None => (
            "SELECT id, level_id, name, created_at FROM school_grades ORDER BY name",
            vec![],
        ),
    };
    let mut stmt = conn.prepare(sql).map_err(HandlerErr::query)?;
    let grades = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "levelId": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
                "createdAt": r.get::<_, String>(3)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "grades": grades }))
}

fn grades_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let level_id = required_str(params, "levelId")?;
    let name = required_str(params, "name")?;
    require_row(conn, "school_levels", &level_id, "level")?;
    let id = new_id();
    conn.execute(
        "INSERT INTO school_grades(id, level_id, name, created_at) VALUES(?, ?, ?, ?)",
        (&id, &level_id, &name, now_rfc3339()),
    )
    .map_err(|e| HandlerErr::update(e, "school_grades"))?;
    Ok(json!({ "id": id, "levelId": level_id, "name": name }))
}

fn groups_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let grade_id = optional_str(params, "gradeId");
    let (sql, args): (&str, Vec<String>) = match &grade_id {
        Some(id) => (
            "SELECT id, grade_id, name, created_at FROM school_groups WHERE grade_id = ? ORDER BY name",
            vec![id.clone()],
        ),
        None => (
            "SELECT id, grade_id, name, created_at FROM school_groups ORDER BY name",
            vec![],
        ),
    };
    let mut stmt = conn.prepare(sql).map_err(HandlerErr::query)?;
    let groups = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "gradeId": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
                "createdAt": r.get::<_, String>(3)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "groups": groups }))
}

fn groups_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let grade_id = required_str(params, "gradeId")?;
    let name = required_str(params, "name")?;
    require_row(conn, "school_grades", &grade_id, "grade")?;
    let id = new_id();
    conn.execute(
        "INSERT INTO school_groups(id, grade_id, name, created_at) VALUES(?, ?, ?, ?)",
        (&id, &grade_id, &name, now_rfc3339()),
    )
    .map_err(|e| HandlerErr::update(e, "school_groups"))?;
    Ok(json!({ "id": id, "gradeId": grade_id, "name": name }))
}

/// Feed for assignment pickers: every group with its grade and level
/// names plus a single display label.
fn groups_list_detailed(
    conn: &Connection,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT g.id, g.name, gr.name, lvl.name
             FROM school_groups g
             JOIN school_grades gr ON gr.id = g.grade_id
             JOIN school_levels lvl ON lvl.id = gr.level_id
             ORDER BY lvl.name, gr.name, g.name",
        )
        .map_err(HandlerErr::query)?;
    let groups = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let group: String = r.get(1)?;
            let grade: String = r.get(2)?;
            let level: String = r.get(3)?;
            Ok(json!({
                "id": id,
                "name": group,
                "gradeName": grade,
                "levelName": level,
                "displayName": format!("{} {} - {}", level, grade, group)
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "groups": groups }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "levels.list" => Some(dispatch(state, req, levels_list)),
        "levels.create" => Some(dispatch(state, req, levels_create)),
        "grades.list" => Some(dispatch(state, req, grades_list)),
        "grades.create" => Some(dispatch(state, req, grades_create)),
        "groups.list" => Some(dispatch(state, req, groups_list)),
        "groups.create" => Some(dispatch(state, req, groups_create)),
        "groups.listDetailed" => Some(dispatch(state, req, groups_list_detailed)),
        _ => None,
    }
}
