use crate::db;
use crate::ipc::helpers::{
    check_id_match, dispatch, new_id, now_rfc3339, optional_bool, optional_str, parse_date,
    require_row, required_str, today_utc, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::stats;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn coordinator_row(conn: &Connection, id: &str) -> Result<Option<serde_json::Value>, HandlerErr> {
    conn.query_row(
        "SELECT id, full_name, email, is_active, created_at FROM coordinators WHERE id = ?",
        [id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "fullName": r.get::<_, String>(1)?,
                "email": r.get::<_, Option<String>>(2)?,
                "isActive": r.get::<_, i64>(3)? != 0,
                "createdAt": r.get::<_, String>(4)?
            }))
        },
    )
    .optional()
    .map_err(HandlerErr::query)
}

fn assignments_json(conn: &Connection, id: &str) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT cg.group_id, g.name, gr.name, lvl.name, cg.assigned_at
             FROM coordinator_groups cg
             JOIN school_groups g ON g.id = cg.group_id
             JOIN school_grades gr ON gr.id = g.grade_id
             JOIN school_levels lvl ON lvl.id = gr.level_id
             WHERE cg.coordinator_id = ?
             ORDER BY lvl.name, gr.name, g.name",
        )
        .map_err(HandlerErr::query)?;
    stmt.query_map([id], |r| {
        let group: String = r.get(1)?;
        let grade: String = r.get(2)?;
        let level: String = r.get(3)?;
        Ok(json!({
            "groupId": r.get::<_, String>(0)?,
            "displayName": format!("{} {} - {}", level, grade, group),
            "assignedAt": r.get::<_, String>(4)?
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::query)
}

fn list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id FROM coordinators ORDER BY full_name")
        .map_err(HandlerErr::query)?;
    let ids = stmt
        .query_map([], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    let mut coordinators = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(mut c) = coordinator_row(conn, &id)? {
            c["assignments"] = json!(assignments_json(conn, &id)?);
            coordinators.push(c);
        }
    }
    Ok(json!({ "coordinators": coordinators }))
}

fn get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let Some(mut coordinator) = coordinator_row(conn, &id)? else {
        return Err(HandlerErr::not_found("coordinator not found"));
    };
    coordinator["assignments"] = json!(assignments_json(conn, &id)?);
    Ok(coordinator)
}

fn create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let full_name = required_str(params, "fullName")?;
    let email = optional_str(params, "email");
    let password_hash = optional_str(params, "password").map(|p| db::sha256_hex(&p));
    let is_active = optional_bool(params, "isActive", true);
    let id = new_id();
    conn.execute(
        "INSERT INTO coordinators(id, full_name, email, password_hash, is_active, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&id, &full_name, &email, &password_hash, is_active as i64, now_rfc3339()),
    )
    .map_err(|e| HandlerErr::update(e, "coordinators"))?;
    Ok(coordinator_row(conn, &id)?.expect("inserted coordinator"))
}

fn update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let payload = params
        .get("coordinator")
        .ok_or_else(|| HandlerErr::bad_params("missing coordinator"))?;
    check_id_match(&id, payload)?;
    require_row(conn, "coordinators", &id, "coordinator")?;

    let full_name = required_str(payload, "fullName")?;
    let email = optional_str(payload, "email");
    let password_hash = optional_str(payload, "password").map(|p| db::sha256_hex(&p));
    let is_active = optional_bool(payload, "isActive", true);
    conn.execute(
        "UPDATE coordinators SET full_name = ?, email = ?, is_active = ?,
                password_hash = COALESCE(?, password_hash)
         WHERE id = ?",
        (&full_name, &email, is_active as i64, &password_hash, &id),
    )
    .map_err(|e| HandlerErr::update(e, "coordinators"))?;
    Ok(coordinator_row(conn, &id)?.expect("updated coordinator"))
}

/// Full replace: every assignment row for the coordinator is deleted
/// and one row per given group inserted, in a single transaction.
fn assign_groups(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    require_row(conn, "coordinators", &id, "coordinator")?;
    let Some(raw_ids) = params.get("groupIds").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing groupIds"));
    };
    let mut group_ids = Vec::with_capacity(raw_ids.len());
    for v in raw_ids {
        let Some(gid) = v.as_str() else {
            return Err(HandlerErr::bad_params("groupIds must contain only strings"));
        };
        group_ids.push(gid.to_string());
    }

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    for gid in &group_ids {
        require_row(&tx, "school_groups", gid, "group")?;
    }
    tx.execute("DELETE FROM coordinator_groups WHERE coordinator_id = ?", [&id])
        .map_err(|e| HandlerErr::update(e, "coordinator_groups"))?;
    let now = now_rfc3339();
    for gid in &group_ids {
        tx.execute(
            "INSERT INTO coordinator_groups(id, coordinator_id, group_id, assigned_at)
             VALUES(?, ?, ?, ?)",
            (new_id(), &id, gid, &now),
        )
        .map_err(|e| HandlerErr::update(e, "coordinator_groups"))?;
    }
    tx.commit().map_err(HandlerErr::commit)?;

    Ok(json!({ "coordinatorId": id, "assigned": group_ids.len() }))
}

fn dashboard(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    require_row(conn, "coordinators", &id, "coordinator")?;
    let today = match optional_str(params, "today") {
        Some(raw) => parse_date(&raw)?,
        None => today_utc(),
    };

    let dash = stats::coordinator_dashboard(conn, &id, today)
        .map_err(|e| HandlerErr::new(e.code, e.message))?;

    let at_risk: Vec<serde_json::Value> = dash
        .at_risk
        .iter()
        .map(|s| {
            json!({
                "id": s.id,
                "name": s.name,
                "group": s.group
            })
        })
        .collect();
    Ok(json!({
        "totalStudents": dash.total_students,
        "assignedGroupsCount": dash.assigned_groups_count,
        "absencesToday": dash.absences_today,
        "incidentsToday": dash.incidents_today,
        "emotionSummary": dash.emotion_summary,
        "atRiskStudents": at_risk
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "coordinators.list" => Some(dispatch(state, req, list)),
        "coordinators.get" => Some(dispatch(state, req, get)),
        "coordinators.create" => Some(dispatch(state, req, create)),
        "coordinators.update" => Some(dispatch(state, req, update)),
        "coordinators.assignGroups" => Some(dispatch(state, req, assign_groups)),
        "coordinators.dashboard" => Some(dispatch(state, req, dashboard)),
        _ => None,
    }
}
