use crate::ipc::helpers::{dispatch, optional_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::stats;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::json;

fn stats_snapshot(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let now: DateTime<Utc> = match optional_str(params, "now") {
        Some(raw) => raw
            .parse::<DateTime<Utc>>()
            .map_err(|_| HandlerErr::bad_params("now must be an RFC 3339 timestamp"))?,
        None => Utc::now(),
    };

    let stats = stats::admin_stats(conn, now).map_err(|e| HandlerErr::new(e.code, e.message))?;

    let mut by_level = serde_json::Map::new();
    for (level, count) in &stats.by_level {
        by_level.insert(level.clone(), json!(count));
    }
    let recent: Vec<serde_json::Value> = stats
        .recent_students
        .iter()
        .map(|s| {
            json!({
                "id": s.id,
                "name": s.name,
                "joined": s.created_at
            })
        })
        .collect();

    Ok(json!({
        "totalStudents": stats.total_students,
        "pendingDocs": stats.pending_docs,
        "newEnrollments": stats.new_enrollments,
        "byLevel": by_level,
        "recentStudents": recent
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "adminDashboard.stats" => Some(dispatch(state, req, stats_snapshot)),
        _ => None,
    }
}
