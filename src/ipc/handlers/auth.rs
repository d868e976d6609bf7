use crate::auth::{validate_token, issue_token, CredentialStore, DbCredentialStore};
use crate::db;
use crate::ipc::helpers::{dispatch, required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

fn signing_secret(conn: &Connection) -> Result<String, HandlerErr> {
    db::settings_get_json(conn, "auth.jwt_secret")
        .map_err(HandlerErr::query)?
        .and_then(|v| v.as_str().map(|s| s.to_string()))
        .ok_or_else(|| HandlerErr::new("db_query_failed", "signing secret not configured"))
}

fn login(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let username = required_str(params, "username")?;
    let password = required_str(params, "password")?;

    let store = DbCredentialStore { conn };
    let verified = store
        .verify(&username, &password)
        .map_err(|e| HandlerErr::new(e.code, e.message))?
        .ok_or_else(|| HandlerErr::unauthorized("invalid credentials"))?;

    let secret = signing_secret(conn)?;
    let token =
        issue_token(&secret, &verified).map_err(|e| HandlerErr::new(e.code, e.message))?;

    Ok(json!({
        "token": token,
        "role": verified.role.as_str(),
        "userId": verified.user_id,
        "displayName": verified.display_name
    }))
}

fn validate(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let token = required_str(params, "token")?;
    let secret = signing_secret(conn)?;
    let claims =
        validate_token(&secret, &token).map_err(|e| HandlerErr::new(e.code, e.message))?;
    Ok(json!({
        "authenticated": true,
        "subject": claims.sub,
        "role": claims.role,
        "userId": claims.uid
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.login" => Some(dispatch(state, req, login)),
        "auth.validate" => Some(dispatch(state, req, validate)),
        _ => None,
    }
}
