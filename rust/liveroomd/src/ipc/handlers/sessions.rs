use crate::db;
use crate::ipc::error::ok;
use crate::ipc::helpers::{get_optional_ts, get_required_i64, get_required_str, require_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

fn sessions_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let title = get_required_str(params, "title")?;
    let title = title.trim();
    if title.is_empty() {
        return Err(HandlerErr::bad_params("title must not be empty"));
    }
    let scheduled_at = get_optional_ts(params, "scheduledAt")?;
    let session_id = db::session_create(conn, title, scheduled_at).map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "sessions" })),
    })?;
    tracing::info!(session_id, title, "session created");
    Ok(json!({ "sessionId": session_id }))
}

fn sessions_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let sessions = db::sessions_list(conn).map_err(HandlerErr::query)?;
    Ok(json!({ "sessions": sessions }))
}

fn sessions_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_i64(params, "sessionId")?;
    let removed = db::session_delete(conn, session_id).map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "sessions" })),
    })?;
    if !removed {
        return Err(HandlerErr::new("not_found", "session not found"));
    }
    tracing::info!(session_id, "session deleted");
    Ok(json!({ "ok": true }))
}

fn handle_sessions_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    match require_db(state).and_then(|conn| sessions_create(conn, &req.params)) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_sessions_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    match require_db(state).and_then(sessions_list) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_sessions_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    match require_db(state).and_then(|conn| sessions_delete(conn, &req.params)) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sessions.create" => Some(handle_sessions_create(state, req)),
        "sessions.list" => Some(handle_sessions_list(state, req)),
        "sessions.delete" => Some(handle_sessions_delete(state, req)),
        _ => None,
    }
}
