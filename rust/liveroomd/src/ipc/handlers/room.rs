use crate::calc;
use crate::db;
use crate::ipc::error::ok;
use crate::ipc::handlers::attendance::load_session_participants;
use crate::ipc::handlers::settings::rounding_for;
use crate::ipc::helpers::{get_optional_ts, get_required_i64, require_db, require_session, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::roomlog::{self, RoomEvent};
use chrono::Utc;
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::json;

fn parse_events(raw: Option<&serde_json::Value>) -> Result<Vec<RoomEvent>, HandlerErr> {
    let Some(items) = raw.and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("events must be an array"));
    };
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            RoomEvent::deserialize(item)
                .map_err(|e| HandlerErr::bad_params(format!("invalid events[{}]: {}", i, e)))
        })
        .collect()
}

fn room_events_append(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_i64(params, "sessionId")?;
    require_session(conn, session_id)?;
    let events = parse_events(params.get("events"))?;

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let appended = db::events_insert(&tx, session_id, &events).map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "room_events" })),
    })?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    tracing::debug!(session_id, appended, "room events appended");
    Ok(json!({ "appended": appended }))
}

fn room_activity(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_i64(params, "sessionId")?;
    require_session(conn, session_id)?;
    let events = db::load_room_events(conn, session_id).map_err(HandlerErr::query)?;
    let folded = roomlog::fold_room_events(&events);
    Ok(json!({
        "sessionId": session_id,
        "participants": folded.activity,
        "orphanLeaves": folded.orphan_leaves
    }))
}

fn room_overview(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_i64(params, "sessionId")?;
    let session = require_session(conn, session_id)?;
    let as_of = get_optional_ts(params, "asOf")?.unwrap_or_else(Utc::now);
    let rounding = rounding_for(Some(conn))?;

    let participants = load_session_participants(conn, session_id)?;
    let stat = calc::compute_session_statistic(session.id, &session.title, &participants, rounding);
    Ok(json!(calc::summarize_room(&stat, as_of)))
}

fn handle_room_events_append(state: &mut AppState, req: &Request) -> serde_json::Value {
    match require_db(state).and_then(|conn| room_events_append(conn, &req.params)) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_room_activity(state: &mut AppState, req: &Request) -> serde_json::Value {
    match require_db(state).and_then(|conn| room_activity(conn, &req.params)) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_room_overview(state: &mut AppState, req: &Request) -> serde_json::Value {
    match require_db(state).and_then(|conn| room_overview(conn, &req.params)) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "room.events.append" => Some(handle_room_events_append(state, req)),
        "room.activity" => Some(handle_room_activity(state, req)),
        "room.overview" => Some(handle_room_overview(state, req)),
        _ => None,
    }
}
