use crate::calc::{self, ParticipantInput, RoundingPolicy};
use crate::db;
use crate::ipc::error::ok;
use crate::ipc::handlers::settings::rounding_for;
use crate::ipc::helpers::{get_required_i64, get_required_str, require_db, require_session, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::roomlog;
use rusqlite::Connection;
use serde_json::json;

/// Imported intervals merged with intervals folded from live room events.
pub fn load_session_participants(
    conn: &Connection,
    session_id: i64,
) -> Result<Vec<ParticipantInput>, HandlerErr> {
    let imported = db::load_intervals(conn, session_id).map_err(HandlerErr::query)?;
    let events = db::load_room_events(conn, session_id).map_err(HandlerErr::query)?;
    let folded = roomlog::fold_room_events(&events);
    if folded.orphan_leaves > 0 {
        tracing::warn!(session_id, orphan_leaves = folded.orphan_leaves, "session has unmatched leave events");
    }
    Ok(roomlog::merge_participants(imported, folded.participants))
}

/// A `rounding` param overrides the workspace setting for one request.
fn rounding_param(
    conn: Option<&Connection>,
    params: &serde_json::Value,
) -> Result<RoundingPolicy, HandlerErr> {
    match params.get("rounding").and_then(|v| v.as_str()) {
        Some(raw) => RoundingPolicy::parse(raw)
            .ok_or_else(|| HandlerErr::bad_params("rounding must be one of: nearest, floor, ceil")),
        None => rounding_for(conn),
    }
}

fn attendance_import(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_i64(params, "sessionId")?;
    require_session(conn, session_id)?;
    let participants = calc::parse_participants(params.get("participants"))?;

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let inserted = db::intervals_insert(&tx, session_id, &participants).map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "attendance_intervals" })),
    })?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    tracing::info!(session_id, participants = participants.len(), inserted, "attendance imported");
    Ok(json!({ "participants": participants.len(), "intervals": inserted }))
}

fn attendance_participant_summary(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_i64(params, "sessionId")?;
    let participant_id = get_required_i64(params, "participantId")?;
    require_session(conn, session_id)?;
    let rounding = rounding_param(Some(conn), params)?;

    let participants = load_session_participants(conn, session_id)?;
    let Some(p) = participants.iter().find(|p| p.participant_id == participant_id) else {
        return Err(HandlerErr::new(
            "not_found",
            "participant has no attendance in this session",
        ));
    };
    let summary = calc::compute_participant_summary(p.participant_id, &p.display_name, &p.intervals, rounding);
    Ok(json!(summary))
}

fn attendance_session_statistic(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_i64(params, "sessionId")?;
    let session = require_session(conn, session_id)?;
    let rounding = rounding_param(Some(conn), params)?;

    let participants = load_session_participants(conn, session_id)?;
    let stat = calc::compute_session_statistic(session.id, &session.title, &participants, rounding);
    tracing::debug!(session_id, participants = stat.attendances.len(), "session statistic computed");
    Ok(json!(stat))
}

fn attendance_compute(
    conn: Option<&Connection>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_i64(params, "sessionId")?;
    let session_title = get_required_str(params, "sessionTitle")?;
    let participants = calc::parse_participants(params.get("participants"))?;
    let rounding = rounding_param(conn, params)?;
    Ok(json!(calc::compute_session_statistic(
        session_id,
        &session_title,
        &participants,
        rounding
    )))
}

fn handle_attendance_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    match require_db(state).and_then(|conn| attendance_import(conn, &req.params)) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_attendance_participant_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    match require_db(state).and_then(|conn| attendance_participant_summary(conn, &req.params)) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_attendance_session_statistic(state: &mut AppState, req: &Request) -> serde_json::Value {
    match require_db(state).and_then(|conn| attendance_session_statistic(conn, &req.params)) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_attendance_compute(state: &mut AppState, req: &Request) -> serde_json::Value {
    match attendance_compute(state.db.as_ref(), &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.import" => Some(handle_attendance_import(state, req)),
        "attendance.participantSummary" => Some(handle_attendance_participant_summary(state, req)),
        "attendance.sessionStatistic" => Some(handle_attendance_session_statistic(state, req)),
        "attendance.compute" => Some(handle_attendance_compute(state, req)),
        _ => None,
    }
}
