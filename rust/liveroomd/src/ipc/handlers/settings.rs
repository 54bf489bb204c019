use crate::calc::RoundingPolicy;
use crate::db;
use crate::ipc::error::ok;
use crate::ipc::helpers::{require_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

const ATTENDANCE_KEY: &str = "settings.attendance";

fn default_attendance() -> Value {
    json!({
        "rounding": RoundingPolicy::default().as_str(),
    })
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn merge_attendance_patch(current: &mut Value, patch: &Map<String, Value>) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal settings object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match k.as_str() {
            "rounding" => {
                let raw = parse_string_max(v, k, 16)?;
                let policy = RoundingPolicy::parse(&raw)
                    .ok_or_else(|| "rounding must be one of: nearest, floor, ceil".to_string())?;
                obj.insert(k.clone(), Value::String(policy.as_str().to_string()));
            }
            _ => return Err(format!("unknown attendance field: {}", k)),
        }
    }
    Ok(())
}

fn load_attendance(conn: &Connection) -> anyhow::Result<Value> {
    let mut current = default_attendance();
    if let Some(saved) = db::settings_get_json(conn, ATTENDANCE_KEY)? {
        if let Some(saved_obj) = saved.as_object() {
            // Stale or hand-edited values fall back to defaults.
            if let Err(msg) = merge_attendance_patch(&mut current, saved_obj) {
                tracing::warn!(%msg, "ignoring saved attendance settings");
                current = default_attendance();
            }
        }
    }
    Ok(current)
}

/// Rounding policy for a workspace; the default when no workspace is open.
pub fn rounding_for(conn: Option<&Connection>) -> Result<RoundingPolicy, HandlerErr> {
    let Some(conn) = conn else {
        return Ok(RoundingPolicy::default());
    };
    let section = load_attendance(conn).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    Ok(section
        .get("rounding")
        .and_then(|v| v.as_str())
        .and_then(RoundingPolicy::parse)
        .unwrap_or_default())
}

fn handle_settings_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    match load_attendance(conn) {
        Ok(attendance) => ok(&req.id, json!({ "attendance": attendance })),
        Err(e) => HandlerErr::new("db_query_failed", e.to_string()).response(&req.id),
    }
}

fn handle_settings_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let section = req.params.get("section").and_then(|v| v.as_str()).unwrap_or("attendance");
    if section != "attendance" {
        return HandlerErr::bad_params("unknown section").response(&req.id);
    }
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return HandlerErr::bad_params("patch must be an object").response(&req.id);
    };

    let mut current = match load_attendance(conn) {
        Ok(v) => v,
        Err(e) => return HandlerErr::new("db_query_failed", e.to_string()).response(&req.id),
    };
    if let Err(msg) = merge_attendance_patch(&mut current, patch_obj) {
        return HandlerErr::bad_params(msg).response(&req.id);
    }
    if let Err(e) = db::settings_set_json(conn, ATTENDANCE_KEY, &current) {
        return HandlerErr::new("db_update_failed", e.to_string()).response(&req.id);
    }
    tracing::info!(settings = %current, "attendance settings updated");
    ok(&req.id, json!({ "attendance": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "settings.get" => Some(handle_settings_get(state, req)),
        "settings.update" => Some(handle_settings_update(state, req)),
        _ => None,
    }
}
