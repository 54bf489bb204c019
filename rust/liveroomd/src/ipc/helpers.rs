use crate::calc::AttendanceError;
use crate::db::{self, SessionRow};
use crate::ipc::error::err;
use crate::ipc::types::AppState;
use chrono::{DateTime, Utc};
use rusqlite::Connection;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn query(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        if self.code.starts_with("db_") {
            tracing::error!(code = self.code, message = %self.message, "request failed");
        }
        err(id, self.code, self.message, self.details)
    }
}

impl From<AttendanceError> for HandlerErr {
    fn from(e: AttendanceError) -> Self {
        Self::bad_params(e.to_string())
    }
}

pub fn require_db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_required_i64(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_ts(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<DateTime<Utc>>, HandlerErr> {
    let Some(v) = params.get(key) else {
        return Ok(None);
    };
    if v.is_null() {
        return Ok(None);
    }
    let Some(s) = v.as_str() else {
        return Err(HandlerErr::bad_params(format!("{} must be an ISO-8601 string", key)));
    };
    DateTime::parse_from_rfc3339(s.trim())
        .map(|d| Some(d.with_timezone(&Utc)))
        .map_err(|e| HandlerErr::bad_params(format!("invalid {}: {}", key, e)))
}

pub fn require_session(conn: &Connection, session_id: i64) -> Result<SessionRow, HandlerErr> {
    db::session_get(conn, session_id)
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::new("not_found", "session not found"))
}
