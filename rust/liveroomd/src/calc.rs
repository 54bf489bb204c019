use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a closed interval's duration becomes whole minutes.
///
/// The same rounded value is shown per interval and summed into the total, so
/// `totalMinutes` always equals the sum of the displayed interval minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoundingPolicy {
    #[default]
    Nearest,
    Floor,
    Ceil,
}

impl RoundingPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nearest" => Some(Self::Nearest),
            "floor" => Some(Self::Floor),
            "ceil" => Some(Self::Ceil),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nearest => "nearest",
            Self::Floor => "floor",
            Self::Ceil => "ceil",
        }
    }

    /// Whole minutes for a span. Negative spans are clamped to zero.
    pub fn minutes(self, span: Duration) -> i64 {
        let ms = span.num_milliseconds().max(0);
        match self {
            // Half-up: 29m30s -> 30.
            Self::Nearest => (ms + 30_000) / 60_000,
            Self::Floor => ms / 60_000,
            Self::Ceil => (ms + 59_999) / 60_000,
        }
    }
}

/// One contiguous join-to-leave period of a participant in a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "RawInterval")]
pub enum AttendanceInterval {
    /// No leave was recorded: still connected, or dropped without a leave event.
    Open { join_at: DateTime<Utc> },
    Closed {
        join_at: DateTime<Utc>,
        leave_at: DateTime<Utc>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInterval {
    join_at: DateTime<Utc>,
    #[serde(default)]
    leave_at: Option<DateTime<Utc>>,
}

impl From<RawInterval> for AttendanceInterval {
    fn from(raw: RawInterval) -> Self {
        AttendanceInterval::new(raw.join_at, raw.leave_at)
    }
}

impl AttendanceInterval {
    pub fn new(join_at: DateTime<Utc>, leave_at: Option<DateTime<Utc>>) -> Self {
        match leave_at {
            Some(leave_at) => Self::Closed { join_at, leave_at },
            None => Self::Open { join_at },
        }
    }

    pub fn join_at(&self) -> DateTime<Utc> {
        match *self {
            Self::Open { join_at } | Self::Closed { join_at, .. } => join_at,
        }
    }

    pub fn leave_at(&self) -> Option<DateTime<Utc>> {
        match *self {
            Self::Open { .. } => None,
            Self::Closed { leave_at, .. } => Some(leave_at),
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(*self, Self::Closed { join_at, leave_at } if leave_at < join_at)
    }

    fn to_detail(self, rounding: RoundingPolicy) -> AttendanceDetail {
        match self {
            Self::Open { join_at } => AttendanceDetail::Open { join_at },
            Self::Closed { join_at, leave_at } if self.is_malformed() => {
                tracing::debug!(%join_at, %leave_at, "leave precedes join; counting 0 minutes");
                AttendanceDetail::Malformed {
                    join_at,
                    leave_at,
                    minutes: 0,
                }
            }
            Self::Closed { join_at, leave_at } => AttendanceDetail::Closed {
                join_at,
                leave_at,
                minutes: rounding.minutes(leave_at - join_at),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInput {
    pub participant_id: i64,
    pub display_name: String,
    #[serde(default)]
    pub intervals: Vec<AttendanceInterval>,
}

/// An interval as shown in a participant's breakdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum AttendanceDetail {
    Closed {
        #[serde(rename = "joinAt")]
        join_at: DateTime<Utc>,
        #[serde(rename = "leaveAt")]
        leave_at: DateTime<Utc>,
        minutes: i64,
    },
    Open {
        #[serde(rename = "joinAt")]
        join_at: DateTime<Utc>,
    },
    Malformed {
        #[serde(rename = "joinAt")]
        join_at: DateTime<Utc>,
        #[serde(rename = "leaveAt")]
        leave_at: DateTime<Utc>,
        minutes: i64,
    },
}

impl AttendanceDetail {
    pub fn join_at(&self) -> DateTime<Utc> {
        match *self {
            Self::Closed { join_at, .. } | Self::Open { join_at } | Self::Malformed { join_at, .. } => {
                join_at
            }
        }
    }

    /// Minutes counted toward the total; `None` for open intervals.
    pub fn minutes(&self) -> Option<i64> {
        match *self {
            Self::Closed { minutes, .. } | Self::Malformed { minutes, .. } => Some(minutes),
            Self::Open { .. } => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantAttendanceSummary {
    pub participant_id: i64,
    pub display_name: String,
    pub total_minutes: i64,
    pub attendance_details: Vec<AttendanceDetail>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAttendanceStatistic {
    pub session_id: i64,
    pub session_title: String,
    pub attendances: Vec<ParticipantAttendanceSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomOverview {
    pub participant_count: usize,
    pub connected_count: usize,
    pub total_minutes: i64,
    pub peak_concurrent: usize,
    pub peak_at: Option<DateTime<Utc>>,
    pub as_of: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AttendanceError {
    #[error("missing {0}")]
    Missing(&'static str),
    #[error("{0} must be an array")]
    NotAnArray(&'static str),
    #[error("invalid {field}: {source}")]
    InvalidInput {
        field: String,
        source: serde_json::Error,
    },
}

/// Parses `participants` from request params. Entries are validated one by one
/// so the error names the offending index.
pub fn parse_participants(
    raw: Option<&serde_json::Value>,
) -> Result<Vec<ParticipantInput>, AttendanceError> {
    let Some(raw) = raw else {
        return Err(AttendanceError::Missing("participants"));
    };
    let Some(items) = raw.as_array() else {
        return Err(AttendanceError::NotAnArray("participants"));
    };
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            ParticipantInput::deserialize(item).map_err(|source| AttendanceError::InvalidInput {
                field: format!("participants[{}]", i),
                source,
            })
        })
        .collect()
}

pub fn compute_participant_summary(
    participant_id: i64,
    display_name: &str,
    intervals: &[AttendanceInterval],
    rounding: RoundingPolicy,
) -> ParticipantAttendanceSummary {
    let mut sorted = intervals.to_vec();
    // Stable: equal joins keep their input order.
    sorted.sort_by_key(|iv| iv.join_at());

    let attendance_details: Vec<AttendanceDetail> =
        sorted.into_iter().map(|iv| iv.to_detail(rounding)).collect();
    let total_minutes = attendance_details
        .iter()
        .filter_map(|d| d.minutes())
        .sum();

    ParticipantAttendanceSummary {
        participant_id,
        display_name: display_name.to_string(),
        total_minutes,
        attendance_details,
    }
}

pub fn compute_session_statistic(
    session_id: i64,
    session_title: &str,
    participants: &[ParticipantInput],
    rounding: RoundingPolicy,
) -> SessionAttendanceStatistic {
    let attendances = participants
        .iter()
        .map(|p| {
            compute_participant_summary(p.participant_id, &p.display_name, &p.intervals, rounding)
        })
        .collect();
    SessionAttendanceStatistic {
        session_id,
        session_title: session_title.to_string(),
        attendances,
    }
}

/// Room-level figures for a computed statistic.
///
/// Intervals are half-open: closed ones cover `[joinAt, leaveAt)`. An open
/// interval runs to the participant's next join, or to `as_of` when it is the
/// latest one, so a rejoin ends a stale open interval. A participant counts as
/// connected only when their latest interval is open. Malformed and empty spans
/// never count toward concurrency, and a participant holding overlapping
/// intervals counts once.
pub fn summarize_room(stat: &SessionAttendanceStatistic, as_of: DateTime<Utc>) -> RoomOverview {
    let mut edges: Vec<(DateTime<Utc>, i8, usize)> = Vec::new();
    let mut connected_count = 0;
    let mut total_minutes = 0;

    for (idx, p) in stat.attendances.iter().enumerate() {
        total_minutes += p.total_minutes;
        let details = &p.attendance_details;
        if details.last().is_some_and(|d| d.is_open()) {
            connected_count += 1;
        }
        // Details are sorted by join.
        for (i, d) in details.iter().enumerate() {
            let start = d.join_at();
            let end = match *d {
                AttendanceDetail::Closed { leave_at, .. } => leave_at,
                AttendanceDetail::Open { .. } => details
                    .get(i + 1)
                    .map(|next| next.join_at().min(as_of))
                    .unwrap_or(as_of),
                AttendanceDetail::Malformed { .. } => continue,
            };
            if end > start {
                edges.push((start, 1, idx));
                edges.push((end, -1, idx));
            }
        }
    }

    // Leaves sort before joins at the same instant.
    edges.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut depth = vec![0usize; stat.attendances.len()];
    let mut active = 0usize;
    let mut peak_concurrent = 0usize;
    let mut peak_at = None;
    for (at, delta, idx) in edges {
        if delta > 0 {
            depth[idx] += 1;
            if depth[idx] == 1 {
                active += 1;
                if active > peak_concurrent {
                    peak_concurrent = active;
                    peak_at = Some(at);
                }
            }
        } else {
            depth[idx] -= 1;
            if depth[idx] == 0 {
                active -= 1;
            }
        }
    }

    RoomOverview {
        participant_count: stat.attendances.len(),
        connected_count,
        total_minutes,
        peak_concurrent,
        peak_at,
        as_of,
    }
}
