use crate::calc::{AttendanceInterval, ParticipantInput};
use crate::roomlog::{RoomEvent, RoomEventKind};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Transaction};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("liveroom.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            scheduled_at TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_intervals(
            id TEXT PRIMARY KEY,
            session_id INTEGER NOT NULL,
            participant_id INTEGER NOT NULL,
            display_name TEXT NOT NULL,
            join_at TEXT NOT NULL,
            leave_at TEXT,
            FOREIGN KEY(session_id) REFERENCES sessions(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_intervals_session ON attendance_intervals(session_id)",
        [],
    )?;

    // Imported participants, including those with no intervals yet.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS session_participants(
            session_id INTEGER NOT NULL,
            participant_id INTEGER NOT NULL,
            display_name TEXT NOT NULL,
            PRIMARY KEY(session_id, participant_id),
            FOREIGN KEY(session_id) REFERENCES sessions(id)
        )",
        [],
    )?;
    // Workspaces created before the roster table only have interval rows.
    conn.execute(
        "INSERT OR IGNORE INTO session_participants(session_id, participant_id, display_name)
         SELECT session_id, participant_id, display_name
         FROM attendance_intervals
         ORDER BY rowid",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS room_events(
            id TEXT PRIMARY KEY,
            session_id INTEGER NOT NULL,
            participant_id INTEGER NOT NULL,
            display_name TEXT NOT NULL,
            kind TEXT NOT NULL,
            at TEXT NOT NULL,
            text TEXT,
            FOREIGN KEY(session_id) REFERENCES sessions(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_room_events_session ON room_events(session_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    tracing::debug!("workspace schema ready");
    Ok(conn)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value_json FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRow {
    pub id: i64,
    pub title: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

fn session_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    let scheduled: Option<String> = r.get(2)?;
    let created: String = r.get(3)?;
    Ok(SessionRow {
        id: r.get(0)?,
        title: r.get(1)?,
        scheduled_at: scheduled.as_deref().map(|s| parse_ts(2, s)).transpose()?,
        created_at: parse_ts(3, &created)?,
    })
}

pub fn session_create(
    conn: &Connection,
    title: &str,
    scheduled_at: Option<DateTime<Utc>>,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO sessions(title, scheduled_at, created_at) VALUES(?, ?, ?)",
        (
            title,
            scheduled_at.as_ref().map(format_ts),
            format_ts(&Utc::now()),
        ),
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn session_get(conn: &Connection, session_id: i64) -> rusqlite::Result<Option<SessionRow>> {
    conn.query_row(
        "SELECT id, title, scheduled_at, created_at FROM sessions WHERE id = ?",
        [session_id],
        session_from_row,
    )
    .optional()
}

pub fn sessions_list(conn: &Connection) -> rusqlite::Result<Vec<SessionRow>> {
    let mut stmt = conn.prepare("SELECT id, title, scheduled_at, created_at FROM sessions ORDER BY id")?;
    stmt.query_map([], session_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
}

/// Deletes a session with its participants, intervals and events. Returns false when absent.
pub fn session_delete(conn: &Connection, session_id: i64) -> rusqlite::Result<bool> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM attendance_intervals WHERE session_id = ?", [session_id])?;
    tx.execute("DELETE FROM session_participants WHERE session_id = ?", [session_id])?;
    tx.execute("DELETE FROM room_events WHERE session_id = ?", [session_id])?;
    let removed = tx.execute("DELETE FROM sessions WHERE id = ?", [session_id])?;
    tx.commit()?;
    Ok(removed > 0)
}

/// Stores every participant, with or without intervals. Returns the number of
/// interval rows written.
pub fn intervals_insert(
    tx: &Transaction<'_>,
    session_id: i64,
    participants: &[ParticipantInput],
) -> rusqlite::Result<usize> {
    // Upsert keeps the rowid, so roster order stays first-import order.
    let mut roster = tx.prepare(
        "INSERT INTO session_participants(session_id, participant_id, display_name)
         VALUES(?, ?, ?)
         ON CONFLICT(session_id, participant_id) DO UPDATE SET
           display_name = excluded.display_name",
    )?;
    let mut stmt = tx.prepare(
        "INSERT INTO attendance_intervals(id, session_id, participant_id, display_name, join_at, leave_at)
         VALUES(?, ?, ?, ?, ?, ?)",
    )?;
    let mut inserted = 0;
    for p in participants {
        roster.execute((session_id, p.participant_id, &p.display_name))?;
        for iv in &p.intervals {
            stmt.execute((
                Uuid::new_v4().to_string(),
                session_id,
                p.participant_id,
                &p.display_name,
                format_ts(&iv.join_at()),
                iv.leave_at().as_ref().map(format_ts),
            ))?;
            inserted += 1;
        }
    }
    Ok(inserted)
}

/// Imported participants in order of first import, each with its intervals.
pub fn load_intervals(conn: &Connection, session_id: i64) -> rusqlite::Result<Vec<ParticipantInput>> {
    let mut roster = conn.prepare(
        "SELECT participant_id, display_name
         FROM session_participants
         WHERE session_id = ?
         ORDER BY rowid",
    )?;
    let mut out: Vec<ParticipantInput> = roster
        .query_map([session_id], |r| {
            Ok(ParticipantInput {
                participant_id: r.get(0)?,
                display_name: r.get(1)?,
                intervals: Vec::new(),
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    let mut index: HashMap<i64, usize> = out
        .iter()
        .enumerate()
        .map(|(i, p)| (p.participant_id, i))
        .collect();

    let mut stmt = conn.prepare(
        "SELECT participant_id, display_name, join_at, leave_at
         FROM attendance_intervals
         WHERE session_id = ?
         ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map([session_id], |r| {
            let join_raw: String = r.get(2)?;
            let leave_raw: Option<String> = r.get(3)?;
            let join_at = parse_ts(2, &join_raw)?;
            let leave_at = leave_raw.as_deref().map(|s| parse_ts(3, s)).transpose()?;
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                AttendanceInterval::new(join_at, leave_at),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    for (participant_id, display_name, iv) in rows {
        let i = *index.entry(participant_id).or_insert_with(|| {
            out.push(ParticipantInput {
                participant_id,
                display_name,
                intervals: Vec::new(),
            });
            out.len() - 1
        });
        out[i].intervals.push(iv);
    }
    Ok(out)
}

pub fn events_insert(
    tx: &Transaction<'_>,
    session_id: i64,
    events: &[RoomEvent],
) -> rusqlite::Result<usize> {
    let mut stmt = tx.prepare(
        "INSERT INTO room_events(id, session_id, participant_id, display_name, kind, at, text)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
    )?;
    for ev in events {
        stmt.execute((
            Uuid::new_v4().to_string(),
            session_id,
            ev.participant_id,
            &ev.display_name,
            ev.kind.as_str(),
            format_ts(&ev.at),
            ev.text.as_deref(),
        ))?;
    }
    Ok(events.len())
}

pub fn load_room_events(conn: &Connection, session_id: i64) -> rusqlite::Result<Vec<RoomEvent>> {
    let mut stmt = conn.prepare(
        "SELECT participant_id, display_name, kind, at, text
         FROM room_events
         WHERE session_id = ?
         ORDER BY rowid",
    )?;
    stmt.query_map([session_id], |r| {
        let kind_raw: String = r.get(2)?;
        let kind = RoomEventKind::parse(&kind_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                Type::Text,
                format!("unknown room event kind: {}", kind_raw).into(),
            )
        })?;
        let at_raw: String = r.get(3)?;
        Ok(RoomEvent {
            participant_id: r.get(0)?,
            display_name: r.get(1)?,
            kind,
            at: parse_ts(3, &at_raw)?,
            text: r.get(4)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_workspace(prefix: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ))
    }

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    #[test]
    fn intervals_round_trip_grouped_by_participant() {
        let ws = temp_workspace("liveroomd-db-intervals");
        let conn = open_db(&ws).expect("open db");
        let sid = session_create(&conn, "Biology", None).expect("create session");

        let participants = vec![
            ParticipantInput {
                participant_id: 9,
                display_name: "Ada".to_string(),
                intervals: vec![
                    AttendanceInterval::new(ts("2024-01-01T10:00:00Z"), Some(ts("2024-01-01T10:15:30.250Z"))),
                    AttendanceInterval::new(ts("2024-01-01T11:00:00Z"), None),
                ],
            },
            ParticipantInput {
                participant_id: 3,
                display_name: "Ben".to_string(),
                intervals: vec![AttendanceInterval::new(ts("2024-01-01T10:05:00Z"), None)],
            },
        ];
        let tx = conn.unchecked_transaction().expect("tx");
        assert_eq!(intervals_insert(&tx, sid, &participants).expect("insert"), 3);
        tx.commit().expect("commit");

        let loaded = load_intervals(&conn, sid).expect("load");
        assert_eq!(loaded, participants);

        assert!(session_delete(&conn, sid).expect("delete"));
        assert!(load_intervals(&conn, sid).expect("load").is_empty());
        assert!(session_get(&conn, sid).expect("get").is_none());
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn participants_without_intervals_are_kept() {
        let ws = temp_workspace("liveroomd-db-roster");
        let conn = open_db(&ws).expect("open db");
        let sid = session_create(&conn, "Geography", None).expect("create session");

        let first = vec![
            ParticipantInput {
                participant_id: 4,
                display_name: "Dee".to_string(),
                intervals: vec![],
            },
            ParticipantInput {
                participant_id: 1,
                display_name: "Ada".to_string(),
                intervals: vec![AttendanceInterval::new(ts("2024-01-01T10:00:00Z"), None)],
            },
        ];
        let tx = conn.unchecked_transaction().expect("tx");
        assert_eq!(intervals_insert(&tx, sid, &first).expect("insert"), 1);
        tx.commit().expect("commit");

        // A later import renames Dee without moving her in the roster.
        let second = vec![ParticipantInput {
            participant_id: 4,
            display_name: "Dee Dee".to_string(),
            intervals: vec![],
        }];
        let tx = conn.unchecked_transaction().expect("tx");
        intervals_insert(&tx, sid, &second).expect("insert");
        tx.commit().expect("commit");

        let loaded = load_intervals(&conn, sid).expect("load");
        let ids: Vec<i64> = loaded.iter().map(|p| p.participant_id).collect();
        assert_eq!(ids, vec![4, 1]);
        assert_eq!(loaded[0].display_name, "Dee Dee");
        assert!(loaded[0].intervals.is_empty());
        assert_eq!(loaded[1].intervals.len(), 1);

        assert!(session_delete(&conn, sid).expect("delete"));
        assert!(load_intervals(&conn, sid).expect("load").is_empty());
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn timestamps_keep_sub_millisecond_precision() {
        let ws = temp_workspace("liveroomd-db-precision");
        let conn = open_db(&ws).expect("open db");
        let sid = session_create(&conn, "Physics", None).expect("create session");

        let iv = AttendanceInterval::new(
            ts("2024-01-01T10:00:00.0009Z"),
            Some(ts("2024-01-01T10:00:00.0001Z")),
        );
        assert!(iv.is_malformed());
        let participants = vec![ParticipantInput {
            participant_id: 1,
            display_name: "Ada".to_string(),
            intervals: vec![iv],
        }];
        let tx = conn.unchecked_transaction().expect("tx");
        intervals_insert(&tx, sid, &participants).expect("insert");
        tx.commit().expect("commit");

        let loaded = load_intervals(&conn, sid).expect("load");
        assert_eq!(loaded[0].intervals, vec![iv]);
        assert!(loaded[0].intervals[0].is_malformed());
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn settings_json_upserts() {
        let ws = temp_workspace("liveroomd-db-settings");
        let conn = open_db(&ws).expect("open db");
        assert!(settings_get_json(&conn, "attendance").expect("get").is_none());
        settings_set_json(&conn, "attendance", &serde_json::json!({ "rounding": "floor" }))
            .expect("set");
        settings_set_json(&conn, "attendance", &serde_json::json!({ "rounding": "ceil" }))
            .expect("set");
        let v = settings_get_json(&conn, "attendance").expect("get").expect("value");
        assert_eq!(v["rounding"], "ceil");
        let _ = std::fs::remove_dir_all(ws);
    }
}
