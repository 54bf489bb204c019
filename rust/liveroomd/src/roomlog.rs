//! Folding live-room events into attendance intervals and activity counters.

use crate::calc::{AttendanceInterval, ParticipantInput};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoomEventKind {
    Join,
    Leave,
    RaiseHand,
    LowerHand,
    Message,
}

impl RoomEventKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "join" => Some(Self::Join),
            "leave" => Some(Self::Leave),
            "raiseHand" => Some(Self::RaiseHand),
            "lowerHand" => Some(Self::LowerHand),
            "message" => Some(Self::Message),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Leave => "leave",
            Self::RaiseHand => "raiseHand",
            Self::LowerHand => "lowerHand",
            Self::Message => "message",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomEvent {
    pub participant_id: i64,
    pub display_name: String,
    pub kind: RoomEventKind,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantActivity {
    pub participant_id: i64,
    pub display_name: String,
    pub join_count: usize,
    pub raise_hand_count: usize,
    pub message_count: usize,
    pub hand_raised: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FoldedRoom {
    pub participants: Vec<ParticipantInput>,
    pub activity: Vec<ParticipantActivity>,
    pub orphan_leaves: usize,
}

#[derive(Default)]
struct Track {
    intervals: Vec<AttendanceInterval>,
    // Indexes into `intervals`, most recent last.
    open: Vec<usize>,
}

/// Replays events in time order. Participants come out in order of their first
/// event, carrying the latest display name seen.
pub fn fold_room_events(events: &[RoomEvent]) -> FoldedRoom {
    let mut ordered: Vec<&RoomEvent> = events.iter().collect();
    ordered.sort_by_key(|e| e.at);

    let mut index: HashMap<i64, usize> = HashMap::new();
    let mut tracks: Vec<Track> = Vec::new();
    let mut activity: Vec<ParticipantActivity> = Vec::new();
    let mut orphan_leaves = 0usize;

    for ev in ordered {
        let slot = *index.entry(ev.participant_id).or_insert_with(|| {
            tracks.push(Track::default());
            activity.push(ParticipantActivity {
                participant_id: ev.participant_id,
                display_name: ev.display_name.clone(),
                join_count: 0,
                raise_hand_count: 0,
                message_count: 0,
                hand_raised: false,
            });
            tracks.len() - 1
        });
        let track = &mut tracks[slot];
        let act = &mut activity[slot];
        if !ev.display_name.is_empty() {
            act.display_name = ev.display_name.clone();
        }

        match ev.kind {
            RoomEventKind::Join => {
                // A rejoin without a leave leaves the earlier interval open.
                track.intervals.push(AttendanceInterval::Open { join_at: ev.at });
                track.open.push(track.intervals.len() - 1);
                act.join_count += 1;
            }
            RoomEventKind::Leave => match track.open.pop() {
                Some(i) => {
                    let join_at = track.intervals[i].join_at();
                    track.intervals[i] = AttendanceInterval::Closed {
                        join_at,
                        leave_at: ev.at,
                    };
                    act.hand_raised = false;
                }
                None => {
                    tracing::warn!(
                        participant_id = ev.participant_id,
                        at = %ev.at,
                        "leave without a matching join; ignored"
                    );
                    orphan_leaves += 1;
                }
            },
            RoomEventKind::RaiseHand => {
                if !act.hand_raised {
                    act.raise_hand_count += 1;
                }
                act.hand_raised = true;
            }
            RoomEventKind::LowerHand => {
                act.hand_raised = false;
            }
            RoomEventKind::Message => {
                act.message_count += 1;
            }
        }
    }

    let participants = tracks
        .into_iter()
        .zip(activity.iter())
        .map(|(track, act)| ParticipantInput {
            participant_id: act.participant_id,
            display_name: act.display_name.clone(),
            intervals: track.intervals,
        })
        .collect();

    FoldedRoom {
        participants,
        activity,
        orphan_leaves,
    }
}

/// Merges two participant lists, keeping first-appearance order. Intervals of a
/// participant present in both are concatenated; the later name wins when set.
pub fn merge_participants(
    first: Vec<ParticipantInput>,
    second: Vec<ParticipantInput>,
) -> Vec<ParticipantInput> {
    let mut out: Vec<ParticipantInput> = Vec::with_capacity(first.len() + second.len());
    let mut index: HashMap<i64, usize> = HashMap::new();
    for p in first.into_iter().chain(second) {
        match index.get(&p.participant_id) {
            Some(&i) => {
                let existing = &mut out[i];
                existing.intervals.extend(p.intervals);
                if !p.display_name.is_empty() {
                    existing.display_name = p.display_name;
                }
            }
            None => {
                index.insert(p.participant_id, out.len());
                out.push(p);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    fn ev(id: i64, name: &str, kind: RoomEventKind, at: &str) -> RoomEvent {
        RoomEvent {
            participant_id: id,
            display_name: name.to_string(),
            kind,
            at: ts(at),
            text: None,
        }
    }

    #[test]
    fn join_leave_pairs_become_closed_intervals() {
        let folded = fold_room_events(&[
            ev(1, "Ada", RoomEventKind::Join, "2024-01-01T10:00:00Z"),
            ev(1, "Ada", RoomEventKind::Leave, "2024-01-01T10:30:00Z"),
            ev(1, "Ada", RoomEventKind::Join, "2024-01-01T11:00:00Z"),
        ]);
        assert_eq!(folded.participants.len(), 1);
        let p = &folded.participants[0];
        assert_eq!(
            p.intervals,
            vec![
                AttendanceInterval::Closed {
                    join_at: ts("2024-01-01T10:00:00Z"),
                    leave_at: ts("2024-01-01T10:30:00Z"),
                },
                AttendanceInterval::Open {
                    join_at: ts("2024-01-01T11:00:00Z"),
                },
            ]
        );
        assert_eq!(folded.activity[0].join_count, 2);
        assert_eq!(folded.orphan_leaves, 0);
    }

    #[test]
    fn events_are_replayed_in_time_order() {
        let folded = fold_room_events(&[
            ev(1, "Ada", RoomEventKind::Leave, "2024-01-01T10:30:00Z"),
            ev(2, "Ben", RoomEventKind::Join, "2024-01-01T09:59:00Z"),
            ev(1, "Ada", RoomEventKind::Join, "2024-01-01T10:00:00Z"),
        ]);
        let ids: Vec<i64> = folded.participants.iter().map(|p| p.participant_id).collect();
        assert_eq!(ids, vec![2, 1]);
        assert!(matches!(
            folded.participants[1].intervals[0],
            AttendanceInterval::Closed { .. }
        ));
        assert_eq!(folded.orphan_leaves, 0);
    }

    #[test]
    fn orphan_leave_is_counted_and_ignored() {
        let folded = fold_room_events(&[ev(3, "Cy", RoomEventKind::Leave, "2024-01-01T10:00:00Z")]);
        assert_eq!(folded.orphan_leaves, 1);
        assert_eq!(folded.participants.len(), 1);
        assert!(folded.participants[0].intervals.is_empty());
    }

    #[test]
    fn rejoin_without_leave_keeps_earlier_interval_open() {
        let folded = fold_room_events(&[
            ev(1, "Ada", RoomEventKind::Join, "2024-01-01T10:00:00Z"),
            ev(1, "Ada", RoomEventKind::Join, "2024-01-01T10:05:00Z"),
            ev(1, "Ada", RoomEventKind::Leave, "2024-01-01T10:20:00Z"),
        ]);
        let ivs = &folded.participants[0].intervals;
        assert_eq!(ivs.len(), 2);
        assert!(matches!(ivs[0], AttendanceInterval::Open { .. }));
        assert_eq!(ivs[1].leave_at(), Some(ts("2024-01-01T10:20:00Z")));
    }

    #[test]
    fn hands_and_messages_are_counted() {
        let mut msg = ev(1, "Ada", RoomEventKind::Message, "2024-01-01T10:02:00Z");
        msg.text = Some("hello".to_string());
        let folded = fold_room_events(&[
            ev(1, "Ada", RoomEventKind::Join, "2024-01-01T10:00:00Z"),
            ev(1, "Ada", RoomEventKind::RaiseHand, "2024-01-01T10:01:00Z"),
            ev(1, "Ada", RoomEventKind::RaiseHand, "2024-01-01T10:01:30Z"),
            msg,
            ev(1, "Ada", RoomEventKind::LowerHand, "2024-01-01T10:03:00Z"),
            ev(1, "Ada Lovelace", RoomEventKind::RaiseHand, "2024-01-01T10:04:00Z"),
        ]);
        let act = &folded.activity[0];
        assert_eq!(act.raise_hand_count, 2);
        assert_eq!(act.message_count, 1);
        assert!(act.hand_raised);
        assert_eq!(act.display_name, "Ada Lovelace");
        assert_eq!(folded.participants[0].display_name, "Ada Lovelace");
    }

    #[test]
    fn merge_keeps_first_appearance_order() {
        let a = vec![ParticipantInput {
            participant_id: 2,
            display_name: "Ben".to_string(),
            intervals: vec![AttendanceInterval::Open {
                join_at: ts("2024-01-01T10:00:00Z"),
            }],
        }];
        let b = vec![
            ParticipantInput {
                participant_id: 1,
                display_name: "Ada".to_string(),
                intervals: vec![],
            },
            ParticipantInput {
                participant_id: 2,
                display_name: String::new(),
                intervals: vec![AttendanceInterval::Open {
                    join_at: ts("2024-01-01T11:00:00Z"),
                }],
            },
        ];
        let merged = merge_participants(a, b);
        let ids: Vec<i64> = merged.iter().map(|p| p.participant_id).collect();
        assert_eq!(ids, vec![2, 1]);
        assert_eq!(merged[0].intervals.len(), 2);
        assert_eq!(merged[0].display_name, "Ben");
    }

    #[test]
    fn kind_names_match_wire_format() {
        for kind in [
            RoomEventKind::Join,
            RoomEventKind::Leave,
            RoomEventKind::RaiseHand,
            RoomEventKind::LowerHand,
            RoomEventKind::Message,
        ] {
            let wire = serde_json::to_value(kind).expect("serialize");
            assert_eq!(wire.as_str(), Some(kind.as_str()));
            assert_eq!(RoomEventKind::parse(kind.as_str()), Some(kind));
        }
    }
}
