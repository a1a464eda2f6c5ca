use notereact_common::{parse_id, ReactionChange};
use notereact_stream::RawEntry;

/// Producer field names.
pub const NOTE_ID: &str = "noteId";
pub const USER_ID: &str = "userId";
pub const TYPE: &str = "type";
pub const TS: &str = "ts";
pub const RETRY: &str = "retry";

/// One reaction event read from a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionEvent {
    /// Log position.
    pub id: i64,
    pub note_id: String,
    pub user_id: String,
    pub change: ReactionChange,
    /// Producer timestamp; 0 when absent or unparseable.
    pub ts: i64,
    /// Retry count carried in the payload; 0 when absent.
    pub retry_count: u32,
    pub delivery_count: u32,
}

/// Why an entry can never be applied. Such entries are acked and dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Malformed {
    #[error("missing noteId")]
    MissingNoteId,
    #[error("missing userId")]
    MissingUserId,
    #[error("{field} is not a canonical UUID: {value:?}")]
    InvalidId { field: &'static str, value: String },
    #[error(transparent)]
    UnknownKind(#[from] notereact_common::UnknownReactionKind),
}

impl ReactionEvent {
    pub fn from_entry(entry: &RawEntry) -> Result<Self, Malformed> {
        let note_id = required(entry, NOTE_ID).ok_or(Malformed::MissingNoteId)?;
        let user_id = required(entry, USER_ID).ok_or(Malformed::MissingUserId)?;
        for (field, value) in [(NOTE_ID, note_id), (USER_ID, user_id)] {
            if parse_id(field, value).is_err() {
                return Err(Malformed::InvalidId {
                    field,
                    value: value.to_string(),
                });
            }
        }
        let change = ReactionChange::from_raw(entry.field(TYPE))?;

        Ok(Self {
            id: entry.id,
            note_id: note_id.to_string(),
            user_id: user_id.to_string(),
            change,
            ts: lenient(entry.field(TS)),
            retry_count: lenient(entry.field(RETRY)),
            delivery_count: entry.delivery_count,
        })
    }

    /// Attempts made so far, counting the one in progress. The log's
    /// delivery count covers redeliveries in this group; the payload's retry
    /// field covers attempts recorded before the entry reached this log.
    pub fn attempts(&self) -> u32 {
        self.retry_count
            .max(self.delivery_count.saturating_sub(1))
            .saturating_add(1)
    }
}

fn required<'a>(entry: &'a RawEntry, name: &str) -> Option<&'a str> {
    entry.field(name).map(str::trim).filter(|v| !v.is_empty())
}

fn lenient<T: std::str::FromStr + Default>(raw: Option<&str>) -> T {
    raw.and_then(|v| v.trim().parse().ok()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use notereact_common::ReactionKind;

    use super::*;

    const NOTE: &str = "6f1c2f8e-5b0a-4d3e-9a41-0c7b8f2d9e10";
    const USER: &str = "0b9e3c4d-1a2f-4e5b-8c6d-7e8f9a0b1c2d";

    fn entry(fields: &[(&str, &str)]) -> RawEntry {
        RawEntry {
            id: 7,
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            delivery_count: 1,
        }
    }

    #[test]
    fn full_entry_normalizes() {
        let event = ReactionEvent::from_entry(&entry(&[
            (NOTE_ID, NOTE),
            (USER_ID, USER),
            (TYPE, "Love"),
            (TS, "1700000000123"),
            (RETRY, "2"),
        ]))
        .unwrap();
        assert_eq!(event.change, ReactionChange::Set(ReactionKind::Love));
        assert_eq!(event.ts, 1_700_000_000_123);
        assert_eq!(event.retry_count, 2);
        assert_eq!(event.id, 7);
    }

    #[test]
    fn absent_type_is_removal_and_bad_numbers_read_as_zero() {
        let event = ReactionEvent::from_entry(&entry(&[
            (NOTE_ID, NOTE),
            (USER_ID, USER),
            (TS, "yesterday"),
        ]))
        .unwrap();
        assert_eq!(event.change, ReactionChange::Removed);
        assert_eq!(event.ts, 0);
        assert_eq!(event.retry_count, 0);
    }

    #[test]
    fn malformed_entries_are_classified() {
        assert_eq!(
            ReactionEvent::from_entry(&entry(&[(USER_ID, USER), (TYPE, "like")])).unwrap_err(),
            Malformed::MissingNoteId
        );
        assert_eq!(
            ReactionEvent::from_entry(&entry(&[(NOTE_ID, " "), (USER_ID, USER)])).unwrap_err(),
            Malformed::MissingNoteId
        );
        assert_eq!(
            ReactionEvent::from_entry(&entry(&[(NOTE_ID, NOTE)])).unwrap_err(),
            Malformed::MissingUserId
        );
        assert!(matches!(
            ReactionEvent::from_entry(&entry(&[(NOTE_ID, "N1"), (USER_ID, USER)])).unwrap_err(),
            Malformed::InvalidId { field: NOTE_ID, .. }
        ));
        assert!(matches!(
            ReactionEvent::from_entry(&entry(&[
                (NOTE_ID, NOTE),
                (USER_ID, USER),
                (TYPE, "thumbs")
            ]))
            .unwrap_err(),
            Malformed::UnknownKind(_)
        ));
    }

    #[test]
    fn attempts_follow_redeliveries_and_payload_retries() {
        let mut event = ReactionEvent::from_entry(&entry(&[(NOTE_ID, NOTE), (USER_ID, USER)]))
            .unwrap();
        assert_eq!(event.attempts(), 1);
        event.delivery_count = 3;
        assert_eq!(event.attempts(), 3);
        event.retry_count = 4;
        assert_eq!(event.attempts(), 5);
    }
}
