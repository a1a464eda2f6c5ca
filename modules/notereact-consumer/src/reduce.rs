use notereact_common::NotesMap;

use crate::event::ReactionEvent;

/// Collapse a batch into one decision per (note, user).
///
/// Events are ordered by producer timestamp; ties keep log order. The last
/// event for a user wins, removals included.
pub fn reduce(events: &[ReactionEvent]) -> NotesMap {
    let mut ordered: Vec<&ReactionEvent> = events.iter().collect();
    ordered.sort_by_key(|e| e.ts);

    let mut notes = NotesMap::new();
    for event in ordered {
        notes
            .entry(event.note_id.clone())
            .or_default()
            .insert(event.user_id.clone(), event.change);
    }
    notes
}

#[cfg(test)]
mod tests {
    use notereact_common::ReactionChange::{Removed, Set};
    use notereact_common::ReactionKind::{Haha, Like, Love};
    use notereact_common::ReactionChange;

    use super::*;

    fn event(id: i64, note: &str, user: &str, change: ReactionChange, ts: i64) -> ReactionEvent {
        ReactionEvent {
            id,
            note_id: note.to_string(),
            user_id: user.to_string(),
            change,
            ts,
            retry_count: 0,
            delivery_count: 1,
        }
    }

    #[test]
    fn latest_timestamp_wins_regardless_of_log_order() {
        let notes = reduce(&[
            event(1, "n1", "u1", Set(Like), 1),
            event(2, "n1", "u1", Set(Love), 3),
            event(3, "n1", "u1", Removed, 2),
        ]);
        assert_eq!(notes["n1"]["u1"], Set(Love));
    }

    #[test]
    fn removal_can_win() {
        let notes = reduce(&[
            event(1, "n1", "u1", Set(Haha), 10),
            event(2, "n1", "u1", Removed, 11),
        ]);
        assert_eq!(notes["n1"]["u1"], Removed);
    }

    #[test]
    fn equal_timestamps_keep_log_order() {
        let notes = reduce(&[
            event(1, "n1", "u1", Set(Like), 0),
            event(2, "n1", "u1", Set(Haha), 0),
        ]);
        assert_eq!(notes["n1"]["u1"], Set(Haha));
    }

    #[test]
    fn groups_by_note_and_user() {
        let notes = reduce(&[
            event(1, "n1", "u1", Set(Like), 5),
            event(2, "n2", "u1", Set(Love), 1),
            event(3, "n1", "u2", Removed, 2),
        ]);
        assert_eq!(notes.len(), 2);
        assert_eq!(notes["n1"].len(), 2);
        assert_eq!(notes["n2"]["u1"], Set(Love));
    }
}
