use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use sync_api::{MessageId, VoteCounts, VoteKind, VoteOutcome};

/// Toggle a vote against the current one, adjusting the counters.
/// At most one active vote per (user, message):
/// same kind again removes it, a different kind swaps it.
pub fn apply_vote(
    counts: &mut VoteCounts,
    kind: VoteKind,
    current: Option<VoteKind>,
) -> VoteOutcome {
    match current {
        Some(prev) if prev == kind => {
            decrement(counts, kind);
            VoteOutcome {
                removed: true,
                new_vote: None,
            }
        }
        Some(prev) => {
            decrement(counts, prev);
            increment(counts, kind);
            VoteOutcome {
                removed: false,
                new_vote: Some(kind),
            }
        }
        None => {
            increment(counts, kind);
            VoteOutcome {
                removed: false,
                new_vote: Some(kind),
            }
        }
    }
}

fn counter(counts: &mut VoteCounts, kind: VoteKind) -> &mut u32 {
    match kind {
        VoteKind::Like => &mut counts.likes,
        VoteKind::Dislike => &mut counts.dislikes,
    }
}

fn increment(counts: &mut VoteCounts, kind: VoteKind) {
    *counter(counts, kind) += 1;
}

fn decrement(counts: &mut VoteCounts, kind: VoteKind) {
    let c = counter(counts, kind);
    *c = c.saturating_sub(1);
}

fn kind_str(kind: VoteKind) -> &'static str {
    match kind {
        VoteKind::Like => "like",
        VoteKind::Dislike => "dislike",
    }
}

fn parse_kind(s: &str) -> Option<VoteKind> {
    match s {
        "like" => Some(VoteKind::Like),
        "dislike" => Some(VoteKind::Dislike),
        _ => None,
    }
}

/// Current vote of the local user on a message, if any.
pub fn get_vote(
    conn: &Connection,
    room_code: &str,
    message_id: MessageId,
) -> Result<Option<VoteKind>> {
    let mut stmt =
        conn.prepare("SELECT vote FROM user_votes WHERE room_code = ?1 AND message_id = ?2")?;
    let vote: Option<String> = stmt
        .query_row(params![room_code, message_id], |row| row.get(0))
        .optional()?;
    Ok(vote.as_deref().and_then(parse_kind))
}

/// Record or remove the local user's vote on a message.
pub fn set_vote(
    conn: &Connection,
    room_code: &str,
    message_id: MessageId,
    vote: Option<VoteKind>,
) -> Result<()> {
    match vote {
        Some(kind) => {
            conn.execute(
                "INSERT INTO user_votes (room_code, message_id, vote) VALUES (?1, ?2, ?3)
                 ON CONFLICT(room_code, message_id) DO UPDATE SET vote = ?3",
                params![room_code, message_id, kind_str(kind)],
            )?;
        }
        None => {
            conn.execute(
                "DELETE FROM user_votes WHERE room_code = ?1 AND message_id = ?2",
                params![room_code, message_id],
            )?;
        }
    }
    Ok(())
}

/// Drop every stored vote ("clear data").
pub fn clear_votes(conn: &Connection) -> Result<()> {
    conn.execute("DELETE FROM user_votes", [])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn toggle_matrix() {
        let mut counts = VoteCounts::default();

        // no vote -> like
        let out = apply_vote(&mut counts, VoteKind::Like, None);
        assert_eq!(out.new_vote, Some(VoteKind::Like));
        assert!(!out.removed);
        assert_eq!(counts.likes, 1);

        // like again -> removed, net zero
        let out = apply_vote(&mut counts, VoteKind::Like, Some(VoteKind::Like));
        assert!(out.removed);
        assert_eq!(out.new_vote, None);
        assert_eq!(counts.likes, 0);

        // like, then switch to dislike
        apply_vote(&mut counts, VoteKind::Like, None);
        let out = apply_vote(&mut counts, VoteKind::Dislike, Some(VoteKind::Like));
        assert_eq!(out.new_vote, Some(VoteKind::Dislike));
        assert_eq!(counts.likes, 0);
        assert_eq!(counts.dislikes, 1);
    }

    #[test]
    fn decrement_never_underflows() {
        let mut counts = VoteCounts::default();
        let out = apply_vote(&mut counts, VoteKind::Like, Some(VoteKind::Like));
        assert!(out.removed);
        assert_eq!(counts.likes, 0);
    }

    #[test]
    fn vote_records_roundtrip() {
        let conn = db::init_db(":memory:").unwrap();
        assert_eq!(get_vote(&conn, "ROOMAB12", 1).unwrap(), None);
        set_vote(&conn, "ROOMAB12", 1, Some(VoteKind::Like)).unwrap();
        assert_eq!(get_vote(&conn, "ROOMAB12", 1).unwrap(), Some(VoteKind::Like));
        set_vote(&conn, "ROOMAB12", 1, Some(VoteKind::Dislike)).unwrap();
        assert_eq!(
            get_vote(&conn, "ROOMAB12", 1).unwrap(),
            Some(VoteKind::Dislike)
        );
        set_vote(&conn, "ROOMAB12", 1, None).unwrap();
        assert_eq!(get_vote(&conn, "ROOMAB12", 1).unwrap(), None);
        set_vote(&conn, "ROOMAB12", 2, Some(VoteKind::Like)).unwrap();
        clear_votes(&conn).unwrap();
        assert_eq!(get_vote(&conn, "ROOMAB12", 2).unwrap(), None);
    }
}
