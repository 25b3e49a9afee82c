//! Queue repository: the `queue_messages` table.
//!
//! Times are epoch milliseconds supplied by the caller, so visibility
//! arithmetic stays in one place ([`crate::queue::SqliteWorkQueue`]).

use chrono::Utc;
use rusqlite::params;

use super::job_repo::format_timestamp;
use super::{Database, DatabaseError};

/// A message leased to a consumer.
#[derive(Debug, Clone)]
pub struct LeasedRow {
    pub message_id: String,
    pub body: String,
    pub receipt_handle: String,
    pub receive_count: u32,
}

/// A message to append.
#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub message_id: &'a str,
    pub body: &'a str,
    pub group_id: Option<&'a str>,
    pub dedup_id: Option<&'a str>,
}

/// Appends a message, visible immediately. Returns false when a live
/// message with the same dedup id already exists.
pub fn enqueue(
    db: &Database,
    queue_name: &str,
    message: &NewMessage<'_>,
    now_ms: i64,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO queue_messages (queue_name, message_id, group_id, dedup_id,
             body, visible_at, sent_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                queue_name,
                message.message_id,
                message.group_id,
                message.dedup_id,
                message.body,
                now_ms,
                format_timestamp(&Utc::now()),
            ],
        )?;
        Ok(inserted == 1)
    })
}

/// Leases up to `max` visible messages in send order, hiding each until
/// `now_ms + visibility_ms` under a fresh receipt handle.
pub fn lease(
    db: &Database,
    queue_name: &str,
    max: usize,
    now_ms: i64,
    visibility_ms: i64,
) -> Result<Vec<LeasedRow>, DatabaseError> {
    db.with_tx(|tx| {
        let candidates = {
            let mut stmt = tx.prepare(
                "SELECT seq, message_id, body, receive_count FROM queue_messages
                 WHERE queue_name = ?1 AND visible_at <= ?2
                 ORDER BY seq LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(params![queue_name, now_ms, max as i64], |r| {
                    Ok((
                        r.get::<_, i64>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, u32>(3)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut leased = Vec::with_capacity(candidates.len());
        for (seq, message_id, body, receive_count) in candidates {
            let receipt_handle = uuid::Uuid::new_v4().to_string();
            tx.execute(
                "UPDATE queue_messages SET receipt_handle = ?2, receive_count = receive_count + 1,
                 visible_at = ?3
                 WHERE seq = ?1",
                params![seq, receipt_handle, now_ms + visibility_ms],
            )?;
            leased.push(LeasedRow {
                message_id,
                body,
                receipt_handle,
                receive_count: receive_count + 1,
            });
        }
        Ok(leased)
    })
}

/// Moves the visibility deadline of the message currently leased under
/// `receipt_handle`. Returns false if the handle is stale.
pub fn set_visible_at(
    db: &Database,
    queue_name: &str,
    receipt_handle: &str,
    visible_at_ms: i64,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE queue_messages SET visible_at = ?3
             WHERE queue_name = ?1 AND receipt_handle = ?2",
            params![queue_name, receipt_handle, visible_at_ms],
        )?;
        Ok(changed == 1)
    })
}

/// Acknowledges a leased message. Returns false if the handle is stale.
pub fn delete(db: &Database, queue_name: &str, receipt_handle: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "DELETE FROM queue_messages WHERE queue_name = ?1 AND receipt_handle = ?2",
            params![queue_name, receipt_handle],
        )?;
        Ok(changed == 1)
    })
}

/// Number of undeleted messages, leased or not.
pub fn depth(db: &Database, queue_name: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM queue_messages WHERE queue_name = ?1",
            params![queue_name],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message<'a>(id: &'a str, dedup: Option<&'a str>) -> NewMessage<'a> {
        NewMessage {
            message_id: id,
            body: "{}",
            group_id: Some("g"),
            dedup_id: dedup,
        }
    }

    #[test]
    fn test_enqueue_dedups_live_messages() {
        let db = Database::open_in_memory().unwrap();
        assert!(enqueue(&db, "q", &message("m1", Some("j:a")), 0).unwrap());
        assert!(!enqueue(&db, "q", &message("m2", Some("j:a")), 0).unwrap());
        // Same dedup id on another queue is independent.
        assert!(enqueue(&db, "other", &message("m3", Some("j:a")), 0).unwrap());
        assert_eq!(depth(&db, "q").unwrap(), 1);
    }

    #[test]
    fn test_lease_hides_until_visibility_expires() {
        let db = Database::open_in_memory().unwrap();
        enqueue(&db, "q", &message("m1", None), 0).unwrap();

        let first = lease(&db, "q", 10, 1_000, 500).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].receive_count, 1);

        assert!(lease(&db, "q", 10, 1_400, 500).unwrap().is_empty());

        let second = lease(&db, "q", 10, 1_500, 500).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].receive_count, 2);
        assert_ne!(second[0].receipt_handle, first[0].receipt_handle);

        assert!(!delete(&db, "q", &first[0].receipt_handle).unwrap());
        assert!(delete(&db, "q", &second[0].receipt_handle).unwrap());
        assert_eq!(depth(&db, "q").unwrap(), 0);
    }

    #[test]
    fn test_lease_respects_max_and_order() {
        let db = Database::open_in_memory().unwrap();
        for id in ["m1", "m2", "m3"] {
            enqueue(&db, "q", &message(id, None), 0).unwrap();
        }
        let leased = lease(&db, "q", 2, 0, 1_000).unwrap();
        let ids: Vec<_> = leased.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
    }

    #[test]
    fn test_set_visible_at_extends_lease() {
        let db = Database::open_in_memory().unwrap();
        enqueue(&db, "q", &message("m1", None), 0).unwrap();
        let leased = lease(&db, "q", 1, 0, 100).unwrap();

        assert!(set_visible_at(&db, "q", &leased[0].receipt_handle, 10_000).unwrap());
        assert!(lease(&db, "q", 1, 5_000, 100).unwrap().is_empty());
        assert!(!set_visible_at(&db, "q", "bogus", 10_000).unwrap());
    }
}
