use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::db::DbPool;
use crate::error::Result;
use crate::timefmt;

/// A persisted event. `seq` is assigned by the database and is strictly
/// monotonic across all publishers; purges never reuse values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub source_id: Option<String>,
    pub created_at: String,
}

/// Durable event store backed by the `events` table. The autoincrement
/// column is the single authoritative sequence counter for the process.
#[derive(Clone)]
pub struct EventLog {
    pool: DbPool,
}

impl EventLog {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Append an event and return its assigned sequence number.
    pub fn append(
        &self,
        event_type: &str,
        payload: &serde_json::Value,
        source_id: Option<&str>,
    ) -> Result<Event> {
        let conn = self.pool.get()?;
        let created_at = timefmt::now_iso();
        conn.execute(
            "INSERT INTO events (event_type, payload, source_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![event_type, payload.to_string(), source_id, created_at],
        )?;
        let seq = conn.last_insert_rowid();
        Ok(Event {
            seq,
            event_type: event_type.to_string(),
            payload: payload.clone(),
            source_id: source_id.map(str::to_string),
            created_at,
        })
    }

    /// Events with seq strictly greater than `since_seq`, in seq order.
    /// Used by reconnecting clients to replay missed events.
    pub fn replay(&self, since_seq: i64) -> Result<Vec<Event>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT seq, event_type, payload, source_id, created_at
             FROM events WHERE seq > ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([since_seq], |row| {
            let payload_raw: String = row.get(2)?;
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                payload_raw,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (seq, event_type, payload_raw, source_id, created_at) = row?;
            events.push(Event {
                seq,
                event_type,
                payload: serde_json::from_str(&payload_raw).unwrap_or(serde_json::Value::Null),
                source_id,
                created_at,
            });
        }
        Ok(events)
    }

    pub fn last_seq(&self) -> Result<i64> {
        let conn = self.pool.get()?;
        let seq: Option<i64> = conn.query_row("SELECT MAX(seq) FROM events", [], |row| row.get(0))?;
        Ok(seq.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn test_append_assigns_monotonic_seq() {
        let log = EventLog::new(db::init_test_db());

        let first = log
            .append("device.new", &serde_json::json!({"id": 1}), Some("1"))
            .unwrap();
        let second = log
            .append("device.updated", &serde_json::json!({"id": 1}), None)
            .unwrap();

        assert!(second.seq > first.seq);
        assert_eq!(log.last_seq().unwrap(), second.seq);
    }

    #[test]
    fn test_replay_returns_only_newer() {
        let log = EventLog::new(db::init_test_db());

        let first = log.append("a", &serde_json::json!({}), None).unwrap();
        let second = log.append("b", &serde_json::json!({}), None).unwrap();
        let third = log.append("c", &serde_json::json!({}), None).unwrap();

        let replayed = log.replay(first.seq).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].seq, second.seq);
        assert_eq!(replayed[1].seq, third.seq);

        assert!(log.replay(third.seq).unwrap().is_empty());
    }

    #[test]
    fn test_seq_not_reused_after_delete() {
        let pool = db::init_test_db();
        let log = EventLog::new(pool.clone());

        let purged = log.append("old", &serde_json::json!({}), None).unwrap();
        {
            let conn = pool.get().unwrap();
            conn.execute("DELETE FROM events", []).unwrap();
        }
        let fresh = log.append("new", &serde_json::json!({}), None).unwrap();
        assert!(fresh.seq > purged.seq);
    }
}
