use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use courier_contracts::{DeliveryRecord, EventEnvelope, LoopDecision};
use rusqlite::{params, Connection};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit store error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("audit store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit store mutex poisoned")]
    Poisoned,
}

/// Append-only audit log with three streams: events, loop decisions, and
/// delivery attempts. Inserts are idempotent under retry; writes from
/// concurrent handlers serialize on the connection mutex.
pub struct AuditDb {
    conn: Mutex<Connection>,
}

impl AuditDb {
    pub fn open(path: &str) -> Result<Self, AuditError> {
        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;

            CREATE TABLE IF NOT EXISTS event_records (
                event_id TEXT PRIMARY KEY,
                session_key TEXT NOT NULL,
                trace_id TEXT NOT NULL,
                origin_actor_type TEXT NOT NULL,
                origin_actor_id TEXT NOT NULL,
                text TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_event_records_session
                ON event_records(session_key, created_at);

            CREATE TABLE IF NOT EXISTS loop_decisions (
                decision_id TEXT PRIMARY KEY,
                event_id TEXT NOT NULL,
                trace_id TEXT NOT NULL,
                session_key TEXT NOT NULL,
                is_error_loop INTEGER NOT NULL,
                confidence REAL NOT NULL,
                reason TEXT NOT NULL,
                action TEXT NOT NULL,
                delay_ms INTEGER NOT NULL,
                decided_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS delivery_records (
                delivery_id TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                event_id TEXT NOT NULL,
                session_key TEXT NOT NULL,
                target_agent_id TEXT NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                recorded_at INTEGER NOT NULL,
                PRIMARY KEY (delivery_id, attempt)
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, AuditError> {
        self.conn.lock().map_err(|_| AuditError::Poisoned)
    }

    pub fn record_event(&self, evt: &EventEnvelope) -> Result<(), AuditError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO event_records
                (event_id, session_key, trace_id, origin_actor_type, origin_actor_id, text, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                evt.event_id,
                evt.session_key,
                evt.trace_id,
                evt.origin_actor_type.as_str(),
                evt.origin_actor_id,
                evt.text,
                evt.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn record_decision(
        &self,
        evt: &EventEnvelope,
        decision: &LoopDecision,
        action: &str,
        delay_ms: u64,
    ) -> Result<(), AuditError> {
        let decision_id = format!("dec_{}", uuid::Uuid::new_v4().as_simple());
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO loop_decisions
                (decision_id, event_id, trace_id, session_key, is_error_loop,
                 confidence, reason, action, delay_ms, decided_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                decision_id,
                evt.event_id,
                evt.trace_id,
                evt.session_key,
                decision.is_error_loop as i64,
                decision.confidence,
                decision.reason,
                action,
                delay_ms as i64,
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn record_delivery(&self, record: &DeliveryRecord) -> Result<(), AuditError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO delivery_records
                (delivery_id, attempt, event_id, session_key, target_agent_id, status, error, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.delivery_id,
                record.attempt,
                record.event_id,
                record.session_key,
                record.target_agent_id,
                record.status.as_str(),
                record.error,
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn metrics(&self) -> Result<Value, AuditError> {
        let conn = self.lock()?;
        let events: i64 = conn.query_row("SELECT COUNT(*) FROM event_records", [], |row| {
            row.get(0)
        })?;

        let mut decisions = serde_json::Map::new();
        {
            let mut stmt =
                conn.prepare("SELECT action, COUNT(*) FROM loop_decisions GROUP BY action")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (action, count) = row?;
                decisions.insert(action, count.into());
            }
        }

        let mut deliveries = serde_json::Map::new();
        {
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM delivery_records GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (status, count) = row?;
                deliveries.insert(status, count.into());
            }
        }

        Ok(json!({
            "events": events,
            "loopDecisions": decisions,
            "deliveries": deliveries,
        }))
    }

    pub fn session_rollup(&self, limit: usize) -> Result<Vec<Value>, AuditError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT session_key, COUNT(*), MAX(created_at)
             FROM event_records
             GROUP BY session_key
             ORDER BY MAX(created_at) DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(json!({
                "sessionKey": row.get::<_, String>(0)?,
                "eventCount": row.get::<_, i64>(1)?,
                "lastCreatedAt": row.get::<_, i64>(2)?,
            }))
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn recent_decisions(&self, limit: usize) -> Result<Vec<Value>, AuditError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT decision_id, event_id, trace_id, session_key, is_error_loop,
                    confidence, reason, action, delay_ms, decided_at
             FROM loop_decisions
             ORDER BY decided_at DESC, rowid DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(json!({
                "decisionId": row.get::<_, String>(0)?,
                "eventId": row.get::<_, String>(1)?,
                "traceId": row.get::<_, String>(2)?,
                "sessionKey": row.get::<_, String>(3)?,
                "isErrorLoop": row.get::<_, i64>(4)? != 0,
                "confidence": row.get::<_, f64>(5)?,
                "reason": row.get::<_, String>(6)?,
                "action": row.get::<_, String>(7)?,
                "delayMs": row.get::<_, i64>(8)?,
                "decidedAt": row.get::<_, i64>(9)?,
            }))
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn recent_deliveries(&self, limit: usize) -> Result<Vec<Value>, AuditError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT delivery_id, attempt, event_id, session_key, target_agent_id,
                    status, error, recorded_at
             FROM delivery_records
             ORDER BY recorded_at DESC, rowid DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(json!({
                "deliveryId": row.get::<_, String>(0)?,
                "attempt": row.get::<_, i64>(1)?,
                "eventId": row.get::<_, String>(2)?,
                "sessionKey": row.get::<_, String>(3)?,
                "targetAgentId": row.get::<_, String>(4)?,
                "status": row.get::<_, String>(5)?,
                "error": row.get::<_, Option<String>>(6)?,
                "recordedAt": row.get::<_, i64>(7)?,
            }))
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}
