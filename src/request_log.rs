//! Request log: one row per caller-facing request,
//! written once at terminal release regardless of outcome, backing the
//! admin surface's `GET /api/logs`.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::params;
use serde::Serialize;

use crate::db::Pool;

#[derive(Debug, Clone, Serialize)]
pub struct RequestLogEntry {
    pub id: i64,
    pub token_id: Option<i64>,
    pub model: String,
    pub status_code: u16,
    pub duration_ms: i64,
    pub error_kind: Option<String>,
    pub created_at: String,
}

pub struct RequestLog {
    pool: Pool,
}

impl RequestLog {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn record(&self, token_id: Option<i64>, model: &str, status_code: u16, duration_ms: i64, error_kind: Option<&str>) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO request_logs (token_id, model, status_code, duration_ms, error_kind, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![token_id, model, status_code as i64, duration_ms, error_kind, Utc::now().to_rfc3339()],
        )
        .context("inserting request log row")?;
        Ok(())
    }

    pub fn recent(&self, limit: i64) -> Result<Vec<RequestLogEntry>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, token_id, model, status_code, duration_ms, error_kind, created_at
             FROM request_logs ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(RequestLogEntry {
                    id: row.get(0)?,
                    token_id: row.get(1)?,
                    model: row.get(2)?,
                    status_code: row.get::<_, i64>(3)? as u16,
                    duration_ms: row.get(4)?,
                    error_kind: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })
            .context("loading request logs")?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn clear(&self) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute("DELETE FROM request_logs", [])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> RequestLog {
        let path = std::env::temp_dir().join(format!("sora-broker-test-{}.sqlite3", uuid::Uuid::new_v4()));
        RequestLog::new(crate::db::open(&path).unwrap())
    }

    #[test]
    fn records_and_lists_most_recent_first() {
        let log = log();
        log.record(Some(1), "sora-image", 200, 1200, None).unwrap();
        log.record(Some(1), "sora-video-landscape-10s", 504, 600_000, Some("upstream_timeout")).unwrap();

        let entries = log.recent(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].error_kind.as_deref(), Some("upstream_timeout"));
    }

    #[test]
    fn clear_removes_every_row() {
        let log = log();
        log.record(None, "sora-image", 200, 100, None).unwrap();
        log.clear().unwrap();
        assert!(log.recent(10).unwrap().is_empty());
    }
}
