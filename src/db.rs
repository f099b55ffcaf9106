//! SQLite-backed persistence: connection pool + schema.
//!
//! One `rusqlite` + `r2d2` + `r2d2_sqlite` pool backs the token table, the
//! task table, the admin config row, and the request log.

use anyhow::{Context, Result};
use r2d2_sqlite::SqliteConnectionManager;

pub type Pool = r2d2::Pool<SqliteConnectionManager>;
pub type Conn = r2d2::PooledConnection<SqliteConnectionManager>;

pub fn open(path: &std::path::Path) -> Result<Pool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display()))?;
    }
    let manager = SqliteConnectionManager::file(path).with_init(|conn| {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
    });
    let pool = r2d2::Pool::builder()
        .max_size(8)
        .build(manager)
        .with_context(|| format!("opening database pool at {}", path.display()))?;

    migrate(&pool.get()?)?;
    Ok(pool)
}

fn migrate(conn: &Conn) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS tokens (
            id                      INTEGER PRIMARY KEY AUTOINCREMENT,
            email                   TEXT NOT NULL UNIQUE,
            access_token            TEXT NOT NULL,
            session_token           TEXT,
            refresh_token           TEXT,
            client_id               TEXT,
            proxy_url               TEXT,
            remark                  TEXT,
            is_active               INTEGER NOT NULL DEFAULT 1,
            cooled_until            TEXT,
            created_at              TEXT NOT NULL,
            last_used_at            TEXT,
            use_count               INTEGER NOT NULL DEFAULT 0,
            plan_type               TEXT,
            plan_title              TEXT,
            subscription_end        TEXT,
            sora2_supported         INTEGER NOT NULL DEFAULT 0,
            sora2_invite_code       TEXT,
            sora2_redeemed_count    INTEGER NOT NULL DEFAULT 0,
            sora2_total_count       INTEGER NOT NULL DEFAULT 0,
            sora2_remaining_count   INTEGER NOT NULL DEFAULT 0,
            sora2_cooldown_until    TEXT,
            image_enabled           INTEGER NOT NULL DEFAULT 1,
            video_enabled           INTEGER NOT NULL DEFAULT 1,
            image_concurrency       INTEGER NOT NULL DEFAULT 1,
            video_concurrency       INTEGER NOT NULL DEFAULT 3
        );

        CREATE TABLE IF NOT EXISTS token_stats (
            token_id            INTEGER PRIMARY KEY REFERENCES tokens(id) ON DELETE CASCADE,
            image_count         INTEGER NOT NULL DEFAULT 0,
            video_count         INTEGER NOT NULL DEFAULT 0,
            error_count         INTEGER NOT NULL DEFAULT 0,
            error_count_today   INTEGER NOT NULL DEFAULT 0,
            stats_day           TEXT
        );

        CREATE TABLE IF NOT EXISTS tasks (
            task_id         TEXT PRIMARY KEY,
            token_id        INTEGER NOT NULL REFERENCES tokens(id),
            model           TEXT NOT NULL,
            prompt          TEXT NOT NULL,
            status          TEXT NOT NULL,
            progress        INTEGER NOT NULL DEFAULT 0,
            result_urls     TEXT,
            error_message   TEXT,
            cancelled       INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS tasks_task_id ON tasks(task_id);

        CREATE TABLE IF NOT EXISTS request_logs (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            token_id        INTEGER,
            model           TEXT NOT NULL,
            status_code     INTEGER NOT NULL,
            duration_ms     INTEGER NOT NULL,
            error_kind      TEXT,
            created_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS request_logs_created_at ON request_logs(created_at DESC);

        CREATE TABLE IF NOT EXISTS admin_config (
            id                              INTEGER PRIMARY KEY CHECK (id = 1),
            error_ban_threshold             INTEGER NOT NULL,
            task_retry_enabled              INTEGER NOT NULL,
            task_max_retries                INTEGER NOT NULL,
            auto_disable_on_401             INTEGER NOT NULL,
            image_timeout_secs              INTEGER NOT NULL,
            video_timeout_secs              INTEGER NOT NULL,
            poll_interval_ms                INTEGER NOT NULL,
            at_auto_refresh_enabled         INTEGER NOT NULL,
            cache_enabled                   INTEGER NOT NULL,
            cache_timeout_secs              INTEGER NOT NULL,
            cache_base_url                  TEXT NOT NULL,
            proxy_url                       TEXT,
            pow_proxy_url                   TEXT,
            pow_proxy_enabled               INTEGER NOT NULL,
            watermark_free_enabled          INTEGER NOT NULL,
            watermark_free_host             TEXT NOT NULL,
            watermark_free_parser_url       TEXT,
            watermark_free_fallback_enabled INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}
