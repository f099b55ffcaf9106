//! Token persistence: a thin `rusqlite`-backed CRUD layer with an in-memory
//! mirror, so the load balancer can select over the pool without hitting
//! SQLite on every request.

use std::sync::RwLock;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::db::Pool;

use super::{Token, TokenStats};

pub struct TokenStore {
    pool: Pool,
    /// In-memory mirror refreshed on every mutation; selection reads this, not
    /// SQLite directly, so the load balancer never blocks on disk I/O.
    cache: RwLock<Vec<Token>>,
}

impl TokenStore {
    pub fn new(pool: Pool) -> Result<Self> {
        let store = Self {
            pool,
            cache: RwLock::new(Vec::new()),
        };
        store.reload()?;
        Ok(store)
    }

    /// Rebuild the in-memory mirror from SQLite. Called at startup and after
    /// any mutation that changes eligibility or concurrency caps.
    pub fn reload(&self) -> Result<()> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT * FROM tokens ORDER BY id")?;
        let rows = stmt
            .query_map([], row_to_token)
            .context("loading tokens")?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        *self.cache.write().unwrap() = rows;
        Ok(())
    }

    /// Snapshot of every token, for the load balancer and the admin surface.
    pub fn all(&self) -> Vec<Token> {
        self.cache.read().unwrap().clone()
    }

    pub fn get(&self, id: i64) -> Option<Token> {
        self.cache.read().unwrap().iter().find(|t| t.id == id).cloned()
    }

    pub fn insert(&self, token: &NewToken) -> Result<i64> {
        let conn = self.pool.get()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO tokens (
                email, access_token, session_token, refresh_token, client_id, proxy_url, remark,
                is_active, created_at, use_count, image_enabled, video_enabled,
                image_concurrency, video_concurrency, sora2_supported, sora2_remaining_count
            ) VALUES (?1,?2,?3,?4,?5,?6,?7, 1, ?8, 0, 1, 1, ?9, ?10, 0, 0)",
            params![
                token.email,
                token.access_token,
                token.session_token,
                token.refresh_token,
                token.client_id,
                token.proxy_url,
                token.remark,
                now,
                token.image_concurrency.unwrap_or(1),
                token.video_concurrency.unwrap_or(3),
            ],
        )?;
        let id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO token_stats (token_id) VALUES (?1)",
            params![id],
        )?;
        drop(conn);
        self.reload()?;
        Ok(id)
    }

    pub fn delete(&self, id: i64) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute("DELETE FROM tokens WHERE id = ?1", params![id])?;
        drop(conn);
        self.reload()
    }

    pub fn set_active(&self, id: i64, active: bool) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE tokens SET is_active = ?1 WHERE id = ?2",
            params![active as i64, id],
        )?;
        drop(conn);
        self.reload()
    }

    /// Selection bookkeeping: bumps `use_count` and `last_used_at`.
    pub fn record_use(&self, id: i64) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE tokens SET use_count = use_count + 1, last_used_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;
        drop(conn);
        self.reload()
    }

    /// §5 quota accounting: bumps the token's error counter unless the error
    /// kind is exempt; past `error_ban_threshold` disables the token.
    pub fn record_error(&self, id: i64, threshold: u32) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE token_stats SET error_count = error_count + 1, error_count_today = error_count_today + 1
             WHERE token_id = ?1",
            params![id],
        )?;
        let count: i64 = conn
            .query_row(
                "SELECT error_count FROM token_stats WHERE token_id = ?1",
                params![id],
                |r| r.get(0),
            )
            .optional()?
            .unwrap_or(0);
        if count as u32 >= threshold {
            conn.execute(
                "UPDATE tokens SET is_active = 0 WHERE id = ?1",
                params![id],
            )?;
        }
        drop(conn);
        self.reload()
    }

    pub fn record_auth_failure(&self, id: i64) -> Result<()> {
        self.set_active(id, false)
    }

    pub fn set_cooldown(&self, id: i64, until: Option<DateTime<Utc>>) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE tokens SET cooled_until = ?1 WHERE id = ?2",
            params![until.map(|t| t.to_rfc3339()), id],
        )?;
        drop(conn);
        self.reload()
    }

    pub fn record_success(&self, id: i64, class: super::JobClass) -> Result<()> {
        let conn = self.pool.get()?;
        let column = match class {
            super::JobClass::Image => "image_count",
            super::JobClass::Video => "video_count",
        };
        conn.execute(
            &format!(
                "UPDATE token_stats SET {column} = {column} + 1 WHERE token_id = ?1"
            ),
            params![id],
        )?;
        Ok(())
    }

    pub fn stats(&self, id: i64) -> Result<TokenStats> {
        let conn = self.pool.get()?;
        conn.query_row(
            "SELECT token_id, image_count, video_count, error_count, error_count_today
             FROM token_stats WHERE token_id = ?1",
            params![id],
            |row| {
                Ok(TokenStats {
                    token_id: row.get(0)?,
                    image_count: row.get(1)?,
                    video_count: row.get(2)?,
                    error_count: row.get(3)?,
                    error_count_today: row.get(4)?,
                })
            },
        )
        .context("loading token stats")
    }

    /// Admin-surface field edit (spec §4.7 `PUT /api/tokens/{id}`). Every field
    /// is optional; `None` leaves the column unchanged.
    pub fn update(&self, id: i64, update: &TokenUpdate) -> Result<()> {
        let existing = self.get(id).context("token not found")?;
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE tokens SET
                remark = ?1, proxy_url = ?2, image_concurrency = ?3, video_concurrency = ?4,
                image_enabled = ?5, video_enabled = ?6
             WHERE id = ?7",
            params![
                update.remark.clone().unwrap_or(existing.remark),
                update.proxy_url.clone().unwrap_or(existing.proxy_url),
                update.image_concurrency.unwrap_or(existing.image_concurrency),
                update.video_concurrency.unwrap_or(existing.video_concurrency),
                update.image_enabled.unwrap_or(existing.image_enabled) as i64,
                update.video_enabled.unwrap_or(existing.video_enabled) as i64,
                id,
            ],
        )?;
        drop(conn);
        self.reload()
    }

    /// Refreshes subscription/Sora2 descriptors, e.g. after a `test_token` call.
    pub fn update_subscription(&self, id: i64, update: &SubscriptionUpdate) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE tokens SET
                plan_type = ?1, plan_title = ?2, subscription_end = ?3,
                sora2_supported = ?4, sora2_remaining_count = ?5, sora2_total_count = ?6,
                sora2_redeemed_count = ?7, sora2_cooldown_until = ?8
             WHERE id = ?9",
            params![
                update.plan_type,
                update.plan_title,
                update.subscription_end.map(|t| t.to_rfc3339()),
                update.sora2_supported as i64,
                update.sora2_remaining_count,
                update.sora2_total_count,
                update.sora2_redeemed_count,
                update.sora2_cooldown_until.map(|t| t.to_rfc3339()),
                id,
            ],
        )?;
        drop(conn);
        self.reload()
    }
}

pub struct NewToken {
    pub email: String,
    pub access_token: String,
    pub session_token: Option<String>,
    pub refresh_token: Option<String>,
    pub client_id: Option<String>,
    pub proxy_url: Option<String>,
    pub remark: Option<String>,
    pub image_concurrency: Option<i64>,
    pub video_concurrency: Option<i64>,
}

#[derive(Default, Debug, serde::Deserialize)]
pub struct TokenUpdate {
    pub remark: Option<Option<String>>,
    pub proxy_url: Option<Option<String>>,
    pub image_concurrency: Option<Option<i64>>,
    pub video_concurrency: Option<Option<i64>>,
    pub image_enabled: Option<bool>,
    pub video_enabled: Option<bool>,
}

#[derive(Default)]
pub struct SubscriptionUpdate {
    pub plan_type: Option<String>,
    pub plan_title: Option<String>,
    pub subscription_end: Option<DateTime<Utc>>,
    pub sora2_supported: bool,
    pub sora2_remaining_count: i64,
    pub sora2_total_count: i64,
    pub sora2_redeemed_count: i64,
    pub sora2_cooldown_until: Option<DateTime<Utc>>,
}

fn parse_dt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn row_to_token(row: &Row) -> rusqlite::Result<Token> {
    Ok(Token {
        id: row.get("id")?,
        email: row.get("email")?,
        access_token: row.get("access_token")?,
        session_token: row.get("session_token")?,
        refresh_token: row.get("refresh_token")?,
        client_id: row.get("client_id")?,
        proxy_url: row.get("proxy_url")?,
        remark: row.get("remark")?,
        is_active: row.get::<_, i64>("is_active")? != 0,
        cooled_until: parse_dt(row.get("cooled_until")?),
        created_at: parse_dt(row.get("created_at")?).unwrap_or_else(Utc::now),
        last_used_at: parse_dt(row.get("last_used_at")?),
        use_count: row.get("use_count")?,
        plan_type: row.get("plan_type")?,
        plan_title: row.get("plan_title")?,
        subscription_end: parse_dt(row.get("subscription_end")?),
        sora2_supported: row.get::<_, i64>("sora2_supported")? != 0,
        sora2_invite_code: row.get("sora2_invite_code")?,
        sora2_redeemed_count: row.get("sora2_redeemed_count")?,
        sora2_total_count: row.get("sora2_total_count")?,
        sora2_remaining_count: row.get("sora2_remaining_count")?,
        sora2_cooldown_until: parse_dt(row.get("sora2_cooldown_until")?),
        image_enabled: row.get::<_, i64>("image_enabled")? != 0,
        video_enabled: row.get::<_, i64>("video_enabled")? != 0,
        image_concurrency: row.get("image_concurrency")?,
        video_concurrency: row.get("video_concurrency")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TokenStore {
        let path = std::env::temp_dir().join(format!("sora-broker-test-{}.sqlite3", uuid::Uuid::new_v4()));
        TokenStore::new(crate::db::open(&path).unwrap()).unwrap()
    }

    fn sample() -> NewToken {
        NewToken {
            email: "a@example.com".to_string(),
            access_token: "tok".to_string(),
            session_token: None,
            refresh_token: None,
            client_id: None,
            proxy_url: None,
            remark: None,
            image_concurrency: Some(1),
            video_concurrency: Some(3),
        }
    }

    #[test]
    fn insert_then_get_round_trips_fields() {
        let store = store();
        let id = store.insert(&sample()).unwrap();
        let token = store.get(id).unwrap();
        assert_eq!(token.email, "a@example.com");
        assert!(token.is_active);
        assert_eq!(token.image_concurrency, Some(1));
    }

    #[test]
    fn update_leaves_omitted_fields_unchanged() {
        let store = store();
        let id = store.insert(&sample()).unwrap();

        store
            .update(
                id,
                &TokenUpdate {
                    remark: Some(Some("relabeled".to_string())),
                    video_concurrency: Some(Some(9)),
                    ..Default::default()
                },
            )
            .unwrap();

        let token = store.get(id).unwrap();
        assert_eq!(token.remark.as_deref(), Some("relabeled"));
        assert_eq!(token.video_concurrency, Some(9));
        // image_concurrency was not named in the update and must survive untouched.
        assert_eq!(token.image_concurrency, Some(1));
    }

    #[test]
    fn delete_removes_token_from_cache() {
        let store = store();
        let id = store.insert(&sample()).unwrap();
        store.delete(id).unwrap();
        assert!(store.get(id).is_none());
    }

    #[test]
    fn record_error_disables_token_past_threshold() {
        let store = store();
        let id = store.insert(&sample()).unwrap();
        store.record_error(id, 2).unwrap();
        assert!(store.get(id).unwrap().is_active);
        store.record_error(id, 2).unwrap();
        assert!(!store.get(id).unwrap().is_active);
    }
}
