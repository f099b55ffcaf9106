//! Load balancer: pure selection over the token pool.
//!
//! `select` never mutates state and never acquires anything; it only reports
//! which token *would* be acquirable right now. The caller (generation handler)
//! performs the actual lock/slot acquisition as a separate explicit step.

use chrono::{DateTime, Utc};

use super::{ConcurrencyManager, LockTable, Token, TokenStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobClass {
    Image,
    Video,
}

/// Eligibility gates evaluated in order, cheapest first:
/// `is_active -> feature switch -> cooled_until -> (video) sora2 gates -> lock/slot availability`.
pub fn select(
    store: &TokenStore,
    locks: &LockTable,
    concurrency: &ConcurrencyManager,
    class: JobClass,
    now: DateTime<Utc>,
) -> Option<Token> {
    let mut candidates: Vec<Token> = store
        .all()
        .into_iter()
        .filter(|t| t.eligible_for(class, now))
        .filter(|t| class != JobClass::Image || !locks.is_held(t.id, now))
        .filter(|t| concurrency.has_capacity(t.id, class, t.concurrency_cap(class)))
        .collect();

    // Least-used first; tie-break oldest last_used_at; final tie-break lowest id.
    candidates.sort_by(|a, b| {
        a.use_count
            .cmp(&b.use_count)
            .then_with(|| a.last_used_at.cmp(&b.last_used_at))
            .then_with(|| a.id.cmp(&b.id))
    });

    candidates.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::tokens::store::NewToken;
    use chrono::Duration;

    fn memory_store() -> TokenStore {
        let path = std::env::temp_dir().join(format!("sora-broker-test-{}.sqlite3", uuid::Uuid::new_v4()));
        let pool = db::open(&path).unwrap();
        TokenStore::new(pool).unwrap()
    }

    fn add(store: &TokenStore, email: &str) -> i64 {
        store
            .insert(&NewToken {
                email: email.to_string(),
                access_token: "tok".to_string(),
                session_token: None,
                refresh_token: None,
                client_id: None,
                proxy_url: None,
                remark: None,
                image_concurrency: Some(1),
                video_concurrency: Some(3),
            })
            .unwrap()
    }

    #[test]
    fn selects_least_used_then_oldest_then_lowest_id() {
        let store = memory_store();
        let a = add(&store, "a@example.com");
        let b = add(&store, "b@example.com");
        store.record_use(a).unwrap(); // a now has use_count 1, b has 0

        let locks = LockTable::new();
        let concurrency = ConcurrencyManager::new();
        let now = Utc::now();

        let chosen = select(&store, &locks, &concurrency, JobClass::Image, now).unwrap();
        assert_eq!(chosen.id, b, "token with lower use_count should win");
    }

    #[test]
    fn deterministic_for_equal_state() {
        let store = memory_store();
        add(&store, "a@example.com");
        add(&store, "b@example.com");
        let locks = LockTable::new();
        let concurrency = ConcurrencyManager::new();
        let now = Utc::now();

        let first = select(&store, &locks, &concurrency, JobClass::Image, now).map(|t| t.id);
        let second = select(&store, &locks, &concurrency, JobClass::Image, now).map(|t| t.id);
        assert_eq!(first, second);
    }

    #[test]
    fn cooled_token_is_ineligible() {
        let store = memory_store();
        let id = add(&store, "a@example.com");
        store
            .set_cooldown(id, Some(Utc::now() + Duration::hours(1)))
            .unwrap();

        let locks = LockTable::new();
        let concurrency = ConcurrencyManager::new();
        assert!(select(&store, &locks, &concurrency, JobClass::Image, Utc::now()).is_none());
    }
}
