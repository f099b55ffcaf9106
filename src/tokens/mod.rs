//! Token pool: the credential records the gateway brokers access through,
//! plus the load balancer, per-token lock table, and concurrency manager that
//! select and guard them.

mod balancer;
mod concurrency;
mod lock;
pub mod store;

pub use balancer::{select, JobClass};
pub use concurrency::ConcurrencyManager;
pub use lock::LockTable;
pub use store::{NewToken, SubscriptionUpdate, TokenStore};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A credential record the gateway holds on behalf of an end user.
#[derive(Debug, Clone, Serialize)]
pub struct Token {
    pub id: i64,
    pub email: String,
    pub access_token: String,
    pub session_token: Option<String>,
    pub refresh_token: Option<String>,
    pub client_id: Option<String>,
    pub proxy_url: Option<String>,
    pub remark: Option<String>,
    pub is_active: bool,
    pub cooled_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub use_count: i64,
    pub plan_type: Option<String>,
    pub plan_title: Option<String>,
    pub subscription_end: Option<DateTime<Utc>>,
    pub sora2_supported: bool,
    pub sora2_invite_code: Option<String>,
    pub sora2_redeemed_count: i64,
    pub sora2_total_count: i64,
    pub sora2_remaining_count: i64,
    pub sora2_cooldown_until: Option<DateTime<Utc>>,
    pub image_enabled: bool,
    pub video_enabled: bool,
    /// -1 means unlimited.
    pub image_concurrency: i64,
    /// -1 means unlimited.
    pub video_concurrency: i64,
}

impl Token {
    /// §3 invariant: eligible for image iff active, feature-enabled, and not cooling down.
    pub fn eligible_for_image(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self.image_enabled
            && self.cooled_until.map(|t| t <= now).unwrap_or(true)
    }

    /// §3 invariant: image eligibility plus Sora2 support, quota, and cooldown.
    pub fn eligible_for_video(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self.video_enabled
            && self.cooled_until.map(|t| t <= now).unwrap_or(true)
            && self.sora2_supported
            && self.sora2_remaining_count > 0
            && self.sora2_cooldown_until.map(|t| t <= now).unwrap_or(true)
    }

    pub fn eligible_for(&self, class: JobClass, now: DateTime<Utc>) -> bool {
        match class {
            JobClass::Image => self.eligible_for_image(now),
            JobClass::Video => self.eligible_for_video(now),
        }
    }

    pub fn concurrency_cap(&self, class: JobClass) -> i64 {
        match class {
            JobClass::Image => self.image_concurrency,
            JobClass::Video => self.video_concurrency,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TokenStats {
    pub token_id: i64,
    pub image_count: i64,
    pub video_count: i64,
    pub error_count: i64,
    pub error_count_today: i64,
}
