//! Proxy resolver: per-token proxy override over a global default, with a
//! distinct routing lane for sentinel/PoW traffic.
//!
//! `reqwest::Client` bakes its proxy in at build time, so rather than
//! building one ad hoc per call, clients are built once per distinct proxy
//! URL and cached, keyed by proxy instead of being a single global client.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;

use crate::tokens::Token;

pub struct ProxyResolver {
    global_proxy: Option<String>,
    pow_proxy: Option<String>,
    pow_proxy_enabled: bool,
    clients: RwLock<HashMap<Option<String>, Client>>,
}

impl ProxyResolver {
    pub fn new(global_proxy: Option<String>, pow_proxy: Option<String>, pow_proxy_enabled: bool) -> Self {
        Self {
            global_proxy,
            pow_proxy,
            pow_proxy_enabled,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// The client generation traffic for this token should use: the token's
    /// own `proxy_url` override, falling back to the configured global proxy.
    pub fn client_for_token(&self, token: &Token) -> Result<Client> {
        let proxy = token.proxy_url.clone().or_else(|| self.global_proxy.clone());
        self.client_for(proxy)
    }

    /// The client sentinel/PoW traffic should use: the dedicated PoW proxy
    /// when enabled, else the global proxy.
    pub fn client_for_pow(&self) -> Result<Client> {
        let proxy = if self.pow_proxy_enabled {
            self.pow_proxy.clone().or_else(|| self.global_proxy.clone())
        } else {
            self.global_proxy.clone()
        };
        self.client_for(proxy)
    }

    fn client_for(&self, proxy: Option<String>) -> Result<Client> {
        if let Some(client) = self.clients.read().unwrap().get(&proxy) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder()
            .timeout(Duration::from_secs(120))
            .pool_max_idle_per_host(10);
        if let Some(url) = &proxy {
            builder = builder.proxy(reqwest::Proxy::all(url).context("invalid proxy URL")?);
        }
        let client = builder.build().context("building proxied HTTP client")?;

        self.clients.write().unwrap().insert(proxy, client.clone());
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn token_with_proxy(proxy: Option<&str>) -> Token {
        Token {
            id: 1,
            email: "a@example.com".to_string(),
            access_token: "tok".to_string(),
            session_token: None,
            refresh_token: None,
            client_id: None,
            proxy_url: proxy.map(|s| s.to_string()),
            remark: None,
            is_active: true,
            cooled_until: None,
            created_at: Utc::now(),
            last_used_at: None,
            use_count: 0,
            plan_type: None,
            plan_title: None,
            subscription_end: None,
            sora2_supported: true,
            sora2_invite_code: None,
            sora2_redeemed_count: 0,
            sora2_total_count: 10,
            sora2_remaining_count: 10,
            sora2_cooldown_until: None,
            image_enabled: true,
            video_enabled: true,
            image_concurrency: -1,
            video_concurrency: -1,
        }
    }

    #[test]
    fn per_token_proxy_overrides_global() {
        let resolver = ProxyResolver::new(Some("http://global.invalid:8080".to_string()), None, false);
        assert!(resolver.client_for_token(&token_with_proxy(Some("http://token.invalid:8080"))).is_ok());
        assert!(resolver.client_for_token(&token_with_proxy(None)).is_ok());
    }

    #[test]
    fn pow_proxy_used_only_when_enabled() {
        let resolver = ProxyResolver::new(
            Some("http://global.invalid:8080".to_string()),
            Some("http://pow.invalid:8080".to_string()),
            true,
        );
        assert!(resolver.client_for_pow().is_ok());

        let disabled = ProxyResolver::new(
            Some("http://global.invalid:8080".to_string()),
            Some("http://pow.invalid:8080".to_string()),
            false,
        );
        assert!(disabled.client_for_pow().is_ok());
    }
}
