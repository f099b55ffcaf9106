//! Sentinel token service: obtains the opaque anti-bot header
//! generation endpoints require, with process-scoped caching, single-flight
//! refresh, and a PoW-based manual fallback.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::future::{Shared, BoxFuture, FutureExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::fingerprint::FingerprintProfile;
use crate::pow::{self, PowFingerprintSeed};

pub const CHALLENGE_URL: &str = "https://chatgpt.com/backend-api/sentinel/req";

/// `{p, t, c, id, flow}` header the generation endpoints require.
#[derive(Debug, Clone, Serialize)]
pub struct SentinelToken {
    pub p: String,
    pub t: String,
    pub c: String,
    pub id: String,
    pub flow: String,
    /// The `oai-device-id` this token was minted against; `/nf/create` rejects
    /// a sentinel token presented alongside a different device id.
    pub device_id: String,
}

/// Flow tag accompanying a sentinel token, selecting which upstream surface
/// it was minted for.
#[derive(Debug, Clone, Copy)]
pub enum Flow {
    Sora2CreateTaskAuto,
    SoraInit,
}

impl Flow {
    fn as_str(&self) -> &'static str {
        match self {
            Flow::Sora2CreateTaskAuto => "sora_2_create_task__auto",
            Flow::SoraInit => "sora_init",
        }
    }
}

/// Mints a ready-to-use sentinel token via an embedded JS runtime (e.g. a
/// headless browser running the upstream's SDK). Optional: when no invoker is
/// configured, the service always falls through to the manual PoW path, which
/// is fully specified and is the default.
#[async_trait::async_trait]
pub trait SdkInvoker: Send + Sync {
    async fn token(&self, flow: &str, device_id: &str) -> Result<String>;
}

struct CacheSlot {
    token: Option<Arc<SentinelToken>>,
    refresh: Option<Shared<BoxFuture<'static, Result<Arc<SentinelToken>, String>>>>,
}

pub struct SentinelService {
    invoker: Option<Arc<dyn SdkInvoker>>,
    cache: Mutex<CacheSlot>,
}

impl SentinelService {
    pub fn new(invoker: Option<Arc<dyn SdkInvoker>>) -> Self {
        Self {
            invoker,
            cache: Mutex::new(CacheSlot {
                token: None,
                refresh: None,
            }),
        }
    }

    /// `get(client, force_refresh)`: returns the cached token, or coordinates
    /// a single in-flight refresh across concurrent callers. `client` should
    /// already be routed via the POW proxy lane.
    pub async fn get(&self, client: &Client, flow: Flow, force_refresh: bool) -> Result<Arc<SentinelToken>> {
        let fut = {
            let mut slot = self.cache.lock().await;
            if !force_refresh {
                if let Some(token) = &slot.token {
                    return Ok(token.clone());
                }
            }
            if let Some(existing) = &slot.refresh {
                existing.clone()
            } else {
                let client = client.clone();
                let invoker = self.invoker.clone();
                let flow_str = flow.as_str().to_string();
                let new_fut: BoxFuture<'static, Result<Arc<SentinelToken>, String>> = async move {
                    mint(&client, invoker, &flow_str)
                        .await
                        .map(Arc::new)
                        .map_err(|e| e.to_string())
                }
                .boxed();
                let shared = new_fut.shared();
                slot.refresh = Some(shared.clone());
                shared
            }
        };

        let result = fut.await;

        let mut slot = self.cache.lock().await;
        slot.refresh = None;
        match result {
            Ok(token) => {
                slot.token = Some(token.clone());
                Ok(token)
            }
            Err(e) => bail!("sentinel token acquisition failed: {e}"),
        }
    }

    /// Invalidate the cached token. On a recognized sentinel failure from
    /// `/nf/create`, the caller invalidates and refreshes once.
    pub async fn invalidate(&self) {
        self.cache.lock().await.token = None;
    }
}

async fn mint(
    client: &Client,
    invoker: Option<Arc<dyn SdkInvoker>>,
    flow: &str,
) -> Result<SentinelToken> {
    let device_id = Uuid::new_v4().to_string();

    if let Some(invoker) = invoker {
        match invoker.token(flow, &device_id).await {
            Ok(p) => {
                return Ok(SentinelToken {
                    p,
                    t: String::new(),
                    c: String::new(),
                    id: Uuid::new_v4().to_string(),
                    flow: flow.to_string(),
                    device_id,
                });
            }
            Err(e) => {
                tracing::warn!("SDK invoker failed, falling back to manual PoW: {e}");
            }
        }
    }

    manual_fallback(client, flow, &device_id).await
}

#[derive(Debug, Deserialize)]
struct ChallengeResponse {
    #[serde(default)]
    proofofwork: Option<ProofOfWorkChallenge>,
    #[serde(default)]
    turnstile: Option<TurnstileChallenge>,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProofOfWorkChallenge {
    required: bool,
    seed: Option<String>,
    difficulty: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TurnstileChallenge {
    dx: Option<String>,
}

/// Manual PoW-based fallback:
/// 1. call the challenge endpoint with an initial `gAAAAAC<solution>` PoW seeded on the flow,
/// 2. if a second PoW is required, solve it against `(seed, difficulty)` and prefix `gAAAAAB`,
/// 3. combine with `turnstile.dx` and `token`.
async fn manual_fallback(client: &Client, flow: &str, device_id: &str) -> Result<SentinelToken> {
    let profile = FingerprintProfile::random();
    let fingerprint_seed = PowFingerprintSeed::generate(profile.user_agent.clone());

    let initial = pow::solve(flow, "ff", &fingerprint_seed);
    let initial_p = format!("gAAAAAC{}", initial.solution);

    let response: ChallengeResponse = client
        .post(CHALLENGE_URL)
        .header("content-type", "text/plain;charset=UTF-8")
        .headers(profile.header_map())
        .header("oai-device-id", device_id)
        .body(json!({ "p": initial_p }).to_string())
        .send()
        .await
        .context("calling sentinel challenge endpoint")?
        .json()
        .await
        .context("parsing sentinel challenge response")?;

    let p = match response.proofofwork {
        Some(pow_challenge) if pow_challenge.required => {
            let seed = pow_challenge.seed.unwrap_or_default();
            let difficulty = pow_challenge.difficulty.unwrap_or_else(|| "ff".to_string());
            let second = pow::solve(&seed, &difficulty, &fingerprint_seed);
            format!("gAAAAAB{}", second.solution)
        }
        _ => initial_p,
    };

    Ok(SentinelToken {
        p,
        t: response
            .turnstile
            .as_ref()
            .and_then(|t| t.dx.clone())
            .unwrap_or_default(),
        c: response.token.clone().unwrap_or_default(),
        id: Uuid::new_v4().to_string(),
        flow: flow.to_string(),
        device_id: device_id.to_string(),
    })
}

/// Whether an upstream error body indicates the sentinel token should be
/// invalidated and refreshed once.
pub fn looks_like_sentinel_failure(status: u16, body: &str) -> bool {
    if status != 400 {
        return false;
    }
    let lower = body.to_lowercase();
    lower.contains("sentinel") || lower.contains("invalid") || lower.contains("400")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingInvoker {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl SdkInvoker for CountingInvoker {
        async fn token(&self, _flow: &str, _device_id: &str) -> Result<String> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok("sdk-token".to_string())
        }
    }

    #[tokio::test]
    async fn concurrent_refreshes_single_flight_to_one_sdk_call() {
        let invoker = Arc::new(CountingInvoker {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let service = Arc::new(SentinelService::new(Some(invoker.clone())));
        let client = Client::new();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = service.clone();
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                service.get(&client, Flow::SoraInit, false).await.unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(invoker.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn sentinel_failure_detection_matches_spec_text() {
        assert!(looks_like_sentinel_failure(400, "invalid sentinel token"));
        assert!(!looks_like_sentinel_failure(403, "sentinel"));
        assert!(!looks_like_sentinel_failure(400, "malformed request"));
    }
}
