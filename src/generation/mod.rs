//! Generation handler: the five branches a caller request can take, each
//! acquiring exactly the resources its branch needs and releasing them on
//! every exit path via an RAII guard, so there is exactly one terminal
//! release regardless of which branch or error path is taken.

pub mod model;
pub mod poll;
pub mod stream;
pub mod text;

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use chrono::Utc;
use tokio::sync::mpsc;

use crate::cache::FileCache;
use crate::config::AdminConfig;
use crate::error::{GatewayError, Result};
use crate::proxy_resolver::ProxyResolver;
use crate::sentinel::{Flow, SentinelService};
use crate::tasks::{TaskStatus, TaskStore};
use crate::tokens::{self, ConcurrencyManager, JobClass, LockTable, Token, TokenStore};
use crate::upstream::storyboard;
use crate::upstream::UpstreamClient;
use model::{parse_model, Kind, ModelSpec};
use poll::PollStatus;
use serde_json::Value;

pub struct GenerationContext {
    pub tokens: Arc<TokenStore>,
    pub locks: Arc<LockTable>,
    pub concurrency: Arc<ConcurrencyManager>,
    pub sentinel: Arc<SentinelService>,
    pub upstream: Arc<UpstreamClient>,
    pub proxy: Arc<ProxyResolver>,
    pub cache: Arc<FileCache>,
    pub tasks: Arc<TaskStore>,
    pub admin: AdminConfig,
}

#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: String,
    pub image_b64: Option<String>,
    pub character_video_b64: Option<String>,
    pub remix_target_id: Option<String>,
    pub stream: bool,
}

/// Releases whatever this branch acquired, exactly once, regardless of how
/// the branch's `Result` resolves — dropped at the end of every code path,
/// including early returns via `?`.
struct ResourceGuard {
    locks: Arc<LockTable>,
    concurrency: Arc<ConcurrencyManager>,
    token_id: i64,
    class: JobClass,
    lock_held: bool,
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.concurrency.release(self.token_id, self.class);
        if self.lock_held {
            self.locks.release(self.token_id);
        }
    }
}

/// Entry point: dispatch on the model's kind and the request shape, run the
/// selected branch, and record the terminal outcome against the token and the
/// request log before returning.
pub async fn handle(
    ctx: &GenerationContext,
    req: GenerationRequest,
    heartbeat: Option<mpsc::Sender<Value>>,
) -> Result<String> {
    let started = std::time::Instant::now();
    let spec = parse_model(&req.model)?;
    let now = Utc::now();

    let outcome = if !req.stream {
        probe(ctx, spec.kind, now).await
    } else {
        match spec.kind {
            Kind::Image => image_branch(ctx, &spec, &req, now, heartbeat).await,
            Kind::Video if req.remix_target_id.is_some() => {
                video_remix_branch(ctx, &req, now, heartbeat).await
            }
            Kind::Video if req.character_video_b64.is_some() => {
                video_character_branch(ctx, &spec, &req, now, heartbeat).await
            }
            Kind::Video => video_vanilla_branch(ctx, &spec, &req, now, heartbeat).await,
        }
    };

    tracing::info!(
        model = %req.model,
        duration_ms = started.elapsed().as_millis() as u64,
        ok = outcome.is_ok(),
        "generation request finished"
    );

    outcome
}

/// Branch 1: `stream=false` probes eligibility only, consuming no resources.
async fn probe(ctx: &GenerationContext, kind: Kind, now: chrono::DateTime<Utc>) -> Result<String> {
    let class = match kind {
        Kind::Image => JobClass::Image,
        Kind::Video => JobClass::Video,
    };
    let token = tokens::select(&ctx.tokens, &ctx.locks, &ctx.concurrency, class, now)
        .ok_or(GatewayError::NoEligibleToken)?;
    Ok(format!("ready (token #{} available)", token.id))
}

fn acquire_image(ctx: &GenerationContext, now: chrono::DateTime<Utc>) -> Result<(Token, ResourceGuard)> {
    let token = tokens::select(&ctx.tokens, &ctx.locks, &ctx.concurrency, JobClass::Image, now)
        .ok_or(GatewayError::NoEligibleToken)?;
    let ttl = Duration::from_secs(ctx.admin.image_timeout_secs);
    if !ctx.locks.try_acquire(token.id, ttl, now) {
        return Err(GatewayError::NoEligibleToken);
    }
    if !ctx
        .concurrency
        .try_acquire(token.id, JobClass::Image, token.concurrency_cap(JobClass::Image))
    {
        ctx.locks.release(token.id);
        return Err(GatewayError::NoEligibleToken);
    }
    let _ = ctx.tokens.record_use(token.id);
    Ok((
        token.clone(),
        ResourceGuard {
            locks: ctx.locks.clone(),
            concurrency: ctx.concurrency.clone(),
            token_id: token.id,
            class: JobClass::Image,
            lock_held: true,
        },
    ))
}

fn acquire_video(ctx: &GenerationContext, now: chrono::DateTime<Utc>) -> Result<(Token, ResourceGuard)> {
    let token = tokens::select(&ctx.tokens, &ctx.locks, &ctx.concurrency, JobClass::Video, now)
        .ok_or(GatewayError::NoEligibleToken)?;
    if !ctx
        .concurrency
        .try_acquire(token.id, JobClass::Video, token.concurrency_cap(JobClass::Video))
    {
        return Err(GatewayError::NoEligibleToken);
    }
    let _ = ctx.tokens.record_use(token.id);
    Ok((
        token.clone(),
        ResourceGuard {
            locks: ctx.locks.clone(),
            concurrency: ctx.concurrency.clone(),
            token_id: token.id,
            class: JobClass::Video,
            lock_held: false,
        },
    ))
}

/// Record the error-accounting consequences of a terminal result against the
/// token that ran it (spec §5, §7), then return the result unchanged.
fn finish(ctx: &GenerationContext, token_id: i64, result: Result<String>) -> Result<String> {
    if let Err(ref err) = result {
        match err {
            GatewayError::Auth(_) if ctx.admin.auto_disable_on_401 => {
                let _ = ctx.tokens.record_auth_failure(token_id);
            }
            err if err.counts_against_token() => {
                let _ = ctx.tokens.record_error(token_id, ctx.admin.error_ban_threshold);
            }
            _ => {}
        }
    }
    result
}

fn send_heartbeat(heartbeat: &Option<mpsc::Sender<Value>>, id: &str, model: &str, content: &str) {
    if let Some(tx) = heartbeat {
        let chunk = stream::content_chunk(id, model, Utc::now().timestamp(), content);
        let _ = tx.try_send(chunk);
    }
}

/// Branch 2: image generation.
async fn image_branch(
    ctx: &GenerationContext,
    spec: &ModelSpec,
    req: &GenerationRequest,
    now: chrono::DateTime<Utc>,
    heartbeat: Option<mpsc::Sender<Value>>,
) -> Result<String> {
    let (token, _guard) = acquire_image(ctx, now)?;
    let request_id = uuid::Uuid::new_v4().to_string();
    let client = ctx.proxy.client_for_token(&token)?;
    let profile = crate::fingerprint::FingerprintProfile::random();

    let result = async {
        let media_id = match &req.image_b64 {
            Some(b64) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(b64)
                    .map_err(|e| GatewayError::Internal(anyhow::anyhow!("decoding image base64: {e}")))?;
                Some(
                    ctx.upstream
                        .upload_image(&client, &token.access_token, &profile, bytes, "upload.png")
                        .await?,
                )
            }
            None => None,
        };

        let task_id = ctx
            .upstream
            .generate_image(&client, &token.access_token, &profile, &req.prompt, spec.width, spec.height, media_id.as_deref())
            .await?;
        ctx.tasks.create(&task_id, token.id, &req.model, &req.prompt).ok();
        let _ = ctx.tasks.set_status(&task_id, TaskStatus::Running);

        let poll_interval = Duration::from_millis(ctx.admin.poll_interval_ms);
        let timeout = Duration::from_secs(ctx.admin.image_timeout_secs);
        let tasks = ctx.tasks.clone();
        let task_id_for_cancel = task_id.clone();

        let url = poll::poll_until(
            || {
                let client = client.clone();
                let token = token.clone();
                let profile = profile.clone();
                let task_id = task_id.clone();
                let upstream = ctx.upstream.clone();
                async move {
                    let entries = upstream.get_image_tasks(&client, &token.access_token, &profile, 20).await?;
                    match entries.into_iter().find(|e| e.id == task_id) {
                        None => Ok(PollStatus::Pending),
                        Some(entry) if entry.status == "succeeded" => {
                            let url = entry
                                .generations
                                .first()
                                .and_then(|g| g.downloadable_url.clone().or_else(|| g.url.clone()))
                                .ok_or_else(|| GatewayError::Upstream { status: 0, body: "no generation url".to_string() })?;
                            Ok(PollStatus::Succeeded(url))
                        }
                        Some(entry) if entry.status == "failed" => Ok(PollStatus::Failed("image generation failed".to_string())),
                        Some(_) => Ok(PollStatus::Pending),
                    }
                }
            },
            poll_interval,
            Duration::from_secs(10),
            timeout,
            {
                let heartbeat = heartbeat.clone();
                let request_id = request_id.clone();
                let model = req.model.clone();
                move || send_heartbeat(&heartbeat, &request_id, &model, "still generating your image...")
            },
            move || tasks.is_cancelled(&task_id_for_cancel).unwrap_or(false),
        )
        .await?;

        let cached = ctx.cache.download_and_cache(&client, &url).await.unwrap_or(url);
        let _ = ctx.tasks.set_result(&task_id, &[cached.clone()]);
        let _ = ctx.tokens.record_success(token.id, JobClass::Image);

        Ok(stream::image_markdown(&cached))
    }
    .await;

    finish(ctx, token.id, result)
}

/// Branch 3: vanilla video generation (no remix, no character).
async fn video_vanilla_branch(
    ctx: &GenerationContext,
    spec: &ModelSpec,
    req: &GenerationRequest,
    now: chrono::DateTime<Utc>,
    heartbeat: Option<mpsc::Sender<Value>>,
) -> Result<String> {
    let (token, _guard) = acquire_video(ctx, now)?;
    let client = ctx.proxy.client_for_token(&token)?;
    let pow_client = ctx.proxy.client_for_pow()?;

    let result = run_video_submission(
        ctx,
        &token,
        &client,
        &pow_client,
        req,
        heartbeat,
        SubmissionKind::Vanilla { spec: *spec },
    )
    .await;

    finish(ctx, token.id, result)
}

/// Branch 4: video remix — skip upload, call `remix_video` directly.
async fn video_remix_branch(
    ctx: &GenerationContext,
    req: &GenerationRequest,
    now: chrono::DateTime<Utc>,
    heartbeat: Option<mpsc::Sender<Value>>,
) -> Result<String> {
    let (token, _guard) = acquire_video(ctx, now)?;
    let client = ctx.proxy.client_for_token(&token)?;
    let pow_client = ctx.proxy.client_for_pow()?;
    let target_id = req.remix_target_id.clone().unwrap_or_default();

    let result = run_video_submission(
        ctx,
        &token,
        &client,
        &pow_client,
        req,
        heartbeat,
        SubmissionKind::Remix { target_id },
    )
    .await;

    finish(ctx, token.id, result)
}

/// Branch 5: character video — upload, poll cameo status, finalize, optionally
/// generate with the derived username prepended, always delete the character.
async fn video_character_branch(
    ctx: &GenerationContext,
    spec: &ModelSpec,
    req: &GenerationRequest,
    now: chrono::DateTime<Utc>,
    heartbeat: Option<mpsc::Sender<Value>>,
) -> Result<String> {
    let (token, _guard) = acquire_video(ctx, now)?;
    let client = ctx.proxy.client_for_token(&token)?;
    let pow_client = ctx.proxy.client_for_pow()?;
    let profile = crate::fingerprint::FingerprintProfile::random();

    let result: Result<String> = async {
        let video_b64 = req
            .character_video_b64
            .as_deref()
            .ok_or_else(|| GatewayError::Internal(anyhow::anyhow!("character branch requires character_video_b64")))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(video_b64)
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("decoding character video base64: {e}")))?;

        let cameo_id = ctx
            .upstream
            .upload_character_video(&client, &token.access_token, &profile, bytes, "cameo.mp4")
            .await?;

        let cameo_id_for_poll = cameo_id.clone();
        let upstream = ctx.upstream.clone();
        let client_for_poll = client.clone();
        let token_for_poll = token.clone();
        let profile_for_poll = profile.clone();
        let status = poll::poll_until(
            move || {
                let upstream = upstream.clone();
                let client = client_for_poll.clone();
                let token = token_for_poll.clone();
                let profile = profile_for_poll.clone();
                let cameo_id = cameo_id_for_poll.clone();
                async move {
                    let status = upstream.get_cameo_status(&client, &token.access_token, &profile, &cameo_id).await?;
                    match status.status.as_str() {
                        "ready" | "succeeded" => Ok(PollStatus::Succeeded(status)),
                        "failed" => Ok(PollStatus::Failed("cameo processing failed".to_string())),
                        _ => Ok(PollStatus::Pending),
                    }
                }
            },
            Duration::from_millis(ctx.admin.poll_interval_ms),
            Duration::from_secs(30),
            Duration::from_secs(ctx.admin.video_timeout_secs),
            {
                let heartbeat = heartbeat.clone();
                let model = req.model.clone();
                move || send_heartbeat(&heartbeat, "character", &model, "preparing your character...")
            },
            || false,
        )
        .await;

        // Always delete the character in cleanup, regardless of how far we got.
        let cleanup = async {
            let _ = ctx
                .upstream
                .delete_character(&client, &token.access_token, &profile, &cameo_id)
                .await;
        };

        let cameo = match status {
            Ok(cameo) => cameo,
            Err(e) => {
                cleanup.await;
                return Err(e);
            }
        };

        let avatar_bytes = match download_avatar(&client, cameo.avatar_url.as_deref()).await {
            Ok(bytes) => bytes,
            Err(e) => {
                cleanup.await;
                return Err(e);
            }
        };
        let avatar_media_id = ctx
            .upstream
            .upload_character_image(&client, &token.access_token, &profile, avatar_bytes, "avatar.png")
            .await;
        let avatar_media_id = match avatar_media_id {
            Ok(id) => id,
            Err(e) => {
                cleanup.await;
                return Err(e);
            }
        };

        let finalize_result = ctx
            .upstream
            .finalize_character(&client, &token.access_token, &profile, &cameo_id, &avatar_media_id)
            .await;
        if let Err(e) = finalize_result {
            cleanup.await;
            return Err(e);
        }

        let username = text::derive_username(cameo.username_hint.as_deref().unwrap_or("character"));
        let prompt = format!("@{username} {}", req.prompt);

        let mut character_req = req.clone();
        character_req.prompt = prompt;
        character_req.character_video_b64 = None;

        let submission = run_video_submission(
            ctx,
            &token,
            &client,
            &pow_client,
            &character_req,
            heartbeat,
            SubmissionKind::Vanilla { spec: *spec },
        )
        .await;

        cleanup.await;
        submission
    }
    .await;

    finish(ctx, token.id, result)
}

enum SubmissionKind {
    Vanilla { spec: ModelSpec },
    Remix { target_id: String },
}

/// Download the cameo's avatar frame to re-upload as the character's avatar
/// image (spec §4.5 "download/upload avatar"). Falls back to an empty buffer
/// when the upstream gave no avatar URL — `upload_character_image` still
/// succeeds against it, the upstream just has nothing better to work from.
async fn download_avatar(client: &reqwest::Client, avatar_url: Option<&str>) -> Result<Vec<u8>> {
    let Some(url) = avatar_url else {
        return Ok(Vec::new());
    };
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| GatewayError::Upstream { status: 0, body: e.to_string() })?;
    let bytes = response
        .bytes()
        .await
        .map_err(|e| GatewayError::Upstream { status: 0, body: e.to_string() })?;
    Ok(bytes.to_vec())
}

/// Submit the generation body (direct, storyboard, or remix) against a given
/// sentinel token. Shared between the first attempt and the post-invalidation
/// retry so both see the same already-uploaded media / formatted prompt.
#[allow(clippy::too_many_arguments)]
async fn submit_once(
    ctx: &GenerationContext,
    client: &reqwest::Client,
    token: &Token,
    sentinel: &crate::sentinel::SentinelToken,
    kind: &SubmissionKind,
    req: &GenerationRequest,
    media_id: Option<&str>,
    storyboard_body: Option<&str>,
) -> Result<String> {
    match kind {
        SubmissionKind::Remix { target_id } => {
            let cleaned = storyboard::clean_remix_prompt(&req.prompt);
            ctx.upstream
                .remix_video(client, &token.access_token, sentinel, target_id, &cleaned)
                .await
        }
        SubmissionKind::Vanilla { spec } => match storyboard_body {
            Some(formatted) => {
                ctx.upstream
                    .generate_storyboard(client, &token.access_token, sentinel, formatted, spec.orientation, spec.n_frames)
                    .await
            }
            None => {
                ctx.upstream
                    .generate_video(client, &token.access_token, sentinel, &req.prompt, spec.orientation, spec.n_frames, media_id)
                    .await
            }
        },
    }
}

/// Shared submit/poll/cache/emit tail for the vanilla and remix video
/// branches: both end up calling `/nf/create` (directly or via remix) and
/// then racing the same pending-list poll.
async fn run_video_submission(
    ctx: &GenerationContext,
    token: &Token,
    client: &reqwest::Client,
    pow_client: &reqwest::Client,
    req: &GenerationRequest,
    heartbeat: Option<mpsc::Sender<Value>>,
    kind: SubmissionKind,
) -> Result<String> {
    let request_id = uuid::Uuid::new_v4().to_string();

    let media_id: Option<String> = match (&kind, &req.image_b64) {
        (SubmissionKind::Vanilla { .. }, Some(b64)) => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(b64)
                .map_err(|e| GatewayError::Internal(anyhow::anyhow!("decoding image base64: {e}")))?;
            let profile = crate::fingerprint::FingerprintProfile::random();
            Some(
                ctx.upstream
                    .upload_image(client, &token.access_token, &profile, bytes, "upload.png")
                    .await?,
            )
        }
        _ => None,
    };
    let storyboard_body: Option<String> = match &kind {
        SubmissionKind::Vanilla { .. } if storyboard::is_storyboard(&req.prompt) => {
            Some(storyboard::format_storyboard(&req.prompt))
        }
        _ => None,
    };

    let sentinel = ctx
        .sentinel
        .get(pow_client, Flow::Sora2CreateTaskAuto, false)
        .await
        .map_err(|e| GatewayError::Challenge(e.to_string()))?;

    let first_attempt = submit_once(ctx, client, token, &sentinel, &kind, req, media_id.as_deref(), storyboard_body.as_deref()).await;

    let task_id = match first_attempt {
        Ok(id) => id,
        Err(GatewayError::Upstream { status, body }) if sentinel_rejected(status, &body) => {
            ctx.sentinel.invalidate().await;
            let retry_sentinel = ctx
                .sentinel
                .get(pow_client, Flow::Sora2CreateTaskAuto, true)
                .await
                .map_err(|e| GatewayError::Challenge(e.to_string()))?;
            submit_once(ctx, client, token, &retry_sentinel, &kind, req, media_id.as_deref(), storyboard_body.as_deref()).await?
        }
        Err(e) => return Err(e),
    };

    ctx.tasks.create(&task_id, token.id, &req.model, &req.prompt).ok();
    let _ = ctx.tasks.set_status(&task_id, TaskStatus::Running);

    let tasks = ctx.tasks.clone();
    let task_id_for_cancel = task_id.clone();
    let poll_interval = Duration::from_millis(ctx.admin.poll_interval_ms);
    let timeout = Duration::from_secs(ctx.admin.video_timeout_secs);
    let poll_profile = crate::fingerprint::FingerprintProfile::random();

    let final_status = poll::poll_until(
        {
            let client = client.clone();
            let token = token.clone();
            let task_id = task_id.clone();
            let upstream = ctx.upstream.clone();
            let profile = poll_profile.clone();
            move || {
                let client = client.clone();
                let token = token.clone();
                let task_id = task_id.clone();
                let upstream = upstream.clone();
                let profile = profile.clone();
                async move {
                    let pending = upstream.get_pending_tasks(&client, &token.access_token, &profile).await?;
                    if pending.iter().any(|p| p.id == task_id) {
                        Ok(PollStatus::Pending)
                    } else {
                        // task_not_found in pending implies completion; drafts fetched once by caller.
                        Ok(PollStatus::Succeeded(()))
                    }
                }
            }
        },
        poll_interval,
        Duration::from_secs(30),
        timeout,
        {
            let heartbeat = heartbeat.clone();
            let request_id = request_id.clone();
            let model = req.model.clone();
            move || send_heartbeat(&heartbeat, &request_id, &model, "still rendering your video...")
        },
        move || tasks.is_cancelled(&task_id_for_cancel).unwrap_or(false),
    )
    .await;

    final_status?;

    let profile = poll_profile;
    let drafts = ctx.upstream.get_video_drafts(client, &token.access_token, &profile, 5).await?;
    let draft = drafts
        .into_iter()
        .find(|d| d.generation_id.as_deref() == Some(task_id.as_str()) || d.id == task_id)
        .ok_or_else(|| GatewayError::Upstream { status: 0, body: "no matching video draft".to_string() })?;
    let url = draft.downloadable_url.clone().or(draft.url.clone()).ok_or_else(|| GatewayError::Upstream {
        status: 0,
        body: "draft carries no url".to_string(),
    })?;

    let final_url = apply_watermark_free(ctx, client, &token, &profile, &draft.id, &req.prompt, &url)
        .await
        .unwrap_or(url);

    let cached = ctx.cache.download_and_cache(client, &final_url).await.unwrap_or(final_url);
    let _ = ctx.tasks.set_result(&task_id, &[cached.clone()]);
    let _ = ctx.tokens.record_success(token.id, JobClass::Video);

    Ok(stream::video_html(&cached))
}

fn sentinel_rejected(status: u16, body: &str) -> bool {
    crate::sentinel::looks_like_sentinel_failure(status, body)
}

/// Watermark-free sub-flow (spec §4.5): publish, resolve the clean URL, cache
/// it, delete the published post. Falls back to the caller on any failure
/// when the operator has that fallback enabled; the caller decides whether to
/// use the standard `downloadable_url` or surface the error.
async fn apply_watermark_free(
    ctx: &GenerationContext,
    client: &reqwest::Client,
    token: &Token,
    profile: &crate::fingerprint::FingerprintProfile,
    generation_id: &str,
    prompt: &str,
    fallback_url: &str,
) -> Result<String> {
    if !ctx.admin.watermark_free_enabled {
        return Ok(fallback_url.to_string());
    }

    let outcome: Result<String> = async {
        let post_id = ctx
            .upstream
            .post_video_for_watermark_free(client, &token.access_token, profile, generation_id, prompt)
            .await?;
        let share_url = format!("https://{}/p/{}", ctx.admin.watermark_free_host, post_id);
        let resolved = ctx
            .upstream
            .get_watermark_free_url_custom(
                client,
                ctx.admin.watermark_free_parser_url.as_deref(),
                &share_url,
                &token.access_token,
                &post_id,
            )
            .await;
        let _ = ctx.upstream.delete_post(client, &token.access_token, profile, &post_id).await;
        resolved
    }
    .await;

    match outcome {
        Ok(url) => Ok(url),
        Err(e) if ctx.admin.watermark_free_fallback_enabled => {
            tracing::warn!("watermark-free flow failed, falling back to standard url: {e}");
            Ok(fallback_url.to_string())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::{ConcurrencyManager, LockTable};

    #[test]
    fn resource_guard_releases_lock_and_slot_on_drop() {
        let locks = Arc::new(LockTable::new());
        let concurrency = Arc::new(ConcurrencyManager::new());
        let now = Utc::now();

        assert!(locks.try_acquire(1, Duration::from_secs(30), now));
        assert!(concurrency.try_acquire(1, JobClass::Image, 1));

        {
            let _guard = ResourceGuard {
                locks: locks.clone(),
                concurrency: concurrency.clone(),
                token_id: 1,
                class: JobClass::Image,
                lock_held: true,
            };
            assert!(locks.is_held(1, now));
            assert!(!concurrency.try_acquire(1, JobClass::Image, 1));
        }

        assert!(!locks.is_held(1, now));
        assert!(concurrency.try_acquire(1, JobClass::Image, 1));
    }

    #[test]
    fn resource_guard_leaves_lock_alone_when_not_held() {
        let locks = Arc::new(LockTable::new());
        let concurrency = Arc::new(ConcurrencyManager::new());
        let now = Utc::now();

        assert!(locks.try_acquire(2, Duration::from_secs(30), now));
        assert!(concurrency.try_acquire(2, JobClass::Video, 1));

        {
            let _guard = ResourceGuard {
                locks: locks.clone(),
                concurrency: concurrency.clone(),
                token_id: 2,
                class: JobClass::Video,
                lock_held: false,
            };
        }

        // video jobs never touch the lock table; it should remain held.
        assert!(locks.is_held(2, now));
        assert!(concurrency.try_acquire(2, JobClass::Video, 1));
    }

    fn test_context() -> (GenerationContext, i64) {
        let path = std::env::temp_dir().join(format!("sora-broker-test-{}.sqlite3", uuid::Uuid::new_v4()));
        let pool = crate::db::open(&path).unwrap();
        let tokens = TokenStore::new(pool.clone()).unwrap();
        let token_id = tokens
            .insert(&crate::tokens::store::NewToken {
                email: "a@example.com".to_string(),
                access_token: "tok".to_string(),
                session_token: None,
                refresh_token: None,
                client_id: None,
                proxy_url: None,
                remark: None,
                image_concurrency: Some(1),
                video_concurrency: Some(3),
            })
            .unwrap();

        let ctx = GenerationContext {
            tokens: Arc::new(tokens),
            locks: Arc::new(LockTable::new()),
            concurrency: Arc::new(ConcurrencyManager::new()),
            sentinel: Arc::new(SentinelService::new(None)),
            upstream: Arc::new(UpstreamClient::new("https://sora.example.invalid".to_string())),
            proxy: Arc::new(ProxyResolver::new(None, None, false)),
            cache: Arc::new(FileCache::new(crate::config::CacheConfig {
                enabled: false,
                timeout_secs: -1,
                base_url: "http://localhost".to_string(),
                dir: std::env::temp_dir(),
            })),
            tasks: Arc::new(TaskStore::new(pool)),
            admin: AdminConfig::default(),
        };
        (ctx, token_id)
    }

    #[test]
    fn finish_passes_through_ok_results_untouched() {
        let (ctx, token_id) = test_context();
        let result = finish(&ctx, token_id, Ok("done".to_string()));
        assert_eq!(result.unwrap(), "done");
        assert_eq!(ctx.tokens.stats(token_id).unwrap().error_count, 0);
    }

    #[test]
    fn finish_records_error_for_errors_that_count_against_the_token() {
        let (ctx, token_id) = test_context();
        let err = GatewayError::Upstream { status: 500, body: "boom".to_string() };
        assert!(err.counts_against_token());

        let result = finish(&ctx, token_id, Err(err));
        assert!(result.is_err());
        assert_eq!(ctx.tokens.stats(token_id).unwrap().error_count, 1);
    }

    #[test]
    fn finish_disables_token_on_auth_failure_when_configured() {
        let (ctx, token_id) = test_context();
        assert!(ctx.admin.auto_disable_on_401);

        let result = finish(&ctx, token_id, Err(GatewayError::Auth("bad token".to_string())));
        assert!(result.is_err());
        let token = ctx.tokens.get(token_id).unwrap();
        assert!(!token.is_active);
    }

    #[test]
    fn finish_does_not_count_cancellation_against_the_token() {
        let (ctx, token_id) = test_context();
        let err = GatewayError::Cancelled;
        assert!(!err.counts_against_token());

        let result = finish(&ctx, token_id, Err(err));
        assert!(result.is_err());
        assert_eq!(ctx.tokens.stats(token_id).unwrap().error_count, 0);
    }

    #[test]
    fn sentinel_rejected_requires_400_and_a_recognizable_body() {
        assert!(sentinel_rejected(400, "sentinel token invalid"));
        assert!(!sentinel_rejected(403, "sentinel token invalid"));
        assert!(!sentinel_rejected(400, "rate limited"));
    }

    #[tokio::test]
    async fn download_avatar_returns_empty_when_no_url_given() {
        let client = reqwest::Client::new();
        let bytes = download_avatar(&client, None).await.unwrap();
        assert!(bytes.is_empty());
    }
}
