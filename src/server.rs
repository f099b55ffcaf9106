//! HTTP surface: the caller-facing chat-completion-compatible streaming
//! endpoint, the cache's static file route, and the admin surface mounted
//! alongside it.

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::admin;
use crate::generation::{self, stream, GenerationRequest};
use crate::state::AppState;
use crate::upstream::storyboard;

pub fn build(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/tmp/:filename", get(serve_cached_file))
        .merge(admin::router(state.clone()))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ChatCompletionRequest {
    model: String,
    #[serde(default)]
    stream: bool,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    role: String,
    content: MessageContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: UrlPart },
    VideoUrl { video_url: UrlPart },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct UrlPart {
    url: String,
}

/// Pull the prompt text and any embedded media out of the last user message.
/// Image/video parts carry a `data:<mime>;base64,<payload>` URL, the same
/// convention OpenAI's own vision-capable models use.
fn parse_request(body: ChatCompletionRequest) -> Result<GenerationRequest, (StatusCode, String)> {
    let last_user = body
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user" || m.role.is_empty())
        .ok_or((StatusCode::BAD_REQUEST, "messages must include a user turn".to_string()))?;

    let mut prompt = String::new();
    let mut image_b64 = None;
    let mut character_video_b64 = None;

    match &last_user.content {
        MessageContent::Text(text) => prompt.push_str(text),
        MessageContent::Parts(parts) => {
            for part in parts {
                match part {
                    ContentPart::Text { text } => {
                        if !prompt.is_empty() {
                            prompt.push(' ');
                        }
                        prompt.push_str(text);
                    }
                    ContentPart::ImageUrl { image_url } => {
                        image_b64 = decode_data_url(&image_url.url);
                    }
                    ContentPart::VideoUrl { video_url } => {
                        character_video_b64 = decode_data_url(&video_url.url);
                    }
                    ContentPart::Unknown => {}
                }
            }
        }
    }

    let remix_target_id = storyboard::extract_share_id(&prompt);

    Ok(GenerationRequest {
        model: body.model,
        prompt,
        image_b64,
        character_video_b64,
        remix_target_id,
        stream: body.stream,
    })
}

/// A `data:<mime>;base64,<payload>` URL's payload, or `None` for anything else
/// (e.g. a plain `https://` URL — this gateway doesn't fetch caller-supplied
/// media over the network, only what the caller inlines).
fn decode_data_url(url: &str) -> Option<String> {
    url.split_once("base64,").map(|(_, payload)| payload.to_string())
}

fn require_api_key(state: &AppState, headers: &HeaderMap) -> Result<(), (StatusCode, String)> {
    let Some(expected) = &state.api_key else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(expected.as_ref()) {
        Ok(())
    } else {
        Err((StatusCode::UNAUTHORIZED, "invalid api key".to_string()))
    }
}

async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatCompletionRequest>,
) -> Response {
    if let Err((status, message)) = require_api_key(&state, &headers) {
        return (status, message).into_response();
    }

    let req = match parse_request(body) {
        Ok(req) => req,
        Err((status, message)) => return (status, message).into_response(),
    };

    let id = uuid::Uuid::new_v4().to_string();
    let model = req.model.clone();
    let started = std::time::Instant::now();

    if !req.stream {
        let result = generation::handle(&state.generation, req, None).await;
        log_and_status(&state, None, &model, started, &result);
        return match result {
            Ok(content) => {
                Json(stream::non_stream_response(&id, &model, Utc::now().timestamp(), &content)).into_response()
            }
            Err(err) => err.into_response(),
        };
    }

    let (tx, rx) = mpsc::channel::<Value>(16);
    let role = stream::role_chunk(&id, &model, Utc::now().timestamp());
    let _ = tx.send(role).await;

    let ctx = state.generation.clone();
    let heartbeat = tx.clone();
    let state_for_log = state.clone();
    let id_for_task = id.clone();
    let model_for_task = model.clone();
    tokio::spawn(async move {
        let result = generation::handle(&ctx, req, Some(heartbeat)).await;
        log_and_status(&state_for_log, None, &model_for_task, started, &result);
        let chunk = match result {
            Ok(content) => stream::final_chunk(&id_for_task, &model_for_task, Utc::now().timestamp(), &content),
            Err(err) => err.to_stream_chunk(&id_for_task, &model_for_task, Utc::now().timestamp()),
        };
        let _ = tx.send(chunk).await;
    });

    let body_stream = ReceiverStream::new(rx)
        .map(|chunk| stream::sse_line(&chunk))
        .chain(tokio_stream::once(stream::DONE.to_string()))
        .map(|line| Ok::<_, Infallible>(line));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Writes the request log row for a terminal generation outcome. The
/// streaming branch has no HTTP status of its own to reuse here (the
/// response was already 200 at the SSE level), so it's derived from the
/// error the same way the non-streaming branch's actual response status is.
fn log_and_status(state: &AppState, token_id: Option<i64>, model: &str, started: std::time::Instant, result: &crate::error::Result<String>) {
    let duration_ms = started.elapsed().as_millis() as i64;
    let (status, error_kind) = match result {
        Ok(_) => (StatusCode::OK, None),
        Err(err) => (err.http_status(), Some(err.kind())),
    };
    let _ = state
        .request_log
        .record(token_id, model, status.as_u16(), duration_ms, error_kind);
}

async fn serve_cached_file(State(state): State<AppState>, Path(filename): Path<String>) -> Response {
    let path = state.cache_dir.join(&filename);
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let content_type = mime_guess_from_extension(&filename);
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .body(Body::from(bytes))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

fn mime_guess_from_extension(filename: &str) -> &'static str {
    match filename.rsplit('.').next() {
        Some("mp4") => "video/mp4",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FileCache;
    use crate::config::Config;
    use crate::generation::GenerationContext;
    use crate::proxy_resolver::ProxyResolver;
    use crate::sentinel::SentinelService;
    use crate::tasks::TaskStore;
    use crate::tokens::TokenStore;
    use crate::upstream::UpstreamClient;
    use std::sync::Arc;

    fn test_state(api_key: Option<&str>) -> AppState {
        let path = std::env::temp_dir().join(format!("sora-broker-server-test-{}.sqlite3", uuid::Uuid::new_v4()));
        let pool = crate::db::open(&path).unwrap();
        let ctx = GenerationContext {
            tokens: Arc::new(TokenStore::new(pool.clone()).unwrap()),
            locks: Arc::new(crate::tokens::LockTable::new()),
            concurrency: Arc::new(crate::tokens::ConcurrencyManager::new()),
            sentinel: Arc::new(SentinelService::new(None)),
            upstream: Arc::new(UpstreamClient::new("https://sora.example.invalid".to_string())),
            proxy: Arc::new(ProxyResolver::new(None, None, false)),
            cache: Arc::new(FileCache::new(crate::config::CacheConfig {
                enabled: false,
                timeout_secs: -1,
                base_url: "http://localhost".to_string(),
                dir: std::env::temp_dir(),
            })),
            tasks: Arc::new(TaskStore::new(pool.clone())),
            admin: crate::config::AdminConfig::default(),
        };
        let mut config = Config::default();
        config.api_key = api_key.map(str::to_string);
        AppState::new(ctx, crate::request_log::RequestLog::new(pool), &config)
    }

    fn text_request(text: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "sora-image".to_string(),
            stream: false,
            messages: vec![ChatMessage { role: "user".to_string(), content: MessageContent::Text(text.to_string()) }],
        }
    }

    #[test]
    fn parse_request_extracts_plain_text_prompt() {
        let req = parse_request(text_request("a calm lake at dawn")).unwrap();
        assert_eq!(req.prompt, "a calm lake at dawn");
        assert!(req.image_b64.is_none());
        assert!(req.remix_target_id.is_none());
    }

    #[test]
    fn parse_request_joins_text_parts_and_decodes_image() {
        let body = ChatCompletionRequest {
            model: "sora-image".to_string(),
            stream: true,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: MessageContent::Parts(vec![
                    ContentPart::Text { text: "turn this into".to_string() },
                    ContentPart::Text { text: "a painting".to_string() },
                    ContentPart::ImageUrl { image_url: UrlPart { url: "data:image/png;base64,QUJD".to_string() } },
                ]),
            }],
        };
        let req = parse_request(body).unwrap();
        assert_eq!(req.prompt, "turn this into a painting");
        assert_eq!(req.image_b64.as_deref(), Some("QUJD"));
        assert!(req.stream);
    }

    #[test]
    fn parse_request_extracts_remix_share_id_from_prompt() {
        let req = parse_request(text_request("remix https://sora.chatgpt.com/p/s_0123456789abcdef0123456789abcdef")).unwrap();
        assert_eq!(req.remix_target_id.as_deref(), Some("s_0123456789abcdef0123456789abcdef"));
    }

    #[test]
    fn parse_request_rejects_messages_with_no_user_turn() {
        let body = ChatCompletionRequest {
            model: "sora-image".to_string(),
            stream: false,
            messages: vec![ChatMessage { role: "assistant".to_string(), content: MessageContent::Text("hi".to_string()) }],
        };
        let (status, _) = parse_request(body).unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn decode_data_url_extracts_base64_payload() {
        assert_eq!(decode_data_url("data:image/png;base64,QUJD"), Some("QUJD".to_string()));
    }

    #[test]
    fn decode_data_url_ignores_plain_urls() {
        assert_eq!(decode_data_url("https://example.com/cat.png"), None);
    }

    #[test]
    fn require_api_key_allows_any_caller_when_unset() {
        let state = test_state(None);
        assert!(require_api_key(&state, &HeaderMap::new()).is_ok());
    }

    #[test]
    fn require_api_key_rejects_missing_or_wrong_bearer() {
        let state = test_state(Some("secret"));
        assert!(require_api_key(&state, &HeaderMap::new()).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer wrong".parse().unwrap());
        assert!(require_api_key(&state, &headers).is_err());
    }

    #[test]
    fn require_api_key_accepts_matching_bearer() {
        let state = test_state(Some("secret"));
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer secret".parse().unwrap());
        assert!(require_api_key(&state, &headers).is_ok());
    }

    #[test]
    fn mime_guess_covers_known_extensions() {
        assert_eq!(mime_guess_from_extension("video.mp4"), "video/mp4");
        assert_eq!(mime_guess_from_extension("image.png"), "image/png");
        assert_eq!(mime_guess_from_extension("image.jpeg"), "image/jpeg");
        assert_eq!(mime_guess_from_extension("blob"), "application/octet-stream");
    }
}
