//! Upstream HTTP client: every call the gateway makes against
//! the proprietary generation backend.

pub mod storyboard;
pub mod types;

use reqwest::{multipart, Client, Response, StatusCode};
use serde_json::json;
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::fingerprint::FingerprintProfile;
use crate::sentinel::SentinelToken;
pub use types::Orientation;
use types::*;

const CAMEO_SCRIPT_PATH: &str = "/project_y/cameos";

pub struct UpstreamClient {
    base_url: String,
}

impl UpstreamClient {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(
        &self,
        client: &Client,
        method: reqwest::Method,
        path: &str,
        access_token: &str,
        profile: &FingerprintProfile,
    ) -> reqwest::RequestBuilder {
        client
            .request(method, self.url(path))
            .bearer_auth(access_token)
            .headers(profile.header_map())
    }

    pub async fn get_user_info(&self, client: &Client, access_token: &str, profile: &FingerprintProfile) -> Result<UserInfoResponse> {
        let response = self
            .authed(client, reqwest::Method::GET, "/me", access_token, profile)
            .send()
            .await
            .map_err(|e| GatewayError::Upstream { status: 0, body: e.to_string() })?;
        parse_json(response).await
    }

    pub async fn upload_image(&self, client: &Client, access_token: &str, profile: &FingerprintProfile, bytes: Vec<u8>, file_name: &str) -> Result<String> {
        let form = multipart::Form::new()
            .part("file", multipart::Part::bytes(bytes).file_name(file_name.to_string()))
            .text("file_name", file_name.to_string());
        let response = self
            .authed(client, reqwest::Method::POST, "/uploads", access_token, profile)
            .multipart(form)
            .send()
            .await
            .map_err(|e| GatewayError::Upstream { status: 0, body: e.to_string() })?;
        parse_json::<UploadResponse>(response).await.map(|r| r.id)
    }

    pub async fn upload_character_video(&self, client: &Client, access_token: &str, profile: &FingerprintProfile, bytes: Vec<u8>, file_name: &str) -> Result<String> {
        let form = multipart::Form::new()
            .part("file", multipart::Part::bytes(bytes).file_name(file_name.to_string()))
            .text("use_case", "character".to_string());
        let response = self
            .authed(client, reqwest::Method::POST, "/characters/upload", access_token, profile)
            .multipart(form)
            .send()
            .await
            .map_err(|e| GatewayError::Upstream { status: 0, body: e.to_string() })?;
        parse_json::<UploadResponse>(response).await.map(|r| r.id)
    }

    pub async fn upload_character_image(&self, client: &Client, access_token: &str, profile: &FingerprintProfile, bytes: Vec<u8>, file_name: &str) -> Result<String> {
        let form = multipart::Form::new()
            .part("file", multipart::Part::bytes(bytes).file_name(file_name.to_string()))
            .text("timestamps", "[]".to_string());
        let response = self
            .authed(client, reqwest::Method::POST, "/project_y/file/upload", access_token, profile)
            .multipart(form)
            .send()
            .await
            .map_err(|e| GatewayError::Upstream { status: 0, body: e.to_string() })?;
        parse_json::<UploadResponse>(response).await.map(|r| r.id)
    }

    pub async fn generate_image(
        &self,
        client: &Client,
        access_token: &str,
        profile: &FingerprintProfile,
        prompt: &str,
        width: u32,
        height: u32,
        media_id: Option<&str>,
    ) -> Result<String> {
        let mut body = json!({
            "prompt": prompt,
            "width": width,
            "height": height,
        });
        if let Some(id) = media_id {
            body["media_id"] = json!(id);
        }
        let response = self
            .authed(client, reqwest::Method::POST, "/video_gen", access_token, profile)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Upstream { status: 0, body: e.to_string() })?;
        parse_json::<TaskCreatedResponse>(response).await.map(|r| r.id)
    }

    /// Generation submission through `/nf/create`: carries the sentinel header
    /// and validates the exact UA/device-id pair used when the token was minted.
    pub async fn generate_video(
        &self,
        client: &Client,
        access_token: &str,
        sentinel: &SentinelToken,
        prompt: &str,
        orientation: Orientation,
        n_frames: u32,
        media_id: Option<&str>,
    ) -> Result<String> {
        let body = json!({
            "prompt": prompt,
            "orientation": orientation.as_str(),
            "n_frames": n_frames,
            "media_id": media_id,
        });
        self.submit_nf_create(client, access_token, sentinel, "/nf/create", &body).await
    }

    pub async fn generate_storyboard(
        &self,
        client: &Client,
        access_token: &str,
        sentinel: &SentinelToken,
        formatted_prompt: &str,
        orientation: Orientation,
        n_frames: u32,
    ) -> Result<String> {
        let body = json!({
            "prompt": formatted_prompt,
            "orientation": orientation.as_str(),
            "n_frames": n_frames,
        });
        self.submit_nf_create(client, access_token, sentinel, "/nf/create/storyboard", &body).await
    }

    pub async fn remix_video(
        &self,
        client: &Client,
        access_token: &str,
        sentinel: &SentinelToken,
        target_id: &str,
        prompt: &str,
    ) -> Result<String> {
        let body = json!({
            "remix_target_id": target_id,
            "prompt": prompt,
        });
        self.submit_nf_create(client, access_token, sentinel, "/nf/create", &body).await
    }

    async fn submit_nf_create(
        &self,
        client: &Client,
        access_token: &str,
        sentinel: &SentinelToken,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<String> {
        let sentinel_header = serde_json::to_string(&json!({
            "p": sentinel.p,
            "t": sentinel.t,
            "c": sentinel.c,
            "id": sentinel.id,
            "flow": sentinel.flow,
        }))
        .map_err(|e| GatewayError::Internal(e.into()))?;

        let response = client
            .post(self.url(path))
            .bearer_auth(access_token)
            .header("oai-device-id", &sentinel.device_id)
            .header("openai-sentinel-chat-requirements-token", sentinel_header)
            .json(body)
            .send()
            .await
            .map_err(|e| GatewayError::Upstream { status: 0, body: e.to_string() })?;
        parse_json::<TaskCreatedResponse>(response).await.map(|r| r.id)
    }

    pub async fn get_pending_tasks(&self, client: &Client, access_token: &str, profile: &FingerprintProfile) -> Result<Vec<PendingTask>> {
        let response = self
            .authed(client, reqwest::Method::GET, "/nf/pending/v2", access_token, profile)
            .send()
            .await
            .map_err(|e| GatewayError::Upstream { status: 0, body: e.to_string() })?;
        parse_json::<PendingTasksResponse>(response).await.map(|r| r.task_responses)
    }

    pub async fn get_image_tasks(&self, client: &Client, access_token: &str, profile: &FingerprintProfile, limit: u32) -> Result<Vec<ImageTaskEntry>> {
        let path = format!("/v2/recent_tasks?limit={limit}");
        let response = self
            .authed(client, reqwest::Method::GET, &path, access_token, profile)
            .send()
            .await
            .map_err(|e| GatewayError::Upstream { status: 0, body: e.to_string() })?;
        parse_json::<ImageTasksResponse>(response).await.map(|r| r.task_responses)
    }

    pub async fn get_video_drafts(&self, client: &Client, access_token: &str, profile: &FingerprintProfile, limit: u32) -> Result<Vec<VideoDraft>> {
        let path = format!("/project_y/profile/drafts?limit={limit}");
        let response = self
            .authed(client, reqwest::Method::GET, &path, access_token, profile)
            .send()
            .await
            .map_err(|e| GatewayError::Upstream { status: 0, body: e.to_string() })?;
        parse_json::<VideoDraftsResponse>(response).await.map(|r| r.items)
    }

    pub async fn post_video_for_watermark_free(&self, client: &Client, access_token: &str, profile: &FingerprintProfile, generation_id: &str, prompt: &str) -> Result<String> {
        let body = json!({ "generation_id": generation_id, "prompt": prompt });
        let response = self
            .authed(client, reqwest::Method::POST, "/project_y/post", access_token, profile)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Upstream { status: 0, body: e.to_string() })?;
        parse_json::<PostResponse>(response).await.map(|r| r.id)
    }

    pub async fn delete_post(&self, client: &Client, access_token: &str, profile: &FingerprintProfile, post_id: &str) -> Result<()> {
        let path = format!("/project_y/post/{post_id}");
        let response = self
            .authed(client, reqwest::Method::DELETE, &path, access_token, profile)
            .send()
            .await
            .map_err(|e| GatewayError::Upstream { status: 0, body: e.to_string() })?;
        discard(response).await
    }

    /// Resolve the watermark-free URL either by synthesizing the known
    /// third-party CDN path or POSTing to an operator-configured parser.
    pub async fn get_watermark_free_url_custom(
        &self,
        client: &Client,
        parse_url: Option<&str>,
        share_url: &str,
        token: &str,
        post_id: &str,
    ) -> Result<String> {
        match parse_url {
            None => Ok(format!("https://sora-video-cdn.example.com/MP4/{post_id}.mp4")),
            Some(endpoint) => {
                let response = client
                    .post(endpoint)
                    .json(&json!({ "url": share_url, "token": token }))
                    .send()
                    .await
                    .map_err(|e| GatewayError::Cache(e.to_string()))?;
                #[derive(serde::Deserialize)]
                struct ParseResponse {
                    url: String,
                }
                let parsed: ParseResponse = response
                    .json()
                    .await
                    .map_err(|e| GatewayError::Cache(e.to_string()))?;
                Ok(parsed.url)
            }
        }
    }

    pub async fn get_cameo_status(&self, client: &Client, access_token: &str, profile: &FingerprintProfile, cameo_id: &str) -> Result<CameoStatusResponse> {
        let path = format!("{CAMEO_SCRIPT_PATH}/in_progress/{cameo_id}");
        let response = self
            .authed(client, reqwest::Method::GET, &path, access_token, profile)
            .send()
            .await
            .map_err(|e| GatewayError::Upstream { status: 0, body: e.to_string() })?;
        parse_json(response).await
    }

    pub async fn finalize_character(&self, client: &Client, access_token: &str, profile: &FingerprintProfile, cameo_id: &str, avatar_media_id: &str) -> Result<String> {
        let body = json!({ "cameo_id": cameo_id, "avatar_media_id": avatar_media_id });
        let response = self
            .authed(client, reqwest::Method::POST, "/characters/finalize", access_token, profile)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Upstream { status: 0, body: e.to_string() })?;
        parse_json::<UploadResponse>(response).await.map(|r| r.id)
    }

    pub async fn set_character_public(&self, client: &Client, access_token: &str, profile: &FingerprintProfile, character_id: &str, public: bool) -> Result<()> {
        let path = format!("{CAMEO_SCRIPT_PATH}/by_id/{character_id}/update_v2");
        let response = self
            .authed(client, reqwest::Method::POST, &path, access_token, profile)
            .json(&json!({ "is_public": public }))
            .send()
            .await
            .map_err(|e| GatewayError::Upstream { status: 0, body: e.to_string() })?;
        discard(response).await
    }

    pub async fn delete_character(&self, client: &Client, access_token: &str, profile: &FingerprintProfile, character_id: &str) -> Result<()> {
        let path = format!("/project_y/characters/{character_id}");
        let response = self
            .authed(client, reqwest::Method::DELETE, &path, access_token, profile)
            .send()
            .await
            .map_err(|e| GatewayError::Upstream { status: 0, body: e.to_string() })?;
        discard(response).await
    }

    pub async fn enhance_prompt(&self, client: &Client, access_token: &str, profile: &FingerprintProfile, prompt: &str) -> Result<String> {
        let response = self
            .authed(client, reqwest::Method::POST, "/editor/enhance_prompt", access_token, profile)
            .json(&json!({ "prompt": prompt }))
            .send()
            .await
            .map_err(|e| GatewayError::Upstream { status: 0, body: e.to_string() })?;
        parse_json::<EnhancePromptResponse>(response).await.map(|r| r.prompt)
    }
}

/// Classify a non-2xx response and surface the typed failure it maps to:
/// recognized error codes become dedicated variants, anything else becomes
/// a generic upstream error carrying status and body.
async fn parse_json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        let body = response.text().await.map_err(|e| GatewayError::Upstream { status: status.as_u16(), body: e.to_string() })?;
        return serde_json::from_str(&body).map_err(|e| GatewayError::Internal(anyhow::anyhow!("decoding upstream response: {e}; body={body}")));
    }
    Err(classify_error(status, response.text().await.unwrap_or_default()))
}

async fn discard(response: Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    Err(classify_error(status, response.text().await.unwrap_or_default()))
}

fn classify_error(status: StatusCode, body: String) -> GatewayError {
    if status == StatusCode::UNAUTHORIZED {
        return GatewayError::Auth(body);
    }
    if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
        return GatewayError::UpstreamUnavailable { status: status.as_u16(), body };
    }
    if let Ok(parsed) = serde_json::from_str::<UpstreamErrorBody>(&body) {
        if let Some(code) = parsed.error.as_ref().and_then(|e| e.code.as_deref()) {
            if code == "unsupported_country_code" {
                return GatewayError::CountryUnsupported(
                    parsed.error.and_then(|e| e.message).unwrap_or_else(|| "country not supported".to_string()),
                );
            }
        }
    }
    GatewayError::Upstream { status: status.as_u16(), body }
}

/// A device id derived from (or generated alongside) the sentinel token, used
/// both to mint the token and to authenticate `/nf/create` calls against it.
pub fn new_device_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_401_as_auth_error() {
        let err = classify_error(StatusCode::UNAUTHORIZED, "expired".to_string());
        assert_eq!(err.kind(), "auth_error");
    }

    #[test]
    fn classifies_403_and_429_as_upstream_unavailable() {
        assert_eq!(classify_error(StatusCode::FORBIDDEN, String::new()).kind(), "upstream_unavailable");
        assert_eq!(classify_error(StatusCode::TOO_MANY_REQUESTS, String::new()).kind(), "upstream_unavailable");
    }

    #[test]
    fn classifies_unsupported_country_code() {
        let body = json!({ "error": { "code": "unsupported_country_code", "message": "not available here" } }).to_string();
        let err = classify_error(StatusCode::BAD_REQUEST, body);
        assert_eq!(err.kind(), "country_unsupported");
    }

    #[test]
    fn falls_back_to_generic_upstream_error() {
        let err = classify_error(StatusCode::INTERNAL_SERVER_ERROR, "boom".to_string());
        assert_eq!(err.kind(), "upstream_error");
    }
}
