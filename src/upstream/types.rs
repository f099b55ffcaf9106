//! Wire DTOs for the upstream's generation, task, and profile endpoints.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Landscape,
    Portrait,
}

impl Orientation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Orientation::Landscape => "landscape",
            Orientation::Portrait => "portrait",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadResponse {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskCreatedResponse {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PendingTask {
    pub id: String,
    #[serde(default)]
    pub progress_pct: Option<f64>,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PendingTasksResponse {
    #[serde(default)]
    pub task_responses: Vec<PendingTask>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageTaskEntry {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub generations: Vec<ImageGeneration>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageGeneration {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub downloadable_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageTasksResponse {
    #[serde(default)]
    pub task_responses: Vec<ImageTaskEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VideoDraft {
    pub id: String,
    #[serde(default)]
    pub generation_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub downloadable_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VideoDraftsResponse {
    #[serde(default)]
    pub items: Vec<VideoDraft>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostResponse {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameoStatusResponse {
    pub status: String,
    #[serde(default)]
    pub username_hint: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserInfoResponse {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub sora2_available: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnhancePromptResponse {
    pub prompt: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamErrorBody {
    #[serde(default)]
    pub error: Option<UpstreamErrorDetail>,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamErrorDetail {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}
