use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::Config;

const TOKEN_TTL: Duration = Duration::from_secs(45 * 60);

// ── Wire types (Vertex AI generateContent) ──

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    /// Base64 payload.
    pub data: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
}

impl GenerateRequest {
    /// Single user turn carrying only a text prompt.
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            contents: vec![Content {
                role: Some("user".into()),
                parts: vec![Part {
                    text: Some(prompt.into()),
                    inline_data: None,
                }],
            }],
            generation_config: None,
        }
    }

    /// User turn with a prompt and inline attachments, asking for text and image output.
    pub fn image(prompt: impl Into<String>, attachments: Vec<InlineData>) -> Self {
        let mut parts = vec![Part {
            text: Some(prompt.into()),
            inline_data: None,
        }];
        parts.extend(attachments.into_iter().map(|a| Part {
            text: None,
            inline_data: Some(a),
        }));
        Self {
            contents: vec![Content {
                role: Some("user".into()),
                parts,
            }],
            generation_config: Some(GenerationConfig {
                response_modalities: vec!["TEXT".into(), "IMAGE".into()],
            }),
        }
    }
}

/// Outcome of walking candidates → content → parts → text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextAnswer {
    NoCandidate,
    NoContent,
    NoText,
    Text(String),
}

impl GenerateResponse {
    pub fn text_answer(&self) -> TextAnswer {
        let Some(candidate) = self.candidates.first() else {
            return TextAnswer::NoCandidate;
        };
        let Some(content) = &candidate.content else {
            return TextAnswer::NoContent;
        };
        match content.parts.iter().find_map(|p| p.text.as_ref()) {
            Some(text) => TextAnswer::Text(text.clone()),
            None => TextAnswer::NoText,
        }
    }

    /// First inline image in the first candidate, if any.
    pub fn inline_image(&self) -> Option<&InlineData> {
        self.candidates
            .first()?
            .content
            .as_ref()?
            .parts
            .iter()
            .find_map(|p| p.inline_data.as_ref())
    }
}

// ── Client ──

#[async_trait]
pub trait GenerativeModel: Send + Sync {
    async fn generate(&self, model: &str, request: &GenerateRequest) -> Result<GenerateResponse>;
}

pub struct VertexClient {
    client: reqwest::Client,
    config: Config,
    token: AccessToken,
}

impl VertexClient {
    pub fn new(config: &Config, access_token: Option<String>) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            config: config.clone(),
            token: AccessToken::new(access_token),
        })
    }
}

#[async_trait]
impl GenerativeModel for VertexClient {
    async fn generate(&self, model: &str, request: &GenerateRequest) -> Result<GenerateResponse> {
        let token = self.token.get().await?;
        let url = self.config.endpoint(model);
        debug!("POST {}", url);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            // Status code and body stay in the message; callers classify on them.
            bail!(
                "{} request failed with status {}: {}",
                model,
                status.as_u16(),
                body.trim()
            );
        }

        resp.json::<GenerateResponse>()
            .await
            .with_context(|| format!("Malformed {} response", model))
    }
}

/// OAuth bearer token: a fixed one if configured, else `gcloud auth print-access-token`.
struct AccessToken {
    fixed: Option<String>,
    cached: Mutex<Option<(String, Instant)>>,
}

impl AccessToken {
    fn new(fixed: Option<String>) -> Self {
        Self {
            fixed: fixed.filter(|t| !t.trim().is_empty()),
            cached: Mutex::new(None),
        }
    }

    async fn get(&self) -> Result<String> {
        if let Some(token) = &self.fixed {
            return Ok(token.clone());
        }

        let mut cached = self.cached.lock().await;
        if let Some((token, fetched_at)) = cached.as_ref() {
            if fetched_at.elapsed() < TOKEN_TTL {
                return Ok(token.clone());
            }
        }

        let out = tokio::process::Command::new("gcloud")
            .args(["auth", "print-access-token"])
            .output()
            .await
            .context("Failed to run gcloud; set GOOGLE_ACCESS_TOKEN instead")?;
        if !out.status.success() {
            bail!(
                "gcloud auth print-access-token failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        let token = String::from_utf8(out.stdout)?.trim().to_string();
        *cached = Some((token.clone(), Instant::now()));
        Ok(token)
    }
}
