use crate::error::{LlmError, Result};
use crate::types::{Role, Turn};
use serde::{Deserialize, Serialize};

const GEMINI_API_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Prior turns sent for context; pairs of user/model messages.
const MAX_CONTEXT_TURNS: usize = 20;
const MAX_OUTPUT_TOKENS: u32 = 500;

#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_base_url: String,
    api_key: String,
    model: String,
}

impl GeminiClient {
    pub fn new(api_key: &str, model: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self {
            http,
            api_base_url: GEMINI_API_BASE_URL.to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    pub fn with_api_base_url(mut self, api_base_url: &str) -> Self {
        self.api_base_url = api_base_url.trim().trim_end_matches('/').to_string();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Generate a reply for `user_message` given a system context and the
    /// trailing conversation history.
    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model))]
    pub async fn complete(
        &self,
        system_context: &str,
        history: &[Turn],
        user_message: &str,
    ) -> Result<String> {
        if user_message.trim().is_empty() {
            return Err(LlmError::InvalidInput("user message is empty".to_string()));
        }

        let req = GeminiRequest::new(system_context, history, user_message);
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.api_base_url, self.model
        );

        let response = self
            .http
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Http(format!(
                "gemini generateContent status={status} body={body}"
            )));
        }

        let parsed: GeminiResponse = serde_json::from_str(&body)?;
        extract_reply_text(&parsed)
    }
}

fn extract_reply_text(response: &GeminiResponse) -> Result<String> {
    let text = response
        .candidates
        .first()
        .and_then(|candidate| candidate.content.as_ref())
        .map(|content| {
            content
                .parts
                .iter()
                .filter_map(|part| part.text.as_deref())
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err(LlmError::ResponseFormat(
            "gemini response contained no candidate text".to_string(),
        ));
    }
    Ok(text)
}

fn wire_role(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        // Gemini names the assistant role "model".
        Role::Assistant => "model",
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    system_instruction: GeminiContent,
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

impl GeminiRequest {
    fn new(system_context: &str, history: &[Turn], user_message: &str) -> Self {
        let tail_start = history.len().saturating_sub(MAX_CONTEXT_TURNS);
        let mut contents: Vec<GeminiContent> = history[tail_start..]
            .iter()
            .filter(|turn| !turn.text.trim().is_empty())
            .map(|turn| GeminiContent::text(Some(wire_role(turn.role)), &turn.text))
            .collect();
        contents.push(GeminiContent::text(Some("user"), user_message));

        Self {
            system_instruction: GeminiContent::text(None, system_context),
            contents,
            generation_config: GeminiGenerationConfig {
                max_output_tokens: MAX_OUTPUT_TOKENS,
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<GeminiPart>,
}

impl GeminiContent {
    fn text(role: Option<&str>, text: &str) -> Self {
        Self {
            role: role.map(ToOwned::to_owned),
            parts: vec![GeminiPart {
                text: Some(text.to_string()),
            }],
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct GeminiPart {
    text: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    max_output_tokens: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GeminiResponse {
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}
