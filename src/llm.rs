//! Chat-completion client with schema-constrained JSON output.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::OpenAiConfig;
use crate::error::AppError;
use crate::types::{RelevanceTag, StepId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A stateless text-in, JSON-text-out oracle.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Returns the raw text of the model's reply.
    async fn complete(&self, turns: &[ChatTurn]) -> Result<String, AppError>;
}

/// JSON schema of the extraction result the model must return.
pub fn extraction_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "step_id": {
                "type": "string",
                "enum": StepId::ALL.iter().map(|step| step.as_str()).collect::<Vec<_>>()
            },
            "lead": {
                "type": "object",
                "properties": {
                    "email": { "type": "string" },
                    "companyName": { "type": "string" },
                    "companyInfo": { "type": "string" },
                    "relevanceTag": {
                        "type": "string",
                        "enum": RelevanceTag::ALL.iter().map(|tag| tag.as_str()).collect::<Vec<_>>()
                    }
                },
                "required": ["email", "companyName", "companyInfo", "relevanceTag"],
                "additionalProperties": false
            },
            "botMessage": { "type": "string" }
        },
        "required": ["step_id", "lead", "botMessage"],
        "additionalProperties": false
    })
}

pub struct OpenAiModel {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
}

impl OpenAiModel {
    pub fn new(client: reqwest::Client, config: &OpenAiConfig) -> Result<Self, AppError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| AppError::Config("OPENAI_API_KEY not configured".to_string()))?;
        Ok(Self {
            client,
            api_key,
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    fn request_body(&self, turns: &[ChatTurn]) -> Value {
        json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": turns,
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": "lead_qualification",
                    "description": "Schema for lead qualification assistant",
                    "schema": extraction_schema(),
                    "strict": true
                }
            }
        })
    }
}

fn content_from_payload(payload: &Value) -> Option<String> {
    payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|msg| msg.get("content"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    async fn complete(&self, turns: &[ChatTurn]) -> Result<String, AppError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.request_body(turns))
            .send()
            .await
            .map_err(|err| AppError::Provider {
                message: "openai request failed".to_string(),
                source: Some(Box::new(err)),
            })?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::provider(format!("openai returned {status}: {body}")));
        }
        let payload = response
            .json::<Value>()
            .await
            .map_err(|err| AppError::Provider {
                message: "openai parse failed".to_string(),
                source: Some(Box::new(err)),
            })?;
        content_from_payload(&payload)
            .ok_or_else(|| AppError::provider("openai response had empty content"))
    }
}
