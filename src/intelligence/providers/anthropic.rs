//! Anthropic messages API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{image_parts, status_error};
use crate::intelligence::{
    InferenceError, InferenceRequest, InferenceResponse, ModelAdapter, TokenUsage,
};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct AnthropicAdapter {
    client: reqwest::Client,
    name: String,
    model: String,
    api_key: Option<String>,
    base_url: String,
}

#[derive(Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct Message {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    model: Option<String>,
    content: Vec<ResponseBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

impl AnthropicAdapter {
    pub fn new(
        client: reqwest::Client,
        name: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        base_url: Option<String>,
    ) -> Self {
        Self {
            client,
            name: name.into(),
            model: model.into(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        }
    }

    fn key(&self) -> Result<&str, InferenceError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| InferenceError::MissingCredentials(self.name.clone()))
    }

    fn build_body(&self, request: &InferenceRequest) -> MessagesRequest {
        let mut content = Vec::new();
        if let Some(image) = request.image.as_deref() {
            let (media, data) = image_parts(image);
            content.push(ContentBlock::Image {
                source: ImageSource {
                    kind: "base64",
                    media_type: media.to_string(),
                    data: data.to_string(),
                },
            });
        }
        content.push(ContentBlock::Text {
            text: request.prompt.clone(),
        });

        MessagesRequest {
            model: self.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system: request.system_prompt.clone(),
            messages: vec![Message {
                role: "user",
                content,
            }],
            temperature: request.temperature,
        }
    }
}

#[async_trait]
impl ModelAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn has_credentials(&self) -> bool {
        self.api_key.is_some()
    }

    async fn health_check(&self) -> Result<(), InferenceError> {
        let resp = self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .header("x-api-key", self.key()?)
            .header("anthropic-version", API_VERSION)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(&self.name, resp).await);
        }
        Ok(())
    }

    async fn generate(&self, request: &InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", self.key()?)
            .header("anthropic-version", API_VERSION)
            .json(&self.build_body(request))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(&self.name, resp).await);
        }

        let body: MessagesResponse = resp.json().await?;
        let content: String = body
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");
        if content.is_empty() {
            return Err(InferenceError::InvalidResponse(
                "no text blocks in message".into(),
            ));
        }
        let usage = body
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
            })
            .unwrap_or_default();

        Ok(InferenceResponse {
            content,
            provider: self.name.clone(),
            model: body.model.unwrap_or_else(|| self.model.clone()),
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> AnthropicAdapter {
        AnthropicAdapter::new(
            reqwest::Client::new(),
            "anthropic",
            "claude-3-5-haiku-latest",
            Some("key".to_string()),
            None,
        )
    }

    #[test]
    fn test_body_shape() {
        let body = adapter().build_body(&InferenceRequest {
            prompt: "email".to_string(),
            system_prompt: Some("extract".to_string()),
            image: Some("data:image/jpeg;base64,QUJD".to_string()),
            max_tokens: None,
            temperature: Some(0.0),
        });
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["system"], "extract");
        assert_eq!(json["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(json["messages"][0]["content"][0]["type"], "image");
        assert_eq!(json["messages"][0]["content"][0]["source"]["media_type"], "image/jpeg");
        assert_eq!(json["messages"][0]["content"][1]["text"], "email");
    }

    #[test]
    fn test_response_joins_text_blocks() {
        let raw = r#"{"model": "m", "content": [
            {"type": "text", "text": "{\"a\":"},
            {"type": "text", "text": "1}"}
        ], "usage": {"input_tokens": 5, "output_tokens": 3}}"#;
        let parsed: MessagesResponse = serde_json::from_str(raw).unwrap();
        let joined: String = parsed
            .content
            .into_iter()
            .filter_map(|b| b.text)
            .collect();
        assert_eq!(joined, "{\"a\":1}");
    }
}
