//! OpenAI-compatible chat completions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{image_parts, status_error};
use crate::intelligence::{
    InferenceError, InferenceRequest, InferenceResponse, ModelAdapter, TokenUsage,
};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiAdapter {
    client: reqwest::Client,
    name: String,
    model: String,
    api_key: Option<String>,
    base_url: String,
}

impl OpenAiAdapter {
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

    fn build_body(&self, request: &InferenceRequest) -> ChatRequest {
        let mut messages = Vec::new();
        if let Some(system) = request.system_prompt.as_deref() {
            messages.push(json!({"role": "system", "content": system}));
        }
        let user_content = match request.image.as_deref() {
            Some(image) => {
                let (media, data) = image_parts(image);
                json!([
                    {"type": "text", "text": request.prompt},
                    {"type": "image_url", "image_url": {"url": format!("data:{media};base64,{data}")}}
                ])
            }
            None => Value::String(request.prompt.clone()),
        };
        messages.push(json!({"role": "user", "content": user_content}));

        ChatRequest {
            model: self.model.clone(),
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[async_trait]
impl ModelAdapter for OpenAiAdapter {
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
            .get(format!("{}/models", self.base_url))
            .bearer_auth(self.key()?)
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
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.key()?)
            .json(&self.build_body(request))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(&self.name, resp).await);
        }

        let body: ChatResponse = resp.json().await?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| InferenceError::InvalidResponse("no choices in completion".into()))?;
        let usage = body
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
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

    fn adapter(key: Option<&str>) -> OpenAiAdapter {
        OpenAiAdapter::new(
            reqwest::Client::new(),
            "openai",
            "gpt-4o-mini",
            key.map(|k| k.to_string()),
            Some("http://localhost:1/v1/".to_string()),
        )
    }

    #[test]
    fn test_blank_key_means_no_credentials() {
        assert!(!adapter(Some("  ")).has_credentials());
        assert!(adapter(Some("sk-test")).has_credentials());
    }

    #[test]
    fn test_body_includes_system_and_image() {
        let body = adapter(Some("sk")).build_body(&InferenceRequest {
            prompt: "email text".to_string(),
            system_prompt: Some("extract".to_string()),
            image: Some("AAAA".to_string()),
            max_tokens: Some(256),
            temperature: None,
        });
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"][1]["image_url"]["url"], "data:image/png;base64,AAAA");
        assert_eq!(json["max_tokens"], 256);
        assert!(json.get("temperature").is_none());
    }

    #[test]
    fn test_response_parsing() {
        let raw = r#"{"model": "gpt-4o-mini-2024", "choices": [{"message": {"role": "assistant", "content": "{}"}}],
                      "usage": {"prompt_tokens": 10, "completion_tokens": 2}}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("{}"));
        assert_eq!(parsed.usage.unwrap().completion_tokens, 2);
    }

    #[tokio::test]
    async fn test_generate_without_key_fails_fast() {
        let err = adapter(None)
            .generate(&InferenceRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::MissingCredentials(_)));
    }
}
