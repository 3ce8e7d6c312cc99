//! Concrete [`ModelAdapter`](super::ModelAdapter) backends.

pub mod anthropic;
pub mod mock;
pub mod openai;

pub use anthropic::AnthropicAdapter;
pub use mock::MockAdapter;
pub use openai::OpenAiAdapter;

use super::InferenceError;

/// Turn a non-2xx provider response into a typed error, keeping a short
/// slice of the body for the audit trail.
async fn status_error(provider: &str, resp: reqwest::Response) -> InferenceError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    InferenceError::ProviderStatus {
        provider: provider.to_string(),
        status,
        message: crate::util::truncate_chars(&body, 500).to_string(),
    }
}

/// Split a `data:` URL or bare base64 into `(media_type, data)`.
fn image_parts(image: &str) -> (&str, &str) {
    if let Some(rest) = image.strip_prefix("data:") {
        if let Some((media, data)) = rest.split_once(";base64,") {
            return (media, data);
        }
    }
    ("image/png", image)
}
