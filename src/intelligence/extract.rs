//! Email → transaction extraction.
//!
//! One call per email: build the prompt, ask the mock adapter or the
//! provider chain (depending on the resolved mode), then parse and
//! normalize the JSON answer. Failures come back as [`ExtractionFailure`]
//! values for the orchestrator to turn into rejection records; nothing here
//! retries.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use super::providers::MockAdapter;
use super::{ExtractionMode, InferenceError, InferenceManager, InferenceRequest, ModelAdapter};
use crate::db::DbStoredEmail;

/// Tag written on every transaction row.
pub const EXTRACTION_VERSION: &str = "txn-extract/2";

pub const DEFAULT_CURRENCY: &str = "INR";

/// Body characters sent to the model.
const MAX_BODY_CHARS: usize = 8_000;
const MAX_OUTPUT_TOKENS: u32 = 512;

const SYSTEM_PROMPT: &str = r#"You extract financial transactions from bank, card and payment notification emails.
Reply with exactly one JSON object and nothing else.

If the email does not describe a completed money movement, reply {"is_transaction": false}.

Otherwise reply:
{
  "is_transaction": true,
  "amount": <positive number, no currency symbol>,
  "currency": "<ISO 4217 code, e.g. INR, USD>",
  "direction": "debit" | "credit",
  "merchant": "<counterparty as written>",
  "category": "<food|transport|shopping|entertainment|utilities|income|transfer|uncategorized>",
  "occurred_at": "<RFC 3339 timestamp or YYYY-MM-DD, if stated>",
  "reference_id": "<bank/UPI reference if present>",
  "location": "<city or place if present>",
  "confidence": <0.0 to 1.0>,
  "notes": "<short remark, optional>"
}
Omit fields you cannot find. Never guess an amount."#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Debit,
    Credit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Debit => "debit",
            Direction::Credit => "credit",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "debit" | "debited" | "withdrawal" | "purchase" | "payment" | "dr" => {
                Some(Direction::Debit)
            }
            "credit" | "credited" | "deposit" | "refund" | "cr" => Some(Direction::Credit),
            _ => None,
        }
    }

    /// Debits are stored negative, credits positive.
    pub fn signed(&self, amount: f64) -> f64 {
        match self {
            Direction::Debit => -amount.abs(),
            Direction::Credit => amount.abs(),
        }
    }
}

/// What the engine sees of one stored email.
#[derive(Debug, Clone, Default)]
pub struct ExtractionInput {
    pub subject: String,
    pub sender: String,
    pub body: String,
    pub snippet: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl ExtractionInput {
    pub fn from_email(email: &DbStoredEmail) -> Self {
        Self {
            subject: email.subject.clone(),
            sender: email.sender.clone(),
            body: email.body_text.clone(),
            snippet: Some(email.snippet.clone()).filter(|s| !s.trim().is_empty()),
            timestamp: (email.internal_date > 0)
                .then(|| Utc.timestamp_millis_opt(email.internal_date).single())
                .flatten(),
        }
    }

    fn text(&self) -> Option<&str> {
        let body = self.body.trim();
        if !body.is_empty() {
            return Some(body);
        }
        self.snippet
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// A normalized transaction ready to persist.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedTransaction {
    pub occurred_at: DateTime<Utc>,
    /// Signed by direction.
    pub amount: f64,
    pub currency: String,
    pub direction: Direction,
    pub merchant_raw: String,
    pub merchant_normalized: String,
    pub category: String,
    pub reference_id: Option<String>,
    pub location: Option<String>,
    /// Always within [0, 1].
    pub confidence: f64,
    pub extraction_version: String,
    pub notes: Option<String>,
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    EmptyBody,
    MalformedOutput,
    Timeout,
    ProviderError,
    NoProvider,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::EmptyBody => "empty_body",
            FailureKind::MalformedOutput => "malformed_output",
            FailureKind::Timeout => "timeout",
            FailureKind::ProviderError => "provider_error",
            FailureKind::NoProvider => "no_provider",
        }
    }
}

#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{} ({})", .message, .kind.as_str())]
pub struct ExtractionFailure {
    pub kind: FailureKind,
    pub message: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub elapsed_ms: u64,
    pub extraction_version: &'static str,
}

impl ExtractionFailure {
    fn new(kind: FailureKind, message: impl Into<String>, started: Instant) -> Self {
        Self {
            kind,
            message: message.into(),
            provider: None,
            model: None,
            elapsed_ms: started.elapsed().as_millis() as u64,
            extraction_version: EXTRACTION_VERSION,
        }
    }

    fn served_by(mut self, provider: &str, model: &str) -> Self {
        self.provider = Some(provider.to_string());
        self.model = Some(model.to_string());
        self
    }

    fn attempted(self, target: Option<&(String, String)>) -> Self {
        match target {
            Some((provider, model)) => self.served_by(provider, model),
            None => self,
        }
    }

    /// JSON stored in `rejections.error_detail`.
    pub fn to_detail(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({"kind": self.kind.as_str()}))
    }
}

/// Loose shape of the model's answer; every field optional.
#[derive(Debug, Default, Deserialize)]
struct RawExtraction {
    #[serde(default)]
    is_transaction: Option<bool>,
    #[serde(default)]
    amount: Option<serde_json::Value>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    direction: Option<String>,
    #[serde(default, alias = "merchant_raw")]
    merchant: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default, alias = "date", alias = "timestamp")]
    occurred_at: Option<String>,
    #[serde(default)]
    reference_id: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    notes: Option<String>,
}

pub struct ExtractionEngine {
    manager: Arc<InferenceManager>,
    mock: Arc<dyn ModelAdapter>,
    timeout: Duration,
}

impl ExtractionEngine {
    pub fn new(manager: Arc<InferenceManager>, timeout: Duration) -> Self {
        Self {
            manager,
            mock: Arc::new(MockAdapter::new()),
            timeout,
        }
    }

    pub fn manager(&self) -> &Arc<InferenceManager> {
        &self.manager
    }

    fn build_request(input: &ExtractionInput, text: &str) -> InferenceRequest {
        let mut prompt = format!("Subject: {}\nSender: {}\n", input.subject, input.sender);
        if let Some(ts) = input.timestamp {
            prompt.push_str(&format!("Received: {}\n", ts.to_rfc3339()));
        }
        prompt.push('\n');
        prompt.push_str(crate::util::truncate_chars(text, MAX_BODY_CHARS));

        InferenceRequest {
            prompt,
            system_prompt: Some(SYSTEM_PROMPT.to_string()),
            image: None,
            max_tokens: Some(MAX_OUTPUT_TOKENS),
            temperature: Some(0.0),
        }
    }

    /// Extract one transaction. `mode` is resolved by the caller from
    /// runtime settings.
    pub async fn extract(
        &self,
        input: &ExtractionInput,
        mode: ExtractionMode,
    ) -> Result<ExtractedTransaction, ExtractionFailure> {
        let started = Instant::now();
        let Some(text) = input.text() else {
            return Err(ExtractionFailure::new(
                FailureKind::EmptyBody,
                "email has no body or snippet",
                started,
            ));
        };
        let request = Self::build_request(input, text);

        // Provider a timeout or bare error is charged to.
        let target = match mode {
            ExtractionMode::Mock => Some((
                self.mock.name().to_string(),
                self.mock.model().to_string(),
            )),
            ExtractionMode::Real => self.manager.default_provider(),
        };
        let call = async {
            match mode {
                ExtractionMode::Mock => self.mock.generate(&request).await,
                ExtractionMode::Real => self.manager.generate(&request).await,
            }
        };
        let response = match tokio::time::timeout(self.timeout, call).await {
            Err(_) => {
                return Err(ExtractionFailure::new(
                    FailureKind::Timeout,
                    format!("inference exceeded {}s", self.timeout.as_secs()),
                    started,
                )
                .attempted(target.as_ref()))
            }
            Ok(Err(InferenceError::NoProvider)) => {
                return Err(ExtractionFailure::new(
                    FailureKind::NoProvider,
                    InferenceError::NoProvider.to_string(),
                    started,
                ))
            }
            Ok(Err(e)) => {
                let failure =
                    ExtractionFailure::new(FailureKind::ProviderError, e.to_string(), started);
                let last = match &e {
                    InferenceError::AllProvidersFailed { attempts } => attempts.last(),
                    _ => None,
                };
                return Err(match last {
                    Some(attempt) => failure.served_by(&attempt.provider, &attempt.model),
                    None => failure.attempted(target.as_ref()),
                });
            }
            Ok(Ok(response)) => response,
        };

        log::debug!(
            "inference: {} / {} answered in {}ms",
            response.provider,
            response.model,
            started.elapsed().as_millis()
        );

        parse_extraction(&response.content, input.timestamp).map(|parsed| ExtractedTransaction {
            provider: response.provider.clone(),
            model: response.model.clone(),
            ..parsed
        })
        .map_err(|message| {
            ExtractionFailure::new(FailureKind::MalformedOutput, message, started)
                .served_by(&response.provider, &response.model)
        })
    }
}

/// Parse a model answer into a normalized transaction. `provider`/`model`
/// are left empty for the caller to fill in.
pub fn parse_extraction(
    content: &str,
    fallback_time: Option<DateTime<Utc>>,
) -> Result<ExtractedTransaction, String> {
    let json = extract_json_from_response(content)
        .ok_or_else(|| "no JSON object in model output".to_string())?;
    let raw: RawExtraction =
        serde_json::from_str(json).map_err(|e| format!("model output is not valid JSON: {e}"))?;

    if raw.is_transaction == Some(false) {
        return Err("not a transaction".to_string());
    }

    let amount = raw
        .amount
        .as_ref()
        .and_then(parse_amount)
        .ok_or_else(|| "missing or unreadable amount".to_string())?;
    if amount == 0.0 {
        return Err("amount is zero".to_string());
    }

    let direction = match raw.direction.as_deref().and_then(Direction::parse) {
        Some(d) => d,
        None if amount > 0.0 && raw.direction.is_none() => Direction::Debit,
        None if amount < 0.0 => Direction::Debit,
        None => {
            return Err(format!(
                "unknown direction '{}'",
                raw.direction.unwrap_or_default()
            ))
        }
    };

    let currency = raw
        .currency
        .map(|c| c.trim().to_uppercase())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());

    let merchant_raw = raw.merchant.unwrap_or_default().trim().to_string();
    let occurred_at = raw
        .occurred_at
        .as_deref()
        .and_then(parse_occurred_at)
        .or(fallback_time)
        .unwrap_or_else(Utc::now);

    Ok(ExtractedTransaction {
        occurred_at,
        amount: direction.signed(amount),
        currency,
        direction,
        merchant_normalized: normalize_merchant(&merchant_raw),
        merchant_raw,
        category: raw
            .category
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| "uncategorized".to_string()),
        reference_id: non_empty(raw.reference_id),
        location: non_empty(raw.location),
        confidence: clamp_confidence(raw.confidence.unwrap_or(0.5)),
        extraction_version: EXTRACTION_VERSION.to_string(),
        notes: non_empty(raw.notes),
        provider: String::new(),
        model: String::new(),
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn re_amount_digits() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[0-9][0-9,]*(?:\.[0-9]+)?").unwrap())
}

/// Numbers pass through. Strings like "Rs. 1,250", "INR 1,250.00" or
/// "-₹99" yield their first number; a leading '-' makes it negative.
fn parse_amount(value: &serde_json::Value) -> Option<f64> {
    let amount = match value {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => {
            let found = re_amount_digits().find(s)?;
            let magnitude: f64 = found.as_str().replace(',', "").parse().ok()?;
            let prefix = s[..found.start()].trim();
            if prefix.starts_with('-') || prefix.ends_with('-') {
                -magnitude
            } else {
                magnitude
            }
        }
        _ => return None,
    };
    amount.is_finite().then_some(amount)
}

fn parse_occurred_at(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// NFKD, strip marks, lowercase, keep alphanumerics.
pub fn normalize_merchant(raw: &str) -> String {
    raw.nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// Extract a JSON object from model text that may carry code fences or
/// surrounding prose.
pub(crate) fn extract_json_from_response(response: &str) -> Option<&str> {
    if let Some(start) = response.find("```json") {
        let json_start = start + 7;
        if let Some(end) = response[json_start..].find("```") {
            return Some(response[json_start..json_start + end].trim());
        }
    }
    if let Some(start) = response.find("```") {
        let after_fence = start + 3;
        if let Some(nl) = response[after_fence..].find('\n') {
            let json_start = after_fence + nl + 1;
            if let Some(end) = response[json_start..].find("```") {
                let candidate = response[json_start..json_start + end].trim();
                if candidate.starts_with('{') {
                    return Some(candidate);
                }
            }
        }
    }

    let start = response.find('{')?;
    let candidate = &response[start..];
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;
    for (i, ch) in candidate.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        if ch == '\\' && in_string {
            escape = true;
            continue;
        }
        if ch == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&candidate[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intelligence::manager::fakes::ScriptedAdapter;

    fn engine_with(providers: Vec<Arc<dyn ModelAdapter>>) -> ExtractionEngine {
        ExtractionEngine::new(
            Arc::new(InferenceManager::new(providers, None)),
            Duration::from_secs(5),
        )
    }

    fn input(body: &str) -> ExtractionInput {
        ExtractionInput {
            subject: "Alert".to_string(),
            sender: "bank@example.com".to_string(),
            body: body.to_string(),
            snippet: None,
            timestamp: Some(Utc.with_ymd_and_hms(2026, 3, 12, 9, 30, 0).unwrap()),
        }
    }

    #[test]
    fn test_extract_json_with_fence_and_prose() {
        let text = "Here you go:\n```json\n{\"amount\": 5}\n```\nthanks";
        assert_eq!(extract_json_from_response(text), Some("{\"amount\": 5}"));
        let embedded = "Sure! {\"a\": {\"b\": \"}\"}} trailing";
        assert_eq!(extract_json_from_response(embedded), Some("{\"a\": {\"b\": \"}\"}}"));
        assert_eq!(extract_json_from_response("no json here"), None);
    }

    #[test]
    fn test_parse_normalizes_fields() {
        let txn = parse_extraction(
            r#"{"is_transaction": true, "amount": "1,250.50", "currency": "inr",
                "direction": "debit", "merchant": "Café Mocha", "confidence": 1.7,
                "occurred_at": "2026-03-10"}"#,
            None,
        )
        .unwrap();
        assert_eq!(txn.amount, -1250.5);
        assert_eq!(txn.currency, "INR");
        assert_eq!(txn.merchant_normalized, "cafemocha");
        assert_eq!(txn.confidence, 1.0);
        assert_eq!(txn.occurred_at.date_naive().to_string(), "2026-03-10");
        assert_eq!(txn.extraction_version, EXTRACTION_VERSION);
    }

    #[test]
    fn test_parse_credit_positive_and_defaults() {
        let fallback = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let txn = parse_extraction(
            r#"{"amount": 40, "direction": "credit", "confidence": -3}"#,
            Some(fallback),
        )
        .unwrap();
        assert_eq!(txn.amount, 40.0);
        assert_eq!(txn.currency, "INR");
        assert_eq!(txn.category, "uncategorized");
        assert_eq!(txn.confidence, 0.0);
        assert_eq!(txn.occurred_at, fallback);
    }

    #[test]
    fn test_string_amounts_with_currency_prefix() {
        let amount = |raw: &str| parse_amount(&serde_json::json!(raw));
        assert_eq!(amount("Rs. 1,250"), Some(1250.0));
        assert_eq!(amount("INR 1,250.00"), Some(1250.0));
        assert_eq!(amount("₹99"), Some(99.0));
        assert_eq!(amount("-Rs. 40.50"), Some(-40.5));
        assert_eq!(amount("Rs."), None);

        let txn = parse_extraction(r#"{"amount": "Rs. 1,250", "direction": "debit"}"#, None)
            .unwrap();
        assert_eq!(txn.amount, -1250.0);
    }

    #[test]
    fn test_parse_rejections() {
        assert_eq!(
            parse_extraction(r#"{"is_transaction": false}"#, None).unwrap_err(),
            "not a transaction"
        );
        assert!(parse_extraction(r#"{"currency": "INR"}"#, None)
            .unwrap_err()
            .contains("amount"));
        assert!(parse_extraction("I could not find anything", None).is_err());
    }

    #[test]
    fn test_normalize_merchant() {
        assert_eq!(normalize_merchant("  ZOMATO*Order #42 "), "zomatoorder42");
        assert_eq!(normalize_merchant("Ｃａｆé"), "cafe");
    }

    #[test]
    fn test_clamp_confidence_nan() {
        assert_eq!(clamp_confidence(f64::NAN), 0.0);
        assert_eq!(clamp_confidence(0.42), 0.42);
    }

    #[tokio::test]
    async fn test_empty_body_fails_without_calling_provider() {
        let adapter = Arc::new(ScriptedAdapter::ok("openai", "{}"));
        let engine = engine_with(vec![adapter.clone() as Arc<dyn ModelAdapter>]);
        let failure = engine
            .extract(&input("   "), ExtractionMode::Real)
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::EmptyBody);
        assert_eq!(adapter.call_count(), 0);
    }

    #[tokio::test]
    async fn test_mock_mode_skips_real_providers() {
        let adapter = Arc::new(ScriptedAdapter::failing("openai"));
        let engine = engine_with(vec![adapter.clone() as Arc<dyn ModelAdapter>]);
        let txn = engine
            .extract(
                &input("INR 450.00 debited at Cafe Mocha"),
                ExtractionMode::Mock,
            )
            .await
            .unwrap();
        assert_eq!(txn.provider, "mock");
        assert_eq!(txn.amount, -450.0);
        assert_eq!(txn.merchant_normalized, "cafemocha");
        assert_eq!(adapter.call_count(), 0);
    }

    #[tokio::test]
    async fn test_real_mode_reports_serving_provider() {
        let engine = engine_with(vec![Arc::new(ScriptedAdapter::ok(
            "anthropic",
            "```json\n{\"amount\": 99, \"direction\": \"debit\", \"merchant\": \"Swiggy\", \"confidence\": 0.9}\n```",
        )) as Arc<dyn ModelAdapter>]);
        let txn = engine
            .extract(&input("Rs 99 paid to Swiggy"), ExtractionMode::Real)
            .await
            .unwrap();
        assert_eq!(txn.provider, "anthropic");
        assert_eq!(txn.model, "scripted");
        assert!((0.0..=1.0).contains(&txn.confidence));
    }

    #[tokio::test]
    async fn test_malformed_output_carries_provider() {
        let engine = engine_with(vec![Arc::new(ScriptedAdapter::ok(
            "openai",
            "sorry, I can't help with that",
        )) as Arc<dyn ModelAdapter>]);
        let failure = engine
            .extract(&input("Rs 99 paid"), ExtractionMode::Real)
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::MalformedOutput);
        assert_eq!(failure.provider.as_deref(), Some("openai"));
        assert_eq!(failure.to_detail()["kind"], "malformed_output");
    }

    #[tokio::test]
    async fn test_no_provider_and_provider_error() {
        let engine = engine_with(Vec::new());
        let failure = engine
            .extract(&input("Rs 99 paid"), ExtractionMode::Real)
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::NoProvider);

        let engine = engine_with(vec![
            Arc::new(ScriptedAdapter::failing("openai")) as Arc<dyn ModelAdapter>
        ]);
        let failure = engine
            .extract(&input("Rs 99 paid"), ExtractionMode::Real)
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::ProviderError);
        assert_eq!(failure.provider.as_deref(), Some("openai"));
        assert_eq!(failure.model.as_deref(), Some("scripted"));
        assert_eq!(failure.to_detail()["provider"], "openai");
    }

    #[tokio::test]
    async fn test_provider_error_names_last_provider_tried() {
        let engine = engine_with(vec![
            Arc::new(ScriptedAdapter::failing("openai")) as Arc<dyn ModelAdapter>,
            Arc::new(ScriptedAdapter::failing("anthropic")) as Arc<dyn ModelAdapter>,
        ]);
        let failure = engine
            .extract(&input("Rs 99 paid"), ExtractionMode::Real)
            .await
            .unwrap_err();
        assert_eq!(failure.provider.as_deref(), Some("anthropic"));
    }

    #[tokio::test]
    async fn test_timeout_is_charged_to_default_provider() {
        let slow = ScriptedAdapter::ok("openai", "{}").with_delay(Duration::from_millis(200));
        let engine = ExtractionEngine::new(
            Arc::new(InferenceManager::new(
                vec![Arc::new(slow) as Arc<dyn ModelAdapter>],
                None,
            )),
            Duration::from_millis(20),
        );
        let failure = engine
            .extract(&input("Rs 99 paid"), ExtractionMode::Real)
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert_eq!(failure.provider.as_deref(), Some("openai"));
        assert_eq!(failure.model.as_deref(), Some("scripted"));
    }
}
