//! Deterministic, rule-based stand-in for a real model.
//!
//! Reads the email text out of the prompt and answers with the same JSON
//! object a real provider is asked for. Used for local runs and whenever
//! the extraction mode is switched to mock.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;

use crate::intelligence::{
    InferenceError, InferenceRequest, InferenceResponse, ModelAdapter, TokenUsage,
};

pub const MOCK_PROVIDER: &str = "mock";
pub const MOCK_MODEL: &str = "mock-extractor-v1";

fn re_amount() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(INR|Rs\.?|₹|USD|US\$|\$|EUR|€|GBP|£)\s?([0-9][0-9,]*(?:\.[0-9]{1,2})?)")
            .unwrap()
    })
}

fn re_credit() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(credited|received|refund(?:ed)?|deposited|cashback)\b").unwrap()
    })
}

fn re_merchant() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(?:at|to|from|AT|TO|FROM)\s+([A-Z][\w&'\-]*(?:\s+[A-Z][\w&'\-]*)*)").unwrap()
    })
}

fn re_reference() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:ref(?:erence)?|txn|transaction)\s*(?:no\.?|number|id|#)?\s*[:.]?\s*([A-Z0-9]{6,})")
            .unwrap()
    })
}

fn currency_code(symbol: &str) -> &'static str {
    match symbol.to_ascii_uppercase().trim_end_matches('.') {
        "USD" | "US$" | "$" => "USD",
        "EUR" | "€" => "EUR",
        "GBP" | "£" => "GBP",
        _ => "INR",
    }
}

/// Category guess from well-known merchant keywords.
fn category_for(text: &str) -> &'static str {
    let lowered = text.to_lowercase();
    let rules: &[(&[&str], &str)] = &[
        (&["swiggy", "zomato", "cafe", "restaurant", "coffee"], "food"),
        (&["uber", "ola", "metro", "fuel", "petrol"], "transport"),
        (&["amazon", "flipkart", "myntra"], "shopping"),
        (&["netflix", "spotify", "prime video"], "entertainment"),
        (&["electricity", "broadband", "recharge", "bill"], "utilities"),
        (&["salary", "payroll"], "income"),
    ];
    for (keywords, category) in rules {
        if keywords.iter().any(|k| lowered.contains(k)) {
            return category;
        }
    }
    "uncategorized"
}

/// Produce the extraction JSON for `text`. `{"is_transaction": false}`
/// when no amount is present.
pub fn mock_extract(text: &str) -> serde_json::Value {
    let Some(caps) = re_amount().captures(text) else {
        return json!({"is_transaction": false});
    };
    let amount: f64 = caps[2].replace(',', "").parse().unwrap_or(0.0);
    if amount <= 0.0 {
        return json!({"is_transaction": false});
    }

    let direction = if re_credit().is_match(text) {
        "credit"
    } else {
        "debit"
    };
    let merchant = re_merchant()
        .captures(text)
        .map(|c| c[1].trim().to_string())
        .unwrap_or_default();
    let reference = re_reference().captures(text).map(|c| c[1].to_string());

    json!({
        "is_transaction": true,
        "amount": amount,
        "currency": currency_code(&caps[1]),
        "direction": direction,
        "merchant": merchant,
        "category": category_for(text),
        "reference_id": reference,
        "confidence": if merchant.is_empty() { 0.5 } else { 0.8 },
        "notes": "rule-based mock extraction",
    })
}

#[derive(Default)]
pub struct MockAdapter;

impl MockAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ModelAdapter for MockAdapter {
    fn name(&self) -> &str {
        MOCK_PROVIDER
    }

    fn model(&self) -> &str {
        MOCK_MODEL
    }

    fn has_credentials(&self) -> bool {
        true
    }

    async fn health_check(&self) -> Result<(), InferenceError> {
        Ok(())
    }

    async fn generate(&self, request: &InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        let content = mock_extract(&request.prompt).to_string();
        Ok(InferenceResponse {
            usage: TokenUsage {
                input_tokens: request.prompt.split_whitespace().count() as u32,
                output_tokens: content.split_whitespace().count() as u32,
            },
            content,
            provider: MOCK_PROVIDER.to_string(),
            model: MOCK_MODEL.to_string(),
        })
    }
}
