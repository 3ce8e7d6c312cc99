//! Small shared helpers.

use base64::Engine;

/// Decode base64 in either the standard or URL-safe alphabet, with or
/// without padding. Push payloads and Gmail bodies use both forms.
pub fn decode_base64_lenient(data: &str) -> Option<Vec<u8>> {
    use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};

    let cleaned: String = data
        .trim()
        .trim_end_matches('=')
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    URL_SAFE_NO_PAD
        .decode(&cleaned)
        .or_else(|_| STANDARD_NO_PAD.decode(&cleaned))
        .ok()
}

/// Lenient base64 decode into UTF-8 text. Invalid sequences are replaced.
pub fn decode_base64_text(data: &str) -> Option<String> {
    decode_base64_lenient(data).map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

/// Truncate to at most `max` characters on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Extract the bare address from a header value like `"Jane" <jane@x.com>`.
pub fn bare_address(header: &str) -> String {
    let trimmed = header.trim();
    match (trimmed.find('<'), trimmed.rfind('>')) {
        (Some(lt), Some(gt)) if gt > lt => trimmed[lt + 1..gt].trim().to_string(),
        _ => trimmed.trim_matches('"').to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_both_alphabets() {
        // "subjects?>" encodes with '/' in standard and '_' in URL-safe
        assert_eq!(decode_base64_text("c3ViamVjdHM/Pg==").as_deref(), Some("subjects?>"));
        assert_eq!(decode_base64_text("c3ViamVjdHM_Pg").as_deref(), Some("subjects?>"));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(decode_base64_lenient("%%%").is_none());
    }

    #[test]
    fn test_truncate_chars_multibyte() {
        assert_eq!(truncate_chars("₹450 debited", 4), "₹450");
        assert_eq!(truncate_chars("short", 50), "short");
    }

    #[test]
    fn test_bare_address() {
        assert_eq!(bare_address("\"HDFC Bank\" <alerts@hdfc.example>"), "alerts@hdfc.example");
        assert_eq!(bare_address("plain@example.com"), "plain@example.com");
    }
}
