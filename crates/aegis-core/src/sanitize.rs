//! Outbound text and log sanitization.
//!
//! Analysis text arrives from untrusted pages. Before it is measured,
//! cached, or sent anywhere it is cut to length and stripped of markup
//! and script fragments. Log-bound payload copies additionally get
//! sensitive fields redacted and long text shortened.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static SCRIPT_BLOCKS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script[^>]*>.*?</script>").unwrap());
static IFRAME_BLOCKS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<iframe[^>]*>.*?</iframe>").unwrap());
static JS_SCHEME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)javascript:").unwrap());
static EVENT_HANDLERS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)on\w+\s*=").unwrap());
static HTML_TAGS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());

/// Maximum length of a text field in a log-bound payload copy.
const LOG_TEXT_PREVIEW_CHARS: usize = 100;

const REDACTED: &str = "***REDACTED***";
const SENSITIVE_FIELDS: [&str; 4] = ["api_key", "apiKey", "token", "authorization"];

/// Cut to `max_chars` and strip markup and script fragments.
pub fn sanitize_text(input: &str, max_chars: usize) -> String {
    let truncated = match input.char_indices().nth(max_chars) {
        Some((idx, _)) => &input[..idx],
        None => input,
    };

    let cleaned = SCRIPT_BLOCKS.replace_all(truncated, "");
    let cleaned = IFRAME_BLOCKS.replace_all(&cleaned, "");
    let cleaned = JS_SCHEME.replace_all(&cleaned, "");
    let cleaned = EVENT_HANDLERS.replace_all(&cleaned, "");
    let cleaned = HTML_TAGS.replace_all(&cleaned, "");

    cleaned
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | '"' | '\'' | '&'))
        .collect()
}

/// Copy of a payload safe to put in a log line: text shortened to a
/// preview, credential-bearing fields redacted.
pub fn clean_for_logging(payload: &Value) -> Value {
    let Value::Object(map) = payload else {
        return payload.clone();
    };

    let mut cleaned = map.clone();
    if let Some(Value::String(text)) = cleaned.get_mut("text") {
        if text.chars().count() > LOG_TEXT_PREVIEW_CHARS {
            let preview: String = text.chars().take(LOG_TEXT_PREVIEW_CHARS).collect();
            *text = format!("{}...", preview);
        }
    }

    for field in SENSITIVE_FIELDS {
        if let Some(value) = cleaned.get_mut(field) {
            if !value.is_null() {
                *value = Value::String(REDACTED.to_string());
            }
        }
    }

    Value::Object(cleaned)
}
