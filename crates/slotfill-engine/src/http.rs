use std::time::Duration;

use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::Value;
use thiserror::Error;

/// Why one provider could not serve one request. Every variant advances the
/// chain; `RateLimited` additionally triggers backoff or a cool-down.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider}: credentials not configured")]
    MissingCredentials { provider: String },
    #[error("{provider}: rate limited ({detail})")]
    RateLimited { provider: String, detail: String },
    #[error("{provider}: transient failure ({status}): {detail}")]
    Transient {
        provider: String,
        status: u16,
        detail: String,
    },
    #[error("{provider}: request rejected ({status}): {detail}")]
    Rejected {
        provider: String,
        status: u16,
        detail: String,
    },
    #[error("{provider}: malformed response: {detail}")]
    Malformed { provider: String, detail: String },
    #[error("{provider}: transport error: {detail}")]
    Transport { provider: String, detail: String },
}

impl ProviderError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_missing_credentials(&self) -> bool {
        matches!(self, Self::MissingCredentials { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingCredentials { .. } => "missing_credentials",
            Self::RateLimited { .. } => "rate_limited",
            Self::Transient { .. } => "transient",
            Self::Rejected { .. } => "rejected",
            Self::Malformed { .. } => "malformed",
            Self::Transport { .. } => "transport",
        }
    }

    pub fn missing_credentials(provider: &str) -> Self {
        Self::MissingCredentials {
            provider: provider.to_string(),
        }
    }

    pub fn malformed(provider: &str, detail: impl Into<String>) -> Self {
        Self::Malformed {
            provider: provider.to_string(),
            detail: detail.into(),
        }
    }

    pub fn transport(provider: &str, err: &reqwest::Error) -> Self {
        Self::Transport {
            provider: provider.to_string(),
            detail: truncate_text(&error_source_text(err), 512),
        }
    }

    /// Maps an HTTP status (and body, for vendors that signal limits in text)
    /// to the failure taxonomy.
    pub fn from_status(provider: &str, status: u16, body: &str) -> Self {
        let detail = truncate_text(body.trim(), 512);
        if status == 429 || mentions_rate_limit(body) {
            return Self::RateLimited {
                provider: provider.to_string(),
                detail: format!("{status}: {detail}"),
            };
        }
        if status >= 500 || status == 408 {
            return Self::Transient {
                provider: provider.to_string(),
                status,
                detail,
            };
        }
        Self::Rejected {
            provider: provider.to_string(),
            status,
            detail,
        }
    }
}

/// Blocking client with a hard per-request timeout; a timeout surfaces as
/// [`ProviderError::Transport`].
pub fn http_client(timeout: Duration) -> HttpClient {
    HttpClient::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .build()
        .unwrap_or_else(|_| HttpClient::new())
}

/// Reads a JSON body, classifying non-2xx statuses and error envelopes that
/// arrive with a 200.
pub fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value, ProviderError> {
    let status = response.status().as_u16();
    let body = response
        .text()
        .map_err(|err| ProviderError::transport(provider, &err))?;
    if !(200..300).contains(&status) {
        return Err(ProviderError::from_status(provider, status, &body));
    }
    let parsed: Value = serde_json::from_str(&body).map_err(|_| {
        if mentions_rate_limit(&body) {
            ProviderError::from_status(provider, 429, &body)
        } else {
            ProviderError::malformed(provider, format!("invalid JSON: {}", truncate_text(&body, 256)))
        }
    })?;
    if let Some(message) = embedded_error(&parsed) {
        let status = if mentions_rate_limit(&message) { 429 } else { status };
        return Err(ProviderError::from_status(provider, status, &message));
    }
    Ok(parsed)
}

/// Error text carried inside an otherwise successful envelope, e.g.
/// `{"error": {"message": ...}}`, `{"type": "error", ...}`, `{"errors": [...]}`.
pub fn embedded_error(payload: &Value) -> Option<String> {
    let obj = payload.as_object()?;
    if let Some(error) = obj.get("error").filter(|value| !value.is_null()) {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| error.as_str().map(str::to_string))
            .unwrap_or_else(|| error.to_string());
        return Some(message);
    }
    if obj.get("type").and_then(Value::as_str) == Some("error") {
        return Some(payload.to_string());
    }
    if let Some(errors) = obj.get("errors").and_then(Value::as_array) {
        if !errors.is_empty() {
            let joined = errors
                .iter()
                .map(|row| row.as_str().map(str::to_string).unwrap_or_else(|| row.to_string()))
                .collect::<Vec<String>>()
                .join(", ");
            return Some(joined);
        }
    }
    None
}

pub fn mentions_rate_limit(text: &str) -> bool {
    let lowered = text.to_ascii_lowercase();
    lowered.contains("rate limit")
        || lowered.contains("rate_limit")
        || lowered.contains("too many requests")
        || lowered.contains("quota")
}

pub fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn error_source_text(err: &reqwest::Error) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        let text = cause.to_string();
        if parts.last().map(|last| last != &text).unwrap_or(true) {
            parts.push(text);
        }
        source = cause.source();
    }
    if err.is_timeout() {
        parts.push("timed out".to_string());
    }
    parts.join(" | caused by: ")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{embedded_error, mentions_rate_limit, truncate_text, ProviderError};

    #[test]
    fn status_classification() {
        assert!(ProviderError::from_status("unsplash", 429, "").is_rate_limited());
        assert!(ProviderError::from_status("pixabay", 400, "[ERROR 429] Rate limit exceeded").is_rate_limited());
        assert_eq!(ProviderError::from_status("openai", 503, "down").kind(), "transient");
        assert_eq!(ProviderError::from_status("openai", 401, "bad key").kind(), "rejected");
    }

    #[test]
    fn embedded_errors_are_detected() {
        assert_eq!(
            embedded_error(&json!({"error": {"message": "model not found"}})).as_deref(),
            Some("model not found")
        );
        assert!(embedded_error(&json!({"type": "error", "error": null})).is_some());
        assert_eq!(
            embedded_error(&json!({"errors": ["OAuth error", "bad token"]})).as_deref(),
            Some("OAuth error, bad token")
        );
        assert!(embedded_error(&json!({"errors": []})).is_none());
        assert!(embedded_error(&json!({"results": []})).is_none());
    }

    #[test]
    fn rate_limit_text_signals() {
        assert!(mentions_rate_limit("Rate Limit Exceeded"));
        assert!(mentions_rate_limit("You exceeded your current quota"));
        assert!(!mentions_rate_limit("not found"));
    }

    #[test]
    fn truncate_appends_ellipsis() {
        assert_eq!(truncate_text("abcdef", 3), "abc…");
        assert_eq!(truncate_text("abc", 3), "abc");
    }
}
