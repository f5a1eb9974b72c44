//! Shared HTTP plumbing for provider adapters
//!
//! Maps transport failures and HTTP status codes onto the adapter error
//! taxonomy. No retries happen here.

use std::collections::BTreeMap;
use std::time::Duration;

use agent_core::{AgentError, ProviderError};
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use serde_json::Value;

/// Longest error body kept in an error message
const MAX_ERROR_BODY: usize = 512;

/// Build request headers: JSON content type, optional auth header, then the
/// endpoint's custom headers (which win on conflict).
pub fn build_headers(
    auth: Option<(&'static str, String)>,
    extra: &BTreeMap<String, String>,
) -> Result<HeaderMap, AgentError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    if let Some((name, value)) = auth {
        let value = HeaderValue::from_str(&value)
            .map_err(|e| AgentError::Config(format!("invalid {name} header: {e}")))?;
        headers.insert(HeaderName::from_static(name), value);
    }

    for (name, value) in extra {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| AgentError::Config(format!("invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| AgentError::Config(format!("invalid value for header '{name}': {e}")))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// POST a JSON body and return the parsed JSON response.
pub async fn post_json(
    client: &reqwest::Client,
    url: &str,
    headers: &HeaderMap,
    body: &Value,
    timeout: Duration,
) -> Result<Value, ProviderError> {
    let resp = client
        .post(url)
        .headers(headers.clone())
        .timeout(timeout)
        .json(body)
        .send()
        .await
        .map_err(transport_error)?;

    let status = resp.status();
    if !status.is_success() {
        let retry_after = parse_retry_after(resp.headers());
        let text = resp.text().await.unwrap_or_default();
        return Err(classify_status(status, retry_after, &text));
    }

    resp.json::<Value>()
        .await
        .map_err(|e| ProviderError::MalformedResponse(format!("response is not JSON: {e}")))
}

pub fn transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(err.to_string())
    } else {
        ProviderError::ProviderUnavailable(err.to_string())
    }
}

/// Map a non-success status onto the taxonomy.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> ProviderError {
    let body = truncate(body);
    match status.as_u16() {
        401 | 403 => ProviderError::Auth(format!("{status}: {body}")),
        429 => ProviderError::RateLimited {
            message: format!("{status}: {body}"),
            retry_after,
        },
        408 | 504 => ProviderError::Timeout(format!("{status}: {body}")),
        // 529 is Anthropic's "overloaded"
        500..=599 => ProviderError::ProviderUnavailable(format!("{status}: {body}")),
        code => ProviderError::Rejected { status: code, body },
    }
}

/// `Retry-After` in delta-seconds form. HTTP dates are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    raw.parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

fn truncate(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}

/// Parse a tool-call argument string. Unparseable input is kept as a JSON
/// string so the tool invoker rejects it visibly instead of it being lost.
pub fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

pub fn api_key_from_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|k| !k.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, "bad key"),
            ProviderError::Auth(_)
        ));
        let limited = classify_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(3)), "");
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(3)));
        assert!(classify_status(StatusCode::BAD_GATEWAY, None, "").is_transient());
        assert!(classify_status(StatusCode::GATEWAY_TIMEOUT, None, "").is_transient());
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST, None, "nope"),
            ProviderError::Rejected {
                status: 400,
                body: "nope".into()
            }
        );
    }

    #[test]
    fn test_retry_after_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(parse_retry_after(&headers), None);

        // out of range for Duration
        for raw in ["1e30", "-3", "NaN", "inf"] {
            headers.insert(RETRY_AFTER, HeaderValue::from_static(raw));
            assert_eq!(parse_retry_after(&headers), None, "{raw}");
        }
    }

    #[test]
    fn test_custom_headers_override() {
        let mut extra = BTreeMap::new();
        extra.insert("x-api-key".to_string(), "override".to_string());
        extra.insert("X-Org".to_string(), "acme".to_string());
        let headers = build_headers(Some(("x-api-key", "original".into())), &extra).unwrap();
        assert_eq!(headers["x-api-key"], "override");
        assert_eq!(headers["x-org"], "acme");

        extra.insert("bad header".to_string(), "v".to_string());
        assert!(build_headers(None, &extra).is_err());
    }

    #[test]
    fn test_parse_arguments() {
        assert_eq!(parse_arguments(r#"{"a": [1, {"b": null}]}"#), serde_json::json!({"a": [1, {"b": null}]}));
        assert_eq!(parse_arguments(""), serde_json::json!({}));
        assert_eq!(parse_arguments("{oops"), serde_json::json!("{oops"));
    }
}
