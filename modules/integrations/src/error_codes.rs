//! HTTP status classification for upstream API responses.

use serde_json::Value;

/// Map an HTTP status to `(error_code, retryable)`.
///
/// `None` means the request never produced a response (network/transport).
pub fn map_status(status_code: Option<u16>) -> (&'static str, bool) {
    let Some(status) = status_code else {
        return ("network_error", true);
    };
    if status >= 500 {
        return ("server_error", true);
    }
    match status {
        400 => ("validation_error", false),
        401 => ("authentication_error", false),
        403 => ("forbidden", false),
        404 => ("resource_not_found", false),
        409 => ("conflict_error", false),
        422 => ("validation_error", false),
        429 => ("rate_limited", true),
        _ => ("unknown_error", false),
    }
}

/// Pull a human-readable message out of an upstream error body.
pub fn extract_error_message(body: &Value) -> String {
    match body {
        Value::String(s) => s.clone(),
        Value::Object(map) => {
            for key in ["message", "error", "detail"] {
                if let Some(value) = map.get(key) {
                    match value {
                        Value::String(s) if !s.is_empty() => return s.clone(),
                        Value::Null => {}
                        other => return other.to_string(),
                    }
                }
            }
            body.to_string()
        }
        other => other.to_string(),
    }
}
