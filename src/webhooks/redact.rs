use super::types::Headers;
use crate::core::shared::utils::truncate_chars;

pub const REDACTED: &str = "***REDACTED***";
pub const MAX_STORED_BODY_CHARS: usize = 4000;

const SECRET_REQUEST_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "x-api-key",
    "x-auth-token",
    "api-key",
    "x-access-token",
];

const SECRET_RESPONSE_HEADERS: &[&str] = &["set-cookie", "set-cookie2"];

fn redact(headers: &Headers, secret: &[&str]) -> Headers {
    headers
        .iter()
        .map(|(key, value)| {
            if secret.iter().any(|s| s.eq_ignore_ascii_case(key)) {
                (key.clone(), REDACTED.to_string())
            } else {
                (key.clone(), value.clone())
            }
        })
        .collect()
}

pub fn redact_request_headers(headers: &Headers) -> Headers {
    redact(headers, SECRET_REQUEST_HEADERS)
}

pub fn redact_response_headers(headers: &Headers) -> Headers {
    redact(headers, SECRET_RESPONSE_HEADERS)
}

pub fn truncate_body(body: &str) -> String {
    truncate_chars(body, MAX_STORED_BODY_CHARS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_secrets_are_redacted_case_insensitively() {
        let mut headers = Headers::new();
        headers.insert("Authorization".into(), "Bearer abc".into());
        headers.insert("X-API-Key".into(), "k".into());
        headers.insert("Content-Type".into(), "application/json".into());

        let redacted = redact_request_headers(&headers);
        assert_eq!(redacted["Authorization"], REDACTED);
        assert_eq!(redacted["X-API-Key"], REDACTED);
        assert_eq!(redacted["Content-Type"], "application/json");
    }

    #[test]
    fn test_response_cookies_are_redacted() {
        let mut headers = Headers::new();
        headers.insert("set-cookie".into(), "session=1".into());
        headers.insert("authorization".into(), "kept".into());
        let redacted = redact_response_headers(&headers);
        assert_eq!(redacted["set-cookie"], REDACTED);
        assert_eq!(redacted["authorization"], "kept");
    }

    #[test]
    fn test_body_truncated_to_limit() {
        let body = "é".repeat(MAX_STORED_BODY_CHARS + 10);
        assert_eq!(truncate_body(&body).chars().count(), MAX_STORED_BODY_CHARS);
    }
}
