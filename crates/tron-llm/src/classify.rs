//! Failure classification.
//!
//! Transport errors ([`TransportError`], raw HTTP status and body) are mapped onto
//! the small set of [`FailureKind`]s the fallback manager understands. Status
//! codes and structured variants win; free-form messages are matched against
//! an ordered pattern table.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tron_core::errors::{ClassifiedError, FailureKind, TransportError};

struct MessagePattern {
    regex: Regex,
    kind: FailureKind,
}

/// Known message patterns, checked in order. Context overflow comes first
/// because providers often phrase it as an "invalid request".
static PATTERNS: LazyLock<Vec<MessagePattern>> = LazyLock::new(|| {
    [
        (
            r"(?i)prompt is too long|context[ _-]?(length|window)|maximum context|too many tokens|request too large",
            FailureKind::ContextOverflow,
        ),
        (
            r"(?i)insufficient[ _]?(quota|credits?|funds)|credit balance|payment required|billing",
            FailureKind::Billing,
        ),
        (
            r"(?i)authentication_error|invalid.{0,20}(api[ _-]?key|x-api-key|token)|unauthori[sz]ed|permission_denied|expired (token|credential)",
            FailureKind::Auth,
        ),
        (
            r"(?i)rate[ _-]?limit|too many requests|\b429\b|resource[ _]exhausted|quota",
            FailureKind::RateLimit,
        ),
        (
            r"(?i)timed? ?out|ETIMEDOUT|ECONNRESET|ECONNREFUSED|overloaded|\b50[234]\b|\b529\b|connection (reset|closed)",
            FailureKind::Timeout,
        ),
    ]
    .into_iter()
    .filter_map(|(pattern, kind)| {
        Regex::new(pattern)
            .ok()
            .map(|regex| MessagePattern { regex, kind })
    })
    .collect()
});

/// Match a free-form error message against the pattern table.
pub fn classify_message(message: &str) -> FailureKind {
    PATTERNS
        .iter()
        .find(|p| p.regex.is_match(message))
        .map_or(FailureKind::Unknown, |p| p.kind)
}

/// Classify a raw HTTP failure.
pub fn classify_http(status: u16, body: &str, retry_after: Option<Duration>) -> ClassifiedError {
    let kind = match status {
        401 | 403 => FailureKind::Auth,
        402 => FailureKind::Billing,
        408 | 504 | 529 => FailureKind::Timeout,
        413 => FailureKind::ContextOverflow,
        429 => match classify_message(body) {
            // Some providers report an exhausted balance as a 429.
            FailureKind::Billing => FailureKind::Billing,
            _ => FailureKind::RateLimit,
        },
        _ => classify_message(body),
    };
    let classified = ClassifiedError::new(kind, format!("HTTP {status}: {}", truncate(body)));
    match retry_after {
        Some(delay) => classified.with_retry_after(delay),
        None => classified,
    }
}

/// Classify a transport error from a provider client.
pub fn classify_transport(error: &TransportError) -> ClassifiedError {
    let message = error.to_string();
    let classified = match error {
        TransportError::Http { status, body, .. } => {
            return classify_http(*status, body, error.retry_after());
        }
        TransportError::Unauthorized(_) => ClassifiedError::auth(message),
        TransportError::PromptTooLarge { .. } => ClassifiedError::context_overflow(message),
        TransportError::Throttled { .. } => ClassifiedError::rate_limit(message),
        TransportError::Overloaded | TransportError::Unreachable(_) | TransportError::TimedOut(_) => {
            ClassifiedError::timeout(message)
        }
        TransportError::Cancelled => ClassifiedError::unknown(message),
    };
    match error.retry_after() {
        Some(delay) => classified.with_retry_after(delay),
        None => classified,
    }
}

fn truncate(body: &str) -> &str {
    const MAX: usize = 200;
    if body.len() <= MAX {
        return body;
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_patterns() {
        assert_eq!(
            classify_message("prompt is too long: 210000 tokens > 200000 maximum"),
            FailureKind::ContextOverflow
        );
        assert_eq!(
            classify_message("Your credit balance is too low"),
            FailureKind::Billing
        );
        assert_eq!(classify_message("invalid x-api-key"), FailureKind::Auth);
        assert_eq!(classify_message("Rate limit reached for requests"), FailureKind::RateLimit);
        assert_eq!(classify_message("connect ETIMEDOUT 1.2.3.4:443"), FailureKind::Timeout);
        assert_eq!(classify_message("something odd happened"), FailureKind::Unknown);
    }

    #[test]
    fn http_status_wins_over_body() {
        assert_eq!(classify_http(401, "rate limit", None).kind, FailureKind::Auth);
        assert_eq!(classify_http(402, "", None).kind, FailureKind::Billing);
        assert_eq!(classify_http(413, "", None).kind, FailureKind::ContextOverflow);
        assert_eq!(classify_http(504, "", None).kind, FailureKind::Timeout);
    }

    #[test]
    fn http_429_keeps_retry_after() {
        let err = classify_http(429, "slow down", Some(Duration::from_secs(7)));
        assert_eq!(err.kind, FailureKind::RateLimit);
        assert_eq!(err.retry_after, Some(Duration::from_secs(7)));
    }

    #[test]
    fn http_429_billing_body() {
        let err = classify_http(429, "insufficient_quota: check your plan", None);
        assert_eq!(err.kind, FailureKind::Billing);
    }

    #[test]
    fn http_400_falls_back_to_body() {
        let err = classify_http(400, "input exceeds the context window", None);
        assert_eq!(err.kind, FailureKind::ContextOverflow);
        assert_eq!(classify_http(400, "bad json", None).kind, FailureKind::Unknown);
    }

    #[test]
    fn transport_variants() {
        assert_eq!(
            classify_transport(&TransportError::Unauthorized("bad key".into())).kind,
            FailureKind::Auth
        );
        assert_eq!(
            classify_transport(&TransportError::PromptTooLarge {
                limit: 200_000,
                actual: 250_000
            })
            .kind,
            FailureKind::ContextOverflow
        );
        assert_eq!(
            classify_transport(&TransportError::Unreachable("reset".into())).kind,
            FailureKind::Timeout
        );
        assert_eq!(classify_transport(&TransportError::Overloaded).kind, FailureKind::Timeout);
        assert_eq!(classify_transport(&TransportError::Cancelled).kind, FailureKind::Unknown);

        let throttled = classify_transport(&TransportError::Throttled {
            retry_after: Some(Duration::from_secs(3)),
        });
        assert_eq!(throttled.kind, FailureKind::RateLimit);
        assert_eq!(throttled.retry_after, Some(Duration::from_secs(3)));
    }

    #[test]
    fn http_transport_uses_status_then_body() {
        let err = classify_transport(&TransportError::Http {
            status: 500,
            body: "upstream timed out".into(),
            retry_after: None,
        });
        assert_eq!(err.kind, FailureKind::Timeout);

        let billing = classify_transport(&TransportError::Http {
            status: 402,
            body: String::new(),
            retry_after: None,
        });
        assert_eq!(billing.kind, FailureKind::Billing);
    }

    #[test]
    fn long_bodies_are_truncated_on_char_boundary() {
        let body = "é".repeat(300);
        let err = classify_http(500, &body, None);
        assert!(err.message.len() < 220);
    }
}
