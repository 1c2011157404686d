use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::providers::DialectFamily;

/// Normalized upstream failure, independent of dialect-specific body shapes.
#[derive(Clone, Debug, Error, Serialize, Deserialize)]
#[error("{provider}: {code} ({http_status}): {message}")]
pub struct ProviderError {
    pub code: String,
    pub message: String,
    pub http_status: u16,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    pub provider: String,
}

impl ProviderError {
    pub fn network(provider: &str, message: impl Into<String>) -> Self {
        Self {
            code: codes::NETWORK_ERROR.to_string(),
            message: message.into(),
            http_status: 502,
            retryable: true,
            retry_after_ms: None,
            provider: provider.to_string(),
        }
    }

    pub fn cancelled(provider: &str) -> Self {
        Self {
            code: codes::CANCELLED.to_string(),
            message: "request cancelled".to_string(),
            http_status: 499,
            retryable: false,
            retry_after_ms: None,
            provider: provider.to_string(),
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        self.http_status == 429 || self.code.starts_with("rate_limit")
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == codes::CANCELLED
    }

    /// Failover set: transient statuses plus malformed provider responses.
    pub fn is_failover_eligible(&self) -> bool {
        matches!(self.http_status, 429 | 439 | 449 | 502 | 503)
            || self.code == codes::PROVIDER_RESPONSE_ERROR
    }
}

/// Error taxonomy codes.
pub mod codes {
    pub const INVALID_REQUEST: &str = "invalid_request";
    pub const INVALID_API_KEY: &str = "invalid_api_key";
    pub const TOKEN_EXPIRED: &str = "token_expired";
    pub const CONTENT_TOO_LARGE: &str = "content_too_large";
    pub const RATE_LIMIT: &str = "rate_limit";
    pub const RATE_LIMIT_VARIANT: &str = "rate_limit_variant";
    pub const RATE_LIMIT_AGGRESSIVE: &str = "rate_limit_aggressive";
    pub const MODEL_ERROR: &str = "model_error";
    pub const INSUFFICIENT_QUOTA: &str = "insufficient_quota";
    pub const PROVIDER_RESPONSE_ERROR: &str = "provider_response_error";
    pub const NETWORK_ERROR: &str = "network_error";
    pub const CANCELLED: &str = "cancelled";
    pub const UNKNOWN: &str = "unknown";
}

/// One mapping rule inside a family table. A rule matches when every
/// populated `when_*` field matches the observed failure.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when_body_code: Option<String>,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// Provider-family error table, loaded at startup. New families plug in by
/// registering a table; the classifier itself stays a pure function.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FamilyErrorTable {
    pub family: DialectFamily,
    pub rules: Vec<ErrorRule>,
}

pub struct ErrorClassifier {
    tables: HashMap<DialectFamily, Vec<ErrorRule>>,
}

impl ErrorClassifier {
    pub fn new(tables: Vec<FamilyErrorTable>) -> Self {
        let mut map: HashMap<DialectFamily, Vec<ErrorRule>> = HashMap::new();
        for table in tables {
            map.entry(table.family).or_default().extend(table.rules);
        }
        Self { tables: map }
    }

    /// Built-in tables covering the statuses every family shares. Registered
    /// tables take precedence over the built-ins: rules are matched in order
    /// and the extras are prepended.
    pub fn with_builtin_tables(extra: Vec<FamilyErrorTable>) -> Self {
        let mut tables = extra;
        tables.append(&mut builtin_tables());
        Self::new(tables)
    }

    /// Normalize an upstream failure. `retry_after_ms` comes from the
    /// Retry-After header when the caller parsed one.
    pub fn classify(
        &self,
        family: DialectFamily,
        provider: &str,
        status: u16,
        body: &str,
        retry_after_ms: Option<u64>,
    ) -> ProviderError {
        let body_code = extract_body_code(body);
        let message = extract_body_message(body)
            .unwrap_or_else(|| format!("upstream returned status {status}"));

        if let Some(rules) = self.tables.get(&family) {
            for rule in rules {
                let status_matches = rule.when_status.map(|want| want == status).unwrap_or(true);
                let code_matches = match (&rule.when_body_code, &body_code) {
                    (Some(want), Some(got)) => want == got,
                    (Some(_), None) => false,
                    (None, _) => true,
                };
                if status_matches && code_matches {
                    return ProviderError {
                        code: rule.code.clone(),
                        message,
                        http_status: rule.http_status.unwrap_or(status),
                        retryable: rule.retryable,
                        retry_after_ms: retry_after_ms.or(rule.retry_after_ms),
                        provider: provider.to_string(),
                    };
                }
            }
        }

        // Unknown failures: retryable iff server-side or throttled.
        let retryable = status >= 500 || status == 429;
        let code = if status == 429 {
            codes::RATE_LIMIT
        } else {
            codes::UNKNOWN
        };
        ProviderError {
            code: code.to_string(),
            message,
            http_status: status,
            retryable,
            retry_after_ms,
            provider: provider.to_string(),
        }
    }
}

fn extract_body_code(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .pointer("/error/code")
        .or_else(|| value.pointer("/error/type"))
        .or_else(|| value.get("code"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn extract_body_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .pointer("/error/message")
        .or_else(|| value.get("message"))
        .or_else(|| value.get("error"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn builtin_tables() -> Vec<FamilyErrorTable> {
    let shared = |family| FamilyErrorTable {
        family,
        rules: vec![
            ErrorRule {
                when_status: Some(400),
                when_body_code: None,
                code: codes::INVALID_REQUEST.to_string(),
                http_status: None,
                retryable: false,
                retry_after_ms: None,
            },
            ErrorRule {
                when_status: Some(401),
                when_body_code: None,
                code: codes::INVALID_API_KEY.to_string(),
                http_status: None,
                retryable: false,
                retry_after_ms: None,
            },
            ErrorRule {
                when_status: Some(403),
                when_body_code: Some("token_expired".to_string()),
                code: codes::TOKEN_EXPIRED.to_string(),
                http_status: None,
                retryable: false,
                retry_after_ms: None,
            },
            ErrorRule {
                when_status: Some(413),
                when_body_code: None,
                code: codes::CONTENT_TOO_LARGE.to_string(),
                http_status: None,
                retryable: false,
                retry_after_ms: None,
            },
            ErrorRule {
                when_status: Some(429),
                when_body_code: Some("insufficient_quota".to_string()),
                code: codes::INSUFFICIENT_QUOTA.to_string(),
                http_status: None,
                retryable: false,
                retry_after_ms: None,
            },
            ErrorRule {
                when_status: Some(429),
                when_body_code: None,
                code: codes::RATE_LIMIT.to_string(),
                http_status: None,
                retryable: true,
                retry_after_ms: None,
            },
            ErrorRule {
                when_status: Some(439),
                when_body_code: None,
                code: codes::RATE_LIMIT_VARIANT.to_string(),
                http_status: Some(429),
                retryable: true,
                retry_after_ms: None,
            },
            ErrorRule {
                when_status: Some(449),
                when_body_code: None,
                code: codes::RATE_LIMIT_AGGRESSIVE.to_string(),
                http_status: Some(429),
                retryable: true,
                retry_after_ms: None,
            },
            ErrorRule {
                when_status: Some(500),
                when_body_code: None,
                code: codes::MODEL_ERROR.to_string(),
                http_status: None,
                retryable: true,
                retry_after_ms: None,
            },
            ErrorRule {
                when_status: Some(502),
                when_body_code: None,
                code: codes::PROVIDER_RESPONSE_ERROR.to_string(),
                http_status: None,
                retryable: true,
                retry_after_ms: None,
            },
            ErrorRule {
                when_status: Some(503),
                when_body_code: None,
                code: codes::PROVIDER_RESPONSE_ERROR.to_string(),
                http_status: None,
                retryable: true,
                retry_after_ms: None,
            },
        ],
    };
    vec![
        shared(DialectFamily::Openai),
        shared(DialectFamily::Anthropic),
        shared(DialectFamily::Gemini),
        shared(DialectFamily::Iflow),
    ]
}
