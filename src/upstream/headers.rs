//! Final header assembly for upstream requests: defaults, dialect-family
//! overlays, session tracking, custom headers, and the optional per-family
//! HMAC signer.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use sha2::Sha256;

use crate::context::RequestContext;
use crate::error::{RelayError, Result};
use crate::providers::{DialectFamily, SignerSpec};

type HmacSha256 = Hmac<Sha256>;

const IFLOW_USER_AGENT: &str = "iflow-cli/3.1.0";
const IFLOW_CLIENT_TYPE: &str = "cli";
const IFLOW_CLIENT_VERSION: &str = "3.1.0";

pub struct HeaderBuilder<'a> {
    family: DialectFamily,
    api_key: &'a str,
    ctx: &'a RequestContext,
    custom: &'a BTreeMap<String, String>,
    signer: Option<&'a SignerSpec>,
}

impl<'a> HeaderBuilder<'a> {
    pub fn new(
        family: DialectFamily,
        api_key: &'a str,
        ctx: &'a RequestContext,
        custom: &'a BTreeMap<String, String>,
        signer: Option<&'a SignerSpec>,
    ) -> Self {
        Self {
            family,
            api_key,
            ctx,
            custom,
            signer,
        }
    }

    /// Assemble the header map. `HeaderMap` keys are case-insensitive, so a
    /// later insert wins regardless of the configured casing; custom headers
    /// go last.
    pub fn build(&self, now_ms: u64) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        if !self.api_key.is_empty() {
            insert(
                &mut headers,
                "authorization",
                &format!("Bearer {}", self.api_key),
            )?;
        }
        insert(&mut headers, "x-request-id", &self.ctx.request_id)?;

        match self.family {
            DialectFamily::Iflow => {
                insert(&mut headers, "user-agent", IFLOW_USER_AGENT)?;
                insert(&mut headers, "x-client-type", IFLOW_CLIENT_TYPE)?;
                insert(&mut headers, "x-client-version", IFLOW_CLIENT_VERSION)?;
                if let Some(session) = &self.ctx.session_id {
                    insert(&mut headers, "session-id", session)?;
                }
                if let Some(conversation) = &self.ctx.conversation_id {
                    insert(&mut headers, "conversation-id", conversation)?;
                }
                // The iflow family rejects the SSE accept header even for
                // streamed responses.
                insert(&mut headers, "accept", "application/json")?;
            }
            _ => {
                if let Some(session) = &self.ctx.session_id {
                    insert(&mut headers, "X-Session-Id", session)?;
                }
                if let Some(conversation) = &self.ctx.conversation_id {
                    insert(&mut headers, "X-Conversation-Id", conversation)?;
                }
                if self.ctx.stream {
                    insert(&mut headers, "accept", "text/event-stream")?;
                }
            }
        }

        for (name, value) in self.custom {
            insert(&mut headers, name, value)?;
        }

        if let Some(signer) = self.signer {
            self.sign(&mut headers, signer, now_ms)?;
        }

        Ok(headers)
    }

    /// HMAC-SHA256 over the named header values joined by ':' with the
    /// timestamp appended, keyed by the API key. Re-run on every retry so the
    /// timestamp stays inside the verification window.
    fn sign(&self, headers: &mut HeaderMap, signer: &SignerSpec, now_ms: u64) -> Result<()> {
        let mut parts: Vec<String> = Vec::with_capacity(signer.fields.len() + 1);
        for field in &signer.fields {
            let value = headers
                .get(field.as_str())
                .and_then(|value| value.to_str().ok())
                .unwrap_or("");
            parts.push(value.to_string());
        }
        parts.push(now_ms.to_string());
        let data = parts.join(":");

        let mut mac = HmacSha256::new_from_slice(self.api_key.as_bytes()).map_err(|err| {
            RelayError::InvalidRequest {
                reason: format!("signer key rejected: {err}"),
            }
        })?;
        mac.update(data.as_bytes());
        let signature = hex_encode(&mac.finalize().into_bytes());

        insert(headers, &signer.signature_header, &signature)?;
        insert(headers, &signer.timestamp_header, &now_ms.to_string())?;
        Ok(())
    }
}

fn insert(headers: &mut HeaderMap, name: &str, value: &str) -> Result<()> {
    let name = HeaderName::from_bytes(name.as_bytes()).map_err(|err| RelayError::InvalidRequest {
        reason: format!("invalid header name `{name}`: {err}"),
    })?;
    let value = HeaderValue::from_str(value).map_err(|err| RelayError::InvalidRequest {
        reason: format!("invalid header value for `{name:?}`: {err}"),
    })?;
    headers.insert(name, value);
    Ok(())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
