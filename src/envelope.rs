//! Envelopes exchanged across context boundaries.
//!
//! Wire format is JSON with a `kind` discriminator:
//!
//! ```json
//! {"kind":"prompt-request","requestId":"req-1-9f2c","promptText":"...","systemPromptKey":null}
//! {"kind":"prompt-result","requestId":"req-1-9f2c","success":true,"payload":{...}}
//! ```
//!
//! Only envelopes cross a boundary; live handles (sessions, resolvers) never do.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::response::ParsedResult;

/// Session cache key used when a request carries no system prompt.
pub const DEFAULT_SESSION_KEY: &str = "default";

/// Message returned to the end user when the page reports a failure without
/// any detail.
const GENERIC_FAILURE: &str = "Prompt API failed";

/// Correlation token for one relayed prompt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Any envelope that may travel over a context boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Envelope {
    PromptRequest(PromptEnvelope),
    PromptResult(ResultEnvelope),
}

impl Envelope {
    pub fn request_id(&self) -> &RequestId {
        match self {
            Envelope::PromptRequest(p) => &p.request_id,
            Envelope::PromptResult(r) => &r.request_id,
        }
    }
}

/// Controller → Bridge → Session Host.
///
/// `request_id` and `prompt_text` default to empty when absent so that a
/// malformed envelope still decodes and can be rejected with a precise reason
/// instead of a generic decode error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptEnvelope {
    #[serde(default)]
    pub request_id: RequestId,
    #[serde(default)]
    pub prompt_text: String,
    #[serde(default)]
    pub system_prompt_key: Option<String>,
}

impl PromptEnvelope {
    pub fn new(
        request_id: RequestId,
        prompt_text: impl Into<String>,
        system_prompt_key: Option<&str>,
    ) -> Self {
        Self {
            request_id,
            prompt_text: prompt_text.into(),
            system_prompt_key: system_prompt_key.map(str::to_string),
        }
    }

    /// Returns the reason this envelope must not be forwarded, if any.
    pub fn validate(&self) -> Result<(), String> {
        if self.request_id.is_empty() {
            return Err("missing request id".into());
        }
        if self.prompt_text.trim().is_empty() {
            return Err("missing prompt text".into());
        }
        Ok(())
    }

    /// The key under which the Session Host caches the session for this
    /// request: the system prompt itself, or [`DEFAULT_SESSION_KEY`].
    pub fn session_key(&self) -> &str {
        session_key(self.system_prompt_key.as_deref())
    }
}

/// Map an optional system prompt to its session cache key.
pub fn session_key(system_prompt: Option<&str>) -> &str {
    match system_prompt {
        Some(prompt) if !prompt.is_empty() => prompt,
        _ => DEFAULT_SESSION_KEY,
    }
}

/// Session Host → Bridge → Controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultEnvelope {
    #[serde(default)]
    pub request_id: RequestId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<ParsedResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ResultEnvelope {
    pub fn success(request_id: RequestId, payload: ParsedResult) -> Self {
        Self {
            request_id,
            success: true,
            payload: Some(payload),
            error_message: None,
        }
    }

    pub fn failure(request_id: RequestId, message: impl Into<String>) -> Self {
        Self {
            request_id,
            success: false,
            payload: None,
            error_message: Some(message.into()),
        }
    }

    /// Collapse into the caller-facing outcome. A failure (or a success
    /// missing its payload) yields a single human-readable message.
    pub fn into_outcome(self) -> Result<ParsedResult, String> {
        match (self.success, self.payload) {
            (true, Some(payload)) => Ok(payload),
            (true, None) => Err("Page returned an empty response".into()),
            (false, _) => Err(self
                .error_message
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| GENERIC_FAILURE.to_string())),
        }
    }
}

/// Immediate receipt from the Bridge. Carries no result; the answer arrives
/// later as a [`ResultEnvelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub request_id: RequestId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_request_wire_shape() {
        let env = Envelope::PromptRequest(PromptEnvelope::new(
            RequestId::new("req-1"),
            "Summarize this",
            None,
        ));
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["kind"], "prompt-request");
        assert_eq!(json["requestId"], "req-1");
        assert_eq!(json["promptText"], "Summarize this");
        assert!(json["systemPromptKey"].is_null());
    }

    #[test]
    fn result_failure_wire_shape_omits_payload() {
        let env = Envelope::PromptResult(ResultEnvelope::failure(RequestId::new("req-2"), "boom"));
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["kind"], "prompt-result");
        assert_eq!(json["success"], false);
        assert_eq!(json["errorMessage"], "boom");
        assert!(json.get("payload").is_none());
    }

    #[test]
    fn missing_fields_decode_as_empty() {
        let env: Envelope = serde_json::from_str(r#"{"kind":"prompt-request"}"#).unwrap();
        let Envelope::PromptRequest(prompt) = env else {
            panic!("expected prompt request");
        };
        assert!(prompt.request_id.is_empty());
        assert_eq!(prompt.validate().unwrap_err(), "missing request id");
    }

    #[test]
    fn validate_rejects_blank_prompt() {
        let prompt = PromptEnvelope::new(RequestId::new("req-3"), "   ", None);
        assert_eq!(prompt.validate().unwrap_err(), "missing prompt text");
    }

    #[test]
    fn session_key_falls_back_to_default() {
        assert_eq!(session_key(None), DEFAULT_SESSION_KEY);
        assert_eq!(session_key(Some("")), DEFAULT_SESSION_KEY);
        assert_eq!(session_key(Some("be terse")), "be terse");
    }

    #[test]
    fn failure_without_message_uses_generic_text() {
        let env = ResultEnvelope {
            request_id: RequestId::new("req-4"),
            success: false,
            payload: None,
            error_message: None,
        };
        assert_eq!(env.into_outcome().unwrap_err(), "Prompt API failed");
    }

    #[test]
    fn success_without_payload_is_an_error() {
        let env = ResultEnvelope {
            request_id: RequestId::new("req-5"),
            success: true,
            payload: None,
            error_message: None,
        };
        assert!(env.into_outcome().is_err());
    }
}
