//! System-prompt extraction from the software-statement JWT.
//!
//! The viaNexus API issues a software statement whose payload may carry a
//! system prompt under `system_prompt` / `systemPrompt`, directly or inside a
//! nested `claims` object. The token is decoded without signature
//! verification — it only configures the prompt, the server re-validates it
//! during OAuth. Malformed tokens log a warning and yield `None` so the
//! caller falls through to the next prompt source.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Caps a prompt pulled out of a JWT; anything longer is truncated.
const MAX_JWT_PROMPT_CHARS: usize = 10_000;

pub fn extract_system_prompt_from_jwt(token: &str) -> Option<String> {
    if token.is_empty() {
        warn!("invalid JWT token provided");
        return None;
    }

    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        warn!("invalid JWT format: expected 3 parts");
        return None;
    }

    let payload_bytes = match URL_SAFE_NO_PAD.decode(parts[1]) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "JWT payload is not valid base64url");
            return None;
        }
    };

    let payload: Value = match serde_json::from_slice(&payload_bytes) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "JWT payload is not valid JSON");
            return None;
        }
    };
    let Some(payload) = payload.as_object() else {
        warn!("JWT payload is not an object");
        return None;
    };

    let prompt = prompt_claim(payload).or_else(|| {
        payload
            .get("claims")
            .and_then(Value::as_object)
            .and_then(prompt_claim)
    })?;

    match prompt {
        Value::String(s) => {
            let mut s = s.clone();
            if s.chars().count() > MAX_JWT_PROMPT_CHARS {
                warn!("system prompt from JWT is suspiciously long, truncating");
                s = s.chars().take(MAX_JWT_PROMPT_CHARS).collect();
            }
            debug!("extracted system prompt from JWT");
            Some(s)
        }
        _ => {
            warn!("system prompt claim in JWT is not a string");
            None
        }
    }
}

fn prompt_claim(payload: &Map<String, Value>) -> Option<&Value> {
    payload
        .get("system_prompt")
        .or_else(|| payload.get("systemPrompt"))
}
