//! Recovery for stringified tool-use blocks.
//!
//! The Anthropic model occasionally emits the text rendering of a tool-call
//! block — `ToolUseBlock(id='...', input={...}, name='...', type='tool_use')`
//! — inside a plain text block instead of a structured block. This module
//! detects that rendering, parses it, and splices an equivalent structured
//! block back into the content list. Any parse failure leaves the block as
//! plain text.

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::pyliteral::parse_literal;

const MARKER: &str = "ToolUseBlock(";

/// Replace any text block carrying a stringified `ToolUseBlock(...)` with the
/// equivalent structured `tool_use` block.
pub fn recover_tool_use_blocks(blocks: &mut [Value]) {
    for block in blocks.iter_mut() {
        if block.get("type").and_then(Value::as_str) != Some("text") {
            continue;
        }
        let Some(text) = block.get("text").and_then(Value::as_str) else {
            continue;
        };
        if !text.contains(MARKER) {
            continue;
        }
        if let Some(recovered) = parse_tool_use_block(text) {
            debug!(
                id = recovered.get("id").and_then(serde_json::Value::as_str),
                "recovered stringified tool-use block"
            );
            *block = recovered;
        }
    }
}

/// Parse a stringified `ToolUseBlock(...)` into a structured block value.
/// Returns `None` when any required field is missing or the input dict does
/// not parse.
pub fn parse_tool_use_block(text: &str) -> Option<Value> {
    let start = text.find(MARKER)? + MARKER.len();
    let body = &text[start..];

    let id = extract_quoted_field(body, "id")?;
    let name = extract_quoted_field(body, "name")?;
    let block_type = extract_quoted_field(body, "type")?;
    if block_type != "tool_use" {
        return None;
    }

    let input = if body.contains("input=") {
        let dict_text = extract_input_dict(body)?;
        parse_input_dict(dict_text)?
    } else {
        json!({})
    };

    Some(json!({
        "type": "tool_use",
        "id": id,
        "name": name,
        "input": input,
    }))
}

fn parse_input_dict(dict_text: &str) -> Option<Value> {
    match parse_literal(dict_text) {
        Ok(value) => Some(value),
        Err(e) => {
            // last resort: naive quote swap, then JSON
            let swapped = dict_text.replace('\'', "\"");
            match serde_json::from_str(&swapped) {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(error = %e, "failed to parse tool input dictionary");
                    None
                }
            }
        }
    }
}

/// Find `key='value'` with a single-quoted value, skipping quoted regions so
/// a key name inside a string does not match.
fn extract_quoted_field(body: &str, key: &str) -> Option<String> {
    let pattern = format!("{key}='");
    let mut search_from = 0;
    loop {
        let at = body[search_from..].find(&pattern)? + search_from;
        // must start the parameter list or follow a separator
        let clean_boundary = at == 0
            || body[..at]
                .chars()
                .next_back()
                .is_some_and(|c| c == ' ' || c == ',' || c == '(');
        if clean_boundary {
            let value_start = at + pattern.len();
            let rest = &body[value_start..];
            let mut out = String::new();
            let mut chars = rest.chars();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            out.push(escaped);
                        }
                    }
                    '\'' => return Some(out),
                    other => out.push(other),
                }
            }
            return None;
        }
        search_from = at + pattern.len();
    }
}

/// Brace-match the dict literal after `input=`, accounting for quoted strings
/// and escape characters.
fn extract_input_dict(body: &str) -> Option<&str> {
    let input_at = body.find("input=")?;
    let brace_offset = body[input_at..].find('{')? + input_at;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut string_quote = '\'';
    let mut escape_next = false;

    for (i, c) in body[brace_offset..].char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' => escape_next = true,
            '\'' | '"' if !in_string => {
                in_string = true;
                string_quote = c;
            }
            c if in_string && c == string_quote => in_string = false,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&body[brace_offset..brace_offset + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
