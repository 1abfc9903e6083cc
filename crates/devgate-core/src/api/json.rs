//! Response body decoding with a recovery pass for the device's JSON quirks.
//!
//! Some device firmware writes raw control bytes (newlines, tabs, NUL) inside
//! JSON string values. Strict parsing rejects those, so a failed parse gets one
//! more attempt after the offending bytes inside string literals have been
//! escaped. This is a compatibility shim for that peer, not a lenient parser:
//! anything else that is wrong with the body still fails.

use serde_json::Value;
use tracing::{debug, warn};

use super::ApiError;

/// Maximum number of characters of a bad body quoted in a diagnostic.
pub const EXCERPT_MAX_CHARS: usize = 120;

/// Parse a response body, retrying once with control characters escaped.
pub fn parse_body(text: &str) -> Result<Value, ApiError> {
    let strict_err = match serde_json::from_str::<Value>(text) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    let Some(repaired) = escape_control_chars(text) else {
        return Err(malformed(text, &strict_err));
    };

    match serde_json::from_str::<Value>(&repaired) {
        Ok(value) => {
            debug!(error = %strict_err, "Recovered JSON body after escaping control characters");
            Ok(value)
        }
        Err(e) => Err(malformed(text, &e)),
    }
}

/// Escape raw bytes 0x00-0x1F that sit inside string literals.
///
/// Returns `None` when nothing needed escaping, so callers can skip a
/// pointless second parse. Control characters between tokens are left alone;
/// JSON already allows tab, newline and carriage return there.
pub fn escape_control_chars(text: &str) -> Option<String> {
    let mut out = String::with_capacity(text.len() + 16);
    let mut in_string = false;
    let mut escaped = false;
    let mut changed = false;

    for c in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(c);
                continue;
            }
            match c {
                '\\' => {
                    escaped = true;
                    out.push(c);
                }
                '"' => {
                    in_string = false;
                    out.push(c);
                }
                c if (c as u32) < 0x20 => {
                    changed = true;
                    match c {
                        '\n' => out.push_str("\\n"),
                        '\r' => out.push_str("\\r"),
                        '\t' => out.push_str("\\t"),
                        other => out.push_str(&format!("\\u{:04x}", other as u32)),
                    }
                }
                c => out.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
        }
    }

    changed.then_some(out)
}

/// Bounded, printable excerpt of a body for diagnostics.
pub fn excerpt(text: &str) -> String {
    let mut out: String = text
        .chars()
        .take(EXCERPT_MAX_CHARS)
        .map(|c| if c.is_control() { '\u{fffd}' } else { c })
        .collect();
    if text.chars().nth(EXCERPT_MAX_CHARS).is_some() {
        out.push_str("...");
    }
    out
}

fn malformed(text: &str, err: &serde_json::Error) -> ApiError {
    let snippet = excerpt(text);
    warn!(error = %err, excerpt = %snippet, "Failed to parse JSON response");
    ApiError::MalformedResponse(format!("{} (body: {})", err, snippet))
}
