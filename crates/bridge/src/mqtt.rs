use serde::Deserialize;

use crate::error::{BridgeError, Result};

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

/// Structured form a device may publish instead of a bare number.
#[derive(Debug, Deserialize)]
pub(crate) struct ValueMsg {
    pub(crate) value: f64,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// MQTT topic filter matching with `+` (one level) and `#` (rest) wildcards.
pub(crate) fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(a), Some(b)) if a == b => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Parse a sensor reading. Accepts plain text ("512", " 3.3\n"), a bare JSON
/// number, or `{"value": 512}`. Non-finite values are rejected.
pub(crate) fn parse_reading(payload: &[u8]) -> Result<f64> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| BridgeError::ParseFailure("payload is not utf-8".into()))?
        .trim();

    if text.is_empty() {
        return Err(BridgeError::ParseFailure("empty payload".into()));
    }

    let value = match text.parse::<f64>() {
        Ok(v) => v,
        Err(_) => serde_json::from_str::<ValueMsg>(text)
            .map(|m| m.value)
            .map_err(|_| BridgeError::ParseFailure(format!("non-numeric payload '{}'", preview(text))))?,
    };

    if !value.is_finite() {
        return Err(BridgeError::ParseFailure(format!("non-finite value '{}'", preview(text))));
    }
    Ok(value)
}

fn preview(text: &str) -> String {
    const MAX: usize = 32;
    if text.chars().count() <= MAX {
        text.to_string()
    } else {
        let head: String = text.chars().take(MAX).collect();
        format!("{head}...")
    }
}

// ===========================================================================
// Tests
// ===========================================================================
