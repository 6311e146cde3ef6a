// =============================================================================
// Structured decision parsing
// =============================================================================
//
// Grounded on `other_examples/.../portfolio_manager.rs`'s `Action` enum: a
// custom `FromStr` (case-insensitive, tolerant of whatever casing the model
// used) feeding a `serde(deserialize_with = ...)` hook, and a top-level
// `{"decisions": {...}}` envelope. Adapted here to our Open/Close/Hold
// vocabulary and a list instead of a per-ticker map, since the buy/sell
// passes already scope the request to one action kind.
// =============================================================================

use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ParseError;
use crate::types::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActionTag {
    Open,
    Close,
    Hold,
}

impl FromStr for ActionTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "open" | "buy" | "sell_to_enter" | "buy_to_enter" => Ok(ActionTag::Open),
            "close" | "close_position" => Ok(ActionTag::Close),
            "hold" | "none" => Ok(ActionTag::Hold),
            other => Err(format!("unknown action: {other}")),
        }
    }
}

fn deserialize_action<'de, D>(deserializer: D) -> Result<ActionTag, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    ActionTag::from_str(&raw).map_err(serde::de::Error::custom)
}

fn deserialize_side<'de, D>(deserializer: D) -> Result<Option<Side>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(|s| s.trim().to_lowercase()) {
        None => Ok(None),
        Some(s) if s == "long" => Ok(Some(Side::Long)),
        Some(s) if s == "short" => Ok(Some(Side::Short)),
        Some(other) => Err(serde::de::Error::custom(format!("unknown side: {other}"))),
    }
}

/// One row of the LLM's raw decision payload, as deserialized straight off
/// the wire before it is validated into a `ParsedAction`.
#[derive(Debug, Deserialize)]
struct RawDecision {
    #[serde(deserialize_with = "deserialize_action")]
    action: ActionTag,
    symbol: Option<String>,
    #[serde(default, deserialize_with = "deserialize_side")]
    side: Option<Side>,
    qty: Option<f64>,
    leverage: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    decisions: Vec<RawDecision>,
}

/// A validated decision extracted from LLM output, ready to hand to the
/// Decision Applier.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedAction {
    Open {
        symbol: String,
        side: Side,
        qty: f64,
        /// `None` ⇒ use the model's resolved per-cycle leverage.
        leverage: Option<u32>,
    },
    Close {
        symbol: String,
        side: Side,
        qty: Option<f64>,
    },
    Hold,
}

fn into_parsed(raw: RawDecision) -> Result<ParsedAction, String> {
    match raw.action {
        ActionTag::Hold => Ok(ParsedAction::Hold),
        ActionTag::Open => {
            let symbol = raw.symbol.ok_or("open action missing symbol")?;
            let side = raw.side.ok_or("open action missing side")?;
            let qty = raw.qty.ok_or("open action missing qty")?;
            Ok(ParsedAction::Open {
                symbol,
                side,
                qty,
                leverage: raw.leverage,
            })
        }
        ActionTag::Close => {
            let symbol = raw.symbol.ok_or("close action missing symbol")?;
            let side = raw.side.ok_or("close action missing side")?;
            Ok(ParsedAction::Close {
                symbol,
                side,
                qty: raw.qty,
            })
        }
    }
}

/// Parse an LLM response body into a list of decisions. Accepts either the
/// `{"decisions": [...]}` envelope or a bare JSON array, to tolerate models
/// that drop the wrapper. Any structural or semantic failure yields a single
/// `ParseError` carrying the raw text for diagnostics/replay.
pub fn parse_decisions(raw: &str) -> Result<Vec<ParsedAction>, ParseError> {
    let trimmed = extract_json_block(raw);

    let rows: Vec<RawDecision> = if let Ok(envelope) = serde_json::from_str::<RawEnvelope>(trimmed)
    {
        envelope.decisions
    } else {
        serde_json::from_str::<Vec<RawDecision>>(trimmed).map_err(|e| ParseError {
            reason: e.to_string(),
            raw: raw.to_string(),
        })?
    };

    rows.into_iter()
        .map(|r| {
            into_parsed(r).map_err(|reason| ParseError {
                reason,
                raw: raw.to_string(),
            })
        })
        .collect()
}

/// LLMs routinely wrap JSON in ```json fences or prose; pull out the first
/// balanced `{...}` or `[...]` block rather than failing outright.
fn extract_json_block(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(start) = trimmed.find(['{', '[']) else {
        return trimmed;
    };
    let close = if trimmed.as_bytes()[start] == b'{' {
        '}'
    } else {
        ']'
    };
    match trimmed.rfind(close) {
        Some(end) if end > start => &trimmed[start..=end],
        _ => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_envelope_with_open_action() {
        let raw = r#"{"decisions":[{"action":"open","symbol":"BTCUSDT","side":"long","qty":0.1,"leverage":10}]}"#;
        let parsed = parse_decisions(raw).unwrap();
        assert_eq!(
            parsed[0],
            ParsedAction::Open {
                symbol: "BTCUSDT".into(),
                side: Side::Long,
                qty: 0.1,
                leverage: Some(10),
            }
        );
    }

    #[test]
    fn parses_bare_array_without_envelope() {
        let raw = r#"[{"action":"hold"}]"#;
        let parsed = parse_decisions(raw).unwrap();
        assert_eq!(parsed, vec![ParsedAction::Hold]);
    }

    #[test]
    fn parses_close_with_optional_qty() {
        let raw = r#"{"decisions":[{"action":"close","symbol":"ETHUSDT","side":"short"}]}"#;
        let parsed = parse_decisions(raw).unwrap();
        assert_eq!(
            parsed[0],
            ParsedAction::Close {
                symbol: "ETHUSDT".into(),
                side: Side::Short,
                qty: None,
            }
        );
    }

    #[test]
    fn action_tag_is_case_insensitive() {
        assert_eq!(ActionTag::from_str("OPEN").unwrap(), ActionTag::Open);
        assert_eq!(ActionTag::from_str(" hold ").unwrap(), ActionTag::Hold);
    }

    #[test]
    fn unparseable_garbage_yields_parse_error_with_raw_preserved() {
        let raw = "the model said something unstructured";
        let err = parse_decisions(raw).unwrap_err();
        assert_eq!(err.raw, raw);
    }

    #[test]
    fn open_missing_qty_is_a_parse_error() {
        let raw = r#"{"decisions":[{"action":"open","symbol":"BTCUSDT","side":"long"}]}"#;
        let err = parse_decisions(raw).unwrap_err();
        assert!(err.reason.contains("qty"));
    }

    #[test]
    fn tolerates_markdown_fenced_json() {
        let raw = "```json\n{\"decisions\":[{\"action\":\"hold\"}]}\n```";
        let parsed = parse_decisions(raw).unwrap();
        assert_eq!(parsed, vec![ParsedAction::Hold]);
    }
}
