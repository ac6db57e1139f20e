//! Donation records as received from the upstream feed and as pushed to local subscribers.

use chrono::Local;
use serde::Serialize;
use serde_json::{Map, Number, Value};

use crate::error::PayloadError;

/// Placeholder used when the upstream payload lacks a sender name or handle.
const UNKNOWN_SENDER: &str = "Unknown";

/// Format of [`DonationEvent::timestamp`].
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A single donation, created once when the upstream message arrives and never modified after.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DonationEvent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub timestamp: String,
    pub sender_name: String,
    pub sender_user: String,
    pub amount: Number,
    pub message: String,
    /// The upstream payload exactly as it was received.
    pub raw: Value,
}

/// Classification of one upstream text frame.
#[derive(Debug, PartialEq)]
pub enum Inbound {
    /// Keep-alive traffic, nothing to do.
    KeepAlive,
    Donation(DonationEvent),
    /// Valid JSON that isn't a donation.
    Other,
}

impl DonationEvent {
    /// Amount as a float for threshold comparison.
    pub fn amount_value(&self) -> f64 {
        self.amount.as_f64().unwrap_or_default()
    }

    /// Whether the donation clears the given minimum.
    pub fn qualifies(&self, min_amount: u64) -> bool {
        self.amount_value() >= min_amount as f64
    }

    /// Build an event from a decoded payload, stamped with the current local time. Returns
    /// `None` when the payload doesn't carry both a sender object and an amount.
    pub fn from_payload(raw: Value) -> Option<Self> {
        let obj = raw.as_object()?;
        let sender = obj.get("sender")?.as_object()?;
        let amount = parse_amount(obj.get("amount")?)?;

        Some(Self {
            kind: "donation",
            timestamp: Local::now().format(TIMESTAMP_FORMAT).to_string(),
            sender_name: string_field(sender, "displayName", UNKNOWN_SENDER),
            sender_user: string_field(sender, "username", UNKNOWN_SENDER),
            amount,
            message: string_field(obj, "message", ""),
            raw,
        })
    }
}

/// Decode one upstream text frame.
pub fn parse_inbound(text: &str) -> Result<Inbound, PayloadError> {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("ping") || trimmed.eq_ignore_ascii_case("pong") {
        return Ok(Inbound::KeepAlive);
    }

    let value: Value = serde_json::from_str(trimmed)?;

    if is_keep_alive(&value) {
        return Ok(Inbound::KeepAlive);
    }

    Ok(DonationEvent::from_payload(value)
        .map(Inbound::Donation)
        .unwrap_or(Inbound::Other))
}

fn is_keep_alive(value: &Value) -> bool {
    matches!(
        value.get("type").and_then(Value::as_str),
        Some("ping") | Some("pong")
    )
}

fn string_field(obj: &Map<String, Value>, key: &str, default: &str) -> String {
    match obj.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => default.to_owned(),
        Some(other) => other.to_string(),
    }
}

/// Amounts arrive as JSON numbers, occasionally as numeric strings. Null counts as zero.
fn parse_amount(value: &Value) -> Option<Number> {
    match value {
        Value::Number(n) => Some(n.clone()),
        Value::Null => Some(Number::from(0)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<u64>()
                .map(Number::from)
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(Number::from_f64))
        }
        _ => None,
    }
}
