use crate::error::{MessageField, ParseError};
use serde::Serialize;
use std::fmt;

const FIELD_SEPARATOR: char = '|';

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Push,
    Ping,
    Other(String),
}

impl MessageKind {
    fn from_token(token: &str) -> Self {
        match token {
            "push" => MessageKind::Push,
            "ping" => MessageKind::Ping,
            other => MessageKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::Push => "push",
            MessageKind::Ping => "ping",
            MessageKind::Other(token) => token,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One telemetry line sent by the scale firmware: `type|message_id|rssi|value`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleMessage {
    pub kind: MessageKind,
    pub message_id: i64,
    pub rssi: f64,
    /// Weight in grams. Absent or empty parses as `0`.
    pub value: f64,
}

pub fn parse_scale_message(raw: &str) -> Result<ScaleMessage, ParseError> {
    let fields: Vec<&str> = raw.trim().split(FIELD_SEPARATOR).collect();
    if fields.len() < 3 {
        return Err(ParseError::TooFewFields {
            found: fields.len(),
        });
    }

    // The firmware sometimes appends extra separators; only empty trailing fields are allowed.
    if let Some(extra) = fields.iter().skip(4).find(|field| !field.trim().is_empty()) {
        return Err(ParseError::UnexpectedField {
            raw: extra.to_string(),
        });
    }

    let token = fields[0].trim();
    if token.is_empty() {
        return Err(ParseError::Missing {
            field: MessageField::Type,
        });
    }

    let message_id =
        parse_required(fields[1], MessageField::MessageId, |raw| raw.parse::<i64>().ok())?;
    let rssi = parse_required(fields[2], MessageField::Rssi, parse_finite)?;
    let value = match fields.get(3).map(|raw| raw.trim()) {
        None | Some("") => 0.0,
        Some(raw) => parse_finite(raw).ok_or_else(|| ParseError::NotANumber {
            field: MessageField::Value,
            raw: raw.to_string(),
        })?,
    };

    Ok(ScaleMessage {
        kind: MessageKind::from_token(token),
        message_id,
        rssi,
        value,
    })
}

fn parse_required<T>(
    raw: &str,
    field: MessageField,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, ParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Missing { field });
    }
    parse(trimmed).ok_or_else(|| ParseError::NotANumber {
        field,
        raw: trimmed.to_string(),
    })
}

fn parse_finite(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|value| value.is_finite())
}
