//! ---
//! mes_section: "01-core-functionality"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Shared primitives and utilities for the integration engine."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declared data kind of a tag.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    Boolean,
    Integer,
    Float,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Boolean => "boolean",
            DataKind::Integer => "integer",
            DataKind::Float => "float",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed value carried by a signal.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SignalValue {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl SignalValue {
    pub fn kind(&self) -> DataKind {
        match self {
            SignalValue::Bool(_) => DataKind::Boolean,
            SignalValue::Int(_) => DataKind::Integer,
            SignalValue::Float(_) => DataKind::Float,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SignalValue::Bool(value) => Some(*value),
            SignalValue::Int(value) => Some(*value != 0),
            SignalValue::Float(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SignalValue::Int(value) => Some(*value),
            SignalValue::Bool(value) => Some(i64::from(*value)),
            SignalValue::Float(_) => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SignalValue::Float(value) => Some(*value),
            SignalValue::Int(value) => Some(*value as f64),
            SignalValue::Bool(_) => None,
        }
    }

    /// Interpret a device-native payload as a value of `kind`.
    ///
    /// Returns `None` for payloads that cannot represent the declared kind; the
    /// bridge treats those as malformed.
    pub fn coerce(kind: DataKind, raw: &Value) -> Option<Self> {
        match kind {
            DataKind::Boolean => match raw {
                Value::Bool(value) => Some(SignalValue::Bool(*value)),
                Value::Number(number) => match number.as_u64() {
                    Some(0) => Some(SignalValue::Bool(false)),
                    Some(1) => Some(SignalValue::Bool(true)),
                    _ => None,
                },
                _ => None,
            },
            DataKind::Integer => raw.as_i64().map(SignalValue::Int),
            DataKind::Float => raw
                .as_f64()
                .filter(|value| value.is_finite())
                .map(SignalValue::Float),
        }
    }

    /// Render the value into the device-native JSON representation.
    pub fn to_raw(&self) -> Value {
        match self {
            SignalValue::Bool(value) => Value::Bool(*value),
            SignalValue::Int(value) => Value::from(*value),
            SignalValue::Float(value) => Value::from(*value),
        }
    }
}

impl fmt::Display for SignalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalValue::Bool(value) => write!(f, "{value}"),
            SignalValue::Int(value) => write!(f, "{value}"),
            SignalValue::Float(value) => write!(f, "{value}"),
        }
    }
}

/// Quality flag attached to every signal.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalQuality {
    #[default]
    Good,
    Stale,
    Bad,
}

impl SignalQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalQuality::Good => "GOOD",
            SignalQuality::Stale => "STALE",
            SignalQuality::Bad => "BAD",
        }
    }
}

impl fmt::Display for SignalQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last known state of a logical process variable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signal {
    pub name: String,
    pub address: String,
    pub kind: DataKind,
    pub value: Option<SignalValue>,
    pub timestamp: Option<DateTime<Utc>>,
    pub quality: SignalQuality,
}

impl Signal {
    /// A registered signal that has not been read yet. It starts `STALE` until
    /// the first value arrives.
    pub fn unread(name: impl Into<String>, address: impl Into<String>, kind: DataKind) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            kind,
            value: None,
            timestamp: None,
            quality: SignalQuality::Stale,
        }
    }
}

/// Why an event was produced by the bridge.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOrigin {
    /// Value change reported by the device.
    Incremental,
    /// Full re-read performed after (re)connecting.
    Resync,
    /// Quality transition detected by the bridge itself (staleness, malformed payload).
    Quality,
}

/// Typed event delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalEvent {
    pub signal: String,
    pub value: Option<SignalValue>,
    pub quality: SignalQuality,
    pub timestamp: DateTime<Utc>,
    pub origin: UpdateOrigin,
}

impl SignalEvent {
    /// Value usable for process logic: present and `GOOD`.
    pub fn good_value(&self) -> Option<SignalValue> {
        match self.quality {
            SignalQuality::Good => self.value,
            _ => None,
        }
    }
}
