//! Scalar property values exchanged between plant and controller.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

/// A sensed or actuated physical property. Only scalars cross the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropValue {
    Bool(bool),
    Int(i64),
    Float(f64),
}

/// Property name → value. Ordered so records and payloads are stable.
pub type PropertyMap = BTreeMap<String, PropValue>;

impl PropValue {
    /// Numeric view used by recorders and controllers. Booleans map to 0/1.
    pub fn as_f64(&self) -> f64 {
        match *self {
            PropValue::Bool(b) => {
                if b {
                    1.0
                } else {
                    0.0
                }
            }
            PropValue::Int(i) => i as f64,
            PropValue::Float(f) => f,
        }
    }

    pub fn as_bool(&self) -> bool {
        match *self {
            PropValue::Bool(b) => b,
            PropValue::Int(i) => i != 0,
            PropValue::Float(f) => f != 0.0,
        }
    }

    /// Adds `delta` while keeping the variant where that makes sense.
    pub fn offset(&self, delta: f64) -> PropValue {
        match *self {
            PropValue::Bool(b) => PropValue::Bool(b),
            PropValue::Int(i) => PropValue::Float(i as f64 + delta),
            PropValue::Float(f) => PropValue::Float(f + delta),
        }
    }
}

impl Default for PropValue {
    fn default() -> Self {
        PropValue::Float(0.0)
    }
}

impl From<f64> for PropValue {
    fn from(v: f64) -> Self {
        PropValue::Float(v)
    }
}

impl From<i64> for PropValue {
    fn from(v: i64) -> Self {
        PropValue::Int(v)
    }
}

impl From<bool> for PropValue {
    fn from(v: bool) -> Self {
        PropValue::Bool(v)
    }
}

impl fmt::Display for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropValue::Bool(b) => write!(f, "{b}"),
            PropValue::Int(i) => write!(f, "{i}"),
            PropValue::Float(v) => write!(f, "{v}"),
        }
    }
}
