//! # Path Parameter Types
//!
//! Route placeholders accept either a raw regex constraint (`{slug:[a-z-]+}`)
//! or one of a few type specifiers (`{id:int}`). Type specifiers expand to a
//! fixed regex and additionally give the matched value a typed form.

use crate::error::{Error, Result};
use serde_json::Value;
use std::fmt;

/// Named placeholder types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ParamType {
    /// Word characters, kept as text
    #[default]
    String,
    /// Lowercase letters, digits and dashes, kept as text
    Slug,
    /// Signed integer
    Int,
    /// Signed decimal
    Float,
    /// `true`/`false`, `1`/`0` or `yes`/`no`
    Bool,
}

impl ParamType {
    /// Type named by a placeholder specifier, `None` for a regex constraint
    #[must_use]
    pub fn from_specifier(s: &str) -> Option<Self> {
        let ty = match s.to_ascii_lowercase().as_str() {
            "string" | "str" => Self::String,
            "slug" => Self::Slug,
            "int" | "integer" | "i64" => Self::Int,
            "float" | "f64" | "number" => Self::Float,
            "bool" | "boolean" => Self::Bool,
            _ => return None,
        };
        Some(ty)
    }

    /// Regex fragment a placeholder of this type matches
    #[must_use]
    pub const fn pattern(self) -> &'static str {
        match self {
            Self::String => r"\w+",
            Self::Slug => r"[a-z0-9]+(?:-[a-z0-9]+)*",
            Self::Int => r"-?\d+",
            Self::Float => r"-?\d+(?:\.\d+)?",
            Self::Bool => r"(?i:true|false|yes|no|1|0)",
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Slug => "slug",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Matched parameter in its typed form
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// Text (`string`, `slug` and regex-constrained placeholders)
    String(String),
    /// `int` placeholder
    Int(i64),
    /// `float` placeholder
    Float(f64),
    /// `bool` placeholder
    Bool(bool),
}

impl ParamValue {
    /// Integer value, if this is an `int` parameter
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        if let Self::Int(i) = self {
            Some(*i)
        } else {
            None
        }
    }

    /// Float value; `int` parameters widen
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Boolean value, if this is a `bool` parameter
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        if let Self::Bool(b) = self {
            Some(*b)
        } else {
            None
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&ParamValue> for Value {
    fn from(param: &ParamValue) -> Self {
        match param {
            ParamValue::String(s) => Self::String(s.clone()),
            ParamValue::Int(i) => Self::from(*i),
            ParamValue::Float(f) => Self::from(*f),
            ParamValue::Bool(b) => Self::Bool(*b),
        }
    }
}

/// Convert a matched segment to the placeholder's type
///
/// # Errors
///
/// `InvalidRoutePattern` when `raw` does not parse as `param_type`.
pub fn convert_param(raw: &str, param_type: ParamType) -> Result<ParamValue> {
    let value = match param_type {
        ParamType::String | ParamType::Slug => Some(ParamValue::String(raw.to_string())),
        ParamType::Int => raw.parse().ok().map(ParamValue::Int),
        ParamType::Float => raw.parse().ok().map(ParamValue::Float),
        ParamType::Bool => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(ParamValue::Bool(true)),
            "false" | "0" | "no" => Some(ParamValue::Bool(false)),
            _ => None,
        },
    };
    value.ok_or_else(|| Error::InvalidRoutePattern {
        pattern: raw.to_string(),
        reason: format!("'{raw}' is not a valid {param_type}"),
    })
}
