//! Value model for metadata variables
//!
//! A variable holds one of five concrete kinds of content. Deferred
//! expressions live one level up (see [`crate::variable::RawValue`]) because
//! they only become a [`Value`] once evaluated against a scope.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// The concrete kind of a variable, fixed at first assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Str,
    List,
    Map,
    Bool,
    Int,
}

impl Kind {
    /// String and List accept prepend/append amendments.
    pub fn is_sequence(self) -> bool {
        matches!(self, Kind::Str | Kind::List)
    }

    /// Whether a value of kind `other` may stand in for this kind.
    ///
    /// Only a string may stand in for a list; it is split on the variable's
    /// separator characters when resolved.
    pub fn accepts_fixup(self, other: Kind) -> bool {
        self == Kind::List && other == Kind::Str
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Str => "string",
            Kind::List => "list",
            Kind::Map => "map",
            Kind::Bool => "bool",
            Kind::Int => "int",
        };
        f.write_str(name)
    }
}

/// Concrete content of a variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Value {
    Str(String),
    List(Vec<String>),
    Map(BTreeMap<String, Value>),
    Bool(bool),
    Int(i64),
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Str(_) => Kind::Str,
            Value::List(_) => Kind::List,
            Value::Map(_) => Kind::Map,
            Value::Bool(_) => Kind::Bool,
            Value::Int(_) => Kind::Int,
        }
    }

    /// The value an unset variable of `kind` resolves to.
    pub fn empty(kind: Kind) -> Self {
        match kind {
            Kind::Str => Value::Str(String::new()),
            Kind::List => Value::List(Vec::new()),
            Kind::Map => Value::Map(BTreeMap::new()),
            Kind::Bool => Value::Bool(false),
            Kind::Int => Value::Int(0),
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Map(m) => !m.is_empty(),
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
        }
    }

    /// Textual form used by `${NAME}` interpolation.
    ///
    /// Lists are joined by a single space, booleans render as `1`/`0`.
    /// Maps have no textual form.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Str(s) => Some(s.clone()),
            Value::List(l) => Some(l.join(" ")),
            Value::Map(_) => None,
            Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
            Value::Int(i) => Some(i.to_string()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

/// Split `text` into fields on any run of the characters in `separator`.
///
/// Leading and trailing separators never produce empty fields.
pub fn split_fields(text: &str, separator: &str) -> Vec<String> {
    text.split(|c| separator.contains(c))
        .filter(|field| !field.is_empty())
        .map(str::to_string)
        .collect()
}

/// Stable, quoted rendering used by dumps and signatures.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{s:?}"),
            Value::List(l) => {
                f.write_str("[")?;
                for (i, item) in l.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item:?}")?;
                }
                f.write_str("]")
            }
            Value::Map(m) => {
                f.write_str("{")?;
                for (i, (key, value)) in m.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key:?}: {value}")?;
                }
                f.write_str("}")
            }
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<String>> for Value {
    fn from(l: Vec<String>) -> Self {
        Value::List(l)
    }
}

impl From<Vec<&str>> for Value {
    fn from(l: Vec<&str>) -> Self {
        Value::List(l.into_iter().map(str::to_string).collect())
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(m: BTreeMap<String, Value>) -> Self {
        Value::Map(m)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

/// String expansion policy for a variable's final string value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpandMode {
    /// Undefined references are an error.
    #[default]
    Full,
    /// Undefined references are left as `${NAME}`.
    Partial,
    /// Undefined references expand to the empty string.
    Clean,
    /// No interpolation at all.
    No,
}

impl FromStr for ExpandMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "full" | "1" => Ok(ExpandMode::Full),
            "partial" => Ok(ExpandMode::Partial),
            "clean" => Ok(ExpandMode::Clean),
            "no" | "0" => Ok(ExpandMode::No),
            other => Err(format!("unknown expand mode: {other}")),
        }
    }
}

impl fmt::Display for ExpandMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExpandMode::Full => "full",
            ExpandMode::Partial => "partial",
            ExpandMode::Clean => "clean",
            ExpandMode::No => "no",
        };
        f.write_str(name)
    }
}
