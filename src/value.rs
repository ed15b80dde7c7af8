//! Payload values carried by promises.
//!
//! The engine is dynamically typed at its edges: a settled payload, a
//! rejection reason, and a progress notification are all [`Value`]s. The enum
//! is closed so resolution dispatch (plain value vs. error value) stays a
//! total match, and everything derives `serde` so collectors can persist
//! timing snapshots verbatim.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A dynamically typed payload value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Absent value (a resolve with no payload).
    Undefined,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<Value>),
    /// String-keyed mapping; ordered so serialized output is stable.
    Map(BTreeMap<String, Value>),
    /// An error value. Resolving with a fault rejects (never unwrapped).
    Fault(Fault),
}

impl Value {
    /// Whether this value is an error value.
    pub fn is_fault(&self) -> bool {
        matches!(self, Value::Fault(_))
    }

    /// Borrow the list elements, if this is a list.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Borrow the map entries, if this is a map.
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Borrow the text, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::Text(s) => write!(f, "{}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(entries) => {
                write!(f, "{{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                write!(f, "}}")
            }
            Value::Fault(fault) => write!(f, "{}", fault),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(entries: BTreeMap<String, Value>) -> Self {
        Value::Map(entries)
    }
}

impl From<Fault> for Value {
    fn from(fault: Fault) -> Self {
        Value::Fault(fault)
    }
}

/// An error value: the payload-level counterpart of a thrown exception.
///
/// Faults flow through the engine as data. A handler that wants to fail its
/// chain returns one; the resolution algorithm rejects the target with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    /// Error class name, e.g. `"Error"` or `"TypeError"`.
    pub name: String,
    pub message: String,
}

impl Fault {
    /// Create a generic fault.
    pub fn new(message: impl Into<String>) -> Self {
        Fault {
            name: "Error".to_string(),
            message: message.into(),
        }
    }

    /// Create a type-error fault (used for self-referential resolution).
    pub fn type_error(message: impl Into<String>) -> Self {
        Fault {
            name: "TypeError".to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

impl std::error::Error for Fault {}
