//! A dynamic value model for interpreter hosts.
//!
//! Hosts with their own value representation only need `Serialize` on it;
//! this type exists for hosts that do not, and as the reference for what an
//! unserializable value looks like.

use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A dynamically typed runtime value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    /// String-keyed mapping. Ordered, so that equal dicts encode equally.
    Dict(BTreeMap<String, Value>),
    /// Live external state. Never encodes.
    Handle(Handle),
}

impl Value {
    /// Whether this value, or anything nested in it, is a handle.
    pub fn contains_handle(&self) -> bool {
        match self {
            Self::Handle(_) => true,
            Self::List(items) | Self::Tuple(items) => items.iter().any(Self::contains_handle),
            Self::Dict(map) => map.values().any(Self::contains_handle),
            _ => false,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.into())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}

/// An opaque reference to live external state, such as an open file or a
/// socket.
#[derive(Clone, PartialEq, Eq)]
pub struct Handle {
    /// What kind of resource this is, for diagnostics.
    pub kind: &'static str,
    /// Host-assigned identity.
    pub id: u64,
}

impl Debug for Handle {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "<{} #{}>", self.kind, self.id)
    }
}

impl Serialize for Handle {
    fn serialize<S: Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
        Err(serde::ser::Error::custom(format_args!(
            "cannot serialize {} handle #{}",
            self.kind, self.id
        )))
    }
}

impl<'de> Deserialize<'de> for Handle {
    fn deserialize<D: Deserializer<'de>>(_: D) -> Result<Self, D::Error> {
        Err(serde::de::Error::custom("handles cannot be deserialized"))
    }
}
