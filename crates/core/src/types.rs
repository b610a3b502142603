use std::fmt;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Reference to output slot `slot` of node `node_id`.
///
/// Serialized as the two-element array `[node_id, slot]` the execution engine
/// expects for links between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeRef {
    pub node_id: String,
    pub slot: u32,
}

impl EdgeRef {
    pub fn new(node_id: impl Into<String>, slot: u32) -> Self {
        Self {
            node_id: node_id.into(),
            slot,
        }
    }
}

impl fmt::Display for EdgeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.node_id, self.slot)
    }
}

impl Serialize for EdgeRef {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (&self.node_id, self.slot).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EdgeRef {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        edge_from_json(&value)
            .ok_or_else(|| D::Error::custom(format!("expected [node_id, slot], got {value}")))
    }
}

/// A node input: either a literal parameter or a link to another node's output.
#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    Link(EdgeRef),
    Literal(serde_json::Value),
}

impl InputValue {
    pub fn link(node_id: impl Into<String>, slot: u32) -> Self {
        Self::Link(EdgeRef::new(node_id, slot))
    }

    pub fn literal(value: impl Into<serde_json::Value>) -> Self {
        Self::Literal(value.into())
    }

    pub fn as_link(&self) -> Option<&EdgeRef> {
        match self {
            Self::Link(edge) => Some(edge),
            Self::Literal(_) => None,
        }
    }

    pub fn as_literal(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Link(_) => None,
            Self::Literal(value) => Some(value),
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_literal().and_then(serde_json::Value::as_u64)
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_literal().and_then(serde_json::Value::as_f64)
    }
}

impl From<EdgeRef> for InputValue {
    fn from(edge: EdgeRef) -> Self {
        Self::Link(edge)
    }
}

impl Serialize for InputValue {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Link(edge) => edge.serialize(serializer),
            Self::Literal(value) => value.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for InputValue {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(match edge_from_json(&value) {
            Some(edge) => Self::Link(edge),
            None => Self::Literal(value),
        })
    }
}

// Only `[string, unsigned int]` is a link; any other array (e.g. a list of
// literals) stays a literal.
fn edge_from_json(value: &serde_json::Value) -> Option<EdgeRef> {
    let [node_id, slot] = value.as_array()?.as_slice() else {
        return None;
    };
    let node_id = node_id.as_str()?;
    let slot = u32::try_from(slot.as_u64()?).ok()?;
    Some(EdgeRef::new(node_id, slot))
}
