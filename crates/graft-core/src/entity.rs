//! Entity ids, dbref strings, and the tuple element types shared between
//! prototype records and the world.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Entity ID.
pub type EntityId = i64;

/// Format an entity id as a dbref string (`#12`).
pub fn to_dbref(id: EntityId) -> String {
    format!("#{id}")
}

/// Parse a dbref string (`#12`) into an entity id.
pub fn parse_dbref(s: &str) -> Option<EntityId> {
    s.strip_prefix('#')?.parse().ok()
}

/// Resolve a record value into an entity id. Accepts dbref strings
/// (`"#12"`), bare numeric strings and plain integers.
pub fn value_to_entity_id(value: &Value) -> Option<EntityId> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => parse_dbref(s).or_else(|| s.parse().ok()),
        _ => None,
    }
}

/// Render a value the way it appears inside composed strings: strings
/// bare, null empty, everything else as JSON.
pub fn value_to_display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn opt_string(value: Option<&Value>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(value_to_display(other)),
    }
}

/// One attribute entry: `(name, value, category, lockstring)`.
///
/// The name alone is the attribute's identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttrData {
    pub name: String,
    pub value: Value,
    pub category: Option<String>,
    pub locks: String,
}

impl AttrData {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            category: None,
            locks: String::new(),
        }
    }

    /// Parse a record entry, padding short tuples: `(name, value)` and
    /// `(name, value, category)` fill in a null category and an empty
    /// lockstring. Entries without at least a name and a value are
    /// rejected.
    pub fn from_value(value: &Value) -> Option<Self> {
        let parts = value.as_array()?;
        if parts.len() < 2 {
            return None;
        }
        let name = match &parts[0] {
            Value::String(s) => s.clone(),
            other => value_to_display(other),
        };
        Some(Self {
            name,
            value: parts[1].clone(),
            category: opt_string(parts.get(2)),
            locks: opt_string(parts.get(3)).unwrap_or_default(),
        })
    }

    /// The padded four-element record form.
    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::String(self.name.clone()),
            self.value.clone(),
            self.category
                .as_ref()
                .map_or(Value::Null, |c| Value::String(c.clone())),
            Value::String(self.locks.clone()),
        ])
    }
}

/// One tag entry: `(name, category, data)`.
///
/// The name alone is the tag's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagData {
    pub name: String,
    pub category: Option<String>,
    pub data: Option<String>,
}

impl TagData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: None,
            data: None,
        }
    }

    pub fn with_category(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: Some(category.into()),
            data: None,
        }
    }

    /// Parse a record entry. A bare string is a tag with no category and
    /// no data; arrays are padded with nulls to three elements.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::new(s.clone())),
            Value::Array(parts) if !parts.is_empty() => {
                let name = match &parts[0] {
                    Value::String(s) => s.clone(),
                    other => value_to_display(other),
                };
                Some(Self {
                    name,
                    category: opt_string(parts.get(1)),
                    data: opt_string(parts.get(2)),
                })
            }
            _ => None,
        }
    }

    /// The padded three-element record form.
    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::String(self.name.clone()),
            self.category
                .as_ref()
                .map_or(Value::Null, |c| Value::String(c.clone())),
            self.data
                .as_ref()
                .map_or(Value::Null, |d| Value::String(d.clone())),
        ])
    }
}
