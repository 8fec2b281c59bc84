//! Prototype records and homogenization.
//!
//! A prototype is a flat, ordered map of field name to JSON value. A
//! handful of field names are reserved; every other top-level key is
//! shorthand for an attribute and is folded into `attrs` during
//! homogenization.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::entity::{AttrData, TagData, value_to_display};

/// Typeclass given to records that specify neither `typeclass` nor
/// `prototype_parent`.
pub const DEFAULT_TYPECLASS: &str = "core.objects.Object";

/// Lockstring given to records that do not set `prototype_locks`.
pub const PROTOTYPE_FALLBACK_LOCKSTRING: &str = "spawn:all();edit:all()";

/// Tag category marking an object as spawned from a prototype. The tag
/// name is the lowercased prototype key.
pub const PROTOTYPE_TAG_CATEGORY: &str = "from_prototype";

/// Tag category used when `prototype_tags` are materialized as tags on
/// stored records.
pub const PROTOTYPE_TAG_META_CATEGORY: &str = "prototype_meta";

/// Scalar fields with reserved meaning.
pub const RESERVED_SCALAR_KEYS: &[&str] = &[
    "prototype_key",
    "prototype_parent",
    "typeclass",
    "key",
    "location",
    "home",
    "destination",
    "prototype_desc",
    "prototype_locks",
    "prototype_tags",
    "locks",
];

/// Keyed multi-valued fields: sequences whose elements carry a stable
/// identity (the first tuple element, or the bare string itself).
pub const RESERVED_KEYED_KEYS: &[&str] = &["attrs", "tags", "aliases", "permissions"];

/// Fields that describe the prototype itself and are never written to a
/// spawned object.
pub const PROTOTYPE_META_KEYS: &[&str] = &[
    "prototype_key",
    "prototype_desc",
    "prototype_locks",
    "prototype_tags",
];

pub fn is_reserved_key(key: &str) -> bool {
    RESERVED_SCALAR_KEYS.contains(&key) || RESERVED_KEYED_KEYS.contains(&key)
}

pub fn is_meta_key(key: &str) -> bool {
    PROTOTYPE_META_KEYS.contains(&key)
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("prototype requires a non-empty prototype_key")]
    MissingPrototypeKey,

    #[error("prototype field {field} is malformed: {reason}")]
    MalformedField { field: String, reason: String },
}

/// A prototype record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Prototype {
    fields: Map<String, Value>,
}

impl Prototype {
    pub fn new() -> Self {
        Self { fields: Map::new() }
    }

    pub fn from_map(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Build a record from a JSON object. Returns `None` for any other
    /// value shape.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self { fields }),
            _ => None,
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.fields
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.fields
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    /// Remove a field, preserving the order of the remaining ones.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.shift_remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn iter(&self) -> serde_json::map::Iter<'_> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    // =========================================================================
    // Typed accessors
    // =========================================================================

    pub fn prototype_key(&self) -> Option<&str> {
        self.get("prototype_key").and_then(Value::as_str)
    }

    pub fn key(&self) -> Option<&str> {
        self.get("key").and_then(Value::as_str)
    }

    pub fn typeclass(&self) -> Option<&str> {
        self.get("typeclass").and_then(Value::as_str)
    }

    pub fn prototype_desc(&self) -> Option<&str> {
        self.get("prototype_desc").and_then(Value::as_str)
    }

    pub fn prototype_locks(&self) -> Option<&str> {
        self.get("prototype_locks").and_then(Value::as_str)
    }

    pub fn locks(&self) -> Option<&str> {
        self.get("locks").and_then(Value::as_str)
    }

    /// Parent prototype keys in listing order. `prototype_parent` may be
    /// a single key or a list of keys.
    pub fn parents(&self) -> Vec<String> {
        match self.get("prototype_parent") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => value_to_display(other),
                })
                .collect(),
            Some(other) => vec![value_to_display(other)],
        }
    }

    /// Parsed `attrs` entries, padded. Malformed entries are dropped.
    pub fn attrs(&self) -> Vec<AttrData> {
        match self.get("attrs") {
            Some(Value::Array(items)) => items.iter().filter_map(AttrData::from_value).collect(),
            _ => Vec::new(),
        }
    }

    /// Parsed `tags` entries, padded. Malformed entries are dropped.
    pub fn tags(&self) -> Vec<TagData> {
        match self.get("tags") {
            Some(Value::Array(items)) => items.iter().filter_map(TagData::from_value).collect(),
            _ => Vec::new(),
        }
    }

    pub fn aliases(&self) -> Vec<String> {
        string_list(self.get("aliases"))
    }

    pub fn permissions(&self) -> Vec<String> {
        string_list(self.get("permissions"))
    }

    /// Names of `prototype_tags`, whether given as bare strings or as
    /// `(name, category)` pairs.
    pub fn prototype_tag_names(&self) -> Vec<String> {
        match self.get("prototype_tags") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.clone()),
                    Value::Array(parts) => parts.first().and_then(Value::as_str).map(str::to_owned),
                    _ => None,
                })
                .collect(),
            Some(Value::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        }
    }

    // =========================================================================
    // Homogenization
    // =========================================================================

    /// The canonical form of this record. The input is not modified.
    ///
    /// Non-reserved top-level keys fold into `attrs` (after any explicit
    /// entries), short attr/tag tuples are padded, bare alias and
    /// permission strings become one-element lists, null multi-value
    /// fields become empty lists and the `prototype_*` meta fields are
    /// given their defaults. A missing `prototype_key` is synthesized;
    /// a record with neither `typeclass` nor `prototype_parent` gets the
    /// default typeclass.
    pub fn homogenized(&self) -> Prototype {
        let mut attrs: Vec<AttrData> = Vec::new();
        if let Some(Value::Array(items)) = self.get("attrs") {
            for entry in items {
                match AttrData::from_value(entry) {
                    Some(attr) => attrs.push(attr),
                    None => warn!(entry = %entry, "skipping malformed attr entry"),
                }
            }
        }
        for (key, value) in &self.fields {
            if !is_reserved_key(key) {
                attrs.push(AttrData::new(key.clone(), value.clone()));
            }
        }

        let mut tags: Vec<TagData> = Vec::new();
        if let Some(Value::Array(items)) = self.get("tags") {
            for entry in items {
                match TagData::from_value(entry) {
                    Some(tag) => tags.push(tag),
                    None => warn!(entry = %entry, "skipping malformed tag entry"),
                }
            }
        }

        let mut out = Map::new();
        for (key, value) in &self.fields {
            match key.as_str() {
                "attrs" | "tags" => {}
                "aliases" | "permissions" => {
                    let items = string_list(Some(value));
                    out.insert(
                        key.clone(),
                        Value::Array(items.into_iter().map(Value::String).collect()),
                    );
                }
                "prototype_tags" => {
                    out.insert(key.clone(), normalize_prototype_tags(value));
                }
                "prototype_key" if value.is_null() => {
                    out.insert(key.clone(), Value::String(String::new()));
                }
                _ if is_reserved_key(key) => {
                    out.insert(key.clone(), value.clone());
                }
                _ => {}
            }
        }

        if !attrs.is_empty() {
            out.insert(
                "attrs".to_string(),
                Value::Array(attrs.iter().map(AttrData::to_value).collect()),
            );
        }
        if !tags.is_empty() {
            out.insert(
                "tags".to_string(),
                Value::Array(tags.iter().map(TagData::to_value).collect()),
            );
        }

        if !out.contains_key("prototype_key") {
            out.insert(
                "prototype_key".to_string(),
                Value::String(generate_prototype_key()),
            );
        }
        if !out.contains_key("prototype_tags") {
            out.insert("prototype_tags".to_string(), Value::Array(Vec::new()));
        }
        if !out.contains_key("prototype_locks") {
            out.insert(
                "prototype_locks".to_string(),
                Value::String(PROTOTYPE_FALLBACK_LOCKSTRING.to_string()),
            );
        }
        if !out.contains_key("prototype_desc") {
            out.insert("prototype_desc".to_string(), Value::String(String::new()));
        }
        if !self.fields.contains_key("typeclass") && !self.fields.contains_key("prototype_parent") {
            out.insert(
                "typeclass".to_string(),
                Value::String(DEFAULT_TYPECLASS.to_string()),
            );
        }

        Prototype { fields: out }
    }

    /// Check the record's identity field.
    ///
    /// An explicitly empty (or non-string) `prototype_key` always fails.
    /// A missing one fails only when `require_key` is set; spawn roots
    /// may omit it and have one synthesized during homogenization.
    pub fn validate(&self, require_key: bool) -> Result<(), ValidationError> {
        match self.get("prototype_key") {
            None => {
                if require_key {
                    return Err(ValidationError::MissingPrototypeKey);
                }
            }
            Some(Value::String(s)) if !s.trim().is_empty() => {}
            Some(_) => return Err(ValidationError::MissingPrototypeKey),
        }
        Ok(())
    }
}

impl From<Map<String, Value>> for Prototype {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

fn generate_prototype_key() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("prototype-{}", &id[..8])
}

/// Coerce a field into a list of strings. A bare string becomes a
/// one-element list; null becomes empty.
fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => value_to_display(other),
            })
            .collect(),
        Some(other) => vec![value_to_display(other)],
    }
}

fn normalize_prototype_tags(value: &Value) -> Value {
    match value {
        Value::Null => Value::Array(Vec::new()),
        Value::String(s) => Value::Array(vec![Value::String(s.clone())]),
        other => other.clone(),
    }
}
