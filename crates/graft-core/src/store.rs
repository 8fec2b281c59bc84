//! Prototype storage.
//!
//! The store is a collaborator seam: the spawner only ever talks to the
//! [`PrototypeStore`] trait. [`MemoryStore`] is the reference
//! implementation, holding saved records plus a read-only pool of
//! module-registered ones.

use indexmap::IndexMap;
use thiserror::Error;

use crate::entity::{AttrData, TagData};
use crate::prototype::{Prototype, ValidationError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("prototype {0} is registered from code and read-only")]
    ReadOnly(String),
}

/// Lookup keys are lowercased prototype keys.
pub trait PrototypeStore {
    /// Exact, case-insensitive lookup. Module-registered prototypes
    /// shadow saved ones under the same key.
    fn find_prototype(&self, key: &str) -> Option<Prototype>;

    /// Search by key and/or meta tags. With no criteria, everything is
    /// returned. A key query prefers exact (case-insensitive) matches
    /// and falls back to substring matches; tag queries match any of
    /// the given names against `prototype_tags`.
    fn search_prototypes(&self, key: Option<&str>, tags: &[String]) -> Vec<Prototype>;

    /// Upsert by `prototype_key`. Saving over an existing record merges
    /// the given fields into it; the stored (homogenized) record is
    /// returned. A missing or empty `prototype_key` fails validation.
    fn save_prototype(&mut self, record: &Prototype) -> Result<Prototype, StoreError>;

    /// Remove a saved record. Returns false when nothing was stored
    /// under the key. Module-registered records cannot be deleted.
    fn delete_prototype(&mut self, key: &str) -> Result<bool, StoreError>;

    /// The code-registered prototypes, in registration order.
    fn list_module_prototypes(&self) -> Vec<Prototype>;
}

/// In-memory prototype store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    saved: IndexMap<String, Prototype>,
    modules: IndexMap<String, Prototype>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a code-defined prototype. These shadow saved records in
    /// lookups and cannot be saved over or deleted at run time.
    pub fn register_module_prototype(&mut self, record: Prototype) -> Result<(), StoreError> {
        record.validate(true)?;
        let key = match record.prototype_key() {
            Some(k) => k.to_lowercase(),
            None => return Err(ValidationError::MissingPrototypeKey.into()),
        };
        self.modules.insert(key, record.homogenized());
        Ok(())
    }

    fn entries(&self) -> impl Iterator<Item = (&String, &Prototype)> {
        self.modules
            .iter()
            .chain(self.saved.iter().filter(|(k, _)| !self.modules.contains_key(*k)))
    }
}

impl PrototypeStore for MemoryStore {
    fn find_prototype(&self, key: &str) -> Option<Prototype> {
        let key = key.to_lowercase();
        self.modules
            .get(&key)
            .or_else(|| self.saved.get(&key))
            .cloned()
    }

    fn search_prototypes(&self, key: Option<&str>, tags: &[String]) -> Vec<Prototype> {
        let tags: Vec<String> = tags.iter().map(|t| t.to_lowercase()).collect();
        let mut matches: Vec<(&String, &Prototype)> = self
            .entries()
            .filter(|(_, record)| {
                tags.is_empty()
                    || record
                        .prototype_tag_names()
                        .iter()
                        .any(|name| tags.contains(&name.to_lowercase()))
            })
            .collect();

        if let Some(query) = key {
            let query = query.to_lowercase();
            let exact: Vec<(&String, &Prototype)> = matches
                .iter()
                .copied()
                .filter(|(k, _)| **k == query)
                .collect();
            matches = if exact.is_empty() {
                matches
                    .into_iter()
                    .filter(|(k, _)| k.contains(&query))
                    .collect()
            } else {
                exact
            };
        }

        matches.into_iter().map(|(_, record)| record.clone()).collect()
    }

    fn save_prototype(&mut self, record: &Prototype) -> Result<Prototype, StoreError> {
        record.validate(true)?;
        let key = match record.prototype_key() {
            Some(k) => k.to_lowercase(),
            None => return Err(ValidationError::MissingPrototypeKey.into()),
        };
        if self.modules.contains_key(&key) {
            return Err(StoreError::ReadOnly(key));
        }

        let merged = match self.saved.get(&key) {
            Some(existing) => {
                let mut base = existing.clone();
                for (k, v) in record.iter() {
                    base.set(k.clone(), v.clone());
                }
                base
            }
            None => record.clone(),
        };

        let mut canon = merged.homogenized();
        dedup_keyed_fields(&mut canon);
        self.saved.insert(key, canon.clone());
        Ok(canon)
    }

    fn delete_prototype(&mut self, key: &str) -> Result<bool, StoreError> {
        let key = key.to_lowercase();
        if self.modules.contains_key(&key) {
            return Err(StoreError::ReadOnly(key));
        }
        Ok(self.saved.shift_remove(&key).is_some())
    }

    fn list_module_prototypes(&self) -> Vec<Prototype> {
        self.modules.values().cloned().collect()
    }
}

/// Collapse duplicate identities produced by merging a partial update
/// into an existing record: later attr/tag entries override earlier ones
/// of the same name, repeated aliases and permissions collapse.
fn dedup_keyed_fields(record: &mut Prototype) {
    if record.contains_key("attrs") {
        let mut by_name: IndexMap<String, AttrData> = IndexMap::new();
        for attr in record.attrs() {
            by_name.insert(attr.name.clone(), attr);
        }
        record.set(
            "attrs",
            serde_json::Value::Array(by_name.values().map(AttrData::to_value).collect()),
        );
    }
    if record.contains_key("tags") {
        let mut by_name: IndexMap<String, TagData> = IndexMap::new();
        for tag in record.tags() {
            by_name.insert(tag.name.clone(), tag);
        }
        record.set(
            "tags",
            serde_json::Value::Array(by_name.values().map(TagData::to_value).collect()),
        );
    }
    for field in ["aliases", "permissions"] {
        if record.contains_key(field) {
            let mut seen: IndexMap<String, ()> = IndexMap::new();
            let items = match field {
                "aliases" => record.aliases(),
                _ => record.permissions(),
            };
            for item in items {
                seen.entry(item).or_insert(());
            }
            record.set(
                field,
                serde_json::Value::Array(
                    seen.keys().cloned().map(serde_json::Value::String).collect(),
                ),
            );
        }
    }
}
