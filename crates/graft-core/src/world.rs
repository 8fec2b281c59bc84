//! The entity collaborator seam.
//!
//! The spawner never touches game objects directly; everything goes
//! through the [`World`] trait. [`MemoryWorld`] is the reference
//! implementation used in tests.

use indexmap::{IndexMap, IndexSet};
use serde_json::Value;
use thiserror::Error;

use crate::entity::{AttrData, EntityId, TagData, parse_dbref};
use crate::prototype::DEFAULT_TYPECLASS;

#[derive(Debug, Error)]
pub enum WorldError {
    #[error("entity not found: {0}")]
    EntityNotFound(EntityId),

    #[error("unknown typeclass: {0}")]
    UnknownTypeclass(String),

    #[error("invalid entity reference: {0}")]
    InvalidRef(String),
}

/// The window onto live game state.
///
/// Tag names and categories are case-insensitive (stored lowercased);
/// permissions are stored lowercased; attribute names are
/// case-sensitive and keyed by `(name, category)`.
pub trait World {
    fn create_entity(
        &mut self,
        typeclass: &str,
        key: &str,
        location: Option<EntityId>,
        home: Option<EntityId>,
        destination: Option<EntityId>,
    ) -> Result<EntityId, WorldError>;

    fn set_key(&mut self, id: EntityId, key: &str) -> Result<(), WorldError>;
    fn set_typeclass(&mut self, id: EntityId, typeclass: &str) -> Result<(), WorldError>;
    fn set_location(&mut self, id: EntityId, location: Option<EntityId>) -> Result<(), WorldError>;
    fn set_home(&mut self, id: EntityId, home: Option<EntityId>) -> Result<(), WorldError>;
    fn set_destination(
        &mut self,
        id: EntityId,
        destination: Option<EntityId>,
    ) -> Result<(), WorldError>;
    fn set_locks(&mut self, id: EntityId, locks: &str) -> Result<(), WorldError>;

    /// Replace the whole permission list.
    fn set_permissions(&mut self, id: EntityId, permissions: &[String]) -> Result<(), WorldError>;

    fn add_alias(&mut self, id: EntityId, alias: &str) -> Result<(), WorldError>;
    fn remove_alias(&mut self, id: EntityId, alias: &str) -> Result<(), WorldError>;
    fn clear_aliases(&mut self, id: EntityId) -> Result<(), WorldError>;

    fn add_tag(
        &mut self,
        id: EntityId,
        name: &str,
        category: Option<&str>,
        data: Option<&str>,
    ) -> Result<(), WorldError>;
    fn remove_tag(
        &mut self,
        id: EntityId,
        name: &str,
        category: Option<&str>,
    ) -> Result<(), WorldError>;
    /// Remove every tag in the given category (`None` is the
    /// uncategorized bucket).
    fn clear_tags(&mut self, id: EntityId, category: Option<&str>) -> Result<(), WorldError>;

    fn set_attr(
        &mut self,
        id: EntityId,
        name: &str,
        value: Value,
        category: Option<&str>,
        locks: &str,
    ) -> Result<(), WorldError>;
    fn remove_attr(
        &mut self,
        id: EntityId,
        name: &str,
        category: Option<&str>,
    ) -> Result<(), WorldError>;
    fn clear_attrs(&mut self, id: EntityId) -> Result<(), WorldError>;

    fn get_key(&self, id: EntityId) -> Result<String, WorldError>;
    fn get_typeclass(&self, id: EntityId) -> Result<String, WorldError>;
    fn get_location(&self, id: EntityId) -> Result<Option<EntityId>, WorldError>;
    fn get_home(&self, id: EntityId) -> Result<Option<EntityId>, WorldError>;
    fn get_destination(&self, id: EntityId) -> Result<Option<EntityId>, WorldError>;
    fn get_locks(&self, id: EntityId) -> Result<String, WorldError>;
    fn get_permissions(&self, id: EntityId) -> Result<Vec<String>, WorldError>;
    fn get_aliases(&self, id: EntityId) -> Result<Vec<String>, WorldError>;
    fn get_tags(&self, id: EntityId) -> Result<Vec<TagData>, WorldError>;
    fn get_attrs(&self, id: EntityId) -> Result<Vec<AttrData>, WorldError>;

    /// Entities matching a key, alias or dbref, case-insensitively.
    fn find_by_key(&self, query: &str) -> Vec<EntityId>;

    /// Entities carrying a tag. The category must match exactly
    /// (`None` matches only uncategorized tags).
    fn find_by_tag(&self, name: &str, category: Option<&str>) -> Vec<EntityId>;
}

#[derive(Debug, Clone, Default)]
struct EntityRecord {
    key: String,
    typeclass: String,
    location: Option<EntityId>,
    home: Option<EntityId>,
    destination: Option<EntityId>,
    locks: String,
    permissions: Vec<String>,
    aliases: Vec<String>,
    tags: Vec<TagData>,
    attrs: IndexMap<(String, Option<String>), AttrData>,
}

/// In-memory world.
#[derive(Debug)]
pub struct MemoryWorld {
    entities: IndexMap<EntityId, EntityRecord>,
    typeclasses: IndexSet<String>,
    next_id: EntityId,
}

impl Default for MemoryWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryWorld {
    pub fn new() -> Self {
        let mut typeclasses = IndexSet::new();
        typeclasses.insert(DEFAULT_TYPECLASS.to_string());
        Self {
            entities: IndexMap::new(),
            typeclasses,
            next_id: 1,
        }
    }

    /// Make a typeclass path spawnable.
    pub fn register_typeclass(&mut self, path: impl Into<String>) {
        self.typeclasses.insert(path.into());
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    fn entity(&self, id: EntityId) -> Result<&EntityRecord, WorldError> {
        self.entities.get(&id).ok_or(WorldError::EntityNotFound(id))
    }

    fn entity_mut(&mut self, id: EntityId) -> Result<&mut EntityRecord, WorldError> {
        self.entities
            .get_mut(&id)
            .ok_or(WorldError::EntityNotFound(id))
    }

    fn check_target(&self, target: Option<EntityId>) -> Result<(), WorldError> {
        if let Some(target) = target {
            if !self.entities.contains_key(&target) {
                return Err(WorldError::EntityNotFound(target));
            }
        }
        Ok(())
    }

    fn check_typeclass(&self, typeclass: &str) -> Result<(), WorldError> {
        if !self.typeclasses.contains(typeclass) {
            return Err(WorldError::UnknownTypeclass(typeclass.to_string()));
        }
        Ok(())
    }
}

impl World for MemoryWorld {
    fn create_entity(
        &mut self,
        typeclass: &str,
        key: &str,
        location: Option<EntityId>,
        home: Option<EntityId>,
        destination: Option<EntityId>,
    ) -> Result<EntityId, WorldError> {
        self.check_typeclass(typeclass)?;
        self.check_target(location)?;
        self.check_target(home)?;
        self.check_target(destination)?;
        let id = self.next_id;
        self.next_id += 1;
        self.entities.insert(
            id,
            EntityRecord {
                key: key.to_string(),
                typeclass: typeclass.to_string(),
                location,
                home,
                destination,
                ..EntityRecord::default()
            },
        );
        Ok(id)
    }

    fn set_key(&mut self, id: EntityId, key: &str) -> Result<(), WorldError> {
        self.entity_mut(id)?.key = key.to_string();
        Ok(())
    }

    fn set_typeclass(&mut self, id: EntityId, typeclass: &str) -> Result<(), WorldError> {
        self.check_typeclass(typeclass)?;
        self.entity_mut(id)?.typeclass = typeclass.to_string();
        Ok(())
    }

    fn set_location(&mut self, id: EntityId, location: Option<EntityId>) -> Result<(), WorldError> {
        self.check_target(location)?;
        self.entity_mut(id)?.location = location;
        Ok(())
    }

    fn set_home(&mut self, id: EntityId, home: Option<EntityId>) -> Result<(), WorldError> {
        self.check_target(home)?;
        self.entity_mut(id)?.home = home;
        Ok(())
    }

    fn set_destination(
        &mut self,
        id: EntityId,
        destination: Option<EntityId>,
    ) -> Result<(), WorldError> {
        self.check_target(destination)?;
        self.entity_mut(id)?.destination = destination;
        Ok(())
    }

    fn set_locks(&mut self, id: EntityId, locks: &str) -> Result<(), WorldError> {
        self.entity_mut(id)?.locks = locks.to_string();
        Ok(())
    }

    fn set_permissions(&mut self, id: EntityId, permissions: &[String]) -> Result<(), WorldError> {
        self.entity_mut(id)?.permissions =
            permissions.iter().map(|p| p.to_lowercase()).collect();
        Ok(())
    }

    fn add_alias(&mut self, id: EntityId, alias: &str) -> Result<(), WorldError> {
        let record = self.entity_mut(id)?;
        if !record.aliases.iter().any(|a| a == alias) {
            record.aliases.push(alias.to_string());
        }
        Ok(())
    }

    fn remove_alias(&mut self, id: EntityId, alias: &str) -> Result<(), WorldError> {
        self.entity_mut(id)?.aliases.retain(|a| a != alias);
        Ok(())
    }

    fn clear_aliases(&mut self, id: EntityId) -> Result<(), WorldError> {
        self.entity_mut(id)?.aliases.clear();
        Ok(())
    }

    fn add_tag(
        &mut self,
        id: EntityId,
        name: &str,
        category: Option<&str>,
        data: Option<&str>,
    ) -> Result<(), WorldError> {
        let tag = TagData {
            name: name.to_lowercase(),
            category: category.map(|c| c.to_lowercase()),
            data: data.map(str::to_owned),
        };
        let record = self.entity_mut(id)?;
        record
            .tags
            .retain(|t| !(t.name == tag.name && t.category == tag.category));
        record.tags.push(tag);
        Ok(())
    }

    fn remove_tag(
        &mut self,
        id: EntityId,
        name: &str,
        category: Option<&str>,
    ) -> Result<(), WorldError> {
        let name = name.to_lowercase();
        let category = category.map(|c| c.to_lowercase());
        self.entity_mut(id)?
            .tags
            .retain(|t| !(t.name == name && t.category == category));
        Ok(())
    }

    fn clear_tags(&mut self, id: EntityId, category: Option<&str>) -> Result<(), WorldError> {
        let category = category.map(|c| c.to_lowercase());
        self.entity_mut(id)?
            .tags
            .retain(|t| t.category != category);
        Ok(())
    }

    fn set_attr(
        &mut self,
        id: EntityId,
        name: &str,
        value: Value,
        category: Option<&str>,
        locks: &str,
    ) -> Result<(), WorldError> {
        let attr = AttrData {
            name: name.to_string(),
            value,
            category: category.map(str::to_owned),
            locks: locks.to_string(),
        };
        self.entity_mut(id)?
            .attrs
            .insert((attr.name.clone(), attr.category.clone()), attr);
        Ok(())
    }

    fn remove_attr(
        &mut self,
        id: EntityId,
        name: &str,
        category: Option<&str>,
    ) -> Result<(), WorldError> {
        self.entity_mut(id)?
            .attrs
            .shift_remove(&(name.to_string(), category.map(str::to_owned)));
        Ok(())
    }

    fn clear_attrs(&mut self, id: EntityId) -> Result<(), WorldError> {
        self.entity_mut(id)?.attrs.clear();
        Ok(())
    }

    fn get_key(&self, id: EntityId) -> Result<String, WorldError> {
        Ok(self.entity(id)?.key.clone())
    }

    fn get_typeclass(&self, id: EntityId) -> Result<String, WorldError> {
        Ok(self.entity(id)?.typeclass.clone())
    }

    fn get_location(&self, id: EntityId) -> Result<Option<EntityId>, WorldError> {
        Ok(self.entity(id)?.location)
    }

    fn get_home(&self, id: EntityId) -> Result<Option<EntityId>, WorldError> {
        Ok(self.entity(id)?.home)
    }

    fn get_destination(&self, id: EntityId) -> Result<Option<EntityId>, WorldError> {
        Ok(self.entity(id)?.destination)
    }

    fn get_locks(&self, id: EntityId) -> Result<String, WorldError> {
        Ok(self.entity(id)?.locks.clone())
    }

    fn get_permissions(&self, id: EntityId) -> Result<Vec<String>, WorldError> {
        Ok(self.entity(id)?.permissions.clone())
    }

    fn get_aliases(&self, id: EntityId) -> Result<Vec<String>, WorldError> {
        Ok(self.entity(id)?.aliases.clone())
    }

    fn get_tags(&self, id: EntityId) -> Result<Vec<TagData>, WorldError> {
        Ok(self.entity(id)?.tags.clone())
    }

    fn get_attrs(&self, id: EntityId) -> Result<Vec<AttrData>, WorldError> {
        Ok(self.entity(id)?.attrs.values().cloned().collect())
    }

    fn find_by_key(&self, query: &str) -> Vec<EntityId> {
        if let Some(id) = parse_dbref(query) {
            return if self.entities.contains_key(&id) {
                vec![id]
            } else {
                Vec::new()
            };
        }
        let query = query.to_lowercase();
        self.entities
            .iter()
            .filter(|(_, record)| {
                record.key.to_lowercase() == query
                    || record.aliases.iter().any(|a| a.to_lowercase() == query)
            })
            .map(|(id, _)| *id)
            .collect()
    }

    fn find_by_tag(&self, name: &str, category: Option<&str>) -> Vec<EntityId> {
        let name = name.to_lowercase();
        let category = category.map(|c| c.to_lowercase());
        self.entities
            .iter()
            .filter(|(_, record)| {
                record
                    .tags
                    .iter()
                    .any(|t| t.name == name && t.category == category)
            })
            .map(|(id, _)| *id)
            .collect()
    }
}
