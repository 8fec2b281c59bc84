//! Prototype records and the collaborator seams for the graft spawner.

pub mod entity;
pub mod prototype;
pub mod store;
pub mod world;

pub use entity::{AttrData, EntityId, TagData, parse_dbref, to_dbref, value_to_display, value_to_entity_id};
pub use prototype::{
    DEFAULT_TYPECLASS, PROTOTYPE_FALLBACK_LOCKSTRING, PROTOTYPE_TAG_CATEGORY,
    PROTOTYPE_TAG_META_CATEGORY, Prototype, ValidationError, is_meta_key, is_reserved_key,
};
pub use store::{MemoryStore, PrototypeStore, StoreError};
pub use world::{MemoryWorld, World, WorldError};
