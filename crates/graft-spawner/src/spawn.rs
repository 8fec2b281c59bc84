//! Spawn and update orchestration.
//!
//! [`Spawner`] ties the pieces together: it resolves prototypes against
//! the store, materializes them as entities through the world seam, and
//! pushes edited prototypes back onto already spawned entities. Batch
//! operations never abort early; each failed source is collected and
//! reported alongside the successes.

use indexmap::{IndexMap, IndexSet};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use graft_core::{
    AttrData, DEFAULT_TYPECLASS, EntityId, PROTOTYPE_FALLBACK_LOCKSTRING, PROTOTYPE_TAG_CATEGORY,
    Prototype, PrototypeStore, TagData, ValidationError, World, WorldError, is_meta_key, to_dbref,
    value_to_display, value_to_entity_id,
};
use graft_protfunc::{ProtFuncError, ProtFuncRegistry};

use crate::diff::{Diff, DiffVerdict, FlatDiff, flatten_diff, implicit_keep, prototype_diff};
use crate::resolve::{ParentPool, ResolveError, add_to_pool, resolve_prototype};

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("no prototype found for key: {0}")]
    PrototypeNotFound(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    World(#[from] WorldError),
}

/// One spawn request: a stored prototype by key, or an inline record.
#[derive(Debug, Clone)]
pub enum SpawnSource {
    Key(String),
    Record(Prototype),
}

impl SpawnSource {
    fn prototype_key(&self) -> Option<String> {
        match self {
            SpawnSource::Key(key) => Some(key.clone()),
            SpawnSource::Record(record) => record.prototype_key().map(str::to_owned),
        }
    }
}

impl From<&str> for SpawnSource {
    fn from(key: &str) -> Self {
        SpawnSource::Key(key.to_string())
    }
}

impl From<String> for SpawnSource {
    fn from(key: String) -> Self {
        SpawnSource::Key(key)
    }
}

impl From<Prototype> for SpawnSource {
    fn from(record: Prototype) -> Self {
        SpawnSource::Record(record)
    }
}

/// Options shared by every source of one spawn call.
#[derive(Debug, Default)]
pub struct SpawnOptions {
    /// Caller id exposed to protfuncs.
    pub caller: Option<EntityId>,

    /// Extra parent records. These override same-keyed store entries
    /// for the duration of the call.
    pub prototype_parents: ParentPool,

    /// Evaluate protfuncs deterministically.
    pub protfunc_testing: bool,
}

/// A source that failed to spawn, by batch position.
#[derive(Debug)]
pub struct SpawnFailure {
    pub index: usize,
    pub prototype_key: Option<String>,
    pub error: SpawnError,
}

/// Result of one spawn call. Every source lands either in `spawned` or
/// in `failures`.
#[derive(Debug, Default)]
pub struct SpawnBatch {
    pub spawned: Vec<EntityId>,
    pub failures: Vec<SpawnFailure>,

    /// Protfunc errors recovered during resolution. The affected values
    /// kept their literal text.
    pub protfunc_errors: Vec<ProtFuncError>,
}

/// Spawn/update orchestrator over the two collaborator seams.
pub struct Spawner<'a> {
    world: &'a mut dyn World,
    store: &'a dyn PrototypeStore,
    registry: ProtFuncRegistry,
}

impl<'a> Spawner<'a> {
    pub fn new(world: &'a mut dyn World, store: &'a dyn PrototypeStore) -> Self {
        Self {
            world,
            store,
            registry: ProtFuncRegistry::new(),
        }
    }

    /// Replace the builtin protfunc set.
    pub fn with_registry(mut self, registry: ProtFuncRegistry) -> Self {
        self.registry = registry;
        self
    }

    // =========================================================================
    // Spawning
    // =========================================================================

    /// Spawn a batch of prototypes. Failures do not stop the batch.
    pub fn spawn(&mut self, sources: Vec<SpawnSource>, options: &SpawnOptions) -> SpawnBatch {
        let pool = self.build_pool(options);
        let mut batch = SpawnBatch::default();
        for (index, source) in sources.into_iter().enumerate() {
            let prototype_key = source.prototype_key();
            match self.spawn_source(source, &pool, options, &mut batch.protfunc_errors) {
                Ok(id) => batch.spawned.push(id),
                Err(error) => {
                    warn!(
                        index,
                        key = prototype_key.as_deref().unwrap_or("<inline>"),
                        %error,
                        "spawn source failed"
                    );
                    batch.failures.push(SpawnFailure {
                        index,
                        prototype_key,
                        error,
                    });
                }
            }
        }
        batch
    }

    /// The parent pool for one spawn call: everything the store knows,
    /// overridden by the caller's own records.
    fn build_pool(&self, options: &SpawnOptions) -> ParentPool {
        let mut pool = ParentPool::new();
        for record in self.store.search_prototypes(None, &[]) {
            let Some(key) = record.prototype_key().map(str::to_owned) else {
                continue;
            };
            add_to_pool(&mut pool, &key, record);
        }
        for (key, record) in &options.prototype_parents {
            add_to_pool(&mut pool, key, record.clone());
        }
        pool
    }

    fn spawn_source(
        &mut self,
        source: SpawnSource,
        pool: &ParentPool,
        options: &SpawnOptions,
        protfunc_errors: &mut Vec<ProtFuncError>,
    ) -> Result<EntityId, SpawnError> {
        let record = match source {
            SpawnSource::Key(key) => self
                .store
                .find_prototype(&key)
                .ok_or(SpawnError::PrototypeNotFound(key))?,
            SpawnSource::Record(record) => record,
        };
        record.validate(false)?;
        let (resolved, errors) = resolve_prototype(
            &record,
            pool,
            &self.registry,
            Some(&*self.world),
            options.caller,
            options.protfunc_testing,
        )?;
        protfunc_errors.extend(errors);
        self.create_from_resolved(&resolved)
    }

    /// Materialize a resolved record as a new entity.
    fn create_from_resolved(&mut self, resolved: &Prototype) -> Result<EntityId, SpawnError> {
        let prototype_key = resolved.prototype_key().unwrap_or_default().to_lowercase();

        let typeclass = resolved.typeclass().unwrap_or(DEFAULT_TYPECLASS).to_string();
        let key = match resolved.get("key") {
            Some(value) if !value.is_null() => {
                let key = value_to_display(value);
                if key.is_empty() {
                    format!("Spawned-{prototype_key}")
                } else {
                    key
                }
            }
            _ => format!("Spawned-{prototype_key}"),
        };
        let location = self.resolve_target(resolved.get("location"));
        let home = self.resolve_target(resolved.get("home")).or(location);
        let destination = self.resolve_target(resolved.get("destination"));

        let id = self
            .world
            .create_entity(&typeclass, &key, location, home, destination)?;

        if let Some(locks) = resolved.locks().filter(|l| !l.is_empty()) {
            self.world.set_locks(id, locks)?;
        }
        let permissions = resolved.permissions();
        if !permissions.is_empty() {
            self.world.set_permissions(id, &permissions)?;
        }
        for alias in resolved.aliases() {
            self.world.add_alias(id, &alias)?;
        }
        for tag in resolved.tags() {
            self.world
                .add_tag(id, &tag.name, tag.category.as_deref(), tag.data.as_deref())?;
        }
        for AttrData {
            name,
            value,
            category,
            locks,
        } in resolved.attrs()
        {
            self.world
                .set_attr(id, &name, value, category.as_deref(), &locks)?;
        }
        self.world
            .add_tag(id, &prototype_key, Some(PROTOTYPE_TAG_CATEGORY), None)?;

        debug!(id, key = %key, prototype = %prototype_key, "spawned entity");
        Ok(id)
    }

    /// Resolve a record reference (dbref string, raw id, or a key the
    /// world matches exactly once) into an entity id.
    fn resolve_target(&self, value: Option<&Value>) -> Option<EntityId> {
        let value = value?;
        if value.is_null() {
            return None;
        }
        if let Some(id) = value_to_entity_id(value) {
            return Some(id);
        }
        let query = value_to_display(value);
        if query.is_empty() {
            return None;
        }
        match self.world.find_by_key(&query).as_slice() {
            [id] => Some(*id),
            [] => {
                warn!(query = %query, "no entity matches reference");
                None
            }
            _ => {
                warn!(query = %query, "ambiguous entity reference");
                None
            }
        }
    }

    // =========================================================================
    // Reading entities back
    // =========================================================================

    /// Read an entity back into prototype-record shape.
    ///
    /// When the entity carries a spawn tag whose prototype is still in
    /// the store, that record is the base and the observed state
    /// overlays it. Otherwise the meta fields are synthesized. Attrs and
    /// tags come back sorted by name then category.
    pub fn prototype_from_object(&self, id: EntityId) -> Result<Prototype, SpawnError> {
        let key = self.world.get_key(id)?;
        let tags = self.world.get_tags(id)?;

        let spawn_tag = tags
            .iter()
            .find(|t| t.category.as_deref() == Some(PROTOTYPE_TAG_CATEGORY));
        let mut record = spawn_tag
            .and_then(|tag| self.store.find_prototype(&tag.name))
            .unwrap_or_else(|| {
                let mut record = Prototype::new();
                record.set("prototype_key", Value::String(from_object_key(&key)));
                record.set("prototype_desc", Value::String(format!("Built from {key}")));
                record.set(
                    "prototype_locks",
                    Value::String(PROTOTYPE_FALLBACK_LOCKSTRING.to_string()),
                );
                record.set("prototype_tags", Value::Array(Vec::new()));
                record
            });

        record.set("key", Value::String(key));
        record.set("typeclass", Value::String(self.world.get_typeclass(id)?));
        if let Some(location) = self.world.get_location(id)? {
            record.set("location", Value::String(to_dbref(location)));
        }
        if let Some(home) = self.world.get_home(id)? {
            record.set("home", Value::String(to_dbref(home)));
        }
        if let Some(destination) = self.world.get_destination(id)? {
            record.set("destination", Value::String(to_dbref(destination)));
        }
        let locks = self.world.get_locks(id)?;
        if !locks.is_empty() {
            record.set("locks", Value::String(locks));
        }
        let permissions = self.world.get_permissions(id)?;
        if !permissions.is_empty() {
            record.set(
                "permissions",
                Value::Array(permissions.into_iter().map(Value::String).collect()),
            );
        }
        let aliases = self.world.get_aliases(id)?;
        if !aliases.is_empty() {
            record.set(
                "aliases",
                Value::Array(aliases.into_iter().map(Value::String).collect()),
            );
        }
        if !tags.is_empty() {
            let mut tags = tags;
            sort_tags(&mut tags);
            record.set(
                "tags",
                Value::Array(tags.iter().map(TagData::to_value).collect()),
            );
        }
        let mut attrs = self.world.get_attrs(id)?;
        if !attrs.is_empty() {
            sort_attrs(&mut attrs);
            record.set(
                "attrs",
                Value::Array(attrs.iter().map(AttrData::to_value).collect()),
            );
        }
        Ok(record)
    }

    /// Diff an entity (old side) against a prototype (new side).
    ///
    /// Scalars and attrs the prototype does not mention are kept, not
    /// removed; see [`implicit_keep`]. Returns the diff together with
    /// the entity's reconstructed prototype. Neither input is modified.
    pub fn prototype_diff_from_object(
        &self,
        prototype: &Prototype,
        id: EntityId,
    ) -> Result<(Diff, Prototype), SpawnError> {
        let obj_prototype = self.prototype_from_object(id)?;
        let mut diff = prototype_diff(&obj_prototype, prototype);
        implicit_keep(&mut diff);
        Ok((diff, obj_prototype))
    }

    // =========================================================================
    // Batch updates
    // =========================================================================

    /// Push a prototype's current definition onto spawned entities.
    ///
    /// With no explicit `objects`, everything tagged with the
    /// prototype's key is updated; with no explicit `diff`, one is
    /// computed against the first object. Returns the number of
    /// entities actually changed: every write is read-compare-write, so
    /// re-applying the same prototype returns 0.
    pub fn batch_update_objects_with_prototype(
        &mut self,
        source: SpawnSource,
        diff: Option<Diff>,
        objects: &[EntityId],
    ) -> Result<usize, SpawnError> {
        let record = match source {
            SpawnSource::Key(key) => self
                .store
                .find_prototype(&key)
                .ok_or(SpawnError::PrototypeNotFound(key))?,
            SpawnSource::Record(record) => record,
        };
        let record = record.homogenized();
        let prototype_key = record.prototype_key().unwrap_or_default().to_lowercase();

        let objects: Vec<EntityId> = if objects.is_empty() {
            self.world
                .find_by_tag(&prototype_key, Some(PROTOTYPE_TAG_CATEGORY))
        } else {
            objects.to_vec()
        };
        if objects.is_empty() {
            return Ok(0);
        }

        let diff = match diff {
            Some(diff) => diff,
            None => self.prototype_diff_from_object(&record, objects[0])?.0,
        };
        let flat = flatten_diff(&diff);

        let mut changed = 0;
        for &id in &objects {
            if self.apply_flat_diff(id, &flat, &record)? {
                changed += 1;
            }
            self.retag(id, &prototype_key)?;
        }
        debug!(
            prototype = %prototype_key,
            objects = objects.len(),
            changed,
            "batch update"
        );
        Ok(changed)
    }

    /// Apply one flattened diff to one entity. `typeclass` goes first;
    /// the rest follow in diff order.
    fn apply_flat_diff(
        &mut self,
        id: EntityId,
        flat: &FlatDiff,
        record: &Prototype,
    ) -> Result<bool, SpawnError> {
        let mut changed = false;
        if let Some(verdict) = flat.get("typeclass") {
            changed |= self.apply_field(id, "typeclass", *verdict, record)?;
        }
        for (field, verdict) in flat {
            if field == "typeclass" {
                continue;
            }
            changed |= self.apply_field(id, field, *verdict, record)?;
        }
        Ok(changed)
    }

    /// Apply one field of a flattened diff. A field the record does not
    /// carry is left alone (omission is no opinion; an explicit empty
    /// list clears). Reports whether the entity actually changed.
    fn apply_field(
        &mut self,
        id: EntityId,
        field: &str,
        verdict: DiffVerdict,
        record: &Prototype,
    ) -> Result<bool, SpawnError> {
        if verdict == DiffVerdict::Keep || is_meta_key(field) || field == "prototype_parent" {
            return Ok(false);
        }
        let Some(new_value) = record.get(field) else {
            return Ok(false);
        };
        let removing = verdict == DiffVerdict::Remove;
        let replacing = verdict == DiffVerdict::Replace;

        let changed = match field {
            // a name cannot be unset, only rewritten
            "key" | "typeclass" if removing => false,
            "key" => {
                let desired = value_to_display(new_value);
                let current = self.world.get_key(id)?;
                if desired.is_empty() || current == desired {
                    false
                } else {
                    self.world.set_key(id, &desired)?;
                    true
                }
            }
            "typeclass" => {
                let desired = value_to_display(new_value);
                let current = self.world.get_typeclass(id)?;
                if desired.is_empty() || current == desired {
                    false
                } else {
                    self.world.set_typeclass(id, &desired)?;
                    true
                }
            }
            "location" | "home" | "destination" => {
                let desired = if removing {
                    None
                } else {
                    self.resolve_target(Some(new_value))
                };
                let current = match field {
                    "location" => self.world.get_location(id)?,
                    "home" => self.world.get_home(id)?,
                    _ => self.world.get_destination(id)?,
                };
                if current == desired {
                    false
                } else {
                    match field {
                        "location" => self.world.set_location(id, desired)?,
                        "home" => self.world.set_home(id, desired)?,
                        _ => self.world.set_destination(id, desired)?,
                    }
                    true
                }
            }
            "locks" => {
                let desired = if removing {
                    String::new()
                } else {
                    value_to_display(new_value)
                };
                let current = self.world.get_locks(id)?;
                if current == desired {
                    false
                } else {
                    self.world.set_locks(id, &desired)?;
                    true
                }
            }
            "permissions" => {
                let current = self.world.get_permissions(id)?;
                let given = dedup_strings(
                    record.permissions().iter().map(|p| p.to_lowercase()).collect(),
                );
                let desired = if removing {
                    Vec::new()
                } else if replacing {
                    given
                } else {
                    let mut merged = current.clone();
                    for perm in given {
                        if !merged.contains(&perm) {
                            merged.push(perm);
                        }
                    }
                    merged
                };
                if current == desired {
                    false
                } else {
                    self.world.set_permissions(id, &desired)?;
                    true
                }
            }
            "aliases" => {
                let current = self.world.get_aliases(id)?;
                let given = dedup_strings(record.aliases());
                if removing || replacing {
                    let desired = if removing { Vec::new() } else { given };
                    if current == desired {
                        false
                    } else {
                        self.world.clear_aliases(id)?;
                        for alias in &desired {
                            self.world.add_alias(id, alias)?;
                        }
                        true
                    }
                } else {
                    let mut added = false;
                    for alias in &given {
                        if !current.contains(alias) {
                            self.world.add_alias(id, alias)?;
                            added = true;
                        }
                    }
                    added
                }
            }
            "tags" => self.apply_tags(id, record, removing, replacing)?,
            "attrs" => self.apply_attrs(id, record, removing, replacing)?,
            // anything else is a single attribute
            _ => {
                let current = self
                    .world
                    .get_attrs(id)?
                    .into_iter()
                    .find(|a| a.name == field && a.category.is_none());
                if removing {
                    if current.is_some() {
                        self.world.remove_attr(id, field, None)?;
                        true
                    } else {
                        false
                    }
                } else if current.is_some_and(|a| a.value == *new_value) {
                    false
                } else {
                    self.world.set_attr(id, field, new_value.clone(), None, "")?;
                    true
                }
            }
        };
        Ok(changed)
    }

    /// The spawn bookkeeping tag is never touched here; clearing spares
    /// its category.
    fn apply_tags(
        &mut self,
        id: EntityId,
        record: &Prototype,
        removing: bool,
        replacing: bool,
    ) -> Result<bool, SpawnError> {
        let current: Vec<TagData> = self
            .world
            .get_tags(id)?
            .into_iter()
            .filter(|t| t.category.as_deref() != Some(PROTOTYPE_TAG_CATEGORY))
            .collect();

        // the world stores tags lowercased
        let mut desired: IndexMap<(String, Option<String>), TagData> = IndexMap::new();
        if !removing {
            for tag in record.tags() {
                let tag = TagData {
                    name: tag.name.to_lowercase(),
                    category: tag.category.map(|c| c.to_lowercase()),
                    data: tag.data,
                };
                desired.insert((tag.name.clone(), tag.category.clone()), tag);
            }
        }

        if removing || replacing {
            let desired: Vec<TagData> = desired.into_values().collect();
            if current == desired {
                return Ok(false);
            }
            for tag in &current {
                self.world.remove_tag(id, &tag.name, tag.category.as_deref())?;
            }
            for tag in &desired {
                self.world
                    .add_tag(id, &tag.name, tag.category.as_deref(), tag.data.as_deref())?;
            }
            Ok(true)
        } else {
            let mut added = false;
            for tag in desired.values() {
                let existing = current
                    .iter()
                    .find(|t| t.name == tag.name && t.category == tag.category);
                if existing != Some(tag) {
                    self.world
                        .add_tag(id, &tag.name, tag.category.as_deref(), tag.data.as_deref())?;
                    added = true;
                }
            }
            Ok(added)
        }
    }

    fn apply_attrs(
        &mut self,
        id: EntityId,
        record: &Prototype,
        removing: bool,
        replacing: bool,
    ) -> Result<bool, SpawnError> {
        let current = self.world.get_attrs(id)?;
        if removing {
            if current.is_empty() {
                return Ok(false);
            }
            self.world.clear_attrs(id)?;
            return Ok(true);
        }

        let mut desired: IndexMap<(String, Option<String>), AttrData> = IndexMap::new();
        for attr in record.attrs() {
            desired.insert((attr.name.clone(), attr.category.clone()), attr);
        }

        if replacing {
            let same = current.len() == desired.len()
                && current
                    .iter()
                    .all(|c| desired.get(&(c.name.clone(), c.category.clone())) == Some(c));
            if same {
                return Ok(false);
            }
            self.world.clear_attrs(id)?;
            for AttrData {
                name,
                value,
                category,
                locks,
            } in desired.into_values()
            {
                self.world
                    .set_attr(id, &name, value, category.as_deref(), &locks)?;
            }
            Ok(true)
        } else {
            let mut changed = false;
            for attr in desired.into_values() {
                let existing = current
                    .iter()
                    .find(|c| c.name == attr.name && c.category == attr.category);
                if existing.is_some_and(|c| *c == attr) {
                    continue;
                }
                let AttrData {
                    name,
                    value,
                    category,
                    locks,
                } = attr;
                self.world
                    .set_attr(id, &name, value, category.as_deref(), &locks)?;
                changed = true;
            }
            Ok(changed)
        }
    }

    /// Keep exactly one spawn-source tag on the entity. Retagging is
    /// bookkeeping, never counted as a change.
    fn retag(&mut self, id: EntityId, prototype_key: &str) -> Result<(), SpawnError> {
        if prototype_key.is_empty() {
            return Ok(());
        }
        let mut tagged = false;
        for tag in self.world.get_tags(id)? {
            if tag.category.as_deref() != Some(PROTOTYPE_TAG_CATEGORY) {
                continue;
            }
            if tag.name == prototype_key {
                tagged = true;
            } else {
                self.world
                    .remove_tag(id, &tag.name, Some(PROTOTYPE_TAG_CATEGORY))?;
            }
        }
        if !tagged {
            self.world
                .add_tag(id, prototype_key, Some(PROTOTYPE_TAG_CATEGORY), None)?;
        }
        Ok(())
    }
}

fn from_object_key(key: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("from-object-{}-{}", key.to_lowercase(), &id[..7])
}

fn dedup_strings(items: Vec<String>) -> Vec<String> {
    let set: IndexSet<String> = items.into_iter().collect();
    set.into_iter().collect()
}

fn sort_tags(tags: &mut [TagData]) {
    tags.sort_by(|a, b| {
        (a.name.as_str(), a.category.as_deref()).cmp(&(b.name.as_str(), b.category.as_deref()))
    });
}

fn sort_attrs(attrs: &mut [AttrData]) {
    attrs.sort_by(|a, b| {
        (a.name.as_str(), a.category.as_deref()).cmp(&(b.name.as_str(), b.category.as_deref()))
    });
}
