//! Parent-chain resolution.
//!
//! Flattening merges a record with its `prototype_parent` chain into a
//! single parentless record. Precedence is the record itself, then its
//! parents breadth-first in listing order: children override parents,
//! closer ancestors override more distant ones, and of two parents at
//! the same depth the first-listed wins. Diamond chains merge each
//! ancestor once, at its shallowest position.

use indexmap::{IndexMap, IndexSet};
use serde_json::Value;
use thiserror::Error;

use graft_core::{AttrData, EntityId, Prototype, TagData, World};
use graft_protfunc::{ProtFuncError, ProtFuncRegistry, eval_prototype};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("prototype parent not found: {0}")]
    PrototypeParentNotFound(String),
}

/// Named parent records, keyed by lowercased prototype key. Always an
/// explicit argument, never hidden state.
pub type ParentPool = IndexMap<String, Prototype>;

/// Insert a record into a pool under a (lowercased) key. A record
/// without its own `prototype_key` inherits the pool key.
pub fn add_to_pool(pool: &mut ParentPool, key: &str, record: Prototype) {
    let key = key.to_lowercase();
    let mut record = record;
    if record.prototype_key().is_none() {
        record.set("prototype_key", Value::String(key.clone()));
    }
    pool.insert(key, record);
}

/// The record and its ancestors, homogenized, in precedence order
/// (highest first). Ancestors already seen are skipped, which both
/// merges diamonds once and keeps parent cycles from looping.
fn merge_chain(record: &Prototype, pool: &ParentPool) -> Result<Vec<Prototype>, ResolveError> {
    let root = record.homogenized();
    let mut visited: IndexSet<String> = IndexSet::new();
    if let Some(key) = root.prototype_key() {
        visited.insert(key.to_lowercase());
    }
    let mut sources = vec![root];
    let mut cursor = 0;
    while cursor < sources.len() {
        for parent_key in sources[cursor].parents() {
            let lookup = parent_key.to_lowercase();
            if visited.contains(&lookup) {
                continue;
            }
            let parent = pool
                .get(&lookup)
                .ok_or(ResolveError::PrototypeParentNotFound(parent_key))?;
            visited.insert(lookup);
            sources.push(parent.homogenized());
        }
        cursor += 1;
    }
    Ok(sources)
}

/// Overlay sources in precedence order: the first occurrence of a
/// scalar field or of a keyed element (by identity) wins. Keyed fields
/// union element-wise, so inherited elements follow the child's own in
/// nearest-ancestor-first order.
fn overlay(sources: &[Prototype]) -> Prototype {
    let mut out = Prototype::new();
    let mut attrs: IndexMap<String, AttrData> = IndexMap::new();
    let mut tags: IndexMap<String, TagData> = IndexMap::new();
    let mut aliases: IndexSet<String> = IndexSet::new();
    let mut permissions: IndexSet<String> = IndexSet::new();
    let mut saw_aliases = false;
    let mut saw_permissions = false;

    for source in sources {
        for (key, value) in source.iter() {
            match key.as_str() {
                "attrs" => {
                    for attr in source.attrs() {
                        attrs.entry(attr.name.clone()).or_insert(attr);
                    }
                }
                "tags" => {
                    for tag in source.tags() {
                        tags.entry(tag.name.clone()).or_insert(tag);
                    }
                }
                "aliases" => {
                    saw_aliases = true;
                    aliases.extend(source.aliases());
                }
                "permissions" => {
                    saw_permissions = true;
                    permissions.extend(source.permissions());
                }
                _ => {
                    if !out.contains_key(key) {
                        out.set(key.clone(), value.clone());
                    }
                }
            }
        }
    }

    if !attrs.is_empty() {
        out.set(
            "attrs",
            Value::Array(attrs.values().map(AttrData::to_value).collect()),
        );
    }
    if !tags.is_empty() {
        out.set(
            "tags",
            Value::Array(tags.values().map(TagData::to_value).collect()),
        );
    }
    if saw_aliases {
        out.set(
            "aliases",
            Value::Array(aliases.into_iter().map(Value::String).collect()),
        );
    }
    if saw_permissions {
        out.set(
            "permissions",
            Value::Array(permissions.into_iter().map(Value::String).collect()),
        );
    }
    out
}

/// Flatten a record against its parents, without protfunc evaluation.
///
/// The result carries no `prototype_parent`. The meta fields
/// (`prototype_key`, `prototype_desc`, `prototype_locks`,
/// `prototype_tags`) never inherit: homogenization materializes them on
/// the record before the overlay. `typeclass` does inherit.
pub fn flatten_prototype(record: &Prototype, pool: &ParentPool) -> Result<Prototype, ResolveError> {
    let sources = merge_chain(record, pool)?;
    let mut merged = overlay(&sources);
    merged.remove("prototype_parent");
    Ok(merged)
}

/// Flatten and evaluate protfuncs, with the merged record as call
/// context. Protfunc failures do not fail resolution; they come back
/// alongside the record with literal text left in place.
pub fn resolve_prototype(
    record: &Prototype,
    pool: &ParentPool,
    registry: &ProtFuncRegistry,
    world: Option<&dyn World>,
    caller: Option<EntityId>,
    testing: bool,
) -> Result<(Prototype, Vec<ProtFuncError>), ResolveError> {
    let flat = flatten_prototype(record, pool)?;
    Ok(eval_prototype(&flat, registry, world, caller, testing))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn proto(value: Value) -> Prototype {
        Prototype::from_value(value).unwrap()
    }

    /// A goblin family with a diamond at the top.
    fn goblin_pool() -> ParentPool {
        let mut pool = ParentPool::new();
        add_to_pool(
            &mut pool,
            "GOBLIN",
            proto(json!({
                "typeclass": "core.objects.Monster",
                "key": "goblin grunt",
                "health": 20,
                "resists": ["cold", "poison"],
                "attacks": ["fists"],
                "weaknesses": ["fire", "light"],
                "tags": [["greenskin", "monster"], ["humanoid", "monster"]],
            })),
        );
        add_to_pool(
            &mut pool,
            "GOBLIN_WIZARD",
            proto(json!({
                "prototype_parent": "GOBLIN",
                "key": "goblin wizard",
                "spells": ["fire ball", "lightning bolt"],
            })),
        );
        add_to_pool(
            &mut pool,
            "ARCHWIZARD",
            proto(json!({
                "prototype_parent": "GOBLIN",
                "attacks": ["archwizard staff"],
            })),
        );
        pool
    }

    fn attr_value(record: &Prototype, name: &str) -> Value {
        record
            .attrs()
            .into_iter()
            .find(|a| a.name == name)
            .map(|a| a.value)
            .unwrap_or(Value::Null)
    }

    #[test]
    fn test_no_parents_equals_homogenized() {
        let record = proto(json!({
            "prototype_key": "rock",
            "key": "a rock",
            "weight": 12,
            "aliases": "stone",
        }));
        let flat = flatten_prototype(&record, &ParentPool::new()).unwrap();
        assert_eq!(flat, record.homogenized());
    }

    #[test]
    fn test_child_overrides_parent() {
        let mut pool = ParentPool::new();
        add_to_pool(
            &mut pool,
            "WEAPON",
            proto(json!({
                "typeclass": "core.objects.Weapon",
                "key": "weapon",
                "magic": false,
            })),
        );
        let sting = proto(json!({
            "prototype_key": "sting",
            "prototype_parent": "WEAPON",
            "key": "sting",
            "magic": true,
        }));
        let flat = flatten_prototype(&sting, &pool).unwrap();
        assert_eq!(flat.key(), Some("sting"));
        assert_eq!(flat.typeclass(), Some("core.objects.Weapon"));
        assert_eq!(attr_value(&flat, "magic"), json!(true));
        assert!(flat.get("prototype_parent").is_none());
    }

    #[test]
    fn test_diamond_merges_each_ancestor_once() {
        let pool = goblin_pool();
        let archwizard = proto(json!({
            "prototype_key": "goblin_archwizard",
            "prototype_parent": ["GOBLIN_WIZARD", "ARCHWIZARD"],
            "key": "goblin archwizard",
        }));
        let flat = flatten_prototype(&archwizard, &pool).unwrap();

        assert_eq!(flat.key(), Some("goblin archwizard"));
        assert_eq!(flat.typeclass(), Some("core.objects.Monster"));
        // from the first-listed branch
        assert_eq!(
            attr_value(&flat, "spells"),
            json!(["fire ball", "lightning bolt"])
        );
        // depth 1 beats the grandparent's value
        assert_eq!(attr_value(&flat, "attacks"), json!(["archwizard staff"]));
        // grandparent values survive where nothing closer defines them
        assert_eq!(attr_value(&flat, "health"), json!(20));
        assert_eq!(attr_value(&flat, "weaknesses"), json!(["fire", "light"]));
        let tag_names: Vec<String> = flat.tags().into_iter().map(|t| t.name).collect();
        assert_eq!(tag_names, vec!["greenskin".to_string(), "humanoid".to_string()]);
    }

    #[test]
    fn test_first_listed_parent_wins_at_same_depth() {
        let mut pool = ParentPool::new();
        add_to_pool(&mut pool, "alpha", proto(json!({"power": "alpha"})));
        add_to_pool(&mut pool, "beta", proto(json!({"power": "beta", "side": "b"})));
        let child = proto(json!({
            "prototype_key": "child",
            "prototype_parent": ["alpha", "beta"],
        }));
        let flat = flatten_prototype(&child, &pool).unwrap();
        assert_eq!(attr_value(&flat, "power"), json!("alpha"));
        assert_eq!(attr_value(&flat, "side"), json!("b"));
    }

    #[test]
    fn test_missing_parent_is_an_error() {
        let child = proto(json!({
            "prototype_key": "orphan",
            "prototype_parent": "NOBODY",
        }));
        let err = flatten_prototype(&child, &ParentPool::new()).unwrap_err();
        assert!(matches!(err, ResolveError::PrototypeParentNotFound(ref key) if key == "NOBODY"));
    }

    #[test]
    fn test_parent_cycle_does_not_loop() {
        let mut pool = ParentPool::new();
        add_to_pool(
            &mut pool,
            "a",
            proto(json!({"prototype_parent": "b", "from_a": 1})),
        );
        add_to_pool(
            &mut pool,
            "b",
            proto(json!({"prototype_parent": "a", "from_b": 2})),
        );
        let flat = flatten_prototype(pool.get("a").unwrap(), &pool).unwrap();
        assert_eq!(attr_value(&flat, "from_a"), json!(1));
        assert_eq!(attr_value(&flat, "from_b"), json!(2));
    }

    #[test]
    fn test_meta_fields_do_not_inherit() {
        let mut pool = ParentPool::new();
        add_to_pool(
            &mut pool,
            "base",
            proto(json!({
                "prototype_key": "base",
                "prototype_desc": "the base",
                "prototype_tags": ["baseline"],
                "key": "thing",
            })),
        );
        let child = proto(json!({
            "prototype_key": "child",
            "prototype_parent": "base",
        }));
        let flat = flatten_prototype(&child, &pool).unwrap();
        assert_eq!(flat.prototype_key(), Some("child"));
        assert_eq!(flat.prototype_desc(), Some(""));
        assert_eq!(flat.get("prototype_tags").unwrap(), &json!([]));
        // non-meta fields inherit as usual
        assert_eq!(flat.key(), Some("thing"));
    }

    #[test]
    fn test_keyed_fields_union_nearest_first() {
        let mut pool = ParentPool::new();
        add_to_pool(
            &mut pool,
            "base",
            proto(json!({
                "aliases": ["thing", "object"],
                "attrs": [["shared", "base"], ["base_only", 1]],
            })),
        );
        let child = proto(json!({
            "prototype_key": "child",
            "prototype_parent": "base",
            "aliases": ["special"],
            "attrs": [["shared", "child"]],
        }));
        let flat = flatten_prototype(&child, &pool).unwrap();
        assert_eq!(
            flat.aliases(),
            vec![
                "special".to_string(),
                "thing".to_string(),
                "object".to_string()
            ]
        );
        let names: Vec<String> = flat.attrs().into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["shared".to_string(), "base_only".to_string()]);
        assert_eq!(attr_value(&flat, "shared"), json!("child"));
    }

    #[test]
    fn test_resolve_evaluates_protfuncs() {
        let record = proto(json!({
            "prototype_key": "rolled",
            "key": "the $protkey(kind)",
            "kind": "survivor",
            "health": "$randint(10, 20)",
        }));
        let registry = ProtFuncRegistry::new();
        let (resolved, errors) =
            resolve_prototype(&record, &ParentPool::new(), &registry, None, None, true).unwrap();
        assert!(errors.is_empty());
        assert_eq!(resolved.key(), Some("the survivor"));
        assert_eq!(attr_value(&resolved, "health"), json!(10));
    }
}
