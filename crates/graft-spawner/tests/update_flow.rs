//! The read-back, diff and batch-update cycle.
//!
//! An entity drifts away from its prototype, the prototype itself gets
//! edited, and the batch update has to reconcile the two: pushing the
//! edits onto the entity while leaving the drift the prototype has no
//! opinion about alone.

use graft_core::{
    DEFAULT_TYPECLASS, MemoryStore, MemoryWorld, PROTOTYPE_TAG_CATEGORY, Prototype,
    PrototypeStore, World,
};
use graft_spawner::{Diff, DiffNode, DiffVerdict, SpawnOptions, Spawner, flatten_diff};
use serde_json::{Value, json};

fn proto(value: Value) -> Prototype {
    Prototype::from_value(value).unwrap()
}

fn scalar(diff: &Diff, field: &str) -> DiffVerdict {
    match diff.get(field) {
        Some(DiffNode::Scalar { verdict, .. }) => *verdict,
        other => panic!("expected scalar node for {field}, got {other:?}"),
    }
}

fn nested(diff: &Diff, field: &str, ident: &str) -> DiffVerdict {
    match diff.get(field) {
        Some(DiffNode::Nested(children)) => match children.get(ident) {
            Some(DiffNode::Scalar { verdict, .. }) => *verdict,
            other => panic!("expected scalar under {field}.{ident}, got {other:?}"),
        },
        other => panic!("expected nested node for {field}, got {other:?}"),
    }
}

fn attr_value(world: &MemoryWorld, id: i64, name: &str) -> Value {
    world
        .get_attrs(id)
        .unwrap()
        .into_iter()
        .find(|a| a.name == name)
        .map(|a| a.value)
        .unwrap_or(Value::Null)
}

#[test]
fn test_diff_and_update_reconcile_object_and_prototype() {
    let mut world = MemoryWorld::new();
    let id = world
        .create_entity(DEFAULT_TYPECLASS, "Obj", None, None, None)
        .unwrap();
    world
        .set_attr(id, "oldtest", json!("to_keep"), None, "")
        .unwrap();
    let store = MemoryStore::new();

    let spawner = Spawner::new(&mut world, &store);
    let mut prototype = spawner.prototype_from_object(id).unwrap();

    // drift the object away from the prototype
    world
        .set_attr(id, "test", json!("testval"), None, "")
        .unwrap();
    world
        .set_attr(id, "desc", json!("changed desc"), None, "")
        .unwrap();
    world.add_alias(id, "foo").unwrap();
    world.add_tag(id, "footag", Some("foocategory"), None).unwrap();

    // edit the prototype in the meantime
    prototype.set("new", json!("new_val"));
    prototype.set("test", json!("testval_changed"));
    prototype.set("permissions", json!(["Builder"]));
    prototype.set("prototype_desc", json!("New version of prototype"));
    let mut attrs = match prototype.get("attrs") {
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    };
    attrs.push(json!(["fooattr", "fooattrval", null, ""]));
    prototype.set("attrs", Value::Array(attrs));

    let mut spawner = Spawner::new(&mut world, &store);
    let (diff, obj_prototype) = spawner.prototype_diff_from_object(&prototype, id).unwrap();
    assert_eq!(obj_prototype.key(), Some("Obj"));
    assert_eq!(obj_prototype.aliases(), vec!["foo".to_string()]);

    // drifted attrs the prototype does not mention are kept
    assert_eq!(nested(&diff, "attrs", "oldtest"), DiffVerdict::Keep);
    assert_eq!(nested(&diff, "attrs", "desc"), DiffVerdict::Keep);
    assert_eq!(nested(&diff, "attrs", "test"), DiffVerdict::Update);
    assert_eq!(nested(&diff, "attrs", "fooattr"), DiffVerdict::Add);
    assert_eq!(nested(&diff, "attrs", "new"), DiffVerdict::Add);
    // drifted aliases and tags are up for removal
    assert_eq!(nested(&diff, "aliases", "foo"), DiffVerdict::Remove);
    assert_eq!(nested(&diff, "tags", "footag"), DiffVerdict::Remove);
    assert_eq!(nested(&diff, "permissions", "Builder"), DiffVerdict::Add);
    // both sides synthesized their own prototype_key
    assert_eq!(scalar(&diff, "prototype_key"), DiffVerdict::Update);
    assert_eq!(scalar(&diff, "prototype_desc"), DiffVerdict::Update);
    assert_eq!(scalar(&diff, "key"), DiffVerdict::Keep);
    assert_eq!(scalar(&diff, "typeclass"), DiffVerdict::Keep);

    let flat = flatten_diff(&diff);
    assert_eq!(flat.get("aliases"), Some(&DiffVerdict::Remove));
    assert_eq!(flat.get("tags"), Some(&DiffVerdict::Remove));
    assert_eq!(flat.get("attrs"), Some(&DiffVerdict::Update));
    assert_eq!(flat.get("permissions"), Some(&DiffVerdict::Update));
    assert_eq!(flat.get("prototype_desc"), Some(&DiffVerdict::Update));
    assert_eq!(flat.get("key"), Some(&DiffVerdict::Keep));

    let count = spawner
        .batch_update_objects_with_prototype(prototype.clone().into(), Some(diff), &[id])
        .unwrap();
    assert_eq!(count, 1);

    let after = spawner.prototype_from_object(id).unwrap();
    assert_eq!(after.key(), Some("Obj"));
    // meta edits never reach the entity
    assert_eq!(after.prototype_desc(), Some("Built from Obj"));
    assert_eq!(
        after.get("attrs").unwrap(),
        &json!([
            ["desc", "changed desc", null, ""],
            ["fooattr", "fooattrval", null, ""],
            ["new", "new_val", null, ""],
            ["oldtest", "to_keep", null, ""],
            ["test", "testval_changed", null, ""],
        ])
    );
    // the prototype had no aliases/tags fields, so the drift stands
    assert_eq!(after.aliases(), vec!["foo".to_string()]);
    assert_eq!(after.permissions(), vec!["builder".to_string()]);
    let tags = after.tags();
    assert_eq!(tags.len(), 2);
    assert_eq!(tags[0].name, "footag");
    assert_eq!(tags[0].category.as_deref(), Some("foocategory"));
    assert_eq!(tags[1].category.as_deref(), Some(PROTOTYPE_TAG_CATEGORY));
    assert!(tags[1].name.starts_with("from-object-obj-"), "{}", tags[1].name);

    // pushing the same prototype again changes nothing
    let count = spawner
        .batch_update_objects_with_prototype(prototype.into(), None, &[id])
        .unwrap();
    assert_eq!(count, 0);
}

#[test]
fn test_explicit_empty_list_clears_the_field() {
    let mut world = MemoryWorld::new();
    let store = MemoryStore::new();
    let mut spawner = Spawner::new(&mut world, &store);

    let batch = spawner.spawn(
        vec![proto(json!({
            "prototype_key": "tool",
            "key": "hammer",
            "aliases": ["hit", "bash"],
        }))
        .into()],
        &SpawnOptions::default(),
    );
    assert!(batch.failures.is_empty(), "{:?}", batch.failures);
    let id = batch.spawned[0];

    // an explicit empty list is an opinion, unlike a missing field
    let cleared = proto(json!({
        "prototype_key": "tool",
        "key": "hammer",
        "aliases": [],
    }));
    let count = spawner
        .batch_update_objects_with_prototype(cleared.clone().into(), None, &[id])
        .unwrap();
    assert_eq!(count, 1);
    let count = spawner
        .batch_update_objects_with_prototype(cleared.into(), None, &[id])
        .unwrap();
    assert_eq!(count, 0);

    assert!(world.get_aliases(id).unwrap().is_empty());
    assert!(world.get_tags(id).unwrap().iter().any(|t| {
        t.name == "tool" && t.category.as_deref() == Some(PROTOTYPE_TAG_CATEGORY)
    }));
}

#[test]
fn test_update_spawned_entities_through_their_tags() {
    let mut world = MemoryWorld::new();
    world.register_typeclass("core.objects.Monster");
    let mut store = MemoryStore::new();
    store
        .save_prototype(&proto(json!({
            "prototype_key": "GOBLIN",
            "typeclass": "core.objects.Monster",
            "key": "goblin grunt",
            "health": 20,
        })))
        .unwrap();

    let id = {
        let mut spawner = Spawner::new(&mut world, &store);
        let batch = spawner.spawn(vec!["goblin".into()], &SpawnOptions::default());
        assert!(batch.failures.is_empty(), "{:?}", batch.failures);
        batch.spawned[0]
    };

    // a partial save merges into the stored record
    store
        .save_prototype(&proto(json!({"prototype_key": "GOBLIN", "health": 30})))
        .unwrap();

    let mut spawner = Spawner::new(&mut world, &store);
    // no explicit objects: everything spawned from the prototype
    let count = spawner
        .batch_update_objects_with_prototype("goblin".into(), None, &[])
        .unwrap();
    assert_eq!(count, 1);
    let count = spawner
        .batch_update_objects_with_prototype("goblin".into(), None, &[])
        .unwrap();
    assert_eq!(count, 0);

    assert_eq!(attr_value(&world, id, "health"), json!(30));
    assert_eq!(world.get_key(id).unwrap(), "goblin grunt");
}
