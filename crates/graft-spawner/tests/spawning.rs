//! Batch spawning flows.
//!
//! End-to-end spawn tests against the in-memory collaborators: stored
//! prototype lookup, diamond inheritance, partial batch failure, and
//! protfunc-driven field values.

use graft_core::{
    DEFAULT_TYPECLASS, MemoryStore, MemoryWorld, PROTOTYPE_TAG_CATEGORY, Prototype,
    PrototypeStore, World,
};
use graft_spawner::{ResolveError, SpawnError, SpawnOptions, SpawnSource, Spawner, add_to_pool};
use serde_json::{Value, json};

fn proto(value: Value) -> Prototype {
    Prototype::from_value(value).unwrap()
}

/// World plus a store holding the goblin family.
fn goblin_setup() -> (MemoryWorld, MemoryStore) {
    let mut world = MemoryWorld::new();
    world.register_typeclass("core.objects.Monster");

    let mut store = MemoryStore::new();
    store
        .save_prototype(&proto(json!({
            "prototype_key": "GOBLIN",
            "typeclass": "core.objects.Monster",
            "key": "goblin grunt",
            "health": 20,
            "resists": ["cold", "poison"],
            "attacks": ["fists"],
            "weaknesses": ["fire", "light"],
            "tags": [["greenskin", "monster"], ["humanoid", "monster"]],
        })))
        .unwrap();
    store
        .save_prototype(&proto(json!({
            "prototype_key": "GOBLIN_WIZARD",
            "prototype_parent": "GOBLIN",
            "key": "goblin wizard",
            "spells": ["fire ball", "lightning bolt"],
        })))
        .unwrap();
    store
        .save_prototype(&proto(json!({
            "prototype_key": "ARCHWIZARD",
            "prototype_parent": "GOBLIN",
            "attacks": ["archwizard staff"],
        })))
        .unwrap();
    (world, store)
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
fn test_spawn_stored_prototype_by_key() {
    let (mut world, store) = goblin_setup();
    let mut spawner = Spawner::new(&mut world, &store);

    let batch = spawner.spawn(vec!["goblin".into()], &SpawnOptions::default());
    assert!(batch.failures.is_empty(), "{:?}", batch.failures);
    let id = batch.spawned[0];

    assert_eq!(world.get_key(id).unwrap(), "goblin grunt");
    assert_eq!(world.get_typeclass(id).unwrap(), "core.objects.Monster");
    assert_eq!(attr_value(&world, id, "health"), json!(20));
    assert_eq!(attr_value(&world, id, "resists"), json!(["cold", "poison"]));

    let tags = world.get_tags(id).unwrap();
    assert!(tags.iter().any(|t| {
        t.name == "greenskin" && t.category.as_deref() == Some("monster")
    }));
    assert!(tags.iter().any(|t| {
        t.name == "goblin" && t.category.as_deref() == Some(PROTOTYPE_TAG_CATEGORY)
    }));
}

#[test]
fn test_spawn_diamond_child() {
    let (mut world, store) = goblin_setup();
    let mut spawner = Spawner::new(&mut world, &store);

    let batch = spawner.spawn(
        vec![proto(json!({
            "prototype_key": "goblin_archwizard",
            "prototype_parent": ["GOBLIN_WIZARD", "ARCHWIZARD"],
            "key": "goblin archwizard",
        }))
        .into()],
        &SpawnOptions::default(),
    );
    assert!(batch.failures.is_empty(), "{:?}", batch.failures);
    let id = batch.spawned[0];

    assert_eq!(world.get_key(id).unwrap(), "goblin archwizard");
    // typeclass inherited through the chain
    assert_eq!(world.get_typeclass(id).unwrap(), "core.objects.Monster");
    // first-listed branch contributes its own fields
    assert_eq!(
        attr_value(&world, id, "spells"),
        json!(["fire ball", "lightning bolt"])
    );
    // the closer ancestor beats the shared grandparent
    assert_eq!(
        attr_value(&world, id, "attacks"),
        json!(["archwizard staff"])
    );
    assert_eq!(attr_value(&world, id, "health"), json!(20));
}

#[test]
fn test_spawn_batch_partial_failure() {
    let (mut world, store) = goblin_setup();
    let mut spawner = Spawner::new(&mut world, &store);

    let batch = spawner.spawn(
        vec![
            SpawnSource::Key("goblin".to_string()),
            proto(json!({
                "prototype_key": "broken",
                "prototype_parent": "NO_SUCH_PARENT",
            }))
            .into(),
            SpawnSource::Key("goblin_wizard".to_string()),
        ],
        &SpawnOptions::default(),
    );

    // the failing middle source never stops the rest
    assert_eq!(batch.spawned.len(), 2);
    assert_eq!(batch.failures.len(), 1);
    let failure = &batch.failures[0];
    assert_eq!(failure.index, 1);
    assert_eq!(failure.prototype_key.as_deref(), Some("broken"));
    assert!(matches!(
        failure.error,
        SpawnError::Resolve(ResolveError::PrototypeParentNotFound(ref key))
            if key == "NO_SUCH_PARENT"
    ));

    let wizard = batch.spawned[1];
    assert_eq!(world.get_key(wizard).unwrap(), "goblin wizard");
    assert_eq!(attr_value(&world, wizard, "health"), json!(20));
}

#[test]
fn test_spawn_short_tuples() {
    let mut world = MemoryWorld::new();
    let store = MemoryStore::new();
    let mut spawner = Spawner::new(&mut world, &store);

    let batch = spawner.spawn(
        vec![proto(json!({
            "prototype_key": "pile",
            "key": "a pile of sand",
            "attrs": [["quantity", 1]],
            "tags": ["groupable"],
        }))
        .into()],
        &SpawnOptions::default(),
    );
    assert!(batch.failures.is_empty(), "{:?}", batch.failures);
    let id = batch.spawned[0];

    assert_eq!(attr_value(&world, id, "quantity"), json!(1));
    let attrs = world.get_attrs(id).unwrap();
    assert_eq!(attrs[0].category, None);
    assert_eq!(attrs[0].locks, "");
    assert!(world.get_tags(id).unwrap().iter().any(|t| {
        t.name == "groupable" && t.category.is_none()
    }));
}

#[test]
fn test_child_override_survives_to_the_world() {
    let mut world = MemoryWorld::new();
    world.register_typeclass("core.objects.Weapon");
    let mut store = MemoryStore::new();
    store
        .save_prototype(&proto(json!({
            "prototype_key": "WEAPON",
            "typeclass": "core.objects.Weapon",
            "key": "weapon",
            "magic": false,
        })))
        .unwrap();
    store
        .save_prototype(&proto(json!({
            "prototype_key": "STING",
            "prototype_parent": "WEAPON",
            "key": "sting",
            "magic": true,
        })))
        .unwrap();
    let mut spawner = Spawner::new(&mut world, &store);

    let batch = spawner.spawn(
        vec!["weapon".into(), "sting".into()],
        &SpawnOptions::default(),
    );
    assert!(batch.failures.is_empty(), "{:?}", batch.failures);

    assert_eq!(attr_value(&world, batch.spawned[0], "magic"), json!(false));
    assert_eq!(attr_value(&world, batch.spawned[1], "magic"), json!(true));
}

#[test]
fn test_inline_parents_override_store_entries() {
    let (mut world, store) = goblin_setup();
    let mut spawner = Spawner::new(&mut world, &store);

    let mut options = SpawnOptions::default();
    add_to_pool(
        &mut options.prototype_parents,
        "GOBLIN",
        proto(json!({
            "typeclass": "core.objects.Monster",
            "key": "weakened goblin",
            "health": 5,
        })),
    );

    let batch = spawner.spawn(
        vec![proto(json!({
            "prototype_key": "runt",
            "prototype_parent": "GOBLIN",
        }))
        .into()],
        &options,
    );
    assert!(batch.failures.is_empty(), "{:?}", batch.failures);
    let id = batch.spawned[0];

    assert_eq!(world.get_key(id).unwrap(), "weakened goblin");
    assert_eq!(attr_value(&world, id, "health"), json!(5));
}

#[test]
fn test_protfunc_location_spawn() {
    let mut world = MemoryWorld::new();
    let north = world
        .create_entity(DEFAULT_TYPECLASS, "north beach", None, None, None)
        .unwrap();
    let south = world
        .create_entity(DEFAULT_TYPECLASS, "south beach", None, None, None)
        .unwrap();
    world.add_tag(north, "beach", Some("zone"), None).unwrap();
    world.add_tag(south, "beach", Some("zone"), None).unwrap();
    let store = MemoryStore::new();
    let mut spawner = Spawner::new(&mut world, &store);

    let batch = spawner.spawn(
        vec![proto(json!({
            "prototype_key": "crab",
            "key": "a crab",
            "location": "$choice($objlist(beach,category=zone,type=tag))",
        }))
        .into()],
        &SpawnOptions::default(),
    );
    assert!(batch.failures.is_empty(), "{:?}", batch.failures);
    assert!(batch.protfunc_errors.is_empty(), "{:?}", batch.protfunc_errors);
    let id = batch.spawned[0];

    let location = world.get_location(id).unwrap();
    assert!(
        location == Some(north) || location == Some(south),
        "got {location:?}"
    );
}

#[test]
fn test_unknown_protfunc_is_reported_and_kept_literal() {
    let mut world = MemoryWorld::new();
    let store = MemoryStore::new();
    let mut spawner = Spawner::new(&mut world, &store);

    let batch = spawner.spawn(
        vec![proto(json!({
            "prototype_key": "chant",
            "key": "chanter",
            "battlecry": "$warcry(loud)",
        }))
        .into()],
        &SpawnOptions::default(),
    );
    // the spawn itself succeeds; the error is reported alongside
    assert_eq!(batch.spawned.len(), 1);
    assert_eq!(batch.protfunc_errors.len(), 1);
    assert_eq!(
        attr_value(&world, batch.spawned[0], "battlecry"),
        json!("$warcry(loud)")
    );
}

#[test]
fn test_malformed_protfunc_spawns_as_literal_text() {
    let mut world = MemoryWorld::new();
    let store = MemoryStore::new();
    let mut spawner = Spawner::new(&mut world, &store);

    // unbalanced parens are not a call at all
    let batch = spawner.spawn(
        vec![proto(json!({
            "prototype_key": "odd",
            "key": "odd thing",
            "note": "$choice($objlist(",
        }))
        .into()],
        &SpawnOptions::default(),
    );
    assert!(batch.failures.is_empty(), "{:?}", batch.failures);
    assert!(batch.protfunc_errors.is_empty(), "{:?}", batch.protfunc_errors);
    assert_eq!(
        attr_value(&world, batch.spawned[0], "note"),
        json!("$choice($objlist(")
    );
}

#[test]
fn test_deterministic_protfuncs_in_testing_mode() {
    let mut world = MemoryWorld::new();
    let store = MemoryStore::new();
    let mut spawner = Spawner::new(&mut world, &store);

    let options = SpawnOptions {
        protfunc_testing: true,
        ..SpawnOptions::default()
    };
    let batch = spawner.spawn(
        vec![proto(json!({
            "prototype_key": "dice",
            "key": "$choice(loaded die, fair die)",
            "roll": "$randint(2, 12)",
        }))
        .into()],
        &options,
    );
    assert!(batch.failures.is_empty(), "{:?}", batch.failures);
    let id = batch.spawned[0];

    assert_eq!(world.get_key(id).unwrap(), "loaded die");
    assert_eq!(attr_value(&world, id, "roll"), json!(2));
}
