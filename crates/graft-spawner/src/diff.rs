//! Prototype diffing.
//!
//! A detailed diff compares two records field by field, recursing one
//! level into keyed fields so each element (by identity) gets its own
//! verdict. Flattening reduces that to one instruction per field, which
//! is what batch updates consume.

use std::fmt;
use std::mem::discriminant;

use indexmap::IndexMap;
use serde_json::Value;

use graft_core::Prototype;

/// Verdict for one diffed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffVerdict {
    Keep,
    Add,
    Update,
    Remove,
    /// Flattened only: a field with both removals and other changes has
    /// to be cleared and rewritten as a whole.
    Replace,
}

impl fmt::Display for DiffVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiffVerdict::Keep => "KEEP",
            DiffVerdict::Add => "ADD",
            DiffVerdict::Update => "UPDATE",
            DiffVerdict::Remove => "REMOVE",
            DiffVerdict::Replace => "REPLACE",
        };
        f.write_str(s)
    }
}

/// One node of a detailed diff: a scalar comparison, or a keyed sub-map
/// of element comparisons.
#[derive(Debug, Clone, PartialEq)]
pub enum DiffNode {
    Scalar {
        old: Value,
        new: Value,
        verdict: DiffVerdict,
    },
    Nested(IndexMap<String, DiffNode>),
}

impl DiffNode {
    fn scalar(old: Value, new: Value, verdict: DiffVerdict) -> Self {
        DiffNode::Scalar { old, new, verdict }
    }

    /// All leaf verdicts under this node.
    fn leaf_verdicts(&self, out: &mut Vec<DiffVerdict>) {
        match self {
            DiffNode::Scalar { verdict, .. } => out.push(*verdict),
            DiffNode::Nested(children) => {
                for child in children.values() {
                    child.leaf_verdicts(out);
                }
            }
        }
    }
}

/// Detailed diff: field name -> node, old-side field order first.
pub type Diff = IndexMap<String, DiffNode>;

/// Flattened diff: field name -> single verdict.
pub type FlatDiff = IndexMap<String, DiffVerdict>;

/// Keyed fields recurse one level, so elements compare as scalars.
const MAX_DEPTH: usize = 2;

/// JSON truthiness: null, false, zero, empty strings and empty
/// containers all count as unset.
fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64().is_some_and(|x| x == 0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

fn same_kind(a: &Value, b: &Value) -> bool {
    discriminant(a) == discriminant(b)
}

/// The identity of a keyed-field element: the first tuple element, or
/// the bare value itself.
fn element_identity(value: &Value) -> String {
    let ident = match value {
        Value::Array(parts) => parts.first().unwrap_or(&Value::Null),
        other => other,
    };
    match ident {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn identity_map(items: &[Value]) -> IndexMap<String, Value> {
    let mut map = IndexMap::new();
    for item in items {
        map.insert(element_identity(item), item.clone());
    }
    map
}

/// Union of keys, left-side order first, then right-only keys.
fn union_keys<'a, V>(left: &'a IndexMap<String, V>, right: &'a IndexMap<String, V>) -> Vec<String> {
    let mut keys: Vec<String> = left.keys().cloned().collect();
    for key in right.keys() {
        if !left.contains_key(key) {
            keys.push(key.clone());
        }
    }
    keys
}

fn explode(value: &Value, verdict: DiffVerdict) -> DiffNode {
    let make = |old_new: (Value, Value)| DiffNode::scalar(old_new.0, old_new.1, verdict);
    let sided = |v: Value| match verdict {
        DiffVerdict::Remove => (v, Value::Null),
        _ => (Value::Null, v),
    };
    match value {
        Value::Object(map) => DiffNode::Nested(
            map.iter()
                .map(|(k, v)| (k.clone(), make(sided(v.clone()))))
                .collect(),
        ),
        Value::Array(items) => DiffNode::Nested(
            identity_map(items)
                .into_iter()
                .map(|(k, v)| (k, make(sided(v))))
                .collect(),
        ),
        other => make(sided(other.clone())),
    }
}

fn diff_values(old: Option<&Value>, new: Option<&Value>, depth: usize) -> DiffNode {
    let null = Value::Null;
    let old_v = old.unwrap_or(&null);
    let new_v = new.unwrap_or(&null);
    let old_set = !is_falsy(old_v);
    let new_set = !is_falsy(new_v);

    // both unset: nothing to say
    if same_kind(old_v, new_v) && !old_set && !new_set {
        return DiffNode::scalar(Value::Null, Value::Null, DiffVerdict::Keep);
    }

    if !same_kind(old_v, new_v) {
        if old_set && !new_set {
            if depth < MAX_DEPTH && (old_v.is_object() || old_v.is_array()) {
                return explode(old_v, DiffVerdict::Remove);
            }
            return DiffNode::scalar(old_v.clone(), new_v.clone(), DiffVerdict::Remove);
        }
        if !old_set && new_set {
            if depth < MAX_DEPTH && (new_v.is_object() || new_v.is_array()) {
                return explode(new_v, DiffVerdict::Add);
            }
            return DiffNode::scalar(old_v.clone(), new_v.clone(), DiffVerdict::Add);
        }
        return DiffNode::scalar(old_v.clone(), new_v.clone(), DiffVerdict::Update);
    }

    if depth < MAX_DEPTH {
        if let (Value::Object(old_map), Value::Object(new_map)) = (old_v, new_v) {
            let children = old_map
                .keys()
                .chain(new_map.keys().filter(|k| !old_map.contains_key(*k)))
                .map(|key| {
                    (
                        key.clone(),
                        diff_values(old_map.get(key), new_map.get(key), depth + 1),
                    )
                })
                .collect();
            return DiffNode::Nested(children);
        }
        if let (Value::Array(old_items), Value::Array(new_items)) = (old_v, new_v) {
            let old_map = identity_map(old_items);
            let new_map = identity_map(new_items);
            let children = union_keys(&old_map, &new_map)
                .into_iter()
                .map(|key| {
                    let node = diff_values(old_map.get(&key), new_map.get(&key), depth + 1);
                    (key, node)
                })
                .collect();
            return DiffNode::Nested(children);
        }
    }

    if old_v != new_v {
        DiffNode::scalar(old_v.clone(), new_v.clone(), DiffVerdict::Update)
    } else {
        DiffNode::scalar(old_v.clone(), new_v.clone(), DiffVerdict::Keep)
    }
}

/// Diff two records, old side against new side. Both are homogenized
/// first, so equivalent spellings (short tuples, bare strings, folded
/// custom keys) compare as equal.
pub fn prototype_diff(old: &Prototype, new: &Prototype) -> Diff {
    let old = old.homogenized();
    let new = new.homogenized();
    let mut keys: Vec<String> = old.as_map().keys().cloned().collect();
    for key in new.as_map().keys() {
        if !old.contains_key(key) {
            keys.push(key.clone());
        }
    }
    keys.into_iter()
        .map(|key| {
            let node = diff_values(old.get(&key), new.get(&key), 1);
            (key, node)
        })
        .collect()
}

/// Soften removals for object-vs-prototype diffs: a top-level scalar
/// present only on the object side is kept, and object attrs the new
/// prototype does not mention are kept rather than removed. Element
/// removals under other keyed fields stand.
pub fn implicit_keep(diff: &mut Diff) {
    for (field, node) in diff.iter_mut() {
        match node {
            DiffNode::Scalar { verdict, .. } => {
                if *verdict == DiffVerdict::Remove {
                    *verdict = DiffVerdict::Keep;
                }
            }
            DiffNode::Nested(children) if field == "attrs" => {
                for child in children.values_mut() {
                    if let DiffNode::Scalar { verdict, .. } = child {
                        if *verdict == DiffVerdict::Remove {
                            *verdict = DiffVerdict::Keep;
                        }
                    }
                }
            }
            DiffNode::Nested(_) => {}
        }
    }
}

fn aggregate(verdicts: &[DiffVerdict]) -> DiffVerdict {
    if verdicts.iter().all(|v| *v == DiffVerdict::Keep) {
        return DiffVerdict::Keep;
    }
    if verdicts
        .iter()
        .all(|v| matches!(v, DiffVerdict::Add | DiffVerdict::Update))
    {
        return DiffVerdict::Update;
    }
    if verdicts.iter().all(|v| *v == DiffVerdict::Remove) {
        return DiffVerdict::Remove;
    }
    if verdicts.iter().any(|v| *v == DiffVerdict::Remove) {
        return DiffVerdict::Replace;
    }
    DiffVerdict::Update
}

/// Reduce a detailed diff to one verdict per field. Keep-only fields
/// stay in the result so callers can show untouched fields too.
pub fn flatten_diff(diff: &Diff) -> FlatDiff {
    diff.iter()
        .map(|(field, node)| {
            let mut verdicts = Vec::new();
            node.leaf_verdicts(&mut verdicts);
            (field.clone(), aggregate(&verdicts))
        })
        .collect()
}
