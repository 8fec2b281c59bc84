//! Prototype resolution, diffing, and spawning.
//!
//! The spawner turns inheritable prototype records into live entities:
//! [`resolve`] flattens a record against its parent chain and evaluates
//! embedded protfuncs, [`diff`] classifies the differences between two
//! records field by field, and [`spawn`] orchestrates batch creation
//! and idempotent updates through the world and store seams.

pub mod diff;
pub mod resolve;
pub mod spawn;

pub use diff::{Diff, DiffNode, DiffVerdict, FlatDiff, flatten_diff, implicit_keep, prototype_diff};
pub use resolve::{ParentPool, ResolveError, add_to_pool, flatten_prototype, resolve_prototype};
pub use spawn::{SpawnBatch, SpawnError, SpawnFailure, SpawnOptions, SpawnSource, Spawner};
