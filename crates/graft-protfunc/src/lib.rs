//! Embedded `$func(...)` calls for prototype values.

pub mod funcs;
pub mod parser;

pub use funcs::{ProtFunc, ProtFuncRegistry};
pub use parser::{ProtFuncContext, ProtFuncError, eval_prototype, eval_value};
