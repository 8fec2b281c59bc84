//! Scanner and evaluator for `$name(arg, ...)` calls embedded in
//! prototype string values.
//!
//! Calls evaluate innermost-first. A value that consists of exactly one
//! call keeps the handler's native return type; calls embedded in
//! surrounding text stringify and concatenate. A failed or unknown call
//! is reported and its literal text kept in place, so a bad protfunc
//! never aborts a spawn. An unbalanced `$name(` is not a call at all
//! and passes through untouched.
//!
//! Only string values are scanned; protfuncs nested inside arrays or
//! objects stay literal.

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use graft_core::{AttrData, EntityId, Prototype, TagData, World, value_to_display};

use crate::funcs::ProtFuncRegistry;

#[derive(Debug, Error)]
pub enum ProtFuncError {
    #[error("unknown protfunc: {0}")]
    UnknownFunction(String),

    #[error("{func} takes {expected} arguments, got {got}")]
    InvalidArgCount {
        func: String,
        expected: String,
        got: usize,
    },

    #[error("{func} needs a world to query")]
    NoWorld { func: String },

    #[error("{func} failed: {reason}")]
    Failed { func: String, reason: String },
}

/// Evaluation context handed to every handler.
pub struct ProtFuncContext<'a> {
    /// The record the evaluated value belongs to.
    pub prototype: &'a Prototype,
    /// Live game state, when available.
    pub world: Option<&'a dyn World>,
    /// The entity on whose behalf the evaluation runs.
    pub caller: Option<EntityId>,
    /// Deterministic mode: no randomness, no world queries.
    pub testing: bool,
}

impl<'a> ProtFuncContext<'a> {
    pub fn new(prototype: &'a Prototype) -> Self {
        Self {
            prototype,
            world: None,
            caller: None,
            testing: false,
        }
    }

    pub fn with_world(mut self, world: &'a dyn World) -> Self {
        self.world = Some(world);
        self
    }

    pub fn with_caller(mut self, caller: EntityId) -> Self {
        self.caller = Some(caller);
        self
    }

    pub fn testing(mut self) -> Self {
        self.testing = true;
        self
    }
}

struct CallSpan {
    start: usize,
    end: usize,
    name: String,
    args: String,
}

/// Find complete `$name( ... )` spans with balanced parentheses.
fn scan_calls(input: &str) -> Vec<CallSpan> {
    let bytes = input.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let name_start = i + 1;
        if name_start >= bytes.len()
            || !(bytes[name_start].is_ascii_alphabetic() || bytes[name_start] == b'_')
        {
            i += 1;
            continue;
        }
        let mut j = name_start;
        while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
            j += 1;
        }
        if j >= bytes.len() || bytes[j] != b'(' {
            i += 1;
            continue;
        }
        let mut depth = 0usize;
        let mut close = None;
        let mut k = j;
        while k < bytes.len() {
            match bytes[k] {
                b'(' => depth += 1,
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        close = Some(k);
                        break;
                    }
                }
                _ => {}
            }
            k += 1;
        }
        let Some(close) = close else {
            // unbalanced: not a call
            i += 1;
            continue;
        };
        spans.push(CallSpan {
            start: i,
            end: close + 1,
            name: input[name_start..j].to_string(),
            args: input[j + 1..close].to_string(),
        });
        i = close + 1;
    }
    spans
}

/// Split an argument list on top-level commas only.
fn split_args(args: &str) -> Vec<&str> {
    if args.trim().is_empty() {
        return Vec::new();
    }
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (idx, &b) in args.as_bytes().iter().enumerate() {
        match b {
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            b',' if depth == 0 => {
                parts.push(&args[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&args[start..]);
    parts
}

fn run_call(
    span: &CallSpan,
    registry: &ProtFuncRegistry,
    ctx: &ProtFuncContext<'_>,
    errors: &mut Vec<ProtFuncError>,
) -> Result<Value, ProtFuncError> {
    let args: Vec<Value> = split_args(&span.args)
        .into_iter()
        .map(|arg| eval_value(arg.trim(), registry, ctx, errors))
        .collect();
    let handler = registry
        .get(&span.name)
        .ok_or_else(|| ProtFuncError::UnknownFunction(span.name.clone()))?;
    handler(&args, ctx)
}

/// Evaluate one string value against a registry and context.
///
/// Failures are pushed onto `errors` and leave the call's literal text
/// in the output.
pub fn eval_value(
    input: &str,
    registry: &ProtFuncRegistry,
    ctx: &ProtFuncContext<'_>,
    errors: &mut Vec<ProtFuncError>,
) -> Value {
    let spans = scan_calls(input);
    if spans.is_empty() {
        return Value::String(input.to_string());
    }

    if spans.len() == 1 && spans[0].start == 0 && spans[0].end == input.len() {
        return match run_call(&spans[0], registry, ctx, errors) {
            Ok(value) => value,
            Err(err) => {
                warn!(func = %spans[0].name, error = %err, "protfunc failed; keeping literal text");
                errors.push(err);
                Value::String(input.to_string())
            }
        };
    }

    let mut out = String::new();
    let mut cursor = 0;
    for span in &spans {
        out.push_str(&input[cursor..span.start]);
        match run_call(span, registry, ctx, errors) {
            Ok(value) => out.push_str(&value_to_display(&value)),
            Err(err) => {
                warn!(func = %span.name, error = %err, "protfunc failed; keeping literal text");
                errors.push(err);
                out.push_str(&input[span.start..span.end]);
            }
        }
        cursor = span.end;
    }
    out.push_str(&input[cursor..]);
    Value::String(out)
}

/// Evaluate every string-bearing position of a record: scalar string
/// fields, attr names and string attr values, tag names, aliases and
/// permissions. The record itself is the context the handlers see.
///
/// Returns the evaluated record together with any recovered errors.
pub fn eval_prototype(
    record: &Prototype,
    registry: &ProtFuncRegistry,
    world: Option<&dyn World>,
    caller: Option<EntityId>,
    testing: bool,
) -> (Prototype, Vec<ProtFuncError>) {
    let mut errors = Vec::new();
    let ctx = ProtFuncContext {
        prototype: record,
        world,
        caller,
        testing,
    };

    let mut out = record.clone();
    for (key, value) in record.iter() {
        match key.as_str() {
            "attrs" => {
                let attrs: Vec<Value> = record
                    .attrs()
                    .into_iter()
                    .map(|attr| {
                        let name =
                            value_to_display(&eval_value(&attr.name, registry, &ctx, &mut errors));
                        let value = match &attr.value {
                            Value::String(s) => eval_value(s, registry, &ctx, &mut errors),
                            other => other.clone(),
                        };
                        AttrData {
                            name,
                            value,
                            category: attr.category,
                            locks: attr.locks,
                        }
                        .to_value()
                    })
                    .collect();
                out.set("attrs", Value::Array(attrs));
            }
            "tags" => {
                let tags: Vec<Value> = record
                    .tags()
                    .into_iter()
                    .map(|tag| {
                        let name =
                            value_to_display(&eval_value(&tag.name, registry, &ctx, &mut errors));
                        TagData {
                            name,
                            category: tag.category,
                            data: tag.data,
                        }
                        .to_value()
                    })
                    .collect();
                out.set("tags", Value::Array(tags));
            }
            "aliases" | "permissions" => {
                let items: Vec<Value> = match value {
                    Value::Array(items) => items
                        .iter()
                        .map(|item| match item {
                            Value::String(s) => Value::String(value_to_display(&eval_value(
                                s,
                                registry,
                                &ctx,
                                &mut errors,
                            ))),
                            other => other.clone(),
                        })
                        .collect(),
                    _ => continue,
                };
                out.set(key.clone(), Value::Array(items));
            }
            _ => {
                if let Value::String(s) = value {
                    out.set(key.clone(), eval_value(s, registry, &ctx, &mut errors));
                }
            }
        }
    }
    (out, errors)
}
