//! The builtin protfuncs and their registry.

use std::collections::HashMap;

use rand::Rng;
use rand::seq::SliceRandom;
use serde_json::Value;

use graft_core::{parse_dbref, to_dbref, value_to_display};

use crate::parser::{ProtFuncContext, ProtFuncError};

/// Handler signature for a registered protfunc.
pub type ProtFunc = fn(&[Value], &ProtFuncContext<'_>) -> Result<Value, ProtFuncError>;

/// Name -> handler table. [`ProtFuncRegistry::new`] starts from the
/// builtin set; handlers can be replaced or extended per spawner.
pub struct ProtFuncRegistry {
    funcs: HashMap<String, ProtFunc>,
}

impl Default for ProtFuncRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtFuncRegistry {
    /// The builtin function set.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register("protkey", protkey);
        registry.register("choice", choice);
        registry.register("random", random);
        registry.register("randint", randint);
        registry.register("add", add);
        registry.register("sub", sub);
        registry.register("mul", mul);
        registry.register("div", div);
        registry.register("toint", toint);
        registry.register("tostr", tostr);
        registry.register("obj", obj);
        registry.register("objlist", objlist);
        registry.register("dbref", dbref);
        registry
    }

    /// A registry with no functions at all.
    pub fn empty() -> Self {
        Self {
            funcs: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, func: ProtFunc) {
        self.funcs.insert(name.into(), func);
    }

    pub fn get(&self, name: &str) -> Option<&ProtFunc> {
        self.funcs.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.funcs.contains_key(name)
    }
}

fn expect_args(func: &str, args: &[Value], expected: usize) -> Result<(), ProtFuncError> {
    if args.len() != expected {
        return Err(ProtFuncError::InvalidArgCount {
            func: func.to_string(),
            expected: expected.to_string(),
            got: args.len(),
        });
    }
    Ok(())
}

fn arg_str(func: &str, args: &[Value], idx: usize) -> Result<String, ProtFuncError> {
    args.get(idx)
        .map(value_to_display)
        .ok_or_else(|| ProtFuncError::InvalidArgCount {
            func: func.to_string(),
            expected: format!("at least {}", idx + 1),
            got: args.len(),
        })
}

fn arg_int(func: &str, args: &[Value], idx: usize) -> Result<i64, ProtFuncError> {
    let value = arg_str(func, args, idx)?;
    value
        .trim()
        .parse::<i64>()
        .map_err(|_| ProtFuncError::Failed {
            func: func.to_string(),
            reason: format!("{value} is not an integer"),
        })
}

fn arg_num(func: &str, args: &[Value], idx: usize) -> Result<f64, ProtFuncError> {
    let value = arg_str(func, args, idx)?;
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| ProtFuncError::Failed {
            func: func.to_string(),
            reason: format!("{value} is not a number"),
        })
}

/// Both arguments as integers, when both parse as such.
fn int_pair(func: &str, args: &[Value]) -> Option<(i64, i64)> {
    let a = arg_int(func, args, 0).ok()?;
    let b = arg_int(func, args, 1).ok()?;
    Some((a, b))
}

fn num_value(x: f64) -> Value {
    serde_json::Number::from_f64(x).map_or(Value::Null, Value::Number)
}

/// `$protkey(name)`: the value of another field of the same record.
/// Looks at top-level fields first, then at attrs by name (homogenized
/// records carry custom fields there).
fn protkey(args: &[Value], ctx: &ProtFuncContext<'_>) -> Result<Value, ProtFuncError> {
    expect_args("protkey", args, 1)?;
    let name = arg_str("protkey", args, 0)?;
    if let Some(value) = ctx.prototype.get(&name) {
        return Ok(value.clone());
    }
    ctx.prototype
        .attrs()
        .into_iter()
        .find(|attr| attr.name == name)
        .map(|attr| attr.value)
        .ok_or_else(|| ProtFuncError::Failed {
            func: "protkey".to_string(),
            reason: format!("no field {name} in prototype"),
        })
}

/// `$choice(list)` or `$choice(a, b, ...)`: one element, at random.
/// Testing mode picks the first.
fn choice(args: &[Value], ctx: &ProtFuncContext<'_>) -> Result<Value, ProtFuncError> {
    let pool: Vec<Value> = match args {
        [] => {
            return Err(ProtFuncError::InvalidArgCount {
                func: "choice".to_string(),
                expected: "at least 1".to_string(),
                got: 0,
            });
        }
        [Value::Array(items)] => items.clone(),
        _ => args.to_vec(),
    };
    if pool.is_empty() {
        return Err(ProtFuncError::Failed {
            func: "choice".to_string(),
            reason: "nothing to choose from".to_string(),
        });
    }
    if ctx.testing {
        return Ok(pool[0].clone());
    }
    pool.choose(&mut rand::thread_rng())
        .cloned()
        .ok_or_else(|| ProtFuncError::Failed {
            func: "choice".to_string(),
            reason: "nothing to choose from".to_string(),
        })
}

/// `$random()`: a float in `[0, 1)`. Testing mode returns 0.5.
fn random(args: &[Value], ctx: &ProtFuncContext<'_>) -> Result<Value, ProtFuncError> {
    expect_args("random", args, 0)?;
    if ctx.testing {
        return Ok(num_value(0.5));
    }
    Ok(num_value(rand::thread_rng().gen_range(0.0..1.0)))
}

/// `$randint(lo, hi)`: an integer in `[lo, hi]`. Testing mode returns
/// `lo`.
fn randint(args: &[Value], ctx: &ProtFuncContext<'_>) -> Result<Value, ProtFuncError> {
    expect_args("randint", args, 2)?;
    let lo = arg_int("randint", args, 0)?;
    let hi = arg_int("randint", args, 1)?;
    if lo > hi {
        return Err(ProtFuncError::Failed {
            func: "randint".to_string(),
            reason: format!("empty range {lo}..{hi}"),
        });
    }
    if ctx.testing {
        return Ok(Value::from(lo));
    }
    Ok(Value::from(rand::thread_rng().gen_range(lo..=hi)))
}

fn checked_arith(
    func: &str,
    args: &[Value],
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, ProtFuncError> {
    expect_args(func, args, 2)?;
    if let Some((a, b)) = int_pair(func, args) {
        return int_op(a, b)
            .map(Value::from)
            .ok_or_else(|| ProtFuncError::Failed {
                func: func.to_string(),
                reason: "integer overflow".to_string(),
            });
    }
    let a = arg_num(func, args, 0)?;
    let b = arg_num(func, args, 1)?;
    Ok(num_value(float_op(a, b)))
}

/// `$add(a, b)`: integer-preserving when both sides are integers.
fn add(args: &[Value], _ctx: &ProtFuncContext<'_>) -> Result<Value, ProtFuncError> {
    checked_arith("add", args, i64::checked_add, |a, b| a + b)
}

fn sub(args: &[Value], _ctx: &ProtFuncContext<'_>) -> Result<Value, ProtFuncError> {
    checked_arith("sub", args, i64::checked_sub, |a, b| a - b)
}

fn mul(args: &[Value], _ctx: &ProtFuncContext<'_>) -> Result<Value, ProtFuncError> {
    checked_arith("mul", args, i64::checked_mul, |a, b| a * b)
}

/// `$div(a, b)`: always float division; dividing by zero fails.
fn div(args: &[Value], _ctx: &ProtFuncContext<'_>) -> Result<Value, ProtFuncError> {
    expect_args("div", args, 2)?;
    let a = arg_num("div", args, 0)?;
    let b = arg_num("div", args, 1)?;
    if b == 0.0 {
        return Err(ProtFuncError::Failed {
            func: "div".to_string(),
            reason: "division by zero".to_string(),
        });
    }
    Ok(num_value(a / b))
}

/// `$toint(v)`: integer coercion, truncating floats.
fn toint(args: &[Value], _ctx: &ProtFuncContext<'_>) -> Result<Value, ProtFuncError> {
    expect_args("toint", args, 1)?;
    if let Ok(n) = arg_int("toint", args, 0) {
        return Ok(Value::from(n));
    }
    let n = arg_num("toint", args, 0)?;
    Ok(Value::from(n.trunc() as i64))
}

/// `$tostr(v)`: display-string coercion.
fn tostr(args: &[Value], _ctx: &ProtFuncContext<'_>) -> Result<Value, ProtFuncError> {
    expect_args("tostr", args, 1)?;
    Ok(Value::String(arg_str("tostr", args, 0)?))
}

/// `$obj(query)`: exactly one entity by dbref, key or alias, as a dbref
/// string. Testing mode returns `#1` without querying.
fn obj(args: &[Value], ctx: &ProtFuncContext<'_>) -> Result<Value, ProtFuncError> {
    expect_args("obj", args, 1)?;
    let query = arg_str("obj", args, 0)?;
    if ctx.testing {
        return Ok(Value::String(to_dbref(1)));
    }
    let world = ctx.world.ok_or_else(|| ProtFuncError::NoWorld {
        func: "obj".to_string(),
    })?;
    let matches = world.find_by_key(query.trim());
    match matches.as_slice() {
        [id] => Ok(Value::String(to_dbref(*id))),
        [] => Err(ProtFuncError::Failed {
            func: "obj".to_string(),
            reason: format!("no match for {query}"),
        }),
        _ => Err(ProtFuncError::Failed {
            func: "obj".to_string(),
            reason: format!("{query} is ambiguous ({} matches)", matches.len()),
        }),
    }
}

/// `$objlist(query[, category=c][, type=tag|key])`: matching entities as
/// a list of dbref strings. `type=tag` searches tags (with an optional
/// category); the default searches keys and aliases. Testing mode
/// returns `["#1"]`.
fn objlist(args: &[Value], ctx: &ProtFuncContext<'_>) -> Result<Value, ProtFuncError> {
    let query = arg_str("objlist", args, 0)?;
    let mut category: Option<String> = None;
    let mut by_tag = false;
    for extra in &args[1..] {
        let extra = value_to_display(extra);
        let (name, value) = extra
            .split_once('=')
            .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
            .ok_or_else(|| ProtFuncError::Failed {
                func: "objlist".to_string(),
                reason: format!("unknown option {extra}"),
            })?;
        match name.as_str() {
            "category" => category = Some(value),
            "type" => match value.as_str() {
                "tag" => by_tag = true,
                "key" => by_tag = false,
                other => {
                    return Err(ProtFuncError::Failed {
                        func: "objlist".to_string(),
                        reason: format!("unknown search type {other}"),
                    });
                }
            },
            other => {
                return Err(ProtFuncError::Failed {
                    func: "objlist".to_string(),
                    reason: format!("unknown option {other}"),
                });
            }
        }
    }

    if ctx.testing {
        return Ok(Value::Array(vec![Value::String(to_dbref(1))]));
    }
    let world = ctx.world.ok_or_else(|| ProtFuncError::NoWorld {
        func: "objlist".to_string(),
    })?;
    let matches = if by_tag {
        world.find_by_tag(query.trim(), category.as_deref())
    } else {
        world.find_by_key(query.trim())
    };
    if matches.is_empty() {
        return Err(ProtFuncError::Failed {
            func: "objlist".to_string(),
            reason: format!("no matches for {query}"),
        });
    }
    Ok(Value::Array(
        matches
            .into_iter()
            .map(|id| Value::String(to_dbref(id)))
            .collect(),
    ))
}

/// `$dbref(v)`: validates dbref form and passes it through. Accepts a
/// bare integer and normalizes it to `#N`.
fn dbref(args: &[Value], _ctx: &ProtFuncContext<'_>) -> Result<Value, ProtFuncError> {
    expect_args("dbref", args, 1)?;
    let value = arg_str("dbref", args, 0)?;
    let trimmed = value.trim();
    if parse_dbref(trimmed).is_some() {
        return Ok(Value::String(trimmed.to_string()));
    }
    if let Ok(id) = trimmed.parse::<i64>() {
        return Ok(Value::String(to_dbref(id)));
    }
    Err(ProtFuncError::Failed {
        func: "dbref".to_string(),
        reason: format!("{value} is not a dbref"),
    })
}
