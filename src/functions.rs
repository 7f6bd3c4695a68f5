// ABOUTME: Built-in host functions — `identity`, `log`, `type`, `json`,
// `range`. Dispatched by name regardless of `$`, unlike methods (see
// `methods.rs`) which dispatch on `$`'s type. Typed, non-coercing argument
// handling throughout.

use crate::context::{Context, HostFunctionSpec, HostParam, LogLevel};
use crate::error::RillError;
use crate::lexer::Span;
use crate::value::{Dict, Key, SyncHostFn, Value};
use std::rc::Rc;

fn spec(params: Vec<HostParam>, description: &str, func: impl Into<Rc<dyn crate::value::HostFn>>) -> HostFunctionSpec {
    HostFunctionSpec {
        params,
        return_ty: None,
        description: Some(description.to_string()),
        func: func.into(),
    }
}

fn param(name: &str) -> HostParam {
    HostParam {
        name: name.to_string(),
        ty: None,
        default: None,
        description: Some(format!("the {name} argument")),
    }
}

/// A param for a pipe-facing builtin: when a bare-function pipe stage
/// supplies no explicit argument, `resolve_host_args` fills this slot with
/// `Value::Null` (never itself producible from Rill source) rather than
/// raising an arity error, and the builtin falls back to `ctx.pipe_value`.
fn pipe_param(name: &str) -> HostParam {
    HostParam {
        name: name.to_string(),
        ty: None,
        default: Some(Value::Null),
        description: Some(format!("the {name} argument; defaults to the piped value")),
    }
}

/// Resolves a pipe-facing builtin's sole argument: an explicit, non-null
/// value is used as-is; otherwise falls back to the context's current pipe
/// value, since `resolve_host_args` fills an omitted argument with `Null`.
fn arg_or_pipe_value(args: Vec<Value>, ctx: &Context) -> Value {
    match args.into_iter().next() {
        Some(Value::Null) | None => ctx.pipe_value.borrow().clone().unwrap_or(Value::Null),
        Some(v) => v,
    }
}

fn sync(f: impl Fn(Vec<Value>, &Context, Option<Span>) -> Result<Value, RillError> + 'static) -> Rc<dyn crate::value::HostFn> {
    Rc::new(SyncHostFn(f))
}

/// Returns its argument unchanged, falling back to `$` when called bare
/// as a pipe stage (`v -> identity`). Useful as a no-op pipe target and
/// for tests that need a stable identity function.
fn builtin_identity(args: Vec<Value>, ctx: &Context, _call_site: Option<Span>) -> Result<Value, RillError> {
    Ok(arg_or_pipe_value(args, ctx))
}

/// `log(message)` — forwards to the context's `onLog`/`onLogEvent`
/// callbacks and the `tracing` subscriber, then passes the message through.
/// Falls back to `$` when called bare as a pipe stage.
fn builtin_log(args: Vec<Value>, ctx: &Context, _call_site: Option<Span>) -> Result<Value, RillError> {
    let value = arg_or_pipe_value(args, ctx);
    ctx.log(LogLevel::Info, &value.to_string());
    Ok(value)
}

/// `type(value)` — the value's type name as a string, one of the eight
/// kinds in the data model. Falls back to `$` when called bare as a pipe
/// stage.
fn builtin_type(args: Vec<Value>, ctx: &Context, _call_site: Option<Span>) -> Result<Value, RillError> {
    let value = arg_or_pipe_value(args, ctx);
    Ok(Value::String(value.type_name().to_string()))
}

/// `json(value)` — a minimal JSON rendering of `value`. Dict keys that
/// aren't strings are stringified; no parsing direction — read-only
/// rendering is all the evaluator itself needs. Falls back to `$` when
/// called bare as a pipe stage.
fn builtin_json(args: Vec<Value>, ctx: &Context, call_site: Option<Span>) -> Result<Value, RillError> {
    let value = arg_or_pipe_value(args, ctx);
    let loc = call_site.map(|s| s.start).unwrap_or_default();
    let mut out = String::new();
    write_json(&value, &mut out, loc)?;
    Ok(Value::String(out))
}

fn write_json(value: &Value, out: &mut String, loc: crate::error::Location) -> Result<(), RillError> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            out.push('"');
            for ch in s.chars() {
                match ch {
                    '"' => out.push_str("\\\""),
                    '\\' => out.push_str("\\\\"),
                    '\n' => out.push_str("\\n"),
                    '\t' => out.push_str("\\t"),
                    c => out.push(c),
                }
            }
            out.push('"');
        }
        Value::List(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json(item, out, loc)?;
            }
            out.push(']');
        }
        Value::Dict(d) => {
            out.push('{');
            for (i, (k, v)) in d.entries().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json(&k.to_value(), out, loc)?;
                out.push(':');
                write_json(v, out, loc)?;
            }
            out.push('}');
        }
        Value::Closure(_) | Value::Tuple(_) => {
            return Err(RillError::type_mismatch("json", "string, number, bool, null, list, or dict", value.type_name(), loc))
        }
    }
    Ok(())
}

/// `range(start, stop, step?)` — a list of numbers, half-open on `stop`.
/// Fixed three-argument shape: step defaults to `1`, never `0`.
fn builtin_range(args: Vec<Value>, _ctx: &Context, call_site: Option<Span>) -> Result<Value, RillError> {
    let loc = call_site.map(|s| s.start).unwrap_or_default();
    let as_num = |v: &Value| {
        v.as_number()
            .ok_or_else(|| RillError::type_mismatch("range", "number", v.type_name(), loc))
    };
    let (start, stop, step) = match args.as_slice() {
        [stop] => (0.0, as_num(stop)?, 1.0),
        [start, stop] => (as_num(start)?, as_num(stop)?, 1.0),
        [start, stop, step] => (as_num(start)?, as_num(stop)?, as_num(step)?),
        _ => return Err(RillError::arity_mismatch("range", 2, args.len(), loc)),
    };
    if step == 0.0 {
        return Err(RillError::invalid_slice("range step cannot be zero", loc));
    }
    let mut out = Vec::new();
    let mut i = start;
    if step > 0.0 {
        while i < stop {
            out.push(Value::Number(i));
            i += step;
        }
    } else {
        while i > stop {
            out.push(Value::Number(i));
            i += step;
        }
    }
    Ok(Value::List(out))
}

/// `map_of(...)` — a dict from alternating key/value positional arguments,
/// useful when a host-side script wants to build a dict without the
/// literal `{}` grammar (e.g. assembled from a loop's collected values).
fn builtin_map_of(args: Vec<Value>, _ctx: &Context, call_site: Option<Span>) -> Result<Value, RillError> {
    let loc = call_site.map(|s| s.start).unwrap_or_default();
    if args.len() % 2 != 0 {
        return Err(RillError::arity_mismatch("map_of", args.len() + 1, args.len(), loc));
    }
    let mut dict = Dict::new();
    for pair in args.chunks(2) {
        let key = Key::from_value(&pair[0])
            .ok_or_else(|| RillError::type_mismatch("map_of key", "string, number, or bool", pair[0].type_name(), loc))?;
        dict.insert(key, pair[1].clone());
    }
    Ok(Value::Dict(dict))
}

pub fn builtin_functions() -> Vec<(String, HostFunctionSpec)> {
    vec![
        (
            "identity".to_string(),
            spec(
                vec![pipe_param("value")],
                "Returns its argument unchanged.",
                sync(builtin_identity),
            ),
        ),
        (
            "log".to_string(),
            spec(
                vec![pipe_param("message")],
                "Logs `message` through the host's onLog callback and passes it through.",
                sync(builtin_log),
            ),
        ),
        (
            "type".to_string(),
            spec(vec![pipe_param("value")], "The type name of `value`.", sync(builtin_type)),
        ),
        (
            "json".to_string(),
            spec(vec![pipe_param("value")], "Renders `value` as a JSON string.", sync(builtin_json)),
        ),
        (
            "range".to_string(),
            spec(
                vec![
                    HostParam {
                        name: "start".to_string(),
                        ty: None,
                        default: Some(Value::Number(0.0)),
                        description: Some("inclusive lower bound".to_string()),
                    },
                    param("stop"),
                    HostParam {
                        name: "step".to_string(),
                        ty: None,
                        default: Some(Value::Number(1.0)),
                        description: Some("increment, must not be zero".to_string()),
                    },
                ],
                "A list of numbers from `start` (inclusive) to `stop` (exclusive).",
                sync(builtin_range),
            ),
        ),
        (
            "map_of".to_string(),
            spec(
                vec![],
                "Builds a dict from alternating key, value positional arguments.",
                sync(builtin_map_of),
            ),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RillOptions;

    fn ctx() -> Context {
        Context::create(RillOptions::default()).expect("context")
    }

    #[test]
    fn range_is_half_open() {
        let c = ctx();
        let out = builtin_range(vec![Value::Number(1.0), Value::Number(4.0)], &c, None).unwrap();
        assert_eq!(
            out,
            Value::List(vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)])
        );
    }

    #[test]
    fn range_rejects_zero_step() {
        let c = ctx();
        let err = builtin_range(
            vec![Value::Number(0.0), Value::Number(5.0), Value::Number(0.0)],
            &c,
            None,
        )
        .unwrap_err();
        assert_eq!(err.error_id, "RILL-R005");
    }

    #[test]
    fn json_renders_nested_structures() {
        let c = ctx();
        let mut d = Dict::new();
        d.insert(Key::Str("a".into()), Value::List(vec![Value::Number(1.0), Value::Bool(true)]));
        let out = builtin_json(vec![Value::Dict(d)], &c, None).unwrap();
        assert_eq!(out, Value::String("{\"a\":[1,true]}".to_string()));
    }

    #[test]
    fn type_reports_kind_name() {
        let c = ctx();
        assert_eq!(
            builtin_type(vec![Value::String("x".into())], &c, None).unwrap(),
            Value::String("string".to_string())
        );
    }
}
