// ABOUTME: Built-in methods, dispatched by name on `$`'s type — `.len .str
// .upper .lower .trim .contains .split .head .join .eq .empty .first`, dict
// `.keys/.values/.entries`, list slicing helpers, iterator helpers. `$`
// arrives as the method call's first positional argument (see
// `eval_method_call` in `eval.rs`). Strict, non-coercing arity/type checks
// throughout.

use crate::context::{Context, HostFunctionSpec, HostParam};
use crate::error::{Location, RillError};
use crate::eval::ControlFlow;
use crate::lexer::Span;
use crate::value::{Closure, Dict, Key, SyncHostFn, Value};
use std::rc::Rc;

fn spec(params: Vec<HostParam>, description: &str, func: Rc<dyn crate::value::HostFn>) -> HostFunctionSpec {
    HostFunctionSpec {
        params,
        return_ty: None,
        description: Some(description.to_string()),
        func,
    }
}

fn self_param() -> HostParam {
    HostParam {
        name: "self".to_string(),
        ty: None,
        default: None,
        description: Some("the bound `$` value".to_string()),
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

fn sync(f: impl Fn(Vec<Value>, &Context, Option<Span>) -> Result<Value, RillError> + 'static) -> Rc<dyn crate::value::HostFn> {
    Rc::new(SyncHostFn(f))
}

fn loc(call_site: Option<Span>) -> Location {
    call_site.map(|s| s.start).unwrap_or_default()
}

fn self_arg(args: &[Value], method: &str) -> Result<&Value, RillError> {
    args.first()
        .ok_or_else(|| RillError::arity_mismatch(method, 1, 0, Location::default()))
}

// ===== string/list-shared =====

fn method_len(args: Vec<Value>, _ctx: &Context, call_site: Option<Span>) -> Result<Value, RillError> {
    let n = match self_arg(&args, "len")? {
        Value::String(s) => s.chars().count(),
        Value::List(items) => items.len(),
        Value::Dict(d) => d.len(),
        other => return Err(RillError::type_mismatch("len", "string, list, or dict", other.type_name(), loc(call_site))),
    };
    Ok(Value::Number(n as f64))
}

fn method_empty(args: Vec<Value>, _ctx: &Context, call_site: Option<Span>) -> Result<Value, RillError> {
    let b = match self_arg(&args, "empty")? {
        Value::String(s) => s.is_empty(),
        Value::List(items) => items.is_empty(),
        Value::Dict(d) => d.is_empty(),
        other => return Err(RillError::type_mismatch("empty", "string, list, or dict", other.type_name(), loc(call_site))),
    };
    Ok(Value::Bool(b))
}

fn method_eq(args: Vec<Value>, _ctx: &Context, call_site: Option<Span>) -> Result<Value, RillError> {
    let this = self_arg(&args, "eq")?;
    let other = args.get(1).ok_or_else(|| RillError::arity_mismatch("eq", 2, args.len(), loc(call_site)))?;
    Ok(Value::Bool(this == other))
}

fn method_contains(args: Vec<Value>, _ctx: &Context, call_site: Option<Span>) -> Result<Value, RillError> {
    let needle = args.get(1).ok_or_else(|| RillError::arity_mismatch("contains", 2, args.len(), loc(call_site)))?;
    let b = match self_arg(&args, "contains")? {
        Value::String(s) => match needle.as_str() {
            Some(n) => s.contains(n),
            None => return Err(RillError::type_mismatch("contains", "string", needle.type_name(), loc(call_site))),
        },
        Value::List(items) => items.contains(needle),
        Value::Dict(d) => Key::from_value(needle).map(|k| d.contains(&k)).unwrap_or(false),
        other => return Err(RillError::type_mismatch("contains", "string, list, or dict", other.type_name(), loc(call_site))),
    };
    Ok(Value::Bool(b))
}

// ===== string-only =====

fn as_string<'a>(v: &'a Value, method: &str, call_site: Option<Span>) -> Result<&'a str, RillError> {
    v.as_str().ok_or_else(|| RillError::type_mismatch(method, "string", v.type_name(), loc(call_site)))
}

fn method_str(args: Vec<Value>, _ctx: &Context, call_site: Option<Span>) -> Result<Value, RillError> {
    let _ = call_site;
    Ok(Value::String(self_arg(&args, "str")?.to_string()))
}

fn method_upper(args: Vec<Value>, _ctx: &Context, call_site: Option<Span>) -> Result<Value, RillError> {
    let s = as_string(self_arg(&args, "upper")?, "upper", call_site)?;
    Ok(Value::String(s.to_uppercase()))
}

fn method_lower(args: Vec<Value>, _ctx: &Context, call_site: Option<Span>) -> Result<Value, RillError> {
    let s = as_string(self_arg(&args, "lower")?, "lower", call_site)?;
    Ok(Value::String(s.to_lowercase()))
}

fn method_trim(args: Vec<Value>, _ctx: &Context, call_site: Option<Span>) -> Result<Value, RillError> {
    let s = as_string(self_arg(&args, "trim")?, "trim", call_site)?;
    Ok(Value::String(s.trim().to_string()))
}

fn method_split(args: Vec<Value>, _ctx: &Context, call_site: Option<Span>) -> Result<Value, RillError> {
    let s = as_string(self_arg(&args, "split")?, "split", call_site)?;
    let sep = args
        .get(1)
        .map(|v| as_string(v, "split", call_site))
        .transpose()?
        .unwrap_or(" ");
    let parts = if sep.is_empty() {
        s.chars().map(|c| Value::String(c.to_string())).collect()
    } else {
        s.split(sep).map(|p| Value::String(p.to_string())).collect()
    };
    Ok(Value::List(parts))
}

fn method_join(args: Vec<Value>, _ctx: &Context, call_site: Option<Span>) -> Result<Value, RillError> {
    let this = self_arg(&args, "join")?;
    let items = this
        .as_list()
        .ok_or_else(|| RillError::type_mismatch("join", "list", this.type_name(), loc(call_site)))?;
    let sep = args
        .get(1)
        .map(|v| as_string(v, "join", call_site))
        .transpose()?
        .unwrap_or("");
    let joined = items.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(sep);
    Ok(Value::String(joined))
}

// ===== list-only =====

fn method_head(args: Vec<Value>, _ctx: &Context, call_site: Option<Span>) -> Result<Value, RillError> {
    let this = self_arg(&args, "head")?;
    match this {
        Value::List(items) => items.first().cloned().ok_or_else(|| RillError::missing_field("head", loc(call_site))),
        Value::String(s) => s
            .chars()
            .next()
            .map(|c| Value::String(c.to_string()))
            .ok_or_else(|| RillError::missing_field("head", loc(call_site))),
        other => Err(RillError::type_mismatch("head", "list or string", other.type_name(), loc(call_site))),
    }
}

/// `.first()` — for lists/strings, an alias for `.head()`; for an
/// iterator-shaped dict (`{done, value?, next}`), peeks the current
/// `value` without advancing (advancing is `$iter.next()`, a plain field
/// access + invoke since `next` is itself a bound closure).
fn method_first(args: Vec<Value>, ctx: &Context, call_site: Option<Span>) -> Result<Value, RillError> {
    let this = self_arg(&args, "first")?;
    if let Value::Dict(_) = this {
        let (_, done, value, _) = this
            .iterator_shape()
            .ok_or_else(|| RillError::iterator_shape(loc(call_site)))?;
        return if done {
            Err(RillError::missing_field("value", loc(call_site)))
        } else {
            Ok(value.cloned().unwrap_or(Value::Null))
        };
    }
    method_head(args, ctx, call_site)
}

// ===== dict-only =====

fn method_keys(args: Vec<Value>, _ctx: &Context, call_site: Option<Span>) -> Result<Value, RillError> {
    let this = self_arg(&args, "keys")?;
    let dict = this
        .as_dict()
        .ok_or_else(|| RillError::type_mismatch("keys", "dict", this.type_name(), loc(call_site)))?;
    Ok(Value::List(dict.keys().map(|k| k.to_value()).collect()))
}

fn method_values(args: Vec<Value>, _ctx: &Context, call_site: Option<Span>) -> Result<Value, RillError> {
    let this = self_arg(&args, "values")?;
    let dict = this
        .as_dict()
        .ok_or_else(|| RillError::type_mismatch("values", "dict", this.type_name(), loc(call_site)))?;
    Ok(Value::List(dict.values().cloned().collect()))
}

fn method_entries(args: Vec<Value>, _ctx: &Context, call_site: Option<Span>) -> Result<Value, RillError> {
    let this = self_arg(&args, "entries")?;
    let dict = this
        .as_dict()
        .ok_or_else(|| RillError::type_mismatch("entries", "dict", this.type_name(), loc(call_site)))?;
    let out = dict
        .entries()
        .map(|(k, v)| {
            let mut pair = Dict::new();
            pair.insert(Key::Str("key".to_string()), k.to_value());
            pair.insert(Key::Str("value".to_string()), v.clone());
            Value::Dict(pair)
        })
        .collect();
    Ok(Value::List(out))
}

// ===== iteration (`each`/`map`/`filter`/`fold`) =====

/// Runs `closure` and reports whether it produced a `break`. Inside
/// `each`/`map`/`filter`/`fold`, a `break` inside the closure terminates
/// iteration early and the break value becomes the whole operator's result.
async fn call_closure_for_iteration(
    ctx: &Context,
    closure: &Closure,
    args: Vec<Value>,
    loc: Location,
) -> Result<(Value, bool), RillError> {
    match crate::eval::call_closure(ctx, closure, &args, loc).await? {
        ControlFlow::Break(v) => Ok((v, true)),
        ControlFlow::Return(v) | ControlFlow::Value(v) => Ok((v, false)),
    }
}

struct EachFn;
#[async_trait::async_trait(?Send)]
impl crate::value::HostFn for EachFn {
    async fn call(&self, args: Vec<Value>, ctx: Context, call_site: Option<Span>) -> Result<Value, RillError> {
        let location = loc(call_site);
        let this = self_arg(&args, "each")?.clone();
        let closure = args
            .get(1)
            .and_then(|v| v.as_closure())
            .ok_or_else(|| RillError::type_mismatch("each", "closure", "other", location))?
            .clone();
        let items = this
            .as_list()
            .ok_or_else(|| RillError::type_mismatch("each", "list", this.type_name(), location))?;
        for item in items {
            let (value, broke) = call_closure_for_iteration(&ctx, &closure, vec![item.clone()], location).await?;
            if broke {
                return Ok(value);
            }
        }
        Ok(this)
    }
}

struct MapFn;
#[async_trait::async_trait(?Send)]
impl crate::value::HostFn for MapFn {
    async fn call(&self, args: Vec<Value>, ctx: Context, call_site: Option<Span>) -> Result<Value, RillError> {
        let location = loc(call_site);
        let this = self_arg(&args, "map")?.clone();
        let closure = args
            .get(1)
            .and_then(|v| v.as_closure())
            .ok_or_else(|| RillError::type_mismatch("map", "closure", "other", location))?
            .clone();
        let items = this
            .as_list()
            .ok_or_else(|| RillError::type_mismatch("map", "list", this.type_name(), location))?;
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            let (value, broke) = call_closure_for_iteration(&ctx, &closure, vec![item.clone()], location).await?;
            if broke {
                return Ok(value);
            }
            out.push(value);
        }
        Ok(Value::List(out))
    }
}

struct FilterFn;
#[async_trait::async_trait(?Send)]
impl crate::value::HostFn for FilterFn {
    async fn call(&self, args: Vec<Value>, ctx: Context, call_site: Option<Span>) -> Result<Value, RillError> {
        let location = loc(call_site);
        let this = self_arg(&args, "filter")?.clone();
        let closure = args
            .get(1)
            .and_then(|v| v.as_closure())
            .ok_or_else(|| RillError::type_mismatch("filter", "closure", "other", location))?
            .clone();
        let items = this
            .as_list()
            .ok_or_else(|| RillError::type_mismatch("filter", "list", this.type_name(), location))?;
        let mut out = Vec::new();
        for item in items {
            let (keep, broke) = call_closure_for_iteration(&ctx, &closure, vec![item.clone()], location).await?;
            if broke {
                return Ok(keep);
            }
            let keep = keep
                .as_bool()
                .ok_or_else(|| RillError::type_mismatch("filter predicate", "bool", keep.type_name(), location))?;
            if keep {
                out.push(item.clone());
            }
        }
        Ok(Value::List(out))
    }
}

struct FoldFn;
#[async_trait::async_trait(?Send)]
impl crate::value::HostFn for FoldFn {
    async fn call(&self, args: Vec<Value>, ctx: Context, call_site: Option<Span>) -> Result<Value, RillError> {
        let location = loc(call_site);
        let this = self_arg(&args, "fold")?.clone();
        let init = args
            .get(1)
            .cloned()
            .ok_or_else(|| RillError::arity_mismatch("fold", 3, args.len(), location))?;
        let closure = args
            .get(2)
            .and_then(|v| v.as_closure())
            .ok_or_else(|| RillError::type_mismatch("fold", "closure", "other", location))?
            .clone();
        let items = this
            .as_list()
            .ok_or_else(|| RillError::type_mismatch("fold", "list", this.type_name(), location))?;
        let mut acc = init;
        for item in items {
            let (value, broke) = call_closure_for_iteration(&ctx, &closure, vec![acc, item.clone()], location).await?;
            if broke {
                return Ok(value);
            }
            acc = value;
        }
        Ok(acc)
    }
}

pub fn builtin_methods() -> Vec<(String, HostFunctionSpec)> {
    vec![
        ("len".to_string(), spec(vec![self_param()], "Length of a string, list, or dict.", sync(method_len))),
        ("empty".to_string(), spec(vec![self_param()], "Whether a string, list, or dict has no elements.", sync(method_empty))),
        ("eq".to_string(), spec(vec![self_param(), param("other")], "Structural equality with `other`.", sync(method_eq))),
        (
            "contains".to_string(),
            spec(vec![self_param(), param("needle")], "Whether `needle` is present.", sync(method_contains)),
        ),
        ("str".to_string(), spec(vec![self_param()], "String rendering of `$`.", sync(method_str))),
        ("upper".to_string(), spec(vec![self_param()], "Uppercased string.", sync(method_upper))),
        ("lower".to_string(), spec(vec![self_param()], "Lowercased string.", sync(method_lower))),
        ("trim".to_string(), spec(vec![self_param()], "String with leading/trailing whitespace removed.", sync(method_trim))),
        (
            "split".to_string(),
            spec(
                vec![
                    self_param(),
                    HostParam {
                        name: "separator".to_string(),
                        ty: None,
                        default: Some(Value::String(" ".to_string())),
                        description: Some("separator string".to_string()),
                    },
                ],
                "Splits a string on `separator` into a list.",
                sync(method_split),
            ),
        ),
        (
            "join".to_string(),
            spec(
                vec![
                    self_param(),
                    HostParam {
                        name: "separator".to_string(),
                        ty: None,
                        default: Some(Value::String("".to_string())),
                        description: Some("separator string".to_string()),
                    },
                ],
                "Joins a list into a string with `separator`.",
                sync(method_join),
            ),
        ),
        ("head".to_string(), spec(vec![self_param()], "First element of a list or string.", sync(method_head))),
        ("first".to_string(), spec(vec![self_param()], "Alias for `.head`.", sync(method_first))),
        ("keys".to_string(), spec(vec![self_param()], "Dict keys, insertion order.", sync(method_keys))),
        ("values".to_string(), spec(vec![self_param()], "Dict values, insertion order.", sync(method_values))),
        (
            "entries".to_string(),
            spec(vec![self_param()], "Dict entries as `{key, value}` dicts, insertion order.", sync(method_entries)),
        ),
        (
            "each".to_string(),
            spec(
                vec![self_param(), param("fn")],
                "Calls `fn` with each list item in order, for side effects. Returns `$` unchanged.",
                Rc::new(EachFn) as Rc<dyn crate::value::HostFn>,
            ),
        ),
        (
            "map".to_string(),
            spec(
                vec![self_param(), param("fn")],
                "Applies `fn` to each list item, preserving order.",
                Rc::new(MapFn) as Rc<dyn crate::value::HostFn>,
            ),
        ),
        (
            "filter".to_string(),
            spec(
                vec![self_param(), param("fn")],
                "Keeps list items for which `fn` returns true, preserving order.",
                Rc::new(FilterFn) as Rc<dyn crate::value::HostFn>,
            ),
        ),
        (
            "fold".to_string(),
            spec(
                vec![self_param(), param("init"), param("fn")],
                "Reduces a list left-to-right, starting from `init`.",
                Rc::new(FoldFn) as Rc<dyn crate::value::HostFn>,
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
    fn len_over_string_list_dict() {
        let c = ctx();
        assert_eq!(method_len(vec![Value::String("abc".into())], &c, None).unwrap(), Value::Number(3.0));
        assert_eq!(
            method_len(vec![Value::List(vec![Value::Number(1.0), Value::Number(2.0)])], &c, None).unwrap(),
            Value::Number(2.0)
        );
    }

    #[test]
    fn split_default_separator_is_space() {
        let c = ctx();
        let out = method_split(vec![Value::String("a b  c".into())], &c, None).unwrap();
        assert_eq!(
            out,
            Value::List(vec![
                Value::String("a".into()),
                Value::String("b".into()),
                Value::String("".into()),
                Value::String("c".into())
            ])
        );
    }

    #[test]
    fn join_with_separator() {
        let c = ctx();
        let list = Value::List(vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)]);
        let out = method_join(vec![list, Value::String(",".into())], &c, None).unwrap();
        assert_eq!(out, Value::String("1,2,3".to_string()));
    }

    #[test]
    fn contains_checks_list_membership() {
        let c = ctx();
        let list = Value::List(vec![Value::Number(1.0), Value::Number(2.0)]);
        assert_eq!(method_contains(vec![list, Value::Number(2.0)], &c, None).unwrap(), Value::Bool(true));
    }

    #[test]
    fn keys_values_entries_preserve_insertion_order() {
        let c = ctx();
        let mut d = Dict::new();
        d.insert(Key::Str("b".into()), Value::Number(2.0));
        d.insert(Key::Str("a".into()), Value::Number(1.0));
        let keys = method_keys(vec![Value::Dict(d.clone())], &c, None).unwrap();
        assert_eq!(keys, Value::List(vec![Value::String("b".into()), Value::String("a".into())]));
    }
}
