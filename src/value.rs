// ABOUTME: The Rill value model — the tagged union every pipe stage reads
// from and produces. A flat enum with a `Display` impl and inline unit
// tests, over the acyclic string/number/bool/null/list/dict/closure/tuple
// set, with structural equality throughout.

use crate::ast::{ClosureLit, Expr, Param};
use crate::error::RillError;
use crate::lexer::Span;
use crate::scope::Scope;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

/// A host-registered callable: `(args, ctx, callSite?) -> value |
/// future<value>`. Declared `?Send` because `Value`/`Scope` are `Rc`-based
/// and the evaluator is single-threaded cooperative.
#[async_trait(?Send)]
pub trait HostFn {
    async fn call(
        &self,
        args: Vec<Value>,
        ctx: crate::context::Context,
        call_site: Option<Span>,
    ) -> Result<Value, RillError>;
}

/// Convenience wrapper so plain non-async Rust closures can be registered
/// without implementing `HostFn` by hand.
pub struct SyncHostFn<F>(pub F)
where
    F: Fn(Vec<Value>, &crate::context::Context, Option<Span>) -> Result<Value, RillError>;

#[async_trait(?Send)]
impl<F> HostFn for SyncHostFn<F>
where
    F: Fn(Vec<Value>, &crate::context::Context, Option<Span>) -> Result<Value, RillError>,
{
    async fn call(
        &self,
        args: Vec<Value>,
        ctx: crate::context::Context,
        call_site: Option<Span>,
    ) -> Result<Value, RillError> {
        (self.0)(args, &ctx, call_site)
    }
}

#[derive(Clone)]
pub struct ApplicationClosure {
    pub name: String,
    pub func: Rc<dyn HostFn>,
    pub is_property: bool,
}

impl fmt::Debug for ApplicationClosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationClosure")
            .field("name", &self.name)
            .field("is_property", &self.is_property)
            .finish()
    }
}

impl PartialEq for ApplicationClosure {
    /// Application callables compare by identity.
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.func, &other.func)
    }
}

#[derive(Debug, Clone)]
pub struct ScriptClosure {
    pub params: Vec<Param>,
    pub body: Expr,
    pub env: Scope,
    pub name: Option<String>,
}

impl PartialEq for ScriptClosure {
    /// Script callables compare structurally on `(params, body, captured)`,
    /// not on scope identity, so two closures built from independently
    /// constructed but equal environments still compare equal.
    fn eq(&self, other: &Self) -> bool {
        self.params == other.params
            && self.body == other.body
            && self.env.visible_bindings() == other.env.visible_bindings()
    }
}

impl ScriptClosure {
    pub fn from_lit(lit: &ClosureLit, env: Scope, name: Option<String>) -> Self {
        ScriptClosure {
            params: lit.params.clone(),
            body: (*lit.body).clone(),
            env,
            name,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Closure {
    Script(Rc<ScriptClosure>),
    Application(Rc<ApplicationClosure>),
}

impl Closure {
    pub fn is_property(&self) -> bool {
        matches!(self, Closure::Application(a) if a.is_property)
    }

    pub fn arity(&self) -> Option<usize> {
        match self {
            Closure::Script(s) => Some(s.params.len()),
            Closure::Application(_) => None,
        }
    }
}

/// A dict key — restricted to string/number/boolean.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Str(String),
    Num(u64), // f64::to_bits, so NaN/−0 behave consistently as hash keys
    Bool(bool),
}

impl Key {
    pub fn from_value(v: &Value) -> Option<Key> {
        match v {
            Value::String(s) => Some(Key::Str(s.clone())),
            Value::Number(n) => Some(Key::Num(n.to_bits())),
            Value::Bool(b) => Some(Key::Bool(*b)),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Key::Str(s) => Value::String(s.clone()),
            Key::Num(bits) => Value::Number(f64::from_bits(*bits)),
            Key::Bool(b) => Value::Bool(*b),
        }
    }
}

/// Insertion-ordered dict with unique logical keys. Multi-key entries
/// (`["a","b"]: v`) are stored once under a canonical key with the
/// remaining keys recorded as aliases resolving to it.
#[derive(Debug, Clone, Default)]
pub struct Dict {
    entries: IndexMap<Key, Value>,
    aliases: IndexMap<Key, Key>,
}

impl Dict {
    pub fn new() -> Self {
        Dict::default()
    }

    /// Inserts `value` reachable by every key in `keys` (first key is
    /// canonical for iteration order and `.keys()`/`.entries()`).
    pub fn insert_multi(&mut self, keys: Vec<Key>, value: Value) {
        let mut iter = keys.into_iter();
        let Some(canonical) = iter.next() else {
            return;
        };
        self.aliases.retain(|_, v| *v != canonical);
        self.entries.insert(canonical.clone(), value);
        for alias in iter {
            if alias != canonical {
                self.entries.shift_remove(&alias);
                self.aliases.insert(alias, canonical.clone());
            }
        }
    }

    pub fn insert(&mut self, key: Key, value: Value) {
        self.insert_multi(vec![key], value);
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.entries
            .get(key)
            .or_else(|| self.aliases.get(key).and_then(|canon| self.entries.get(canon)))
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.entries.contains_key(key) || self.aliases.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Canonical keys, in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.entries.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.values()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&Key, &Value)> {
        self.entries.iter()
    }

    fn all_keys(&self) -> HashSet<&Key> {
        self.entries.keys().chain(self.aliases.keys()).collect()
    }
}

impl PartialEq for Dict {
    fn eq(&self, other: &Self) -> bool {
        if self.entries.len() != other.entries.len() {
            return false;
        }
        if self.all_keys() != other.all_keys() {
            return false;
        }
        self.entries
            .iter()
            .all(|(k, v)| other.get(k).is_some_and(|ov| ov == v))
    }
}

/// Positional and/or named argument pack, produced only by the spread
/// operator `*` — not otherwise a first-class value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Tuple {
    pub positional: Vec<Value>,
    pub named: IndexMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Number(f64),
    Bool(bool),
    /// The "empty" sentinel — default for unresolved reads, never
    /// user-producible from Rill source.
    Null,
    List(Vec<Value>),
    Dict(Dict),
    Closure(Closure),
    Tuple(Tuple),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::Number(_) => "number",
            Value::Bool(_) => "bool",
            Value::Null => "null",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Closure(_) => "closure",
            Value::Tuple(_) => "tuple",
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<&Closure> {
        match self {
            Value::Closure(c) => Some(c),
            _ => None,
        }
    }

    /// Is this shaped like an iterator — `{done, value?, next}`?
    pub fn iterator_shape(&self) -> Option<(&Dict, bool, Option<&Value>, &Closure)> {
        let dict = self.as_dict()?;
        let done = dict.get(&Key::Str("done".into()))?.as_bool()?;
        let value = dict.get(&Key::Str("value".into()));
        if !done && value.is_none() {
            return None;
        }
        let next = dict.get(&Key::Str("next".into()))?.as_closure()?;
        Some((dict, done, value, next))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{s}"),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{n}")
                }
            }
            Value::Bool(b) => write!(f, "{b}"),
            Value::Null => write!(f, "null"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::Dict(d) => {
                write!(f, "{{")?;
                for (i, (k, v)) in d.entries().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {v}", k.to_value())?;
                }
                write!(f, "}}")
            }
            Value::Closure(Closure::Script(s)) => {
                write!(f, "<closure {}/{}>", s.name.as_deref().unwrap_or("anon"), s.params.len())
            }
            Value::Closure(Closure::Application(a)) => write!(f, "<native {}>", a.name),
            Value::Tuple(t) => {
                write!(f, "(")?;
                let mut first = true;
                for v in &t.positional {
                    if !first {
                        write!(f, ", ")?;
                    }
                    first = false;
                    write!(f, "{v}")?;
                }
                for (k, v) in &t.named {
                    if !first {
                        write!(f, ", ")?;
                    }
                    first = false;
                    write!(f, "{k}: {v}")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_display_drops_trailing_zero() {
        assert_eq!(format!("{}", Value::Number(42.0)), "42");
        assert_eq!(format!("{}", Value::Number(2.5)), "2.5");
    }

    #[test]
    fn list_equality_is_order_sensitive() {
        let a = Value::List(vec![Value::Number(1.0), Value::Number(2.0)]);
        let b = Value::List(vec![Value::Number(2.0), Value::Number(1.0)]);
        assert_ne!(a, b);
    }

    #[test]
    fn dict_equality_is_order_independent() {
        let mut a = Dict::new();
        a.insert(Key::Str("a".into()), Value::Number(1.0));
        a.insert(Key::Str("b".into()), Value::Number(2.0));
        let mut b = Dict::new();
        b.insert(Key::Str("b".into()), Value::Number(2.0));
        b.insert(Key::Str("a".into()), Value::Number(1.0));
        assert_eq!(Value::Dict(a), Value::Dict(b));
    }

    #[test]
    fn multi_key_entry_reachable_by_either_key() {
        let mut d = Dict::new();
        d.insert_multi(
            vec![Key::Str("a".into()), Key::Str("b".into())],
            Value::Number(1.0),
        );
        assert_eq!(d.get(&Key::Str("a".into())), Some(&Value::Number(1.0)));
        assert_eq!(d.get(&Key::Str("b".into())), Some(&Value::Number(1.0)));
        assert_eq!(d.len(), 1);
    }
}
