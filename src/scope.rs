// ABOUTME: Lexical scope chain — parent-chained, `Rc`-shared frames over an
// insertion-ordered map. Captures always write the *innermost* frame; Rill
// has no mutation of an ancestor frame.

use crate::value::Value;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug)]
struct ScopeInner {
    bindings: RefCell<IndexMap<String, Value>>,
    parent: Option<Scope>,
}

/// A single lexical frame, reference-counted so closures can capture it
/// cheaply and child blocks can share read access to ancestors.
#[derive(Debug, Clone)]
pub struct Scope(Rc<ScopeInner>);

impl Scope {
    pub fn root() -> Scope {
        Scope(Rc::new(ScopeInner {
            bindings: RefCell::new(IndexMap::new()),
            parent: None,
        }))
    }

    /// A new, isolated child frame — used for blocks, loop bodies, and
    /// function calls. Captures made inside never leak to `self`.
    pub fn child(&self) -> Scope {
        Scope(Rc::new(ScopeInner {
            bindings: RefCell::new(IndexMap::new()),
            parent: Some(self.clone()),
        }))
    }

    /// The capture operator `=>`/`:>`: always writes the innermost frame.
    pub fn capture(&self, name: &str, value: Value) {
        self.0.bindings.borrow_mut().insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.0.bindings.borrow().get(name) {
            return Some(v.clone());
        }
        self.0.parent.as_ref().and_then(|p| p.get(name))
    }

    pub fn is_defined_here(&self, name: &str) -> bool {
        self.0.bindings.borrow().contains_key(name)
    }

    /// Snapshot of every binding visible from this frame, innermost wins,
    /// used by the stepper's top-level captured-variable map.
    pub fn visible_bindings(&self) -> IndexMap<String, Value> {
        let mut out = IndexMap::new();
        let mut frames = Vec::new();
        let mut cur = Some(self.clone());
        while let Some(s) = cur {
            frames.push(s.clone());
            cur = s.0.parent.clone();
        }
        for frame in frames.into_iter().rev() {
            for (k, v) in frame.0.bindings.borrow().iter() {
                out.insert(k.clone(), v.clone());
            }
        }
        out
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_sees_parent_bindings() {
        let parent = Scope::root();
        parent.capture("x", Value::Number(42.0));
        let child = parent.child();
        assert_eq!(child.get("x"), Some(Value::Number(42.0)));
    }

    #[test]
    fn child_capture_does_not_leak_to_parent() {
        let parent = Scope::root();
        let child = parent.child();
        child.capture("y", Value::Number(1.0));
        assert_eq!(parent.get("y"), None);
        assert_eq!(child.get("y"), Some(Value::Number(1.0)));
    }

    #[test]
    fn shadowing_prefers_innermost() {
        let parent = Scope::root();
        parent.capture("x", Value::Number(1.0));
        let child = parent.child();
        child.capture("x", Value::Number(2.0));
        assert_eq!(child.get("x"), Some(Value::Number(2.0)));
        assert_eq!(parent.get("x"), Some(Value::Number(1.0)));
    }
}
