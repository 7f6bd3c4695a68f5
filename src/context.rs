// ABOUTME: The runtime context: variable scope root, host function/method
// tables, callbacks, cancellation, and the bounded call stack. A plain
// options struct with a `Default` impl feeds `create_context`, which builds
// this once per embedding.

use crate::ast::TypeName;
use crate::error::{CallFrame, Location, RillError};
use crate::scope::Scope;
use crate::value::{HostFn, Value};
use indexmap::IndexMap;
use regex::Regex;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
}

/// Host-provided observability hooks: `{ onLog, onLogEvent?, onOutput? }`.
#[derive(Default)]
pub struct Callbacks {
    pub on_log: Option<Box<dyn Fn(LogLevel, &str)>>,
    pub on_log_event: Option<Box<dyn Fn(&LogEvent)>>,
    pub on_output: Option<Box<dyn Fn(&Value)>>,
}

/// Cooperative cancellation source. The default implementation is a plain
/// flag the host flips; hosts may supply any other implementation (e.g.
/// one backed by a platform signal).
pub trait AbortSignal {
    fn is_aborted(&self) -> bool;
}

#[derive(Debug, Default)]
pub struct FlagAbortSignal(std::cell::Cell<bool>);

impl FlagAbortSignal {
    pub fn new() -> Self {
        FlagAbortSignal::default()
    }

    pub fn trigger(&self) {
        self.0.set(true);
    }
}

impl AbortSignal for FlagAbortSignal {
    fn is_aborted(&self) -> bool {
        self.0.get()
    }
}

#[derive(Clone)]
pub struct HostParam {
    pub name: String,
    pub ty: Option<TypeName>,
    pub default: Option<Value>,
    pub description: Option<String>,
}

pub struct HostFunctionSpec {
    pub params: Vec<HostParam>,
    pub return_ty: Option<TypeName>,
    pub description: Option<String>,
    pub func: Rc<dyn HostFn>,
}

/// Everything an embedding host passes to `create_context`.
#[derive(Default)]
pub struct RillOptions {
    pub variables: Vec<(String, Value)>,
    pub functions: Vec<(String, HostFunctionSpec)>,
    pub methods: Vec<(String, HostFunctionSpec)>,
    pub callbacks: Callbacks,
    pub timeout: Option<Duration>,
    pub abort_signal: Option<Rc<dyn AbortSignal>>,
    pub auto_exceptions: Vec<String>,
    pub max_call_stack_depth: Option<usize>,
    pub require_descriptions: bool,
    /// The value `$` holds before any pipe chain runs, e.g. for REPL-style
    /// incremental execution. Defaults to no pipe value bound.
    pub initial_pipe_value: Option<Value>,
}

struct ContextInner {
    functions: IndexMap<String, Rc<HostFunctionSpec>>,
    methods: IndexMap<String, Rc<HostFunctionSpec>>,
    callbacks: Rc<Callbacks>,
    abort_signal: Rc<dyn AbortSignal>,
    auto_exceptions: Vec<Regex>,
    max_call_stack_depth: usize,
    require_descriptions: bool,
    started_at: Instant,
    timeout: Option<Duration>,
    call_stack: RefCell<VecDeque<CallFrame>>,
    /// The host-configured initial pipe value, re-applied as `$` at the
    /// start of every top-level statement.
    initial_pipe_value: Option<Value>,
}

/// A runtime context. Cloning is cheap (an `Rc` bump) and shares the
/// function/method/callback tables with the context it was cloned or
/// `child`-ed from — child contexts inherit function/method tables and
/// callbacks by reference; only `variables` and the pipe value are new.
#[derive(Clone)]
pub struct Context {
    inner: Rc<ContextInner>,
    pub variables: Scope,
    pub pipe_value: RefCell<Option<Value>>,
}

impl Context {
    pub fn create(options: RillOptions) -> Result<Context, RillError> {
        let mut functions = IndexMap::new();
        for (name, spec) in crate::functions::builtin_functions() {
            functions.insert(name, Rc::new(spec));
        }
        for (name, spec) in options.functions {
            if options.require_descriptions {
                require_described(&name, &spec)?;
            }
            validate_defaults(&name, &spec)?;
            functions.insert(name, Rc::new(spec));
        }

        let mut methods = IndexMap::new();
        for (name, spec) in crate::methods::builtin_methods() {
            methods.insert(name, Rc::new(spec));
        }
        for (name, spec) in options.methods {
            if options.require_descriptions {
                require_described(&name, &spec)?;
            }
            validate_defaults(&name, &spec)?;
            methods.insert(name, Rc::new(spec));
        }

        let mut auto_exceptions = Vec::new();
        for pattern in &options.auto_exceptions {
            let re = Regex::new(pattern).map_err(|e| {
                RillError::new(
                    "RILL-R003",
                    format!("invalid autoException pattern `{pattern}`: {e}"),
                )
            })?;
            auto_exceptions.push(re);
        }

        let variables = Scope::root();
        for (name, value) in options.variables {
            variables.capture(&name, value);
        }

        let abort_signal: Rc<dyn AbortSignal> = options
            .abort_signal
            .unwrap_or_else(|| Rc::new(FlagAbortSignal::new()));

        let inner = ContextInner {
            functions,
            methods,
            callbacks: Rc::new(options.callbacks),
            abort_signal,
            auto_exceptions,
            max_call_stack_depth: options.max_call_stack_depth.unwrap_or(100),
            require_descriptions: options.require_descriptions,
            started_at: Instant::now(),
            timeout: options.timeout,
            call_stack: RefCell::new(VecDeque::new()),
            initial_pipe_value: options.initial_pipe_value.clone(),
        };

        Ok(Context {
            inner: Rc::new(inner),
            variables,
            pipe_value: RefCell::new(options.initial_pipe_value),
        })
    }

    /// A child context for nested script evaluation (e.g. a host re-running
    /// a sub-script): shares tables/callbacks, gets a fresh variable frame.
    pub fn child(&self) -> Context {
        Context {
            inner: self.inner.clone(),
            variables: Scope::root(),
            pipe_value: RefCell::new(None),
        }
    }

    /// A new lexical frame for a block or loop body: shares tables, keeps
    /// `$`, gets an isolated child `Scope` so captures don't leak outward.
    pub fn with_child_scope(&self) -> Context {
        Context {
            inner: self.inner.clone(),
            variables: self.variables.child(),
            pipe_value: RefCell::new(self.pipe_value.borrow().clone()),
        }
    }

    /// A call frame for a script closure invocation: shares tables, gets the
    /// closure's captured scope (extended with bound parameters) and the
    /// given `$` (closures start with no ambient pipe value unless passed
    /// one explicitly).
    pub fn with_scope_and_pipe(&self, scope: Scope, pipe_value: Option<Value>) -> Context {
        Context {
            inner: self.inner.clone(),
            variables: scope,
            pipe_value: RefCell::new(pipe_value),
        }
    }

    pub fn function(&self, name: &str) -> Option<Rc<HostFunctionSpec>> {
        self.inner.functions.get(name).cloned()
    }

    pub fn method(&self, name: &str) -> Option<Rc<HostFunctionSpec>> {
        self.inner.methods.get(name).cloned()
    }

    pub fn callbacks(&self) -> &Callbacks {
        &self.inner.callbacks
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        if let Some(cb) = &self.inner.callbacks.on_log {
            cb(level, message);
        }
        if let Some(cb) = &self.inner.callbacks.on_log_event {
            cb(&LogEvent {
                level,
                message: message.to_string(),
            });
        }
        match level {
            LogLevel::Debug => tracing::debug!(target: "rill::script", "{message}"),
            LogLevel::Info => tracing::info!(target: "rill::script", "{message}"),
            LogLevel::Warn => tracing::warn!(target: "rill::script", "{message}"),
            LogLevel::Error => tracing::error!(target: "rill::script", "{message}"),
        }
    }

    pub fn emit_output(&self, value: &Value) {
        if let Some(cb) = &self.inner.callbacks.on_output {
            cb(value);
        }
    }

    /// Does `message` match one of the host's `autoExceptions` patterns —
    /// marking the resulting runtime error as "expected"?
    pub fn is_auto_exception(&self, message: &str) -> bool {
        self.inner.auto_exceptions.iter().any(|re| re.is_match(message))
    }

    pub fn require_descriptions(&self) -> bool {
        self.inner.require_descriptions
    }

    /// Cancellation checkpoint: call before every top-level step, host
    /// call, and loop iteration.
    pub fn check_cancel(&self, location: Location) -> Result<(), RillError> {
        if self.inner.abort_signal.is_aborted() {
            return Err(RillError::abort(location));
        }
        if let Some(timeout) = self.inner.timeout {
            if self.inner.started_at.elapsed() > timeout {
                return Err(RillError::command_timeout(location));
            }
        }
        Ok(())
    }

    /// Push a call frame, dropping the oldest if past `maxCallStackDepth`.
    pub fn push_frame(&self, frame: CallFrame) {
        let mut stack = self.inner.call_stack.borrow_mut();
        stack.push_back(frame);
        while stack.len() > self.inner.max_call_stack_depth {
            stack.pop_front();
        }
    }

    pub fn pop_frame(&self) {
        self.inner.call_stack.borrow_mut().pop_back();
    }

    pub fn call_stack_snapshot(&self) -> Vec<CallFrame> {
        self.inner.call_stack.borrow().iter().cloned().collect()
    }

    /// The host-configured initial pipe value — what `$` is reset to at the
    /// start of every top-level statement.
    pub fn initial_pipe_value(&self) -> Option<Value> {
        self.inner.initial_pipe_value.clone()
    }

    pub fn attach_call_stack(&self, err: RillError) -> RillError {
        let err = err.with_call_stack(self.call_stack_snapshot());
        if self.is_auto_exception(&err.message) {
            err.with_expected(true)
        } else {
            err
        }
    }
}

fn require_described(name: &str, spec: &HostFunctionSpec) -> Result<(), RillError> {
    if spec
        .description
        .as_deref()
        .map(|d| d.trim().is_empty())
        .unwrap_or(true)
    {
        return Err(RillError::new(
            "RILL-R002",
            format!("function `{name}` is missing a required description"),
        ));
    }
    for p in &spec.params {
        if p.description.as_deref().map(|d| d.trim().is_empty()).unwrap_or(true) {
            return Err(RillError::new(
                "RILL-R002",
                format!("function `{name}` parameter `{}` is missing a required description", p.name),
            ));
        }
    }
    Ok(())
}

fn validate_defaults(name: &str, spec: &HostFunctionSpec) -> Result<(), RillError> {
    for p in &spec.params {
        if let (Some(ty), Some(default)) = (p.ty, &p.default) {
            if !type_matches(ty, default) {
                return Err(RillError::param_type_mismatch(
                    name,
                    &p.name,
                    ty.as_str(),
                    default.type_name(),
                    Location::default(),
                ));
            }
        }
    }
    Ok(())
}

pub fn type_matches(ty: TypeName, value: &Value) -> bool {
    match ty {
        TypeName::String => matches!(value, Value::String(_)),
        TypeName::Number => matches!(value, Value::Number(_)),
        TypeName::Bool => matches!(value, Value::Bool(_)),
        TypeName::Closure => matches!(value, Value::Closure(_)),
        TypeName::List => matches!(value, Value::List(_)),
        TypeName::Dict => matches!(value, Value::Dict(_)),
        TypeName::Tuple => matches!(value, Value::Tuple(_)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_stack_bound_drops_oldest_frame() {
        let ctx = Context::create(RillOptions {
            max_call_stack_depth: Some(2),
            ..Default::default()
        })
        .expect("context");
        for i in 0..5 {
            ctx.push_frame(CallFrame {
                location: Location::default(),
                function_name: Some(format!("frame{i}")),
                context_label: None,
            });
        }
        let snapshot = ctx.call_stack_snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].function_name.as_deref(), Some("frame3"));
        assert_eq!(snapshot[1].function_name.as_deref(), Some("frame4"));
    }

    #[test]
    fn auto_exception_pattern_marks_error_expected() {
        let ctx = Context::create(RillOptions {
            auto_exceptions: vec!["^not found$".to_string()],
            ..Default::default()
        })
        .expect("context");
        let err = ctx.attach_call_stack(RillError::new("RILL-R007", "not found"));
        assert!(err.expected);
        let other = ctx.attach_call_stack(RillError::new("RILL-R011", "undefined variable: x"));
        assert!(!other.expected);
    }

    #[test]
    fn check_cancel_reports_abort_after_trigger() {
        let signal = Rc::new(FlagAbortSignal::new());
        let ctx = Context::create(RillOptions {
            abort_signal: Some(signal.clone()),
            ..Default::default()
        })
        .expect("context");
        assert!(ctx.check_cancel(Location::default()).is_ok());
        signal.trigger();
        let err = ctx.check_cancel(Location::default()).unwrap_err();
        assert!(err.is_abort());
    }
}
