// ABOUTME: Structured error types for the lexer, parser, and evaluator.
// Every error carries a stable `RILL-X###` id, a location, and (for runtime
// errors propagating through calls) a call stack snapshot, per the core's
// public error-shape contract.

use crate::value::Value;
use indexmap::IndexMap;
use std::fmt;
use thiserror::Error;

/// 1-based line/column, 0-based byte offset into the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Location {
    pub line: usize,
    pub column: usize,
    pub offset: usize,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A single entry in the call stack attached to a propagating runtime error.
#[derive(Debug, Clone, PartialEq)]
pub struct CallFrame {
    pub location: Location,
    pub function_name: Option<String>,
    pub context_label: Option<String>,
}

/// Arbitrary structured context attached to an error, e.g. `{function, argument}`.
pub type ErrorContext = IndexMap<String, Value>;

/// The single error type surfaced across the lexer/parser/evaluator boundary.
///
/// `error_id` is one of `RILL-L###` (lexer), `RILL-P###` (parser), or
/// `RILL-R###` (runtime). `message` never carries a trailing location
/// suffix — `location` is the structured field for that.
#[derive(Debug, Clone, Error)]
#[error("{error_id}: {message}")]
pub struct RillError {
    pub error_id: &'static str,
    pub message: String,
    pub location: Option<Location>,
    pub context: Option<ErrorContext>,
    pub call_stack: Vec<CallFrame>,
    /// Set when a host function throws with a message matching one of
    /// `RillOptions::auto_exceptions`, marking the runtime error as
    /// expected rather than unexpected.
    pub expected: bool,
}

impl RillError {
    pub fn new(error_id: &'static str, message: impl Into<String>) -> Self {
        RillError {
            error_id,
            message: message.into(),
            location: None,
            context: None,
            call_stack: Vec::new(),
            expected: false,
        }
    }

    pub fn at(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_expected(mut self, expected: bool) -> Self {
        self.expected = expected;
        self
    }

    pub fn with_context(mut self, key: &str, value: Value) -> Self {
        self.context
            .get_or_insert_with(IndexMap::new)
            .insert(key.to_string(), value);
        self
    }

    pub fn with_call_stack(mut self, call_stack: Vec<CallFrame>) -> Self {
        self.call_stack = call_stack;
        self
    }

    // ===== Lexer errors (RILL-L###) =====

    pub fn unterminated_string(location: Location) -> Self {
        Self::new("RILL-L001", "Unterminated string literal").at(location)
    }

    pub fn unexpected_char(ch: char, location: Location) -> Self {
        Self::new("RILL-L002", format!("Unexpected character '{ch}'")).at(location)
    }

    pub fn removed_heredoc(location: Location) -> Self {
        Self::new(
            "RILL-L003",
            "heredoc syntax removed - use triple-quote strings instead",
        )
        .at(location)
    }

    // ===== Parser errors (RILL-P###) =====

    pub fn expected(what: &str, location: Location) -> Self {
        Self::new("RILL-P001", format!("Expected {what}")).at(location)
    }

    pub fn invalid_dict_key(location: Location) -> Self {
        Self::new(
            "RILL-P002",
            "Dict entry key must be identifier or list, not dict",
        )
        .at(location)
    }

    pub fn closure_key_invalid(location: Location) -> Self {
        Self::new("RILL-P003", "Dict entry key must not be a closure").at(location)
    }

    pub fn negation_needs_operand(location: Location) -> Self {
        Self::new(
            "RILL-P004",
            "Negation operator requires an operand - use prefix syntax",
        )
        .at(location)
    }

    pub fn existence_default_conflict(location: Location) -> Self {
        Self::new(
            "RILL-P005",
            "Cannot combine existence check with default-value operator",
        )
        .at(location)
    }

    pub fn pipe_break_across_newline(location: Location) -> Self {
        Self::new("RILL-P006", "Pipe chains cannot break across a newline").at(location)
    }

    pub fn method_call_not_a_pipe_stage(location: Location) -> Self {
        Self::new(
            "RILL-P007",
            "Method call must be a pipe stage - write `-> .name(...)`",
        )
        .at(location)
    }

    pub fn spread_needs_expr(location: Location) -> Self {
        Self::new("RILL-P008", "Expected expression after `...`").at(location)
    }

    // ===== Runtime errors (RILL-R###) =====

    pub fn type_mismatch(op: &str, expected: &str, actual: &str, location: Location) -> Self {
        Self::new(
            "RILL-R001",
            format!("{op}: expected {expected}, got {actual}"),
        )
        .at(location)
    }

    pub fn param_type_mismatch(
        function: &str,
        param: &str,
        expected: &str,
        actual: &str,
        location: Location,
    ) -> Self {
        Self::new(
            "RILL-R002",
            format!("{function}: parameter `{param}` expected {expected}, got {actual}"),
        )
        .at(location)
    }

    pub fn arity_mismatch(what: &str, expected: usize, actual: usize, location: Location) -> Self {
        Self::new(
            "RILL-R003",
            format!("{what}: expected {expected} argument(s), got {actual}"),
        )
        .at(location)
    }

    pub fn division_by_zero(location: Location) -> Self {
        Self::new("RILL-R004", "division by zero").at(location)
    }

    pub fn invalid_slice(message: impl Into<String>, location: Location) -> Self {
        Self::new("RILL-R005", message.into()).at(location)
    }

    pub fn iterator_shape(location: Location) -> Self {
        Self::new(
            "RILL-R006",
            "iterator must be a dict shaped {done, value?, next}",
        )
        .at(location)
    }

    pub fn dispatch_miss(location: Location) -> Self {
        Self::new("RILL-R007", "not found").at(location)
    }

    pub fn negation_non_boolean(actual: &str, location: Location) -> Self {
        Self::new(
            "RILL-R008",
            format!("requires boolean operand, got {actual}"),
        )
        .at(location)
    }

    pub fn arithmetic_non_number(actual: &str, location: Location) -> Self {
        Self::new(
            "RILL-R009",
            format!("arithmetic requires number operands, got {actual}"),
        )
        .at(location)
    }

    pub fn comparison_cross_kind(a: &str, b: &str, location: Location) -> Self {
        Self::new(
            "RILL-R010",
            format!("cannot compare {a} with {b}"),
        )
        .at(location)
    }

    pub fn undefined_variable(name: &str, location: Location) -> Self {
        Self::new("RILL-R011", format!("undefined variable: {name}")).at(location)
    }

    pub fn missing_field(name: &str, location: Location) -> Self {
        Self::new("RILL-R012", format!("missing dict field: {name}")).at(location)
    }

    pub fn abort(location: Location) -> Self {
        Self::new("RILL-R013", "execution aborted").at(location)
    }

    pub fn unknown_method(name: &str, type_name: &str, location: Location) -> Self {
        Self::new(
            "RILL-R014",
            format!("unknown method `.{name}` for type {type_name}"),
        )
        .at(location)
    }

    pub fn unknown_function(name: &str, location: Location) -> Self {
        Self::new("RILL-R015", format!("unknown function: {name}")).at(location)
    }

    pub fn command_timeout(location: Location) -> Self {
        Self::new("RILL-R016", "execution timed out").at(location)
    }

    pub fn output_too_large(location: Location) -> Self {
        Self::new("RILL-R017", "host output exceeded the configured limit").at(location)
    }

    pub fn assertion_failed(message: Option<&str>, location: Location) -> Self {
        let msg = match message {
            Some(m) => format!("assertion failed: {m}"),
            None => "assertion failed".to_string(),
        };
        Self::new("RILL-R018", msg).at(location)
    }

    pub fn error_statement(message: String, location: Location) -> Self {
        Self::new("RILL-R019", message).at(location)
    }

    pub fn recovery_node_evaluated(location: Location) -> Self {
        Self::new(
            "RILL-R020",
            "cannot evaluate a parse-recovery placeholder node",
        )
        .at(location)
    }

    pub fn pipe_value_undefined(location: Location) -> Self {
        Self::new(
            "RILL-R022",
            "`$` is not defined at the top level without a bound value",
        )
        .at(location)
    }

    pub fn not_callable(actual: &str, location: Location) -> Self {
        Self::new("RILL-R023", format!("value of type {actual} is not callable")).at(location)
    }

    pub fn is_abort(&self) -> bool {
        self.error_id == "RILL-R013"
    }
}
