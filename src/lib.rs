// ABOUTME: Public API surface for the Rill scripting language core: `parse`,
// `execute`, `create_context`, `create_stepper`. A thin façade over
// `parser`/`context`/`eval` fronting the pipe-oriented evaluator.

pub mod ast;
pub mod context;
pub mod error;
pub mod eval;
pub mod functions;
pub mod lexer;
pub mod methods;
pub mod parser;
pub mod scope;
pub mod stepper;
pub mod value;

pub use ast::Script;
pub use context::{Context, RillOptions};
pub use error::RillError;
pub use eval::ExecResult;
pub use stepper::{Stepper, StepResult};
pub use value::Value;

/// Parses `source` into a `Script`, erroring on the first unrecoverable
/// syntax problem. Use `parse_recovering` to collect every parse error
/// and still get a best-effort `Script` back.
pub fn parse(source: &str) -> Result<Script, RillError> {
    parser::Parser::parse(source)
}

/// Recovery-mode parse: always returns a `Script` (recovery nodes standing
/// in for unparseable statements) alongside every error collected along
/// the way.
pub fn parse_recovering(source: &str) -> (Result<Script, RillError>, Vec<RillError>) {
    parser::Parser::parse_recovering(source)
}

/// Builds a runtime `Context` from host-supplied options.
pub fn create_context(options: RillOptions) -> Result<Context, RillError> {
    Context::create(options)
}

/// Runs `script` against `ctx` to completion.
pub async fn execute(script: &Script, ctx: &Context) -> Result<ExecResult, RillError> {
    eval::execute(script, ctx).await
}

/// Builds a `Stepper` for driving `script` one top-level statement at a time.
pub fn create_stepper(script: Script, ctx: Context) -> Stepper {
    Stepper::new(script, ctx)
}

/// Convenience: parse and execute `source` in one call, for callers that
/// don't need the intermediate `Script` (e.g. the demo REPL).
pub async fn run(source: &str, ctx: &Context) -> Result<ExecResult, RillError> {
    let script = parse(source)?;
    execute(&script, ctx).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_execute_round_trip() {
        let script = parse("1 + 2").expect("parse");
        let ctx = create_context(RillOptions::default()).expect("context");
        let result = futures::executor::block_on(execute(&script, &ctx)).expect("execute");
        assert_eq!(result.value, Value::Number(3.0));
    }

    #[test]
    fn run_is_parse_then_execute() {
        let ctx = create_context(RillOptions::default()).expect("context");
        let result = futures::executor::block_on(run("\"hi\" -> .upper()", &ctx)).expect("run");
        assert_eq!(result.value, Value::String("HI".to_string()));
    }
}
