// ABOUTME: The incremental driver — `{ step(), done, index, total, context,
// getResult() }`. Wraps the same per-top-level-statement evaluation
// `eval::execute` uses, one statement at a time, so a host (e.g. a debugger
// or a REPL) can observe intermediate pipe values and captures.

use crate::ast::Script;
use crate::context::Context;
use crate::error::RillError;
use crate::eval::{eval_top_level_statement, ExecResult};
use crate::value::Value;
use indexmap::IndexMap;

/// One `step()`'s result: the statement's value, its capture (only present
/// when the statement ended in a bare `=> $name`), and cursor position.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub value: Value,
    pub captured: Option<(String, Value)>,
    pub index: usize,
    pub total: usize,
    pub done: bool,
}

pub struct Stepper {
    script: Script,
    ctx: Context,
    index: usize,
    last_value: Value,
}

impl Stepper {
    pub fn new(script: Script, ctx: Context) -> Stepper {
        let last_value = ctx.pipe_value.borrow().clone().unwrap_or(Value::Null);
        Stepper {
            script,
            ctx,
            index: 0,
            last_value,
        }
    }

    pub fn total(&self) -> usize {
        self.script.statements.len()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn done(&self) -> bool {
        self.index >= self.total()
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Runs the next top-level statement, or returns a finished
    /// `StepResult` carrying the last value if the script is exhausted.
    pub async fn step(&mut self) -> Result<StepResult, RillError> {
        if self.done() {
            return Ok(StepResult {
                value: self.last_value.clone(),
                captured: None,
                index: self.index,
                total: self.total(),
                done: true,
            });
        }

        let stmt = &self.script.statements[self.index];
        *self.ctx.pipe_value.borrow_mut() = self.ctx.initial_pipe_value();
        let (flow, captured) = eval_top_level_statement(&self.ctx, stmt).await?;
        let value = flow_value(flow);
        self.last_value = value.clone();
        self.index += 1;

        Ok(StepResult {
            value,
            captured,
            index: self.index,
            total: self.total(),
            done: self.done(),
        })
    }

    /// The current value plus every top-level captured variable, regardless
    /// of how far `step()` has progressed.
    pub fn get_result(&self) -> ExecResult {
        ExecResult {
            value: self.last_value.clone(),
            variables: self.ctx.variables.visible_bindings(),
        }
    }
}

fn flow_value(flow: crate::eval::ControlFlow) -> Value {
    match flow {
        crate::eval::ControlFlow::Value(v)
        | crate::eval::ControlFlow::Break(v)
        | crate::eval::ControlFlow::Return(v) => v,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RillOptions;
    use crate::parser::Parser;

    fn stepper(src: &str) -> Stepper {
        let script = Parser::parse(src).expect("parse");
        let ctx = Context::create(RillOptions::default()).expect("context");
        Stepper::new(script, ctx)
    }

    #[test]
    fn steps_through_statements_in_order() {
        let mut s = stepper("1\n2\n3");
        let r1 = futures::executor::block_on(s.step()).unwrap();
        assert_eq!(r1.value, Value::Number(1.0));
        assert!(!r1.done);
        let r2 = futures::executor::block_on(s.step()).unwrap();
        assert_eq!(r2.value, Value::Number(2.0));
        let r3 = futures::executor::block_on(s.step()).unwrap();
        assert_eq!(r3.value, Value::Number(3.0));
        assert!(r3.done);
    }

    #[test]
    fn capture_reported_on_capturing_statement() {
        let mut s = stepper("\"a\" => $x\n$x");
        let r1 = futures::executor::block_on(s.step()).unwrap();
        assert_eq!(r1.captured, Some(("x".to_string(), Value::String("a".to_string()))));
        let _ = futures::executor::block_on(s.step()).unwrap();
    }

    #[test]
    fn get_result_reflects_final_state_after_exhaustion() {
        let mut s = stepper("\"a\" => $x\n\"b\"");
        while !s.done() {
            futures::executor::block_on(s.step()).unwrap();
        }
        let result = s.get_result();
        assert_eq!(result.value, Value::String("b".to_string()));
        assert_eq!(result.variables.get("x"), Some(&Value::String("a".to_string())));
    }
}
