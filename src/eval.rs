// ABOUTME: Tree-walking evaluator. Threads the pipe value `$` through pipe
// chains, expression operators, blocks, and loops. Written `async` (via
// `#[async_recursion(?Send)]`) so a host function returning a future
// suspends the walk at a single point and resumes with its value.

use crate::ast::*;
use crate::context::Context;
use crate::error::{Location, RillError};
use crate::lexer::Span;
use crate::scope::Scope;
use crate::value::{ApplicationClosure, Closure, Dict, HostFn, Key, ScriptClosure, Tuple, Value};
use async_recursion::async_recursion;
use indexmap::IndexMap;
use std::rc::Rc;

/// The result of walking one expression: a plain value, or an in-flight
/// terminator unwinding to its handler — an algebraic stand-in for
/// thrown exceptions.
#[derive(Debug, Clone)]
pub enum ControlFlow {
    Value(Value),
    Break(Value),
    Return(Value),
}

impl ControlFlow {
    fn into_value(self) -> Value {
        match self {
            ControlFlow::Value(v) | ControlFlow::Break(v) | ControlFlow::Return(v) => v,
        }
    }

    fn is_terminator(&self) -> bool {
        !matches!(self, ControlFlow::Value(_))
    }
}

pub struct ExecResult {
    pub value: Value,
    pub variables: IndexMap<String, Value>,
}

/// Runs `script` to completion, returning the final value plus the
/// top-level bindings captured along the way.
pub async fn execute(script: &Script, ctx: &Context) -> Result<ExecResult, RillError> {
    let mut last_value = ctx.pipe_value.borrow().clone().unwrap_or(Value::Null);
    for stmt in &script.statements {
        *ctx.pipe_value.borrow_mut() = ctx.initial_pipe_value();
        let (flow, _captured) = eval_top_level_statement(ctx, stmt).await?;
        last_value = flow.into_value();
    }
    Ok(ExecResult {
        value: last_value,
        variables: ctx.variables.visible_bindings(),
    })
}

/// Evaluates one top-level statement, returning its value and — when the
/// statement was a bare capture `X => $name` — the captured pair, for the
/// stepper's `{ value, captured? }` step result.
pub(crate) async fn eval_top_level_statement(
    ctx: &Context,
    stmt: &Statement,
) -> Result<(ControlFlow, Option<(String, Value)>), RillError> {
    ctx.check_cancel(stmt_location(stmt))?;
    let flow = eval_statement(ctx, stmt).await?;
    let captured = top_level_capture(stmt).map(|name| (name.to_string(), flow.clone().into_value()));
    Ok((flow, captured))
}

fn stmt_location(stmt: &Statement) -> Location {
    match stmt {
        Statement::Annotated(ann, inner) => {
            let _ = ann;
            stmt_location(inner)
        }
        Statement::Expr(e) => expr_location(e),
        Statement::Recovery(r) => r.span.start,
    }
}

fn expr_location(e: &Expr) -> Location {
    match e {
        Expr::Spanned { span, .. } => span.start,
        Expr::Pipe { head, .. } => expr_location(head),
        _ => Location::default(),
    }
}

fn top_level_capture(stmt: &Statement) -> Option<&str> {
    match stmt {
        Statement::Annotated(_, inner) => top_level_capture(inner),
        Statement::Expr(e) => pipe_last_capture(e),
        Statement::Recovery(_) => None,
    }
}

fn pipe_last_capture(e: &Expr) -> Option<&str> {
    let (inner, _) = e.unwrap_span();
    match inner {
        Expr::Pipe { pipes, .. } => match pipes.last()?.target {
            PipeTarget::InlineCapture(ref name) => Some(name),
            _ => None,
        },
        _ => None,
    }
}

#[async_recursion(?Send)]
async fn eval_statement(ctx: &Context, stmt: &Statement) -> Result<ControlFlow, RillError> {
    match stmt {
        Statement::Annotated(_ann, inner) => eval_statement(ctx, inner).await,
        Statement::Expr(e) => eval_expr(ctx, e).await,
        Statement::Recovery(r) => Err(RillError::recovery_node_evaluated(r.span.start)),
    }
}

#[async_recursion(?Send)]
async fn eval_block(ctx: &Context, stmts: &[Statement]) -> Result<ControlFlow, RillError> {
    let block_ctx = ctx.with_child_scope();
    let mut result = ControlFlow::Value(block_ctx.pipe_value.borrow().clone().unwrap_or(Value::Null));
    for stmt in stmts {
        let flow = eval_statement(&block_ctx, stmt).await?;
        match flow {
            ControlFlow::Return(v) => return Ok(ControlFlow::Value(v)),
            ControlFlow::Break(_) => return Ok(flow),
            ControlFlow::Value(v) => {
                *block_ctx.pipe_value.borrow_mut() = Some(v.clone());
                result = ControlFlow::Value(v);
            }
        }
    }
    Ok(result)
}

#[async_recursion(?Send)]
pub(crate) async fn eval_expr(ctx: &Context, expr: &Expr) -> Result<ControlFlow, RillError> {
    let (inner, span) = expr.unwrap_span();
    let loc = span.map(|s| s.start).unwrap_or_default();
    match inner {
        Expr::Number(n) => Ok(ControlFlow::Value(Value::Number(*n))),
        Expr::Bool(b) => Ok(ControlFlow::Value(Value::Bool(*b))),
        Expr::TripleStr(s) => Ok(ControlFlow::Value(Value::String(s.clone()))),
        Expr::Str(segments) => eval_template(ctx, segments).await,
        Expr::Var(name) => ctx
            .variables
            .get(name)
            .map(ControlFlow::Value)
            .ok_or_else(|| RillError::undefined_variable(name, loc)),
        Expr::PipeRef => ctx
            .pipe_value
            .borrow()
            .clone()
            .map(ControlFlow::Value)
            .ok_or_else(|| RillError::pipe_value_undefined(loc)),
        Expr::List(items) => eval_list_literal(ctx, items).await,
        Expr::Dict(entries) => eval_dict_literal(ctx, entries).await,
        Expr::HostCall { namespace, name, args } => {
            eval_host_call(ctx, namespace, name, args, span.unwrap_or_default()).await
        }
        Expr::Invoke { callee, args } => eval_invoke(ctx, callee, args, span.unwrap_or_default()).await,
        Expr::Closure(lit) => Ok(ControlFlow::Value(Value::Closure(Closure::Script(Rc::new(
            ScriptClosure::from_lit(lit, ctx.variables.clone(), None),
        ))))),
        Expr::Block(stmts) => eval_block(ctx, stmts).await,
        Expr::Conditional {
            cond,
            then_branch,
            else_branch,
        } => eval_conditional(ctx, cond, then_branch, else_branch.as_deref()).await,
        Expr::WhileLoop { cond, body } => eval_while(ctx, cond, body).await,
        Expr::DoWhileLoop { body, cond } => eval_do_while(ctx, body, cond).await,
        Expr::Group(inner) => eval_expr(ctx, inner).await,
        Expr::Destructure(patterns) => eval_destructure(ctx, patterns, loc).await,
        Expr::Slice { start, stop, step } => eval_slice(ctx, start.as_deref(), stop.as_deref(), step.as_deref(), loc).await,
        Expr::Spread(inner) => eval_expr(ctx, inner).await,
        Expr::Break(value) => {
            let v = eval_optional(ctx, value.as_deref()).await?;
            Ok(ControlFlow::Break(v))
        }
        Expr::Return(value) => {
            let v = eval_optional(ctx, value.as_deref()).await?;
            Ok(ControlFlow::Return(v))
        }
        Expr::Assert { cond, message } => eval_assert(ctx, cond, message.as_deref(), loc).await,
        Expr::ErrorStmt(message) => {
            let v = eval_expr(ctx, message).await?.into_value();
            Err(RillError::error_statement(v.to_string(), loc))
        }
        Expr::Pass => Ok(ControlFlow::Value(
            ctx.pipe_value.borrow().clone().unwrap_or(Value::Null),
        )),
        Expr::Unary { op, operand } => eval_unary(ctx, *op, operand, loc).await,
        Expr::Binary { op, lhs, rhs } => eval_binary(ctx, *op, lhs, rhs, loc).await,
        Expr::Access { base, op } => eval_access(ctx, base, op, loc).await,
        Expr::Pipe { head, pipes } => eval_pipe(ctx, head, pipes).await,
        Expr::Spanned { .. } => unreachable!("unwrap_span strips Spanned"),
    }
}

async fn eval_optional(ctx: &Context, expr: Option<&Expr>) -> Result<Value, RillError> {
    match expr {
        Some(e) => Ok(eval_expr(ctx, e).await?.into_value()),
        None => Ok(ctx.pipe_value.borrow().clone().unwrap_or(Value::Null)),
    }
}

async fn eval_template(ctx: &Context, segments: &[TemplateSegment]) -> Result<ControlFlow, RillError> {
    let mut out = String::new();
    for seg in segments {
        match seg {
            TemplateSegment::Literal(s) => out.push_str(s),
            TemplateSegment::Expr(e) => {
                let v = eval_expr(ctx, e).await?;
                if v.is_terminator() {
                    return Ok(v);
                }
                out.push_str(&v.into_value().to_string());
            }
        }
    }
    Ok(ControlFlow::Value(Value::String(out)))
}

async fn eval_list_literal(ctx: &Context, items: &[Expr]) -> Result<ControlFlow, RillError> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let (inner, span) = item.unwrap_span();
        if let Expr::Spread(spread_expr) = inner {
            let v = eval_expr(ctx, spread_expr).await?;
            if v.is_terminator() {
                return Ok(v);
            }
            spread_into_list(&mut out, v.into_value(), span.map(|s| s.start).unwrap_or_default())?;
        } else {
            let v = eval_expr(ctx, item).await?;
            if v.is_terminator() {
                return Ok(v);
            }
            out.push(v.into_value());
        }
    }
    Ok(ControlFlow::Value(Value::List(out)))
}

fn spread_into_list(out: &mut Vec<Value>, value: Value, loc: Location) -> Result<(), RillError> {
    match value {
        Value::List(items) => out.extend(items),
        Value::Tuple(t) => out.extend(t.positional),
        other => {
            return Err(RillError::type_mismatch(
                "spread",
                "list or tuple",
                other.type_name(),
                loc,
            ))
        }
    }
    Ok(())
}

async fn eval_dict_literal(ctx: &Context, entries: &[DictEntry]) -> Result<ControlFlow, RillError> {
    let mut dict = Dict::new();
    for entry in entries {
        let keys = dict_key_to_keys(&entry.key);
        let v = eval_expr(ctx, &entry.value).await?;
        if v.is_terminator() {
            return Ok(v);
        }
        dict.insert_multi(keys, v.into_value());
    }
    Ok(ControlFlow::Value(Value::Dict(dict)))
}

fn dict_key_to_keys(key: &DictKey) -> Vec<Key> {
    match key {
        DictKey::Ident(s) | DictKey::Str(s) => vec![Key::Str(s.clone())],
        DictKey::Number(n) => vec![Key::Num(n.to_bits())],
        DictKey::Bool(b) => vec![Key::Bool(*b)],
        DictKey::Multi(keys) => keys.iter().flat_map(dict_key_to_keys).collect(),
    }
}

fn dict_key_single(key: &DictKey) -> Key {
    dict_key_to_keys(key).into_iter().next().unwrap_or(Key::Bool(false))
}

// ===== pipe chains =====

#[async_recursion(?Send)]
async fn eval_pipe(ctx: &Context, head: &Expr, pipes: &[PipeStage]) -> Result<ControlFlow, RillError> {
    let mut flow = eval_expr(ctx, head).await?;
    if flow.is_terminator() {
        return Ok(flow);
    }
    *ctx.pipe_value.borrow_mut() = Some(flow.clone().into_value());

    for stage in pipes {
        ctx.check_cancel(stage.span.start)?;
        flow = eval_pipe_stage(ctx, &stage.target, stage.span).await?;
        if flow.is_terminator() {
            return Ok(flow);
        }
        *ctx.pipe_value.borrow_mut() = Some(flow.clone().into_value());
    }
    Ok(flow)
}

fn current_pipe_value(ctx: &Context) -> Value {
    ctx.pipe_value.borrow().clone().unwrap_or(Value::Null)
}

#[async_recursion(?Send)]
async fn eval_pipe_stage(ctx: &Context, target: &PipeTarget, span: Span) -> Result<ControlFlow, RillError> {
    let loc = span.start;
    match target {
        PipeTarget::Method { name, args } => eval_method_call(ctx, name, args, loc).await,
        PipeTarget::Call { namespace, name, args } => eval_host_call(ctx, namespace, name, args, span).await,
        PipeTarget::Invoke { callee, args } => eval_invoke(ctx, callee, args, span).await,
        PipeTarget::Block(stmts) => eval_block(ctx, stmts).await,
        PipeTarget::Conditional {
            cond,
            then_branch,
            else_branch,
        } => eval_conditional(ctx, cond, then_branch, else_branch.as_deref()).await,
        PipeTarget::WhileLoop { cond, body } => eval_while(ctx, cond, body).await,
        PipeTarget::DoWhileLoop { body, cond } => eval_do_while(ctx, body, cond).await,
        PipeTarget::InlineClosure(lit) => {
            let closure = Closure::Script(Rc::new(ScriptClosure::from_lit(
                lit,
                ctx.variables.clone(),
                None,
            )));
            call_closure(ctx, &closure, &[current_pipe_value(ctx)], loc).await
        }
        PipeTarget::StringTemplate(segments) => eval_template(ctx, segments).await,
        PipeTarget::InlineCapture(name) => {
            let v = current_pipe_value(ctx);
            ctx.variables.capture(name, v.clone());
            Ok(ControlFlow::Value(v))
        }
        PipeTarget::TypeAssert(ty) => {
            let v = current_pipe_value(ctx);
            if crate::context::type_matches(*ty, &v) {
                Ok(ControlFlow::Value(v))
            } else {
                Err(RillError::type_mismatch("type assertion", ty.as_str(), v.type_name(), loc))
            }
        }
        PipeTarget::TypeCheck(ty) => {
            let v = current_pipe_value(ctx);
            Ok(ControlFlow::Value(Value::Bool(crate::context::type_matches(*ty, &v))))
        }
        PipeTarget::DispatchTable { entries, default } => eval_dispatch_table(ctx, entries, default.as_deref(), loc).await,
        PipeTarget::Arith(expr) => eval_expr(ctx, expr).await,
    }
}

async fn eval_dispatch_table(
    ctx: &Context,
    entries: &[DictEntry],
    default: Option<&Expr>,
    loc: Location,
) -> Result<ControlFlow, RillError> {
    let pv = current_pipe_value(ctx);
    let Some(needle) = Key::from_value(&pv) else {
        return match default {
            Some(d) => eval_expr(ctx, d).await,
            None => Err(RillError::dispatch_miss(loc)),
        };
    };
    for entry in entries {
        let matches = match &entry.key {
            DictKey::Multi(keys) => keys.iter().any(|k| dict_key_single(k) == needle),
            other => dict_key_single(other) == needle,
        };
        if matches {
            let v = eval_expr(ctx, &entry.value).await?;
            if v.is_terminator() {
                return Ok(v);
            }
            let value = maybe_auto_invoke(ctx, v.into_value(), &[pv], loc).await?;
            return Ok(ControlFlow::Value(value));
        }
    }
    match default {
        Some(d) => eval_expr(ctx, d).await,
        None => Err(RillError::dispatch_miss(loc)),
    }
}

// ===== conditionals & loops =====

async fn eval_conditional(
    ctx: &Context,
    cond: &Expr,
    then_branch: &Expr,
    else_branch: Option<&Expr>,
) -> Result<ControlFlow, RillError> {
    let cond_flow = eval_expr(ctx, cond).await?;
    if cond_flow.is_terminator() {
        return Ok(cond_flow);
    }
    let cond_val = cond_flow.into_value();
    let b = cond_val
        .as_bool()
        .ok_or_else(|| RillError::type_mismatch("conditional", "bool", cond_val.type_name(), expr_location(cond)))?;
    if b {
        eval_expr(ctx, then_branch).await
    } else {
        match else_branch {
            Some(e) => eval_expr(ctx, e).await,
            None => Ok(ControlFlow::Value(current_pipe_value(ctx))),
        }
    }
}

async fn eval_while(ctx: &Context, cond: &Expr, body: &Expr) -> Result<ControlFlow, RillError> {
    loop {
        ctx.check_cancel(expr_location(cond))?;
        let cond_flow = eval_expr(ctx, cond).await?;
        if cond_flow.is_terminator() {
            return Ok(cond_flow);
        }
        let cond_val = cond_flow.into_value();
        let b = cond_val
            .as_bool()
            .ok_or_else(|| RillError::type_mismatch("while condition", "bool", cond_val.type_name(), expr_location(cond)))?;
        if !b {
            return Ok(ControlFlow::Value(current_pipe_value(ctx)));
        }
        let body_flow = eval_expr(ctx, body).await?;
        match body_flow {
            ControlFlow::Break(v) => return Ok(ControlFlow::Value(v)),
            ControlFlow::Return(v) => return Ok(ControlFlow::Return(v)),
            ControlFlow::Value(v) => *ctx.pipe_value.borrow_mut() = Some(v),
        }
    }
}

async fn eval_do_while(ctx: &Context, body: &Expr, cond: &Expr) -> Result<ControlFlow, RillError> {
    loop {
        ctx.check_cancel(expr_location(body))?;
        let body_flow = eval_expr(ctx, body).await?;
        match body_flow {
            ControlFlow::Break(v) => return Ok(ControlFlow::Value(v)),
            ControlFlow::Return(v) => return Ok(ControlFlow::Return(v)),
            ControlFlow::Value(v) => *ctx.pipe_value.borrow_mut() = Some(v),
        }
        let cond_flow = eval_expr(ctx, cond).await?;
        if cond_flow.is_terminator() {
            return Ok(cond_flow);
        }
        let cond_val = cond_flow.into_value();
        let b = cond_val
            .as_bool()
            .ok_or_else(|| RillError::type_mismatch("do-while condition", "bool", cond_val.type_name(), expr_location(cond)))?;
        if !b {
            return Ok(ControlFlow::Value(current_pipe_value(ctx)));
        }
    }
}

async fn eval_assert(ctx: &Context, cond: &Expr, message: Option<&Expr>, loc: Location) -> Result<ControlFlow, RillError> {
    let cond_flow = eval_expr(ctx, cond).await?;
    if cond_flow.is_terminator() {
        return Ok(cond_flow);
    }
    let cond_val = cond_flow.into_value();
    let b = cond_val
        .as_bool()
        .ok_or_else(|| RillError::type_mismatch("assert", "bool", cond_val.type_name(), loc))?;
    if b {
        return Ok(ControlFlow::Value(Value::Bool(true)));
    }
    let msg = match message {
        Some(m) => Some(eval_expr(ctx, m).await?.into_value().to_string()),
        None => None,
    };
    Err(RillError::assertion_failed(msg.as_deref(), loc))
}

// ===== operators with closure auto-invocation =====

/// Inside expression operators, and only when `$` is currently bound, a
/// closure operand is invoked with `$` as its single argument.
async fn maybe_auto_invoke(ctx: &Context, value: Value, fallback_args: &[Value], loc: Location) -> Result<Value, RillError> {
    if ctx.pipe_value.borrow().is_none() {
        return Ok(value);
    }
    match value {
        Value::Closure(closure) => {
            let args: Vec<Value> = if closure.arity() == Some(0) {
                Vec::new()
            } else {
                fallback_args.to_vec()
            };
            let flow = call_closure(ctx, &closure, &args, loc).await?;
            Ok(flow.into_value())
        }
        other => Ok(other),
    }
}

async fn eval_operand_with_auto_invoke(ctx: &Context, expr: &Expr) -> Result<ControlFlow, RillError> {
    let flow = eval_expr(ctx, expr).await?;
    if flow.is_terminator() {
        return Ok(flow);
    }
    let pv = current_pipe_value(ctx);
    let v = maybe_auto_invoke(ctx, flow.into_value(), &[pv], expr_location(expr)).await?;
    Ok(ControlFlow::Value(v))
}

async fn eval_unary(ctx: &Context, op: UnOp, operand: &Expr, loc: Location) -> Result<ControlFlow, RillError> {
    let flow = eval_operand_with_auto_invoke(ctx, operand).await?;
    if flow.is_terminator() {
        return Ok(flow);
    }
    let v = flow.into_value();
    match op {
        UnOp::Not => {
            let b = v
                .as_bool()
                .ok_or_else(|| RillError::negation_non_boolean(v.type_name(), loc))?;
            Ok(ControlFlow::Value(Value::Bool(!b)))
        }
        UnOp::Neg => {
            let n = v
                .as_number()
                .ok_or_else(|| RillError::arithmetic_non_number(v.type_name(), loc))?;
            Ok(ControlFlow::Value(Value::Number(-n)))
        }
    }
}

async fn eval_binary(ctx: &Context, op: BinOp, lhs: &Expr, rhs: &Expr, loc: Location) -> Result<ControlFlow, RillError> {
    if matches!(op, BinOp::And | BinOp::Or) {
        let lflow = eval_operand_with_auto_invoke(ctx, lhs).await?;
        if lflow.is_terminator() {
            return Ok(lflow);
        }
        let lv = lflow.into_value();
        let lb = lv
            .as_bool()
            .ok_or_else(|| RillError::negation_non_boolean(lv.type_name(), loc))?;
        if op == BinOp::And && !lb {
            return Ok(ControlFlow::Value(Value::Bool(false)));
        }
        if op == BinOp::Or && lb {
            return Ok(ControlFlow::Value(Value::Bool(true)));
        }
        let rflow = eval_operand_with_auto_invoke(ctx, rhs).await?;
        if rflow.is_terminator() {
            return Ok(rflow);
        }
        let rv = rflow.into_value();
        let rb = rv
            .as_bool()
            .ok_or_else(|| RillError::negation_non_boolean(rv.type_name(), loc))?;
        return Ok(ControlFlow::Value(Value::Bool(rb)));
    }

    let lflow = eval_operand_with_auto_invoke(ctx, lhs).await?;
    if lflow.is_terminator() {
        return Ok(lflow);
    }
    let rflow = eval_operand_with_auto_invoke(ctx, rhs).await?;
    if rflow.is_terminator() {
        return Ok(rflow);
    }
    let (lv, rv) = (lflow.into_value(), rflow.into_value());

    match op {
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => {
            let a = lv
                .as_number()
                .ok_or_else(|| RillError::arithmetic_non_number(lv.type_name(), loc))?;
            let b = rv
                .as_number()
                .ok_or_else(|| RillError::arithmetic_non_number(rv.type_name(), loc))?;
            let result = match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => {
                    if b == 0.0 {
                        return Err(RillError::division_by_zero(loc));
                    }
                    a / b
                }
                _ => unreachable!(),
            };
            Ok(ControlFlow::Value(Value::Number(result)))
        }
        BinOp::Eq => Ok(ControlFlow::Value(Value::Bool(lv == rv))),
        BinOp::Ne => Ok(ControlFlow::Value(Value::Bool(lv != rv))),
        BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => {
            let ordering = match (&lv, &rv) {
                (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => {
                    return Err(RillError::comparison_cross_kind(
                        lv.type_name(),
                        rv.type_name(),
                        loc,
                    ))
                }
            };
            let Some(ordering) = ordering else {
                return Err(RillError::comparison_cross_kind(lv.type_name(), rv.type_name(), loc));
            };
            let result = match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Gt => ordering.is_gt(),
                BinOp::Le => ordering.is_le(),
                BinOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            };
            Ok(ControlFlow::Value(Value::Bool(result)))
        }
        BinOp::And | BinOp::Or => unreachable!("handled above with short-circuit"),
    }
}

// ===== access chains =====

#[async_recursion(?Send)]
async fn eval_access(ctx: &Context, base: &Expr, op: &AccessOp, loc: Location) -> Result<ControlFlow, RillError> {
    let base_flow = eval_expr(ctx, base).await?;
    if base_flow.is_terminator() {
        return Ok(base_flow);
    }
    let base_val = base_flow.into_value();

    match op {
        AccessOp::Field(name) => {
            let v = read_field(&base_val, name, loc)?;
            Ok(ControlFlow::Value(v))
        }
        AccessOp::Index(idx_expr) => {
            let idx_flow = eval_expr(ctx, idx_expr).await?;
            if idx_flow.is_terminator() {
                return Ok(idx_flow);
            }
            index_value(&base_val, idx_flow.into_value(), loc).map(ControlFlow::Value)
        }
        AccessOp::Existence { field, guard_ty } => {
            let present = match &base_val {
                Value::Dict(d) => d.get(&Key::Str(field.clone())).is_some(),
                _ => false,
            };
            let ok = if present {
                match guard_ty {
                    Some(ty) => {
                        let v = base_val.as_dict().and_then(|d| d.get(&Key::Str(field.clone())));
                        v.map(|v| crate::context::type_matches(*ty, v)).unwrap_or(false)
                    }
                    None => true,
                }
            } else {
                false
            };
            Ok(ControlFlow::Value(Value::Bool(ok)))
        }
        AccessOp::AnnotationKey(_key) => Ok(ControlFlow::Value(Value::Null)),
        AccessOp::Alternatives(alts) => {
            for alt in alts {
                if let Ok(flow) = eval_expr(ctx, alt).await {
                    if !flow.is_terminator() {
                        return Ok(flow);
                    }
                }
            }
            Err(RillError::missing_field("alternatives", loc))
        }
        AccessOp::Computed(expr) => {
            let idx_flow = eval_expr(ctx, expr).await?;
            if idx_flow.is_terminator() {
                return Ok(idx_flow);
            }
            index_value(&base_val, idx_flow.into_value(), loc).map(ControlFlow::Value)
        }
        AccessOp::BlockAccessor(stmts) => {
            let block_ctx = ctx.with_child_scope();
            *block_ctx.pipe_value.borrow_mut() = Some(base_val);
            eval_block(&block_ctx, stmts).await
        }
    }
}

fn read_field(base: &Value, name: &str, loc: Location) -> Result<Value, RillError> {
    match base {
        Value::Dict(d) => d
            .get(&Key::Str(name.to_string()))
            .cloned()
            .ok_or_else(|| RillError::missing_field(name, loc)),
        other => Err(RillError::type_mismatch("field access", "dict", other.type_name(), loc)),
    }
}

fn index_value(base: &Value, index: Value, loc: Location) -> Result<Value, RillError> {
    match base {
        Value::List(items) => {
            let i = index
                .as_number()
                .ok_or_else(|| RillError::type_mismatch("index", "number", index.type_name(), loc))?;
            let idx = normalize_index(i as i64, items.len());
            items
                .get(idx)
                .cloned()
                .ok_or_else(|| RillError::missing_field(&i.to_string(), loc))
        }
        Value::Dict(d) => {
            let key = Key::from_value(&index)
                .ok_or_else(|| RillError::type_mismatch("dict key", "string, number, or bool", index.type_name(), loc))?;
            d.get(&key).cloned().ok_or_else(|| RillError::missing_field(&index.to_string(), loc))
        }
        Value::String(s) => {
            let i = index
                .as_number()
                .ok_or_else(|| RillError::type_mismatch("index", "number", index.type_name(), loc))?;
            let chars: Vec<char> = s.chars().collect();
            let idx = normalize_index(i as i64, chars.len());
            chars
                .get(idx)
                .map(|c| Value::String(c.to_string()))
                .ok_or_else(|| RillError::missing_field(&i.to_string(), loc))
        }
        other => Err(RillError::type_mismatch("index", "list, dict, or string", other.type_name(), loc)),
    }
}

fn normalize_index(i: i64, len: usize) -> usize {
    if i < 0 {
        (len as i64 + i).max(0) as usize
    } else {
        i as usize
    }
}

// ===== destructure & slice =====

async fn eval_destructure(ctx: &Context, patterns: &[Pattern], loc: Location) -> Result<ControlFlow, RillError> {
    let value = current_pipe_value(ctx);
    match &value {
        Value::List(items) => {
            if items.len() != patterns.len() {
                return Err(RillError::arity_mismatch("destructure", patterns.len(), items.len(), loc));
            }
            for (pat, item) in patterns.iter().zip(items.iter()) {
                bind_pattern(ctx, pat, item.clone(), loc)?;
            }
        }
        Value::Dict(d) => {
            for pat in patterns {
                if let Pattern::Key { key, pattern } = pat {
                    let v = d
                        .get(&Key::Str(key.clone()))
                        .cloned()
                        .ok_or_else(|| RillError::missing_field(key, loc))?;
                    bind_pattern(ctx, pattern, v, loc)?;
                }
            }
        }
        other => {
            return Err(RillError::type_mismatch(
                "destructure",
                "list or dict",
                other.type_name(),
                loc,
            ))
        }
    }
    Ok(ControlFlow::Value(value))
}

fn bind_pattern(ctx: &Context, pattern: &Pattern, value: Value, loc: Location) -> Result<(), RillError> {
    match pattern {
        Pattern::Wildcard => Ok(()),
        Pattern::Bind { name, ty } => {
            if let Some(ty) = ty {
                if !crate::context::type_matches(*ty, &value) {
                    return Err(RillError::type_mismatch("destructure binding", ty.as_str(), value.type_name(), loc));
                }
            }
            ctx.variables.capture(name, value);
            Ok(())
        }
        Pattern::Nested(inner) => match value {
            Value::List(items) => {
                if items.len() != inner.len() {
                    return Err(RillError::arity_mismatch("nested destructure", inner.len(), items.len(), loc));
                }
                for (pat, item) in inner.iter().zip(items.into_iter()) {
                    bind_pattern(ctx, pat, item, loc)?;
                }
                Ok(())
            }
            other => Err(RillError::type_mismatch("nested destructure", "list", other.type_name(), loc)),
        },
        Pattern::Key { key, pattern } => match value {
            Value::Dict(d) => {
                let v = d.get(&Key::Str(key.clone())).cloned().ok_or_else(|| RillError::missing_field(key, loc))?;
                bind_pattern(ctx, pattern, v, loc)
            }
            other => Err(RillError::type_mismatch("key destructure", "dict", other.type_name(), loc)),
        },
    }
}

async fn eval_slice(
    ctx: &Context,
    start: Option<&Expr>,
    stop: Option<&Expr>,
    step: Option<&Expr>,
    loc: Location,
) -> Result<ControlFlow, RillError> {
    let value = current_pipe_value(ctx);
    let start = eval_slice_index(ctx, start).await?;
    let stop = eval_slice_index(ctx, stop).await?;
    let step = match step {
        Some(e) => {
            let v = eval_expr(ctx, e).await?.into_value();
            v.as_number().ok_or_else(|| RillError::type_mismatch("slice step", "number", v.type_name(), loc))? as i64
        }
        None => 1,
    };
    if step == 0 {
        return Err(RillError::invalid_slice("slice step cannot be zero", loc));
    }

    match value {
        Value::List(items) => Ok(ControlFlow::Value(Value::List(slice_vec(items, start, stop, step)))),
        Value::String(s) => {
            let chars: Vec<char> = s.chars().collect();
            let sliced = slice_vec(chars, start, stop, step);
            Ok(ControlFlow::Value(Value::String(sliced.into_iter().collect())))
        }
        other => Err(RillError::type_mismatch("slice", "list or string", other.type_name(), loc)),
    }
}

async fn eval_slice_index(ctx: &Context, expr: Option<&Expr>) -> Result<Option<i64>, RillError> {
    match expr {
        Some(e) => {
            let v = eval_expr(ctx, e).await?.into_value();
            let n = v
                .as_number()
                .ok_or_else(|| RillError::type_mismatch("slice bound", "number", v.type_name(), expr_location(e)))?;
            Ok(Some(n as i64))
        }
        None => Ok(None),
    }
}

fn slice_vec<T: Clone>(items: Vec<T>, start: Option<i64>, stop: Option<i64>, step: i64) -> Vec<T> {
    let len = items.len() as i64;
    let clamp = |i: i64| -> i64 { i.max(0).min(len) };
    let resolve = |i: i64| -> i64 {
        if i < 0 {
            clamp(len + i)
        } else {
            clamp(i)
        }
    };

    let mut out = Vec::new();
    if step > 0 {
        let s = start.map(resolve).unwrap_or(0);
        let e = stop.map(resolve).unwrap_or(len);
        let mut i = s;
        while i < e {
            if let Some(item) = items.get(i as usize) {
                out.push(item.clone());
            }
            i += step;
        }
    } else {
        let s = start.map(resolve).unwrap_or(len - 1);
        let e = stop.map(resolve).unwrap_or(-1);
        let mut i = s.min(len - 1);
        while i > e && i >= 0 {
            if let Some(item) = items.get(i as usize) {
                out.push(item.clone());
            }
            i += step;
        }
    }
    out
}

// ===== calls: host functions, methods, invoke, closures =====

async fn eval_args(ctx: &Context, args: &[Arg]) -> Result<Vec<Value>, RillError> {
    let mut out = Vec::new();
    for arg in args {
        match arg {
            Arg::Positional(e) | Arg::Named(_, e) => {
                let v = eval_expr(ctx, e).await?.into_value();
                out.push(v);
            }
            Arg::Spread(e) => {
                let v = eval_expr(ctx, e).await?.into_value();
                match v {
                    Value::List(items) => out.extend(items),
                    Value::Tuple(t) => out.extend(t.positional),
                    other => out.push(other),
                }
            }
        }
    }
    Ok(out)
}

fn arg_location(args: &[Arg]) -> Location {
    args.iter()
        .find_map(|a| match a {
            Arg::Positional(e) | Arg::Named(_, e) | Arg::Spread(e) => Some(expr_location(e)),
        })
        .unwrap_or_default()
}

/// Resolves a host function/method call's arguments against its registered
/// parameter spec: named args match by name, defaults fill gaps, each slot
/// is type-checked and the check is enforced at invocation time.
async fn resolve_host_args(
    ctx: &Context,
    spec: &crate::context::HostFunctionSpec,
    args: &[Arg],
    loc: Location,
) -> Result<Vec<Value>, RillError> {
    let mut slots: Vec<Option<Value>> = vec![None; spec.params.len()];
    let mut next_positional = 0usize;
    for arg in args {
        match arg {
            Arg::Positional(e) => {
                let v = eval_expr(ctx, e).await?.into_value();
                if next_positional < slots.len() {
                    slots[next_positional] = Some(v);
                }
                next_positional += 1;
            }
            Arg::Named(name, e) => {
                let v = eval_expr(ctx, e).await?.into_value();
                if let Some(idx) = spec.params.iter().position(|p| &p.name == name) {
                    slots[idx] = Some(v);
                }
            }
            Arg::Spread(e) => {
                let v = eval_expr(ctx, e).await?.into_value();
                match v {
                    Value::Tuple(t) => {
                        for item in t.positional {
                            if next_positional < slots.len() {
                                slots[next_positional] = Some(item);
                            }
                            next_positional += 1;
                        }
                        for (name, item) in t.named {
                            if let Some(idx) = spec.params.iter().position(|p| p.name == name) {
                                slots[idx] = Some(item);
                            }
                        }
                    }
                    Value::List(items) => {
                        for item in items {
                            if next_positional < slots.len() {
                                slots[next_positional] = Some(item);
                            }
                            next_positional += 1;
                        }
                    }
                    other => {
                        if next_positional < slots.len() {
                            slots[next_positional] = Some(other);
                        }
                        next_positional += 1;
                    }
                }
            }
        }
    }

    let mut resolved = Vec::with_capacity(slots.len());
    for (i, slot) in slots.into_iter().enumerate() {
        let param = &spec.params[i];
        let value = match slot {
            Some(v) => v,
            None => match &param.default {
                Some(d) => d.clone(),
                None => return Err(RillError::arity_mismatch(&param.name, spec.params.len(), next_positional, loc)),
            },
        };
        if let Some(ty) = param.ty {
            if !crate::context::type_matches(ty, &value) {
                return Err(RillError::param_type_mismatch(
                    &param.name,
                    &param.name,
                    ty.as_str(),
                    value.type_name(),
                    loc,
                ));
            }
        }
        resolved.push(value);
    }
    Ok(resolved)
}

async fn eval_host_call(ctx: &Context, namespace: &[String], name: &str, args: &[Arg], span: Span) -> Result<ControlFlow, RillError> {
    let loc = span.start;
    let qualified = if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}::{}", namespace.join("::"), name)
    };
    let Some(spec) = ctx.function(&qualified) else {
        return Err(RillError::unknown_function(&qualified, loc));
    };
    ctx.check_cancel(loc)?;
    let resolved = resolve_host_args(ctx, &spec, args, loc).await?;
    ctx.push_frame(crate::error::CallFrame {
        location: loc,
        function_name: Some(qualified.clone()),
        context_label: None,
    });
    let result = spec.func.call(resolved, ctx.clone(), Some(span)).await;
    ctx.pop_frame();
    let value = result.map_err(|e| ctx.attach_call_stack(e))?;
    if let Some(ret_ty) = spec.return_ty {
        if !crate::context::type_matches(ret_ty, &value) {
            return Err(RillError::type_mismatch(&qualified, ret_ty.as_str(), value.type_name(), loc));
        }
    }
    Ok(ControlFlow::Value(value))
}

async fn eval_method_call(ctx: &Context, name: &str, args: &[Arg], loc: Location) -> Result<ControlFlow, RillError> {
    let self_value = current_pipe_value(ctx);
    let Some(spec) = ctx.method(name) else {
        return Err(RillError::unknown_method(name, self_value.type_name(), loc));
    };
    ctx.check_cancel(loc)?;
    let mut call_args = vec![self_value.clone()];
    call_args.extend(eval_args(ctx, args).await?);
    ctx.push_frame(crate::error::CallFrame {
        location: loc,
        function_name: Some(format!(".{name}")),
        context_label: None,
    });
    let result = spec.func.call(call_args, ctx.clone(), None).await;
    ctx.pop_frame();
    let value = result.map_err(|e| ctx.attach_call_stack(e))?;
    Ok(ControlFlow::Value(value))
}

async fn eval_invoke(ctx: &Context, callee: &InvokeCallee, args: &[Arg], span: Span) -> Result<ControlFlow, RillError> {
    let loc = span.start;
    let target = match callee {
        InvokeCallee::PipeValue => current_pipe_value(ctx),
        InvokeCallee::Named(name) => ctx
            .variables
            .get(name)
            .ok_or_else(|| RillError::undefined_variable(name, loc))?,
    };
    let closure = target
        .as_closure()
        .cloned()
        .ok_or_else(|| RillError::not_callable(target.type_name(), loc))?;
    let values = eval_args(ctx, args).await?;
    call_closure(ctx, &closure, &values, loc).await
}

#[async_recursion(?Send)]
pub(crate) async fn call_closure(ctx: &Context, closure: &Closure, args: &[Value], loc: Location) -> Result<ControlFlow, RillError> {
    if let Some(arity) = closure.arity() {
        if arity != args.len() {
            return Err(RillError::arity_mismatch("closure call", arity, args.len(), loc));
        }
    }
    match closure {
        Closure::Script(s) => call_script_closure(ctx, s, args, loc).await,
        Closure::Application(a) => call_application_closure(ctx, a, args, loc).await,
    }
}

async fn call_script_closure(
    ctx: &Context,
    closure: &Rc<ScriptClosure>,
    args: &[Value],
    loc: Location,
) -> Result<ControlFlow, RillError> {
    let scope = closure.env.child();
    for (param, value) in closure.params.iter().zip(args.iter()) {
        if let Some(ty) = param.ty {
            if !crate::context::type_matches(ty, value) {
                return Err(RillError::param_type_mismatch(
                    closure.name.as_deref().unwrap_or("<closure>"),
                    &param.name,
                    ty.as_str(),
                    value.type_name(),
                    loc,
                ));
            }
        }
        scope.capture(&param.name, value.clone());
    }
    let call_ctx = ctx.with_scope_and_pipe(scope, None);
    ctx.check_cancel(loc)?;
    ctx.push_frame(crate::error::CallFrame {
        location: loc,
        function_name: closure.name.clone(),
        context_label: None,
    });
    let result = eval_expr(&call_ctx, &closure.body).await;
    ctx.pop_frame();
    let flow = result.map_err(|e| ctx.attach_call_stack(e))?;
    match flow {
        ControlFlow::Return(v) => Ok(ControlFlow::Value(v)),
        other => Ok(other),
    }
}

async fn call_application_closure(
    ctx: &Context,
    closure: &Rc<ApplicationClosure>,
    args: &[Value],
    loc: Location,
) -> Result<ControlFlow, RillError> {
    ctx.check_cancel(loc)?;
    ctx.push_frame(crate::error::CallFrame {
        location: loc,
        function_name: Some(closure.name.clone()),
        context_label: None,
    });
    let result = closure.func.call(args.to_vec(), ctx.clone(), None).await;
    ctx.pop_frame();
    let value = result.map_err(|e| ctx.attach_call_stack(e))?;
    Ok(ControlFlow::Value(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RillOptions;
    use crate::parser::Parser;

    fn run(src: &str) -> Value {
        let script = Parser::parse(src).expect("parse");
        let ctx = Context::create(RillOptions::default()).expect("context");
        let fut = execute(&script, &ctx);
        futures::executor::block_on(fut).expect("execute").value
    }

    #[test]
    fn pipe_capture_then_read() {
        assert_eq!(run("\"x\" => $v\n$v"), Value::String("x".to_string()));
    }

    #[test]
    fn while_loop_counts_up() {
        assert_eq!(run("0 -> ($ < 3) @ { $ + 1 }"), Value::Number(3.0));
    }

    #[test]
    fn slice_basic_range() {
        assert_eq!(
            run("[1, 2, 3, 4, 5] -> /<1:4>"),
            Value::List(vec![Value::Number(2.0), Value::Number(3.0), Value::Number(4.0)])
        );
    }

    #[test]
    fn slice_reversed() {
        assert_eq!(
            run("[1, 2, 3] -> /<::-1>"),
            Value::List(vec![Value::Number(3.0), Value::Number(2.0), Value::Number(1.0)])
        );
    }

    #[test]
    fn slice_zero_step_errors() {
        let script = Parser::parse("[1,2,3] -> /<::0>").expect("parse");
        let ctx = Context::create(RillOptions::default()).expect("context");
        let err = futures::executor::block_on(execute(&script, &ctx)).unwrap_err();
        assert_eq!(err.error_id, "RILL-R005");
    }

    #[test]
    fn dispatch_table_matches_and_misses() {
        assert_eq!(run(r#""a" -> {a: 1, b: 2}"#), Value::Number(1.0));
        assert_eq!(run(r#""z" -> {a: 1, b: 2} ?? 0"#), Value::Number(0.0));
    }

    #[test]
    fn destructure_binds_skip_and_positions() {
        assert_eq!(
            run("[1, 2, 3] -> *<$a, _, $c>\n$a"),
            Value::Number(1.0)
        );
    }

    #[test]
    fn closure_auto_invoked_when_pipe_bound() {
        let script = Parser::parse("|x|($x > 0) => $pos\n5 -> (! $pos)").expect("parse");
        let ctx = Context::create(RillOptions::default()).expect("context");
        let result = futures::executor::block_on(execute(&script, &ctx)).expect("execute");
        assert_eq!(result.value, Value::Bool(false));
    }

    #[test]
    fn first_peeks_iterator_value_without_advancing() {
        assert_eq!(
            run(r#"{done: false, value: 1, next: |_| {done: true}} -> .first()"#),
            Value::Number(1.0)
        );
    }

    #[test]
    fn each_break_terminates_iteration_early() {
        assert_eq!(
            run("[1, 2, 3] -> .each(|x| ($x == 2) ? break)"),
            Value::Null
        );
    }

    #[test]
    fn map_break_short_circuits_remaining_items() {
        assert_eq!(
            run("[1, 2, 3] -> .map(|x| ($x == 2) ? (\"stop\" -> break) ! ($x * 10))"),
            Value::String("stop".to_string())
        );
    }

    #[test]
    fn closure_not_auto_invoked_without_pipe_value() {
        let script = Parser::parse("|x|($x > 0) => $pos\n! $pos").expect("parse");
        let ctx = Context::create(RillOptions::default()).expect("context");
        let err = futures::executor::block_on(execute(&script, &ctx)).unwrap_err();
        assert_eq!(err.error_id, "RILL-R008");
    }

    #[test]
    fn bare_function_pipe_stage_falls_back_to_pipe_value() {
        assert_eq!(run("\"hello\" -> identity"), Value::String("hello".to_string()));
        assert_eq!(run("42 -> type"), Value::String("number".to_string()));
    }

    #[test]
    fn pipe_value_resets_between_top_level_statements() {
        assert_eq!(run("\"x\" => $v\n5"), Value::Number(5.0));
    }
}
