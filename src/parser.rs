// ABOUTME: Recursive-descent parser turning a token stream into the AST of
// `crate::ast`. Pipe-stage disambiguation and newline-sensitive statement
// boundaries are much easier to express over an already-spanned token
// stream than re-lexing inline, so this module runs as hand-rolled
// recursive descent over `Parser`'s token cursor, with a uniform
// error-propagation shape throughout.

use crate::ast::*;
use crate::error::{Location, RillError};
use crate::lexer::{Lexer, Span, StringPart, Token, TokenKind};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    recovery: bool,
    errors: Vec<RillError>,
}

impl Parser {
    fn new(tokens: Vec<Token>, recovery: bool) -> Self {
        Parser {
            tokens,
            pos: 0,
            recovery,
            errors: Vec::new(),
        }
    }

    /// Parses `source` to completion; the first error aborts the parse.
    pub fn parse(source: &str) -> Result<Script, RillError> {
        let (frontmatter, tokens) = Lexer::lex(source)?;
        let mut parser = Parser::new(tokens, false);
        let statements = parser.parse_script_body()?;
        Ok(Script {
            frontmatter,
            statements,
        })
    }

    /// Parses `source` in recovery mode: parse errors become `RecoveryError`
    /// placeholder statements instead of aborting. Returns the (possibly
    /// partial) script together with every error collected along the way.
    pub fn parse_recovering(source: &str) -> (Result<Script, RillError>, Vec<RillError>) {
        let (frontmatter, tokens) = match Lexer::lex(source) {
            Ok(t) => t,
            Err(e) => return (Err(e.clone()), vec![e]),
        };
        let mut parser = Parser::new(tokens, true);
        let statements = parser
            .parse_script_body()
            .unwrap_or_default();
        let errors = std::mem::take(&mut parser.errors);
        (
            Ok(Script {
                frontmatter,
                statements,
            }),
            errors,
        )
    }

    // ===== token cursor helpers =====

    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos].kind
    }

    fn peek_at(&self, n: usize) -> &TokenKind {
        self.tokens
            .get(self.pos + n)
            .map(|t| &t.kind)
            .unwrap_or(&TokenKind::Eof)
    }

    fn is_at_end(&self) -> bool {
        matches!(self.peek(), TokenKind::Eof)
    }

    fn cur_loc(&self) -> Location {
        self.tokens[self.pos].span.start
    }

    fn cur_span(&self) -> Span {
        self.tokens[self.pos].span
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos].clone();
        if !self.is_at_end() {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek() == kind
    }

    fn bump_if(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token, RillError> {
        if self.peek() == &kind {
            Ok(self.advance())
        } else {
            Err(RillError::expected(what, self.cur_loc()))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String, RillError> {
        match self.peek().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(RillError::expected(what, self.cur_loc())),
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), TokenKind::Newline) {
            self.advance();
        }
    }

    // ===== top level =====

    fn parse_script_body(&mut self) -> Result<Vec<Statement>, RillError> {
        let mut statements = Vec::new();
        self.skip_newlines();
        while !self.is_at_end() {
            if self.check(&TokenKind::Arrow) {
                let err = RillError::pipe_break_across_newline(self.cur_loc());
                if self.recovery {
                    self.recover_statement(&mut statements, err);
                    self.skip_newlines();
                    continue;
                }
                return Err(err);
            }
            match self.parse_statement() {
                Ok(stmt) => statements.push(stmt),
                Err(e) => {
                    if self.recovery {
                        self.recover_statement(&mut statements, e);
                    } else {
                        return Err(e);
                    }
                }
            }
            self.skip_newlines();
        }
        Ok(statements)
    }

    /// Records `err`, synthesizes a `RecoveryError` placeholder from the
    /// source text up to the next statement boundary, and advances past it.
    fn recover_statement(&mut self, statements: &mut Vec<Statement>, err: RillError) {
        let start_span = self.cur_span();
        let mut text_parts = Vec::new();
        while !self.is_at_end() && !matches!(self.peek(), TokenKind::Newline) {
            text_parts.push(self.advance().text);
        }
        let span = Span {
            start: start_span.start,
            end: self.cur_loc(),
        };
        statements.push(Statement::Recovery(RecoveryError {
            message: err.message.clone(),
            text: text_parts.join(" "),
            span,
        }));
        self.errors.push(err);
    }

    fn parse_statement(&mut self) -> Result<Statement, RillError> {
        if self.check(&TokenKind::Caret) {
            let annotation = self.parse_annotation()?;
            let inner = self.parse_statement()?;
            return Ok(Statement::Annotated(annotation, Box::new(inner)));
        }
        let expr = self.parse_pipe()?;
        Ok(Statement::Expr(expr))
    }

    fn parse_annotation(&mut self) -> Result<Annotation, RillError> {
        let start = self.cur_span();
        self.expect(TokenKind::Caret, "`^`")?;
        self.expect(TokenKind::LParen, "`(` after `^`")?;
        let mut entries = Vec::new();
        self.skip_newlines();
        while !self.check(&TokenKind::RParen) {
            if self.bump_if(&TokenKind::Star) {
                let expr = self.parse_expr()?;
                entries.push(AnnotationEntry::Spread(expr));
            } else {
                let name = self.expect_ident("annotation key")?;
                self.expect(TokenKind::Colon, "`:` after annotation key")?;
                let expr = self.parse_pipe()?;
                entries.push(AnnotationEntry::Pair(name, expr));
            }
            self.skip_newlines();
            if self.bump_if(&TokenKind::Comma) {
                self.skip_newlines();
            } else {
                break;
            }
        }
        let end = self.cur_span();
        self.expect(TokenKind::RParen, "`)` to close annotation")?;
        Ok(Annotation {
            entries,
            span: Span {
                start: start.start,
                end: end.end,
            },
        })
    }

    // ===== pipe chains =====

    fn parse_pipe(&mut self) -> Result<Expr, RillError> {
        let head = self.parse_ternary_or_loop()?;
        let mut pipes = Vec::new();
        loop {
            if self.check(&TokenKind::Arrow) {
                let span_start = self.cur_span();
                self.advance();
                let target = self.parse_pipe_target()?;
                pipes.push(PipeStage {
                    target,
                    span: Span {
                        start: span_start.start,
                        end: self.tokens[self.pos.saturating_sub(1)].span.end,
                    },
                });
            } else if self.check(&TokenKind::CaptureArrow) || self.check(&TokenKind::CaptureColon) {
                let span_start = self.cur_span();
                self.advance();
                self.expect(TokenKind::Dollar, "`$` after capture operator")?;
                let name = self.expect_ident("variable name after `$`")?;
                pipes.push(PipeStage {
                    target: PipeTarget::InlineCapture(name),
                    span: Span {
                        start: span_start.start,
                        end: self.tokens[self.pos.saturating_sub(1)].span.end,
                    },
                });
            } else {
                break;
            }
        }
        if pipes.is_empty() {
            Ok(head)
        } else {
            Ok(Expr::Pipe {
                head: Box::new(head),
                pipes,
            })
        }
    }

    fn parse_pipe_target(&mut self) -> Result<PipeTarget, RillError> {
        if self.check(&TokenKind::Dot) {
            self.advance();
            let name = self.expect_ident("method name")?;
            self.expect(TokenKind::LParen, "`(` to open method arguments")?;
            let args = self.parse_args_body()?;
            self.expect(TokenKind::RParen, "`)` to close method arguments")?;
            return Ok(PipeTarget::Method { name, args });
        }
        if self.check(&TokenKind::Colon) {
            self.advance();
            if self.bump_if(&TokenKind::Question) {
                let ty = self.parse_type_name()?;
                return Ok(PipeTarget::TypeCheck(ty));
            }
            let ty = self.parse_type_name()?;
            return Ok(PipeTarget::TypeAssert(ty));
        }
        if self.check(&TokenKind::LBrace) {
            if self.looks_like_dict() {
                let entries = self.parse_dict_entries()?;
                let default = if self.bump_if(&TokenKind::Coalesce) {
                    Some(Box::new(self.parse_ternary_or_loop()?))
                } else {
                    None
                };
                return Ok(PipeTarget::DispatchTable { entries, default });
            }
            let stmts = self.parse_block_stmts()?;
            return Ok(PipeTarget::Block(stmts));
        }

        let expr = self.parse_ternary_or_loop()?;
        Ok(match expr {
            Expr::Conditional {
                cond,
                then_branch,
                else_branch,
            } => PipeTarget::Conditional {
                cond,
                then_branch,
                else_branch,
            },
            Expr::WhileLoop { cond, body } => PipeTarget::WhileLoop { cond, body },
            Expr::DoWhileLoop { body, cond } => PipeTarget::DoWhileLoop { body, cond },
            Expr::Closure(lit) => PipeTarget::InlineClosure(lit),
            Expr::Block(stmts) => PipeTarget::Block(stmts),
            Expr::Str(parts) => PipeTarget::StringTemplate(parts),
            Expr::HostCall { namespace, name, args } => PipeTarget::Call { namespace, name, args },
            Expr::Invoke { callee, args } => PipeTarget::Invoke { callee, args },
            Expr::Spanned { expr, .. } => match *expr {
                Expr::HostCall { namespace, name, args } => PipeTarget::Call { namespace, name, args },
                Expr::Invoke { callee, args } => PipeTarget::Invoke { callee, args },
                other => PipeTarget::Arith(Box::new(other)),
            },
            other => PipeTarget::Arith(Box::new(other)),
        })
    }

    fn parse_ternary_or_loop(&mut self) -> Result<Expr, RillError> {
        if self.check(&TokenKind::At) {
            self.advance();
            let body = self.parse_or()?;
            self.expect(TokenKind::Question, "`?` before do-while condition")?;
            let cond = self.parse_or()?;
            return Ok(Expr::DoWhileLoop {
                body: Box::new(body),
                cond: Box::new(cond),
            });
        }
        let e = self.parse_or()?;
        if self.bump_if(&TokenKind::At) {
            let body = self.parse_or()?;
            return Ok(Expr::WhileLoop {
                cond: Box::new(e),
                body: Box::new(body),
            });
        }
        if self.bump_if(&TokenKind::Question) {
            let then_branch = self.parse_or()?;
            let else_branch = if self.bump_if(&TokenKind::Bang) {
                Some(Box::new(self.parse_or()?))
            } else {
                None
            };
            return Ok(Expr::Conditional {
                cond: Box::new(e),
                then_branch: Box::new(then_branch),
                else_branch,
            });
        }
        Ok(e)
    }

    fn parse_or(&mut self) -> Result<Expr, RillError> {
        let mut left = self.parse_and()?;
        while self.bump_if(&TokenKind::OrOr) {
            let right = self.parse_and()?;
            left = Expr::Binary {
                op: BinOp::Or,
                lhs: Box::new(left),
                rhs: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, RillError> {
        let mut left = self.parse_cmp()?;
        while self.bump_if(&TokenKind::AndAnd) {
            let right = self.parse_cmp()?;
            left = Expr::Binary {
                op: BinOp::And,
                lhs: Box::new(left),
                rhs: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_cmp(&mut self) -> Result<Expr, RillError> {
        let left = self.parse_add()?;
        let op = match self.peek() {
            TokenKind::EqEq => BinOp::Eq,
            TokenKind::NotEq => BinOp::Ne,
            TokenKind::Lt => BinOp::Lt,
            TokenKind::Gt => BinOp::Gt,
            TokenKind::Le => BinOp::Le,
            TokenKind::Ge => BinOp::Ge,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_add()?;
        Ok(Expr::Binary {
            op,
            lhs: Box::new(left),
            rhs: Box::new(right),
        })
    }

    fn parse_add(&mut self) -> Result<Expr, RillError> {
        let mut left = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_mul()?;
            left = Expr::Binary {
                op,
                lhs: Box::new(left),
                rhs: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_mul(&mut self) -> Result<Expr, RillError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                lhs: Box::new(left),
                rhs: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, RillError> {
        if self.bump_if(&TokenKind::Bang) {
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnOp::Not,
                operand: Box::new(operand),
            });
        }
        if self.bump_if(&TokenKind::Minus) {
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnOp::Neg,
                operand: Box::new(operand),
            });
        }
        if self.bump_if(&TokenKind::Star) {
            let operand = self.parse_unary()?;
            return Ok(Expr::Spread(Box::new(operand)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, RillError> {
        let start = self.cur_span();
        let mut expr = self.parse_primary()?;
        loop {
            if self.check(&TokenKind::Dot) {
                if matches!(self.peek_at(1), TokenKind::Ident(_))
                    && matches!(self.peek_at(2), TokenKind::LParen)
                {
                    return Err(RillError::method_call_not_a_pipe_stage(self.cur_loc()));
                }
                self.advance();
                let op = match self.peek().clone() {
                    TokenKind::Ident(name) => {
                        self.advance();
                        AccessOp::Field(name)
                    }
                    TokenKind::LBracket => {
                        self.advance();
                        let idx = self.parse_expr()?;
                        self.expect(TokenKind::RBracket, "`]` to close index")?;
                        AccessOp::Index(Box::new(idx))
                    }
                    TokenKind::LParen => {
                        self.advance();
                        let mut alts = vec![self.parse_pipe()?];
                        let mut is_alts = false;
                        while self.bump_if(&TokenKind::Pipe) {
                            is_alts = true;
                            alts.push(self.parse_pipe()?);
                        }
                        self.expect(TokenKind::RParen, "`)` to close access group")?;
                        if is_alts {
                            AccessOp::Alternatives(alts)
                        } else {
                            AccessOp::Computed(Box::new(alts.into_iter().next().unwrap()))
                        }
                    }
                    TokenKind::LBrace => {
                        let stmts = self.parse_block_stmts()?;
                        AccessOp::BlockAccessor(stmts)
                    }
                    _ => return Err(RillError::expected("field, `[`, `(`, or `{` after `.`", self.cur_loc())),
                };
                expr = Expr::Access {
                    base: Box::new(expr),
                    op,
                };
                continue;
            }
            if self.check(&TokenKind::ExistQ) {
                self.advance();
                let field = self.expect_ident("field name after `.?`")?;
                let guard_ty = if self.bump_if(&TokenKind::Amp) {
                    Some(self.parse_type_name()?)
                } else {
                    None
                };
                expr = Expr::Access {
                    base: Box::new(expr),
                    op: AccessOp::Existence { field, guard_ty },
                };
                continue;
            }
            if self.check(&TokenKind::AnnotAt) {
                self.advance();
                let key = self.expect_ident("annotation key after `.^`")?;
                expr = Expr::Access {
                    base: Box::new(expr),
                    op: AccessOp::AnnotationKey(key),
                };
                continue;
            }
            break;
        }
        let end = self.tokens[self.pos.saturating_sub(1)].span.end;
        Ok(expr.spanned(Span {
            start: start.start,
            end,
        }))
    }

    fn parse_primary(&mut self) -> Result<Expr, RillError> {
        let start = self.cur_loc();
        match self.peek().clone() {
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expr::Number(n))
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::Bool(true))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::Bool(false))
            }
            TokenKind::Str(parts) => {
                self.advance();
                let segments = self.parse_template_segments(parts)?;
                Ok(Expr::Str(segments))
            }
            TokenKind::TripleStr(s) => {
                self.advance();
                Ok(Expr::TripleStr(s))
            }
            TokenKind::Dollar => {
                self.advance();
                if self.check(&TokenKind::LParen) {
                    self.advance();
                    let args = self.parse_args_body()?;
                    self.expect(TokenKind::RParen, "`)` to close invocation")?;
                    return Ok(Expr::Invoke {
                        callee: InvokeCallee::PipeValue,
                        args,
                    });
                }
                if let TokenKind::Ident(name) = self.peek().clone() {
                    self.advance();
                    if self.check(&TokenKind::LParen) {
                        self.advance();
                        let args = self.parse_args_body()?;
                        self.expect(TokenKind::RParen, "`)` to close invocation")?;
                        return Ok(Expr::Invoke {
                            callee: InvokeCallee::Named(name),
                            args,
                        });
                    }
                    return Ok(Expr::Var(name));
                }
                Ok(Expr::PipeRef)
            }
            TokenKind::Ident(_) | TokenKind::Each | TokenKind::Map | TokenKind::Fold | TokenKind::Filter => {
                self.parse_host_call()
            }
            TokenKind::LBracket => {
                self.advance();
                let mut items = Vec::new();
                self.skip_newlines();
                while !self.check(&TokenKind::RBracket) {
                    items.push(self.parse_pipe()?);
                    self.skip_newlines();
                    if self.bump_if(&TokenKind::Comma) {
                        self.skip_newlines();
                    } else {
                        break;
                    }
                }
                self.expect(TokenKind::RBracket, "`]` to close list")?;
                Ok(Expr::List(items))
            }
            TokenKind::LBrace => {
                if self.looks_like_dict() {
                    let entries = self.parse_dict_entries()?;
                    Ok(Expr::Dict(entries))
                } else {
                    let stmts = self.parse_block_stmts()?;
                    Ok(Expr::Block(stmts))
                }
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_pipe()?;
                self.expect(TokenKind::RParen, "`)` to close group")?;
                Ok(Expr::Group(Box::new(inner)))
            }
            TokenKind::DestructureOpen => {
                self.advance();
                let patterns = self.parse_pattern_list()?;
                self.expect(TokenKind::Gt, "`>` to close destructure pattern")?;
                Ok(Expr::Destructure(patterns))
            }
            TokenKind::SliceOpen => {
                self.advance();
                self.parse_slice()
            }
            TokenKind::Pipe => self.parse_closure_literal(),
            TokenKind::Break => {
                self.advance();
                let value = self.parse_optional_parenthesized()?;
                Ok(Expr::Break(value))
            }
            TokenKind::Return => {
                self.advance();
                let value = self.parse_optional_parenthesized()?;
                Ok(Expr::Return(value))
            }
            TokenKind::Assert => {
                self.advance();
                self.expect(TokenKind::LParen, "`(` after `assert`")?;
                let cond = self.parse_pipe()?;
                let message = if self.bump_if(&TokenKind::Comma) {
                    Some(Box::new(self.parse_pipe()?))
                } else {
                    None
                };
                self.expect(TokenKind::RParen, "`)` to close assert")?;
                Ok(Expr::Assert {
                    cond: Box::new(cond),
                    message,
                })
            }
            TokenKind::Error => {
                self.advance();
                self.expect(TokenKind::LParen, "`(` after `error`")?;
                let message = self.parse_pipe()?;
                self.expect(TokenKind::RParen, "`)` to close error")?;
                Ok(Expr::ErrorStmt(Box::new(message)))
            }
            TokenKind::Pass => {
                self.advance();
                Ok(Expr::Pass)
            }
            _ => Err(RillError::expected("expression", start)),
        }
    }

    fn parse_optional_parenthesized(&mut self) -> Result<Option<Box<Expr>>, RillError> {
        if self.bump_if(&TokenKind::LParen) {
            let value = self.parse_pipe()?;
            self.expect(TokenKind::RParen, "`)` to close value")?;
            Ok(Some(Box::new(value)))
        } else {
            Ok(None)
        }
    }

    fn parse_host_call(&mut self) -> Result<Expr, RillError> {
        let mut namespace = Vec::new();
        let mut name = self.take_call_segment()?;
        while self.check(&TokenKind::ColonColon) {
            self.advance();
            namespace.push(name);
            name = self.take_call_segment()?;
        }
        self.expect(TokenKind::LParen, "`(` to call a function")?;
        let args = self.parse_args_body()?;
        self.expect(TokenKind::RParen, "`)` to close call")?;
        Ok(Expr::HostCall {
            namespace,
            name,
            args,
        })
    }

    fn take_call_segment(&mut self) -> Result<String, RillError> {
        match self.peek().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            TokenKind::Each => {
                self.advance();
                Ok("each".to_string())
            }
            TokenKind::Map => {
                self.advance();
                Ok("map".to_string())
            }
            TokenKind::Fold => {
                self.advance();
                Ok("fold".to_string())
            }
            TokenKind::Filter => {
                self.advance();
                Ok("filter".to_string())
            }
            _ => Err(RillError::expected("function name", self.cur_loc())),
        }
    }

    fn parse_args_body(&mut self) -> Result<Vec<Arg>, RillError> {
        let mut args = Vec::new();
        self.skip_newlines();
        while !self.check(&TokenKind::RParen) {
            if self.bump_if(&TokenKind::Star) {
                let expr = self.parse_ternary_or_loop()?;
                args.push(Arg::Spread(expr));
            } else if matches!(self.peek(), TokenKind::Ident(_)) && matches!(self.peek_at(1), TokenKind::Colon) {
                let name = self.expect_ident("argument name")?;
                self.advance(); // colon
                let value = self.parse_pipe()?;
                args.push(Arg::Named(name, value));
            } else {
                let value = self.parse_pipe()?;
                args.push(Arg::Positional(value));
            }
            self.skip_newlines();
            if self.bump_if(&TokenKind::Comma) {
                self.skip_newlines();
            } else {
                break;
            }
        }
        Ok(args)
    }

    fn parse_closure_literal(&mut self) -> Result<Expr, RillError> {
        self.expect(TokenKind::Pipe, "`|` to open closure parameters")?;
        let mut params = Vec::new();
        while !self.check(&TokenKind::Pipe) {
            let name = self.expect_ident("parameter name")?;
            let ty = if self.bump_if(&TokenKind::Colon) {
                Some(self.parse_type_name()?)
            } else {
                None
            };
            let default = if self.bump_if(&TokenKind::Eq) {
                Some(self.parse_ternary_or_loop()?)
            } else {
                None
            };
            params.push(Param { name, ty, default });
            if !self.bump_if(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::Pipe, "`|` to close closure parameters")?;
        let return_ty = if self.bump_if(&TokenKind::Colon) {
            Some(self.parse_type_name()?)
        } else {
            None
        };
        let body = self.parse_ternary_or_loop()?;
        Ok(Expr::Closure(ClosureLit {
            params,
            body: Box::new(body),
            return_ty,
        }))
    }

    fn parse_pattern_list(&mut self) -> Result<Vec<Pattern>, RillError> {
        let mut patterns = Vec::new();
        while !self.check(&TokenKind::Gt) {
            patterns.push(self.parse_pattern()?);
            if !self.bump_if(&TokenKind::Comma) {
                break;
            }
        }
        Ok(patterns)
    }

    fn parse_pattern(&mut self) -> Result<Pattern, RillError> {
        match self.peek().clone() {
            TokenKind::Ident(name) if name == "_" => {
                self.advance();
                Ok(Pattern::Wildcard)
            }
            TokenKind::Ident(name) if matches!(self.peek_at(1), TokenKind::Colon) => {
                self.advance();
                self.advance(); // colon
                let inner = self.parse_pattern()?;
                Ok(Pattern::Key {
                    key: name,
                    pattern: Box::new(inner),
                })
            }
            TokenKind::DestructureOpen => {
                self.advance();
                let nested = self.parse_pattern_list()?;
                self.expect(TokenKind::Gt, "`>` to close nested pattern")?;
                Ok(Pattern::Nested(nested))
            }
            TokenKind::Dollar => {
                self.advance();
                let name = self.expect_ident("pattern variable name")?;
                let ty = if self.bump_if(&TokenKind::Colon) {
                    Some(self.parse_type_name()?)
                } else {
                    None
                };
                Ok(Pattern::Bind { name, ty })
            }
            _ => Err(RillError::expected("destructure pattern", self.cur_loc())),
        }
    }

    fn parse_slice(&mut self) -> Result<Expr, RillError> {
        let mut parts: [Option<Box<Expr>>; 3] = [None, None, None];
        let mut idx = 0usize;
        while !self.check(&TokenKind::Gt) {
            if self.bump_if(&TokenKind::ColonColon) {
                idx += 2;
                continue;
            }
            if self.bump_if(&TokenKind::Colon) {
                idx += 1;
                continue;
            }
            let value = self.parse_add()?;
            if idx < 3 {
                parts[idx] = Some(Box::new(value));
            }
        }
        self.expect(TokenKind::Gt, "`>` to close slice")?;
        let [start, stop, step] = parts;
        Ok(Expr::Slice { start, stop, step })
    }

    fn parse_type_name(&mut self) -> Result<TypeName, RillError> {
        let ty = match self.peek() {
            TokenKind::TyString => TypeName::String,
            TokenKind::TyNumber => TypeName::Number,
            TokenKind::TyBool => TypeName::Bool,
            TokenKind::TyClosure => TypeName::Closure,
            TokenKind::TyList => TypeName::List,
            TokenKind::TyDict => TypeName::Dict,
            TokenKind::TyTuple => TypeName::Tuple,
            _ => return Err(RillError::expected("type name", self.cur_loc())),
        };
        self.advance();
        Ok(ty)
    }

    // ===== dict / block =====

    fn looks_like_dict(&self) -> bool {
        if matches!(self.peek_at(1), TokenKind::RBrace) {
            return true;
        }
        let key_like = matches!(
            self.peek_at(1),
            TokenKind::Ident(_)
                | TokenKind::Str(_)
                | TokenKind::Number(_)
                | TokenKind::True
                | TokenKind::False
                | TokenKind::LBracket
        );
        key_like && matches!(self.peek_at(2), TokenKind::Colon)
    }

    fn parse_dict_entries(&mut self) -> Result<Vec<DictEntry>, RillError> {
        self.expect(TokenKind::LBrace, "`{`")?;
        let mut entries = Vec::new();
        self.skip_newlines();
        while !self.check(&TokenKind::RBrace) {
            let start = self.cur_span();
            let key = self.parse_dict_key()?;
            self.expect(TokenKind::Colon, "`:` after dict key")?;
            let value = self.parse_pipe()?;
            let end = self.tokens[self.pos.saturating_sub(1)].span.end;
            entries.push(DictEntry {
                key,
                value,
                span: Span {
                    start: start.start,
                    end,
                },
            });
            self.skip_newlines();
            if self.bump_if(&TokenKind::Comma) {
                self.skip_newlines();
            } else {
                break;
            }
        }
        self.expect(TokenKind::RBrace, "`}` to close dict")?;
        Ok(entries)
    }

    fn parse_dict_key(&mut self) -> Result<DictKey, RillError> {
        match self.peek().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(DictKey::Ident(name))
            }
            TokenKind::Str(parts) => {
                self.advance();
                match parts.as_slice() {
                    [StringPart::Literal(s)] => Ok(DictKey::Str(s.clone())),
                    [] => Ok(DictKey::Str(String::new())),
                    _ => Err(RillError::invalid_dict_key(self.cur_loc())),
                }
            }
            TokenKind::Number(n) => {
                self.advance();
                Ok(DictKey::Number(n))
            }
            TokenKind::True => {
                self.advance();
                Ok(DictKey::Bool(true))
            }
            TokenKind::False => {
                self.advance();
                Ok(DictKey::Bool(false))
            }
            TokenKind::LBracket => {
                self.advance();
                let mut keys = Vec::new();
                while !self.check(&TokenKind::RBracket) {
                    keys.push(self.parse_dict_key()?);
                    if !self.bump_if(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RBracket, "`]` to close multi-key list")?;
                Ok(DictKey::Multi(keys))
            }
            TokenKind::LBrace => Err(RillError::invalid_dict_key(self.cur_loc())),
            TokenKind::Pipe => Err(RillError::closure_key_invalid(self.cur_loc())),
            _ => Err(RillError::expected(
                "dict key (identifier, string, number, bool, or list)",
                self.cur_loc(),
            )),
        }
    }

    fn parse_block_stmts(&mut self) -> Result<Vec<Statement>, RillError> {
        self.expect(TokenKind::LBrace, "`{`")?;
        self.skip_newlines();
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            if self.is_at_end() {
                return Err(RillError::expected("`}` to close block", self.cur_loc()));
            }
            stmts.push(self.parse_statement()?);
            self.skip_newlines();
        }
        self.expect(TokenKind::RBrace, "`}` to close block")?;
        Ok(stmts)
    }

    // ===== interpolated strings =====

    fn parse_template_segments(&mut self, parts: Vec<StringPart>) -> Result<Vec<TemplateSegment>, RillError> {
        let mut segments = Vec::new();
        for part in parts {
            match part {
                StringPart::Literal(s) => segments.push(TemplateSegment::Literal(s)),
                StringPart::Interp(raw) => {
                    let (_, tokens) = Lexer::lex(&raw)?;
                    let mut sub = Parser::new(tokens, false);
                    let expr = sub.parse_pipe()?;
                    segments.push(TemplateSegment::Expr(expr));
                }
            }
        }
        Ok(segments)
    }

    // ===== shared non-pipe expression entry (used by postfix bases, args, etc.) =====

    fn parse_expr(&mut self) -> Result<Expr, RillError> {
        self.parse_pipe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> Script {
        Parser::parse(src).unwrap_or_else(|e| panic!("parse failed for {src:?}: {e}"))
    }

    #[test]
    fn parses_simple_capture() {
        let script = parse_ok("\"x\" => $v");
        assert_eq!(script.statements.len(), 1);
        match &script.statements[0] {
            Statement::Expr(Expr::Pipe { pipes, .. }) => {
                assert_eq!(pipes.len(), 1);
                assert!(matches!(pipes[0].target, PipeTarget::InlineCapture(ref n) if n == "v"));
            }
            other => panic!("unexpected statement shape: {other:?}"),
        }
    }

    #[test]
    fn parses_pipe_chain_with_method_call() {
        let script = parse_ok("\"hi\" -> .upper()");
        match &script.statements[0] {
            Statement::Expr(Expr::Pipe { pipes, .. }) => {
                assert!(matches!(pipes[0].target, PipeTarget::Method { ref name, .. } if name == "upper"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_while_loop() {
        let script = parse_ok("0 -> ($ < 3) @ { $ + 1 }");
        match &script.statements[0] {
            Statement::Expr(Expr::Pipe { pipes, .. }) => {
                assert!(matches!(pipes[0].target, PipeTarget::WhileLoop { .. }));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_slice_with_step() {
        let script = parse_ok("[1, 2, 3, 4, 5] -> /<1:4>");
        match &script.statements[0] {
            Statement::Expr(Expr::Pipe { pipes, .. }) => match &pipes[0].target {
                PipeTarget::Arith(e) => match e.as_ref() {
                    Expr::Slice { start, stop, step } => {
                        assert!(start.is_some());
                        assert!(stop.is_some());
                        assert!(step.is_none());
                    }
                    other => panic!("expected slice, got {other:?}"),
                },
                other => panic!("expected Arith(slice), got {other:?}"),
            },
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_negative_step_slice() {
        let script = parse_ok("[1,2,3] -> /<::-1>");
        match &script.statements[0] {
            Statement::Expr(Expr::Pipe { pipes, .. }) => match &pipes[0].target {
                PipeTarget::Arith(e) => match e.as_ref() {
                    Expr::Slice { start, stop, step } => {
                        assert!(start.is_none());
                        assert!(stop.is_none());
                        assert!(step.is_some());
                    }
                    other => panic!("expected slice, got {other:?}"),
                },
                other => panic!("unexpected target {other:?}"),
            },
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_destructure_pattern() {
        let script = parse_ok("[1, 2, 3] -> *<$a, _, $c>");
        match &script.statements[0] {
            Statement::Expr(Expr::Pipe { pipes, .. }) => match &pipes[0].target {
                PipeTarget::Arith(e) => match e.as_ref() {
                    Expr::Destructure(pats) => assert_eq!(pats.len(), 3),
                    other => panic!("expected destructure, got {other:?}"),
                },
                other => panic!("unexpected target {other:?}"),
            },
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_dict_dispatch_braces() {
        let script = parse_ok(r#""z" -> {a: 1, b: 2} ?? 0"#);
        match &script.statements[0] {
            Statement::Expr(Expr::Pipe { pipes, .. }) => {
                assert!(matches!(
                    pipes[0].target,
                    PipeTarget::DispatchTable { default: Some(_), .. }
                ));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_closure_with_params() {
        let script = parse_ok("|x|($x > 0) => $pos");
        match &script.statements[0] {
            Statement::Expr(Expr::Pipe { head, .. }) => match head.as_ref() {
                Expr::Closure(lit) => assert_eq!(lit.params.len(), 1),
                other => panic!("expected closure head, got {other:?}"),
            },
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn method_call_outside_pipe_is_an_error() {
        let err = Parser::parse("$x.upper()").unwrap_err();
        assert_eq!(err.error_id, "RILL-P007");
    }

    #[test]
    fn recovery_mode_collects_multiple_errors() {
        let src = "1 + \n2 -> .foo(\n3 + 4";
        let (script, errors) = Parser::parse_recovering(src);
        assert!(script.is_ok());
        assert!(!errors.is_empty());
    }

    #[test]
    fn frontmatter_is_preserved_on_script() {
        let script = parse_ok("---\nuse: demo\n---\n1 + 1");
        assert_eq!(script.frontmatter.as_deref(), Some("use: demo"));
    }
}
