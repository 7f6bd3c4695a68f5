// ABOUTME: Lexer turning Rill source text into a flat stream of spanned tokens.
// Hand-tracked line/column/offset position and escape handling; every token
// carries a span, since the parser needs them for error recovery and the
// evaluator's structured error shape.

use crate::error::{Location, RillError};

/// How many columns a tab advances the cursor by, for position reporting.
const TAB_WIDTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: Location,
    pub end: Location,
}

impl Span {
    pub fn point(loc: Location) -> Self {
        Span {
            start: loc,
            end: loc,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StringPart {
    Literal(String),
    /// Raw, not-yet-parsed source text of a `{...}` interpolation.
    Interp(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Number(f64),
    Str(Vec<StringPart>),
    TripleStr(String),
    Ident(String),
    True,
    False,

    // Keywords
    Each,
    Map,
    Fold,
    Filter,
    Break,
    Return,
    Assert,
    Error,
    Pass,

    // Type names
    TyString,
    TyNumber,
    TyBool,
    TyClosure,
    TyList,
    TyDict,
    TyTuple,

    // Punctuation / operators
    Arrow,        // ->
    CaptureArrow, // =>
    CaptureColon, // :>
    Coalesce,     // ??
    ExistQ,       // .?
    AnnotAt,      // .^
    Caret,        // ^
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Dot,
    ColonColon, // ::
    Colon,
    Eq,      // =
    EqEq,    // ==
    NotEq,   // !=
    Lt,
    Gt,
    Le,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    AndAnd, // &&
    OrOr,   // ||
    Bang,   // !
    Question,
    Ellipsis, // ...
    Pipe,   // |
    Dollar, // $
    DollarAt, // $@ (lexed, undefined grammar production - see DESIGN.md)
    SliceOpen,  // /<
    DestructureOpen, // *<
    At,     // @
    Amp,    // &

    Newline,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub span: Span,
}

pub struct Lexer<'a> {
    src: &'a str,
    chars: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
    offset: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Lexer {
            src,
            chars: src.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            offset: 0,
        }
    }

    fn loc(&self) -> Location {
        Location {
            line: self.line,
            column: self.col,
            offset: self.offset,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.chars.get(self.pos + n).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        self.offset += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else if c == '\t' {
            self.col += TAB_WIDTH;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn bump_if(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Entry point: frontmatter (if any) is stripped and returned separately,
    /// the body is tokenized into a flat stream terminated by `Eof`.
    pub fn lex(src: &'a str) -> Result<(Option<String>, Vec<Token>), RillError> {
        let (frontmatter, body) = split_frontmatter(src);
        let mut lexer = Lexer::new(body);
        let tokens = lexer.tokenize()?;
        Ok((frontmatter, tokens))
    }

    fn tokenize(&mut self) -> Result<Vec<Token>, RillError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_ws_and_comments(&mut tokens);
            let start = self.loc();
            let Some(c) = self.peek() else {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    text: String::new(),
                    span: Span::point(start),
                });
                break;
            };

            let tok = if c.is_ascii_digit() || (c == '.' && self.peek_at(1).is_some_and(|d| d.is_ascii_digit())) {
                self.lex_number(start)?
            } else if c == '"' {
                if self.peek_at(1) == Some('"') && self.peek_at(2) == Some('"') {
                    self.lex_triple_string(start)?
                } else {
                    self.lex_string(start)?
                }
            } else if c.is_alphabetic() || c == '_' {
                self.lex_ident(start)
            } else if c == '<' && self.peek_at(1) == Some('<') {
                // `<<EOF` heredoc syntax was removed.
                return Err(RillError::removed_heredoc(start));
            } else {
                self.lex_operator(start)?
            };
            tokens.push(tok);
        }
        Ok(tokens)
    }

    fn skip_ws_and_comments(&mut self, tokens: &mut Vec<Token>) {
        loop {
            match self.peek() {
                Some(' ') | Some('\t') | Some('\r') => {
                    self.advance();
                }
                Some('\n') => {
                    let start = self.loc();
                    self.advance();
                    tokens.push(Token {
                        kind: TokenKind::Newline,
                        text: "\n".to_string(),
                        span: Span::point(start),
                    });
                }
                Some('#') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn lex_number(&mut self, start: Location) -> Result<Token, RillError> {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) {
            text.push('.');
            self.advance();
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    text.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
        }
        let n: f64 = text
            .parse()
            .map_err(|_| RillError::unexpected_char('?', start))?;
        Ok(Token {
            kind: TokenKind::Number(n),
            text,
            span: Span {
                start,
                end: self.loc(),
            },
        })
    }

    fn lex_ident(&mut self, start: Location) -> Token {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            let is_kebab_dash = c == '-'
                && self
                    .peek_at(1)
                    .is_some_and(|next| next.is_alphanumeric() || next == '_');
            if c.is_alphanumeric() || c == '_' || is_kebab_dash {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        let kind = match text.as_str() {
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "each" => TokenKind::Each,
            "map" => TokenKind::Map,
            "fold" => TokenKind::Fold,
            "filter" => TokenKind::Filter,
            "break" => TokenKind::Break,
            "return" => TokenKind::Return,
            "assert" => TokenKind::Assert,
            "error" => TokenKind::Error,
            "pass" => TokenKind::Pass,
            "string" => TokenKind::TyString,
            "number" => TokenKind::TyNumber,
            "bool" => TokenKind::TyBool,
            "closure" => TokenKind::TyClosure,
            "list" => TokenKind::TyList,
            "dict" => TokenKind::TyDict,
            "tuple" => TokenKind::TyTuple,
            _ => TokenKind::Ident(text.clone()),
        };
        Token {
            kind,
            text,
            span: Span {
                start,
                end: self.loc(),
            },
        }
    }

    fn lex_string(&mut self, start: Location) -> Result<Token, RillError> {
        self.advance(); // opening quote
        let mut parts = Vec::new();
        let mut literal = String::new();
        loop {
            match self.peek() {
                None => return Err(RillError::unterminated_string(start)),
                Some('"') => {
                    self.advance();
                    break;
                }
                Some('\\') => {
                    self.advance();
                    match self.advance() {
                        Some('n') => literal.push('\n'),
                        Some('t') => literal.push('\t'),
                        Some('\\') => literal.push('\\'),
                        Some('"') => literal.push('"'),
                        Some('{') => literal.push('{'),
                        Some(other) => {
                            literal.push('\\');
                            literal.push(other);
                        }
                        None => return Err(RillError::unterminated_string(start)),
                    }
                }
                Some('{') => {
                    if !literal.is_empty() {
                        parts.push(StringPart::Literal(std::mem::take(&mut literal)));
                    }
                    self.advance();
                    let mut depth = 1usize;
                    let mut raw = String::new();
                    loop {
                        match self.peek() {
                            None => return Err(RillError::unterminated_string(start)),
                            Some('{') => {
                                depth += 1;
                                raw.push('{');
                                self.advance();
                            }
                            Some('}') => {
                                depth -= 1;
                                self.advance();
                                if depth == 0 {
                                    break;
                                }
                                raw.push('}');
                            }
                            Some(c) => {
                                raw.push(c);
                                self.advance();
                            }
                        }
                    }
                    parts.push(StringPart::Interp(raw));
                }
                Some(c) => {
                    literal.push(c);
                    self.advance();
                }
            }
        }
        if !literal.is_empty() || parts.is_empty() {
            parts.push(StringPart::Literal(literal));
        }
        let end = self.loc();
        Ok(Token {
            kind: TokenKind::Str(parts),
            text: String::new(),
            span: Span { start, end },
        })
    }

    fn lex_triple_string(&mut self, start: Location) -> Result<Token, RillError> {
        self.advance();
        self.advance();
        self.advance();
        let mut content = String::new();
        loop {
            if self.peek() == Some('"') && self.peek_at(1) == Some('"') && self.peek_at(2) == Some('"') {
                self.advance();
                self.advance();
                self.advance();
                break;
            }
            match self.advance() {
                Some(c) => content.push(c),
                None => return Err(RillError::unterminated_string(start)),
            }
        }
        let end = self.loc();
        Ok(Token {
            kind: TokenKind::TripleStr(content),
            text: String::new(),
            span: Span { start, end },
        })
    }

    fn lex_operator(&mut self, start: Location) -> Result<Token, RillError> {
        let c = self.advance().unwrap();
        let (kind, extra) = match c {
            '-' if self.bump_if('>') => (TokenKind::Arrow, ""),
            '=' if self.bump_if('>') => (TokenKind::CaptureArrow, ""),
            ':' if self.bump_if('>') => (TokenKind::CaptureColon, ""),
            '?' if self.bump_if('?') => (TokenKind::Coalesce, ""),
            '.' if self.peek() == Some('?') => {
                self.advance();
                (TokenKind::ExistQ, "")
            }
            '.' if self.peek() == Some('^') => {
                self.advance();
                (TokenKind::AnnotAt, "")
            }
            '.' if self.peek() == Some('.') && self.peek_at(1) == Some('.') => {
                self.advance();
                self.advance();
                (TokenKind::Ellipsis, "")
            }
            '.' => (TokenKind::Dot, ""),
            '^' => (TokenKind::Caret, ""),
            '(' => (TokenKind::LParen, ""),
            ')' => (TokenKind::RParen, ""),
            '[' => (TokenKind::LBracket, ""),
            ']' => (TokenKind::RBracket, ""),
            '{' => (TokenKind::LBrace, ""),
            '}' => (TokenKind::RBrace, ""),
            ',' => (TokenKind::Comma, ""),
            ':' if self.bump_if(':') => (TokenKind::ColonColon, ""),
            ':' => (TokenKind::Colon, ""),
            '=' if self.bump_if('=') => (TokenKind::EqEq, ""),
            '=' => (TokenKind::Eq, ""),
            '!' if self.bump_if('=') => (TokenKind::NotEq, ""),
            '!' => (TokenKind::Bang, ""),
            '<' if self.bump_if('=') => (TokenKind::Le, ""),
            '<' => (TokenKind::Lt, ""),
            '>' if self.bump_if('=') => (TokenKind::Ge, ""),
            '>' => (TokenKind::Gt, ""),
            '+' => (TokenKind::Plus, ""),
            '-' => (TokenKind::Minus, ""),
            '&' if self.bump_if('&') => (TokenKind::AndAnd, ""),
            '&' => (TokenKind::Amp, ""),
            '|' if self.bump_if('|') => (TokenKind::OrOr, ""),
            '|' => (TokenKind::Pipe, ""),
            '*' if self.bump_if('<') => (TokenKind::DestructureOpen, ""),
            '*' => (TokenKind::Star, ""),
            '/' if self.bump_if('<') => (TokenKind::SliceOpen, ""),
            '/' => (TokenKind::Slash, ""),
            '$' if self.bump_if('@') => (TokenKind::DollarAt, ""),
            '$' => (TokenKind::Dollar, ""),
            '@' => (TokenKind::At, ""),
            '?' => (TokenKind::Question, ""),
            other => return Err(RillError::unexpected_char(other, start)),
        };
        let _ = extra;
        let end = self.loc();
        Ok(Token {
            kind,
            text: self.src[start.offset..end.offset].to_string(),
            span: Span { start, end },
        })
    }
}

/// Splits an optional leading `---\n ... \n---` frontmatter block off the
/// front of the source. The interior is returned trimmed and verbatim; the
/// core never interprets it as YAML, JSON, or anything else.
fn split_frontmatter(src: &str) -> (Option<String>, &str) {
    let trimmed_start = src.trim_start_matches(['\u{feff}']);
    if let Some(rest) = trimmed_start.strip_prefix("---") {
        let rest = rest.strip_prefix('\n').unwrap_or(rest);
        if let Some(end) = rest.find("\n---") {
            let body_start = end + "\n---".len();
            let after = &rest[body_start..];
            let after = after.strip_prefix('\n').unwrap_or(after);
            return (Some(rest[..end].trim().to_string()), after);
        }
    }
    (None, src)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let (_, toks) = Lexer::lex(src).unwrap();
        toks.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lexes_numbers() {
        assert_eq!(kinds("42"), vec![TokenKind::Number(42.0), TokenKind::Eof]);
        assert_eq!(
            kinds("3.14"),
            vec![TokenKind::Number(3.14), TokenKind::Eof]
        );
    }

    #[test]
    fn lexes_pipe_and_capture() {
        assert_eq!(
            kinds("-> => :>"),
            vec![
                TokenKind::Arrow,
                TokenKind::CaptureArrow,
                TokenKind::CaptureColon,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn lexes_string_interpolation() {
        let (_, toks) = Lexer::lex(r#""hi {name}!""#).unwrap();
        match &toks[0].kind {
            TokenKind::Str(parts) => {
                assert_eq!(
                    parts,
                    &vec![
                        StringPart::Literal("hi ".to_string()),
                        StringPart::Interp("name".to_string()),
                        StringPart::Literal("!".to_string()),
                    ]
                );
            }
            other => panic!("expected Str token, got {other:?}"),
        }
    }

    #[test]
    fn unterminated_string_errors() {
        let err = Lexer::lex("\"abc").unwrap_err();
        assert_eq!(err.error_id, "RILL-L001");
    }

    #[test]
    fn heredoc_is_rejected_with_hint() {
        let err = Lexer::lex("<<EOF\nhi\nEOF").unwrap_err();
        assert_eq!(err.error_id, "RILL-L003");
    }

    #[test]
    fn frontmatter_is_split_off_verbatim() {
        let (fm, toks) = Lexer::lex("---\nuse: foo\n---\n42").unwrap();
        assert_eq!(fm.as_deref(), Some("use: foo"));
        assert_eq!(toks[0].kind, TokenKind::Number(42.0));
    }

    #[test]
    fn newline_is_a_distinct_token() {
        let (_, toks) = Lexer::lex("1\n2").unwrap();
        assert!(matches!(toks[1].kind, TokenKind::Newline));
    }

    #[test]
    fn kebab_case_ident_joins_dash_between_alphanumerics() {
        assert_eq!(
            kinds("my-var"),
            vec![TokenKind::Ident("my-var".to_string()), TokenKind::Eof]
        );
    }

    #[test]
    fn trailing_dash_is_not_folded_into_identifier() {
        assert_eq!(
            kinds("$a-$b"),
            vec![
                TokenKind::Dollar,
                TokenKind::Ident("a".to_string()),
                TokenKind::Minus,
                TokenKind::Dollar,
                TokenKind::Ident("b".to_string()),
                TokenKind::Eof,
            ]
        );
    }
}
