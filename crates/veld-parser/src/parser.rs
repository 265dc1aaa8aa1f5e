//! Recursive-descent parser.
//!
//! Statements are separated by newlines or semicolons. On a syntax error
//! the parser records a diagnostic and resynchronizes at the next
//! statement separator, so one run can report several errors.

use crate::ast::{BinOp, Expr, ExprKind, MatchArm, Program, Stmt, StmtKind, UnOp};
use crate::token::{Span, Token};
use thiserror::Error;

/// A syntax error with its source span.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ParseError {
    pub message: String,
    pub span: Span,
    pub suggestion: Option<String>,
}

pub struct Parser {
    tokens: Vec<(Token, Span)>,
    pos: usize,
    errors: Vec<ParseError>,
    /// Cleared while parsing loop bounds so the loop body's brace is not
    /// taken as a match block on the bound expression.
    allow_match: bool,
}

/// Parse a token stream into a program; returns every syntax error found.
pub fn parse(tokens: Vec<(Token, Span)>) -> Result<Program, Vec<ParseError>> {
    let mut parser = Parser {
        tokens,
        pos: 0,
        errors: Vec::new(),
        allow_match: true,
    };
    let program = parser.program();
    if parser.errors.is_empty() {
        Ok(program)
    } else {
        Err(parser.errors)
    }
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset).map(|(t, _)| t)
    }

    fn span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .map(|(_, s)| *s)
            .unwrap_or_else(|| {
                self.tokens
                    .last()
                    .map(|(_, s)| Span::new(s.end, s.end))
                    .unwrap_or_default()
            })
    }

    fn bump(&mut self) -> Option<(Token, Span)> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> Result<Span, ParseError> {
        if let Some((t, s)) = self.tokens.get(self.pos) {
            if t == token {
                let s = *s;
                self.pos += 1;
                return Ok(s);
            }
            return Err(ParseError {
                message: format!("expected `{token}`, found `{t}`"),
                span: *s,
                suggestion: None,
            });
        }
        Err(ParseError {
            message: format!("expected `{token}`, found end of input"),
            span: self.span(),
            suggestion: None,
        })
    }

    fn skip_separators(&mut self) {
        while matches!(self.peek(), Some(Token::Newline | Token::Semi)) {
            self.pos += 1;
        }
    }

    /// Skip to the next statement separator after an error.
    fn recover(&mut self) {
        while let Some(t) = self.peek() {
            if matches!(t, Token::Newline | Token::Semi) {
                return;
            }
            self.pos += 1;
        }
    }

    fn program(&mut self) -> Program {
        let mut program = Program::default();
        self.skip_separators();
        while self.peek().is_some() {
            match self.stmt() {
                Ok(stmt) => {
                    if let StmtKind::Import(lib) = &stmt.kind {
                        program.imports.push(lib.clone());
                    }
                    program.stmts.push(stmt);
                }
                Err(err) => {
                    self.errors.push(err);
                    self.recover();
                }
            }
            self.skip_separators();
        }
        program
    }

    fn stmt(&mut self) -> Result<Stmt, ParseError> {
        let start = self.span();
        match self.peek() {
            Some(Token::Import) => {
                self.bump();
                match self.bump() {
                    Some((Token::Str(lib), end)) => Ok(Stmt {
                        kind: StmtKind::Import(lib),
                        span: start.to(end),
                    }),
                    other => Err(ParseError {
                        message: "expected a library name string after `import`".into(),
                        span: other.map(|(_, s)| s).unwrap_or(start),
                        suggestion: Some("write `import \"libc.so.6\"`".into()),
                    }),
                }
            }
            Some(Token::Defer) => {
                self.bump();
                let expr = self.expr()?;
                let span = start.to(expr.span);
                Ok(Stmt {
                    kind: StmtKind::Defer(expr),
                    span,
                })
            }
            Some(Token::Ret) => {
                self.bump();
                if matches!(
                    self.peek(),
                    None | Some(Token::Newline | Token::Semi | Token::RBrace)
                ) {
                    Ok(Stmt {
                        kind: StmtKind::Ret(None),
                        span: start,
                    })
                } else {
                    let expr = self.expr()?;
                    let span = start.to(expr.span);
                    Ok(Stmt {
                        kind: StmtKind::Ret(Some(expr)),
                        span,
                    })
                }
            }
            Some(Token::Break) => {
                self.bump();
                Ok(Stmt {
                    kind: StmtKind::Break,
                    span: start,
                })
            }
            Some(Token::Continue) => {
                self.bump();
                Ok(Stmt {
                    kind: StmtKind::Continue,
                    span: start,
                })
            }
            Some(Token::At | Token::AtAt) => self.loop_stmt(),
            Some(Token::Ident(_))
                if matches!(
                    self.peek_at(1),
                    Some(Token::Eq | Token::ColonEq | Token::LeftArrow)
                ) =>
            {
                let (name, _) = match self.bump() {
                    Some((Token::Ident(name), s)) => (name, s),
                    _ => unreachable!(),
                };
                let op = self.bump().expect("peeked").0;
                let value = self.expr()?;
                let span = start.to(value.span);
                let kind = match op {
                    Token::Eq => StmtKind::Bind {
                        name,
                        value,
                        mutable: false,
                    },
                    Token::ColonEq => StmtKind::Bind {
                        name,
                        value,
                        mutable: true,
                    },
                    _ => StmtKind::Assign { name, value },
                };
                Ok(Stmt { kind, span })
            }
            Some(_) => {
                let expr = self.expr()?;
                let span = expr.span;
                Ok(Stmt {
                    kind: StmtKind::Expr(expr),
                    span,
                })
            }
            None => Err(ParseError {
                message: "unexpected end of input".into(),
                span: start,
                suggestion: None,
            }),
        }
    }

    fn loop_stmt(&mut self) -> Result<Stmt, ParseError> {
        let start = self.span();
        let parallel = matches!(self.peek(), Some(Token::AtAt));
        self.bump();
        let var = match self.bump() {
            Some((Token::Ident(name), _)) => name,
            other => {
                return Err(ParseError {
                    message: "expected a loop variable after `@`".into(),
                    span: other.map(|(_, s)| s).unwrap_or(start),
                    suggestion: Some("write `@ i in 1..10 { .. }`".into()),
                })
            }
        };
        self.expect(&Token::In)?;
        let was = std::mem::replace(&mut self.allow_match, false);
        let lo = self.expr()?;
        self.expect(&Token::DotDot)?;
        let hi = self.expr()?;
        self.allow_match = was;
        let body = self.braced_stmts()?;
        let span = start.to(self.prev_span());
        Ok(Stmt {
            kind: StmtKind::Loop {
                var,
                lo,
                hi,
                body,
                parallel,
            },
            span,
        })
    }

    fn prev_span(&self) -> Span {
        self.tokens
            .get(self.pos.saturating_sub(1))
            .map(|(_, s)| *s)
            .unwrap_or_default()
    }

    fn braced_stmts(&mut self) -> Result<Vec<Stmt>, ParseError> {
        self.expect(&Token::LBrace)?;
        let mut stmts = Vec::new();
        self.skip_separators();
        while !matches!(self.peek(), Some(Token::RBrace) | None) {
            stmts.push(self.stmt()?);
            self.skip_separators();
        }
        self.expect(&Token::RBrace)?;
        Ok(stmts)
    }

    // ── Expressions ──────────────────────────────────────────────────

    fn expr(&mut self) -> Result<Expr, ParseError> {
        self.or_else_expr()
    }

    fn or_else_expr(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.cmp_expr()?;
        while self.eat(&Token::OrBang) {
            let rhs = self.cmp_expr()?;
            let span = lhs.span.to(rhs.span);
            lhs = Expr::new(
                ExprKind::OrElse {
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                span,
            );
        }
        Ok(lhs)
    }

    fn cmp_expr(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.add_expr()?;
        let op = match self.peek() {
            Some(Token::EqEq) => BinOp::Eq,
            Some(Token::BangEq) => BinOp::Ne,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Le) => BinOp::Le,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Ge) => BinOp::Ge,
            _ => return Ok(lhs),
        };
        self.bump();
        let rhs = self.add_expr()?;
        let span = lhs.span.to(rhs.span);
        Ok(Expr::new(
            ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            span,
        ))
    }

    fn add_expr(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.mul_expr()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.bump();
            let rhs = self.mul_expr()?;
            let span = lhs.span.to(rhs.span);
            lhs = Expr::new(
                ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                span,
            );
        }
    }

    fn mul_expr(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.unary_expr()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => return Ok(lhs),
            };
            self.bump();
            let rhs = self.unary_expr()?;
            let span = lhs.span.to(rhs.span);
            lhs = Expr::new(
                ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                span,
            );
        }
    }

    fn unary_expr(&mut self) -> Result<Expr, ParseError> {
        if self.peek() == Some(&Token::Minus) {
            let start = self.span();
            self.bump();
            let expr = self.unary_expr()?;
            let span = start.to(expr.span);
            return Ok(Expr::new(
                ExprKind::Unary {
                    op: UnOp::Neg,
                    expr: Box::new(expr),
                },
                span,
            ));
        }
        self.postfix_expr()
    }

    fn postfix_expr(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.primary_expr()?;
        loop {
            match self.peek() {
                Some(Token::LParen) => {
                    self.bump();
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.expr()?);
                            if !self.eat(&Token::Comma) {
                                break;
                            }
                        }
                    }
                    let end = self.expect(&Token::RParen)?;
                    let span = expr.span.to(end);
                    expr = Expr::new(
                        ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                        },
                        span,
                    );
                }
                // A brace directly after an expression opens a match
                // block; newlines break the association.
                Some(Token::LBrace) if self.allow_match => {
                    expr = self.match_block(expr)?;
                }
                _ => return Ok(expr),
            }
        }
    }

    fn match_block(&mut self, scrutinee: Expr) -> Result<Expr, ParseError> {
        self.expect(&Token::LBrace)?;
        let mut arms = Vec::new();
        let mut default = None;
        self.skip_separators();
        while !matches!(self.peek(), Some(Token::RBrace) | None) {
            if self.eat(&Token::TildeArrow) {
                let body = self.expr()?;
                if default.replace(Box::new(body)).is_some() {
                    return Err(ParseError {
                        message: "match block has more than one `~>` arm".into(),
                        span: self.prev_span(),
                        suggestion: None,
                    });
                }
            } else {
                let pattern = self.expr()?;
                self.expect(&Token::FatArrow)?;
                let body = self.expr()?;
                arms.push(MatchArm { pattern, body });
            }
            self.skip_separators();
        }
        let end = self.expect(&Token::RBrace)?;
        let span = scrutinee.span.to(end);
        Ok(Expr::new(
            ExprKind::Match {
                scrutinee: Box::new(scrutinee),
                arms,
                default,
            },
            span,
        ))
    }

    /// True when a parenthesized parameter list followed by `->` starts
    /// at the current position.
    fn at_paren_lambda(&self) -> bool {
        if self.peek() != Some(&Token::LParen) {
            return false;
        }
        let mut i = 1;
        loop {
            match self.peek_at(i) {
                Some(Token::Ident(_)) | Some(Token::Comma) => i += 1,
                Some(Token::RParen) => return self.peek_at(i + 1) == Some(&Token::Arrow),
                _ => return false,
            }
        }
    }

    fn primary_expr(&mut self) -> Result<Expr, ParseError> {
        let start = self.span();
        // Single-parameter lambda: `n -> body`.
        if matches!(self.peek(), Some(Token::Ident(_))) && self.peek_at(1) == Some(&Token::Arrow)
        {
            let name = match self.bump() {
                Some((Token::Ident(name), _)) => name,
                _ => unreachable!(),
            };
            self.bump(); // ->
            let body = self.expr()?;
            let span = start.to(body.span);
            return Ok(Expr::new(
                ExprKind::Lambda {
                    params: vec![name],
                    body: Box::new(body),
                },
                span,
            ));
        }
        if self.at_paren_lambda() {
            self.bump(); // (
            let mut params = Vec::new();
            while let Some(Token::Ident(_)) = self.peek() {
                match self.bump() {
                    Some((Token::Ident(name), _)) => params.push(name),
                    _ => unreachable!(),
                }
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(&Token::RParen)?;
            self.bump(); // ->
            let body = self.expr()?;
            let span = start.to(body.span);
            return Ok(Expr::new(
                ExprKind::Lambda {
                    params,
                    body: Box::new(body),
                },
                span,
            ));
        }
        match self.bump() {
            Some((Token::Number(n), span)) => Ok(Expr::new(ExprKind::Number(n), span)),
            Some((Token::Str(s), span)) => Ok(Expr::new(ExprKind::Str(s), span)),
            Some((Token::Ident(name), span)) => Ok(Expr::new(ExprKind::Ident(name), span)),
            Some((Token::LParen, _)) => {
                let inner = self.expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some((Token::LBrace, lspan)) => {
                // Block expression.
                let mut stmts = Vec::new();
                self.skip_separators();
                while !matches!(self.peek(), Some(Token::RBrace) | None) {
                    stmts.push(self.stmt()?);
                    self.skip_separators();
                }
                let end = self.expect(&Token::RBrace)?;
                Ok(Expr::new(ExprKind::Block(stmts), lspan.to(end)))
            }
            Some((other, span)) => Err(ParseError {
                message: format!("expected an expression, found `{other}`"),
                span,
                suggestion: None,
            }),
            None => Err(ParseError {
                message: "expected an expression, found end of input".into(),
                span: start,
                suggestion: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;

    fn parse_ok(src: &str) -> Program {
        parse(lex(src).unwrap()).unwrap()
    }

    #[test]
    fn test_literal_binding() {
        let p = parse_ok("main = 42");
        assert_eq!(p.stmts.len(), 1);
        match &p.stmts[0].kind {
            StmtKind::Bind {
                name,
                mutable: false,
                value,
            } => {
                assert_eq!(name, "main");
                assert!(matches!(value.kind, ExprKind::Number(n) if n == 42.0));
            }
            other => panic!("unexpected stmt {other:?}"),
        }
    }

    #[test]
    fn test_mutable_binding_and_assign() {
        let p = parse_ok("sum := 0\nsum <- sum + 1");
        assert!(matches!(
            p.stmts[0].kind,
            StmtKind::Bind { mutable: true, .. }
        ));
        assert!(matches!(p.stmts[1].kind, StmtKind::Assign { .. }));
    }

    #[test]
    fn test_lambda_with_match_body() {
        let p = parse_ok("fact = n -> n { 0 => 1; ~> n * fact(n - 1) }");
        match &p.stmts[0].kind {
            StmtKind::Bind { value, .. } => match &value.kind {
                ExprKind::Lambda { params, body } => {
                    assert_eq!(params, &["n"]);
                    match &body.kind {
                        ExprKind::Match { arms, default, .. } => {
                            assert_eq!(arms.len(), 1);
                            assert!(default.is_some());
                        }
                        other => panic!("expected match, got {other:?}"),
                    }
                }
                other => panic!("expected lambda, got {other:?}"),
            },
            other => panic!("unexpected stmt {other:?}"),
        }
    }

    #[test]
    fn test_block_binding() {
        let p = parse_ok("main = { println(fact(10)) }");
        match &p.stmts[0].kind {
            StmtKind::Bind { value, .. } => {
                assert!(matches!(value.kind, ExprKind::Block(_)));
            }
            other => panic!("unexpected stmt {other:?}"),
        }
    }

    #[test]
    fn test_loop() {
        let p = parse_ok("@ i in 1..10 { sum <- sum + i }");
        match &p.stmts[0].kind {
            StmtKind::Loop {
                var,
                parallel: false,
                body,
                ..
            } => {
                assert_eq!(var, "i");
                assert_eq!(body.len(), 1);
            }
            other => panic!("unexpected stmt {other:?}"),
        }
    }

    #[test]
    fn test_parallel_loop() {
        let p = parse_ok("@@ i in 0..7 { f(i) }");
        assert!(matches!(
            p.stmts[0].kind,
            StmtKind::Loop { parallel: true, .. }
        ));
    }

    #[test]
    fn test_defer_and_or_else() {
        let p = parse_ok("defer println(\"1\")\ny := x or! 99");
        assert!(matches!(p.stmts[0].kind, StmtKind::Defer(_)));
        match &p.stmts[1].kind {
            StmtKind::Bind { value, .. } => {
                assert!(matches!(value.kind, ExprKind::OrElse { .. }));
            }
            other => panic!("unexpected stmt {other:?}"),
        }
    }

    #[test]
    fn test_imports_collected() {
        let p = parse_ok("import \"libc.so.6\"\nmain = 0");
        assert_eq!(p.imports, ["libc.so.6"]);
    }

    #[test]
    fn test_paren_lambda() {
        let p = parse_ok("add = (a, b) -> a + b");
        match &p.stmts[0].kind {
            StmtKind::Bind { value, .. } => match &value.kind {
                ExprKind::Lambda { params, .. } => assert_eq!(params, &["a", "b"]),
                other => panic!("expected lambda, got {other:?}"),
            },
            other => panic!("unexpected stmt {other:?}"),
        }
    }

    #[test]
    fn test_precedence() {
        let p = parse_ok("x = 1 + 2 * 3");
        match &p.stmts[0].kind {
            StmtKind::Bind { value, .. } => match &value.kind {
                ExprKind::Binary { op: BinOp::Add, rhs, .. } => {
                    assert!(matches!(
                        rhs.kind,
                        ExprKind::Binary { op: BinOp::Mul, .. }
                    ));
                }
                other => panic!("expected add at the top, got {other:?}"),
            },
            other => panic!("unexpected stmt {other:?}"),
        }
    }

    #[test]
    fn test_error_recovery_reports_multiple() {
        let errs = parse(lex("x = \ny = 1\nz = )").unwrap()).unwrap_err();
        assert_eq!(errs.len(), 2);
    }

    #[test]
    fn test_match_rejects_two_defaults() {
        let errs = parse(lex("x = n { ~> 1; ~> 2 }").unwrap()).unwrap_err();
        assert_eq!(errs.len(), 1);
    }
}
