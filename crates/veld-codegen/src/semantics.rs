//! Semantic checking.
//!
//! Runs before codegen so both emission passes only ever see clean
//! programs. User errors accumulate in the sink (undefined variable,
//! immutable reassignment, duplicate binding, misplaced control flow);
//! none of them abort the walk, so one run reports several.

use rustc_hash::FxHashMap;
use veld_parser::ast::{Expr, ExprKind, Program, Stmt, StmtKind};
use veld_parser::diag::{DiagKind, ErrorSink};
use veld_parser::Span;

/// Builtin callables the back end lowers directly.
pub const BUILTINS: [&str; 3] = ["println", "print", "sqrt"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NameKind {
    Value { mutable: bool },
    Func { params: usize },
}

struct Checker<'a> {
    sink: &'a mut ErrorSink,
    scopes: Vec<FxHashMap<String, NameKind>>,
    /// Names importable through the dynamic linker.
    has_imports: bool,
    loop_depth: usize,
    lambda_depth: usize,
    /// Nesting depth below the top level (blocks, loop bodies).
    block_depth: usize,
    /// Scopes hidden by the lambda being checked, kept for the
    /// capture diagnostic.
    hidden: Vec<Vec<FxHashMap<String, NameKind>>>,
}

/// Check a program; semantic diagnostics land in `sink`.
pub fn check(program: &Program, sink: &mut ErrorSink) {
    let mut checker = Checker {
        sink,
        scopes: vec![FxHashMap::default()],
        has_imports: !program.imports.is_empty(),
        loop_depth: 0,
        lambda_depth: 0,
        block_depth: 0,
        hidden: Vec::new(),
    };
    // Pre-declare top-level function bindings so forward and recursive
    // calls resolve; duplicates are caught here, before the walk treats
    // the second occurrence as a legitimate revisit.
    for stmt in &program.stmts {
        if let StmtKind::Bind {
            name,
            value,
            mutable: false,
        } = &stmt.kind
        {
            if let ExprKind::Lambda { params, .. } = &value.kind {
                let kind = NameKind::Func {
                    params: params.len(),
                };
                if checker.scopes[0].insert(name.clone(), kind).is_some() {
                    checker.sink.error(
                        DiagKind::Semantic,
                        stmt.span,
                        format!("binding `{name}` already exists"),
                    );
                }
            }
        }
    }
    for stmt in &program.stmts {
        checker.stmt(stmt);
    }
}

impl Checker<'_> {
    fn declare(&mut self, name: &str, kind: NameKind, span: Span) {
        // Shadowing is rejected across all visible scopes, not just the
        // innermost: the back end keys register homes by name, so two
        // live bindings may never share one.
        if self.lookup(name).is_some() {
            // Pre-declared functions are being revisited, not
            // redeclared; duplicates were reported during
            // pre-declaration.
            if matches!(kind, NameKind::Func { .. })
                && self.scopes[0].get(name) == Some(&kind)
            {
                return;
            }
            self.sink.error_with_suggestion(
                DiagKind::Semantic,
                span,
                format!("binding `{name}` already exists"),
                "use a different name, or `<-` to assign the existing binding",
            );
            return;
        }
        self.scopes
            .last_mut()
            .expect("scope stack is never empty")
            .insert(name.to_string(), kind);
    }

    fn lookup(&self, name: &str) -> Option<NameKind> {
        self.scopes.iter().rev().find_map(|s| s.get(name)).copied()
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Bind {
                name,
                value,
                mutable,
            } => {
                self.expr(value);
                let kind = match &value.kind {
                    ExprKind::Lambda { params, .. } if !mutable => {
                        // Functions become text labels; only top-level
                        // bindings are collected into the function table.
                        if self.block_depth > 0 || self.lambda_depth > 0 {
                            self.sink.error(
                                DiagKind::Semantic,
                                stmt.span,
                                format!("function `{name}` must be bound at the top level"),
                            );
                        }
                        NameKind::Func {
                            params: params.len(),
                        }
                    }
                    _ => NameKind::Value { mutable: *mutable },
                };
                self.declare(name, kind, stmt.span);
            }
            StmtKind::Assign { name, value } => {
                self.expr(value);
                match self.lookup(name) {
                    None => self.sink.error(
                        DiagKind::Semantic,
                        stmt.span,
                        format!("undefined variable `{name}`"),
                    ),
                    Some(NameKind::Value { mutable: false }) | Some(NameKind::Func { .. }) => {
                        self.sink.error_with_suggestion(
                            DiagKind::Semantic,
                            stmt.span,
                            format!("cannot reassign immutable binding `{name}`"),
                            "declare with `:=` to make it mutable",
                        )
                    }
                    Some(NameKind::Value { mutable: true }) => {}
                }
            }
            StmtKind::Loop {
                var, lo, hi, body, ..
            } => {
                self.expr(lo);
                self.expr(hi);
                if self.lookup(var).is_some() {
                    self.sink.error(
                        DiagKind::Semantic,
                        stmt.span,
                        format!("loop variable `{var}` shadows an existing binding"),
                    );
                }
                self.scopes.push(FxHashMap::default());
                self.scopes
                    .last_mut()
                    .unwrap()
                    .insert(var.clone(), NameKind::Value { mutable: true });
                self.loop_depth += 1;
                self.block_depth += 1;
                for s in body {
                    self.stmt(s);
                }
                self.block_depth -= 1;
                self.loop_depth -= 1;
                self.scopes.pop();
            }
            StmtKind::Defer(e) => self.expr(e),
            StmtKind::Ret(value) => {
                if let Some(e) = value {
                    self.expr(e);
                }
                if self.lambda_depth == 0 {
                    self.sink.error(
                        DiagKind::Semantic,
                        stmt.span,
                        "`ret` outside a lambda".to_string(),
                    );
                }
            }
            StmtKind::Break | StmtKind::Continue => {
                if self.loop_depth == 0 {
                    self.sink.error(
                        DiagKind::Semantic,
                        stmt.span,
                        "`break`/`continue` outside a loop".to_string(),
                    );
                }
            }
            StmtKind::Import(_) => {}
            StmtKind::Expr(e) => self.expr(e),
        }
    }

    fn expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Number(_) | ExprKind::Str(_) => {}
            ExprKind::Ident(name) => {
                if self.lookup(name).is_none() {
                    let captured = self
                        .hidden
                        .iter()
                        .flatten()
                        .any(|scope| scope.contains_key(name));
                    if captured {
                        self.sink.error_with_suggestion(
                            DiagKind::Semantic,
                            expr.span,
                            format!("lambda cannot capture `{name}` from an enclosing scope"),
                            "pass the value as a parameter instead",
                        );
                    } else {
                        self.sink.error(
                            DiagKind::Semantic,
                            expr.span,
                            format!("undefined variable `{name}`"),
                        );
                    }
                }
            }
            ExprKind::Binary { lhs, rhs, .. } | ExprKind::OrElse { lhs, rhs } => {
                self.expr(lhs);
                self.expr(rhs);
            }
            ExprKind::Unary { expr: inner, .. } => self.expr(inner),
            ExprKind::Call { callee, args } => {
                for a in args {
                    self.expr(a);
                }
                match callee.as_ident() {
                    Some(name)
                        if BUILTINS.contains(&name) && self.lookup(name).is_none() =>
                    {
                        if args.len() != 1 {
                            self.sink.error(
                                DiagKind::Semantic,
                                expr.span,
                                format!("`{name}` takes 1 argument, {} given", args.len()),
                            );
                        }
                    }
                    Some(name) => match self.lookup(name) {
                        Some(NameKind::Func { params }) => {
                            if params != args.len() {
                                self.sink.error(
                                    DiagKind::Semantic,
                                    expr.span,
                                    format!(
                                        "`{name}` takes {params} argument{}, {} given",
                                        if params == 1 { "" } else { "s" },
                                        args.len()
                                    ),
                                );
                            }
                        }
                        Some(NameKind::Value { .. }) => self.sink.error(
                            DiagKind::Semantic,
                            expr.span,
                            format!("`{name}` is not callable"),
                        ),
                        // Unknown names become dynamic imports when an
                        // `import` declaration is in scope.
                        None if self.has_imports => {}
                        None => self.sink.error_with_suggestion(
                            DiagKind::Semantic,
                            expr.span,
                            format!("undefined function `{name}`"),
                            "add an `import \"...\"` declaration to call library functions",
                        ),
                    },
                    None => self.sink.error(
                        DiagKind::Semantic,
                        expr.span,
                        "only named functions can be called".to_string(),
                    ),
                }
            }
            ExprKind::Lambda { params, body } => {
                // A lambda body sees only global function names and its
                // own parameters. Frame-resident variables of enclosing
                // scopes are not reachable from a fresh frame.
                let global_funcs: FxHashMap<String, NameKind> = self.scopes[0]
                    .iter()
                    .filter(|(_, k)| matches!(k, NameKind::Func { .. }))
                    .map(|(n, k)| (n.clone(), *k))
                    .collect();
                let mut param_scope = FxHashMap::default();
                for p in params {
                    param_scope.insert(p.clone(), NameKind::Value { mutable: true });
                }
                let saved =
                    std::mem::replace(&mut self.scopes, vec![global_funcs, param_scope]);
                self.hidden.push(saved);
                self.lambda_depth += 1;
                let saved_loops = std::mem::take(&mut self.loop_depth);
                self.expr(body);
                self.loop_depth = saved_loops;
                self.lambda_depth -= 1;
                self.scopes = self.hidden.pop().expect("pushed above");
            }
            ExprKind::Block(stmts) => {
                self.scopes.push(FxHashMap::default());
                self.block_depth += 1;
                for s in stmts {
                    self.stmt(s);
                }
                self.block_depth -= 1;
                self.scopes.pop();
            }
            ExprKind::Match {
                scrutinee,
                arms,
                default,
            } => {
                self.expr(scrutinee);
                for arm in arms {
                    if !is_literal_pattern(&arm.pattern) {
                        self.sink.error(
                            DiagKind::Semantic,
                            arm.pattern.span,
                            "match patterns must be number literals".to_string(),
                        );
                    }
                    self.expr(&arm.body);
                }
                if let Some(d) = default {
                    self.expr(d);
                }
            }
        }
    }
}

fn is_literal_pattern(pattern: &Expr) -> bool {
    match &pattern.kind {
        ExprKind::Number(_) => true,
        ExprKind::Unary { expr: inner, .. } => matches!(inner.kind, ExprKind::Number(_)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veld_parser::{lex, parse};

    fn diags(src: &str) -> Vec<String> {
        let program = parse(lex(src).unwrap()).unwrap();
        let mut sink = ErrorSink::default();
        check(&program, &mut sink);
        sink.diags().iter().map(|d| d.message.clone()).collect()
    }

    #[test]
    fn test_clean_program() {
        assert!(diags("x := 1\nx <- x + 1\nprintln(x)").is_empty());
    }

    #[test]
    fn test_undefined_variable() {
        let d = diags("println(nope)");
        assert_eq!(d, ["undefined variable `nope`"]);
    }

    #[test]
    fn test_immutable_reassignment_suggests_walrus() {
        let program = parse(lex("x = 1\nx <- 2").unwrap()).unwrap();
        let mut sink = ErrorSink::default();
        check(&program, &mut sink);
        let diag = &sink.diags()[0];
        assert!(diag.message.contains("immutable"));
        assert_eq!(
            diag.suggestion.as_deref(),
            Some("declare with `:=` to make it mutable")
        );
    }

    #[test]
    fn test_duplicate_binding() {
        let d = diags("x = 1\nx = 2");
        assert_eq!(d.len(), 1);
        assert!(d[0].contains("already exists"));
    }

    #[test]
    fn test_break_outside_loop() {
        assert!(diags("break")[0].contains("outside a loop"));
    }

    #[test]
    fn test_recursive_function_resolves() {
        assert!(diags("fact = n -> n { 0 => 1; ~> n * fact(n - 1) }").is_empty());
    }

    #[test]
    fn test_unknown_call_without_imports() {
        let d = diags("sin(1)");
        assert!(d[0].contains("undefined function"));
    }

    #[test]
    fn test_unknown_call_with_imports_is_external() {
        assert!(diags("import \"libc.so.6\"\nsin(1)").is_empty());
    }

    #[test]
    fn test_arity_mismatch() {
        let d = diags("f = (a, b) -> a + b\nf(1)");
        assert!(d[0].contains("takes 2 arguments"));
    }

    #[test]
    fn test_lambda_cannot_capture_locals() {
        let d = diags("x = 1\nf = n -> n + x");
        assert!(d[0].contains("cannot capture `x`"));
        // Global functions stay visible.
        assert!(diags("g = n -> n\nf = n -> g(n)").is_empty());
    }

    #[test]
    fn test_multiple_errors_accumulate() {
        let d = diags("a <- 1\nb <- 2\nc <- 3");
        assert_eq!(d.len(), 3);
    }

    #[test]
    fn test_shadowing_rejected_across_scopes() {
        let d = diags("x = 1\n@ i in 1..3 { x = 2 }");
        assert!(d[0].contains("already exists"));
        let d = diags("i = 1\n@ i in 1..3 { println(i) }");
        assert!(d[0].contains("shadows an existing binding"));
    }

    #[test]
    fn test_nested_function_binding_rejected() {
        let d = diags("x = { g = n -> n\ng(1) }");
        assert!(d[0].contains("top level"));
    }

    #[test]
    fn test_duplicate_function_rejected() {
        let d = diags("f = n -> n\nf = n -> n + 1");
        assert!(d[0].contains("already exists"));
    }

    #[test]
    fn test_non_literal_match_pattern_rejected() {
        let d = diags("y = 1\nx = 2 { y => 3; ~> 4 }");
        assert!(d[0].contains("number literals"));
        assert!(diags("x = 2 { -1 => 3; 0.5 => 4; ~> 5 }").is_empty());
    }
}
