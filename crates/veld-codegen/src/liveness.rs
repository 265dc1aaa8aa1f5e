//! Live-interval collection.
//!
//! Walks a function body in the same order the driver emits it,
//! advancing the position counter once per node and recording every
//! definition and use of a named local. Loop back-edges are handled by
//! extending the interval of any variable that was live before the
//! loop and touched inside it to the loop's end, so a register freed
//! mid-body can never be clobbered before the next iteration reads it.

use crate::regalloc::{Interval, IntervalBuilder};
use veld_parser::ast::{Expr, ExprKind, Stmt, StmtKind};

#[derive(Default)]
struct Scan {
    b: IntervalBuilder,
    defers: Vec<Vec<Expr>>,
}

/// Collect intervals for a function body (or the top-level program).
/// `params` are defined at the entry position.
pub fn scan_function(params: &[String], stmts: &[Stmt]) -> Vec<Interval> {
    let mut scan = Scan::default();
    scan.b.step();
    for p in params {
        scan.b.record_def(p);
    }
    scan.defers.push(Vec::new());
    for stmt in stmts {
        scan.stmt(stmt);
    }
    scan.flush_defers();
    scan.b.finish()
}

/// Collect intervals for a lambda whose body is a single expression.
pub fn scan_lambda(params: &[String], body: &Expr) -> Vec<Interval> {
    match &body.kind {
        ExprKind::Block(stmts) => scan_function(params, stmts),
        _ => {
            let mut scan = Scan::default();
            scan.b.step();
            for p in params {
                scan.b.record_def(p);
            }
            scan.defers.push(Vec::new());
            scan.expr(body);
            scan.flush_defers();
            scan.b.finish()
        }
    }
}

impl Scan {
    fn flush_defers(&mut self) {
        let deferred = self.defers.pop().unwrap_or_default();
        for expr in deferred.iter().rev() {
            self.expr(expr);
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Bind { name, value, .. } => {
                // Top-level lambdas and string constants never occupy
                // a register; everything else defines the name.
                match &value.kind {
                    ExprKind::Lambda { .. } | ExprKind::Str(_) => {}
                    _ => {
                        self.expr(value);
                        self.b.step();
                        self.b.record_def(name);
                    }
                }
            }
            StmtKind::Assign { name, value } => {
                self.expr(value);
                self.b.step();
                self.b.record_def(name);
            }
            StmtKind::Loop {
                var, lo, hi, body, ..
            } => {
                self.expr(lo);
                self.expr(hi);
                self.b.step();
                self.b.record_def(var);
                // The bound lives in a hidden local for the duration.
                self.b.record_def(&loop_bound_name(var));
                let loop_start = self.b.position();
                self.defers.push(Vec::new());
                for s in body {
                    self.stmt(s);
                }
                self.flush_defers();
                self.b.step();
                self.b.record_use(var);
                self.b.record_use(&loop_bound_name(var));
                self.close_loop(loop_start);
            }
            StmtKind::Defer(e) => {
                if let Some(scope) = self.defers.last_mut() {
                    scope.push(e.clone());
                }
            }
            StmtKind::Ret(value) => {
                if let Some(e) = value {
                    self.expr(e);
                }
            }
            StmtKind::Break | StmtKind::Continue | StmtKind::Import(_) => {}
            StmtKind::Expr(e) => self.expr(e),
        }
    }

    fn close_loop(&mut self, loop_start: u32) {
        self.b.extend_live_across(loop_start);
    }

    fn expr(&mut self, expr: &Expr) {
        self.b.step();
        match &expr.kind {
            ExprKind::Ident(name) => self.b.record_use(name),
            ExprKind::Number(_) | ExprKind::Str(_) => {}
            ExprKind::Binary { lhs, rhs, .. } | ExprKind::OrElse { lhs, rhs } => {
                self.expr(lhs);
                self.expr(rhs);
            }
            ExprKind::Unary { expr: inner, .. } => self.expr(inner),
            ExprKind::Call { args, .. } => {
                for a in args {
                    self.expr(a);
                }
            }
            // Nested lambdas get their own scan when they are emitted.
            ExprKind::Lambda { .. } => {}
            ExprKind::Block(stmts) => {
                self.defers.push(Vec::new());
                for s in stmts {
                    self.stmt(s);
                }
                self.flush_defers();
            }
            ExprKind::Match {
                scrutinee,
                arms,
                default,
            } => {
                self.expr(scrutinee);
                for arm in arms {
                    self.expr(&arm.pattern);
                    self.expr(&arm.body);
                }
                if let Some(d) = default {
                    self.expr(d);
                }
            }
        }
    }
}

/// The hidden local holding a loop's upper bound.
pub fn loop_bound_name(var: &str) -> String {
    format!("{var}.hi")
}

#[cfg(test)]
mod tests {
    use super::*;
    use veld_parser::{lex, parse};

    fn intervals(src: &str) -> Vec<Interval> {
        let program = parse(lex(src).unwrap()).unwrap();
        scan_function(&[], &program.stmts)
    }

    #[test]
    fn test_simple_def_use() {
        let iv = intervals("x = 1\nprintln(x)");
        let x = iv.iter().find(|i| i.name == "x").unwrap();
        assert_eq!(x.defs.len(), 1);
        assert_eq!(x.uses.len(), 1);
        assert!(x.start < x.end);
    }

    #[test]
    fn test_loop_variable_lives_through_body() {
        let iv = intervals("sum := 0\n@ i in 1..10 { sum <- sum + i }\nprintln(sum)");
        let sum = iv.iter().find(|i| i.name == "sum").unwrap();
        let i = iv.iter().find(|i| i.name == "i").unwrap();
        // The loop counter's interval reaches the loop bottom where the
        // increment reads it.
        assert!(i.end > i.start);
        // sum is used after the loop, so it outlives the counter's
        // first use.
        assert!(sum.end > i.start);
        // The hidden bound local exists for the loop's duration.
        assert!(iv.iter().any(|iv| iv.name == "i.hi"));
    }

    #[test]
    fn test_string_bindings_take_no_interval() {
        let iv = intervals("s = \"hi\"\nprintln(s)");
        assert!(!iv.iter().any(|i| i.name == "s" && !i.defs.is_empty()));
    }

    #[test]
    fn test_deferred_uses_extend_lifetimes() {
        let iv = intervals("x = 1\ndefer println(x)\nprintln(2)");
        let x = iv.iter().find(|i| i.name == "x").unwrap();
        // The deferred read happens at flush time, after the last
        // ordinary statement.
        assert!(x.uses.iter().any(|&u| u > x.defs[0]));
    }
}
