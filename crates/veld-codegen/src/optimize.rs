//! Whole-program algebraic simplification.
//!
//! Bottom-up constant folding and identity elimination over the AST,
//! bounded by a wall-clock deadline (`--opt-timeout`, 0 disables).
//! Exceeding the budget stops cleanly mid-walk; partially-simplified
//! programs are still correct programs.

use std::time::{Duration, Instant};
use veld_parser::ast::{BinOp, Expr, ExprKind, Program, Stmt, StmtKind, UnOp};

pub struct Simplifier {
    deadline: Option<Instant>,
    expired: bool,
    pub folded: usize,
}

impl Simplifier {
    pub fn new(budget_ms: u64) -> Self {
        Self {
            deadline: (budget_ms > 0).then(|| Instant::now() + Duration::from_millis(budget_ms)),
            expired: false,
            folded: 0,
        }
    }

    pub fn run(&mut self, program: &mut Program) {
        if self.deadline.is_none() {
            return;
        }
        for stmt in &mut program.stmts {
            if self.out_of_time() {
                return;
            }
            self.stmt(stmt);
        }
    }

    fn out_of_time(&mut self) -> bool {
        if self.expired {
            return true;
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.expired = true;
            }
        }
        self.expired
    }

    fn stmt(&mut self, stmt: &mut Stmt) {
        match &mut stmt.kind {
            StmtKind::Bind { value, .. } | StmtKind::Assign { value, .. } => self.expr(value),
            StmtKind::Loop { lo, hi, body, .. } => {
                self.expr(lo);
                self.expr(hi);
                for s in body {
                    self.stmt(s);
                }
            }
            StmtKind::Defer(e) | StmtKind::Expr(e) => self.expr(e),
            StmtKind::Ret(Some(e)) => self.expr(e),
            StmtKind::Ret(None)
            | StmtKind::Break
            | StmtKind::Continue
            | StmtKind::Import(_) => {}
        }
    }

    fn expr(&mut self, expr: &mut Expr) {
        if self.out_of_time() {
            return;
        }
        match &mut expr.kind {
            ExprKind::Binary { lhs, rhs, .. } => {
                self.expr(lhs);
                self.expr(rhs);
            }
            ExprKind::Unary { expr: inner, .. } => self.expr(inner),
            ExprKind::Call { callee, args } => {
                self.expr(callee);
                for a in args {
                    self.expr(a);
                }
            }
            ExprKind::Lambda { body, .. } => self.expr(body),
            ExprKind::Block(stmts) => {
                for s in stmts {
                    self.stmt(s);
                }
            }
            ExprKind::Match {
                scrutinee,
                arms,
                default,
            } => {
                self.expr(scrutinee);
                for arm in arms {
                    self.expr(&mut arm.pattern);
                    self.expr(&mut arm.body);
                }
                if let Some(d) = default {
                    self.expr(d);
                }
            }
            ExprKind::OrElse { lhs, rhs } => {
                self.expr(lhs);
                self.expr(rhs);
            }
            ExprKind::Number(_) | ExprKind::Str(_) | ExprKind::Ident(_) => {}
        }
        if let Some(replacement) = self.fold(expr) {
            self.folded += 1;
            expr.kind = replacement;
        }
    }

    fn fold(&self, expr: &Expr) -> Option<ExprKind> {
        match &expr.kind {
            ExprKind::Unary {
                op: UnOp::Neg,
                expr: inner,
            } => match inner.kind {
                ExprKind::Number(n) => Some(ExprKind::Number(-n)),
                _ => None,
            },
            ExprKind::Binary { op, lhs, rhs } => {
                let lnum = as_number(lhs);
                let rnum = as_number(rhs);
                if let (Some(a), Some(b)) = (lnum, rnum) {
                    let v = match op {
                        BinOp::Add => a + b,
                        BinOp::Sub => a - b,
                        BinOp::Mul => a * b,
                        // Folding a division by zero would hide the
                        // runtime error value `or!` looks for.
                        BinOp::Div if b != 0.0 => a / b,
                        BinOp::Rem if b != 0.0 => a - (a / b).trunc() * b,
                        BinOp::Eq => f64::from(a == b),
                        BinOp::Ne => f64::from(a != b),
                        BinOp::Lt => f64::from(a < b),
                        BinOp::Le => f64::from(a <= b),
                        BinOp::Gt => f64::from(a > b),
                        BinOp::Ge => f64::from(a >= b),
                        _ => return None,
                    };
                    return Some(ExprKind::Number(v));
                }
                // Identities that never change value representation.
                match (op, lnum, rnum) {
                    (BinOp::Add, Some(a), None) if a == 0.0 => Some(rhs.kind.clone()),
                    (BinOp::Add, None, Some(b)) if b == 0.0 => Some(lhs.kind.clone()),
                    (BinOp::Sub, None, Some(b)) if b == 0.0 => Some(lhs.kind.clone()),
                    (BinOp::Mul, Some(a), None) if a == 1.0 => Some(rhs.kind.clone()),
                    (BinOp::Mul, None, Some(b)) if b == 1.0 => Some(lhs.kind.clone()),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

fn as_number(expr: &Expr) -> Option<f64> {
    match expr.kind {
        ExprKind::Number(n) => Some(n),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veld_parser::{lex, parse};

    fn simplify(src: &str, budget: u64) -> Program {
        let mut program = parse(lex(src).unwrap()).unwrap();
        Simplifier::new(budget).run(&mut program);
        program
    }

    fn bound_number(program: &Program) -> f64 {
        match &program.stmts[0].kind {
            StmtKind::Bind { value, .. } => match value.kind {
                ExprKind::Number(n) => n,
                ref other => panic!("not folded: {other:?}"),
            },
            other => panic!("unexpected stmt {other:?}"),
        }
    }

    #[test]
    fn test_constant_folding() {
        assert_eq!(bound_number(&simplify("x = 1 + 2 * 3", 100)), 7.0);
        assert_eq!(bound_number(&simplify("x = -(2 + 3)", 100)), -5.0);
        assert_eq!(bound_number(&simplify("x = 10 < 20", 100)), 1.0);
    }

    #[test]
    fn test_identity_elimination() {
        let p = simplify("y = x + 0", 100);
        match &p.stmts[0].kind {
            StmtKind::Bind { value, .. } => {
                assert!(matches!(value.kind, ExprKind::Ident(_)));
            }
            other => panic!("unexpected stmt {other:?}"),
        }
    }

    #[test]
    fn test_division_by_zero_is_not_folded() {
        let p = simplify("x = 10 / 0", 100);
        match &p.stmts[0].kind {
            StmtKind::Bind { value, .. } => {
                assert!(matches!(value.kind, ExprKind::Binary { .. }));
            }
            other => panic!("unexpected stmt {other:?}"),
        }
    }

    #[test]
    fn test_zero_budget_disables() {
        let p = simplify("x = 1 + 2", 0);
        match &p.stmts[0].kind {
            StmtKind::Bind { value, .. } => {
                assert!(matches!(value.kind, ExprKind::Binary { .. }));
            }
            other => panic!("unexpected stmt {other:?}"),
        }
    }
}
