//! The codegen driver: AST walk and machine-code emission.
//!
//! One [`emit_pass`] call produces the whole text stream for one pass:
//! entry shim, main frame, top-level statements, a patched jump over
//! the function block, every collected function, and the exit
//! sequence. Runtime helpers are appended separately (the `Helpers`
//! phase) into the page of slack the layout engine reserved after
//! text.
//!
//! The driver is ISA-agnostic: it programs against the [`Emitter`]
//! trait and records a relocation for every placeholder it causes.
//! Expression results land in the target's first floating-point return
//! register.

pub mod helpers;

use crate::error::{CompileError, CompileResult};
use crate::features::{Capability, FeatureTracker};
use crate::liveness::{self, loop_bound_name};
use crate::regalloc::{allocate, Allocation, Home};
use crate::reloc::RelocTable;
use crate::symbols::{DataSymbols, SymId};
use rustc_hash::FxHashMap;
use veld_asm::aarch64::A64;
use veld_asm::emit::{Frame, Patch};
use veld_asm::riscv64::Rv64;
use veld_asm::x86_64::X64;
use veld_asm::{CallConv, Cond, Emitter, Isa, Os, SectionBuffer, Target};
use veld_parser::ast::{BinOp, Expr, ExprKind, Program, Stmt, StmtKind, UnOp};

/// Internal label names for the runtime helpers.
pub const HELPER_PRINT_STR: &str = "veld.print_str";
pub const HELPER_PRINT_NUM: &str = "veld.print_num";
/// Writable scratch buffer used by decimal formatting.
pub const NUM_BUFFER: &str = "nbuf";
/// The external thread-runtime entry backing `@@` loops.
pub const PAR_RANGE_FN: &str = "veld_par_range";

/// How the program's exit status is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MainShape {
    /// `main` is a zero-parameter function never called explicitly:
    /// call it, exit with its return value.
    AutoCall,
    /// `main` is bound to a plain value: exit with that value.
    Value,
    /// No `main`: exit with the final top-level expression's value.
    LastExpr,
}

/// A top-level function (named lambda).
#[derive(Debug, Clone)]
pub struct Func {
    pub params: Vec<String>,
    pub body: Expr,
}

/// Everything collected before the first emission pass.
pub struct Collected {
    pub funcs: FxHashMap<String, Func>,
    pub func_order: Vec<String>,
    pub main_shape: MainShape,
    pub allocs: FxHashMap<String, Allocation>,
}

/// Collect functions, pick the main shape, and run the register
/// allocator for the top level and every function.
pub fn collect(program: &Program, cc: &CallConv) -> Collected {
    let mut funcs = FxHashMap::default();
    let mut func_order = Vec::new();
    let mut main_is_value = false;
    let mut calls_main = false;

    for stmt in &program.stmts {
        match &stmt.kind {
            StmtKind::Bind {
                name,
                value,
                mutable: false,
            } => {
                if let ExprKind::Lambda { params, body } = &value.kind {
                    funcs.insert(
                        name.clone(),
                        Func {
                            params: params.clone(),
                            body: (**body).clone(),
                        },
                    );
                    func_order.push(name.clone());
                } else if name == "main" {
                    main_is_value = true;
                }
            }
            StmtKind::Expr(e) => {
                if let ExprKind::Call { callee, .. } = &e.kind {
                    if callee.as_ident() == Some("main") {
                        calls_main = true;
                    }
                }
            }
            _ => {}
        }
    }

    let main_shape = if main_is_value {
        MainShape::Value
    } else if !calls_main
        && funcs
            .get("main")
            .map(|f| f.params.is_empty())
            .unwrap_or(false)
    {
        MainShape::AutoCall
    } else {
        MainShape::LastExpr
    };

    let mut allocs = FxHashMap::default();
    let mut top = liveness::scan_function(&[], &program.stmts);
    if main_shape == MainShape::Value {
        // The exit sequence reads `main` after every statement ran.
        if let Some(interval) = top.iter_mut().find(|i| i.name == "main") {
            interval.end = u32::MAX;
        }
    }
    allocs.insert(String::new(), allocate(top, cc));
    for name in &func_order {
        let f = &funcs[name];
        allocs.insert(
            name.clone(),
            allocate(liveness::scan_lambda(&f.params, &f.body), cc),
        );
    }

    Collected {
        funcs,
        func_order,
        main_shape,
        allocs,
    }
}

/// Static value shape of an expression: a float, or a read-only string
/// constant interned in rodata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Num,
    Str(SymId),
}

#[derive(Debug, Clone)]
struct VarInfo {
    home: Option<Home>,
    shape: Shape,
}

struct LoopCtx {
    break_patches: Vec<Patch>,
    continue_patches: Vec<Patch>,
}

/// The per-pass output every later phase consumes.
pub struct PassOutput {
    pub symbols: DataSymbols,
    pub relocs: RelocTable,
    pub features: FeatureTracker,
    pub labels: FxHashMap<String, usize>,
}

pub fn make_emitter<'b>(target: Target, text: &'b mut SectionBuffer) -> Box<dyn Emitter + 'b> {
    match target.isa {
        Isa::X86_64 => Box::new(X64::new(text)),
        Isa::Aarch64 => Box::new(A64::new(text, target.os)),
        Isa::Riscv64 => Box::new(Rv64::new(text)),
    }
}

/// Emit one full pass of the program into `text`.
pub fn emit_pass(
    program: &Program,
    collected: &Collected,
    target: Target,
    cc: &CallConv,
    text: &mut SectionBuffer,
) -> CompileResult<PassOutput> {
    let em = make_emitter(target, text);
    let mut gen = Gen {
        em,
        cc,
        target,
        collected,
        imports: &program.imports,
        symbols: DataSymbols::new(),
        relocs: RelocTable::new(),
        features: FeatureTracker::new(),
        labels: FxHashMap::default(),
        scopes: Vec::new(),
        defers: Vec::new(),
        loops: Vec::new(),
        cur_fn: String::new(),
        ret_patches: Vec::new(),
        has_value: false,
    };
    gen.program(program)?;
    if !gen.em.stack_is_balanced() {
        return Err(CompileError::internal(
            "stack imbalance at end of emission",
        ));
    }
    Ok(PassOutput {
        symbols: gen.symbols,
        relocs: gen.relocs,
        features: gen.features,
        labels: gen.labels,
    })
}

struct Gen<'b> {
    em: Box<dyn Emitter + 'b>,
    cc: &'b CallConv,
    target: Target,
    collected: &'b Collected,
    /// Library names from `import` declarations, in source order.
    imports: &'b [String],
    symbols: DataSymbols,
    relocs: RelocTable,
    features: FeatureTracker,
    labels: FxHashMap<String, usize>,
    scopes: Vec<FxHashMap<String, VarInfo>>,
    defers: Vec<Vec<Expr>>,
    loops: Vec<LoopCtx>,
    /// Name of the function being emitted; empty for the top level.
    cur_fn: String,
    /// `ret` jumps waiting for the current function's epilogue.
    ret_patches: Vec<Patch>,
    /// Whether the last top-level statement left a value in the
    /// accumulator.
    has_value: bool,
}

impl Gen<'_> {
    fn alloc(&self) -> &Allocation {
        &self.collected.allocs[&self.cur_fn]
    }

    fn frame(&self) -> Frame {
        self.alloc().frame()
    }

    /// Accumulator: the first FP return register.
    fn acc(&self) -> u8 {
        self.cc.float_ret
    }

    fn ftmp(&self, n: usize) -> u8 {
        self.cc.float_scratch[n]
    }

    fn scratch(&self) -> u8 {
        self.cc.scratch[0]
    }

    // ── Variables ────────────────────────────────────────────────────

    fn declare(&mut self, name: &str, shape: Shape) -> CompileResult<VarInfo> {
        let home = match shape {
            Shape::Str(_) => None,
            Shape::Num => Some(self.alloc().home(name).ok_or_else(|| {
                CompileError::internal(format!("no home allocated for `{name}`"))
            })?),
        };
        let info = VarInfo { home, shape };
        self.scopes
            .last_mut()
            .expect("scope stack is never empty during emission")
            .insert(name.to_string(), info.clone());
        Ok(info)
    }

    fn lookup(&self, name: &str) -> Option<VarInfo> {
        self.scopes.iter().rev().find_map(|s| s.get(name)).cloned()
    }

    fn var_store(&mut self, home: Home, from: u8) -> CompileResult<()> {
        match home {
            Home::Reg(r) => self.em.fbits_to_gpr(r, from)?,
            Home::Slot(s) => {
                let frame = self.frame();
                self.em.spill_fstore(&frame, s, from)?;
            }
        }
        Ok(())
    }

    fn var_load(&mut self, home: Home, to: u8) -> CompileResult<()> {
        match home {
            Home::Reg(r) => self.em.gpr_to_fbits(to, r)?,
            Home::Slot(s) => {
                let frame = self.frame();
                self.em.spill_fload(to, &frame, s)?;
            }
        }
        Ok(())
    }

    // ── Program structure ────────────────────────────────────────────

    fn program(&mut self, program: &Program) -> CompileResult<()> {
        if self.target.isa == Isa::X86_64 && self.target.os != Os::Windows {
            // _start is jumped to, not called: realign to the
            // post-call shape the frames assume.
            self.em.align_entry_stack();
        }
        let frame = self.frame();
        self.em.prologue(&frame)?;
        self.scopes.push(FxHashMap::default());
        self.defers.push(Vec::new());

        for stmt in &program.stmts {
            self.stmt(stmt)?;
        }

        // Deferred expressions run now, LIFO, with the last value kept
        // safe across them.
        self.flush_defer_scope(true)?;

        match self.collected.main_shape {
            MainShape::AutoCall => {
                let patch = self.em.call_placeholder();
                self.relocs.record_call(patch, "main");
            }
            MainShape::Value => {
                let info = self.lookup("main").ok_or_else(|| {
                    CompileError::internal("main-shape Value without a main binding")
                })?;
                let home = info.home.ok_or_else(|| {
                    CompileError::Shape("main bound to a string cannot be an exit status".to_string())
                })?;
                let acc = self.acc();
                self.var_load(home, acc)?;
            }
            MainShape::LastExpr => {
                if !self.has_value {
                    let acc = self.acc();
                    self.em.fzero(acc)?;
                }
            }
        }

        // Skip the function block; the exit sequence follows it.
        let skip = self.em.jmp_placeholder();

        for name in &self.collected.func_order.clone() {
            self.function(name)?;
        }

        let exit_at = self.em.pos();
        self.em.patch_jump(&skip, exit_at)?;
        self.emit_exit(&frame)?;
        self.scopes.pop();
        self.defers.pop();
        Ok(())
    }

    fn emit_exit(&mut self, frame: &Frame) -> CompileResult<()> {
        self.em.epilogue(frame)?;
        let status = self.cc.syscall_args.first().copied().unwrap_or(1);
        let acc = self.acc();
        match self.target.os {
            Os::Windows => {
                // ExitProcess(status) through the IAT; rcx is the
                // first Microsoft-x64 argument register.
                self.em.f2i(self.cc.int_args[0], acc)?;
                // Shadow space for the callee; never released, the
                // call does not return.
                self.em.add_ri(self.cc.stack_pointer, -40)?;
                self.win_call_iat(helpers::KERNEL32, "ExitProcess")?;
            }
            _ => {
                self.em.f2i(status, acc)?;
                let nums = self.target.syscalls();
                self.em.mov_ri(self.cc.syscall_num_reg, nums.exit)?;
                self.em.syscall();
            }
        }
        Ok(())
    }

    fn function(&mut self, name: &str) -> CompileResult<()> {
        let func = self.collected.funcs[name].clone();
        self.labels.insert(name.to_string(), self.em.pos());

        let saved_fn = std::mem::replace(&mut self.cur_fn, name.to_string());
        let saved_rets = std::mem::take(&mut self.ret_patches);
        let frame = self.frame();

        self.em.prologue(&frame)?;
        self.scopes.push(FxHashMap::default());
        self.defers.push(Vec::new());

        // Parameters arrive in the FP argument registers.
        for (i, p) in func.params.iter().enumerate() {
            let from = *self.cc.float_args.get(i).ok_or_else(|| {
                CompileError::internal(format!("function `{name}` exceeds register arguments"))
            })?;
            let info = self.declare(p, Shape::Num)?;
            let home = info.home.expect("numeric parameter has a home");
            self.var_store(home, from)?;
        }

        let acc = self.acc();
        match &func.body.kind {
            ExprKind::Block(stmts) => {
                let mut value = false;
                for stmt in stmts {
                    value = matches!(stmt.kind, StmtKind::Expr(_));
                    self.stmt(stmt)?;
                }
                if !value {
                    self.em.fzero(acc)?;
                }
            }
            _ => {
                let shape = self.expr(&func.body)?;
                self.require_num(shape, "function result")?;
            }
        }
        self.flush_defer_scope(true)?;

        // `ret` statements land here, value already in the accumulator.
        let ret_at = self.em.pos();
        for patch in std::mem::take(&mut self.ret_patches) {
            self.em.patch_jump(&patch, ret_at)?;
        }
        self.em.epilogue(&frame)?;
        self.em.ret();

        self.scopes.pop();
        self.defers.pop();
        self.cur_fn = saved_fn;
        self.ret_patches = saved_rets;
        Ok(())
    }

    /// Run the innermost defer scope LIFO. `preserve_acc` saves the
    /// accumulator across the deferred expressions.
    fn flush_defer_scope(&mut self, preserve_acc: bool) -> CompileResult<()> {
        let deferred = self.defers.last().cloned().unwrap_or_default();
        if deferred.is_empty() {
            return Ok(());
        }
        let acc = self.acc();
        if preserve_acc {
            self.em.fpush(acc)?;
        }
        for expr in deferred.iter().rev() {
            self.expr(expr)?;
        }
        if preserve_acc {
            self.em.fpop(acc)?;
        }
        if let Some(scope) = self.defers.last_mut() {
            scope.clear();
        }
        Ok(())
    }

    // ── Statements ───────────────────────────────────────────────────

    fn stmt(&mut self, stmt: &Stmt) -> CompileResult<()> {
        match &stmt.kind {
            StmtKind::Bind { name, value, .. } => {
                self.has_value = false;
                match &value.kind {
                    // Top-level function bindings were emitted by
                    // `function`; nothing happens at the bind site.
                    ExprKind::Lambda { .. } => {}
                    ExprKind::Str(s) => {
                        let sym = self.symbols.add_rodata(s.clone().into_bytes());
                        self.declare(name, Shape::Str(sym))?;
                    }
                    _ => {
                        let shape = self.expr(value)?;
                        match shape {
                            Shape::Num => {
                                let info = self.declare(name, Shape::Num)?;
                                let home = info.home.expect("numeric binding has a home");
                                let acc = self.acc();
                                self.var_store(home, acc)?;
                            }
                            Shape::Str(sym) => {
                                self.declare(name, Shape::Str(sym))?;
                            }
                        }
                    }
                }
            }
            StmtKind::Assign { name, value } => {
                self.has_value = false;
                let shape = self.expr(value)?;
                self.require_num(shape, "assignment")?;
                let info = self.lookup(name).ok_or_else(|| {
                    CompileError::internal(format!("assignment to unchecked name `{name}`"))
                })?;
                let home = info
                    .home
                    .ok_or_else(|| CompileError::Shape("cannot assign to a string binding".to_string()))?;
                let acc = self.acc();
                self.var_store(home, acc)?;
            }
            StmtKind::Loop {
                var,
                lo,
                hi,
                body,
                parallel,
            } => {
                self.has_value = false;
                self.loop_stmt(var, lo, hi, body, *parallel)?;
            }
            StmtKind::Defer(e) => {
                self.has_value = false;
                if let Some(scope) = self.defers.last_mut() {
                    scope.push(e.clone());
                }
            }
            StmtKind::Ret(value) => {
                self.has_value = false;
                let acc = self.acc();
                match value {
                    Some(e) => {
                        let shape = self.expr(e)?;
                        self.require_num(shape, "`ret` value")?;
                    }
                    None => self.em.fzero(acc)?,
                }
                // Deferred work still runs on the early path.
                self.flush_defer_scope(true)?;
                let patch = self.em.jmp_placeholder();
                self.ret_patches.push(patch);
            }
            StmtKind::Break => {
                let patch = self.em.jmp_placeholder();
                self.loops
                    .last_mut()
                    .ok_or_else(|| CompileError::internal("break outside a loop"))?
                    .break_patches
                    .push(patch);
            }
            StmtKind::Continue => {
                let patch = self.em.jmp_placeholder();
                self.loops
                    .last_mut()
                    .ok_or_else(|| CompileError::internal("continue outside a loop"))?
                    .continue_patches
                    .push(patch);
            }
            StmtKind::Import(_) => {}
            StmtKind::Expr(e) => {
                let shape = self.expr(e)?;
                self.has_value = shape == Shape::Num;
            }
        }
        Ok(())
    }

    fn loop_stmt(
        &mut self,
        var: &str,
        lo: &Expr,
        hi: &Expr,
        body: &[Stmt],
        parallel: bool,
    ) -> CompileResult<()> {
        if parallel {
            // The parallel form needs the external thread runtime; the
            // iteration space itself is emitted as the sequential loop
            // and the runtime dependency is recorded for the linker.
            self.features.record(Capability::ParallelMap);
            self.features.record_import(PAR_RANGE_FN);
        }
        self.scopes.push(FxHashMap::default());
        self.defers.push(Vec::new());

        let acc = self.acc();
        let shape = self.expr(lo)?;
        self.require_num(shape, "loop bound")?;
        let var_info = self.declare(var, Shape::Num)?;
        let var_home = var_info.home.expect("loop counter has a home");
        self.var_store(var_home, acc)?;

        let shape = self.expr(hi)?;
        self.require_num(shape, "loop bound")?;
        let bound = loop_bound_name(var);
        let bound_info = self.declare(&bound, Shape::Num)?;
        let bound_home = bound_info.home.expect("loop bound has a home");
        self.var_store(bound_home, acc)?;

        let top = self.em.pos();
        let t1 = self.ftmp(0);
        let t2 = self.ftmp(1);
        self.var_load(var_home, t1)?;
        self.var_load(bound_home, t2)?;
        // Inclusive range: leave once the counter exceeds the bound.
        let exit_patch = self.em.br_fcmp(Cond::Gt, t1, t2)?;

        self.loops.push(LoopCtx {
            break_patches: Vec::new(),
            continue_patches: Vec::new(),
        });
        for stmt in body {
            self.stmt(stmt)?;
        }
        self.flush_defer_scope(false)?;

        let continue_at = self.em.pos();
        let scratch = self.scratch();
        self.var_load(var_home, t1)?;
        self.em.fmov_const(t2, 1.0f64.to_bits(), scratch)?;
        self.em.fadd(t1, t2)?;
        self.var_store(var_home, t1)?;
        let back = self.em.jmp_placeholder();
        self.em.patch_jump(&back, top)?;

        let end = self.em.pos();
        let ctx = self.loops.pop().expect("pushed above");
        self.em.patch_jump(&exit_patch, end)?;
        for p in ctx.break_patches {
            self.em.patch_jump(&p, end)?;
        }
        for p in ctx.continue_patches {
            self.em.patch_jump(&p, continue_at)?;
        }

        self.scopes.pop();
        self.defers.pop();
        Ok(())
    }

    fn require_num(&self, shape: Shape, what: &str) -> CompileResult<()> {
        match shape {
            Shape::Num => Ok(()),
            Shape::Str(_) => Err(CompileError::Shape(format!(
                "string value where {what} expects a number"
            ))),
        }
    }

    // ── Expressions ──────────────────────────────────────────────────

    fn expr(&mut self, expr: &Expr) -> CompileResult<Shape> {
        let acc = self.acc();
        match &expr.kind {
            ExprKind::Number(n) => {
                let scratch = self.scratch();
                self.em.fmov_const(acc, n.to_bits(), scratch)?;
                Ok(Shape::Num)
            }
            ExprKind::Str(s) => Ok(Shape::Str(
                self.symbols.add_rodata(s.clone().into_bytes()),
            )),
            ExprKind::Ident(name) => {
                let info = self.lookup(name).ok_or_else(|| {
                    CompileError::internal(format!("unchecked identifier `{name}`"))
                })?;
                match info.shape {
                    Shape::Num => {
                        let home = info.home.expect("numeric variable has a home");
                        self.var_load(home, acc)?;
                        Ok(Shape::Num)
                    }
                    Shape::Str(sym) => Ok(Shape::Str(sym)),
                }
            }
            ExprKind::Unary {
                op: UnOp::Neg,
                expr: inner,
            } => {
                let shape = self.expr(inner)?;
                self.require_num(shape, "negation")?;
                let t1 = self.ftmp(0);
                self.em.fzero(t1)?;
                self.em.fsub(t1, acc)?;
                self.em.fmov_rr(acc, t1)?;
                Ok(Shape::Num)
            }
            ExprKind::Binary { op, lhs, rhs } => self.binary(*op, lhs, rhs),
            ExprKind::OrElse { lhs, rhs } => self.or_else(lhs, rhs),
            ExprKind::Call { callee, args } => self.call(callee, args),
            ExprKind::Block(stmts) => {
                self.scopes.push(FxHashMap::default());
                self.defers.push(Vec::new());
                let mut value = false;
                for stmt in stmts {
                    value = matches!(stmt.kind, StmtKind::Expr(_));
                    self.stmt(stmt)?;
                }
                if !value {
                    self.em.fzero(acc)?;
                }
                self.flush_defer_scope(true)?;
                self.scopes.pop();
                self.defers.pop();
                Ok(Shape::Num)
            }
            ExprKind::Match {
                scrutinee,
                arms,
                default,
            } => self.match_block(scrutinee, arms, default.as_deref()),
            ExprKind::Lambda { .. } => Err(CompileError::internal(
                "lambda in expression position survived checking",
            )),
        }
    }

    fn binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> CompileResult<Shape> {
        let acc = self.acc();
        let lshape = self.expr(lhs)?;

        // Static string concatenation: both sides are rodata constants.
        if let Shape::Str(lsym) = lshape {
            if op == BinOp::Add {
                let rshape = self.expr(rhs)?;
                if let Shape::Str(rsym) = rshape {
                    let mut joined = self.symbols.get(lsym).bytes.clone();
                    joined.extend_from_slice(&self.symbols.get(rsym).bytes);
                    return Ok(Shape::Str(self.symbols.add_rodata(joined)));
                }
            }
            return Err(CompileError::Shape(
                "string operand in a numeric operator".to_string(),
            ));
        }

        self.em.fpush(acc)?;
        let rshape = self.expr(rhs)?;
        self.require_num(rshape, "binary operand")?;
        let t1 = self.ftmp(0);
        self.em.fmov_rr(t1, acc)?; // rhs
        self.em.fpop(acc)?; // lhs

        match op {
            BinOp::Add => self.em.fadd(acc, t1)?,
            BinOp::Sub => self.em.fsub(acc, t1)?,
            BinOp::Mul => self.em.fmul(acc, t1)?,
            BinOp::Div => self.em.fdiv(acc, t1)?,
            BinOp::Rem => {
                // a - trunc(a/b) * b, in float registers throughout.
                let t2 = self.ftmp(1);
                let scratch = self.scratch();
                self.em.fmov_rr(t2, acc)?;
                self.em.fdiv(t2, t1)?;
                self.em.f2i(scratch, t2)?;
                self.em.i2f(t2, scratch)?;
                self.em.fmul(t2, t1)?;
                self.em.fsub(acc, t2)?;
            }
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let cond = match op {
                    BinOp::Eq => Cond::Eq,
                    BinOp::Ne => Cond::Ne,
                    BinOp::Lt => Cond::Lt,
                    BinOp::Le => Cond::Le,
                    BinOp::Gt => Cond::Gt,
                    _ => Cond::Ge,
                };
                let scratch = self.scratch();
                let taken = self.em.br_fcmp(cond, acc, t1)?;
                self.em.fzero(acc)?;
                let done = self.em.jmp_placeholder();
                let true_at = self.em.pos();
                self.em.patch_jump(&taken, true_at)?;
                self.em.fmov_const(acc, 1.0f64.to_bits(), scratch)?;
                let end = self.em.pos();
                self.em.patch_jump(&done, end)?;
            }
        }
        Ok(Shape::Num)
    }

    /// `lhs or! rhs`: keep lhs when it is finite, else evaluate rhs.
    /// Finiteness test: `lhs - lhs` is zero for finite values and NaN
    /// for NaN/±Inf, and `1.0 > NaN` is false under every target's
    /// unordered-compare rules.
    fn or_else(&mut self, lhs: &Expr, rhs: &Expr) -> CompileResult<Shape> {
        let acc = self.acc();
        let shape = self.expr(lhs)?;
        self.require_num(shape, "`or!` operand")?;
        let t1 = self.ftmp(0);
        let t2 = self.ftmp(1);
        let scratch = self.scratch();
        self.em.fmov_rr(t1, acc)?;
        self.em.fsub(t1, acc)?;
        self.em.fmov_const(t2, 1.0f64.to_bits(), scratch)?;
        let finite = self.em.br_fcmp(Cond::Gt, t2, t1)?;
        let shape = self.expr(rhs)?;
        self.require_num(shape, "`or!` fallback")?;
        let end = self.em.pos();
        self.em.patch_jump(&finite, end)?;
        Ok(Shape::Num)
    }

    fn match_block(
        &mut self,
        scrutinee: &Expr,
        arms: &[veld_parser::ast::MatchArm],
        default: Option<&Expr>,
    ) -> CompileResult<Shape> {
        let acc = self.acc();
        let shape = self.expr(scrutinee)?;
        self.require_num(shape, "match scrutinee")?;

        let t1 = self.ftmp(0);
        let scratch = self.scratch();
        let mut arm_patches = Vec::with_capacity(arms.len());
        for arm in arms {
            let value = match &arm.pattern.kind {
                ExprKind::Number(n) => *n,
                ExprKind::Unary {
                    op: UnOp::Neg,
                    expr: inner,
                } => match inner.kind {
                    ExprKind::Number(n) => -n,
                    _ => {
                        return Err(CompileError::internal(
                            "non-literal match pattern survived checking",
                        ))
                    }
                },
                _ => {
                    return Err(CompileError::internal(
                        "non-literal match pattern survived checking",
                    ))
                }
            };
            self.em.fmov_const(t1, value.to_bits(), scratch)?;
            arm_patches.push(self.em.br_fcmp(Cond::Eq, acc, t1)?);
        }

        // No arm matched: the default, or zero.
        match default {
            Some(d) => {
                let shape = self.expr(d)?;
                self.require_num(shape, "match default")?;
            }
            None => self.em.fzero(acc)?,
        }
        let mut end_patches = vec![self.em.jmp_placeholder()];

        for (arm, patch) in arms.iter().zip(arm_patches) {
            let at = self.em.pos();
            self.em.patch_jump(&patch, at)?;
            let shape = self.expr(&arm.body)?;
            self.require_num(shape, "match arm")?;
            end_patches.push(self.em.jmp_placeholder());
        }
        let end = self.em.pos();
        for patch in end_patches {
            self.em.patch_jump(&patch, end)?;
        }
        Ok(Shape::Num)
    }

    fn call(&mut self, callee: &Expr, args: &[Expr]) -> CompileResult<Shape> {
        let name = callee
            .as_ident()
            .ok_or_else(|| CompileError::internal("non-ident callee survived checking"))?;
        let internal = self.collected.funcs.contains_key(name);
        // Builtins lower directly unless the program defines its own.
        if !internal {
            match name {
                "println" => return self.print_builtin(args, true),
                "print" => return self.print_builtin(args, false),
                "sqrt" => {
                    let acc = self.acc();
                    let shape = self.expr(&args[0])?;
                    self.require_num(shape, "sqrt argument")?;
                    self.em.fsqrt(acc, acc)?;
                    return Ok(Shape::Num);
                }
                _ => {}
            }
        }

        let acc = self.acc();
        for arg in args {
            let shape = self.expr(arg)?;
            self.require_num(shape, "call argument")?;
            self.em.fpush(acc)?;
        }
        for i in (0..args.len()).rev() {
            let reg = *self.cc.float_args.get(i).ok_or_else(|| {
                CompileError::internal(format!("call to `{name}` exceeds register arguments"))
            })?;
            self.em.fpop(reg)?;
        }

        if !internal {
            self.features.record_import(name);
        }
        if self.target.os == Os::Windows && !internal {
            // PE routes external calls through the IAT; the DLL is the
            // program's first import declaration.
            let dll = self
                .imports
                .first()
                .cloned()
                .ok_or_else(|| CompileError::UnresolvableCall {
                    name: name.to_string(),
                })?;
            self.win_call_iat(&dll, name)?;
        } else {
            let patch = self.em.call_placeholder();
            self.relocs.record_call(patch, name);
        }
        Ok(Shape::Num)
    }

    /// Emit `call [rip + slot]` against an import-address-table entry,
    /// with the 32 bytes of shadow space Microsoft x64 callees assume.
    fn win_call_iat(&mut self, dll: &str, func: &str) -> CompileResult<()> {
        let sp = self.cc.stack_pointer;
        self.em.add_ri(sp, -32)?;
        let patch = self.em.call_mem_placeholder()?;
        self.relocs.record_iat(patch, dll, func);
        self.em.add_ri(sp, 32)?;
        Ok(())
    }

    fn print_builtin(&mut self, args: &[Expr], newline: bool) -> CompileResult<Shape> {
        let acc = self.acc();
        let shape = self.expr(&args[0])?;
        match shape {
            Shape::Str(sym) => {
                let sym = if newline {
                    let mut bytes = self.symbols.get(sym).bytes.clone();
                    bytes.push(b'\n');
                    self.symbols.add_rodata(bytes)
                } else {
                    sym
                };
                self.print_rodata(sym)?;
            }
            Shape::Num => {
                self.features.record(Capability::PrintNum);
                self.features.record(Capability::PrintStr);
                if self.symbols.lookup(NUM_BUFFER).is_none() {
                    self.symbols.add_data(NUM_BUFFER, vec![0; 40]);
                }
                let patch = self.em.call_placeholder();
                self.relocs.record_call(patch, HELPER_PRINT_NUM);
                if newline {
                    let nl = self.symbols.add_rodata(b"\n".to_vec());
                    self.print_rodata(nl)?;
                }
            }
        }
        self.em.fzero(acc)?;
        Ok(Shape::Num)
    }

    /// Call the string helper with a rodata symbol's address/length.
    fn print_rodata(&mut self, sym: SymId) -> CompileResult<()> {
        self.features.record(Capability::PrintStr);
        let len = self.symbols.get(sym).bytes.len() as u64;
        let ptr_reg = self.cc.int_args[0];
        let len_reg = self.cc.int_args[1];
        let patch = self.em.load_sym_addr(ptr_reg)?;
        self.relocs.record_data(patch, sym);
        self.em.mov_ri(len_reg, len)?;
        let patch = self.em.call_placeholder();
        self.relocs.record_call(patch, HELPER_PRINT_STR);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veld_parser::{lex, parse};

    fn collected(src: &str) -> Collected {
        let program = parse(lex(src).unwrap()).unwrap();
        let cc = CallConv::for_target(Target::parse("x86_64-linux").unwrap());
        collect(&program, &cc)
    }

    #[test]
    fn test_main_shape_value() {
        assert_eq!(collected("main = 42").main_shape, MainShape::Value);
        assert_eq!(
            collected("main = { println(1) }").main_shape,
            MainShape::Value
        );
    }

    #[test]
    fn test_main_shape_autocall() {
        let c = collected("main = () -> 5");
        assert_eq!(c.main_shape, MainShape::AutoCall);
        assert_eq!(c.func_order, ["main"]);
    }

    #[test]
    fn test_explicit_call_disables_autocall() {
        let c = collected("main = () -> 5\nmain()");
        assert_eq!(c.main_shape, MainShape::LastExpr);
    }

    #[test]
    fn test_no_main_uses_last_expression() {
        assert_eq!(collected("println(1)").main_shape, MainShape::LastExpr);
    }

    #[test]
    fn test_functions_collected_in_order() {
        let c = collected("f = n -> n\ng = n -> f(n)\nmain = () -> g(1)");
        assert_eq!(c.func_order, ["f", "g", "main"]);
        assert!(c.allocs.contains_key(""));
        assert!(c.allocs.contains_key("f"));
    }

    #[test]
    fn test_emit_pass_produces_code_for_each_isa() {
        let program = parse(lex("x := 2\nx <- x * 21\nprintln(x)").unwrap()).unwrap();
        for triple in ["x86_64-linux", "aarch64-linux", "riscv64-linux"] {
            let target = Target::parse(triple).unwrap();
            let cc = CallConv::for_target(target);
            let collected = collect(&program, &cc);
            let mut text = SectionBuffer::new("text");
            let out = emit_pass(&program, &collected, target, &cc, &mut text).unwrap();
            assert!(!text.is_empty(), "{triple} emitted nothing");
            assert!(out.features.uses(Capability::PrintNum));
            assert!(!out.relocs.is_empty());
        }
    }

    #[test]
    fn test_emission_is_deterministic_across_passes() {
        let program =
            parse(lex("s = \"hi\"\nprintln(s)\nprintln(40 + 2)").unwrap()).unwrap();
        let target = Target::parse("x86_64-linux").unwrap();
        let cc = CallConv::for_target(target);
        let collected = collect(&program, &cc);

        let mut text = SectionBuffer::new("text");
        let one = emit_pass(&program, &collected, target, &cc, &mut text).unwrap();
        let bytes_one = text.bytes().to_vec();
        text.commit();
        text.reset();
        let two = emit_pass(&program, &collected, target, &cc, &mut text).unwrap();

        assert_eq!(one.symbols.digest(), two.symbols.digest());
        assert_eq!(bytes_one, text.bytes());
        assert_eq!(one.labels, two.labels);
    }
}
