//! Runtime-helper emission.
//!
//! Helpers are leaf routines appended after the laid-out text, inside
//! the slack page the layout engine reserved, and reachable only via
//! call. Presence is gated by the feature tracker: a program that
//! never prints gets none of this.
//!
//! Two helpers exist per target:
//!
//! - `veld.print_str(ptr, len)` — one write to stdout,
//! - `veld.print_num(value)` — decimal formatting of an f64 into the
//!   writable `nbuf` scratch buffer (sign, integer digits, and six
//!   rounded fraction digits when the value is not integral), then one
//!   write.
//!
//! On Linux and Darwin output is a raw write syscall; on Windows it
//! goes through `GetStdHandle`/`WriteFile` IAT slots, with the
//! Microsoft-x64 shadow space and the fifth argument on the stack.

use super::{PassOutput, HELPER_PRINT_NUM, HELPER_PRINT_STR, NUM_BUFFER};
use crate::error::{CompileError, CompileResult};
use crate::features::Capability;
use veld_asm::aarch64::A64;
use veld_asm::riscv64::Rv64;
use veld_asm::x86_64::X64;
use veld_asm::{CallConv, Cond, Emitter, Isa, Os, SectionBuffer, Target};

pub const KERNEL32: &str = "KERNEL32.dll";

/// Append every helper the program needs. Must run after the second
/// codegen pass and before patching, so the helper labels resolve.
pub fn emit_helpers(
    target: Target,
    cc: &CallConv,
    text: &mut SectionBuffer,
    out: &mut PassOutput,
) -> CompileResult<()> {
    if !out.features.uses(Capability::PrintStr) && !out.features.uses(Capability::PrintNum) {
        return Ok(());
    }
    match target.isa {
        Isa::X86_64 => x64_helpers(target, text, out),
        Isa::Aarch64 => a64_helpers(target, cc, text, out),
        Isa::Riscv64 => rv64_helpers(target, cc, text, out),
    }
}

// ── x86-64 ───────────────────────────────────────────────────────────

const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RSP: u8 = 4;
const RSI: u8 = 6;
const RDI: u8 = 7;
const R8: u8 = 8;
const R9: u8 = 9;
const R10: u8 = 10;
const R11: u8 = 11;

fn x64_helpers(target: Target, text: &mut SectionBuffer, out: &mut PassOutput) -> CompileResult<()> {
    let windows = target.os == Os::Windows;
    let mut a = X64::new(text);
    let nums = target.syscalls();

    if out.features.uses(Capability::PrintStr) {
        out.labels.insert(HELPER_PRINT_STR.to_string(), a.pos());
        if windows {
            // (ptr=rcx, len=rdx)
            a.sub_ri(RSP, 72)?;
            a.store_rm(RSP, 48, RCX)?;
            a.store_rm(RSP, 56, RDX)?;
            x64_write_stdout(&mut a, out)?;
            a.add_ri_(RSP, 72)?;
            a.ret_();
        } else {
            // (ptr=rdi, len=rsi) -> write(1, ptr, len)
            a.mov_rr_(RDX, RSI)?;
            a.mov_rr_(RSI, RDI)?;
            a.mov_ri64(RDI, 1)?;
            a.mov_ri64(RAX, nums.write)?;
            a.syscall_();
            a.ret_();
        }
    }

    if out.features.uses(Capability::PrintNum) {
        let nbuf = out
            .symbols
            .lookup(NUM_BUFFER)
            .ok_or_else(|| CompileError::internal("print_num without its scratch buffer"))?;
        out.labels.insert(HELPER_PRINT_NUM.to_string(), a.pos());

        // Sign: r11 = 1 when negative, value made non-negative.
        a.xorpd(1, 1)?;
        a.mov_ri64(R11, 0)?;
        let nonneg = a.br_fcmp(Cond::Le, 1, 0)?;
        a.mov_ri64(R11, 1)?;
        a.xorpd(1, 1)?;
        a.subsd(1, 0)?;
        a.movsd_rr(0, 1)?;
        let at = a.pos();
        a.patch_jump(&nonneg, at)?;

        // Integer part in rax, fraction rounded to six digits in r10.
        a.cvttsd2si(RAX, 0)?;
        a.cvtsi2sd(1, RAX)?;
        a.movsd_rr(2, 0)?;
        a.subsd(2, 1)?;
        a.mov_ri64(RCX, 1_000_000f64.to_bits())?;
        a.movq_xr(3, RCX)?;
        a.mulsd(2, 3)?;
        a.mov_ri64(RCX, 0.5f64.to_bits())?;
        a.movq_xr(3, RCX)?;
        a.addsd(2, 3)?;
        a.cvttsd2si(R10, 2)?;
        // Rounding may carry into the integer part.
        a.mov_ri64(RCX, 1_000_000)?;
        let nocarry = a.br_icmp(Cond::Lt, R10, RCX)?;
        a.add_ri_(RAX, 1)?;
        a.mov_ri64(R10, 0)?;
        let at = a.pos();
        a.patch_jump(&nocarry, at)?;
        a.mov_rr_(R8, RAX)?;

        // Digits build backwards from the end of nbuf.
        let ptr = a.lea_rip(RSI)?;
        out.relocs.record_data(ptr, nbuf);
        a.add_ri_(RSI, 40)?;
        a.mov_rr_(R9, RSI)?;

        // Six fraction digits plus the point, only for non-integral
        // values.
        a.cmp_ri(R10, 0)?;
        let no_frac = a.jcc_signed(Cond::Eq);
        a.mov_ri64(RCX, 6)?;
        a.mov_ri64(RDI, 10)?;
        let frac_top = a.pos();
        a.mov_rr_(RAX, R10)?;
        a.mov_ri64(RDX, 0)?;
        a.div(RDI)?;
        a.mov_rr_(R10, RAX)?;
        a.add_ri_(RDX, i32::from(b'0'))?;
        a.dec(R9)?;
        a.store_u8(R9, 0, RDX)?;
        a.dec(RCX)?;
        a.cmp_ri(RCX, 0)?;
        let frac_back = a.jcc_signed(Cond::Gt);
        a.patch_jump(&frac_back, frac_top)?;
        a.mov_ri64(RAX, u64::from(b'.'))?;
        a.dec(R9)?;
        a.store_u8(R9, 0, RAX)?;
        let at = a.pos();
        a.patch_jump(&no_frac, at)?;

        // Integer digits, at least one.
        a.mov_rr_(RAX, R8)?;
        a.mov_ri64(RDI, 10)?;
        let int_top = a.pos();
        a.mov_ri64(RDX, 0)?;
        a.div(RDI)?;
        a.add_ri_(RDX, i32::from(b'0'))?;
        a.dec(R9)?;
        a.store_u8(R9, 0, RDX)?;
        a.cmp_ri(RAX, 0)?;
        let int_back = a.jcc_signed(Cond::Gt);
        a.patch_jump(&int_back, int_top)?;

        // Sign character.
        a.cmp_ri(R11, 0)?;
        let no_sign = a.jcc_signed(Cond::Eq);
        a.mov_ri64(RAX, u64::from(b'-'))?;
        a.dec(R9)?;
        a.store_u8(R9, 0, RAX)?;
        let at = a.pos();
        a.patch_jump(&no_sign, at)?;

        // One write of nbuf[cursor..end].
        if windows {
            a.mov_rr_(RDX, RSI)?;
            a.sub_rr_(RDX, R9)?;
            a.sub_ri(RSP, 72)?;
            a.store_rm(RSP, 48, R9)?;
            a.store_rm(RSP, 56, RDX)?;
            x64_write_stdout(&mut a, out)?;
            a.add_ri_(RSP, 72)?;
            a.ret_();
        } else {
            a.mov_rr_(RDX, RSI)?;
            a.sub_rr_(RDX, R9)?;
            a.mov_rr_(RSI, R9)?;
            a.mov_ri64(RDI, 1)?;
            a.mov_ri64(RAX, nums.write)?;
            a.syscall_();
            a.ret_();
        }
    }
    Ok(())
}

/// WriteFile(GetStdHandle(-11), [rsp+48], [rsp+56], &[rsp+64], NULL).
/// Expects 72 bytes of frame already reserved.
fn x64_write_stdout(a: &mut X64<'_>, out: &mut PassOutput) -> CompileResult<()> {
    a.mov_ri64(RCX, (-11i64) as u64)?;
    let p = a.call_rip_mem();
    out.relocs.record_iat(p, KERNEL32, "GetStdHandle");
    a.mov_rr_(RCX, RAX)?;
    a.load_rm(RDX, RSP, 48)?;
    a.load_rm(R8, RSP, 56)?;
    a.lea(R9, RSP, 64)?;
    a.mov_ri64(R10, 0)?;
    a.store_rm(RSP, 32, R10)?;
    let p = a.call_rip_mem();
    out.relocs.record_iat(p, KERNEL32, "WriteFile");
    Ok(())
}

// ── AArch64 ──────────────────────────────────────────────────────────

fn a64_helpers(
    target: Target,
    cc: &CallConv,
    text: &mut SectionBuffer,
    out: &mut PassOutput,
) -> CompileResult<()> {
    let mut a = A64::new(text, target.os);
    let nums = target.syscalls();
    let nr = cc.syscall_num_reg;

    if out.features.uses(Capability::PrintStr) {
        out.labels.insert(HELPER_PRINT_STR.to_string(), a.pos());
        // (ptr=x0, len=x1) -> write(1, ptr, len)
        a.mov(2, 1)?;
        a.mov(1, 0)?;
        a.movz(0, 1, 0)?;
        a.movz(nr, nums.write as u16, 0)?;
        a.svc();
        a.ret_();
    }

    if out.features.uses(Capability::PrintNum) {
        let nbuf = out
            .symbols
            .lookup(NUM_BUFFER)
            .ok_or_else(|| CompileError::internal("print_num without its scratch buffer"))?;
        out.labels.insert(HELPER_PRINT_NUM.to_string(), a.pos());
        // x9 int, x10 frac6, x11 sign, x12 buffer end, x13 cursor,
        // x14 divisor, x15/x6/x7 scratch; d0 value, d1-d3 scratch.

        a.fzero(1)?;
        a.movz(11, 0, 0)?;
        let nonneg = a.br_fcmp(Cond::Le, 1, 0)?;
        a.movz(11, 1, 0)?;
        a.fneg_d(0, 0)?;
        let at = a.pos();
        a.patch_jump(&nonneg, at)?;

        a.fcvtzs(9, 0)?;
        a.scvtf(1, 9)?;
        a.fmov_d(2, 0)?;
        a.fsub_d(2, 2, 1)?;
        a.mov_imm64(15, 1_000_000f64.to_bits())?;
        a.fmov_dx(3, 15)?;
        a.fmul_d(2, 2, 3)?;
        a.mov_imm64(15, 0.5f64.to_bits())?;
        a.fmov_dx(3, 15)?;
        a.fadd_d(2, 2, 3)?;
        a.fcvtzs(10, 2)?;
        a.mov_imm64(15, 1_000_000)?;
        let nocarry = a.br_icmp(Cond::Lt, 10, 15)?;
        a.add_imm(9, 9, 1)?;
        a.movz(10, 0, 0)?;
        let at = a.pos();
        a.patch_jump(&nocarry, at)?;

        let ptr = a.adrp_add(12)?;
        out.relocs.record_data(ptr, nbuf);
        a.add_imm(12, 12, 40)?;
        a.mov(13, 12)?;

        let no_frac = a.cbz(10)?;
        a.movz(14, 10, 0)?;
        a.movz(7, 6, 0)?;
        let frac_top = a.pos();
        a.udiv(15, 10, 14)?;
        a.msub(6, 15, 14, 10)?;
        a.mov(10, 15)?;
        a.add_imm(6, 6, i32::from(b'0'))?;
        a.sub_imm(13, 13, 1)?;
        a.strb(6, 13, 0)?;
        a.sub_imm(7, 7, 1)?;
        let frac_back = a.cbnz(7)?;
        a.patch_jump(&frac_back, frac_top)?;
        a.movz(6, u16::from(b'.'), 0)?;
        a.sub_imm(13, 13, 1)?;
        a.strb(6, 13, 0)?;
        let at = a.pos();
        a.patch_jump(&no_frac, at)?;

        a.movz(14, 10, 0)?;
        let int_top = a.pos();
        a.udiv(15, 9, 14)?;
        a.msub(6, 15, 14, 9)?;
        a.mov(9, 15)?;
        a.add_imm(6, 6, i32::from(b'0'))?;
        a.sub_imm(13, 13, 1)?;
        a.strb(6, 13, 0)?;
        let int_back = a.cbnz(9)?;
        a.patch_jump(&int_back, int_top)?;

        let no_sign = a.cbz(11)?;
        a.movz(6, u16::from(b'-'), 0)?;
        a.sub_imm(13, 13, 1)?;
        a.strb(6, 13, 0)?;
        let at = a.pos();
        a.patch_jump(&no_sign, at)?;

        a.sub(2, 12, 13)?;
        a.mov(1, 13)?;
        a.movz(0, 1, 0)?;
        a.movz(nr, nums.write as u16, 0)?;
        a.svc();
        a.ret_();
    }
    Ok(())
}

// ── RV64 ─────────────────────────────────────────────────────────────

fn rv64_helpers(
    target: Target,
    cc: &CallConv,
    text: &mut SectionBuffer,
    out: &mut PassOutput,
) -> CompileResult<()> {
    let mut a = Rv64::new(text);
    let nums = target.syscalls();
    let nr = cc.syscall_num_reg;
    const T1: u8 = 6; // int part
    const T2: u8 = 7; // frac6
    const T3: u8 = 28; // sign flag
    const T4: u8 = 29; // buffer end
    const T5: u8 = 30; // cursor
    const T6: u8 = 31; // divisor
    const A5: u8 = 15; // counter
    const A6: u8 = 16; // digit
    const T0: u8 = 5; // scratch

    if out.features.uses(Capability::PrintStr) {
        out.labels.insert(HELPER_PRINT_STR.to_string(), a.pos());
        // (ptr=a0, len=a1) -> write(1, ptr, len)
        a.addi(12, 11, 0)?;
        a.addi(11, 10, 0)?;
        a.addi(10, 0, 1)?;
        a.li(nr, nums.write as i64)?;
        a.ecall();
        a.ret_();
    }

    if out.features.uses(Capability::PrintNum) {
        let nbuf = out
            .symbols
            .lookup(NUM_BUFFER)
            .ok_or_else(|| CompileError::internal("print_num without its scratch buffer"))?;
        out.labels.insert(HELPER_PRINT_NUM.to_string(), a.pos());

        a.fzero(0)?; // ft0 = 0
        a.li(T3, 0)?;
        let nonneg = a.br_fcmp(Cond::Le, 0, 10)?; // 0 <= fa0
        a.li(T3, 1)?;
        a.fneg_d(10, 10)?;
        let at = a.pos();
        a.patch_jump(&nonneg, at)?;

        a.fcvt_l_d(T1, 10)?;
        a.fcvt_d_l(0, T1)?;
        a.fsub_d(1, 10, 0)?; // ft1 = frac
        a.li(T0, 1_000_000f64.to_bits() as i64)?;
        a.fmv_d_x(2, T0)?;
        a.fmul_d(1, 1, 2)?;
        a.li(T0, 0.5f64.to_bits() as i64)?;
        a.fmv_d_x(2, T0)?;
        a.fadd_d(1, 1, 2)?;
        a.fcvt_l_d(T2, 1)?;
        a.li(T0, 1_000_000)?;
        let nocarry = a.br_icmp(Cond::Lt, T2, T0)?;
        a.addi(T1, T1, 1)?;
        a.li(T2, 0)?;
        let at = a.pos();
        a.patch_jump(&nocarry, at)?;

        let ptr = a.auipc_addi(T4)?;
        out.relocs.record_data(ptr, nbuf);
        a.addi(T4, T4, 40)?;
        a.addi(T5, T4, 0)?;

        let no_frac = a.beq(T2, 0)?;
        a.li(T6, 10)?;
        a.li(A5, 6)?;
        let frac_top = a.pos();
        a.remu(A6, T2, T6)?;
        a.divu(T2, T2, T6)?;
        a.addi(A6, A6, i32::from(b'0'))?;
        a.addi(T5, T5, -1)?;
        a.sb(T5, 0, A6)?;
        a.addi(A5, A5, -1)?;
        let frac_back = a.bne(A5, 0)?;
        a.patch_jump(&frac_back, frac_top)?;
        a.li(A6, i64::from(b'.'))?;
        a.addi(T5, T5, -1)?;
        a.sb(T5, 0, A6)?;
        let at = a.pos();
        a.patch_jump(&no_frac, at)?;

        a.li(T6, 10)?;
        let int_top = a.pos();
        a.remu(A6, T1, T6)?;
        a.divu(T1, T1, T6)?;
        a.addi(A6, A6, i32::from(b'0'))?;
        a.addi(T5, T5, -1)?;
        a.sb(T5, 0, A6)?;
        let int_back = a.bne(T1, 0)?;
        a.patch_jump(&int_back, int_top)?;

        let no_sign = a.beq(T3, 0)?;
        a.li(A6, i64::from(b'-'))?;
        a.addi(T5, T5, -1)?;
        a.sb(T5, 0, A6)?;
        let at = a.pos();
        a.patch_jump(&no_sign, at)?;

        a.sub(12, T4, T5)?; // a2 = len
        a.addi(11, T5, 0)?; // a1 = ptr
        a.addi(10, 0, 1)?; // a0 = stdout
        a.li(nr, nums.write as i64)?;
        a.ecall();
        a.ret_();
    }
    Ok(())
}
