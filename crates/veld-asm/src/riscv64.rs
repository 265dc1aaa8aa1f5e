//! RV64GC instruction emitter.
//!
//! Uncompressed 32-bit encodings built from the six base formats of the
//! RISC-V unprivileged spec (R/I/S/B/U/J). The G+C profile carries no
//! vector extension, so the packed-double operations other ISAs provide
//! natively are exposed here as scalar expansion helpers over pairs of
//! float registers.
//!
//! Load-immediate expands value-dependently (the classic `li`
//! decomposition); every other operation has a fixed length.

use crate::buffer::SectionBuffer;
use crate::emit::{Cond, Emitter, Frame, Patch, PatchKind};
use crate::stack_check::StackChecker;
use crate::target::Isa;
use crate::{AsmError, AsmResult};

const ZERO: u8 = 0;
const RA: u8 = 1;
const SP: u8 = 2;
const T0: u8 = 5;
const S0: u8 = 8;

/// RV64 emitter over the text stream.
pub struct Rv64<'a> {
    out: &'a mut SectionBuffer,
    stack: StackChecker,
}

impl<'a> Rv64<'a> {
    pub fn new(out: &'a mut SectionBuffer) -> Self {
        Self {
            out,
            stack: StackChecker::new(),
        }
    }

    pub fn stack(&self) -> &StackChecker {
        &self.stack
    }

    fn word(&mut self, w: u32) {
        self.out.write_u32(w);
    }

    fn reg(r: u8) -> AsmResult<u32> {
        if r < 32 {
            Ok(u32::from(r))
        } else {
            Err(AsmError::RegisterRange {
                num: r,
                what: "register",
                isa: Isa::Riscv64,
            })
        }
    }

    fn imm12(v: i32) -> AsmResult<u32> {
        if (-2048..2048).contains(&v) {
            Ok((v as u32) & 0xfff)
        } else {
            Err(AsmError::ImmediateRange {
                value: v as i64,
                field: "imm12",
            })
        }
    }

    fn r_type(&mut self, funct7: u32, rs2: u8, rs1: u8, funct3: u32, rd: u8, op: u32) -> AsmResult<()> {
        let rs2 = Self::reg(rs2)?;
        let rs1 = Self::reg(rs1)?;
        let rd = Self::reg(rd)?;
        self.word(funct7 << 25 | rs2 << 20 | rs1 << 15 | funct3 << 12 | rd << 7 | op);
        Ok(())
    }

    fn i_type(&mut self, imm: i32, rs1: u8, funct3: u32, rd: u8, op: u32) -> AsmResult<()> {
        let imm = Self::imm12(imm)?;
        let rs1 = Self::reg(rs1)?;
        let rd = Self::reg(rd)?;
        self.word(imm << 20 | rs1 << 15 | funct3 << 12 | rd << 7 | op);
        Ok(())
    }

    fn s_type(&mut self, imm: i32, rs2: u8, rs1: u8, funct3: u32, op: u32) -> AsmResult<()> {
        let imm = Self::imm12(imm)?;
        let rs2 = Self::reg(rs2)?;
        let rs1 = Self::reg(rs1)?;
        self.word(
            (imm >> 5) << 25 | rs2 << 20 | rs1 << 15 | funct3 << 12 | (imm & 0x1f) << 7 | op,
        );
        Ok(())
    }

    // ── Integer arithmetic ───────────────────────────────────────────

    pub fn add(&mut self, rd: u8, rs1: u8, rs2: u8) -> AsmResult<()> {
        self.r_type(0x00, rs2, rs1, 0, rd, 0x33)
    }

    pub fn sub(&mut self, rd: u8, rs1: u8, rs2: u8) -> AsmResult<()> {
        self.r_type(0x20, rs2, rs1, 0, rd, 0x33)
    }

    pub fn mul(&mut self, rd: u8, rs1: u8, rs2: u8) -> AsmResult<()> {
        self.r_type(0x01, rs2, rs1, 0, rd, 0x33)
    }

    pub fn div(&mut self, rd: u8, rs1: u8, rs2: u8) -> AsmResult<()> {
        self.r_type(0x01, rs2, rs1, 4, rd, 0x33)
    }

    pub fn divu(&mut self, rd: u8, rs1: u8, rs2: u8) -> AsmResult<()> {
        self.r_type(0x01, rs2, rs1, 5, rd, 0x33)
    }

    pub fn rem(&mut self, rd: u8, rs1: u8, rs2: u8) -> AsmResult<()> {
        self.r_type(0x01, rs2, rs1, 6, rd, 0x33)
    }

    pub fn remu(&mut self, rd: u8, rs1: u8, rs2: u8) -> AsmResult<()> {
        self.r_type(0x01, rs2, rs1, 7, rd, 0x33)
    }

    pub fn and(&mut self, rd: u8, rs1: u8, rs2: u8) -> AsmResult<()> {
        self.r_type(0x00, rs2, rs1, 7, rd, 0x33)
    }

    pub fn or(&mut self, rd: u8, rs1: u8, rs2: u8) -> AsmResult<()> {
        self.r_type(0x00, rs2, rs1, 6, rd, 0x33)
    }

    pub fn xor(&mut self, rd: u8, rs1: u8, rs2: u8) -> AsmResult<()> {
        self.r_type(0x00, rs2, rs1, 4, rd, 0x33)
    }

    pub fn sll(&mut self, rd: u8, rs1: u8, rs2: u8) -> AsmResult<()> {
        self.r_type(0x00, rs2, rs1, 1, rd, 0x33)
    }

    pub fn srl(&mut self, rd: u8, rs1: u8, rs2: u8) -> AsmResult<()> {
        self.r_type(0x00, rs2, rs1, 5, rd, 0x33)
    }

    pub fn sra(&mut self, rd: u8, rs1: u8, rs2: u8) -> AsmResult<()> {
        self.r_type(0x20, rs2, rs1, 5, rd, 0x33)
    }

    pub fn addi(&mut self, rd: u8, rs1: u8, imm: i32) -> AsmResult<()> {
        self.i_type(imm, rs1, 0, rd, 0x13)
    }

    pub fn andi(&mut self, rd: u8, rs1: u8, imm: i32) -> AsmResult<()> {
        self.i_type(imm, rs1, 7, rd, 0x13)
    }

    pub fn ori(&mut self, rd: u8, rs1: u8, imm: i32) -> AsmResult<()> {
        self.i_type(imm, rs1, 6, rd, 0x13)
    }

    pub fn xori(&mut self, rd: u8, rs1: u8, imm: i32) -> AsmResult<()> {
        self.i_type(imm, rs1, 4, rd, 0x13)
    }

    /// `not rd, rs` (xori with -1).
    pub fn not(&mut self, rd: u8, rs1: u8) -> AsmResult<()> {
        self.xori(rd, rs1, -1)
    }

    /// `neg rd, rs` (sub from zero).
    pub fn neg(&mut self, rd: u8, rs2: u8) -> AsmResult<()> {
        self.sub(rd, ZERO, rs2)
    }

    pub fn slli(&mut self, rd: u8, rs1: u8, shamt: u8) -> AsmResult<()> {
        let rs1 = Self::reg(rs1)?;
        let rd = Self::reg(rd)?;
        self.word(u32::from(shamt & 63) << 20 | rs1 << 15 | 1 << 12 | rd << 7 | 0x13);
        Ok(())
    }

    pub fn srli(&mut self, rd: u8, rs1: u8, shamt: u8) -> AsmResult<()> {
        let rs1 = Self::reg(rs1)?;
        let rd = Self::reg(rd)?;
        self.word(u32::from(shamt & 63) << 20 | rs1 << 15 | 5 << 12 | rd << 7 | 0x13);
        Ok(())
    }

    pub fn srai(&mut self, rd: u8, rs1: u8, shamt: u8) -> AsmResult<()> {
        let rs1 = Self::reg(rs1)?;
        let rd = Self::reg(rd)?;
        self.word(
            (0x400 | u32::from(shamt & 63)) << 20 | rs1 << 15 | 5 << 12 | rd << 7 | 0x13,
        );
        Ok(())
    }

    pub fn lui(&mut self, rd: u8, imm20: u32) -> AsmResult<()> {
        let rd = Self::reg(rd)?;
        self.word((imm20 & 0xfffff) << 12 | rd << 7 | 0x37);
        Ok(())
    }

    pub fn auipc(&mut self, rd: u8, imm20: u32) -> AsmResult<()> {
        let rd = Self::reg(rd)?;
        self.word((imm20 & 0xfffff) << 12 | rd << 7 | 0x17);
        Ok(())
    }

    /// `addiw rd, rs1, imm` (32-bit add, sign-extended).
    pub fn addiw(&mut self, rd: u8, rs1: u8, imm: i32) -> AsmResult<()> {
        self.i_type(imm, rs1, 0, rd, 0x1b)
    }

    /// Materialize a 64-bit immediate with the classic `li`
    /// decomposition. Length is value-dependent but identical for the
    /// same value across both codegen passes.
    pub fn li(&mut self, rd: u8, imm: i64) -> AsmResult<()> {
        if (-2048..2048).contains(&imm) {
            return self.addi(rd, ZERO, imm as i32);
        }
        if let Ok(imm32) = i32::try_from(imm) {
            let lo = (imm32 << 20) >> 20;
            let hi = (imm32.wrapping_sub(lo) as u32) >> 12;
            self.lui(rd, hi)?;
            if lo != 0 {
                self.addiw(rd, rd, lo)?;
            }
            return Ok(());
        }
        let lo = ((imm << 52) >> 52) as i32;
        let rest = imm.wrapping_sub(i64::from(lo)) >> 12;
        self.li(rd, rest)?;
        self.slli(rd, rd, 12)?;
        if lo != 0 {
            self.addi(rd, rd, lo)?;
        }
        Ok(())
    }

    // ── Loads and stores ─────────────────────────────────────────────

    pub fn ld(&mut self, rd: u8, base: u8, disp: i32) -> AsmResult<()> {
        self.i_type(disp, base, 3, rd, 0x03)
    }

    pub fn sd(&mut self, base: u8, disp: i32, rs: u8) -> AsmResult<()> {
        self.s_type(disp, rs, base, 3, 0x23)
    }

    pub fn lbu(&mut self, rd: u8, base: u8, disp: i32) -> AsmResult<()> {
        self.i_type(disp, base, 4, rd, 0x03)
    }

    pub fn sb(&mut self, base: u8, disp: i32, rs: u8) -> AsmResult<()> {
        self.s_type(disp, rs, base, 0, 0x23)
    }

    pub fn fld(&mut self, fd: u8, base: u8, disp: i32) -> AsmResult<()> {
        self.i_type(disp, base, 3, fd, 0x07)
    }

    pub fn fsd(&mut self, base: u8, disp: i32, fs: u8) -> AsmResult<()> {
        self.s_type(disp, fs, base, 3, 0x27)
    }

    // ── Control flow ─────────────────────────────────────────────────

    /// `jal rd, 0` with the displacement patched later.
    pub fn jal(&mut self, rd: u8) -> AsmResult<Patch> {
        let rd = Self::reg(rd)?;
        let at = self.out.len();
        self.word(rd << 7 | 0x6f);
        Ok(Patch {
            at,
            kind: PatchKind::Jal20,
        })
    }

    pub fn jalr(&mut self, rd: u8, rs1: u8, imm: i32) -> AsmResult<()> {
        self.i_type(imm, rs1, 0, rd, 0x67)
    }

    /// `ret` (jalr x0, ra, 0).
    pub fn ret_(&mut self) {
        self.word(0x0000_8067);
    }

    fn branch(&mut self, funct3: u32, rs1: u8, rs2: u8) -> AsmResult<Patch> {
        let rs1 = Self::reg(rs1)?;
        let rs2 = Self::reg(rs2)?;
        let at = self.out.len();
        self.word(rs2 << 20 | rs1 << 15 | funct3 << 12 | 0x63);
        Ok(Patch {
            at,
            kind: PatchKind::B12,
        })
    }

    pub fn beq(&mut self, rs1: u8, rs2: u8) -> AsmResult<Patch> {
        self.branch(0, rs1, rs2)
    }

    pub fn bne(&mut self, rs1: u8, rs2: u8) -> AsmResult<Patch> {
        self.branch(1, rs1, rs2)
    }

    pub fn blt(&mut self, rs1: u8, rs2: u8) -> AsmResult<Patch> {
        self.branch(4, rs1, rs2)
    }

    pub fn bge(&mut self, rs1: u8, rs2: u8) -> AsmResult<Patch> {
        self.branch(5, rs1, rs2)
    }

    pub fn bltu(&mut self, rs1: u8, rs2: u8) -> AsmResult<Patch> {
        self.branch(6, rs1, rs2)
    }

    pub fn bgeu(&mut self, rs1: u8, rs2: u8) -> AsmResult<Patch> {
        self.branch(7, rs1, rs2)
    }

    /// Conditional branch with a fixed +8 displacement, used to skip
    /// the `jal` of a synthesized long branch.
    fn branch_skip8(&mut self, funct3: u32, rs1: u8, rs2: u8) -> AsmResult<()> {
        let rs1 = Self::reg(rs1)?;
        let rs2 = Self::reg(rs2)?;
        // B-type immediate 8: imm[4:1] = 0b0100.
        self.word(rs2 << 20 | rs1 << 15 | funct3 << 12 | 0x400 | 0x63);
        Ok(())
    }

    pub fn ecall(&mut self) {
        self.word(0x0000_0073);
    }

    pub fn nop(&mut self) {
        self.word(0x0000_0013); // addi x0, x0, 0
    }

    /// `auipc rd, 0` + `addi rd, rd, 0`, patched as a pair.
    pub fn auipc_addi(&mut self, rd: u8) -> AsmResult<Patch> {
        let at = self.out.len();
        self.auipc(rd, 0)?;
        self.addi(rd, rd, 0)?;
        Ok(Patch {
            at,
            kind: PatchKind::AuipcAddi,
        })
    }

    // ── Floating point (D extension) ─────────────────────────────────

    fn f_op(&mut self, funct7: u32, rs2: u8, rs1: u8, rm: u32, rd: u8) -> AsmResult<()> {
        let rs2 = Self::reg(rs2)?;
        let rs1 = Self::reg(rs1)?;
        let rd = Self::reg(rd)?;
        self.word(funct7 << 25 | rs2 << 20 | rs1 << 15 | rm << 12 | rd << 7 | 0x53);
        Ok(())
    }

    pub fn fadd_d(&mut self, fd: u8, fs1: u8, fs2: u8) -> AsmResult<()> {
        self.f_op(0x01, fs2, fs1, 7, fd)
    }

    pub fn fsub_d(&mut self, fd: u8, fs1: u8, fs2: u8) -> AsmResult<()> {
        self.f_op(0x05, fs2, fs1, 7, fd)
    }

    pub fn fmul_d(&mut self, fd: u8, fs1: u8, fs2: u8) -> AsmResult<()> {
        self.f_op(0x09, fs2, fs1, 7, fd)
    }

    pub fn fdiv_d(&mut self, fd: u8, fs1: u8, fs2: u8) -> AsmResult<()> {
        self.f_op(0x0d, fs2, fs1, 7, fd)
    }

    pub fn fsqrt_d(&mut self, fd: u8, fs1: u8) -> AsmResult<()> {
        self.f_op(0x2d, 0, fs1, 7, fd)
    }

    pub fn fmin_d(&mut self, fd: u8, fs1: u8, fs2: u8) -> AsmResult<()> {
        self.f_op(0x15, fs2, fs1, 0, fd)
    }

    pub fn fmax_d(&mut self, fd: u8, fs1: u8, fs2: u8) -> AsmResult<()> {
        self.f_op(0x15, fs2, fs1, 1, fd)
    }

    /// `fmv.d fd, fs` (sign-injection with itself).
    pub fn fmv_d(&mut self, fd: u8, fs: u8) -> AsmResult<()> {
        self.f_op(0x11, fs, fs, 0, fd)
    }

    /// `fneg.d fd, fs` (sign-injection, negated).
    pub fn fneg_d(&mut self, fd: u8, fs: u8) -> AsmResult<()> {
        self.f_op(0x11, fs, fs, 1, fd)
    }

    /// `fmadd.d fd, fs1, fs2, fs3`: fd = fs1*fs2 + fs3.
    pub fn fmadd_d(&mut self, fd: u8, fs1: u8, fs2: u8, fs3: u8) -> AsmResult<()> {
        let fs3 = Self::reg(fs3)?;
        let fs2 = Self::reg(fs2)?;
        let fs1 = Self::reg(fs1)?;
        let fd = Self::reg(fd)?;
        self.word(fs3 << 27 | 1 << 25 | fs2 << 20 | fs1 << 15 | 7 << 12 | fd << 7 | 0x43);
        Ok(())
    }

    pub fn feq_d(&mut self, rd: u8, fs1: u8, fs2: u8) -> AsmResult<()> {
        self.f_op(0x51, fs2, fs1, 2, rd)
    }

    pub fn flt_d(&mut self, rd: u8, fs1: u8, fs2: u8) -> AsmResult<()> {
        self.f_op(0x51, fs2, fs1, 1, rd)
    }

    pub fn fle_d(&mut self, rd: u8, fs1: u8, fs2: u8) -> AsmResult<()> {
        self.f_op(0x51, fs2, fs1, 0, rd)
    }

    /// `fcvt.d.l fd, rs` (int to double).
    pub fn fcvt_d_l(&mut self, fd: u8, rs: u8) -> AsmResult<()> {
        self.f_op(0x69, 2, rs, 7, fd)
    }

    /// `fcvt.l.d rd, fs` with round-toward-zero.
    pub fn fcvt_l_d(&mut self, rd: u8, fs: u8) -> AsmResult<()> {
        self.f_op(0x61, 2, fs, 1, rd)
    }

    /// `fmv.x.d rd, fs` (raw bits).
    pub fn fmv_x_d(&mut self, rd: u8, fs: u8) -> AsmResult<()> {
        self.f_op(0x71, 0, fs, 0, rd)
    }

    /// `fmv.d.x fd, rs` (raw bits).
    pub fn fmv_d_x(&mut self, fd: u8, rs: u8) -> AsmResult<()> {
        self.f_op(0x79, 0, rs, 0, fd)
    }

    // ── Packed-double expansion helpers ──────────────────────────────
    //
    // RV64GC has no vector extension; these lower a two-lane packed
    // operation to scalar ops over adjacent register pairs so callers
    // written against the wider ISAs still have a lowering path.

    pub fn vfadd_2d(&mut self, fd: u8, fs1: u8, fs2: u8) -> AsmResult<()> {
        self.fadd_d(fd, fs1, fs2)?;
        self.fadd_d(fd + 1, fs1 + 1, fs2 + 1)
    }

    pub fn vfmul_2d(&mut self, fd: u8, fs1: u8, fs2: u8) -> AsmResult<()> {
        self.fmul_d(fd, fs1, fs2)?;
        self.fmul_d(fd + 1, fs1 + 1, fs2 + 1)
    }

    pub fn vfsqrt_2d(&mut self, fd: u8, fs1: u8) -> AsmResult<()> {
        self.fsqrt_d(fd, fs1)?;
        self.fsqrt_d(fd + 1, fs1 + 1)
    }

    fn saved_total(frame: &Frame) -> u32 {
        // ra + s0 + saved registers + spills, 16-aligned.
        (16 + frame.saved.len() as u32 * 8 + frame.spill_bytes() + 15) & !15
    }
}

impl Emitter for Rv64<'_> {
    fn isa(&self) -> Isa {
        Isa::Riscv64
    }

    fn pos(&self) -> usize {
        self.out.len()
    }

    fn stack_is_balanced(&self) -> bool {
        self.stack.is_balanced()
    }

    fn mov_ri(&mut self, rd: u8, imm: u64) -> AsmResult<()> {
        self.li(rd, imm as i64)
    }

    fn mov_rr(&mut self, rd: u8, rs: u8) -> AsmResult<()> {
        self.addi(rd, rs, 0)
    }

    fn add_rr(&mut self, rd: u8, rs: u8) -> AsmResult<()> {
        self.add(rd, rd, rs)
    }

    fn sub_rr(&mut self, rd: u8, rs: u8) -> AsmResult<()> {
        self.sub(rd, rd, rs)
    }

    fn mul_rr(&mut self, rd: u8, rs: u8) -> AsmResult<()> {
        self.mul(rd, rd, rs)
    }

    fn and_rr(&mut self, rd: u8, rs: u8) -> AsmResult<()> {
        self.and(rd, rd, rs)
    }

    fn or_rr(&mut self, rd: u8, rs: u8) -> AsmResult<()> {
        self.or(rd, rd, rs)
    }

    fn xor_rr(&mut self, rd: u8, rs: u8) -> AsmResult<()> {
        self.xor(rd, rd, rs)
    }

    fn add_ri(&mut self, rd: u8, imm: i32) -> AsmResult<()> {
        self.addi(rd, rd, imm)
    }

    fn shl_ri(&mut self, rd: u8, amount: u8) -> AsmResult<()> {
        self.slli(rd, rd, amount)
    }

    fn shr_ri(&mut self, rd: u8, amount: u8) -> AsmResult<()> {
        self.srli(rd, rd, amount)
    }

    fn fmov_rr(&mut self, fd: u8, fs: u8) -> AsmResult<()> {
        self.fmv_d(fd, fs)
    }

    fn fadd(&mut self, fd: u8, fs: u8) -> AsmResult<()> {
        self.fadd_d(fd, fd, fs)
    }

    fn fsub(&mut self, fd: u8, fs: u8) -> AsmResult<()> {
        self.fsub_d(fd, fd, fs)
    }

    fn fmul(&mut self, fd: u8, fs: u8) -> AsmResult<()> {
        self.fmul_d(fd, fd, fs)
    }

    fn fdiv(&mut self, fd: u8, fs: u8) -> AsmResult<()> {
        self.fdiv_d(fd, fd, fs)
    }

    fn fsqrt(&mut self, fd: u8, fs: u8) -> AsmResult<()> {
        self.fsqrt_d(fd, fs)
    }

    fn fzero(&mut self, fd: u8) -> AsmResult<()> {
        self.fmv_d_x(fd, ZERO)
    }

    fn fmov_const(&mut self, fd: u8, bits: u64, scratch: u8) -> AsmResult<()> {
        self.li(scratch, bits as i64)?;
        self.fmv_d_x(fd, scratch)
    }

    fn f2i(&mut self, rd: u8, fs: u8) -> AsmResult<()> {
        self.fcvt_l_d(rd, fs)
    }

    fn i2f(&mut self, fd: u8, rs: u8) -> AsmResult<()> {
        self.fcvt_d_l(fd, rs)
    }

    fn fbits_to_gpr(&mut self, rd: u8, fs: u8) -> AsmResult<()> {
        self.fmv_x_d(rd, fs)
    }

    fn gpr_to_fbits(&mut self, fd: u8, rs: u8) -> AsmResult<()> {
        self.fmv_d_x(fd, rs)
    }

    fn load_gpr(&mut self, rd: u8, base: u8, disp: i32) -> AsmResult<()> {
        self.ld(rd, base, disp)
    }

    fn store_gpr(&mut self, base: u8, disp: i32, rs: u8) -> AsmResult<()> {
        self.sd(base, disp, rs)
    }

    fn fload(&mut self, fd: u8, base: u8, disp: i32) -> AsmResult<()> {
        self.fld(fd, base, disp)
    }

    fn fstore(&mut self, base: u8, disp: i32, fs: u8) -> AsmResult<()> {
        self.fsd(base, disp, fs)
    }

    fn push_gpr(&mut self, rs: u8) -> AsmResult<()> {
        self.addi(SP, SP, -16)?;
        self.sd(SP, 0, rs)?;
        self.stack.grow(16);
        Ok(())
    }

    fn pop_gpr(&mut self, rd: u8) -> AsmResult<()> {
        self.ld(rd, SP, 0)?;
        self.addi(SP, SP, 16)?;
        self.stack.shrink(16);
        Ok(())
    }

    fn fpush(&mut self, fs: u8) -> AsmResult<()> {
        self.addi(SP, SP, -16)?;
        self.fsd(SP, 0, fs)?;
        self.stack.grow(16);
        Ok(())
    }

    fn fpop(&mut self, fd: u8) -> AsmResult<()> {
        self.fld(fd, SP, 0)?;
        self.addi(SP, SP, 16)?;
        self.stack.shrink(16);
        Ok(())
    }

    fn prologue(&mut self, frame: &Frame) -> AsmResult<()> {
        let total = Self::saved_total(frame);
        self.addi(SP, SP, -(total as i32))?;
        self.sd(SP, total as i32 - 8, RA)?;
        self.sd(SP, total as i32 - 16, S0)?;
        self.addi(S0, SP, total as i32)?;
        for (i, &r) in frame.saved.iter().enumerate() {
            self.sd(SP, (frame.spill_bytes() + i as u32 * 8) as i32, r)?;
        }
        self.stack.enter_frame(total);
        Ok(())
    }

    fn epilogue(&mut self, frame: &Frame) -> AsmResult<()> {
        let total = Self::saved_total(frame);
        self.stack.leave_frame(total);
        for (i, &r) in frame.saved.iter().enumerate() {
            self.ld(r, SP, (frame.spill_bytes() + i as u32 * 8) as i32)?;
        }
        self.ld(RA, SP, total as i32 - 8)?;
        self.ld(S0, SP, total as i32 - 16)?;
        self.addi(SP, SP, total as i32)?;
        Ok(())
    }

    fn spill_fstore(&mut self, frame: &Frame, slot: u32, fs: u8) -> AsmResult<()> {
        // s0-relative: sp moves under pushed temporaries. Slot `i`
        // sits at `sp + 8*i` right after the prologue, i.e.
        // `s0 - total + 8*i`.
        let off = (slot as i32) * 8 - Self::saved_total(frame) as i32;
        self.fsd(S0, off, fs)
    }

    fn spill_fload(&mut self, fd: u8, frame: &Frame, slot: u32) -> AsmResult<()> {
        let off = (slot as i32) * 8 - Self::saved_total(frame) as i32;
        self.fld(fd, S0, off)
    }

    fn jmp_placeholder(&mut self) -> Patch {
        self.jal(ZERO).expect("x0 is always encodable")
    }

    fn br_fcmp(&mut self, cond: Cond, a: u8, b: u8) -> AsmResult<Patch> {
        // Compare into t0, then a long branch: the conditional B-type
        // form only reaches ±4 KiB, so the taken path is an inverted
        // skip over a jal with its ±1 MiB range.
        let skip_if_zero = match cond {
            Cond::Eq => {
                self.feq_d(T0, a, b)?;
                true
            }
            Cond::Ne => {
                self.feq_d(T0, a, b)?;
                false
            }
            Cond::Lt => {
                self.flt_d(T0, a, b)?;
                true
            }
            Cond::Le => {
                self.fle_d(T0, a, b)?;
                true
            }
            Cond::Gt => {
                self.flt_d(T0, b, a)?;
                true
            }
            Cond::Ge => {
                self.fle_d(T0, b, a)?;
                true
            }
        };
        // Skip the jal when the condition does NOT hold.
        if skip_if_zero {
            self.branch_skip8(0, T0, ZERO)?; // beq t0, x0, +8
        } else {
            self.branch_skip8(1, T0, ZERO)?; // bne t0, x0, +8
        }
        Ok(self.jmp_placeholder())
    }

    fn br_icmp(&mut self, cond: Cond, a: u8, b: u8) -> AsmResult<Patch> {
        // Inverted short branch over a jal, as above.
        match cond {
            Cond::Eq => self.branch_skip8(1, a, b)?, // bne +8
            Cond::Ne => self.branch_skip8(0, a, b)?, // beq +8
            Cond::Lt => self.branch_skip8(5, a, b)?, // bge +8
            Cond::Ge => self.branch_skip8(4, a, b)?, // blt +8
            Cond::Gt => self.branch_skip8(5, b, a)?,
            Cond::Le => self.branch_skip8(4, b, a)?,
        }
        Ok(self.jmp_placeholder())
    }

    fn call_placeholder(&mut self) -> Patch {
        self.jal(RA).expect("ra is always encodable")
    }

    fn call_reg(&mut self, rs: u8) -> AsmResult<()> {
        self.jalr(RA, rs, 0)
    }

    fn ret(&mut self) {
        self.ret_();
    }

    fn syscall(&mut self) {
        self.ecall();
    }

    fn load_sym_addr(&mut self, rd: u8) -> AsmResult<Patch> {
        self.auipc_addi(rd)
    }

    fn patch_jump(&mut self, patch: &Patch, target: usize) -> AsmResult<()> {
        crate::emit::apply_patch(self.out, patch, 0, target as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit(f: impl FnOnce(&mut Rv64)) -> Vec<u32> {
        let mut buf = SectionBuffer::new("text");
        let mut asm = Rv64::new(&mut buf);
        f(&mut asm);
        buf.bytes()
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn test_r_type() {
        assert_eq!(emit(|a| a.add(1, 2, 3).unwrap()), [0x003100b3]);
        assert_eq!(emit(|a| a.sub(1, 2, 3).unwrap()), [0x403100b3]);
        assert_eq!(emit(|a| a.mul(1, 2, 3).unwrap()), [0x023100b3]);
        assert_eq!(emit(|a| a.divu(1, 2, 3).unwrap()), [0x023150b3]);
        // High register numbers.
        assert_eq!(emit(|a| a.add(31, 30, 29).unwrap()), [0x01df0fb3]);
    }

    #[test]
    fn test_i_type() {
        assert_eq!(emit(|a| a.addi(10, 10, 1).unwrap()), [0x00150513]);
        assert_eq!(emit(|a| a.addi(10, 10, -1).unwrap()), [0xfff50513]);
        assert_eq!(emit(|a| a.ld(10, 2, 0).unwrap()), [0x00013503]);
        assert!(emit(|a| {
            let _ = a.addi(10, 10, 4096);
        })
        .is_empty());
    }

    #[test]
    fn test_s_type() {
        assert_eq!(emit(|a| a.sd(2, 0, 10).unwrap()), [0x00a13023]);
        assert_eq!(emit(|a| a.sd(2, 8, 10).unwrap()), [0x00a13423]);
        // Byte forms.
        assert_eq!(emit(|a| a.lbu(10, 2, 0).unwrap()), [0x00014503]);
        assert_eq!(emit(|a| a.sb(2, 0, 10).unwrap()), [0x00a10023]);
    }

    #[test]
    fn test_packed_double_expansion() {
        // No vector extension in the G+C profile: two scalar ops over
        // adjacent register pairs.
        let words = emit(|a| a.vfadd_2d(0, 2, 4).unwrap());
        assert_eq!(words.len(), 2);
        assert_eq!(words[0], 0x02000000 | 4 << 20 | 2 << 15 | 7 << 12 | 0x53);
        assert_eq!(
            words[1],
            0x02000000 | 5 << 20 | 3 << 15 | 7 << 12 | 1 << 7 | 0x53
        );
        assert_eq!(emit(|a| a.vfsqrt_2d(0, 2).unwrap()).len(), 2);
        assert_eq!(emit(|a| a.vfmul_2d(0, 2, 4).unwrap()).len(), 2);
    }

    #[test]
    fn test_long_branch_is_skip_plus_jal() {
        let mut buf = SectionBuffer::new("text");
        let mut asm = Rv64::new(&mut buf);
        let p = asm.br_icmp(Cond::Lt, 10, 11).unwrap();
        // bge a0, a1, +8 then jal x0, placeholder.
        let skip = buf.read_u32(0);
        assert_eq!(skip & 0x7f, 0x63);
        assert_eq!((skip >> 12) & 7, 5); // bge
        let jal = buf.read_u32(4);
        assert_eq!(jal & 0xfff, 0x6f); // jal x0
        assert_eq!(p.at, 4);
    }

    #[test]
    fn test_u_and_j_type() {
        assert_eq!(emit(|a| a.lui(10, 0x12345).unwrap()), [0x12345537]);
        assert_eq!(emit(|a| a.auipc(28, 0).unwrap()), [0x00000e17]);
        assert_eq!(
            emit(|a| {
                a.jal(0).unwrap();
            }),
            [0x0000006f]
        );
        assert_eq!(
            emit(|a| {
                a.jal(1).unwrap();
            }),
            [0x000000ef]
        );
    }

    #[test]
    fn test_system() {
        assert_eq!(emit(|a| a.ecall()), [0x00000073]);
        assert_eq!(emit(|a| a.ret_()), [0x00008067]);
        assert_eq!(emit(|a| a.nop()), [0x00000013]);
    }

    #[test]
    fn test_float_ops() {
        assert_eq!(emit(|a| a.fadd_d(10, 11, 12).unwrap()), [0x02c5f553]);
        assert_eq!(emit(|a| a.fmv_x_d(10, 10).unwrap()), [0xe2050553]);
        assert_eq!(emit(|a| a.fmv_d_x(10, 10).unwrap()), [0xf2050553]);
        assert_eq!(emit(|a| a.flt_d(10, 10, 11).unwrap()), [0xa2b51553]);
    }

    #[test]
    fn test_li_small() {
        assert_eq!(emit(|a| a.li(10, 42).unwrap()), [0x02a00513]);
    }

    #[test]
    fn test_li_32bit() {
        // li a0, 0x12345678: lui + addiw with carry on the low chunk.
        let words = emit(|a| a.li(10, 0x12345678).unwrap());
        assert_eq!(words.len(), 2);
        assert_eq!(words[0] & 0x7f, 0x37); // lui
        assert_eq!(words[1] & 0x7f, 0x1b); // addiw
        let hi = (words[0] >> 12) as i64;
        let lo = (((words[1] >> 20) as i32) << 20 >> 20) as i64;
        assert_eq!((hi << 12) + lo, 0x12345678);
    }

    #[test]
    fn test_li_64bit_reconstructs() {
        // Walk the emitted words and simulate the decomposition.
        let value: i64 = 0x1122_3344_5566_7788;
        let words = emit(|a| a.li(10, value).unwrap());
        let mut acc: i64 = 0;
        for w in words {
            match w & 0x7f {
                0x37 => acc = i64::from((w & 0xffff_f000) as i32),
                0x1b | 0x13 if (w >> 12) & 7 == 0 => {
                    let imm = i64::from(((w >> 20) as i32) << 20 >> 20);
                    acc += imm;
                }
                0x13 if (w >> 12) & 7 == 1 => {
                    let sh = (w >> 20) & 63;
                    acc <<= sh;
                }
                other => panic!("unexpected opcode {other:#x} in li expansion"),
            }
        }
        assert_eq!(acc, value);
    }

    #[test]
    fn test_branch_placeholder_patches() {
        use crate::emit::apply_patch;
        let mut buf = SectionBuffer::new("text");
        let mut asm = Rv64::new(&mut buf);
        let p = asm.beq(10, 0).unwrap();
        apply_patch(&mut buf, &p, 0, 8).unwrap();
        let w = buf.read_u32(0);
        // Decode B-type immediate.
        let imm = ((w >> 31) & 1) << 12
            | ((w >> 7) & 1) << 11
            | ((w >> 25) & 0x3f) << 5
            | ((w >> 8) & 0xf) << 1;
        assert_eq!(imm, 8);
    }

    #[test]
    fn test_register_validation() {
        let mut buf = SectionBuffer::new("text");
        let mut asm = Rv64::new(&mut buf);
        assert!(asm.add(32, 0, 0).is_err());
        assert!(asm.fadd_d(32, 0, 0).is_err());
        assert_eq!(buf.len(), 0);
    }
}
