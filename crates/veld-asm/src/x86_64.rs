//! x86-64 instruction emitter.
//!
//! Every operation appends the byte-exact Intel SDM encoding: legacy
//! prefix, REX (only when required), opcode, ModRM/SIB, displacement,
//! immediate. Instruction lengths are deterministic for a given operand
//! combination; the layout model depends on that.
//!
//! Call sites and symbol-address loads write the `0x12345678` placeholder
//! displacement and hand the patch position back to the caller; the
//! relocation patcher rewrites it once layout has assigned addresses.
//!
//! The vector family (VEX 128/256, EVEX 512, VSIB gathers) lives on the
//! inherent impl only; the portable [`Emitter`] trait covers the scalar
//! surface the codegen driver uses.

use crate::buffer::SectionBuffer;
use crate::emit::{Cond, Emitter, Frame, Patch, PatchKind};
use crate::stack_check::StackChecker;
use crate::target::Isa;
use crate::{AsmError, AsmResult};

/// Placeholder displacement for call sites and symbol loads, by
/// convention `78 56 34 12` in the byte stream.
pub const PLACEHOLDER: u32 = 0x1234_5678;

const RSP: u8 = 4;
const RBP: u8 = 5;
const R13: u8 = 13;

/// x86-64 emitter over the text stream.
pub struct X64<'a> {
    out: &'a mut SectionBuffer,
    stack: StackChecker,
}

impl<'a> X64<'a> {
    pub fn new(out: &'a mut SectionBuffer) -> Self {
        Self {
            out,
            stack: StackChecker::new(),
        }
    }

    /// The paired stack validator.
    pub fn stack(&self) -> &StackChecker {
        &self.stack
    }

    // ── Encoding primitives ──────────────────────────────────────────

    fn gpr(r: u8) -> AsmResult<u8> {
        if r < 16 {
            Ok(r)
        } else {
            Err(AsmError::RegisterRange {
                num: r,
                what: "gpr",
                isa: Isa::X86_64,
            })
        }
    }

    fn xmm(r: u8) -> AsmResult<u8> {
        if r < 16 {
            Ok(r)
        } else {
            Err(AsmError::RegisterRange {
                num: r,
                what: "xmm (VEX/SSE)",
                isa: Isa::X86_64,
            })
        }
    }

    fn xmm32(r: u8) -> AsmResult<u8> {
        if r < 32 {
            Ok(r)
        } else {
            Err(AsmError::RegisterRange {
                num: r,
                what: "xmm (EVEX)",
                isa: Isa::X86_64,
            })
        }
    }

    fn kreg(r: u8) -> AsmResult<u8> {
        if r < 8 {
            Ok(r)
        } else {
            Err(AsmError::RegisterRange {
                num: r,
                what: "mask register",
                isa: Isa::X86_64,
            })
        }
    }

    fn rex(&mut self, w: bool, reg: u8, index: u8, rm: u8) {
        let rex = 0x40
            | (u8::from(w) << 3)
            | ((reg >> 3) & 1) << 2
            | ((index >> 3) & 1) << 1
            | ((rm >> 3) & 1);
        self.out.write_u8(rex);
    }

    /// REX only when one of the extended registers needs it.
    fn rex_opt(&mut self, reg: u8, index: u8, rm: u8) {
        if reg >= 8 || index >= 8 || rm >= 8 {
            self.rex(false, reg, index, rm);
        }
    }

    fn modrm(&mut self, mode: u8, reg: u8, rm: u8) {
        self.out.write_u8((mode << 6) | ((reg & 7) << 3) | (rm & 7));
    }

    /// ModRM(+SIB)+disp for a `[base + disp]` operand.
    ///
    /// Always uses disp8 or disp32 (never the no-displacement mode), so
    /// the encoding is uniform across bases including rbp/r13.
    fn mem(&mut self, reg: u8, base: u8, disp: i32) {
        let mode = if (-128..=127).contains(&disp) { 1 } else { 2 };
        self.modrm(mode, reg, base);
        if base & 7 == RSP {
            // rsp/r12 as base requires a SIB byte with no index.
            self.out.write_u8(0x24);
        }
        if mode == 1 {
            self.out.write_u8(disp as i8 as u8);
        } else {
            self.out.write_u32(disp as u32);
        }
    }

    // ── Integer ALU, register forms ──────────────────────────────────

    fn alu_rr(&mut self, opcode: u8, src: u8, dst: u8) -> AsmResult<()> {
        let src = Self::gpr(src)?;
        let dst = Self::gpr(dst)?;
        self.rex(true, src, 0, dst);
        self.out.write_u8(opcode);
        self.modrm(3, src, dst);
        Ok(())
    }

    pub fn add_rr_(&mut self, dst: u8, src: u8) -> AsmResult<()> {
        self.alu_rr(0x01, src, dst)
    }

    pub fn or_rr_(&mut self, dst: u8, src: u8) -> AsmResult<()> {
        self.alu_rr(0x09, src, dst)
    }

    pub fn and_rr_(&mut self, dst: u8, src: u8) -> AsmResult<()> {
        self.alu_rr(0x21, src, dst)
    }

    pub fn sub_rr_(&mut self, dst: u8, src: u8) -> AsmResult<()> {
        self.alu_rr(0x29, src, dst)
    }

    pub fn xor_rr_(&mut self, dst: u8, src: u8) -> AsmResult<()> {
        self.alu_rr(0x31, src, dst)
    }

    pub fn cmp_rr(&mut self, a: u8, b: u8) -> AsmResult<()> {
        // cmp a, b computes a - b.
        self.alu_rr(0x39, b, a)
    }

    pub fn test_rr(&mut self, a: u8, b: u8) -> AsmResult<()> {
        self.alu_rr(0x85, b, a)
    }

    /// `imul dst, src` (RM form).
    pub fn imul_rr(&mut self, dst: u8, src: u8) -> AsmResult<()> {
        let dst = Self::gpr(dst)?;
        let src = Self::gpr(src)?;
        self.rex(true, dst, 0, src);
        self.out.write_bytes(&[0x0f, 0xaf]);
        self.modrm(3, dst, src);
        Ok(())
    }

    fn alu_ri(&mut self, ext: u8, dst: u8, imm: i32) -> AsmResult<()> {
        let dst = Self::gpr(dst)?;
        self.rex(true, 0, 0, dst);
        self.out.write_u8(0x81);
        self.modrm(3, ext, dst);
        self.out.write_u32(imm as u32);
        Ok(())
    }

    pub fn add_ri_(&mut self, dst: u8, imm: i32) -> AsmResult<()> {
        self.alu_ri(0, dst, imm)
    }

    pub fn sub_ri(&mut self, dst: u8, imm: i32) -> AsmResult<()> {
        self.alu_ri(5, dst, imm)
    }

    pub fn and_ri(&mut self, dst: u8, imm: i32) -> AsmResult<()> {
        self.alu_ri(4, dst, imm)
    }

    pub fn cmp_ri(&mut self, dst: u8, imm: i32) -> AsmResult<()> {
        self.alu_ri(7, dst, imm)
    }

    /// F7-group unary ops.
    fn grp_f7(&mut self, ext: u8, rm: u8) -> AsmResult<()> {
        let rm = Self::gpr(rm)?;
        self.rex(true, 0, 0, rm);
        self.out.write_u8(0xf7);
        self.modrm(3, ext, rm);
        Ok(())
    }

    pub fn neg(&mut self, rm: u8) -> AsmResult<()> {
        self.grp_f7(3, rm)
    }

    pub fn not(&mut self, rm: u8) -> AsmResult<()> {
        self.grp_f7(2, rm)
    }

    /// Unsigned `div rm`: divides rdx:rax, quotient to rax.
    pub fn div(&mut self, rm: u8) -> AsmResult<()> {
        self.grp_f7(6, rm)
    }

    /// Signed `idiv rm`.
    pub fn idiv(&mut self, rm: u8) -> AsmResult<()> {
        self.grp_f7(7, rm)
    }

    /// Unsigned widening `mul rm` into rdx:rax.
    pub fn mul_wide(&mut self, rm: u8) -> AsmResult<()> {
        self.grp_f7(4, rm)
    }

    pub fn inc(&mut self, rm: u8) -> AsmResult<()> {
        let rm = Self::gpr(rm)?;
        self.rex(true, 0, 0, rm);
        self.out.write_u8(0xff);
        self.modrm(3, 0, rm);
        Ok(())
    }

    pub fn dec(&mut self, rm: u8) -> AsmResult<()> {
        let rm = Self::gpr(rm)?;
        self.rex(true, 0, 0, rm);
        self.out.write_u8(0xff);
        self.modrm(3, 1, rm);
        Ok(())
    }

    /// Sign-extend rax into rdx:rax (for idiv).
    pub fn cqo(&mut self) {
        self.out.write_bytes(&[0x48, 0x99]);
    }

    fn shift_ri(&mut self, ext: u8, rm: u8, amount: u8) -> AsmResult<()> {
        let rm = Self::gpr(rm)?;
        self.rex(true, 0, 0, rm);
        self.out.write_u8(0xc1);
        self.modrm(3, ext, rm);
        self.out.write_u8(amount);
        Ok(())
    }

    pub fn shl_ri_(&mut self, rm: u8, amount: u8) -> AsmResult<()> {
        self.shift_ri(4, rm, amount)
    }

    pub fn shr_ri_(&mut self, rm: u8, amount: u8) -> AsmResult<()> {
        self.shift_ri(5, rm, amount)
    }

    pub fn sar_ri(&mut self, rm: u8, amount: u8) -> AsmResult<()> {
        self.shift_ri(7, rm, amount)
    }

    pub fn rol_ri(&mut self, rm: u8, amount: u8) -> AsmResult<()> {
        self.shift_ri(0, rm, amount)
    }

    pub fn ror_ri(&mut self, rm: u8, amount: u8) -> AsmResult<()> {
        self.shift_ri(1, rm, amount)
    }

    /// Shift by cl.
    pub fn shl_cl(&mut self, rm: u8) -> AsmResult<()> {
        let rm = Self::gpr(rm)?;
        self.rex(true, 0, 0, rm);
        self.out.write_u8(0xd3);
        self.modrm(3, 4, rm);
        Ok(())
    }

    // ── Moves ────────────────────────────────────────────────────────

    pub fn mov_rr_(&mut self, dst: u8, src: u8) -> AsmResult<()> {
        self.alu_rr(0x89, src, dst)
    }

    /// `mov r64, imm64`: always the full 10-byte form, so the length is
    /// independent of the immediate's value across the two passes.
    pub fn mov_ri64(&mut self, dst: u8, imm: u64) -> AsmResult<()> {
        let dst = Self::gpr(dst)?;
        self.rex(true, 0, 0, dst);
        self.out.write_u8(0xb8 + (dst & 7));
        self.out.write_u64(imm);
        Ok(())
    }

    pub fn load_rm(&mut self, dst: u8, base: u8, disp: i32) -> AsmResult<()> {
        let dst = Self::gpr(dst)?;
        let base = Self::gpr(base)?;
        self.rex(true, dst, 0, base);
        self.out.write_u8(0x8b);
        self.mem(dst, base, disp);
        Ok(())
    }

    pub fn store_rm(&mut self, base: u8, disp: i32, src: u8) -> AsmResult<()> {
        let src = Self::gpr(src)?;
        let base = Self::gpr(base)?;
        self.rex(true, src, 0, base);
        self.out.write_u8(0x89);
        self.mem(src, base, disp);
        Ok(())
    }

    /// Byte load `movzx r64, byte [base+disp]`.
    pub fn load_u8(&mut self, dst: u8, base: u8, disp: i32) -> AsmResult<()> {
        let dst = Self::gpr(dst)?;
        let base = Self::gpr(base)?;
        self.rex(true, dst, 0, base);
        self.out.write_bytes(&[0x0f, 0xb6]);
        self.mem(dst, base, disp);
        Ok(())
    }

    /// Byte store `mov byte [base+disp], src`. `src` must be one of the
    /// REX-addressable byte registers, which all 16 are in 64-bit mode.
    pub fn store_u8(&mut self, base: u8, disp: i32, src: u8) -> AsmResult<()> {
        let src = Self::gpr(src)?;
        let base = Self::gpr(base)?;
        self.rex(false, src, 0, base);
        self.out.write_u8(0x88);
        self.mem(src, base, disp);
        Ok(())
    }

    pub fn lea(&mut self, dst: u8, base: u8, disp: i32) -> AsmResult<()> {
        let dst = Self::gpr(dst)?;
        let base = Self::gpr(base)?;
        self.rex(true, dst, 0, base);
        self.out.write_u8(0x8d);
        self.mem(dst, base, disp);
        Ok(())
    }

    /// `lea dst, [rip + placeholder]`; returns the patch for the disp32.
    pub fn lea_rip(&mut self, dst: u8) -> AsmResult<Patch> {
        let dst = Self::gpr(dst)?;
        self.rex(true, dst, 0, 0);
        self.out.write_u8(0x8d);
        self.modrm(0, dst, 5);
        let at = self.out.len();
        self.out.write_u32(PLACEHOLDER);
        Ok(Patch {
            at,
            kind: PatchKind::Rel32,
        })
    }

    // ── Stack ────────────────────────────────────────────────────────

    fn push_raw(&mut self, r: u8) -> AsmResult<()> {
        let r = Self::gpr(r)?;
        self.rex_opt(0, 0, r);
        self.out.write_u8(0x50 + (r & 7));
        Ok(())
    }

    fn pop_raw(&mut self, r: u8) -> AsmResult<()> {
        let r = Self::gpr(r)?;
        self.rex_opt(0, 0, r);
        self.out.write_u8(0x58 + (r & 7));
        Ok(())
    }

    pub fn push(&mut self, r: u8) -> AsmResult<()> {
        self.push_raw(r)?;
        self.stack.grow(8);
        Ok(())
    }

    pub fn pop(&mut self, r: u8) -> AsmResult<()> {
        self.pop_raw(r)?;
        self.stack.shrink(8);
        Ok(())
    }

    // ── Control flow ─────────────────────────────────────────────────

    pub fn jmp_rel32(&mut self) -> Patch {
        self.out.write_u8(0xe9);
        let at = self.out.len();
        self.out.write_u32(PLACEHOLDER);
        Patch {
            at,
            kind: PatchKind::Rel32,
        }
    }

    fn jcc(&mut self, cc: u8) -> Patch {
        self.out.write_bytes(&[0x0f, 0x80 + cc]);
        let at = self.out.len();
        self.out.write_u32(PLACEHOLDER);
        Patch {
            at,
            kind: PatchKind::Rel32,
        }
    }

    /// Conditional branch (signed-compare flavor) after a preceding
    /// `cmp`/`test`; placeholder displacement.
    pub fn jcc_signed(&mut self, cond: Cond) -> Patch {
        let cc = match cond {
            Cond::Eq => 0x4,
            Cond::Ne => 0x5,
            Cond::Lt => 0xc,
            Cond::Le => 0xe,
            Cond::Gt => 0xf,
            Cond::Ge => 0xd,
        };
        self.jcc(cc)
    }

    /// Conditional branch (unsigned-compare flavor).
    pub fn jcc_unsigned(&mut self, cond: Cond) -> Patch {
        let cc = match cond {
            Cond::Eq => 0x4,
            Cond::Ne => 0x5,
            Cond::Lt => 0x2,
            Cond::Le => 0x6,
            Cond::Gt => 0x7,
            Cond::Ge => 0x3,
        };
        self.jcc(cc)
    }

    pub fn call_rel32(&mut self) -> Patch {
        self.out.write_u8(0xe8);
        let at = self.out.len();
        self.out.write_u32(PLACEHOLDER);
        Patch {
            at,
            kind: PatchKind::Rel32,
        }
    }

    pub fn call_r(&mut self, r: u8) -> AsmResult<()> {
        let r = Self::gpr(r)?;
        self.rex_opt(0, 0, r);
        self.out.write_u8(0xff);
        self.modrm(3, 2, r);
        Ok(())
    }

    pub fn jmp_r(&mut self, r: u8) -> AsmResult<()> {
        let r = Self::gpr(r)?;
        self.rex_opt(0, 0, r);
        self.out.write_u8(0xff);
        self.modrm(3, 4, r);
        Ok(())
    }

    /// `call [rip + placeholder]` through a memory slot (import thunks).
    pub fn call_rip_mem(&mut self) -> Patch {
        self.out.write_u8(0xff);
        self.modrm(0, 2, 5);
        let at = self.out.len();
        self.out.write_u32(PLACEHOLDER);
        Patch {
            at,
            kind: PatchKind::Rel32,
        }
    }

    pub fn ret_(&mut self) {
        self.out.write_u8(0xc3);
    }

    pub fn syscall_(&mut self) {
        self.out.write_bytes(&[0x0f, 0x05]);
    }

    pub fn nop(&mut self) {
        self.out.write_u8(0x90);
    }

    // ── Scalar floating point (SSE2) ─────────────────────────────────

    fn sse_rr(&mut self, prefix: u8, opcode: u8, reg: u8, rm: u8) -> AsmResult<()> {
        let reg = Self::xmm(reg)?;
        let rm = Self::xmm(rm)?;
        self.out.write_u8(prefix);
        self.rex_opt(reg, 0, rm);
        self.out.write_bytes(&[0x0f, opcode]);
        self.modrm(3, reg, rm);
        Ok(())
    }

    pub fn movsd_rr(&mut self, dst: u8, src: u8) -> AsmResult<()> {
        self.sse_rr(0xf2, 0x10, dst, src)
    }

    pub fn addsd(&mut self, dst: u8, src: u8) -> AsmResult<()> {
        self.sse_rr(0xf2, 0x58, dst, src)
    }

    pub fn subsd(&mut self, dst: u8, src: u8) -> AsmResult<()> {
        self.sse_rr(0xf2, 0x5c, dst, src)
    }

    pub fn mulsd(&mut self, dst: u8, src: u8) -> AsmResult<()> {
        self.sse_rr(0xf2, 0x59, dst, src)
    }

    pub fn divsd(&mut self, dst: u8, src: u8) -> AsmResult<()> {
        self.sse_rr(0xf2, 0x5e, dst, src)
    }

    pub fn sqrtsd(&mut self, dst: u8, src: u8) -> AsmResult<()> {
        self.sse_rr(0xf2, 0x51, dst, src)
    }

    pub fn minsd(&mut self, dst: u8, src: u8) -> AsmResult<()> {
        self.sse_rr(0xf2, 0x5d, dst, src)
    }

    pub fn maxsd(&mut self, dst: u8, src: u8) -> AsmResult<()> {
        self.sse_rr(0xf2, 0x5f, dst, src)
    }

    pub fn ucomisd(&mut self, a: u8, b: u8) -> AsmResult<()> {
        self.sse_rr(0x66, 0x2e, a, b)
    }

    pub fn xorpd(&mut self, dst: u8, src: u8) -> AsmResult<()> {
        self.sse_rr(0x66, 0x57, dst, src)
    }

    pub fn movsd_load(&mut self, dst: u8, base: u8, disp: i32) -> AsmResult<()> {
        let dst = Self::xmm(dst)?;
        let base = Self::gpr(base)?;
        self.out.write_u8(0xf2);
        self.rex_opt(dst, 0, base);
        self.out.write_bytes(&[0x0f, 0x10]);
        self.mem(dst, base, disp);
        Ok(())
    }

    pub fn movsd_store(&mut self, base: u8, disp: i32, src: u8) -> AsmResult<()> {
        let src = Self::xmm(src)?;
        let base = Self::gpr(base)?;
        self.out.write_u8(0xf2);
        self.rex_opt(src, 0, base);
        self.out.write_bytes(&[0x0f, 0x11]);
        self.mem(src, base, disp);
        Ok(())
    }

    /// `cvtsi2sd xmm, r64`.
    pub fn cvtsi2sd(&mut self, dst: u8, src: u8) -> AsmResult<()> {
        let dst = Self::xmm(dst)?;
        let src = Self::gpr(src)?;
        self.out.write_u8(0xf2);
        self.rex(true, dst, 0, src);
        self.out.write_bytes(&[0x0f, 0x2a]);
        self.modrm(3, dst, src);
        Ok(())
    }

    /// `cvttsd2si r64, xmm` (truncating).
    pub fn cvttsd2si(&mut self, dst: u8, src: u8) -> AsmResult<()> {
        let dst = Self::gpr(dst)?;
        let src = Self::xmm(src)?;
        self.out.write_u8(0xf2);
        self.rex(true, dst, 0, src);
        self.out.write_bytes(&[0x0f, 0x2c]);
        self.modrm(3, dst, src);
        Ok(())
    }

    /// `movq xmm, r64`.
    pub fn movq_xr(&mut self, dst: u8, src: u8) -> AsmResult<()> {
        let dst = Self::xmm(dst)?;
        let src = Self::gpr(src)?;
        self.out.write_u8(0x66);
        self.rex(true, dst, 0, src);
        self.out.write_bytes(&[0x0f, 0x6e]);
        self.modrm(3, dst, src);
        Ok(())
    }

    /// `movq r64, xmm`.
    pub fn movq_rx(&mut self, dst: u8, src: u8) -> AsmResult<()> {
        let dst = Self::gpr(dst)?;
        let src = Self::xmm(src)?;
        self.out.write_u8(0x66);
        self.rex(true, src, 0, dst);
        self.out.write_bytes(&[0x0f, 0x7e]);
        self.modrm(3, src, dst);
        Ok(())
    }

    // ── Vector: VEX-encoded AVX/AVX2 ─────────────────────────────────

    fn vex(&mut self, r: u8, x: u8, b: u8, mmmmm: u8, w: u8, vvvv: u8, l: u8, pp: u8) {
        let rbit = (r >> 3) & 1;
        let xbit = (x >> 3) & 1;
        let bbit = (b >> 3) & 1;
        if xbit == 0 && bbit == 0 && mmmmm == 1 && w == 0 {
            self.out.write_u8(0xc5);
            self.out
                .write_u8(((rbit ^ 1) << 7) | ((!vvvv & 0xf) << 3) | (l << 2) | pp);
        } else {
            self.out.write_u8(0xc4);
            self.out
                .write_u8(((rbit ^ 1) << 7) | ((xbit ^ 1) << 6) | ((bbit ^ 1) << 5) | mmmmm);
            self.out
                .write_u8((w << 7) | ((!vvvv & 0xf) << 3) | (l << 2) | pp);
        }
    }

    /// Packed-double VEX op `opcode dst, lhs, rhs`; `wide` selects
    /// ymm (256) over xmm (128).
    fn vpd(&mut self, opcode: u8, dst: u8, lhs: u8, rhs: u8, wide: bool) -> AsmResult<()> {
        let dst = Self::xmm(dst)?;
        let lhs = Self::xmm(lhs)?;
        let rhs = Self::xmm(rhs)?;
        self.vex(dst, 0, rhs, 1, 0, lhs, u8::from(wide), 1);
        self.out.write_u8(opcode);
        self.modrm(3, dst, rhs);
        Ok(())
    }

    pub fn vaddpd(&mut self, dst: u8, lhs: u8, rhs: u8, wide: bool) -> AsmResult<()> {
        self.vpd(0x58, dst, lhs, rhs, wide)
    }

    pub fn vsubpd(&mut self, dst: u8, lhs: u8, rhs: u8, wide: bool) -> AsmResult<()> {
        self.vpd(0x5c, dst, lhs, rhs, wide)
    }

    pub fn vmulpd(&mut self, dst: u8, lhs: u8, rhs: u8, wide: bool) -> AsmResult<()> {
        self.vpd(0x59, dst, lhs, rhs, wide)
    }

    pub fn vdivpd(&mut self, dst: u8, lhs: u8, rhs: u8, wide: bool) -> AsmResult<()> {
        self.vpd(0x5e, dst, lhs, rhs, wide)
    }

    pub fn vminpd(&mut self, dst: u8, lhs: u8, rhs: u8, wide: bool) -> AsmResult<()> {
        self.vpd(0x5d, dst, lhs, rhs, wide)
    }

    pub fn vmaxpd(&mut self, dst: u8, lhs: u8, rhs: u8, wide: bool) -> AsmResult<()> {
        self.vpd(0x5f, dst, lhs, rhs, wide)
    }

    /// `vsqrtpd dst, src` (vvvv unused).
    pub fn vsqrtpd(&mut self, dst: u8, src: u8, wide: bool) -> AsmResult<()> {
        let dst = Self::xmm(dst)?;
        let src = Self::xmm(src)?;
        self.vex(dst, 0, src, 1, 0, 0, u8::from(wide), 1);
        self.out.write_u8(0x51);
        self.modrm(3, dst, src);
        Ok(())
    }

    /// `vcmppd dst, lhs, rhs, predicate` producing a lane mask in `dst`.
    pub fn vcmppd(&mut self, dst: u8, lhs: u8, rhs: u8, pred: u8, wide: bool) -> AsmResult<()> {
        self.vpd(0xc2, dst, lhs, rhs, wide)?;
        self.out.write_u8(pred);
        Ok(())
    }

    /// `vfmadd231pd dst, lhs, rhs`: dst += lhs * rhs.
    pub fn vfmadd231pd(&mut self, dst: u8, lhs: u8, rhs: u8, wide: bool) -> AsmResult<()> {
        let dst = Self::xmm(dst)?;
        let lhs = Self::xmm(lhs)?;
        let rhs = Self::xmm(rhs)?;
        self.vex(dst, 0, rhs, 2, 1, lhs, u8::from(wide), 1);
        self.out.write_u8(0xb8);
        self.modrm(3, dst, rhs);
        Ok(())
    }

    /// `vbroadcastsd ymm, xmm`.
    pub fn vbroadcastsd(&mut self, dst: u8, src: u8) -> AsmResult<()> {
        let dst = Self::xmm(dst)?;
        let src = Self::xmm(src)?;
        self.vex(dst, 0, src, 2, 0, 0, 1, 1);
        self.out.write_u8(0x19);
        self.modrm(3, dst, src);
        Ok(())
    }

    /// `vmovupd dst, [base+disp]`.
    pub fn vmovupd_load(&mut self, dst: u8, base: u8, disp: i32, wide: bool) -> AsmResult<()> {
        let dst = Self::xmm(dst)?;
        let base = Self::gpr(base)?;
        self.vex(dst, 0, base, 1, 0, 0, u8::from(wide), 1);
        self.out.write_u8(0x10);
        self.mem(dst, base, disp);
        Ok(())
    }

    /// `vmovupd [base+disp], src`.
    pub fn vmovupd_store(&mut self, base: u8, disp: i32, src: u8, wide: bool) -> AsmResult<()> {
        let src = Self::xmm(src)?;
        let base = Self::gpr(base)?;
        self.vex(src, 0, base, 1, 0, 0, u8::from(wide), 1);
        self.out.write_u8(0x11);
        self.mem(src, base, disp);
        Ok(())
    }

    /// `kmovw k, r32`.
    pub fn kmovw(&mut self, k: u8, src: u8) -> AsmResult<()> {
        let k = Self::kreg(k)?;
        let src = Self::gpr(src)?;
        self.vex(k, 0, src, 1, 0, 0, 0, 0);
        self.out.write_u8(0x92);
        self.modrm(3, k, src);
        Ok(())
    }

    // ── Vector: EVEX-encoded AVX-512 ─────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn evex(&mut self, reg: u8, rm: u8, rm_hi: u8, mm: u8, w: u8, vvvv: u8, ll: u8, pp: u8, aaa: u8) {
        self.out.write_u8(0x62);
        let p0 = ((!(reg >> 3) & 1) << 7)
            | ((!(rm_hi >> 4) & 1) << 6)
            | ((!(rm >> 3) & 1) << 5)
            | ((!(reg >> 4) & 1) << 4)
            | mm;
        let p1 = (w << 7) | ((!vvvv & 0xf) << 3) | 0x04 | pp;
        let p2 = (ll << 5) | ((!(vvvv >> 4) & 1) << 3) | aaa;
        self.out.write_bytes(&[p0, p1, p2]);
    }

    /// 512-bit packed-double op `opcode zmm_dst {k}, zmm_lhs, zmm_rhs`.
    fn zpd(&mut self, opcode: u8, dst: u8, lhs: u8, rhs: u8, k: u8) -> AsmResult<()> {
        let dst = Self::xmm32(dst)?;
        let lhs = Self::xmm32(lhs)?;
        let rhs = Self::xmm32(rhs)?;
        let k = Self::kreg(k)?;
        self.evex(dst, rhs, rhs, 1, 1, lhs, 2, 1, k);
        self.out.write_u8(opcode);
        self.modrm(3, dst, rhs);
        Ok(())
    }

    pub fn vaddpd_z(&mut self, dst: u8, lhs: u8, rhs: u8, k: u8) -> AsmResult<()> {
        self.zpd(0x58, dst, lhs, rhs, k)
    }

    pub fn vsubpd_z(&mut self, dst: u8, lhs: u8, rhs: u8, k: u8) -> AsmResult<()> {
        self.zpd(0x5c, dst, lhs, rhs, k)
    }

    pub fn vmulpd_z(&mut self, dst: u8, lhs: u8, rhs: u8, k: u8) -> AsmResult<()> {
        self.zpd(0x59, dst, lhs, rhs, k)
    }

    pub fn vdivpd_z(&mut self, dst: u8, lhs: u8, rhs: u8, k: u8) -> AsmResult<()> {
        self.zpd(0x5e, dst, lhs, rhs, k)
    }

    /// `vcmppd k {k}, zmm, zmm, predicate` — compare to mask.
    pub fn vcmppd_z(&mut self, kdst: u8, lhs: u8, rhs: u8, pred: u8, k: u8) -> AsmResult<()> {
        let kdst = Self::kreg(kdst)?;
        let lhs = Self::xmm32(lhs)?;
        let rhs = Self::xmm32(rhs)?;
        let k = Self::kreg(k)?;
        self.evex(kdst, rhs, rhs, 1, 1, lhs, 2, 1, k);
        self.out.write_u8(0xc2);
        self.modrm(3, kdst, rhs);
        self.out.write_u8(pred);
        Ok(())
    }

    /// `vgatherqpd zmm {k}, [base + index_zmm*8]` — VSIB gather. The
    /// mask register is required and is clobbered by the instruction.
    pub fn vgatherqpd_z(&mut self, dst: u8, base: u8, index: u8, k: u8) -> AsmResult<()> {
        let dst = Self::xmm32(dst)?;
        let base = Self::gpr(base)?;
        let index = Self::xmm32(index)?;
        let k = Self::kreg(k)?;
        if k == 0 {
            return Err(AsmError::InvalidOperand {
                what: "gather requires a non-zero mask register",
            });
        }
        // VSIB: EVEX.X carries index[3] and EVEX.V' carries index[4],
        // so both are routed through the generic field positions here.
        self.evex(dst, base, (index & 8) << 1, 2, 1, index & 0x10, 2, 1, k);
        self.out.write_u8(0x93);
        // SIB-required form, scale 8, no displacement.
        self.modrm(0, dst, 4);
        self.out
            .write_u8((3 << 6) | ((index & 7) << 3) | (base & 7));
        Ok(())
    }

    // ── Trait plumbing ───────────────────────────────────────────────

    fn spill_disp(frame: &Frame, slot: u32) -> i32 {
        -((frame.saved.len() as i32 + 1 + slot as i32) * 8)
    }
}

impl Emitter for X64<'_> {
    fn isa(&self) -> Isa {
        Isa::X86_64
    }

    fn pos(&self) -> usize {
        self.out.len()
    }

    fn stack_is_balanced(&self) -> bool {
        self.stack.is_balanced()
    }

    fn mov_ri(&mut self, rd: u8, imm: u64) -> AsmResult<()> {
        self.mov_ri64(rd, imm)
    }

    fn mov_rr(&mut self, rd: u8, rs: u8) -> AsmResult<()> {
        self.mov_rr_(rd, rs)
    }

    fn add_rr(&mut self, rd: u8, rs: u8) -> AsmResult<()> {
        self.add_rr_(rd, rs)
    }

    fn sub_rr(&mut self, rd: u8, rs: u8) -> AsmResult<()> {
        self.sub_rr_(rd, rs)
    }

    fn mul_rr(&mut self, rd: u8, rs: u8) -> AsmResult<()> {
        self.imul_rr(rd, rs)
    }

    fn and_rr(&mut self, rd: u8, rs: u8) -> AsmResult<()> {
        self.and_rr_(rd, rs)
    }

    fn or_rr(&mut self, rd: u8, rs: u8) -> AsmResult<()> {
        self.or_rr_(rd, rs)
    }

    fn xor_rr(&mut self, rd: u8, rs: u8) -> AsmResult<()> {
        self.xor_rr_(rd, rs)
    }

    fn add_ri(&mut self, rd: u8, imm: i32) -> AsmResult<()> {
        self.add_ri_(rd, imm)
    }

    fn shl_ri(&mut self, rd: u8, amount: u8) -> AsmResult<()> {
        self.shl_ri_(rd, amount)
    }

    fn shr_ri(&mut self, rd: u8, amount: u8) -> AsmResult<()> {
        self.shr_ri_(rd, amount)
    }

    fn fmov_rr(&mut self, fd: u8, fs: u8) -> AsmResult<()> {
        self.movsd_rr(fd, fs)
    }

    fn fadd(&mut self, fd: u8, fs: u8) -> AsmResult<()> {
        self.addsd(fd, fs)
    }

    fn fsub(&mut self, fd: u8, fs: u8) -> AsmResult<()> {
        self.subsd(fd, fs)
    }

    fn fmul(&mut self, fd: u8, fs: u8) -> AsmResult<()> {
        self.mulsd(fd, fs)
    }

    fn fdiv(&mut self, fd: u8, fs: u8) -> AsmResult<()> {
        self.divsd(fd, fs)
    }

    fn fsqrt(&mut self, fd: u8, fs: u8) -> AsmResult<()> {
        self.sqrtsd(fd, fs)
    }

    fn fzero(&mut self, fd: u8) -> AsmResult<()> {
        self.xorpd(fd, fd)
    }

    fn fmov_const(&mut self, fd: u8, bits: u64, scratch: u8) -> AsmResult<()> {
        self.mov_ri64(scratch, bits)?;
        self.movq_xr(fd, scratch)
    }

    fn f2i(&mut self, rd: u8, fs: u8) -> AsmResult<()> {
        self.cvttsd2si(rd, fs)
    }

    fn i2f(&mut self, fd: u8, rs: u8) -> AsmResult<()> {
        self.cvtsi2sd(fd, rs)
    }

    fn fbits_to_gpr(&mut self, rd: u8, fs: u8) -> AsmResult<()> {
        self.movq_rx(rd, fs)
    }

    fn gpr_to_fbits(&mut self, fd: u8, rs: u8) -> AsmResult<()> {
        self.movq_xr(fd, rs)
    }

    fn load_gpr(&mut self, rd: u8, base: u8, disp: i32) -> AsmResult<()> {
        self.load_rm(rd, base, disp)
    }

    fn store_gpr(&mut self, base: u8, disp: i32, rs: u8) -> AsmResult<()> {
        self.store_rm(base, disp, rs)
    }

    fn fload(&mut self, fd: u8, base: u8, disp: i32) -> AsmResult<()> {
        self.movsd_load(fd, base, disp)
    }

    fn fstore(&mut self, base: u8, disp: i32, fs: u8) -> AsmResult<()> {
        self.movsd_store(base, disp, fs)
    }

    fn push_gpr(&mut self, rs: u8) -> AsmResult<()> {
        self.push(rs)
    }

    fn pop_gpr(&mut self, rd: u8) -> AsmResult<()> {
        self.pop(rd)
    }

    fn fpush(&mut self, fs: u8) -> AsmResult<()> {
        self.sub_ri(RSP, 16)?;
        self.stack.grow(16);
        self.movsd_store(RSP, 0, fs)
    }

    fn fpop(&mut self, fd: u8) -> AsmResult<()> {
        self.movsd_load(fd, RSP, 0)?;
        self.stack.shrink(16);
        self.add_ri_(RSP, 16)
    }

    fn prologue(&mut self, frame: &Frame) -> AsmResult<()> {
        // Raw push encodings: the whole frame is accounted to the checker
        // in one enter_frame call below.
        self.push_raw(RBP)?;
        self.mov_rr_(RBP, RSP)?;
        for &r in &frame.saved {
            self.push_raw(r)?;
        }
        let pad = if frame.saved.len() % 2 == 1 { 8 } else { 0 };
        let body = frame.spill_bytes() + pad;
        if body > 0 {
            self.sub_ri(RSP, body as i32)?;
        }
        self.stack
            .enter_frame(8 + frame.saved.len() as u32 * 8 + body);
        Ok(())
    }

    fn epilogue(&mut self, frame: &Frame) -> AsmResult<()> {
        let pad = if frame.saved.len() % 2 == 1 { 8 } else { 0 };
        let body = frame.spill_bytes() + pad;
        self.stack
            .leave_frame(8 + frame.saved.len() as u32 * 8 + body);
        if body > 0 {
            self.add_ri_(RSP, body as i32)?;
        }
        for &r in frame.saved.iter().rev() {
            self.pop_raw(r)?;
        }
        self.pop_raw(RBP)?;
        Ok(())
    }

    fn spill_fstore(&mut self, frame: &Frame, slot: u32, fs: u8) -> AsmResult<()> {
        self.movsd_store(RBP, Self::spill_disp(frame, slot), fs)
    }

    fn spill_fload(&mut self, fd: u8, frame: &Frame, slot: u32) -> AsmResult<()> {
        self.movsd_load(fd, RBP, Self::spill_disp(frame, slot))
    }

    fn jmp_placeholder(&mut self) -> Patch {
        self.jmp_rel32()
    }

    fn br_fcmp(&mut self, cond: Cond, a: u8, b: u8) -> AsmResult<Patch> {
        self.ucomisd(a, b)?;
        // ucomisd sets CF/ZF like an unsigned compare.
        let cc = match cond {
            Cond::Eq => 0x4,
            Cond::Ne => 0x5,
            Cond::Lt => 0x2, // jb
            Cond::Le => 0x6, // jbe
            Cond::Gt => 0x7, // ja
            Cond::Ge => 0x3, // jae
        };
        Ok(self.jcc(cc))
    }

    fn br_icmp(&mut self, cond: Cond, a: u8, b: u8) -> AsmResult<Patch> {
        self.cmp_rr(a, b)?;
        let cc = match cond {
            Cond::Eq => 0x4,
            Cond::Ne => 0x5,
            Cond::Lt => 0xc, // jl
            Cond::Le => 0xe, // jle
            Cond::Gt => 0xf, // jg
            Cond::Ge => 0xd, // jge
        };
        Ok(self.jcc(cc))
    }

    fn call_placeholder(&mut self) -> Patch {
        self.call_rel32()
    }

    fn call_reg(&mut self, rs: u8) -> AsmResult<()> {
        self.call_r(rs)
    }

    fn ret(&mut self) {
        self.ret_();
    }

    fn syscall(&mut self) {
        self.syscall_();
    }

    fn load_sym_addr(&mut self, rd: u8) -> AsmResult<Patch> {
        self.lea_rip(rd)
    }

    fn align_entry_stack(&mut self) {
        // _start is entered with rsp 16-aligned; frames assume the
        // post-call shape (8 off). The adjustment is never undone: the
        // process leaves through the exit syscall.
        self.sub_ri(RSP, 8).expect("rsp is always encodable");
    }

    fn call_mem_placeholder(&mut self) -> AsmResult<Patch> {
        Ok(self.call_rip_mem())
    }

    fn patch_jump(&mut self, patch: &Patch, target: usize) -> AsmResult<()> {
        crate::emit::apply_patch(self.out, patch, 0, target as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit(f: impl FnOnce(&mut X64)) -> Vec<u8> {
        let mut buf = SectionBuffer::new("text");
        let mut asm = X64::new(&mut buf);
        f(&mut asm);
        buf.into_bytes()
    }

    #[test]
    fn test_alu_rr() {
        assert_eq!(emit(|a| a.add_rr_(0, 3).unwrap()), [0x48, 0x01, 0xd8]);
        assert_eq!(emit(|a| a.sub_rr_(0, 3).unwrap()), [0x48, 0x29, 0xd8]);
        assert_eq!(emit(|a| a.xor_rr_(2, 2).unwrap()), [0x48, 0x31, 0xd2]);
        // High registers set REX.R / REX.B.
        assert_eq!(emit(|a| a.add_rr_(8, 15).unwrap()), [0x4d, 0x01, 0xf8]);
    }

    #[test]
    fn test_mov_ri64_is_ten_bytes() {
        let bytes = emit(|a| a.mov_ri64(0, 0x1122334455667788).unwrap());
        assert_eq!(
            bytes,
            [0x48, 0xb8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
        let bytes = emit(|a| a.mov_ri64(12, 7).unwrap());
        assert_eq!(bytes[..2], [0x49, 0xbc]);
        assert_eq!(bytes.len(), 10);
    }

    #[test]
    fn test_imul_and_div_group() {
        assert_eq!(emit(|a| a.imul_rr(0, 3).unwrap()), [0x48, 0x0f, 0xaf, 0xc3]);
        assert_eq!(emit(|a| a.idiv(3).unwrap()), [0x48, 0xf7, 0xfb]);
        assert_eq!(emit(|a| a.neg(0).unwrap()), [0x48, 0xf7, 0xd8]);
        assert_eq!(emit(|a| a.not(0).unwrap()), [0x48, 0xf7, 0xd0]);
        assert_eq!(emit(|a| a.inc(0).unwrap()), [0x48, 0xff, 0xc0]);
        assert_eq!(emit(|a| a.dec(1).unwrap()), [0x48, 0xff, 0xc9]);
    }

    #[test]
    fn test_shifts() {
        assert_eq!(emit(|a| a.shl_ri_(0, 3).unwrap()), [0x48, 0xc1, 0xe0, 0x03]);
        assert_eq!(emit(|a| a.shr_ri_(0, 3).unwrap()), [0x48, 0xc1, 0xe8, 0x03]);
        assert_eq!(emit(|a| a.rol_ri(0, 1).unwrap()), [0x48, 0xc1, 0xc0, 0x01]);
        assert_eq!(emit(|a| a.shl_cl(3).unwrap()), [0x48, 0xd3, 0xe3]);
    }

    #[test]
    fn test_load_store_disp8_and_disp32() {
        // mov rbx, [rbp-8]
        assert_eq!(emit(|a| a.load_rm(3, 5, -8).unwrap()), [0x48, 0x8b, 0x5d, 0xf8]);
        // mov [rbp-8], rbx
        assert_eq!(
            emit(|a| a.store_rm(5, -8, 3).unwrap()),
            [0x48, 0x89, 0x5d, 0xf8]
        );
        // rsp base forces a SIB byte.
        assert_eq!(
            emit(|a| a.load_rm(0, 4, 8).unwrap()),
            [0x48, 0x8b, 0x44, 0x24, 0x08]
        );
        // Large displacement switches to disp32.
        assert_eq!(
            emit(|a| a.load_rm(0, 5, -0x1000).unwrap()),
            [0x48, 0x8b, 0x85, 0x00, 0xf0, 0xff, 0xff]
        );
    }

    #[test]
    fn test_push_pop() {
        assert_eq!(emit(|a| a.push(5).unwrap()), [0x55]);
        assert_eq!(emit(|a| a.push(12).unwrap()), [0x41, 0x54]);
        assert_eq!(emit(|a| a.pop(12).unwrap()), [0x41, 0x5c]);
    }

    #[test]
    fn test_scalar_sse() {
        assert_eq!(emit(|a| a.movsd_rr(0, 1).unwrap()), [0xf2, 0x0f, 0x10, 0xc1]);
        assert_eq!(emit(|a| a.addsd(0, 1).unwrap()), [0xf2, 0x0f, 0x58, 0xc1]);
        assert_eq!(emit(|a| a.mulsd(0, 1).unwrap()), [0xf2, 0x0f, 0x59, 0xc1]);
        assert_eq!(emit(|a| a.sqrtsd(0, 1).unwrap()), [0xf2, 0x0f, 0x51, 0xc1]);
        assert_eq!(emit(|a| a.ucomisd(0, 1).unwrap()), [0x66, 0x0f, 0x2e, 0xc1]);
        assert_eq!(emit(|a| a.xorpd(0, 0).unwrap()), [0x66, 0x0f, 0x57, 0xc0]);
        // High xmm registers need REX after the mandatory prefix.
        assert_eq!(
            emit(|a| a.addsd(8, 9).unwrap()),
            [0xf2, 0x45, 0x0f, 0x58, 0xc1]
        );
    }

    #[test]
    fn test_conversions_and_bit_moves() {
        assert_eq!(
            emit(|a| a.cvtsi2sd(0, 0).unwrap()),
            [0xf2, 0x48, 0x0f, 0x2a, 0xc0]
        );
        assert_eq!(
            emit(|a| a.cvttsd2si(0, 0).unwrap()),
            [0xf2, 0x48, 0x0f, 0x2c, 0xc0]
        );
        assert_eq!(
            emit(|a| a.movq_xr(0, 0).unwrap()),
            [0x66, 0x48, 0x0f, 0x6e, 0xc0]
        );
        assert_eq!(
            emit(|a| a.movq_rx(0, 0).unwrap()),
            [0x66, 0x48, 0x0f, 0x7e, 0xc0]
        );
    }

    #[test]
    fn test_control_flow_placeholders() {
        let bytes = emit(|a| {
            a.call_rel32();
        });
        assert_eq!(bytes, [0xe8, 0x78, 0x56, 0x34, 0x12]);
        let bytes = emit(|a| {
            a.jmp_rel32();
        });
        assert_eq!(bytes, [0xe9, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(emit(|a| a.syscall_()), [0x0f, 0x05]);
        assert_eq!(emit(|a| a.ret_()), [0xc3]);
        assert_eq!(emit(|a| a.call_r(0).unwrap()), [0xff, 0xd0]);
        assert_eq!(emit(|a| a.call_r(11).unwrap()), [0x41, 0xff, 0xd3]);
    }

    #[test]
    fn test_lea_rip_patch_position() {
        let mut buf = SectionBuffer::new("text");
        let mut asm = X64::new(&mut buf);
        asm.nop();
        let patch = asm.lea_rip(0).unwrap();
        assert_eq!(patch.at, 4); // nop + rex + 8d + modrm
        assert_eq!(&buf.bytes()[..4], &[0x90, 0x48, 0x8d, 0x05]);
        assert_eq!(buf.read_u32(4), PLACEHOLDER);
    }

    #[test]
    fn test_vex_256() {
        assert_eq!(
            emit(|a| a.vaddpd(0, 1, 2, true).unwrap()),
            [0xc5, 0xf5, 0x58, 0xc2]
        );
        assert_eq!(
            emit(|a| a.vmulpd(0, 1, 2, false).unwrap()),
            [0xc5, 0xf1, 0x59, 0xc2]
        );
        assert_eq!(
            emit(|a| a.vsqrtpd(0, 2, true).unwrap()),
            [0xc5, 0xfd, 0x51, 0xc2]
        );
        assert_eq!(
            emit(|a| a.vbroadcastsd(0, 1).unwrap()),
            [0xc4, 0xe2, 0x7d, 0x19, 0xc1]
        );
        assert_eq!(
            emit(|a| a.vfmadd231pd(0, 1, 2, true).unwrap()),
            [0xc4, 0xe2, 0xf5, 0xb8, 0xc2]
        );
        assert_eq!(
            emit(|a| a.vcmppd(0, 1, 2, 1, true).unwrap()),
            [0xc5, 0xf5, 0xc2, 0xc2, 0x01]
        );
    }

    #[test]
    fn test_evex_512() {
        assert_eq!(
            emit(|a| a.vaddpd_z(0, 1, 2, 0).unwrap()),
            [0x62, 0xf1, 0xf5, 0x48, 0x58, 0xc2]
        );
        // Masked form sets aaa.
        assert_eq!(
            emit(|a| a.vaddpd_z(0, 1, 2, 1).unwrap()),
            [0x62, 0xf1, 0xf5, 0x49, 0x58, 0xc2]
        );
    }

    #[test]
    fn test_evex_high_registers() {
        let bytes = emit(|a| a.vaddpd_z(30, 29, 28, 0).unwrap());
        assert_eq!(bytes, [0x62, 0x01, 0x95, 0x40, 0x58, 0xf4]);
    }

    #[test]
    fn test_gather_vsib() {
        let bytes = emit(|a| a.vgatherqpd_z(1, 0, 2, 1).unwrap());
        assert_eq!(bytes, [0x62, 0xf2, 0xfd, 0x49, 0x93, 0x0c, 0xd0]);
    }

    #[test]
    fn test_kmovw() {
        assert_eq!(emit(|a| a.kmovw(1, 0).unwrap()), [0xc5, 0xf8, 0x92, 0xc8]);
    }

    #[test]
    fn test_byte_loads_and_stores() {
        // movzx rax, byte [rsi]
        assert_eq!(
            emit(|a| a.load_u8(0, 6, 0).unwrap()),
            [0x48, 0x0f, 0xb6, 0x46, 0x00]
        );
        // mov byte [rdi], al; REX always present so sil/dil-class
        // sources encode as byte registers.
        assert_eq!(
            emit(|a| a.store_u8(7, 0, 0).unwrap()),
            [0x40, 0x88, 0x47, 0x00]
        );
    }

    #[test]
    fn test_gather_requires_mask() {
        let mut buf = SectionBuffer::new("text");
        let mut asm = X64::new(&mut buf);
        assert!(asm.vgatherqpd_z(1, 0, 2, 0).is_err());
    }

    #[test]
    fn test_register_range_checks() {
        let mut buf = SectionBuffer::new("text");
        let mut asm = X64::new(&mut buf);
        assert!(asm.add_rr_(16, 0).is_err());
        assert!(asm.movsd_rr(16, 0).is_err());
        assert!(asm.vaddpd_z(32, 0, 0, 0).is_err());
        // Nothing was appended by the failed operations.
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_prologue_epilogue_roundtrip() {
        let frame = Frame {
            saved: vec![3, 12],
            spill_slots: 2,
        };
        let bytes = emit(|a| {
            a.prologue(&frame).unwrap();
            a.epilogue(&frame).unwrap();
            a.ret();
        });
        // push rbp / mov rbp,rsp / push rbx / push r12 / sub rsp,16 ...
        assert_eq!(&bytes[..2], &[0x55, 0x48]);
        assert_eq!(*bytes.last().unwrap(), 0xc3);
    }

    #[test]
    fn test_spill_slots_are_below_saved_registers() {
        let frame = Frame {
            saved: vec![3],
            spill_slots: 1,
        };
        // Slot 0 sits below rbp and the one saved register.
        assert_eq!(X64::spill_disp(&frame, 0), -16);
    }
}
