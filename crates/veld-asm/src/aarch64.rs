//! AArch64 instruction emitter.
//!
//! Fixed 32-bit words, little-endian, encoded per the Arm ARM. Call sites
//! and branches are emitted with zero immediates and patched through
//! [`crate::emit::apply_patch`]; symbol addresses materialize as an
//! `adrp`+`add` pair patched the same way.

use crate::buffer::SectionBuffer;
use crate::emit::{Cond, Emitter, Frame, Patch, PatchKind};
use crate::stack_check::StackChecker;
use crate::target::{Isa, Os};
use crate::{AsmError, AsmResult};

const FP: u8 = 29;
const LR: u8 = 30;
const SP: u8 = 31;
const ZR: u8 = 31;

/// AArch64 emitter over the text stream.
pub struct A64<'a> {
    out: &'a mut SectionBuffer,
    stack: StackChecker,
    /// `svc` immediate: 0 on Linux, 0x80 on Darwin.
    svc_imm: u16,
}

impl<'a> A64<'a> {
    pub fn new(out: &'a mut SectionBuffer, os: Os) -> Self {
        Self {
            out,
            stack: StackChecker::new(),
            svc_imm: if os == Os::Darwin { 0x80 } else { 0 },
        }
    }

    pub fn stack(&self) -> &StackChecker {
        &self.stack
    }

    fn word(&mut self, w: u32) {
        self.out.write_u32(w);
    }

    fn gpr(r: u8) -> AsmResult<u8> {
        if r <= 30 {
            Ok(r)
        } else {
            Err(AsmError::RegisterRange {
                num: r,
                what: "gpr",
                isa: Isa::Aarch64,
            })
        }
    }

    fn freg(r: u8) -> AsmResult<u8> {
        if r < 32 {
            Ok(r)
        } else {
            Err(AsmError::RegisterRange {
                num: r,
                what: "fp/simd register",
                isa: Isa::Aarch64,
            })
        }
    }

    fn imm12(v: i32) -> AsmResult<u32> {
        if (0..=4095).contains(&v) {
            Ok(v as u32)
        } else {
            Err(AsmError::ImmediateRange {
                value: v as i64,
                field: "imm12",
            })
        }
    }

    // ── Integer arithmetic ───────────────────────────────────────────

    fn rrr(&mut self, base: u32, rd: u8, rn: u8, rm: u8) -> AsmResult<()> {
        let rd = Self::gpr(rd)?;
        let rn = Self::gpr(rn)?;
        let rm = Self::gpr(rm)?;
        self.word(base | u32::from(rm) << 16 | u32::from(rn) << 5 | u32::from(rd));
        Ok(())
    }

    pub fn add(&mut self, rd: u8, rn: u8, rm: u8) -> AsmResult<()> {
        self.rrr(0x8b00_0000, rd, rn, rm)
    }

    pub fn sub(&mut self, rd: u8, rn: u8, rm: u8) -> AsmResult<()> {
        self.rrr(0xcb00_0000, rd, rn, rm)
    }

    pub fn and(&mut self, rd: u8, rn: u8, rm: u8) -> AsmResult<()> {
        self.rrr(0x8a00_0000, rd, rn, rm)
    }

    pub fn orr(&mut self, rd: u8, rn: u8, rm: u8) -> AsmResult<()> {
        self.rrr(0xaa00_0000, rd, rn, rm)
    }

    pub fn eor(&mut self, rd: u8, rn: u8, rm: u8) -> AsmResult<()> {
        self.rrr(0xca00_0000, rd, rn, rm)
    }

    /// `cmp rn, rm` (subs xzr).
    pub fn cmp(&mut self, rn: u8, rm: u8) -> AsmResult<()> {
        let rn = Self::gpr(rn)?;
        let rm = Self::gpr(rm)?;
        self.word(0xeb00_0000 | u32::from(rm) << 16 | u32::from(rn) << 5 | u32::from(ZR));
        Ok(())
    }

    /// `mvn rd, rm` (orn against xzr).
    pub fn mvn(&mut self, rd: u8, rm: u8) -> AsmResult<()> {
        let rd = Self::gpr(rd)?;
        let rm = Self::gpr(rm)?;
        self.word(0xaa20_0000 | u32::from(rm) << 16 | u32::from(ZR) << 5 | u32::from(rd));
        Ok(())
    }

    /// `neg rd, rm` (sub from xzr).
    pub fn neg(&mut self, rd: u8, rm: u8) -> AsmResult<()> {
        let rd = Self::gpr(rd)?;
        let rm = Self::gpr(rm)?;
        self.word(0xcb00_0000 | u32::from(rm) << 16 | u32::from(ZR) << 5 | u32::from(rd));
        Ok(())
    }

    /// `mul rd, rn, rm` (madd with xzr accumulator).
    pub fn mul(&mut self, rd: u8, rn: u8, rm: u8) -> AsmResult<()> {
        let rd = Self::gpr(rd)?;
        let rn = Self::gpr(rn)?;
        let rm = Self::gpr(rm)?;
        self.word(
            0x9b00_0000
                | u32::from(rm) << 16
                | u32::from(ZR) << 10
                | u32::from(rn) << 5
                | u32::from(rd),
        );
        Ok(())
    }

    /// `msub rd, rn, rm, ra`: rd = ra - rn*rm.
    pub fn msub(&mut self, rd: u8, rn: u8, rm: u8, ra: u8) -> AsmResult<()> {
        let rd = Self::gpr(rd)?;
        let rn = Self::gpr(rn)?;
        let rm = Self::gpr(rm)?;
        let ra = Self::gpr(ra)?;
        self.word(
            0x9b00_8000
                | u32::from(rm) << 16
                | u32::from(ra) << 10
                | u32::from(rn) << 5
                | u32::from(rd),
        );
        Ok(())
    }

    pub fn sdiv(&mut self, rd: u8, rn: u8, rm: u8) -> AsmResult<()> {
        self.rrr(0x9ac0_0c00, rd, rn, rm)
    }

    pub fn udiv(&mut self, rd: u8, rn: u8, rm: u8) -> AsmResult<()> {
        self.rrr(0x9ac0_0800, rd, rn, rm)
    }

    pub fn lslv(&mut self, rd: u8, rn: u8, rm: u8) -> AsmResult<()> {
        self.rrr(0x9ac0_2000, rd, rn, rm)
    }

    pub fn lsrv(&mut self, rd: u8, rn: u8, rm: u8) -> AsmResult<()> {
        self.rrr(0x9ac0_2400, rd, rn, rm)
    }

    pub fn asrv(&mut self, rd: u8, rn: u8, rm: u8) -> AsmResult<()> {
        self.rrr(0x9ac0_2800, rd, rn, rm)
    }

    pub fn rorv(&mut self, rd: u8, rn: u8, rm: u8) -> AsmResult<()> {
        self.rrr(0x9ac0_2c00, rd, rn, rm)
    }

    /// `lsl rd, rn, #shift` via UBFM.
    pub fn lsl_imm(&mut self, rd: u8, rn: u8, shift: u8) -> AsmResult<()> {
        let rd = Self::gpr(rd)?;
        let rn = Self::gpr(rn)?;
        let shift = u32::from(shift & 63);
        let immr = (64 - shift) & 63;
        let imms = 63 - shift;
        self.word(0xd340_0000 | immr << 16 | imms << 10 | u32::from(rn) << 5 | u32::from(rd));
        Ok(())
    }

    /// `lsr rd, rn, #shift` via UBFM.
    pub fn lsr_imm(&mut self, rd: u8, rn: u8, shift: u8) -> AsmResult<()> {
        let rd = Self::gpr(rd)?;
        let rn = Self::gpr(rn)?;
        let shift = u32::from(shift & 63);
        self.word(0xd340_0000 | shift << 16 | 63 << 10 | u32::from(rn) << 5 | u32::from(rd));
        Ok(())
    }

    /// `add rd, rn, #imm12`; accepts sp as rn/rd.
    pub fn add_imm(&mut self, rd: u8, rn: u8, imm: i32) -> AsmResult<()> {
        if imm < 0 {
            return self.sub_imm(rd, rn, -imm);
        }
        let imm = Self::imm12(imm)?;
        self.word(0x9100_0000 | imm << 10 | u32::from(rn) << 5 | u32::from(rd));
        Ok(())
    }

    /// `sub rd, rn, #imm12`; accepts sp as rn/rd.
    pub fn sub_imm(&mut self, rd: u8, rn: u8, imm: i32) -> AsmResult<()> {
        if imm < 0 {
            return self.add_imm(rd, rn, -imm);
        }
        let imm = Self::imm12(imm)?;
        self.word(0xd100_0000 | imm << 10 | u32::from(rn) << 5 | u32::from(rd));
        Ok(())
    }

    // ── Moves ────────────────────────────────────────────────────────

    pub fn movz(&mut self, rd: u8, imm16: u16, hw: u8) -> AsmResult<()> {
        let rd = Self::gpr(rd)?;
        self.word(0xd280_0000 | u32::from(hw & 3) << 21 | u32::from(imm16) << 5 | u32::from(rd));
        Ok(())
    }

    pub fn movk(&mut self, rd: u8, imm16: u16, hw: u8) -> AsmResult<()> {
        let rd = Self::gpr(rd)?;
        self.word(0xf280_0000 | u32::from(hw & 3) << 21 | u32::from(imm16) << 5 | u32::from(rd));
        Ok(())
    }

    /// Full 64-bit immediate: movz + three movk, always four words so the
    /// length is value-independent across the two passes.
    pub fn mov_imm64(&mut self, rd: u8, imm: u64) -> AsmResult<()> {
        self.movz(rd, imm as u16, 0)?;
        self.movk(rd, (imm >> 16) as u16, 1)?;
        self.movk(rd, (imm >> 32) as u16, 2)?;
        self.movk(rd, (imm >> 48) as u16, 3)?;
        Ok(())
    }

    /// Register move via orr; not valid for sp (use `add_imm` there).
    pub fn mov(&mut self, rd: u8, rm: u8) -> AsmResult<()> {
        let rd = Self::gpr(rd)?;
        let rm = Self::gpr(rm)?;
        self.word(0xaa00_0000 | u32::from(rm) << 16 | u32::from(ZR) << 5 | u32::from(rd));
        Ok(())
    }

    // ── Loads and stores ─────────────────────────────────────────────

    fn mem_scaled(
        &mut self,
        base_op: u32,
        unscaled_op: u32,
        rt: u8,
        rn: u8,
        disp: i32,
    ) -> AsmResult<()> {
        if disp >= 0 && disp % 8 == 0 && disp / 8 <= 4095 {
            self.word(base_op | ((disp as u32 / 8) << 10) | u32::from(rn) << 5 | u32::from(rt));
        } else if (-256..256).contains(&disp) {
            // Unscaled 9-bit signed form for small negative offsets.
            let imm9 = (disp as u32) & 0x1ff;
            self.word(unscaled_op | imm9 << 12 | u32::from(rn) << 5 | u32::from(rt));
        } else {
            return Err(AsmError::DisplacementRange {
                value: disp as i64,
                field: "ldr/str imm",
            });
        }
        Ok(())
    }

    pub fn ldr(&mut self, rt: u8, rn: u8, disp: i32) -> AsmResult<()> {
        let rt = Self::gpr(rt)?;
        self.mem_scaled(0xf940_0000, 0xf840_0000, rt, rn, disp)
    }

    pub fn str(&mut self, rt: u8, rn: u8, disp: i32) -> AsmResult<()> {
        let rt = Self::gpr(rt)?;
        self.mem_scaled(0xf900_0000, 0xf800_0000, rt, rn, disp)
    }

    pub fn ldrb(&mut self, rt: u8, rn: u8, disp: i32) -> AsmResult<()> {
        let rt = Self::gpr(rt)?;
        let imm = Self::imm12(disp)?;
        self.word(0x3940_0000 | imm << 10 | u32::from(rn) << 5 | u32::from(rt));
        Ok(())
    }

    pub fn strb(&mut self, rt: u8, rn: u8, disp: i32) -> AsmResult<()> {
        let rt = Self::gpr(rt)?;
        let imm = Self::imm12(disp)?;
        self.word(0x3900_0000 | imm << 10 | u32::from(rn) << 5 | u32::from(rt));
        Ok(())
    }

    pub fn fldr(&mut self, dt: u8, rn: u8, disp: i32) -> AsmResult<()> {
        let dt = Self::freg(dt)?;
        self.mem_scaled(0xfd40_0000, 0xfc40_0000, dt, rn, disp)
    }

    pub fn fstr(&mut self, dt: u8, rn: u8, disp: i32) -> AsmResult<()> {
        let dt = Self::freg(dt)?;
        self.mem_scaled(0xfd00_0000, 0xfc00_0000, dt, rn, disp)
    }

    /// `stp rt1, rt2, [sp, #-16]!`.
    pub fn stp_pre(&mut self, rt1: u8, rt2: u8, rn: u8, bytes: i32) -> AsmResult<()> {
        let imm7 = ((bytes / 8) as u32) & 0x7f;
        self.word(
            0xa980_0000
                | imm7 << 15
                | u32::from(rt2) << 10
                | u32::from(rn) << 5
                | u32::from(rt1),
        );
        Ok(())
    }

    /// `ldp rt1, rt2, [sp], #16`.
    pub fn ldp_post(&mut self, rt1: u8, rt2: u8, rn: u8, bytes: i32) -> AsmResult<()> {
        let imm7 = ((bytes / 8) as u32) & 0x7f;
        self.word(
            0xa8c0_0000
                | imm7 << 15
                | u32::from(rt2) << 10
                | u32::from(rn) << 5
                | u32::from(rt1),
        );
        Ok(())
    }

    // ── Control flow ─────────────────────────────────────────────────

    pub fn b(&mut self) -> Patch {
        let at = self.out.len();
        self.word(0x1400_0000);
        Patch {
            at,
            kind: PatchKind::B26,
        }
    }

    pub fn bl(&mut self) -> Patch {
        let at = self.out.len();
        self.word(0x9400_0000);
        Patch {
            at,
            kind: PatchKind::B26,
        }
    }

    pub fn b_cond(&mut self, cond: u8) -> Patch {
        let at = self.out.len();
        self.word(0x5400_0000 | u32::from(cond & 0xf));
        Patch {
            at,
            kind: PatchKind::B19,
        }
    }

    pub fn cbz(&mut self, rt: u8) -> AsmResult<Patch> {
        let rt = Self::gpr(rt)?;
        let at = self.out.len();
        self.word(0xb400_0000 | u32::from(rt));
        Ok(Patch {
            at,
            kind: PatchKind::B19,
        })
    }

    pub fn cbnz(&mut self, rt: u8) -> AsmResult<Patch> {
        let rt = Self::gpr(rt)?;
        let at = self.out.len();
        self.word(0xb500_0000 | u32::from(rt));
        Ok(Patch {
            at,
            kind: PatchKind::B19,
        })
    }

    pub fn blr(&mut self, rn: u8) -> AsmResult<()> {
        let rn = Self::gpr(rn)?;
        self.word(0xd63f_0000 | u32::from(rn) << 5);
        Ok(())
    }

    pub fn br(&mut self, rn: u8) -> AsmResult<()> {
        let rn = Self::gpr(rn)?;
        self.word(0xd61f_0000 | u32::from(rn) << 5);
        Ok(())
    }

    pub fn ret_(&mut self) {
        self.word(0xd65f_03c0);
    }

    pub fn svc(&mut self) {
        self.word(0xd400_0001 | u32::from(self.svc_imm) << 5);
    }

    pub fn nop(&mut self) {
        self.word(0xd503_201f);
    }

    /// `adrp rd, 0` + `add rd, rd, #0`, patched as a pair.
    pub fn adrp_add(&mut self, rd: u8) -> AsmResult<Patch> {
        let rd = Self::gpr(rd)?;
        let at = self.out.len();
        self.word(0x9000_0000 | u32::from(rd));
        self.word(0x9100_0000 | u32::from(rd) << 5 | u32::from(rd));
        Ok(Patch {
            at,
            kind: PatchKind::AdrpAdd,
        })
    }

    // ── Scalar floating point ────────────────────────────────────────

    fn frrr(&mut self, base: u32, rd: u8, rn: u8, rm: u8) -> AsmResult<()> {
        let rd = Self::freg(rd)?;
        let rn = Self::freg(rn)?;
        let rm = Self::freg(rm)?;
        self.word(base | u32::from(rm) << 16 | u32::from(rn) << 5 | u32::from(rd));
        Ok(())
    }

    pub fn fadd_d(&mut self, rd: u8, rn: u8, rm: u8) -> AsmResult<()> {
        self.frrr(0x1e60_2800, rd, rn, rm)
    }

    pub fn fsub_d(&mut self, rd: u8, rn: u8, rm: u8) -> AsmResult<()> {
        self.frrr(0x1e60_3800, rd, rn, rm)
    }

    pub fn fmul_d(&mut self, rd: u8, rn: u8, rm: u8) -> AsmResult<()> {
        self.frrr(0x1e60_0800, rd, rn, rm)
    }

    pub fn fdiv_d(&mut self, rd: u8, rn: u8, rm: u8) -> AsmResult<()> {
        self.frrr(0x1e60_1800, rd, rn, rm)
    }

    pub fn fmin_d(&mut self, rd: u8, rn: u8, rm: u8) -> AsmResult<()> {
        self.frrr(0x1e60_5800, rd, rn, rm)
    }

    pub fn fmax_d(&mut self, rd: u8, rn: u8, rm: u8) -> AsmResult<()> {
        self.frrr(0x1e60_4800, rd, rn, rm)
    }

    pub fn fsqrt_d(&mut self, rd: u8, rn: u8) -> AsmResult<()> {
        let rd = Self::freg(rd)?;
        let rn = Self::freg(rn)?;
        self.word(0x1e61_c000 | u32::from(rn) << 5 | u32::from(rd));
        Ok(())
    }

    pub fn fneg_d(&mut self, rd: u8, rn: u8) -> AsmResult<()> {
        let rd = Self::freg(rd)?;
        let rn = Self::freg(rn)?;
        self.word(0x1e61_4000 | u32::from(rn) << 5 | u32::from(rd));
        Ok(())
    }

    pub fn fmov_d(&mut self, rd: u8, rn: u8) -> AsmResult<()> {
        let rd = Self::freg(rd)?;
        let rn = Self::freg(rn)?;
        self.word(0x1e60_4000 | u32::from(rn) << 5 | u32::from(rd));
        Ok(())
    }

    pub fn fcmp_d(&mut self, rn: u8, rm: u8) -> AsmResult<()> {
        let rn = Self::freg(rn)?;
        let rm = Self::freg(rm)?;
        self.word(0x1e60_2000 | u32::from(rm) << 16 | u32::from(rn) << 5);
        Ok(())
    }

    /// `fmadd rd, rn, rm, ra`: rd = ra + rn*rm.
    pub fn fmadd_d(&mut self, rd: u8, rn: u8, rm: u8, ra: u8) -> AsmResult<()> {
        let rd = Self::freg(rd)?;
        let rn = Self::freg(rn)?;
        let rm = Self::freg(rm)?;
        let ra = Self::freg(ra)?;
        self.word(
            0x1f40_0000
                | u32::from(rm) << 16
                | u32::from(ra) << 10
                | u32::from(rn) << 5
                | u32::from(rd),
        );
        Ok(())
    }

    /// `fmov dd, xn`.
    pub fn fmov_dx(&mut self, dd: u8, xn: u8) -> AsmResult<()> {
        let dd = Self::freg(dd)?;
        let xn = Self::gpr(xn)?;
        self.word(0x9e67_0000 | u32::from(xn) << 5 | u32::from(dd));
        Ok(())
    }

    /// `fmov xd, dn`.
    pub fn fmov_xd(&mut self, xd: u8, dn: u8) -> AsmResult<()> {
        let xd = Self::gpr(xd)?;
        let dn = Self::freg(dn)?;
        self.word(0x9e66_0000 | u32::from(dn) << 5 | u32::from(xd));
        Ok(())
    }

    /// `scvtf dd, xn`.
    pub fn scvtf(&mut self, dd: u8, xn: u8) -> AsmResult<()> {
        let dd = Self::freg(dd)?;
        let xn = Self::gpr(xn)?;
        self.word(0x9e62_0000 | u32::from(xn) << 5 | u32::from(dd));
        Ok(())
    }

    /// `fcvtzs xd, dn` (truncating).
    pub fn fcvtzs(&mut self, xd: u8, dn: u8) -> AsmResult<()> {
        let xd = Self::gpr(xd)?;
        let dn = Self::freg(dn)?;
        self.word(0x9e78_0000 | u32::from(dn) << 5 | u32::from(xd));
        Ok(())
    }

    // ── Vector (NEON, 2×f64) ─────────────────────────────────────────

    pub fn fadd_v2d(&mut self, rd: u8, rn: u8, rm: u8) -> AsmResult<()> {
        self.frrr(0x4e60_d400, rd, rn, rm)
    }

    pub fn fsub_v2d(&mut self, rd: u8, rn: u8, rm: u8) -> AsmResult<()> {
        self.frrr(0x4ee0_d400, rd, rn, rm)
    }

    pub fn fmul_v2d(&mut self, rd: u8, rn: u8, rm: u8) -> AsmResult<()> {
        self.frrr(0x6e60_dc00, rd, rn, rm)
    }

    pub fn fdiv_v2d(&mut self, rd: u8, rn: u8, rm: u8) -> AsmResult<()> {
        self.frrr(0x6e60_fc00, rd, rn, rm)
    }

    pub fn fmin_v2d(&mut self, rd: u8, rn: u8, rm: u8) -> AsmResult<()> {
        self.frrr(0x4ee0_f400, rd, rn, rm)
    }

    pub fn fmax_v2d(&mut self, rd: u8, rn: u8, rm: u8) -> AsmResult<()> {
        self.frrr(0x4e60_f400, rd, rn, rm)
    }

    /// Fused multiply-add per lane: rd += rn * rm.
    pub fn fmla_v2d(&mut self, rd: u8, rn: u8, rm: u8) -> AsmResult<()> {
        self.frrr(0x4e60_cc00, rd, rn, rm)
    }

    /// Lane-wise compare equal, producing an all-ones/all-zeros mask.
    pub fn fcmeq_v2d(&mut self, rd: u8, rn: u8, rm: u8) -> AsmResult<()> {
        self.frrr(0x4e60_e400, rd, rn, rm)
    }

    pub fn fsqrt_v2d(&mut self, rd: u8, rn: u8) -> AsmResult<()> {
        let rd = Self::freg(rd)?;
        let rn = Self::freg(rn)?;
        self.word(0x6ee1_f800 | u32::from(rn) << 5 | u32::from(rd));
        Ok(())
    }

    /// Broadcast a GPR into both lanes.
    pub fn dup_v2d(&mut self, rd: u8, xn: u8) -> AsmResult<()> {
        let rd = Self::freg(rd)?;
        let xn = Self::gpr(xn)?;
        self.word(0x4e08_0c00 | u32::from(xn) << 5 | u32::from(rd));
        Ok(())
    }

    fn cond_bits(cond: Cond, float: bool) -> u8 {
        // After fcmp, lt/le use the unordered-safe mi/ls forms.
        match (cond, float) {
            (Cond::Eq, _) => 0x0,
            (Cond::Ne, _) => 0x1,
            (Cond::Lt, true) => 0x4,  // mi
            (Cond::Le, true) => 0x9,  // ls
            (Cond::Lt, false) => 0xb, // lt
            (Cond::Le, false) => 0xd, // le
            (Cond::Gt, _) => 0xc,
            (Cond::Ge, _) => 0xa,
        }
    }

    fn saved_area(frame: &Frame) -> u32 {
        (frame.saved.len() as u32 * 8 + 15) & !15
    }

    /// Spill slot offset relative to the frame pointer. Slot `i` sits
    /// at `sp + 8*i` right after the prologue, i.e. `x29 - body + 8*i`.
    fn spill_off(frame: &Frame, slot: u32) -> i32 {
        let body = Self::saved_area(frame) + frame.spill_bytes();
        (slot as i32) * 8 - body as i32
    }
}

impl Emitter for A64<'_> {
    fn isa(&self) -> Isa {
        Isa::Aarch64
    }

    fn pos(&self) -> usize {
        self.out.len()
    }

    fn stack_is_balanced(&self) -> bool {
        self.stack.is_balanced()
    }

    fn mov_ri(&mut self, rd: u8, imm: u64) -> AsmResult<()> {
        self.mov_imm64(rd, imm)
    }

    fn mov_rr(&mut self, rd: u8, rs: u8) -> AsmResult<()> {
        self.mov(rd, rs)
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
        self.orr(rd, rd, rs)
    }

    fn xor_rr(&mut self, rd: u8, rs: u8) -> AsmResult<()> {
        self.eor(rd, rd, rs)
    }

    fn add_ri(&mut self, rd: u8, imm: i32) -> AsmResult<()> {
        Self::gpr(rd)?;
        self.add_imm(rd, rd, imm)
    }

    fn shl_ri(&mut self, rd: u8, amount: u8) -> AsmResult<()> {
        self.lsl_imm(rd, rd, amount)
    }

    fn shr_ri(&mut self, rd: u8, amount: u8) -> AsmResult<()> {
        self.lsr_imm(rd, rd, amount)
    }

    fn fmov_rr(&mut self, fd: u8, fs: u8) -> AsmResult<()> {
        self.fmov_d(fd, fs)
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
        let fd = Self::freg(fd)?;
        // fmov dN, xzr
        self.word(0x9e67_0000 | u32::from(ZR) << 5 | u32::from(fd));
        Ok(())
    }

    fn fmov_const(&mut self, fd: u8, bits: u64, scratch: u8) -> AsmResult<()> {
        self.mov_imm64(scratch, bits)?;
        self.fmov_dx(fd, scratch)
    }

    fn f2i(&mut self, rd: u8, fs: u8) -> AsmResult<()> {
        self.fcvtzs(rd, fs)
    }

    fn i2f(&mut self, fd: u8, rs: u8) -> AsmResult<()> {
        self.scvtf(fd, rs)
    }

    fn fbits_to_gpr(&mut self, rd: u8, fs: u8) -> AsmResult<()> {
        self.fmov_xd(rd, fs)
    }

    fn gpr_to_fbits(&mut self, fd: u8, rs: u8) -> AsmResult<()> {
        self.fmov_dx(fd, rs)
    }

    fn load_gpr(&mut self, rd: u8, base: u8, disp: i32) -> AsmResult<()> {
        self.ldr(rd, base, disp)
    }

    fn store_gpr(&mut self, base: u8, disp: i32, rs: u8) -> AsmResult<()> {
        self.str(rs, base, disp)
    }

    fn fload(&mut self, fd: u8, base: u8, disp: i32) -> AsmResult<()> {
        self.fldr(fd, base, disp)
    }

    fn fstore(&mut self, base: u8, disp: i32, fs: u8) -> AsmResult<()> {
        self.fstr(fs, base, disp)
    }

    fn push_gpr(&mut self, rs: u8) -> AsmResult<()> {
        let rs = Self::gpr(rs)?;
        // str rs, [sp, #-16]!
        self.word(0xf800_0c00 | 0x1f0 << 12 | u32::from(SP) << 5 | u32::from(rs));
        self.stack.grow(16);
        Ok(())
    }

    fn pop_gpr(&mut self, rd: u8) -> AsmResult<()> {
        let rd = Self::gpr(rd)?;
        // ldr rd, [sp], #16
        self.word(0xf840_0400 | 0x010 << 12 | u32::from(SP) << 5 | u32::from(rd));
        self.stack.shrink(16);
        Ok(())
    }

    fn fpush(&mut self, fs: u8) -> AsmResult<()> {
        let fs = Self::freg(fs)?;
        // str ds, [sp, #-16]!
        self.word(0xfc00_0c00 | 0x1f0 << 12 | u32::from(SP) << 5 | u32::from(fs));
        self.stack.grow(16);
        Ok(())
    }

    fn fpop(&mut self, fd: u8) -> AsmResult<()> {
        let fd = Self::freg(fd)?;
        // ldr dd, [sp], #16
        self.word(0xfc40_0400 | 0x010 << 12 | u32::from(SP) << 5 | u32::from(fd));
        self.stack.shrink(16);
        Ok(())
    }

    fn prologue(&mut self, frame: &Frame) -> AsmResult<()> {
        self.stp_pre(FP, LR, SP, -16)?;
        // mov x29, sp
        self.add_imm(FP, SP, 0)?;
        let body = Self::saved_area(frame) + frame.spill_bytes();
        if body > 0 {
            self.sub_imm(SP, SP, body as i32)?;
        }
        // Saved registers live above the spill area.
        for (i, &r) in frame.saved.iter().enumerate() {
            self.str(r, SP, (frame.spill_bytes() + i as u32 * 8) as i32)?;
        }
        self.stack.enter_frame(16 + body);
        Ok(())
    }

    fn epilogue(&mut self, frame: &Frame) -> AsmResult<()> {
        let body = Self::saved_area(frame) + frame.spill_bytes();
        self.stack.leave_frame(16 + body);
        for (i, &r) in frame.saved.iter().enumerate() {
            self.ldr(r, SP, (frame.spill_bytes() + i as u32 * 8) as i32)?;
        }
        if body > 0 {
            self.add_imm(SP, SP, body as i32)?;
        }
        self.ldp_post(FP, LR, SP, 16)?;
        Ok(())
    }

    fn spill_fstore(&mut self, frame: &Frame, slot: u32, fs: u8) -> AsmResult<()> {
        // Frame-pointer relative: sp moves under pushed temporaries.
        let off = Self::spill_off(frame, slot);
        if off >= -256 {
            self.fstr(fs, FP, off)
        } else {
            self.sub_imm(16, FP, -off)?;
            self.fstr(fs, 16, 0)
        }
    }

    fn spill_fload(&mut self, fd: u8, frame: &Frame, slot: u32) -> AsmResult<()> {
        let off = Self::spill_off(frame, slot);
        if off >= -256 {
            self.fldr(fd, FP, off)
        } else {
            self.sub_imm(16, FP, -off)?;
            self.fldr(fd, 16, 0)
        }
    }

    fn jmp_placeholder(&mut self) -> Patch {
        self.b()
    }

    fn br_fcmp(&mut self, cond: Cond, a: u8, b: u8) -> AsmResult<Patch> {
        self.fcmp_d(a, b)?;
        Ok(self.b_cond(Self::cond_bits(cond, true)))
    }

    fn br_icmp(&mut self, cond: Cond, a: u8, b: u8) -> AsmResult<Patch> {
        self.cmp(a, b)?;
        Ok(self.b_cond(Self::cond_bits(cond, false)))
    }

    fn call_placeholder(&mut self) -> Patch {
        self.bl()
    }

    fn call_reg(&mut self, rs: u8) -> AsmResult<()> {
        self.blr(rs)
    }

    fn ret(&mut self) {
        self.ret_();
    }

    fn syscall(&mut self) {
        self.svc();
    }

    fn load_sym_addr(&mut self, rd: u8) -> AsmResult<Patch> {
        self.adrp_add(rd)
    }

    fn patch_jump(&mut self, patch: &Patch, target: usize) -> AsmResult<()> {
        crate::emit::apply_patch(self.out, patch, 0, target as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit(f: impl FnOnce(&mut A64)) -> Vec<u32> {
        let mut buf = SectionBuffer::new("text");
        let mut asm = A64::new(&mut buf, Os::Linux);
        f(&mut asm);
        buf.bytes()
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn test_integer_arithmetic() {
        assert_eq!(emit(|a| a.add(0, 1, 2).unwrap()), [0x8b020020]);
        assert_eq!(emit(|a| a.sub(0, 1, 2).unwrap()), [0xcb020020]);
        assert_eq!(emit(|a| a.mul(0, 1, 2).unwrap()), [0x9b027c20]);
        assert_eq!(emit(|a| a.sdiv(0, 1, 2).unwrap()), [0x9ac20c20]);
        assert_eq!(emit(|a| a.and(0, 1, 2).unwrap()), [0x8a020020]);
        assert_eq!(emit(|a| a.orr(0, 1, 2).unwrap()), [0xaa020020]);
        assert_eq!(emit(|a| a.eor(0, 1, 2).unwrap()), [0xca020020]);
        assert_eq!(emit(|a| a.neg(0, 1).unwrap()), [0xcb0103e0]);
        assert_eq!(emit(|a| a.mvn(0, 1).unwrap()), [0xaa2103e0]);
        // High register numbers.
        assert_eq!(emit(|a| a.add(28, 29, 30).unwrap()), [0x8b1e03bc]);
    }

    #[test]
    fn test_shifts() {
        assert_eq!(emit(|a| a.lsl_imm(0, 1, 3).unwrap()), [0xd37df020]);
        assert_eq!(emit(|a| a.lsr_imm(0, 1, 3).unwrap()), [0xd343fc20]);
        assert_eq!(emit(|a| a.lslv(0, 1, 2).unwrap()), [0x9ac22020]);
    }

    #[test]
    fn test_mov_imm64_is_four_words() {
        let words = emit(|a| a.mov_imm64(0, 0x1122_3344_5566_7788).unwrap());
        assert_eq!(
            words,
            [
                0xd2800000 | 0x7788 << 5,
                0xf2800000 | 1 << 21 | 0x5566 << 5,
                0xf2800000 | 2 << 21 | 0x3344 << 5,
                0xf2800000 | 3 << 21 | 0x1122 << 5,
            ]
        );
    }

    #[test]
    fn test_mov_register() {
        assert_eq!(emit(|a| a.mov(0, 1).unwrap()), [0xaa0103e0]);
    }

    #[test]
    fn test_loads_and_stores() {
        assert_eq!(emit(|a| a.ldr(0, 1, 16).unwrap()), [0xf9400820]);
        assert_eq!(emit(|a| a.str(0, 1, 16).unwrap()), [0xf9000820]);
        // Negative displacement falls back to the unscaled form.
        assert_eq!(emit(|a| a.ldr(0, 1, -8).unwrap()), [0xf85f8020]);
        // Byte forms.
        assert_eq!(emit(|a| a.ldrb(0, 1, 4).unwrap()), [0x39401020]);
        assert_eq!(emit(|a| a.strb(0, 1, 4).unwrap()), [0x39001020]);
    }

    #[test]
    fn test_frame_pairs() {
        assert_eq!(emit(|a| a.stp_pre(29, 30, 31, -16).unwrap()), [0xa9bf7bfd]);
        assert_eq!(emit(|a| a.ldp_post(29, 30, 31, 16).unwrap()), [0xa8c17bfd]);
    }

    #[test]
    fn test_control_flow() {
        assert_eq!(emit(|a| a.ret_()), [0xd65f03c0]);
        assert_eq!(emit(|a| a.blr(17).unwrap()), [0xd63f0220]);
        assert_eq!(emit(|a| a.br(17).unwrap()), [0xd61f0220]);
        assert_eq!(
            emit(|a| {
                a.bl();
            }),
            [0x94000000]
        );
        assert_eq!(
            emit(|a| {
                a.b();
            }),
            [0x14000000]
        );
    }

    #[test]
    fn test_svc_linux_vs_darwin() {
        assert_eq!(emit(|a| a.svc()), [0xd4000001]);
        let mut buf = SectionBuffer::new("text");
        let mut asm = A64::new(&mut buf, Os::Darwin);
        asm.svc();
        assert_eq!(buf.read_u32(0), 0xd4001001);
    }

    #[test]
    fn test_adrp_add_pair() {
        let words = emit(|a| {
            a.adrp_add(0).unwrap();
        });
        assert_eq!(words, [0x90000000, 0x91000000]);
    }

    #[test]
    fn test_scalar_float() {
        assert_eq!(emit(|a| a.fadd_d(0, 1, 2).unwrap()), [0x1e622820]);
        assert_eq!(emit(|a| a.fsub_d(0, 1, 2).unwrap()), [0x1e623820]);
        assert_eq!(emit(|a| a.fmul_d(0, 1, 2).unwrap()), [0x1e620820]);
        assert_eq!(emit(|a| a.fdiv_d(0, 1, 2).unwrap()), [0x1e621820]);
        assert_eq!(emit(|a| a.fsqrt_d(0, 1).unwrap()), [0x1e61c020]);
        assert_eq!(emit(|a| a.fmov_d(0, 1).unwrap()), [0x1e604020]);
        assert_eq!(emit(|a| a.fcmp_d(0, 1).unwrap()), [0x1e612000]);
        // High register numbers.
        assert_eq!(emit(|a| a.fadd_d(30, 31, 29).unwrap()), [0x1e7d2bfe]);
    }

    #[test]
    fn test_conversions() {
        assert_eq!(emit(|a| a.fmov_dx(0, 0).unwrap()), [0x9e670000]);
        assert_eq!(emit(|a| a.fmov_xd(0, 0).unwrap()), [0x9e660000]);
        assert_eq!(emit(|a| a.scvtf(0, 0).unwrap()), [0x9e620000]);
        assert_eq!(emit(|a| a.fcvtzs(0, 0).unwrap()), [0x9e780000]);
    }

    #[test]
    fn test_vector_2d() {
        assert_eq!(emit(|a| a.fadd_v2d(0, 1, 2).unwrap()), [0x4e62d420]);
        assert_eq!(emit(|a| a.fmul_v2d(0, 1, 2).unwrap()), [0x6e62dc20]);
        assert_eq!(emit(|a| a.fmla_v2d(0, 1, 2).unwrap()), [0x4e62cc20]);
        assert_eq!(emit(|a| a.dup_v2d(0, 1).unwrap()), [0x4e080c20]);
    }

    #[test]
    fn test_register_validation() {
        let mut buf = SectionBuffer::new("text");
        let mut asm = A64::new(&mut buf, Os::Linux);
        assert!(asm.add(31, 0, 0).is_err());
        assert!(asm.fadd_d(32, 0, 0).is_err());
        assert_eq!(buf.len(), 0);
    }
}
