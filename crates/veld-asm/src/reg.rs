//! Register tables.
//!
//! The emitters address registers by their hardware encoding number; this
//! module owns the name tables used to resolve textual operands and to
//! print registers in diagnostics. A name missing from the table is an
//! [`AsmError::UnknownRegister`], never a silent no-op.

use crate::{AsmError, AsmResult, Isa};

/// General-purpose register names, indexed by encoding number.
pub const X64_GPR_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];

/// SSE/AVX register names (EVEX extends the file to 32).
pub const X64_XMM_NAMES: [&str; 32] = [
    "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7", "xmm8", "xmm9", "xmm10",
    "xmm11", "xmm12", "xmm13", "xmm14", "xmm15", "xmm16", "xmm17", "xmm18", "xmm19", "xmm20",
    "xmm21", "xmm22", "xmm23", "xmm24", "xmm25", "xmm26", "xmm27", "xmm28", "xmm29", "xmm30",
    "xmm31",
];

/// AArch64 integer register names. `x31` is context-dependent (sp/xzr) and
/// resolved by the emitter, so both spellings appear here.
pub const A64_GPR_NAMES: [&str; 31] = [
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
    "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26",
    "x27", "x28", "x29", "x30",
];

pub const A64_FREG_NAMES: [&str; 32] = [
    "d0", "d1", "d2", "d3", "d4", "d5", "d6", "d7", "d8", "d9", "d10", "d11", "d12", "d13",
    "d14", "d15", "d16", "d17", "d18", "d19", "d20", "d21", "d22", "d23", "d24", "d25", "d26",
    "d27", "d28", "d29", "d30", "d31",
];

/// RV64 integer registers, ABI names.
pub const RV_GPR_NAMES: [&str; 32] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4",
    "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4",
    "t5", "t6",
];

/// RV64 float registers, ABI names.
pub const RV_FREG_NAMES: [&str; 32] = [
    "ft0", "ft1", "ft2", "ft3", "ft4", "ft5", "ft6", "ft7", "fs0", "fs1", "fa0", "fa1", "fa2",
    "fa3", "fa4", "fa5", "fa6", "fa7", "fs2", "fs3", "fs4", "fs5", "fs6", "fs7", "fs8", "fs9",
    "fs10", "fs11", "ft8", "ft9", "ft10", "ft11",
];

fn find(table: &[&str], name: &str) -> Option<u8> {
    table.iter().position(|n| *n == name).map(|i| i as u8)
}

/// Resolve a general-purpose register name to its encoding number.
pub fn lookup_gpr(isa: Isa, name: &str) -> AsmResult<u8> {
    let num = match isa {
        Isa::X86_64 => find(&X64_GPR_NAMES, name),
        Isa::Aarch64 => match name {
            "sp" | "xzr" => Some(31),
            "fp" => Some(29),
            "lr" => Some(30),
            _ => find(&A64_GPR_NAMES, name),
        },
        Isa::Riscv64 => match name {
            "fp" => Some(8),
            _ => find(&RV_GPR_NAMES, name).or_else(|| {
                // Numeric spellings x0..x31 are accepted too.
                name.strip_prefix('x')
                    .and_then(|n| n.parse::<u8>().ok())
                    .filter(|n| *n < 32)
            }),
        },
    };
    num.ok_or_else(|| AsmError::UnknownRegister {
        name: name.to_string(),
        isa,
    })
}

/// Resolve a floating-point register name to its encoding number.
pub fn lookup_freg(isa: Isa, name: &str) -> AsmResult<u8> {
    let num = match isa {
        Isa::X86_64 => find(&X64_XMM_NAMES, name),
        Isa::Aarch64 => find(&A64_FREG_NAMES, name)
            .or_else(|| find_prefixed(name, 'v'))
            .or_else(|| find_prefixed(name, 'q')),
        Isa::Riscv64 => find(&RV_FREG_NAMES, name).or_else(|| find_prefixed(name, 'f')),
    };
    num.ok_or_else(|| AsmError::UnknownRegister {
        name: name.to_string(),
        isa,
    })
}

fn find_prefixed(name: &str, prefix: char) -> Option<u8> {
    name.strip_prefix(prefix)
        .and_then(|n| n.parse::<u8>().ok())
        .filter(|n| *n < 32)
}

/// Printable name of a GPR.
pub fn gpr_name(isa: Isa, num: u8) -> &'static str {
    match isa {
        Isa::X86_64 => X64_GPR_NAMES[num as usize],
        Isa::Aarch64 => {
            if num == 31 {
                "sp"
            } else {
                A64_GPR_NAMES[num as usize]
            }
        }
        Isa::Riscv64 => RV_GPR_NAMES[num as usize],
    }
}

/// Printable name of a float register.
pub fn freg_name(isa: Isa, num: u8) -> &'static str {
    match isa {
        Isa::X86_64 => X64_XMM_NAMES[num as usize],
        Isa::Aarch64 => A64_FREG_NAMES[num as usize],
        Isa::Riscv64 => RV_FREG_NAMES[num as usize],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_x64() {
        assert_eq!(lookup_gpr(Isa::X86_64, "rax").unwrap(), 0);
        assert_eq!(lookup_gpr(Isa::X86_64, "r15").unwrap(), 15);
        assert_eq!(lookup_freg(Isa::X86_64, "xmm9").unwrap(), 9);
    }

    #[test]
    fn test_lookup_a64_aliases() {
        assert_eq!(lookup_gpr(Isa::Aarch64, "fp").unwrap(), 29);
        assert_eq!(lookup_gpr(Isa::Aarch64, "lr").unwrap(), 30);
        assert_eq!(lookup_gpr(Isa::Aarch64, "sp").unwrap(), 31);
        assert_eq!(lookup_freg(Isa::Aarch64, "d31").unwrap(), 31);
        assert_eq!(lookup_freg(Isa::Aarch64, "v7").unwrap(), 7);
    }

    #[test]
    fn test_lookup_rv_abi_and_numeric() {
        assert_eq!(lookup_gpr(Isa::Riscv64, "a0").unwrap(), 10);
        assert_eq!(lookup_gpr(Isa::Riscv64, "s11").unwrap(), 27);
        assert_eq!(lookup_gpr(Isa::Riscv64, "x28").unwrap(), 28);
        assert_eq!(lookup_freg(Isa::Riscv64, "fa0").unwrap(), 10);
    }

    #[test]
    fn test_unknown_register_is_an_error() {
        let err = lookup_gpr(Isa::X86_64, "rax64").unwrap_err();
        assert!(matches!(err, AsmError::UnknownRegister { .. }));
        assert!(lookup_gpr(Isa::Aarch64, "w0").is_err());
        assert!(lookup_freg(Isa::Riscv64, "f32").is_err());
    }
}
