//! Target descriptors.
//!
//! A [`Target`] is the `(isa, os, format)` triple fixed before emission
//! begins. It selects the instruction emitter, the register set the
//! allocator sees, the container writer, and the syscall numbers the
//! runtime helpers bake in.

use crate::{AsmError, AsmResult};
use std::fmt;

/// Instruction-set architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Isa {
    X86_64,
    Aarch64,
    Riscv64,
}

impl fmt::Display for Isa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Isa::X86_64 => "x86_64",
            Isa::Aarch64 => "aarch64",
            Isa::Riscv64 => "riscv64",
        })
    }
}

/// Operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Os {
    Linux,
    Darwin,
    Windows,
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Os::Linux => "linux",
            Os::Darwin => "darwin",
            Os::Windows => "windows",
        })
    }
}

/// Executable container format. Follows from the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Elf,
    MachO,
    Pe,
}

/// Syscall numbers the emitted runtime helpers use directly.
///
/// Windows has no stable syscall surface; helpers there go through the
/// import table instead and this struct is never consulted.
#[derive(Debug, Clone, Copy)]
pub struct SyscallNums {
    pub write: u64,
    pub exit: u64,
    pub mmap: u64,
    pub memfd_create: u64,
    pub execveat: u64,
}

/// A compilation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Target {
    pub isa: Isa,
    pub os: Os,
}

impl Target {
    pub const fn new(isa: Isa, os: Os) -> Self {
        Self { isa, os }
    }

    /// Parse a command-line triple such as `x86_64-linux` or
    /// `aarch64-darwin`.
    pub fn parse(triple: &str) -> AsmResult<Self> {
        match triple {
            "x86_64-linux" => Ok(Self::new(Isa::X86_64, Os::Linux)),
            "aarch64-linux" => Ok(Self::new(Isa::Aarch64, Os::Linux)),
            "riscv64-linux" => Ok(Self::new(Isa::Riscv64, Os::Linux)),
            "aarch64-darwin" => Ok(Self::new(Isa::Aarch64, Os::Darwin)),
            "x86_64-windows" => Ok(Self::new(Isa::X86_64, Os::Windows)),
            other => Err(AsmError::UnknownTriple(other.to_string())),
        }
    }

    /// The host target, used when `--target` is absent.
    pub fn host() -> Self {
        let isa = if cfg!(target_arch = "aarch64") {
            Isa::Aarch64
        } else if cfg!(target_arch = "riscv64") {
            Isa::Riscv64
        } else {
            Isa::X86_64
        };
        let os = if cfg!(target_os = "macos") {
            Os::Darwin
        } else if cfg!(target_os = "windows") {
            Os::Windows
        } else {
            Os::Linux
        };
        Self::new(isa, os)
    }

    /// Container format implied by the OS.
    pub fn format(&self) -> Format {
        match self.os {
            Os::Linux => Format::Elf,
            Os::Darwin => Format::MachO,
            Os::Windows => Format::Pe,
        }
    }

    /// Page size used for segment alignment.
    pub fn page_size(&self) -> u64 {
        match (self.isa, self.os) {
            (Isa::Aarch64, Os::Darwin) => 0x4000,
            _ => 0x1000,
        }
    }

    /// Required stack alignment at call sites, in bytes.
    pub fn stack_align(&self) -> u64 {
        16
    }

    /// Canonical dynamic-linker path written into PT_INTERP.
    ///
    /// Only meaningful for ELF targets.
    pub fn interp_path(&self) -> &'static str {
        match self.isa {
            Isa::X86_64 => "/lib64/ld-linux-x86-64.so.2",
            Isa::Aarch64 => "/lib/ld-linux-aarch64.so.1",
            Isa::Riscv64 => "/lib/ld-linux-riscv64-lp64d.so.1",
        }
    }

    /// Syscall numbers for the runtime helpers.
    pub fn syscalls(&self) -> SyscallNums {
        match (self.isa, self.os) {
            (Isa::X86_64, Os::Linux) => SyscallNums {
                write: 1,
                exit: 60,
                mmap: 9,
                memfd_create: 319,
                execveat: 322,
            },
            (Isa::Aarch64, Os::Linux) | (Isa::Riscv64, Os::Linux) => SyscallNums {
                write: 64,
                exit: 93,
                mmap: 222,
                memfd_create: 279,
                execveat: 281,
            },
            // Darwin BSD syscall classes; x16 carries the number.
            (_, Os::Darwin) => SyscallNums {
                write: 4,
                exit: 1,
                mmap: 197,
                memfd_create: 0,
                execveat: 0,
            },
            (_, Os::Windows) => SyscallNums {
                write: 0,
                exit: 0,
                mmap: 0,
                memfd_create: 0,
                execveat: 0,
            },
        }
    }

    pub fn triple(&self) -> String {
        format!("{}-{}", self.isa, self.os)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.isa, self.os)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_triples() {
        assert_eq!(
            Target::parse("x86_64-linux").unwrap(),
            Target::new(Isa::X86_64, Os::Linux)
        );
        assert_eq!(
            Target::parse("aarch64-darwin").unwrap(),
            Target::new(Isa::Aarch64, Os::Darwin)
        );
        assert_eq!(
            Target::parse("riscv64-linux").unwrap(),
            Target::new(Isa::Riscv64, Os::Linux)
        );
    }

    #[test]
    fn test_parse_unknown_triple() {
        assert!(Target::parse("mips-linux").is_err());
    }

    #[test]
    fn test_page_sizes() {
        assert_eq!(Target::parse("x86_64-linux").unwrap().page_size(), 0x1000);
        assert_eq!(Target::parse("aarch64-darwin").unwrap().page_size(), 0x4000);
        assert_eq!(Target::parse("aarch64-linux").unwrap().page_size(), 0x1000);
    }

    #[test]
    fn test_format_follows_os() {
        assert_eq!(Target::parse("x86_64-linux").unwrap().format(), Format::Elf);
        assert_eq!(
            Target::parse("aarch64-darwin").unwrap().format(),
            Format::MachO
        );
        assert_eq!(
            Target::parse("x86_64-windows").unwrap().format(),
            Format::Pe
        );
    }

    #[test]
    fn test_interp_paths() {
        assert_eq!(
            Target::parse("x86_64-linux").unwrap().interp_path(),
            "/lib64/ld-linux-x86-64.so.2"
        );
        assert_eq!(
            Target::parse("riscv64-linux").unwrap().interp_path(),
            "/lib/ld-linux-riscv64-lp64d.so.1"
        );
    }
}
