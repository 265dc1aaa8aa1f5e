//! Veld assembler layer: targets, section buffers, and instruction emitters.
//!
//! This crate is the machine-facing bottom of the compiler. It knows nothing
//! about the Veld language; it exposes:
//!
//! - [`Target`] descriptors (ISA, OS, container format) and per-target
//!   calling conventions,
//! - [`SectionBuffer`], the append-only byte stream with an explicit
//!   `Open -> Committed -> Reset` lifecycle,
//! - one byte-exact instruction emitter per ISA ([`x86_64`], [`aarch64`],
//!   [`riscv64`]) behind the common [`Emitter`] trait,
//! - [`StackChecker`], a push/pop balance validator run alongside emission.
//!
//! Every emitter operation appends a fixed, deterministic number of bytes,
//! with two documented exceptions: load-immediate (which expands on the RISC
//! ISAs to cover 64-bit constants) and call-site emission (which writes a
//! placeholder displacement and reports the patch position to the caller).

pub mod buffer;
pub mod cc;
pub mod emit;
pub mod reg;
pub mod stack_check;
pub mod target;

pub mod aarch64;
pub mod riscv64;
pub mod x86_64;

pub use buffer::{BufferState, SectionBuffer};
pub use cc::CallConv;
pub use emit::{Cond, Emitter, Patch};
pub use stack_check::StackChecker;
pub use target::{Format, Isa, Os, SyscallNums, Target};

use thiserror::Error;

/// Result alias for emitter operations.
pub type AsmResult<T> = Result<T, AsmError>;

/// Errors raised by the assembler layer.
///
/// Every variant here is a *codegen*-kind error: the caller handed the
/// emitter an operand it cannot encode. These abort compilation; they are
/// never user-visible source diagnostics.
#[derive(Debug, Clone, Error)]
pub enum AsmError {
    /// An operand named a register that does not exist on the target ISA.
    #[error("unknown register {name:?} for {isa}")]
    UnknownRegister { name: String, isa: Isa },

    /// A register number outside the ISA's encodable range.
    #[error("register number {num} out of range for {what} on {isa}")]
    RegisterRange { num: u8, what: &'static str, isa: Isa },

    /// An immediate that does not fit the instruction's immediate field.
    #[error("immediate {value:#x} does not fit in {field}")]
    ImmediateRange { value: i64, field: &'static str },

    /// A displacement that does not fit the addressing mode.
    #[error("displacement {value} does not fit in {field}")]
    DisplacementRange { value: i64, field: &'static str },

    /// A branch target too far away for the branch encoding.
    #[error("branch offset {offset} out of range for {form}")]
    BranchRange { offset: i64, form: &'static str },

    /// An operation the target ISA does not provide.
    #[error("{op} is not available on {isa}")]
    Unsupported { op: &'static str, isa: Isa },

    /// An operand combination the encoding cannot express.
    #[error("invalid operand: {what}")]
    InvalidOperand { what: &'static str },

    /// Unknown target triple on the command line.
    #[error("unknown target triple {0:?}")]
    UnknownTriple(String),
}
