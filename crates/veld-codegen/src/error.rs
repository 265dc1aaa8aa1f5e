//! Compilation errors.
//!
//! Two severities per the error policy: user-facing syntax/semantic
//! diagnostics accumulate in the sink and are rendered with carets;
//! the variants here are the *fatal* kinds — codegen inconsistencies
//! and internal invariant violations abort compilation immediately.

use thiserror::Error;

pub type CompileResult<T> = Result<T, CompileError>;

#[derive(Debug, Error)]
pub enum CompileError {
    /// Accumulated user errors; the sink holds the diagnostics.
    #[error("compilation failed with {0} error(s)")]
    UserErrors(usize),

    #[error("invalid register operand: {0}")]
    InvalidOperand(String),

    /// A string constant flowed into a numeric position (strings are
    /// static rodata values in this backend).
    #[error("type error: {0}")]
    Shape(String),

    #[error("unresolvable call target `{name}` (not internal, and no import provides it)")]
    UnresolvableCall { name: String },

    #[error("dynamic imports are not supported for {target}")]
    ImportsUnsupported { target: String },

    #[error("`--compress` is only available for x86_64-linux output")]
    CompressUnsupported,

    #[error("emitter error: {0}")]
    Asm(#[from] veld_asm::AsmError),

    #[error("object error: {0}")]
    Object(#[from] veld_object::ObjectError),

    /// Compiler bugs: phase-order violations, cross-pass divergence,
    /// stack imbalance observed at the end of emission.
    #[error("internal compiler error: {0}")]
    Internal(String),
}

impl CompileError {
    pub fn internal(message: impl Into<String>) -> Self {
        CompileError::Internal(message.into())
    }
}
