//! Section layout, dynamic-linking metadata, and container writers.
//!
//! This crate turns finished section contents into a loadable executable:
//!
//! - [`layout`] assigns file offsets and virtual addresses under the
//!   target's page-alignment rules,
//! - [`dynamic`] builds the string/symbol/hash/relocation tables, GOT,
//!   and dynamic section for dynamically-linked output,
//! - [`plt`] emits the per-ISA procedure-linkage-table stubs,
//! - [`elf`], [`macho`], [`pe`] serialize the three container formats
//!   behind the common [`ContainerWriter`] interface,
//! - [`sfx`] wraps a finished Linux executable in a self-extracting
//!   stub (`--compress`).

pub mod dynamic;
pub mod elf;
pub mod layout;
pub mod macho;
pub mod pe;
pub mod plt;
pub mod sfx;

pub use dynamic::DynamicLinking;
pub use layout::{Layout, LayoutEngine, Placed, SectionClass, SectionPlan};

use thiserror::Error;
use veld_asm::Target;

pub type ObjectResult<T> = Result<T, ObjectError>;

/// Errors from layout or container serialization.
#[derive(Debug, Error)]
pub enum ObjectError {
    #[error("section {0:?} was not placed by the layout engine")]
    MissingSection(&'static str),

    #[error("layout produced a non-monotonic address for section {0:?}")]
    NonMonotonic(&'static str),

    #[error("target {0} is not supported by this container writer")]
    WrongTarget(Target),

    #[error("emitter error: {0}")]
    Asm(#[from] veld_asm::AsmError),
}

/// Everything a container writer consumes: placed sections, their
/// contents, and the dynamic metadata when external calls exist.
pub struct ContainerInput<'a> {
    pub target: Target,
    pub layout: &'a Layout,
    pub text: &'a [u8],
    pub rodata: &'a [u8],
    pub data: &'a [u8],
    pub entry_vaddr: u64,
    pub dynamic: Option<&'a DynamicLinking>,
}

/// The shared interface of the three container writers.
pub trait ContainerWriter {
    /// Serialize a byte-exact executable container.
    fn write(&self, input: &ContainerInput<'_>) -> ObjectResult<Vec<u8>>;
}
