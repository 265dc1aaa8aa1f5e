//! Veld code generation: AST to native executable.
//!
//! The crate drives the whole back end through a fixed pipeline:
//!
//! ```text
//! symbol collection -> first-pass codegen -> layout -> second-pass
//! codegen -> helper emission -> patching -> container write
//! ```
//!
//! Two emission passes run because section addresses are only known
//! after layout; pass one exists to size the text stream and discover
//! the data-symbol set, pass two re-emits against the final world, and
//! a digest audit proves both passes saw identical symbols. Runtime
//! helpers land after layout in the text section's slack page.

pub mod driver;
pub mod error;
pub mod features;
pub mod introspect;
pub mod liveness;
pub mod optimize;
pub mod pipeline;
pub mod regalloc;
pub mod reloc;
pub mod semantics;
pub mod symbols;

pub use error::{CompileError, CompileResult};
pub use features::{Capability, FeatureTracker};
pub use pipeline::{Phase, Pipeline};

use driver::helpers::{self, KERNEL32};
use reloc::PatchWorld;
use veld_asm::{CallConv, Format, Isa, Os, SectionBuffer, Target};
use veld_object::elf::{EHDR_SIZE, PHDR_SIZE, STATIC_BASE};
use veld_object::layout::{LayoutEngine, SectionClass, SectionPlan};
use veld_object::pe::{PeImports, PE_IMAGE_BASE};
use veld_object::sfx;
use veld_object::{macho, pe, ContainerInput, ContainerWriter, DynamicLinking};
use veld_parser::ast::Program;
use veld_parser::diag::ErrorSink;

/// Compile options, CLI-populated or constructed directly by tests.
#[derive(Debug, Clone)]
pub struct Options {
    pub target: Target,
    pub verbose: bool,
    pub debug: bool,
    /// Budget for whole-program algebraic simplification; 0 disables.
    pub opt_timeout_ms: u64,
    /// Wrap the output in a self-decompressing stub (Linux x86-64).
    pub compress: bool,
}

impl Options {
    pub fn for_target(target: Target) -> Self {
        Self {
            target,
            verbose: false,
            debug: false,
            opt_timeout_ms: 100,
            compress: false,
        }
    }
}

/// A finished compilation: the container bytes plus side channels.
#[derive(Debug)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    /// JSON introspection dump when `--debug` is set.
    pub debug_dump: Option<String>,
    /// Human-readable progress lines for `--verbose`.
    pub log: Vec<String>,
}

/// Compile a parsed program to a native executable image.
///
/// User errors (semantic diagnostics) accumulate in `sink`; the
/// returned error is then [`CompileError::UserErrors`]. Every other
/// error is fatal per the error policy.
pub fn compile(
    program: &Program,
    options: &Options,
    sink: &mut ErrorSink,
) -> CompileResult<Artifact> {
    let target = options.target;
    let cc = CallConv::for_target(target);
    let mut log = Vec::new();

    let mut program = program.clone();
    if options.opt_timeout_ms > 0 {
        let mut simplifier = optimize::Simplifier::new(options.opt_timeout_ms);
        simplifier.run(&mut program);
        if simplifier.folded > 0 {
            log.push(format!("simplifier folded {} expressions", simplifier.folded));
        }
    }

    let mut pipeline = Pipeline::new();
    pipeline.advance(Phase::SymbolCollection)?;
    semantics::check(&program, sink);
    if !sink.is_empty() {
        return Err(CompileError::UserErrors(sink.len()));
    }
    let collected = driver::collect(&program, &cc);
    log.push(format!(
        "collected {} functions, main shape {:?}",
        collected.func_order.len(),
        collected.main_shape
    ));

    // First pass: size the text stream, discover symbols and imports.
    pipeline.advance(Phase::FirstPass)?;
    let mut text = SectionBuffer::new("text");
    let pass1 = driver::emit_pass(&program, &collected, target, &cc, &mut text)?;
    text.commit();
    let text_size = text.len() as u64;
    let pass1_digest = pass1.symbols.digest();
    log.push(format!("first pass: {} bytes of text", text_size));

    // The feature tracker decides static vs dynamic output.
    let mut libs = program.imports.clone();
    if pass1.features.uses(Capability::ParallelMap)
        && !libs.iter().any(|l| l == "libveldrt.so")
    {
        libs.push("libveldrt.so".to_string());
    }
    let imported_funcs = pass1.features.imported_funcs().to_vec();
    let needs_dynamic = pass1.features.needs_dynamic();

    // Invariant: every call site that is not an internal label (current
    // or future helper) must be backed by an imported function, so a
    // PLT slot and relocation will exist for it.
    {
        let mut future_labels = pass1.labels.clone();
        future_labels.insert(driver::HELPER_PRINT_STR.to_string(), 0);
        future_labels.insert(driver::HELPER_PRINT_NUM.to_string(), 0);
        for name in pass1.relocs.external_calls(&future_labels) {
            if !imported_funcs.contains(&name) {
                return Err(CompileError::internal(format!(
                    "call site `{name}` has no label and no import"
                )));
            }
        }
    }

    let mut dynamic = match (target.format(), needs_dynamic) {
        (Format::Elf, true) => Some(DynamicLinking::build(target.isa, &libs, &imported_funcs)),
        (Format::MachO, true) => {
            return Err(CompileError::ImportsUnsupported {
                target: target.triple(),
            })
        }
        _ => None,
    };

    let pe_imports = if target.format() == Format::Pe {
        Some(build_pe_imports(&pass1, &libs, &imported_funcs))
    } else {
        None
    };

    // Layout: place every section, then bake final addresses into the
    // dynamic metadata.
    pipeline.advance(Phase::Layout)?;
    let (ro_size, rw_size) = pass1.symbols.section_sizes();
    let page = target.page_size();
    let plans = section_plans(
        target,
        text_size,
        ro_size,
        rw_size,
        dynamic.as_ref(),
        pe_imports.as_ref(),
        &libs,
    );
    let base = layout_base(target, needs_dynamic);
    let layout = LayoutEngine::new(page, base).place(&plans)?;
    if let Some(dl) = dynamic.as_mut() {
        dl.finalize(
            layout.get("dynamic")?.vaddr,
            layout.get("got")?.vaddr,
            layout.get("plt")?.vaddr,
            layout.get("dynstr")?.vaddr,
            layout.get("dynsym")?.vaddr,
            layout.get("hash")?.vaddr,
            layout.get("rela")?.vaddr,
        );
    }
    let mut pe_imports = pe_imports;
    if let Some(imports) = pe_imports.as_mut() {
        imports.finalize(layout.get("idata")?.file_offset as u32);
    }
    log.push(format!(
        "layout: {} sections, text at {:#x}",
        plans.len(),
        layout.get("text")?.vaddr
    ));

    // Second pass: identical walk against final addresses.
    pipeline.advance(Phase::SecondPass)?;
    text.reset();
    let mut pass2 = driver::emit_pass(&program, &collected, target, &cc, &mut text)?;
    if pass2.symbols.digest() != pass1_digest {
        return Err(CompileError::internal(
            "second pass discovered a different symbol set than the first",
        ));
    }
    if text.len() as u64 != text_size {
        return Err(CompileError::internal(
            "second pass emitted a different amount of code than the first",
        ));
    }
    pass2
        .symbols
        .assign_addresses(layout.get("rodata")?.vaddr, layout.get("data")?.vaddr);

    // Helpers go after the laid-out text, into the reserved slack.
    pipeline.advance(Phase::Helpers)?;
    helpers::emit_helpers(target, &cc, &mut text, &mut pass2)?;
    let text_placed = layout.get("text")?;
    if text.len() as u64 > text_placed.size + page {
        return Err(CompileError::internal(
            "runtime helpers exceed the reserved slack page",
        ));
    }

    // Patch every recorded placeholder with final addresses.
    pipeline.advance(Phase::Patching)?;
    let iat_resolver = pe_imports.as_ref().map(|imports| {
        move |dll: &str, func: &str| {
            imports
                .iat_rva(dll, func)
                .map(|rva| PE_IMAGE_BASE + u64::from(rva))
        }
    });
    {
        let iat_dyn: Option<&dyn Fn(&str, &str) -> Option<u64>> = iat_resolver
            .as_ref()
            .map(|f| f as &dyn Fn(&str, &str) -> Option<u64>);
        let world = PatchWorld {
            text_vaddr: text_placed.vaddr,
            labels: &pass2.labels,
            symbols: &pass2.symbols,
            dynamic: dynamic.as_ref(),
            iat_vaddr: iat_dyn,
        };
        pass2.relocs.patch_all(&mut text, &world)?;
    }
    text.commit();
    if options.verbose {
        let leftovers = reloc::find_sentinels(text.bytes());
        log.push(format!(
            "patched {} relocations, {} sentinel-shaped words remain",
            pass2.relocs.len(),
            leftovers.len()
        ));
    }

    // Serialize the container.
    pipeline.advance(Phase::ContainerWrite)?;
    let (ro_bytes, rw_bytes) = pass2.symbols.section_bytes();
    let input = ContainerInput {
        target,
        layout: &layout,
        text: text.bytes(),
        rodata: &ro_bytes,
        data: &rw_bytes,
        entry_vaddr: text_placed.vaddr,
        dynamic: dynamic.as_ref(),
    };
    let mut bytes = match target.format() {
        Format::Elf => veld_object::elf::ElfWriter.write(&input)?,
        Format::MachO => macho::MachOWriter { libs: libs.clone() }.write(&input)?,
        Format::Pe => pe::PeWriter {
            imports: pe_imports.take().expect("built for PE above"),
        }
        .write(&input)?,
    };

    if options.compress {
        if target.isa != Isa::X86_64 || target.os != Os::Linux {
            return Err(CompileError::CompressUnsupported);
        }
        let before = bytes.len();
        bytes = sfx::wrap(&bytes)?;
        log.push(format!(
            "compressed {} bytes into a {}-byte self-extracting stub",
            before,
            bytes.len()
        ));
    }

    pipeline.advance(Phase::Done)?;

    let debug_dump = if options.debug {
        let dump = introspect::dump(target, &layout, &pass2.symbols, &collected);
        Some(serde_json::to_string_pretty(&dump).expect("dump types serialize infallibly"))
    } else {
        None
    };

    Ok(Artifact {
        bytes,
        debug_dump,
        log,
    })
}

fn layout_base(target: Target, needs_dynamic: bool) -> u64 {
    match target.format() {
        // ET_DYN images are position-independent; link-time addresses
        // start at zero and the loader slides everything uniformly.
        Format::Elf => {
            if needs_dynamic {
                0
            } else {
                STATIC_BASE
            }
        }
        Format::MachO => macho::MACHO_BASE,
        Format::Pe => PE_IMAGE_BASE,
    }
}

fn section_plans(
    target: Target,
    text_size: u64,
    ro_size: u64,
    rw_size: u64,
    dynamic: Option<&DynamicLinking>,
    pe_imports: Option<&PeImports>,
    libs: &[String],
) -> Vec<SectionPlan> {
    let page = target.page_size();
    match (target.format(), dynamic) {
        (Format::Elf, Some(dl)) => vec![
            SectionPlan::new("ehdr", EHDR_SIZE + 6 * PHDR_SIZE, 8, SectionClass::Header),
            SectionPlan::new(
                "interp",
                target.interp_path().len() as u64 + 1,
                1,
                SectionClass::ReadOnly,
            ),
            SectionPlan::new("dynstr", dl.strtab_size(), 1, SectionClass::ReadOnly),
            SectionPlan::new("dynsym", dl.symtab_size(), 8, SectionClass::ReadOnly),
            SectionPlan::new("hash", dl.hash_size(), 8, SectionClass::ReadOnly),
            SectionPlan::new("rela", dl.rela_size(), 8, SectionClass::ReadOnly),
            SectionPlan::new("plt", dl.plt_size(), 16, SectionClass::Text),
            SectionPlan::new("text", text_size, 16, SectionClass::Text).with_pad_after(page),
            SectionPlan::new("dynamic", dl.dynamic_size(), 8, SectionClass::ReadWrite),
            SectionPlan::new("got", dl.got_size(), 8, SectionClass::ReadWrite),
            SectionPlan::new("rodata", ro_size, 8, SectionClass::ReadWrite),
            SectionPlan::new("data", rw_size, 8, SectionClass::ReadWrite),
        ],
        (Format::Elf, None) => vec![
            SectionPlan::new("ehdr", EHDR_SIZE + 4 * PHDR_SIZE, 8, SectionClass::Header),
            SectionPlan::new("text", text_size, 16, SectionClass::Text).with_pad_after(page),
            SectionPlan::new("rodata", ro_size, 8, SectionClass::ReadOnly),
            SectionPlan::new("data", rw_size, 8, SectionClass::ReadWrite),
        ],
        (Format::MachO, _) => vec![
            // Header and code share the __TEXT segment.
            SectionPlan::new("ehdr", macho::header_size(libs), 8, SectionClass::Header),
            SectionPlan::new("text", text_size, 16, SectionClass::Header).with_pad_after(page),
            SectionPlan::new("rodata", ro_size, 8, SectionClass::ReadWrite),
            SectionPlan::new("data", rw_size, 8, SectionClass::ReadWrite),
        ],
        (Format::Pe, _) => {
            // PE section table: every section starts on a
            // file-alignment boundary (== the section alignment here).
            let idata = pe_imports.map(|i| i.size()).unwrap_or(8).max(8);
            vec![
                SectionPlan::new("ehdr", pe::headers_size(4), 8, SectionClass::Header),
                SectionPlan::new("text", text_size, page, SectionClass::Text).with_pad_after(page),
                SectionPlan::new("rodata", ro_size, page, SectionClass::ReadOnly),
                SectionPlan::new("data", rw_size, page, SectionClass::ReadWrite),
                SectionPlan::new("idata", idata, page, SectionClass::ReadWrite),
            ]
        }
    }
}

fn build_pe_imports(
    pass1: &driver::PassOutput,
    libs: &[String],
    imported_funcs: &[String],
) -> PeImports {
    let mut dlls: Vec<(String, Vec<String>)> = Vec::new();
    if !imported_funcs.is_empty() {
        if let Some(dll) = libs.first() {
            dlls.push((dll.clone(), imported_funcs.to_vec()));
        }
    }
    let mut k32 = vec!["ExitProcess".to_string()];
    if pass1.features.uses(Capability::PrintStr) || pass1.features.uses(Capability::PrintNum) {
        k32.push("GetStdHandle".to_string());
        k32.push("WriteFile".to_string());
    }
    dlls.push((KERNEL32.to_string(), k32));
    PeImports::build(dlls)
}
