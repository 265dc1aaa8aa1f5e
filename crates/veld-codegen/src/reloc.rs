//! Relocation records and the patcher.
//!
//! Every placeholder the emitter writes is paired with exactly one
//! record here; patching rewrites them all once layout has assigned
//! addresses, and leaves no placeholder behind.
//!
//! Call-site records carry the callee's *textual* name plus a `$n`
//! site suffix so repeated calls to the same function patch
//! independently. Resolution order at patch time: strip the suffix,
//! try the internal label table, then the PLT (or IAT on Windows).
//! Helper calls are recorded before the helper block exists; by patch
//! time helpers have labels, so a name that still resolves to nothing
//! is a fatal codegen error.

use crate::error::{CompileError, CompileResult};
use crate::symbols::{DataSymbols, SymId};
use rustc_hash::FxHashMap;
use veld_asm::emit::{apply_patch, Patch};
use veld_asm::SectionBuffer;
use veld_object::DynamicLinking;

/// What a patch site refers to.
#[derive(Debug, Clone)]
pub enum RelocKind {
    /// PC-relative reference to a rodata/data symbol.
    Data(SymId),
    /// Direct call or branch to a named target (`name$site`).
    Call(String),
    /// Windows import-address-table slot.
    Iat { dll: String, func: String },
}

#[derive(Debug, Clone)]
pub struct Reloc {
    pub patch: Patch,
    pub kind: RelocKind,
}

/// Addresses the patcher needs beyond the records themselves.
pub struct PatchWorld<'a> {
    /// Virtual address of text offset 0.
    pub text_vaddr: u64,
    /// Internal code labels, as text offsets.
    pub labels: &'a FxHashMap<String, usize>,
    pub symbols: &'a DataSymbols,
    pub dynamic: Option<&'a DynamicLinking>,
    /// `(iat_rva -> vaddr)` resolver for PE targets.
    pub iat_vaddr: Option<&'a dyn Fn(&str, &str) -> Option<u64>>,
}

/// The record table for one codegen pass.
#[derive(Debug, Default)]
pub struct RelocTable {
    relocs: Vec<Reloc>,
    call_sites: u32,
}

impl RelocTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_data(&mut self, patch: Patch, sym: SymId) {
        self.relocs.push(Reloc {
            patch,
            kind: RelocKind::Data(sym),
        });
    }

    /// Record a call site; returns the suffixed site name.
    pub fn record_call(&mut self, patch: Patch, name: &str) -> String {
        let site = format!("{name}${}", self.call_sites);
        self.call_sites += 1;
        self.relocs.push(Reloc {
            patch,
            kind: RelocKind::Call(site.clone()),
        });
        site
    }

    pub fn record_iat(&mut self, patch: Patch, dll: &str, func: &str) {
        self.relocs.push(Reloc {
            patch,
            kind: RelocKind::Iat {
                dll: dll.to_string(),
                func: func.to_string(),
            },
        });
    }

    pub fn len(&self) -> usize {
        self.relocs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relocs.is_empty()
    }

    /// Rewrite every recorded placeholder. Re-runnable: records are
    /// rebuilt per pass, and applying twice with the same world writes
    /// the same bytes.
    pub fn patch_all(&mut self, text: &mut SectionBuffer, world: &PatchWorld<'_>) -> CompileResult<()> {
        for reloc in &self.relocs {
            match &reloc.kind {
                RelocKind::Data(sym) => {
                    let target = world.symbols.addr(*sym)?;
                    apply_patch(text, &reloc.patch, world.text_vaddr, target)?;
                }
                RelocKind::Call(site) => {
                    let bare = site.split('$').next().unwrap_or(site);
                    if let Some(off) = world.labels.get(bare) {
                        // Intra-text branch: plain offsets on both sides.
                        apply_patch(text, &reloc.patch, 0, *off as u64)?;
                    } else if let Some(slot) =
                        world.dynamic.and_then(|d| d.plt_slot_vaddr(bare))
                    {
                        apply_patch(text, &reloc.patch, world.text_vaddr, slot)?;
                    } else {
                        return Err(CompileError::UnresolvableCall {
                            name: bare.to_string(),
                        });
                    }
                }
                RelocKind::Iat { dll, func } => {
                    let resolve = world.iat_vaddr.ok_or_else(|| {
                        CompileError::internal("IAT relocation without an import table")
                    })?;
                    let target = resolve(dll, func).ok_or_else(|| CompileError::UnresolvableCall {
                        name: func.clone(),
                    })?;
                    apply_patch(text, &reloc.patch, world.text_vaddr, target)?;
                }
            }
        }
        Ok(())
    }

    /// The imported names this pass referenced, in first-call order:
    /// call targets that are not internal labels.
    pub fn external_calls(&self, labels: &FxHashMap<String, usize>) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for reloc in &self.relocs {
            if let RelocKind::Call(site) = &reloc.kind {
                let bare = site.split('$').next().unwrap_or(site).to_string();
                if !labels.contains_key(&bare) && !out.contains(&bare) {
                    out.push(bare);
                }
            }
        }
        out
    }
}

/// Scan an emitted code region for surviving placeholder sentinels.
/// Used by tests and the verbose diagnostics to prove relocation
/// completeness.
pub fn find_sentinels(code: &[u8]) -> Vec<usize> {
    code.windows(4)
        .enumerate()
        .filter(|(_, w)| *w == [0x78, 0x56, 0x34, 0x12])
        .map(|(i, _)| i)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use veld_asm::emit::PatchKind;

    #[test]
    fn test_call_sites_get_unique_suffixes() {
        let mut table = RelocTable::new();
        let p = Patch {
            at: 0,
            kind: PatchKind::Rel32,
        };
        assert_eq!(table.record_call(p, "sin"), "sin$0");
        assert_eq!(table.record_call(p, "sin"), "sin$1");
        assert_eq!(table.record_call(p, "fact"), "fact$2");
    }

    #[test]
    fn test_external_calls_in_first_call_order() {
        let mut table = RelocTable::new();
        let p = Patch {
            at: 0,
            kind: PatchKind::Rel32,
        };
        table.record_call(p, "sin");
        table.record_call(p, "fact");
        table.record_call(p, "cos");
        table.record_call(p, "sin");
        let mut labels = FxHashMap::default();
        labels.insert("fact".to_string(), 64usize);
        assert_eq!(table.external_calls(&labels), ["sin", "cos"]);
    }

    #[test]
    fn test_patch_internal_label() {
        let mut text = SectionBuffer::new("text");
        text.write_u8(0xe8);
        let at = text.len();
        text.write_u32(0x12345678);
        let mut table = RelocTable::new();
        table.record_call(
            Patch {
                at,
                kind: PatchKind::Rel32,
            },
            "helper",
        );
        let mut labels = FxHashMap::default();
        labels.insert("helper".to_string(), 0x40usize);
        let symbols = DataSymbols::new();
        let world = PatchWorld {
            text_vaddr: 0x1000,
            labels: &labels,
            symbols: &symbols,
            dynamic: None,
            iat_vaddr: None,
        };
        table.patch_all(&mut text, &world).unwrap();
        // call at 0, disp at 1: 0x40 - 5 = 0x3b.
        assert_eq!(text.read_u32(1), 0x3b);
        assert!(find_sentinels(text.bytes()).is_empty());
    }

    #[test]
    fn test_unresolvable_call_is_an_error() {
        let mut text = SectionBuffer::new("text");
        text.write_u8(0xe8);
        let at = text.len();
        text.write_u32(0x12345678);
        let mut table = RelocTable::new();
        table.record_call(
            Patch {
                at,
                kind: PatchKind::Rel32,
            },
            "nowhere",
        );
        let labels = FxHashMap::default();
        let symbols = DataSymbols::new();
        let world = PatchWorld {
            text_vaddr: 0,
            labels: &labels,
            symbols: &symbols,
            dynamic: None,
            iat_vaddr: None,
        };
        assert!(matches!(
            table.patch_all(&mut text, &world),
            Err(CompileError::UnresolvableCall { .. })
        ));
    }

    #[test]
    fn test_find_sentinels() {
        let code = [0x90, 0x78, 0x56, 0x34, 0x12, 0xc3];
        assert_eq!(find_sentinels(&code), [1]);
        assert!(find_sentinels(&[0x90, 0xc3]).is_empty());
    }
}
