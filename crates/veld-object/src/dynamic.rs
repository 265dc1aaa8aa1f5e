//! Dynamic-linking metadata.
//!
//! Built once per compilation when any external call exists: the string
//! table, symbol table, SysV hash table, JUMP_SLOT relocations, GOT
//! image, PLT, and the dynamic section enumerating them all.
//!
//! Construction is two-step: [`DynamicLinking::build`] computes the full
//! structure with sizes (so the layout engine can place everything), and
//! [`DynamicLinking::finalize`] bakes in the final virtual addresses.
//! `update_pltgot` and `update_relocation_target` remain available for
//! post-finalize address adjustments.

use crate::plt;
use rustc_hash::FxHashMap;
use veld_asm::Isa;

// Dynamic-section tags.
pub const DT_NULL: u64 = 0;
pub const DT_NEEDED: u64 = 1;
pub const DT_PLTRELSZ: u64 = 2;
pub const DT_PLTGOT: u64 = 3;
pub const DT_HASH: u64 = 4;
pub const DT_STRTAB: u64 = 5;
pub const DT_SYMTAB: u64 = 6;
pub const DT_STRSZ: u64 = 10;
pub const DT_SYMENT: u64 = 11;
pub const DT_PLTREL: u64 = 20;
pub const DT_JMPREL: u64 = 23;
pub const DT_FLAGS_1: u64 = 0x6fff_fffb;
pub const DF_1_PIE: u64 = 0x0800_0000;

// Symbol fields.
pub const STB_GLOBAL: u8 = 1;
pub const STT_FUNC: u8 = 2;
pub const SHN_UNDEF: u16 = 0;

// JUMP_SLOT relocation type per ISA.
pub const R_X86_64_JUMP_SLOT: u32 = 7;
pub const R_AARCH64_JUMP_SLOT: u32 = 1026;
pub const R_RISCV_JUMP_SLOT: u32 = 5;

const SYM_SIZE: u64 = 24;
const RELA_SIZE: u64 = 24;
const DYN_SIZE: u64 = 16;
const RESERVED_GOT_SLOTS: u64 = 3;

/// One dynamic-symbol record.
#[derive(Debug, Clone)]
struct Sym {
    name_off: u32,
    info: u8,
    shndx: u16,
    value: u64,
    size: u64,
}

/// One Elf64_Rela record.
#[derive(Debug, Clone, Copy)]
struct Rela {
    offset: u64,
    sym: u32,
    rtype: u32,
    addend: i64,
}

/// The complete dynamic-linking metadata for one executable.
#[derive(Debug)]
pub struct DynamicLinking {
    isa: Isa,
    pub libs: Vec<String>,
    pub funcs: Vec<String>,
    strtab: Vec<u8>,
    lib_name_offs: Vec<u32>,
    syms: Vec<Sym>,
    relas: Vec<Rela>,
    got: Vec<u64>,
    dynamic: Vec<(u64, u64)>,
    plt_bytes: Vec<u8>,
    func_index: FxHashMap<String, usize>,
    finalized: bool,
    plt_vaddr: u64,
}

impl DynamicLinking {
    /// Steps 1–4 of metadata construction: enumerate libraries and
    /// functions, build the string and symbol tables, reserve PLT/GOT
    /// space. Addresses stay zero until [`Self::finalize`].
    pub fn build(isa: Isa, libs: &[String], funcs: &[String]) -> Self {
        // Offset 0 is the empty string.
        let mut strtab = vec![0u8];
        let mut add_str = |s: &str, strtab: &mut Vec<u8>| -> u32 {
            let off = strtab.len() as u32;
            strtab.extend_from_slice(s.as_bytes());
            strtab.push(0);
            off
        };

        let lib_name_offs: Vec<u32> = libs.iter().map(|l| add_str(l, &mut strtab)).collect();

        // Index 0 is the reserved null symbol.
        let mut syms = vec![Sym {
            name_off: 0,
            info: 0,
            shndx: 0,
            value: 0,
            size: 0,
        }];
        let mut func_index = FxHashMap::default();
        for (i, f) in funcs.iter().enumerate() {
            let name_off = add_str(f, &mut strtab);
            syms.push(Sym {
                name_off,
                info: (STB_GLOBAL << 4) | STT_FUNC,
                shndx: SHN_UNDEF,
                value: 0,
                size: 0,
            });
            func_index.insert(f.clone(), i);
        }

        Self {
            isa,
            libs: libs.to_vec(),
            funcs: funcs.to_vec(),
            strtab,
            lib_name_offs,
            syms,
            relas: Vec::new(),
            got: vec![0; (RESERVED_GOT_SLOTS as usize) + funcs.len()],
            dynamic: Vec::new(),
            plt_bytes: Vec::new(),
            func_index,
            finalized: false,
            plt_vaddr: 0,
        }
    }

    // ── Sizes, valid before finalize ─────────────────────────────────

    pub fn strtab_size(&self) -> u64 {
        self.strtab.len() as u64
    }

    pub fn symtab_size(&self) -> u64 {
        self.syms.len() as u64 * SYM_SIZE
    }

    /// Classic hash table: nbucket=1, nchain=nsyms.
    pub fn hash_size(&self) -> u64 {
        (2 + 1 + self.syms.len() as u64) * 4
    }

    pub fn rela_size(&self) -> u64 {
        self.funcs.len() as u64 * RELA_SIZE
    }

    pub fn got_size(&self) -> u64 {
        self.got.len() as u64 * 8
    }

    pub fn plt_size(&self) -> u64 {
        plt::plt_total(self.isa, self.funcs.len())
    }

    pub fn dynamic_size(&self) -> u64 {
        // NEEDED per library + 9 table entries + FLAGS_1 + NULL.
        (self.libs.len() as u64 + 11) * DYN_SIZE
    }

    // ── Finalize with layout-assigned addresses ──────────────────────

    /// Bake final addresses into the GOT, relocations, PLT bytes, and
    /// dynamic section. Steps 5–8 of construction.
    #[allow(clippy::too_many_arguments)]
    pub fn finalize(
        &mut self,
        dynamic_vaddr: u64,
        got_vaddr: u64,
        plt_vaddr: u64,
        strtab_vaddr: u64,
        symtab_vaddr: u64,
        hash_vaddr: u64,
        rela_vaddr: u64,
    ) {
        self.plt_vaddr = plt_vaddr;

        // GOT: dynamic-section address, then two loader-filled slots,
        // then one slot per function pointing back into its stub.
        self.got[0] = dynamic_vaddr;
        self.got[1] = 0;
        self.got[2] = 0;
        for n in 0..self.funcs.len() {
            self.got[RESERVED_GOT_SLOTS as usize + n] =
                plt::got_slot_initial(self.isa, plt_vaddr, n);
        }

        // One JUMP_SLOT relocation per function, offset = its GOT slot.
        let rtype = match self.isa {
            Isa::X86_64 => R_X86_64_JUMP_SLOT,
            Isa::Aarch64 => R_AARCH64_JUMP_SLOT,
            Isa::Riscv64 => R_RISCV_JUMP_SLOT,
        };
        self.relas = (0..self.funcs.len())
            .map(|n| Rela {
                offset: got_vaddr + 8 * (RESERVED_GOT_SLOTS + n as u64),
                sym: n as u32 + 1,
                rtype,
                addend: 0,
            })
            .collect();

        self.plt_bytes = plt::emit_plt(self.isa, plt_vaddr, got_vaddr, self.funcs.len());

        self.dynamic.clear();
        for off in &self.lib_name_offs {
            self.dynamic.push((DT_NEEDED, u64::from(*off)));
        }
        self.dynamic.push((DT_STRTAB, strtab_vaddr));
        self.dynamic.push((DT_STRSZ, self.strtab_size()));
        self.dynamic.push((DT_SYMTAB, symtab_vaddr));
        self.dynamic.push((DT_SYMENT, SYM_SIZE));
        self.dynamic.push((DT_HASH, hash_vaddr));
        self.dynamic.push((DT_PLTGOT, got_vaddr));
        self.dynamic.push((DT_PLTRELSZ, self.rela_size()));
        self.dynamic.push((DT_PLTREL, 7)); // DT_RELA
        self.dynamic.push((DT_JMPREL, rela_vaddr));
        self.dynamic.push((DT_FLAGS_1, DF_1_PIE));
        self.dynamic.push((DT_NULL, 0));
        self.finalized = true;
    }

    /// Rewrite the `DT_PLTGOT` entry after a late GOT move.
    pub fn update_pltgot(&mut self, got_vaddr: u64) {
        for entry in &mut self.dynamic {
            if entry.0 == DT_PLTGOT {
                entry.1 = got_vaddr;
            }
        }
    }

    /// Rewrite every relocation offset equal to `old` with `new`.
    pub fn update_relocation_target(&mut self, old: u64, new: u64) {
        for rela in &mut self.relas {
            if rela.offset == old {
                rela.offset = new;
            }
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// The PLT entry address for an imported function, if it has one.
    pub fn plt_slot_vaddr(&self, name: &str) -> Option<u64> {
        let idx = *self.func_index.get(name)?;
        Some(plt::plt_entry_vaddr(self.isa, self.plt_vaddr, idx))
    }

    /// Symbol index of an imported function (1-based; 0 is null).
    pub fn sym_index(&self, name: &str) -> Option<u32> {
        self.func_index.get(name).map(|i| *i as u32 + 1)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    // ── Serialization ────────────────────────────────────────────────

    pub fn strtab_bytes(&self) -> &[u8] {
        &self.strtab
    }

    pub fn symtab_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.syms.len() * SYM_SIZE as usize);
        for sym in &self.syms {
            out.extend_from_slice(&sym.name_off.to_le_bytes());
            out.push(sym.info);
            out.push(0); // st_other
            out.extend_from_slice(&sym.shndx.to_le_bytes());
            out.extend_from_slice(&sym.value.to_le_bytes());
            out.extend_from_slice(&sym.size.to_le_bytes());
        }
        out
    }

    /// The classic `nbucket / nchain / buckets[] / chain[]` layout with
    /// a single bucket; loaders accept it and it is trivially correct.
    pub fn hash_bytes(&self) -> Vec<u8> {
        let nsyms = self.syms.len() as u32;
        let mut out = Vec::with_capacity(self.hash_size() as usize);
        out.extend_from_slice(&1u32.to_le_bytes()); // nbucket
        out.extend_from_slice(&nsyms.to_le_bytes()); // nchain
        // The single bucket heads the chain at symbol 1 (or 0 if none).
        let head = if nsyms > 1 { 1u32 } else { 0 };
        out.extend_from_slice(&head.to_le_bytes());
        // chain[i] = i + 1, terminated with 0 (STN_UNDEF).
        for i in 0..nsyms {
            let next = if i + 1 < nsyms { i + 1 } else { 0 };
            // chain[0] is never followed; keep it 0.
            let v = if i == 0 { 0 } else { next };
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    pub fn rela_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.relas.len() * RELA_SIZE as usize);
        for rela in &self.relas {
            out.extend_from_slice(&rela.offset.to_le_bytes());
            let info = (u64::from(rela.sym) << 32) | u64::from(rela.rtype);
            out.extend_from_slice(&info.to_le_bytes());
            out.extend_from_slice(&rela.addend.to_le_bytes());
        }
        out
    }

    pub fn got_bytes(&self) -> Vec<u8> {
        self.got.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    pub fn plt_bytes(&self) -> &[u8] {
        &self.plt_bytes
    }

    pub fn dynamic_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.dynamic.len() * DYN_SIZE as usize);
        for (tag, value) in &self.dynamic {
            out.extend_from_slice(&tag.to_le_bytes());
            out.extend_from_slice(&value.to_le_bytes());
        }
        out
    }
}

/// The classic SysV ELF hash function.
pub fn elf_hash(name: &str) -> u32 {
    let mut h: u32 = 0;
    for &b in name.as_bytes() {
        h = (h << 4).wrapping_add(u32::from(b));
        let g = h & 0xf000_0000;
        if g != 0 {
            h ^= g >> 24;
        }
        h &= !g;
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DynamicLinking {
        DynamicLinking::build(
            Isa::X86_64,
            &["libc.so.6".to_string()],
            &["sin".to_string()],
        )
    }

    #[test]
    fn test_strtab_starts_with_nul() {
        let dl = sample();
        assert_eq!(dl.strtab_bytes()[0], 0);
        // "libc.so.6\0" then "sin\0".
        assert_eq!(&dl.strtab_bytes()[1..11], b"libc.so.6\0");
        assert_eq!(&dl.strtab_bytes()[11..15], b"sin\0");
    }

    #[test]
    fn test_null_symbol_reserved() {
        let dl = sample();
        let bytes = dl.symtab_bytes();
        assert_eq!(bytes.len(), 48);
        assert!(bytes[..24].iter().all(|&b| b == 0));
        // Symbol 1: global function, undefined section.
        assert_eq!(bytes[28], (STB_GLOBAL << 4) | STT_FUNC);
        assert_eq!(dl.sym_index("sin"), Some(1));
    }

    #[test]
    fn test_sizes_before_finalize() {
        let dl = sample();
        assert_eq!(dl.symtab_size(), 48);
        assert_eq!(dl.hash_size(), (2 + 1 + 2) * 4);
        assert_eq!(dl.rela_size(), 24);
        assert_eq!(dl.got_size(), 32); // 3 reserved + 1 function
        assert_eq!(dl.plt_size(), 32); // header + one entry
    }

    #[test]
    fn test_finalize_builds_got_and_relocs() {
        let mut dl = sample();
        dl.finalize(0x5000, 0x6000, 0x1000, 0x200, 0x240, 0x280, 0x300);
        let got = dl.got_bytes();
        // Slot 0: dynamic section address. Slots 1-2: loader-filled.
        assert_eq!(u64::from_le_bytes(got[0..8].try_into().unwrap()), 0x5000);
        assert_eq!(u64::from_le_bytes(got[8..16].try_into().unwrap()), 0);
        // Function slot points into its PLT stub's push instruction.
        assert_eq!(
            u64::from_le_bytes(got[24..32].try_into().unwrap()),
            0x1000 + 16 + 6
        );
        let rela = dl.rela_bytes();
        assert_eq!(
            u64::from_le_bytes(rela[0..8].try_into().unwrap()),
            0x6000 + 24
        );
        let info = u64::from_le_bytes(rela[8..16].try_into().unwrap());
        assert_eq!(info >> 32, 1);
        assert_eq!(info as u32, R_X86_64_JUMP_SLOT);
    }

    #[test]
    fn test_dynamic_entries() {
        let mut dl = sample();
        dl.finalize(0x5000, 0x6000, 0x1000, 0x200, 0x240, 0x280, 0x300);
        let dynamic = dl.dynamic_bytes();
        let entries: Vec<(u64, u64)> = dynamic
            .chunks_exact(16)
            .map(|c| {
                (
                    u64::from_le_bytes(c[0..8].try_into().unwrap()),
                    u64::from_le_bytes(c[8..16].try_into().unwrap()),
                )
            })
            .collect();
        assert_eq!(entries[0], (DT_NEEDED, 1)); // strtab offset of the lib
        assert!(entries.contains(&(DT_PLTGOT, 0x6000)));
        assert!(entries.contains(&(DT_PLTREL, 7)));
        assert_eq!(entries.last(), Some(&(DT_NULL, 0)));
        assert_eq!(dynamic.len() as u64, dl.dynamic_size());
    }

    #[test]
    fn test_update_pltgot_and_reloc_target() {
        let mut dl = sample();
        dl.finalize(0x5000, 0x6000, 0x1000, 0x200, 0x240, 0x280, 0x300);
        dl.update_pltgot(0x7000);
        let dynamic = dl.dynamic_bytes();
        let has = dynamic.chunks_exact(16).any(|c| {
            u64::from_le_bytes(c[0..8].try_into().unwrap()) == DT_PLTGOT
                && u64::from_le_bytes(c[8..16].try_into().unwrap()) == 0x7000
        });
        assert!(has);

        dl.update_relocation_target(0x6018, 0x7018);
        let rela = dl.rela_bytes();
        assert_eq!(u64::from_le_bytes(rela[0..8].try_into().unwrap()), 0x7018);
    }

    #[test]
    fn test_hash_layout() {
        let dl = sample();
        let bytes = dl.hash_bytes();
        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(words[0], 1); // nbucket
        assert_eq!(words[1], 2); // nchain
        assert_eq!(words[2], 1); // bucket -> first real symbol
        assert_eq!(words[3], 0); // chain[0]
        assert_eq!(words[4], 0); // chain[1] terminates
    }

    #[test]
    fn test_elf_hash_known_values() {
        // Classic published values for the SysV hash.
        assert_eq!(elf_hash(""), 0);
        assert_eq!(elf_hash("printf"), 0x077905a6);
    }

    #[test]
    fn test_plt_slot_lookup() {
        let mut dl = sample();
        dl.finalize(0x5000, 0x6000, 0x1000, 0x200, 0x240, 0x280, 0x300);
        assert_eq!(dl.plt_slot_vaddr("sin"), Some(0x1000 + 16));
        assert_eq!(dl.plt_slot_vaddr("cos"), None);
    }
}
