//! Compiler introspection (`--debug`).
//!
//! Serializable mirrors of the interesting intermediate state: the
//! layout map, the data symbols with their final addresses, and the
//! allocator's verdict per variable. Dumped as JSON to stderr.

use crate::driver::Collected;
use crate::regalloc::Home;
use crate::symbols::DataSymbols;
use serde::Serialize;
use veld_asm::{Isa, Target};
use veld_object::Layout;

#[derive(Serialize)]
pub struct Dump {
    pub target: String,
    pub sections: Vec<SectionDump>,
    pub symbols: Vec<SymbolDump>,
    pub functions: Vec<FunctionDump>,
}

#[derive(Serialize)]
pub struct SectionDump {
    pub name: &'static str,
    pub file_offset: u64,
    pub vaddr: u64,
    pub size: u64,
}

#[derive(Serialize)]
pub struct SymbolDump {
    pub name: String,
    pub writable: bool,
    pub size: usize,
    pub addr: Option<u64>,
}

#[derive(Serialize)]
pub struct FunctionDump {
    pub name: String,
    pub callee_saved: Vec<String>,
    pub spill_slots: u32,
    pub homes: Vec<VarDump>,
}

#[derive(Serialize)]
pub struct VarDump {
    pub var: String,
    pub home: String,
}

/// Assemble the dump after layout and patching.
pub fn dump(
    target: Target,
    layout: &Layout,
    symbols: &DataSymbols,
    collected: &Collected,
) -> Dump {
    let isa = target.isa;
    let sections = layout
        .iter()
        .map(|(name, p)| SectionDump {
            name,
            file_offset: p.file_offset,
            vaddr: p.vaddr,
            size: p.size,
        })
        .collect();
    let symbols = symbols
        .iter()
        .map(|s| SymbolDump {
            name: s.name.clone(),
            writable: s.writable,
            size: s.bytes.len(),
            addr: s.addr,
        })
        .collect();
    let mut functions: Vec<FunctionDump> = Vec::new();
    let mut names: Vec<&String> = collected.allocs.keys().collect();
    names.sort();
    for name in names {
        let alloc = &collected.allocs[name];
        let mut homes: Vec<VarDump> = alloc
            .iter()
            .map(|(var, home)| VarDump {
                var: var.clone(),
                home: match home {
                    Home::Reg(r) => format!("reg {}", reg_name(isa, *r)),
                    Home::Slot(s) => format!("slot {s}"),
                },
            })
            .collect();
        homes.sort_by(|a, b| a.var.cmp(&b.var));
        functions.push(FunctionDump {
            name: if name.is_empty() {
                "<top-level>".to_string()
            } else {
                name.clone()
            },
            callee_saved: alloc
                .used_callee_saved()
                .iter()
                .map(|r| reg_name(isa, *r).to_string())
                .collect(),
            spill_slots: alloc.spill_slots(),
            homes,
        });
    }
    Dump {
        target: target.triple(),
        sections,
        symbols,
        functions,
    }
}

fn reg_name(isa: Isa, r: u8) -> &'static str {
    veld_asm::reg::gpr_name(isa, r)
}
