//! Mach-O container writer (macOS ARM64).
//!
//! Emits a 64-bit executable image: `__PAGEZERO`, `__TEXT` (header plus
//! code), `__DATA` (constants and writable data), `__LINKEDIT`, the
//! symtab/dysymtab commands, one `LC_LOAD_DYLIB` per imported library,
//! and an `LC_UNIXTHREAD` whose saved pc is the entry point — the
//! generated runtime is syscall-based, so no dyld entry shim is needed.
//!
//! Load-command sizing is exact: [`header_size`] enumerates the library
//! list before any file offset is assigned, so text addresses never
//! depend on an estimate. Apple Silicon additionally requires an ad-hoc
//! code signature; the build pipeline runs `ldid -S` on the written
//! file.

use crate::{ContainerInput, ContainerWriter, ObjectError, ObjectResult};
use veld_asm::Format;

pub const MH_MAGIC_64: u32 = 0xfeed_facf;
pub const CPU_TYPE_ARM64: u32 = 0x0100_000c;
pub const CPU_SUBTYPE_ARM64_ALL: u32 = 0;
pub const MH_EXECUTE: u32 = 2;
pub const MH_NOUNDEFS: u32 = 0x1;
pub const MH_PIE: u32 = 0x0020_0000;

pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_SYMTAB: u32 = 0x2;
pub const LC_UNIXTHREAD: u32 = 0x5;
pub const LC_DYSYMTAB: u32 = 0xb;
pub const LC_LOAD_DYLIB: u32 = 0xc;

pub const VM_PROT_READ: u32 = 1;
pub const VM_PROT_WRITE: u32 = 2;
pub const VM_PROT_EXECUTE: u32 = 4;

pub const ARM_THREAD_STATE64: u32 = 6;
/// 29 GPRs + fp + lr + sp + pc + cpsr(+pad), as 32-bit words.
pub const ARM_THREAD_STATE64_COUNT: u32 = 68;

pub const MACH_HEADER_SIZE: u64 = 32;
const SEG_CMD_SIZE: u64 = 72;
const SECT_SIZE: u64 = 80;
const SYMTAB_CMD_SIZE: u64 = 24;
const DYSYMTAB_CMD_SIZE: u64 = 80;
const UNIXTHREAD_CMD_SIZE: u64 = 16 + 272;

/// The fixed image base below which `__PAGEZERO` spans.
pub const MACHO_BASE: u64 = 0x1_0000_0000;

fn dylib_cmd_size(name: &str) -> u64 {
    // Fixed part + NUL-terminated path, padded to 8.
    let raw = 24 + name.len() as u64 + 1;
    raw.div_ceil(8) * 8
}

/// Exact `mach_header + load commands` size for a given library list.
/// The layout engine uses this as the "ehdr" section size so the text
/// offset is known before emission.
pub fn header_size(libs: &[String]) -> u64 {
    let segments = 4 * SEG_CMD_SIZE + 3 * SECT_SIZE; // pagezero, text(1), data(2), linkedit
    let fixed = segments + SYMTAB_CMD_SIZE + DYSYMTAB_CMD_SIZE + UNIXTHREAD_CMD_SIZE;
    MACH_HEADER_SIZE + fixed + libs.iter().map(|l| dylib_cmd_size(l)).sum::<u64>()
}

fn ncmds(libs: &[String]) -> u32 {
    7 + libs.len() as u32
}

struct Buf(Vec<u8>);

impl Buf {
    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn name16(&mut self, name: &str) {
        let mut fixed = [0u8; 16];
        fixed[..name.len()].copy_from_slice(name.as_bytes());
        self.0.extend_from_slice(&fixed);
    }

    fn section(&mut self, name: &str, seg: &str, vaddr: u64, size: u64, off: u32, align: u32, flags: u32) {
        self.name16(name);
        self.name16(seg);
        self.u64(vaddr);
        self.u64(size);
        self.u32(off);
        self.u32(align);
        self.u32(0); // reloff
        self.u32(0); // nreloc
        self.u32(flags);
        self.u32(0);
        self.u32(0);
        self.u32(0);
    }
}

/// The Mach-O container writer.
pub struct MachOWriter {
    /// Imported library install names, one `LC_LOAD_DYLIB` each.
    pub libs: Vec<String>,
}

impl ContainerWriter for MachOWriter {
    fn write(&self, input: &ContainerInput<'_>) -> ObjectResult<Vec<u8>> {
        if input.target.format() != Format::MachO {
            return Err(ObjectError::WrongTarget(input.target));
        }
        let layout = input.layout;
        let page = input.target.page_size();

        let ehdr = layout.get("ehdr")?;
        let text = layout.get("text")?;
        let rodata = layout.get("rodata")?;
        let data = layout.get("data")?;

        // Slide between virtual addresses and file offsets.
        let base = ehdr.vaddr - ehdr.file_offset;
        let text_end = text.file_offset + input.text.len() as u64;
        let data_end = data.file_offset + (input.data.len() as u64).max(data.size);
        let linkedit_off = crate::layout::align_up(data_end, page);

        let mut b = Buf(Vec::with_capacity(linkedit_off as usize));

        // mach_header_64
        b.u32(MH_MAGIC_64);
        b.u32(CPU_TYPE_ARM64);
        b.u32(CPU_SUBTYPE_ARM64_ALL);
        b.u32(MH_EXECUTE);
        b.u32(ncmds(&self.libs));
        b.u32((header_size(&self.libs) - MACH_HEADER_SIZE) as u32);
        let flags = if self.libs.is_empty() {
            MH_NOUNDEFS | MH_PIE
        } else {
            MH_PIE
        };
        b.u32(flags);
        b.u32(0); // reserved

        // __PAGEZERO
        b.u32(LC_SEGMENT_64);
        b.u32(SEG_CMD_SIZE as u32);
        b.name16("__PAGEZERO");
        b.u64(0);
        b.u64(MACHO_BASE);
        b.u64(0);
        b.u64(0);
        b.u32(0);
        b.u32(0);
        b.u32(0);
        b.u32(0);

        // __TEXT: file offset 0 through the end of code.
        let text_seg_size = crate::layout::align_up(text_end, page);
        b.u32(LC_SEGMENT_64);
        b.u32((SEG_CMD_SIZE + SECT_SIZE) as u32);
        b.name16("__TEXT");
        b.u64(ehdr.vaddr);
        b.u64(text_seg_size);
        b.u64(0);
        b.u64(text_seg_size);
        b.u32(VM_PROT_READ | VM_PROT_EXECUTE);
        b.u32(VM_PROT_READ | VM_PROT_EXECUTE);
        b.u32(1); // nsects
        b.u32(0);
        // S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS
        b.section(
            "__text",
            "__TEXT",
            text.vaddr,
            input.text.len() as u64,
            text.file_offset as u32,
            4,
            0x8000_0400,
        );

        // __DATA: rodata then data.
        let data_seg_off = rodata.file_offset;
        let data_seg_size = crate::layout::align_up(data_end - data_seg_off, page);
        b.u32(LC_SEGMENT_64);
        b.u32((SEG_CMD_SIZE + 2 * SECT_SIZE) as u32);
        b.name16("__DATA");
        b.u64(rodata.vaddr);
        b.u64(data_seg_size);
        b.u64(data_seg_off);
        b.u64(data_end - data_seg_off);
        b.u32(VM_PROT_READ | VM_PROT_WRITE);
        b.u32(VM_PROT_READ | VM_PROT_WRITE);
        b.u32(2);
        b.u32(0);
        b.section(
            "__const",
            "__DATA",
            rodata.vaddr,
            (input.rodata.len() as u64).max(rodata.size),
            rodata.file_offset as u32,
            3,
            0,
        );
        b.section(
            "__data",
            "__DATA",
            data.vaddr,
            (input.data.len() as u64).max(data.size),
            data.file_offset as u32,
            3,
            0,
        );

        // __LINKEDIT: present and empty; the signer appends here.
        b.u32(LC_SEGMENT_64);
        b.u32(SEG_CMD_SIZE as u32);
        b.name16("__LINKEDIT");
        b.u64(base + linkedit_off);
        b.u64(page);
        b.u64(linkedit_off);
        b.u64(0);
        b.u32(VM_PROT_READ);
        b.u32(VM_PROT_READ);
        b.u32(0);
        b.u32(0);

        // LC_SYMTAB, empty.
        b.u32(LC_SYMTAB);
        b.u32(SYMTAB_CMD_SIZE as u32);
        b.u32(linkedit_off as u32);
        b.u32(0);
        b.u32(linkedit_off as u32);
        b.u32(0);

        // LC_DYSYMTAB, all counts zero.
        b.u32(LC_DYSYMTAB);
        b.u32(DYSYMTAB_CMD_SIZE as u32);
        for _ in 0..18 {
            b.u32(0);
        }

        // LC_LOAD_DYLIB per imported library.
        for lib in &self.libs {
            let cmdsize = dylib_cmd_size(lib);
            b.u32(LC_LOAD_DYLIB);
            b.u32(cmdsize as u32);
            b.u32(24); // name offset within the command
            b.u32(0); // timestamp
            b.u32(0x0001_0000); // current version 1.0.0
            b.u32(0x0001_0000); // compatibility version
            b.0.extend_from_slice(lib.as_bytes());
            b.0.push(0);
            while b.0.len() % 8 != 0 {
                b.0.push(0);
            }
        }

        // LC_UNIXTHREAD: pc = entry, everything else zero.
        b.u32(LC_UNIXTHREAD);
        b.u32(UNIXTHREAD_CMD_SIZE as u32);
        b.u32(ARM_THREAD_STATE64);
        b.u32(ARM_THREAD_STATE64_COUNT);
        for _ in 0..32 {
            b.u64(0); // x0..x28, fp, lr, sp
        }
        b.u64(input.entry_vaddr); // pc
        b.u64(0); // cpsr + pad

        debug_assert_eq!(b.0.len() as u64, header_size(&self.libs));

        // File body: header, code, data sections, empty linkedit page.
        let mut file = b.0;
        if (file.len() as u64) < text.file_offset {
            file.resize(text.file_offset as usize, 0);
        }
        file.resize(text.file_offset as usize, 0);
        file.extend_from_slice(input.text);
        let grow = |file: &mut Vec<u8>, to: u64| {
            if (file.len() as u64) < to {
                file.resize(to as usize, 0);
            }
        };
        grow(&mut file, rodata.file_offset);
        file.extend_from_slice(input.rodata);
        grow(&mut file, data.file_offset);
        file.extend_from_slice(input.data);
        grow(&mut file, linkedit_off);
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{LayoutEngine, SectionClass, SectionPlan};
    use veld_asm::Target;

    fn fixture(libs: Vec<String>) -> (crate::Layout, MachOWriter) {
        let plans = vec![
            SectionPlan::new("ehdr", header_size(&libs), 8, SectionClass::Header),
            SectionPlan::new("text", 64, 16, SectionClass::Header).with_pad_after(0x4000),
            SectionPlan::new("rodata", 16, 8, SectionClass::ReadWrite),
            SectionPlan::new("data", 16, 8, SectionClass::ReadWrite),
        ];
        let layout = LayoutEngine::new(0x4000, MACHO_BASE).place(&plans).unwrap();
        (layout, MachOWriter { libs })
    }

    fn write(libs: Vec<String>) -> Vec<u8> {
        let (layout, writer) = fixture(libs);
        let entry = layout.get("text").unwrap().vaddr;
        let input = ContainerInput {
            target: Target::parse("aarch64-darwin").unwrap(),
            layout: &layout,
            text: &[0u8; 64],
            rodata: &[0u8; 16],
            data: &[0u8; 16],
            entry_vaddr: entry,
            dynamic: None,
        };
        writer.write(&input).unwrap()
    }

    #[test]
    fn test_magic_and_cpu() {
        let file = write(vec![]);
        assert_eq!(
            u32::from_le_bytes(file[0..4].try_into().unwrap()),
            MH_MAGIC_64
        );
        assert_eq!(
            u32::from_le_bytes(file[4..8].try_into().unwrap()),
            CPU_TYPE_ARM64
        );
        assert_eq!(u32::from_le_bytes(file[12..16].try_into().unwrap()), MH_EXECUTE);
    }

    #[test]
    fn test_sizeofcmds_is_exact() {
        let file = write(vec![]);
        let sizeofcmds = u32::from_le_bytes(file[20..24].try_into().unwrap());
        assert_eq!(
            u64::from(sizeofcmds),
            header_size(&[]) - MACH_HEADER_SIZE
        );
    }

    #[test]
    fn test_dylib_command_grows_header_exactly() {
        let libs = vec!["/usr/lib/libSystem.B.dylib".to_string()];
        let delta = header_size(&libs) - header_size(&[]);
        assert_eq!(delta, dylib_cmd_size(&libs[0]));
        // 24 fixed + 27 bytes of path rounded to 8.
        assert_eq!(delta, 56);
        let file = write(libs.clone());
        let ncmds = u32::from_le_bytes(file[16..20].try_into().unwrap());
        assert_eq!(ncmds, 8);
        // The install name appears in the image.
        let needle = b"/usr/lib/libSystem.B.dylib";
        assert!(file.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn test_first_command_is_pagezero() {
        let file = write(vec![]);
        assert_eq!(
            u32::from_le_bytes(file[32..36].try_into().unwrap()),
            LC_SEGMENT_64
        );
        assert_eq!(&file[40..50], b"__PAGEZERO");
    }

    #[test]
    fn test_unixthread_pc_is_entry() {
        let (layout, writer) = fixture(vec![]);
        let entry = layout.get("text").unwrap().vaddr;
        let input = ContainerInput {
            target: Target::parse("aarch64-darwin").unwrap(),
            layout: &layout,
            text: &[0u8; 64],
            rodata: &[0u8; 16],
            data: &[0u8; 16],
            entry_vaddr: entry,
            dynamic: None,
        };
        let file = writer.write(&input).unwrap();
        // The pc slot is the 33rd u64 of the thread state, counted from
        // the end of the LC_UNIXTHREAD fixed header.
        let cmds_end = header_size(&[]) as usize;
        let pc_off = cmds_end - 16; // pc then cpsr/pad close the command
        let pc = u64::from_le_bytes(file[pc_off..pc_off + 8].try_into().unwrap());
        assert_eq!(pc, entry);
    }
}
