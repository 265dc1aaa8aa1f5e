//! PE32+ container writer (Windows x86-64).
//!
//! DOS header, COFF header, PE32+ optional header, four sections
//! (`.text`, `.rdata`, `.data`, `.idata`), and an import directory —
//! Windows' analogue of the PLT/GOT dance: the loader patches the IAT
//! slots and generated code calls through them.
//!
//! File alignment is set equal to the 4 KiB section alignment, so file
//! offsets and RVAs coincide and the shared layout engine's congruence
//! model holds unchanged.

use crate::{ContainerInput, ContainerWriter, ObjectError, ObjectResult};
use rustc_hash::FxHashMap;
use veld_asm::Format;

pub const DOS_MAGIC: [u8; 2] = *b"MZ";
pub const PE_SIGNATURE: [u8; 4] = *b"PE\0\0";
pub const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
pub const PE32PLUS_MAGIC: u16 = 0x20b;
pub const IMAGE_SUBSYSTEM_WINDOWS_CUI: u16 = 3;
pub const IMAGE_FILE_EXECUTABLE_IMAGE: u16 = 0x0002;
pub const IMAGE_FILE_LARGE_ADDRESS_AWARE: u16 = 0x0020;

pub const SCN_TEXT: u32 = 0x6000_0020; // code | execute | read
pub const SCN_RDATA: u32 = 0x4000_0040; // initialized | read
pub const SCN_DATA: u32 = 0xc000_0040; // initialized | read | write

/// Default image base for 64-bit executables.
pub const PE_IMAGE_BASE: u64 = 0x1_4000_0000;
pub const SECTION_ALIGN: u32 = 0x1000;
/// Equal to the section alignment so RVAs mirror file offsets.
pub const FILE_ALIGN: u32 = 0x1000;

const OPTIONAL_HEADER_SIZE: u16 = 240;
const SECTION_HEADER_SIZE: u64 = 40;
const DESCRIPTOR_SIZE: u64 = 20;

/// `DOS + PE + COFF + optional + section headers` for `nsects` sections.
pub fn headers_size(nsects: u64) -> u64 {
    64 + 4 + 20 + u64::from(OPTIONAL_HEADER_SIZE) + SECTION_HEADER_SIZE * nsects
}

/// The import directory: DLLs and the functions pulled from each.
///
/// Built in two steps like the ELF metadata: `build` computes every
/// relative offset (so `.idata`'s size is known to the layout engine),
/// `finalize` turns them into RVAs once the section is placed.
#[derive(Debug, Default)]
pub struct PeImports {
    pub dlls: Vec<(String, Vec<String>)>,
    /// Relative offsets within .idata, keyed by (dll, function).
    iat_rel: FxHashMap<(String, String), u32>,
    ilt_rel: Vec<u32>,
    iat_start_rel: Vec<u32>,
    name_rel: Vec<u32>,
    hint_rel: FxHashMap<(String, String), u32>,
    total: u32,
    idata_rva: u32,
    finalized: bool,
}

impl PeImports {
    pub fn build(dlls: Vec<(String, Vec<String>)>) -> Self {
        let mut iat_rel = FxHashMap::default();
        let mut ilt_rel = Vec::new();
        let mut iat_start_rel = Vec::new();
        let mut name_rel = Vec::new();
        let mut hint_rel = FxHashMap::default();

        // Descriptor table: one per DLL plus the null terminator.
        let mut cursor = (dlls.len() as u32 + 1) * DESCRIPTOR_SIZE as u32;
        // Import lookup tables, then address tables, null-terminated.
        for (_, funcs) in &dlls {
            ilt_rel.push(cursor);
            cursor += (funcs.len() as u32 + 1) * 8;
        }
        for (dll, funcs) in &dlls {
            let start = cursor;
            iat_start_rel.push(start);
            for (i, f) in funcs.iter().enumerate() {
                iat_rel.insert((dll.clone(), f.clone()), start + i as u32 * 8);
            }
            cursor += (funcs.len() as u32 + 1) * 8;
        }
        // Hint/name entries, 2-aligned.
        for (dll, funcs) in &dlls {
            for f in funcs {
                hint_rel.insert((dll.clone(), f.clone()), cursor);
                cursor += 2 + f.len() as u32 + 1;
                cursor += cursor % 2;
            }
        }
        // DLL name strings.
        for (dll, _) in &dlls {
            name_rel.push(cursor);
            cursor += dll.len() as u32 + 1;
        }

        PeImports {
            dlls,
            iat_rel,
            ilt_rel,
            iat_start_rel,
            name_rel,
            hint_rel,
            total: cursor,
            idata_rva: 0,
            finalized: false,
        }
    }

    pub fn size(&self) -> u64 {
        u64::from(self.total)
    }

    pub fn is_empty(&self) -> bool {
        self.dlls.is_empty()
    }

    /// Assign the section's RVA; offsets become resolvable afterwards.
    pub fn finalize(&mut self, idata_rva: u32) {
        self.idata_rva = idata_rva;
        self.finalized = true;
    }

    /// RVA of the IAT slot the code calls through.
    pub fn iat_rva(&self, dll: &str, func: &str) -> Option<u32> {
        debug_assert!(self.finalized);
        self.iat_rel
            .get(&(dll.to_string(), func.to_string()))
            .map(|rel| self.idata_rva + rel)
    }

    /// `(rva, size)` of the import directory table.
    pub fn directory(&self) -> (u32, u32) {
        (
            self.idata_rva,
            (self.dlls.len() as u32 + 1) * DESCRIPTOR_SIZE as u32,
        )
    }

    /// Serialize the whole `.idata` image.
    pub fn bytes(&self) -> Vec<u8> {
        debug_assert!(self.finalized);
        let mut out = vec![0u8; self.total as usize];
        let put32 = |out: &mut Vec<u8>, at: u32, v: u32| {
            out[at as usize..at as usize + 4].copy_from_slice(&v.to_le_bytes());
        };
        let put64 = |out: &mut Vec<u8>, at: u32, v: u64| {
            out[at as usize..at as usize + 8].copy_from_slice(&v.to_le_bytes());
        };

        for (i, (dll, funcs)) in self.dlls.iter().enumerate() {
            let desc = i as u32 * DESCRIPTOR_SIZE as u32;
            put32(&mut out, desc, self.idata_rva + self.ilt_rel[i]);
            put32(&mut out, desc + 12, self.idata_rva + self.name_rel[i]);
            put32(&mut out, desc + 16, self.idata_rva + self.iat_start_rel[i]);

            for (j, f) in funcs.iter().enumerate() {
                let hint = self.idata_rva + self.hint_rel[&(dll.clone(), f.clone())];
                put64(&mut out, self.ilt_rel[i] + j as u32 * 8, u64::from(hint));
                put64(
                    &mut out,
                    self.iat_start_rel[i] + j as u32 * 8,
                    u64::from(hint),
                );
                let at = self.hint_rel[&(dll.clone(), f.clone())] as usize;
                out[at] = 0;
                out[at + 1] = 0;
                out[at + 2..at + 2 + f.len()].copy_from_slice(f.as_bytes());
            }
            let at = self.name_rel[i] as usize;
            out[at..at + dll.len()].copy_from_slice(dll.as_bytes());
        }
        out
    }
}

/// The PE container writer.
pub struct PeWriter {
    pub imports: PeImports,
}

impl ContainerWriter for PeWriter {
    fn write(&self, input: &ContainerInput<'_>) -> ObjectResult<Vec<u8>> {
        if input.target.format() != Format::Pe {
            return Err(ObjectError::WrongTarget(input.target));
        }
        let layout = input.layout;

        let text = layout.get("text")?;
        let rodata = layout.get("rodata")?;
        let data = layout.get("data")?;
        let idata = layout.get("idata")?;

        let rva = |off: u64| -> u32 { off as u32 };
        let text_size = (input.text.len() as u64).max(text.size);
        let image_end = idata.file_offset + self.imports.size().max(idata.size);
        let size_of_image = crate::layout::align_up(image_end, u64::from(SECTION_ALIGN));

        let mut out = Vec::with_capacity(size_of_image as usize);

        // DOS header: magic and e_lfanew, no stub program.
        out.extend_from_slice(&DOS_MAGIC);
        out.resize(0x3c, 0);
        out.extend_from_slice(&0x40u32.to_le_bytes());
        out.extend_from_slice(&PE_SIGNATURE);

        // COFF header.
        out.extend_from_slice(&IMAGE_FILE_MACHINE_AMD64.to_le_bytes());
        out.extend_from_slice(&4u16.to_le_bytes()); // sections
        out.extend_from_slice(&0u32.to_le_bytes()); // timestamp
        out.extend_from_slice(&0u32.to_le_bytes()); // symtab
        out.extend_from_slice(&0u32.to_le_bytes()); // nsyms
        out.extend_from_slice(&OPTIONAL_HEADER_SIZE.to_le_bytes());
        out.extend_from_slice(
            &(IMAGE_FILE_EXECUTABLE_IMAGE | IMAGE_FILE_LARGE_ADDRESS_AWARE).to_le_bytes(),
        );

        // Optional header, PE32+.
        out.extend_from_slice(&PE32PLUS_MAGIC.to_le_bytes());
        out.push(14); // linker major
        out.push(0); // linker minor
        out.extend_from_slice(&(text_size as u32).to_le_bytes());
        out.extend_from_slice(&(rodata.size as u32 + data.size as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // uninitialized
        out.extend_from_slice(&((input.entry_vaddr - PE_IMAGE_BASE) as u32).to_le_bytes());
        out.extend_from_slice(&rva(text.file_offset).to_le_bytes());
        out.extend_from_slice(&PE_IMAGE_BASE.to_le_bytes());
        out.extend_from_slice(&SECTION_ALIGN.to_le_bytes());
        out.extend_from_slice(&FILE_ALIGN.to_le_bytes());
        out.extend_from_slice(&6u16.to_le_bytes()); // os major
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // image version
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&6u16.to_le_bytes()); // subsystem major
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // win32 version
        out.extend_from_slice(&(size_of_image as u32).to_le_bytes());
        out.extend_from_slice(&(headers_size(4) as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // checksum
        out.extend_from_slice(&IMAGE_SUBSYSTEM_WINDOWS_CUI.to_le_bytes());
        out.extend_from_slice(&0x0100u16.to_le_bytes()); // NX compatible
        out.extend_from_slice(&0x0010_0000u64.to_le_bytes()); // stack reserve
        out.extend_from_slice(&0x1000u64.to_le_bytes()); // stack commit
        out.extend_from_slice(&0x0010_0000u64.to_le_bytes()); // heap reserve
        out.extend_from_slice(&0x1000u64.to_le_bytes()); // heap commit
        out.extend_from_slice(&0u32.to_le_bytes()); // loader flags
        out.extend_from_slice(&16u32.to_le_bytes()); // rva/size count

        // Data directories: only the import table is populated.
        let (import_rva, import_size) = if self.imports.is_empty() {
            (0, 0)
        } else {
            self.imports.directory()
        };
        for i in 0..16u32 {
            if i == 1 {
                out.extend_from_slice(&import_rva.to_le_bytes());
                out.extend_from_slice(&import_size.to_le_bytes());
            } else if i == 12 && !self.imports.is_empty() {
                // IAT directory: the address-table span inside .idata.
                out.extend_from_slice(&(rva(idata.file_offset)).to_le_bytes());
                out.extend_from_slice(&(self.imports.size() as u32).to_le_bytes());
            } else {
                out.extend_from_slice(&0u64.to_le_bytes());
            }
        }

        // Section headers.
        let mut section = |name: &[u8; 8], placed: crate::Placed, raw: u64, chars: u32, out: &mut Vec<u8>| {
            out.extend_from_slice(name);
            out.extend_from_slice(&(raw as u32).to_le_bytes()); // virtual size
            out.extend_from_slice(&rva(placed.file_offset).to_le_bytes());
            let aligned = crate::layout::align_up(raw, u64::from(FILE_ALIGN));
            out.extend_from_slice(&(aligned as u32).to_le_bytes()); // raw size
            out.extend_from_slice(&rva(placed.file_offset).to_le_bytes()); // raw ptr
            out.extend_from_slice(&[0u8; 12]); // relocs/linenums
            out.extend_from_slice(&chars.to_le_bytes());
        };
        section(b".text\0\0\0", text, text_size, SCN_TEXT, &mut out);
        section(
            b".rdata\0\0",
            rodata,
            rodata.size.max(input.rodata.len() as u64),
            SCN_RDATA,
            &mut out,
        );
        section(
            b".data\0\0\0",
            data,
            data.size.max(input.data.len() as u64),
            SCN_DATA,
            &mut out,
        );
        section(
            b".idata\0\0",
            idata,
            self.imports.size().max(idata.size),
            SCN_DATA,
            &mut out,
        );

        // Section contents at their (file-aligned == RVA) offsets.
        let splice = |out: &mut Vec<u8>, at: u64, bytes: &[u8]| {
            let at = at as usize;
            if out.len() < at + bytes.len() {
                out.resize(at + bytes.len(), 0);
            }
            out[at..at + bytes.len()].copy_from_slice(bytes);
        };
        splice(&mut out, text.file_offset, input.text);
        splice(&mut out, rodata.file_offset, input.rodata);
        splice(&mut out, data.file_offset, input.data);
        splice(&mut out, idata.file_offset, &self.imports.bytes());
        if (out.len() as u64) < size_of_image {
            out.resize(size_of_image as usize, 0);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{LayoutEngine, SectionClass, SectionPlan};
    use veld_asm::Target;

    fn fixture() -> (crate::Layout, PeImports) {
        let mut imports = PeImports::build(vec![(
            "KERNEL32.dll".to_string(),
            vec!["ExitProcess".to_string(), "WriteFile".to_string()],
        )]);
        let plans = vec![
            SectionPlan::new("ehdr", headers_size(4), 8, SectionClass::Header),
            SectionPlan::new("text", 128, 16, SectionClass::Text).with_pad_after(0x1000),
            SectionPlan::new("rodata", 32, 8, SectionClass::ReadOnly),
            SectionPlan::new("data", 16, 8, SectionClass::ReadWrite),
            SectionPlan::new("idata", imports.size(), 8, SectionClass::ReadWrite),
        ];
        let layout = LayoutEngine::new(0x1000, PE_IMAGE_BASE).place(&plans).unwrap();
        imports.finalize(layout.get("idata").unwrap().file_offset as u32);
        (layout, imports)
    }

    fn write() -> Vec<u8> {
        let (layout, imports) = fixture();
        let entry = layout.get("text").unwrap().vaddr;
        let input = ContainerInput {
            target: Target::parse("x86_64-windows").unwrap(),
            layout: &layout,
            text: &[0xc3; 128],
            rodata: &[0; 32],
            data: &[0; 16],
            entry_vaddr: entry,
            dynamic: None,
        };
        PeWriter { imports }.write(&input).unwrap()
    }

    #[test]
    fn test_dos_and_pe_magic() {
        let file = write();
        assert_eq!(&file[0..2], b"MZ");
        let lfanew = u32::from_le_bytes(file[0x3c..0x40].try_into().unwrap()) as usize;
        assert_eq!(&file[lfanew..lfanew + 4], b"PE\0\0");
        assert_eq!(
            u16::from_le_bytes(file[lfanew + 4..lfanew + 6].try_into().unwrap()),
            IMAGE_FILE_MACHINE_AMD64
        );
        // PE32+ magic right after the COFF header.
        assert_eq!(
            u16::from_le_bytes(file[lfanew + 24..lfanew + 26].try_into().unwrap()),
            PE32PLUS_MAGIC
        );
    }

    #[test]
    fn test_import_directory_names_dll_and_functions() {
        let file = write();
        for needle in [&b"KERNEL32.dll"[..], b"ExitProcess", b"WriteFile"] {
            assert!(
                file.windows(needle.len()).any(|w| w == needle),
                "missing {:?}",
                std::str::from_utf8(needle)
            );
        }
    }

    #[test]
    fn test_iat_rvas_are_distinct_slots() {
        let (_, imports) = fixture();
        let a = imports.iat_rva("KERNEL32.dll", "ExitProcess").unwrap();
        let b = imports.iat_rva("KERNEL32.dll", "WriteFile").unwrap();
        assert_eq!(b - a, 8);
        assert!(imports.iat_rva("KERNEL32.dll", "ReadFile").is_none());
    }

    #[test]
    fn test_ilt_and_iat_mirror_each_other() {
        let (layout, imports) = fixture();
        let bytes = imports.bytes();
        let idata_rva = layout.get("idata").unwrap().file_offset as u32;
        // Descriptor 0: OriginalFirstThunk and FirstThunk point at
        // parallel tables with identical initial contents.
        let ilt = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) - idata_rva;
        let iat = u32::from_le_bytes(bytes[16..20].try_into().unwrap()) - idata_rva;
        let ilt0 = u64::from_le_bytes(bytes[ilt as usize..ilt as usize + 8].try_into().unwrap());
        let iat0 = u64::from_le_bytes(bytes[iat as usize..iat as usize + 8].try_into().unwrap());
        assert_eq!(ilt0, iat0);
        assert_ne!(ilt0, 0);
    }

    #[test]
    fn test_descriptor_table_null_terminated() {
        let (_, imports) = fixture();
        let bytes = imports.bytes();
        // Second descriptor (the terminator) is all zeros.
        assert!(bytes[20..40].iter().all(|&b| b == 0));
    }
}
