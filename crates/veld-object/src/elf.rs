//! ELF64 container writer.
//!
//! Program headers only — loaders do not need section headers, so none
//! are written. Two shapes:
//!
//! - **dynamic** (any external call): ET_DYN with PHDR, INTERP, three
//!   LOAD segments (read-only metadata, executable, writable) and a
//!   DYNAMIC segment; the interpreter path is the target ISA's
//!   canonical dynamic linker.
//! - **static** (pure-syscall programs): ET_EXEC with four LOAD
//!   segments and no dynamic metadata at all.

use crate::{ContainerInput, ContainerWriter, ObjectError, ObjectResult};
use veld_asm::{Format, Isa};

pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
pub const ELFCLASS64: u8 = 2;
pub const ELFDATA2LSB: u8 = 1;
pub const EV_CURRENT: u8 = 1;

pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;

pub const EM_X86_64: u16 = 62;
pub const EM_AARCH64: u16 = 183;
pub const EM_RISCV: u16 = 243;

/// EF_RISCV_RVC | EF_RISCV_FLOAT_ABI_DOUBLE.
pub const EF_RISCV_RVC_DOUBLE: u32 = 0x0005;

pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_INTERP: u32 = 3;
pub const PT_PHDR: u32 = 6;

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

pub const EHDR_SIZE: u64 = 64;
pub const PHDR_SIZE: u64 = 56;

/// Static ELF executables load at a fixed base.
pub const STATIC_BASE: u64 = 0x40_0000;

struct Phdr {
    p_type: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
    filesz: u64,
    memsz: u64,
    align: u64,
}

/// The ELF container writer.
pub struct ElfWriter;

impl ContainerWriter for ElfWriter {
    fn write(&self, input: &ContainerInput<'_>) -> ObjectResult<Vec<u8>> {
        if input.target.format() != Format::Elf {
            return Err(ObjectError::WrongTarget(input.target));
        }
        match input.dynamic {
            Some(dl) => write_dynamic(input, dl),
            None => write_static(input),
        }
    }
}

fn machine(isa: Isa) -> u16 {
    match isa {
        Isa::X86_64 => EM_X86_64,
        Isa::Aarch64 => EM_AARCH64,
        Isa::Riscv64 => EM_RISCV,
    }
}

fn flags(isa: Isa) -> u32 {
    match isa {
        Isa::Riscv64 => EF_RISCV_RVC_DOUBLE,
        _ => 0,
    }
}

fn write_ehdr(out: &mut Vec<u8>, input: &ContainerInput<'_>, etype: u16, phnum: u16) {
    out.extend_from_slice(&ELF_MAGIC);
    out.push(ELFCLASS64);
    out.push(ELFDATA2LSB);
    out.push(EV_CURRENT);
    out.push(0); // ELFOSABI_NONE
    out.extend_from_slice(&[0; 8]);
    out.extend_from_slice(&etype.to_le_bytes());
    out.extend_from_slice(&machine(input.target.isa).to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes()); // e_version
    out.extend_from_slice(&input.entry_vaddr.to_le_bytes());
    out.extend_from_slice(&EHDR_SIZE.to_le_bytes()); // e_phoff
    out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff: none
    out.extend_from_slice(&flags(input.target.isa).to_le_bytes());
    out.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
    out.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
    out.extend_from_slice(&phnum.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
}

fn write_phdr(out: &mut Vec<u8>, p: &Phdr) {
    out.extend_from_slice(&p.p_type.to_le_bytes());
    out.extend_from_slice(&p.flags.to_le_bytes());
    out.extend_from_slice(&p.offset.to_le_bytes());
    out.extend_from_slice(&p.vaddr.to_le_bytes());
    out.extend_from_slice(&p.vaddr.to_le_bytes()); // p_paddr mirrors p_vaddr
    out.extend_from_slice(&p.filesz.to_le_bytes());
    out.extend_from_slice(&p.memsz.to_le_bytes());
    out.extend_from_slice(&p.align.to_le_bytes());
}

/// Copy `bytes` into `file` at `offset`, growing the file as needed.
fn splice(file: &mut Vec<u8>, offset: u64, bytes: &[u8]) {
    let offset = offset as usize;
    if file.len() < offset + bytes.len() {
        file.resize(offset + bytes.len(), 0);
    }
    file[offset..offset + bytes.len()].copy_from_slice(bytes);
}

fn write_dynamic(
    input: &ContainerInput<'_>,
    dl: &crate::DynamicLinking,
) -> ObjectResult<Vec<u8>> {
    let layout = input.layout;
    let page = input.target.page_size();

    let interp = layout.get("interp")?;
    let rela = layout.get("rela")?;
    let plt = layout.get("plt")?;
    let text = layout.get("text")?;
    let dynamic = layout.get("dynamic")?;
    let data = layout.get("data")?;

    let phnum: u16 = 6;

    // Executable span: PLT through the end of emitted text (which may
    // extend into the slack page with post-layout helpers).
    let rx_end = text.file_offset + input.text.len() as u64;
    let rw_end = data.file_offset + input.data.len().max(data.size as usize) as u64;

    let phdrs = [
        Phdr {
            p_type: PT_PHDR,
            flags: PF_R,
            offset: EHDR_SIZE,
            vaddr: layout.get("ehdr")?.vaddr + EHDR_SIZE,
            filesz: PHDR_SIZE * u64::from(phnum),
            memsz: PHDR_SIZE * u64::from(phnum),
            align: 8,
        },
        Phdr {
            p_type: PT_INTERP,
            flags: PF_R,
            offset: interp.file_offset,
            vaddr: interp.vaddr,
            filesz: interp.size,
            memsz: interp.size,
            align: 1,
        },
        // Read-only metadata: headers through the relocation table.
        Phdr {
            p_type: PT_LOAD,
            flags: PF_R,
            offset: 0,
            vaddr: layout.get("ehdr")?.vaddr,
            filesz: rela.file_offset + rela.size,
            memsz: rela.file_offset + rela.size,
            align: page,
        },
        Phdr {
            p_type: PT_LOAD,
            flags: PF_R | PF_X,
            offset: plt.file_offset,
            vaddr: plt.vaddr,
            filesz: rx_end - plt.file_offset,
            memsz: rx_end - plt.file_offset,
            align: page,
        },
        Phdr {
            p_type: PT_LOAD,
            flags: PF_R | PF_W,
            offset: dynamic.file_offset,
            vaddr: dynamic.vaddr,
            filesz: rw_end - dynamic.file_offset,
            memsz: rw_end - dynamic.file_offset,
            align: page,
        },
        Phdr {
            p_type: PT_DYNAMIC,
            flags: PF_R | PF_W,
            offset: dynamic.file_offset,
            vaddr: dynamic.vaddr,
            filesz: dynamic.size,
            memsz: dynamic.size,
            align: 8,
        },
    ];

    let mut file = Vec::with_capacity(layout.file_end() as usize);
    write_ehdr(&mut file, input, ET_DYN, phnum);
    for p in &phdrs {
        write_phdr(&mut file, p);
    }

    let mut interp_bytes = input.target.interp_path().as_bytes().to_vec();
    interp_bytes.push(0);
    splice(&mut file, interp.file_offset, &interp_bytes);
    splice(&mut file, layout.get("dynstr")?.file_offset, dl.strtab_bytes());
    splice(&mut file, layout.get("dynsym")?.file_offset, &dl.symtab_bytes());
    splice(&mut file, layout.get("hash")?.file_offset, &dl.hash_bytes());
    splice(&mut file, rela.file_offset, &dl.rela_bytes());
    splice(&mut file, plt.file_offset, dl.plt_bytes());
    splice(&mut file, text.file_offset, input.text);
    splice(&mut file, dynamic.file_offset, &dl.dynamic_bytes());
    splice(&mut file, layout.get("got")?.file_offset, &dl.got_bytes());
    splice(&mut file, layout.get("rodata")?.file_offset, input.rodata);
    splice(&mut file, data.file_offset, input.data);
    if (file.len() as u64) < layout.file_end() {
        file.resize(layout.file_end() as usize, 0);
    }
    Ok(file)
}

fn write_static(input: &ContainerInput<'_>) -> ObjectResult<Vec<u8>> {
    let layout = input.layout;
    let page = input.target.page_size();

    let ehdr = layout.get("ehdr")?;
    let text = layout.get("text")?;
    let rodata = layout.get("rodata")?;
    let data = layout.get("data")?;

    let phnum: u16 = 4;
    let rx_end = text.file_offset + input.text.len() as u64;

    let phdrs = [
        Phdr {
            p_type: PT_LOAD,
            flags: PF_R,
            offset: 0,
            vaddr: ehdr.vaddr,
            filesz: ehdr.size,
            memsz: ehdr.size,
            align: page,
        },
        Phdr {
            p_type: PT_LOAD,
            flags: PF_R | PF_X,
            offset: text.file_offset,
            vaddr: text.vaddr,
            filesz: rx_end - text.file_offset,
            memsz: rx_end - text.file_offset,
            align: page,
        },
        Phdr {
            p_type: PT_LOAD,
            flags: PF_R,
            offset: rodata.file_offset,
            vaddr: rodata.vaddr,
            filesz: rodata.size.max(input.rodata.len() as u64),
            memsz: rodata.size.max(input.rodata.len() as u64),
            align: page,
        },
        Phdr {
            p_type: PT_LOAD,
            flags: PF_R | PF_W,
            offset: data.file_offset,
            vaddr: data.vaddr,
            filesz: data.size.max(input.data.len() as u64),
            memsz: data.size.max(input.data.len() as u64),
            align: page,
        },
    ];

    let mut file = Vec::with_capacity(layout.file_end() as usize);
    write_ehdr(&mut file, input, ET_EXEC, phnum);
    for p in &phdrs {
        write_phdr(&mut file, p);
    }
    splice(&mut file, text.file_offset, input.text);
    splice(&mut file, rodata.file_offset, input.rodata);
    splice(&mut file, data.file_offset, input.data);
    if (file.len() as u64) < layout.file_end() {
        file.resize(layout.file_end() as usize, 0);
    }
    Ok(file)
}
