//! Procedure-linkage-table emission.
//!
//! One header stub plus one trampoline per imported function, as raw
//! bytes. Sizes are fixed per ISA so the layout engine can reserve space
//! before the content exists; content is emitted once the PLT and GOT
//! virtual addresses are final (size-then-emit, no in-buffer rewrites).
//!
//! Slot convention: the GOT's first three machine words are reserved
//! (dynamic-section address, link-map pointer, resolver — the latter two
//! loader-filled); function slots follow, one per import, in symbol
//! order.

use veld_asm::Isa;

/// `(header_bytes, entry_bytes)` for an ISA's PLT.
pub fn plt_sizes(isa: Isa) -> (u64, u64) {
    match isa {
        Isa::X86_64 => (16, 16),
        Isa::Aarch64 => (20, 16),
        Isa::Riscv64 => (32, 16),
    }
}

/// Total PLT size for `nfuncs` imports.
pub fn plt_total(isa: Isa, nfuncs: usize) -> u64 {
    let (header, entry) = plt_sizes(isa);
    header + entry * nfuncs as u64
}

/// Virtual address of entry `n`.
pub fn plt_entry_vaddr(isa: Isa, plt_vaddr: u64, n: usize) -> u64 {
    let (header, entry) = plt_sizes(isa);
    plt_vaddr + header + entry * n as u64
}

/// The initial value of function slot `n`: where the GOT points before
/// the first call resolves the symbol.
pub fn got_slot_initial(isa: Isa, plt_vaddr: u64, n: usize) -> u64 {
    match isa {
        // The push-index instruction inside the function's own stub.
        Isa::X86_64 => plt_entry_vaddr(isa, plt_vaddr, n) + 6,
        // The header; the resolver recovers the slot from the stub's
        // scratch registers.
        Isa::Aarch64 | Isa::Riscv64 => plt_vaddr,
    }
}

/// Emit the whole PLT with final addresses baked in.
pub fn emit_plt(isa: Isa, plt_vaddr: u64, got_vaddr: u64, nfuncs: usize) -> Vec<u8> {
    match isa {
        Isa::X86_64 => emit_x64(plt_vaddr, got_vaddr, nfuncs),
        Isa::Aarch64 => emit_a64(plt_vaddr, got_vaddr, nfuncs),
        Isa::Riscv64 => emit_rv64(plt_vaddr, got_vaddr, nfuncs),
    }
}

fn emit_x64(plt_vaddr: u64, got_vaddr: u64, nfuncs: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 * (nfuncs + 1));
    let rel32 = |insn_end: u64, target: u64| (target.wrapping_sub(insn_end) as u32).to_le_bytes();

    // Header: push GOT[1]; jmp [GOT[2]]; nop padding to 16.
    out.extend_from_slice(&[0xff, 0x35]);
    out.extend_from_slice(&rel32(plt_vaddr + 6, got_vaddr + 8));
    out.extend_from_slice(&[0xff, 0x25]);
    out.extend_from_slice(&rel32(plt_vaddr + 12, got_vaddr + 16));
    out.extend_from_slice(&[0x0f, 0x1f, 0x40, 0x00]);

    for n in 0..nfuncs {
        let entry = plt_entry_vaddr(Isa::X86_64, plt_vaddr, n);
        let slot = got_vaddr + 8 * (3 + n as u64);
        // jmp [GOT[3+n]]
        out.extend_from_slice(&[0xff, 0x25]);
        out.extend_from_slice(&rel32(entry + 6, slot));
        // push $n
        out.push(0x68);
        out.extend_from_slice(&(n as u32).to_le_bytes());
        // jmp header
        out.push(0xe9);
        out.extend_from_slice(&rel32(entry + 16, plt_vaddr));
    }
    out
}

fn adrp_word(rd: u32, pc: u64, target: u64) -> u32 {
    let delta = ((target & !0xfff) as i64 - (pc & !0xfff) as i64) >> 12;
    let imm = delta as u32;
    0x9000_0000 | (imm & 0x3) << 29 | ((imm >> 2) & 0x7ffff) << 5 | rd
}

fn emit_a64(plt_vaddr: u64, got_vaddr: u64, nfuncs: usize) -> Vec<u8> {
    let mut words: Vec<u32> = Vec::with_capacity(5 + 4 * nfuncs);
    let lo12 = |addr: u64| (addr & 0xfff) as u32;

    // Header: save x16/x30, form &GOT[2], load the resolver, jump.
    let got2 = got_vaddr + 16;
    words.push(0xa9bf7bf0); // stp x16, x30, [sp, #-16]!
    words.push(adrp_word(16, plt_vaddr + 4, got2));
    words.push(0xf940_0000 | (lo12(got2) / 8) << 10 | 16 << 5 | 17); // ldr x17, [x16, #lo]
    words.push(0x9100_0000 | lo12(got2) << 10 | 16 << 5 | 16); // add x16, x16, #lo
    words.push(0xd61f_0220); // br x17

    for n in 0..nfuncs {
        let entry = plt_entry_vaddr(Isa::Aarch64, plt_vaddr, n);
        let slot = got_vaddr + 8 * (3 + n as u64);
        words.push(adrp_word(16, entry, slot));
        words.push(0xf940_0000 | (lo12(slot) / 8) << 10 | 16 << 5 | 17);
        words.push(0x9100_0000 | lo12(slot) << 10 | 16 << 5 | 16);
        words.push(0xd61f_0220);
    }
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn auipc_parts(pc: u64, target: u64) -> (u32, u32) {
    let off = target.wrapping_sub(pc) as i64 as i32;
    let hi = (off.wrapping_add(0x800)) >> 12;
    let lo = off.wrapping_sub(hi << 12);
    ((hi as u32) & 0xfffff, (lo as u32) & 0xfff)
}

fn emit_rv64(plt_vaddr: u64, got_vaddr: u64, nfuncs: usize) -> Vec<u8> {
    // The psABI lazy-binding sequence. t0=x5, t1=x6, t2=x7, t3=x28.
    let mut words: Vec<u32> = Vec::with_capacity(8 + 4 * nfuncs);
    let (hi, lo) = auipc_parts(plt_vaddr, got_vaddr);

    words.push(0x0000_0017 | 7 << 7 | hi << 12); // auipc t2, %hi(got)
    words.push(0x4000_0033 | 6 << 7 | 6 << 15 | 28 << 20); // sub t1, t1, t3
    words.push(0x0000_3003 | 28 << 7 | 7 << 15 | lo << 20); // ld t3, %lo(got)(t2)
    let back = (-(44i32) as u32) & 0xfff;
    words.push(0x0000_0013 | 6 << 7 | 6 << 15 | back << 20); // addi t1, t1, -44
    words.push(0x0000_0013 | 5 << 7 | 7 << 15 | lo << 20); // addi t0, t2, %lo(got)
    words.push(0x0000_5013 | 6 << 7 | 6 << 15 | 1 << 20); // srli t1, t1, 1
    words.push(0x0000_3003 | 5 << 7 | 5 << 15 | 8 << 20); // ld t0, 8(t0)
    words.push(0x0000_0067 | 28 << 15); // jr t3

    for n in 0..nfuncs {
        let entry = plt_entry_vaddr(Isa::Riscv64, plt_vaddr, n);
        let slot = got_vaddr + 8 * (3 + n as u64);
        let (hi, lo) = auipc_parts(entry, slot);
        words.push(0x0000_0017 | 28 << 7 | hi << 12); // auipc t3, %hi(slot)
        words.push(0x0000_3003 | 28 << 7 | 28 << 15 | lo << 20); // ld t3, %lo(slot)(t3)
        words.push(0x0000_0067 | 6 << 7 | 28 << 15); // jalr t1, t3
        words.push(0x0000_0013); // nop
    }
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}
