//! Self-extracting executable stub (`--compress`, Linux x86-64 only).
//!
//! The payload executable is compressed with a byte-aligned LZSS
//! (12-bit window, 4-bit length) chosen so the decoder fits in a few
//! dozen machine instructions. The stub is a small static ET_EXEC that
//! maps an anonymous buffer, inflates the payload into it, writes it to
//! a `memfd_create` descriptor, and `execveat`s the descriptor with the
//! original argv/envp. On any syscall failure it exits 127.

use crate::elf::{
    EHDR_SIZE, ELFCLASS64, ELFDATA2LSB, ELF_MAGIC, EM_X86_64, ET_EXEC, EV_CURRENT, PF_R, PF_X,
    PHDR_SIZE, PT_LOAD, STATIC_BASE,
};
use crate::ObjectResult;
use veld_asm::emit::apply_patch;
use veld_asm::x86_64::X64;
use veld_asm::{Cond, Emitter, Isa, Os, SectionBuffer, Target};

const MIN_MATCH: usize = 3;
const MAX_MATCH: usize = 18;
const WINDOW: usize = 4095;

/// Compress with greedy LZSS: groups of eight items behind a control
/// byte, matches encoded as `(offset:12, len-3:4)`.
pub fn compress(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() / 2 + 16);
    let mut pos = 0;
    while pos < input.len() {
        let flag_at = out.len();
        out.push(0);
        let mut flags = 0u8;
        for bit in 0..8 {
            if pos >= input.len() {
                break;
            }
            let (off, len) = best_match(input, pos);
            if len >= MIN_MATCH {
                out.push((off & 0xff) as u8);
                out.push((((off >> 4) & 0xf0) as u8) | ((len - MIN_MATCH) as u8));
                pos += len;
            } else {
                flags |= 1 << bit;
                out.push(input[pos]);
                pos += 1;
            }
        }
        out[flag_at] = flags;
    }
    out
}

fn best_match(input: &[u8], pos: usize) -> (usize, usize) {
    let start = pos.saturating_sub(WINDOW);
    let max_len = MAX_MATCH.min(input.len() - pos);
    let mut best = (0, 0);
    if max_len < MIN_MATCH {
        return best;
    }
    for cand in start..pos {
        let mut len = 0;
        while len < max_len && input[cand + len] == input[pos + len] {
            len += 1;
        }
        if len > best.1 {
            best = (pos - cand, len);
            if len == max_len {
                break;
            }
        }
    }
    best
}

/// Reference decoder, used by the tests to validate the format the
/// machine-code decoder implements.
pub fn decompress(input: &[u8], out_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(out_len);
    let mut pos = 0;
    while out.len() < out_len && pos < input.len() {
        let flags = input[pos];
        pos += 1;
        for bit in 0..8 {
            if out.len() >= out_len || pos >= input.len() {
                break;
            }
            if flags & (1 << bit) != 0 {
                out.push(input[pos]);
                pos += 1;
            } else {
                let b0 = input[pos] as usize;
                let b1 = input[pos + 1] as usize;
                pos += 2;
                let off = ((b1 & 0xf0) << 4) | b0;
                let len = (b1 & 0x0f) + MIN_MATCH;
                for _ in 0..len {
                    let at = out.len() - off;
                    out.push(out[at]);
                }
            }
        }
    }
    out
}

// Scratch register assignments inside the stub decoder.
const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RBX: u8 = 3;
const RSP: u8 = 4;
const RSI: u8 = 6;
const RDI: u8 = 7;
const R8: u8 = 8;
const R9: u8 = 9;
const R10: u8 = 10;
const R12: u8 = 12;
const R13: u8 = 13;
const R15: u8 = 15;

/// Wrap `payload` (a finished ELF executable) in the self-extracting
/// stub and return the complete stub executable.
pub fn wrap(payload: &[u8]) -> ObjectResult<Vec<u8>> {
    let compressed = compress(payload);
    let out_len = payload.len() as u64;
    let alloc_len = crate::layout::align_up(out_len.max(1), 0x1000);
    let nums = Target::new(Isa::X86_64, Os::Linux).syscalls();

    let mut text = SectionBuffer::new("sfx-text");
    let mut asm = X64::new(&mut text);

    // mmap(NULL, alloc_len, PROT_READ|PROT_WRITE, MAP_PRIVATE|MAP_ANON, -1, 0)
    asm.mov_ri(RAX, nums.mmap)?;
    asm.mov_ri(RDI, 0)?;
    asm.mov_ri(RSI, alloc_len)?;
    asm.mov_ri(RDX, 3)?;
    asm.mov_ri(R10, 0x22)?;
    asm.mov_ri(R8, u64::MAX)?;
    asm.mov_ri(R9, 0)?;
    asm.syscall();
    asm.mov_rr(R12, RAX)?; // output base
    asm.mov_rr(RDI, RAX)?; // dst cursor
    let payload_ref = asm.lea_rip(RSI)?; // src cursor
    asm.mov_ri(R15, out_len)?;
    asm.add_rr(R15, R12)?; // dst end

    // Group loop: one control byte, then eight items.
    let group_top = asm.pos();
    let done1 = asm.br_icmp(Cond::Ge, RDI, R15)?;
    asm.load_u8(RBX, RSI, 0)?;
    asm.inc(RSI)?;
    asm.mov_ri(R9, 8)?;

    let item_top = asm.pos();
    let done2 = asm.br_icmp(Cond::Ge, RDI, R15)?;
    asm.mov_rr(RAX, RBX)?;
    asm.and_ri(RAX, 1)?;
    asm.cmp_ri(RAX, 0)?;
    let to_match = asm.jcc_signed(Cond::Eq);

    // Literal byte.
    asm.load_u8(RAX, RSI, 0)?;
    asm.store_u8(RDI, 0, RAX)?;
    asm.inc(RSI)?;
    asm.inc(RDI)?;
    let to_next = asm.jmp_rel32();

    // Back-reference: offset = (b1 & 0xf0) << 4 | b0, len = (b1 & 0xf) + 3.
    let match_top = asm.pos();
    asm.load_u8(RAX, RSI, 0)?;
    asm.load_u8(RCX, RSI, 1)?;
    asm.add_ri(RSI, 2)?;
    asm.mov_rr(RDX, RCX)?;
    asm.and_ri(RDX, 0x0f)?;
    asm.add_ri(RDX, 3)?;
    asm.and_ri(RCX, 0xf0)?;
    asm.shl_ri(RCX, 4)?;
    asm.or_rr(RCX, RAX)?;
    asm.mov_rr(R10, RDI)?;
    asm.sub_rr(R10, RCX)?;
    let copy_top = asm.pos();
    asm.load_u8(RAX, R10, 0)?;
    asm.store_u8(RDI, 0, RAX)?;
    asm.inc(R10)?;
    asm.inc(RDI)?;
    asm.dec(RDX)?;
    asm.cmp_ri(RDX, 0)?;
    let copy_back = asm.jcc_signed(Cond::Gt);

    // Advance to the next flag bit.
    let next_top = asm.pos();
    asm.shr_ri(RBX, 1)?;
    asm.dec(R9)?;
    asm.cmp_ri(R9, 0)?;
    let item_back = asm.jcc_signed(Cond::Gt);
    let group_back = asm.jmp_rel32();

    // Re-exec the inflated image.
    let done_top = asm.pos();
    // memfd_create(name, 0)
    asm.mov_ri(RAX, nums.memfd_create)?;
    let name_ref = asm.lea_rip(RDI)?;
    asm.mov_ri(RSI, 0)?;
    asm.syscall();
    asm.mov_rr(R13, RAX)?;
    // write(fd, base, out_len)
    asm.mov_ri(RAX, nums.write)?;
    asm.mov_rr(RDI, R13)?;
    asm.mov_rr(RSI, R12)?;
    asm.mov_ri(RDX, out_len)?;
    asm.syscall();
    // execveat(fd, "", argv, envp, AT_EMPTY_PATH)
    asm.mov_ri(RAX, nums.execveat)?;
    asm.mov_rr(RDI, R13)?;
    let empty_ref = asm.lea_rip(RSI)?;
    asm.lea(RDX, RSP, 8)?;
    asm.load_rm(R10, RSP, 0)?; // argc
    asm.shl_ri(R10, 3)?;
    asm.add_rr(R10, RSP)?;
    asm.add_ri(R10, 16)?; // envp = rsp + 8 + argc*8 + 8
    asm.mov_ri(R8, 0x1000)?;
    asm.syscall();
    // exit(127) if exec failed
    asm.mov_ri(RAX, nums.exit)?;
    asm.mov_ri(RDI, 127)?;
    asm.syscall();

    // Local control flow.
    apply_patch(&mut text, &done1, 0, done_top as u64)?;
    apply_patch(&mut text, &done2, 0, done_top as u64)?;
    apply_patch(&mut text, &to_match, 0, match_top as u64)?;
    apply_patch(&mut text, &to_next, 0, next_top as u64)?;
    apply_patch(&mut text, &copy_back, 0, copy_top as u64)?;
    apply_patch(&mut text, &item_back, 0, item_top as u64)?;
    apply_patch(&mut text, &group_back, 0, group_top as u64)?;

    // File image: headers, code, strings, payload.
    let text_off = EHDR_SIZE + PHDR_SIZE;
    let name_off = text_off + text.len() as u64;
    let empty_off = name_off + 5;
    let payload_off = (empty_off + 1).div_ceil(8) * 8;

    apply_patch(&mut text, &name_ref, text_off, name_off)?;
    apply_patch(&mut text, &empty_ref, text_off, empty_off)?;
    apply_patch(&mut text, &payload_ref, text_off, payload_off)?;

    let total = payload_off + compressed.len() as u64;
    let mut file = Vec::with_capacity(total as usize);

    // Minimal ET_EXEC header with a single RX load segment.
    file.extend_from_slice(&ELF_MAGIC);
    file.push(ELFCLASS64);
    file.push(ELFDATA2LSB);
    file.push(EV_CURRENT);
    file.push(0);
    file.extend_from_slice(&[0; 8]);
    file.extend_from_slice(&ET_EXEC.to_le_bytes());
    file.extend_from_slice(&EM_X86_64.to_le_bytes());
    file.extend_from_slice(&1u32.to_le_bytes());
    file.extend_from_slice(&(STATIC_BASE + text_off).to_le_bytes());
    file.extend_from_slice(&EHDR_SIZE.to_le_bytes());
    file.extend_from_slice(&0u64.to_le_bytes());
    file.extend_from_slice(&0u32.to_le_bytes());
    file.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
    file.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
    file.extend_from_slice(&1u16.to_le_bytes());
    file.extend_from_slice(&[0u8; 6]);

    file.extend_from_slice(&PT_LOAD.to_le_bytes());
    file.extend_from_slice(&(PF_R | PF_X).to_le_bytes());
    file.extend_from_slice(&0u64.to_le_bytes());
    file.extend_from_slice(&STATIC_BASE.to_le_bytes());
    file.extend_from_slice(&STATIC_BASE.to_le_bytes());
    file.extend_from_slice(&total.to_le_bytes());
    file.extend_from_slice(&total.to_le_bytes());
    file.extend_from_slice(&0x1000u64.to_le_bytes());

    file.extend_from_slice(text.bytes());
    file.extend_from_slice(b"veld\0");
    file.push(0); // the empty path string
    file.resize(payload_off as usize, 0);
    file.extend_from_slice(&compressed);
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_repetitive() {
        let data: Vec<u8> = b"veld veld veld veld veld veld!".repeat(64);
        let packed = compress(&data);
        assert!(packed.len() < data.len() / 2);
        assert_eq!(decompress(&packed, data.len()), data);
    }

    #[test]
    fn test_roundtrip_incompressible() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let packed = compress(&data);
        assert_eq!(decompress(&packed, data.len()), data);
    }

    #[test]
    fn test_roundtrip_empty_and_tiny() {
        assert_eq!(decompress(&compress(&[]), 0), Vec::<u8>::new());
        let tiny = b"ab";
        assert_eq!(decompress(&compress(tiny), 2), tiny);
    }

    #[test]
    fn test_match_length_bounds() {
        // A long run compresses to max-length matches.
        let data = vec![0x41u8; 100];
        let packed = compress(&data);
        assert_eq!(decompress(&packed, 100), data);
        assert!(packed.len() < 20);
    }

    #[test]
    fn test_stub_is_a_static_elf() {
        let payload = b"\x7fELF-fake-payload".repeat(10);
        let stub = wrap(&payload).unwrap();
        assert_eq!(&stub[0..4], &ELF_MAGIC);
        assert_eq!(u16::from_le_bytes([stub[16], stub[17]]), ET_EXEC);
        // One program header, entry just past it.
        assert_eq!(u16::from_le_bytes([stub[56], stub[57]]), 1);
        let entry = u64::from_le_bytes(stub[24..32].try_into().unwrap());
        assert_eq!(entry, STATIC_BASE + EHDR_SIZE + PHDR_SIZE);
    }

    #[test]
    fn test_stub_contains_compressed_payload() {
        let payload = b"payload payload payload payload".repeat(32);
        let stub = wrap(&payload).unwrap();
        let packed = compress(&payload);
        let tail = &stub[stub.len() - packed.len()..];
        assert_eq!(tail, &packed[..]);
        // No placeholder displacement survives in the stub's own code.
        let code = &stub[..stub.len() - packed.len()];
        assert!(!code
            .windows(4)
            .any(|w| w == [0x78, 0x56, 0x34, 0x12]));
    }
}
