//! End-to-end compilation checks: source text in, container bytes out.
//!
//! Execution of the produced binaries is host-dependent; these tests
//! validate the wire level instead — container identification, segment
//! shape, dynamic metadata, and relocation completeness.

use veld_codegen::{compile, CompileError, Options};
use veld_parser::diag::ErrorSink;
use veld_parser::{lex, parse};

fn build(src: &str, triple: &str) -> Vec<u8> {
    try_build(src, triple).expect("compilation failed")
}

fn try_build(src: &str, triple: &str) -> Result<Vec<u8>, CompileError> {
    let program = parse(lex(src).unwrap()).unwrap();
    let target = veld_asm::Target::parse(triple).unwrap();
    let mut sink = ErrorSink::default();
    compile(&program, &Options::for_target(target), &mut sink).map(|a| a.bytes)
}

// ── ELF inspection helpers ───────────────────────────────────────────

fn u16le(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes(b[at..at + 2].try_into().unwrap())
}

fn u32le(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(b[at..at + 4].try_into().unwrap())
}

fn u64le(b: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(b[at..at + 8].try_into().unwrap())
}

struct Elf<'a> {
    bytes: &'a [u8],
}

impl<'a> Elf<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        assert_eq!(&bytes[0..4], b"\x7fELF");
        assert_eq!(bytes[4], 2, "ELFCLASS64");
        assert_eq!(bytes[5], 1, "little-endian");
        Self { bytes }
    }

    fn etype(&self) -> u16 {
        u16le(self.bytes, 16)
    }

    fn machine(&self) -> u16 {
        u16le(self.bytes, 18)
    }

    fn entry(&self) -> u64 {
        u64le(self.bytes, 24)
    }

    fn phdrs(&self) -> Vec<(u32, u64, u64, u64, u32)> {
        let phoff = u64le(self.bytes, 32) as usize;
        let phnum = u16le(self.bytes, 56) as usize;
        (0..phnum)
            .map(|i| {
                let at = phoff + i * 56;
                (
                    u32le(self.bytes, at),      // p_type
                    u64le(self.bytes, at + 8),  // p_offset
                    u64le(self.bytes, at + 16), // p_vaddr
                    u64le(self.bytes, at + 32), // p_filesz
                    u32le(self.bytes, at + 4),  // p_flags
                )
            })
            .collect()
    }

    /// `(tag, value)` entries of PT_DYNAMIC, if present.
    fn dynamic(&self) -> Vec<(u64, u64)> {
        let Some(&(_, off, _, size, _)) = self.phdrs().iter().find(|p| p.0 == 2) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut at = off as usize;
        let end = (off + size) as usize;
        while at + 16 <= end {
            let tag = u64le(self.bytes, at);
            out.push((tag, u64le(self.bytes, at + 8)));
            if tag == 0 {
                break;
            }
            at += 16;
        }
        out
    }
}

// ── Static programs ──────────────────────────────────────────────────

#[test]
fn test_literal_exit_is_a_static_executable() {
    let bytes = build("main = 42", "x86_64-linux");
    let elf = Elf::new(&bytes);
    assert_eq!(elf.etype(), 2, "ET_EXEC");
    assert_eq!(elf.machine(), 62, "EM_X86_64");
    assert!(elf.dynamic().is_empty(), "no dynamic segment");
    // Entry lands inside the executable load segment.
    let (_, _, vaddr, filesz, flags) = *elf
        .phdrs()
        .iter()
        .find(|p| p.0 == 1 && p.4 & 1 != 0)
        .expect("an executable segment");
    assert!(elf.entry() >= vaddr && elf.entry() < vaddr + filesz);
    assert_eq!(flags & 0b111, 0b101, "R+X, not writable");
}

#[test]
fn test_hello_world_is_pure_syscall() {
    let bytes = build(r#"println("Hello, World!")"#, "x86_64-linux");
    let elf = Elf::new(&bytes);
    assert_eq!(elf.etype(), 2);
    assert!(
        !elf.dynamic().iter().any(|(tag, _)| *tag == 1),
        "no DT_NEEDED for a pure-syscall program"
    );
    // The greeting (with appended newline) sits in rodata.
    let needle = b"Hello, World!\n";
    assert!(bytes.windows(needle.len()).any(|w| w == needle));
}

#[test]
fn test_load_segments_are_page_congruent() {
    let bytes = build("x := 1\n@ i in 1..10 { x <- x + i }\nprintln(x)", "x86_64-linux");
    let elf = Elf::new(&bytes);
    for (ptype, off, vaddr, _, _) in elf.phdrs() {
        if ptype == 1 {
            assert_eq!(off % 0x1000, vaddr % 0x1000);
        }
    }
}

#[test]
fn test_no_sentinel_survives_in_text() {
    // Compile something call-heavy and confirm the placeholder pattern
    // was patched everywhere in the executable segment.
    let src = "fact = n -> n { 0 => 1; ~> n * fact(n - 1) }\nmain = { println(fact(10)) }";
    let bytes = build(src, "x86_64-linux");
    let elf = Elf::new(&bytes);
    let (_, off, _, filesz, _) = *elf
        .phdrs()
        .iter()
        .find(|p| p.0 == 1 && p.4 & 1 != 0)
        .unwrap();
    let text = &bytes[off as usize..(off + filesz) as usize];
    let sentinels = veld_codegen::reloc::find_sentinels(text);
    assert!(sentinels.is_empty(), "unpatched placeholders at {sentinels:?}");
}

// ── Dynamic programs ─────────────────────────────────────────────────

#[test]
fn test_one_import_pulls_exactly_one_needed() {
    let bytes = build("import \"libc.so.6\"\nx = sin(1)\nprintln(x)", "x86_64-linux");
    let elf = Elf::new(&bytes);
    assert_eq!(elf.etype(), 3, "ET_DYN");
    let needed: Vec<u64> = elf
        .dynamic()
        .iter()
        .filter(|(tag, _)| *tag == 1)
        .map(|(_, v)| *v)
        .collect();
    assert_eq!(needed.len(), 1);
    // An interpreter path is present.
    assert!(elf.phdrs().iter().any(|p| p.0 == 3), "PT_INTERP");
    let needle = b"/lib64/ld-linux-x86-64.so.2";
    assert!(bytes.windows(needle.len()).any(|w| w == needle));
}

#[test]
fn test_dynamic_metadata_micro_scenario() {
    let bytes = build("import \"libc.so.6\"\nprintln(sin(1))", "x86_64-linux");
    let elf = Elf::new(&bytes);
    let dynamic = elf.dynamic();
    let get = |tag: u64| -> u64 {
        dynamic
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, v)| *v)
            .unwrap_or_else(|| panic!("missing dynamic tag {tag}"))
    };

    // Symbol table: null symbol then `sin`, global function, undefined.
    let symtab = get(6) as usize; // DT_SYMTAB; base 0 so vaddr == offset
    let strtab = get(5) as usize;
    assert!(bytes[symtab..symtab + 24].iter().all(|&b| b == 0));
    let name_off = u32le(&bytes, symtab + 24) as usize;
    let name_end = bytes[strtab + name_off..]
        .iter()
        .position(|&b| b == 0)
        .unwrap();
    assert_eq!(&bytes[strtab + name_off..strtab + name_off + name_end], b"sin");
    assert_eq!(bytes[symtab + 28], (1 << 4) | 2, "global function");
    assert_eq!(u16le(&bytes, symtab + 30), 0, "SHN_UNDEF");

    // One JUMP_SLOT relocation whose offset is the function's GOT slot.
    let rela = get(23) as usize; // DT_JMPREL
    assert_eq!(get(2), 24, "DT_PLTRELSZ: one Elf64_Rela");
    let r_offset = u64le(&bytes, rela);
    let got = get(3); // DT_PLTGOT
    assert_eq!(r_offset, got + 24, "slot after the three reserved words");
    let r_info = u64le(&bytes, rela + 8);
    assert_eq!(r_info >> 32, 1, "symbol index 1");
    assert_eq!(r_info as u32, 7, "R_X86_64_JUMP_SLOT");

    // GOT: reserved slots then the lazy-resolution pointer aimed at
    // the PLT entry's push instruction (header is 16 bytes).
    let got_off = got as usize;
    let dyn_vaddr = elf
        .phdrs()
        .iter()
        .find(|p| p.0 == 2)
        .map(|p| p.2)
        .unwrap();
    assert_eq!(u64le(&bytes, got_off), dyn_vaddr, "GOT[0] = &_DYNAMIC");
    assert_eq!(u64le(&bytes, got_off + 8), 0);
    assert_eq!(u64le(&bytes, got_off + 16), 0);
    let lazy = u64le(&bytes, got_off + 24);
    let plt_entry_push = lazy - 6 - 16; // push is 6 bytes into entry 0
    assert_eq!(plt_entry_push % 16, 0, "entries are 16-byte aligned");
}

#[test]
fn test_parallel_loop_links_the_thread_runtime() {
    let bytes = build("sum := 0\n@@ i in 0..7 { sum <- sum + i }\nprintln(sum)", "x86_64-linux");
    let elf = Elf::new(&bytes);
    assert_eq!(elf.etype(), 3);
    let needle = b"libveldrt.so";
    assert!(bytes.windows(needle.len()).any(|w| w == needle));
    let needle = b"veld_par_range";
    assert!(bytes.windows(needle.len()).any(|w| w == needle));
}

// ── Other targets ────────────────────────────────────────────────────

#[test]
fn test_aarch64_linux_machine_type() {
    let bytes = build("main = 7", "aarch64-linux");
    let elf = Elf::new(&bytes);
    assert_eq!(elf.machine(), 183, "EM_AARCH64");
    assert_eq!(elf.etype(), 2);
}

#[test]
fn test_riscv64_machine_and_float_abi() {
    let bytes = build("println(40 + 2)", "riscv64-linux");
    let elf = Elf::new(&bytes);
    assert_eq!(elf.machine(), 243, "EM_RISCV");
    assert_eq!(u32le(&bytes, 48) & 0x5, 0x5, "RVC + double-float ABI flags");
}

#[test]
fn test_macho_output_identifies() {
    let bytes = build("main = 3", "aarch64-darwin");
    assert_eq!(u32le(&bytes, 0), 0xfeedfacf);
    assert_eq!(u32le(&bytes, 4), 0x0100000c, "arm64");
}

#[test]
fn test_macho_rejects_imports() {
    let err = try_build("import \"libSystem.dylib\"\nx = sin(1)\nprintln(x)", "aarch64-darwin")
        .unwrap_err();
    assert!(matches!(err, CompileError::ImportsUnsupported { .. }));
}

#[test]
fn test_pe_output_identifies() {
    let bytes = build("println(1)", "x86_64-windows");
    assert_eq!(&bytes[0..2], b"MZ");
    let lfanew = u32le(&bytes, 0x3c) as usize;
    assert_eq!(&bytes[lfanew..lfanew + 4], b"PE\0\0");
    assert_eq!(u16le(&bytes, lfanew + 4), 0x8664);
    // The console runtime's imports are present.
    for needle in [&b"KERNEL32.dll"[..], b"ExitProcess", b"WriteFile"] {
        assert!(bytes.windows(needle.len()).any(|w| w == needle));
    }
}

// ── Language features end to end ─────────────────────────────────────

#[test]
fn test_defer_loop_match_or_else_all_compile() {
    for (name, src) in [
        ("defer", "defer println(\"1\")\ndefer println(\"2\")\nprintln(\"Main\")"),
        ("loop", "sum := 0\n@ i in 1..10 { sum <- sum + i }\nprintln(sum)"),
        ("or", "x := 10 / 0\ny := x or! 99\nprintln(y)"),
        ("match", "fact = n -> n { 0 => 1; ~> n * fact(n - 1) }\nmain = { println(fact(10)) }"),
        ("break", "@ i in 1..100 { break }\n@ j in 1..3 { continue }\nprintln(1)"),
        ("strings", "a = \"foo\"\nb = a + \"bar\"\nprintln(b)"),
        ("sqrt", "println(sqrt(81))"),
        ("ret", "f = n -> { ret n * 2\nprintln(999) }\nprintln(f(21))"),
    ] {
        for triple in ["x86_64-linux", "aarch64-linux", "riscv64-linux"] {
            assert!(
                try_build(src, triple).is_ok(),
                "{name} failed to compile for {triple}"
            );
        }
    }
}

#[test]
fn test_compress_wraps_linux_only() {
    let program = parse(lex("main = 42").unwrap()).unwrap();
    let target = veld_asm::Target::parse("x86_64-linux").unwrap();
    let mut options = Options::for_target(target);
    options.compress = true;
    let mut sink = ErrorSink::default();
    let artifact = compile(&program, &options, &mut sink).unwrap();
    assert_eq!(&artifact.bytes[0..4], b"\x7fELF");

    let target = veld_asm::Target::parse("aarch64-linux").unwrap();
    let mut options = Options::for_target(target);
    options.compress = true;
    let err = compile(&program, &options, &mut sink).unwrap_err();
    assert!(matches!(err, CompileError::CompressUnsupported));
}

#[test]
fn test_artifact_round_trips_through_disk() {
    let bytes = build("main = 42", "x86_64-linux");
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lit");
    std::fs::write(&path, &bytes).unwrap();
    let back = std::fs::read(&path).unwrap();
    assert_eq!(back, bytes);
    assert_eq!(&back[0..4], b"\x7fELF");
}

#[test]
fn test_semantic_errors_reported_through_sink() {
    let program = parse(lex("x = 1\nx <- 2\ny <- 3").unwrap()).unwrap();
    let target = veld_asm::Target::parse("x86_64-linux").unwrap();
    let mut sink = ErrorSink::default();
    let err = compile(&program, &Options::for_target(target), &mut sink).unwrap_err();
    assert!(matches!(err, CompileError::UserErrors(2)));
    assert_eq!(sink.len(), 2);
}

#[test]
fn test_debug_dump_is_json() {
    let program = parse(lex("x = 5\nprintln(x)").unwrap()).unwrap();
    let target = veld_asm::Target::parse("x86_64-linux").unwrap();
    let mut options = Options::for_target(target);
    options.debug = true;
    let mut sink = ErrorSink::default();
    let artifact = compile(&program, &options, &mut sink).unwrap();
    let dump: serde_json::Value =
        serde_json::from_str(artifact.debug_dump.as_deref().unwrap()).unwrap();
    assert_eq!(dump["target"], "x86_64-linux");
    assert!(dump["sections"].as_array().unwrap().len() >= 4);
}
