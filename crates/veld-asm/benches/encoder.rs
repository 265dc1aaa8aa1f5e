//! Instruction-encoder benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use veld_asm::x86_64::X64;
use veld_asm::{Emitter, SectionBuffer};

fn bench_x64_scalar(c: &mut Criterion) {
    c.bench_function("x64_scalar_alu_1k", |b| {
        b.iter(|| {
            let mut buf = SectionBuffer::with_capacity("text", 16 * 1024);
            let mut asm = X64::new(&mut buf);
            for i in 0..1000u64 {
                asm.mov_ri(0, black_box(i)).unwrap();
                asm.add_rr(0, 3).unwrap();
                asm.imul_rr(0, 3).unwrap();
            }
            black_box(buf.len())
        })
    });
}

fn bench_x64_float(c: &mut Criterion) {
    c.bench_function("x64_float_pipeline_1k", |b| {
        b.iter(|| {
            let mut buf = SectionBuffer::with_capacity("text", 16 * 1024);
            let mut asm = X64::new(&mut buf);
            for _ in 0..1000 {
                asm.addsd(0, 1).unwrap();
                asm.mulsd(0, 2).unwrap();
                asm.vfmadd231pd(0, 1, 2, true).unwrap();
            }
            black_box(buf.len())
        })
    });
}

criterion_group!(benches, bench_x64_scalar, bench_x64_float);
criterion_main!(benches);
