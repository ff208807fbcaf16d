//! Property access with and without inline-cache feedback.
//!
//!   cargo bench --bench ic_feedback

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use shapevm::{CodeBlockId, VM, VMSettings, demos};

const ITERATIONS: u32 = 2_000;

fn setup(generic: bool) -> (VM, CodeBlockId) {
    let mut vm = VM::new(VMSettings::default()).expect("default settings are valid");
    let code_block = vm
        .link_code_block(&demos::property_warmup(ITERATIONS))
        .expect("demo program links");
    if generic {
        let code = vm.code_block_mut(code_block);
        code.get_by_id.iter_mut().for_each(|cache| cache.make_generic());
        code.put_by_id.iter_mut().for_each(|cache| cache.make_generic());
    }
    (vm, code_block)
}

fn property_access(c: &mut Criterion) {
    let mut group = c.benchmark_group("property_access");

    let (mut vm, code_block) = setup(false);
    group.bench_function("with_ic", |b| {
        b.iter(|| black_box(vm.run_program(code_block).expect("demo runs")))
    });

    let (mut vm, code_block) = setup(true);
    group.bench_function("without_ic", |b| {
        b.iter(|| black_box(vm.run_program(code_block).expect("demo runs")))
    });

    group.finish();
}

fn closures(c: &mut Criterion) {
    let mut vm = VM::new(VMSettings::default()).expect("default settings are valid");
    let code_block = vm
        .link_code_block(&demos::closures(100))
        .expect("demo program links");
    c.bench_function("closure_calls", |b| {
        b.iter(|| black_box(vm.run_program(code_block).expect("demo runs")))
    });
}

criterion_group!(benches, property_access, closures);
criterion_main!(benches);
