use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use riscv_sandbox::processor::DispatchMode;
use riscv_sandbox::{Machine, MachineOptions};

#[allow(dead_code)]
#[path = "../tests/common/mod.rs"]
mod common;

fn setup(mode: DispatchMode) -> Machine {
    Machine::from_elf(
        &common::program(),
        MachineOptions::default().with_dispatch(mode),
    )
    .expect("library loads")
}

pub fn dispatch(c: &mut Criterion) {
    for (name, mode) in [
        ("checksum_threaded", DispatchMode::Threaded),
        ("checksum_precise", DispatchMode::Precise),
    ] {
        c.bench_function(name, |b| {
            b.iter_batched(
                || setup(mode),
                |mut machine| machine.call_by_name("checksum", &[1000]).expect("checksum"),
                BatchSize::SmallInput,
            )
        });
    }

    // Decoded blocks stay cached across calls on the same machine
    c.bench_function("checksum_warm", |b| {
        let mut machine = setup(DispatchMode::Threaded);
        b.iter(|| machine.call_by_name("checksum", &[1000]).expect("checksum"))
    });

    c.bench_function("load", |b| {
        let program = common::program();
        b.iter(|| Machine::from_elf(&program, MachineOptions::default()).expect("library loads"))
    });
}

criterion_group!(benches, dispatch);
criterion_main!(benches);
