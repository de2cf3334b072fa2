use riscv_sandbox::kernel::Errno;
use riscv_sandbox::machine::Result;
use riscv_sandbox::MachineOptions;

use crate::common;

#[test]
fn freed_chunks_are_reused() -> Result<()> {
    let mut machine = common::machine(MachineOptions::default());
    assert_eq!(machine.call_by_name("heap_reuse", &[100])?, 0);
    Ok(())
}

#[test]
fn allocations_live_in_the_heap() -> Result<()> {
    let mut machine = common::machine(MachineOptions::default());
    let first = machine.call_by_name("malloc", &[24])?;
    let second = machine.call_by_name("malloc", &[24])?;
    assert_ne!(first, 0);
    assert_eq!(first % 16, 0);
    assert_eq!(second - first, 32);

    let heap = machine.kernel().heap().expect("heap is enabled");
    assert!(heap.contains(first));
    assert!(heap.contains(second));
    assert_eq!(heap.info().chunks, 2);

    machine.write_memory(first, b"heap")?;
    assert_eq!(machine.read_memory(first, 4)?, b"heap");
    Ok(())
}

#[test]
fn exhausted_heap_returns_null() -> Result<()> {
    let mut machine = common::machine(MachineOptions::default().with_heap_size(1 << 16));
    assert_eq!(machine.call_by_name("malloc", &[1 << 20])?, 0);
    assert_ne!(machine.call_by_name("malloc", &[1 << 10])?, 0);
    Ok(())
}

#[test]
fn disabled_heap() -> Result<()> {
    let mut machine = common::machine(MachineOptions::default().with_heap_size(0));
    assert!(machine.kernel().heap().is_none());
    assert_eq!(machine.call_by_name("malloc", &[16])?, Errno::Enosys.result());
    Ok(())
}
