use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use riscv_sandbox::machine::Error;
use riscv_sandbox::mem::{Permissions, PAGE_SIZE};
use riscv_sandbox::processor::ProcessorState;
use riscv_sandbox::{Machine, MachineOptions, Outcome, Statistics, SyscallResult};

use crate::common::{self, elf::Image, SYS_REPORT};

#[test]
fn program_runs_to_exit() -> riscv_sandbox::machine::Result<()> {
    let mut machine = common::machine(MachineOptions::default());
    assert_eq!(machine.run()?, Outcome::Exited(0));
    assert_eq!(machine.output(), b"hello\n");
    assert_eq!(machine.state(), ProcessorState::Halted);

    // The ended program must be reset before running again
    assert!(matches!(machine.run(), Err(Error::InvalidArgument(_))));
    machine.reset()?;
    assert!(machine.output().is_empty());
    assert_eq!(machine.run()?, Outcome::Exited(0));
    assert_eq!(machine.take_output(), b"hello\n");
    Ok(())
}

#[test]
fn printer_receives_output() -> riscv_sandbox::machine::Result<()> {
    let printed = Arc::new(Mutex::new(Vec::new()));
    let sink = printed.clone();
    let options = MachineOptions::default().with_printer(move |fd, bytes| {
        sink.lock().expect("lock").push((fd, bytes.to_vec()));
    });

    let mut machine = common::machine(options);
    assert_eq!(machine.run()?, Outcome::Exited(0));
    assert!(machine.output().is_empty());
    assert_eq!(*printed.lock().expect("lock"), vec![(1, b"hello\n".to_vec())]);
    Ok(())
}

/// Store an integer to a guest buffer, report it through a host system call and observe it from
/// the host.
#[test]
fn guest_reports_stored_value() -> riscv_sandbox::machine::Result<()> {
    let mut machine = common::machine(MachineOptions::default());
    let buffer = machine.map(0, PAGE_SIZE, Permissions::READ_WRITE)?;

    let reported = Arc::new(Mutex::new(Vec::new()));
    let log = reported.clone();
    machine.install_syscall_handler(SYS_REPORT, move |machine: &mut Machine, frame| {
        let value = common::u64_at(machine, frame.arg(0));
        log.lock().expect("lock").push(value);
        Ok(SyscallResult::Return(value * 2))
    });

    assert_eq!(machine.call_by_name("store", &[buffer, 21])?, 42);
    assert_eq!(*reported.lock().expect("lock"), vec![21]);
    assert_eq!(common::u64_at(&machine, buffer), 21);

    assert!(machine.remove_syscall_handler(SYS_REPORT).is_some());
    Ok(())
}

#[test]
fn calls_are_deterministic() -> riscv_sandbox::machine::Result<()> {
    let values: Vec<u8> = (1..=10u64).flat_map(|value| value.to_le_bytes()).collect();
    let run = || -> riscv_sandbox::machine::Result<(u64, Machine)> {
        let mut machine = common::machine(MachineOptions::default());
        let array = machine.share(&values, false)?;
        let sum = machine.call_by_name("sum", &[array, 10])?;
        Ok((sum, machine))
    };

    let (first, a) = run()?;
    let (second, b) = run()?;
    assert_eq!(first, 55);
    assert_eq!(second, 55);
    assert_eq!(a.registers(), b.registers());
    assert_eq!(a.statistics(), b.statistics());
    assert_eq!(
        a.statistics(),
        Statistics {
            calls: 1,
            exceptions: 0,
            timeouts: 0,
            instructions: a.statistics().instructions,
        }
    );
    assert!(a.statistics().instructions > 10 * 6);
    Ok(())
}

#[test]
fn call_arguments() -> riscv_sandbox::machine::Result<()> {
    let mut machine = common::machine(MachineOptions::default());
    let add = machine.address_of("add").expect("add is exported");
    assert_eq!(machine.call(add, &[40, 2])?, 42);
    assert_eq!(machine.call(add, &[u64::MAX, 2])?, 1);

    assert!(matches!(
        machine.call(add, &[0; 9]),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        machine.call_by_name("missing", &[]),
        Err(Error::UnknownSymbol(name)) if name == "missing"
    ));
    Ok(())
}

#[test]
fn host_memory_access() -> riscv_sandbox::machine::Result<()> {
    let mut machine = common::machine(MachineOptions::default());
    let greeting = machine.address_of("greeting").expect("greeting is exported");
    assert_eq!(machine.read_memory(greeting, 6)?, b"hello\n");

    let shared = machine.share(b"text\0", true)?;
    assert_eq!(machine.read_string(shared, 16)?, "text");
    machine.write_memory(shared, b"T")?;
    assert_eq!(machine.unshare(shared)?, b"Text\0");

    assert!(matches!(
        machine.read_memory(0x10, 4),
        Err(Error::Memory(_))
    ));
    assert!(matches!(
        machine.read_memory(greeting, usize::MAX),
        Err(Error::InvalidArgument(_))
    ));

    let page = machine.map(0, PAGE_SIZE, Permissions::READ)?;
    machine.protect(page, PAGE_SIZE, Permissions::READ_WRITE)?;
    machine.unmap(page, PAGE_SIZE)?;
    assert!(machine.read_memory(page, 1).is_err());
    Ok(())
}

#[test]
fn unloaded_machine() {
    common::initialize_logger();
    let mut machine = Machine::create(1 << 20, MachineOptions::default());
    assert!(matches!(machine.run(), Err(Error::NotLoaded)));
    assert!(matches!(machine.call(0x1000, &[]), Err(Error::NotLoaded)));
    assert!(matches!(machine.snapshot(), Err(Error::NotLoaded)));
    assert!(matches!(machine.reset(), Err(Error::NotLoaded)));
}

#[test]
fn invalid_executables_leave_the_machine_empty() {
    common::initialize_logger();
    let mut machine = Machine::new(MachineOptions::default());
    assert!(matches!(machine.load(b"not an elf"), Err(Error::Load(_))));

    // x86-64
    let foreign = common::library(Image::new().with_machine(62));
    assert!(matches!(machine.load(&foreign), Err(Error::Load(_))));
    assert!(matches!(machine.call(0x1_0000, &[]), Err(Error::NotLoaded)));

    let entry = machine.load(&common::program()).expect("loads");
    assert_eq!(Some(entry), machine.address_of("_start"));
}

#[test]
fn step_limit_stops_execution() -> riscv_sandbox::machine::Result<()> {
    let mut machine = common::machine(MachineOptions::default().with_step_limit(1000));
    assert_eq!(machine.step_limit(), 1000);

    assert!(matches!(
        machine.call_by_name("spin", &[]),
        Err(Error::StepLimit { limit: 1000 })
    ));
    let statistics = machine.statistics();
    assert_eq!(statistics.timeouts, 1);
    assert_eq!(statistics.instructions, 1000);

    machine.set_step_limit(10);
    assert!(machine.call_by_name("spin", &[]).is_err());
    assert_eq!(machine.statistics().instructions, 1010);
    Ok(())
}

#[test]
fn resume_continues_after_the_budget() -> riscv_sandbox::machine::Result<()> {
    let mut machine = common::machine(MachineOptions::default());
    assert_eq!(machine.resume(3)?, Outcome::StepLimit);
    assert_eq!(machine.statistics().instructions, 3);
    assert!(machine.output().is_empty());

    assert_eq!(machine.run()?, Outcome::Exited(0));
    assert_eq!(machine.output(), b"hello\n");
    Ok(())
}

#[test]
fn cancellation_is_observed_and_cleared() -> riscv_sandbox::machine::Result<()> {
    let mut machine = common::machine(MachineOptions::default().with_step_limit(500));
    let token = machine.cancel_token();
    token.store(true, Ordering::Relaxed);

    assert!(matches!(
        machine.call_by_name("spin", &[]),
        Err(Error::Cancelled)
    ));
    assert!(!token.load(Ordering::Relaxed));

    assert!(matches!(
        machine.call_by_name("spin", &[]),
        Err(Error::StepLimit { .. })
    ));
    Ok(())
}

#[test]
fn handlers_can_pause_and_preempt() -> riscv_sandbox::machine::Result<()> {
    let mut machine = common::machine(MachineOptions::default());
    let buffer = machine.map(0, PAGE_SIZE, Permissions::READ_WRITE)?;

    // The handler calls back into the guest while the reporting call is suspended
    machine.install_syscall_handler(SYS_REPORT, |machine: &mut Machine, frame| {
        let stored = common::u64_at(machine, frame.arg(0));
        let add = machine.address_of("add").expect("add is exported");
        let sum = machine.preempt(add, &[stored, 1])?;
        Ok(SyscallResult::Return(sum))
    });
    assert_eq!(machine.call_by_name("store", &[buffer, 41])?, 42);

    machine.install_syscall_handler(SYS_REPORT, |_: &mut Machine, _| Ok(SyscallResult::Pause));
    assert!(matches!(
        machine.call_by_name("store", &[buffer, 1]),
        Err(Error::Paused)
    ));

    // Nested calls from a handler are bounded
    let mut machine = common::machine(MachineOptions::default().with_max_call_depth(2));
    machine.install_syscall_handler(SYS_REPORT, |machine: &mut Machine, frame| {
        let store = machine.address_of("store").expect("store is exported");
        let result = machine.preempt(store, &[frame.arg(0), 7])?;
        Ok(SyscallResult::Return(result))
    });
    assert!(matches!(
        machine.call_by_name("store", &[buffer, 7]),
        Err(Error::CallDepthExceeded { max: 2 })
    ));
    Ok(())
}
