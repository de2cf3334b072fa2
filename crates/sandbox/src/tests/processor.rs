use std::sync::atomic::AtomicBool;

use crate::emulator;
use crate::mem::{self, Permissions, PAGE_SIZE};
use crate::processor::{DispatchMode, Error, ProcessorState, Run, Stop, EXIT_ADDRESS};
use crate::tests::asm::{self, CODE, DATA};
use crate::tests::Result;
use rvisa::abi;

/// Sum of 1 through 10 in a countdown loop.
fn sum_loop() -> Vec<u32> {
    vec![
        asm::li(abi::A0, 0),
        asm::li(abi::T0, 10),
        asm::add(abi::A0, abi::A0, abi::T0),
        asm::addi(abi::T0, abi::T0, -1),
        asm::bne(abi::T0, abi::ZERO, -8),
        asm::ret(),
    ]
}

#[test]
fn loop_returns_in_both_modes() -> Result<()> {
    for mode in [DispatchMode::Threaded, DispatchMode::Precise] {
        let mut memory = asm::memory(&sum_loop())?;
        let mut processor = asm::processor(mode);
        let stop = processor.run(&mut memory, &mut Run::new(1000))?;

        assert_eq!(stop, Stop::Returned);
        assert_eq!(processor.state(), ProcessorState::Halted);
        assert_eq!(processor.hart().regs.get(abi::A0), 55);
        assert_eq!(processor.hart().regs.pc, EXIT_ADDRESS);
        assert_eq!(processor.hart().instret, 33);
    }

    Ok(())
}

#[test]
fn ecall_stops_after_the_instruction() -> Result<()> {
    let mut memory = asm::memory(&[asm::li(abi::A7, 64), asm::ECALL, asm::ret()])?;
    let mut processor = asm::processor(DispatchMode::Threaded);
    let stop = processor.run(&mut memory, &mut Run::new(1000))?;

    assert_eq!(stop, Stop::Syscall);
    assert_eq!(processor.state(), ProcessorState::Trapped);
    assert_eq!(processor.hart().regs.pc, CODE + 8);
    assert_eq!(processor.hart().regs.get(abi::A7), 64);

    let stop = processor.run(&mut memory, &mut Run::new(1000))?;
    assert_eq!(stop, Stop::Returned);
    Ok(())
}

#[test]
fn ebreak_is_a_breakpoint() -> Result<()> {
    let mut memory = asm::memory(&[asm::EBREAK, asm::ret()])?;
    let mut processor = asm::processor(DispatchMode::Precise);
    let stop = processor.run(&mut memory, &mut Run::new(1000))?;

    assert_eq!(stop, Stop::Breakpoint);
    assert_eq!(processor.hart().regs.pc, CODE + 4);
    Ok(())
}

#[test]
fn unmapped_load_faults_at_the_instruction() -> Result<()> {
    for mode in [DispatchMode::Threaded, DispatchMode::Precise] {
        let mut memory = asm::memory(&[
            asm::lui(abi::T0, 0x9_0000),
            asm::ld(abi::A0, abi::T0, 0),
            asm::ret(),
        ])?;
        let mut processor = asm::processor(mode);
        let err = processor
            .run(&mut memory, &mut Run::new(1000))
            .expect_err("load must fault");

        assert_eq!(
            err,
            Error::Fault {
                pc: CODE + 4,
                source: emulator::Error::MemoryAccess(mem::Error::Unmapped { address: 0x9_0000 }),
            }
        );
        assert_eq!(processor.state(), ProcessorState::Faulted);
        assert_eq!(processor.hart().regs.pc, CODE + 4);
        assert_eq!(processor.hart().instret, 1);
    }

    Ok(())
}

#[test]
fn store_to_code_without_write_permission_faults() -> Result<()> {
    let mut memory = asm::memory(&[asm::lui(abi::T0, CODE as u32), asm::sw(abi::ZERO, abi::T0, 0)])?;
    let mut processor = asm::processor(DispatchMode::Threaded);
    let err = processor
        .run(&mut memory, &mut Run::new(1000))
        .expect_err("store must fault");

    let Error::Fault { source, .. } = err else {
        panic!("unexpected error {err}");
    };
    assert_eq!(source.signal(), emulator::signal::SIGSEGV);
    Ok(())
}

#[test]
fn step_limit_is_exact() -> Result<()> {
    let spin = 0x0000_006f; // jal zero, 0
    for mode in [DispatchMode::Threaded, DispatchMode::Precise] {
        let mut memory = asm::memory(&[spin])?;
        let mut processor = asm::processor(mode);
        let stop = processor.run(&mut memory, &mut Run::new(100))?;

        assert_eq!(stop, Stop::StepLimit);
        assert_eq!(processor.state(), ProcessorState::Ready);
        assert_eq!(processor.hart().instret, 100);

        processor.run(&mut memory, &mut Run::new(23))?;
        assert_eq!(processor.hart().instret, 123);
    }

    Ok(())
}

#[test]
fn cancellation_stops_before_executing() -> Result<()> {
    let mut memory = asm::memory(&sum_loop())?;
    let mut processor = asm::processor(DispatchMode::Threaded);
    let cancel = AtomicBool::new(true);
    let stop = processor.run(&mut memory, &mut Run::new(1000).with_cancel(&cancel))?;

    assert_eq!(stop, Stop::Cancelled);
    assert_eq!(processor.hart().instret, 0);
    Ok(())
}

#[test]
fn host_code_writes_invalidate_cached_blocks() -> Result<()> {
    let mut memory = asm::memory(&[asm::li(abi::A0, 1), asm::ret()])?;
    let mut processor = asm::processor(DispatchMode::Threaded);
    processor.run(&mut memory, &mut Run::new(1000))?;
    assert_eq!(processor.hart().regs.get(abi::A0), 1);
    assert_eq!(processor.cache().len(), 1);

    memory.host_write(CODE, &asm::bytes(&[asm::li(abi::A0, 2)]))?;
    let hart = processor.hart_mut();
    hart.regs.pc = CODE;
    hart.regs.set(abi::RA, EXIT_ADDRESS);
    processor.run(&mut memory, &mut Run::new(1000))?;

    assert_eq!(processor.hart().regs.get(abi::A0), 2);
    Ok(())
}

#[test]
fn guest_overwrites_the_running_block() -> Result<()> {
    for mode in [DispatchMode::Threaded, DispatchMode::Precise] {
        let mut memory = asm::memory(&[])?;
        memory.protect(CODE, PAGE_SIZE, Permissions::ALL)?;
        memory.host_write(
            CODE,
            &asm::bytes(&[
                asm::lui(abi::T0, CODE as u32),
                asm::lui(abi::T1, DATA as u32),
                asm::lw(abi::T2, abi::T1, 0),
                asm::sw(abi::T2, abi::T0, 20),
                asm::addi(abi::ZERO, abi::ZERO, 0),
                asm::li(abi::A0, 1),
                asm::ret(),
            ]),
        )?;
        memory.host_write(DATA, &asm::li(abi::A0, 2).to_le_bytes())?;

        let mut processor = asm::processor(mode);
        processor.run(&mut memory, &mut Run::new(1000))?;
        assert_eq!(processor.hart().regs.get(abi::A0), 2, "{mode:?}");
    }

    Ok(())
}

#[test]
fn reservation_fails_after_intervening_store() -> Result<()> {
    let mut memory = asm::memory(&[
        asm::lui(abi::T0, DATA as u32),
        asm::li(abi::T1, 7),
        // Successful pair
        asm::lr_w(abi::A1, abi::T0),
        asm::sc_w(abi::A2, abi::T0, abi::T1),
        // Store between the pair breaks the reservation
        asm::lr_w(abi::A3, abi::T0),
        asm::li(abi::T2, 9),
        asm::sw(abi::T2, abi::T0, 0),
        asm::sc_w(abi::A4, abi::T0, abi::T1),
        asm::amoadd_w(abi::A5, abi::T0, abi::T1),
        asm::lw(abi::A0, abi::T0, 0),
        asm::ret(),
    ])?;
    let mut processor = asm::processor(DispatchMode::Threaded);
    processor.run(&mut memory, &mut Run::new(1000))?;

    let regs = &processor.hart().regs;
    assert_eq!(regs.get(abi::A1), 0);
    assert_eq!(regs.get(abi::A2), 0, "first sc succeeds");
    assert_eq!(regs.get(abi::A3), 7);
    assert_eq!(regs.get(abi::A4), 1, "second sc fails");
    assert_eq!(regs.get(abi::A5), 9);
    assert_eq!(regs.get(abi::A0), 16);
    Ok(())
}

#[test]
fn division_by_zero_does_not_trap() -> Result<()> {
    let mut memory = asm::memory(&[
        asm::li(abi::A1, 42),
        asm::div(abi::A0, abi::A1, abi::ZERO),
        asm::mul(abi::A2, abi::A1, abi::A1),
        asm::ret(),
    ])?;
    let mut processor = asm::processor(DispatchMode::Precise);
    processor.run(&mut memory, &mut Run::new(1000))?;

    assert_eq!(processor.hart().regs.get(abi::A0), u64::MAX);
    assert_eq!(processor.hart().regs.get(abi::A2), 42 * 42);
    Ok(())
}

#[test]
fn hot_blocks_are_counted() -> Result<()> {
    let mut memory = asm::memory(&sum_loop())?;
    let mut processor = asm::processor(DispatchMode::Threaded);
    processor.count_blocks(true);
    processor.run(&mut memory, &mut Run::new(1000))?;

    // The first iteration runs in the entry block, the other nine in the loop body block
    assert_eq!(processor.hot_blocks(9), vec![CODE + 8]);
    assert!(processor.hot_blocks(10).is_empty());
    assert_eq!(processor.hot_blocks(1).len(), 3);
    Ok(())
}

#[test]
fn link_address_wraps_at_the_top_of_the_address_space() -> Result<()> {
    let mut hart = emulator::Hart::default();
    let mut memory = asm::memory(&[])?;
    hart.regs.pc = u64::MAX - 3;
    hart.regs.set(abi::T0, CODE);

    let instruction = rvisa::decode(asm::jalr(abi::RA, abi::T0, 0))?;
    let flow = emulator::execute(&mut hart, &mut memory, &instruction)?;
    assert!(matches!(flow, emulator::ControlFlow::Jump(target) if target == CODE));
    assert_eq!(hart.regs.get(abi::RA), 0);
    Ok(())
}
