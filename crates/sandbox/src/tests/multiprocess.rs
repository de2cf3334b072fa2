use std::thread;
use std::time::Duration;

use crate::mem::{Memory, Permissions, RegionKind, SharedMemory, PAGE_SIZE};
use crate::multiprocess::{FutexTable, Wait};
use crate::tests::Result;

const FLAG: u64 = 0x1000;

#[test]
fn futex_wake_reports_the_waiters_it_released() -> Result<()> {
    let mut memory = Memory::new(1 << 20);
    memory.map_fixed(FLAG, PAGE_SIZE, Permissions::READ_WRITE, RegionKind::Segment)?;
    let shared = SharedMemory::new(&memory);
    let futexes = FutexTable::default();
    assert_eq!(futexes.wake(FLAG, 1)?, 0);

    let (futexes, shared) = (&futexes, &shared);
    let woken = thread::scope(|scope| -> Result<usize> {
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                scope.spawn(move || futexes.wait(&shared.view(), FLAG, 0, Duration::from_secs(10)))
            })
            .collect();
        while futexes.waiting(FLAG)? < 3 {
            thread::yield_now();
        }

        assert_eq!(futexes.wake(FLAG, 2)?, 2);
        assert_eq!(futexes.wake(FLAG, 5)?, 1);
        assert_eq!(futexes.wake(FLAG, 1)?, 0);

        let mut woken = 0;
        for waiter in waiters {
            let wait = waiter.join().map_err(|_| "waiter panicked")??;
            if matches!(wait, Wait::Woken) {
                woken += 1;
            }
        }
        Ok(woken)
    })?;
    assert_eq!(woken, 3);
    Ok(())
}

#[test]
fn futex_wait_checks_the_value_first() -> Result<()> {
    let mut memory = Memory::new(1 << 20);
    memory.map_fixed(FLAG, PAGE_SIZE, Permissions::READ_WRITE, RegionKind::Segment)?;
    memory.host_write(FLAG, &1u32.to_le_bytes())?;
    let shared = SharedMemory::new(&memory);
    let futexes = FutexTable::default();

    let view = shared.view();
    assert!(matches!(futexes.wait(&view, FLAG, 0, Duration::MAX)?, Wait::ValueChanged));
    assert!(matches!(
        futexes.wait(&view, FLAG, 1, Duration::from_millis(1))?,
        Wait::TimedOut
    ));
    assert_eq!(futexes.waiting(FLAG)?, 0);
    Ok(())
}
