use std::collections::BTreeMap;

use rvisa::abi;

use crate::emulator::{Hart, Reservation};
use crate::kernel::{Brk, Heap, Kernel, SignalAction};
use crate::loader::{Program, Symbol, SymbolKind};
use crate::mem::{Memory, PAGE_SIZE};
use crate::registers::Registers;
use crate::snapshot::{self, Error, Parts, MAGIC, VERSION};
use crate::tests::asm::{self, CODE, DATA};
use crate::tests::Result;

struct State {
    hart: Hart,
    memory: Memory,
    kernel: Kernel,
    program: Program,
}

fn state() -> Result<State> {
    let mut memory = asm::memory(&[asm::li(abi::A0, 1), asm::ret()])?;
    memory.host_write(DATA + 100, b"payload")?;
    let shared = memory.share(b"shared", true)?;

    let mut regs = Registers::default();
    regs.pc = CODE + 4;
    regs.set(abi::A0, 1);
    regs.set_f64(3, 2.5);
    regs.set_fcsr(0x21);
    let hart = Hart {
        regs,
        instret: 12,
        reservation: Some(Reservation {
            address: DATA,
            size: 4,
            value: 9,
        }),
    };

    let mut kernel = Kernel::new(5, b"stdin".to_vec(), None);
    kernel.brk = Brk::new(0x8000, PAGE_SIZE);
    kernel.heap = Some(Heap::new(0x9000, PAGE_SIZE));
    if let Some(heap) = kernel.heap.as_mut() {
        heap.allocate(24);
    }
    kernel.signals.actions.insert(
        10,
        SignalAction {
            handler: CODE,
            flags: 0,
            mask: 1,
        },
    );
    kernel.files.socketpair();
    kernel.files.send(3, b"queued")?;
    kernel.rng_mut().next_u64();
    kernel.clock_offset = 77;

    let mut program = Program {
        entry: CODE,
        image_end: CODE + PAGE_SIZE,
        ..Default::default()
    };
    program.symbols.insert(Symbol {
        name: "main".to_string(),
        address: CODE,
        size: 8,
        kind: SymbolKind::Function,
    });
    program.symbols.insert(Symbol {
        name: "shared_address".to_string(),
        address: shared,
        size: 8,
        kind: SymbolKind::Object,
    });

    Ok(State {
        hart,
        memory,
        kernel,
        program,
    })
}

fn encode(state: &State, samples: Option<&BTreeMap<u64, u64>>) -> Vec<u8> {
    snapshot::encode(&Parts {
        hart: &state.hart,
        memory: &state.memory,
        kernel: &state.kernel,
        program: Some(&state.program),
        initial_sp: 0x4_0000,
        image: Some(&b"elf image"[..]),
        samples,
    })
}

#[test]
fn restores_all_state() -> Result<()> {
    let state = state()?;
    let samples = BTreeMap::from([(CODE, 3), (CODE + 4, 1)]);
    let bytes = encode(&state, Some(&samples));
    assert_eq!(&bytes[..8], MAGIC);

    let restored = snapshot::decode(&bytes, None)?;
    assert_eq!(restored.hart, state.hart);
    assert_eq!(restored.program.as_ref(), Some(&state.program));
    assert_eq!(restored.initial_sp, 0x4_0000);
    assert_eq!(restored.image.as_deref(), Some(&b"elf image"[..]));
    assert_eq!(restored.samples, Some(samples));

    let memory = &restored.memory;
    assert!(memory.regions().eq(state.memory.regions()));
    assert!(memory.pages().eq(state.memory.pages()));
    assert_eq!(memory.limit(), state.memory.limit());
    assert_eq!(memory.layout(), state.memory.layout());
    assert_eq!(memory.shared, state.memory.shared);

    let kernel = &restored.kernel;
    assert_eq!(kernel.brk, state.kernel.brk);
    assert_eq!(kernel.heap, state.kernel.heap);
    assert_eq!(kernel.signals, state.kernel.signals);
    assert_eq!(kernel.files, state.kernel.files);
    assert_eq!(kernel.threads, state.kernel.threads);
    assert_eq!(kernel.rng, state.kernel.rng);
    assert_eq!(kernel.clock_offset, 77);
    assert_eq!(kernel.stdin, b"stdin");
    Ok(())
}

#[test]
fn restored_memory_is_independent() -> Result<()> {
    let state = state()?;
    let bytes = encode(&state, None);
    let mut restored = snapshot::decode(&bytes, None)?;
    assert!(restored.samples.is_none());

    restored.memory.host_write(DATA + 100, b"changed")?;
    let mut buf = [0u8; 7];
    state.memory.host_read(DATA + 100, &mut buf)?;
    assert_eq!(&buf, b"payload");

    // The same state always produces the same bytes
    assert_eq!(encode(&state, None), bytes);
    Ok(())
}

#[test]
fn rejects_foreign_data() -> Result<()> {
    assert!(matches!(snapshot::decode(b"", None), Err(Error::BadMagic)));
    assert!(matches!(
        snapshot::decode(b"not a snapshot at all", None),
        Err(Error::BadMagic)
    ));

    let mut header = MAGIC.to_vec();
    header.extend_from_slice(&(VERSION + 1).to_le_bytes());
    assert!(matches!(
        snapshot::decode(&header, None),
        Err(Error::UnsupportedVersion(version)) if version == VERSION + 1
    ));

    let mut header = MAGIC.to_vec();
    header.extend_from_slice(&VERSION.to_le_bytes());
    assert!(matches!(
        snapshot::decode(&header, None),
        Err(Error::MissingSection(1))
    ));
    Ok(())
}

#[test]
fn rejects_truncated_snapshots() -> Result<()> {
    let bytes = encode(&state()?, None);
    for len in [bytes.len() - 1, bytes.len() / 2, 13] {
        assert!(
            matches!(
                snapshot::decode(&bytes[..len], None),
                Err(Error::Truncated { .. })
            ),
            "length {len}"
        );
    }
    Ok(())
}

fn section(tag: u32, payload: &[u8]) -> Vec<u8> {
    let mut bytes = tag.to_le_bytes().to_vec();
    bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

#[test]
fn skips_unknown_sections() -> Result<()> {
    let mut bytes = encode(&state()?, None);
    bytes.extend(section(1000, b"from a newer writer"));
    let restored = snapshot::decode(&bytes, None)?;
    assert_eq!(restored.hart.instret, 12);

    bytes.extend(section(1000, b""));
    assert!(matches!(
        snapshot::decode(&bytes, None),
        Err(Error::Corrupt(_))
    ));
    Ok(())
}
