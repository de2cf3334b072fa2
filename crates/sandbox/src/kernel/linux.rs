use crate::kernel::{
    Action, Context, Errno, Kernel, Result, SyscallFrame, EPOCH_SECONDS, NANOS_PER_INSTRUCTION,
};
use crate::mem::{self, page_align_up, GuestMemory, Permissions, RegionKind};

/// The program break. The whole `[start, end)` range is mapped when the program is loaded and
/// only the break pointer moves.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Brk {
    pub start: u64,
    pub current: u64,
    pub end: u64,
}

impl Brk {
    pub fn new(start: u64, size: u64) -> Self {
        Self {
            start,
            current: start,
            end: start + size,
        }
    }
}

// https://github.com/torvalds/linux/blob/master/include/uapi/asm-generic/mman-common.h
#[repr(u64)]
enum MmapFlags {
    Fixed = 0x10,
    Anonymous = 0x20,
    FixedNoReplace = 0x100000,
}

#[repr(u64)]
enum MremapFlags {
    MayMove = 0x1,
}

#[repr(u64)]
enum Madvise {
    DontNeed = 4,
}

#[repr(u64)]
enum Clock {
    Realtime = 0,
    RealtimeCoarse = 5,
}

// https://github.com/torvalds/linux/blob/master/include/uapi/asm-generic/resource.h
const RLIMIT_STACK: u64 = 3;
const RLIM_INFINITY: u64 = u64::MAX;

const AT_EMPTY_PATH: u64 = 0x1000;

/// Maximum number of entries of an I/O vector.
const IOV_MAX: u64 = 1024;

/// Size of `struct stat` on riscv64.
const STAT_SIZE: usize = 128;

const S_IFCHR: u32 = 0o020000;
const S_IFSOCK: u32 = 0o140000;

impl Kernel {
    /// Guest time in nanoseconds.
    pub(crate) fn now(&self, context: &Context<'_>) -> u64 {
        context
            .hart
            .instret
            .saturating_mul(NANOS_PER_INSTRUCTION)
            .saturating_add(self.clock_offset)
    }

    fn realtime(&self, context: &Context<'_>) -> u64 {
        self.now(context)
            .saturating_add(EPOCH_SECONDS * 1_000_000_000)
    }

    pub(crate) fn getcwd(&mut self, context: &mut Context<'_>, frame: &SyscallFrame) -> Result<Action> {
        let (buf, size) = (frame.arg(0), frame.arg(1));
        let cwd = b"/\0";
        if size < cwd.len() as u64 {
            return Err(Errno::Erange.into());
        }

        context.write_bytes(buf, cwd)?;
        Ok(Action::Return(cwd.len() as u64))
    }

    pub(crate) fn lseek(&mut self, frame: &SyscallFrame) -> Result<Action> {
        let fd = frame.arg(0) as i32;
        if self.files.get(fd).is_none() {
            return Err(Errno::Ebadf.into());
        }

        Err(Errno::Espipe.into())
    }

    pub(crate) fn read(&mut self, context: &mut Context<'_>, frame: &SyscallFrame) -> Result<Action> {
        let (fd, buf, count) = (frame.arg(0) as i32, frame.arg(1), frame.arg(2));
        let count = count.min(context.memory.limit());
        let data = self.read_descriptor(fd, count as usize)?;
        context.write_bytes(buf, &data)?;
        Ok(Action::Return(data.len() as u64))
    }

    pub(crate) fn write(&mut self, context: &mut Context<'_>, frame: &SyscallFrame) -> Result<Action> {
        let (fd, buf, count) = (frame.arg(0) as i32, frame.arg(1), frame.arg(2));
        let data = context.read_bytes(buf, count)?;
        let written = self.write_descriptor(fd, &data)?;
        Ok(Action::Return(written))
    }

    fn iovecs(context: &Context<'_>, iov: u64, count: u64) -> Result<Vec<(u64, u64)>> {
        if count > IOV_MAX {
            return Err(Errno::Einval.into());
        }

        (0..count)
            .map(|i| {
                let entry = iov + i * 16;
                Ok((context.read_u64(entry)?, context.read_u64(entry + 8)?))
            })
            .collect()
    }

    pub(crate) fn readv(&mut self, context: &mut Context<'_>, frame: &SyscallFrame) -> Result<Action> {
        let fd = frame.arg(0) as i32;
        let mut total = 0u64;
        for (base, len) in Self::iovecs(context, frame.arg(1), frame.arg(2))? {
            let len = len.min(context.memory.limit());
            let data = self.read_descriptor(fd, len as usize)?;
            context.write_bytes(base, &data)?;
            total += data.len() as u64;
            if (data.len() as u64) < len {
                break;
            }
        }

        Ok(Action::Return(total))
    }

    pub(crate) fn writev(&mut self, context: &mut Context<'_>, frame: &SyscallFrame) -> Result<Action> {
        let fd = frame.arg(0) as i32;
        let mut data = Vec::new();
        for (base, len) in Self::iovecs(context, frame.arg(1), frame.arg(2))? {
            data.extend(context.read_bytes(base, len)?);
        }

        let written = self.write_descriptor(fd, &data)?;
        Ok(Action::Return(written))
    }

    pub(crate) fn ppoll(&mut self, context: &mut Context<'_>, frame: &SyscallFrame) -> Result<Action> {
        let (fds, nfds) = (frame.arg(0), frame.arg(1));
        if nfds > IOV_MAX {
            return Err(Errno::Einval.into());
        }

        let mut ready = 0;
        for i in 0..nfds {
            let entry = fds + i * 8;
            let fd = context.read_u32(entry)? as i32;
            let events = u16::from_le_bytes(context.memory.load(entry + 4)?);
            let revents = self.poll_descriptor(fd, events, self.stdin_position < self.stdin.len());
            context.write_bytes(entry + 6, &revents.to_le_bytes())?;
            if revents != 0 {
                ready += 1;
            }
        }

        Ok(Action::Return(ready))
    }

    pub(crate) fn fstat(&mut self, context: &mut Context<'_>, fd: u64, buf: u64) -> Result<Action> {
        let mode = match self.files.get(fd as i32) {
            Some(descriptor) if descriptor.is_socket() => S_IFSOCK | 0o600,
            Some(_) => S_IFCHR | 0o620,
            None => return Err(Errno::Ebadf.into()),
        };

        let mut stat = [0u8; STAT_SIZE];
        stat[16..20].copy_from_slice(&mode.to_le_bytes());
        stat[20..24].copy_from_slice(&1u32.to_le_bytes());
        stat[56..60].copy_from_slice(&(mem::PAGE_SIZE as u32).to_le_bytes());
        context.write_bytes(buf, &stat)?;
        Ok(Action::Return(0))
    }

    pub(crate) fn newfstatat(&mut self, context: &mut Context<'_>, frame: &SyscallFrame) -> Result<Action> {
        let (dirfd, path, buf, flags) = (frame.arg(0), frame.arg(1), frame.arg(2), frame.arg(3));
        let path = context.memory.read_c_string(path, 4096)?;
        if path.is_empty() && flags & AT_EMPTY_PATH != 0 {
            return self.fstat(context, dirfd, buf);
        }

        Err(Errno::Enoent.into())
    }

    pub(crate) fn nanosleep(&mut self, context: &mut Context<'_>, frame: &SyscallFrame) -> Result<Action> {
        let seconds = context.read_u64(frame.arg(0))?;
        let nanos = context.read_u64(frame.arg(0) + 8)?;
        if seconds as i64 <= -1 || nanos >= 1_000_000_000 {
            return Err(Errno::Einval.into());
        }

        let duration = seconds.saturating_mul(1_000_000_000).saturating_add(nanos);
        self.clock_offset = self.clock_offset.saturating_add(duration);
        Ok(Action::Return(0))
    }

    pub(crate) fn clock_gettime(&mut self, context: &mut Context<'_>, frame: &SyscallFrame) -> Result<Action> {
        let (clock, tp) = (frame.arg(0), frame.arg(1));
        let now = match clock {
            n if n == Clock::Realtime as u64 || n == Clock::RealtimeCoarse as u64 => {
                self.realtime(context)
            }
            _ => self.now(context),
        };

        context.write_u64(tp, now / 1_000_000_000)?;
        context.write_u64(tp + 8, now % 1_000_000_000)?;
        Ok(Action::Return(0))
    }

    pub(crate) fn gettimeofday(&mut self, context: &mut Context<'_>, frame: &SyscallFrame) -> Result<Action> {
        let tv = frame.arg(0);
        if tv != 0 {
            let now = self.realtime(context);
            context.write_u64(tv, now / 1_000_000_000)?;
            context.write_u64(tv + 8, now % 1_000_000_000 / 1000)?;
        }
        Ok(Action::Return(0))
    }

    pub(crate) fn sched_getaffinity(&mut self, context: &mut Context<'_>, frame: &SyscallFrame) -> Result<Action> {
        let (size, mask) = (frame.arg(1), frame.arg(2));
        if size < 8 {
            return Err(Errno::Einval.into());
        }

        // A single CPU
        context.write_u64(mask, 1)?;
        Ok(Action::Return(8))
    }

    pub(crate) fn uname(&mut self, context: &mut Context<'_>, frame: &SyscallFrame) -> Result<Action> {
        const FIELD: usize = 65;
        let fields: [&[u8]; 6] = [b"Linux", b"sandbox", b"6.1.0", b"#1", b"riscv64", b""];
        let mut utsname = [0u8; FIELD * 6];
        for (i, field) in fields.iter().enumerate() {
            utsname[i * FIELD..i * FIELD + field.len()].copy_from_slice(field);
        }

        context.write_bytes(frame.arg(0), &utsname)?;
        Ok(Action::Return(0))
    }

    pub(crate) fn set_brk(&mut self, context: &mut Context<'_>, frame: &SyscallFrame) -> Result<Action> {
        let requested = frame.arg(0);
        let brk = &mut self.brk;
        if requested < brk.start || requested > brk.end {
            return Ok(Action::Return(brk.current));
        }

        // Contents above a lowered break must read as zero when the break grows again
        if requested < brk.current {
            let from = page_align_up(requested).unwrap_or(brk.end);
            let to = page_align_up(brk.current).unwrap_or(brk.end);
            if from < to {
                context.memory.discard(from, to - from)?;
            }
        }

        brk.current = requested;
        Ok(Action::Return(brk.current))
    }

    pub(crate) fn mmap(&mut self, context: &mut Context<'_>, frame: &SyscallFrame) -> Result<Action> {
        let (address, len, prot, flags) = (frame.arg(0), frame.arg(1), frame.arg(2), frame.arg(3));
        if flags & MmapFlags::Anonymous as u64 == 0 {
            tracing::debug!(flags, fd = frame.arg(4) as i64, "file mapping refused");
            return Err(Errno::Enodev.into());
        }

        if len == 0 {
            return Err(Errno::Einval.into());
        }

        let permissions = Permissions::from_prot(prot);
        let memory = &mut *context.memory;
        let result = if flags & MmapFlags::FixedNoReplace as u64 != 0 {
            let len = page_align_up(len).ok_or(Errno::Enomem)?;
            if address % mem::PAGE_SIZE != 0 {
                return Err(Errno::Einval.into());
            }
            memory
                .map_fixed(address, len, permissions, RegionKind::Mmap)
                .map(|()| address)
                .map_err(|_| Errno::Eexist)
        } else if flags & MmapFlags::Fixed as u64 != 0 {
            let len = page_align_up(len).ok_or(Errno::Enomem)?;
            if address % mem::PAGE_SIZE != 0 {
                return Err(Errno::Einval.into());
            }
            memory
                .unmap(address, len)
                .and_then(|()| memory.map_fixed(address, len, permissions, RegionKind::Mmap))
                .map(|()| address)
                .map_err(|_| Errno::Enomem)
        } else {
            memory
                .map(address, len, permissions)
                .map_err(|_| Errno::Enomem)
        };

        let address = result?;
        tracing::debug!(address, len, %permissions, "mmap");
        Ok(Action::Return(address))
    }

    pub(crate) fn munmap(&mut self, context: &mut Context<'_>, frame: &SyscallFrame) -> Result<Action> {
        let (address, len) = (frame.arg(0), frame.arg(1));
        if len == 0 {
            return Err(Errno::Einval.into());
        }

        context
            .memory
            .unmap(address, len)
            .map_err(|_| Errno::Einval)?;
        Ok(Action::Return(0))
    }

    pub(crate) fn mremap(&mut self, context: &mut Context<'_>, frame: &SyscallFrame) -> Result<Action> {
        let (old, old_len, new_len, flags) = (frame.arg(0), frame.arg(1), frame.arg(2), frame.arg(3));
        let memory = &mut *context.memory;
        let region = memory
            .region(old)
            .filter(|region| region.kind == RegionKind::Mmap)
            .cloned()
            .ok_or(Errno::Einval)?;

        let old_len = page_align_up(old_len).ok_or(Errno::Einval)?;
        let new_len = page_align_up(new_len).ok_or(Errno::Enomem)?;
        if old % mem::PAGE_SIZE != 0 || new_len == 0 || old_len == 0 {
            return Err(Errno::Einval.into());
        }

        if new_len <= old_len {
            if new_len < old_len {
                memory
                    .unmap(old + new_len, old_len - new_len)
                    .map_err(|_| Errno::Einval)?;
            }
            return Ok(Action::Return(old));
        }

        if flags & MremapFlags::MayMove as u64 == 0 {
            return Err(Errno::Enomem.into());
        }

        let new = memory
            .map(0, new_len, region.permissions)
            .map_err(|_| Errno::Enomem)?;
        let copy_len = old_len.min(region.end.saturating_sub(old));
        let mut contents = vec![0u8; copy_len as usize];
        memory.host_read(old, &mut contents)?;
        memory.host_write(new, &contents)?;
        memory.unmap(old, old_len).map_err(|_| Errno::Einval)?;
        Ok(Action::Return(new))
    }

    pub(crate) fn mprotect(&mut self, context: &mut Context<'_>, frame: &SyscallFrame) -> Result<Action> {
        let (address, len, prot) = (frame.arg(0), frame.arg(1), frame.arg(2));
        match context
            .memory
            .protect(address, len, Permissions::from_prot(prot))
        {
            Ok(()) => Ok(Action::Return(0)),
            Err(mem::Error::Unmapped { .. }) => Err(Errno::Enomem.into()),
            Err(_) => Err(Errno::Einval.into()),
        }
    }

    pub(crate) fn madvise(&mut self, context: &mut Context<'_>, frame: &SyscallFrame) -> Result<Action> {
        let (address, len, advice) = (frame.arg(0), frame.arg(1), frame.arg(2));
        if advice == Madvise::DontNeed as u64 {
            let writable = context
                .memory
                .region(address)
                .is_some_and(|region| region.permissions.write);
            if !writable {
                return Err(Errno::Einval.into());
            }
            context
                .memory
                .discard(address, len)
                .map_err(|_| Errno::Einval)?;
        }
        Ok(Action::Return(0))
    }

    pub(crate) fn prlimit64(&mut self, context: &mut Context<'_>, frame: &SyscallFrame) -> Result<Action> {
        let (resource, old) = (frame.arg(1), frame.arg(3));
        if old != 0 {
            let limit = if resource == RLIMIT_STACK {
                self.stack_size
            } else {
                RLIM_INFINITY
            };
            context.write_u64(old, limit)?;
            context.write_u64(old + 8, limit)?;
        }
        Ok(Action::Return(0))
    }

    pub(crate) fn getrandom(&mut self, context: &mut Context<'_>, frame: &SyscallFrame) -> Result<Action> {
        let (buf, len) = (frame.arg(0), frame.arg(1));
        let len = len.min(context.memory.limit());
        let mut bytes = vec![0u8; len as usize];
        self.rng.fill(&mut bytes);
        context.write_bytes(buf, &bytes)?;
        Ok(Action::Return(len))
    }
}
