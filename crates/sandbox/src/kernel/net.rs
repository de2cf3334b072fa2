//! File descriptors: the standard streams and in-sandbox stream socket pairs. There is no network.

use std::collections::{BTreeMap, VecDeque};

use crate::kernel::{Action, Context, Errno, Kernel, Result, SyscallFrame};

const AF_UNIX: u64 = 1;

const POLLIN: u16 = 0x1;
const POLLOUT: u16 = 0x4;
const POLLHUP: u16 = 0x10;
const POLLNVAL: u16 = 0x20;

#[repr(u64)]
enum Shutdown {
    Read = 0,
    Write = 1,
    Both = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Descriptor {
    Stdin,
    Stdout,
    Stderr,

    /// One end of a socket pair. `side` is 0 or 1.
    Socket { pair: u64, side: usize },
}

impl Descriptor {
    pub fn is_socket(&self) -> bool {
        matches!(self, Descriptor::Socket { .. })
    }
}

/// A connected pair of stream sockets. Index `i` of each array describes side `i`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SocketPair {
    /// Bytes waiting to be read by each side
    pub(crate) buffers: [VecDeque<u8>; 2],

    /// Whether each side still has an open descriptor
    pub(crate) open: [bool; 2],

    pub(crate) can_read: [bool; 2],
    pub(crate) can_write: [bool; 2],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Files {
    pub(crate) table: BTreeMap<i32, Descriptor>,
    pub(crate) pairs: BTreeMap<u64, SocketPair>,
    pub(crate) next_pair: u64,
}

impl Default for Files {
    fn default() -> Self {
        Self::new()
    }
}

impl Files {
    pub fn new() -> Self {
        let table = BTreeMap::from([
            (0, Descriptor::Stdin),
            (1, Descriptor::Stdout),
            (2, Descriptor::Stderr),
        ]);

        Self {
            table,
            pairs: Default::default(),
            next_pair: 0,
        }
    }

    pub fn get(&self, fd: i32) -> Option<Descriptor> {
        self.table.get(&fd).copied()
    }

    fn allocate(&mut self, descriptor: Descriptor) -> i32 {
        let mut fd = 0;
        for &used in self.table.keys() {
            if used != fd {
                break;
            }
            fd += 1;
        }
        self.table.insert(fd, descriptor);
        fd
    }

    /// Create a socket pair and return the descriptors of both ends.
    pub fn socketpair(&mut self) -> (i32, i32) {
        let pair = self.next_pair;
        self.next_pair += 1;
        self.pairs.insert(
            pair,
            SocketPair {
                open: [true; 2],
                can_read: [true; 2],
                can_write: [true; 2],
                ..Default::default()
            },
        );

        let first = self.allocate(Descriptor::Socket { pair, side: 0 });
        let second = self.allocate(Descriptor::Socket { pair, side: 1 });
        (first, second)
    }

    pub fn close(&mut self, fd: i32) -> Result<()> {
        let descriptor = self.table.remove(&fd).ok_or(Errno::Ebadf)?;
        if let Descriptor::Socket { pair, side } = descriptor {
            let remove = match self.pairs.get_mut(&pair) {
                Some(sockets) => {
                    sockets.open[side] = false;
                    sockets.can_read[side] = false;
                    sockets.can_write[side] = false;
                    !sockets.open[1 - side]
                }
                None => false,
            };

            if remove {
                self.pairs.remove(&pair);
            }
        }
        Ok(())
    }

    fn socket(&mut self, fd: i32) -> Result<(&mut SocketPair, usize)> {
        match self.get(fd) {
            Some(Descriptor::Socket { pair, side }) => {
                let sockets = self.pairs.get_mut(&pair).ok_or(Errno::Ebadf)?;
                Ok((sockets, side))
            }
            Some(_) => Err(Errno::Enotsock.into()),
            None => Err(Errno::Ebadf.into()),
        }
    }

    /// Read at most `len` bytes. An empty result means end of stream.
    pub fn recv(&mut self, fd: i32, len: usize) -> Result<Vec<u8>> {
        let (sockets, side) = self.socket(fd)?;
        let buffer = &mut sockets.buffers[side];
        if buffer.is_empty() {
            if !sockets.can_read[side] || !sockets.can_write[1 - side] {
                return Ok(Vec::new());
            }
            return Err(Errno::Eagain.into());
        }

        let len = len.min(buffer.len());
        Ok(buffer.drain(..len).collect())
    }

    pub fn send(&mut self, fd: i32, data: &[u8]) -> Result<u64> {
        let (sockets, side) = self.socket(fd)?;
        let peer = 1 - side;
        if !sockets.can_write[side] || !sockets.can_read[peer] {
            return Err(Errno::Epipe.into());
        }

        sockets.buffers[peer].extend(data);
        Ok(data.len() as u64)
    }

    pub fn shutdown(&mut self, fd: i32, how: u64) -> Result<()> {
        let (sockets, side) = self.socket(fd)?;
        match how {
            n if n == Shutdown::Read as u64 => sockets.can_read[side] = false,
            n if n == Shutdown::Write as u64 => sockets.can_write[side] = false,
            n if n == Shutdown::Both as u64 => {
                sockets.can_read[side] = false;
                sockets.can_write[side] = false;
            }
            _ => return Err(Errno::Einval.into()),
        }
        Ok(())
    }

    fn poll(&self, fd: i32, events: u16, stdin_ready: bool) -> u16 {
        let ready = match self.get(fd) {
            None => return POLLNVAL,
            Some(Descriptor::Stdin) => {
                if stdin_ready {
                    POLLIN
                } else {
                    POLLHUP
                }
            }
            Some(Descriptor::Stdout | Descriptor::Stderr) => POLLOUT,
            Some(Descriptor::Socket { pair, side }) => match self.pairs.get(&pair) {
                Some(sockets) => {
                    let mut ready = 0;
                    if !sockets.buffers[side].is_empty() {
                        ready |= POLLIN;
                    }
                    if sockets.can_write[side] && sockets.can_read[1 - side] {
                        ready |= POLLOUT;
                    }
                    if !sockets.open[1 - side] {
                        ready |= POLLHUP;
                    }
                    ready
                }
                None => POLLNVAL,
            },
        };

        ready & (events | POLLHUP | POLLNVAL)
    }
}

impl Kernel {
    pub(crate) fn read_descriptor(&mut self, fd: i32, len: usize) -> Result<Vec<u8>> {
        match self.files.get(fd) {
            Some(Descriptor::Stdin) => {
                let available = &self.stdin[self.stdin_position..];
                let len = len.min(available.len());
                let data = available[..len].to_vec();
                self.stdin_position += len;
                Ok(data)
            }
            Some(Descriptor::Socket { .. }) => self.files.recv(fd, len),
            Some(Descriptor::Stdout | Descriptor::Stderr) | None => Err(Errno::Ebadf.into()),
        }
    }

    pub(crate) fn write_descriptor(&mut self, fd: i32, data: &[u8]) -> Result<u64> {
        match self.files.get(fd) {
            Some(Descriptor::Stdout) => {
                self.print(1, data);
                Ok(data.len() as u64)
            }
            Some(Descriptor::Stderr) => {
                self.print(2, data);
                Ok(data.len() as u64)
            }
            Some(Descriptor::Socket { .. }) => self.files.send(fd, data),
            Some(Descriptor::Stdin) | None => Err(Errno::Ebadf.into()),
        }
    }

    pub(crate) fn poll_descriptor(&self, fd: i32, events: u16, stdin_ready: bool) -> u16 {
        self.files.poll(fd, events, stdin_ready)
    }

    pub(crate) fn close(&mut self, frame: &SyscallFrame) -> Result<Action> {
        self.files.close(frame.arg(0) as i32)?;
        Ok(Action::Return(0))
    }

    pub(crate) fn socketpair(&mut self, context: &mut Context<'_>, frame: &SyscallFrame) -> Result<Action> {
        let (domain, fds) = (frame.arg(0), frame.arg(3));
        if domain != AF_UNIX {
            return Err(Errno::Eafnosupport.into());
        }

        // Validate the output before creating descriptors the guest would never learn about
        context.write_bytes(fds, &[0u8; 8])?;
        let (first, second) = self.files.socketpair();
        context.write_u32(fds, first as u32)?;
        context.write_u32(fds + 4, second as u32)?;
        Ok(Action::Return(0))
    }

    pub(crate) fn send(&mut self, context: &mut Context<'_>, frame: &SyscallFrame) -> Result<Action> {
        let (fd, buf, len) = (frame.arg(0) as i32, frame.arg(1), frame.arg(2));
        let data = context.read_bytes(buf, len)?;
        let sent = self.files.send(fd, &data)?;
        Ok(Action::Return(sent))
    }

    pub(crate) fn recv(&mut self, context: &mut Context<'_>, frame: &SyscallFrame) -> Result<Action> {
        let (fd, buf, len) = (frame.arg(0) as i32, frame.arg(1), frame.arg(2));
        let len = len.min(context.memory.limit());
        let data = self.files.recv(fd, len as usize)?;
        context.write_bytes(buf, &data)?;
        Ok(Action::Return(data.len() as u64))
    }

    pub(crate) fn shutdown(&mut self, frame: &SyscallFrame) -> Result<Action> {
        self.files.shutdown(frame.arg(0) as i32, frame.arg(1))?;
        Ok(Action::Return(0))
    }
}
