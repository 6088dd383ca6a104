//! Bluetooth link socket handling.
//!
//! The control plane hands over an already-connected socket (A2DP media
//! transport, RFCOMM channel or SCO link) together with its negotiated
//! transfer units. This module wraps it for non-blocking use by the worker
//! and exposes the kernel output queue probe used for drain detection.

use std::{
   fs::File,
   io::{self, Read, Write},
   os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
};

use smallvec::SmallVec;

pub type Packet = SmallVec<[u8; 32]>;

/// Fallback transfer unit when the provider reports none.
pub const DEFAULT_MTU: usize = 672;

/// Sets `O_NONBLOCK` on a descriptor.
pub(crate) fn set_nonblocking(fd: BorrowedFd<'_>) -> io::Result<()> {
   let raw = fd.as_raw_fd();
   // SAFETY: `raw` comes from a live borrowed descriptor.
   let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
   if flags < 0 {
      return Err(io::Error::last_os_error());
   }
   // SAFETY: as above.
   if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
      return Err(io::Error::last_os_error());
   }
   Ok(())
}

/// Connected Bluetooth socket plus its transfer units.
#[derive(Debug)]
pub struct Link {
   socket: File,
   mtu_read: usize,
   mtu_write: usize,
}

impl Link {
   /// Takes ownership of `fd` and switches it to non-blocking mode.
   pub fn new(fd: OwnedFd, mtu_read: usize, mtu_write: usize) -> io::Result<Self> {
      set_nonblocking(fd.as_fd())?;
      Ok(Self {
         socket: File::from(fd),
         mtu_read: if mtu_read == 0 { DEFAULT_MTU } else { mtu_read },
         mtu_write: if mtu_write == 0 { DEFAULT_MTU } else { mtu_write },
      })
   }

   pub fn fd(&self) -> RawFd {
      self.socket.as_raw_fd()
   }

   pub const fn mtu_read(&self) -> usize {
      self.mtu_read
   }

   pub const fn mtu_write(&self) -> usize {
      self.mtu_write
   }

   /// Reads without blocking. `Ok(0)` means the peer hung up.
   pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
      (&self.socket).read(buf)
   }

   /// Writes without blocking.
   pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
      (&self.socket).write(buf)
   }

   /// Raw `TIOCOUTQ` value of the socket.
   ///
   /// Bluetooth sockets report free space here rather than queued bytes, so
   /// the value is only meaningful relative to a baseline taken while the
   /// queue was known to be empty.
   pub fn output_queue(&self) -> io::Result<usize> {
      let mut value: libc::c_int = 0;
      // SAFETY: TIOCOUTQ writes a single int through the provided pointer.
      let rc = unsafe { libc::ioctl(self.fd(), libc::TIOCOUTQ, &mut value as *mut libc::c_int) };
      if rc < 0 {
         return Err(io::Error::last_os_error());
      }
      Ok(value.max(0) as usize)
   }

   /// Shuts the socket down in both directions, waking any blocked I/O.
   pub fn shutdown(&self) {
      // SAFETY: shutdown on a descriptor we own; errors are irrelevant here.
      unsafe {
         libc::shutdown(self.fd(), libc::SHUT_RDWR);
      }
   }
}

/// Reports whether an I/O error is a transient "try again" condition.
pub(crate) fn is_transient(e: &io::Error) -> bool {
   matches!(
      e.kind(),
      io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
   )
}
