//! Coalescing notification channel between the owner and a worker.
//!
//! Signals are best-effort wakeups. A full queue drops the new code since a
//! wakeup is already pending, and the worker collapses everything queued
//! into a [`SignalSet`]. Receivers must derive their actions from transport
//! state, never from the number or order of signals.
//!
//! Every send also bumps an eventfd, so a worker can wait for signals and
//! descriptor readiness in a single `poll`.

use std::{
   fmt, io,
   os::fd::{AsRawFd, FromRawFd, OwnedFd},
   sync::Arc,
   time::Duration,
};

use crossbeam::channel::{self, TrySendError};
use log::{trace, warn};
use smallvec::SmallVec;

use crate::error::{Result, TransportError};

/// Control codes understood by transport workers.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr, strum::FromRepr,
)]
#[repr(u8)]
pub enum Signal {
   #[strum(serialize = "link-ready")]
   LinkReady = 0,
   #[strum(serialize = "pcm-open")]
   PcmOpen,
   #[strum(serialize = "pcm-close")]
   PcmClose,
   #[strum(serialize = "pcm-pause")]
   PcmPause,
   #[strum(serialize = "pcm-resume")]
   PcmResume,
   #[strum(serialize = "pcm-sync")]
   PcmSync,
   #[strum(serialize = "pcm-drop")]
   PcmDrop,
   #[strum(serialize = "set-volume")]
   SetVolume,
   #[strum(serialize = "send-command")]
   SendCommand,
   /// Teardown wakeup, paired with a cancellation request.
   #[strum(serialize = "shutdown")]
   Shutdown,
}

/// A set of signals merged from one wakeup.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalSet(u16);

impl SignalSet {
   pub const fn empty() -> Self {
      Self(0)
   }

   pub fn insert(&mut self, signal: Signal) {
      self.0 |= 1 << signal as u8;
   }

   pub const fn contains(&self, signal: Signal) -> bool {
      self.0 & (1 << signal as u8) != 0
   }

   pub const fn is_empty(&self) -> bool {
      self.0 == 0
   }

   pub fn iter(&self) -> impl Iterator<Item = Signal> + '_ {
      (0..16u8)
         .filter(|bit| self.0 & (1 << bit) != 0)
         .filter_map(Signal::from_repr)
   }
}

impl fmt::Debug for SignalSet {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_set().entries(self.iter()).finish()
   }
}

impl FromIterator<Signal> for SignalSet {
   fn from_iter<I: IntoIterator<Item = Signal>>(iter: I) -> Self {
      let mut set = Self::empty();
      for signal in iter {
         set.insert(signal);
      }
      set
   }
}

/// Non-blocking eventfd shared by both halves of a channel.
#[derive(Debug)]
struct Waker(OwnedFd);

impl Waker {
   fn new() -> io::Result<Self> {
      // SAFETY: eventfd takes no pointers.
      let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
      if fd < 0 {
         return Err(io::Error::last_os_error());
      }
      // SAFETY: `fd` was just created and is owned by nobody else.
      Ok(Self(unsafe { OwnedFd::from_raw_fd(fd) }))
   }

   fn wake(&self) {
      let one = 1u64;
      // SAFETY: writes the 8 bytes of a live u64. A saturated counter
      // already means "wake up", so the result is irrelevant.
      unsafe {
         libc::write(self.0.as_raw_fd(), (&raw const one).cast(), size_of::<u64>());
      }
   }

   fn reset(&self) {
      let mut value = 0u64;
      // SAFETY: reads at most 8 bytes into a live u64.
      unsafe {
         libc::read(self.0.as_raw_fd(), (&raw mut value).cast(), size_of::<u64>());
      }
   }
}

/// Sending half of a signal channel. Cheaply cloneable.
#[derive(Debug, Clone)]
pub struct SignalSender {
   tx: channel::Sender<Signal>,
   waker: Arc<Waker>,
}

impl SignalSender {
   /// Queues `signal` without blocking.
   pub fn send(&self, signal: Signal) -> Result<()> {
      match self.tx.try_send(signal) {
         Ok(()) => {},
         Err(TrySendError::Full(_)) => trace!("Signal queue full, coalescing {signal}"),
         Err(TrySendError::Disconnected(_)) => {
            return Err(TransportError::SignalDeliveryFailure("signal channel closed"));
         },
      }
      self.waker.wake();
      Ok(())
   }
}

/// Receiving half of a signal channel.
#[derive(Debug, Clone)]
pub struct SignalReceiver {
   rx: channel::Receiver<Signal>,
   waker: Arc<Waker>,
}

impl SignalReceiver {
   /// Waits up to `timeout` for a wakeup and returns everything queued.
   ///
   /// An empty set means the timeout elapsed.
   pub fn wait(&self, timeout: Duration) -> SignalSet {
      self.wait_ready(&mut [], timeout)
   }

   /// Like [`SignalReceiver::wait`], but also returns early once one of
   /// `fds` is ready. Their `revents` are filled in on return.
   pub fn wait_ready(&self, fds: &mut [libc::pollfd], timeout: Duration) -> SignalSet {
      let mut polled: SmallVec<[libc::pollfd; 5]> = SmallVec::with_capacity(fds.len() + 1);
      polled.push(libc::pollfd {
         fd: self.waker.0.as_raw_fd(),
         events: libc::POLLIN,
         revents: 0,
      });
      polled.extend(fds.iter().map(|fd| libc::pollfd { revents: 0, ..*fd }));

      let millis = timeout.as_micros().div_ceil(1000).min(libc::c_int::MAX as u128) as libc::c_int;
      // SAFETY: `polled` is a live, correctly sized array of pollfd.
      let rc = unsafe { libc::poll(polled.as_mut_ptr(), polled.len() as libc::nfds_t, millis) };
      if rc < 0 {
         let e = io::Error::last_os_error();
         if e.kind() != io::ErrorKind::Interrupted {
            warn!("Worker poll failed: {e}");
            std::thread::sleep(timeout);
         }
      }

      for (fd, result) in fds.iter_mut().zip(&polled[1..]) {
         fd.revents = if rc > 0 { result.revents } else { 0 };
      }
      // Reset before draining, so a send racing with us leaves the eventfd
      // readable for the next wait.
      if rc > 0 && polled[0].revents != 0 {
         self.waker.reset();
      }
      self.rx.try_iter().collect()
   }

   /// Discards queued signals.
   pub fn clear(&self) {
      self.waker.reset();
      for _ in self.rx.try_iter() {}
   }
}

/// Creates a signal channel with room for `depth` pending codes.
pub fn channel(depth: usize) -> io::Result<(SignalSender, SignalReceiver)> {
   let (tx, rx) = channel::bounded(depth.max(1));
   let waker = Arc::new(Waker::new()?);
   Ok((
      SignalSender {
         tx,
         waker: waker.clone(),
      },
      SignalReceiver { rx, waker },
   ))
}
