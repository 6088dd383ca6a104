//! Transport worker thread.
//!
//! Every pass the worker upgrades its weak handle, enters a cleanup-locked
//! section and moves whatever data is ready between the link and the
//! stream endpoints. It then sleeps in `poll` on the signal eventfd plus
//! the descriptors it can make progress on. Events are emitted after the
//! section is left so listeners may call back into the transport.
//!
//! A worker that loses its link retires itself: the transport goes back to
//! idle and the link is released.

use std::{io, os::fd::RawFd, time::Duration};

use log::{debug, trace, warn};
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::{
   bluetooth::{
      link::{self, Link, Packet},
      pcm::{Pcm, PcmStream},
      profile::Profile,
   },
   event::TransportEvent,
   sync::signal::{Signal, SignalReceiver, SignalSet},
   transport::{
      A2dpPayload, Payload, RfcommPayload, ScoPayload, Transport, TransportState, WeakTransport,
   },
};

/// Wait between passes while no drain is pending.
const PARKED_WAIT: Duration = Duration::from_millis(200);

/// Audio kept for a client that is not reading. Older bytes are dropped.
const MAX_BACKLOG: usize = 64 * 1024;

type PollSet = SmallVec<[libc::pollfd; 4]>;

enum Flow {
   Continue,
   Exit,
}

enum Pull {
   Data,
   Idle,
   Closed,
}

pub(super) fn run(transport: WeakTransport, signals: SignalReceiver, poll: Duration) {
   let mut worker = Worker::default();
   // The first pass picks up whatever was queued before the worker started.
   let mut wait = Duration::ZERO;

   loop {
      let pending = signals.wait_ready(&mut worker.fds, wait);
      let Some(t) = transport.upgrade() else {
         debug!("Transport dropped, worker exiting");
         return;
      };
      let inner = t.inner();
      if pending.contains(Signal::Shutdown) || inner.state() == TransportState::Limbo {
         debug!("{}: worker shutting down", t.id());
         return;
      }

      let flow = {
         let Some(_lock) = inner.cleanup().lock() else {
            debug!("{}: worker cancelled", t.id());
            return;
         };
         let flow = worker.step(&t, pending);
         worker.watch(&t);
         flow
      };

      for event in worker.events.drain(..) {
         t.emit(event);
      }

      if let Flow::Exit = flow {
         if let Some(drain) = inner.payload().drain() {
            drain.disarm();
         }
         t.retire_worker();
         return;
      }

      let draining = inner.payload().drain().is_some_and(|d| d.is_pending());
      wait = if draining { poll } else { PARKED_WAIT };
   }
}

fn watch_fd(fds: &mut PollSet, fd: RawFd, events: libc::c_short) {
   fds.push(libc::pollfd {
      fd,
      events,
      revents: 0,
   });
}

#[derive(Default)]
struct Worker {
   scratch: Vec<u8>,
   /// Bytes read from a stream endpoint or command queue, not yet sent.
   outbound: Vec<u8>,
   /// Bytes received from the link, not yet delivered.
   inbound: Vec<u8>,
   events: Vec<TransportEvent>,
   /// Descriptors the next wait is interested in.
   fds: PollSet,
}

impl Worker {
   fn step(&mut self, t: &Transport, signals: SignalSet) -> Flow {
      let inner = t.inner();
      if !signals.is_empty() {
         trace!("{}: signals {signals:?}", t.id());
      }
      if signals.contains(Signal::PcmDrop) || signals.contains(Signal::PcmClose) {
         if !self.outbound.is_empty() || !self.inbound.is_empty() {
            debug!(
               "{}: dropping {} buffered bytes",
               t.id(),
               self.outbound.len() + self.inbound.len()
            );
         }
         self.outbound.clear();
         self.inbound.clear();
      }

      let Some(link) = inner.link() else {
         return Flow::Continue;
      };

      // Queue probe baseline, taken while nothing of ours is in flight.
      if let Payload::A2dp(a2dp) = inner.payload()
         && self.outbound.is_empty()
         && (a2dp.coutq_baseline().is_none() || signals.contains(Signal::PcmOpen))
      {
         a2dp.coutq_baseline.store(link.output_queue().ok());
      }

      if inner.state() != TransportState::Active {
         return Flow::Continue;
      }

      let scratch = link.mtu_read().max(link.mtu_write());
      if self.scratch.len() < scratch {
         self.scratch.resize(scratch, 0);
      }

      let result = match inner.payload() {
         Payload::A2dp(a2dp) if t.profile() == Profile::A2dpSource => {
            self.a2dp_source(t, a2dp, &link)
         },
         Payload::A2dp(a2dp) => self.a2dp_sink(t, a2dp, &link),
         Payload::Sco(sco) if sco.is_external() => {
            sco.spk_drained.complete();
            Ok(())
         },
         Payload::Sco(sco) => self.sco(t, sco, &link),
         Payload::Rfcomm(rfcomm) => self.rfcomm(t, rfcomm, &link),
      };

      match result {
         Ok(()) => Flow::Continue,
         Err(e) => {
            warn!("{}: {} link lost: {e}", t.id(), t.ty());
            self.events.push(TransportEvent::LinkLost);
            Flow::Exit
         },
      }
   }

   /// Collects the descriptors the next pass can make progress on. Outside
   /// the active state only signals wake the worker.
   fn watch(&mut self, t: &Transport) {
      self.fds.clear();
      let inner = t.inner();
      if inner.state() != TransportState::Active {
         return;
      }
      let Some(link) = inner.link() else {
         return;
      };

      let (source, sink) = match inner.payload() {
         Payload::A2dp(a2dp) if t.profile() == Profile::A2dpSource => (Some(&a2dp.pcm), None),
         Payload::A2dp(a2dp) => (None, Some(&a2dp.pcm)),
         // A telephony stack moves the audio of an external call.
         Payload::Sco(sco) if sco.is_external() => return,
         Payload::Sco(sco) => (Some(&sco.spk_pcm), Some(&sco.mic_pcm)),
         Payload::Rfcomm(_) => (None, None),
      };

      let mut events = libc::POLLIN;
      if !self.outbound.is_empty() {
         events |= libc::POLLOUT;
      }
      watch_fd(&mut self.fds, link.fd(), events);

      if let Some(pcm) = source
         && self.outbound.len() < link.mtu_write()
         && let Some(fd) = pcm.lock().fd()
      {
         watch_fd(&mut self.fds, fd, libc::POLLIN);
      }
      if let Some(pcm) = sink
         && !self.inbound.is_empty()
         && let Some(fd) = pcm.lock().fd()
      {
         watch_fd(&mut self.fds, fd, libc::POLLOUT);
      }
   }

   fn close_pcm(&mut self, t: &Transport, pcm: &Mutex<Pcm>, stream: PcmStream) {
      if pcm.lock().release() {
         debug!("{}: {stream} client hung up", t.id());
         self.events.push(TransportEvent::PcmClosed(stream));
      }
   }

   fn a2dp_source(&mut self, t: &Transport, a2dp: &A2dpPayload, link: &Link) -> io::Result<()> {
      let mtu = link.mtu_write();
      let mut idle = self.outbound.is_empty();
      if self.outbound.len() < mtu {
         match pull(&a2dp.pcm, &mut self.scratch[..mtu], &mut self.outbound) {
            Pull::Data => idle = false,
            Pull::Idle => {},
            Pull::Closed => self.close_pcm(t, &a2dp.pcm, PcmStream::A2dp),
         }
      }
      push(link, &mut self.outbound, mtu)?;

      // Nothing is expected from a sink, but the read notices a hang-up.
      let mtu = link.mtu_read();
      if let Some(n) = recv(link, &mut self.scratch[..mtu])? {
         trace!("{}: discarding {n} bytes from sink", t.id());
      }

      if idle
         && self.outbound.is_empty()
         && a2dp.drained.is_pending()
         && queue_flushed(link, a2dp.coutq_baseline())
      {
         a2dp.drained.complete();
         debug!("{}: playback flushed", t.id());
      }
      Ok(())
   }

   fn a2dp_sink(&mut self, t: &Transport, a2dp: &A2dpPayload, link: &Link) -> io::Result<()> {
      let mtu = link.mtu_read();
      if let Some(n) = recv(link, &mut self.scratch[..mtu])? {
         self.inbound.extend_from_slice(&self.scratch[..n]);
      }
      if !deliver(&a2dp.pcm, &mut self.inbound) {
         self.close_pcm(t, &a2dp.pcm, PcmStream::A2dp);
         self.inbound.clear();
      }
      // Playback is on the remote side, there is nothing to flush.
      a2dp.drained.complete();
      Ok(())
   }

   fn sco(&mut self, t: &Transport, sco: &ScoPayload, link: &Link) -> io::Result<()> {
      let mtu = link.mtu_write();
      let mut idle = self.outbound.is_empty();
      if self.outbound.len() < mtu {
         match pull(&sco.spk_pcm, &mut self.scratch[..mtu], &mut self.outbound) {
            Pull::Data => idle = false,
            Pull::Idle => {},
            Pull::Closed => self.close_pcm(t, &sco.spk_pcm, PcmStream::Speaker),
         }
      }
      push(link, &mut self.outbound, mtu)?;

      let mtu = link.mtu_read();
      if let Some(n) = recv(link, &mut self.scratch[..mtu])? {
         self.inbound.extend_from_slice(&self.scratch[..n]);
      }
      if !deliver(&sco.mic_pcm, &mut self.inbound) {
         self.close_pcm(t, &sco.mic_pcm, PcmStream::Mic);
         self.inbound.clear();
      }

      if idle && self.outbound.is_empty() && sco.spk_drained.is_pending() {
         sco.spk_drained.complete();
         debug!("{}: speaker flushed", t.id());
      }
      Ok(())
   }

   fn rfcomm(&mut self, t: &Transport, rfcomm: &RfcommPayload, link: &Link) -> io::Result<()> {
      {
         let mut queue = rfcomm.commands.lock();
         for command in queue.drain(..) {
            debug!("{}: -> {command}", t.id());
            frame(&mut self.outbound, &command, t.profile().is_gateway());
         }
      }
      push(link, &mut self.outbound, link.mtu_write())?;

      let mtu = link.mtu_read();
      if let Some(n) = recv(link, &mut self.scratch[..mtu])? {
         let data = Packet::from_slice(&self.scratch[..n]);
         debug!("{}: <- {}", t.id(), hex::encode(&data));
         self.events.push(TransportEvent::CommandReceived(data));
      }
      Ok(())
   }
}

/// Gateways send results as `\r\n<result>\r\n`, headsets send commands
/// terminated by a carriage return.
fn frame(out: &mut Vec<u8>, command: &str, gateway: bool) {
   if gateway {
      out.extend_from_slice(b"\r\n");
      out.extend_from_slice(command.as_bytes());
      out.extend_from_slice(b"\r\n");
   } else {
      out.extend_from_slice(command.as_bytes());
      out.push(b'\r');
   }
}

/// Reads what the client has written into `out`.
fn pull(pcm: &Mutex<Pcm>, scratch: &mut [u8], out: &mut Vec<u8>) -> Pull {
   let pcm = pcm.lock();
   match pcm.read(scratch) {
      Ok(0) => Pull::Closed,
      Ok(n) => {
         out.extend_from_slice(&scratch[..n]);
         Pull::Data
      },
      Err(e) if link::is_transient(&e) || e.kind() == io::ErrorKind::NotConnected => Pull::Idle,
      Err(e) => {
         warn!("Stream read failed: {e}");
         Pull::Closed
      },
   }
}

/// Hands received audio to the client. Returns `false` once the client is
/// gone. Without a client the audio is discarded.
fn deliver(pcm: &Mutex<Pcm>, buf: &mut Vec<u8>) -> bool {
   let pcm = pcm.lock();
   if !pcm.is_open() {
      buf.clear();
      return true;
   }
   if !buf.is_empty() {
      match pcm.write(buf) {
         Ok(n) => {
            buf.drain(..n);
         },
         Err(e) if link::is_transient(&e) => {},
         Err(e) => {
            debug!("Stream write failed: {e}");
            return false;
         },
      }
   }
   if buf.len() > MAX_BACKLOG {
      let excess = buf.len() - MAX_BACKLOG;
      buf.drain(..excess);
   }
   true
}

/// Sends `buf` in chunks of at most `mtu` bytes until the socket pushes back.
fn push(link: &Link, buf: &mut Vec<u8>, mtu: usize) -> io::Result<()> {
   let mut sent = 0;
   let mut result = Ok(());
   while sent < buf.len() {
      let end = (sent + mtu).min(buf.len());
      match link.send(&buf[sent..end]) {
         Ok(0) => {
            result = Err(io::ErrorKind::WriteZero.into());
            break;
         },
         Ok(n) => sent += n,
         Err(e) if link::is_transient(&e) => break,
         Err(e) => {
            result = Err(e);
            break;
         },
      }
   }
   buf.drain(..sent);
   result
}

/// Reads one chunk from the link. A hang-up is reported as an error.
fn recv(link: &Link, buf: &mut [u8]) -> io::Result<Option<usize>> {
   match link.recv(buf) {
      Ok(0) => Err(io::ErrorKind::UnexpectedEof.into()),
      Ok(n) => Ok(Some(n)),
      Err(e) if link::is_transient(&e) => Ok(None),
      Err(e) => Err(e),
   }
}

/// Whether the kernel queue is back at its idle level. An unusable probe
/// counts as flushed.
fn queue_flushed(link: &Link, baseline: Option<usize>) -> bool {
   match (link.output_queue(), baseline) {
      (Ok(value), Some(baseline)) => value == baseline,
      _ => true,
   }
}
