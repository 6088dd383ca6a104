//! Transport entity and lifecycle state machine.
//!
//! A transport is one Bluetooth link (A2DP stream, RFCOMM control channel
//! or SCO voice link) owned by a [`Device`]. It owns a worker thread while
//! it is pending, active or paused; the worker moves audio between the link
//! and the stream endpoints and is driven by coalescing signals.
//!
//! All state transitions are serialized by the transport's section mutex.
//! The worker reads the state lock-free and only takes the mutex to retire
//! itself after losing its link, backing off once cancellation has been
//! requested. A transition may therefore block on draining or joining the
//! worker without deadlock.

mod payload;
pub mod strategy;
mod worker;

use std::{
   fmt,
   os::fd::{OwnedFd, RawFd},
   sync::{
      Arc, Weak,
      atomic::{AtomicU32, Ordering},
   },
   thread::{self, JoinHandle},
   time::Duration,
};

use bluer::Address;
use crossbeam::{
   atomic::AtomicCell,
   channel::{self, RecvTimeoutError},
};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use serde_json::json;
use smol_str::SmolStr;

pub use payload::{
   A2DP_MAX_VOLUME, A2dpPayload, A2dpVolume, Command, HFP_IND_MAX, HfpIndicator, Payload,
   RfcommPayload, SCO_MAX_GAIN, ScoGain, ScoPayload,
};

use crate::{
   bluetooth::{
      codec::{self, CodecId},
      link::Link,
      pcm::PcmStream,
      profile::Profile,
   },
   config::Config,
   device::{Device, WeakDevice},
   error::{Result, TransportError},
   event::TransportEvent,
   sync::{
      cleanup::CleanupGuard,
      signal::{self, Signal, SignalReceiver, SignalSender},
   },
   transport::strategy::ResourceStrategy,
};

/// Longest command accepted by [`Transport::send_command`].
pub const MAX_COMMAND_LEN: usize = 31;

/// How long a retiring worker waits for the section before rechecking
/// for cancellation.
const RETIRE_BACKOFF: Duration = Duration::from_millis(10);

#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::IntoStaticStr,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransportType {
   #[strum(serialize = "A2DP")]
   A2dp,
   #[strum(serialize = "RFCOMM")]
   Rfcomm,
   #[strum(serialize = "SCO")]
   Sco,
}

#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Default,
   Serialize,
   strum::Display,
   strum::IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TransportState {
   /// Resources not acquired, no worker.
   #[default]
   Idle,
   /// Link acquired, worker waiting for the stream to start.
   Pending,
   /// Worker running, frames flowing.
   Active,
   /// Worker alive, flow halted.
   Paused,
   /// Eviction in progress. Terminal.
   Limbo,
}

impl TransportState {
   /// States in which a worker thread exists.
   pub const fn has_worker(self) -> bool {
      matches!(self, Self::Pending | Self::Active | Self::Paused)
   }
}

/// Identity supplied by the registration system. Never parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportId {
   pub owner: SmolStr,
   pub path: SmolStr,
}

impl fmt::Display for TransportId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.path)
   }
}

struct WorkerHandle {
   thread: JoinHandle<()>,
   // Disconnects when the worker returns.
   done: channel::Receiver<()>,
}

impl WorkerHandle {
   fn join(self, timeout: Duration) -> Result<()> {
      match self.done.recv_timeout(timeout) {
         Ok(()) | Err(RecvTimeoutError::Disconnected) => {
            if self.thread.join().is_err() {
               error!("Transport worker panicked");
            }
            Ok(())
         },
         // Dropping the handle detaches the thread.
         Err(RecvTimeoutError::Timeout) => Err(TransportError::ThreadJoinTimeout(timeout)),
      }
   }
}

#[derive(Default)]
struct Section {
   worker: Option<WorkerHandle>,
}

/// Shared state of a transport.
pub struct TransportInner {
   device: WeakDevice,
   address: Address,
   id: TransportId,
   profile: Profile,
   codec: AtomicCell<CodecId>,
   config: Arc<Config>,
   state: AtomicCell<TransportState>,
   section: Mutex<Section>,
   link: Mutex<Option<Arc<Link>>>,
   signal_tx: SignalSender,
   signal_rx: SignalReceiver,
   delay: AtomicU32,
   cleanup: CleanupGuard,
   strategy: Arc<dyn ResourceStrategy>,
   payload: Payload,
}

impl TransportInner {
   pub fn id(&self) -> &TransportId {
      &self.id
   }

   /// Address of the remote device.
   pub fn address(&self) -> Address {
      self.address
   }

   pub const fn ty(&self) -> TransportType {
      self.payload.ty()
   }

   pub fn profile(&self) -> Profile {
      self.profile
   }

   pub fn codec(&self) -> CodecId {
      self.codec.load()
   }

   pub fn state(&self) -> TransportState {
      self.state.load()
   }

   pub fn payload(&self) -> &Payload {
      &self.payload
   }

   pub fn cleanup(&self) -> &CleanupGuard {
      &self.cleanup
   }

   pub fn has_link(&self) -> bool {
      self.link.lock().is_some()
   }

   pub(crate) fn link(&self) -> Option<Arc<Link>> {
      self.link.lock().clone()
   }

   pub(crate) fn install_link(&self, link: Link) -> Arc<Link> {
      let link = Arc::new(link);
      *self.link.lock() = Some(link.clone());
      link
   }

   pub(crate) fn take_link(&self) -> Option<Arc<Link>> {
      self.link.lock().take()
   }
}

impl fmt::Debug for TransportInner {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Transport")
         .field("id", &self.id)
         .field("type", &self.ty())
         .field("profile", &self.profile)
         .field("state", &self.state())
         .field("strategy", &self.strategy)
         .finish_non_exhaustive()
   }
}

impl Drop for TransportInner {
   fn drop(&mut self) {
      // Reached only when nobody tore the transport down explicitly.
      self.cleanup.request_cancel();
      let _ = self.signal_tx.send(Signal::Shutdown);
      if self.section.get_mut().worker.take().is_some() {
         warn!("{}: dropped with a live worker, detaching it", self.id);
      }
      if let Some(drain) = self.payload.drain() {
         drain.disarm();
      }
      self.strategy.release(self);
   }
}

/// A Bluetooth transport.
///
/// This type is cheaply cloneable and thread-safe.
#[derive(Clone)]
pub struct Transport(Arc<TransportInner>);

/// Weak reference to a transport.
#[derive(Debug, Clone)]
pub struct WeakTransport(Weak<TransportInner>);

impl WeakTransport {
   pub fn new(transport: &Transport) -> Self {
      Self(Arc::downgrade(&transport.0))
   }

   pub fn upgrade(&self) -> Option<Transport> {
      self.0.upgrade().map(Transport)
   }
}

impl fmt::Debug for Transport {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      fmt::Debug::fmt(&self.0, f)
   }
}

impl PartialEq for Transport {
   fn eq(&self, other: &Self) -> bool {
      Arc::ptr_eq(&self.0, &other.0)
   }
}

impl Eq for Transport {}

impl Transport {
   fn new(
      device: &Device,
      owner: &str,
      path: &str,
      profile: Profile,
      codec: CodecId,
      payload: Payload,
   ) -> Result<Self> {
      let ty = payload.ty();
      let context = device.context();
      let strategy = strategy::for_transport(ty, profile, context.links.clone())?;
      let (signal_tx, signal_rx) = signal::channel(context.config.signal_queue_depth())?;

      let transport = Self(Arc::new(TransportInner {
         device: WeakDevice::new(device),
         address: device.address(),
         id: TransportId {
            owner: owner.into(),
            path: path.into(),
         },
         profile,
         codec: AtomicCell::new(codec),
         config: context.config.clone(),
         state: AtomicCell::new(TransportState::Idle),
         section: Mutex::new(Section::default()),
         link: Mutex::new(None),
         signal_tx,
         signal_rx,
         delay: AtomicU32::new(0),
         cleanup: CleanupGuard::new(),
         strategy,
         payload,
      }));

      device.register(transport.clone())?;
      debug!(
         "{}: new {ty} transport {path} ({profile}, {})",
         device.address(),
         codec::codec_name(codec, ty == TransportType::A2dp)
      );
      Ok(transport)
   }

   /// Creates an A2DP transport. The codec configuration is copied.
   pub fn new_a2dp(
      device: &Device,
      owner: &str,
      path: &str,
      profile: Profile,
      codec: CodecId,
      cconfig: &[u8],
   ) -> Result<Self> {
      let volume = device.context().config.a2dp_default_volume;
      let payload = Payload::A2dp(A2dpPayload::new(cconfig, volume));
      Self::new(device, owner, path, profile, codec, payload)
   }

   /// Creates an RFCOMM transport for a hands-free or headset profile.
   pub fn new_rfcomm(device: &Device, owner: &str, path: &str, profile: Profile) -> Result<Self> {
      let payload = Payload::Rfcomm(RfcommPayload::default());
      Self::new(device, owner, path, profile, codec::HFP_CODEC_UNDEFINED, payload)
   }

   /// Creates an SCO transport.
   pub fn new_sco(
      device: &Device,
      owner: &str,
      path: &str,
      profile: Profile,
      codec: CodecId,
   ) -> Result<Self> {
      let gain = device.context().config.sco_default_gain;
      let payload = Payload::Sco(ScoPayload::new(gain));
      Self::new(device, owner, path, profile, codec, payload)
   }

   pub fn downgrade(&self) -> WeakTransport {
      WeakTransport::new(self)
   }

   pub(crate) fn inner(&self) -> &TransportInner {
      &self.0
   }

   pub fn id(&self) -> &TransportId {
      &self.0.id
   }

   pub fn owner(&self) -> &SmolStr {
      &self.0.id.owner
   }

   pub fn path(&self) -> &SmolStr {
      &self.0.id.path
   }

   pub fn ty(&self) -> TransportType {
      self.0.payload.ty()
   }

   pub fn profile(&self) -> Profile {
      self.0.profile
   }

   pub fn codec(&self) -> CodecId {
      self.0.codec()
   }

   /// Records a renegotiated codec (HFP codec selection).
   pub fn set_codec(&self, codec: CodecId) {
      let prev = self.0.codec.swap(codec);
      if prev != codec {
         debug!("{}: codec {prev:#06x} -> {codec:#06x}", self.id());
      }
   }

   pub fn state(&self) -> TransportState {
      self.0.state()
   }

   pub fn payload(&self) -> &Payload {
      &self.0.payload
   }

   /// The owning device, unless it has already been destroyed.
   pub fn device(&self) -> Option<Device> {
      self.0.device.upgrade()
   }

   pub fn is_acquired(&self) -> bool {
      self.0.has_link()
   }

   pub fn is_worker_running(&self) -> bool {
      self
         .0
         .section
         .lock()
         .worker
         .as_ref()
         .is_some_and(|w| !w.thread.is_finished())
   }

   pub fn link_fd(&self) -> Option<RawFd> {
      self.0.link().map(|l| l.fd())
   }

   pub fn mtu_read(&self) -> usize {
      self.0.link().map_or(0, |l| l.mtu_read())
   }

   pub fn mtu_write(&self) -> usize {
      self.0.link().map_or(0, |l| l.mtu_write())
   }

   /// Overall path delay in 1/10 ms, including the AVDTP-reported delay.
   pub fn delay(&self) -> u32 {
      let base = self.0.delay.load(Ordering::Relaxed);
      match &self.0.payload {
         Payload::A2dp(a2dp) => base + u32::from(a2dp.delay()),
         _ => base,
      }
   }

   /// Sets the transfer/codec part of the path delay, in 1/10 ms.
   pub fn set_delay(&self, delay: u32) {
      self.0.delay.store(delay, Ordering::Relaxed);
   }

   /// Records a delay report received over AVDTP, in 1/10 ms.
   pub fn set_a2dp_delay(&self, delay: u16) -> Result<()> {
      let Payload::A2dp(a2dp) = &self.0.payload else {
         return Err(TransportError::NotSupported("delay report on non-A2DP transport"));
      };
      a2dp.delay.store(delay, Ordering::Relaxed);
      Ok(())
   }

   pub fn channels(&self) -> u32 {
      match &self.0.payload {
         Payload::A2dp(a2dp) => a2dp
            .cconfig
            .lock()
            .as_deref()
            .and_then(|cconfig| codec::a2dp_channels(self.codec(), cconfig))
            .unwrap_or(0),
         Payload::Rfcomm(_) => 0,
         Payload::Sco(_) => 1,
      }
   }

   pub fn sampling(&self) -> u32 {
      match &self.0.payload {
         Payload::A2dp(a2dp) => a2dp
            .cconfig
            .lock()
            .as_deref()
            .and_then(|cconfig| codec::a2dp_sampling(self.codec(), cconfig))
            .unwrap_or(0),
         Payload::Rfcomm(_) => 0,
         Payload::Sco(_) => codec::sco_sampling(self.codec()).unwrap_or(0),
      }
   }

   pub(crate) fn emit(&self, event: TransportEvent) {
      if let Some(device) = self.device()
         && let Some(events) = device.context().events.as_ref()
      {
         events.emit(self, event);
      }
   }

   // === Resources ===

   /// Acquires the link without changing state.
   pub fn acquire(&self) -> Result<()> {
      let section = self.0.section.lock();
      self.acquire_locked(&section)
   }

   fn acquire_locked(&self, _section: &MutexGuard<'_, Section>) -> Result<()> {
      if self.state() == TransportState::Limbo {
         return Err(TransportError::InvalidStateTransition {
            from: TransportState::Limbo,
            to: TransportState::Pending,
         });
      }
      self.0.strategy.acquire(&self.0).inspect_err(|e| {
         warn!("{}: {} failed: {e}", self.id(), self.0.strategy.name());
      })
   }

   /// Releases the link and stream endpoints.
   ///
   /// A transport with a worker is moved to idle first, so the worker never
   /// outlives its resources.
   pub fn release(&self) -> Result<()> {
      if self.state().has_worker() {
         return match self.set_state(TransportState::Idle) {
            // Another caller already moved it out of a running state.
            Err(TransportError::InvalidStateTransition { .. }) => Ok(()),
            other => other,
         };
      }
      let _section = self.0.section.lock();
      self.0.strategy.release(&self.0);
      Ok(())
   }

   // === State machine ===

   /// Moves the transport to `state`.
   pub fn set_state(&self, state: TransportState) -> Result<()> {
      let mut section = self.0.section.lock();
      let from = self.state();
      if from == TransportState::Limbo || from == state {
         return Err(TransportError::InvalidStateTransition { from, to: state });
      }
      debug!("{}: state {from} -> {state}", self.id());

      let result = match state {
         TransportState::Pending | TransportState::Active | TransportState::Paused => {
            self.enter_running(&mut section, from, state)
         },
         TransportState::Idle | TransportState::Limbo => {
            if from == TransportState::Active {
               self.drain_stream();
            }
            self.0.state.store(state);
            let joined = self.stop_worker(&mut section);
            self.0.strategy.release(&self.0);
            joined
         },
      };

      // A failed acquisition leaves the state untouched.
      if self.state() == state {
         drop(section);
         self.emit(TransportEvent::StateChanged { from, to: state });
      }
      result
   }

   fn enter_running(
      &self,
      section: &mut MutexGuard<'_, Section>,
      from: TransportState,
      to: TransportState,
   ) -> Result<()> {
      self.acquire_locked(section)?;
      self.0.state.store(to);

      if let Some(worker) = section.worker.take_if(|w| w.thread.is_finished()) {
         debug!("{}: reaping exited worker", self.id());
         if let Err(e) = worker.join(self.0.config.join_timeout()) {
            warn!("{}: {e}", self.id());
         }
      }

      if section.worker.is_none() {
         if let Err(e) = self.spawn_worker(section) {
            error!("{}: failed to start worker: {e}", self.id());
            self.0.state.store(from);
            if !from.has_worker() {
               self.0.strategy.release(&self.0);
            }
            return Err(e);
         }
         return Ok(());
      }

      let signal = match (from, to) {
         (_, TransportState::Paused) => {
            // Nobody waits for a drain across a pause.
            if let Some(drain) = self.0.payload.drain() {
               drain.complete();
            }
            Signal::PcmPause
         },
         (TransportState::Paused, TransportState::Active) => Signal::PcmResume,
         _ => Signal::LinkReady,
      };
      self.0.signal_tx.send(signal)
   }

   fn spawn_worker(&self, section: &mut MutexGuard<'_, Section>) -> Result<()> {
      self.0.cleanup.reset();
      self.0.signal_rx.clear();
      if let Some(drain) = self.0.payload.drain() {
         drain.arm();
      }

      let (done_tx, done_rx) = channel::bounded::<()>(0);
      let weak = self.downgrade();
      let signals = self.0.signal_rx.clone();
      let poll = self.0.config.io_poll_interval();
      let spawned = thread::Builder::new()
         .name(format!("bt-{}", self.ty()).to_lowercase())
         .spawn(move || {
            let _done = done_tx;
            worker::run(weak, signals, poll);
         });

      match spawned {
         Ok(thread) => {
            info!("{}: {} worker started", self.id(), self.ty());
            section.worker = Some(WorkerHandle {
               thread,
               done: done_rx,
            });
            Ok(())
         },
         Err(e) => {
            if let Some(drain) = self.0.payload.drain() {
               drain.disarm();
            }
            Err(e.into())
         },
      }
   }

   /// Cancels and joins the worker. Waiters on the drain are released in
   /// every case.
   fn stop_worker(&self, section: &mut MutexGuard<'_, Section>) -> Result<()> {
      let result = match section.worker.take() {
         // An event listener driving a transition from the worker thread.
         Some(worker) if worker.thread.thread().id() == thread::current().id() => {
            self.0.cleanup.request_cancel();
            debug!("{}: worker stopping itself", self.id());
            Ok(())
         },
         Some(worker) => {
            self.0.cleanup.request_cancel();
            if let Err(e) = self.0.signal_tx.send(Signal::Shutdown) {
               debug!("{}: shutdown signal not delivered: {e}", self.id());
            }
            let joined = worker.join(self.0.config.join_timeout());
            match &joined {
               Ok(()) => info!("{}: {} worker stopped", self.id(), self.ty()),
               Err(e) => {
                  error!("{}: {e}, forcing link shutdown", self.id());
                  if let Some(link) = self.0.link() {
                     link.shutdown();
                  }
               },
            }
            joined
         },
         None => Ok(()),
      };
      if let Some(drain) = self.0.payload.drain() {
         drain.disarm();
      }
      result
   }

   /// Called by a worker that lost its link, after it left its locked
   /// section. Moves the transport to idle and releases the link unless a
   /// teardown has already taken the worker over.
   fn retire_worker(&self) {
      let mut section = loop {
         if self.0.cleanup.is_cancelled() {
            return;
         }
         if let Some(section) = self.0.section.try_lock_for(RETIRE_BACKOFF) {
            break section;
         }
      };
      let from = self.state();
      let own = section
         .worker
         .as_ref()
         .is_some_and(|w| w.thread.thread().id() == thread::current().id());
      if !own || !from.has_worker() {
         return;
      }

      // Dropping our own handle detaches this thread, which is about to exit.
      section.worker = None;
      self.0.state.store(TransportState::Idle);
      self.0.strategy.release(&self.0);
      drop(section);

      info!("{}: {} worker retired, state {from} -> idle", self.id(), self.ty());
      self.emit(TransportEvent::StateChanged {
         from,
         to: TransportState::Idle,
      });
   }

   /// Forced teardown: evicts the transport, releases its resources, clears
   /// the partner backlink and removes it from the device.
   ///
   /// Unlike a transition to limbo, buffered audio is not drained.
   pub fn destroy(&self) {
      {
         let mut section = self.0.section.lock();
         let from = self.0.state.swap(TransportState::Limbo);
         if from != TransportState::Limbo {
            debug!("{}: state {from} -> limbo (teardown)", self.id());
         }
         if let Err(e) = self.stop_worker(&mut section) {
            warn!("{}: {e}", self.id());
         }
         self.0.strategy.release(&self.0);
      }
      self.unlink_partner();
      if let Some(device) = self.device() {
         device.detach(self);
      }
   }

   // === Signals ===

   /// Wakes the worker with `signal`. Ignored once the transport is evicted.
   pub fn send_signal(&self, signal: Signal) -> Result<()> {
      if self.state() == TransportState::Limbo {
         debug!("{}: ignoring {signal} in limbo", self.id());
         return Ok(());
      }
      self.0.signal_tx.send(signal)
   }

   /// Queues an out-of-band command on the control channel.
   ///
   /// SCO transports forward the command to their RFCOMM partner.
   pub fn send_command(&self, command: &str) -> Result<()> {
      match &self.0.payload {
         Payload::Rfcomm(rfcomm) => {
            let mut queued = Command::new();
            queued
               .push_str(command)
               .map_err(|()| TransportError::CommandTooLong(command.len()))?;
            if self.state() == TransportState::Limbo {
               debug!("{}: dropping command in limbo", self.id());
               return Ok(());
            }
            rfcomm.commands.lock().push_back(queued);
            self.send_signal(Signal::SendCommand)
         },
         Payload::Sco(_) => self
            .rfcomm()
            .ok_or(TransportError::NotSupported("SCO transport has no RFCOMM partner"))?
            .send_command(command),
         Payload::A2dp(_) => Err(TransportError::NotSupported("commands on A2DP transport")),
      }
   }

   /// Waits until the worker has flushed the playback stream.
   ///
   /// Returns at once when the transport is not active or has no worker.
   pub fn drain_pcm(&self) -> Result<()> {
      if self.state() != TransportState::Active {
         return Ok(());
      }
      self.drain_stream();
      Ok(())
   }

   fn drain_stream(&self) {
      let Some(drain) = self.0.payload.drain() else {
         return;
      };
      let Some(ticket) = drain.request() else {
         return;
      };
      // The worker polls for pending drains, a lost wakeup only adds latency.
      if let Err(e) = self.0.signal_tx.send(Signal::PcmSync) {
         debug!("{}: sync signal not delivered: {e}", self.id());
      }
      drain.wait(ticket);
      debug!("{}: drained", self.id());
   }

   // === Stream endpoints ===

   /// Hands a stream endpoint from the audio backend to the transport.
   pub fn attach_pcm(&self, stream: PcmStream, fd: OwnedFd, client: i32) -> Result<()> {
      let pcm = self
         .0
         .payload
         .pcm(stream)
         .ok_or(TransportError::NotSupported("no such stream on transport"))?;
      pcm.lock().attach(fd, client)?;
      debug!("{}: {stream} stream opened by client {client}", self.id());
      self.send_signal(Signal::PcmOpen)
   }

   /// Closes a stream endpoint. Returns whether one was open.
   pub fn release_pcm(&self, stream: PcmStream) -> Result<bool> {
      let pcm = self
         .0
         .payload
         .pcm(stream)
         .ok_or(TransportError::NotSupported("no such stream on transport"))?;
      let released = pcm.lock().release();
      if released {
         debug!("{}: {stream} stream closed", self.id());
         self.send_signal(Signal::PcmClose)?;
      }
      Ok(released)
   }

   pub fn pcm_fd(&self, stream: PcmStream) -> Option<RawFd> {
      self.0.payload.pcm(stream).and_then(|pcm| pcm.lock().fd())
   }

   // === Volume ===

   /// Sets software volume of both A2DP channels, clamped to 0–127.
   pub fn set_volume(&self, ch1: u8, ch2: u8) -> Result<()> {
      let Payload::A2dp(a2dp) = &self.0.payload else {
         return Err(TransportError::NotSupported("volume on non-A2DP transport"));
      };
      let mut volume = a2dp.volume();
      volume.ch1_volume = ch1.min(A2DP_MAX_VOLUME);
      volume.ch2_volume = ch2.min(A2DP_MAX_VOLUME);
      self.apply_a2dp_volume(a2dp, volume)
   }

   pub fn set_mute(&self, ch1: bool, ch2: bool) -> Result<()> {
      match &self.0.payload {
         Payload::A2dp(a2dp) => {
            let mut volume = a2dp.volume();
            volume.ch1_muted = ch1;
            volume.ch2_muted = ch2;
            self.apply_a2dp_volume(a2dp, volume)
         },
         Payload::Sco(sco) => {
            let mut gain = sco.gain();
            gain.spk_muted = ch1;
            gain.mic_muted = ch2;
            self.apply_sco_gain(sco, gain)
         },
         Payload::Rfcomm(_) => Err(TransportError::NotSupported("mute on RFCOMM transport")),
      }
   }

   fn apply_a2dp_volume(&self, a2dp: &A2dpPayload, volume: A2dpVolume) -> Result<()> {
      if a2dp.volume.swap(volume) != volume {
         self.send_signal(Signal::SetVolume)?;
         self.emit(TransportEvent::VolumeChanged);
      }
      Ok(())
   }

   /// Sets speaker and microphone gain of an SCO transport, clamped to 0–15.
   pub fn set_gain(&self, spk: u8, mic: u8) -> Result<()> {
      let Payload::Sco(sco) = &self.0.payload else {
         return Err(TransportError::NotSupported("gain on non-SCO transport"));
      };
      let mut gain = sco.gain();
      gain.spk_gain = spk.min(SCO_MAX_GAIN);
      gain.mic_gain = mic.min(SCO_MAX_GAIN);
      self.apply_sco_gain(sco, gain)
   }

   fn apply_sco_gain(&self, sco: &ScoPayload, gain: ScoGain) -> Result<()> {
      let prev = sco.gain.swap(gain);
      if prev == gain {
         return Ok(());
      }
      self.send_signal(Signal::SetVolume)?;
      self.emit(TransportEvent::VolumeChanged);

      // Report the change to the remote side over the control channel.
      let Some(rfcomm) = self.rfcomm() else {
         return Ok(());
      };
      let prefix = if self.profile().is_gateway() { "+" } else { "AT+" };
      if prev.effective_spk() != gain.effective_spk() {
         rfcomm.send_command(&format!("{prefix}VGS={}", gain.effective_spk()))?;
      }
      if prev.effective_mic() != gain.effective_mic() {
         rfcomm.send_command(&format!("{prefix}VGM={}", gain.effective_mic()))?;
      }
      Ok(())
   }

   // === RFCOMM state ===

   pub fn set_hfp_features(&self, features: u32) -> Result<()> {
      let Payload::Rfcomm(rfcomm) = &self.0.payload else {
         return Err(TransportError::NotSupported("features on non-RFCOMM transport"));
      };
      rfcomm.hfp_features.store(features, Ordering::Relaxed);
      Ok(())
   }

   pub fn set_indicator(&self, indicator: HfpIndicator, value: u8) -> Result<()> {
      let Payload::Rfcomm(rfcomm) = &self.0.payload else {
         return Err(TransportError::NotSupported("indicators on non-RFCOMM transport"));
      };
      rfcomm.indicators.lock()[indicator as usize] = value;
      Ok(())
   }

   // === RFCOMM <-> SCO pairing ===

   /// Links an RFCOMM transport with the SCO transport it controls.
   ///
   /// Both must belong to the same device. Previous partners of either side
   /// are unlinked first.
   pub fn pair(rfcomm: &Self, sco: &Self) -> Result<()> {
      let (Payload::Rfcomm(r), Payload::Sco(s)) = (&rfcomm.0.payload, &sco.0.payload) else {
         return Err(TransportError::NotSupported("pairing requires RFCOMM and SCO"));
      };
      let device = rfcomm.device().ok_or(TransportError::DeviceGone)?;
      if !sco.device().is_some_and(|d| d == device) {
         return Err(TransportError::NotSupported("pairing across devices"));
      }
      if rfcomm.state() == TransportState::Limbo || sco.state() == TransportState::Limbo {
         return Err(TransportError::NotSupported("pairing evicted transport"));
      }

      rfcomm.unlink_partner();
      sco.unlink_partner();
      *r.sco.lock() = Some(sco.path().clone());
      *s.rfcomm.lock() = Some(rfcomm.path().clone());
      debug!("{}: paired with {}", rfcomm.id(), sco.id());
      Ok(())
   }

   fn partner_path(&self) -> Option<SmolStr> {
      match &self.0.payload {
         Payload::Rfcomm(rfcomm) => rfcomm.sco_path(),
         Payload::Sco(sco) => sco.rfcomm_path(),
         Payload::A2dp(_) => None,
      }
   }

   fn partner(&self) -> Option<Self> {
      let path = self.partner_path()?;
      self.device()?.lookup(&path).ok()
   }

   /// The SCO transport controlled by this RFCOMM transport.
   pub fn sco(&self) -> Option<Self> {
      matches!(self.0.payload, Payload::Rfcomm(_))
         .then(|| self.partner())
         .flatten()
   }

   /// The RFCOMM transport controlling this SCO transport.
   pub fn rfcomm(&self) -> Option<Self> {
      matches!(self.0.payload, Payload::Sco(_))
         .then(|| self.partner())
         .flatten()
   }

   /// Clears the backlink on both sides of a pair.
   fn unlink_partner(&self) {
      let partner = self.partner();
      let own_path = self.path();
      match &self.0.payload {
         Payload::Rfcomm(rfcomm) => *rfcomm.sco.lock() = None,
         Payload::Sco(sco) => *sco.rfcomm.lock() = None,
         Payload::A2dp(_) => return,
      }
      let Some(partner) = partner else {
         return;
      };
      let backlink = match &partner.0.payload {
         Payload::Rfcomm(rfcomm) => &rfcomm.sco,
         Payload::Sco(sco) => &sco.rfcomm,
         Payload::A2dp(_) => return,
      };
      let mut backlink = backlink.lock();
      if backlink.as_ref() == Some(own_path) {
         *backlink = None;
         debug!("{}: unpaired from {}", partner.id(), self.id());
      }
   }

   /// Converts the transport state to a JSON representation.
   pub fn to_json(&self) -> serde_json::Value {
      let mut info = json!({
         "type": self.ty(),
         "owner": self.owner().as_str(),
         "path": self.path().as_str(),
         "profile": self.profile().to_str(),
         "codec": codec::codec_name(self.codec(), self.ty() == TransportType::A2dp),
         "state": self.state(),
         "channels": self.channels(),
         "sampling": self.sampling(),
         "delay": self.delay(),
         "acquired": self.is_acquired(),
         "mtu": [self.mtu_read(), self.mtu_write()],
      });
      info["payload"] = self.0.payload.to_json();
      info
   }
}

#[cfg(test)]
mod tests {
   use std::{
      io::{ErrorKind, Read, Write},
      os::unix::net::UnixStream,
      thread,
      time::Instant,
   };

   use super::*;
   use crate::{
      event::{EventBus, EventSender},
      testing::{Collector, FakeLinks, context, context_with, test_address, test_config},
      transport::strategy::ScoRouting,
   };

   const SBC_44100_STEREO: [u8; 4] = [0x21, 0x15, 0x02, 0x35];
   const WAIT: Duration = Duration::from_secs(2);

   struct Fixture {
      links: Arc<FakeLinks>,
      events: Arc<Collector>,
      device: Device,
   }

   fn fixture() -> Fixture {
      let links = Arc::new(FakeLinks::default());
      let events = Arc::new(Collector::default());
      let device = Device::new(0, test_address(0x13), "Headset", context(&links, Some(&events)));
      Fixture {
         links,
         events,
         device,
      }
   }

   impl Fixture {
      fn a2dp(&self, path: &str, profile: Profile) -> Transport {
         Transport::new_a2dp(
            &self.device,
            ":1.1",
            path,
            profile,
            codec::A2DP_CODEC_SBC,
            &SBC_44100_STEREO,
         )
         .unwrap()
      }

      fn rfcomm(&self, path: &str, profile: Profile) -> Transport {
         Transport::new_rfcomm(&self.device, ":1.1", path, profile).unwrap()
      }

      fn sco(&self, path: &str, profile: Profile, codec: CodecId) -> Transport {
         Transport::new_sco(&self.device, ":1.1", path, profile, codec).unwrap()
      }
   }

   /// Attaches a stream endpoint and returns the client side of it.
   fn attach(t: &Transport, stream: PcmStream) -> UnixStream {
      let (local, client) = UnixStream::pair().unwrap();
      t.attach_pcm(stream, OwnedFd::from(local), 42).unwrap();
      client
   }

   fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
      let deadline = Instant::now() + WAIT;
      while Instant::now() < deadline {
         if cond() {
            return true;
         }
         thread::sleep(Duration::from_millis(2));
      }
      cond()
   }

   fn rfcomm_payload(t: &Transport) -> &RfcommPayload {
      match t.payload() {
         Payload::Rfcomm(payload) => payload,
         other => panic!("not an RFCOMM payload: {other:?}"),
      }
   }

   fn sco_payload(t: &Transport) -> &ScoPayload {
      match t.payload() {
         Payload::Sco(payload) => payload,
         other => panic!("not an SCO payload: {other:?}"),
      }
   }

   #[test]
   fn test_a2dp_lifecycle() {
      let f = fixture();
      let t = f.a2dp("/a2dp", Profile::A2dpSource);
      assert_eq!(t.ty(), TransportType::A2dp);
      assert_eq!(t.channels(), 2);
      assert_eq!(t.sampling(), 44100);
      assert_eq!(t.state(), TransportState::Idle);
      assert!(!t.is_worker_running());

      t.set_state(TransportState::Active).unwrap();
      assert!(t.is_worker_running());
      assert!(t.is_acquired());
      assert_eq!(t.mtu_write(), 64);
      assert_eq!(f.links.acquired(), 1);

      let mut peer = f.links.take_peer("/a2dp");
      let mut client = attach(&t, PcmStream::A2dp);
      client.write_all(&[0x5a; 200]).unwrap();
      let mut frames = [0u8; 200];
      peer.read_exact(&mut frames).unwrap();
      assert!(frames.iter().all(|&b| b == 0x5a));

      t.set_state(TransportState::Idle).unwrap();
      assert!(!t.is_worker_running());
      assert!(!t.is_acquired());
      assert_eq!(t.pcm_fd(PcmStream::A2dp), None);
      assert_eq!(f.links.released(), 1);
      // The codec configuration outlives idle periods.
      assert_eq!(t.channels(), 2);

      t.destroy();
      assert_eq!(t.state(), TransportState::Limbo);
      assert_eq!(f.device.transport_count(), 0);
      assert_eq!(t.channels(), 0);
      assert_eq!(f.links.released(), 1);
      assert!(f.events.contains("/a2dp", &TransportEvent::StateChanged {
         from: TransportState::Active,
         to: TransportState::Idle,
      }));
   }

   #[test]
   fn test_release_is_idempotent() {
      let f = fixture();
      let t = f.a2dp("/a2dp", Profile::A2dpSource);

      t.release().unwrap();
      assert_eq!(f.links.released(), 0);

      t.acquire().unwrap();
      t.acquire().unwrap();
      assert_eq!(f.links.acquired(), 1);

      t.release().unwrap();
      t.release().unwrap();
      assert_eq!(f.links.released(), 1);
      assert_eq!(t.state(), TransportState::Idle);
   }

   #[test]
   fn test_acquisition_failure_stays_idle() {
      let f = fixture();
      f.links.set_refuse(true);
      let t = f.a2dp("/a2dp", Profile::A2dpSource);

      let err = t.set_state(TransportState::Active).unwrap_err();
      assert!(matches!(err, TransportError::AcquisitionFailure(_)));
      assert_eq!(t.state(), TransportState::Idle);
      assert!(!t.is_worker_running());
      assert!(!t.is_acquired());
      assert!(f.events.events().is_empty());

      f.links.set_refuse(false);
      t.set_state(TransportState::Active).unwrap();
      assert!(t.is_worker_running());

      t.release().unwrap();
      assert_eq!(t.state(), TransportState::Idle);
      assert!(!t.is_worker_running());
      assert_eq!(f.links.released(), 1);
   }

   #[test]
   fn test_invalid_transitions() {
      let f = fixture();
      let t = f.rfcomm("/rfcomm", Profile::HspHs);

      assert!(matches!(
         t.set_state(TransportState::Idle),
         Err(TransportError::InvalidStateTransition {
            from: TransportState::Idle,
            to: TransportState::Idle,
         })
      ));

      t.set_state(TransportState::Pending).unwrap();
      t.set_state(TransportState::Active).unwrap();
      assert!(t.set_state(TransportState::Active).is_err());

      t.set_state(TransportState::Limbo).unwrap();
      assert!(!t.is_worker_running());
      assert!(matches!(
         t.set_state(TransportState::Active),
         Err(TransportError::InvalidStateTransition {
            from: TransportState::Limbo,
            ..
         })
      ));
      assert!(t.acquire().is_err());

      // Evicted transports swallow signals.
      t.send_signal(Signal::PcmOpen).unwrap();
      assert_eq!(f.links.acquired(), 1);
      assert_eq!(f.links.released(), 1);
   }

   #[test]
   fn test_profile_checked_at_construction() {
      let f = fixture();
      let err = Transport::new_rfcomm(&f.device, ":1.1", "/rfcomm", Profile::A2dpSink).unwrap_err();
      assert!(matches!(err, TransportError::InvalidProfile { kind: "RFCOMM", .. }));
      assert_eq!(f.device.transport_count(), 0);
   }

   #[test]
   fn test_pause_halts_flow() {
      let f = fixture();
      let t = f.a2dp("/a2dp", Profile::A2dpSource);

      t.set_state(TransportState::Paused).unwrap();
      assert!(t.is_worker_running());

      let mut peer = f.links.take_peer("/a2dp");
      peer.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
      let mut client = attach(&t, PcmStream::A2dp);
      client.write_all(&[3u8; 32]).unwrap();

      let mut buf = [0u8; 32];
      let err = peer.read(&mut buf).unwrap_err();
      assert!(matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut));

      t.set_state(TransportState::Active).unwrap();
      peer.set_read_timeout(None).unwrap();
      peer.read_exact(&mut buf).unwrap();
      assert_eq!(buf, [3u8; 32]);

      t.set_state(TransportState::Paused).unwrap();
      assert!(t.is_worker_running());
      t.destroy();
      assert!(!t.is_worker_running());
      assert_eq!(f.links.released(), 1);
   }

   #[test]
   fn test_client_hangup_closes_stream() {
      let f = fixture();
      let t = f.a2dp("/a2dp", Profile::A2dpSource);
      t.set_state(TransportState::Active).unwrap();
      let _peer = f.links.take_peer("/a2dp");

      let client = attach(&t, PcmStream::A2dp);
      assert!(t.pcm_fd(PcmStream::A2dp).is_some());
      drop(client);

      assert!(f.events.wait_for(WAIT, |path, event| {
         path == "/a2dp" && *event == TransportEvent::PcmClosed(PcmStream::A2dp)
      }));
      assert_eq!(t.pcm_fd(PcmStream::A2dp), None);
      assert!(t.is_worker_running());
      assert!(matches!(
         t.release_pcm(PcmStream::Mic),
         Err(TransportError::NotSupported(_))
      ));
   }

   #[test]
   fn test_a2dp_sink_delivers_audio() {
      let f = fixture();
      let t = f.a2dp("/sink", Profile::A2dpSink);
      t.set_state(TransportState::Active).unwrap();

      let mut peer = f.links.take_peer("/sink");
      let mut client = attach(&t, PcmStream::A2dp);
      peer.write_all(&[9u8; 48]).unwrap();

      let mut buf = [0u8; 48];
      client.read_exact(&mut buf).unwrap();
      assert_eq!(buf, [9u8; 48]);

      // Nothing to flush on the receiving side.
      t.drain_pcm().unwrap();
      assert!(t.release_pcm(PcmStream::A2dp).unwrap());
      assert!(!t.release_pcm(PcmStream::A2dp).unwrap());
   }

   #[test]
   fn test_link_loss_retires_worker() {
      let f = fixture();
      let t = f.a2dp("/a2dp", Profile::A2dpSource);
      t.set_state(TransportState::Active).unwrap();
      drop(f.links.take_peer("/a2dp"));

      assert!(f.events.wait_for(WAIT, |path, event| {
         path == "/a2dp"
            && *event
               == TransportEvent::StateChanged {
                  from: TransportState::Active,
                  to: TransportState::Idle,
               }
      }));
      assert!(f.events.contains("/a2dp", &TransportEvent::LinkLost));
      assert_eq!(t.state(), TransportState::Idle);
      assert!(!t.is_worker_running());
      assert!(!t.is_acquired());
      assert_eq!(f.links.released(), 1);

      let started = Instant::now();
      t.drain_pcm().unwrap();
      assert!(started.elapsed() < Duration::from_millis(500));

      // A fresh link brings up a fresh worker.
      t.set_state(TransportState::Paused).unwrap();
      assert!(t.is_worker_running());
      assert_eq!(f.links.acquired(), 2);
      t.set_state(TransportState::Active).unwrap();

      let mut peer = f.links.take_peer("/a2dp");
      let mut client = attach(&t, PcmStream::A2dp);
      client.write_all(&[4u8; 64]).unwrap();
      let mut buf = [0u8; 64];
      peer.read_exact(&mut buf).unwrap();
      assert_eq!(buf, [4u8; 64]);

      t.set_state(TransportState::Idle).unwrap();
      assert_eq!(f.links.released(), 2);
   }

   /// Listener holding the worker inside `emit` until told to go on.
   struct Gate {
      entered: channel::Sender<()>,
      open: channel::Receiver<()>,
   }

   impl EventBus for Gate {
      fn emit(&self, _transport: &Transport, event: TransportEvent) {
         if let TransportEvent::CommandReceived(_) = event {
            let _ = self.entered.send(());
            let _ = self.open.recv();
         }
      }
   }

   #[test]
   fn test_join_timeout_still_tears_down() {
      let links = Arc::new(FakeLinks::default());
      let (entered_tx, entered) = channel::unbounded();
      let (open, open_rx) = channel::unbounded();
      let gate: EventSender = Arc::new(Gate {
         entered: entered_tx,
         open: open_rx,
      });
      let config = Config {
         join_timeout_ms: 50,
         ..test_config()
      };
      let device =
         Device::new(0, test_address(0x14), "Headset", context_with(&links, Some(gate), config));
      let t = Transport::new_rfcomm(&device, ":1.1", "/rfcomm", Profile::HfpAg).unwrap();

      t.set_state(TransportState::Active).unwrap();
      let mut peer = links.take_peer("/rfcomm");
      peer.write_all(b"AT+CIND?\r").unwrap();
      entered.recv_timeout(WAIT).unwrap();

      let started = Instant::now();
      let err = t.set_state(TransportState::Idle).unwrap_err();
      assert!(matches!(err, TransportError::ThreadJoinTimeout(_)));
      assert!(started.elapsed() < WAIT);
      assert_eq!(t.state(), TransportState::Idle);
      assert!(!t.is_acquired());
      assert_eq!(links.released(), 1);

      // Let go, the detached worker sees the cancellation and exits.
      open.send(()).unwrap();
      t.destroy();
      assert_eq!(t.state(), TransportState::Limbo);
      assert_eq!(links.released(), 1);
      assert_eq!(device.transport_count(), 0);
   }

   #[test]
   fn test_link_close_waits_for_locked_section() {
      let links = Arc::new(FakeLinks::default());
      let config = Config {
         join_timeout_ms: 20,
         ..test_config()
      };
      let device = Device::new(0, test_address(0x15), "Speaker", context_with(&links, None, config));
      let t = Transport::new_a2dp(
         &device,
         ":1.1",
         "/a2dp",
         Profile::A2dpSource,
         codec::A2DP_CODEC_SBC,
         &SBC_44100_STEREO,
      )
      .unwrap();
      t.set_state(TransportState::Active).unwrap();
      let _peer = links.take_peer("/a2dp");
      let mut client = attach(&t, PcmStream::A2dp);

      // Every active pass reads the stream, so the worker stalls on its
      // mutex inside the locked section.
      let pcm = t.payload().pcm(PcmStream::A2dp).unwrap();
      let guard = pcm.lock();
      client.write_all(&[1u8; 16]).unwrap();
      assert!(wait_until(|| t.inner().cleanup().is_locked()));

      let stopping = t.clone();
      let teardown = thread::spawn(move || stopping.destroy());
      thread::sleep(Duration::from_millis(100));
      // The join gave up long ago, the close is still deferred.
      assert!(!teardown.is_finished());
      assert!(t.is_acquired());
      assert_eq!(links.released(), 0);

      drop(guard);
      teardown.join().unwrap();
      assert!(!t.is_acquired());
      assert_eq!(links.released(), 1);
      assert_eq!(t.state(), TransportState::Limbo);
   }

   #[test]
   fn test_parallel_lifecycles() {
      const ROUNDS: usize = 5;
      let f = fixture();
      let transports: Vec<_> = (0..4)
         .map(|i| f.a2dp(&format!("/a2dp{i}"), Profile::A2dpSource))
         .collect();

      let started = Instant::now();
      let cycles: Vec<_> = transports
         .iter()
         .cloned()
         .map(|t| {
            thread::spawn(move || {
               for _ in 0..ROUNDS {
                  t.set_state(TransportState::Active).unwrap();
                  t.set_state(TransportState::Paused).unwrap();
                  t.set_state(TransportState::Idle).unwrap();
               }
            })
         })
         .collect();
      for cycle in cycles {
         cycle.join().unwrap();
      }
      let elapsed = started.elapsed();
      assert!(elapsed < WAIT, "{elapsed:?}");

      for t in &transports {
         assert_eq!(t.state(), TransportState::Idle);
         assert!(!t.is_worker_running());
         assert!(!t.is_acquired());
      }
      assert_eq!(f.links.acquired(), 4 * ROUNDS);
      assert_eq!(f.links.released(), 4 * ROUNDS);
   }

   #[test]
   fn test_blocked_drain_does_not_block_other_transports() {
      let f = fixture();
      let slow = f.a2dp("/slow", Profile::A2dpSource);
      let fast = f.a2dp("/fast", Profile::A2dpSource);
      slow.set_state(TransportState::Active).unwrap();
      fast.set_state(TransportState::Active).unwrap();
      let mut slow_peer = f.links.take_peer("/slow");
      let _fast_peer = f.links.take_peer("/fast");

      let mut client = attach(&slow, PcmStream::A2dp);
      client.write_all(&[1u8; 256]).unwrap();

      let (done_tx, done_rx) = channel::bounded(1);
      let draining = slow.clone();
      let waiter = thread::spawn(move || {
         draining.drain_pcm().unwrap();
         done_tx.send(()).unwrap();
      });

      // The remote end has not read anything yet, so the slow drain waits.
      fast.drain_pcm().unwrap();
      assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());

      let mut buf = [0u8; 256];
      slow_peer.read_exact(&mut buf).unwrap();
      done_rx.recv_timeout(WAIT).unwrap();
      waiter.join().unwrap();
   }

   #[test]
   fn test_concurrent_drains_track_the_slowest() {
      let f = fixture();
      let delays = [100u64, 200, 300].map(Duration::from_millis);
      let mut clients = Vec::new();
      let mut readers = Vec::new();
      let mut transports = Vec::new();

      for (i, delay) in delays.into_iter().enumerate() {
         let t = f.a2dp(&format!("/a2dp{i}"), Profile::A2dpSource);
         t.set_state(TransportState::Active).unwrap();
         let mut peer = f.links.take_peer(t.path());
         let mut client = attach(&t, PcmStream::A2dp);
         client.write_all(&[7u8; 256]).unwrap();
         clients.push(client);
         readers.push(thread::spawn(move || {
            thread::sleep(delay);
            let mut buf = [0u8; 256];
            peer.read_exact(&mut buf).unwrap();
            peer
         }));
         transports.push(t);
      }

      let started = Instant::now();
      let drains: Vec<_> = transports
         .iter()
         .cloned()
         .map(|t| {
            thread::spawn(move || {
               t.drain_pcm().unwrap();
               started.elapsed()
            })
         })
         .collect();
      let elapsed: Vec<_> = drains.into_iter().map(|d| d.join().unwrap()).collect();

      // The quickest stream is not held up by the others.
      assert!(elapsed[0] < Duration::from_millis(250), "{elapsed:?}");
      let total = started.elapsed();
      assert!(total < Duration::from_millis(550), "{total:?}");

      let _peers: Vec<_> = readers.into_iter().map(|r| r.join().unwrap()).collect();
   }

   #[test]
   fn test_sco_create_destroy_without_acquire() {
      let f = fixture();
      let sco = f.sco("/sco", Profile::HspAg, codec::HFP_CODEC_UNDEFINED);
      assert_eq!(sco.channels(), 1);
      assert_eq!(sco.sampling(), 8000);

      let started = Instant::now();
      sco.destroy();
      assert!(started.elapsed() < Duration::from_millis(100));
      assert!(!sco.is_worker_running());
      assert_eq!(f.links.acquired(), 0);
      assert_eq!(f.links.released(), 0);
      assert_eq!(f.device.transport_count(), 0);
   }

   #[test]
   fn test_sco_audio_both_ways() {
      let f = fixture();
      let sco = f.sco("/sco", Profile::HfpHf, codec::HFP_CODEC_CVSD);
      sco.set_state(TransportState::Active).unwrap();
      let mut peer = f.links.take_peer("/sco");
      let mut speaker = attach(&sco, PcmStream::Speaker);
      let mut mic = attach(&sco, PcmStream::Mic);

      speaker.write_all(&[0x11; 48]).unwrap();
      let mut buf = [0u8; 48];
      peer.read_exact(&mut buf).unwrap();
      assert_eq!(buf, [0x11; 48]);

      peer.write_all(&[0x22; 48]).unwrap();
      mic.read_exact(&mut buf).unwrap();
      assert_eq!(buf, [0x22; 48]);

      sco.set_state(TransportState::Idle).unwrap();
      assert_eq!(sco.pcm_fd(PcmStream::Speaker), None);
      assert_eq!(sco.pcm_fd(PcmStream::Mic), None);
      assert_eq!(f.links.requests()[0].1, "Sco { routing: Local, initiate: false }");
   }

   #[test]
   fn test_sco_keeps_up_with_voice_rate() {
      let links = Arc::new(FakeLinks::default());
      let device = Device::new(
         0,
         test_address(0x16),
         "Headset",
         context_with(&links, None, Config::default()),
      );
      let sco =
         Transport::new_sco(&device, ":1.1", "/sco", Profile::HfpAg, codec::HFP_CODEC_CVSD).unwrap();
      sco.set_state(TransportState::Active).unwrap();
      let mut peer = links.take_peer("/sco");
      let mut speaker = attach(&sco, PcmStream::Speaker);

      // One second of CVSD audio, 8 kHz 16-bit mono.
      let audio = vec![0x33u8; 16_000];
      let started = Instant::now();
      let writer = thread::spawn(move || {
         speaker.write_all(&audio).unwrap();
         speaker
      });
      let mut received = vec![0u8; 16_000];
      peer.read_exact(&mut received).unwrap();
      let elapsed = started.elapsed();
      assert!(elapsed < Duration::from_millis(500), "{elapsed:?}");
      assert!(received.iter().all(|&b| b == 0x33));
      let _speaker = writer.join().unwrap();
   }

   #[test]
   fn test_sco_routing_decided_on_acquire() {
      let f = fixture();
      f.links.set_routing(ScoRouting::External);
      let sco = f.sco("/sco", Profile::HfpAg, codec::HFP_CODEC_CVSD);

      sco.acquire().unwrap();
      assert!(sco_payload(&sco).is_external());
      assert_eq!(f.links.requests(), vec![(
         SmolStr::new("/sco"),
         "Sco { routing: External, initiate: true }".to_owned()
      )]);

      sco.release().unwrap();
      assert!(!sco_payload(&sco).is_external());
   }

   #[test]
   fn test_sco_commands_route_through_rfcomm() {
      let f = fixture();
      let rfcomm = f.rfcomm("/rfcomm", Profile::HfpAg);
      let sco = f.sco("/sco", Profile::HfpAg, codec::HFP_CODEC_MSBC);
      assert_eq!(sco.sampling(), 16000);
      assert_eq!(rfcomm.channels(), 0);
      assert!(matches!(
         sco.send_command("+CIEV: 1,1"),
         Err(TransportError::NotSupported(_))
      ));

      Transport::pair(&rfcomm, &sco).unwrap();
      assert_eq!(sco.rfcomm(), Some(rfcomm.clone()));
      assert_eq!(rfcomm.sco(), Some(sco.clone()));

      sco.send_command("+CIEV: 1,1").unwrap();
      assert_eq!(rfcomm_payload(&rfcomm).pending_commands(), 1);

      rfcomm.set_state(TransportState::Active).unwrap();
      let mut peer = f.links.take_peer("/rfcomm");
      let mut buf = [0u8; 14];
      peer.read_exact(&mut buf).unwrap();
      assert_eq!(&buf, b"\r\n+CIEV: 1,1\r\n");

      peer.write_all(b"AT+VGS=9\r").unwrap();
      assert!(f.events.wait_for(WAIT, |path, event| {
         path == "/rfcomm"
            && matches!(event, TransportEvent::CommandReceived(data) if data.as_slice() == b"AT+VGS=9\r")
      }));

      rfcomm.destroy();
      assert!(sco.rfcomm().is_none());
      assert!(sco_payload(&sco).rfcomm_path().is_none());
      assert!(matches!(
         sco.send_command("+CIEV: 1,0"),
         Err(TransportError::NotSupported(_))
      ));
      assert_eq!(f.device.transport_count(), 1);
   }

   #[test]
   fn test_command_length_bounded() {
      let f = fixture();
      let rfcomm = f.rfcomm("/rfcomm", Profile::HfpHf);
      let long = "A".repeat(MAX_COMMAND_LEN + 1);
      assert!(matches!(
         rfcomm.send_command(&long),
         Err(TransportError::CommandTooLong(32))
      ));
      rfcomm.send_command(&long[..MAX_COMMAND_LEN]).unwrap();
      assert_eq!(rfcomm_payload(&rfcomm).pending_commands(), 1);
   }

   #[test]
   fn test_sco_gain_reported_to_rfcomm() {
      let f = fixture();
      let rfcomm = f.rfcomm("/rfcomm", Profile::HfpAg);
      let sco = f.sco("/sco", Profile::HfpAg, codec::HFP_CODEC_CVSD);
      Transport::pair(&rfcomm, &sco).unwrap();

      sco.set_gain(20, 5).unwrap();
      assert_eq!(sco_payload(&sco).gain().spk_gain, SCO_MAX_GAIN);
      assert_eq!(sco_payload(&sco).gain().mic_gain, 5);
      assert_eq!(rfcomm_payload(&rfcomm).pending_commands(), 1);

      sco.set_mute(true, false).unwrap();
      assert_eq!(sco_payload(&sco).gain().effective_spk(), 0);
      assert_eq!(rfcomm_payload(&rfcomm).pending_commands(), 2);

      // Unchanged gain is not reported again.
      sco.set_gain(15, 5).unwrap();
      assert_eq!(rfcomm_payload(&rfcomm).pending_commands(), 2);
      assert!(f.events.contains("/sco", &TransportEvent::VolumeChanged));

      rfcomm.set_state(TransportState::Active).unwrap();
      let mut peer = f.links.take_peer("/rfcomm");
      let expected = b"\r\n+VGM=5\r\n\r\n+VGS=0\r\n";
      let mut buf = vec![0u8; expected.len()];
      peer.read_exact(&mut buf).unwrap();
      assert_eq!(buf, expected);
   }

   #[test]
   fn test_headset_gain_uses_at_commands() {
      let f = fixture();
      let rfcomm = f.rfcomm("/rfcomm", Profile::HspHs);
      let sco = f.sco("/sco", Profile::HspHs, codec::HFP_CODEC_UNDEFINED);
      Transport::pair(&rfcomm, &sco).unwrap();

      sco.set_gain(7, 15).unwrap();
      let queued: Vec<_> = rfcomm_payload(&rfcomm)
         .commands
         .lock()
         .iter()
         .map(|c| c.to_string())
         .collect();
      assert_eq!(queued, ["AT+VGS=7"]);
   }

   #[test]
   fn test_a2dp_volume_and_delay() {
      let f = fixture();
      let t = f.a2dp("/a2dp", Profile::A2dpSource);
      let Payload::A2dp(payload) = t.payload() else {
         panic!("not an A2DP payload");
      };
      assert_eq!(payload.volume().ch1_volume, A2DP_MAX_VOLUME);

      t.set_volume(200, 10).unwrap();
      assert_eq!(payload.volume(), A2dpVolume {
         ch1_muted: false,
         ch2_muted: false,
         ch1_volume: 127,
         ch2_volume: 10,
      });
      t.set_volume(127, 10).unwrap();
      t.set_mute(false, true).unwrap();
      let changes = f
         .events
         .events()
         .iter()
         .filter(|(_, e)| *e == TransportEvent::VolumeChanged)
         .count();
      assert_eq!(changes, 2);

      assert!(matches!(t.set_gain(1, 1), Err(TransportError::NotSupported(_))));
      assert!(matches!(t.send_command("AT"), Err(TransportError::NotSupported(_))));

      t.set_a2dp_delay(150).unwrap();
      t.set_delay(20);
      assert_eq!(t.delay(), 170);
   }

   #[test]
   fn test_rfcomm_indicators_and_features() {
      let f = fixture();
      let rfcomm = f.rfcomm("/rfcomm", Profile::HfpHf);
      rfcomm.set_hfp_features(0x3ef).unwrap();
      rfcomm.set_indicator(HfpIndicator::BattChg, 4).unwrap();

      let payload = rfcomm_payload(&rfcomm);
      assert_eq!(payload.hfp_features(), 0x3ef);
      assert_eq!(payload.indicator(HfpIndicator::BattChg), 4);
      assert_eq!(payload.indicator(HfpIndicator::Call), 0);
      assert_eq!(rfcomm.to_json()["payload"]["indicators"][7], 4);
   }

   #[test]
   fn test_json_snapshot() {
      let f = fixture();
      let t = f.a2dp("/a2dp", Profile::A2dpSource);

      let info = t.to_json();
      assert_eq!(info["type"], "A2DP");
      assert_eq!(info["state"], "idle");
      assert_eq!(info["profile"], "a2dp-source");
      assert_eq!(info["codec"], "SBC");
      assert_eq!(info["sampling"], 44100);
      assert_eq!(info["payload"]["cconfig"], "21150235");

      let device = f.device.to_json();
      assert_eq!(device["transports"][0]["path"], "/a2dp");
      assert!(device.get("battery").is_none());
   }
}
