//! Fakes shared by unit tests.

use std::{
   collections::HashMap,
   os::{fd::OwnedFd, unix::net::UnixStream},
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicUsize, Ordering},
   },
   time::{Duration, Instant},
};

use bluer::Address;
use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use smol_str::SmolStr;

use crate::{
   bluetooth::link::Link,
   config::Config,
   device::DeviceContext,
   error::{Result, TransportError},
   event::{EventBus, EventSender, TransportEvent},
   transport::{
      Transport, TransportId,
      strategy::{LinkProvider, LinkRequest, ScoRouting},
   },
};

pub fn init_logging() {
   let _ = env_logger::builder().is_test(true).try_init();
}

pub fn test_address(last: u8) -> Address {
   Address::new([0x00, 0x1a, 0x7d, 0xda, 0x71, last])
}

pub fn test_config() -> Config {
   Config {
      io_poll_interval_ms: 1,
      join_timeout_ms: 2000,
      ..Config::default()
   }
}

pub fn context(links: &Arc<FakeLinks>, events: Option<&Arc<Collector>>) -> DeviceContext {
   let events = events.map(|events| events.clone() as EventSender);
   context_with(links, events, test_config())
}

pub fn context_with(
   links: &Arc<FakeLinks>,
   events: Option<EventSender>,
   config: Config,
) -> DeviceContext {
   init_logging();
   let provider: Arc<dyn LinkProvider> = links.clone();
   let context = DeviceContext::new(Arc::new(config), provider);
   match events {
      Some(events) => context.with_events(events),
      None => context,
   }
}

/// Link provider handing out Unix socket pairs. The remote ends are kept
/// until a test takes them.
#[derive(Default)]
pub struct FakeLinks {
   acquired: AtomicUsize,
   released: AtomicUsize,
   refuse: AtomicBool,
   routing: AtomicCell<ScoRouting>,
   requests: Mutex<Vec<(SmolStr, String)>>,
   peers: Mutex<HashMap<SmolStr, UnixStream>>,
}

impl FakeLinks {
   pub fn acquired(&self) -> usize {
      self.acquired.load(Ordering::SeqCst)
   }

   pub fn released(&self) -> usize {
      self.released.load(Ordering::SeqCst)
   }

   pub fn set_refuse(&self, refuse: bool) {
      self.refuse.store(refuse, Ordering::SeqCst);
   }

   pub fn set_routing(&self, routing: ScoRouting) {
      self.routing.store(routing);
   }

   /// Debug rendering of the link kind of every request, by path.
   pub fn requests(&self) -> Vec<(SmolStr, String)> {
      self.requests.lock().clone()
   }

   /// Takes the remote end of the link handed out for `path`.
   pub fn take_peer(&self, path: &str) -> UnixStream {
      self
         .peers
         .lock()
         .remove(path)
         .unwrap_or_else(|| panic!("no link for {path}"))
   }
}

impl LinkProvider for FakeLinks {
   fn acquire(&self, request: &LinkRequest<'_>) -> Result<Link> {
      self
         .requests
         .lock()
         .push((request.id.path.clone(), format!("{:?}", request.kind)));
      if self.refuse.load(Ordering::SeqCst) {
         return Err(TransportError::AcquisitionFailure("connection refused".into()));
      }
      let (local, peer) = UnixStream::pair()?;
      let link = Link::new(OwnedFd::from(local), 64, 64)?;
      self.peers.lock().insert(request.id.path.clone(), peer);
      self.acquired.fetch_add(1, Ordering::SeqCst);
      Ok(link)
   }

   fn release(&self, _id: &TransportId) {
      self.released.fetch_add(1, Ordering::SeqCst);
   }

   fn sco_routing(&self, _id: &TransportId) -> ScoRouting {
      self.routing.load()
   }
}

/// Event bus recording everything it is given.
#[derive(Default)]
pub struct Collector {
   events: Mutex<Vec<(SmolStr, TransportEvent)>>,
}

impl Collector {
   pub fn events(&self) -> Vec<(SmolStr, TransportEvent)> {
      self.events.lock().clone()
   }

   pub fn contains(&self, path: &str, event: &TransportEvent) -> bool {
      self
         .events
         .lock()
         .iter()
         .any(|(p, e)| p == path && e == event)
   }

   /// Polls until a matching event was seen or `timeout` elapsed.
   pub fn wait_for(
      &self,
      timeout: Duration,
      pred: impl Fn(&SmolStr, &TransportEvent) -> bool,
   ) -> bool {
      let deadline = Instant::now() + timeout;
      loop {
         if self.events.lock().iter().any(|(p, e)| pred(p, e)) {
            return true;
         }
         if Instant::now() >= deadline {
            return false;
         }
         std::thread::sleep(Duration::from_millis(2));
      }
   }
}

impl EventBus for Collector {
   fn emit(&self, transport: &Transport, event: TransportEvent) {
      self.events.lock().push((transport.path().clone(), event));
   }
}
