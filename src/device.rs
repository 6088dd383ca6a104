//! Remote device registry.
//!
//! A [`Device`] is created when a remote device is discovered and owns every
//! transport registered for it, keyed by transport path. Destroying the
//! device tears all of them down.

use std::{
   collections::HashMap,
   fmt,
   mem,
   sync::{Arc, Weak},
};

use bluer::Address;
use crossbeam::atomic::AtomicCell;
use log::{debug, info};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use smol_str::SmolStr;

use crate::{
   config::Config,
   error::{Result, TransportError},
   event::EventSender,
   transport::{Transport, strategy::LinkProvider},
};

/// HCI limit on remote name length, in bytes.
pub const MAX_NAME_LEN: usize = 248;

pub type DeviceName = heapless::String<MAX_NAME_LEN>;

/// Address-keyed map of devices kept by the control plane.
pub type DeviceMap = HashMap<Address, Device>;

/// Shared services handed to every device and its transports.
#[derive(Clone)]
pub struct DeviceContext {
   pub config: Arc<Config>,
   pub links: Arc<dyn LinkProvider>,
   pub events: Option<EventSender>,
}

impl DeviceContext {
   pub fn new(config: Arc<Config>, links: Arc<dyn LinkProvider>) -> Self {
      Self {
         config,
         links,
         events: None,
      }
   }

   #[must_use]
   pub fn with_events(mut self, events: EventSender) -> Self {
      self.events = Some(events);
      self
   }
}

impl fmt::Debug for DeviceContext {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("DeviceContext")
         .field("config", &self.config)
         .field("events", &self.events.is_some())
         .finish_non_exhaustive()
   }
}

/// Battery status as reported over the hands-free control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Battery {
   pub enabled: bool,
   /// Charge level, 0-100.
   pub level: u8,
}

/// Apple accessory extension state (`AT+XAPL`, `AT+IPHONEACCEV`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Xapl {
   pub vendor_id: u16,
   pub product_id: u16,
   pub version: u16,
   pub features: u8,
   pub accev_docked: u8,
}

/// Represents the result of an update operation on device state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOp<T> {
   /// No change occurred
   Noop,
   /// A value was set for the first time
   Inserted,
   /// An existing value was updated, carrying the previous value
   Updated(T),
}

impl<T: PartialEq + Copy> UpdateOp<T> {
   /// Stores `new`, reporting how it relates to the previous value. Values
   /// are only ever set, never cleared.
   fn apply_atomic(dst: &AtomicCell<Option<T>>, new: T) -> Self {
      match dst.swap(Some(new)) {
         None => Self::Inserted,
         Some(prev) if prev == new => Self::Noop,
         Some(prev) => Self::Updated(prev),
      }
   }
}

impl<T> UpdateOp<T> {
   pub const fn is_changed(&self) -> bool {
      !matches!(self, Self::Noop)
   }
}

/// Truncates `name` on a character boundary to fit the HCI limit.
fn bounded_name(name: &str) -> DeviceName {
   let mut end = name.len().min(MAX_NAME_LEN);
   while !name.is_char_boundary(end) {
      end -= 1;
   }
   DeviceName::try_from(&name[..end]).unwrap_or_default()
}

struct DeviceInner {
   controller: u16,
   address: Address,
   name: Mutex<DeviceName>,
   battery: AtomicCell<Option<u8>>,
   xapl: AtomicCell<Xapl>,
   transports: Mutex<HashMap<SmolStr, Transport>>,
   context: DeviceContext,
}

impl Drop for DeviceInner {
   fn drop(&mut self) {
      let transports = mem::take(self.transports.get_mut());
      if !transports.is_empty() {
         debug!(
            "{}: dropping device with {} transports",
            self.address,
            transports.len()
         );
      }
      for transport in transports.into_values() {
         transport.destroy();
      }
   }
}

/// A remote Bluetooth device and the transports connected to it.
///
/// This type is cheaply cloneable and thread-safe.
#[derive(Clone)]
pub struct Device(Arc<DeviceInner>);

/// Weak reference to a device.
#[derive(Debug, Clone, Default)]
pub struct WeakDevice(Weak<DeviceInner>);

impl WeakDevice {
   pub fn new(device: &Device) -> Self {
      Self(Arc::downgrade(&device.0))
   }

   pub fn upgrade(&self) -> Option<Device> {
      self.0.upgrade().map(Device)
   }
}

impl fmt::Debug for DeviceInner {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Device")
         .field("controller", &self.controller)
         .field("address", &self.address)
         .field("name", &self.name.lock().as_str())
         .finish_non_exhaustive()
   }
}

impl fmt::Debug for Device {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      fmt::Debug::fmt(&self.0, f)
   }
}

impl PartialEq for Device {
   fn eq(&self, other: &Self) -> bool {
      Arc::ptr_eq(&self.0, &other.0)
   }
}

impl Eq for Device {}

impl Device {
   /// Creates a device with no transports, battery reporting disabled and
   /// zeroed extension state.
   pub fn new(controller: u16, address: Address, name: &str, context: DeviceContext) -> Self {
      info!("New device {address} on hci{controller}");
      Self(Arc::new(DeviceInner {
         controller,
         address,
         name: Mutex::new(bounded_name(name)),
         battery: AtomicCell::new(None),
         xapl: AtomicCell::new(Xapl::default()),
         transports: Mutex::new(HashMap::new()),
         context,
      }))
   }

   pub fn downgrade(&self) -> WeakDevice {
      WeakDevice::new(self)
   }

   /// Index of the local HCI controller.
   pub fn controller(&self) -> u16 {
      self.0.controller
   }

   pub fn address(&self) -> Address {
      self.0.address
   }

   pub fn context(&self) -> &DeviceContext {
      &self.0.context
   }

   pub fn name(&self) -> SmolStr {
      SmolStr::new(self.0.name.lock().as_str())
   }

   /// Replaces the display name, truncating it to the HCI limit.
   pub fn set_name(&self, name: &str) -> UpdateOp<SmolStr> {
      let name = bounded_name(name);
      let mut lock = self.0.name.lock();
      if *lock == name {
         return UpdateOp::Noop;
      }
      let prev = mem::replace(&mut *lock, name);
      UpdateOp::Updated(SmolStr::new(prev.as_str()))
   }

   pub fn battery(&self) -> Battery {
      self.0.battery.load().map_or_else(Battery::default, |level| Battery {
         enabled: true,
         level,
      })
   }

   /// Records a battery report and enables battery status. Out-of-range
   /// values are clamped to 0-100.
   pub fn set_battery_level(&self, raw: i32) -> UpdateOp<u8> {
      let level = raw.clamp(0, 100) as u8;
      UpdateOp::apply_atomic(&self.0.battery, level)
   }

   pub fn xapl(&self) -> Xapl {
      self.0.xapl.load()
   }

   pub fn set_xapl(&self, vendor_id: u16, product_id: u16, version: u16, features: u8) -> bool {
      let mut xapl = self.xapl();
      xapl.vendor_id = vendor_id;
      xapl.product_id = product_id;
      xapl.version = version;
      xapl.features = features;
      self.0.xapl.swap(xapl) != xapl
   }

   pub fn set_docked(&self, docked: u8) -> bool {
      let mut xapl = self.xapl();
      xapl.accev_docked = docked;
      self.0.xapl.swap(xapl) != xapl
   }

   // === Transport map ===

   pub(crate) fn register(&self, transport: Transport) -> Result<()> {
      let mut transports = self.0.transports.lock();
      if transports.contains_key(transport.path()) {
         return Err(TransportError::DuplicateTransport(transport.path().clone()));
      }
      transports.insert(transport.path().clone(), transport);
      Ok(())
   }

   /// Removes `transport` from the map if it is still the registered entry.
   pub(crate) fn detach(&self, transport: &Transport) {
      let mut transports = self.0.transports.lock();
      if transports.get(transport.path()) == Some(transport) {
         transports.remove(transport.path());
      }
   }

   pub fn lookup(&self, path: &str) -> Result<Transport> {
      self
         .0
         .transports
         .lock()
         .get(path)
         .cloned()
         .ok_or_else(|| TransportError::NotFound(path.into()))
   }

   /// Removes the transport at `path` and tears it down. Returns whether
   /// one existed.
   pub fn remove(&self, path: &str) -> bool {
      // Taken out first so no caller can look it up mid-teardown.
      let Some(transport) = self.0.transports.lock().remove(path) else {
         return false;
      };
      transport.destroy();
      true
   }

   pub fn transports(&self) -> Vec<Transport> {
      self.0.transports.lock().values().cloned().collect()
   }

   pub fn transport_count(&self) -> usize {
      self.0.transports.lock().len()
   }

   /// Tears down every transport of the device.
   pub fn destroy(&self) {
      let transports = self.transports();
      info!(
         "{}: destroying device with {} transports",
         self.address(),
         transports.len()
      );
      // Each teardown detaches itself and clears its partner's backlink.
      for transport in transports {
         transport.destroy();
      }
   }

   /// Converts the device state to a JSON representation.
   pub fn to_json(&self) -> serde_json::Value {
      let mut transports = self.transports();
      transports.sort_by(|a, b| a.path().cmp(b.path()));

      let mut info = json!({
         "address": self.address().to_string(),
         "controller": self.controller(),
         "name": self.name().as_str(),
         "transports": transports.iter().map(Transport::to_json).collect::<Vec<_>>(),
      });

      let battery = self.battery();
      if battery.enabled {
         info["battery"] = json!(battery.level);
      }

      let xapl = self.xapl();
      if xapl != Xapl::default() {
         info["xapl"] = json!(xapl);
      }

      info
   }
}

/// Finds a transport by path across all devices.
pub fn lookup(devices: &DeviceMap, path: &str) -> Result<Transport> {
   devices
      .values()
      .find_map(|device| device.lookup(path).ok())
      .ok_or_else(|| TransportError::NotFound(path.into()))
}

/// Removes and tears down a transport by path across all devices. Returns
/// whether one existed.
pub fn remove(devices: &DeviceMap, path: &str) -> bool {
   devices.values().any(|device| device.remove(path))
}
