//! Transport core of a Bluetooth audio bridging daemon.
//!
//! Remote devices are tracked as [`Device`]s, each owning the [`Transport`]s
//! (A2DP media streams, RFCOMM control channels and SCO voice links)
//! registered for it. Every transport runs a small state machine and, while
//! pending, active or paused, a worker thread moving audio between the
//! Bluetooth link and the stream endpoints handed over by the audio backend.
//!
//! The control plane plugs in through two seams: a
//! [`LinkProvider`](transport::strategy::LinkProvider) that negotiates and
//! hands over link sockets, and an [`EventBus`](event::EventBus) receiving
//! state changes and control channel data.

pub mod bluetooth;
pub mod config;
pub mod device;
pub mod error;
pub mod event;
pub mod sync;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use device::{Device, DeviceContext, DeviceMap, WeakDevice};
pub use error::{Result, TransportError};
pub use event::{EventBus, EventSender, TransportEvent};
pub use transport::{Transport, TransportState, TransportType, WeakTransport};
