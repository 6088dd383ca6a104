//! Event handling for transport status updates.
//!
//! This module provides the event infrastructure used to tell the control
//! plane about transport state changes, lost links, volume updates and
//! data received on control channels.

use std::sync::Arc;

use crate::{
   bluetooth::{link::Packet, pcm::PcmStream},
   transport::{Transport, TransportState},
};

/// Events that can be emitted by transports.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
   StateChanged {
      from: TransportState,
      to: TransportState,
   },
   /// The worker stopped because the Bluetooth link failed or hung up. The
   /// transport moves to idle right after.
   LinkLost,
   /// The audio client closed its end of a stream.
   PcmClosed(PcmStream),
   VolumeChanged,
   /// Raw bytes read from an RFCOMM channel.
   CommandReceived(Packet),
}

/// Trait for implementing event emission.
///
/// Events raised by workers are emitted on the worker thread. Listeners
/// should hand them off (a channel to the control plane) rather than drive
/// state transitions inline.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, transport: &Transport, event: TransportEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
