//! Per-type resource acquisition and release.
//!
//! Each transport is bound to one [`ResourceStrategy`] at construction,
//! selected by [`for_transport`] from its type and profile. Strategies get
//! the actual Bluetooth socket from the control plane through a
//! [`LinkProvider`].

use std::{fmt, sync::Arc};

use bluer::Address;
use log::{debug, info, warn};

use crate::{
   bluetooth::{codec::CodecId, link::Link, profile::Profile},
   error::{Result, TransportError},
   transport::{Payload, TransportId, TransportInner, TransportState, TransportType},
};

/// How the audio of a voice link is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
pub enum ScoRouting {
   /// Audio flows through this daemon's stream endpoints.
   #[default]
   #[strum(serialize = "local")]
   Local,
   /// A telephony stack owns the call and hands the link over.
   #[strum(serialize = "external")]
   External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
   /// AVDTP media transport.
   A2dp,
   /// Service-level connection of a voice profile.
   Rfcomm,
   /// Synchronous voice link. `initiate` is set when this side has to open
   /// the connection rather than accept it.
   Sco { routing: ScoRouting, initiate: bool },
}

/// Everything the control plane needs to hand over a link.
#[derive(Debug)]
pub struct LinkRequest<'a> {
   pub id: &'a TransportId,
   pub address: Address,
   pub profile: Profile,
   pub codec: CodecId,
   pub kind: LinkKind,
}

/// Control-plane seam for obtaining Bluetooth sockets.
pub trait LinkProvider: Send + Sync {
   /// Negotiates and returns a connected link.
   fn acquire(&self, request: &LinkRequest<'_>) -> Result<Link>;

   /// Called once for every link obtained from [`LinkProvider::acquire`]
   /// after it has been closed.
   fn release(&self, _id: &TransportId) {}

   /// Decides who routes the audio of a voice link.
   fn sco_routing(&self, _id: &TransportId) -> ScoRouting {
      ScoRouting::Local
   }
}

/// Acquire/release pair bound to a transport.
pub trait ResourceStrategy: Send + Sync + fmt::Debug {
   fn name(&self) -> &'static str;

   /// Obtains the link. Must be a no-op when already acquired.
   fn acquire(&self, t: &TransportInner) -> Result<()>;

   /// Undoes [`ResourceStrategy::acquire`]. Safe to call repeatedly and on
   /// a transport that was never acquired.
   fn release(&self, t: &TransportInner);
}

fn acquisition_error(e: TransportError) -> TransportError {
   match e {
      TransportError::AcquisitionFailure(_) => e,
      other => TransportError::AcquisitionFailure(other.to_string()),
   }
}

fn request_link(
   links: &dyn LinkProvider,
   t: &TransportInner,
   kind: LinkKind,
) -> Result<Arc<Link>> {
   let request = LinkRequest {
      id: t.id(),
      address: t.address(),
      profile: t.profile(),
      codec: t.codec(),
      kind,
   };
   let link = links.acquire(&request).map_err(acquisition_error)?;
   info!(
      "{}: acquired {} link (fd {}, mtu {}/{})",
      t.id(),
      t.ty(),
      link.fd(),
      link.mtu_read(),
      link.mtu_write()
   );
   Ok(t.install_link(link))
}

/// Closes the link and tells the provider about it, once.
fn drop_link(links: &dyn LinkProvider, t: &TransportInner) {
   t.cleanup().wait_unlocked();
   if let Some(link) = t.take_link() {
      if Arc::strong_count(&link) > 1 {
         // A detached worker still holds it; make sure it stops using it.
         link.shutdown();
      }
      drop(link);
      links.release(t.id());
      info!("{}: released {} link", t.id(), t.ty());
   }
}

fn release_streams(t: &TransportInner) {
   for &stream in t.payload().streams() {
      if let Some(pcm) = t.payload().pcm(stream)
         && pcm.lock().release()
      {
         debug!("{}: closed {stream} stream", t.id());
      }
   }
}

#[derive(Clone)]
pub struct A2dpMedia {
   links: Arc<dyn LinkProvider>,
}

impl fmt::Debug for A2dpMedia {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str("A2dpMedia")
   }
}

impl ResourceStrategy for A2dpMedia {
   fn name(&self) -> &'static str {
      "a2dp-media"
   }

   fn acquire(&self, t: &TransportInner) -> Result<()> {
      if t.has_link() {
         return Ok(());
      }
      request_link(&*self.links, t, LinkKind::A2dp).map(drop)
   }

   fn release(&self, t: &TransportInner) {
      drop_link(&*self.links, t);
      release_streams(t);
      if let Payload::A2dp(a2dp) = t.payload() {
         a2dp.coutq_baseline.store(None);
         // The configuration survives idle periods and goes with eviction.
         if t.state() == TransportState::Limbo && a2dp.cconfig.lock().take().is_some() {
            debug!("{}: dropped codec configuration", t.id());
         }
      }
   }
}

#[derive(Clone)]
pub struct RfcommChannel {
   links: Arc<dyn LinkProvider>,
}

impl fmt::Debug for RfcommChannel {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str("RfcommChannel")
   }
}

impl ResourceStrategy for RfcommChannel {
   fn name(&self) -> &'static str {
      "rfcomm-channel"
   }

   fn acquire(&self, t: &TransportInner) -> Result<()> {
      if t.has_link() {
         return Ok(());
      }
      request_link(&*self.links, t, LinkKind::Rfcomm).map(drop)
   }

   fn release(&self, t: &TransportInner) {
      drop_link(&*self.links, t);
      if let Payload::Rfcomm(rfcomm) = t.payload() {
         let dropped = rfcomm.commands.lock().drain(..).count();
         if dropped > 0 {
            warn!("{}: dropped {dropped} unsent commands", t.id());
         }
      }
   }
}

#[derive(Clone)]
pub struct ScoLink {
   links: Arc<dyn LinkProvider>,
   initiate: bool,
}

impl fmt::Debug for ScoLink {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("ScoLink")
         .field("initiate", &self.initiate)
         .finish()
   }
}

impl ResourceStrategy for ScoLink {
   fn name(&self) -> &'static str {
      "sco-link"
   }

   fn acquire(&self, t: &TransportInner) -> Result<()> {
      if t.has_link() {
         return Ok(());
      }
      let routing = self.links.sco_routing(t.id());
      let kind = LinkKind::Sco {
         routing,
         initiate: self.initiate,
      };
      request_link(&*self.links, t, kind)?;
      if let Payload::Sco(sco) = t.payload() {
         sco.ofono.store(
            routing == ScoRouting::External,
            std::sync::atomic::Ordering::Relaxed,
         );
      }
      debug!("{}: voice link routed {routing}", t.id());
      Ok(())
   }

   fn release(&self, t: &TransportInner) {
      drop_link(&*self.links, t);
      release_streams(t);
      if let Payload::Sco(sco) = t.payload() {
         sco.ofono.store(false, std::sync::atomic::Ordering::Relaxed);
      }
   }
}

/// Selects the strategy for a `(type, profile)` pair.
pub fn for_transport(
   ty: TransportType,
   profile: Profile,
   links: Arc<dyn LinkProvider>,
) -> Result<Arc<dyn ResourceStrategy>> {
   let strategy: Arc<dyn ResourceStrategy> = match ty {
      TransportType::A2dp if profile.is_a2dp() => Arc::new(A2dpMedia { links }),
      TransportType::Rfcomm if profile.is_voice() => Arc::new(RfcommChannel { links }),
      // The gateway opens the voice link, the headset side accepts it.
      TransportType::Sco if profile.is_voice() => Arc::new(ScoLink {
         links,
         initiate: profile.is_gateway(),
      }),
      _ => {
         return Err(TransportError::InvalidProfile {
            kind: ty.into(),
            profile: profile.to_str(),
         });
      },
   };
   Ok(strategy)
}
