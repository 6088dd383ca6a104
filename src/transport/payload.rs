//! Type-specific transport state.

use std::{
   collections::VecDeque,
   sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering},
};

use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use smol_str::SmolStr;

use crate::{
   bluetooth::pcm::{Pcm, PcmStream},
   sync::drain::DrainSync,
   transport::{MAX_COMMAND_LEN, TransportType},
};

pub const A2DP_MAX_VOLUME: u8 = 127;
pub const SCO_MAX_GAIN: u8 = 15;

pub type Command = heapless::String<MAX_COMMAND_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct A2dpVolume {
   pub ch1_muted: bool,
   pub ch2_muted: bool,
   pub ch1_volume: u8,
   pub ch2_volume: u8,
}

impl A2dpVolume {
   fn new(volume: u8) -> Self {
      let volume = volume.min(A2DP_MAX_VOLUME);
      Self {
         ch1_volume: volume,
         ch2_volume: volume,
         ..Default::default()
      }
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ScoGain {
   pub spk_muted: bool,
   pub mic_muted: bool,
   pub spk_gain: u8,
   pub mic_gain: u8,
}

impl ScoGain {
   fn new(gain: u8) -> Self {
      let gain = gain.min(SCO_MAX_GAIN);
      Self {
         spk_gain: gain,
         mic_gain: gain,
         ..Default::default()
      }
   }

   /// Speaker gain as reported to the remote side, zero when muted.
   pub const fn effective_spk(&self) -> u8 {
      if self.spk_muted { 0 } else { self.spk_gain }
   }

   /// Microphone gain as reported to the remote side, zero when muted.
   pub const fn effective_mic(&self) -> u8 {
      if self.mic_muted { 0 } else { self.mic_gain }
   }
}

/// Indicators reported by an HFP audio gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::FromRepr, strum::EnumString)]
#[repr(u8)]
#[strum(serialize_all = "lowercase")]
pub enum HfpIndicator {
   Service = 1,
   Call,
   CallSetup,
   CallHeld,
   Signal,
   Roam,
   BattChg,
}

pub const HFP_IND_MAX: usize = HfpIndicator::BattChg as usize + 1;

#[derive(Debug)]
pub struct A2dpPayload {
   pub(crate) volume: AtomicCell<A2dpVolume>,
   pub(crate) delay: AtomicU16,
   pub(crate) pcm: Mutex<Pcm>,
   pub(crate) cconfig: Mutex<Option<Box<[u8]>>>,
   pub(crate) coutq_baseline: AtomicCell<Option<usize>>,
   pub(crate) drained: DrainSync,
}

impl A2dpPayload {
   pub(crate) fn new(cconfig: &[u8], volume: u8) -> Self {
      Self {
         volume: AtomicCell::new(A2dpVolume::new(volume)),
         delay: AtomicU16::new(0),
         pcm: Mutex::new(Pcm::new()),
         cconfig: Mutex::new(Some(cconfig.into())),
         coutq_baseline: AtomicCell::new(None),
         drained: DrainSync::new(),
      }
   }

   pub fn volume(&self) -> A2dpVolume {
      self.volume.load()
   }

   /// Delay reported by AVDTP, in 1/10 ms.
   pub fn delay(&self) -> u16 {
      self.delay.load(Ordering::Relaxed)
   }

   /// Copy of the negotiated codec configuration, if still owned.
   pub fn cconfig(&self) -> Option<Vec<u8>> {
      self.cconfig.lock().as_deref().map(<[u8]>::to_vec)
   }

   pub fn coutq_baseline(&self) -> Option<usize> {
      self.coutq_baseline.load()
   }
}

#[derive(Debug, Default)]
pub struct RfcommPayload {
   pub(crate) sco: Mutex<Option<SmolStr>>,
   pub(crate) hfp_features: AtomicU32,
   pub(crate) indicators: Mutex<[u8; HFP_IND_MAX]>,
   pub(crate) commands: Mutex<VecDeque<Command>>,
}

impl RfcommPayload {
   /// Path of the paired SCO transport.
   pub fn sco_path(&self) -> Option<SmolStr> {
      self.sco.lock().clone()
   }

   pub fn hfp_features(&self) -> u32 {
      self.hfp_features.load(Ordering::Relaxed)
   }

   pub fn indicator(&self, indicator: HfpIndicator) -> u8 {
      self.indicators.lock()[indicator as usize]
   }

   pub fn pending_commands(&self) -> usize {
      self.commands.lock().len()
   }
}

#[derive(Debug)]
pub struct ScoPayload {
   pub(crate) ofono: AtomicBool,
   pub(crate) rfcomm: Mutex<Option<SmolStr>>,
   pub(crate) gain: AtomicCell<ScoGain>,
   pub(crate) spk_pcm: Mutex<Pcm>,
   pub(crate) mic_pcm: Mutex<Pcm>,
   pub(crate) spk_drained: DrainSync,
}

impl ScoPayload {
   pub(crate) fn new(gain: u8) -> Self {
      Self {
         ofono: AtomicBool::new(false),
         rfcomm: Mutex::new(None),
         gain: AtomicCell::new(ScoGain::new(gain)),
         spk_pcm: Mutex::new(Pcm::new()),
         mic_pcm: Mutex::new(Pcm::new()),
         spk_drained: DrainSync::new(),
      }
   }

   /// Whether the voice link is routed by an external telephony stack.
   pub fn is_external(&self) -> bool {
      self.ofono.load(Ordering::Relaxed)
   }

   /// Path of the parent RFCOMM transport.
   pub fn rfcomm_path(&self) -> Option<SmolStr> {
      self.rfcomm.lock().clone()
   }

   pub fn gain(&self) -> ScoGain {
      self.gain.load()
   }
}

/// Exactly one payload per transport; the transport type is derived from it.
#[derive(Debug)]
pub enum Payload {
   A2dp(A2dpPayload),
   Rfcomm(RfcommPayload),
   Sco(ScoPayload),
}

impl Payload {
   pub const fn ty(&self) -> TransportType {
      match self {
         Self::A2dp(_) => TransportType::A2dp,
         Self::Rfcomm(_) => TransportType::Rfcomm,
         Self::Sco(_) => TransportType::Sco,
      }
   }

   /// Synchronizer of the drainable stream, if the transport carries one.
   pub(crate) const fn drain(&self) -> Option<&DrainSync> {
      match self {
         Self::A2dp(a2dp) => Some(&a2dp.drained),
         Self::Sco(sco) => Some(&sco.spk_drained),
         Self::Rfcomm(_) => None,
      }
   }

   pub(crate) const fn pcm(&self, stream: PcmStream) -> Option<&Mutex<Pcm>> {
      match (self, stream) {
         (Self::A2dp(a2dp), PcmStream::A2dp) => Some(&a2dp.pcm),
         (Self::Sco(sco), PcmStream::Speaker) => Some(&sco.spk_pcm),
         (Self::Sco(sco), PcmStream::Mic) => Some(&sco.mic_pcm),
         _ => None,
      }
   }

   /// Streams carried by this payload.
   pub const fn streams(&self) -> &'static [PcmStream] {
      match self {
         Self::A2dp(_) => &[PcmStream::A2dp],
         Self::Sco(_) => &[PcmStream::Speaker, PcmStream::Mic],
         Self::Rfcomm(_) => &[],
      }
   }

   pub(crate) fn to_json(&self) -> serde_json::Value {
      match self {
         Self::A2dp(a2dp) => json!({
            "volume": a2dp.volume(),
            "avdtp_delay": a2dp.delay(),
            "pcm_client": a2dp.pcm.lock().client(),
            "cconfig": a2dp.cconfig().map(hex::encode),
         }),
         Self::Rfcomm(rfcomm) => json!({
            "sco": rfcomm.sco_path().as_deref(),
            "hfp_features": rfcomm.hfp_features(),
            "indicators": *rfcomm.indicators.lock(),
         }),
         Self::Sco(sco) => json!({
            "rfcomm": sco.rfcomm_path().as_deref(),
            "external": sco.is_external(),
            "gain": sco.gain(),
            "spk_client": sco.spk_pcm.lock().client(),
            "mic_client": sco.mic_pcm.lock().client(),
         }),
      }
   }
}
