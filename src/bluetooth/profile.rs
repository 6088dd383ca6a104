//! Bluetooth profiles a transport can be bound to.

use serde::{Deserialize, Serialize};

#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[serde(rename_all = "kebab-case")]
pub enum Profile {
   #[strum(serialize = "a2dp-source")]
   A2dpSource,
   #[strum(serialize = "a2dp-sink")]
   A2dpSink,
   #[strum(serialize = "hfp-hf")]
   HfpHf,
   #[strum(serialize = "hfp-ag")]
   HfpAg,
   #[strum(serialize = "hsp-hs")]
   HspHs,
   #[strum(serialize = "hsp-ag")]
   HspAg,
}

impl Profile {
   pub fn to_str(self) -> &'static str {
      self.into()
   }

   pub const fn is_a2dp(self) -> bool {
      matches!(self, Self::A2dpSource | Self::A2dpSink)
   }

   /// Hands-free or headset profile, carried over RFCOMM and SCO.
   pub const fn is_voice(self) -> bool {
      matches!(self, Self::HfpHf | Self::HfpAg | Self::HspHs | Self::HspAg)
   }

   /// Audio gateway side of a voice profile.
   pub const fn is_gateway(self) -> bool {
      matches!(self, Self::HfpAg | Self::HspAg)
   }
}
