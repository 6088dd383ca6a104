//! Codec capability table.
//!
//! Channel count and sampling rate are derived from the selected codec and,
//! for A2DP, from the negotiated codec configuration blob. Only the fields
//! needed for these two queries are decoded.

pub type CodecId = u16;

pub const A2DP_CODEC_SBC: CodecId = 0x00;
pub const A2DP_CODEC_MPEG12: CodecId = 0x01;
pub const A2DP_CODEC_MPEG24: CodecId = 0x02;
/// Vendor codecs keep the low byte of the vendor id in the upper byte.
pub const A2DP_CODEC_VENDOR_APTX: CodecId = 0x4F01;

pub const HFP_CODEC_UNDEFINED: CodecId = 0x00;
pub const HFP_CODEC_CVSD: CodecId = 0x01;
pub const HFP_CODEC_MSBC: CodecId = 0x02;

// SBC and MPEG-1,2 share the channel mode encoding.
const CHANNEL_MODE_MONO: u8 = 1 << 3;
const CHANNEL_MODE_DUAL_CHANNEL: u8 = 1 << 2;
const CHANNEL_MODE_STEREO: u8 = 1 << 1;
const CHANNEL_MODE_JOINT_STEREO: u8 = 1;

const AAC_CHANNELS_1: u8 = 0x02;
const AAC_CHANNELS_2: u8 = 0x01;

const APTX_CHANNEL_MODE_MONO: u8 = 0x01;
const APTX_CHANNEL_MODE_STEREO: u8 = 0x02;

/// Size of the codec configuration blob for each known A2DP codec.
pub const fn a2dp_config_size(codec: CodecId) -> Option<usize> {
   match codec {
      A2DP_CODEC_SBC | A2DP_CODEC_MPEG12 => Some(4),
      A2DP_CODEC_MPEG24 => Some(6),
      A2DP_CODEC_VENDOR_APTX => Some(7),
      _ => None,
   }
}

pub fn codec_name(codec: CodecId, a2dp: bool) -> &'static str {
   match (a2dp, codec) {
      (true, A2DP_CODEC_SBC) => "SBC",
      (true, A2DP_CODEC_MPEG12) => "MP3",
      (true, A2DP_CODEC_MPEG24) => "AAC",
      (true, A2DP_CODEC_VENDOR_APTX) => "aptX",
      (false, HFP_CODEC_CVSD) => "CVSD",
      (false, HFP_CODEC_MSBC) => "mSBC",
      _ => "unknown",
   }
}

const fn channel_mode_channels(mode: u8) -> Option<u32> {
   match mode {
      CHANNEL_MODE_MONO => Some(1),
      CHANNEL_MODE_DUAL_CHANNEL | CHANNEL_MODE_STEREO | CHANNEL_MODE_JOINT_STEREO => Some(2),
      _ => None,
   }
}

/// Number of audio channels of an A2DP stream.
pub fn a2dp_channels(codec: CodecId, cconfig: &[u8]) -> Option<u32> {
   if cconfig.len() < a2dp_config_size(codec)? {
      return None;
   }
   match codec {
      A2DP_CODEC_SBC | A2DP_CODEC_MPEG12 => channel_mode_channels(cconfig[0] & 0x0f),
      A2DP_CODEC_MPEG24 => match (cconfig[2] >> 2) & 0x03 {
         AAC_CHANNELS_1 => Some(1),
         AAC_CHANNELS_2 => Some(2),
         _ => None,
      },
      A2DP_CODEC_VENDOR_APTX => match cconfig[6] & 0x0f {
         APTX_CHANNEL_MODE_MONO => Some(1),
         APTX_CHANNEL_MODE_STEREO => Some(2),
         _ => None,
      },
      _ => None,
   }
}

/// Sampling frequency of an A2DP stream in Hz.
pub fn a2dp_sampling(codec: CodecId, cconfig: &[u8]) -> Option<u32> {
   if cconfig.len() < a2dp_config_size(codec)? {
      return None;
   }
   match codec {
      A2DP_CODEC_SBC => match cconfig[0] >> 4 {
         0x08 => Some(16000),
         0x04 => Some(32000),
         0x02 => Some(44100),
         0x01 => Some(48000),
         _ => None,
      },
      A2DP_CODEC_MPEG12 => match cconfig[1] & 0x3f {
         0x20 => Some(16000),
         0x10 => Some(22050),
         0x08 => Some(24000),
         0x04 => Some(32000),
         0x02 => Some(44100),
         0x01 => Some(48000),
         _ => None,
      },
      A2DP_CODEC_MPEG24 => {
         let frequency = (u16::from(cconfig[1]) << 4) | u16::from(cconfig[2] >> 4);
         match frequency {
            0x0800 => Some(8000),
            0x0400 => Some(11025),
            0x0200 => Some(12000),
            0x0100 => Some(16000),
            0x0080 => Some(22050),
            0x0040 => Some(24000),
            0x0020 => Some(32000),
            0x0010 => Some(44100),
            0x0008 => Some(48000),
            0x0004 => Some(64000),
            0x0002 => Some(88200),
            0x0001 => Some(96000),
            _ => None,
         }
      },
      A2DP_CODEC_VENDOR_APTX => match cconfig[6] >> 4 {
         0x08 => Some(16000),
         0x04 => Some(32000),
         0x02 => Some(44100),
         0x01 => Some(48000),
         _ => None,
      },
      _ => None,
   }
}

/// Sampling frequency of a voice link in Hz. Voice links are always mono.
pub const fn sco_sampling(codec: CodecId) -> Option<u32> {
   match codec {
      // HSP has no codec negotiation and always runs CVSD.
      HFP_CODEC_UNDEFINED | HFP_CODEC_CVSD => Some(8000),
      HFP_CODEC_MSBC => Some(16000),
      _ => None,
   }
}
