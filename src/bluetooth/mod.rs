//! Bluetooth-facing plumbing for transports.
//!
//! This module provides the link socket and audio stream endpoint
//! wrappers, the profile identifiers, and the codec capability table used
//! to answer channel and sampling queries.

pub mod codec;
pub mod link;
pub mod pcm;
pub mod profile;
