//! Cross-thread primitives shared by a transport and its worker.
//!
//! This module provides the coalescing signal channel, the drain
//! synchronizer used for stream flush acknowledgement, and the cleanup
//! guard used for deferred-cancellation-safe teardown.

pub mod cleanup;
pub mod drain;
pub mod signal;
