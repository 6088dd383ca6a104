//! Audio stream endpoints.
//!
//! A PCM endpoint is the handoff point to the audio backend: a FIFO or
//! socket descriptor plus the identifier of the client that owns it.

use std::{
   fs::File,
   io::{self, Read, Write},
   os::fd::{AsFd, AsRawFd, OwnedFd, RawFd},
};

use crate::bluetooth::link::set_nonblocking;

/// Which stream of a transport an endpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum PcmStream {
   /// The single A2DP stream.
   #[strum(serialize = "a2dp")]
   A2dp,
   /// SCO playback towards the headset.
   #[strum(serialize = "speaker")]
   Speaker,
   /// SCO capture from the headset.
   #[strum(serialize = "mic")]
   Mic,
}

#[derive(Debug, Default)]
pub struct Pcm {
   endpoint: Option<File>,
   client: Option<i32>,
}

impl Pcm {
   pub const fn new() -> Self {
      Self {
         endpoint: None,
         client: None,
      }
   }

   /// Installs a new endpoint, closing any previous one.
   pub fn attach(&mut self, fd: OwnedFd, client: i32) -> io::Result<()> {
      set_nonblocking(fd.as_fd())?;
      self.endpoint = Some(File::from(fd));
      self.client = Some(client);
      Ok(())
   }

   /// Closes the endpoint. Returns whether one was open.
   pub fn release(&mut self) -> bool {
      self.client = None;
      self.endpoint.take().is_some()
   }

   pub const fn is_open(&self) -> bool {
      self.endpoint.is_some()
   }

   pub fn fd(&self) -> Option<RawFd> {
      self.endpoint.as_ref().map(AsRawFd::as_raw_fd)
   }

   pub const fn client(&self) -> Option<i32> {
      self.client
   }

   /// Reads without blocking. `Ok(0)` means the client went away.
   pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
      match self.endpoint.as_ref() {
         Some(mut file) => file.read(buf),
         None => Err(io::ErrorKind::NotConnected.into()),
      }
   }

   /// Writes without blocking.
   pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
      match self.endpoint.as_ref() {
         Some(mut file) => file.write(buf),
         None => Err(io::ErrorKind::NotConnected.into()),
      }
   }
}
