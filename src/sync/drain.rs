//! Stream flush acknowledgement.
//!
//! Callers take a ticket with [`DrainSync::request`] and wait for the worker
//! to complete it. Completion covers every ticket issued up to that point,
//! so coalesced sync signals are served by a single flush. A disarmed
//! synchronizer (no worker) never blocks.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct DrainState {
   armed: bool,
   requested: u64,
   completed: u64,
}

#[derive(Debug, Default)]
pub struct DrainSync {
   state: Mutex<DrainState>,
   drained: Condvar,
}

impl DrainSync {
   pub fn new() -> Self {
      Self::default()
   }

   /// Marks a worker as present. Called before the worker thread starts.
   pub fn arm(&self) {
      let mut state = self.state.lock();
      state.armed = true;
      state.completed = state.requested;
   }

   /// Marks the worker as gone and releases every waiter.
   pub fn disarm(&self) {
      let mut state = self.state.lock();
      state.armed = false;
      state.completed = state.requested;
      self.drained.notify_all();
   }

   pub fn is_armed(&self) -> bool {
      self.state.lock().armed
   }

   /// Issues a ticket, or `None` when no worker is there to serve it.
   pub fn request(&self) -> Option<u64> {
      let mut state = self.state.lock();
      if !state.armed {
         return None;
      }
      state.requested += 1;
      Some(state.requested)
   }

   /// Blocks until `ticket` is completed or the synchronizer is disarmed.
   pub fn wait(&self, ticket: u64) {
      let mut state = self.state.lock();
      while state.armed && state.completed < ticket {
         self.drained.wait(&mut state);
      }
   }

   /// Whether a caller is waiting on a flush.
   pub fn is_pending(&self) -> bool {
      let state = self.state.lock();
      state.completed < state.requested
   }

   /// Signals "drained" for every ticket issued so far.
   pub fn complete(&self) {
      let mut state = self.state.lock();
      if state.completed < state.requested {
         state.completed = state.requested;
         self.drained.notify_all();
      }
   }
}

#[cfg(test)]
mod tests {
   use std::{sync::Arc, thread, time::Duration};

   use super::*;

   #[test]
   fn test_disarmed_never_blocks() {
      let drain = DrainSync::new();
      assert!(drain.request().is_none());
      assert!(!drain.is_pending());
   }

   #[test]
   fn test_complete_releases_waiter() {
      let drain = Arc::new(DrainSync::new());
      drain.arm();

      let ticket = drain.request().unwrap();
      assert!(drain.is_pending());
      let worker = thread::spawn({
         let drain = drain.clone();
         move || {
            thread::sleep(Duration::from_millis(20));
            drain.complete();
         }
      });
      drain.wait(ticket);
      assert!(!drain.is_pending());
      worker.join().unwrap();
   }

   #[test]
   fn test_single_completion_covers_coalesced_requests() {
      let drain = DrainSync::new();
      drain.arm();
      let first = drain.request().unwrap();
      let second = drain.request().unwrap();
      drain.complete();
      drain.wait(first);
      drain.wait(second);
   }

   #[test]
   fn test_disarm_releases_waiter() {
      let drain = Arc::new(DrainSync::new());
      drain.arm();
      let ticket = drain.request().unwrap();
      let teardown = thread::spawn({
         let drain = drain.clone();
         move || {
            thread::sleep(Duration::from_millis(20));
            drain.disarm();
         }
      });
      drain.wait(ticket);
      assert!(!drain.is_armed());
      teardown.join().unwrap();
   }

   #[test]
   fn test_completion_before_wait() {
      let drain = DrainSync::new();
      drain.arm();
      let ticket = drain.request().unwrap();
      drain.complete();
      // Must not block: the ticket was already served.
      drain.wait(ticket);
   }
}
