//! Cancellation-safe critical sections for worker threads.
//!
//! A worker brackets work on shared descriptors with [`CleanupGuard::lock`].
//! The teardown side requests cancellation, which the worker observes at its
//! yield points, and waits for the lock to clear before closing anything.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct CleanupState {
   locked: bool,
   cancelled: bool,
}

#[derive(Debug, Default)]
pub struct CleanupGuard {
   state: Mutex<CleanupState>,
   unlocked: Condvar,
}

/// Held while a worker is inside a cleanup-locked section.
#[must_use = "the section ends when the lock is dropped"]
pub struct CleanupLock<'a> {
   guard: &'a CleanupGuard,
}

impl Drop for CleanupLock<'_> {
   fn drop(&mut self) {
      let mut state = self.guard.state.lock();
      state.locked = false;
      self.guard.unlocked.notify_all();
   }
}

impl CleanupGuard {
   pub fn new() -> Self {
      Self::default()
   }

   /// Enters a locked section, or returns `None` once cancellation has been
   /// requested.
   pub fn lock(&self) -> Option<CleanupLock<'_>> {
      let mut state = self.state.lock();
      if state.cancelled {
         return None;
      }
      state.locked = true;
      Some(CleanupLock { guard: self })
   }

   pub fn is_locked(&self) -> bool {
      self.state.lock().locked
   }

   /// Asks the worker to stop. Does not wait.
   pub fn request_cancel(&self) {
      self.state.lock().cancelled = true;
   }

   pub fn is_cancelled(&self) -> bool {
      self.state.lock().cancelled
   }

   /// Blocks while a worker is inside a locked section.
   pub fn wait_unlocked(&self) {
      let mut state = self.state.lock();
      while state.locked {
         self.unlocked.wait(&mut state);
      }
   }

   /// Clears a previous cancellation before a new worker starts.
   pub fn reset(&self) {
      let mut state = self.state.lock();
      state.cancelled = false;
      state.locked = false;
   }
}
