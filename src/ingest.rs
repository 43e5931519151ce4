//! Ingestion API shared by every producer thread.
//!
//! `FrameStore` wraps [`FrameState`] in a mutex. Producers call
//! [`FrameStore::submit_frame`]; the render loop takes the lock for the
//! duration of a tick through [`FrameStore::lock`].

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::frame::{FrameLayout, FrameState};
use crate::lut::ChannelLuts;

/// Lock-guarded frame state shared between producers and the render loop.
#[derive(Debug)]
pub struct FrameStore {
    state: Mutex<FrameState>,
}

impl FrameStore {
    pub fn new(layout: FrameLayout, luts: ChannelLuts) -> Self {
        FrameStore {
            state: Mutex::new(FrameState::new(layout, luts)),
        }
    }

    /// Acquire the frame state lock.
    ///
    /// A producer that panicked mid-copy leaves at worst one partially
    /// written *next* slot, which the following submission overwrites, so a
    /// poisoned lock is recovered rather than propagated.
    pub fn lock(&self) -> MutexGuard<'_, FrameState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand a new frame of raw RGB bytes to the renderer.
    ///
    /// Buffers rotate first, then the bytes land in the empty *next* slot.
    /// Input longer than the frame is truncated; a short input zero-fills
    /// the remainder. Remote submissions refresh the watchdog timestamp,
    /// fallback submissions (`is_remote == false`) do not.
    pub fn submit_frame(&self, bytes: &[u8], is_remote: bool) {
        self.submit_frame_at(bytes, is_remote, Instant::now());
    }

    /// [`submit_frame`](Self::submit_frame) with an explicit arrival time.
    pub fn submit_frame_at(&self, bytes: &[u8], is_remote: bool, now: Instant) {
        let mut state = self.lock();
        state.rotate_and_write(bytes, now);
        if is_remote {
            state.mark_remote(now);
        }
    }

    /// Time since the last remote submission, or `None` if there never was one.
    pub fn since_remote(&self, now: Instant) -> Option<Duration> {
        self.lock()
            .last_remote()
            .map(|t| now.saturating_duration_since(t))
    }

    pub fn frame_counter(&self) -> u64 {
        self.lock().frame_counter()
    }

    pub fn layout(&self) -> FrameLayout {
        self.lock().layout()
    }

    /// Swap in new correction tables under the frame lock, so the renderer
    /// never observes a partially rebuilt table.
    pub fn rebuild_luts(&self, luts: ChannelLuts) {
        self.lock().set_luts(luts);
    }
}
