//! Triple-buffered frame state.
//!
//! Three pixel slots play the roles *previous*, *current* and *next*. Roles
//! are an index permutation over a fixed array of slots, so rotation swaps
//! indices and never copies pixel data. The state also owns the per-pixel
//! dithering residuals, the render frame counter, the last remote activity
//! timestamp and the correction tables.
//!
//! `FrameState` itself is not synchronized; the ingestion layer wraps it in
//! a mutex (see [`crate::ingest::FrameStore`]).

use std::time::{Duration, Instant};

use crate::color::{Pixel, CHANNELS};
use crate::lut::ChannelLuts;

/// Role a slot currently plays in the interpolation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRole {
    Previous,
    Current,
    Next,
}

/// One full set of pixel values for every strip at one point in time.
#[derive(Debug, Clone)]
pub struct Slot {
    pixels: Vec<Pixel>,
    valid: bool,
    arrived: Instant,
}

impl Slot {
    fn new(pixel_count: usize, now: Instant) -> Self {
        Slot {
            pixels: vec![Pixel::default(); pixel_count],
            valid: false,
            arrived: now,
        }
    }

    pub fn pixels(&self) -> &[Pixel] {
        &self.pixels
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn arrived(&self) -> Instant {
        self.arrived
    }

    /// Copy raw RGB bytes into the slot, truncating overlong input and
    /// zero-filling pixels the input does not reach.
    fn fill_from_bytes(&mut self, bytes: &[u8]) {
        let mut chunks = bytes.chunks(CHANNELS);
        for pixel in self.pixels.iter_mut() {
            *pixel = match chunks.next() {
                Some(chunk) => Pixel {
                    r: chunk[0],
                    g: chunk.get(1).copied().unwrap_or(0),
                    b: chunk.get(2).copied().unwrap_or(0),
                },
                None => Pixel::default(),
            };
        }
    }
}

/// Per-pixel dithering state: a signed residual and the tick at which each
/// channel last changed the quantized output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DitherCell {
    pub residual: [i16; CHANNELS],
    pub last_effect: [u32; CHANNELS],
}

/// Index permutation assigning slots to roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Roles {
    previous: usize,
    current: usize,
    next: usize,
}

/// Shape of the pixel buffers: strips × pixels per strip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub strips: usize,
    pub leds_per_strip: usize,
}

impl FrameLayout {
    pub fn new(strips: usize, leds_per_strip: usize) -> Self {
        FrameLayout {
            strips,
            leds_per_strip,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.strips * self.leds_per_strip
    }

    pub fn byte_len(&self) -> usize {
        self.pixel_count() * CHANNELS
    }
}

/// Frame slots, dithering buffer, counters and correction tables.
#[derive(Debug)]
pub struct FrameState {
    layout: FrameLayout,
    slots: [Slot; 3],
    roles: Roles,
    dither: Vec<DitherCell>,
    frame_counter: u64,
    last_remote: Option<Instant>,
    luts: ChannelLuts,
}

impl FrameState {
    pub fn new(layout: FrameLayout, luts: ChannelLuts) -> Self {
        Self::new_at(layout, luts, Instant::now())
    }

    pub fn new_at(layout: FrameLayout, luts: ChannelLuts, now: Instant) -> Self {
        let count = layout.pixel_count();
        FrameState {
            layout,
            slots: [
                Slot::new(count, now),
                Slot::new(count, now),
                Slot::new(count, now),
            ],
            roles: Roles {
                previous: 0,
                current: 1,
                next: 2,
            },
            dither: vec![DitherCell::default(); count],
            frame_counter: 0,
            last_remote: None,
            luts,
        }
    }

    pub fn layout(&self) -> FrameLayout {
        self.layout
    }

    fn index_of(&self, role: SlotRole) -> usize {
        match role {
            SlotRole::Previous => self.roles.previous,
            SlotRole::Current => self.roles.current,
            SlotRole::Next => self.roles.next,
        }
    }

    pub fn slot(&self, role: SlotRole) -> &Slot {
        &self.slots[self.index_of(role)]
    }

    /// Physical slot index currently holding `role`.
    pub fn slot_index(&self, role: SlotRole) -> usize {
        self.index_of(role)
    }

    pub fn has(&self, role: SlotRole) -> bool {
        self.slot(role).valid
    }

    /// Promote *current* to *previous* and *next* to *current*.
    ///
    /// A valid *current* always displaces *previous*. A valid *next* always
    /// becomes *current*. Afterwards *next* is empty.
    pub fn rotate(&mut self) {
        if self.slots[self.roles.current].valid {
            std::mem::swap(&mut self.roles.previous, &mut self.roles.current);
            self.slots[self.roles.current].valid = false;
        }
        if self.slots[self.roles.next].valid {
            std::mem::swap(&mut self.roles.current, &mut self.roles.next);
            self.slots[self.roles.next].valid = false;
        }
    }

    /// Rotate, then write `bytes` into the (now empty) *next* slot.
    pub fn rotate_and_write(&mut self, bytes: &[u8], now: Instant) {
        self.rotate();
        let next = &mut self.slots[self.roles.next];
        next.fill_from_bytes(bytes);
        next.valid = true;
        next.arrived = now;
    }

    /// Predicted display duration of *current*: the gap between the arrival
    /// of *previous* and *current*.
    pub fn display_window(&self) -> Duration {
        self.slot(SlotRole::Current)
            .arrived
            .saturating_duration_since(self.slot(SlotRole::Previous).arrived)
    }

    /// Time *current* has been on display at `now`.
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.slot(SlotRole::Current).arrived)
    }

    /// Split borrow for the render pass: previous and current pixels, the
    /// dithering buffer and the tables.
    pub fn render_view(&mut self) -> RenderView<'_> {
        let Roles {
            previous, current, ..
        } = self.roles;
        RenderView {
            previous: &self.slots[previous].pixels,
            current: &self.slots[current].pixels,
            dither: &mut self.dither,
            luts: &self.luts,
        }
    }

    pub fn dither_cells(&self) -> &[DitherCell] {
        &self.dither
    }

    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    pub fn bump_frame_counter(&mut self) -> u64 {
        self.frame_counter = self.frame_counter.wrapping_add(1);
        self.frame_counter
    }

    pub fn last_remote(&self) -> Option<Instant> {
        self.last_remote
    }

    pub fn mark_remote(&mut self, now: Instant) {
        self.last_remote = Some(now);
    }

    pub fn luts(&self) -> &ChannelLuts {
        &self.luts
    }

    pub fn set_luts(&mut self, luts: ChannelLuts) {
        self.luts = luts;
    }
}

/// Borrowed buffers handed to the per-pixel pipeline.
pub struct RenderView<'a> {
    pub previous: &'a [Pixel],
    pub current: &'a [Pixel],
    pub dither: &'a mut [DitherCell],
    pub luts: &'a ChannelLuts,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(pixels: usize) -> (FrameState, Instant) {
        let now = Instant::now();
        let s = FrameState::new_at(FrameLayout::new(1, pixels), ChannelLuts::default(), now);
        (s, now)
    }

    #[test]
    fn test_new_state_has_no_valid_slots() {
        let (s, _) = state(4);
        assert!(!s.has(SlotRole::Previous));
        assert!(!s.has(SlotRole::Current));
        assert!(!s.has(SlotRole::Next));
        assert_eq!(s.dither_cells().len(), 4);
        assert!(s.last_remote().is_none());
    }

    #[test]
    fn test_first_write_lands_in_next() {
        let (mut s, now) = state(2);
        s.rotate_and_write(&[1, 2, 3, 4, 5, 6], now);
        assert!(s.has(SlotRole::Next));
        assert!(!s.has(SlotRole::Current));
        assert_eq!(s.slot(SlotRole::Next).pixels()[1], Pixel { r: 4, g: 5, b: 6 });
    }

    #[test]
    fn test_three_writes_fill_all_roles() {
        let (mut s, now) = state(1);
        s.rotate_and_write(&[1, 1, 1], now);
        s.rotate_and_write(&[2, 2, 2], now + Duration::from_millis(10));
        s.rotate_and_write(&[3, 3, 3], now + Duration::from_millis(20));

        assert_eq!(s.slot(SlotRole::Previous).pixels()[0].r, 1);
        assert_eq!(s.slot(SlotRole::Current).pixels()[0].r, 2);
        assert_eq!(s.slot(SlotRole::Next).pixels()[0].r, 3);
        assert_eq!(s.display_window(), Duration::from_millis(10));
    }

    #[test]
    fn test_rotation_never_aliases_roles() {
        let (mut s, now) = state(1);
        for i in 0..20u8 {
            let before_current = s.slot_index(SlotRole::Current);
            s.rotate_and_write(&[i, i, i], now + Duration::from_millis(u64::from(i)));
            let p = s.slot_index(SlotRole::Previous);
            let c = s.slot_index(SlotRole::Current);
            let n = s.slot_index(SlotRole::Next);
            assert!(p != c && c != n && p != n);
            if i >= 2 {
                assert_ne!(before_current, c);
            }
        }
    }

    #[test]
    fn test_rotate_without_next_leaves_current_empty() {
        let (mut s, now) = state(1);
        s.rotate_and_write(&[9, 9, 9], now);
        s.rotate(); // next -> current
        assert!(s.has(SlotRole::Current));
        s.rotate(); // current -> previous, nothing to promote
        assert!(s.has(SlotRole::Previous));
        assert!(!s.has(SlotRole::Current));
        assert!(!s.has(SlotRole::Next));
        assert_eq!(s.slot(SlotRole::Previous).pixels()[0].r, 9);
    }

    #[test]
    fn test_short_write_zero_fills_tail() {
        let (mut s, now) = state(3);
        s.rotate_and_write(&[255; 9], now);
        s.rotate_and_write(&[255; 9], now);
        s.rotate_and_write(&[255; 9], now);
        // The recycled slot held stale 255s; a short write must clear them
        s.rotate_and_write(&[7, 8], now);
        let next = s.slot(SlotRole::Next).pixels();
        assert_eq!(next[0], Pixel { r: 7, g: 8, b: 0 });
        assert_eq!(next[1], Pixel::default());
        assert_eq!(next[2], Pixel::default());
    }

    #[test]
    fn test_long_write_is_truncated() {
        let (mut s, now) = state(1);
        s.rotate_and_write(&[1, 2, 3, 4, 5, 6], now);
        assert_eq!(s.slot(SlotRole::Next).pixels(), &[Pixel { r: 1, g: 2, b: 3 }]);
    }

    #[test]
    fn test_layout_sizes() {
        let layout = FrameLayout::new(48, 1024);
        assert_eq!(layout.pixel_count(), 49152);
        assert_eq!(layout.byte_len(), 147456);
    }
}
