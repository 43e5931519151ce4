//! Fallback (demo) content and the watchdog that drives it.
//!
//! When no remote producer has submitted a frame for [`FALLBACK_TIMEOUT`],
//! the producer starts generating synthetic frames at ~30 Hz. Its own
//! submissions are not remote, so they never reset the watchdog.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::color::{hsb_to_rgb, CHANNELS};
use crate::frame::FrameLayout;
use crate::ingest::FrameStore;
use crate::rate::{RateCounter, RateScheduler};

/// Time without remote data before fallback content starts.
pub const FALLBACK_TIMEOUT: Duration = Duration::from_secs(5);
/// Fallback frame rate.
pub const FALLBACK_RATE_HZ: u32 = 30;

const FADE_BASE_BRIGHTNESS: u32 = 196;
const FADE_BRIGHTNESS_CHANGE: u32 = 128;
const IDENTIFY_MARKER: u8 = 0b1010_1010;

// ==================== Demo modes ====================

/// Synthetic content shown while no remote producer is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DemoMode {
    /// No pattern; blanks the strips once remote data stops
    None,
    /// Animated hue and brightness sweep
    #[default]
    Fade,
    /// Strip identification pattern
    #[serde(rename = "id")]
    #[value(name = "id")]
    Identify,
    /// All pixels off
    Black,
    /// All channels at full power
    Power,
}

impl DemoMode {
    /// Parse a demo mode name (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" => Some(Self::None),
            "fade" => Some(Self::Fade),
            "id" => Some(Self::Identify),
            "black" => Some(Self::Black),
            "power" => Some(Self::Power),
            _ => None,
        }
    }
}

impl std::fmt::Display for DemoMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Fade => "fade",
            Self::Identify => "id",
            Self::Black => "black",
            Self::Power => "power",
        };
        write!(f, "{}", name)
    }
}

/// Fill `buffer` with one frame of `mode` content.
///
/// Pure in its inputs: the same `frame_index` always yields the same frame.
/// `buffer` is resized to the layout's byte length.
pub fn render_demo_frame(mode: DemoMode, frame_index: u16, layout: FrameLayout, buffer: &mut Vec<u8>) {
    buffer.resize(layout.byte_len(), 0);

    let lps = layout.leds_per_strip as u32;
    let frame_index = u32::from(frame_index);
    let mut pixels = buffer.chunks_exact_mut(CHANNELS);

    for strip in 0..layout.strips as u32 {
        for p in 0..lps {
            let Some(px) = pixels.next() else {
                return;
            };
            match mode {
                DemoMode::None | DemoMode::Black => px.fill(0),
                DemoMode::Power => px.fill(0xFF),
                DemoMode::Identify => {
                    // Strip index everywhere, except the pixel whose index
                    // matches the strip
                    let v = if strip == p {
                        IDENTIFY_MARKER
                    } else {
                        strip as u8
                    };
                    px.fill(v);
                }
                DemoMode::Fade => {
                    let hue = (frame_index + ((p + strip * lps) * 360) / (lps * 10)) % 360;
                    let brightness = FADE_BASE_BRIGHTNESS
                        - ((frame_index / 10 + (p * FADE_BRIGHTNESS_CHANGE) / lps + strip * 10)
                            % FADE_BRIGHTNESS_CHANGE);
                    let rgb = hsb_to_rgb(hue, 255, brightness as u8);
                    px.copy_from_slice(&[rgb.r, rgb.g, rgb.b]);
                }
            }
        }
    }
}

// ==================== Watchdog ====================

/// Watchdog plus demo generator, submitting through the ingestion API.
pub struct FallbackProducer {
    store: Arc<FrameStore>,
    mode: DemoMode,
    timeout: Duration,
    active: bool,
    frame_index: u16,
    buffer: Vec<u8>,
}

impl FallbackProducer {
    pub fn new(store: Arc<FrameStore>, mode: DemoMode) -> Self {
        FallbackProducer {
            store,
            mode,
            timeout: FALLBACK_TIMEOUT,
            active: false,
            frame_index: 0,
            buffer: Vec::new(),
        }
    }

    /// Override the inactivity threshold.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn mode(&self) -> DemoMode {
        self.mode
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn frame_index(&self) -> u16 {
        self.frame_index
    }

    /// One watchdog check at `now`; submits a frame while active.
    ///
    /// Returns whether a frame was submitted.
    pub fn tick_at(&mut self, now: Instant) -> bool {
        let idle = match self.store.since_remote(now) {
            Some(elapsed) => elapsed > self.timeout,
            None => true,
        };

        if idle != self.active {
            if idle {
                log::info!("[demo] Starting Demo: {}", self.mode);
            } else {
                log::info!("[demo] Stopping Demo: {}", self.mode);
            }
            self.active = idle;
        }

        let frame_index = self.frame_index;
        self.frame_index = self.frame_index.wrapping_add(3);

        if !self.active {
            return false;
        }

        render_demo_frame(self.mode, frame_index, self.store.layout(), &mut self.buffer);
        self.store.submit_frame_at(&self.buffer, false, now);
        true
    }

    /// Run the watchdog at [`FALLBACK_RATE_HZ`] until `shutdown` is raised.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        log::info!("[demo] Starting demo data thread ({})", self.mode);

        let mut scheduler = RateScheduler::new(FALLBACK_RATE_HZ);
        let mut rate = RateCounter::new(Duration::from_secs(10), Instant::now());

        while !shutdown.load(Ordering::Relaxed) {
            let now = Instant::now();
            if self.tick_at(now) && rate.add_event(now) {
                log::debug!(
                    "[demo] Sent {} frames ({:.1} fps total, {:.1} fps recent)",
                    rate.total_events(),
                    rate.total_rate(),
                    rate.recent_rate()
                );
            }
            scheduler.wait_next_tick();
        }

        log::info!("[demo] Demo data thread stopped");
    }
}
