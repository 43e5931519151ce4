//! Render loop: the single consumer of the frame state.
//!
//! Every tick, under the frame lock, the renderer decides whether it has
//! enough data, computes where "now" sits between *previous* and *current*,
//! and runs each pixel through interpolation, lookup-table correction,
//! error-diffusion dithering and 8-bit quantization before handing it to the
//! output driver. All per-pixel math is integer fixed point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::color::{ChannelOrder, Pixel, CHANNELS};
use crate::driver::{DriverError, OutputDriver};
use crate::frame::{DitherCell, SlotRole};
use crate::ingest::FrameStore;
use crate::lut::ChannelLuts;
use crate::rate::{RateScheduler, TickStats};

/// Backoff while there is not enough data to render.
pub const SUSPEND_BACKOFF: Duration = Duration::from_millis(10);
/// Backoff while the current frame is exhausted and the next one is not due.
pub const EXHAUSTED_BACKOFF: Duration = Duration::from_millis(1);
/// Interval between rate reports.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(10);
/// Dithering is only applied while the average tick is faster than this (100 fps).
pub const DITHER_MAX_TICK_US: u64 = 10_000;
/// A dithered pixel may only toggle as slowly as ~60 Hz before it is reset.
pub const DITHER_FLICKER_PERIOD_US: u64 = 16_667;

/// Errors that end the render loop.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// The output driver failed to commit a frame
    #[error("output driver failed: {0}")]
    Driver(#[from] DriverError),
}

/// Render options taken from the server configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderSettings {
    pub interpolation: bool,
    pub dithering: bool,
    pub lookup_table: bool,
    pub channel_order: ChannelOrder,
    /// Render ticks per second; 0 renders as fast as the driver allows.
    pub rate_hz: u32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        RenderSettings {
            interpolation: true,
            dithering: true,
            lookup_table: true,
            channel_order: ChannelOrder::default(),
            rate_hz: 400,
        }
    }
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Not enough valid frames to render anything.
    Suspended,
    /// The current frame's window has elapsed and the next frame is not due yet.
    Exhausted,
    /// The current frame was overdue and *next* was forced in.
    ForcedRotation,
    /// A frame was rendered and committed.
    Rendered,
}

/// 16-bit interpolation weights between *previous* and *current*.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub progress: u32,
    pub inv_progress: u32,
}

impl Progress {
    /// Weight `elapsed` against the predicted display `window`.
    ///
    /// `progress + inv_progress == 0xFFFF` always holds; `elapsed >= window`
    /// saturates at full weight on *current*.
    pub fn new(elapsed: Duration, window: Duration) -> Self {
        let elapsed_us = elapsed.as_micros() as u64;
        let window_us = window.as_micros() as u64;
        let progress = if window_us == 0 {
            0xFFFF
        } else {
            ((elapsed_us << 16) / window_us).min(0xFFFF)
        } as u32;
        Progress {
            progress,
            inv_progress: 0xFFFF - progress,
        }
    }

    /// Full weight on *current*; used when interpolation is disabled.
    pub fn current_only() -> Self {
        Progress {
            progress: 0xFFFF,
            inv_progress: 0,
        }
    }
}

/// Per-tick parameters shared by every pixel.
#[derive(Debug, Clone, Copy)]
pub struct PixelParams {
    /// `None` displays *current* at full weight.
    pub interpolate: Option<Progress>,
    pub lookup_table: bool,
    pub dithering: bool,
    /// Ticks a residual may survive without visible effect.
    pub max_dither_ticks: u32,
    /// Monotonic (wrapping) dithering tick index.
    pub tick: u32,
}

#[inline]
fn round_to_u8(value: i32) -> i32 {
    ((value + 0x80) >> 8).clamp(0, 255)
}

/// Run one pixel through the full pipeline and update its dithering cell.
///
/// Returns the quantized RGB output (not yet permuted into wire order).
#[inline]
pub fn render_pixel(
    prev: Pixel,
    current: Pixel,
    cell: &mut DitherCell,
    luts: &ChannelLuts,
    params: &PixelParams,
) -> [u8; CHANNELS] {
    let prev = [prev.r, prev.g, prev.b];
    let current = [current.r, current.g, current.b];

    // Interpolate into a ~16-bit intermediate
    let mut value = [0u32; CHANNELS];
    for c in 0..CHANNELS {
        value[c] = match params.interpolate {
            Some(p) => {
                (u32::from(prev[c]) * p.inv_progress + u32::from(current[c]) * p.progress) >> 8
            }
            None => u32::from(current[c]) << 8,
        };
    }

    if params.lookup_table {
        value = luts.apply(value);
    }

    dither_and_quantize(value, cell, params)
}

/// Error-diffusion and rounding stage for one pixel of corrected 16-bit values.
#[inline]
pub fn dither_and_quantize(
    value: [u32; CHANNELS],
    cell: &mut DitherCell,
    params: &PixelParams,
) -> [u8; CHANNELS] {
    let mut out = [0u8; CHANNELS];
    for c in 0..CHANNELS {
        // Drop residuals that have not changed the output recently, so
        // static content does not flicker at low frequency
        if params.tick.wrapping_sub(cell.last_effect[c]) > params.max_dither_ticks {
            cell.residual[c] = 0;
            cell.last_effect[c] = params.tick;
        }

        let corrected = value[c].min(0xFFFF) as i32;
        let dithered = if params.dithering {
            corrected + i32::from(cell.residual[c])
        } else {
            corrected
        };

        let quantized = round_to_u8(dithered);
        out[c] = quantized as u8;

        if quantized != round_to_u8(corrected) {
            cell.last_effect[c] = params.tick;
        }

        if params.dithering {
            // One output step is 257 in the 16-bit domain (255 * 257 = 0xFFFF)
            let residual = dithered - quantized * 257;
            cell.residual[c] = residual.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
        }
    }
    out
}

/// The render loop and its bookkeeping.
pub struct Renderer<D: OutputDriver> {
    store: Arc<FrameStore>,
    driver: D,
    settings: RenderSettings,
    stats: TickStats,
    dither_tick: u32,
}

impl<D: OutputDriver> Renderer<D> {
    pub fn new(store: Arc<FrameStore>, driver: D, settings: RenderSettings) -> Self {
        Renderer {
            store,
            driver,
            settings,
            stats: TickStats::new(REPORT_INTERVAL, Instant::now()),
            dither_tick: 0,
        }
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Whether dithering applies given the measured average tick duration.
    pub fn dithering_active(&self) -> bool {
        self.settings.dithering && self.stats.avg_tick_us() < DITHER_MAX_TICK_US
    }

    /// Ticks a residual may go without visible effect, so it toggles no
    /// slower than ~60 Hz at the measured tick rate.
    pub fn max_dither_ticks(&self) -> u32 {
        (DITHER_FLICKER_PERIOD_US / self.stats.avg_tick_us()) as u32
    }

    /// Run a single tick as if the current time were `now`.
    pub fn tick_at(&mut self, now: Instant) -> Result<TickOutcome, RenderError> {
        let mut state = self.store.lock();
        state.bump_frame_counter();

        let interpolate = if !self.settings.interpolation {
            // Show the newest frame at full weight immediately
            if state.has(SlotRole::Next) {
                state.rotate();
            }
            if !state.has(SlotRole::Current) {
                return Ok(TickOutcome::Suspended);
            }
            None
        } else {
            if !state.has(SlotRole::Previous) || !state.has(SlotRole::Current) {
                return Ok(TickOutcome::Suspended);
            }

            let elapsed = state.elapsed(now);
            let window = state.display_window();
            if elapsed > window {
                let has_next = state.has(SlotRole::Next);
                drop(state);

                // Only force the next frame in when it is really late, so
                // timing jitter does not switch frames a tick early
                if has_next && elapsed > window * 2 {
                    log::debug!(
                        "[render] Need data: rotating in; elapsed={:?} window={:?}",
                        elapsed,
                        window
                    );
                    self.store.lock().rotate();
                    return Ok(TickOutcome::ForcedRotation);
                }
                log::debug!(
                    "[render] Need data: none available; elapsed={:?} window={:?}",
                    elapsed,
                    window
                );
                return Ok(TickOutcome::Exhausted);
            }
            Some(Progress::new(elapsed, window))
        };

        let started = Instant::now();
        self.dither_tick = self.dither_tick.wrapping_add(1);
        let params = PixelParams {
            interpolate,
            lookup_table: self.settings.lookup_table,
            dithering: self.dithering_active(),
            max_dither_ticks: self.max_dither_ticks(),
            tick: self.dither_tick,
        };
        let order = self.settings.channel_order;
        let layout = state.layout();

        let view = state.render_view();
        let mut data_index = 0;
        for strip in 0..layout.strips {
            for led in 0..layout.leds_per_strip {
                let [r, g, b] = render_pixel(
                    view.previous[data_index],
                    view.current[data_index],
                    &mut view.dither[data_index],
                    view.luts,
                    &params,
                );
                self.driver.write_pixel(strip, led, order.permute(r, g, b));
                data_index += 1;
            }
        }

        // Commit while still holding the lock so ingestion never interleaves
        // with a half-written output frame
        self.driver.commit_frame()?;
        drop(state);

        let finished = Instant::now();
        if let Some(report) = self.stats.record(finished - started, finished) {
            log::info!(
                "[render] fps_info={{frame_avg_usec: {}, possible_fps: {:.2}, actual_fps: {:.2}, sample_frames: {}}}",
                report.avg_tick_us,
                report.possible_fps,
                report.actual_fps,
                report.frames
            );
        }

        Ok(TickOutcome::Rendered)
    }

    /// Render until `shutdown` is raised or the driver fails.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), RenderError> {
        log::info!(
            "[render] Starting render thread for {} total pixels",
            self.store.layout().pixel_count()
        );

        let rate_hz = self.settings.rate_hz;
        let mut scheduler = (rate_hz > 0).then(|| RateScheduler::new(rate_hz));

        while !shutdown.load(Ordering::Relaxed) {
            match self.tick_at(Instant::now())? {
                TickOutcome::Rendered => {
                    if let Some(s) = scheduler.as_mut() {
                        s.wait_next_tick();
                    }
                    continue;
                }
                TickOutcome::ForcedRotation => {}
                TickOutcome::Exhausted => thread::sleep(EXHAUSTED_BACKOFF),
                TickOutcome::Suspended => thread::sleep(SUSPEND_BACKOFF),
            }
            // Restart the schedule after a stall instead of bursting to catch up
            if let Some(s) = scheduler.as_mut() {
                s.reset(Instant::now());
            }
        }

        log::info!("[render] Render thread stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{MemoryDriver, NopDriver};
    use crate::frame::FrameLayout;
    use crate::lut::WhitePoint;

    fn params(dithering: bool, tick: u32) -> PixelParams {
        PixelParams {
            interpolate: None,
            lookup_table: false,
            dithering,
            max_dither_ticks: 8,
            tick,
        }
    }

    fn grey(v: u8) -> Pixel {
        Pixel { r: v, g: v, b: v }
    }

    fn settings(interpolation: bool, dithering: bool, lookup_table: bool) -> RenderSettings {
        RenderSettings {
            interpolation,
            dithering,
            lookup_table,
            channel_order: ChannelOrder::Rgb,
            rate_hz: 0,
        }
    }

    // ==================== Progress ====================

    #[test]
    fn test_progress_bounds() {
        let window = Duration::from_millis(100);
        for ms in 0..=100u64 {
            let p = Progress::new(Duration::from_millis(ms), window);
            assert!(p.progress <= 0xFFFF);
            assert_eq!(p.progress + p.inv_progress, 0xFFFF);
        }
    }

    #[test]
    fn test_progress_midpoint() {
        let p = Progress::new(Duration::from_millis(50), Duration::from_millis(100));
        assert_eq!(p.progress, 0x8000);
        assert_eq!(p.inv_progress, 0x7FFF);
    }

    #[test]
    fn test_progress_zero_window_saturates() {
        let p = Progress::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(p, Progress::current_only());
    }

    // ==================== Per-pixel pipeline ====================

    #[test]
    fn test_no_interpolation_passes_current_through() {
        let luts = ChannelLuts::default();
        let mut cell = DitherCell::default();
        let out = render_pixel(grey(0), Pixel { r: 10, g: 200, b: 255 }, &mut cell, &luts, &params(false, 1));
        assert_eq!(out, [10, 200, 255]);
    }

    #[test]
    fn test_interpolation_halfway() {
        let luts = ChannelLuts::default();
        let mut cell = DitherCell::default();
        let mut p = params(false, 1);
        p.interpolate = Some(Progress::new(Duration::from_millis(50), Duration::from_millis(100)));
        let out = render_pixel(grey(0), grey(255), &mut cell, &luts, &p);
        assert_eq!(out, [128, 128, 128]);
    }

    #[test]
    fn test_lookup_table_darkens_midtones() {
        let luts = ChannelLuts::new(
            WhitePoint {
                red: 1.0,
                green: 1.0,
                blue: 1.0,
            },
            2.0,
        );
        let mut cell = DitherCell::default();
        let mut p = params(false, 1);
        p.lookup_table = true;
        let out = render_pixel(grey(0), grey(128), &mut cell, &luts, &p);
        // (128/256)^2 · 65535 = 16384 -> 64
        assert_eq!(out, [64, 64, 64]);

        let out = render_pixel(grey(0), grey(255), &mut cell, &luts, &p);
        assert!(out.iter().all(|&c| c >= 253));
    }

    #[test]
    fn test_quantize_clamps_top() {
        let luts = ChannelLuts::default();
        let mut cell = DitherCell {
            residual: [500, 500, 500],
            last_effect: [1, 1, 1],
        };
        let out = render_pixel(grey(0), grey(255), &mut cell, &luts, &params(true, 1));
        assert_eq!(out, [255, 255, 255]);
    }

    #[test]
    fn test_quantize_clamps_bottom() {
        let luts = ChannelLuts::default();
        let mut cell = DitherCell {
            residual: [-300, -300, -300],
            last_effect: [1, 1, 1],
        };
        let out = render_pixel(grey(0), grey(0), &mut cell, &luts, &params(true, 1));
        assert_eq!(out, [0, 0, 0]);
    }

    #[test]
    fn test_dithering_disabled_leaves_residual_untouched() {
        let luts = ChannelLuts::default();
        let mut cell = DitherCell {
            residual: [5, 6, 7],
            last_effect: [1, 1, 1],
        };
        render_pixel(grey(0), grey(100), &mut cell, &luts, &params(false, 1));
        assert_eq!(cell.residual, [5, 6, 7]);
    }

    #[test]
    fn test_stale_residual_is_reset() {
        let luts = ChannelLuts::default();
        let mut cell = DitherCell {
            residual: [100, 100, 100],
            last_effect: [0, 0, 0],
        };
        // 20 ticks since the last visible effect, cap is 8
        render_pixel(grey(0), grey(50), &mut cell, &luts, &params(false, 20));
        assert_eq!(cell.residual, [0, 0, 0]);
        assert_eq!(cell.last_effect, [20, 20, 20]);
    }

    #[test]
    fn test_reset_handles_tick_wraparound() {
        let luts = ChannelLuts::default();
        let mut cell = DitherCell {
            residual: [3, 3, 3],
            last_effect: [u32::MAX - 1, u32::MAX - 1, u32::MAX - 1],
        };
        // Distance across the wrap is 3, below the cap
        render_pixel(grey(0), grey(50), &mut cell, &luts, &params(false, 1));
        assert_eq!(cell.residual, [3, 3, 3]);
    }

    fn dither_params(tick: u32) -> PixelParams {
        PixelParams {
            interpolate: None,
            lookup_table: false,
            dithering: true,
            max_dither_ticks: 8,
            tick,
        }
    }

    #[test]
    fn test_dithering_conserves_average() {
        let mut cell = DitherCell::default();

        // A corrected value halfway between two output steps: 100.5 * 257
        let target = 25828u32;
        let ticks = 1000u32;
        let mut sum = 0u64;
        for tick in 1..=ticks {
            let out = dither_and_quantize([target; 3], &mut cell, &dither_params(tick));
            assert_eq!(out[0], out[1]);
            assert_eq!(out[1], out[2]);
            sum += u64::from(out[0]);
        }
        let avg = sum as f64 / f64::from(ticks);
        let expected = f64::from(target) / 257.0;
        assert!((avg - expected).abs() < 0.05, "avg {} expected {}", avg, expected);
    }

    #[test]
    fn test_dithering_toggles_between_neighbouring_levels() {
        let mut cell = DitherCell::default();
        let mut seen = std::collections::BTreeSet::new();
        for tick in 1..=50u32 {
            seen.insert(dither_and_quantize([25828; 3], &mut cell, &dither_params(tick))[0]);
        }
        assert_eq!(seen.into_iter().collect::<Vec<_>>(), vec![100, 101]);
    }

    #[test]
    fn test_without_dithering_output_is_plain_rounding() {
        let mut cell = DitherCell::default();
        let mut p = dither_params(1);
        p.dithering = false;
        for tick in 1..=10u32 {
            p.tick = tick;
            assert_eq!(dither_and_quantize([25828; 3], &mut cell, &p), [101, 101, 101]);
        }
    }

    // ==================== Render loop ====================

    fn store(strips: usize, leds: usize) -> Arc<FrameStore> {
        Arc::new(FrameStore::new(FrameLayout::new(strips, leds), ChannelLuts::default()))
    }

    #[test]
    fn test_suspended_without_data() {
        let store = store(1, 4);
        let mut renderer = Renderer::new(store, NopDriver::new(), settings(true, false, false));
        assert_eq!(renderer.tick_at(Instant::now()).unwrap(), TickOutcome::Suspended);
        assert_eq!(renderer.driver().commits(), 0);
    }

    #[test]
    fn test_suspended_with_only_one_frame_when_interpolating() {
        let store = store(1, 4);
        let now = Instant::now();
        store.submit_frame_at(&[1; 12], true, now);
        store.submit_frame_at(&[2; 12], true, now);
        let mut renderer = Renderer::new(store, NopDriver::new(), settings(true, false, false));
        // Only current is valid; previous is still empty
        assert_eq!(renderer.tick_at(now).unwrap(), TickOutcome::Suspended);
    }

    #[test]
    fn test_no_interpolation_promotes_next_immediately() {
        let store = store(1, 2);
        let driver = MemoryDriver::new(FrameLayout::new(1, 2));
        let handle = driver.handle();
        let now = Instant::now();
        store.submit_frame_at(&[9, 8, 7, 6, 5, 4], true, now);

        let mut renderer = Renderer::new(store.clone(), driver, settings(false, false, false));
        assert_eq!(renderer.tick_at(now).unwrap(), TickOutcome::Rendered);
        assert_eq!(handle.pixel(0, 0), Some([9, 8, 7]));
        assert_eq!(handle.pixel(0, 1), Some([6, 5, 4]));
        assert!(!store.lock().has(SlotRole::Next));
    }

    #[test]
    fn test_frame_counter_advances_every_tick() {
        let store = store(1, 1);
        let mut renderer = Renderer::new(store.clone(), NopDriver::new(), settings(true, false, false));
        renderer.tick_at(Instant::now()).unwrap();
        renderer.tick_at(Instant::now()).unwrap();
        assert_eq!(store.frame_counter(), 2);
    }

    #[test]
    fn test_channel_order_applied_at_write() {
        let store = store(1, 1);
        let driver = MemoryDriver::new(FrameLayout::new(1, 1));
        let handle = driver.handle();
        store.submit_frame(&[10, 20, 30], true);

        let mut s = settings(false, false, false);
        s.channel_order = ChannelOrder::Brg;
        let mut renderer = Renderer::new(store, driver, s);
        renderer.tick_at(Instant::now()).unwrap();
        assert_eq!(handle.pixel(0, 0), Some([30, 10, 20]));
    }

    #[test]
    fn test_dithering_gated_by_average_tick() {
        let store = store(1, 1);
        let renderer = Renderer::new(store.clone(), NopDriver::new(), settings(true, true, true));
        // Initial 2ms average is well under the 10ms threshold
        assert!(renderer.dithering_active());

        let renderer = Renderer::new(store, NopDriver::new(), settings(true, false, true));
        assert!(!renderer.dithering_active());
    }

    /// Replace the measured average with one reporting window of `tick`.
    fn measured<D: OutputDriver>(renderer: &mut Renderer<D>, tick: Duration) {
        let t0 = Instant::now();
        renderer.stats = TickStats::new(REPORT_INTERVAL, t0);
        assert!(renderer.stats.record(tick, t0 + REPORT_INTERVAL).is_some());
    }

    #[test]
    fn test_slow_ticks_disable_dithering() {
        let mut renderer = Renderer::new(store(1, 1), NopDriver::new(), settings(true, true, true));

        measured(&mut renderer, Duration::from_micros(9_999));
        assert!(renderer.dithering_active());

        measured(&mut renderer, Duration::from_millis(10));
        assert!(!renderer.dithering_active());

        measured(&mut renderer, Duration::from_millis(25));
        assert!(!renderer.dithering_active());
    }

    #[test]
    fn test_dither_cap_follows_measured_rate() {
        let mut renderer = Renderer::new(store(1, 1), NopDriver::new(), settings(true, true, true));
        // Initial 2ms estimate
        assert_eq!(renderer.max_dither_ticks(), 8);

        measured(&mut renderer, Duration::from_millis(5));
        assert_eq!(renderer.max_dither_ticks(), 3);

        measured(&mut renderer, Duration::from_micros(500));
        assert_eq!(renderer.max_dither_ticks(), 33);
    }

    #[test]
    fn test_idle_residual_reset_after_derived_cap() {
        let store = store(1, 1);
        store.submit_frame(&[0, 0, 0], true);
        let mut renderer = Renderer::new(
            Arc::clone(&store),
            NopDriver::new(),
            settings(false, true, false),
        );
        measured(&mut renderer, Duration::from_millis(5));
        assert_eq!(renderer.max_dither_ticks(), 3);

        // A residual too small to change a black pixel
        store.lock().render_view().dither[0].residual = [100; CHANNELS];

        for _ in 0..3 {
            assert_eq!(renderer.tick_at(Instant::now()).unwrap(), TickOutcome::Rendered);
            assert_eq!(store.lock().dither_cells()[0].residual, [100; CHANNELS]);
        }

        // Fourth tick without effect exceeds the cap
        assert_eq!(renderer.tick_at(Instant::now()).unwrap(), TickOutcome::Rendered);
        assert_eq!(store.lock().dither_cells()[0].residual, [0; CHANNELS]);
    }
}
