//! Output driver abstraction.
//!
//! The render loop only depends on [`OutputDriver`]; hardware, file sinks
//! and test doubles implement it.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::color::CHANNELS;
use crate::frame::FrameLayout;

/// Errors raised by an output driver.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Failed to open the output sink
    #[error("failed to open output '{}': {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Writing a frame to the sink failed
    #[error("failed to write frame: {0}")]
    Write(#[from] std::io::Error),
}

/// Capability consumed by the render loop.
///
/// `write_pixel` receives channel values already permuted into wire order;
/// `commit_frame` flushes everything written since the previous commit and
/// may block for the duration of a transfer.
pub trait OutputDriver: Send {
    fn write_pixel(&mut self, strip: usize, index: usize, channels: [u8; CHANNELS]);

    fn commit_frame(&mut self) -> Result<(), DriverError>;
}

impl<D: OutputDriver + ?Sized> OutputDriver for Box<D> {
    fn write_pixel(&mut self, strip: usize, index: usize, channels: [u8; CHANNELS]) {
        (**self).write_pixel(strip, index, channels)
    }

    fn commit_frame(&mut self) -> Result<(), DriverError> {
        (**self).commit_frame()
    }
}

/// Discards all output. Useful for benchmarking the render path.
#[derive(Debug, Default)]
pub struct NopDriver {
    commits: u64,
}

impl NopDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commits(&self) -> u64 {
        self.commits
    }
}

impl OutputDriver for NopDriver {
    fn write_pixel(&mut self, _strip: usize, _index: usize, _channels: [u8; CHANNELS]) {}

    fn commit_frame(&mut self) -> Result<(), DriverError> {
        self.commits += 1;
        Ok(())
    }
}

/// A committed frame as seen by [`MemoryDriver`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommittedFrame {
    /// Wire-ordered channel bytes, strip-major.
    pub data: Vec<u8>,
    /// Number of commits so far, including this one.
    pub sequence: u64,
}

/// Keeps the last committed frame in memory behind a shared handle.
#[derive(Debug)]
pub struct MemoryDriver {
    layout: FrameLayout,
    pending: Vec<u8>,
    committed: Arc<Mutex<CommittedFrame>>,
}

impl MemoryDriver {
    pub fn new(layout: FrameLayout) -> Self {
        MemoryDriver {
            layout,
            pending: vec![0; layout.byte_len()],
            committed: Arc::new(Mutex::new(CommittedFrame::default())),
        }
    }

    /// Handle that observes commits after the driver moves to the render thread.
    pub fn handle(&self) -> MemoryHandle {
        MemoryHandle {
            committed: Arc::clone(&self.committed),
            leds_per_strip: self.layout.leds_per_strip,
        }
    }
}

impl OutputDriver for MemoryDriver {
    fn write_pixel(&mut self, strip: usize, index: usize, channels: [u8; CHANNELS]) {
        let offset = (strip * self.layout.leds_per_strip + index) * CHANNELS;
        if let Some(dst) = self.pending.get_mut(offset..offset + CHANNELS) {
            dst.copy_from_slice(&channels);
        }
    }

    fn commit_frame(&mut self) -> Result<(), DriverError> {
        let mut committed = self
            .committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        committed.data.clone_from(&self.pending);
        committed.sequence += 1;
        Ok(())
    }
}

/// Read side of a [`MemoryDriver`].
#[derive(Debug, Clone)]
pub struct MemoryHandle {
    committed: Arc<Mutex<CommittedFrame>>,
    leds_per_strip: usize,
}

impl MemoryHandle {
    pub fn last_frame(&self) -> CommittedFrame {
        self.committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wire-ordered channels of one pixel in the last committed frame.
    pub fn pixel(&self, strip: usize, index: usize) -> Option<[u8; CHANNELS]> {
        let frame = self.last_frame();
        let offset = (strip * self.leds_per_strip + index) * CHANNELS;
        let bytes = frame.data.get(offset..offset + CHANNELS)?;
        Some([bytes[0], bytes[1], bytes[2]])
    }

    pub fn commits(&self) -> u64 {
        self.last_frame().sequence
    }
}

/// Appends every committed frame as raw bytes to a file or FIFO, so an
/// external simulator can follow the output.
#[derive(Debug)]
pub struct RawFileDriver {
    layout: FrameLayout,
    frame: Vec<u8>,
    out: BufWriter<File>,
}

impl RawFileDriver {
    pub fn open(path: &Path, layout: FrameLayout) -> Result<Self, DriverError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| DriverError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        log::info!("[output] Writing raw frames to {}", path.display());
        Ok(RawFileDriver {
            layout,
            frame: vec![0; layout.byte_len()],
            out: BufWriter::new(file),
        })
    }
}

impl OutputDriver for RawFileDriver {
    fn write_pixel(&mut self, strip: usize, index: usize, channels: [u8; CHANNELS]) {
        let offset = (strip * self.layout.leds_per_strip + index) * CHANNELS;
        if let Some(dst) = self.frame.get_mut(offset..offset + CHANNELS) {
            dst.copy_from_slice(&channels);
        }
    }

    fn commit_frame(&mut self) -> Result<(), DriverError> {
        self.out.write_all(&self.frame)?;
        self.out.flush()?;
        Ok(())
    }
}
