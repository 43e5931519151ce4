//! opc-server library crate.
//!
//! Receives pixel frames over Open Pixel Control (TCP and UDP) and E1.31,
//! and renders them to LED strips with temporal interpolation, luminance
//! correction and dithering.

pub mod cli;
pub mod color;
pub mod config;
pub mod driver;
pub mod fallback;
pub mod frame;
pub mod ingest;
pub mod lut;
pub mod opc;
pub mod rate;
pub mod render;
pub mod server;
pub mod transport;
