//! CLI argument parsing with clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::color::ChannelOrder;
use crate::config::{OutputMode, ServerConfig, MAX_LUM_POWER};
use crate::fallback::DemoMode;

/// Parse `WIDTHxHEIGHT` into a pixel count per strip.
pub fn parse_dimensions(s: &str) -> Result<usize, String> {
    let (w, h) = s
        .split_once('x')
        .ok_or_else(|| format!("Invalid dimensions '{}'. Use WIDTHxHEIGHT (e.g., 16x11)", s))?;
    let width: usize = w
        .parse()
        .map_err(|_| format!("Invalid width '{}' in dimensions", w))?;
    let height: usize = h
        .parse()
        .map_err(|_| format!("Invalid height '{}' in dimensions", h))?;
    if width == 0 || height == 0 {
        return Err("Dimensions width and height must be greater than 0".to_string());
    }
    width
        .checked_mul(height)
        .ok_or_else(|| format!("Dimensions '{}' are too large", s))
}

/// Parse and validate a white balance scalar (0.0-1.0)
fn parse_balance(s: &str) -> Result<f32, String> {
    let v: f32 = s.parse().map_err(|_| format!("'{}' is not a valid number", s))?;
    if !(0.0..=1.0).contains(&v) {
        return Err(format!("Balance must be between 0.0 and 1.0, got {}", v));
    }
    Ok(v)
}

/// Parse and validate the luminance curve exponent (0.0-10.0)
fn parse_lum_power(s: &str) -> Result<f32, String> {
    let v: f32 = s.parse().map_err(|_| format!("'{}' is not a valid number", s))?;
    if !(0.0..=MAX_LUM_POWER).contains(&v) {
        return Err(format!(
            "Luminance power must be between 0.0 and {}, got {}",
            MAX_LUM_POWER, v
        ));
    }
    Ok(v)
}

/// Open Pixel Control and E1.31 server driving LED strips
#[derive(Parser, Debug)]
#[command(name = "opc-server")]
#[command(version, about = "OPC / E1.31 frame server for LED strips", long_about = None)]
#[command(after_help = "EXAMPLES:
    # 48 strips of 64 pixels, GRB strips
    opc-server -c 64 -o grb

    # 8 strips, 16x16 panels, no UDP listener
    opc-server -s 8 -d 16x16 --udp-port 0

    # Write raw frames to a FIFO for a simulator
    opc-server --output raw --output-path /tmp/opc.fifo

    # Show the effective configuration
    opc-server config show")]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// OPC TCP port (0 disables)
    #[arg(long, short = 'p')]
    pub tcp_port: Option<u16>,

    /// OPC UDP port (0 disables)
    #[arg(long, short = 'P')]
    pub udp_port: Option<u16>,

    /// E1.31 port (0 disables)
    #[arg(long)]
    pub e131_port: Option<u16>,

    /// LEDs per strip
    #[arg(long, short = 'c')]
    pub count: Option<usize>,

    /// Number of strips in use
    #[arg(long, short = 's')]
    pub strip_count: Option<usize>,

    /// LEDs per strip as WIDTHxHEIGHT (overrides --count)
    #[arg(long, short = 'd', value_parser = parse_dimensions)]
    pub dimensions: Option<usize>,

    /// Color channel order of the strips
    #[arg(long, short = 'o')]
    pub channel_order: Option<ChannelOrder>,

    /// Content shown while no remote data arrives
    #[arg(long, short = 'D')]
    pub demo_mode: Option<DemoMode>,

    /// Disable temporal interpolation
    #[arg(long, short = 'i')]
    pub no_interpolation: bool,

    /// Disable dithering
    #[arg(long, short = 't')]
    pub no_dithering: bool,

    /// Disable the luminance/white-point lookup table
    #[arg(long, short = 'l')]
    pub no_lut: bool,

    /// Luminance curve exponent
    #[arg(long, short = 'L', value_parser = parse_lum_power)]
    pub lum_power: Option<f32>,

    /// Red white point (0.0-1.0)
    #[arg(long, short = 'r', value_parser = parse_balance)]
    pub red_bal: Option<f32>,

    /// Green white point (0.0-1.0)
    #[arg(long, short = 'g', value_parser = parse_balance)]
    pub green_bal: Option<f32>,

    /// Blue white point (0.0-1.0)
    #[arg(long, short = 'b', value_parser = parse_balance)]
    pub blue_bal: Option<f32>,

    /// Render ticks per second (0 renders unpaced)
    #[arg(long)]
    pub rate: Option<u32>,

    /// Output driver
    #[arg(long)]
    pub output: Option<OutputMode>,

    /// File or FIFO for raw output
    #[arg(long)]
    pub output_path: Option<PathBuf>,

    /// Config file path
    #[arg(long, short = 'C')]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigAction {
    /// Show effective configuration
    Show,
    /// Create default config file
    Init,
}

impl Args {
    /// Merge settings: CLI args > config file > built-in defaults.
    pub fn apply_overrides(&self, config: &mut ServerConfig) {
        if let Some(port) = self.tcp_port {
            config.network.tcp_port = port;
        }
        if let Some(port) = self.udp_port {
            config.network.udp_port = port;
        }
        if let Some(port) = self.e131_port {
            config.network.e131_port = port;
        }

        if let Some(count) = self.count {
            config.strips.leds_per_strip = count;
        }
        if let Some(count) = self.dimensions {
            config.strips.leds_per_strip = count;
        }
        if let Some(strips) = self.strip_count {
            config.strips.used_strip_count = strips;
        }
        if let Some(order) = self.channel_order {
            config.strips.channel_order = order;
        }

        if let Some(mode) = self.demo_mode {
            config.fallback.mode = mode;
        }

        let render = &mut config.render;
        if self.no_interpolation {
            render.interpolation = false;
        }
        if self.no_dithering {
            render.dithering = false;
        }
        if self.no_lut {
            render.lookup_table = false;
        }
        if let Some(power) = self.lum_power {
            render.lum_power = power;
        }
        if let Some(v) = self.red_bal {
            render.white_point.red = v;
        }
        if let Some(v) = self.green_bal {
            render.white_point.green = v;
        }
        if let Some(v) = self.blue_bal {
            render.white_point.blue = v;
        }
        if let Some(rate) = self.rate {
            render.rate_hz = rate;
        }

        if let Some(mode) = self.output {
            config.output.mode = mode;
        }
        if let Some(path) = &self.output_path {
            config.output.path = Some(path.clone());
        }
    }
}
