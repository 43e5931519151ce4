//! Configuration file handling for opc-server.
//!
//! Loads configuration from `<config dir>/opc-server/config.toml` or a custom
//! path. Every section is optional; missing keys take their defaults.

use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::color::ChannelOrder;
use crate::fallback::DemoMode;
use crate::frame::FrameLayout;
use crate::lut::{ChannelLuts, WhitePoint};
use crate::render::RenderSettings;

/// Largest strip count the output hardware supports.
pub const MAX_STRIPS: usize = 48;
/// Largest pixel count per strip.
pub const MAX_LEDS_PER_STRIP: usize = 1024;
/// Upper bound for the luminance curve exponent.
pub const MAX_LUM_POWER: f32 = 10.0;

/// Server configuration as read from `config.toml`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    pub strips: StripConfig,
    pub render: RenderConfig,
    pub fallback: FallbackConfig,
    pub output: OutputConfig,
}

/// Listener ports. Port 0 disables a listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub tcp_port: u16,
    pub udp_port: u16,
    pub e131_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            tcp_port: 7890,
            udp_port: 7890,
            e131_port: 5568,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StripConfig {
    pub leds_per_strip: usize,
    pub used_strip_count: usize,
    pub channel_order: ChannelOrder,
}

impl Default for StripConfig {
    fn default() -> Self {
        StripConfig {
            leds_per_strip: 176,
            used_strip_count: MAX_STRIPS,
            channel_order: ChannelOrder::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub interpolation: bool,
    pub dithering: bool,
    pub lookup_table: bool,
    pub lum_power: f32,
    /// Render ticks per second; 0 renders unpaced.
    pub rate_hz: u32,
    pub white_point: WhitePoint,
}

impl Default for RenderConfig {
    fn default() -> Self {
        RenderConfig {
            interpolation: true,
            dithering: true,
            lookup_table: true,
            lum_power: 2.0,
            rate_hz: 400,
            white_point: WhitePoint::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub mode: DemoMode,
}

/// Where rendered frames go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Discard frames
    #[default]
    Nop,
    /// Append raw frames to a file or FIFO
    Raw,
}

impl std::fmt::Display for OutputMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputMode::Nop => write!(f, "nop"),
            OutputMode::Raw => write!(f, "raw"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub mode: OutputMode,
    pub path: Option<PathBuf>,
}

/// Flat summary answered to OPC "get config" requests.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigSummary<'a> {
    output_mode: String,
    demo_mode: String,
    leds_per_strip: usize,
    used_strip_count: usize,
    color_channel_order: String,
    opc_tcp_port: u16,
    opc_udp_port: u16,
    e131_port: u16,
    enable_interpolation: bool,
    enable_dithering: bool,
    enable_lookup_table: bool,
    lum_curve_power: f32,
    white_point: &'a WhitePoint,
}

impl ServerConfig {
    /// Load configuration from a file path.
    /// Returns default config if the file doesn't exist.
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match default_path() {
                Some(p) => p,
                None => return Ok(ServerConfig::default()),
            },
        };

        if path.exists() {
            Self::load_from(&path)
        } else {
            log::debug!("[config] No config file at {}, using defaults", path.display());
            Ok(ServerConfig::default())
        }
    }

    /// Load configuration from an existing file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("[config] Loaded {}", path.display());
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Write the configuration to `path`, creating parent directories.
    /// Refuses to overwrite an existing file.
    pub fn save_new(&self, path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Err(ConfigError::AlreadyExists(path.to_path_buf()));
        }
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(path, self.to_toml()?).map_err(io_err)
    }

    /// Check every value against its supported range.
    ///
    /// All violations are reported together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        let mut int_range = |name: &str, min: usize, max: usize, value: usize| {
            if !(min..=max).contains(&value) {
                errors.push(format!(
                    "Given {} ({}) is outside of range {}-{} (inclusive)",
                    name, value, min, max
                ));
            }
        };
        int_range("LED Count", 1, MAX_LEDS_PER_STRIP, self.strips.leds_per_strip);
        int_range("Strip/Channel Count", 1, MAX_STRIPS, self.strips.used_strip_count);

        let mut float_range = |name: &str, max: f32, value: f32| {
            if !(0.0..=max).contains(&value) {
                errors.push(format!(
                    "Given {} ({}) is outside of range 0-{} (inclusive)",
                    name, value, max
                ));
            }
        };
        let wp = &self.render.white_point;
        float_range("Luminance Curve Power", MAX_LUM_POWER, self.render.lum_power);
        float_range("Red White Point", 1.0, wp.red);
        float_range("Green White Point", 1.0, wp.green);
        float_range("Blue White Point", 1.0, wp.blue);

        if self.output.mode == OutputMode::Raw && self.output.path.is_none() {
            errors.push("Raw output requires an output path".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    pub fn layout(&self) -> FrameLayout {
        FrameLayout::new(self.strips.used_strip_count, self.strips.leds_per_strip)
    }

    pub fn luts(&self) -> ChannelLuts {
        ChannelLuts::new(self.render.white_point, self.render.lum_power)
    }

    pub fn render_settings(&self) -> RenderSettings {
        RenderSettings {
            interpolation: self.render.interpolation,
            dithering: self.render.dithering,
            lookup_table: self.render.lookup_table,
            channel_order: self.strips.channel_order,
            rate_hz: self.render.rate_hz,
        }
    }

    /// JSON answer for the OPC "get config" command.
    pub fn to_json(&self) -> Result<String, ConfigError> {
        let summary = ConfigSummary {
            output_mode: self.output.mode.to_string(),
            demo_mode: self.fallback.mode.to_string(),
            leds_per_strip: self.strips.leds_per_strip,
            used_strip_count: self.strips.used_strip_count,
            color_channel_order: self.strips.channel_order.to_string(),
            opc_tcp_port: self.network.tcp_port,
            opc_udp_port: self.network.udp_port,
            e131_port: self.network.e131_port,
            enable_interpolation: self.render.interpolation,
            enable_dithering: self.render.dithering,
            enable_lookup_table: self.render.lookup_table,
            lum_curve_power: self.render.lum_power,
            white_point: &self.render.white_point,
        };
        Ok(serde_json::to_string_pretty(&summary)?)
    }
}

/// Errors that can occur when loading, saving or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Failed to encode config as JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Config file '{}' already exists", .0.display())]
    AlreadyExists(PathBuf),
    #[error("Could not determine the config directory")]
    NoConfigDir,
    #[error("Invalid configuration:\n  {}", .0.join("\n  "))]
    Invalid(Vec<String>),
}

/// Get the default config file path.
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("opc-server").join("config.toml"))
}
