//! Session configuration and media formats.

use crate::{CodecError, CodecType, Direction};
use std::time::Duration;

/// Raw input color layout requested from an encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ColorFormat {
    /// Any YUV 4:2:0 layout the codec prefers.
    #[default]
    Yuv420Flexible,
    /// I420.
    Yuv420Planar,
    /// NV12.
    Yuv420SemiPlanar,
    /// Frames arrive through an input surface instead of byte buffers.
    Surface,
}

impl ColorFormat {
    /// Platform color-format code.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Yuv420Flexible => 0x7F42_0888,
            Self::Yuv420Planar => 19,
            Self::Yuv420SemiPlanar => 21,
            Self::Surface => 0x7F00_0789,
        }
    }

    /// Look up a platform color-format code.
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            0x7F42_0888 => Some(Self::Yuv420Flexible),
            19 => Some(Self::Yuv420Planar),
            21 => Some(Self::Yuv420SemiPlanar),
            0x7F00_0789 => Some(Self::Surface),
            _ => None,
        }
    }
}

/// Format handed to `configure` and reported on output format changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaFormat {
    /// Codec kind.
    pub codec: CodecType,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Target bit rate in bits per second (encoders only).
    pub bit_rate: Option<u32>,
    /// Frame rate in frames per second (encoders only).
    pub frame_rate: Option<u32>,
    /// Seconds between key frames (encoders only).
    pub key_frame_interval: Option<u32>,
    /// Raw color layout.
    pub color_format: Option<ColorFormat>,
}

impl MediaFormat {
    /// A bare video format with only codec and dimensions set.
    #[must_use]
    pub const fn video(codec: CodecType, width: u32, height: u32) -> Self {
        Self {
            codec,
            width,
            height,
            bit_rate: None,
            frame_rate: None,
            key_frame_interval: None,
            color_format: None,
        }
    }
}

/// Encoder configuration.
///
/// Defaults to 1280x720 HEVC at 2 Mbps, 30 fps, one key frame per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EncoderConfig {
    /// Codec kind.
    pub codec: CodecType,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Target bit rate in bits per second.
    pub bit_rate: u32,
    /// Frame rate in frames per second.
    pub frame_rate: u32,
    /// Seconds between key frames.
    pub key_frame_interval: u32,
    /// Raw input color layout.
    pub color_format: ColorFormat,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            codec: CodecType::H265,
            width: 1280,
            height: 720,
            bit_rate: 2_000_000,
            frame_rate: 30,
            key_frame_interval: 1,
            color_format: ColorFormat::Yuv420Flexible,
        }
    }
}

impl EncoderConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the codec kind.
    #[must_use]
    pub const fn codec(mut self, codec: CodecType) -> Self {
        self.codec = codec;
        self
    }

    /// Set the frame dimensions.
    #[must_use]
    pub const fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the bit rate in bits per second.
    #[must_use]
    pub const fn bit_rate(mut self, bit_rate: u32) -> Self {
        self.bit_rate = bit_rate;
        self
    }

    /// Set the frame rate.
    #[must_use]
    pub const fn frame_rate(mut self, frame_rate: u32) -> Self {
        self.frame_rate = frame_rate;
        self
    }

    /// Set the key frame interval in seconds.
    #[must_use]
    pub const fn key_frame_interval(mut self, seconds: u32) -> Self {
        self.key_frame_interval = seconds;
        self
    }

    /// Set the raw input color layout.
    #[must_use]
    pub const fn color_format(mut self, color_format: ColorFormat) -> Self {
        self.color_format = color_format;
        self
    }

    /// Size in bytes of one YUV 4:2:0 input frame.
    #[must_use]
    pub const fn frame_size(&self) -> usize {
        let pixels = self.width as usize * self.height as usize;
        pixels + pixels / 2
    }

    /// Check that the configuration describes an encodable stream.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InitializationFailed`] describing the first bad field.
    pub fn validate(&self) -> Result<(), CodecError> {
        validate_size(self.width, self.height)?;
        if self.bit_rate == 0 {
            return Err(CodecError::InitializationFailed("bit rate must be positive".into()));
        }
        if self.frame_rate == 0 {
            return Err(CodecError::InitializationFailed("frame rate must be positive".into()));
        }
        Ok(())
    }

    /// The format handed to the codec.
    #[must_use]
    pub const fn to_format(&self) -> MediaFormat {
        MediaFormat {
            codec: self.codec,
            width: self.width,
            height: self.height,
            bit_rate: Some(self.bit_rate),
            frame_rate: Some(self.frame_rate),
            key_frame_interval: Some(self.key_frame_interval),
            color_format: Some(self.color_format),
        }
    }
}

/// Decoder configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DecoderConfig {
    /// Codec kind.
    pub codec: CodecType,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            codec: CodecType::H265,
            width: 1280,
            height: 720,
        }
    }
}

impl DecoderConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the codec kind.
    #[must_use]
    pub const fn codec(mut self, codec: CodecType) -> Self {
        self.codec = codec;
        self
    }

    /// Set the frame dimensions.
    #[must_use]
    pub const fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Check that the configuration describes a decodable stream.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InitializationFailed`] if the dimensions are unusable.
    pub fn validate(&self) -> Result<(), CodecError> {
        validate_size(self.width, self.height)
    }

    /// The format handed to the codec.
    #[must_use]
    pub const fn to_format(&self) -> MediaFormat {
        MediaFormat::video(self.codec, self.width, self.height)
    }
}

impl From<&EncoderConfig> for DecoderConfig {
    fn from(config: &EncoderConfig) -> Self {
        Self {
            codec: config.codec,
            width: config.width,
            height: config.height,
        }
    }
}

fn validate_size(width: u32, height: u32) -> Result<(), CodecError> {
    if width == 0 || height == 0 {
        return Err(CodecError::InitializationFailed(format!(
            "invalid dimensions {width}x{height}"
        )));
    }
    // 4:2:0 chroma planes are subsampled by two in both directions.
    if width % 2 != 0 || height % 2 != 0 {
        return Err(CodecError::InitializationFailed(format!(
            "dimensions {width}x{height} must be even"
        )));
    }
    Ok(())
}

/// Configuration for either direction of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SessionConfig {
    /// Encoder session.
    Encode(EncoderConfig),
    /// Decoder session.
    Decode(DecoderConfig),
}

impl SessionConfig {
    /// Direction this configuration applies to.
    #[must_use]
    pub const fn direction(&self) -> Direction {
        match self {
            Self::Encode(_) => Direction::Encode,
            Self::Decode(_) => Direction::Decode,
        }
    }

    /// Codec kind.
    #[must_use]
    pub const fn codec(&self) -> CodecType {
        match self {
            Self::Encode(config) => config.codec,
            Self::Decode(config) => config.codec,
        }
    }

    /// The format handed to the codec.
    #[must_use]
    pub const fn to_format(&self) -> MediaFormat {
        match self {
            Self::Encode(config) => config.to_format(),
            Self::Decode(config) => config.to_format(),
        }
    }

    /// Validate the inner configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InitializationFailed`] describing the first bad field.
    pub fn validate(&self) -> Result<(), CodecError> {
        match self {
            Self::Encode(config) => config.validate(),
            Self::Decode(config) => config.validate(),
        }
    }
}

impl From<EncoderConfig> for SessionConfig {
    fn from(config: EncoderConfig) -> Self {
        Self::Encode(config)
    }
}

impl From<DecoderConfig> for SessionConfig {
    fn from(config: DecoderConfig) -> Self {
        Self::Decode(config)
    }
}

/// Timing and emission knobs shared by both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SessionOptions {
    /// How long `submit` waits for a free input slot before reporting busy.
    pub input_timeout: Duration,
    /// How long each drain iteration waits for completed output.
    pub output_timeout: Duration,
    /// Upper bound on the end-of-stream flush performed by `release`.
    pub flush_timeout: Duration,
    /// How long a worker keeps retrying a busy submission before dropping it.
    pub busy_timeout: Duration,
    /// Emit codec-config units (parameter sets) instead of skipping them.
    pub emit_codec_config: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            input_timeout: Duration::from_millis(10),
            output_timeout: Duration::from_millis(10),
            flush_timeout: Duration::from_secs(1),
            busy_timeout: Duration::from_secs(1),
            emit_codec_config: false,
        }
    }
}

impl SessionOptions {
    /// Create options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the input slot wait.
    #[must_use]
    pub const fn input_timeout(mut self, timeout: Duration) -> Self {
        self.input_timeout = timeout;
        self
    }

    /// Set the per-iteration output wait.
    #[must_use]
    pub const fn output_timeout(mut self, timeout: Duration) -> Self {
        self.output_timeout = timeout;
        self
    }

    /// Set the flush deadline used on release.
    #[must_use]
    pub const fn flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    /// Set how long a worker retries a busy submission.
    #[must_use]
    pub const fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Emit codec-config units, as a downstream decoder needs them.
    #[must_use]
    pub const fn emit_codec_config(mut self, emit: bool) -> Self {
        self.emit_codec_config = emit;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_defaults_match_example_stream() {
        let config = EncoderConfig::default();
        assert_eq!(config.codec, CodecType::H265);
        assert_eq!((config.width, config.height), (1280, 720));
        assert_eq!(config.bit_rate, 2_000_000);
        assert_eq!(config.frame_rate, 30);
        assert_eq!(config.key_frame_interval, 1);
        assert_eq!(config.frame_size(), 1280 * 720 * 3 / 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn encoder_rejects_unusable_settings() {
        assert!(EncoderConfig::new().size(0, 720).validate().is_err());
        assert!(EncoderConfig::new().size(1279, 720).validate().is_err());
        assert!(EncoderConfig::new().bit_rate(0).validate().is_err());
        assert!(EncoderConfig::new().frame_rate(0).validate().is_err());
    }

    #[test]
    fn encoder_format_carries_rate_control() {
        let format = EncoderConfig::new().size(640, 480).to_format();
        assert_eq!(format.codec, CodecType::H265);
        assert_eq!((format.width, format.height), (640, 480));
        assert_eq!(format.bit_rate, Some(2_000_000));
        assert_eq!(format.key_frame_interval, Some(1));
        assert_eq!(format.color_format, Some(ColorFormat::Yuv420Flexible));
    }

    #[test]
    fn decoder_follows_encoder_geometry() {
        let encoder = EncoderConfig::new().size(640, 360);
        let decoder = DecoderConfig::from(&encoder);
        assert_eq!((decoder.width, decoder.height), (640, 360));
        assert_eq!(decoder.to_format().bit_rate, None);
    }

    #[test]
    fn session_config_reports_direction() {
        let encode = SessionConfig::from(EncoderConfig::new());
        let decode = SessionConfig::from(DecoderConfig::new());
        assert_eq!(encode.direction(), Direction::Encode);
        assert_eq!(decode.direction(), Direction::Decode);
    }

    #[test]
    fn color_codes_round_trip() {
        for color in [
            ColorFormat::Yuv420Flexible,
            ColorFormat::Yuv420Planar,
            ColorFormat::Yuv420SemiPlanar,
            ColorFormat::Surface,
        ] {
            assert_eq!(ColorFormat::from_code(color.code()), Some(color));
        }
        assert_eq!(ColorFormat::from_code(42), None);
    }
}
