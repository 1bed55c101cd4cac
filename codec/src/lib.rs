//! Hardware video codec sessions with safe buffer lifecycle management.
//!
//! This crate sequences calls into a platform codec service (such as Android's
//! `MediaCodec`) for H.265 (HEVC) encoding and decoding. The compression itself
//! is performed by the platform; this crate owns the parts around it:
//! - **Sessions**: an explicit `Uninitialized → Running → Draining → Released`
//!   lifecycle, checked on every entry point.
//! - **Buffer slots**: move-only handles over codec-owned buffers, released
//!   exactly once.
//! - **Drain loop**: harvests completed output, copying encoded payloads out of
//!   transient slots before they are returned to the codec.
//! - **Output queue**: the single cross-thread hand-off between the session's
//!   thread and whoever consumes encoded units.
//!
//! Backends:
//! - **Android**: `AMediaCodec` via the NDK
//! - **Other platforms**: a stub that reports no hardware support
//! - **Passthrough**: an in-process software stand-in for hosts and tests

#![warn(missing_docs)]

/// Platform-specific implementations.
pub mod sys;

mod backend;
mod drain;
mod format;
mod loopback;
mod queue;
mod session;
mod shutdown;
mod unit;
mod worker;

pub use backend::{
    CodecBackend, CodecHandle, InputSlot, OutputSlot, OutputStatus, RenderTargetOf,
    is_hevc_decoder_supported, is_hevc_encoder_supported,
};
pub use drain::DrainReport;
pub use format::{
    ColorFormat, DecoderConfig, EncoderConfig, MediaFormat, SessionConfig, SessionOptions,
};
pub use loopback::Loopback;
pub use queue::{OutputQueue, OutputReceiver};
pub use session::{CodecSession, SessionState, Submission};
pub use unit::{DecodedFrame, EncodedUnit, FrameDescriptor, FrameFlags};
pub use worker::{SessionWorker, WorkerSummary};

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Common error type for codec operations.
///
/// A full input queue is not an error: [`CodecSession::submit`] reports it as
/// [`Submission::Busy`].
#[derive(Debug, Error)]
pub enum CodecError {
    /// The codec or format is not supported by the platform.
    #[error("unsupported codec or format: {0}")]
    Unsupported(String),
    /// Configuring or starting the codec failed.
    #[error("initialization failed: {0}")]
    InitializationFailed(String),
    /// The operation is not legal in the session's current lifecycle state.
    #[error("cannot {operation} while the session is {state}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// The state the session was in.
        state: SessionState,
    },
    /// Encoding failed.
    #[error("encoding failed: {0}")]
    EncodingFailed(String),
    /// Decoding failed.
    #[error("decoding failed: {0}")]
    DecodingFailed(String),
    /// The submitted frame does not fit the session.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

/// Supported codec types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CodecType {
    /// H.264 (AVC)
    H264,
    /// H.265 (HEVC)
    H265,
    /// VP8
    Vp8,
    /// VP9
    Vp9,
    /// AV1
    Av1,
}

impl CodecType {
    /// MIME type used by platform codec services.
    #[must_use]
    pub const fn mime(self) -> &'static str {
        match self {
            Self::H264 => "video/avc",
            Self::H265 => "video/hevc",
            Self::Vp8 => "video/x-vnd.on2.vp8",
            Self::Vp9 => "video/x-vnd.on2.vp9",
            Self::Av1 => "video/av01",
        }
    }
}

/// Which way a session transcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Raw frames in, compressed units out.
    Encode,
    /// Compressed units in, decoded frames out.
    Decode,
}

impl Direction {
    /// Error for a failed buffer operation in this direction.
    pub(crate) fn failure(self, message: impl Into<String>) -> CodecError {
        match self {
            Self::Encode => CodecError::EncodingFailed(message.into()),
            Self::Decode => CodecError::DecodingFailed(message.into()),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode => write!(f, "encoder"),
            Self::Decode => write!(f, "decoder"),
        }
    }
}

/// Generic Video Encoder trait.
pub trait VideoEncoder: Send {
    /// Encode a frame, returning whatever compressed output is ready.
    ///
    /// Hardware encoders buffer internally, so the output may be empty or
    /// belong to earlier frames.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::EncodingFailed` if encoding fails.
    fn encode(&mut self, frame: &Frame) -> Result<Vec<u8>, CodecError>;
}

/// A single frame of raw video data.
#[derive(Clone)]
pub struct Frame {
    /// Raw data (e.g. NV12, I420).
    pub data: Arc<Vec<u8>>,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Format of the data.
    pub format: PixelFormat,
    /// Timestamp in nanoseconds.
    pub timestamp_ns: u64,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("timestamp_ns", &self.timestamp_ns)
            .finish_non_exhaustive()
    }
}

/// Pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// RGBA 8-bit.
    Rgba,
    /// BGRA 8-bit.
    Bgra,
    /// NV12 (YUV 4:2:0 bi-planar).
    Nv12,
    /// I420 (YUV 4:2:0 planar).
    I420,
}

impl PixelFormat {
    /// Whether this is one of the YUV 4:2:0 layouts hardware encoders accept.
    #[must_use]
    pub const fn is_yuv420(self) -> bool {
        matches!(self, Self::Nv12 | Self::I420)
    }
}
