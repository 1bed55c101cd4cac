//! Frame metadata and the units handed across the output queue.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Buffer flags, using the platform codec's bit values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FrameFlags(u32);

impl FrameFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Self-contained sync frame.
    pub const KEY_FRAME: Self = Self(1);
    /// Codec parameter sets rather than frame data.
    pub const CODEC_CONFIG: Self = Self(2);
    /// Last buffer of the stream.
    pub const END_OF_STREAM: Self = Self(4);

    /// Wrap raw platform bits. Unknown bits are preserved.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw platform bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of both flag sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether the key-frame bit is set.
    #[must_use]
    pub const fn is_key_frame(self) -> bool {
        self.contains(Self::KEY_FRAME)
    }

    /// Whether the codec-config bit is set.
    #[must_use]
    pub const fn is_codec_config(self) -> bool {
        self.contains(Self::CODEC_CONFIG)
    }

    /// Whether the end-of-stream bit is set.
    #[must_use]
    pub const fn is_end_of_stream(self) -> bool {
        self.contains(Self::END_OF_STREAM)
    }
}

impl BitOr for FrameFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for FrameFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}

/// Metadata accompanying a codec buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameDescriptor {
    /// Valid payload length in bytes.
    pub size: usize,
    /// Presentation timestamp in microseconds.
    pub presentation_time_us: u64,
    /// Buffer flags.
    pub flags: FrameFlags,
}

impl FrameDescriptor {
    /// Create a descriptor.
    #[must_use]
    pub const fn new(size: usize, presentation_time_us: u64, flags: FrameFlags) -> Self {
        Self {
            size,
            presentation_time_us,
            flags,
        }
    }
}

/// A compressed unit copied out of the encoder.
///
/// Owns its bytes, so it outlives the codec buffer it came from.
#[derive(Clone, PartialEq, Eq)]
pub struct EncodedUnit {
    payload: Vec<u8>,
    descriptor: FrameDescriptor,
}

impl fmt::Debug for EncodedUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedUnit")
            .field("len", &self.payload.len())
            .field("presentation_time_us", &self.descriptor.presentation_time_us)
            .field("flags", &self.descriptor.flags)
            .finish()
    }
}

impl EncodedUnit {
    /// Create a unit. The descriptor size is taken from the payload.
    #[must_use]
    pub fn new(payload: Vec<u8>, presentation_time_us: u64, flags: FrameFlags) -> Self {
        let descriptor = FrameDescriptor::new(payload.len(), presentation_time_us, flags);
        Self {
            payload,
            descriptor,
        }
    }

    /// The compressed bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Take ownership of the compressed bytes.
    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Buffer metadata.
    #[must_use]
    pub const fn descriptor(&self) -> &FrameDescriptor {
        &self.descriptor
    }

    /// Presentation timestamp in microseconds.
    #[must_use]
    pub const fn presentation_time_us(&self) -> u64 {
        self.descriptor.presentation_time_us
    }

    /// Buffer flags.
    #[must_use]
    pub const fn flags(&self) -> FrameFlags {
        self.descriptor.flags
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Completion signal for a decoded frame.
///
/// Decoded pixels stay inside the codec; when a render target is attached
/// they are composited there directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedFrame {
    /// Presentation timestamp in microseconds.
    pub presentation_time_us: u64,
    /// Size of the decoded buffer in bytes.
    pub size: usize,
    /// Whether the frame was sent to the render target.
    pub rendered: bool,
}
