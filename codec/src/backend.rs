//! The contract with the platform codec service.
//!
//! A [`CodecBackend`] answers capability queries and opens codecs; each opened
//! [`CodecHandle`] is owned by exactly one session. Buffers move between the
//! session and the codec as [`InputSlot`] and [`OutputSlot`] values. Both are
//! move-only and handing one back to the codec consumes it, so a slot a
//! session received cannot be queued or released twice.
//!
//! Slot constructors exist for backend implementations. A slot can still be
//! built for an index the codec never lent, so backends reject indices that
//! are not currently out.

use crate::{CodecError, CodecType, Direction, FrameDescriptor, FrameFlags, MediaFormat};
use std::time::Duration;

/// An input buffer borrowed from the codec.
///
/// Must be returned through [`CodecHandle::queue_input_slot`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "input slots must be queued back to the codec"]
pub struct InputSlot {
    index: usize,
}

impl InputSlot {
    /// Wrap a codec buffer index.
    ///
    /// For [`CodecHandle`] implementations handing out a lent buffer.
    pub const fn new(index: usize) -> Self {
        Self { index }
    }

    /// Codec buffer index.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }
}

/// A completed output buffer borrowed from the codec.
///
/// Must be returned through [`CodecHandle::release_output_slot`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "output slots must be released exactly once"]
pub struct OutputSlot {
    index: usize,
    offset: usize,
    descriptor: FrameDescriptor,
}

impl OutputSlot {
    /// Wrap a codec buffer index and its metadata.
    ///
    /// For [`CodecHandle`] implementations handing out a completed buffer.
    pub const fn new(index: usize, descriptor: FrameDescriptor) -> Self {
        Self {
            index,
            offset: 0,
            descriptor,
        }
    }

    /// Set where the valid payload starts inside the codec buffer.
    pub const fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Codec buffer index.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Start of the valid payload inside the codec buffer.
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Buffer metadata.
    #[must_use]
    pub const fn descriptor(&self) -> &FrameDescriptor {
        &self.descriptor
    }
}

/// Result of polling the codec for output.
#[derive(Debug)]
pub enum OutputStatus {
    /// A completed buffer.
    Slot(OutputSlot),
    /// The output format changed; no buffer is attached.
    FormatChanged(MediaFormat),
    /// Nothing was ready within the timeout.
    TryAgain,
}

/// The platform codec service.
pub trait CodecBackend {
    /// Handle to one opened codec.
    type Handle: CodecHandle;

    /// Whether the platform can run `codec` in `direction`.
    fn query_capability(&self, codec: CodecType, direction: Direction) -> bool;

    /// Open a codec instance.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Unsupported`] if the platform refuses the codec.
    fn open(&self, codec: CodecType, direction: Direction) -> Result<Self::Handle, CodecError>;
}

/// Render target accepted by a backend's decoders.
pub type RenderTargetOf<B> = <<B as CodecBackend>::Handle as CodecHandle>::RenderTarget;

/// One opened codec instance.
///
/// Not safe for concurrent callers; a session drives it from a single thread.
pub trait CodecHandle: Send {
    /// Surface decoded frames can be composited onto.
    type RenderTarget: Send;

    /// Apply a format, optionally attaching a render target.
    ///
    /// # Errors
    ///
    /// Returns an error if the codec rejects the format.
    fn configure(
        &mut self,
        format: &MediaFormat,
        render_target: Option<&Self::RenderTarget>,
        direction: Direction,
    ) -> Result<(), CodecError>;

    /// Start processing buffers.
    ///
    /// # Errors
    ///
    /// Returns an error if the codec cannot start.
    fn start(&mut self) -> Result<(), CodecError>;

    /// Stop processing buffers.
    ///
    /// # Errors
    ///
    /// Returns an error if the codec fails to stop.
    fn stop(&mut self) -> Result<(), CodecError>;

    /// Destroy the codec instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform reports a failure while freeing it.
    fn close(self) -> Result<(), CodecError>
    where
        Self: Sized;

    /// Borrow a free input buffer, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` if none became free in time.
    ///
    /// # Errors
    ///
    /// Returns an error if the codec is in a failed state.
    fn dequeue_input_slot(&mut self, timeout: Duration) -> Result<Option<InputSlot>, CodecError>;

    /// Writable memory behind an input slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is unknown to the codec.
    fn input_buffer(&mut self, slot: &InputSlot) -> Result<&mut [u8], CodecError>;

    /// Hand `len` bytes of an input slot to the codec.
    ///
    /// # Errors
    ///
    /// Returns an error if the codec rejects the buffer.
    fn queue_input_slot(
        &mut self,
        slot: InputSlot,
        len: usize,
        presentation_time_us: u64,
        flags: FrameFlags,
    ) -> Result<(), CodecError>;

    /// Poll for completed output, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the codec is in a failed state.
    fn dequeue_output_slot(&mut self, timeout: Duration) -> Result<OutputStatus, CodecError>;

    /// Valid payload bytes of an output slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is unknown to the codec.
    fn output_buffer(&self, slot: &OutputSlot) -> Result<&[u8], CodecError>;

    /// Return an output slot, optionally rendering it to the attached target.
    ///
    /// # Errors
    ///
    /// Returns an error if the codec rejects the release.
    fn release_output_slot(&mut self, slot: OutputSlot, render: bool) -> Result<(), CodecError>;

    /// Ask the encoder for a sync frame at the next opportunity.
    ///
    /// # Errors
    ///
    /// Returns an error if the codec rejects the parameter change.
    fn request_key_frame(&mut self) -> Result<(), CodecError>;
}

/// Whether `backend` can encode HEVC.
#[must_use]
pub fn is_hevc_encoder_supported<B: CodecBackend>(backend: &B) -> bool {
    backend.query_capability(CodecType::H265, Direction::Encode)
}

/// Whether `backend` can decode HEVC.
#[must_use]
pub fn is_hevc_decoder_supported<B: CodecBackend>(backend: &B) -> bool {
    backend.query_capability(CodecType::H265, Direction::Decode)
}
