//! Stub backend for platforms without a hardware codec service.

use crate::{
    CodecBackend, CodecError, CodecHandle, CodecType, Direction, FrameFlags, InputSlot,
    MediaFormat, OutputSlot, OutputStatus,
};
use std::time::Duration;

/// Backend that reports no codec support.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubBackend;

impl CodecBackend for StubBackend {
    type Handle = StubHandle;

    fn query_capability(&self, _codec: CodecType, _direction: Direction) -> bool {
        false
    }

    fn open(&self, codec: CodecType, direction: Direction) -> Result<StubHandle, CodecError> {
        Err(CodecError::Unsupported(format!(
            "no hardware {direction} for {} on this platform",
            codec.mime()
        )))
    }
}

/// Handle that can never be constructed.
#[derive(Debug)]
pub enum StubHandle {}

impl CodecHandle for StubHandle {
    type RenderTarget = ();

    fn configure(
        &mut self,
        _format: &MediaFormat,
        _render_target: Option<&()>,
        _direction: Direction,
    ) -> Result<(), CodecError> {
        match *self {}
    }

    fn start(&mut self) -> Result<(), CodecError> {
        match *self {}
    }

    fn stop(&mut self) -> Result<(), CodecError> {
        match *self {}
    }

    fn close(self) -> Result<(), CodecError> {
        match self {}
    }

    fn dequeue_input_slot(&mut self, _timeout: Duration) -> Result<Option<InputSlot>, CodecError> {
        match *self {}
    }

    fn input_buffer(&mut self, _slot: &InputSlot) -> Result<&mut [u8], CodecError> {
        match *self {}
    }

    fn queue_input_slot(
        &mut self,
        _slot: InputSlot,
        _len: usize,
        _presentation_time_us: u64,
        _flags: FrameFlags,
    ) -> Result<(), CodecError> {
        match *self {}
    }

    fn dequeue_output_slot(&mut self, _timeout: Duration) -> Result<OutputStatus, CodecError> {
        match *self {}
    }

    fn output_buffer(&self, _slot: &OutputSlot) -> Result<&[u8], CodecError> {
        match *self {}
    }

    fn release_output_slot(&mut self, _slot: OutputSlot, _render: bool) -> Result<(), CodecError> {
        match *self {}
    }

    fn request_key_frame(&mut self) -> Result<(), CodecError> {
        match *self {}
    }
}
