//! In-process software stand-in for a hardware codec.
//!
//! Nothing is compressed: an "encoder" echoes each raw frame back as one
//! output unit and a "decoder" reports one decoded frame per compressed unit.
//! The slot bookkeeping is real, so hosts without a hardware codec can drive
//! a full session lifecycle and tests can count every buffer hand-off.

use crate::{
    CodecBackend, CodecError, CodecHandle, CodecType, Direction, FrameDescriptor, FrameFlags,
    InputSlot, MediaFormat, OutputSlot, OutputStatus,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const DEFAULT_SLOT_COUNT: usize = 4;

/// Parameter sets emitted once after an encoder starts.
const fn parameter_sets(codec: CodecType) -> &'static [u8] {
    match codec {
        // VPS, SPS, PPS headers.
        CodecType::H265 => &[
            0, 0, 0, 1, 0x40, 0x01, 0x0C, 0, 0, 0, 1, 0x42, 0x01, 0x01, 0, 0, 0, 1, 0x44, 0x01,
        ],
        _ => &[0, 0, 0, 1, 0x67, 0x42, 0, 0x1F, 0, 0, 0, 1, 0x68, 0xCE, 0x3C, 0x80],
    }
}

#[derive(Debug, Default)]
struct Counters {
    opened: AtomicUsize,
    input_slots_dequeued: AtomicUsize,
    input_slots_queued: AtomicUsize,
    output_slots_dequeued: AtomicUsize,
    output_slots_released: AtomicUsize,
    rendered: AtomicUsize,
    key_frame_requests: AtomicUsize,
    end_of_stream_inputs: AtomicUsize,
    closed: AtomicUsize,
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Snapshot of everything a [`PassthroughBackend`]'s codecs have done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassthroughStats {
    /// Codecs opened.
    pub opened: usize,
    /// Input slots handed out.
    pub input_slots_dequeued: usize,
    /// Input slots handed back.
    pub input_slots_queued: usize,
    /// Output slots handed out.
    pub output_slots_dequeued: usize,
    /// Output slots released.
    pub output_slots_released: usize,
    /// Output slots released with rendering.
    pub rendered: usize,
    /// Key frame requests received.
    pub key_frame_requests: usize,
    /// Input buffers flagged end of stream.
    pub end_of_stream_inputs: usize,
    /// Codecs closed.
    pub closed: usize,
}

/// Software backend for H.264 and H.265.
///
/// Clones share statistics, so a test can keep one clone and hand the other
/// to a session.
#[derive(Debug, Clone)]
pub struct PassthroughBackend {
    slot_count: usize,
    encode: bool,
    decode: bool,
    stalled: bool,
    counters: Arc<Counters>,
}

impl Default for PassthroughBackend {
    fn default() -> Self {
        Self {
            slot_count: DEFAULT_SLOT_COUNT,
            encode: true,
            decode: true,
            stalled: false,
            counters: Arc::default(),
        }
    }
}

impl PassthroughBackend {
    /// Create a backend with four input and four output slots per codec.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how many input and output slots each codec has.
    #[must_use]
    pub fn with_slot_count(mut self, count: usize) -> Self {
        self.slot_count = count.max(1);
        self
    }

    /// Report no capability for `direction`.
    #[must_use]
    pub const fn without(mut self, direction: Direction) -> Self {
        match direction {
            Direction::Encode => self.encode = false,
            Direction::Decode => self.decode = false,
        }
        self
    }

    /// Simulate a codec that never consumes queued input.
    ///
    /// Input slots are not recycled, so submissions become busy once they
    /// run out.
    #[must_use]
    pub const fn stalled(mut self) -> Self {
        self.stalled = true;
        self
    }

    /// Counters accumulated by every codec this backend opened.
    #[must_use]
    pub fn stats(&self) -> PassthroughStats {
        let c = &self.counters;
        let load = |counter: &AtomicUsize| counter.load(Ordering::Relaxed);
        PassthroughStats {
            opened: load(&c.opened),
            input_slots_dequeued: load(&c.input_slots_dequeued),
            input_slots_queued: load(&c.input_slots_queued),
            output_slots_dequeued: load(&c.output_slots_dequeued),
            output_slots_released: load(&c.output_slots_released),
            rendered: load(&c.rendered),
            key_frame_requests: load(&c.key_frame_requests),
            end_of_stream_inputs: load(&c.end_of_stream_inputs),
            closed: load(&c.closed),
        }
    }
}

impl CodecBackend for PassthroughBackend {
    type Handle = PassthroughHandle;

    fn query_capability(&self, codec: CodecType, direction: Direction) -> bool {
        let enabled = match direction {
            Direction::Encode => self.encode,
            Direction::Decode => self.decode,
        };
        enabled && matches!(codec, CodecType::H264 | CodecType::H265)
    }

    fn open(&self, codec: CodecType, direction: Direction) -> Result<PassthroughHandle, CodecError> {
        if !self.query_capability(codec, direction) {
            return Err(CodecError::Unsupported(format!(
                "passthrough {direction} for {}",
                codec.mime()
            )));
        }
        bump(&self.counters.opened);
        log::debug!("opened passthrough {direction} for {}", codec.mime());
        Ok(PassthroughHandle {
            codec,
            direction,
            slot_count: self.slot_count,
            stalled: self.stalled,
            format: None,
            started: false,
            inputs: Vec::new(),
            free_inputs: VecDeque::new(),
            outputs: Vec::new(),
            free_outputs: VecDeque::new(),
            pending: VecDeque::new(),
            frames_encoded: 0,
            key_frame_requested: false,
            counters: Arc::clone(&self.counters),
        })
    }
}

#[derive(Debug)]
struct InputBuffer {
    data: Vec<u8>,
    lent: bool,
}

#[derive(Debug)]
struct OutputBuffer {
    data: Vec<u8>,
    lent: Option<FrameDescriptor>,
}

#[derive(Debug)]
enum Pending {
    Format(MediaFormat),
    Unit {
        payload: Vec<u8>,
        presentation_time_us: u64,
        flags: FrameFlags,
    },
}

/// One passthrough codec instance.
#[derive(Debug)]
pub struct PassthroughHandle {
    codec: CodecType,
    direction: Direction,
    slot_count: usize,
    stalled: bool,
    format: Option<MediaFormat>,
    started: bool,
    inputs: Vec<InputBuffer>,
    free_inputs: VecDeque<usize>,
    outputs: Vec<OutputBuffer>,
    free_outputs: VecDeque<usize>,
    pending: VecDeque<Pending>,
    frames_encoded: u64,
    key_frame_requested: bool,
    counters: Arc<Counters>,
}

impl PassthroughHandle {
    fn ensure_started(&self, operation: &str) -> Result<(), CodecError> {
        if self.started {
            Ok(())
        } else {
            Err(self
                .direction
                .failure(format!("{operation} on a codec that is not started")))
        }
    }

    fn lent_input(&mut self, slot: &InputSlot) -> Result<&mut InputBuffer, CodecError> {
        let direction = self.direction;
        match self.inputs.get_mut(slot.index()) {
            Some(buffer) if buffer.lent => Ok(buffer),
            _ => Err(direction.failure(format!("input slot {} is not lent out", slot.index()))),
        }
    }

    fn push_unit(&mut self, payload: Vec<u8>, presentation_time_us: u64, flags: FrameFlags) {
        self.pending.push_back(Pending::Unit {
            payload,
            presentation_time_us,
            flags,
        });
    }

    fn consume(&mut self, payload: Vec<u8>, presentation_time_us: u64, flags: FrameFlags) {
        if payload.is_empty() {
            return;
        }
        match self.direction {
            Direction::Encode => {
                let mut unit_flags = FrameFlags::NONE;
                if self.frames_encoded == 0 || self.key_frame_requested {
                    unit_flags |= FrameFlags::KEY_FRAME;
                    self.key_frame_requested = false;
                }
                self.frames_encoded += 1;
                self.push_unit(payload, presentation_time_us, unit_flags);
            }
            Direction::Decode => {
                if flags.is_codec_config() {
                    log::trace!("passthrough decoder took {} bytes of parameter sets", payload.len());
                    return;
                }
                let key = if flags.is_key_frame() {
                    FrameFlags::KEY_FRAME
                } else {
                    FrameFlags::NONE
                };
                self.push_unit(payload, presentation_time_us, key);
            }
        }
    }
}

impl CodecHandle for PassthroughHandle {
    type RenderTarget = ();

    fn configure(
        &mut self,
        format: &MediaFormat,
        _render_target: Option<&()>,
        direction: Direction,
    ) -> Result<(), CodecError> {
        if self.started {
            return Err(CodecError::InitializationFailed("codec already started".into()));
        }
        if direction != self.direction || format.codec != self.codec {
            return Err(CodecError::InitializationFailed(format!(
                "{direction} format for {} given to a {} for {}",
                format.codec.mime(),
                self.direction,
                self.codec.mime()
            )));
        }

        let pixels = format.width as usize * format.height as usize;
        let capacity = pixels + pixels / 2;
        self.inputs = (0..self.slot_count)
            .map(|_| InputBuffer {
                data: vec![0; capacity],
                lent: false,
            })
            .collect();
        self.outputs = (0..self.slot_count)
            .map(|_| OutputBuffer {
                data: Vec::new(),
                lent: None,
            })
            .collect();
        self.format = Some(*format);
        Ok(())
    }

    fn start(&mut self) -> Result<(), CodecError> {
        let Some(format) = self.format else {
            return Err(CodecError::InitializationFailed("start before configure".into()));
        };
        self.free_inputs = (0..self.inputs.len()).collect();
        self.free_outputs = (0..self.outputs.len()).collect();
        self.pending.push_back(Pending::Format(format));
        if self.direction == Direction::Encode {
            self.push_unit(parameter_sets(self.codec).to_vec(), 0, FrameFlags::CODEC_CONFIG);
        }
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CodecError> {
        self.started = false;
        self.pending.clear();
        Ok(())
    }

    fn close(self) -> Result<(), CodecError> {
        bump(&self.counters.closed);
        Ok(())
    }

    fn dequeue_input_slot(&mut self, _timeout: Duration) -> Result<Option<InputSlot>, CodecError> {
        self.ensure_started("dequeue input")?;
        let Some(index) = self.free_inputs.pop_front() else {
            return Ok(None);
        };
        if let Some(buffer) = self.inputs.get_mut(index) {
            buffer.lent = true;
        }
        bump(&self.counters.input_slots_dequeued);
        Ok(Some(InputSlot::new(index)))
    }

    fn input_buffer(&mut self, slot: &InputSlot) -> Result<&mut [u8], CodecError> {
        Ok(self.lent_input(slot)?.data.as_mut_slice())
    }

    fn queue_input_slot(
        &mut self,
        slot: InputSlot,
        len: usize,
        presentation_time_us: u64,
        flags: FrameFlags,
    ) -> Result<(), CodecError> {
        let direction = self.direction;
        let stalled = self.stalled;
        let index = slot.index();
        let buffer = self.lent_input(&slot)?;
        let payload = buffer
            .data
            .get(..len)
            .ok_or_else(|| direction.failure(format!("{len} bytes queued into input slot {index}")))?
            .to_vec();
        if !stalled {
            buffer.lent = false;
        }
        bump(&self.counters.input_slots_queued);
        if stalled {
            return Ok(());
        }
        self.free_inputs.push_back(index);

        self.consume(payload, presentation_time_us, flags);
        if flags.is_end_of_stream() {
            bump(&self.counters.end_of_stream_inputs);
            self.push_unit(Vec::new(), presentation_time_us, FrameFlags::END_OF_STREAM);
        }
        Ok(())
    }

    fn dequeue_output_slot(&mut self, _timeout: Duration) -> Result<OutputStatus, CodecError> {
        self.ensure_started("dequeue output")?;
        let waiting_unit = matches!(self.pending.front(), Some(Pending::Unit { .. }));
        if waiting_unit && self.free_outputs.is_empty() {
            return Ok(OutputStatus::TryAgain);
        }
        match self.pending.pop_front() {
            None => Ok(OutputStatus::TryAgain),
            Some(Pending::Format(format)) => Ok(OutputStatus::FormatChanged(format)),
            Some(Pending::Unit {
                payload,
                presentation_time_us,
                flags,
            }) => {
                let index = self
                    .free_outputs
                    .pop_front()
                    .ok_or_else(|| self.direction.failure("no free output slot"))?;
                let descriptor = FrameDescriptor::new(payload.len(), presentation_time_us, flags);
                if let Some(buffer) = self.outputs.get_mut(index) {
                    buffer.data = payload;
                    buffer.lent = Some(descriptor);
                }
                bump(&self.counters.output_slots_dequeued);
                Ok(OutputStatus::Slot(OutputSlot::new(index, descriptor)))
            }
        }
    }

    fn output_buffer(&self, slot: &OutputSlot) -> Result<&[u8], CodecError> {
        match self.outputs.get(slot.index()) {
            Some(OutputBuffer {
                data,
                lent: Some(descriptor),
            }) => data
                .get(slot.offset()..slot.offset() + descriptor.size)
                .ok_or_else(|| self.direction.failure("output slot shorter than its descriptor")),
            _ => Err(self
                .direction
                .failure(format!("output slot {} is not lent out", slot.index()))),
        }
    }

    fn release_output_slot(&mut self, slot: OutputSlot, render: bool) -> Result<(), CodecError> {
        let index = slot.index();
        match self.outputs.get_mut(index) {
            Some(buffer) if buffer.lent.is_some() => {
                buffer.lent = None;
                buffer.data.clear();
            }
            _ => {
                return Err(self
                    .direction
                    .failure(format!("output slot {index} released twice")));
            }
        }
        self.free_outputs.push_back(index);
        bump(&self.counters.output_slots_released);
        if render && self.direction == Direction::Decode {
            bump(&self.counters.rendered);
        }
        Ok(())
    }

    fn request_key_frame(&mut self) -> Result<(), CodecError> {
        if self.direction != Direction::Encode {
            return Err(CodecError::Unsupported("key frame request on a decoder".into()));
        }
        self.key_frame_requested = true;
        bump(&self.counters.key_frame_requests);
        Ok(())
    }
}
