//! Session lifecycle against a recording codec.

use hevckit_codec::{
    CodecBackend, CodecError, CodecHandle, CodecSession, CodecType, Direction, EncoderConfig,
    FrameDescriptor, FrameFlags, InputSlot, MediaFormat, OutputSlot, OutputStatus, SessionOptions,
    SessionState, Submission,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Record {
    opened: usize,
    closed: usize,
    stopped: usize,
    dequeued_outputs: Vec<usize>,
    released_outputs: Vec<usize>,
    queued_inputs: Vec<(usize, u64, FrameFlags)>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Faults {
    fail_start: bool,
    fail_output_after: Option<usize>,
    ignore_end_of_stream: bool,
}

#[derive(Debug, Clone, Default)]
struct Recording {
    record: Arc<Mutex<Record>>,
    faults: Faults,
}

impl Recording {
    fn with_faults(faults: Faults) -> Self {
        Self {
            faults,
            ..Self::default()
        }
    }

    fn record(&self) -> MutexGuard<'_, Record> {
        self.record.lock().unwrap()
    }
}

impl CodecBackend for Recording {
    type Handle = RecordingHandle;

    fn query_capability(&self, codec: CodecType, _direction: Direction) -> bool {
        codec == CodecType::H265
    }

    fn open(&self, _codec: CodecType, _direction: Direction) -> Result<RecordingHandle, CodecError> {
        self.record().opened += 1;
        Ok(RecordingHandle {
            record: Arc::clone(&self.record),
            faults: self.faults,
            input: vec![0; 4096],
            input_lent: false,
            pending: VecDeque::new(),
            outputs: Vec::new(),
            next_output: 0,
        })
    }
}

#[derive(Debug)]
struct RecordingHandle {
    record: Arc<Mutex<Record>>,
    faults: Faults,
    input: Vec<u8>,
    input_lent: bool,
    pending: VecDeque<(Vec<u8>, FrameDescriptor)>,
    outputs: Vec<Option<Vec<u8>>>,
    next_output: usize,
}

impl CodecHandle for RecordingHandle {
    type RenderTarget = ();

    fn configure(
        &mut self,
        _format: &MediaFormat,
        _render_target: Option<&()>,
        _direction: Direction,
    ) -> Result<(), CodecError> {
        Ok(())
    }

    fn start(&mut self) -> Result<(), CodecError> {
        if self.faults.fail_start {
            return Err(CodecError::EncodingFailed("codec died".into()));
        }
        let config = vec![0, 0, 0, 1, 0x40];
        let descriptor = FrameDescriptor::new(config.len(), 0, FrameFlags::CODEC_CONFIG);
        self.pending.push_back((config, descriptor));
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CodecError> {
        self.record.lock().unwrap().stopped += 1;
        Ok(())
    }

    fn close(self) -> Result<(), CodecError> {
        self.record.lock().unwrap().closed += 1;
        Ok(())
    }

    fn dequeue_input_slot(&mut self, _timeout: Duration) -> Result<Option<InputSlot>, CodecError> {
        if self.input_lent {
            return Ok(None);
        }
        self.input_lent = true;
        Ok(Some(InputSlot::new(0)))
    }

    fn input_buffer(&mut self, _slot: &InputSlot) -> Result<&mut [u8], CodecError> {
        Ok(&mut self.input)
    }

    fn queue_input_slot(
        &mut self,
        slot: InputSlot,
        len: usize,
        presentation_time_us: u64,
        flags: FrameFlags,
    ) -> Result<(), CodecError> {
        self.input_lent = false;
        self.record
            .lock()
            .unwrap()
            .queued_inputs
            .push((slot.index(), presentation_time_us, flags));
        if len > 0 {
            let payload = self.input[..len].to_vec();
            let descriptor = FrameDescriptor::new(len, presentation_time_us, FrameFlags::NONE);
            self.pending.push_back((payload, descriptor));
        }
        if flags.is_end_of_stream() && !self.faults.ignore_end_of_stream {
            let descriptor = FrameDescriptor::new(0, presentation_time_us, FrameFlags::END_OF_STREAM);
            self.pending.push_back((Vec::new(), descriptor));
        }
        Ok(())
    }

    fn dequeue_output_slot(&mut self, _timeout: Duration) -> Result<OutputStatus, CodecError> {
        let mut record = self.record.lock().unwrap();
        if self
            .faults
            .fail_output_after
            .is_some_and(|limit| record.dequeued_outputs.len() >= limit)
        {
            return Err(CodecError::EncodingFailed("output queue broke".into()));
        }
        let Some((payload, descriptor)) = self.pending.pop_front() else {
            return Ok(OutputStatus::TryAgain);
        };
        let index = self.next_output;
        self.next_output += 1;
        self.outputs.push(Some(payload));
        record.dequeued_outputs.push(index);
        Ok(OutputStatus::Slot(OutputSlot::new(index, descriptor)))
    }

    fn output_buffer(&self, slot: &OutputSlot) -> Result<&[u8], CodecError> {
        self.outputs
            .get(slot.index())
            .and_then(Option::as_deref)
            .ok_or_else(|| CodecError::EncodingFailed("slot not lent".into()))
    }

    fn release_output_slot(&mut self, slot: OutputSlot, _render: bool) -> Result<(), CodecError> {
        let taken = self.outputs.get_mut(slot.index()).and_then(Option::take);
        if taken.is_none() {
            return Err(CodecError::EncodingFailed("slot released twice".into()));
        }
        self.record
            .lock()
            .unwrap()
            .released_outputs
            .push(slot.index());
        Ok(())
    }

    fn request_key_frame(&mut self) -> Result<(), CodecError> {
        Ok(())
    }
}

fn small() -> EncoderConfig {
    EncoderConfig::new().size(32, 16)
}

fn quick_options() -> SessionOptions {
    SessionOptions::new()
        .input_timeout(Duration::ZERO)
        .output_timeout(Duration::ZERO)
        .flush_timeout(Duration::from_millis(100))
}

#[test]
fn every_output_slot_is_released_exactly_once() {
    let backend = Recording::default();
    let mut session = CodecSession::encoder(backend.clone()).with_options(quick_options());
    session.initialize(small()).unwrap();

    let frame = vec![3; small().frame_size()];
    for pts in 0..10 {
        assert_eq!(session.submit(&frame, pts, FrameFlags::NONE).unwrap(), Submission::Queued);
    }
    session.release();

    let record = backend.record();
    assert_eq!(record.dequeued_outputs, record.released_outputs);
    // Codec config, ten frames, end of stream.
    assert_eq!(record.dequeued_outputs.len(), 12);
    assert_eq!((record.stopped, record.closed), (1, 1));
    drop(record);

    let units = session.encoded_units().drain();
    assert_eq!(units.len(), 10);
    assert!(units.iter().all(|unit| unit.payload() == frame.as_slice()));
}

#[test]
fn flush_signals_end_of_stream_at_last_timestamp() {
    let backend = Recording::default();
    let mut session = CodecSession::encoder(backend.clone()).with_options(quick_options());
    session.initialize(small()).unwrap();
    session
        .submit(&vec![0; small().frame_size()], 4_000, FrameFlags::NONE)
        .unwrap();
    session.release();

    let record = backend.record();
    let last = record.queued_inputs.last().copied().unwrap();
    assert_eq!(last.1, 4_000);
    assert!(last.2.is_end_of_stream());
}

#[test]
fn failed_start_closes_codec() {
    let backend = Recording::with_faults(Faults {
        fail_start: true,
        ..Faults::default()
    });
    let mut session = CodecSession::encoder(backend.clone());

    let result = session.initialize(small());

    assert!(matches!(result, Err(CodecError::InitializationFailed(_))));
    assert_eq!(session.state(), SessionState::Uninitialized);
    let record = backend.record();
    assert_eq!((record.opened, record.closed), (1, 1));
}

#[test]
fn output_failure_surfaces_from_submit() {
    let backend = Recording::with_faults(Faults {
        fail_output_after: Some(1),
        ..Faults::default()
    });
    let mut session = CodecSession::encoder(backend.clone()).with_options(quick_options());
    session.initialize(small()).unwrap();

    let result = session.submit(&vec![0; small().frame_size()], 0, FrameFlags::NONE);

    assert!(matches!(result, Err(CodecError::EncodingFailed(_))));
    assert_eq!(session.state(), SessionState::Running);
    session.release();
    assert_eq!(session.state(), SessionState::Released);
    let record = backend.record();
    assert_eq!(record.dequeued_outputs, record.released_outputs);
    assert_eq!(record.closed, 1);
}

#[test]
fn flush_gives_up_when_end_of_stream_never_arrives() {
    let backend = Recording::with_faults(Faults {
        ignore_end_of_stream: true,
        ..Faults::default()
    });
    let mut session = CodecSession::encoder(backend.clone()).with_options(quick_options());
    session.initialize(small()).unwrap();

    let start = Instant::now();
    session.release();

    assert!(start.elapsed() >= Duration::from_millis(100));
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(session.state(), SessionState::Released);
    assert_eq!(backend.record().closed, 1);
}

#[test]
fn consumer_thread_sees_units_in_order() {
    let mut session = CodecSession::encoder(Recording::default()).with_options(quick_options());
    session.initialize(small()).unwrap();
    let receiver = session.encoded_units();

    let consumer = thread::spawn(move || {
        let mut timestamps = Vec::new();
        while let Some(unit) = receiver.poll(Duration::from_secs(5)) {
            timestamps.push(unit.presentation_time_us());
        }
        timestamps
    });

    let frame = vec![0; small().frame_size()];
    for pts in 0..20 {
        session.submit(&frame, pts * 1_000, FrameFlags::NONE).unwrap();
    }
    session.release();

    let expected: Vec<u64> = (0..20).map(|pts| pts * 1_000).collect();
    assert_eq!(consumer.join().unwrap(), expected);
}
