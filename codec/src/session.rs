//! Codec session lifecycle.
//!
//! A session wraps one opened codec and walks it through
//! `Uninitialized → Running → Draining → Released`. Every entry point checks
//! the state first, so nothing reaches the codec outside `Running`.

use crate::drain::{self, Sink};
use crate::{
    CodecBackend, CodecError, CodecHandle, DecodedFrame, Direction, DrainReport, EncodedUnit,
    Frame, FrameFlags, InputSlot, MediaFormat, OutputQueue, OutputReceiver, RenderTargetOf,
    SessionConfig, SessionOptions, VideoEncoder,
};
use std::fmt;
use std::time::{Duration, Instant};

/// Lifecycle state of a [`CodecSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created, not yet configured.
    Uninitialized,
    /// Accepting input.
    Running,
    /// Flushing trailing output during release.
    Draining,
    /// Codec stopped and closed. Terminal.
    Released,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Released => write!(f, "released"),
        }
    }
}

/// Outcome of [`CodecSession::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "a busy submission was not queued and should be retried"]
pub enum Submission {
    /// The payload was handed to the codec.
    Queued,
    /// No input slot became free in time. Nothing was queued; retry later.
    Busy,
}

impl Submission {
    /// Whether the payload was not queued.
    #[must_use]
    pub const fn is_busy(self) -> bool {
        matches!(self, Self::Busy)
    }
}

/// One direction of hardware transcoding over an exclusively owned codec.
///
/// All calls for a session must come from one thread. Output crosses threads
/// only through the receivers returned by [`encoded_units`](Self::encoded_units)
/// and [`decoded_frames`](Self::decoded_frames).
///
/// # Example
///
/// ```no_run
/// use hevckit_codec::{CodecSession, EncoderConfig, FrameFlags, sys::PlatformBackend};
/// use std::time::Duration;
///
/// # fn run() -> Result<(), hevckit_codec::CodecError> {
/// let mut encoder = CodecSession::encoder(PlatformBackend::default());
/// encoder.initialize(EncoderConfig::new())?;
///
/// let frame = vec![0u8; EncoderConfig::new().frame_size()];
/// if encoder.submit(&frame, 0, FrameFlags::NONE)?.is_busy() {
///     // retry later
/// }
/// while let Some(unit) = encoder.poll_encoded(Duration::ZERO) {
///     println!("{} bytes at {}us", unit.len(), unit.presentation_time_us());
/// }
/// encoder.release();
/// # Ok(())
/// # }
/// ```
pub struct CodecSession<B: CodecBackend> {
    backend: B,
    direction: Direction,
    state: SessionState,
    options: SessionOptions,
    config: Option<SessionConfig>,
    handle: Option<B::Handle>,
    render_target: Option<RenderTargetOf<B>>,
    output_format: Option<MediaFormat>,
    last_timestamp_us: u64,
    encoded: OutputQueue<EncodedUnit>,
    decoded: OutputQueue<DecodedFrame>,
}

impl<B: CodecBackend> fmt::Debug for CodecSession<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecSession")
            .field("direction", &self.direction)
            .field("state", &self.state)
            .field("config", &self.config)
            .field("output_format", &self.output_format)
            .field("has_render_target", &self.render_target.is_some())
            .finish_non_exhaustive()
    }
}

impl<B: CodecBackend> CodecSession<B> {
    /// Create an uninitialized session.
    pub fn new(backend: B, direction: Direction) -> Self {
        Self {
            backend,
            direction,
            state: SessionState::Uninitialized,
            options: SessionOptions::default(),
            config: None,
            handle: None,
            render_target: None,
            output_format: None,
            last_timestamp_us: 0,
            encoded: OutputQueue::new(),
            decoded: OutputQueue::new(),
        }
    }

    /// Create an uninitialized encoder session.
    pub fn encoder(backend: B) -> Self {
        Self::new(backend, Direction::Encode)
    }

    /// Create an uninitialized decoder session.
    pub fn decoder(backend: B) -> Self {
        Self::new(backend, Direction::Decode)
    }

    /// Replace the timing and emission options.
    #[must_use]
    pub const fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Attach a surface decoded frames are composited onto.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidState`] unless this is a decoder that has
    /// not been initialized yet.
    pub fn set_render_target(&mut self, target: RenderTargetOf<B>) -> Result<(), CodecError> {
        if self.direction != Direction::Decode || self.state != SessionState::Uninitialized {
            return Err(CodecError::InvalidState {
                operation: "attach a render target",
                state: self.state,
            });
        }
        self.render_target = Some(target);
        Ok(())
    }

    /// Configure and start the codec.
    ///
    /// The platform capability query runs before anything is opened.
    ///
    /// # Errors
    ///
    /// - [`CodecError::InvalidState`] if the session is not uninitialized.
    /// - [`CodecError::Unsupported`] if the platform cannot run the codec.
    /// - [`CodecError::InitializationFailed`] if the configuration is invalid,
    ///   belongs to the other direction, or the codec fails to configure or start.
    pub fn initialize(&mut self, config: impl Into<SessionConfig>) -> Result<(), CodecError> {
        if self.state != SessionState::Uninitialized {
            return Err(CodecError::InvalidState {
                operation: "initialize",
                state: self.state,
            });
        }

        let config = config.into();
        if config.direction() != self.direction {
            return Err(CodecError::InitializationFailed(format!(
                "{} configuration given to a {} session",
                config.direction(),
                self.direction
            )));
        }
        config.validate()?;

        let codec = config.codec();
        if !self.backend.query_capability(codec, self.direction) {
            return Err(CodecError::Unsupported(format!(
                "no {} for {}",
                self.direction,
                codec.mime()
            )));
        }

        let mut handle = self.backend.open(codec, self.direction)?;
        let format = config.to_format();
        let started = handle
            .configure(&format, self.render_target.as_ref(), self.direction)
            .map_err(|e| CodecError::InitializationFailed(format!("configure: {e}")))
            .and_then(|()| {
                handle
                    .start()
                    .map_err(|e| CodecError::InitializationFailed(format!("start: {e}")))
            });
        if let Err(e) = started {
            if let Err(close_error) = handle.close() {
                log::error!("failed to close {} after failed start: {close_error}", self.direction);
            }
            return Err(e);
        }

        log::info!(
            "{} started: {} {}x{}",
            self.direction,
            codec.mime(),
            format.width,
            format.height
        );
        self.handle = Some(handle);
        self.config = Some(config);
        self.state = SessionState::Running;
        Ok(())
    }

    /// Hand one buffer of input to the codec, then harvest ready output.
    ///
    /// Waits at most [`SessionOptions::input_timeout`] for a free input slot.
    ///
    /// # Errors
    ///
    /// - [`CodecError::InvalidState`] if the session is not running.
    /// - [`CodecError::InvalidFrame`] if the payload does not fit an input slot.
    /// - [`CodecError::EncodingFailed`] / [`CodecError::DecodingFailed`] if the
    ///   codec fails while queuing input or draining output.
    pub fn submit(
        &mut self,
        payload: &[u8],
        presentation_time_us: u64,
        flags: FrameFlags,
    ) -> Result<Submission, CodecError> {
        let input_timeout = self.options.input_timeout;
        let handle = self.running_handle("submit")?;

        let Some(slot) = handle.dequeue_input_slot(input_timeout)? else {
            log::trace!("no input slot within {input_timeout:?}");
            return Ok(Submission::Busy);
        };
        fill_and_queue(handle, slot, payload, presentation_time_us, flags)?;
        self.last_timestamp_us = presentation_time_us;

        self.drain_output(None)?;
        Ok(Submission::Queued)
    }

    /// Harvest whatever output the codec has ready, without submitting input.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidState`] if the session is not running, or
    /// the codec's error if draining fails.
    pub fn drain(&mut self) -> Result<DrainReport, CodecError> {
        self.running_handle("drain")?;
        self.drain_output(None)
    }

    /// Ask the encoder for a key frame at the next opportunity.
    ///
    /// # Errors
    ///
    /// - [`CodecError::Unsupported`] on a decoder session.
    /// - [`CodecError::InvalidState`] if the session is not running.
    pub fn request_key_frame(&mut self) -> Result<(), CodecError> {
        if self.direction != Direction::Encode {
            return Err(CodecError::Unsupported(
                "key frame requests on a decoder session".into(),
            ));
        }
        self.running_handle("request a key frame")?.request_key_frame()?;
        log::debug!("key frame requested");
        Ok(())
    }

    /// Flush trailing output, stop and close the codec.
    ///
    /// Always ends in [`SessionState::Released`]; platform failures along the
    /// way are logged, not returned. Calling it again does nothing. Units
    /// produced before and during the flush stay readable from the receivers.
    pub fn release(&mut self) {
        if self.state == SessionState::Released {
            return;
        }

        if self.handle.is_some() {
            self.state = SessionState::Draining;
            log::debug!("draining {}", self.direction);

            if let Err(e) = self.signal_end_of_input() {
                log::error!("failed to signal end of input to {}: {e}", self.direction);
            }
            let deadline = Instant::now() + self.options.flush_timeout;
            match self.drain_output(Some(deadline)) {
                Ok(report) => log::debug!(
                    "flushed {}: {} emitted, {} skipped, end of stream {}",
                    self.direction,
                    report.emitted,
                    report.skipped,
                    report.end_of_stream
                ),
                Err(e) => log::error!("flush of {} failed: {e}", self.direction),
            }

            if let Some(mut handle) = self.handle.take() {
                if let Err(e) = handle.stop() {
                    log::error!("failed to stop {}: {e}", self.direction);
                }
                if let Err(e) = handle.close() {
                    log::error!("failed to close {}: {e}", self.direction);
                }
            }
        }

        self.state = SessionState::Released;
        self.encoded.close();
        self.decoded.close();
        log::info!("{} released", self.direction);
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Transcoding direction.
    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Configuration applied by [`initialize`](Self::initialize).
    #[must_use]
    pub const fn config(&self) -> Option<&SessionConfig> {
        self.config.as_ref()
    }

    /// Timing and emission options.
    #[must_use]
    pub const fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Latest output format reported by the codec.
    #[must_use]
    pub const fn output_format(&self) -> Option<&MediaFormat> {
        self.output_format.as_ref()
    }

    /// Receiver for encoded units. Empty on decoder sessions.
    #[must_use]
    pub fn encoded_units(&self) -> OutputReceiver<EncodedUnit> {
        self.encoded.receiver()
    }

    /// Receiver for decoded-frame completions. Empty on encoder sessions.
    #[must_use]
    pub fn decoded_frames(&self) -> OutputReceiver<DecodedFrame> {
        self.decoded.receiver()
    }

    /// Wait up to `timeout` for the oldest encoded unit.
    ///
    /// `Duration::ZERO` polls once without waiting.
    #[must_use]
    pub fn poll_encoded(&self, timeout: Duration) -> Option<EncodedUnit> {
        self.encoded.receiver().poll(timeout)
    }

    fn running_handle(&mut self, operation: &'static str) -> Result<&mut B::Handle, CodecError> {
        let state = self.state;
        match self.handle.as_mut() {
            Some(handle) if state == SessionState::Running => Ok(handle),
            _ => Err(CodecError::InvalidState { operation, state }),
        }
    }

    fn drain_output(&mut self, deadline: Option<Instant>) -> Result<DrainReport, CodecError> {
        let Some(handle) = self.handle.as_mut() else {
            return Ok(DrainReport::default());
        };
        let sink = match self.direction {
            Direction::Encode => Sink::Encoded {
                queue: &self.encoded,
                emit_codec_config: self.options.emit_codec_config,
            },
            Direction::Decode => Sink::Decoded {
                queue: &self.decoded,
                render: self.render_target.is_some(),
            },
        };
        drain::drain(
            handle,
            &sink,
            self.options.output_timeout,
            deadline,
            &mut self.output_format,
        )
    }

    /// Queue an empty end-of-stream buffer so the codec flushes what it holds.
    fn signal_end_of_input(&mut self) -> Result<(), CodecError> {
        let Some(handle) = self.handle.as_mut() else {
            return Ok(());
        };
        match handle.dequeue_input_slot(self.options.input_timeout)? {
            Some(slot) => handle.queue_input_slot(
                slot,
                0,
                self.last_timestamp_us,
                FrameFlags::END_OF_STREAM,
            ),
            None => {
                log::warn!("no input slot for end of stream; flush will run to its deadline");
                Ok(())
            }
        }
    }
}

impl<B: CodecBackend> Drop for CodecSession<B> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Copy `payload` into `slot` and queue it. The slot goes back to the codec
/// even when the copy fails.
fn fill_and_queue<H: CodecHandle>(
    handle: &mut H,
    slot: InputSlot,
    payload: &[u8],
    presentation_time_us: u64,
    flags: FrameFlags,
) -> Result<(), CodecError> {
    let copied = handle.input_buffer(&slot).and_then(|buffer| {
        let capacity = buffer.len();
        let target = buffer.get_mut(..payload.len()).ok_or_else(|| {
            CodecError::InvalidFrame(format!(
                "{}-byte payload exceeds {capacity}-byte input slot",
                payload.len()
            ))
        })?;
        target.copy_from_slice(payload);
        Ok(payload.len())
    });

    match copied {
        Ok(len) => handle.queue_input_slot(slot, len, presentation_time_us, flags),
        Err(e) => {
            if let Err(return_error) =
                handle.queue_input_slot(slot, 0, presentation_time_us, FrameFlags::NONE)
            {
                log::error!("failed to return input slot: {return_error}");
            }
            Err(e)
        }
    }
}

impl<B> VideoEncoder for CodecSession<B>
where
    B: CodecBackend + Send,
{
    fn encode(&mut self, frame: &Frame) -> Result<Vec<u8>, CodecError> {
        let Some(SessionConfig::Encode(config)) = self.config else {
            return Err(CodecError::InvalidState {
                operation: "encode",
                state: self.state,
            });
        };
        if frame.width != config.width || frame.height != config.height {
            return Err(CodecError::InvalidFrame(format!(
                "frame size {}x{} doesn't match encoder {}x{}",
                frame.width, frame.height, config.width, config.height
            )));
        }
        if !frame.format.is_yuv420() {
            return Err(CodecError::InvalidFrame(format!(
                "{:?} input needs conversion to YUV 4:2:0",
                frame.format
            )));
        }
        if frame.data.len() != config.frame_size() {
            return Err(CodecError::InvalidFrame(format!(
                "frame data size {} doesn't match expected {}",
                frame.data.len(),
                config.frame_size()
            )));
        }

        match self.submit(&frame.data, frame.timestamp_ns / 1_000, FrameFlags::NONE)? {
            Submission::Busy => Err(CodecError::EncodingFailed("no input slot available".into())),
            Submission::Queued => Ok(self
                .encoded
                .receiver()
                .drain()
                .into_iter()
                .flat_map(EncodedUnit::into_payload)
                .collect()),
        }
    }
}
