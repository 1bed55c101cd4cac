//! Encoder feeding a decoder in-process.

use crate::{
    CodecBackend, CodecError, CodecSession, DecodedFrame, DecoderConfig, EncodedUnit,
    EncoderConfig, FrameFlags, OutputReceiver, RenderTargetOf, SessionOptions, SessionState,
    Submission,
};

/// How many times a unit is offered to a full decoder before giving up.
const FEED_ATTEMPTS: usize = 8;

/// Encodes raw frames and immediately decodes the result.
///
/// Every encoded unit, parameter sets included, is handed to the decoder with
/// its original flags and timestamp. Decoded-frame completions are read from
/// [`decoded_frames`](Self::decoded_frames).
#[derive(Debug)]
pub struct Loopback<E: CodecBackend, D: CodecBackend> {
    encoder: CodecSession<E>,
    decoder: CodecSession<D>,
    units: OutputReceiver<EncodedUnit>,
    pending: Option<EncodedUnit>,
    forwarded: usize,
}

impl<E: CodecBackend, D: CodecBackend> Loopback<E, D> {
    /// Start an encoder and a matching decoder.
    ///
    /// The decoder inherits codec and dimensions from `config`. With a render
    /// target, decoded frames are composited onto it.
    ///
    /// # Errors
    ///
    /// Returns the first error from initializing either session.
    pub fn new(
        encoder_backend: E,
        decoder_backend: D,
        config: EncoderConfig,
        render_target: Option<RenderTargetOf<D>>,
    ) -> Result<Self, CodecError> {
        let mut encoder = CodecSession::encoder(encoder_backend)
            .with_options(SessionOptions::new().emit_codec_config(true));
        encoder.initialize(config)?;

        let mut decoder = CodecSession::decoder(decoder_backend);
        if let Some(target) = render_target {
            decoder.set_render_target(target)?;
        }
        decoder.initialize(DecoderConfig::from(&config))?;

        let units = encoder.encoded_units();
        Ok(Self {
            encoder,
            decoder,
            units,
            pending: None,
            forwarded: 0,
        })
    }

    /// Encode one raw frame and forward whatever the encoder produced.
    ///
    /// # Errors
    ///
    /// Returns the encoder's error, or [`CodecError::DecodingFailed`] if the
    /// decoder stays full.
    pub fn process(
        &mut self,
        frame: &[u8],
        presentation_time_us: u64,
    ) -> Result<Submission, CodecError> {
        let submission = self
            .encoder
            .submit(frame, presentation_time_us, FrameFlags::NONE)?;
        self.forward()?;
        Ok(submission)
    }

    /// Ask the encoder for a key frame.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidState`] after release.
    pub fn request_key_frame(&mut self) -> Result<(), CodecError> {
        self.encoder.request_key_frame()
    }

    /// Receiver for decoded-frame completions.
    #[must_use]
    pub fn decoded_frames(&self) -> OutputReceiver<DecodedFrame> {
        self.decoder.decoded_frames()
    }

    /// Units handed to the decoder so far.
    #[must_use]
    pub const fn forwarded(&self) -> usize {
        self.forwarded
    }

    /// Encoded units not yet accepted by the decoder.
    #[must_use]
    pub fn backlog(&self) -> usize {
        usize::from(self.pending.is_some()) + self.units.len()
    }

    /// The encoder session.
    #[must_use]
    pub const fn encoder(&self) -> &CodecSession<E> {
        &self.encoder
    }

    /// The decoder session.
    #[must_use]
    pub const fn decoder(&self) -> &CodecSession<D> {
        &self.decoder
    }

    /// Flush the encoder into the decoder, then release both.
    pub fn release(&mut self) {
        if self.decoder.state() == SessionState::Released {
            return;
        }
        self.encoder.release();
        if let Err(e) = self.forward() {
            log::error!("failed to forward trailing units: {e}");
        }
        self.decoder.release();
    }

    fn forward(&mut self) -> Result<(), CodecError> {
        while let Some(unit) = self.pending.take().or_else(|| self.units.try_poll()) {
            if let Err(e) = self.feed(&unit) {
                log::warn!(
                    "holding unit at {}us, {} more queued behind it",
                    unit.presentation_time_us(),
                    self.units.len()
                );
                self.pending = Some(unit);
                return Err(e);
            }
            self.forwarded += 1;
        }
        Ok(())
    }

    fn feed(&mut self, unit: &EncodedUnit) -> Result<(), CodecError> {
        for _ in 0..FEED_ATTEMPTS {
            let submission =
                self.decoder
                    .submit(unit.payload(), unit.presentation_time_us(), unit.flags())?;
            if submission == Submission::Queued {
                return Ok(());
            }
            self.decoder.drain()?;
        }
        Err(CodecError::DecodingFailed(format!(
            "decoder input stayed full for unit at {}us",
            unit.presentation_time_us()
        )))
    }
}

impl<E: CodecBackend, D: CodecBackend> Drop for Loopback<E, D> {
    fn drop(&mut self) {
        self.release();
    }
}
