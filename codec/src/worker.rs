//! A session driven from its own thread.
//!
//! Codec calls for a session must stay on one thread. [`SessionWorker`] moves
//! the session onto a dedicated thread and feeds it commands over a channel;
//! output is read from the session's receivers on any thread.

use crate::shutdown::{ShutdownHandle, ShutdownSignal};
use crate::{
    CodecBackend, CodecError, CodecSession, DecodedFrame, Direction, EncodedUnit, FrameFlags,
    OutputReceiver, SessionState, Submission,
};
use async_channel::{Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Pause between attempts to place a busy submission.
const RETRY_INTERVAL: Duration = Duration::from_millis(2);

#[derive(Debug)]
enum Command {
    Submit {
        payload: Vec<u8>,
        presentation_time_us: u64,
        flags: FrameFlags,
    },
    RequestKeyFrame,
}

/// What a worker did before it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    /// Payloads queued to the codec.
    pub submitted: usize,
    /// Times a payload had to wait for a free input slot.
    pub busy_retries: usize,
    /// Commands dropped because shutdown was requested first.
    pub discarded: usize,
    /// Commands that failed with an error, or stayed busy past the
    /// session's `busy_timeout`.
    pub failed: usize,
    /// Key frame requests passed to the codec.
    pub key_frame_requests: usize,
}

/// Owns a running [`CodecSession`] on a background thread.
///
/// Dropping the worker signals shutdown, waits for the thread, and thereby
/// releases the session.
#[derive(Debug)]
pub struct SessionWorker {
    direction: Direction,
    commands: Sender<Command>,
    shutdown: ShutdownHandle,
    encoded: OutputReceiver<EncodedUnit>,
    decoded: OutputReceiver<DecodedFrame>,
    thread: Option<JoinHandle<WorkerSummary>>,
}

impl SessionWorker {
    /// Move a running session onto a new thread.
    ///
    /// # Errors
    ///
    /// - [`CodecError::InvalidState`] if the session is not running.
    /// - [`CodecError::InitializationFailed`] if the thread cannot be spawned.
    pub fn spawn<B>(session: CodecSession<B>) -> Result<Self, CodecError>
    where
        B: CodecBackend + Send + 'static,
    {
        if session.state() != SessionState::Running {
            return Err(CodecError::InvalidState {
                operation: "hand the session to a worker",
                state: session.state(),
            });
        }

        let direction = session.direction();
        let encoded = session.encoded_units();
        let decoded = session.decoded_frames();
        let (commands, inbox) = async_channel::unbounded();
        let (shutdown, signal) = ShutdownHandle::new();

        let thread = thread::Builder::new()
            .name(format!("codec-{direction}"))
            .spawn(move || run(session, &inbox, &signal))
            .map_err(|e| CodecError::InitializationFailed(format!("spawn worker: {e}")))?;
        log::debug!("{direction} worker started");

        Ok(Self {
            direction,
            commands,
            shutdown,
            encoded,
            decoded,
            thread: Some(thread),
        })
    }

    /// Queue a payload for the codec.
    ///
    /// Busy codecs are retried on the worker for up to the session's
    /// [`busy_timeout`](crate::SessionOptions::busy_timeout); after that the
    /// payload is dropped and counted as failed.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidState`] once the worker has stopped.
    pub fn submit(
        &self,
        payload: Vec<u8>,
        presentation_time_us: u64,
        flags: FrameFlags,
    ) -> Result<(), CodecError> {
        self.send(
            Command::Submit {
                payload,
                presentation_time_us,
                flags,
            },
            "submit",
        )
    }

    /// Ask the encoder for a key frame after the payloads queued so far.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidState`] once the worker has stopped.
    pub fn request_key_frame(&self) -> Result<(), CodecError> {
        self.send(Command::RequestKeyFrame, "request a key frame")
    }

    /// Receiver for encoded units.
    #[must_use]
    pub fn encoded_units(&self) -> OutputReceiver<EncodedUnit> {
        self.encoded.clone()
    }

    /// Receiver for decoded-frame completions.
    #[must_use]
    pub fn decoded_frames(&self) -> OutputReceiver<DecodedFrame> {
        self.decoded.clone()
    }

    /// Process every queued command, then release the session.
    ///
    /// # Errors
    ///
    /// Returns the direction's failure error if the worker thread panicked.
    pub fn finish(mut self) -> Result<WorkerSummary, CodecError> {
        self.commands.close();
        self.join()
    }

    /// Drop queued commands and release the session as soon as possible.
    ///
    /// # Errors
    ///
    /// Returns the direction's failure error if the worker thread panicked.
    pub fn shutdown(mut self) -> Result<WorkerSummary, CodecError> {
        self.shutdown.shutdown();
        self.commands.close();
        self.join()
    }

    fn send(&self, command: Command, operation: &'static str) -> Result<(), CodecError> {
        self.commands
            .try_send(command)
            .map_err(|_| CodecError::InvalidState {
                operation,
                state: SessionState::Released,
            })
    }

    fn join(&mut self) -> Result<WorkerSummary, CodecError> {
        let Some(thread) = self.thread.take() else {
            return Ok(WorkerSummary::default());
        };
        thread
            .join()
            .map_err(|_| self.direction.failure("worker thread panicked"))
    }
}

impl Drop for SessionWorker {
    fn drop(&mut self) {
        if self.thread.is_none() {
            return;
        }
        self.shutdown.shutdown();
        self.commands.close();
        if let Err(e) = self.join() {
            log::error!("{e}");
        }
    }
}

fn run<B: CodecBackend>(
    mut session: CodecSession<B>,
    inbox: &Receiver<Command>,
    signal: &ShutdownSignal,
) -> WorkerSummary {
    let mut summary = WorkerSummary::default();

    while let Ok(command) = inbox.recv_blocking() {
        if signal.is_shutdown() {
            summary.discarded += 1;
            continue;
        }
        match command {
            Command::Submit {
                payload,
                presentation_time_us,
                flags,
            } => submit_until_accepted(
                &mut session,
                &payload,
                presentation_time_us,
                flags,
                signal,
                &mut summary,
            ),
            Command::RequestKeyFrame => match session.request_key_frame() {
                Ok(()) => summary.key_frame_requests += 1,
                Err(e) => {
                    log::error!("key frame request failed: {e}");
                    summary.failed += 1;
                }
            },
        }
    }

    session.release();
    log::debug!("{} worker stopped: {summary:?}", session.direction());
    summary
}

fn submit_until_accepted<B: CodecBackend>(
    session: &mut CodecSession<B>,
    payload: &[u8],
    presentation_time_us: u64,
    flags: FrameFlags,
    signal: &ShutdownSignal,
    summary: &mut WorkerSummary,
) {
    let deadline = Instant::now() + session.options().busy_timeout;
    loop {
        match session.submit(payload, presentation_time_us, flags) {
            Ok(Submission::Queued) => {
                summary.submitted += 1;
                return;
            }
            Ok(Submission::Busy) => {
                if Instant::now() >= deadline {
                    log::warn!("dropping payload at {presentation_time_us}us, codec stayed busy");
                    summary.failed += 1;
                    return;
                }
                summary.busy_retries += 1;
                if let Err(e) = session.drain() {
                    log::error!("drain while busy failed: {e}");
                }
                if signal.wait_timeout(RETRY_INTERVAL) {
                    summary.discarded += 1;
                    return;
                }
            }
            Err(e) => {
                log::error!("submit at {presentation_time_us}us failed: {e}");
                summary.failed += 1;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::PassthroughBackend;
    use crate::{DecoderConfig, EncoderConfig, SessionOptions};
    use std::sync::mpsc;

    fn config() -> EncoderConfig {
        EncoderConfig::new().size(32, 16)
    }

    fn running_encoder(backend: PassthroughBackend) -> CodecSession<PassthroughBackend> {
        let mut session = CodecSession::encoder(backend)
            .with_options(SessionOptions::new().flush_timeout(Duration::from_millis(50)));
        session.initialize(config()).unwrap();
        session
    }

    #[test]
    fn spawn_needs_running_session() {
        let session = CodecSession::encoder(PassthroughBackend::new());
        assert!(matches!(
            SessionWorker::spawn(session),
            Err(CodecError::InvalidState { .. })
        ));
    }

    #[test]
    fn finish_processes_everything_then_releases() {
        let backend = PassthroughBackend::new();
        let worker = SessionWorker::spawn(running_encoder(backend.clone())).unwrap();
        let units = worker.encoded_units();

        for pts in 0..5 {
            worker
                .submit(vec![1; config().frame_size()], pts * 33_333, FrameFlags::NONE)
                .unwrap();
        }
        worker.request_key_frame().unwrap();
        let summary = worker.finish().unwrap();

        assert_eq!(summary.submitted, 5);
        assert_eq!(summary.key_frame_requests, 1);
        assert_eq!(summary.discarded, 0);
        let timestamps: Vec<u64> = units.drain().iter().map(EncodedUnit::presentation_time_us).collect();
        assert_eq!(timestamps, vec![0, 33_333, 66_666, 99_999, 133_332]);
        assert!(units.is_closed());
        assert_eq!(backend.stats().closed, 1);
    }

    #[test]
    fn shutdown_discards_waiting_commands() {
        let backend = PassthroughBackend::new().with_slot_count(1).stalled();
        let worker = SessionWorker::spawn(running_encoder(backend.clone())).unwrap();
        for pts in 0..3 {
            worker
                .submit(vec![0; config().frame_size()], pts, FrameFlags::NONE)
                .unwrap();
        }

        let start = Instant::now();
        while backend.stats().input_slots_queued == 0 {
            assert!(start.elapsed() < Duration::from_secs(5), "first frame never queued");
            thread::sleep(Duration::from_millis(1));
        }
        let summary = worker.shutdown().unwrap();

        assert_eq!(summary.submitted, 1);
        assert_eq!(summary.discarded, 2);
        assert_eq!(backend.stats().closed, 1);
    }

    #[test]
    fn finish_gives_up_on_a_codec_that_stays_busy() {
        let backend = PassthroughBackend::new().with_slot_count(1).stalled();
        let mut session = CodecSession::encoder(backend.clone()).with_options(
            SessionOptions::new()
                .busy_timeout(Duration::from_millis(30))
                .flush_timeout(Duration::from_millis(50)),
        );
        session.initialize(config()).unwrap();
        let worker = SessionWorker::spawn(session).unwrap();
        for pts in 0..2 {
            worker
                .submit(vec![0; config().frame_size()], pts, FrameFlags::NONE)
                .unwrap();
        }

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(worker.finish());
        });
        let summary = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("finish returned")
            .unwrap();

        assert_eq!(summary.submitted, 1);
        assert_eq!(summary.failed, 1);
        assert!(summary.busy_retries > 0);
        assert_eq!(backend.stats().closed, 1);
    }

    #[test]
    fn failed_commands_are_counted() {
        let mut session = CodecSession::decoder(PassthroughBackend::new());
        session.initialize(DecoderConfig::new().size(32, 16)).unwrap();
        let worker = SessionWorker::spawn(session).unwrap();

        worker.request_key_frame().unwrap();
        worker.submit(vec![0; 1 << 20], 0, FrameFlags::NONE).unwrap();
        let summary = worker.finish().unwrap();

        assert_eq!(summary.failed, 2);
        assert_eq!(summary.submitted, 0);
    }

    #[test]
    fn submit_after_stop_is_rejected() {
        let worker = SessionWorker::spawn(running_encoder(PassthroughBackend::new())).unwrap();
        worker.commands.close();
        assert!(matches!(
            worker.submit(Vec::new(), 0, FrameFlags::NONE),
            Err(CodecError::InvalidState { .. })
        ));
    }
}
