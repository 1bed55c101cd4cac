//! Harvesting completed output from a codec.
//!
//! Every slot obtained from [`CodecHandle::dequeue_output_slot`] is released
//! exactly once before the loop moves on, on success and failure alike.

use crate::{
    CodecError, CodecHandle, DecodedFrame, EncodedUnit, MediaFormat, OutputQueue, OutputSlot,
    OutputStatus,
};
use std::time::{Duration, Instant};

/// Where completed output goes.
#[derive(Debug)]
pub(crate) enum Sink<'a> {
    /// Copy payloads into owned units.
    Encoded {
        queue: &'a OutputQueue<EncodedUnit>,
        emit_codec_config: bool,
    },
    /// Signal completion only; optionally composite onto the render target.
    Decoded {
        queue: &'a OutputQueue<DecodedFrame>,
        render: bool,
    },
}

/// Summary of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Units pushed to the output queue.
    pub emitted: usize,
    /// Slots released without emitting anything.
    pub skipped: usize,
    /// Output format changes observed.
    pub format_changes: usize,
    /// Whether the end-of-stream unit was seen.
    pub end_of_stream: bool,
    /// Whether a flush stopped at its deadline before end of stream.
    pub timed_out: bool,
}

/// Drain completed output from `handle` into `sink`.
///
/// Without a deadline the pass stops as soon as the codec has nothing ready.
/// With one (flush mode) it keeps polling until the end-of-stream unit is
/// released or the deadline passes.
pub(crate) fn drain<H: CodecHandle>(
    handle: &mut H,
    sink: &Sink<'_>,
    poll_timeout: Duration,
    deadline: Option<Instant>,
    format: &mut Option<MediaFormat>,
) -> Result<DrainReport, CodecError> {
    let mut report = DrainReport::default();

    loop {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            log::warn!("flush deadline passed before end of stream");
            report.timed_out = true;
            break;
        }

        match handle.dequeue_output_slot(poll_timeout)? {
            OutputStatus::FormatChanged(new_format) => {
                log::info!(
                    "output format changed: {:?} {}x{}",
                    new_format.codec,
                    new_format.width,
                    new_format.height
                );
                report.format_changes += 1;
                *format = Some(new_format);
            }
            OutputStatus::TryAgain => {
                if deadline.is_none() {
                    break;
                }
            }
            OutputStatus::Slot(slot) => {
                let end_of_stream = slot.descriptor().flags.is_end_of_stream();
                if forward(handle, slot, sink)? {
                    report.emitted += 1;
                } else {
                    report.skipped += 1;
                }
                if end_of_stream {
                    log::debug!("reached end of stream");
                    report.end_of_stream = true;
                    break;
                }
            }
        }
    }

    Ok(report)
}

/// Hand one completed slot to the sink and release it.
///
/// Returns whether anything was emitted.
fn forward<H: CodecHandle>(
    handle: &mut H,
    slot: OutputSlot,
    sink: &Sink<'_>,
) -> Result<bool, CodecError> {
    let descriptor = *slot.descriptor();

    match sink {
        Sink::Encoded {
            queue,
            emit_codec_config,
        } => {
            let wanted = descriptor.size > 0
                && (*emit_codec_config || !descriptor.flags.is_codec_config());
            let copied = if wanted {
                Some(handle.output_buffer(&slot).map(<[u8]>::to_vec))
            } else {
                None
            };
            // Release before surfacing a copy failure so the slot is never leaked.
            handle.release_output_slot(slot, false)?;

            let Some(payload) = copied.transpose()? else {
                return Ok(false);
            };
            log::trace!(
                "encoded unit: {} bytes, flags {:#x}, pts {}",
                payload.len(),
                descriptor.flags.bits(),
                descriptor.presentation_time_us
            );
            let unit = EncodedUnit::new(payload, descriptor.presentation_time_us, descriptor.flags);
            if !queue.push(unit) {
                log::warn!("output queue closed; dropping encoded unit");
            }
            Ok(true)
        }
        Sink::Decoded { queue, render } => {
            if descriptor.size == 0 {
                handle.release_output_slot(slot, false)?;
                return Ok(false);
            }
            handle.release_output_slot(slot, *render)?;
            log::trace!(
                "decoded frame: pts {}, rendered {render}",
                descriptor.presentation_time_us
            );
            let frame = DecodedFrame {
                presentation_time_us: descriptor.presentation_time_us,
                size: descriptor.size,
                rendered: *render,
            };
            if !queue.push(frame) {
                log::warn!("output queue closed; dropping decoded frame");
            }
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CodecType, Direction, FrameDescriptor, FrameFlags, InputSlot};
    use std::collections::{HashMap, VecDeque};

    /// Replays a fixed sequence of output events and records releases.
    #[derive(Debug, Default)]
    struct Scripted {
        script: VecDeque<OutputStatus>,
        buffers: HashMap<usize, Vec<u8>>,
        dequeued: Vec<usize>,
        released: Vec<(usize, bool)>,
        broken_buffers: bool,
    }

    impl Scripted {
        fn push_slot(&mut self, index: usize, payload: &[u8], pts: u64, flags: FrameFlags) {
            let descriptor = FrameDescriptor::new(payload.len(), pts, flags);
            self.buffers.insert(index, payload.to_vec());
            self.script
                .push_back(OutputStatus::Slot(OutputSlot::new(index, descriptor)));
        }
    }

    impl CodecHandle for Scripted {
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
            Ok(())
        }

        fn stop(&mut self) -> Result<(), CodecError> {
            Ok(())
        }

        fn close(self) -> Result<(), CodecError> {
            Ok(())
        }

        fn dequeue_input_slot(&mut self, _timeout: Duration) -> Result<Option<InputSlot>, CodecError> {
            Ok(None)
        }

        fn input_buffer(&mut self, _slot: &InputSlot) -> Result<&mut [u8], CodecError> {
            Err(CodecError::EncodingFailed("no input".into()))
        }

        fn queue_input_slot(
            &mut self,
            _slot: InputSlot,
            _len: usize,
            _presentation_time_us: u64,
            _flags: FrameFlags,
        ) -> Result<(), CodecError> {
            Ok(())
        }

        fn dequeue_output_slot(&mut self, _timeout: Duration) -> Result<OutputStatus, CodecError> {
            let status = self.script.pop_front().unwrap_or(OutputStatus::TryAgain);
            if let OutputStatus::Slot(slot) = &status {
                self.dequeued.push(slot.index());
            }
            Ok(status)
        }

        fn output_buffer(&self, slot: &OutputSlot) -> Result<&[u8], CodecError> {
            if self.broken_buffers {
                return Err(CodecError::EncodingFailed("buffer unmapped".into()));
            }
            self.buffers
                .get(&slot.index())
                .map(Vec::as_slice)
                .ok_or_else(|| CodecError::EncodingFailed("unknown slot".into()))
        }

        fn release_output_slot(&mut self, slot: OutputSlot, render: bool) -> Result<(), CodecError> {
            self.released.push((slot.index(), render));
            Ok(())
        }

        fn request_key_frame(&mut self) -> Result<(), CodecError> {
            Ok(())
        }
    }

    fn encoded_sink(queue: &OutputQueue<EncodedUnit>) -> Sink<'_> {
        Sink::Encoded {
            queue,
            emit_codec_config: false,
        }
    }

    fn released_indices(handle: &Scripted) -> Vec<usize> {
        handle.released.iter().map(|(index, _)| *index).collect()
    }

    #[test]
    fn harvest_copies_data_and_releases_every_slot() {
        let mut handle = Scripted::default();
        handle.script.push_back(OutputStatus::FormatChanged(MediaFormat::video(
            CodecType::H265,
            1280,
            720,
        )));
        handle.push_slot(0, &[0, 0, 1, 0x40], 0, FrameFlags::CODEC_CONFIG);
        handle.push_slot(1, &[0, 0, 1, 0x26, 0x01], 0, FrameFlags::KEY_FRAME);
        handle.push_slot(2, &[0, 0, 1, 0x02], 33_333, FrameFlags::NONE);

        let queue = OutputQueue::new();
        let mut format = None;
        let report = drain(&mut handle, &encoded_sink(&queue), Duration::ZERO, None, &mut format)
            .unwrap();

        assert_eq!(report.emitted, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.format_changes, 1);
        assert!(!report.end_of_stream);
        assert_eq!(format.map(|f| f.width), Some(1280));
        assert_eq!(released_indices(&handle), handle.dequeued);
        assert!(handle.released.iter().all(|(_, render)| !render));

        let units = queue.receiver().drain();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].payload(), &[0, 0, 1, 0x26, 0x01]);
        assert!(units[0].flags().is_key_frame());
        assert_eq!(units[1].presentation_time_us(), 33_333);
    }

    #[test]
    fn codec_config_is_emitted_on_request() {
        let mut handle = Scripted::default();
        handle.push_slot(4, &[0, 0, 1, 0x40], 0, FrameFlags::CODEC_CONFIG);

        let queue = OutputQueue::new();
        let sink = Sink::Encoded {
            queue: &queue,
            emit_codec_config: true,
        };
        let report = drain(&mut handle, &sink, Duration::ZERO, None, &mut None).unwrap();

        assert_eq!(report.emitted, 1);
        assert!(queue.receiver().try_poll().unwrap().flags().is_codec_config());
    }

    #[test]
    fn end_of_stream_stops_before_later_output() {
        let mut handle = Scripted::default();
        handle.push_slot(0, &[1, 2, 3], 0, FrameFlags::NONE);
        handle.push_slot(1, &[], 0, FrameFlags::END_OF_STREAM);
        handle.push_slot(2, &[9], 0, FrameFlags::NONE);

        let queue = OutputQueue::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let report = drain(
            &mut handle,
            &encoded_sink(&queue),
            Duration::ZERO,
            Some(deadline),
            &mut None,
        )
        .unwrap();

        assert!(report.end_of_stream);
        assert!(!report.timed_out);
        assert_eq!(report.emitted, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(released_indices(&handle), vec![0, 1]);
        assert_eq!(handle.script.len(), 1);
    }

    #[test]
    fn flush_keeps_polling_through_try_again() {
        let mut handle = Scripted::default();
        handle.script.push_back(OutputStatus::TryAgain);
        handle.script.push_back(OutputStatus::TryAgain);
        handle.push_slot(3, &[5; 8], 10, FrameFlags::END_OF_STREAM);

        let queue = OutputQueue::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let report = drain(
            &mut handle,
            &encoded_sink(&queue),
            Duration::ZERO,
            Some(deadline),
            &mut None,
        )
        .unwrap();

        assert!(report.end_of_stream);
        assert_eq!(report.emitted, 1);
        assert_eq!(released_indices(&handle), vec![3]);
    }

    #[test]
    fn flush_gives_up_at_deadline() {
        let mut handle = Scripted::default();
        let queue = OutputQueue::new();
        let deadline = Instant::now() + Duration::from_millis(20);
        let report = drain(
            &mut handle,
            &encoded_sink(&queue),
            Duration::from_millis(1),
            Some(deadline),
            &mut None,
        )
        .unwrap();

        assert!(report.timed_out);
        assert!(!report.end_of_stream);
    }

    #[test]
    fn failed_copy_still_releases_slot() {
        let mut handle = Scripted {
            broken_buffers: true,
            ..Scripted::default()
        };
        handle.push_slot(7, &[1, 2, 3], 0, FrameFlags::NONE);

        let queue = OutputQueue::new();
        let result = drain(&mut handle, &encoded_sink(&queue), Duration::ZERO, None, &mut None);

        assert!(matches!(result, Err(CodecError::EncodingFailed(_))));
        assert_eq!(released_indices(&handle), vec![7]);
        assert!(queue.is_empty());
    }

    #[test]
    fn decode_renders_only_non_empty_frames() {
        let mut handle = Scripted::default();
        handle.push_slot(0, &[0; 16], 100, FrameFlags::NONE);
        handle.push_slot(1, &[], 200, FrameFlags::END_OF_STREAM);

        let queue = OutputQueue::new();
        let sink = Sink::Decoded {
            queue: &queue,
            render: true,
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        let report = drain(&mut handle, &sink, Duration::ZERO, Some(deadline), &mut None).unwrap();

        assert_eq!(report.emitted, 1);
        assert_eq!(handle.released, vec![(0, true), (1, false)]);
        assert_eq!(
            queue.receiver().drain(),
            vec![DecodedFrame {
                presentation_time_us: 100,
                size: 16,
                rendered: true,
            }]
        );
    }
}
