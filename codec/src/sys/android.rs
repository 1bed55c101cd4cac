//! Android `AMediaCodec` backend.
//!
//! Codecs are driven through the NDK in synchronous buffer mode. Capability
//! queries go through the Java `MediaCodecList`, since the NDK has no
//! equivalent before API level 35.

use crate::{
    CodecBackend, CodecError, CodecHandle, CodecType, ColorFormat, Direction, FrameDescriptor,
    FrameFlags, InputSlot, MediaFormat, OutputSlot, OutputStatus,
};
use jni::JNIEnv;
use jni::objects::{JObject, JObjectArray, JString, JValue};
use ndk::native_window::NativeWindow;
use ndk_sys as ffi;
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::ptr::{self, NonNull};
use std::time::Duration;

const CONFIGURE_FLAG_ENCODE: u32 = 1;
const INFO_TRY_AGAIN_LATER: isize = -1;
const INFO_OUTPUT_FORMAT_CHANGED: isize = -2;
const INFO_OUTPUT_BUFFERS_CHANGED: isize = -3;
/// `MediaCodecList.ALL_CODECS`
const ALL_CODECS: i32 = 1;

/// The platform `MediaCodec` service.
#[derive(Debug, Clone, Copy, Default)]
pub struct AndroidBackend;

impl CodecBackend for AndroidBackend {
    type Handle = AndroidHandle;

    fn query_capability(&self, codec: CodecType, direction: Direction) -> bool {
        match has_codec_for(codec.mime(), direction) {
            Ok(found) => {
                log::info!("{direction} for {} available: {found}", codec.mime());
                found
            }
            Err(e) => {
                log::error!("MediaCodecList query failed: {e}");
                false
            }
        }
    }

    fn open(&self, codec: CodecType, direction: Direction) -> Result<AndroidHandle, CodecError> {
        let mime = CString::new(codec.mime())
            .map_err(|e| CodecError::Unsupported(format!("mime type: {e}")))?;
        let raw = unsafe {
            match direction {
                Direction::Encode => ffi::AMediaCodec_createEncoderByType(mime.as_ptr()),
                Direction::Decode => ffi::AMediaCodec_createDecoderByType(mime.as_ptr()),
            }
        };
        let Some(raw) = NonNull::new(raw) else {
            return Err(CodecError::Unsupported(format!(
                "MediaCodec has no {direction} for {}",
                codec.mime()
            )));
        };
        log::info!("created MediaCodec {direction} for {}", codec.mime());
        Ok(AndroidHandle {
            raw,
            codec,
            direction,
            configured: None,
        })
    }
}

/// One `AMediaCodec` instance.
#[derive(Debug)]
pub struct AndroidHandle {
    raw: NonNull<ffi::AMediaCodec>,
    codec: CodecType,
    direction: Direction,
    configured: Option<MediaFormat>,
}

// SAFETY: the synchronous AMediaCodec API may be called from any thread as
// long as calls are not concurrent, which `&mut self` guarantees.
unsafe impl Send for AndroidHandle {}

impl AndroidHandle {
    fn check(&self, status: ffi::media_status_t, call: &str) -> Result<(), CodecError> {
        if status == ffi::media_status_t::AMEDIA_OK {
            Ok(())
        } else {
            Err(self.direction.failure(format!("{call} returned {status:?}")))
        }
    }

    fn read_output_format(&self) -> MediaFormat {
        let fallback = self
            .configured
            .unwrap_or_else(|| MediaFormat::video(self.codec, 0, 0));
        let raw = unsafe { ffi::AMediaCodec_getOutputFormat(self.raw.as_ptr()) };
        let Some(format) = OwnedFormat::from_raw(raw) else {
            return fallback;
        };
        let dimension = |key: &CStr, default: u32| {
            format
                .i32(key)
                .and_then(|value| u32::try_from(value).ok())
                .unwrap_or(default)
        };
        MediaFormat {
            width: dimension(c"width", fallback.width),
            height: dimension(c"height", fallback.height),
            color_format: format
                .i32(c"color-format")
                .and_then(ColorFormat::from_code)
                .or(fallback.color_format),
            ..fallback
        }
    }
}

impl Drop for AndroidHandle {
    fn drop(&mut self) {
        unsafe { ffi::AMediaCodec_delete(self.raw.as_ptr()) };
    }
}

impl CodecHandle for AndroidHandle {
    type RenderTarget = NativeWindow;

    fn configure(
        &mut self,
        format: &MediaFormat,
        render_target: Option<&NativeWindow>,
        direction: Direction,
    ) -> Result<(), CodecError> {
        let owned = OwnedFormat::new()?;
        let mime = CString::new(format.codec.mime())
            .map_err(|e| CodecError::InitializationFailed(format!("mime type: {e}")))?;
        owned.set_str(c"mime", &mime);
        owned.set_i32(c"width", to_i32(format.width)?);
        owned.set_i32(c"height", to_i32(format.height)?);
        if let Some(bit_rate) = format.bit_rate {
            owned.set_i32(c"bitrate", to_i32(bit_rate)?);
        }
        if let Some(frame_rate) = format.frame_rate {
            owned.set_i32(c"frame-rate", to_i32(frame_rate)?);
        }
        if let Some(interval) = format.key_frame_interval {
            owned.set_i32(c"i-frame-interval", to_i32(interval)?);
        }
        if let Some(color) = format.color_format {
            owned.set_i32(c"color-format", color.code());
        }

        let surface = render_target.map_or(ptr::null_mut(), |window| window.ptr().as_ptr());
        let flags = match direction {
            Direction::Encode => CONFIGURE_FLAG_ENCODE,
            Direction::Decode => 0,
        };
        let status = unsafe {
            ffi::AMediaCodec_configure(
                self.raw.as_ptr(),
                owned.as_ptr(),
                surface,
                ptr::null_mut(),
                flags,
            )
        };
        self.check(status, "AMediaCodec_configure")?;
        self.configured = Some(*format);
        Ok(())
    }

    fn start(&mut self) -> Result<(), CodecError> {
        let status = unsafe { ffi::AMediaCodec_start(self.raw.as_ptr()) };
        self.check(status, "AMediaCodec_start")
    }

    fn stop(&mut self) -> Result<(), CodecError> {
        let status = unsafe { ffi::AMediaCodec_stop(self.raw.as_ptr()) };
        self.check(status, "AMediaCodec_stop")
    }

    fn close(self) -> Result<(), CodecError> {
        let this = ManuallyDrop::new(self);
        let status = unsafe { ffi::AMediaCodec_delete(this.raw.as_ptr()) };
        this.check(status, "AMediaCodec_delete")
    }

    fn dequeue_input_slot(&mut self, timeout: Duration) -> Result<Option<InputSlot>, CodecError> {
        let index =
            unsafe { ffi::AMediaCodec_dequeueInputBuffer(self.raw.as_ptr(), timeout_us(timeout)) }
                as isize;
        match index {
            INFO_TRY_AGAIN_LATER => Ok(None),
            _ => usize::try_from(index)
                .map(|index| Some(InputSlot::new(index)))
                .map_err(|_| {
                    self.direction
                        .failure(format!("AMediaCodec_dequeueInputBuffer returned {index}"))
                }),
        }
    }

    fn input_buffer(&mut self, slot: &InputSlot) -> Result<&mut [u8], CodecError> {
        let mut capacity = 0;
        let data = unsafe {
            ffi::AMediaCodec_getInputBuffer(self.raw.as_ptr(), slot.index(), &mut capacity)
        };
        if data.is_null() {
            return Err(self
                .direction
                .failure(format!("no memory behind input slot {}", slot.index())));
        }
        // SAFETY: the codec lent this buffer to us until it is queued, which
        // needs `&mut self` and so ends this borrow first.
        Ok(unsafe { std::slice::from_raw_parts_mut(data, capacity) })
    }

    fn queue_input_slot(
        &mut self,
        slot: InputSlot,
        len: usize,
        presentation_time_us: u64,
        flags: FrameFlags,
    ) -> Result<(), CodecError> {
        let status = unsafe {
            ffi::AMediaCodec_queueInputBuffer(
                self.raw.as_ptr(),
                slot.index(),
                0,
                len,
                presentation_time_us,
                flags.bits(),
            )
        };
        self.check(status, "AMediaCodec_queueInputBuffer")
    }

    fn dequeue_output_slot(&mut self, timeout: Duration) -> Result<OutputStatus, CodecError> {
        loop {
            let mut info = ffi::AMediaCodecBufferInfo {
                offset: 0,
                size: 0,
                presentationTimeUs: 0,
                flags: 0,
            };
            let index = unsafe {
                ffi::AMediaCodec_dequeueOutputBuffer(
                    self.raw.as_ptr(),
                    &mut info,
                    timeout_us(timeout),
                )
            } as isize;
            match index {
                INFO_TRY_AGAIN_LATER => return Ok(OutputStatus::TryAgain),
                INFO_OUTPUT_FORMAT_CHANGED => {
                    return Ok(OutputStatus::FormatChanged(self.read_output_format()));
                }
                // Buffer addresses are looked up per call, so there is nothing to refresh.
                INFO_OUTPUT_BUFFERS_CHANGED => {}
                _ => {
                    let index = usize::try_from(index).map_err(|_| {
                        self.direction
                            .failure(format!("AMediaCodec_dequeueOutputBuffer returned {index}"))
                    })?;
                    let descriptor = FrameDescriptor::new(
                        usize::try_from(info.size).unwrap_or(0),
                        u64::try_from(info.presentationTimeUs).unwrap_or(0),
                        FrameFlags::from_bits(info.flags),
                    );
                    let offset = usize::try_from(info.offset).unwrap_or(0);
                    return Ok(OutputStatus::Slot(
                        OutputSlot::new(index, descriptor).with_offset(offset),
                    ));
                }
            }
        }
    }

    fn output_buffer(&self, slot: &OutputSlot) -> Result<&[u8], CodecError> {
        let mut capacity = 0;
        let data = unsafe {
            ffi::AMediaCodec_getOutputBuffer(self.raw.as_ptr(), slot.index(), &mut capacity)
        };
        let end = slot.offset() + slot.descriptor().size;
        if data.is_null() || end > capacity {
            return Err(self.direction.failure(format!(
                "output slot {} holds {capacity} bytes, descriptor wants {end}",
                slot.index()
            )));
        }
        // SAFETY: the range was checked against the buffer's capacity, and the
        // slot cannot be released while this shared borrow is alive.
        Ok(unsafe { std::slice::from_raw_parts(data.add(slot.offset()), slot.descriptor().size) })
    }

    fn release_output_slot(&mut self, slot: OutputSlot, render: bool) -> Result<(), CodecError> {
        let status =
            unsafe { ffi::AMediaCodec_releaseOutputBuffer(self.raw.as_ptr(), slot.index(), render) };
        self.check(status, "AMediaCodec_releaseOutputBuffer")
    }

    fn request_key_frame(&mut self) -> Result<(), CodecError> {
        let params = OwnedFormat::new()?;
        params.set_i32(c"request-sync", 0);
        let status = unsafe { ffi::AMediaCodec_setParameters(self.raw.as_ptr(), params.as_ptr()) };
        self.check(status, "AMediaCodec_setParameters")
    }
}

/// An `AMediaFormat` deleted on drop.
struct OwnedFormat(NonNull<ffi::AMediaFormat>);

impl OwnedFormat {
    fn new() -> Result<Self, CodecError> {
        Self::from_raw(unsafe { ffi::AMediaFormat_new() })
            .ok_or_else(|| CodecError::InitializationFailed("AMediaFormat_new failed".into()))
    }

    fn from_raw(raw: *mut ffi::AMediaFormat) -> Option<Self> {
        NonNull::new(raw).map(Self)
    }

    const fn as_ptr(&self) -> *mut ffi::AMediaFormat {
        self.0.as_ptr()
    }

    fn set_i32(&self, key: &CStr, value: i32) {
        unsafe { ffi::AMediaFormat_setInt32(self.as_ptr(), key.as_ptr(), value) };
    }

    fn set_str(&self, key: &CStr, value: &CStr) {
        unsafe { ffi::AMediaFormat_setString(self.as_ptr(), key.as_ptr(), value.as_ptr()) };
    }

    fn i32(&self, key: &CStr) -> Option<i32> {
        let mut value = 0;
        unsafe { ffi::AMediaFormat_getInt32(self.as_ptr(), key.as_ptr(), &mut value) }
            .then_some(value)
    }
}

impl Drop for OwnedFormat {
    fn drop(&mut self) {
        unsafe { ffi::AMediaFormat_delete(self.as_ptr()) };
    }
}

fn to_i32(value: u32) -> Result<i32, CodecError> {
    i32::try_from(value)
        .map_err(|_| CodecError::InitializationFailed(format!("{value} is out of range")))
}

fn timeout_us(timeout: Duration) -> i64 {
    i64::try_from(timeout.as_micros()).unwrap_or(i64::MAX)
}

/// Search `MediaCodecList` for a codec of the given direction handling `mime`.
fn has_codec_for(mime: &str, direction: Direction) -> Result<bool, jni::errors::Error> {
    let vm = unsafe { jni::JavaVM::from_raw(ndk_context::android_context().vm().cast()) }?;
    let mut env = vm.attach_current_thread()?;

    let list = env.new_object(
        "android/media/MediaCodecList",
        "(I)V",
        &[JValue::Int(ALL_CODECS)],
    )?;
    let infos = JObjectArray::from(
        env.call_method(&list, "getCodecInfos", "()[Landroid/media/MediaCodecInfo;", &[])?
            .l()?,
    );

    let want_encoder = direction == Direction::Encode;
    let mut found = false;
    for i in 0..env.get_array_length(&infos)? {
        let info = env.get_object_array_element(&infos, i)?;
        if env.call_method(&info, "isEncoder", "()Z", &[])?.z()? == want_encoder {
            found = supports_type(&mut env, &info, mime)?;
        }
        env.delete_local_ref(info)?;
        if found {
            break;
        }
    }

    env.delete_local_ref(infos)?;
    env.delete_local_ref(list)?;
    Ok(found)
}

fn supports_type(env: &mut JNIEnv, info: &JObject, mime: &str) -> Result<bool, jni::errors::Error> {
    let types = JObjectArray::from(
        env.call_method(info, "getSupportedTypes", "()[Ljava/lang/String;", &[])?
            .l()?,
    );
    let mut found = false;
    for i in 0..env.get_array_length(&types)? {
        let name = JString::from(env.get_object_array_element(&types, i)?);
        let name_str: String = env.get_string(&name)?.into();
        env.delete_local_ref(name)?;
        if name_str.eq_ignore_ascii_case(mime) {
            found = true;
            break;
        }
    }
    env.delete_local_ref(types)?;
    Ok(found)
}
