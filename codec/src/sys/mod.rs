//! Codec backends.
//!
//! [`PlatformBackend`] is the hardware codec service of the target OS. On
//! platforms without one it is a stub whose capability query always fails.
//! [`PassthroughBackend`] runs anywhere.

pub mod passthrough;

pub use passthrough::{PassthroughBackend, PassthroughHandle, PassthroughStats};

cfg_if::cfg_if! {
    if #[cfg(target_os = "android")] {
        mod android;
        pub use android::{AndroidBackend as PlatformBackend, AndroidHandle as PlatformHandle};
    } else {
        mod stub;
        pub use stub::{StubBackend as PlatformBackend, StubHandle as PlatformHandle};
    }
}
