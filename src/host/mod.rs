//! Host audio API boundary.
//!
//! The engine consumes the OS audio subsystem exclusively through the
//! [`AudioHost`] trait: device enumeration, sample-rate and buffer-size
//! negotiation, and stream creation. [`CpalHost`] is the production
//! backend; [`MockHost`] is a scriptable in-memory backend so the whole
//! pipeline can be exercised without audio hardware.

mod cpal_host;
mod mock;

pub use cpal_host::CpalHost;
pub use mock::MockHost;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::PatchBayError;

/// Stable, opaque identifier for a device, supplied by the host audio API.
///
/// Cheap to clone, hash and compare; `Arc<str>` internally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceUid(Arc<str>);

impl DeviceUid {
    /// Creates a device UID from a string.
    pub fn new(uid: impl Into<Arc<str>>) -> Self {
        Self(uid.into())
    }

    /// Returns the UID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceUid {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for DeviceUid {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl AsRef<str> for DeviceUid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for DeviceUid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for DeviceUid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

/// Identity and capabilities of one audio device, as reported by the host.
///
/// UIDs are unique within one snapshot of the device list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Stable UID.
    pub uid: DeviceUid,
    /// Human-readable name.
    pub name: String,
    /// Capture channels (0 for output-only devices).
    pub input_channels: u16,
    /// Playback channels (0 for input-only devices).
    pub output_channels: u16,
    /// Sample rates the device reports supporting.
    pub sample_rates: Vec<u32>,
}

impl DeviceInfo {
    /// Whether the device claims to support the given sample rate.
    pub fn supports_sample_rate(&self, rate: u32) -> bool {
        self.sample_rates.contains(&rate)
    }
}

/// The host's current default input and output devices, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefaultDevices {
    /// UID of the default input device.
    pub input: Option<DeviceUid>,
    /// UID of the default output device.
    pub output: Option<DeviceUid>,
}

/// Format a stream is opened with: 32-bit float samples, interleaved on the
/// wire, at a fixed rate and preferred buffer size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSpec {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count of the stream.
    pub channels: u16,
    /// Preferred callback size in frames. The hardware may coerce.
    pub buffer_frames: u32,
}

/// Callback invoked on the input hardware domain with `(interleaved
/// samples, frames)`. Must not block or allocate on the steady-state path.
pub type InputCallback = Box<dyn FnMut(&[f32], usize) + Send + 'static>;

/// Callback invoked on the output hardware domain with `(interleaved
/// buffer to fill, frames)`. Must not block or allocate on the
/// steady-state path.
pub type OutputCallback = Box<dyn FnMut(&mut [f32], usize) + Send + 'static>;

/// Handle to a running hardware stream.
///
/// The stream runs while the handle is held. Dropping it stops,
/// uninitialises and disposes the stream synchronously: after the drop
/// returns, no further callback for this stream will be invoked.
pub trait StreamHandle: Send {}

/// The capabilities the engine requires from its host audio subsystem.
///
/// Implementations must be safe to call from the control thread while
/// streams opened earlier are running on hardware threads.
pub trait AudioHost: Send + Sync + 'static {
    /// Enumerates the currently connected devices.
    fn devices(&self) -> Result<Vec<DeviceInfo>, PatchBayError>;

    /// Returns the host's default input and output devices.
    fn default_devices(&self) -> Result<DefaultDevices, PatchBayError>;

    /// Looks up one device by UID.
    fn device(&self, uid: &DeviceUid) -> Result<Option<DeviceInfo>, PatchBayError> {
        Ok(self.devices()?.into_iter().find(|d| &d.uid == uid))
    }

    /// Applies the nominal sample rate to a device and reports the rate the
    /// hardware actually settled on.
    fn set_nominal_sample_rate(&self, uid: &DeviceUid, rate: u32) -> Result<f64, PatchBayError>;

    /// Applies the preferred buffer size to a device and reports the size
    /// the hardware actually settled on.
    fn set_buffer_frames(&self, uid: &DeviceUid, frames: u32) -> Result<u32, PatchBayError>;

    /// Opens a push-style capture stream on the device. The callback
    /// receives interleaved f32 frames on a hardware thread.
    fn open_input_stream(
        &self,
        uid: &DeviceUid,
        spec: StreamSpec,
        callback: InputCallback,
    ) -> Result<Box<dyn StreamHandle>, PatchBayError>;

    /// Opens a pull-style playback stream on the device. The callback
    /// fills interleaved f32 frames on a hardware thread.
    fn open_output_stream(
        &self,
        uid: &DeviceUid,
        spec: StreamSpec,
        callback: OutputCallback,
    ) -> Result<Box<dyn StreamHandle>, PatchBayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_uid_equality() {
        let a = DeviceUid::new("IN1");
        let b = DeviceUid::new("IN1");
        let c = DeviceUid::new("IN2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_device_uid_hash() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(DeviceUid::new("IN1"));
        set.insert(DeviceUid::new("OUT1"));
        set.insert(DeviceUid::new("IN1"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_device_supports_sample_rate() {
        let info = DeviceInfo {
            uid: DeviceUid::new("IN1"),
            name: "Mic".to_string(),
            input_channels: 2,
            output_channels: 0,
            sample_rates: vec![44_100, 48_000],
        };
        assert!(info.supports_sample_rate(48_000));
        assert!(!info.supports_sample_rate(96_000));
    }

    #[test]
    fn test_device_uid_serde() {
        let uid = DeviceUid::new("OUT1");
        let json = serde_json::to_string(&uid).unwrap();
        assert_eq!(json, "\"OUT1\"");
        let back: DeviceUid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, uid);
    }
}
