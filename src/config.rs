//! Configuration types for the engine and its sessions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::host::DeviceUid;

/// Buffer sizes the hardware is expected to honour without coercion.
///
/// Other values are accepted but the device may adjust them.
pub const PREFERRED_BUFFER_FRAMES: [u32; 4] = [64, 128, 256, 512];

/// Options for starting a session.
///
/// A session scopes one configured output device plus its negotiated sample
/// rate and buffer size. Exactly one session exists at a time; starting a
/// new one stops the previous.
///
/// # Example
///
/// ```
/// use patchbay::{DeviceUid, SessionOptions};
///
/// let opts = SessionOptions::new(DeviceUid::new("OUT1"));
/// assert_eq!(opts.sample_rate, 48_000);
/// assert_eq!(opts.buffer_frames, 256);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    /// UID of the output device the session is anchored on.
    pub output_uid: DeviceUid,

    /// Requested sample rate in Hz. Must be 48000 for now; all devices are
    /// locked to one clock and nothing resamples.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Requested buffer size in frames. Values outside
    /// [`PREFERRED_BUFFER_FRAMES`] are accepted but the hardware may
    /// coerce them.
    #[serde(default = "default_buffer_frames")]
    pub buffer_frames: u32,
}

fn default_sample_rate() -> u32 {
    48_000
}

fn default_buffer_frames() -> u32 {
    256
}

impl SessionOptions {
    /// Creates options for the given output device with default rate and
    /// buffer size (48 kHz, 256 frames).
    pub fn new(output_uid: DeviceUid) -> Self {
        Self {
            output_uid,
            sample_rate: default_sample_rate(),
            buffer_frames: default_buffer_frames(),
        }
    }

    /// Sets the buffer size in frames.
    #[must_use]
    pub fn buffer_frames(mut self, frames: u32) -> Self {
        self.buffer_frames = frames;
        self
    }
}

/// Engine-level tuning knobs.
///
/// Use [`EngineConfig::default()`] for sensible defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pre-roll a newly registered ring reader is positioned behind the
    /// writer, in frames. `None` means half the ring capacity.
    ///
    /// Too small and the first render underruns; too large and latency is
    /// audibly high.
    pub preroll_frames: Option<u32>,

    /// Ring capacity as a multiple of the session buffer size.
    ///
    /// The ring never goes below [`EngineConfig::min_ring_frames`].
    pub ring_buffer_multiple: u32,

    /// Floor for the ring capacity in frames.
    pub min_ring_frames: u32,

    /// How often the [`DeviceWatcher`](crate::DeviceWatcher) polls the host
    /// device list.
    pub watcher_poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            preroll_frames: None,
            ring_buffer_multiple: 8,
            min_ring_frames: 1024,
            watcher_poll_interval: Duration::from_millis(500),
        }
    }
}

impl EngineConfig {
    /// Ring capacity in frames for a session buffer of `buffer_frames`.
    pub(crate) fn ring_capacity(&self, buffer_frames: u32) -> usize {
        (self.ring_buffer_multiple * buffer_frames).max(self.min_ring_frames) as usize
    }

    /// Pre-roll in frames for a ring of `capacity` frames.
    pub(crate) fn preroll(&self, capacity: usize) -> usize {
        match self.preroll_frames {
            Some(frames) => (frames as usize).min(capacity),
            None => capacity / 2,
        }
    }
}
