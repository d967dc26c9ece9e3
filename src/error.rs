//! Error types for patchbay.
//!
//! Errors are split into two categories:
//! - **Control-domain errors** ([`PatchBayError`]): returned verbatim from
//!   session and route operations
//! - **Callback-domain failures**: never propagated; the render or capture
//!   callback outputs silence or drops the window and the underrun/overrun
//!   counters advance

use crate::host::DeviceUid;
use crate::route::RouteId;

/// Errors returned from the control surface of the engine.
///
/// These indicate that a session or route operation could not be applied.
/// Runtime issues on the hardware callbacks (underruns, overruns) are
/// counted in [`EngineStats`](crate::EngineStats) instead, and device
/// disconnection is a [`DeviceEvent`](crate::DeviceEvent), not an error.
#[derive(Debug, thiserror::Error)]
pub enum PatchBayError {
    /// A route operation was issued while no session is active.
    #[error("no active session")]
    NoSession,

    /// A required argument was missing or malformed.
    #[error("invalid argument: {reason}")]
    InvalidArgs {
        /// What was wrong with the arguments.
        reason: String,
    },

    /// The given route id does not resolve to a stored route.
    #[error("unknown route: {id}")]
    RouteNotFound {
        /// The id that wasn't found.
        id: RouteId,
    },

    /// The given device UID does not resolve to a connected device.
    #[error("device not found: {uid}")]
    DeviceNotFound {
        /// UID of the device that wasn't found.
        uid: DeviceUid,
    },

    /// The device does not support the requested sample rate.
    #[error("device {uid} does not support {requested}Hz (available: {available:?})")]
    SampleRateNotSupported {
        /// Device whose rate list was consulted.
        uid: DeviceUid,
        /// The requested sample rate.
        requested: u32,
        /// Sample rates the device reports.
        available: Vec<u32>,
    },

    /// The nominal sample rate could not be applied to the device.
    #[error("failed to set sample rate on {uid}: {reason}")]
    SampleRateSetFailed {
        /// Device the rate was applied to.
        uid: DeviceUid,
        /// Why the hardware rejected it.
        reason: String,
    },

    /// The buffer frame size could not be applied to the device.
    #[error("failed to set buffer size on {uid}: {reason}")]
    BufferSetFailed {
        /// Device the buffer size was applied to.
        uid: DeviceUid,
        /// Why the hardware rejected it.
        reason: String,
    },

    /// An input channel index is at or beyond the device's channel count.
    ///
    /// Channel indices are 1-based at this boundary.
    #[error("input channel {channel} out of range (device has {available} channels)")]
    InvalidInputChannel {
        /// The offending 1-based channel index.
        channel: u16,
        /// Channels the device actually has.
        available: u16,
    },

    /// An output channel index is at or beyond the device's channel count.
    ///
    /// Channel indices are 1-based at this boundary.
    #[error("output channel {channel} out of range (device has {available} channels)")]
    InvalidOutputChannel {
        /// The offending 1-based channel index.
        channel: u16,
        /// Channels the device actually has.
        available: u16,
    },

    /// The hardware input stream could not be opened or started.
    #[error("input stream failed to start on {uid}: {reason}")]
    InputStartFailed {
        /// Device the stream was opened on.
        uid: DeviceUid,
        /// Why the stream failed.
        reason: String,
    },

    /// The hardware output stream could not be opened or started.
    #[error("output stream failed to start on {uid}: {reason}")]
    OutputStartFailed {
        /// Device the stream was opened on.
        uid: DeviceUid,
        /// Why the stream failed.
        reason: String,
    },

    /// The device reports zero channels in the required direction.
    #[error("device {uid} has no {direction} channels")]
    InvalidDeviceChannels {
        /// The offending device.
        uid: DeviceUid,
        /// "input" or "output".
        direction: &'static str,
    },

    /// An error from the underlying audio host.
    #[error("audio backend error: {0}")]
    Backend(String),
}

impl PatchBayError {
    /// Creates an `InvalidArgs` error with the given reason.
    pub fn invalid_args(reason: impl Into<String>) -> Self {
        Self::InvalidArgs {
            reason: reason.into(),
        }
    }

    /// Creates a `Backend` error from anything displayable.
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}
