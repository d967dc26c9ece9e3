//! Device hot-plug events.
//!
//! Events are non-fatal notifications about the host device list. The
//! engine treats them idempotently: a repeated emission for a device that
//! is already in the reported state changes nothing.

use std::sync::Arc;

use crate::host::DeviceUid;

/// A change observed in the host device list.
///
/// Emitted by the [`DeviceWatcher`](crate::DeviceWatcher) on its own thread
/// and marshalled onto the control domain before the engine acts on it.
/// Disconnection disables affected routes (preserving a "disabled by
/// device" marker) and tears down the device's streams; connection is
/// informational, and the control layer decides whether to re-issue
/// `add_route` for previously disabled routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A device appeared in the host device list.
    Connected {
        /// Stable UID of the device.
        uid: DeviceUid,
        /// Human-readable device name.
        name: String,
    },

    /// A device vanished from the host device list.
    Disconnected {
        /// Stable UID of the device.
        uid: DeviceUid,
        /// Human-readable device name (as last seen).
        name: String,
    },
}

impl DeviceEvent {
    /// UID of the device this event concerns.
    pub fn uid(&self) -> &DeviceUid {
        match self {
            Self::Connected { uid, .. } | Self::Disconnected { uid, .. } => uid,
        }
    }
}

/// Callback type for receiving device events.
///
/// Register via [`PatchBay::on_device_event()`] to observe hot-plug changes
/// after the engine has processed them.
///
/// [`PatchBay::on_device_event()`]: crate::PatchBay::on_device_event
///
/// # Example
///
/// ```ignore
/// bay.on_device_event(|event| {
///     tracing::info!(?event, "device list changed");
/// });
/// ```
pub type EventCallback = Arc<dyn Fn(DeviceEvent) + Send + Sync>;

/// Creates an [`EventCallback`] from a closure.
///
/// Convenience for building event callbacks without manually wrapping in
/// `Arc`.
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(DeviceEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}
