//! Route records and the states a route moves through.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::host::DeviceUid;

/// Caller-supplied unique identifier for a route.
///
/// Cheap to clone and compare; `Arc<str>` internally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteId(Arc<str>);

impl RouteId {
    /// Creates a route id from a string.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RouteId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for RouteId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl Serialize for RouteId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RouteId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

/// One directed edge from an input device's channel pair to an output
/// device's channel pair, with a linear gain.
///
/// Channel indices are 1-based here, at the API boundary; the engine
/// converts to 0-based internally and rejects indices outside the device's
/// channel count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Caller-supplied unique id.
    pub id: RouteId,

    /// UID of the input device.
    pub in_uid: DeviceUid,

    /// 1-based left channel on the input device.
    pub in_left: u16,

    /// 1-based right channel on the input device.
    pub in_right: u16,

    /// UID of the output device.
    pub out_uid: DeviceUid,

    /// 1-based left channel on the output device.
    pub out_left: u16,

    /// 1-based right channel on the output device.
    pub out_right: u16,

    /// Linear gain, nominal range 0.0–2.0.
    #[serde(default = "default_gain")]
    pub gain: f64,

    /// Whether the route participates in rendering.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_gain() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

impl Route {
    /// Creates a plain stereo pass-through route: input channels 1/2 to
    /// output channels 1/2 at unity gain.
    pub fn stereo(id: impl Into<RouteId>, in_uid: DeviceUid, out_uid: DeviceUid) -> Self {
        Self {
            id: id.into(),
            in_uid,
            in_left: 1,
            in_right: 2,
            out_uid,
            out_left: 1,
            out_right: 2,
            gain: default_gain(),
            enabled: default_enabled(),
        }
    }

    /// Sets the channel mapping (1-based indices).
    #[must_use]
    pub fn channels(mut self, in_left: u16, in_right: u16, out_left: u16, out_right: u16) -> Self {
        self.in_left = in_left;
        self.in_right = in_right;
        self.out_left = out_left;
        self.out_right = out_right;
        self
    }

    /// Sets the gain.
    #[must_use]
    pub fn gain(mut self, gain: f64) -> Self {
        self.gain = gain;
        self
    }
}

/// The states a stored route moves through.
///
/// The engine never disables a route on its own; transitions are driven by
/// `set_route_enabled` and by device disconnect events only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteState {
    /// Participating in rendering.
    Enabled,
    /// Disabled by a `set_route_enabled(.., false)` call.
    DisabledByUser,
    /// Disabled because its input or output device disconnected. The
    /// control layer may re-issue `add_route` to revive it.
    DisabledByDevice,
}

impl RouteState {
    /// Whether the route mixes into its output.
    pub fn is_enabled(self) -> bool {
        matches!(self, Self::Enabled)
    }
}

/// A route record together with its current state, as exposed to the
/// control layer for display and persistence round-trips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteView {
    /// The stored route record, with the current gain.
    #[serde(flatten)]
    pub route: Route,
    /// Whether the route was disabled involuntarily by a device disconnect.
    pub disabled_by_device: bool,
}

impl RouteView {
    pub(crate) fn new(route: Route, state: RouteState) -> Self {
        Self {
            route,
            disabled_by_device: matches!(state, RouteState::DisabledByDevice),
        }
    }
}
