//! The router/engine: route table, resource lifecycle and the mix.
//!
//! All engine tables are mutated on the control domain under one
//! short-held lock. Output hardware callbacks consult an immutable render
//! plan swapped copy-on-write, so the render path never touches the table
//! lock.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::{EngineConfig, SessionOptions, PREFERRED_BUFFER_FRAMES};
use crate::event::{DeviceEvent, EventCallback};
use crate::host::{AudioHost, DefaultDevices, DeviceInfo, DeviceUid, StreamSpec};
use crate::pipeline::{InputTap, OutputUnit, RenderScratch, RenderSink};
use crate::route::{Route, RouteId, RouteState, RouteView};
use crate::watcher::DeviceWatcher;
use crate::PatchBayError;

/// The MVP locks every device to one clock; nothing resamples.
const SESSION_SAMPLE_RATE: u32 = 48_000;

/// Negotiated parameters of the active session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Monotonically increasing session number.
    pub session_id: u64,
    /// The output device the session is anchored on.
    pub output_uid: DeviceUid,
    /// Sample rate the hardware actually settled on, in Hz.
    pub sample_rate: u32,
    /// Buffer size the hardware actually settled on, in frames.
    pub buffer_frames: u32,
}

/// Counters and gauges for the control layer.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EngineStats {
    /// Render windows that held fewer frames than requested.
    pub underruns: u64,
    /// Times a writer lapped a reader, dropping the oldest frames.
    pub overruns: u64,
    /// Routes in the table, in any state.
    pub routes: usize,
    /// Mean ring backlog across active (input, output) pairs, in `[0, 1]`.
    pub buffer_fill: f64,
    /// Live input taps.
    pub input_taps: usize,
    /// Live output units.
    pub output_units: usize,
}

#[derive(Default)]
struct Counters {
    underruns: AtomicU64,
    overruns: AtomicU64,
}

struct RouteEntry {
    route: Route,
    state: RouteState,
    /// Gain as f64 bits, shared with the render plan so gain changes skip
    /// the plan rebuild.
    gain: Arc<AtomicU64>,
}

/// One input ring feeding an output, deduplicated per output.
struct Feed {
    ring: Arc<crate::pipeline::ChannelRing>,
}

struct PlanRoute {
    feed: usize,
    in_left: usize,
    in_right: usize,
    out_left: usize,
    out_right: usize,
    gain: Arc<AtomicU64>,
}

#[derive(Default)]
struct OutputPlan {
    feeds: Vec<Feed>,
    routes: Vec<PlanRoute>,
}

/// Immutable snapshot the output callbacks mix from.
#[derive(Default)]
struct RenderPlan {
    outputs: HashMap<DeviceUid, OutputPlan>,
}

#[derive(Default)]
struct EngineState {
    session: Option<SessionInfo>,
    routes: BTreeMap<RouteId, RouteEntry>,
    taps: HashMap<DeviceUid, InputTap>,
    units: HashMap<DeviceUid, OutputUnit>,
}

struct EngineCore {
    host: Arc<dyn AudioHost>,
    config: EngineConfig,
    state: Mutex<EngineState>,
    plan: Mutex<Arc<RenderPlan>>,
    counters: Counters,
    observers: Mutex<Vec<EventCallback>>,
    next_session_id: AtomicU64,
}

struct WatcherRig {
    watcher: DeviceWatcher,
    pump: Option<JoinHandle<()>>,
}

/// The patch-bay engine.
///
/// Owns the route table, the per-output render plan, and the lifecycle of
/// every [`InputTap`] and [`OutputUnit`]. Commands run on the caller's
/// thread (the control domain); rendering happens inside each output
/// device's hardware callback.
pub struct PatchBay {
    core: Arc<EngineCore>,
    watcher: Mutex<Option<WatcherRig>>,
}

impl PatchBay {
    /// Creates an engine on the given host. No hardware is touched until
    /// a session starts.
    pub fn new(host: Arc<dyn AudioHost>, config: EngineConfig) -> Self {
        Self {
            core: Arc::new(EngineCore {
                host,
                config,
                state: Mutex::new(EngineState::default()),
                plan: Mutex::new(Arc::new(RenderPlan::default())),
                counters: Counters::default(),
                observers: Mutex::new(Vec::new()),
                next_session_id: AtomicU64::new(0),
            }),
            watcher: Mutex::new(None),
        }
    }

    /// Enumerates the currently connected devices.
    pub fn list_devices(&self) -> Result<Vec<DeviceInfo>, PatchBayError> {
        self.core.host.devices()
    }

    /// Returns the host's default input and output devices.
    pub fn default_devices(&self) -> Result<DefaultDevices, PatchBayError> {
        self.core.host.default_devices()
    }

    /// Starts a session on the given output device, stopping any prior
    /// session first.
    pub fn start_session(&self, opts: &SessionOptions) -> Result<SessionInfo, PatchBayError> {
        self.core.start_session(opts)
    }

    /// Stops the session: every output unit, then every input tap, then
    /// clears the route table.
    pub fn stop_session(&self) {
        self.core.stop_session();
    }

    /// Stores and activates a route. Creates the input tap and output
    /// unit if this is the first route to reference them.
    pub fn add_route(&self, route: Route) -> Result<(), PatchBayError> {
        self.core.add_route(route)
    }

    /// Removes a route and disposes any tap or unit nothing references
    /// anymore.
    pub fn remove_route(&self, id: &RouteId) -> Result<(), PatchBayError> {
        self.core.remove_route(id)
    }

    /// Enables or disables a route without starting or stopping hardware.
    pub fn set_route_enabled(&self, id: &RouteId, enabled: bool) -> Result<(), PatchBayError> {
        self.core.set_route_enabled(id, enabled)
    }

    /// Updates a route's gain, atomically with respect to the render
    /// callback.
    pub fn set_route_gain(&self, id: &RouteId, gain: f64) -> Result<(), PatchBayError> {
        self.core.set_route_gain(id, gain)
    }

    /// Current counters and gauges.
    pub fn stats(&self) -> EngineStats {
        self.core.stats()
    }

    /// The active session, if any.
    pub fn session(&self) -> Option<SessionInfo> {
        self.core.state.lock().session.clone()
    }

    /// Every stored route with its current state, for display and
    /// persistence round-trips.
    pub fn routes(&self) -> Vec<RouteView> {
        let state = self.core.state.lock();
        state
            .routes
            .values()
            .map(|entry| RouteView::new(entry.route.clone(), entry.state))
            .collect()
    }

    /// Applies a device event on the calling (control) thread.
    ///
    /// [`attach_watcher`](Self::attach_watcher) does this automatically;
    /// call it directly when driving events from elsewhere.
    pub fn handle_device_event(&self, event: &DeviceEvent) {
        self.core.process_event(event);
    }

    /// Registers an observer invoked after the engine has processed each
    /// device event.
    pub fn on_device_event<F>(&self, callback: F)
    where
        F: Fn(DeviceEvent) + Send + Sync + 'static,
    {
        self.core.observers.lock().push(Arc::new(callback));
    }

    /// Spawns the device watcher plus a pump thread that marshals its
    /// events onto the control domain. Idempotent.
    pub fn attach_watcher(&self) {
        let mut slot = self.watcher.lock();
        if slot.is_some() {
            return;
        }

        let (tx, rx) = crossbeam_channel::unbounded();
        let watcher = DeviceWatcher::spawn(
            Arc::clone(&self.core.host),
            self.core.config.watcher_poll_interval,
            tx,
        );

        let core = Arc::clone(&self.core);
        let pump = std::thread::Builder::new()
            .name("patchbay-events".to_string())
            .spawn(move || {
                while let Ok(event) = rx.recv() {
                    core.process_event(&event);
                }
            });

        match pump {
            Ok(handle) => {
                *slot = Some(WatcherRig {
                    watcher,
                    pump: Some(handle),
                });
            }
            Err(e) => tracing::error!("failed to spawn event pump: {e}"),
        }
    }

    /// Stops the watcher and its pump thread. Idempotent.
    pub fn detach_watcher(&self) {
        let rig = self.watcher.lock().take();
        if let Some(mut rig) = rig {
            // Stopping the watcher closes the channel, which ends the pump.
            rig.watcher.stop();
            if let Some(pump) = rig.pump.take() {
                let _ = pump.join();
            }
        }
    }
}

impl Drop for PatchBay {
    fn drop(&mut self) {
        self.detach_watcher();
        // Units stop before taps, and both before the core can go away.
        self.core.stop_session();
    }
}

impl EngineCore {
    fn resolve_device(&self, uid: &DeviceUid) -> Result<DeviceInfo, PatchBayError> {
        self.host
            .device(uid)?
            .ok_or_else(|| PatchBayError::DeviceNotFound { uid: uid.clone() })
    }

    fn start_session(self: &Arc<Self>, opts: &SessionOptions) -> Result<SessionInfo, PatchBayError> {
        if !PREFERRED_BUFFER_FRAMES.contains(&opts.buffer_frames) {
            tracing::warn!(
                frames = opts.buffer_frames,
                "unusual buffer size; the hardware may coerce it"
            );
        }

        // Any prior session stops before validation, so every failure
        // mode leaves the engine Idle.
        let mut state = self.state.lock();
        self.stop_session_locked(&mut state);

        if opts.sample_rate != SESSION_SAMPLE_RATE {
            return Err(PatchBayError::invalid_args(format!(
                "sample rate must be {SESSION_SAMPLE_RATE}Hz"
            )));
        }

        let info = self.resolve_device(&opts.output_uid)?;
        if info.output_channels == 0 {
            return Err(PatchBayError::InvalidDeviceChannels {
                uid: opts.output_uid.clone(),
                direction: "output",
            });
        }
        if !info.supports_sample_rate(opts.sample_rate) {
            return Err(PatchBayError::SampleRateNotSupported {
                uid: opts.output_uid.clone(),
                requested: opts.sample_rate,
                available: info.sample_rates.clone(),
            });
        }

        let actual_rate = self
            .host
            .set_nominal_sample_rate(&opts.output_uid, opts.sample_rate)?;
        let actual_frames = self
            .host
            .set_buffer_frames(&opts.output_uid, opts.buffer_frames)?;

        self.counters.underruns.store(0, Ordering::Relaxed);
        self.counters.overruns.store(0, Ordering::Relaxed);

        let session = SessionInfo {
            session_id: self.next_session_id.fetch_add(1, Ordering::Relaxed) + 1,
            output_uid: opts.output_uid.clone(),
            sample_rate: actual_rate.round() as u32,
            buffer_frames: actual_frames,
        };
        tracing::info!(
            id = session.session_id,
            output = %session.output_uid,
            rate = session.sample_rate,
            frames = session.buffer_frames,
            "session started"
        );
        state.session = Some(session.clone());
        Ok(session)
    }

    fn stop_session(&self) {
        let mut state = self.state.lock();
        self.stop_session_locked(&mut state);
    }

    /// Stops units first so no further render asks the engine for a mix,
    /// then taps, then clears the table.
    fn stop_session_locked(&self, state: &mut EngineState) {
        if state.session.is_none() && state.routes.is_empty() {
            return;
        }
        *self.plan.lock() = Arc::new(RenderPlan::default());
        for unit in state.units.values_mut() {
            unit.stop();
        }
        state.units.clear();
        for tap in state.taps.values_mut() {
            tap.stop();
        }
        state.taps.clear();
        state.routes.clear();
        if let Some(session) = state.session.take() {
            tracing::info!(id = session.session_id, "session stopped");
        }
    }

    fn add_route(self: &Arc<Self>, route: Route) -> Result<(), PatchBayError> {
        if route.id.as_str().is_empty() {
            return Err(PatchBayError::invalid_args("route id must not be empty"));
        }
        if !route.gain.is_finite() {
            return Err(PatchBayError::invalid_args("gain must be finite"));
        }
        for (label, channel) in [
            ("in_left", route.in_left),
            ("in_right", route.in_right),
            ("out_left", route.out_left),
            ("out_right", route.out_right),
        ] {
            if channel == 0 {
                return Err(PatchBayError::invalid_args(format!(
                    "{label} is 1-based and must be positive"
                )));
            }
        }

        let mut state = self.state.lock();
        let session = state.session.clone().ok_or(PatchBayError::NoSession)?;

        let in_info = self.resolve_device(&route.in_uid)?;
        let out_info = self.resolve_device(&route.out_uid)?;
        if in_info.input_channels == 0 {
            return Err(PatchBayError::InvalidDeviceChannels {
                uid: route.in_uid.clone(),
                direction: "input",
            });
        }
        if out_info.output_channels == 0 {
            return Err(PatchBayError::InvalidDeviceChannels {
                uid: route.out_uid.clone(),
                direction: "output",
            });
        }
        for (uid, info) in [(&route.in_uid, &in_info), (&route.out_uid, &out_info)] {
            if !info.supports_sample_rate(session.sample_rate) {
                return Err(PatchBayError::SampleRateNotSupported {
                    uid: (*uid).clone(),
                    requested: session.sample_rate,
                    available: info.sample_rates.clone(),
                });
            }
        }
        for channel in [route.in_left, route.in_right] {
            if channel > in_info.input_channels {
                return Err(PatchBayError::InvalidInputChannel {
                    channel,
                    available: in_info.input_channels,
                });
            }
        }
        for channel in [route.out_left, route.out_right] {
            if channel > out_info.output_channels {
                return Err(PatchBayError::InvalidOutputChannel {
                    channel,
                    available: out_info.output_channels,
                });
            }
        }

        for uid in [&route.in_uid, &route.out_uid] {
            self.host
                .set_nominal_sample_rate(uid, session.sample_rate)?;
            self.host.set_buffer_frames(uid, session.buffer_frames)?;
        }

        // Tap first, and register the output as a reader before the unit
        // can issue its first render, so the ring serves a coherent
        // timeline from the start.
        if !state.taps.contains_key(&route.in_uid) {
            let capacity = self.config.ring_capacity(session.buffer_frames);
            let tap = InputTap::start(
                self.host.as_ref(),
                route.in_uid.clone(),
                in_info.input_channels,
                StreamSpec {
                    sample_rate: session.sample_rate,
                    channels: in_info.input_channels,
                    buffer_frames: session.buffer_frames,
                },
                capacity,
                self.config.preroll(capacity),
            )?;
            state.taps.insert(route.in_uid.clone(), tap);
        }
        if let Some(tap) = state.taps.get(&route.in_uid) {
            tap.ring().register_reader(&route.out_uid);
        }

        if !state.units.contains_key(&route.out_uid) {
            let sink_arc: Arc<dyn RenderSink> = self.clone();
            let sink: Weak<dyn RenderSink> = Arc::downgrade(&sink_arc);
            let unit = OutputUnit::start(
                self.host.as_ref(),
                route.out_uid.clone(),
                out_info.output_channels,
                StreamSpec {
                    sample_rate: session.sample_rate,
                    channels: out_info.output_channels,
                    buffer_frames: session.buffer_frames,
                },
                sink,
            );
            match unit {
                Ok(unit) => {
                    state.units.insert(route.out_uid.clone(), unit);
                }
                Err(e) => {
                    // The route was never stored; drop anything only it
                    // would have referenced.
                    self.cleanup_locked(&mut state);
                    self.rebuild_plan_locked(&state);
                    return Err(e);
                }
            }
        }

        tracing::info!(
            id = %route.id,
            input = %route.in_uid,
            output = %route.out_uid,
            gain = route.gain,
            "route added"
        );
        let entry = RouteEntry {
            state: if route.enabled {
                RouteState::Enabled
            } else {
                RouteState::DisabledByUser
            },
            gain: Arc::new(AtomicU64::new(route.gain.to_bits())),
            route,
        };
        state.routes.insert(entry.route.id.clone(), entry);

        self.rebuild_plan_locked(&state);
        self.cleanup_locked(&mut state);
        Ok(())
    }

    fn remove_route(&self, id: &RouteId) -> Result<(), PatchBayError> {
        let mut state = self.state.lock();
        if state.session.is_none() {
            return Err(PatchBayError::NoSession);
        }
        if state.routes.remove(id).is_none() {
            return Err(PatchBayError::RouteNotFound { id: id.clone() });
        }
        tracing::info!(%id, "route removed");
        self.rebuild_plan_locked(&state);
        self.cleanup_locked(&mut state);
        Ok(())
    }

    fn set_route_enabled(&self, id: &RouteId, enabled: bool) -> Result<(), PatchBayError> {
        let mut state = self.state.lock();
        if state.session.is_none() {
            return Err(PatchBayError::NoSession);
        }
        let entry = state
            .routes
            .get_mut(id)
            .ok_or_else(|| PatchBayError::RouteNotFound { id: id.clone() })?;
        entry.state = if enabled {
            RouteState::Enabled
        } else {
            RouteState::DisabledByUser
        };
        entry.route.enabled = enabled;
        self.rebuild_plan_locked(&state);
        Ok(())
    }

    fn set_route_gain(&self, id: &RouteId, gain: f64) -> Result<(), PatchBayError> {
        if !gain.is_finite() {
            return Err(PatchBayError::invalid_args("gain must be finite"));
        }
        let mut state = self.state.lock();
        if state.session.is_none() {
            return Err(PatchBayError::NoSession);
        }
        let entry = state
            .routes
            .get_mut(id)
            .ok_or_else(|| PatchBayError::RouteNotFound { id: id.clone() })?;
        entry.route.gain = gain;
        entry.gain.store(gain.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> EngineStats {
        let state = self.state.lock();

        let mut pairs: HashSet<(&DeviceUid, &DeviceUid)> = HashSet::new();
        let mut fill_total = 0.0;
        for entry in state.routes.values() {
            let pair = (&entry.route.in_uid, &entry.route.out_uid);
            if !pairs.insert(pair) {
                continue;
            }
            if let Some(tap) = state.taps.get(&entry.route.in_uid) {
                if tap.ring().has_reader(&entry.route.out_uid) {
                    fill_total += tap.ring().fill_ratio(&entry.route.out_uid);
                } else {
                    pairs.remove(&pair);
                }
            } else {
                pairs.remove(&pair);
            }
        }
        let buffer_fill = if pairs.is_empty() {
            0.0
        } else {
            fill_total / pairs.len() as f64
        };

        EngineStats {
            underruns: self.counters.underruns.load(Ordering::Relaxed),
            overruns: self.counters.overruns.load(Ordering::Relaxed),
            routes: state.routes.len(),
            buffer_fill,
            input_taps: state.taps.len(),
            output_units: state.units.len(),
        }
    }

    fn process_event(&self, event: &DeviceEvent) {
        match event {
            DeviceEvent::Connected { uid, name } => {
                // No automatic action; the control layer decides whether to
                // re-issue add_route for routes this device disabled.
                tracing::info!(%uid, %name, "device connected");
            }
            DeviceEvent::Disconnected { uid, name } => {
                tracing::warn!(%uid, %name, "device disconnected");
                let mut state = self.state.lock();
                for entry in state.routes.values_mut() {
                    if (&entry.route.in_uid == uid || &entry.route.out_uid == uid)
                        && entry.state.is_enabled()
                    {
                        entry.state = RouteState::DisabledByDevice;
                        tracing::warn!(id = %entry.route.id, "route disabled by device");
                    }
                }
                if let Some(mut unit) = state.units.remove(uid) {
                    unit.stop();
                }
                if let Some(mut tap) = state.taps.remove(uid) {
                    tap.stop();
                }
                self.rebuild_plan_locked(&state);
                self.cleanup_locked(&mut state);
            }
        }

        let observers = self.observers.lock().clone();
        for observer in observers {
            observer(event.clone());
        }
    }

    /// Rebuilds the per-output plan from the table and swaps it in.
    ///
    /// Only enabled routes whose tap and unit are both alive participate.
    fn rebuild_plan_locked(&self, state: &EngineState) {
        let mut outputs: HashMap<DeviceUid, OutputPlan> = HashMap::new();
        if state.session.is_some() {
            for entry in state.routes.values() {
                if !entry.state.is_enabled() {
                    continue;
                }
                let Some(tap) = state.taps.get(&entry.route.in_uid) else {
                    continue;
                };
                if !state.units.contains_key(&entry.route.out_uid) {
                    continue;
                }

                let plan = outputs.entry(entry.route.out_uid.clone()).or_default();
                let feed = plan
                    .feeds
                    .iter()
                    .position(|f| Arc::ptr_eq(&f.ring, tap.ring()))
                    .unwrap_or_else(|| {
                        plan.feeds.push(Feed {
                            ring: Arc::clone(tap.ring()),
                        });
                        plan.feeds.len() - 1
                    });
                plan.routes.push(PlanRoute {
                    feed,
                    in_left: (entry.route.in_left - 1) as usize,
                    in_right: (entry.route.in_right - 1) as usize,
                    out_left: (entry.route.out_left - 1) as usize,
                    out_right: (entry.route.out_right - 1) as usize,
                    gain: Arc::clone(&entry.gain),
                });
            }
        }
        *self.plan.lock() = Arc::new(RenderPlan { outputs });
    }

    /// Disposes taps and units no route references anymore and prunes
    /// stale reader cursors from the surviving rings.
    fn cleanup_locked(&self, state: &mut EngineState) {
        let referenced_inputs: HashSet<DeviceUid> = state
            .routes
            .values()
            .map(|e| e.route.in_uid.clone())
            .collect();
        let referenced_outputs: HashSet<DeviceUid> = state
            .routes
            .values()
            .map(|e| e.route.out_uid.clone())
            .collect();

        let mut dead_units: Vec<OutputUnit> = Vec::new();
        for uid in state
            .units
            .keys()
            .filter(|uid| !referenced_outputs.contains(*uid))
            .cloned()
            .collect::<Vec<_>>()
        {
            if let Some(unit) = state.units.remove(&uid) {
                dead_units.push(unit);
            }
        }
        for mut unit in dead_units {
            unit.stop();
        }

        let mut dead_taps: Vec<InputTap> = Vec::new();
        for uid in state
            .taps
            .keys()
            .filter(|uid| !referenced_inputs.contains(*uid))
            .cloned()
            .collect::<Vec<_>>()
        {
            if let Some(tap) = state.taps.remove(&uid) {
                dead_taps.push(tap);
            }
        }
        for mut tap in dead_taps {
            tap.stop();
        }

        // Readers on surviving rings: every output still routed from that
        // input and still backed by a live unit.
        for tap in state.taps.values() {
            let keep: Vec<DeviceUid> = state
                .routes
                .values()
                .filter(|e| e.route.in_uid == *tap.uid())
                .map(|e| e.route.out_uid.clone())
                .filter(|out| state.units.contains_key(out))
                .collect();
            tap.ring().prune_readers(&keep);
        }
    }
}

impl RenderSink for EngineCore {
    /// The mix for one output device, run inside its hardware callback.
    ///
    /// Every distinct input ring is read through exactly one window per
    /// render, so a route's left and right channels come from the same
    /// `(start, frames)` even while the writer advances.
    fn render(
        &self,
        uid: &DeviceUid,
        planar: &mut [Vec<f32>],
        frames: usize,
        scratch: &mut RenderScratch,
    ) {
        for channel in planar.iter_mut() {
            channel[..frames].fill(0.0);
        }

        let plan = Arc::clone(&self.plan.lock());
        let Some(output) = plan.outputs.get(uid) else {
            return;
        };

        scratch.windows.clear();
        for feed in &output.feeds {
            let window = feed.ring.begin_read(uid, frames);
            if window.underrun {
                self.counters.underruns.fetch_add(1, Ordering::Relaxed);
            }
            if window.overrun {
                self.counters.overruns.fetch_add(1, Ordering::Relaxed);
            }
            scratch.windows.push(window);
        }

        for route in &output.routes {
            let window = scratch.windows[route.feed];
            if window.frames == 0 {
                continue;
            }
            let gain = f64::from_bits(route.gain.load(Ordering::Relaxed)) as f32;
            if gain == 0.0 {
                continue;
            }
            let ring = &output.feeds[route.feed].ring;
            for (in_ch, out_ch) in [
                (route.in_left, route.out_left),
                (route.in_right, route.out_right),
            ] {
                if out_ch >= planar.len() || in_ch >= ring.channels() {
                    continue;
                }
                ring.read_channel(window.start, window.frames, in_ch, &mut scratch.mono);
                let dest = &mut planar[out_ch];
                for (slot, sample) in dest[..window.frames]
                    .iter_mut()
                    .zip(&scratch.mono[..window.frames])
                {
                    *slot += sample * gain;
                }
            }
        }

        for (feed, window) in output.feeds.iter().zip(&scratch.windows) {
            feed.ring.end_read(uid, window.frames);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MockHost;

    fn rig() -> (MockHost, PatchBay) {
        let host = MockHost::new();
        host.add_device(DeviceInfo {
            uid: DeviceUid::new("IN1"),
            name: "Mic 1".to_string(),
            input_channels: 2,
            output_channels: 0,
            sample_rates: vec![44_100, 48_000],
        });
        host.add_device(DeviceInfo {
            uid: DeviceUid::new("OUT1"),
            name: "Speakers".to_string(),
            input_channels: 0,
            output_channels: 2,
            sample_rates: vec![48_000],
        });
        let bay = PatchBay::new(Arc::new(host.clone()), EngineConfig::default());
        (host, bay)
    }

    fn uid(s: &str) -> DeviceUid {
        DeviceUid::new(s)
    }

    fn start(bay: &PatchBay) -> SessionInfo {
        bay.start_session(&SessionOptions::new(uid("OUT1"))).unwrap()
    }

    #[test]
    fn test_route_ops_fail_without_session() {
        let (_host, bay) = rig();
        let route = Route::stereo("R1", uid("IN1"), uid("OUT1"));
        assert!(matches!(
            bay.add_route(route),
            Err(PatchBayError::NoSession)
        ));
        assert!(matches!(
            bay.remove_route(&"R1".into()),
            Err(PatchBayError::NoSession)
        ));
        assert!(matches!(
            bay.set_route_enabled(&"R1".into(), false),
            Err(PatchBayError::NoSession)
        ));
        assert!(matches!(
            bay.set_route_gain(&"R1".into(), 0.5),
            Err(PatchBayError::NoSession)
        ));
    }

    #[test]
    fn test_start_session_reports_negotiated_values() {
        let (_host, bay) = rig();
        let session = start(&bay);
        assert_eq!(session.session_id, 1);
        assert_eq!(session.sample_rate, 48_000);
        assert_eq!(session.buffer_frames, 256);

        // Restart bumps the id.
        let session = start(&bay);
        assert_eq!(session.session_id, 2);
    }

    #[test]
    fn test_start_session_rejects_unknown_output() {
        let (_host, bay) = rig();
        let result = bay.start_session(&SessionOptions::new(uid("GHOST")));
        assert!(matches!(
            result,
            Err(PatchBayError::DeviceNotFound { .. })
        ));
    }

    #[test]
    fn test_start_session_rejects_input_only_device() {
        let (_host, bay) = rig();
        let result = bay.start_session(&SessionOptions::new(uid("IN1")));
        assert!(matches!(
            result,
            Err(PatchBayError::InvalidDeviceChannels { .. })
        ));
    }

    #[test]
    fn test_start_session_surfaces_buffer_set_failure() {
        let (host, bay) = rig();
        host.fail_buffer_frames(true);
        let result = bay.start_session(&SessionOptions::new(uid("OUT1")));
        assert!(matches!(
            result,
            Err(PatchBayError::BufferSetFailed { .. })
        ));
        assert!(bay.session().is_none());
    }

    #[test]
    fn test_add_route_surfaces_buffer_set_failure() {
        let (host, bay) = rig();
        start(&bay);
        host.fail_buffer_frames(true);

        let result = bay.add_route(Route::stereo("R1", uid("IN1"), uid("OUT1")));
        assert!(matches!(
            result,
            Err(PatchBayError::BufferSetFailed { .. })
        ));
        let stats = bay.stats();
        assert_eq!(stats.routes, 0);
        assert_eq!(stats.input_taps, 0);
    }

    #[test]
    fn test_start_session_rejects_non_48k() {
        let (_host, bay) = rig();
        let mut opts = SessionOptions::new(uid("OUT1"));
        opts.sample_rate = 44_100;
        assert!(matches!(
            bay.start_session(&opts),
            Err(PatchBayError::InvalidArgs { .. })
        ));
    }

    #[test]
    fn test_failed_restart_still_stops_prior_session() {
        let (host, bay) = rig();
        start(&bay);
        bay.add_route(Route::stereo("R1", uid("IN1"), uid("OUT1")))
            .unwrap();

        // The prior session stops before any validation runs, so even a
        // rejected sample rate leaves the engine Idle.
        let mut opts = SessionOptions::new(uid("OUT1"));
        opts.sample_rate = 44_100;
        assert!(matches!(
            bay.start_session(&opts),
            Err(PatchBayError::InvalidArgs { .. })
        ));

        assert!(bay.session().is_none());
        let stats = bay.stats();
        assert_eq!(stats.routes, 0);
        assert_eq!(stats.input_taps, 0);
        assert_eq!(stats.output_units, 0);
        assert!(!host.input_stream_open(&uid("IN1")));
        assert!(!host.output_stream_open(&uid("OUT1")));
    }

    #[test]
    fn test_add_route_spawns_tap_and_unit() {
        let (host, bay) = rig();
        start(&bay);
        bay.add_route(Route::stereo("R1", uid("IN1"), uid("OUT1")))
            .unwrap();

        let stats = bay.stats();
        assert_eq!(stats.routes, 1);
        assert_eq!(stats.input_taps, 1);
        assert_eq!(stats.output_units, 1);
        assert!(host.input_stream_open(&uid("IN1")));
        assert!(host.output_stream_open(&uid("OUT1")));
    }

    #[test]
    fn test_add_then_remove_restores_resource_set() {
        let (host, bay) = rig();
        start(&bay);
        bay.add_route(Route::stereo("R1", uid("IN1"), uid("OUT1")))
            .unwrap();
        bay.remove_route(&"R1".into()).unwrap();

        let stats = bay.stats();
        assert_eq!(stats.routes, 0);
        assert_eq!(stats.input_taps, 0);
        assert_eq!(stats.output_units, 0);
        assert!(!host.input_stream_open(&uid("IN1")));
        assert!(!host.output_stream_open(&uid("OUT1")));
    }

    #[test]
    fn test_invalid_input_channel_leaves_engine_unchanged() {
        let (host, bay) = rig();
        start(&bay);
        let route = Route::stereo("R1", uid("IN1"), uid("OUT1")).channels(1, 3, 1, 2);
        assert!(matches!(
            bay.add_route(route),
            Err(PatchBayError::InvalidInputChannel {
                channel: 3,
                available: 2
            })
        ));
        let stats = bay.stats();
        assert_eq!(stats.routes, 0);
        assert_eq!(stats.input_taps, 0);
        assert!(!host.input_stream_open(&uid("IN1")));
    }

    #[test]
    fn test_zero_channel_index_is_invalid_args() {
        let (_host, bay) = rig();
        start(&bay);
        let route = Route::stereo("R1", uid("IN1"), uid("OUT1")).channels(0, 2, 1, 2);
        assert!(matches!(
            bay.add_route(route),
            Err(PatchBayError::InvalidArgs { .. })
        ));
    }

    #[test]
    fn test_output_start_failure_rolls_back_tap() {
        let (host, bay) = rig();
        start(&bay);
        host.fail_output_streams(true);

        let result = bay.add_route(Route::stereo("R1", uid("IN1"), uid("OUT1")));
        assert!(matches!(
            result,
            Err(PatchBayError::OutputStartFailed { .. })
        ));

        let stats = bay.stats();
        assert_eq!(stats.routes, 0);
        assert_eq!(stats.input_taps, 0);
        assert!(!host.input_stream_open(&uid("IN1")));
    }

    #[test]
    fn test_stop_session_clears_everything() {
        let (host, bay) = rig();
        start(&bay);
        bay.add_route(Route::stereo("R1", uid("IN1"), uid("OUT1")))
            .unwrap();
        bay.stop_session();

        let stats = bay.stats();
        assert_eq!(stats.routes, 0);
        assert_eq!(stats.input_taps, 0);
        assert_eq!(stats.output_units, 0);
        assert!(bay.session().is_none());
        assert!(!host.input_stream_open(&uid("IN1")));
        assert!(!host.output_stream_open(&uid("OUT1")));
    }

    #[test]
    fn test_disconnect_disables_routes_and_drops_tap() {
        let (host, bay) = rig();
        start(&bay);
        bay.add_route(Route::stereo("R1", uid("IN1"), uid("OUT1")))
            .unwrap();

        host.remove_device(&uid("IN1"));
        bay.handle_device_event(&DeviceEvent::Disconnected {
            uid: uid("IN1"),
            name: "Mic 1".to_string(),
        });

        let routes = bay.routes();
        assert_eq!(routes.len(), 1);
        assert!(routes[0].disabled_by_device);
        assert!(!host.input_stream_open(&uid("IN1")));
        assert_eq!(bay.stats().input_taps, 0);
    }

    #[test]
    fn test_readd_after_reconnect_reenables() {
        let (host, bay) = rig();
        start(&bay);
        let route = Route::stereo("R1", uid("IN1"), uid("OUT1"));
        bay.add_route(route.clone()).unwrap();

        host.remove_device(&uid("IN1"));
        bay.handle_device_event(&DeviceEvent::Disconnected {
            uid: uid("IN1"),
            name: "Mic 1".to_string(),
        });

        host.add_device(DeviceInfo {
            uid: uid("IN1"),
            name: "Mic 1".to_string(),
            input_channels: 2,
            output_channels: 0,
            sample_rates: vec![48_000],
        });
        bay.handle_device_event(&DeviceEvent::Connected {
            uid: uid("IN1"),
            name: "Mic 1".to_string(),
        });

        bay.add_route(route).unwrap();
        let routes = bay.routes();
        assert!(!routes[0].disabled_by_device);
        assert!(routes[0].route.enabled);
        assert!(host.input_stream_open(&uid("IN1")));
    }

    #[test]
    fn test_set_enabled_does_not_touch_hardware() {
        let (host, bay) = rig();
        start(&bay);
        bay.add_route(Route::stereo("R1", uid("IN1"), uid("OUT1")))
            .unwrap();

        bay.set_route_enabled(&"R1".into(), false).unwrap();
        assert!(host.input_stream_open(&uid("IN1")));
        assert!(host.output_stream_open(&uid("OUT1")));
        assert!(!bay.routes()[0].route.enabled);

        bay.set_route_enabled(&"R1".into(), true).unwrap();
        assert!(bay.routes()[0].route.enabled);
    }

    #[test]
    fn test_set_gain_updates_stored_route() {
        let (_host, bay) = rig();
        start(&bay);
        bay.add_route(Route::stereo("R1", uid("IN1"), uid("OUT1")))
            .unwrap();
        bay.set_route_gain(&"R1".into(), 0.25).unwrap();
        assert!((bay.routes()[0].route.gain - 0.25).abs() < f64::EPSILON);

        assert!(matches!(
            bay.set_route_gain(&"R1".into(), f64::NAN),
            Err(PatchBayError::InvalidArgs { .. })
        ));
    }

    #[test]
    fn test_unknown_route_is_reported() {
        let (_host, bay) = rig();
        start(&bay);
        assert!(matches!(
            bay.remove_route(&"missing".into()),
            Err(PatchBayError::RouteNotFound { .. })
        ));
    }

    #[test]
    fn test_observers_see_processed_events() {
        use std::sync::atomic::AtomicUsize;

        let (_host, bay) = rig();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        bay.on_device_event(move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        bay.handle_device_event(&DeviceEvent::Connected {
            uid: uid("IN1"),
            name: "Mic 1".to_string(),
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
