//! Mock audio host for testing without hardware.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    AudioHost, DefaultDevices, DeviceInfo, DeviceUid, InputCallback, OutputCallback, StreamHandle,
    StreamSpec,
};
use crate::PatchBayError;

/// A scriptable in-memory [`AudioHost`].
///
/// The device table is mutable at runtime (for hot-plug tests) and stream
/// callbacks are driven manually, so the whole pipeline can be exercised
/// deterministically in CI without audio hardware:
///
/// - [`push_input`](MockHost::push_input) plays the role of an input
///   device's hardware callback
/// - [`pull_output`](MockHost::pull_output) plays the role of an output
///   device's render callback
///
/// Cloning a `MockHost` yields another handle onto the same host, which is
/// how a test keeps driving streams after handing the host to the engine.
#[derive(Clone, Default)]
pub struct MockHost {
    inner: Arc<MockInner>,
}

#[derive(Default)]
struct MockInner {
    devices: Mutex<Vec<DeviceInfo>>,
    inputs: Mutex<HashMap<DeviceUid, MockStream<InputCallback>>>,
    outputs: Mutex<HashMap<DeviceUid, MockStream<OutputCallback>>>,
    next_stream_id: AtomicU64,
    fail_input_streams: AtomicBool,
    fail_output_streams: AtomicBool,
    fail_buffer_frames: AtomicBool,
}

struct MockStream<C> {
    id: u64,
    channels: usize,
    callback: Arc<Mutex<C>>,
}

impl MockHost {
    /// Creates an empty mock host.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a device in the device list.
    pub fn add_device(&self, info: DeviceInfo) {
        let mut devices = self.inner.devices.lock();
        devices.retain(|d| d.uid != info.uid);
        devices.push(info);
    }

    /// Removes a device from the device list, simulating a disconnect.
    ///
    /// Streams already open on the device keep their callbacks until the
    /// engine tears them down, the way a dying hardware stream lingers
    /// until disposed.
    pub fn remove_device(&self, uid: &DeviceUid) {
        self.inner.devices.lock().retain(|d| &d.uid != uid);
    }

    /// Makes every subsequent `open_input_stream` fail.
    pub fn fail_input_streams(&self, fail: bool) {
        self.inner.fail_input_streams.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent `open_output_stream` fail.
    pub fn fail_output_streams(&self, fail: bool) {
        self.inner.fail_output_streams.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent `set_buffer_frames` fail, simulating
    /// hardware that rejects the requested buffer size.
    pub fn fail_buffer_frames(&self, fail: bool) {
        self.inner.fail_buffer_frames.store(fail, Ordering::SeqCst);
    }

    /// Whether a capture stream is currently open on the device.
    pub fn input_stream_open(&self, uid: &DeviceUid) -> bool {
        self.inner.inputs.lock().contains_key(uid)
    }

    /// Whether a playback stream is currently open on the device.
    pub fn output_stream_open(&self, uid: &DeviceUid) -> bool {
        self.inner.outputs.lock().contains_key(uid)
    }

    /// Drives the device's capture callback with interleaved samples, as
    /// its hardware thread would. Frame count is derived from the stream's
    /// channel count. No-op if no stream is open.
    pub fn push_input(&self, uid: &DeviceUid, interleaved: &[f32]) {
        let stream = {
            let inputs = self.inner.inputs.lock();
            inputs
                .get(uid)
                .map(|s| (Arc::clone(&s.callback), s.channels))
        };
        if let Some((callback, channels)) = stream {
            let frames = interleaved.len() / channels.max(1);
            let mut callback = callback.lock();
            (*callback)(interleaved, frames);
        }
    }

    /// Drives the device's render callback for `frames` frames, as its
    /// hardware thread would, and returns the interleaved result. Returns
    /// an empty buffer if no stream is open.
    pub fn pull_output(&self, uid: &DeviceUid, frames: usize) -> Vec<f32> {
        let stream = {
            let outputs = self.inner.outputs.lock();
            outputs
                .get(uid)
                .map(|s| (Arc::clone(&s.callback), s.channels))
        };
        match stream {
            Some((callback, channels)) => {
                let mut buffer = vec![0.0; frames * channels];
                let mut callback = callback.lock();
                (*callback)(&mut buffer, frames);
                buffer
            }
            None => Vec::new(),
        }
    }

    fn has_device(&self, uid: &DeviceUid) -> bool {
        self.inner.devices.lock().iter().any(|d| &d.uid == uid)
    }

    fn next_id(&self) -> u64 {
        self.inner.next_stream_id.fetch_add(1, Ordering::SeqCst)
    }
}

/// Removes its stream registration on drop, mirroring how a real stream
/// handle stops the hardware callback synchronously.
struct MockStreamHandle {
    inner: Arc<MockInner>,
    uid: DeviceUid,
    id: u64,
    input: bool,
}

impl StreamHandle for MockStreamHandle {}

impl Drop for MockStreamHandle {
    fn drop(&mut self) {
        if self.input {
            let mut inputs = self.inner.inputs.lock();
            if inputs.get(&self.uid).is_some_and(|s| s.id == self.id) {
                inputs.remove(&self.uid);
            }
        } else {
            let mut outputs = self.inner.outputs.lock();
            if outputs.get(&self.uid).is_some_and(|s| s.id == self.id) {
                outputs.remove(&self.uid);
            }
        }
    }
}

impl AudioHost for MockHost {
    fn devices(&self) -> Result<Vec<DeviceInfo>, PatchBayError> {
        Ok(self.inner.devices.lock().clone())
    }

    fn default_devices(&self) -> Result<DefaultDevices, PatchBayError> {
        let devices = self.inner.devices.lock();
        Ok(DefaultDevices {
            input: devices
                .iter()
                .find(|d| d.input_channels > 0)
                .map(|d| d.uid.clone()),
            output: devices
                .iter()
                .find(|d| d.output_channels > 0)
                .map(|d| d.uid.clone()),
        })
    }

    fn set_nominal_sample_rate(&self, uid: &DeviceUid, rate: u32) -> Result<f64, PatchBayError> {
        let devices = self.inner.devices.lock();
        let device = devices
            .iter()
            .find(|d| &d.uid == uid)
            .ok_or_else(|| PatchBayError::DeviceNotFound { uid: uid.clone() })?;
        if !device.supports_sample_rate(rate) {
            return Err(PatchBayError::SampleRateSetFailed {
                uid: uid.clone(),
                reason: format!("device reports {:?}", device.sample_rates),
            });
        }
        Ok(f64::from(rate))
    }

    fn set_buffer_frames(&self, uid: &DeviceUid, frames: u32) -> Result<u32, PatchBayError> {
        if !self.has_device(uid) {
            return Err(PatchBayError::DeviceNotFound { uid: uid.clone() });
        }
        if self.inner.fail_buffer_frames.load(Ordering::SeqCst) {
            return Err(PatchBayError::BufferSetFailed {
                uid: uid.clone(),
                reason: "mock buffer negotiation refused".to_string(),
            });
        }
        Ok(frames)
    }

    fn open_input_stream(
        &self,
        uid: &DeviceUid,
        spec: StreamSpec,
        callback: InputCallback,
    ) -> Result<Box<dyn StreamHandle>, PatchBayError> {
        if self.inner.fail_input_streams.load(Ordering::SeqCst) || !self.has_device(uid) {
            return Err(PatchBayError::InputStartFailed {
                uid: uid.clone(),
                reason: "mock input stream refused".to_string(),
            });
        }
        let id = self.next_id();
        self.inner.inputs.lock().insert(
            uid.clone(),
            MockStream {
                id,
                channels: spec.channels as usize,
                callback: Arc::new(Mutex::new(callback)),
            },
        );
        Ok(Box::new(MockStreamHandle {
            inner: Arc::clone(&self.inner),
            uid: uid.clone(),
            id,
            input: true,
        }))
    }

    fn open_output_stream(
        &self,
        uid: &DeviceUid,
        spec: StreamSpec,
        callback: OutputCallback,
    ) -> Result<Box<dyn StreamHandle>, PatchBayError> {
        if self.inner.fail_output_streams.load(Ordering::SeqCst) || !self.has_device(uid) {
            return Err(PatchBayError::OutputStartFailed {
                uid: uid.clone(),
                reason: "mock output stream refused".to_string(),
            });
        }
        let id = self.next_id();
        self.inner.outputs.lock().insert(
            uid.clone(),
            MockStream {
                id,
                channels: spec.channels as usize,
                callback: Arc::new(Mutex::new(callback)),
            },
        );
        Ok(Box::new(MockStreamHandle {
            inner: Arc::clone(&self.inner),
            uid: uid.clone(),
            id,
            input: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_input(uid: &str) -> DeviceInfo {
        DeviceInfo {
            uid: DeviceUid::new(uid),
            name: format!("Mock {uid}"),
            input_channels: 2,
            output_channels: 0,
            sample_rates: vec![44_100, 48_000],
        }
    }

    fn stereo_output(uid: &str) -> DeviceInfo {
        DeviceInfo {
            uid: DeviceUid::new(uid),
            name: format!("Mock {uid}"),
            input_channels: 0,
            output_channels: 2,
            sample_rates: vec![48_000],
        }
    }

    fn spec() -> StreamSpec {
        StreamSpec {
            sample_rate: 48_000,
            channels: 2,
            buffer_frames: 256,
        }
    }

    #[test]
    fn test_device_table_mutation() {
        let host = MockHost::new();
        host.add_device(stereo_input("IN1"));
        host.add_device(stereo_output("OUT1"));
        assert_eq!(host.devices().unwrap().len(), 2);

        host.remove_device(&DeviceUid::new("IN1"));
        assert_eq!(host.devices().unwrap().len(), 1);
    }

    #[test]
    fn test_default_devices_pick_by_direction() {
        let host = MockHost::new();
        host.add_device(stereo_output("OUT1"));
        host.add_device(stereo_input("IN1"));

        let defaults = host.default_devices().unwrap();
        assert_eq!(defaults.input, Some(DeviceUid::new("IN1")));
        assert_eq!(defaults.output, Some(DeviceUid::new("OUT1")));
    }

    #[test]
    fn test_sample_rate_negotiation() {
        let host = MockHost::new();
        host.add_device(stereo_input("IN1"));
        let uid = DeviceUid::new("IN1");

        assert_eq!(host.set_nominal_sample_rate(&uid, 48_000).unwrap(), 48_000.0);
        assert!(matches!(
            host.set_nominal_sample_rate(&uid, 96_000),
            Err(PatchBayError::SampleRateSetFailed { .. })
        ));
    }

    #[test]
    fn test_input_stream_round_trip() {
        let host = MockHost::new();
        host.add_device(stereo_input("IN1"));
        let uid = DeviceUid::new("IN1");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handle = host
            .open_input_stream(
                &uid,
                spec(),
                Box::new(move |data, frames| {
                    sink.lock().push((data.to_vec(), frames));
                }),
            )
            .unwrap();

        host.push_input(&uid, &[0.1, 0.2, 0.3, 0.4]);
        {
            let seen = seen.lock();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].1, 2); // 4 interleaved samples, 2 channels
        }

        drop(handle);
        assert!(!host.input_stream_open(&uid));
        host.push_input(&uid, &[0.5, 0.6]);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_output_stream_pull() {
        let host = MockHost::new();
        host.add_device(stereo_output("OUT1"));
        let uid = DeviceUid::new("OUT1");

        let _handle = host
            .open_output_stream(
                &uid,
                spec(),
                Box::new(|data, _frames| {
                    for slot in data.iter_mut() {
                        *slot = 0.25;
                    }
                }),
            )
            .unwrap();

        let buffer = host.pull_output(&uid, 4);
        assert_eq!(buffer, vec![0.25; 8]);
    }

    #[test]
    fn test_stream_open_refused_for_unknown_device() {
        let host = MockHost::new();
        let uid = DeviceUid::new("GHOST");
        assert!(host
            .open_input_stream(&uid, spec(), Box::new(|_, _| {}))
            .is_err());
        assert!(host
            .open_output_stream(&uid, spec(), Box::new(|_, _| {}))
            .is_err());
    }

    #[test]
    fn test_failure_injection() {
        let host = MockHost::new();
        host.add_device(stereo_input("IN1"));
        host.fail_input_streams(true);
        let uid = DeviceUid::new("IN1");
        assert!(matches!(
            host.open_input_stream(&uid, spec(), Box::new(|_, _| {})),
            Err(PatchBayError::InputStartFailed { .. })
        ));

        host.fail_input_streams(false);
        assert!(host
            .open_input_stream(&uid, spec(), Box::new(|_, _| {}))
            .is_ok());
    }

    #[test]
    fn test_buffer_negotiation_failure_injection() {
        let host = MockHost::new();
        host.add_device(stereo_output("OUT1"));
        let uid = DeviceUid::new("OUT1");

        assert_eq!(host.set_buffer_frames(&uid, 256).unwrap(), 256);

        host.fail_buffer_frames(true);
        assert!(matches!(
            host.set_buffer_frames(&uid, 256),
            Err(PatchBayError::BufferSetFailed { .. })
        ));

        host.fail_buffer_frames(false);
        assert_eq!(host.set_buffer_frames(&uid, 256).unwrap(), 256);
    }

    #[test]
    fn test_reopening_stream_replaces_registration() {
        let host = MockHost::new();
        host.add_device(stereo_output("OUT1"));
        let uid = DeviceUid::new("OUT1");

        let old = host
            .open_output_stream(&uid, spec(), Box::new(|_, _| {}))
            .unwrap();
        let _new = host
            .open_output_stream(
                &uid,
                spec(),
                Box::new(|data, _| data.fill(1.0)),
            )
            .unwrap();

        // Dropping the stale handle must not sever the fresh stream.
        drop(old);
        assert!(host.output_stream_open(&uid));
        assert_eq!(host.pull_output(&uid, 1), vec![1.0, 1.0]);
    }
}
