//! CPAL-backed production host.

use std::collections::BTreeSet;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig as CpalStreamConfig};
use crossbeam_channel::Sender;

use super::{
    AudioHost, DefaultDevices, DeviceInfo, DeviceUid, InputCallback, OutputCallback, StreamHandle,
    StreamSpec,
};
use crate::PatchBayError;

/// Sample rates probed against each device's supported ranges.
const PROBE_SAMPLE_RATES: [u32; 7] = [16_000, 22_050, 32_000, 44_100, 48_000, 88_200, 96_000];

/// Production [`AudioHost`] on top of CPAL.
///
/// Device UIDs are the CPAL device names, which are the most stable
/// identifier CPAL exposes across platforms. Streams are owned by
/// dedicated threads so that handles can be held in the engine tables and
/// torn down synchronously from any control thread.
#[derive(Debug, Default)]
pub struct CpalHost;

impl CpalHost {
    /// Creates a new CPAL host.
    pub fn new() -> Self {
        Self
    }
}

fn device_uid(device: &cpal::Device) -> Option<DeviceUid> {
    device.name().ok().map(DeviceUid::new)
}

fn find_cpal_device(uid: &DeviceUid) -> Result<cpal::Device, String> {
    let host = cpal::default_host();
    let devices = host.devices().map_err(|e| e.to_string())?;
    for device in devices {
        if device_uid(&device).as_ref() == Some(uid) {
            return Ok(device);
        }
    }
    Err(format!("device not found: {uid}"))
}

fn describe(device: &cpal::Device) -> Option<DeviceInfo> {
    let uid = device_uid(device)?;

    let input_channels = device
        .default_input_config()
        .map(|c| c.channels())
        .unwrap_or(0);
    let output_channels = device
        .default_output_config()
        .map(|c| c.channels())
        .unwrap_or(0);

    let mut rates = BTreeSet::new();
    if let Ok(ranges) = device.supported_input_configs() {
        for range in ranges {
            for rate in PROBE_SAMPLE_RATES {
                if rate >= range.min_sample_rate().0 && rate <= range.max_sample_rate().0 {
                    rates.insert(rate);
                }
            }
        }
    }
    if let Ok(ranges) = device.supported_output_configs() {
        for range in ranges {
            for rate in PROBE_SAMPLE_RATES {
                if rate >= range.min_sample_rate().0 && rate <= range.max_sample_rate().0 {
                    rates.insert(rate);
                }
            }
        }
    }

    Some(DeviceInfo {
        name: uid.as_str().to_string(),
        uid,
        input_channels,
        output_channels,
        sample_rates: rates.into_iter().collect(),
    })
}

/// Keeps a CPAL stream alive on its owner thread.
///
/// CPAL streams are not `Send`, so each stream is built, played and
/// eventually dropped on one dedicated thread; the handle only signals
/// that thread. Dropping the handle joins the thread, which makes stream
/// teardown synchronous as the engine requires.
struct CpalStreamHandle {
    stop_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl StreamHandle for CpalStreamHandle {}

impl Drop for CpalStreamHandle {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn spawn_stream(
    uid: &DeviceUid,
    build: impl FnOnce(&cpal::Device) -> Result<cpal::Stream, String> + Send + 'static,
) -> Result<Box<dyn StreamHandle>, String> {
    let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<(), String>>(1);
    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);

    let thread_uid = uid.clone();
    let thread = std::thread::Builder::new()
        .name(format!("patchbay-stream-{thread_uid}"))
        .spawn(move || {
            let stream = match find_cpal_device(&thread_uid).and_then(|d| build(&d)) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(e.to_string()));
                return;
            }
            let _ = ready_tx.send(Ok(()));
            // Stream runs until the handle drops.
            let _ = stop_rx.recv();
            drop(stream);
        })
        .map_err(|e| e.to_string())?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(Box::new(CpalStreamHandle {
            stop_tx,
            thread: Some(thread),
        })),
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(e)
        }
        Err(_) => Err("stream owner thread exited before reporting".to_string()),
    }
}

fn stream_config(spec: StreamSpec) -> CpalStreamConfig {
    CpalStreamConfig {
        channels: spec.channels,
        sample_rate: SampleRate(spec.sample_rate),
        buffer_size: BufferSize::Fixed(spec.buffer_frames),
    }
}

impl AudioHost for CpalHost {
    fn devices(&self) -> Result<Vec<DeviceInfo>, PatchBayError> {
        let host = cpal::default_host();
        let devices = host.devices().map_err(PatchBayError::backend)?;
        Ok(devices.filter_map(|d| describe(&d)).collect())
    }

    fn default_devices(&self) -> Result<DefaultDevices, PatchBayError> {
        let host = cpal::default_host();
        Ok(DefaultDevices {
            input: host.default_input_device().and_then(|d| device_uid(&d)),
            output: host.default_output_device().and_then(|d| device_uid(&d)),
        })
    }

    fn set_nominal_sample_rate(&self, uid: &DeviceUid, rate: u32) -> Result<f64, PatchBayError> {
        // CPAL negotiates rates per stream, not per device; confirm the
        // device can run at the rate and report it back.
        let device = find_cpal_device(uid).map_err(|_| PatchBayError::DeviceNotFound {
            uid: uid.clone(),
        })?;
        let info = describe(&device).ok_or_else(|| PatchBayError::DeviceNotFound {
            uid: uid.clone(),
        })?;
        if !info.supports_sample_rate(rate) {
            return Err(PatchBayError::SampleRateSetFailed {
                uid: uid.clone(),
                reason: format!("device reports {:?}", info.sample_rates),
            });
        }
        Ok(f64::from(rate))
    }

    fn set_buffer_frames(&self, uid: &DeviceUid, frames: u32) -> Result<u32, PatchBayError> {
        // Applied per stream at open time; here we only confirm the device
        // still resolves.
        find_cpal_device(uid).map_err(|_| PatchBayError::DeviceNotFound { uid: uid.clone() })?;
        Ok(frames)
    }

    fn open_input_stream(
        &self,
        uid: &DeviceUid,
        spec: StreamSpec,
        callback: InputCallback,
    ) -> Result<Box<dyn StreamHandle>, PatchBayError> {
        let channels = spec.channels.max(1) as usize;
        spawn_stream(uid, move |device| {
            let mut callback = callback;
            let err_fn = |err| tracing::error!("input stream error: {err}");
            let data_fn = move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let frames = data.len() / channels;
                callback(data, frames);
            };
            device
                .build_input_stream(&stream_config(spec), data_fn, err_fn, None)
                .map_err(|e| e.to_string())
        })
        .map_err(|reason| PatchBayError::InputStartFailed {
            uid: uid.clone(),
            reason,
        })
    }

    fn open_output_stream(
        &self,
        uid: &DeviceUid,
        spec: StreamSpec,
        callback: OutputCallback,
    ) -> Result<Box<dyn StreamHandle>, PatchBayError> {
        let channels = spec.channels.max(1) as usize;
        spawn_stream(uid, move |device| {
            let mut callback = callback;
            let err_fn = |err| tracing::error!("output stream error: {err}");
            let data_fn = move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                callback(data, frames);
            };
            device
                .build_output_stream(&stream_config(spec), data_fn, err_fn, None)
                .map_err(|e| e.to_string())
        })
        .map_err(|reason| PatchBayError::OutputStartFailed {
            uid: uid.clone(),
            reason,
        })
    }
}
