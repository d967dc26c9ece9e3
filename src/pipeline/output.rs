//! Output unit: one hardware playback stream pulling mixed audio.

use std::sync::Weak;

use crate::host::{AudioHost, DeviceUid, StreamHandle, StreamSpec};
use crate::pipeline::ReadWindow;
use crate::PatchBayError;

/// Reusable per-callback buffers for one output's render path.
///
/// Owned by the render closure so the steady-state callback never
/// allocates; both buffers grow only at a new high-water frame count.
pub(crate) struct RenderScratch {
    /// Mono staging buffer one route channel is read into before the
    /// gain-multiply-add.
    pub(crate) mono: Vec<f32>,
    /// Read windows for the distinct inputs feeding this output, refilled
    /// each render.
    pub(crate) windows: Vec<ReadWindow>,
}

impl RenderScratch {
    pub(crate) fn new(frames: usize) -> Self {
        Self {
            mono: vec![0.0; frames],
            windows: Vec::new(),
        }
    }

    pub(crate) fn ensure_frames(&mut self, frames: usize) {
        if self.mono.len() < frames {
            self.mono.resize(frames, 0.0);
        }
    }
}

/// The engine-side render entry an output unit pulls from.
///
/// The unit holds a `Weak` back-reference so it never extends the engine's
/// life; once the engine is gone the callback plays silence.
pub(crate) trait RenderSink: Send + Sync {
    /// Fills `frames` frames of every planar channel buffer with the mix
    /// for `uid`. Channel buffers are zeroed first, so an output with no
    /// enabled routes produces silence.
    fn render(
        &self,
        uid: &DeviceUid,
        planar: &mut [Vec<f32>],
        frames: usize,
        scratch: &mut RenderScratch,
    );
}

/// Owns one hardware output stream.
///
/// On each hardware render callback the unit asks the engine for the mix,
/// then interleaves it into the hardware buffer. Lifecycle mirrors the
/// input tap, keyed on the output device UID.
pub(crate) struct OutputUnit {
    uid: DeviceUid,
    stream: Option<Box<dyn StreamHandle>>,
}

impl OutputUnit {
    /// Opens the playback stream and starts pulling from the engine.
    pub(crate) fn start(
        host: &dyn AudioHost,
        uid: DeviceUid,
        channels: u16,
        spec: StreamSpec,
        sink: Weak<dyn RenderSink>,
    ) -> Result<Self, PatchBayError> {
        let channel_count = channels as usize;
        let cb_uid = uid.clone();
        let mut planar: Vec<Vec<f32>> = (0..channel_count)
            .map(|_| vec![0.0; spec.buffer_frames as usize])
            .collect();
        let mut scratch = RenderScratch::new(spec.buffer_frames as usize);

        let callback = move |data: &mut [f32], frames: usize| {
            let Some(sink) = sink.upgrade() else {
                data.fill(0.0);
                return;
            };
            if frames > planar[0].len() {
                for channel in &mut planar {
                    channel.resize(frames, 0.0);
                }
            }
            scratch.ensure_frames(frames);

            sink.render(&cb_uid, &mut planar, frames, &mut scratch);

            for frame in 0..frames {
                for (ch, channel) in planar.iter().enumerate() {
                    data[frame * channel_count + ch] = channel[frame];
                }
            }
        };

        let stream = host
            .open_output_stream(&uid, spec, Box::new(callback))
            .inspect_err(|e| tracing::warn!("output unit on {uid} failed to start: {e}"))?;

        tracing::info!(%uid, channels, "output unit started");
        Ok(Self {
            uid,
            stream: Some(stream),
        })
    }

    /// Device this unit plays to.
    pub(crate) fn uid(&self) -> &DeviceUid {
        &self.uid
    }

    /// Stops and disposes the hardware stream. After this returns no
    /// further render callback for this unit will run.
    pub(crate) fn stop(&mut self) {
        if self.stream.take().is_some() {
            tracing::info!(uid = %self.uid, "output unit stopped");
        }
    }
}

impl Drop for OutputUnit {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{DeviceInfo, MockHost};
    use std::sync::Arc;

    /// Sink that writes `channel_index + 1` into every sample.
    struct PatternSink;

    impl RenderSink for PatternSink {
        fn render(
            &self,
            _uid: &DeviceUid,
            planar: &mut [Vec<f32>],
            frames: usize,
            _scratch: &mut RenderScratch,
        ) {
            for (ch, channel) in planar.iter_mut().enumerate() {
                for slot in channel.iter_mut().take(frames) {
                    *slot = (ch + 1) as f32;
                }
            }
        }
    }

    fn spec() -> StreamSpec {
        StreamSpec {
            sample_rate: 48_000,
            channels: 2,
            buffer_frames: 4,
        }
    }

    fn mock_with_output() -> (MockHost, DeviceUid) {
        let host = MockHost::new();
        let uid = DeviceUid::new("OUT1");
        host.add_device(DeviceInfo {
            uid: uid.clone(),
            name: "Mock Speakers".to_string(),
            input_channels: 0,
            output_channels: 2,
            sample_rates: vec![48_000],
        });
        (host, uid)
    }

    #[test]
    fn test_unit_interleaves_rendered_channels() {
        let (host, uid) = mock_with_output();
        let sink: Arc<dyn RenderSink> = Arc::new(PatternSink);
        let _unit =
            OutputUnit::start(&host, uid.clone(), 2, spec(), Arc::downgrade(&sink)).unwrap();

        let data = host.pull_output(&uid, 3);
        assert_eq!(data, vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
    }

    #[test]
    fn test_unit_plays_silence_after_sink_dropped() {
        let (host, uid) = mock_with_output();
        let sink: Arc<dyn RenderSink> = Arc::new(PatternSink);
        let weak = Arc::downgrade(&sink);
        let _unit = OutputUnit::start(&host, uid.clone(), 2, spec(), weak).unwrap();

        drop(sink);
        let data = host.pull_output(&uid, 2);
        assert_eq!(data, vec![0.0; 4]);
    }

    #[test]
    fn test_stop_severs_the_stream() {
        let (host, uid) = mock_with_output();
        let sink: Arc<dyn RenderSink> = Arc::new(PatternSink);
        let mut unit =
            OutputUnit::start(&host, uid.clone(), 2, spec(), Arc::downgrade(&sink)).unwrap();

        unit.stop();
        assert!(!host.output_stream_open(&uid));
    }

    #[test]
    fn test_start_fails_on_unknown_device() {
        let host = MockHost::new();
        let sink: Arc<dyn RenderSink> = Arc::new(PatternSink);
        let result = OutputUnit::start(
            &host,
            DeviceUid::new("GHOST"),
            2,
            spec(),
            Arc::downgrade(&sink),
        );
        assert!(matches!(
            result,
            Err(PatchBayError::OutputStartFailed { .. })
        ));
    }
}
