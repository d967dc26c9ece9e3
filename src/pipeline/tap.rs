//! Input tap: one hardware capture stream feeding one ring buffer.

use std::sync::Arc;

use crate::host::{AudioHost, DeviceUid, StreamHandle, StreamSpec};
use crate::pipeline::ChannelRing;
use crate::PatchBayError;

/// Owns one hardware input stream and the ring buffer it fills.
///
/// A tap is a pipe with no routing knowledge: on each hardware callback it
/// deinterleaves the captured frames into a pre-allocated scratch list and
/// writes them to the ring. It is created the first time any route
/// references its input device and destroyed when no route does, or when
/// the device disconnects.
pub(crate) struct InputTap {
    uid: DeviceUid,
    ring: Arc<ChannelRing>,
    stream: Option<Box<dyn StreamHandle>>,
}

impl InputTap {
    /// Opens the capture stream and starts writing into a fresh ring.
    pub(crate) fn start(
        host: &dyn AudioHost,
        uid: DeviceUid,
        channels: u16,
        spec: StreamSpec,
        ring_capacity: usize,
        preroll: usize,
    ) -> Result<Self, PatchBayError> {
        let ring = Arc::new(ChannelRing::new(channels as usize, ring_capacity, preroll));

        let cb_ring = Arc::clone(&ring);
        let channel_count = channels as usize;
        let mut scratch: Vec<Vec<f32>> = (0..channel_count)
            .map(|_| vec![0.0; spec.buffer_frames as usize])
            .collect();

        let callback = move |data: &[f32], frames: usize| {
            // Grow once to a new high-water mark; the steady-state path
            // never allocates.
            if frames > scratch[0].len() {
                for channel in &mut scratch {
                    channel.resize(frames, 0.0);
                }
            }
            for (ch, channel) in scratch.iter_mut().enumerate() {
                for (frame, slot) in channel.iter_mut().take(frames).enumerate() {
                    *slot = data[frame * channel_count + ch];
                }
            }
            cb_ring.write(&scratch, frames);
        };

        let stream = host
            .open_input_stream(&uid, spec, Box::new(callback))
            .inspect_err(|e| tracing::warn!("input tap on {uid} failed to start: {e}"))?;

        tracing::info!(%uid, channels, "input tap started");
        Ok(Self {
            uid,
            ring,
            stream: Some(stream),
        })
    }

    /// The ring this tap writes into.
    pub(crate) fn ring(&self) -> &Arc<ChannelRing> {
        &self.ring
    }

    /// Device this tap captures from.
    pub(crate) fn uid(&self) -> &DeviceUid {
        &self.uid
    }

    /// Stops and disposes the hardware stream. After this returns no
    /// further write to the ring can happen.
    pub(crate) fn stop(&mut self) {
        if self.stream.take().is_some() {
            tracing::info!(uid = %self.uid, "input tap stopped");
        }
    }
}

impl Drop for InputTap {
    fn drop(&mut self) {
        self.stop();
    }
}
