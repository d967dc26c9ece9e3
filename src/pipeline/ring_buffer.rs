//! Multi-channel, single-writer/multi-reader ring buffer in frames.
//!
//! One `ChannelRing` sits between an input device's hardware callback (the
//! writer) and every output device that mixes from it (the readers). Each
//! reader advances an independent cursor, so outputs with different clock
//! phases consume the same timeline without coordinating.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::host::DeviceUid;

/// One reader's view of the frames it may consume right now.
///
/// Returned by [`ChannelRing::begin_read`]; `start` and `frames` stay valid
/// for [`ChannelRing::read_channel`] until the matching
/// [`ChannelRing::end_read`], even if the writer advances in between.
/// This is what keeps a route's left and right channels on the same
/// window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadWindow {
    /// Absolute frame cursor the window starts at.
    pub start: i64,
    /// Frames available in the window, at most the requested count.
    pub frames: usize,
    /// The window holds fewer frames than requested.
    pub underrun: bool,
    /// The writer lapped this reader; its cursor was jumped forward and
    /// the oldest frames were lost.
    pub overrun: bool,
}

impl ReadWindow {
    fn empty(start: i64) -> Self {
        Self {
            start,
            frames: 0,
            underrun: false,
            overrun: false,
        }
    }
}

struct Reader {
    cursor: i64,
    /// A new reader serves silence until the writer is a pre-roll ahead of
    /// its cursor; this replaces sleeping after tap creation.
    primed: bool,
}

struct RingState {
    /// Monotonic frame count of everything ever written.
    write: i64,
    readers: HashMap<DeviceUid, Reader>,
    /// One array of `capacity` samples per channel.
    channels: Vec<Box<[f32]>>,
}

/// Fixed-capacity circular buffer of non-interleaved f32 frames with one
/// writer and independently cursored readers.
///
/// Cursors are monotonically increasing 64-bit frame counts; the storage
/// index is `cursor mod capacity`. A single short mutex guards cursors and
/// the channel arrays. Every critical section is bounded and
/// allocation-free, so the lock is safe to take from hardware callbacks.
pub struct ChannelRing {
    channel_count: usize,
    capacity: usize,
    preroll: usize,
    state: Mutex<RingState>,
}

impl ChannelRing {
    /// Creates a ring of `capacity` frames across `channels` channels.
    ///
    /// `preroll` is how far behind the writer a newly registered reader is
    /// positioned (clamped to the capacity): large enough that the first
    /// render does not immediately underrun, small enough that latency
    /// stays unobtrusive.
    pub fn new(channels: usize, capacity: usize, preroll: usize) -> Self {
        assert!(channels > 0, "ring needs at least one channel");
        assert!(capacity > 0, "ring needs a nonzero capacity");
        Self {
            channel_count: channels,
            capacity,
            preroll: preroll.min(capacity),
            state: Mutex::new(RingState {
                write: 0,
                readers: HashMap::new(),
                channels: (0..channels)
                    .map(|_| vec![0.0; capacity].into_boxed_slice())
                    .collect(),
            }),
        }
    }

    /// Number of channels.
    pub fn channels(&self) -> usize {
        self.channel_count
    }

    /// Capacity in frames.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Registers a reader, positioning its cursor a pre-roll behind the
    /// writer (`max(0, write - preroll)`). Idempotent: re-registering an
    /// existing reader does not move its cursor.
    pub fn register_reader(&self, id: &DeviceUid) {
        let mut state = self.state.lock();
        let start = (state.write - self.preroll as i64).max(0);
        let primed = state.write - start >= self.preroll as i64;
        state.readers.entry(id.clone()).or_insert(Reader {
            cursor: start,
            primed,
        });
    }

    /// Drops every reader not named in `keep`.
    pub fn prune_readers(&self, keep: &[DeviceUid]) {
        let mut state = self.state.lock();
        state.readers.retain(|id, _| keep.contains(id));
    }

    /// Whether the reader is currently registered.
    pub fn has_reader(&self, id: &DeviceUid) -> bool {
        self.state.lock().readers.contains_key(id)
    }

    /// Writes `frames` frames of non-interleaved samples, one buffer per
    /// channel, each at least `frames` long.
    ///
    /// If `frames` exceeds the capacity the oldest surplus is skipped and
    /// only the newest `capacity` frames land in storage, but the write
    /// cursor still advances by the full `frames`, so readers observe the
    /// same timeline the hardware produced.
    pub fn write<B: AsRef<[f32]>>(&self, channel_bufs: &[B], frames: usize) {
        debug_assert_eq!(channel_bufs.len(), self.channel_count);
        if frames == 0 {
            return;
        }

        let mut state = self.state.lock();
        let skip = frames.saturating_sub(self.capacity);
        let keep = frames - skip;
        let start = state.write + skip as i64;
        let begin = (start as u64 % self.capacity as u64) as usize;
        let first = (self.capacity - begin).min(keep);

        for (channel, buf) in state.channels.iter_mut().zip(channel_bufs) {
            let src = &buf.as_ref()[skip..skip + keep];
            channel[begin..begin + first].copy_from_slice(&src[..first]);
            if keep > first {
                channel[..keep - first].copy_from_slice(&src[first..]);
            }
        }

        state.write += frames as i64;
    }

    /// Opens a read window of up to `frames` frames for the reader.
    ///
    /// If the writer lapped the reader, the cursor is jumped to
    /// `write - capacity` (dropping the oldest frames) and `overrun` is
    /// set. Fewer available frames than requested is an `underrun`. An
    /// unregistered or still-priming reader gets an empty window.
    pub fn begin_read(&self, id: &DeviceUid, frames: usize) -> ReadWindow {
        let mut state = self.state.lock();
        let write = state.write;
        let capacity = self.capacity as i64;
        let preroll = self.preroll as i64;

        let Some(reader) = state.readers.get_mut(id) else {
            return ReadWindow::empty(0);
        };

        let mut overrun = false;
        if write - reader.cursor > capacity {
            reader.cursor = write - capacity;
            reader.primed = true;
            overrun = true;
        }

        if !reader.primed {
            if write - reader.cursor >= preroll {
                reader.primed = true;
            } else {
                // Still filling up to the pre-roll point: silence, not an
                // underrun.
                return ReadWindow::empty(reader.cursor);
            }
        }

        let available = ((write - reader.cursor).max(0) as usize).min(frames);
        ReadWindow {
            start: reader.cursor,
            frames: available,
            underrun: available < frames,
            overrun,
        }
    }

    /// Copies `frames` samples of one channel, starting at absolute cursor
    /// `start`, into `dest`.
    ///
    /// Call once per channel with the same `(start, frames)` taken from a
    /// [`ReadWindow`] to keep channels sample-aligned.
    pub fn read_channel(&self, start: i64, frames: usize, channel: usize, dest: &mut [f32]) {
        debug_assert!(channel < self.channel_count);
        debug_assert!(frames <= dest.len());
        if frames == 0 {
            return;
        }

        let state = self.state.lock();
        let begin = (start as u64 % self.capacity as u64) as usize;
        let first = (self.capacity - begin).min(frames);
        let src = &state.channels[channel];
        dest[..first].copy_from_slice(&src[begin..begin + first]);
        if frames > first {
            dest[first..frames].copy_from_slice(&src[..frames - first]);
        }
    }

    /// Advances the reader's cursor by the frames actually consumed, which
    /// must not exceed the window it was given.
    pub fn end_read(&self, id: &DeviceUid, frames: usize) {
        let mut state = self.state.lock();
        if let Some(reader) = state.readers.get_mut(id) {
            reader.cursor += frames as i64;
        }
    }

    /// How full the ring is from this reader's point of view, in `[0, 1]`.
    pub fn fill_ratio(&self, id: &DeviceUid) -> f64 {
        let state = self.state.lock();
        match state.readers.get(id) {
            Some(reader) => {
                let backlog = (state.write - reader.cursor).clamp(0, self.capacity as i64);
                backlog as f64 / self.capacity as f64
            }
            None => 0.0,
        }
    }
}
