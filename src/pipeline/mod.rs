//! The sample pipeline: ring buffers, input taps and output units.

mod output;
mod ring_buffer;
mod tap;

pub use ring_buffer::{ChannelRing, ReadWindow};

pub(crate) use output::{OutputUnit, RenderScratch, RenderSink};
pub(crate) use tap::InputTap;
