//! # patchbay
//!
//! **Note:** This crate is under active development. The API may change before 1.0.
//!
//! In-process audio patch-bay: continuously copies samples from physical
//! input devices to physical output devices, with per-route channel
//! remapping and linear gain, while tolerating device hot-plug.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use patchbay::{CpalHost, EngineConfig, PatchBay, Route, SessionOptions};
//! use std::sync::Arc;
//!
//! let bay = PatchBay::new(Arc::new(CpalHost::new()), EngineConfig::default());
//! bay.attach_watcher();
//!
//! let out = bay.default_devices()?.output.expect("no output device");
//! let session = bay.start_session(&SessionOptions::new(out.clone()))?;
//!
//! let mic = bay.default_devices()?.input.expect("no input device");
//! bay.add_route(Route::stereo("mic-to-speakers", mic, out))?;
//!
//! // Audio flows on the hardware callbacks until stop.
//! std::thread::sleep(std::time::Duration::from_secs(10));
//! println!("{:?}", bay.stats());
//! bay.stop_session();
//! ```
//!
//! ## Architecture
//!
//! The crate maintains a strict thread boundary:
//!
//! - **Input callbacks**: each active input device writes its frames into a
//!   multi-reader ring buffer and touches nothing else
//! - **Output callbacks**: each active output device mixes from every ring
//!   buffer that feeds it, under bounded locks only
//! - **Control thread**: session and route operations mutate the engine
//!   tables and swap an immutable render plan consulted by output callbacks
//! - **Watcher thread**: polls the host device list and reports hot-plug
//!   events, which are marshalled back onto the control domain
//!
//! This design ensures neither hardware callback ever blocks on I/O, an
//! unbounded lock, or an allocation.

#![warn(missing_docs)]
// Audio code requires intentional numeric casts between sample and cursor types
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]
// unwrap/expect allowed in tests only
#![allow(clippy::unwrap_used)]
// These doc lints are too strict for internal implementation details
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

mod config;
mod engine;
mod error;
mod event;
pub mod host;
mod pipeline;
mod route;
mod watcher;

pub use config::{EngineConfig, SessionOptions};
pub use engine::{EngineStats, PatchBay, SessionInfo};
pub use error::PatchBayError;
pub use event::{event_callback, DeviceEvent, EventCallback};
pub use host::{AudioHost, CpalHost, DefaultDevices, DeviceInfo, DeviceUid, MockHost, StreamSpec};
pub use pipeline::{ChannelRing, ReadWindow};
pub use route::{Route, RouteId, RouteState, RouteView};
pub use watcher::DeviceWatcher;
