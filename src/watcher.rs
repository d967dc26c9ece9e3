//! Device watcher: observes the host device list and reports hot-plug.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Sender;

use crate::event::DeviceEvent;
use crate::host::{AudioHost, DeviceUid};

/// How finely the poll interval is sliced so stop requests are noticed
/// promptly.
const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Polls the host device list on a dedicated thread and emits
/// [`DeviceEvent`]s over a channel.
///
/// The first poll establishes the baseline silently; every later poll
/// diffs `{uid -> name}` snapshots and sends one event per appeared or
/// vanished device. Delivery is at-least-once per actual change; the
/// engine treats events idempotently, so a spurious re-emission is
/// harmless. Events are sent on the watcher thread; receivers marshal them
/// onto the control domain before mutating engine state
/// ([`PatchBay::attach_watcher`](crate::PatchBay::attach_watcher) wires
/// this up).
pub struct DeviceWatcher {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceWatcher {
    /// Spawns the watcher thread, polling at `interval`.
    pub fn spawn(
        host: Arc<dyn AudioHost>,
        interval: Duration,
        events: Sender<DeviceEvent>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let thread = std::thread::Builder::new()
            .name("patchbay-watcher".to_string())
            .spawn(move || watch_loop(host.as_ref(), interval, &events, &thread_stop))
            .inspect_err(|e| tracing::error!("failed to spawn device watcher: {e}"))
            .ok();

        Self { stop, thread }
    }

    /// Stops the watcher thread and waits for it to exit. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for DeviceWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn snapshot(host: &dyn AudioHost) -> HashMap<DeviceUid, String> {
    match host.devices() {
        Ok(devices) => devices.into_iter().map(|d| (d.uid, d.name)).collect(),
        Err(e) => {
            tracing::warn!("device enumeration failed: {e}");
            HashMap::new()
        }
    }
}

fn watch_loop(
    host: &dyn AudioHost,
    interval: Duration,
    events: &Sender<DeviceEvent>,
    stop: &AtomicBool,
) {
    let mut known = snapshot(host);
    tracing::debug!(devices = known.len(), "device watcher started");

    'outer: loop {
        let mut waited = Duration::ZERO;
        while waited < interval {
            if stop.load(Ordering::SeqCst) {
                break 'outer;
            }
            let step = STOP_CHECK_INTERVAL.min(interval - waited);
            std::thread::sleep(step);
            waited += step;
        }

        let current = snapshot(host);

        for (uid, name) in &current {
            if !known.contains_key(uid) {
                tracing::info!(%uid, %name, "device appeared");
                if events
                    .send(DeviceEvent::Connected {
                        uid: uid.clone(),
                        name: name.clone(),
                    })
                    .is_err()
                {
                    break 'outer;
                }
            }
        }
        for (uid, name) in &known {
            if !current.contains_key(uid) {
                tracing::info!(%uid, %name, "device vanished");
                if events
                    .send(DeviceEvent::Disconnected {
                        uid: uid.clone(),
                        name: name.clone(),
                    })
                    .is_err()
                {
                    break 'outer;
                }
            }
        }

        known = current;
    }
    tracing::debug!("device watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{DeviceInfo, MockHost};

    fn device(uid: &str, name: &str) -> DeviceInfo {
        DeviceInfo {
            uid: DeviceUid::new(uid),
            name: name.to_string(),
            input_channels: 2,
            output_channels: 0,
            sample_rates: vec![48_000],
        }
    }

    fn recv_event(rx: &crossbeam_channel::Receiver<DeviceEvent>) -> DeviceEvent {
        rx.recv_timeout(Duration::from_secs(2))
            .expect("watcher should emit within two seconds")
    }

    #[test]
    fn test_baseline_is_silent() {
        let host = MockHost::new();
        host.add_device(device("IN1", "Mic 1"));

        let (tx, rx) = crossbeam_channel::unbounded();
        let mut watcher = DeviceWatcher::spawn(
            Arc::new(host),
            Duration::from_millis(10),
            tx,
        );

        // Pre-existing devices produce no events.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        watcher.stop();
    }

    #[test]
    fn test_connect_and_disconnect_are_reported() {
        let host = MockHost::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut watcher = DeviceWatcher::spawn(
            Arc::new(host.clone()),
            Duration::from_millis(10),
            tx,
        );

        host.add_device(device("IN1", "Mic 1"));
        let event = recv_event(&rx);
        assert_eq!(
            event,
            DeviceEvent::Connected {
                uid: DeviceUid::new("IN1"),
                name: "Mic 1".to_string(),
            }
        );

        host.remove_device(&DeviceUid::new("IN1"));
        let event = recv_event(&rx);
        assert_eq!(
            event,
            DeviceEvent::Disconnected {
                uid: DeviceUid::new("IN1"),
                name: "Mic 1".to_string(),
            }
        );

        watcher.stop();
    }

    #[test]
    fn test_stop_joins_the_thread() {
        let host = MockHost::new();
        let (tx, _rx) = crossbeam_channel::unbounded();
        let mut watcher = DeviceWatcher::spawn(
            Arc::new(host),
            Duration::from_secs(3600),
            tx,
        );

        // Returns promptly despite the long poll interval.
        watcher.stop();
        assert!(watcher.thread.is_none());
    }
}
