//! Device Registry and the disconnect protocol (SPEC_FULL.md §4.2, §4.8).
//!
//! An ordered, `Vec`-backed collection — the corpus' usual choice for a small set that is
//! scanned more often than it is searched by key (mirrors how `devices::bus` keeps its PCI
//! BDF table). Linear (bus, address) lookup is fine at the handful of devices this daemon
//! ever manages concurrently.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::info;

use crate::config::Config;
use crate::device::{Device, DeviceId, DeviceSink};

pub(crate) type DeviceHandle = Rc<RefCell<Device>>;

pub(crate) struct Registry {
    devices: Vec<DeviceHandle>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Registry { devices: Vec::new() }
    }

    pub(crate) fn lookup(&self, id: DeviceId) -> Option<DeviceHandle> {
        self.devices
            .iter()
            .find(|d| d.borrow().id == id)
            .cloned()
    }

    /// Inserts `device` at the tail unless a record for the same identity already exists
    /// (§4.2 "duplicate insertion is prevented by pre-lookup"). Returns `false` on duplicate.
    pub(crate) fn insert(&mut self, device: DeviceHandle) -> bool {
        let id = device.borrow().id;
        if self.lookup(id).is_some() {
            return false;
        }
        self.devices.push(device);
        true
    }

    pub(crate) fn remove(&mut self, id: DeviceId) -> Option<DeviceHandle> {
        let pos = self.devices.iter().position(|d| d.borrow().id == id)?;
        Some(self.devices.remove(pos))
    }

    pub(crate) fn mark_all_not_alive(&self) {
        for device in &self.devices {
            device.borrow_mut().mark_dead();
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &DeviceHandle> {
        self.devices.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.devices.len()
    }

    /// Sweeps the registry for records whose liveness has gone false, notifies the upper
    /// layer, and disconnects them (§4.2). Collects the dead set first since `disconnect`
    /// mutates `self.devices`.
    pub(crate) fn reap(&mut self, context: &rusb::Context, config: &Config) {
        let dead: Vec<DeviceHandle> = self
            .devices
            .iter()
            .filter(|d| !d.borrow().is_alive())
            .cloned()
            .collect();

        for device in dead {
            let id = device.borrow().id;
            let sink = device.borrow().sink_clone();
            sink.device_removed(id);
            self.disconnect(context, config, id);
        }
    }

    /// Disconnects every registered device, used by `shutdown()` (§6). Order matches §8's
    /// "after shutdown, the registry is empty and no transfer is in flight".
    pub(crate) fn disconnect_all(&mut self, context: &rusb::Context, config: &Config) {
        let all: Vec<DeviceId> = self.devices.iter().map(|d| d.borrow().id).collect();
        for id in all {
            self.disconnect(context, config, id);
        }
    }

    /// The disconnect routine (§4.8). Must never be called from within a transfer callback —
    /// callbacks only set liveness and defer to the next `reap`.
    fn disconnect(&mut self, context: &rusb::Context, config: &Config, id: DeviceId) {
        let Some(device) = self.remove(id) else {
            return;
        };

        device.borrow_mut().cancel_all_transfers();

        for _ in 0..config.disconnect_wait_iterations {
            if device.borrow().pending_transfer_count() == 0 {
                break;
            }
            let _ = context.handle_events_timeout(Some(config.disconnect_wait_slice));
        }

        {
            let mut device = device.borrow_mut();
            if device.pending_transfer_count() > 0 {
                device.force_cleanup();
            }
            device.release_interface();
        }

        info!(bus = id.bus, address = id.address, "device disconnected");
        // `device`'s last strong reference is dropped here, closing the underlying handle.
    }
}
