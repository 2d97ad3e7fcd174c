//! `usbmux-core`: USB device-management core for a daemon that multiplexes logical connections
//! to Apple mobile devices attached over USB (SPEC_FULL.md §1).
//!
//! This crate owns discovery, mode negotiation, configuration selection, asynchronous
//! initialization, and the bidirectional bulk-transfer pipeline for each attached device. It
//! does not know anything about the multiplexing wire protocol above the bulk stream, the
//! client/UNIX-socket server, or pair-record storage — those live in the embedding daemon,
//! which talks to this crate only through [`DeviceSink`] and [`UsbCore`]'s own methods.
//!
//! The whole surface is single-threaded and cooperative (§5): every method here is meant to be
//! called from the one thread that also calls [`UsbCore::process`] / [`UsbCore::process_for`].

mod config;
mod config_select;
mod device;
mod discovery;
mod error;
mod ids;
mod init_pipeline;
mod mode;
mod pump;
mod registry;
mod serial;
mod speed;
mod transfer;

use std::cell::RefCell;
use std::os::raw::c_int;
use std::rc::Rc;

use tracing::warn;

pub use config::Config;
pub use device::{DeviceId, DeviceSink};
pub use error::Error;

use discovery::{Discovery, SharedState};
use pump::Pump;
use registry::Registry;

/// The public surface this crate exposes to its embedder (SPEC_FULL.md §6).
pub struct UsbCore {
    context: Option<rusb::Context>,
    shared: Rc<RefCell<SharedState>>,
    discovery: Discovery,
    pump: Option<Pump>,
}

impl UsbCore {
    /// Builds an uninitialized core around `sink`. `Config::from_env()` is read here, once, so
    /// `ENV_DEVICE_MODE` is captured at construction time rather than re-read on every device
    /// arrival (§10.4).
    pub fn new(sink: Rc<dyn DeviceSink>) -> Self {
        UsbCore {
            context: None,
            shared: Rc::new(RefCell::new(SharedState {
                registry: Registry::new(),
                config: Config::from_env(),
                sink,
                autodiscover: true,
            })),
            discovery: Discovery::new(),
            pump: None,
        }
    }

    /// Initializes the underlying library, registers the hotplug callback if the host build
    /// supports it, and otherwise runs the polling path's initial enumeration (§4.6, §6
    /// `init()`).
    pub fn init(&mut self) -> Result<(), Error> {
        let context = rusb::Context::new().map_err(Error::ContextInit)?;

        self.discovery.register_hotplug(&context, &self.shared)?;

        let poll_interval = self.shared.borrow().config.poll_interval;
        self.pump = Some(Pump::new(poll_interval));

        if !self.discovery.hotplug_active() {
            let mut shared = self.shared.borrow_mut();
            self.discovery.poll_once(&context, &mut shared)?;
        }

        self.context = Some(context);
        Ok(())
    }

    /// Deregisters hotplug, disconnects every registered device, and drops the library context
    /// (§6 `shutdown()`). After this returns, the registry is empty and no transfer is in
    /// flight (§8).
    pub fn shutdown(&mut self) -> Result<(), Error> {
        let Some(context) = self.context.take() else {
            return Ok(());
        };

        self.discovery.unregister_hotplug(&context);

        {
            let mut shared = self.shared.borrow_mut();
            let config = shared.config;
            shared.registry.disconnect_all(&context, &config);
        }

        self.pump = None;
        Ok(())
    }

    /// Forces an enumeration pass regardless of the `autodiscover` gate or the poll deadline
    /// (§6 `discover()`), and reschedules the next automatic poll from now.
    pub fn discover(&mut self) -> Result<(), Error> {
        let context = self.context().ok_or(Error::NotInitialized)?;
        let outcome = {
            let mut shared = self.shared.borrow_mut();
            self.discovery.poll_once(&context, &mut shared)
        };
        if let Some(pump) = &mut self.pump {
            let poll_interval = self.shared.borrow().config.poll_interval;
            pump.reset_deadline(poll_interval);
        }
        outcome
    }

    /// Descriptors the owner must fold into its own `poll(2)`/`select(2)` set (§6 `get_fds`).
    /// Each pair is `(fd, events)`, `events` using the usual `POLLIN`/`POLLOUT` bitmask.
    pub fn get_fds(&self) -> Vec<(c_int, i16)> {
        match (&self.context, &self.pump) {
            (Some(context), Some(pump)) => pump.get_fds(context),
            _ => Vec::new(),
        }
    }

    /// Milliseconds the owner may safely block in its own poll call before calling
    /// [`process`](Self::process) again (§6 `get_timeout()`).
    pub fn get_timeout(&self) -> u64 {
        let Some(pump) = &self.pump else {
            return pump::NO_POLL_TIMEOUT_MS;
        };
        let polling_active = self.shared.borrow().autodiscover && !self.discovery.hotplug_active();
        pump.get_timeout_ms(polling_active)
    }

    /// Dispatches pending USB events, reaps dead devices, and runs a scheduled poll if one is
    /// due (§6 `process()`). Call after the owner's poll wakes with one of [`get_fds`]'s
    /// descriptors ready, or after [`get_timeout`] elapses.
    pub fn process(&mut self) -> Result<(), Error> {
        let context = self.context().ok_or(Error::NotInitialized)?;
        let Some(pump) = &mut self.pump else {
            return Ok(());
        };
        let mut shared = self.shared.borrow_mut();
        pump.process(&context, &mut self.discovery, &mut shared)
    }

    /// Blocks up to `ms` milliseconds dispatching events, reaping dead devices after each wake
    /// (§6 `process_for(ms)`).
    pub fn process_for(&mut self, ms: u64) -> Result<(), Error> {
        let context = self.context().ok_or(Error::NotInitialized)?;
        let Some(pump) = &mut self.pump else {
            return Ok(());
        };
        let mut shared = self.shared.borrow_mut();
        let config = shared.config;
        pump.process_for(ms, &context, &mut shared.registry, &config);
        Ok(())
    }

    /// Submits `data` to `device`'s bulk-out endpoint, appending a zero-length packet if the
    /// length is an exact multiple of the endpoint's max packet size (§6 `send()`, §4.1, §8).
    pub fn send(&self, device: DeviceId, data: &[u8]) -> Result<(), Error> {
        let shared = self.shared.borrow();
        let record = shared
            .registry
            .lookup(device)
            .ok_or(Error::NoSuchDevice { bus: device.bus, address: device.address })?;

        let mut record = record.borrow_mut();
        if !record.is_alive() {
            return Err(Error::DeviceNotAlive { bus: device.bus, address: device.address });
        }
        record.send(data)
    }

    /// Gates both the polling loop and hotplug-triggered device-add (§6 `autodiscover(enable)`).
    pub fn set_autodiscover(&self, enable: bool) {
        self.shared.borrow_mut().autodiscover = enable;
    }

    /// The device's UDID/serial, if negotiation has reached that point (§6 getters).
    pub fn serial(&self, device: DeviceId) -> Option<String> {
        self.shared
            .borrow()
            .registry
            .lookup(device)
            .and_then(|d| d.borrow().serial().map(str::to_owned))
    }

    /// `(bus << 16) | address` (§6, §8 `get_location` law).
    pub fn location(&self, device: DeviceId) -> u32 {
        device.location()
    }

    pub fn product_id(&self, device: DeviceId) -> Option<u16> {
        self.shared.borrow().registry.lookup(device).map(|d| d.borrow().product_id)
    }

    /// Negotiated link speed in bits/s (§3 Link properties).
    pub fn speed_bps(&self, device: DeviceId) -> Option<u32> {
        self.shared.borrow().registry.lookup(device).map(|d| d.borrow().speed_bps)
    }

    fn context(&self) -> Option<rusb::Context> {
        self.context.clone()
    }
}

impl Drop for UsbCore {
    /// Best-effort shutdown if the embedder forgot to call it explicitly; errors are logged,
    /// never propagated, since `Drop` cannot return a `Result`.
    fn drop(&mut self) {
        if self.context.is_some() {
            if let Err(err) = self.shutdown() {
                warn!(%err, "error during implicit shutdown in Drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingSink {
        added: RefCell<Vec<DeviceId>>,
        removed: RefCell<Vec<DeviceId>>,
    }

    impl RecordingSink {
        fn new() -> Rc<Self> {
            Rc::new(RecordingSink {
                added: RefCell::new(Vec::new()),
                removed: RefCell::new(Vec::new()),
            })
        }
    }

    impl DeviceSink for RecordingSink {
        fn byte_sink(&self, _device: DeviceId, _bytes: &[u8]) {}

        fn device_added(&self, device: DeviceId) -> bool {
            self.added.borrow_mut().push(device);
            true
        }

        fn device_removed(&self, device: DeviceId) {
            self.removed.borrow_mut().push(device);
        }
    }

    #[test]
    fn uninitialized_core_reports_large_timeout_and_no_fds() {
        let core = UsbCore::new(RecordingSink::new());
        assert!(core.get_fds().is_empty());
        assert_eq!(core.get_timeout(), pump::NO_POLL_TIMEOUT_MS);
    }

    #[test]
    fn send_to_unknown_device_is_an_error() {
        let core = UsbCore::new(RecordingSink::new());
        let result = core.send(DeviceId { bus: 1, address: 2 }, b"hello");
        assert!(matches!(result, Err(Error::NoSuchDevice { bus: 1, address: 2 })));
    }

    #[test]
    fn getters_on_unknown_device_return_none() {
        let core = UsbCore::new(RecordingSink::new());
        let id = DeviceId { bus: 3, address: 4 };
        assert_eq!(core.serial(id), None);
        assert_eq!(core.product_id(id), None);
        assert_eq!(core.speed_bps(id), None);
        assert_eq!(core.location(id), (3u32 << 16) | 4);
    }
}
