//! Discovery & Hotplug Driver (SPEC_FULL.md §4.6).
//!
//! Two independent feeds push candidate devices through the same `device_add` filter: the
//! hotplug callback (preferred, event-driven) and the polling fallback the Event Pump drives
//! off its poll deadline. Both end up calling [`device_add`], which is where the vendor/product
//! filter, configuration selection, and the handoff into the Mode Negotiator all live.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, error, warn};

use crate::config::Config;
use crate::config_select;
use crate::device::{Device, DeviceId, DeviceSink};
use crate::error::Error;
use crate::ids;
use crate::init_pipeline;
use crate::mode;
use crate::registry::Registry;

/// State the hotplug callback and the polling path both reach into: the registry, the
/// environment-derived config, the upper layer's sink, and the `autodiscover` gate (§6).
pub(crate) struct SharedState {
    pub(crate) registry: Registry,
    pub(crate) config: Config,
    pub(crate) sink: Rc<dyn DeviceSink>,
    pub(crate) autodiscover: bool,
}

/// Holds the hotplug registration (if the host library supports it) and the polling path's
/// consecutive-failure counter (§4.6, §8 "5 consecutive enumeration failures escalate").
pub(crate) struct Discovery {
    hotplug: Option<rusb::Registration<rusb::Context>>,
    enumerate_failures: u32,
}

impl Discovery {
    pub(crate) fn new() -> Self {
        Discovery {
            hotplug: None,
            enumerate_failures: 0,
        }
    }

    pub(crate) fn hotplug_active(&self) -> bool {
        self.hotplug.is_some()
    }

    /// Registers the single ARRIVED/LEFT hotplug callback, filtered by vendor ID, with
    /// `enumerate(true)` so already-attached devices are reported immediately (§4.6). A no-op,
    /// successful call if the host library does not advertise hotplug support; the caller is
    /// expected to fall back to the polling path in that case.
    pub(crate) fn register_hotplug(
        &mut self,
        context: &rusb::Context,
        shared: &Rc<RefCell<SharedState>>,
    ) -> Result<(), Error> {
        if !context.has_hotplug() {
            debug!("host libusb build lacks hotplug support, falling back to polling");
            return Ok(());
        }

        let handler = HotplugHandler {
            shared: Rc::clone(shared),
        };

        let registration = rusb::HotplugBuilder::new()
            .vendor_id(ids::APPLE_VENDOR_ID)
            .enumerate(true)
            .register(context.clone(), Box::new(handler))
            .map_err(Error::HotplugRegister)?;

        self.hotplug = Some(registration);
        Ok(())
    }

    /// Deregisters the hotplug callback, if any (§6 `shutdown()`).
    pub(crate) fn unregister_hotplug(&mut self, context: &rusb::Context) {
        if let Some(registration) = self.hotplug.take() {
            context.unregister_callback(registration);
        }
    }

    /// Runs one polling-path pass (§4.6 steps 1-4). Returns an error only once the consecutive
    /// failure count reaches [`Config::max_enumerate_failures`] (§8's failure cascade: failures
    /// 1 through 4 are swallowed with a warning, the 5th is surfaced).
    pub(crate) fn poll_once(&mut self, context: &rusb::Context, shared: &mut SharedState) -> Result<(), Error> {
        let devices = match context.devices() {
            Ok(devices) => {
                self.enumerate_failures = 0;
                devices
            }
            Err(err) => {
                self.enumerate_failures += 1;
                warn!(failures = self.enumerate_failures, %err, "failed to enumerate USB devices");
                if self.enumerate_failures >= shared.config.max_enumerate_failures {
                    error!("giving up after repeated enumeration failures");
                    return Err(Error::EnumerateExhausted(self.enumerate_failures));
                }
                return Ok(());
            }
        };

        shared.registry.mark_all_not_alive();

        for device in devices.iter() {
            device_add(&shared.config, &shared.sink, &mut shared.registry, device);
        }

        shared.registry.reap(context, &shared.config);
        Ok(())
    }
}

struct HotplugHandler {
    shared: Rc<RefCell<SharedState>>,
}

impl rusb::Hotplug<rusb::Context> for HotplugHandler {
    fn device_arrived(&mut self, device: rusb::Device<rusb::Context>) {
        let mut shared = self.shared.borrow_mut();
        if !shared.autodiscover {
            return;
        }
        let SharedState { registry, config, sink, .. } = &mut *shared;
        device_add(config, sink, registry, device);
    }

    fn device_left(&mut self, device: rusb::Device<rusb::Context>) {
        let shared = self.shared.borrow();
        let id = DeviceId {
            bus: device.bus_number(),
            address: device.address(),
        };
        let Some(record) = shared.registry.lookup(id) else {
            return;
        };
        // Only mark the record dead here; `Registry::reap` is the single site that notifies
        // the upper layer and tears the device down, for both this path and the polling
        // fallback (§4.6 "teardown happens during the next reap"). Notifying here too would
        // deliver two `device_removed` calls for one physical unplug.
        record.borrow_mut().mark_dead();
    }
}

/// The device-add filter and pipeline handoff shared by both discovery paths (§4.6 "Device-add
/// filter"). A non-matching vendor/product pair, an unopenable device, or a device with no
/// multiplex-capable configuration is a benign filter miss: logged at most at `debug!`, never
/// surfaced as an error.
fn device_add(config: &Config, sink: &Rc<dyn DeviceSink>, registry: &mut Registry, device: rusb::Device<rusb::Context>) {
    let descriptor = match device.device_descriptor() {
        Ok(descriptor) => descriptor,
        Err(err) => {
            debug!(%err, "could not read device descriptor, skipping");
            return;
        }
    };

    if !ids::is_multiplex_candidate(descriptor.vendor_id(), descriptor.product_id()) {
        return;
    }

    let bus = device.bus_number();
    let address = device.address();
    let id = DeviceId { bus, address };

    if let Some(existing) = registry.lookup(id) {
        existing.borrow_mut().revive();
        return;
    }

    let handle = match device.open() {
        Ok(handle) => handle,
        Err(source) => {
            warn!(bus, address, %source, "failed to open candidate device");
            return;
        }
    };

    let guess = guess_device_mode(&device, &descriptor);

    let record = Device::new(id, descriptor.vendor_id(), descriptor.product_id(), handle, Rc::clone(sink));
    registry.insert(Rc::clone(&record));

    let config = *config;
    mode::negotiate(&record, config, guess, move |negotiated| {
        init_pipeline::run(negotiated, config, |_finished| {});
    });
}

/// Computes the mode-guess for a freshly opened device (§4.3 guess policy table), inspecting
/// configuration 5's interfaces only in the 5-configuration case.
fn guess_device_mode(device: &rusb::Device<rusb::Context>, descriptor: &rusb::DeviceDescriptor) -> u32 {
    let num_configurations = descriptor.num_configurations();
    mode::guess_mode(num_configurations, || {
        for index in 0..num_configurations {
            let Ok(config_descriptor) = device.config_descriptor(index) else {
                continue;
            };
            if config_descriptor.number() == 5 {
                let interfaces = config_select::read_interfaces(&config_descriptor);
                return mode::guess_mode_for_config5(&interfaces);
            }
        }
        0
    })
}
