//! Initialization Pipeline (SPEC_FULL.md §4.5).
//!
//! Runs once the Mode Negotiator reaches its terminal step. Claims the interface, computes
//! link properties, then chains two control transfers (LANGID, then serial) before publishing
//! the device to the upper layer and starting the inbound RX loops.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{info, warn};

use crate::config::Config;
use crate::config_select;
use crate::device::Device;
use crate::serial;
use crate::speed;
use crate::transfer::{self, ControlResult};

/// String descriptor index 0 (language-ID table) and the well-known `iSerialNumber` index
/// Apple's multiplex devices expose their UDID under (§4.5 steps 4-5).
const LANGID_DESCRIPTOR_INDEX: u16 = 0;
const SERIAL_DESCRIPTOR_INDEX: u16 = 3;
const GET_DESCRIPTOR_REQUEST: u8 = 0x06;
const STRING_DESCRIPTOR_TYPE: u16 = 0x03 << 8;
const STRING_DESCRIPTOR_WLENGTH: u16 = 1024;

/// Runs the pipeline against an already mode-negotiated device. Configuration selection
/// (§4.4) happens here, at the start of initialization, rather than before mode negotiation —
/// a mode switch can change which configuration and endpoints the device exposes, so the
/// selector must see the device's post-negotiation descriptor set. `on_finished` fires once
/// the device has either been fully published and started, or abandoned (dead / rejected).
pub(crate) fn run(
    device: &Rc<RefCell<Device>>,
    config: Config,
    on_finished: impl FnOnce(&Rc<RefCell<Device>>) + 'static,
) {
    let selected = {
        let dev = device.borrow();
        let usb_device = dev.handle().device();
        config_select::select_configuration(dev.id.bus, dev.id.address, &usb_device, dev.handle())
    };

    let selected = match selected {
        Ok(selected) => selected,
        Err(err) => {
            let id = device.borrow().id;
            warn!(bus = id.bus, address = id.address, %err, "no multiplex configuration found");
            device.borrow_mut().mark_dead();
            on_finished(device);
            return;
        }
    };

    let claimed = {
        let dev = device.borrow();
        dev.handle().claim_interface(selected.interface_number)
    };

    if let Err(err) = claimed {
        let id = device.borrow().id;
        warn!(bus = id.bus, address = id.address, %err, "failed to claim interface");
        device.borrow_mut().mark_dead();
        on_finished(device);
        return;
    }

    {
        let mut dev = device.borrow_mut();
        dev.interface_number = selected.interface_number;
        dev.ep_out = selected.ep_out;
        dev.ep_in = selected.ep_in;
        dev.max_packet_size_out = max_packet_size(&dev, selected.ep_out);
        dev.speed_bps = speed::bits_per_second(dev.handle().device().speed());
    }

    get_langid(Rc::clone(device), config, on_finished);
}

fn max_packet_size(device: &Device, ep_out: u8) -> u16 {
    device
        .handle()
        .device()
        .active_config_descriptor()
        .ok()
        .and_then(|config| {
            config
                .interfaces()
                .flat_map(|iface| iface.descriptors())
                .flat_map(|setting| setting.endpoint_descriptors().collect::<Vec<_>>())
                .find(|ep| ep.address() == ep_out)
                .map(|ep| ep.max_packet_size())
        })
        .unwrap_or(64)
}

fn get_langid(device: Rc<RefCell<Device>>, config: Config, on_finished: impl FnOnce(&Rc<RefCell<Device>>) + 'static) {
    let submit_result = {
        let dev = device.borrow();
        let device_for_continuation = Rc::clone(&device);
        transfer::submit_standard_in_control(
            dev.handle(),
            GET_DESCRIPTOR_REQUEST,
            STRING_DESCRIPTOR_TYPE | LANGID_DESCRIPTOR_INDEX,
            0,
            STRING_DESCRIPTOR_WLENGTH,
            config.control_timeout,
            move |result: ControlResult| {
                on_langid(device_for_continuation, config, result, on_finished);
            },
        )
    };

    if let Err(err) = submit_result {
        abandon(&device, "failed to submit LANGID request", &err.to_string());
        on_finished(&device);
    }
}

fn on_langid(
    device: Rc<RefCell<Device>>,
    config: Config,
    result: ControlResult,
    on_finished: impl FnOnce(&Rc<RefCell<Device>>) + 'static,
) {
    if !result.status.is_success() {
        abandon(&device, "LANGID request did not complete", &format!("{:?}", result.status));
        on_finished(&device);
        return;
    }

    let Some(langid) = serial::first_language_id(&result.data) else {
        abandon(&device, "LANGID response too short", "");
        on_finished(&device);
        return;
    };

    get_serial(device, config, langid, on_finished);
}

fn get_serial(
    device: Rc<RefCell<Device>>,
    config: Config,
    langid: u16,
    on_finished: impl FnOnce(&Rc<RefCell<Device>>) + 'static,
) {
    let submit_result = {
        let dev = device.borrow();
        let device_for_continuation = Rc::clone(&device);
        transfer::submit_standard_in_control(
            dev.handle(),
            GET_DESCRIPTOR_REQUEST,
            STRING_DESCRIPTOR_TYPE | SERIAL_DESCRIPTOR_INDEX,
            langid,
            STRING_DESCRIPTOR_WLENGTH,
            config.control_timeout,
            move |result: ControlResult| {
                on_serial(device_for_continuation, config, result, on_finished);
            },
        )
    };

    if let Err(err) = submit_result {
        abandon(&device, "failed to submit serial request", &err.to_string());
        on_finished(&device);
    }
}

fn on_serial(
    device: Rc<RefCell<Device>>,
    config: Config,
    result: ControlResult,
    on_finished: impl FnOnce(&Rc<RefCell<Device>>) + 'static,
) {
    if !result.status.is_success() {
        abandon(&device, "serial request did not complete", &format!("{:?}", result.status));
        on_finished(&device);
        return;
    }

    // The descriptor's first two bytes are bLength/bDescriptorType; the rest is the UTF-16LE
    // payload (§4.5 step 5).
    let payload = result.data.get(2..).unwrap_or(&[]);
    let decoded = serial::decode_string_descriptor(payload);
    let reformatted = serial::reformat_udid(&decoded);

    device.borrow_mut().serial = Some(reformatted);

    publish_and_start(device, config, on_finished);
}

fn publish_and_start(
    device: Rc<RefCell<Device>>,
    config: Config,
    on_finished: impl FnOnce(&Rc<RefCell<Device>>) + 'static,
) {
    let (id, sink) = {
        let dev = device.borrow();
        (dev.id, dev.sink_clone())
    };

    if !sink.device_added(id) {
        info!(bus = id.bus, address = id.address, "device rejected by upper layer");
        device.borrow_mut().mark_dead();
        on_finished(&device);
        return;
    }

    let started = device
        .borrow_mut()
        .start_inbound_loops(config.target_rx_parallelism);

    if started == 0 {
        warn!(bus = id.bus, address = id.address, "no inbound transfers could be started");
        device.borrow_mut().mark_dead();
        on_finished(&device);
        return;
    }

    if started < config.target_rx_parallelism {
        warn!(
            bus = id.bus,
            address = id.address,
            started,
            target = config.target_rx_parallelism,
            "starting with reduced inbound parallelism"
        );
    }

    device.borrow_mut().mark_published();
    info!(bus = id.bus, address = id.address, serial = ?device.borrow().serial(), "device published");
    on_finished(&device);
}

fn abandon(device: &Rc<RefCell<Device>>, message: &str, detail: &str) {
    let id = device.borrow().id;
    warn!(bus = id.bus, address = id.address, detail, "{}", message);
    device.borrow_mut().mark_dead();
}
