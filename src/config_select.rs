//! Configuration Selector (SPEC_FULL.md §4.4).
//!
//! Invoked synchronously, right after a device handle opens — descriptor reads and
//! `set_active_configuration` are short host-library calls the concurrency model (§5)
//! allows to run inline rather than through the async transfer machinery. The
//! detach-then-set-configuration sequence mirrors `ippusb_bridge`'s device setup: try to
//! detach every interface's kernel driver, tolerate failure, then set the configuration.

use tracing::{debug, warn};

use crate::error::Error;
use crate::mode::InterfaceClass;

/// The multiplex interface's class/subclass/protocol triple. Matched with OR, not AND — see
/// [`is_multiplex_interface`].
pub(crate) const MULTIPLEX_CLASS: u8 = 0xfe;
pub(crate) const MULTIPLEX_SUBCLASS: u8 = 0x02;
pub(crate) const MULTIPLEX_PROTOCOL: u8 = 0x01;

/// §4.4 step 2's match condition is deliberately broad — class OR subclass OR protocol, not a
/// strict triple match. Preserved as-is rather than tightened to AND (§9 "Interface match
/// condition" flags this as possibly a latent bug upstream; tightening it here would change
/// which real devices get recognized, so it stays broad).
pub(crate) fn is_multiplex_interface(class: u8, subclass: u8, protocol: u8) -> bool {
    class == MULTIPLEX_CLASS || subclass == MULTIPLEX_SUBCLASS || protocol == MULTIPLEX_PROTOCOL
}

pub(crate) struct SelectedConfiguration {
    pub(crate) config_value: u8,
    pub(crate) interface_number: u8,
    pub(crate) ep_out: u8,
    pub(crate) ep_in: u8,
}

/// Scans `device`'s configurations from the highest `bNumConfigurations` down to 1, picks the
/// first whose altsetting-0 interfaces include a multiplex-matching interface with exactly two
/// endpoints, and reconfigures the device handle onto it if needed (§4.4).
pub(crate) fn select_configuration(
    bus: u8,
    address: u8,
    device: &rusb::Device<rusb::Context>,
    handle: &rusb::DeviceHandle<rusb::Context>,
) -> Result<SelectedConfiguration, Error> {
    let device_descriptor = device
        .device_descriptor()
        .map_err(|source| Error::ReadDescriptor { bus, address, source })?;

    let mut chosen = None;
    for index in (0..device_descriptor.num_configurations()).rev() {
        let config_descriptor = match device.config_descriptor(index) {
            Ok(c) => c,
            Err(err) => {
                debug!(bus, address, index, %err, "skipping unreadable configuration descriptor");
                continue;
            }
        };

        if let Some((interface_number, ep_out, ep_in)) = find_multiplex_interface(&config_descriptor) {
            chosen = Some((config_descriptor, interface_number, ep_out, ep_in));
            break;
        }
    }

    let Some((config_descriptor, interface_number, ep_out, ep_in)) = chosen else {
        return Err(Error::NoMultiplexConfiguration { bus, address });
    };

    let config_value = config_descriptor.number();
    reconfigure_if_needed(bus, address, handle, &config_descriptor, config_value)?;

    Ok(SelectedConfiguration {
        config_value,
        interface_number,
        ep_out,
        ep_in,
    })
}

fn find_multiplex_interface(config: &rusb::ConfigDescriptor) -> Option<(u8, u8, u8)> {
    for interface in config.interfaces() {
        for setting in interface.descriptors() {
            if setting.setting_number() != 0 {
                continue;
            }
            if !is_multiplex_interface(
                setting.class_code(),
                setting.sub_class_code(),
                setting.protocol_code(),
            ) {
                continue;
            }

            let endpoints: Vec<u8> = setting.endpoint_descriptors().map(|e| e.address()).collect();
            if endpoints.len() != 2 {
                continue;
            }

            let ep_out = endpoints.iter().copied().find(|addr| addr & 0x80 == 0);
            let ep_in = endpoints.iter().copied().find(|addr| addr & 0x80 != 0);

            if let (Some(ep_out), Some(ep_in)) = (ep_out, ep_in) {
                return Some((interface.number(), ep_out, ep_in));
            }
        }
    }
    None
}

fn reconfigure_if_needed(
    bus: u8,
    address: u8,
    handle: &rusb::DeviceHandle<rusb::Context>,
    config_descriptor: &rusb::ConfigDescriptor,
    config_value: u8,
) -> Result<(), Error> {
    // An error here (typically "device not configured") is treated the same as "needs
    // reconfiguring", since `config_value` is always >= 1.
    let current = handle.active_configuration().unwrap_or(0);
    if current == config_value {
        return Ok(());
    }

    for interface in config_descriptor.interfaces() {
        match handle.kernel_driver_active(interface.number()) {
            Ok(true) => {
                if let Err(err) = handle.detach_kernel_driver(interface.number()) {
                    warn!(bus, address, interface = interface.number(), %err, "failed to detach kernel driver");
                }
            }
            Ok(false) => {}
            Err(err) => {
                debug!(bus, address, interface = interface.number(), %err, "could not query kernel driver state");
            }
        }
    }

    handle.set_active_configuration(config_value).map_err(|source| Error::SetConfiguration {
        bus,
        address,
        config: config_value,
        source,
    })
}

/// Reads the altsetting-0 interface class triples of one configuration, for the Mode
/// Negotiator's 5-configuration inspection step (§4.3).
pub(crate) fn read_interfaces(config_descriptor: &rusb::ConfigDescriptor) -> Vec<InterfaceClass> {
    config_descriptor
        .interfaces()
        .flat_map(|interface| interface.descriptors())
        .filter(|setting| setting.setting_number() == 0)
        .map(|setting| InterfaceClass {
            class: setting.class_code(),
            subclass: setting.sub_class_code(),
            protocol: setting.protocol_code(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_on_class_alone() {
        assert!(is_multiplex_interface(MULTIPLEX_CLASS, 0, 0));
    }

    #[test]
    fn matches_on_subclass_alone() {
        assert!(is_multiplex_interface(0, MULTIPLEX_SUBCLASS, 0));
    }

    #[test]
    fn matches_on_protocol_alone() {
        assert!(is_multiplex_interface(0, 0, MULTIPLEX_PROTOCOL));
    }

    #[test]
    fn rejects_when_none_match() {
        assert!(!is_multiplex_interface(1, 1, 1));
    }
}
