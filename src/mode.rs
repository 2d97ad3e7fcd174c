//! Mode Negotiator (SPEC_FULL.md §4.3).
//!
//! Modeled as a chain of boxed `FnOnce` continuations rather than a tagged-state enum (§9
//! floats the enum as one valid reimplementation strategy) — each step is a free function that
//! submits one control transfer and hands the next step to `transfer.rs` as the completion
//! closure, which reads closer to the async chain it represents than a manually-dispatched
//! state tag would.
//!
//! The "guess" compared against the desired mode always comes from descriptor inspection
//! (`guess_mode`/`guess_mode_for_config5`), computed once before negotiation starts. GET_MODE's
//! response bytes only gate success/failure of the query itself — per the worked examples in
//! §8, a device reporting `[3,3,3,0]` from GET_MODE still negotiates off the descriptor-derived
//! guess, not that payload.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::config::{Config, MAX_DEVICE_MODE, MIN_DEVICE_MODE};
use crate::config_select::{self, MULTIPLEX_CLASS};
use crate::device::Device;
use crate::transfer::{self, ControlResult};

/// Apple's private vendor-specific mode-query/mode-switch request codes (§6).
const GET_MODE_REQUEST: u8 = 0x45;
const SET_MODE_REQUEST: u8 = 0x52;

/// One interface's class/subclass/protocol triple, as read from its descriptor.
#[derive(Debug, Clone, Copy)]
pub(crate) struct InterfaceClass {
    pub(crate) class: u8,
    pub(crate) subclass: u8,
    pub(crate) protocol: u8,
}

/// Guesses a device's current mode from `bNumConfigurations` (§4.3 guess policy table).
/// `inspect_config5` is only invoked for the 5-configuration case.
pub(crate) fn guess_mode(num_configurations: u8, inspect_config5: impl FnOnce() -> u32) -> u32 {
    match num_configurations {
        1 => 5,
        2..=4 => 1,
        5 => inspect_config5(),
        6 => 4,
        _ => 0,
    }
}

/// Inspects configuration 5's interfaces for the multiplex interface plus either the Valeria
/// or CDC-NCM marker interface.
pub(crate) fn guess_mode_for_config5(interfaces: &[InterfaceClass]) -> u32 {
    let has_multiplex = interfaces
        .iter()
        .any(|i| config_select::is_multiplex_interface(i.class, i.subclass, i.protocol));
    if !has_multiplex {
        return 0;
    }

    let has_valeria = interfaces
        .iter()
        .any(|i| i.class == MULTIPLEX_CLASS && i.subclass == 42 && i.protocol == 255);
    if has_valeria {
        return 2;
    }

    let has_cdc_ncm = interfaces.iter().any(|i| i.class == 2 && i.subclass == 0x0d);
    if has_cdc_ncm {
        return 3;
    }

    0
}

/// Whether the decide step should request a mode switch (§4.3 step 2).
pub(crate) fn should_switch(desired: u32, guess: u32) -> bool {
    (MIN_DEVICE_MODE..=MAX_DEVICE_MODE).contains(&desired) && guess > 0 && guess != desired
}

/// Drives GetMode → Decide → SwitchMode, invoking `on_done` exactly once with the device once
/// the chain reaches Initialization (§4.3 step 4, handed off to `init_pipeline`).
pub(crate) fn negotiate(
    device: &Rc<RefCell<Device>>,
    config: Config,
    guess: u32,
    on_done: impl FnOnce(&Rc<RefCell<Device>>) + 'static,
) {
    get_mode(Rc::clone(device), config, guess, on_done);
}

fn get_mode(
    device: Rc<RefCell<Device>>,
    config: Config,
    guess: u32,
    on_done: impl FnOnce(&Rc<RefCell<Device>>) + 'static,
) {
    let submit_result = {
        let dev = device.borrow();
        let device_for_continuation = Rc::clone(&device);
        transfer::submit_vendor_in_control(
            dev.handle(),
            GET_MODE_REQUEST,
            0,
            0,
            4,
            config.control_timeout,
            move |result: ControlResult| {
                decide(device_for_continuation, config, guess, result, on_done);
            },
        )
    };

    if let Err(err) = submit_result {
        warn!(%err, "failed to submit GET_MODE, skipping negotiation");
        on_done(&device);
    }
}

fn decide(
    device: Rc<RefCell<Device>>,
    config: Config,
    guess: u32,
    result: ControlResult,
    on_done: impl FnOnce(&Rc<RefCell<Device>>) + 'static,
) {
    if !result.status.is_success() {
        debug!(status = ?result.status, "GET_MODE did not complete, skipping negotiation");
        on_done(&device);
        return;
    }

    if should_switch(config.desired_mode, guess) {
        switch_mode(device, config, config.desired_mode, on_done);
    } else {
        on_done(&device);
    }
}

fn switch_mode(
    device: Rc<RefCell<Device>>,
    config: Config,
    desired: u32,
    on_done: impl FnOnce(&Rc<RefCell<Device>>) + 'static,
) {
    let submit_result = {
        let dev = device.borrow();
        let device_for_continuation = Rc::clone(&device);
        transfer::submit_vendor_in_control(
            dev.handle(),
            SET_MODE_REQUEST,
            0,
            desired as u16,
            1,
            config.control_timeout,
            move |result: ControlResult| {
                if !result.status.is_success() || result.data.first().copied() != Some(0) {
                    debug!(status = ?result.status, "SET_MODE failed, continuing in current mode");
                }
                on_done(&device_for_continuation);
            },
        )
    };

    if let Err(err) = submit_result {
        warn!(%err, "failed to submit SET_MODE, continuing in current mode");
        on_done(&device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guess_table_matches_boundary_cases() {
        assert_eq!(guess_mode(1, || unreachable!()), 5);
        assert_eq!(guess_mode(2, || unreachable!()), 1);
        assert_eq!(guess_mode(3, || unreachable!()), 1);
        assert_eq!(guess_mode(4, || unreachable!()), 1);
        assert_eq!(guess_mode(6, || unreachable!()), 4);
        assert_eq!(guess_mode(7, || unreachable!()), 0);
        assert_eq!(guess_mode(5, || 2), 2);
    }

    #[test]
    fn config5_requires_multiplex_interface() {
        let interfaces = [InterfaceClass {
            class: MULTIPLEX_CLASS,
            subclass: 42,
            protocol: 255,
        }];
        assert_eq!(guess_mode_for_config5(&interfaces), 2);

        let no_multiplex = [InterfaceClass {
            class: 2,
            subclass: 0x0d,
            protocol: 0,
        }];
        assert_eq!(guess_mode_for_config5(&no_multiplex), 0);
    }

    #[test]
    fn config5_detects_cdc_ncm_alongside_multiplex() {
        let interfaces = [
            InterfaceClass {
                class: MULTIPLEX_CLASS,
                subclass: 0,
                protocol: 0,
            },
            InterfaceClass {
                class: 2,
                subclass: 0x0d,
                protocol: 0,
            },
        ];
        assert_eq!(guess_mode_for_config5(&interfaces), 3);
    }

    #[test]
    fn config5_without_valeria_or_cdc_ncm_is_undetermined() {
        let interfaces = [InterfaceClass {
            class: 8,
            subclass: 1,
            protocol: 1,
        }];
        assert_eq!(guess_mode_for_config5(&interfaces), 0);
    }

    #[test]
    fn switch_requested_only_when_guess_confident_and_differs() {
        assert!(should_switch(1, 2));
        assert!(!should_switch(1, 1));
        assert!(!should_switch(1, 0));
        assert!(!should_switch(0, 2));
        assert!(!should_switch(6, 2));
    }
}
