//! Minimal embedder for `usbmux_core::UsbCore` (SPEC_FULL.md §6 external interfaces).
//!
//! This is not the multiplexing daemon itself — it wires the core up to a toy [`DeviceSink`]
//! that logs arrivals, removals, and inbound byte counts, and drives it with a plain
//! `poll(2)` loop. A real embedder would dispatch inbound bytes into the framing/client layer
//! this crate deliberately excludes (§1).

use std::os::fd::BorrowedFd;
use std::rc::Rc;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{error, info};

use usbmux_core::{DeviceId, DeviceSink, UsbCore};

struct LoggingSink;

impl DeviceSink for LoggingSink {
    fn byte_sink(&self, device: DeviceId, bytes: &[u8]) {
        info!(bus = device.bus, address = device.address, len = bytes.len(), "received bytes");
    }

    fn device_added(&self, device: DeviceId) -> bool {
        info!(bus = device.bus, address = device.address, "device added");
        true
    }

    fn device_removed(&self, device: DeviceId) {
        info!(bus = device.bus, address = device.address, "device removed");
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    let mut core = UsbCore::new(Rc::new(LoggingSink));
    if let Err(err) = core.init() {
        error!(%err, "failed to initialize usbmux core");
        std::process::exit(1);
    }

    loop {
        if let Err(err) = core.process() {
            error!(%err, "fatal error from usbmux core, exiting");
            break;
        }

        let timeout_ms = core.get_timeout().min(i32::MAX as u64) as i32;
        let fds = core.get_fds();
        let mut poll_fds: Vec<PollFd> = fds
            .iter()
            .map(|(fd, events)| {
                let flags = PollFlags::from_bits_truncate(*events);
                // Safety: `fd` is borrowed for the duration of this `poll` call only, and the
                // underlying descriptor is kept open by the core's own `rusb::Context` for at
                // least that long.
                let borrowed = unsafe { BorrowedFd::borrow_raw(*fd) };
                PollFd::new(borrowed, flags)
            })
            .collect();

        let timeout = PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::NONE);
        if let Err(err) = poll(&mut poll_fds, timeout) {
            error!(%err, "poll(2) failed");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    if let Err(err) = core.shutdown() {
        error!(%err, "error during shutdown");
    }
}
