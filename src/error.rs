//! Errors surfaced across the synchronous fallible boundary (see SPEC_FULL.md §10.2).
//!
//! Per-device asynchronous failures are *not* represented here: per spec §7, a failed
//! control or bulk transfer callback marks the owning device's liveness flag and logs a
//! warning, it never produces a `Result` that unwinds through this type.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to initialize libusb context: {0}")]
    ContextInit(rusb::Error),

    #[error("failed to enumerate USB devices: {0}")]
    Enumerate(rusb::Error),

    #[error("{0} consecutive enumeration failures, giving up")]
    EnumerateExhausted(u32),

    #[error("failed to open device {bus:03}:{address:03}: {source}")]
    OpenDevice {
        bus: u8,
        address: u8,
        source: rusb::Error,
    },

    #[error("no configuration on device {bus:03}:{address:03} exposes the multiplex interface")]
    NoMultiplexConfiguration { bus: u8, address: u8 },

    #[error("failed to read descriptors from device {bus:03}:{address:03}: {source}")]
    ReadDescriptor {
        bus: u8,
        address: u8,
        source: rusb::Error,
    },

    #[error("failed to set configuration {config} on device {bus:03}:{address:03}: {source}")]
    SetConfiguration {
        bus: u8,
        address: u8,
        config: u8,
        source: rusb::Error,
    },

    #[error("failed to claim interface {interface} on device {bus:03}:{address:03}: {source}")]
    ClaimInterface {
        bus: u8,
        address: u8,
        interface: u8,
        source: rusb::Error,
    },

    #[error("failed to register hotplug callback: {0}")]
    HotplugRegister(rusb::Error),

    #[error("no such device at {bus:03}:{address:03}")]
    NoSuchDevice { bus: u8, address: u8 },

    #[error("device {bus:03}:{address:03} is not alive")]
    DeviceNotAlive { bus: u8, address: u8 },

    #[error("failed to submit transfer: {0}")]
    SubmitTransfer(rusb::Error),

    #[error("usbmux_core used before init() or after shutdown()")]
    NotInitialized,
}
