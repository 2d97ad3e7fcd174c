//! Raw asynchronous USB transfer submission (§4.1, §10.1).
//!
//! `rusb`'s safe surface only covers libusb's synchronous calls, so the async
//! submit-with-callback model this spec depends on is built directly on the raw
//! `libusb1-sys` bindings `rusb` itself is built on. This is the one module in the crate
//! where `unsafe` is load-bearing; every other module only ever sees the safe wrappers
//! below.

use std::cell::RefCell;
use std::os::raw::c_int;
use std::rc::Weak;
use std::time::Duration;

use libusb1_sys::libusb_transfer;

use crate::device::Device;
use crate::error::Error;

// --- libusb constants this crate relies on (stable C ABI, see libusb.h). ---

const LIBUSB_ENDPOINT_IN: u8 = 0x80;
const LIBUSB_REQUEST_TYPE_VENDOR: u8 = 0x02 << 5;
const LIBUSB_RECIPIENT_DEVICE: u8 = 0x00;

const LIBUSB_TRANSFER_FREE_TRANSFER: u8 = 1 << 2;

const LIBUSB_CONTROL_SETUP_SIZE: usize = 8;

const LIBUSB_REQUEST_TYPE_STANDARD: u8 = 0x00 << 5;

/// The bmRequestType byte for "vendor request, device recipient, device-to-host" used by
/// both GET_MODE and SET_MODE (§6).
const VENDOR_DEVICE_IN: u8 = LIBUSB_ENDPOINT_IN | LIBUSB_REQUEST_TYPE_VENDOR | LIBUSB_RECIPIENT_DEVICE;

/// The bmRequestType byte for a standard GET_DESCRIPTOR request (§4.5 steps 4-5).
const STANDARD_DEVICE_IN: u8 = LIBUSB_ENDPOINT_IN | LIBUSB_REQUEST_TYPE_STANDARD | LIBUSB_RECIPIENT_DEVICE;

/// Outcome of a terminal control-transfer callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

impl TransferStatus {
    pub fn is_success(self) -> bool {
        matches!(self, TransferStatus::Completed)
    }

    fn from_raw(raw: libusb1_sys::constants::libusb_transfer_status) -> Self {
        use libusb1_sys::constants::*;
        match raw {
            LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
            LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
            LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
            LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
            LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
            LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overflow,
            _ => TransferStatus::Error,
        }
    }
}

/// Result handed to a control-transfer continuation: status plus the response payload
/// (empty on anything but `Completed`).
pub struct ControlResult {
    pub status: TransferStatus,
    pub data: Vec<u8>,
}

struct ControlCallbackCtx {
    // Keeps the setup+data buffer alive for the lifetime of the transfer; freed here once
    // the callback fires, matching §4.3's "every terminal callback frees ... the transfer's
    // buffer" — the transfer struct itself is freed by libusb via FREE_TRANSFER.
    buffer: Vec<u8>,
    w_length: usize,
    continuation: Box<dyn FnOnce(ControlResult)>,
}

unsafe extern "system" fn control_transfer_complete(transfer: *mut libusb_transfer) {
    let ctx = Box::from_raw((*transfer).user_data as *mut ControlCallbackCtx);
    let status = TransferStatus::from_raw((*transfer).status);
    let data = if status.is_success() {
        let actual = (*transfer).actual_length.max(0) as usize;
        let take = actual.min(ctx.w_length);
        ctx.buffer[LIBUSB_CONTROL_SETUP_SIZE..LIBUSB_CONTROL_SETUP_SIZE + take].to_vec()
    } else {
        Vec::new()
    };
    (ctx.continuation)(ControlResult { status, data });
}

/// Submits a vendor/device IN control transfer (GET_MODE/SET_MODE) and invokes `continuation`
/// exactly once, from the event pump's dispatch call, with the terminal status and any
/// response bytes (§4.3 GetMode/SwitchMode).
pub(crate) fn submit_vendor_in_control(
    handle: &rusb::DeviceHandle<rusb::Context>,
    b_request: u8,
    w_value: u16,
    w_index: u16,
    w_length: u16,
    timeout: Duration,
    continuation: impl FnOnce(ControlResult) + 'static,
) -> Result<(), Error> {
    submit_in_control(handle, VENDOR_DEVICE_IN, b_request, w_value, w_index, w_length, timeout, continuation)
}

/// Submits a standard/device IN control transfer (GET_DESCRIPTOR) and invokes `continuation`
/// exactly once, with the terminal status and any response bytes (§4.5 steps 4-5). The LANGID
/// and serial-string fetches are plain GET_DESCRIPTOR requests, not vendor requests, so they
/// must go out with `STANDARD_DEVICE_IN` for real devices to answer them.
pub(crate) fn submit_standard_in_control(
    handle: &rusb::DeviceHandle<rusb::Context>,
    b_request: u8,
    w_value: u16,
    w_index: u16,
    w_length: u16,
    timeout: Duration,
    continuation: impl FnOnce(ControlResult) + 'static,
) -> Result<(), Error> {
    submit_in_control(handle, STANDARD_DEVICE_IN, b_request, w_value, w_index, w_length, timeout, continuation)
}

fn submit_in_control(
    handle: &rusb::DeviceHandle<rusb::Context>,
    request_type: u8,
    b_request: u8,
    w_value: u16,
    w_index: u16,
    w_length: u16,
    timeout: Duration,
    continuation: impl FnOnce(ControlResult) + 'static,
) -> Result<(), Error> {
    unsafe {
        let raw = libusb1_sys::libusb_alloc_transfer(0);
        if raw.is_null() {
            return Err(Error::SubmitTransfer(rusb::Error::NoMem));
        }

        let mut buffer = vec![0u8; LIBUSB_CONTROL_SETUP_SIZE + w_length as usize];
        libusb1_sys::libusb_fill_control_setup(
            buffer.as_mut_ptr(),
            request_type,
            b_request,
            w_value,
            w_index,
            w_length,
        );
        let buffer_ptr = buffer.as_mut_ptr();

        let ctx = Box::new(ControlCallbackCtx {
            buffer,
            w_length: w_length as usize,
            continuation: Box::new(continuation),
        });
        let ctx_ptr = Box::into_raw(ctx);

        libusb1_sys::libusb_fill_control_transfer(
            raw,
            handle.as_raw(),
            buffer_ptr,
            control_transfer_complete,
            ctx_ptr as *mut _,
            timeout.as_millis() as u32,
        );
        (*raw).flags = LIBUSB_TRANSFER_FREE_TRANSFER;

        let rc = libusb1_sys::libusb_submit_transfer(raw);
        if rc != 0 {
            // Submission failed synchronously: the callback will never fire, so reclaim
            // the context and transfer ourselves instead of leaking them.
            drop(Box::from_raw(ctx_ptr));
            libusb1_sys::libusb_free_transfer(raw);
            return Err(Error::SubmitTransfer(rusb_error_from_code(rc)));
        }
        Ok(())
    }
}

fn rusb_error_from_code(code: c_int) -> rusb::Error {
    rusb::Error::from_libusb(code)
}

// --- Bulk transfer pool primitives (§4.1). ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BulkKind {
    Inbound,
    Outbound,
}

pub(crate) struct BulkCallbackCtx {
    pub(crate) device: Weak<RefCell<Device>>,
    pub(crate) kind: BulkKind,
    pub(crate) slot_id: u64,
}

unsafe extern "system" fn bulk_transfer_complete(transfer: *mut libusb_transfer) {
    let ctx = Box::from_raw((*transfer).user_data as *mut BulkCallbackCtx);
    let status = TransferStatus::from_raw((*transfer).status);
    let actual_length = (*transfer).actual_length.max(0) as usize;

    let Some(device_rc) = ctx.device.upgrade() else {
        // Device already torn down by the disconnect protocol's force-cleanup; nothing
        // left to update, just reclaim libusb's resources.
        libusb1_sys::libusb_free_transfer(transfer);
        return;
    };

    let mut device = device_rc.borrow_mut();
    match ctx.kind {
        BulkKind::Inbound => device.on_inbound_complete(ctx.slot_id, status, actual_length),
        BulkKind::Outbound => device.on_outbound_complete(ctx.slot_id, status),
    }
}

/// Allocates and submits a bulk transfer against `endpoint` using `buffer`, whose pointer
/// must remain valid (and must not be touched by safe code) until the completion callback
/// fires. Returns the raw transfer pointer so the owning pool can cancel it later.
pub(crate) fn submit_bulk_transfer(
    handle: &rusb::DeviceHandle<rusb::Context>,
    endpoint: u8,
    buffer: &mut [u8],
    device: Weak<RefCell<Device>>,
    kind: BulkKind,
    slot_id: u64,
) -> Result<*mut libusb_transfer, Error> {
    unsafe {
        let raw = libusb1_sys::libusb_alloc_transfer(0);
        if raw.is_null() {
            return Err(Error::SubmitTransfer(rusb::Error::NoMem));
        }

        let ctx = Box::new(BulkCallbackCtx {
            device,
            kind,
            slot_id,
        });
        let ctx_ptr = Box::into_raw(ctx);

        libusb1_sys::libusb_fill_bulk_transfer(
            raw,
            handle.as_raw(),
            endpoint,
            buffer.as_mut_ptr(),
            buffer.len() as c_int,
            bulk_transfer_complete,
            ctx_ptr as *mut _,
            0, // no per-transfer timeout (§5): transfers run until cancelled or complete.
        );

        let rc = libusb1_sys::libusb_submit_transfer(raw);
        if rc != 0 {
            drop(Box::from_raw(ctx_ptr));
            libusb1_sys::libusb_free_transfer(raw);
            return Err(Error::SubmitTransfer(rusb_error_from_code(rc)));
        }
        Ok(raw)
    }
}

/// Resubmits an already-allocated, already-filled bulk transfer (same endpoint, same
/// buffer) after a successful completion, per §4.1's "the same transfer is resubmitted"
/// buffer-reuse optimization. Only the completion context is replaced.
pub(crate) fn resubmit_bulk_transfer(
    raw: *mut libusb_transfer,
    device: Weak<RefCell<Device>>,
    kind: BulkKind,
    slot_id: u64,
) -> Result<(), Error> {
    unsafe {
        let ctx = Box::new(BulkCallbackCtx {
            device,
            kind,
            slot_id,
        });
        let ctx_ptr = Box::into_raw(ctx);
        (*raw).user_data = ctx_ptr as *mut _;

        let rc = libusb1_sys::libusb_submit_transfer(raw);
        if rc != 0 {
            drop(Box::from_raw(ctx_ptr));
            return Err(Error::SubmitTransfer(rusb_error_from_code(rc)));
        }
        Ok(())
    }
}

/// Requests cancellation of an in-flight transfer. The completion callback still fires
/// (typically with `Cancelled`); this function does not free anything itself.
pub(crate) fn cancel_transfer(raw: *mut libusb_transfer) {
    unsafe {
        libusb1_sys::libusb_cancel_transfer(raw);
    }
}

/// Force-frees a transfer whose callback will never be trusted to arrive (§4.8 step 4).
/// Safety: caller must guarantee libusb will not write into `raw` or call back into it again.
/// The buffer itself is always owned on the Rust side (never `LIBUSB_TRANSFER_FREE_BUFFER`),
/// so the caller is responsible for dropping it after this returns.
pub(crate) unsafe fn force_free_transfer(raw: *mut libusb_transfer) {
    libusb1_sys::libusb_free_transfer(raw);
}

pub(crate) unsafe fn free_transfer(raw: *mut libusb_transfer) {
    libusb1_sys::libusb_free_transfer(raw);
}

// --- Poll-fd query for the Event Pump (§4.7). ---

/// The descriptors libusb currently wants polled for this context, as `(fd, events)` pairs.
/// `rusb`'s safe `Context` does not expose `libusb_get_pollfds`, so this reaches for the same
/// raw `libusb1-sys` boundary the rest of this module uses.
pub(crate) fn poll_fds(context: &rusb::Context) -> Vec<(c_int, i16)> {
    use rusb::UsbContext;

    unsafe {
        let list = libusb1_sys::libusb_get_pollfds(context.as_raw());
        if list.is_null() {
            return Vec::new();
        }

        let mut fds = Vec::new();
        let mut i = 0isize;
        loop {
            let entry = *list.offset(i);
            if entry.is_null() {
                break;
            }
            fds.push(((*entry).fd, (*entry).events as i16));
            i += 1;
        }

        libusb1_sys::libusb_free_pollfds(list);
        fds
    }
}
