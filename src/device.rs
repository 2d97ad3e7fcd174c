//! Device Record and Transfer Pool (SPEC_FULL.md §3 Device Record, §4.1 Transfer Pool).
//!
//! A `Device` is owned by an `Rc<RefCell<Device>>` for its entire life so that bulk-transfer
//! callbacks can hold a non-owning `Weak` back-reference (§9 "Cyclic references") instead of
//! keeping the device alive themselves. `Rc::new_cyclic` lets the device capture that `Weak`
//! pointer to itself at construction time, which is what every subsequent transfer submission
//! hands to `transfer.rs`.

use std::rc::{Rc, Weak};
use std::cell::RefCell;

use tracing::{debug, warn};

use crate::error::Error;
use crate::transfer::{self, BulkKind, TransferStatus};

/// Receive buffer size for each inbound bulk transfer. Not spec-mandated; large enough to
/// amortize transfer overhead for the kind of framed traffic this daemon carries.
const INBOUND_BUFFER_SIZE: usize = 16 * 1024;

/// Identifies a device by its USB topology address, stable for as long as it stays plugged
/// into the same port. Used as the opaque handle the upper layer (`DeviceSink`) is given back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub bus: u8,
    pub address: u8,
}

impl DeviceId {
    /// `(bus << 16) | address`, per §6/§8's `get_location` law.
    pub fn location(self) -> u32 {
        ((self.bus as u32) << 16) | self.address as u32
    }
}

/// The external collaborator this crate treats as an opaque sink and lifecycle notifier (§1
/// "Deliberately OUT of scope", §6 Upward interface). The multiplexing protocol, client
/// dispatch, and pair-record storage all live on the other side of this trait.
pub trait DeviceSink {
    /// Bytes received from one inbound bulk completion, in completion order.
    fn byte_sink(&self, device: DeviceId, bytes: &[u8]);

    /// Called once a device's serial is known and at least one inbound loop has started.
    /// Returning `false` rejects the device, which is disconnected immediately — the
    /// idiomatic-Rust shape of the spec's "non-zero return disconnects the device".
    fn device_added(&self, device: DeviceId) -> bool;

    /// Called during reap and on hotplug LEFT.
    fn device_removed(&self, device: DeviceId);
}

struct InboundSlot {
    raw: *mut libusb1_sys::libusb_transfer,
    buffer: Box<[u8]>,
}

struct OutboundSlot {
    id: u64,
    raw: *mut libusb1_sys::libusb_transfer,
    _buffer: Box<[u8]>,
}

/// One attached candidate device (§3 Device Record).
pub(crate) struct Device {
    pub(crate) id: DeviceId,
    pub(crate) vendor_id: u16,
    pub(crate) product_id: u16,

    pub(crate) interface_number: u8,
    pub(crate) ep_out: u8,
    pub(crate) ep_in: u8,
    pub(crate) max_packet_size_out: u16,

    pub(crate) speed_bps: u32,
    pub(crate) serial: Option<String>,

    alive: bool,
    published: bool,

    // Pool index doubles as the slot_id handed to bulk-transfer callbacks; `None` marks a
    // slot whose transfer ended and was freed without being resubmitted.
    inbound: Vec<Option<InboundSlot>>,
    outbound: Vec<OutboundSlot>,
    next_outbound_id: u64,

    handle: rusb::DeviceHandle<rusb::Context>,
    sink: Rc<dyn DeviceSink>,
    self_weak: Weak<RefCell<Device>>,
}

impl Device {
    pub(crate) fn new(
        id: DeviceId,
        vendor_id: u16,
        product_id: u16,
        handle: rusb::DeviceHandle<rusb::Context>,
        sink: Rc<dyn DeviceSink>,
    ) -> Rc<RefCell<Device>> {
        Rc::new_cyclic(|weak| {
            RefCell::new(Device {
                id,
                vendor_id,
                product_id,
                interface_number: 0,
                ep_out: 0,
                ep_in: 0,
                max_packet_size_out: 64,
                speed_bps: 0,
                serial: None,
                alive: true,
                published: false,
                inbound: Vec::new(),
                outbound: Vec::new(),
                next_outbound_id: 0,
                handle,
                sink,
                self_weak: weak.clone(),
            })
        })
    }

    pub(crate) fn handle(&self) -> &rusb::DeviceHandle<rusb::Context> {
        &self.handle
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive
    }

    pub(crate) fn mark_dead(&mut self) {
        if self.alive {
            debug!(device = ?self.id, "device marked not-alive");
        }
        self.alive = false;
    }

    /// Re-asserts liveness for a record the polling path still sees enumerated (§4.6 step 3:
    /// "existing records have their liveness re-asserted in device-add").
    pub(crate) fn revive(&mut self) {
        self.alive = true;
    }

    pub(crate) fn is_published(&self) -> bool {
        self.published
    }

    pub(crate) fn mark_published(&mut self) {
        self.published = true;
    }

    pub(crate) fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    pub(crate) fn sink_clone(&self) -> Rc<dyn DeviceSink> {
        Rc::clone(&self.sink)
    }

    /// Starts up to `count` inbound bulk transfers (§4.5 step 8), returning how many actually
    /// started. A submission failure is logged and leaves that slot empty rather than aborting
    /// the remaining attempts, so callers can proceed with reduced parallelism.
    pub(crate) fn start_inbound_loops(&mut self, count: usize) -> usize {
        let mut started = 0;
        for slot_id in 0..count {
            let mut buffer = vec![0u8; INBOUND_BUFFER_SIZE].into_boxed_slice();
            let device_weak = self.self_weak.clone();
            match transfer::submit_bulk_transfer(
                &self.handle,
                self.ep_in,
                &mut buffer,
                device_weak,
                BulkKind::Inbound,
                slot_id as u64,
            ) {
                Ok(raw) => {
                    self.inbound.push(Some(InboundSlot { raw, buffer }));
                    started += 1;
                }
                Err(err) => {
                    warn!(device = ?self.id, %err, "failed to start inbound transfer");
                    self.inbound.push(None);
                }
            }
        }
        started
    }

    /// Invoked from the bulk-transfer callback trampoline (§4.1 inbound behavior). On success,
    /// delivers bytes to the sink and resubmits the same transfer/buffer; on any other status,
    /// frees the transfer and marks the device dead.
    pub(crate) fn on_inbound_complete(&mut self, slot_id: u64, status: TransferStatus, actual_length: usize) {
        let idx = slot_id as usize;
        let raw = match self.inbound.get(idx).and_then(|s| s.as_ref()) {
            Some(slot) => slot.raw,
            None => return,
        };

        if !status.is_success() {
            debug!(device = ?self.id, ?status, slot_id, "inbound transfer ended");
            self.inbound[idx] = None;
            unsafe { transfer::free_transfer(raw) };
            self.mark_dead();
            return;
        }

        {
            let slot = self.inbound[idx].as_ref().expect("checked above");
            let take = actual_length.min(slot.buffer.len());
            self.sink.byte_sink(self.id, &slot.buffer[..take]);
        }

        let device_weak = self.self_weak.clone();
        if let Err(err) = transfer::resubmit_bulk_transfer(raw, device_weak, BulkKind::Inbound, slot_id) {
            warn!(device = ?self.id, %err, "failed to resubmit inbound transfer");
            self.inbound[idx] = None;
            unsafe { transfer::free_transfer(raw) };
            self.mark_dead();
        }
    }

    /// Invoked from the bulk-transfer callback trampoline. Outbound transfers are always
    /// one-shot: the pool entry is removed and the transfer freed regardless of status (§4.1).
    pub(crate) fn on_outbound_complete(&mut self, id: u64, status: TransferStatus) {
        let Some(pos) = self.outbound.iter().position(|slot| slot.id == id) else {
            return;
        };
        let slot = self.outbound.remove(pos);
        if !status.is_success() {
            debug!(device = ?self.id, ?status, id, "outbound transfer ended without success");
        }
        unsafe { transfer::free_transfer(slot.raw) };
    }

    /// Submits `data` as one or two outbound bulk transfers, per §4.1/§8's ZLP rule. The ZLP
    /// submission failing is logged but does not unwind the primary transfer's success.
    pub(crate) fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        self.submit_outbound(data.to_vec().into_boxed_slice())?;

        if wants_zlp(data.len(), self.max_packet_size_out) {
            if let Err(err) = self.submit_outbound(Vec::new().into_boxed_slice()) {
                warn!(device = ?self.id, %err, "failed to submit zero-length packet");
            }
        }
        Ok(())
    }

    fn submit_outbound(&mut self, mut buffer: Box<[u8]>) -> Result<(), Error> {
        let id = self.next_outbound_id;
        self.next_outbound_id += 1;
        let device_weak = self.self_weak.clone();
        let raw = transfer::submit_bulk_transfer(
            &self.handle,
            self.ep_out,
            &mut buffer,
            device_weak,
            BulkKind::Outbound,
            id,
        )?;
        self.outbound.push(OutboundSlot {
            id,
            raw,
            _buffer: buffer,
        });
        Ok(())
    }

    /// Requests cancellation of every pending transfer (§4.8 step 2). Completion still
    /// arrives through the normal callback path.
    pub(crate) fn cancel_all_transfers(&mut self) {
        for slot in self.inbound.iter().flatten() {
            transfer::cancel_transfer(slot.raw);
        }
        for slot in &self.outbound {
            transfer::cancel_transfer(slot.raw);
        }
    }

    pub(crate) fn pending_transfer_count(&self) -> usize {
        self.inbound.iter().filter(|s| s.is_some()).count() + self.outbound.len()
    }

    /// Force-frees every transfer still outstanding after the bounded cancellation wait and
    /// resets both pools to empty (§4.8 step 4). Only correct to call once cancellation has
    /// had its bounded chance to complete normally — the caller (disconnect protocol) owns
    /// that timing.
    pub(crate) fn force_cleanup(&mut self) {
        let stuck = self.pending_transfer_count();
        if stuck > 0 {
            warn!(device = ?self.id, stuck, "force-freeing transfers stuck past the disconnect deadline");
        }
        for slot in self.inbound.drain(..).flatten() {
            unsafe { transfer::force_free_transfer(slot.raw) };
        }
        for slot in self.outbound.drain(..) {
            unsafe { transfer::force_free_transfer(slot.raw) };
        }
    }

    /// Releases the claimed interface. Best-effort: disconnect must proceed regardless of
    /// whether this succeeds (§4.8 step 5).
    pub(crate) fn release_interface(&mut self) {
        if self.interface_number == 0 && self.ep_out == 0 && self.ep_in == 0 {
            // Never claimed (failed before Configuration Selector ran); nothing to release.
            return;
        }
        if let Err(err) = self.handle.release_interface(self.interface_number) {
            warn!(device = ?self.id, %err, "failed to release interface during disconnect");
        }
    }
}

/// Whether an outbound send of `data_len` bytes needs a trailing zero-length packet: exactly
/// when `data_len` is a non-zero exact multiple of the endpoint's max packet size (§4.1, §8).
pub(crate) fn wants_zlp(data_len: usize, max_packet_size_out: u16) -> bool {
    max_packet_size_out != 0 && data_len != 0 && data_len % max_packet_size_out as usize == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_packs_bus_and_address() {
        let id = DeviceId { bus: 0x12, address: 0x34 };
        assert_eq!(id.location(), 0x0012_0034);
    }

    #[test]
    fn zlp_needed_on_exact_multiple() {
        assert!(wants_zlp(1024, 512));
        assert!(wants_zlp(64, 64));
    }

    #[test]
    fn zlp_not_needed_on_partial_packet() {
        assert!(!wants_zlp(4, 64));
        assert!(!wants_zlp(1023, 512));
    }

    #[test]
    fn zlp_not_needed_for_empty_send() {
        assert!(!wants_zlp(0, 64));
    }

    #[test]
    fn zlp_not_needed_when_max_packet_size_unknown() {
        assert!(!wants_zlp(512, 0));
    }
}
