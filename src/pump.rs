//! Event Pump (SPEC_FULL.md §4.7).
//!
//! The single dispatcher the owning process drives: it hands out the fd set and timeout the
//! owner's own `poll(2)`/`select(2)` loop needs, and funnels every USB completion — control,
//! bulk, and hotplug alike — back through `rusb::Context::handle_events_timeout`. All callbacks
//! in this crate run from inside `process`/`process_for`, on whatever thread calls them (§5
//! assumes exactly one).

use std::time::{Duration, Instant};

use crate::config::Config;
use crate::discovery::{Discovery, SharedState};
use crate::error::Error;
use crate::registry::Registry;
use crate::transfer;

/// Upper bound handed back from `get_timeout` when the polling path is disabled (`autodiscover`
/// off, or hotplug active) — large enough that the owner's poll loop effectively blocks on fds
/// alone, matching §4.7 "capped at a large value when polling is disabled".
pub(crate) const NO_POLL_TIMEOUT_MS: u64 = 60_000;

pub(crate) struct Pump {
    next_poll_at: Instant,
}

impl Pump {
    pub(crate) fn new(poll_interval: Duration) -> Self {
        Pump {
            next_poll_at: Instant::now() + poll_interval,
        }
    }

    /// Resets the polling deadline, e.g. after a forced [`discover()`](crate::UsbCore::discover)
    /// call so the next scheduled poll doesn't fire redundantly right away.
    pub(crate) fn reset_deadline(&mut self, poll_interval: Duration) {
        self.next_poll_at = Instant::now() + poll_interval;
    }

    /// Descriptors the owner must fold into its own poll set (§4.7, §6 `get_fds`). Re-queried
    /// every call rather than cached: libusb can add or remove fds as devices are opened and
    /// closed, and the spec expects a fresh set each time. `rusb`'s safe `Context` doesn't
    /// expose `libusb_get_pollfds`, so this goes through `transfer::poll_fds`'s raw binding.
    pub(crate) fn get_fds(&self, context: &rusb::Context) -> Vec<(std::os::raw::c_int, i16)> {
        transfer::poll_fds(context)
    }

    /// The minimum of (time remaining until the next scheduled poll) and a library-reported
    /// timeout, capped at [`NO_POLL_TIMEOUT_MS`] when polling is disabled (§4.7). `rusb`'s safe
    /// surface does not expose libusb's own next-timeout query, so the library side of the
    /// minimum is represented by this crate's own cap rather than a raw FFI call — the one
    /// `unsafe` boundary this crate takes on lives entirely in `src/transfer.rs` (§9, §10.1).
    pub(crate) fn get_timeout_ms(&self, polling_active: bool) -> u64 {
        if !polling_active {
            return NO_POLL_TIMEOUT_MS;
        }
        let remaining = self.next_poll_at.saturating_duration_since(Instant::now());
        remaining.as_millis().min(NO_POLL_TIMEOUT_MS as u128) as u64
    }

    /// Dispatches pending USB events with a zero timeout, reaps dead devices, and — if
    /// `autodiscover` is on and the polling deadline has elapsed — runs one enumeration pass
    /// (§4.7 `process`).
    pub(crate) fn process(
        &mut self,
        context: &rusb::Context,
        discovery: &mut Discovery,
        shared: &mut SharedState,
    ) -> Result<(), Error> {
        let _ = context.handle_events_timeout(Some(Duration::ZERO));
        shared.registry.reap(context, &shared.config);

        if shared.autodiscover && !discovery.hotplug_active() && Instant::now() >= self.next_poll_at {
            let outcome = discovery.poll_once(context, shared);
            self.next_poll_at = Instant::now() + shared.config.poll_interval;
            outcome?;
        }

        Ok(())
    }

    /// Blocks up to `ms` milliseconds dispatching events, reaping dead devices after each wake
    /// (§4.7 `process_for`). Does not itself run the polling-path enumeration — only `process`
    /// checks the poll deadline.
    pub(crate) fn process_for(&mut self, ms: u64, context: &rusb::Context, registry: &mut Registry, config: &Config) {
        let deadline = Instant::now() + Duration::from_millis(ms);
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let _ = context.handle_events_timeout(Some(deadline - now));
            registry.reap(context, config);
        }
    }
}
