//! # gPTP Time Source
//!
//! A thin abstraction over the 802.1AS time base, mirroring the PTP
//! daemon library the clock domains and stream state machines consult
//! for "now" instead of calling the OS clock directly.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Access to the gPTP-synchronized time base and its relationship to the
/// system/raw-monotonic clocks.
///
/// `get_ptp_time` and `get_local_time` are distinct hooks in the
/// original daemon library (one inline-delegates to the other) kept
/// separate here so a specialization can override only one if it needs
/// to; the default impl makes `get_ptp_time` delegate to
/// `get_local_time`, matching that relationship.
pub trait PtpProxy: Send + Sync {
    /// Raw CPU timestamp counter, in an implementation-defined tick rate.
    fn get_tsc(&self) -> u64;
    /// Raw monotonic clock reading, in nanoseconds.
    fn get_raw(&self) -> u64;
    /// gPTP-synchronized local time, in nanoseconds.
    fn get_local_time(&self) -> u64;
    /// gPTP time; defaults to `get_local_time`.
    fn get_ptp_time(&self) -> u64 {
        self.get_local_time()
    }
    /// Converts a system-clock timestamp to the gPTP timeline.
    fn sys_to_ptp(&self, sys_time: u64) -> u64;
    /// Converts a raw-monotonic timestamp to the gPTP timeline.
    fn raw_to_ptp(&self, raw_time: u64) -> u64;
    /// Converts a gPTP timestamp back to the system-clock timeline.
    fn ptp_to_sys(&self, ptp_time: u64) -> u64;
    /// Counts how many times the gPTP clock has stepped (vs. slewed)
    /// since the proxy was created; a step invalidates receive-stream
    /// clock domains' accumulated state.
    fn get_epoch_counter(&self) -> u32;
    /// Whether the gPTP daemon currently reports a synchronized clock.
    fn is_ptp_ready(&self) -> bool;
    /// Local time, bypassing any caching the implementation performs for
    /// `get_local_time`.
    fn get_real_local_time(&self) -> u64 {
        self.get_local_time()
    }
}

/// Production `PtpProxy` backed by the system clock, offset by a fixed
/// epoch established at construction. The real daemon library instead
/// reads shared memory maintained by `ptp4l`/`gptp2d`; this crate's
/// NIC/daemon binding is out of scope, so this implementation treats the
/// system clock as already gPTP-synchronized, which is accurate once the
/// external daemon has converged.
pub struct SystemPtpProxy {
    epoch: AtomicU32,
}

impl SystemPtpProxy {
    /// Builds a proxy with epoch counter 0.
    pub fn new() -> Self {
        Self {
            epoch: AtomicU32::new(0),
        }
    }

    fn now_ns() -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        now.as_nanos() as u64
    }

    /// Records a clock step, incrementing the epoch counter so that
    /// receive-stream clock domains invalidate their accumulated state.
    pub fn record_step(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }
}

impl Default for SystemPtpProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl PtpProxy for SystemPtpProxy {
    fn get_tsc(&self) -> u64 {
        Self::now_ns()
    }

    fn get_raw(&self) -> u64 {
        Self::now_ns()
    }

    fn get_local_time(&self) -> u64 {
        Self::now_ns()
    }

    fn sys_to_ptp(&self, sys_time: u64) -> u64 {
        sys_time
    }

    fn raw_to_ptp(&self, raw_time: u64) -> u64 {
        raw_time
    }

    fn ptp_to_sys(&self, ptp_time: u64) -> u64 {
        ptp_time
    }

    fn get_epoch_counter(&self) -> u32 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn is_ptp_ready(&self) -> bool {
        true
    }
}

/// Test double with a fully controllable, independently steppable clock.
/// Used throughout the clock-domain and stream test suites to exercise
/// exact timestamp scenarios without wall-clock flakiness.
pub struct FakePtpProxy {
    ptp_ns: AtomicU64,
    raw_ns: AtomicU64,
    epoch: AtomicU32,
    ready: std::sync::atomic::AtomicBool,
}

impl FakePtpProxy {
    /// Builds a fake proxy with all clocks at 0 and `is_ptp_ready() ==
    /// true`.
    pub fn new() -> Self {
        Self {
            ptp_ns: AtomicU64::new(0),
            raw_ns: AtomicU64::new(0),
            epoch: AtomicU32::new(0),
            ready: std::sync::atomic::AtomicBool::new(true),
        }
    }

    /// Sets the gPTP time directly.
    pub fn set_ptp_time_ns(&self, ns: u64) {
        self.ptp_ns.store(ns, Ordering::SeqCst);
    }

    /// Sets the raw-monotonic time directly.
    pub fn set_raw_time_ns(&self, ns: u64) {
        self.raw_ns.store(ns, Ordering::SeqCst);
    }

    /// Forces `is_ptp_ready()` to return the given value.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Bumps the epoch counter, simulating a gPTP clock step.
    pub fn step_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }
}

impl Default for FakePtpProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl PtpProxy for FakePtpProxy {
    fn get_tsc(&self) -> u64 {
        self.raw_ns.load(Ordering::SeqCst)
    }

    fn get_raw(&self) -> u64 {
        self.raw_ns.load(Ordering::SeqCst)
    }

    fn get_local_time(&self) -> u64 {
        self.ptp_ns.load(Ordering::SeqCst)
    }

    fn sys_to_ptp(&self, sys_time: u64) -> u64 {
        sys_time
    }

    fn raw_to_ptp(&self, raw_time: u64) -> u64 {
        raw_time
    }

    fn ptp_to_sys(&self, ptp_time: u64) -> u64 {
        ptp_time
    }

    fn get_epoch_counter(&self) -> u32 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn is_ptp_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_proxy_reports_set_values() {
        let ptp = FakePtpProxy::new();
        ptp.set_ptp_time_ns(42);
        assert_eq!(ptp.get_ptp_time(), 42);
        assert_eq!(ptp.get_local_time(), 42);
    }

    #[test]
    fn epoch_counter_steps() {
        let ptp = FakePtpProxy::new();
        assert_eq!(ptp.get_epoch_counter(), 0);
        ptp.step_epoch();
        assert_eq!(ptp.get_epoch_counter(), 1);
    }
}
