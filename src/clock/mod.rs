//! # Clock Domain Framework
//!
//! An abstract rate-ratio source with a two-filter lock state machine and
//! a single-client notification channel, plus the PTP, raw-monotonic,
//! software-measured, receive-stream-derived, and ALSA-device
//! specializations.
//!
//! Each clock domain tracks the relationship between a local event source
//! (an audio sample clock, a received stream's media clock) and the
//! gPTP wall clock:
//!
//! ```text
//! rateRatio = elapsed gPTP time / elapsed local-clock time
//! ```
//!
//! A local clock running slower than the gPTP clock has a ratio > 1.0.

pub mod controller;

use crate::error::{AvbError, Result};
use crate::ptp::PtpProxy;
use crate::tspec::SrClass;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

/// Lock state of a clock domain's rate-ratio filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// No measurement has been taken yet.
    Init,
    /// At least one measurement was taken but the fast/slow filters have
    /// not yet agreed.
    Unlocked,
    /// Transitioning out of `Unlocked`; the next qualifying measurement
    /// promotes to `Locked`.
    Locking,
    /// The rate ratio is considered reliable.
    Locked,
}

/// Identifies which specialization a clock domain is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockDomainType {
    /// Synced to the gPTP hardware clock.
    Ptp,
    /// Synced to the raw monotonic clock.
    Raw,
    /// Driven by explicit measurements (`advance`/`updateRelative`).
    Software,
    /// Derived from a receive stream's AVTP timestamps.
    RxStream,
    /// ALSA-device specialization (event-count refresh is inert, see
    /// the crate's open-questions notes).
    Alsa,
    /// Hardware-capture specialization, nominal rate from configuration.
    HwCapture,
}

/// Per-variant extra state, matching the "tagged variant" collapse of the
/// original class hierarchy described for this crate's clock domains:
/// the variant tag drives the `on_get_event_count` hook instead of a
/// vtable dispatch, since the variant set is closed and small.
#[derive(Debug, Clone)]
enum ClockDomainKind {
    Ptp {
        start_time: u64,
        last_update: u64,
    },
    Raw {
        start_time: u64,
        last_update: u64,
        last_ptp: u64,
        last_raw: u64,
    },
    Software {
        reset_pending: bool,
        last_tsc: u64,
    },
    RxStream {
        class: SrClass,
        last_timestamp: u64,
        epoch: u32,
    },
    Alsa,
    HwCapture,
}

/// The single-implementer capability a clock domain notifies on rate-ratio
/// updates and lock-state transitions.
pub trait ClockDomainClient: Send + Sync {
    /// Called on every accepted `update_rate_ratio`.
    fn notify_update_ratio(&self, domain: &ClockDomain);
    /// Called whenever the lock state transitions.
    fn notify_update_lock_state(&self, domain: &ClockDomain);
}

const PTP_GRANULARITY_NS: u64 = 125_000;

/// Abstract rate-ratio source with a two-filter lock state machine.
///
/// Construct via one of the `new_*` constructors for the specific
/// specialization needed; the shared filter/lock machinery lives here
/// regardless of which one is used.
pub struct ClockDomain {
    kind: ClockDomainKind,
    clock_id: u32,
    time_constant: f64,
    avg_calls_per_sec: u32,
    rate_ratio_bits: AtomicU64,
    compensation: f64,
    event_count: u64,
    event_rate: u32,
    event_timestamp: u64,
    rate_ratio_slow: f64,
    rate_ratio_fast: f64,
    coeff_slow_locked: f64,
    coeff_slow_unlocked: f64,
    coeff_fast_locked: f64,
    coeff_fast_unlocked: f64,
    threshold_slow_low: f64,
    threshold_slow_high: f64,
    threshold_fast_low: f64,
    threshold_fast_high: f64,
    initial_value: f64,
    derivation_factor_unlock: f64,
    derivation_factor_long_term: f64,
    lock_state: LockState,
    reset_request: bool,
    client: Option<Weak<dyn ClockDomainClient>>,
}

impl ClockDomain {
    fn new(kind: ClockDomainKind) -> Self {
        Self {
            kind,
            clock_id: u32::MAX,
            time_constant: 0.0,
            avg_calls_per_sec: 1,
            rate_ratio_bits: AtomicU64::new(1.0_f64.to_bits()),
            compensation: 1.0,
            event_count: 0,
            event_rate: 0,
            event_timestamp: 0,
            rate_ratio_slow: 1.0,
            rate_ratio_fast: 1.0,
            coeff_slow_locked: 0.0,
            coeff_slow_unlocked: 0.0,
            coeff_fast_locked: 0.0,
            coeff_fast_unlocked: 0.0,
            threshold_slow_low: 0.0,
            threshold_slow_high: 0.0,
            threshold_fast_low: 0.0,
            threshold_fast_high: 0.0,
            initial_value: 1.0,
            derivation_factor_unlock: 1.0,
            derivation_factor_long_term: 1.0,
            lock_state: LockState::Init,
            reset_request: false,
            client: None,
        }
    }

    /// Builds the PTP-synced domain: a simulated 48 kHz counter advancing
    /// on a 125 us granularity, locked to the gPTP clock at construction.
    pub fn new_ptp() -> Self {
        let mut d = Self::new(ClockDomainKind::Ptp {
            start_time: 0,
            last_update: 0,
        });
        d.event_rate = 48_000;
        d.initial_value = 1.0;
        d.set_lock_threshold1(100_000);
        d.set_lock_threshold2(100_000);
        d.update_rate_ratio(1.0);
        d.update_rate_ratio(1.0);
        debug_assert_eq!(d.lock_state, LockState::Locked);
        d
    }

    /// Builds the raw-monotonic domain: mirrors the PTP domain but reads
    /// `CLOCK_MONOTONIC_RAW`-equivalent time and drives the base filter
    /// from the observed raw-to-PTP ratio.
    pub fn new_raw() -> Self {
        let mut d = Self::new(ClockDomainKind::Raw {
            start_time: 0,
            last_update: 0,
            last_ptp: 0,
            last_raw: 0,
        });
        d.event_rate = 48_000;
        d.initial_value = 1.0;
        d.set_lock_threshold1(100_000);
        d.set_lock_threshold2(100_000);
        d.update_rate_ratio(1.0);
        d.update_rate_ratio(1.0);
        debug_assert_eq!(d.lock_state, LockState::Locked);
        d
    }

    /// Builds the software-measured domain, configured from
    /// `clk.sw.*` configuration keys.
    pub fn new_software() -> Self {
        let mut d = Self::new(ClockDomainKind::Software {
            reset_pending: true,
            last_tsc: 0,
        });
        let tc_ms = crate::config::get_u64("clk.sw.timeconstant").unwrap_or(20_000);
        d.set_filter(tc_ms as f64 * 0.001, 1);
        let factor_long = crate::config::get_u64("clk.sw.deviation.longterm").unwrap_or(50_000) as f64 * 0.001;
        let factor_unlock = crate::config::get_u64("clk.sw.deviation.unlock").unwrap_or(500) as f64 * 0.001;
        d.set_derivation_factors(factor_long, factor_unlock);
        d.set_lock_threshold1(crate::config::get_u64("clk.sw.lock.threshold1").unwrap_or(1_000_000) as u32);
        d.set_lock_threshold2(crate::config::get_u64("clk.sw.lock.threshold2").unwrap_or(100) as u32);
        d
    }

    /// Builds a receive-stream-derived domain bound to the given SR
    /// class, configured from `clk.rx.*` configuration keys.
    pub fn new_rx_stream(class: SrClass) -> Self {
        let mut d = Self::new(ClockDomainKind::RxStream {
            class,
            last_timestamp: 0,
            epoch: 0,
        });
        let tc_ms = crate::config::get_u64("clk.rx.timeconstant").unwrap_or(100);
        d.set_filter(tc_ms as f64 * 0.001, 1);
        let factor_long = crate::config::get_u64("clk.rx.deviation.longterm").unwrap_or(10_000) as f64 * 0.001;
        let factor_unlock = crate::config::get_u64("clk.rx.deviation.unlock").unwrap_or(1_000) as f64 * 0.001;
        d.set_derivation_factors(factor_long, factor_unlock);
        d.set_lock_threshold1(crate::config::get_u64("clk.rx.lock.threshold1").unwrap_or(10_000) as u32);
        d.set_lock_threshold2(crate::config::get_u64("clk.rx.lock.threshold2").unwrap_or(100) as u32);
        d
    }

    /// Builds the ALSA-device domain. `on_get_event_count` is inert for
    /// this variant (see the crate's open-questions notes): the original
    /// hook is present but empty, so this mirrors that rather than
    /// guessing at new behavior.
    pub fn new_alsa() -> Self {
        Self::new(ClockDomainKind::Alsa)
    }

    /// Builds the hardware-capture domain with a nominal event rate from
    /// `clock.hwcapture.nominal` (0 disables the variant).
    pub fn new_hw_capture() -> Self {
        let mut d = Self::new(ClockDomainKind::HwCapture);
        d.event_rate = crate::config::get_u64("clock.hwcapture.nominal").unwrap_or(0) as u32;
        d
    }

    /// The clock domain's type tag.
    pub fn get_type(&self) -> ClockDomainType {
        match self.kind {
            ClockDomainKind::Ptp { .. } => ClockDomainType::Ptp,
            ClockDomainKind::Raw { .. } => ClockDomainType::Raw,
            ClockDomainKind::Software { .. } => ClockDomainType::Software,
            ClockDomainKind::RxStream { .. } => ClockDomainType::RxStream,
            ClockDomainKind::Alsa => ClockDomainType::Alsa,
            ClockDomainKind::HwCapture => ClockDomainType::HwCapture,
        }
    }

    /// The clock domain's unique id.
    pub fn get_clock_domain_id(&self) -> u32 {
        self.clock_id
    }

    /// Sets the clock domain's unique id.
    pub fn set_clock_domain_id(&mut self, id: u32) {
        self.clock_id = id;
    }

    /// Lock-free read of the externally visible, filtered rate ratio.
    /// May observe a value from an in-flight `update_rate_ratio` call;
    /// acceptable by design.
    pub fn get_rate_ratio(&self) -> f64 {
        f64::from_bits(self.rate_ratio_bits.load(Ordering::Relaxed))
    }

    /// The current lock state.
    pub fn get_lock_state(&self) -> LockState {
        self.lock_state
    }

    /// Returns the current event count and the PTP timestamp of its last
    /// update, after invoking the variant-specific event-count refresh
    /// hook.
    pub fn get_event_count(&mut self, ptp: &dyn PtpProxy) -> (u64, u64) {
        self.on_get_event_count(ptp);
        (self.event_count, self.event_timestamp)
    }

    /// The nominal event rate in Hz (may be 0 if not yet known).
    pub fn get_event_rate(&self) -> u32 {
        self.event_rate
    }

    fn set_event_count(&mut self, new_value: u64, timestamp: u64) {
        self.event_count = new_value;
        self.event_timestamp = timestamp;
    }

    fn increment_event_count(&mut self, increment: u64, timestamp: u64) {
        self.event_count += increment;
        self.event_timestamp = timestamp;
    }

    fn set_event_rate(&mut self, event_rate: u32) {
        self.event_rate = event_rate;
    }

    /// Requests a reset; observed (and cleared) by `get_reset_request`.
    pub fn set_reset_request(&mut self) {
        self.reset_request = true;
    }

    /// Single-read, auto-clearing reset-request flag.
    pub fn get_reset_request(&mut self) -> bool {
        let ret = self.reset_request;
        self.reset_request = false;
        ret
    }

    /// Supplies an initial rate-ratio estimate for faster lock-in, used
    /// on the first call to `update_rate_ratio`.
    pub fn set_initial_value(&mut self, init_val: f64) {
        if init_val >= 0.0 {
            self.initial_value = init_val;
        }
    }

    /// Sets the time constant (seconds) and expected call rate; derives
    /// the four filter coefficients using `coeff = exp(-1 / (tc * fs * k))`.
    /// Forces the lock state back to `Unlocked` if it was beyond that.
    pub fn set_filter(&mut self, time_constant: f64, avg_calls_per_sec: u32) {
        if time_constant < 0.0 {
            return;
        }
        self.time_constant = time_constant;
        self.avg_calls_per_sec = avg_calls_per_sec;
        let tc = time_constant * avg_calls_per_sec as f64;

        self.coeff_fast_locked = Self::calculate_coefficient(tc);
        self.coeff_fast_unlocked = Self::calculate_coefficient(tc * self.derivation_factor_unlock);
        self.coeff_slow_locked = Self::calculate_coefficient(tc * self.derivation_factor_long_term);
        self.coeff_slow_unlocked =
            Self::calculate_coefficient(tc * self.derivation_factor_long_term * self.derivation_factor_unlock);

        if matches!(self.lock_state, LockState::Locking | LockState::Locked) {
            self.lock_state = LockState::Unlocked;
            self.notify_lock_state_changed();
        }
    }

    /// Changes how the slow time constant is derived from the fast one
    /// (long-term surveillance factor) and how much the unlocked filter
    /// differs from the locked one.
    pub fn set_derivation_factors(&mut self, factor_long_term: f64, factor_unlock: f64) {
        self.derivation_factor_long_term = factor_long_term;
        self.derivation_factor_unlock = factor_unlock;
        self.set_filter(self.time_constant, self.avg_calls_per_sec);
    }

    /// Sets the fast-band symmetric lock threshold in ppm.
    pub fn set_lock_threshold1(&mut self, ppm: u32) {
        if ppm > 0 {
            self.threshold_fast_high = 1.0 + (1e-6 * ppm as f64);
            self.threshold_fast_low = 1.0 / self.threshold_fast_high;
        }
    }

    /// Sets the slow-band symmetric lock threshold in ppm.
    pub fn set_lock_threshold2(&mut self, ppm: u32) {
        if ppm > 0 {
            self.threshold_slow_high = 1.0 + (1e-6 * ppm as f64);
            self.threshold_slow_low = 1.0 / self.threshold_slow_high;
        }
    }

    fn calculate_coefficient(time_constant: f64) -> f64 {
        if time_constant == 0.0 {
            0.0
        } else {
            (-1.0 / time_constant).exp()
        }
    }

    /// Piecewise-linear drift compensation in +-1_000_000 ppm, applied as
    /// a multiplier to the filtered rate ratio.
    pub fn set_drift_compensation(&mut self, val: i32) -> Result<()> {
        if (0..=1_000_000).contains(&val) {
            self.compensation = 1.0 / (1.0 + (val as f64 * 1e-6));
        } else if (-1_000_000..0).contains(&val) {
            self.compensation = 1.0 + ((-val) as f64 * 1e-6);
        } else {
            return Err(AvbError::InvalidParam("drift compensation ppm out of range"));
        }
        Ok(())
    }

    /// Registers the clock domain's single client. Fails with
    /// `AlreadyInUse` if a different client is already registered.
    pub fn register_client(&mut self, client: Weak<dyn ClockDomainClient>) -> Result<()> {
        if self.client.is_some() {
            return Err(AvbError::AlreadyInUse);
        }
        self.client = Some(client);
        Ok(())
    }

    /// Unregisters the given client. Fails with `InvalidParam` if it does
    /// not match the registered client.
    pub fn unregister_client(&mut self, client: &Weak<dyn ClockDomainClient>) -> Result<()> {
        match &self.client {
            Some(existing) if existing.ptr_eq(client) => {
                self.client = None;
                Ok(())
            }
            _ => Err(AvbError::InvalidParam("client does not match registered client")),
        }
    }

    fn notify_ratio_updated(&self) {
        if let Some(client) = self.client.as_ref().and_then(Weak::upgrade) {
            client.notify_update_ratio(self);
        }
    }

    fn notify_lock_state_changed(&self) {
        if let Some(client) = self.client.as_ref().and_then(Weak::upgrade) {
            client.notify_update_lock_state(self);
        } else {
            log::debug!("clock domain lock state changed but no client is registered");
        }
    }

    /// Measurement entry point. Rejects `new_ratio <= 0.0` or `> 10.0`.
    ///
    /// Feeds both a fast and a slow first-order low-pass filter whose
    /// coefficients depend on current lock state, then clamps the
    /// filtered ratio to the slow band and applies the drift-compensation
    /// multiplier.
    ///
    /// The state-machine transition out of `Init`/`Unlocked` into
    /// `Locking` never promotes straight to `Locked` within the same
    /// call that performs the transition — a second, subsequent call
    /// while already in `Locking` is what evaluates the lock predicate.
    /// This keeps the `Init -> Locking -> Locked` progression exactly two
    /// calls apart for identical, already-settled inputs (matching the
    /// state-machine description and its worked scenario), even though
    /// it differs from a same-call promotion some callers might expect.
    pub fn update_rate_ratio(&mut self, new_ratio: f64) {
        if new_ratio <= 0.0 || new_ratio > 10.0 {
            return;
        }

        let locked1_high = new_ratio < (self.threshold_fast_high * self.rate_ratio_fast);
        let locked1_low = new_ratio > (self.threshold_fast_low * self.rate_ratio_fast);
        let locked1 = locked1_high && locked1_low;

        let (coeff_slow, coeff_fast) = if self.lock_state == LockState::Locked {
            (self.coeff_slow_locked, self.coeff_fast_locked)
        } else {
            (self.coeff_slow_unlocked, self.coeff_fast_unlocked)
        };
        smooth(&mut self.rate_ratio_slow, new_ratio, coeff_slow);
        smooth(&mut self.rate_ratio_fast, new_ratio, coeff_fast);

        let rate_ratio_max = self.threshold_slow_high * self.rate_ratio_slow;
        let rate_ratio_min = self.threshold_slow_low * self.rate_ratio_slow;
        let locked2 = (self.rate_ratio_fast < rate_ratio_max) && (self.rate_ratio_fast > rate_ratio_min);

        self.notify_ratio_updated();

        match self.lock_state {
            LockState::Init => {
                self.rate_ratio_slow = self.initial_value;
                self.rate_ratio_fast = self.initial_value;
                self.lock_state = LockState::Locking;
            }
            LockState::Unlocked => {
                self.lock_state = LockState::Locking;
            }
            LockState::Locking => {
                if locked1 && locked2 {
                    self.lock_state = LockState::Locked;
                    self.notify_lock_state_changed();
                }
            }
            LockState::Locked => {
                if !locked2 {
                    self.lock_state = LockState::Unlocked;
                    self.notify_lock_state_changed();
                }
            }
        }

        let rate_ratio = if self.rate_ratio_fast > rate_ratio_max {
            rate_ratio_max
        } else if self.rate_ratio_fast < rate_ratio_min {
            rate_ratio_min
        } else {
            self.rate_ratio_fast
        };
        let rate_ratio = rate_ratio * self.compensation;
        self.rate_ratio_bits.store(rate_ratio.to_bits(), Ordering::Relaxed);
    }

    fn on_get_event_count(&mut self, ptp: &dyn PtpProxy) {
        match self.kind.clone() {
            ClockDomainKind::Ptp { start_time, last_update } => {
                let now = ptp.get_ptp_time();
                let start_time = if start_time == 0 {
                    now - (now % PTP_GRANULARITY_NS)
                } else {
                    start_time
                };
                if now.saturating_sub(last_update) > PTP_GRANULARITY_NS {
                    let last_update = now - (now % PTP_GRANULARITY_NS);
                    let events = (last_update - start_time) / 62_500 * 3;
                    self.set_event_count(events, last_update);
                    self.kind = ClockDomainKind::Ptp { start_time, last_update };
                } else {
                    self.kind = ClockDomainKind::Ptp { start_time, last_update };
                }
            }
            ClockDomainKind::Raw {
                mut start_time,
                mut last_update,
                mut last_ptp,
                mut last_raw,
            } => {
                let raw_now = ptp.get_raw();
                let remain = raw_now % PTP_GRANULARITY_NS;
                if start_time == 0 {
                    start_time = raw_now - remain;
                }
                if raw_now.saturating_sub(last_update) > PTP_GRANULARITY_NS {
                    last_update = raw_now - remain;
                    let events = (last_update - start_time) / 62_500 * 3;
                    let ptp_time = ptp.raw_to_ptp(last_update);
                    let ratio = if last_raw == 0 || last_ptp == 0 {
                        1.0
                    } else {
                        (ptp.raw_to_ptp(raw_now) - last_ptp) as f64 / (raw_now - last_raw) as f64
                    };
                    self.set_event_count(events, ptp_time);
                    self.update_rate_ratio(ratio);
                }
                last_raw = raw_now;
                last_ptp = ptp.raw_to_ptp(raw_now);
                self.kind = ClockDomainKind::Raw {
                    start_time,
                    last_update,
                    last_ptp,
                    last_raw,
                };
            }
            // Software and receive-stream domains are driven explicitly via
            // advance()/update() rather than through this hook; the ALSA
            // and hw-capture variants are inert here (see open questions).
            ClockDomainKind::Software { .. }
            | ClockDomainKind::RxStream { .. }
            | ClockDomainKind::Alsa
            | ClockDomainKind::HwCapture => {}
        }
    }

    /// Software domain only: configures the filter calling rate and
    /// arms a pending reset.
    pub fn software_reset(&mut self, avg_calls_per_sec: u32) {
        if let ClockDomainKind::Software { reset_pending, .. } = &mut self.kind {
            *reset_pending = true;
            let tc = self.time_constant;
            self.set_filter(tc, avg_calls_per_sec);
        }
    }

    /// Software domain only: increments the event count and updates the
    /// rate ratio from `elapsed_tsc / elapsed` (nanoseconds).
    pub fn software_advance(&mut self, events: u64, elapsed_ns: u32, elapsed_tsc: u32, now: u64) {
        let reset_pending = matches!(self.kind, ClockDomainKind::Software { reset_pending: true, .. });
        if reset_pending {
            self.set_event_count(0, now);
            if let ClockDomainKind::Software { reset_pending, .. } = &mut self.kind {
                *reset_pending = false;
            }
        } else {
            self.increment_event_count(events, now);
            self.update_rate_ratio(elapsed_tsc as f64 / elapsed_ns as f64);
        }
        if let ClockDomainKind::Software { last_tsc, .. } = &mut self.kind {
            *last_tsc = now;
        }
    }

    /// Software domain only: updates the rate ratio by a relative error
    /// factor, used as bend feedback.
    pub fn software_update_relative(&mut self, rel_err: f64) {
        if matches!(self.kind, ClockDomainKind::Software { .. }) {
            self.update_rate_ratio(self.get_rate_ratio() * rel_err);
        }
    }

    /// Receive-stream domain only: resets from a 32-bit AVTP timestamp,
    /// reconstructing the high 32 bits from the current PTP time.
    pub fn rx_stream_reset(&mut self, timestamp32: u32, event_rate: u32, ptp: &dyn PtpProxy) {
        let class = match self.kind {
            ClockDomainKind::RxStream { class, .. } => class,
            _ => return,
        };
        let now = ptp.get_local_time();
        let mut full_ts = (now & 0xFFFF_FFFF_0000_0000) + timestamp32 as u64;
        if (timestamp32 as i64 - now as u32 as i64) > 0 && timestamp32 < now as u32 {
            full_ts += 0x1_0000_0000;
        }
        let mut calls_per_second = class.packets_per_second() as u32;
        if let Some(skip_time) = crate::config::get_u64("rx.clk.updateinterval") {
            if skip_time != 0 {
                calls_per_second = (1_000_000 + (skip_time as u32 - 1)) / skip_time as u32;
            }
        }
        let epoch = ptp.get_epoch_counter();
        if let ClockDomainKind::RxStream { last_timestamp, epoch: e, .. } = &mut self.kind {
            *last_timestamp = full_ts;
            *e = epoch;
        }
        self.set_event_count(0, full_ts);
        self.set_event_rate(event_rate);
        self.set_filter(self.time_constant, calls_per_second);
    }

    /// Receive-stream domain only: updates from a 32-bit AVTP timestamp,
    /// detecting wrap and epoch changes, advancing the event count and
    /// rate ratio by `delta_media_clock` / `delta_wall_clock`.
    pub fn rx_stream_update(
        &mut self,
        events: u64,
        timestamp32: u32,
        mut delta_media_clock: u32,
        delta_wall_clock: u32,
        ptp: &dyn PtpProxy,
    ) {
        let (mut last_timestamp, stored_epoch) = match self.kind {
            ClockDomainKind::RxStream { last_timestamp, epoch, .. } => (last_timestamp, epoch),
            _ => return,
        };

        let epoch = ptp.get_epoch_counter();
        if epoch != stored_epoch {
            delta_media_clock = 0;
            let now = ptp.get_local_time();
            let mut full_ts = (now & 0xFFFF_FFFF_0000_0000) + timestamp32 as u64;
            if (timestamp32 as i64 - now as u32 as i64) > 0 && timestamp32 < now as u32 {
                full_ts += 0x1_0000_0000;
            }
            last_timestamp = full_ts;
        } else if (last_timestamp as u32) < timestamp32 {
            last_timestamp = (last_timestamp & 0xFFFF_FFFF_0000_0000) + timestamp32 as u64;
        } else {
            last_timestamp = ((last_timestamp + 0x1_0000_0000) & 0xFFFF_FFFF_0000_0000) + timestamp32 as u64;
        }

        if let ClockDomainKind::RxStream { last_timestamp: lt, epoch: e, .. } = &mut self.kind {
            *lt = last_timestamp;
            *e = epoch;
        }

        self.increment_event_count(events, last_timestamp);
        if delta_media_clock > 0 {
            self.update_rate_ratio(delta_wall_clock as f64 / delta_media_clock as f64);
        }
    }

    /// Forces the base domain back to `Unlocked` by rerunning
    /// `set_filter` with a call rate of 1, as receive streams do after an
    /// epoch change.
    pub fn invalidate(&mut self) {
        let tc = self.time_constant;
        self.set_filter(tc, 1);
    }
}

fn smooth(state: &mut f64, new_val: f64, coeff: f64) {
    *state = (coeff * *state) + ((1.0 - coeff) * new_val);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptp::FakePtpProxy;

    #[test]
    fn s2_filter_lock_with_extreme_thresholds_and_zero_time_constant() {
        let mut d = ClockDomain::new(ClockDomainKind::Software {
            reset_pending: false,
            last_tsc: 0,
        });
        d.set_filter(0.0, 1);
        d.set_lock_threshold1(100_000);
        d.set_lock_threshold2(100_000);
        d.set_initial_value(1.0);

        d.update_rate_ratio(1.0);
        assert_eq!(d.get_lock_state(), LockState::Locking);
        d.update_rate_ratio(1.0);
        assert_eq!(d.get_lock_state(), LockState::Locked);
    }

    #[test]
    fn s3_drift_compensation_bounds() {
        let mut d = ClockDomain::new_software();
        assert!(d.set_drift_compensation(0).is_ok());
        assert_eq!(d.compensation, 1.0);
        assert!(matches!(
            d.set_drift_compensation(1_000_001),
            Err(AvbError::InvalidParam(_))
        ));
        assert!(d.set_drift_compensation(-1_000_000).is_ok());
        assert!((d.compensation - 2.0).abs() < 1e-12);
    }

    #[test]
    fn rate_ratio_rejects_out_of_range_updates() {
        let mut d = ClockDomain::new_software();
        let before = d.get_rate_ratio();
        d.update_rate_ratio(0.0);
        d.update_rate_ratio(10.5);
        assert_eq!(d.get_rate_ratio(), before);
    }

    #[test]
    fn register_client_rejects_duplicate() {
        struct Noop;
        impl ClockDomainClient for Noop {
            fn notify_update_ratio(&self, _domain: &ClockDomain) {}
            fn notify_update_lock_state(&self, _domain: &ClockDomain) {}
        }
        let mut d = ClockDomain::new_software();
        let c1 = std::sync::Arc::new(Noop);
        let c2 = std::sync::Arc::new(Noop);
        let w1: Weak<dyn ClockDomainClient> = std::sync::Arc::downgrade(&c1);
        let w2: Weak<dyn ClockDomainClient> = std::sync::Arc::downgrade(&c2);
        assert!(d.register_client(w1.clone()).is_ok());
        assert!(matches!(d.register_client(w2), Err(AvbError::AlreadyInUse)));
        assert!(d.unregister_client(&w1).is_ok());
    }

    #[test]
    fn ptp_domain_locks_on_construction() {
        let d = ClockDomain::new_ptp();
        assert_eq!(d.get_lock_state(), LockState::Locked);
        assert_eq!(d.get_event_rate(), 48_000);
    }

    #[test]
    fn ptp_event_count_advances_with_granularity() {
        let mut d = ClockDomain::new_ptp();
        let ptp = FakePtpProxy::new();
        ptp.set_ptp_time_ns(0);
        let (c0, _) = d.get_event_count(&ptp);
        assert_eq!(c0, 0);
        ptp.set_ptp_time_ns(250_000);
        let (c1, ts1) = d.get_event_count(&ptp);
        assert_eq!(c1, 12);
        assert_eq!(ts1, 250_000);
    }

    /// P1: whatever sequence of in-range measurements arrives, the
    /// externally visible rate ratio always sits inside the slow band
    /// scaled by the drift-compensation multiplier.
    #[quickcheck_macros::quickcheck]
    fn p1_rate_ratio_stays_within_slow_band(ratios: Vec<u16>) -> bool {
        let mut d = ClockDomain::new_software();
        d.set_initial_value(1.0);
        for &r in &ratios {
            // Map into (0, 10] so every sample is a legal measurement.
            let ratio = 0.01 + (r as f64 / u16::MAX as f64) * 9.99;
            d.update_rate_ratio(ratio);

            let visible = d.get_rate_ratio();
            let lo = d.threshold_slow_low * d.rate_ratio_slow * d.compensation;
            let hi = d.threshold_slow_high * d.rate_ratio_slow * d.compensation;
            let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
            // Allow floating-point slack; the invariant is "inside the
            // band", not bit-exact equality with a recomputed bound.
            if visible < lo - 1e-9 || visible > hi + 1e-9 {
                return false;
            }
        }
        true
    }
}
