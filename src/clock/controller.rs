//! # Clock Controller
//!
//! Compares a master and a slave clock domain and drives a hardware PLL
//! through a [`ClockDriver`] plugin so the slave tracks the master's
//! rate and phase.
//!
//! The controller is itself a [`super::ClockDomainClient`]: it registers
//! with both domains, wakes its control loop whenever the slave domain
//! reports a new rate-ratio measurement, and falls back to `Unlocked`
//! whenever either domain's lock state regresses.

use crate::clock::{ClockDomain, ClockDomainClient, LockState};
use crate::error::{AvbError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const WAIT_MIN_US: u64 = 1_000;

/// Lock progression of the [`ClockController`]'s control loop, distinct
/// from a [`LockState`] ([`LockState`] belongs to a single clock
/// domain's rate-ratio filter).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockControllerLockState {
    /// First iteration; only seeds the loop's last-sample variables.
    Init,
    /// Waiting for the master domain to lock.
    Unlocked,
    /// Master locked; steering the slave's rate to match.
    LockingRate,
    /// Rate matched; steering phase toward zero deviation.
    LockingPhase,
    /// Phase deviation has settled under one sample.
    Locked,
    /// Debug-only: PLL correction forced to unity regardless of state.
    Off,
}

/// A hardware PLL or software resampler the controller steers via
/// relative rate corrections.
///
/// `update_relative` receives a `param` opaque to the controller (the
/// value passed to [`ClockController::init`]) and a correction factor
/// close to `1.0`; `correction > 1.0` means the slave clock should run
/// faster.
pub trait ClockDriver: Send + Sync {
    /// Prepares the driver to receive corrections for `param`.
    fn init(&self, param: u32) -> Result<()>;
    /// Releases any resources acquired in `init`.
    fn cleanup(&self);
    /// Applies a relative rate correction.
    fn update_relative(&self, param: u32, correction: f64) -> Result<()>;
}

/// No-op driver used in tests and whenever no hardware PLL is attached;
/// records the last correction it was asked to apply.
pub struct NullClockDriver {
    last_correction: Mutex<f64>,
}

impl NullClockDriver {
    /// Builds a driver reporting `1.0` until a correction is applied.
    pub fn new() -> Self {
        Self {
            last_correction: Mutex::new(1.0),
        }
    }

    /// The most recent correction passed to `update_relative`.
    pub fn last_correction(&self) -> f64 {
        *self.last_correction.lock()
    }
}

impl Default for NullClockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockDriver for NullClockDriver {
    fn init(&self, _param: u32) -> Result<()> {
        Ok(())
    }

    fn cleanup(&self) {}

    fn update_relative(&self, _param: u32, correction: f64) -> Result<()> {
        *self.last_correction.lock() = correction;
        Ok(())
    }
}

struct LoopState {
    lock_state: ClockControllerLockState,
    last_count_master: i64,
    last_count_slave: i64,
    last_time_master: i64,
    last_time_slave: i64,
    offset: i64,
    hold_off: u64,
    lock_count: u64,
    last_dev: f64,
    buf_dev: f64,
    buf_rate: f64,
}

impl LoopState {
    fn new() -> Self {
        Self {
            lock_state: ClockControllerLockState::Init,
            last_count_master: 0,
            last_count_slave: 0,
            last_time_master: 0,
            last_time_slave: 0,
            offset: 0,
            hold_off: 0,
            lock_count: 0,
            last_dev: 0.0,
            buf_dev: 0.0,
            buf_rate: 0.0,
        }
    }
}

/// Tunable control-loop coefficients, all overridable via
/// `clock.ctrl.*` configuration keys.
struct Tunables {
    hold_off_time: u64,
    gain: f64,
    coeff1: f64,
    coeff2: f64,
    coeff3: f64,
    coeff4: f64,
    lock_count_max: u64,
    lock_threshold: f64,
}

impl Tunables {
    fn from_config() -> Self {
        // coeff1-4 are stored in the registry scaled by 1e6 (ppm-style
        // fixed point), matching the original's int64 config value times 1e-6.
        let coeff1 = crate::config::get_u64("clock.ctrl.coeff1").unwrap_or(500_000) as f64 * 1e-6;
        // coeff2 auto-adapts to 1 - coeff1 so the filter stays gain-neutral
        // unless the caller explicitly overrides it.
        let coeff2 = match crate::config::get_u64("clock.ctrl.coeff2") {
            Some(v) => v as f64 * 1e-6,
            None => 1.0 - coeff1,
        };
        let coeff3 = crate::config::get_u64("clock.ctrl.coeff3").unwrap_or(800_000) as f64 * 1e-6;
        let coeff4 = crate::config::get_u64("clock.ctrl.coeff4").unwrap_or(0) as f64 * 1e-6;
        Self {
            hold_off_time: crate::config::get_u64("clock.ctrl.holdoff").unwrap_or(60_000) * 1_000,
            gain: crate::config::get_u64("clock.ctrl.gain").unwrap_or(100) as f64 * 1e-9,
            coeff1,
            coeff2,
            coeff3,
            coeff4,
            lock_count_max: crate::config::get_u64("clock.ctrl.lockcount").unwrap_or(5),
            lock_threshold: crate::config::get_u64("clock.ctrl.lockthreshold").unwrap_or(2) as f64 * 1e-6,
        }
    }
}

struct Shared {
    master: Arc<Mutex<ClockDomain>>,
    slave: Arc<Mutex<ClockDomain>>,
    master_id: u32,
    slave_id: u32,
    driver: Arc<dyn ClockDriver>,
    driver_param: u32,
    engage: bool,
    upper_limit: f64,
    lower_limit: f64,
    notify: Notify,
    end_flag: AtomicBool,
    loop_state: Mutex<LoopState>,
}

impl ClockDomainClient for Shared {
    fn notify_update_ratio(&self, domain: &ClockDomain) {
        if domain.get_clock_domain_id() == self.slave_id {
            self.notify.notify_one();
        }
    }

    fn notify_update_lock_state(&self, domain: &ClockDomain) {
        let id = domain.get_clock_domain_id();
        if id != self.master_id && id != self.slave_id {
            log::error!("clock controller received notification from an unregistered domain");
            return;
        }
        if domain.get_lock_state() != LockState::Locked {
            let mut state = self.loop_state.lock();
            if !matches!(state.lock_state, ClockControllerLockState::Init | ClockControllerLockState::Unlocked) {
                state.lock_state = ClockControllerLockState::Unlocked;
            }
        }
    }
}

/// Drives a hardware PLL so a slave clock domain tracks a master clock
/// domain's rate and phase.
pub struct ClockController {
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl ClockController {
    /// Registers with `master`/`slave`, spawns the control-loop task, and
    /// returns once registration succeeds. `driver_param` is opaque and
    /// forwarded verbatim to `driver.update_relative`.
    pub fn init(
        master: Arc<Mutex<ClockDomain>>,
        slave: Arc<Mutex<ClockDomain>>,
        driver: Arc<dyn ClockDriver>,
        driver_param: u32,
        ptp: Arc<dyn crate::ptp::PtpProxy>,
    ) -> Result<Self> {
        let mut wait_us = crate::config::get_u64("clock.ctrl.wait").unwrap_or(25_000);
        if wait_us < WAIT_MIN_US {
            log::warn!("ignored configured wait period {} us, using {} us", wait_us, WAIT_MIN_US);
            wait_us = WAIT_MIN_US;
        }
        let engage = crate::config::get_u64("clock.ctrl.engage").unwrap_or(1) != 0;
        if !engage {
            log::warn!("clock driver disengaged");
        }

        let (master_id, slave_id) = {
            let m = master.lock();
            let s = slave.lock();
            (m.get_clock_domain_id(), s.get_clock_domain_id())
        };

        driver.init(driver_param)?;

        let shared = Arc::new(Shared {
            master: master.clone(),
            slave: slave.clone(),
            master_id,
            slave_id,
            driver,
            driver_param,
            engage,
            upper_limit: 1.0001,
            lower_limit: 1.0 / 1.0001,
            notify: Notify::new(),
            end_flag: AtomicBool::new(false),
            loop_state: Mutex::new(LoopState::new()),
        });

        {
            let client: std::sync::Weak<dyn ClockDomainClient> = Arc::downgrade(&shared) as _;
            slave.lock().register_client(client.clone()).map_err(|_| AvbError::AlreadyInUse)?;
            if let Err(e) = master.lock().register_client(client) {
                let _ = slave.lock().unregister_client(&(Arc::downgrade(&shared) as std::sync::Weak<dyn ClockDomainClient>));
                return Err(e);
            }
        }

        let tunables = Tunables::from_config();
        let wait = Duration::from_micros(wait_us);
        let run_shared = shared.clone();
        let task = tokio::task::spawn(async move {
            run_loop(run_shared, ptp, tunables, wait).await;
        });

        Ok(Self {
            shared,
            task: Some(task),
        })
    }

    /// Stops the control loop and unregisters from both clock domains.
    pub async fn cleanup(&mut self) {
        self.shared.end_flag.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        let client: std::sync::Weak<dyn ClockDomainClient> = Arc::downgrade(&self.shared) as _;
        let _ = self.shared.slave.lock().unregister_client(&client);
        let _ = self.shared.master.lock().unregister_client(&client);
        self.shared.driver.cleanup();
    }
}

async fn run_loop(shared: Arc<Shared>, ptp: Arc<dyn crate::ptp::PtpProxy>, t: Tunables, wait: Duration) {
    loop {
        shared.notify.notified().await;
        if shared.end_flag.load(Ordering::SeqCst) {
            break;
        }

        let (master_count, master_time) = shared.master.lock().get_event_count(ptp.as_ref());
        let (slave_count, slave_time) = shared.slave.lock().get_event_count(ptp.as_ref());
        let master_count = master_count as i64;
        let slave_count = slave_count as i64;
        let master_time = master_time as i64;
        let slave_time = slave_time as i64;

        let mut state = shared.loop_state.lock();

        let delta_tm = master_time - state.last_time_master;
        let delta_ts = slave_time - state.last_time_slave;
        let time_offset = (master_time - slave_time) as f64;

        if (slave_time - state.last_time_slave) < 0 {
            shared.master.lock().set_reset_request();
            state.hold_off = 0;
        }

        let mut master_rate = 0.0;
        if delta_tm == 0 {
            state.lock_state = ClockControllerLockState::Unlocked;
        } else {
            master_rate = (master_count - state.last_count_master) as f64 / delta_tm as f64;
        }

        let mut slave_rate = 0.0;
        if delta_ts == 0 {
            state.lock_state = ClockControllerLockState::Unlocked;
        } else {
            slave_rate = (slave_count - state.last_count_slave) as f64 / delta_ts as f64;
        }

        let deviation = ((slave_count - master_count) - state.offset) as f64 + (time_offset * master_rate);
        let mut correction0 = 1.0;

        match state.lock_state {
            ClockControllerLockState::Init => {
                state.lock_state = ClockControllerLockState::Unlocked;
            }
            ClockControllerLockState::Unlocked => {
                if shared.master.lock().get_lock_state() == LockState::Locked {
                    state.lock_count = 0;
                    state.lock_state = ClockControllerLockState::LockingRate;
                    state.hold_off = 0;
                }
            }
            ClockControllerLockState::LockingRate
            | ClockControllerLockState::LockingPhase
            | ClockControllerLockState::Locked => {
                let was_locking_rate = state.lock_state == ClockControllerLockState::LockingRate;
                let mut promoted_this_cycle = false;

                if was_locking_rate {
                    let master_filtered = shared.master.lock().get_rate_ratio();
                    let slave_filtered = shared.slave.lock().get_rate_ratio();
                    if (master_filtered - slave_filtered).abs() < t.lock_threshold {
                        state.lock_count += 1;
                        if state.lock_count > t.lock_count_max {
                            state.lock_count = 0;
                            state.lock_state = ClockControllerLockState::LockingPhase;
                            state.offset = slave_count - master_count + (time_offset * master_rate) as i64;
                            state.last_dev = 0.0;
                            promoted_this_cycle = true;
                        }
                    } else {
                        state.lock_count = 0;
                    }
                }

                if promoted_this_cycle {
                    // the exact cycle that promotes LockingRate -> LockingPhase
                    // skips correction entirely: `deviation` above was computed
                    // against the stale pre-promotion `offset`, so applying it
                    // here would be a spurious spike.
                } else {
                    if (master_time as u64 > state.hold_off)
                        || ((master_time as u64) < state.hold_off.saturating_sub(t.hold_off_time))
                    {
                        correction0 = if slave_rate != 0.0 { master_rate / slave_rate } else { 1.0 };
                        state.hold_off = master_time as u64 + t.hold_off_time;
                    }

                    if state.lock_state >= ClockControllerLockState::LockingPhase {
                        let rate = deviation - state.last_dev;
                        state.last_dev = deviation;

                        state.buf_dev = (t.coeff1 * -deviation) + (t.coeff2 * state.buf_dev);
                        state.buf_rate = (t.coeff3 * -rate) + (t.coeff4 * state.buf_rate);

                        correction0 += (state.buf_dev + state.buf_rate) * t.gain;

                        if state.lock_state == ClockControllerLockState::LockingPhase && deviation.abs() < 1.0 {
                            state.lock_state = ClockControllerLockState::Locked;
                        }

                        if deviation.abs() > 10.0 {
                            state.lock_count = 0;
                            correction0 = 1.0;
                            state.lock_state = ClockControllerLockState::LockingRate;
                            state.hold_off = 0;
                        }
                    }
                }
            }
            ClockControllerLockState::Off => {
                correction0 = 1.0;
            }
        }

        state.last_count_master = master_count;
        state.last_count_slave = slave_count;
        state.last_time_master = master_time;
        state.last_time_slave = slave_time;

        let mut correction = correction0;
        if correction > shared.upper_limit {
            correction = shared.upper_limit;
        }
        if correction < shared.lower_limit {
            correction = shared.lower_limit;
        }

        drop(state);

        if shared.engage && correction != 1.0 {
            if let Err(e) = shared.driver.update_relative(shared.driver_param, correction) {
                log::warn!("clock driver rejected correction {}: {}", correction, e);
            }
        }

        tokio::time::sleep(wait).await;
    }
}

impl PartialOrd for ClockControllerLockState {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        fn rank(s: &ClockControllerLockState) -> u8 {
            match s {
                ClockControllerLockState::Init => 0,
                ClockControllerLockState::Unlocked => 1,
                ClockControllerLockState::LockingRate => 2,
                ClockControllerLockState::LockingPhase => 3,
                ClockControllerLockState::Locked => 4,
                ClockControllerLockState::Off => 5,
            }
        }
        rank(self).partial_cmp(&rank(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockDomain;
    use crate::ptp::FakePtpProxy;

    #[tokio::test]
    async fn init_registers_with_both_domains_and_spawns_loop() {
        let mut master = ClockDomain::new_ptp();
        master.set_clock_domain_id(1);
        let mut slave = ClockDomain::new_software();
        slave.set_clock_domain_id(2);

        let master = Arc::new(Mutex::new(master));
        let slave = Arc::new(Mutex::new(slave));
        let driver: Arc<dyn ClockDriver> = Arc::new(NullClockDriver::new());
        let ptp: Arc<dyn crate::ptp::PtpProxy> = Arc::new(FakePtpProxy::new());

        let mut controller = ClockController::init(master, slave, driver, 0, ptp).unwrap();
        controller.cleanup().await;
    }

    #[test]
    fn lock_state_ordering_matches_progression() {
        assert!(ClockControllerLockState::LockingPhase > ClockControllerLockState::LockingRate);
        assert!(ClockControllerLockState::Locked > ClockControllerLockState::LockingPhase);
    }
}
