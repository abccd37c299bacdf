// Background lease renewal: observes the session registry every tick and
// drives the protection client so the lease stays gap-free while critical
// work is in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::client::ProtectionClient;
use crate::config::ProtectionConfig;
use crate::error::Result;
use crate::lease::{LoopPhase, ProtectionLease};
use crate::registry::SessionRegistry;

/// Tick failures in a row before the loop escalates its log level.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Periodic task that acquires, extends and releases the protection lease.
///
/// The registry lock and the lease lock are only held for snapshots and
/// updates; remote calls run without either lock. The retry budget inside
/// the client is bounded well below `check_interval`, so a tick can never
/// stall into the next.
pub struct LeaseRenewalLoop {
    config: ProtectionConfig,
    registry: Arc<SessionRegistry>,
    client: Arc<ProtectionClient>,
    lease: Arc<Mutex<ProtectionLease>>,
    /// Set by voluntary shutdown: blocks new acquisitions, not extensions.
    reacquire_blocked: Arc<AtomicBool>,
}

impl LeaseRenewalLoop {
    pub fn new(
        config: ProtectionConfig,
        registry: Arc<SessionRegistry>,
        client: Arc<ProtectionClient>,
        lease: Arc<Mutex<ProtectionLease>>,
        reacquire_blocked: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            registry,
            client,
            lease,
            reacquire_blocked,
        }
    }

    pub async fn run(self) {
        info!(
            check_interval_secs = self.config.check_interval.as_secs(),
            extension_interval_secs = self.config.extension_interval.as_secs(),
            buffer_secs = self.config.protection_buffer.as_secs(),
            gap_safety_margin_secs = self.config.gap_safety_margin().as_secs(),
            max_protection_secs = self.config.max_protection_duration.as_secs(),
            "lease renewal loop started"
        );

        let mut ticker = interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut phase = LoopPhase::Idle;
        let mut consecutive_failures = 0u32;

        loop {
            ticker.tick().await;
            match self.tick(&mut phase).await {
                Ok(()) => {
                    debug!(phase = ?phase, "renewal tick complete");
                    consecutive_failures = 0;
                }
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        error!(
                            failures = consecutive_failures,
                            error = %e,
                            "renewal loop failing repeatedly; the lease may lapse and the process become killable"
                        );
                    } else {
                        warn!(failures = consecutive_failures, error = %e, "renewal tick failed");
                    }
                }
            }
        }
    }

    async fn tick(&self, phase: &mut LoopPhase) -> Result<()> {
        let now = Instant::now();
        let active = self.registry.active_count();
        let snapshot = self.lease.lock().clone();

        // The valve latch clears once the registry has drained, so future
        // work gets protection again.
        if active == 0 && snapshot.safety_valve_fired {
            self.lease.lock().safety_valve_fired = false;
            debug!("safety valve latch cleared; registry drained");
        }

        if snapshot.enabled {
            if let Some(age) = snapshot.age(now) {
                if age > self.config.max_protection_duration {
                    // The valve exists to break a stuck occupancy; a drained
                    // lease goes through the ordinary release below.
                    if active > 0 {
                        return self.fire_safety_valve(phase, age.as_secs(), active).await;
                    }
                } else if age > self.config.max_protection_duration.mul_f64(0.8) {
                    warn!(
                        age_secs = age.as_secs(),
                        max_secs = self.config.max_protection_duration.as_secs(),
                        "protection approaching maximum duration"
                    );
                }
            }
        }

        if active > 0 && !snapshot.enabled {
            if snapshot.safety_valve_fired {
                debug!("protection suppressed until sessions drain; safety valve latched");
                return Ok(());
            }
            if self.reacquire_blocked.load(Ordering::SeqCst) {
                debug!("protection re-acquisition blocked; voluntary shutdown in progress");
                return Ok(());
            }
            return self.acquire(phase, now, active).await;
        }

        if active > 0 && snapshot.needs_extension(now, self.config.protection_buffer) {
            return self.extend(phase, now, active).await;
        }

        if active == 0 && snapshot.enabled {
            // Anti-flap: hold a fresh lease for the minimum window before
            // releasing it.
            if let Some(age) = snapshot.age(now) {
                if age < self.config.min_protection_time {
                    debug!(
                        held_secs = age.as_secs(),
                        min_secs = self.config.min_protection_time.as_secs(),
                        "holding protection for the minimum window"
                    );
                    return Ok(());
                }
            }
            return self.release(phase).await;
        }

        Ok(())
    }

    fn window_hint(&self) -> std::time::Duration {
        self.config.extension_interval + self.config.protection_buffer
    }

    async fn acquire(&self, phase: &mut LoopPhase, now: Instant, active: usize) -> Result<()> {
        *phase = LoopPhase::Renewing;
        self.lease.lock().last_renewal_attempt = Some(now);

        let hint = self.window_hint();
        match self.client.enable(hint).await {
            Ok(confirmed) => {
                let granted = confirmed.unwrap_or(hint);
                self.lease.lock().mark_enabled(now, now + granted);
                info!(
                    sessions = active,
                    expires_in_secs = granted.as_secs(),
                    advisory = self.client.is_advisory(),
                    "protection enabled; critical sessions active"
                );
                *phase = LoopPhase::Protected;
                Ok(())
            }
            Err(e) => {
                *phase = LoopPhase::Idle;
                Err(e)
            }
        }
    }

    async fn extend(&self, phase: &mut LoopPhase, now: Instant, active: usize) -> Result<()> {
        *phase = LoopPhase::Renewing;
        self.lease.lock().last_renewal_attempt = Some(now);

        let hint = self.window_hint();
        match self.client.enable(hint).await {
            Ok(confirmed) => {
                let granted = confirmed.unwrap_or(hint);
                self.lease.lock().mark_enabled(now, now + granted);
                debug!(
                    sessions = active,
                    expires_in_secs = granted.as_secs(),
                    "protection extended before expiry"
                );
                *phase = LoopPhase::Protected;
                Ok(())
            }
            Err(e) => {
                // Still inside the buffer window; the next tick retries
                // before the lease can lapse.
                *phase = LoopPhase::Protected;
                Err(e)
            }
        }
    }

    async fn release(&self, phase: &mut LoopPhase) -> Result<()> {
        *phase = LoopPhase::Releasing;
        if let Err(e) = self.client.disable().await {
            // Only observability suffers: the orchestrator-side lease lapses
            // naturally at expiry.
            warn!(error = %e, "protection release failed; lease will lapse at expiry");
        }
        self.lease.lock().mark_released();
        info!("protection released; no critical sessions remain");
        *phase = LoopPhase::Idle;
        Ok(())
    }

    async fn fire_safety_valve(
        &self,
        phase: &mut LoopPhase,
        age_secs: u64,
        active: usize,
    ) -> Result<()> {
        warn!(
            age_secs,
            max_secs = self.config.max_protection_duration.as_secs(),
            sessions = active,
            event = "safety_valve",
            "maximum protection duration exceeded; force-releasing lease with sessions still active"
        );
        *phase = LoopPhase::Releasing;
        if let Err(e) = self.client.disable().await {
            warn!(error = %e, "disable after safety valve failed; lease will lapse at expiry");
        }
        {
            let mut lease = self.lease.lock();
            lease.mark_released();
            lease.safety_valve_fired = true;
        }
        *phase = LoopPhase::Idle;
        Ok(())
    }
}
