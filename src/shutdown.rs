// The exit sequence: one shutdown request per process lifetime, a bounded
// drain wait sized by the termination reason, then best-effort release.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::client::ProtectionClient;
use crate::config::ProtectionConfig;
use crate::registry::SessionRegistry;
use crate::SessionId;

/// Why termination was requested. Ordering is escalation order: a later
/// trigger may harden the reason but never soften it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownReason {
    VoluntarySelfRequest,
    OperatorRequest,
    PreemptionNotice,
}

impl ShutdownReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ShutdownReason::VoluntarySelfRequest => "voluntary",
            ShutdownReason::OperatorRequest => "operator",
            ShutdownReason::PreemptionNotice => "preemption",
        }
    }
}

/// The singleton in-flight decision to terminate.
#[derive(Debug, Clone)]
pub struct ShutdownRequest {
    pub reason: ShutdownReason,
    pub requested_at: Instant,
    pub drain_deadline: Instant,
}

/// How the process should report its exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// All critical sessions drained before the deadline.
    CleanDrain,
    /// The drain deadline was hit with sessions still active.
    DegradedDrain,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::CleanDrain => 0,
            ExitStatus::DegradedDrain => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Running,
    DrainRequested,
    Draining,
    Terminating,
    Terminated,
}

/// Orchestrates the exit sequence. Runs concurrently with the renewal loop,
/// which keeps protecting until the drain completes or the safety valve
/// fires.
pub struct ShutdownCoordinator {
    config: ProtectionConfig,
    registry: Arc<SessionRegistry>,
    client: Arc<ProtectionClient>,
    request: Mutex<Option<ShutdownRequest>>,
    state: Mutex<CoordinatorState>,
    /// Shared with the renewal loop; set on voluntary shutdown so no new
    /// session can re-enable protection.
    reacquire_blocked: Arc<AtomicBool>,
    /// The proactive startup session. It belongs to the manager, not to any
    /// caller, so a voluntary shutdown must take it out of the registry or
    /// the drain could never reach zero.
    baseline_session: Mutex<Option<SessionId>>,
    notify: Notify,
    forced: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new(
        config: ProtectionConfig,
        registry: Arc<SessionRegistry>,
        client: Arc<ProtectionClient>,
        reacquire_blocked: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            registry,
            client,
            request: Mutex::new(None),
            state: Mutex::new(CoordinatorState::Running),
            reacquire_blocked,
            baseline_session: Mutex::new(None),
            notify: Notify::new(),
            forced: AtomicBool::new(false),
        }
    }

    /// Hand over the proactive baseline session for release on voluntary
    /// shutdown.
    pub fn adopt_baseline_session(&self, id: SessionId) {
        *self.baseline_session.lock() = Some(id);
    }

    fn drain_timeout(&self, reason: ShutdownReason) -> Duration {
        match reason {
            ShutdownReason::PreemptionNotice => self.config.drain_timeout_preemption,
            ShutdownReason::OperatorRequest | ShutdownReason::VoluntarySelfRequest => {
                self.config.drain_timeout_operator
            }
        }
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.lock()
    }

    pub fn request(&self) -> Option<ShutdownRequest> {
        self.request.lock().clone()
    }

    /// Create the singleton shutdown request, or merge a later trigger into
    /// it. The reason may escalate but never demote, and the drain deadline
    /// only ever tightens.
    pub fn request_shutdown(&self, reason: ShutdownReason) {
        if reason == ShutdownReason::VoluntarySelfRequest {
            self.reacquire_blocked.store(true, Ordering::SeqCst);
            if let Some(id) = self.baseline_session.lock().take() {
                info!(session = %id, "voluntary shutdown; removing baseline protection session");
                self.registry.unregister(id);
            }
        }

        let now = Instant::now();
        let mut slot = self.request.lock();
        match slot.as_mut() {
            None => {
                let timeout = self.drain_timeout(reason);
                info!(
                    reason = reason.as_str(),
                    drain_timeout_secs = timeout.as_secs(),
                    sessions = self.registry.active_count(),
                    "shutdown requested; draining critical sessions"
                );
                *slot = Some(ShutdownRequest {
                    reason,
                    requested_at: now,
                    drain_deadline: now + timeout,
                });
                *self.state.lock() = CoordinatorState::DrainRequested;
                self.notify.notify_waiters();
            }
            Some(existing) if reason > existing.reason => {
                let tightened = (now + self.drain_timeout(reason)).min(existing.drain_deadline);
                warn!(
                    from = existing.reason.as_str(),
                    to = reason.as_str(),
                    "shutdown reason escalated"
                );
                existing.reason = reason;
                existing.drain_deadline = tightened;
            }
            Some(existing) => {
                debug!(
                    reason = reason.as_str(),
                    active = existing.reason.as_str(),
                    "shutdown already in progress; trigger merged"
                );
            }
        }
    }

    /// Operator-invoked emergency path: skip the drain entirely and release
    /// protection immediately. Never triggered automatically.
    pub fn force_shutdown(&self) {
        warn!(
            sessions = self.registry.active_count(),
            "forced shutdown; bypassing drain"
        );
        {
            let mut slot = self.request.lock();
            if slot.is_none() {
                let now = Instant::now();
                *slot = Some(ShutdownRequest {
                    reason: ShutdownReason::OperatorRequest,
                    requested_at: now,
                    drain_deadline: now,
                });
            }
        }
        self.forced.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Drive the exit sequence to completion. Resolves once the process
    /// should exit with the returned status.
    pub async fn run(&self) -> ExitStatus {
        loop {
            let notified = self.notify.notified();
            if self.forced.load(Ordering::SeqCst) || self.request.lock().is_some() {
                break;
            }
            notified.await;
        }

        if self.forced.load(Ordering::SeqCst) {
            return self.terminate(self.registry.is_empty()).await;
        }

        *self.state.lock() = CoordinatorState::Draining;
        let clean = loop {
            if self.forced.load(Ordering::SeqCst) {
                break self.registry.is_empty();
            }
            let active = self.registry.active_count();
            if active == 0 {
                break true;
            }
            // Escalation may tighten the deadline mid-drain, so re-read it
            // every poll.
            let deadline = match self.request.lock().as_ref() {
                Some(request) => request.drain_deadline,
                None => break true,
            };
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    sessions = active,
                    "drain deadline reached with critical sessions still active; degraded exit"
                );
                break false;
            }
            // Same cadence as the renewal loop, capped so we wake exactly at
            // the deadline.
            let wait = self.config.check_interval.min(deadline.duration_since(now));
            sleep(wait).await;
        };

        self.terminate(clean).await
    }

    async fn terminate(&self, clean: bool) -> ExitStatus {
        *self.state.lock() = CoordinatorState::Terminating;
        // Best-effort: the orchestrator-side lease lapses at expiry anyway,
        // so a failed release never blocks exit.
        if let Err(e) = self.client.disable().await {
            warn!(error = %e, "final protection release failed; lease will lapse at expiry");
        }
        *self.state.lock() = CoordinatorState::Terminated;

        if clean {
            info!("drain complete; exiting cleanly");
            ExitStatus::CleanDrain
        } else {
            warn!("exiting with critical sessions still active");
            ExitStatus::DegradedDrain
        }
    }
}
