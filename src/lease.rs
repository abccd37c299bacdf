// Local view of the orchestrator-side protection lease.

use std::time::Duration;

use tokio::time::Instant;

/// Phase of the renewal loop, kept for logging and status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Idle,
    Protected,
    Renewing,
    Releasing,
}

/// The manager's belief about orchestrator-side protection state.
///
/// Owned by the renewal loop; everyone else sees read-only snapshots.
#[derive(Debug, Clone, Default)]
pub struct ProtectionLease {
    pub enabled: bool,
    /// Expiry the orchestrator will honor, when a remote lease exists.
    pub expires_at: Option<Instant>,
    /// First enable of the current continuous protection span. Drives the
    /// maximum-duration safety valve.
    pub acquired_at: Option<Instant>,
    pub last_renewal_attempt: Option<Instant>,
    pub last_renewal_success: Option<Instant>,
    /// Latched when the safety valve fires; cleared once the registry drains
    /// so one stuck session cannot re-trigger protection.
    pub safety_valve_fired: bool,
}

impl ProtectionLease {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the lease is within `buffer` of expiry and must be extended
    /// on this tick to stay gap-free.
    pub fn needs_extension(&self, now: Instant, buffer: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) if self.enabled => now + buffer >= expires_at,
            _ => false,
        }
    }

    /// How long protection has been continuously held.
    pub fn age(&self, now: Instant) -> Option<Duration> {
        self.acquired_at.map(|acquired| now.duration_since(acquired))
    }

    pub fn seconds_until_expiry(&self, now: Instant) -> Option<u64> {
        self.expires_at
            .filter(|_| self.enabled)
            .map(|expires_at| expires_at.duration_since(now).as_secs())
    }

    pub fn mark_enabled(&mut self, now: Instant, expires_at: Instant) {
        self.enabled = true;
        self.expires_at = Some(expires_at);
        if self.acquired_at.is_none() {
            self.acquired_at = Some(now);
        }
        self.last_renewal_success = Some(now);
    }

    pub fn mark_released(&mut self) {
        self.enabled = false;
        self.expires_at = None;
        self.acquired_at = None;
    }
}
