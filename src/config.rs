// Timing and environment configuration for the protection manager.

use std::time::Duration;

use crate::error::{Error, Result};

/// Environment variable naming the orchestrator agent endpoint. When unset the
/// manager runs in advisory mode against a no-op backend.
pub const AGENT_URI_ENV: &str = "TASKGUARD_AGENT_URI";

#[derive(Debug, Clone)]
pub struct ProtectionConfig {
    /// Cadence of the renewal loop tick and of drain polling.
    pub check_interval: Duration,

    /// Base length of each protection window requested from the orchestrator.
    pub extension_interval: Duration,

    /// Extra window requested on top of `extension_interval`; renewal happens
    /// once the lease is within this buffer of expiry. Must be strictly
    /// greater than `check_interval` so the gap safety margin is positive.
    pub protection_buffer: Duration,

    /// Anti-flap floor: a fresh lease is held at least this long before the
    /// loop releases it, even if all sessions end immediately.
    pub min_protection_time: Duration,

    /// Safety valve: protection is force-released once it has been
    /// continuously held this long, even with sessions still registered.
    pub max_protection_duration: Duration,

    /// Drain window for operator-requested and voluntary shutdown.
    pub drain_timeout_operator: Duration,

    /// Drain window for pre-emption notices. Sized to fit inside the
    /// infrastructure's hard reclaim deadline.
    pub drain_timeout_preemption: Duration,

    /// Register a baseline session at startup so the process is protected
    /// before any work arrives. Removed only by a voluntary shutdown request.
    pub proactive_protection_on_startup: bool,

    /// Set when the process runs on reclaimable capacity; soft-stop signals
    /// are then treated as pre-emption notices instead of operator requests.
    pub preemptible_capacity: bool,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            extension_interval: Duration::from_secs(900),
            protection_buffer: Duration::from_secs(300),
            min_protection_time: Duration::from_secs(120),
            max_protection_duration: Duration::from_secs(7200),
            drain_timeout_operator: Duration::from_secs(30),
            drain_timeout_preemption: Duration::from_secs(95),
            proactive_protection_on_startup: true,
            preemptible_capacity: false,
        }
    }
}

impl ProtectionConfig {
    /// Build a configuration from `TASKGUARD_*` environment variables,
    /// falling back to the defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_secs("TASKGUARD_CHECK_INTERVAL_SECS") {
            cfg.check_interval = v;
        }
        if let Some(v) = env_secs("TASKGUARD_EXTENSION_INTERVAL_SECS") {
            cfg.extension_interval = v;
        }
        if let Some(v) = env_secs("TASKGUARD_PROTECTION_BUFFER_SECS") {
            cfg.protection_buffer = v;
        }
        if let Some(v) = env_secs("TASKGUARD_MIN_PROTECTION_SECS") {
            cfg.min_protection_time = v;
        }
        if let Some(v) = env_secs("TASKGUARD_MAX_PROTECTION_SECS") {
            cfg.max_protection_duration = v;
        }
        if let Some(v) = env_secs("TASKGUARD_DRAIN_TIMEOUT_SECS") {
            cfg.drain_timeout_operator = v;
        }
        if let Some(v) = env_secs("TASKGUARD_PREEMPTION_DRAIN_TIMEOUT_SECS") {
            cfg.drain_timeout_preemption = v;
        }
        if let Some(v) = env_bool("TASKGUARD_PROACTIVE_PROTECTION") {
            cfg.proactive_protection_on_startup = v;
        }
        if let Some(v) = env_bool("TASKGUARD_PREEMPTIBLE") {
            cfg.preemptible_capacity = v;
        }
        cfg
    }

    /// Margin between lease renewal and lease expiry observation. Positive by
    /// construction once `validate` has passed.
    pub fn gap_safety_margin(&self) -> Duration {
        self.protection_buffer.saturating_sub(self.check_interval)
    }

    pub fn validate(&self) -> Result<()> {
        if self.check_interval.is_zero() {
            return Err(Error::InvalidConfig {
                reason: "check_interval must be positive".into(),
            });
        }
        if self.extension_interval.is_zero() {
            return Err(Error::InvalidConfig {
                reason: "extension_interval must be positive".into(),
            });
        }
        if self.protection_buffer <= self.check_interval {
            return Err(Error::InvalidConfig {
                reason: format!(
                    "protection_buffer ({}s) must exceed check_interval ({}s) for a positive gap safety margin",
                    self.protection_buffer.as_secs(),
                    self.check_interval.as_secs()
                ),
            });
        }
        if self.max_protection_duration < self.extension_interval + self.protection_buffer {
            return Err(Error::InvalidConfig {
                reason: "max_protection_duration must cover at least one full protection window".into(),
            });
        }
        if self.drain_timeout_operator.is_zero() || self.drain_timeout_preemption.is_zero() {
            return Err(Error::InvalidConfig {
                reason: "drain timeouts must be positive".into(),
            });
        }
        Ok(())
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn env_bool(key: &str) -> Option<bool> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}
