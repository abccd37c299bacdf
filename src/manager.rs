// The explicitly constructed protection manager: owns the shared state,
// spawns the background tasks, and exposes the caller API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::info;

use crate::client::{ProtectionApi, ProtectionClient, RetryPolicy};
use crate::config::ProtectionConfig;
use crate::error::Result;
use crate::lease::ProtectionLease;
use crate::registry::SessionRegistry;
use crate::renewal::LeaseRenewalLoop;
use crate::shutdown::{ExitStatus, ShutdownCoordinator, ShutdownReason};
use crate::signals::{SignalBackend, SignalGate};
use crate::SessionId;

/// Point-in-time view of the protection subsystem for status endpoints and
/// logging.
#[derive(Debug, Clone, Serialize)]
pub struct ProtectionStatus {
    pub active_session_ids: Vec<SessionId>,
    pub protection_enabled: bool,
    pub seconds_until_expiry: Option<u64>,
    pub gap_safety_margin_seconds: u64,
    pub advisory_mode: bool,
    pub safety_valve_fired: bool,
}

/// Process-local coordinator that keeps the orchestrator from reclaiming
/// this execution unit while critical sessions are in flight, while still
/// letting the process terminate itself promptly.
pub struct ProtectionManager {
    config: ProtectionConfig,
    registry: Arc<SessionRegistry>,
    client: Arc<ProtectionClient>,
    lease: Arc<Mutex<ProtectionLease>>,
    coordinator: Arc<ShutdownCoordinator>,
    reacquire_blocked: Arc<AtomicBool>,
    started: AtomicBool,
}

impl ProtectionManager {
    /// Build a manager with an injected protection backend. Fails fast on
    /// invalid timing configuration; the process must not start with a
    /// non-positive gap safety margin.
    pub fn new(config: ProtectionConfig, api: Arc<dyn ProtectionApi>) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(SessionRegistry::new());
        let client = Arc::new(ProtectionClient::new(api, RetryPolicy::default()));
        let lease = Arc::new(Mutex::new(ProtectionLease::new()));
        let reacquire_blocked = Arc::new(AtomicBool::new(false));
        let coordinator = Arc::new(ShutdownCoordinator::new(
            config.clone(),
            registry.clone(),
            client.clone(),
            reacquire_blocked.clone(),
        ));

        Ok(Self {
            config,
            registry,
            client,
            lease,
            coordinator,
            reacquire_blocked,
            started: AtomicBool::new(false),
        })
    }

    /// Build a manager against whatever backend the environment provides:
    /// the orchestrator agent endpoint when configured, otherwise advisory.
    pub fn from_env() -> Result<Self> {
        Self::new(
            ProtectionConfig::from_env(),
            crate::client::detect_protection_api(),
        )
    }

    /// Spawn the renewal loop and the signal gate. Idempotent; only the
    /// first call has any effect.
    pub fn start<B: SignalBackend>(&self, backend: B) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let renewal = LeaseRenewalLoop::new(
            self.config.clone(),
            self.registry.clone(),
            self.client.clone(),
            self.lease.clone(),
            self.reacquire_blocked.clone(),
        );
        tokio::spawn(renewal.run());

        let gate = SignalGate::new(
            self.registry.clone(),
            self.lease.clone(),
            self.coordinator.clone(),
            self.config.preemptible_capacity,
        );
        let signals = backend.subscribe();
        tokio::spawn(gate.run(signals));

        if self.config.proactive_protection_on_startup {
            let id = self.registry.register();
            self.coordinator.adopt_baseline_session(id);
            info!(session = %id, "proactive baseline protection enabled on startup");
        }
    }

    /// Flag a unit of non-restartable work as critical.
    pub fn begin_critical_session(&self) -> SessionId {
        self.registry.register()
    }

    /// Mark a session complete. Unknown ids are ignored.
    pub fn end_critical_session(&self, id: SessionId) {
        self.registry.unregister(id);
    }

    /// Ask the process to shut itself down: removes the baseline session,
    /// blocks any further protection acquisition, and starts the drain.
    /// SIGUSR1 lands on this same coordinator path.
    pub fn request_voluntary_shutdown(&self) {
        self.coordinator
            .request_shutdown(ShutdownReason::VoluntarySelfRequest);
    }

    /// Emergency operator path: skip draining and exit immediately.
    pub fn force_shutdown(&self) {
        self.coordinator.force_shutdown();
    }

    /// Resolve once a shutdown sequence has run to completion; the caller
    /// should exit the process with `status.code()`.
    pub async fn wait_for_exit(&self) -> ExitStatus {
        self.coordinator.run().await
    }

    pub fn status(&self) -> ProtectionStatus {
        let now = Instant::now();
        let lease = self.lease.lock().clone();
        ProtectionStatus {
            active_session_ids: self.registry.active_ids(),
            protection_enabled: lease.enabled,
            seconds_until_expiry: lease.seconds_until_expiry(now),
            gap_safety_margin_seconds: self.config.gap_safety_margin().as_secs(),
            advisory_mode: self.client.is_advisory(),
            safety_valve_fired: lease.safety_valve_fired,
        }
    }

    /// Ask the orchestrator for its current view of this unit's protection,
    /// for diagnostics when the local belief and the control plane disagree.
    pub async fn remote_protection(&self) -> Result<crate::client::ProtectionRecord> {
        self.client.describe().await
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingApi;
    use std::time::Duration;

    #[tokio::test]
    async fn construction_rejects_bad_gap_margin() {
        let mut config = ProtectionConfig::default();
        config.protection_buffer = config.check_interval;
        let result = ProtectionManager::new(config, Arc::new(RecordingApi::new()));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn status_reflects_registry_and_config() {
        let config = ProtectionConfig {
            proactive_protection_on_startup: false,
            ..ProtectionConfig::default()
        };
        let manager = ProtectionManager::new(config, Arc::new(RecordingApi::new())).unwrap();

        let id = manager.begin_critical_session();
        let status = manager.status();
        assert_eq!(status.active_session_ids, vec![id]);
        assert!(!status.protection_enabled);
        assert_eq!(
            status.gap_safety_margin_seconds,
            Duration::from_secs(270).as_secs()
        );

        manager.end_critical_session(id);
        assert!(manager.status().active_session_ids.is_empty());
    }

    #[tokio::test]
    async fn status_serializes_for_diagnostics() {
        let config = ProtectionConfig {
            proactive_protection_on_startup: false,
            ..ProtectionConfig::default()
        };
        let manager = ProtectionManager::new(config, Arc::new(RecordingApi::new())).unwrap();
        let id = manager.begin_critical_session();

        let value = serde_json::to_value(manager.status()).unwrap();
        assert_eq!(value["protection_enabled"], false);
        assert_eq!(value["advisory_mode"], false);
        assert_eq!(value["safety_valve_fired"], false);
        assert_eq!(value["active_session_ids"][0], id.to_string());
    }
}
