// Adapter over the orchestrator's protection API: retry/backoff, failure
// classification and the advisory-mode degradation path.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::config::AGENT_URI_ENV;
use crate::error::{Error, Result};

/// Classified failure from the protection API transport.
#[derive(Debug, Clone)]
pub enum ApiError {
    /// Retryable: network failure, timeout, throttling.
    Transient(String),
    /// Not retryable: auth/permission/unknown execution unit. The client
    /// degrades to advisory mode after the first of these.
    Permanent(String),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Transient(msg) => write!(f, "transient: {msg}"),
            ApiError::Permanent(msg) => write!(f, "permanent: {msg}"),
        }
    }
}

/// Orchestrator-side view of this execution unit's protection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionRecord {
    pub protection_enabled: bool,
    /// Remaining protection window, when the orchestrator reports one.
    pub expires_in: Option<Duration>,
}

/// Transport trait for the orchestrator protection API. Injected so tests and
/// unmanaged environments can swap the backend without touching the rest of
/// the manager.
#[async_trait]
pub trait ProtectionApi: Send + Sync {
    /// Request protection on or off for this execution unit. Returns the
    /// confirmed time-to-expiry, which may exceed the hint, or `None` when
    /// the backend is advisory-only.
    async fn set_protection(
        &self,
        enabled: bool,
        expires_in: Option<Duration>,
    ) -> std::result::Result<Option<Duration>, ApiError>;

    /// Read back the orchestrator's current protection state.
    async fn describe(&self) -> std::result::Result<ProtectionRecord, ApiError>;
}

/// Always-succeeding backend for processes running outside the managed
/// environment. Protection semantics become advisory/log-only.
#[derive(Debug, Default)]
pub struct NoopProtectionApi;

#[async_trait]
impl ProtectionApi for NoopProtectionApi {
    async fn set_protection(
        &self,
        enabled: bool,
        _expires_in: Option<Duration>,
    ) -> std::result::Result<Option<Duration>, ApiError> {
        debug!(enabled, "no orchestrator agent configured; protection call is advisory");
        Ok(None)
    }

    async fn describe(&self) -> std::result::Result<ProtectionRecord, ApiError> {
        Ok(ProtectionRecord {
            protection_enabled: false,
            expires_in: None,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SetProtectionBody {
    protection_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_in_minutes: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentStateResponse {
    protection: AgentProtectionState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentProtectionState {
    protection_enabled: bool,
}

/// HTTP client for the orchestrator agent's task-protection endpoint.
///
/// The agent grants protection in whole minutes; duration hints are rounded
/// up and the confirmed expiry reflects the granted minutes.
pub struct AgentProtectionClient {
    http: reqwest::Client,
    endpoint: String,
}

impl AgentProtectionClient {
    pub fn new(agent_uri: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::Other(anyhow::anyhow!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            endpoint: format!("{}/task-protection/v1/state", agent_uri.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl ProtectionApi for AgentProtectionClient {
    async fn set_protection(
        &self,
        enabled: bool,
        expires_in: Option<Duration>,
    ) -> std::result::Result<Option<Duration>, ApiError> {
        // Whole minutes, rounded up, minimum one.
        let minutes = expires_in.map(|d| ((d.as_secs() + 59) / 60).max(1));
        let body = SetProtectionBody {
            protection_enabled: enabled,
            expires_in_minutes: minutes,
        };

        let response = self
            .http
            .put(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if status.is_success() {
            Ok(minutes.map(|m| Duration::from_secs(m * 60)))
        } else if status.as_u16() == 429 || status.is_server_error() {
            Err(ApiError::Transient(format!("agent returned {status}")))
        } else {
            Err(ApiError::Permanent(format!("agent returned {status}")))
        }
    }

    async fn describe(&self) -> std::result::Result<ProtectionRecord, ApiError> {
        let response = self
            .http
            .get(&self.endpoint)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(ApiError::Transient(format!("agent returned {status}")));
            }
            return Err(ApiError::Permanent(format!("agent returned {status}")));
        }

        let state: AgentStateResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Transient(format!("malformed agent response: {e}")))?;
        Ok(ProtectionRecord {
            protection_enabled: state.protection.protection_enabled,
            expires_in: None,
        })
    }
}

fn classify_transport_error(e: reqwest::Error) -> ApiError {
    if e.is_builder() {
        ApiError::Permanent(e.to_string())
    } else {
        ApiError::Transient(e.to_string())
    }
}

/// Pick a protection backend from the environment: the agent endpoint when
/// configured, otherwise the advisory no-op.
pub fn detect_protection_api() -> Arc<dyn ProtectionApi> {
    match std::env::var(AGENT_URI_ENV) {
        Ok(uri) if !uri.trim().is_empty() => match AgentProtectionClient::new(&uri) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                error!(error = %e, "failed to build agent client; protection is advisory only");
                Arc::new(NoopProtectionApi)
            }
        },
        _ => {
            warn!("{AGENT_URI_ENV} not set; termination protection is advisory only");
            Arc::new(NoopProtectionApi)
        }
    }
}

/// Bounded exponential backoff with jitter. The full budget must stay well
/// below the renewal loop's check interval so one tick can never stall into
/// the next.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            base_delay: Duration::from_millis(750),
            max_delay: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(8);
        let raw = self.base_delay.saturating_mul(1u32 << exp);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
        raw.min(self.max_delay) + jitter
    }
}

/// Uniform-semantics wrapper over a [`ProtectionApi`]: retries transient
/// failures, latches advisory mode on the first permanent one.
pub struct ProtectionClient {
    api: Arc<dyn ProtectionApi>,
    retry: RetryPolicy,
    advisory: AtomicBool,
}

impl ProtectionClient {
    pub fn new(api: Arc<dyn ProtectionApi>, retry: RetryPolicy) -> Self {
        Self {
            api,
            retry,
            advisory: AtomicBool::new(false),
        }
    }

    /// True once the client has degraded to advisory (log-only) mode.
    pub fn is_advisory(&self) -> bool {
        self.advisory.load(Ordering::Relaxed)
    }

    /// Request protection for at least `duration_hint` from now. Returns the
    /// confirmed time-to-expiry, or `None` in advisory mode.
    pub async fn enable(&self, duration_hint: Duration) -> Result<Option<Duration>> {
        self.call(true, Some(duration_hint)).await
    }

    /// Request protection be lifted. Best-effort: failures are reported but
    /// must never block process exit, since the orchestrator-side lease
    /// lapses on its own at expiry.
    pub async fn disable(&self) -> Result<()> {
        self.call(false, None).await.map(|_| ())
    }

    /// Read back the orchestrator's view of this unit's protection. Single
    /// attempt; callers treat failure as "unknown".
    pub async fn describe(&self) -> Result<ProtectionRecord> {
        if self.is_advisory() {
            return Ok(ProtectionRecord {
                protection_enabled: false,
                expires_in: None,
            });
        }
        self.api.describe().await.map_err(|e| match e {
            ApiError::Transient(msg) => Error::TransientRemote(msg),
            ApiError::Permanent(msg) => {
                self.advisory.store(true, Ordering::Relaxed);
                Error::PermanentRemote(msg)
            }
        })
    }

    async fn call(
        &self,
        enabled: bool,
        expires_in: Option<Duration>,
    ) -> Result<Option<Duration>> {
        if self.is_advisory() {
            debug!(enabled, "protection client in advisory mode; skipping remote call");
            return Ok(None);
        }

        let mut last_error = String::new();
        for attempt in 1..=self.retry.attempts {
            match self.api.set_protection(enabled, expires_in).await {
                Ok(confirmed) => return Ok(confirmed),
                Err(ApiError::Permanent(msg)) => {
                    error!(
                        enabled,
                        error = %msg,
                        "permanent protection API failure; degrading to advisory mode for the rest of this process"
                    );
                    self.advisory.store(true, Ordering::Relaxed);
                    return Err(Error::PermanentRemote(msg));
                }
                Err(ApiError::Transient(msg)) => {
                    warn!(
                        enabled,
                        attempt,
                        attempts = self.retry.attempts,
                        error = %msg,
                        "transient protection API failure"
                    );
                    last_error = msg;
                    if attempt < self.retry.attempts {
                        tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    }
                }
            }
        }

        Err(Error::RetriesExhausted {
            attempts: self.retry.attempts,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingApi;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 4,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_then_succeeds() {
        let api = Arc::new(RecordingApi::new());
        api.fail_transient(2);
        let client = ProtectionClient::new(api.clone(), fast_retry());

        let confirmed = client.enable(Duration::from_secs(420)).await.unwrap();
        assert_eq!(confirmed, Some(Duration::from_secs(420)));
        assert_eq!(api.call_count(), 3);
        assert!(!client.is_advisory());
    }

    #[tokio::test(start_paused = true)]
    async fn reports_failure_after_retry_budget() {
        let api = Arc::new(RecordingApi::new());
        api.fail_transient(u32::MAX);
        let client = ProtectionClient::new(api.clone(), fast_retry());

        let err = client.enable(Duration::from_secs(420)).await.unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 4, .. }));
        assert_eq!(api.call_count(), 4);
        // Transient failures never latch advisory mode.
        assert!(!client.is_advisory());
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_latches_advisory_mode() {
        let api = Arc::new(RecordingApi::new());
        api.fail_permanent();
        let client = ProtectionClient::new(api.clone(), fast_retry());

        let err = client.enable(Duration::from_secs(420)).await.unwrap_err();
        assert!(matches!(err, Error::PermanentRemote(_)));
        assert!(client.is_advisory());

        // Subsequent calls succeed as no-ops without touching the transport.
        assert_eq!(client.enable(Duration::from_secs(420)).await.unwrap(), None);
        client.disable().await.unwrap();
        assert_eq!(api.call_count(), 1);
    }

    #[tokio::test]
    async fn noop_backend_always_succeeds() {
        let client = ProtectionClient::new(Arc::new(NoopProtectionApi), RetryPolicy::default());
        assert_eq!(client.enable(Duration::from_secs(60)).await.unwrap(), None);
        client.disable().await.unwrap();
    }

    #[test]
    fn backoff_delays_are_capped() {
        let policy = RetryPolicy::default();
        for attempt in 1..=8 {
            let d = policy.delay_for(attempt);
            assert!(d <= policy.max_delay + Duration::from_millis(250));
        }
    }
}
