// Fakes shared by unit and integration tests: a recording protection backend
// and a channel-driven signal source.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::client::{ApiError, ProtectionApi, ProtectionRecord};
use crate::signals::{SignalBackend, TermSignal};

/// One recorded `set_protection` call.
#[derive(Debug, Clone)]
pub struct ProtectionCall {
    pub enabled: bool,
    pub expires_in: Option<Duration>,
    pub at: Instant,
}

/// In-memory protection backend that records every call and can be told to
/// fail with transient or permanent errors.
#[derive(Debug, Default)]
pub struct RecordingApi {
    calls: Mutex<Vec<ProtectionCall>>,
    transient_failures: AtomicU32,
    permanent_failure: AtomicBool,
}

impl RecordingApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls with a transient error.
    pub fn fail_transient(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Fail every call with a permanent error.
    pub fn fail_permanent(&self) {
        self.permanent_failure.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ProtectionCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Calls that enabled or extended protection.
    pub fn enable_calls(&self) -> Vec<ProtectionCall> {
        self.calls.lock().iter().filter(|c| c.enabled).cloned().collect()
    }

    /// Calls that released protection.
    pub fn disable_calls(&self) -> Vec<ProtectionCall> {
        self.calls.lock().iter().filter(|c| !c.enabled).cloned().collect()
    }
}

#[async_trait]
impl ProtectionApi for RecordingApi {
    async fn set_protection(
        &self,
        enabled: bool,
        expires_in: Option<Duration>,
    ) -> std::result::Result<Option<Duration>, ApiError> {
        self.calls.lock().push(ProtectionCall {
            enabled,
            expires_in,
            at: Instant::now(),
        });

        if self.permanent_failure.load(Ordering::SeqCst) {
            return Err(ApiError::Permanent("access denied".into()));
        }
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != u32::MAX {
                self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            }
            return Err(ApiError::Transient("connection reset".into()));
        }

        Ok(expires_in)
    }

    async fn describe(&self) -> std::result::Result<ProtectionRecord, ApiError> {
        let enabled = self
            .calls
            .lock()
            .last()
            .map(|c| c.enabled)
            .unwrap_or(false);
        Ok(ProtectionRecord {
            protection_enabled: enabled,
            expires_in: None,
        })
    }
}

/// Signal backend fed by a test-held channel sender.
pub struct ChannelSignalBackend {
    rx: mpsc::Receiver<TermSignal>,
}

impl SignalBackend for ChannelSignalBackend {
    fn subscribe(self) -> mpsc::Receiver<TermSignal> {
        self.rx
    }
}

/// Build a fake signal source; send on the returned sender to deliver a
/// signal to the gate.
pub fn channel_signal_backend() -> (mpsc::Sender<TermSignal>, ChannelSignalBackend) {
    let (tx, rx) = mpsc::channel(16);
    (tx, ChannelSignalBackend { rx })
}
