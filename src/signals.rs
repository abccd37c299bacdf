// Signal interception and routing. The gate only flips shutdown state; all
// blocking work (drain wait, remote disable) happens in the coordinator task.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::lease::ProtectionLease;
use crate::registry::SessionRegistry;
use crate::shutdown::{ShutdownCoordinator, ShutdownReason};

/// The soft-stop signals an operator or orchestrator sends to ask the
/// process to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Terminate,
    Interrupt,
    Hangup,
    Quit,
}

impl StopSignal {
    pub fn name(self) -> &'static str {
        match self {
            StopSignal::Terminate => "SIGTERM",
            StopSignal::Interrupt => "SIGINT",
            StopSignal::Hangup => "SIGHUP",
            StopSignal::Quit => "SIGQUIT",
        }
    }
}

/// A termination-relevant signal after interception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermSignal {
    SoftStop(StopSignal),
    /// SIGUSR1: the process asking itself to shut down. The only externally
    /// triggerable path guaranteed to eventually terminate the process.
    Voluntary,
}

/// Source of intercepted signals. Abstracted so the gate's routing logic is
/// portable and testable without an OS signal API.
pub trait SignalBackend {
    /// Install handlers and hand back the stream of intercepted signals.
    fn subscribe(self) -> mpsc::Receiver<TermSignal>;
}

/// Backend wired to the host OS via tokio's unix signal streams.
#[derive(Debug, Default)]
pub struct OsSignalBackend;

impl SignalBackend for OsSignalBackend {
    fn subscribe(self) -> mpsc::Receiver<TermSignal> {
        use tokio::signal::unix::{signal, SignalKind};

        let (tx, rx) = mpsc::channel(16);

        let soft_stops = [
            (SignalKind::terminate(), StopSignal::Terminate),
            (SignalKind::interrupt(), StopSignal::Interrupt),
            (SignalKind::hangup(), StopSignal::Hangup),
            (SignalKind::quit(), StopSignal::Quit),
        ];
        for (kind, stop) in soft_stops {
            match signal(kind) {
                Ok(mut stream) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        while stream.recv().await.is_some() {
                            if tx.send(TermSignal::SoftStop(stop)).await.is_err() {
                                break;
                            }
                        }
                    });
                }
                Err(e) => error!(signal = stop.name(), error = %e, "failed to install signal handler"),
            }
        }

        match signal(SignalKind::user_defined1()) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    while stream.recv().await.is_some() {
                        if tx.send(TermSignal::Voluntary).await.is_err() {
                            break;
                        }
                    }
                });
            }
            Err(e) => error!(signal = "SIGUSR1", error = %e, "failed to install signal handler"),
        }

        rx
    }
}

/// Routes intercepted signals: defer, or hand to the shutdown coordinator
/// with the right reason.
pub struct SignalGate {
    registry: Arc<SessionRegistry>,
    lease: Arc<Mutex<ProtectionLease>>,
    coordinator: Arc<ShutdownCoordinator>,
    /// Runtime hint that this process runs on reclaimable capacity.
    preemptible: bool,
}

impl SignalGate {
    pub fn new(
        registry: Arc<SessionRegistry>,
        lease: Arc<Mutex<ProtectionLease>>,
        coordinator: Arc<ShutdownCoordinator>,
        preemptible: bool,
    ) -> Self {
        Self {
            registry,
            lease,
            coordinator,
            preemptible,
        }
    }

    pub async fn run(self, mut signals: mpsc::Receiver<TermSignal>) {
        while let Some(sig) = signals.recv().await {
            self.handle(sig);
        }
    }

    /// Synchronous on purpose: flips shutdown state only, no blocking I/O.
    pub fn handle(&self, sig: TermSignal) {
        match sig {
            TermSignal::Voluntary => {
                info!("voluntary shutdown signal received");
                self.coordinator
                    .request_shutdown(ShutdownReason::VoluntarySelfRequest);
            }
            TermSignal::SoftStop(stop) if self.preemptible => {
                // Pre-emption cannot be deferred, only drained within the
                // capacity window.
                warn!(
                    signal = stop.name(),
                    sessions = self.registry.active_count(),
                    "pre-emption notice on reclaimable capacity; draining"
                );
                self.coordinator
                    .request_shutdown(ShutdownReason::PreemptionNotice);
            }
            TermSignal::SoftStop(stop) => {
                let ids = self.registry.active_ids();
                if ids.is_empty() {
                    info!(signal = stop.name(), "stop signal with no critical sessions; shutting down");
                    self.coordinator
                        .request_shutdown(ShutdownReason::OperatorRequest);
                } else {
                    let lease = self.lease.lock().clone();
                    warn!(
                        signal = stop.name(),
                        sessions = ?ids,
                        protection_enabled = lease.enabled,
                        "stop signal blocked; critical sessions in flight"
                    );
                }
            }
        }
    }
}
