// Thin host process: wires the protection manager to the OS and exits with
// the drain status. Real deployments embed the library in the worker instead.

use taskguard::signals::OsSignalBackend;
use taskguard::ProtectionManager;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("taskguard=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let manager = match ProtectionManager::from_env() {
        Ok(manager) => manager,
        Err(e) => {
            error!(error = %e, "refusing to start");
            std::process::exit(2);
        }
    };

    manager.start(OsSignalBackend);
    info!("termination protection manager running; SIGUSR1 requests voluntary shutdown");

    let status = manager.wait_for_exit().await;
    std::process::exit(status.code());
}
