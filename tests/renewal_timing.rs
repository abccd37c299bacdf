// Timing behavior of the renewal loop under a paused clock: gap-free
// extension and the maximum-duration safety valve.

use std::sync::Arc;
use std::time::Duration;

use taskguard::test_utils::{channel_signal_backend, RecordingApi};
use taskguard::{ProtectionConfig, ProtectionManager};

fn timing_config() -> ProtectionConfig {
    ProtectionConfig {
        check_interval: Duration::from_secs(60),
        extension_interval: Duration::from_secs(300),
        protection_buffer: Duration::from_secs(120),
        min_protection_time: Duration::from_secs(0),
        max_protection_duration: Duration::from_secs(7200),
        proactive_protection_on_startup: false,
        ..ProtectionConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn lease_is_extended_before_the_buffer_window_closes() {
    let api = Arc::new(RecordingApi::new());
    let manager = ProtectionManager::new(timing_config(), api.clone()).unwrap();
    let (_signals, backend) = channel_signal_backend();

    let _session = manager.begin_critical_session();
    manager.start(backend);

    // First tick acquires protection for extension + buffer = 420s.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let enables = api.enable_calls();
    assert_eq!(enables.len(), 1);
    assert_eq!(enables[0].expires_in, Some(Duration::from_secs(420)));
    assert!(manager.status().protection_enabled);
    let acquired_at = enables[0].at;

    // No tick before the buffer window may renew.
    tokio::time::sleep(Duration::from_secs(299)).await;
    assert_eq!(api.enable_calls().len(), 1);

    // The tick at expires_at - buffer (t = +300s) must extend, so the lease
    // is never both unrenewed and inside the buffer window.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let enables = api.enable_calls();
    assert_eq!(enables.len(), 2);
    let renewed_at = enables[1].at;
    assert_eq!(renewed_at.duration_since(acquired_at), Duration::from_secs(300));

    // Renewed expiry is strictly later than the previous one: the old lease
    // would have lapsed at +420s, the new one at +720s.
    let status = manager.status();
    assert!(status.protection_enabled);
    assert!(status.seconds_until_expiry.unwrap() > 120);
}

#[tokio::test(start_paused = true)]
async fn lease_released_after_all_sessions_end() {
    let api = Arc::new(RecordingApi::new());
    let manager = ProtectionManager::new(timing_config(), api.clone()).unwrap();
    let (_signals, backend) = channel_signal_backend();

    let session = manager.begin_critical_session();
    manager.start(backend);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(manager.status().protection_enabled);

    manager.end_critical_session(session);
    tokio::time::sleep(Duration::from_secs(61)).await;

    let status = manager.status();
    assert!(!status.protection_enabled);
    assert_eq!(api.disable_calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn drained_lease_outliving_the_maximum_releases_without_the_valve() {
    let mut config = timing_config();
    // A minimum hold longer than the maximum keeps an empty lease alive past
    // it; that is an ordinary release, not a stuck occupancy.
    config.min_protection_time = Duration::from_secs(7500);
    let api = Arc::new(RecordingApi::new());
    let manager = ProtectionManager::new(config, api.clone()).unwrap();
    let (_signals, backend) = channel_signal_backend();

    let session = manager.begin_critical_session();
    manager.start(backend);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(manager.status().protection_enabled);
    manager.end_critical_session(session);

    // Past the maximum with no sessions left: the valve must stay quiet and
    // the minimum hold keeps the lease.
    tokio::time::sleep(Duration::from_secs(7300)).await;
    let status = manager.status();
    assert!(!status.safety_valve_fired);
    assert!(status.protection_enabled);
    assert!(api.disable_calls().is_empty());

    // First tick past the minimum hold releases normally.
    tokio::time::sleep(Duration::from_secs(300)).await;
    let status = manager.status();
    assert!(!status.protection_enabled);
    assert!(!status.safety_valve_fired);
    assert_eq!(api.disable_calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn safety_valve_fires_once_and_suppresses_reacquisition() {
    let api = Arc::new(RecordingApi::new());
    let manager = ProtectionManager::new(timing_config(), api.clone()).unwrap();
    let (_signals, backend) = channel_signal_backend();

    // One stuck session, never unregistered.
    let session = manager.begin_critical_session();
    manager.start(backend);

    // Run past the maximum protection duration.
    tokio::time::sleep(Duration::from_secs(7300)).await;

    let status = manager.status();
    assert!(status.safety_valve_fired);
    assert!(!status.protection_enabled);
    assert_eq!(status.active_session_ids, vec![session]);
    assert_eq!(api.disable_calls().len(), 1);

    // The latch holds: no re-acquisition while the stuck session remains.
    let enables_at_valve = api.enable_calls().len();
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(api.enable_calls().len(), enables_at_valve);
    assert_eq!(api.disable_calls().len(), 1);

    // Once the registry drains, new work is protected again.
    manager.end_critical_session(session);
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(!manager.status().safety_valve_fired);

    let fresh = manager.begin_critical_session();
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(manager.status().protection_enabled);
    assert_eq!(manager.status().active_session_ids, vec![fresh]);
}
