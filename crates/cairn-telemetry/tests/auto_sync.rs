//! Background sync scheduling

mod test_utils;

use cairn_telemetry::prefs::{SharedPreferences, KEY_AUTO_SYNC_INTERVAL, KEY_AUTO_SYNC_MODE};
use cairn_telemetry::{AutoSyncMode, NetworkStatus};
use std::time::Duration;
use test_utils::{harness, Harness, HarnessBuilder};

/// Poll until the transport has seen `calls` requests
async fn wait_for_calls(h: &Harness, calls: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.transport.calls() < calls {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("background sync did not run");
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let h = harness();
    let auto_sync = h.service.auto_sync();

    assert!(!auto_sync.is_running());
    auto_sync.start().await;
    auto_sync.start().await;
    assert!(auto_sync.is_running());

    auto_sync.stop();
    assert!(!auto_sync.is_running());

    auto_sync.start().await;
    assert!(auto_sync.is_running());
    auto_sync.stop();
}

#[tokio::test]
async fn test_network_coming_online_triggers_sync() {
    let h = harness();
    h.preferences
        .put_string(KEY_AUTO_SYNC_INTERVAL, "3600")
        .await
        .unwrap();
    h.log_events(2).await;

    h.service.auto_sync().start().await;
    h.network.set_status(NetworkStatus::Online);

    wait_for_calls(&h, 1).await;
    assert_eq!(h.transport.requests()[0].body["events"].as_array().unwrap().len(), 2);
    h.service.auto_sync().stop();
}

#[tokio::test(start_paused = true)]
async fn test_interval_tick_triggers_sync() {
    let h = HarnessBuilder::new().network(NetworkStatus::Online).build();
    h.log_events(1).await;

    h.service.auto_sync().start().await;
    assert_eq!(h.service.auto_sync().interval().await, Duration::from_secs(300));

    tokio::time::sleep(Duration::from_secs(299)).await;
    assert_eq!(h.transport.calls(), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    wait_for_calls(&h, 1).await;
    h.service.auto_sync().stop();
}

#[tokio::test]
async fn test_interval_preference_overrides_config() {
    let h = harness();
    h.preferences
        .put_string(KEY_AUTO_SYNC_INTERVAL, "45")
        .await
        .unwrap();

    assert_eq!(h.service.auto_sync().interval().await, Duration::from_secs(45));

    h.preferences
        .put_string(KEY_AUTO_SYNC_INTERVAL, "0")
        .await
        .unwrap();
    assert_eq!(h.service.auto_sync().interval().await, Duration::from_secs(300));
}

#[tokio::test]
async fn test_mode_is_persisted() {
    let h = harness();
    let auto_sync = h.service.auto_sync();

    assert_eq!(auto_sync.mode().await, AutoSyncMode::AlwaysOn);
    auto_sync.set_mode(AutoSyncMode::OverWifi).await.unwrap();

    assert_eq!(auto_sync.mode().await, AutoSyncMode::OverWifi);
    assert_eq!(
        h.preferences.get_string(KEY_AUTO_SYNC_MODE).await.unwrap(),
        Some("OVER_WIFI".to_string())
    );
}
