mod test_utils;

use cairn_telemetry::prefs::{SharedPreferences, KEY_LAST_SYNCED_TIME_STAMP};
use cairn_telemetry::{SyncRequest, TelemetryStat};
use test_utils::harness;

#[tokio::test]
async fn test_stat_counts_raw_and_packed_events() {
    let h = harness();
    h.log_events(12).await;
    for _ in 0..4 {
        assert_eq!(h.service.sync_handler().process_events_batch().await.unwrap(), 3);
    }
    h.log_events(10).await;

    let stat = h.service.get_telemetry_stat().await.unwrap();

    assert_eq!(
        stat,
        TelemetryStat {
            un_synced_event_count: 22,
            last_sync_time: 0,
        }
    );
}

#[tokio::test]
async fn test_stat_after_sync() {
    let h = harness();
    h.log_events(5).await;

    let synced = h.service.sync(Some(SyncRequest::forced())).await;
    let stat = h.service.get_telemetry_stat().await.unwrap();

    assert_eq!(stat.un_synced_event_count, 0);
    assert_eq!(Some(stat.last_sync_time), synced.sync_time);
}

#[tokio::test]
async fn test_failed_sync_leaves_events_counted() {
    let h = test_utils::HarnessBuilder::new()
        .transport(test_utils::CountingTransport::failing_from(0))
        .build();
    h.log_events(4).await;

    h.service.sync(Some(SyncRequest::forced())).await;
    let stat = h.service.get_telemetry_stat().await.unwrap();

    assert_eq!(stat.un_synced_event_count, 4);
    assert_eq!(stat.last_sync_time, 0);
}

#[tokio::test]
async fn test_unparsable_last_sync_time_is_error() {
    let h = harness();
    h.preferences
        .put_string(KEY_LAST_SYNCED_TIME_STAMP, "yesterday")
        .await
        .unwrap();

    assert!(h.service.get_telemetry_stat().await.is_err());
}
