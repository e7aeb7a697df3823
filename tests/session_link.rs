use rosary_companion::infrastructure::bluetooth::mock::MockTransport;
use rosary_companion::infrastructure::bluetooth::protocol::status;
use rosary_companion::infrastructure::bluetooth::robust_io::RetryPolicy;
use rosary_companion::infrastructure::sync::info::{InfoStatus, IntentionsStatus};
use rosary_companion::{
    Backup, CharacteristicRole, ConsentKind, DeviceError, DeviceSession, InfoSync, SessionConfig,
    SessionEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

async fn connect(mock: &MockTransport) -> Result<Arc<DeviceSession>, DeviceError> {
    let (tx, _rx) = mpsc::unbounded_channel();
    DeviceSession::connect(Arc::new(mock.clone()), SessionConfig::default(), tx)
        .await
        .map(Arc::new)
}

#[tokio::test(start_paused = true)]
async fn denied_consent_fails_connect() {
    let mock = MockTransport::rosary().with_hello_reply(status::CONSENT_DENIED);
    let err = connect(&mock).await.err().unwrap();
    assert!(matches!(err, DeviceError::ConsentDenied(ConsentKind::Dashboard)));
    assert!(err.is_fatal());
}

#[tokio::test(start_paused = true)]
async fn connect_emits_connected_event() {
    let mock = MockTransport::rosary();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _session = DeviceSession::connect(Arc::new(mock.clone()), SessionConfig::default(), tx)
        .await
        .unwrap();
    let mut connected = None;
    while let Ok(event) = rx.try_recv() {
        if let SessionEvent::Connected(info) = event {
            connected = Some(info);
        }
    }
    let info = connected.unwrap();
    assert!(info.consent);
    assert!(info.file_system);
}

#[tokio::test(start_paused = true)]
async fn read_recovers_from_two_failures_without_reconnect() {
    let mock = MockTransport::rosary();
    let session = connect(&mock).await.unwrap();
    mock.push_read(CharacteristicRole::Stats, Err("busy"));
    mock.push_read(CharacteristicRole::Stats, Err("busy"));
    mock.push_read(CharacteristicRole::Stats, Ok(b"{\"beads\":3}".to_vec()));

    let value = session.robust_read(CharacteristicRole::Stats).await.unwrap();
    assert_eq!(value, b"{\"beads\":3}");
    assert_eq!(mock.read_count(CharacteristicRole::Stats), 3);
    assert_eq!(mock.open_count(), 1);
    assert_eq!(mock.close_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn pacing_permit_stays_false_until_ready() {
    let mock = MockTransport::new("Rosary-01")
        .with_roles(CharacteristicRole::ALL)
        .with_hello_reply(status::CONSENT_GRANTED);
    let session = connect(&mock).await.unwrap();

    let writer = session.clone();
    let pending = tokio::spawn(async move {
        writer
            .paced_write(CharacteristicRole::Control, &[0x50, 0x01])
            .await
    });
    sleep(Duration::from_millis(500)).await;
    assert_eq!(mock.writes_to(CharacteristicRole::Control).last().unwrap(), &[0x50, 0x01]);
    assert!(!session.pacing().is_ready());
    assert!(!pending.is_finished());

    mock.notify(CharacteristicRole::Status, vec![status::READY]);
    pending.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn snapshot_salvages_truncated_settings() {
    let mock = MockTransport::rosary();
    let session = connect(&mock).await.unwrap();
    mock.set_value(
        CharacteristicRole::Settings,
        b"{\"lang\":\"en\",\"entries\":[{\"t\":1},{\"t\"".to_vec(),
    );
    mock.set_value(CharacteristicRole::Stats, b"{\"beads\":42}\0\0\0".to_vec());
    mock.set_value(CharacteristicRole::Parts, b"{\"parts\":[1,2]}".to_vec());

    let InfoStatus::Ready(snapshot) = InfoSync::new(session).read_snapshot().await.unwrap() else {
        panic!("snapshot not ready");
    };
    assert_eq!(snapshot.settings["lang"], "en");
    assert_eq!(snapshot.stats["beads"], 42);
    assert_eq!(snapshot.parts.unwrap()["parts"][1], 2);
}

#[tokio::test(start_paused = true)]
async fn snapshot_reports_consent_required() {
    let mock = MockTransport::rosary();
    let session = connect(&mock).await.unwrap();
    mock.set_value(CharacteristicRole::Settings, b"{\"requireConsent\":true}".to_vec());
    mock.set_value(CharacteristicRole::Stats, b"{\"beads\":1}".to_vec());

    let status = InfoSync::new(session).read_snapshot().await.unwrap();
    assert_eq!(status, InfoStatus::ConsentRequired);
}

#[tokio::test(start_paused = true)]
async fn refresh_gives_up_and_rebinds_on_empty_payloads() {
    let mock = MockTransport::rosary();
    let session = connect(&mock).await.unwrap();
    mock.set_value(CharacteristicRole::Settings, b"{}".to_vec());
    mock.set_value(CharacteristicRole::Stats, b"{}".to_vec());
    let discovers = mock.discover_count();

    let info = InfoSync::new(session)
        .with_refresh_policy(RetryPolicy::new(4, Duration::from_millis(250), 1.4));
    assert_eq!(info.refresh_until_valid().await.unwrap(), InfoStatus::NotReady);
    assert_eq!(mock.read_count(CharacteristicRole::Settings), 4);
    assert_eq!(mock.discover_count(), discovers + 1);
}

#[tokio::test(start_paused = true)]
async fn intentions_summary_drops_cut_field() {
    let mock = MockTransport::rosary();
    let session = connect(&mock).await.unwrap();
    mock.set_value(
        CharacteristicRole::Intentions,
        b"{\"present\":true,\"count\":2,\"names\":\"Peace\\nHealth\",\"intentions\":[{\"t\":\"Pea".to_vec(),
    );

    let IntentionsStatus::Ready(summary) = InfoSync::new(session).read_intentions().await.unwrap()
    else {
        panic!("consent unexpectedly required");
    };
    assert!(summary.present);
    assert_eq!(summary.count, 2);
    assert_eq!(summary.names, ["Peace", "Health"]);
}

#[tokio::test(start_paused = true)]
async fn backup_file_restores_every_value_in_order() {
    let mock = MockTransport::rosary();
    let session = connect(&mock).await.unwrap();
    let backup = Backup::from_json(
        r#"{
            "device": "rosary-1",
            "fwVersion": "1.4.0",
            "prefs": { "haptic": true, "display": { "brightness": 7 } },
            "stats": {
                "totals": { "beads": 530 },
                "streakDays": 4,
                "lastMystery": { "set": "sorrowful", "index": 2 }
            }
        }"#,
    )
    .unwrap();

    let mut seen = Vec::new();
    backup
        .restore(&session, |done, total| seen.push((done, total)))
        .await
        .unwrap();

    let writes = mock.writes_to(CharacteristicRole::Control);
    let begin = writes.iter().position(|w| w[0] == 0x54).unwrap();
    let restore = &writes[begin..];
    assert_eq!(restore.len(), 95);
    assert_eq!(restore[0][..3], [0x54, 93, 0]);
    assert!(restore[1..94].iter().all(|w| w[0] == 0x50 || w[0] == 0x53));
    assert_eq!(restore[94], vec![0x55]);
    assert_eq!(seen.len(), 93);
    assert_eq!(seen.last(), Some(&(93, 93)));
}
