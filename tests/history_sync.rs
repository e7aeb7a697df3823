mod support;

use rosary_companion::domain::history::{HistorySummary, RECORD_SIZE};
use rosary_companion::infrastructure::bluetooth::mock::MockTransport;
use rosary_companion::infrastructure::sync::history::{self, HistoryProtocol};
use rosary_companion::infrastructure::transfer::session::ChunkLimits;
use rosary_companion::infrastructure::transfer::{BulkTransferEngine, DownloadEnd};
use rosary_companion::{AbortReason, CharacteristicRole, HistorySync, SyncQueue, TransferTiming};
use rosary_companion::DeviceSession;
use std::sync::Arc;
use std::time::Duration;
use support::{sample_history, SimulatedFs};
use tokio::time::{sleep, Instant};

fn history_sync(session: Arc<DeviceSession>) -> HistorySync {
    HistorySync::new(
        session,
        TransferTiming::default(),
        ChunkLimits::default(),
        SyncQueue::new(),
    )
}

#[tokio::test(start_paused = true)]
async fn restore_then_download_reproduces_bytes() {
    let sim = SimulatedFs::new(Vec::new());
    let session = sim.connect().await;
    let history = history_sync(session);

    let original = sample_history(100);
    let (upload, listing) = history.restore(&original).await.unwrap();
    assert_eq!(upload.sent, original.len());
    assert_eq!(listing.files[0].size, original.len() as u64);
    assert_eq!(sim.history(), original);

    let download = history.download().await.unwrap();
    assert_eq!(download.outcome.bytes, original);
    assert_eq!(download.outcome.end, DownloadEnd::SizeReached);
    assert_eq!(download.records.len(), 100);
    assert_eq!(download.summary.records, 100);
    // The client never deletes or recreates the archive.
    assert!(sim
        .mock
        .writes_to(CharacteristicRole::FsControl)
        .iter()
        .all(|w| !(0x74..=0x76).contains(&w[0])));
}

#[tokio::test(start_paused = true)]
async fn upload_of_500_bytes_sends_three_crc_framed_chunks() {
    let sim = SimulatedFs::new(Vec::new());
    let session = sim.connect().await;
    let engine = BulkTransferEngine::new(
        session,
        HistoryProtocol,
        TransferTiming::default(),
        ChunkLimits::new(40, 200, 16),
    );

    let payload: Vec<u8> = (0..500u32).map(|i| (i * 7 % 251) as u8).collect();
    let begin = history::restore_begin_frame(payload.len()).unwrap();
    let outcome = engine
        .upload("history.bin", &begin, &payload, 200)
        .await
        .unwrap();
    assert_eq!(outcome.frames, 3);

    let frames = sim.data_frames(history::op::RESTORE_DATA);
    let sizes: Vec<usize> = frames.iter().map(|f| f.len() - 5).collect();
    assert_eq!(sizes, [200, 200, 100]);
    let mut offset = 0;
    for frame in &frames {
        let chunk = &frame[1..frame.len() - 4];
        assert_eq!(chunk, &payload[offset..offset + chunk.len()]);
        let trailer = &frame[frame.len() - 4..];
        assert_eq!(trailer, crc32fast::hash(chunk).to_le_bytes());
        offset += chunk.len();
    }
    assert_eq!(sim.state.lock().unwrap().rejected_frames, 0);
}

#[tokio::test(start_paused = true)]
async fn short_download_keeps_what_arrived() {
    let sim = SimulatedFs::new(sample_history(160));
    sim.configure(|fs| fs.announce_override = Some(1000));
    let session = sim.connect().await;
    let history = history_sync(session);

    let download = history.download().await.unwrap();
    assert_eq!(download.outcome.bytes.len(), 800);
    assert_eq!(download.outcome.announced, Some(1000));
    assert_eq!(download.outcome.end, DownloadEnd::IdleRounds);
    assert!(!download.outcome.is_complete());
    assert_eq!(download.records.len(), 800 / RECORD_SIZE);
}

#[tokio::test(start_paused = true)]
async fn silent_device_ends_after_idle_rounds() {
    let sim = SimulatedFs::new(Vec::new());
    sim.configure(|fs| fs.silent = true);
    let session = sim.connect().await;
    let history = history_sync(session);

    let started = Instant::now();
    let download = history.download().await.unwrap();
    let elapsed = started.elapsed();
    assert!(download.outcome.bytes.is_empty());
    assert_eq!(download.outcome.end, DownloadEnd::IdleRounds);
    assert_eq!(download.summary, HistorySummary::default());
    assert!(elapsed >= Duration::from_millis(5 * 650));
    assert!(elapsed < Duration::from_secs(30));

    let nexts = sim
        .mock
        .writes_to(CharacteristicRole::FsControl)
        .into_iter()
        .filter(|w| w.first() == Some(&history::op::NEXT))
        .count();
    assert_eq!(nexts, 5);
}

#[tokio::test(start_paused = true)]
async fn verified_download_rejects_wrong_crc() {
    let bytes = sample_history(20);
    let sim = SimulatedFs::new(bytes.clone());
    let session = sim.connect().await;
    let history = history_sync(session);

    let good = crc32fast::hash(&bytes);
    assert!(history.download_verified(good).await.is_ok());

    let err = history.download_verified(good ^ 1).await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(
        err.abort_reason(),
        Some(&AbortReason::CrcMismatch {
            expected: Some(good ^ 1),
            actual: Some(good),
        })
    );
}

#[tokio::test(start_paused = true)]
async fn credit_stall_halves_the_chunk() {
    let sim = SimulatedFs::new(Vec::new());
    sim.configure(|fs| {
        fs.initial_credits = 1;
        fs.auto_credit = false;
    });
    let session = sim.connect().await;
    let engine = BulkTransferEngine::new(
        session,
        HistoryProtocol,
        TransferTiming::default(),
        ChunkLimits::default(),
    );

    let feeder = sim.mock.clone();
    tokio::spawn(async move {
        sleep(Duration::from_secs(3)).await;
        feeder.notify(CharacteristicRole::FsStatus, vec![0x01, 0, 0, 0, 0]);
    });

    let payload = vec![0x5A; 300];
    let begin = history::restore_begin_frame(payload.len()).unwrap();
    engine
        .upload("history.bin", &begin, &payload, 200)
        .await
        .unwrap();

    let sizes: Vec<usize> = sim
        .data_frames(history::op::RESTORE_DATA)
        .iter()
        .map(|f| f.len() - 5)
        .collect();
    assert_eq!(sizes, [200, 100]);
}

#[tokio::test(start_paused = true)]
async fn device_crc_rejection_aborts_upload() {
    let sim = SimulatedFs::new(Vec::new());
    let session = sim.connect().await;
    let history = history_sync(session);
    // Forget the upload right after BEGIN so every DATA frame is refused.
    sim.mock.on_write({
        let state = sim.state.clone();
        move |uuid, frame| {
            if uuid == MockTransport::uuid(CharacteristicRole::FsControl)
                && frame.first() == Some(&history::op::RESTORE_BEGIN)
            {
                state.lock().unwrap().upload = None;
            }
            Vec::new()
        }
    });

    let err = history.restore(&sample_history(4)).await.unwrap_err();
    assert!(matches!(
        err.abort_reason(),
        Some(AbortReason::CrcMismatch { actual: None, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn rtc_frame_goes_to_fs_control() {
    let sim = SimulatedFs::new(Vec::new());
    let session = sim.connect().await;
    let history = history_sync(session);
    let now = chrono::NaiveDate::from_ymd_opt(2025, 12, 24)
        .unwrap()
        .and_hms_opt(23, 59, 0)
        .unwrap();
    history.set_rtc(now).await.unwrap();

    let last = sim
        .mock
        .writes_to(CharacteristicRole::FsControl)
        .pop()
        .unwrap();
    assert_eq!(last, history::rtc_frame(&now));
}

#[tokio::test(start_paused = true)]
async fn abort_stops_download_and_closes() {
    let sim = SimulatedFs::new(Vec::new());
    sim.configure(|fs| fs.silent = true);
    let session = sim.connect().await;
    let history = history_sync(session);

    let abort = history.abort_handle();
    tokio::spawn(async move {
        sleep(Duration::from_millis(1000)).await;
        abort.abort();
    });

    let err = history.download().await.unwrap_err();
    assert_eq!(err.abort_reason(), Some(&AbortReason::Cancelled));
    let last = sim
        .mock
        .writes_to(CharacteristicRole::FsControl)
        .pop()
        .unwrap();
    assert_eq!(last, [history::op::CLOSE]);
}

#[tokio::test(start_paused = true)]
async fn abort_before_download_cancels_only_that_download() {
    let bytes = sample_history(10);
    let sim = SimulatedFs::new(bytes.clone());
    let session = sim.connect().await;
    let history = history_sync(session);

    history.abort_handle().abort();
    let err = history.download().await.unwrap_err();
    assert_eq!(err.abort_reason(), Some(&AbortReason::Cancelled));
    assert!(!sim
        .mock
        .writes_to(CharacteristicRole::FsControl)
        .iter()
        .any(|w| w.first() == Some(&history::op::OPEN)));

    let download = history.download().await.unwrap();
    assert_eq!(download.outcome.bytes, bytes);
}

#[tokio::test(start_paused = true)]
async fn restore_without_initial_credit_aborts() {
    let sim = SimulatedFs::new(Vec::new());
    sim.configure(|fs| fs.initial_credits = 0);
    let session = sim.connect().await;
    let history = history_sync(session);

    let started = Instant::now();
    let err = history.restore(&sample_history(4)).await.unwrap_err();
    assert_eq!(err.abort_reason(), Some(&AbortReason::NoInitialCredit));
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert!(sim.data_frames(history::op::RESTORE_DATA).is_empty());
}

#[tokio::test(start_paused = true)]
async fn upload_without_further_credits_times_out() {
    let sim = SimulatedFs::new(Vec::new());
    sim.configure(|fs| {
        fs.initial_credits = 1;
        fs.auto_credit = false;
    });
    let session = sim.connect().await;
    let engine = BulkTransferEngine::new(
        session,
        HistoryProtocol,
        TransferTiming::default(),
        ChunkLimits::default(),
    );

    let payload = vec![0x11; 300];
    let begin = history::restore_begin_frame(payload.len()).unwrap();
    let err = engine
        .upload("history.bin", &begin, &payload, 200)
        .await
        .unwrap_err();
    assert_eq!(err.abort_reason(), Some(&AbortReason::StallTimeout));
    assert_eq!(sim.data_frames(history::op::RESTORE_DATA).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn chunk_write_gives_up_after_three_attempts() {
    let sim = SimulatedFs::new(Vec::new());
    let session = sim.connect().await;
    let history = history_sync(session);
    let link = sim.mock.clone();
    sim.mock.on_write(move |uuid, frame| {
        if uuid == MockTransport::uuid(CharacteristicRole::FsControl)
            && frame.first() == Some(&history::op::RESTORE_BEGIN)
        {
            link.fail_next_writes(CharacteristicRole::FsControl, 3);
        }
        Vec::new()
    });

    let err = history.restore(&sample_history(4)).await.unwrap_err();
    assert_eq!(
        err.abort_reason(),
        Some(&AbortReason::WriteFailed { attempts: 3 })
    );
    assert!(sim.data_frames(history::op::RESTORE_DATA).is_empty());
}

#[tokio::test(start_paused = true)]
async fn link_loss_mid_download_aborts_instead_of_truncating() {
    let sim = SimulatedFs::new(sample_history(200));
    sim.configure(|fs| fs.serve_chunk = 20);
    let session = sim.connect().await;
    let history = history_sync(session);
    let link = sim.mock.clone();
    let mut nexts = 0;
    sim.mock.on_write(move |uuid, frame| {
        if uuid == MockTransport::uuid(CharacteristicRole::FsControl)
            && frame.first() == Some(&history::op::NEXT)
        {
            nexts += 1;
            if nexts == 5 {
                link.drop_link();
            }
        }
        Vec::new()
    });

    let err = history.download().await.unwrap_err();
    assert_eq!(err.abort_reason(), Some(&AbortReason::Disconnected));
}

#[tokio::test(start_paused = true)]
async fn link_loss_mid_upload_aborts() {
    let sim = SimulatedFs::new(Vec::new());
    let session = sim.connect().await;
    let history = history_sync(session);
    let link = sim.mock.clone();
    sim.mock.on_write(move |uuid, frame| {
        if uuid == MockTransport::uuid(CharacteristicRole::FsControl)
            && frame.first() == Some(&history::op::RESTORE_DATA)
        {
            link.drop_link();
        }
        Vec::new()
    });

    let err = history.restore(&sample_history(100)).await.unwrap_err();
    assert_eq!(err.abort_reason(), Some(&AbortReason::Disconnected));
    assert_eq!(sim.data_frames(history::op::RESTORE_DATA).len(), 1);
}
