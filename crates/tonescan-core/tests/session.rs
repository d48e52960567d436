mod support;

use pretty_assertions::assert_eq;
use std::time::Duration;
use tokio::time::Instant;
use tonescan_core::protocol::{Command, LabColor, ProtocolError, SessionConfig, SessionState};

use support::{colorimeter, init_tracing, LabReply, MockTransport, MOCK_PORT};

fn sample_lab() -> LabColor {
    LabColor::new(58.43, 12.01, 15.92)
}

#[tokio::test(start_paused = true)]
async fn test_connect_sends_unlock_and_discards_ack() {
    init_tracing();
    let mock = MockTransport::new().with(|d| d.unlock_ack = b"OK\r\n".to_vec());
    let session = mock.session();

    session.connect(&colorimeter(MOCK_PORT)).await.unwrap();

    assert_eq!(session.state(), SessionState::Ready);
    let device = mock.state();
    assert_eq!(device.commands(), vec![Some(Command::Unlock)]);
    assert_eq!(device.pending_bytes(), 0);
    assert_eq!(device.opens, 1);
}

#[tokio::test(start_paused = true)]
async fn test_scan_assembles_split_reply() {
    let bytes = sample_lab().to_le_bytes();
    let mock = MockTransport::new().with(|d| {
        d.lab_script.push_back(LabReply::Chunks(vec![
            bytes[0..5].to_vec(),
            bytes[5..9].to_vec(),
            bytes[9..12].to_vec(),
        ]));
    });
    let session = mock.session();
    session.connect(&colorimeter(MOCK_PORT)).await.unwrap();

    let measurement = session.scan().await.unwrap();
    assert_eq!(measurement.lab, sample_lab());
}

#[tokio::test(start_paused = true)]
async fn test_scan_command_sequence_and_hard_reset() {
    let mock = MockTransport::new().with(|d| d.default_lab = Some(sample_lab()));
    let session = mock.session();
    session.connect(&colorimeter(MOCK_PORT)).await.unwrap();

    session.scan().await.unwrap();

    let device = mock.state();
    assert_eq!(
        device.commands(),
        vec![
            Some(Command::Unlock),
            Some(Command::TriggerMeasurement),
            Some(Command::FetchLabResult),
            Some(Command::Unlock),
        ]
    );
    // initial open + reopen after the scan
    assert_eq!(device.opens, 2);
    assert_eq!(device.closes, 1);
    assert_eq!(device.open_links, 1);
    drop(device);
    assert_eq!(session.state(), SessionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_scan_returns_reading_when_reset_fails() {
    let mock = MockTransport::new().with(|d| d.default_lab = Some(sample_lab()));
    let session = mock.session();
    session.connect(&colorimeter(MOCK_PORT)).await.unwrap();
    mock.state().fail_open = true;

    let measurement = session.scan().await.unwrap();
    assert_eq!(measurement.lab, sample_lab());
    assert_eq!(session.state(), SessionState::Idle);
    assert!(!session.is_connected());

    let device = mock.state();
    assert_eq!(device.opens, 1);
    assert_eq!(device.closes, 1);
    assert_eq!(device.open_links, 0);
}

#[tokio::test(start_paused = true)]
async fn test_scan_times_out_at_deadline() {
    let mock = MockTransport::new().with(|d| d.lab_script.push_back(LabReply::Silent));
    let config = SessionConfig {
        scan_attempts: 1,
        ..SessionConfig::default()
    };
    let session = mock.session_with(config);
    session.connect(&colorimeter(MOCK_PORT)).await.unwrap();

    let start = Instant::now();
    let err = session.scan().await.unwrap_err();
    let elapsed = start.elapsed();

    assert!(elapsed >= Duration::from_secs(5), "gave up early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(7), "took too long: {:?}", elapsed);
    assert!(matches!(
        err.root_cause(),
        ProtocolError::MeasurementTimeout {
            received: 0,
            expected: 12
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_partial_reply_reports_received_bytes() {
    let bytes = sample_lab().to_le_bytes();
    let mock = MockTransport::new().with(|d| {
        d.lab_script
            .push_back(LabReply::Chunks(vec![bytes[0..5].to_vec()]));
    });
    let session = mock.session_with(SessionConfig {
        scan_attempts: 1,
        ..SessionConfig::default()
    });
    session.connect(&colorimeter(MOCK_PORT)).await.unwrap();

    let err = session.scan().await.unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::MeasurementFailed { attempts: 1, .. }
    ));
    assert!(matches!(
        err.root_cause(),
        ProtocolError::MeasurementTimeout { received: 5, .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_scan_retries_once_after_reconnect() {
    init_tracing();
    let mock = MockTransport::new().with(|d| {
        d.lab_script.push_back(LabReply::Silent);
        d.lab_script.push_back(LabReply::whole(sample_lab()));
    });
    let session = mock.session();
    session.connect(&colorimeter(MOCK_PORT)).await.unwrap();

    let measurement = session.scan().await.unwrap();
    assert_eq!(measurement.lab, sample_lab());

    let device = mock.state();
    assert_eq!(device.count(Command::FetchLabResult), 2);
    // connect, retry reconnect, reset after success
    assert_eq!(device.opens, 3);
    assert_eq!(device.count(Command::Unlock), 3);
    assert_eq!(device.open_links, 1);
}

#[tokio::test(start_paused = true)]
async fn test_scan_fails_after_retry_exhausted() {
    let mock = MockTransport::new().with(|d| {
        d.lab_script.push_back(LabReply::Silent);
        d.lab_script.push_back(LabReply::Silent);
        d.lab_script.push_back(LabReply::whole(sample_lab()));
    });
    let session = mock.session();
    session.connect(&colorimeter(MOCK_PORT)).await.unwrap();

    let err = session.scan().await.unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::MeasurementFailed { attempts: 2, .. }
    ));
    assert!(matches!(
        err.root_cause(),
        ProtocolError::MeasurementTimeout { .. }
    ));

    // No third attempt; the link is released
    let device = mock.state();
    assert_eq!(device.count(Command::FetchLabResult), 2);
    assert_eq!(device.open_links, 0);
    drop(device);
    assert_eq!(session.state(), SessionState::Idle);
    assert!(matches!(
        session.scan().await,
        Err(ProtocolError::NotConnected)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_retry_fails_when_device_disappears() {
    let mock = MockTransport::new().with(|d| d.lab_script.push_back(LabReply::Silent));
    let session = mock.session();
    session.connect(&colorimeter(MOCK_PORT)).await.unwrap();
    mock.state().devices.clear();

    let err = session.scan().await.unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::MeasurementFailed { attempts: 1, .. }
    ));
    assert!(matches!(err.root_cause(), ProtocolError::DeviceNotFound));
    assert_eq!(mock.state().open_links, 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_rediscovers_same_vendor_on_new_port() {
    let mock = MockTransport::new().with(|d| d.lab_script.push_back(LabReply::Silent));
    let session = mock.session();
    session.connect(&colorimeter(MOCK_PORT)).await.unwrap();
    mock.state().devices = vec![colorimeter("/dev/ttyACM1")];

    session.scan().await.unwrap();
    assert_eq!(
        session.descriptor().await.map(|d| d.path),
        Some("/dev/ttyACM1".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_connect_is_rejected() {
    let mock = MockTransport::new().with(|d| d.open_delay = Some(Duration::from_millis(50)));
    let session = mock.session();
    let device = colorimeter(MOCK_PORT);

    let (first, second) = tokio::join!(session.connect(&device), session.connect(&device));

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(ProtocolError::ConnectInProgress)))
            .count(),
        1
    );
    assert_eq!(mock.state().opens, 1);
    assert_eq!(session.state(), SessionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_connect_while_connected_is_rejected() {
    let mock = MockTransport::new();
    let session = mock.session();
    session.connect(&colorimeter(MOCK_PORT)).await.unwrap();

    assert!(matches!(
        session.connect(&colorimeter(MOCK_PORT)).await,
        Err(ProtocolError::AlreadyConnected)
    ));
    assert_eq!(mock.state().opens, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_unlock_closes_link() {
    let mock = MockTransport::new().with(|d| d.fail_unlock_write = true);
    let session = mock.session();

    let err = session.connect(&colorimeter(MOCK_PORT)).await.unwrap_err();
    assert!(matches!(err, ProtocolError::LinkWriteFailed(_)));

    let device = mock.state();
    assert_eq!(device.opens, 1);
    assert_eq!(device.closes, 1);
    assert_eq!(device.open_links, 0);
    drop(device);
    assert_eq!(session.state(), SessionState::Idle);

    // The in-progress flag was released
    mock.state().fail_unlock_write = false;
    session.connect(&colorimeter(MOCK_PORT)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_open_failure_propagates() {
    let mock = MockTransport::new().with(|d| d.fail_open = true);
    let session = mock.session();

    let err = session.connect(&colorimeter(MOCK_PORT)).await.unwrap_err();
    assert!(matches!(err, ProtocolError::LinkOpenFailed { .. }));
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_drain_precedes_every_write_across_scans() {
    let mock = MockTransport::new().with(|d| {
        d.unlock_ack = b"OK\r\n".to_vec();
        d.trigger_ack = vec![0x06];
        d.trailing = b"\r\n\0".to_vec();
        d.default_lab = Some(sample_lab());
    });
    let session = mock.session();
    session.connect(&colorimeter(MOCK_PORT)).await.unwrap();

    session.scan().await.unwrap();
    session.scan().await.unwrap();

    let device = mock.state();
    assert_eq!(device.count(Command::TriggerMeasurement), 2);
    assert!(
        device.pending_at_write.iter().all(|&n| n == 0),
        "stale bytes present at write: {:?}",
        device.pending_at_write
    );
}

#[tokio::test(start_paused = true)]
async fn test_drain_after_failed_scan_before_next_connect() {
    let mock = MockTransport::new().with(|d| {
        d.trailing = b"\r\n".to_vec();
        d.lab_script.push_back(LabReply::Chunks(vec![vec![0x01; 4]]));
        d.lab_script.push_back(LabReply::Chunks(vec![vec![0x02; 4]]));
    });
    let session = mock.session();
    session.connect(&colorimeter(MOCK_PORT)).await.unwrap();

    assert!(session.scan().await.is_err());
    session.connect(&colorimeter(MOCK_PORT)).await.unwrap();
    session.scan().await.unwrap();

    let device = mock.state();
    assert!(device.pending_at_write.iter().all(|&n| n == 0));
}

#[tokio::test(start_paused = true)]
async fn test_non_finite_reading_is_rejected() {
    let mock = MockTransport::new().with(|d| {
        d.lab_script
            .push_back(LabReply::whole(LabColor::new(f32::NAN, 0.0, 0.0)));
        d.lab_script
            .push_back(LabReply::whole(LabColor::new(f32::INFINITY, 0.0, 0.0)));
    });
    let session = mock.session();
    session.connect(&colorimeter(MOCK_PORT)).await.unwrap();

    let err = session.scan().await.unwrap_err();
    assert!(matches!(
        err.root_cause(),
        ProtocolError::InvalidReading { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_full_report_keeps_link_open() {
    let mock = MockTransport::new().with(|d| {
        d.report = vec![
            b"CIELAB,58.43,12.01,15.92\r\n".to_vec(),
            b"OTHER,1\r\n".to_vec(),
        ];
    });
    let session = mock.session();
    session.connect(&colorimeter(MOCK_PORT)).await.unwrap();

    let report = session.fetch_full_report().await.unwrap();
    assert_eq!(report.get("CIELAB"), Some(&[58.43, 12.01, 15.92][..]));
    assert!(report.get("OTHER").is_none());

    let device = mock.state();
    assert_eq!(device.opens, 1);
    assert_eq!(device.count(Command::FetchFullReport), 1);
    drop(device);
    assert_eq!(session.state(), SessionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_query_name_and_version() {
    let mock = MockTransport::new();
    let session = mock.session();
    session.connect(&colorimeter(MOCK_PORT)).await.unwrap();

    assert_eq!(session.query_name().await.unwrap(), "MOCK");
    assert_eq!(session.query_version().await.unwrap(), "0.0.1");
}

#[tokio::test(start_paused = true)]
async fn test_operations_require_connection() {
    let session = MockTransport::new().session();
    let mut updates = session.subscribe();
    assert!(matches!(session.scan().await, Err(ProtocolError::NotConnected)));
    assert!(matches!(
        session.fetch_full_report().await,
        Err(ProtocolError::NotConnected)
    ));
    assert!(matches!(
        session.query_name().await,
        Err(ProtocolError::NotConnected)
    ));

    // Rejected calls never leave Idle
    assert!(!updates.has_changed().unwrap());
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_idempotent() {
    let mock = MockTransport::new();
    let session = mock.session();
    session.connect(&colorimeter(MOCK_PORT)).await.unwrap();

    session.disconnect().await;
    session.disconnect().await;

    assert_eq!(session.state(), SessionState::Idle);
    let device = mock.state();
    assert_eq!(device.closes, 1);
    assert_eq!(device.open_links, 0);
}
