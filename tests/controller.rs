use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use boxsync::{
    BoxState, ChannelId, ConnectStageError, ControllerConfig, FakeTransport, FakeTransportConfig,
    FixedPermissions, PermissionError, PermissionStatus, RequestConnectError, RequestOutcome,
    ScanError, ScanFixture, SessionController, SessionError, SessionState, TransportError,
};
use pretty_assertions::assert_eq;

const FIXTURE: &str = "00:11|Speaker|-65;AA:BB|BLEExample|-43";

fn fixture(raw: &str) -> ScanFixture {
    raw.parse().expect("fixture should parse")
}

fn controller(
    transport: &FakeTransport,
    permissions: &FixedPermissions,
    config: ControllerConfig,
) -> SessionController {
    SessionController::new(
        Arc::new(transport.clone()),
        Arc::new(permissions.clone()),
        config,
    )
}

fn default_transport() -> FakeTransport {
    FakeTransport::new(
        FakeTransportConfig::builder()
            .scan_fixture(fixture(FIXTURE))
            .build(),
    )
}

#[tokio::test]
async fn blocked_permission_redirects_to_settings_without_scanning() {
    let transport = default_transport();
    let permissions = FixedPermissions::new(PermissionStatus::Blocked, RequestOutcome::Granted);
    let controller = controller(&transport, &permissions, ControllerConfig::default());

    let result = controller.request_connect().await;

    let error = result.expect_err("blocked permission should not connect");
    assert!(error.requires_settings_redirect());
    assert_matches!(error, RequestConnectError::SettingsRedirect);
    assert_eq!(SessionState::Idle, controller.snapshot().state());
    assert_eq!(0, transport.start_scan_calls());
    assert_eq!(0, permissions.requests());
}

#[tokio::test]
async fn denied_permission_is_requested_once_then_connects() {
    let transport = default_transport();
    let permissions = FixedPermissions::new(PermissionStatus::Denied, RequestOutcome::Granted);
    let controller = controller(&transport, &permissions, ControllerConfig::default());

    let snapshot = controller
        .request_connect()
        .await
        .expect("granted request should connect");

    assert_eq!(SessionState::Connected, snapshot.state());
    assert_eq!(1, permissions.requests());
    assert_eq!(1, transport.stop_scan_calls());
}

#[tokio::test]
async fn refused_permission_reports_not_connected() {
    let transport = default_transport();
    let permissions = FixedPermissions::new(PermissionStatus::Denied, RequestOutcome::Denied);
    let controller = controller(&transport, &permissions, ControllerConfig::default());

    let result = controller.request_connect().await;

    assert_matches!(
        result,
        Err(RequestConnectError::NotConnected {
            status,
            source: ConnectStageError::Permission(permission),
        }) if status == "Unable to connect to `BLEExample`" && *permission == PermissionError::Denied
    );
    assert_eq!(0, transport.start_scan_calls());
}

#[tokio::test(start_paused = true)]
async fn scan_timeout_leaves_the_session_idle() {
    let transport = FakeTransport::new(
        FakeTransportConfig::builder()
            .scan_fixture(fixture("00:11|Speaker|-65"))
            .build(),
    );
    let permissions = FixedPermissions::granted();
    let config = ControllerConfig::builder()
        .scan_timeout(Duration::from_secs(1))
        .build();
    let controller = controller(&transport, &permissions, config);

    let result = controller.request_connect().await;

    let error = result.expect_err("no matching peripheral should be found");
    assert_eq!("Unable to connect to `BLEExample`", error.to_string());
    assert_matches!(
        error,
        RequestConnectError::NotConnected {
            source: ConnectStageError::Scan(scan),
            ..
        } if matches!(*scan, ScanError::NotFound { timeout } if timeout == Duration::from_secs(1))
    );
    assert_eq!(SessionState::Idle, controller.snapshot().state());
    assert_eq!(1, transport.stop_scan_calls());
    assert_eq!(0, transport.connect_calls());
}

#[tokio::test]
async fn scan_that_cannot_start_is_reported() {
    let transport = FakeTransport::new(
        FakeTransportConfig::builder()
            .scan_fixture(fixture(FIXTURE))
            .fail_scan_start(true)
            .build(),
    );
    let controller = controller(&transport, &FixedPermissions::granted(), ControllerConfig::default());

    let result = controller.request_connect().await;

    assert_matches!(
        result,
        Err(RequestConnectError::NotConnected {
            source: ConnectStageError::Scan(scan),
            ..
        }) if matches!(*scan, ScanError::Unavailable(_))
    );
    assert_eq!(SessionState::Idle, controller.snapshot().state());
    assert_eq!(0, transport.stop_scan_calls());
}

#[tokio::test]
async fn connect_failure_is_reported_and_recoverable() {
    let transport = FakeTransport::new(
        FakeTransportConfig::builder()
            .scan_fixture(fixture(FIXTURE))
            .fail_connect(true)
            .build(),
    );
    let controller = controller(&transport, &FixedPermissions::granted(), ControllerConfig::default());

    let result = controller.request_connect().await;

    assert_matches!(
        result,
        Err(RequestConnectError::NotConnected {
            source: ConnectStageError::Session(session),
            ..
        }) if matches!(*session, SessionError::Connect(TransportError::Rejected { .. }))
    );
    assert_eq!(SessionState::Failed, controller.snapshot().state());

    let retry = controller.request_connect().await;
    assert_matches!(retry, Err(RequestConnectError::NotConnected { .. }));
    assert_eq!(2, transport.connect_calls());
}

#[tokio::test]
async fn second_connect_request_is_rejected() {
    let transport = default_transport();
    let controller = controller(&transport, &FixedPermissions::granted(), ControllerConfig::default());
    controller
        .request_connect()
        .await
        .expect("first request should connect");

    let result = controller.request_connect().await;

    assert_matches!(
        result,
        Err(RequestConnectError::NotConnected {
            source: ConnectStageError::Session(session),
            ..
        }) if matches!(*session, SessionError::AlreadyConnected)
    );
    assert_eq!(1, transport.start_scan_calls());
    assert_eq!(1, transport.connect_calls());
}

#[tokio::test]
async fn set_box_value_writes_and_publishes_the_acknowledged_value() {
    let transport = default_transport();
    let controller = controller(&transport, &FixedPermissions::granted(), ControllerConfig::default());
    let connected = controller
        .request_connect()
        .await
        .expect("request should connect");

    let acknowledged = controller
        .set_box_value(true)
        .await
        .expect("write should be acknowledged");

    let snapshot = controller.snapshot();
    assert_eq!(BoxState::On, acknowledged);
    assert_eq!(&BoxState::On, snapshot.box_value().value());
    assert!(snapshot.box_value().revision() > connected.box_value().revision());
    assert_eq!(vec![b"1".to_vec()], transport.written(ChannelId::Box));
}

#[tokio::test]
async fn set_box_value_requires_a_connection() {
    let transport = default_transport();
    let controller = controller(&transport, &FixedPermissions::granted(), ControllerConfig::default());

    let result = controller.set_box_value(true).await;

    assert_matches!(result, Err(SessionError::NotConnected));
    assert!(transport.written(ChannelId::Box).is_empty());
}

#[tokio::test]
async fn request_disconnect_is_idempotent() {
    let transport = default_transport();
    let controller = controller(&transport, &FixedPermissions::granted(), ControllerConfig::default());
    controller
        .request_connect()
        .await
        .expect("request should connect");

    controller
        .request_disconnect()
        .await
        .expect("first disconnect should succeed");
    controller
        .request_disconnect()
        .await
        .expect("second disconnect should be a no-op");

    let snapshot = controller.snapshot();
    assert_eq!(SessionState::Idle, snapshot.state());
    assert!(!snapshot.connection_status());
    assert_eq!(1, transport.disconnect_calls());
    assert_eq!(0, transport.active_subscriptions());
}

#[tokio::test]
async fn open_settings_reaches_the_permission_provider() {
    let transport = default_transport();
    let permissions = FixedPermissions::new(PermissionStatus::Blocked, RequestOutcome::Denied);
    let controller = controller(&transport, &permissions, ControllerConfig::default());

    controller.open_settings().await;

    assert_eq!(1, permissions.settings_opened());
}

#[tokio::test(start_paused = true)]
async fn request_dropped_mid_scan_can_be_retried() {
    let transport = FakeTransport::new(
        FakeTransportConfig::builder()
            .scan_fixture(fixture(FIXTURE))
            .advertise_delay(Duration::from_millis(300))
            .build(),
    );
    let controller = controller(&transport, &FixedPermissions::granted(), ControllerConfig::default());

    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), controller.request_connect()).await;

    assert_matches!(abandoned, Err(_));
    let settled = controller
        .session()
        .settled_state()
        .await
        .expect("session should still be running");
    assert_eq!(SessionState::Idle, settled);

    let snapshot = controller
        .request_connect()
        .await
        .expect("retry should connect");

    assert_eq!(SessionState::Connected, snapshot.state());
    assert_eq!(2, transport.start_scan_calls());
    assert_eq!(1, transport.connect_calls());
}
