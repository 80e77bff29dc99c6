// Whole-console scenarios against the simulated PLC

use bench_console::devices::plc::{
    AD_RPM, D0_MODE, M11_READY_STATUS, M12_START_STATUS, M1_READY_CHECK, M2_START, M3_STOP, M6_EXIT,
};
use bench_console::drivers::{ConnectBehavior, MockTransport, WireOp};
use bench_console::error::SupervisorError;
use bench_console::events::drain;
use bench_console::storage::{MemoryStore, SessionStore};
use bench_console::types::{ControlState, LinkEvent, LinkState, PollTier, RegisterKind, TestEvent};
use bench_console::{Console, ConsoleConfig, OperatorCommand, TestMode};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn console(mock: &MockTransport) -> (Console, MemoryStore) {
    console_with(mock, ConsoleConfig::default())
}

fn console_with(mock: &MockTransport, config: ConsoleConfig) -> (Console, MemoryStore) {
    let store = MemoryStore::new();
    let console = Console::new(config, Arc::new(mock.clone()), Box::new(store.clone())).unwrap();
    console.start();
    (console, store)
}

/// Poll `check` in 10 ms steps of virtual time
async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        // the persistence worker runs on a real thread
        std::thread::sleep(Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

fn writes_to(mock: &MockTransport, kind: RegisterKind, address: u16) -> Vec<u16> {
    mock.writes()
        .into_iter()
        .filter(|(k, a, _)| *k == kind && *a == address)
        .map(|(_, _, v)| v)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn cold_start_resets_mode_and_polls_both_tiers() {
    let mock = MockTransport::new();
    mock.set_register(RegisterKind::HoldingRegister, 0, 3);
    let (console, _store) = console(&mock);

    console.connect_to("127.0.0.1", 502).await.unwrap();
    assert_eq!(console.status().link, LinkState::Connected);
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(writes_to(&mock, RegisterKind::HoldingRegister, 0), vec![0]);
    assert_eq!(mock.register(RegisterKind::HoldingRegister, 0), 0);

    let ops = mock.ops();
    let reads_of = |kind: RegisterKind, address: u16| {
        ops.iter()
            .filter(|op| matches!(op, WireOp::Read { kind: k, address: a, .. } if *k == kind && *a == address))
            .count()
    };
    assert!(reads_of(RegisterKind::HoldingRegister, AD_RPM.address) >= 2);
    assert!(reads_of(RegisterKind::Coil, M11_READY_STATUS.address) >= 1);
    assert_eq!(mock.max_in_flight(), 1);
    // one pending read per polled register at most
    let polled = console.poller().polled(PollTier::High).len() + console.poller().polled(PollTier::Low).len();
    assert!(console.status().queued_requests <= polled);

    console.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn operator_runs_a_test_from_ready_check_to_exit() {
    let mock = MockTransport::new();
    let (console, store) = console(&mock);
    let mut tests = console.events().subscribe_tests();
    console.connect_to("127.0.0.1", 502).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    console.start_test(TestMode::TurbostarterColdCranking).unwrap();
    let mut seen = Vec::new();
    assert!(
        wait_until(Duration::from_secs(3), || {
            seen.extend(drain(&mut tests));
            seen.contains(&TestEvent::Started(2))
        })
        .await
    );
    assert_eq!(mock.register(RegisterKind::HoldingRegister, D0_MODE.address), 2);
    assert!(console.status().session_id.is_some());

    mock.set_register(RegisterKind::Coil, M11_READY_STATUS.address, 1);
    assert!(wait_until(Duration::from_secs(3), || console.control_state() == ControlState::StartInterrupt).await);

    assert!(console.trigger(OperatorCommand::Start));
    assert!(wait_until(Duration::from_secs(1), || console.recorder().is_recording()).await);
    mock.set_register(RegisterKind::HoldingRegister, AD_RPM.address, 2271);
    assert!(
        wait_until(Duration::from_secs(3), || {
            console.recorder().samples("AD_PERCENT").last().map(|s| s.value) == Some(50.0)
        })
        .await
    );

    mock.set_register(RegisterKind::Coil, M12_START_STATUS.address, 1);
    assert!(wait_until(Duration::from_secs(3), || console.control_state() == ControlState::Stop).await);
    assert!(!console.trigger(OperatorCommand::Restart));

    assert!(console.trigger(OperatorCommand::Stop));
    assert_eq!(console.control_state(), ControlState::RestartExit);
    assert!(wait_until(Duration::from_secs(1), || !console.recorder().is_recording()).await);

    mock.set_register(RegisterKind::Coil, M11_READY_STATUS.address, 0);
    mock.set_register(RegisterKind::Coil, M12_START_STATUS.address, 0);
    assert!(console.trigger(OperatorCommand::Exit));
    assert!(
        wait_until(Duration::from_secs(3), || {
            seen.extend(drain(&mut tests));
            seen.contains(&TestEvent::Stopped)
        })
        .await
    );
    assert!(wait_until(Duration::from_secs(3), || {
        mock.register(RegisterKind::HoldingRegister, D0_MODE.address) == 0
            && store.sessions().iter().all(|s| s.end_time.is_some())
    })
    .await);

    // one rising and one falling edge per operator command
    assert!(wait_until(Duration::from_secs(3), || writes_to(&mock, RegisterKind::Coil, M6_EXIT.address) == vec![1, 0]).await);
    assert_eq!(writes_to(&mock, RegisterKind::Coil, M2_START.address), vec![1, 0]);
    assert_eq!(writes_to(&mock, RegisterKind::Coil, M3_STOP.address), vec![1, 0]);

    let sessions = store.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].test_type, TestMode::TurbostarterColdCranking.label());
    assert!(store.total_data_points() > 0);
    assert_eq!(console.status().test_mode, None);
    assert_eq!(mock.max_in_flight(), 1);

    console.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn back_to_back_writes_report_only_the_latest() {
    let mock = MockTransport::new();
    let (console, _store) = console(&mock);
    let mut verified = console.events().subscribe_verified();
    console.connect_to("127.0.0.1", 502).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let timeout = Duration::from_millis(3000);
    let first = console.verifier().write_and_verify(D0_MODE, 1, timeout);
    let second = console.verifier().write_and_verify(D0_MODE, 2, timeout);
    assert!(first.is_some() && second > first);

    tokio::time::sleep(Duration::from_secs(5)).await;
    let results: Vec<_> = drain(&mut verified)
        .into_iter()
        .filter(|r| r.register == D0_MODE)
        .map(|r| (r.value, r.success))
        .collect();
    assert_eq!(results, vec![(2, true)]);
    assert_eq!(console.status().pending_verifications, 0);

    console.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rejected_older_write_does_not_fail_the_newer_one() {
    let mock = MockTransport::new();
    let (console, _store) = console(&mock);
    let mut verified = console.events().subscribe_verified();
    console.connect_to("127.0.0.1", 502).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    mock.fail_next_write_to(RegisterKind::HoldingRegister, D0_MODE.address);
    let timeout = Duration::from_millis(3000);
    console.verifier().write_and_verify(D0_MODE, 1, timeout);
    console.verifier().write_and_verify(D0_MODE, 2, timeout);

    tokio::time::sleep(Duration::from_secs(5)).await;
    let results: Vec<_> = drain(&mut verified)
        .into_iter()
        .filter(|r| r.register == D0_MODE)
        .map(|r| (r.value, r.success))
        .collect();
    assert_eq!(results, vec![(2, true)]);
    assert_eq!(mock.register(RegisterKind::HoldingRegister, D0_MODE.address), 2);
    assert_eq!(console.status().link, LinkState::Connected);

    console.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_returns_running_mode_to_idle() {
    let mock = MockTransport::new();
    let mut config = ConsoleConfig::default();
    config.control.write_before_session_confirmed = true;
    let (console, _store) = console_with(&mock, config);
    let mut tests = console.events().subscribe_tests();
    console.connect_to("127.0.0.1", 502).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    console.start_test(TestMode::PowerAdjustment).unwrap();
    let mut seen = Vec::new();
    assert!(
        wait_until(Duration::from_secs(3), || {
            seen.extend(drain(&mut tests));
            seen.contains(&TestEvent::Started(3))
        })
        .await
    );

    console.shutdown().await;
    assert_eq!(writes_to(&mock, RegisterKind::HoldingRegister, D0_MODE.address), vec![0, 3, 0]);
    assert_eq!(mock.register(RegisterKind::HoldingRegister, D0_MODE.address), 0);
    assert_eq!(console.status().link, LinkState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn shutdown_without_a_test_leaves_mode_alone() {
    let mock = MockTransport::new();
    let (console, _store) = console(&mock);
    console.connect_to("127.0.0.1", 502).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    console.shutdown().await;
    assert_eq!(writes_to(&mock, RegisterKind::HoldingRegister, D0_MODE.address), vec![0]);
}

#[tokio::test(start_paused = true)]
async fn connect_stays_refused_until_attempts_are_reset() {
    let mock = MockTransport::new();
    mock.set_connect_behavior(ConnectBehavior::Refuse);
    let (console, _store) = console(&mock);

    assert!(console.connect_to("127.0.0.1", 502).await.is_err());
    assert_eq!(mock.connect_calls(), 3);
    mock.set_connect_behavior(ConnectBehavior::Accept);
    assert_eq!(
        console.connect_to("127.0.0.1", 502).await,
        Err(SupervisorError::TooManyAttempts(3))
    );
    assert_eq!(mock.connect_calls(), 3);

    console.reset_connection_attempts();
    console.connect_to("127.0.0.1", 502).await.unwrap();
    assert_eq!(console.status().link, LinkState::Connected);

    console.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn lost_link_tears_down_and_reconnects_cleanly() {
    let mock = MockTransport::new();
    let (console, _store) = console(&mock);
    let mut link = console.events().subscribe_link();
    console.connect_to("127.0.0.1", 502).await.unwrap();
    // the mode reset goes out first and stays on the wire for a second
    mock.set_reply_delay(Duration::from_secs(1));
    tokio::time::sleep(Duration::from_millis(300)).await;

    // pulse reset is due 1 s after the rising edge
    assert!(console.trigger(OperatorCommand::ReadyCheck));
    tokio::time::sleep(Duration::from_millis(200)).await;
    mock.drop_link();

    assert!(wait_until(Duration::from_secs(2), || console.status().link == LinkState::Disconnected).await);
    assert!(drain(&mut link).contains(&LinkEvent::Disconnected));
    let status = console.status();
    assert_eq!(status.queued_requests, 0);

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(!writes_to(&mock, RegisterKind::Coil, M1_READY_CHECK.address).contains(&0));
    assert_eq!(console.status().queued_requests, 0);
    assert_eq!(console.status().pending_verifications, 0);

    console.reset_connection_attempts();
    console.connect_to("127.0.0.1", 502).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(writes_to(&mock, RegisterKind::HoldingRegister, 0), vec![0, 0]);

    console.shutdown().await;
}
