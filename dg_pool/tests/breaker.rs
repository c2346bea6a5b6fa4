//! ABOUTME: Integration tests for circuit breaker behaviour through the connection manager
//! ABOUTME: Drives the manager with a scripted connector on a paused clock

use std::sync::Arc;
use std::time::Duration;

use dg_core::{BackendError, BackendErrorKind, Error};
use dg_pool::{CircuitState, ConnectionManager};
use futures_util::FutureExt;
use test_support::{test_manager_config, ScriptedConnector};
use tokio::time::advance;

fn refused() -> BackendError {
    BackendError::new(BackendErrorKind::ConnectionRefused, "connection refused")
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_after_threshold_and_recovers() {
    let connector = ScriptedConnector::failing(refused());
    let manager = ConnectionManager::new(connector, test_manager_config(4));

    // Failures at t=0, t=10ms, t=20ms
    for _ in 0..3 {
        let err = manager.acquire().await.unwrap_err();
        assert!(matches!(err, Error::ConnectFailed(_)));
        advance(Duration::from_millis(10)).await;
    }
    let state = manager.get_state();
    assert!(state.circuit_open);
    assert_eq!(state.failure_count, 3);
    assert_eq!(state.breaker_trips, 1);
    assert_eq!(manager.pool().connector().attempts(), 3);

    // t=100ms: refused without reaching the store
    advance(Duration::from_millis(70)).await;
    match manager.acquire().await {
        Err(Error::ResourceUnavailable { retry_after }) => {
            assert_eq!(retry_after, Duration::from_millis(29_920));
        }
        other => panic!("expected ResourceUnavailable, got {other:?}"),
    }
    assert_eq!(manager.pool().connector().attempts(), 3);

    // t=30019ms: still inside the window
    advance(Duration::from_millis(29_919)).await;
    assert!(matches!(
        manager.acquire().await,
        Err(Error::ResourceUnavailable { .. })
    ));
    assert_eq!(manager.pool().connector().attempts(), 3);

    // t=30025ms: cool-down elapsed, the store is back
    advance(Duration::from_millis(6)).await;
    assert_eq!(manager.get_state().circuit_state, CircuitState::HalfOpen);
    manager.pool().connector().recover();

    let conn = manager.acquire().await.unwrap();
    conn.release();

    let state = manager.get_state();
    assert!(!state.circuit_open);
    assert_eq!(state.circuit_state, CircuitState::Closed);
    assert_eq!(state.failure_count, 0);
    assert!(state.is_connected);
    assert_eq!(manager.pool().connector().attempts(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_failed_probe_reopens_for_fresh_window() {
    let connector = ScriptedConnector::failing(refused());
    let manager = ConnectionManager::new(connector, test_manager_config(2));

    for _ in 0..3 {
        let _ = manager.acquire().await;
    }
    assert!(manager.get_state().circuit_open);

    advance(Duration::from_millis(30_001)).await;
    let err = manager.acquire().await.unwrap_err();
    assert!(matches!(err, Error::ConnectFailed(_)));
    assert_eq!(manager.pool().connector().attempts(), 4);

    let state = manager.get_state();
    assert!(state.circuit_open);
    assert_eq!(state.breaker_trips, 2);

    match manager.acquire().await {
        Err(Error::ResourceUnavailable { retry_after }) => {
            assert_eq!(retry_after, Duration::from_millis(30_000));
        }
        other => panic!("expected ResourceUnavailable, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_skips_operation_entirely() {
    let connector = ScriptedConnector::failing(refused());
    let manager = ConnectionManager::new(connector, test_manager_config(2));
    for _ in 0..3 {
        let _ = manager.acquire().await;
    }

    let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let counted = Arc::clone(&calls);
    let result: dg_core::Result<()> = manager
        .with_connection(move |_conn| {
            counted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Ok(()) }.boxed()
        })
        .await;

    let err = result.unwrap_err();
    assert!(err.is_retry_later());
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(manager.pool().connector().attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_success_resets_failure_count_below_threshold() {
    let connector = ScriptedConnector::healthy();
    connector.queue_failures(2, refused());
    let manager = ConnectionManager::new(connector, test_manager_config(2));

    let _ = manager.acquire().await;
    let _ = manager.acquire().await;
    assert_eq!(manager.get_state().failure_count, 2);

    manager.acquire().await.unwrap().release();
    let state = manager.get_state();
    assert_eq!(state.failure_count, 0);
    assert_eq!(state.circuit_state, CircuitState::Closed);
    assert_eq!(state.total_errors, 2);
}

#[tokio::test(start_paused = true)]
async fn test_only_one_probe_reaches_the_store() {
    let connector = ScriptedConnector::failing(refused());
    let manager = ConnectionManager::new(connector, test_manager_config(4));
    for _ in 0..3 {
        let _ = manager.acquire().await;
    }

    advance(Duration::from_millis(30_001)).await;
    manager.pool().connector().recover();
    manager
        .pool()
        .connector()
        .set_connect_delay(Duration::from_millis(100));

    let (probe, concurrent) = tokio::join!(manager.acquire(), manager.acquire());

    match concurrent {
        Err(Error::ResourceUnavailable { retry_after }) => assert_eq!(retry_after, Duration::ZERO),
        other => panic!("expected ResourceUnavailable, got {other:?}"),
    }
    probe.unwrap().release();
    assert_eq!(manager.pool().connector().attempts(), 4);
    assert_eq!(manager.get_state().circuit_state, CircuitState::Closed);
}
