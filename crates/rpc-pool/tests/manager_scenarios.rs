mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chainbot_rpc_pool::{CircuitState, ConnectionManager, ErrorCategory, RpcConfig, RpcError};
use common::{config, connection_reset, rate_limited, MockConnector, A, B};

async fn started(config: RpcConfig) -> ConnectionManager<MockConnector> {
    let manager = ConnectionManager::new(config, MockConnector::default()).unwrap();
    manager.start().await.unwrap();
    manager
}

#[tokio::test(start_paused = true)]
async fn success_returns_value_and_releases() {
    let manager = started(config(&[A, B], 1, 2)).await;

    let value = manager
        .with_connection(|conn| async move { Ok(conn.endpoint.to_string()) })
        .await
        .unwrap();

    assert_eq!(value, A);
    assert_eq!(manager.get_pool_stats().active, 0);
    manager.shutdown();
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_on_the_same_connection() {
    let manager = started(config(&[A, B], 2, 2)).await;
    let seen = &Mutex::new(Vec::new());

    let value = manager
        .with_connection(move |conn| async move {
            let mut seen = seen.lock().unwrap();
            seen.push(conn.id);
            if seen.len() < 3 {
                Err(connection_reset())
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();

    assert_eq!(value, 42);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|id| *id == seen[0]));
}

#[tokio::test(start_paused = true)]
async fn retry_hooks_see_every_backoff() {
    let retried = Arc::new(Mutex::new(Vec::new()));
    let manager = {
        let retried = retried.clone();
        ConnectionManager::new(config(&[A], 1, 1), MockConnector::default())
            .unwrap()
            .on_retry(move |event| retried.lock().unwrap().push(event.attempt))
    };
    manager.start().await.unwrap();
    let calls = &AtomicUsize::new(0);

    manager
        .with_connection(move |_conn| async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(connection_reset())
            } else {
                Ok(())
            }
        })
        .await
        .unwrap();

    assert_eq!(*retried.lock().unwrap(), vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn should_retry_predicate_overrides_classification() {
    let manager = ConnectionManager::new(config(&[A], 1, 1), MockConnector::default())
        .unwrap()
        .should_retry(|_| false);
    manager.start().await.unwrap();
    let calls = &AtomicUsize::new(0);

    let err = manager
        .with_connection(move |_conn| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(connection_reset())
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(err, RpcError::NonRetryable { .. }));
}

#[tokio::test(start_paused = true)]
async fn repeated_rate_limits_switch_connection() {
    let manager = started(config(&[A, B], 2, 2)).await;
    let calls = &Mutex::new(Vec::new());

    let value = manager
        .with_connection(move |conn| async move {
            calls.lock().unwrap().push(conn.endpoint.to_string());
            if conn.endpoint.as_ref() == A {
                Err(rate_limited(A))
            } else {
                Ok("done")
            }
        })
        .await
        .unwrap();

    assert_eq!(value, "done");
    assert_eq!(*calls.lock().unwrap(), vec![A, A, A, B]);
    assert_eq!(manager.get_pool_stats().active, 0);
}

#[tokio::test(start_paused = true)]
async fn rate_limits_do_not_spend_retries() {
    let mut config = config(&[A, B], 2, 2);
    config.manager.max_retries = 1;
    let manager = started(config).await;
    let calls = &Mutex::new(Vec::new());

    let value = manager
        .with_connection(move |conn| async move {
            calls.lock().unwrap().push(conn.endpoint.to_string());
            if conn.endpoint.as_ref() == A {
                Err(rate_limited(A))
            } else {
                Ok("done")
            }
        })
        .await
        .unwrap();

    assert_eq!(value, "done");
    assert_eq!(*calls.lock().unwrap(), vec![A, A, A, B]);
}

#[tokio::test(start_paused = true)]
async fn rate_limits_spend_retries_once_switches_run_out() {
    let mut config = config(&[A, B], 2, 2);
    config.circuit_breaker.failure_threshold = 100;
    let manager = started(config).await;
    let calls = &Mutex::new(Vec::new());

    let err = manager
        .with_connection(move |conn| async move {
            calls.lock().unwrap().push(conn.endpoint.to_string());
            Err::<(), _>(rate_limited(&conn.endpoint))
        })
        .await
        .unwrap_err();

    // Three hits per connection for each of the three switches, then the
    // initial attempt plus three retries on the last connection.
    assert_eq!(
        *calls.lock().unwrap(),
        vec![A, A, A, B, B, B, A, A, A, B, B, B, B]
    );
    match err {
        RpcError::RetryExhausted { stats, last } => {
            assert_eq!(stats.attempts, 13);
            assert_eq!(stats.errors.len(), 13);
            assert!(!stats.successful);
            assert_eq!(last.verdict().category, ErrorCategory::RateLimit);
        }
        other => panic!("expected RetryExhausted, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn non_retryable_failure_aborts_immediately() {
    let manager = started(config(&[A], 1, 1)).await;
    let calls = &AtomicUsize::new(0);

    let err = manager
        .with_connection(move |_conn| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(RpcError::operation("insufficient funds for fee"))
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    match err {
        RpcError::NonRetryable { classified, .. } => {
            assert_eq!(classified.category, ErrorCategory::Business);
            assert_eq!(classified.metadata.source, A);
            assert_eq!(classified.metadata.operation, "with_connection");
        }
        other => panic!("expected NonRetryable, got {other:?}"),
    }
    assert_eq!(manager.get_pool_stats().active, 0);
}

#[tokio::test(start_paused = true)]
async fn slow_operation_times_out_and_is_retried() {
    let manager = started(config(&[A], 1, 1)).await;
    let calls = &AtomicUsize::new(0);

    let err = manager
        .with_connection_retries(1, move |_conn| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    match err {
        RpcError::RetryExhausted { last, .. } => {
            assert!(matches!(*last, RpcError::Timeout { .. }));
        }
        other => panic!("expected RetryExhausted, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn guarded_calls_short_circuit_once_open() {
    let mut config = config(&[A, B], 2, 2);
    config.manager.max_retries = 0;
    config.circuit_breaker.failure_threshold = 2;
    config.circuit_breaker.reset_timeout = Duration::from_millis(1000);
    let manager = started(config).await;
    let calls = &AtomicUsize::new(0);

    for _ in 0..2 {
        let result = manager
            .with_guarded_connection("price-feed", move |_conn| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(connection_reset())
            })
            .await;
        assert!(matches!(result, Err(RpcError::RetryExhausted { .. })));
    }
    assert_eq!(manager.circuit_breaker().state("price-feed"), CircuitState::Open);

    let result = manager
        .with_guarded_connection("price-feed", move |_conn| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
    assert!(matches!(result, Err(RpcError::CircuitOpen { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    tokio::time::advance(Duration::from_millis(1100)).await;
    manager
        .with_guarded_connection("price-feed", move |_conn| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(manager.circuit_breaker().state("price-feed"), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn open_endpoint_circuit_is_reported_and_skipped() {
    let mut config = config(&[A], 1, 1);
    config.circuit_breaker.failure_threshold = 1;
    let manager = started(config).await;
    let calls = &AtomicUsize::new(0);

    let _ = manager
        .with_connection_retries(0, move |_conn| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(connection_reset())
        })
        .await;
    assert_eq!(manager.get_unhealthy_endpoints(), vec![A.to_string()]);

    let err = manager
        .with_connection(move |_conn| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(err.is_circuit_open());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(manager.get_pool_stats().active, 0);
}

#[tokio::test(start_paused = true)]
async fn start_fails_without_healthy_endpoints() {
    let connector = MockConnector::default();
    connector.set(A, common::Behavior::RefuseConnect);
    let manager = ConnectionManager::new(config(&[A], 1, 1), connector).unwrap();

    assert!(matches!(
        manager.start().await,
        Err(RpcError::NoHealthyEndpoints { .. })
    ));
}

#[test]
fn rejects_invalid_config() {
    let result = ConnectionManager::new(RpcConfig::default(), MockConnector::default());
    assert!(matches!(result, Err(RpcError::InvalidConfig(_))));
}
