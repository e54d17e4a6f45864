//! Stale-connection retry policy of the orchestration service

mod common;

use common::{closing_mock, factories_with, Counters, MockBackend};
use libwgctl::driver::{BackendKind, Device, ForeignServer};
use libwgctl::error::WgctlError;
use libwgctl::{BackendTarget, WireguardService};
use std::sync::atomic::Ordering;

fn target() -> BackendTarget {
    BackendTarget::new("edge", BackendKind::Exec, "exec:///etc/wireguard")
}

fn stale() -> WgctlError {
    WgctlError::DBus("connection closed".to_string()).stale()
}

#[tokio::test]
async fn test_stale_error_recreates_and_retries_once() {
    let counters = Counters::default();
    let service = WireguardService::new(factories_with(&counters, {
        let counters = counters.clone();
        move |generation| {
            let mut mock = closing_mock(&counters);
            if generation == 0 {
                mock.expect_device().times(1).returning(|_| Err(stale()));
            } else {
                mock.expect_device().times(1).returning(|name| Ok(Device::named(name)));
            }
            mock
        }
    }));

    let device = service.device(&target(), "wg0").await.unwrap();
    assert_eq!(device.interface.name, "wg0");
    assert_eq!(counters.created(), 2);
    assert_eq!(counters.closed(), 1);
}

#[tokio::test]
async fn test_retry_budget_is_one() {
    let counters = Counters::default();
    let service = WireguardService::new(factories_with(&counters, {
        let counters = counters.clone();
        move |_| {
            let mut mock = closing_mock(&counters);
            mock.expect_status().times(1).returning(|_| Err(stale()));
            mock
        }
    }));

    let err = service.status(&target(), "wg0").await.unwrap_err();
    assert!(err.is_stale());
    assert_eq!(counters.created(), 2);
}

#[tokio::test]
async fn test_ordinary_errors_are_not_retried() {
    let counters = Counters::default();
    let service = WireguardService::new(factories_with(&counters, {
        let counters = counters.clone();
        move |_| {
            let mut mock = closing_mock(&counters);
            mock.expect_down()
                .times(1)
                .returning(|name| Err(WgctlError::NotFound(name.to_string())));
            mock
        }
    }));

    let err = service.down(&target(), "wg0").await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(counters.created(), 1);
    assert_eq!(counters.closed(), 0);
}

#[tokio::test]
async fn test_eviction_failure_is_combined() {
    let counters = Counters::default();
    let service = WireguardService::new(factories_with(&counters, |_| {
        let mut mock = MockBackend::new();
        mock.expect_kind().return_const(BackendKind::Exec);
        mock.expect_stats().times(1).returning(|_| Err(stale()));
        mock.expect_close()
            .times(1)
            .returning(|| Err(WgctlError::Transport("socket already gone".to_string())));
        mock
    }));

    let err = service.stats(&target(), "wg0").await.unwrap_err();
    match err {
        WgctlError::Multiple(errors) => {
            assert_eq!(errors.len(), 2);
            assert!(errors[0].is_stale());
        }
        other => panic!("expected combined error, got {}", other),
    }
    assert_eq!(counters.created(), 1);
}

#[tokio::test]
async fn test_foreign_servers_are_stamped_with_backend_id() {
    let counters = Counters::default();
    let service = WireguardService::new(factories_with(&counters, {
        let counters = counters.clone();
        move |_| {
            let mut mock = closing_mock(&counters);
            mock.expect_find_foreign_servers().returning(|known| {
                assert_eq!(known.to_vec(), vec!["wg0".to_string()]);
                Ok(vec![ForeignServer {
                    name: "wg9".to_string(),
                    ..Default::default()
                }])
            });
            mock
        }
    }));

    let servers = service
        .find_foreign_servers(&target(), &["wg0".to_string()])
        .await
        .unwrap();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].backend_id.as_deref(), Some("edge"));
}

#[tokio::test]
async fn test_remove_backend_and_close() {
    let counters = Counters::default();
    let service = WireguardService::new(factories_with(&counters, {
        let counters = counters.clone();
        move |_| {
            let mut mock = closing_mock(&counters);
            mock.expect_status().returning(|_| Ok(true));
            mock
        }
    }));

    assert!(service.status(&target(), "wg0").await.unwrap());
    assert_eq!(service.backends().await.len(), 1);
    service.remove_backend("edge").await.unwrap();
    assert!(service.backends().await.is_empty());

    assert!(service.status(&target(), "wg0").await.unwrap());
    service.close().await.unwrap();
    assert_eq!(counters.closed.load(Ordering::SeqCst), 2);
    assert_eq!(service.supported_types(), vec![BackendKind::Exec]);
}
