//! Stats poller change detection against a mocked backend

mod common;

use common::{closing_mock, factories_with, Counters};
use libwgctl::driver::{BackendKind, InterfaceStats};
use libwgctl::{BackendTarget, StatsPoller, StatsTarget, WireguardService};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn target() -> StatsTarget {
    StatsTarget {
        backend: BackendTarget::new("edge", BackendKind::Exec, "exec:///etc/wireguard"),
        interface: "wg0".to_string(),
    }
}

/// Backend whose wg0 counters follow `rx`, and which reports no interface once `present` is cleared
fn service(counters: &Counters, rx: Arc<AtomicU64>, present: Arc<AtomicBool>) -> Arc<WireguardService> {
    Arc::new(WireguardService::new(factories_with(counters, {
        let counters = counters.clone();
        move |_| {
            let mut mock = closing_mock(&counters);
            let rx = rx.clone();
            let present = present.clone();
            mock.expect_stats().returning(move |_| {
                if !present.load(Ordering::SeqCst) {
                    return Ok(None);
                }
                Ok(Some(InterfaceStats {
                    rx_bytes: rx.load(Ordering::SeqCst),
                    rx_packets: 1,
                    ..Default::default()
                }))
            });
            mock
        }
    })))
}

/// Poller whose timer never fires again during the test
async fn idle_poller(service: Arc<WireguardService>) -> StatsPoller {
    let poller = StatsPoller::start(service, Duration::from_secs(3600));
    // Let the immediate first tick run while nobody is subscribed
    tokio::task::yield_now().await;
    poller.track(target()).await;
    poller
}

#[tokio::test]
async fn test_events_only_when_counters_move() {
    let counters = Counters::default();
    let rx = Arc::new(AtomicU64::new(100));
    let poller = idle_poller(service(&counters, rx.clone(), Arc::new(AtomicBool::new(true)))).await;
    let mut events = poller.subscribe();

    // First observation always publishes
    assert_eq!(poller.poll_now().await, 1);
    let event = events.recv().await.unwrap();
    assert_eq!(event.backend_id, "edge");
    assert_eq!(event.interface, "wg0");
    assert_eq!(event.stats.unwrap().rx_bytes, 100);

    // Same counters: nothing sent
    assert_eq!(poller.poll_now().await, 0);
    assert!(timeout(Duration::from_millis(50), events.recv()).await.is_err());

    rx.store(250, Ordering::SeqCst);
    assert_eq!(poller.poll_now().await, 1);
    assert_eq!(events.recv().await.unwrap().stats.unwrap().rx_bytes, 250);

    assert_eq!(counters.created(), 1);
    poller.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_vanished_interface_is_published_once() {
    let counters = Counters::default();
    let present = Arc::new(AtomicBool::new(true));
    let poller = idle_poller(service(&counters, Arc::new(AtomicU64::new(7)), present.clone())).await;
    let mut events = poller.subscribe();

    assert_eq!(poller.poll_now().await, 1);
    assert!(events.recv().await.unwrap().stats.is_some());

    present.store(false, Ordering::SeqCst);
    assert_eq!(poller.poll_now().await, 1);
    assert!(events.recv().await.unwrap().stats.is_none());
    assert_eq!(poller.poll_now().await, 0);

    poller.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_backend_untouched_without_subscribers() {
    let counters = Counters::default();
    let poller = idle_poller(service(
        &counters,
        Arc::new(AtomicU64::new(1)),
        Arc::new(AtomicBool::new(true)),
    ))
    .await;

    assert_eq!(poller.poll_now().await, 0);
    assert_eq!(counters.created(), 0);

    let events = poller.subscribe();
    assert_eq!(poller.poll_now().await, 1);
    drop(events);

    // Counters are unchanged, but with no listener the backend is not even read
    assert_eq!(poller.poll_now().await, 0);
    assert_eq!(counters.created(), 1);

    poller.untrack("edge", "wg0").await;
    assert!(poller.targets().await.is_empty());
    poller.shutdown().await.unwrap();
}
