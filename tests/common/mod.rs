//! Shared helpers for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use libwgctl::driver::{
    BackendKind, ConfigureOptions, Device, Driver, ForeignServer, InterfaceStats, PeerStats,
};
use libwgctl::error::WgctlResult;
use libwgctl::Factories;
use mockall::mock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

mock! {
    pub Backend {}

    #[async_trait]
    impl Driver for Backend {
        fn kind(&self) -> BackendKind;
        async fn device(&self, name: &str) -> WgctlResult<Device>;
        async fn up(&self, options: &ConfigureOptions) -> WgctlResult<Device>;
        async fn down(&self, name: &str) -> WgctlResult<()>;
        async fn status(&self, name: &str) -> WgctlResult<bool>;
        async fn stats(&self, name: &str) -> WgctlResult<Option<InterfaceStats>>;
        async fn peer_stats(&self, name: &str, peer_public_key: &str) -> WgctlResult<Option<PeerStats>>;
        async fn find_foreign_servers(&self, known_interfaces: &[String]) -> WgctlResult<Vec<ForeignServer>>;
        async fn close(&self) -> WgctlResult<()>;
    }
}

/// Counts of connectors built and closed by a test factory
#[derive(Clone, Default)]
pub struct Counters {
    pub created: Arc<AtomicUsize>,
    pub closed: Arc<AtomicUsize>,
}

impl Counters {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Mock whose `close` bumps the shared counter
pub fn closing_mock(counters: &Counters) -> MockBackend {
    let closed = counters.closed.clone();
    let mut mock = MockBackend::new();
    mock.expect_kind().return_const(BackendKind::Exec);
    mock.expect_close().returning(move || {
        closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    mock
}

/// Exec factory handing out `build(n)` for the n-th connector created
pub fn factories_with<B>(counters: &Counters, build: B) -> Arc<Factories>
where
    B: Fn(usize) -> MockBackend + Send + Sync + 'static,
{
    let created = counters.created.clone();
    let mut factories = Factories::empty();
    factories.register(BackendKind::Exec, true, move |_url| {
        let generation = created.fetch_add(1, Ordering::SeqCst);
        let mock = build(generation);
        async move {
            let driver: Arc<dyn Driver> = Arc::new(mock);
            Ok(driver)
        }
    });
    Arc::new(factories)
}
