//! Registry of live connectors keyed by backend entity id
//!
//! The registry owns every connector it hands out. A connector is closed when
//! its entry is replaced, removed or cleared, and `close()` is always awaited
//! after the map lock has been released.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::connector::Factories;
use crate::driver::{BackendKind, Driver};
use crate::error::{WgctlError, WgctlResult};

struct RegistryEntry {
    kind: BackendKind,
    url: String,
    driver: Arc<dyn Driver>,
}

impl RegistryEntry {
    fn matches(&self, kind: BackendKind, url: &str) -> bool {
        self.kind == kind && self.url == url
    }
}

/// Summary of one registered backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendInfo {
    pub entity_id: String,
    #[serde(rename = "type")]
    pub kind: BackendKind,
    pub url: String,
}

pub struct Registry {
    factories: Arc<Factories>,
    entries: RwLock<HashMap<String, RegistryEntry>>,
}

async fn close_driver(entity_id: &str, driver: Arc<dyn Driver>) -> WgctlResult<()> {
    debug!("Closing {} backend for {}", driver.kind(), entity_id);
    driver.close().await
}

impl Registry {
    pub fn new(factories: Arc<Factories>) -> Self {
        Self {
            factories,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn factories(&self) -> &Factories {
        &self.factories
    }

    /// Connector for `entity_id`, created on first use
    ///
    /// The same `(backend_type, url)` always yields the same instance. A
    /// different URL closes the old connector and builds a new one.
    pub async fn get_or_create(
        &self,
        entity_id: &str,
        backend_type: &str,
        url: &str,
    ) -> WgctlResult<Arc<dyn Driver>> {
        let kind: BackendKind = backend_type.parse()?;

        let replaced = {
            let entries = self.entries.read().await;
            match entries.get(entity_id) {
                Some(entry) if entry.matches(kind, url) => return Ok(entry.driver.clone()),
                Some(_) => true,
                None => false,
            }
        };

        if replaced {
            let old = {
                let mut entries = self.entries.write().await;
                match entries.get(entity_id) {
                    Some(entry) if entry.matches(kind, url) => return Ok(entry.driver.clone()),
                    Some(_) => entries.remove(entity_id),
                    None => None,
                }
            };
            if let Some(old) = old {
                info!("Backend {} changed to {}, reconnecting", entity_id, kind);
                if let Err(e) = close_driver(entity_id, old.driver).await {
                    warn!("Failed to close previous backend for {}: {}", entity_id, e);
                }
            }
        }

        let driver = self.factories.create(kind.as_str(), url).await?;

        let (driver, redundant) = {
            let mut entries = self.entries.write().await;
            match entries.get(entity_id) {
                // Someone else won the race for the same target
                Some(existing) if existing.matches(kind, url) => (existing.driver.clone(), Some(driver)),
                _ => {
                    let previous = entries.insert(
                        entity_id.to_string(),
                        RegistryEntry {
                            kind,
                            url: url.to_string(),
                            driver: driver.clone(),
                        },
                    );
                    (driver, previous.map(|entry| entry.driver))
                }
            }
        };

        if let Some(redundant) = redundant {
            if let Err(e) = close_driver(entity_id, redundant).await {
                warn!("Failed to close redundant backend for {}: {}", entity_id, e);
            }
        }
        Ok(driver)
    }

    /// Drop and close the connector for `entity_id`; absent is not an error
    pub async fn remove(&self, entity_id: &str) -> WgctlResult<()> {
        let entry = self.entries.write().await.remove(entity_id);
        match entry {
            Some(entry) => close_driver(entity_id, entry.driver).await,
            None => Ok(()),
        }
    }

    /// Close every connector; failures are collected, not short-circuited
    pub async fn close_all(&self) -> WgctlResult<()> {
        let drained: Vec<(String, RegistryEntry)> = self.entries.write().await.drain().collect();

        let mut errors = Vec::new();
        for (entity_id, entry) in drained {
            if let Err(e) = close_driver(&entity_id, entry.driver).await {
                warn!("Failed to close backend {}: {}", entity_id, e);
                errors.push(e);
            }
        }
        match WgctlError::join(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn get(&self, entity_id: &str) -> Option<Arc<dyn Driver>> {
        self.entries
            .read()
            .await
            .get(entity_id)
            .map(|entry| entry.driver.clone())
    }

    pub async fn has(&self, entity_id: &str) -> bool {
        self.entries.read().await.contains_key(entity_id)
    }

    /// Registered backends ordered by entity id
    pub async fn list(&self) -> Vec<BackendInfo> {
        let mut backends: Vec<BackendInfo> = self
            .entries
            .read()
            .await
            .iter()
            .map(|(entity_id, entry)| BackendInfo {
                entity_id: entity_id.clone(),
                kind: entry.kind,
                url: entry.url.clone(),
            })
            .collect();
        backends.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        backends
    }
}
