//! Process-wide cache of live backend connections.
//!
//! At most one connection exists per [`ConnectionKey`]. Concurrent callers
//! asking for the same key share a single construction; callers for
//! different keys never wait on each other.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{ConnectionKey, Principal};
use crate::config::BackendConfig;
use crate::db::{Connection, Connector};
use crate::error::{ConduitError, Result};

type Slot = Arc<OnceCell<Arc<dyn Connection>>>;

/// Registry of live connections keyed by (principal, backend).
pub struct ConnectionRegistry {
    connector: Arc<dyn Connector>,
    slots: DashMap<ConnectionKey, Slot>,
}

impl ConnectionRegistry {
    /// Creates an empty registry that builds connections with `connector`.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            slots: DashMap::new(),
        }
    }

    /// Returns the cached connection for `key`, creating it if needed.
    ///
    /// A connection that reports itself unhealthy is evicted and closed, then rebuilt.
    /// Any construction failure evicts the key; transport failures surface
    /// as `AuthenticationRequired` carrying the cause.
    pub async fn get_or_create(
        &self,
        key: &ConnectionKey,
        backend: &BackendConfig,
        principal: &Principal,
    ) -> Result<Arc<dyn Connection>> {
        loop {
            let slot: Slot = self.slots.entry(key.clone()).or_default().value().clone();

            if let Some(conn) = slot.get() {
                if conn.is_healthy() {
                    return Ok(conn.clone());
                }
                warn!("Evicting unhealthy connection for {}", key);
                if self.evict_slot(key, &slot) {
                    if let Err(e) = conn.close().await {
                        warn!("Failed to close unhealthy connection for {}: {}", key, e);
                    }
                }
                continue;
            }

            let created = slot
                .get_or_try_init(|| async {
                    info!("Connecting {} to {}", key, backend.display_string());
                    self.connector.connect(backend, principal).await
                })
                .await;

            return match created {
                Ok(conn) => {
                    debug!("Connection ready for {}", key);
                    Ok(conn.clone())
                }
                Err(e) => {
                    self.evict_slot(key, &slot);
                    warn!("Connection for {} failed: {}", key, e);
                    Err(match e {
                        ConduitError::AuthenticationRequired(_) | ConduitError::Config(_) => e,
                        other => ConduitError::auth(format!(
                            "Could not establish connection to datasource: {other}"
                        )),
                    })
                }
            };
        }
    }

    /// Removes `key` only if it still maps to `slot`. Returns true if this
    /// call removed it.
    fn evict_slot(&self, key: &ConnectionKey, slot: &Slot) -> bool {
        self.slots
            .remove_if(key, |_, current| Arc::ptr_eq(current, slot))
            .is_some()
    }

    /// Drops and closes the connection cached under `key`, if any.
    pub async fn evict(&self, key: &ConnectionKey) {
        if let Some((_, slot)) = self.slots.remove(key) {
            if let Some(conn) = slot.get() {
                if let Err(e) = conn.close().await {
                    warn!("Failed to close connection for {}: {}", key, e);
                }
            }
        }
    }

    /// Closes every cached connection.
    pub async fn close_all(&self) {
        let keys: Vec<ConnectionKey> = self.slots.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.evict(&key).await;
        }
    }

    /// Returns true if a live connection is cached under `key`.
    pub fn contains(&self, key: &ConnectionKey) -> bool {
        self.slots
            .get(key)
            .map(|slot| slot.initialized())
            .unwrap_or(false)
    }

    /// Number of keys with a live connection.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|e| e.value().initialized()).count()
    }

    /// Returns true if no connection is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
