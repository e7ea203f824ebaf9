//! In-memory store implementations for development and testing.
//!
//! Behavior matches the real adapters' contracts (unique URL, keyed
//! upserts, atomic take) without external services. Not suitable for
//! production use.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::{
    DeviceStore, NewServer, ServerChanges, ServerStore, SnapshotDocument, SnapshotStore,
};
use crate::error::{EngineError, Result};
use crate::types::{DeviceSummary, DeviceType, ExpandedInventory, FleetServer, ServerId};

#[derive(Debug, Default)]
struct ServerRows {
    next_id: ServerId,
    rows: Vec<FleetServer>,
}

#[derive(Debug, Default)]
pub struct MemoryServerStore {
    inner: Mutex<ServerRows>,
}

impl MemoryServerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServerStore for MemoryServerStore {
    async fn insert(&self, row: NewServer) -> Result<FleetServer> {
        let mut inner = self.inner.lock().await;
        if inner.rows.iter().any(|s| s.url == row.url) {
            return Err(EngineError::UrlAlreadyRegistered(row.url));
        }
        inner.next_id += 1;
        let now = Utc::now();
        let server = FleetServer {
            id: inner.next_id,
            url: row.url,
            admin_name: row.admin_name,
            admin_password: row.admin_password,
            emergency_name: row.emergency_name,
            emergency_password: row.emergency_password,
            cron_limited: row.cron_limited,
            cron_expanded: row.cron_expanded,
            org_name: row.org_name,
            activation_code: row.activation_code,
            created_at: now,
            updated_at: now,
        };
        inner.rows.push(server.clone());
        Ok(server)
    }

    async fn list(&self) -> Result<Vec<FleetServer>> {
        Ok(self.inner.lock().await.rows.clone())
    }

    async fn get(&self, id: ServerId) -> Result<Option<FleetServer>> {
        Ok(self
            .inner
            .lock()
            .await
            .rows
            .iter()
            .find(|s| s.id == id)
            .cloned())
    }

    async fn get_by_url(&self, url: &str) -> Result<Option<FleetServer>> {
        Ok(self
            .inner
            .lock()
            .await
            .rows
            .iter()
            .find(|s| s.url == url)
            .cloned())
    }

    async fn update(&self, id: ServerId, changes: ServerChanges) -> Result<FleetServer> {
        let mut inner = self.inner.lock().await;
        let server = inner
            .rows
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| EngineError::UnknownServer(id.to_string()))?;

        if let Some(admin_name) = changes.admin_name {
            server.admin_name = admin_name;
        }
        if let Some(admin_password) = changes.admin_password {
            server.admin_password = admin_password;
        }
        if let Some(cron_limited) = changes.cron_limited {
            server.cron_limited = cron_limited;
        }
        if let Some(cron_expanded) = changes.cron_expanded {
            server.cron_expanded = cron_expanded;
        }
        if let Some(org_name) = changes.org_name {
            server.org_name = org_name;
        }
        server.updated_at = Utc::now();
        Ok(server.clone())
    }

    async fn set_emergency(
        &self,
        url: &str,
        name: Option<String>,
        password: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let server = inner
            .rows
            .iter_mut()
            .find(|s| s.url == url)
            .ok_or_else(|| EngineError::UnknownServer(url.to_string()))?;
        server.emergency_name = name;
        server.emergency_password = password;
        server.updated_at = Utc::now();
        Ok(())
    }

    async fn take_emergency_password(&self, url: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .rows
            .iter_mut()
            .find(|s| s.url == url)
            .and_then(|s| s.emergency_password.take()))
    }

    async fn delete(&self, id: ServerId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let before = inner.rows.len();
        inner.rows.retain(|s| s.id != id);
        if inner.rows.len() == before {
            return Err(EngineError::UnknownServer(id.to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryDeviceStore {
    rows: Mutex<Vec<DeviceSummary>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn upsert_summary(&self, summary: &DeviceSummary) -> Result<()> {
        let mut rows = self.rows.lock().await;
        match rows
            .iter_mut()
            .find(|d| d.server_id == summary.server_id && d.udid == summary.udid)
        {
            Some(existing) => *existing = summary.clone(),
            None => rows.push(summary.clone()),
        }
        Ok(())
    }

    async fn list_for_server(&self, server_id: ServerId) -> Result<Vec<DeviceSummary>> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .filter(|d| d.server_id == server_id)
            .cloned()
            .collect())
    }

    async fn find_by_udid(&self, udid: &str) -> Result<Option<DeviceSummary>> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .find(|d| d.udid == udid)
            .cloned())
    }

    async fn delete_for_server(&self, server_id: ServerId) -> Result<u64> {
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|d| d.server_id != server_id);
        Ok((before - rows.len()) as u64)
    }
}

#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    documents: Mutex<HashMap<(DeviceType, ServerId, i64), SnapshotDocument>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.documents.lock().await.len()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn replace(
        &self,
        server_id: ServerId,
        external_id: i64,
        inventory: &ExpandedInventory,
    ) -> Result<()> {
        let document = SnapshotDocument {
            external_id,
            server_id,
            fetched_at: Utc::now(),
            inventory: inventory.record().clone(),
        };
        self.documents.lock().await.insert(
            (inventory.device_type(), server_id, external_id),
            document,
        );
        Ok(())
    }

    async fn fetch(
        &self,
        device_type: DeviceType,
        server_id: ServerId,
        external_id: i64,
    ) -> Result<Option<SnapshotDocument>> {
        Ok(self
            .documents
            .lock()
            .await
            .get(&(device_type, server_id, external_id))
            .cloned())
    }

    async fn purge_server(&self, server_id: ServerId) -> Result<u64> {
        let mut documents = self.documents.lock().await;
        let before = documents.len();
        documents.retain(|(_, sid, _), _| *sid != server_id);
        Ok((before - documents.len()) as u64)
    }
}
