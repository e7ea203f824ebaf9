//! Storage seams for the engine.
//!
//! Adapters are constructed at startup and injected behind these traits;
//! nothing in the engine reaches for a global connection. The relational
//! side holds server rows and device summaries, the document side holds
//! full inventory snapshots.

pub mod memory;
pub mod mongo;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::types::{
    DeviceSummary, DeviceType, ExpandedInventory, FleetServer, ServerId,
};

/// Insert record for a fleet server. Credential fields arrive already
/// encrypted; the registry owns the plaintext-to-ciphertext step.
#[derive(Debug, Clone)]
pub struct NewServer {
    pub url: String,
    pub admin_name: String,
    pub admin_password: String,
    pub emergency_name: Option<String>,
    pub emergency_password: Option<String>,
    pub cron_limited: String,
    pub cron_expanded: String,
    pub org_name: String,
    pub activation_code: String,
}

/// Partial update record, same encryption contract as [`NewServer`]. Fields
/// left `None` keep their stored values.
#[derive(Debug, Clone, Default)]
pub struct ServerChanges {
    pub admin_name: Option<String>,
    pub admin_password: Option<String>,
    pub cron_limited: Option<String>,
    pub cron_expanded: Option<String>,
    pub org_name: Option<String>,
}

/// Stored form of one expanded inventory fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDocument {
    pub external_id: i64,
    pub server_id: ServerId,
    pub fetched_at: DateTime<Utc>,
    pub inventory: Value,
}

#[async_trait]
pub trait ServerStore: Send + Sync {
    /// Insert a server row. A second row with the same URL fails with
    /// `UrlAlreadyRegistered`.
    async fn insert(&self, row: NewServer) -> Result<FleetServer>;

    async fn list(&self) -> Result<Vec<FleetServer>>;

    async fn get(&self, id: ServerId) -> Result<Option<FleetServer>>;

    async fn get_by_url(&self, url: &str) -> Result<Option<FleetServer>>;

    /// Apply a partial update and return the new row. `UnknownServer` if the
    /// id does not exist.
    async fn update(&self, id: ServerId, changes: ServerChanges) -> Result<FleetServer>;

    /// Set or clear the emergency account credentials.
    async fn set_emergency(
        &self,
        url: &str,
        name: Option<String>,
        password: Option<String>,
    ) -> Result<()>;

    /// Atomically read and clear the stored emergency password ciphertext.
    /// Concurrent callers cannot both observe a value; `None` means nothing
    /// was stored.
    async fn take_emergency_password(&self, url: &str) -> Result<Option<String>>;

    async fn delete(&self, id: ServerId) -> Result<()>;
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Insert or update the summary row keyed by (server_id, udid).
    async fn upsert_summary(&self, summary: &DeviceSummary) -> Result<()>;

    async fn list_for_server(&self, server_id: ServerId) -> Result<Vec<DeviceSummary>>;

    async fn find_by_udid(&self, udid: &str) -> Result<Option<DeviceSummary>>;

    /// Bulk delete for a removed server. Returns the number of rows removed.
    async fn delete_for_server(&self, server_id: ServerId) -> Result<u64>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Replace the snapshot for (external_id, server_id) wholesale. The
    /// collection is chosen from the inventory's tag.
    async fn replace(
        &self,
        server_id: ServerId,
        external_id: i64,
        inventory: &ExpandedInventory,
    ) -> Result<()>;

    async fn fetch(
        &self,
        device_type: DeviceType,
        server_id: ServerId,
        external_id: i64,
    ) -> Result<Option<SnapshotDocument>>;

    /// Delete every snapshot belonging to a server, across both
    /// collections. Returns the number of documents removed.
    async fn purge_server(&self, server_id: ServerId) -> Result<u64>;
}
