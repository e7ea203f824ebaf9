//! MongoDB adapter for inventory snapshots.

use async_trait::async_trait;
use chrono::Utc;
use mongodb::bson::doc;
use mongodb::{Client, Database};

use super::{SnapshotDocument, SnapshotStore};
use crate::error::Result;
use crate::types::{DeviceType, ExpandedInventory, ServerId};

/// Connection handle for the document side.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    db: Database,
}

impl DocumentStore {
    pub async fn connect(uri: &str, database: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri).await?;
        Ok(Self {
            db: client.database(database),
        })
    }

    pub async fn health_check(&self) -> Result<()> {
        self.db.run_command(doc! { "ping": 1 }).await?;
        Ok(())
    }

    pub fn snapshots(&self) -> MongoSnapshotStore {
        MongoSnapshotStore {
            db: self.db.clone(),
        }
    }
}

/// Snapshot documents live in one collection per device class, keyed by
/// (external_id, server_id) within it.
#[derive(Debug, Clone)]
pub struct MongoSnapshotStore {
    db: Database,
}

#[async_trait]
impl SnapshotStore for MongoSnapshotStore {
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

        self.db
            .collection::<SnapshotDocument>(inventory.device_type().collection_name())
            .replace_one(
                doc! { "external_id": external_id, "server_id": server_id },
                &document,
            )
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn fetch(
        &self,
        device_type: DeviceType,
        server_id: ServerId,
        external_id: i64,
    ) -> Result<Option<SnapshotDocument>> {
        Ok(self
            .db
            .collection::<SnapshotDocument>(device_type.collection_name())
            .find_one(doc! { "external_id": external_id, "server_id": server_id })
            .await?)
    }

    async fn purge_server(&self, server_id: ServerId) -> Result<u64> {
        let mut removed = 0;
        for device_type in DeviceType::ALL {
            let result = self
                .db
                .collection::<SnapshotDocument>(device_type.collection_name())
                .delete_many(doc! { "server_id": server_id })
                .await?;
            removed += result.deleted_count;
        }
        Ok(removed)
    }
}
