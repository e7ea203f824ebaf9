//! Engine facade.
//!
//! Owns the wired components and exposes the operations the API layer
//! consumes. Registry mutations rebuild the schedule themselves, so a
//! caller can never leave the job set out of step with the server list.

use std::sync::Arc;

use crate::client::{ClientPool, FetchOptions};
use crate::dispatch::{CommandDispatcher, DispatchResult};
use crate::error::{EngineError, Result};
use crate::registry::{ServerAdded, ServerRegistry, ServerRemoved};
use crate::scheduler::{RebuildReport, SyncScheduler};
use crate::store::{DeviceStore, ServerStore, SnapshotStore};
use crate::sync::{SyncOutcome, SyncRunner};
use crate::types::{DeviceRef, FleetServer, FleetServerSpec, RemoteCommand, ServerId, ServerUpdate};
use crate::vault::CredentialVault;

pub struct SyncEngine {
    registry: ServerRegistry,
    scheduler: SyncScheduler,
    dispatcher: CommandDispatcher,
    clients: Arc<ClientPool>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("clients", &self.clients)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    pub fn builder() -> SyncEngineBuilder {
        SyncEngineBuilder::new()
    }

    /// Register a fleet server and schedule its job pair. Scheduling
    /// problems (an unparseable cron expression in particular) surface as
    /// warnings on the outcome, not failures.
    pub async fn add_server(&self, spec: FleetServerSpec) -> Result<ServerAdded> {
        let mut added = self.registry.add(spec).await?;
        let report = self.rebuild_schedule().await?;
        if let Some(skip) = report
            .skipped
            .iter()
            .find(|s| s.server_id == added.server.id)
        {
            added
                .warnings
                .push(format!("sync jobs not scheduled: {}", skip.reason));
        }
        Ok(added)
    }

    pub async fn update_server(&self, id: ServerId, update: ServerUpdate) -> Result<FleetServer> {
        let server = self.registry.update(id, update).await?;
        self.rebuild_schedule().await?;
        Ok(server)
    }

    pub async fn remove_server(&self, id: ServerId) -> Result<ServerRemoved> {
        let removed = self.registry.remove(id).await?;
        self.rebuild_schedule().await?;
        Ok(removed)
    }

    pub async fn list_servers(&self) -> Result<Vec<FleetServer>> {
        self.registry.list_all().await
    }

    pub async fn get_server(&self, id: ServerId) -> Result<Option<FleetServer>> {
        self.registry.get(id).await
    }

    /// Tear down and recreate every scheduled job from the current server
    /// list. Cached clients are dropped first so credential changes take
    /// effect.
    pub async fn rebuild_schedule(&self) -> Result<RebuildReport> {
        let servers = self.registry.list_all().await?;
        self.clients.invalidate();
        Ok(self.scheduler.rebuild(&servers).await)
    }

    /// Servers with an armed job pair. A server missing from this list but
    /// present in [`list_servers`](Self::list_servers) was skipped during
    /// the last rebuild, usually for an unparseable cron expression.
    pub async fn scheduled_servers(&self) -> Vec<ServerId> {
        self.scheduler.scheduled_servers().await
    }

    pub async fn run_limited_sync_now(&self, id: ServerId) -> Result<SyncOutcome> {
        let server = self.require_server(id).await?;
        Ok(self.scheduler.run_limited_now(&server).await)
    }

    pub async fn run_expanded_sync_now(&self, id: ServerId) -> Result<SyncOutcome> {
        let server = self.require_server(id).await?;
        Ok(self.scheduler.run_expanded_now(&server).await)
    }

    pub async fn dispatch_command(
        &self,
        refs: &[DeviceRef],
        command: RemoteCommand,
    ) -> Vec<DispatchResult> {
        self.dispatcher.dispatch(refs, command).await
    }

    pub async fn set_emergency_password(&self, url: &str, plaintext: Option<&str>) -> Result<()> {
        self.registry.set_emergency_password(url, plaintext).await
    }

    /// Destructive one-time read of a server's emergency password.
    pub async fn emergency_access(&self, url: &str) -> Result<String> {
        self.registry.emergency_access(url).await
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }

    async fn require_server(&self, id: ServerId) -> Result<FleetServer> {
        self.registry
            .get(id)
            .await?
            .ok_or_else(|| EngineError::UnknownServer(id.to_string()))
    }
}

/// Helper for constructing an engine with explicit dependencies.
pub struct SyncEngineBuilder {
    vault: Option<CredentialVault>,
    servers: Option<Arc<dyn ServerStore>>,
    devices: Option<Arc<dyn DeviceStore>>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    fetch_options: FetchOptions,
}

impl std::fmt::Debug for SyncEngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngineBuilder")
            .field("vault_set", &self.vault.is_some())
            .field("servers_set", &self.servers.is_some())
            .field("devices_set", &self.devices.is_some())
            .field("snapshots_set", &self.snapshots.is_some())
            .field("fetch_options", &self.fetch_options)
            .finish()
    }
}

impl SyncEngineBuilder {
    pub fn new() -> Self {
        Self {
            vault: None,
            servers: None,
            devices: None,
            snapshots: None,
            fetch_options: FetchOptions::default(),
        }
    }

    pub fn with_vault(mut self, vault: CredentialVault) -> Self {
        self.vault = Some(vault);
        self
    }

    pub fn with_server_store(mut self, servers: Arc<dyn ServerStore>) -> Self {
        self.servers = Some(servers);
        self
    }

    pub fn with_device_store(mut self, devices: Arc<dyn DeviceStore>) -> Self {
        self.devices = Some(devices);
        self
    }

    pub fn with_snapshot_store(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn with_fetch_options(mut self, options: FetchOptions) -> Self {
        self.fetch_options = options;
        self
    }

    pub fn build(self) -> Result<SyncEngine> {
        let vault = self
            .vault
            .ok_or_else(|| EngineError::Internal("vault dependency missing".into()))?;
        let servers = self
            .servers
            .ok_or_else(|| EngineError::Internal("server store dependency missing".into()))?;
        let devices = self
            .devices
            .ok_or_else(|| EngineError::Internal("device store dependency missing".into()))?;
        let snapshots = self
            .snapshots
            .ok_or_else(|| EngineError::Internal("snapshot store dependency missing".into()))?;

        let clients = Arc::new(ClientPool::new(vault.clone(), self.fetch_options));
        let registry = ServerRegistry::new(
            servers.clone(),
            devices.clone(),
            snapshots.clone(),
            clients.clone(),
            vault,
        );
        let runner = Arc::new(SyncRunner::new(
            devices.clone(),
            snapshots,
            clients.clone(),
        ));
        let scheduler = SyncScheduler::new(runner);
        let dispatcher = CommandDispatcher::new(devices, servers, clients.clone());

        Ok(SyncEngine {
            registry,
            scheduler,
            dispatcher,
            clients,
        })
    }
}

impl Default for SyncEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
