//! Sync job bodies.
//!
//! A limited pass reconciles the fleet server's device lists into summary
//! rows; an expanded pass walks the stored summaries and replaces each
//! device's full snapshot. Both report per-item failures instead of
//! aborting, so one bad device never costs the rest of the batch.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

use crate::client::ClientPool;
use crate::scheduler::JobRunner;
use crate::store::{DeviceStore, SnapshotStore};
use crate::types::{DeviceSummary, DeviceType, ExpandedInventory, FleetServer, ServerId};

/// Upper bound on queued expanded fetches per pass. The per-server client
/// semaphore is the binding concurrency cap; this only limits how many
/// futures wait on it at once.
const EXPANDED_FANOUT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    Limited,
    Expanded,
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncKind::Limited => "limited",
            SyncKind::Expanded => "expanded",
        })
    }
}

/// What a recorded failure covers.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureScope {
    /// The pass could not start at all.
    Pass,
    /// One device class's list fetch failed; the other class proceeded.
    List(DeviceType),
    /// One device failed; the rest of the batch proceeded.
    Device {
        device_type: DeviceType,
        external_id: i64,
        udid: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct SyncFailure {
    pub scope: FailureScope,
    pub reason: String,
}

/// The "synced N, failed M" aggregate of one pass.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub server_id: ServerId,
    pub kind: SyncKind,
    pub synced: usize,
    pub failures: Vec<SyncFailure>,
}

impl SyncOutcome {
    pub fn empty(server_id: ServerId, kind: SyncKind) -> Self {
        Self {
            server_id,
            kind,
            synced: 0,
            failures: Vec::new(),
        }
    }
}

/// The production job runner, wired to the real stores and client pool.
pub struct SyncRunner {
    devices: Arc<dyn DeviceStore>,
    snapshots: Arc<dyn SnapshotStore>,
    clients: Arc<ClientPool>,
}

impl fmt::Debug for SyncRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncRunner").finish_non_exhaustive()
    }
}

impl SyncRunner {
    pub fn new(
        devices: Arc<dyn DeviceStore>,
        snapshots: Arc<dyn SnapshotStore>,
        clients: Arc<ClientPool>,
    ) -> Self {
        Self {
            devices,
            snapshots,
            clients,
        }
    }
}

#[async_trait]
impl JobRunner for SyncRunner {
    async fn run_limited(&self, server: &FleetServer) -> SyncOutcome {
        let run_id = Uuid::now_v7();
        let mut outcome = SyncOutcome::empty(server.id, SyncKind::Limited);
        info!(target: "sync", server_id = server.id, %run_id, "limited sync started");

        let client = match self.clients.client_for(server) {
            Ok(client) => client,
            Err(e) => {
                warn!(
                    target: "sync",
                    server_id = server.id,
                    %run_id,
                    error = %e,
                    "limited sync could not start"
                );
                outcome.failures.push(SyncFailure {
                    scope: FailureScope::Pass,
                    reason: e.to_string(),
                });
                return outcome;
            }
        };

        for device_type in DeviceType::ALL {
            let descriptors = match client.fetch_device_list(device_type).await {
                Ok(list) => list,
                Err(e) => {
                    warn!(
                        target: "sync",
                        server_id = server.id,
                        %run_id,
                        %device_type,
                        error = %e,
                        "device list fetch failed"
                    );
                    outcome.failures.push(SyncFailure {
                        scope: FailureScope::List(device_type),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            for descriptor in descriptors {
                let summary = DeviceSummary {
                    external_id: descriptor.id,
                    udid: descriptor.udid,
                    serial_number: descriptor.serial_number,
                    name: descriptor.name,
                    device_type,
                    server_id: server.id,
                    last_synced: Utc::now(),
                };
                match self.devices.upsert_summary(&summary).await {
                    Ok(()) => outcome.synced += 1,
                    Err(e) => outcome.failures.push(SyncFailure {
                        scope: FailureScope::Device {
                            device_type,
                            external_id: summary.external_id,
                            udid: Some(summary.udid.clone()),
                        },
                        reason: e.to_string(),
                    }),
                }
            }
        }

        info!(
            target: "sync",
            server_id = server.id,
            %run_id,
            synced = outcome.synced,
            failures = outcome.failures.len(),
            "limited sync finished"
        );
        outcome
    }

    async fn run_expanded(&self, server: &FleetServer) -> SyncOutcome {
        let run_id = Uuid::now_v7();
        let mut outcome = SyncOutcome::empty(server.id, SyncKind::Expanded);
        info!(target: "sync", server_id = server.id, %run_id, "expanded sync started");

        let client = match self.clients.client_for(server) {
            Ok(client) => client,
            Err(e) => {
                warn!(
                    target: "sync",
                    server_id = server.id,
                    %run_id,
                    error = %e,
                    "expanded sync could not start"
                );
                outcome.failures.push(SyncFailure {
                    scope: FailureScope::Pass,
                    reason: e.to_string(),
                });
                return outcome;
            }
        };

        // The device list is read at trigger time, never captured when the
        // job was scheduled.
        let summaries = match self.devices.list_for_server(server.id).await {
            Ok(summaries) => summaries,
            Err(e) => {
                outcome.failures.push(SyncFailure {
                    scope: FailureScope::Pass,
                    reason: format!("device list read failed: {e}"),
                });
                return outcome;
            }
        };

        let results = stream::iter(summaries)
            .map(|device| {
                let client = Arc::clone(&client);
                let snapshots = Arc::clone(&self.snapshots);
                let server_id = server.id;
                async move {
                    let step = async {
                        let payload = client
                            .fetch_expanded_device(device.device_type, device.external_id)
                            .await
                            .map_err(|e| e.to_string())?;
                        let inventory =
                            ExpandedInventory::classify(payload).map_err(|e| e.to_string())?;
                        snapshots
                            .replace(server_id, device.external_id, &inventory)
                            .await
                            .map_err(|e| e.to_string())
                    };
                    let result = step.await;
                    (device, result)
                }
            })
            .buffer_unordered(EXPANDED_FANOUT)
            .collect::<Vec<_>>()
            .await;

        for (device, result) in results {
            match result {
                Ok(()) => outcome.synced += 1,
                Err(reason) => {
                    warn!(
                        target: "sync",
                        server_id = server.id,
                        %run_id,
                        device_type = %device.device_type,
                        external_id = device.external_id,
                        %reason,
                        "device snapshot failed"
                    );
                    outcome.failures.push(SyncFailure {
                        scope: FailureScope::Device {
                            device_type: device.device_type,
                            external_id: device.external_id,
                            udid: Some(device.udid),
                        },
                        reason,
                    });
                }
            }
        }

        info!(
            target: "sync",
            server_id = server.id,
            %run_id,
            synced = outcome.synced,
            failures = outcome.failures.len(),
            "expanded sync finished"
        );
        outcome
    }
}
