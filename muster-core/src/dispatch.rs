//! Command dispatch to fleet servers.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::client::ClientPool;
use crate::store::{DeviceStore, ServerStore};
use crate::types::{DeviceRef, RemoteCommand, ServerId};

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchStatus {
    Submitted,
    Failed { reason: String },
}

impl DispatchStatus {
    pub fn is_submitted(&self) -> bool {
        matches!(self, DispatchStatus::Submitted)
    }

    fn failed(reason: impl Into<String>) -> Self {
        DispatchStatus::Failed {
            reason: reason.into(),
        }
    }
}

/// Per-device outcome, order aligned with the request's device list.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub device: DeviceRef,
    pub status: DispatchStatus,
}

/// Resolves opaque device references against the summary rows, groups them
/// by owning server, and submits one command request per device.
pub struct CommandDispatcher {
    devices: Arc<dyn DeviceStore>,
    servers: Arc<dyn ServerStore>,
    clients: Arc<ClientPool>,
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher").finish_non_exhaustive()
    }
}

impl CommandDispatcher {
    pub fn new(
        devices: Arc<dyn DeviceStore>,
        servers: Arc<dyn ServerStore>,
        clients: Arc<ClientPool>,
    ) -> Self {
        Self {
            devices,
            servers,
            clients,
        }
    }

    /// Dispatch one command to a set of devices.
    ///
    /// Every failure is scoped to the devices it affects: an unresolvable
    /// reference, an unreachable server, or an undecryptable credential
    /// fails those devices' entries and nothing else. The returned vector
    /// has one entry per input device, in input order.
    pub async fn dispatch(
        &self,
        refs: &[DeviceRef],
        command: RemoteCommand,
    ) -> Vec<DispatchResult> {
        let run_id = Uuid::now_v7();
        info!(
            target: "dispatch",
            %run_id,
            command = %command,
            devices = refs.len(),
            "command dispatch started"
        );

        let mut statuses: Vec<Option<DispatchStatus>> = vec![None; refs.len()];
        let mut by_server: HashMap<ServerId, Vec<usize>> = HashMap::new();
        let mut resolved = Vec::with_capacity(refs.len());

        for (idx, device_ref) in refs.iter().enumerate() {
            match self.devices.find_by_udid(&device_ref.udid).await {
                Ok(Some(summary)) => {
                    by_server.entry(summary.server_id).or_default().push(idx);
                    resolved.push(Some(summary));
                }
                Ok(None) => {
                    warn!(
                        target: "dispatch",
                        %run_id,
                        udid = %device_ref.udid,
                        "device not found in inventory"
                    );
                    statuses[idx] = Some(DispatchStatus::failed("device not found in inventory"));
                    resolved.push(None);
                }
                Err(e) => {
                    statuses[idx] = Some(DispatchStatus::failed(format!("lookup failed: {e}")));
                    resolved.push(None);
                }
            }
        }

        for (server_id, indices) in by_server {
            let client = match self.servers.get(server_id).await {
                Ok(Some(server)) => self.clients.client_for(&server),
                Ok(None) => Err(crate::error::EngineError::UnknownServer(
                    server_id.to_string(),
                )),
                Err(e) => Err(e),
            };
            let client = match client {
                Ok(client) => client,
                Err(e) => {
                    warn!(
                        target: "dispatch",
                        %run_id,
                        server_id,
                        error = %e,
                        "server unavailable for dispatch"
                    );
                    for idx in indices {
                        statuses[idx] =
                            Some(DispatchStatus::failed(format!("server unavailable: {e}")));
                    }
                    continue;
                }
            };

            for idx in indices {
                let summary = resolved[idx]
                    .as_ref()
                    .expect("resolved entry for grouped index");
                statuses[idx] = Some(
                    match client
                        .submit_command(summary.device_type, command, summary.external_id)
                        .await
                    {
                        Ok(()) => DispatchStatus::Submitted,
                        Err(e) => DispatchStatus::failed(e.to_string()),
                    },
                );
            }
        }

        let results: Vec<DispatchResult> = refs
            .iter()
            .zip(statuses)
            .map(|(device_ref, status)| DispatchResult {
                device: device_ref.clone(),
                status: status.unwrap_or_else(|| DispatchStatus::failed("not attempted")),
            })
            .collect();

        let submitted = results.iter().filter(|r| r.status.is_submitted()).count();
        info!(
            target: "dispatch",
            %run_id,
            command = %command,
            submitted,
            failed = results.len() - submitted,
            "command dispatch finished"
        );
        results
    }
}
