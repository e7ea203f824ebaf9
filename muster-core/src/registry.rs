//! Fleet server registry.
//!
//! Owns the registration handshake, emergency account provisioning, partial
//! updates, the ordered removal cascade, and the destructive emergency
//! password read.

use std::sync::Arc;

use tracing::{info, warn};
use url::Url;

use crate::client::ClientPool;
use crate::error::{EngineError, Result};
use crate::store::{DeviceStore, NewServer, ServerChanges, ServerStore, SnapshotStore};
use crate::types::{FleetServer, FleetServerSpec, ServerId, ServerUpdate};
use crate::vault::{CredentialVault, random_token};

const EMERGENCY_NAME_PREFIX: &str = "muster-emergency";
const EMERGENCY_PASSWORD_LEN: usize = 24;

/// Outcome of a registration. Warnings carry non-fatal setup failures, the
/// emergency account in particular.
#[derive(Debug, Clone)]
pub struct ServerAdded {
    pub server: FleetServer,
    pub warnings: Vec<String>,
}

/// Outcome of a removal, including what the cascade touched.
#[derive(Debug, Clone)]
pub struct ServerRemoved {
    pub server_id: ServerId,
    pub devices_removed: u64,
    pub snapshots_removed: u64,
    pub warnings: Vec<String>,
}

pub struct ServerRegistry {
    servers: Arc<dyn ServerStore>,
    devices: Arc<dyn DeviceStore>,
    snapshots: Arc<dyn SnapshotStore>,
    clients: Arc<ClientPool>,
    vault: CredentialVault,
}

impl std::fmt::Debug for ServerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRegistry").finish_non_exhaustive()
    }
}

impl ServerRegistry {
    pub fn new(
        servers: Arc<dyn ServerStore>,
        devices: Arc<dyn DeviceStore>,
        snapshots: Arc<dyn SnapshotStore>,
        clients: Arc<ClientPool>,
        vault: CredentialVault,
    ) -> Self {
        Self {
            servers,
            devices,
            snapshots,
            clients,
            vault,
        }
    }

    pub async fn list_all(&self) -> Result<Vec<FleetServer>> {
        self.servers.list().await
    }

    pub async fn get(&self, id: ServerId) -> Result<Option<FleetServer>> {
        self.servers.get(id).await
    }

    pub async fn get_by_url(&self, url: &str) -> Result<Option<FleetServer>> {
        self.servers.get_by_url(url).await
    }

    /// Register a fleet server.
    ///
    /// The handshake against the activation endpoint proves the server is
    /// reachable with the supplied credentials and supplies its organization
    /// details; failure aborts the registration with no row written. The
    /// emergency account provisioning that follows is best effort: on
    /// failure the row is still inserted, with a warning on the outcome and
    /// the emergency columns left empty.
    pub async fn add(&self, spec: FleetServerSpec) -> Result<ServerAdded> {
        let url = spec.url.trim_end_matches('/').to_string();
        validate_url(&url)?;
        let probe = self
            .clients
            .probe(&url, &spec.admin_name, &spec.admin_password)?;

        let activation = probe
            .fetch_activation()
            .await
            .map_err(|source| EngineError::ServerUnreachable {
                url: url.clone(),
                source,
            })?;

        let mut warnings = Vec::new();
        let emergency_name = format!("{}-{}", EMERGENCY_NAME_PREFIX, random_token(8));
        let emergency_password = random_token(EMERGENCY_PASSWORD_LEN);
        let emergency = match probe
            .create_account(&emergency_name, &emergency_password)
            .await
        {
            Ok(()) => Some((emergency_name, self.vault.encrypt(&emergency_password)?)),
            Err(source) => {
                let failure = EngineError::ServiceAccountSetup {
                    url: url.clone(),
                    source,
                };
                warn!(target: "registry", %url, error = %failure, "emergency account setup failed");
                warnings.push(format!("{failure}; emergency access will not work"));
                None
            }
        };
        let (emergency_name, emergency_password) = emergency.unzip();

        let server = self
            .servers
            .insert(NewServer {
                url: url.clone(),
                admin_name: spec.admin_name,
                admin_password: self.vault.encrypt(&spec.admin_password)?,
                emergency_name,
                emergency_password,
                cron_limited: spec.cron_limited,
                cron_expanded: spec.cron_expanded,
                org_name: activation.org_name,
                activation_code: activation.activation_code,
            })
            .await?;

        info!(
            target: "registry",
            server_id = server.id,
            %url,
            org = %server.org_name,
            "fleet server registered"
        );
        Ok(ServerAdded { server, warnings })
    }

    /// Apply a partial update. A new admin password is encrypted here; the
    /// URL and emergency credentials cannot be changed through this path.
    pub async fn update(&self, id: ServerId, update: ServerUpdate) -> Result<FleetServer> {
        let admin_password = match update.admin_password {
            Some(plaintext) => Some(self.vault.encrypt(&plaintext)?),
            None => None,
        };

        let server = self
            .servers
            .update(
                id,
                ServerChanges {
                    admin_name: update.admin_name,
                    admin_password,
                    cron_limited: update.cron_limited,
                    cron_expanded: update.cron_expanded,
                    org_name: update.org_name,
                },
            )
            .await?;

        info!(target: "registry", server_id = id, "fleet server updated");
        Ok(server)
    }

    /// Remove a server and everything synced from it.
    ///
    /// Order matters: snapshots first (best effort), then the server row,
    /// then its device rows. The stores are not covered by one transaction,
    /// so a crash mid-cascade can leave orphaned device rows; the next
    /// removal attempt or a re-registration under the same URL cleans them
    /// up.
    pub async fn remove(&self, id: ServerId) -> Result<ServerRemoved> {
        let server = self
            .servers
            .get(id)
            .await?
            .ok_or_else(|| EngineError::UnknownServer(id.to_string()))?;

        let mut warnings = Vec::new();
        let snapshots_removed = match self.snapshots.purge_server(id).await {
            Ok(n) => n,
            Err(e) => {
                warn!(target: "registry", server_id = id, error = %e, "snapshot purge failed");
                warnings.push(format!("snapshot purge failed: {e}"));
                0
            }
        };

        self.servers.delete(id).await?;
        let devices_removed = self.devices.delete_for_server(id).await?;

        info!(
            target: "registry",
            server_id = id,
            url = %server.url,
            devices_removed,
            snapshots_removed,
            "fleet server removed"
        );
        Ok(ServerRemoved {
            server_id: id,
            devices_removed,
            snapshots_removed,
            warnings,
        })
    }

    /// Set or clear the stored emergency password out of band. The account
    /// name is left as provisioned.
    pub async fn set_emergency_password(&self, url: &str, plaintext: Option<&str>) -> Result<()> {
        let server = self
            .servers
            .get_by_url(url)
            .await?
            .ok_or_else(|| EngineError::UnknownServer(url.to_string()))?;

        let encrypted = match plaintext {
            Some(p) => Some(self.vault.encrypt(p)?),
            None => None,
        };
        self.servers
            .set_emergency(url, server.emergency_name, encrypted)
            .await
    }

    /// Destructive read of the emergency password. The stored ciphertext is
    /// cleared before decryption, so a password can be observed exactly
    /// once; a second call returns `EmergencyNotSet`.
    pub async fn emergency_access(&self, url: &str) -> Result<String> {
        self.servers
            .get_by_url(url)
            .await?
            .ok_or_else(|| EngineError::UnknownServer(url.to_string()))?;

        let ciphertext = self
            .servers
            .take_emergency_password(url)
            .await?
            .ok_or_else(|| EngineError::EmergencyNotSet(url.to_string()))?;

        let plaintext = self.vault.decrypt(&ciphertext).inspect_err(|e| {
            // The ciphertext is already gone; it was unreadable anyway.
            warn!(target: "registry", %url, error = %e, "emergency password was undecryptable");
        })?;

        info!(target: "registry", %url, "emergency password read and destroyed");
        Ok(plaintext)
    }
}

fn validate_url(url: &str) -> Result<()> {
    let parsed = Url::parse(url).map_err(|e| EngineError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(EngineError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme {}", parsed.scheme()),
        });
    }
    if parsed.host_str().is_none() {
        return Err(EngineError::InvalidUrl {
            url: url.to_string(),
            reason: "missing host".into(),
        });
    }
    Ok(())
}
