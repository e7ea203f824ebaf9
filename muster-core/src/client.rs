//! Outbound HTTP to fleet servers.
//!
//! Fleet servers are commonly deployed with self-signed certificates, so
//! certificate verification is disabled for these calls. No other network
//! path in the system does this.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::types::{DeviceDescriptor, DeviceType, FleetServer, RemoteCommand, ServerId};
use crate::vault::CredentialVault;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{url} returned {status}")]
    Status { status: StatusCode, url: String },

    #[error("unexpected response body: {0}")]
    MalformedResponse(String),
}

/// Connection settings shared by every fleet client.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Maximum in-flight requests per fleet server.
    pub concurrency: usize,
    /// Per-request timeout. Expiry fails that request only.
    pub timeout: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            concurrency: 3,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Organization details returned by the activation endpoint during the
/// registration handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationInfo {
    pub org_name: String,
    pub activation_code: String,
}

/// HTTP client bound to one fleet server. Every request holds a semaphore
/// permit, so callers queue in arrival order once the ceiling is reached.
pub struct FleetClient {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for FleetClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetClient")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("permits_available", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

impl FleetClient {
    pub fn new(
        base_url: &str,
        username: &str,
        password: &str,
        options: &FetchOptions,
    ) -> std::result::Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(options.timeout)
            .danger_accept_invalid_certs(true)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            permits: Arc::new(Semaphore::new(options.concurrency.max(1))),
        })
    }

    fn resource_url(&self, path: &str) -> String {
        format!("{}/resource/{}", self.base_url, path)
    }

    async fn get_json(&self, url: &str) -> std::result::Result<Value, ClientError> {
        let _permit = self.permits.acquire().await.expect("semaphore");
        debug!(target: "fleet_client", %url, "GET");
        let response = self
            .client
            .get(url)
            .basic_auth(&self.username, Some(&self.password))
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ClientError::Status {
                status: response.status(),
                url: url.to_string(),
            });
        }
        Ok(response.json().await?)
    }

    async fn post_xml(&self, url: &str, body: String) -> std::result::Result<(), ClientError> {
        let _permit = self.permits.acquire().await.expect("semaphore");
        debug!(target: "fleet_client", %url, "POST");
        let response = self
            .client
            .post(url)
            .basic_auth(&self.username, Some(&self.password))
            .header(reqwest::header::CONTENT_TYPE, "text/xml")
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ClientError::Status {
                status: response.status(),
                url: url.to_string(),
            });
        }
        Ok(())
    }

    /// Registration handshake. Proves the server is reachable with the given
    /// credentials and returns its organization details.
    pub async fn fetch_activation(&self) -> std::result::Result<ActivationInfo, ClientError> {
        let body = self.get_json(&self.resource_url("activationcode")).await?;
        let code = body
            .get("activation_code")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                ClientError::MalformedResponse("missing activation_code object".into())
            })?;
        let org_name = code
            .get("organization_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let activation_code = code
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(ActivationInfo {
            org_name,
            activation_code,
        })
    }

    /// Provision an admin account on the fleet server. Used once per server
    /// to create the emergency service account.
    pub async fn create_account(
        &self,
        name: &str,
        password: &str,
    ) -> std::result::Result<(), ClientError> {
        let body = account_payload(name, password);
        self.post_xml(&self.resource_url("accounts/account"), body)
            .await
    }

    /// Limited inventory: the device list for one class.
    pub async fn fetch_device_list(
        &self,
        device_type: DeviceType,
    ) -> std::result::Result<Vec<DeviceDescriptor>, ClientError> {
        let collection = device_type.resource_collection();
        let body = self.get_json(&self.resource_url(collection)).await?;
        let items = body
            .get(collection)
            .cloned()
            .ok_or_else(|| ClientError::MalformedResponse(format!("missing {collection} key")))?;
        serde_json::from_value(items).map_err(|e| ClientError::MalformedResponse(e.to_string()))
    }

    /// Expanded inventory: the full nested record for one device.
    pub async fn fetch_expanded_device(
        &self,
        device_type: DeviceType,
        external_id: i64,
    ) -> std::result::Result<Value, ClientError> {
        let path = format!("{}/id/{}", device_type.resource_collection(), external_id);
        self.get_json(&self.resource_url(&path)).await
    }

    /// Submit one management command for one device.
    pub async fn submit_command(
        &self,
        device_type: DeviceType,
        command: RemoteCommand,
        external_id: i64,
    ) -> std::result::Result<(), ClientError> {
        let body = command_payload(device_type, command, external_id);
        self.post_xml(&self.resource_url("commands/command"), body)
            .await
    }
}

/// Command body for one device. The wire format supports multiple devices
/// per submission; the dispatcher still sends one body per device, matching
/// the behavior callers have always observed.
pub(crate) fn command_payload(
    device_type: DeviceType,
    command: RemoteCommand,
    external_id: i64,
) -> String {
    let noun = device_type.api_noun();
    let group = device_type.resource_collection();
    format!(
        "<{noun}_command><general><command>{}</command></general>\
         <{group}><{noun}><id>{external_id}</id></{noun}></{group}></{noun}_command>",
        command.wire_name()
    )
}

pub(crate) fn account_payload(name: &str, password: &str) -> String {
    format!(
        "<account><name>{name}</name><password>{password}</password>\
         <privilege_set>Administrator</privilege_set>\
         <access_level>Full Access</access_level></account>"
    )
}

/// One client per registered server, built lazily and shared by the sync
/// jobs and the dispatcher so they draw from the same concurrency ceiling.
/// This is the only place stored admin passwords are decrypted.
pub struct ClientPool {
    vault: CredentialVault,
    options: FetchOptions,
    clients: Mutex<HashMap<ServerId, Arc<FleetClient>>>,
}

impl std::fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cached = self.clients.lock().map(|c| c.len()).unwrap_or(0);
        f.debug_struct("ClientPool")
            .field("options", &self.options)
            .field("cached", &cached)
            .finish_non_exhaustive()
    }
}

impl ClientPool {
    pub fn new(vault: CredentialVault, options: FetchOptions) -> Self {
        Self {
            vault,
            options,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn client_for(&self, server: &FleetServer) -> Result<Arc<FleetClient>> {
        if let Ok(clients) = self.clients.lock()
            && let Some(client) = clients.get(&server.id)
        {
            return Ok(client.clone());
        }

        let password = self.vault.decrypt(&server.admin_password)?;
        let client = Arc::new(FleetClient::new(
            &server.url,
            &server.admin_name,
            &password,
            &self.options,
        )?);

        let mut clients = self
            .clients
            .lock()
            .map_err(|_| EngineError::Internal("client pool lock poisoned".into()))?;
        Ok(clients.entry(server.id).or_insert(client).clone())
    }

    /// Build a client from explicit credentials, bypassing the cache. Used
    /// during registration before a server row exists.
    pub fn probe(&self, url: &str, username: &str, password: &str) -> Result<FleetClient> {
        Ok(FleetClient::new(url, username, password, &self.options)?)
    }

    /// Drop every cached client. Called on schedule rebuild so credential
    /// and URL changes take effect.
    pub fn invalidate(&self) {
        if let Ok(mut clients) = self.clients.lock() {
            clients.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computer_command_payload_shape() {
        let body = command_payload(DeviceType::Computer, RemoteCommand::Lock, 7);
        assert_eq!(
            body,
            "<computer_command><general><command>DeviceLock</command></general>\
             <computers><computer><id>7</id></computer></computers></computer_command>"
        );
    }

    #[test]
    fn mobile_command_payload_shape() {
        let body = command_payload(DeviceType::Mobile, RemoteCommand::Wipe, 42);
        assert_eq!(
            body,
            "<mobile_device_command><general><command>EraseDevice</command></general>\
             <mobile_devices><mobile_device><id>42</id></mobile_device></mobile_devices>\
             </mobile_device_command>"
        );
    }

    #[test]
    fn account_payload_shape() {
        let body = account_payload("svc", "pw");
        assert!(body.starts_with("<account><name>svc</name><password>pw</password>"));
        assert!(body.contains("<privilege_set>Administrator</privilege_set>"));
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = FleetClient::new(
            "https://mdm.example.com/",
            "admin",
            "pw",
            &FetchOptions::default(),
        )
        .unwrap();
        assert_eq!(
            client.resource_url("computers"),
            "https://mdm.example.com/resource/computers"
        );
    }
}
