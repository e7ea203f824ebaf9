use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

pub type ServerId = i64;

/// The two device classes a fleet server manages. Everything that varies by
/// class (resource paths, payload keys, document collections) hangs off this
/// enum so the mapping is decided in exactly one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Computer,
    Mobile,
}

impl DeviceType {
    pub const ALL: [DeviceType; 2] = [DeviceType::Computer, DeviceType::Mobile];

    /// Stored form in the relational device rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Computer => "computer",
            DeviceType::Mobile => "mobile",
        }
    }

    /// The singular noun the fleet API uses for this class.
    pub fn api_noun(&self) -> &'static str {
        match self {
            DeviceType::Computer => "computer",
            DeviceType::Mobile => "mobile_device",
        }
    }

    /// Plural form: URL path segment, list payload key, and XML group element.
    pub fn resource_collection(&self) -> &'static str {
        match self {
            DeviceType::Computer => "computers",
            DeviceType::Mobile => "mobile_devices",
        }
    }

    /// Snapshot collection in the document store.
    pub fn collection_name(&self) -> &'static str {
        self.resource_collection()
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "computer" => Ok(DeviceType::Computer),
            "mobile" | "mobile_device" => Ok(DeviceType::Mobile),
            other => Err(EngineError::Internal(format!(
                "unknown device type: {other}"
            ))),
        }
    }
}

/// A registered fleet server as stored. Password fields hold vault
/// ciphertext, never plaintext.
#[derive(Clone, Serialize, sqlx::FromRow)]
pub struct FleetServer {
    pub id: ServerId,
    pub url: String,
    pub admin_name: String,
    #[serde(skip_serializing)]
    pub admin_password: String,
    pub emergency_name: Option<String>,
    #[serde(skip_serializing)]
    pub emergency_password: Option<String>,
    pub cron_limited: String,
    pub cron_expanded: String,
    pub org_name: String,
    pub activation_code: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for FleetServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FleetServer")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("admin_name", &self.admin_name)
            .field("emergency_name", &self.emergency_name)
            .field("cron_limited", &self.cron_limited)
            .field("cron_expanded", &self.cron_expanded)
            .field("org_name", &self.org_name)
            .finish_non_exhaustive()
    }
}

/// Caller input for registering a fleet server. Organization name and
/// activation code are read from the server during the handshake, and
/// emergency credentials are generated during provisioning, so neither
/// appears here.
#[derive(Clone)]
pub struct FleetServerSpec {
    pub url: String,
    pub admin_name: String,
    /// Plaintext; encrypted by the registry before storage.
    pub admin_password: String,
    pub cron_limited: String,
    pub cron_expanded: String,
}

impl fmt::Debug for FleetServerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FleetServerSpec")
            .field("url", &self.url)
            .field("admin_name", &self.admin_name)
            .field("cron_limited", &self.cron_limited)
            .field("cron_expanded", &self.cron_expanded)
            .finish_non_exhaustive()
    }
}

/// Partial update for a registered server. The URL and the emergency
/// credentials are deliberately absent: the URL is the server's identity and
/// emergency credentials only change through provisioning or the destructive
/// read. Absent fields keep their stored values.
#[derive(Clone, Default)]
pub struct ServerUpdate {
    pub admin_name: Option<String>,
    /// Plaintext; re-encrypted by the registry before storage.
    pub admin_password: Option<String>,
    pub cron_limited: Option<String>,
    pub cron_expanded: Option<String>,
    pub org_name: Option<String>,
}

impl fmt::Debug for ServerUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerUpdate")
            .field("admin_name", &self.admin_name)
            .field(
                "admin_password",
                &self.admin_password.as_ref().map(|_| "<redacted>"),
            )
            .field("cron_limited", &self.cron_limited)
            .field("cron_expanded", &self.cron_expanded)
            .field("org_name", &self.org_name)
            .finish()
    }
}

/// Lightweight per-device row in the relational store, keyed by
/// (server_id, udid).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub external_id: i64,
    pub udid: String,
    pub serial_number: String,
    pub name: String,
    pub device_type: DeviceType,
    pub server_id: ServerId,
    pub last_synced: DateTime<Utc>,
}

/// One entry of a fleet server's limited device list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceDescriptor {
    pub id: i64,
    pub udid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub serial_number: String,
}

/// Caller-facing handle for a device, matched against stored summaries when
/// dispatching commands.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceRef {
    pub serial_number: String,
    pub udid: String,
}

/// The closed command vocabulary accepted by `dispatch_command`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteCommand {
    Lock,
    Wipe,
    ClearPasscode,
}

impl RemoteCommand {
    /// Name the fleet API expects inside the command payload.
    pub fn wire_name(&self) -> &'static str {
        match self {
            RemoteCommand::Lock => "DeviceLock",
            RemoteCommand::Wipe => "EraseDevice",
            RemoteCommand::ClearPasscode => "ClearPasscode",
        }
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl FromStr for RemoteCommand {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lock" | "DeviceLock" => Ok(RemoteCommand::Lock),
            "wipe" | "EraseDevice" => Ok(RemoteCommand::Wipe),
            "clear_passcode" | "ClearPasscode" => Ok(RemoteCommand::ClearPasscode),
            other => Err(EngineError::Internal(format!("unknown command: {other}"))),
        }
    }
}

/// A full inventory payload with its device class decided. Classification
/// happens once, from the top-level key the fleet server wrapped the record
/// in; stores and everything downstream branch on the tag instead of
/// re-inspecting the payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ExpandedInventory {
    Computer(Value),
    Mobile(Value),
}

impl ExpandedInventory {
    pub fn classify(payload: Value) -> crate::Result<Self> {
        let obj = payload
            .as_object()
            .ok_or_else(|| EngineError::MalformedInventory("payload is not an object".into()))?;
        if let Some(inner) = obj.get(DeviceType::Computer.api_noun()) {
            return Ok(ExpandedInventory::Computer(inner.clone()));
        }
        if let Some(inner) = obj.get(DeviceType::Mobile.api_noun()) {
            return Ok(ExpandedInventory::Mobile(inner.clone()));
        }
        let keys: Vec<&str> = obj.keys().map(String::as_str).collect();
        Err(EngineError::MalformedInventory(format!(
            "no recognized device key, found: {}",
            keys.join(", ")
        )))
    }

    pub fn device_type(&self) -> DeviceType {
        match self {
            ExpandedInventory::Computer(_) => DeviceType::Computer,
            ExpandedInventory::Mobile(_) => DeviceType::Mobile,
        }
    }

    pub fn record(&self) -> &Value {
        match self {
            ExpandedInventory::Computer(v) | ExpandedInventory::Mobile(v) => v,
        }
    }
}
