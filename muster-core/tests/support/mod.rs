//! Shared test fixtures: an engine over in-memory stores, talking to a
//! wiremock stand-in for a fleet server.

use std::sync::Arc;

use muster_core::store::memory::{MemoryDeviceStore, MemoryServerStore, MemorySnapshotStore};
use muster_core::{CredentialVault, FetchOptions, FleetServerSpec, SyncEngine};
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const VAULT_KEY: &str = "integration vault passphrase";
pub const ADMIN_NAME: &str = "admin";
pub const ADMIN_PASSWORD: &str = "hunter2";

// Helpers are shared across test binaries; not every binary uses every one.
#[allow(unused)]
pub struct TestHarness {
    pub engine: SyncEngine,
    pub servers: Arc<MemoryServerStore>,
    pub devices: Arc<MemoryDeviceStore>,
    pub snapshots: Arc<MemorySnapshotStore>,
}

#[allow(unused)]
pub fn build_engine() -> TestHarness {
    build_engine_with_options(FetchOptions::default())
}

#[allow(unused)]
pub fn build_engine_with_options(options: FetchOptions) -> TestHarness {
    let servers = Arc::new(MemoryServerStore::new());
    let devices = Arc::new(MemoryDeviceStore::new());
    let snapshots = Arc::new(MemorySnapshotStore::new());
    let engine = SyncEngine::builder()
        .with_vault(CredentialVault::new(VAULT_KEY))
        .with_server_store(servers.clone())
        .with_device_store(devices.clone())
        .with_snapshot_store(snapshots.clone())
        .with_fetch_options(options)
        .build()
        .expect("engine assembles from complete dependencies");
    TestHarness {
        engine,
        servers,
        devices,
        snapshots,
    }
}

/// A fleet server that accepts the registration handshake and account
/// provisioning. Inventory and command endpoints are mounted per test.
#[allow(unused)]
pub async fn mock_fleet_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/resource/activationcode"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "activation_code": {
                "organization_name": "Acme Corp",
                "code": "ABCD-1234",
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/resource/accounts/account"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;
    server
}

// Once-daily schedules: registration arms the real cron jobs, and a pass
// firing mid-test would race the wiremock expectations.
#[allow(unused)]
pub fn spec_for(server: &MockServer) -> FleetServerSpec {
    FleetServerSpec {
        url: server.uri(),
        admin_name: ADMIN_NAME.into(),
        admin_password: ADMIN_PASSWORD.into(),
        cron_limited: "17 3 * * *".into(),
        cron_expanded: "43 4 * * *".into(),
    }
}

#[allow(unused)]
pub fn computer_descriptor(id: i64, udid: &str, name: &str) -> Value {
    json!({
        "id": id,
        "udid": udid,
        "name": name,
        "serial_number": format!("C02-{id:04}"),
    })
}

#[allow(unused)]
pub fn mobile_descriptor(id: i64, udid: &str, name: &str) -> Value {
    json!({
        "id": id,
        "udid": udid,
        "name": name,
        "serial_number": format!("F9F-{id:04}"),
    })
}

#[allow(unused)]
pub async fn mount_device_lists(server: &MockServer, computers: Vec<Value>, mobiles: Vec<Value>) {
    Mock::given(method("GET"))
        .and(path("/resource/computers"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "computers": computers })),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/resource/mobile_devices"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "mobile_devices": mobiles })),
        )
        .mount(server)
        .await;
}

#[allow(unused)]
pub fn computer_record(id: i64, name: &str) -> Value {
    json!({
        "computer": {
            "general": {
                "id": id,
                "name": name,
                "last_contact_time": "2026-08-20T11:02:44Z",
            },
            "hardware": {
                "model": "MacBookPro18,3",
                "os_version": "15.6",
            },
        }
    })
}

#[allow(unused)]
pub fn mobile_record(id: i64, name: &str) -> Value {
    json!({
        "mobile_device": {
            "general": {
                "id": id,
                "name": name,
                "managed": true,
            },
        }
    })
}

/// Requests the mock server received for one path.
#[allow(unused)]
pub async fn requests_for(server: &MockServer, path: &str) -> Vec<wiremock::Request> {
    server
        .received_requests()
        .await
        .expect("request recording enabled")
        .into_iter()
        .filter(|r| r.url.path() == path)
        .collect()
}
