//! Fleet server lifecycle: registration handshake, emergency account
//! provisioning, the destructive emergency read, and cascade removal.

use anyhow::Result;
use muster_core::store::DeviceStore;
use muster_core::{CredentialVault, EngineError, FleetServerSpec, RemoteCommand};
use wiremock::matchers::{basic_auth, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod support;
use support::{
    ADMIN_NAME, ADMIN_PASSWORD, VAULT_KEY, build_engine, computer_descriptor, computer_record,
    mobile_descriptor, mobile_record, mock_fleet_server, mount_device_lists, requests_for,
    spec_for,
};

#[tokio::test]
async fn registration_stores_handshake_details_and_encrypted_credentials() -> Result<()> {
    let fleet = mock_fleet_server().await;
    let harness = build_engine();

    let added = harness.engine.add_server(spec_for(&fleet)).await?;
    assert!(added.warnings.is_empty(), "warnings: {:?}", added.warnings);

    let server = added.server;
    assert_eq!(server.org_name, "Acme Corp");
    assert_eq!(server.activation_code, "ABCD-1234");
    assert_eq!(server.admin_name, ADMIN_NAME);

    // Stored credentials are ciphertext that the vault can still read back.
    assert_ne!(server.admin_password, ADMIN_PASSWORD);
    let vault = CredentialVault::new(VAULT_KEY);
    assert_eq!(vault.decrypt(&server.admin_password)?, ADMIN_PASSWORD);

    let emergency_name = server.emergency_name.expect("emergency account provisioned");
    assert!(emergency_name.starts_with("muster-emergency-"));
    assert!(server.emergency_password.is_some());

    let provisioning = requests_for(&fleet, "/resource/accounts/account").await;
    assert_eq!(provisioning.len(), 1);
    let body = String::from_utf8(provisioning[0].body.clone())?;
    assert!(body.contains(&format!("<name>{emergency_name}</name>")));
    assert!(body.contains("<privilege_set>Administrator</privilege_set>"));

    Ok(())
}

#[tokio::test]
async fn registration_authenticates_with_the_supplied_credentials() -> Result<()> {
    let fleet = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/resource/activationcode"))
        .and(basic_auth(ADMIN_NAME, ADMIN_PASSWORD))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "activation_code": {"organization_name": "Acme Corp", "code": "ABCD-1234"}
        })))
        .mount(&fleet)
        .await;
    Mock::given(method("POST"))
        .and(path("/resource/accounts/account"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&fleet)
        .await;

    let harness = build_engine();
    let added = harness.engine.add_server(spec_for(&fleet)).await?;
    assert!(added.warnings.is_empty());
    Ok(())
}

#[tokio::test]
async fn duplicate_url_is_rejected() -> Result<()> {
    let fleet = mock_fleet_server().await;
    let harness = build_engine();
    harness.engine.add_server(spec_for(&fleet)).await?;

    // A trailing slash names the same server.
    let mut again = spec_for(&fleet);
    again.url = format!("{}/", fleet.uri());
    let err = harness.engine.add_server(again).await.unwrap_err();
    assert!(matches!(err, EngineError::UrlAlreadyRegistered(_)));

    assert_eq!(harness.engine.list_servers().await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn failed_handshake_aborts_registration() -> Result<()> {
    let fleet = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/resource/activationcode"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&fleet)
        .await;

    let harness = build_engine();
    let err = harness.engine.add_server(spec_for(&fleet)).await.unwrap_err();
    assert!(matches!(err, EngineError::ServerUnreachable { .. }));
    assert!(harness.engine.list_servers().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn invalid_url_never_reaches_the_network() -> Result<()> {
    let harness = build_engine();
    let spec = FleetServerSpec {
        url: "ldap://mdm.example.com".into(),
        admin_name: ADMIN_NAME.into(),
        admin_password: ADMIN_PASSWORD.into(),
        cron_limited: "17 3 * * *".into(),
        cron_expanded: "43 4 * * *".into(),
    };

    let err = harness.engine.add_server(spec).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidUrl { .. }));
    Ok(())
}

#[tokio::test]
async fn account_provisioning_failure_warns_but_registers() -> Result<()> {
    let fleet = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/resource/activationcode"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "activation_code": {"organization_name": "Acme Corp", "code": "ABCD-1234"}
        })))
        .mount(&fleet)
        .await;
    Mock::given(method("POST"))
        .and(path("/resource/accounts/account"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&fleet)
        .await;

    let harness = build_engine();
    let added = harness.engine.add_server(spec_for(&fleet)).await?;

    assert_eq!(added.warnings.len(), 1);
    assert!(added.warnings[0].contains("emergency access will not work"));
    assert!(added.server.emergency_name.is_none());
    assert!(added.server.emergency_password.is_none());

    // The server is registered and usable despite the warning.
    assert_eq!(harness.engine.list_servers().await?.len(), 1);

    let err = harness
        .engine
        .emergency_access(&added.server.url)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::EmergencyNotSet(_)));
    Ok(())
}

#[tokio::test]
async fn emergency_password_can_be_read_exactly_once() -> Result<()> {
    let fleet = mock_fleet_server().await;
    let harness = build_engine();
    let added = harness.engine.add_server(spec_for(&fleet)).await?;
    let url = added.server.url;

    let password = harness.engine.emergency_access(&url).await?;
    assert_eq!(password.len(), 24);
    assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));

    let err = harness.engine.emergency_access(&url).await.unwrap_err();
    assert!(matches!(err, EngineError::EmergencyNotSet(_)));
    Ok(())
}

#[tokio::test]
async fn replacing_the_emergency_password_arms_another_read() -> Result<()> {
    let fleet = mock_fleet_server().await;
    let harness = build_engine();
    let added = harness.engine.add_server(spec_for(&fleet)).await?;
    let url = added.server.url;

    harness.engine.emergency_access(&url).await?;
    harness
        .engine
        .set_emergency_password(&url, Some("rotated-secret"))
        .await?;

    assert_eq!(harness.engine.emergency_access(&url).await?, "rotated-secret");
    let err = harness.engine.emergency_access(&url).await.unwrap_err();
    assert!(matches!(err, EngineError::EmergencyNotSet(_)));
    Ok(())
}

#[tokio::test]
async fn removal_cascades_to_summaries_and_snapshots() -> Result<()> {
    let fleet = mock_fleet_server().await;
    mount_device_lists(
        &fleet,
        vec![
            computer_descriptor(1, "udid-c1", "Mac 1"),
            computer_descriptor(2, "udid-c2", "Mac 2"),
        ],
        vec![mobile_descriptor(9, "udid-m9", "iPad 9")],
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/resource/computers/id/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(computer_record(1, "Mac 1")))
        .mount(&fleet)
        .await;
    Mock::given(method("GET"))
        .and(path("/resource/computers/id/2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(computer_record(2, "Mac 2")))
        .mount(&fleet)
        .await;
    Mock::given(method("GET"))
        .and(path("/resource/mobile_devices/id/9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(mobile_record(9, "iPad 9")))
        .mount(&fleet)
        .await;

    let harness = build_engine();
    let added = harness.engine.add_server(spec_for(&fleet)).await?;
    let id = added.server.id;

    harness.engine.run_limited_sync_now(id).await?;
    harness.engine.run_expanded_sync_now(id).await?;
    assert_eq!(harness.devices.list_for_server(id).await?.len(), 3);
    assert_eq!(harness.snapshots.count().await, 3);

    let removed = harness.engine.remove_server(id).await?;
    assert_eq!(removed.devices_removed, 3);
    assert_eq!(removed.snapshots_removed, 3);
    assert!(removed.warnings.is_empty());

    assert!(harness.engine.list_servers().await?.is_empty());
    assert!(harness.devices.list_for_server(id).await?.is_empty());
    assert_eq!(harness.snapshots.count().await, 0);

    // The removed server's devices are no longer dispatchable.
    let results = harness
        .engine
        .dispatch_command(
            &[muster_core::DeviceRef {
                serial_number: "C02-0001".into(),
                udid: "udid-c1".into(),
            }],
            RemoteCommand::Lock,
        )
        .await;
    assert!(!results[0].status.is_submitted());
    Ok(())
}

#[tokio::test]
async fn removing_an_unknown_server_is_an_error() -> Result<()> {
    let harness = build_engine();
    let err = harness.engine.remove_server(404).await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownServer(_)));
    Ok(())
}
