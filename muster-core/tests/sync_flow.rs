//! Limited and expanded sync passes against a mock fleet server.

use anyhow::Result;
use muster_core::store::{DeviceStore, SnapshotStore};
use muster_core::{DeviceType, FailureScope, SyncKind};
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

mod support;
use support::{
    build_engine, computer_descriptor, computer_record, mobile_descriptor, mobile_record,
    mock_fleet_server, mount_device_lists, spec_for,
};

#[tokio::test]
async fn limited_sync_reconciles_both_device_classes() -> Result<()> {
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

    let harness = build_engine();
    let id = harness.engine.add_server(spec_for(&fleet)).await?.server.id;

    let outcome = harness.engine.run_limited_sync_now(id).await?;
    assert_eq!(outcome.kind, SyncKind::Limited);
    assert_eq!(outcome.synced, 3);
    assert!(outcome.failures.is_empty());

    let rows = harness.devices.list_for_server(id).await?;
    assert_eq!(rows.len(), 3);

    let mac = rows.iter().find(|d| d.udid == "udid-c1").unwrap();
    assert_eq!(mac.name, "Mac 1");
    assert_eq!(mac.external_id, 1);
    assert_eq!(mac.device_type, DeviceType::Computer);
    assert_eq!(mac.serial_number, "C02-0001");

    let ipad = rows.iter().find(|d| d.udid == "udid-m9").unwrap();
    assert_eq!(ipad.device_type, DeviceType::Mobile);
    Ok(())
}

#[tokio::test]
async fn limited_sync_updates_rows_in_place() -> Result<()> {
    let fleet = mock_fleet_server().await;
    // First pass sees the device under its old name, later passes the new.
    Mock::given(method("GET"))
        .and(path("/resource/computers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "computers": [computer_descriptor(1, "udid-c1", "Before Rename")]
        })))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&fleet)
        .await;
    Mock::given(method("GET"))
        .and(path("/resource/computers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "computers": [computer_descriptor(1, "udid-c1", "After Rename")]
        })))
        .with_priority(2)
        .mount(&fleet)
        .await;
    Mock::given(method("GET"))
        .and(path("/resource/mobile_devices"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"mobile_devices": []})),
        )
        .mount(&fleet)
        .await;

    let harness = build_engine();
    let id = harness.engine.add_server(spec_for(&fleet)).await?.server.id;

    harness.engine.run_limited_sync_now(id).await?;
    let first = harness.devices.list_for_server(id).await?;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].name, "Before Rename");

    harness.engine.run_limited_sync_now(id).await?;
    let second = harness.devices.list_for_server(id).await?;
    assert_eq!(second.len(), 1, "second pass must not duplicate the row");
    assert_eq!(second[0].name, "After Rename");
    assert!(second[0].last_synced > first[0].last_synced);
    Ok(())
}

#[tokio::test]
async fn list_fetch_failure_spares_the_other_device_class() -> Result<()> {
    let fleet = mock_fleet_server().await;
    Mock::given(method("GET"))
        .and(path("/resource/computers"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&fleet)
        .await;
    Mock::given(method("GET"))
        .and(path("/resource/mobile_devices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "mobile_devices": [mobile_descriptor(9, "udid-m9", "iPad 9")]
        })))
        .mount(&fleet)
        .await;

    let harness = build_engine();
    let id = harness.engine.add_server(spec_for(&fleet)).await?.server.id;

    let outcome = harness.engine.run_limited_sync_now(id).await?;
    assert_eq!(outcome.synced, 1);
    assert_eq!(outcome.failures.len(), 1);
    assert!(matches!(
        outcome.failures[0].scope,
        FailureScope::List(DeviceType::Computer)
    ));

    let rows = harness.devices.list_for_server(id).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].udid, "udid-m9");
    Ok(())
}

#[tokio::test]
async fn expanded_sync_stores_full_snapshots() -> Result<()> {
    let fleet = mock_fleet_server().await;
    mount_device_lists(
        &fleet,
        vec![computer_descriptor(1, "udid-c1", "Mac 1")],
        vec![mobile_descriptor(9, "udid-m9", "iPad 9")],
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/resource/computers/id/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(computer_record(1, "Mac 1")))
        .mount(&fleet)
        .await;
    Mock::given(method("GET"))
        .and(path("/resource/mobile_devices/id/9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(mobile_record(9, "iPad 9")))
        .mount(&fleet)
        .await;

    let harness = build_engine();
    let id = harness.engine.add_server(spec_for(&fleet)).await?.server.id;
    harness.engine.run_limited_sync_now(id).await?;

    let outcome = harness.engine.run_expanded_sync_now(id).await?;
    assert_eq!(outcome.kind, SyncKind::Expanded);
    assert_eq!(outcome.synced, 2);
    assert!(outcome.failures.is_empty());

    let computer = harness
        .snapshots
        .fetch(DeviceType::Computer, id, 1)
        .await?
        .expect("computer snapshot stored");
    assert_eq!(computer.inventory["general"]["name"], "Mac 1");
    assert_eq!(computer.inventory["hardware"]["model"], "MacBookPro18,3");
    assert_eq!(computer.server_id, id);

    let mobile = harness
        .snapshots
        .fetch(DeviceType::Mobile, id, 9)
        .await?
        .expect("mobile snapshot stored");
    assert_eq!(mobile.inventory["general"]["managed"], true);
    Ok(())
}

#[tokio::test]
async fn expanded_sync_replaces_earlier_snapshots_wholesale() -> Result<()> {
    let fleet = mock_fleet_server().await;
    mount_device_lists(
        &fleet,
        vec![computer_descriptor(1, "udid-c1", "Mac 1")],
        vec![],
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/resource/computers/id/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "computer": {"general": {"id": 1, "name": "Mac 1"}, "stale_section": {"x": 1}}
        })))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&fleet)
        .await;
    Mock::given(method("GET"))
        .and(path("/resource/computers/id/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "computer": {"general": {"id": 1, "name": "Mac 1 Renamed"}}
        })))
        .with_priority(2)
        .mount(&fleet)
        .await;

    let harness = build_engine();
    let id = harness.engine.add_server(spec_for(&fleet)).await?.server.id;
    harness.engine.run_limited_sync_now(id).await?;

    harness.engine.run_expanded_sync_now(id).await?;
    let first = harness
        .snapshots
        .fetch(DeviceType::Computer, id, 1)
        .await?
        .unwrap();
    assert_eq!(first.inventory["stale_section"]["x"], 1);

    harness.engine.run_expanded_sync_now(id).await?;
    let second = harness
        .snapshots
        .fetch(DeviceType::Computer, id, 1)
        .await?
        .unwrap();
    assert_eq!(second.inventory["general"]["name"], "Mac 1 Renamed");
    // Replacement, not merge: sections absent from the new fetch are gone.
    assert!(second.inventory.get("stale_section").is_none());
    assert!(second.fetched_at > first.fetched_at);
    assert_eq!(harness.snapshots.count().await, 1);
    Ok(())
}

#[tokio::test]
async fn expanded_sync_isolates_device_failures() -> Result<()> {
    let fleet = mock_fleet_server().await;
    mount_device_lists(
        &fleet,
        vec![
            computer_descriptor(1, "udid-c1", "Mac 1"),
            computer_descriptor(2, "udid-c2", "Mac 2"),
            computer_descriptor(3, "udid-c3", "Mac 3"),
        ],
        vec![],
    )
    .await;
    for id in [1, 3] {
        Mock::given(method("GET"))
            .and(path(format!("/resource/computers/id/{id}")))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(computer_record(id, "Mac")),
            )
            .mount(&fleet)
            .await;
    }
    Mock::given(method("GET"))
        .and(path("/resource/computers/id/2"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&fleet)
        .await;

    let harness = build_engine();
    let id = harness.engine.add_server(spec_for(&fleet)).await?.server.id;
    harness.engine.run_limited_sync_now(id).await?;

    let outcome = harness.engine.run_expanded_sync_now(id).await?;
    assert_eq!(outcome.synced, 2);
    assert_eq!(outcome.failures.len(), 1);
    assert!(matches!(
        &outcome.failures[0].scope,
        FailureScope::Device {
            device_type: DeviceType::Computer,
            external_id: 2,
            ..
        }
    ));

    assert!(
        harness
            .snapshots
            .fetch(DeviceType::Computer, id, 2)
            .await?
            .is_none()
    );
    assert_eq!(harness.snapshots.count().await, 2);
    Ok(())
}

#[tokio::test]
async fn unclassifiable_payload_is_a_device_failure() -> Result<()> {
    let fleet = mock_fleet_server().await;
    mount_device_lists(
        &fleet,
        vec![computer_descriptor(1, "udid-c1", "Mac 1")],
        vec![],
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/resource/computers/id/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "unexpected_wrapper": {"id": 1}
        })))
        .mount(&fleet)
        .await;

    let harness = build_engine();
    let id = harness.engine.add_server(spec_for(&fleet)).await?.server.id;
    harness.engine.run_limited_sync_now(id).await?;

    let outcome = harness.engine.run_expanded_sync_now(id).await?;
    assert_eq!(outcome.synced, 0);
    assert_eq!(outcome.failures.len(), 1);
    assert!(outcome.failures[0].reason.contains("unexpected_wrapper"));
    assert_eq!(harness.snapshots.count().await, 0);
    Ok(())
}

#[tokio::test]
async fn sync_against_an_unknown_server_id_fails_fast() -> Result<()> {
    let harness = build_engine();
    assert!(harness.engine.run_limited_sync_now(7).await.is_err());
    assert!(harness.engine.run_expanded_sync_now(7).await.is_err());
    Ok(())
}
