//! End-to-end client tests against the fake device manager
//!
//! Covers the full path of each operation: blob store, lease handling,
//! validation, the control buffer codec and the device table.

mod common;

use common::*;
use dysk::channel::Command;
use dysk::client::{CreateRequest, LeaseOptions, MountRequest};
use dysk::device::{AccessMode, DeviceRecord};
use dysk::lease::PROBE_METADATA_KEY;
use dysk::size::{self, GIB};
use dysk::store::{BlobRef, BlobStore, ByteRange, LeaseState};
use dysk::{vhd, DyskError, Result};

fn mount_named(name: &str) -> MountRequest {
    MountRequest {
        device_name: Some(name.to_string()),
        ..Default::default()
    }
}

/// Create then mount a 4GB VHD blob and read it back
#[tokio::test]
async fn test_create_mount_get_vhd() -> Result<()> {
    let harness = TestHarness::new();

    let created = harness
        .client
        .create(&CreateRequest {
            name: Some("disk1".to_string()),
            size_gb: 4,
            ..Default::default()
        })
        .await?;
    assert_eq!(created.blob, BlobRef::new("dysks", "disk1.vhd"));
    assert_eq!(created.lease_id, None);

    let record = harness.client.mount(&mount_named("disk1")).await?;
    assert_eq!(record.path, "/dysks/disk1.vhd");
    assert_eq!(record.mode, AccessMode::ReadWrite);
    assert_eq!(record.size_gb, 4);
    assert_eq!(record.sector_count, (4 * GIB - 512) / 512);
    assert_eq!(record.major, MAJOR);
    assert_eq!(record.host, HOST);
    assert_eq!(record.ip, HOST_IP.to_string());
    assert!(!record.lease_id.is_empty());

    let store = harness.store();
    assert_eq!(store.lease_state(&created.blob), Some(LeaseState::Leased));

    // The footer sits in the last 512 bytes and describes the payload
    let tail = store
        .read_range(&created.blob, ByteRange::tail(4 * GIB, 512), None)
        .await?;
    let mut footer = [0u8; vhd::FOOTER_SIZE];
    footer.copy_from_slice(&tail);
    assert!(vhd::is_valid_footer(&footer));
    assert_eq!(vhd::footer_disk_size(&footer), 4 * GIB - 512);

    // The mount request uses the ten-field layout
    let mounts = harness.manager.requests_for(Command::Mount);
    assert_eq!(mounts.len(), 1);
    let fields = lines(&mounts[0]);
    assert_eq!(fields.len(), 10);
    assert_eq!(fields[0], "RW");
    assert_eq!(fields[1], "disk1");
    assert_eq!(fields[2], record.sector_count.to_string());
    assert_eq!(fields[3], ACCOUNT);
    assert_eq!(fields[5], "/dysks/disk1.vhd");
    assert_eq!(fields[6], HOST);
    assert_eq!(fields[9], "1");

    let fetched = harness.client.get("disk1")?;
    assert_eq!(fetched.size_gb, 4);
    assert_eq!(fetched.lease_id, record.lease_id);
    assert_eq!(fetched.minor, record.minor);
    Ok(())
}

#[tokio::test]
async fn test_auto_create_mount_uses_random_name() -> Result<()> {
    let harness = TestHarness::new();

    let record = harness
        .client
        .mount(&MountRequest {
            auto_create: true,
            size_gb: 2,
            ..Default::default()
        })
        .await?;

    assert!(record.name.starts_with('d'));
    assert_eq!(record.name.len(), 21);
    assert_eq!(record.path, format!("/dysks/{}.vhd", record.name));
    assert_eq!(record.size_gb, 2);

    let blob = BlobRef::parse(&record.path)?;
    let store = harness.store();
    assert_eq!(store.lease_state(&blob), Some(LeaseState::Leased));
    // The lease taken on creation is reused, not acquired twice
    assert_eq!(store.stats().acquire_calls, 1);
    assert_eq!(harness.manager.mounted_names(), vec![record.name]);
    Ok(())
}

#[tokio::test]
async fn test_mount_probes_read_write_only() -> Result<()> {
    let harness = TestHarness::new();
    for name in ["rw1", "ro1"] {
        harness
            .client
            .create(&CreateRequest {
                name: Some(name.to_string()),
                size_gb: 1,
                vhd: false,
                ..Default::default()
            })
            .await?;
    }
    let store = harness.store();

    let rw = MountRequest {
        device_name: Some("rw1".to_string()),
        vhd: false,
        ..Default::default()
    };
    harness.client.mount(&rw).await?;
    assert_eq!(store.stats().metadata_writes, 1);
    let props = store.properties(&BlobRef::new("dysks", "rw1"), None).await?;
    assert_eq!(
        props.metadata.get(PROBE_METADATA_KEY).map(String::as_str),
        Some("dysk")
    );

    let ro = MountRequest {
        device_name: Some("ro1".to_string()),
        vhd: false,
        read_only: true,
        ..Default::default()
    };
    let record = harness.client.mount(&ro).await?;
    assert_eq!(record.mode, AccessMode::ReadOnly);
    assert_eq!(record.sector_count, GIB / 512);
    assert_eq!(store.stats().metadata_writes, 1);
    Ok(())
}

#[tokio::test]
async fn test_list_returns_devices_in_order() -> Result<()> {
    let harness = TestHarness::new();
    for name in ["alpha1", "beta2", "gamma3"] {
        harness
            .client
            .mount(&MountRequest {
                device_name: Some(name.to_string()),
                auto_create: true,
                size_gb: 1,
                ..Default::default()
            })
            .await?;
    }

    let records = harness.client.list()?;
    let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["alpha1", "beta2", "gamma3"]);
    assert!(records.iter().all(|r| r.size_gb == 1));

    // One list request, then one get per name and none for the trailing element
    assert_eq!(harness.manager.requests_for(Command::List), vec!["-".to_string()]);
    assert_eq!(
        harness.manager.requests_for(Command::Get),
        vec!["alpha1\n", "beta2\n", "gamma3\n"]
    );
    Ok(())
}

#[tokio::test]
async fn test_list_empty() -> Result<()> {
    let harness = TestHarness::new();
    assert!(harness.client.list()?.is_empty());
    assert!(harness.manager.requests_for(Command::Get).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_unmount_with_break_releases_lease() -> Result<()> {
    let harness = TestHarness::new();
    let record = harness
        .client
        .mount(&MountRequest {
            device_name: Some("disk2".to_string()),
            auto_create: true,
            size_gb: 1,
            ..Default::default()
        })
        .await?;

    let outcome = harness.client.unmount("disk2", true).await?;
    assert!(outcome.is_clean());
    assert!(harness.manager.mounted_names().is_empty());

    let blob = BlobRef::parse(&record.path)?;
    let store = harness.store();
    assert_eq!(store.lease_state(&blob), Some(LeaseState::Broken));
    assert_eq!(store.stats().break_calls, 1);
    Ok(())
}

#[tokio::test]
async fn test_unmount_without_break_keeps_lease() -> Result<()> {
    let harness = TestHarness::new();
    let record = harness
        .client
        .mount(&MountRequest {
            device_name: Some("disk3".to_string()),
            auto_create: true,
            size_gb: 1,
            ..Default::default()
        })
        .await?;

    let outcome = harness.client.unmount("disk3", false).await?;
    assert!(outcome.is_clean());
    assert!(harness.manager.requests_for(Command::Get).is_empty());

    let blob = BlobRef::parse(&record.path)?;
    assert_eq!(harness.store().lease_state(&blob), Some(LeaseState::Leased));
    Ok(())
}

#[tokio::test]
async fn test_unmount_break_failure_is_a_warning() -> Result<()> {
    let harness = TestHarness::new();
    let record = harness
        .client
        .mount(&MountRequest {
            device_name: Some("disk4".to_string()),
            auto_create: true,
            size_gb: 1,
            ..Default::default()
        })
        .await?;

    // Someone else breaks the lease while the device is mounted
    let blob = BlobRef::parse(&record.path)?;
    harness.store().break_lease(&blob, 0).await?;

    let outcome = harness.client.unmount("disk4", true).await?;
    assert_eq!(outcome.warnings.len(), 1);
    assert!(outcome.warnings[0].to_string().contains("/dysks/disk4.vhd"));
    assert!(harness.manager.mounted_names().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_device_manager_error_surfaces() {
    let harness = TestHarness::new();

    match harness.client.get("nosuch") {
        Err(DyskError::Device(message)) => assert_eq!(
            message,
            "Failed to get dysk, device with name:nosuch does not exists"
        ),
        other => panic!("Expected device error, got {:?}", other),
    }

    let err = harness.client.unmount("nosuch", false).await.unwrap_err();
    assert!(matches!(err, DyskError::Device(_)));
    assert_eq!(err.exit_code(), 5);
}

#[tokio::test]
async fn test_duplicate_device_name_rejected_by_device_manager() -> Result<()> {
    let harness = TestHarness::new();
    let request = MountRequest {
        device_name: Some("twin".to_string()),
        auto_create: true,
        size_gb: 1,
        ..Default::default()
    };
    harness.client.mount(&request).await?;

    let second = MountRequest {
        object_name: Some("other".to_string()),
        ..request
    };
    let err = harness.client.mount(&second).await.unwrap_err();
    match err {
        DyskError::Device(message) => assert!(message.contains("already exists")),
        other => panic!("Expected device error, got {:?}", other),
    }
    assert_eq!(harness.manager.mounted_names(), vec!["twin"]);

    // The blob created for the refused mount keeps no lease
    let other = BlobRef::new("dysks", "other.vhd");
    assert_eq!(harness.store().lease_state(&other), Some(LeaseState::Broken));
    Ok(())
}

#[tokio::test]
async fn test_mount_missing_blob_never_reaches_device_manager() {
    let harness = TestHarness::new();
    let err = harness.client.mount(&mount_named("ghost")).await.unwrap_err();
    assert!(matches!(err, DyskError::NotFound(_)));
    assert!(err.to_string().contains("Container at /dysks does not exist"));
    assert!(harness.manager.requests_for(Command::Mount).is_empty());
}

#[tokio::test]
async fn test_mount_block_blob_rejected() {
    let harness = TestHarness::new();
    harness
        .store()
        .insert_block_blob(&BlobRef::new("dysks", "block.vhd"), GIB);

    let err = harness.client.mount(&mount_named("block")).await.unwrap_err();
    assert_eq!(err.to_string(), "This blob is not a page blob");
    assert!(harness.manager.requests_for(Command::Mount).is_empty());
}

#[tokio::test]
async fn test_preleased_blob_requires_break() -> Result<()> {
    let harness = TestHarness::new();
    harness
        .client
        .create(&CreateRequest {
            name: Some("held".to_string()),
            size_gb: 1,
            lease: true,
            ..Default::default()
        })
        .await?;

    let err = harness.client.mount(&mount_named("held")).await.unwrap_err();
    assert!(matches!(err, DyskError::LeaseAlreadyPresent(_)));
    assert!(harness.manager.mounted_names().is_empty());

    let record = harness
        .client
        .mount(&MountRequest {
            break_lease: true,
            ..mount_named("held")
        })
        .await?;
    assert!(!record.lease_id.is_empty());

    let stats = harness.store().stats();
    assert_eq!(stats.break_calls, 1);
    // create, the refused mount, then the retry after breaking
    assert_eq!(stats.acquire_calls, 4);
    Ok(())
}

#[tokio::test]
async fn test_mount_with_stale_lease_id_fails() -> Result<()> {
    let harness = TestHarness::new();
    harness
        .client
        .create(&CreateRequest {
            name: Some("stale".to_string()),
            size_gb: 1,
            lease: true,
            ..Default::default()
        })
        .await?;

    let err = harness
        .client
        .mount(&MountRequest {
            lease_id: Some("00000000-0000-0000-0000-000000000000".to_string()),
            ..mount_named("stale")
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DyskError::LeaseMismatch(_)));
    assert!(harness.manager.requests_for(Command::Mount).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_mount_file_record_takes_client_credentials() -> Result<()> {
    let harness = TestHarness::new();
    harness
        .client
        .create(&CreateRequest {
            name: Some("raw1".to_string()),
            size_gb: 3,
            vhd: false,
            ..Default::default()
        })
        .await?;

    let json = br#"{
        "Type": "RW",
        "Name": "filedev",
        "AccountName": "",
        "AccountKey": "",
        "Path": "/dysks/raw1",
        "LeaseId": "",
        "Vhd": false
    }"#;
    let record = DeviceRecord::from_json(json)?;

    let mounted = harness
        .client
        .mount_record(
            record,
            LeaseOptions {
                auto_lease: true,
                break_lease: false,
            },
        )
        .await?;
    assert_eq!(mounted.account_name, ACCOUNT);
    assert_eq!(mounted.size_gb, 3);
    assert_eq!(mounted.sector_count, size::sectors_for(3, false)?);
    assert!(!mounted.lease_id.is_empty());
    assert_eq!(harness.manager.mounted_names(), vec!["filedev"]);
    Ok(())
}

#[tokio::test]
async fn test_mount_file_without_lease_is_invalid() -> Result<()> {
    let harness = TestHarness::new();
    harness
        .client
        .create(&CreateRequest {
            name: Some("raw2".to_string()),
            size_gb: 1,
            vhd: false,
            ..Default::default()
        })
        .await?;

    let record = DeviceRecord::new(AccessMode::ReadWrite, "nolease", "/dysks/raw2", false);
    let err = harness
        .client
        .mount_record(record, LeaseOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with("Invalid Lease Id."));
    Ok(())
}

#[tokio::test]
async fn test_delete_leased_blob() -> Result<()> {
    let harness = TestHarness::new();
    let created = harness
        .client
        .create(&CreateRequest {
            name: Some("gone".to_string()),
            size_gb: 1,
            lease: true,
            ..Default::default()
        })
        .await?;
    let store = harness.store();

    let err = harness
        .client
        .delete("dysks", "gone.vhd", None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, DyskError::LeaseMismatch(_)));
    assert_eq!(store.blob_count(), 1);

    let outcome = harness
        .client
        .delete("dysks", "gone.vhd", created.lease_id.as_deref(), false)
        .await?;
    assert!(outcome.is_clean());
    assert_eq!(store.blob_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_channel_opened_once_per_operation() -> Result<()> {
    let harness = TestHarness::new();
    harness
        .client
        .mount(&MountRequest {
            device_name: Some("once".to_string()),
            auto_create: true,
            size_gb: 1,
            ..Default::default()
        })
        .await?;
    harness.client.list()?;
    harness.client.unmount("once", true).await?;
    assert_eq!(harness.manager.opened(), 3);
    Ok(())
}

const HUGE_SECTORS_RESPONSE: &str = "OK\nRW\nhuge\n18446744073709551615\nacct\nkey\n/dysks/huge\nhost\n10.0.0.4\nlease\n252\n0\n0\n";

#[test]
fn test_get_with_huge_sector_count_is_decode_error() {
    let client = CannedDeviceManager::new("huge", HUGE_SECTORS_RESPONSE).client();

    let err = client.get("huge").unwrap_err();
    assert!(matches!(err, DyskError::Decode(_)), "got {:?}", err);
    assert_eq!(err.exit_code(), 5);

    let err = client.list().unwrap_err();
    assert!(matches!(err, DyskError::Decode(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_oversized_create_and_mount_are_rejected() {
    let harness = TestHarness::new();

    for size_gb in [size::MAX_SIZE_GB + 1, 1 << 34, u64::MAX] {
        let err = harness
            .client
            .create(&CreateRequest {
                name: Some("big".to_string()),
                size_gb,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DyskError::Validation(_)), "got {:?}", err);
    }

    let err = harness
        .client
        .mount(&MountRequest {
            device_name: Some("big".to_string()),
            auto_create: true,
            size_gb: 1 << 34,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DyskError::Validation(_)), "got {:?}", err);
    assert_eq!(err.exit_code(), 2);

    assert_eq!(harness.store().blob_count(), 0);
    assert!(harness.manager.requests_for(Command::Mount).is_empty());
}

#[tokio::test]
async fn test_mount_file_size_must_match_blob() -> Result<()> {
    let harness = TestHarness::new();
    harness
        .client
        .create(&CreateRequest {
            name: Some("raw3".to_string()),
            size_gb: 3,
            vhd: false,
            ..Default::default()
        })
        .await?;

    let json = br#"{
        "Type": "RW",
        "Name": "sized",
        "AccountName": "",
        "AccountKey": "",
        "Path": "/dysks/raw3",
        "LeaseId": "",
        "Vhd": false,
        "SizeGB": 5
    }"#;
    let record = DeviceRecord::from_json(json)?;

    let err = harness
        .client
        .mount_record(
            record,
            LeaseOptions {
                auto_lease: true,
                break_lease: false,
            },
        )
        .await
        .unwrap_err();
    match err {
        DyskError::Validation(message) => {
            assert!(message.starts_with("Invalid size."), "{}", message);
            assert!(message.contains("5GB"), "{}", message);
        }
        other => panic!("Expected validation error, got {:?}", other),
    }

    // Rejected before the lease is taken
    let store = harness.store();
    assert_eq!(store.stats().acquire_calls, 0);
    assert!(harness.manager.requests_for(Command::Mount).is_empty());

    // A matching size mounts
    let mut record = DeviceRecord::new(AccessMode::ReadWrite, "sized", "/dysks/raw3", false);
    record.size_gb = 3;
    let mounted = harness
        .client
        .mount_record(
            record,
            LeaseOptions {
                auto_lease: true,
                break_lease: false,
            },
        )
        .await?;
    assert_eq!(mounted.size_gb, 3);
    Ok(())
}

#[tokio::test]
async fn test_failed_mount_releases_acquired_lease() -> Result<()> {
    let harness = TestHarness::new();
    let created = harness
        .client
        .create(&CreateRequest {
            name: Some("orphan".to_string()),
            size_gb: 1,
            ..Default::default()
        })
        .await?;

    let mut record = DeviceRecord::new(AccessMode::ReadWrite, "orphan", created.blob.path(), true);
    record.host = "unknown.example".to_string();

    let err = harness
        .client
        .mount_record(
            record,
            LeaseOptions {
                auto_lease: true,
                break_lease: false,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Failed to lookup ip for host:unknown.example");

    let store = harness.store();
    assert_eq!(store.stats().acquire_calls, 1);
    assert_eq!(store.stats().break_calls, 1);
    assert_eq!(store.lease_state(&created.blob), Some(LeaseState::Broken));
    assert!(harness.manager.requests_for(Command::Mount).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_failed_mount_keeps_given_lease() -> Result<()> {
    let harness = TestHarness::new();
    let created = harness
        .client
        .create(&CreateRequest {
            name: Some("held".to_string()),
            size_gb: 1,
            lease: true,
            ..Default::default()
        })
        .await?;

    let mut record = DeviceRecord::new(AccessMode::ReadWrite, "held", created.blob.path(), true);
    record.lease_id = created.lease_id.clone().unwrap_or_default();
    record.host = "unknown.example".to_string();

    harness
        .client
        .mount_record(record, LeaseOptions::default())
        .await
        .unwrap_err();

    let store = harness.store();
    assert_eq!(store.stats().break_calls, 0);
    assert_eq!(store.lease_state(&created.blob), Some(LeaseState::Leased));
    Ok(())
}
