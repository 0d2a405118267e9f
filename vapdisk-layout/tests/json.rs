#![allow(missing_docs)]

use std::path::PathBuf;

use log as _;
use serde as _;
use tempfile::TempDir;
use test_log::test;
use toml as _;
use types::{BootloaderKind, StorageFormat};
use vapdisk_layout::{DiskConfig, MountPoint, PartitionSize};

#[test]
fn test_json_full() {
    let json = r#"
        {
            "path": "/exports/appliance.qcow2",
            "size-mb": 8192,
            "bootable": true,
            "active-partition": 2,
            "bootloader": "grub",
            "format": "qcow2",
            "partitions": [
                {
                    "sequence": 1,
                    "size": { "mb": 512 },
                    "label": "BOOT",
                    "mnt": "/boot",
                    "fs": "ext2"
                },
                {
                    "sequence": 2,
                    "size": { "percent": 50 },
                    "label": "SLASH",
                    "mnt": "/",
                    "fs": "ext4"
                },
                {
                    "sequence": 3,
                    "size": "remaining",
                    "label": "SWAP",
                    "mnt": "swap",
                    "type": "82"
                }
            ]
        }
        "#;

    let cfg = DiskConfig::from_json_str(json).unwrap();

    assert_eq!(cfg.bootloader, BootloaderKind::Grub);
    assert_eq!(cfg.format, StorageFormat::Qcow2);
    assert_eq!(cfg.active_partition, 2);
    assert_eq!(cfg.partitions.len(), 3);

    assert_eq!(
        cfg.partitions[0].mnt,
        Some(MountPoint::Path(PathBuf::from("/boot")))
    );
    assert_eq!(cfg.partitions[1].size, PartitionSize::Percent(50));
    assert!(cfg.partitions[2].is_swap());
    assert_eq!(cfg.partitions[2].fs, None);

    assert_eq!(cfg.root_partition().map(|(idx, _)| idx), Some(1));
    cfg.validate().unwrap();
}

#[test]
fn test_json_from_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("disk.json");

    std::fs::write(&path, r#"{ "path": "/tmp/a.raw", "size-mb": 10 }"#).unwrap();

    let cfg = DiskConfig::from_path(&path).unwrap();
    assert_eq!(cfg.size_mb, 10);
}

#[test]
fn test_json_invalid_type_code() {
    let json = r#"
        {
            "path": "/tmp/a.raw",
            "size-mb": 10,
            "partitions": [
                { "sequence": 1, "size": "remaining", "mnt": "/", "type": "zz" }
            ]
        }
        "#;

    DiskConfig::from_json_str(json).unwrap_err();
}
