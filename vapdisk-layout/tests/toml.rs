#![allow(missing_docs)]

use std::path::PathBuf;

use log as _;
use serde as _;
use serde_json as _;
use test_log::test;
use types::{BootloaderKind, StorageFormat};
use vapdisk_layout::{DiskConfig, MountPoint, PartitionSize, LINUX_PARTITION_TYPE};

#[test]
fn test_minimal_disk() {
    let cfg = DiskConfig::from_toml_str(
        r#"
        path = "/tmp/app.raw"
        size-mb = 1024
        "#,
    )
    .unwrap();

    assert_eq!(cfg.path, PathBuf::from("/tmp/app.raw"));
    assert_eq!(cfg.size_mb, 1024);
    assert!(!cfg.bootable);
    assert_eq!(cfg.active_partition, 1);
    assert_eq!(cfg.bootloader, BootloaderKind::None);
    assert_eq!(cfg.format, StorageFormat::Raw);
    assert!(cfg.partitions.is_empty());
    assert!(cfg.fdisk_script.is_none());
}

#[test]
fn test_root_and_swap() {
    let cfg = DiskConfig::from_toml_str(
        r#"
        name = "Test"
        path = "/var/lib/appliances/app.qcow2"
        size-mb = 5120
        bootable = true
        bootloader = "grub2"
        format = "qcow2"

        [[partitions]]
        sequence = 1
        size = { mb = 3045 }
        label = "SLASH"
        mnt = "/"
        fs = "ext4"
        fs-args = ["-O", "^has_journal"]

        [[partitions]]
        sequence = 2
        size = "remaining"
        label = "SWAP"
        mnt = "SWAP"
        fs = "swap"
        type = "0x82"
        "#,
    )
    .unwrap();

    assert_eq!(cfg.name.as_deref(), Some("Test"));
    assert_eq!(cfg.bootloader, BootloaderKind::Grub2);
    assert_eq!(cfg.format, StorageFormat::Qcow2);
    assert_eq!(cfg.partitions.len(), 2);

    let root = &cfg.partitions[0];
    assert_eq!(root.size, PartitionSize::Megabytes(3045));
    assert_eq!(root.mnt, Some(MountPoint::Path(PathBuf::from("/"))));
    assert_eq!(root.type_code, LINUX_PARTITION_TYPE);
    assert_eq!(root.fs_args, vec!["-O", "^has_journal"]);
    assert!(root.is_root());
    assert!(!root.is_swap());

    let swap = &cfg.partitions[1];
    assert_eq!(swap.size, PartitionSize::Remaining);
    assert_eq!(swap.mnt, Some(MountPoint::Swap));
    assert_eq!(swap.type_code, 0x82);
    assert!(swap.is_swap());
    assert_eq!(swap.mount_path(), None);

    assert_eq!(cfg.root_partition().map(|(idx, _)| idx), Some(0));
    cfg.validate().unwrap();
}

#[test]
fn test_percent_and_integer_type() {
    let cfg = DiskConfig::from_toml_str(
        r#"
        path = "/tmp/app.raw"
        size-mb = 2048

        [[partitions]]
        sequence = 1
        size = { percent = 25 }
        mnt = "/"
        fs = "ext4"
        type = 131
        "#,
    )
    .unwrap();

    let part = &cfg.partitions[0];
    assert_eq!(part.size, PartitionSize::Percent(25));
    assert_eq!(part.type_code, 0x83);
}

#[test]
fn test_relative_mount_point() {
    DiskConfig::from_toml_str(
        r#"
        path = "/tmp/app.raw"
        size-mb = 2048

        [[partitions]]
        sequence = 1
        size = "remaining"
        mnt = "boot"
        "#,
    )
    .unwrap_err();
}

#[test]
fn test_unknown_field() {
    DiskConfig::from_toml_str(
        r#"
        path = "/tmp/app.raw"
        size-mb = 2048
        hdd-size-gb = 2
        "#,
    )
    .unwrap_err();
}

#[test]
fn test_from_path() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("disk.toml");

    std::fs::write(
        &path,
        r#"
        path = "/tmp/app.vmdk"
        size-mb = 4096
        format = "vmdk"
        bootloader = "extlinux"
        "#,
    )
    .unwrap();

    let cfg = DiskConfig::from_path(&path).unwrap();
    assert_eq!(cfg.format, StorageFormat::Vmdk);
    assert_eq!(cfg.bootloader, BootloaderKind::Extlinux);
}
