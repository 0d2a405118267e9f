#![allow(missing_docs)]

use vapdisk_fdisk::{literal_script, Extent, FdiskOp, FdiskScript, Placement};
use layout::DiskConfig;
use log as _;
use test_log::test;
use types as _;

fn config(partitions: &str) -> DiskConfig {
    DiskConfig::from_toml_str(&format!(
        r#"
        path = "/tmp/disk.qcow2"
        size-mb = 5120
        bootable = true
        {partitions}
        "#
    ))
    .unwrap()
}

#[test]
fn test_root_and_swap_scenario() {
    let cfg = config(
        r#"
        [[partitions]]
        sequence = 1
        size = { mb = 3045 }
        label = "SLASH"
        mnt = "/"
        fs = "ext4"

        [[partitions]]
        sequence = 2
        size = "remaining"
        mnt = "swap"
        type = "82"
        "#,
    );

    let script = FdiskScript::from_config(&cfg).unwrap();

    assert_eq!(
        script.placements(),
        &[Placement::Primary(1), Placement::Primary(2)]
    );
    assert_eq!(
        script.render(),
        "o\nn\np\n1\n\n+3045M\nt\n83\nn\np\n2\n\n\nt\n2\n82\na\n1\nw\n"
    );
}

#[test]
fn test_four_partitions_all_primary() {
    let cfg = config(
        r#"
        [[partitions]]
        sequence = 1
        size = { mb = 512 }
        mnt = "/"

        [[partitions]]
        sequence = 2
        size = { mb = 512 }
        mnt = "/var"

        [[partitions]]
        sequence = 3
        size = { mb = 512 }
        mnt = "/home"

        [[partitions]]
        sequence = 4
        size = "remaining"
        mnt = "/srv"
        "#,
    );

    let script = FdiskScript::from_config(&cfg).unwrap();

    assert_eq!(
        script.placements(),
        &[
            Placement::Primary(1),
            Placement::Primary(2),
            Placement::Primary(3),
            Placement::Primary(4),
        ]
    );
    assert!(
        script.render().contains("n\np\n\n\nt\n4\n83\n"),
        "Fourth primary should take the last free slot"
    );
}

#[test]
fn test_extended_with_logical_drives() {
    let cfg = config(
        r#"
        [[partitions]]
        sequence = 1
        size = { mb = 1024 }
        mnt = "/"

        [[partitions]]
        sequence = 2
        size = { mb = 256 }
        mnt = "/boot"

        [[partitions]]
        sequence = 3
        size = { mb = 512 }
        mnt = "swap"

        [[partitions]]
        sequence = 4
        size = "remaining"

        [[partitions]]
        sequence = 5
        size = { mb = 1024 }
        mnt = "/var"

        [[partitions]]
        sequence = 6
        size = { percent = 10 }
        mnt = "/home"
        "#,
    );

    // Only the last partition may use the remaining space
    FdiskScript::from_config(&cfg).unwrap_err();
}

#[test]
fn test_extended_fixed_size() {
    let cfg = config(
        r#"
        [[partitions]]
        sequence = 1
        size = { mb = 1024 }
        mnt = "/"

        [[partitions]]
        sequence = 2
        size = { mb = 256 }
        mnt = "/boot"

        [[partitions]]
        sequence = 3
        size = { mb = 512 }
        mnt = "swap"

        [[partitions]]
        sequence = 4
        size = { mb = 3000 }

        [[partitions]]
        sequence = 5
        size = { mb = 1024 }
        mnt = "/var"

        [[partitions]]
        sequence = 6
        size = { percent = 10 }
        mnt = "/home"
        "#,
    );

    let script = FdiskScript::from_config(&cfg).unwrap();

    assert_eq!(
        script.placements(),
        &[
            Placement::Primary(1),
            Placement::Primary(2),
            Placement::Primary(3),
            Placement::Extended,
            Placement::Logical(5),
            Placement::Logical(6),
        ]
    );

    assert_eq!(
        script.ops()[7],
        FdiskOp::Create {
            placement: Placement::Extended,
            extent: Extent::Megabytes(3000),
        }
    );

    // The extended container keeps the type fdisk gives it
    assert_eq!(
        script.ops()[8],
        FdiskOp::Create {
            placement: Placement::Logical(5),
            extent: Extent::Megabytes(1024),
        }
    );

    assert_eq!(
        script.ops()[10],
        FdiskOp::Create {
            placement: Placement::Logical(6),
            extent: Extent::Megabytes(510),
        }
    );

    assert_eq!(
        script.render(),
        concat!(
            "o\n",
            "n\np\n1\n\n+1024M\nt\n83\n",
            "n\np\n2\n\n+256M\nt\n2\n83\n",
            "n\np\n3\n\n+512M\nt\n3\n83\n",
            "n\ne\n\n+3000M\n",
            "n\n\n+1024M\nt\n5\n83\n",
            "n\n\n+510M\nt\n6\n83\n",
            "a\n1\n",
            "w\n",
        )
    );
}

#[test]
fn test_logical_drives_overflow_extended() {
    let cfg = config(
        r#"
        [[partitions]]
        sequence = 1
        size = { mb = 1024 }
        mnt = "/"

        [[partitions]]
        sequence = 2
        size = { mb = 256 }

        [[partitions]]
        sequence = 3
        size = { mb = 256 }

        [[partitions]]
        sequence = 4
        size = { mb = 1000 }

        [[partitions]]
        sequence = 5
        size = { mb = 2000 }
        "#,
    );

    FdiskScript::from_config(&cfg).unwrap_err();
}

#[test]
fn test_remaining_logical_drive() {
    let cfg = config(
        r#"
        [[partitions]]
        sequence = 1
        size = { mb = 1024 }
        mnt = "/"

        [[partitions]]
        sequence = 2
        size = { mb = 256 }

        [[partitions]]
        sequence = 3
        size = { mb = 256 }

        [[partitions]]
        sequence = 4
        size = { mb = 3000 }

        [[partitions]]
        sequence = 5
        size = "remaining"
        "#,
    );

    let script = FdiskScript::from_config(&cfg).unwrap();

    assert_eq!(
        script.ops()[8],
        FdiskOp::Create {
            placement: Placement::Logical(5),
            extent: Extent::Remaining,
        }
    );
}

#[test]
fn test_not_bootable() {
    let cfg = DiskConfig::from_toml_str(
        r#"
        path = "/tmp/disk.raw"
        size-mb = 1024

        [[partitions]]
        sequence = 1
        size = "remaining"
        mnt = "/"
        "#,
    )
    .unwrap();

    let script = FdiskScript::from_config(&cfg).unwrap();

    assert_eq!(script.render(), "o\nn\np\n1\n\n\nt\n83\nw\n");
}

#[test]
fn test_sequence_gap() {
    let cfg = config(
        r#"
        [[partitions]]
        sequence = 1
        size = { mb = 1024 }
        mnt = "/"

        [[partitions]]
        sequence = 3
        size = "remaining"
        "#,
    );

    FdiskScript::from_config(&cfg).unwrap_err();
}

#[test]
fn test_literal_script_from_config() {
    let cfg = DiskConfig::from_toml_str(
        r#"
        path = "/tmp/disk.raw"
        size-mb = 1024
        fdisk-script = 'o\nn\np\n1\n\n\nw'
        "#,
    )
    .unwrap();

    let script = cfg.fdisk_script.as_deref().unwrap();
    assert_eq!(literal_script(script), "o\nn\np\n1\n\n\nw\n");
}
