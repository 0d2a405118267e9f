#![allow(missing_docs)]

use std::{path::Path, sync::Mutex};

use anyhow as _;
use clap as _;
use env_logger as _;
use fdisk as _;
use layout as _;
use log as _;
use signal_hook as _;
use tempfile as _;
use test_log::test;
use types::{BootloaderKind, CommandError, VapdiskError};
use vapdisk::bootloader::{self, BootTarget};

const BOOT_MNT: &str = "/tmp/tmp.Xk2_vapdisk_boot";

/// Records every command line, answering the ones starting with a known
/// prefix and succeeding silently otherwise
#[derive(Debug, Default)]
struct Recorder {
    log: Mutex<Vec<String>>,
    answers: Vec<(&'static str, Result<&'static str, &'static str>)>,
}

impl Recorder {
    fn answer(mut self, prefix: &'static str, output: &'static str) -> Self {
        self.answers.push((prefix, Ok(output)));
        self
    }

    fn fail(mut self, prefix: &'static str, output: &'static str) -> Self {
        self.answers.push((prefix, Err(output)));
        self
    }

    fn run(&self, command: &str) -> Result<String, CommandError> {
        self.log.lock().unwrap().push(command.to_owned());

        match self.answers.iter().find(|(p, _)| command.starts_with(p)) {
            Some((_, Ok(out))) => Ok((*out).to_owned()),
            Some((_, Err(out))) => Err(CommandError::new(command, Some(1), out)),
            None => Ok(String::new()),
        }
    }

    fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

fn target() -> BootTarget<'static> {
    BootTarget {
        root: Path::new("/tmp/rootfs"),
        image: Path::new("/srv/app.img.raw"),
        loop_device: Path::new("/dev/loop0"),
        boot_partition: Path::new("/dev/mapper/loop0p1"),
    }
}

#[test]
fn test_grub_missing_stage_files() {
    let host = Recorder::default()
        .answer("chroot /tmp/rootfs which grub", "/usr/sbin/grub\n")
        .answer("printf", "grub> setup (hd0)\nError 15: File not found\n");
    let exec = |c: &str| host.run(c);

    match bootloader::install(&exec, BootloaderKind::Grub, &target()) {
        Err(VapdiskError::BootloaderInstall { output, .. }) => {
            assert!(output.contains("Error 15"));
        }
        other => panic!("Unexpected result {other:?}"),
    }

    assert_eq!(
        host.commands(),
        [
            "chroot /tmp/rootfs which grub",
            "printf '%s' 'device (hd0) /srv/app.img.raw\nroot (hd0,0)\nsetup (hd0)\n' | /tmp/rootfs/usr/sbin/grub",
        ]
    );
}

#[test]
fn test_grub_not_installed() {
    let host = Recorder::default().fail("chroot /tmp/rootfs which grub", "");
    let exec = |c: &str| host.run(c);

    assert!(matches!(
        bootloader::install(&exec, BootloaderKind::Grub, &target()),
        Err(VapdiskError::BootloaderNotFound(name)) if name == "grub"
    ));
    assert_eq!(host.commands().len(), 1);
}

#[test]
fn test_grub2() {
    let host = Recorder::default()
        .answer("losetup -f", "/dev/loop1\n")
        .answer("mktemp", "/tmp/tmp.Xk2_vapdisk_boot\n")
        .answer(
            "cat /tmp/tmp.Xk2_vapdisk_boot/boot/grub/grub.cfg",
            "set root='hd0,msdos1'\nlinux /vmlinuz root=/dev/mapper/loop0p1 ro\ninitrd /initrd.img\n",
        );
    let exec = |c: &str| host.run(c);

    bootloader::install(&exec, BootloaderKind::Grub2, &target()).unwrap();

    let commands = host.commands();
    assert_eq!(
        commands,
        [
            "losetup -f".to_owned(),
            "losetup /dev/loop1 /dev/mapper/loop0p1".to_owned(),
            "mktemp -d --suffix _vapdisk_boot".to_owned(),
            format!("mount /dev/loop1 {BOOT_MNT}"),
            format!("mkdir -p {BOOT_MNT}/boot/grub"),
            format!(
                "printf '%s' '(hd0) /dev/loop0\n(hd0,1) /dev/loop1\n' | tee {BOOT_MNT}/boot/grub/device.map"
            ),
            format!("mount --bind /dev {BOOT_MNT}/dev"),
            format!("chroot {BOOT_MNT} mount -t proc none /proc"),
            format!(
                "chroot {BOOT_MNT} grub-install --no-floppy --grub-mkdevicemap=/boot/grub/device.map /dev/loop0"
            ),
            format!("chroot {BOOT_MNT} update-grub"),
            format!("rm -f {BOOT_MNT}/boot/grub/device.map"),
            format!("cat {BOOT_MNT}/boot/grub/grub.cfg"),
            format!(
                "printf '%s' 'set root='\\''hd0,msdos1'\\''\ninitrd /initrd.img\n' | tee {BOOT_MNT}/boot/grub/grub.cfg"
            ),
            format!("umount -l {BOOT_MNT}/proc"),
            format!("umount -l {BOOT_MNT}/dev"),
            format!("umount -l {BOOT_MNT}"),
            format!("rmdir {BOOT_MNT}"),
            "losetup -d /dev/loop1".to_owned(),
        ]
    );
}

#[test]
fn test_grub2_install_failure_tears_down() {
    let host = Recorder::default()
        .answer("losetup -f", "/dev/loop1\n")
        .answer("mktemp", "/tmp/tmp.Xk2_vapdisk_boot\n")
        .fail(
            "chroot /tmp/tmp.Xk2_vapdisk_boot grub-install",
            "grub-install: error: cannot find a device for /boot/grub",
        );
    let exec = |c: &str| host.run(c);

    match bootloader::install(&exec, BootloaderKind::Grub2, &target()) {
        Err(VapdiskError::BootloaderInstall { output, .. }) => {
            assert!(output.contains("cannot find a device"));
        }
        other => panic!("Unexpected result {other:?}"),
    }

    let commands = host.commands();
    assert!(!commands.iter().any(|c| c.contains("update-grub")));
    assert_eq!(
        commands[commands.len() - 5..],
        [
            format!("umount -l {BOOT_MNT}/proc"),
            format!("umount -l {BOOT_MNT}/dev"),
            format!("umount -l {BOOT_MNT}"),
            format!("rmdir {BOOT_MNT}"),
            "losetup -d /dev/loop1".to_owned(),
        ]
    );
}

#[test]
fn test_grub2_keeps_busy_mount_point() {
    let host = Recorder::default()
        .answer("losetup -f", "/dev/loop1\n")
        .answer("mktemp", "/tmp/tmp.Xk2_vapdisk_boot\n")
        .fail("chroot /tmp/tmp.Xk2_vapdisk_boot grub-install", "")
        .fail("umount -l /tmp/tmp.Xk2_vapdisk_boot", "target is busy")
        .fail(
            "rmdir /tmp/tmp.Xk2_vapdisk_boot",
            "rmdir: failed to remove '/tmp/tmp.Xk2_vapdisk_boot': Device or resource busy",
        );
    let exec = |c: &str| host.run(c);

    bootloader::install(&exec, BootloaderKind::Grub2, &target()).unwrap_err();

    let commands = host.commands();
    assert!(
        !commands.iter().any(|c| c.starts_with("rm ")),
        "Recursive removal of a mounted tree: {commands:?}"
    );
    assert_eq!(
        commands[commands.len() - 5..],
        [
            format!("umount -l {BOOT_MNT}/proc"),
            format!("umount -l {BOOT_MNT}/dev"),
            format!("umount -l {BOOT_MNT}"),
            format!("rmdir {BOOT_MNT}"),
            "losetup -d /dev/loop1".to_owned(),
        ]
    );
}

#[test]
fn test_extlinux() {
    let host = Recorder::default()
        .answer("chroot /tmp/rootfs which extlinux", "/usr/bin/extlinux\n")
        .fail("test -e /tmp/rootfs/usr/lib/EXTLINUX/mbr.bin", "")
        .fail("chroot /tmp/rootfs extlinux-update", "command not found");
    let exec = |c: &str| host.run(c);

    bootloader::install(&exec, BootloaderKind::Extlinux, &target()).unwrap();

    assert_eq!(
        host.commands(),
        [
            "chroot /tmp/rootfs which extlinux",
            "test -e /tmp/rootfs/usr/lib/EXTLINUX/mbr.bin",
            "test -e /tmp/rootfs/usr/lib/extlinux/mbr.bin",
            "mount --bind /dev /tmp/rootfs/dev",
            "chroot /tmp/rootfs mount -t proc none /proc",
            "chroot /tmp/rootfs dd if=/usr/lib/extlinux/mbr.bin of=/dev/loop0 bs=440 count=1 conv=notrunc",
            "chroot /tmp/rootfs extlinux -i /boot/extlinux",
            "chroot /tmp/rootfs extlinux-update",
            "umount -l /tmp/rootfs/proc",
            "umount -l /tmp/rootfs/dev",
        ]
    );
}

#[test]
fn test_extlinux_not_installed() {
    let host = Recorder::default().fail("chroot /tmp/rootfs which extlinux", "");
    let exec = |c: &str| host.run(c);

    assert!(matches!(
        bootloader::install(&exec, BootloaderKind::Extlinux, &target()),
        Err(VapdiskError::BootloaderNotFound(_))
    ));
    assert_eq!(host.commands(), ["chroot /tmp/rootfs which extlinux"]);
}

#[test]
fn test_no_bootloader() {
    let host = Recorder::default();
    let exec = |c: &str| host.run(c);

    bootloader::install(&exec, BootloaderKind::None, &target()).unwrap();
    assert!(host.commands().is_empty());
}
