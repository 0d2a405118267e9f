//! Bootloader installation

use std::path::{Path, PathBuf};

use log::{debug, error, info};
use types::{BootloaderKind, VapdiskError};

use crate::{command::Command, device, exec::Executor};

const GRUB_NOT_FOUND_MARKER: &str = "File not found";
const GRUB2_DEVICE_MAP: &str = "boot/grub/device.map";
const GRUB2_CONFIG: &str = "boot/grub/grub.cfg";
const EXTLINUX_MBR_LOCATIONS: [&str; 2] = ["/usr/lib/EXTLINUX/mbr.bin", "/usr/lib/extlinux/mbr.bin"];
const EXTLINUX_MBR_SIZE: &str = "bs=440";

/// What the bootloader gets installed onto
#[derive(Clone, Copy, Debug)]
pub struct BootTarget<'a> {
    /// Working root, where the image root filesystem is mounted
    pub root: &'a Path,

    /// Path of the raw disk image
    pub image: &'a Path,

    /// Loop device the image is bound to
    pub loop_device: &'a Path,

    /// Device node of the first mounted partition
    pub boot_partition: &'a Path,
}

/// Commands undoing the setup steps, run in reverse order when dropped
struct Teardown<'a> {
    exec: &'a dyn Executor,
    commands: Vec<Command>,
}

impl<'a> Teardown<'a> {
    fn new(exec: &'a dyn Executor) -> Self {
        Self {
            exec,
            commands: Vec::new(),
        }
    }

    fn push(&mut self, cmd: Command) {
        self.commands.push(cmd);
    }
}

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        while let Some(cmd) = self.commands.pop() {
            debug!("Running teardown command `{cmd}`");

            if let Err(e) = cmd.run(self.exec) {
                error!("Teardown command failed: {e}");
            }
        }
    }
}

fn in_root(root: &Path, path: &str) -> PathBuf {
    root.join(path.trim_start_matches('/'))
}

fn chroot(root: &Path, program: &str) -> Command {
    Command::new("chroot").path(root).arg(program)
}

fn install_step(exec: &dyn Executor, cmd: &Command, reason: &str) -> Result<String, VapdiskError> {
    cmd.run(exec).map_err(|e| match e {
        VapdiskError::CommandExecution(err) => VapdiskError::BootloaderInstall {
            reason: reason.to_owned(),
            output: err.output,
        },
        other => other,
    })
}

fn find_in_chroot(exec: &dyn Executor, root: &Path, program: &str) -> Result<String, VapdiskError> {
    let path = chroot(root, "which")
        .arg(program)
        .run(exec)
        .map_err(|_e| VapdiskError::BootloaderNotFound(program.to_owned()))?;

    let path = path.trim();
    if path.is_empty() {
        return Err(VapdiskError::BootloaderNotFound(program.to_owned()));
    }

    debug!("Found {program} at {path} in {}", root.display());

    Ok(path.to_owned())
}

fn mount_pseudo_filesystems(
    exec: &dyn Executor,
    root: &Path,
    teardown: &mut Teardown<'_>,
) -> Result<(), VapdiskError> {
    let dev = in_root(root, "dev");
    Command::new("mount")
        .args(["--bind", "/dev"])
        .path(&dev)
        .run(exec)?;
    teardown.push(Command::new("umount").arg("-l").path(&dev));

    chroot(root, "mount")
        .args(["-t", "proc", "none", "/proc"])
        .run(exec)?;
    teardown.push(Command::new("umount").arg("-l").path(&in_root(root, "proc")));

    Ok(())
}

fn install_grub(exec: &dyn Executor, target: &BootTarget<'_>) -> Result<(), VapdiskError> {
    let grub = find_in_chroot(exec, target.root, "grub")?;

    let shell = format!(
        "device (hd0) {}\nroot (hd0,0)\nsetup (hd0)\n",
        target.image.display()
    );

    let out = install_step(
        exec,
        &Command::new(&in_root(target.root, &grub).display().to_string()).stdin(&shell),
        "GRUB shell failed",
    )?;

    if out.contains(GRUB_NOT_FOUND_MARKER) {
        return Err(VapdiskError::BootloaderInstall {
            reason: "GRUB couldn't find its stage files".to_owned(),
            output: out.trim_end().to_owned(),
        });
    }

    Ok(())
}

/// Removes every line mentioning the loop devices from a GRUB 2
/// configuration
#[must_use]
pub fn strip_loop_lines(config: &str) -> String {
    config
        .lines()
        .filter(|l| !l.contains("loop"))
        .fold(String::with_capacity(config.len()), |mut acc, l| {
            acc.push_str(l);
            acc.push('\n');
            acc
        })
}

fn install_grub2(exec: &dyn Executor, target: &BootTarget<'_>) -> Result<(), VapdiskError> {
    let mut teardown = Teardown::new(exec);

    let throwaway = device::bind(exec, target.boot_partition)?;
    teardown.push(Command::new("losetup").arg("-d").path(&throwaway));

    let mnt = Command::new("mktemp")
        .args(["-d", "--suffix", "_vapdisk_boot"])
        .run(exec)?;
    let mnt = PathBuf::from(mnt.trim());
    // Fails while anything is still mounted there
    teardown.push(Command::new("rmdir").path(&mnt));

    Command::new("mount")
        .path(&throwaway)
        .path(&mnt)
        .run(exec)?;
    teardown.push(Command::new("umount").arg("-l").path(&mnt));

    debug!(
        "Boot partition {} mounted on {} through {}",
        target.boot_partition.display(),
        mnt.display(),
        throwaway.display()
    );

    let map_path = in_root(&mnt, GRUB2_DEVICE_MAP);
    Command::new("mkdir")
        .arg("-p")
        .path(&in_root(&mnt, "boot/grub"))
        .run(exec)?;

    let device_map = format!(
        "(hd0) {}\n(hd0,1) {}\n",
        target.loop_device.display(),
        throwaway.display()
    );
    Command::new("tee")
        .path(&map_path)
        .stdin(&device_map)
        .run(exec)?;

    mount_pseudo_filesystems(exec, &mnt, &mut teardown)?;

    install_step(
        exec,
        &chroot(&mnt, "grub-install")
            .arg("--no-floppy")
            .arg(&format!("--grub-mkdevicemap=/{GRUB2_DEVICE_MAP}"))
            .path(target.loop_device),
        "grub-install failed",
    )?;

    install_step(exec, &chroot(&mnt, "update-grub"), "update-grub failed")?;

    Command::new("rm").arg("-f").path(&map_path).run(exec)?;

    let cfg_path = in_root(&mnt, GRUB2_CONFIG);
    let cfg = Command::new("cat").path(&cfg_path).run(exec)?;
    Command::new("tee")
        .path(&cfg_path)
        .stdin(&strip_loop_lines(&cfg))
        .run(exec)?;

    Ok(())
}

fn install_extlinux(exec: &dyn Executor, target: &BootTarget<'_>) -> Result<(), VapdiskError> {
    find_in_chroot(exec, target.root, "extlinux")?;

    let mbr = EXTLINUX_MBR_LOCATIONS
        .into_iter()
        .find(|loc| {
            Command::new("test")
                .arg("-e")
                .path(&in_root(target.root, loc))
                .run(exec)
                .is_ok()
        })
        .ok_or_else(|| VapdiskError::BootloaderNotFound("extlinux mbr.bin".to_owned()))?;

    debug!("Using EXTLINUX MBR stub {mbr}");

    let mut teardown = Teardown::new(exec);
    mount_pseudo_filesystems(exec, target.root, &mut teardown)?;

    install_step(
        exec,
        &chroot(target.root, "dd")
            .arg(&format!("if={mbr}"))
            .arg(&format!("of={}", target.loop_device.display()))
            .args([EXTLINUX_MBR_SIZE, "count=1", "conv=notrunc"]),
        "Writing the EXTLINUX MBR failed",
    )?;

    install_step(
        exec,
        &chroot(target.root, "extlinux").args(["-i", "/boot/extlinux"]),
        "extlinux failed",
    )?;

    chroot(target.root, "extlinux-update")
        .tolerate_failure()
        .run(exec)?;

    Ok(())
}

/// Installs a bootloader onto the image
///
/// # Errors
///
/// If the bootloader can't be found in the image, or if its installation
/// fails
pub fn install(
    exec: &dyn Executor,
    kind: BootloaderKind,
    target: &BootTarget<'_>,
) -> Result<(), VapdiskError> {
    match kind {
        BootloaderKind::None => {
            debug!("No bootloader to install");
            return Ok(());
        }
        BootloaderKind::Grub => install_grub(exec, target)?,
        BootloaderKind::Grub2 => install_grub2(exec, target)?,
        BootloaderKind::Extlinux => install_extlinux(exec, target)?,
    }

    info!("Installed {kind} on {}", target.image.display());

    Ok(())
}
