//! Loop device binding and partition mappers

use core::time::Duration;
use std::{
    path::{Path, PathBuf},
    thread,
};

use log::{debug, info, trace};
use types::VapdiskError;

use crate::{
    command::Command,
    exec::Executor,
    registry::{Mapper, MountRegistry},
};

/// Time given to the device mapper to create the partition nodes
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);

const PROC_MOUNTS: &str = "/proc/mounts";

/// Tooling used to expose the partitions of a loop device
#[derive(Clone, Debug)]
pub struct DeviceOptions {
    kpartx: String,
    settle: Duration,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            kpartx: "kpartx".to_owned(),
            settle: DEFAULT_SETTLE_DELAY,
        }
    }
}

impl DeviceOptions {
    /// Creates the default options
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses another `kpartx` binary
    #[must_use]
    pub fn kpartx(mut self, kpartx: &str) -> Self {
        kpartx.clone_into(&mut self.kpartx);
        self
    }

    /// Changes the time to wait for the partition nodes to show up
    #[must_use]
    pub fn settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Path to the `kpartx` binary
    #[must_use]
    pub fn kpartx_path(&self) -> &str {
        &self.kpartx
    }
}

/// Binds `image` to the first free loop device and returns its path
///
/// # Errors
///
/// If there's no free loop device, or if it can't be attached
pub fn bind(exec: &dyn Executor, image: &Path) -> Result<PathBuf, VapdiskError> {
    let free = Command::new("losetup")
        .arg("-f")
        .run(exec)
        .map_err(|e| VapdiskError::DeviceBind(e.to_string()))?;

    let free = free.trim();
    if free.is_empty() {
        return Err(VapdiskError::DeviceBind(
            "No free loop device".to_owned(),
        ));
    }

    let dev = PathBuf::from(free);
    Command::new("losetup")
        .path(&dev)
        .path(image)
        .run(exec)
        .map_err(|e| VapdiskError::DeviceBind(e.to_string()))?;

    debug!("Bound {} to {}", image.display(), dev.display());

    Ok(dev)
}

/// Detaches a loop device
///
/// # Errors
///
/// If `losetup` fails
pub fn detach(exec: &dyn Executor, dev: &Path) -> Result<(), VapdiskError> {
    Command::new("losetup").arg("-d").path(dev).run(exec)?;
    debug!("Detached {}", dev.display());

    Ok(())
}

fn unescape_mount_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut rest = field;

    while let Some(pos) = rest.find('\\') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + 1..];

        let decoded = tail
            .get(..3)
            .and_then(|digits| u8::from_str_radix(digits, 8).ok());

        if let Some(byte) = decoded {
            out.push(char::from(byte));
            rest = &tail[3..];
        } else {
            out.push('\\');
            rest = tail;
        }
    }

    out.push_str(rest);
    out
}

/// Reads the mount table of the host running the commands
///
/// # Errors
///
/// If `/proc/mounts` can't be read
pub fn mount_table(exec: &dyn Executor) -> Result<String, VapdiskError> {
    Command::new("cat").arg(PROC_MOUNTS).run(exec)
}

/// Checks in a `/proc/mounts` listing if `node` is mounted on `target`
#[must_use]
pub fn is_mounted(mounts: &str, node: &Path, target: &Path) -> bool {
    mounts.lines().any(|line| {
        let mut fields = line.split_whitespace();

        let (Some(source), Some(mnt)) = (fields.next(), fields.next()) else {
            return false;
        };

        Path::new(&unescape_mount_field(source)) == node
            && Path::new(&unescape_mount_field(mnt)) == target
    })
}

/// Maps a mount point of the image filesystem to its location under `root`
#[must_use]
pub fn host_mount_point(root: &Path, mnt: &Path) -> PathBuf {
    match mnt.strip_prefix("/") {
        Ok(rel) if rel.as_os_str().is_empty() => root.to_path_buf(),
        Ok(rel) => root.join(rel),
        Err(_) => root.join(mnt),
    }
}

fn partition_number(loop_name: &str, node: &Path) -> Option<u32> {
    node.file_name()?
        .to_str()?
        .strip_prefix(loop_name)?
        .strip_prefix('p')?
        .parse()
        .ok()
}

/// A loop device bound to the disk image, and its mounted partitions
#[derive(Debug)]
pub struct LoopDevice {
    path: PathBuf,
    mappers: MountRegistry,
}

impl LoopDevice {
    /// Binds `image` to the first free loop device
    ///
    /// # Errors
    ///
    /// If there's no free loop device, or if it can't be attached
    pub fn bind(exec: &dyn Executor, image: &Path) -> Result<Self, VapdiskError> {
        Ok(Self {
            path: bind(exec, image)?,
            mappers: MountRegistry::new(),
        })
    }

    /// Path of the loop device
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mounted partitions, in mount order
    #[must_use]
    pub fn mappers(&self) -> &MountRegistry {
        &self.mappers
    }

    /// Creates the device mapper nodes for the partitions of the loop device
    /// and returns them, ordered by partition number
    ///
    /// # Errors
    ///
    /// If `kpartx` fails, or if no node shows up
    pub fn materialize_mappers(
        &self,
        exec: &dyn Executor,
        opts: &DeviceOptions,
    ) -> Result<Vec<PathBuf>, VapdiskError> {
        Command::new(&opts.kpartx)
            .arg("-a")
            .path(&self.path)
            .run(exec)?;

        if !opts.settle.is_zero() {
            trace!("Waiting {:?} for the mappers to settle", opts.settle);
            thread::sleep(opts.settle);
        }

        let loop_name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| VapdiskError::NoMappersFound(self.path.display().to_string()))?;

        let out = Command::new("find")
            .args(["/dev", "-name"])
            .arg(&format!("{loop_name}p[0-9]*"))
            .run(exec)?;

        let mut nodes: Vec<(u32, PathBuf)> = out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .filter_map(|l| {
                let node = PathBuf::from(l);
                partition_number(loop_name, &node).map(|num| (num, node))
            })
            .collect();

        if nodes.is_empty() {
            return Err(VapdiskError::NoMappersFound(
                self.path.display().to_string(),
            ));
        }

        nodes.sort();

        debug!(
            "Found {} partition nodes for {}",
            nodes.len(),
            self.path.display()
        );

        Ok(nodes.into_iter().map(|(_, node)| node).collect())
    }

    /// Mounts a partition node on `mnt`, relative to `root`, and records it.
    ///
    /// The mount is skipped if the node is already mounted there.
    ///
    /// # Errors
    ///
    /// If the mount point can't be created or the partition can't be mounted
    pub fn add_mapper(
        &mut self,
        exec: &dyn Executor,
        root: &Path,
        node: &Path,
        mnt: &Path,
    ) -> Result<(), VapdiskError> {
        let target = host_mount_point(root, mnt);

        Command::new("mkdir").arg("-p").path(&target).run(exec)?;

        let mounts = mount_table(exec)?;
        if is_mounted(&mounts, node, &target) {
            debug!(
                "{} already mounted on {}",
                node.display(),
                target.display()
            );
        } else {
            Command::new("mount").path(node).path(&target).run(exec)?;
            info!("Mounted {} on {}", node.display(), target.display());
        }

        self.mappers.push(Mapper::new(node, &target));

        Ok(())
    }

    pub(crate) fn pop_mapper(&mut self) -> Option<Mapper> {
        self.mappers.pop()
    }

    /// Removes the device mapper nodes of the loop device
    ///
    /// # Errors
    ///
    /// If `kpartx` fails
    pub fn remove_mappers(
        &self,
        exec: &dyn Executor,
        opts: &DeviceOptions,
    ) -> Result<(), VapdiskError> {
        Command::new(&opts.kpartx)
            .arg("-d")
            .path(&self.path)
            .run(exec)?;

        Ok(())
    }

    /// Detaches the loop device from the image
    ///
    /// # Errors
    ///
    /// If `losetup` fails
    pub fn detach(&self, exec: &dyn Executor) -> Result<(), VapdiskError> {
        detach(exec, &self.path)
    }
}
