//! Partition formatting and mounting

use std::path::{Path, PathBuf};

use layout::{DiskConfig, Partition};
use log::{debug, info, log_enabled, trace, Level};
use types::VapdiskError;

use crate::{
    command::Command,
    device::{DeviceOptions, LoopDevice},
    exec::Executor,
};

/// What the partitions of the image go through once they show up
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Preparation {
    /// Freshly partitioned, the filesystems need to be created
    Format,

    /// Existing image, the partitions are only mounted
    Attach,
}

fn check_count(cfg: &DiskConfig, nodes: &[PathBuf]) -> Result<(), VapdiskError> {
    if nodes.len() != cfg.partitions.len() {
        return Err(VapdiskError::PartitionCountMismatch {
            declared: cfg.partitions.len(),
            found: nodes.len(),
        });
    }

    Ok(())
}

fn make_filesystem(exec: &dyn Executor, part: &Partition, node: &Path) -> Result<(), VapdiskError> {
    let Some(fs) = &part.fs else {
        return Err(VapdiskError::InvalidPlan(format!(
            "Partition {}: No filesystem type",
            part.sequence
        )));
    };

    let mut cmd = Command::new("mkfs").args(["-t", fs.as_str()]);
    if let Some(label) = &part.label {
        cmd = cmd.args(["-L", label.as_str()]);
    }

    cmd.args(&part.fs_args).path(node).run(exec)?;

    info!(
        "Partition {}: Created {fs} filesystem on {}",
        part.sequence,
        node.display()
    );

    Ok(())
}

fn make_swap(exec: &dyn Executor, part: &Partition, node: &Path) -> Result<(), VapdiskError> {
    let mut cmd = Command::new("mkswap");
    if let Some(label) = &part.label {
        cmd = cmd.args(["-L", label.as_str()]);
    }

    cmd.path(node).run(exec)?;

    info!(
        "Partition {}: Created swap space on {}",
        part.sequence,
        node.display()
    );

    Ok(())
}

fn prepare_partitions(
    exec: &dyn Executor,
    opts: &DeviceOptions,
    cfg: &DiskConfig,
    root: &Path,
    dev: &mut LoopDevice,
    prep: Preparation,
) -> Result<(), VapdiskError> {
    let nodes = dev.materialize_mappers(exec, opts)?;
    check_count(cfg, &nodes)?;

    let (root_idx, root_part) = cfg
        .root_partition()
        .ok_or_else(|| VapdiskError::InvalidPlan("No partition is mounted on /".to_owned()))?;

    let root_node = &nodes[root_idx];
    if prep == Preparation::Format {
        make_filesystem(exec, root_part, root_node)?;
    }
    dev.add_mapper(exec, root, root_node, Path::new("/"))?;

    for (idx, (part, node)) in cfg.partitions.iter().zip(&nodes).enumerate() {
        if idx == root_idx {
            continue;
        }

        if cfg.is_extended(part) {
            debug!("Partition {}: Extended container, skipping", part.sequence);
            continue;
        }

        if part.is_swap() {
            if prep == Preparation::Format {
                make_swap(exec, part, node)?;
            }
            continue;
        }

        if part.fs.is_none() {
            debug!("Partition {}: No filesystem, not mounting", part.sequence);
            continue;
        }

        if prep == Preparation::Format {
            make_filesystem(exec, part, node)?;
        }

        match part.mount_path() {
            Some(mnt) => dev.add_mapper(exec, root, node, mnt)?,
            None => debug!("Partition {}: No mount point", part.sequence),
        }
    }

    Ok(())
}

/// Partitions a fresh image with `script`, then creates the filesystems and
/// mounts them under `root`, root partition first.
///
/// # Errors
///
/// If the partition nodes don't match the configuration, or if any
/// filesystem can't be created or mounted
pub fn format_partitions(
    exec: &dyn Executor,
    opts: &DeviceOptions,
    cfg: &DiskConfig,
    root: &Path,
    dev: &mut LoopDevice,
    script: &str,
) -> Result<(), VapdiskError> {
    if cfg.partitions.is_empty() {
        debug!("No partition declared, nothing to format");
        return Ok(());
    }

    if log_enabled!(Level::Trace) {
        for line in script.lines() {
            trace!("fdisk <- {line:?}");
        }
    }

    // fdisk complains when the kernel can't re-read the table of a loop
    // device, the mappers are created separately anyway.
    Command::new("fdisk")
        .path(dev.path())
        .stdin(script)
        .tolerate_failure()
        .run(exec)?;

    prepare_partitions(exec, opts, cfg, root, dev, Preparation::Format)
}

/// Mounts the partitions of an already populated image under `root`, root
/// partition first.
///
/// # Errors
///
/// If the partition nodes don't match the configuration, or if any
/// partition can't be mounted
pub fn attach_partitions(
    exec: &dyn Executor,
    opts: &DeviceOptions,
    cfg: &DiskConfig,
    root: &Path,
    dev: &mut LoopDevice,
) -> Result<(), VapdiskError> {
    if cfg.partitions.is_empty() {
        debug!("No partition declared, nothing to attach");
        return Ok(());
    }

    prepare_partitions(exec, opts, cfg, root, dev, Preparation::Attach)
}
