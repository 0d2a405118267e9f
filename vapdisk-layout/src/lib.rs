#![doc = include_str!("../README.md")]

use core::fmt;
use std::{
    fs,
    path::{Path, PathBuf},
};

use log::debug;
#[cfg(feature = "schema")]
use schemars::JsonSchema;
use serde::{de, Deserialize};
use types::{BootloaderKind, StorageFormat, VapdiskError};

/// Partition type code of a Linux swap partition
pub const SWAP_PARTITION_TYPE: u8 = 0x82;

/// Partition type code of a regular Linux partition
pub const LINUX_PARTITION_TYPE: u8 = 0x83;

/// Sequence number holding the extended container once the four MBR slots
/// aren't enough
pub const EXTENDED_PARTITION_SEQUENCE: u8 = 4;

/// Highest number of partitions that fit in the MBR without an extended
/// container
pub const MAX_PRIMARY_PARTITIONS: usize = 4;

const SWAP_MOUNT_POINT: &str = "swap";

/// Size request for a partition
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[cfg_attr(feature = "schema", derive(JsonSchema))]
pub enum PartitionSize {
    /// Absolute size in megabytes
    #[serde(rename = "mb")]
    Megabytes(u64),

    /// Share of the whole disk, in percents
    #[serde(rename = "percent")]
    Percent(u8),

    /// Everything left on the disk. Only valid for the last partition.
    #[serde(rename = "remaining")]
    Remaining,
}

impl PartitionSize {
    /// Resolves the size in megabytes against the disk size.
    ///
    /// The percentage is applied to the disk size truncated to a multiple of
    /// 100MB, so the result can be slightly smaller than the exact share.
    /// Returns `None` for [`PartitionSize::Remaining`], which is left for the
    /// partitioning tool to figure out.
    #[must_use]
    pub fn resolve_mb(self, disk_size_mb: u64) -> Option<u64> {
        match self {
            Self::Megabytes(mb) => Some(mb),
            Self::Percent(pct) => Some(disk_size_mb / 100 * u64::from(pct)),
            Self::Remaining => None,
        }
    }
}

/// Where a partition ends up once the image is parsed
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "schema", derive(JsonSchema))]
pub enum MountPoint {
    /// Mounted at this path, relative to the image root filesystem
    Path(PathBuf),

    /// Initialized as swap space, never mounted
    Swap,
}

impl MountPoint {
    /// Is this the root of the image filesystem?
    #[must_use]
    pub fn is_root(&self) -> bool {
        matches!(self, Self::Path(p) if p == Path::new("/"))
    }
}

impl fmt::Display for MountPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(p) => write!(f, "{}", p.display()),
            Self::Swap => f.write_str(SWAP_MOUNT_POINT),
        }
    }
}

fn deserialize_mount_point<'de, D>(deserializer: D) -> Result<Option<MountPoint>, D::Error>
where
    D: de::Deserializer<'de>,
{
    let Some(s) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };

    if s.eq_ignore_ascii_case(SWAP_MOUNT_POINT) {
        return Ok(Some(MountPoint::Swap));
    }

    let path = PathBuf::from(&s);
    if !path.is_absolute() {
        return Err(de::Error::custom(format!(
            "Mount point {s} must be absolute or \"swap\""
        )));
    }

    Ok(Some(MountPoint::Path(path)))
}

fn deserialize_type_code<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: de::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TypeCode {
        Int(u8),
        Str(String),
    }

    match TypeCode::deserialize(deserializer)? {
        TypeCode::Int(v) => Ok(v),
        TypeCode::Str(s) => {
            let digits = s
                .strip_prefix("0x")
                .or_else(|| s.strip_prefix("0X"))
                .unwrap_or(&s);

            u8::from_str_radix(digits, 16).map_err(de::Error::custom)
        }
    }
}

fn default_type_code() -> u8 {
    LINUX_PARTITION_TYPE
}

fn default_active_partition() -> u8 {
    1
}

/// A partition of the disk image
#[derive(Clone, Debug, Deserialize)]
#[cfg_attr(feature = "schema", derive(JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct Partition {
    /// 1-based position in the partition table
    pub sequence: u8,

    /// Requested size
    pub size: PartitionSize,

    /// Filesystem label
    pub label: Option<String>,

    /// Mount point, or swap
    #[serde(default, deserialize_with = "deserialize_mount_point")]
    #[cfg_attr(feature = "schema", schemars(with = "Option<String>"))]
    pub mnt: Option<MountPoint>,

    /// Filesystem type, as understood by `mkfs -t`
    pub fs: Option<String>,

    /// Extra arguments handed over to the filesystem creation tool
    #[serde(rename = "fs-args", default)]
    pub fs_args: Vec<String>,

    /// MBR partition type code
    #[serde(
        rename = "type",
        default = "default_type_code",
        deserialize_with = "deserialize_type_code"
    )]
    #[cfg_attr(feature = "schema", schemars(with = "String"))]
    pub type_code: u8,

    /// Free-form description
    pub description: Option<String>,
}

impl Partition {
    /// Is this partition swap space?
    #[must_use]
    pub fn is_swap(&self) -> bool {
        self.type_code == SWAP_PARTITION_TYPE
            || self.mnt == Some(MountPoint::Swap)
            || self
                .fs
                .as_deref()
                .is_some_and(|fs| fs.eq_ignore_ascii_case(SWAP_MOUNT_POINT))
    }

    /// Is this partition the root filesystem of the image?
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.mnt.as_ref().is_some_and(MountPoint::is_root)
    }

    /// Mount point relative to the image root, if the partition gets mounted
    #[must_use]
    pub fn mount_path(&self) -> Option<&Path> {
        match &self.mnt {
            Some(MountPoint::Path(p)) if !self.is_swap() => Some(p),
            _ => None,
        }
    }
}

/// A disk image description
#[derive(Clone, Debug, Deserialize)]
#[cfg_attr(feature = "schema", derive(JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct DiskConfig {
    /// Name of the topology
    pub name: Option<String>,

    /// Free-form description
    pub description: Option<String>,

    /// Path of the final image
    pub path: PathBuf,

    /// Disk size, in megabytes
    #[serde(rename = "size-mb")]
    pub size_mb: u64,

    /// Whether the active partition gets the boot flag
    #[serde(default)]
    pub bootable: bool,

    /// Sequence number of the partition flagged bootable
    #[serde(rename = "active-partition", default = "default_active_partition")]
    pub active_partition: u8,

    /// Bootloader to install
    #[serde(default)]
    pub bootloader: BootloaderKind,

    /// Format of the final image
    #[serde(default)]
    pub format: StorageFormat,

    /// Partition plan, ordered by sequence number
    #[serde(default)]
    pub partitions: Vec<Partition>,

    /// Pre-written `fdisk` script, used instead of the generated one
    #[serde(rename = "fdisk-script")]
    pub fdisk_script: Option<String>,
}

impl DiskConfig {
    /// Parses a TOML disk description
    ///
    /// # Errors
    ///
    /// If the content isn't a valid description
    pub fn from_toml_str(s: &str) -> Result<Self, VapdiskError> {
        Ok(toml::from_str(s)?)
    }

    /// Parses a JSON disk description
    ///
    /// # Errors
    ///
    /// If the content isn't a valid description
    pub fn from_json_str(s: &str) -> Result<Self, VapdiskError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Reads a disk description from a file. Files with a `.json` extension
    /// are parsed as JSON, anything else as TOML.
    ///
    /// # Errors
    ///
    /// If the file can't be read or isn't a valid description
    pub fn from_path(path: &Path) -> Result<Self, VapdiskError> {
        debug!("Loading disk configuration from {}", path.display());

        let content = fs::read_to_string(path)?;

        let cfg = if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_json_str(&content)?
        } else {
            Self::from_toml_str(&content)?
        };

        debug!(
            "Disk {}: {}MB, {} partitions, bootloader {}, format {}",
            cfg.path.display(),
            cfg.size_mb,
            cfg.partitions.len(),
            cfg.bootloader,
            cfg.format
        );

        Ok(cfg)
    }

    /// Does the partition plan need an extended container?
    #[must_use]
    pub fn needs_extended(&self) -> bool {
        self.partitions.len() > MAX_PRIMARY_PARTITIONS
    }

    /// Is this partition the extended container of the table?
    #[must_use]
    pub fn is_extended(&self, part: &Partition) -> bool {
        self.needs_extended() && part.sequence == EXTENDED_PARTITION_SEQUENCE
    }

    /// Returns the index and partition holding the root filesystem
    #[must_use]
    pub fn root_partition(&self) -> Option<(usize, &Partition)> {
        self.partitions.iter().enumerate().find(|(_, p)| p.is_root())
    }

    /// Checks the partition plan consistency
    ///
    /// # Errors
    ///
    /// If the plan can't be laid out on the disk
    pub fn validate(&self) -> Result<(), VapdiskError> {
        if self.size_mb == 0 {
            return Err(VapdiskError::InvalidPlan("Disk size is zero".to_owned()));
        }

        let count = self.partitions.len();
        for (idx, part) in self.partitions.iter().enumerate() {
            let expected = idx + 1;
            if usize::from(part.sequence) != expected {
                return Err(VapdiskError::InvalidPlan(format!(
                    "Partition {idx}: Sequence {} found where {expected} was expected",
                    part.sequence
                )));
            }

            match part.size {
                PartitionSize::Remaining if expected != count => {
                    return Err(VapdiskError::InvalidPlan(format!(
                        "Partition {}: Only the last partition can use the remaining space",
                        part.sequence
                    )));
                }
                PartitionSize::Percent(pct) if pct == 0 || pct > 100 => {
                    return Err(VapdiskError::InvalidPlan(format!(
                        "Partition {}: Invalid percentage {pct}",
                        part.sequence
                    )));
                }
                PartitionSize::Megabytes(0) => {
                    return Err(VapdiskError::InvalidPlan(format!(
                        "Partition {}: Size is zero",
                        part.sequence
                    )));
                }
                PartitionSize::Megabytes(_)
                | PartitionSize::Percent(_)
                | PartitionSize::Remaining => {}
            }
        }

        if let Some(container) = self.partitions.iter().find(|p| self.is_extended(p)) {
            if container.mnt.is_some() || container.fs.is_some() {
                return Err(VapdiskError::InvalidPlan(format!(
                    "Partition {}: The extended container can't hold a filesystem",
                    container.sequence
                )));
            }

            if self.bootable && self.active_partition == container.sequence {
                return Err(VapdiskError::InvalidPlan(format!(
                    "Partition {}: The extended container can't be the active partition",
                    container.sequence
                )));
            }
        }

        let roots = self.partitions.iter().filter(|p| p.is_root()).count();
        if roots > 1 {
            return Err(VapdiskError::InvalidPlan(format!(
                "{roots} partitions are mounted on /"
            )));
        }

        if count > 0 && roots == 0 {
            return Err(VapdiskError::InvalidPlan(
                "No partition is mounted on /".to_owned(),
            ));
        }

        if self.bootable
            && count > 0
            && !self
                .partitions
                .iter()
                .any(|p| p.sequence == self.active_partition)
        {
            return Err(VapdiskError::InvalidPlan(format!(
                "Active partition {} isn't declared",
                self.active_partition
            )));
        }

        Ok(())
    }
}
