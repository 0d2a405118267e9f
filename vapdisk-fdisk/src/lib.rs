#![doc = include_str!("../README.md")]

use core::fmt::{self, Write as _};

use layout::{DiskConfig, PartitionSize, EXTENDED_PARTITION_SEQUENCE, MAX_PRIMARY_PARTITIONS};
use log::{debug, trace};
use types::VapdiskError;

const FIRST_LOGICAL_PARTITION: u8 = 5;

/// Where a partition lands in the DOS partition table
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Placement {
    /// A primary partition, with its slot number
    Primary(u8),

    /// The extended container, always in slot 4
    Extended,

    /// A logical drive inside the extended container, numbered from 5
    Logical(u8),
}

impl Placement {
    /// Partition number `fdisk` uses to address this entry
    #[must_use]
    pub fn table_index(self) -> u8 {
        match self {
            Self::Primary(idx) | Self::Logical(idx) => idx,
            Self::Extended => EXTENDED_PARTITION_SEQUENCE,
        }
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary(idx) => write!(f, "primary {idx}"),
            Self::Extended => write!(f, "extended {EXTENDED_PARTITION_SEQUENCE}"),
            Self::Logical(idx) => write!(f, "logical {idx}"),
        }
    }
}

/// End of a partition being created
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Extent {
    /// Fixed size, in megabytes
    Megabytes(u64),

    /// Up to the end of the free space
    Remaining,
}

/// A single `fdisk` interaction
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FdiskOp {
    /// Create a new empty DOS partition table
    NewDosLabel,

    /// Create a partition
    Create {
        /// Where the partition lands in the table
        placement: Placement,

        /// How far it extends
        extent: Extent,
    },

    /// Change a partition type. `fdisk` doesn't ask for the partition number
    /// while there's only one, hence the optional index.
    SetType {
        /// Partition number, if `fdisk` is going to ask for it
        index: Option<u8>,

        /// Partition type code
        code: u8,
    },

    /// Toggle the boot flag of a partition
    ToggleBootable(u8),

    /// Write the table and exit
    Write,
}

impl FdiskOp {
    fn render(self, out: &mut String) -> fmt::Result {
        match self {
            Self::NewDosLabel => out.write_str("o\n"),
            Self::Create { placement, extent } => {
                let last = match extent {
                    Extent::Megabytes(mb) => format!("+{mb}M"),
                    Extent::Remaining => String::new(),
                };

                // Once three primary partitions exist, fdisk picks the last
                // free slot on its own, and once the extended container
                // exists it only creates logical drives.
                match placement {
                    Placement::Primary(idx) if idx < EXTENDED_PARTITION_SEQUENCE => {
                        write!(out, "n\np\n{idx}\n\n{last}\n")
                    }
                    Placement::Primary(_) => write!(out, "n\np\n\n{last}\n"),
                    Placement::Extended => write!(out, "n\ne\n\n{last}\n"),
                    Placement::Logical(_) => write!(out, "n\n\n{last}\n"),
                }
            }
            Self::SetType { index: None, code } => write!(out, "t\n{code:x}\n"),
            Self::SetType {
                index: Some(idx),
                code,
            } => write!(out, "t\n{idx}\n{code:x}\n"),
            Self::ToggleBootable(idx) => write!(out, "a\n{idx}\n"),
            Self::Write => out.write_str("w\n"),
        }
    }
}

/// Computes where each partition of a plan of `count` partitions lands.
///
/// Up to four partitions are all primaries. Past that, the first three are
/// primaries, the fourth is the extended container and the others are logical
/// drives.
#[must_use]
pub fn placements(count: usize) -> Vec<Placement> {
    let needs_extended = count > MAX_PRIMARY_PARTITIONS;
    let mut next_logical = FIRST_LOGICAL_PARTITION;

    (1..=count)
        .map(|seq| {
            let seq = u8::try_from(seq).unwrap_or(u8::MAX);

            if !needs_extended || seq < EXTENDED_PARTITION_SEQUENCE {
                Placement::Primary(seq)
            } else if seq == EXTENDED_PARTITION_SEQUENCE {
                Placement::Extended
            } else {
                let idx = next_logical;
                next_logical = next_logical.saturating_add(1);
                Placement::Logical(idx)
            }
        })
        .collect()
}

/// A partition entry of an [`FdiskScriptBuilder`]
#[derive(Clone, Copy, Debug)]
pub struct FdiskPartition {
    sequence: u8,
    size: PartitionSize,
    type_code: u8,
}

impl FdiskPartition {
    /// Creates a new partition entry
    #[must_use]
    pub fn new(sequence: u8, size: PartitionSize, type_code: u8) -> Self {
        Self {
            sequence,
            size,
            type_code,
        }
    }
}

/// A partitioning script builder
#[derive(Debug)]
pub struct FdiskScriptBuilder {
    disk_size_mb: u64,
    partitions: Vec<FdiskPartition>,
    active: Option<u8>,
}

impl FdiskScriptBuilder {
    /// Creates a new builder for a disk of the given size
    #[must_use]
    pub fn new(disk_size_mb: u64) -> Self {
        Self {
            disk_size_mb,
            partitions: Vec::new(),
            active: None,
        }
    }

    /// Adds a partition. Partitions must be added in sequence order.
    #[must_use]
    pub fn add_partition(mut self, part: FdiskPartition) -> Self {
        self.partitions.push(part);
        self
    }

    /// Flags the partition with the given sequence number as bootable
    #[must_use]
    pub fn bootable(mut self, sequence: u8) -> Self {
        self.active = Some(sequence);
        self
    }

    fn resolve_extents(&self, placements: &[Placement]) -> Result<Vec<Extent>, VapdiskError> {
        let count = self.partitions.len();
        let mut extents = Vec::with_capacity(count);
        let mut table_mb: u64 = 0;
        let mut extended_mb = None;
        let mut logical_mb: u64 = 0;

        for (idx, (part, placement)) in self.partitions.iter().zip(placements).enumerate() {
            let expected = idx + 1;
            if usize::from(part.sequence) != expected {
                return Err(VapdiskError::InvalidPlan(format!(
                    "Partition {idx}: Sequence {} found where {expected} was expected",
                    part.sequence
                )));
            }

            let extent = match part.size.resolve_mb(self.disk_size_mb) {
                Some(0) => {
                    return Err(VapdiskError::InvalidPlan(format!(
                        "Partition {}: Resolves to an empty partition on a {}MB disk",
                        part.sequence, self.disk_size_mb
                    )));
                }
                Some(mb) => Extent::Megabytes(mb),
                None if expected == count => Extent::Remaining,
                None => {
                    return Err(VapdiskError::InvalidPlan(format!(
                        "Partition {}: Only the last partition can use the remaining space",
                        part.sequence
                    )));
                }
            };

            debug!(
                "Partition {}: {placement}, {:?} (requested {:?})",
                part.sequence, extent, part.size
            );

            if let Extent::Megabytes(mb) = extent {
                match placement {
                    Placement::Primary(_) => table_mb = table_mb.saturating_add(mb),
                    Placement::Extended => {
                        table_mb = table_mb.saturating_add(mb);
                        extended_mb = Some(mb);
                    }
                    Placement::Logical(_) => logical_mb = logical_mb.saturating_add(mb),
                }
            }

            extents.push(extent);
        }

        let remaining_requested = extents.last() == Some(&Extent::Remaining);
        let available = if remaining_requested {
            self.disk_size_mb.saturating_sub(1)
        } else {
            self.disk_size_mb
        };

        if table_mb > available {
            return Err(VapdiskError::InvalidPlan(format!(
                "Partitions need {table_mb}MB but the disk is {}MB",
                self.disk_size_mb
            )));
        }

        if let Some(container_mb) = extended_mb {
            if logical_mb > container_mb {
                return Err(VapdiskError::InvalidPlan(format!(
                    "Logical drives need {logical_mb}MB but the extended partition is {container_mb}MB"
                )));
            }
        }

        Ok(extents)
    }

    /// Creates the [`FdiskScript`] out of our builder
    ///
    /// # Errors
    ///
    /// If the partitions can't be laid out on the disk
    pub fn build(self) -> Result<FdiskScript, VapdiskError> {
        let placements = placements(self.partitions.len());
        let extents = self.resolve_extents(&placements)?;

        let mut ops = vec![FdiskOp::NewDosLabel];
        for (idx, ((part, placement), extent)) in self
            .partitions
            .iter()
            .zip(&placements)
            .zip(extents)
            .enumerate()
        {
            ops.push(FdiskOp::Create {
                placement: *placement,
                extent,
            });

            // fdisk gives the extended container its own type already
            if *placement == Placement::Extended {
                continue;
            }

            ops.push(FdiskOp::SetType {
                index: (idx != 0).then_some(placement.table_index()),
                code: part.type_code,
            });
        }

        if let Some(active) = self.active {
            let Some(placement) = placements.get(usize::from(active).wrapping_sub(1)) else {
                return Err(VapdiskError::InvalidPlan(format!(
                    "Active partition {active} isn't declared"
                )));
            };

            ops.push(FdiskOp::ToggleBootable(placement.table_index()));
        }

        ops.push(FdiskOp::Write);

        Ok(FdiskScript { ops, placements })
    }
}

/// A partitioning script, ready to be fed to `fdisk`
#[derive(Clone, Debug)]
pub struct FdiskScript {
    ops: Vec<FdiskOp>,
    placements: Vec<Placement>,
}

impl FdiskScript {
    /// Generates the partitioning script of a disk description
    ///
    /// # Errors
    ///
    /// If the partition plan can't be laid out on the disk
    pub fn from_config(cfg: &DiskConfig) -> Result<Self, VapdiskError> {
        let mut builder = FdiskScriptBuilder::new(cfg.size_mb);

        for part in &cfg.partitions {
            builder = builder.add_partition(FdiskPartition::new(
                part.sequence,
                part.size,
                part.type_code,
            ));
        }

        if cfg.bootable {
            builder = builder.bootable(cfg.active_partition);
        }

        builder.build()
    }

    /// Operations making up the script, in order
    #[must_use]
    pub fn ops(&self) -> &[FdiskOp] {
        &self.ops
    }

    /// Placement of each partition, in sequence order
    #[must_use]
    pub fn placements(&self) -> &[Placement] {
        &self.placements
    }

    /// Renders the script as `fdisk` input
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();

        for op in &self.ops {
            // Writing into a String never fails
            let _: fmt::Result = op.render(&mut out);
        }

        trace!("Generated fdisk script {out:?}");

        out
    }
}

/// Turns a hand-written script, where line breaks may be spelled `\n`, into
/// `fdisk` input.
#[must_use]
pub fn literal_script(script: &str) -> String {
    let mut out = script.replace("\\n", "\n");

    if !out.ends_with('\n') {
        out.push('\n');
    }

    out
}
