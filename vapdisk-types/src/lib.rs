#![doc = include_str!("../README.md")]

extern crate alloc;

use alloc::fmt;
use std::io;

use serde::Deserialize;

/// Bootloader family installed onto the image
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, clap::ValueEnum)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[clap(rename_all = "lower")]
#[serde(rename_all = "lowercase")]
pub enum BootloaderKind {
    /// Leave the image without a bootloader
    #[default]
    None,

    /// Legacy GRUB, written to the MBR through its interactive shell
    Grub,

    /// GRUB 2, installed from a chroot with a synthetic device map
    Grub2,

    /// SYSLINUX-family `extlinux`, MBR stub plus chroot install
    Extlinux,
}

impl fmt::Display for BootloaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Grub => "grub",
            Self::Grub2 => "grub2",
            Self::Extlinux => "extlinux",
        })
    }
}

/// Disk image format of the final artifact
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, clap::ValueEnum)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[clap(rename_all = "lower")]
#[serde(rename_all = "lowercase")]
pub enum StorageFormat {
    /// Raw disk, no conversion
    #[default]
    Raw,

    /// QEMU Copy-On-Write v2
    Qcow2,

    /// VMware Virtual Machine Disk
    Vmdk,

    /// VirtualBox Disk Image
    Vdi,

    /// Hyper-V Virtual Hard Disk v2
    Vhdx,

    /// Virtual PC Virtual Hard Disk
    Vpc,
}

impl StorageFormat {
    /// Returns the format name as understood by `qemu-img`, which is also
    /// the file extension used for the converted artifact.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Qcow2 => "qcow2",
            Self::Vmdk => "vmdk",
            Self::Vdi => "vdi",
            Self::Vhdx => "vhdx",
            Self::Vpc => "vpc",
        }
    }
}

impl fmt::Display for StorageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A shell command that exited unsuccessfully, or couldn't be started at all
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandError {
    /// The command line, as handed over to the executor
    pub command: String,

    /// Exit status, if the command ran to completion
    pub status: Option<i32>,

    /// Captured standard output and error
    pub output: String,
}

impl CommandError {
    /// Creates a new command failure report
    #[must_use]
    pub fn new(command: &str, status: Option<i32>, output: &str) -> Self {
        Self {
            command: command.to_owned(),
            status,
            output: output.trim_end().to_owned(),
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(code) => write!(f, "`{}` exited with status {code}", self.command)?,
            None => write!(f, "`{}` couldn't be run", self.command)?,
        }

        if !self.output.is_empty() {
            write!(f, ": {}", self.output)?;
        }

        Ok(())
    }
}

impl std::error::Error for CommandError {}

/// Our Error Type
#[derive(thiserror::Error, Debug)]
pub enum VapdiskError {
    /// No free loop device could be found, or the image couldn't be attached to it
    #[error("Loop Device Binding Failure: {0}")]
    DeviceBind(String),

    /// The device-mapper helper didn't expose any partition for the loop device
    #[error("No Partition Mappers Found for {0}")]
    NoMappersFound(String),

    /// The number of partitions on the device doesn't match the configuration
    #[error("Partition Count Mismatch: {declared} declared, {found} found on the device")]
    PartitionCountMismatch {
        /// Number of partitions in the configuration
        declared: usize,

        /// Number of partition nodes found on the device
        found: usize,
    },

    /// A step needing mounted partitions ran before any got mounted
    #[error("No Mounted Partition, the image hasn't been parsed")]
    EmptyMapper,

    /// A bootloader binary or one of its support files is missing in the image
    #[error("Bootloader Not Found: {0}")]
    BootloaderNotFound(String),

    /// The bootloader installer ran but reported a failure
    #[error("Bootloader Installation Failure: {reason}: {output}")]
    BootloaderInstall {
        /// What went wrong
        reason: String,

        /// Captured installer output
        output: String,
    },

    /// An external command failed
    #[error("Command Failure: {0}")]
    CommandExecution(#[from] CommandError),

    /// The partition plan is inconsistent
    #[error("Invalid Partition Plan: {0}")]
    InvalidPlan(String),

    /// A lifecycle operation was called out of order
    #[error("Invalid Lifecycle State: {0}")]
    InvalidState(String),

    /// The remote filesystem bridge failed
    #[error("Remote Bridge Failure: {0}")]
    Remote(String),

    /// An error has occurred when accessing the local filesystem or files
    #[error("I/O Error")]
    Io(#[from] io::Error),

    /// An error has occurred when parsing JSON data
    #[error("JSON Parsing Failure")]
    Json(#[from] serde_json::Error),

    /// An error has occurred when parsing TOML configuration files
    #[error("Configuration File Format Error")]
    Toml(#[from] toml::de::Error),
}
