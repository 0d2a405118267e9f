#![allow(clippy::multiple_crate_versions)]
//! Virtual appliance disk image builder

use core::time::Duration;
use std::{
    io::{self, Write as _},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::{bail, Context as _};
use clap::{Args, Parser, Subcommand};
use fdisk::{literal_script, FdiskScript};
use layout::DiskConfig;
use log::{debug, info};
use signal_hook as _;
use types::{BootloaderKind, StorageFormat, VapdiskError};
use vapdisk::{
    device::DeviceOptions, CommandFiller, Engine, Executor as _, InterruptGuard, LocalExecutor,
    SshExecutor, SshfsBridge,
};

#[derive(Args, Debug)]
struct BuildArgs {
    #[arg(help = "Disk Description File")]
    config: PathBuf,

    #[arg(long, help = "Working Root Directory")]
    rootfs: PathBuf,

    #[arg(long, help = "Program Populating the Root Filesystem")]
    filler: Vec<PathBuf>,

    #[arg(long, value_enum, help = "Bootloader, overriding the description")]
    bootloader: Option<BootloaderKind>,

    #[arg(long, value_enum, help = "Image Format, overriding the description")]
    format: Option<StorageFormat>,

    #[arg(long, help = "Remote Host, as [user@]host")]
    remote: Option<String>,

    #[arg(long, requires = "remote", help = "Remote SSH Port")]
    port: Option<u16>,

    #[arg(long, requires = "remote", help = "SSH Private Key")]
    identity: Option<PathBuf>,

    #[arg(long, default_value = "kpartx", help = "kpartx Binary")]
    kpartx: String,

    #[arg(long, default_value_t = 1000, help = "Partition Mappers Settle Delay, in ms")]
    settle_ms: u64,
}

impl BuildArgs {
    fn apply_overrides(&self, cfg: &mut DiskConfig) {
        if let Some(bootloader) = self.bootloader {
            debug!("Using bootloader {bootloader} instead of {}", cfg.bootloader);
            cfg.bootloader = bootloader;
        }

        if let Some(format) = self.format {
            debug!("Using format {format} instead of {}", cfg.format);
            cfg.format = format;
        }
    }
}

#[derive(Debug, Subcommand)]
enum CliSubcommand {
    Build(BuildArgs),
    Script {
        #[arg(help = "Disk Description File")]
        config: PathBuf,
    },
    Check {
        #[arg(help = "Disk Description File")]
        config: PathBuf,
    },
}

#[derive(Debug, Parser)]
#[command(version, about = "Virtual Appliance Disk Image Builder")]
struct Cli {
    #[clap(subcommand)]
    command: CliSubcommand,
}

fn lock(engine: &Mutex<Engine>) -> MutexGuard<'_, Engine> {
    engine.lock().unwrap_or_else(PoisonError::into_inner)
}

fn partitioning_script(cfg: &DiskConfig) -> Result<String, VapdiskError> {
    Ok(match &cfg.fdisk_script {
        Some(literal) => literal_script(literal),
        None => FdiskScript::from_config(cfg)?.render(),
    })
}

fn local_binary(name: &str) -> Result<String, anyhow::Error> {
    if Path::new(name).is_absolute() {
        return Ok(name.to_owned());
    }

    let path = LocalExecutor
        .run(&format!("which {name}"))
        .with_context(|| format!("Couldn't find {name}"))?;

    Ok(path.trim().to_owned())
}

fn run_lifecycle(engine: &Mutex<Engine>, fillers: &[CommandFiller]) -> Result<(), VapdiskError> {
    lock(engine).bind()?;
    lock(engine).parse()?;

    if fillers.is_empty() {
        debug!("No filler, leaving the root filesystem as is");
    }

    for filler in fillers {
        lock(engine).customize(filler)?;
    }

    lock(engine).make_bootable()?;
    lock(engine).convert()?;

    Ok(())
}

fn build(args: BuildArgs) -> Result<(), anyhow::Error> {
    let mut cfg = DiskConfig::from_path(&args.config)
        .with_context(|| format!("Couldn't load {}", args.config.display()))?;
    args.apply_overrides(&mut cfg);

    let opts = DeviceOptions::new().settle(Duration::from_millis(args.settle_ms));

    let engine = if let Some(destination) = &args.remote {
        let mut ssh = SshExecutor::new(destination);

        if let Some(port) = args.port {
            ssh = ssh.port(port);
        }

        if let Some(identity) = args.identity {
            ssh = ssh.identity(identity);
        }

        info!("Building {} on {ssh}", cfg.path.display());

        Engine::builder(cfg, &args.rootfs, ssh.clone())
            .device_options(opts.kpartx(&local_binary(&args.kpartx)?))
            .remote(SshfsBridge::new(ssh))
            .build()?
    } else {
        info!("Building {}", cfg.path.display());

        Engine::builder(cfg, &args.rootfs, LocalExecutor)
            .device_options(opts.kpartx(&args.kpartx))
            .build()?
    };

    let fillers: Vec<_> = args.filler.iter().map(|f| CommandFiller::new(f)).collect();

    let engine = Arc::new(Mutex::new(engine));
    let guard = InterruptGuard::new(Arc::clone(&engine))?;

    let res = run_lifecycle(&engine, &fillers);
    let image = lock(&engine).image_path().to_path_buf();
    let cleanup = lock(&engine).cleanup();

    drop(guard);

    res.context("Couldn't build the image")?;
    cleanup.context("Couldn't release the image")?;

    info!("Image {} ready", image.display());

    Ok(())
}

fn check(config: &Path) -> Result<(), anyhow::Error> {
    let cfg = DiskConfig::from_path(config)?;
    cfg.validate()?;

    let mut out = io::stdout().lock();

    if cfg.fdisk_script.is_some() {
        writeln!(out, "{}: Uses a pre-written partitioning script", cfg.path.display())?;
        return Ok(());
    }

    let script = FdiskScript::from_config(&cfg)?;
    writeln!(
        out,
        "{}: {}MB, bootloader {}, format {}",
        cfg.path.display(),
        cfg.size_mb,
        cfg.bootloader,
        cfg.format
    )?;

    for (part, placement) in cfg.partitions.iter().zip(script.placements()) {
        let mnt = part
            .mnt
            .as_ref()
            .map_or_else(|| "-".to_owned(), ToString::to_string);

        writeln!(
            out,
            "  {}: {placement}, type {:x}, mounted on {mnt}",
            part.sequence, part.type_code
        )?;
    }

    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::init();

    let cli = Cli::parse();

    info!(
        "Running {} {}",
        env!("CARGO_CRATE_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    match cli.command {
        CliSubcommand::Build(args) => {
            if !args.config.is_file() {
                bail!("Configuration {} isn't a file", args.config.display());
            }

            build(args)
        }
        CliSubcommand::Script { config } => {
            let cfg = DiskConfig::from_path(&config)?;
            cfg.validate()?;

            io::stdout().write_all(partitioning_script(&cfg)?.as_bytes())?;

            Ok(())
        }
        CliSubcommand::Check { config } => check(&config),
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser as _;
    use layout::DiskConfig;
    use tempfile as _;
    use test_log::test;
    use types::{BootloaderKind, StorageFormat};

    use crate::{Cli, CliSubcommand};

    fn cfg() -> DiskConfig {
        DiskConfig::from_toml_str(
            r#"
            path = "/srv/app.img"
            size-mb = 1024
            bootloader = "extlinux"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_build_overrides() {
        let cli = Cli::try_parse_from([
            "vapdisk",
            "build",
            "disk.toml",
            "--rootfs",
            "/tmp/rootfs",
            "--bootloader",
            "grub2",
            "--format",
            "qcow2",
        ])
        .unwrap();

        let CliSubcommand::Build(args) = cli.command else {
            panic!("Not a build command");
        };

        let mut cfg = cfg();
        args.apply_overrides(&mut cfg);

        assert_eq!(cfg.bootloader, BootloaderKind::Grub2);
        assert_eq!(cfg.format, StorageFormat::Qcow2);
    }

    #[test]
    fn test_build_without_overrides() {
        let cli = Cli::try_parse_from(["vapdisk", "build", "disk.toml", "--rootfs", "/tmp/rootfs"])
            .unwrap();

        let CliSubcommand::Build(args) = cli.command else {
            panic!("Not a build command");
        };

        let mut cfg = cfg();
        args.apply_overrides(&mut cfg);

        assert_eq!(cfg.bootloader, BootloaderKind::Extlinux);
        assert_eq!(cfg.format, StorageFormat::Raw);
    }

    #[test]
    fn test_unknown_bootloader() {
        Cli::try_parse_from([
            "vapdisk",
            "build",
            "disk.toml",
            "--rootfs",
            "/tmp/rootfs",
            "--bootloader",
            "lilo",
        ])
        .unwrap_err();
    }
}
