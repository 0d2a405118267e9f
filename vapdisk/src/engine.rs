//! Disk image lifecycle

use core::fmt;
use std::{
    fs, io,
    path::{Path, PathBuf},
};

use fdisk::{literal_script, FdiskScript};
use layout::DiskConfig;
use log::{debug, error, info, warn};
use types::{BootloaderKind, VapdiskError};

use crate::{
    bootloader::{self, BootTarget},
    command::Command,
    convert,
    device::{self, DeviceOptions, LoopDevice},
    exec::Executor,
    filler::Filler,
    mount,
    registry::{Mapper, MountRegistry},
    remote::RemoteBridge,
};

/// Where an [`Engine`] stands in the image lifecycle
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    /// The working root and the raw image exist
    Created,

    /// The image is bound to a loop device
    Bound,

    /// The image has been partitioned, formatted and mounted
    Formatted,

    /// The partitions of an existing image have been mounted
    Attached,

    /// The root filesystem has been populated
    Customized,

    /// The bootloader has been installed
    Bootable,

    /// The image has been converted to its final format
    Converted,

    /// The partitions and the loop device have been released
    Released,

    /// Every temporary resource is gone
    CleanedUp,

    /// A step failed, the image can only be released
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Bound => "bound",
            Self::Formatted => "formatted",
            Self::Attached => "attached",
            Self::Customized => "customized",
            Self::Bootable => "bootable",
            Self::Converted => "converted",
            Self::Released => "released",
            Self::CleanedUp => "cleaned up",
            Self::Failed => "failed",
        })
    }
}

struct RemoteSession {
    bridge: Box<dyn RemoteBridge + Send>,
    local_root: PathBuf,
    staging: Option<PathBuf>,
    attached: bool,
}

/// Creates an [`Engine`]
pub struct EngineBuilder {
    cfg: DiskConfig,
    root: PathBuf,
    exec: Box<dyn Executor + Send>,
    opts: DeviceOptions,
    bridge: Option<Box<dyn RemoteBridge + Send>>,
}

impl fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("cfg", &self.cfg)
            .field("root", &self.root)
            .field("opts", &self.opts)
            .field("remote", &self.bridge.is_some())
            .finish_non_exhaustive()
    }
}

impl EngineBuilder {
    /// Creates a builder for the image described by `cfg`, using `root` as
    /// the working root and running every command through `exec`
    #[must_use]
    pub fn new<E>(cfg: DiskConfig, root: &Path, exec: E) -> Self
    where
        E: Executor + Send + 'static,
    {
        Self {
            cfg,
            root: root.to_path_buf(),
            exec: Box::new(exec),
            opts: DeviceOptions::default(),
            bridge: None,
        }
    }

    /// Changes the partition mappers tooling
    #[must_use]
    pub fn device_options(mut self, opts: DeviceOptions) -> Self {
        self.opts = opts;
        self
    }

    /// Works on a remote host. The working root is then created on the
    /// remote host and mounted on the local root through `bridge`, and the
    /// `kpartx` binary gets uploaded there.
    #[must_use]
    pub fn remote<B>(mut self, bridge: B) -> Self
    where
        B: RemoteBridge + Send + 'static,
    {
        self.bridge = Some(Box::new(bridge));
        self
    }

    /// Creates the [`Engine`]: sets the working root up and allocates the
    /// raw image if it doesn't exist yet.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, if `qemu-img` is needed but missing,
    /// or if the working root or the image can't be created
    pub fn build(self) -> Result<Engine, VapdiskError> {
        self.cfg.validate()?;

        let script = match &self.cfg.fdisk_script {
            Some(literal) => literal_script(literal),
            None => FdiskScript::from_config(&self.cfg)?.render(),
        };

        let image = convert::working_image_path(&self.cfg.path, self.cfg.format);

        let mut engine = Engine {
            root: self.root.clone(),
            cfg: self.cfg,
            exec: self.exec,
            opts: self.opts,
            remote: None,
            image,
            script,
            phase: Phase::Created,
            loop_dev: None,
            needs_format: false,
            root_held: false,
        };

        if let Err(e) = engine.init(self.root, self.bridge) {
            if let Err(cleanup_err) = engine.cleanup() {
                error!("Couldn't clean up after a failed creation: {cleanup_err}");
            }

            return Err(e);
        }

        Ok(engine)
    }
}

/// Drives a disk image through its lifecycle
pub struct Engine {
    cfg: DiskConfig,
    root: PathBuf,
    exec: Box<dyn Executor + Send>,
    opts: DeviceOptions,
    remote: Option<RemoteSession>,
    image: PathBuf,
    script: String,
    phase: Phase,
    loop_dev: Option<LoopDevice>,
    needs_format: bool,
    root_held: bool,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("image", &self.image)
            .field("root", &self.root)
            .field("phase", &self.phase)
            .field("loop_dev", &self.loop_dev)
            .field("needs_format", &self.needs_format)
            .field("remote", &self.remote.is_some())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates a builder for the image described by `cfg`
    #[must_use]
    pub fn builder<E>(cfg: DiskConfig, root: &Path, exec: E) -> EngineBuilder
    where
        E: Executor + Send + 'static,
    {
        EngineBuilder::new(cfg, root, exec)
    }

    fn run(&self, cmd: &Command) -> Result<String, VapdiskError> {
        cmd.run(&*self.exec)
    }

    fn init(
        &mut self,
        local_root: PathBuf,
        bridge: Option<Box<dyn RemoteBridge + Send>>,
    ) -> Result<(), VapdiskError> {
        if let Some(bridge) = bridge {
            let remote_root = self.run(
                &Command::new("mktemp").args(["-d", "--suffix", "_vapdisk_rootfs"]),
            )?;
            self.root = PathBuf::from(remote_root.trim());
            self.root_held = true;

            fs::create_dir_all(&local_root)?;

            let session = self.remote.insert(RemoteSession {
                bridge,
                local_root,
                staging: None,
                attached: false,
            });

            session.bridge.attach(&self.root, &session.local_root)?;
            session.attached = true;

            let kpartx = PathBuf::from(self.opts.kpartx_path());
            let staging = session
                .staging
                .insert(session.bridge.upload(&[kpartx.clone()])?);

            let remote_kpartx = kpartx
                .file_name()
                .map(|name| staging.join(name))
                .ok_or_else(|| {
                    VapdiskError::Remote(format!("Invalid kpartx path {}", kpartx.display()))
                })?;

            debug!("Using remote kpartx at {}", remote_kpartx.display());
            self.opts = self.opts.clone().kpartx(&remote_kpartx.display().to_string());
        } else if self.run(&Command::new("test").arg("-e").path(&self.root)).is_ok() {
            info!("Using existing working root {}", self.root.display());
        } else {
            self.run(&Command::new("mkdir").arg("-p").path(&self.root))?;
            self.root_held = true;
        }

        convert::check_converter(&*self.exec, self.cfg.format)?;

        if self.run(&Command::new("test").arg("-e").path(&self.image)).is_ok() {
            info!("Reusing existing image {}", self.image.display());
        } else {
            self.run(
                &Command::new("dd")
                    .args(["if=/dev/zero", "bs=1", "count=0"])
                    .arg(&format!("of={}", self.image.display()))
                    .arg(&format!("seek={}M", self.cfg.size_mb)),
            )?;

            info!(
                "Allocated {}MB image {}",
                self.cfg.size_mb,
                self.image.display()
            );

            self.needs_format = !self.cfg.partitions.is_empty();
        }

        Ok(())
    }

    /// Current lifecycle phase
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Image description
    #[must_use]
    pub fn config(&self) -> &DiskConfig {
        &self.cfg
    }

    /// Working root, on the host running the commands
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Working root, as seen by the fillers
    #[must_use]
    pub fn fill_root(&self) -> &Path {
        self.remote
            .as_ref()
            .map_or(&self.root, |session| &session.local_root)
    }

    /// Current path of the image. Once converted, this is the final image.
    #[must_use]
    pub fn image_path(&self) -> &Path {
        &self.image
    }

    /// Partitioning script fed to `fdisk` when the image is created
    #[must_use]
    pub fn script(&self) -> &str {
        &self.script
    }

    /// Does the image need to be partitioned and formatted?
    #[must_use]
    pub fn needs_format(&self) -> bool {
        self.needs_format
    }

    /// Loop device the image is bound to
    #[must_use]
    pub fn loop_device(&self) -> Option<&Path> {
        self.loop_dev.as_ref().map(LoopDevice::path)
    }

    /// Mounted partitions, in mount order
    #[must_use]
    pub fn mappers(&self) -> Option<&MountRegistry> {
        self.loop_dev.as_ref().map(LoopDevice::mappers)
    }

    /// Number of mounted partitions
    #[must_use]
    pub fn mapper_count(&self) -> usize {
        self.mappers().map_or(0, MountRegistry::len)
    }

    fn expect_phase(&self, op: &str, allowed: &[Phase]) -> Result<(), VapdiskError> {
        if allowed.contains(&self.phase) {
            return Ok(());
        }

        Err(VapdiskError::InvalidState(format!(
            "Can't {op} an image that is {}",
            self.phase
        )))
    }

    fn track<T>(&mut self, res: Result<T, VapdiskError>) -> Result<T, VapdiskError> {
        if res.is_err() {
            self.phase = Phase::Failed;
        }

        res
    }

    /// Binds the image to a loop device
    ///
    /// # Errors
    ///
    /// If called out of order, or if no loop device can be bound
    pub fn bind(&mut self) -> Result<(), VapdiskError> {
        self.expect_phase("bind", &[Phase::Created])?;

        let res = LoopDevice::bind(&*self.exec, &self.image);
        let dev = self.track(res)?;

        info!(
            "Image {} bound to {}",
            self.image.display(),
            dev.path().display()
        );

        self.loop_dev = Some(dev);
        self.phase = Phase::Bound;

        Ok(())
    }

    fn prepare(&mut self) -> Result<Phase, VapdiskError> {
        let Some(dev) = self.loop_dev.as_mut() else {
            return Err(VapdiskError::InvalidState(
                "No loop device bound".to_owned(),
            ));
        };

        if self.needs_format {
            mount::format_partitions(
                &*self.exec,
                &self.opts,
                &self.cfg,
                &self.root,
                dev,
                &self.script,
            )?;

            self.needs_format = false;
            Ok(Phase::Formatted)
        } else {
            mount::attach_partitions(&*self.exec, &self.opts, &self.cfg, &self.root, dev)?;

            Ok(Phase::Attached)
        }
    }

    /// Partitions, formats and mounts a fresh image, or mounts the
    /// partitions of an existing one
    ///
    /// # Errors
    ///
    /// If called out of order, if the partitions found don't match the
    /// configuration, or if any of them can't be prepared
    pub fn parse(&mut self) -> Result<(), VapdiskError> {
        self.expect_phase("parse", &[Phase::Bound])?;

        let res = self.prepare();
        self.phase = self.track(res)?;

        info!(
            "Image {} {}, {} partitions mounted",
            self.image.display(),
            self.phase,
            self.mapper_count()
        );

        Ok(())
    }

    /// Populates the root filesystem with `filler`
    ///
    /// # Errors
    ///
    /// If no partition is mounted, if called out of order, or if the filler
    /// fails
    pub fn customize(&mut self, filler: &dyn Filler) -> Result<(), VapdiskError> {
        if self.mapper_count() == 0 {
            return Err(VapdiskError::EmptyMapper);
        }

        self.expect_phase(
            "customize",
            &[Phase::Formatted, Phase::Attached, Phase::Customized],
        )?;

        let res = filler.fill(self.fill_root());
        self.track(res)?;

        self.phase = Phase::Customized;

        Ok(())
    }

    fn install_bootloader(&self) -> Result<(), VapdiskError> {
        let Some(dev) = &self.loop_dev else {
            return Err(VapdiskError::EmptyMapper);
        };

        let Some(first) = dev.mappers().first() else {
            return Err(VapdiskError::EmptyMapper);
        };

        let target = BootTarget {
            root: &self.root,
            image: &self.image,
            loop_device: dev.path(),
            boot_partition: first.node(),
        };

        bootloader::install(&*self.exec, self.cfg.bootloader, &target)
    }

    /// Installs the configured bootloader
    ///
    /// # Errors
    ///
    /// If called out of order, if the bootloader can't be found in the image
    /// or if its installation fails
    pub fn make_bootable(&mut self) -> Result<(), VapdiskError> {
        self.expect_phase(
            "make bootable",
            &[Phase::Formatted, Phase::Attached, Phase::Customized],
        )?;

        if self.cfg.bootloader != BootloaderKind::None {
            let res = self.install_bootloader();
            self.track(res)?;
        }

        self.phase = Phase::Bootable;

        Ok(())
    }

    /// Converts the image to its final format
    ///
    /// # Errors
    ///
    /// If called out of order, or if the conversion fails
    pub fn convert(&mut self) -> Result<(), VapdiskError> {
        self.expect_phase(
            "convert",
            &[
                Phase::Formatted,
                Phase::Attached,
                Phase::Customized,
                Phase::Bootable,
            ],
        )?;

        let res = convert::convert(&*self.exec, &self.image, self.cfg.format);
        self.image = self.track(res)?;
        self.phase = Phase::Converted;

        Ok(())
    }

    fn record(first_err: &mut Option<VapdiskError>, res: Result<String, VapdiskError>) -> bool {
        match res {
            Ok(_) => true,
            Err(e) => {
                error!("Release step failed: {e}");
                first_err.get_or_insert(e);
                false
            }
        }
    }

    /// Unmounts the partitions in the reverse order of their mounting, then
    /// the working root, and releases the loop device. The working root is
    /// removed if it was created by the engine.
    ///
    /// Partitions that aren't mounted anymore are only forgotten. Every step
    /// is attempted even if a previous one failed. Releasing an engine that
    /// holds nothing is a no-op.
    ///
    /// # Errors
    ///
    /// The first error encountered
    pub fn release(&mut self) -> Result<(), VapdiskError> {
        let mut first_err = None;
        let mut unmounted = true;

        if let Some(mut dev) = self.loop_dev.take() {
            let exec = &*self.exec;
            let mut root_mounted = false;

            let mounts = if dev.mappers().is_empty() {
                None
            } else {
                match device::mount_table(exec) {
                    Ok(mounts) => Some(mounts),
                    Err(e) => {
                        warn!("Couldn't read the mount table, unmounting everything: {e}");
                        None
                    }
                }
            };

            let still_mounted = |mapper: &Mapper| match &mounts {
                Some(table) => device::is_mounted(table, mapper.node(), mapper.mount_point()),
                None => true,
            };

            while let Some(mapper) = dev.pop_mapper() {
                if !still_mounted(&mapper) {
                    debug!(
                        "{} isn't mounted on {} anymore",
                        mapper.node().display(),
                        mapper.mount_point().display()
                    );
                    continue;
                }

                if mapper.mount_point() == self.root {
                    root_mounted = true;
                    continue;
                }

                debug!("Unmounting {}", mapper.mount_point().display());

                unmounted &= Self::record(
                    &mut first_err,
                    Command::new("umount")
                        .arg("-l")
                        .path(mapper.mount_point())
                        .run(exec),
                );
            }

            if root_mounted {
                unmounted &= Self::record(
                    &mut first_err,
                    Command::new("umount").arg("-l").path(&self.root).run(exec),
                );
            }

            Self::record(
                &mut first_err,
                dev.remove_mappers(exec, &self.opts).map(|()| String::new()),
            );
            Self::record(&mut first_err, dev.detach(exec).map(|()| String::new()));

            info!("Released {}", dev.path().display());
        }

        if self.root_held {
            if unmounted {
                if Self::record(
                    &mut first_err,
                    self.run(&Command::new("rm").arg("-rf").path(&self.root)),
                ) {
                    self.root_held = false;
                }
            } else {
                warn!(
                    "Leaving {} in place, some partitions might still be mounted",
                    self.root.display()
                );
                self.root_held = false;
            }
        }

        if !matches!(self.phase, Phase::Released | Phase::CleanedUp) {
            self.phase = Phase::Released;
        }

        first_err.map_or(Ok(()), Err)
    }

    /// Releases the image if needed, then removes the remaining temporary
    /// resources. Cleaning up twice is a no-op.
    ///
    /// # Errors
    ///
    /// The first error encountered
    pub fn cleanup(&mut self) -> Result<(), VapdiskError> {
        if self.phase == Phase::CleanedUp {
            return Ok(());
        }

        let mut first_err = self.release().err();

        if let Some(mut session) = self.remote.take() {
            if session.attached {
                match session.bridge.detach(&session.local_root) {
                    Ok(()) => session.attached = false,
                    Err(e) => {
                        error!("Couldn't detach the remote root: {e}");
                        first_err.get_or_insert(e);
                    }
                }
            }

            if let Some(staging) = session.staging.take() {
                Self::record(
                    &mut first_err,
                    self.run(&Command::new("rm").arg("-rf").path(&staging)),
                );
            }

            if !session.attached {
                match fs::remove_dir(&session.local_root) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => {
                        error!(
                            "Couldn't remove {}: {e}",
                            session.local_root.display()
                        );
                        first_err.get_or_insert(e.into());
                    }
                }
            }
        }

        self.phase = Phase::CleanedUp;

        first_err.map_or(Ok(()), Err)
    }
}
