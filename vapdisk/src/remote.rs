//! Access to the working root of a remote host

use std::{
    path::{Path, PathBuf},
    process,
};

use log::{debug, info};
use types::VapdiskError;

use crate::{
    command::Command,
    exec::{Executor as _, SshExecutor},
};

/// Makes a remote directory reachable locally, and ships helper binaries to
/// the remote host
pub trait RemoteBridge {
    /// Mounts `remote` on the local directory `local`
    ///
    /// # Errors
    ///
    /// If the remote directory can't be mounted
    fn attach(&self, remote: &Path, local: &Path) -> Result<(), VapdiskError>;

    /// Unmounts the local directory `local`
    ///
    /// # Errors
    ///
    /// If the directory can't be unmounted
    fn detach(&self, local: &Path) -> Result<(), VapdiskError>;

    /// Copies `files` to a fresh staging directory on the remote host and
    /// returns that directory
    ///
    /// # Errors
    ///
    /// If the staging directory can't be created or a file can't be copied
    fn upload(&self, files: &[PathBuf]) -> Result<PathBuf, VapdiskError>;
}

fn run_local(cmd: &mut process::Command) -> Result<(), VapdiskError> {
    debug!("Running {cmd:?}");

    let output = cmd
        .output()
        .map_err(|e| VapdiskError::Remote(format!("Couldn't run {cmd:?}: {e}")))?;

    if !output.status.success() {
        return Err(VapdiskError::Remote(format!(
            "{cmd:?} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim_end()
        )));
    }

    Ok(())
}

/// A [`RemoteBridge`] using `sshfs` and `scp`
#[derive(Clone, Debug)]
pub struct SshfsBridge {
    ssh: SshExecutor,
}

impl SshfsBridge {
    /// Creates a new bridge to the host `ssh` connects to
    #[must_use]
    pub fn new(ssh: SshExecutor) -> Self {
        Self { ssh }
    }
}

impl RemoteBridge for SshfsBridge {
    fn attach(&self, remote: &Path, local: &Path) -> Result<(), VapdiskError> {
        let mut cmd = process::Command::new("sshfs");

        if let Some(port) = self.ssh.remote_port() {
            cmd.arg("-p").arg(port.to_string());
        }

        if let Some(identity) = self.ssh.identity_file() {
            let mut opt = std::ffi::OsString::from("IdentityFile=");
            opt.push(identity);
            cmd.arg("-o").arg(opt);
        }

        cmd.arg(format!("{}:{}", self.ssh.destination(), remote.display()))
            .arg(local);

        run_local(&mut cmd)?;

        info!(
            "Mounted {}:{} on {}",
            self.ssh,
            remote.display(),
            local.display()
        );

        Ok(())
    }

    fn detach(&self, local: &Path) -> Result<(), VapdiskError> {
        run_local(process::Command::new("fusermount").arg("-u").arg(local))?;

        debug!("Unmounted {}", local.display());

        Ok(())
    }

    fn upload(&self, files: &[PathBuf]) -> Result<PathBuf, VapdiskError> {
        let dir = self
            .ssh
            .run(
                &Command::new("mktemp")
                    .args(["-d", "--suffix", "_vapdisk_utils"])
                    .render(),
            )
            .map_err(|e| VapdiskError::Remote(e.to_string()))?;
        let dir = PathBuf::from(dir.trim());

        if files.is_empty() {
            return Ok(dir);
        }

        let mut cmd = self.ssh.ssh_command("scp", "-P");
        cmd.args(files)
            .arg(format!("{}:{}/", self.ssh.destination(), dir.display()));

        run_local(&mut cmd)?;

        debug!(
            "Uploaded {} files to {}:{}",
            files.len(),
            self.ssh,
            dir.display()
        );

        Ok(dir)
    }
}
