//! Shell command execution, on this machine or over SSH

use core::fmt;
use std::{path::PathBuf, process};

use log::{debug, trace};
use types::CommandError;

/// Runs shell command lines and returns what they printed
pub trait Executor {
    /// Runs a command line through a POSIX shell
    ///
    /// # Errors
    ///
    /// If the command can't be started or exits unsuccessfully
    fn run(&self, command: &str) -> Result<String, CommandError>;
}

impl<F> Executor for F
where
    F: Fn(&str) -> Result<String, CommandError>,
{
    fn run(&self, command: &str) -> Result<String, CommandError> {
        self(command)
    }
}

fn collect_output(command: &str, output: &process::Output) -> Result<String, CommandError> {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    trace!("`{command}` output: {text:?}");

    if !output.status.success() {
        return Err(CommandError::new(command, output.status.code(), &text));
    }

    Ok(text)
}

/// Runs commands on this machine through `sh -c`
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalExecutor;

impl Executor for LocalExecutor {
    fn run(&self, command: &str) -> Result<String, CommandError> {
        debug!("Running `{command}`");

        let output = process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .map_err(|e| CommandError::new(command, None, &e.to_string()))?;

        collect_output(command, &output)
    }
}

/// Runs commands on a remote host through `ssh`
#[derive(Clone, Debug)]
pub struct SshExecutor {
    destination: String,
    port: Option<u16>,
    identity: Option<PathBuf>,
}

impl SshExecutor {
    /// Creates a new executor targeting `destination`, in the `[user@]host`
    /// form
    #[must_use]
    pub fn new(destination: &str) -> Self {
        Self {
            destination: destination.to_owned(),
            port: None,
            identity: None,
        }
    }

    /// Connects to a non-default port
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Authenticates with the given private key
    #[must_use]
    pub fn identity(mut self, identity: PathBuf) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Remote destination, in the `[user@]host` form
    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Port to connect to, if not the default one
    #[must_use]
    pub fn remote_port(&self) -> Option<u16> {
        self.port
    }

    /// Private key used for authentication, if any
    #[must_use]
    pub fn identity_file(&self) -> Option<&PathBuf> {
        self.identity.as_ref()
    }

    pub(crate) fn ssh_command(&self, program: &str, port_flag: &str) -> process::Command {
        let mut cmd = process::Command::new(program);

        cmd.args(["-o", "BatchMode=yes"]);

        if let Some(port) = self.port {
            cmd.arg(port_flag).arg(port.to_string());
        }

        if let Some(identity) = &self.identity {
            cmd.arg("-i").arg(identity);
        }

        cmd
    }
}

impl fmt::Display for SshExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{port}", self.destination),
            None => f.write_str(&self.destination),
        }
    }
}

impl Executor for SshExecutor {
    fn run(&self, command: &str) -> Result<String, CommandError> {
        debug!("Running `{command}` on {self}");

        let output = self
            .ssh_command("ssh", "-p")
            .arg(&self.destination)
            .arg(command)
            .output()
            .map_err(|e| CommandError::new(command, None, &e.to_string()))?;

        collect_output(command, &output)
    }
}
