//! Population of the image root filesystem

use std::{
    path::{Path, PathBuf},
    process,
};

use log::info;
use types::{CommandError, VapdiskError};

/// Populates the mounted root filesystem of the image
pub trait Filler {
    /// Fills the filesystem mounted at `root`
    ///
    /// # Errors
    ///
    /// If the filesystem couldn't be populated
    fn fill(&self, root: &Path) -> Result<(), VapdiskError>;
}

impl<F> Filler for F
where
    F: Fn(&Path) -> Result<(), VapdiskError>,
{
    fn fill(&self, root: &Path) -> Result<(), VapdiskError> {
        self(root)
    }
}

/// A [`Filler`] running an external program, with the root directory as its
/// last argument
#[derive(Clone, Debug)]
pub struct CommandFiller {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandFiller {
    /// Creates a new filler running `program`
    #[must_use]
    pub fn new(program: &Path) -> Self {
        Self {
            program: program.to_path_buf(),
            args: Vec::new(),
        }
    }

    /// Adds an argument, passed before the root directory
    #[must_use]
    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(arg.to_owned());
        self
    }
}

impl Filler for CommandFiller {
    fn fill(&self, root: &Path) -> Result<(), VapdiskError> {
        let line = format!(
            "{} {} {}",
            self.program.display(),
            self.args.join(" "),
            root.display()
        );

        info!("Running filler {}", self.program.display());

        let status = process::Command::new(&self.program)
            .args(&self.args)
            .arg(root)
            .status()
            .map_err(|e| CommandError::new(&line, None, &e.to_string()))?;

        if !status.success() {
            return Err(CommandError::new(&line, status.code(), "").into());
        }

        Ok(())
    }
}
