//! Shell command lines, built from structured parts

use alloc::borrow::Cow;
use core::fmt;
use std::path::Path;

use log::debug;
use types::VapdiskError;

use crate::exec::Executor;

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '=' | ':' | ',' | '+' | '@' | '%')
}

/// Quotes a word so that the shell passes it as-is
#[must_use]
pub fn quote(word: &str) -> Cow<'_, str> {
    if !word.is_empty() && word.chars().all(is_shell_safe) {
        return Cow::Borrowed(word);
    }

    Cow::Owned(format!("'{}'", word.replace('\'', r"'\''")))
}

/// A command line to hand over to an [`Executor`]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Command {
    program: String,
    args: Vec<String>,
    stdin: Option<String>,
    tolerate_failure: bool,
}

impl Command {
    /// Creates a new command running `program`
    #[must_use]
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_owned(),
            args: Vec::new(),
            stdin: None,
            tolerate_failure: false,
        }
    }

    /// Adds an argument
    #[must_use]
    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(arg.to_owned());
        self
    }

    /// Adds multiple arguments
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    /// Adds a path argument
    #[must_use]
    pub fn path(self, path: &Path) -> Self {
        let arg = path.display().to_string();
        self.arg(&arg)
    }

    /// Feeds `input` to the command standard input
    #[must_use]
    pub fn stdin(mut self, input: &str) -> Self {
        self.stdin = Some(input.to_owned());
        self
    }

    /// Doesn't consider a non-zero exit status as a failure
    #[must_use]
    pub fn tolerate_failure(mut self) -> Self {
        self.tolerate_failure = true;
        self
    }

    /// Renders the command as a shell command line
    #[must_use]
    pub fn render(&self) -> String {
        let mut words = Vec::with_capacity(self.args.len() + 1);
        words.push(quote(&self.program));
        words.extend(self.args.iter().map(|a| quote(a)));

        let line = words.join(" ");

        match &self.stdin {
            Some(input) => format!("printf '%s' {} | {line}", quote(input)),
            None => line,
        }
    }

    /// Runs the command and returns its output
    ///
    /// # Errors
    ///
    /// If the command fails and failures aren't tolerated
    pub fn run(&self, exec: &dyn Executor) -> Result<String, VapdiskError> {
        let line = self.render();

        match exec.run(&line) {
            Ok(out) => Ok(out),
            Err(e) if self.tolerate_failure => {
                debug!("Ignoring failure: {e}");
                Ok(e.output)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}
