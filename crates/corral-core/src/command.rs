//! Description of an external command, independent of how it is launched.
//!
//! A [`CommandSpec`] is plain data: the spawner and runner turn it into a
//! `tokio::process::Command` with the output wiring they need, and the
//! environment controller wraps it to run inside an isolated environment.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

/// A program plus arguments, environment overrides, and working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    current_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
        }
    }

    /// `sh -c <script>`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn get_current_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    /// Build a tokio command with stdin closed.
    ///
    /// Every child is placed in its own process group so that termination
    /// reaches anything it forks, and is killed if its handle is dropped.
    pub(crate) fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(ref dir) = self.current_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

/// Quote a word for display if it contains shell-significant characters.
fn display_word(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,+@%".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.env {
            write!(f, "{key}={} ", display_word(value))?;
        }
        write!(f, "{}", display_word(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", display_word(arg))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_args_in_order() {
        let spec = CommandSpec::new("client")
            .arg("write")
            .args(["10.0.0.1", "42"]);
        assert_eq!(spec.program(), "client");
        assert_eq!(spec.get_args(), ["write", "10.0.0.1", "42"]);
    }

    #[test]
    fn shell_wraps_script() {
        let spec = CommandSpec::shell("echo hi");
        assert_eq!(spec.program(), "sh");
        assert_eq!(spec.get_args(), ["-c", "echo hi"]);
    }

    #[test]
    fn display_quotes_only_when_needed() {
        let spec = CommandSpec::shell("echo it's here").env("RUST_LOG", "debug");
        assert_eq!(spec.to_string(), r#"RUST_LOG=debug sh -c 'echo it'\''s here'"#);
    }

    #[test]
    fn display_quotes_empty_arguments() {
        let spec = CommandSpec::new("node").arg("");
        assert_eq!(spec.to_string(), "node ''");
    }
}
