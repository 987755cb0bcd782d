//! Host command execution.
//!
//! Bridge and CNI wiring shell out to `ip`, `iptables`, `sysctl`, and plugin
//! binaries. They do so through [`HostCommand`] so tests can record the
//! calls instead of touching the host.

use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use carte_common::error::{CarteError, Result};

/// One program invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    /// Program name (looked up on `PATH`) or path.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Bytes written to standard input.
    pub stdin: Option<Vec<u8>>,
}

impl Invocation {
    /// Builds an invocation of `program` with `args`.
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
            ..Self::default()
        }
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets standard input.
    #[must_use]
    pub fn stdin(mut self, data: Vec<u8>) -> Self {
        self.stdin = Some(data);
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Runs programs on the host.
pub trait HostCommand: Send + Sync {
    /// Runs `invocation` to completion and returns its standard output.
    ///
    /// # Errors
    ///
    /// Returns a network error if the program is missing or exits non-zero.
    fn run(&self, invocation: &Invocation) -> Result<Vec<u8>>;
}

/// Runs invocations with [`std::process::Command`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommand;

impl SystemCommand {
    fn resolve(program: &str) -> Result<PathBuf> {
        if program.contains('/') {
            return Ok(PathBuf::from(program));
        }
        which::which(program).map_err(|_| CarteError::NotFound {
            kind: "host tool",
            id: program.to_string(),
        })
    }
}

impl HostCommand for SystemCommand {
    fn run(&self, invocation: &Invocation) -> Result<Vec<u8>> {
        let program = Self::resolve(&invocation.program)?;
        tracing::debug!(command = %invocation, "running host command");
        let mut child = Command::new(&program)
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k, v)))
            .stdin(if invocation.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CarteError::Network {
                message: format!("failed to run {}: {e}", program.display()),
            })?;

        if let (Some(data), Some(mut pipe)) = (&invocation.stdin, child.stdin.take()) {
            pipe.write_all(data).map_err(|e| CarteError::Network {
                message: format!("failed to write to {}: {e}", program.display()),
            })?;
        }
        let output = child.wait_with_output().map_err(|e| CarteError::Network {
            message: format!("failed to wait for {}: {e}", program.display()),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = if stderr.trim().is_empty() {
                String::from_utf8_lossy(&output.stdout).trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(CarteError::Network {
                message: format!("`{invocation}` failed: {detail}"),
            });
        }
        Ok(output.stdout)
    }
}

/// Runs a cleanup command, logging instead of failing.
pub(crate) fn run_best_effort(commands: &dyn HostCommand, invocation: &Invocation) {
    if let Err(e) = commands.run(invocation) {
        tracing::warn!(command = %invocation, error = %e, "cleanup command failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_displays_as_command_line() {
        let inv = Invocation::new("ip", &["link", "set", "carte0", "up"]);
        assert_eq!(inv.to_string(), "ip link set carte0 up");
    }

    #[test]
    fn system_command_captures_stdout() {
        let out = SystemCommand.run(&Invocation::new("echo", &["hello"])).unwrap();
        assert_eq!(String::from_utf8_lossy(&out).trim(), "hello");
    }

    #[test]
    fn system_command_feeds_stdin() {
        let inv = Invocation::new("cat", &[]).stdin(b"{\"a\":1}".to_vec());
        assert_eq!(SystemCommand.run(&inv).unwrap(), b"{\"a\":1}");
    }

    #[test]
    fn failing_command_is_a_network_error() {
        let err = SystemCommand.run(&Invocation::new("false", &[])).unwrap_err();
        assert!(matches!(err, CarteError::Network { .. }));
    }

    #[test]
    fn missing_tool_is_not_found() {
        let err = SystemCommand
            .run(&Invocation::new("carte-no-such-tool", &[]))
            .unwrap_err();
        assert!(matches!(err, CarteError::NotFound { .. }));
    }
}
