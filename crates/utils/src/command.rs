//! Synchronous helpers for running external commands, capturing
//! stderr into the returned error on failure.

use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

/// Render a command for diagnostics, shell quoted.
pub fn command_display(cmd: &Command) -> String {
    let parts: Vec<String> = std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    shlex::try_join(parts.iter().map(|s| s.as_str())).unwrap_or_else(|_| parts.join(" "))
}

/// Extension methods on [`std::process::Command`]. All of these block
/// until the child exits; a non-zero exit status becomes an `Err` that
/// names the command, its status and the tail of its stderr.
pub trait CommandRunExt {
    /// Log (at trace level) the command that is about to run.
    fn log_trace(&mut self) -> &mut Self;

    /// Run the command, discarding stdout.
    fn run(&mut self) -> Result<()>;

    /// Run the command, capturing stdout as a UTF-8 string.
    fn run_get_string(&mut self) -> Result<String>;

    /// Run the command, deserializing stdout as JSON.
    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T>;
}

fn run_get_output(cmd: &mut Command) -> Result<Vec<u8>> {
    let desc = command_display(cmd);
    let output = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .with_context(|| format!("Spawning {desc}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // Keep the diagnostic to one line; the full stderr is rarely useful
        // beyond its tail.
        let tail: String = stderr
            .lines()
            .rev()
            .take(3)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("; ");
        anyhow::bail!("`{desc}` failed ({}): {}", output.status, tail.trim());
    }
    Ok(output.stdout)
}

impl CommandRunExt for Command {
    fn log_trace(&mut self) -> &mut Self {
        tracing::trace!("exec: {}", command_display(self));
        self
    }

    fn run(&mut self) -> Result<()> {
        self.log_trace();
        run_get_output(self).map(|_| ())
    }

    fn run_get_string(&mut self) -> Result<String> {
        self.log_trace();
        let out = run_get_output(self)?;
        String::from_utf8(out).context("Command output was not UTF-8")
    }

    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        self.log_trace();
        let desc = command_display(self);
        let out = run_get_output(self)?;
        serde_json::from_slice(&out).with_context(|| format!("Parsing JSON from {desc}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_success_and_failure() {
        Command::new("true").run().unwrap();
        let e = Command::new("false").run().unwrap_err();
        assert!(e.to_string().contains("false"), "{e}");
    }

    #[test]
    fn test_failure_captures_stderr() {
        let e = Command::new("sh")
            .args(["-c", "echo oops >&2; exit 3"])
            .run()
            .unwrap_err();
        let msg = e.to_string();
        assert!(msg.contains("oops"), "{msg}");
        assert!(msg.contains("exit status: 3"), "{msg}");
    }

    #[test]
    fn test_run_get_string() {
        let s = Command::new("echo").arg("hello").run_get_string().unwrap();
        assert_eq!(s.trim(), "hello");
    }

    #[test]
    fn test_run_and_parse_json() {
        #[derive(serde::Deserialize)]
        struct V {
            n: u32,
        }
        let v: V = Command::new("echo")
            .arg(r#"{"n": 7}"#)
            .run_and_parse_json()
            .unwrap();
        assert_eq!(v.n, 7);
    }

    #[test]
    fn test_command_display_quotes() {
        let mut c = Command::new("mkfs.fat");
        c.args(["-n", "two words"]);
        assert_eq!(command_display(&c), "mkfs.fat -n 'two words'");
    }
}
