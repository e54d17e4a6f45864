//! Process execution for the exec connectors

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{WgctlError, WgctlResult};
use crate::validation::sanitize_error_message;

/// Runs external tools and returns their combined output
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str]) -> WgctlResult<String>;

    /// Run with `input` written to the child's stdin
    async fn run_with_input(&self, program: &str, args: &[&str], input: &str) -> WgctlResult<String>;

    /// Whether commands are elevated through `sudo`
    fn elevated(&self) -> bool {
        false
    }
}

/// Spawns real processes, optionally through `sudo -n`
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    sudo: bool,
}

impl ProcessRunner {
    pub fn new(sudo: bool) -> Self {
        Self { sudo }
    }

    fn command(&self, program: &str, args: &[&str]) -> Command {
        let mut cmd = if self.sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg(program);
            cmd
        } else {
            Command::new(program)
        };
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn execute(&self, program: &str, args: &[&str], input: Option<&str>) -> WgctlResult<String> {
        let cmdline = command_line(program, args);
        debug!("Running: {}", cmdline);

        let mut cmd = self.command(program, args);
        if input.is_some() {
            cmd.stdin(Stdio::piped());
        }

        let mut child = cmd.spawn().map_err(|e| WgctlError::CommandFailed {
            cmd: cmdline.clone(),
            code: None,
            output: e.to_string(),
        })?;

        if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(input.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        Err(failure(&cmdline, output.status.code(), &combined, self.sudo))
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[&str]) -> WgctlResult<String> {
        self.execute(program, args, None).await
    }

    async fn run_with_input(&self, program: &str, args: &[&str], input: &str) -> WgctlResult<String> {
        self.execute(program, args, Some(input)).await
    }

    fn elevated(&self) -> bool {
        self.sudo
    }
}

/// `wg-quick up /etc/wireguard/wg0.conf` style rendering, binary path stripped
pub fn command_line(program: &str, args: &[&str]) -> String {
    let binary = program.rsplit('/').next().unwrap_or(program);
    if args.is_empty() {
        binary.to_string()
    } else {
        format!("{} {}", binary, args.join(" "))
    }
}

fn failure(display: &str, code: Option<i32>, output: &str, sudo: bool) -> WgctlError {
    let trimmed = sanitize_error_message(output);
    if sudo {
        let lower = trimmed.to_lowercase();
        if lower.contains("a password is required") || lower.contains("no tty present") {
            return WgctlError::CommandFailed {
                cmd: display.to_string(),
                code,
                output: "passwordless sudo is required".to_string(),
            };
        }
    }
    let output = if trimmed.is_empty() {
        match code {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        }
    } else {
        trimmed
    };
    WgctlError::CommandFailed {
        cmd: display.to_string(),
        code,
        output,
    }
}

/// Output of a failed command, lowercased, for "does not exist" style checks
pub fn failure_text(error: &WgctlError) -> Option<String> {
    match error {
        WgctlError::CommandFailed { output, .. } => Some(output.to_lowercase()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line() {
        assert_eq!(
            command_line("/usr/bin/wg-quick", &["up", "/etc/wireguard/wg0.conf"]),
            "wg-quick up /etc/wireguard/wg0.conf"
        );
        assert_eq!(command_line("wg", &[]), "wg");
    }

    #[test]
    fn test_failure_formats() {
        let err = failure("wg show wg9 dump", Some(1), "Unable to access interface: No such device\n", false);
        assert_eq!(
            err.to_string(),
            "command failed: wg show wg9 dump: Unable to access interface: No such device"
        );

        let err = failure("wg-quick up wg0", Some(1), "sudo: a password is required", true);
        assert!(err.to_string().contains("passwordless sudo is required"));

        let err = failure("true", Some(3), "", false);
        assert!(err.to_string().ends_with("exit status 3"));
    }

    #[tokio::test]
    async fn test_process_runner_captures_output() {
        let runner = ProcessRunner::new(false);
        let out = runner.run("echo", &["hello"]).await.unwrap();
        assert_eq!(out.trim(), "hello");

        let out = runner.run_with_input("cat", &[], "piped").await.unwrap();
        assert_eq!(out, "piped");

        let err = runner.run("sh", &["-c", "echo boom >&2; exit 2"]).await.unwrap_err();
        match err {
            WgctlError::CommandFailed { code, output, .. } => {
                assert_eq!(code, Some(2));
                assert_eq!(output, "boom");
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
