/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{Command, ErrorKind, Target};
use async_trait::async_trait;
use std::{process::Stdio, time::Duration};
use tracing::trace;

/// The exit status ssh reserves for its own errors, as opposed to the remote command's.
const SSH_ERROR_STATUS: i32 = 255;

/// Delivers a single command to its target.
///
/// Implementations return the captured standard output on success. Every failure mode is
/// reported as an [`ErrorKind`], never as a panic, because the pool records it against the
/// command and moves on.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, command: &Command) -> Result<Option<String>, ErrorKind>;
}

/// Runs local commands through `sh -c` and remote commands through the `ssh` client.
#[derive(Debug, Clone)]
pub struct ShellTransport {
    ssh_program: String,
}
impl Default for ShellTransport {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
        }
    }
}
impl ShellTransport {
    pub fn with_ssh_program(ssh_program: &str) -> Self {
        Self {
            ssh_program: ssh_program.to_string(),
        }
    }

    async fn run_local(&self, command: &Command) -> Result<Option<String>, ErrorKind> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command.command_line)
            .stdin(Stdio::null())
            .stdout(stdout_for(command))
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| ErrorKind::LocalExecutionFailure {
                exit_code: None,
                stderr: format!("failed to spawn sh: {err}"),
            })?;

        if output.status.success() {
            Ok(capture(command, &output.stdout))
        } else {
            Err(ErrorKind::LocalExecutionFailure {
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn run_remote(&self, command: &Command, host: &str) -> Result<Option<String>, ErrorKind> {
        let args = ssh_args(command, host);
        trace!("{} {}", self.ssh_program, args.join(" "));

        let output = tokio::process::Command::new(&self.ssh_program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(stdout_for(command))
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| ErrorKind::ConnectionFailure {
                host: host.to_string(),
                reason: format!("failed to spawn {}: {err}", self.ssh_program),
            })?;

        if output.status.success() {
            return Ok(capture(command, &output.stdout));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(classify_ssh_failure(
            host,
            command.timeout,
            output.status.code(),
            &stderr,
        ))
    }
}

#[async_trait]
impl Transport for ShellTransport {
    async fn execute(&self, command: &Command) -> Result<Option<String>, ErrorKind> {
        match &command.target {
            Target::Local => self.run_local(command).await,
            Target::Remote(host) => self.run_remote(command, host).await,
        }
    }
}

fn stdout_for(command: &Command) -> Stdio {
    if command.capture_output {
        Stdio::piped()
    } else {
        Stdio::null()
    }
}

fn capture(command: &Command, stdout: &[u8]) -> Option<String> {
    command
        .capture_output
        .then(|| String::from_utf8_lossy(stdout).to_string())
}

/// Builds the ssh argument vector for the command. The command line is passed as a single
/// argument so the remote login shell interprets it.
pub fn ssh_args(command: &Command, host: &str) -> Vec<String> {
    // ssh rejects a ConnectTimeout of 0
    let connect_timeout = command.timeout.as_secs().max(1);
    let strict = if command.host_key_policy.strict_host_key_checking {
        "yes"
    } else {
        "no"
    };

    let mut args = vec![
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={connect_timeout}"),
        "-o".to_string(),
        format!("StrictHostKeyChecking={strict}"),
    ];
    if command.host_key_policy.ignore_known_hosts {
        args.push("-o".to_string());
        args.push("UserKnownHostsFile=/dev/null".to_string());
    }
    if let Some(user) = &command.user {
        args.push("-l".to_string());
        args.push(user.clone());
    }
    args.push(host.to_string());
    args.push(command.command_line.clone());
    args
}

/// Maps a failed ssh invocation onto the error taxonomy.
///
/// ssh exits with 255 when it fails itself; any other non-zero status belongs to the remote
/// command.
pub fn classify_ssh_failure(
    host: &str,
    connect_timeout: Duration,
    exit_code: Option<i32>,
    stderr: &str,
) -> ErrorKind {
    let stderr = stderr.trim();
    if exit_code != Some(SSH_ERROR_STATUS) {
        return ErrorKind::RemoteExecutionFailure {
            host: host.to_string(),
            exit_code,
            stderr: stderr.to_string(),
        };
    }

    let lowered = stderr.to_lowercase();
    let reason = stderr.lines().last().unwrap_or_default().to_string();
    if lowered.contains("timed out") {
        ErrorKind::ConnectionTimeout {
            host: host.to_string(),
            timeout_secs: connect_timeout.as_secs(),
        }
    } else if lowered.contains("permission denied")
        || lowered.contains("host key verification failed")
        || lowered.contains("too many authentication failures")
    {
        ErrorKind::AuthenticationFailure {
            host: host.to_string(),
            reason,
        }
    } else {
        ErrorKind::ConnectionFailure {
            host: host.to_string(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::HostKeyPolicy;

    #[test]
    fn ssh_args_follow_the_host_key_policy() {
        let command = Command::remote("n1", "uptime").with_timeout(Duration::from_secs(60));
        let args = ssh_args(&command, "n1");
        assert_eq!(
            args,
            [
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=60",
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "n1",
                "uptime"
            ]
        );

        let strict = command
            .with_host_key_policy(HostKeyPolicy {
                strict_host_key_checking: true,
                ignore_known_hosts: false,
            })
            .with_user(Some("ec2-user".to_string()));
        let args = ssh_args(&strict, "n1");
        assert!(args.contains(&"StrictHostKeyChecking=yes".to_string()));
        assert!(!args.contains(&"UserKnownHostsFile=/dev/null".to_string()));
        assert_eq!(args[args.len() - 4..], ["-l", "ec2-user", "n1", "uptime"]);
    }

    #[test]
    fn sub_second_timeouts_round_up() {
        let command = Command::remote("n1", "uptime").with_timeout(Duration::from_millis(300));
        assert!(ssh_args(&command, "n1").contains(&"ConnectTimeout=1".to_string()));
    }

    #[test]
    fn ssh_failures_are_classified() {
        let timeout = Duration::from_secs(60);

        let err = classify_ssh_failure(
            "bad-host",
            timeout,
            Some(255),
            "ssh: connect to host bad-host port 22: Connection timed out\n",
        );
        assert_eq!(
            err,
            ErrorKind::ConnectionTimeout {
                host: "bad-host".to_string(),
                timeout_secs: 60
            }
        );

        let err = classify_ssh_failure("n1", timeout, Some(255), "Permission denied (publickey).");
        assert!(matches!(err, ErrorKind::AuthenticationFailure { .. }));

        let err = classify_ssh_failure(
            "nope",
            timeout,
            Some(255),
            "ssh: Could not resolve hostname nope: Name or service not known",
        );
        assert!(matches!(err, ErrorKind::ConnectionFailure { .. }));

        let err = classify_ssh_failure("n1", timeout, Some(1), "pkill: no process found");
        assert_eq!(
            err,
            ErrorKind::RemoteExecutionFailure {
                host: "n1".to_string(),
                exit_code: Some(1),
                stderr: "pkill: no process found".to_string()
            }
        );
    }

    #[cfg(target_family = "unix")]
    #[tokio::test]
    async fn missing_ssh_program_is_a_connection_failure() {
        let transport = ShellTransport::with_ssh_program("/nonexistent/ssh");
        let command = Command::remote("n1", "uptime");

        let err = transport.execute(&command).await.unwrap_err();
        assert!(matches!(err, ErrorKind::ConnectionFailure { .. }));
    }
}
