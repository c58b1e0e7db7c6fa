/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod transport;

pub use transport::{ShellTransport, Transport};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, error, info, warn};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Node names that address the machine scout runs on.
pub const LOCAL_NODE_NAMES: [&str; 3] = ["localhost", "127.0.0.1", "::1"];

/// Where a command executes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "host", rename_all = "lowercase")]
pub enum Target {
    Local,
    Remote(String),
}
impl Target {
    /// The target for a node name; local names run without ssh.
    pub fn for_node(node: &str) -> Self {
        if LOCAL_NODE_NAMES.contains(&node.trim()) {
            Target::Local
        } else {
            Target::Remote(node.to_string())
        }
    }
}
impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Local => write!(f, "localhost"),
            Target::Remote(host) => write!(f, "{host}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostKeyPolicy {
    pub strict_host_key_checking: bool,
    pub ignore_known_hosts: bool,
}
impl Default for HostKeyPolicy {
    fn default() -> Self {
        Self {
            strict_host_key_checking: false,
            ignore_known_hosts: true,
        }
    }
}

/// A single unit of work for the dispatch pool.
///
/// `timeout` bounds connection establishment for remote targets. `deadline`, when set, bounds
/// the whole execution regardless of target.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub id: String,
    pub target: Target,
    pub command_line: String,
    pub timeout: Duration,
    pub capture_output: bool,
    pub deadline: Option<Duration>,
    pub host_key_policy: HostKeyPolicy,
    pub user: Option<String>,
}
impl Command {
    pub fn local(id: &str, command_line: &str) -> Self {
        Self {
            id: id.to_string(),
            target: Target::Local,
            command_line: command_line.to_string(),
            timeout: DEFAULT_CONNECT_TIMEOUT,
            capture_output: true,
            deadline: None,
            host_key_policy: HostKeyPolicy::default(),
            user: None,
        }
    }

    /// Builds a remote command whose id is derived from the host and command line, so the same
    /// command sent to the same host twice collapses into one record.
    pub fn remote(host: &str, command_line: &str) -> Self {
        Self {
            id: remote_command_id(host, command_line),
            target: Target::Remote(host.to_string()),
            ..Self::local("", command_line)
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }

    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = policy;
        self
    }

    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    pub fn host(&self) -> Option<&str> {
        match &self.target {
            Target::Local => None,
            Target::Remote(host) => Some(host),
        }
    }

    pub fn validate(&self) -> Result<(), ErrorKind> {
        if self.timeout.is_zero() {
            return Err(ErrorKind::invalid(format!(
                "command {} has a zero timeout",
                self.id
            )));
        }
        if self.deadline.is_some_and(|deadline| deadline.is_zero()) {
            return Err(ErrorKind::invalid(format!(
                "command {} has a zero deadline",
                self.id
            )));
        }
        if self.command_line.trim().is_empty() {
            return Err(ErrorKind::invalid(format!(
                "command {} has an empty command line",
                self.id
            )));
        }
        if let Target::Remote(host) = &self.target {
            if host.trim().is_empty() {
                return Err(ErrorKind::invalid(format!(
                    "command {} targets an empty hostname",
                    self.id
                )));
            }
        }
        Ok(())
    }
}

/// `<host>#<first 16 hex digits of the command line's SHA-256>`, the same across builds.
pub fn remote_command_id(host: &str, command_line: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(command_line.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{host}#{}", &digest[..16])
}

/// Connection settings shared by every remote command built for the same purpose.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteOptions {
    pub connect_timeout: Duration,
    pub host_key_policy: HostKeyPolicy,
    pub user: Option<String>,
}
impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            host_key_policy: HostKeyPolicy::default(),
            user: None,
        }
    }
}
impl RemoteOptions {
    /// A command for `node`. Local node names (see [`LOCAL_NODE_NAMES`]) become local commands,
    /// keeping the node-derived id.
    pub fn command(&self, node: &str, command_line: &str) -> Command {
        let command = match Target::for_node(node) {
            Target::Local => {
                Command::local(&remote_command_id(node, command_line), command_line)
            }
            Target::Remote(host) => Command::remote(&host, command_line),
        };
        command
            .with_timeout(self.connect_timeout)
            .with_host_key_policy(self.host_key_policy)
            .with_user(self.user.clone())
    }

    /// One command per node, all running the same command line.
    pub fn fan_out(&self, nodes: &[String], command_line: &str) -> Vec<Command> {
        nodes
            .iter()
            .map(|node| self.command(node, command_line))
            .collect()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorKind {
    #[error("connection to {host} timed out after {timeout_secs}s")]
    ConnectionTimeout { host: String, timeout_secs: u64 },

    #[error("unable to connect to {host}: {reason}")]
    ConnectionFailure { host: String, reason: String },

    #[error("authentication with {host} failed: {reason}")]
    AuthenticationFailure { host: String, reason: String },

    #[error("remote command on {host} failed with exit code {exit_code:?}: {stderr}")]
    RemoteExecutionFailure {
        host: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("local command failed with exit code {exit_code:?}: {stderr}")]
    LocalExecutionFailure {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("command did not finish within {limit_ms}ms")]
    DeadlineExceeded { limit_ms: u64 },

    #[error("invalid command: {reason}")]
    InvalidCommand { reason: String },

    #[error("dispatch task aborted: {reason}")]
    Aborted { reason: String },
}
impl ErrorKind {
    pub fn invalid(reason: impl Into<String>) -> Self {
        ErrorKind::InvalidCommand {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResult {
    pub id: String,
    pub target: Target,
    pub succeeded: bool,
    pub output: Option<String>,
    pub error: Option<ErrorKind>,
}
impl CommandResult {
    fn success(command: &Command, output: Option<String>) -> Self {
        Self {
            id: command.id.clone(),
            target: command.target.clone(),
            succeeded: true,
            output,
            error: None,
        }
    }

    fn failure(id: &str, target: &Target, error: ErrorKind) -> Self {
        Self {
            id: id.to_string(),
            target: target.clone(),
            succeeded: false,
            output: None,
            error: Some(error),
        }
    }
}

pub type BatchResults = HashMap<String, CommandResult>;

/// Failed results ordered by id.
pub fn failures(results: &BatchResults) -> Vec<&CommandResult> {
    results
        .values()
        .filter(|result| !result.succeeded)
        .sorted_by(|a, b| a.id.cmp(&b.id))
        .collect()
}

/// Runs batches of commands with a bounded number in flight.
///
/// Every batch gets its own semaphore, so concurrent `submit` calls never share slots. A batch
/// always drains completely: a failing command is recorded in its result and the next pending
/// command is started.
#[derive(Clone)]
pub struct DispatchPool {
    transport: Arc<dyn Transport>,
    concurrency: usize,
}
impl DispatchPool {
    pub fn new(transport: Arc<dyn Transport>, concurrency: usize) -> Self {
        if concurrency == 0 {
            warn!("Dispatch concurrency of 0 requested, using 1");
        }
        Self {
            transport,
            concurrency: concurrency.max(1),
        }
    }

    pub fn shell(concurrency: usize) -> Self {
        Self::new(Arc::new(ShellTransport::default()), concurrency)
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// A pool over the same transport with a different concurrency bound.
    pub fn with_concurrency(&self, concurrency: usize) -> Self {
        Self::new(self.transport.clone(), concurrency)
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    /// Executes every command in the batch and blocks until all of them have finished.
    ///
    /// # Returns
    ///
    /// Exactly one result per distinct command id. When two commands share an id the one
    /// submitted last replaces the earlier one before anything runs.
    pub async fn submit(&self, batch: Vec<Command>) -> BatchResults {
        let mut commands: HashMap<String, Command> = HashMap::with_capacity(batch.len());
        for command in batch {
            if let Some(previous) = commands.insert(command.id.clone(), command) {
                warn!(
                    "Command id {} submitted twice, replacing command for {}",
                    previous.id, previous.target
                );
            }
        }

        info!(
            "Dispatching {} commands with concurrency {}",
            commands.len(),
            self.concurrency
        );

        let mut pending: HashMap<String, Target> = commands
            .values()
            .map(|command| (command.id.clone(), command.target.clone()))
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set = JoinSet::new();
        for (_, command) in commands {
            let semaphore = semaphore.clone();
            let transport = self.transport.clone();

            join_set.spawn(async move {
                if let Err(err) = command.validate() {
                    warn!("Skipping command {}: {}", command.id, err);
                    return CommandResult::failure(&command.id, &command.target, err);
                }

                // the semaphore is owned by this batch and never closed
                let _permit = semaphore.acquire().await;
                execute(transport.as_ref(), &command).await
            });
        }

        // each task hands back its own entry, nothing else writes to the map
        let mut results = BatchResults::with_capacity(pending.len());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => {
                    pending.remove(&result.id);
                    results.insert(result.id.clone(), result);
                }
                Err(err) => error!("Dispatch task failed to complete: {}", err),
            }
        }

        for (id, target) in pending {
            let err = ErrorKind::Aborted {
                reason: "task panicked or was cancelled".to_string(),
            };
            results.insert(id.clone(), CommandResult::failure(&id, &target, err));
        }

        let failed = results.values().filter(|result| !result.succeeded).count();
        info!(
            "Batch complete: {} succeeded, {} failed",
            results.len() - failed,
            failed
        );

        results
    }
}

async fn execute(transport: &dyn Transport, command: &Command) -> CommandResult {
    debug!("[{}] {} $ {}", command.id, command.target, command.command_line);

    let outcome = match command.deadline {
        Some(limit) => match tokio::time::timeout(limit, transport.execute(command)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ErrorKind::DeadlineExceeded {
                limit_ms: limit.as_millis() as u64,
            }),
        },
        None => transport.execute(command).await,
    };

    match outcome {
        Ok(output) => {
            debug!("[{}] {} succeeded", command.id, command.target);
            let output = if command.capture_output { output } else { None };
            CommandResult::success(command, output)
        }
        Err(err) => {
            warn!("[{}] {} failed: {}", command.id, command.target, err);
            CommandResult::failure(&command.id, &command.target, err)
        }
    }
}
