/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

#![allow(dead_code)]

use async_trait::async_trait;
use scout::dispatch::{Command, ErrorKind, Target, Transport};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

/// In-memory transport that records every command and how many ran at once.
#[derive(Default)]
pub struct RecordingTransport {
    unreachable: HashSet<String>,
    failing_lines: HashSet<String>,
    delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
    calls: Mutex<Vec<Command>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn builder() -> Self {
        Self::default()
    }

    /// Remote commands for `host` fail with a connection timeout.
    pub fn unreachable(mut self, host: &str) -> Self {
        self.unreachable.insert(host.to_string());
        self
    }

    /// Commands with exactly this command line fail with a non-zero exit.
    pub fn failing(mut self, command_line: &str) -> Self {
        self.failing_lines.insert(command_line.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<Command> {
        self.calls.lock().expect("calls lock poisoned").clone()
    }

    pub fn local_calls(&self) -> Vec<Command> {
        self.calls()
            .into_iter()
            .filter(|command| command.target == Target::Local)
            .collect()
    }

    pub fn calls_to(&self, host: &str) -> Vec<Command> {
        self.calls()
            .into_iter()
            .filter(|command| command.host() == Some(host))
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn execute(&self, command: &Command) -> Result<Option<String>, ErrorKind> {
        self.calls
            .lock()
            .expect("calls lock poisoned")
            .push(command.clone());

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let failing = self.failing_lines.contains(&command.command_line);
        match &command.target {
            Target::Remote(host) if self.unreachable.contains(host) => {
                Err(ErrorKind::ConnectionTimeout {
                    host: host.clone(),
                    timeout_secs: command.timeout.as_secs(),
                })
            }
            Target::Remote(host) if failing => Err(ErrorKind::RemoteExecutionFailure {
                host: host.clone(),
                exit_code: Some(1),
                stderr: "command failed".to_string(),
            }),
            Target::Local if failing => Err(ErrorKind::LocalExecutionFailure {
                exit_code: Some(1),
                stderr: "command failed".to_string(),
            }),
            target => Ok(Some(format!("{} ran on {}", command.command_line, target))),
        }
    }
}
