/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::dispatch::{
    self, BatchResults, CommandResult, DispatchPool, RemoteOptions, Transport,
};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    future::Future,
    panic::AssertUnwindSafe,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{info, warn};

/// Connection timeout used when starting and stopping collectors. Nodes under heavy load can be
/// slow to accept connections.
pub const SESSION_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Command templates for the per-node telemetry collector.
///
/// Placeholders: `{data}` is the collector's raw data file, `{output}` the per-node tabular
/// export and `{interval}` the sampling interval in seconds.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryCommands {
    pub prelude: Option<String>,
    pub start: String,
    pub stop: String,
    pub export: String,
}
impl Default for TelemetryCommands {
    fn default() -> Self {
        Self {
            prelude: None,
            start: "mysar start --output={data} --interval={interval}".to_string(),
            stop: "mysar stop".to_string(),
            export: "mysar export --input={data} --output={output} --interval={interval}"
                .to_string(),
        }
    }
}
impl TelemetryCommands {
    pub fn start_command(&self, data: &Path, interval: u64) -> String {
        self.with_prelude(&render(&self.start, data, None, interval))
    }

    pub fn stop_and_export_command(&self, data: &Path, output: &Path, interval: u64) -> String {
        let stop = render(&self.stop, data, Some(output), interval);
        let export = render(&self.export, data, Some(output), interval);
        self.with_prelude(&format!("{stop}; {export}"))
    }

    fn with_prelude(&self, command: &str) -> String {
        match &self.prelude {
            Some(prelude) if !prelude.trim().is_empty() => format!("{prelude}; {command}"),
            _ => command.to_string(),
        }
    }
}

fn render(template: &str, data: &Path, output: Option<&Path>, interval: u64) -> String {
    let rendered = template
        .replace("{data}", &data.to_string_lossy())
        .replace("{interval}", &interval.to_string());
    match output {
        Some(output) => rendered.replace("{output}", &output.to_string_lossy()),
        None => rendered,
    }
}

/// Path of the tabular export written by the node at `index` (1-based): `_node<index>` is
/// inserted before the extension, e.g. `/out/sar.csv` becomes `/out/sar_node1.csv`.
pub fn node_output_path(base: &Path, index: usize) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();
    let file_name = match base.extension() {
        Some(ext) => format!("{stem}_node{index}.{}", ext.to_string_lossy()),
        None => format!("{stem}_node{index}"),
    };
    base.with_file_name(file_name)
}

/// The collector's raw data file, kept next to the export as `<base>.dat`.
pub fn data_path(base: &Path) -> PathBuf {
    let mut data = base.as_os_str().to_owned();
    data.push(".dat");
    PathBuf::from(data)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeOutput {
    pub node: String,
    pub path: PathBuf,
}

/// The set of nodes being observed, with their output locations, between acquire and release.
#[derive(Debug)]
pub struct MonitoringSession {
    node_set: Vec<String>,
    output_base_path: PathBuf,
    data_path: PathBuf,
    interval: u64,
    concurrency: usize,
    per_node_output_paths: Vec<NodeOutput>,
    start_time: DateTime<Utc>,
    started: Instant,
    start_results: BatchResults,
    released: bool,
}
impl MonitoringSession {
    pub fn node_set(&self) -> &[String] {
        &self.node_set
    }

    pub fn output_base_path(&self) -> &Path {
        &self.output_base_path
    }

    pub fn per_node_output_paths(&self) -> &[NodeOutput] {
        &self.per_node_output_paths
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn start_results(&self) -> &BatchResults {
        &self.start_results
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }
}
impl Drop for MonitoringSession {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                "Monitoring session dropped without release, collectors may still be running on {}",
                self.node_set.join(", ")
            );
        }
    }
}

/// Everything a closed session recorded.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub node_set: Vec<String>,
    pub interval: u64,
    pub per_node_output_paths: Vec<NodeOutput>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub elapsed: Duration,
    pub start_results: BatchResults,
    pub stop_results: BatchResults,
}
impl SessionReport {
    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }

    /// Per-command failures from both ends of the session, ordered by id.
    pub fn failures(&self) -> Vec<&CommandResult> {
        let mut failed = dispatch::failures(&self.start_results);
        failed.extend(dispatch::failures(&self.stop_results));
        failed
    }

    pub fn is_complete(&self) -> bool {
        self.failures().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub remote: RemoteOptions,
    pub commands: TelemetryCommands,
}
impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            remote: RemoteOptions {
                connect_timeout: SESSION_CONNECT_TIMEOUT,
                ..Default::default()
            },
            commands: TelemetryCommands::default(),
        }
    }
}

/// Brackets workloads with telemetry collection across a set of nodes.
///
/// Starting and stopping are best effort: a node that fails either step is recorded in the
/// session's results and never aborts the session or the workload it brackets.
pub struct Monitor {
    transport: Arc<dyn Transport>,
    options: SessionOptions,
}
impl Monitor {
    pub fn new(transport: Arc<dyn Transport>, options: SessionOptions) -> Self {
        Self { transport, options }
    }

    /// Starts a collector on every node at once and returns the open session.
    ///
    /// A node listed more than once is observed once, under its first index. `localhost` runs
    /// the collector on this machine without ssh.
    ///
    /// # Arguments
    ///
    /// * `concurrency` - Bound on simultaneous connections, every node at once when `None`.
    pub async fn acquire(
        &self,
        node_set: &[String],
        output_base_path: &Path,
        interval: u64,
        concurrency: Option<usize>,
    ) -> MonitoringSession {
        let distinct = node_set.iter().unique().cloned().collect_vec();
        if distinct.len() < node_set.len() {
            warn!(
                "Node set lists {} duplicate nodes, observing each node once",
                node_set.len() - distinct.len()
            );
        }
        let node_set = distinct.as_slice();

        let concurrency = concurrency.unwrap_or(node_set.len()).max(1);
        let data = data_path(output_base_path);
        let per_node_output_paths = node_set
            .iter()
            .enumerate()
            .map(|(i, node)| NodeOutput {
                node: node.clone(),
                path: node_output_path(output_base_path, i + 1),
            })
            .collect();

        let command_line = self.options.commands.start_command(&data, interval);
        info!(
            "Starting telemetry on {} nodes, interval {}s",
            node_set.len(),
            interval
        );
        let start_results = self
            .pool(concurrency)
            .submit(self.options.remote.fan_out(node_set, &command_line))
            .await;
        for failed in dispatch::failures(&start_results) {
            warn!("Telemetry did not start on {}: {:?}", failed.target, failed.error);
        }

        MonitoringSession {
            node_set: node_set.to_vec(),
            output_base_path: output_base_path.to_path_buf(),
            data_path: data,
            interval,
            concurrency,
            per_node_output_paths,
            start_time: Utc::now(),
            started: Instant::now(),
            start_results,
            released: false,
        }
    }

    /// Stops and exports telemetry on every node of the session, including nodes that failed
    /// to start.
    pub async fn release(&self, mut session: MonitoringSession) -> SessionReport {
        let end_time = Utc::now();
        let elapsed = session.started.elapsed();

        let commands = session
            .per_node_output_paths
            .iter()
            .map(|output| {
                let command_line = self.options.commands.stop_and_export_command(
                    &session.data_path,
                    &output.path,
                    session.interval,
                );
                self.options.remote.command(&output.node, &command_line)
            })
            .collect();

        info!(
            "Stopping telemetry on {} nodes after {:.3}s",
            session.node_set.len(),
            elapsed.as_secs_f64()
        );
        let stop_results = self.pool(session.concurrency).submit(commands).await;
        for failed in dispatch::failures(&stop_results) {
            warn!("Telemetry did not stop cleanly on {}: {:?}", failed.target, failed.error);
        }

        session.released = true;
        SessionReport {
            node_set: std::mem::take(&mut session.node_set),
            interval: session.interval,
            per_node_output_paths: std::mem::take(&mut session.per_node_output_paths),
            start_time: session.start_time,
            end_time,
            elapsed,
            start_results: std::mem::take(&mut session.start_results),
            stop_results,
        }
    }

    /// Runs `workload` inside a session. The session is released on every exit path, including
    /// a panicking workload, whose panic is resumed once the collectors are stopped.
    pub async fn observe<F, T>(
        &self,
        node_set: &[String],
        output_base_path: &Path,
        interval: u64,
        workload: F,
    ) -> (T, SessionReport)
    where
        F: Future<Output = T>,
    {
        let session = self
            .acquire(node_set, output_base_path, interval, None)
            .await;
        let outcome = AssertUnwindSafe(workload).catch_unwind().await;
        let report = self.release(session).await;

        match outcome {
            Ok(value) => (value, report),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    fn pool(&self, concurrency: usize) -> DispatchPool {
        DispatchPool::new(self.transport.clone(), concurrency)
    }
}
