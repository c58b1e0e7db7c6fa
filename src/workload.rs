/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    config::Workload,
    dispatch::{Command, CommandResult, DispatchPool, ErrorKind},
    monitoring::{self, NodeOutput, SessionReport},
};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Instant,
};
use tracing::{debug, error, info};

pub const REPORT_FILE_NAME: &str = "report.json";
pub const LOG_FILE_NAME: &str = "workload.log";

/// One execution of a workload command.
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadRun {
    pub workload: String,
    pub command: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub result: CommandResult,
}
impl WorkloadRun {
    pub fn completed(&self) -> bool {
        self.result.succeeded
    }
}

/// Runs the workload on this machine through the dispatch pool, honouring its timeout.
pub async fn execute(pool: &DispatchPool, workload: &Workload) -> WorkloadRun {
    let command =
        Command::local(&workload.name, &workload.command).with_deadline(workload.deadline());

    info!("Running workload {}", workload.name);
    let start_time = Utc::now();
    let started = Instant::now();
    let mut results = pool.submit(vec![command.clone()]).await;
    let elapsed_secs = started.elapsed().as_secs_f64();
    let end_time = Utc::now();

    let result = results.remove(&command.id).unwrap_or_else(|| CommandResult {
        id: command.id.clone(),
        target: command.target.clone(),
        succeeded: false,
        output: None,
        error: Some(ErrorKind::Aborted {
            reason: "no result was recorded".to_string(),
        }),
    });

    match &result.error {
        None => info!("Workload {} finished in {:.3}s", workload.name, elapsed_secs),
        Some(err) => error!("Workload {} failed: {}", workload.name, err),
    }

    WorkloadRun {
        workload: workload.name.clone(),
        command: workload.command.clone(),
        start_time,
        end_time,
        elapsed_secs,
        result,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionFailure {
    pub node: String,
    pub error: Option<ErrorKind>,
}

/// Telemetry side of a benchmark: where each node exported to, and which nodes misbehaved.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySummary {
    pub interval: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub per_node_output_paths: Vec<NodeOutput>,
    pub failures: Vec<SessionFailure>,
}
impl From<&SessionReport> for TelemetrySummary {
    fn from(report: &SessionReport) -> Self {
        Self {
            interval: report.interval,
            start_time: report.start_time,
            end_time: report.end_time,
            elapsed_secs: report.elapsed_secs(),
            per_node_output_paths: report.per_node_output_paths.clone(),
            failures: report
                .failures()
                .into_iter()
                .map(|failed| SessionFailure {
                    node: failed.target.to_string(),
                    error: failed.error.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    pub run_id: String,
    pub workload: String,
    pub command: String,
    pub completed: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub error: Option<ErrorKind>,
    pub telemetry: Option<TelemetrySummary>,
}
impl BenchmarkReport {
    pub fn new(run: &WorkloadRun, session: Option<&SessionReport>) -> Self {
        Self {
            run_id: nanoid::nanoid!(5),
            workload: run.workload.clone(),
            command: run.command.clone(),
            completed: run.completed(),
            start_time: run.start_time,
            end_time: run.end_time,
            elapsed_secs: run.elapsed_secs,
            error: run.result.error.clone(),
            telemetry: session.map(TelemetrySummary::from),
        }
    }

    /// Writes `report.json` into `dir`, creating it if needed, and returns the file's path.
    pub fn write(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(dir).context(format!("Unable to create directory {}", dir.display()))?;
        let path = dir.join(REPORT_FILE_NAME);
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).context(format!("Unable to write report to {}", path.display()))?;
        info!("Wrote benchmark report to {}", path.display());
        Ok(path)
    }
}

/// Saves whatever the workload printed next to its report.
pub fn write_log(run: &WorkloadRun, dir: &Path) -> anyhow::Result<Option<PathBuf>> {
    let Some(output) = &run.result.output else {
        return Ok(None);
    };
    fs::create_dir_all(dir).context(format!("Unable to create directory {}", dir.display()))?;
    let path = dir.join(LOG_FILE_NAME);
    fs::write(&path, output).context(format!("Unable to write log to {}", path.display()))?;
    Ok(Some(path))
}

/// Creates `dir` and removes what an earlier run left behind in it: the report, the workload
/// log, the collector's data file and every per-node export derived from `telemetry_base`.
///
/// Files scout did not write are left alone.
pub fn prepare_output_dir(dir: &Path, telemetry_base: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(dir).context(format!("Unable to create directory {}", dir.display()))?;

    let export = telemetry_base.file_name().map(|name| name.to_string_lossy().to_string());
    let stem = telemetry_base
        .file_stem()
        .map(|stem| format!("{}_node", stem.to_string_lossy()))
        .unwrap_or_default();
    let extension = telemetry_base
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    let data = monitoring::data_path(telemetry_base)
        .file_name()
        .map(|name| name.to_string_lossy().to_string());

    for entry in fs::read_dir(dir).context(format!("Unable to read {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let stale = name == REPORT_FILE_NAME
            || name == LOG_FILE_NAME
            || Some(&name) == export.as_ref()
            || Some(&name) == data.as_ref()
            || (!stem.is_empty()
                && name.len() > stem.len() + extension.len()
                && name.starts_with(&stem)
                && name.ends_with(&extension)
                && name[stem.len()..name.len() - extension.len()]
                    .chars()
                    .all(|c| c.is_ascii_digit()));
        if stale && entry.file_type()?.is_file() {
            debug!("Removing stale {}", entry.path().display());
            fs::remove_file(entry.path())
                .context(format!("Unable to remove {}", entry.path().display()))?;
        }
    }
    Ok(())
}
