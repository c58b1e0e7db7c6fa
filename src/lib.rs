/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod clap_args;
pub mod config;
pub mod configure;
pub mod dispatch;
pub mod monitoring;
pub mod partition;
pub mod summary;
pub mod workload;

use anyhow::{anyhow, Context};
use config::Config;
use dispatch::{BatchResults, DispatchPool, Transport};
use itertools::Itertools;
use monitoring::Monitor;
use partition::cluster::ClusterPlan;
use std::{path::PathBuf, sync::Arc};
use tracing::{info, warn};
use workload::BenchmarkReport;

/// Base name of the per-node telemetry exports inside a workload's output directory.
pub const TELEMETRY_FILE_NAME: &str = "sar.csv";

/// Plans the cluster described by the configuration. Nothing is sent to any node.
pub fn cluster_plan(config: &Config) -> anyhow::Result<ClusterPlan> {
    let layout = config.layout();
    layout.check_mode();

    let capacity = config.node_capacity()?;
    let worker_nodes = u32::try_from(layout.sorted_workers().len())?;
    let plan = config
        .cluster_planner()
        .plan(capacity, worker_nodes, layout.mode)
        .context("Unable to plan cluster resources")?;
    Ok(plan)
}

/// Plans the cluster, then pushes the rendered `[configure]` command to every node.
///
/// Returns without contacting any node when planning fails.
pub async fn configure_cluster(
    config: &Config,
    transport: Arc<dyn Transport>,
) -> anyhow::Result<(ClusterPlan, BatchResults)> {
    let configure = config
        .configure
        .as_ref()
        .context("No [configure] command in config")?;
    let plan = cluster_plan(config)?;

    let pool = DispatchPool::new(transport, config.ssh.concurrency);
    let results = configure::push_configuration(
        &pool,
        &config.layout(),
        &plan,
        &configure.command,
        &config.remote_options(),
    )
    .await;
    Ok((plan, results))
}

/// Runs the same command line on each of `nodes`, or on every cluster node when empty.
pub async fn exec(
    config: &Config,
    transport: Arc<dyn Transport>,
    nodes: &[String],
    command_line: &str,
) -> BatchResults {
    let nodes = if nodes.is_empty() {
        config.layout().nodes()
    } else {
        nodes.to_vec()
    };

    let pool = DispatchPool::new(transport, config.ssh.concurrency);
    pool.submit(config.remote_options().fan_out(&nodes, command_line))
        .await
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub monitoring: bool,
    pub output_dir: Option<PathBuf>,
}

/// Runs a benchmark end to end: plan, configuration push, telemetry session around the workload
/// and finally the report.
///
/// A failed plan or configuration push stops the run before the workload starts. Outputs of an
/// earlier run are cleared from the output directory before the workload starts. Telemetry
/// failures are only recorded in the report.
pub async fn run_benchmark(
    config: &Config,
    transport: Arc<dyn Transport>,
    workload_name: &str,
    options: &RunOptions,
) -> anyhow::Result<BenchmarkReport> {
    let workload = config.find_workload(workload_name)?;
    let output_dir = options
        .output_dir
        .clone()
        .unwrap_or_else(|| workload.output_dir.clone());

    let plan = cluster_plan(config)?;
    if let Some(configure) = &config.configure {
        let pool = DispatchPool::new(transport.clone(), config.ssh.concurrency);
        let results = configure::push_configuration(
            &pool,
            &config.layout(),
            &plan,
            &configure.command,
            &config.remote_options(),
        )
        .await;

        let failed = dispatch::failures(&results);
        if !failed.is_empty() {
            return Err(anyhow!(
                "Configuration push failed on {}",
                failed.iter().map(|result| &result.target).join(", ")
            ));
        }
    }

    let telemetry_base = output_dir.join(TELEMETRY_FILE_NAME);
    workload::prepare_output_dir(&output_dir, &telemetry_base)?;

    let pool = DispatchPool::new(transport.clone(), 1);
    let (run, session) = if options.monitoring && config.monitoring.enabled {
        let monitor = Monitor::new(transport, config.session_options());
        let (run, session) = monitor
            .observe(
                &config.layout().sorted_workers(),
                &telemetry_base,
                config.monitoring.interval,
                workload::execute(&pool, workload),
            )
            .await;
        (run, Some(session))
    } else {
        info!("Telemetry disabled for workload {}", workload.name);
        (workload::execute(&pool, workload).await, None)
    };

    if let Some(session) = &session {
        if !session.is_complete() {
            warn!(
                "Telemetry incomplete on {} nodes",
                session.failures().iter().map(|r| &r.target).unique().count()
            );
        }
    }

    workload::write_log(&run, &output_dir)?;
    let report = BenchmarkReport::new(&run, session.as_ref());
    report.write(&output_dir)?;
    Ok(report)
}
