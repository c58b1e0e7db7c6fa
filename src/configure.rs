/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    dispatch::{BatchResults, DispatchPool, RemoteOptions},
    partition::cluster::{ClusterLayout, ClusterPlan},
};
use anyhow::Context;
use std::{fs, path::Path};
use tracing::info;

/// Fills the plan's values into a configuration command template.
///
/// Recognised placeholders: `{master}`, `{coordinator_cores}`, `{coordinator_memory_mb}`,
/// `{coordinator_memory_overhead_mb}`, `{driver_local_memory_mb}`, `{worker_cores}`,
/// `{worker_memory_mb}`, `{worker_memory_overhead_mb}`, `{worker_instances}`,
/// `{map_parallelism}` and `{reduce_parallelism}`.
pub fn render(template: &str, plan: &ClusterPlan, master: &str) -> String {
    let values = [
        ("{master}", master.to_string()),
        ("{coordinator_cores}", plan.coordinator.cores.to_string()),
        ("{coordinator_memory_mb}", plan.coordinator.memory_mb.to_string()),
        (
            "{coordinator_memory_overhead_mb}",
            plan.coordinator.memory_overhead_mb.to_string(),
        ),
        (
            "{driver_local_memory_mb}",
            plan.driver_local_memory_mb.to_string(),
        ),
        ("{worker_cores}", plan.workers.cores.to_string()),
        ("{worker_memory_mb}", plan.workers.memory_mb.to_string()),
        (
            "{worker_memory_overhead_mb}",
            plan.workers.memory_overhead_mb.to_string(),
        ),
        ("{worker_instances}", plan.workers.instance_count.to_string()),
        ("{map_parallelism}", plan.map_parallelism.to_string()),
        ("{reduce_parallelism}", plan.reduce_parallelism.to_string()),
    ];

    values
        .iter()
        .fold(template.to_string(), |command, (placeholder, value)| {
            command.replace(placeholder, value)
        })
}

/// Sends the rendered configuration command to every node of the cluster.
///
/// The plan is already validated by the time it reaches this point, so a node either gets the
/// whole plan or reports a failure; no node ever sees a partial plan.
pub async fn push_configuration(
    pool: &DispatchPool,
    layout: &ClusterLayout,
    plan: &ClusterPlan,
    template: &str,
    options: &RemoteOptions,
) -> BatchResults {
    let command_line = render(template, plan, &layout.master);
    let nodes = layout.nodes();
    info!("Pushing configuration to {} nodes", nodes.len());

    pool.submit(options.fan_out(&nodes, &command_line)).await
}

/// Writes the plan as JSON for configuration tooling that runs outside scout.
pub fn write_plan(plan: &ClusterPlan, path: &Path) -> anyhow::Result<()> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .context(format!("Unable to create directory {}", dir.display()))?;
    }
    let json = serde_json::to_string_pretty(plan)?;
    fs::write(path, json).context(format!("Unable to write plan to {}", path.display()))?;
    info!("Wrote plan to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{cluster::ClusterPlanner, Capacity, DeploymentMode};

    fn plan() -> anyhow::Result<ClusterPlan> {
        Ok(ClusterPlanner::default().plan(Capacity::new(4, 16384), 2, DeploymentMode::Dedicated)?)
    }

    #[test]
    fn render_replaces_every_placeholder() -> anyhow::Result<()> {
        let plan = plan()?;
        let command = render(
            "conf --master {master} --am {coordinator_cores}/{coordinator_memory_mb}m+{coordinator_memory_overhead_mb}m \
             --driver {driver_local_memory_mb}m --exec {worker_instances}x{worker_cores}/{worker_memory_mb}m+{worker_memory_overhead_mb}m \
             --par {map_parallelism},{reduce_parallelism}",
            &plan,
            "n0",
        );

        assert_eq!(
            command,
            "conf --master n0 --am 1/15360m+1024m --driver 16384m --exec 8x1/3584m+512m --par 16,16"
        );
        Ok(())
    }

    #[test]
    fn plan_is_written_as_json() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("plan.json");

        write_plan(&plan()?, &path)?;

        let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path)?)?;
        assert_eq!(json["workers"]["memory_mb"], 3584);
        assert_eq!(json["coordinator"]["memory_overhead_mb"], 1024);
        assert_eq!(json["mode"], "dedicated");
        Ok(())
    }
}
