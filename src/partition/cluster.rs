/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{
    Capacity, DeploymentMode, OverheadAccounting, PlanError, Planner, RolePlan, RoleRequest,
};
use itertools::Itertools;
use serde::Serialize;
use tracing::{info, warn};

pub const COORDINATOR_ROLE: &str = "coordinator";
pub const WORKER_ROLE: &str = "worker";

/// Which hosts make up the cluster and where the coordinator lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterLayout {
    pub master: String,
    pub workers: Vec<String>,
    pub mode: DeploymentMode,
}
impl ClusterLayout {
    /// Workers in sorted order, which fixes the node numbering of telemetry output files.
    pub fn sorted_workers(&self) -> Vec<String> {
        self.workers.iter().sorted().dedup().cloned().collect()
    }

    /// Every distinct host, master first.
    pub fn nodes(&self) -> Vec<String> {
        std::iter::once(&self.master)
            .chain(self.sorted_workers().iter())
            .unique()
            .cloned()
            .collect()
    }

    /// Warns when the explicit deployment mode disagrees with where the master is listed.
    pub fn check_mode(&self) {
        let master_is_worker = self.workers.contains(&self.master);
        match (self.mode, master_is_worker) {
            (DeploymentMode::Dedicated, true) => warn!(
                "Dedicated mode but master {} is also listed as a worker",
                self.master
            ),
            (DeploymentMode::Colocated, false) if self.workers.len() > 1 => warn!(
                "Colocated mode but master {} is not listed as a worker",
                self.master
            ),
            _ => {}
        }
    }
}

/// The resource split for a whole cluster, handed to the configuration templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterPlan {
    pub mode: DeploymentMode,
    pub node_capacity: Capacity,
    pub worker_nodes: u32,
    pub coordinator: RolePlan,
    /// Per-instance allocation; `instance_count` is the cluster-wide total.
    pub workers: RolePlan,
    pub workers_per_node: u32,
    /// Memory for a coordinator process launched outside the resource manager.
    pub driver_local_memory_mb: u64,
    pub map_parallelism: u32,
    pub reduce_parallelism: u32,
}
impl ClusterPlan {
    pub fn roles(&self) -> Vec<RolePlan> {
        vec![self.coordinator.clone(), self.workers.clone()]
    }

    pub fn total_cores(&self) -> u64 {
        u64::from(self.node_capacity.cores) * u64::from(self.physical_nodes())
    }

    pub fn total_memory_mb(&self) -> u64 {
        self.node_capacity
            .memory_mb
            .saturating_mul(u64::from(self.physical_nodes()))
    }

    pub fn cores_in_use(&self) -> u64 {
        self.coordinator
            .total_cores()
            .saturating_add(self.workers.total_cores())
    }

    pub fn memory_in_use_mb(&self) -> u64 {
        self.coordinator
            .total_memory_mb()
            .saturating_add(self.workers.total_memory_mb())
    }

    fn physical_nodes(&self) -> u32 {
        match self.mode {
            DeploymentMode::Colocated => self.worker_nodes,
            DeploymentMode::Dedicated => self.worker_nodes.saturating_add(1),
        }
    }
}

/// Derives a [`ClusterPlan`] from per-node capacity and the number of worker nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterPlanner {
    pub coordinator_cores: u32,
    pub worker_cores: u32,
    pub accounting: OverheadAccounting,
}
impl Default for ClusterPlanner {
    fn default() -> Self {
        Self {
            coordinator_cores: 1,
            worker_cores: 1,
            accounting: OverheadAccounting::Single,
        }
    }
}
impl ClusterPlanner {
    pub fn plan(
        &self,
        node_capacity: Capacity,
        worker_nodes: u32,
        mode: DeploymentMode,
    ) -> Result<ClusterPlan, PlanError> {
        if worker_nodes == 0 {
            return Err(PlanError::NoWorkers);
        }
        let planner = Planner::new(mode).with_accounting(self.accounting);
        let workers_per_node = node_capacity.cores / self.worker_cores.max(1);

        let (coordinator, workers, total_workers) = match mode {
            DeploymentMode::Colocated => {
                // one worker node gives up cores to the coordinator
                let shared = node_capacity.cores.saturating_sub(self.coordinator_cores)
                    / self.worker_cores.max(1);
                let plans = planner.plan(
                    node_capacity,
                    &[
                        RoleRequest::coordinator(COORDINATOR_ROLE, self.coordinator_cores),
                        RoleRequest::worker(WORKER_ROLE, self.worker_cores, shared),
                    ],
                )?;
                let total = workers_per_node
                    .checked_mul(worker_nodes - 1)
                    .and_then(|others| others.checked_add(shared))
                    .ok_or_else(too_many_workers)?;
                let (coordinator, workers) = split(plans)?;
                (coordinator, workers, total)
            }
            DeploymentMode::Dedicated => {
                let coordinator = planner.plan(
                    node_capacity,
                    &[RoleRequest::coordinator(
                        COORDINATOR_ROLE,
                        self.coordinator_cores,
                    )],
                )?;
                let workers = planner.plan(
                    node_capacity,
                    &[RoleRequest::worker(
                        WORKER_ROLE,
                        self.worker_cores,
                        workers_per_node,
                    )],
                )?;
                let (coordinator, workers) =
                    split(coordinator.into_iter().chain(workers).collect())?;
                let total = workers_per_node
                    .checked_mul(worker_nodes)
                    .ok_or_else(too_many_workers)?;
                (coordinator, workers, total)
            }
        };

        if total_workers == 0 {
            return Err(PlanError::InsufficientCapacity {
                role: WORKER_ROLE.to_string(),
                reason: "no cores are left for workers".to_string(),
            });
        }

        let driver_local_memory_mb = match mode {
            DeploymentMode::Dedicated => node_capacity.memory_mb,
            DeploymentMode::Colocated => node_capacity.memory_per_core(),
        };
        let parallelism = node_capacity
            .cores
            .checked_mul(worker_nodes)
            .and_then(|cores| cores.checked_mul(2))
            .ok_or_else(too_many_workers)?;

        let plan = ClusterPlan {
            mode,
            node_capacity,
            worker_nodes,
            coordinator,
            workers: RolePlan {
                instance_count: total_workers,
                ..workers
            },
            workers_per_node,
            driver_local_memory_mb,
            map_parallelism: parallelism,
            reduce_parallelism: parallelism,
        };

        info!(
            "Total Cores Usage: {}/{}",
            plan.cores_in_use(),
            plan.total_cores()
        );
        info!(
            "Total Memory Usage: {}/{}",
            plan.memory_in_use_mb(),
            plan.total_memory_mb()
        );

        Ok(plan)
    }
}

fn too_many_workers() -> PlanError {
    PlanError::InsufficientCapacity {
        role: WORKER_ROLE.to_string(),
        reason: "worker count does not fit in 32 bits".to_string(),
    }
}

fn split(plans: Vec<RolePlan>) -> Result<(RolePlan, RolePlan), PlanError> {
    match <[RolePlan; 2]>::try_from(plans) {
        Ok([coordinator, workers]) => Ok((coordinator, workers)),
        Err(_) => Err(PlanError::EmptyRequest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(mode: DeploymentMode) -> ClusterLayout {
        ClusterLayout {
            master: "n0".to_string(),
            workers: vec!["n2".to_string(), "n1".to_string(), "n2".to_string()],
            mode,
        }
    }

    #[test]
    fn nodes_are_distinct_with_master_first() {
        assert_eq!(layout(DeploymentMode::Dedicated).nodes(), ["n0", "n1", "n2"]);

        let colocated = ClusterLayout {
            master: "n1".to_string(),
            ..layout(DeploymentMode::Colocated)
        };
        assert_eq!(colocated.nodes(), ["n1", "n2"]);
        assert_eq!(colocated.sorted_workers(), ["n1", "n2"]);
    }

    #[test]
    fn dedicated_cluster_plan() -> anyhow::Result<()> {
        let plan = ClusterPlanner::default().plan(
            Capacity::new(4, 16384),
            2,
            DeploymentMode::Dedicated,
        )?;

        assert_eq!(plan.coordinator.memory_mb, 15360);
        assert_eq!(plan.coordinator.memory_overhead_mb, 1024);
        assert_eq!(plan.workers.memory_mb, 3584);
        assert_eq!(plan.workers.memory_overhead_mb, 512);
        assert_eq!(plan.workers_per_node, 4);
        assert_eq!(plan.workers.instance_count, 8);
        assert_eq!(plan.driver_local_memory_mb, 16384);
        assert_eq!(plan.map_parallelism, 16);
        assert_eq!(plan.total_cores(), 12);
        assert!(plan.memory_in_use_mb() <= plan.total_memory_mb());
        Ok(())
    }

    #[test]
    fn colocated_cluster_plan() -> anyhow::Result<()> {
        let plan = ClusterPlanner::default().plan(
            Capacity::new(4, 16384),
            2,
            DeploymentMode::Colocated,
        )?;

        assert_eq!(plan.coordinator.memory_mb, 3584);
        // (2 nodes * 4 cores - 1 coordinator core) / 1 core per worker
        assert_eq!(plan.workers.instance_count, 7);
        assert_eq!(plan.driver_local_memory_mb, 4096);
        assert_eq!(plan.cores_in_use(), plan.total_cores());
        Ok(())
    }

    #[test]
    fn single_core_colocated_node_has_no_room_for_workers() {
        let err = ClusterPlanner::default()
            .plan(Capacity::new(1, 8192), 1, DeploymentMode::Colocated)
            .unwrap_err();
        assert!(matches!(err, PlanError::InsufficientCapacity { .. }));
    }

    #[test]
    fn clusters_need_workers() {
        assert_eq!(
            ClusterPlanner::default().plan(Capacity::new(4, 16384), 0, DeploymentMode::Dedicated),
            Err(PlanError::NoWorkers)
        );
    }
}
