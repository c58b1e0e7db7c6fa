/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod cluster;

use serde::{Deserialize, Serialize};
use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use thiserror::Error;

/// Working memory (cores * memory per core) above which a role gets the high overhead tier.
pub const OVERHEAD_THRESHOLD_MB: u64 = 4096;
pub const LOW_OVERHEAD_MB: u64 = 512;
pub const HIGH_OVERHEAD_MB: u64 = 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("no roles were requested")]
    EmptyRequest,

    #[error("capacity must have at least one core and some memory (got {cores} cores, {memory_mb}MB)")]
    ZeroCapacity { cores: u32, memory_mb: u64 },

    #[error("insufficient capacity for role {role}: {reason}")]
    InsufficientCapacity { role: String, reason: String },

    #[error("no capacity entry for instance type {0}")]
    UnknownInstanceType(String),

    #[error("a cluster needs at least one worker node")]
    NoWorkers,
}

/// The physical resources hosting a set of roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Capacity {
    pub cores: u32,
    pub memory_mb: u64,
}
impl Capacity {
    pub fn new(cores: u32, memory_mb: u64) -> Self {
        Self { cores, memory_mb }
    }

    /// Memory per core, rounded down.
    pub fn memory_per_core(&self) -> u64 {
        self.memory_mb / u64::from(self.cores.max(1))
    }

    /// Capacity of the machine this process runs on.
    pub fn detect_local() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::new().with_ram()),
        );
        Self {
            cores: num_cpus::get() as u32,
            memory_mb: system.total_memory() / (1024 * 1024),
        }
    }
}

/// Where the coordinator runs relative to the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// The coordinator shares a node with workers and gets one share of it.
    #[serde(alias = "single-node")]
    Colocated,
    /// N+1: the coordinator has a node to itself.
    #[serde(alias = "n+1")]
    Dedicated,
}

/// How many times a worker's overhead is taken out of its working memory. `LegacyDouble`
/// reproduces historical cluster plans that subtracted it twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverheadAccounting {
    #[default]
    Single,
    LegacyDouble,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleKind {
    Coordinator,
    Worker,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleRequest {
    pub name: String,
    pub kind: RoleKind,
    pub cores_per_instance: u32,
    pub instance_count: u32,
}
impl RoleRequest {
    pub fn coordinator(name: &str, cores: u32) -> Self {
        Self {
            name: name.to_string(),
            kind: RoleKind::Coordinator,
            cores_per_instance: cores,
            instance_count: 1,
        }
    }

    pub fn worker(name: &str, cores_per_instance: u32, instance_count: u32) -> Self {
        Self {
            name: name.to_string(),
            kind: RoleKind::Worker,
            cores_per_instance,
            instance_count,
        }
    }
}

/// Resources allocated to one role. Field names are read by the configuration templates.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RolePlan {
    pub role_name: String,
    pub cores: u32,
    pub memory_mb: u64,
    pub memory_overhead_mb: u64,
    pub instance_count: u32,
}
impl RolePlan {
    pub fn total_cores(&self) -> u64 {
        u64::from(self.cores) * u64::from(self.instance_count)
    }

    /// Saturates at `u64::MAX`; the planner rejects plans that would get there.
    pub fn total_memory_mb(&self) -> u64 {
        self.checked_total_memory_mb().unwrap_or(u64::MAX)
    }

    pub fn checked_total_memory_mb(&self) -> Option<u64> {
        self.memory_mb
            .checked_add(self.memory_overhead_mb)?
            .checked_mul(u64::from(self.instance_count))
    }
}

/// Overhead tier for a role whose working memory is `basis_mb`.
pub fn overhead_for(basis_mb: u64) -> u64 {
    if basis_mb <= OVERHEAD_THRESHOLD_MB {
        LOW_OVERHEAD_MB
    } else {
        HIGH_OVERHEAD_MB
    }
}

/// Splits a node's cores and memory between a coordinator and its workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Planner {
    pub mode: DeploymentMode,
    pub accounting: OverheadAccounting,
}
impl Planner {
    pub fn new(mode: DeploymentMode) -> Self {
        Self {
            mode,
            accounting: OverheadAccounting::default(),
        }
    }

    pub fn with_accounting(mut self, accounting: OverheadAccounting) -> Self {
        self.accounting = accounting;
        self
    }

    /// Plans every requested role against `capacity`.
    ///
    /// Memory is handed out per core. In dedicated mode a coordinator is sized against the whole
    /// node and does not count against the capacity shared by the other roles.
    ///
    /// # Errors
    ///
    /// `InsufficientCapacity` when any role would end up with no memory after overhead, or when
    /// the roles sharing the capacity need more cores or memory than it has. Nothing is returned
    /// for a partially valid request.
    pub fn plan(
        &self,
        capacity: Capacity,
        requests: &[RoleRequest],
    ) -> Result<Vec<RolePlan>, PlanError> {
        if requests.is_empty() {
            return Err(PlanError::EmptyRequest);
        }
        if capacity.cores == 0 || capacity.memory_mb == 0 {
            return Err(PlanError::ZeroCapacity {
                cores: capacity.cores,
                memory_mb: capacity.memory_mb,
            });
        }

        let memory_per_core = capacity.memory_per_core();
        let mut plans = Vec::with_capacity(requests.len());
        let mut shared_cores = 0_u64;
        let mut shared_memory_mb = 0_u64;

        for request in requests {
            if request.cores_per_instance == 0 {
                return Err(insufficient(request, "a role needs at least one core"));
            }
            if request.cores_per_instance > capacity.cores {
                return Err(insufficient(
                    request,
                    &format!(
                        "{} cores per instance but the node has {}",
                        request.cores_per_instance, capacity.cores
                    ),
                ));
            }

            let owns_node =
                request.kind == RoleKind::Coordinator && self.mode == DeploymentMode::Dedicated;
            let basis_mb = if owns_node {
                capacity.memory_mb
            } else {
                u64::from(request.cores_per_instance) * memory_per_core
            };
            let overhead_mb = overhead_for(basis_mb);
            let subtractions = match (request.kind, self.accounting) {
                (RoleKind::Worker, OverheadAccounting::LegacyDouble) => 2,
                _ => 1,
            };

            let memory_mb = basis_mb
                .checked_sub(overhead_mb * subtractions)
                .filter(|memory| *memory > 0)
                .ok_or_else(|| {
                    insufficient(
                        request,
                        &format!(
                            "{basis_mb}MB of working memory does not cover {overhead_mb}MB overhead"
                        ),
                    )
                })?;

            let plan = RolePlan {
                role_name: request.name.clone(),
                cores: request.cores_per_instance,
                memory_mb,
                memory_overhead_mb: overhead_mb,
                instance_count: request.instance_count,
            };

            if !owns_node {
                shared_cores = shared_cores.saturating_add(plan.total_cores());
                shared_memory_mb = plan
                    .checked_total_memory_mb()
                    .and_then(|memory| shared_memory_mb.checked_add(memory))
                    .ok_or_else(|| {
                        insufficient(request, "memory needed by the roles does not fit in 64 bits")
                    })?;
                if shared_cores > u64::from(capacity.cores) {
                    return Err(insufficient(
                        request,
                        &format!(
                            "roles need {shared_cores} cores but only {} are available",
                            capacity.cores
                        ),
                    ));
                }
                if shared_memory_mb > capacity.memory_mb {
                    return Err(insufficient(
                        request,
                        &format!(
                            "roles need {shared_memory_mb}MB but only {}MB is available",
                            capacity.memory_mb
                        ),
                    ));
                }
            }

            plans.push(plan);
        }

        Ok(plans)
    }
}

fn insufficient(request: &RoleRequest, reason: &str) -> PlanError {
    PlanError::InsufficientCapacity {
        role: request.name.clone(),
        reason: reason.to_string(),
    }
}

/// Plans `requests` against `total_cores` / `total_memory_mb` with single overhead accounting.
pub fn plan(
    total_cores: u32,
    total_memory_mb: u64,
    requests: &[RoleRequest],
    mode: DeploymentMode,
) -> Result<Vec<RolePlan>, PlanError> {
    Planner::new(mode).plan(Capacity::new(total_cores, total_memory_mb), requests)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CapacityEntry {
    pub instance_type: String,
    pub cores: u32,
    pub memory_mb: u64,
}

/// Instance type to capacity lookup, supplied by configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapacityTable {
    entries: Vec<CapacityEntry>,
}
impl CapacityTable {
    pub fn new(entries: Vec<CapacityEntry>) -> Self {
        Self { entries }
    }

    pub fn lookup(&self, instance_type: &str) -> Result<Capacity, PlanError> {
        self.entries
            .iter()
            .find(|entry| entry.instance_type == instance_type)
            .map(|entry| Capacity::new(entry.cores, entry.memory_mb))
            .ok_or_else(|| PlanError::UnknownInstanceType(instance_type.to_string()))
    }

    pub fn instance_types(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.instance_type.as_str())
    }
}
