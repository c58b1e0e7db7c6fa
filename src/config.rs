/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    dispatch::{HostKeyPolicy, RemoteOptions},
    monitoring::{SessionOptions, TelemetryCommands},
    partition::{
        cluster::{ClusterLayout, ClusterPlanner},
        Capacity, CapacityEntry, CapacityTable, DeploymentMode, OverheadAccounting,
    },
};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::debug;

static EXAMPLE_CONFIG: &str = include_str!("templates/scout.toml");

// ******** ******** ********
// **    CONFIGURATION     **
// ******** ******** ********
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    pub cluster: Cluster,
    #[serde(default)]
    pub ssh: Ssh,
    #[serde(default)]
    pub planner: PlannerSettings,
    #[serde(default)]
    pub monitoring: Monitoring,
    pub configure: Option<Configure>,
    #[serde(default, rename(serialize = "capacity", deserialize = "capacity"))]
    pub capacities: Vec<CapacityEntry>,
    #[serde(default, rename(serialize = "workload", deserialize = "workload"))]
    pub workloads: Vec<Workload>,
}
impl Config {
    /// Writes the bundled example configuration to `path`. Fails if the file already exists.
    pub fn write_example_to_file(path: &Path) -> anyhow::Result<File> {
        let mut file = File::create_new(path)
            .context(format!("Unable to create config file {}", path.display()))?;
        file.write_all(EXAMPLE_CONFIG.as_bytes())?;
        Ok(file)
    }

    pub fn try_from_path(path: &Path) -> anyhow::Result<Config> {
        let config_str = fs::read_to_string(path)
            .context(format!("Unable to read config file {}", path.display()))?;
        debug!("Loaded config from {}", path.display());
        Config::try_from_str(&config_str)
    }

    pub fn try_from_str(conf_str: &str) -> anyhow::Result<Config> {
        toml::from_str::<Config>(conf_str).map_err(|e| anyhow::anyhow!("TOML parsing error: {}", e))
    }

    pub fn find_workload(&self, name: &str) -> anyhow::Result<&Workload> {
        self.workloads
            .iter()
            .find(|workload| workload.name == name)
            .context(format!("Unable to find workload with name {}", name))
    }

    pub fn layout(&self) -> ClusterLayout {
        ClusterLayout {
            master: self.cluster.master.clone(),
            workers: self.cluster.workers.clone(),
            mode: self.cluster.mode,
        }
    }

    pub fn capacity_table(&self) -> CapacityTable {
        CapacityTable::new(self.capacities.clone())
    }

    /// Per-node capacity: the configured instance type, or this machine when none is set.
    pub fn node_capacity(&self) -> anyhow::Result<Capacity> {
        match &self.cluster.instance_type {
            Some(instance_type) => Ok(self.capacity_table().lookup(instance_type)?),
            None => Ok(Capacity::detect_local()),
        }
    }

    pub fn cluster_planner(&self) -> ClusterPlanner {
        ClusterPlanner {
            coordinator_cores: self.planner.coordinator_cores,
            worker_cores: self.planner.worker_cores,
            accounting: self.planner.overhead_accounting,
        }
    }

    pub fn remote_options(&self) -> RemoteOptions {
        RemoteOptions {
            connect_timeout: Duration::from_secs(self.ssh.connect_timeout),
            host_key_policy: self.ssh.host_key_policy(),
            user: self.ssh.user.clone(),
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            remote: RemoteOptions {
                connect_timeout: Duration::from_secs(self.monitoring.connect_timeout),
                ..self.remote_options()
            },
            commands: self.monitoring.commands.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct Cluster {
    pub master: String,
    pub workers: Vec<String>,
    pub mode: DeploymentMode,
    pub instance_type: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(default)]
pub struct Ssh {
    pub connect_timeout: u64,
    pub strict_host_key_checking: bool,
    pub ignore_known_hosts: bool,
    pub user: Option<String>,
    pub concurrency: usize,
}
impl Default for Ssh {
    fn default() -> Self {
        Self {
            connect_timeout: 10,
            strict_host_key_checking: false,
            ignore_known_hosts: true,
            user: None,
            concurrency: 8,
        }
    }
}
impl Ssh {
    pub fn host_key_policy(&self) -> HostKeyPolicy {
        HostKeyPolicy {
            strict_host_key_checking: self.strict_host_key_checking,
            ignore_known_hosts: self.ignore_known_hosts,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(default)]
pub struct PlannerSettings {
    pub coordinator_cores: u32,
    pub worker_cores: u32,
    pub overhead_accounting: OverheadAccounting,
}
impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            coordinator_cores: 1,
            worker_cores: 1,
            overhead_accounting: OverheadAccounting::Single,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(default)]
pub struct Monitoring {
    pub enabled: bool,
    pub interval: u64,
    pub connect_timeout: u64,
    #[serde(flatten)]
    pub commands: TelemetryCommands,
}
impl Default for Monitoring {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 5,
            connect_timeout: 60,
            commands: TelemetryCommands::default(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct Configure {
    pub command: String,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct Workload {
    pub name: String,
    pub command: String,
    /// Seconds before the workload is killed.
    pub timeout: Option<u64>,
    pub output_dir: PathBuf,
}
impl Workload {
    pub fn deadline(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}
