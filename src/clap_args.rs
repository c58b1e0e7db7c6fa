/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the config file
    #[arg(short, long, default_value = "./scout.toml", global = true)]
    pub config: PathBuf,

    /// Verbose mode (-v, --verbose)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write an example config file
    Init,

    /// Print the resource plan for the cluster
    Plan {
        /// Also write the plan as JSON to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run a command on cluster nodes
    Exec {
        /// Nodes to run on, every cluster node if omitted
        #[arg(short, long, value_delimiter = ',')]
        nodes: Vec<String>,

        /// The command to run
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Push the resource plan to every cluster node
    Configure,

    /// Run a workload with per-node telemetry
    Run {
        /// Name of the workload in the config file
        workload: String,

        /// Run without telemetry
        #[arg(long)]
        no_monitoring: bool,

        /// Write telemetry and the report here instead of the workload's output_dir
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },
}

/// Joins the words of a trailing command back into one shell command line.
pub fn command_line(words: &[String]) -> anyhow::Result<String> {
    match words {
        [single] => Ok(single.clone()),
        _ => shlex::try_join(words.iter().map(String::as_str))
            .map_err(|e| anyhow::anyhow!("Unable to quote command: {}", e)),
    }
}

pub fn parse() -> Args {
    Args::parse()
}
