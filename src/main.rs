/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::Context;
use colored::Colorize;
use scout::{
    clap_args::{self, Commands},
    config::Config,
    configure, dispatch,
    dispatch::{ShellTransport, Transport},
    summary, RunOptions,
};
use std::sync::Arc;
use tracing::{info, subscriber::set_global_default, Subscriber};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args = clap_args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    init_subscriber(get_subscriber(default_level.into()))?;

    if let Commands::Init = args.command {
        Config::write_example_to_file(&args.config)?;
        println!("{} {}", "Created".green(), args.config.display());
        return Ok(());
    }

    let config = Config::try_from_path(&args.config)?;
    let transport: Arc<dyn Transport> = Arc::new(ShellTransport::default());

    match args.command {
        Commands::Init => {}

        Commands::Plan { output } => {
            let plan = scout::cluster_plan(&config)?;
            summary::print_plan(&plan);
            if let Some(path) = output {
                configure::write_plan(&plan, &path)?;
            }
        }

        Commands::Exec { nodes, command } => {
            let command_line = clap_args::command_line(&command)?;
            let results = scout::exec(&config, transport, &nodes, &command_line).await;
            summary::print_outputs(&results);
            fail_on_errors(&results, "exec")?;
        }

        Commands::Configure => {
            let (plan, results) = scout::configure_cluster(&config, transport).await?;
            summary::print_plan(&plan);
            summary::print_results("Configuration", &results);
            fail_on_errors(&results, "configuration push")?;
        }

        Commands::Run {
            workload,
            no_monitoring,
            output_dir,
        } => {
            let options = RunOptions {
                monitoring: !no_monitoring,
                output_dir,
            };
            let report = scout::run_benchmark(&config, transport, &workload, &options)
                .await
                .context(format!("Benchmark {} did not run", workload))?;
            summary::print_report(&report);
            if !report.completed {
                anyhow::bail!("Workload {} did not complete", workload);
            }
            info!("Benchmark {} complete", report.run_id);
        }
    }

    Ok(())
}

fn fail_on_errors(results: &dispatch::BatchResults, what: &str) -> anyhow::Result<()> {
    let failed = dispatch::failures(results).len();
    if failed > 0 {
        anyhow::bail!("{} failed on {} of {} nodes", what, failed, results.len());
    }
    Ok(())
}

fn get_subscriber(env_filter: String) -> impl Subscriber + Sync + Send {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(env_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .finish()
}

fn init_subscriber(subscriber: impl Subscriber + Sync + Send) -> anyhow::Result<()> {
    set_global_default(subscriber).context("Failed to set subscriber")
}
