/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    dispatch::{BatchResults, CommandResult},
    partition::{cluster::ClusterPlan, RolePlan},
    workload::BenchmarkReport,
};
use colored::*;
use itertools::Itertools;
use term_table::{row, row::Row, rows, table_cell::*, Table, TableStyle};

fn status(result: &CommandResult) -> ColoredString {
    match &result.error {
        None => "ok".green(),
        Some(err) => err.to_string().red(),
    }
}

/// Results in a stable order: by target, then id.
fn ordered(results: &BatchResults) -> Vec<&CommandResult> {
    results
        .values()
        .sorted_by(|a, b| {
            a.target
                .to_string()
                .cmp(&b.target.to_string())
                .then_with(|| a.id.cmp(&b.id))
        })
        .collect()
}

/// Prints each command's output under a numbered header.
pub fn print_outputs(results: &BatchResults) {
    for (i, result) in ordered(results).into_iter().enumerate() {
        let header = format!(" {} {} ", i + 1, result.target);
        match &result.error {
            None => println!("{}", header.reversed().green()),
            Some(_) => println!("{}", header.reversed().red()),
        }
        if let Some(output) = &result.output {
            print!("{output}");
            if !output.ends_with('\n') {
                println!();
            }
        }
        if let Some(err) = &result.error {
            println!("{}", err.to_string().red());
        }
    }
}

pub fn print_results(title: &str, results: &BatchResults) {
    println!("\n{}", format!(" {title} ").reversed().green());

    let mut rows = rows![row![
        TableCell::builder("Target".bold()).build(),
        TableCell::builder("Status".bold()).build()
    ]];
    for result in ordered(results) {
        rows.push(row![
            TableCell::new(result.target.to_string()),
            TableCell::new(status(result))
        ]);
    }

    let table = Table::builder()
        .rows(rows)
        .style(TableStyle::rounded())
        .build();
    println!("{}", table.render());
}

fn role_row(role: &RolePlan) -> Row {
    row![
        TableCell::new(&role.role_name),
        TableCell::new(role.cores),
        TableCell::new(format!("{}MB", role.memory_mb)),
        TableCell::new(format!("{}MB", role.memory_overhead_mb)),
        TableCell::new(role.instance_count)
    ]
}

pub fn print_plan(plan: &ClusterPlan) {
    println!("\n{}", " Cluster Plan ".reversed().green());
    println!(
        "{} nodes of {} cores / {}MB, {:?} coordinator",
        plan.worker_nodes, plan.node_capacity.cores, plan.node_capacity.memory_mb, plan.mode
    );

    let mut rows = rows![row![
        TableCell::builder("Role".bold()).build(),
        TableCell::builder("Cores".bold()).build(),
        TableCell::builder("Memory".bold()).build(),
        TableCell::builder("Overhead".bold()).build(),
        TableCell::builder("Instances".bold()).build()
    ]];
    rows.extend(plan.roles().iter().map(role_row));

    let table = Table::builder()
        .rows(rows)
        .style(TableStyle::rounded())
        .build();
    println!("{}", table.render());

    println!(
        "Total Cores Usage: {}/{}",
        plan.cores_in_use(),
        plan.total_cores()
    );
    println!(
        "Total Memory Usage: {}/{}",
        plan.memory_in_use_mb(),
        plan.total_memory_mb()
    );
    println!(
        "Driver local memory: {}MB, parallelism: {} map / {} reduce",
        plan.driver_local_memory_mb, plan.map_parallelism, plan.reduce_parallelism
    );
}

pub fn print_report(report: &BenchmarkReport) {
    println!("\n{}", " Summary ".reversed().green());
    println!("{}:", report.workload.green());

    let outcome = match &report.error {
        None => "completed".green(),
        Some(err) => err.to_string().red(),
    };
    let table = Table::builder()
        .rows(rows![
            row![
                TableCell::builder("Run".bold()).build(),
                TableCell::builder("Duration (s)".bold()).build(),
                TableCell::builder("Outcome".bold()).build()
            ],
            row![
                TableCell::new(&report.run_id),
                TableCell::new(format!("{:.3}s", report.elapsed_secs)),
                TableCell::new(outcome)
            ]
        ])
        .style(TableStyle::rounded())
        .build();
    println!("{}", table.render());

    let Some(telemetry) = &report.telemetry else {
        println!("{}", "telemetry disabled".bright_black());
        return;
    };
    for output in &telemetry.per_node_output_paths {
        println!("{} -> {}", output.node, output.path.display());
    }
    for failure in &telemetry.failures {
        let reason = failure
            .error
            .as_ref()
            .map(|err| err.to_string())
            .unwrap_or_default();
        println!("{} {}", failure.node.yellow(), reason.yellow());
    }
}
