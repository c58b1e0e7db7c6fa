/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use proptest::prelude::*;
use scout::partition::{
    cluster::ClusterPlanner, overhead_for, plan, Capacity, DeploymentMode, OverheadAccounting,
    PlanError, Planner, RolePlan, RoleRequest, HIGH_OVERHEAD_MB, LOW_OVERHEAD_MB,
    OVERHEAD_THRESHOLD_MB,
};

fn any_mode() -> impl Strategy<Value = DeploymentMode> {
    prop_oneof![
        Just(DeploymentMode::Colocated),
        Just(DeploymentMode::Dedicated)
    ]
}

fn any_accounting() -> impl Strategy<Value = OverheadAccounting> {
    prop_oneof![
        Just(OverheadAccounting::Single),
        Just(OverheadAccounting::LegacyDouble)
    ]
}

fn role_requests() -> impl Strategy<Value = Vec<RoleRequest>> {
    (
        1_u32..=4,
        prop::collection::vec((1_u32..=8, 0_u32..=16), 1..4),
    )
        .prop_map(|(coordinator_cores, workers)| {
            std::iter::once(RoleRequest::coordinator("coordinator", coordinator_cores))
                .chain(
                    workers
                        .into_iter()
                        .enumerate()
                        .map(|(i, (cores, count))| {
                            RoleRequest::worker(&format!("worker{i}"), cores, count)
                        }),
                )
                .collect()
        })
}

fn shared(plans: &[RolePlan], mode: DeploymentMode) -> impl Iterator<Item = &RolePlan> {
    // a dedicated coordinator sits on its own node
    plans
        .iter()
        .skip(usize::from(mode == DeploymentMode::Dedicated))
}

proptest! {
    #[test]
    fn successful_plans_fit_the_capacity(
        cores in 1_u32..=64,
        memory_mb in 1_u64..=262_144,
        requests in role_requests(),
        mode in any_mode(),
        accounting in any_accounting(),
    ) {
        let capacity = Capacity::new(cores, memory_mb);
        match Planner::new(mode).with_accounting(accounting).plan(capacity, &requests) {
            Ok(plans) => {
                prop_assert_eq!(plans.len(), requests.len());
                prop_assert!(plans.iter().all(|role| role.memory_mb > 0));

                let used_cores: u64 = shared(&plans, mode).map(RolePlan::total_cores).sum();
                let used_memory: u64 = shared(&plans, mode).map(RolePlan::total_memory_mb).sum();
                prop_assert!(used_cores <= u64::from(cores));
                prop_assert!(used_memory <= memory_mb);

                if mode == DeploymentMode::Dedicated {
                    let coordinator = &plans[0];
                    prop_assert!(
                        coordinator.memory_mb + coordinator.memory_overhead_mb <= memory_mb
                    );
                }
            }
            Err(err) => prop_assert!(
                matches!(err, PlanError::InsufficientCapacity { .. }),
                "unexpected error {:?}",
                err
            ),
        }
    }

    #[test]
    fn overhead_tier_follows_the_threshold(
        cores in 1_u32..=64,
        memory_mb in 1_024_u64..=262_144,
        cores_per_instance in 1_u32..=8,
    ) {
        prop_assume!(cores_per_instance <= cores);
        let capacity = Capacity::new(cores, memory_mb);
        let basis = u64::from(cores_per_instance) * capacity.memory_per_core();

        if let Ok(plans) = plan(
            cores,
            memory_mb,
            &[RoleRequest::worker("worker", cores_per_instance, 1)],
            DeploymentMode::Colocated,
        ) {
            let expected = if basis <= OVERHEAD_THRESHOLD_MB { LOW_OVERHEAD_MB } else { HIGH_OVERHEAD_MB };
            prop_assert_eq!(plans[0].memory_overhead_mb, expected);
            prop_assert_eq!(plans[0].memory_mb, basis - expected);
        }
    }

    #[test]
    fn cluster_plans_never_exceed_the_cluster(
        cores in 1_u32..=32,
        memory_mb in 2_048_u64..=131_072,
        worker_nodes in 1_u32..=16,
        mode in any_mode(),
    ) {
        if let Ok(plan) = ClusterPlanner::default().plan(Capacity::new(cores, memory_mb), worker_nodes, mode) {
            prop_assert!(plan.cores_in_use() <= plan.total_cores());
            prop_assert!(plan.memory_in_use_mb() <= plan.total_memory_mb());
            prop_assert_eq!(plan.map_parallelism, cores * worker_nodes * 2);
            prop_assert!(plan.workers.instance_count > 0);
        }
    }
}

#[test]
fn tier_boundary_at_4096() -> anyhow::Result<()> {
    assert_eq!(overhead_for(4096), 512);
    assert_eq!(overhead_for(4097), 1024);

    let plans = plan(
        4,
        16384,
        &[RoleRequest::worker("executor", 1, 1)],
        DeploymentMode::Colocated,
    )?;
    assert_eq!(plans[0].memory_overhead_mb, 512);
    assert_eq!(plans[0].memory_mb, 3584);

    // 4097MB per core tips a single core into the high tier
    let plans = plan(
        1,
        4097,
        &[RoleRequest::worker("executor", 1, 1)],
        DeploymentMode::Colocated,
    )?;
    assert_eq!(plans[0].memory_overhead_mb, 1024);
    assert_eq!(plans[0].memory_mb, 3073);
    Ok(())
}

#[test]
fn oversized_capacity_is_rejected_instead_of_overflowing() {
    let err = plan(
        1,
        u64::MAX,
        &[RoleRequest::worker("executor", 1, 2)],
        DeploymentMode::Colocated,
    )
    .unwrap_err();
    assert!(matches!(err, PlanError::InsufficientCapacity { .. }));

    let err = ClusterPlanner::default()
        .plan(Capacity::new(1 << 20, 1 << 33), u32::MAX, DeploymentMode::Dedicated)
        .unwrap_err();
    assert!(matches!(err, PlanError::InsufficientCapacity { .. }));
}

#[test]
fn deployment_mode_changes_coordinator_sizing() -> anyhow::Result<()> {
    let request = [RoleRequest::coordinator("driver", 1)];

    let colocated = plan(4, 16384, &request, DeploymentMode::Colocated)?;
    let dedicated = plan(4, 16384, &request, DeploymentMode::Dedicated)?;

    assert_eq!(colocated[0].memory_mb, 3584);
    assert_eq!(dedicated[0].memory_mb, 15360);
    Ok(())
}
