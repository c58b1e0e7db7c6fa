/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

mod common;

use common::RecordingTransport;
use scout::dispatch::{self, Command, DispatchPool, ErrorKind, RemoteOptions};
use std::time::Duration;

fn nodes(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("n{i}")).collect()
}

#[tokio::test]
async fn every_command_gets_exactly_one_result() {
    let transport = RecordingTransport::new();
    let pool = DispatchPool::new(transport.clone(), 3);

    let results = pool
        .submit(RemoteOptions::default().fan_out(&nodes(10), "uptime"))
        .await;

    assert_eq!(results.len(), 10);
    assert_eq!(transport.calls().len(), 10);
    assert!(results.values().all(|result| result.succeeded));
}

#[tokio::test]
async fn concurrency_never_exceeds_the_bound() {
    for k in [1, 2, 4] {
        let transport = RecordingTransport::builder()
            .with_delay(Duration::from_millis(20))
            .build();
        let pool = DispatchPool::new(transport.clone(), k);

        let results = pool
            .submit(RemoteOptions::default().fan_out(&nodes(12), "uptime"))
            .await;

        assert_eq!(results.len(), 12);
        assert!(transport.max_active() <= k, "k={k} saw {}", transport.max_active());
        assert!(transport.max_active() >= 1);
    }
}

#[tokio::test]
async fn every_slot_is_used_when_commands_outnumber_it() {
    let transport = RecordingTransport::builder()
        .with_delay(Duration::from_millis(20))
        .build();
    let pool = DispatchPool::new(transport.clone(), 3);

    let results = pool
        .submit(RemoteOptions::default().fan_out(&nodes(12), "uptime"))
        .await;

    assert_eq!(results.len(), 12);
    assert_eq!(transport.max_active(), 3);
}

#[tokio::test]
async fn zero_concurrency_is_clamped_to_one() {
    let transport = RecordingTransport::builder()
        .with_delay(Duration::from_millis(5))
        .build();
    let pool = DispatchPool::new(transport.clone(), 0);

    assert_eq!(pool.concurrency(), 1);
    let results = pool
        .submit(RemoteOptions::default().fan_out(&nodes(4), "uptime"))
        .await;
    assert_eq!(results.len(), 4);
    assert_eq!(transport.max_active(), 1);
}

#[tokio::test]
async fn one_failing_node_does_not_stop_the_others() {
    let transport = RecordingTransport::builder().unreachable("n2").build();
    let pool = DispatchPool::new(transport.clone(), 1);

    let results = pool
        .submit(RemoteOptions::default().fan_out(&nodes(3), "uptime"))
        .await;

    assert_eq!(results.len(), 3);
    let failed = dispatch::failures(&results);
    assert_eq!(failed.len(), 1);
    assert_eq!(
        failed[0].error,
        Some(ErrorKind::ConnectionTimeout {
            host: "n2".to_string(),
            timeout_secs: 10
        })
    );
    assert_eq!(transport.calls_to("n3").len(), 1);
}

#[tokio::test]
async fn invalid_commands_are_reported_without_running() {
    let transport = RecordingTransport::new();
    let pool = DispatchPool::new(transport.clone(), 2);

    let results = pool
        .submit(vec![
            Command::remote("n1", "uptime"),
            Command::remote("", "uptime"),
            Command::local("zero", "true").with_timeout(Duration::ZERO),
        ])
        .await;

    assert_eq!(results.len(), 3);
    assert_eq!(transport.calls().len(), 1);
    assert!(matches!(
        results["zero"].error,
        Some(ErrorKind::InvalidCommand { .. })
    ));
}

#[tokio::test]
async fn duplicate_ids_keep_the_last_command() {
    let transport = RecordingTransport::new();
    let pool = DispatchPool::new(transport.clone(), 2);

    let results = pool
        .submit(vec![
            Command::local("job", "echo first"),
            Command::local("job", "echo second"),
        ])
        .await;

    assert_eq!(results.len(), 1);
    let calls = transport.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].command_line, "echo second");
    assert_eq!(
        results["job"].output.as_deref(),
        Some("echo second ran on localhost")
    );
}

#[tokio::test]
async fn concurrent_batches_do_not_share_slots() {
    let transport = RecordingTransport::builder()
        .with_delay(Duration::from_millis(20))
        .build();
    let pool = DispatchPool::new(transport.clone(), 2);

    let (a, b) = tokio::join!(
        pool.submit(RemoteOptions::default().fan_out(&nodes(4), "a")),
        pool.submit(RemoteOptions::default().fan_out(&nodes(4), "b")),
    );

    assert_eq!(a.len(), 4);
    assert_eq!(b.len(), 4);
    assert!(transport.max_active() <= 4);
}
