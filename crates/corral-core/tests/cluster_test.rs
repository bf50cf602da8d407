//! End-to-end cluster runs against the local environment and fake programs.

use std::net::IpAddr;
use std::time::Duration;

use corral_core::cluster::{CLIENT_LOG, ENV_LOG, run_cluster};
use corral_core::env::ToolController;
use corral_core::runner::segments;
use corral_core::{Interrupted, ProcessState, Role, RunContext, run_scoped};
use corral_test_utils::{FakePrograms, LocalEnvironment, test_cluster_config, test_context};
use tokio_util::sync::CancellationToken;

async fn assert_none_running(ctx: &RunContext) {
    for handle in ctx.registry().handles() {
        let state = ctx.registry().state(&handle).await;
        assert!(
            !matches!(state, Some(ProcessState::Running)),
            "{} ({}) still running after the run",
            handle.name,
            handle.pid
        );
    }
}

#[tokio::test]
async fn three_node_run_issues_write_then_reads() {
    let logs = tempfile::tempdir().unwrap();
    let programs = FakePrograms::new();
    let ctx = test_context(logs.path());
    let envs = LocalEnvironment::new();
    let config = test_cluster_config(&programs, 3);
    let cancel = CancellationToken::new();

    let report = run_scoped(&ctx, &cancel, run_cluster(&ctx, &envs, &config))
        .await
        .unwrap();

    assert_eq!(report.nodes.len(), 3);
    assert_eq!(envs.setups(), ["node0", "node1", "node2"]);
    assert_eq!(
        report.operations,
        [
            "write 127.0.0.1 42",
            "read 127.0.0.1",
            "read 127.0.0.1",
            "read 127.0.0.1",
        ]
    );

    let client_log = std::fs::read_to_string(ctx.logs().path_for(CLIENT_LOG).unwrap()).unwrap();
    let segs = segments(&client_log);
    assert_eq!(segs.len(), 4);
    assert!(segs[0].contains("wrote 42 to 127.0.0.1"));
    for seg in &segs[1..] {
        assert!(seg.contains("read from 127.0.0.1"));
    }

    // Only the client log is tailed: environment setup is untailed and the
    // accelerators and services are silent.
    let followers: Vec<_> = ctx
        .registry()
        .handles()
        .into_iter()
        .filter(|h| h.role == Role::Follower)
        .collect();
    assert_eq!(followers.len(), 1);
    assert_eq!(followers[0].name, format!("follow:{CLIENT_LOG}"));

    assert!(ctx.logs().path_for(ENV_LOG).unwrap().exists());
    assert!(!ctx.logs().path_for("node-0").unwrap().exists());
    assert!(!ctx.logs().path_for("accel-0").unwrap().exists());

    assert_none_running(&ctx).await;
}

#[tokio::test]
async fn services_are_spawned_in_their_own_environment() {
    let logs = tempfile::tempdir().unwrap();
    let programs = FakePrograms::new();
    let ctx = test_context(logs.path());
    let envs = LocalEnvironment::new();
    let mut config = test_cluster_config(&programs, 2);
    config.services = corral_core::spawn::SpawnOptions::logged();
    let cancel = CancellationToken::new();

    run_scoped(&ctx, &cancel, async {
        let report = run_cluster(&ctx, &envs, &config).await?;
        // Give the scripts a moment to print their banner.
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok::<_, anyhow::Error>(report)
    })
    .await
    .unwrap();

    for index in 0..2 {
        let log = std::fs::read_to_string(ctx.logs().path_for(&format!("node-{index}")).unwrap())
            .unwrap();
        assert!(log.contains(&format!("node {index} of 2 in node{index}")), "log was {log:?}");
    }
    assert_none_running(&ctx).await;
}

#[tokio::test]
async fn failing_workload_aborts_and_still_cleans_up() {
    let logs = tempfile::tempdir().unwrap();
    let programs = FakePrograms::with_client(
        "case \"$1\" in\n  write) echo ok ;;\n  read) echo 'connection refused' >&2; exit 2 ;;\nesac\n",
    );
    let ctx = test_context(logs.path());
    let envs = LocalEnvironment::new();
    let config = test_cluster_config(&programs, 3);
    let cancel = CancellationToken::new();

    let err = run_scoped(&ctx, &cancel, run_cluster(&ctx, &envs, &config))
        .await
        .unwrap_err();

    assert!(format!("{err:#}").contains("client read"), "error was {err:#}");

    // The write and the first read ran; nothing after the failure did.
    let client_log = std::fs::read_to_string(ctx.logs().path_for(CLIENT_LOG).unwrap()).unwrap();
    assert_eq!(segments(&client_log).len(), 2);
    assert!(client_log.contains("connection refused"));

    let services = ctx
        .registry()
        .handles()
        .into_iter()
        .filter(|h| h.name.starts_with("node-"))
        .count();
    assert_eq!(services, 3);
    assert_none_running(&ctx).await;
}

#[tokio::test]
async fn missing_program_is_fatal() {
    let logs = tempfile::tempdir().unwrap();
    let programs = FakePrograms::new();
    let ctx = test_context(logs.path());
    let envs = LocalEnvironment::new();
    let mut config = test_cluster_config(&programs, 2);
    config.binaries.client = programs.dir().join("does-not-exist");
    let cancel = CancellationToken::new();

    let result = run_scoped(&ctx, &cancel, run_cluster(&ctx, &envs, &config)).await;

    assert!(result.is_err());
    assert_none_running(&ctx).await;
}

#[tokio::test]
async fn failing_network_toggle_is_tolerated() {
    let logs = tempfile::tempdir().unwrap();
    let programs = FakePrograms::new();
    let ctx = test_context(logs.path());
    let envs = LocalEnvironment::new();
    let mut config = test_cluster_config(&programs, 1);
    config.network_toggles = vec![
        "exit 1".to_string(),
        "echo toggled in $CORRAL_ENV".to_string(),
    ];
    let cancel = CancellationToken::new();

    let report = run_scoped(&ctx, &cancel, run_cluster(&ctx, &envs, &config))
        .await
        .unwrap();

    assert_eq!(report.operations.len(), 2);
    let env_log = std::fs::read_to_string(ctx.logs().path_for(ENV_LOG).unwrap()).unwrap();
    assert!(env_log.contains("toggled in node0"), "env log was {env_log:?}");
    assert_none_running(&ctx).await;
}

#[tokio::test]
async fn tool_controller_drives_external_env_tool() {
    let logs = tempfile::tempdir().unwrap();
    let programs = FakePrograms::new();
    let ctx = test_context(logs.path());
    let envs = ToolController::new("sh").with_base_args([programs.env_tool().to_string_lossy()]);
    let config = test_cluster_config(&programs, 2);
    let cancel = CancellationToken::new();

    let report = run_scoped(&ctx, &cancel, run_cluster(&ctx, &envs, &config))
        .await
        .unwrap();

    let addresses: Vec<_> = report.nodes.iter().map(|n| n.address).collect();
    assert_eq!(addresses, [Some(IpAddr::from([127, 0, 0, 1])); 2]);
    assert_eq!(report.operations[0], "write 127.0.0.1 42");

    let client_log = std::fs::read_to_string(ctx.logs().path_for(CLIENT_LOG).unwrap()).unwrap();
    assert_eq!(segments(&client_log).len(), 3);
    assert!(client_log.contains("wrote 42 to 127.0.0.1"));
    assert_none_running(&ctx).await;
}

#[tokio::test]
async fn interruption_while_waiting_cleans_up() {
    let logs = tempfile::tempdir().unwrap();
    let programs = FakePrograms::new();
    let ctx = test_context(logs.path());
    let envs = LocalEnvironment::new();
    let mut config = test_cluster_config(&programs, 2);
    config.wait_for_services = true;
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.cancel();
    });

    let err = run_scoped(&ctx, &cancel, run_cluster(&ctx, &envs, &config))
        .await
        .unwrap_err();

    assert!(err.is::<Interrupted>());
    assert!(!ctx.registry().is_empty());
    assert_none_running(&ctx).await;
}
