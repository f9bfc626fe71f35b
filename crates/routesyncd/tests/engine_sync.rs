//! End-to-end engine tests against the in-memory kernel double.

use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use routesyncd::{
    Config, EngineHandle, EngineState, KernelRoute, MockRouteKernel, ResolvedRoute, Result,
    RouteCommand, RouteSyncEngine, RoutesyncError, TableId,
};

const TABLE: u8 = 100;

fn config(extra: &[(&str, &str)]) -> Config {
    let mut pairs = vec![
        ("NODE_HOSTNAME".to_string(), "worker-1".to_string()),
        ("TARGET_TABLE".to_string(), TABLE.to_string()),
        ("RECONCILE_INTERVAL_SECS".to_string(), "5".to_string()),
    ];
    pairs.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
    Config::from_vars(pairs).unwrap()
}

fn table() -> TableId {
    TableId::new(i64::from(TABLE)).unwrap()
}

fn route(dest: &str, gateway: Option<&str>) -> ResolvedRoute {
    ResolvedRoute {
        destination: dest.parse().unwrap(),
        gateway: gateway.map(|g| g.parse().unwrap()),
        table: table(),
        oif: None,
    }
}

struct Rig {
    kernel: MockRouteKernel,
    handle: EngineHandle,
    stop: CancellationToken,
    task: JoinHandle<Result<()>>,
}

fn start(config: &Config) -> Rig {
    let kernel = MockRouteKernel::new();
    let (engine, handle) = RouteSyncEngine::new(config, kernel.clone());
    let stop = CancellationToken::new();
    let task = tokio::spawn(engine.run(stop.clone()));
    Rig {
        kernel,
        handle,
        stop,
        task,
    }
}

/// Waits one full reconcile interval so the periodic tick has fired.
async fn after_tick() {
    tokio::time::sleep(Duration::from_secs(6)).await;
}

#[tokio::test(start_paused = true)]
async fn test_install_and_delete_route() {
    let rig = start(&config(&[("PROTECTED_SUBNET_CALICO", "10.0.0.0/8")]));

    let r = route("192.168.1.0/24", Some("10.0.0.1"));
    rig.handle
        .submit(RouteCommand::Add(r.clone()))
        .unwrap()
        .outcome()
        .await
        .unwrap();

    let installed = rig.kernel.routes_in(table());
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].destination.to_string(), "192.168.1.0/24");
    assert_eq!(installed[0].gateway, Some("10.0.0.1".parse().unwrap()));
    assert!(installed[0].protocol_static);

    rig.handle
        .submit(RouteCommand::Delete(r.clone()))
        .unwrap()
        .outcome()
        .await
        .unwrap();
    assert!(rig.kernel.routes_in(table()).is_empty());

    // Deleting an absent entry is still success.
    rig.handle
        .submit(RouteCommand::Delete(r))
        .unwrap()
        .outcome()
        .await
        .unwrap();

    rig.stop.cancel();
    rig.task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_repeated_add_keeps_single_entry() {
    let rig = start(&config(&[]));

    let r = route("172.20.0.0/16", Some("192.168.0.1"));
    for _ in 0..2 {
        rig.handle
            .submit(RouteCommand::Add(r.clone()))
            .unwrap()
            .outcome()
            .await
            .unwrap();
    }

    assert_eq!(rig.kernel.routes_in(table()).len(), 1);
    rig.stop.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_protected_destination_rejected_without_kernel_write() {
    let rig = start(&config(&[("PROTECTED_SUBNET_CALICO", "10.0.0.0/8")]));

    let err = rig
        .handle
        .submit(RouteCommand::Add(route("10.1.0.0/16", Some("192.168.0.1"))))
        .unwrap()
        .outcome()
        .await
        .unwrap_err();
    assert!(matches!(err, RoutesyncError::ProtectedSubnet { .. }));
    assert!(err.is_permanent_rejection());
    assert!(rig.kernel.operations().is_empty());
    rig.stop.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_destination_containing_protected_subnet_rejected() {
    let rig = start(&config(&[("PROTECTED_SUBNET_VPN", "10.20.0.0/16")]));

    let err = rig
        .handle
        .submit(RouteCommand::Add(route("10.0.0.0/8", Some("192.168.0.1"))))
        .unwrap()
        .outcome()
        .await
        .unwrap_err();
    assert!(matches!(err, RoutesyncError::ProtectedSubnet { .. }));
    assert!(rig.kernel.routes_in(table()).is_empty());
    rig.stop.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_last_writer_wins_for_same_destination() {
    let rig = start(&config(&[]));

    let first = rig
        .handle
        .submit(RouteCommand::Add(route("192.168.1.0/24", Some("10.10.0.1"))))
        .unwrap();
    let second = rig
        .handle
        .submit(RouteCommand::Add(route("192.168.1.0/24", Some("10.10.0.2"))))
        .unwrap();
    first.outcome().await.unwrap();
    second.outcome().await.unwrap();

    let installed = rig.kernel.routes_in(table());
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].gateway, Some("10.10.0.2".parse().unwrap()));
    rig.stop.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_tick_restores_externally_removed_route() {
    let rig = start(&config(&[]));

    let r = route("192.168.1.0/24", Some("10.0.0.1"));
    rig.handle
        .submit(RouteCommand::Add(r.clone()))
        .unwrap()
        .outcome()
        .await
        .unwrap();

    rig.kernel.remove_external(&r.destination, table());
    assert!(!rig.kernel.contains(&r.destination, table()));

    after_tick().await;
    assert!(rig.kernel.contains(&r.destination, table()));
    rig.stop.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_tick_removes_undesired_static_entry_but_keeps_foreign_ones() {
    let rig = start(&config(&[]));

    rig.handle
        .submit(RouteCommand::Add(route("192.168.1.0/24", Some("10.0.0.1"))))
        .unwrap()
        .outcome()
        .await
        .unwrap();

    // Leftover from a previous run: stamped static, not desired any more.
    rig.kernel.insert_external(KernelRoute {
        destination: "192.168.9.0/24".parse().unwrap(),
        gateway: Some("10.0.0.9".parse().unwrap()),
        oif: None,
        table: u32::from(TABLE),
        protocol_static: true,
    });
    // Same table but another protocol owns it: not ours to touch.
    rig.kernel.insert_external(KernelRoute {
        destination: "192.168.8.0/24".parse().unwrap(),
        gateway: Some("10.0.0.8".parse().unwrap()),
        oif: None,
        table: u32::from(TABLE),
        protocol_static: false,
    });

    after_tick().await;

    let remaining: Vec<String> = rig
        .kernel
        .routes_in(table())
        .iter()
        .map(|r| r.destination.to_string())
        .collect();
    assert_eq!(remaining, ["192.168.1.0/24", "192.168.8.0/24"]);
    rig.stop.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_missing_gateway_resolved_from_kernel() {
    let rig = start(&config(&[]));
    rig.kernel.seed_fib(KernelRoute {
        destination: "0.0.0.0/0".parse().unwrap(),
        gateway: Some("172.31.0.1".parse().unwrap()),
        oif: Some(2),
        table: 254,
        protocol_static: false,
    });

    rig.handle
        .submit(RouteCommand::Add(route("198.51.100.0/24", None)))
        .unwrap()
        .outcome()
        .await
        .unwrap();

    let installed = rig.kernel.routes_in(table());
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].gateway, Some("172.31.0.1".parse().unwrap()));
    assert_eq!(installed[0].oif, Some(2));
    rig.stop.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_destination_rejected() {
    let rig = start(&config(&[]));

    let err = rig
        .handle
        .submit(RouteCommand::Add(route("198.51.100.0/24", None)))
        .unwrap()
        .outcome()
        .await
        .unwrap_err();
    assert!(matches!(err, RoutesyncError::UnreachableDestination(_)));
    assert!(rig.kernel.routes_in(table()).is_empty());
    rig.stop.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_retried_until_applied() {
    let rig = start(&config(&[]));
    rig.kernel.fail_next(RoutesyncError::Kernel {
        op: "newroute",
        errno: 16, // EBUSY
    });

    rig.handle
        .submit(RouteCommand::Add(route("192.168.1.0/24", Some("10.0.0.1"))))
        .unwrap()
        .outcome()
        .await
        .unwrap();

    assert!(rig.kernel.contains(&"192.168.1.0/24".parse().unwrap(), table()));
    let ops = rig.kernel.operations();
    assert_eq!(ops.len(), 2);
    assert!(ops[0].starts_with("replace failed"));
    rig.stop.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_non_transient_failure_surfaces_without_retry() {
    let rig = start(&config(&[]));
    rig.kernel.fail_next(RoutesyncError::Kernel {
        op: "newroute",
        errno: 1, // EPERM
    });

    let err = rig
        .handle
        .submit(RouteCommand::Add(route("192.168.1.0/24", Some("10.0.0.1"))))
        .unwrap()
        .outcome()
        .await
        .unwrap_err();
    assert!(matches!(err, RoutesyncError::Kernel { errno: 1, .. }));
    assert_eq!(rig.kernel.operations().len(), 1);
    rig.stop.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_stop_then_submit_fails() {
    let rig = start(&config(&[]));

    rig.stop.cancel();
    rig.task.await.unwrap().unwrap();
    assert_eq!(rig.handle.state(), EngineState::Stopped);

    let err = rig
        .handle
        .submit(RouteCommand::Add(route("192.168.1.0/24", Some("10.0.0.1"))))
        .unwrap_err();
    assert!(matches!(err, RoutesyncError::EngineStopped));
}
