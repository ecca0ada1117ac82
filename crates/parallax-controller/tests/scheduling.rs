//! Integration tests for the scheduling plane: reservation, reconciliation
//! and deployment replacement against a mock runner fleet.

mod common;

use common::TestCluster;
use parallax_proto::RunnerState;

#[tokio::test]
async fn cold_start_deploys_to_idle_runner() {
    let cluster = TestCluster::new();
    let (runner_key, endpoint) = cluster.add_runner("go").await;
    let deployment = cluster.create_deployment("time", "go", b"time v1").await;
    cluster.controller.replace_deploy(&deployment, 1).await.unwrap();

    cluster.reconciler.tick().await;

    // The runner was reserved, confirmed and handed the deployment.
    let mock = cluster.mock(&endpoint);
    assert_eq!(
        mock.operations(),
        vec![
            format!("reserve {deployment}"),
            format!("deploy {deployment}"),
        ],
    );
    let runner = cluster.store.get_runner(&runner_key).await.unwrap();
    assert_eq!(runner.state, RunnerState::Reserved);
    assert_eq!(runner.deployment, Some(deployment));

    // The runner acknowledges; the routing table picks it up and the
    // reconciler goes quiet.
    cluster.ack_deploys().await;
    let routes = cluster.store.routing_table("time").await.unwrap();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].endpoint, endpoint);

    let before = cluster.total_operations();
    cluster.reconciler.tick().await;
    assert_eq!(cluster.total_operations(), before);
}

#[tokio::test]
async fn reconciliation_converges_on_replica_targets() {
    let cluster = TestCluster::new();
    for _ in 0..3 {
        cluster.add_runner("go").await;
    }
    let first = cluster.create_deployment("time", "go", b"time v1").await;
    let second = cluster.create_deployment("echo", "go", b"echo v1").await;
    cluster.controller.replace_deploy(&first, 2).await.unwrap();
    cluster.controller.replace_deploy(&second, 1).await.unwrap();

    for _ in 0..5 {
        cluster.reconcile_round().await;
        if cluster
            .store
            .deployments_needing_reconciliation()
            .await
            .unwrap()
            .is_empty()
        {
            break;
        }
    }

    let rows = cluster.store.deployments_needing_reconciliation().await.unwrap();
    assert!(rows.is_empty(), "reconciliation did not converge: {rows:?}");
    assert_eq!(cluster.store.runners_for_deployment(&first).await.unwrap().len(), 2);
    assert_eq!(cluster.store.runners_for_deployment(&second).await.unwrap().len(), 1);

    // Converged means quiet: further ticks dispatch nothing.
    let before = cluster.total_operations();
    cluster.reconcile_round().await;
    assert_eq!(cluster.total_operations(), before);
}

#[tokio::test]
async fn rejected_reservation_rolls_the_runner_back() {
    let cluster = TestCluster::new();
    let (runner_key, endpoint) = cluster.add_runner("go").await;
    let deployment = cluster.create_deployment("time", "go", b"time v1").await;
    cluster.controller.replace_deploy(&deployment, 1).await.unwrap();

    // The runner refuses the reservation RPC.
    let mock = cluster.mock(&endpoint);
    *mock.fail_reserve.lock() = Some("runner shutting down".into());

    cluster.reconciler.tick().await;

    let runner = cluster.store.get_runner(&runner_key).await.unwrap();
    assert_eq!(runner.state, RunnerState::Idle);
    assert_eq!(runner.deployment, None);

    // Once the runner accepts again, the next tick succeeds.
    *mock.fail_reserve.lock() = None;
    cluster.reconcile_round().await;
    let runner = cluster.store.get_runner(&runner_key).await.unwrap();
    assert_eq!(runner.state, RunnerState::Assigned);
}

#[tokio::test]
async fn replacing_a_deployment_migrates_its_replicas() {
    let cluster = TestCluster::new();
    let (runner_key, endpoint) = cluster.add_runner("go").await;
    let v1 = cluster.create_deployment("time", "go", b"time v1").await;
    cluster.controller.replace_deploy(&v1, 1).await.unwrap();
    cluster.reconcile_round().await;
    assert_eq!(
        cluster.store.get_runner(&runner_key).await.unwrap().deployment,
        Some(v1),
    );

    // Replace v1 with v2: the old target drops to zero atomically.
    let v2 = cluster.create_deployment("time", "go", b"time v2").await;
    cluster.controller.replace_deploy(&v2, 1).await.unwrap();
    assert_eq!(cluster.store.get_deployment(&v1).await.unwrap().min_replicas, 0);
    assert_eq!(cluster.store.get_deployment(&v2).await.unwrap().min_replicas, 1);

    // One round terminates the v1 replica and redeploys the runner on v2.
    cluster.reconcile_round().await;
    let ops = cluster.mock(&endpoint).operations();
    assert!(ops.contains(&format!("terminate {v1}")), "ops: {ops:?}");
    assert!(ops.contains(&format!("deploy {v2}")), "ops: {ops:?}");

    let runner = cluster.store.get_runner(&runner_key).await.unwrap();
    assert_eq!(runner.state, RunnerState::Assigned);
    assert_eq!(runner.deployment, Some(v2));

    let routes = cluster.store.routing_table("time").await.unwrap();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].deployment, v2);
}
