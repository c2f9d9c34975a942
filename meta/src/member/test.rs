use std::sync::Arc;
use std::time::Duration;

use models::plan::{InsertTabletPlan, PhysicalPlan};
use models::{Node, StatusCode, TsStatus};

use super::test_util::*;
use super::NodeCharacter;
use crate::error::MetaError;
use crate::partition::SlotPartitionTable;
use crate::rpc::{AddNodeRequest, ResponseCode};

fn sorted_ids(nodes: &[Node]) -> Vec<i32> {
    let mut ids: Vec<i32> = nodes.iter().map(|n| n.identifier).collect();
    ids.sort();
    ids
}

fn leader_url() -> String {
    "127.0.0.1:9001:10001:11001".to_string()
}

#[tokio::test]
async fn test_join_with_identifier_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(LocalRegistry::default());

    let leader = test_node(&registry, test_config(vec![leader_url()]), dir.path(), 9001);
    leader.member.set_node_identifier(42);
    leader.member.build_cluster().await.unwrap();
    assert!(leader.member.is_leader());

    let joiner = test_node(&registry, test_config(vec![leader_url()]), dir.path(), 9002);
    joiner.member.set_node_identifier(42);

    // the first response turns the identifier down
    let first = leader
        .member
        .handle_add_node(AddNodeRequest {
            node: joiner.member.this_node(),
            status: joiner.member.startup_status(),
        })
        .await
        .unwrap();
    assert_eq!(first.code, ResponseCode::IdentifierConflict);

    // the joiner regenerates and the second attempt is admitted
    joiner.member.join_cluster().await.unwrap();
    assert_ne!(joiner.member.this_node().identifier, 42);
    assert!(joiner.member.is_ready());
    assert_eq!(joiner.member.character(), NodeCharacter::Follower);
    assert_eq!(*joiner.data_services.pulled_snapshots.lock(), 1);
    assert_eq!(
        sorted_ids(&joiner.member.all_nodes()),
        sorted_ids(&leader.member.all_nodes())
    );
    assert_eq!(leader.member.all_nodes().len(), 2);

    leader.member.stop().await;
    joiner.member.stop().await;
}

#[tokio::test]
async fn test_join_with_salt_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(LocalRegistry::default());

    let leader = test_node(&registry, test_config(vec![leader_url()]), dir.path(), 9001);
    leader.member.build_cluster().await.unwrap();

    let mut joiner_config = test_config(vec![leader_url()]);
    joiner_config.hash_salt += 1;
    let joiner = test_node(&registry, joiner_config, dir.path(), 9002);

    let resp = leader
        .member
        .handle_add_node(AddNodeRequest {
            node: joiner.member.this_node(),
            status: joiner.member.startup_status(),
        })
        .await
        .unwrap();
    assert_eq!(resp.code, ResponseCode::NewNodeParameterConflict);
    let check = resp.check_status.unwrap();
    assert!(!check.hash_salt_equals);
    assert!(check.partition_interval_equals);
    assert!(check.replication_num_equals);
    assert!(check.seed_node_equals);
    assert!(check.cluster_name_equals);

    // the joiner fails fast with the field diagnostic
    let err = joiner.member.join_cluster().await.unwrap_err();
    match err {
        MetaError::ConfigInconsistent { detail } => assert!(detail.contains("hash salt")),
        other => panic!("expected ConfigInconsistent, got {:?}", other),
    }

    leader.member.stop().await;
    joiner.member.stop().await;
}

/// Installs a shared two-node table into both members, bypassing the join
/// protocol, and hands back the table.
async fn install_two_node_cluster(a: &TestNode, b: &TestNode) -> SlotPartitionTable {
    a.member.set_node_identifier(1);
    b.member.set_node_identifier(2);
    let table = SlotPartitionTable::new(
        vec![a.member.this_node(), b.member.this_node()],
        31,
        1,
    );
    for node in [a, b] {
        *node.member.partition_table.write() = Some(table.clone());
        *node.member.all_nodes.write() = table.all_nodes().to_vec();
        let mut id_map = node.member.id_node_map.write();
        for n in table.all_nodes() {
            id_map.insert(n.identifier, n.clone());
        }
    }
    a.member.on_election_wins();
    b.member.set_character(NodeCharacter::Follower);
    b.member.set_leader(Some(a.member.this_node()));
    table
}

#[tokio::test]
async fn test_tablet_split_reassembly() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(LocalRegistry::default());
    let a = test_node(&registry, test_config(vec![]), dir.path(), 9001);
    let b = test_node(&registry, test_config(vec![]), dir.path(), 9002);
    let table = install_two_node_cluster(&a, &b).await;

    // partitions landing on each node's group (interval 1000)
    let partition_a = (0..10_000)
        .find(|&p| table.route("root.sg", p).unwrap().header().identifier == 1)
        .unwrap();
    let partition_b = (0..10_000)
        .find(|&p| table.route("root.sg", p).unwrap().header().identifier == 2)
        .unwrap();

    // rows 0 and 2 route to group A, row 1 to group B
    let times = vec![partition_a * 1000, partition_b * 1000, partition_a * 1000 + 1];
    let plan = PhysicalPlan::InsertTablet(InsertTabletPlan {
        device: "root.sg.d1".to_string(),
        times,
        measurements: vec!["s1".to_string()],
        columns: vec![vec![1.0, 2.0, 3.0]],
        row_indices: None,
    });

    // group B fails its single row
    let row_failure = TsStatus::new(StatusCode::ExecuteStatementError, "row failed");
    b.data_services
        .responses
        .lock()
        .insert(2, TsStatus::multiple_error(vec![row_failure.clone()]));

    let status = a.member.execute_non_query_plan(&plan).await;
    assert_eq!(status.code, StatusCode::MultipleError);
    assert_eq!(status.sub_status.len(), 3);
    assert_eq!(status.sub_status[0].code, StatusCode::Success);
    assert_eq!(status.sub_status[1].code, StatusCode::ExecuteStatementError);
    assert_eq!(status.sub_status[1].message, "row failed");
    assert_eq!(status.sub_status[2].code, StatusCode::Success);
}

#[tokio::test]
async fn test_remove_node_protocol() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(LocalRegistry::default());
    let a = test_node(&registry, test_config(vec![]), dir.path(), 9001);
    let b = test_node(&registry, test_config(vec![]), dir.path(), 9002);
    install_two_node_cluster(&a, &b).await;

    let code = a
        .member
        .handle_remove_node(b.member.this_node())
        .await
        .unwrap();
    assert_eq!(code, ResponseCode::Agree);
    assert_eq!(sorted_ids(&a.member.all_nodes()), vec![1]);
    // the exiled node knows it is out
    assert!(!b.member.all_nodes().contains(&b.member.this_node()));

    // shrinking below the replica count is rejected
    let code = a
        .member
        .handle_remove_node(a.member.this_node())
        .await
        .unwrap();
    assert_eq!(code, ResponseCode::ClusterTooSmall);

    // an unknown node is rejected
    let stranger = Node::new("127.0.0.1", 9999, 10999, 11999);
    // restore a second member so the size check passes
    let c = test_node(&registry, test_config(vec![]), dir.path(), 9003);
    c.member.set_node_identifier(3);
    a.member.apply_add_node(&c.member.this_node()).await;
    let code = a.member.handle_remove_node(stranger).await.unwrap();
    assert_eq!(code, ResponseCode::Reject);
}

#[tokio::test]
async fn test_heartbeat_delivers_table_to_blind_node() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(LocalRegistry::default());
    let a = test_node(&registry, test_config(vec![]), dir.path(), 9001);
    let b = test_node(&registry, test_config(vec![]), dir.path(), 9002);
    let table = install_two_node_cluster(&a, &b).await;
    // the follower lost its table
    *b.member.partition_table.write() = None;

    // first heartbeat: the follower asks for the table
    a.member.send_heartbeats_once().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(a.member.is_node_blind(&b.member.this_node()));

    // second heartbeat piggybacks the full snapshot
    a.member.send_heartbeats_once().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!a.member.is_node_blind(&b.member.this_node()));
    let restored = b.member.partition_table.read().clone().unwrap();
    assert_eq!(restored, table);
    assert_eq!(
        sorted_ids(&b.member.all_nodes()),
        sorted_ids(&a.member.all_nodes())
    );
}

#[tokio::test]
async fn test_meta_plan_replicates_to_every_member() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(LocalRegistry::default());
    let a = test_node(&registry, test_config(vec![]), dir.path(), 9001);
    let b = test_node(&registry, test_config(vec![]), dir.path(), 9002);
    install_two_node_cluster(&a, &b).await;

    let plan = PhysicalPlan::SetStorageGroup {
        storage_group: "root.sg2".to_string(),
    };
    let status = a.member.execute_non_query_plan(&plan).await;
    assert!(status.is_success(), "unexpected status: {}", status);
    assert_eq!(a.executor.executed.lock().as_slice(), &[plan.clone()]);
    assert_eq!(b.executor.executed.lock().as_slice(), &[plan]);
}

#[tokio::test]
async fn test_global_data_plan_reaches_every_group() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(LocalRegistry::default());
    let a = test_node(&registry, test_config(vec![]), dir.path(), 9001);
    let b = test_node(&registry, test_config(vec![]), dir.path(), 9002);
    install_two_node_cluster(&a, &b).await;

    let plan = PhysicalPlan::DeleteTimeSeries {
        paths: vec!["root.sg.d1.*".to_string()],
    };
    let status = a.member.execute_non_query_plan(&plan).await;
    assert!(status.is_success(), "unexpected status: {}", status);

    // both groups saw the plan, with wildcards frozen
    let frozen = PhysicalPlan::DeleteTimeSeries {
        paths: vec!["root.sg.d1".to_string()],
    };
    assert_eq!(a.data_services.executed.lock()[0].1, frozen);
    assert_eq!(b.data_services.executed.lock()[0].1, frozen);
}

#[tokio::test]
async fn test_partition_table_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(LocalRegistry::default());
    {
        let leader = test_node(&registry, test_config(vec![leader_url()]), dir.path(), 9001);
        leader.member.set_node_identifier(42);
        leader.member.build_cluster().await.unwrap();
        leader.member.stop().await;
    }

    // a fresh process on the same data directory
    let registry = Arc::new(LocalRegistry::default());
    let revived = test_node(&registry, test_config(vec![leader_url()]), dir.path(), 9001);
    assert_eq!(revived.member.this_node().identifier, 42);
    revived.member.load_partition_table().await.unwrap();
    let table = revived.member.partition_table.read().clone().unwrap();
    assert_eq!(sorted_ids(table.all_nodes()), vec![42]);
}

#[tokio::test]
async fn test_auto_create_retry_on_missing_timeseries() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(LocalRegistry::default());
    let a = test_node(&registry, test_config(vec![]), dir.path(), 9001);
    let b = test_node(&registry, test_config(vec![]), dir.path(), 9002);
    let table = install_two_node_cluster(&a, &b).await;

    let partition_a = (0..10_000)
        .find(|&p| table.route("root.sg", p).unwrap().header().identifier == 1)
        .unwrap();
    // the first execution reports a missing series, the retry succeeds
    a.data_services
        .responses
        .lock()
        .insert(1, TsStatus::new(StatusCode::TimeseriesNotExist, "no s1"));
    let plan = PhysicalPlan::InsertRow(models::plan::InsertRowPlan {
        device: "root.sg.d1".to_string(),
        time: partition_a * 1000,
        measurements: vec!["s1".to_string()],
        values: vec![1.0],
    });

    let status = a.member.execute_non_query_plan(&plan).await;

    assert!(status.is_success(), "unexpected status: {}", status);
    assert_eq!(
        a.metadata.created_timeseries.lock().as_slice(),
        &["root.sg.d1.s1".to_string()]
    );
    assert_eq!(a.data_services.executed.lock().len(), 2);
}
