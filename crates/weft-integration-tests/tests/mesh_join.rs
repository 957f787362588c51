//! Integration test: a node joins a 1-node mesh.
//!
//! Exercises the full three-step bootstrap: mesh snapshot request,
//! direct join notification with ack, and join broadcast, then verifies
//! the converged state on both sides.

use weft_integration_tests::SimMesh;
use weft_store::queries::{membership, nodes, routes};

#[tokio::test]
async fn join_single_node_mesh() {
    let mesh = SimMesh::new();
    let seed = mesh.spawn_seed(1, None).await;
    let joiner = mesh.spawn_member(2, 1).await;

    // Joiner: the seed's row arrived with region_id NULL and the route
    // pair to the seed exists.
    {
        let conn = joiner.db().lock().await;
        let seed_row = nodes::get(&conn, 1).expect("seed row on joiner");
        assert!(seed_row.seed_node);
        assert!(seed_row.region_id.is_none());
        assert!(routes::exists(&conn, 2, 1).expect("forward route"));
        assert!(routes::exists(&conn, 1, 2).expect("reverse route"));
        assert_eq!(membership::count_active(&conn).expect("count"), 2);
    }

    // Seed: the joiner was upserted and routes stitched in both
    // directions.
    {
        let conn = seed.db().lock().await;
        assert!(nodes::exists(&conn, 2).expect("joiner row on seed"));
        assert!(routes::exists(&conn, 1, 2).expect("forward route"));
        assert!(routes::exists(&conn, 2, 1).expect("reverse route"));
        assert_eq!(membership::count_active(&conn).expect("count"), 2);
        assert_eq!(nodes::list(&conn).expect("list").len(), 2);
    }

    // Both sides agree the mesh is healthy.
    let seed_state = seed.consensus().trigger_consensus_check().await.expect("check");
    let joiner_state = joiner.consensus().trigger_consensus_check().await.expect("check");
    assert!(!seed_state.split_detected);
    assert!(!joiner_state.split_detected);
    assert_eq!(seed_state.total_nodes, 2);
    assert_eq!(joiner_state.total_nodes, 2);
    assert!(seed.can_accept_writes().await);
    assert!(joiner.can_accept_writes().await);

    joiner.stop().await;
    seed.stop().await;
}

#[tokio::test]
async fn repeated_apply_of_snapshot_is_idempotent() {
    let mesh = SimMesh::new();
    let seed = mesh.spawn_seed(1, None).await;
    let joiner = mesh.spawn_member(2, 1).await;

    let snapshot = seed.sync().mesh_data_for_sync().await.expect("export");
    joiner
        .sync()
        .apply_synced_mesh_data(&snapshot)
        .await
        .expect("re-apply");

    let conn = joiner.db().lock().await;
    assert_eq!(nodes::list(&conn).expect("list").len(), 2);
    // Still exactly one route per direction.
    assert_eq!(routes::list(&conn).expect("routes").len(), 2);
    drop(conn);

    joiner.stop().await;
    seed.stop().await;
}
