//! Engine facade tests: request routing, response headers, and the
//! lifecycle-event fan-out into the log reader.

mod common;

use std::sync::Arc;

use common::LocalRaftHost;
use regatta_raft::{EntryInfo, LogRange, NodeInfo, SystemEvents};
use regatta_storage::command::{Compare, CompareOp, CompareTarget, RequestOp, Txn};
use regatta_storage::config::{EngineConfig, LoopConfig};
use regatta_storage::engine::{
    DeleteRequest, Engine, PutRequest, RangeRequest, TxnRequest,
};
use regatta_storage::errors::StorageError;

fn dormant_loops() -> LoopConfig {
    LoopConfig {
        reconcile_interval: std::time::Duration::from_secs(3600),
        cleanup_interval: std::time::Duration::from_secs(3600),
        cleanup_grace_period: std::time::Duration::ZERO,
        cleanup_timeout: std::time::Duration::from_secs(3600),
    }
}

async fn start_engine(host: &Arc<LocalRaftHost>, dir: &std::path::Path) -> Engine {
    common::init_tracing();
    let mut cfg = EngineConfig::new(1, dir.to_path_buf());
    cfg.initial_members.insert(1, "local".to_string());
    let engine = Engine::with_loops(host.clone(), host.clone(), cfg, dormant_loops());
    engine.start().unwrap();
    engine.manager().wait_until_ready().await.unwrap();
    engine
}

#[tokio::test]
async fn requests_route_to_the_table_shard() {
    let dir = tempfile::tempdir().unwrap();
    let host = LocalRaftHost::new(1);
    let engine = start_engine(&host, dir.path()).await;

    let created = engine.manager().create_table("kv").await.unwrap();

    let put = engine
        .put(
            PutRequest {
                table: b"kv".to_vec(),
                key: b"hello".to_vec(),
                value: b"world".to_vec(),
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(put.header.replica_id, 1);
    assert_eq!(put.header.shard_id, created.shard_id);
    assert_eq!(put.header.raft_leader_id, 1);
    assert_eq!(put.header.raft_term, 1);

    let range = engine
        .range(
            RangeRequest {
                table: b"kv".to_vec(),
                key: b"hello".to_vec(),
                linearizable: true,
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(range.response.kvs.len(), 1);
    assert_eq!(range.response.kvs[0].value, b"world".to_vec());

    // Stale reads skip the barrier but still serve committed data here.
    let stale = engine
        .range(
            RangeRequest {
                table: b"kv".to_vec(),
                key: b"hello".to_vec(),
                linearizable: false,
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(stale.response.kvs, range.response.kvs);

    let txn = engine
        .txn(
            TxnRequest {
                table: b"kv".to_vec(),
                txn: Txn {
                    compare: vec![Compare {
                        key: b"hello".to_vec(),
                        target: CompareTarget::Value,
                        op: CompareOp::Equal,
                        value: b"world".to_vec(),
                    }],
                    success: vec![RequestOp::Put {
                        key: b"hello2".to_vec(),
                        value: b"again".to_vec(),
                        prev_kv: false,
                    }],
                    failure: vec![],
                },
            },
            None,
        )
        .await
        .unwrap();
    assert!(txn.succeeded);

    let delete = engine
        .delete(
            DeleteRequest {
                table: b"kv".to_vec(),
                key: b"hello".to_vec(),
                range_end: None,
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(delete.header.shard_id, created.shard_id);

    let gone = engine
        .range(
            RangeRequest {
                table: b"kv".to_vec(),
                key: b"hello".to_vec(),
                linearizable: true,
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
    assert!(gone.response.kvs.is_empty());

    let err = engine
        .put(
            PutRequest {
                table: b"nope".to_vec(),
                key: b"k".to_vec(),
                value: b"v".to_vec(),
            },
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::TableNotFound));

    engine.close();
}

#[tokio::test]
async fn log_queries_follow_lifecycle_events() {
    let dir = tempfile::tempdir().unwrap();
    let host = LocalRaftHost::new(1);
    let engine = start_engine(&host, dir.path()).await;

    let created = engine.manager().create_table("kv").await.unwrap();
    for i in 0..20 {
        engine
            .put(
                PutRequest {
                    table: b"kv".to_vec(),
                    key: format!("k{i}").into_bytes(),
                    value: format!("v{i}").into_bytes(),
                },
                None,
            )
            .await
            .unwrap();
    }

    // Events for other replicas are not ours to act on.
    engine.node_ready(NodeInfo {
        shard_id: created.shard_id,
        replica_id: 2,
    });
    let err = engine
        .query_log(created.shard_id, LogRange::new(1, 10), u64::MAX)
        .unwrap_err();
    assert!(matches!(err, StorageError::ShardNotReady));

    engine.node_ready(NodeInfo {
        shard_id: created.shard_id,
        replica_id: 1,
    });
    let entries = engine
        .query_log(created.shard_id, LogRange::new(1, 21), u64::MAX)
        .unwrap();
    assert_eq!(entries.len(), 20);
    assert_eq!(entries[0].index, 1);
    assert_eq!(entries[19].index, 20);

    // Compaction invalidates the cached prefix.
    host.compact_log(created.shard_id, 10);
    engine.log_compacted(EntryInfo {
        shard_id: created.shard_id,
        replica_id: 1,
        index: 9,
    });
    let err = engine
        .query_log(created.shard_id, LogRange::new(1, 21), u64::MAX)
        .unwrap_err();
    assert!(matches!(err, StorageError::LogAhead));
    let entries = engine
        .query_log(created.shard_id, LogRange::new(10, 21), u64::MAX)
        .unwrap();
    assert_eq!(entries.len(), 11);

    engine.close();
}
