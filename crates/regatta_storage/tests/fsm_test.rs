//! State machine tests: open/reopen semantics, batched apply,
//! transactions, snapshot handoff and replica determinism.

use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use regatta_raft::{Entry, StateMachine};
use regatta_storage::command::{
    Command, CommandResult, Compare, CompareOp, CompareTarget, KeyValue, QueryRequest,
    QueryResponse, RangeQuery, RequestOp, ResponseOp, Txn, RESULT_SUCCESS,
};
use regatta_storage::errors::is_stopped;
use regatta_storage::fsm::Fsm;
use regatta_storage::stats::FsmStats;

const TABLE: &[u8] = b"test";

fn new_fsm(dir: &Path, shard_id: u64, replica_id: u64) -> Fsm {
    Fsm::new(
        "test",
        dir,
        shard_id,
        replica_id,
        Arc::new(fjall::BlockCache::with_capacity_bytes(16 * 1024 * 1024)),
        8 * 1024,
        Arc::new(FsmStats::default()),
    )
}

fn entry(index: u64, cmd: &Command) -> Entry {
    Entry {
        index,
        term: 1,
        command: cmd.encode(),
    }
}

fn put_entry(index: u64, key: &[u8], value: &[u8]) -> Entry {
    entry(
        index,
        &Command::put(TABLE.to_vec(), KeyValue::new(key.to_vec(), value.to_vec())),
    )
}

fn lookup_value(fsm: &Fsm, key: &[u8]) -> Option<Vec<u8>> {
    let query = QueryRequest::Range(RangeQuery {
        key: key.to_vec(),
        ..Default::default()
    });
    let raw = fsm.lookup(&query.encode()).unwrap();
    match QueryResponse::decode(&raw).unwrap() {
        QueryResponse::Range(range) => range.kvs.into_iter().next().map(|kv| kv.value),
        other => panic!("unexpected response {other:?}"),
    }
}

fn range_keys(fsm: &Fsm, key: &[u8], range_end: &[u8]) -> Vec<Vec<u8>> {
    let query = QueryRequest::Range(RangeQuery {
        key: key.to_vec(),
        range_end: Some(range_end.to_vec()),
        keys_only: true,
        ..Default::default()
    });
    let raw = fsm.lookup(&query.encode()).unwrap();
    match QueryResponse::decode(&raw).unwrap() {
        QueryResponse::Range(range) => range.kvs.into_iter().map(|kv| kv.key).collect(),
        other => panic!("unexpected response {other:?}"),
    }
}

fn local_index(fsm: &Fsm) -> u64 {
    let raw = fsm.lookup(&QueryRequest::LocalIndex.encode()).unwrap();
    match QueryResponse::decode(&raw).unwrap() {
        QueryResponse::LocalIndex(index) => index,
        other => panic!("unexpected response {other:?}"),
    }
}

#[test]
fn open_rejects_zero_ids() {
    let dir = tempfile::tempdir().unwrap();

    let mut no_replica = new_fsm(dir.path(), 1, 0);
    assert!(no_replica.open().is_err());

    let mut no_shard = new_fsm(dir.path(), 0, 1);
    assert!(no_shard.open().is_err());
}

#[test]
fn open_fresh_store_returns_zero() {
    let dir = tempfile::tempdir().unwrap();
    let mut fsm = new_fsm(dir.path(), 1, 1);
    assert_eq!(fsm.open().unwrap(), 0);
    fsm.close().unwrap();
}

#[test]
fn reopen_returns_last_applied_index() {
    let dir = tempfile::tempdir().unwrap();

    let mut fsm = new_fsm(dir.path(), 1, 1);
    assert_eq!(fsm.open().unwrap(), 0);
    fsm.update(&[put_entry(10, b"foo", b"bar")]).unwrap();
    fsm.close().unwrap();
    drop(fsm);

    let mut reopened = new_fsm(dir.path(), 1, 1);
    assert_eq!(reopened.open().unwrap(), 10);
    assert_eq!(lookup_value(&reopened, b"foo"), Some(b"bar".to_vec()));
    reopened.close().unwrap();
}

#[test]
fn batch_update_applies_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut fsm = new_fsm(dir.path(), 1, 1);
    fsm.open().unwrap();

    let results = fsm
        .update(&[
            entry(
                1,
                &Command::put(TABLE.to_vec(), KeyValue::new(b"test".to_vec(), b"test".to_vec())),
            ),
            entry(2, &Command::delete(TABLE.to_vec(), b"test".to_vec(), None)),
        ])
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].value, RESULT_SUCCESS);
    assert_eq!(results[1].value, RESULT_SUCCESS);
    assert_eq!(lookup_value(&fsm, b"test"), None);
    assert_eq!(local_index(&fsm), 2);
}

#[test]
fn wildcard_delete_clears_user_keys_only() {
    let dir = tempfile::tempdir().unwrap();
    let mut fsm = new_fsm(dir.path(), 1, 1);
    fsm.open().unwrap();

    fsm.update(&[entry(
        1,
        &Command::put_batch(
            TABLE.to_vec(),
            vec![
                KeyValue::new(b"a".to_vec(), b"1".to_vec()),
                KeyValue::new(b"b".to_vec(), b"2".to_vec()),
                KeyValue::new(b"c".to_vec(), b"3".to_vec()),
            ],
        ),
    )])
    .unwrap();

    fsm.update(&[entry(
        2,
        &Command::delete(TABLE.to_vec(), b"".to_vec(), Some(vec![0xff])),
    )])
    .unwrap();

    assert!(range_keys(&fsm, b"", &[0xff]).is_empty());
    // System bookkeeping survives the wildcard.
    assert_eq!(local_index(&fsm), 2);
}

#[test]
fn bounded_delete_range_is_end_exclusive() {
    let dir = tempfile::tempdir().unwrap();
    let mut fsm = new_fsm(dir.path(), 1, 1);
    fsm.open().unwrap();

    fsm.update(&[entry(
        1,
        &Command::put_batch(
            TABLE.to_vec(),
            vec![
                KeyValue::new(b"a".to_vec(), b"1".to_vec()),
                KeyValue::new(b"b".to_vec(), b"2".to_vec()),
                KeyValue::new(b"c".to_vec(), b"3".to_vec()),
            ],
        ),
    )])
    .unwrap();

    fsm.update(&[entry(
        2,
        &Command::delete(TABLE.to_vec(), b"a".to_vec(), Some(b"b".to_vec())),
    )])
    .unwrap();
    assert_eq!(range_keys(&fsm, b"", &[0xff]), vec![b"b".to_vec(), b"c".to_vec()]);

    // range_end equal to the start key addresses nothing.
    let results = fsm
        .update(&[entry(
            3,
            &Command::delete(TABLE.to_vec(), b"b".to_vec(), Some(b"b".to_vec())),
        )])
        .unwrap();
    assert_eq!(results[0].value, RESULT_SUCCESS);
    assert_eq!(range_keys(&fsm, b"", &[0xff]), vec![b"b".to_vec(), b"c".to_vec()]);
}

#[test]
fn reapplying_applied_prefix_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let mut fsm = new_fsm(dir.path(), 1, 1);
    fsm.open().unwrap();

    let first = put_entry(1, b"a", b"1");
    let second = put_entry(2, b"b", b"2");
    let third = entry(3, &Command::delete(TABLE.to_vec(), b"a".to_vec(), None));
    fsm.update(&[first.clone(), second.clone(), third]).unwrap();
    let hash = fsm.get_hash().unwrap();

    let results = fsm.update(&[first, second]).unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(fsm.get_hash().unwrap(), hash);
    assert_eq!(local_index(&fsm), 3);
    assert_eq!(lookup_value(&fsm, b"a"), None);
}

#[test]
fn txn_sees_earlier_writes_and_its_own() {
    let dir = tempfile::tempdir().unwrap();
    let mut fsm = new_fsm(dir.path(), 1, 1);
    fsm.open().unwrap();

    let txn = Txn {
        compare: vec![Compare {
            key: b"foo".to_vec(),
            target: CompareTarget::Value,
            op: CompareOp::Equal,
            value: b"1".to_vec(),
        }],
        success: vec![
            RequestOp::Put {
                key: b"bar".to_vec(),
                value: b"2".to_vec(),
                prev_kv: false,
            },
            RequestOp::Range {
                key: b"bar".to_vec(),
                range_end: None,
                limit: 0,
                keys_only: false,
                count_only: false,
            },
        ],
        failure: vec![],
    };

    // The predicate watches a key written by an earlier entry of the
    // same batch; the trailing range op must see the txn's own put.
    let results = fsm
        .update(&[
            put_entry(1, b"foo", b"1"),
            entry(2, &Command::txn(TABLE.to_vec(), txn)),
        ])
        .unwrap();

    assert_eq!(results[1].value, RESULT_SUCCESS);
    let txn_result = CommandResult::decode(&results[1].data).unwrap();
    assert!(txn_result.succeeded);
    match &txn_result.responses[1] {
        ResponseOp::Range(range) => {
            assert_eq!(range.kvs.len(), 1);
            assert_eq!(range.kvs[0].value, b"2".to_vec());
        }
        other => panic!("unexpected response {other:?}"),
    }
    assert_eq!(lookup_value(&fsm, b"bar"), Some(b"2".to_vec()));
}

#[test]
fn txn_failure_branch_runs_on_failed_predicate() {
    let dir = tempfile::tempdir().unwrap();
    let mut fsm = new_fsm(dir.path(), 1, 1);
    fsm.open().unwrap();

    fsm.update(&[put_entry(1, b"k", b"actual")]).unwrap();

    let txn = Txn {
        compare: vec![Compare {
            key: b"k".to_vec(),
            target: CompareTarget::Value,
            op: CompareOp::Equal,
            value: b"expected".to_vec(),
        }],
        success: vec![RequestOp::Put {
            key: b"k".to_vec(),
            value: b"success".to_vec(),
            prev_kv: false,
        }],
        failure: vec![RequestOp::Put {
            key: b"k".to_vec(),
            value: b"failure".to_vec(),
            prev_kv: true,
        }],
    };
    let results = fsm
        .update(&[entry(2, &Command::txn(TABLE.to_vec(), txn))])
        .unwrap();

    let txn_result = CommandResult::decode(&results[0].data).unwrap();
    assert!(!txn_result.succeeded);
    match &txn_result.responses[0] {
        ResponseOp::Put { prev_kv } => {
            assert_eq!(prev_kv.as_ref().unwrap().value, b"actual".to_vec());
        }
        other => panic!("unexpected response {other:?}"),
    }
    assert_eq!(lookup_value(&fsm, b"k"), Some(b"failure".to_vec()));
}

#[test]
fn txn_index_predicates_compare_system_state() {
    let dir = tempfile::tempdir().unwrap();
    let mut fsm = new_fsm(dir.path(), 1, 1);
    fsm.open().unwrap();

    let mut with_leader = Command::put(TABLE.to_vec(), KeyValue::new(b"k".to_vec(), b"v".to_vec()));
    with_leader.leader_index = Some(42);
    fsm.update(&[entry(7, &with_leader)]).unwrap();

    let txn = Txn {
        compare: vec![
            Compare {
                key: Vec::new(),
                target: CompareTarget::LatestIndex,
                op: CompareOp::Equal,
                value: 7u64.to_le_bytes().to_vec(),
            },
            Compare {
                key: Vec::new(),
                target: CompareTarget::Mod,
                op: CompareOp::Equal,
                value: 42u64.to_le_bytes().to_vec(),
            },
        ],
        success: vec![RequestOp::Put {
            key: b"verdict".to_vec(),
            value: b"ok".to_vec(),
            prev_kv: false,
        }],
        failure: vec![],
    };
    let results = fsm
        .update(&[entry(8, &Command::txn(TABLE.to_vec(), txn))])
        .unwrap();
    assert!(CommandResult::decode(&results[0].data).unwrap().succeeded);
    assert_eq!(lookup_value(&fsm, b"verdict"), Some(b"ok".to_vec()));
}

#[test]
fn txn_delete_range_reports_deleted_keys() {
    let dir = tempfile::tempdir().unwrap();
    let mut fsm = new_fsm(dir.path(), 1, 1);
    fsm.open().unwrap();

    fsm.update(&[entry(
        1,
        &Command::put_batch(
            TABLE.to_vec(),
            vec![
                KeyValue::new(b"p1".to_vec(), b"1".to_vec()),
                KeyValue::new(b"p2".to_vec(), b"2".to_vec()),
                KeyValue::new(b"q1".to_vec(), b"3".to_vec()),
            ],
        ),
    )])
    .unwrap();

    let txn = Txn {
        compare: vec![],
        success: vec![RequestOp::DeleteRange {
            key: b"p".to_vec(),
            range_end: Some(b"q".to_vec()),
            prev_kv: true,
        }],
        failure: vec![],
    };
    let results = fsm
        .update(&[entry(2, &Command::txn(TABLE.to_vec(), txn))])
        .unwrap();
    let txn_result = CommandResult::decode(&results[0].data).unwrap();
    match &txn_result.responses[0] {
        ResponseOp::DeleteRange { deleted, prev_kvs } => {
            assert_eq!(*deleted, 2);
            assert_eq!(prev_kvs.len(), 2);
        }
        other => panic!("unexpected response {other:?}"),
    }
    assert_eq!(range_keys(&fsm, b"", &[0xff]), vec![b"q1".to_vec()]);
}

fn fill(fsm: &mut Fsm) -> u64 {
    let mut index = 0;
    for chunk in 0..10 {
        let batch: Vec<KeyValue> = (0..1_000)
            .map(|i| {
                let n = chunk * 1_000 + i;
                KeyValue::new(format!("test{n}").into_bytes(), b"test".to_vec())
            })
            .collect();
        index += 1;
        fsm.update(&[entry(index, &Command::put_batch(TABLE.to_vec(), batch))])
            .unwrap();
    }
    let large: Vec<KeyValue> = (0..10)
        .map(|i| KeyValue::new(format!("testlarge{i}").into_bytes(), vec![b'x'; 2048]))
        .collect();
    index += 1;
    fsm.update(&[entry(index, &Command::put_batch(TABLE.to_vec(), large))])
        .unwrap();
    index
}

#[test]
fn snapshot_handoff_reproduces_state() {
    let src_dir = tempfile::tempdir().unwrap();
    let mut source = new_fsm(src_dir.path(), 1, 1);
    source.open().unwrap();
    let last = fill(&mut source);

    let ctx = source.prepare_snapshot().unwrap();
    let mut stream = Vec::new();
    let cancel = AtomicBool::new(false);
    source.save_snapshot(ctx, &mut stream, &cancel).unwrap();

    let dst_dir = tempfile::tempdir().unwrap();
    let mut target = new_fsm(dst_dir.path(), 1, 2);
    target.open().unwrap();
    target
        .recover_from_snapshot(&mut stream.as_slice(), &cancel)
        .unwrap();

    assert_eq!(target.get_hash().unwrap(), source.get_hash().unwrap());
    assert_eq!(local_index(&target), last);
    assert_eq!(lookup_value(&target, b"test123"), Some(b"test".to_vec()));
    assert_eq!(
        lookup_value(&target, b"testlarge3"),
        Some(vec![b'x'; 2048])
    );
}

/// Reader that sleeps on every read call, giving the cancel flag time
/// to land mid-recovery.
struct SlowReader<'a> {
    inner: &'a [u8],
}

impl Read for SlowReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        std::thread::sleep(Duration::from_millis(5));
        self.inner.read(buf)
    }
}

#[test]
fn cancelled_recovery_returns_stopped() {
    let src_dir = tempfile::tempdir().unwrap();
    let mut source = new_fsm(src_dir.path(), 1, 1);
    source.open().unwrap();
    fill(&mut source);

    let ctx = source.prepare_snapshot().unwrap();
    let mut stream = Vec::new();
    let cancel = AtomicBool::new(false);
    source.save_snapshot(ctx, &mut stream, &cancel).unwrap();

    let dst_dir = tempfile::tempdir().unwrap();
    let mut target = new_fsm(dst_dir.path(), 1, 2);
    target.open().unwrap();

    let cancel = Arc::new(AtomicBool::new(false));
    let trigger = cancel.clone();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(10));
        trigger.store(true, Ordering::Relaxed);
    });

    let mut slow = SlowReader {
        inner: stream.as_slice(),
    };
    let err = target
        .recover_from_snapshot(&mut slow, &cancel)
        .unwrap_err();
    assert!(is_stopped(&err), "unexpected error: {err:?}");
    handle.join().unwrap();

    // The receiving state machine must still shut down cleanly.
    target.close().unwrap();
}

#[test]
fn cancelled_save_returns_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let mut fsm = new_fsm(dir.path(), 1, 1);
    fsm.open().unwrap();
    fill(&mut fsm);

    let ctx = fsm.prepare_snapshot().unwrap();
    let cancel = AtomicBool::new(true);
    let mut sink = Vec::new();
    let err = fsm.save_snapshot(ctx, &mut sink, &cancel).unwrap_err();
    assert!(is_stopped(&err), "unexpected error: {err:?}");
}

#[test]
fn replicas_applying_same_log_converge() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let mut a = new_fsm(dir_a.path(), 1, 1);
    let mut b = new_fsm(dir_b.path(), 1, 2);
    a.open().unwrap();
    b.open().unwrap();

    let batches: Vec<Vec<Entry>> = vec![
        vec![
            put_entry(1, b"alpha", b"1"),
            put_entry(2, b"beta", b"2"),
            put_entry(3, b"gamma", b"3"),
        ],
        vec![entry(
            4,
            &Command::delete(TABLE.to_vec(), b"alpha".to_vec(), Some(b"beta0".to_vec())),
        )],
        vec![entry(
            5,
            &Command::txn(
                TABLE.to_vec(),
                Txn {
                    compare: vec![Compare {
                        key: b"gamma".to_vec(),
                        target: CompareTarget::Value,
                        op: CompareOp::NotEqual,
                        value: b"0".to_vec(),
                    }],
                    success: vec![
                        RequestOp::Put {
                            key: b"delta".to_vec(),
                            value: b"4".to_vec(),
                            prev_kv: false,
                        },
                        RequestOp::DeleteRange {
                            key: b"gamma".to_vec(),
                            range_end: None,
                            prev_kv: false,
                        },
                    ],
                    failure: vec![],
                },
            ),
        )],
        vec![entry(6, &Command::dummy(TABLE.to_vec()))],
    ];

    for batch in &batches {
        let ra = a.update(batch).unwrap();
        let rb = b.update(batch).unwrap();
        assert_eq!(ra, rb);
        assert_eq!(a.get_hash().unwrap(), b.get_hash().unwrap());
    }
    assert_eq!(local_index(&a), 6);
    assert_eq!(local_index(&b), 6);
}
