//! Transaction execution.
//!
//! Predicates are evaluated against the state visible before the
//! transaction's own ops apply (earlier entries of the same batch
//! included). Ops of the chosen branch then run in order against the
//! indexed batch, so later ops observe earlier writes.

use anyhow::ensure;

use crate::command::{
    Compare, CompareOp, CompareTarget, KeyValue, RangeQuery, RequestOp, ResponseOp, Txn,
    CommandResult,
};
use crate::keys::{self, USER_KEY_UPPER_BOUND};

use super::batch::{merged_range, read_range, BatchOp, UpdateContext};

pub(crate) fn execute_txn(ctx: &mut UpdateContext, txn: &Txn) -> anyhow::Result<CommandResult> {
    ctx.ensure_indexed()?;

    let mut succeeded = true;
    for cmp in &txn.compare {
        if !evaluate(ctx, cmp)? {
            succeeded = false;
            break;
        }
    }

    let ops = if succeeded { &txn.success } else { &txn.failure };
    let mut responses = Vec::with_capacity(ops.len());
    for op in ops {
        responses.push(execute_op(ctx, op)?);
    }
    Ok(CommandResult {
        succeeded,
        responses,
    })
}

fn evaluate(ctx: &UpdateContext, cmp: &Compare) -> anyhow::Result<bool> {
    match cmp.target {
        CompareTarget::Value => {
            let stored = ctx.get(&keys::user_key(&cmp.key))?;
            Ok(match stored {
                None => false,
                Some(value) => compare_bytes(&value, &cmp.value, cmp.op),
            })
        }
        CompareTarget::Create => {
            let exists = ctx.get(&keys::user_key(&cmp.key))?.is_some();
            Ok(match cmp.op {
                CompareOp::Equal => exists,
                CompareOp::NotEqual => !exists,
                // Existence has no ordering.
                CompareOp::Greater | CompareOp::Less => false,
            })
        }
        CompareTarget::LatestIndex => {
            let index = ctx.pre_local_index()?;
            Ok(compare_u64(index, decode_u64(&cmp.value)?, cmp.op))
        }
        CompareTarget::Mod => {
            let index = ctx.pre_leader_index()?;
            Ok(compare_u64(index, decode_u64(&cmp.value)?, cmp.op))
        }
    }
}

fn execute_op(ctx: &mut UpdateContext, op: &RequestOp) -> anyhow::Result<ResponseOp> {
    match op {
        RequestOp::Range {
            key,
            range_end,
            limit,
            keys_only,
            count_only,
        } => {
            let query = RangeQuery {
                key: key.clone(),
                range_end: range_end.clone(),
                limit: *limit,
                keys_only: *keys_only,
                count_only: *count_only,
            };
            let resp = read_range(ctx.snapshot(), ctx.overlay(), &query)?;
            Ok(ResponseOp::Range(resp))
        }
        RequestOp::Put {
            key,
            value,
            prev_kv,
        } => {
            let encoded = keys::user_key(key);
            let prev = if *prev_kv {
                ctx.get(&encoded)?.map(|value| KeyValue {
                    key: key.clone(),
                    value,
                })
            } else {
                None
            };
            ctx.push(BatchOp::Set {
                key: encoded,
                value: value.clone(),
            })?;
            Ok(ResponseOp::Put { prev_kv: prev })
        }
        RequestOp::DeleteRange {
            key,
            range_end,
            prev_kv,
        } => {
            let start = keys::user_key(key);
            match range_end {
                None => {
                    let prev = ctx.get(&start)?;
                    let deleted = prev.is_some() as u64;
                    let mut prev_kvs = Vec::new();
                    if *prev_kv {
                        if let Some(value) = prev {
                            prev_kvs.push(KeyValue {
                                key: key.clone(),
                                value,
                            });
                        }
                    }
                    ctx.push(BatchOp::Delete { key: start })?;
                    Ok(ResponseOp::DeleteRange { deleted, prev_kvs })
                }
                Some(end) => {
                    let upper = if keys::is_wildcard(end) {
                        USER_KEY_UPPER_BOUND.to_vec()
                    } else {
                        keys::user_key(end)
                    };
                    let mut deleted = 0u64;
                    let mut prev_kvs = Vec::new();
                    merged_range(ctx.snapshot(), ctx.overlay(), &start, &upper, |key, value| {
                        deleted += 1;
                        if *prev_kv {
                            if let Ok(user) = keys::decode_user_key(key) {
                                prev_kvs.push(KeyValue {
                                    key: user.to_vec(),
                                    value: value.to_vec(),
                                });
                            }
                        }
                        true
                    })?;
                    ctx.push(BatchOp::DeleteRange {
                        start,
                        end: upper,
                    })?;
                    Ok(ResponseOp::DeleteRange { deleted, prev_kvs })
                }
            }
        }
    }
}

fn compare_bytes(stored: &[u8], expected: &[u8], op: CompareOp) -> bool {
    match op {
        CompareOp::Equal => stored == expected,
        CompareOp::Greater => stored > expected,
        CompareOp::Less => stored < expected,
        CompareOp::NotEqual => stored != expected,
    }
}

fn compare_u64(stored: u64, expected: u64, op: CompareOp) -> bool {
    match op {
        CompareOp::Equal => stored == expected,
        CompareOp::Greater => stored > expected,
        CompareOp::Less => stored < expected,
        CompareOp::NotEqual => stored != expected,
    }
}

fn decode_u64(value: &[u8]) -> anyhow::Result<u64> {
    ensure!(value.len() == 8, "index predicate value must be 8 bytes");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(value);
    Ok(u64::from_le_bytes(buf))
}
