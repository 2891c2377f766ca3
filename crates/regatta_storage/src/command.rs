//! Binary codecs for replicated commands, their results and local
//! queries.
//!
//! The command envelope is a one-byte command type followed by tagged
//! fields, each framed as `[tag: u8][len: u32 BE][payload]`. Decoders
//! skip fields with unknown tags, so old replicas tolerate commands
//! proposed by newer ones. Optional byte fields use a `u32::MAX` length
//! sentinel for "absent".

use anyhow::{bail, ensure};

/// Entry result status word for applied commands.
pub const RESULT_FAILURE: u64 = 0;
pub const RESULT_SUCCESS: u64 = 1;

const CMD_DUMMY: u8 = 0;
const CMD_PUT: u8 = 1;
const CMD_DELETE: u8 = 2;
const CMD_PUT_BATCH: u8 = 3;
const CMD_DELETE_BATCH: u8 = 4;
const CMD_TXN: u8 = 5;

const FIELD_TABLE: u8 = 1;
const FIELD_KV: u8 = 2;
const FIELD_BATCH: u8 = 3;
const FIELD_RANGE_END: u8 = 4;
const FIELD_LEADER_INDEX: u8 = 5;
const FIELD_TXN: u8 = 6;

const OP_RANGE: u8 = 1;
const OP_PUT: u8 = 2;
const OP_DELETE_RANGE: u8 = 3;

const QUERY_RANGE: u8 = 1;
const QUERY_HASH: u8 = 2;
const QUERY_PATH: u8 = 3;
const QUERY_LOCAL_INDEX: u8 = 4;

const FLAG_KEYS_ONLY: u8 = 1;
const FLAG_COUNT_ONLY: u8 = 2;
const FLAG_PREV_KV: u8 = 1;

const ABSENT: u32 = u32::MAX;

/// One key/value pair as carried by commands and responses.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl KeyValue {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CommandType {
    #[default]
    Dummy,
    Put,
    Delete,
    PutBatch,
    DeleteBatch,
    Txn,
}

/// A replicated command as proposed through Raft and applied by the
/// state machine.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Command {
    pub command_type: CommandType,
    pub table: Vec<u8>,
    pub kv: Option<KeyValue>,
    pub batch: Vec<KeyValue>,
    pub range_end: Option<Vec<u8>>,
    /// Upstream replication checkpoint, persisted for downstream
    /// consumers when present on the last command of a batch.
    pub leader_index: Option<u64>,
    pub txn: Option<Txn>,
}

impl Command {
    pub fn put(table: impl Into<Vec<u8>>, kv: KeyValue) -> Self {
        Self {
            command_type: CommandType::Put,
            table: table.into(),
            kv: Some(kv),
            ..Default::default()
        }
    }

    pub fn delete(
        table: impl Into<Vec<u8>>,
        key: impl Into<Vec<u8>>,
        range_end: Option<Vec<u8>>,
    ) -> Self {
        Self {
            command_type: CommandType::Delete,
            table: table.into(),
            kv: Some(KeyValue::new(key, Vec::new())),
            range_end,
            ..Default::default()
        }
    }

    pub fn put_batch(table: impl Into<Vec<u8>>, batch: Vec<KeyValue>) -> Self {
        Self {
            command_type: CommandType::PutBatch,
            table: table.into(),
            batch,
            ..Default::default()
        }
    }

    pub fn delete_batch(table: impl Into<Vec<u8>>, batch: Vec<KeyValue>) -> Self {
        Self {
            command_type: CommandType::DeleteBatch,
            table: table.into(),
            batch,
            ..Default::default()
        }
    }

    pub fn txn(table: impl Into<Vec<u8>>, txn: Txn) -> Self {
        Self {
            command_type: CommandType::Txn,
            table: table.into(),
            txn: Some(txn),
            ..Default::default()
        }
    }

    pub fn dummy(table: impl Into<Vec<u8>>) -> Self {
        Self {
            command_type: CommandType::Dummy,
            table: table.into(),
            ..Default::default()
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut size = 1 + 6 + self.table.len();
        if let Some(kv) = &self.kv {
            size += 14 + kv.key.len() + kv.value.len();
        }
        for kv in &self.batch {
            size += 8 + kv.key.len() + kv.value.len();
        }
        let mut out = Vec::with_capacity(size);

        out.push(match self.command_type {
            CommandType::Dummy => CMD_DUMMY,
            CommandType::Put => CMD_PUT,
            CommandType::Delete => CMD_DELETE,
            CommandType::PutBatch => CMD_PUT_BATCH,
            CommandType::DeleteBatch => CMD_DELETE_BATCH,
            CommandType::Txn => CMD_TXN,
        });

        put_field(&mut out, FIELD_TABLE, &self.table);
        if let Some(kv) = &self.kv {
            let mut body = Vec::with_capacity(8 + kv.key.len() + kv.value.len());
            put_kv(&mut body, kv);
            put_field(&mut out, FIELD_KV, &body);
        }
        if !self.batch.is_empty() {
            let mut body = Vec::new();
            body.extend_from_slice(&(self.batch.len() as u32).to_be_bytes());
            for kv in &self.batch {
                put_kv(&mut body, kv);
            }
            put_field(&mut out, FIELD_BATCH, &body);
        }
        if let Some(end) = &self.range_end {
            put_field(&mut out, FIELD_RANGE_END, end);
        }
        if let Some(index) = self.leader_index {
            put_field(&mut out, FIELD_LEADER_INDEX, &index.to_be_bytes());
        }
        if let Some(txn) = &self.txn {
            let mut body = Vec::new();
            put_txn(&mut body, txn);
            put_field(&mut out, FIELD_TXN, &body);
        }
        out
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0usize;
        let command_type = match read_u8(data, &mut offset)? {
            CMD_PUT => CommandType::Put,
            CMD_DELETE => CommandType::Delete,
            CMD_PUT_BATCH => CommandType::PutBatch,
            CMD_DELETE_BATCH => CommandType::DeleteBatch,
            CMD_TXN => CommandType::Txn,
            // Unknown command types apply as no-ops so that replicas
            // running older code still advance their applied index.
            _ => CommandType::Dummy,
        };

        let mut cmd = Command {
            command_type,
            ..Default::default()
        };

        while offset < data.len() {
            let tag = read_u8(data, &mut offset)?;
            let len = read_u32(data, &mut offset)? as usize;
            ensure!(offset + len <= data.len(), "short command field");
            let payload = &data[offset..offset + len];
            offset += len;

            match tag {
                FIELD_TABLE => cmd.table = payload.to_vec(),
                FIELD_KV => {
                    let mut at = 0usize;
                    cmd.kv = Some(read_kv(payload, &mut at)?);
                }
                FIELD_BATCH => {
                    let mut at = 0usize;
                    let count = read_u32(payload, &mut at)? as usize;
                    let mut batch = Vec::with_capacity(count);
                    for _ in 0..count {
                        batch.push(read_kv(payload, &mut at)?);
                    }
                    cmd.batch = batch;
                }
                FIELD_RANGE_END => cmd.range_end = Some(payload.to_vec()),
                FIELD_LEADER_INDEX => {
                    let mut at = 0usize;
                    cmd.leader_index = Some(read_u64(payload, &mut at)?);
                }
                FIELD_TXN => {
                    let mut at = 0usize;
                    cmd.txn = Some(read_txn(payload, &mut at)?);
                }
                // Skip unknown fields.
                _ => {}
            }
        }
        Ok(cmd)
    }
}

/// Comparison subject of a transaction predicate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompareTarget {
    #[default]
    Value,
    Create,
    Mod,
    LatestIndex,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompareOp {
    #[default]
    Equal,
    Greater,
    Less,
    NotEqual,
}

/// One transaction predicate, evaluated against pre-transaction state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Compare {
    pub key: Vec<u8>,
    pub target: CompareTarget,
    pub op: CompareOp,
    pub value: Vec<u8>,
}

/// Transactional request: when every predicate holds, `success` ops run
/// in order, otherwise `failure` ops do.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Txn {
    pub compare: Vec<Compare>,
    pub success: Vec<RequestOp>,
    pub failure: Vec<RequestOp>,
}

/// One operation inside a transaction branch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestOp {
    Range {
        key: Vec<u8>,
        range_end: Option<Vec<u8>>,
        limit: u64,
        keys_only: bool,
        count_only: bool,
    },
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        prev_kv: bool,
    },
    DeleteRange {
        key: Vec<u8>,
        range_end: Option<Vec<u8>>,
        prev_kv: bool,
    },
}

/// Result of one executed transaction operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponseOp {
    Range(RangeResponse),
    Put { prev_kv: Option<KeyValue> },
    DeleteRange { deleted: u64, prev_kvs: Vec<KeyValue> },
}

/// Result of a range read.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeResponse {
    pub kvs: Vec<KeyValue>,
    pub count: u64,
    /// More results existed beyond the requested limit.
    pub more: bool,
}

/// Rich command outcome carried in the entry result payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub succeeded: bool,
    pub responses: Vec<ResponseOp>,
}

impl CommandResult {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.succeeded as u8);
        out.extend_from_slice(&(self.responses.len() as u32).to_be_bytes());
        for resp in &self.responses {
            put_response_op(&mut out, resp);
        }
        out
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0usize;
        let succeeded = read_u8(data, &mut offset)? != 0;
        let count = read_u32(data, &mut offset)? as usize;
        let mut responses = Vec::with_capacity(count);
        for _ in 0..count {
            responses.push(read_response_op(data, &mut offset)?);
        }
        Ok(Self {
            succeeded,
            responses,
        })
    }
}

/// Read-only query served locally by a shard's state machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryRequest {
    Range(RangeQuery),
    Hash,
    Path,
    LocalIndex,
}

/// Parameters of a range read.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeQuery {
    pub key: Vec<u8>,
    pub range_end: Option<Vec<u8>>,
    /// Zero means unlimited.
    pub limit: u64,
    pub keys_only: bool,
    pub count_only: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryResponse {
    Range(RangeResponse),
    Hash(u64),
    Path(String),
    LocalIndex(u64),
}

impl QueryRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            QueryRequest::Range(range) => {
                out.push(QUERY_RANGE);
                put_bytes(&mut out, &range.key);
                put_opt_bytes(&mut out, range.range_end.as_deref());
                out.extend_from_slice(&range.limit.to_be_bytes());
                let mut flags = 0u8;
                if range.keys_only {
                    flags |= FLAG_KEYS_ONLY;
                }
                if range.count_only {
                    flags |= FLAG_COUNT_ONLY;
                }
                out.push(flags);
            }
            QueryRequest::Hash => out.push(QUERY_HASH),
            QueryRequest::Path => out.push(QUERY_PATH),
            QueryRequest::LocalIndex => out.push(QUERY_LOCAL_INDEX),
        }
        out
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0usize;
        match read_u8(data, &mut offset)? {
            QUERY_RANGE => {
                let key = read_bytes(data, &mut offset)?;
                let range_end = read_opt_bytes(data, &mut offset)?;
                let limit = read_u64(data, &mut offset)?;
                let flags = read_u8(data, &mut offset)?;
                Ok(QueryRequest::Range(RangeQuery {
                    key,
                    range_end,
                    limit,
                    keys_only: flags & FLAG_KEYS_ONLY != 0,
                    count_only: flags & FLAG_COUNT_ONLY != 0,
                }))
            }
            QUERY_HASH => Ok(QueryRequest::Hash),
            QUERY_PATH => Ok(QueryRequest::Path),
            QUERY_LOCAL_INDEX => Ok(QueryRequest::LocalIndex),
            other => bail!("unknown query kind {other}"),
        }
    }
}

impl QueryResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            QueryResponse::Range(range) => {
                out.push(QUERY_RANGE);
                put_range_response(&mut out, range);
            }
            QueryResponse::Hash(hash) => {
                out.push(QUERY_HASH);
                out.extend_from_slice(&hash.to_be_bytes());
            }
            QueryResponse::Path(path) => {
                out.push(QUERY_PATH);
                put_bytes(&mut out, path.as_bytes());
            }
            QueryResponse::LocalIndex(index) => {
                out.push(QUERY_LOCAL_INDEX);
                out.extend_from_slice(&index.to_be_bytes());
            }
        }
        out
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0usize;
        match read_u8(data, &mut offset)? {
            QUERY_RANGE => Ok(QueryResponse::Range(read_range_response(
                data,
                &mut offset,
            )?)),
            QUERY_HASH => Ok(QueryResponse::Hash(read_u64(data, &mut offset)?)),
            QUERY_PATH => {
                let raw = read_bytes(data, &mut offset)?;
                Ok(QueryResponse::Path(String::from_utf8(raw)?))
            }
            QUERY_LOCAL_INDEX => Ok(QueryResponse::LocalIndex(read_u64(data, &mut offset)?)),
            other => bail!("unknown query response kind {other}"),
        }
    }
}

fn put_field(out: &mut Vec<u8>, tag: u8, payload: &[u8]) {
    out.push(tag);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
}

fn put_kv(out: &mut Vec<u8>, kv: &KeyValue) {
    put_bytes(out, &kv.key);
    put_bytes(out, &kv.value);
}

fn read_kv(data: &[u8], offset: &mut usize) -> anyhow::Result<KeyValue> {
    let key = read_bytes(data, offset)?;
    let value = read_bytes(data, offset)?;
    Ok(KeyValue { key, value })
}

fn put_txn(out: &mut Vec<u8>, txn: &Txn) {
    out.extend_from_slice(&(txn.compare.len() as u32).to_be_bytes());
    for cmp in &txn.compare {
        put_bytes(out, &cmp.key);
        out.push(match cmp.target {
            CompareTarget::Value => 0,
            CompareTarget::Create => 1,
            CompareTarget::Mod => 2,
            CompareTarget::LatestIndex => 3,
        });
        out.push(match cmp.op {
            CompareOp::Equal => 0,
            CompareOp::Greater => 1,
            CompareOp::Less => 2,
            CompareOp::NotEqual => 3,
        });
        put_bytes(out, &cmp.value);
    }
    out.extend_from_slice(&(txn.success.len() as u32).to_be_bytes());
    for op in &txn.success {
        put_request_op(out, op);
    }
    out.extend_from_slice(&(txn.failure.len() as u32).to_be_bytes());
    for op in &txn.failure {
        put_request_op(out, op);
    }
}

fn read_txn(data: &[u8], offset: &mut usize) -> anyhow::Result<Txn> {
    let ncompare = read_u32(data, offset)? as usize;
    let mut compare = Vec::with_capacity(ncompare);
    for _ in 0..ncompare {
        let key = read_bytes(data, offset)?;
        let target = match read_u8(data, offset)? {
            0 => CompareTarget::Value,
            1 => CompareTarget::Create,
            2 => CompareTarget::Mod,
            3 => CompareTarget::LatestIndex,
            other => bail!("unknown compare target {other}"),
        };
        let op = match read_u8(data, offset)? {
            0 => CompareOp::Equal,
            1 => CompareOp::Greater,
            2 => CompareOp::Less,
            3 => CompareOp::NotEqual,
            other => bail!("unknown compare op {other}"),
        };
        let value = read_bytes(data, offset)?;
        compare.push(Compare {
            key,
            target,
            op,
            value,
        });
    }

    let nsuccess = read_u32(data, offset)? as usize;
    let mut success = Vec::with_capacity(nsuccess);
    for _ in 0..nsuccess {
        success.push(read_request_op(data, offset)?);
    }
    let nfailure = read_u32(data, offset)? as usize;
    let mut failure = Vec::with_capacity(nfailure);
    for _ in 0..nfailure {
        failure.push(read_request_op(data, offset)?);
    }
    Ok(Txn {
        compare,
        success,
        failure,
    })
}

fn put_request_op(out: &mut Vec<u8>, op: &RequestOp) {
    match op {
        RequestOp::Range {
            key,
            range_end,
            limit,
            keys_only,
            count_only,
        } => {
            out.push(OP_RANGE);
            put_bytes(out, key);
            put_opt_bytes(out, range_end.as_deref());
            out.extend_from_slice(&limit.to_be_bytes());
            let mut flags = 0u8;
            if *keys_only {
                flags |= FLAG_KEYS_ONLY;
            }
            if *count_only {
                flags |= FLAG_COUNT_ONLY;
            }
            out.push(flags);
        }
        RequestOp::Put {
            key,
            value,
            prev_kv,
        } => {
            out.push(OP_PUT);
            put_bytes(out, key);
            put_bytes(out, value);
            out.push(if *prev_kv { FLAG_PREV_KV } else { 0 });
        }
        RequestOp::DeleteRange {
            key,
            range_end,
            prev_kv,
        } => {
            out.push(OP_DELETE_RANGE);
            put_bytes(out, key);
            put_opt_bytes(out, range_end.as_deref());
            out.push(if *prev_kv { FLAG_PREV_KV } else { 0 });
        }
    }
}

fn read_request_op(data: &[u8], offset: &mut usize) -> anyhow::Result<RequestOp> {
    match read_u8(data, offset)? {
        OP_RANGE => {
            let key = read_bytes(data, offset)?;
            let range_end = read_opt_bytes(data, offset)?;
            let limit = read_u64(data, offset)?;
            let flags = read_u8(data, offset)?;
            Ok(RequestOp::Range {
                key,
                range_end,
                limit,
                keys_only: flags & FLAG_KEYS_ONLY != 0,
                count_only: flags & FLAG_COUNT_ONLY != 0,
            })
        }
        OP_PUT => {
            let key = read_bytes(data, offset)?;
            let value = read_bytes(data, offset)?;
            let flags = read_u8(data, offset)?;
            Ok(RequestOp::Put {
                key,
                value,
                prev_kv: flags & FLAG_PREV_KV != 0,
            })
        }
        OP_DELETE_RANGE => {
            let key = read_bytes(data, offset)?;
            let range_end = read_opt_bytes(data, offset)?;
            let flags = read_u8(data, offset)?;
            Ok(RequestOp::DeleteRange {
                key,
                range_end,
                prev_kv: flags & FLAG_PREV_KV != 0,
            })
        }
        other => bail!("unknown request op {other}"),
    }
}

fn put_response_op(out: &mut Vec<u8>, op: &ResponseOp) {
    match op {
        ResponseOp::Range(range) => {
            out.push(OP_RANGE);
            put_range_response(out, range);
        }
        ResponseOp::Put { prev_kv } => {
            out.push(OP_PUT);
            match prev_kv {
                Some(kv) => {
                    out.push(1);
                    put_kv(out, kv);
                }
                None => out.push(0),
            }
        }
        ResponseOp::DeleteRange { deleted, prev_kvs } => {
            out.push(OP_DELETE_RANGE);
            out.extend_from_slice(&deleted.to_be_bytes());
            out.extend_from_slice(&(prev_kvs.len() as u32).to_be_bytes());
            for kv in prev_kvs {
                put_kv(out, kv);
            }
        }
    }
}

fn read_response_op(data: &[u8], offset: &mut usize) -> anyhow::Result<ResponseOp> {
    match read_u8(data, offset)? {
        OP_RANGE => Ok(ResponseOp::Range(read_range_response(data, offset)?)),
        OP_PUT => {
            let prev_kv = if read_u8(data, offset)? != 0 {
                Some(read_kv(data, offset)?)
            } else {
                None
            };
            Ok(ResponseOp::Put { prev_kv })
        }
        OP_DELETE_RANGE => {
            let deleted = read_u64(data, offset)?;
            let count = read_u32(data, offset)? as usize;
            let mut prev_kvs = Vec::with_capacity(count);
            for _ in 0..count {
                prev_kvs.push(read_kv(data, offset)?);
            }
            Ok(ResponseOp::DeleteRange { deleted, prev_kvs })
        }
        other => bail!("unknown response op {other}"),
    }
}

fn put_range_response(out: &mut Vec<u8>, range: &RangeResponse) {
    out.extend_from_slice(&range.count.to_be_bytes());
    out.push(range.more as u8);
    out.extend_from_slice(&(range.kvs.len() as u32).to_be_bytes());
    for kv in &range.kvs {
        put_kv(out, kv);
    }
}

fn read_range_response(data: &[u8], offset: &mut usize) -> anyhow::Result<RangeResponse> {
    let count = read_u64(data, offset)?;
    let more = read_u8(data, offset)? != 0;
    let nkvs = read_u32(data, offset)? as usize;
    let mut kvs = Vec::with_capacity(nkvs);
    for _ in 0..nkvs {
        kvs.push(read_kv(data, offset)?);
    }
    Ok(RangeResponse { kvs, count, more })
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn put_opt_bytes(out: &mut Vec<u8>, bytes: Option<&[u8]>) {
    match bytes {
        Some(bytes) => put_bytes(out, bytes),
        None => out.extend_from_slice(&ABSENT.to_be_bytes()),
    }
}

fn read_bytes(data: &[u8], offset: &mut usize) -> anyhow::Result<Vec<u8>> {
    let len = read_u32(data, offset)? as usize;
    ensure!(*offset + len <= data.len(), "short byte field");
    let out = data[*offset..*offset + len].to_vec();
    *offset += len;
    Ok(out)
}

fn read_opt_bytes(data: &[u8], offset: &mut usize) -> anyhow::Result<Option<Vec<u8>>> {
    let len = read_u32(data, offset)?;
    if len == ABSENT {
        return Ok(None);
    }
    let len = len as usize;
    ensure!(*offset + len <= data.len(), "short byte field");
    let out = data[*offset..*offset + len].to_vec();
    *offset += len;
    Ok(Some(out))
}

fn read_u8(data: &[u8], offset: &mut usize) -> anyhow::Result<u8> {
    ensure!(*offset + 1 <= data.len(), "short u8");
    let out = data[*offset];
    *offset += 1;
    Ok(out)
}

fn read_u32(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    ensure!(*offset + 4 <= data.len(), "short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64(data: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    ensure!(*offset + 8 <= data.len(), "short u64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}
