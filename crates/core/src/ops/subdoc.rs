//! Multi-path sub-document lookups and mutations.
//!
//! Lookup specs encode as `opcode u8 | flags u8 | path_len u16 | path`,
//! mutation specs add a `value_len u32` after the path length and the value
//! after the path.

use bytes::{BufMut, Bytes, BytesMut};
use cbcore_errors::{CoreError, CoreResult, ErrorKind, kind_for_status};
use cbcore_memd::subdoc::SUBDOC_DOC_FLAG_CREATE_AS_DELETED;
use cbcore_memd::{Opcode, Packet, Status};

use super::{Dispatch, KvOps, MutationToken, OpOptions, StoreOptions, be_u16, be_u32, short_body};

/// Most paths one multi request may carry.
const MAX_SPECS: usize = 16;

/// One path operation inside a multi request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubDocOp {
    pub op: Opcode,
    pub flags: u8,
    pub path: String,
    pub value: Bytes,
}

impl SubDocOp {
    pub fn new(op: Opcode, path: impl Into<String>) -> Self {
        Self {
            op,
            flags: 0,
            path: path.into(),
            value: Bytes::new(),
        }
    }

    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    fn path_len(&self) -> CoreResult<u16> {
        u16::try_from(self.path.len()).map_err(|_| CoreError::new(ErrorKind::PathTooBig))
    }
}

/// Per-path outcome.
#[derive(Debug, Clone)]
pub struct SubDocResult {
    pub err: Option<CoreError>,
    pub value: Bytes,
}

#[derive(Debug, Clone)]
pub struct LookupInResult {
    pub cas: u64,
    pub ops: Vec<SubDocResult>,
    /// The document is a tombstone read with access-deleted.
    pub deleted: bool,
}

#[derive(Debug, Clone)]
pub struct MutateInResult {
    pub cas: u64,
    /// Values for the paths that return one, such as counters. Other
    /// entries are empty.
    pub ops: Vec<SubDocResult>,
    pub token: Option<MutationToken>,
}

fn path_error(index: usize, status: Status) -> CoreError {
    CoreError::SubDocument {
        index,
        kind: kind_for_status(status).unwrap_or(ErrorKind::Unknown),
    }
}

fn check_spec_count(n: usize) -> CoreResult<()> {
    if n == 0 || n > MAX_SPECS {
        return Err(CoreError::invalid_argument(format!(
            "a multi request needs between 1 and {MAX_SPECS} paths, got {n}"
        )));
    }
    Ok(())
}

fn encode_lookups(ops: &[SubDocOp]) -> CoreResult<Bytes> {
    let mut buf = BytesMut::new();
    for op in ops {
        buf.put_u8(op.op.0);
        buf.put_u8(op.flags);
        buf.put_u16(op.path_len()?);
        buf.put_slice(op.path.as_bytes());
    }
    Ok(buf.freeze())
}

fn encode_mutations(ops: &[SubDocOp]) -> CoreResult<Bytes> {
    let mut buf = BytesMut::new();
    for op in ops {
        let value_len = u32::try_from(op.value.len()).map_err(|_| CoreError::new(ErrorKind::ValueTooLarge))?;
        buf.put_u8(op.op.0);
        buf.put_u8(op.flags);
        buf.put_u16(op.path_len()?);
        buf.put_u32(value_len);
        buf.put_slice(op.path.as_bytes());
        buf.put_slice(&op.value);
    }
    Ok(buf.freeze())
}

/// `status u16 | value_len u32 | value` for every requested path.
fn decode_lookups(body: &Bytes, count: usize) -> CoreResult<Vec<SubDocResult>> {
    let mut results = Vec::with_capacity(count);
    let mut at = 0;
    for index in 0..count {
        let (Some(status), Some(len)) = (be_u16(body, at), be_u32(body, at + 2)) else {
            return Err(short_body("lookup in"));
        };
        let start = at + 6;
        let end = start + len as usize;
        if end > body.len() {
            return Err(short_body("lookup in"));
        }
        let status = Status(status);
        results.push(SubDocResult {
            err: (!status.is_success()).then(|| path_error(index, status)),
            value: body.slice(start..end),
        });
        at = end;
    }
    Ok(results)
}

/// `index u8 | status u16 | value_len u32 | value` for each path that
/// produced a value.
fn decode_mutations(body: &Bytes, count: usize) -> CoreResult<Vec<SubDocResult>> {
    let mut results = vec![
        SubDocResult {
            err: None,
            value: Bytes::new(),
        };
        count
    ];
    let mut at = 0;
    while at < body.len() {
        let index = body[at] as usize;
        let (Some(_status), Some(len)) = (be_u16(body, at + 1), be_u32(body, at + 3)) else {
            return Err(short_body("mutate in"));
        };
        let start = at + 7;
        let end = start + len as usize;
        if end > body.len() || index >= count {
            return Err(short_body("mutate in"));
        }
        results[index].value = body.slice(start..end);
        at = end;
    }
    Ok(results)
}

/// The first failing path of a rejected multi mutation.
fn decode_mutation_failure(body: &Bytes) -> CoreError {
    match (body.first(), be_u16(body, 1)) {
        (Some(index), Some(status)) => path_error(*index as usize, Status(status)),
        _ => CoreError::new(ErrorKind::SubdocMultiPathFailure),
    }
}

impl KvOps {
    /// Reads several paths of one document in a single round trip.
    pub async fn lookup_in(
        &self,
        key: impl Into<Bytes>,
        ops: &[SubDocOp],
        doc_flags: u8,
        opts: &OpOptions,
    ) -> CoreResult<LookupInResult> {
        check_spec_count(ops.len())?;
        let mut packet = Packet::request(Opcode::SUBDOC_MULTI_LOOKUP)
            .with_key(key)
            .with_value(encode_lookups(ops)?);
        if doc_flags != 0 {
            packet = packet.with_extras(vec![doc_flags]);
        }
        let c = self.execute(packet, opts, Dispatch::read()).await?;
        let status = c.resp.packet.status;
        Ok(LookupInResult {
            cas: c.resp.packet.cas,
            ops: decode_lookups(&c.resp.packet.value, ops.len())?,
            deleted: matches!(
                status,
                Status::SUBDOC_SUCCESS_DELETED | Status::SUBDOC_MULTI_PATH_FAILURE_DELETED
            ),
        })
    }

    /// Applies several path mutations atomically. The first failing path is
    /// reported as a [`CoreError::SubDocument`] carrying its index.
    pub async fn mutate_in(
        &self,
        key: impl Into<Bytes>,
        ops: &[SubDocOp],
        doc_flags: u8,
        store: &StoreOptions,
        opts: &OpOptions,
    ) -> CoreResult<MutateInResult> {
        check_spec_count(ops.len())?;
        if doc_flags & SUBDOC_DOC_FLAG_CREATE_AS_DELETED != 0 {
            self.require("create as deleted", |s| s.create_as_deleted)?;
        }

        let mut extras = Vec::with_capacity(5);
        if store.expiry != 0 {
            extras.extend_from_slice(&store.expiry.to_be_bytes());
        }
        if doc_flags != 0 {
            extras.push(doc_flags);
        }
        let packet = Packet::request(Opcode::SUBDOC_MULTI_MUTATION)
            .with_key(key)
            .with_cas(store.cas)
            .with_extras(extras)
            .with_value(encode_mutations(ops)?);
        let (packet, dispatch) = self.prepare_write(packet, store)?;
        let c = self.execute(packet, opts, dispatch).await?;

        if matches!(
            c.resp.packet.status,
            Status::SUBDOC_MULTI_PATH_FAILURE | Status::SUBDOC_MULTI_PATH_FAILURE_DELETED
        ) {
            return Err(decode_mutation_failure(&c.resp.packet.value));
        }
        Ok(MutateInResult {
            cas: c.resp.packet.cas,
            ops: decode_mutations(&c.resp.packet.value, ops.len())?,
            token: self.mutation_token(&c),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_lookup_spec() {
        let ops = [SubDocOp::new(Opcode::SUBDOC_GET, "a.b")];
        let body = encode_lookups(&ops).unwrap();
        assert_eq!(&body[..], &[0xc5, 0x00, 0x00, 0x03, b'a', b'.', b'b']);
    }

    #[test]
    fn test_encode_mutation_spec() {
        let ops = [SubDocOp::new(Opcode::SUBDOC_DICT_SET, "x").with_value("1")];
        let body = encode_mutations(&ops).unwrap();
        assert_eq!(&body[..], &[0xc8, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, b'x', b'1']);
    }

    #[test]
    fn test_decode_lookups_reports_path_errors() {
        let mut body = BytesMut::new();
        body.put_u16(0x00);
        body.put_u32(2);
        body.put_slice(b"42");
        body.put_u16(Status::SUBDOC_PATH_NOT_FOUND.0);
        body.put_u32(0);
        let results = decode_lookups(&body.freeze(), 2).unwrap();
        assert!(results[0].err.is_none());
        assert_eq!(&results[0].value[..], b"42");
        let err = results[1].err.as_ref().unwrap();
        assert!(err.is(ErrorKind::PathNotFound));
        assert!(matches!(err, CoreError::SubDocument { index: 1, .. }));
    }

    #[test]
    fn test_decode_lookups_rejects_truncated_body() {
        let mut body = BytesMut::new();
        body.put_u16(0x00);
        body.put_u32(10);
        body.put_slice(b"short");
        assert!(decode_lookups(&body.freeze(), 1).is_err());
    }

    #[test]
    fn test_decode_mutation_values_by_index() {
        let mut body = BytesMut::new();
        body.put_u8(1);
        body.put_u16(0);
        body.put_u32(1);
        body.put_slice(b"5");
        let results = decode_mutations(&body.freeze(), 2).unwrap();
        assert!(results[0].value.is_empty());
        assert_eq!(&results[1].value[..], b"5");
    }

    #[test]
    fn test_mutation_failure_names_first_bad_path() {
        let mut body = BytesMut::new();
        body.put_u8(3);
        body.put_u16(Status::SUBDOC_PATH_EXISTS.0);
        let err = decode_mutation_failure(&body.freeze());
        assert!(err.is(ErrorKind::PathExists));
        assert!(matches!(err, CoreError::SubDocument { index: 3, .. }));
    }

    #[test]
    fn test_spec_count_bounds() {
        assert!(check_spec_count(0).is_err());
        assert!(check_spec_count(16).is_ok());
        assert!(check_spec_count(17).is_err());
    }
}
