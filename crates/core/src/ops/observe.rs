//! Persistence and replication observation.

use bytes::{BufMut, Bytes, BytesMut};
use cbcore_errors::{CoreError, CoreResult, ErrorKind};
use cbcore_memd::{Opcode, Packet};
use serde::Serialize;

use super::{Dispatch, KvOps, OpOptions, be_u16, be_u64, short_body};

/// Where a key stands on the observed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyState {
    NotPersisted,
    Persisted,
    NotFound,
    Deleted,
    Unknown(u8),
}

impl From<u8> for KeyState {
    fn from(v: u8) -> Self {
        match v {
            0x00 => Self::NotPersisted,
            0x01 => Self::Persisted,
            0x80 => Self::NotFound,
            0x81 => Self::Deleted,
            other => Self::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ObserveResult {
    pub key_state: KeyState,
    pub cas: u64,
}

/// Seqno state of a vbucket on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ObserveVbResult {
    /// Set when the node saw a failover since `vbuuid`.
    pub did_failover: bool,
    pub vbucket: u16,
    pub vbuuid: u64,
    pub persist_seqno: u64,
    pub current_seqno: u64,
    pub old_vbuuid: u64,
    pub last_seqno: u64,
}

fn observe_body(vbucket: u16, key: &[u8]) -> CoreResult<Bytes> {
    let key_len = u16::try_from(key.len()).map_err(|_| CoreError::invalid_argument("key too long to observe"))?;
    let mut buf = BytesMut::with_capacity(4 + key.len());
    buf.put_u16(vbucket);
    buf.put_u16(key_len);
    buf.put_slice(key);
    Ok(buf.freeze())
}

/// `vb u16 | key_len u16 | key | key_state u8 | cas u64`
fn decode_observe(body: &[u8]) -> CoreResult<ObserveResult> {
    let key_len = be_u16(body, 2).ok_or_else(|| short_body("observe"))? as usize;
    let at = 4 + key_len;
    let (Some(state), Some(cas)) = (body.get(at), be_u64(body, at + 1)) else {
        return Err(short_body("observe"));
    };
    Ok(ObserveResult {
        key_state: KeyState::from(*state),
        cas,
    })
}

/// `format u8 | vb u16 | vbuuid u64 | persist u64 | current u64`, followed
/// by `old_vbuuid u64 | last_seqno u64` when the format byte is 1.
fn decode_observe_vb(body: &[u8]) -> CoreResult<ObserveVbResult> {
    let format = *body.first().ok_or_else(|| short_body("observe seqno"))?;
    let (Some(vbucket), Some(vbuuid), Some(persist_seqno), Some(current_seqno)) =
        (be_u16(body, 1), be_u64(body, 3), be_u64(body, 11), be_u64(body, 19))
    else {
        return Err(short_body("observe seqno"));
    };
    let mut result = ObserveVbResult {
        did_failover: format == 1,
        vbucket,
        vbuuid,
        persist_seqno,
        current_seqno,
        old_vbuuid: 0,
        last_seqno: 0,
    };
    if result.did_failover {
        let (Some(old), Some(last)) = (be_u64(body, 27), be_u64(body, 35)) else {
            return Err(short_body("observe seqno"));
        };
        result.old_vbuuid = old;
        result.last_seqno = last;
    }
    Ok(result)
}

impl KvOps {
    /// Key state on the active (`replica_idx` 0) or a replica node.
    pub async fn observe(&self, key: impl Into<Bytes>, replica_idx: u32, opts: &OpOptions) -> CoreResult<ObserveResult> {
        let key: Bytes = key.into();
        let state = self.mux.state()?;
        let vbucket = state
            .vbucket_by_key(&key)
            .ok_or_else(|| CoreError::message(ErrorKind::UnsupportedOperation, "observe needs a vbucket bucket"))?;
        if replica_idx as usize > state.num_replicas() {
            return Err(CoreError::new(ErrorKind::InvalidReplica));
        }
        let packet = Packet::request(Opcode::OBSERVE)
            .with_vbucket(vbucket)
            .with_value(observe_body(vbucket, &key)?);
        let dispatch = Dispatch {
            replica_idx: replica_idx as i32,
            ..Dispatch::read()
        };
        let c = self.execute(packet, opts, dispatch).await?;
        decode_observe(&c.resp.packet.value)
    }

    /// Seqno state of `vbucket` relative to `vbuuid`.
    pub async fn observe_vb(
        &self,
        vbucket: u16,
        vbuuid: u64,
        replica_idx: u32,
        opts: &OpOptions,
    ) -> CoreResult<ObserveVbResult> {
        let state = self.mux.state()?;
        if replica_idx as usize > state.num_replicas() {
            return Err(CoreError::new(ErrorKind::InvalidReplica));
        }
        let packet = Packet::request(Opcode::OBSERVE_SEQNO)
            .with_vbucket(vbucket)
            .with_value(vbuuid.to_be_bytes().to_vec());
        let dispatch = Dispatch {
            replica_idx: replica_idx as i32,
            ..Dispatch::read()
        };
        let c = self.execute(packet, opts, dispatch).await?;
        decode_observe_vb(&c.resp.packet.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_roundtrip_layout() {
        let mut body = observe_body(12, b"k1").unwrap().to_vec();
        assert_eq!(&body[..6], &[0x00, 0x0c, 0x00, 0x02, b'k', b'1']);
        body.push(0x01);
        body.extend_from_slice(&99u64.to_be_bytes());
        let result = decode_observe(&body).unwrap();
        assert_eq!(result.key_state, KeyState::Persisted);
        assert_eq!(result.cas, 99);
    }

    #[test]
    fn test_observe_vb_failover_format() {
        let mut body = vec![1u8];
        body.extend_from_slice(&5u16.to_be_bytes());
        for v in [10u64, 20, 30, 7, 15] {
            body.extend_from_slice(&v.to_be_bytes());
        }
        let result = decode_observe_vb(&body).unwrap();
        assert!(result.did_failover);
        assert_eq!(result.vbucket, 5);
        assert_eq!(result.current_seqno, 30);
        assert_eq!(result.old_vbuuid, 7);
        assert_eq!(result.last_seqno, 15);

        assert!(decode_observe_vb(&body[..30]).is_err());
        body[0] = 0;
        assert!(!decode_observe_vb(&body[..27]).unwrap().did_failover);
    }

    #[test]
    fn test_key_state_codes() {
        assert_eq!(KeyState::from(0x80), KeyState::NotFound);
        assert_eq!(KeyState::from(0x81), KeyState::Deleted);
        assert_eq!(KeyState::from(0x42), KeyState::Unknown(0x42));
    }
}
