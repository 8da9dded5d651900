//! Change streams and the sequence-number queries their consumers need.
//!
//! A stream is one persistent request: the server first answers the stream
//! request (with the failover log, or a rollback point), then pushes events
//! under the same opaque until a stream-end.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{BufMut, Bytes, BytesMut};
use cbcore_errors::{CoreError, CoreResult, ErrorKind};
use cbcore_memd::{Magic, Opcode, Packet, Status};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::{Dispatch, KvOps, OpOptions, be_u16, be_u32, be_u64, short_body};
use crate::kv::request::{Request, Response, StreamSink};

/// Stream request flag asking for the current state only.
pub const STREAM_FLAG_LATEST: u32 = 0x04;
/// Stream request flag that ends the stream once the vbucket goes inactive.
pub const STREAM_FLAG_ACTIVE_ONLY: u32 = 0x10;

/// One `(vbuuid, seqno)` pair of a vbucket's history, newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FailoverEntry {
    pub vbuuid: u64,
    pub seqno: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VbSeqno {
    pub vbucket: u16,
    pub seqno: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotMarker {
    pub start_seqno: u64,
    pub end_seqno: u64,
    pub flags: u32,
    pub max_visible_seqno: Option<u64>,
    pub high_completed_seqno: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEndReason {
    Ok,
    Closed,
    StateChanged,
    Disconnected,
    TooSlow,
    BackfillFailed,
    Rollback,
    FilterEmpty,
    LostPrivileges,
    Unknown(u32),
}

impl From<u32> for StreamEndReason {
    fn from(v: u32) -> Self {
        match v {
            0 => Self::Ok,
            1 => Self::Closed,
            2 => Self::StateChanged,
            3 => Self::Disconnected,
            4 => Self::TooSlow,
            5 => Self::BackfillFailed,
            6 => Self::Rollback,
            7 => Self::FilterEmpty,
            8 => Self::LostPrivileges,
            other => Self::Unknown(other),
        }
    }
}

/// A typed change-stream event.
#[derive(Debug, Clone, PartialEq)]
pub enum DcpEvent {
    SnapshotMarker {
        vbucket: u16,
        stream_id: Option<u16>,
        marker: SnapshotMarker,
    },
    Mutation {
        vbucket: u16,
        stream_id: Option<u16>,
        seqno: u64,
        rev_seqno: u64,
        cas: u64,
        flags: u32,
        expiry: u32,
        lock_time: u32,
        datatype: u8,
        collection_id: u32,
        key: Bytes,
        value: Bytes,
    },
    Deletion {
        vbucket: u16,
        stream_id: Option<u16>,
        seqno: u64,
        rev_seqno: u64,
        cas: u64,
        datatype: u8,
        collection_id: u32,
        key: Bytes,
        value: Bytes,
    },
    Expiration {
        vbucket: u16,
        stream_id: Option<u16>,
        seqno: u64,
        rev_seqno: u64,
        cas: u64,
        collection_id: u32,
        key: Bytes,
    },
    /// Scope and collection lifecycle events. The body layout depends on
    /// `event` and `version`.
    SystemEvent {
        vbucket: u16,
        stream_id: Option<u16>,
        seqno: u64,
        event: u32,
        version: u8,
        key: Bytes,
        value: Bytes,
    },
    SeqnoAdvanced {
        vbucket: u16,
        stream_id: Option<u16>,
        seqno: u64,
    },
    OsoSnapshot {
        vbucket: u16,
        stream_id: Option<u16>,
        /// Set on the opening marker, clear on the closing one.
        start: bool,
    },
    StreamEnd {
        vbucket: u16,
        stream_id: Option<u16>,
        reason: StreamEndReason,
    },
}

/// Receives the events of one stream. `end` is called exactly once, after
/// the last event.
pub trait StreamObserver: Send + Sync {
    fn on_event(&self, event: DcpEvent);
    fn end(&self, vbucket: u16, err: Option<CoreError>);
}

/// Collection filter sent as the stream request body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamFilter {
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "hex_opt")]
    pub scope: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty", serialize_with = "hex_vec")]
    pub collections: Vec<u32>,
    #[serde(rename = "uid", skip_serializing_if = "Option::is_none", serialize_with = "hex_opt_u64")]
    pub manifest_uid: Option<u64>,
    #[serde(rename = "sid", skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<u16>,
}

fn hex_opt<S: serde::Serializer>(v: &Option<u32>, s: S) -> Result<S::Ok, S::Error> {
    match v {
        Some(v) => s.serialize_str(&format!("{v:x}")),
        None => s.serialize_none(),
    }
}

fn hex_opt_u64<S: serde::Serializer>(v: &Option<u64>, s: S) -> Result<S::Ok, S::Error> {
    match v {
        Some(v) => s.serialize_str(&format!("{v:x}")),
        None => s.serialize_none(),
    }
}

fn hex_vec<S: serde::Serializer>(v: &[u32], s: S) -> Result<S::Ok, S::Error> {
    s.collect_seq(v.iter().map(|id| format!("{id:x}")))
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub flags: u32,
    pub start_seqno: u64,
    pub end_seqno: u64,
    pub vbuuid: u64,
    pub snap_start_seqno: u64,
    pub snap_end_seqno: u64,
    pub filter: Option<StreamFilter>,
    pub stream_id: Option<u16>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            flags: 0,
            start_seqno: 0,
            end_seqno: u64::MAX,
            vbuuid: 0,
            snap_start_seqno: 0,
            snap_end_seqno: 0,
            filter: None,
            stream_id: None,
        }
    }
}

impl StreamOptions {
    fn extras(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(48);
        buf.put_u32(self.flags);
        buf.put_u32(0);
        buf.put_u64(self.start_seqno);
        buf.put_u64(self.end_seqno);
        buf.put_u64(self.vbuuid);
        buf.put_u64(self.snap_start_seqno);
        buf.put_u64(self.snap_end_seqno);
        buf.freeze()
    }
}

/// How the server answered a stream request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStart {
    Opened { failover_log: Vec<FailoverEntry> },
    /// The requested position is unknown to the server; restart from `seqno`.
    Rollback { seqno: u64 },
}

fn parse_failover_log(body: &[u8]) -> CoreResult<Vec<FailoverEntry>> {
    if body.len() % 16 != 0 {
        return Err(CoreError::protocol("failover log is not a whole number of entries"));
    }
    Ok(body
        .chunks_exact(16)
        .filter_map(|e| {
            Some(FailoverEntry {
                vbuuid: be_u64(e, 0)?,
                seqno: be_u64(e, 8)?,
            })
        })
        .collect())
}

fn parse_vb_seqnos(body: &[u8]) -> CoreResult<Vec<VbSeqno>> {
    if body.len() % 10 != 0 {
        return Err(CoreError::protocol("vbucket seqno list is not a whole number of entries"));
    }
    Ok(body
        .chunks_exact(10)
        .filter_map(|e| {
            Some(VbSeqno {
                vbucket: be_u16(e, 0)?,
                seqno: be_u64(e, 2)?,
            })
        })
        .collect())
}

fn parse_snapshot_marker(packet: &Packet) -> CoreResult<SnapshotMarker> {
    let extras = &packet.extras;
    if extras.len() == 1 {
        // Version 2.0 markers carry the fields in the body.
        let v = &packet.value;
        let (Some(start), Some(end), Some(flags), Some(mvs), Some(hcs)) =
            (be_u64(v, 0), be_u64(v, 8), be_u32(v, 16), be_u64(v, 20), be_u64(v, 28))
        else {
            return Err(short_body("snapshot marker"));
        };
        return Ok(SnapshotMarker {
            start_seqno: start,
            end_seqno: end,
            flags,
            max_visible_seqno: Some(mvs),
            high_completed_seqno: Some(hcs),
        });
    }
    let (Some(start), Some(end), Some(flags)) = (be_u64(extras, 0), be_u64(extras, 8), be_u32(extras, 16)) else {
        return Err(short_body("snapshot marker"));
    };
    Ok(SnapshotMarker {
        start_seqno: start,
        end_seqno: end,
        flags,
        max_visible_seqno: None,
        high_completed_seqno: None,
    })
}

/// Decodes one pushed event packet.
pub fn parse_event(packet: &Packet) -> CoreResult<DcpEvent> {
    let vbucket = packet.vbucket;
    let stream_id = packet.stream_id;
    let extras = &packet.extras;
    let seqnos = || match (be_u64(extras, 0), be_u64(extras, 8)) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(short_body(packet.command.name())),
    };
    Ok(match packet.command {
        Opcode::DCP_SNAPSHOT_MARKER => DcpEvent::SnapshotMarker {
            vbucket,
            stream_id,
            marker: parse_snapshot_marker(packet)?,
        },
        Opcode::DCP_MUTATION => {
            let (seqno, rev_seqno) = seqnos()?;
            let (Some(flags), Some(expiry), Some(lock_time)) =
                (be_u32(extras, 16), be_u32(extras, 20), be_u32(extras, 24))
            else {
                return Err(short_body("mutation"));
            };
            DcpEvent::Mutation {
                vbucket,
                stream_id,
                seqno,
                rev_seqno,
                cas: packet.cas,
                flags,
                expiry,
                lock_time,
                datatype: packet.datatype,
                collection_id: packet.collection_id,
                key: packet.key.clone(),
                value: packet.value.clone(),
            }
        }
        Opcode::DCP_DELETION => {
            let (seqno, rev_seqno) = seqnos()?;
            DcpEvent::Deletion {
                vbucket,
                stream_id,
                seqno,
                rev_seqno,
                cas: packet.cas,
                datatype: packet.datatype,
                collection_id: packet.collection_id,
                key: packet.key.clone(),
                value: packet.value.clone(),
            }
        }
        Opcode::DCP_EXPIRATION => {
            let (seqno, rev_seqno) = seqnos()?;
            DcpEvent::Expiration {
                vbucket,
                stream_id,
                seqno,
                rev_seqno,
                cas: packet.cas,
                collection_id: packet.collection_id,
                key: packet.key.clone(),
            }
        }
        Opcode::DCP_SYSTEM_EVENT => {
            let (Some(seqno), Some(event), Some(version)) = (be_u64(extras, 0), be_u32(extras, 8), extras.get(12))
            else {
                return Err(short_body("system event"));
            };
            DcpEvent::SystemEvent {
                vbucket,
                stream_id,
                seqno,
                event,
                version: *version,
                key: packet.key.clone(),
                value: packet.value.clone(),
            }
        }
        Opcode::DCP_SEQNO_ADVANCED => DcpEvent::SeqnoAdvanced {
            vbucket,
            stream_id,
            seqno: be_u64(extras, 0).ok_or_else(|| short_body("seqno advanced"))?,
        },
        Opcode::DCP_OSO_SNAPSHOT => DcpEvent::OsoSnapshot {
            vbucket,
            stream_id,
            start: be_u32(extras, 0).ok_or_else(|| short_body("oso snapshot"))? & 0x01 != 0,
        },
        Opcode::DCP_STREAM_END => DcpEvent::StreamEnd {
            vbucket,
            stream_id,
            reason: StreamEndReason::from(be_u32(extras, 0).unwrap_or(0)),
        },
        other => {
            return Err(CoreError::protocol(format!("unexpected stream packet {}", other.name())));
        }
    })
}

/// Bridges a persistent stream request to a [`StreamObserver`].
struct DcpStreamSink {
    vbucket: u16,
    observer: Arc<dyn StreamObserver>,
    open: Mutex<Option<oneshot::Sender<CoreResult<StreamStart>>>>,
    opened: AtomicBool,
}

impl DcpStreamSink {
    fn reply_open(&self, result: CoreResult<StreamStart>) {
        if let Some(tx) = self.open.lock().take() {
            let _ = tx.send(result);
        }
    }
}

impl StreamSink for DcpStreamSink {
    fn on_response(&self, resp: Response) -> bool {
        let packet = resp.packet;
        if packet.magic == Magic::Res && packet.command == Opcode::DCP_STREAM_REQ {
            if packet.status == Status::ROLLBACK {
                let result = be_u64(&packet.value, 0)
                    .map(|seqno| StreamStart::Rollback { seqno })
                    .ok_or_else(|| short_body("rollback"));
                self.reply_open(result);
                return true;
            }
            match parse_failover_log(&packet.value) {
                Ok(failover_log) => {
                    self.opened.store(true, Ordering::Release);
                    self.reply_open(Ok(StreamStart::Opened { failover_log }));
                    false
                }
                Err(e) => {
                    self.reply_open(Err(e));
                    true
                }
            }
        } else {
            match parse_event(&packet) {
                Ok(event) => {
                    let finished = matches!(event, DcpEvent::StreamEnd { .. });
                    self.observer.on_event(event);
                    finished
                }
                Err(e) => {
                    debug!(vbucket = self.vbucket, error = %e, "Dropping undecodable stream event");
                    false
                }
            }
        }
    }

    fn end(&self, err: Option<CoreError>) {
        if self.opened.load(Ordering::Acquire) {
            trace!(vbucket = self.vbucket, "Stream ended");
            self.observer.end(self.vbucket, err);
        } else {
            self.reply_open(Err(err.unwrap_or_else(CoreError::canceled)));
        }
    }
}

impl KvOps {
    /// Opens a change stream on `vbucket`. Events flow to `observer` once
    /// the stream is open.
    pub async fn open_stream(
        &self,
        vbucket: u16,
        opts: &StreamOptions,
        observer: Arc<dyn StreamObserver>,
    ) -> CoreResult<StreamStart> {
        let mut packet = Packet::request(Opcode::DCP_STREAM_REQ)
            .with_vbucket(vbucket)
            .with_extras(opts.extras());
        packet.stream_id = opts.stream_id;
        if let Some(filter) = &opts.filter {
            let mut filter = filter.clone();
            filter.stream_id = opts.stream_id;
            let body = serde_json::to_vec(&filter).map_err(|e| CoreError::invalid_argument(e.to_string()))?;
            packet = packet.with_value(body);
        }

        let (tx, rx) = oneshot::channel();
        let sink = Arc::new(DcpStreamSink {
            vbucket,
            observer,
            open: Mutex::new(Some(tx)),
            opened: AtomicBool::new(false),
        });
        let req = Arc::new(Request::new_stream(packet, sink).with_retry_strategy(self.default_retry.clone()));
        self.mux.dispatch_direct(&req)?;
        rx.await.unwrap_or_else(|_| Err(CoreError::canceled()))
    }

    /// Asks the server to end the stream on `vbucket`. The stream's
    /// observer still receives its stream-end and `end` call.
    pub async fn close_stream(&self, vbucket: u16, stream_id: Option<u16>, opts: &OpOptions) -> CoreResult<()> {
        let mut packet = Packet::request(Opcode::DCP_CLOSE_STREAM).with_vbucket(vbucket);
        packet.stream_id = stream_id;
        self.execute(packet, opts, Dispatch::write()).await?;
        Ok(())
    }

    pub async fn get_failover_log(&self, vbucket: u16, opts: &OpOptions) -> CoreResult<Vec<FailoverEntry>> {
        let packet = Packet::request(Opcode::DCP_GET_FAILOVER_LOG).with_vbucket(vbucket);
        let c = self.execute(packet, opts, Dispatch::read()).await?;
        parse_failover_log(&c.resp.packet.value)
    }

    /// High seqnos of every vbucket in `vb_state` (1 active, 2 replica,
    /// 3 pending, 4 dead), gathered from every data node. With a collection
    /// id the seqnos are those of that collection.
    pub async fn get_vbucket_seqnos(
        &self,
        vb_state: u32,
        collection_id: Option<u32>,
        opts: &OpOptions,
    ) -> CoreResult<Vec<VbSeqno>> {
        if collection_id.is_some() && !self.mux.supports_collections() {
            return Err(CoreError::new(ErrorKind::CollectionsUnsupported));
        }
        let mut extras = vb_state.to_be_bytes().to_vec();
        if let Some(cid) = collection_id {
            extras.extend_from_slice(&cid.to_be_bytes());
        }
        let servers = self.mux.state()?.num_pipelines();
        let calls = (0..servers).map(|i| {
            let packet = Packet::request(Opcode::GET_ALL_VB_SEQNOS).with_extras(extras.clone());
            let dispatch = Dispatch {
                replica_idx: -(i as i32) - 1,
                ..Dispatch::read()
            };
            async move {
                let c = self.execute(packet, opts, dispatch).await?;
                parse_vb_seqnos(&c.resp.packet.value)
            }
        });
        let mut all = Vec::new();
        for result in join_all(calls).await {
            all.extend(result?);
        }
        all.sort_by_key(|s| s.vbucket);
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<DcpEvent>>,
        ends: Mutex<Vec<Option<ErrorKind>>>,
    }

    impl StreamObserver for Recorder {
        fn on_event(&self, event: DcpEvent) {
            self.events.lock().push(event);
        }
        fn end(&self, _vbucket: u16, err: Option<CoreError>) {
            self.ends.lock().push(err.map(|e| e.kind()));
        }
    }

    fn resp(packet: Packet) -> Response {
        Response {
            packet,
            source_addr: "127.0.0.1:11210".into(),
            source_conn_id: "c1".into(),
        }
    }

    fn mutation(vbucket: u16, seqno: u64) -> Packet {
        let mut extras = BytesMut::new();
        extras.put_u64(seqno);
        extras.put_u64(1);
        extras.put_u32(0xf1);
        extras.put_u32(0);
        extras.put_u32(0);
        extras.put_u16(0);
        extras.put_u8(0);
        Packet::request(Opcode::DCP_MUTATION)
            .with_vbucket(vbucket)
            .with_key("k1")
            .with_value("v1")
            .with_extras(extras.freeze())
    }

    #[test]
    fn test_stream_request_extras_layout() {
        let opts = StreamOptions {
            start_seqno: 5,
            vbuuid: 9,
            ..Default::default()
        };
        let extras = opts.extras();
        assert_eq!(extras.len(), 48);
        assert_eq!(be_u64(&extras, 8), Some(5));
        assert_eq!(be_u64(&extras, 16), Some(u64::MAX));
        assert_eq!(be_u64(&extras, 24), Some(9));
    }

    #[test]
    fn test_filter_encodes_hex_ids() {
        let filter = StreamFilter {
            collections: vec![8, 0x1a],
            stream_id: Some(3),
            ..Default::default()
        };
        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(json, serde_json::json!({"collections": ["8", "1a"], "sid": 3}));
    }

    #[test]
    fn test_parse_tables() {
        let mut body = BytesMut::new();
        body.put_u64(0xabc);
        body.put_u64(100);
        let log = parse_failover_log(&body).unwrap();
        assert_eq!(log, vec![FailoverEntry { vbuuid: 0xabc, seqno: 100 }]);
        assert!(parse_failover_log(&body[..10]).is_err());

        let mut body = BytesMut::new();
        body.put_u16(7);
        body.put_u64(55);
        assert_eq!(parse_vb_seqnos(&body).unwrap(), vec![VbSeqno { vbucket: 7, seqno: 55 }]);
    }

    #[test]
    fn test_parse_mutation_event() {
        let event = parse_event(&mutation(4, 12)).unwrap();
        match event {
            DcpEvent::Mutation {
                vbucket, seqno, flags, key, ..
            } => {
                assert_eq!(vbucket, 4);
                assert_eq!(seqno, 12);
                assert_eq!(flags, 0xf1);
                assert_eq!(&key[..], b"k1");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_delivers_until_stream_end() {
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = oneshot::channel();
        let sink = Arc::new(DcpStreamSink {
            vbucket: 4,
            observer: recorder.clone(),
            open: Mutex::new(Some(tx)),
            opened: AtomicBool::new(false),
        });
        let stream_req = Packet::request(Opcode::DCP_STREAM_REQ).with_vbucket(4);
        let req = Request::new_stream(stream_req.clone(), sink);

        let mut log = BytesMut::new();
        log.put_u64(1);
        log.put_u64(0);
        let open = Packet::response_to(&stream_req, Status::SUCCESS).with_value(log.freeze());
        assert!(req.try_callback(Ok(resp(open))));
        assert!(matches!(rx.await.unwrap().unwrap(), StreamStart::Opened { .. }));

        assert!(req.try_callback(Ok(resp(mutation(4, 1)))));
        let end = Packet::request(Opcode::DCP_STREAM_END)
            .with_vbucket(4)
            .with_extras(1u32.to_be_bytes().to_vec());
        assert!(req.try_callback(Ok(resp(end))));
        assert!(req.is_completed());
        assert!(!req.try_callback(Ok(resp(mutation(4, 2)))));

        let events = recorder.events.lock();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1],
            DcpEvent::StreamEnd {
                reason: StreamEndReason::Closed,
                ..
            }
        ));
        assert_eq!(*recorder.ends.lock(), vec![None]);
    }

    #[tokio::test]
    async fn test_rollback_reported_to_opener() {
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = oneshot::channel();
        let sink = Arc::new(DcpStreamSink {
            vbucket: 0,
            observer: recorder.clone(),
            open: Mutex::new(Some(tx)),
            opened: AtomicBool::new(false),
        });
        let stream_req = Packet::request(Opcode::DCP_STREAM_REQ);
        let req = Request::new_stream(stream_req.clone(), sink);
        let rollback = Packet::response_to(&stream_req, Status::ROLLBACK).with_value(42u64.to_be_bytes().to_vec());
        assert!(req.try_callback(Ok(resp(rollback))));

        assert_eq!(rx.await.unwrap().unwrap(), StreamStart::Rollback { seqno: 42 });
        assert!(recorder.ends.lock().is_empty());
    }
}
