//! Packet model and the 24-byte header layout.
//!
//! ```text
//! 0      magic
//! 1      opcode
//! 2..4   key length        (alt: 2 = framing extras length, 3 = key length)
//! 4      extras length
//! 5      datatype
//! 6..8   vbucket / status
//! 8..12  total body length
//! 12..16 opaque
//! 16..24 cas
//! ```

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::datatype::DurabilityLevel;
use crate::error::{MemdError, MemdResult};
use crate::leb128::{append_uleb128_u32, decode_uleb128_u32};
use crate::opcode::{Magic, Opcode};
use crate::status::Status;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 24;

/// Largest body the decoder accepts.
pub const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

const FRAME_BARRIER: u8 = 0;
const FRAME_DURABILITY: u8 = 1;
const FRAME_STREAM_ID: u8 = 2;
const FRAME_IMPERSONATE: u8 = 4;
const FRAME_PRESERVE_EXPIRY: u8 = 5;
const FRAME_SERVER_DURATION: u8 = 0;

/// Durability requirement attached to a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurabilityFrame {
    pub level: DurabilityLevel,
    /// Server side timeout; `None` uses the server default.
    pub timeout: Option<Duration>,
}

/// One protocol packet, request or response.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub magic: Magic,
    pub command: Opcode,
    pub datatype: u8,
    /// Response status. Always success on request-magic packets.
    pub status: Status,
    /// Vbucket id on requests. Zero on responses.
    pub vbucket: u16,
    pub opaque: u32,
    pub cas: u64,
    /// Collection id prefixed to the key when collections are negotiated.
    pub collection_id: u32,
    pub key: Bytes,
    pub extras: Bytes,
    pub value: Bytes,

    pub barrier: bool,
    pub durability: Option<DurabilityFrame>,
    pub stream_id: Option<u16>,
    pub impersonate_user: Option<String>,
    pub preserve_expiry: bool,
    /// Server-side processing time reported on responses.
    pub server_duration: Option<Duration>,
    /// Size the packet occupied on the wire. Only set by [`Packet::decode`].
    pub wire_len: usize,
}

impl Default for Packet {
    fn default() -> Self {
        Self {
            magic: Magic::Req,
            command: Opcode::NOOP,
            datatype: 0,
            status: Status::SUCCESS,
            vbucket: 0,
            opaque: 0,
            cas: 0,
            collection_id: 0,
            key: Bytes::new(),
            extras: Bytes::new(),
            value: Bytes::new(),
            barrier: false,
            durability: None,
            stream_id: None,
            impersonate_user: None,
            preserve_expiry: false,
            server_duration: None,
            wire_len: 0,
        }
    }
}

impl Packet {
    /// A blank request for `command`.
    pub fn request(command: Opcode) -> Self {
        Self {
            command,
            ..Default::default()
        }
    }

    /// A blank response mirroring `req`'s command and opaque.
    pub fn response_to(req: &Packet, status: Status) -> Self {
        Self {
            magic: Magic::Res,
            command: req.command,
            opaque: req.opaque,
            status,
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_extras(mut self, extras: impl Into<Bytes>) -> Self {
        self.extras = extras.into();
        self
    }

    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn with_datatype(mut self, datatype: u8) -> Self {
        self.datatype = datatype;
        self
    }

    pub fn with_vbucket(mut self, vbucket: u16) -> Self {
        self.vbucket = vbucket;
        self
    }

    pub fn with_opaque(mut self, opaque: u32) -> Self {
        self.opaque = opaque;
        self
    }

    pub fn is_response(&self) -> bool {
        self.magic.is_response()
    }

    fn is_request_direction(&self) -> bool {
        matches!(self.magic, Magic::Req | Magic::AltReq | Magic::ServerReq)
    }

    fn encode_frames(&self) -> MemdResult<Vec<u8>> {
        let mut out = Vec::new();
        if self.is_request_direction() {
            if self.barrier {
                push_frame(&mut out, FRAME_BARRIER, &[])?;
            }
            if let Some(d) = self.durability {
                match d.timeout {
                    Some(t) => {
                        let ms = t.as_millis().clamp(1, u128::from(u16::MAX - 1)) as u16;
                        let mut body = vec![d.level as u8];
                        body.extend_from_slice(&ms.to_be_bytes());
                        push_frame(&mut out, FRAME_DURABILITY, &body)?;
                    }
                    None => push_frame(&mut out, FRAME_DURABILITY, &[d.level as u8])?,
                }
            }
            if let Some(id) = self.stream_id {
                push_frame(&mut out, FRAME_STREAM_ID, &id.to_be_bytes())?;
            }
            if let Some(user) = &self.impersonate_user {
                push_frame(&mut out, FRAME_IMPERSONATE, user.as_bytes())?;
            }
            if self.preserve_expiry {
                push_frame(&mut out, FRAME_PRESERVE_EXPIRY, &[])?;
            }
        } else if let Some(d) = self.server_duration {
            push_frame(&mut out, FRAME_SERVER_DURATION, &encode_server_duration(d).to_be_bytes())?;
        }
        Ok(out)
    }

    /// Appends the wire form of this packet to `buf`.
    pub fn encode(&self, buf: &mut BytesMut, collections: bool) -> MemdResult<()> {
        let frames = self.encode_frames()?;
        let magic = match (self.magic, frames.is_empty()) {
            (Magic::Req, false) => Magic::AltReq,
            (Magic::Res, false) => Magic::AltRes,
            (Magic::AltReq, true) => Magic::Req,
            (Magic::AltRes, true) => Magic::Res,
            (m, _) => m,
        };

        let prefix_key = collections
            && self.command.is_collection_encoded()
            && matches!(magic, Magic::Req | Magic::AltReq);
        let mut key_prefix = Vec::new();
        if prefix_key {
            append_uleb128_u32(&mut key_prefix, self.collection_id);
        }
        let key_len = key_prefix.len() + self.key.len();

        if self.extras.len() > u8::MAX as usize {
            return Err(MemdError::Malformed("extras longer than 255 bytes"));
        }
        let body_len = frames.len() + self.extras.len() + key_len + self.value.len();
        buf.reserve(HEADER_SIZE + body_len);

        buf.put_u8(magic as u8);
        buf.put_u8(self.command.0);
        if magic.is_alt() {
            if frames.len() > u8::MAX as usize || key_len > u8::MAX as usize {
                return Err(MemdError::Malformed("alt packet key or frames longer than 255 bytes"));
            }
            buf.put_u8(frames.len() as u8);
            buf.put_u8(key_len as u8);
        } else {
            if key_len > u16::MAX as usize {
                return Err(MemdError::Malformed("key longer than 65535 bytes"));
            }
            buf.put_u16(key_len as u16);
        }
        buf.put_u8(self.extras.len() as u8);
        buf.put_u8(self.datatype);
        if magic.is_response() {
            buf.put_u16(self.status.0);
        } else {
            buf.put_u16(self.vbucket);
        }
        buf.put_u32(body_len as u32);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);
        buf.put_slice(&frames);
        buf.put_slice(&self.extras);
        buf.put_slice(&key_prefix);
        buf.put_slice(&self.key);
        buf.put_slice(&self.value);
        Ok(())
    }

    /// Decodes one packet from the front of `buf`.
    ///
    /// Returns `Ok(None)` if more bytes are needed. Consumed bytes are removed.
    pub fn decode(buf: &mut BytesMut, collections: bool) -> MemdResult<Option<Self>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let magic = Magic::from_u8(buf[0]).ok_or(MemdError::InvalidMagic(buf[0]))?;
        let body_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        if body_len > MAX_BODY_SIZE {
            return Err(MemdError::BodyTooLarge {
                size: body_len,
                max: MAX_BODY_SIZE,
            });
        }
        if buf.len() < HEADER_SIZE + body_len {
            buf.reserve(HEADER_SIZE + body_len - buf.len());
            return Ok(None);
        }

        let mut header = buf.split_to(HEADER_SIZE);
        let mut body = buf.split_to(body_len).freeze();

        header.advance(1);
        let command = Opcode(header.get_u8());
        let (frames_len, key_len) = if magic.is_alt() {
            let f = header.get_u8() as usize;
            let k = header.get_u8() as usize;
            (f, k)
        } else {
            (0, header.get_u16() as usize)
        };
        let extras_len = header.get_u8() as usize;
        let datatype = header.get_u8();
        let vb_or_status = header.get_u16();
        header.advance(4);
        let opaque = header.get_u32();
        let cas = header.get_u64();

        if frames_len + extras_len + key_len > body_len {
            return Err(MemdError::Malformed("header lengths exceed body length"));
        }

        let mut packet = Packet {
            magic,
            command,
            datatype,
            opaque,
            cas,
            wire_len: HEADER_SIZE + body_len,
            ..Default::default()
        };
        if magic.is_response() {
            packet.status = Status(vb_or_status);
        } else {
            packet.vbucket = vb_or_status;
        }

        let frames = body.split_to(frames_len);
        packet.decode_frames(&frames)?;
        packet.extras = body.split_to(extras_len);
        let mut key = body.split_to(key_len);
        if collections
            && command.is_collection_encoded()
            && matches!(magic, Magic::Req | Magic::AltReq)
            && !key.is_empty()
        {
            let (cid, n) = decode_uleb128_u32(&key)?;
            packet.collection_id = cid;
            key.advance(n);
        }
        packet.key = key;
        packet.value = body;
        Ok(Some(packet))
    }

    fn decode_frames(&mut self, mut frames: &[u8]) -> MemdResult<()> {
        while !frames.is_empty() {
            let head = frames[0];
            frames = &frames[1..];
            let mut id = head >> 4;
            let mut len = (head & 0x0f) as usize;
            if id == 15 {
                let (&b, rest) = frames
                    .split_first()
                    .ok_or_else(|| MemdError::InvalidFrame("truncated escaped id".into()))?;
                id = id.saturating_add(b);
                frames = rest;
            }
            if len == 15 {
                let (&b, rest) = frames
                    .split_first()
                    .ok_or_else(|| MemdError::InvalidFrame("truncated escaped length".into()))?;
                len += b as usize;
                frames = rest;
            }
            if frames.len() < len {
                return Err(MemdError::InvalidFrame(format!(
                    "frame {id} wants {len} bytes, {} left",
                    frames.len()
                )));
            }
            let (data, rest) = frames.split_at(len);
            frames = rest;

            if self.is_request_direction() {
                match id {
                    FRAME_BARRIER => self.barrier = true,
                    FRAME_DURABILITY => {
                        let level = data
                            .first()
                            .and_then(|b| DurabilityLevel::from_u8(*b))
                            .ok_or_else(|| MemdError::InvalidFrame("bad durability level".into()))?;
                        let timeout = (data.len() >= 3)
                            .then(|| Duration::from_millis(u64::from(u16::from_be_bytes([data[1], data[2]]))));
                        self.durability = Some(DurabilityFrame { level, timeout });
                    }
                    FRAME_STREAM_ID if data.len() == 2 => {
                        self.stream_id = Some(u16::from_be_bytes([data[0], data[1]]));
                    }
                    FRAME_IMPERSONATE => {
                        self.impersonate_user = Some(String::from_utf8_lossy(data).into_owned());
                    }
                    FRAME_PRESERVE_EXPIRY => self.preserve_expiry = true,
                    _ => {}
                }
            } else if id == FRAME_SERVER_DURATION && data.len() == 2 {
                self.server_duration = Some(decode_server_duration(u16::from_be_bytes([data[0], data[1]])));
            }
        }
        Ok(())
    }
}

fn push_frame(out: &mut Vec<u8>, id: u8, data: &[u8]) -> MemdResult<()> {
    if id >= 15 || data.len() >= 15 + 255 {
        return Err(MemdError::InvalidFrame(format!("frame {id} with {} bytes", data.len())));
    }
    if data.len() < 15 {
        out.push((id << 4) | data.len() as u8);
    } else {
        out.push((id << 4) | 0x0f);
        out.push((data.len() - 15) as u8);
    }
    out.extend_from_slice(data);
    Ok(())
}

/// Decodes the compressed server-duration frame value.
pub fn decode_server_duration(encoded: u16) -> Duration {
    let micros = (f64::from(encoded)).powf(1.74) / 2.0;
    Duration::from_micros(micros as u64)
}

/// Inverse of [`decode_server_duration`], saturating at the largest encodable value.
pub fn encode_server_duration(d: Duration) -> u16 {
    let micros = d.as_micros() as f64;
    let encoded = (micros * 2.0).powf(1.0 / 1.74).round();
    encoded.min(f64::from(u16::MAX)) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let packet = Packet::request(Opcode::GET)
            .with_key("k1")
            .with_vbucket(0x0102)
            .with_opaque(7)
            .with_cas(9);
        let mut buf = BytesMut::new();
        packet.encode(&mut buf, false).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + 2);
        assert_eq!(buf[0], 0x80);
        assert_eq!(buf[1], 0x00);
        assert_eq!(&buf[2..4], &[0x00, 0x02]);
        assert_eq!(&buf[6..8], &[0x01, 0x02]);
        assert_eq!(&buf[12..16], &[0, 0, 0, 7]);
        assert_eq!(buf[23], 9);
    }

    #[test]
    fn test_collection_prefix() {
        let mut packet = Packet::request(Opcode::GET).with_key("k1");
        packet.collection_id = 8;
        let mut buf = BytesMut::new();
        packet.encode(&mut buf, true).unwrap();
        assert_eq!(&buf[HEADER_SIZE..], &[0x08, b'k', b'1']);

        let decoded = Packet::decode(&mut buf, true).unwrap().unwrap();
        assert_eq!(decoded.collection_id, 8);
        assert_eq!(&decoded.key[..], b"k1");
        assert_eq!(decoded.wire_len, HEADER_SIZE + 3);
    }

    #[test]
    fn test_no_prefix_on_non_collection_command() {
        let mut packet = Packet::request(Opcode::GET_CLUSTER_CONFIG);
        packet.collection_id = 8;
        let mut buf = BytesMut::new();
        packet.encode(&mut buf, true).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);
    }

    #[test]
    fn test_alt_request_frames() {
        let mut packet = Packet::request(Opcode::SET).with_key("k").with_value("v");
        packet.durability = Some(DurabilityFrame {
            level: DurabilityLevel::Majority,
            timeout: Some(Duration::from_millis(1000)),
        });
        packet.preserve_expiry = true;
        let mut buf = BytesMut::new();
        packet.encode(&mut buf, false).unwrap();
        assert_eq!(buf[0], Magic::AltReq as u8);
        assert_eq!(buf[2], 5);
        assert_eq!(buf[3], 1);

        let decoded = Packet::decode(&mut buf, false).unwrap().unwrap();
        assert_eq!(decoded.durability, packet.durability);
        assert!(decoded.preserve_expiry);
        assert_eq!(&decoded.value[..], b"v");
    }

    #[test]
    fn test_response_server_duration() {
        let req = Packet::request(Opcode::GET).with_opaque(3);
        let mut res = Packet::response_to(&req, Status::KEY_NOT_FOUND);
        res.server_duration = Some(Duration::from_micros(1500));
        let mut buf = BytesMut::new();
        res.encode(&mut buf, false).unwrap();
        assert_eq!(buf[0], Magic::AltRes as u8);

        let decoded = Packet::decode(&mut buf, false).unwrap().unwrap();
        assert_eq!(decoded.status, Status::KEY_NOT_FOUND);
        assert_eq!(decoded.opaque, 3);
        let micros = decoded.server_duration.unwrap().as_micros() as i64;
        assert!((micros - 1500).abs() < 50, "decoded {micros}us");
    }

    #[test]
    fn test_partial_input_needs_more() {
        let packet = Packet::request(Opcode::SET).with_key("key").with_value("value");
        let mut full = BytesMut::new();
        packet.encode(&mut full, false).unwrap();
        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(Packet::decode(&mut partial, false).unwrap().is_none());
        assert!(Packet::decode(&mut BytesMut::from(&full[..10]), false).unwrap().is_none());
    }

    #[test]
    fn test_invalid_magic() {
        let mut buf = BytesMut::from(&[0x42u8; HEADER_SIZE][..]);
        assert!(matches!(Packet::decode(&mut buf, false), Err(MemdError::InvalidMagic(0x42))));
    }
}
