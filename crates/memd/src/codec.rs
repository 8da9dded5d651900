//! `tokio_util` codec framing packets over a byte stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::MemdError;
use crate::packet::Packet;

/// Packet codec.
///
/// Clones share the collections flag, so the read and write halves of one
/// connection switch to collection-prefixed keys together once HELLO
/// negotiates them.
#[derive(Debug, Clone, Default)]
pub struct MemdCodec {
    collections: Arc<AtomicBool>,
}

impl MemdCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Turns on collection id key prefixes for both directions.
    pub fn enable_collections(&self) {
        self.collections.store(true, Ordering::Release);
    }

    pub fn collections_enabled(&self) -> bool {
        self.collections.load(Ordering::Acquire)
    }
}

impl Decoder for MemdCodec {
    type Item = Packet;
    type Error = MemdError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Packet::decode(src, self.collections_enabled())
    }
}

impl Encoder<Packet> for MemdCodec {
    type Error = MemdError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst, self.collections_enabled())
    }
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;
    use crate::opcode::Opcode;

    #[tokio::test]
    async fn test_framed_stream() {
        let (client, server) = tokio::io::duplex(4096);
        let codec = MemdCodec::new();
        codec.enable_collections();

        let mut writer = FramedWrite::new(client, codec.clone());
        let mut reader = FramedRead::new(server, codec);

        for i in 0..3u32 {
            let mut p = Packet::request(Opcode::GET).with_key(format!("key-{i}")).with_opaque(i);
            p.collection_id = 9;
            writer.send(p).await.unwrap();
        }
        for i in 0..3u32 {
            let p = reader.next().await.unwrap().unwrap();
            assert_eq!(p.opaque, i);
            assert_eq!(p.collection_id, 9);
            assert_eq!(p.key, format!("key-{i}").into_bytes());
        }
    }
}
