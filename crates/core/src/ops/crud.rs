//! Single-document reads and writes.

use std::time::Duration;

use bytes::Bytes;
use cbcore_errors::{CoreError, CoreResult};
use cbcore_memd::{DurabilityFrame, DurabilityLevel, Opcode, Packet};
use rand::Rng;
use serde::Serialize;

use super::{Completed, Dispatch, KvOps, MutationToken, OpOptions, be_u32, be_u64, short_body};

/// Expiry value telling the server not to create a missing counter.
const COUNTER_NO_CREATE: u32 = 0xffff_ffff;

/// Document content as returned by the get family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResult {
    pub value: Bytes,
    pub flags: u32,
    pub datatype: u8,
    pub cas: u64,
}

impl GetResult {
    fn from_completed(c: &Completed) -> Self {
        Self {
            value: c.resp.packet.value.clone(),
            flags: be_u32(&c.resp.packet.extras, 0).unwrap_or(0),
            datatype: c.resp.packet.datatype,
            cas: c.resp.packet.cas,
        }
    }
}

/// Outcome of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MutationResult {
    pub cas: u64,
    pub token: Option<MutationToken>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterResult {
    pub value: u64,
    pub cas: u64,
    pub token: Option<MutationToken>,
}

/// Document metadata, including tombstones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GetMetaResult {
    pub deleted: bool,
    pub flags: u32,
    pub expiry: u32,
    pub seqno: u64,
    pub datatype: u8,
    pub cas: u64,
}

/// Settings common to the write family.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    pub flags: u32,
    /// Seconds, or an absolute unix time past 30 days.
    pub expiry: u32,
    /// Compare-and-swap guard. Zero skips the check.
    pub cas: u64,
    pub datatype: u8,
    pub durability: Option<DurabilityLevel>,
    /// Server side durability timeout.
    pub durability_timeout: Option<Duration>,
    pub preserve_expiry: bool,
}

impl StoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn with_expiry(mut self, expiry: u32) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_durability(mut self, level: DurabilityLevel) -> Self {
        self.durability = Some(level);
        self
    }

    pub fn with_preserve_expiry(mut self) -> Self {
        self.preserve_expiry = true;
        self
    }

    fn frame(&self) -> Option<DurabilityFrame> {
        self.durability.map(|level| DurabilityFrame {
            level,
            timeout: self.durability_timeout,
        })
    }
}

fn store_extras(flags: u32, expiry: u32) -> Vec<u8> {
    let mut extras = Vec::with_capacity(8);
    extras.extend_from_slice(&flags.to_be_bytes());
    extras.extend_from_slice(&expiry.to_be_bytes());
    extras
}

fn counter_extras(delta: u64, initial: Option<u64>, expiry: u32) -> Vec<u8> {
    let mut extras = Vec::with_capacity(20);
    extras.extend_from_slice(&delta.to_be_bytes());
    extras.extend_from_slice(&initial.unwrap_or(0).to_be_bytes());
    let expiry = if initial.is_some() { expiry } else { COUNTER_NO_CREATE };
    extras.extend_from_slice(&expiry.to_be_bytes());
    extras
}

impl KvOps {
    pub(super) fn mutation(&self, completed: &Completed) -> MutationResult {
        MutationResult {
            cas: completed.resp.packet.cas,
            token: self.mutation_token(completed),
        }
    }

    /// Applies the durability and preserve-expiry frames, checking the
    /// cluster can honour them.
    pub(super) fn prepare_write(&self, mut packet: Packet, store: &StoreOptions) -> CoreResult<(Packet, Dispatch)> {
        let mut dispatch = Dispatch::write();
        if let Some(frame) = store.frame() {
            self.require("durable writes", |s| s.durability)?;
            packet.durability = Some(frame);
            dispatch.durable = true;
        }
        packet.preserve_expiry = store.preserve_expiry;
        Ok((packet, dispatch))
    }

    pub async fn get(&self, key: impl Into<Bytes>, opts: &OpOptions) -> CoreResult<GetResult> {
        let packet = Packet::request(Opcode::GET).with_key(key);
        let c = self.execute(packet, opts, Dispatch::read()).await?;
        Ok(GetResult::from_completed(&c))
    }

    pub async fn get_and_touch(&self, key: impl Into<Bytes>, expiry: u32, opts: &OpOptions) -> CoreResult<GetResult> {
        let packet = Packet::request(Opcode::GAT)
            .with_key(key)
            .with_extras(expiry.to_be_bytes().to_vec());
        let c = self.execute(packet, opts, Dispatch::write()).await?;
        Ok(GetResult::from_completed(&c))
    }

    /// Reads and write-locks the document for `lock_time` seconds.
    pub async fn get_and_lock(&self, key: impl Into<Bytes>, lock_time: u32, opts: &OpOptions) -> CoreResult<GetResult> {
        let packet = Packet::request(Opcode::GET_LOCKED)
            .with_key(key)
            .with_extras(lock_time.to_be_bytes().to_vec());
        let c = self.execute(packet, opts, Dispatch::write()).await?;
        Ok(GetResult::from_completed(&c))
    }

    /// Reads from replica `replica_idx`, counted from 1.
    pub async fn get_one_replica(
        &self,
        key: impl Into<Bytes>,
        replica_idx: u32,
        opts: &OpOptions,
    ) -> CoreResult<GetResult> {
        if replica_idx == 0 {
            return Err(CoreError::new(cbcore_errors::ErrorKind::InvalidReplica));
        }
        let packet = Packet::request(Opcode::GET_REPLICA).with_key(key);
        let dispatch = Dispatch {
            replica_idx: replica_idx as i32,
            ..Dispatch::read()
        };
        let c = self.execute(packet, opts, dispatch).await?;
        Ok(GetResult::from_completed(&c))
    }

    pub async fn get_meta(&self, key: impl Into<Bytes>, opts: &OpOptions) -> CoreResult<GetMetaResult> {
        // Version 2 adds the datatype to the reply.
        let packet = Packet::request(Opcode::GET_META).with_key(key).with_extras(vec![2u8]);
        let c = self.execute(packet, opts, Dispatch::read()).await?;
        let extras = &c.resp.packet.extras;
        let (Some(deleted), Some(flags), Some(expiry), Some(seqno)) =
            (be_u32(extras, 0), be_u32(extras, 4), be_u32(extras, 8), be_u64(extras, 12))
        else {
            return Err(short_body("get meta"));
        };
        Ok(GetMetaResult {
            deleted: deleted != 0,
            flags,
            expiry,
            seqno,
            datatype: extras.get(20).copied().unwrap_or(c.resp.packet.datatype),
            cas: c.resp.packet.cas,
        })
    }

    /// Fetches a random document from a random data node. Returns the key
    /// alongside the content.
    pub async fn get_random(&self, opts: &OpOptions) -> CoreResult<(Bytes, GetResult)> {
        let mut packet = Packet::request(Opcode::GET_RANDOM);
        if let Some(cid) = opts.collection_id {
            packet = packet.with_extras(cid.to_be_bytes().to_vec());
        }
        let servers = self.mux.state()?.num_pipelines().max(1);
        let server = rand::thread_rng().gen_range(0..servers) as i32;
        let dispatch = Dispatch {
            replica_idx: -server - 1,
            ..Dispatch::read()
        };
        let c = self.execute(packet, opts, dispatch).await?;
        Ok((c.resp.packet.key.clone(), GetResult::from_completed(&c)))
    }

    pub async fn touch(&self, key: impl Into<Bytes>, expiry: u32, opts: &OpOptions) -> CoreResult<MutationResult> {
        let packet = Packet::request(Opcode::TOUCH)
            .with_key(key)
            .with_extras(expiry.to_be_bytes().to_vec());
        let c = self.execute(packet, opts, Dispatch::write()).await?;
        Ok(self.mutation(&c))
    }

    pub async fn unlock(&self, key: impl Into<Bytes>, cas: u64, opts: &OpOptions) -> CoreResult<MutationResult> {
        let packet = Packet::request(Opcode::UNLOCK).with_key(key).with_cas(cas);
        let c = self.execute(packet, opts, Dispatch::write()).await?;
        Ok(self.mutation(&c))
    }

    pub async fn delete(&self, key: impl Into<Bytes>, store: &StoreOptions, opts: &OpOptions) -> CoreResult<MutationResult> {
        let packet = Packet::request(Opcode::DELETE).with_key(key).with_cas(store.cas);
        let (packet, dispatch) = self.prepare_write(packet, store)?;
        let c = self.execute(packet, opts, dispatch).await?;
        Ok(self.mutation(&c))
    }

    async fn store(
        &self,
        command: Opcode,
        key: Bytes,
        value: Bytes,
        store: &StoreOptions,
        opts: &OpOptions,
    ) -> CoreResult<MutationResult> {
        let packet = Packet::request(command)
            .with_key(key)
            .with_value(value)
            .with_cas(store.cas)
            .with_datatype(store.datatype)
            .with_extras(store_extras(store.flags, store.expiry));
        let (packet, dispatch) = self.prepare_write(packet, store)?;
        let c = self.execute(packet, opts, dispatch).await?;
        Ok(self.mutation(&c))
    }

    /// Creates or overwrites the document.
    pub async fn set(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        store: &StoreOptions,
        opts: &OpOptions,
    ) -> CoreResult<MutationResult> {
        self.store(Opcode::SET, key.into(), value.into(), store, opts).await
    }

    /// Creates the document, failing with `DocumentExists` if present.
    pub async fn add(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        store: &StoreOptions,
        opts: &OpOptions,
    ) -> CoreResult<MutationResult> {
        if store.cas != 0 {
            return Err(CoreError::invalid_argument("add does not take a cas"));
        }
        self.store(Opcode::ADD, key.into(), value.into(), store, opts).await
    }

    pub async fn replace(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        store: &StoreOptions,
        opts: &OpOptions,
    ) -> CoreResult<MutationResult> {
        self.store(Opcode::REPLACE, key.into(), value.into(), store, opts).await
    }

    async fn adjoin(
        &self,
        command: Opcode,
        key: Bytes,
        value: Bytes,
        store: &StoreOptions,
        opts: &OpOptions,
    ) -> CoreResult<MutationResult> {
        let packet = Packet::request(command)
            .with_key(key)
            .with_value(value)
            .with_cas(store.cas);
        let (packet, dispatch) = self.prepare_write(packet, store)?;
        let c = self.execute(packet, opts, dispatch).await?;
        Ok(self.mutation(&c))
    }

    pub async fn append(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        store: &StoreOptions,
        opts: &OpOptions,
    ) -> CoreResult<MutationResult> {
        self.adjoin(Opcode::APPEND, key.into(), value.into(), store, opts).await
    }

    pub async fn prepend(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        store: &StoreOptions,
        opts: &OpOptions,
    ) -> CoreResult<MutationResult> {
        self.adjoin(Opcode::PREPEND, key.into(), value.into(), store, opts).await
    }

    async fn counter(
        &self,
        command: Opcode,
        key: Bytes,
        delta: u64,
        initial: Option<u64>,
        store: &StoreOptions,
        opts: &OpOptions,
    ) -> CoreResult<CounterResult> {
        let packet = Packet::request(command)
            .with_key(key)
            .with_cas(store.cas)
            .with_extras(counter_extras(delta, initial, store.expiry));
        let (packet, dispatch) = self.prepare_write(packet, store)?;
        let c = self.execute(packet, opts, dispatch).await?;
        let value = be_u64(&c.resp.packet.value, 0).ok_or_else(|| short_body("counter"))?;
        Ok(CounterResult {
            value,
            cas: c.resp.packet.cas,
            token: self.mutation_token(&c),
        })
    }

    /// Adds `delta`. A missing document is created with `initial` when
    /// given, otherwise the call fails with `DocumentNotFound`.
    pub async fn increment(
        &self,
        key: impl Into<Bytes>,
        delta: u64,
        initial: Option<u64>,
        store: &StoreOptions,
        opts: &OpOptions,
    ) -> CoreResult<CounterResult> {
        self.counter(Opcode::INCREMENT, key.into(), delta, initial, store, opts).await
    }

    /// Subtracts `delta`, saturating at zero on the server.
    pub async fn decrement(
        &self,
        key: impl Into<Bytes>,
        delta: u64,
        initial: Option<u64>,
        store: &StoreOptions,
        opts: &OpOptions,
    ) -> CoreResult<CounterResult> {
        self.counter(Opcode::DECREMENT, key.into(), delta, initial, store, opts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_extras_layout() {
        let extras = store_extras(0xdeadbeef, 60);
        assert_eq!(&extras[..4], &0xdeadbeefu32.to_be_bytes());
        assert_eq!(&extras[4..], &60u32.to_be_bytes());
    }

    #[test]
    fn test_counter_without_initial_never_creates() {
        let extras = counter_extras(5, None, 30);
        assert_eq!(extras.len(), 20);
        assert_eq!(be_u64(&extras, 0), Some(5));
        assert_eq!(be_u32(&extras, 16), Some(COUNTER_NO_CREATE));

        let extras = counter_extras(5, Some(10), 30);
        assert_eq!(be_u64(&extras, 8), Some(10));
        assert_eq!(be_u32(&extras, 16), Some(30));
    }

    #[test]
    fn test_durability_frame_carries_timeout() {
        let store = StoreOptions::new().with_durability(DurabilityLevel::Majority);
        assert_eq!(
            store.frame(),
            Some(DurabilityFrame {
                level: DurabilityLevel::Majority,
                timeout: None
            })
        );
        assert!(StoreOptions::new().frame().is_none());
    }
}
