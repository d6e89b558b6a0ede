//! Wire layout of one batch of records:
//!
//! ```text
//! +-----------+----------------------+------------------------------+
//! | count u64 | keys: count x u64    | payloads: count x WIRE_LEN   |
//! +-----------+----------------------+------------------------------+
//! ```
//!
//! Everything little-endian, no padding. While a batch is being packed the
//! payloads sit after room for `capacity` keys; `seal` moves them down so a
//! partial batch is sent without a gap.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::common::payload::Payload;
use crate::common::region::{RegisteredBuffer, RemoteRegionToken};
use crate::rdma::Domain;
use crate::{TransError, TransResult};

pub const RECORD_HEADER_SIZE: usize = 8;
pub const KEY_SIZE: usize = 8;

/// Records that fit in `bytes`.
#[inline]
pub fn capacity_for(bytes: usize, payload_len: usize) -> usize {
    bytes.saturating_sub(RECORD_HEADER_SIZE) / (KEY_SIZE + payload_len)
}

/// Bytes a buffer of `capacity` records needs.
#[inline]
pub fn byte_size_for(capacity: usize, payload_len: usize) -> usize {
    RECORD_HEADER_SIZE + capacity * (KEY_SIZE + payload_len)
}

/// Typed view over a `RegisteredBuffer` holding one record batch.
pub struct StructuredRecordBuffer<P> {
    buffer: RegisteredBuffer,
    capacity: usize,
    filled: usize,
    // one encoded payload, reused by every push
    scratch: Vec<u8>,
    _payload: PhantomData<P>,
}

impl<P: Payload> StructuredRecordBuffer<P> {
    pub fn new(buffer: RegisteredBuffer) -> Self {
        let capacity = capacity_for(buffer.len(), P::WIRE_LEN);
        Self {
            buffer,
            capacity,
            filled: 0,
            scratch: vec![0u8; P::WIRE_LEN],
            _payload: PhantomData,
        }
    }

    pub fn allocate(domain: &Arc<dyn Domain>, capacity: usize) -> TransResult<Self> {
        let buffer = RegisteredBuffer::allocate(domain, byte_size_for(capacity, P::WIRE_LEN))?;
        Ok(Self::new(buffer))
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn buffer(&self) -> &RegisteredBuffer {
        &self.buffer
    }

    #[inline]
    pub fn export_token(&self) -> RemoteRegionToken {
        self.buffer.export_token()
    }

    /// Start packing a new batch.
    pub fn clear(&mut self) {
        self.filled = 0;
        self.buffer.store_u64(0, 0);
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.filled == self.capacity
    }

    #[inline]
    pub fn filled(&self) -> usize {
        self.filled
    }

    /// Append one record; returns `true` once the batch is full.
    pub fn push(&mut self, key: u64, payload: &P) -> bool {
        assert!(self.filled < self.capacity, "record batch overflow");
        let mut raw = [0u8; KEY_SIZE];
        key.encode(&mut raw);
        self.buffer
            .write(RECORD_HEADER_SIZE + self.filled * KEY_SIZE, &raw);

        payload.encode(&mut self.scratch);
        let at = self.payload_base(self.capacity) + self.filled * P::WIRE_LEN;
        self.buffer.write(at, &self.scratch);

        self.filled += 1;
        self.is_full()
    }

    /// Write the count header and close the gap behind the keys. Returns
    /// the number of bytes to transmit.
    pub fn seal(&mut self) -> usize {
        let count = self.filled;
        if count < self.capacity && count > 0 {
            self.buffer.memory().copy_within(
                self.payload_base(self.capacity),
                self.payload_base(count),
                count * P::WIRE_LEN,
            );
        }
        self.buffer.store_u64(0, (count as u64).to_le());
        byte_size_for(count, P::WIRE_LEN)
    }

    #[inline]
    fn payload_base(&self, keys: usize) -> usize {
        RECORD_HEADER_SIZE + keys * KEY_SIZE
    }

    /// Records in the sealed batch, never more than `capacity`. Batches
    /// that came off the wire go through `checked_count` first.
    #[inline]
    pub fn count(&self) -> usize {
        (self.header_count() as usize).min(self.capacity)
    }

    #[inline]
    fn header_count(&self) -> u64 {
        u64::from_le(self.buffer.load_u64(0))
    }

    /// Count of a batch `peer` delivered; a header claiming more records
    /// than the batch holds is a protocol violation.
    pub fn checked_count(&self, peer: usize) -> TransResult<usize> {
        let count = self.header_count();
        if count > self.capacity as u64 {
            return Err(TransError::Protocol {
                peer,
                reason: format!(
                    "batch header claims {} records, the buffer holds {}",
                    count, self.capacity
                ),
            });
        }
        Ok(count as usize)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    #[inline]
    pub fn wire_len(&self) -> usize {
        byte_size_for(self.count(), P::WIRE_LEN)
    }

    pub fn key(&self, i: usize) -> u64 {
        assert!(i < self.count());
        u64::decode(&self.buffer.to_vec(RECORD_HEADER_SIZE + i * KEY_SIZE, KEY_SIZE))
    }

    pub fn payload(&self, i: usize) -> P {
        let count = self.count();
        assert!(i < count);
        let bytes = self
            .buffer
            .to_vec(self.payload_base(count) + i * P::WIRE_LEN, P::WIRE_LEN);
        P::decode(&bytes)
    }

    /// Decode the sealed batch in one pass.
    pub fn records(&self) -> Vec<(u64, P)> {
        let count = self.count();
        let bytes = self.buffer.to_vec(0, byte_size_for(count, P::WIRE_LEN));
        let (keys, payloads) = bytes[RECORD_HEADER_SIZE..].split_at(count * KEY_SIZE);
        keys.chunks(KEY_SIZE)
            .zip(payloads.chunks(P::WIRE_LEN.max(1)))
            .map(|(k, p)| (u64::decode(k), P::decode(p)))
            .collect()
    }

    pub fn keys(&self) -> Vec<u64> {
        let count = self.count();
        self.buffer
            .to_vec(RECORD_HEADER_SIZE, count * KEY_SIZE)
            .chunks(KEY_SIZE)
            .map(u64::decode)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::payload::TuplePayload;
    use crate::rdma::loopback::LoopbackFabric;
    use crate::rdma::Transport;

    fn domain() -> Arc<dyn Domain> {
        LoopbackFabric::new().open_domain("lo").unwrap()
    }

    #[test]
    fn capacity_formula() {
        assert_eq!(capacity_for(8 + 10 * 24, 16), 10);
        assert_eq!(capacity_for(8 + 10 * 24 + 23, 16), 10);
        assert_eq!(capacity_for(7, 16), 0);
        assert_eq!(byte_size_for(10, 16), 248);
    }

    #[test]
    fn full_batch_keeps_layout() {
        let mut batch = StructuredRecordBuffer::<u64>::allocate(&domain(), 3).unwrap();
        batch.clear();
        assert!(!batch.push(1, &10));
        assert!(!batch.push(2, &20));
        assert!(batch.push(3, &30));
        assert_eq!(batch.seal(), 8 + 3 * 16);
        assert_eq!(batch.records(), vec![(1, 10), (2, 20), (3, 30)]);
    }

    #[test]
    fn partial_batch_is_compacted() {
        let mut batch = StructuredRecordBuffer::<TuplePayload>::allocate(&domain(), 8).unwrap();
        batch.clear();
        for key in 0..3u64 {
            batch.push(
                key,
                &TuplePayload {
                    tuple_id: key * 100,
                    timestamp: key,
                },
            );
        }
        let wire = batch.seal();
        assert_eq!(wire, 8 + 3 * 8 + 3 * 16);

        // payload 0 directly behind key 2
        let raw = batch.buffer().to_vec(0, wire);
        assert_eq!(u64::decode(&raw[..8]), 3);
        assert_eq!(u64::decode(&raw[8 + 2 * 8..8 + 3 * 8]), 2);
        assert_eq!(
            TuplePayload::decode(&raw[8 + 3 * 8..]),
            TuplePayload {
                tuple_id: 0,
                timestamp: 0
            }
        );
        assert_eq!(batch.payload(2).tuple_id, 200);
        assert_eq!(batch.keys(), vec![0, 1, 2]);
    }

    #[test]
    fn oversized_header_is_rejected() {
        let mut batch = StructuredRecordBuffer::<u64>::allocate(&domain(), 4).unwrap();
        batch.clear();
        batch.push(9, &90);
        batch.seal();
        assert_eq!(batch.checked_count(1).unwrap(), 1);

        batch.buffer().write(0, &1000u64.to_le_bytes());
        assert!(matches!(
            batch.checked_count(3),
            Err(TransError::Protocol { peer: 3, .. })
        ));
    }

    #[test]
    fn batches_repack_in_place() {
        let mut batch = StructuredRecordBuffer::<TuplePayload>::allocate(&domain(), 16).unwrap();
        for round in 0..3u64 {
            batch.clear();
            for key in 0..16u64 {
                batch.push(
                    key,
                    &TuplePayload {
                        tuple_id: round * 1000 + key,
                        timestamp: round,
                    },
                );
            }
            batch.seal();
            let records = batch.records();
            assert_eq!(records.len(), 16);
            assert!(records
                .iter()
                .all(|(k, p)| p.tuple_id == round * 1000 + k && p.timestamp == round));
        }
    }

    #[test]
    fn empty_batch_is_header_only() {
        let mut batch = StructuredRecordBuffer::<u32>::allocate(&domain(), 4).unwrap();
        batch.clear();
        assert_eq!(batch.seal(), RECORD_HEADER_SIZE);
        assert!(batch.is_empty());
        assert!(batch.records().is_empty());
    }
}
