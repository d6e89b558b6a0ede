use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;

use byte_struct::*;
use libc::{free, memalign};

use crate::rdma::{Domain, MemoryRegistration};
use crate::{TransError, TransResult, REGION_ALIGNMENT};

/// Page-aligned, zero-initialised memory that local code and the fabric
/// both write into. All access goes through raw copies or word atomics,
/// never through Rust references into the bytes, because a remote peer
/// may be writing at the same time.
pub struct RegionMemory {
    inner: NonNull<u8>,
    len: usize,
}

unsafe impl Send for RegionMemory {}
unsafe impl Sync for RegionMemory {}

impl RegionMemory {
    pub fn allocate(len: usize) -> TransResult<Arc<Self>> {
        let demand = len.max(crate::FLAG_CELL_SIZE);
        let ptr = unsafe { memalign(REGION_ALIGNMENT, demand) } as *mut u8;
        let inner = NonNull::new(ptr).ok_or_else(|| TransError::Resource {
            bytes: len,
            reason: format!("memalign failed: {}", errno::errno()),
        })?;
        unsafe { std::ptr::write_bytes(inner.as_ptr(), 0, demand) };
        Ok(Arc::new(Self { inner, len }))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.inner.as_ptr()
    }

    #[inline]
    pub fn address(&self) -> u64 {
        self.inner.as_ptr() as u64
    }

    #[inline]
    pub fn contains(&self, offset: usize, len: usize) -> bool {
        offset.checked_add(len).map_or(false, |end| end <= self.len)
    }

    pub fn read(&self, offset: usize, out: &mut [u8]) {
        assert!(self.contains(offset, out.len()));
        fence(Ordering::Acquire);
        unsafe {
            std::ptr::copy_nonoverlapping(self.as_ptr().add(offset), out.as_mut_ptr(), out.len());
        }
    }

    pub fn write(&self, offset: usize, data: &[u8]) {
        assert!(self.contains(offset, data.len()));
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.as_ptr().add(offset), data.len());
        }
        fence(Ordering::Release);
    }

    /// memmove inside the region
    pub fn copy_within(&self, src: usize, dst: usize, len: usize) {
        assert!(self.contains(src, len) && self.contains(dst, len));
        unsafe { std::ptr::copy(self.as_ptr().add(src), self.as_ptr().add(dst), len) };
    }

    #[inline]
    fn cell(&self, offset: usize) -> &AtomicU64 {
        assert!(self.contains(offset, 8) && offset % 8 == 0);
        unsafe { &*(self.as_ptr().add(offset) as *const AtomicU64) }
    }

    #[inline]
    pub fn load_u64(&self, offset: usize) -> u64 {
        self.cell(offset).load(Ordering::Acquire)
    }

    #[inline]
    pub fn store_u64(&self, offset: usize, value: u64) {
        self.cell(offset).store(value, Ordering::Release)
    }

    #[inline]
    pub fn compare_swap_u64(&self, offset: usize, compare: u64, swap: u64) -> u64 {
        match self
            .cell(offset)
            .compare_exchange(compare, swap, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(prev) => prev,
            Err(prev) => prev,
        }
    }

    /// Copy `len` bytes out of `src` the way a NIC lands a transfer: an
    /// aligned 8-byte transfer is a single store, anything else a plain copy
    /// fenced on both sides.
    pub(crate) fn copy_from(&self, dst: usize, src: &RegionMemory, src_off: usize, len: usize) {
        assert!(self.contains(dst, len) && src.contains(src_off, len));
        if len == 8 && dst % 8 == 0 && src_off % 8 == 0 {
            self.store_u64(dst, src.load_u64(src_off));
            return;
        }
        fence(Ordering::Acquire);
        unsafe {
            std::ptr::copy(src.as_ptr().add(src_off), self.as_ptr().add(dst), len);
        }
        fence(Ordering::Release);
    }
}

impl Drop for RegionMemory {
    fn drop(&mut self) {
        unsafe {
            free(self.inner.as_ptr() as _);
        }
    }
}

/// Memory this process owns and has registered with a fabric domain.
/// Dropping it deregisters the region, which revokes every token exported
/// from it; in-flight local operations keep the memory itself alive.
pub struct RegisteredBuffer {
    memory: Arc<RegionMemory>,
    registration: MemoryRegistration,
}

impl RegisteredBuffer {
    pub fn allocate(domain: &Arc<dyn Domain>, len: usize) -> TransResult<Self> {
        let memory = RegionMemory::allocate(len)?;
        let registration = domain.register(&memory)?;
        Ok(Self {
            memory,
            registration,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    #[inline]
    pub fn memory(&self) -> &Arc<RegionMemory> {
        &self.memory
    }

    #[inline]
    pub fn address(&self) -> u64 {
        self.memory.address()
    }

    #[inline]
    pub fn local_key(&self) -> u32 {
        self.registration.local_key
    }

    #[inline]
    pub fn remote_key(&self) -> u32 {
        self.registration.remote_key
    }

    /// Mint the capability a peer needs for one-sided access to this buffer.
    pub fn export_token(&self) -> RemoteRegionToken {
        RemoteRegionToken {
            address: self.address(),
            size: self.len() as u64,
            local_key: self.local_key(),
            remote_key: self.remote_key(),
        }
    }

    #[inline]
    pub fn read(&self, offset: usize, out: &mut [u8]) {
        self.memory.read(offset, out)
    }

    #[inline]
    pub fn write(&self, offset: usize, data: &[u8]) {
        self.memory.write(offset, data)
    }

    #[inline]
    pub fn load_u64(&self, offset: usize) -> u64 {
        self.memory.load_u64(offset)
    }

    #[inline]
    pub fn store_u64(&self, offset: usize, value: u64) {
        self.memory.store_u64(offset, value)
    }

    pub fn to_vec(&self, offset: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.read(offset, &mut out);
        out
    }
}

#[derive(ByteStruct, Clone, Copy, Debug, PartialEq, Eq)]
#[byte_struct_le]
struct TokenWire {
    address: u64,
    size: u64,
    local_key: u32,
    remote_key: u32,
}

/// Capability for one-sided operations on a peer's `RegisteredBuffer`.
/// Immutable once received.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteRegionToken {
    address: u64,
    size: u64,
    local_key: u32,
    remote_key: u32,
}

impl RemoteRegionToken {
    pub const WIRE_LEN: usize = TokenWire::BYTE_LEN;

    #[inline]
    pub fn address(&self) -> u64 {
        self.address
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size as usize
    }

    #[inline]
    pub fn local_key(&self) -> u32 {
        self.local_key
    }

    #[inline]
    pub fn remote_key(&self) -> u32 {
        self.remote_key
    }

    #[inline]
    pub fn contains(&self, offset: usize, len: usize) -> bool {
        offset
            .checked_add(len)
            .map_or(false, |end| end as u64 <= self.size)
    }

    pub fn encode(&self, out: &mut [u8]) {
        TokenWire {
            address: self.address,
            size: self.size,
            local_key: self.local_key,
            remote_key: self.remote_key,
        }
        .write_bytes(&mut out[..Self::WIRE_LEN]);
    }

    /// Import a token a peer sent us.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::WIRE_LEN {
            return None;
        }
        let wire = TokenWire::read_bytes(&bytes[..Self::WIRE_LEN]);
        Some(Self {
            address: wire.address,
            size: wire.size,
            local_key: wire.local_key,
            remote_key: wire.remote_key,
        })
    }

    /// Tokens back to back in one blob.
    pub fn encode_all(tokens: &[RemoteRegionToken]) -> Vec<u8> {
        let mut out = vec![0u8; tokens.len() * Self::WIRE_LEN];
        for (token, chunk) in tokens.iter().zip(out.chunks_mut(Self::WIRE_LEN)) {
            token.encode(chunk);
        }
        out
    }

    pub fn decode_all(bytes: &[u8], count: usize) -> Option<Vec<RemoteRegionToken>> {
        if bytes.len() < count * Self::WIRE_LEN {
            return None;
        }
        bytes
            .chunks(Self::WIRE_LEN)
            .take(count)
            .map(Self::decode)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_is_aligned_and_zeroed() {
        let mem = RegionMemory::allocate(100).unwrap();
        assert_eq!(mem.address() % REGION_ALIGNMENT as u64, 0);
        let mut out = [1u8; 100];
        mem.read(0, &mut out);
        assert!(out.iter().all(|b| *b == 0));
    }

    #[test]
    fn copy_within_handles_overlap() {
        let mem = RegionMemory::allocate(16).unwrap();
        mem.write(0, &[1, 2, 3, 4, 5, 6, 7, 8]);
        mem.copy_within(0, 2, 8);
        let mut out = [0u8; 10];
        mem.read(0, &mut out);
        assert_eq!(out, [1, 2, 1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn token_blob_keeps_order() {
        let tokens: Vec<_> = (0..3u64)
            .map(|i| RemoteRegionToken {
                address: 4096 * (i + 1),
                size: 64,
                local_key: i as u32,
                remote_key: 100 + i as u32,
            })
            .collect();
        let blob = RemoteRegionToken::encode_all(&tokens);
        assert_eq!(blob.len(), 3 * RemoteRegionToken::WIRE_LEN);
        assert_eq!(RemoteRegionToken::decode_all(&blob, 3).unwrap(), tokens);
        assert!(RemoteRegionToken::decode_all(&blob, 4).is_none());
    }

    #[test]
    fn token_bounds() {
        let token = RemoteRegionToken {
            address: 0,
            size: 16,
            local_key: 0,
            remote_key: 0,
        };
        assert!(token.contains(8, 8));
        assert!(!token.contains(9, 8));
        assert!(!token.contains(usize::MAX, 2));
    }
}
