use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Tuning knobs for [`PhysicalMemory`].
#[derive(Clone, Copy, Debug)]
pub struct PhysicalMemoryOptions {
    /// Allocation granularity in bytes. Must be a power of two.
    pub chunk_size: usize,
}

impl Default for PhysicalMemoryOptions {
    fn default() -> Self {
        Self { chunk_size: 64 * 1024 }
    }
}

/// Flat guest RAM, allocated lazily in fixed-size chunks.
///
/// Reads of never-written chunks return zeroes without allocating, so a guest
/// with a large address space only costs what it actually touches. Accessors
/// take `&self`; interior mutability keeps the type shareable between the CPU
/// bus and DMA-style device paths.
///
/// Unaligned multi-byte accesses are equivalent to byte loops; all typed
/// accessors are little-endian.
pub struct PhysicalMemory {
    size: u64,
    chunk_size: usize,
    chunks: Mutex<Vec<Option<Box<[u8]>>>>,
    allocated: AtomicUsize,
}

impl std::fmt::Debug for PhysicalMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalMemory")
            .field("size", &self.size)
            .field("chunk_size", &self.chunk_size)
            .field("allocated_chunks", &self.allocated_chunks())
            .finish()
    }
}

impl PhysicalMemory {
    pub fn new(size: u64) -> Result<Self, super::MemoryBusError> {
        Self::with_options(size, PhysicalMemoryOptions::default())
    }

    pub fn with_options(
        size: u64,
        options: PhysicalMemoryOptions,
    ) -> Result<Self, super::MemoryBusError> {
        if size == 0 || !options.chunk_size.is_power_of_two() {
            return Err(super::MemoryBusError::InvalidRange {
                start: 0,
                end: size,
            });
        }
        let chunk_count = size.div_ceil(options.chunk_size as u64);
        let chunk_count = usize::try_from(chunk_count)
            .map_err(|_| super::MemoryBusError::OutOfMemory { requested: size as usize })?;
        let mut chunks = Vec::new();
        chunks
            .try_reserve_exact(chunk_count)
            .map_err(|_| super::MemoryBusError::OutOfMemory { requested: chunk_count })?;
        chunks.resize_with(chunk_count, || None);
        Ok(Self {
            size,
            chunk_size: options.chunk_size,
            chunks: Mutex::new(chunks),
            allocated: AtomicUsize::new(0),
        })
    }

    /// Total guest-visible size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of chunks that have been materialized by writes.
    pub fn allocated_chunks(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    fn split(&self, addr: u64) -> (usize, usize) {
        let chunk = (addr / self.chunk_size as u64) as usize;
        let offset = (addr % self.chunk_size as u64) as usize;
        (chunk, offset)
    }

    pub fn read_u8(&self, addr: u64) -> u8 {
        if addr >= self.size {
            return 0;
        }
        let (chunk, offset) = self.split(addr);
        let chunks = self.chunks.lock().unwrap();
        match &chunks[chunk] {
            Some(data) => data[offset],
            None => 0,
        }
    }

    pub fn write_u8(&self, addr: u64, value: u8) {
        if addr >= self.size {
            return;
        }
        let (chunk, offset) = self.split(addr);
        let mut chunks = self.chunks.lock().unwrap();
        let data = chunks[chunk].get_or_insert_with(|| {
            self.allocated.fetch_add(1, Ordering::Relaxed);
            vec![0u8; self.chunk_size].into_boxed_slice()
        });
        data[offset] = value;
    }

    pub fn read_bytes(&self, addr: u64, buf: &mut [u8]) {
        let mut pos = addr;
        let mut remaining = buf;
        let chunks = self.chunks.lock().unwrap();
        while !remaining.is_empty() {
            if pos >= self.size {
                remaining.fill(0);
                break;
            }
            let (chunk, offset) = self.split(pos);
            let in_chunk = (self.chunk_size - offset)
                .min(remaining.len())
                .min((self.size - pos) as usize);
            let (head, tail) = remaining.split_at_mut(in_chunk);
            match &chunks[chunk] {
                Some(data) => head.copy_from_slice(&data[offset..offset + in_chunk]),
                None => head.fill(0),
            }
            remaining = tail;
            pos += in_chunk as u64;
        }
    }

    pub fn write_bytes(&self, addr: u64, buf: &[u8]) {
        let mut pos = addr;
        let mut remaining = buf;
        let mut chunks = self.chunks.lock().unwrap();
        while !remaining.is_empty() {
            if pos >= self.size {
                break;
            }
            let (chunk, offset) = self.split(pos);
            let in_chunk = (self.chunk_size - offset)
                .min(remaining.len())
                .min((self.size - pos) as usize);
            let data = chunks[chunk].get_or_insert_with(|| {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.chunk_size].into_boxed_slice()
            });
            data[offset..offset + in_chunk].copy_from_slice(&remaining[..in_chunk]);
            remaining = &remaining[in_chunk..];
            pos += in_chunk as u64;
        }
    }

    pub fn read_u16(&self, addr: u64) -> u16 {
        let mut buf = [0u8; 2];
        self.read_bytes(addr, &mut buf);
        u16::from_le_bytes(buf)
    }

    pub fn read_u32(&self, addr: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.read_bytes(addr, &mut buf);
        u32::from_le_bytes(buf)
    }

    pub fn read_u64(&self, addr: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.read_bytes(addr, &mut buf);
        u64::from_le_bytes(buf)
    }

    pub fn write_u16(&self, addr: u64, value: u16) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    pub fn write_u32(&self, addr: u64, value: u32) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    pub fn write_u64(&self, addr: u64, value: u64) {
        self.write_bytes(addr, &value.to_le_bytes());
    }
}
