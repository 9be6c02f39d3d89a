//! Guest physical memory: a sparse chunked byte store plus the address router
//! that layers MMIO windows, ROM shadows and open-bus holes on top of it.

mod bus;
mod phys;

pub use bus::{MemoryBus, MmioHandler, WriteObserver};
pub use phys::{PhysicalMemory, PhysicalMemoryOptions};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MemoryBusError {
    #[error("invalid range {start:#x}..{end:#x}")]
    InvalidRange { start: u64, end: u64 },
    #[error("mapping {start:#x}..{end:#x} overlaps an existing mapping")]
    Overlap { start: u64, end: u64 },
    #[error("allocation of {requested} bytes failed")]
    OutOfMemory { requested: usize },
}
