use std::collections::HashSet;

/// Guest CPU generation: plain 32-bit x86 or x86-64 (long-mode capable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Architecture {
    X86,
    #[default]
    X86_64,
}

/// How the boot medium is interpreted at POST.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootKind {
    /// Raw 512-byte boot sector with the 0x55AA signature.
    #[default]
    BootSignature,
    /// ISO 9660 with an El Torito boot catalog.
    Iso,
}

/// Address window watched for guest writes.
#[derive(Debug, Clone, Default)]
pub struct WatchAccess {
    pub start: u64,
    pub end: u64,
    pub reads: bool,
    pub writes: bool,
    /// Stop reporting after this many hits (0 = unlimited).
    pub limit: u64,
    /// Writes issued from these RIP ranges are not reported.
    pub exclude_ip_ranges: Vec<(u64, u64)>,
}

/// Debugging hooks sampled by the run loop at instruction boundaries.
#[derive(Debug, Clone, Default)]
pub struct DebugConfig {
    pub count_instructions: bool,
    pub ip_sample_every: Option<u64>,
    pub stop_after_insns: Option<u64>,
    pub stop_after_secs: Option<u64>,
    pub trace_ip: HashSet<u64>,
    pub stop_ip: HashSet<u64>,
    pub trace_cflow_to: HashSet<u64>,
    pub stop_cflow_to: HashSet<u64>,
    pub stop_on_rsp_below: Option<u64>,
    pub zero_opcode_loop_limit: Option<u32>,
    pub dump_page_fault_context: bool,
    pub watch_access: Option<WatchAccess>,
}

#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Installed guest RAM in bytes.
    pub memory_size: u64,
    /// Upper bound accepted for `memory_size` at construction.
    pub max_memory_size: u64,
    pub architecture: Architecture,
    pub boot: BootKind,
    /// Total instruction budget across the whole run; `None` = unlimited.
    pub max_instructions: Option<u64>,
    pub enable_apic: bool,
    pub enable_pae: bool,
    /// Display scaling hint, forwarded to the screen sink untouched.
    pub pixel_size: u32,
    /// Display refresh hint, forwarded to the screen sink untouched.
    pub frame_rate: u32,
    pub debug: DebugConfig,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            memory_size: 16 * 1024 * 1024,
            max_memory_size: 4 * 1024 * 1024 * 1024,
            architecture: Architecture::default(),
            boot: BootKind::default(),
            max_instructions: None,
            enable_apic: false,
            enable_pae: false,
            pixel_size: 1,
            frame_rate: 30,
            debug: DebugConfig::default(),
        }
    }
}

impl MachineConfig {
    pub fn with_memory(memory_size: u64) -> Self {
        Self { memory_size, ..Self::default() }
    }

    pub(crate) fn validate(&self) -> Result<(), MachineError> {
        if self.memory_size < 1024 * 1024 {
            return Err(MachineError::Config(
                "memory_size must be at least 1 MiB".into(),
            ));
        }
        if self.memory_size > self.max_memory_size {
            return Err(MachineError::Config(format!(
                "memory_size {:#x} exceeds max_memory_size {:#x}",
                self.memory_size, self.max_memory_size
            )));
        }
        if self.pixel_size == 0 || self.frame_rate == 0 {
            return Err(MachineError::Config(
                "pixel_size and frame_rate must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Host-side construction and boot-medium errors. Never produced during
/// execution; a running guest only observes architectural faults.
#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("memory setup failed: {0}")]
    Memory(#[from] machina_mem::MemoryBusError),
    #[error("boot medium: {0}")]
    Disk(#[from] machina_storage::DiskError),
    #[error("ISO image: {0}")]
    Iso(#[from] machina_storage::IsoError),
    #[error("no boot medium attached")]
    NoBootMedium,
}
