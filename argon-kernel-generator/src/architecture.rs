/// GPU architecture generation.
///
/// Determines the shape of the register file and which memory
/// message widths the hardware can issue.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Architecture {
    /// Integrated graphics baseline.
    Gen9,
    /// Low-power Xe (integrated and entry discrete).
    XeLp,
    /// High-performance Xe data center.
    XeHp,
    /// High-performance Xe graphics (discrete consumer).
    XeHpg,
    /// Xe HPC (data center max). Doubles the register width.
    XeHpc,
}

impl Architecture {
    /// Size of one general register in bytes.
    pub fn grf_size(&self) -> u32 {
        match self {
            Architecture::XeHpc => 64,
            _ => 32,
        }
    }

    /// Number of registers available to one thread.
    pub fn max_regs(&self, large_grf: bool) -> u32 {
        match self {
            Architecture::Gen9 | Architecture::XeLp => 128,
            _ if large_grf => 256,
            _ => 128,
        }
    }

    pub fn supports_simd(&self, simd: u32) -> bool {
        match self {
            Architecture::XeHpc => matches!(simd, 16 | 32),
            _ => matches!(simd, 8 | 16),
        }
    }

    /// Largest contiguous block message in bytes.
    pub(crate) fn max_block_message_bytes(&self) -> u32 {
        4 * self.grf_size()
    }

    /// Largest number of lanes in a scattered (strided) message.
    pub(crate) fn max_scattered_elems(&self) -> u32 {
        match self {
            Architecture::XeHpc => 32,
            _ => 16,
        }
    }

    /// Widest register store the instruction set can encode.
    pub(crate) fn max_store_bytes(&self) -> u32 {
        2 * self.grf_size()
    }
}
