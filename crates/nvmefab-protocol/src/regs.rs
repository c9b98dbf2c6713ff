//! Register map of the FPGA control block and the engine's address spaces.
//!
//! The control block exposes one sub-bank of 32-bit registers per NVMe drive
//! plus a broadcast bank; offsets below are within a sub-bank. All accesses
//! are 32-bit aligned.

/// Identity and version word.
pub const REG_IDENT: u32 = 0x000;
/// Control register; see the `CONTROL_*` bits.
pub const REG_CONTROL: u32 = 0x004;
/// Hardware status; see the `STATUS_*` bits.
pub const REG_STATUS: u32 = 0x008;
/// Device capacity in blocks.
pub const REG_TOTAL_BLOCKS: u32 = 0x00C;

/// Capture start block.
pub const REG_DATA_CHUNK_START: u32 = 0x040;
/// Capture length in blocks.
pub const REG_DATA_CHUNK_SIZE: u32 = 0x044;
/// Write-engine error bits; non-zero after capture is a hard failure.
pub const REG_WRITE_ERROR: u32 = 0x048;
/// Blocks processed by the write engine.
pub const REG_WRITE_NUM_BLOCKS: u32 = 0x04C;
/// Write-engine run time in microseconds.
pub const REG_WRITE_TIME: u32 = 0x050;
/// Peak per-block write latency in microseconds.
pub const REG_WRITE_PEAK_LATENCY: u32 = 0x054;

/// Read-engine control; see `READ_CONTROL_START`.
pub const REG_READ_CONTROL: u32 = 0x080;
/// Read start block.
pub const REG_READ_BLOCK: u32 = 0x088;
/// Read length in blocks.
pub const REG_READ_NUM_BLOCKS: u32 = 0x08C;

/// Control bit 0: reset the engine and the downstream link.
pub const CONTROL_RESET: u32 = 1 << 0;
/// Control bit 2: start the capture (write) engine.
pub const CONTROL_CAPTURE_START: u32 = 1 << 2;

/// Status bit 0: reset in progress.
pub const STATUS_RESET_BUSY: u32 = 1 << 0;
/// Status bit 1: hardware configuration complete.
pub const STATUS_CONFIGURED: u32 = 1 << 1;

/// Read-control bit 0: start the read engine.
pub const READ_CONTROL_START: u32 = 1 << 0;

/// Sub-bank base offsets, indexed by drive selection: drive 0, drive 1, and
/// the broadcast bank that mirrors writes to both drives in hardware.
pub const DRIVE0_REG_BASE: u32 = 0x100;
pub const DRIVE1_REG_BASE: u32 = 0x200;
pub const BROADCAST_REG_BASE: u32 = 0x000;

/// OR'd into a PCIe address to route the transaction to drive 1 through the
/// FPGA switch.
pub const DRIVE1_ADDR_BIT: u32 = 0x1000_0000;

// NVMe controller registers, accessed over the PCIe transport.
pub const NVME_REG_INTMS: u32 = 0x0C;
pub const NVME_REG_CC: u32 = 0x14;
pub const NVME_REG_CSTS: u32 = 0x1C;
pub const NVME_REG_AQA: u32 = 0x24;
pub const NVME_REG_ASQ: u32 = 0x28;
pub const NVME_REG_ACQ: u32 = 0x30;

/// CC value that stops the controller, preserving the queue-entry sizes.
pub const NVME_CC_STOP: u32 = 0x0046_0000;
/// CC value that starts the controller.
pub const NVME_CC_START: u32 = 0x0046_0001;

// Queue doorbells within the NVMe register space.
pub const DOORBELL_ADMIN_SQ_TAIL: u32 = 0x1000;
pub const DOORBELL_ADMIN_CQ_HEAD: u32 = 0x1004;
pub const DOORBELL_IO_SQ_TAIL: u32 = 0x1008;
pub const DOORBELL_IO_CQ_HEAD: u32 = 0x100C;

// Host-emulated memory, as seen from the NVMe. The low 24 bits select within
// a region; `(address & REGION_MASK)` selects the region.
pub const REGION_MASK: u32 = 0x00FF_0000;
pub const REGION_ADMIN_SQ: u32 = 0x0000_0000;
pub const REGION_IO_SQ: u32 = 0x0001_0000;
pub const REGION_ADMIN_CQ: u32 = 0x0010_0000;
pub const REGION_IO_CQ: u32 = 0x0011_0000;
pub const REGION_BLOCK_BUFFER: u32 = 0x0080_0000;
/// Discard/validate sink for block data (coarser 0x00F0_0000 match).
pub const REGION_DISCARD: u32 = 0x00E0_0000;
/// Streaming sink routed to the per-drive FIFOs (coarser match).
pub const REGION_STREAM: u32 = 0x00F0_0000;

/// Emulated region targeted by an NVMe bus-master request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    AdminSq,
    IoSq,
    AdminCq,
    IoCq,
    BlockBuffer,
    Discard,
    Stream,
}

/// Classify a bus-master address by its region prefix.
pub fn region_of(address: u64) -> Option<Region> {
    // The two streaming sinks match on the wider 0x00F0_0000 prefix.
    match address as u32 & 0x00F0_0000 {
        REGION_DISCARD => return Some(Region::Discard),
        REGION_STREAM => return Some(Region::Stream),
        _ => {}
    }
    match address as u32 & REGION_MASK {
        REGION_ADMIN_SQ => Some(Region::AdminSq),
        REGION_IO_SQ => Some(Region::IoSq),
        REGION_ADMIN_CQ => Some(Region::AdminCq),
        REGION_IO_CQ => Some(Region::IoCq),
        REGION_BLOCK_BUFFER => Some(Region::BlockBuffer),
        _ => None,
    }
}

// Host-space base addresses programmed into the NVMe. The 0x0100_0000 prefix
// marks emulated host memory served by the dispatcher; 0x0200_0000 routes
// through the FPGA queue engine instead.
pub const HOST_MEM_BASE: u32 = 0x0100_0000;
pub const QUEUE_ENGINE_BASE: u32 = 0x0200_0000;

/// Admin SQ base as programmed into ASQ (direct mode).
pub const ADMIN_SQ_BASE_DIRECT: u32 = HOST_MEM_BASE | REGION_ADMIN_SQ;
/// Admin CQ base as programmed into ACQ (direct mode).
pub const ADMIN_CQ_BASE_DIRECT: u32 = HOST_MEM_BASE | REGION_ADMIN_CQ;
/// Admin SQ/CQ bases when the FPGA queue engine fronts the queues.
pub const ADMIN_SQ_BASE_ENGINE: u32 = QUEUE_ENGINE_BASE | REGION_ADMIN_SQ;
pub const ADMIN_CQ_BASE_ENGINE: u32 = QUEUE_ENGINE_BASE | REGION_ADMIN_CQ;

/// PRP target for single-block I/O tests (the emulated block buffer).
pub const BLOCK_BUFFER_PRP: u32 = HOST_MEM_BASE | REGION_BLOCK_BUFFER;
/// PRP target for admin data transfers (identify, log pages, features).
pub const ADMIN_DATA_PRP: u32 = HOST_MEM_BASE | 0x00E0_0000;

/// Address of the FPGA queue-engine slot for `queue`, to be OR'd with the
/// drive-routing bits. Writing a 16-word command here submits it.
pub fn queue_engine_slot(queue: u32) -> u32 {
    QUEUE_ENGINE_BASE | (queue << 16)
}
