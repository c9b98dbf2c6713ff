//! Host-side control library for the nvmefab FPGA NVMe engine.
//!
//! The engine sits on a KCU105-class board between the host and one or two
//! NVMe SSDs. The host reaches it through a kernel character device exposing
//! a memory-mapped register window and one bidirectional framed DMA stream,
//! on which four conversations are multiplexed: host-originated
//! register/command packets, the FPGA's replies, NVMe bus-master requests
//! against emulated host memory, and the host's replies serving them.
//!
//! The pieces, bottom up:
//! - [`fifo::ByteFifo`]: reassembles 4 KiB blocks from variable-sized
//!   streaming-write packets
//! - [`sync::Semaphore`]: reply correlation and completion signalling
//! - [`device`]: the [`device::DmaEndpoint`] seam and the production
//!   [`device::BfpgaDevice`] over `/dev/bfpga0`
//! - [`regbus`]: the [`regbus::RegisterBus`] seam over the mmap'd register
//!   window, with per-drive sub-banks
//! - [`transport::NvmeTransport`]: synchronous PCIe config/memory access,
//!   NVMe register access, submission queues and doorbells, reset and
//!   controller bring-up, and the dispatcher thread that services inbound
//!   frames
//! - [`stream`]: the capture and read streaming controllers and the
//!   [`stream::StreamSink`] capability the dispatcher drives
//!
//! Two threads share a transport: the caller's (PCIe transactions, register
//! writes, streaming control) and the dispatcher (owns the receive side of
//! the DMA stream exclusively). See `NvmeTransport` for the discipline.

pub mod device;
pub mod error;
pub mod fifo;
pub mod hostmem;
pub mod queue;
pub mod regbus;
pub mod stream;
pub mod sync;
pub mod transport;

mod dispatch;

pub use device::{BfpgaDevice, DmaEndpoint};
pub use error::{Error, Result};
pub use regbus::{DriveSel, RegisterBus};
pub use stream::{
    validate_block, CaptureParams, CaptureStats, ReadParams, ReadStats, StreamSink,
};
pub use transport::{NvmeTransport, TransportConfig, TransportStats};
