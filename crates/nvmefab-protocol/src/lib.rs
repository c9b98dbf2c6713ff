#![forbid(unsafe_code)]

//! Wire formats shared between the host and the nvmefab FPGA NVMe engine.
//!
//! The FPGA multiplexes four conversations over one bidirectional DMA stream:
//! host-originated register/command packets, the FPGA's replies to them,
//! NVMe-originated bus-master requests, and the host's replies carrying
//! emulated queue/data memory. Everything on that stream is one of two frame
//! shapes, defined in [`frame`].
//!
//! This crate is the compatibility contract with the FPGA bitstream and must
//! stay bit-exact:
//! - [`frame`]: the framed packet codec (explicit shift-and-mask on
//!   little-endian 32-bit words, independent of host byte order)
//! - [`regs`]: the FPGA control-block register map and the address-space
//!   constants (region prefixes, doorbells, emulated-memory bases)
//! - [`command`]: NVMe submission-entry construction and completion-entry
//!   parsing (only the fields the host fills/inspects)

pub mod command;
pub mod frame;
pub mod regs;

pub use frame::{
    decode_frame, Frame, FrameDecodeError, FrameEncodeError, ReplyFrame, RequestFrame,
    PCIE_MAX_PAYLOAD_WORDS, REPLY_HEADER_LEN, REQUEST_HEADER_LEN,
};

/// NVMe block size used throughout the engine, in bytes. One block is eight
/// 512-byte LBAs.
pub const BLOCK_SIZE: usize = 4096;

/// Words per block.
pub const BLOCK_WORDS: usize = BLOCK_SIZE / 4;
