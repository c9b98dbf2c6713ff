use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// DMA endpoint or device-node failure: open/mmap failed, or a stream
    /// read/write returned short or errored.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A frame violated the wire contract (truncated, oversized payload).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A PCIe reply carried a non-zero error code.
    #[error("pcie completion error {code}")]
    Pcie { code: u8 },

    /// An NVMe completion carried a non-zero status word.
    #[error("nvme completion status {status:#06x}")]
    NvmeStatus { status: u16 },

    /// A progress register or reply did not advance within the wall-clock
    /// budget.
    #[error("timed out waiting for {what} after {elapsed_ms} ms")]
    Timeout { what: &'static str, elapsed_ms: u64 },

    /// Read-path validation failed against the engine's test pattern.
    #[error(
        "data corruption in block {block} word {word}: expected {expected:#010x} got {actual:#010x}"
    )]
    DataCorruption {
        block: u64,
        word: usize,
        expected: u32,
        actual: u32,
    },

    /// Caller misuse: bad drive selection, odd ranges in dual-drive mode.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<nvmefab_protocol::FrameDecodeError> for Error {
    fn from(e: nvmefab_protocol::FrameDecodeError) -> Self {
        Error::Protocol(e.to_string())
    }
}

impl From<nvmefab_protocol::FrameEncodeError> for Error {
    fn from(e: nvmefab_protocol::FrameEncodeError) -> Self {
        Error::Protocol(e.to_string())
    }
}
