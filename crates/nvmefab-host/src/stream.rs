//! Streaming controllers: capture into the drives and read back out.
//!
//! Capture drives the FPGA's write engine: the test source generates
//! pattern blocks which the engine writes to the drives via PRPs, posting
//! completions internally. The host's job is to program the range, start the
//! engine, poll progress and collect stats.
//!
//! Read drives the read engine: the drives stream block data back as
//! bus-master writes with the 0xF00000 region prefix, which the dispatcher
//! hands to the installed [`StreamSink`]. The [`ReadAssembler`] sink routes
//! each packet into a per-drive FIFO and, whenever the next block's FIFO
//! holds a full 4 KiB, emits blocks in strictly alternating drive order
//! (drive 0 first), optionally validating against the engine's test pattern
//! and writing to a file sink.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use nvmefab_protocol::frame::RequestFrame;
use nvmefab_protocol::regs;
use nvmefab_protocol::{BLOCK_SIZE, BLOCK_WORDS};

use crate::error::{Error, Result};
use crate::fifo::ByteFifo;
use crate::hostmem::HostMemory;
use crate::regbus::DriveSel;
use crate::sync::Semaphore;
use crate::transport::NvmeTransport;

/// Capability the dispatcher drives for streaming-write packets (region
/// prefixes 0xE00000 and 0xF00000).
pub trait StreamSink: Send {
    fn on_stream_write(&mut self, frame: &RequestFrame) -> Result<()>;
}

/// Default sink: mirror packets into the block buffer, where the
/// single-drive block tests and admin data transfers expect them.
pub(crate) struct BlockBufferSink {
    mem: Arc<HostMemory>,
}

impl BlockBufferSink {
    pub(crate) fn new(mem: Arc<HostMemory>) -> BlockBufferSink {
        BlockBufferSink { mem }
    }
}

impl StreamSink for BlockBufferSink {
    fn on_stream_write(&mut self, frame: &RequestFrame) -> Result<()> {
        let word_off = (frame.address as u32 & 0xFFF) as usize / 4;
        self.mem.write_block(word_off, &frame.data);
        Ok(())
    }
}

/// Check one block against the engine's test pattern: word `w` of block `b`
/// holds `b * 1024 + w` (32-bit wrapping).
pub fn validate_block(block: u64, words: &[u32]) -> Result<()> {
    for (word, &actual) in words.iter().enumerate() {
        let expected = (block as u32)
            .wrapping_mul(BLOCK_WORDS as u32)
            .wrapping_add(word as u32);
        if actual != expected {
            return Err(Error::DataCorruption {
                block,
                word,
                expected,
                actual,
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct CaptureParams {
    pub start_block: u32,
    pub num_blocks: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct CaptureStats {
    /// OR of the drives' write-error registers; non-zero is a failure.
    pub error_status: u32,
    pub start_block: u32,
    pub blocks: u32,
    pub elapsed: Duration,
    pub mbytes_per_sec: f64,
    pub peak_latency_us: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ReadParams {
    pub start_block: u32,
    pub num_blocks: u32,
    /// Check each block against the engine's test pattern.
    pub validate: bool,
    /// Write the reassembled block stream to this file.
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadStats {
    pub blocks: u64,
    pub elapsed: Duration,
    pub mbytes_per_sec: f64,
}

/// Wall-clock budget for a streaming run: fixed slack plus the range's
/// transfer time at 4 GB/s.
fn stream_budget(num_blocks: u64) -> Duration {
    Duration::from_secs(10) + Duration::from_nanos(num_blocks * BLOCK_SIZE as u64 / 4)
}

/// Halve a block range for dual-drive runs, where each drive covers half.
fn per_drive_range(drive: DriveSel, start: u32, count: u32) -> Result<(u32, u32)> {
    if drive != DriveSel::Both {
        return Ok((start, count));
    }
    if start % 2 != 0 || count % 2 != 0 {
        return Err(Error::Config(
            "dual-drive streaming needs an even start block and block count".into(),
        ));
    }
    Ok((start / 2, count / 2))
}

impl NvmeTransport {
    /// Run the capture engine over `params`' block range and poll it to
    /// completion. Returns the collected stats; `error_status != 0` means
    /// the run failed even though polling completed.
    pub fn capture(&self, params: &CaptureParams) -> Result<CaptureStats> {
        let drive = self.drive();
        let (per_start, per_blocks) =
            per_drive_range(drive, params.start_block, params.num_blocks)?;

        self.write_storage_reg(regs::REG_DATA_CHUNK_START, per_start);
        self.write_storage_reg(regs::REG_DATA_CHUNK_SIZE, per_blocks);

        info!(
            start = params.start_block,
            blocks = params.num_blocks,
            ?drive,
            "capture start"
        );
        let started = Instant::now();
        self.write_storage_reg(regs::REG_CONTROL, regs::CONTROL_CAPTURE_START);

        let budget = stream_budget(params.num_blocks as u64);
        loop {
            let done = drive
                .each()
                .iter()
                .all(|&d| self.read_drive_reg(d, regs::REG_WRITE_NUM_BLOCKS) >= per_blocks);
            if done {
                break;
            }
            if started.elapsed() > budget {
                self.write_storage_reg(regs::REG_CONTROL, 0);
                return Err(Error::Timeout {
                    what: "capture progress",
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }
            debug!(
                blocks = self.read_drive_reg(drive.each()[0], regs::REG_WRITE_NUM_BLOCKS),
                "capture progress"
            );
            thread::sleep(Duration::from_millis(100));
        }
        let elapsed = started.elapsed();

        let mut error_status = 0u32;
        let mut time_us = 0u32;
        let mut peak_latency_us = 0u32;
        for &d in drive.each() {
            error_status |= self.read_drive_reg(d, regs::REG_WRITE_ERROR);
            time_us = time_us.max(self.read_drive_reg(d, regs::REG_WRITE_TIME));
            peak_latency_us = peak_latency_us.max(self.read_drive_reg(d, regs::REG_WRITE_PEAK_LATENCY));
        }
        self.write_storage_reg(regs::REG_CONTROL, 0);

        if error_status != 0 {
            warn!(error_status = %format_args!("{error_status:#010x}"), "capture failed");
        }
        let total_bytes = params.num_blocks as f64 * BLOCK_SIZE as f64;
        let mbytes_per_sec = if time_us > 0 {
            total_bytes / (time_us as f64 * 1e-6) / (1024.0 * 1024.0)
        } else {
            0.0
        };
        Ok(CaptureStats {
            error_status,
            start_block: params.start_block,
            blocks: params.num_blocks,
            elapsed,
            mbytes_per_sec,
            peak_latency_us,
        })
    }

    /// Run the read engine over `params`' block range, reassembling the
    /// per-drive streams into consecutive blocks.
    pub fn stream_read(&self, params: &ReadParams) -> Result<ReadStats> {
        let drive = self.drive();
        let (per_start, per_blocks) =
            per_drive_range(drive, params.start_block, params.num_blocks)?;

        let out = match &params.output {
            Some(path) => Some(BufWriter::new(File::create(path).map_err(|e| {
                Error::Transport(format!("create {}: {e}", path.display()))
            })?)),
            None => None,
        };

        let progress = Arc::new(ReadProgress::default());
        let assembler = ReadAssembler::new(
            drive == DriveSel::Both,
            params.start_block as u64,
            params.num_blocks as u64,
            params.validate,
            out,
            Arc::clone(&progress),
        );
        self.set_stream_sink(Box::new(assembler));

        self.write_storage_reg(regs::REG_READ_BLOCK, per_start);
        self.write_storage_reg(regs::REG_READ_NUM_BLOCKS, per_blocks);

        info!(
            start = params.start_block,
            blocks = params.num_blocks,
            ?drive,
            "read stream start"
        );
        let started = Instant::now();
        self.write_storage_reg(regs::REG_READ_CONTROL, regs::READ_CONTROL_START);

        let budget = stream_budget(params.num_blocks as u64);
        let finished = progress.done.wait_us(budget.as_micros() as u64);
        self.write_storage_reg(regs::REG_READ_CONTROL, 0);
        self.reset_stream_sink();

        if let Some(err) = progress.failure.lock().unwrap().take() {
            return Err(err);
        }
        if !finished {
            return Err(Error::Timeout {
                what: "read stream",
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }

        let elapsed = started.elapsed();
        let blocks = progress.blocks.load(Ordering::Relaxed);
        let secs = elapsed.as_secs_f64();
        let mbytes_per_sec = if secs > 0.0 {
            blocks as f64 * BLOCK_SIZE as f64 / secs / (1024.0 * 1024.0)
        } else {
            0.0
        };
        Ok(ReadStats {
            blocks,
            elapsed,
            mbytes_per_sec,
        })
    }
}

/// Progress shared between the assembler (running inside the dispatcher) and
/// the foreground waiting for the stream to finish.
#[derive(Default)]
struct ReadProgress {
    blocks: AtomicU64,
    failure: Mutex<Option<Error>>,
    done: Semaphore,
}

/// 256 blocks of slack per drive; one drive can run this far ahead of the
/// other before the stream is declared broken.
const STREAM_FIFO_BYTES: usize = 256 * BLOCK_SIZE + 1;

struct ReadAssembler {
    fifos: [ByteFifo; 2],
    dual: bool,
    validate: bool,
    out: Option<BufWriter<File>>,
    /// First block of the range, for pattern validation.
    first_block: u64,
    /// Blocks emitted so far; also the interleave cursor.
    emitted: u64,
    target: u64,
    failed: bool,
    block: Vec<u8>,
    progress: Arc<ReadProgress>,
}

impl ReadAssembler {
    fn new(
        dual: bool,
        first_block: u64,
        target: u64,
        validate: bool,
        out: Option<BufWriter<File>>,
        progress: Arc<ReadProgress>,
    ) -> ReadAssembler {
        ReadAssembler {
            fifos: [
                ByteFifo::new(STREAM_FIFO_BYTES),
                ByteFifo::new(STREAM_FIFO_BYTES),
            ],
            dual,
            validate,
            out,
            first_block,
            emitted: 0,
            target,
            failed: false,
            block: vec![0u8; BLOCK_SIZE],
            progress,
        }
    }

    /// Emit every block that is fully buffered, in strict drive order:
    /// drive 0, drive 1, drive 0 again (drive 0 only in single-drive mode).
    fn drain(&mut self) -> Result<()> {
        while self.emitted < self.target {
            let fifo = if self.dual {
                (self.emitted % 2) as usize
            } else {
                0
            };
            if self.fifos[fifo].read_available() < BLOCK_SIZE {
                break;
            }
            self.fifos[fifo].read(&mut self.block);

            let block_num = self.first_block + self.emitted;
            if self.validate {
                let words: Vec<u32> = self
                    .block
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
                    .collect();
                validate_block(block_num, &words)?;
            }
            if let Some(out) = &mut self.out {
                out.write_all(&self.block)
                    .map_err(|e| Error::Transport(format!("block sink write: {e}")))?;
            }

            self.emitted += 1;
            self.progress.blocks.store(self.emitted, Ordering::Relaxed);
            if self.emitted == self.target {
                if let Some(out) = &mut self.out {
                    out.flush()
                        .map_err(|e| Error::Transport(format!("block sink flush: {e}")))?;
                }
                debug!(blocks = self.emitted, "read stream complete");
                self.progress.done.post();
            }
        }
        Ok(())
    }

    fn fail(&mut self, err: Error) -> Error {
        self.failed = true;
        *self.progress.failure.lock().unwrap() = Some(err.clone());
        self.progress.done.post();
        err
    }
}

impl StreamSink for ReadAssembler {
    fn on_stream_write(&mut self, frame: &RequestFrame) -> Result<()> {
        if self.failed || self.emitted >= self.target {
            // Late packets after the range completed or the stream broke.
            return Ok(());
        }
        let fifo = if frame.address as u32 & regs::DRIVE1_ADDR_BIT != 0 {
            1
        } else {
            0
        };
        let mut bytes = Vec::with_capacity(frame.data.len() * 4);
        for &w in &frame.data {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        if !self.fifos[fifo].write(&bytes) {
            return Err(self.fail(Error::Protocol(format!("stream fifo {fifo} overflow"))));
        }
        self.drain().map_err(|e| self.fail(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvmefab_protocol::frame::REQ_MEM_WRITE;

    fn pattern_block(block: u64) -> Vec<u32> {
        (0..BLOCK_WORDS as u32)
            .map(|w| (block as u32).wrapping_mul(BLOCK_WORDS as u32).wrapping_add(w))
            .collect()
    }

    fn stream_frame(drive: usize, words: &[u32]) -> RequestFrame {
        RequestFrame {
            address: (regs::REGION_STREAM
                | if drive == 1 { regs::DRIVE1_ADDR_BIT } else { 0 }) as u64,
            num_words: words.len() as u16,
            request: REQ_MEM_WRITE,
            data: words.to_vec(),
            ..Default::default()
        }
    }

    fn feed_block(assembler: &mut ReadAssembler, drive: usize, words: &[u32]) {
        for chunk in words.chunks(32) {
            assembler
                .on_stream_write(&stream_frame(drive, chunk))
                .unwrap();
        }
    }

    #[test]
    fn validate_block_accepts_the_pattern() {
        assert_eq!(validate_block(3, &pattern_block(3)), Ok(()));
    }

    #[test]
    fn validate_block_pinpoints_the_mismatch() {
        let mut words = pattern_block(2);
        words[100] ^= 0x8000_0000;
        assert_eq!(
            validate_block(2, &words),
            Err(Error::DataCorruption {
                block: 2,
                word: 100,
                expected: 2 * 1024 + 100,
                actual: (2 * 1024 + 100) ^ 0x8000_0000,
            })
        );
    }

    #[test]
    fn single_drive_blocks_flow_through() {
        let progress = Arc::new(ReadProgress::default());
        let mut assembler =
            ReadAssembler::new(false, 0, 2, true, None, Arc::clone(&progress));

        feed_block(&mut assembler, 0, &pattern_block(0));
        assert_eq!(progress.blocks.load(Ordering::Relaxed), 1);
        assert!(!progress.done.try_take());

        feed_block(&mut assembler, 0, &pattern_block(1));
        assert_eq!(progress.blocks.load(Ordering::Relaxed), 2);
        assert!(progress.done.try_take());
    }

    #[test]
    fn dual_drive_interleaves_strictly() {
        let progress = Arc::new(ReadProgress::default());
        let mut assembler =
            ReadAssembler::new(true, 0, 4, true, None, Arc::clone(&progress));

        // Drive 1 data arrives first: nothing can be emitted until drive 0
        // provides block 0.
        feed_block(&mut assembler, 1, &pattern_block(1));
        feed_block(&mut assembler, 1, &pattern_block(3));
        assert_eq!(progress.blocks.load(Ordering::Relaxed), 0);

        feed_block(&mut assembler, 0, &pattern_block(0));
        assert_eq!(progress.blocks.load(Ordering::Relaxed), 2);

        feed_block(&mut assembler, 0, &pattern_block(2));
        assert_eq!(progress.blocks.load(Ordering::Relaxed), 4);
        assert!(progress.done.try_take());
    }

    #[test]
    fn corrupt_block_records_the_failure() {
        let progress = Arc::new(ReadProgress::default());
        let mut assembler =
            ReadAssembler::new(false, 0, 1, true, None, Arc::clone(&progress));

        let mut words = pattern_block(0);
        words[7] = 0xBAD0_BAD0;
        let mut fed = Vec::new();
        for chunk in words.chunks(32) {
            fed.push(assembler.on_stream_write(&stream_frame(0, chunk)));
        }
        assert!(fed.last().unwrap().is_err());
        assert!(progress.done.try_take());
        assert!(matches!(
            progress.failure.lock().unwrap().take(),
            Some(Error::DataCorruption { block: 0, word: 7, .. })
        ));
    }

    #[test]
    fn validation_uses_absolute_block_numbers() {
        let progress = Arc::new(ReadProgress::default());
        let mut assembler =
            ReadAssembler::new(false, 100, 1, true, None, Arc::clone(&progress));
        feed_block(&mut assembler, 0, &pattern_block(100));
        assert!(progress.done.try_take());
        assert!(progress.failure.lock().unwrap().is_none());
    }

    #[test]
    fn file_sink_receives_the_byte_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.bin");
        let out = BufWriter::new(File::create(&path).unwrap());

        let progress = Arc::new(ReadProgress::default());
        let mut assembler =
            ReadAssembler::new(false, 0, 1, false, Some(out), Arc::clone(&progress));
        feed_block(&mut assembler, 0, &pattern_block(0));
        assert!(progress.done.try_take());
        drop(assembler);

        let written = std::fs::read(&path).unwrap();
        let expected: Vec<u8> = pattern_block(0)
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        assert_eq!(written, expected);
    }
}
