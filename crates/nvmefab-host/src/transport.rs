//! The PCIe transport and NVMe queue engine.
//!
//! [`NvmeTransport`] owns the DMA endpoint, the mmap'd register window and
//! the dispatcher thread. The foreground issues synchronous PCIe
//! transactions and queued NVMe commands through it; the dispatcher (see
//! `dispatch`) services everything inbound.
//!
//! Only one PCIe transaction may be outstanding at a time (the FPGA has a
//! single reply path); a transaction mutex enforces that, and the
//! capacity-one reply semaphore is drained before each request so a stale
//! signal cannot satisfy a new transaction.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use nvmefab_protocol::command::{build_submission, OPC_ADMIN_CREATE_IO_CQ, OPC_ADMIN_CREATE_IO_SQ};
use nvmefab_protocol::frame::{
    ReplyFrame, RequestFrame, REQ_CFG_WRITE, REQ_MEM_READ, REQ_MEM_WRITE,
};
use nvmefab_protocol::regs;

use crate::device::DmaEndpoint;
use crate::dispatch;
use crate::error::{Error, Result};
use crate::hostmem::{HostMemory, MemRegion};
use crate::queue::QueueState;
use crate::regbus::{DriveSel, RegisterBus};
use crate::stream::{BlockBufferSink, StreamSink};
use crate::sync::Semaphore;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Submission/completion queue depth (admin and I/O).
    pub queue_depth: u32,
    /// Route queue submissions through the FPGA queue engine instead of the
    /// emulated host-resident queues.
    pub hardware_queue_engine: bool,
    /// The bitstream configures the NVMe drives itself; reset waits for the
    /// configured status instead of just reset-complete.
    pub hardware_config: bool,
    /// I/O queue pairs to create during `init`.
    pub io_queues: u32,
    /// Microseconds to wait for a PCIe reply or an NVMe completion.
    pub reply_timeout_us: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            queue_depth: 16,
            hardware_queue_engine: true,
            hardware_config: false,
            io_queues: 1,
            reply_timeout_us: 5_000_000,
        }
    }
}

/// Diagnostic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Inbound frames that could not be routed: undecodable, unknown request
    /// code, or unknown region prefix.
    pub dropped_frames: u64,
}

/// State shared between the foreground and the dispatcher thread.
pub(crate) struct Shared {
    pub(crate) endpoint: Arc<dyn DmaEndpoint>,
    pub(crate) config: TransportConfig,
    pub(crate) drive: Mutex<DriveSel>,
    tag: AtomicU8,

    /// Reply slot plus its capacity-one semaphore. Written by the
    /// dispatcher, read by the foreground after the semaphore fires.
    pub(crate) reply: Mutex<ReplyFrame>,
    pub(crate) reply_sem: Semaphore,

    /// Raised by the dispatcher on every NVMe completion; the status word of
    /// the latest completion lands in `last_status` first.
    pub(crate) queue_sem: Semaphore,
    pub(crate) last_status: AtomicU32,

    pub(crate) mem: Arc<HostMemory>,
    pub(crate) admin_q: Mutex<QueueState>,
    pub(crate) io_q: Mutex<QueueState>,

    pub(crate) sink: Mutex<Box<dyn StreamSink>>,
    pub(crate) dropped_frames: AtomicU64,
}

impl Shared {
    pub(crate) fn drive(&self) -> DriveSel {
        *self.drive.lock().unwrap()
    }

    /// Allocate the next transaction tag (1, 2, and so on, wrapping). With one
    /// transaction in flight at a time the tag is a diagnostic aid.
    fn next_tag(&self) -> u8 {
        self.tag.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Apply the current drive's routing bits to a PCIe address.
    fn route(&self, address: u32) -> u64 {
        (address | self.drive().addr_bits()) as u64
    }

    fn build_request(&self, request: u8, address: u32, num_words: u16, data: Vec<u32>) -> RequestFrame {
        RequestFrame {
            address: self.route(address),
            num_words,
            request,
            requester_id: 0x0001,
            tag: self.next_tag(),
            completer_id: 0,
            requester_id_enable: true,
            data,
        }
    }

    /// Fire-and-forget memory write; the hardware sends no reply for these.
    /// Used by the dispatcher for completion-queue head doorbells.
    pub(crate) fn post_memory_write(&self, address: u32, data: &[u32]) -> Result<()> {
        let frame = self.build_request(REQ_MEM_WRITE, address, data.len() as u16, data.to_vec());
        self.endpoint.send_frame(&frame.encode()?)
    }

    pub(crate) fn count_drop(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }
}

/// Host-side handle to the FPGA NVMe engine.
///
/// Construction drains stale frames left in the kernel receive buffer from a
/// previous run, then spawns the dispatcher. Drop closes the endpoint (which
/// unblocks the dispatcher's receive) and joins the thread, in that order.
pub struct NvmeTransport {
    pub(crate) shared: Arc<Shared>,
    regs: Arc<dyn RegisterBus>,
    txn: Mutex<()>,
    dispatcher: Option<JoinHandle<()>>,
}

impl NvmeTransport {
    pub fn new(
        endpoint: Arc<dyn DmaEndpoint>,
        regs: Arc<dyn RegisterBus>,
        config: TransportConfig,
    ) -> Result<NvmeTransport> {
        let mut scratch = vec![0u8; 4096];
        while endpoint.readable() > 0 {
            match endpoint.recv_frame(&mut scratch) {
                Ok(n) => debug!(bytes = n, "drained stale frame"),
                Err(_) => break,
            }
        }

        let mem = Arc::new(HostMemory::new());
        let shared = Arc::new(Shared {
            endpoint,
            drive: Mutex::new(DriveSel::Drive0),
            tag: AtomicU8::new(0),
            reply: Mutex::new(ReplyFrame::default()),
            reply_sem: Semaphore::new(),
            queue_sem: Semaphore::new(),
            last_status: AtomicU32::new(0),
            admin_q: Mutex::new(QueueState::new(config.queue_depth)),
            io_q: Mutex::new(QueueState::new(config.queue_depth)),
            sink: Mutex::new(Box::new(BlockBufferSink::new(Arc::clone(&mem)))),
            dropped_frames: AtomicU64::new(0),
            mem,
            config,
        });

        let dispatcher = thread::Builder::new()
            .name("nvmefab-dispatch".into())
            .spawn({
                let shared = Arc::clone(&shared);
                move || dispatch::run(shared)
            })
            .map_err(|e| Error::Transport(format!("spawn dispatcher: {e}")))?;

        Ok(NvmeTransport {
            shared,
            regs,
            txn: Mutex::new(()),
            dispatcher: Some(dispatcher),
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    pub fn drive(&self) -> DriveSel {
        self.shared.drive()
    }

    /// Select which drive (or both) subsequent operations address.
    pub fn set_drive(&self, drive: DriveSel) {
        *self.shared.drive.lock().unwrap() = drive;
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            dropped_frames: self.shared.dropped_frames.load(Ordering::Relaxed),
        }
    }

    // ---- PCIe transport ----

    fn wait_reply(&self) -> Result<ReplyFrame> {
        let started = Instant::now();
        if !self.shared.reply_sem.wait_us(self.shared.config.reply_timeout_us) {
            return Err(Error::Timeout {
                what: "pcie reply",
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }
        Ok(self.shared.reply.lock().unwrap().clone())
    }

    /// Synchronous PCIe read (`request` 0 for memory, 8 for config space).
    /// Returns exactly `num_words` words from the reply payload.
    pub fn pcie_read(&self, request: u8, address: u32, num_words: u16) -> Result<Vec<u32>> {
        let _txn = self.txn.lock().unwrap();
        let frame = self.shared.build_request(request, address, num_words, Vec::new());
        self.shared.reply_sem.drain();
        self.shared.endpoint.send_frame(&frame.encode()?)?;

        let reply = self.wait_reply()?;
        if reply.error != 0 {
            return Err(Error::Pcie { code: reply.error });
        }
        if reply.tag != frame.tag {
            debug!(sent = frame.tag, got = reply.tag, "reply tag mismatch");
        }
        let mut words = reply.data;
        words.resize(num_words as usize, 0);
        Ok(words)
    }

    /// Synchronous PCIe write (`request` 1 for memory, 10 for config space).
    /// Config writes wait for the completion and surface its error code;
    /// memory writes are posted (the hardware sends no reply).
    pub fn pcie_write(&self, request: u8, address: u32, data: &[u32]) -> Result<()> {
        let _txn = self.txn.lock().unwrap();
        let frame = self
            .shared
            .build_request(request, address, data.len() as u16, data.to_vec());
        if request == REQ_CFG_WRITE {
            self.shared.reply_sem.drain();
        }
        self.shared.endpoint.send_frame(&frame.encode()?)?;

        if request == REQ_CFG_WRITE {
            let reply = self.wait_reply()?;
            if reply.error != 0 {
                return Err(Error::Pcie { code: reply.error });
            }
        }
        Ok(())
    }

    // ---- NVMe register access ----

    pub fn read_nvme_reg32(&self, address: u32) -> Result<u32> {
        Ok(self.pcie_read(REQ_MEM_READ, address, 1)?[0])
    }

    pub fn write_nvme_reg32(&self, address: u32, value: u32) -> Result<()> {
        self.pcie_write(REQ_MEM_WRITE, address, &[value])
    }

    pub fn read_nvme_reg64(&self, address: u32) -> Result<u64> {
        let words = self.pcie_read(REQ_MEM_READ, address, 2)?;
        Ok(words[0] as u64 | (words[1] as u64) << 32)
    }

    pub fn write_nvme_reg64(&self, address: u32, value: u64) -> Result<()> {
        self.pcie_write(REQ_MEM_WRITE, address, &[value as u32, (value >> 32) as u32])
    }

    // ---- FPGA control-block registers ----

    /// Read a control-block register in the current drive's sub-bank.
    pub fn read_storage_reg(&self, offset: u32) -> u32 {
        self.regs.read_reg(self.drive().reg_base() + offset)
    }

    /// Write a control-block register in the current drive's sub-bank (the
    /// broadcast bank when both drives are selected).
    pub fn write_storage_reg(&self, offset: u32, value: u32) {
        self.regs.write_reg(self.drive().reg_base() + offset, value)
    }

    /// Read a register from a specific drive's sub-bank, regardless of the
    /// current selection. Used for per-drive stats in dual-drive streaming.
    pub fn read_drive_reg(&self, drive: DriveSel, offset: u32) -> u32 {
        self.regs.read_reg(drive.reg_base() + offset)
    }

    // ---- Queue engine ----

    /// Build and submit one NVMe command.
    ///
    /// `queue` 0 is the admin queue; 1 (and up) the I/O queues. In
    /// hardware-queue-engine mode the 16-word command is posted to the
    /// engine's slot with a single memory write; otherwise it lands in the
    /// emulated submission queue and the tail doorbell is rung.
    ///
    /// With `wait`, blocks until the dispatcher sees the completion and
    /// surfaces a non-zero NVMe status as [`Error::NvmeStatus`].
    #[allow(clippy::too_many_arguments)]
    pub fn submit(
        &self,
        wait: bool,
        queue: u32,
        opcode: u8,
        namespace: u32,
        prp1: u32,
        cdw10: u32,
        cdw11: u32,
        cdw12: u32,
    ) -> Result<()> {
        let engine = self.shared.config.hardware_queue_engine;
        let (cmd, doorbell) = {
            let qlock = if queue == 0 {
                &self.shared.admin_q
            } else {
                &self.shared.io_q
            };
            let mut q = qlock.lock().unwrap();
            let cmd = build_submission(opcode, q.next_id(), namespace, prp1, cdw10, cdw11, cdw12);
            if engine {
                (cmd, None)
            } else {
                let region = if queue == 0 {
                    MemRegion::AdminSq
                } else {
                    MemRegion::IoSq
                };
                self.shared.mem.write_sq_slot(region, q.tx_slot(), &cmd);
                let tail = q.advance_tx();
                let bell = if queue == 0 {
                    regs::DOORBELL_ADMIN_SQ_TAIL
                } else {
                    regs::DOORBELL_IO_SQ_TAIL
                };
                (cmd, Some((bell, tail)))
            }
        };

        debug!(queue, opcode = %format_args!("{opcode:#04x}"), "nvme submit");
        self.shared.queue_sem.drain();
        match doorbell {
            None => self.pcie_write(REQ_MEM_WRITE, regs::queue_engine_slot(queue), &cmd)?,
            Some((bell, tail)) => self.write_nvme_reg32(bell, tail)?,
        }

        if wait {
            let started = Instant::now();
            if !self.shared.queue_sem.wait_us(self.shared.config.reply_timeout_us) {
                return Err(Error::Timeout {
                    what: "nvme completion",
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }
            let status = self.shared.last_status.load(Ordering::Acquire) as u16;
            if status != 0 {
                return Err(Error::NvmeStatus { status });
            }
        }
        Ok(())
    }

    // ---- Reset and bring-up ----

    /// Reset the engine and the downstream PCIe links, then restart the
    /// queue bookkeeping.
    pub fn reset(&self) -> Result<()> {
        info!("engine reset");
        self.write_storage_reg(regs::REG_CONTROL, regs::CONTROL_RESET);

        let started = Instant::now();
        loop {
            let status = self.read_storage_reg(regs::REG_STATUS);
            let done = if self.shared.config.hardware_config {
                status & (regs::STATUS_RESET_BUSY | regs::STATUS_CONFIGURED)
                    == regs::STATUS_CONFIGURED
            } else {
                status & regs::STATUS_RESET_BUSY == 0
            };
            if done {
                break;
            }
            if started.elapsed() > Duration::from_secs(5) {
                return Err(Error::Timeout {
                    what: "engine reset",
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }
            thread::sleep(Duration::from_millis(1));
        }
        // Let the downstream links retrain before the first transaction.
        thread::sleep(Duration::from_millis(100));

        self.shared.admin_q.lock().unwrap().reset();
        self.shared.io_q.lock().unwrap().reset();
        Ok(())
    }

    /// Bring up the NVMe controller(s) for the current drive selection:
    /// PCIe command register, controller stop, interrupt mask, admin queues,
    /// controller start, then I/O queue-pair creation.
    pub fn init(&self) -> Result<()> {
        let selected = self.drive();
        for &drive in selected.each() {
            self.set_drive(drive);
            let result = self.init_drive();
            if result.is_err() {
                self.set_drive(selected);
                return result;
            }
        }
        self.set_drive(selected);
        Ok(())
    }

    fn init_drive(&self) -> Result<()> {
        let n = self.shared.config.queue_depth;
        let engine = self.shared.config.hardware_queue_engine;
        info!(drive = ?self.drive(), "nvme bring-up");

        // Enable memory access and bus mastering.
        self.pcie_write(REQ_CFG_WRITE, 4, &[0x06])?;

        self.write_nvme_reg32(regs::NVME_REG_CC, regs::NVME_CC_STOP)?;
        thread::sleep(Duration::from_millis(10));

        // Completions arrive as bus-master writes; interrupts stay masked.
        self.write_nvme_reg32(regs::NVME_REG_INTMS, 0xFFFF_FFFF)?;

        self.write_nvme_reg32(regs::NVME_REG_AQA, ((n - 1) << 16) | (n - 1))?;
        if engine {
            self.write_nvme_reg64(regs::NVME_REG_ASQ, regs::ADMIN_SQ_BASE_ENGINE as u64)?;
            self.write_nvme_reg64(regs::NVME_REG_ACQ, regs::ADMIN_CQ_BASE_ENGINE as u64)?;
        } else {
            self.write_nvme_reg64(regs::NVME_REG_ASQ, regs::ADMIN_SQ_BASE_DIRECT as u64)?;
            self.write_nvme_reg64(regs::NVME_REG_ACQ, regs::ADMIN_CQ_BASE_DIRECT as u64)?;
        }

        self.write_nvme_reg32(regs::NVME_REG_CC, regs::NVME_CC_START)?;
        thread::sleep(Duration::from_millis(100));

        let base = if engine {
            regs::QUEUE_ENGINE_BASE
        } else {
            regs::HOST_MEM_BASE
        };
        let cmd0 = (n - 1) << 16;
        for q in 1..=self.shared.config.io_queues {
            let cq_prp = base | (regs::REGION_ADMIN_CQ + (q << 16));
            let sq_prp = base | (q << 16);
            self.submit(true, 0, OPC_ADMIN_CREATE_IO_CQ, 0, cq_prp, cmd0 | q, 1, 0)?;
            self.submit(true, 0, OPC_ADMIN_CREATE_IO_SQ, 0, sq_prp, cmd0 | q, (q << 16) | 1, 0)?;
        }
        thread::sleep(Duration::from_millis(100));
        Ok(())
    }

    // ---- Streaming sink ----

    /// Install the capability the dispatcher hands streaming-write packets
    /// to (region prefixes 0xE00000/0xF00000).
    pub fn set_stream_sink(&self, sink: Box<dyn StreamSink>) {
        *self.shared.sink.lock().unwrap() = sink;
    }

    /// Restore the default sink, which mirrors packets into the block
    /// buffer.
    pub fn reset_stream_sink(&self) {
        *self.shared.sink.lock().unwrap() =
            Box::new(BlockBufferSink::new(Arc::clone(&self.shared.mem)));
    }

    // ---- Emulated block buffer ----

    /// Read words from the emulated block buffer (PRP target of single-drive
    /// block tests).
    pub fn block_buffer(&self, word_off: usize, count: usize) -> Vec<u32> {
        self.shared.mem.read_words(MemRegion::Block, word_off, count)
    }

    /// Fill the block buffer with a constant, as the block tests do before a
    /// read so stale data cannot pass for fresh.
    pub fn fill_block_buffer(&self, value: u32) {
        self.shared.mem.fill_block(value)
    }

    /// Overwrite the start of the block buffer, used to stage data for a
    /// block write command.
    pub fn load_block_buffer(&self, data: &[u32]) {
        self.shared.mem.load_block(data)
    }

    /// Snapshot of the queue bookkeeping (admin, I/O).
    pub fn queue_states(&self) -> (QueueState, QueueState) {
        (
            *self.shared.admin_q.lock().unwrap(),
            *self.shared.io_q.lock().unwrap(),
        )
    }

    // ---- Diagnostics ----

    /// Read the named control-block registers of one drive's sub-bank.
    pub fn storage_register_dump(&self, drive: DriveSel) -> Vec<(&'static str, u32)> {
        STORAGE_REG_NAMES
            .iter()
            .map(|&(name, offset)| (name, self.read_drive_reg(drive, offset)))
            .collect()
    }

    /// Read the first NVMe controller registers over PCIe.
    pub fn nvme_register_dump(&self) -> Result<Vec<(u32, u32)>> {
        let mut out = Vec::with_capacity(16);
        for i in 0..16u32 {
            out.push((i * 4, self.read_nvme_reg32(i * 4)?));
        }
        Ok(out)
    }
}

/// Named registers reported by [`NvmeTransport::storage_register_dump`].
pub const STORAGE_REG_NAMES: &[(&str, u32)] = &[
    ("Ident", regs::REG_IDENT),
    ("Control", regs::REG_CONTROL),
    ("Status", regs::REG_STATUS),
    ("TotalBlocks", regs::REG_TOTAL_BLOCKS),
    ("DataChunkStart", regs::REG_DATA_CHUNK_START),
    ("DataChunkSize", regs::REG_DATA_CHUNK_SIZE),
    ("WriteError", regs::REG_WRITE_ERROR),
    ("WriteNumBlocks", regs::REG_WRITE_NUM_BLOCKS),
    ("WriteTime", regs::REG_WRITE_TIME),
    ("WritePeakLatency", regs::REG_WRITE_PEAK_LATENCY),
    ("ReadControl", regs::REG_READ_CONTROL),
    ("ReadBlock", regs::REG_READ_BLOCK),
    ("ReadNumBlocks", regs::REG_READ_NUM_BLOCKS),
];

impl Drop for NvmeTransport {
    fn drop(&mut self) {
        // Close the endpoint first so the dispatcher's blocking receive
        // returns, then join it.
        self.shared.endpoint.shutdown();
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
    }
}
