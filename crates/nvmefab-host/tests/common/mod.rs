//! In-memory model of the FPGA engine and its NVMe drives.
//!
//! [`FakeFpga`] implements [`DmaEndpoint`]: frames the host sends are parsed
//! and fed to a behavioural model which answers PCIe reads, executes queued
//! NVMe commands (fetching submission entries from emulated host memory over
//! the same frame protocol the hardware uses) and posts completions back
//! into the host's inbox. [`FakeRegs`] implements [`RegisterBus`] and models
//! the capture and read engines: starting the read engine pushes pattern
//! block data into the FPGA's stream, chunk-interleaved across drives.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use nvmefab_host::error::{Error, Result};
use nvmefab_host::{DmaEndpoint, RegisterBus};
use nvmefab_protocol::frame::{
    decode_frame, Frame, ReplyFrame, RequestFrame, REQ_CFG_READ, REQ_CFG_WRITE, REQ_MEM_READ,
    REQ_MEM_WRITE,
};
use nvmefab_protocol::regs;
use nvmefab_protocol::BLOCK_WORDS;

pub const QUEUE_DEPTH: u32 = 16;

/// Words per 512-byte LBA.
const LBA_WORDS: usize = 128;

/// What the model is waiting to receive from the host.
enum Pending {
    /// Submission-queue entry fetch: collect 16 words, then execute.
    SqEntry { queue: u32, words: Vec<u32> },
    /// Data fetch for a block-write command.
    WriteData {
        queue: u32,
        cmd: [u32; 16],
        expect: usize,
        words: Vec<u32>,
    },
}

#[derive(Default)]
pub struct Model {
    /// PCIe config space per drive, 32-bit words.
    pub config_space: [[u32; 16]; 2],
    /// NVMe controller registers per drive, keyed by byte address.
    pub nvme_regs: [HashMap<u32, u32>; 2],
    /// Last value written to each completion-queue head doorbell
    /// (admin, I/O).
    pub cq_head_doorbells: [Option<u32>; 2],
    /// Everything the host replied to our bus-master reads.
    pub captured_replies: Vec<ReplyFrame>,

    /// Status word for the next completion (taken once).
    pub next_status: Option<u16>,
    /// Force a PCIe reply error code on the next read reply.
    pub next_pcie_error: Option<u8>,

    /// Blocks written through the I/O queue, keyed by starting LBA.
    pub disk_writes: HashMap<u32, Vec<u32>>,
    /// Identify-controller payload word 0 (must be non-zero).
    pub identify_head: u32,

    admin_head: u32,
    io_head: u32,
    io_sq_base: u32,
    pending: Option<Pending>,
    out: Vec<Vec<u8>>,
}

impl Model {
    fn new() -> Model {
        Model {
            identify_head: 0x4E56_4D45,
            io_sq_base: regs::HOST_MEM_BASE | regs::REGION_IO_SQ,
            ..Model::default()
        }
    }

    fn drive_of(address: u64) -> usize {
        usize::from(address as u32 & regs::DRIVE1_ADDR_BIT != 0)
    }

    fn push_request(&mut self, address: u64, data: &[u32]) {
        let frame = RequestFrame {
            address,
            num_words: data.len() as u16,
            request: REQ_MEM_WRITE,
            requester_id: 0x0100,
            data: data.to_vec(),
            ..Default::default()
        };
        self.out.push(frame.encode().unwrap());
    }

    fn push_read_request(&mut self, address: u64, num_words: u16, tag: u8) {
        let frame = RequestFrame {
            address,
            num_words,
            request: REQ_MEM_READ,
            requester_id: 0x0100,
            tag,
            ..Default::default()
        };
        self.out.push(frame.encode().unwrap());
    }

    fn push_reply(&mut self, tag: u8, data: Vec<u32>) {
        let error = self.next_pcie_error.take().unwrap_or(0);
        let frame = ReplyFrame {
            error,
            num_bytes: (data.len() * 4) as u16,
            num_words: data.len() as u16,
            tag,
            data,
            ..Default::default()
        };
        self.out.push(frame.encode().unwrap());
    }

    fn handle_host_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Request(req) => self.handle_host_request(req),
            Frame::Reply(reply) => self.handle_host_reply(reply),
        }
    }

    fn handle_host_request(&mut self, req: RequestFrame) {
        let drive = Model::drive_of(req.address);
        let address = req.address as u32 & !regs::DRIVE1_ADDR_BIT;
        match req.request {
            REQ_CFG_READ => {
                let word = self.config_space[drive][(address / 4) as usize % 16];
                self.push_reply(req.tag, vec![word]);
            }
            REQ_CFG_WRITE => {
                self.config_space[drive][(address / 4) as usize % 16] = req.data[0];
                self.push_reply(req.tag, Vec::new());
            }
            REQ_MEM_READ => {
                let mut words = Vec::with_capacity(req.num_words as usize);
                for i in 0..req.num_words as u32 {
                    words.push(
                        *self.nvme_regs[drive]
                            .get(&(address + 4 * i))
                            .unwrap_or(&0),
                    );
                }
                self.push_reply(req.tag, words);
            }
            REQ_MEM_WRITE => self.handle_memory_write(drive, address, &req.data),
            _ => {}
        }
    }

    fn handle_memory_write(&mut self, drive: usize, address: u32, data: &[u32]) {
        if address & 0xFF00_0000 == regs::QUEUE_ENGINE_BASE {
            // FPGA queue engine: the 16-word command is submitted directly.
            let queue = (address >> 16) & 0xFF;
            let cmd: [u32; 16] = data[..16].try_into().unwrap();
            self.execute_command(queue, cmd);
            return;
        }
        match address {
            regs::DOORBELL_ADMIN_SQ_TAIL => self.on_sq_tail(0, data[0]),
            regs::DOORBELL_IO_SQ_TAIL => self.on_sq_tail(1, data[0]),
            regs::DOORBELL_ADMIN_CQ_HEAD => self.cq_head_doorbells[0] = Some(data[0]),
            regs::DOORBELL_IO_CQ_HEAD => self.cq_head_doorbells[1] = Some(data[0]),
            _ => {
                for (i, &w) in data.iter().enumerate() {
                    self.nvme_regs[drive].insert(address + 4 * i as u32, w);
                }
            }
        }
    }

    /// A submission tail doorbell moved: fetch the next entry from emulated
    /// host memory, one bus-master read per slot.
    fn on_sq_tail(&mut self, queue: u32, tail: u32) {
        let head = if queue == 0 {
            self.admin_head
        } else {
            self.io_head
        };
        if head == tail {
            return;
        }
        let base = if queue == 0 {
            self.nvme_regs[0].get(&regs::NVME_REG_ASQ).copied().unwrap_or(0)
        } else {
            self.io_sq_base
        };
        self.pending = Some(Pending::SqEntry {
            queue,
            words: Vec::new(),
        });
        self.push_read_request((base + head * 64) as u64, 16, 0x80);
    }

    fn handle_host_reply(&mut self, reply: ReplyFrame) {
        self.captured_replies.push(reply.clone());
        match self.pending.take() {
            Some(Pending::SqEntry { queue, mut words }) => {
                words.extend_from_slice(&reply.data);
                if words.len() >= 16 {
                    let cmd: [u32; 16] = words[..16].try_into().unwrap();
                    let head = if queue == 0 {
                        &mut self.admin_head
                    } else {
                        &mut self.io_head
                    };
                    *head = (*head + 1) % QUEUE_DEPTH;
                    self.execute_command(queue, cmd);
                } else {
                    self.pending = Some(Pending::SqEntry { queue, words });
                }
            }
            Some(Pending::WriteData {
                queue,
                cmd,
                expect,
                mut words,
            }) => {
                words.extend_from_slice(&reply.data);
                if words.len() >= expect {
                    self.disk_writes.insert(cmd[10], words);
                    self.post_completion(queue, cmd);
                } else {
                    self.pending = Some(Pending::WriteData {
                        queue,
                        cmd,
                        expect,
                        words,
                    });
                }
            }
            None => {}
        }
    }

    fn execute_command(&mut self, queue: u32, cmd: [u32; 16]) {
        let opcode = (cmd[0] & 0xFF) as u8;
        let prp1 = cmd[6];
        if queue == 0 {
            match opcode {
                // Identify: deliver one page of data, first word non-zero.
                0x06 => {
                    let mut data = vec![0u32; BLOCK_WORDS];
                    data[0] = self.identify_head;
                    data[1] = cmd[10];
                    self.write_to_host(prp1, &data);
                }
                // Create I/O CQ/SQ: record the SQ base for later fetches.
                0x01 => self.io_sq_base = prp1,
                _ => {}
            }
            self.post_completion(0, cmd);
        } else {
            match opcode {
                // Block read: stream pattern data to the PRP target.
                0x02 => {
                    let lba = cmd[10];
                    let lbas = (cmd[12] & 0xFFFF) + 1;
                    let data: Vec<u32> = (0..lbas * LBA_WORDS as u32)
                        .map(|w| lba.wrapping_mul(LBA_WORDS as u32).wrapping_add(w))
                        .collect();
                    self.write_to_host(prp1, &data);
                    self.post_completion(queue, cmd);
                }
                // Block write: fetch the data from the PRP target first.
                0x01 => {
                    let lbas = (cmd[12] & 0xFFFF) + 1;
                    let expect = (lbas as usize) * LBA_WORDS;
                    self.pending = Some(Pending::WriteData {
                        queue,
                        cmd,
                        expect,
                        words: Vec::new(),
                    });
                    self.push_read_request(prp1 as u64, expect as u16, 0x81);
                }
                _ => self.post_completion(queue, cmd),
            }
        }
    }

    /// Bus-master write of `data` to host memory in max-payload chunks.
    fn write_to_host(&mut self, base: u32, data: &[u32]) {
        for (i, chunk) in data.chunks(32).enumerate() {
            self.push_request((base + 128 * i as u32) as u64, chunk);
        }
    }

    fn post_completion(&mut self, queue: u32, cmd: [u32; 16]) {
        let status = self.next_status.take().unwrap_or(0);
        let cid = (cmd[0] >> 16) & 0xFF;
        let head = if queue == 0 {
            self.admin_head
        } else {
            self.io_head
        };
        let region = if queue == 0 {
            regs::REGION_ADMIN_CQ
        } else {
            regs::REGION_IO_CQ
        };
        let entry = [
            0,
            0,
            (queue << 16) | head,
            ((status as u32) << 17) | (1 << 16) | cid,
        ];
        self.push_request(region as u64, &entry);
    }
}

/// [`DmaEndpoint`] backed by the behavioural model.
pub struct FakeFpga {
    inbox: Mutex<VecDeque<Vec<u8>>>,
    cv: Condvar,
    shutdown: AtomicBool,
    pub model: Mutex<Model>,
}

impl FakeFpga {
    pub fn new() -> FakeFpga {
        FakeFpga {
            inbox: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            model: Mutex::new(Model::new()),
        }
    }

    /// Queue a raw frame for delivery to the host, bypassing the model.
    pub fn push_frame(&self, frame: Vec<u8>) {
        let mut inbox = self.inbox.lock().unwrap();
        inbox.push_back(frame);
        self.cv.notify_one();
    }

    fn flush_model_output(&self, out: Vec<Vec<u8>>) {
        if out.is_empty() {
            return;
        }
        let mut inbox = self.inbox.lock().unwrap();
        inbox.extend(out);
        self.cv.notify_one();
    }
}

impl DmaEndpoint for FakeFpga {
    fn send_frame(&self, frame: &[u8]) -> Result<()> {
        let decoded = decode_frame(frame).map_err(|e| Error::Protocol(e.to_string()))?;
        let out = {
            let mut model = self.model.lock().unwrap();
            model.handle_host_frame(decoded);
            std::mem::take(&mut model.out)
        };
        self.flush_model_output(out);
        Ok(())
    }

    fn recv_frame(&self, buf: &mut [u8]) -> Result<usize> {
        let mut inbox = self.inbox.lock().unwrap();
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Err(Error::Transport("endpoint closed".into()));
            }
            if let Some(frame) = inbox.pop_front() {
                buf[..frame.len()].copy_from_slice(&frame);
                return Ok(frame.len());
            }
            inbox = self.cv.wait(inbox).unwrap();
        }
    }

    fn readable(&self) -> usize {
        self.inbox.lock().unwrap().iter().map(Vec::len).sum()
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.cv.notify_all();
    }
}

/// [`RegisterBus`] modelling the control block: broadcast-bank mirroring,
/// instant capture completion, and a read engine that streams pattern
/// blocks.
pub struct FakeRegs {
    regs: Mutex<HashMap<u32, u32>>,
    fpga: Arc<FakeFpga>,
    /// Absolute block whose first word is corrupted by the read engine.
    pub corrupt_block: Mutex<Option<u64>>,
    /// Value the capture engine leaves in `WriteError`.
    pub capture_error: Mutex<u32>,
}

impl FakeRegs {
    pub fn new(fpga: Arc<FakeFpga>) -> FakeRegs {
        FakeRegs {
            regs: Mutex::new(HashMap::new()),
            fpga,
            corrupt_block: Mutex::new(None),
            capture_error: Mutex::new(0),
        }
    }

    fn get(&self, offset: u32) -> u32 {
        *self.regs.lock().unwrap().get(&offset).unwrap_or(&0)
    }

    fn set(&self, offset: u32, value: u32) {
        self.regs.lock().unwrap().insert(offset, value);
    }

    /// Drive banks addressed by a register write (broadcast hits both).
    fn drive_banks(offset: u32) -> &'static [u32] {
        match offset & 0xF00 {
            0x100 => &[regs::DRIVE0_REG_BASE],
            0x200 => &[regs::DRIVE1_REG_BASE],
            _ => &[regs::DRIVE0_REG_BASE, regs::DRIVE1_REG_BASE],
        }
    }

    fn start_capture(&self, banks: &[u32]) {
        let error = *self.capture_error.lock().unwrap();
        for &bank in banks {
            let blocks = self.get(bank + regs::REG_DATA_CHUNK_SIZE);
            self.set(bank + regs::REG_WRITE_NUM_BLOCKS, blocks);
            self.set(bank + regs::REG_WRITE_TIME, blocks.saturating_mul(10));
            self.set(bank + regs::REG_WRITE_PEAK_LATENCY, 42);
            self.set(bank + regs::REG_WRITE_ERROR, error);
        }
    }

    /// Stream the programmed range into the host's inbox, chunk-interleaved
    /// across the started drives the way the hardware multiplexes them.
    fn start_read(&self, banks: &[u32]) {
        let dual = banks.len() == 2;
        let corrupt = *self.corrupt_block.lock().unwrap();

        let mut streams: Vec<(usize, Vec<Vec<u8>>)> = Vec::new();
        for (index, &bank) in banks.iter().enumerate() {
            let start = self.get(bank + regs::REG_READ_BLOCK);
            let count = self.get(bank + regs::REG_READ_NUM_BLOCKS);
            let mut frames = Vec::new();
            for i in 0..count {
                let absolute = if dual {
                    2 * (start + i) as u64 + index as u64
                } else {
                    (start + i) as u64
                };
                let mut words: Vec<u32> = (0..BLOCK_WORDS as u32)
                    .map(|w| {
                        (absolute as u32)
                            .wrapping_mul(BLOCK_WORDS as u32)
                            .wrapping_add(w)
                    })
                    .collect();
                if corrupt == Some(absolute) {
                    words[0] ^= 0xFFFF_FFFF;
                }
                let route = if index == 1 { regs::DRIVE1_ADDR_BIT } else { 0 };
                for chunk in words.chunks(32) {
                    let frame = RequestFrame {
                        address: (regs::REGION_STREAM | route) as u64,
                        num_words: chunk.len() as u16,
                        request: REQ_MEM_WRITE,
                        data: chunk.to_vec(),
                        ..Default::default()
                    };
                    frames.push(frame.encode().unwrap());
                }
            }
            streams.push((index, frames));
        }

        let longest = streams.iter().map(|(_, f)| f.len()).max().unwrap_or(0);
        for i in 0..longest {
            for (_, frames) in &streams {
                if let Some(frame) = frames.get(i) {
                    self.fpga.push_frame(frame.clone());
                }
            }
        }
    }
}

impl RegisterBus for FakeRegs {
    fn read_reg(&self, offset: u32) -> u32 {
        self.get(offset)
    }

    fn write_reg(&self, offset: u32, value: u32) {
        let banks = FakeRegs::drive_banks(offset);
        let reg = offset & 0xFF;
        self.set(offset, value);
        for &bank in banks {
            self.set(bank + reg, value);
        }

        if reg == regs::REG_CONTROL && value & regs::CONTROL_CAPTURE_START != 0 {
            self.start_capture(banks);
        }
        if reg == regs::REG_READ_CONTROL && value & regs::READ_CONTROL_START != 0 {
            self.start_read(banks);
        }
    }
}

/// A transport over a fresh model with the given config.
pub fn model_transport(
    config: nvmefab_host::TransportConfig,
) -> (Arc<FakeFpga>, Arc<FakeRegs>, nvmefab_host::NvmeTransport) {
    let fpga = Arc::new(FakeFpga::new());
    let regs = Arc::new(FakeRegs::new(Arc::clone(&fpga)));
    let transport = nvmefab_host::NvmeTransport::new(
        Arc::clone(&fpga) as Arc<dyn DmaEndpoint>,
        Arc::clone(&regs) as Arc<dyn RegisterBus>,
        config,
    )
    .unwrap();
    (fpga, regs, transport)
}
