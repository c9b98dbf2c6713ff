//! Emulated host-resident memory served to the NVMe drives.
//!
//! The NVMe controllers bus-master against what they believe is host memory;
//! the dispatcher serves those reads and writes from these arrays. Three
//! regions exist: the admin submission queue, the I/O submission queue, and
//! the block-data buffer (PRP target for single-drive block tests and for
//! admin data transfers).
//!
//! The submission-queue arrays are written by the foreground in the submit
//! path and read by the dispatcher when the NVMe fetches an entry; the
//! mutexes provide the release ordering the doorbell protocol needs.

use std::sync::Mutex;

use nvmefab_protocol::command::SQ_ENTRY_WORDS;

/// Words in each submission-queue array (N slots of 16 words; sized for the
/// largest queue depth the engine uses).
pub const SQ_REGION_WORDS: usize = 4096;

/// Words in the block-data buffer (two 4 KiB blocks).
pub const BLOCK_REGION_WORDS: usize = 8192;

#[derive(Debug)]
pub struct HostMemory {
    admin_sq: Mutex<Vec<u32>>,
    io_sq: Mutex<Vec<u32>>,
    block: Mutex<Vec<u32>>,
}

/// Which array a bus-master read resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemRegion {
    AdminSq,
    IoSq,
    Block,
}

impl Default for HostMemory {
    fn default() -> Self {
        HostMemory {
            admin_sq: Mutex::new(vec![0; SQ_REGION_WORDS]),
            io_sq: Mutex::new(vec![0; SQ_REGION_WORDS]),
            block: Mutex::new(vec![0; BLOCK_REGION_WORDS]),
        }
    }
}

impl HostMemory {
    pub fn new() -> HostMemory {
        HostMemory::default()
    }

    fn array(&self, region: MemRegion) -> &Mutex<Vec<u32>> {
        match region {
            MemRegion::AdminSq => &self.admin_sq,
            MemRegion::IoSq => &self.io_sq,
            MemRegion::Block => &self.block,
        }
    }

    /// Copy a 16-word command into submission-queue slot `slot`.
    pub fn write_sq_slot(&self, region: MemRegion, slot: u32, cmd: &[u32; SQ_ENTRY_WORDS]) {
        let mut mem = self.array(region).lock().unwrap();
        let base = slot as usize * SQ_ENTRY_WORDS;
        mem[base..base + SQ_ENTRY_WORDS].copy_from_slice(cmd);
    }

    /// Read `count` words starting at word offset `word_off`, zero-filling
    /// past the end of the region.
    pub fn read_words(&self, region: MemRegion, word_off: usize, count: usize) -> Vec<u32> {
        let mem = self.array(region).lock().unwrap();
        let mut out = vec![0u32; count];
        if word_off < mem.len() {
            let n = count.min(mem.len() - word_off);
            out[..n].copy_from_slice(&mem[word_off..word_off + n]);
        }
        out
    }

    /// Write into the block buffer at word offset `word_off`, clipping at the
    /// end of the region.
    pub fn write_block(&self, word_off: usize, data: &[u32]) {
        let mut mem = self.block.lock().unwrap();
        if word_off >= mem.len() {
            return;
        }
        let n = data.len().min(mem.len() - word_off);
        mem[word_off..word_off + n].copy_from_slice(&data[..n]);
    }

    /// Fill the whole block buffer with `value`.
    pub fn fill_block(&self, value: u32) {
        self.block.lock().unwrap().fill(value);
    }

    /// Overwrite the start of the block buffer with `data`.
    pub fn load_block(&self, data: &[u32]) {
        let mut mem = self.block.lock().unwrap();
        let n = data.len().min(mem.len());
        mem[..n].copy_from_slice(&data[..n]);
    }
}
