//! The dispatcher thread.
//!
//! Owns the receive side of the DMA endpoint exclusively. Every inbound
//! frame is one of:
//! - a reply to a host-originated PCIe transaction: copied into the reply
//!   slot, reply semaphore raised;
//! - an NVMe bus-master read of emulated host memory: served from the
//!   region arrays, chunked into max-payload replies;
//! - an NVMe bus-master write: a completion-queue entry (advance the head,
//!   ring the head doorbell, raise the queue semaphore), a block-buffer
//!   write, or a streaming-write packet handed to the installed sink.
//!
//! The loop exits when the endpoint errors, which happens exactly when the
//! transport closes it during drop. Unknown request codes and unknown region
//! prefixes are logged and counted, never fatal.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use nvmefab_protocol::command::CompletionEntry;
use nvmefab_protocol::frame::{
    decode_frame, Frame, ReplyFrame, RequestFrame, PCIE_MAX_PAYLOAD_WORDS, REQ_MEM_READ,
    REQ_MEM_WRITE,
};
use nvmefab_protocol::regs::{self, Region};

use crate::hostmem::MemRegion;
use crate::transport::Shared;

pub(crate) fn run(shared: Arc<Shared>) {
    debug!("dispatcher running");
    let mut buf = vec![0u8; 4096];
    loop {
        let n = match shared.endpoint.recv_frame(&mut buf) {
            Ok(n) => n,
            Err(_) => break,
        };
        match decode_frame(&buf[..n]) {
            Ok(Frame::Reply(reply)) => {
                debug!(tag = reply.tag, error = reply.error, "pcie reply");
                *shared.reply.lock().unwrap() = reply;
                shared.reply_sem.post();
            }
            Ok(Frame::Request(req)) => handle_request(&shared, req),
            Err(e) => {
                warn!(error = %e, bytes = n, "undecodable frame");
                shared.count_drop();
            }
        }
    }
    debug!("dispatcher exited");
}

fn handle_request(shared: &Shared, req: RequestFrame) {
    match req.request {
        REQ_MEM_READ => serve_memory_read(shared, req),
        REQ_MEM_WRITE => serve_memory_write(shared, req),
        other => {
            warn!(request = other, "unknown request code");
            shared.count_drop();
        }
    }
}

/// The NVMe is fetching submission-queue entries or reading back block data.
fn serve_memory_read(shared: &Shared, req: RequestFrame) {
    let region = match regs::region_of(req.address) {
        Some(Region::AdminSq) => MemRegion::AdminSq,
        Some(Region::IoSq) => MemRegion::IoSq,
        Some(Region::BlockBuffer) | Some(Region::Discard) => MemRegion::Block,
        _ => {
            warn!(address = %format_args!("{:#010x}", req.address), "read from unknown region");
            shared.count_drop();
            return;
        }
    };
    debug!(
        address = %format_args!("{:#010x}", req.address),
        words = req.num_words,
        ?region,
        "bus-master read"
    );

    let word_off = (req.address as u32 & 0xFFFF) as usize / 4;
    let words = shared.mem.read_words(region, word_off, req.num_words as usize);
    let completer_id = shared.drive().completer_id();

    let mut address = req.address;
    let mut sent = 0usize;
    let mut remaining = req.num_words as usize;
    while remaining > 0 {
        let chunk = remaining.min(PCIE_MAX_PAYLOAD_WORDS);
        let reply = ReplyFrame {
            address: (address & 0xFFF) as u16,
            num_bytes: (remaining * 4) as u16,
            num_words: chunk as u16,
            tag: req.tag,
            completer_id,
            data: words[sent..sent + chunk].to_vec(),
            ..Default::default()
        };
        let wire = match reply.encode() {
            Ok(wire) => wire,
            Err(e) => {
                warn!(error = %e, "reply encode failed");
                return;
            }
        };
        if let Err(e) = shared.endpoint.send_frame(&wire) {
            warn!(error = %e, "reply send failed");
            return;
        }
        sent += chunk;
        remaining -= chunk;
        address += 4 * chunk as u64;
    }
}

/// The NVMe is posting a completion or writing data into host memory.
fn serve_memory_write(shared: &Shared, req: RequestFrame) {
    match regs::region_of(req.address) {
        Some(Region::AdminCq) => complete(shared, &req, true),
        Some(Region::IoCq) => complete(shared, &req, false),
        Some(Region::BlockBuffer) => {
            let word_off = (req.address as u32 & 0xFFFF) as usize / 4;
            debug!(word_off, words = req.data.len(), "block write");
            shared.mem.write_block(word_off, &req.data);
        }
        Some(Region::Discard) | Some(Region::Stream) => {
            let mut sink = shared.sink.lock().unwrap();
            if let Err(e) = sink.on_stream_write(&req) {
                warn!(error = %e, "stream sink failed");
            }
        }
        _ => {
            warn!(address = %format_args!("{:#010x}", req.address), "write to unknown region");
            shared.count_drop();
        }
    }
}

/// A completion-queue entry landed; advance the queue head, ring the
/// completion doorbell, record the status and wake the submitter.
fn complete(shared: &Shared, req: &RequestFrame, admin: bool) {
    let Some(entry) = CompletionEntry::from_words(&req.data) else {
        warn!(words = req.data.len(), "short completion entry");
        shared.count_drop();
        return;
    };
    debug!(
        queue = entry.sq_id,
        head = entry.sq_head,
        cid = entry.cid,
        status = %format_args!("{:#06x}", entry.status),
        "nvme completion"
    );

    let (head, bell) = {
        let mut q = if admin {
            shared.admin_q.lock().unwrap()
        } else {
            shared.io_q.lock().unwrap()
        };
        let head = q.advance_rx();
        let bell = if admin {
            regs::DOORBELL_ADMIN_CQ_HEAD
        } else {
            regs::DOORBELL_IO_CQ_HEAD
        };
        (head, bell)
    };
    // The queue mutex is released before the doorbell write; the unlock
    // orders the head update ahead of the NVMe seeing the new value.
    if !shared.config.hardware_queue_engine {
        if let Err(e) = shared.post_memory_write(bell, &[head]) {
            warn!(error = %e, "cq head doorbell failed");
        }
    }

    if entry.status != 0 {
        warn!(status = %format_args!("{:#06x}", entry.status), "nvme command failed");
    }
    shared.last_status.store(entry.status as u32, Ordering::Release);
    shared.queue_sem.post();
}
