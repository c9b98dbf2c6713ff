//! The DMA endpoint seam and the production bfpga character-device backend.
//!
//! The kernel driver exposes three nodes per board:
//! - `/dev/bfpga0`: register window (mmap) plus a `GET_INFO` ioctl describing
//!   the physical layout of the register and DMA-control BARs
//! - `/dev/bfpga0-send0`: DMA send stream; one `write()` delivers exactly one
//!   framed packet
//! - `/dev/bfpga0-recv0`: DMA receive stream; one `read()` returns exactly
//!   one framed packet, `FIONREAD` reports bytes queued
//!
//! Keep this module as the only place that refers to `libc`; everything above
//! it talks to the [`DmaEndpoint`] and [`crate::regbus::RegisterBus`] traits.

use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{Error, Result};
use crate::regbus::RegisterBus;

/// One framed DMA stream pair plus frame availability.
///
/// Contract: at most one sender and one receiver at a time. The dispatcher
/// owns `recv_frame` exclusively; `send_frame` may be called from any thread
/// and is serialized internally.
pub trait DmaEndpoint: Send + Sync {
    /// Write one whole frame. A short write is a transport failure.
    fn send_frame(&self, frame: &[u8]) -> Result<()>;

    /// Block until one whole frame arrives; returns its size in bytes.
    fn recv_frame(&self, buf: &mut [u8]) -> Result<usize>;

    /// Bytes immediately available on the receive stream, without blocking.
    fn readable(&self) -> usize;

    /// Close the underlying streams so a blocked `recv_frame` returns an
    /// error. Idempotent.
    fn shutdown(&self);
}

/// A physical memory span as reported by the driver.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BfpgaMem {
    pub phys_address: u64,
    pub length: u64,
}

/// Layout returned by the `GET_INFO` ioctl.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BfpgaInfo {
    pub regs: BfpgaMem,
    pub dma_regs: BfpgaMem,
    pub dma_channels: [BfpgaMem; 8],
}

// _IOR('Z', 0, BFpgaInfo)
const BFPGA_IOC_READ: u64 = 2;
const BFPGA_IOC_TYPE: u64 = b'Z' as u64;

const fn bfpga_ior<T>(nr: u64) -> u64 {
    (BFPGA_IOC_READ << 30) | ((std::mem::size_of::<T>() as u64) << 16) | (BFPGA_IOC_TYPE << 8) | nr
}

const BFPGA_CMD_GETINFO: u64 = bfpga_ior::<BfpgaInfo>(0);

fn last_errno(what: &str) -> Error {
    Error::Transport(format!("{what}: {}", std::io::Error::last_os_error()))
}

/// A live mmap of the register BAR. Dropped with the last handle.
struct RegMapping {
    base: *mut u32,
    length: usize,
}

// The mapping is a fixed non-cacheable hardware window; concurrent volatile
// access is the device contract.
unsafe impl Send for RegMapping {}
unsafe impl Sync for RegMapping {}

impl Drop for RegMapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.cast(), self.length);
        }
    }
}

/// Volatile 32-bit access to the mmap'd FPGA register window.
#[derive(Clone)]
pub struct MmapRegisters {
    mapping: Arc<RegMapping>,
}

impl RegisterBus for MmapRegisters {
    fn read_reg(&self, offset: u32) -> u32 {
        let index = (offset / 4) as usize;
        assert!(offset % 4 == 0 && index < self.mapping.length / 4);
        unsafe { self.mapping.base.add(index).read_volatile() }
    }

    fn write_reg(&self, offset: u32, value: u32) {
        let index = (offset / 4) as usize;
        assert!(offset % 4 == 0 && index < self.mapping.length / 4);
        unsafe { self.mapping.base.add(index).write_volatile(value) }
    }
}

/// The bfpga board: register window plus the framed DMA stream pair.
pub struct BfpgaDevice {
    regs_fd: libc::c_int,
    send_fd: Mutex<libc::c_int>,
    recv_fd: libc::c_int,
    info: BfpgaInfo,
    mapping: Arc<RegMapping>,
    closed: AtomicBool,
}

impl BfpgaDevice {
    /// Open the board at `/dev/<name>` (`bfpga0` for the first board) along
    /// with its send/receive stream nodes, and map the register BAR.
    pub fn open(name: &str) -> Result<BfpgaDevice> {
        let regs_fd = open_node(&format!("/dev/{name}"), libc::O_RDWR | libc::O_SYNC)?;

        let mut info = BfpgaInfo::default();
        let rc = unsafe { libc::ioctl(regs_fd, BFPGA_CMD_GETINFO as _, &mut info) };
        if rc < 0 {
            let err = last_errno("GET_INFO ioctl");
            unsafe { libc::close(regs_fd) };
            return Err(err);
        }
        debug!(
            regs = %format_args!("{:#x}({:#x})", info.regs.phys_address, info.regs.length),
            "bfpga driver info"
        );

        let length = info.regs.length as usize;
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                regs_fd,
                info.regs.phys_address as libc::off_t,
            )
        };
        if base == libc::MAP_FAILED {
            let err = last_errno("mmap register window");
            unsafe { libc::close(regs_fd) };
            return Err(err);
        }
        let mapping = Arc::new(RegMapping {
            base: base.cast(),
            length,
        });

        let send_fd = match open_node(&format!("/dev/{name}-send0"), libc::O_RDWR) {
            Ok(fd) => fd,
            Err(e) => {
                unsafe { libc::close(regs_fd) };
                return Err(e);
            }
        };
        let recv_fd = match open_node(&format!("/dev/{name}-recv0"), libc::O_RDWR) {
            Ok(fd) => fd,
            Err(e) => {
                unsafe {
                    libc::close(send_fd);
                    libc::close(regs_fd);
                }
                return Err(e);
            }
        };

        Ok(BfpgaDevice {
            regs_fd,
            send_fd: Mutex::new(send_fd),
            recv_fd,
            info,
            mapping,
            closed: AtomicBool::new(false),
        })
    }

    /// Driver-reported BAR layout.
    pub fn info(&self) -> &BfpgaInfo {
        &self.info
    }

    /// A register-bus handle over the mmap'd window. The mapping stays valid
    /// for as long as any handle lives.
    pub fn registers(&self) -> MmapRegisters {
        MmapRegisters {
            mapping: Arc::clone(&self.mapping),
        }
    }
}

fn open_node(path: &str, flags: libc::c_int) -> Result<libc::c_int> {
    let cpath =
        CString::new(path).map_err(|_| Error::Transport(format!("bad device path {path}")))?;
    let fd = unsafe { libc::open(cpath.as_ptr(), flags) };
    if fd < 0 {
        return Err(last_errno(&format!("open {path}")));
    }
    Ok(fd)
}

impl DmaEndpoint for BfpgaDevice {
    fn send_frame(&self, frame: &[u8]) -> Result<()> {
        let fd = self.send_fd.lock().unwrap();
        let n = unsafe { libc::write(*fd, frame.as_ptr().cast(), frame.len()) };
        if n != frame.len() as isize {
            return Err(Error::Transport(format!(
                "short frame send: {n} of {}",
                frame.len()
            )));
        }
        Ok(())
    }

    fn recv_frame(&self, buf: &mut [u8]) -> Result<usize> {
        let n = unsafe { libc::read(self.recv_fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n <= 0 {
            return Err(last_errno("frame recv"));
        }
        Ok(n as usize)
    }

    fn readable(&self) -> usize {
        let mut n: libc::c_ulong = 0;
        let rc = unsafe { libc::ioctl(self.recv_fd, libc::FIONREAD, &mut n) };
        if rc < 0 {
            return 0;
        }
        n as usize
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing bfpga streams");
        unsafe {
            libc::close(self.recv_fd);
            libc::close(*self.send_fd.lock().unwrap());
            libc::close(self.regs_fd);
        }
    }
}

impl Drop for BfpgaDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}
