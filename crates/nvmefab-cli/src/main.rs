#![forbid(unsafe_code)]

//! Control and diagnostic CLI for the nvmefab FPGA NVMe engine.
//!
//! Thin wrapper over `nvmefab-host`: opens the bfpga board, resets and
//! configures the drives, and runs the capture/read streaming flows plus the
//! ad-hoc diagnostic commands used for bring-up.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use nvmefab_host::{
    BfpgaDevice, CaptureParams, DriveSel, NvmeTransport, ReadParams, TransportConfig,
};
use nvmefab_protocol::command::{
    OPC_ADMIN_ASYNC_EVENT, OPC_ADMIN_GET_FEATURES, OPC_ADMIN_GET_LOG_PAGE, OPC_ADMIN_IDENTIFY,
    OPC_ADMIN_SET_FEATURES, OPC_IO_READ, OPC_IO_WRITE, OPC_IO_WRITE_ZEROES,
    WRITE_ZEROES_DEALLOCATE,
};
use nvmefab_protocol::frame::{REQ_CFG_READ, REQ_CFG_WRITE};
use nvmefab_protocol::regs::{ADMIN_DATA_PRP, BLOCK_BUFFER_PRP, REG_TOTAL_BLOCKS};
use nvmefab_protocol::BLOCK_WORDS;

/// LBAs per 4 KiB block.
const LBAS_PER_BLOCK: u32 = 8;
/// LBAs covered by one trim (Write Zeroes with deallocate) command.
const TRIM_CHUNK_LBAS: u32 = 32768;

#[derive(Debug, Parser)]
#[command(
    name = "nvmefab",
    version,
    about = "Access and test an NVMe storage engine on FPGA fabric"
)]
struct Cli {
    /// Increase verbosity (repeatable).
    #[arg(short = 'v', action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Machine-readable output: one comma-separated line per capture.
    #[arg(short = 'm', global = true)]
    machine: bool,

    /// Skip the engine reset at startup.
    #[arg(long, alias = "nr", global = true)]
    no_reset: bool,

    /// Skip block validation in the read path.
    #[arg(long, alias = "nv", global = true)]
    no_validate: bool,

    /// Drive to operate on: 0, 1, or 2 for both.
    #[arg(short = 'd', default_value_t = 0, global = true)]
    drive: u32,

    /// Start block.
    #[arg(short = 's', default_value_t = 0, global = true)]
    start: u32,

    /// Number of blocks.
    #[arg(short = 'n', default_value_t = 262144, global = true)]
    num: u32,

    /// Read start block (capture-and-read; defaults to the capture range).
    #[arg(long = "rs", global = true)]
    read_start: Option<u32>,

    /// Read block count (capture-and-read; defaults to the capture range).
    #[arg(long = "rn", global = true)]
    read_num: Option<u32>,

    /// Write the reassembled read stream to this file.
    #[arg(short = 'o', global = true)]
    output: Option<PathBuf>,

    /// List subcommands and exit.
    #[arg(short = 'l')]
    list: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Command {
    /// Capture data into the drives with the FPGA write engine.
    Capture,
    /// Capture repeatedly, advancing the start block each pass.
    CaptureRepeat,
    /// Stream blocks back out through the FPGA read engine.
    Read,
    /// Capture, then stream the same range back and validate it.
    CaptureAndRead,
    /// Write one pattern block through the I/O queue.
    Write,
    /// Trim the capture range in 32k-LBA chunks.
    Trim,
    /// Trim the capture range with a single command.
    Trim1,
    /// Dump the FPGA control-block registers.
    Regs,
    /// Show engine and NVMe controller information.
    Info,
    /// PCIe config command-register read, write and read back.
    Test1,
    /// Identify-controller round trip.
    Test3,
    /// Read blocks through the I/O queue into the block buffer.
    Test4,
    /// Write pattern blocks through the I/O queue.
    Test5,
    /// Assorted admin-command pokes (features, log page, async event).
    TestMisc,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .init();

    if cli.list {
        list_commands();
        return Ok(());
    }
    let Some(command) = cli.command else {
        bail!("no subcommand given (try -l to list them)");
    };

    let drive = DriveSel::from_index(cli.drive)
        .ok_or_else(|| anyhow!("invalid drive {} (expected 0, 1 or 2)", cli.drive))?;

    let device = std::sync::Arc::new(
        BfpgaDevice::open("bfpga0").context("failed to open the bfpga board")?,
    );
    let regs = std::sync::Arc::new(device.registers());
    let transport = NvmeTransport::new(device, regs, TransportConfig::default())
        .context("failed to start the transport")?;
    transport.set_drive(drive);

    if !cli.no_reset {
        transport.reset().context("engine reset failed")?;
    }

    match command {
        Command::Capture => {
            configure(&transport)?;
            run_capture(&cli, &transport, cli.start)?;
        }
        Command::CaptureRepeat => {
            configure(&transport)?;
            let dual = transport.drive() == DriveSel::Both;
            let per_drive_total = transport.read_storage_reg(REG_TOTAL_BLOCKS);
            let total = if dual {
                per_drive_total * 2
            } else {
                per_drive_total
            };
            let mut start = cli.start;
            loop {
                run_capture(&cli, &transport, start)?;
                start += cli.num;
                if start + cli.num > total {
                    start = 0;
                }
            }
        }
        Command::Read => {
            configure(&transport)?;
            run_read(&cli, &transport, cli.start, cli.num)?;
        }
        Command::CaptureAndRead => {
            configure(&transport)?;
            run_capture(&cli, &transport, cli.start)?;
            let start = cli.read_start.unwrap_or(cli.start);
            let num = cli.read_num.unwrap_or(cli.num);
            run_read(&cli, &transport, start, num)?;
        }
        Command::Write => {
            configure(&transport)?;
            run_write(&transport, cli.start)?;
        }
        Command::Trim => {
            configure(&transport)?;
            let mut lba = cli.start * LBAS_PER_BLOCK;
            let end = lba + cli.num * LBAS_PER_BLOCK;
            while lba < end {
                let chunk = TRIM_CHUNK_LBAS.min(end - lba);
                transport
                    .submit(
                        true,
                        1,
                        OPC_IO_WRITE_ZEROES,
                        1,
                        0,
                        lba,
                        0,
                        WRITE_ZEROES_DEALLOCATE | (chunk - 1),
                    )
                    .with_context(|| format!("trim at LBA {lba}"))?;
                lba += chunk;
            }
            println!("trimmed {} blocks from block {}", cli.num, cli.start);
        }
        Command::Trim1 => {
            configure(&transport)?;
            let lbas = cli.num * LBAS_PER_BLOCK;
            transport
                .submit(
                    true,
                    1,
                    OPC_IO_WRITE_ZEROES,
                    1,
                    0,
                    cli.start * LBAS_PER_BLOCK,
                    0,
                    WRITE_ZEROES_DEALLOCATE | (lbas - 1),
                )
                .context("trim command")?;
            println!("trimmed {} blocks from block {}", cli.num, cli.start);
        }
        Command::Regs => {
            for d in [DriveSel::Drive0, DriveSel::Drive1] {
                println!("drive {:?} registers:", d);
                for (name, value) in transport.storage_register_dump(d) {
                    println!("  {name:<16} {value:#010x}");
                }
            }
        }
        Command::Info => {
            for d in transport.drive().each() {
                println!("drive {:?}:", d);
                for (name, value) in transport.storage_register_dump(*d) {
                    println!("  {name:<16} {value:#010x}");
                }
            }
            println!("nvme controller registers:");
            for (offset, value) in transport.nvme_register_dump()? {
                println!("  {offset:#05x}  {value:#010x}");
            }
        }
        Command::Test1 => {
            println!("pcie config command register read/modify/write");
            let before = transport.pcie_read(REQ_CFG_READ, 4, 1)?[0];
            println!("command register: {before:#010x}");
            transport.pcie_write(REQ_CFG_WRITE, 4, &[before | 6])?;
            let after = transport.pcie_read(REQ_CFG_READ, 4, 1)?[0];
            println!("command register: {after:#010x}");
        }
        Command::Test3 => {
            configure(&transport)?;
            transport.fill_block_buffer(0);
            transport.submit(true, 0, OPC_ADMIN_IDENTIFY, 0, ADMIN_DATA_PRP, 1, 0, 0)?;
            println!("identify controller data:");
            dump_words(&transport.block_buffer(0, 128));
        }
        Command::Test4 => {
            configure(&transport)?;
            transport.fill_block_buffer(0x0101_0101);
            transport.submit(
                true,
                1,
                OPC_IO_READ,
                1,
                BLOCK_BUFFER_PRP,
                cli.start * LBAS_PER_BLOCK,
                0,
                LBAS_PER_BLOCK - 1,
            )?;
            println!("block {}:", cli.start);
            dump_words(&transport.block_buffer(0, BLOCK_WORDS));
        }
        Command::Test5 => {
            configure(&transport)?;
            run_write(&transport, cli.start)?;
        }
        Command::TestMisc => {
            configure(&transport)?;
            println!("identify controller");
            transport.submit(true, 0, OPC_ADMIN_IDENTIFY, 0, ADMIN_DATA_PRP, 1, 0, 0)?;
            println!("namespace list");
            transport.submit(true, 0, OPC_ADMIN_IDENTIFY, 0, ADMIN_DATA_PRP, 2, 0, 0)?;
            println!("set asynchronous event feature");
            transport.submit(
                true,
                0,
                OPC_ADMIN_SET_FEATURES,
                0,
                ADMIN_DATA_PRP,
                0x0B,
                0xFFFF_FFFF,
                0,
            )?;
            println!("get asynchronous event feature");
            transport.submit(true, 0, OPC_ADMIN_GET_FEATURES, 0, ADMIN_DATA_PRP, 0x0B, 0, 0)?;
            println!("error log page");
            transport.submit(
                true,
                0,
                OPC_ADMIN_GET_LOG_PAGE,
                0,
                ADMIN_DATA_PRP,
                0x0010_0001,
                0,
                0,
            )?;
            println!("queue an asynchronous event request");
            transport.submit(false, 0, OPC_ADMIN_ASYNC_EVENT, 0, 0, 0, 0, 0)?;
            std::thread::sleep(Duration::from_secs(1));
        }
    }

    Ok(())
}

/// Bring the selected drives up after the startup reset.
fn configure(transport: &NvmeTransport) -> Result<()> {
    transport.init().context("nvme bring-up failed")?;
    Ok(())
}

fn run_capture(cli: &Cli, transport: &NvmeTransport, start: u32) -> Result<()> {
    let stats = transport.capture(&CaptureParams {
        start_block: start,
        num_blocks: cli.num,
    })?;
    if cli.machine {
        println!(
            "{}, {}, {:.1}, {}",
            stats.error_status, stats.start_block, stats.mbytes_per_sec, stats.peak_latency_us
        );
    } else {
        println!(
            "captured {} blocks from {} in {:.2}s: {:.1} MB/s, peak latency {} us",
            stats.blocks,
            stats.start_block,
            stats.elapsed.as_secs_f64(),
            stats.mbytes_per_sec,
            stats.peak_latency_us
        );
    }
    if stats.error_status != 0 {
        bail!("capture failed with error status {:#010x}", stats.error_status);
    }
    Ok(())
}

fn run_read(cli: &Cli, transport: &NvmeTransport, start: u32, num: u32) -> Result<()> {
    let stats = transport.stream_read(&ReadParams {
        start_block: start,
        num_blocks: num,
        validate: !cli.no_validate,
        output: cli.output.clone(),
    })?;
    println!(
        "read {} blocks in {:.2}s: {:.1} MB/s",
        stats.blocks,
        stats.elapsed.as_secs_f64(),
        stats.mbytes_per_sec
    );
    Ok(())
}

/// Stage a pattern block and write it through I/O queue 1.
fn run_write(transport: &NvmeTransport, block: u32) -> Result<()> {
    let seed = (std::process::id() & 0xFF) << 24;
    let pattern: Vec<u32> = (0..BLOCK_WORDS as u32).map(|w| seed | w).collect();
    transport.load_block_buffer(&pattern);
    info!(block, seed = %format_args!("{seed:#010x}"), "block write");
    transport.submit(
        true,
        1,
        OPC_IO_WRITE,
        1,
        BLOCK_BUFFER_PRP,
        block * LBAS_PER_BLOCK,
        0,
        LBAS_PER_BLOCK - 1,
    )?;
    println!("wrote block {block}");
    Ok(())
}

fn dump_words(words: &[u32]) {
    for (i, chunk) in words.chunks(8).enumerate() {
        print!("{:#06x}:", i * 32);
        for w in chunk {
            print!(" {w:08x}");
        }
        println!();
    }
}

fn list_commands() {
    println!("capture           capture data into the drives with the FPGA write engine");
    println!("capture-repeat    capture repeatedly, advancing the start block each pass");
    println!("read              stream blocks back out through the FPGA read engine");
    println!("capture-and-read  capture, then stream the same range back and validate it");
    println!("write             write one pattern block through the I/O queue");
    println!("trim              trim the capture range in 32k-LBA chunks");
    println!("trim1             trim the capture range with a single command");
    println!("regs              dump the FPGA control-block registers");
    println!("info              show engine and NVMe controller information");
    println!("test1             pcie config command-register read, write and read back");
    println!("test3             identify-controller round trip");
    println!("test4             read blocks through the I/O queue into the block buffer");
    println!("test5             write pattern blocks through the I/O queue");
    println!("test-misc         assorted admin-command pokes");
}
