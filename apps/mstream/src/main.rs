//! Multi-stream throughput driver.
//!
//! Brings up fixed-size-buffer stream (or memory) channel pairs on an XDMA
//! endpoint behind VFIO, keeps every ring full from one polling loop and
//! prints interval throughput until Ctrl-C. Exits non-zero if any stream
//! latches a failure.
//!
//! ```bash
//! xdma-mstream 0000:2f:00.0 --pairs 0:0 --pairs 1:1 --buffer-size 0x10000
//! ```

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use xdma_bridge::hal::vfio::VfioPciDevice;
use xdma_bridge::hal::{BackingKind, DesignInfo, DmaAccess, StreamRoute, XdmaDevice};
use xdma_bridge::{
    ChannelConfig, ChannelDirection, DmaArena, EndpointKind, MultiStreamDriver, XdmaChannel,
    channel_counts, install_stop_handler,
};

fn parse_maybe_hex(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("bad number {s:?}: {e}"))
}

/// Drive XDMA channel pairs at full tilt and report throughput.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// PCI address of the endpoint (e.g. 0000:2f:00.0), bound to vfio-pci.
    device: String,

    /// BAR carrying the DMA bridge control registers.
    #[arg(long, default_value_t = 0)]
    bar: u32,

    /// Card memory size behind the bridge; 0 for AXI4-Stream designs.
    #[arg(long, value_parser = parse_maybe_hex, default_value = "0")]
    memory_size: u64,

    /// H2C:C2H channel pairings to drive (repeatable).
    #[arg(long, default_value = "0:0")]
    pairs: Vec<StreamRoute>,

    /// Ring slots per channel.
    #[arg(long, default_value_t = 16)]
    num_descriptors: u32,

    /// Bytes per fixed-size buffer.
    #[arg(long, value_parser = parse_maybe_hex, default_value = "0x10000")]
    buffer_size: u64,

    /// Seconds between throughput reports.
    #[arg(long, default_value_t = 10)]
    interval: u64,

    /// Back DMA buffers with huge pages instead of heap memory.
    #[arg(long)]
    huge_pages: bool,
}

fn bring_up_channels(
    device: &mut VfioPciDevice,
    design: &DesignInfo,
    args: &Args,
    success: &Arc<AtomicBool>,
) -> Result<Vec<XdmaChannel>, String> {
    let (num_h2c, num_c2h) = channel_counts(device, design);
    info!(
        "{}: {num_h2c} H2C and {num_c2h} C2H channels respond",
        args.device
    );

    let backing = if args.huge_pages {
        BackingKind::HugePages
    } else {
        BackingKind::Heap
    };
    let endpoint = EndpointKind::from_design(design);
    let buffer_bytes = args.buffer_size as usize * args.num_descriptors as usize;

    let mut channels = Vec::new();
    for route in &args.pairs {
        if route.h2c_channel_id >= num_h2c || route.c2h_channel_id >= num_c2h {
            return Err(format!(
                "route {}:{} outside the responding channels",
                route.h2c_channel_id, route.c2h_channel_id
            ));
        }
        for (direction, channel_id, access) in [
            (ChannelDirection::HostToCard, route.h2c_channel_id, DmaAccess::Read),
            (ChannelDirection::CardToHost, route.c2h_channel_id, DmaAccess::Write),
        ] {
            let data = device
                .allocate_dma(buffer_bytes, access, backing)
                .map_err(|e| format!("data mapping for {direction}{channel_id}: {e}"))?;
            let config = ChannelConfig::new(direction, channel_id)
                .with_num_descriptors(args.num_descriptors)
                .with_bytes_per_buffer(args.buffer_size as u32)
                .with_data_mapping(data)
                .with_success_flag(Arc::clone(success));
            let descriptors = device
                .allocate_dma(
                    config.descriptor_allocation_size(endpoint),
                    DmaAccess::ReadWrite,
                    BackingKind::Heap,
                )
                .map_err(|e| format!("descriptor mapping for {direction}{channel_id}: {e}"))?;
            let mut arena = DmaArena::new(descriptors);
            let channel = XdmaChannel::initialise(&*device, design, config, &mut arena)
                .map_err(|e| format!("{direction}{channel_id}: {e}"))?;
            channels.push(channel);
        }
    }
    Ok(channels)
}

fn run() -> Result<bool, String> {
    let args = Args::parse();
    let design = DesignInfo {
        dma_bridge_bar_index: args.bar,
        dma_bridge_memory_size_bytes: args.memory_size,
        design_id: 0,
    };

    let mut device =
        VfioPciDevice::open(&args.device).map_err(|e| format!("{}: {e}", args.device))?;
    let success = Arc::new(AtomicBool::new(true));
    let channels = bring_up_channels(&mut device, &design, &args, &success)?;

    let driver = MultiStreamDriver::new(channels)
        .with_report_interval(Duration::from_secs(args.interval.max(1)));
    let stop = driver.stop_flag();
    install_stop_handler(Arc::clone(&stop)).map_err(|e| format!("signal handler: {e}"))?;
    info!("streaming; Ctrl-C stops");

    let (handle, snapshots) = driver.spawn();
    for snapshot in &snapshots {
        info!(
            "interval {:>6.2}s  {:>9.2} MB/s",
            snapshot.elapsed.as_secs_f64(),
            snapshot.megabytes_per_second()
        );
        for stream in &snapshot.streams {
            info!(
                "  {}{}: {} transfers, {} bytes",
                stream.direction, stream.channel_id, stream.interval.transfers, stream.interval.bytes
            );
        }
    }

    let report = handle.join().map_err(|_| "driver thread panicked".to_string())?;
    for stream in &report.streams {
        info!(
            "{}{} total: {} transfers, {} bytes",
            stream.direction, stream.channel_id, stream.overall.transfers, stream.overall.bytes
        );
    }
    for failure in &report.failures {
        error!("{failure}");
    }
    Ok(report.success)
}

fn main() -> ExitCode {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .expect("logger");

    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(message) => {
            error!("{message}");
            ExitCode::FAILURE
        }
    }
}
