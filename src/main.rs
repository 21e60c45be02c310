//! CLI entry point for the M2SDR streaming engine
//!
//! Provides:
//! - `info`: device and ring description, plus the effective configuration
//! - `rx`: receive samples to a file (raw CS16) or just count them
//! - `tx`: transmit a raw CS16 file or a generated tone
//!
//! # Usage
//!
//! ```bash
//! m2sdr_stream info
//! m2sdr_stream rx --samples 1000000 --output capture.cs16
//! m2sdr_stream --simulate tx --samples 100000 --burst
//! ```
//!
//! With `--simulate` the device is backed by the in-process simulated
//! channel and a helper thread plays the hardware: it produces a counter
//! pattern for RX and drains TX buffers.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use litex_m2sdr::config::M2sdrConfig;
use litex_m2sdr::dma::RingGeometry;
use litex_m2sdr::{logging, Cs16, Direction, M2sdrDevice, SimulatedChannel, StreamFlags};

#[derive(Parser)]
#[command(name = "m2sdr_stream")]
#[command(about = "Stream samples to and from a LiteX-M2SDR", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = litex_m2sdr::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Device node (overrides the configuration)
    #[arg(long)]
    device: Option<String>,

    /// Use the simulated DMA channel instead of hardware
    #[arg(long)]
    simulate: bool,

    /// Active channels, e.g. `--channels 0,1`
    #[arg(long, value_delimiter = ',')]
    channels: Option<Vec<usize>>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print device information
    Info,

    /// Receive samples
    Rx {
        /// Number of elements (frames) to receive
        #[arg(long, default_value = "1000000")]
        samples: usize,

        /// Raw CS16 output file
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Transmit samples
    Tx {
        /// Number of elements (frames) to send
        #[arg(long, default_value = "1000000")]
        samples: usize,

        /// Raw CS16 input file (a tone is generated when omitted)
        #[arg(long)]
        input: Option<PathBuf>,

        /// Mark the last buffer as end of burst
        #[arg(long)]
        burst: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = M2sdrConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if let Some(device) = cli.device {
        config.device.path = device;
    }
    if let Some(channels) = cli.channels {
        config.stream.channels = channels;
    }
    config.device.simulate |= cli.simulate;
    config.validate().context("Invalid configuration")?;
    logging::init_from_config(&config)?;

    let stop = Arc::new(AtomicBool::new(false));
    let (device, simulator) = open_device(&config, &stop)?;

    let result = match cli.command {
        Commands::Info => print_info(&device, &config),
        Commands::Rx { samples, output } => run_rx(&device, &config, samples, output),
        Commands::Tx {
            samples,
            input,
            burst,
        } => run_tx(&device, &config, samples, input, burst),
    };

    stop.store(true, Ordering::Relaxed);
    if let Some(handle) = simulator {
        let _ = handle.join();
    }
    result
}

fn open_device(
    config: &M2sdrConfig,
    stop: &Arc<AtomicBool>,
) -> Result<(M2sdrDevice, Option<thread::JoinHandle<()>>)> {
    if !config.device.simulate {
        let device = M2sdrDevice::open(config)
            .with_context(|| format!("Failed to open {}", config.device.path))?;
        return Ok((device, None));
    }

    let geometry = RingGeometry {
        buffer_size: config.device.sim_buffer_size,
        buffer_count: config.device.sim_buffer_count,
    };
    let channel = Arc::new(SimulatedChannel::new(geometry)?);
    let device = M2sdrDevice::with_channel(channel.clone(), config);
    let stop = stop.clone();
    let handle = thread::Builder::new()
        .name("m2sdr-sim".to_string())
        .spawn(move || simulate_hardware(&channel, geometry, &stop))
        .context("Failed to spawn simulator thread")?;
    Ok((device, Some(handle)))
}

/// Play the FPGA: fill RX buffers with a counter and drain TX buffers.
fn simulate_hardware(channel: &SimulatedChannel, geometry: RingGeometry, stop: &AtomicBool) {
    let mut counter: u16 = 0;
    let mut buffer = vec![0u8; geometry.buffer_size];
    while !stop.load(Ordering::Relaxed) {
        if channel.is_enabled(Direction::Rx) {
            for word in buffer.chunks_exact_mut(2) {
                word.copy_from_slice(&counter.to_le_bytes());
                counter = counter.wrapping_add(1);
            }
            channel.inject_rx(&buffer);
        }
        while channel.drain_tx().is_some() {}
        thread::sleep(Duration::from_micros(200));
    }
}

fn print_info(device: &M2sdrDevice, config: &M2sdrConfig) -> Result<()> {
    for (key, value) in device.hardware_info() {
        println!("{key:>16}: {value}");
    }
    for direction in Direction::ALL {
        let freq = device.frequency_range(direction, 0);
        let gain = device.gain_range(direction, 0);
        println!(
            "{direction}: antennas {:?}, frequency {:.0}-{:.0} Hz, gain {}..{} dB",
            device.list_antennas(direction, 0),
            freq.min,
            freq.max,
            gain.min,
            gain.max
        );
    }
    println!("clock sources: {:?}", device.list_clock_sources());
    println!("\n# Effective configuration\n{}", config.to_toml()?);
    Ok(())
}

fn run_rx(
    device: &M2sdrDevice,
    config: &M2sdrConfig,
    samples: usize,
    output: Option<PathBuf>,
) -> Result<()> {
    let channels = &config.stream.channels;
    let loopback = if config.stream.loopback { "1" } else { "0" };
    let id = device.setup_stream(Direction::Rx, "CS16", channels, &[("loopback", loopback)])?;
    device.activate_stream(id, StreamFlags::empty(), 0, 0)?;

    let mut file = output
        .as_ref()
        .map(|p| File::create(p).with_context(|| format!("Failed to create {}", p.display())))
        .transpose()?;
    let timeout = Duration::from_micros(config.stream.timeout_us);
    let mut buf = vec![Cs16::default(); device.stream_mtu(id) * channels.len()];
    let started = Instant::now();
    let mut received = 0usize;
    let mut overflows = 0usize;

    while received < samples {
        let want = (samples - received).min(buf.len() / channels.len());
        let result = device.read_stream(&mut buf[..want * channels.len()], timeout)?;
        if result.overflow {
            overflows += 1;
        }
        if result.timed_out && result.elements == 0 {
            warn!("RX timeout");
            continue;
        }
        if let Some(file) = file.as_mut() {
            let data = &buf[..result.elements * channels.len()];
            file.write_all(bytemuck::cast_slice(data))?;
        }
        received += result.elements;
    }

    device.deactivate_stream(id, StreamFlags::empty(), 0)?;
    device.close_stream(id)?;
    report(received, overflows, "overflows", started.elapsed());
    Ok(())
}

fn run_tx(
    device: &M2sdrDevice,
    config: &M2sdrConfig,
    samples: usize,
    input: Option<PathBuf>,
    burst: bool,
) -> Result<()> {
    let channels = &config.stream.channels;
    let nch = channels.len();
    let data: Vec<Cs16> = match input {
        Some(path) => {
            let mut bytes = Vec::new();
            File::open(&path)
                .and_then(|mut f| f.read_to_end(&mut bytes))
                .with_context(|| format!("Failed to read {}", path.display()))?;
            if bytes.len() % (4 * nch) != 0 {
                bail!("{} is not a whole number of CS16 frames", path.display());
            }
            bytes
                .chunks_exact(4)
                .map(|c| {
                    Cs16::new(
                        i16::from_le_bytes([c[0], c[1]]),
                        i16::from_le_bytes([c[2], c[3]]),
                    )
                })
                .collect()
        }
        None => tone(samples, nch),
    };
    let total = (data.len() / nch).min(samples);

    let loopback = if config.stream.loopback { "1" } else { "0" };
    let id = device.setup_stream(Direction::Tx, "CS16", channels, &[("loopback", loopback)])?;
    device.activate_stream(id, StreamFlags::empty(), 0, 0)?;

    let timeout = Duration::from_micros(config.stream.timeout_us);
    let chunk = device.stream_mtu(id);
    let started = Instant::now();
    let mut sent = 0usize;
    let mut underflows = 0usize;

    while sent < total {
        let n = (total - sent).min(chunk);
        let flags = if burst && sent + n == total {
            StreamFlags::END_BURST
        } else {
            StreamFlags::empty()
        };
        let result = device.write_stream(&data[sent * nch..(sent + n) * nch], flags, 0, timeout)?;
        if result.underflow {
            underflows += 1;
        }
        if result.timed_out && result.elements == 0 {
            warn!("TX timeout");
        }
        sent += result.elements;
    }

    device.deactivate_stream(id, StreamFlags::empty(), 0)?;
    device.close_stream(id)?;
    report(sent, underflows, "underflows", started.elapsed());
    Ok(())
}

/// Quarter-scale complex tone at 1/64 of the sample rate.
fn tone(samples: usize, nch: usize) -> Vec<Cs16> {
    let amplitude = litex_m2sdr::format::FULL_SCALE / 4.0;
    (0..samples)
        .flat_map(|n| {
            let phase = 2.0 * std::f64::consts::PI * n as f64 / 64.0;
            let sample = Cs16::new(
                (amplitude * phase.cos()) as i16,
                (amplitude * phase.sin()) as i16,
            );
            std::iter::repeat(sample).take(nch)
        })
        .collect()
}

fn report(elements: usize, events: usize, label: &str, elapsed: Duration) {
    let rate = elements as f64 / elapsed.as_secs_f64().max(1e-9);
    info!(elements, events, label, "Stream finished");
    println!(
        "{elements} elements in {:.3} s ({:.2} MS/s), {events} {label}",
        elapsed.as_secs_f64(),
        rate / 1e6
    );
}
