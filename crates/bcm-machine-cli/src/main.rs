#![forbid(unsafe_code)]

//! Native smoke runner for the BCM2835 peripheral models.
//!
//! There is no CPU model: the runner plays the guest itself. It requests a framebuffer over the
//! mailbox, programs a periodic scheduler tick on system timer channel 1 and services the
//! resulting interrupts, stepping virtual time from one deadline to the next.

use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use bcm_devices::framebuffer::{DisplaySurface, ScanoutFrame};
use bcm_devices::mailbox::MailboxChannelId;
use bcm_io_snapshot::io::state::IoSnapshot;
use bcm_platform::interrupts::IrqSource;
use bcm_platform::memory_map::{mailbox_device_base, SYSTEM_TIMER_BASE};
use bcm_platform::{Bcm2835, PlatformConfig};
use bcm_time::{Clock, ManualClock};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const DESCRIPTOR_ADDR: u32 = 0x1000;
const FB_MBOX: u64 = mailbox_device_base(MailboxChannelId::FRAMEBUFFER);

const ST_CS: u64 = SYSTEM_TIMER_BASE;
const ST_CLO: u64 = SYSTEM_TIMER_BASE + 0x04;
const ST_C1: u64 = SYSTEM_TIMER_BASE + 0x10;
const TICK_CHANNEL: u8 = 1;

const NS_PER_MS: u64 = 1_000_000;

#[derive(Debug, Clone, Copy)]
struct Mode {
    width: u32,
    height: u32,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once('x')
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s:?}"))?;
        let parse = |v: &str| v.parse::<u32>().map_err(|e| format!("{v:?}: {e}"));
        Ok(Self {
            width: parse(w)?,
            height: parse(h)?,
        })
    }
}

#[derive(Debug, Parser)]
#[command(about = "Scripted guest session against the BCM2835 peripheral models")]
struct Args {
    /// Platform config (JSON). Defaults to a 256 MiB board.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Guest RAM size in MiB (overrides the config file).
    #[arg(long)]
    ram: Option<u64>,

    /// Virtual time to run for, in milliseconds.
    #[arg(long, default_value_t = 100)]
    duration_ms: u64,

    /// Scheduler tick period programmed on system timer channel 1, in microseconds.
    #[arg(long, default_value_t = 10_000)]
    tick_us: u32,

    /// Framebuffer mode the guest requests.
    #[arg(long, default_value = "640x480")]
    mode: Mode,

    /// Colour depth the guest requests.
    #[arg(long, default_value_t = 16)]
    bpp: u32,

    /// Save the device snapshot on exit.
    #[arg(long)]
    snapshot_save: Option<PathBuf>,
}

/// Display stand-in that fingerprints every presented frame.
#[derive(Debug, Default)]
struct ChecksumSurface {
    size: (u32, u32),
    frames: u64,
    full_repaints: u64,
    checksum: u32,
}

impl DisplaySurface for ChecksumSurface {
    fn resize(&mut self, width: u32, height: u32) {
        debug!(width, height, "surface resized");
        self.size = (width, height);
    }

    fn present(&mut self, frame: &ScanoutFrame<'_>) -> bool {
        // FNV-1a
        self.checksum = frame.pixels.iter().fold(0x811c_9dc5, |hash, &b| {
            (hash ^ u32::from(b)).wrapping_mul(0x0100_0193)
        });
        self.frames += 1;
        self.full_repaints += u64::from(frame.full_repaint);
        true
    }
}

#[derive(Debug, Default)]
struct Summary {
    timer_ticks: u64,
    irq_events: usize,
}

fn load_config(args: &Args) -> Result<PlatformConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let json = fs::read_to_string(path)
                .with_context(|| format!("failed to read config: {}", path.display()))?;
            PlatformConfig::from_json(&json)
                .with_context(|| format!("invalid config: {}", path.display()))?
        }
        None => PlatformConfig::default(),
    };
    if let Some(ram_mib) = args.ram {
        config.ram_size_bytes = ram_mib
            .checked_mul(1024 * 1024)
            .context("RAM size overflow")?;
        config.validate()?;
    }
    Ok(config)
}

fn request_framebuffer(machine: &mut Bcm2835<ManualClock>, args: &Args) -> Result<()> {
    let addr = u64::from(DESCRIPTOR_ADDR);
    let Mode { width, height } = args.mode;
    let request = [width, height, width, height, 0, args.bpp, 0, 0, 0, 0];
    for (i, word) in request.into_iter().enumerate() {
        machine.write_u32(addr + 4 * i as u64, word);
    }

    machine.write_u32(FB_MBOX, DESCRIPTOR_ADDR);
    machine.poll().context("guest framebuffer request failed")?;

    let channel = machine.read_u32(FB_MBOX);
    if channel != MailboxChannelId::FRAMEBUFFER.raw() {
        bail!("framebuffer mailbox acknowledged as channel {channel}");
    }
    Ok(())
}

/// The guest's timer interrupt handler: re-arm the tick channel, then acknowledge it.
fn service_timer(machine: &mut Bcm2835<ManualClock>, tick_us: u32) -> bool {
    let matched = machine.read_u32(ST_CS);
    if matched & (1 << TICK_CHANNEL) == 0 {
        return false;
    }
    let next = machine.read_u32(ST_C1).wrapping_add(tick_us);
    machine.write_u32(ST_C1, next);
    machine.write_u32(ST_CS, 1 << TICK_CHANNEL);
    true
}

fn run_session(
    args: &Args,
    clock: &ManualClock,
    machine: &mut Bcm2835<ManualClock>,
    surface: &mut ChecksumSurface,
) -> Result<Summary> {
    request_framebuffer(machine, args)?;

    // Every compare resets to 0, so all four channels latch on the first poll. Only the tick
    // channel is ever acknowledged; the others stay latched and never fire again.
    let clo = machine.read_u32(ST_CLO);
    machine.write_u32(ST_C1, clo.wrapping_add(args.tick_us));
    machine.write_u32(ST_CS, 1 << TICK_CHANNEL);

    let end_ns = args
        .duration_ms
        .checked_mul(NS_PER_MS)
        .context("duration overflow")?;
    let mut summary = Summary::default();

    while clock.now_ns() < end_ns {
        let next = machine.next_deadline_ns().unwrap_or(end_ns).min(end_ns);
        clock.set_ns(next.max(clock.now_ns()));

        let outcome = machine.poll()?;
        if outcome.timer_ticks > 0 {
            let irq_pending = machine
                .interrupts()
                .is_asserted(IrqSource::SystemTimer(TICK_CHANNEL));
            if service_timer(machine, args.tick_us) && irq_pending {
                summary.timer_ticks += 1;
            }
        }
        if outcome.vblank {
            machine.refresh_display(surface);
        }
        summary.irq_events += machine.take_irq_events().len();
    }
    Ok(summary)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let clock = ManualClock::new();
    let mut machine = Bcm2835::with_clock(config, clock.clone())?;
    info!(?config, "starting session");

    let mut surface = ChecksumSurface::default();
    let summary = run_session(&args, &clock, &mut machine, &mut surface)?;

    let fb = machine.framebuffer_config();
    println!(
        "framebuffer {}x{} pitch={} base=0x{:08x} size={}",
        fb.xres, fb.yres, fb.pitch, fb.base, fb.size
    );
    println!(
        "timer ticks={} irq_events={}",
        summary.timer_ticks, summary.irq_events
    );
    println!(
        "display {}x{} frames={} full_repaints={} checksum=0x{:08x}",
        surface.size.0, surface.size.1, surface.frames, surface.full_repaints, surface.checksum
    );

    if let Some(path) = &args.snapshot_save {
        fs::write(path, machine.save_state())
            .with_context(|| format!("failed to write snapshot: {}", path.display()))?;
    }
    Ok(())
}
