//! ad_sim_server - simulated area-detector frame source.
//!
//! Serves random or directory-replayed frames on a channel at a fixed rate
//! until the runtime is reached or Ctrl-C is pressed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;
use crossbeam_channel::bounded;

use edge_bragg::channel::{ChannelServer, RecordServer};
use edge_bragg::codec::CodecKind;
use edge_bragg::config::SimulatorConfig;
use edge_bragg::simulator::FrameSimulator;
use edge_bragg::ui::{Ui, UiMode};

#[derive(Parser, Debug)]
#[command(author, version, about = "Publish simulated detector frames on a channel")]
struct Args {
    /// Directory of images to replay; random frames when omitted.
    #[arg(long, short = 'i')]
    input_directory: Option<PathBuf>,

    /// Frames per second (0 publishes as fast as possible).
    #[arg(long)]
    frame_rate: Option<f64>,

    /// Random frame width in pixels.
    #[arg(long)]
    nx: Option<usize>,

    /// Random frame height in pixels.
    #[arg(long)]
    ny: Option<usize>,

    /// Stop after this many seconds of publishing.
    #[arg(long)]
    runtime: Option<f64>,

    /// Channel name.
    #[arg(long)]
    channel: Option<String>,

    /// Seconds to wait before the first frame.
    #[arg(long)]
    start_delay: Option<f64>,

    /// Log every n-th published frame.
    #[arg(long)]
    report_frequency: Option<u64>,

    /// Channel server bind address.
    #[arg(long)]
    bind_addr: Option<String>,

    /// Payload codec: none or lz4.
    #[arg(long)]
    codec: Option<String>,

    /// Output mode for startup stages.
    #[arg(long, value_enum, default_value_t = UiMode::Auto)]
    ui: UiMode,
}

fn seconds(value: f64, flag: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| anyhow!("--{} must be non-negative, got {}", flag, value))
}

fn apply_args(cfg: &mut SimulatorConfig, args: &Args) -> Result<()> {
    if args.input_directory.is_some() {
        cfg.input_directory = args.input_directory.clone();
    }
    cfg.frame_rate = args.frame_rate.unwrap_or(cfg.frame_rate);
    cfg.nx = args.nx.unwrap_or(cfg.nx);
    cfg.ny = args.ny.unwrap_or(cfg.ny);
    if let Some(runtime) = args.runtime {
        cfg.runtime = seconds(runtime, "runtime")?;
    }
    if let Some(channel) = &args.channel {
        cfg.channel = channel.clone();
    }
    if let Some(delay) = args.start_delay {
        cfg.start_delay = seconds(delay, "start-delay")?;
    }
    cfg.report_frequency = args.report_frequency.unwrap_or(cfg.report_frequency);
    if let Some(addr) = &args.bind_addr {
        cfg.bind_addr = addr.clone();
    }
    if let Some(codec) = &args.codec {
        cfg.codec = CodecKind::from_name(codec);
    }
    cfg.validate()
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = Ui::detect(args.ui);

    let cfg = {
        let _stage = ui.stage("Load configuration");
        let mut cfg = SimulatorConfig::load()?;
        apply_args(&mut cfg, &args)?;
        cfg
    };

    let server = {
        let _stage = ui.stage("Start channel server");
        Arc::new(ChannelServer::bind(&cfg.bind_addr)?)
    };
    let records: Arc<dyn RecordServer> = server.clone();
    let simulator = FrameSimulator::new(cfg, records)?;

    let (tx, rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    })
    .expect("error setting Ctrl-C handler");

    let outcome = simulator.run(rx);
    server.stop()?;
    let summary = outcome?;
    println!("\nServer runtime: {:.4} seconds", summary.runtime);
    println!(
        "Published frames: {:6} @ {:.4} fps",
        summary.published, summary.rate
    );
    Ok(())
}
