//! edge_bragg - Bragg peak refinement pipeline.
//!
//! Subscribes to a detector channel, crops patches around peaks, refines them
//! in batches and writes the results to the configured sinks. Runs until the
//! channel has been silent for the idle interval or Ctrl-C is pressed.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossbeam_channel::bounded;

use edge_bragg::channel::{ChannelServer, RecordServer};
use edge_bragg::config::{ArchiveSettings, BroadcastSettings, LiveSettings, PipelineConfig};
use edge_bragg::extract::{PatchExtractor, PeakPatchExtractor};
use edge_bragg::infer::{load_model, ModelBackend};
use edge_bragg::pipeline::run_pipeline;
use edge_bragg::sink::{
    ArchiveWriter, AsyncWriter, BroadcastWriter, FanOut, LiveRepublisher, MqttTransport,
};
use edge_bragg::ui::{Ui, UiMode};

#[derive(Parser, Debug)]
#[command(author, version, about = "Bragg peak refinement on streaming detector frames")]
struct Args {
    /// Detector channel to subscribe to.
    #[arg(long)]
    channel: Option<String>,

    /// Channel server address.
    #[arg(long)]
    server_addr: Option<String>,

    /// Patches per inference batch.
    #[arg(long)]
    mbsz: Option<usize>,

    /// Patch edge length in pixels (odd).
    #[arg(long)]
    psz: Option<usize>,

    /// Decode/extract worker threads.
    #[arg(long)]
    workers: Option<usize>,

    /// Pixels above this value count as peak pixels.
    #[arg(long)]
    min_intensity: Option<f32>,

    /// Stop after this many seconds without new frames.
    #[arg(long)]
    idle_secs: Option<f64>,

    /// Send the undersized last batch of each worker to inference on shutdown.
    #[arg(long)]
    flush_on_shutdown: bool,

    /// Warn when a queue grows beyond this depth.
    #[arg(long)]
    high_watermark: Option<usize>,

    /// Refinement backend: stub, centroid or tract.
    #[arg(long, env = "EDGE_BRAGG_MODEL_BACKEND")]
    model_backend: Option<String>,

    /// ONNX model file for the tract backend.
    #[arg(long, env = "EDGE_BRAGG_MODEL_PATH")]
    model_path: Option<PathBuf>,

    /// Archive file for refined results.
    #[arg(long)]
    archive: Option<PathBuf>,

    /// Do not write an archive.
    #[arg(long, conflicts_with = "archive")]
    no_archive: bool,

    /// Compress archive chunks.
    #[arg(long)]
    compress: bool,

    /// MQTT broker to broadcast results to.
    #[arg(long, env = "EDGE_BRAGG_MQTT_BROKER")]
    mqtt_broker: Option<String>,

    /// MQTT topic for broadcast results.
    #[arg(long)]
    mqtt_topic: Option<String>,

    /// Republish refined patches on this channel.
    #[arg(long)]
    live_channel: Option<String>,

    /// Bind address of the live channel server.
    #[arg(long)]
    live_bind: Option<String>,

    /// Maximum live records per second.
    #[arg(long)]
    live_freq: Option<f64>,

    /// Write log lines to this file.
    #[arg(long, env = "EDGE_BRAGG_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// With --log-file, do not also log to stderr.
    #[arg(long, requires = "log_file")]
    quiet: bool,

    /// Output mode for startup stages.
    #[arg(long, value_enum, default_value_t = UiMode::Auto)]
    ui: UiMode,
}

/// Log sink writing to a file and, unless quiet, to stderr.
struct LogTee {
    file: File,
    echo: bool,
}

impl Write for LogTee {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.echo {
            std::io::stderr().write_all(buf)?;
        }
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

fn init_logging(args: &Args) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = &args.log_file {
        let file = File::create(path)
            .with_context(|| format!("cannot create log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(LogTee {
            file,
            echo: !args.quiet,
        })));
    }
    builder.init();
    Ok(())
}

fn apply_args(cfg: &mut PipelineConfig, args: &Args) -> Result<()> {
    if let Some(channel) = &args.channel {
        cfg.channel = channel.clone();
    }
    if let Some(addr) = &args.server_addr {
        cfg.server_addr = addr.clone();
    }
    cfg.mbsz = args.mbsz.unwrap_or(cfg.mbsz);
    cfg.psz = args.psz.unwrap_or(cfg.psz);
    cfg.workers = args.workers.unwrap_or(cfg.workers);
    cfg.min_intensity = args.min_intensity.unwrap_or(cfg.min_intensity);
    if let Some(secs) = args.idle_secs {
        cfg.idle_interval = Duration::try_from_secs_f64(secs)
            .map_err(|_| anyhow!("--idle-secs must be non-negative, got {}", secs))?;
    }
    cfg.flush_on_shutdown |= args.flush_on_shutdown;
    if args.high_watermark.is_some() {
        cfg.high_watermark = args.high_watermark;
    }
    if let Some(backend) = &args.model_backend {
        cfg.model.backend = backend.parse::<ModelBackend>()?;
    }
    if let Some(path) = &args.model_path {
        cfg.model.path = Some(path.clone());
    }
    if args.no_archive {
        cfg.archive = None;
    } else if let Some(path) = &args.archive {
        cfg.archive = Some(ArchiveSettings {
            path: path.clone(),
            compression: args.compress,
        });
    } else if let Some(archive) = cfg.archive.as_mut() {
        archive.compression |= args.compress;
    }
    if let Some(broker) = &args.mqtt_broker {
        cfg.broadcast = Some(BroadcastSettings::with_broker(broker));
    }
    if let (Some(topic), Some(broadcast)) = (&args.mqtt_topic, cfg.broadcast.as_mut()) {
        broadcast.topic = topic.clone();
    }
    if let Some(channel) = &args.live_channel {
        cfg.live = Some(LiveSettings::with_channel(channel));
    }
    if let Some(live) = cfg.live.as_mut() {
        if let Some(addr) = &args.live_bind {
            live.bind_addr = addr.clone();
        }
        if let Some(freq) = args.live_freq {
            live.freq = freq;
        }
    }
    cfg.validate()
}

fn build_sinks(cfg: &PipelineConfig) -> Result<(FanOut, Option<Arc<ChannelServer>>)> {
    let mut fanout = FanOut::new();
    if let Some(archive) = &cfg.archive {
        fanout.push(AsyncWriter::spawn(ArchiveWriter::new(
            &archive.path,
            archive.compression,
        ))?);
        log::info!("archiving results to {}", archive.path.display());
    }
    if let Some(broadcast) = &cfg.broadcast {
        let transport = MqttTransport::connect(&broadcast.broker, &broadcast.client_id)?;
        fanout.push(AsyncWriter::spawn(BroadcastWriter::new(
            Box::new(transport),
            &broadcast.topic,
        ))?);
    }
    let mut live_server = None;
    if let Some(live) = &cfg.live {
        let server = Arc::new(ChannelServer::bind(&live.bind_addr)?);
        log::info!(
            "live results on channel '{}' at {}",
            live.channel,
            server.local_addr()
        );
        let records: Arc<dyn RecordServer> = server.clone();
        fanout.push(AsyncWriter::spawn(
            LiveRepublisher::new(records, &live.channel, live.freq)
                .with_setup_delay(live.setup_delay),
        )?);
        live_server = Some(server);
    }
    if fanout.is_empty() {
        log::warn!("no sinks configured; refined results will be discarded");
    }
    Ok((fanout, live_server))
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;
    let ui = Ui::detect(args.ui);

    let cfg = {
        let _stage = ui.stage("Load configuration");
        let mut cfg = PipelineConfig::load()?;
        apply_args(&mut cfg, &args)?;
        cfg
    };
    log::info!("{:?}", cfg);

    let model = {
        let stage = ui.stage("Load refinement model");
        match load_model(cfg.model.backend, cfg.model.path.as_deref(), cfg.mbsz, cfg.psz) {
            Ok(model) => model,
            Err(err) => {
                stage.fail();
                return Err(err.context("model initialisation failed"));
            }
        }
    };

    let (fanout, live_server) = {
        let _stage = ui.stage("Start result sinks");
        build_sinks(&cfg)?
    };

    let (tx, rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    })
    .expect("error setting Ctrl-C handler");

    let extractor: Arc<dyn PatchExtractor> = Arc::new(PeakPatchExtractor::new(cfg.min_peak_extent));
    let summary = run_pipeline(&cfg, model, extractor, fanout, rx)?;

    if let Some(server) = live_server {
        server.stop()?;
    }
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
