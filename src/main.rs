use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, error, info, warn};
use tokio::sync::watch;

use traffic_sentinel::analysis::{ClassifierSummary, PacketClassifier, TrafficReport};
use traffic_sentinel::capture::{CaptureError, ConnectionSource, PcapEngine, ProcConnections, ProcNetParser, SysfsCounters};
use traffic_sentinel::config::Config;
use traffic_sentinel::metrics::{JsonLinesExporter, LogExporter, MetricsExporter, PingProbe};
use traffic_sentinel::monitor::{run_capture_loop, run_session, shutdown_channel, SessionParts, Shutdown, ShutdownHandle};
use traffic_sentinel::utils::formatting::{format_bandwidth, format_bytes, format_duration};

#[derive(Parser)]
#[command(name = "traffic-sentinel")]
#[command(about = "Network traffic anomaly detection and metrics aggregation")]
struct Cli {
    #[arg(short, long, global = true, help = "Configuration file path")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable debug logging")]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Classify a capture file and print the traffic report
    Analyze {
        pcap_file: PathBuf,

        #[arg(long, help = "Packets above this IP length count as oversized")]
        mtu: Option<u16>,

        #[arg(long, help = "Entries per ranked section")]
        top: Option<usize>,

        #[arg(long, help = "Print the report as JSON")]
        json: bool,
    },

    /// Record traffic from an interface into a pcap file until Ctrl-C
    Capture { interface: String, output_file: PathBuf },

    /// Watch throughput, latency and live traffic until Ctrl-C
    Monitor {
        #[arg(short, long, help = "Sampling interval in seconds")]
        interval: Option<f64>,

        #[arg(short, long, help = "Spike threshold floor in bytes per second")]
        threshold: Option<f64>,

        #[arg(long, value_delimiter = ',', help = "Comma separated latency probe destinations")]
        destinations: Option<Vec<String>>,

        #[arg(long, help = "Interface to capture and classify packets on")]
        interface: Option<String>,

        #[arg(long, help = "Probe latency every N sampling intervals")]
        probe_multiplier: Option<u32>,

        #[arg(long, help = "Skip packet capture and classification")]
        no_capture: bool,

        #[arg(short, long, help = "Port of the Prometheus scrape endpoint")]
        port: Option<u16>,

        #[arg(long, help = "Do not serve metrics over HTTP")]
        no_metrics_server: bool,

        #[arg(long, help = "Write metric snapshots to stdout as JSON lines")]
        json_metrics: bool,

        #[arg(long, help = "Print the final traffic report as JSON")]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Analyze {
            pcap_file,
            mtu,
            top,
            json,
        } => {
            if let Some(mtu) = mtu {
                config.analysis.mtu_threshold = mtu;
            }
            if let Some(top) = top {
                config.analysis.top_n = top;
            }
            config.validate()?;
            analyze(&config, pcap_file, json).await
        }
        Command::Capture {
            interface,
            output_file,
        } => capture(&config, interface, output_file).await,
        Command::Monitor {
            interval,
            threshold,
            destinations,
            interface,
            probe_multiplier,
            no_capture,
            port,
            no_metrics_server,
            json_metrics,
            json,
        } => {
            let monitor = &mut config.monitor;
            if let Some(interval) = interval {
                monitor.sample_interval_secs = interval;
            }
            if let Some(threshold) = threshold {
                monitor.spike_threshold_bps = threshold;
            }
            if let Some(destinations) = destinations {
                monitor.probe_destinations = destinations;
            }
            if let Some(multiplier) = probe_multiplier {
                monitor.probe_interval_multiplier = multiplier;
            }
            if let Some(port) = port {
                monitor.metrics_port = port;
            }
            if no_metrics_server {
                monitor.serve_metrics = false;
            }
            if interface.is_some() {
                config.capture.interface = interface;
            }
            config.validate()?;

            let report = if json_metrics {
                monitor_with(config, JsonLinesExporter::new(io::stdout()), no_capture).await?
            } else {
                monitor_with(config, LogExporter, no_capture).await?
            };

            if let Some(report) = report {
                print_report(&report, json)?;
            }
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => {
            Config::load_from_file(path).with_context(|| format!("Failed to load configuration from {}", path.display()))
        }
        None => Ok(Config::default()),
    }
}

/// Triggers shutdown on the first Ctrl-C.
fn stop_on_ctrl_c(handle: ShutdownHandle) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            // Keep the handle alive, dropping it would stop everything.
            std::future::pending::<()>().await;
        }
        info!("Interrupt received, shutting down...");
        handle.trigger();
    });
}

fn ctrl_c_shutdown() -> Shutdown {
    let (handle, shutdown) = shutdown_channel();
    stop_on_ctrl_c(handle);
    shutdown
}

async fn analyze(config: &Config, pcap_file: PathBuf, json: bool) -> Result<()> {
    let shutdown = ctrl_c_shutdown();
    let engine = PcapEngine::open_file(&pcap_file)?;
    let classifier = PacketClassifier::from_config(&config.analysis);
    let (summary_tx, _) = watch::channel(ClassifierSummary::default());

    let classifier = tokio::task::spawn_blocking(move || run_capture_loop(engine, classifier, summary_tx, shutdown))
        .await
        .context("Capture loop panicked")?;

    print_report(&classifier.finalize(), json)
}

async fn capture(config: &Config, interface: String, output_file: PathBuf) -> Result<()> {
    let shutdown = ctrl_c_shutdown();
    let capture_config = config.capture.clone();
    let output = output_file.clone();
    let started = Instant::now();

    info!("Press Ctrl-C to stop recording");
    let (written, stats) = tokio::task::spawn_blocking(move || -> Result<_, CaptureError> {
        let mut engine = PcapEngine::open_device(Some(&interface), &capture_config)?;
        let written = engine.record_to_file(&output, &shutdown)?;
        Ok((written, engine.get_statistics().clone()))
    })
    .await
    .context("Capture task panicked")??;

    info!(
        "Wrote {} frames ({}) to {} in {}",
        written,
        format_bytes(stats.bytes_captured),
        output_file.display(),
        format_duration(started.elapsed().as_secs())
    );
    Ok(())
}

async fn monitor_with<E>(config: Config, exporter: E, no_capture: bool) -> Result<Option<TrafficReport>>
where
    E: MetricsExporter + Send + 'static,
{
    match ProcNetParser::get_interfaces() {
        Ok(interfaces) if interfaces.is_empty() => warn!("No network interfaces found"),
        Ok(interfaces) => debug!("Available interfaces: {:?}", interfaces),
        Err(e) => warn!("Could not enumerate interfaces: {}", e),
    }

    // Graceful fallback: without capture privileges the other loops still run.
    let packets = if no_capture {
        None
    } else {
        match PcapEngine::open_device(None, &config.capture) {
            Ok(engine) => Some(engine),
            Err(e) => {
                warn!("Packet capture initialization failed: {}", e);
                warn!("Continuing without traffic classification...");
                None
            }
        }
    };

    let connections: Option<Box<dyn ConnectionSource + Send + Sync>> = if config.monitor.track_connections {
        Some(Box::new(ProcConnections))
    } else {
        None
    };

    info!(
        "Spike threshold floor {}, press Ctrl-C to stop",
        format_bandwidth(config.monitor.spike_threshold_bps)
    );
    let started = Instant::now();
    let parts = SessionParts {
        counters: SysfsCounters::new(config.monitor.counter_interface.clone()),
        probe: PingProbe::from_config(&config.probe),
        exporter,
        packets,
        connections,
        config,
    };
    let outcome = run_session(parts, ctrl_c_shutdown()).await?;

    info!(
        "Monitored for {}: mean rate {}, {} spikes, {} invalid samples",
        format_duration(started.elapsed().as_secs()),
        format_bandwidth(outcome.detector.model().mean()),
        outcome.spikes.spikes_total,
        outcome.spikes.invalid_samples
    );
    for (destination, result) in &outcome.latency {
        info!(
            "{}: {:.2} ms, {:.0}% loss",
            destination, result.latency_ms, result.loss_percent
        );
    }

    Ok(outcome.report)
}

fn print_report(report: &TrafficReport, json: bool) -> Result<()> {
    if json {
        println!("{}", report.to_json()?);
    } else {
        println!("{}", report);
    }
    Ok(())
}
