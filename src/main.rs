mod collectors;
mod config;
mod history;
mod http;
mod metrics;
mod persist;
mod render;
mod sampler;
mod state;

use axum::serve;
use clap::Parser;
use collectors::build_collector;
use config::{Backend, Config};
use history::Aggregator;
use metrics::Metrics;
use persist::ChunkStore;
use render::RenderOptions;
use sampler::{Controls, Publication, Sampler};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "./nodetop.yaml";

#[derive(Parser, Debug)]
#[command(name = "nodetop")]
#[command(version, about = "top-like process monitor with per-process CPU/memory history")]
struct Cli {
    /// YAML config; ./nodetop.yaml is used when present.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Seconds between samples.
    #[arg(short = 'd', long)]
    interval: Option<f64>,
    /// Show only processes whose command line matches this pattern.
    #[arg(long)]
    filter: Option<String>,
    /// Persist history as chunked CSV files.
    #[arg(long)]
    csv: bool,
    #[arg(short = 'n', long)]
    num_process: Option<usize>,
    #[arg(long)]
    only_ros: bool,
    #[arg(long, value_enum)]
    backend: Option<Backend>,
    #[arg(long)]
    wide: bool,
    #[arg(long)]
    per_core: bool,
    /// Serve /metrics and the JSON view on this address.
    #[arg(long)]
    listen: Option<String>,
    /// Print the rendered table to stdout every tick.
    #[arg(long)]
    batch: bool,
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let loaded = match &cli.config {
        Some(path) => Config::load_from_file(path),
        None => Config::load_or_default(DEFAULT_CONFIG_PATH),
    };
    let mut cfg = match loaded {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    apply_overrides(&mut cfg, &cli);
    let interval = match cfg.validate().and_then(|_| cfg.interval()) {
        Ok(interval) => interval,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            std::process::exit(1);
        }
    };

    let started = chrono::Local::now();
    info!(
        started = %humantime::format_rfc3339_seconds(SystemTime::now()),
        interval_secs = cfg.interval_secs,
        filter = %cfg.filter,
        only_ros = cfg.only_ros,
        num_process = cfg.num_process,
        "starting nodetop"
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialise metrics");
            std::process::exit(1);
        }
    };

    let aggregator = if cfg.persist.enabled {
        match ChunkStore::create(Path::new(&cfg.persist.dir), &started) {
            Ok(store) => Aggregator::with_store(cfg.history_rows, store, cfg.persist.chunk_rows),
            Err(err) => {
                error!(error = %err, "failed to prepare history directory");
                std::process::exit(1);
            }
        }
    } else {
        Aggregator::new(cfg.history_rows)
    };

    let collector = match build_collector(&cfg) {
        Ok(c) => c,
        Err(err) => {
            error!(error = %err, "failed to start collector");
            std::process::exit(1);
        }
    };

    let controls = Arc::new(Controls::default());
    let (sampler, publication) = Sampler::new(
        collector,
        aggregator,
        controls.clone(),
        metrics.clone(),
        interval,
    );
    let sampler = sampler.with_render(RenderOptions {
        wide: cfg.wide,
        per_core: cfg.per_core,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = cfg.listen.clone().map(|listen| {
        let app = http::build_router(metrics.clone(), controls.clone(), publication.clone());
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "invalid listen address");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "failed to start HTTP server");
                    return;
                }
            };
            info!(listen = %addr, "HTTP view listening");

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "HTTP server error");
            }
        })
    });

    let batch_task = cli
        .batch
        .then(|| tokio::spawn(print_batch(publication.clone(), shutdown_rx.clone())));

    let mut sampler_task = tokio::spawn(sampler.run(shutdown_rx.clone()));

    let finished = tokio::select! {
        joined = &mut sampler_task => Some(joined),
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                error!(error = %err, "failed to listen for Ctrl+C");
            }
            info!("received Ctrl+C, shutting down");
            None
        }
    };

    let _ = shutdown_tx.send(true);

    let joined = match finished {
        Some(joined) => joined,
        None => sampler_task.await,
    };
    let exit_code = match joined {
        Ok(Ok(())) => 0,
        Ok(Err(err)) => {
            error!(error = %err, "sampling stopped");
            1
        }
        Err(err) => {
            error!(error = %err, "sampling task panicked");
            1
        }
    };

    if let Some(task) = batch_task {
        let _ = task.await;
    }
    if let Some(task) = http_task {
        let _ = task.await;
    }
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn apply_overrides(cfg: &mut Config, cli: &Cli) {
    if let Some(interval) = cli.interval {
        cfg.interval_secs = interval;
    }
    if let Some(filter) = &cli.filter {
        cfg.filter = filter.clone();
    }
    if let Some(n) = cli.num_process {
        cfg.num_process = n;
    }
    if let Some(backend) = cli.backend {
        cfg.backend = backend;
    }
    if let Some(listen) = &cli.listen {
        cfg.listen = Some(listen.clone());
    }
    cfg.persist.enabled |= cli.csv;
    cfg.only_ros |= cli.only_ros;
    cfg.wide |= cli.wide;
    cfg.per_core |= cli.per_core;
}

/// Prints each published tick; a paused sampler publishes nothing, so the
/// output simply stops until it resumes.
async fn print_batch(mut publication: Publication, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            changed = publication.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let latest = publication.borrow_and_update().clone();
        let Some(published) = latest else {
            continue;
        };

        if write_lines(&published.lines).is_err() {
            break;
        }
    }
}

fn write_lines(lines: &[String]) -> std::io::Result<()> {
    let mut out = std::io::stdout().lock();
    for line in lines {
        writeln!(out, "{line}")?;
    }
    writeln!(out)?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_override_file_values() {
        let cli = Cli::try_parse_from([
            "nodetop", "-d", "0.5", "--filter", "talker", "--csv", "-n", "5", "--backend", "top",
            "--wide",
        ])
        .unwrap();
        let mut cfg = Config::default();
        apply_overrides(&mut cfg, &cli);

        assert_eq!(cfg.interval_secs, 0.5);
        assert_eq!(cfg.filter, "talker");
        assert!(cfg.persist.enabled);
        assert_eq!(cfg.num_process, 5);
        assert_eq!(cfg.backend, Backend::Top);
        assert!(cfg.wide);
        assert!(!cfg.per_core);
        cfg.validate().unwrap();
    }

    #[test]
    fn absent_flags_keep_file_values() {
        let cli = Cli::try_parse_from(["nodetop"]).unwrap();
        let mut cfg = Config {
            only_ros: true,
            listen: Some("127.0.0.1:9108".to_string()),
            ..Config::default()
        };
        apply_overrides(&mut cfg, &cli);
        assert!(cfg.only_ros);
        assert_eq!(cfg.listen.as_deref(), Some("127.0.0.1:9108"));
        assert_eq!(cfg.interval_secs, 1.0);
    }
}
