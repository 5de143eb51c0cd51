pub mod classify;
pub mod filter;
pub mod procstat;
pub mod system;
pub mod top;

use crate::config::{Backend, Config, ConfigError};
use crate::state::{ProcessRecord, TickSnapshot};
use filter::ProcessFilter;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// `sample` blocks until data is available. `Ok(None)` means no complete
/// report yet.
pub trait Collector: Send {
    fn sample(&mut self) -> Result<Option<TickSnapshot>, CollectError>;

    fn name(&self) -> &'static str;

    /// Unblocks a `sample` call running on another thread.
    fn interrupt(&self) -> Option<Interrupt> {
        None
    }

    fn shutdown(&mut self) {}
}

#[derive(Clone)]
pub struct Interrupt(Arc<dyn Fn() + Send + Sync>);

impl Interrupt {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn fire(&self) {
        (self.0)()
    }
}

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("failed to read {path}: {source}")]
    SystemStats {
        path: &'static str,
        #[source]
        source: procfs::ProcError,
    },
    #[error("process table is unavailable")]
    NoProcessTable,
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to allocate a pseudo-terminal: {0}")]
    Pty(#[from] nix::Error),
    #[error("output stream of `{command}` closed")]
    StreamClosed { command: String },
    #[error("failed to read collector output: {0}")]
    Io(#[from] std::io::Error),
}

impl CollectError {
    /// Fatal errors stop the sampler; the rest drop a single tick.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CollectError::SystemStats { .. })
    }

    /// Label for the `kind` dimension of the error counter.
    pub fn kind(&self) -> &'static str {
        match self {
            CollectError::SystemStats { .. } => "system_stats",
            CollectError::NoProcessTable => "process_table",
            CollectError::Spawn { .. } => "spawn",
            CollectError::Pty(_) => "pty",
            CollectError::StreamClosed { .. } => "stream_closed",
            CollectError::Io(_) => "io",
        }
    }
}

/// Stable sort by CPU share, descending, keeping at most `limit` records.
/// Equal shares keep the order they were collected in.
pub fn rank_by_cpu(mut records: Vec<ProcessRecord>, limit: usize) -> Vec<ProcessRecord> {
    records.sort_by(|a, b| b.cpu_percent.total_cmp(&a.cpu_percent));
    records.truncate(limit);
    records
}

pub fn build_collector(cfg: &Config) -> Result<Box<dyn Collector>, ConfigError> {
    let filter = ProcessFilter::new(&cfg.filter, cfg.only_ros)?;
    let backend = match cfg.backend {
        Backend::Auto if command_on_path(&cfg.top_command) => Backend::Top,
        Backend::Auto => Backend::Native,
        other => other,
    };

    let collector: Box<dyn Collector> = match backend {
        Backend::Top => {
            let collector = top::TopCollector::spawn(&cfg.top_command, cfg.interval()?, filter, cfg.num_process)
                .map_err(ConfigError::Collector)?;
            Box::new(collector)
        }
        _ => Box::new(system::NativeCollector::new(filter, cfg.num_process)),
    };
    info!(backend = collector.name(), "collector ready");
    Ok(collector)
}

pub(crate) fn command_on_path(command: &str) -> bool {
    if command.contains('/') {
        return Path::new(command).is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(command).is_file()))
        .unwrap_or(false)
}
