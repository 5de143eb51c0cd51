use crate::state::TickSnapshot;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub nodetop_ticks_total: Counter,
    pub nodetop_ticks_skipped_total: Counter,
    pub nodetop_collect_errors_total: CounterVec,
    pub nodetop_persist_errors_total: Counter,
    pub nodetop_visible_processes: Gauge,
    pub nodetop_total_cpu_percent: Gauge,
    pub nodetop_history_rows: Gauge,
    pub nodetop_chunk_index: Gauge,
    pub nodetop_last_tick_timestamp_seconds: Gauge,
    pub nodetop_process_cpu_percent: GaugeVec,
    pub nodetop_process_memory_percent: GaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let nodetop_ticks_total = Counter::with_opts(opts!(
            "nodetop_ticks_total",
            "Ticks that produced a snapshot and were aggregated"
        ))?;
        let nodetop_ticks_skipped_total = Counter::with_opts(opts!(
            "nodetop_ticks_skipped_total",
            "Ticks without a snapshot (no complete report yet or transient failure)"
        ))?;
        let nodetop_collect_errors_total = CounterVec::new(
            opts!("nodetop_collect_errors_total", "Collector errors by kind"),
            &["kind"],
        )?;
        let nodetop_persist_errors_total = Counter::with_opts(opts!(
            "nodetop_persist_errors_total",
            "Failed history chunk writes"
        ))?;
        let nodetop_visible_processes = Gauge::with_opts(opts!(
            "nodetop_visible_processes",
            "Processes in the latest snapshot after filtering and truncation"
        ))?;
        let nodetop_total_cpu_percent = Gauge::with_opts(opts!(
            "nodetop_total_cpu_percent",
            "Busy CPU summed over cores in percent (native backend only)"
        ))?;
        let nodetop_history_rows = Gauge::with_opts(opts!(
            "nodetop_history_rows",
            "Rows in the live history window"
        ))?;
        let nodetop_chunk_index = Gauge::with_opts(opts!(
            "nodetop_chunk_index",
            "Index of the history chunk being written"
        ))?;
        let nodetop_last_tick_timestamp_seconds = Gauge::with_opts(opts!(
            "nodetop_last_tick_timestamp_seconds",
            "Unix timestamp of the latest aggregated snapshot"
        ))?;
        let nodetop_process_cpu_percent = GaugeVec::new(
            opts!(
                "nodetop_process_cpu_percent",
                "CPU usage per visible process in percent of one core"
            ),
            &["process"],
        )?;
        let nodetop_process_memory_percent = GaugeVec::new(
            opts!(
                "nodetop_process_memory_percent",
                "Resident memory per visible process in percent of total"
            ),
            &["process"],
        )?;

        register(&registry, &nodetop_ticks_total)?;
        register(&registry, &nodetop_ticks_skipped_total)?;
        register(&registry, &nodetop_collect_errors_total)?;
        register(&registry, &nodetop_persist_errors_total)?;
        register(&registry, &nodetop_visible_processes)?;
        register(&registry, &nodetop_total_cpu_percent)?;
        register(&registry, &nodetop_history_rows)?;
        register(&registry, &nodetop_chunk_index)?;
        register(&registry, &nodetop_last_tick_timestamp_seconds)?;
        register(&registry, &nodetop_process_cpu_percent)?;
        register(&registry, &nodetop_process_memory_percent)?;

        Ok(Arc::new(Self {
            registry,
            nodetop_ticks_total,
            nodetop_ticks_skipped_total,
            nodetop_collect_errors_total,
            nodetop_persist_errors_total,
            nodetop_visible_processes,
            nodetop_total_cpu_percent,
            nodetop_history_rows,
            nodetop_chunk_index,
            nodetop_last_tick_timestamp_seconds,
            nodetop_process_cpu_percent,
            nodetop_process_memory_percent,
        }))
    }

    pub fn update_from_tick(&self, snapshot: &TickSnapshot, history_rows: usize, chunk_index: Option<usize>) {
        self.nodetop_ticks_total.inc();
        self.nodetop_visible_processes
            .set(snapshot.processes.len() as f64);
        if let Some(system) = &snapshot.system {
            self.nodetop_total_cpu_percent
                .set(system.total_cpu_percent());
        }
        self.nodetop_history_rows.set(history_rows as f64);
        if let Some(index) = chunk_index {
            self.nodetop_chunk_index.set(index as f64);
        }
        self.nodetop_last_tick_timestamp_seconds
            .set(snapshot.timestamp as f64);

        self.nodetop_process_cpu_percent.reset();
        self.nodetop_process_memory_percent.reset();
        for p in &snapshot.processes {
            let key = p.identity_key();
            self.nodetop_process_cpu_percent
                .with_label_values(&[&key])
                .set(p.cpu_percent);
            self.nodetop_process_memory_percent
                .with_label_values(&[&key])
                .set(p.memory_percent);
        }
    }

    pub fn inc_skipped_tick(&self) {
        self.nodetop_ticks_skipped_total.inc();
    }

    pub fn inc_collect_error(&self, kind: &str) {
        self.nodetop_collect_errors_total
            .with_label_values(&[kind])
            .inc();
    }

    pub fn inc_persist_error(&self) {
        self.nodetop_persist_errors_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}
