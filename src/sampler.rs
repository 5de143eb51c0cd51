use crate::collectors::{CollectError, Collector};
use crate::history::{Aggregator, HistoryTables};
use crate::metrics::Metrics;
use crate::render::{render, RenderOptions};
use crate::state::TickSnapshot;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
pub struct Controls {
    paused: AtomicBool,
    reset_requested: AtomicBool,
}

impl Controls {
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn request_reset(&self) {
        self.reset_requested.store(true, Ordering::Release);
    }

    pub fn take_reset(&self) -> bool {
        self.reset_requested.swap(false, Ordering::AcqRel)
    }
}

#[derive(Debug)]
pub struct Published {
    pub snapshot: TickSnapshot,
    pub history: HistoryTables,
    pub lines: Vec<String>,
}

pub type Publication = watch::Receiver<Option<Arc<Published>>>;

pub struct Sampler {
    collector: Option<Box<dyn Collector>>,
    aggregator: Aggregator,
    controls: Arc<Controls>,
    metrics: Arc<Metrics>,
    publisher: watch::Sender<Option<Arc<Published>>>,
    interval: Duration,
    render: RenderOptions,
}

impl Sampler {
    pub fn new(
        collector: Box<dyn Collector>,
        aggregator: Aggregator,
        controls: Arc<Controls>,
        metrics: Arc<Metrics>,
        interval: Duration,
    ) -> (Self, Publication) {
        let (publisher, publication) = watch::channel(None);
        let sampler = Self {
            collector: Some(collector),
            aggregator,
            controls,
            metrics,
            publisher,
            interval,
            render: RenderOptions::default(),
        };
        (sampler, publication)
    }

    pub fn with_render(mut self, render: RenderOptions) -> Self {
        self.render = render;
        self
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), CollectError> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let interrupt = self.collector.as_ref().and_then(|c| c.interrupt());

        let result = loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("sampling loop stopping");
                    break Ok(());
                }
                _ = ticker.tick() => {}
            }

            let tick = self.tick();
            tokio::pin!(tick);
            let outcome = tokio::select! {
                outcome = &mut tick => outcome,
                _ = shutdown.changed() => {
                    info!("sampling loop stopping mid-tick");
                    if let Some(interrupt) = &interrupt {
                        interrupt.fire();
                    }
                    if let Err(err) = tick.await {
                        debug!(error = %err, "interrupted tick");
                    }
                    break Ok(());
                }
            };
            if let Err(err) = outcome {
                error!(error = %err, "collector failed");
                break Err(err);
            }
        };

        if let Some(mut collector) = self.collector.take() {
            collector.shutdown();
        }
        result
    }

    async fn tick(&mut self) -> Result<(), CollectError> {
        if self.controls.take_reset() {
            self.aggregator.reset();
        }
        let Some(mut collector) = self.collector.take() else {
            return Ok(());
        };

        let (collector, result) = tokio::task::spawn_blocking(move || {
            let result = collector.sample();
            (collector, result)
        })
        .await
        .map_err(|err| CollectError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))?;
        self.collector = Some(collector);

        match result {
            Ok(Some(snapshot)) => self.accept(snapshot),
            Ok(None) => {
                self.metrics.inc_skipped_tick();
                debug!("no complete report yet");
            }
            Err(err) if !err.is_fatal() => {
                self.metrics.inc_collect_error(err.kind());
                self.metrics.inc_skipped_tick();
                warn!(error = %err, "tick skipped");
            }
            Err(err) => {
                self.metrics.inc_collect_error(err.kind());
                return Err(err);
            }
        }
        Ok(())
    }

    fn accept(&mut self, snapshot: TickSnapshot) {
        let recorded = self.aggregator.record(&snapshot);
        if let Some(err) = &recorded.persist_error {
            self.metrics.inc_persist_error();
            warn!(error = %err, "failed to persist history chunk");
        }
        self.metrics.update_from_tick(
            &snapshot,
            self.aggregator.live_rows(),
            self.aggregator.chunk_index(),
        );

        if self.controls.is_paused() {
            return;
        }
        let lines = render(&snapshot, self.render);
        self.publisher.send_replace(Some(Arc::new(Published {
            snapshot,
            history: recorded.tables,
            lines,
        })));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::Interrupt;
    use crate::state::ProcessRecord;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    type Step = Box<dyn FnOnce() -> Result<Option<TickSnapshot>, CollectError> + Send>;

    struct Scripted {
        steps: VecDeque<Step>,
        repeat_forever: bool,
        shutdowns: Arc<AtomicUsize>,
    }

    impl Collector for Scripted {
        fn sample(&mut self) -> Result<Option<TickSnapshot>, CollectError> {
            if self.repeat_forever {
                return Ok(Some(snapshot(0)));
            }
            match self.steps.pop_front() {
                Some(step) => step(),
                None => Err(CollectError::StreamClosed {
                    command: "scripted".into(),
                }),
            }
        }

        fn name(&self) -> &'static str {
            "scripted"
        }

        fn shutdown(&mut self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn snapshot(timestamp: i64) -> TickSnapshot {
        TickSnapshot {
            timestamp,
            system: None,
            processes: vec![ProcessRecord {
                cpu_percent: 1.0,
                ..ProcessRecord::new(7, "worker")
            }],
            text: None,
        }
    }

    fn ok(timestamp: i64) -> Step {
        Box::new(move || Ok(Some(snapshot(timestamp))))
    }

    fn sampler(steps: Vec<Step>, controls: Arc<Controls>) -> (Sampler, Publication, Arc<Metrics>, Arc<AtomicUsize>) {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let collector = Scripted {
            steps: steps.into(),
            repeat_forever: false,
            shutdowns: shutdowns.clone(),
        };
        let metrics = Metrics::new().unwrap();
        let (sampler, publication) = Sampler::new(
            Box::new(collector),
            Aggregator::new(100),
            controls,
            metrics.clone(),
            Duration::from_millis(1),
        );
        (sampler, publication, metrics, shutdowns)
    }

    #[tokio::test]
    async fn transient_failures_skip_ticks_and_fatal_stops() {
        let transient: Step = Box::new(|| {
            Err(CollectError::SystemStats {
                path: "/proc/meminfo",
                source: procfs::ProcError::Incomplete(None),
            })
        });
        let none: Step = Box::new(|| Ok(None));
        let (sampler, publication, metrics, shutdowns) =
            sampler(vec![ok(1), none, transient, ok(2)], Arc::new(Controls::default()));
        let (_stop_tx, stop_rx) = watch::channel(false);

        let err = sampler.run(stop_rx).await.unwrap_err();
        assert!(matches!(err, CollectError::StreamClosed { .. }));
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);

        let published = publication.borrow().clone().unwrap();
        assert_eq!(published.snapshot.timestamp, 2);
        assert_eq!(published.history.cpu.len(), 2);
        assert!(published.lines.iter().any(|l| l.ends_with("worker")));

        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(text.contains("nodetop_ticks_total 2"));
        assert!(text.contains("nodetop_ticks_skipped_total 2"));
        assert!(text.contains("nodetop_collect_errors_total{kind=\"stream_closed\"} 1"));
    }

    #[tokio::test]
    async fn pause_freezes_publication_but_keeps_aggregating() {
        let controls = Arc::new(Controls::default());
        controls.pause();
        let (sampler, publication, metrics, _) = sampler(vec![ok(1), ok(2)], controls);
        let (_stop_tx, stop_rx) = watch::channel(false);

        sampler.run(stop_rx).await.unwrap_err();
        assert!(publication.borrow().is_none());
        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(text.contains("nodetop_history_rows 2"));
    }

    #[tokio::test]
    async fn reset_request_is_consumed_at_next_tick() {
        let controls = Arc::new(Controls::default());
        let requester = controls.clone();
        let request_reset: Step = Box::new(move || {
            requester.request_reset();
            Ok(Some(snapshot(2)))
        });
        let (sampler, publication, _, _) = sampler(vec![ok(1), request_reset, ok(3)], controls.clone());
        let (_stop_tx, stop_rx) = watch::channel(false);

        sampler.run(stop_rx).await.unwrap_err();
        let published = publication.borrow().clone().unwrap();
        assert_eq!(published.history.cpu.len(), 1);
        assert_eq!(published.history.cpu.times().next(), Some(3));
        assert!(!controls.take_reset());
    }

    #[tokio::test]
    async fn stop_signal_ends_loop_and_releases_collector() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let collector = Scripted {
            steps: VecDeque::new(),
            repeat_forever: true,
            shutdowns: shutdowns.clone(),
        };
        let (sampler, mut publication) = Sampler::new(
            Box::new(collector),
            Aggregator::new(10),
            Arc::new(Controls::default()),
            Metrics::new().unwrap(),
            Duration::from_millis(1),
        );
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(sampler.run(stop_rx));

        publication.changed().await.unwrap();
        stop_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    struct Stalled {
        wake_tx: std::sync::mpsc::SyncSender<()>,
        wake_rx: std::sync::mpsc::Receiver<()>,
        entered: Arc<tokio::sync::Notify>,
    }

    impl Collector for Stalled {
        fn sample(&mut self) -> Result<Option<TickSnapshot>, CollectError> {
            self.entered.notify_one();
            let _ = self.wake_rx.recv();
            Err(CollectError::StreamClosed {
                command: "stalled".into(),
            })
        }

        fn name(&self) -> &'static str {
            "stalled"
        }

        fn interrupt(&self) -> Option<Interrupt> {
            let wake_tx = self.wake_tx.clone();
            Some(Interrupt::new(move || {
                let _ = wake_tx.try_send(());
            }))
        }
    }

    #[tokio::test]
    async fn stop_signal_interrupts_a_blocked_tick() {
        let (wake_tx, wake_rx) = std::sync::mpsc::sync_channel(1);
        let entered = Arc::new(tokio::sync::Notify::new());
        let collector = Stalled {
            wake_tx,
            wake_rx,
            entered: entered.clone(),
        };
        let (sampler, _publication) = Sampler::new(
            Box::new(collector),
            Aggregator::new(10),
            Arc::new(Controls::default()),
            Metrics::new().unwrap(),
            Duration::from_millis(1),
        );
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(sampler.run(stop_rx));

        entered.notified().await;
        stop_tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sampler stops while the collector is blocked");
        result.unwrap().unwrap();
    }

    #[test]
    fn reset_flag_is_one_shot() {
        let controls = Controls::default();
        assert!(!controls.take_reset());
        controls.request_reset();
        assert!(controls.take_reset());
        assert!(!controls.take_reset());
    }
}
