//! The collection loop.
//!
//! One task owns the event source. On every tick it drains whatever is
//! buffered and pushes each record through decode → resolve → classify →
//! publish. Per-event failures are logged and counted; only a broken channel
//! ends the loop with an error.
//!
//! ```text
//! Idle ──start──▶ Running ──stop──▶ Draining ──▶ Stopped
//!                    │                              ▲
//!                    └──── channel closed ──────────┘
//! ```

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use aya::{
    Ebpf,
    maps::{MapData, RingBuf},
};
use log::{debug, error, info, warn};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at},
};
use tokio_util::sync::CancellationToken;

use crate::{
    classify::classify,
    error::{ChannelError, LoopError},
    event,
    identity::IdentityResolver,
    publish::MetricPublisher,
};

pub const DEFAULT_COLLECTION_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_EVENTS_PER_DRAIN: usize = 100_000;

/// Non-blocking supply of raw records.
pub trait EventSource: Send {
    /// Next buffered record, `Ok(None)` when nothing is available right now.
    fn try_next(&mut self) -> Result<Option<Vec<u8>>, ChannelError>;
}

/// Kernel ring buffer. Each record is copied out and released before it is
/// processed.
pub struct RingBufSource {
    ring: RingBuf<MapData>,
}

impl RingBufSource {
    pub fn new(ring: RingBuf<MapData>) -> Self {
        Self { ring }
    }

    /// Take ownership of the ring buffer map `map_name` out of `bpf`.
    pub fn from_ebpf(bpf: &mut Ebpf, map_name: &str) -> anyhow::Result<Self> {
        let map = bpf
            .take_map(map_name)
            .with_context(|| format!("Failed to get {} map", map_name))?;
        let ring = RingBuf::try_from(map)
            .with_context(|| format!("{} is not a ring buffer", map_name))?;
        Ok(Self::new(ring))
    }
}

impl EventSource for RingBufSource {
    fn try_next(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        Ok(self.ring.next().map(|item| item.to_vec()))
    }
}

/// In-process channel of records, for replay and tests.
pub struct QueueSource {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl QueueSource {
    pub fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self { rx }
    }

    pub fn channel(capacity: usize) -> (mpsc::Sender<Vec<u8>>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx))
    }
}

impl EventSource for QueueSource {
    fn try_next(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        match self.rx.try_recv() {
            Ok(record) => Ok(Some(record)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(ChannelError::Closed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub interval: Duration,
    /// Upper bound on records handled per tick; the rest wait for the next.
    /// Keeps a drain finite while the producer outpaces it.
    pub max_events_per_drain: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_COLLECTION_INTERVAL,
            max_events_per_drain: DEFAULT_MAX_EVENTS_PER_DRAIN,
        }
    }
}

/// Counts for one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub drained: usize,
    pub decode_failures: usize,
    pub resolve_failures: usize,
    pub publish_failures: usize,
    pub published: usize,
    /// The producer went away during this drain.
    pub closed: bool,
}

/// Cumulative pipeline counters.
#[derive(Debug, Default)]
pub struct PipelineStats {
    events_drained: AtomicU64,
    decode_failures: AtomicU64,
    resolve_failures: AtomicU64,
    publish_failures: AtomicU64,
    points_published: AtomicU64,
    drains: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub events_drained: u64,
    pub decode_failures: u64,
    pub resolve_failures: u64,
    pub publish_failures: u64,
    pub points_published: u64,
    pub drains: u64,
}

impl PipelineStats {
    fn record(&self, summary: &DrainSummary) {
        self.events_drained
            .fetch_add(summary.drained as u64, Ordering::Relaxed);
        self.decode_failures
            .fetch_add(summary.decode_failures as u64, Ordering::Relaxed);
        self.resolve_failures
            .fetch_add(summary.resolve_failures as u64, Ordering::Relaxed);
        self.publish_failures
            .fetch_add(summary.publish_failures as u64, Ordering::Relaxed);
        self.points_published
            .fetch_add(summary.published as u64, Ordering::Relaxed);
        self.drains.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_drained: self.events_drained.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            resolve_failures: self.resolve_failures.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            points_published: self.points_published.load(Ordering::Relaxed),
            drains: self.drains.load(Ordering::Relaxed),
        }
    }
}

pub struct CollectionLoop<S> {
    source: S,
    resolver: Arc<IdentityResolver>,
    publisher: MetricPublisher,
    config: CollectorConfig,
    stats: Arc<PipelineStats>,
    state: Arc<watch::Sender<LoopState>>,
}

impl<S: EventSource + 'static> CollectionLoop<S> {
    pub fn new(
        source: S,
        resolver: Arc<IdentityResolver>,
        publisher: MetricPublisher,
        config: CollectorConfig,
    ) -> Self {
        let (state, _) = watch::channel(LoopState::Idle);
        Self {
            source,
            resolver,
            publisher,
            config,
            stats: Arc::new(PipelineStats::default()),
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Spawn the loop. It runs until `cancel` fires, the handle is stopped or
    /// the channel closes.
    pub fn start(self, cancel: CancellationToken) -> CollectorHandle {
        let stop = cancel.child_token();
        let state = Arc::clone(&self.state);
        let stats = Arc::clone(&self.stats);

        state.send_replace(LoopState::Running);
        let task = tokio::spawn(self.run(stop.clone()));

        CollectorHandle {
            stop,
            state,
            stats,
            task,
        }
    }

    /// Drain everything currently buffered, once.
    pub async fn drain_once(&mut self) -> Result<DrainSummary, ChannelError> {
        let mut summary = DrainSummary::default();

        loop {
            if summary.drained >= self.config.max_events_per_drain {
                debug!(
                    "Drain capped at {} events",
                    self.config.max_events_per_drain
                );
                break;
            }

            let record = match self.source.try_next() {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(ChannelError::Closed) => {
                    summary.closed = true;
                    break;
                }
                Err(e) => {
                    self.stats.record(&summary);
                    return Err(e);
                }
            };

            summary.drained += 1;
            process(&self.resolver, &self.publisher, &record, &mut summary).await;
        }

        self.stats.record(&summary);
        let expired = self.resolver.purge_expired();
        if expired > 0 {
            debug!("Evicted {} expired identities", expired);
        }
        Ok(summary)
    }

    async fn run(mut self, stop: CancellationToken) -> Result<(), LoopError> {
        let period = self.config.interval;
        info!("Collection loop started, interval {:?}", period);

        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                biased;

                _ = stop.cancelled() => {
                    info!("Collection loop stop requested");
                    break Ok(());
                }

                _ = ticker.tick() => {
                    match self.drain_once().await {
                        Ok(summary) => {
                            info!(
                                "DRAIN events={} published={} decode_failures={} resolve_failures={} publish_failures={}",
                                summary.drained,
                                summary.published,
                                summary.decode_failures,
                                summary.resolve_failures,
                                summary.publish_failures
                            );
                            if summary.closed {
                                info!("Event channel closed, stopping collection loop");
                                break Ok(());
                            }
                        }
                        Err(e) => {
                            error!("Event channel failed: {}", e);
                            break Err(LoopError::Channel(e));
                        }
                    }
                }
            }
        };

        self.state.send_if_modified(|state| {
            if *state == LoopState::Running {
                *state = LoopState::Draining;
                true
            } else {
                false
            }
        });
        self.state.send_replace(LoopState::Stopped);
        info!("Collection loop stopped");
        result
    }
}

/// Push one record through the pipeline, recording the outcome in `summary`.
async fn process(
    resolver: &IdentityResolver,
    publisher: &MetricPublisher,
    record: &[u8],
    summary: &mut DrainSummary,
) {
    let event = match event::decode(record) {
        Ok(event) => event,
        Err(e) => {
            summary.decode_failures += 1;
            warn!(
                "DECODE_FAILED size={} kind={} error={}",
                record.len(),
                e.kind(),
                e
            );
            return;
        }
    };

    let identity = match resolver.resolve(event.cgroup_id).await {
        Ok(identity) => identity,
        Err(e) => {
            summary.resolve_failures += 1;
            warn!(
                "RESOLVE_FAILED cgroup_id={} ts={} kind={} error={}",
                e.cgroup_id(),
                event.timestamp_ns,
                e.kind(),
                e
            );
            return;
        }
    };

    let category = classify(event.prev_cgroup_id, event.cgroup_id);
    debug!(
        "RUNQ_EVENT cgroup_id={} prev_cgroup_id={} latency_ns={} pod={}/{} container={} preemption={}",
        event.cgroup_id,
        event.prev_cgroup_id,
        event.runq_latency_ns,
        identity.namespace,
        identity.pod_name,
        identity.container_name,
        category
    );

    let outcome = publisher.publish_event(&event, &identity, category).await;
    summary.published += outcome.published();
    for e in outcome.into_errors() {
        summary.publish_failures += 1;
        warn!(
            "PUBLISH_FAILED metric={} cgroup_id={} kind={} error={}",
            e.metric_type,
            event.cgroup_id,
            e.kind(),
            e
        );
    }
}

/// Control surface of a started [`CollectionLoop`].
pub struct CollectorHandle {
    stop: CancellationToken,
    state: Arc<watch::Sender<LoopState>>,
    stats: Arc<PipelineStats>,
    task: JoinHandle<Result<(), LoopError>>,
}

impl CollectorHandle {
    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Resolves once the loop has reached [`LoopState::Stopped`].
    pub async fn stopped(&self) {
        let mut state = self.state.subscribe();
        // the sender lives in this handle, so the channel cannot close here
        let _ = state.wait_for(|state| *state == LoopState::Stopped).await;
    }

    /// Ask the loop to stop after the in-flight drain and wait for it.
    pub async fn stop(self) -> Result<(), LoopError> {
        self.state.send_if_modified(|state| {
            if *state == LoopState::Running {
                *state = LoopState::Draining;
                true
            } else {
                false
            }
        });
        self.stop.cancel();
        self.task.await?
    }

    /// Wait for the loop to end on its own.
    pub async fn wait(self) -> Result<(), LoopError> {
        self.task.await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        identity::{IdentityCache, IdentityLookup},
        publish::{MetricValue, ResourceContext},
        testing::{FakeLookup, RecordingSink, identity, record, recording_sink},
    };

    fn pipeline(
        source: QueueSource,
        lookup: Arc<FakeLookup>,
        sink: Arc<RecordingSink>,
        config: CollectorConfig,
    ) -> CollectionLoop<QueueSource> {
        let resolver = Arc::new(IdentityResolver::new(
            lookup as Arc<dyn IdentityLookup>,
            Arc::new(IdentityCache::new()),
        ));
        let publisher = MetricPublisher::new(sink, Arc::new(ResourceContext::default()));
        CollectionLoop::new(source, resolver, publisher, config)
    }

    #[tokio::test]
    async fn test_same_container_switch() {
        let (tx, source) = QueueSource::channel(16);
        let lookup = Arc::new(FakeLookup::with([identity(10, "app", "app-1", "default")]));
        let sink = recording_sink();
        let mut collection = pipeline(source, lookup, sink.clone(), CollectorConfig::default());

        tx.send(record(10, 10, 2_000_000)).await.unwrap();
        let summary = collection.drain_once().await.unwrap();

        assert_eq!(summary.drained, 1);
        assert_eq!(summary.published, 2);
        let points = sink.points();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].value, MetricValue::Double(2.0));
        assert_eq!(points[0].label("container"), Some("app"));
        assert_eq!(points[0].label("pod"), Some("app-1"));
        assert_eq!(points[1].value, MetricValue::Int(1));
        assert_eq!(points[1].label("preemption_type"), Some("same_container"));
    }

    #[tokio::test]
    async fn test_switch_from_host_cgroup() {
        let (tx, source) = QueueSource::channel(16);
        let lookup = Arc::new(FakeLookup::with([identity(42, "api", "api-1", "default")]));
        let sink = recording_sink();
        let mut collection = pipeline(source, lookup, sink.clone(), CollectorConfig::default());

        tx.send(record(0, 42, 500_000)).await.unwrap();
        collection.drain_once().await.unwrap();

        let points = sink.points();
        assert_eq!(points[0].value, MetricValue::Double(0.5));
        assert_eq!(points[1].label("preemption_type"), Some("system_service"));
    }

    #[tokio::test]
    async fn test_unresolvable_event_is_skipped() {
        let (tx, source) = QueueSource::channel(16);
        let lookup = Arc::new(FakeLookup::with([identity(8, "db", "db-0", "data")]));
        let sink = recording_sink();
        let mut collection = pipeline(source, lookup, sink.clone(), CollectorConfig::default());

        tx.send(record(1, 999, 100)).await.unwrap();
        tx.send(record(999, 8, 100)).await.unwrap();
        let summary = collection.drain_once().await.unwrap();

        assert_eq!(summary.drained, 2);
        assert_eq!(summary.resolve_failures, 1);
        let points = sink.points();
        assert_eq!(points.len(), 2);
        assert!(points.iter().all(|p| p.label("pod") == Some("db-0")));
        assert_eq!(points[1].label("preemption_type"), Some("other_container"));
    }

    #[tokio::test]
    async fn test_one_drain_takes_all_buffered_events() {
        let (tx, source) = QueueSource::channel(64);
        let lookup = Arc::new(FakeLookup::with([identity(5, "a", "a-0", "ns")]));
        let sink = recording_sink();
        let mut collection = pipeline(
            source,
            Arc::clone(&lookup),
            sink.clone(),
            CollectorConfig::default(),
        );

        for _ in 0..20 {
            tx.send(record(5, 5, 1_000)).await.unwrap();
        }
        let summary = collection.drain_once().await.unwrap();

        assert_eq!(summary.drained, 20);
        assert_eq!(sink.points().len(), 40);
        // one cold miss, every later event is a cache hit
        assert_eq!(lookup.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(collection.drain_once().await.unwrap().drained, 0);
    }

    #[tokio::test]
    async fn test_malformed_record_does_not_stop_drain() {
        let (tx, source) = QueueSource::channel(16);
        let lookup = Arc::new(FakeLookup::with([identity(5, "a", "a-0", "ns")]));
        let sink = recording_sink();
        let mut collection = pipeline(source, lookup, sink.clone(), CollectorConfig::default());

        tx.send(vec![0u8; 12]).await.unwrap();
        tx.send(record(5, 5, 1_000)).await.unwrap();
        let summary = collection.drain_once().await.unwrap();

        assert_eq!(summary.decode_failures, 1);
        assert_eq!(summary.published, 2);
        assert_eq!(collection.stats().decode_failures, 1);
    }

    #[tokio::test]
    async fn test_publish_failure_is_counted() {
        let (tx, source) = QueueSource::channel(16);
        let lookup = Arc::new(FakeLookup::with([identity(5, "a", "a-0", "ns")]));
        let sink = recording_sink();
        sink.reject_latency.store(true, Ordering::SeqCst);
        let mut collection = pipeline(source, lookup, sink.clone(), CollectorConfig::default());

        tx.send(record(5, 5, 1_000)).await.unwrap();
        let summary = collection.drain_once().await.unwrap();

        assert_eq!(summary.publish_failures, 1);
        assert_eq!(summary.published, 1);
        assert_eq!(sink.points().len(), 1);
    }

    #[tokio::test]
    async fn test_drain_cap() {
        let (tx, source) = QueueSource::channel(16);
        let lookup = Arc::new(FakeLookup::with([identity(5, "a", "a-0", "ns")]));
        let config = CollectorConfig {
            max_events_per_drain: 2,
            ..Default::default()
        };
        let mut collection = pipeline(source, lookup, recording_sink(), config);

        for _ in 0..5 {
            tx.send(record(5, 5, 1)).await.unwrap();
        }
        assert_eq!(collection.drain_once().await.unwrap().drained, 2);
        assert_eq!(collection.drain_once().await.unwrap().drained, 2);
        assert_eq!(collection.drain_once().await.unwrap().drained, 1);
        assert_eq!(collection.stats().drains, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_channel_ends_loop() {
        let (tx, source) = QueueSource::channel(16);
        let lookup = Arc::new(FakeLookup::with([identity(5, "a", "a-0", "ns")]));
        let sink = recording_sink();
        let collection = pipeline(source, lookup, sink.clone(), CollectorConfig::default());

        for _ in 0..3 {
            tx.send(record(5, 5, 1)).await.unwrap();
        }
        drop(tx);

        let handle = collection.start(CancellationToken::new());
        assert_eq!(handle.state(), LoopState::Running);
        handle.stopped().await;

        assert_eq!(handle.state(), LoopState::Stopped);
        assert_eq!(handle.stats().events_drained, 3);
        assert!(handle.wait().await.is_ok());
        assert_eq!(sink.points().len(), 6);
    }

    struct BrokenSource;

    impl EventSource for BrokenSource {
        fn try_next(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
            Err(ChannelError::Failed(anyhow::anyhow!("map fd invalid")))
        }
    }

    /// Always has another record ready.
    struct EndlessSource;

    impl EventSource for EndlessSource {
        fn try_next(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
            Ok(Some(record(5, 5, 1_000)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_returns_under_endless_producer() {
        let resolver = Arc::new(IdentityResolver::new(
            Arc::new(FakeLookup::with([identity(5, "a", "a-0", "ns")])),
            Arc::new(IdentityCache::new()),
        ));
        let publisher =
            MetricPublisher::new(recording_sink(), Arc::new(ResourceContext::default()));
        let config = CollectorConfig {
            interval: Duration::from_secs(1),
            max_events_per_drain: 500,
        };
        let collection = CollectionLoop::new(EndlessSource, resolver, publisher, config);
        let handle = collection.start(CancellationToken::new());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let drained = handle.stats().events_drained;
        assert_eq!(drained % 500, 0);
        assert!(drained >= 500);

        tokio::time::timeout(Duration::from_secs(5), handle.stop())
            .await
            .expect("stop did not return")
            .unwrap();
    }

    #[tokio::test]
    async fn test_default_config_bounds_drain() {
        let resolver = Arc::new(IdentityResolver::new(
            Arc::new(FakeLookup::with([identity(5, "a", "a-0", "ns")])),
            Arc::new(IdentityCache::new()),
        ));
        let publisher =
            MetricPublisher::new(recording_sink(), Arc::new(ResourceContext::default()));
        let mut collection =
            CollectionLoop::new(EndlessSource, resolver, publisher, CollectorConfig::default());

        let summary = collection.drain_once().await.unwrap();
        assert_eq!(summary.drained, DEFAULT_MAX_EVENTS_PER_DRAIN);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_channel_is_fatal() {
        let resolver = Arc::new(IdentityResolver::new(
            Arc::new(FakeLookup::default()),
            Arc::new(IdentityCache::new()),
        ));
        let publisher =
            MetricPublisher::new(recording_sink(), Arc::new(ResourceContext::default()));
        let collection =
            CollectionLoop::new(BrokenSource, resolver, publisher, CollectorConfig::default());

        let err = collection
            .start(CancellationToken::new())
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, LoopError::Channel(ChannelError::Failed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_from_running() {
        let (_tx, source) = QueueSource::channel(16);
        let collection = pipeline(
            source,
            Arc::new(FakeLookup::default()),
            recording_sink(),
            CollectorConfig::default(),
        );
        assert_eq!(collection.state(), LoopState::Idle);

        let handle = collection.start(CancellationToken::new());
        let mut states = handle.subscribe();
        assert_eq!(*states.borrow_and_update(), LoopState::Running);

        handle.stop().await.unwrap();
        assert_eq!(*states.borrow(), LoopState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancel_stops_loop() {
        let (_tx, source) = QueueSource::channel(16);
        let collection = pipeline(
            source,
            Arc::new(FakeLookup::default()),
            recording_sink(),
            CollectorConfig::default(),
        );
        let cancel = CancellationToken::new();
        let handle = collection.start(cancel.clone());

        cancel.cancel();
        handle.stopped().await;
        assert!(handle.wait().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_drain_periodically() {
        let (tx, source) = QueueSource::channel(16);
        let lookup = Arc::new(FakeLookup::with([identity(5, "a", "a-0", "ns")]));
        let config = CollectorConfig {
            interval: Duration::from_secs(10),
            ..Default::default()
        };
        let collection = pipeline(source, lookup, recording_sink(), config);
        let handle = collection.start(CancellationToken::new());

        tx.send(record(5, 5, 1)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(handle.stats().drains, 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(handle.stats().drains, 1);
        assert_eq!(handle.stats().events_drained, 1);

        handle.stop().await.unwrap();
    }
}
