//! The indexing service: schedules checkpoint ranges, dispatches events to
//! indexing functions, and rewinds the record store on reorgs.
//!
//! # Dispatch
//! `process_events()` reads the aggregator checkpoint, asks the scheduler for
//! the next `[from, to]` window, and pulls pages for it one at a time. Events
//! are dispatched strictly in page order, one handler at a time. The watermark
//! only moves at page boundaries, and to `to` once the window is drained.
//!
//! # Halting
//! The first handler failure is recorded as a [`PipelineError`]. From then on
//! `process_events()` and `handle_reorg()` are no-ops until `reset()`.
//!
//! # Generations
//! Every `reset()` starts a new generation with a new store version. A run
//! that started under an older generation stops at its next check and never
//! touches the watermark or metrics of the new one; its store writes fail with
//! `StaleVersion`.

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use chainsync_core::aggregator::{AggregatorEvent, EventAggregator};
use chainsync_core::config::{IndexingConfig, ServiceState};
use chainsync_core::context::{Db, IndexingContext};
use chainsync_core::error::{IndexerError, PipelineError};
use chainsync_core::handler::{HandlerRegistry, IndexingFunctions, SETUP_LABEL};
use chainsync_core::metrics::IndexingMetrics;
use chainsync_core::scheduler::{CheckpointScheduler, FetchRange};
use chainsync_core::schema::Schema;
use chainsync_core::store::{RecordStore, StoreVersion};
use chainsync_core::types::{EventPage, LogEvent};

struct ServiceInner {
    generation: u64,
    scheduler: CheckpointScheduler,
    registry: Arc<HandlerRegistry>,
    schema: Arc<Schema>,
    version: Option<StoreVersion>,
    pipeline_error: Option<PipelineError>,
    setup_pending: bool,
    state: ServiceState,
    /// Generation of the `process_events` call holding the run lock.
    running: Option<u64>,
}

/// Everything a single `process_events()` call needs, captured at its start.
struct Run {
    generation: u64,
    registry: Arc<HandlerRegistry>,
    schema: Arc<Schema>,
    version: StoreVersion,
}

/// Outcome of dispatching one page.
enum PageOutcome {
    Completed,
    Stopped,
}

/// The indexing service.
pub struct IndexingService {
    config: IndexingConfig,
    aggregator: Mutex<Option<Arc<dyn EventAggregator>>>,
    store: Arc<dyn RecordStore>,
    metrics: Arc<IndexingMetrics>,
    /// Serializes `process_events` and `handle_reorg`.
    run_lock: tokio::sync::Mutex<()>,
    inner: Mutex<ServiceInner>,
    shutdown: watch::Sender<bool>,
}

impl IndexingService {
    pub fn new(
        config: IndexingConfig,
        aggregator: Arc<dyn EventAggregator>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            aggregator: Mutex::new(Some(aggregator)),
            store,
            metrics: Arc::new(IndexingMetrics::new()),
            run_lock: tokio::sync::Mutex::new(()),
            inner: Mutex::new(ServiceInner {
                generation: 0,
                scheduler: CheckpointScheduler::new(),
                registry: Arc::new(HandlerRegistry::default()),
                schema: Arc::new(Schema::default()),
                version: None,
                pipeline_error: None,
                setup_pending: false,
                state: ServiceState::Uninitialized,
                running: None,
            }),
            shutdown,
        }
    }

    // ─── Accessors ──────────────────────────────────────────────────────────

    pub fn config(&self) -> &IndexingConfig {
        &self.config
    }

    /// This instance's metrics.
    pub fn metrics(&self) -> Arc<IndexingMetrics> {
        self.metrics.clone()
    }

    /// Last fully dispatched timestamp; `None` right after a reset.
    pub fn watermark(&self) -> Option<u64> {
        self.inner.lock().unwrap().scheduler.watermark()
    }

    /// The recorded handler failure, if the pipeline is halted.
    pub fn pipeline_error(&self) -> Option<PipelineError> {
        self.inner.lock().unwrap().pipeline_error.clone()
    }

    pub fn state(&self) -> ServiceState {
        self.inner.lock().unwrap().state
    }

    /// Store version created by the most recent reset.
    pub fn store_version(&self) -> Option<StoreVersion> {
        self.inner.lock().unwrap().version
    }

    pub fn is_killed(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn aggregator(&self) -> Option<Arc<dyn EventAggregator>> {
        self.aggregator.lock().unwrap().clone()
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────────

    /// Rebuild the record store from `schema`, rebuild the handler registry
    /// from `functions`, and zero the watermark, metrics and pipeline error.
    ///
    /// Does not wait for an in-flight `process_events()`; that run belongs to
    /// the superseded generation and stops on its own.
    pub async fn reset(
        &self,
        schema: Schema,
        functions: IndexingFunctions,
    ) -> Result<(), IndexerError> {
        if self.is_killed() {
            return Err(IndexerError::Killed);
        }
        let registry = HandlerRegistry::build(&self.config.sources, &functions)?;
        let version = self.store.rebuild(&schema).await?;

        let mut inner = self.inner.lock().unwrap();
        inner.generation += 1;
        inner.scheduler.reset();
        inner.setup_pending = registry.setup().is_some();
        inner.registry = Arc::new(registry);
        inner.schema = Arc::new(schema);
        inner.version = Some(version);
        inner.pipeline_error = None;
        inner.state = ServiceState::Idle;

        self.metrics.reset();
        self.metrics.record_matched(SETUP_LABEL, 1);

        info!(
            indexer = %self.config.id,
            %version,
            generation = inner.generation,
            handlers = inner.registry.len(),
            "Indexing service reset"
        );
        Ok(())
    }

    /// Cancel any in-flight work and release the aggregator. Idempotent.
    pub fn kill(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        self.aggregator.lock().unwrap().take();
        self.inner.lock().unwrap().state = ServiceState::Killed;
        info!(indexer = %self.config.id, "Indexing service killed");
    }

    /// Follow the aggregator: process every new checkpoint and rewind on every
    /// reorg until `kill()` is called or the aggregator goes away.
    pub async fn run(&self) -> Result<(), IndexerError> {
        let mut shutdown = self.shutdown.subscribe();
        let mut notifications = match self.aggregator() {
            Some(aggregator) => aggregator.subscribe(),
            None => return Err(IndexerError::Killed),
        };

        self.process(true).await?;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => continue,
                msg = notifications.recv() => match msg {
                    Ok(AggregatorEvent::NewCheckpoint { timestamp }) => {
                        debug!(checkpoint = timestamp, "New checkpoint");
                        self.process(true).await?;
                    }
                    Ok(AggregatorEvent::Reorg { common_ancestor_timestamp }) => {
                        self.handle_reorg(common_ancestor_timestamp).await?;
                        self.process(true).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Aggregator notifications lagged; catching up");
                        self.process(true).await?;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        info!(indexer = %self.config.id, "Indexing run loop stopped");
        Ok(())
    }

    // ─── Dispatch ───────────────────────────────────────────────────────────

    /// Dispatch everything between the watermark and the aggregator
    /// checkpoint.
    ///
    /// Returns immediately if another call of the current generation is in
    /// progress, the pipeline is halted, or the service was killed. A call
    /// left over from before the last `reset()` is waited out instead.
    /// Aggregator and store errors are returned with the watermark left at
    /// the last completed page.
    pub async fn process_events(&self) -> Result<(), IndexerError> {
        self.process(false).await
    }

    /// `wait`: queue behind whoever holds the run lock instead of returning.
    async fn process(&self, wait: bool) -> Result<(), IndexerError> {
        let _guard = match self.run_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) if wait || self.holder_superseded() => {
                debug!("Waiting for the run lock");
                self.run_lock.lock().await
            }
            Err(_) => {
                debug!("process_events already running");
                return Ok(());
            }
        };

        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }
        let Some(aggregator) = self.aggregator() else {
            return Ok(());
        };

        let (run, setup_pending) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.pipeline_error.is_some() {
                debug!("Pipeline halted; skipping process_events");
                return Ok(());
            }
            let version = inner.version.ok_or_else(|| {
                IndexerError::Other("reset() must be called before process_events()".into())
            })?;
            inner.state = ServiceState::Processing;
            inner.running = Some(inner.generation);
            (
                Run {
                    generation: inner.generation,
                    registry: inner.registry.clone(),
                    schema: inner.schema.clone(),
                    version,
                },
                inner.setup_pending,
            )
        };

        let result = self
            .dispatch(&run, setup_pending, aggregator.as_ref(), &mut shutdown)
            .await;

        let mut inner = self.inner.lock().unwrap();
        inner.running = None;
        if inner.generation == run.generation && inner.state == ServiceState::Processing {
            inner.state = ServiceState::Idle;
        }
        result
    }

    /// `true` if the run lock is held by a `process_events` call started
    /// before the last reset.
    fn holder_superseded(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.running.is_some_and(|g| g != inner.generation)
    }

    async fn dispatch(
        &self,
        run: &Run,
        setup_pending: bool,
        aggregator: &dyn EventAggregator,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), IndexerError> {
        if setup_pending && !self.run_setup(run, shutdown).await {
            return Ok(());
        }

        loop {
            let checkpoint = aggregator.checkpoint();
            let range = {
                let inner = self.inner.lock().unwrap();
                if inner.generation != run.generation {
                    return Ok(());
                }
                match inner.scheduler.next_range(checkpoint) {
                    Some(range) => range,
                    None => return Ok(()),
                }
            };

            info!(from = range.from, to = range.to, "Processing events");
            let mut pages = aggregator.get_events(range.from, range.to);
            let mut page_count = 0usize;

            loop {
                let next = tokio::select! {
                    biased;
                    _ = shutdown.changed() => {
                        debug!(%range, "Killed while fetching");
                        return Ok(());
                    }
                    next = pages.next() => next,
                };
                let page = match next {
                    None => break,
                    Some(Err(e)) => {
                        warn!(%range, error = %e, "Event fetch failed");
                        return Err(e);
                    }
                    Some(Ok(page)) => page,
                };
                page_count += 1;

                match self.dispatch_page(run, &page, range, shutdown).await {
                    PageOutcome::Completed => {}
                    PageOutcome::Stopped => return Ok(()),
                }
            }

            if !self.advance(run, range.to) {
                return Ok(());
            }
            info!(from = range.from, to = range.to, pages = page_count, "Range complete");
        }
    }

    async fn dispatch_page(
        &self,
        run: &Run,
        page: &EventPage,
        range: FetchRange,
        shutdown: &mut watch::Receiver<bool>,
    ) -> PageOutcome {
        let counted = self.if_current(run, |metrics| {
            for count in &page.metadata.counts {
                metrics.record_matched(&run.registry.label_for(&count.source, &count.selector), count.count);
            }
        });
        if !counted {
            return PageOutcome::Stopped;
        }

        for event in &page.events {
            let Some(entry) = run.registry.lookup(event) else {
                continue;
            };
            if !self.if_current(run, |m| m.record_handled(&entry.label)) {
                return PageOutcome::Stopped;
            }

            let ctx = self.context(run, Some(event), event.block.timestamp);
            let outcome = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    debug!(event = %entry.safe_name, "Killed during dispatch");
                    return PageOutcome::Stopped;
                }
                res = entry.handler.handle(event, &ctx) => res,
            };

            match outcome {
                Ok(()) => {
                    if !self.if_current(run, |m| m.record_processed(&entry.label)) {
                        return PageOutcome::Stopped;
                    }
                }
                Err(e) => {
                    self.halt(run, &entry.label, Some(event), e);
                    return PageOutcome::Stopped;
                }
            }
        }

        let ends_at = page.metadata.page_ends_at_timestamp.min(range.to);
        if ends_at >= range.from {
            if !self.advance(run, ends_at) {
                return PageOutcome::Stopped;
            }
            debug!(
                events = page.events.len(),
                watermark = ends_at,
                "Page complete"
            );
        }
        PageOutcome::Completed
    }

    /// Run the setup function. Returns `false` if dispatch must stop.
    async fn run_setup(&self, run: &Run, shutdown: &mut watch::Receiver<bool>) -> bool {
        let Some(setup) = run.registry.setup().cloned() else {
            return true;
        };
        if !self.if_current(run, |m| m.record_handled(SETUP_LABEL)) {
            return false;
        }
        let ctx = self.context(run, None, 0);
        let outcome = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                debug!("Killed during setup");
                return false;
            }
            res = setup.setup(&ctx) => res,
        };
        match outcome {
            Ok(()) => {
                let mut inner = self.inner.lock().unwrap();
                if inner.generation != run.generation {
                    return false;
                }
                inner.setup_pending = false;
                self.metrics.record_processed(SETUP_LABEL);
                debug!("Setup complete");
                true
            }
            Err(e) => {
                self.halt(run, SETUP_LABEL, None, e);
                false
            }
        }
    }

    fn context(&self, run: &Run, event: Option<&LogEvent>, timestamp: u64) -> IndexingContext {
        IndexingContext::new(
            self.config.chain.clone(),
            event.map(|e| e.block.clone()),
            Db::new(self.store.clone(), run.schema.clone(), run.version, timestamp),
        )
    }

    /// Apply a metrics update only if `run` still belongs to the live
    /// generation. The state lock is held so a concurrent reset can't
    /// interleave with the update.
    fn if_current(&self, run: &Run, update: impl FnOnce(&IndexingMetrics)) -> bool {
        let inner = self.inner.lock().unwrap();
        if inner.generation != run.generation {
            debug!(generation = run.generation, "Run superseded by reset");
            return false;
        }
        update(&self.metrics);
        true
    }

    /// Move the watermark (and gauge) to `timestamp`.
    fn advance(&self, run: &Run, timestamp: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.generation != run.generation {
            return false;
        }
        inner.scheduler.advance(timestamp);
        self.metrics
            .set_latest_processed_timestamp(inner.scheduler.processed_through());
        true
    }

    fn halt(&self, run: &Run, label: &str, event: Option<&LogEvent>, err: anyhow::Error) {
        let mut inner = self.inner.lock().unwrap();
        if inner.generation != run.generation {
            debug!(label, error = %err, "Ignoring failure from superseded run");
            return;
        }
        let pipeline_error = PipelineError::new(label, event, &err);
        error!(
            indexer = %self.config.id,
            function = label,
            block = ?pipeline_error.block_number,
            log = ?pipeline_error.log_id,
            error = %pipeline_error.reason,
            "Indexing function failed; pipeline halted until reset"
        );
        inner.pipeline_error = Some(pipeline_error);
        inner.state = ServiceState::Halted;
    }

    // ─── Reorg ──────────────────────────────────────────────────────────────

    /// Rewind the store and watermark to `common_ancestor_timestamp`.
    ///
    /// No-op if the pipeline is halted, or if nothing after the ancestor has
    /// been processed. Waits for an in-flight `process_events()` to finish.
    pub async fn handle_reorg(&self, common_ancestor_timestamp: u64) -> Result<(), IndexerError> {
        let _guard = self.run_lock.lock().await;
        if self.is_killed() {
            return Ok(());
        }

        let (generation, version, watermark) = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(e) = &inner.pipeline_error {
                warn!(
                    common_ancestor_timestamp,
                    halted_by = %e,
                    "Ignoring reorg: pipeline is halted"
                );
                return Ok(());
            }
            let Some(version) = inner.version else {
                return Ok(());
            };
            match inner.scheduler.watermark() {
                Some(w) if common_ancestor_timestamp < w => {
                    inner.state = ServiceState::ReorgRecovery;
                    (inner.generation, version, w)
                }
                watermark => {
                    debug!(
                        common_ancestor_timestamp,
                        ?watermark,
                        "Reorg does not affect processed range"
                    );
                    return Ok(());
                }
            }
        };

        let reverted = self.store.revert(version, common_ancestor_timestamp).await;

        let mut inner = self.inner.lock().unwrap();
        if inner.generation != generation {
            return Ok(());
        }
        inner.state = ServiceState::Idle;
        reverted?;

        inner.scheduler.rewind(common_ancestor_timestamp);
        self.metrics
            .set_latest_processed_timestamp(common_ancestor_timestamp);
        self.metrics.record_reorg();
        info!(
            indexer = %self.config.id,
            from = watermark,
            to = common_ancestor_timestamp,
            "Reorg handled; store and watermark rewound"
        );
        Ok(())
    }
}
