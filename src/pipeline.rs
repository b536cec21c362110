//! The acquisition pipeline: coverage enumeration already happened in
//! `geometry.rs`; this module drives each tile through an ordered chain of
//! sources with bounded per-source concurrency, retry, and fallback.
//!
//! Grounded on the teacher's `stream::iter(...).for_each_concurrent(cfg.fetch_rate, ...)`
//! worker-pool shape in the original `src/fetch.rs`, generalized from one
//! source to an ordered chain of sources connected by bounded `tokio::sync::mpsc`
//! queues — fallback is an explicit dequeue-and-reenqueue onto the next
//! source's queue rather than a loop over one client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use indicatif::ProgressBar;
use log::{debug, info};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;

use crate::config::{Config, RegionSpec, SourceSpec, TileKind};
use crate::error::TileForgeError;
use crate::geometry::{coverage_set, TileCoord};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::source::{BoxedSource, TileResult};
use crate::store::{extension_for, TileStore};

/// A configured source paired with its adapter.
pub struct ConfiguredSource {
    pub spec: SourceSpec,
    pub adapter: BoxedSource,
}

/// A broadcastable one-shot-ish condition: waiters created before `fire()`
/// are woken; `is_set()` short-circuits everyone who checks afterwards.
#[derive(Clone)]
struct Signal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Signal {
    fn new() -> Self {
        Signal {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    fn fire(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        loop {
            if self.is_set() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// External cancellation handle. Cloneable, cheap, shareable across the
/// orchestrator and every pipeline task.
#[derive(Clone)]
pub struct CancelToken(Signal);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Signal::new())
    }

    pub fn cancel(&self) {
        self.0.fire();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_set()
    }

    pub async fn cancelled(&self) {
        self.0.wait().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PipelineCounts {
    pub attempted: usize,
    pub stored: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Default)]
struct ProgressCounters {
    attempted: AtomicUsize,
    stored: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
}

impl ProgressCounters {
    fn snapshot(&self) -> PipelineCounts {
        PipelineCounts {
            attempted: self.attempted.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct SourceSummary {
    pub stored: usize,
    pub failed: usize,
    pub transient_errors: usize,
    pub invalid: usize,
    pub empty: usize,
    pub not_found: usize,
}

pub struct RegionAcquisitionReport {
    pub counts: PipelineCounts,
    pub per_source: HashMap<String, SourceSummary>,
    pub uncoverable: usize,
}

impl RegionAcquisitionReport {
    pub fn all_failed(&self) -> bool {
        self.counts.stored == 0 && (self.counts.failed > 0 || self.uncoverable > 0) && self.counts.attempted + self.uncoverable > 0
    }
}

#[derive(Clone, Debug)]
struct WorkItem {
    coord: TileCoord,
    candidates: Arc<Vec<usize>>,
    next_idx: usize,
}

struct PipelineContext {
    region_name: String,
    sources: Arc<Vec<ConfiguredSource>>,
    senders: Arc<Vec<mpsc::Sender<WorkItem>>>,
    store: Arc<TileStore>,
    retry_policy: RetryPolicy,
    counters: Arc<ProgressCounters>,
    summaries: Arc<Mutex<HashMap<String, SourceSummary>>>,
    pending: Arc<AtomicUsize>,
    completed: Signal,
    cancel: CancelToken,
    workers_per_source: usize,
    progress: Option<ProgressBar>,
}

impl PipelineContext {
    fn mark_terminal(&self) {
        let prev = self.pending.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.completed.fire();
        }
        if let Some(bar) = &self.progress {
            bar.inc(1);
        }
    }

    fn record(&self, source_name: &str, apply: impl FnOnce(&mut SourceSummary)) {
        let mut summaries = self.summaries.lock().unwrap();
        let entry = summaries.entry(source_name.to_string()).or_default();
        apply(entry);
    }
}

/// Orders source indices so that, within each tile-kind, original config
/// order is preserved, with vector-kind sources preceding raster-kind ones
/// by default (spec.md §4.6; flipped when `Config.vector_first` is false).
fn ordered_source_indices(sources: &[ConfiguredSource], vector_first: bool) -> Vec<usize> {
    let (mut vector, mut raster) = (Vec::new(), Vec::new());
    for (idx, s) in sources.iter().enumerate() {
        match s.spec.tile_kind {
            TileKind::Vector => vector.push(idx),
            TileKind::Raster => raster.push(idx),
        }
    }
    if vector_first {
        vector.extend(raster);
        vector
    } else {
        raster.extend(vector);
        raster
    }
}

fn candidates_for(sources: &[ConfiguredSource], ordered: &[usize], coord: TileCoord) -> Vec<usize> {
    ordered.iter().copied().filter(|&idx| sources[idx].adapter.accepts(coord)).collect()
}

async fn process_item(item: WorkItem, ctx: Arc<PipelineContext>) {
    let source_idx = item.candidates[item.next_idx];
    let source = &ctx.sources[source_idx];
    let source_name = source.adapter.name().to_string();

    ctx.counters.attempted.fetch_add(1, Ordering::Relaxed);

    if ctx
        .store
        .exists_any_extension(&ctx.region_name, &source_name, source.spec.tile_kind, item.coord)
        .await
    {
        ctx.counters.stored.fetch_add(1, Ordering::Relaxed);
        ctx.record(&source_name, |s| s.stored += 1);
        ctx.mark_terminal();
        return;
    }

    // A filesystem write failure is treated as Transient for *this* tile on
    // *this* source (spec.md §7) — it shares the fetch retry loop rather than
    // immediately falling back, since the fetched bytes were already valid.
    let mut attempt = 1u32;
    let outcome = loop {
        if ctx.cancel.is_cancelled() {
            return;
        }

        let result = source.adapter.fetch(item.coord).await;

        let result = if let TileResult::Got { bytes, content_type, .. } = &result {
            let ext = extension_for(source.spec.tile_kind, content_type.as_deref());
            match ctx
                .store
                .store(&ctx.region_name, &source_name, source.spec.tile_kind, item.coord, ext, bytes)
                .await
            {
                Ok(_) => {
                    ctx.counters.stored.fetch_add(1, Ordering::Relaxed);
                    ctx.record(&source_name, |s| s.stored += 1);
                    ctx.mark_terminal();
                    return;
                }
                Err(e) => {
                    debug!("store write failed for {:?} on {source_name}: {e}", item.coord);
                    TileResult::Transient {
                        reason: format!("store error: {e}"),
                    }
                }
            }
        } else {
            result
        };

        match ctx.retry_policy.decide(attempt, &result) {
            RetryDecision::RetryAfter(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {},
                    _ = ctx.cancel.cancelled() => return,
                }
                attempt += 1;
            }
            RetryDecision::GiveUp => break result,
        }
    };

    match outcome {
        TileResult::Got { .. } => unreachable!("Got always returns early on successful store"),
        TileResult::Empty => {
            advance_or_fail(item, ctx.clone(), &source_name, |s| s.empty += 1).await;
        }
        TileResult::NotFound => {
            advance_or_fail(item, ctx.clone(), &source_name, |s| s.not_found += 1).await;
        }
        TileResult::Invalid { reason } => {
            debug!("tile {:?} invalid on {source_name}: {reason}", item.coord);
            advance_or_fail(item, ctx.clone(), &source_name, |s| s.invalid += 1).await;
        }
        TileResult::Transient { reason } => {
            debug!("tile {:?} exhausted retries on {source_name}: {reason}", item.coord);
            advance_or_fail(item, ctx.clone(), &source_name, |s| s.transient_errors += 1).await;
        }
    }
}

async fn advance_or_fail(item: WorkItem, ctx: Arc<PipelineContext>, source_name: &str, apply: impl FnOnce(&mut SourceSummary)) {
    ctx.record(source_name, apply);

    if item.next_idx + 1 < item.candidates.len() {
        let next = WorkItem {
            coord: item.coord,
            candidates: item.candidates.clone(),
            next_idx: item.next_idx + 1,
        };
        let next_source_idx = next.candidates[next.next_idx];
        let sender = ctx.senders[next_source_idx].clone();
        tokio::select! {
            res = sender.send(next) => {
                if res.is_err() {
                    ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
                    ctx.mark_terminal();
                }
            }
            _ = ctx.cancel.cancelled() => {}
        }
    } else {
        debug!("tile {:?} failed on all candidate sources", item.coord);
        ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
        ctx.mark_terminal();
    }
}

async fn run_source_pool(idx: usize, mut rx: mpsc::Receiver<WorkItem>, ctx: Arc<PipelineContext>) {
    let semaphore = Arc::new(tokio::sync::Semaphore::new(ctx.workers_per_source.max(1)));
    let mut tasks = JoinSet::new();
    debug!("source pool '{}' started", ctx.sources[idx].adapter.name());

    loop {
        tokio::select! {
            item = rx.recv() => {
                match item {
                    Some(item) => {
                        let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
                        let ctx = ctx.clone();
                        tasks.spawn(async move {
                            let _permit = permit;
                            process_item(item, ctx).await;
                        });
                    }
                    None => break,
                }
            }
            _ = ctx.completed.wait() => break,
            _ = ctx.cancel.cancelled() => break,
        }
    }

    while tasks.join_next().await.is_some() {}
}

/// Builds the candidate-filtered coverage and drives it through the source
/// chain until every tile reaches a terminal state, or cancellation fires.
pub async fn run_region(
    region_name: &str,
    region_spec: &RegionSpec,
    config: &Config,
    sources: Arc<Vec<ConfiguredSource>>,
    store: Arc<TileStore>,
    cancel: CancelToken,
    progress: Option<ProgressBar>,
) -> Result<RegionAcquisitionReport, TileForgeError> {
    let coverage = coverage_set(&region_spec.bbox(), region_spec.min_zoom, region_spec.max_zoom);
    let ordered = ordered_source_indices(&sources, config.vector_first);

    if let Some(bar) = &progress {
        bar.set_length(coverage.len() as u64);
    }

    let counters = Arc::new(ProgressCounters::default());
    let summaries = Arc::new(Mutex::new(HashMap::new()));
    for s in sources.iter() {
        summaries.lock().unwrap().entry(s.spec.name.clone()).or_default();
    }

    let queue_cap = (config.workers_per_source * 4).max(16);
    let mut receivers = Vec::with_capacity(sources.len());
    let mut senders = Vec::with_capacity(sources.len());
    for _ in sources.iter() {
        let (tx, rx) = mpsc::channel(queue_cap);
        senders.push(tx);
        receivers.push(Some(rx));
    }
    let senders = Arc::new(senders);

    let pending = Arc::new(AtomicUsize::new(0));
    let completed = Signal::new();

    let ctx = Arc::new(PipelineContext {
        region_name: region_name.to_string(),
        sources: sources.clone(),
        senders: senders.clone(),
        store,
        retry_policy: RetryPolicy::new(config.retry_attempts),
        counters: counters.clone(),
        summaries: summaries.clone(),
        pending: pending.clone(),
        completed: completed.clone(),
        cancel: cancel.clone(),
        workers_per_source: config.workers_per_source,
        progress: progress.clone(),
    });

    let mut pool_handles = Vec::with_capacity(sources.len());
    for (idx, rx) in receivers.into_iter().enumerate() {
        let ctx = ctx.clone();
        let rx = rx.expect("receiver taken exactly once");
        pool_handles.push(tokio::spawn(run_source_pool(idx, rx, ctx)));
    }

    let mut uncoverable = 0usize;
    let mut dispatched = 0usize;

    'dispatch: for coord in coverage {
        if cancel.is_cancelled() {
            break 'dispatch;
        }

        let candidates = candidates_for(&sources, &ordered, coord);
        if candidates.is_empty() {
            uncoverable += 1;
            counters.skipped.fetch_add(1, Ordering::Relaxed);
            if let Some(bar) = &progress {
                bar.inc(1);
            }
            continue;
        }

        dispatched += 1;
        pending.fetch_add(1, Ordering::Relaxed);

        let first_idx = candidates[0];
        let item = WorkItem {
            coord,
            candidates: Arc::new(candidates),
            next_idx: 0,
        };

        tokio::select! {
            res = senders[first_idx].send(item) => {
                if res.is_err() {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    pending.fetch_sub(1, Ordering::AcqRel);
                }
            }
            _ = cancel.cancelled() => break 'dispatch,
        }
    }

    if dispatched == 0 {
        completed.fire();
    }

    tokio::select! {
        _ = completed.wait() => {}
        _ = cancel.cancelled() => {}
    }

    for handle in pool_handles {
        let _ = handle.await;
    }

    if let Some(bar) = &progress {
        bar.finish();
    }

    if cancel.is_cancelled() {
        return Err(TileForgeError::Cancelled);
    }

    info!(
        "region {region_name}: {} stored, {} failed, {} skipped (uncoverable)",
        counters.stored.load(Ordering::Relaxed),
        counters.failed.load(Ordering::Relaxed),
        uncoverable
    );

    let per_source = summaries.lock().unwrap().clone();

    Ok(RegionAcquisitionReport {
        counts: counters.snapshot(),
        per_source,
        uncoverable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceKind;
    use crate::geometry::BBox;
    use async_trait::async_trait;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::AtomicU32;

    #[derive(Debug)]
    struct FakeSource {
        name: String,
        tile_kind: TileKind,
        calls: Arc<AtomicU32>,
        behavior: fn(u32) -> TileResult,
    }

    #[async_trait]
    impl crate::source::Source for FakeSource {
        fn name(&self) -> &str {
            &self.name
        }
        fn tile_kind(&self) -> TileKind {
            self.tile_kind
        }
        fn min_zoom(&self) -> Option<u8> {
            None
        }
        fn max_zoom(&self) -> Option<u8> {
            None
        }
        fn bounds(&self) -> Option<BBox> {
            None
        }
        async fn fetch(&self, _coord: TileCoord) -> TileResult {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            (self.behavior)(call)
        }
    }

    fn spec(name: &str, kind: TileKind) -> SourceSpec {
        SourceSpec {
            name: name.to_string(),
            kind: SourceKind::Http,
            tile_kind: kind,
            url_template: Some("https://example/{z}/{x}/{y}.png".into()),
            path: None,
            headers: StdHashMap::new(),
            min_zoom: None,
            max_zoom: None,
        }
    }

    fn region() -> RegionSpec {
        RegionSpec {
            bbox: [28.5, 40.8, 29.5, 41.2],
            min_zoom: 10,
            max_zoom: 10,
            description: None,
        }
    }

    fn base_config(workers: usize, retries: u32, vector_first: bool) -> Config {
        Config {
            regions: StdHashMap::new(),
            sources: vec![],
            output_dir: std::env::temp_dir(),
            workers_per_source: workers,
            retry_attempts: retries,
            timeout_secs: 5,
            user_agent: "test".into(),
            vector_first,
            empty_tile_fingerprints: vec![],
        }
    }

    #[tokio::test]
    async fn fallback_prefers_earlier_source_on_success() {
        let vector_calls = Arc::new(AtomicU32::new(0));
        let raster_calls = Arc::new(AtomicU32::new(0));

        let vector = ConfiguredSource {
            spec: spec("vec", TileKind::Vector),
            adapter: Arc::new(FakeSource {
                name: "vec".into(),
                tile_kind: TileKind::Vector,
                calls: vector_calls.clone(),
                behavior: |_| TileResult::NotFound,
            }),
        };
        let raster = ConfiguredSource {
            spec: spec("ras", TileKind::Raster),
            adapter: Arc::new(FakeSource {
                name: "ras".into(),
                tile_kind: TileKind::Raster,
                calls: raster_calls.clone(),
                behavior: |_| TileResult::Got {
                    bytes: vec![0x89, 0x50, 0x4E, 0x47, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16],
                    content_type: Some("image/png".into()),
                    source_name: "ras".into(),
                },
            }),
        };

        let sources = Arc::new(vec![vector, raster]);
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TileStore::new(dir.path().to_owned()));
        let config = base_config(4, 2, true);
        let report = run_region("istanbul", &region(), &config, sources, store, CancelToken::new(), None)
            .await
            .unwrap();

        assert_eq!(report.per_source["ras"].stored, report.counts.stored);
        assert_eq!(report.per_source["vec"].stored, 0);
        assert_eq!(report.per_source["vec"].not_found, report.counts.stored);
        assert_eq!(report.uncoverable, 0);
    }

    #[tokio::test]
    async fn single_source_404_marks_all_failed() {
        let calls = Arc::new(AtomicU32::new(0));
        let source = ConfiguredSource {
            spec: spec("ras", TileKind::Raster),
            adapter: Arc::new(FakeSource {
                name: "ras".into(),
                tile_kind: TileKind::Raster,
                calls,
                behavior: |_| TileResult::NotFound,
            }),
        };

        let sources = Arc::new(vec![source]);
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TileStore::new(dir.path().to_owned()));
        let config = base_config(4, 2, true);
        let report = run_region("istanbul", &region(), &config, sources, store, CancelToken::new(), None)
            .await
            .unwrap();

        assert_eq!(report.counts.stored, 0);
        assert!(report.counts.failed > 0);
        assert!(report.all_failed());
    }

    #[tokio::test]
    async fn transient_retries_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let source = ConfiguredSource {
            spec: spec("ras", TileKind::Raster),
            adapter: Arc::new(FakeSource {
                name: "ras".into(),
                tile_kind: TileKind::Raster,
                calls: calls.clone(),
                behavior: |call| {
                    if call < 2 {
                        TileResult::Transient { reason: "500".into() }
                    } else {
                        TileResult::Got {
                            bytes: vec![0x89, 0x50, 0x4E, 0x47, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16],
                            content_type: Some("image/png".into()),
                            source_name: "ras".into(),
                        }
                    }
                },
            }),
        };

        let sources = Arc::new(vec![source]);
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TileStore::new(dir.path().to_owned()));
        let config = base_config(4, 3, true);
        let report = run_region("istanbul", &region(), &config, sources, store, CancelToken::new(), None)
            .await
            .unwrap();

        assert_eq!(report.counts.stored, report.counts.attempted - report.counts.failed);
        assert_eq!(report.per_source["ras"].stored, report.counts.stored);
    }

    #[tokio::test]
    async fn uncoverable_when_no_source_accepts_zoom() {
        let source = ConfiguredSource {
            spec: SourceSpec {
                min_zoom: Some(15),
                max_zoom: Some(18),
                ..spec("ras", TileKind::Raster)
            },
            adapter: Arc::new(crate::source::http::HttpSource::new(
                &SourceSpec {
                    min_zoom: Some(15),
                    max_zoom: Some(18),
                    ..spec("ras", TileKind::Raster)
                },
                "test",
                std::time::Duration::from_secs(1),
                Arc::new(crate::validator::Validator::new(&[])),
            )
            .unwrap()),
        };

        let sources = Arc::new(vec![source]);
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TileStore::new(dir.path().to_owned()));
        let config = base_config(2, 1, true);
        let report = run_region("istanbul", &region(), &config, sources, store, CancelToken::new(), None)
            .await
            .unwrap();

        assert_eq!(report.uncoverable, report.counts.skipped);
        assert!(report.uncoverable > 0);
        assert_eq!(report.counts.stored, 0);
    }
}
