//! Dig phase: one producer thread reads the image into a bounded queue,
//! a scanner backend consumes it, and the calling thread merges the results
//! into the offset database strictly in chunk order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use humansize::{format_size, BINARY};
use indicatif::ProgressBar;
use kopis_core::{
    BackendKind, BlockSource, BoundedQueue, Chunk, ChunkHits, ChunkScanner, CpuScanner,
    GpuBatchScanner, Interrupt, OffsetDatabase, RunContext, SpecSet,
};
use kopis_io::ImageReader;
use tracing::{debug, info, warn};

pub type EngineResult<T> = anyhow::Result<T>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    CpuThreadPool { workers: usize },
    GpuBatch,
}

impl Backend {
    pub fn from_context(ctx: &RunContext) -> Self {
        match ctx.options.backend {
            BackendKind::Cpu => Backend::CpuThreadPool {
                workers: ctx.options.workers.max(1),
            },
            BackendKind::Gpu => Backend::GpuBatch,
        }
    }

    fn consumers(self) -> usize {
        match self {
            Backend::CpuThreadPool { workers } => workers.max(1),
            Backend::GpuBatch => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigState {
    Init,
    Scanning,
    Done,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct DigReport {
    pub state: DigState,
    pub chunks_scanned: u64,
    pub bytes_scanned: u64,
    pub headers: usize,
    pub footers: usize,
    pub footers_pruned: usize,
    pub gpu_overflows: u64,
    pub elapsed: Duration,
}

impl DigReport {
    fn new() -> Self {
        Self {
            state: DigState::Init,
            chunks_scanned: 0,
            bytes_scanned: 0,
            headers: 0,
            footers: 0,
            footers_pruned: 0,
            gpu_overflows: 0,
            elapsed: Duration::ZERO,
        }
    }

    pub fn aborted(&self) -> bool {
        self.state == DigState::Aborted
    }
}

enum WorkItem {
    Chunk(Chunk),
    Stop,
}

struct ScanResult {
    index: u64,
    fresh: u64,
    /// `None` when the chunk was skipped because of an interrupt.
    hits: Option<ChunkHits>,
}

/// Builds the scanner for `backend` together with its overflow counter.
pub fn build_scanner(
    backend: Backend,
    specs: &Arc<SpecSet>,
) -> kopis_core::Result<(Arc<dyn ChunkScanner>, Option<Arc<AtomicU64>>)> {
    match backend {
        Backend::CpuThreadPool { .. } => Ok((Arc::new(CpuScanner::new(Arc::clone(specs))), None)),
        Backend::GpuBatch => {
            let scanner = GpuBatchScanner::with_host_device(specs)?;
            let counter = scanner.overflow_counter();
            Ok((Arc::new(scanner), Some(counter)))
        }
    }
}

/// Scans one image and returns its offset database.
///
/// An interrupt stops the producer and makes consumers skip the chunks
/// still queued; the database then covers a clean prefix of the image and
/// the report state is [`DigState::Aborted`].
pub fn dig_image<S>(
    ctx: &RunContext,
    specs: &Arc<SpecSet>,
    source: S,
    progress: &ProgressBar,
) -> EngineResult<(OffsetDatabase, DigReport)>
where
    S: BlockSource + Send,
{
    let start_time = Instant::now();
    let opts = &ctx.options;
    let backend = Backend::from_context(ctx);
    let (scanner, overflow) = build_scanner(backend, specs)?;
    let consumers = backend.consumers();

    let mut report = DigReport::new();
    let mut db = OffsetDatabase::new(specs.len());

    let reader = ImageReader::new(source, opts.chunk_size, specs.overlap(), opts.skip);
    if let Some(len) = reader.scan_len() {
        progress.set_length(len);
        info!(
            size = %format_size(len, BINARY),
            backend = scanner.name(),
            consumers,
            "digging"
        );
    } else {
        info!(backend = scanner.name(), consumers, "digging image of unknown size");
    }

    let queue: BoundedQueue<WorkItem> = BoundedQueue::new(opts.queue_capacity);
    let (result_tx, result_rx): (Sender<ScanResult>, Receiver<ScanResult>) = unbounded();
    let (recycle_tx, recycle_rx): (Sender<Vec<u8>>, Receiver<Vec<u8>>) =
        bounded(opts.queue_capacity + consumers);
    let cancel = AtomicBool::new(false);
    let policy = opts.merge_policy();

    report.state = DigState::Scanning;
    let mut stopped = false;
    let mut merge_error = None;

    let producer_outcome = thread::scope(|s| -> EngineResult<kopis_core::Result<bool>> {
        let producer = thread::Builder::new()
            .name("dig-producer".into())
            .spawn_scoped(s, || {
                producer_thread(reader, &queue, recycle_rx, consumers, &ctx.interrupt, &cancel)
            })
            .context("failed to spawn producer thread")?;

        let mut workers = Vec::with_capacity(consumers);
        for worker_id in 0..consumers {
            let tx = result_tx.clone();
            let recycle_tx = recycle_tx.clone();
            let scanner = Arc::clone(&scanner);
            let (queue, interrupt, cancel) = (&queue, &ctx.interrupt, &cancel);
            let spawned = thread::Builder::new()
                .name(format!("dig-{}-{worker_id}", scanner.name()))
                .spawn_scoped(s, move || {
                    worker_thread(scanner.as_ref(), queue, tx, recycle_tx, interrupt, cancel)
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // The scope joins the producer before returning.
                    abandon_consumers(queue, cancel, consumers - worker_id);
                    return Err(anyhow::Error::new(e).context("failed to spawn scan worker"));
                }
            }
        }
        drop(result_tx);
        drop(recycle_tx);

        let mut pending: BTreeMap<u64, ScanResult> = BTreeMap::new();
        let mut next_index = 0u64;
        for result in result_rx.iter() {
            pending.insert(result.index, result);
            while let Some(result) = pending.remove(&next_index) {
                next_index += 1;
                if stopped {
                    continue;
                }
                let Some(hits) = result.hits else {
                    debug!(chunk = result.index, "chunk skipped, merging stops here");
                    stopped = true;
                    continue;
                };
                match db.merge_chunk(&hits, policy) {
                    Ok(stats) => {
                        report.chunks_scanned += 1;
                        report.bytes_scanned += result.fresh;
                        progress.inc(result.fresh);
                        if stats.misaligned + stats.overlapping > 0 {
                            debug!(
                                chunk = result.index,
                                misaligned = stats.misaligned,
                                overlapping = stats.overlapping,
                                "matches dropped by merge policy"
                            );
                        }
                    }
                    Err(e) => {
                        merge_error = Some(e);
                        stopped = true;
                        cancel.store(true, Ordering::SeqCst);
                    }
                }
            }
        }

        for (i, handle) in workers.into_iter().enumerate() {
            if handle.join().is_err() {
                return Err(anyhow!("scan worker {i} panicked"));
            }
        }
        producer
            .join()
            .map_err(|_| anyhow!("producer thread panicked"))
    })?;

    if let Some(e) = merge_error {
        return Err(anyhow::Error::new(e).context("merging scan results"));
    }
    let reached_end = producer_outcome.context("reading image")?;

    report.state = if reached_end && !stopped {
        DigState::Done
    } else {
        DigState::Aborted
    };

    if !opts.full_database {
        report.footers_pruned = db.prune_unreachable_footers(specs);
    }
    report.headers = db.header_count();
    report.footers = db.footer_count();
    report.gpu_overflows = overflow.map_or(0, |c| c.load(Ordering::Relaxed));
    report.elapsed = start_time.elapsed();

    if report.gpu_overflows > 0 {
        warn!(
            dropped = report.gpu_overflows,
            "gpu result lists overflowed, some matches were not recorded"
        );
    }
    info!(
        state = ?report.state,
        chunks = report.chunks_scanned,
        scanned = %format_size(report.bytes_scanned, BINARY),
        headers = report.headers,
        footers = report.footers,
        elapsed_secs = report.elapsed.as_secs_f64(),
        "dig finished"
    );

    Ok((db, report))
}

/// Feeds chunks into the queue. Returns `Ok(true)` when the whole image was
/// read, `Ok(false)` when reading stopped early. Consumers always receive
/// their stop items.
fn producer_thread<S: BlockSource>(
    mut reader: ImageReader<S>,
    queue: &BoundedQueue<WorkItem>,
    recycle_rx: Receiver<Vec<u8>>,
    consumers: usize,
    interrupt: &Interrupt,
    cancel: &AtomicBool,
) -> kopis_core::Result<bool> {
    let outcome = (|| -> kopis_core::Result<bool> {
        loop {
            if interrupt.is_raised() || cancel.load(Ordering::SeqCst) {
                return Ok(false);
            }
            let buffer = recycle_rx.try_recv().unwrap_or_default();
            match reader.next_chunk(buffer)? {
                Some(chunk) => queue.put(WorkItem::Chunk(chunk)),
                None => return Ok(true),
            }
        }
    })();

    if let Err(e) = &outcome {
        warn!(error = %e, position = reader.position(), "image read failed");
    }
    for _ in 0..consumers {
        queue.put(WorkItem::Stop);
    }
    outcome
}

/// Cancels the dig and takes the stop items meant for `missing` consumers
/// that never started, so the producer can hand out the rest and exit.
fn abandon_consumers(queue: &BoundedQueue<WorkItem>, cancel: &AtomicBool, missing: usize) {
    cancel.store(true, Ordering::SeqCst);
    let mut stops = 0;
    while stops < missing {
        if let WorkItem::Stop = queue.get() {
            stops += 1;
        }
    }
}

fn worker_thread(
    scanner: &dyn ChunkScanner,
    queue: &BoundedQueue<WorkItem>,
    result_tx: Sender<ScanResult>,
    recycle_tx: Sender<Vec<u8>>,
    interrupt: &Interrupt,
    cancel: &AtomicBool,
) {
    loop {
        let chunk = match queue.get() {
            WorkItem::Chunk(chunk) => chunk,
            WorkItem::Stop => break,
        };

        let skip = interrupt.is_raised() || cancel.load(Ordering::SeqCst);
        let hits = (!skip).then(|| scanner.scan(&chunk));
        let result = ScanResult {
            index: chunk.index,
            fresh: chunk.fresh_len() as u64,
            hits,
        };
        if result_tx.send(result).is_err() {
            break;
        }
        let _ = recycle_tx.try_send(chunk.data);
    }
}
