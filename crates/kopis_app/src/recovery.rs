//! Carve phase: turns planned tasks into output files, or into audit
//! entries only when previewing.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use indicatif::ProgressBar;
use kopis_core::{BlockSource, CarveTask, OutputLayout, RunContext, SpecSet};
use kopis_io::Reader;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::audit::{AuditEntry, AuditLog};

pub const EXTRACTION_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CarveOutcome {
    /// Written to disk, or measured only in preview mode.
    Done,
    /// Not attempted because of an interrupt.
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct CarvedFile {
    pub task: CarveTask,
    pub path: PathBuf,
    pub length: u64,
    pub outcome: CarveOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct CarveSummary {
    pub files: Vec<CarvedFile>,
    pub completed: usize,
    pub failed: usize,
    pub interrupted: bool,
}

impl CarveSummary {
    pub fn completed_files(&self) -> impl Iterator<Item = &CarvedFile> {
        self.files.iter().filter(|f| f.outcome == CarveOutcome::Done)
    }
}

/// The image a batch of tasks reads from.
#[derive(Debug, Clone, Copy)]
pub struct CarveSource<'a> {
    pub path: &'a Path,
    pub len: Option<u64>,
}

/// Executes `tasks` against one image.
///
/// Output paths are reserved from `layout` in task order before anything
/// runs, so numbering does not depend on scheduling. An interrupt raised
/// after this call starts stops the tasks that have not begun yet.
pub fn carve_image(
    ctx: &RunContext,
    specs: &SpecSet,
    source: CarveSource<'_>,
    tasks: Vec<CarveTask>,
    layout: &mut OutputLayout,
    audit: Option<&AuditLog>,
    progress: &ProgressBar,
) -> anyhow::Result<CarveSummary> {
    let baseline = ctx.interrupt.count();
    carve_since(ctx, specs, source, tasks, layout, audit, progress, baseline)
}

#[allow(clippy::too_many_arguments)]
fn carve_since(
    ctx: &RunContext,
    specs: &SpecSet,
    source: CarveSource<'_>,
    tasks: Vec<CarveTask>,
    layout: &mut OutputLayout,
    audit: Option<&AuditLog>,
    progress: &ProgressBar,
    baseline: usize,
) -> anyhow::Result<CarveSummary> {
    let preview = ctx.options.preview;
    progress.set_length(tasks.len() as u64);

    let jobs: Vec<(CarveTask, PathBuf)> = tasks
        .into_iter()
        .map(|task| {
            let extension = specs.get(task.type_index).and_then(|s| s.extension());
            let path = layout.next_path(task.type_index, &task.suffix, extension);
            (task, path)
        })
        .collect();

    let files: Vec<CarvedFile> = if preview {
        jobs.into_iter()
            .map(|(task, path)| {
                let length = task.length(source.len);
                progress.inc(1);
                CarvedFile {
                    task,
                    path,
                    length,
                    outcome: CarveOutcome::Done,
                }
            })
            .collect()
    } else {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(ctx.options.workers.max(1))
            .thread_name(|i| format!("carve-{i}"))
            .build()
            .context("failed to build carve thread pool")?;

        pool.install(|| {
            jobs.into_par_iter()
                .map_init(
                    || (Reader::open(source.path), vec![0u8; EXTRACTION_BUFFER_SIZE]),
                    |(reader, buffer), (task, path)| {
                        let mut file = CarvedFile {
                            length: 0,
                            outcome: CarveOutcome::Skipped,
                            task,
                            path,
                        };
                        if ctx.interrupt.raised_since(baseline) {
                            return file;
                        }
                        let result = match reader {
                            Ok(reader) => write_carve(reader, &file.task, &file.path, source.len, buffer),
                            Err(e) => Err(anyhow::anyhow!("cannot open image: {e}")),
                        };
                        match result {
                            Ok(written) => {
                                file.length = written;
                                file.outcome = CarveOutcome::Done;
                            }
                            Err(e) => {
                                warn!(
                                    path = %file.path.display(),
                                    offset = file.task.start,
                                    error = %e,
                                    "failed to carve file"
                                );
                                file.outcome = CarveOutcome::Failed(format!("{e:#}"));
                            }
                        }
                        progress.inc(1);
                        file
                    },
                )
                .collect()
        })
    };

    let mut summary = CarveSummary::default();
    let image_name = source.path.display().to_string();
    for file in &files {
        match &file.outcome {
            CarveOutcome::Done => {
                summary.completed += 1;
                if let Some(audit) = audit {
                    audit.record(&audit_entry(file, layout.root(), &image_name))?;
                }
            }
            CarveOutcome::Failed(_) => summary.failed += 1,
            CarveOutcome::Skipped => summary.interrupted = true,
        }
    }
    summary.files = files;

    if summary.interrupted {
        info!(
            completed = summary.completed,
            skipped = summary.files.len() - summary.completed - summary.failed,
            "carving interrupted"
        );
    } else {
        debug!(completed = summary.completed, failed = summary.failed, preview, "carving finished");
    }
    Ok(summary)
}

fn audit_entry(file: &CarvedFile, root: &Path, image: &str) -> AuditEntry {
    let relative = file.path.strip_prefix(root).unwrap_or(&file.path);
    AuditEntry {
        file: relative.display().to_string(),
        suffix: file.task.suffix.clone(),
        start: file.task.start,
        chopped: file.task.chopped,
        length: file.length,
        image: image.to_string(),
    }
}

/// Copies the task's byte range into `path`. Stops early at end of image.
fn write_carve<S: BlockSource>(
    reader: &mut S,
    task: &CarveTask,
    path: &Path,
    image_len: Option<u64>,
    buffer: &mut [u8],
) -> anyhow::Result<u64> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut out = BufWriter::new(file);

    let total = task.length(image_len);
    let mut written = 0u64;
    while written < total {
        let want = (total - written).min(buffer.len() as u64) as usize;
        let n = reader.read_chunk(task.start + written, &mut buffer[..want])?;
        if n == 0 {
            break;
        }
        out.write_all(&buffer[..n])?;
        written += n as u64;
    }
    out.flush()?;
    Ok(written)
}
