//! One run over a batch of images: configuration, output directory and
//! audit log are set up once, then each image is dug and carved in turn.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};
use kopis_core::gpu::PatternTable;
use kopis_core::{
    plan_carves, BackendKind, BlockSource, CoreError, OutputLayout, RunContext, SpecCompiler,
    SpecSet,
};
use kopis_io::Reader;
use tracing::{error, info, warn};

use crate::audit::{prepare_output_dir, write_database_dump, AuditError, AuditLog, ImageSummary};
use crate::engine::{dig_image, DigReport};
use crate::recovery::{carve_image, CarveSource, CarveSummary};

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub config_path: PathBuf,
    pub output_dir: PathBuf,
    pub command_line: String,
    pub show_progress: bool,
}

#[derive(Debug)]
pub struct ImageOutcome {
    pub image: PathBuf,
    pub dig: Option<DigReport>,
    pub carve: Option<CarveSummary>,
    /// Set when the image was skipped after an I/O error.
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub images: Vec<ImageOutcome>,
    pub interrupted: bool,
}

impl RunSummary {
    pub fn files_carved(&self) -> usize {
        self.images
            .iter()
            .filter_map(|i| i.carve.as_ref())
            .map(|c| c.completed)
            .sum()
    }

    pub fn images_done(&self) -> usize {
        self.images.iter().filter(|i| i.error.is_none()).count()
    }
}

pub struct Session {
    ctx: RunContext,
    specs: Arc<SpecSet>,
    layout: OutputLayout,
    audit: AuditLog,
    settings: SessionSettings,
}

impl Session {
    /// Compiles the configuration and prepares the output directory.
    /// Configuration problems surface here, before any image is touched.
    pub fn open(ctx: RunContext, settings: SessionSettings) -> anyhow::Result<Self> {
        let config_text = fs::read_to_string(&settings.config_path).with_context(|| {
            format!("failed to read configuration {}", settings.config_path.display())
        })?;
        let specs = SpecCompiler::new()
            .compile_str(&config_text)
            .with_context(|| format!("invalid configuration {}", settings.config_path.display()))?;
        if ctx.options.backend == BackendKind::Gpu {
            PatternTable::build(&specs)?;
        }
        info!(types = specs.len(), overlap = specs.overlap(), "configuration loaded");

        prepare_output_dir(&settings.output_dir)?;
        let audit = AuditLog::create(
            &settings.output_dir,
            &settings.command_line,
            &settings.config_path,
            &config_text,
        )?;
        let layout = OutputLayout::new(
            &settings.output_dir,
            specs.len(),
            ctx.options.organize_subdirs,
            ctx.options.max_files_per_subdir,
            ctx.options.no_suffix,
        );

        Ok(Self {
            ctx,
            specs: Arc::new(specs),
            layout,
            audit,
            settings,
        })
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn audit_path(&self) -> &Path {
        self.audit.path()
    }

    /// Processes `images` in order. In batch mode an image that cannot be
    /// read is skipped; otherwise the error ends the run. Audit log failures
    /// always end the run.
    pub fn run(&mut self, images: &[PathBuf], batch: bool) -> anyhow::Result<RunSummary> {
        let mut summary = RunSummary::default();

        for (ordinal, image) in images.iter().enumerate() {
            if self.ctx.interrupt.is_raised() {
                summary.interrupted = true;
                self.audit.note(&format!(
                    "Interrupted, skipping \"{}\"",
                    image.display()
                ))?;
                continue;
            }

            match self.process_image(ordinal, image) {
                Ok(outcome) => summary.images.push(outcome),
                Err(e) if batch && is_skippable(&e) => {
                    warn!(image = %image.display(), error = %format!("{e:#}"), "skipping image");
                    self.audit
                        .note(&format!("Skipping \"{}\": {e:#}", image.display()))?;
                    summary.images.push(ImageOutcome {
                        image: image.clone(),
                        dig: None,
                        carve: None,
                        error: Some(format!("{e:#}")),
                    });
                }
                Err(e) => {
                    error!(image = %image.display(), error = %format!("{e:#}"), "fatal error");
                    let _ = self.audit.note(&format!("Fatal error: {e:#}"));
                    let _ = self.audit.finish(summary.images_done(), true);
                    return Err(e);
                }
            }
        }

        summary.interrupted |= self.ctx.interrupt.is_raised();
        self.audit.finish(summary.images_done(), summary.interrupted)?;
        info!(
            images = summary.images_done(),
            files = summary.files_carved(),
            interrupted = summary.interrupted,
            "run finished"
        );
        Ok(summary)
    }

    fn process_image(&mut self, ordinal: usize, image: &Path) -> anyhow::Result<ImageOutcome> {
        let source = Reader::sequential(image)
            .with_context(|| format!("failed to open image {}", image.display()))?;
        let image_len = source.size();
        match image_len {
            Some(len) => info!(image = %image.display(), size = %format_size(len, BINARY), "opening image"),
            None => info!(image = %image.display(), "opening image of unknown size"),
        }

        let preview = self.ctx.options.preview;
        self.audit.begin_image(image, preview)?;

        let progress = self.progress_bar("[dig]   {bar:40.cyan/blue} {bytes}/{total_bytes} ({eta})");
        let (db, report) = dig_image(&self.ctx, &self.specs, source, &progress)
            .with_context(|| format!("failed to scan {}", image.display()))?;
        progress.finish_and_clear();
        if report.aborted() {
            warn!(
                image = %image.display(),
                scanned = %format_size(report.bytes_scanned, BINARY),
                "scan interrupted, carving what was found"
            );
        }

        if self.ctx.options.full_database {
            let path = write_database_dump(
                &self.settings.output_dir,
                ordinal,
                image,
                &db.dump(&self.specs),
            )?;
            info!(path = %path.display(), "header/footer database written");
        }

        let tasks = plan_carves(&db, &self.specs, self.ctx.options.carve_policy());
        drop(db);
        info!(files = tasks.len(), "carve plan ready");

        let progress = self.progress_bar("[carve] {bar:40.green/black} {pos}/{len} files");
        let carve = carve_image(
            &self.ctx,
            &self.specs,
            CarveSource {
                path: image,
                len: image_len,
            },
            tasks,
            &mut self.layout,
            Some(&self.audit),
            &progress,
        )?;
        progress.finish_and_clear();

        self.audit.end_image(
            image,
            &ImageSummary {
                files: carve.completed,
                failed: carve.failed,
                preview,
                interrupted: report.aborted() || carve.interrupted,
            },
        )?;

        Ok(ImageOutcome {
            image: image.to_path_buf(),
            dig: Some(report),
            carve: Some(carve),
            error: None,
        })
    }

    fn progress_bar(&self, template: &str) -> ProgressBar {
        if !self.settings.show_progress {
            return ProgressBar::hidden();
        }
        let style = ProgressStyle::default_bar()
            .template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
        let pb = ProgressBar::new(0);
        pb.set_style(style);
        pb
    }
}

/// Reads a batch list: one image path per line, blank lines and `#`
/// comments ignored.
pub fn read_image_list(path: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read image list {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(PathBuf::from)
        .collect())
}

/// Whether a batch run may skip the image that failed with `err`: reading
/// the image failed and the audit log is still intact.
fn is_skippable(err: &anyhow::Error) -> bool {
    if err.chain().any(|cause| cause.is::<AuditError>()) {
        return false;
    }
    err.chain().any(|cause| {
        cause.downcast_ref::<io::Error>().is_some()
            || matches!(cause.downcast_ref::<CoreError>(), Some(CoreError::Io(_)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn image_list_skips_comments() {
        let tmp = TempDir::new().unwrap();
        let list = tmp.path().join("list.txt");
        fs::write(&list, "# evidence\n/img/a.dd\n\n  /img/b.dd  \r\n").unwrap();
        let images = read_image_list(&list).unwrap();
        assert_eq!(images, vec![PathBuf::from("/img/a.dd"), PathBuf::from("/img/b.dd")]);
    }

    #[test]
    fn io_errors_are_recognised_through_context() {
        let err = anyhow::Error::new(io::Error::from(io::ErrorKind::NotFound)).context("opening");
        assert!(is_skippable(&err));
        let err = anyhow::Error::new(CoreError::Io(io::Error::from(io::ErrorKind::Other)));
        assert!(is_skippable(&err));
        let err = anyhow::Error::new(CoreError::TooManyFileTypes { max: 100 });
        assert!(!is_skippable(&err));
    }

    #[test]
    fn audit_write_failures_are_never_skipped() {
        let source = io::Error::from(io::ErrorKind::StorageFull);
        let err = anyhow::Error::new(AuditError::new(PathBuf::from("out/audit.txt"), source))
            .context("failed to write audit log");
        assert!(err.chain().any(|c| c.is::<io::Error>()));
        assert!(!is_skippable(&err));
    }
}
