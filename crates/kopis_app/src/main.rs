//! kopis: carves files out of raw disk and memory images by header and
//! footer patterns.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use kopis_core::config::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FILES_PER_SUBDIR};
use kopis_core::{BackendKind, CarveOptions, RunContext};
use tracing::{error, info, warn};

use kopis_app::logging::init_logging;
use kopis_app::session::{read_image_list, Session, SessionSettings};

#[derive(Parser, Debug)]
#[command(name = "kopis")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Carve headers whose footer is missing, up to the maximum length
    #[arg(short = 'b')]
    carve_missing_footers: bool,

    /// Pattern configuration file
    #[arg(short = 'c', default_value = "kopis.conf")]
    config: PathBuf,

    /// Keep every footer and write the header/footer database
    #[arg(short = 'd')]
    full_database: bool,

    /// Pair nested headers and footers (FORWARD and NEXT rules)
    #[arg(short = 'e')]
    handle_embedded: bool,

    /// File listing one image per line
    #[arg(short = 'i')]
    image_list: Option<PathBuf>,

    /// Do not append extensions to carved files
    #[arg(short = 'n')]
    no_suffix: bool,

    /// Output directory, must be empty or absent
    #[arg(short = 'o', default_value = "kopis-output")]
    output: PathBuf,

    /// Write all carved files directly into the output directory
    #[arg(short = 'O')]
    flat_output: bool,

    /// Preview only: audit what would be carved without writing files
    #[arg(short = 'p')]
    preview: bool,

    /// Only accept headers on this cluster boundary
    #[arg(short = 'q', value_name = "BLOCKSIZE")]
    block_aligned: Option<u64>,

    /// Do not report matches that overlap an earlier match of the same kind
    #[arg(short = 'r')]
    no_search_overlap: bool,

    /// Bytes to skip at the start of each image
    #[arg(short = 's', default_value_t = 0)]
    skip: u64,

    #[arg(short = 'v')]
    verbose: bool,

    /// Use the batched block-matching backend
    #[arg(long)]
    gpu: bool,

    /// Scan and carve worker threads (defaults to the number of CPUs)
    #[arg(long)]
    workers: Option<usize>,

    /// Bytes read per chunk, a multiple of 512
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    #[arg(long = "max-files-per-dir", default_value_t = DEFAULT_MAX_FILES_PER_SUBDIR)]
    max_files_per_subdir: usize,

    images: Vec<PathBuf>,
}

impl Args {
    fn options(&self) -> CarveOptions {
        let defaults = CarveOptions::default();
        let workers = self.workers.unwrap_or(defaults.workers);
        CarveOptions {
            preview: self.preview,
            no_suffix: self.no_suffix,
            organize_subdirs: !self.flat_output,
            max_files_per_subdir: self.max_files_per_subdir,
            carve_missing_footers: self.carve_missing_footers,
            handle_embedded: self.handle_embedded,
            block_aligned: self.block_aligned,
            no_search_overlap: self.no_search_overlap,
            full_database: self.full_database,
            skip: self.skip,
            chunk_size: self.chunk_size,
            queue_capacity: workers.saturating_mul(4).max(1),
            workers,
            backend: if self.gpu {
                BackendKind::Gpu
            } else {
                BackendKind::Cpu
            },
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let ctx = RunContext::new(args.options())?;

    let interrupt = ctx.interrupt.clone();
    ctrlc::set_handler(move || {
        if interrupt.raise() == 1 {
            warn!("interrupt received, finishing with what has been found");
        }
    })
    .context("Failed to set Ctrl+C handler")?;

    let mut images = args.images.clone();
    let batch = match &args.image_list {
        Some(list) => {
            images.extend(read_image_list(list)?);
            true
        }
        None => images.len() > 1,
    };
    if images.is_empty() {
        bail!("no images given; pass image paths or -i <list>");
    }

    let command_line = std::env::args().collect::<Vec<_>>().join(" ");
    let mut session = Session::open(
        ctx,
        SessionSettings {
            config_path: args.config.clone(),
            output_dir: args.output.clone(),
            command_line,
            show_progress: !args.verbose,
        },
    )?;

    let summary = session.run(&images, batch)?;
    info!(
        audit = %session.audit_path().display(),
        images = summary.images_done(),
        files = summary.files_carved(),
        "done"
    );
    if summary.interrupted {
        warn!(
            images = summary.images_done(),
            of = images.len(),
            "run was interrupted, results are partial"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn flags_map_to_options() {
        let args = Args::parse_from([
            "kopis", "-b", "-e", "-O", "-q", "4096", "-r", "-s", "1024", "--workers", "3",
            "-o", "out", "disk.img",
        ]);
        let opts = args.options();
        assert!(opts.carve_missing_footers);
        assert!(opts.handle_embedded);
        assert!(!opts.organize_subdirs);
        assert_eq!(opts.block_aligned, Some(4096));
        assert!(opts.no_search_overlap);
        assert_eq!(opts.skip, 1024);
        assert_eq!(opts.workers, 3);
        assert_eq!(opts.queue_capacity, 12);
        assert_eq!(opts.backend, BackendKind::Cpu);
        assert_eq!(args.images, vec![PathBuf::from("disk.img")]);
        assert_eq!(args.output, PathBuf::from("out"));
    }
}
