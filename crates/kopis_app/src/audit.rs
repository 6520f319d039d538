//! Output directory bootstrap and the append-only audit log.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::Local;
use kopis_core::database::DatabaseDump;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

pub const AUDIT_FILE_NAME: &str = "audit.txt";

/// A write to the audit log failed. Unlike an unreadable image this always
/// ends the run, since the chain of custody would be incomplete.
#[derive(Debug, thiserror::Error)]
#[error("failed to write audit log {}", path.display())]
pub struct AuditError {
    path: PathBuf,
    #[source]
    source: io::Error,
}

impl AuditError {
    pub(crate) fn new(path: PathBuf, source: io::Error) -> Self {
        Self { path, source }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// One carved or previewed file as recorded in the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEntry {
    /// Path relative to the output directory.
    pub file: String,
    pub suffix: String,
    pub start: u64,
    pub chopped: bool,
    pub length: u64,
    pub image: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImageSummary {
    pub files: usize,
    pub failed: usize,
    pub preview: bool,
    pub interrupted: bool,
}

/// Creates `path` or accepts it when it is an existing empty directory.
pub fn prepare_output_dir(path: &Path) -> anyhow::Result<()> {
    match fs::read_dir(path) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                bail!(
                    "output directory {} is not empty; choose a new or empty directory",
                    path.display()
                );
            }
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir_all(path)
            .with_context(|| format!("failed to create output directory {}", path.display())),
        Err(e) => Err(e)
            .with_context(|| format!("output directory {} is not usable", path.display())),
    }
}

pub struct AuditLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl AuditLog {
    /// Opens `<out_dir>/audit.txt` and writes the run banner followed by a
    /// verbatim copy of the configuration file.
    pub fn create(
        out_dir: &Path,
        command_line: &str,
        config_path: &Path,
        config_text: &str,
    ) -> anyhow::Result<Self> {
        let path = out_dir.join(AUDIT_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open audit log {}", path.display()))?;
        let log = Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        };

        {
            let mut w = log.writer.lock();
            writeln!(
                w,
                "{} version {} audit file",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            )?;
            writeln!(w, "Started at {}", Local::now().format("%a %b %e %T %Y"))?;
            writeln!(w, "Command line:\n{command_line}\n")?;
            writeln!(w, "Output directory: {}", out_dir.display())?;
            writeln!(w, "Configuration file: {}\n", config_path.display())?;
            writeln!(w, "------ BEGIN COPY OF CONFIG FILE USED ------")?;
            w.write_all(config_text.as_bytes())?;
            if !config_text.ends_with('\n') {
                writeln!(w)?;
            }
            writeln!(w, "------ END COPY OF CONFIG FILE USED ------\n")?;
            w.flush()?;
        }
        debug!(path = %log.path.display(), "audit log opened");
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_with<F>(&self, f: F) -> Result<(), AuditError>
    where
        F: FnOnce(&mut BufWriter<File>) -> io::Result<()>,
    {
        let mut w = self.writer.lock();
        f(&mut *w).map_err(|source| AuditError::new(self.path.clone(), source))
    }

    pub fn begin_image(&self, image: &Path, preview: bool) -> Result<(), AuditError> {
        let verb = if preview { "previewed" } else { "carved" };
        self.write_with(|w| {
            writeln!(w, "\nOpening target \"{}\"\n", image.display())?;
            writeln!(w, "The following files were {verb}:")?;
            writeln!(
                w,
                "{:<30} {:<8} {:>14} {:<6} {:>14}  {}",
                "File", "Type", "Start", "Chop", "Length", "Extracted From"
            )
        })
    }

    pub fn record(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        self.write_with(|w| {
            writeln!(
                w,
                "{:<30} {:<8} {:>14} {:<6} {:>14}  {}",
                entry.file,
                entry.suffix,
                entry.start,
                if entry.chopped { "YES" } else { "NO" },
                entry.length,
                entry.image
            )
        })
    }

    pub fn end_image(&self, image: &Path, summary: &ImageSummary) -> Result<(), AuditError> {
        let verb = if summary.preview { "previewed" } else { "carved" };
        self.write_with(|w| {
            writeln!(w, "\n{} files {verb} from \"{}\"", summary.files, image.display())?;
            if summary.failed > 0 {
                writeln!(w, "{} files could not be written", summary.failed)?;
            }
            if summary.interrupted {
                writeln!(w, "Processing of this image was interrupted")?;
            }
            w.flush()
        })
    }

    pub fn note(&self, message: &str) -> Result<(), AuditError> {
        self.write_with(|w| {
            writeln!(w, "{message}")?;
            w.flush()
        })
    }

    /// Writes the completion stamp and flushes.
    pub fn finish(&self, images_done: usize, interrupted: bool) -> Result<(), AuditError> {
        self.write_with(|w| {
            if interrupted {
                writeln!(w, "\nRun interrupted after {images_done} image(s)")?;
            }
            writeln!(w, "\nCompleted at {}", Local::now().format("%a %b %e %T %Y"))?;
            w.flush()
        })
    }
}

impl Drop for AuditLog {
    fn drop(&mut self) {
        let _ = self.writer.get_mut().flush();
    }
}

/// Writes `<out_dir>/<ordinal>-<image file name>.hdrdb.json` and returns
/// its path. `ordinal` is the image's position in the run, so images that
/// share a file name get separate dumps.
pub fn write_database_dump(
    out_dir: &Path,
    ordinal: usize,
    image: &Path,
    dump: &DatabaseDump,
) -> anyhow::Result<PathBuf> {
    let name = image
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let path = out_dir.join(format!("{ordinal:04}-{name}.hdrdb.json"));

    #[derive(Serialize)]
    struct DumpFile<'a> {
        ordinal: usize,
        image: String,
        #[serde(flatten)]
        database: &'a DatabaseDump,
    }

    let file = File::create(&path)
        .with_context(|| format!("failed to create database dump {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(
        &mut writer,
        &DumpFile {
            ordinal,
            image: image.display().to_string(),
            database: dump,
        },
    )?;
    writer.flush()?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn prepare_creates_missing_directory() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("a/b");
        prepare_output_dir(&out).unwrap();
        assert!(out.is_dir());
        // Empty directories are accepted as well.
        prepare_output_dir(&out).unwrap();
    }

    #[test]
    fn prepare_rejects_non_empty_directory() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("leftover"), b"x").unwrap();
        assert!(prepare_output_dir(tmp.path()).is_err());
    }

    #[test]
    fn audit_contains_banner_config_and_entries() {
        let tmp = TempDir::new().unwrap();
        let log = AuditLog::create(
            tmp.path(),
            "kopis -c kopis.conf image.dd",
            Path::new("kopis.conf"),
            "jpg y 1000 \\xff\\xd8 \\xff\\xd9",
        )
        .unwrap();
        log.begin_image(Path::new("image.dd"), false).unwrap();
        log.record(&AuditEntry {
            file: "jpg-0-0/00000000.jpg".into(),
            suffix: "jpg".into(),
            start: 4096,
            chopped: false,
            length: 812,
            image: "image.dd".into(),
        })
        .unwrap();
        log.end_image(
            Path::new("image.dd"),
            &ImageSummary {
                files: 1,
                ..ImageSummary::default()
            },
        )
        .unwrap();
        log.finish(1, false).unwrap();

        let text = fs::read_to_string(log.path()).unwrap();
        assert!(text.contains("kopis -c kopis.conf image.dd"));
        assert!(text.contains("jpg y 1000 \\xff\\xd8 \\xff\\xd9\n------ END COPY"));
        let line = text
            .lines()
            .find(|l| l.starts_with("jpg-0-0/00000000.jpg"))
            .unwrap();
        let fields: Vec<&str> = line.split_whitespace().collect();
        assert_eq!(fields, vec!["jpg-0-0/00000000.jpg", "jpg", "4096", "NO", "812", "image.dd"]);
        assert!(text.contains("1 files carved from \"image.dd\""));
        assert!(text.contains("Completed at"));
    }

    #[test]
    fn database_dump_is_json() {
        let tmp = TempDir::new().unwrap();
        let dump = DatabaseDump {
            types: vec![kopis_core::database::TypeDump {
                type_index: 0,
                suffix: "gif".into(),
                headers: vec![10, 20],
                footers: vec![30],
            }],
        };
        let path =
            write_database_dump(tmp.path(), 3, Path::new("/evidence/disk.img"), &dump).unwrap();
        assert_eq!(path.file_name().unwrap(), "0003-disk.img.hdrdb.json");
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(value["types"][0]["suffix"], "gif");
        assert_eq!(value["types"][0]["headers"][1], 20);
        assert_eq!(value["image"], "/evidence/disk.img");
        assert_eq!(value["ordinal"], 3);
    }

    #[test]
    fn failed_writes_surface_as_audit_errors() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(AUDIT_FILE_NAME);
        fs::write(&path, b"").unwrap();
        // A read-only handle makes every flush fail.
        let log = AuditLog {
            path: path.clone(),
            writer: Mutex::new(BufWriter::new(File::open(&path).unwrap())),
        };

        let err = log.note("Skipping \"disk.img\"").unwrap_err();
        assert!(err.to_string().contains(AUDIT_FILE_NAME));
        let err = anyhow::Error::new(err).context("processing image");
        assert!(err.chain().any(|c| c.is::<AuditError>()));
        assert!(err.chain().any(|c| c.is::<io::Error>()));
    }
}
