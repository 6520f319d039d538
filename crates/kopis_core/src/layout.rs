//! Output file naming.
//!
//! Carved files are numbered by one counter shared by every type and every
//! image of a run. With subdirectories enabled each type writes into
//! `<suffix>-<type>-<n>`, and `n` moves on once a directory holds
//! `max_files_per_subdir` files.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default)]
struct SubdirState {
    index: u64,
    files: usize,
}

#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
    organize_subdirs: bool,
    max_files_per_subdir: usize,
    no_suffix: bool,
    next_file: u64,
    subdirs: Vec<SubdirState>,
}

impl OutputLayout {
    pub fn new(
        root: impl Into<PathBuf>,
        type_count: usize,
        organize_subdirs: bool,
        max_files_per_subdir: usize,
        no_suffix: bool,
    ) -> Self {
        Self {
            root: root.into(),
            organize_subdirs,
            max_files_per_subdir: max_files_per_subdir.max(1),
            no_suffix,
            next_file: 0,
            subdirs: vec![SubdirState::default(); type_count],
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Files named so far.
    pub fn files_assigned(&self) -> u64 {
        self.next_file
    }

    /// Reserves the next output path for a file of `type_index`. `extension`
    /// is `None` for rules that want no extension.
    pub fn next_path(&mut self, type_index: usize, suffix: &str, extension: Option<&str>) -> PathBuf {
        let name = match extension {
            Some(ext) if !self.no_suffix => format!("{:08}.{ext}", self.next_file),
            _ => format!("{:08}", self.next_file),
        };
        self.next_file += 1;

        if !self.organize_subdirs {
            return self.root.join(name);
        }

        let state = &mut self.subdirs[type_index];
        if state.files == self.max_files_per_subdir {
            state.index += 1;
            state.files = 0;
        }
        state.files += 1;
        self.root
            .join(format!("{suffix}-{type_index}-{}", state.index))
            .join(name)
    }
}
