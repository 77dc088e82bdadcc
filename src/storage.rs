// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use path_absolutize::Absolutize;
use std::path::{Path, PathBuf};

/// Folder below the storage root that holds the live state
const CURRENT_FOLDER: &str = "current";

/// Metadata file name
pub const META_FILE: &str = "raft-meta";

const OPEN_PREFIX: &str = "log_inprogress_";
const CLOSED_PREFIX: &str = "log_";

#[must_use]
fn absolute_path<P: AsRef<Path>>(path: P) -> PathBuf {
    // TODO: replace with std::path::absolute once MSRV allows
    path.as_ref()
        .absolutize()
        .expect("should be absolute path")
        .into()
}

/// Parsed name of a segment file
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SegmentFileName {
    /// Closed segment `log_<start>-<end>`, indices inclusive
    Closed {
        /// First index contained in the file
        start: u64,

        /// Last index contained in the file
        end: u64,
    },

    /// Open segment `log_inprogress_<start>`
    Open {
        /// First index contained in the file
        start: u64,
    },
}

impl SegmentFileName {
    /// First index covered by the file.
    #[must_use]
    pub fn start_index(&self) -> u64 {
        match self {
            Self::Closed { start, .. } | Self::Open { start } => *start,
        }
    }

    /// Renders the on-disk file name.
    #[must_use]
    pub fn format(&self) -> String {
        match self {
            Self::Closed { start, end } => format!("{CLOSED_PREFIX}{start}-{end}"),
            Self::Open { start } => format!("{OPEN_PREFIX}{start}"),
        }
    }

    /// Parses a segment file name, returning `None` for foreign files.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        if let Some(rest) = name.strip_prefix(OPEN_PREFIX) {
            let start = rest.parse::<u64>().ok()?;
            return Some(Self::Open { start });
        }

        let rest = name.strip_prefix(CLOSED_PREFIX)?;
        let (start, end) = rest.split_once('-')?;

        let start = start.parse::<u64>().ok()?;
        let end = end.parse::<u64>().ok()?;

        if start > end {
            return None;
        }

        Some(Self::Closed { start, end })
    }
}

/// A discovered segment file
#[derive(Debug)]
pub struct SegmentFile {
    /// Parsed name
    pub name: SegmentFileName,

    /// Absolute path
    pub path: PathBuf,

    /// File size in bytes
    pub size: u64,
}

/// Handle to the `<dir>/current/` storage folder
///
/// Owns the naming scheme; enumeration is re-done on every open, the
/// directory itself carries no other state.
#[derive(Clone, Debug)]
pub struct StorageDirectory {
    path: PathBuf,
}

impl StorageDirectory {
    /// Opens (and creates, if needed) the storage folder below `root`.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn open<P: AsRef<Path>>(root: P) -> crate::Result<Self> {
        let path = absolute_path(root).join(CURRENT_FOLDER);
        log::trace!("Opening storage directory at {}", path.display());

        std::fs::create_dir_all(&path)?;

        Ok(Self { path })
    }

    /// Returns the `current/` folder path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the metadata file path.
    #[must_use]
    pub fn meta_path(&self) -> PathBuf {
        self.path.join(META_FILE)
    }

    /// Returns the path a segment file name maps to.
    #[must_use]
    pub fn segment_path(&self, name: &SegmentFileName) -> PathBuf {
        self.path.join(name.format())
    }

    /// Lists all segment files, sorted by start index.
    ///
    /// Foreign files (metadata, snapshots, `.DS_Store`, quarantined
    /// files) are skipped.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn list_segment_files(&self) -> crate::Result<Vec<SegmentFile>> {
        let mut files = vec![];

        for dirent in std::fs::read_dir(&self.path)? {
            let dirent = dirent?;

            if !dirent.file_type()?.is_file() {
                continue;
            }

            let file_name = dirent.file_name();

            let Some(name) = file_name.to_str().and_then(SegmentFileName::parse) else {
                continue;
            };

            files.push(SegmentFile {
                name,
                path: dirent.path(),
                size: dirent.metadata()?.len(),
            });
        }

        files.sort_by_key(|file| file.name.start_index());

        Ok(files)
    }

    /// Moves a damaged or conflicting file out of the way.
    ///
    /// The file keeps its content under a `.corrupt` suffix so an
    /// operator can inspect it.
    pub fn quarantine(&self, path: &Path) -> crate::Result<()> {
        let mut target = path.as_os_str().to_owned();
        target.push(".corrupt");

        log::warn!("Quarantining {} -> {target:?}", path.display());
        std::fs::rename(path, &target)?;

        Ok(())
    }

    /// Fsyncs the storage folder so renames and deletions are durable.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn sync(&self) -> crate::Result<()> {
        #[cfg(not(target_os = "windows"))]
        {
            let folder = std::fs::File::open(&self.path)?;
            folder.sync_all()?;
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn file_name_roundtrip() {
        let closed = SegmentFileName::Closed { start: 5, end: 17 };
        assert_eq!("log_5-17", closed.format());
        assert_eq!(Some(closed), SegmentFileName::parse("log_5-17"));

        let open = SegmentFileName::Open { start: 18 };
        assert_eq!("log_inprogress_18", open.format());
        assert_eq!(Some(open), SegmentFileName::parse("log_inprogress_18"));
    }

    #[test]
    fn file_name_rejects_foreign() {
        assert_eq!(None, SegmentFileName::parse("raft-meta"));
        assert_eq!(None, SegmentFileName::parse("snapshot.1234"));
        assert_eq!(None, SegmentFileName::parse("log_5-17.corrupt"));
        assert_eq!(None, SegmentFileName::parse("log_17-5"));
        assert_eq!(None, SegmentFileName::parse("log_abc-def"));
    }

    #[test]
    fn list_is_sorted() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = StorageDirectory::open(dir.path())?;

        for name in ["log_10-19", "log_0-9", "log_inprogress_20", ".DS_Store"] {
            std::fs::write(storage.path().join(name), b"x")?;
        }

        let files = storage.list_segment_files()?;
        let starts = files
            .iter()
            .map(|file| file.name.start_index())
            .collect::<Vec<_>>();

        assert_eq!(vec![0, 10, 20], starts);

        Ok(())
    }
}
