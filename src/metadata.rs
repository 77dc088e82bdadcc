// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::client::PeerId;
use std::{io::Write, path::Path};

/// Persistent Raft vote state, `(currentTerm, votedFor)`
///
/// Stored as a two-line text file and replaced atomically on update so
/// a crash can never leave a torn vote on disk.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Metadata {
    /// Current election term
    pub term: u64,

    /// Peer voted for in the current term, if any
    pub voted_for: Option<PeerId>,
}

/// Atomically rewrites a file
fn rewrite_atomic<P: AsRef<Path>>(path: P, content: &[u8]) -> std::io::Result<()> {
    let path = path.as_ref();
    let folder = path.parent().expect("should have a parent");

    let mut temp_file = tempfile::NamedTempFile::new_in(folder)?;
    temp_file.write_all(content)?;
    temp_file.persist(path)?;

    #[cfg(not(target_os = "windows"))]
    {
        let file = std::fs::File::open(path)?;
        file.sync_all()?;
    }

    Ok(())
}

impl Metadata {
    /// Loads the metadata file.
    ///
    /// A missing file yields the default `(0, none)` state, which is what
    /// a node that never voted looks like.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs or the file is malformed.
    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        let mut term = None;
        let mut voted_for = None;

        for line in content.lines() {
            if let Some(value) = line.strip_prefix("term=") {
                term = Some(
                    value
                        .parse::<u64>()
                        .map_err(|_| crate::Error::Corrupt("metadata term"))?,
                );
            } else if let Some(value) = line.strip_prefix("votedFor=") {
                if !value.is_empty() {
                    voted_for = Some(PeerId::from(value));
                }
            }
        }

        let Some(term) = term else {
            return Err(crate::Error::Corrupt("metadata missing term"));
        };

        Ok(Self { term, voted_for })
    }

    /// Persists the metadata file via write-temp-then-rename.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn store<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let voted_for = self.voted_for.as_ref().map(PeerId::as_str).unwrap_or("");
        let content = format!("term={}\nvotedFor={voted_for}\n", self.term);

        log::trace!("Writing metadata {self:?}");
        rewrite_atomic(path, content.as_bytes())?;

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn metadata_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("raft-meta");

        let meta = Metadata {
            term: 7,
            voted_for: Some(PeerId::from("s2")),
        };
        meta.store(&path)?;

        assert_eq!(meta, Metadata::load(&path)?);

        Ok(())
    }

    #[test]
    fn metadata_no_vote() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("raft-meta");

        let meta = Metadata {
            term: 3,
            voted_for: None,
        };
        meta.store(&path)?;

        let content = std::fs::read_to_string(&path)?;
        assert_eq!("term=3\nvotedFor=\n", content);

        assert_eq!(meta, Metadata::load(&path)?);

        Ok(())
    }

    #[test]
    fn metadata_missing_file_is_default() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let meta = Metadata::load(dir.path().join("raft-meta"))?;
        assert_eq!(Metadata::default(), meta);

        Ok(())
    }

    #[test]
    fn metadata_rejects_garbage() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("raft-meta");

        std::fs::write(&path, "term=abc\nvotedFor=\n")?;
        assert!(Metadata::load(&path).is_err());

        std::fs::write(&path, "votedFor=s1\n")?;
        assert!(Metadata::load(&path).is_err());

        Ok(())
    }
}
