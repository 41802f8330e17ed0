// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Name of the reserved file under the corpus directory handed to the target
/// as its input argument. Overwritten every iteration in spawn mode, and
/// never loaded as a corpus entry.
pub const INPUT_FILE: &str = "tmp.bin";

/// The capability set the fuzz session needs from an input collection. The
/// session never assumes a particular backing store.
pub trait Corpus {
    /// Number of entries.
    fn count(&self) -> usize;

    /// Indexed read. Out of range is a programmer error and panics.
    fn get(&self, index: usize) -> &[u8];

    /// Length of the largest entry.
    fn max_len(&self) -> usize;

    /// Append a new entry and persist it.
    fn add(&mut self, case: &[u8]) -> Result<()>;

    /// Record a crashing input, content-addressed so identical crashes
    /// collapse to one file.
    fn write_crash(&self, case: &[u8]) -> Result<PathBuf>;

    /// Path handed to the target as its input argument.
    fn input_path(&self) -> &Path;
}

/// Corpus backed by a flat directory, with crashes written to a second one.
pub struct DirCorpus {
    entries: Vec<Vec<u8>>,
    dir: PathBuf,
    crash_dir: PathBuf,
    input_path: PathBuf,
}

impl DirCorpus {
    /// Load every regular file in `dir`, in directory-enumeration order.
    /// Subdirectories and the reserved input file are ignored. The corpus
    /// directory must exist; the crash directory is created on demand.
    pub fn load(dir: impl AsRef<Path>, crash_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let crash_dir = crash_dir.as_ref().to_path_buf();

        let mut entries = Vec::new();

        let listing = fs::read_dir(&dir)
            .with_context(|| format!("reading corpus directory {}", dir.display()))?;

        for entry in listing {
            let entry = entry?;

            if !entry.file_type()?.is_file() {
                continue;
            }

            if entry.file_name() == INPUT_FILE {
                continue;
            }

            let data = fs::read(entry.path())
                .with_context(|| format!("reading corpus entry {}", entry.path().display()))?;
            entries.push(data);
        }

        fs::create_dir_all(&crash_dir)
            .with_context(|| format!("creating crash directory {}", crash_dir.display()))?;

        info!("loaded {} corpus entries from {}", entries.len(), dir.display());

        let input_path = dir.join(INPUT_FILE);

        Ok(Self {
            entries,
            dir,
            crash_dir,
            input_path,
        })
    }
}

impl Corpus for DirCorpus {
    fn count(&self) -> usize {
        self.entries.len()
    }

    fn get(&self, index: usize) -> &[u8] {
        &self.entries[index]
    }

    fn max_len(&self) -> usize {
        self.entries.iter().map(Vec::len).max().unwrap_or(0)
    }

    fn add(&mut self, case: &[u8]) -> Result<()> {
        self.entries.push(case.to_vec());

        let path = self.dir.join(format!("{}.bin", self.entries.len()));
        fs::write(&path, case)
            .with_context(|| format!("persisting corpus entry {}", path.display()))?;

        Ok(())
    }

    fn write_crash(&self, case: &[u8]) -> Result<PathBuf> {
        let digest = md5::compute(case);
        let path = self.crash_dir.join(format!("{}.bin", hex::encode(digest.0)));

        fs::write(&path, case).with_context(|| format!("persisting crash {}", path.display()))?;

        Ok(path)
    }

    fn input_path(&self) -> &Path {
        &self.input_path
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn corpus_files(dir: &Path) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().unwrap().is_file())
            .filter(|entry| entry.file_name() != INPUT_FILE)
            .count()
    }

    #[test]
    fn loads_files_and_skips_reserved() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let crashes = tempfile::tempdir()?;

        fs::write(dir.path().join("a.bin"), b"aaaa")?;
        fs::write(dir.path().join("b.bin"), b"bb")?;
        fs::write(dir.path().join(INPUT_FILE), b"scratch")?;
        fs::create_dir(dir.path().join("nested"))?;

        let corpus = DirCorpus::load(dir.path(), crashes.path())?;

        assert_eq!(corpus.count(), 2);
        assert_eq!(corpus.max_len(), 4);

        Ok(())
    }

    #[test]
    fn missing_directory_is_fatal() {
        let crashes = tempfile::tempdir().unwrap();

        assert!(DirCorpus::load("/nonexistent/corpus", crashes.path()).is_err());
    }

    #[test]
    fn add_keeps_disk_in_step() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let crashes = tempfile::tempdir()?;

        fs::write(dir.path().join("seed.bin"), b"seed")?;

        let mut corpus = DirCorpus::load(dir.path(), crashes.path())?;

        corpus.add(b"one")?;
        corpus.add(b"two")?;

        assert_eq!(corpus.count(), 3);
        assert_eq!(corpus.count(), corpus_files(dir.path()));
        assert_eq!(fs::read(dir.path().join("2.bin"))?, b"one");
        assert_eq!(fs::read(dir.path().join("3.bin"))?, b"two");
        assert_eq!(corpus.get(1), b"one");

        Ok(())
    }

    #[test]
    fn identical_crashes_collapse() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let crashes = tempfile::tempdir()?;

        fs::write(dir.path().join("seed.bin"), b"seed")?;

        let corpus = DirCorpus::load(dir.path(), crashes.path())?;

        let first = corpus.write_crash(b"boom")?;
        let second = corpus.write_crash(b"boom")?;
        let other = corpus.write_crash(b"bang")?;

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(fs::read_dir(crashes.path())?.count(), 2);

        Ok(())
    }

    #[test]
    #[should_panic]
    fn out_of_range_get_panics() {
        let dir = tempfile::tempdir().unwrap();
        let crashes = tempfile::tempdir().unwrap();

        let corpus = DirCorpus::load(dir.path(), crashes.path()).unwrap();
        let _ = corpus.get(0);
    }
}
