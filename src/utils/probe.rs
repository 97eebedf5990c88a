// src/utils/probe.rs: Filesystem checkpoint queries
use std::fs;
use std::path::{Path, PathBuf};

/// The single source of truth for "is this stage already done".
pub trait ArtifactProbe: Send + Sync {
    /// True iff every path is present and non-empty. Directories count as present.
    fn exists(&self, paths: &[PathBuf]) -> bool;

    /// Number of entries in `dir` whose file name starts with `prefix` and ends with `suffix`.
    fn count_matching(&self, dir: &Path, prefix: &str, suffix: &str) -> usize;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FsProbe;

impl FsProbe {
    fn present(path: &Path) -> bool {
        match fs::metadata(path) {
            Ok(meta) => meta.is_dir() || meta.len() > 0,
            Err(_) => false,
        }
    }
}

impl ArtifactProbe for FsProbe {
    fn exists(&self, paths: &[PathBuf]) -> bool {
        paths.iter().all(|path| Self::present(path))
    }

    fn count_matching(&self, dir: &Path, prefix: &str, suffix: &str) -> usize {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                name.starts_with(prefix) && name.ends_with(suffix)
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_exists_requires_every_path() -> std::io::Result<()> {
        let dir = tempdir()?;
        let a = dir.path().join("a.bam");
        let b = dir.path().join("b.bam");
        fs::write(&a, b"bam")?;
        let probe = FsProbe;
        assert!(probe.exists(&[a.clone()]));
        assert!(!probe.exists(&[a.clone(), b.clone()]));
        assert!(probe.exists(&[]));
        Ok(())
    }

    #[test]
    fn test_empty_file_is_missing() -> std::io::Result<()> {
        let dir = tempdir()?;
        let empty = dir.path().join("truncated.fastq");
        fs::write(&empty, b"")?;
        assert!(!FsProbe.exists(&[empty]));
        assert!(FsProbe.exists(&[dir.path().to_path_buf()]));
        Ok(())
    }

    #[test]
    fn test_count_matching() -> std::io::Result<()> {
        let dir = tempdir()?;
        for i in 1..=8 {
            fs::write(dir.path().join(format!("genome.{}.ht2", i)), b"x")?;
        }
        fs::write(dir.path().join("genome.fa"), b">chr1")?;
        fs::write(dir.path().join("other.1.ht2"), b"x")?;
        assert_eq!(FsProbe.count_matching(dir.path(), "genome", ".ht2"), 8);
        assert_eq!(FsProbe.count_matching(&dir.path().join("absent"), "genome", ".ht2"), 0);
        Ok(())
    }
}
