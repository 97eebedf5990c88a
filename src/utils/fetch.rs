// src/utils/fetch.rs: Remote retrieval and in-place gunzip
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Duration;
use async_trait::async_trait;
use flate2::read::MultiGzDecoder;
use log::debug;
use tempfile::NamedTempFile;
use crate::config::defs::{ToolFailure, GZIP_EXT, GZIP_TAG, WGET_TAG};
use crate::utils::command::{run_tool, ToolCommand};
use crate::utils::file::{is_gzipped, part_path, strip_gz};

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Retrieves `locator` to `dest`. `dest` only appears once the transfer completed.
    async fn fetch(&self, locator: &str, dest: &Path, timeout: Duration) -> Result<PathBuf, ToolFailure>;
}

#[async_trait]
pub trait Decompressor: Send + Sync {
    /// Replaces `path` (a `.gz` file) by its decompressed sibling and returns the new path.
    async fn decompress(&self, path: &Path) -> Result<PathBuf, ToolFailure>;
}

/// wget for remote locators, plain copy for local paths.
#[derive(Debug, Default, Clone)]
pub struct WgetFetcher;

fn is_remote(locator: &str) -> bool {
    locator.contains("://")
}

#[async_trait]
impl Fetcher for WgetFetcher {
    async fn fetch(&self, locator: &str, dest: &Path, timeout: Duration) -> Result<PathBuf, ToolFailure> {
        let partial = part_path(dest);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolFailure::new(WGET_TAG, format!("Cannot create {}: {}", parent.display(), e)))?;
        }

        if is_remote(locator) {
            let cmd = ToolCommand::new(WGET_TAG, WGET_TAG)
                .arg("-q")
                .arg("-O")
                .arg(partial.to_string_lossy())
                .arg(locator);
            if let Err(failure) = run_tool(&cmd, timeout).await {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(failure);
            }
        } else {
            debug!("Copying local source {}", locator);
            tokio::fs::copy(locator, &partial)
                .await
                .map_err(|e| ToolFailure::new(WGET_TAG, format!("Cannot copy {}: {}", locator, e)))?;
        }

        tokio::fs::rename(&partial, dest)
            .await
            .map_err(|e| ToolFailure::new(WGET_TAG, format!("Cannot move {} into place: {}", partial.display(), e)))?;
        Ok(dest.to_path_buf())
    }
}

#[derive(Debug, Default, Clone)]
pub struct GzipDecompressor;

/// Streams `path` through a gzip decoder into a temporary file next to the target,
/// persisting it only once the whole stream decoded. Sources that are not gzip
/// (some archives serve plain FASTQ under a `.gz` name) are moved as-is.
fn gunzip_in_place(path: &Path) -> io::Result<PathBuf> {
    let target = strip_gz(path).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("{} has no .{} extension", path.display(), GZIP_EXT))
    })?;

    if !is_gzipped(path)? {
        std::fs::rename(path, &target)?;
        return Ok(target);
    }

    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir)?;
    {
        let mut decoder = MultiGzDecoder::new(BufReader::new(File::open(path)?));
        let mut writer = BufWriter::new(temp.as_file_mut());
        io::copy(&mut decoder, &mut writer)?;
        io::Write::flush(&mut writer)?;
    }
    temp.persist(&target).map_err(|e| e.error)?;
    std::fs::remove_file(path)?;
    Ok(target)
}

#[async_trait]
impl Decompressor for GzipDecompressor {
    async fn decompress(&self, path: &Path) -> Result<PathBuf, ToolFailure> {
        let source = path.to_path_buf();
        let result = tokio::task::spawn_blocking(move || gunzip_in_place(&source))
            .await
            .map_err(|e| ToolFailure::new(GZIP_TAG, format!("Decompression task failed: {}", e)))?;
        result.map_err(|e| ToolFailure::new(GZIP_TAG, format!("{}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_gunzip_replaces_archive() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let gz = dir.path().join("S1_1.fastq.gz");
        let mut encoder = GzEncoder::new(File::create(&gz)?, Compression::default());
        encoder.write_all(b"@r1\nACGT\n+\nIIII\n")?;
        encoder.finish()?;

        let out = GzipDecompressor.decompress(&gz).await?;
        assert_eq!(out, dir.path().join("S1_1.fastq"));
        assert_eq!(std::fs::read_to_string(&out)?, "@r1\nACGT\n+\nIIII\n");
        assert!(!gz.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_archive_keeps_source() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let gz = dir.path().join("bad.fastq.gz");
        std::fs::write(&gz, [0x1F, 0x8B, 0x08, 0x00, 0x01, 0x02])?;

        let failure = GzipDecompressor.decompress(&gz).await.unwrap_err();
        assert_eq!(failure.tool, GZIP_TAG);
        assert!(gz.exists());
        assert!(!dir.path().join("bad.fastq").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_local_fetch_lands_atomically() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let source = dir.path().join("source.fa");
        std::fs::write(&source, b">chr1\nACGT\n")?;
        let dest = dir.path().join("ref").join("genome.fa");

        let fetched = WgetFetcher.fetch(&source.to_string_lossy(), &dest, Duration::from_secs(5)).await?;
        assert_eq!(fetched, dest);
        assert!(dest.exists());
        assert!(!part_path(&dest).exists());
        Ok(())
    }
}
