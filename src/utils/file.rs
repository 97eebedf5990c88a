use std::ffi::OsString;
use std::fs::File;
use std::io;
use std::io::Read;
use std::path::{Path, PathBuf};
use crate::config::defs::GZIP_EXT;

pub fn is_gzipped(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 2];
    match file.read_exact(&mut buffer) {
        Ok(()) => Ok(buffer == [0x1F, 0x8B]), // Gzip magic bytes
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// `foo.fastq.gz` -> `foo.fastq`. None if the path does not end in `.gz`.
pub fn strip_gz(path: &Path) -> Option<PathBuf> {
    match path.extension() {
        Some(ext) if ext == GZIP_EXT => Some(path.with_extension("")),
        _ => None,
    }
}

/// In-flight name for a download into `dest`.
pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(OsString::from).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// Last path segment of a locator (URL or path), query string removed.
pub fn locator_file_name(locator: &str) -> Option<&str> {
    let trimmed = locator.split(['?', '#']).next().unwrap_or(locator).trim_end_matches('/');
    trimmed.rsplit('/').next().filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_helpers() {
        assert_eq!(strip_gz(Path::new("/r/genome.fa.gz")), Some(PathBuf::from("/r/genome.fa")));
        assert_eq!(strip_gz(Path::new("/r/genome.fa")), None);
        assert_eq!(part_path(Path::new("/r/S1_1.fastq.gz")), PathBuf::from("/r/S1_1.fastq.gz.part"));
        assert_eq!(locator_file_name("ftp://host/vol1/SRR1_1.fastq.gz?x=1"), Some("SRR1_1.fastq.gz"));
        assert_eq!(locator_file_name("local/S2.fq"), Some("S2.fq"));
    }
}
