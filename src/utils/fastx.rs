use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use lazy_static::lazy_static;
use log::warn;
use regex::Regex;
use crate::config::defs::{PipelineError, Sample, SequencingType};
use crate::utils::file::locator_file_name;

lazy_static! {
    static ref R1_TAG: Regex = Regex::new(r"(_R1|_1)\.f(ast)?q(\.gz)?$").unwrap();
    static ref R2_TAG: Regex = Regex::new(r"(_R2|_2)\.f(ast)?q(\.gz)?$").unwrap();
    static ref FASTQ_EXT: Regex = Regex::new(r"\.f(ast)?q(\.gz)?$").unwrap();
}

/// Reads a locator list: one URL or path per line, blank lines and `#` comments ignored.
pub fn read_locators(path: &Path) -> Result<Vec<String>, PipelineError> {
    let text = fs::read_to_string(path)
        .map_err(|e| PipelineError::InvalidConfig(format!("Cannot read FASTQ list {}: {}", path.display(), e)))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Identity shared by both mates: the file name with its mate tag and extension removed.
fn mate_identity(name: &str, tag: &Regex) -> Option<String> {
    tag.find(name).map(|m| name[..m.start()].to_string())
}

/// Groups raw locators into samples, sorted by id.
///
/// # Arguments
///
/// * `locators` - URLs or paths, in any order.
/// * `sequencing` - Paired-end pairs `_R1`/`_1` with `_R2`/`_2`; single-end makes one sample per file.
///
/// # Returns
/// Samples; unmatched mates are dropped with a warning.
pub fn group_into_samples(locators: &[String], sequencing: SequencingType) -> Vec<Sample> {
    let mut samples: BTreeMap<String, Sample> = BTreeMap::new();

    match sequencing {
        SequencingType::SingleEnd => {
            for locator in locators {
                let Some(name) = locator_file_name(locator) else {
                    warn!("Ignoring locator without a file name: {}", locator);
                    continue;
                };
                let id = FASTQ_EXT.replace(name, "").into_owned();
                if samples.contains_key(&id) {
                    warn!("Duplicate sample id {} from {}; keeping the first", id, locator);
                    continue;
                }
                samples.insert(id.clone(), Sample::single(id, locator.clone()));
            }
        }
        SequencingType::PairedEnd => {
            let mut firsts: BTreeMap<String, &String> = BTreeMap::new();
            let mut seconds: BTreeMap<String, &String> = BTreeMap::new();
            for locator in locators {
                let name = locator_file_name(locator).unwrap_or(locator.as_str());
                if let Some(id) = mate_identity(name, &R1_TAG) {
                    firsts.entry(id).or_insert(locator);
                } else if let Some(id) = mate_identity(name, &R2_TAG) {
                    seconds.entry(id).or_insert(locator);
                } else {
                    warn!("No mate tag in {}; skipping", locator);
                }
            }
            for (id, first) in firsts {
                match seconds.remove(&id) {
                    Some(second) => {
                        samples.insert(id.clone(), Sample::paired(id, first.clone(), second.clone()));
                    }
                    None => warn!("No mate 2 for {}; dropping sample {}", first, id),
                }
            }
            for (id, second) in seconds {
                warn!("No mate 1 for {}; dropping sample {}", second, id);
            }
        }
    }

    samples.into_values().collect()
}

/// Builds the sample registry from a locator list file.
///
/// # Returns
/// Samples sorted by id, or InvalidConfig when the list yields none.
pub fn load_samples(list: &Path, sequencing: SequencingType) -> Result<Vec<Sample>, PipelineError> {
    let locators = read_locators(list)?;
    let samples = group_into_samples(&locators, sequencing);
    if samples.is_empty() {
        return Err(PipelineError::InvalidConfig(format!(
            "No samples could be built from the {} locators in {}",
            locators.len(),
            list.display()
        )));
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_paired_grouping_sorted_and_orphans_dropped() {
        let locators = urls(&[
            "ftp://ena/SRR2_2.fastq.gz",
            "ftp://ena/SRR1_R1.fq.gz",
            "ftp://ena/SRR2_1.fastq.gz",
            "ftp://ena/SRR1_R2.fq.gz",
            "ftp://ena/SRR3_1.fastq.gz",
            "ftp://ena/notes.txt",
        ]);
        let samples = group_into_samples(&locators, SequencingType::PairedEnd);
        let ids: Vec<&str> = samples.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["SRR1", "SRR2"]);
        assert_eq!(samples[1].primary_source, "ftp://ena/SRR2_1.fastq.gz");
        assert_eq!(samples[1].secondary_source.as_deref(), Some("ftp://ena/SRR2_2.fastq.gz"));
    }

    #[test]
    fn test_single_end_ids() {
        let locators = urls(&["/data/B.fastq.gz", "/data/A_1.fq"]);
        let samples = group_into_samples(&locators, SequencingType::SingleEnd);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].id, "A_1");
        assert!(!samples[0].is_paired());
        assert_eq!(samples[1].id, "B");
    }

    #[test]
    fn test_read_locators_skips_blanks() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let list = dir.path().join("fastq.txt");
        fs::write(&list, "ftp://a/S_1.fastq.gz\n\n  # comment\nftp://a/S_2.fastq.gz  \n")?;
        assert_eq!(read_locators(&list)?, urls(&["ftp://a/S_1.fastq.gz", "ftp://a/S_2.fastq.gz"]));
        assert!(read_locators(&dir.path().join("missing.txt")).is_err());
        Ok(())
    }

    #[test]
    fn test_empty_registry_is_a_config_error() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let list = dir.path().join("fastq.txt");
        fs::write(&list, "# nothing yet\n\n")?;
        assert!(matches!(load_samples(&list, SequencingType::PairedEnd), Err(PipelineError::InvalidConfig(_))));

        fs::write(&list, "ftp://a/S_1.fastq.gz\n")?;
        assert!(matches!(load_samples(&list, SequencingType::PairedEnd), Err(PipelineError::InvalidConfig(_))));
        assert_eq!(load_samples(&list, SequencingType::SingleEnd)?.len(), 1);
        Ok(())
    }
}
