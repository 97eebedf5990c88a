// src/utils/retention.rs: Post-completion artifact purge
use std::io;
use std::path::PathBuf;
use log::{debug, info, warn};
use crate::config::defs::{AlignerKind, RetentionMode, Sample};
use crate::utils::layout::ArtifactLayout;

/// Why a purge is running. Only used for logging: the deletion set never depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupTrigger {
    /// Final artifacts found from an earlier run that may have stopped before cleaning up.
    Retroactive,
    /// Sample just reached Completed in this run.
    Prospective,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PurgeSummary {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

pub struct RetentionPolicy<'a> {
    mode: RetentionMode,
    layout: &'a ArtifactLayout,
    aligners: &'a [AlignerKind],
}

impl<'a> RetentionPolicy<'a> {
    pub fn new(mode: RetentionMode, layout: &'a ArtifactLayout, aligners: &'a [AlignerKind]) -> Self {
        Self { mode, layout, aligners }
    }

    /// Artifacts that must not survive a completed sample under this mode.
    ///
    /// # Arguments
    ///
    /// * `sample` - Completed sample.
    ///
    /// # Returns
    /// Paths to delete; files and directories mixed, existence not checked.
    pub fn doomed_artifacts(&self, sample: &Sample) -> Vec<PathBuf> {
        let layout = self.layout;
        let raw_inputs = || {
            sample
                .mates()
                .into_iter()
                .flat_map(|(mate, _)| [layout.raw(sample, mate), layout.raw_compressed(sample, mate)])
                .collect::<Vec<_>>()
        };

        match self.mode {
            RetentionMode::Debug => Vec::new(),
            RetentionMode::Intermediate => raw_inputs(),
            RetentionMode::Maximal => {
                let mut doomed = raw_inputs();
                doomed.extend(layout.trimmed_reads(sample));
                doomed.extend(layout.unpaired_reads(sample));
                for aligner in self.aligners {
                    match aligner {
                        AlignerKind::Hisat2 => doomed.push(layout.intermediate_alignment(sample)),
                        AlignerKind::Star => doomed.extend(layout.scratch_dirs(sample, *aligner)),
                    }
                }
                doomed
            }
        }
    }

    /// Deletes the doomed artifacts of a sample. Missing paths are ignored;
    /// other errors are logged and reported, never raised.
    pub async fn purge(&self, sample: &Sample, trigger: CleanupTrigger) -> PurgeSummary {
        let mut summary = PurgeSummary::default();
        if self.mode == RetentionMode::Debug {
            debug!("[{}] Debug retention: keeping all intermediate files", sample.id);
            return summary;
        }

        info!("[{}] {:?} cleanup ({:?} retention)", sample.id, trigger, self.mode);
        for path in self.doomed_artifacts(sample) {
            match remove_path(&path).await {
                Ok(true) => {
                    debug!("[{}] Removed {}", sample.id, path.display());
                    summary.removed.push(path);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("[{}] Could not remove {}: {}", sample.id, path.display(), e);
                    summary.failed.push(path);
                }
            }
        }
        summary
    }
}

/// Removes a file or directory tree. Ok(false) when nothing was there.
async fn remove_path(path: &PathBuf) -> io::Result<bool> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    let result = if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
