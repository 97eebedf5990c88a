// src/pipelines/resources.rs: Phase 1, sample-independent resources
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use futures::future::try_join_all;
use log::{debug, info, warn};
use tokio::sync::Semaphore;
use crate::config::defs::{
    AlignerKind, PipelineError, PreparedResources, StageKind, FASTA_EXTS, GTF_EXT, HISAT2_INDEX_EXT,
    HISAT2_MIN_INDEX_FILES, STAR_SENTINEL,
};
use crate::config::settings::RunSettings;
use crate::utils::command::{StageExecutor, StageRequest};
use crate::utils::file::{locator_file_name, strip_gz};
use crate::utils::probe::ArtifactProbe;

const REFERENCE_LABEL: &str = "reference";

/// A genome URL and where it lands locally.
#[derive(Debug, Clone)]
struct ReferenceFile {
    locator: String,
    /// Download target, possibly `.gz`.
    fetched: PathBuf,
    /// Usable file once decompressed.
    materialized: PathBuf,
}

impl ReferenceFile {
    fn compressed(&self) -> bool {
        self.fetched != self.materialized
    }

    fn has_extension(&self, exts: &[&str]) -> bool {
        self.materialized
            .extension()
            .map(|ext| exts.iter().any(|e| ext.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }
}

pub struct ResourcePreparer {
    settings: Arc<RunSettings>,
    executor: Arc<dyn StageExecutor>,
    probe: Arc<dyn ArtifactProbe>,
}

impl ResourcePreparer {
    pub fn new(settings: Arc<RunSettings>, executor: Arc<dyn StageExecutor>, probe: Arc<dyn ArtifactProbe>) -> Self {
        Self { settings, executor, probe }
    }

    fn request(&self, kind: StageKind, threads: usize) -> StageRequest {
        StageRequest::new(kind, REFERENCE_LABEL, threads, self.settings.tool_timeout)
    }

    /// Runs one phase-1 stage. Every failure here is fatal for the run.
    async fn run_stage(&self, request: StageRequest, expected: &[PathBuf]) -> Result<(), PipelineError> {
        debug!("Running {} for {}", request.kind, request.label);
        let output = self.executor.execute(&request).await.map_err(|failure| {
            PipelineError::FatalSetupFailure(format!("{} failed: {}", request.kind, failure))
        })?;
        if !output.diagnostics.trim().is_empty() {
            debug!("{} diagnostics:\n{}", request.kind, output.diagnostics.trim_end());
        }
        for artifact in &output.artifacts {
            debug!("{} wrote {}", request.kind, artifact.display());
        }
        if !self.probe.exists(expected) {
            return Err(PipelineError::FatalSetupFailure(format!(
                "{} reported success but its outputs are missing",
                request.kind
            )));
        }
        Ok(())
    }

    fn reference_files(&self) -> Result<Vec<ReferenceFile>, PipelineError> {
        let reference_dir = self.settings.layout.reference_dir();
        self.settings
            .genome_urls
            .iter()
            .map(|url| {
                let name = locator_file_name(url)
                    .ok_or_else(|| PipelineError::FatalSetupFailure(format!("Genome URL without a file name: {}", url)))?;
                let fetched = reference_dir.join(name);
                let materialized = strip_gz(&fetched).unwrap_or_else(|| fetched.clone());
                Ok(ReferenceFile { locator: url.clone(), fetched, materialized })
            })
            .collect()
    }

    /// Phase 1: reference files, adapters and one index per configured aligner.
    ///
    /// # Returns
    /// Paths to everything the sample workers need, or FatalSetupFailure.
    pub async fn prepare(&self) -> Result<PreparedResources, PipelineError> {
        info!("Preparing reference resources");
        let files = self.reference_files()?;
        let fasta = files
            .iter()
            .find(|f| f.has_extension(FASTA_EXTS))
            .map(|f| f.materialized.clone())
            .ok_or_else(|| PipelineError::FatalSetupFailure("No FASTA (.fa/.fna/.fasta) among genome_urls".to_string()))?;
        let gtf = files
            .iter()
            .find(|f| f.has_extension(&[GTF_EXT]))
            .map(|f| f.materialized.clone())
            .ok_or_else(|| PipelineError::FatalSetupFailure("No GTF annotation among genome_urls".to_string()))?;

        self.download_references(&files).await?;
        self.decompress_references(&files).await?;
        let adapters = self.fetch_adapters().await?;

        let builds = self.settings.aligners.iter().map(|aligner| {
            let fasta = fasta.clone();
            let gtf = gtf.clone();
            async move {
                let index = match aligner {
                    AlignerKind::Star => self.build_star_index(&fasta, &gtf).await?,
                    AlignerKind::Hisat2 => self.build_hisat2_index(&fasta, &gtf).await?,
                };
                Ok::<_, PipelineError>((*aligner, index))
            }
        });
        let indices: BTreeMap<AlignerKind, PathBuf> = try_join_all(builds).await?.into_iter().collect();

        info!("Reference resources ready: genome {}, annotation {}", fasta.display(), gtf.display());
        Ok(PreparedResources { fasta, gtf, adapters, indices })
    }

    async fn download_references(&self, files: &[ReferenceFile]) -> Result<(), PipelineError> {
        let semaphore = Arc::new(Semaphore::new(self.settings.download_threads));
        let downloads = files
            .iter()
            .filter(|file| {
                let present = self.probe.exists(&[file.fetched.clone()]) || self.probe.exists(&[file.materialized.clone()]);
                if present {
                    debug!("Reference {} already present", file.materialized.display());
                }
                !present
            })
            .map(|file| {
                let semaphore = semaphore.clone();
                async move {
                    let _permit = semaphore
                        .acquire()
                        .await
                        .map_err(|e| PipelineError::UnexpectedException(e.to_string()))?;
                    info!("Downloading {}", file.locator);
                    let request = self
                        .request(StageKind::Download, 1)
                        .locator(&file.locator)
                        .outputs(vec![file.fetched.clone()]);
                    self.run_stage(request, std::slice::from_ref(&file.fetched)).await
                }
            });
        try_join_all(downloads).await?;
        Ok(())
    }

    async fn decompress_references(&self, files: &[ReferenceFile]) -> Result<(), PipelineError> {
        let semaphore = Arc::new(Semaphore::new(self.settings.threads));
        let mut pending = Vec::new();
        for file in files.iter().filter(|f| f.compressed()) {
            let has_archive = self.probe.exists(&[file.fetched.clone()]);
            if self.probe.exists(&[file.materialized.clone()]) {
                if has_archive {
                    debug!("Removing redundant archive {}", file.fetched.display());
                    if let Err(e) = tokio::fs::remove_file(&file.fetched).await {
                        warn!("Could not remove {}: {}", file.fetched.display(), e);
                    }
                }
                continue;
            }
            pending.push(file);
        }

        let decompressions = pending.into_iter().map(|file| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|e| PipelineError::UnexpectedException(e.to_string()))?;
                let request = self
                    .request(StageKind::Decompress, 1)
                    .inputs(vec![file.fetched.clone()])
                    .outputs(vec![file.materialized.clone()]);
                self.run_stage(request, std::slice::from_ref(&file.materialized)).await
            }
        });
        try_join_all(decompressions).await?;
        Ok(())
    }

    async fn fetch_adapters(&self) -> Result<Option<PathBuf>, PipelineError> {
        let adapters = self.settings.layout.adapters_file();
        let Some(url) = &self.settings.adapter_url else {
            if self.probe.exists(&[adapters.clone()]) {
                return Ok(Some(adapters));
            }
            warn!("No adapter_fasta_url configured; trimming without adapter clipping");
            return Ok(None);
        };
        if self.probe.exists(&[adapters.clone()]) {
            debug!("Adapters present at {}", adapters.display());
            return Ok(Some(adapters));
        }
        info!("Downloading adapters from {}", url);
        let request = self
            .request(StageKind::Download, 1)
            .locator(url)
            .outputs(vec![adapters.clone()]);
        self.run_stage(request, &[adapters.clone()]).await?;
        Ok(Some(adapters))
    }

    async fn build_star_index(&self, fasta: &Path, gtf: &Path) -> Result<PathBuf, PipelineError> {
        let index_dir = self.settings.layout.star_index_dir();
        let sentinel = index_dir.join(STAR_SENTINEL);
        if self.probe.exists(&[sentinel.clone()]) {
            info!("STAR index present at {}", index_dir.display());
            return Ok(index_dir);
        }
        info!("Building STAR index in {}", index_dir.display());
        let request = self
            .request(StageKind::BuildIndex, self.settings.threads)
            .aligner(AlignerKind::Star)
            .inputs(vec![fasta.to_path_buf(), gtf.to_path_buf()])
            .outputs(vec![index_dir.clone()]);
        self.run_stage(request, &[sentinel]).await?;
        Ok(index_dir)
    }

    async fn build_hisat2_index(&self, fasta: &Path, gtf: &Path) -> Result<PathBuf, PipelineError> {
        let reference_dir = self.settings.layout.reference_dir();
        let stem = fasta
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| PipelineError::FatalSetupFailure(format!("Cannot derive index prefix from {}", fasta.display())))?;
        let prefix = reference_dir.join(&stem);
        let index_prefix = format!("{}.", stem);
        let built = || self.probe.count_matching(&reference_dir, &index_prefix, HISAT2_INDEX_EXT) >= HISAT2_MIN_INDEX_FILES;

        if built() {
            info!("HISAT2 index present at {}", prefix.display());
            return Ok(prefix);
        }

        let splice_sites = reference_dir.join(format!("{}.ss", stem));
        if !self.probe.exists(&[splice_sites.clone()]) {
            let request = self
                .request(StageKind::ExtractSpliceSites, 1)
                .aligner(AlignerKind::Hisat2)
                .inputs(vec![gtf.to_path_buf()])
                .outputs(vec![splice_sites.clone()]);
            self.run_stage(request, &[splice_sites.clone()]).await?;
        }

        let exons = reference_dir.join(format!("{}.exon", stem));
        if !self.probe.exists(&[exons.clone()]) {
            let request = self
                .request(StageKind::ExtractExons, 1)
                .aligner(AlignerKind::Hisat2)
                .inputs(vec![gtf.to_path_buf()])
                .outputs(vec![exons.clone()]);
            self.run_stage(request, &[exons.clone()]).await?;
        }

        info!("Building HISAT2 index at {}", prefix.display());
        let request = self
            .request(StageKind::BuildIndex, self.settings.threads)
            .aligner(AlignerKind::Hisat2)
            .inputs(vec![fasta.to_path_buf(), splice_sites, exons])
            .outputs(vec![prefix.clone()]);
        self.run_stage(request, &[]).await?;
        if !built() {
            return Err(PipelineError::FatalSetupFailure(format!(
                "hisat2-build finished but fewer than {} {} files exist for {}",
                HISAT2_MIN_INDEX_FILES,
                HISAT2_INDEX_EXT,
                prefix.display()
            )));
        }
        Ok(prefix)
    }
}
