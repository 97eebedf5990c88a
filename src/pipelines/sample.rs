// src/pipelines/sample.rs: Per-sample checkpointed stage sequence
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use log::{debug, error, info};
use crate::config::defs::{
    AlignerKind, PipelineContext, PipelineError, RunResult, Sample, StageKind, ToolFailure,
};
use crate::utils::command::{StageExecutor, StageRequest};
use crate::utils::layout::ArtifactLayout;
use crate::utils::probe::ArtifactProbe;
use crate::utils::retention::{CleanupTrigger, RetentionPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SampleState {
    NotStarted,
    RawFetched,
    RawDecompressed,
    QcReported,
    Trimmed,
    Aligned(usize),
    Completed,
}

impl fmt::Display for SampleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleState::Aligned(n) => write!(f, "Aligned({})", n),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Drives one sample from raw locators to final alignments. Every stage is
/// skipped when its artifacts are already on disk.
pub struct SamplePipeline {
    context: Arc<PipelineContext>,
    executor: Arc<dyn StageExecutor>,
    probe: Arc<dyn ArtifactProbe>,
}

impl SamplePipeline {
    pub fn new(context: Arc<PipelineContext>, executor: Arc<dyn StageExecutor>, probe: Arc<dyn ArtifactProbe>) -> Self {
        Self { context, executor, probe }
    }

    fn layout(&self) -> &ArtifactLayout {
        &self.context.settings.layout
    }

    fn aligners(&self) -> &[AlignerKind] {
        &self.context.settings.aligners
    }

    fn retention(&self) -> RetentionPolicy<'_> {
        let settings = &self.context.settings;
        RetentionPolicy::new(settings.retention, &settings.layout, &settings.aligners)
    }

    fn request(&self, kind: StageKind, sample: &Sample) -> StageRequest {
        let settings = &self.context.settings;
        StageRequest::new(kind, &sample.id, settings.threads_per_sample, settings.tool_timeout)
    }

    /// Runs the sample to a terminal outcome. Never returns an error: every
    /// failure is folded into RunResult::Failed.
    pub async fn run(&self, sample: &Sample) -> RunResult {
        match self.advance(sample).await {
            Ok(result) => result,
            Err(e) => {
                error!("[{}] {}", sample.id, e);
                RunResult::Failed(e.to_string())
            }
        }
    }

    async fn advance(&self, sample: &Sample) -> Result<RunResult, PipelineError> {
        let layout = self.layout();
        let id = &sample.id;

        if self.aligners().is_empty() {
            info!("[{}] No aligners configured; nothing to do", id);
            return Ok(RunResult::Skipped("no aligners configured".to_string()));
        }

        let mut state = SampleState::NotStarted;
        if self.probe.exists(&layout.final_alignments(sample, self.aligners())) {
            info!("[{}] Final alignments present for every aligner; skipping", id);
            transition(id, &mut state, SampleState::Completed);
            self.retention().purge(sample, CleanupTrigger::Retroactive).await;
            return Ok(RunResult::Skipped("final alignments already present".to_string()));
        }

        // Raw reads are only needed by QC and trimming.
        let needs_raw = !self.probe.exists(&layout.qc_reports(sample)) || !self.probe.exists(&layout.trimmed_reads(sample));
        if needs_raw {
            self.fetch_raw(sample).await?;
            transition(id, &mut state, SampleState::RawFetched);
            self.decompress_raw(sample).await?;
            transition(id, &mut state, SampleState::RawDecompressed);
        } else {
            debug!("[{}] QC reports and trimmed reads present; raw reads not needed", id);
        }

        self.quality_report(sample).await?;
        transition(id, &mut state, SampleState::QcReported);

        self.trim(sample).await?;
        transition(id, &mut state, SampleState::Trimmed);

        for (n, aligner) in self.aligners().iter().enumerate() {
            self.align(sample, *aligner).await?;
            transition(id, &mut state, SampleState::Aligned(n + 1));
        }

        transition(id, &mut state, SampleState::Completed);
        self.retention().purge(sample, CleanupTrigger::Prospective).await;
        info!("[{}] Completed", id);
        Ok(RunResult::Succeeded)
    }

    /// Executes one stage and confirms its checkpoint artifacts landed.
    async fn invoke(&self, request: StageRequest, expected: &[PathBuf]) -> Result<(), PipelineError> {
        debug!("[{}] Running {}", request.label, request.kind);
        let output = self
            .executor
            .execute(&request)
            .await
            .map_err(|failure| {
                if !failure.stderr.trim().is_empty() {
                    error!("[{}] {} stderr:\n{}", request.label, failure.tool, failure.stderr.trim_end());
                }
                PipelineError::ExternalToolFailure { stage: request.kind, failure }
            })?;
        if !output.diagnostics.trim().is_empty() {
            debug!("[{}] {} diagnostics:\n{}", request.label, request.kind, output.diagnostics.trim_end());
        }
        for artifact in &output.artifacts {
            debug!("[{}] {} wrote {}", request.label, request.kind, artifact.display());
        }

        if let Some(missing) = expected.iter().find(|path| !self.probe.exists(std::slice::from_ref(*path))) {
            return Err(PipelineError::ExternalToolFailure {
                stage: request.kind,
                failure: ToolFailure::new(
                    request.kind.to_string(),
                    format!("reported success but {} is missing", missing.display()),
                ),
            });
        }
        Ok(())
    }

    fn require(&self, stage: StageKind, paths: &[PathBuf]) -> Result<(), PipelineError> {
        match paths.iter().find(|path| !self.probe.exists(std::slice::from_ref(*path))) {
            Some(path) => Err(PipelineError::MissingPrerequisite { stage, path: path.clone() }),
            None => Ok(()),
        }
    }

    async fn fetch_raw(&self, sample: &Sample) -> Result<(), PipelineError> {
        let layout = self.layout();
        for (mate, locator) in sample.mates() {
            let raw = layout.raw(sample, mate);
            let compressed = layout.raw_compressed(sample, mate);
            if self.probe.exists(&[raw.clone()]) || self.probe.exists(&[compressed.clone()]) {
                debug!("[{}] Mate {} already fetched", sample.id, mate.number());
                continue;
            }
            info!("[{}] Downloading mate {}", sample.id, mate.number());
            let request = self
                .request(StageKind::Download, sample)
                .locator(locator)
                .outputs(vec![compressed.clone()]);
            self.invoke(request, &[compressed]).await?;
        }
        Ok(())
    }

    async fn decompress_raw(&self, sample: &Sample) -> Result<(), PipelineError> {
        let layout = self.layout();
        for (mate, _) in sample.mates() {
            let raw = layout.raw(sample, mate);
            if self.probe.exists(&[raw.clone()]) {
                continue;
            }
            let compressed = layout.raw_compressed(sample, mate);
            self.require(StageKind::Decompress, &[compressed.clone()])?;
            let request = self
                .request(StageKind::Decompress, sample)
                .inputs(vec![compressed])
                .outputs(vec![raw.clone()]);
            self.invoke(request, &[raw]).await?;
        }
        Ok(())
    }

    async fn quality_report(&self, sample: &Sample) -> Result<(), PipelineError> {
        let layout = self.layout();
        let reports = layout.qc_reports(sample);
        if self.probe.exists(&reports) {
            debug!("[{}] QC reports present", sample.id);
            return Ok(());
        }
        let raw = layout.raw_reads(sample);
        self.require(StageKind::QualityReport, &raw)?;
        info!("[{}] Running quality report", sample.id);
        let request = self
            .request(StageKind::QualityReport, sample)
            .inputs(raw)
            .outputs(reports.clone());
        self.invoke(request, &reports).await
    }

    async fn trim(&self, sample: &Sample) -> Result<(), PipelineError> {
        let layout = self.layout();
        let trimmed = layout.trimmed_reads(sample);
        if self.probe.exists(&trimmed) {
            debug!("[{}] Trimmed reads present", sample.id);
            return Ok(());
        }
        let raw = layout.raw_reads(sample);
        self.require(StageKind::Trim, &raw)?;
        info!("[{}] Trimming", sample.id);
        let mut outputs = trimmed.clone();
        outputs.extend(layout.unpaired_reads(sample));
        let request = self
            .request(StageKind::Trim, sample)
            .inputs(raw)
            .outputs(outputs)
            .reference(self.context.resources.adapters.clone());
        self.invoke(request, &trimmed).await
    }

    async fn align(&self, sample: &Sample, aligner: AlignerKind) -> Result<(), PipelineError> {
        let layout = self.layout();
        let final_bam = layout.final_alignment(sample, aligner);
        if self.probe.exists(&[final_bam.clone()]) {
            debug!("[{}] {} alignment present", sample.id, aligner);
            return Ok(());
        }

        let trimmed = layout.trimmed_reads(sample);
        let index = self
            .context
            .resources
            .indices
            .get(&aligner)
            .cloned()
            .ok_or_else(|| PipelineError::MissingPrerequisite {
                stage: StageKind::Align,
                path: layout.reference_dir(),
            })?;

        match aligner {
            AlignerKind::Star => {
                self.require(StageKind::Align, &trimmed)?;
                info!("[{}] Aligning with {}", sample.id, aligner);
                let request = self
                    .request(StageKind::Align, sample)
                    .aligner(aligner)
                    .inputs(trimmed)
                    .outputs(vec![final_bam.clone()])
                    .reference(Some(index));
                self.invoke(request, &[final_bam]).await
            }
            AlignerKind::Hisat2 => {
                let sam = layout.intermediate_alignment(sample);
                if self.probe.exists(&[sam.clone()]) {
                    info!("[{}] {} SAM present; sorting only", sample.id, aligner);
                } else {
                    self.require(StageKind::Align, &trimmed)?;
                    info!("[{}] Aligning with {}", sample.id, aligner);
                    let request = self
                        .request(StageKind::Align, sample)
                        .aligner(aligner)
                        .inputs(trimmed)
                        .outputs(vec![sam.clone(), layout.alignment_summary(sample)])
                        .reference(Some(index));
                    self.invoke(request, &[sam.clone()]).await?;
                }
                let request = self
                    .request(StageKind::Sort, sample)
                    .aligner(aligner)
                    .inputs(vec![sam])
                    .outputs(vec![final_bam.clone()]);
                self.invoke(request, &[final_bam]).await
            }
        }
    }
}

fn transition(id: &str, state: &mut SampleState, next: SampleState) {
    debug!("[{}] {} -> {}", id, state, next);
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::fs;
    use std::sync::Mutex;
    use async_trait::async_trait;
    use tempfile::tempdir;
    use crate::config::defs::PreparedResources;
    use crate::config::settings::{ProjectConfig, RunSettings};
    use crate::utils::command::StageOutput;
    use crate::utils::probe::FsProbe;

    /// Records stage kinds and touches every requested output.
    #[derive(Default)]
    struct Touching {
        calls: Mutex<Vec<StageKind>>,
    }

    #[async_trait]
    impl StageExecutor for Touching {
        async fn execute(&self, request: &StageRequest) -> Result<StageOutput, ToolFailure> {
            self.calls.lock().unwrap().push(request.kind);
            for out in &request.outputs {
                fs::write(out, b"x").map_err(|e| ToolFailure::new("touch", e.to_string()))?;
            }
            Ok(StageOutput { artifacts: request.outputs.clone(), diagnostics: String::new() })
        }
    }

    fn context(base: &std::path::Path, aligner: &str) -> Arc<PipelineContext> {
        let config: ProjectConfig = serde_json::from_str(&format!(
            r#"{{"project_setup": {{"base_dir": "{}", "aligner": "{}"}}}}"#,
            base.display(),
            aligner
        ))
        .unwrap();
        let settings = RunSettings::from_config(config, base).unwrap();
        settings.layout.create_dirs(&settings.aligners).unwrap();
        let mut indices = BTreeMap::new();
        for a in &settings.aligners {
            indices.insert(*a, base.join("index"));
        }
        Arc::new(PipelineContext {
            settings: Arc::new(settings),
            resources: PreparedResources { indices, ..Default::default() },
        })
    }

    #[tokio::test]
    async fn test_hisat2_sort_only_when_sam_present() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let ctx = context(dir.path(), "hisat2");
        let sample = Sample::paired("S1", "u1", "u2");
        let layout = &ctx.settings.layout;
        for path in layout.qc_reports(&sample).into_iter().chain(layout.trimmed_reads(&sample)) {
            fs::write(path, b"x")?;
        }
        fs::write(layout.intermediate_alignment(&sample), b"@HD")?;

        let exec = Arc::new(Touching::default());
        let pipeline = SamplePipeline::new(ctx.clone(), exec.clone(), Arc::new(FsProbe));
        assert_eq!(pipeline.run(&sample).await, RunResult::Succeeded);
        assert_eq!(*exec.calls.lock().unwrap(), vec![StageKind::Sort]);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_archive_is_prerequisite_failure() -> anyhow::Result<()> {
        struct NoDownload;
        #[async_trait]
        impl StageExecutor for NoDownload {
            async fn execute(&self, _request: &StageRequest) -> Result<StageOutput, ToolFailure> {
                Ok(StageOutput::default())
            }
        }

        let dir = tempdir()?;
        let ctx = context(dir.path(), "star");
        let sample = Sample::single("S2", "u");
        let pipeline = SamplePipeline::new(ctx, Arc::new(NoDownload), Arc::new(FsProbe));
        match pipeline.run(&sample).await {
            RunResult::Failed(cause) => assert!(cause.contains("download failed"), "{}", cause),
            other => panic!("unexpected {:?}", other),
        }
        Ok(())
    }
}
