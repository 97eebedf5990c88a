// src/pipelines/scheduler.rs: Three barriered phases over the sample registry
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use log::{error, info, warn};
use tokio::sync::Semaphore;
use crate::config::defs::{PipelineContext, PipelineError, RunResult, Sample, SampleOutcome};
use crate::config::settings::RunSettings;
use crate::pipelines::aggregate::{AggregationExecutor, AggregationOutcome, AggregationPhase};
use crate::pipelines::resources::ResourcePreparer;
use crate::pipelines::sample::SamplePipeline;
use crate::utils::command::StageExecutor;
use crate::utils::probe::ArtifactProbe;

/// Exit status when the run completed but at least one sample failed.
pub const EXIT_SAMPLE_FAILURE: i32 = 2;

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// In registry order.
    pub outcomes: Vec<SampleOutcome>,
    /// In configured aligner order; empty when aggregation was gated off.
    pub aggregations: Vec<AggregationOutcome>,
    pub aggregation_gated: bool,
}

impl RunReport {
    pub fn failed_samples(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.result.is_failed())
            .map(|o| o.sample_id.as_str())
            .collect()
    }

    /// (succeeded, skipped, failed)
    pub fn counts(&self) -> (usize, usize, usize) {
        self.outcomes.iter().fold((0, 0, 0), |(ok, skip, fail), o| match o.result {
            RunResult::Succeeded => (ok + 1, skip, fail),
            RunResult::Skipped(_) => (ok, skip + 1, fail),
            RunResult::Failed(_) => (ok, skip, fail + 1),
        })
    }

    pub fn exit_code(&self) -> i32 {
        if self.failed_samples().is_empty() { 0 } else { EXIT_SAMPLE_FAILURE }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Sample results:")?;
        for outcome in &self.outcomes {
            let status = match &outcome.result {
                RunResult::Succeeded => "OK".to_string(),
                RunResult::Skipped(reason) => format!("SKIPPED({})", reason),
                RunResult::Failed(cause) => format!("ERROR({})", cause),
            };
            writeln!(f, "  {}: {}", outcome.sample_id, status)?;
        }
        let (ok, skipped, failed) = self.counts();
        writeln!(f, "Succeeded: {}  Skipped: {}  Failed: {}", ok, skipped, failed)?;
        if self.aggregation_gated {
            write!(f, "Aggregation: not run ({} sample(s) failed)", failed)?;
        } else if self.aggregations.is_empty() {
            write!(f, "Aggregation: no aligners configured")?;
        } else {
            write!(f, "Aggregation:")?;
            for aggregation in &self.aggregations {
                write!(f, "\n  {}", aggregation)?;
            }
        }
        Ok(())
    }
}

/// Phase 1 (resources), barrier, phase 2 (bounded sample pool), barrier,
/// phase 3 (per-aligner aggregation, only after a clean phase 2).
pub struct PhaseScheduler {
    settings: Arc<RunSettings>,
    executor: Arc<dyn StageExecutor>,
    aggregator: Arc<dyn AggregationExecutor>,
    probe: Arc<dyn ArtifactProbe>,
}

impl PhaseScheduler {
    pub fn new(
        settings: Arc<RunSettings>,
        executor: Arc<dyn StageExecutor>,
        aggregator: Arc<dyn AggregationExecutor>,
        probe: Arc<dyn ArtifactProbe>,
    ) -> Self {
        Self { settings, executor, aggregator, probe }
    }

    /// Runs every phase over the sample registry.
    ///
    /// # Arguments
    ///
    /// * `samples` - Registry built once at ingestion.
    ///
    /// # Returns
    /// RunReport, or FatalSetupFailure when phase 1 could not complete.
    pub async fn run(&self, samples: Vec<Sample>) -> Result<RunReport, PipelineError> {
        let layout = &self.settings.layout;
        layout
            .create_dirs(&self.settings.aligners)
            .map_err(|e| PipelineError::FatalSetupFailure(format!("Cannot create output directories: {}", e)))?;

        let phase_start = Instant::now();
        info!("Phase 1: preparing shared resources");
        let preparer = ResourcePreparer::new(self.settings.clone(), self.executor.clone(), self.probe.clone());
        let resources = preparer.prepare().await.map_err(|e| match e {
            PipelineError::FatalSetupFailure(_) => e,
            other => PipelineError::FatalSetupFailure(other.to_string()),
        })?;
        info!("Phase 1 finished in {} s", phase_start.elapsed().as_secs());

        let context = Arc::new(PipelineContext { settings: self.settings.clone(), resources });

        let phase_start = Instant::now();
        info!(
            "Phase 2: {} samples, up to {} in parallel with {} threads each",
            samples.len(),
            self.settings.max_parallel_samples,
            self.settings.threads_per_sample
        );
        let outcomes = self.run_samples(context.clone(), &samples).await;
        info!("Phase 2 finished in {} s", phase_start.elapsed().as_secs());

        let mut report = RunReport { outcomes, ..Default::default() };
        let failed = report.failed_samples();
        if !failed.is_empty() {
            warn!("Skipping aggregation: {} sample(s) failed ({})", failed.len(), failed.join(", "));
            report.aggregation_gated = true;
            return Ok(report);
        }

        let phase = AggregationPhase::new(
            self.settings.clone(),
            context.resources.clone(),
            self.aggregator.clone(),
            self.probe.clone(),
        );
        for aligner in &self.settings.aligners {
            info!("Phase 3: aggregation for {}", aligner);
            let outcome = phase.run(*aligner, &samples).await;
            if let Some((step, cause)) = outcome.failure() {
                error!("{} aggregation stopped at {}: {}", aligner, step, cause);
            }
            report.aggregations.push(outcome);
        }
        Ok(report)
    }

    async fn run_samples(&self, context: Arc<PipelineContext>, samples: &[Sample]) -> Vec<SampleOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_parallel_samples));
        let mut handles = Vec::with_capacity(samples.len());

        for sample in samples {
            let semaphore = semaphore.clone();
            let pipeline = SamplePipeline::new(context.clone(), self.executor.clone(), self.probe.clone());
            let sample = sample.clone();
            handles.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return RunResult::Failed(PipelineError::UnexpectedException(e.to_string()).to_string()),
                };
                pipeline.run(&sample).await
            }));
        }

        let mut outcomes = Vec::with_capacity(samples.len());
        for (sample, handle) in samples.iter().zip(handles) {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    let cause = PipelineError::UnexpectedException(format!("worker aborted: {}", e));
                    error!("[{}] {}", sample.id, cause);
                    RunResult::Failed(cause.to_string())
                }
            };
            outcomes.push(SampleOutcome { sample_id: sample.id.clone(), result });
        }
        outcomes
    }
}
