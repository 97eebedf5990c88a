#![allow(dead_code)]
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use rnaseq_pipelines::config::defs::{AlignerKind, Sample, StageKind, ToolFailure, GENE_ABUNDANCE_FILE, STAR_SENTINEL};
use rnaseq_pipelines::config::settings::{ProjectConfig, RunSettings};
use rnaseq_pipelines::pipelines::aggregate::{AggregationExecutor, AggregationRequest, AggregationStep};
use rnaseq_pipelines::utils::command::{StageExecutor, StageOutput, StageRequest};
use rnaseq_pipelines::utils::probe::ArtifactProbe;

pub const GENOME_URLS: [&str; 2] = [
    "https://ftp.example.org/release-110/genome.fa.gz",
    "https://ftp.example.org/release-110/genes.gtf.gz",
];

/// Settings rooted at `base` with remote genome locators and no containers.
pub fn settings(base: &Path, aligner: &str) -> anyhow::Result<RunSettings> {
    settings_with(base, aligner, |_| {})
}

pub fn settings_with(base: &Path, aligner: &str, edit: impl FnOnce(&mut ProjectConfig)) -> anyhow::Result<RunSettings> {
    let mut config = ProjectConfig::default();
    config.project_setup.base_dir = base.display().to_string();
    config.project_setup.aligner = aligner.to_string();
    config.source_data.genome_urls = GENOME_URLS.iter().map(|u| u.to_string()).collect();
    config.tool_parameters.max_parallel_samples = 2;
    config.tool_parameters.threads_per_sample = 1;
    edit(&mut config);
    Ok(RunSettings::from_config(config, base)?)
}

pub fn paired_samples(ids: &[&str]) -> Vec<Sample> {
    ids.iter()
        .map(|id| {
            Sample::paired(
                *id,
                format!("https://data.example.org/{}_R1.fastq.gz", id),
                format!("https://data.example.org/{}_R2.fastq.gz", id),
            )
        })
        .collect()
}

fn touch(path: &Path) -> Result<(), ToolFailure> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ToolFailure::new("fake", e.to_string()))?;
    }
    fs::write(path, b"x").map_err(|e| ToolFailure::new("fake", e.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCall {
    pub kind: StageKind,
    pub label: String,
    pub aligner: Option<AlignerKind>,
}

/// Stage executor that materializes every requested output instead of launching tools.
#[derive(Default)]
pub struct FakeStages {
    calls: Mutex<Vec<StageCall>>,
    failing: HashSet<(String, StageKind)>,
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeStages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `kind` fail for the given sample (or "reference").
    pub fn failing(mut self, label: &str, kind: StageKind) -> Self {
        self.failing.insert((label.to_string(), kind));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<StageCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn kinds_for(&self, label: &str) -> Vec<StageKind> {
        self.calls().into_iter().filter(|c| c.label == label).map(|c| c.kind).collect()
    }

    /// Calls made by sample workers, phase 1 excluded.
    pub fn sample_calls(&self) -> Vec<StageCall> {
        self.calls().into_iter().filter(|c| c.label != "reference").collect()
    }

    pub fn peak_parallel(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn materialize(request: &StageRequest) -> Result<(), ToolFailure> {
        match request.kind {
            StageKind::BuildIndex => {
                let target = &request.outputs[0];
                match request.aligner {
                    Some(AlignerKind::Star) => touch(&target.join(STAR_SENTINEL)),
                    _ => {
                        for n in 1..=8 {
                            touch(&PathBuf::from(format!("{}.{}.ht2", target.display(), n)))?;
                        }
                        Ok(())
                    }
                }
            }
            StageKind::Decompress => {
                touch(&request.outputs[0])?;
                let _ = fs::remove_file(&request.inputs[0]);
                Ok(())
            }
            _ => request.outputs.iter().try_for_each(|out| touch(out)),
        }
    }
}

#[async_trait]
impl StageExecutor for FakeStages {
    async fn execute(&self, request: &StageRequest) -> Result<StageOutput, ToolFailure> {
        self.calls.lock().unwrap().push(StageCall {
            kind: request.kind,
            label: request.label.clone(),
            aligner: request.aligner,
        });

        let sample_work = request.label != "reference";
        if sample_work {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let result = if self.failing.contains(&(request.label.clone(), request.kind)) {
            Err(ToolFailure {
                tool: request.kind.to_string(),
                exit_code: Some(1),
                stderr: format!("simulated failure for {}", request.label),
                timed_out: false,
            })
        } else {
            Self::materialize(request)
        };

        if sample_work {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        result.map(|_| StageOutput { artifacts: request.outputs.clone(), diagnostics: String::new() })
    }
}

/// Aggregation executor that records requests and writes plausible outputs.
#[derive(Default)]
pub struct FakeAggregator {
    requests: Mutex<Vec<AggregationRequest>>,
    failing: Option<(AlignerKind, AggregationStep)>,
}

impl FakeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, aligner: AlignerKind, step: AggregationStep) -> Self {
        self.failing = Some((aligner, step));
        self
    }

    pub fn requests(&self) -> Vec<AggregationRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn steps(&self) -> Vec<(AggregationStep, AlignerKind)> {
        self.requests().iter().map(|r| (r.step, r.aligner)).collect()
    }
}

#[async_trait]
impl AggregationExecutor for FakeAggregator {
    async fn execute(&self, request: &AggregationRequest) -> Result<(), ToolFailure> {
        self.requests.lock().unwrap().push(request.clone());
        if self.failing == Some((request.aligner, request.step)) {
            return Err(ToolFailure {
                tool: request.step.to_string(),
                exit_code: Some(1),
                stderr: "simulated aggregation failure".to_string(),
                timed_out: false,
            });
        }
        match request.step {
            AggregationStep::Quantify => {
                for (id, _) in &request.alignments {
                    let table = request.output.join(id).join(GENE_ABUNDANCE_FILE);
                    touch(&table)?;
                    fs::write(
                        &table,
                        "Gene ID\tGene Name\tReference\tStrand\tStart\tEnd\tCoverage\tFPKM\tTPM\n\
                         G1\tA\tchr1\t+\t1\t100\t5.0\t3.0\t1.5\n\
                         G2\tB\tchr1\t-\t200\t300\t2.0\t1.0\t0.5\n",
                    )
                    .map_err(|e| ToolFailure::new("fake", e.to_string()))?;
                }
                Ok(())
            }
            AggregationStep::Count => touch(&request.output),
            _ => fs::create_dir_all(&request.output).map_err(|e| ToolFailure::new("fake", e.to_string())),
        }
    }
}

/// Probe over an in-memory set of paths; nothing touches the filesystem.
#[derive(Default)]
pub struct MemoryProbe {
    present: Mutex<HashSet<PathBuf>>,
}

impl MemoryProbe {
    pub fn with(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self { present: Mutex::new(paths.into_iter().collect()) }
    }
}

impl ArtifactProbe for MemoryProbe {
    fn exists(&self, paths: &[PathBuf]) -> bool {
        let present = self.present.lock().unwrap();
        paths.iter().all(|p| present.contains(p))
    }

    fn count_matching(&self, dir: &Path, prefix: &str, suffix: &str) -> usize {
        let present = self.present.lock().unwrap();
        present
            .iter()
            .filter(|p| p.parent() == Some(dir))
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .filter(|name| name.starts_with(prefix) && name.ends_with(suffix))
            .count()
    }
}

/// Every file under `root`, relative to it.
pub fn tree(root: &Path) -> BTreeSet<PathBuf> {
    fn walk(root: &Path, dir: &Path, files: &mut BTreeSet<PathBuf>) {
        let Ok(entries) = fs::read_dir(dir) else { return };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(root, &path, files);
            } else if let Ok(relative) = path.strip_prefix(root) {
                files.insert(relative.to_path_buf());
            }
        }
    }
    let mut files = BTreeSet::new();
    walk(root, root, &mut files);
    files
}
