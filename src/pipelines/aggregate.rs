// src/pipelines/aggregate.rs: Phase 3, per-aligner counting, statistics and reports
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use crate::config::defs::{
    AlignerKind, PipelineError, PreparedResources, Sample, ToolFailure, FEATURECOUNTS_TAG, GENE_ABUNDANCE_FILE,
    MULTIQC_TAG, RSCRIPT_TAG, STRINGTIE_TAG,
};
use crate::config::settings::{QuantMethod, RunSettings};
use crate::utils::command::{run_tool, ToolCommand, ToolLauncher};
use crate::utils::probe::ArtifactProbe;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregationStep {
    Quantify,
    Exploratory,
    Count,
    DifferentialExpression,
    EnrichmentPlots,
    PdfReport,
    Report,
}

impl fmt::Display for AggregationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregationStep::Quantify => "quantify",
            AggregationStep::Exploratory => "exploratory analysis",
            AggregationStep::Count => "count",
            AggregationStep::DifferentialExpression => "differential expression",
            AggregationStep::EnrichmentPlots => "enrichment plots",
            AggregationStep::PdfReport => "pdf report",
            AggregationStep::Report => "report",
        };
        f.write_str(name)
    }
}

/// One aggregation invocation. `alignments` comes from the sample registry, never from
/// a directory listing.
#[derive(Debug, Clone)]
pub struct AggregationRequest {
    pub step: AggregationStep,
    pub aligner: AlignerKind,
    /// (sample id, final BAM) in sample order.
    pub alignments: Vec<(String, PathBuf)>,
    pub paired: bool,
    /// Annotation GTF prepared in phase 1.
    pub annotation: PathBuf,
    /// Step-specific inputs: matrix + metadata for Exploratory, counts file + metadata for
    /// DifferentialExpression, scan dirs for Report.
    pub inputs: Vec<PathBuf>,
    /// Matrix type explored by an Exploratory request.
    pub method: Option<QuantMethod>,
    /// Output file (Count) or directory (everything else).
    pub output: PathBuf,
    pub threads: usize,
    pub timeout: Duration,
}

#[async_trait]
pub trait AggregationExecutor: Send + Sync {
    async fn execute(&self, request: &AggregationRequest) -> Result<(), ToolFailure>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Done,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct AggregationOutcome {
    pub aligner: AlignerKind,
    pub steps: Vec<(AggregationStep, StepStatus)>,
}

impl AggregationOutcome {
    pub fn failure(&self) -> Option<(AggregationStep, &str)> {
        self.steps.iter().find_map(|(step, status)| match status {
            StepStatus::Failed(cause) => Some((*step, cause.as_str())),
            _ => None,
        })
    }

    pub fn executed(&self) -> Vec<AggregationStep> {
        self.steps
            .iter()
            .filter(|(_, status)| *status == StepStatus::Done)
            .map(|(step, _)| *step)
            .collect()
    }
}

impl fmt::Display for AggregationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.failure() {
            Some((step, cause)) => write!(f, "{}: ERROR at {} ({})", self.aligner, step, cause),
            None => {
                let done: Vec<String> = self.executed().iter().map(|s| s.to_string()).collect();
                let done = if done.is_empty() { "nothing to do".to_string() } else { done.join(", ") };
                write!(f, "{}: OK ({})", self.aligner, done)
            }
        }
    }
}

/// Step plan with a skip reason for steps that configuration switches off.
type Plan = Vec<(AggregationStep, Option<String>)>;

/// Sequences the aggregation steps of one aligner.
pub struct AggregationPhase {
    settings: Arc<RunSettings>,
    resources: PreparedResources,
    executor: Arc<dyn AggregationExecutor>,
    probe: Arc<dyn ArtifactProbe>,
}

impl AggregationPhase {
    pub fn new(
        settings: Arc<RunSettings>,
        resources: PreparedResources,
        executor: Arc<dyn AggregationExecutor>,
        probe: Arc<dyn ArtifactProbe>,
    ) -> Self {
        Self { settings, resources, executor, probe }
    }

    fn plan(&self, aligner: AlignerKind) -> Plan {
        let config = &self.settings.config;
        let scripts = &config.scripts;
        let analysis = &config.functional_analysis;
        let methods = self.settings.quantification.get(&aligner).cloned().unwrap_or_default();

        let quantify = if methods.is_empty() { Some("not requested for this aligner".to_string()) } else { None };
        let exploratory = if self.settings.exploration.is_empty() {
            Some("run_exploratory_analysis disabled or explore_on empty".to_string())
        } else if scripts.r_exploratory_script_path.is_none() {
            Some("no r_exploratory_script_path configured".to_string())
        } else if config.deseq2_experiment.metadata_path.is_none() {
            Some("no metadata_path configured".to_string())
        } else {
            quantify.as_ref().map(|_| "quantification not run".to_string())
        };
        let differential = match (&scripts.r_deseq2_script_path, &config.deseq2_experiment.metadata_path) {
            (None, _) => Some("no r_deseq2_script_path configured".to_string()),
            (_, None) => Some("no metadata_path configured".to_string()),
            _ => None,
        };
        let enrichment = if !analysis.run_enrichment_plots {
            Some("run_enrichment_plots disabled".to_string())
        } else if scripts.r_enrichment_plotter_script_path.is_none() {
            Some("no r_enrichment_plotter_script_path configured".to_string())
        } else if analysis.pathview_kegg_code.is_none() {
            Some("no pathview_kegg_code configured".to_string())
        } else {
            differential.as_ref().map(|_| "differential expression not run".to_string())
        };
        let pdf = if !analysis.run_final_pdf_reports {
            Some("run_final_pdf_reports disabled".to_string())
        } else if scripts.r_pdf_report_script_path.is_none() {
            Some("no r_pdf_report_script_path configured".to_string())
        } else if analysis.gprofiler_organism_code.is_none() {
            Some("no gprofiler_organism_code configured".to_string())
        } else {
            differential.as_ref().map(|_| "differential expression not run".to_string())
        };
        let report = if config.container_images.multiqc.is_none() {
            Some("no multiqc image configured".to_string())
        } else {
            None
        };

        vec![
            (AggregationStep::Quantify, quantify),
            (AggregationStep::Exploratory, exploratory),
            (AggregationStep::Count, None),
            (AggregationStep::DifferentialExpression, differential),
            (AggregationStep::EnrichmentPlots, enrichment),
            (AggregationStep::PdfReport, pdf),
            (AggregationStep::Report, report),
        ]
    }

    fn request(&self, step: AggregationStep, aligner: AlignerKind, samples: &[Sample], output: PathBuf) -> AggregationRequest {
        let layout = &self.settings.layout;
        AggregationRequest {
            annotation: self.resources.gtf.clone(),
            step,
            aligner,
            alignments: samples
                .iter()
                .map(|s| (s.id.clone(), layout.final_alignment(s, aligner)))
                .collect(),
            paired: samples.iter().any(|s| s.is_paired()),
            inputs: Vec::new(),
            method: None,
            output,
            threads: self.settings.threads,
            timeout: self.settings.tool_timeout,
        }
    }

    /// Runs the aggregation steps of one aligner in order. The first failing step
    /// stops the remaining steps of this aligner only.
    ///
    /// # Arguments
    ///
    /// * `aligner` - Aligner whose final alignments are aggregated.
    /// * `samples` - Sample registry.
    ///
    /// # Returns
    /// Per-step statuses.
    pub async fn run(&self, aligner: AlignerKind, samples: &[Sample]) -> AggregationOutcome {
        info!("Aggregating {} results for {} samples", aligner, samples.len());
        let mut outcome = AggregationOutcome { aligner, steps: Vec::new() };
        if samples.is_empty() {
            warn!("{}: no samples in the registry, nothing to aggregate", aligner);
            outcome.steps = self
                .plan(aligner)
                .into_iter()
                .map(|(step, _)| (step, StepStatus::Skipped("no samples in the registry".to_string())))
                .collect();
            return outcome;
        }
        for (step, skip) in self.plan(aligner) {
            if let Some(reason) = skip {
                if step == AggregationStep::Report {
                    warn!("{}: skipping {}: {}", aligner, step, reason);
                } else {
                    info!("{}: skipping {}: {}", aligner, step, reason);
                }
                outcome.steps.push((step, StepStatus::Skipped(reason)));
                continue;
            }
            let status = match self.run_step(step, aligner, samples).await {
                Ok(status) => status,
                Err(e) => {
                    error!("{}: {} failed: {}", aligner, step, e);
                    outcome.steps.push((step, StepStatus::Failed(e.to_string())));
                    break;
                }
            };
            if let StepStatus::Skipped(reason) = &status {
                warn!("{}: skipping {}: {}", aligner, step, reason);
            }
            outcome.steps.push((step, status));
        }
        outcome
    }

    fn metadata_path(&self) -> Result<PathBuf, PipelineError> {
        self.settings
            .config
            .deseq2_experiment
            .metadata_path
            .as_ref()
            .map(PathBuf::from)
            .ok_or_else(|| PipelineError::InvalidConfig("metadata_path missing".to_string()))
    }

    async fn run_step(&self, step: AggregationStep, aligner: AlignerKind, samples: &[Sample]) -> Result<StepStatus, PipelineError> {
        let layout = &self.settings.layout;
        let fail = |failure: ToolFailure| PipelineError::AggregationFailure { step: step.to_string(), failure };

        match step {
            AggregationStep::Quantify => {
                let pending: Vec<Sample> = samples
                    .iter()
                    .filter(|s| !self.probe.exists(&[layout.abundance_file(&s.id, aligner)]))
                    .cloned()
                    .collect();
                if !pending.is_empty() {
                    info!("{}: quantifying {} samples", aligner, pending.len());
                    let request = self.request(step, aligner, &pending, layout.stringtie_dir(aligner));
                    self.executor.execute(&request).await.map_err(fail)?;
                }
                let abundances: Vec<(String, PathBuf)> = samples
                    .iter()
                    .map(|s| (s.id.clone(), layout.abundance_file(&s.id, aligner)))
                    .collect();
                let methods = self.settings.quantification.get(&aligner).cloned().unwrap_or_default();
                for method in methods {
                    let matrix = layout.quant_matrix(aligner, method.tag());
                    let genes = assemble_matrix(&abundances, method, &matrix)?;
                    info!("{}: {} matrix with {} genes written to {}", aligner, method.column(), genes, matrix.display());
                }
                Ok(StepStatus::Done)
            }
            AggregationStep::Exploratory => {
                let metadata = self.metadata_path()?;
                let mut explored = 0;
                for &method in &self.settings.exploration {
                    let matrix = layout.quant_matrix(aligner, method.tag());
                    if !self.probe.exists(&[matrix.clone()]) {
                        warn!("{}: no {} matrix at {}, not exploring it", aligner, method.column(), matrix.display());
                        continue;
                    }
                    info!("{}: exploratory analysis of the {} matrix", aligner, method.column());
                    let mut request = self.request(step, aligner, samples, layout.eda_dir(aligner, method.column()));
                    request.inputs = vec![matrix, metadata.clone()];
                    request.method = Some(method);
                    self.executor.execute(&request).await.map_err(fail)?;
                    explored += 1;
                }
                if explored == 0 {
                    return Ok(StepStatus::Skipped("no quantification matrix to explore".to_string()));
                }
                Ok(StepStatus::Done)
            }
            AggregationStep::Count => {
                let counts = layout.counts_file(aligner);
                if self.probe.exists(&[counts.clone()]) {
                    return Ok(StepStatus::Skipped(format!("{} already present", counts.display())));
                }
                let request = self.request(step, aligner, samples, counts);
                self.executor.execute(&request).await.map_err(fail)?;
                Ok(StepStatus::Done)
            }
            AggregationStep::DifferentialExpression => {
                let metadata = self.metadata_path()?;
                let out_dir = layout.deseq2_dir(aligner);
                fs::create_dir_all(&out_dir)?;
                let corrected = layout.corrected_metadata(aligner);
                write_corrected_metadata(&metadata, &corrected)?;
                let mut request = self.request(step, aligner, samples, out_dir);
                request.inputs = vec![layout.counts_file(aligner), corrected];
                self.executor.execute(&request).await.map_err(fail)?;
                Ok(StepStatus::Done)
            }
            AggregationStep::EnrichmentPlots | AggregationStep::PdfReport => {
                let request = self.request(step, aligner, samples, layout.deseq2_dir(aligner));
                self.executor.execute(&request).await.map_err(fail)?;
                Ok(StepStatus::Done)
            }
            AggregationStep::Report => {
                let mut request = self.request(step, aligner, samples, layout.multiqc_dir(aligner));
                let eda_dirs = self.settings.exploration.iter().map(|m| layout.eda_dir(aligner, m.column()));
                request.inputs = [layout.fastqc_dir(), layout.alignments_dir(aligner), layout.counts_dir()]
                    .into_iter()
                    .chain(eda_dirs)
                    .chain([layout.deseq2_dir(aligner)])
                    .filter(|dir| dir.is_dir())
                    .collect();
                self.executor.execute(&request).await.map_err(fail)?;
                Ok(StepStatus::Done)
            }
        }
    }
}

fn malformed(path: &Path) -> impl Fn(csv::Error) -> PipelineError + '_ {
    move |e| PipelineError::MalformedTable { path: path.to_path_buf(), reason: e.to_string() }
}

/// Copies a CSV metadata table, replacing '-' with '.' in the first column so
/// sample names match R's column-name mangling.
pub fn write_corrected_metadata(source: &Path, dest: &Path) -> Result<(), PipelineError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(source)
        .map_err(|e| PipelineError::InvalidConfig(format!("Cannot read metadata {}: {}", source.display(), e)))?;
    let mut writer = csv::WriterBuilder::new().flexible(true).from_path(dest).map_err(malformed(dest))?;

    for (n, record) in reader.records().enumerate() {
        let record = record.map_err(malformed(source))?;
        if n == 0 {
            writer.write_record(&record).map_err(malformed(dest))?;
            continue;
        }
        let corrected: Vec<String> = record
            .iter()
            .enumerate()
            .map(|(i, field)| if i == 0 { field.replace('-', ".") } else { field.to_string() })
            .collect();
        writer.write_record(&corrected).map_err(malformed(dest))?;
    }
    writer.flush()?;
    Ok(())
}

/// Builds a gene x sample matrix from StringTie gene abundance tables.
/// Duplicate gene rows are summed; genes absent from a sample get 0.
///
/// # Arguments
///
/// * `abundances` - (sample id, gene_abundances.tsv) pairs; missing files are skipped.
/// * `method` - Column to collect.
/// * `dest` - Output TSV.
///
/// # Returns
/// Number of genes written, or MalformedTable when a value does not parse.
pub fn assemble_matrix(abundances: &[(String, PathBuf)], method: QuantMethod, dest: &Path) -> Result<usize, PipelineError> {
    let mut columns: Vec<&str> = Vec::new();
    let mut matrix: BTreeMap<String, Vec<f64>> = BTreeMap::new();

    for (sample_id, path) in abundances {
        let mut reader = match csv::ReaderBuilder::new().delimiter(b'\t').flexible(true).from_path(path) {
            Ok(reader) => reader,
            Err(e) => {
                warn!("[{}] No abundance table at {}: {}", sample_id, path.display(), e);
                continue;
            }
        };
        let header = reader.headers().map_err(malformed(path))?.clone();
        let gene_col = header.iter().position(|h| h == "Gene ID");
        let value_col = header.iter().position(|h| h == method.column());
        let (Some(gene_col), Some(value_col)) = (gene_col, value_col) else {
            warn!("[{}] {} lacks Gene ID or {} column", sample_id, path.display(), method.column());
            continue;
        };

        let column = columns.len();
        columns.push(sample_id);
        for row in matrix.values_mut() {
            row.push(0.0);
        }
        for (line, record) in reader.records().enumerate() {
            let record = record.map_err(malformed(path))?;
            let (Some(gene), Some(value)) = (record.get(gene_col), record.get(value_col)) else {
                return Err(PipelineError::MalformedTable {
                    path: path.clone(),
                    reason: format!("row {} has {} fields", line + 2, record.len()),
                });
            };
            let value: f64 = value.trim().parse().map_err(|_| PipelineError::MalformedTable {
                path: path.clone(),
                reason: format!("row {}: {} value {:?} for {} is not a number", line + 2, method.column(), value, gene),
            })?;
            let row = matrix.entry(gene.to_string()).or_insert_with(|| vec![0.0; column + 1]);
            row[column] += value;
        }
    }

    if columns.is_empty() {
        return Err(PipelineError::UnexpectedException(format!(
            "no usable abundance tables for the {} matrix",
            method.column()
        )));
    }

    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(dest).map_err(malformed(dest))?;
    let mut header = vec!["gene_id"];
    header.extend(columns.iter().copied());
    writer.write_record(&header).map_err(malformed(dest))?;
    for (gene, values) in &matrix {
        let mut row = vec![gene.clone()];
        row.extend(values.iter().map(|value| value.to_string()));
        writer.write_record(&row).map_err(malformed(dest))?;
    }
    writer.flush()?;
    Ok(matrix.len())
}

mod featurecounts {
    use std::path::{Path, PathBuf};

    pub fn arg_generator(threads: usize, strand: u8, gtf: &Path, out: &Path, paired: bool, bams: &[PathBuf]) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push("-T".to_string());
        args_vec.push(threads.to_string());
        args_vec.push("-s".to_string());
        args_vec.push(strand.to_string());
        args_vec.push("-a".to_string());
        args_vec.push(gtf.to_string_lossy().to_string());
        args_vec.push("-o".to_string());
        args_vec.push(out.to_string_lossy().to_string());
        if paired {
            args_vec.push("-p".to_string());
        }
        for bam in bams {
            args_vec.push(bam.to_string_lossy().to_string());
        }
        args_vec
    }
}

mod stringtie {
    use std::path::Path;

    pub fn arg_generator(threads: usize, bam: &Path, gtf: &Path, abundance: &Path, transcripts: &Path) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push(bam.to_string_lossy().to_string());
        args_vec.push("-G".to_string());
        args_vec.push(gtf.to_string_lossy().to_string());
        args_vec.push("-p".to_string());
        args_vec.push(threads.to_string());
        args_vec.push("-e".to_string());
        args_vec.push("-A".to_string());
        args_vec.push(abundance.to_string_lossy().to_string());
        args_vec.push("-o".to_string());
        args_vec.push(transcripts.to_string_lossy().to_string());
        args_vec
    }
}

/// Production AggregationExecutor backed by the configured tools and R scripts.
pub struct CommandAggregationExecutor {
    settings: Arc<RunSettings>,
    launcher: ToolLauncher,
}

impl CommandAggregationExecutor {
    pub fn new(settings: Arc<RunSettings>) -> Self {
        let launcher = ToolLauncher::new(&settings);
        Self { settings, launcher }
    }

    fn script(&self, path: &Option<String>, name: &str) -> Result<String, ToolFailure> {
        let path = path
            .as_ref()
            .ok_or_else(|| ToolFailure::new(RSCRIPT_TAG, format!("no {} configured", name)))?;
        let absolute = std::path::absolute(path)
            .map_err(|e| ToolFailure::new(RSCRIPT_TAG, format!("Cannot resolve {}: {}", path, e)))?;
        if !absolute.exists() {
            return Err(ToolFailure::new(RSCRIPT_TAG, format!("{} not found", absolute.display())));
        }
        Ok(self.launcher.container_path(&absolute))
    }

    fn deseq2_command(&self, request: &AggregationRequest) -> Result<ToolCommand, ToolFailure> {
        let config = &self.settings.config;
        let experiment = &config.deseq2_experiment;
        let annotation = &config.annotation;
        let thresholds = &config.tool_parameters.analysis_thresholds;
        let analysis = &config.functional_analysis;
        let (Some(counts), Some(metadata)) = (request.inputs.first(), request.inputs.get(1)) else {
            return Err(ToolFailure::new(RSCRIPT_TAG, "differential expression needs counts and metadata"));
        };
        let path = |p: &Path| self.launcher.container_path(p);
        let text = |v: &Option<String>| v.clone().unwrap_or_else(|| "NULL".to_string());

        let mut cmd = self
            .launcher
            .bound_command(RSCRIPT_TAG, &request.output)
            .arg(self.script(&config.scripts.r_deseq2_script_path, "r_deseq2_script_path")?)
            .args(["--counting_method", config.project_setup.counting_method.as_str()])
            .args(["--counts_file".to_string(), path(counts)])
            .args(["--metadata_file".to_string(), path(metadata)])
            .args(["--output_dir".to_string(), path(&request.output)])
            .args(["--gtf_file".to_string(), path(&request.annotation)])
            .args(["--design_formula".to_string(), text(&experiment.design_formula)])
            .args(["--control_group".to_string(), text(&experiment.control_group)])
            .args(["--organism_db".to_string(), text(&annotation.organism_db)])
            .args(["--key_type".to_string(), text(&annotation.key_type)])
            .args(["--padj_threshold".to_string(), thresholds.padj.to_string()])
            .args(["--log2fc_threshold".to_string(), thresholds.log2fc.to_string()])
            .args([
                "--strip_gene_version".to_string(),
                annotation.strip_gene_version.to_string().to_uppercase(),
            ]);
        if let Some(code) = &analysis.gprofiler_organism_code {
            cmd = cmd
                .args(["--run_kegg", "TRUE", "--gprofiler_organism", code.as_str()])
                .args(["--kegg_padj_threshold".to_string(), analysis.kegg_padj_threshold.to_string()]);
        }
        Ok(cmd)
    }

    fn exploratory_command(&self, request: &AggregationRequest) -> Result<ToolCommand, ToolFailure> {
        let config = &self.settings.config;
        let annotation = &config.annotation;
        let (Some(matrix), Some(metadata), Some(method)) = (request.inputs.first(), request.inputs.get(1), request.method)
        else {
            return Err(ToolFailure::new(RSCRIPT_TAG, "exploratory analysis needs a matrix, its type and metadata"));
        };
        let path = |p: &Path| self.launcher.container_path(p);
        let text = |v: &Option<String>| v.clone().unwrap_or_else(|| "NULL".to_string());

        Ok(self
            .launcher
            .bound_command(RSCRIPT_TAG, &request.output)
            .arg(self.script(&config.scripts.r_exploratory_script_path, "r_exploratory_script_path")?)
            .args(["--matrix_file".to_string(), path(matrix)])
            .args(["--metadata_file".to_string(), path(metadata)])
            .args(["--output_dir".to_string(), path(&request.output)])
            .args(["--grouping_variable".to_string(), text(&config.deseq2_experiment.grouping_variable)])
            .args(["--matrix_type", method.column()])
            .args(["--organism_db".to_string(), text(&annotation.organism_db)])
            .args(["--key_type".to_string(), text(&annotation.key_type)]))
    }

    fn enrichment_command(&self, request: &AggregationRequest) -> Result<ToolCommand, ToolFailure> {
        let config = &self.settings.config;
        let analysis = &config.functional_analysis;
        let thresholds = &config.tool_parameters.analysis_thresholds;
        let plots = &analysis.plot_parameters;
        let text = |v: &Option<String>| v.clone().unwrap_or_else(|| "NULL".to_string());

        let mut cmd = self
            .launcher
            .bound_command(RSCRIPT_TAG, &request.output)
            .arg(self.script(&config.scripts.r_enrichment_plotter_script_path, "r_enrichment_plotter_script_path")?)
            .args(["--kegg_species_code".to_string(), text(&analysis.pathview_kegg_code)])
            .args(["--key_type".to_string(), text(&config.annotation.key_type)])
            .args(["--organism_db".to_string(), text(&config.annotation.organism_db)])
            .args(["--log2fc".to_string(), thresholds.log2fc.to_string()])
            .args(["--padj".to_string(), thresholds.padj.to_string()]);
        if analysis.run_sea_analysis {
            cmd = cmd
                .arg("--run_sea_analysis")
                .args(["--sea_padj_cutoff".to_string(), analysis.sea_padj_cutoff.to_string()])
                .args(["--sea_qvalue_cutoff".to_string(), analysis.sea_qvalue_cutoff.to_string()])
                .arg("--sea_ontologies")
                .args(&analysis.sea_ontologies);
        }
        if analysis.run_gsea_analysis {
            cmd = cmd
                .arg("--run_gsea_analysis")
                .args(["--gsea_padj_cutoff".to_string(), analysis.gsea_padj_cutoff.to_string()]);
        }
        Ok(cmd
            .args(["--top_n_emap".to_string(), plots.top_n_emap.to_string()])
            .args(["--top_n_cnet".to_string(), plots.top_n_cnet.to_string()])
            .args(["--top_n_ridge".to_string(), plots.top_n_ridge.to_string()])
            .args(["--top_n_gseaplot".to_string(), plots.top_n_gseaplot.to_string()]))
    }

    fn pdf_command(&self, request: &AggregationRequest) -> Result<ToolCommand, ToolFailure> {
        let config = &self.settings.config;
        let organism = config
            .functional_analysis
            .gprofiler_organism_code
            .as_deref()
            .ok_or_else(|| ToolFailure::new(RSCRIPT_TAG, "no gprofiler_organism_code configured"))?;
        Ok(self
            .launcher
            .bound_command(RSCRIPT_TAG, &request.output)
            .arg(self.script(&config.scripts.r_pdf_report_script_path, "r_pdf_report_script_path")?)
            .args(["--input_dir", ".", "--organism", organism]))
    }

    pub fn generate_cli(&self, request: &AggregationRequest) -> Result<Vec<ToolCommand>, ToolFailure> {
        let params = &self.settings.config.tool_parameters;
        let bams: Vec<PathBuf> = request.alignments.iter().map(|(_, bam)| bam.clone()).collect();
        let cmds = match request.step {
            AggregationStep::Quantify => request
                .alignments
                .iter()
                .map(|(id, bam)| {
                    let sample_dir = request.output.join(id);
                    self.launcher.command(STRINGTIE_TAG).args(stringtie::arg_generator(
                        request.threads,
                        bam,
                        &request.annotation,
                        &sample_dir.join(GENE_ABUNDANCE_FILE),
                        &sample_dir.join(format!("{}.gtf", id)),
                    ))
                })
                .collect(),
            AggregationStep::Exploratory => vec![self.exploratory_command(request)?],
            AggregationStep::Count => vec![self.launcher.command(FEATURECOUNTS_TAG).args(featurecounts::arg_generator(
                request.threads,
                params.featurecounts.strand_specific,
                &request.annotation,
                &request.output,
                request.paired,
                &bams,
            ))],
            AggregationStep::DifferentialExpression => vec![self.deseq2_command(request)?],
            AggregationStep::EnrichmentPlots => vec![self.enrichment_command(request)?],
            AggregationStep::PdfReport => vec![self.pdf_command(request)?],
            AggregationStep::Report => vec![self
                .launcher
                .command(MULTIQC_TAG)
                .args(request.inputs.iter().map(|d| d.to_string_lossy().into_owned()))
                .args(["-o".to_string(), request.output.to_string_lossy().into_owned(), "--force".to_string()])],
        };
        Ok(cmds)
    }
}

#[async_trait]
impl AggregationExecutor for CommandAggregationExecutor {
    async fn execute(&self, request: &AggregationRequest) -> Result<(), ToolFailure> {
        let dirs: Vec<PathBuf> = match request.step {
            AggregationStep::Quantify => request.alignments.iter().map(|(id, _)| request.output.join(id)).collect(),
            AggregationStep::Count => request.output.parent().map(Path::to_path_buf).into_iter().collect(),
            _ => vec![request.output.clone()],
        };
        for dir in dirs {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| ToolFailure::new(request.step.to_string(), format!("Cannot create {}: {}", dir.display(), e)))?;
        }
        for cmd in self.generate_cli(request)? {
            let diagnostics = run_tool(&cmd, request.timeout).await?;
            if !diagnostics.trim().is_empty() {
                debug!("{} {} diagnostics:\n{}", request.aligner, cmd.tool, diagnostics.trim_end());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_assemble_matrix_sums_and_fills() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let header = "Gene ID\tGene Name\tReference\tStrand\tStart\tEnd\tCoverage\tFPKM\tTPM\n";
        let a = dir.path().join("a.tsv");
        fs::write(&a, format!("{}g1\tA\tchr1\t+\t1\t9\t1.0\t2.0\t10.5\ng1\tA\tchr1\t+\t20\t29\t1.0\t1.0\t4.5\n", header))?;
        let b = dir.path().join("b.tsv");
        fs::write(&b, format!("{}g2\tB\tchr2\t-\t1\t9\t1.0\t3.0\t7\n", header))?;
        let abundances = vec![
            ("S1".to_string(), a),
            ("S2".to_string(), b),
            ("S3".to_string(), dir.path().join("missing.tsv")),
        ];

        let dest = dir.path().join("STAR_tpm_matrix.tsv");
        let genes = assemble_matrix(&abundances, QuantMethod::Tpm, &dest)?;
        assert_eq!(genes, 2);
        assert_eq!(fs::read_to_string(&dest)?, "gene_id\tS1\tS2\ng1\t15\t0\ng2\t0\t7\n");
        Ok(())
    }

    #[test]
    fn test_assemble_matrix_without_tables_fails() {
        let dir = tempdir().unwrap();
        let abundances = vec![("S1".to_string(), dir.path().join("none.tsv"))];
        assert!(assemble_matrix(&abundances, QuantMethod::Fpkm, &dir.path().join("m.tsv")).is_err());
    }

    #[test]
    fn test_assemble_matrix_rejects_unparsable_value() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let table = dir.path().join("a.tsv");
        fs::write(&table, "Gene ID\tGene Name\tFPKM\tTPM\ng1\tA\t2.0\t1.5\ng2\tB\t1.0\tn/a\n")?;
        let abundances = vec![("S1".to_string(), table)];

        let result = assemble_matrix(&abundances, QuantMethod::Tpm, &dir.path().join("m.tsv"));
        assert!(matches!(result, Err(PipelineError::MalformedTable { .. })), "{:?}", result);
        Ok(())
    }

    #[test]
    fn test_corrected_metadata_only_touches_first_column() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let source = dir.path().join("metadata.csv");
        fs::write(&source, "sample-id,condition\nS-1,wild-type\nS-2,mutant\n")?;
        let dest = dir.path().join("metadata_corrected.csv");
        write_corrected_metadata(&source, &dest)?;
        assert_eq!(fs::read_to_string(&dest)?, "sample-id,condition\nS.1,wild-type\nS.2,mutant\n");
        Ok(())
    }

    #[test]
    fn test_corrected_metadata_respects_quoting() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let source = dir.path().join("metadata.csv");
        fs::write(&source, "sample,condition\n\"Ctl, rep-1\",control\n")?;
        let dest = dir.path().join("metadata_corrected.csv");
        write_corrected_metadata(&source, &dest)?;
        assert_eq!(fs::read_to_string(&dest)?, "sample,condition\n\"Ctl, rep.1\",control\n");
        Ok(())
    }

    fn executor_with(base: &Path, edit: impl FnOnce(&mut crate::config::settings::ProjectConfig)) -> anyhow::Result<CommandAggregationExecutor> {
        let script = base.join("analysis.R");
        fs::write(&script, "# R\n")?;
        let mut config = crate::config::settings::ProjectConfig::default();
        config.project_setup.base_dir = base.display().to_string();
        config.scripts.r_deseq2_script_path = Some(script.display().to_string());
        config.scripts.r_exploratory_script_path = Some(script.display().to_string());
        edit(&mut config);
        let settings = RunSettings::from_config(config, base)?;
        Ok(CommandAggregationExecutor::new(Arc::new(settings)))
    }

    fn request_for(step: AggregationStep, inputs: Vec<PathBuf>, output: PathBuf) -> AggregationRequest {
        AggregationRequest {
            step,
            aligner: AlignerKind::Hisat2,
            alignments: Vec::new(),
            paired: true,
            annotation: PathBuf::from("genes.gtf"),
            inputs,
            method: None,
            output,
            threads: 1,
            timeout: Duration::from_secs(60),
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter().position(|a| a == flag).and_then(|i| args.get(i + 1)).map(String::as_str)
    }

    #[test]
    fn test_deseq2_passes_counting_method() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let executor = executor_with(dir.path(), |c| c.project_setup.counting_method = "htseq-count".to_string())?;
        let request = request_for(
            AggregationStep::DifferentialExpression,
            vec![dir.path().join("counts.txt"), dir.path().join("metadata.csv")],
            dir.path().join("DESEQ2_RESULTS_HISAT2"),
        );
        let cmds = executor.generate_cli(&request)?;
        assert_eq!(cmds.len(), 1);
        assert_eq!(value_after(&cmds[0].args, "--counting_method"), Some("htseq-count"));

        let executor = executor_with(dir.path(), |_| {})?;
        let cmds = executor.generate_cli(&request)?;
        assert_eq!(value_after(&cmds[0].args, "--counting_method"), Some("featureCounts"));
        Ok(())
    }

    #[test]
    fn test_exploratory_command_arguments() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let executor = executor_with(dir.path(), |c| {
            c.deseq2_experiment.grouping_variable = Some("condition".to_string());
            c.annotation.organism_db = Some("org.Hs.eg.db".to_string());
        })?;
        let matrix = dir.path().join("COUNTS/HISAT2_fpkm_matrix.tsv");
        let metadata = dir.path().join("metadata.csv");
        let output = dir.path().join("EDA_RESULTS_HISAT2_FPKM");
        let mut request = request_for(AggregationStep::Exploratory, vec![matrix.clone(), metadata.clone()], output.clone());
        assert!(executor.generate_cli(&request).is_err());

        request.method = Some(QuantMethod::Fpkm);
        let cmds = executor.generate_cli(&request)?;
        let args = &cmds[0].args;
        assert_eq!(cmds[0].tool, RSCRIPT_TAG);
        assert_eq!(value_after(args, "--matrix_file"), Some(matrix.to_string_lossy().as_ref()));
        assert_eq!(value_after(args, "--metadata_file"), Some(metadata.to_string_lossy().as_ref()));
        assert_eq!(value_after(args, "--output_dir"), Some(output.to_string_lossy().as_ref()));
        assert_eq!(value_after(args, "--grouping_variable"), Some("condition"));
        assert_eq!(value_after(args, "--matrix_type"), Some("FPKM"));
        assert_eq!(value_after(args, "--organism_db"), Some("org.Hs.eg.db"));
        assert_eq!(value_after(args, "--key_type"), Some("NULL"));
        Ok(())
    }
}
