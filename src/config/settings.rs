// src/config/settings.rs: JSON run configuration
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use crate::cli::Arguments;
use crate::config::defs::{AlignerKind, PipelineError, RetentionMode, SequencingType, APPTAINER_ENV, APPTAINER_TAG};
use crate::utils::layout::ArtifactLayout;

/// Raw configuration file, section for section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub project_setup: ProjectSetup,
    pub source_data: SourceData,
    pub container_images: ContainerImages,
    pub tool_parameters: ToolParameters,
    pub deseq2_experiment: Deseq2Experiment,
    pub annotation: Annotation,
    pub scripts: Scripts,
    pub functional_analysis: FunctionalAnalysis,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProjectSetup {
    pub base_dir: String,
    pub aligner: String,
    pub sequencing_type: String,
    pub host_bind_dir: Option<String>,
    /// Passed to the DESeq2 script as `--counting_method`.
    pub counting_method: String,
    pub quantification_options: QuantificationOptions,
}

impl Default for ProjectSetup {
    fn default() -> Self {
        Self {
            base_dir: ".".to_string(),
            aligner: "star".to_string(),
            sequencing_type: "paired-end".to_string(),
            host_bind_dir: None,
            counting_method: "featureCounts".to_string(),
            quantification_options: QuantificationOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QuantificationOptions {
    /// Lower-case aligner name -> matrices to assemble ("tpm", "fpkm").
    pub run_for: BTreeMap<String, Vec<String>>,
    pub run_exploratory_analysis: bool,
    /// Matrices handed to the exploratory analysis script.
    pub explore_on: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SourceData {
    pub genome_urls: Vec<String>,
    pub fastq_list_file: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContainerImages {
    pub star: Option<String>,
    pub hisat2: Option<String>,
    pub samtools: Option<String>,
    pub fastqc: Option<String>,
    pub trimmomatic: Option<String>,
    pub featurecounts: Option<String>,
    pub stringtie: Option<String>,
    pub multiqc: Option<String>,
    pub r_deseq2: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolParameters {
    pub threads: usize,
    pub download_threads: usize,
    pub threads_per_sample: usize,
    pub max_parallel_samples: usize,
    pub retain_only_fastqc_and_bam: bool,
    pub cleanup_only_fastq: bool,
    pub tool_timeout_minutes: u64,
    pub trimmomatic: TrimmomaticParams,
    pub star: StarParams,
    pub featurecounts: FeatureCountsParams,
    pub analysis_thresholds: AnalysisThresholds,
}

impl Default for ToolParameters {
    fn default() -> Self {
        Self {
            threads: 8,
            download_threads: 8,
            threads_per_sample: 2,
            max_parallel_samples: 4,
            retain_only_fastqc_and_bam: false,
            cleanup_only_fastq: false,
            tool_timeout_minutes: 720,
            trimmomatic: TrimmomaticParams::default(),
            star: StarParams::default(),
            featurecounts: FeatureCountsParams::default(),
            analysis_thresholds: AnalysisThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrimmomaticParams {
    pub adapter_fasta_url: Option<String>,
    pub sliding_window: String,
    pub min_len: u32,
    pub leading: u32,
    pub trailing: u32,
    pub extra_args: Option<String>,
}

impl Default for TrimmomaticParams {
    fn default() -> Self {
        Self {
            adapter_fasta_url: None,
            sliding_window: "4:15".to_string(),
            min_len: 36,
            leading: 3,
            trailing: 3,
            extra_args: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StarParams {
    #[serde(rename = "sjdbOverhang")]
    pub sjdb_overhang: u32,
}

impl Default for StarParams {
    fn default() -> Self {
        Self { sjdb_overhang: 99 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FeatureCountsParams {
    pub strand_specific: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisThresholds {
    pub padj: f64,
    pub log2fc: f64,
}

impl Default for AnalysisThresholds {
    fn default() -> Self {
        Self { padj: 0.05, log2fc: 1.0 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Deseq2Experiment {
    pub metadata_path: Option<String>,
    pub design_formula: Option<String>,
    pub control_group: Option<String>,
    pub grouping_variable: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Annotation {
    pub organism_db: Option<String>,
    pub key_type: Option<String>,
    pub strip_gene_version: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Scripts {
    pub r_deseq2_script_path: Option<String>,
    pub r_exploratory_script_path: Option<String>,
    pub r_enrichment_plotter_script_path: Option<String>,
    pub r_pdf_report_script_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FunctionalAnalysis {
    pub run_enrichment_plots: bool,
    pub run_final_pdf_reports: bool,
    pub gprofiler_organism_code: Option<String>,
    pub kegg_padj_threshold: f64,
    pub pathview_kegg_code: Option<String>,
    pub run_sea_analysis: bool,
    pub sea_padj_cutoff: f64,
    pub sea_qvalue_cutoff: f64,
    pub sea_ontologies: Vec<String>,
    pub run_gsea_analysis: bool,
    pub gsea_padj_cutoff: f64,
    pub plot_parameters: PlotParameters,
}

impl Default for FunctionalAnalysis {
    fn default() -> Self {
        Self {
            run_enrichment_plots: false,
            run_final_pdf_reports: false,
            gprofiler_organism_code: None,
            kegg_padj_threshold: 0.05,
            pathview_kegg_code: None,
            run_sea_analysis: false,
            sea_padj_cutoff: 0.05,
            sea_qvalue_cutoff: 0.1,
            sea_ontologies: vec!["BP".to_string(), "MF".to_string(), "CC".to_string()],
            run_gsea_analysis: false,
            gsea_padj_cutoff: 0.05,
            plot_parameters: PlotParameters::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlotParameters {
    pub top_n_emap: u32,
    pub top_n_cnet: u32,
    pub top_n_ridge: u32,
    pub top_n_gseaplot: u32,
}

impl Default for PlotParameters {
    fn default() -> Self {
        Self { top_n_emap: 15, top_n_cnet: 10, top_n_ridge: 15, top_n_gseaplot: 5 }
    }
}

/// Normalized expression matrices assembled from StringTie abundances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QuantMethod {
    Tpm,
    Fpkm,
}

impl QuantMethod {
    pub fn column(&self) -> &'static str {
        match self {
            QuantMethod::Tpm => "TPM",
            QuantMethod::Fpkm => "FPKM",
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            QuantMethod::Tpm => "tpm",
            QuantMethod::Fpkm => "fpkm",
        }
    }
}

/// Validated, typed view of a ProjectConfig.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub layout: ArtifactLayout,
    pub aligners: Vec<AlignerKind>,
    pub sequencing: SequencingType,
    pub threads: usize,
    pub download_threads: usize,
    pub threads_per_sample: usize,
    pub max_parallel_samples: usize,
    pub retention: RetentionMode,
    pub tool_timeout: Duration,
    pub genome_urls: Vec<String>,
    pub adapter_url: Option<String>,
    pub fastq_list_file: Option<PathBuf>,
    pub container_cmd: String,
    pub host_bind_dir: Option<PathBuf>,
    pub quantification: BTreeMap<AlignerKind, Vec<QuantMethod>>,
    /// Matrices explored after quantification; empty when exploration is off.
    pub exploration: Vec<QuantMethod>,
    pub config: ProjectConfig,
}

/// Reads and parses the JSON configuration file.
///
/// # Arguments
///
/// * `path` - Path to the JSON file.
///
/// # Returns
/// ProjectConfig with defaults filled in for absent keys.
pub fn load_config(path: &Path) -> Result<ProjectConfig, PipelineError> {
    let text = fs::read_to_string(path)
        .map_err(|e| PipelineError::InvalidConfig(format!("Cannot read {}: {}", path.display(), e)))?;
    serde_json::from_str(&text)
        .map_err(|e| PipelineError::InvalidConfig(format!("Cannot parse {}: {}", path.display(), e)))
}

pub fn parse_aligners(choice: &str) -> Result<Vec<AlignerKind>, PipelineError> {
    match choice.trim().to_lowercase().as_str() {
        "star" => Ok(vec![AlignerKind::Star]),
        "hisat2" => Ok(vec![AlignerKind::Hisat2]),
        "both" => Ok(vec![AlignerKind::Star, AlignerKind::Hisat2]),
        "none" => Ok(Vec::new()),
        other => Err(PipelineError::InvalidConfig(format!("Unknown aligner choice: {}", other))),
    }
}

fn parse_sequencing(value: &str) -> Result<SequencingType, PipelineError> {
    match value.trim().to_lowercase().as_str() {
        "paired-end" | "paired" => Ok(SequencingType::PairedEnd),
        "single-end" | "single" => Ok(SequencingType::SingleEnd),
        other => Err(PipelineError::InvalidConfig(format!("Unknown sequencing_type: {}", other))),
    }
}

fn parse_methods(methods: &[String]) -> Result<Vec<QuantMethod>, PipelineError> {
    methods
        .iter()
        .map(|method| match method.trim().to_lowercase().as_str() {
            "tpm" => Ok(QuantMethod::Tpm),
            "fpkm" => Ok(QuantMethod::Fpkm),
            other => Err(PipelineError::InvalidConfig(format!("Unknown quantification method: {}", other))),
        })
        .collect()
}

fn parse_quantification(options: &QuantificationOptions) -> Result<BTreeMap<AlignerKind, Vec<QuantMethod>>, PipelineError> {
    let mut quantification = BTreeMap::new();
    for (aligner, methods) in &options.run_for {
        let kinds = parse_aligners(aligner)?;
        let parsed = parse_methods(methods)?;
        for kind in kinds {
            quantification.insert(kind, parsed.clone());
        }
    }
    Ok(quantification)
}

impl RunSettings {
    /// Validates a ProjectConfig into RunSettings.
    ///
    /// # Arguments
    ///
    /// * `config` - Parsed configuration.
    /// * `config_dir` - Directory of the config file; relative list files resolve against it.
    ///
    /// # Returns
    /// RunSettings or InvalidConfig.
    pub fn from_config(config: ProjectConfig, config_dir: &Path) -> Result<Self, PipelineError> {
        let setup = &config.project_setup;
        let params = &config.tool_parameters;

        for (name, value) in [
            ("threads", params.threads),
            ("download_threads", params.download_threads),
            ("threads_per_sample", params.threads_per_sample),
            ("max_parallel_samples", params.max_parallel_samples),
        ] {
            if value == 0 {
                return Err(PipelineError::InvalidConfig(format!("{} must be at least 1", name)));
            }
        }
        if params.tool_timeout_minutes == 0 {
            return Err(PipelineError::InvalidConfig("tool_timeout_minutes must be at least 1".to_string()));
        }

        let retention = if params.retain_only_fastqc_and_bam {
            RetentionMode::Maximal
        } else if params.cleanup_only_fastq {
            RetentionMode::Intermediate
        } else {
            RetentionMode::Debug
        };

        let fastq_list_file = config.source_data.fastq_list_file.as_ref().map(|file| {
            let path = PathBuf::from(file);
            if path.is_absolute() { path } else { config_dir.join(path) }
        });

        Ok(Self {
            layout: ArtifactLayout::new(PathBuf::from(&setup.base_dir)),
            aligners: parse_aligners(&setup.aligner)?,
            sequencing: parse_sequencing(&setup.sequencing_type)?,
            threads: params.threads,
            download_threads: params.download_threads,
            threads_per_sample: params.threads_per_sample,
            max_parallel_samples: params.max_parallel_samples,
            retention,
            tool_timeout: Duration::from_secs(params.tool_timeout_minutes * 60),
            genome_urls: config.source_data.genome_urls.clone(),
            adapter_url: params.trimmomatic.adapter_fasta_url.clone(),
            fastq_list_file,
            container_cmd: std::env::var(APPTAINER_ENV).unwrap_or_else(|_| APPTAINER_TAG.to_string()),
            host_bind_dir: setup.host_bind_dir.as_ref().map(PathBuf::from),
            quantification: parse_quantification(&setup.quantification_options)?,
            exploration: if setup.quantification_options.run_exploratory_analysis {
                parse_methods(&setup.quantification_options.explore_on)?
            } else {
                Vec::new()
            },
            config,
        })
    }

    /// Applies command-line overrides on top of the file values.
    pub fn with_overrides(mut self, args: &Arguments) -> Result<Self, PipelineError> {
        if let Some(max_parallel) = args.max_parallel_samples {
            if max_parallel == 0 {
                return Err(PipelineError::InvalidConfig("--max-parallel-samples must be at least 1".to_string()));
            }
            self.max_parallel_samples = max_parallel;
        }
        if let Some(threads) = args.threads_per_sample {
            if threads == 0 {
                return Err(PipelineError::InvalidConfig("--threads-per-sample must be at least 1".to_string()));
            }
            self.threads_per_sample = threads;
        }
        if let Some(retention) = args.retention {
            self.retention = retention;
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() -> anyhow::Result<()> {
        let config: ProjectConfig = serde_json::from_str("{}")?;
        let settings = RunSettings::from_config(config, Path::new("/configs"))?;
        assert_eq!(settings.aligners, vec![AlignerKind::Star]);
        assert_eq!(settings.sequencing, SequencingType::PairedEnd);
        assert_eq!(settings.threads_per_sample, 2);
        assert_eq!(settings.max_parallel_samples, 4);
        assert_eq!(settings.retention, RetentionMode::Debug);
        assert_eq!(settings.tool_timeout, Duration::from_secs(720 * 60));
        assert_eq!(settings.config.project_setup.counting_method, "featureCounts");
        assert!(settings.exploration.is_empty());
        Ok(())
    }

    #[test]
    fn test_retention_flags() -> anyhow::Result<()> {
        let config: ProjectConfig = serde_json::from_str(
            r#"{"tool_parameters": {"cleanup_only_fastq": true, "retain_only_fastqc_and_bam": true}}"#,
        )?;
        let settings = RunSettings::from_config(config, Path::new("."))?;
        assert_eq!(settings.retention, RetentionMode::Maximal);

        let config: ProjectConfig = serde_json::from_str(r#"{"tool_parameters": {"cleanup_only_fastq": true}}"#)?;
        let settings = RunSettings::from_config(config, Path::new("."))?;
        assert_eq!(settings.retention, RetentionMode::Intermediate);
        Ok(())
    }

    #[test]
    fn test_both_aligners_and_relative_list() -> anyhow::Result<()> {
        let config: ProjectConfig = serde_json::from_str(
            r#"{
                "project_setup": {"aligner": "both", "quantification_options": {"run_for": {"hisat2": ["tpm", "FPKM"]}}},
                "source_data": {"fastq_list_file": "samples.txt"},
                "tool_parameters": {"star": {"sjdbOverhang": 149}}
            }"#,
        )?;
        let settings = RunSettings::from_config(config, Path::new("/configs"))?;
        assert_eq!(settings.aligners, vec![AlignerKind::Star, AlignerKind::Hisat2]);
        assert_eq!(settings.fastq_list_file, Some(PathBuf::from("/configs/samples.txt")));
        assert_eq!(settings.quantification.get(&AlignerKind::Hisat2), Some(&vec![QuantMethod::Tpm, QuantMethod::Fpkm]));
        assert_eq!(settings.config.tool_parameters.star.sjdb_overhang, 149);
        Ok(())
    }

    #[test]
    fn test_exploration_follows_flag() -> anyhow::Result<()> {
        let config: ProjectConfig = serde_json::from_str(
            r#"{"project_setup": {"counting_method": "htseq", "quantification_options": {"explore_on": ["fpkm", "TPM"]}}}"#,
        )?;
        let settings = RunSettings::from_config(config.clone(), Path::new("."))?;
        assert!(settings.exploration.is_empty());
        assert_eq!(settings.config.project_setup.counting_method, "htseq");

        let mut config = config;
        config.project_setup.quantification_options.run_exploratory_analysis = true;
        let settings = RunSettings::from_config(config.clone(), Path::new("."))?;
        assert_eq!(settings.exploration, vec![QuantMethod::Fpkm, QuantMethod::Tpm]);

        config.project_setup.quantification_options.explore_on = vec!["rpkm".to_string()];
        assert!(matches!(RunSettings::from_config(config, Path::new(".")), Err(PipelineError::InvalidConfig(_))));
        Ok(())
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config: ProjectConfig = serde_json::from_str(r#"{"project_setup": {"aligner": "bowtie"}}"#).unwrap();
        assert!(matches!(RunSettings::from_config(config, Path::new(".")), Err(PipelineError::InvalidConfig(_))));

        let config: ProjectConfig = serde_json::from_str(r#"{"tool_parameters": {"max_parallel_samples": 0}}"#).unwrap();
        assert!(matches!(RunSettings::from_config(config, Path::new(".")), Err(PipelineError::InvalidConfig(_))));
    }
}
