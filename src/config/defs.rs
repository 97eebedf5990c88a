use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use clap::ValueEnum;
use lazy_static::lazy_static;
use thiserror::Error;
use crate::config::settings::RunSettings;

// External software
pub const WGET_TAG: &str = "wget";
pub const STAR_TAG: &str = "STAR";
pub const HISAT2_TAG: &str = "hisat2";
pub const HISAT2_BUILD_TAG: &str = "hisat2-build";
pub const HISAT2_SPLICE_SITES_TAG: &str = "hisat2_extract_splice_sites.py";
pub const HISAT2_EXONS_TAG: &str = "hisat2_extract_exons.py";
pub const SAMTOOLS_TAG: &str = "samtools";
pub const FASTQC_TAG: &str = "fastqc";
pub const TRIMMOMATIC_TAG: &str = "trimmomatic";
pub const FEATURECOUNTS_TAG: &str = "featureCounts";
pub const STRINGTIE_TAG: &str = "stringtie";
pub const MULTIQC_TAG: &str = "multiqc";
pub const RSCRIPT_TAG: &str = "Rscript";
pub const GZIP_TAG: &str = "gzip";

pub const APPTAINER_TAG: &str = "apptainer";
pub const APPTAINER_ENV: &str = "APPTAINER_CMD";
pub const CONTAINER_WORKSPACE: &str = "/workspace";

lazy_static! {
    /// Flag that makes each launcher print its version and exit 0.
    pub static ref TOOL_VERSION_FLAGS: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert(APPTAINER_TAG, "--version");
        m.insert(WGET_TAG, "--version");
        m.insert(STAR_TAG, "--version");
        m.insert(HISAT2_TAG, "--version");
        m.insert(HISAT2_BUILD_TAG, "--version");
        m.insert(SAMTOOLS_TAG, "--version");
        m.insert(FASTQC_TAG, "--version");
        m.insert(TRIMMOMATIC_TAG, "-version");
        m.insert(FEATURECOUNTS_TAG, "-v");
        m.insert(STRINGTIE_TAG, "--version");
        m.insert(MULTIQC_TAG, "--version");
        m.insert(RSCRIPT_TAG, "--version");
        m
    };
}

// Directory layout under base_dir
pub const FASTQ_DIR: &str = "FASTQ_FILES";
pub const FASTQC_DIR: &str = "FASTQC";
pub const TRIMMED_DIR: &str = "TRIMMED_READS";
pub const REFERENCE_DIR: &str = "REFERENCE_GENOMES_FILES";
pub const ADAPTERS_DIR: &str = "adapters";
pub const COUNTS_DIR: &str = "COUNTS";
pub const STAR_INDEX_DIR: &str = "star_index";
pub const LOG_FILE: &str = "pipeline.log";

// Static filenames
pub const GZIP_EXT: &str = "gz";
pub const FASTQ_SUFFIX: &str = ".fastq";
pub const TRIMMED_SUFFIX: &str = ".trimmed.fastq.gz";
pub const UNPAIRED_SUFFIX: &str = ".unpaired.fastq.gz";
pub const FASTQC_REPORT_SUFFIX: &str = "_fastqc.html";
pub const FINAL_BAM_NAME: &str = "Aligned.sortedByCoord.out.bam";
pub const SAM_EXT: &str = "sam";
pub const HISAT2_SUMMARY_SUFFIX: &str = "_hisat2_summary.log";
pub const STAR_TMP_SUFFIX: &str = "STARtmp";
pub const STAR_SENTINEL: &str = "SA";
pub const HISAT2_INDEX_EXT: &str = ".ht2";
pub const HISAT2_MIN_INDEX_FILES: usize = 8;
pub const ADAPTERS_FILE: &str = "TruSeq_adapters.fa";
pub const GENE_ABUNDANCE_FILE: &str = "gene_abundances.tsv";
pub const CORRECTED_METADATA_FILE: &str = "metadata_corrected.csv";

pub const FASTA_EXTS: &[&'static str] = &["fa", "fna", "fasta"];
pub const GTF_EXT: &str = "gtf";

/// Configured external aligner. Order of declaration is the order used for "both".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AlignerKind {
    Star,
    Hisat2,
}

impl AlignerKind {
    /// Upper-case label used in directory names (ALIGNMENTS_STAR, COUNTS/counts_HISAT2.txt, ...).
    pub fn label(&self) -> &'static str {
        match self {
            AlignerKind::Star => "STAR",
            AlignerKind::Hisat2 => "HISAT2",
        }
    }
}

impl fmt::Display for AlignerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Download,
    Decompress,
    QualityReport,
    Trim,
    Align,
    Sort,
    ExtractSpliceSites,
    ExtractExons,
    BuildIndex,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageKind::Download => "download",
            StageKind::Decompress => "decompress",
            StageKind::QualityReport => "quality report",
            StageKind::Trim => "trim",
            StageKind::Align => "align",
            StageKind::Sort => "sort",
            StageKind::ExtractSpliceSites => "extract splice sites",
            StageKind::ExtractExons => "extract exons",
            StageKind::BuildIndex => "build index",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum RetentionMode {
    #[default]
    Debug,
    Intermediate,
    Maximal,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SequencingType {
    #[default]
    PairedEnd,
    SingleEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Mate {
    First,
    Second,
}

impl Mate {
    pub fn number(&self) -> u8 {
        match self {
            Mate::First => 1,
            Mate::Second => 2,
        }
    }
}

/// One logical unit of input data: a single-end file or a mate pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub id: String,
    pub primary_source: String,
    pub secondary_source: Option<String>,
}

impl Sample {
    pub fn single(id: impl Into<String>, source: impl Into<String>) -> Self {
        Self { id: id.into(), primary_source: source.into(), secondary_source: None }
    }

    pub fn paired(id: impl Into<String>, first: impl Into<String>, second: impl Into<String>) -> Self {
        Self { id: id.into(), primary_source: first.into(), secondary_source: Some(second.into()) }
    }

    pub fn is_paired(&self) -> bool {
        self.secondary_source.is_some()
    }

    /// Mates in order with their source locators.
    pub fn mates(&self) -> Vec<(Mate, &str)> {
        let mut mates = vec![(Mate::First, self.primary_source.as_str())];
        if let Some(second) = &self.secondary_source {
            mates.push((Mate::Second, second.as_str()));
        }
        mates
    }
}

/// Terminal outcome of one SamplePipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunResult {
    Skipped(String),
    Succeeded,
    Failed(String),
}

impl RunResult {
    pub fn is_failed(&self) -> bool {
        matches!(self, RunResult::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleOutcome {
    pub sample_id: String,
    pub result: RunResult,
}

/// Sample-independent resources produced by phase 1.
#[derive(Debug, Clone, Default)]
pub struct PreparedResources {
    pub fasta: PathBuf,
    pub gtf: PathBuf,
    pub adapters: Option<PathBuf>,
    /// STAR genome directory or HISAT2 index prefix.
    pub indices: BTreeMap<AlignerKind, PathBuf>,
}

/// Read-only state shared by every sample worker. Built once after phase 1.
#[derive(Debug)]
pub struct PipelineContext {
    pub settings: Arc<RunSettings>,
    pub resources: PreparedResources,
}

/// Diagnostic report from a collaborator that ran and failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolFailure {
    pub tool: String,
    pub exit_code: Option<i32>,
    pub stderr: String,
    pub timed_out: bool,
}

impl ToolFailure {
    pub fn new(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self { tool: tool.into(), exit_code: None, stderr: message.into(), timed_out: false }
    }
}

impl fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.timed_out {
            return write!(f, "{} timed out", self.tool);
        }
        match self.exit_code {
            Some(code) => write!(f, "{} exited with code {}", self.tool, code)?,
            None => write!(f, "{} failed", self.tool)?,
        }
        let last = self.stderr.trim().lines().last().unwrap_or("");
        if !last.is_empty() {
            write!(f, ": {}", last)?;
        }
        Ok(())
    }
}

impl std::error::Error for ToolFailure {}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Missing prerequisite for {stage}: {} not found", path.display())]
    MissingPrerequisite { stage: StageKind, path: PathBuf },

    #[error("{stage} failed: {failure}")]
    ExternalToolFailure { stage: StageKind, failure: ToolFailure },

    #[error("{step} failed: {failure}")]
    AggregationFailure { step: String, failure: ToolFailure },

    #[error("Malformed table {}: {reason}", path.display())]
    MalformedTable { path: PathBuf, reason: String },

    #[error("Setup failed: {0}")]
    FatalSetupFailure(String),

    #[error("Unexpected failure: {0}")]
    UnexpectedException(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
}
