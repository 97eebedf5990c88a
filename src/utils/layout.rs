// src/utils/layout.rs: Deterministic artifact locations
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use crate::config::defs::{
    AlignerKind, Mate, Sample, ADAPTERS_DIR, ADAPTERS_FILE, CORRECTED_METADATA_FILE, COUNTS_DIR, FASTQC_DIR, FASTQC_REPORT_SUFFIX,
    FASTQ_DIR, FASTQ_SUFFIX, FINAL_BAM_NAME, GENE_ABUNDANCE_FILE, GZIP_EXT, HISAT2_SUMMARY_SUFFIX, REFERENCE_DIR,
    SAM_EXT, STAR_INDEX_DIR, STAR_TMP_SUFFIX, TRIMMED_DIR, TRIMMED_SUFFIX, UNPAIRED_SUFFIX,
};

/// Maps (sample, stage, aligner) to the well-known paths that act as checkpoints.
/// Every path is namespaced by sample id, so concurrent samples never share an output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    base_dir: PathBuf,
}

impl ArtifactLayout {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn fastq_dir(&self) -> PathBuf {
        self.base_dir.join(FASTQ_DIR)
    }

    pub fn fastqc_dir(&self) -> PathBuf {
        self.base_dir.join(FASTQC_DIR)
    }

    pub fn trimmed_dir(&self) -> PathBuf {
        self.base_dir.join(TRIMMED_DIR)
    }

    pub fn reference_dir(&self) -> PathBuf {
        self.base_dir.join(REFERENCE_DIR)
    }

    pub fn star_index_dir(&self) -> PathBuf {
        self.reference_dir().join(STAR_INDEX_DIR)
    }

    pub fn adapters_file(&self) -> PathBuf {
        self.base_dir.join(ADAPTERS_DIR).join(ADAPTERS_FILE)
    }

    pub fn counts_dir(&self) -> PathBuf {
        self.base_dir.join(COUNTS_DIR)
    }

    pub fn alignments_dir(&self, aligner: AlignerKind) -> PathBuf {
        self.base_dir.join(format!("ALIGNMENTS_{}", aligner.label()))
    }

    pub fn stringtie_dir(&self, aligner: AlignerKind) -> PathBuf {
        self.base_dir.join(format!("STRINGTIE_{}", aligner.label()))
    }

    pub fn deseq2_dir(&self, aligner: AlignerKind) -> PathBuf {
        self.base_dir.join(format!("DESEQ2_RESULTS_{}", aligner.label()))
    }

    pub fn multiqc_dir(&self, aligner: AlignerKind) -> PathBuf {
        self.base_dir.join(format!("MULTIQC_{}_REPORT", aligner.label()))
    }

    pub fn counts_file(&self, aligner: AlignerKind) -> PathBuf {
        self.counts_dir().join(format!("counts_{}.txt", aligner.label()))
    }

    pub fn abundance_file(&self, sample_id: &str, aligner: AlignerKind) -> PathBuf {
        self.stringtie_dir(aligner).join(sample_id).join(GENE_ABUNDANCE_FILE)
    }

    /// `COUNTS/{ALIGNER}_{tag}_matrix.tsv`
    pub fn quant_matrix(&self, aligner: AlignerKind, tag: &str) -> PathBuf {
        self.counts_dir().join(format!("{}_{}_matrix.tsv", aligner.label(), tag))
    }

    /// `EDA_RESULTS_{ALIGNER}_{TPM|FPKM}`
    pub fn eda_dir(&self, aligner: AlignerKind, column: &str) -> PathBuf {
        self.base_dir.join(format!("EDA_RESULTS_{}_{}", aligner.label(), column.to_uppercase()))
    }

    pub fn corrected_metadata(&self, aligner: AlignerKind) -> PathBuf {
        self.deseq2_dir(aligner).join(CORRECTED_METADATA_FILE)
    }

    /// `{id}_1` / `{id}_2` for paired samples, `{id}` for single-end ones.
    fn mate_stem(sample: &Sample, mate: Mate) -> String {
        if sample.is_paired() {
            format!("{}_{}", sample.id, mate.number())
        } else {
            sample.id.clone()
        }
    }

    pub fn raw_compressed(&self, sample: &Sample, mate: Mate) -> PathBuf {
        self.fastq_dir()
            .join(format!("{}{}.{}", Self::mate_stem(sample, mate), FASTQ_SUFFIX, GZIP_EXT))
    }

    pub fn raw(&self, sample: &Sample, mate: Mate) -> PathBuf {
        self.fastq_dir()
            .join(format!("{}{}", Self::mate_stem(sample, mate), FASTQ_SUFFIX))
    }

    pub fn raw_reads(&self, sample: &Sample) -> Vec<PathBuf> {
        sample.mates().iter().map(|(mate, _)| self.raw(sample, *mate)).collect()
    }

    pub fn qc_report(&self, sample: &Sample, mate: Mate) -> PathBuf {
        self.fastqc_dir()
            .join(format!("{}{}", Self::mate_stem(sample, mate), FASTQC_REPORT_SUFFIX))
    }

    pub fn qc_reports(&self, sample: &Sample) -> Vec<PathBuf> {
        sample.mates().iter().map(|(mate, _)| self.qc_report(sample, *mate)).collect()
    }

    pub fn trimmed(&self, sample: &Sample, mate: Mate) -> PathBuf {
        self.trimmed_dir()
            .join(format!("{}{}", Self::mate_stem(sample, mate), TRIMMED_SUFFIX))
    }

    pub fn trimmed_reads(&self, sample: &Sample) -> Vec<PathBuf> {
        sample.mates().iter().map(|(mate, _)| self.trimmed(sample, *mate)).collect()
    }

    /// Orphaned-mate outputs of paired trimming. Empty for single-end samples.
    pub fn unpaired_reads(&self, sample: &Sample) -> Vec<PathBuf> {
        if !sample.is_paired() {
            return Vec::new();
        }
        sample
            .mates()
            .iter()
            .map(|(mate, _)| {
                self.trimmed_dir()
                    .join(format!("{}{}", Self::mate_stem(sample, *mate), UNPAIRED_SUFFIX))
            })
            .collect()
    }

    pub fn final_alignment(&self, sample: &Sample, aligner: AlignerKind) -> PathBuf {
        self.alignments_dir(aligner)
            .join(format!("{}_{}", sample.id, FINAL_BAM_NAME))
    }

    pub fn final_alignments(&self, sample: &Sample, aligners: &[AlignerKind]) -> Vec<PathBuf> {
        aligners.iter().map(|aligner| self.final_alignment(sample, *aligner)).collect()
    }

    /// Unsorted SAM written by HISAT2 before samtools sort.
    pub fn intermediate_alignment(&self, sample: &Sample) -> PathBuf {
        self.alignments_dir(AlignerKind::Hisat2)
            .join(format!("{}.{}", sample.id, SAM_EXT))
    }

    pub fn alignment_summary(&self, sample: &Sample) -> PathBuf {
        self.alignments_dir(AlignerKind::Hisat2)
            .join(format!("{}{}", sample.id, HISAT2_SUMMARY_SUFFIX))
    }

    /// Aligner working directories left behind by an interrupted or finished run.
    pub fn scratch_dirs(&self, sample: &Sample, aligner: AlignerKind) -> Vec<PathBuf> {
        match aligner {
            AlignerKind::Star => {
                let dir = self.alignments_dir(aligner);
                vec![
                    dir.join(format!("{}_{}", sample.id, STAR_TMP_SUFFIX)),
                    dir.join(format!("{}__{}", sample.id, STAR_TMP_SUFFIX)),
                ]
            }
            AlignerKind::Hisat2 => Vec::new(),
        }
    }

    /// Creates every stage directory the configured aligners need.
    pub fn create_dirs(&self, aligners: &[AlignerKind]) -> io::Result<()> {
        let mut dirs = vec![
            self.base_dir.clone(),
            self.fastq_dir(),
            self.fastqc_dir(),
            self.trimmed_dir(),
            self.reference_dir(),
            self.counts_dir(),
        ];
        dirs.extend(aligners.iter().map(|aligner| self.alignments_dir(*aligner)));
        for dir in dirs {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// STAR takes an output prefix rather than a file name; recover it from the final BAM path.
pub fn star_prefix(final_bam: &Path) -> PathBuf {
    let name = final_bam
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let prefix = name.strip_suffix(FINAL_BAM_NAME).unwrap_or(&name).to_string();
    final_bam.with_file_name(prefix)
}
