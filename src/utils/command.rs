/// Functions and structs for launching external tools and building their command lines

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use log::debug;
use tokio::process::Command;
use crate::config::defs::{
    AlignerKind, PipelineError, StageKind, ToolFailure, APPTAINER_TAG, CONTAINER_WORKSPACE, FASTQC_TAG,
    FEATURECOUNTS_TAG, HISAT2_BUILD_TAG, HISAT2_EXONS_TAG, HISAT2_SPLICE_SITES_TAG, HISAT2_TAG, MULTIQC_TAG,
    RSCRIPT_TAG, SAMTOOLS_TAG, STAR_TAG, STRINGTIE_TAG, TOOL_VERSION_FLAGS, TRIMMOMATIC_TAG, WGET_TAG,
};
use crate::config::settings::{ContainerImages, RunSettings};
use crate::utils::fetch::{Decompressor, Fetcher};

/// One unit of external work, fully described by paths.
///
/// Per kind:
/// * Download: `locator` -> `outputs[0]`
/// * Decompress: `inputs[0]` -> `outputs[0]`
/// * QualityReport: raw reads -> one report per mate
/// * Trim: raw reads -> trimmed reads, then unpaired reads when paired; `reference` holds adapters
/// * Align: trimmed reads -> final BAM (STAR) or SAM + summary log (HISAT2); `reference` holds the index
/// * Sort: SAM -> final BAM
/// * ExtractSpliceSites / ExtractExons: GTF -> table
/// * BuildIndex: FASTA + GTF (STAR) or FASTA + splice sites + exons (HISAT2) -> index dir or prefix
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub kind: StageKind,
    /// Sample id, or "reference" for phase-1 work.
    pub label: String,
    pub aligner: Option<AlignerKind>,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub reference: Option<PathBuf>,
    pub locator: Option<String>,
    pub threads: usize,
    pub timeout: Duration,
}

impl StageRequest {
    pub fn new(kind: StageKind, label: impl Into<String>, threads: usize, timeout: Duration) -> Self {
        Self {
            kind,
            label: label.into(),
            aligner: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            reference: None,
            locator: None,
            threads,
            timeout,
        }
    }

    pub fn aligner(mut self, aligner: AlignerKind) -> Self {
        self.aligner = Some(aligner);
        self
    }

    pub fn inputs(mut self, inputs: Vec<PathBuf>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn outputs(mut self, outputs: Vec<PathBuf>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn reference(mut self, reference: Option<PathBuf>) -> Self {
        self.reference = reference;
        self
    }

    pub fn locator(mut self, locator: impl Into<String>) -> Self {
        self.locator = Some(locator.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    pub artifacts: Vec<PathBuf>,
    /// Captured stderr, logged at debug level.
    pub diagnostics: String,
}

#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(&self, request: &StageRequest) -> Result<StageOutput, ToolFailure>;
}

/// A resolved process invocation.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    pub tool: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Files receiving captured stdout / stderr after a successful run.
    pub stdout_to: Option<PathBuf>,
    pub stderr_to: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(tool: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            stdout_to: None,
            stderr_to: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args.extend(args.into_iter().map(|a| a.as_ref().to_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdout_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_to = Some(path.into());
        self
    }

    pub fn stderr_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stderr_to = Some(path.into());
        self
    }

    pub fn display(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }
}

/// Runs a command to completion under a deadline. The child is killed when the
/// deadline passes.
///
/// # Arguments
///
/// * `cmd` - Resolved invocation.
/// * `timeout` - Wall-clock limit.
///
/// # Returns
/// Captured stderr on success, ToolFailure otherwise.
pub async fn run_tool(cmd: &ToolCommand, timeout: Duration) -> Result<String, ToolFailure> {
    debug!("Running: {}", cmd.display());
    let mut command = Command::new(&cmd.program);
    command
        .args(&cmd.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &cmd.cwd {
        command.current_dir(dir);
    }

    let child = command
        .spawn()
        .map_err(|e| ToolFailure::new(&cmd.tool, format!("Failed to spawn {}: {}. Is it installed?", cmd.program, e)))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| ToolFailure::new(&cmd.tool, format!("Failed to wait on {}: {}", cmd.tool, e)))?,
        Err(_) => {
            return Err(ToolFailure {
                tool: cmd.tool.clone(),
                exit_code: None,
                stderr: format!("killed after {} s", timeout.as_secs()),
                timed_out: true,
            });
        }
    };

    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !output.status.success() {
        return Err(ToolFailure { tool: cmd.tool.clone(), exit_code: output.status.code(), stderr, timed_out: false });
    }

    if let Some(path) = &cmd.stdout_to {
        tokio::fs::write(path, &output.stdout)
            .await
            .map_err(|e| ToolFailure::new(&cmd.tool, format!("Cannot write {}: {}", path.display(), e)))?;
    }
    if let Some(path) = &cmd.stderr_to {
        tokio::fs::write(path, &output.stderr)
            .await
            .map_err(|e| ToolFailure::new(&cmd.tool, format!("Cannot write {}: {}", path.display(), e)))?;
    }
    Ok(stderr)
}

/// Decides how a tool is launched: through the container runtime when an image
/// is configured for it, otherwise straight from PATH.
#[derive(Debug, Clone)]
pub struct ToolLauncher {
    container_cmd: String,
    images: ContainerImages,
    host_bind_dir: Option<PathBuf>,
}

impl ToolLauncher {
    pub fn new(settings: &RunSettings) -> Self {
        Self {
            container_cmd: settings.container_cmd.clone(),
            images: settings.config.container_images.clone(),
            host_bind_dir: settings.host_bind_dir.clone(),
        }
    }

    pub fn image_for(&self, tool: &str) -> Option<&str> {
        let images = &self.images;
        let image = match tool {
            STAR_TAG => &images.star,
            HISAT2_TAG | HISAT2_BUILD_TAG | HISAT2_SPLICE_SITES_TAG | HISAT2_EXONS_TAG => &images.hisat2,
            // STAR images ship samtools
            SAMTOOLS_TAG => {
                if images.samtools.is_some() { &images.samtools } else { &images.star }
            }
            FASTQC_TAG => &images.fastqc,
            TRIMMOMATIC_TAG => &images.trimmomatic,
            FEATURECOUNTS_TAG => &images.featurecounts,
            STRINGTIE_TAG => &images.stringtie,
            MULTIQC_TAG => &images.multiqc,
            RSCRIPT_TAG => &images.r_deseq2,
            _ => return None,
        };
        image.as_deref()
    }

    pub fn command(&self, tool: &str) -> ToolCommand {
        match self.image_for(tool) {
            Some(image) => ToolCommand::new(tool, &self.container_cmd).args(["exec", image, tool]),
            None => ToolCommand::new(tool, tool),
        }
    }

    /// Command with the host bind directory mounted at the container workspace and
    /// `pwd` as working directory. Without an image the tool runs on the host in `pwd`.
    pub fn bound_command(&self, tool: &str, pwd: &Path) -> ToolCommand {
        match (self.image_for(tool), &self.host_bind_dir) {
            (Some(image), Some(bind)) => ToolCommand::new(tool, &self.container_cmd).args([
                "exec".to_string(),
                "--bind".to_string(),
                format!("{}:{}", bind.display(), CONTAINER_WORKSPACE),
                "--pwd".to_string(),
                self.container_path(pwd),
                image.to_string(),
                tool.to_string(),
            ]),
            _ => self.command(tool).current_dir(pwd),
        }
    }

    /// Host path as seen inside a bound container. Unchanged when nothing is bound
    /// or the path lies outside the bind directory.
    pub fn container_path(&self, path: &Path) -> String {
        if let Some(bind) = &self.host_bind_dir {
            if self.image_for(RSCRIPT_TAG).is_some() {
                if let Ok(relative) = path.strip_prefix(bind) {
                    return Path::new(CONTAINER_WORKSPACE).join(relative).to_string_lossy().into_owned();
                }
            }
        }
        path.to_string_lossy().into_owned()
    }

    /// Launchers the run will need, deduplicated: the container runtime once if any
    /// tool is containerized, plus every tool run from PATH.
    pub fn required_launchers(&self, tools: &[&'static str]) -> Vec<&'static str> {
        let mut launchers: Vec<&'static str> = Vec::new();
        for tool in tools {
            let launcher = if self.image_for(tool).is_some() { APPTAINER_TAG } else { *tool };
            if !launchers.contains(&launcher) {
                launchers.push(launcher);
            }
        }
        launchers
    }

    pub fn container_cmd(&self) -> &str {
        &self.container_cmd
    }
}

/// Probes one launcher by running its version flag.
///
/// # Returns
/// First line of the version output.
pub async fn check_version(launcher: &ToolLauncher, tool: &str) -> Result<String, PipelineError> {
    let flag = TOOL_VERSION_FLAGS.get(tool).copied().unwrap_or("--version");
    let program = if tool == APPTAINER_TAG { launcher.container_cmd() } else { tool };
    let cmd = ToolCommand::new(tool, program).arg(flag);

    let child = Command::new(&cmd.program)
        .args(&cmd.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| PipelineError::InvalidConfig(format!("Failed to spawn {}: {}. Is {} installed?", program, e, tool)))?;

    let output = tokio::time::timeout(Duration::from_secs(60), child.wait_with_output())
        .await
        .map_err(|_| PipelineError::InvalidConfig(format!("{} {} did not return", program, flag)))??;

    let text = if output.stdout.is_empty() { output.stderr } else { output.stdout };
    let version = String::from_utf8_lossy(&text)
        .lines()
        .find(|line| !line.trim().is_empty())
        .map(|line| line.trim().to_string())
        .ok_or_else(|| PipelineError::InvalidConfig(format!("No output from {} {}", program, flag)))?;
    Ok(version)
}

/// Tools the configured run will launch. The HISAT2 extraction helpers ship with
/// hisat2 and have no version flag, so they are covered by the hisat2 probe.
pub fn required_tools(settings: &RunSettings) -> Vec<&'static str> {
    let config = &settings.config;
    let mut tools = vec![WGET_TAG, FASTQC_TAG, TRIMMOMATIC_TAG];
    for aligner in &settings.aligners {
        match aligner {
            AlignerKind::Star => tools.push(STAR_TAG),
            AlignerKind::Hisat2 => tools.extend([HISAT2_TAG, HISAT2_BUILD_TAG, SAMTOOLS_TAG]),
        }
    }
    if !settings.aligners.is_empty() {
        tools.push(FEATURECOUNTS_TAG);
        if settings.quantification.values().any(|methods| !methods.is_empty()) {
            tools.push(STRINGTIE_TAG);
        }
        let explores = !settings.exploration.is_empty() && config.scripts.r_exploratory_script_path.is_some();
        if config.scripts.r_deseq2_script_path.is_some() || explores {
            tools.push(RSCRIPT_TAG);
        }
        if config.container_images.multiqc.is_some() {
            tools.push(MULTIQC_TAG);
        }
    }
    tools
}

/// Probes every launcher the run needs before any work starts.
///
/// # Returns
/// (launcher, version line) pairs, or InvalidConfig naming the first absent one.
pub async fn check_tools(settings: &RunSettings) -> Result<Vec<(&'static str, String)>, PipelineError> {
    let launcher = ToolLauncher::new(settings);
    let mut versions = Vec::new();
    for tool in launcher.required_launchers(&required_tools(settings)) {
        let version = check_version(&launcher, tool).await?;
        debug!("{}: {}", tool, version);
        versions.push((tool, version));
    }
    Ok(versions)
}

mod star {
    use std::path::{Path, PathBuf};
    use crate::config::settings::StarParams;
    use crate::utils::layout::star_prefix;

    pub fn index_arg_generator(threads: usize, index_dir: &Path, fasta: &Path, gtf: &Path, params: &StarParams) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push("--runMode".to_string());
        args_vec.push("genomeGenerate".to_string());
        args_vec.push("--runThreadN".to_string());
        args_vec.push(threads.to_string());
        args_vec.push("--genomeDir".to_string());
        args_vec.push(index_dir.to_string_lossy().to_string());
        args_vec.push("--genomeFastaFiles".to_string());
        args_vec.push(fasta.to_string_lossy().to_string());
        args_vec.push("--sjdbGTFfile".to_string());
        args_vec.push(gtf.to_string_lossy().to_string());
        args_vec.push("--sjdbOverhang".to_string());
        args_vec.push(params.sjdb_overhang.to_string());
        args_vec
    }

    pub fn arg_generator(threads: usize, index_dir: &Path, reads: &[PathBuf], final_bam: &Path) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push("--runThreadN".to_string());
        args_vec.push(threads.to_string());
        args_vec.push("--genomeDir".to_string());
        args_vec.push(index_dir.to_string_lossy().to_string());
        args_vec.push("--readFilesIn".to_string());
        for read in reads {
            args_vec.push(read.to_string_lossy().to_string());
        }
        args_vec.push("--readFilesCommand".to_string());
        args_vec.push("zcat".to_string());
        args_vec.push("--outFileNamePrefix".to_string());
        args_vec.push(star_prefix(final_bam).to_string_lossy().to_string());
        args_vec.push("--outSAMtype".to_string());
        args_vec.push("BAM".to_string());
        args_vec.push("SortedByCoordinate".to_string());
        args_vec
    }
}

mod hisat2 {
    use std::path::{Path, PathBuf};

    pub fn index_arg_generator(threads: usize, fasta: &Path, splice_sites: &Path, exons: &Path, prefix: &Path) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push("-p".to_string());
        args_vec.push(threads.to_string());
        args_vec.push("--ss".to_string());
        args_vec.push(splice_sites.to_string_lossy().to_string());
        args_vec.push("--exon".to_string());
        args_vec.push(exons.to_string_lossy().to_string());
        args_vec.push(fasta.to_string_lossy().to_string());
        args_vec.push(prefix.to_string_lossy().to_string());
        args_vec
    }

    pub fn arg_generator(threads: usize, prefix: &Path, reads: &[PathBuf], sam: &Path) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push("-p".to_string());
        args_vec.push(threads.to_string());
        args_vec.push("-x".to_string());
        args_vec.push(prefix.to_string_lossy().to_string());
        match reads {
            [first, second] => {
                args_vec.push("-1".to_string());
                args_vec.push(first.to_string_lossy().to_string());
                args_vec.push("-2".to_string());
                args_vec.push(second.to_string_lossy().to_string());
            }
            _ => {
                args_vec.push("-U".to_string());
                args_vec.push(reads.iter().map(|r| r.to_string_lossy()).collect::<Vec<_>>().join(","));
            }
        }
        args_vec.push("-S".to_string());
        args_vec.push(sam.to_string_lossy().to_string());
        args_vec
    }
}

mod samtools {
    use std::path::Path;

    pub fn sort_arg_generator(threads: usize, sam: &Path, bam: &Path) -> Vec<String> {
        vec![
            "sort".to_string(),
            "-@".to_string(),
            threads.to_string(),
            "-o".to_string(),
            bam.to_string_lossy().to_string(),
            sam.to_string_lossy().to_string(),
        ]
    }
}

mod fastqc {
    use std::path::{Path, PathBuf};

    pub fn arg_generator(threads: usize, out_dir: &Path, reads: &[PathBuf]) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push("-t".to_string());
        args_vec.push(threads.to_string());
        args_vec.push("-o".to_string());
        args_vec.push(out_dir.to_string_lossy().to_string());
        for read in reads {
            args_vec.push(read.to_string_lossy().to_string());
        }
        args_vec
    }
}

mod trimmomatic {
    use std::path::{Path, PathBuf};
    use crate::config::settings::TrimmomaticParams;

    /// `outputs` is [trimmed..., unpaired...]; trimmomatic wants them interleaved per mate.
    pub fn arg_generator(
        threads: usize,
        reads: &[PathBuf],
        outputs: &[PathBuf],
        adapters: Option<&Path>,
        params: &TrimmomaticParams,
    ) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        let paired = reads.len() == 2;
        args_vec.push(if paired { "PE" } else { "SE" }.to_string());
        args_vec.push("-threads".to_string());
        args_vec.push(threads.to_string());
        for read in reads {
            args_vec.push(read.to_string_lossy().to_string());
        }
        if paired {
            for mate in 0..2 {
                args_vec.push(outputs[mate].to_string_lossy().to_string());
                args_vec.push(outputs[mate + 2].to_string_lossy().to_string());
            }
        } else {
            args_vec.push(outputs[0].to_string_lossy().to_string());
        }
        if let Some(adapters) = adapters {
            args_vec.push(format!("ILLUMINACLIP:{}:2:30:10", adapters.display()));
        }
        args_vec.push(format!("LEADING:{}", params.leading));
        args_vec.push(format!("TRAILING:{}", params.trailing));
        args_vec.push(format!("SLIDINGWINDOW:{}", params.sliding_window));
        args_vec.push(format!("MINLEN:{}", params.min_len));
        if let Some(extra) = &params.extra_args {
            args_vec.extend(extra.split_whitespace().map(str::to_string));
        }
        args_vec
    }
}

/// Production StageExecutor: shells out to the configured tools and delegates
/// Download / Decompress to the narrow collaborators.
pub struct CommandStageExecutor {
    settings: Arc<RunSettings>,
    launcher: ToolLauncher,
    fetcher: Arc<dyn Fetcher>,
    decompressor: Arc<dyn Decompressor>,
}

impl CommandStageExecutor {
    pub fn new(settings: Arc<RunSettings>, fetcher: Arc<dyn Fetcher>, decompressor: Arc<dyn Decompressor>) -> Self {
        let launcher = ToolLauncher::new(&settings);
        Self { settings, launcher, fetcher, decompressor }
    }

    /// Builds the invocation for a tool-backed stage.
    pub fn generate_cli(&self, request: &StageRequest) -> Result<ToolCommand, ToolFailure> {
        let params = &self.settings.config.tool_parameters;
        let threads = request.threads;
        let missing = |what: &str| ToolFailure::new(request.kind.to_string(), format!("request for {} lacks {}", request.label, what));
        let input = |i: usize| request.inputs.get(i).ok_or_else(|| missing("inputs"));
        let output = |i: usize| request.outputs.get(i).ok_or_else(|| missing("outputs"));

        let cmd = match (request.kind, request.aligner) {
            (StageKind::QualityReport, _) => {
                let out_dir = output(0)?.parent().ok_or_else(|| missing("report directory"))?;
                self.launcher
                    .command(FASTQC_TAG)
                    .args(fastqc::arg_generator(threads, out_dir, &request.inputs))
            }
            (StageKind::Trim, _) => {
                let expected = if request.inputs.len() == 2 { 4 } else { 1 };
                if request.inputs.is_empty() || request.outputs.len() < expected {
                    return Err(missing("trim outputs"));
                }
                self.launcher.command(TRIMMOMATIC_TAG).args(trimmomatic::arg_generator(
                    threads,
                    &request.inputs,
                    &request.outputs,
                    request.reference.as_deref(),
                    &params.trimmomatic,
                ))
            }
            (StageKind::Align, Some(AlignerKind::Star)) => {
                let index = request.reference.as_deref().ok_or_else(|| missing("index"))?;
                self.launcher
                    .command(STAR_TAG)
                    .args(star::arg_generator(threads, index, &request.inputs, output(0)?))
            }
            (StageKind::Align, Some(AlignerKind::Hisat2)) => {
                let index = request.reference.as_deref().ok_or_else(|| missing("index"))?;
                self.launcher
                    .command(HISAT2_TAG)
                    .args(hisat2::arg_generator(threads, index, &request.inputs, output(0)?))
                    .stderr_to(output(1)?)
            }
            (StageKind::Sort, _) => self
                .launcher
                .command(SAMTOOLS_TAG)
                .args(samtools::sort_arg_generator(threads, input(0)?, output(0)?)),
            (StageKind::ExtractSpliceSites, _) => self
                .launcher
                .command(HISAT2_SPLICE_SITES_TAG)
                .arg(input(0)?.to_string_lossy())
                .stdout_to(output(0)?),
            (StageKind::ExtractExons, _) => self
                .launcher
                .command(HISAT2_EXONS_TAG)
                .arg(input(0)?.to_string_lossy())
                .stdout_to(output(0)?),
            (StageKind::BuildIndex, Some(AlignerKind::Star)) => self.launcher.command(STAR_TAG).args(
                star::index_arg_generator(threads, output(0)?, input(0)?, input(1)?, &params.star),
            ),
            (StageKind::BuildIndex, Some(AlignerKind::Hisat2)) => self.launcher.command(HISAT2_BUILD_TAG).args(
                hisat2::index_arg_generator(threads, input(0)?, input(1)?, input(2)?, output(0)?),
            ),
            (kind, aligner) => {
                return Err(ToolFailure::new(
                    kind.to_string(),
                    format!("no command for {} (aligner {:?})", kind, aligner),
                ));
            }
        };
        Ok(cmd)
    }
}

#[async_trait]
impl StageExecutor for CommandStageExecutor {
    async fn execute(&self, request: &StageRequest) -> Result<StageOutput, ToolFailure> {
        match request.kind {
            StageKind::Download => {
                let locator = request
                    .locator
                    .as_deref()
                    .ok_or_else(|| ToolFailure::new("download", format!("no locator for {}", request.label)))?;
                let dest = request
                    .outputs
                    .first()
                    .ok_or_else(|| ToolFailure::new("download", format!("no destination for {}", request.label)))?;
                let path = self.fetcher.fetch(locator, dest, request.timeout).await?;
                Ok(StageOutput { artifacts: vec![path], diagnostics: String::new() })
            }
            StageKind::Decompress => {
                let source = request
                    .inputs
                    .first()
                    .ok_or_else(|| ToolFailure::new("decompress", format!("no archive for {}", request.label)))?;
                let path = self.decompressor.decompress(source).await?;
                Ok(StageOutput { artifacts: vec![path], diagnostics: String::new() })
            }
            StageKind::BuildIndex if request.aligner == Some(AlignerKind::Star) => {
                if let Some(dir) = request.outputs.first() {
                    tokio::fs::create_dir_all(dir)
                        .await
                        .map_err(|e| ToolFailure::new(STAR_TAG, format!("Cannot create {}: {}", dir.display(), e)))?;
                }
                let cmd = self.generate_cli(request)?;
                let diagnostics = run_tool(&cmd, request.timeout).await?;
                Ok(StageOutput { artifacts: request.outputs.clone(), diagnostics })
            }
            _ => {
                let cmd = self.generate_cli(request)?;
                let diagnostics = run_tool(&cmd, request.timeout).await?;
                Ok(StageOutput { artifacts: request.outputs.clone(), diagnostics })
            }
        }
    }
}
