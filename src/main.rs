mod pipelines;
mod utils;
mod config;
mod cli;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use env_logger::{Builder, Target};
use log::{self, LevelFilter, debug, info, error};
use crate::cli::{parse, Arguments};
use crate::config::defs::{PipelineError, Sample, LOG_FILE};
use crate::config::settings::{load_config, RunSettings};
use crate::pipelines::aggregate::CommandAggregationExecutor;
use crate::pipelines::scheduler::PhaseScheduler;
use crate::utils::command::{check_tools, CommandStageExecutor};
use crate::utils::fastx::load_samples;
use crate::utils::fetch::{GzipDecompressor, WgetFetcher};
use crate::utils::probe::FsProbe;
use crate::utils::system::check_thread_budget;

/// Copies every log line to stderr and to the run's log file.
struct TeeWriter {
    file: File,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

fn init_logging(verbose: bool, log_path: &Path) -> io::Result<()> {
    let log_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let file = OpenOptions::new().create(true).append(true).open(log_path)?;
    Builder::new()
        .filter_level(log_level)
        .target(Target::Pipe(Box::new(TeeWriter { file })))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();
    Ok(())
}

/// Loads the config file and applies command-line overrides.
fn load_settings(args: &Arguments) -> Result<RunSettings, PipelineError> {
    let config_path = PathBuf::from(&args.config);
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let config = load_config(&config_path)?;
    RunSettings::from_config(config, &config_dir)?.with_overrides(args)
}

/// Builds the sample registry from the configured locator list.
fn collect_samples(settings: &RunSettings) -> Result<Vec<Sample>, PipelineError> {
    let list = settings
        .fastq_list_file
        .as_ref()
        .ok_or_else(|| PipelineError::InvalidConfig("source_data.fastq_list_file is required".to_string()))?;
    load_samples(list, settings.sequencing)
}

#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();
    let args = parse();

    let settings = match load_settings(&args) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    let base_dir = settings.layout.base_dir().to_path_buf();
    if let Err(e) = fs::create_dir_all(&base_dir).and_then(|_| init_logging(args.verbose, &base_dir.join(LOG_FILE))) {
        eprintln!("Cannot set up {}: {}", base_dir.display(), e);
        std::process::exit(1);
    }

    println!("\n-------------\n RNA-seq pipelines\n-------------\n");
    info!("Base directory: {}", base_dir.display());
    info!(
        "Aligners: {}; retention: {:?}",
        settings.aligners.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(", "),
        settings.retention
    );

    check_thread_budget(settings.max_parallel_samples, settings.threads_per_sample).await;

    if args.skip_tool_check {
        debug!("Skipping tool presence check");
    } else if let Err(e) = check_tools(&settings).await {
        error!("{}", e);
        std::process::exit(1);
    }

    let samples = match collect_samples(&settings) {
        Ok(samples) => samples,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    info!("{} samples registered", samples.len());

    let settings = Arc::new(settings);
    let executor = Arc::new(CommandStageExecutor::new(
        settings.clone(),
        Arc::new(WgetFetcher),
        Arc::new(GzipDecompressor),
    ));
    let aggregator = Arc::new(CommandAggregationExecutor::new(settings.clone()));
    let scheduler = PhaseScheduler::new(settings, executor, aggregator, Arc::new(FsProbe));

    let report = match scheduler.run(samples).await {
        Ok(report) => report,
        Err(e) => {
            error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
            std::process::exit(1);
        }
    };

    println!("{}", report);
    for line in report.to_string().lines() {
        info!("{}", line);
    }
    println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());

    let code = report.exit_code();
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
