use clap::Parser;
use crate::config::defs::RetentionMode;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "rnaseq-pipelines", version, about = "Checkpointed RNA-seq pipeline runner")]
pub struct Arguments {

    #[arg(short = 'c', long = "config", help = "JSON configuration file")]
    pub config: String,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(long, help = "Override tool_parameters.max_parallel_samples")]
    pub max_parallel_samples: Option<usize>,

    #[arg(long, help = "Override tool_parameters.threads_per_sample")]
    pub threads_per_sample: Option<usize>,

    #[arg(long, value_enum, help = "Override the retention flags of the configuration file")]
    pub retention: Option<RetentionMode>,

    #[arg(long, default_value_t = false, help = "Do not probe external tools before phase 1")]
    pub skip_tool_check: bool,
}
