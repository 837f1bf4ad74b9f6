use clap::{Parser, ValueEnum};

/// How samples are pooled across the two denoising passes.
#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum PoolingMode {
    /// One pass per sample, no shared priors.
    #[default]
    Independent,
    /// A priors-gathering pass over all samples, then a seeded second pass.
    Pseudo,
}

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum ChimeraMethod {
    /// Skip chimera removal entirely.
    None,
    /// Judge each variant against abundances pooled across samples.
    Pooled,
    /// Judge per sample and combine the verdicts.
    #[default]
    Consensus,
}

/// What to do when one sample fails mid-stage while its peers succeed.
#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum SampleErrorPolicy {
    /// Abort the whole run.
    #[default]
    Abort,
    /// Log the failure and carry the sample as a zero-count tracking row.
    Zero,
}

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "ampliseq-pipelines", version = "0.1.0")]
pub struct Arguments {
    #[arg(short, long)]
    pub module: String,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(short = 'i', long = "input-dir", help = "Directory of raw paired FASTQ files; forward/reverse mates are paired by filename tag (R1/R2, fwd/rev, ...)")]
    pub input_dir: String,

    #[arg(short = 'o', long = "out", help = "Output directory for all generated files. If not specified, a directory named 'denoise_YYYYMMDD' will be created in the current working directory.")]
    pub out_dir: Option<String>,

    #[arg(long, help = "Directory for filtered read pairs; defaults to <out>/filtered")]
    pub filtered_dir: Option<String>,

    #[arg(long, default_value_t = 0, help = "Truncate forward reads to this length, dropping shorter reads; 0 disables")]
    pub trunc_len_f: usize,

    #[arg(long, default_value_t = 0, help = "Truncate reverse reads to this length, dropping shorter reads; 0 disables")]
    pub trunc_len_r: usize,

    #[arg(long, default_value_t = 0)]
    pub trim_left_f: usize,

    #[arg(long, default_value_t = 0)]
    pub trim_left_r: usize,

    #[arg(long, default_value_t = 2.0, help = "Maximum expected errors allowed in a forward read")]
    pub max_ee_f: f64,

    #[arg(long, default_value_t = 2.0, help = "Maximum expected errors allowed in a reverse read")]
    pub max_ee_r: f64,

    #[arg(short = 'q', long = "trunc-q", default_value_t = 2, help = "Truncate reads at the first base with quality below this score")]
    pub trunc_q: u8,

    #[arg(long, default_value_t = 12, help = "Minimum forward/reverse overlap required to merge a pair")]
    pub min_overlap: usize,

    #[arg(long, default_value_t = 1_000_000, help = "Reads used to learn each error model; 0 uses all available reads")]
    pub n_reads_learn: u64,

    #[arg(long = "pooling", default_value = "independent", value_enum)]
    pub pooling: PoolingMode,

    #[arg(long = "chimera-method", default_value = "consensus", value_enum)]
    pub chimera_method: ChimeraMethod,

    #[arg(long, default_value_t = 1.0, help = "A chimera's parents must be at least this many times more abundant than it")]
    pub min_parent_fold: f64,

    #[arg(long, default_value_t = 1, help = "Per-sample worker count; 0 uses all cores, 1 is strictly sequential")]
    pub threads: usize,

    #[arg(long = "on-sample-error", default_value = "abort", value_enum)]
    pub on_sample_error: SampleErrorPolicy,
}
