use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;

use crate::cli::Arguments;

// Static filenames
pub const ASV_TABLE_FILENAME: &str = "asv_table.tsv";
pub const TRACKING_FILENAME: &str = "read_tracking.tsv";
pub const FILTERED_DIR_NAME: &str = "filtered";
pub const FORWARD_FILT_SUFFIX: &str = "F_filt.fastq.gz";
pub const REVERSE_FILT_SUFFIX: &str = "R_filt.fastq.gz";

/// Leading label of the abundance table header row, kept stable for
/// downstream consumers.
pub const VARIANT_ID_LABEL: &str = "#OTU ID";

// Stage names carried in per-sample failure reports.
pub const STAGE_FILTER: &str = "filter";
pub const STAGE_DEREPLICATE: &str = "dereplicate";
pub const STAGE_DENOISE: &str = "denoise";
pub const STAGE_MERGE: &str = "merge";

pub struct RunConfig {
    pub cwd: PathBuf,
    pub out_dir: PathBuf,
    pub filtered_dir: PathBuf,
    pub args: Arguments,
    pub worker_semaphore: Arc<Semaphore>,
    pub worker_permits: usize,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No reads passed the filter in any sample")]
    EmptyFilterOutput,

    #[error("Stage '{stage}' failed for sample '{sample}': {error}")]
    SampleFailed {
        sample: String,
        stage: String,
        error: String,
    },

    #[error("Stage '{stage}' failed: {error}")]
    StageFailed { stage: String, error: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Process exit code reported by the binary for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::EmptyFilterOutput => 2,
            _ => 1,
        }
    }
}
