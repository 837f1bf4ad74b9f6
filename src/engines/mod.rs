//! Seams for the statistical collaborators the pipeline orchestrates.
//!
//! Each stage with nontrivial numerical internals sits behind a trait so the
//! orchestration core never depends on a particular model. The built-in
//! implementations in the submodules are enough to run end-to-end; tests swap
//! in recording mocks through the same seams.

pub mod chimera;
pub mod denoise;
pub mod error_model;
pub mod filter;
pub mod merge;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use fxhash::{FxHashMap, FxHashSet};

use crate::cli::ChimeraMethod;
use crate::utils::fastq::Dereplicated;
use crate::utils::sequence::error_prob;
use crate::utils::table::SequenceTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Reverse => "reverse",
        }
    }
}

/// Per-direction quality filtering thresholds for one run.
#[derive(Debug, Clone, Copy)]
pub struct FilterParams {
    pub trunc_len_f: usize,
    pub trunc_len_r: usize,
    pub trim_left_f: usize,
    pub trim_left_r: usize,
    pub max_ee_f: f64,
    pub max_ee_r: f64,
    pub trunc_q: u8,
}

/// Read-pair counts entering and surviving the filter for one sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterSummary {
    pub reads_in: u64,
    pub reads_out: u64,
}

/// Shared per-direction error model. Built once by the learner, then
/// `Arc`-shared read-only across every denoising worker.
#[derive(Debug, Clone)]
pub struct ErrorModel {
    direction: Direction,
    reads_used: u64,
    rates: Vec<f64>,
    mean_error_rate: f64,
}

impl ErrorModel {
    pub fn new(
        direction: Direction,
        reads_used: u64,
        rates: Vec<f64>,
        mean_error_rate: f64,
    ) -> ErrorModel {
        ErrorModel {
            direction,
            reads_used,
            rates,
            mean_error_rate,
        }
    }

    /// Uniform-rate model, mainly useful as a test stand-in.
    pub fn uniform(direction: Direction, phred: u8) -> ErrorModel {
        let p = error_prob(phred);
        ErrorModel {
            direction,
            reads_used: 0,
            rates: vec![p; (phred as usize) + 1],
            mean_error_rate: p,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn reads_used(&self) -> u64 {
        self.reads_used
    }

    /// Error probability for one phred score, falling back to the nominal
    /// conversion for scores never seen while learning.
    pub fn error_rate(&self, phred: u8) -> f64 {
        self.rates
            .get(phred as usize)
            .copied()
            .unwrap_or_else(|| error_prob(phred))
    }

    pub fn mean_error_rate(&self) -> f64 {
        self.mean_error_rate
    }

    /// Substitutions a read of this length can plausibly carry; at least one.
    pub fn divergence_budget(&self, len: usize) -> usize {
        ((self.mean_error_rate * len as f64).ceil() as usize).max(1)
    }
}

/// Admission threshold for the shared prior set: pooled first-pass abundance
/// must reach this many reads.
pub const PRIOR_MIN_ABUNDANCE: u64 = 2;

/// Second admission arm for unconditionally seeded variants; `u64::MAX`
/// keeps it permanently closed.
pub const PRIOR_UNCONDITIONAL_ABUNDANCE: u64 = u64::MAX;

/// Per-direction set of sequences seeded into every sample's second
/// denoising pass. Immutable once computed.
#[derive(Debug, Clone, Default)]
pub struct PriorSet {
    sequences: FxHashSet<Vec<u8>>,
}

impl PriorSet {
    /// Applies the admission rule to pooled first-pass variant abundances.
    pub fn from_totals(totals: &FxHashMap<Vec<u8>, u64>) -> PriorSet {
        let sequences = totals
            .iter()
            .filter(|&(_, &total)| {
                total >= PRIOR_MIN_ABUNDANCE || total >= PRIOR_UNCONDITIONAL_ABUNDANCE
            })
            .map(|(seq, _)| seq.clone())
            .collect();
        PriorSet { sequences }
    }

    pub fn contains(&self, seq: &[u8]) -> bool {
        self.sequences.contains(seq)
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }
}

/// Inferred variants for one sample and direction, plus the unit-to-variant
/// assignment over the sample's dereplicated reads.
#[derive(Debug, Clone, PartialEq)]
pub struct DenoiseResult {
    /// Variant sequences in inference order.
    pub variants: Vec<Vec<u8>>,
    /// For each dereplicated unit, the variant it was assigned to; `None`
    /// marks reads the engine could not place.
    pub unit_assignment: Vec<Option<usize>>,
    /// Total reads behind the assigned units.
    pub denoised_reads: u64,
}

impl DenoiseResult {
    /// Per-variant read totals, keyed by variant sequence.
    pub fn variant_totals(&self, derep: &Dereplicated) -> FxHashMap<Vec<u8>, u64> {
        let mut totals: FxHashMap<Vec<u8>, u64> = FxHashMap::default();
        for (unit, assignment) in self.unit_assignment.iter().enumerate() {
            if let Some(variant) = assignment {
                *totals.entry(self.variants[*variant].clone()).or_default() +=
                    derep.units[unit].count;
            }
        }
        totals
    }
}

/// Abundance per merged sequence for one sample.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedResult {
    pub counts: FxHashMap<Vec<u8>, u64>,
}

impl MergedResult {
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }
}

pub trait FilterEngine: Send + Sync {
    /// Filters one sample's raw mate files into `out_f`/`out_r`, keeping a
    /// pair only when both mates pass, and reports pair counts in and out.
    fn filter(
        &self,
        raw_f: &Path,
        raw_r: &Path,
        out_f: &Path,
        out_r: &Path,
        params: &FilterParams,
    ) -> Result<FilterSummary>;
}

pub trait ErrorModelEngine: Send + Sync {
    /// Learns one direction's model from filtered files walked in the given
    /// order, consuming reads until `target_reads` is met (0 = all reads).
    fn learn(
        &self,
        direction: Direction,
        filtered: &[PathBuf],
        target_reads: u64,
    ) -> Result<ErrorModel>;
}

pub trait DenoiseEngine: Send + Sync {
    /// Infers variants for one sample and direction. Only the sample's own
    /// dereplicated reads, the shared model, and the optional priors may
    /// influence the result.
    fn denoise(
        &self,
        derep: &Dereplicated,
        model: &ErrorModel,
        priors: Option<&PriorSet>,
    ) -> Result<DenoiseResult>;
}

pub trait MergeEngine: Send + Sync {
    /// Reconciles a sample's forward and reverse variant calls into merged
    /// sequences; pairs whose overlap disagrees are dropped.
    fn merge(
        &self,
        denoised_f: &DenoiseResult,
        derep_f: &Dereplicated,
        denoised_r: &DenoiseResult,
        derep_r: &Dereplicated,
        min_overlap: usize,
    ) -> Result<MergedResult>;
}

pub trait ChimeraEngine: Send + Sync {
    /// Returns a derived table with chimeric columns removed per `method`.
    fn remove_chimeras(
        &self,
        table: &SequenceTable,
        method: ChimeraMethod,
        min_parent_fold: f64,
    ) -> Result<SequenceTable>;
}

/// The collaborator bundle handed to the orchestrator.
#[derive(Clone)]
pub struct Engines {
    pub filter: Arc<dyn FilterEngine>,
    pub error_model: Arc<dyn ErrorModelEngine>,
    pub denoise: Arc<dyn DenoiseEngine>,
    pub merge: Arc<dyn MergeEngine>,
    pub chimera: Arc<dyn ChimeraEngine>,
}

impl Engines {
    /// The built-in engine set used by the binary.
    pub fn builtin() -> Engines {
        Engines {
            filter: Arc::new(filter::PairedReadFilter),
            error_model: Arc::new(error_model::QualityProfileLearner),
            denoise: Arc::new(denoise::AbundanceDenoiser),
            merge: Arc::new(merge::OverlapMerger),
            chimera: Arc::new(chimera::BimeraFilter),
        }
    }
}
