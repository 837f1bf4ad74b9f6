use anyhow::Result;

use crate::cli::ChimeraMethod;
use crate::engines::ChimeraEngine;
use crate::utils::table::SequenceTable;

/// Fraction of judging samples that must call a variant chimeric before the
/// consensus policy removes it.
pub const CONSENSUS_MIN_SAMPLE_FRACTION: f64 = 0.9;

/// Built-in two-parent (bimera) detector.
///
/// A variant is chimeric when some split point divides it into a prefix
/// matched exactly by one parent and a suffix matched exactly by a different
/// parent, where parents are variants at least `min_parent_fold` times more
/// abundant than the candidate in the abundances being judged.
pub struct BimeraFilter;

impl ChimeraEngine for BimeraFilter {
    fn remove_chimeras(
        &self,
        table: &SequenceTable,
        method: ChimeraMethod,
        min_parent_fold: f64,
    ) -> Result<SequenceTable> {
        match method {
            ChimeraMethod::None => Ok(table.clone()),
            ChimeraMethod::Pooled => {
                let abundances = table.column_sums();
                let keep: Vec<bool> = (0..table.n_sequences())
                    .map(|col| !is_bimera(col, table.sequences(), &abundances, min_parent_fold))
                    .collect();
                Ok(table.retain_columns(&keep))
            }
            ChimeraMethod::Consensus => {
                let keep: Vec<bool> = (0..table.n_sequences())
                    .map(|col| !consensus_chimeric(table, col, min_parent_fold))
                    .collect();
                Ok(table.retain_columns(&keep))
            }
        }
    }
}

/// Judges one column per sample, counting verdicts only from samples where
/// the variant is present.
fn consensus_chimeric(table: &SequenceTable, col: usize, min_parent_fold: f64) -> bool {
    let mut judged = 0u64;
    let mut chimeric = 0u64;
    for row in 0..table.n_samples() {
        if table.count(row, col) == 0 {
            continue;
        }
        let abundances: Vec<u64> = (0..table.n_sequences())
            .map(|c| table.count(row, c))
            .collect();
        judged += 1;
        if is_bimera(col, table.sequences(), &abundances, min_parent_fold) {
            chimeric += 1;
        }
    }
    judged > 0 && chimeric as f64 / judged as f64 >= CONSENSUS_MIN_SAMPLE_FRACTION
}

/// Exact split test against sufficiently abundant parents.
fn is_bimera(
    candidate: usize,
    sequences: &[Vec<u8>],
    abundances: &[u64],
    min_parent_fold: f64,
) -> bool {
    let seq = &sequences[candidate];
    let abundance = abundances[candidate];
    if abundance == 0 || seq.len() < 2 {
        return false;
    }

    let parents: Vec<usize> = (0..sequences.len())
        .filter(|&i| i != candidate)
        .filter(|&i| abundances[i] as f64 >= min_parent_fold * abundance as f64)
        .collect();
    if parents.len() < 2 {
        return false;
    }

    for split in 1..seq.len() {
        let prefix = &seq[..split];
        let suffix = &seq[split..];
        let lefts: Vec<usize> = parents
            .iter()
            .copied()
            .filter(|&p| sequences[p].starts_with(prefix))
            .collect();
        if lefts.is_empty() {
            continue;
        }
        let chimeric = parents
            .iter()
            .copied()
            .filter(|&p| sequences[p].ends_with(suffix))
            .any(|right| lefts.iter().any(|&left| left != right));
        if chimeric {
            return true;
        }
    }
    false
}
