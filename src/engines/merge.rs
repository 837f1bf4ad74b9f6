use anyhow::{Result, bail};
use fxhash::FxHashMap;

use crate::engines::{DenoiseResult, MergeEngine, MergedResult};
use crate::utils::fastq::Dereplicated;
use crate::utils::sequence::reverse_complement;

/// Built-in pair merger.
///
/// Read pairs are grouped into (forward-unit, reverse-unit) classes via the
/// dereplication maps, each class is looked up in both variant assignments,
/// and the two variant sequences are reconciled by exact overlap of the
/// forward sequence with the reverse-complemented reverse sequence. Classes
/// that fail lookup or reconciliation contribute nothing.
pub struct OverlapMerger;

impl MergeEngine for OverlapMerger {
    fn merge(
        &self,
        denoised_f: &DenoiseResult,
        derep_f: &Dereplicated,
        denoised_r: &DenoiseResult,
        derep_r: &Dereplicated,
        min_overlap: usize,
    ) -> Result<MergedResult> {
        if derep_f.read_units.len() != derep_r.read_units.len() {
            bail!(
                "forward and reverse dereplications cover different read counts ({} vs {})",
                derep_f.read_units.len(),
                derep_r.read_units.len()
            );
        }

        let mut pair_classes: FxHashMap<(usize, usize), u64> = FxHashMap::default();
        for (f_unit, r_unit) in derep_f.read_units.iter().zip(derep_r.read_units.iter()) {
            *pair_classes.entry((*f_unit, *r_unit)).or_default() += 1;
        }

        let mut counts: FxHashMap<Vec<u8>, u64> = FxHashMap::default();
        for ((f_unit, r_unit), n) in pair_classes {
            let Some(f_variant) = denoised_f.unit_assignment[f_unit] else {
                continue;
            };
            let Some(r_variant) = denoised_r.unit_assignment[r_unit] else {
                continue;
            };
            let forward = &denoised_f.variants[f_variant];
            let reverse_rc = reverse_complement(&denoised_r.variants[r_variant]);
            if let Some(merged) = overlap_merge(forward, &reverse_rc, min_overlap) {
                *counts.entry(merged).or_default() += n;
            }
        }

        Ok(MergedResult { counts })
    }
}

/// Joins a forward sequence with an already reverse-complemented reverse
/// sequence at the largest exact overlap of at least `min_overlap` bases.
fn overlap_merge(forward: &[u8], reverse_rc: &[u8], min_overlap: usize) -> Option<Vec<u8>> {
    let max_overlap = forward.len().min(reverse_rc.len());
    for overlap in (min_overlap..=max_overlap).rev() {
        if forward[forward.len() - overlap..] == reverse_rc[..overlap] {
            let mut merged = forward.to_vec();
            merged.extend_from_slice(&reverse_rc[overlap..]);
            return Some(merged);
        }
    }
    None
}
