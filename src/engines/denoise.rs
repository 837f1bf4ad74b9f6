use anyhow::Result;
use fxhash::FxHashMap;

use crate::engines::{DenoiseEngine, DenoiseResult, ErrorModel, PriorSet};
use crate::utils::fastq::Dereplicated;
use crate::utils::sequence::hamming;

/// Units at or above this abundance seed their own variant outright.
const MIN_VARIANT_ABUNDANCE: u64 = 2;

/// Built-in denoiser.
///
/// Units are visited in descending abundance. A unit becomes a variant when
/// its abundance clears `MIN_VARIANT_ABUNDANCE` or its sequence is in the
/// prior set; otherwise it is absorbed into the closest existing variant
/// within the model's divergence budget, and failing that promoted to a
/// variant of its own. Every read therefore ends up assigned.
pub struct AbundanceDenoiser;

impl DenoiseEngine for AbundanceDenoiser {
    fn denoise(
        &self,
        derep: &Dereplicated,
        model: &ErrorModel,
        priors: Option<&PriorSet>,
    ) -> Result<DenoiseResult> {
        let units = &derep.units;
        let mut order: Vec<usize> = (0..units.len()).collect();
        order.sort_by(|&a, &b| {
            units[b]
                .count
                .cmp(&units[a].count)
                .then_with(|| units[a].seq.cmp(&units[b].seq))
        });

        let mut variants: Vec<Vec<u8>> = Vec::new();
        let mut unit_assignment = vec![None; units.len()];

        for idx in order {
            let unit = &units[idx];
            let seeded = unit.count >= MIN_VARIANT_ABUNDANCE
                || priors.is_some_and(|p| p.contains(&unit.seq));
            if seeded {
                unit_assignment[idx] = Some(push_variant(&mut variants, &unit.seq));
                continue;
            }

            let budget = model.divergence_budget(unit.seq.len());
            let nearest = variants
                .iter()
                .enumerate()
                .map(|(v, seq)| (hamming(seq, &unit.seq), v))
                .filter(|&(dist, _)| dist <= budget)
                .min();
            unit_assignment[idx] = Some(match nearest {
                Some((_, v)) => v,
                None => push_variant(&mut variants, &unit.seq),
            });
        }

        let denoised_reads = unit_assignment
            .iter()
            .enumerate()
            .filter(|(_, a)| a.is_some())
            .map(|(u, _)| units[u].count)
            .sum();

        Ok(DenoiseResult {
            variants,
            unit_assignment,
            denoised_reads,
        })
    }
}

fn push_variant(variants: &mut Vec<Vec<u8>>, seq: &[u8]) -> usize {
    variants.push(seq.to_vec());
    variants.len() - 1
}

/// Pools per-variant totals from one sample into a running cross-sample sum,
/// used to build the prior set after a first pass.
pub fn accumulate_variant_totals(
    pooled: &mut FxHashMap<Vec<u8>, u64>,
    result: &DenoiseResult,
    derep: &Dereplicated,
) {
    for (seq, total) in result.variant_totals(derep) {
        *pooled.entry(seq).or_default() += total;
    }
}
