use std::path::PathBuf;

use anyhow::{Result, anyhow, bail};

use crate::engines::{Direction, ErrorModel, ErrorModelEngine};
use crate::utils::fastq::fastq_reader;
use crate::utils::sequence::{PHRED_OFFSET, error_prob};

const MAX_PHRED: usize = 93;

/// Built-in learner: accumulates a per-quality base histogram over filtered
/// reads, walking files in the order given and stopping once the read target
/// is met, then derives the model's per-quality error probabilities.
pub struct QualityProfileLearner;

impl ErrorModelEngine for QualityProfileLearner {
    fn learn(
        &self,
        direction: Direction,
        filtered: &[PathBuf],
        target_reads: u64,
    ) -> Result<ErrorModel> {
        let mut histogram = [0u64; MAX_PHRED + 1];
        let mut reads_used = 0u64;

        'files: for path in filtered {
            let reader = fastq_reader(path)
                .map_err(|e| anyhow!("failed to open {}: {}", path.display(), e))?;
            for result in reader.into_records() {
                if target_reads > 0 && reads_used >= target_reads {
                    break 'files;
                }
                let record = result
                    .map_err(|e| anyhow!("malformed FASTQ in {}: {}", path.display(), e))?;
                for &q in &record.qual {
                    let phred = (q.saturating_sub(PHRED_OFFSET) as usize).min(MAX_PHRED);
                    histogram[phred] += 1;
                }
                reads_used += 1;
            }
        }

        if reads_used == 0 {
            bail!(
                "no {} reads available to learn an error model",
                direction.as_str()
            );
        }

        let total_bases: u64 = histogram.iter().sum();
        let weighted: f64 = histogram
            .iter()
            .enumerate()
            .map(|(phred, &count)| count as f64 * error_prob(phred as u8))
            .sum();
        let mean_error_rate = weighted / total_bases as f64;

        let rates = (0..=MAX_PHRED).map(|phred| error_prob(phred as u8)).collect();
        Ok(ErrorModel::new(direction, reads_used, rates, mean_error_rate))
    }
}
