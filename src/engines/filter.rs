use std::path::Path;

use anyhow::{Result, anyhow, bail};

use crate::engines::{FilterEngine, FilterParams, FilterSummary};
use crate::utils::fastq::{FastqRecord, FileWriter, fastq_reader, write_fastq_record};
use crate::utils::sequence::{PHRED_OFFSET, expected_errors, has_ambiguous};

/// Built-in linked-pair quality filter.
///
/// Per read, in order: left-trim, truncate at the first low-quality base,
/// enforce the fixed truncation length, reject ambiguous bases, reject reads
/// over the expected-error ceiling. A pair survives only when both mates do.
pub struct PairedReadFilter;

impl FilterEngine for PairedReadFilter {
    fn filter(
        &self,
        raw_f: &Path,
        raw_r: &Path,
        out_f: &Path,
        out_r: &Path,
        params: &FilterParams,
    ) -> Result<FilterSummary> {
        let mut fwd_records = fastq_reader(raw_f)
            .map_err(|e| anyhow!("failed to open {}: {}", raw_f.display(), e))?
            .into_records();
        let mut rev_records = fastq_reader(raw_r)
            .map_err(|e| anyhow!("failed to open {}: {}", raw_r.display(), e))?
            .into_records();

        let mut fwd_out = FileWriter::create(out_f)?;
        let mut rev_out = FileWriter::create(out_r)?;
        let mut summary = FilterSummary::default();

        loop {
            let (f, r) = match (fwd_records.next(), rev_records.next()) {
                (None, None) => break,
                (Some(f), Some(r)) => (
                    FastqRecord::from(
                        f.map_err(|e| anyhow!("malformed FASTQ in {}: {}", raw_f.display(), e))?,
                    ),
                    FastqRecord::from(
                        r.map_err(|e| anyhow!("malformed FASTQ in {}: {}", raw_r.display(), e))?,
                    ),
                ),
                _ => bail!(
                    "mate files {} and {} differ in read count",
                    raw_f.display(),
                    raw_r.display()
                ),
            };

            summary.reads_in += 1;

            let kept_f = trim_read(&f, params.trim_left_f, params.trunc_q, params.trunc_len_f, params.max_ee_f);
            let kept_r = trim_read(&r, params.trim_left_r, params.trunc_q, params.trunc_len_r, params.max_ee_r);

            if let (Some(f_rec), Some(r_rec)) = (kept_f, kept_r) {
                write_fastq_record(&mut fwd_out, &f_rec)?;
                write_fastq_record(&mut rev_out, &r_rec)?;
                summary.reads_out += 1;
            }
        }

        fwd_out.finish()?;
        rev_out.finish()?;
        Ok(summary)
    }
}

/// Applies the single-read criteria, returning the trimmed record when it
/// survives them all.
fn trim_read(
    record: &FastqRecord,
    trim_left: usize,
    trunc_q: u8,
    trunc_len: usize,
    max_ee: f64,
) -> Option<FastqRecord> {
    if record.seq.len() <= trim_left {
        return None;
    }
    let mut seq = record.seq[trim_left..].to_vec();
    let mut qual = record.qual[trim_left..].to_vec();

    // Truncate at the first base whose quality drops below trunc_q.
    if let Some(cut) = qual
        .iter()
        .position(|&q| q.saturating_sub(PHRED_OFFSET) < trunc_q)
    {
        seq.truncate(cut);
        qual.truncate(cut);
    }

    if trunc_len > 0 {
        if seq.len() < trunc_len {
            return None;
        }
        seq.truncate(trunc_len);
        qual.truncate(trunc_len);
    }

    if seq.is_empty() || has_ambiguous(&seq) {
        return None;
    }

    if expected_errors(&qual) > max_ee {
        return None;
    }

    Some(FastqRecord {
        id: record.id.clone(),
        desc: record.desc.clone(),
        seq,
        qual,
    })
}
