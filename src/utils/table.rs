use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::{Result, anyhow};
use fxhash::FxHashMap;
use ndarray::Array2;

use crate::config::defs::VARIANT_ID_LABEL;
use crate::engines::MergedResult;

/// Global sample × sequence-variant abundance matrix. Rows keep sample
/// discovery order; columns are the union of merged sequences ordered by
/// descending pooled abundance, ties broken lexicographically, so identical
/// inputs always yield an identical table.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceTable {
    sample_ids: Vec<String>,
    sequences: Vec<Vec<u8>>,
    counts: Array2<u64>,
}

impl SequenceTable {
    /// Assembles the table from per-sample merged results.
    pub fn from_merged(merged: &[(String, MergedResult)]) -> SequenceTable {
        let mut totals: FxHashMap<Vec<u8>, u64> = FxHashMap::default();
        for (_, result) in merged {
            for (seq, count) in &result.counts {
                *totals.entry(seq.clone()).or_default() += count;
            }
        }

        let mut sequences: Vec<Vec<u8>> = totals.keys().cloned().collect();
        sequences.sort_by(|a, b| totals[b].cmp(&totals[a]).then_with(|| a.cmp(b)));

        let column: FxHashMap<&[u8], usize> = sequences
            .iter()
            .enumerate()
            .map(|(i, s)| (s.as_slice(), i))
            .collect();

        let mut counts = Array2::<u64>::zeros((merged.len(), sequences.len()));
        let mut sample_ids = Vec::with_capacity(merged.len());
        for (row, (sample, result)) in merged.iter().enumerate() {
            sample_ids.push(sample.clone());
            for (seq, count) in &result.counts {
                counts[[row, column[seq.as_slice()]]] = *count;
            }
        }

        SequenceTable {
            sample_ids,
            sequences,
            counts,
        }
    }

    pub fn n_samples(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn n_sequences(&self) -> usize {
        self.sequences.len()
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn sequences(&self) -> &[Vec<u8>] {
        &self.sequences
    }

    pub fn count(&self, row: usize, col: usize) -> u64 {
        self.counts[[row, col]]
    }

    /// Total reads per sample row, in row order.
    pub fn row_sums(&self) -> Vec<u64> {
        self.counts
            .rows()
            .into_iter()
            .map(|row| row.iter().sum())
            .collect()
    }

    /// Total reads in the named sample's row, if present.
    pub fn row_sum_by_sample(&self, sample: &str) -> Option<u64> {
        let row = self.sample_ids.iter().position(|s| s == sample)?;
        Some(self.counts.row(row).iter().sum())
    }

    /// Pooled abundance per sequence column, in column order.
    pub fn column_sums(&self) -> Vec<u64> {
        self.counts
            .columns()
            .into_iter()
            .map(|col| col.iter().sum())
            .collect()
    }

    /// Derived table keeping only the flagged columns; rows are unchanged.
    pub fn retain_columns(&self, keep: &[bool]) -> SequenceTable {
        assert_eq!(keep.len(), self.sequences.len());
        let kept: Vec<usize> = (0..self.sequences.len()).filter(|&c| keep[c]).collect();

        let mut counts = Array2::<u64>::zeros((self.sample_ids.len(), kept.len()));
        for (new_col, &old_col) in kept.iter().enumerate() {
            for row in 0..self.sample_ids.len() {
                counts[[row, new_col]] = self.counts[[row, old_col]];
            }
        }

        SequenceTable {
            sample_ids: self.sample_ids.clone(),
            sequences: kept.iter().map(|&c| self.sequences[c].clone()).collect(),
            counts,
        }
    }

    /// Writes the table as tab-delimited text: rows = sequence variants
    /// (labelled by their sequence), columns = samples.
    pub fn write_tsv(&self, path: &Path) -> Result<()> {
        let mut out = String::new();
        out.push_str(VARIANT_ID_LABEL);
        for sample in &self.sample_ids {
            out.push('\t');
            out.push_str(sample);
        }
        out.push('\n');

        for (col, seq) in self.sequences.iter().enumerate() {
            out.push_str(&String::from_utf8_lossy(seq));
            for row in 0..self.sample_ids.len() {
                out.push('\t');
                out.push_str(&self.counts[[row, col]].to_string());
            }
            out.push('\n');
        }

        let mut file = File::create(path)
            .map_err(|e| anyhow!("failed to create {}: {}", path.display(), e))?;
        file.write_all(out.as_bytes())
            .map_err(|e| anyhow!("failed to write {}: {}", path.display(), e))?;
        Ok(())
    }
}

/// Reads surviving each stage for one sample. Counts can only shrink from
/// left to right.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingRow {
    pub sample: String,
    pub input: u64,
    pub filtered: u64,
    pub denoised: u64,
    pub merged: u64,
    pub non_chimeric: u64,
}

impl TrackingRow {
    /// Row for a sample that produced nothing past the named input count.
    pub fn zeroed(sample: &str, input: u64) -> TrackingRow {
        TrackingRow {
            sample: sample.to_string(),
            input,
            filtered: 0,
            denoised: 0,
            merged: 0,
            non_chimeric: 0,
        }
    }
}

/// Writes the per-sample read tracking table.
pub fn write_tracking_tsv(rows: &[TrackingRow], path: &Path) -> Result<()> {
    let mut out = String::from("sample-id\tinput\tfiltered\tdenoised\tmerged\tnon-chimeric\n");
    for row in rows {
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\t{}\t{}\n",
            row.sample, row.input, row.filtered, row.denoised, row.merged, row.non_chimeric
        ));
    }

    let mut file =
        File::create(path).map_err(|e| anyhow!("failed to create {}: {}", path.display(), e))?;
    file.write_all(out.as_bytes())
        .map_err(|e| anyhow!("failed to write {}: {}", path.display(), e))?;
    Ok(())
}
