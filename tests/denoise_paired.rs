use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tempfile::tempdir;
use tokio::sync::Semaphore;

use ampliseq_pipelines::cli::{
    Arguments, ChimeraMethod, PoolingMode, SampleErrorPolicy,
};
use ampliseq_pipelines::config::defs::{PipelineError, RunConfig};
use ampliseq_pipelines::engines::denoise::AbundanceDenoiser;
use ampliseq_pipelines::engines::{
    DenoiseEngine, DenoiseResult, Engines, ErrorModel, PriorSet,
};
use ampliseq_pipelines::pipelines::denoise_paired::{PipelineOutputs, run, run_with_engines};
use ampliseq_pipelines::utils::fastq::{Dereplicated, random_amplicon, synthetic_pair_files};

const READ_LEN: usize = 80;
const AMPLICON_LEN: usize = 120;

fn base_args(input_dir: &Path) -> Arguments {
    Arguments {
        module: "denoise_paired".to_string(),
        verbose: false,
        input_dir: input_dir.display().to_string(),
        out_dir: None,
        filtered_dir: None,
        trunc_len_f: 0,
        trunc_len_r: 0,
        trim_left_f: 0,
        trim_left_r: 0,
        max_ee_f: 2.0,
        max_ee_r: 2.0,
        trunc_q: 2,
        min_overlap: 12,
        n_reads_learn: 0,
        pooling: PoolingMode::Independent,
        chimera_method: ChimeraMethod::None,
        min_parent_fold: 1.0,
        threads: 1,
        on_sample_error: SampleErrorPolicy::Abort,
    }
}

fn run_config(args: Arguments, work_dir: &Path, out_name: &str) -> Arc<RunConfig> {
    let out_dir = work_dir.join(out_name);
    let filtered_dir = out_dir.join("filtered");
    let permits = args.threads.max(1);
    Arc::new(RunConfig {
        cwd: work_dir.to_path_buf(),
        out_dir,
        filtered_dir,
        worker_semaphore: Arc::new(Semaphore::new(permits)),
        worker_permits: permits,
        args,
    })
}

fn assert_tracking_monotonic(outputs: &PipelineOutputs) {
    for row in &outputs.tracking {
        assert!(
            row.input >= row.filtered
                && row.filtered >= row.denoised
                && row.denoised >= row.merged
                && row.merged >= row.non_chimeric,
            "tracking counts must be non-increasing: {:?}",
            row
        );
    }
}

/// Two clean samples sharing one amplicon; the full pipeline keeps every
/// read and reports it in both tables.
#[tokio::test]
async fn test_two_clean_samples_end_to_end() -> Result<()> {
    let tmp = tempdir()?;
    let input = tmp.path().join("raw");
    std::fs::create_dir_all(&input)?;

    let amplicon = random_amplicon(1, AMPLICON_LEN);
    synthetic_pair_files(&input, "s1", &[(amplicon.clone(), 6)], READ_LEN, 35.0, 3.0, 101)?;
    synthetic_pair_files(&input, "s2", &[(amplicon.clone(), 4)], READ_LEN, 35.0, 3.0, 102)?;

    let config = run_config(base_args(&input), tmp.path(), "out");
    let outputs = run_with_engines(config, Engines::builtin()).await?;

    assert_eq!(outputs.table.sample_ids(), &["s1".to_string(), "s2".to_string()]);
    assert_eq!(outputs.table.n_sequences(), 1);
    assert_eq!(outputs.table.sequences()[0], amplicon);
    assert_eq!(outputs.table.row_sums(), vec![6, 4]);

    assert_eq!(outputs.tracking.len(), 2);
    let s1 = &outputs.tracking[0];
    assert_eq!((s1.input, s1.filtered, s1.denoised, s1.merged, s1.non_chimeric), (6, 6, 6, 6, 6));
    assert_tracking_monotonic(&outputs);
    Ok(())
}

/// Scenario A: filtering wipes out sample 2; its tracking row stays, zeroed
/// past the input count, and sample 1 proceeds normally.
#[tokio::test]
async fn test_sample_eliminated_by_filter_keeps_zero_row() -> Result<()> {
    let tmp = tempdir()?;
    let input = tmp.path().join("raw");
    std::fs::create_dir_all(&input)?;

    let amplicon = random_amplicon(2, AMPLICON_LEN);
    synthetic_pair_files(&input, "s1", &[(amplicon.clone(), 5)], READ_LEN, 35.0, 3.0, 201)?;
    // Junk quality: ~50 expected errors per read, far over the ceiling.
    synthetic_pair_files(&input, "s2", &[(amplicon.clone(), 3)], READ_LEN, 2.0, 1.0, 202)?;

    let mut args = base_args(&input);
    args.trunc_q = 0;
    let config = run_config(args, tmp.path(), "out");
    let outputs = run_with_engines(config, Engines::builtin()).await?;

    assert_eq!(outputs.tracking.len(), 2);
    let s2 = &outputs.tracking[1];
    assert_eq!(s2.sample, "s2");
    assert_eq!(s2.input, 3);
    assert_eq!((s2.filtered, s2.denoised, s2.merged, s2.non_chimeric), (0, 0, 0, 0));

    // Sample 1 is unaffected and the table has no row for sample 2.
    assert_eq!(outputs.table.sample_ids(), &["s1".to_string()]);
    assert_eq!(outputs.tracking[0].non_chimeric, 5);
    assert_tracking_monotonic(&outputs);
    Ok(())
}

/// Filtering away every sample is a distinct fatal error.
#[tokio::test]
async fn test_all_samples_filtered_out_is_fatal() -> Result<()> {
    let tmp = tempdir()?;
    let input = tmp.path().join("raw");
    std::fs::create_dir_all(&input)?;

    let amplicon = random_amplicon(3, AMPLICON_LEN);
    synthetic_pair_files(&input, "s1", &[(amplicon.clone(), 3)], READ_LEN, 2.0, 1.0, 301)?;
    synthetic_pair_files(&input, "s2", &[(amplicon, 3)], READ_LEN, 2.0, 1.0, 302)?;

    let mut args = base_args(&input);
    args.trunc_q = 0;
    let config = run_config(args, tmp.path(), "out");
    let err = run_with_engines(config, Engines::builtin())
        .await
        .expect_err("pipeline must refuse to continue");
    assert!(matches!(err, PipelineError::EmptyFilterOutput));
    assert_eq!(err.exit_code(), 2);
    Ok(())
}

/// Scenario B: independent pooling with chimera method `none` leaves the
/// merged table untouched, column for column.
#[tokio::test]
async fn test_chimera_none_is_column_identical() -> Result<()> {
    let tmp = tempdir()?;
    let input = tmp.path().join("raw");
    std::fs::create_dir_all(&input)?;

    let a = random_amplicon(4, AMPLICON_LEN);
    let b = random_amplicon(5, AMPLICON_LEN);
    synthetic_pair_files(
        &input,
        "s1",
        &[(a.clone(), 6), (b.clone(), 3)],
        READ_LEN,
        35.0,
        3.0,
        401,
    )?;
    synthetic_pair_files(&input, "s2", &[(b.clone(), 4)], READ_LEN, 35.0, 3.0, 402)?;

    let config = run_config(base_args(&input), tmp.path(), "out");
    let outputs = run_with_engines(config, Engines::builtin()).await?;

    assert_eq!(outputs.table, outputs.pre_chimera_table);
    assert_eq!(outputs.table.n_sequences(), 2);
    for row in &outputs.tracking {
        assert_eq!(row.merged, row.non_chimeric);
    }
    assert_tracking_monotonic(&outputs);
    Ok(())
}

/// Rerunning the pipeline over identical inputs and configuration yields an
/// identical table and tracking set.
#[tokio::test]
async fn test_rerun_is_deterministic() -> Result<()> {
    let tmp = tempdir()?;
    let input = tmp.path().join("raw");
    std::fs::create_dir_all(&input)?;

    let a = random_amplicon(6, AMPLICON_LEN);
    let b = random_amplicon(7, AMPLICON_LEN);
    synthetic_pair_files(
        &input,
        "s1",
        &[(a.clone(), 5), (b.clone(), 2)],
        READ_LEN,
        35.0,
        3.0,
        501,
    )?;
    synthetic_pair_files(&input, "s2", &[(a, 2), (b, 6)], READ_LEN, 35.0, 3.0, 502)?;

    let first = run_with_engines(
        run_config(base_args(&input), tmp.path(), "out_a"),
        Engines::builtin(),
    )
    .await?;
    let second = run_with_engines(
        run_config(base_args(&input), tmp.path(), "out_b"),
        Engines::builtin(),
    )
    .await?;

    assert_eq!(first.table, second.table);
    assert_eq!(first.pre_chimera_table, second.pre_chimera_table);
    assert_eq!(first.tracking, second.tracking);
    Ok(())
}

/// Pseudo pooling rescues a singleton that independent pooling absorbs into
/// its abundant neighbor, because the variant recurs in another sample.
#[tokio::test]
async fn test_pseudo_pooling_rescues_recurring_singleton() -> Result<()> {
    let tmp = tempdir()?;
    let input = tmp.path().join("raw");
    std::fs::create_dir_all(&input)?;

    let a = random_amplicon(8, AMPLICON_LEN);
    // One substitution in the middle, seen by both mates.
    let mut b = a.clone();
    b[60] = if b[60] == b'A' { b'C' } else { b'A' };
    synthetic_pair_files(&input, "s1", &[(a.clone(), 5)], READ_LEN, 35.0, 3.0, 601)?;
    synthetic_pair_files(
        &input,
        "s2",
        &[(a.clone(), 3), (b.clone(), 1)],
        READ_LEN,
        35.0,
        3.0,
        602,
    )?;
    synthetic_pair_files(&input, "s3", &[(b.clone(), 5)], READ_LEN, 35.0, 3.0, 603)?;

    let independent = run_with_engines(
        run_config(base_args(&input), tmp.path(), "out_ind"),
        Engines::builtin(),
    )
    .await?;
    // The singleton b in s2 collapses into a.
    let s2_row = independent
        .table
        .sample_ids()
        .iter()
        .position(|s| s == "s2")
        .unwrap();
    let b_col = independent.table.sequences().iter().position(|s| *s == b).unwrap();
    assert_eq!(independent.table.count(s2_row, b_col), 0);

    let mut args = base_args(&input);
    args.pooling = PoolingMode::Pseudo;
    let pseudo = run_with_engines(
        run_config(args, tmp.path(), "out_pseudo"),
        Engines::builtin(),
    )
    .await?;
    let s2_row = pseudo.table.sample_ids().iter().position(|s| s == "s2").unwrap();
    let b_col = pseudo.table.sequences().iter().position(|s| *s == b).unwrap();
    assert_eq!(pseudo.table.count(s2_row, b_col), 1);
    assert_tracking_monotonic(&pseudo);
    Ok(())
}

/// Denoiser that records prior availability per call and, on priors-free
/// calls, returns a sentinel result that must never reach the merged table.
struct RecordingDenoiser {
    inner: AbundanceDenoiser,
    calls: Arc<Mutex<Vec<bool>>>,
}

impl DenoiseEngine for RecordingDenoiser {
    fn denoise(
        &self,
        derep: &Dereplicated,
        model: &ErrorModel,
        priors: Option<&PriorSet>,
    ) -> Result<DenoiseResult> {
        self.calls.lock().unwrap().push(priors.is_some());
        if priors.is_none() {
            let len = derep.units.first().map(|u| u.seq.len()).unwrap_or(4);
            return Ok(DenoiseResult {
                variants: vec![vec![b'T'; len]],
                unit_assignment: vec![Some(0); derep.units.len()],
                denoised_reads: derep.n_reads(),
            });
        }
        self.inner.denoise(derep, model, priors)
    }
}

/// Scenario C: with pseudo pooling over three samples, every priors-free
/// pass-1 call completes before any seeded pass-2 call starts, and the
/// pass-1 results themselves never surface in the output.
#[tokio::test]
async fn test_pseudo_pooling_runs_priors_pass_first() -> Result<()> {
    let tmp = tempdir()?;
    let input = tmp.path().join("raw");
    std::fs::create_dir_all(&input)?;

    let amplicon = random_amplicon(9, AMPLICON_LEN);
    synthetic_pair_files(&input, "s1", &[(amplicon.clone(), 4)], READ_LEN, 35.0, 3.0, 701)?;
    synthetic_pair_files(&input, "s2", &[(amplicon.clone(), 4)], READ_LEN, 35.0, 3.0, 702)?;
    synthetic_pair_files(&input, "s3", &[(amplicon.clone(), 4)], READ_LEN, 35.0, 3.0, 703)?;

    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut engines = Engines::builtin();
    engines.denoise = Arc::new(RecordingDenoiser {
        inner: AbundanceDenoiser,
        calls: calls.clone(),
    });

    let mut args = base_args(&input);
    args.pooling = PoolingMode::Pseudo;
    let config = run_config(args, tmp.path(), "out");
    let outputs = run_with_engines(config, engines).await?;

    // Three samples, two directions, two passes; workers run sequentially.
    let log = calls.lock().unwrap().clone();
    assert_eq!(log.len(), 12);
    assert!(log[..6].iter().all(|&seeded| !seeded), "pass 1 must run without priors");
    assert!(log[6..].iter().all(|&seeded| seeded), "pass 2 must be seeded");

    // Only second-pass results reach the merger.
    assert_eq!(outputs.table.n_sequences(), 1);
    assert_eq!(outputs.table.sequences()[0], amplicon);
    assert!(
        !outputs
            .table
            .sequences()
            .iter()
            .any(|s| s.iter().all(|&b| b == b'T')),
        "sentinel pass-1 variants leaked into the output table"
    );
    Ok(())
}

/// A sample whose mate files disagree fails its filter step; the zero policy
/// keeps its row aligned while the abort policy stops the run.
#[tokio::test]
async fn test_sample_failure_policy() -> Result<()> {
    let tmp = tempdir()?;
    let input = tmp.path().join("raw");
    std::fs::create_dir_all(&input)?;

    let amplicon = random_amplicon(10, AMPLICON_LEN);
    synthetic_pair_files(&input, "s1", &[(amplicon.clone(), 4)], READ_LEN, 35.0, 3.0, 801)?;
    // s2's reverse file is truncated to one record fewer.
    synthetic_pair_files(&input, "s2", &[(amplicon, 3)], READ_LEN, 35.0, 3.0, 802)?;
    truncate_last_record(&input.join("s2_R2.fastq"))?;

    let err = run_with_engines(
        run_config(base_args(&input), tmp.path(), "out_abort"),
        Engines::builtin(),
    )
    .await
    .expect_err("abort policy must stop the run");
    match err {
        PipelineError::SampleFailed { sample, stage, .. } => {
            assert_eq!(sample, "s2");
            assert_eq!(stage, "filter");
        }
        other => panic!("expected SampleFailed, got {other}"),
    }

    let mut args = base_args(&input);
    args.on_sample_error = SampleErrorPolicy::Zero;
    let outputs = run_with_engines(
        run_config(args, tmp.path(), "out_zero"),
        Engines::builtin(),
    )
    .await?;
    assert_eq!(outputs.tracking.len(), 2);
    let s2 = &outputs.tracking[1];
    assert_eq!(s2.sample, "s2");
    assert_eq!(
        (s2.filtered, s2.denoised, s2.merged, s2.non_chimeric),
        (0, 0, 0, 0)
    );
    assert_eq!(outputs.tracking[0].non_chimeric, 4);
    Ok(())
}

/// The binary-facing entry writes both tab-delimited outputs with their
/// fixed headers.
#[tokio::test]
async fn test_run_writes_tables() -> Result<()> {
    let tmp = tempdir()?;
    let input = tmp.path().join("raw");
    std::fs::create_dir_all(&input)?;

    let amplicon = random_amplicon(11, AMPLICON_LEN);
    synthetic_pair_files(&input, "s1", &[(amplicon.clone(), 4)], READ_LEN, 35.0, 3.0, 901)?;
    synthetic_pair_files(&input, "s2", &[(amplicon, 2)], READ_LEN, 35.0, 3.0, 902)?;

    let config = run_config(base_args(&input), tmp.path(), "out");
    run(config.clone()).await?;

    let table_text = std::fs::read_to_string(config.out_dir.join("asv_table.tsv"))?;
    assert!(table_text.starts_with("#OTU ID\ts1\ts2\n"));
    assert_eq!(table_text.lines().count(), 2);

    let tracking_text = std::fs::read_to_string(config.out_dir.join("read_tracking.tsv"))?;
    let mut lines = tracking_text.lines();
    assert_eq!(
        lines.next(),
        Some("sample-id\tinput\tfiltered\tdenoised\tmerged\tnon-chimeric")
    );
    assert_eq!(lines.next(), Some("s1\t4\t4\t4\t4\t4"));
    assert_eq!(lines.next(), Some("s2\t2\t2\t2\t2\t2"));
    Ok(())
}

/// Invalid settings are rejected before any processing starts.
#[tokio::test]
async fn test_invalid_config_rejected() -> Result<()> {
    let tmp = tempdir()?;
    let input = tmp.path().join("raw");
    std::fs::create_dir_all(&input)?;
    let amplicon = random_amplicon(12, AMPLICON_LEN);
    synthetic_pair_files(&input, "s1", &[(amplicon, 2)], READ_LEN, 35.0, 3.0, 1001)?;

    let mut args = base_args(&input);
    args.min_parent_fold = 0.5;
    let err = run_with_engines(
        run_config(args, tmp.path(), "out"),
        Engines::builtin(),
    )
    .await
    .expect_err("fold below 1 must be rejected");
    assert!(matches!(err, PipelineError::InvalidConfig(_)));

    let mut args = base_args(&input);
    args.trunc_len_f = 10;
    args.trim_left_f = 10;
    let err = run_with_engines(
        run_config(args, tmp.path(), "out2"),
        Engines::builtin(),
    )
    .await
    .expect_err("trim >= trunc must be rejected");
    assert!(matches!(err, PipelineError::InvalidConfig(_)));
    Ok(())
}

/// Drops the final FASTQ record (four lines) from a file.
fn truncate_last_record(path: &PathBuf) -> Result<()> {
    let text = std::fs::read_to_string(path)?;
    let lines: Vec<&str> = text.lines().collect();
    let kept = &lines[..lines.len() - 4];
    let mut out = kept.join("\n");
    out.push('\n');
    std::fs::write(path, out)?;
    Ok(())
}
