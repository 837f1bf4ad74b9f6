//! Paired-end denoising pipeline: filter, learn error models, denoise,
//! merge, tabulate, remove chimeras, and account for every read.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use futures::future::try_join_all;
use fxhash::FxHashMap;
use log::{debug, error, info};
use tokio::task::JoinHandle;

use crate::cli::{Arguments, PoolingMode, SampleErrorPolicy};
use crate::config::defs::{
    ASV_TABLE_FILENAME, FORWARD_FILT_SUFFIX, PipelineError, REVERSE_FILT_SUFFIX, RunConfig,
    STAGE_DENOISE, STAGE_DEREPLICATE, STAGE_FILTER, STAGE_MERGE, TRACKING_FILENAME,
};
use crate::engines::{
    DenoiseResult, Direction, Engines, ErrorModel, FilterParams, FilterSummary, MergedResult,
    PriorSet, denoise::accumulate_variant_totals,
};
use crate::utils::fastq::{Dereplicated, dereplicate, paired_base, read_fastq_pairs};
use crate::utils::file::suffixed_path;
use crate::utils::table::{SequenceTable, TrackingRow, write_tracking_tsv};

/// One discovered sample, carried by name through every stage so row
/// alignment never depends on positional bookkeeping.
#[derive(Debug, Clone)]
pub struct Sample {
    pub name: String,
    pub raw_f: PathBuf,
    pub raw_r: PathBuf,
    pub filtered_f: PathBuf,
    pub filtered_r: PathBuf,
}

/// Dereplicated filtered reads for one sample, shared across the denoising
/// passes and the merger.
#[derive(Debug)]
pub struct SampleReads {
    pub forward: Dereplicated,
    pub reverse: Dereplicated,
}

/// Both directions' denoising output for one sample.
#[derive(Debug, Clone)]
pub struct SampleDenoise {
    pub forward: DenoiseResult,
    pub reverse: DenoiseResult,
}

/// Everything the pipeline produces besides the files it writes.
#[derive(Debug, Clone)]
pub struct PipelineOutputs {
    pub pre_chimera_table: SequenceTable,
    pub table: SequenceTable,
    pub tracking: Vec<TrackingRow>,
}

/// Entry point for the `denoise_paired` module: runs the pipeline with the
/// built-in engines and writes the abundance and tracking tables.
pub async fn run(config: Arc<RunConfig>) -> Result<(), PipelineError> {
    println!("\n-------------\n Denoise Paired\n-------------\n");

    let outputs = run_with_engines(config.clone(), Engines::builtin()).await?;

    let table_path = config.out_dir.join(ASV_TABLE_FILENAME);
    outputs
        .table
        .write_tsv(&table_path)
        .map_err(|e| PipelineError::Io(e.to_string()))?;
    info!(
        "Wrote {} sequence variants x {} samples to {}",
        outputs.table.n_sequences(),
        outputs.table.n_samples(),
        table_path.display()
    );

    let tracking_path = config.out_dir.join(TRACKING_FILENAME);
    write_tracking_tsv(&outputs.tracking, &tracking_path)
        .map_err(|e| PipelineError::Io(e.to_string()))?;
    info!(
        "Wrote read tracking for {} samples to {}",
        outputs.tracking.len(),
        tracking_path.display()
    );

    Ok(())
}

/// Runs the whole pipeline against an arbitrary engine bundle and returns
/// the tables instead of writing them. Tests drive this directly.
pub async fn run_with_engines(
    config: Arc<RunConfig>,
    engines: Engines,
) -> Result<PipelineOutputs, PipelineError> {
    validate_config(&config)?;

    let samples = discover_samples(&config)?;
    info!(
        "Discovered {} sample pair(s); {} per-sample worker(s)",
        samples.len(),
        config.worker_permits
    );

    fs::create_dir_all(&config.out_dir).map_err(|e| PipelineError::Io(e.to_string()))?;
    fs::create_dir_all(&config.filtered_dir).map_err(|e| PipelineError::Io(e.to_string()))?;

    // Stage 1: linked-pair filtering, one task per sample.
    let summaries = filter_stage(&config, &engines, &samples).await?;
    for (sample, summary) in samples.iter().zip(summaries.iter()) {
        debug!(
            "Sample {}: {} of {} read pairs passed the filter",
            sample.name, summary.reads_out, summary.reads_in
        );
    }

    let survivors: Vec<Sample> = samples
        .iter()
        .zip(summaries.iter())
        .filter(|(_, summary)| summary.reads_out > 0)
        .map(|(sample, _)| sample.clone())
        .collect();
    if survivors.is_empty() {
        return Err(PipelineError::EmptyFilterOutput);
    }
    info!(
        "{} of {} samples retained reads after filtering",
        survivors.len(),
        samples.len()
    );

    // Stage 2: one shared error model per direction. Nothing proceeds until
    // both models exist.
    let (model_f, model_r) = learn_stage(&config, &engines, &survivors).await?;

    // Dereplicate each surviving sample once; both denoising passes and the
    // merger reuse the same units.
    let dereps = derep_stage(&config, &survivors).await?;

    // Stage 3: denoising. Pseudo pooling first runs a priors-gathering pass
    // over every sample; its per-sample results are discarded and only the
    // pooled prior sets feed the mandatory second pass.
    let (priors_f, priors_r) = match config.args.pooling {
        PoolingMode::Independent => (None, None),
        PoolingMode::Pseudo => {
            info!("Pseudo pooling: gathering priors across all samples");
            let first_pass =
                denoise_stage(&config, &engines, &survivors, &dereps, &model_f, &model_r, None, None)
                    .await?;
            let (priors_f, priors_r) = collect_priors(&dereps, &first_pass);
            info!(
                "Priors: {} forward and {} reverse sequence variants",
                priors_f.len(),
                priors_r.len()
            );
            (Some(Arc::new(priors_f)), Some(Arc::new(priors_r)))
        }
    };
    let denoised = denoise_stage(
        &config, &engines, &survivors, &dereps, &model_f, &model_r, priors_f, priors_r,
    )
    .await?;

    // Stage 4: merge forward and reverse calls per sample.
    let merged = merge_stage(&config, &engines, &survivors, &dereps, &denoised).await?;

    let mut denoised_counts: FxHashMap<String, u64> = FxHashMap::default();
    for (sample, slot) in survivors.iter().zip(denoised.iter()) {
        if let Some(result) = slot {
            denoised_counts.insert(sample.name.clone(), result.forward.denoised_reads);
        }
    }

    // Stage 5: the global sample x variant table.
    let rows: Vec<(String, MergedResult)> = survivors
        .iter()
        .zip(merged.into_iter())
        .filter_map(|(sample, slot)| slot.map(|result| (sample.name.clone(), result)))
        .collect();
    let pre_chimera_table = SequenceTable::from_merged(&rows);
    info!(
        "Merged table: {} sequence variants across {} samples",
        pre_chimera_table.n_sequences(),
        pre_chimera_table.n_samples()
    );

    // Stage 6: chimera removal over the finished table.
    let table = engines
        .chimera
        .remove_chimeras(
            &pre_chimera_table,
            config.args.chimera_method,
            config.args.min_parent_fold,
        )
        .map_err(|e| PipelineError::StageFailed {
            stage: "remove_chimeras".to_string(),
            error: e.to_string(),
        })?;
    info!(
        "{} of {} sequence variants retained after chimera removal",
        table.n_sequences(),
        pre_chimera_table.n_sequences()
    );

    let tracking = build_tracking(&samples, &summaries, &denoised_counts, &pre_chimera_table, &table);

    Ok(PipelineOutputs {
        pre_chimera_table,
        table,
        tracking,
    })
}

fn validate_config(config: &RunConfig) -> Result<(), PipelineError> {
    let args = &config.args;
    if args.min_parent_fold < 1.0 {
        return Err(PipelineError::InvalidConfig(format!(
            "min_parent_fold must be >= 1, got {}",
            args.min_parent_fold
        )));
    }
    if args.min_overlap == 0 {
        return Err(PipelineError::InvalidConfig(
            "min_overlap must be at least 1".to_string(),
        ));
    }
    if args.trunc_len_f > 0 && args.trim_left_f >= args.trunc_len_f {
        return Err(PipelineError::InvalidConfig(format!(
            "trim_left_f ({}) must be smaller than trunc_len_f ({})",
            args.trim_left_f, args.trunc_len_f
        )));
    }
    if args.trunc_len_r > 0 && args.trim_left_r >= args.trunc_len_r {
        return Err(PipelineError::InvalidConfig(format!(
            "trim_left_r ({}) must be smaller than trunc_len_r ({})",
            args.trim_left_r, args.trunc_len_r
        )));
    }

    let input_dir = input_dir_path(config);
    if !input_dir.is_dir() {
        return Err(PipelineError::InvalidConfig(format!(
            "input directory {} does not exist",
            input_dir.display()
        )));
    }
    Ok(())
}

fn input_dir_path(config: &RunConfig) -> PathBuf {
    let raw = PathBuf::from(&config.args.input_dir);
    if raw.is_absolute() {
        raw
    } else {
        config.cwd.join(raw)
    }
}

/// Pairs raw FASTQ files by filename tag and derives stable sample names.
/// Sample order is lexicographic by name and fixed for the whole run.
fn discover_samples(config: &RunConfig) -> Result<Vec<Sample>, PipelineError> {
    let input_dir = input_dir_path(config);
    let entries = fs::read_dir(&input_dir).map_err(|e| PipelineError::Io(e.to_string()))?;

    let mut file_names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| PipelineError::Io(e.to_string()))?;
        if entry.path().is_file() {
            if let Some(name) = entry.file_name().to_str() {
                file_names.push(name.to_string());
            }
        }
    }
    let present: HashSet<&str> = file_names.iter().map(|s| s.as_str()).collect();

    let mut samples = Vec::new();
    for name in &file_names {
        let Some(pair) = paired_base(name) else {
            continue;
        };
        if !present.contains(pair.reverse_file.as_str()) {
            return Err(PipelineError::InvalidConfig(format!(
                "forward file {} has no reverse mate {}",
                name, pair.reverse_file
            )));
        }
        samples.push(Sample {
            name: pair.sample.clone(),
            raw_f: input_dir.join(name),
            raw_r: input_dir.join(&pair.reverse_file),
            filtered_f: suffixed_path(&config.filtered_dir, &pair.sample, FORWARD_FILT_SUFFIX),
            filtered_r: suffixed_path(&config.filtered_dir, &pair.sample, REVERSE_FILT_SUFFIX),
        });
    }

    samples.sort_by(|a, b| a.name.cmp(&b.name));
    for pair in samples.windows(2) {
        if pair[0].name == pair[1].name {
            return Err(PipelineError::InvalidConfig(format!(
                "duplicate sample name '{}' in input directory",
                pair[0].name
            )));
        }
    }
    if samples.is_empty() {
        return Err(PipelineError::InvalidConfig(format!(
            "no paired FASTQ files found in {}",
            input_dir.display()
        )));
    }
    Ok(samples)
}

fn filter_params(args: &Arguments) -> FilterParams {
    FilterParams {
        trunc_len_f: args.trunc_len_f,
        trunc_len_r: args.trunc_len_r,
        trim_left_f: args.trim_left_f,
        trim_left_r: args.trim_left_r,
        max_ee_f: args.max_ee_f,
        max_ee_r: args.max_ee_r,
        trunc_q: args.trunc_q,
    }
}

/// Per-sample stage task: the inner `Ok(None)` marks a sample already
/// dropped by an earlier stage, which passes through without re-triggering
/// the failure policy.
type SampleTask<T> = JoinHandle<Result<(String, Result<Option<T>>), PipelineError>>;

/// Joins one stage's per-sample tasks, applying the configured failure
/// policy: abort on the first failure, or log it and leave a `None` slot so
/// the sample surfaces as zeros instead of disappearing.
async fn join_sample_stage<T>(
    config: &RunConfig,
    stage: &str,
    tasks: Vec<SampleTask<T>>,
) -> Result<Vec<Option<T>>, PipelineError> {
    let joined = try_join_all(tasks)
        .await
        .map_err(|e| PipelineError::Other(e.into()))?;

    let mut slots = Vec::with_capacity(joined.len());
    for item in joined {
        let (sample, result) = item?;
        match result {
            Ok(value) => slots.push(value),
            Err(e) => {
                let failure = PipelineError::SampleFailed {
                    sample,
                    stage: stage.to_string(),
                    error: e.to_string(),
                };
                match config.args.on_sample_error {
                    SampleErrorPolicy::Abort => return Err(failure),
                    SampleErrorPolicy::Zero => {
                        error!("{failure}; continuing with a zero-count row");
                        slots.push(None);
                    }
                }
            }
        }
    }
    Ok(slots)
}

async fn filter_stage(
    config: &Arc<RunConfig>,
    engines: &Engines,
    samples: &[Sample],
) -> Result<Vec<FilterSummary>, PipelineError> {
    let params = filter_params(&config.args);
    let mut tasks = Vec::with_capacity(samples.len());
    for sample in samples {
        let semaphore = config.worker_semaphore.clone();
        let engine = engines.filter.clone();
        let sample = sample.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| PipelineError::Other(e.into()))?;
            let name = sample.name.clone();
            let result = tokio::task::spawn_blocking(move || {
                engine
                    .filter(
                        &sample.raw_f,
                        &sample.raw_r,
                        &sample.filtered_f,
                        &sample.filtered_r,
                        &params,
                    )
                    .map(Some)
            })
            .await
            .map_err(|e| PipelineError::Other(e.into()))?;
            Ok((name, result))
        }));
    }

    let slots = join_sample_stage(config, STAGE_FILTER, tasks).await?;
    // A filter failure under the zero policy counts as a wiped-out sample.
    Ok(slots.into_iter().map(|s| s.unwrap_or_default()).collect())
}

async fn learn_stage(
    config: &Arc<RunConfig>,
    engines: &Engines,
    survivors: &[Sample],
) -> Result<(Arc<ErrorModel>, Arc<ErrorModel>), PipelineError> {
    let forward_files: Vec<PathBuf> = survivors.iter().map(|s| s.filtered_f.clone()).collect();
    let reverse_files: Vec<PathBuf> = survivors.iter().map(|s| s.filtered_r.clone()).collect();
    let target = config.args.n_reads_learn;

    let forward_engine = engines.error_model.clone();
    let reverse_engine = engines.error_model.clone();
    let forward_task = tokio::task::spawn_blocking(move || {
        forward_engine.learn(Direction::Forward, &forward_files, target)
    });
    let reverse_task = tokio::task::spawn_blocking(move || {
        reverse_engine.learn(Direction::Reverse, &reverse_files, target)
    });

    let (forward, reverse) = tokio::try_join!(forward_task, reverse_task)
        .map_err(|e| PipelineError::Other(e.into()))?;
    let model_f = forward.map_err(|e| PipelineError::StageFailed {
        stage: "learn_errors_forward".to_string(),
        error: e.to_string(),
    })?;
    let model_r = reverse.map_err(|e| PipelineError::StageFailed {
        stage: "learn_errors_reverse".to_string(),
        error: e.to_string(),
    })?;
    info!(
        "Learned error models from {} forward and {} reverse reads",
        model_f.reads_used(),
        model_r.reads_used()
    );
    Ok((Arc::new(model_f), Arc::new(model_r)))
}

async fn derep_stage(
    config: &Arc<RunConfig>,
    survivors: &[Sample],
) -> Result<Vec<Option<Arc<SampleReads>>>, PipelineError> {
    let mut tasks = Vec::with_capacity(survivors.len());
    for sample in survivors {
        let semaphore = config.worker_semaphore.clone();
        let sample = sample.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| PipelineError::Other(e.into()))?;
            let name = sample.name.clone();
            let result = tokio::task::spawn_blocking(move || {
                let pairs = read_fastq_pairs(&sample.filtered_f, &sample.filtered_r)?;
                let (fwd, rev): (Vec<_>, Vec<_>) = pairs.into_iter().unzip();
                Ok(Some(Arc::new(SampleReads {
                    forward: dereplicate(&fwd),
                    reverse: dereplicate(&rev),
                })))
            })
            .await
            .map_err(|e| PipelineError::Other(e.into()))?;
            Ok((name, result))
        }));
    }
    join_sample_stage(config, STAGE_DEREPLICATE, tasks).await
}

#[allow(clippy::too_many_arguments)]
async fn denoise_stage(
    config: &Arc<RunConfig>,
    engines: &Engines,
    survivors: &[Sample],
    dereps: &[Option<Arc<SampleReads>>],
    model_f: &Arc<ErrorModel>,
    model_r: &Arc<ErrorModel>,
    priors_f: Option<Arc<PriorSet>>,
    priors_r: Option<Arc<PriorSet>>,
) -> Result<Vec<Option<SampleDenoise>>, PipelineError> {
    let mut tasks = Vec::with_capacity(survivors.len());
    for (sample, slot) in survivors.iter().zip(dereps.iter()) {
        let semaphore = config.worker_semaphore.clone();
        let engine = engines.denoise.clone();
        let model_f = model_f.clone();
        let model_r = model_r.clone();
        let priors_f = priors_f.clone();
        let priors_r = priors_r.clone();
        let name = sample.name.clone();
        let slot = slot.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| PipelineError::Other(e.into()))?;
            let Some(reads) = slot else {
                // Lost in an earlier stage; keep the slot aligned.
                return Ok((name, Ok(None)));
            };
            let result = tokio::task::spawn_blocking(move || {
                let forward = engine.denoise(&reads.forward, &model_f, priors_f.as_deref())?;
                let reverse = engine.denoise(&reads.reverse, &model_r, priors_r.as_deref())?;
                Ok(Some(SampleDenoise { forward, reverse }))
            })
            .await
            .map_err(|e| PipelineError::Other(e.into()))?;
            Ok((name, result))
        }));
    }
    join_sample_stage(config, STAGE_DENOISE, tasks).await
}

async fn merge_stage(
    config: &Arc<RunConfig>,
    engines: &Engines,
    survivors: &[Sample],
    dereps: &[Option<Arc<SampleReads>>],
    denoised: &[Option<SampleDenoise>],
) -> Result<Vec<Option<MergedResult>>, PipelineError> {
    let min_overlap = config.args.min_overlap;
    let mut tasks = Vec::with_capacity(survivors.len());
    for ((sample, derep_slot), denoise_slot) in
        survivors.iter().zip(dereps.iter()).zip(denoised.iter())
    {
        let semaphore = config.worker_semaphore.clone();
        let engine = engines.merge.clone();
        let name = sample.name.clone();
        let derep_slot = derep_slot.clone();
        let denoise_slot = denoise_slot.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| PipelineError::Other(e.into()))?;
            let (Some(reads), Some(calls)) = (derep_slot, denoise_slot) else {
                return Ok((name, Ok(None)));
            };
            let result = tokio::task::spawn_blocking(move || {
                engine
                    .merge(
                        &calls.forward,
                        &reads.forward,
                        &calls.reverse,
                        &reads.reverse,
                        min_overlap,
                    )
                    .map(Some)
            })
            .await
            .map_err(|e| PipelineError::Other(e.into()))?;
            Ok((name, result))
        }));
    }
    join_sample_stage(config, STAGE_MERGE, tasks).await
}

/// Pools first-pass variant abundances across every sample into one prior
/// set per direction.
fn collect_priors(
    dereps: &[Option<Arc<SampleReads>>],
    first_pass: &[Option<SampleDenoise>],
) -> (PriorSet, PriorSet) {
    let mut totals_f: FxHashMap<Vec<u8>, u64> = FxHashMap::default();
    let mut totals_r: FxHashMap<Vec<u8>, u64> = FxHashMap::default();
    for (derep_slot, denoise_slot) in dereps.iter().zip(first_pass.iter()) {
        if let (Some(reads), Some(calls)) = (derep_slot, denoise_slot) {
            accumulate_variant_totals(&mut totals_f, &calls.forward, &reads.forward);
            accumulate_variant_totals(&mut totals_r, &calls.reverse, &reads.reverse);
        }
    }
    (
        PriorSet::from_totals(&totals_f),
        PriorSet::from_totals(&totals_r),
    )
}

/// Reconstructs the per-sample stage survival counts. Samples with no
/// filtered reads, or lost to a tolerated failure, are zero-filled rather
/// than omitted; merged and non-chimeric come from the respective table row
/// sums, so chimera removal can only shrink them.
fn build_tracking(
    samples: &[Sample],
    summaries: &[FilterSummary],
    denoised_counts: &FxHashMap<String, u64>,
    pre_chimera: &SequenceTable,
    post_chimera: &SequenceTable,
) -> Vec<TrackingRow> {
    samples
        .iter()
        .zip(summaries.iter())
        .map(|(sample, summary)| {
            if summary.reads_out == 0 {
                return TrackingRow::zeroed(&sample.name, summary.reads_in);
            }
            TrackingRow {
                sample: sample.name.clone(),
                input: summary.reads_in,
                filtered: summary.reads_out,
                denoised: denoised_counts.get(&sample.name).copied().unwrap_or(0),
                merged: pre_chimera.row_sum_by_sample(&sample.name).unwrap_or(0),
                non_chimeric: post_chimera.row_sum_by_sample(&sample.name).unwrap_or(0),
            }
        })
        .collect()
}
