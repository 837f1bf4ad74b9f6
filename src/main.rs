mod cli;
mod config;
mod engines;
mod pipelines;
mod utils;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use std::{env, fs};

use anyhow::Result;
use env_logger::Builder;
use log::{LevelFilter, debug, error, info};
use tokio::sync::Semaphore;

use crate::cli::parse;
use crate::config::defs::{FILTERED_DIR_NAME, PipelineError, RunConfig};
use crate::pipelines::denoise_paired;

#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    println!("\n-------------\n AmpliSeq\n-------------\n");

    let cwd = env::current_dir()?;
    info!("The current directory is {:?}", cwd);

    let worker_permits = if args.threads == 0 {
        num_cpus::get()
    } else {
        args.threads
    };
    debug!("Using {} per-sample worker(s)", worker_permits);

    let out_dir = setup_output_dir(&args, &cwd)?;
    let filtered_dir = match &args.filtered_dir {
        Some(dir) => {
            let path = PathBuf::from(dir);
            if path.is_absolute() { path } else { cwd.join(path) }
        }
        None => out_dir.join(FILTERED_DIR_NAME),
    };

    let module = args.module.clone();
    let run_config = Arc::new(RunConfig {
        cwd,
        out_dir,
        filtered_dir,
        worker_semaphore: Arc::new(Semaphore::new(worker_permits)),
        worker_permits,
        args,
    });

    if let Err(e) = match module.as_str() {
        "denoise_paired" => denoise_paired::run(run_config).await,
        _ => Err(PipelineError::InvalidConfig(format!(
            "Invalid module: {}",
            module
        ))),
    } {
        error!(
            "Pipeline failed: {} at {} milliseconds.",
            e,
            run_start.elapsed().as_millis()
        );
        std::process::exit(e.exit_code());
    }

    println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}

/// Sets up the output directory.
/// If `out_dir` is specified from args, uses it; otherwise creates a
/// directory named `denoise_YYYYMMDD` in the current working directory.
/// Ensures the directory exists.
fn setup_output_dir(args: &cli::args::Arguments, cwd: &PathBuf) -> Result<PathBuf> {
    let out_dir = match &args.out_dir {
        Some(out) => {
            let path = PathBuf::from(out);
            if path.is_absolute() { path } else { cwd.join(path) }
        }
        None => {
            let timestamp = chrono::Local::now().format("%Y%m%d");
            cwd.join(format!("denoise_{}", timestamp))
        }
    };
    fs::create_dir_all(&out_dir)?;
    Ok(out_dir)
}
