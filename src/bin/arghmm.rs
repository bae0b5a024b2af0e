use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::{info, warn};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde_json::json;
use std::path::PathBuf;

use arghmm_rs::ThreadMode;
use arghmm_rs::io::job::{Job, load_job};
use arghmm_rs::io::write_json;
use arghmm_rs::matrices::MatrixList;
use arghmm_rs::oracle::{assert_emissions, assert_emissions_internal};
use arghmm_rs::parsimony::count_noncompat_trees;
use arghmm_rs::progress;
use arghmm_rs::states::get_coal_states;
use arghmm_rs::thread::{max_thread, sample_thread, thread_forward};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Task {
    /// Emission matrix of every block
    Emit,
    /// Normalized forward table
    Forward,
    /// Posterior sample of the thread path
    Sample,
    /// Maximum a posteriori thread path
    Max,
    /// Sites incompatible with their local tree
    Noncompat,
    /// Compare fast emissions with the reference computation
    CheckEmit,
}

#[derive(Parser, Debug)]
#[command(name = "arghmm")]
#[command(about = "Thread a sequence through local trees of an ARG with an HMM", long_about = None)]
struct Cli {
    /// Job file (JSON, optionally .json.gz)
    job: PathBuf,
    /// Output JSON path
    output: PathBuf,
    #[arg(long, value_enum, default_value_t = Task::Sample)]
    task: Task,
    #[arg(long, value_enum, default_value_t = ThreadMode::Leaf)]
    mode: ThreadMode,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    no_progress: bool,
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let job = if cli.no_progress {
        load_job(&cli.job)?
    } else {
        let pb = progress::spinner("IO", "Reading job");
        let job = load_job(&cli.job)?;
        pb.finish_and_clear();
        job
    };
    info!(
        "job: {} sequences, {} sites, {} blocks",
        job.seqs.num_seqs(),
        job.seqs.len(),
        job.trees.num_trees()
    );

    let show_progress = !cli.no_progress;
    let out = match cli.task {
        Task::Emit => run_emit(&job, cli.mode)?,
        Task::Forward => {
            let (_, fwd) =
                thread_forward(&job.trees, &job.model, &job.seqs, cli.mode, None, show_progress)?;
            serde_json::to_value(&fwd)?
        }
        Task::Sample => {
            let mut rng = match cli.seed {
                Some(seed) => SmallRng::seed_from_u64(seed),
                None => SmallRng::from_entropy(),
            };
            let path = sample_thread(
                &job.trees,
                &job.model,
                &job.seqs,
                cli.mode,
                &mut rng,
                show_progress,
            )?;
            serde_json::to_value(&path)?
        }
        Task::Max => {
            let path = max_thread(&job.trees, &job.model, &job.seqs, cli.mode, show_progress)?;
            serde_json::to_value(&path)?
        }
        Task::Noncompat => {
            let n = count_noncompat_trees(&job.trees, &job.seqs)?;
            json!({ "noncompat": n })
        }
        Task::CheckEmit => {
            let ok = check_emit(&job, cli.mode)?;
            if !ok {
                warn!("fast emissions disagree with the reference computation");
            }
            json!({ "ok": ok })
        }
    };

    write_json(&cli.output, &out).context("failed to write output")?;
    println!("Output: {}", cli.output.display());
    Ok(())
}

fn run_emit(job: &Job, mode: ThreadMode) -> Result<serde_json::Value> {
    let list = MatrixList::build(&job.trees, &job.model, &job.seqs, mode)?;
    let blocks: Vec<_> = list
        .blocks
        .iter()
        .map(|b| {
            let rows: Vec<Vec<f64>> = b.emit.rows().into_iter().map(|r| r.to_vec()).collect();
            json!({
                "start": list.start_coord + b.start,
                "states": &b.states,
                "emit": rows,
            })
        })
        .collect();
    Ok(json!({ "blocks": blocks }))
}

fn check_emit(job: &Job, mode: ThreadMode) -> Result<bool> {
    let ntimes = job.model.ntimes();
    let offset = job.trees.start_coord;
    let mut all_ok = true;
    for (i, (start, end, block)) in job.trees.iter_blocks().enumerate() {
        let view = job.seqs.view(start - offset..end - offset)?;
        let states = get_coal_states(&block.tree, ntimes, mode);
        let ok = match mode {
            ThreadMode::Leaf => assert_emissions(&states, &block.tree, &view, &job.model)?,
            ThreadMode::Internal => {
                assert_emissions_internal(&states, &block.tree, &view, &job.model)?
            }
        };
        if !ok {
            warn!("emission check failed in block {i}");
            all_ok = false;
        }
    }
    Ok(all_ok)
}
