use anyhow::{Result, bail};
use log::info;
use serde::Serialize;
use std::time::Instant;

use crate::forward::{ForwardTable, forward_algorithm};
use crate::matrices::{BlockMatrices, MatrixList};
use crate::model::ArgModel;
use crate::seq::Sequences;
use crate::states::{State, ThreadMode};
use crate::traceback::{Sampler, max_traceback, stochastic_traceback};
use crate::tree::LocalTrees;

/// Decoded thread: state index per site and the `(node, time)` it names.
/// `None` marks sites whose local tree leaves no choice.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadPath {
    pub start_coord: usize,
    pub path: Vec<usize>,
    pub states: Vec<Option<State>>,
}

pub fn path_states(list: &MatrixList<'_>, path: &[usize]) -> Result<Vec<Option<State>>> {
    if path.len() != list.length() {
        bail!(
            "path has {} sites but the blocks cover {}",
            path.len(),
            list.length()
        );
    }
    let mut out = Vec::with_capacity(path.len());
    for block in &list.blocks {
        for (pos, &k) in path.iter().enumerate().take(block.end()).skip(block.start) {
            if block.nstates() == 0 {
                out.push(None);
                continue;
            }
            let Some(&state) = block.states.get(k) else {
                bail!("state index {k} at site {pos} outside {} states", block.nstates());
            };
            out.push(Some(state));
        }
    }
    Ok(out)
}

fn make_path(list: &MatrixList<'_>, path: Vec<usize>) -> Result<ThreadPath> {
    let states = path_states(list, &path)?;
    Ok(ThreadPath {
        start_coord: list.start_coord,
        path,
        states,
    })
}

fn state_index(block: &BlockMatrices<'_>, state: State, which: &str) -> Result<Option<usize>> {
    if block.nstates() == 0 {
        return Ok(None);
    }
    match block.lookup.lookup(state.node, state.time) {
        Some(k) => Ok(Some(k)),
        None => bail!(
            "{which} state (node {}, time {}) is not a valid state of its block",
            state.node,
            state.time
        ),
    }
}

pub fn thread_forward<'a>(
    trees: &'a LocalTrees,
    model: &ArgModel,
    seqs: &Sequences,
    mode: ThreadMode,
    prior: Option<&[f64]>,
    show_progress: bool,
) -> Result<(MatrixList<'a>, ForwardTable)> {
    let list = MatrixList::build(trees, model, seqs, mode)?;
    let fwd = forward_algorithm(&list, model, prior, show_progress)?;
    Ok((list, fwd))
}

pub fn sample_thread<S: Sampler + ?Sized>(
    trees: &LocalTrees,
    model: &ArgModel,
    seqs: &Sequences,
    mode: ThreadMode,
    sampler: &mut S,
    show_progress: bool,
) -> Result<ThreadPath> {
    cond_sample_thread(trees, model, seqs, mode, sampler, None, None, show_progress)
}

/// Sample a thread path whose first and/or last state is fixed.
#[allow(clippy::too_many_arguments)]
pub fn cond_sample_thread<S: Sampler + ?Sized>(
    trees: &LocalTrees,
    model: &ArgModel,
    seqs: &Sequences,
    mode: ThreadMode,
    sampler: &mut S,
    start: Option<State>,
    end: Option<State>,
    show_progress: bool,
) -> Result<ThreadPath> {
    let timer = Instant::now();
    let list = MatrixList::build(trees, model, seqs, mode)?;
    let (Some(first), Some(last)) = (list.blocks.first(), list.blocks.last()) else {
        bail!("no blocks to thread through");
    };

    let prior = match start {
        Some(s) => state_index(first, s, "start")?.map(|k| {
            let mut p = vec![0.0; first.width()];
            p[k] = 1.0;
            p
        }),
        None => None,
    };
    let last_state = match end {
        Some(s) => state_index(last, s, "end")?,
        None => None,
    };

    let fwd = forward_algorithm(&list, model, prior.as_deref(), show_progress)?;
    let path = stochastic_traceback(&list, &fwd, sampler, last_state)?;
    info!(
        "sample thread: {} sites, {} blocks in {:.3?}",
        path.len(),
        list.num_blocks(),
        timer.elapsed()
    );
    make_path(&list, path)
}

pub fn max_thread(
    trees: &LocalTrees,
    model: &ArgModel,
    seqs: &Sequences,
    mode: ThreadMode,
    show_progress: bool,
) -> Result<ThreadPath> {
    let timer = Instant::now();
    let (list, fwd) = thread_forward(trees, model, seqs, mode, None, show_progress)?;
    let path = max_traceback(&list, &fwd, None)?;
    info!(
        "max thread: {} sites, {} blocks in {:.3?}",
        path.len(),
        list.num_blocks(),
        timer.elapsed()
    );
    make_path(&list, path)
}
