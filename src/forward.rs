use anyhow::{Result, bail};
use log::{debug, info};
use serde::Serialize;
use std::time::Instant;

use crate::matrices::{BlockMatrices, MatrixList};
use crate::model::ArgModel;
use crate::progress;
use crate::states::state_priors;
use crate::trans::TransMatrixSwitch;

/// Normalized forward probabilities, one column per site. Column widths
/// follow the state count of the block each site belongs to.
#[derive(Debug, Clone, Serialize)]
pub struct ForwardTable {
    pub start_coord: usize,
    pub cols: Vec<Vec<f64>>,
}

impl ForwardTable {
    pub fn len(&self) -> usize {
        self.cols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cols.is_empty()
    }

    pub fn col(&self, i: usize) -> &[f64] {
        &self.cols[i]
    }

    pub fn last(&self) -> Option<&[f64]> {
        self.cols.last().map(Vec::as_slice)
    }
}

fn normalize(col: &mut [f64], pos: usize) -> Result<()> {
    let norm: f64 = col.iter().sum();
    if !(norm > 0.0) || !norm.is_finite() {
        bail!("forward column at site {pos} has invalid normalization factor {norm}");
    }
    for v in col.iter_mut() {
        *v /= norm;
    }
    Ok(())
}

/// Advance the forward table through `cols` using the block-local
/// transition. `cols[0]` is the site `offset` positions into the block
/// and is computed from `prev`.
///
/// The transition is applied through per-time sums: a `(ntimes-1)^2`
/// matrix of time-to-time mass plus, for each destination state, a
/// correction over the source states on the same branch.
pub fn forward_block(
    block: &BlockMatrices<'_>,
    prev: &[f64],
    cols: &mut [Vec<f64>],
    offset: usize,
) -> Result<()> {
    let nstates = block.nstates();
    if nstates == 0 {
        for col in cols.iter_mut() {
            *col = vec![1.0];
        }
        return Ok(());
    }
    if prev.len() != nstates {
        bail!(
            "forward column of {} states cannot seed a block of {nstates} states",
            prev.len()
        );
    }

    let trans = &block.trans;
    let nt = trans.ntimes() - 1;
    let mut tmatrix = vec![0.0; nt * nt];
    for a in 0..nt {
        for b in 0..nt {
            tmatrix[a * nt + b] = trans.get_time(a, b, 0, false);
        }
    }
    let mut tmatrix2 = vec![0.0; nt * nstates];
    for (k, s) in block.states.iter().enumerate() {
        let c = block.tree.age(s.node);
        for a in 0..nt {
            tmatrix2[a * nstates + k] =
                trans.get_time(a, s.time, c, true) - trans.get_time(a, s.time, c, false);
        }
    }
    let ranges: Vec<(usize, usize)> = block
        .states
        .iter()
        .map(|s| {
            block
                .lookup
                .range(s.node)
                .map_or((0, 0), |(start, _, count)| (start, start + count))
        })
        .collect();

    let mut fgroups = vec![0.0; nt];
    let mut tsum = vec![0.0; nt];
    let mut last: Vec<f64> = prev.to_vec();

    for (i, col) in cols.iter_mut().enumerate() {
        fgroups.iter_mut().for_each(|v| *v = 0.0);
        for (j, s) in block.states.iter().enumerate() {
            fgroups[s.time] += last[j];
        }
        for b in 0..nt {
            let mut sum = 0.0;
            for a in 0..nt {
                sum += fgroups[a] * tmatrix[a * nt + b];
            }
            tsum[b] = sum;
        }

        let site = offset + i;
        col.clear();
        col.resize(nstates, 0.0);
        for (k, s) in block.states.iter().enumerate() {
            let (lo, hi) = ranges[k];
            let mut v = tsum[s.time];
            for j in lo..hi {
                v += last[j] * tmatrix2[block.states[j].time * nstates + k];
            }
            col[k] = v * block.emit[[site, k]];
        }
        normalize(col, block.start + site)?;
        last.copy_from_slice(col);
    }
    Ok(())
}

pub fn forward_switch(prev: &[f64], switch: &TransMatrixSwitch, emit: &[f64], pos: usize) -> Result<Vec<f64>> {
    let n1 = switch.nstates1.max(1);
    let n2 = switch.nstates2.max(1);
    if prev.len() != n1 || emit.len() != n2 {
        bail!(
            "switch at site {pos} expects {n1} -> {n2} states, got column {} and emissions {}",
            prev.len(),
            emit.len()
        );
    }
    let mut col = vec![0.0; n2];
    for (j, &p) in prev.iter().enumerate() {
        if p == 0.0 {
            continue;
        }
        let mut is_source = false;
        for (src, row) in [
            (switch.recoal_src, &switch.recoal_row),
            (switch.recomb_src, &switch.recomb_row),
        ] {
            if src == Some(j) {
                is_source = true;
                for (v, lp) in col.iter_mut().zip(row) {
                    *v += p * lp.exp();
                }
            }
        }
        if !is_source && let Some(k) = switch.determ[j] {
            col[k] += p * switch.determ_prob[j].exp();
        }
    }
    for (v, e) in col.iter_mut().zip(emit) {
        *v *= e;
    }
    normalize(&mut col, pos)?;
    Ok(col)
}

/// Column at the first site. A supplied prior is taken as the column
/// itself; the coalescent prior is weighted by the first emissions.
pub fn initial_column(block: &BlockMatrices<'_>, model: &ArgModel, prior: Option<&[f64]>) -> Result<Vec<f64>> {
    let width = block.width();
    match prior {
        Some(p) if p.len() != width => bail!(
            "prior has {} entries but the first block has {width} states",
            p.len()
        ),
        Some(p) => {
            let sum: f64 = p.iter().sum();
            if p.iter().any(|v| !v.is_finite() || *v < 0.0) || !(sum > 0.0) {
                bail!("prior must be nonnegative with positive mass");
            }
            Ok(p.to_vec())
        }
        None if block.nstates() == 0 => Ok(vec![1.0]),
        None => {
            let mut col = state_priors(&block.states, &block.lineages, model, block.minage);
            for (v, e) in col.iter_mut().zip(block.emit.row(0)) {
                *v *= e;
            }
            normalize(&mut col, block.start)?;
            Ok(col)
        }
    }
}

pub fn forward_algorithm(
    list: &MatrixList<'_>,
    model: &ArgModel,
    prior: Option<&[f64]>,
    show_progress: bool,
) -> Result<ForwardTable> {
    let timer = Instant::now();
    let length = list.length();
    let mut cols = vec![Vec::new(); length];
    let pb = progress::maybe_bar(show_progress, list.num_blocks() as u64, "arghmm", "forward");

    for (bi, block) in list.blocks.iter().enumerate() {
        let (done, rest) = cols.split_at_mut(block.start);
        let cols_here = &mut rest[..block.len];
        let first_emit: Vec<f64> = block.emit.row(0).to_vec();

        match done.last() {
            None => {
                cols_here[0] = initial_column(block, model, prior)?;
                let (head, tail) = cols_here.split_at_mut(1);
                forward_block(block, &head[0], tail, 1)?;
            }
            Some(prev) => match block.switch {
                Some(sw) => {
                    cols_here[0] = forward_switch(prev, sw, &first_emit, block.start)?;
                    let (head, tail) = cols_here.split_at_mut(1);
                    forward_block(block, &head[0], tail, 1)?;
                }
                None => forward_block(block, prev, cols_here, 0)?,
            },
        }
        debug!("forward block {bi}: {} sites, {} states", block.len, block.nstates());
        pb.inc(1);
    }
    pb.finish_and_clear();

    info!(
        "forward: {} blocks, {} sites in {:.3?}",
        list.num_blocks(),
        length,
        timer.elapsed()
    );
    Ok(ForwardTable {
        start_coord: list.start_coord,
        cols,
    })
}
