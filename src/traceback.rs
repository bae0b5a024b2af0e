use anyhow::{Result, anyhow, bail};
use log::info;
use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use std::time::Instant;

use crate::forward::ForwardTable;
use crate::matrices::MatrixList;
use crate::trans::Transition;
use crate::utils::argmax;

pub trait Sampler {
    fn sample_index(&mut self, weights: &[f64]) -> Result<usize>;
}

impl<R: Rng + ?Sized> Sampler for R {
    fn sample_index(&mut self, weights: &[f64]) -> Result<usize> {
        let dist = WeightedIndex::new(weights)
            .map_err(|e| anyhow!("cannot sample from {} weights: {e}", weights.len()))?;
        Ok(dist.sample(self))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Within(usize),
    Switch(usize),
}

/// Walk the forward table backwards; `pick` chooses a source state from
/// the scores of every candidate (`fwd * trans`, or their logs when
/// `log_space`).
fn traceback_with<F>(
    list: &MatrixList<'_>,
    fwd: &ForwardTable,
    last_state: Option<usize>,
    log_space: bool,
    mut pick: F,
) -> Result<Vec<usize>>
where
    F: FnMut(&[f64]) -> Result<usize>,
{
    let len = fwd.len();
    if len == 0 || len != list.length() {
        bail!(
            "forward table has {len} columns but the blocks cover {} sites",
            list.length()
        );
    }
    let mut path = vec![0; len];
    let last_col = fwd.col(len - 1);
    path[len - 1] = match last_state {
        Some(k) if k >= last_col.len() => {
            bail!("end state {k} outside a final column of {} states", last_col.len())
        }
        Some(k) if !(last_col[k] > 0.0) => {
            bail!("end state {k} has no forward mass at site {}", fwd.start_coord + len - 1)
        }
        Some(k) => k,
        None if log_space => {
            argmax(last_col).ok_or_else(|| anyhow!("empty final forward column"))?
        }
        None => pick(last_col)?,
    };

    let mut row: Vec<f64> = Vec::new();
    let mut scores: Vec<f64> = Vec::new();
    let mut cached: Option<(Step, usize)> = None;

    for (bi, block) in list.blocks.iter().enumerate().rev() {
        for pos in (block.start.max(1)..block.end()).rev() {
            let step = match (pos == block.start, block.switch) {
                (true, Some(_)) => Step::Switch(bi),
                _ => Step::Within(bi),
            };
            let trans: &dyn Transition = match (step, block.switch) {
                (Step::Switch(_), Some(sw)) => sw,
                _ => &block.trans,
            };
            let k = path[pos];
            let prev = fwd.col(pos - 1);

            if cached != Some((step, k)) {
                row.clear();
                row.extend((0..prev.len()).map(|j| {
                    if log_space {
                        trans.get_log(j, k)
                    } else {
                        trans.get(j, k)
                    }
                }));
                cached = Some((step, k));
            }

            scores.clear();
            scores.extend(prev.iter().zip(&row).map(|(&f, &t)| {
                if log_space { f.ln() + t } else { f * t }
            }));
            let j = pick(&scores)?;
            let weight = if log_space { row[j].exp() } else { row[j] };
            if !(prev[j] > 0.0 && weight > 0.0) {
                bail!(
                    "traceback chose an unreachable transition {j} -> {k} at site {}",
                    fwd.start_coord + pos
                );
            }
            path[pos - 1] = j;
        }
    }
    Ok(path)
}

pub fn stochastic_traceback<S: Sampler + ?Sized>(
    list: &MatrixList<'_>,
    fwd: &ForwardTable,
    sampler: &mut S,
    last_state: Option<usize>,
) -> Result<Vec<usize>> {
    let timer = Instant::now();
    let path = traceback_with(list, fwd, last_state, false, |w| sampler.sample_index(w))?;
    info!("stochastic traceback: {} sites in {:.3?}", path.len(), timer.elapsed());
    Ok(path)
}

pub fn max_traceback(
    list: &MatrixList<'_>,
    fwd: &ForwardTable,
    last_state: Option<usize>,
) -> Result<Vec<usize>> {
    let timer = Instant::now();
    let path = traceback_with(list, fwd, last_state, true, |s| {
        argmax(s).ok_or_else(|| anyhow!("empty forward column in traceback"))
    })?;
    info!("max traceback: {} sites in {:.3?}", path.len(), timer.elapsed());
    Ok(path)
}
