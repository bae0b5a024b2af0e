use anyhow::{Result, bail};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::model::ArgModel;
use crate::tree::LocalTree;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct State {
    pub node: usize,
    pub time: usize,
}

impl State {
    pub fn new(node: usize, time: usize) -> Self {
        Self { node, time }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadMode {
    /// A new leaf is added to a complete tree.
    Leaf,
    /// An internal branch was removed; the tree's technical root joins the
    /// removed subtree (`children[0]`) and the main tree (`children[1]`).
    Internal,
}

/// Enumerate candidate states for a tree.
///
/// Leaf mode: every branch at every time between the node age and its
/// parent age inclusive, the root up to `ntimes - 2`.
/// Internal mode: only main-tree branches, no earlier than the subtree root.
pub fn get_coal_states(tree: &LocalTree, ntimes: usize, mode: ThreadMode) -> Vec<State> {
    let top = ntimes.saturating_sub(2);
    let mut states = Vec::new();
    match mode {
        ThreadMode::Leaf => {
            for node in 0..tree.nnodes() {
                let end = tree.node(node).parent.map_or(top, |p| tree.age(p));
                for time in tree.age(node)..=end {
                    states.push(State::new(node, time));
                }
            }
        }
        ThreadMode::Internal => {
            let Some((subtree_root, maintree_root)) = tree.internal_roots(ntimes) else {
                return states;
            };
            let minage = tree.age(subtree_root);
            let skip = subtree_mask(tree, subtree_root);
            for node in 0..tree.nnodes() {
                if skip[node] || node == tree.root() {
                    continue;
                }
                let end = if node == maintree_root {
                    top
                } else {
                    match tree.node(node).parent {
                        Some(p) => tree.age(p),
                        None => continue,
                    }
                };
                for time in tree.age(node).max(minage)..=end {
                    states.push(State::new(node, time));
                }
            }
        }
    }
    states
}

fn subtree_mask(tree: &LocalTree, top: usize) -> Vec<bool> {
    let mut mask = vec![false; tree.nnodes()];
    for n in tree.preorder_from(top) {
        mask[n] = true;
    }
    mask
}

pub fn thread_minage(tree: &LocalTree, ntimes: usize, mode: ThreadMode) -> usize {
    match mode {
        ThreadMode::Leaf => 0,
        ThreadMode::Internal => tree
            .internal_roots(ntimes)
            .map_or(0, |(subtree_root, _)| tree.age(subtree_root)),
    }
}

/// Maps `(node, time)` to a state index, relying on each node's states
/// forming one contiguous run of consecutive times.
#[derive(Debug, Clone)]
pub struct NodeStateLookup {
    ranges: Vec<Option<(usize, usize, usize)>>,
}

impl NodeStateLookup {
    pub fn new(states: &[State], nnodes: usize) -> Result<Self> {
        let mut ranges: Vec<Option<(usize, usize, usize)>> = vec![None; nnodes];
        for (i, s) in states.iter().enumerate() {
            if s.node >= nnodes {
                bail!("state {i} names node {} outside a tree of {nnodes} nodes", s.node);
            }
            match &mut ranges[s.node] {
                None => ranges[s.node] = Some((i, s.time, 1)),
                Some((start, first, count)) => {
                    if *start + *count != i || *first + *count != s.time {
                        bail!("states for node {} are not contiguous at index {i}", s.node);
                    }
                    *count += 1;
                }
            }
        }
        Ok(Self { ranges })
    }

    pub fn lookup(&self, node: usize, time: usize) -> Option<usize> {
        let (start, first, count) = (*self.ranges.get(node)?)?;
        (time >= first && time < first + count).then(|| start + time - first)
    }

    pub fn range(&self, node: usize) -> Option<(usize, usize, usize)> {
        *self.ranges.get(node)?
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineageCounts {
    pub nbranches: Vec<usize>,
    pub ncoals: Vec<usize>,
}

impl LineageCounts {
    pub fn new(tree: &LocalTree, ntimes: usize, mode: ThreadMode) -> Self {
        let mut nbranches = vec![0; ntimes];
        let mut ncoals = vec![0; ntimes];
        let top_time = ntimes.saturating_sub(2);

        let (skip, top) = match (mode, tree.internal_roots(ntimes)) {
            (ThreadMode::Internal, Some((subtree_root, maintree_root))) => {
                let mut skip = subtree_mask(tree, subtree_root);
                skip[tree.root()] = true;
                (skip, maintree_root)
            }
            (ThreadMode::Internal, None) => {
                return Self { nbranches, ncoals };
            }
            (ThreadMode::Leaf, _) => (vec![false; tree.nnodes()], tree.root()),
        };

        for node in 0..tree.nnodes() {
            if skip[node] {
                continue;
            }
            let age = tree.age(node);
            let is_top = node == top;
            let parent_age = if is_top {
                top_time
            } else {
                match tree.node(node).parent {
                    Some(p) => tree.age(p).min(top_time),
                    None => continue,
                }
            };
            if age > parent_age {
                continue;
            }
            for t in age..parent_age {
                nbranches[t] += 1;
                ncoals[t] += 1;
            }
            ncoals[parent_age] += 1;
            if is_top {
                nbranches[parent_age] += 1;
            }
        }
        Self { nbranches, ncoals }
    }

    /// Cumulative coalescence hazard `C[t]` for a lineage floating among
    /// `nbranches`, with `C[0] = 0`.
    pub fn cumulative_hazard(&self, model: &ArgModel) -> Vec<f64> {
        let ntimes = model.ntimes();
        let mut c = vec![0.0; ntimes];
        for t in 0..ntimes - 1 {
            let h = model.time_steps[t] * self.nbranches[t] as f64 / (2.0 * model.popsizes[t]);
            c[t + 1] = c[t] + h;
        }
        c
    }

    /// Probability of coalescing within interval `b` given survival to its
    /// start; forced to 1 in the last usable interval.
    pub fn coal_mass(&self, cumhaz: &[f64], b: usize, ntimes: usize) -> f64 {
        if b + 2 >= ntimes {
            1.0
        } else {
            -f64::exp_m1(-(cumhaz[b + 1] - cumhaz[b]))
        }
    }
}

/// Prior over states at the first position: the chance that the thread
/// first coalesces in interval `b`, split evenly over the states at `b`.
pub fn state_priors(
    states: &[State],
    lineages: &LineageCounts,
    model: &ArgModel,
    minage: usize,
) -> Vec<f64> {
    let ntimes = model.ntimes();
    let cumhaz = lineages.cumulative_hazard(model);
    states
        .iter()
        .map(|s| {
            if s.time < minage || lineages.ncoals[s.time] == 0 {
                return 0.0;
            }
            let survive = (-(cumhaz[s.time] - cumhaz[minage])).exp();
            survive * lineages.coal_mass(&cumhaz, s.time, ntimes) / lineages.ncoals[s.time] as f64
        })
        .collect()
}
