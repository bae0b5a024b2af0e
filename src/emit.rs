use anyhow::{Result, bail};
use log::debug;
use ndarray::Array2;
use std::time::Instant;

use crate::model::ArgModel;
use crate::seq::SeqView;
use crate::states::{State, ThreadMode};
use crate::tree::{LocalTree, ScratchTree};

/// Probability of no observed change (`mutated == false`) or of a change to
/// one specific other base along a branch of length `t`.
pub fn prob_branch(t: f64, mu: f64, mutated: bool) -> f64 {
    let decay = (-4.0 / 3.0 * mu * t).exp();
    if mutated {
        0.25 * (1.0 - decay)
    } else {
        0.25 * (1.0 + 3.0 * decay)
    }
}

/// Likelihood of an invariant site given the total tree length.
pub fn invariant_site_prob(treelen: f64, model: &ArgModel) -> f64 {
    0.25 * (-model.mu * treelen.max(model.mintime)).exp()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BranchProbs {
    pub nomut: f64,
    pub mutate: f64,
}

impl BranchProbs {
    pub fn new(t: f64, mu: f64) -> Self {
        Self {
            nomut: prob_branch(t, mu, false),
            mutate: prob_branch(t, mu, true),
        }
    }

    /// No-op branch, used for roots.
    pub fn identity() -> Self {
        Self {
            nomut: 1.0,
            mutate: 0.0,
        }
    }

    /// `out[a] = sum_b v[b] * P(a -> b)` along this branch.
    #[inline]
    pub fn mix(&self, v: &[f64; 4]) -> [f64; 4] {
        let total = v[0] + v[1] + v[2] + v[3];
        let mut out = [0.0; 4];
        for a in 0..4 {
            out[a] = self.nomut * v[a] + self.mutate * (total - v[a]);
        }
        out
    }
}

#[inline]
fn product(a: [f64; 4], b: [f64; 4]) -> [f64; 4] {
    [a[0] * b[0], a[1] * b[1], a[2] * b[2], a[3] * b[3]]
}

/// Per-node branch probabilities for the branch above each node.
pub fn branch_probs(tree: &LocalTree, model: &ArgModel) -> Vec<BranchProbs> {
    (0..tree.nnodes())
        .map(|n| match tree.dist(n, model) {
            Some(t) => BranchProbs::new(t, model.mu),
            None => BranchProbs::identity(),
        })
        .collect()
}

/// Flat arena of 4-vectors, `nsites x nnodes`, allocated once per tree and
/// reused across sites and states.
#[derive(Debug, Clone)]
pub struct LikelihoodTable {
    nnodes: usize,
    data: Vec<[f64; 4]>,
}

impl LikelihoodTable {
    pub fn new(nsites: usize, nnodes: usize) -> Self {
        Self {
            nnodes,
            data: vec![[1.0; 4]; nsites * nnodes],
        }
    }

    #[inline]
    pub fn row(&self, site: usize) -> &[[f64; 4]] {
        &self.data[site * self.nnodes..(site + 1) * self.nnodes]
    }

    #[inline]
    pub fn row_mut(&mut self, site: usize) -> &mut [[f64; 4]] {
        &mut self.data[site * self.nnodes..(site + 1) * self.nnodes]
    }
}

/// Recompute inner vectors for `nodes`, which must list children first.
pub fn update_inner(
    tree: &LocalTree,
    probs: &[BranchProbs],
    view: &SeqView<'_>,
    site: usize,
    inner: &mut [[f64; 4]],
    nodes: &[usize],
) {
    for &n in nodes {
        inner[n] = match tree.node(n).children {
            None => view.base(n, site).likelihood(),
            Some([c0, c1]) => product(probs[c0].mix(&inner[c0]), probs[c1].mix(&inner[c1])),
        };
    }
}

/// Outer vectors below `top`: `outer[n]` explains all data outside the
/// subtree of `n`, conditioned on the base at the parent of `n`.
pub fn update_outer(
    tree: &LocalTree,
    probs: &[BranchProbs],
    top: usize,
    inner: &[[f64; 4]],
    outer: &mut [[f64; 4]],
) {
    for n in tree.preorder_from(top) {
        if n == top {
            outer[n] = [1.0; 4];
            continue;
        }
        let (Some(p), Some(s)) = (tree.node(n).parent, tree.sibling(n)) else {
            continue;
        };
        let beside = probs[s].mix(&inner[s]);
        outer[n] = if p == top {
            beside
        } else {
            product(beside, probs[p].mix(&outer[p]))
        };
    }
}

#[inline]
fn root_prob(v: &[f64; 4]) -> f64 {
    0.25 * (v[0] + v[1] + v[2] + v[3])
}

/// Strategy for building a `sites x states` emission matrix.
pub trait EmissionModel {
    fn emissions(
        &self,
        states: &[State],
        tree: &LocalTree,
        view: &SeqView<'_>,
        model: &ArgModel,
    ) -> Result<Array2<f64>>;
}

fn ones_column(len: usize) -> Array2<f64> {
    Array2::from_elem((len, 1), 1.0)
}

/// Graft the new leaf at every state and prune the augmented tree.
///
/// With `incremental` set, only nodes whose subtree changed since the
/// previous graft are recomputed; this keeps one inner table per site.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeafEmissions {
    pub incremental: bool,
}

impl EmissionModel for LeafEmissions {
    fn emissions(
        &self,
        states: &[State],
        tree: &LocalTree,
        view: &SeqView<'_>,
        model: &ArgModel,
    ) -> Result<Array2<f64>> {
        if view.num_seqs() != tree.nleaves() + 1 {
            bail!(
                "leaf threading needs {} sequences (tree leaves plus the new one), got {}",
                tree.nleaves() + 1,
                view.num_seqs()
            );
        }
        let seqlen = view.len();
        if states.is_empty() {
            return Ok(ones_column(seqlen));
        }
        let start = Instant::now();
        let invariant = view.invariant_sites();
        let mut scratch = ScratchTree::new(tree);
        let mut emit = Array2::zeros((seqlen, states.len()));

        let nnodes = tree.nnodes() + 2;
        let rows = if self.incremental { seqlen } else { 1 };
        let mut table = LikelihoodTable::new(rows, nnodes);
        let mut prev_parent: Option<Option<usize>> = None;

        for (j, state) in states.iter().enumerate() {
            scratch.push(state.node, state.time)?;
            let graft = scratch.tree();
            let probs = branch_probs(graft, model);
            let inv = invariant_site_prob(graft.treelen(model), model);
            let root = graft.root();

            let order: Vec<usize> = match (self.incremental, prev_parent) {
                (true, Some(prev)) => changed_nodes(graft, scratch.new_coal(), prev),
                _ => graft.postorder().to_vec(),
            };

            for site in 0..seqlen {
                if invariant[site] {
                    emit[[site, j]] = inv;
                    continue;
                }
                let inner = table.row_mut(if self.incremental { site } else { 0 });
                update_inner(graft, &probs, view, site, inner, &order);
                emit[[site, j]] = root_prob(&inner[root]);
            }

            prev_parent = Some(graft.node(scratch.new_coal()).parent);
            scratch.pop()?;
        }
        debug!(
            "leaf emissions: {} states x {} sites in {:.3?}",
            states.len(),
            seqlen,
            start.elapsed()
        );
        Ok(emit)
    }
}

/// Nodes to recompute after moving the graft: the new coalescence node and
/// its ancestors, plus the ancestors of the previous graft's parent, in a
/// children-first order.
fn changed_nodes(tree: &LocalTree, new_coal: usize, prev_parent: Option<usize>) -> Vec<usize> {
    let mut dirty = vec![false; tree.nnodes()];
    let mark = |start: Option<usize>, dirty: &mut Vec<bool>| {
        let mut cur = start;
        while let Some(n) = cur {
            dirty[n] = true;
            cur = tree.node(n).parent;
        }
    };
    mark(Some(new_coal), &mut dirty);
    mark(prev_parent, &mut dirty);
    tree.postorder().iter().copied().filter(|&n| dirty[n]).collect()
}

/// Re-attach a removed internal branch using inner and outer tables
/// computed once for the fixed tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct InternalEmissions;

impl EmissionModel for InternalEmissions {
    fn emissions(
        &self,
        states: &[State],
        tree: &LocalTree,
        view: &SeqView<'_>,
        model: &ArgModel,
    ) -> Result<Array2<f64>> {
        if view.num_seqs() != tree.nleaves() {
            bail!(
                "internal threading needs one sequence per leaf ({}), got {}",
                tree.nleaves(),
                view.num_seqs()
            );
        }
        let seqlen = view.len();
        if states.is_empty() {
            return Ok(ones_column(seqlen));
        }
        let Some((subtree_root, maintree_root)) = tree.internal_roots(model.ntimes()) else {
            bail!("internal emissions need a tree with a removed branch");
        };
        let start = Instant::now();
        let invariant = view.invariant_sites();
        let nnodes = tree.nnodes();
        let probs = branch_probs(tree, model);

        let mut inner = LikelihoodTable::new(seqlen, nnodes);
        let mut outer = LikelihoodTable::new(seqlen, nnodes);
        for site in 0..seqlen {
            if invariant[site] {
                continue;
            }
            let row = inner.row_mut(site);
            update_inner(tree, &probs, view, site, row, tree.postorder());
            update_outer(tree, &probs, maintree_root, inner.row(site), outer.row_mut(site));
        }

        let maintree_len = tree.subtree_len(maintree_root, model);
        let subtree_len = tree.subtree_len(subtree_root, model);
        let subtree_age = tree.age(subtree_root);
        let mut emit = Array2::zeros((seqlen, states.len()));

        for (j, state) in states.iter().enumerate() {
            let node = state.node;
            let time = state.time;
            let age = tree.age(node);
            let p1 = BranchProbs::new(model.dist(subtree_age, time), model.mu);
            let p2 = BranchProbs::new(model.dist(age, time), model.mu);

            let mut treelen = maintree_len + subtree_len + model.dist(subtree_age, time);
            let p3 = if node == maintree_root {
                treelen += model.dist(age, time);
                None
            } else {
                let Some(parent) = tree.node(node).parent else {
                    bail!("state {j} attaches above node {node}, which has no parent");
                };
                let parent_age = tree.age(parent).min(model.ntimes() - 1);
                treelen += model.dist(age, time) + model.dist(time, parent_age)
                    - model.dist(age, parent_age);
                Some(BranchProbs::new(model.dist(time, parent_age), model.mu))
            };
            let inv = invariant_site_prob(treelen, model);

            for site in 0..seqlen {
                if invariant[site] {
                    emit[[site, j]] = inv;
                    continue;
                }
                let below = product(
                    p1.mix(&inner.row(site)[subtree_root]),
                    p2.mix(&inner.row(site)[node]),
                );
                let joined = match &p3 {
                    Some(p3) => product(below, p3.mix(&outer.row(site)[node])),
                    None => below,
                };
                emit[[site, j]] = root_prob(&joined);
            }
        }
        debug!(
            "internal emissions: {} states x {} sites in {:.3?}",
            states.len(),
            seqlen,
            start.elapsed()
        );
        Ok(emit)
    }
}

/// Emission matrix for the production strategy of the given mode.
pub fn calc_emissions(
    states: &[State],
    tree: &LocalTree,
    view: &SeqView<'_>,
    model: &ArgModel,
    mode: ThreadMode,
) -> Result<Array2<f64>> {
    match mode {
        ThreadMode::Leaf => LeafEmissions::default().emissions(states, tree, view, model),
        ThreadMode::Internal => InternalEmissions.emissions(states, tree, view, model),
    }
}

/// Log-likelihood of the sites in `view` under one fixed tree.
pub fn likelihood_tree(tree: &LocalTree, model: &ArgModel, view: &SeqView<'_>) -> Result<f64> {
    if view.num_seqs() != tree.nleaves() {
        bail!(
            "tree has {} leaves but {} sequences were given",
            tree.nleaves(),
            view.num_seqs()
        );
    }
    let probs = branch_probs(tree, model);
    let inv = invariant_site_prob(tree.treelen(model), model).ln();
    let mut inner = vec![[1.0; 4]; tree.nnodes()];
    let mut lnl = 0.0;
    for site in 0..view.len() {
        if view.is_invariant_site(site) {
            lnl += inv;
            continue;
        }
        update_inner(tree, &probs, view, site, &mut inner, tree.postorder());
        lnl += root_prob(&inner[tree.root()]).ln();
    }
    Ok(lnl)
}
