//! Slow reference emission computations.
//!
//! Each candidate state is turned into an explicit tree (a rebuilt parent
//! array for leaf threading, an SPR for internal threading) and pruned by
//! plain recursion with no caching. Used only to validate the fast paths.

use anyhow::{Result, bail};
use log::warn;
use ndarray::Array2;

use crate::emit::{EmissionModel, InternalEmissions, LeafEmissions, invariant_site_prob, prob_branch};
use crate::model::ArgModel;
use crate::seq::SeqView;
use crate::states::State;
use crate::tree::LocalTree;
use crate::utils::fequal;

pub const REL_TOL: f64 = 1e-4;
pub const ABS_TOL: f64 = 1e-12;

fn prune(tree: &LocalTree, node: usize, model: &ArgModel, view: &SeqView<'_>, site: usize) -> [f64; 4] {
    let Some(children) = tree.node(node).children else {
        return view.base(node, site).likelihood();
    };
    let mut out = [1.0; 4];
    for child in children {
        let below = prune(tree, child, model, view, site);
        let t = model.dist(tree.age(child), tree.age(node));
        for (a, v) in out.iter_mut().enumerate() {
            let mut sum = 0.0;
            for (b, l) in below.iter().enumerate() {
                sum += l * prob_branch(t, model.mu, a != b);
            }
            *v *= sum;
        }
    }
    out
}

fn tree_length(tree: &LocalTree, node: usize, model: &ArgModel) -> f64 {
    match tree.node(node).children {
        None => 0.0,
        Some(children) => children
            .iter()
            .map(|&c| model.dist(tree.age(c), tree.age(node)) + tree_length(tree, c, model))
            .sum(),
    }
}

fn site_column(tree: &LocalTree, model: &ArgModel, view: &SeqView<'_>) -> Vec<f64> {
    let root = tree.root();
    let inv = invariant_site_prob(tree_length(tree, root, model), model);
    (0..view.len())
        .map(|site| {
            if view.is_invariant_site(site) {
                inv
            } else {
                prune(tree, root, model, view, site).iter().sum::<f64>() * 0.25
            }
        })
        .collect()
}

/// Tree with the new leaf attached at `state`, rebuilt from a parent array.
/// Existing nodes at index `>= nleaves` shift up by one; the new leaf takes
/// index `nleaves` and the new coalescence node the last index.
pub fn add_leaf_tree(tree: &LocalTree, state: State) -> Result<LocalTree> {
    let n = tree.nnodes();
    let nleaves = tree.nleaves();
    if state.node >= n {
        bail!("state node {} outside tree of {n} nodes", state.node);
    }
    let remap = |i: usize| if i < nleaves { i } else { i + 1 };
    let new_leaf = nleaves;
    let new_coal = n + 1;

    let mut parents = vec![None; n + 2];
    let mut ages = vec![0; n + 2];
    for i in 0..n {
        let node = tree.node(i);
        parents[remap(i)] = if i == state.node {
            Some(new_coal)
        } else {
            node.parent.map(remap)
        };
        ages[remap(i)] = node.age;
    }
    parents[new_leaf] = Some(new_coal);
    parents[new_coal] = tree.node(state.node).parent.map(remap);
    ages[new_coal] = state.time;
    LocalTree::from_parents(&parents, &ages)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SlowLeafEmissions;

impl EmissionModel for SlowLeafEmissions {
    fn emissions(
        &self,
        states: &[State],
        tree: &LocalTree,
        view: &SeqView<'_>,
        model: &ArgModel,
    ) -> Result<Array2<f64>> {
        if states.is_empty() {
            return Ok(Array2::from_elem((view.len(), 1), 1.0));
        }
        let mut emit = Array2::zeros((view.len(), states.len()));
        for (j, &state) in states.iter().enumerate() {
            let full = add_leaf_tree(tree, state)?;
            for (site, v) in site_column(&full, model, view).into_iter().enumerate() {
                emit[[site, j]] = v;
            }
        }
        Ok(emit)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SlowInternalEmissions;

impl EmissionModel for SlowInternalEmissions {
    fn emissions(
        &self,
        states: &[State],
        tree: &LocalTree,
        view: &SeqView<'_>,
        model: &ArgModel,
    ) -> Result<Array2<f64>> {
        if states.is_empty() {
            return Ok(Array2::from_elem((view.len(), 1), 1.0));
        }
        let Some((subtree_root, _)) = tree.internal_roots(model.ntimes()) else {
            bail!("internal emissions need a tree with a removed branch");
        };
        let mut emit = Array2::zeros((view.len(), states.len()));
        for (j, state) in states.iter().enumerate() {
            let mut full = tree.clone();
            full.apply_spr(subtree_root, state.node, state.time)?;
            for (site, v) in site_column(&full, model, view).into_iter().enumerate() {
                emit[[site, j]] = v;
            }
        }
        Ok(emit)
    }
}

/// Compare two emission strategies entry by entry.
/// A mismatch is logged and reported as `Ok(false)`.
pub fn compare_emissions(
    fast: &dyn EmissionModel,
    slow: &dyn EmissionModel,
    states: &[State],
    tree: &LocalTree,
    view: &SeqView<'_>,
    model: &ArgModel,
) -> Result<bool> {
    let a = fast.emissions(states, tree, view, model)?;
    let b = slow.emissions(states, tree, view, model)?;
    if a.dim() != b.dim() {
        warn!("emission shapes differ: {:?} vs {:?}", a.dim(), b.dim());
        return Ok(false);
    }
    for ((site, j), &x) in a.indexed_iter() {
        let y = b[[site, j]];
        if !fequal(x, y, REL_TOL, ABS_TOL) {
            warn!("emission mismatch at site {site}, state {j}: {x} != {y}");
            return Ok(false);
        }
    }
    Ok(true)
}

/// Check graft-based leaf emissions against the rebuilt-tree oracle.
pub fn assert_emissions(
    states: &[State],
    tree: &LocalTree,
    view: &SeqView<'_>,
    model: &ArgModel,
) -> Result<bool> {
    compare_emissions(&LeafEmissions::default(), &SlowLeafEmissions, states, tree, view, model)
}

/// Check inner/outer internal emissions against the SPR oracle.
pub fn assert_emissions_internal(
    states: &[State],
    tree: &LocalTree,
    view: &SeqView<'_>,
    model: &ArgModel,
) -> Result<bool> {
    compare_emissions(&InternalEmissions, &SlowInternalEmissions, states, tree, view, model)
}
