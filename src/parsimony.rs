use anyhow::{Result, bail};

use crate::seq::{Base, SeqView, Sequences};
use crate::tree::{LocalTree, LocalTrees};

/// Leaf `i` reads row `i`; rows past the last leaf are ignored.
fn check_rows(tree: &LocalTree, view: &SeqView<'_>) -> Result<()> {
    if view.num_seqs() < tree.nleaves() {
        bail!(
            "tree has {} leaves but only {} sequences were given",
            tree.nleaves(),
            view.num_seqs()
        );
    }
    Ok(())
}

/// Fitch down-pass: state sets per node and the number of changes.
fn fitch_sets(tree: &LocalTree, view: &SeqView<'_>, site: usize, sets: &mut [u8]) -> usize {
    let mut cost = 0;
    for &n in tree.postorder() {
        sets[n] = match tree.node(n).children {
            None => view.base(n, site).fitch_set(),
            Some([c0, c1]) => {
                let both = sets[c0] & sets[c1];
                if both != 0 {
                    both
                } else {
                    cost += 1;
                    sets[c0] | sets[c1]
                }
            }
        };
    }
    cost
}

pub fn parsimony_cost(tree: &LocalTree, view: &SeqView<'_>, site: usize) -> Result<usize> {
    check_rows(tree, view)?;
    let mut sets = vec![0u8; tree.nnodes()];
    Ok(fitch_sets(tree, view, site, &mut sets))
}

pub fn parsimony_costs(tree: &LocalTree, view: &SeqView<'_>) -> Result<Vec<usize>> {
    check_rows(tree, view)?;
    let mut sets = vec![0u8; tree.nnodes()];
    Ok((0..view.len())
        .map(|site| fitch_sets(tree, view, site, &mut sets))
        .collect())
}

fn lowest_base(set: u8) -> Base {
    Base::from_index(set.trailing_zeros() as usize).unwrap_or(Base::N)
}

/// Ancestral bases for every node and site, `[node][site]`.
/// The root takes the first base of its set in A, C, G, T order; other
/// nodes keep their parent's base when their set allows it.
pub fn parsimony_ancestral_seq(tree: &LocalTree, view: &SeqView<'_>) -> Result<Vec<Vec<Base>>> {
    check_rows(tree, view)?;
    let mut ancestral = vec![vec![Base::N; view.len()]; tree.nnodes()];
    let mut sets = vec![0u8; tree.nnodes()];
    let preorder = tree.preorder_from(tree.root());
    for site in 0..view.len() {
        fitch_sets(tree, view, site, &mut sets);
        for &n in &preorder {
            let base = match tree.node(n).parent {
                None => lowest_base(sets[n]),
                Some(p) => {
                    let up = ancestral[p][site];
                    match up.index() {
                        Some(i) if sets[n] & (1 << i) != 0 => up,
                        _ => lowest_base(sets[n]),
                    }
                }
            };
            ancestral[n][site] = base;
        }
    }
    Ok(ancestral)
}

pub fn count_noncompat(tree: &LocalTree, view: &SeqView<'_>) -> Result<usize> {
    Ok(parsimony_costs(tree, view)?
        .into_iter()
        .filter(|&c| c > 1)
        .count())
}

/// Incompatible sites summed over every block of the segmentation.
/// Site 0 of `seqs` lies at `trees.start_coord`.
pub fn count_noncompat_trees(trees: &LocalTrees, seqs: &Sequences) -> Result<usize> {
    let mut total = 0;
    let offset = trees.start_coord;
    for (start, end, block) in trees.iter_blocks() {
        let view = seqs.view(start - offset..end - offset)?;
        total += count_noncompat(&block.tree, &view)?;
    }
    Ok(total)
}
