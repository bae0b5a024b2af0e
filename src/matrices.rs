use anyhow::{Context, Result, bail};
use log::info;
use ndarray::Array2;
use std::time::Instant;

use crate::emit::{EmissionModel, InternalEmissions, LeafEmissions};
use crate::model::ArgModel;
use crate::seq::Sequences;
use crate::states::{
    LineageCounts, NodeStateLookup, State, ThreadMode, get_coal_states, thread_minage,
};
use crate::trans::{TransMatrix, TransMatrixSwitch};
use crate::tree::{LocalTree, LocalTrees};

#[derive(Debug)]
pub struct BlockMatrices<'a> {
    pub tree: &'a LocalTree,
    /// First site of the block, relative to the start of the sequences.
    pub start: usize,
    pub len: usize,
    pub states: Vec<State>,
    pub lookup: NodeStateLookup,
    pub lineages: LineageCounts,
    pub minage: usize,
    /// `len x max(nstates, 1)`.
    pub emit: Array2<f64>,
    pub trans: TransMatrix,
    pub switch: Option<&'a TransMatrixSwitch>,
}

impl BlockMatrices<'_> {
    pub fn nstates(&self) -> usize {
        self.states.len()
    }

    /// Column width; an empty state space keeps one implicit state.
    pub fn width(&self) -> usize {
        self.states.len().max(1)
    }

    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

#[derive(Debug)]
pub struct MatrixList<'a> {
    pub start_coord: usize,
    pub mode: ThreadMode,
    pub blocks: Vec<BlockMatrices<'a>>,
}

impl<'a> MatrixList<'a> {
    pub fn build(
        trees: &'a LocalTrees,
        model: &ArgModel,
        seqs: &Sequences,
        mode: ThreadMode,
    ) -> Result<Self> {
        match mode {
            ThreadMode::Leaf => Self::build_with(trees, model, seqs, mode, &LeafEmissions::default()),
            ThreadMode::Internal => Self::build_with(trees, model, seqs, mode, &InternalEmissions),
        }
    }

    pub fn build_with(
        trees: &'a LocalTrees,
        model: &ArgModel,
        seqs: &Sequences,
        mode: ThreadMode,
        emitter: &dyn EmissionModel,
    ) -> Result<Self> {
        if seqs.len() != trees.length() {
            bail!(
                "sequences cover {} sites but the local trees cover {}",
                seqs.len(),
                trees.length()
            );
        }
        let timer = Instant::now();
        let ntimes = model.ntimes();
        let mut blocks: Vec<BlockMatrices<'a>> = Vec::with_capacity(trees.num_trees());
        let mut start = 0;

        for (i, block) in trees.blocks.iter().enumerate() {
            let tree = &block.tree;
            check_ages(tree, model, mode).with_context(|| format!("block {i}"))?;

            let states = get_coal_states(tree, ntimes, mode);
            let lookup = NodeStateLookup::new(&states, tree.nnodes())?;
            let lineages = LineageCounts::new(tree, ntimes, mode);
            let minage = thread_minage(tree, ntimes, mode);
            let trans = TransMatrix::new(tree, &states, &lineages, model, minage)
                .with_context(|| format!("block {i}"))?;
            let view = seqs.view(start..start + block.len)?;
            let emit = emitter
                .emissions(&states, tree, &view, model)
                .with_context(|| format!("emissions for block {i}"))?;

            let nstates = states.len();
            if let Some(prev) = blocks.last() {
                match &block.switch {
                    Some(sw) => {
                        sw.validate().with_context(|| format!("switch into block {i}"))?;
                        if sw.nstates1 != prev.nstates() || sw.nstates2 != nstates {
                            bail!(
                                "switch into block {i} maps {} -> {} states, blocks have {} -> {}",
                                sw.nstates1,
                                sw.nstates2,
                                prev.nstates(),
                                nstates
                            );
                        }
                    }
                    None if prev.nstates() != nstates => bail!(
                        "block {i} changes state count ({} -> {nstates}) without a switch matrix",
                        prev.nstates()
                    ),
                    None => {}
                }
            }

            blocks.push(BlockMatrices {
                tree,
                start,
                len: block.len,
                states,
                lookup,
                lineages,
                minage,
                emit,
                trans,
                switch: block.switch.as_ref(),
            });
            start += block.len;
        }

        info!(
            "matrix calc: {} blocks, {} sites in {:.3?}",
            blocks.len(),
            start,
            timer.elapsed()
        );
        Ok(Self {
            start_coord: trees.start_coord,
            mode,
            blocks,
        })
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn length(&self) -> usize {
        self.blocks.last().map_or(0, BlockMatrices::end)
    }
}

fn check_ages(tree: &LocalTree, model: &ArgModel, mode: ThreadMode) -> Result<()> {
    let max_age = model.max_state_time();
    let technical_root = match mode {
        ThreadMode::Internal if tree.has_removed_branch(model.ntimes()) => Some(tree.root()),
        _ => None,
    };
    for n in 0..tree.nnodes() {
        if Some(n) != technical_root && tree.age(n) > max_age {
            bail!(
                "node {n} has age {} beyond the last usable time index {max_age}",
                tree.age(n)
            );
        }
    }
    Ok(())
}
