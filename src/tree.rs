use anyhow::{Result, anyhow, bail};

use crate::model::ArgModel;
use crate::trans::TransMatrixSwitch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalNode {
    pub parent: Option<usize>,
    pub children: Option<[usize; 2]>,
    pub age: usize,
}

impl LocalNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }
}

/// Rooted binary genealogy valid over one genome block.
///
/// Leaves occupy indices `0..nleaves` and leaf `i` reads sequence row `i`.
/// The postorder is computed once per topology and cached.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalTree {
    nodes: Vec<LocalNode>,
    root: usize,
    nleaves: usize,
    postorder: Vec<usize>,
}

impl LocalTree {
    pub fn new(nodes: Vec<LocalNode>) -> Result<Self> {
        if nodes.is_empty() {
            bail!("local tree has no nodes");
        }
        let nnodes = nodes.len();
        let mut root = None;
        for (i, node) in nodes.iter().enumerate() {
            match node.parent {
                None => {
                    if let Some(r) = root {
                        bail!("local tree has two roots: {r} and {i}");
                    }
                    root = Some(i);
                }
                Some(p) => {
                    if p >= nnodes {
                        bail!("node {i} has out-of-range parent {p}");
                    }
                    let siblings = nodes[p]
                        .children
                        .ok_or_else(|| anyhow!("node {i} names leaf {p} as its parent"))?;
                    if !siblings.contains(&i) {
                        bail!("node {p} does not list its child {i}");
                    }
                    if nodes[p].age < node.age {
                        bail!(
                            "node {i} (age {}) is older than its parent {p} (age {})",
                            node.age,
                            nodes[p].age
                        );
                    }
                }
            }
            if let Some([c0, c1]) = node.children {
                if c0 == c1 || c0 >= nnodes || c1 >= nnodes {
                    bail!("node {i} has invalid children [{c0}, {c1}]");
                }
                if nodes[c0].parent != Some(i) || nodes[c1].parent != Some(i) {
                    bail!("children of node {i} do not point back to it");
                }
            }
        }
        let root = root.ok_or_else(|| anyhow!("local tree has no root"))?;
        let nleaves = nodes.iter().take_while(|n| n.is_leaf()).count();
        if nodes[nleaves..].iter().any(LocalNode::is_leaf) {
            bail!("leaves must occupy the first node indices");
        }
        if nnodes != 2 * nleaves - 1 {
            bail!("tree with {nleaves} leaves must have {} nodes, got {nnodes}", 2 * nleaves - 1);
        }
        let postorder = compute_postorder(&nodes, root)?;
        Ok(Self {
            nodes,
            root,
            nleaves,
            postorder,
        })
    }

    /// Build from a parent array; each node's children are ordered by index.
    pub fn from_parents(parents: &[Option<usize>], ages: &[usize]) -> Result<Self> {
        if parents.len() != ages.len() {
            bail!(
                "parent array length {} does not match ages length {}",
                parents.len(),
                ages.len()
            );
        }
        let mut kids: Vec<Vec<usize>> = vec![Vec::new(); parents.len()];
        for (i, p) in parents.iter().enumerate() {
            if let Some(p) = *p {
                if p >= parents.len() {
                    bail!("node {i} has out-of-range parent {p}");
                }
                kids[p].push(i);
            }
        }
        let mut nodes = Vec::with_capacity(parents.len());
        for (i, k) in kids.iter().enumerate() {
            let children = match k.as_slice() {
                [] => None,
                [a, b] => Some([*a, *b]),
                _ => bail!("node {i} has {} children; local trees are binary", k.len()),
            };
            nodes.push(LocalNode {
                parent: parents[i],
                children,
                age: ages[i],
            });
        }
        Self::new(nodes)
    }

    pub fn nnodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn nleaves(&self) -> usize {
        self.nleaves
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn nodes(&self) -> &[LocalNode] {
        &self.nodes
    }

    #[inline]
    pub fn node(&self, i: usize) -> &LocalNode {
        &self.nodes[i]
    }

    #[inline]
    pub fn age(&self, i: usize) -> usize {
        self.nodes[i].age
    }

    pub fn postorder(&self) -> &[usize] {
        &self.postorder
    }

    pub fn sibling(&self, i: usize) -> Option<usize> {
        let p = self.nodes[i].parent?;
        let [c0, c1] = self.nodes[p].children?;
        Some(if c0 == i { c1 } else { c0 })
    }

    /// Nodes of the subtree rooted at `node`, parents before children.
    pub fn preorder_from(&self, node: usize) -> Vec<usize> {
        let mut order = Vec::new();
        let mut stack = vec![node];
        while let Some(n) = stack.pop() {
            order.push(n);
            if let Some([c0, c1]) = self.nodes[n].children {
                stack.push(c1);
                stack.push(c0);
            }
        }
        order
    }

    pub fn has_removed_branch(&self, ntimes: usize) -> bool {
        self.nodes[self.root].age >= ntimes
    }

    /// `(subtree_root, maintree_root)` for a tree with a removed branch.
    pub fn internal_roots(&self, ntimes: usize) -> Option<(usize, usize)> {
        if !self.has_removed_branch(ntimes) {
            return None;
        }
        self.nodes[self.root].children.map(|[c0, c1]| (c0, c1))
    }

    pub fn dist(&self, node: usize, model: &ArgModel) -> Option<f64> {
        let p = self.nodes[node].parent?;
        Some(model.dist(self.nodes[node].age, self.nodes[p].age))
    }

    /// Sum of floored branch lengths strictly below `top`.
    pub fn subtree_len(&self, top: usize, model: &ArgModel) -> f64 {
        self.preorder_from(top)
            .into_iter()
            .filter(|&n| n != top)
            .filter_map(|n| self.dist(n, model))
            .sum()
    }

    pub fn treelen(&self, model: &ArgModel) -> f64 {
        self.subtree_len(self.root, model)
    }

    /// Subtree-prune-regraft: detach the branch above `recomb_node` and
    /// reattach it onto the branch above `coal_node` at `coal_time`.
    /// The pruned parent node is reused as the new coalescence node.
    pub fn apply_spr(&mut self, recomb_node: usize, coal_node: usize, coal_time: usize) -> Result<()> {
        let recoal = self.nodes[recomb_node]
            .parent
            .ok_or_else(|| anyhow!("cannot prune the root branch (node {recomb_node})"))?;
        let mut c = self.nodes[recoal]
            .children
            .ok_or_else(|| anyhow!("parent {recoal} of node {recomb_node} has no children"))?;
        let other = if c[0] == recomb_node { 1 } else { 0 };
        let recomb_sib = c[other];
        let broke_parent = self.nodes[recoal].parent;

        self.nodes[recomb_sib].parent = broke_parent;
        let mut slot = 0;
        if let Some(bp) = broke_parent {
            let bc = self.children_mut(bp)?;
            slot = if bc[0] == recoal { 0 } else { 1 };
            bc[slot] = recomb_sib;
        }

        if coal_node == recoal {
            c[other] = recomb_sib;
            self.nodes[recoal].children = Some(c);
            self.nodes[recoal].parent = self.nodes[recomb_sib].parent;
            self.nodes[recomb_sib].parent = Some(recoal);
            if let Some(bp) = broke_parent {
                self.children_mut(bp)?[slot] = recoal;
            }
        } else {
            c[other] = coal_node;
            self.nodes[recoal].children = Some(c);
            let coal_parent = self.nodes[coal_node].parent;
            self.nodes[recoal].parent = coal_parent;
            self.nodes[coal_node].parent = Some(recoal);
            if let Some(p) = coal_parent {
                let pc = self.children_mut(p)?;
                if pc[0] == coal_node {
                    pc[0] = recoal;
                } else {
                    pc[1] = recoal;
                }
            }
        }
        self.nodes[recoal].age = coal_time;

        self.root = self
            .nodes
            .iter()
            .position(|n| n.parent.is_none())
            .ok_or_else(|| anyhow!("SPR left the tree without a root"))?;
        self.postorder = compute_postorder(&self.nodes, self.root)?;
        Ok(())
    }

    fn children_mut(&mut self, node: usize) -> Result<&mut [usize; 2]> {
        self.nodes[node]
            .children
            .as_mut()
            .ok_or_else(|| anyhow!("node {node} is a leaf"))
    }
}

fn compute_postorder(nodes: &[LocalNode], root: usize) -> Result<Vec<usize>> {
    let mut order = Vec::with_capacity(nodes.len());
    let mut stack = vec![(root, false)];
    while let Some((node, expanded)) = stack.pop() {
        if order.len() > nodes.len() {
            bail!("local tree contains a cycle");
        }
        match nodes[node].children {
            Some([c0, c1]) if !expanded => {
                stack.push((node, true));
                stack.push((c1, false));
                stack.push((c0, false));
            }
            _ => order.push(node),
        }
    }
    if order.len() != nodes.len() {
        bail!(
            "only {} of {} nodes are reachable from the root",
            order.len(),
            nodes.len()
        );
    }
    Ok(order)
}

#[derive(Debug, Clone, Copy)]
struct Graft {
    displaced: bool,
}

/// Reusable augmented-tree buffer for grafting the new lineage onto a
/// fixed tree, one candidate state at a time.
///
/// `push(node, time)` adds the new leaf at index `nleaves` (moving the
/// node that sat there to index `nnodes`) and a new coalescence node at
/// index `nnodes + 1`; `pop` restores the base tree exactly.
#[derive(Debug, Clone)]
pub struct ScratchTree {
    tree: LocalTree,
    base_nnodes: usize,
    base_nleaves: usize,
    graft: Option<Graft>,
}

impl ScratchTree {
    pub fn new(tree: &LocalTree) -> Self {
        let mut tree = tree.clone();
        tree.nodes.reserve(2);
        Self {
            base_nnodes: tree.nnodes(),
            base_nleaves: tree.nleaves(),
            tree,
            graft: None,
        }
    }

    pub fn tree(&self) -> &LocalTree {
        &self.tree
    }

    pub fn new_leaf(&self) -> usize {
        self.base_nleaves
    }

    pub fn new_coal(&self) -> usize {
        self.base_nnodes + 1
    }

    /// Index that base-tree node `node` occupies while a graft is applied.
    pub fn grafted_index(&self, node: usize) -> usize {
        if node == self.base_nleaves && self.base_nleaves < self.base_nnodes {
            self.base_nnodes
        } else {
            node
        }
    }

    pub fn is_grafted(&self) -> bool {
        self.graft.is_some()
    }

    pub fn push(&mut self, node: usize, time: usize) -> Result<()> {
        if self.graft.is_some() {
            bail!("scratch tree already carries a grafted branch");
        }
        let n = self.base_nnodes;
        let leaf = self.base_nleaves;
        if node >= n {
            bail!("graft target {node} out of range for tree with {n} nodes");
        }
        let target = self.tree.nodes[node];
        if time < target.age {
            bail!("cannot graft at time {time} below node {node} (age {})", target.age);
        }
        if let Some(p) = target.parent
            && self.tree.nodes[p].age < time
        {
            bail!("cannot graft at time {time} above parent of node {node}");
        }

        let placeholder = LocalNode {
            parent: None,
            children: None,
            age: 0,
        };
        self.tree.nodes.push(placeholder);
        self.tree.nodes.push(placeholder);

        let displaced = leaf < n;
        if displaced {
            self.move_node(leaf, n)?;
        }

        let node2 = if displaced && node == leaf { n } else { node };
        let parent2 = self.tree.nodes[node2].parent;
        let coal = n + 1;

        self.tree.nodes[leaf] = LocalNode {
            parent: Some(coal),
            children: None,
            age: 0,
        };
        self.tree.nodes[coal] = LocalNode {
            parent: parent2,
            children: Some([leaf, node2]),
            age: time,
        };
        self.tree.nodes[node2].parent = Some(coal);
        match parent2 {
            Some(p) => self.tree.replace_child(p, node2, coal)?,
            None => self.tree.root = coal,
        }

        self.tree.nleaves += 1;
        self.tree.postorder = compute_postorder(&self.tree.nodes, self.tree.root)?;
        self.graft = Some(Graft { displaced });
        Ok(())
    }

    pub fn pop(&mut self) -> Result<()> {
        let graft = self
            .graft
            .take()
            .ok_or_else(|| anyhow!("scratch tree has no grafted branch to remove"))?;
        let n = self.base_nnodes;
        let leaf = self.base_nleaves;
        let coal = n + 1;

        let [c0, c1] = self.tree.nodes[coal]
            .children
            .ok_or_else(|| anyhow!("grafted coalescence node lost its children"))?;
        let node2 = if c0 == leaf { c1 } else { c0 };
        let parent2 = self.tree.nodes[coal].parent;
        self.tree.nodes[node2].parent = parent2;
        match parent2 {
            Some(p) => self.tree.replace_child(p, coal, node2)?,
            None => self.tree.root = node2,
        }

        if graft.displaced {
            self.move_node(n, leaf)?;
        }
        self.tree.nodes.truncate(n);
        self.tree.nleaves -= 1;
        self.tree.postorder = compute_postorder(&self.tree.nodes, self.tree.root)?;
        Ok(())
    }

    fn move_node(&mut self, from: usize, to: usize) -> Result<()> {
        let moved = self.tree.nodes[from];
        self.tree.nodes[to] = moved;
        if let Some(p) = moved.parent {
            self.tree.replace_child(p, from, to)?;
        }
        if let Some([c0, c1]) = moved.children {
            self.tree.nodes[c0].parent = Some(to);
            self.tree.nodes[c1].parent = Some(to);
        }
        if self.tree.root == from {
            self.tree.root = to;
        }
        Ok(())
    }
}

impl LocalTree {
    fn replace_child(&mut self, parent: usize, old: usize, new: usize) -> Result<()> {
        let c = self.children_mut(parent)?;
        if c[0] == old {
            c[0] = new;
        } else if c[1] == old {
            c[1] = new;
        } else {
            bail!("node {old} is not a child of node {parent}");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TreeBlock {
    pub tree: LocalTree,
    pub len: usize,
    /// Transition into this block from the previous one; `None` when the
    /// state space carries over unchanged.
    pub switch: Option<TransMatrixSwitch>,
}

#[derive(Debug, Clone)]
pub struct LocalTrees {
    pub start_coord: usize,
    pub blocks: Vec<TreeBlock>,
}

impl LocalTrees {
    pub fn new(start_coord: usize, blocks: Vec<TreeBlock>) -> Result<Self> {
        if blocks.is_empty() {
            bail!("ARG segmentation has no blocks");
        }
        for (i, b) in blocks.iter().enumerate() {
            if b.len == 0 {
                bail!("block {i} has zero length");
            }
        }
        if blocks[0].switch.is_some() {
            bail!("the first block cannot have an incoming switch matrix");
        }
        Ok(Self {
            start_coord,
            blocks,
        })
    }

    pub fn single(tree: LocalTree, len: usize) -> Result<Self> {
        Self::new(
            0,
            vec![TreeBlock {
                tree,
                len,
                switch: None,
            }],
        )
    }

    pub fn num_trees(&self) -> usize {
        self.blocks.len()
    }

    pub fn length(&self) -> usize {
        self.blocks.iter().map(|b| b.len).sum()
    }

    pub fn end_coord(&self) -> usize {
        self.start_coord + self.length()
    }

    pub fn iter_blocks(&self) -> impl Iterator<Item = (usize, usize, &TreeBlock)> {
        let mut end = self.start_coord;
        self.blocks.iter().map(move |b| {
            let start = end;
            end += b.len;
            (start, end, b)
        })
    }
}
