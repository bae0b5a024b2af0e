use anyhow::{Result, bail};

use crate::model::ArgModel;
use crate::states::{LineageCounts, State};
use crate::tree::LocalTree;

/// Accessor contract shared by block-local and block-boundary transitions.
/// An empty state space on either side stands for one implicit state.
pub trait Transition {
    fn nstates_from(&self) -> usize;
    fn nstates_to(&self) -> usize;
    fn get(&self, j: usize, k: usize) -> f64;

    fn get_log(&self, j: usize, k: usize) -> f64 {
        self.get(j, k).ln()
    }
}

/// Block-local transition of the threaded lineage under a discretized
/// sequentially Markov coalescent.
///
/// Entries depend on the source and destination times, plus a correction
/// when both states lie on the same branch. `get_time` exposes the
/// time-only part so the forward pass can work on per-time sums.
#[derive(Debug, Clone)]
pub struct TransMatrix {
    ntimes: usize,
    minage: usize,
    state_node: Vec<usize>,
    state_time: Vec<usize>,
    node_age: Vec<usize>,
    time_steps: Vec<f64>,
    cumhaz: Vec<f64>,
    coal: Vec<f64>,
    recomb: Vec<f64>,
    norecomb: Vec<f64>,
    /// Weighted survival sums below `m` (weights `dt_r`).
    below: Vec<f64>,
}

impl TransMatrix {
    pub fn new(
        tree: &LocalTree,
        states: &[State],
        lineages: &LineageCounts,
        model: &ArgModel,
        minage: usize,
    ) -> Result<Self> {
        let ntimes = model.ntimes();
        if lineages.nbranches.len() != ntimes || lineages.ncoals.len() != ntimes {
            bail!("lineage counts do not match the time grid of {ntimes} points");
        }
        if minage + 1 >= ntimes {
            bail!("minimum thread age {minage} leaves no usable time interval");
        }
        for (i, s) in states.iter().enumerate() {
            if s.node >= tree.nnodes() || s.time + 1 >= ntimes {
                bail!("state {i} ({}, {}) does not fit tree and time grid", s.node, s.time);
            }
        }

        let nt = ntimes - 1;
        let cumhaz = lineages.cumulative_hazard(model);
        let mut coal = vec![0.0; nt];
        for b in minage..nt {
            if lineages.ncoals[b] > 0 {
                coal[b] = lineages.coal_mass(&cumhaz, b, ntimes) / lineages.ncoals[b] as f64;
            }
        }

        let mut recomb = vec![0.0; nt];
        let mut norecomb = vec![1.0; nt];
        let mut below = vec![0.0; nt];
        let mut span = 0.0;
        let mut acc = 0.0;
        for a in minage..nt {
            let dt = model.time_steps[a];
            let w = span + dt / 2.0;
            let s = (-model.rho * w).exp();
            norecomb[a] = s;
            recomb[a] = -f64::exp_m1(-model.rho * w) / w;
            below[a] = acc;
            span += dt;
            if a + 1 < nt {
                acc = (acc + dt) * (cumhaz[a] - cumhaz[a + 1]).exp();
            }
        }

        Ok(Self {
            ntimes,
            minage,
            state_node: states.iter().map(|s| s.node).collect(),
            state_time: states.iter().map(|s| s.time).collect(),
            node_age: (0..tree.nnodes()).map(|n| tree.age(n)).collect(),
            time_steps: model.time_steps.clone(),
            cumhaz,
            coal,
            recomb,
            norecomb,
            below,
        })
    }

    pub fn ntimes(&self) -> usize {
        self.ntimes
    }

    pub fn minage(&self) -> usize {
        self.minage
    }

    pub fn nstates(&self) -> usize {
        self.state_node.len()
    }

    /// Transition mass from time `a` to a state at time `b` whose node has
    /// age `c`; `same` adds the no-recombination term for staying put.
    pub fn get_time(&self, a: usize, b: usize, c: usize, same: bool) -> f64 {
        if a < self.minage || b < self.minage {
            return 0.0;
        }
        let m = a.min(b);
        let w_m = if m == a {
            self.time_steps[a] / 2.0
        } else {
            self.time_steps[m]
        };
        let paths = self.below[m] + w_m;
        let mut p = self.recomb[a]
            * self.coal[b]
            * (-(self.cumhaz[b] - self.cumhaz[m])).exp()
            * paths;
        if same && a == b && b >= c {
            p += self.norecomb[a];
        }
        p
    }
}

impl Transition for TransMatrix {
    fn nstates_from(&self) -> usize {
        self.nstates()
    }

    fn nstates_to(&self) -> usize {
        self.nstates()
    }

    fn get(&self, j: usize, k: usize) -> f64 {
        if self.nstates() == 0 {
            return 1.0;
        }
        let node_k = self.state_node[k];
        self.get_time(
            self.state_time[j],
            self.state_time[k],
            self.node_age[node_k],
            self.state_node[j] == node_k,
        )
    }
}

/// Transition across a block boundary where the local tree changes.
///
/// Every source state carries over deterministically to at most one
/// destination, except the recombination and recoalescence sources whose
/// full outgoing rows are stored. All probabilities are in log space.
#[derive(Debug, Clone, PartialEq)]
pub struct TransMatrixSwitch {
    pub nstates1: usize,
    pub nstates2: usize,
    pub recomb_src: Option<usize>,
    pub recoal_src: Option<usize>,
    pub determ: Vec<Option<usize>>,
    pub determ_prob: Vec<f64>,
    pub recomb_row: Vec<f64>,
    pub recoal_row: Vec<f64>,
}

impl TransMatrixSwitch {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        nstates1: usize,
        nstates2: usize,
        recomb_src: Option<usize>,
        recoal_src: Option<usize>,
        determ: Vec<Option<usize>>,
        determ_prob: Vec<f64>,
        recomb_row: Vec<f64>,
        recoal_row: Vec<f64>,
    ) -> Result<Self> {
        let sw = Self {
            nstates1,
            nstates2,
            recomb_src,
            recoal_src,
            determ,
            determ_prob,
            recomb_row,
            recoal_row,
        };
        sw.validate()?;
        Ok(sw)
    }

    pub fn identity(nstates: usize) -> Self {
        let width = nstates.max(1);
        Self {
            nstates1: nstates,
            nstates2: nstates,
            recomb_src: None,
            recoal_src: None,
            determ: (0..width).map(Some).collect(),
            determ_prob: vec![0.0; width],
            recomb_row: Vec::new(),
            recoal_row: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let n1 = self.nstates1.max(1);
        let n2 = self.nstates2.max(1);
        if self.determ.len() != n1 || self.determ_prob.len() != n1 {
            bail!(
                "switch carry-over has {} entries and {} probabilities for {n1} source states",
                self.determ.len(),
                self.determ_prob.len()
            );
        }
        if let Some(bad) = self.determ.iter().flatten().find(|&&k| k >= n2) {
            bail!("switch carry-over destination {bad} exceeds {n2} states");
        }
        for (name, src, row) in [
            ("recombination", self.recomb_src, &self.recomb_row),
            ("recoalescence", self.recoal_src, &self.recoal_row),
        ] {
            if let Some(j) = src {
                if j >= n1 {
                    bail!("{name} source {j} exceeds {n1} source states");
                }
                if row.len() != n2 {
                    bail!("{name} row has {} entries for {n2} destination states", row.len());
                }
            }
        }
        Ok(())
    }
}

impl Transition for TransMatrixSwitch {
    fn nstates_from(&self) -> usize {
        self.nstates1
    }

    fn nstates_to(&self) -> usize {
        self.nstates2
    }

    fn get(&self, j: usize, k: usize) -> f64 {
        self.get_log(j, k).exp()
    }

    /// A state that is both recombination and recoalescence source takes
    /// the sum of the two rows.
    fn get_log(&self, j: usize, k: usize) -> f64 {
        let recoal = (Some(j) == self.recoal_src).then(|| self.recoal_row[k]);
        let recomb = (Some(j) == self.recomb_src).then(|| self.recomb_row[k]);
        match (recoal, recomb) {
            (Some(a), Some(b)) => log_add(a, b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) if self.determ[j] == Some(k) => self.determ_prob[j],
            (None, None) => f64::NEG_INFINITY,
        }
    }
}

fn log_add(a: f64, b: f64) -> f64 {
    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    if lo == f64::NEG_INFINITY {
        hi
    } else {
        hi + (lo - hi).exp().ln_1p()
    }
}
