use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::io::params::ModelParamsFile;
use crate::io::{read_to_string, write_json};
use crate::model::ArgModel;
use crate::seq::Sequences;
use crate::trans::TransMatrixSwitch;
use crate::tree::{LocalTree, LocalTrees, TreeBlock};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedSeq {
    pub name: String,
    pub seq: String,
}

/// Switch matrix as stored on disk; probabilities are linear, not logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchSpec {
    pub nstates1: usize,
    pub nstates2: usize,
    #[serde(default)]
    pub recomb_src: Option<usize>,
    #[serde(default)]
    pub recoal_src: Option<usize>,
    pub determ: Vec<Option<usize>>,
    pub determ_prob: Vec<f64>,
    #[serde(default)]
    pub recomb_row: Vec<f64>,
    #[serde(default)]
    pub recoal_row: Vec<f64>,
}

impl SwitchSpec {
    pub fn to_switch(&self) -> Result<TransMatrixSwitch> {
        let ln = |v: &[f64]| v.iter().map(|p| p.ln()).collect::<Vec<_>>();
        TransMatrixSwitch::new(
            self.nstates1,
            self.nstates2,
            self.recomb_src,
            self.recoal_src,
            self.determ.clone(),
            ln(&self.determ_prob),
            ln(&self.recomb_row),
            ln(&self.recoal_row),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockSpec {
    /// Parent of each node; `null` for the root.
    pub parents: Vec<Option<usize>>,
    pub ages: Vec<usize>,
    pub len: usize,
    #[serde(default)]
    pub switch: Option<SwitchSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFile {
    pub model: ModelParamsFile,
    pub sequences: Vec<NamedSeq>,
    #[serde(default)]
    pub start_coord: usize,
    pub blocks: Vec<BlockSpec>,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub model: ArgModel,
    pub seqs: Sequences,
    pub trees: LocalTrees,
}

impl JobFile {
    pub fn into_job(self) -> Result<Job> {
        let model = ArgModel::from_params(&self.model).context("invalid model parameters")?;
        let mut seqs = Sequences::new();
        for s in &self.sequences {
            seqs.push(s.name.as_str(), &s.seq)
                .with_context(|| format!("invalid sequence {:?}", s.name))?;
        }
        if seqs.num_seqs() == 0 {
            bail!("job has no sequences");
        }
        let mut blocks = Vec::with_capacity(self.blocks.len());
        for (i, b) in self.blocks.iter().enumerate() {
            let tree = LocalTree::from_parents(&b.parents, &b.ages)
                .with_context(|| format!("invalid tree in block {i}"))?;
            let switch = match &b.switch {
                Some(sw) => Some(sw.to_switch().with_context(|| format!("invalid switch in block {i}"))?),
                None => None,
            };
            blocks.push(TreeBlock {
                tree,
                len: b.len,
                switch,
            });
        }
        let trees = LocalTrees::new(self.start_coord, blocks)?;
        Ok(Job { model, seqs, trees })
    }
}

pub fn load_job(path: &Path) -> Result<Job> {
    let content = read_to_string(path)?;
    let file: JobFile =
        serde_json::from_str(&content).with_context(|| format!("failed to parse {:?}", path))?;
    file.into_job().with_context(|| format!("invalid job file {:?}", path))
}

pub fn save_job(path: &Path, job: &JobFile) -> Result<()> {
    write_json(path, job)
}
