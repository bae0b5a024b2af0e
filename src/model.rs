use anyhow::{Result, bail};

use crate::io::params::{ModelParamsFile, save_params};

pub const DEFAULT_MINTIME: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct ArgModel {
    pub times: Vec<f64>,
    pub time_steps: Vec<f64>,
    pub popsizes: Vec<f64>,
    pub rho: f64,
    pub mu: f64,
    pub mintime: f64,
}

impl ArgModel {
    /// `popsizes` holds one entry per epoch (`ntimes - 1`) or a single
    /// value that is broadcast to every epoch.
    pub fn new(times: Vec<f64>, popsizes: Vec<f64>, rho: f64, mu: f64) -> Result<Self> {
        Self::with_mintime(times, popsizes, rho, mu, DEFAULT_MINTIME)
    }

    pub fn with_mintime(
        times: Vec<f64>,
        popsizes: Vec<f64>,
        rho: f64,
        mu: f64,
        mintime: f64,
    ) -> Result<Self> {
        let ntimes = times.len();
        if ntimes < 2 {
            bail!("time grid needs at least 2 points, got {ntimes}");
        }
        if times[0] != 0.0 {
            bail!("time grid must start at 0, got {}", times[0]);
        }
        for i in 1..ntimes {
            if !(times[i] > times[i - 1]) {
                bail!(
                    "time grid must be strictly increasing: times[{}]={} <= times[{}]={}",
                    i,
                    times[i],
                    i - 1,
                    times[i - 1]
                );
            }
        }
        let popsizes = match popsizes.len() {
            1 => vec![popsizes[0]; ntimes - 1],
            n if n == ntimes - 1 || n == ntimes => popsizes[..ntimes - 1].to_vec(),
            n => bail!(
                "popsizes length {n} does not match the {} epochs of the time grid",
                ntimes - 1
            ),
        };
        if let Some(p) = popsizes.iter().find(|p| !(**p > 0.0)) {
            bail!("population sizes must be positive, got {p}");
        }
        if !(rho >= 0.0) || !rho.is_finite() {
            bail!("recombination rate must be finite and >= 0, got {rho}");
        }
        if !(mu >= 0.0) || !mu.is_finite() {
            bail!("mutation rate must be finite and >= 0, got {mu}");
        }
        if !(mintime > 0.0) {
            bail!("mintime must be positive, got {mintime}");
        }
        let time_steps = times.windows(2).map(|w| w[1] - w[0]).collect();
        Ok(Self {
            times,
            time_steps,
            popsizes,
            rho,
            mu,
            mintime,
        })
    }

    /// Log-spaced grid: `t_i = (exp(i/(ntimes-1) * ln(1 + delta*maxtime)) - 1) / delta`.
    pub fn with_time_grid(
        ntimes: usize,
        maxtime: f64,
        delta: f64,
        popsize: f64,
        rho: f64,
        mu: f64,
    ) -> Result<Self> {
        Self::new(compute_times(ntimes, maxtime, delta)?, vec![popsize], rho, mu)
    }

    pub fn ntimes(&self) -> usize {
        self.times.len()
    }

    pub fn removed_root_time(&self) -> usize {
        self.ntimes() + 1
    }

    /// Oldest time index a state (or a real node) may occupy.
    pub fn max_state_time(&self) -> usize {
        self.ntimes() - 2
    }

    pub fn time(&self, idx: usize) -> f64 {
        self.times[idx.min(self.ntimes() - 1)]
    }

    pub fn dist(&self, lower: usize, upper: usize) -> f64 {
        (self.time(upper) - self.time(lower)).max(self.mintime)
    }

    pub fn to_params(&self) -> ModelParamsFile {
        ModelParamsFile {
            times: self.times.clone(),
            popsizes: self.popsizes.clone(),
            rho: self.rho,
            mu: self.mu,
            mintime: self.mintime,
        }
    }

    pub fn from_params(params: &ModelParamsFile) -> Result<Self> {
        Self::with_mintime(
            params.times.clone(),
            params.popsizes.clone(),
            params.rho,
            params.mu,
            params.mintime,
        )
    }

    pub fn save_params(&self, path: &std::path::Path) -> Result<()> {
        save_params(path, &self.to_params())
    }
}

pub fn compute_times(ntimes: usize, maxtime: f64, delta: f64) -> Result<Vec<f64>> {
    if ntimes < 2 {
        bail!("ntimes must be >= 2, got {ntimes}");
    }
    if !(maxtime > 0.0) || !(delta > 0.0) {
        bail!("maxtime and delta must be positive (maxtime={maxtime}, delta={delta})");
    }
    let scale = (1.0 + delta * maxtime).ln();
    let mut t = Vec::with_capacity(ntimes);
    for i in 0..ntimes {
        let x = i as f64 / (ntimes - 1) as f64;
        t.push(((x * scale).exp() - 1.0) / delta);
    }
    t[ntimes - 1] = maxtime;
    Ok(t)
}
