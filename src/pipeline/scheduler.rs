//! Denoise schedule configuration
//!
//! Whatever scheduler a repository configures, loading swaps it for a
//! DPM-Solver multistep configuration derived from the same beta parameters.
//! The configured class name is kept only for logging.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::error::{Error, Result};

/// How betas are spaced over the training timesteps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Linear in beta space
    Linear,
    /// Linear in sqrt-beta space, the Stable Diffusion default
    ScaledLinear,
    /// Cosine schedule capped at 0.999
    SquaredcosCapV2,
}

/// What the denoiser is trained to predict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    /// Noise prediction
    Epsilon,
    /// Velocity prediction
    VPrediction,
    /// Direct sample prediction
    Sample,
}

/// DPM-Solver multistep configuration.
///
/// Always describes the multistep solver: constructing one from a repository
/// file discards whichever scheduler class the repository asked for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Scheduler class the repository originally configured, if any
    #[serde(rename = "_class_name", default)]
    pub replaced_class: Option<String>,
    /// Training timestep count
    #[serde(default = "default_train_timesteps")]
    pub num_train_timesteps: usize,
    /// First beta
    #[serde(default = "default_beta_start")]
    pub beta_start: f64,
    /// Last beta
    #[serde(default = "default_beta_end")]
    pub beta_end: f64,
    /// Beta spacing
    #[serde(default = "default_beta_schedule")]
    pub beta_schedule: BetaSchedule,
    /// Denoiser target
    #[serde(default = "default_prediction_type")]
    pub prediction_type: PredictionType,
    /// Solver order
    #[serde(default = "default_solver_order")]
    pub solver_order: usize,
}

fn default_train_timesteps() -> usize {
    1000
}
fn default_beta_start() -> f64 {
    0.00085
}
fn default_beta_end() -> f64 {
    0.012
}
fn default_beta_schedule() -> BetaSchedule {
    BetaSchedule::ScaledLinear
}
fn default_prediction_type() -> PredictionType {
    PredictionType::Epsilon
}
fn default_solver_order() -> usize {
    2
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            replaced_class: None,
            num_train_timesteps: default_train_timesteps(),
            beta_start: default_beta_start(),
            beta_end: default_beta_end(),
            beta_schedule: default_beta_schedule(),
            prediction_type: default_prediction_type(),
            solver_order: default_solver_order(),
        }
    }
}

impl SolverConfig {
    /// Parse a repository `scheduler_config.json`, keeping its betas and
    /// replacing its scheduler class with the multistep solver.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        match &config.replaced_class {
            Some(class) => debug!("replacing configured {} with DPM-Solver multistep", class),
            None => debug!("scheduler config carries no class name, using DPM-Solver multistep"),
        }
        Ok(config)
    }
}

/// Concrete timestep schedule for one render
#[derive(Debug, Clone)]
pub struct SolverSchedule {
    timesteps: Vec<usize>,
    alphas_cumprod: Vec<f64>,
}

impl SolverSchedule {
    /// Build the schedule for `steps` inference steps.
    pub fn new(config: &SolverConfig, steps: usize) -> Result<Self> {
        let n = config.num_train_timesteps;
        if n < 2 {
            return Err(Error::config(
                "num_train_timesteps must be at least 2",
            ));
        }
        if steps == 0 {
            return Err(Error::invalid_input("step count must be > 0"));
        }
        if steps > n {
            return Err(Error::invalid_input(format!(
                "step count {} exceeds the {} training timesteps",
                steps, n
            )));
        }

        let betas = betas(config);
        let mut alphas_cumprod = Vec::with_capacity(n);
        let mut cumprod = 1.0;
        for beta in &betas {
            cumprod *= 1.0 - beta;
            alphas_cumprod.push(cumprod);
        }

        let timesteps = if steps == 1 {
            vec![n - 1]
        } else {
            (0..steps)
                .map(|i| (n - 1) * (steps - 1 - i) / (steps - 1))
                .collect()
        };

        Ok(Self {
            timesteps,
            alphas_cumprod,
        })
    }

    /// Timesteps in descending order, one per inference step
    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    /// Cumulative alpha product at timestep `t`. Out-of-range timesteps read
    /// as fully denoised (1.0), which is the boundary past the last step.
    pub fn alpha_cumprod(&self, t: usize) -> f64 {
        self.alphas_cumprod.get(t).copied().unwrap_or(1.0)
    }

    /// Number of inference steps
    pub fn len(&self) -> usize {
        self.timesteps.len()
    }

    /// True when the schedule carries no steps
    pub fn is_empty(&self) -> bool {
        self.timesteps.is_empty()
    }
}

fn betas(config: &SolverConfig) -> Vec<f64> {
    let n = config.num_train_timesteps;
    match config.beta_schedule {
        BetaSchedule::Linear => (0..n)
            .map(|i| {
                config.beta_start
                    + (config.beta_end - config.beta_start) * i as f64 / (n - 1) as f64
            })
            .collect(),
        BetaSchedule::ScaledLinear => {
            let start = config.beta_start.sqrt();
            let end = config.beta_end.sqrt();
            (0..n)
                .map(|i| {
                    let b = start + (end - start) * i as f64 / (n - 1) as f64;
                    b * b
                })
                .collect()
        }
        BetaSchedule::SquaredcosCapV2 => {
            let alpha_bar = |t: f64| {
                let v = (t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2;
                v.cos().powi(2)
            };
            (0..n)
                .map(|i| {
                    let t0 = i as f64 / n as f64;
                    let t1 = (i + 1) as f64 / n as f64;
                    (1.0 - alpha_bar(t1) / alpha_bar(t0)).min(0.999)
                })
                .collect()
        }
    }
}
