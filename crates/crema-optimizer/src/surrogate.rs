//! Surrogate model of reward as a function of brew parameters.
//!
//! The [`SurrogateModel`] trait hides the model family from the loop; the
//! shipped implementation is a Gaussian process over the unit hypercube of
//! the [`ParameterSpace`].

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crema_types::{CremaError, CremaResult, ParameterSet, Trial};

use crate::space::ParameterSpace;

/// An encoded point and the reward observed there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub point: Vec<f64>,
    pub value: f64,
}

/// Predicted reward with one standard deviation of uncertainty.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub mean: f64,
    pub std_dev: f64,
}

/// Capability interface for reward surrogates.
pub trait SurrogateModel: Send + Sync {
    /// Fit against every rewarded trial in `history`.
    fn fit(&mut self, history: &[Trial]) -> CremaResult<()>;

    fn predict(&self, params: &ParameterSet) -> Prediction;

    /// Predict at a point already encoded into the unit hypercube.
    fn predict_encoded(&self, point: &[f64]) -> Prediction;

    fn observation_count(&self) -> usize;

    /// Whether the model has enough data to be more than its prior.
    fn is_informed(&self) -> bool;

    /// Serializable state needed to reproduce the fit after a restart.
    fn snapshot(&self) -> serde_json::Value;

    fn restore(&mut self, snapshot: &serde_json::Value) -> CremaResult<()>;

    fn name(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpConfig {
    /// Below this many rewarded trials the model stays in prior mode.
    pub min_observations: usize,
    /// Standard deviation reported in prior mode.
    pub prior_std: f64,
    /// Kernel output scale in standardized target units.
    pub signal_std: f64,
    /// Candidate length scales (unit-hypercube distance).
    pub length_scales: Vec<f64>,
    /// Candidate observation-noise standard deviations (standardized units).
    pub noise_levels: Vec<f64>,
    /// Hyperparameters are re-selected on every fit up to this many observations.
    pub full_refit_limit: usize,
    /// Past the limit, re-select every this many new observations.
    pub hyperparameter_interval: usize,
    pub max_jitter_attempts: u32,
}

impl Default for GpConfig {
    fn default() -> Self {
        Self {
            min_observations: 3,
            prior_std: 1.0,
            signal_std: 1.0,
            length_scales: vec![0.1, 0.2, 0.35, 0.5, 0.8],
            noise_levels: vec![0.02, 0.05, 0.1, 0.2],
            full_refit_limit: 30,
            hyperparameter_interval: 10,
            max_jitter_attempts: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpHyperparameters {
    pub length_scale: f64,
    pub noise_std: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GpSnapshot {
    hyperparameters: Option<GpHyperparameters>,
    selected_at: usize,
}

/// Gaussian-process regression with a squared-exponential kernel.
#[derive(Debug, Clone)]
pub struct GaussianProcess {
    space: ParameterSpace,
    config: GpConfig,
    hyper: Option<GpHyperparameters>,
    /// Observation count at the last hyperparameter selection.
    selected_at: usize,
    points: Vec<Vec<f64>>,
    targets: Vec<f64>,
    mean_offset: f64,
    /// Target standard deviation; predictions are rescaled by it.
    target_scale: f64,
    /// Lower Cholesky factor of K + noise * I.
    chol: Option<DMatrix<f64>>,
    alpha: Option<DVector<f64>>,
}

impl GaussianProcess {
    pub fn new(space: ParameterSpace, config: GpConfig) -> Self {
        Self {
            space,
            config,
            hyper: None,
            selected_at: 0,
            points: Vec::new(),
            targets: Vec::new(),
            mean_offset: 0.0,
            target_scale: 1.0,
            chol: None,
            alpha: None,
        }
    }

    pub fn with_defaults(space: ParameterSpace) -> Self {
        Self::new(space, GpConfig::default())
    }

    pub fn hyperparameters(&self) -> Option<GpHyperparameters> {
        self.hyper
    }

    pub fn config(&self) -> &GpConfig {
        &self.config
    }

    fn kernel(&self, a: &[f64], b: &[f64], length_scale: f64) -> f64 {
        let sq: f64 = a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum();
        self.config.signal_std.powi(2) * (-0.5 * sq / length_scale.powi(2)).exp()
    }

    /// Factorize K + noise * I, escalating jitter on failure.
    fn factorize(&self, points: &[Vec<f64>], hyper: GpHyperparameters) -> Option<DMatrix<f64>> {
        let n = points.len();
        let noise = hyper.noise_std.powi(2);
        let mut jitter = 0.0;
        for attempt in 0..=self.config.max_jitter_attempts {
            let k = DMatrix::from_fn(n, n, |i, j| {
                let mut v = self.kernel(&points[i], &points[j], hyper.length_scale);
                if i == j {
                    v += noise + jitter;
                }
                v
            });
            if let Some(chol) = k.cholesky() {
                return Some(chol.unpack());
            }
            jitter = 1e-8 * 10f64.powi(attempt as i32 + 1);
            debug!(attempt, jitter, "cholesky failed, adding jitter");
        }
        None
    }

    /// Extend an existing factor with rows for `new_points`.
    fn extend_factor(
        &self,
        mut l: DMatrix<f64>,
        old_points: &[Vec<f64>],
        new_points: &[Vec<f64>],
        hyper: GpHyperparameters,
    ) -> Option<DMatrix<f64>> {
        let noise = hyper.noise_std.powi(2);
        let mut known: Vec<&Vec<f64>> = old_points.iter().collect();
        for x in new_points {
            let n = known.len();
            let k = DVector::from_iterator(
                n,
                known.iter().map(|p| self.kernel(p, x, hyper.length_scale)),
            );
            let row = l.solve_lower_triangular(&k)?;
            let diag_sq = self.kernel(x, x, hyper.length_scale) + noise - row.dot(&row);
            if diag_sq <= 1e-12 {
                return None;
            }
            let d = diag_sq.sqrt();
            l = DMatrix::from_fn(n + 1, n + 1, |i, j| {
                if i < n && j < n {
                    l[(i, j)]
                } else if i == n && j < n {
                    row[j]
                } else if i == n && j == n {
                    d
                } else {
                    0.0
                }
            });
            known.push(x);
        }
        Some(l)
    }

    fn solve_alpha(l: &DMatrix<f64>, y: &DVector<f64>) -> Option<DVector<f64>> {
        let z = l.solve_lower_triangular(y)?;
        l.tr_solve_lower_triangular(&z)
    }

    fn log_marginal_likelihood(l: &DMatrix<f64>, y: &DVector<f64>, alpha: &DVector<f64>) -> f64 {
        let n = y.len() as f64;
        let log_det: f64 = (0..l.nrows()).map(|i| l[(i, i)].ln()).sum();
        -0.5 * y.dot(alpha) - log_det - 0.5 * n * (2.0 * std::f64::consts::PI).ln()
    }

    /// Grid search over length scale and noise by log marginal likelihood.
    fn select_hyperparameters(
        &self,
        points: &[Vec<f64>],
        y: &DVector<f64>,
    ) -> Option<(GpHyperparameters, DMatrix<f64>, DVector<f64>)> {
        let mut best: Option<(f64, GpHyperparameters, DMatrix<f64>, DVector<f64>)> = None;
        for &length_scale in &self.config.length_scales {
            for &noise_std in &self.config.noise_levels {
                let hyper = GpHyperparameters {
                    length_scale,
                    noise_std,
                };
                let Some(l) = self.factorize(points, hyper) else {
                    continue;
                };
                let Some(alpha) = Self::solve_alpha(&l, y) else {
                    continue;
                };
                let lml = Self::log_marginal_likelihood(&l, y, &alpha);
                if !lml.is_finite() {
                    continue;
                }
                if best.as_ref().map_or(true, |(b, ..)| lml > *b) {
                    best = Some((lml, hyper, l, alpha));
                }
            }
        }
        best.map(|(lml, hyper, l, alpha)| {
            debug!(
                length_scale = hyper.length_scale,
                noise_std = hyper.noise_std,
                lml,
                "selected GP hyperparameters"
            );
            (hyper, l, alpha)
        })
    }

    fn prior(&self) -> Prediction {
        Prediction {
            mean: self.mean_offset,
            std_dev: self.config.prior_std,
        }
    }
}

/// Mean and standard deviation of the targets. A spread too small to divide
/// by falls back to a unit scale.
fn standardization(targets: &[f64]) -> (f64, f64) {
    if targets.is_empty() {
        return (0.0, 1.0);
    }
    let n = targets.len() as f64;
    let mean = targets.iter().sum::<f64>() / n;
    let std = (targets.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    (mean, if std > 1e-9 { std } else { 1.0 })
}

impl SurrogateModel for GaussianProcess {
    fn fit(&mut self, history: &[Trial]) -> CremaResult<()> {
        let observations: Vec<Observation> = history
            .iter()
            .filter_map(|t| {
                t.reward.map(|r| Observation {
                    point: self.space.encode(&t.parameters),
                    value: r.value,
                })
            })
            .collect();

        if let Some(bad) = observations.iter().find(|o| !o.value.is_finite()) {
            return Err(CremaError::ModelFit {
                message: format!("non-finite reward {} in history", bad.value),
            });
        }

        let n = observations.len();
        let points: Vec<Vec<f64>> = observations.iter().map(|o| o.point.clone()).collect();
        let targets: Vec<f64> = observations.iter().map(|o| o.value).collect();
        let (mean_offset, target_scale) = standardization(&targets);

        if n < self.config.min_observations {
            self.points = points;
            self.targets = targets;
            self.mean_offset = mean_offset;
            self.target_scale = target_scale;
            self.chol = None;
            self.alpha = None;
            return Ok(());
        }

        let y = DVector::from_iterator(
            n,
            targets.iter().map(|v| (v - mean_offset) / target_scale),
        );

        let reselect = match self.hyper {
            None => true,
            Some(_) => {
                n <= self.config.full_refit_limit
                    || n.saturating_sub(self.selected_at) >= self.config.hyperparameter_interval
            }
        };

        let (hyper, l) = if reselect {
            let (hyper, l, _) = self.select_hyperparameters(&points, &y).ok_or_else(|| {
                CremaError::ModelFit {
                    message: format!("no hyperparameters gave a usable factorization over {n} trials"),
                }
            })?;
            (hyper, l)
        } else {
            let hyper = self
                .hyper
                .ok_or_else(|| CremaError::Internal("GP hyperparameters missing".into()))?;
            let old_n = self.points.len();
            let grows = old_n < n && self.points[..] == points[..old_n];
            let extended = match (&self.chol, grows) {
                (Some(l), true) if l.nrows() == old_n => {
                    self.extend_factor(l.clone(), &points[..old_n], &points[old_n..], hyper)
                }
                _ => None,
            };
            let l = match extended {
                Some(l) => l,
                None => self.factorize(&points, hyper).ok_or_else(|| CremaError::ModelFit {
                    message: format!("cholesky factorization failed over {n} trials"),
                })?,
            };
            (hyper, l)
        };

        let alpha = Self::solve_alpha(&l, &y).ok_or_else(|| CremaError::ModelFit {
            message: "triangular solve failed".into(),
        })?;
        if alpha.iter().any(|a| !a.is_finite()) {
            warn!(observations = n, "GP weights are not finite");
            return Err(CremaError::ModelFit {
                message: "GP weights are not finite".into(),
            });
        }

        if reselect {
            self.selected_at = n;
        }
        self.hyper = Some(hyper);
        self.points = points;
        self.targets = targets;
        self.mean_offset = mean_offset;
        self.target_scale = target_scale;
        self.chol = Some(l);
        self.alpha = Some(alpha);
        Ok(())
    }

    fn predict(&self, params: &ParameterSet) -> Prediction {
        self.predict_encoded(&self.space.encode(params))
    }

    fn predict_encoded(&self, point: &[f64]) -> Prediction {
        let (Some(l), Some(alpha), Some(hyper)) = (&self.chol, &self.alpha, self.hyper) else {
            return self.prior();
        };
        let k = DVector::from_iterator(
            self.points.len(),
            self.points
                .iter()
                .map(|p| self.kernel(p, point, hyper.length_scale)),
        );
        let mean = self.mean_offset + self.target_scale * k.dot(alpha);
        let variance = match l.solve_lower_triangular(&k) {
            Some(v) => self.kernel(point, point, hyper.length_scale) - v.dot(&v),
            None => return self.prior(),
        };
        Prediction {
            mean,
            std_dev: self.target_scale * variance.max(1e-12).sqrt(),
        }
    }

    fn observation_count(&self) -> usize {
        self.points.len()
    }

    fn is_informed(&self) -> bool {
        self.chol.is_some()
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(GpSnapshot {
            hyperparameters: self.hyper,
            selected_at: self.selected_at,
        })
        .unwrap_or(serde_json::Value::Null)
    }

    fn restore(&mut self, snapshot: &serde_json::Value) -> CremaResult<()> {
        if snapshot.is_null() {
            return Ok(());
        }
        let state: GpSnapshot = serde_json::from_value(snapshot.clone())?;
        self.hyper = state.hyperparameters;
        self.selected_at = state.selected_at;
        self.chol = None;
        self.alpha = None;
        Ok(())
    }

    fn name(&self) -> &str {
        "gaussian_process"
    }
}
