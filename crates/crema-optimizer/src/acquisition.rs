//! Acquisition: choose the next parameter set from a fitted surrogate.

use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crema_types::{AcquisitionKind, CremaError, CremaResult, ParameterSet, RunConfig, TrialHistory};

use crate::space::ParameterSpace;
use crate::surrogate::{Prediction, SurrogateModel};

/// Standard normal density.
pub fn normal_pdf(z: f64) -> f64 {
    (-0.5 * z * z).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

/// Standard normal CDF.
pub fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + libm::erf(z / std::f64::consts::SQRT_2))
}

/// Expected improvement of a Gaussian prediction over `best`.
pub fn expected_improvement(mean: f64, std_dev: f64, best: f64, xi: f64) -> f64 {
    let gain = mean - best - xi;
    if std_dev <= 1e-12 {
        return gain.max(0.0);
    }
    let z = gain / std_dev;
    (gain * normal_cdf(z) + std_dev * normal_pdf(z)).max(0.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AcquisitionFunction {
    ExpectedImprovement { xi: f64 },
    UpperConfidenceBound { beta: f64 },
    ProbabilityOfImprovement { xi: f64 },
}

impl AcquisitionFunction {
    /// Map the configured kind and exploration weight to a concrete function.
    ///
    /// For UCB the weight is scaled by 20, so the default weight of 0.1
    /// gives the customary two standard deviations.
    pub fn from_kind(kind: AcquisitionKind, exploration_weight: f64) -> Self {
        match kind {
            AcquisitionKind::ExpectedImprovement => Self::ExpectedImprovement {
                xi: exploration_weight,
            },
            AcquisitionKind::UpperConfidenceBound => Self::UpperConfidenceBound {
                beta: 20.0 * exploration_weight,
            },
            AcquisitionKind::ProbabilityOfImprovement => Self::ProbabilityOfImprovement {
                xi: exploration_weight,
            },
        }
    }

    pub fn score(&self, prediction: Prediction, best: f64) -> f64 {
        match *self {
            Self::ExpectedImprovement { xi } => {
                expected_improvement(prediction.mean, prediction.std_dev, best, xi)
            }
            Self::UpperConfidenceBound { beta } => prediction.mean + beta * prediction.std_dev,
            Self::ProbabilityOfImprovement { xi } => {
                if prediction.std_dev <= 1e-12 {
                    if prediction.mean > best + xi {
                        1.0
                    } else {
                        0.0
                    }
                } else {
                    normal_cdf((prediction.mean - best - xi) / prediction.std_dev)
                }
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ExpectedImprovement { .. } => "expected_improvement",
            Self::UpperConfidenceBound { .. } => "upper_confidence_bound",
            Self::ProbabilityOfImprovement { .. } => "probability_of_improvement",
        }
    }
}

/// Where a proposal came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalSource {
    /// Space-filling design before the model is trusted.
    SpaceFilling,
    /// Maximizer of the acquisition function.
    Surrogate,
    /// Nearest previously executed set after repeated safety rejections.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub parameters: ParameterSet,
    pub source: ProposalSource,
    /// Acquisition score of the chosen candidate.
    pub score: Option<f64>,
    pub prediction: Option<Prediction>,
    /// Largest expected improvement over the admissible candidate pool.
    pub expected_improvement: Option<f64>,
}

impl Proposal {
    pub fn space_filling(parameters: ParameterSet) -> Self {
        Self {
            parameters,
            source: ProposalSource::SpaceFilling,
            score: None,
            prediction: None,
            expected_improvement: None,
        }
    }

    pub fn fallback(parameters: ParameterSet) -> Self {
        Self {
            source: ProposalSource::Fallback,
            ..Self::space_filling(parameters)
        }
    }

    pub fn is_model_driven(&self) -> bool {
        self.source == ProposalSource::Surrogate
    }
}

struct Scored {
    parameters: ParameterSet,
    prediction: Prediction,
    score: f64,
    ei: f64,
    min_distance: f64,
}

/// Candidate-pool maximizer of an [`AcquisitionFunction`].
///
/// The pool mixes uniform samples (exploration) with perturbations of the best
/// observed trials (exploitation). Candidates are snapped to legal values
/// before scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionStrategy {
    pub function: AcquisitionFunction,
    pub candidate_count: usize,
    /// Share of the pool spent on local perturbations.
    pub local_fraction: f64,
    /// Perturbation half-width in unit-hypercube coordinates.
    pub local_scale: f64,
    /// Number of top trials perturbed.
    pub elite_count: usize,
    pub tie_tolerance: f64,
    pub duplicate_radius: f64,
    pub retrial_min_std: f64,
}

impl AcquisitionStrategy {
    pub fn new(function: AcquisitionFunction, candidate_count: usize) -> Self {
        Self {
            function,
            candidate_count: candidate_count.max(1),
            local_fraction: 0.25,
            local_scale: 0.1,
            elite_count: 3,
            tie_tolerance: 1e-9,
            duplicate_radius: 0.01,
            retrial_min_std: 0.05,
        }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(
            AcquisitionFunction::from_kind(config.acquisition, config.exploration_weight),
            config.candidate_count,
        )
    }

    pub fn with_local_search(mut self, fraction: f64, scale: f64) -> Self {
        self.local_fraction = fraction.clamp(0.0, 1.0);
        self.local_scale = scale.max(0.0);
        self
    }

    pub fn with_duplicate_radius(mut self, radius: f64, retrial_min_std: f64) -> Self {
        self.duplicate_radius = radius.max(0.0);
        self.retrial_min_std = retrial_min_std;
        self
    }

    pub fn with_tie_tolerance(mut self, tolerance: f64) -> Self {
        self.tie_tolerance = tolerance.max(0.0);
        self
    }

    fn candidates<R: Rng + ?Sized>(
        &self,
        history: &TrialHistory,
        space: &ParameterSpace,
        rng: &mut R,
    ) -> Vec<ParameterSet> {
        let mut elites: Vec<(f64, Vec<f64>)> = history
            .rewarded()
            .filter_map(|t| t.reward_value().map(|r| (r, space.encode(&t.parameters))))
            .collect();
        // Stable sort keeps earlier trials first among equal rewards
        elites.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        elites.truncate(self.elite_count);

        let local = if elites.is_empty() {
            0
        } else {
            (self.candidate_count as f64 * self.local_fraction).round() as usize
        };
        let uniform = self.candidate_count.saturating_sub(local).max(1);

        let mut out = Vec::with_capacity(uniform + local);
        for _ in 0..uniform {
            out.push(space.decode(&space.random_unit(rng)));
        }
        for i in 0..local {
            let (_, centre) = &elites[i % elites.len()];
            let unit: Vec<f64> = centre
                .iter()
                .map(|c| {
                    let noise = if self.local_scale > 0.0 {
                        rng.gen_range(-self.local_scale..self.local_scale)
                    } else {
                        0.0
                    };
                    (c + noise).clamp(0.0, 1.0)
                })
                .collect();
            out.push(space.decode(&unit));
        }
        out
    }

    /// Score the admissible, non-duplicate part of a fresh candidate pool.
    ///
    /// Returns the scored candidates and the largest expected improvement
    /// among them. Errors when no candidate has a finite score.
    fn score_pool<R: Rng + ?Sized>(
        &self,
        surrogate: &dyn SurrogateModel,
        history: &TrialHistory,
        space: &ParameterSpace,
        admissible: &dyn Fn(&ParameterSet) -> bool,
        rng: &mut R,
    ) -> CremaResult<(Vec<Scored>, f64)> {
        let best = history
            .best()
            .and_then(|t| t.reward_value())
            .unwrap_or(0.0);
        let xi = match self.function {
            AcquisitionFunction::ExpectedImprovement { xi }
            | AcquisitionFunction::ProbabilityOfImprovement { xi } => xi,
            AcquisitionFunction::UpperConfidenceBound { .. } => 0.0,
        };
        let tried: Vec<Vec<f64>> = history
            .trials()
            .iter()
            .map(|t| space.encode(&t.parameters))
            .collect();

        let pool: Vec<ParameterSet> = self
            .candidates(history, space, rng)
            .into_iter()
            .filter(|c| admissible(c))
            .collect();
        let total = pool.len();

        let scored: Vec<Scored> = pool
            .into_par_iter()
            .map(|parameters| {
                let point = space.encode(&parameters);
                let prediction = surrogate.predict_encoded(&point);
                Scored {
                    score: self.function.score(prediction, best),
                    ei: expected_improvement(prediction.mean, prediction.std_dev, best, xi),
                    min_distance: space.min_distance(&point, &tried),
                    prediction,
                    parameters,
                }
            })
            .filter(|s| {
                s.score.is_finite()
                    && (s.min_distance >= self.duplicate_radius
                        || s.prediction.std_dev >= self.retrial_min_std)
            })
            .collect();

        if scored.is_empty() {
            return Err(CremaError::Validation(format!(
                "no admissible candidate among {} sampled ({total} passed safety)",
                self.candidate_count
            )));
        }
        let max_ei = scored.iter().map(|s| s.ei).fold(0.0, f64::max);
        Ok((scored, max_ei))
    }

    fn to_proposal(&self, s: &Scored, max_ei: f64) -> Proposal {
        Proposal {
            parameters: s.parameters.clone(),
            source: ProposalSource::Surrogate,
            score: Some(s.score),
            prediction: Some(s.prediction),
            expected_improvement: Some(max_ei),
        }
    }

    /// Pick the admissible candidate with the highest acquisition score.
    ///
    /// `admissible` must reflect the safety checks that will be applied to the
    /// proposal, so the result is never rejected downstream.
    pub fn propose<R: Rng + ?Sized>(
        &self,
        surrogate: &dyn SurrogateModel,
        history: &TrialHistory,
        space: &ParameterSpace,
        admissible: &dyn Fn(&ParameterSet) -> bool,
        rng: &mut R,
    ) -> CremaResult<Proposal> {
        let (scored, max_ei) = self.score_pool(surrogate, history, space, admissible, rng)?;
        let top = scored.iter().map(|s| s.score).fold(f64::NEG_INFINITY, f64::max);

        let mut chosen: Option<&Scored> = None;
        for s in scored.iter().filter(|s| s.score >= top - self.tie_tolerance) {
            if chosen.map_or(true, |c| s.min_distance > c.min_distance) {
                chosen = Some(s);
            }
        }
        let chosen = chosen.ok_or_else(|| CremaError::Internal("empty tie set".into()))?;

        debug!(
            function = self.function.name(),
            pool = scored.len(),
            score = chosen.score,
            mean = chosen.prediction.mean,
            std_dev = chosen.prediction.std_dev,
            max_ei,
            "acquisition proposal"
        );

        Ok(self.to_proposal(chosen, max_ei))
    }

    /// The `k` best-scoring distinct candidates, best first.
    ///
    /// Candidates closer than the duplicate radius to an already listed one
    /// are skipped, so the list offers real alternatives.
    pub fn recommend<R: Rng + ?Sized>(
        &self,
        surrogate: &dyn SurrogateModel,
        history: &TrialHistory,
        space: &ParameterSpace,
        admissible: &dyn Fn(&ParameterSet) -> bool,
        k: usize,
        rng: &mut R,
    ) -> CremaResult<Vec<Proposal>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let (mut scored, max_ei) = self.score_pool(surrogate, history, space, admissible, rng)?;
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.min_distance
                        .partial_cmp(&a.min_distance)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        });

        let radius = self.duplicate_radius.max(1e-9);
        let mut listed: Vec<Vec<f64>> = Vec::with_capacity(k);
        let mut picked: Vec<&Scored> = Vec::with_capacity(k);
        for s in &scored {
            let point = space.encode(&s.parameters);
            if space.min_distance(&point, &listed) < radius {
                continue;
            }
            listed.push(point);
            picked.push(s);
            if picked.len() == k {
                break;
            }
        }
        debug!(
            function = self.function.name(),
            pool = scored.len(),
            returned = picked.len(),
            "acquisition recommendations"
        );
        Ok(picked
            .into_iter()
            .map(|s| self.to_proposal(s, max_ei))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surrogate::{GaussianProcess, GpConfig};
    use crema_types::{Bound, Reward, Trial, TrialMeasurement};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    /// Fixed-response surrogate peaked at x = 0.3.
    struct Bowl {
        std_dev: f64,
    }

    impl SurrogateModel for Bowl {
        fn fit(&mut self, _history: &[Trial]) -> CremaResult<()> {
            Ok(())
        }
        fn predict(&self, _params: &ParameterSet) -> Prediction {
            unreachable!("tests use predict_encoded")
        }
        fn predict_encoded(&self, point: &[f64]) -> Prediction {
            Prediction {
                mean: 1.0 - (point[0] - 0.3).abs(),
                std_dev: self.std_dev,
            }
        }
        fn observation_count(&self) -> usize {
            0
        }
        fn is_informed(&self) -> bool {
            true
        }
        fn snapshot(&self) -> serde_json::Value {
            serde_json::Value::Null
        }
        fn restore(&mut self, _snapshot: &serde_json::Value) -> CremaResult<()> {
            Ok(())
        }
        fn name(&self) -> &str {
            "bowl"
        }
    }

    struct Flat;

    impl SurrogateModel for Flat {
        fn fit(&mut self, _history: &[Trial]) -> CremaResult<()> {
            Ok(())
        }
        fn predict(&self, _params: &ParameterSet) -> Prediction {
            self.predict_encoded(&[])
        }
        fn predict_encoded(&self, _point: &[f64]) -> Prediction {
            Prediction {
                mean: 0.0,
                std_dev: 0.3,
            }
        }
        fn observation_count(&self) -> usize {
            0
        }
        fn is_informed(&self) -> bool {
            true
        }
        fn snapshot(&self) -> serde_json::Value {
            serde_json::Value::Null
        }
        fn restore(&mut self, _snapshot: &serde_json::Value) -> CremaResult<()> {
            Ok(())
        }
        fn name(&self) -> &str {
            "flat"
        }
    }

    fn line_space() -> ParameterSpace {
        ParameterSpace::new(vec![Bound::new("x", 0.0, 1.0)]).unwrap()
    }

    fn history_at(points: &[(f64, f64)]) -> TrialHistory {
        let mut history = TrialHistory::new();
        for (i, (x, r)) in points.iter().enumerate() {
            history
                .push(Trial::measured(
                    i as u64,
                    ParameterSet::new().with_scalar("x", *x),
                    TrialMeasurement::new(30.0, 36.0),
                    Reward::final_value(*r),
                ))
                .unwrap();
        }
        history
    }

    fn ei() -> AcquisitionStrategy {
        AcquisitionStrategy::new(AcquisitionFunction::ExpectedImprovement { xi: 0.0 }, 256)
    }

    #[test]
    fn normal_helpers() {
        assert_eq!(normal_cdf(0.0), 0.5);
        assert!((normal_cdf(1.959_963_984_540_054) - 0.975).abs() < 1e-12);
        assert!((normal_cdf(-3.0) - 0.001_349_898_031_630_094_6).abs() < 1e-12);
        assert!((normal_cdf(-1.0) + normal_cdf(1.0) - 1.0).abs() < 1e-12);
        assert!((normal_pdf(0.0) - 0.398_942_28).abs() < 1e-6);
    }

    #[test]
    fn expected_improvement_properties() {
        assert_eq!(expected_improvement(0.5, 0.0, 0.2, 0.0), 0.3);
        assert_eq!(expected_improvement(0.1, 0.0, 0.2, 0.0), 0.0);
        // Uncertainty alone has positive value
        assert!(expected_improvement(0.2, 0.3, 0.2, 0.0) > 0.0);
        // More uncertainty, more improvement at equal mean
        assert!(expected_improvement(0.0, 0.5, 0.2, 0.0) > expected_improvement(0.0, 0.1, 0.2, 0.0));
    }

    #[test]
    fn from_kind_uses_exploration_weight() {
        assert_eq!(
            AcquisitionFunction::from_kind(AcquisitionKind::ExpectedImprovement, 0.05),
            AcquisitionFunction::ExpectedImprovement { xi: 0.05 }
        );
        assert_eq!(
            AcquisitionFunction::from_kind(AcquisitionKind::UpperConfidenceBound, 0.1),
            AcquisitionFunction::UpperConfidenceBound { beta: 2.0 }
        );
    }

    #[test]
    fn proposes_near_the_predicted_optimum() {
        let history = history_at(&[(0.9, 0.2)]);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let proposal = ei()
            .propose(&Bowl { std_dev: 0.01 }, &history, &line_space(), &|_| true, &mut rng)
            .unwrap();
        let x = proposal.parameters.scalar("x").unwrap();
        assert!((x - 0.3).abs() < 0.05, "x = {x}");
        assert_eq!(proposal.source, ProposalSource::Surrogate);
        assert!(proposal.expected_improvement.unwrap() > 0.5);
    }

    #[test]
    fn respects_admissibility() {
        let history = history_at(&[(0.9, 0.2)]);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let admissible = |p: &ParameterSet| p.scalar("x").map_or(false, |x| x >= 0.5);
        let proposal = ei()
            .propose(&Bowl { std_dev: 0.01 }, &history, &line_space(), &admissible, &mut rng)
            .unwrap();
        let x = proposal.parameters.scalar("x").unwrap();
        assert!(x >= 0.5);
        assert!(x < 0.6);
    }

    #[test]
    fn nothing_admissible_is_a_validation_error() {
        let history = history_at(&[(0.9, 0.2)]);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let err = ei()
            .propose(&Bowl { std_dev: 0.01 }, &history, &line_space(), &|_| false, &mut rng)
            .unwrap_err();
        assert!(matches!(err, CremaError::Validation(_)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn skips_confident_duplicates() {
        let history = history_at(&[(0.3, 0.9)]);
        let strategy = ei().with_duplicate_radius(0.05, 0.05);
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let proposal = strategy
            .propose(&Bowl { std_dev: 0.01 }, &history, &line_space(), &|_| true, &mut rng)
            .unwrap();
        let x = proposal.parameters.scalar("x").unwrap();
        assert!((x - 0.3).abs() >= 0.05, "x = {x}");
    }

    #[test]
    fn ties_prefer_distance_from_prior_trials() {
        let history = history_at(&[(0.0, 0.0)]);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let proposal = ei()
            .propose(&Flat, &history, &line_space(), &|_| true, &mut rng)
            .unwrap();
        assert!(proposal.parameters.scalar("x").unwrap() > 0.9);
    }

    #[test]
    fn same_seed_same_proposal() {
        let history = history_at(&[(0.1, 0.1), (0.5, 0.6), (0.8, 0.3), (0.35, 0.7)]);
        let mut gp = GaussianProcess::new(line_space(), GpConfig::default());
        gp.fit(history.trials()).unwrap();
        let a = ei()
            .propose(&gp, &history, &line_space(), &|_| true, &mut ChaCha8Rng::seed_from_u64(42))
            .unwrap();
        let b = ei()
            .propose(&gp, &history, &line_space(), &|_| true, &mut ChaCha8Rng::seed_from_u64(42))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn recommendations_are_ranked_and_distinct() {
        let history = history_at(&[(0.9, 0.2)]);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let strategy = ei().with_duplicate_radius(0.05, 0.05);
        let list = strategy
            .recommend(&Bowl { std_dev: 0.01 }, &history, &line_space(), &|_| true, 3, &mut rng)
            .unwrap();
        assert_eq!(list.len(), 3);
        let xs: Vec<f64> = list.iter().map(|p| p.parameters.scalar("x").unwrap()).collect();
        assert!((xs[0] - 0.3).abs() < 0.05, "xs = {xs:?}");
        for pair in list.windows(2) {
            assert!(pair[0].score.unwrap() >= pair[1].score.unwrap());
        }
        for i in 0..xs.len() {
            for j in i + 1..xs.len() {
                assert!((xs[i] - xs[j]).abs() >= 0.05, "xs = {xs:?}");
            }
        }
        assert!(list.iter().all(|p| p.source == ProposalSource::Surrogate));
    }

    #[test]
    fn first_recommendation_matches_the_proposal() {
        let history = history_at(&[(0.1, 0.1), (0.5, 0.6), (0.8, 0.3), (0.35, 0.7)]);
        let mut gp = GaussianProcess::new(line_space(), GpConfig::default());
        gp.fit(history.trials()).unwrap();
        let single = ei()
            .propose(&gp, &history, &line_space(), &|_| true, &mut ChaCha8Rng::seed_from_u64(9))
            .unwrap();
        let list = ei()
            .recommend(&gp, &history, &line_space(), &|_| true, 2, &mut ChaCha8Rng::seed_from_u64(9))
            .unwrap();
        assert!((list[0].score.unwrap() - single.score.unwrap()).abs() < 1e-9);
        assert!(ei()
            .recommend(&gp, &history, &line_space(), &|_| true, 0, &mut ChaCha8Rng::seed_from_u64(9))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn gp_driven_proposal_is_in_bounds_and_legal() {
        let space = ParameterSpace::espresso_default();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut history = TrialHistory::new();
        for (i, set) in space.latin_hypercube(6, &mut rng).into_iter().enumerate() {
            let dose = set.scalar("dose").unwrap();
            history
                .push(Trial::measured(
                    i as u64,
                    set,
                    TrialMeasurement::new(30.0, 36.0),
                    Reward::final_value(1.0 - (dose - 18.0).abs() / 7.0),
                ))
                .unwrap();
        }
        let mut gp = GaussianProcess::with_defaults(space.clone());
        gp.fit(history.trials()).unwrap();
        let proposal = ei().propose(&gp, &history, &space, &|_| true, &mut rng).unwrap();
        assert!(matches!(
            space.validate(&proposal.parameters),
            crema_types::SafetyVerdict::Accepted(_)
        ));
    }
}
