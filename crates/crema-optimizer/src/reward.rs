//! Reward model: trial measurement in, scalar reward out.

use serde::{Deserialize, Serialize};

use crema_types::{Reward, TasteEvaluation, TrialMeasurement};

/// Converts a raw measurement into a reward in [-1, 1].
///
/// Implementations must be pure functions of the measurement so that past
/// trials can be re-scored reproducibly under a revised policy.
pub trait RewardModel: Send + Sync {
    fn score(&self, measurement: &TrialMeasurement) -> Reward;

    fn name(&self) -> &str;
}

/// Tunable constants of [`EspressoReward`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardPolicy {
    /// Balanced-taste window for bitterness / acidity / strength ratings.
    pub ideal_rating: (u8, u8),
    pub acceptable_rating: (u8, u8),
    pub ideal_rating_score: f64,
    pub acceptable_rating_score: f64,
    pub poor_rating_score: f64,

    pub low_channeling: u8,
    pub high_channeling: u8,
    pub low_channeling_bonus: f64,
    pub high_channeling_penalty: f64,

    /// Extraction-time window (seconds) earning a bonus.
    pub ideal_time_secs: (f64, f64),
    /// Outside this window the shot is penalized.
    pub plausible_time_secs: (f64, f64),
    pub ideal_time_bonus: f64,
    pub implausible_time_penalty: f64,

    /// Target beverage/dose ratio for the provisional score.
    pub target_ratio: f64,
    /// Ratio deviation at which the provisional ratio score bottoms out.
    pub ratio_tolerance: f64,
    pub time_weight: f64,
    pub ratio_weight: f64,
}

impl Default for RewardPolicy {
    fn default() -> Self {
        Self {
            ideal_rating: (5, 6),
            acceptable_rating: (4, 7),
            ideal_rating_score: 0.5,
            acceptable_rating_score: 0.2,
            poor_rating_score: -0.2,
            low_channeling: 3,
            high_channeling: 7,
            low_channeling_bonus: 0.1,
            high_channeling_penalty: -0.2,
            ideal_time_secs: (25.0, 35.0),
            plausible_time_secs: (20.0, 45.0),
            ideal_time_bonus: 0.1,
            implausible_time_penalty: -0.1,
            target_ratio: 2.0,
            ratio_tolerance: 1.0,
            time_weight: 0.5,
            ratio_weight: 0.5,
        }
    }
}

/// Default espresso reward.
///
/// With a taste evaluation the overall score dominates (mapped from 1..10 to
/// -1..1), falling back to the balance of the individual ratings; channeling
/// and extraction time add small bonuses or penalties. Without a taste score
/// the reward is provisional and built from extraction time and brew ratio.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EspressoReward {
    pub policy: RewardPolicy,
}

impl EspressoReward {
    pub fn new(policy: RewardPolicy) -> Self {
        Self { policy }
    }

    fn taste_component(&self, taste: &TasteEvaluation) -> f64 {
        if let Some(overall) = taste.overall {
            return (f64::from(overall) - 5.5) / 4.5;
        }
        let p = &self.policy;
        let scores: Vec<f64> = [taste.bitterness, taste.acidity, taste.strength]
            .into_iter()
            .flatten()
            .map(|v| {
                if (p.ideal_rating.0..=p.ideal_rating.1).contains(&v) {
                    p.ideal_rating_score
                } else if (p.acceptable_rating.0..=p.acceptable_rating.1).contains(&v) {
                    p.acceptable_rating_score
                } else {
                    p.poor_rating_score
                }
            })
            .collect();
        if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        }
    }

    fn channeling_bonus(&self, taste: &TasteEvaluation) -> f64 {
        match taste.channeling {
            Some(c) if c <= self.policy.low_channeling => self.policy.low_channeling_bonus,
            Some(c) if c >= self.policy.high_channeling => self.policy.high_channeling_penalty,
            _ => 0.0,
        }
    }

    fn time_bonus(&self, secs: f64) -> f64 {
        let p = &self.policy;
        if secs >= p.ideal_time_secs.0 && secs <= p.ideal_time_secs.1 {
            p.ideal_time_bonus
        } else if secs < p.plausible_time_secs.0 || secs > p.plausible_time_secs.1 {
            p.implausible_time_penalty
        } else {
            0.0
        }
    }

    /// Objective-only score in [-1, 1] used until a taste score arrives.
    fn objective_score(&self, m: &TrialMeasurement) -> f64 {
        let p = &self.policy;
        let centre = (p.ideal_time_secs.0 + p.ideal_time_secs.1) / 2.0;
        let half_width = ((p.plausible_time_secs.1 - p.plausible_time_secs.0) / 2.0).max(1e-9);
        let time_score = 1.0 - 2.0 * ((m.extraction_time_secs - centre).abs() / half_width).min(1.0);

        let mut weighted = p.time_weight * time_score;
        let mut weight = p.time_weight;
        if let Some(ratio) = m.brew_ratio() {
            let tolerance = p.ratio_tolerance.max(1e-9);
            let ratio_score = 1.0 - 2.0 * ((ratio - p.target_ratio).abs() / tolerance).min(1.0);
            weighted += p.ratio_weight * ratio_score;
            weight += p.ratio_weight;
        }
        if weight > 0.0 {
            weighted / weight
        } else {
            0.0
        }
    }
}

impl RewardModel for EspressoReward {
    fn score(&self, measurement: &TrialMeasurement) -> Reward {
        match measurement.taste.as_ref().filter(|t| !t.is_empty()) {
            Some(taste) => {
                let value = self.taste_component(taste)
                    + self.channeling_bonus(taste)
                    + self.time_bonus(measurement.extraction_time_secs);
                Reward::final_value(value.clamp(-1.0, 1.0))
            }
            None => Reward::provisional(self.objective_score(measurement).clamp(-1.0, 1.0)),
        }
    }

    fn name(&self) -> &str {
        "espresso"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shot(secs: f64, yield_g: f64) -> TrialMeasurement {
        TrialMeasurement::new(secs, yield_g).with_dose(18.0)
    }

    #[test]
    fn scoring_is_pure() {
        let model = EspressoReward::default();
        let m = shot(27.0, 38.0).with_taste(TasteEvaluation {
            bitterness: Some(6),
            acidity: Some(3),
            ..TasteEvaluation::default()
        });
        assert_eq!(model.score(&m), model.score(&m.clone()));
    }

    #[test]
    fn overall_score_dominates() {
        let model = EspressoReward::default();
        // overall 10 maps to 1.0, ideal time bonus is clamped away
        let m = shot(30.0, 36.0).with_taste(TasteEvaluation::overall(10));
        let r = model.score(&m);
        assert!(!r.provisional);
        assert_eq!(r.value, 1.0);

        // overall 1 maps to -1.0; out-of-window time cannot push below -1
        let m = shot(60.0, 36.0).with_taste(TasteEvaluation::overall(1));
        assert_eq!(model.score(&m).value, -1.0);

        // overall 7 in a 40 s shot: (7 - 5.5) / 4.5, no time bonus or penalty
        let m = shot(40.0, 36.0).with_taste(TasteEvaluation::overall(7));
        assert!((model.score(&m).value - 1.5 / 4.5).abs() < 1e-12);
    }

    #[test]
    fn rating_balance_without_overall() {
        let model = EspressoReward::default();
        let taste = TasteEvaluation {
            bitterness: Some(5),
            acidity: Some(7),
            strength: Some(9),
            ..TasteEvaluation::default()
        };
        // (0.5 + 0.2 - 0.2) / 3, plus 0.1 ideal time bonus
        let m = shot(30.0, 36.0).with_taste(taste);
        let expected = 0.5 / 3.0 + 0.1;
        assert!((model.score(&m).value - expected).abs() < 1e-12);
    }

    #[test]
    fn channeling_adjusts_reward() {
        let model = EspressoReward::default();
        let base = TasteEvaluation::overall(6);
        let clean = TasteEvaluation {
            channeling: Some(2),
            ..base.clone()
        };
        let severe = TasteEvaluation {
            channeling: Some(9),
            ..base.clone()
        };
        let r_base = model.score(&shot(40.0, 36.0).with_taste(base)).value;
        let r_clean = model.score(&shot(40.0, 36.0).with_taste(clean)).value;
        let r_severe = model.score(&shot(40.0, 36.0).with_taste(severe)).value;
        assert!((r_clean - r_base - 0.1).abs() < 1e-12);
        assert!((r_severe - r_base + 0.2).abs() < 1e-12);
    }

    #[test]
    fn missing_taste_gives_provisional_reward() {
        let model = EspressoReward::default();
        let ideal = model.score(&shot(30.0, 36.0));
        assert!(ideal.provisional);
        assert!((ideal.value - 1.0).abs() < 1e-12);

        let gusher = model.score(&shot(8.0, 60.0));
        assert!(gusher.provisional);
        assert_eq!(gusher.value, -1.0);

        // empty taste record is treated as missing
        let empty = model.score(&shot(30.0, 36.0).with_taste(TasteEvaluation::default()));
        assert!(empty.provisional);
    }

    #[test]
    fn provisional_uses_time_only_without_dose() {
        let model = EspressoReward::default();
        let r = model.score(&TrialMeasurement::new(30.0, 80.0));
        assert!((r.value - 1.0).abs() < 1e-12);
    }

    #[test]
    fn policy_is_configurable() {
        let policy = RewardPolicy {
            target_ratio: 3.0,
            ..RewardPolicy::default()
        };
        let ristretto_lover = EspressoReward::default();
        let lungo_lover = EspressoReward::new(policy);
        let lungo = shot(30.0, 54.0);
        assert!(lungo_lover.score(&lungo).value > ristretto_lover.score(&lungo).value);
    }
}
