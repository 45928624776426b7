//! Raw brew measurements and subjective taste feedback.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::errors::{CremaError, CremaResult};

pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 10;

/// Subjective feedback on a shot. Every rating is on a 1–10 scale.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TasteEvaluation {
    pub overall: Option<u8>,
    pub bitterness: Option<u8>,
    pub acidity: Option<u8>,
    pub strength: Option<u8>,
    /// 1 = none, 10 = severe.
    pub channeling: Option<u8>,
}

impl TasteEvaluation {
    pub fn overall(score: u8) -> Self {
        Self {
            overall: Some(score),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> CremaResult<()> {
        for (field, value) in [
            ("overall", self.overall),
            ("bitterness", self.bitterness),
            ("acidity", self.acidity),
            ("strength", self.strength),
            ("channeling", self.channeling),
        ] {
            if let Some(v) = value {
                if !(MIN_RATING..=MAX_RATING).contains(&v) {
                    return Err(CremaError::Validation(format!(
                        "{field} must be between {MIN_RATING} and {MAX_RATING}, got {v}"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.overall.is_none()
            && self.bitterness.is_none()
            && self.acidity.is_none()
            && self.strength.is_none()
            && self.channeling.is_none()
    }
}

/// Conditions a shot was pulled under that the parameters do not capture.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BrewContext {
    pub roast_date: Option<NaiveDate>,
    pub days_since_roast: Option<u32>,
    /// First shot of the session, typically pulled on a cold group head.
    #[serde(default)]
    pub first_brew: bool,
}

impl BrewContext {
    /// Context for a shot pulled on `today` from beans roasted on `roast_date`.
    /// A roast date in the future counts as zero days.
    pub fn from_roast_date(roast_date: NaiveDate, today: NaiveDate, first_brew: bool) -> Self {
        let days = (today - roast_date).num_days().max(0);
        Self {
            roast_date: Some(roast_date),
            days_since_roast: Some(u32::try_from(days).unwrap_or(u32::MAX)),
            first_brew,
        }
    }

    pub fn first_brew(mut self, first_brew: bool) -> Self {
        self.first_brew = first_brew;
        self
    }
}

/// Sensor and observer output for one executed parameter set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialMeasurement {
    /// Seconds from pump start to end of shot.
    pub extraction_time_secs: f64,
    /// Beverage weight in the cup, grams.
    pub yield_grams: f64,
    /// Dry coffee dose as weighed, grams.
    pub dose_grams: Option<f64>,
    /// Flow rate samples in ml/s.
    #[serde(default)]
    pub flow_curve: Vec<f64>,
    pub peak_pressure_bar: Option<f64>,
    /// Taste feedback; often entered after the trial is recorded.
    pub taste: Option<TasteEvaluation>,
    #[serde(default)]
    pub context: Option<BrewContext>,
}

impl TrialMeasurement {
    pub fn new(extraction_time_secs: f64, yield_grams: f64) -> Self {
        Self {
            extraction_time_secs,
            yield_grams,
            dose_grams: None,
            flow_curve: Vec::new(),
            peak_pressure_bar: None,
            taste: None,
            context: None,
        }
    }

    pub fn with_dose(mut self, dose_grams: f64) -> Self {
        self.dose_grams = Some(dose_grams);
        self
    }

    pub fn with_taste(mut self, taste: TasteEvaluation) -> Self {
        self.taste = Some(taste);
        self
    }

    pub fn with_context(mut self, context: BrewContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_flow_curve(mut self, flow_curve: Vec<f64>) -> Self {
        self.flow_curve = flow_curve;
        self
    }

    /// Beverage-to-dose ratio, when the dose is known.
    pub fn brew_ratio(&self) -> Option<f64> {
        self.dose_grams
            .filter(|d| *d > 0.0)
            .map(|d| self.yield_grams / d)
    }

    pub fn validate(&self) -> CremaResult<()> {
        if !self.extraction_time_secs.is_finite() || self.extraction_time_secs < 0.0 {
            return Err(CremaError::Validation(format!(
                "extraction time must be non-negative, got {}",
                self.extraction_time_secs
            )));
        }
        if !self.yield_grams.is_finite() || self.yield_grams < 0.0 {
            return Err(CremaError::Validation(format!(
                "yield must be non-negative, got {}",
                self.yield_grams
            )));
        }
        if let Some(taste) = &self.taste {
            taste.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taste_rating_range_is_enforced() {
        assert!(TasteEvaluation::overall(7).validate().is_ok());
        assert!(TasteEvaluation::overall(0).validate().is_err());
        let bad = TasteEvaluation {
            channeling: Some(11),
            ..TasteEvaluation::default()
        };
        let err = bad.validate().unwrap_err();
        assert!(err.to_string().contains("channeling"));
    }

    #[test]
    fn brew_ratio_requires_dose() {
        let m = TrialMeasurement::new(28.0, 36.0);
        assert_eq!(m.brew_ratio(), None);
        let m = m.with_dose(18.0);
        assert!((m.brew_ratio().unwrap() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn days_since_roast_from_dates() {
        let roasted = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let today = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        let context = BrewContext::from_roast_date(roasted, today, true);
        assert_eq!(context.days_since_roast, Some(14));
        assert!(context.first_brew);

        let ahead = BrewContext::from_roast_date(today, roasted, false);
        assert_eq!(ahead.days_since_roast, Some(0));
    }

    #[test]
    fn measurements_without_context_still_parse() {
        let json = r#"{"extraction_time_secs":28.0,"yield_grams":36.0,"dose_grams":null,"peak_pressure_bar":null,"taste":null}"#;
        let m: TrialMeasurement = serde_json::from_str(json).unwrap();
        assert_eq!(m.context, None);
    }

    #[test]
    fn measurement_validation() {
        assert!(TrialMeasurement::new(28.0, 36.0).validate().is_ok());
        assert!(TrialMeasurement::new(-1.0, 36.0).validate().is_err());
        assert!(TrialMeasurement::new(28.0, f64::NAN).validate().is_err());
        let m = TrialMeasurement::new(28.0, 36.0).with_taste(TasteEvaluation::overall(12));
        assert!(m.validate().is_err());
    }
}
