//! Brewable parameter space: bounds, validation, clamping and sampling.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::warn;

use crema_types::{
    Bound, ClampEvent, CremaError, CremaResult, ParameterSet, ParameterValue, SafetyVerdict,
};

/// Upper limit on the number of points [`ParameterSpace::grid`] will build.
const MAX_GRID_POINTS: usize = 100_000;

/// How [`ParameterSpace::sample`] picks a point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SamplingStrategy {
    /// Independent uniform draw.
    Uniform,
    /// Draw `candidates` uniform points and keep the one farthest from any
    /// existing point.
    Maximin { candidates: usize },
    /// Midpoint of every range: the neutral starting brew.
    Center,
}

impl Default for SamplingStrategy {
    fn default() -> Self {
        Self::Maximin { candidates: 256 }
    }
}

/// The full parameter space: an ordered list of bounds fixed for the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpace {
    bounds: Vec<Bound>,
    clamping: bool,
}

impl ParameterSpace {
    pub fn new(bounds: Vec<Bound>) -> CremaResult<Self> {
        if bounds.is_empty() {
            return Err(CremaError::Config("parameter space has no bounds".into()));
        }
        let mut seen = HashSet::new();
        for bound in &bounds {
            bound.check()?;
            if !seen.insert(bound.name.as_str()) {
                return Err(CremaError::Config(format!(
                    "duplicate parameter name: {}",
                    bound.name
                )));
            }
        }
        Ok(Self {
            bounds,
            clamping: false,
        })
    }

    /// Typical home espresso machine controls.
    pub fn espresso_default() -> Self {
        Self {
            bounds: vec![
                Bound::new("dose", 15.0, 25.0),
                Bound::stepped("grind", 1.0, 30.0, 1.0),
                Bound::new("temperature", 88.0, 100.0),
                Bound::new("preinfusion", 0.0, 12.0),
                Bound::profile("pressure", 2.0, 10.0, 3),
            ],
            clamping: false,
        }
    }

    pub fn with_clamping(mut self, enabled: bool) -> Self {
        self.clamping = enabled;
        self
    }

    pub fn clamping(&self) -> bool {
        self.clamping
    }

    pub fn bounds(&self) -> &[Bound] {
        &self.bounds
    }

    pub fn bound(&self, name: &str) -> Option<&Bound> {
        self.bounds.iter().find(|b| b.name == name)
    }

    /// Number of encoded dimensions (profile points count individually).
    pub fn dimensions(&self) -> usize {
        self.bounds.iter().map(|b| b.points).sum()
    }

    /// Check a parameter set against the declared bounds.
    pub fn validate(&self, set: &ParameterSet) -> SafetyVerdict {
        let missing: Vec<&str> = self
            .bounds
            .iter()
            .filter(|b| set.get(&b.name).is_none())
            .map(|b| b.name.as_str())
            .collect();
        let extra: Vec<&str> = set.names().filter(|n| self.bound(n).is_none()).collect();
        if !missing.is_empty() || !extra.is_empty() {
            let mut parts = Vec::new();
            if !missing.is_empty() {
                parts.push(format!("missing parameters: {}", missing.join(", ")));
            }
            if !extra.is_empty() {
                parts.push(format!("unexpected parameters: {}", extra.join(", ")));
            }
            return SafetyVerdict::rejected(parts.join("; "));
        }

        let mut adjusted = ParameterSet::new();
        let mut events = Vec::new();

        for bound in &self.bounds {
            let Some(value) = set.get(&bound.name) else {
                continue;
            };
            let shape_ok = match value {
                ParameterValue::Scalar(_) => !bound.is_profile(),
                ParameterValue::Profile(points) => {
                    bound.is_profile() && points.len() == bound.points
                }
            };
            if !shape_ok {
                return SafetyVerdict::rejected(format!(
                    "{} expects {} value(s), got {}",
                    bound.name,
                    bound.points,
                    value.values().len()
                ));
            }

            let mut fixed = Vec::with_capacity(bound.points);
            for (i, &v) in value.values().iter().enumerate() {
                if !v.is_finite() {
                    return SafetyVerdict::rejected(format!("{} is not a finite number", bound.name));
                }
                if bound.contains(v) && bound.on_grid(v) {
                    fixed.push(v);
                    continue;
                }
                if !self.clamping {
                    return SafetyVerdict::rejected(if bound.contains(v) {
                        format!(
                            "{}={} is not a multiple of step {:?} from {}",
                            bound.name, v, bound.step, bound.min
                        )
                    } else {
                        format!(
                            "{}={} outside [{}, {}]",
                            bound.name, v, bound.min, bound.max
                        )
                    });
                }
                let legal = bound.nearest_legal(v);
                events.push(ClampEvent {
                    parameter: bound.name.clone(),
                    point: bound.is_profile().then_some(i),
                    original: v,
                    adjusted: legal,
                });
                fixed.push(legal);
            }

            let value = if bound.is_profile() {
                ParameterValue::Profile(fixed)
            } else {
                ParameterValue::Scalar(fixed[0])
            };
            adjusted = adjusted.with(bound.name.clone(), value);
        }

        if events.is_empty() {
            return SafetyVerdict::Accepted(set.clone());
        }
        for event in &events {
            warn!(
                parameter = %event.parameter,
                point = ?event.point,
                original = event.original,
                adjusted = event.adjusted,
                "parameter clamped to legal range"
            );
        }
        SafetyVerdict::Clamped {
            original: set.clone(),
            adjusted,
            adjustments: events,
        }
    }

    /// Map a parameter set into the unit hypercube.
    ///
    /// Missing parameters encode to the centre of their range; callers pass
    /// validated sets.
    pub fn encode(&self, set: &ParameterSet) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.dimensions());
        for bound in &self.bounds {
            let values = set.get(&bound.name).map(ParameterValue::values);
            for i in 0..bound.points {
                let unit = match values.and_then(|v| v.get(i)) {
                    Some(v) if bound.width() > 0.0 => {
                        ((v - bound.min) / bound.width()).clamp(0.0, 1.0)
                    }
                    _ => 0.5,
                };
                out.push(unit);
            }
        }
        out
    }

    /// Map a unit-hypercube point back to a legal parameter set.
    pub fn decode(&self, unit: &[f64]) -> ParameterSet {
        let mut set = ParameterSet::new();
        let mut offset = 0;
        for bound in &self.bounds {
            let values: Vec<f64> = (0..bound.points)
                .map(|i| {
                    let u = unit.get(offset + i).copied().unwrap_or(0.5).clamp(0.0, 1.0);
                    bound.nearest_legal(bound.min + u * bound.width())
                })
                .collect();
            offset += bound.points;
            let value = if bound.is_profile() {
                ParameterValue::Profile(values)
            } else {
                ParameterValue::Scalar(values[0])
            };
            set = set.with(bound.name.clone(), value);
        }
        set
    }

    /// Normalized Euclidean distance between two encoded points, in [0, 1].
    pub fn distance(&self, a: &[f64], b: &[f64]) -> f64 {
        let dims = a.len().max(1) as f64;
        let sq: f64 = a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum();
        (sq / dims).sqrt()
    }

    /// Smallest distance from `point` to any of `others` (infinite when empty).
    pub fn min_distance(&self, point: &[f64], others: &[Vec<f64>]) -> f64 {
        others
            .iter()
            .map(|o| self.distance(point, o))
            .fold(f64::INFINITY, f64::min)
    }

    pub fn random_unit<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        (0..self.dimensions()).map(|_| rng.gen::<f64>()).collect()
    }

    /// Draw one parameter set. `existing` holds encoded points already tried.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        strategy: SamplingStrategy,
        existing: &[Vec<f64>],
        rng: &mut R,
    ) -> ParameterSet {
        match strategy {
            SamplingStrategy::Uniform => self.decode(&self.random_unit(rng)),
            SamplingStrategy::Center => self.decode(&vec![0.5; self.dimensions()]),
            SamplingStrategy::Maximin { candidates } => {
                if existing.is_empty() {
                    return self.decode(&self.random_unit(rng));
                }
                let mut best: Option<(f64, Vec<f64>)> = None;
                for _ in 0..candidates.max(1) {
                    let unit = self.random_unit(rng);
                    // Distance is measured after snapping so stepped axes
                    // cannot hide a duplicate.
                    let snapped = self.encode(&self.decode(&unit));
                    let d = self.min_distance(&snapped, existing);
                    if best.as_ref().map_or(true, |(bd, _)| d > *bd) {
                        best = Some((d, unit));
                    }
                }
                let unit = best.map(|(_, u)| u).unwrap_or_else(|| self.random_unit(rng));
                self.decode(&unit)
            }
        }
    }

    /// Stratified initial design of `n` points.
    pub fn latin_hypercube<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<ParameterSet> {
        if n == 0 {
            return Vec::new();
        }
        let dims = self.dimensions();
        let columns: Vec<Vec<usize>> = (0..dims)
            .map(|_| {
                let mut perm: Vec<usize> = (0..n).collect();
                perm.shuffle(rng);
                perm
            })
            .collect();
        (0..n)
            .map(|i| {
                let unit: Vec<f64> = columns
                    .iter()
                    .map(|col| (col[i] as f64 + rng.gen::<f64>()) / n as f64)
                    .collect();
                self.decode(&unit)
            })
            .collect()
    }

    /// Full-factorial grid with `steps` levels per encoded dimension.
    pub fn grid(&self, steps: usize) -> CremaResult<Vec<ParameterSet>> {
        let steps = steps.max(2);
        let dims = self.dimensions();
        let mut total: usize = 1;
        for _ in 0..dims {
            total = total
                .checked_mul(steps)
                .filter(|t| *t <= MAX_GRID_POINTS)
                .ok_or_else(|| {
                    CremaError::Validation(format!(
                        "grid with {steps} steps over {dims} dimensions exceeds {MAX_GRID_POINTS} points"
                    ))
                })?;
        }
        let levels: Vec<f64> = (0..steps)
            .map(|i| i as f64 / (steps - 1) as f64)
            .collect();

        // Cartesian product
        let mut points: Vec<Vec<f64>> = vec![Vec::with_capacity(dims)];
        for _ in 0..dims {
            let mut next = Vec::with_capacity(points.len() * steps);
            for existing in &points {
                for level in &levels {
                    let mut p = existing.clone();
                    p.push(*level);
                    next.push(p);
                }
            }
            points = next;
        }
        Ok(points.iter().map(|p| self.decode(p)).collect())
    }
}
