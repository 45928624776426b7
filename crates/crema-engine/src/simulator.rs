//! Simulated espresso machine for development and tests.
//!
//! Maps brew controls to extraction time, yield, flow and a synthetic taste
//! panel through a smooth response surface with a single sweet spot, plus
//! seeded measurement noise and scripted fault injection.

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crema_types::{ParameterSet, TasteEvaluation, TrialMeasurement};

use crate::executor::{ExecutorError, ExecutorResult, TrialExecutor};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub seed: u64,
    /// Wall-clock time each brew takes.
    pub latency: Duration,
    /// Standard spread of extraction-time noise (uniform, seconds).
    pub time_noise_secs: f64,
    /// Attach a taste evaluation to each measurement.
    pub report_taste: bool,
    pub ideal_grind: f64,
    pub ideal_temperature: f64,
    pub ideal_dose: f64,
    pub ideal_preinfusion: f64,
    pub ideal_pressure: f64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            latency: Duration::ZERO,
            time_noise_secs: 0.8,
            report_taste: true,
            ideal_grind: 12.0,
            ideal_temperature: 93.0,
            ideal_dose: 18.0,
            ideal_preinfusion: 4.0,
            ideal_pressure: 9.0,
        }
    }
}

/// A failure to inject into a specific brew.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedFault {
    Hardware(String),
    /// The machine never reports back.
    Hang,
}

type FaultRule = Box<dyn Fn(&ParameterSet) -> Option<ScriptedFault> + Send>;

pub struct SimulatedMachine {
    config: SimulatorConfig,
    rng: ChaCha8Rng,
    scripted: HashMap<usize, ScriptedFault>,
    rule: Option<FaultRule>,
    executed: usize,
    aborts: usize,
    brewing: bool,
}

fn scalar_or(params: &ParameterSet, name: &str, default: f64) -> f64 {
    params
        .get(name)
        .map(|v| {
            let values = v.values();
            if values.is_empty() {
                default
            } else {
                values.iter().sum::<f64>() / values.len() as f64
            }
        })
        .unwrap_or(default)
}

fn rating(value: f64) -> u8 {
    value.round().clamp(1.0, 10.0) as u8
}

impl SimulatedMachine {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
            scripted: HashMap::new(),
            rule: None,
            executed: 0,
            aborts: 0,
            brewing: false,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SimulatorConfig::default())
    }

    /// Fail the `n`-th brew (zero-based).
    pub fn with_fault_at(mut self, n: usize, fault: ScriptedFault) -> Self {
        self.scripted.insert(n, fault);
        self
    }

    /// Fail `count` consecutive brews starting at the `start`-th.
    pub fn with_faults_from(mut self, start: usize, count: usize, fault: ScriptedFault) -> Self {
        for n in start..start + count {
            self.scripted.insert(n, fault.clone());
        }
        self
    }

    /// Fail every brew for which `rule` returns a fault.
    pub fn with_fault_rule<F>(mut self, rule: F) -> Self
    where
        F: Fn(&ParameterSet) -> Option<ScriptedFault> + Send + 'static,
    {
        self.rule = Some(Box::new(rule));
        self
    }

    pub fn executed(&self) -> usize {
        self.executed
    }

    pub fn aborts(&self) -> usize {
        self.aborts
    }

    pub fn is_brewing(&self) -> bool {
        self.brewing
    }

    /// Noise-free quality of a brew in [0, 1]; 1 at the sweet spot.
    pub fn true_quality(&self, params: &ParameterSet) -> f64 {
        let c = &self.config;
        let dg = (scalar_or(params, "grind", c.ideal_grind) - c.ideal_grind) / 29.0;
        let dt = (scalar_or(params, "temperature", c.ideal_temperature) - c.ideal_temperature) / 12.0;
        let dd = (scalar_or(params, "dose", c.ideal_dose) - c.ideal_dose) / 10.0;
        let dp = (scalar_or(params, "preinfusion", c.ideal_preinfusion) - c.ideal_preinfusion) / 12.0;
        let dpr = (scalar_or(params, "pressure", c.ideal_pressure) - c.ideal_pressure) / 8.0;
        let spread = 4.0 * dg * dg + 2.0 * dt * dt + dd * dd + dp * dp + dpr * dpr;
        (-6.0 * spread).exp()
    }

    /// The taste panel's verdict on a brew, without noise.
    pub fn taste_for(&self, params: &ParameterSet) -> TasteEvaluation {
        let c = &self.config;
        let grind = scalar_or(params, "grind", c.ideal_grind);
        let temperature = scalar_or(params, "temperature", c.ideal_temperature);
        let dose = scalar_or(params, "dose", c.ideal_dose);
        let preinfusion = scalar_or(params, "preinfusion", c.ideal_preinfusion);

        let heat = (temperature - c.ideal_temperature) / 6.0;
        let fineness = (c.ideal_grind - grind) / 14.0;
        TasteEvaluation {
            overall: Some(rating(1.0 + 9.0 * self.true_quality(params))),
            bitterness: Some(rating(5.5 + 4.0 * heat + 3.0 * fineness)),
            acidity: Some(rating(5.5 - 3.0 * heat - 3.0 * fineness)),
            strength: Some(rating(5.5 + (dose - c.ideal_dose) / 2.0)),
            channeling: Some(rating(
                1.0 + (grind - c.ideal_grind).max(0.0) / 18.0 * 6.0
                    + (c.ideal_preinfusion - preinfusion).max(0.0) / 4.0 * 2.0,
            )),
        }
    }

    fn brew(&mut self, params: &ParameterSet) -> TrialMeasurement {
        let c = &self.config;
        let grind = scalar_or(params, "grind", c.ideal_grind);
        let dose = scalar_or(params, "dose", c.ideal_dose);
        let preinfusion = scalar_or(params, "preinfusion", c.ideal_preinfusion);
        let pressure = scalar_or(params, "pressure", c.ideal_pressure).max(0.5);
        let peak = params
            .get("pressure")
            .map(|v| v.values().iter().copied().fold(f64::MIN, f64::max))
            .unwrap_or(pressure);

        let noise = if c.time_noise_secs > 0.0 {
            self.rng.gen_range(-c.time_noise_secs..c.time_noise_secs)
        } else {
            0.0
        };
        let resistance = ((c.ideal_grind - grind) * 0.08).exp() * (dose / c.ideal_dose);
        let time = (28.0 * resistance * (9.0 / pressure).sqrt() + 0.4 * preinfusion + noise).max(1.0);
        let yield_grams = (dose * 2.0 * (pressure / 9.0).powf(0.2) + 0.5 * noise).max(1.0);

        let rate = yield_grams / time;
        let flow_curve = (0..10)
            .map(|i| rate * ((i + 1) as f64 / 3.0).min(1.0))
            .collect();

        let mut measurement = TrialMeasurement::new(time, yield_grams)
            .with_dose(dose)
            .with_flow_curve(flow_curve);
        measurement.peak_pressure_bar = Some(peak);
        if self.config.report_taste {
            measurement = measurement.with_taste(self.taste_for(params));
        }
        measurement
    }
}

#[async_trait]
impl TrialExecutor for SimulatedMachine {
    async fn execute(
        &mut self,
        params: &ParameterSet,
        timeout: Duration,
    ) -> ExecutorResult<TrialMeasurement> {
        let n = self.executed;
        self.executed += 1;
        self.brewing = true;

        let fault = self
            .scripted
            .remove(&n)
            .or_else(|| self.rule.as_ref().and_then(|rule| rule(params)));
        match fault {
            Some(ScriptedFault::Hardware(message)) => {
                self.brewing = false;
                debug!(brew = n, %message, "simulated hardware fault");
                return Err(ExecutorError::HardwareFault { message });
            }
            Some(ScriptedFault::Hang) => {
                debug!(brew = n, "simulated hang");
                tokio::time::sleep(timeout + Duration::from_secs(1)).await;
                self.brewing = false;
                return Err(ExecutorError::Timeout {
                    timeout_secs: timeout.as_secs_f64(),
                });
            }
            None => {}
        }

        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }
        let measurement = self.brew(params);
        self.brewing = false;
        if measurement.extraction_time_secs > timeout.as_secs_f64() {
            return Err(ExecutorError::Timeout {
                timeout_secs: timeout.as_secs_f64(),
            });
        }
        Ok(measurement)
    }

    async fn abort(&mut self) -> ExecutorResult<()> {
        self.aborts += 1;
        self.brewing = false;
        Ok(())
    }

    fn name(&self) -> &str {
        "simulated"
    }
}
