//! Read-only views of a run: surrogate prediction grids and trial history
//! export as CSV, JSON or a plain-text summary.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::io::Write;
use std::path::Path;
use tracing::info;

use crema_optimizer::{ParameterSpace, SurrogateModel};
use crema_types::{CremaError, CremaResult, ParameterSet, Trial, TrialHistory, TrialOutcome};

/// Surrogate mean and uncertainty at one grid point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridPrediction {
    pub parameters: ParameterSet,
    pub mean: f64,
    pub std_dev: f64,
}

/// Predict over a full-factorial grid with `steps` points per dimension.
pub fn prediction_grid(
    surrogate: &dyn SurrogateModel,
    space: &ParameterSpace,
    steps: usize,
) -> CremaResult<Vec<GridPrediction>> {
    let grid = space.grid(steps)?;
    Ok(grid
        .into_iter()
        .map(|parameters| {
            let p = surrogate.predict(&parameters);
            GridPrediction {
                parameters,
                mean: p.mean,
                std_dev: p.std_dev,
            }
        })
        .collect())
}

fn csv_error(e: csv::Error) -> CremaError {
    CremaError::Persistence {
        message: format!("csv export failed: {e}"),
    }
}

/// Column names for each parameter; profiles get one column per point.
fn parameter_columns(space: &ParameterSpace) -> Vec<String> {
    space
        .bounds()
        .iter()
        .flat_map(|b| {
            if b.is_profile() {
                (0..b.points)
                    .map(|i| format!("{}_{i}", b.name))
                    .collect::<Vec<_>>()
            } else {
                vec![b.name.clone()]
            }
        })
        .collect()
}

fn parameter_cells(space: &ParameterSpace, set: &ParameterSet) -> Vec<String> {
    space
        .bounds()
        .iter()
        .flat_map(|b| {
            let width = if b.is_profile() { b.points } else { 1 };
            let values = set.get(&b.name).map(|v| v.values().to_vec()).unwrap_or_default();
            (0..width)
                .map(|i| values.get(i).map(|v| v.to_string()).unwrap_or_default())
                .collect::<Vec<_>>()
        })
        .collect()
}

fn opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Write one row per trial.
pub fn export_csv<W: Write>(
    history: &TrialHistory,
    space: &ParameterSpace,
    writer: W,
) -> CremaResult<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    let mut header = vec!["index".to_string(), "status".to_string()];
    header.extend(parameter_columns(space));
    header.extend(
        [
            "extraction_time_secs",
            "yield_grams",
            "brew_ratio",
            "taste_overall",
            "reward",
            "provisional",
            "roast_date",
            "days_since_roast",
            "first_brew",
            "failure",
        ]
        .map(String::from),
    );
    wtr.write_record(&header).map_err(csv_error)?;

    for trial in history.trials() {
        let mut row = vec![trial.index.to_string()];
        let (status, measurement, failure) = match &trial.outcome {
            TrialOutcome::Measured(m) => ("measured", Some(m), String::new()),
            TrialOutcome::Failed { kind, message } => {
                ("failed", None, format!("{kind:?}: {message}"))
            }
        };
        row.push(status.to_string());
        row.extend(parameter_cells(space, &trial.parameters));
        row.push(opt(measurement.map(|m| m.extraction_time_secs)));
        row.push(opt(measurement.map(|m| m.yield_grams)));
        row.push(opt(measurement.and_then(|m| m.brew_ratio())));
        row.push(opt(
            measurement.and_then(|m| m.taste.as_ref().and_then(|t| t.overall)),
        ));
        row.push(opt(trial.reward.map(|r| r.value)));
        row.push(opt(trial.reward.map(|r| r.provisional)));
        let context = measurement.and_then(|m| m.context.as_ref());
        row.push(opt(context.and_then(|c| c.roast_date)));
        row.push(opt(context.and_then(|c| c.days_since_roast)));
        row.push(opt(context.map(|c| c.first_brew)));
        row.push(failure);
        wtr.write_record(&row).map_err(csv_error)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn export_csv_file<P: AsRef<Path>>(
    history: &TrialHistory,
    space: &ParameterSpace,
    path: P,
) -> CremaResult<()> {
    let path = path.as_ref();
    let file = std::fs::File::create(path)?;
    export_csv(history, space, file)?;
    info!(path = %path.display(), trials = history.len(), "history exported as csv");
    Ok(())
}

/// Pretty-printed JSON array of trials.
pub fn export_json<W: Write>(history: &TrialHistory, writer: W) -> CremaResult<()> {
    serde_json::to_writer_pretty(writer, history.trials())?;
    Ok(())
}

fn describe(trial: &Trial) -> String {
    match &trial.outcome {
        TrialOutcome::Measured(m) => {
            let ratio = m
                .brew_ratio()
                .map(|r| format!(", ratio 1:{r:.2}"))
                .unwrap_or_default();
            let reward = match trial.reward {
                Some(r) if r.provisional => format!("{:.3} (provisional)", r.value),
                Some(r) => format!("{:.3}", r.value),
                None => "-".to_string(),
            };
            let mut context = String::new();
            if let Some(c) = &m.context {
                if let Some(days) = c.days_since_roast {
                    let _ = write!(context, ", {days} d off roast");
                }
                if c.first_brew {
                    context.push_str(", first brew");
                }
            }
            format!(
                "#{} {} -> {:.1} s, {:.1} g{ratio}, reward {reward}{context}",
                trial.index, trial.parameters, m.extraction_time_secs, m.yield_grams
            )
        }
        TrialOutcome::Failed { kind, message } => {
            format!("#{} {} -> {kind:?}: {message}", trial.index, trial.parameters)
        }
    }
}

/// Human-readable summary followed by one line per trial.
pub fn export_text(history: &TrialHistory) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} trials, {} measured, {} failed",
        history.len(),
        history.len() - history.failure_count(),
        history.failure_count()
    );
    match history.best() {
        Some(best) => {
            let _ = writeln!(out, "best: {}", describe(best));
        }
        None => {
            let _ = writeln!(out, "best: none");
        }
    }
    let _ = writeln!(out);
    for trial in history.trials() {
        let _ = writeln!(out, "{}", describe(trial));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crema_optimizer::GaussianProcess;
    use chrono::NaiveDate;
    use crema_types::{BrewContext, FailureKind, Reward, TasteEvaluation, TrialMeasurement};

    fn history() -> TrialHistory {
        let space = ParameterSpace::espresso_default();
        let centre = space.decode(&[0.5; 7]);
        let mut history = TrialHistory::new();
        history
            .push(Trial::measured(
                0,
                centre.clone(),
                TrialMeasurement::new(28.0, 38.0)
                    .with_dose(19.0)
                    .with_taste(TasteEvaluation::overall(8))
                    .with_context(BrewContext::from_roast_date(
                        NaiveDate::from_ymd_opt(2024, 5, 2).unwrap(),
                        NaiveDate::from_ymd_opt(2024, 5, 12).unwrap(),
                        true,
                    )),
                Reward::final_value(0.8),
            ))
            .unwrap();
        history
            .push(Trial::failed(
                1,
                centre,
                FailureKind::HardwareFault,
                "pump stalled",
                None,
            ))
            .unwrap();
        history
    }

    #[test]
    fn csv_has_a_row_per_trial() {
        let space = ParameterSpace::espresso_default();
        let mut buf = Vec::new();
        export_csv(&history(), &space, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("index,status,dose,grind,temperature,preinfusion,pressure_0"));
        assert!(lines[1].starts_with("0,measured,"));
        assert!(lines[0].ends_with("provisional,roast_date,days_since_roast,first_brew,failure"));
        assert!(lines[1].contains(",8,0.8,false,2024-05-02,10,true,"));
        assert!(lines[2].ends_with(",,,HardwareFault: pump stalled"));
    }

    #[test]
    fn json_export_parses_back() {
        let mut buf = Vec::new();
        export_json(&history(), &mut buf).unwrap();
        let trials: Vec<Trial> = serde_json::from_slice(&buf).unwrap();
        assert_eq!(trials.len(), 2);
        assert!(trials[1].is_failure());
    }

    #[test]
    fn text_summary_names_the_best_trial() {
        let text = export_text(&history());
        assert!(text.starts_with("2 trials, 1 measured, 1 failed"));
        assert!(text.contains("best: #0"));
        assert!(text.contains("10 d off roast, first brew"));
        assert!(text.contains("pump stalled"));
    }

    #[test]
    fn prediction_grid_covers_the_space() {
        let space = ParameterSpace::new(vec![
            crema_types::Bound::new("dose", 15.0, 25.0),
            crema_types::Bound::new("temperature", 88.0, 100.0),
        ])
        .unwrap();
        let gp = GaussianProcess::with_defaults(space.clone());
        let grid = prediction_grid(&gp, &space, 3).unwrap();
        assert_eq!(grid.len(), 9);
        assert!(grid.iter().all(|g| g.std_dev > 0.0));
    }
}
