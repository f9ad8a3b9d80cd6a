use chrono::{Duration, NaiveDateTime};
use serde::Serialize;
use tracing::debug;

use super::dosing::BolusPlan;
use super::environment::{Environment, GlucoseSimulator};
use super::error::{Result, WizardError};
use super::types::{Action, DoseSetting, ReferenceRow, SEGMENT_STEPS, STEP_MINUTES};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentResult {
    pub glucose: Vec<f64>,
    pub timestamps: Vec<NaiveDateTime>,
    pub actions: Vec<Action>,
    pub bolus_step: Option<usize>,
}

impl SegmentResult {
    pub fn final_glucose(&self) -> Option<f64> {
        self.glucose.last().copied()
    }

    /// Insulin requested over the segment in U: the basal rate for every
    /// step's minutes plus the bolus.
    pub fn total_insulin(&self) -> f64 {
        self.actions
            .iter()
            .map(|a| a.basal * STEP_MINUTES as f64 + a.bolus)
            .sum()
    }
}

/// Steps `env` through one segment under a constant basal rate, injecting
/// the bolus once at the planned step. Always produces `SEGMENT_STEPS`
/// readings.
pub fn execute_segment<S: GlucoseSimulator>(
    env: &mut Environment<S>,
    rows: &[ReferenceRow],
    dose: DoseSetting,
    plan: BolusPlan,
) -> Result<SegmentResult> {
    let Some(first) = rows.first() else {
        return Err(WizardError::EmptySeries);
    };
    if rows.len() != SEGMENT_STEPS {
        return Err(WizardError::validation(format!(
            "segment needs {SEGMENT_STEPS} reference rows, got {}",
            rows.len()
        )));
    }

    let mut glucose = Vec::with_capacity(SEGMENT_STEPS);
    let mut actions = Vec::with_capacity(SEGMENT_STEPS);
    for t in 0..SEGMENT_STEPS {
        let action = Action {
            basal: dose.basal,
            bolus: plan.bolus_at(t, dose),
        };
        let outcome = env.step(action.basal, action.bolus);
        glucose.push(outcome.observation.glucose);
        actions.push(action);
    }

    let timestamps = (0..SEGMENT_STEPS)
        .map(|i| first.timestamp + Duration::minutes(STEP_MINUTES * i as i64))
        .collect();

    debug!(
        bolus = dose.bolus,
        basal = dose.basal,
        bolus_step = ?plan.bolus_step,
        final_glucose = ?glucose.last(),
        "segment executed"
    );

    Ok(SegmentResult {
        glucose,
        timestamps,
        actions,
        bolus_step: plan.bolus_step,
    })
}
