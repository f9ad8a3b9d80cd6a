//! Multi-step dosing wizard.
//!
//! A [`WizardSession`] owns everything one run of the wizard touches: the
//! chosen patient, the loaded reference day, per-segment doses and results,
//! the checkpoint store and the single live simulator environment. Commands
//! are checked against [`Stage::transition`] before any handler runs, and
//! handlers validate their input before mutating the session.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::checkpoint::CheckpointStore;
use super::data::PatientDataSource;
use super::dosing::{BolusPlan, MealEntry, meals_in, recommended_bolus, total_carbohydrate};
use super::environment::{
    Environment, EnvironmentRequest, GlucoseSimulator, SimulatorFactory, Snapshot,
};
use super::error::{Result, WizardError};
use super::metrics::{DaySummary, classify_events, summarize_day, time_in_range};
use super::segment::{SegmentResult, execute_segment};
use super::types::{
    DoseSetting, GlucoseEvent, GlucoseStatus, PatientGroup, PatientId, PatientParams,
    ReferenceRow, ReferenceSeries, SegmentIndex, WizardConfig,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SegmentPhase {
    GlucoseCheck,
    MealCheck,
    DoseInput,
    Run,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Stage {
    PatientSelect,
    DataLoad,
    Segment {
        index: SegmentIndex,
        phase: SegmentPhase,
    },
    DailySummary,
}

impl Stage {
    /// Stage reached by `command`, or `None` when the command is not
    /// available here. `Restart` is available everywhere.
    pub fn transition(self, command: &WizardCommand) -> Option<Stage> {
        use SegmentPhase::*;
        use WizardCommand as C;

        match (self, command) {
            (_, C::Restart) => Some(Stage::PatientSelect),
            (Stage::PatientSelect, C::SelectPatient { .. }) => Some(Stage::DataLoad),
            (Stage::DataLoad, C::ConfirmData) => Some(Stage::Segment {
                index: SegmentIndex::FIRST,
                phase: GlucoseCheck,
            }),
            (
                Stage::Segment {
                    index,
                    phase: GlucoseCheck,
                },
                C::AcknowledgeGlucose,
            ) => Some(Stage::Segment {
                index,
                phase: MealCheck,
            }),
            (
                Stage::Segment {
                    index,
                    phase: MealCheck,
                },
                C::AcknowledgeMeals,
            ) => Some(Stage::Segment {
                index,
                phase: DoseInput,
            }),
            (
                Stage::Segment {
                    index,
                    phase: DoseInput,
                },
                C::SubmitDose { .. },
            )
            | (Stage::Segment { index, phase: Run }, C::RerunSegment { .. }) => {
                Some(Stage::Segment { index, phase: Run })
            }
            (Stage::Segment { index, phase: Run }, C::AdvanceSegment) => {
                Some(match index.next() {
                    Some(next) => Stage::Segment {
                        index: next,
                        phase: GlucoseCheck,
                    },
                    None => Stage::DailySummary,
                })
            }
            _ => None,
        }
    }

    pub fn segment(self) -> Option<SegmentIndex> {
        match self {
            Stage::Segment { index, .. } => Some(index),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::PatientSelect => f.write_str("patient selection"),
            Stage::DataLoad => f.write_str("data overview"),
            Stage::Segment { index, phase } => {
                let phase = match phase {
                    SegmentPhase::GlucoseCheck => "glucose check",
                    SegmentPhase::MealCheck => "meal check",
                    SegmentPhase::DoseInput => "dose input",
                    SegmentPhase::Run => "run",
                };
                write!(f, "segment {index} {phase}")
            }
            Stage::DailySummary => f.write_str("daily summary"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WizardCommand {
    SelectPatient {
        #[serde(default)]
        patient: Option<PatientId>,
    },
    ConfirmData,
    AcknowledgeGlucose,
    AcknowledgeMeals,
    SubmitDose {
        bolus: f64,
        basal: f64,
    },
    RerunSegment {
        bolus: f64,
        basal: f64,
    },
    AdvanceSegment,
    Restart,
}

impl WizardCommand {
    pub fn name(&self) -> &'static str {
        match self {
            WizardCommand::SelectPatient { .. } => "selectPatient",
            WizardCommand::ConfirmData => "confirmData",
            WizardCommand::AcknowledgeGlucose => "acknowledgeGlucose",
            WizardCommand::AcknowledgeMeals => "acknowledgeMeals",
            WizardCommand::SubmitDose { .. } => "submitDose",
            WizardCommand::RerunSegment { .. } => "rerunSegment",
            WizardCommand::AdvanceSegment => "advanceSegment",
            WizardCommand::Restart => "restart",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Transition {
    pub from: Stage,
    pub to: Stage,
}

/// Collaborators shared by every session.
pub struct WizardContext<'a, F> {
    pub config: &'a WizardConfig,
    pub factory: &'a F,
    pub data: &'a dyn PatientDataSource,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DoseLimits {
    pub max_bolus: f64,
    pub max_basal: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "stage", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum StageView {
    PatientSelect {
        patients: Vec<PatientId>,
    },
    DataLoad {
        patient: PatientId,
        group: PatientGroup,
        params: PatientParams,
        reference: Vec<ReferenceRow>,
    },
    GlucoseCheck {
        segment: SegmentIndex,
        window: Vec<ReferenceRow>,
        reading: f64,
        status: GlucoseStatus,
        reference_reading: f64,
    },
    MealCheck {
        segment: SegmentIndex,
        meals: Vec<MealEntry>,
        total_carbohydrate: f64,
    },
    DoseInput {
        segment: SegmentIndex,
        reading: f64,
        total_carbohydrate: f64,
        recommended_bolus: f64,
        reference_reading: f64,
        reference_recommended_bolus: f64,
        plan: BolusPlan,
        defaults: DoseSetting,
        limits: DoseLimits,
    },
    SegmentResult {
        segment: SegmentIndex,
        dose: DoseSetting,
        result: SegmentResult,
        reference_glucose: Vec<f64>,
        events: Vec<GlucoseEvent>,
        time_in_range: f64,
        final_status: GlucoseStatus,
        is_last: bool,
    },
    DailySummary {
        summary: DaySummary,
    },
}

#[derive(Debug)]
pub struct WizardSession<S> {
    stage: Stage,
    selected_patient: Option<PatientId>,
    data_key: Option<String>,
    reference: Option<ReferenceSeries>,
    patient_params: Option<PatientParams>,
    dose_settings: BTreeMap<SegmentIndex, DoseSetting>,
    segment_results: BTreeMap<SegmentIndex, SegmentResult>,
    checkpoints: CheckpointStore<S>,
    active_environment: Option<Environment<S>>,
    segment_end: Option<Snapshot<S>>,
    carried_basal: Option<f64>,
    summary: Option<DaySummary>,
}

impl<S: GlucoseSimulator> Default for WizardSession<S> {
    fn default() -> Self {
        Self {
            stage: Stage::PatientSelect,
            selected_patient: None,
            data_key: None,
            reference: None,
            patient_params: None,
            dose_settings: BTreeMap::new(),
            segment_results: BTreeMap::new(),
            checkpoints: CheckpointStore::new(),
            active_environment: None,
            segment_end: None,
            carried_basal: None,
            summary: None,
        }
    }
}

impl<S: GlucoseSimulator> WizardSession<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn selected_patient(&self) -> Option<&PatientId> {
        self.selected_patient.as_ref()
    }

    pub fn data_key(&self) -> Option<&str> {
        self.data_key.as_deref()
    }

    pub fn dose_setting(&self, segment: SegmentIndex) -> Option<DoseSetting> {
        self.dose_settings.get(&segment).copied()
    }

    pub fn segment_result(&self, segment: SegmentIndex) -> Option<&SegmentResult> {
        self.segment_results.get(&segment)
    }

    pub fn checkpoints(&self) -> &CheckpointStore<S> {
        &self.checkpoints
    }

    pub fn has_environment(&self) -> bool {
        self.active_environment.is_some()
    }

    pub fn carried_basal(&self) -> Option<f64> {
        self.carried_basal
    }

    pub fn summary(&self) -> Option<&DaySummary> {
        self.summary.as_ref()
    }

    /// Drops every per-run key and returns to patient selection.
    pub fn reset_run(&mut self) {
        *self = Self::default();
    }

    pub fn apply<F>(&mut self, command: WizardCommand, ctx: &WizardContext<'_, F>) -> Result<Transition>
    where
        F: SimulatorFactory<Simulator = S>,
    {
        let from = self.stage;
        let Some(to) = from.transition(&command) else {
            return Err(WizardError::validation(format!(
                "{} is not available during {from}",
                command.name()
            )));
        };

        match self.enter(from, to, &command, ctx) {
            Ok(()) => {
                self.stage = to;
                info!(command = command.name(), %from, %to, "stage transition");
                Ok(Transition { from, to })
            }
            Err(err) if err.aborts_run() => {
                warn!(command = command.name(), %from, error = %err, "run aborted");
                self.reset_run();
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn enter<F>(
        &mut self,
        from: Stage,
        to: Stage,
        command: &WizardCommand,
        ctx: &WizardContext<'_, F>,
    ) -> Result<()>
    where
        F: SimulatorFactory<Simulator = S>,
    {
        match command {
            WizardCommand::Restart => {
                self.reset_run();
                Ok(())
            }
            WizardCommand::SelectPatient { patient } => {
                let patient = patient
                    .as_ref()
                    .filter(|p| !p.is_blank())
                    .cloned()
                    .ok_or_else(|| WizardError::validation("choose a patient to continue"))?;
                if !patient.is_plain_name() {
                    return Err(WizardError::validation(format!(
                        "\"{patient}\" is not a patient name"
                    )));
                }
                self.data_key = Some(patient.data_key());
                self.selected_patient = Some(patient);
                self.load_data(ctx.data)
            }
            WizardCommand::ConfirmData => self.load_data(ctx.data),
            WizardCommand::AcknowledgeGlucose => Ok(()),
            WizardCommand::AcknowledgeMeals => match to.segment() {
                Some(segment) => self.prepare_segment(segment, ctx.factory),
                None => Ok(()),
            },
            WizardCommand::SubmitDose { bolus, basal }
            | WizardCommand::RerunSegment { bolus, basal } => {
                let Some(segment) = from.segment() else {
                    return Ok(());
                };
                let dose = validate_dose(*bolus, *basal, ctx.config)?;
                self.dose_settings.insert(segment, dose);
                self.run_segment(segment, dose, ctx.config)
            }
            WizardCommand::AdvanceSegment => match from.segment() {
                Some(segment) => self.advance(segment),
                None => Ok(()),
            },
        }
    }

    /// Loads the reference day and patient parameters once per run.
    fn load_data(&mut self, data: &dyn PatientDataSource) -> Result<()> {
        if self.reference.is_some() && self.patient_params.is_some() {
            return Ok(());
        }
        let patient = self
            .selected_patient
            .clone()
            .ok_or_else(|| WizardError::validation("choose a patient before loading data"))?;

        let params = data.patient_params(&patient)?;
        let series = data.reference_series(&patient)?;
        let required = ReferenceSeries::required_rows();
        if series.len() < required {
            return Err(WizardError::DataNotFound {
                patient: patient.to_string(),
                detail: format!(
                    "{} holds {} rows, a full day needs {required}",
                    patient.data_key(),
                    series.len()
                ),
            });
        }

        debug!(patient = %patient, rows = series.len(), "patient data loaded");
        self.reference = Some(series);
        self.patient_params = Some(params);
        Ok(())
    }

    /// Ensures a live environment exists and checkpoints it before the
    /// segment's first step.
    fn prepare_segment<F>(&mut self, segment: SegmentIndex, factory: &F) -> Result<()>
    where
        F: SimulatorFactory<Simulator = S>,
    {
        if self.active_environment.is_none() {
            if segment != SegmentIndex::FIRST {
                return Err(WizardError::NoCheckpoint(segment));
            }
            let request = self.environment_request(segment)?;
            let (env, observation) = factory.create(&request)?.reset();
            info!(
                patient = %request.patient,
                initial_glucose = request.initial_glucose,
                observed = observation.glucose,
                "environment created"
            );
            self.active_environment = Some(env);
        }

        if !self.checkpoints.contains(segment) {
            let env = self
                .active_environment
                .as_ref()
                .ok_or(WizardError::NoCheckpoint(segment))?;
            self.checkpoints.save(segment, env);
            debug!(%segment, steps = env.steps_taken(), "checkpoint saved");
        }
        Ok(())
    }

    fn environment_request(&self, segment: SegmentIndex) -> Result<EnvironmentRequest> {
        let (patient, reference) = self.loaded()?;
        let first = reference
            .segment(segment)
            .and_then(|rows| rows.first())
            .ok_or(WizardError::EmptySeries)?;
        let reference_meals = reference.rows[segment.row_range().start..]
            .iter()
            .map(|r| r.carbohydrate)
            .collect();
        Ok(EnvironmentRequest {
            patient: patient.clone(),
            initial_glucose: first.blood_glucose,
            reference_meals,
        })
    }

    fn run_segment(&mut self, segment: SegmentIndex, dose: DoseSetting, config: &WizardConfig) -> Result<()> {
        let (result, end) = {
            let (_, reference) = self.loaded()?;
            let rows = reference.segment(segment).ok_or(WizardError::EmptySeries)?;
            let plan = BolusPlan::from_config(rows, config);
            let mut env = self.checkpoints.restore(segment)?;
            let result = execute_segment(&mut env, rows, dose, plan)?;
            (result, env.snapshot())
        };

        info!(
            %segment,
            bolus = dose.bolus,
            basal = dose.basal,
            time_in_range = time_in_range(&result.glucose)?,
            "segment simulated"
        );
        self.segment_results.insert(segment, result);
        self.segment_end = Some(end);
        Ok(())
    }

    fn advance(&mut self, segment: SegmentIndex) -> Result<()> {
        if !self.segment_results.contains_key(&segment) {
            return Err(WizardError::validation(format!(
                "run segment {segment} before moving on"
            )));
        }
        if segment.is_last() {
            let (_, reference) = self.loaded()?;
            self.summary = Some(summarize_day(&self.segment_results, reference)?);
        }
        let end = self
            .segment_end
            .take()
            .ok_or(WizardError::NoCheckpoint(segment))?;
        self.active_environment = Some(end.into_environment());
        self.carried_basal = self.dose_settings.get(&segment).map(|d| d.basal);
        Ok(())
    }

    fn loaded(&self) -> Result<(&PatientId, &ReferenceSeries)> {
        match (&self.selected_patient, &self.reference) {
            (Some(patient), Some(reference)) => Ok((patient, reference)),
            _ => Err(WizardError::validation("patient data has not been loaded")),
        }
    }

    fn segment_rows(&self, segment: SegmentIndex) -> Result<&[ReferenceRow]> {
        let (_, reference) = self.loaded()?;
        reference.segment(segment).ok_or(WizardError::EmptySeries)
    }

    /// Reading shown before dosing: the reference value at the start of the
    /// first segment, then the last simulated reading of the previous one.
    fn segment_reading(&self, segment: SegmentIndex) -> Result<f64> {
        if let Some(previous) = segment.previous() {
            return self
                .segment_results
                .get(&previous)
                .and_then(SegmentResult::final_glucose)
                .ok_or(WizardError::EmptySeries);
        }
        self.reference_reading(segment)
    }

    /// Recorded blood glucose at the segment's first row.
    fn reference_reading(&self, segment: SegmentIndex) -> Result<f64> {
        self.segment_rows(segment)?
            .first()
            .map(|r| r.blood_glucose)
            .ok_or(WizardError::EmptySeries)
    }

    pub fn view<F>(&self, ctx: &WizardContext<'_, F>) -> Result<StageView> {
        let view = match self.stage {
            Stage::PatientSelect => StageView::PatientSelect {
                patients: ctx.data.patients(),
            },
            Stage::DataLoad => {
                let (patient, reference) = self.loaded()?;
                let params = self
                    .patient_params
                    .clone()
                    .ok_or_else(|| WizardError::validation("patient data has not been loaded"))?;
                StageView::DataLoad {
                    patient: patient.clone(),
                    group: patient.group(),
                    params,
                    reference: reference.rows.clone(),
                }
            }
            Stage::Segment { index, phase } => self.segment_view(index, phase, ctx.config)?,
            Stage::DailySummary => StageView::DailySummary {
                summary: self
                    .summary
                    .clone()
                    .ok_or_else(|| WizardError::validation("the day has not been summarised"))?,
            },
        };
        Ok(view)
    }

    fn segment_view(
        &self,
        segment: SegmentIndex,
        phase: SegmentPhase,
        config: &WizardConfig,
    ) -> Result<StageView> {
        let rows = self.segment_rows(segment)?;
        let view = match phase {
            SegmentPhase::GlucoseCheck => {
                let reading = self.segment_reading(segment)?;
                StageView::GlucoseCheck {
                    segment,
                    window: rows.to_vec(),
                    reading,
                    status: GlucoseStatus::classify(reading),
                    reference_reading: self.reference_reading(segment)?,
                }
            }
            SegmentPhase::MealCheck => StageView::MealCheck {
                segment,
                meals: meals_in(rows),
                total_carbohydrate: total_carbohydrate(rows),
            },
            SegmentPhase::DoseInput => {
                let reading = self.segment_reading(segment)?;
                let reference_reading = self.reference_reading(segment)?;
                let carbs = total_carbohydrate(rows);
                let defaults = self.dose_setting(segment).unwrap_or(DoseSetting {
                    bolus: config.default_bolus,
                    basal: self.carried_basal.unwrap_or(config.default_basal),
                });
                StageView::DoseInput {
                    segment,
                    reading,
                    total_carbohydrate: carbs,
                    recommended_bolus: recommended_bolus(reading, carbs, config),
                    reference_reading,
                    reference_recommended_bolus: recommended_bolus(
                        reference_reading,
                        carbs,
                        config,
                    ),
                    plan: BolusPlan::from_config(rows, config),
                    defaults,
                    limits: DoseLimits {
                        max_bolus: config.max_bolus,
                        max_basal: config.max_basal,
                    },
                }
            }
            SegmentPhase::Run => {
                let result = self
                    .segment_results
                    .get(&segment)
                    .ok_or_else(|| WizardError::validation(format!("segment {segment} has not run")))?;
                let dose = self
                    .dose_setting(segment)
                    .ok_or_else(|| WizardError::validation(format!("segment {segment} has no dose")))?;
                let last = result.final_glucose().ok_or(WizardError::EmptySeries)?;
                StageView::SegmentResult {
                    segment,
                    dose,
                    reference_glucose: rows.iter().map(|r| r.blood_glucose).collect(),
                    events: classify_events(&result.glucose, &result.timestamps)?,
                    time_in_range: time_in_range(&result.glucose)?,
                    final_status: GlucoseStatus::classify(last),
                    is_last: segment.is_last(),
                    result: result.clone(),
                }
            }
        };
        Ok(view)
    }
}

fn validate_dose(bolus: f64, basal: f64, config: &WizardConfig) -> Result<DoseSetting> {
    if !bolus.is_finite() || !(0.0..=config.max_bolus).contains(&bolus) {
        return Err(WizardError::validation(format!(
            "bolus must be between 0 and {} U",
            config.max_bolus
        )));
    }
    if !basal.is_finite() || !(0.0..=config.max_basal).contains(&basal) {
        return Err(WizardError::validation(format!(
            "basal must be between 0 and {} U/min",
            config.max_basal
        )));
    }
    Ok(DoseSetting { bolus, basal })
}
