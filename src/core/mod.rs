mod checkpoint;
mod data;
mod dosing;
mod engine;
mod environment;
mod error;
mod metrics;
mod segment;
mod types;
mod wizard;

pub use checkpoint::CheckpointStore;
pub use data::{
    CsvDataSource, PatientDataSource, PatientTable, load_patient_table, load_reference_series,
};
pub use dosing::{
    BolusPlan, MealEntry, PortionBand, meals_in, recommended_bolus, total_carbohydrate,
};
pub use engine::{MealScenario, ScenarioSource, SimulatorSettings, T1dFactory, T1dSimulator};
pub use environment::{
    Environment, EnvironmentRequest, GlucoseSimulator, PendingEnvironment, SimulatorFactory,
    Snapshot,
};
pub use error::{Result, WizardError};
pub use metrics::{
    DaySummary, SegmentSummary, TrajectorySummary, Variability, Verdict, classify_events,
    summarize_day, time_in_range, variability,
};
pub use segment::{SegmentResult, execute_segment};
pub use types::{
    Action, DoseSetting, GlucoseEvent, GlucoseStatus, Observation, PatientGroup, PatientId,
    PatientParams, RANGE_HIGH, RANGE_LOW, ReferenceRow, ReferenceSeries, SEGMENT_COUNT,
    SEGMENT_STEPS, STEP_MINUTES, SegmentIndex, StepInfo, StepOutcome, WizardConfig,
};
pub use wizard::{
    DoseLimits, SegmentPhase, Stage, StageView, Transition, WizardCommand, WizardContext,
    WizardSession,
};
