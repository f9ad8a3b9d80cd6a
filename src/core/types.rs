use std::fmt;
use std::ops::Range;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub const SEGMENT_STEPS: usize = 160;
pub const SEGMENT_COUNT: u8 = 3;
pub const STEP_MINUTES: i64 = 3;
pub const RANGE_LOW: f64 = 70.0;
pub const RANGE_HIGH: f64 = 180.0;

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatientId(String);

impl PatientId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// True when the id can name a file inside the data directory without
    /// leaving it.
    pub fn is_plain_name(&self) -> bool {
        !self.is_blank()
            && !self.0.starts_with('.')
            && !self.0.contains("..")
            && !self.0.chars().any(|c| matches!(c, '/' | '\\' | ':' | '\0'))
    }

    pub fn group(&self) -> PatientGroup {
        if self.0.starts_with("adolescent") {
            PatientGroup::Adolescent
        } else if self.0.starts_with("adult") {
            PatientGroup::Adult
        } else if self.0.starts_with("child") {
            PatientGroup::Child
        } else {
            PatientGroup::Other
        }
    }

    /// Key of the reference trajectory file backing this patient.
    pub fn data_key(&self) -> String {
        format!("{}.csv", self.0)
    }
}

impl fmt::Display for PatientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PatientGroup {
    Adolescent,
    Adult,
    Child,
    Other,
}

/// One-based segment number within the simulated day.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
#[serde(transparent)]
pub struct SegmentIndex(u8);

impl SegmentIndex {
    pub const FIRST: SegmentIndex = SegmentIndex(1);
    pub const LAST: SegmentIndex = SegmentIndex(SEGMENT_COUNT);

    pub fn new(number: u8) -> Option<Self> {
        (1..=SEGMENT_COUNT).contains(&number).then_some(Self(number))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn next(self) -> Option<Self> {
        Self::new(self.0 + 1)
    }

    pub fn previous(self) -> Option<Self> {
        self.0.checked_sub(1).and_then(Self::new)
    }

    pub fn is_last(self) -> bool {
        self == Self::LAST
    }

    pub fn all() -> impl Iterator<Item = SegmentIndex> {
        (1..=SEGMENT_COUNT).map(SegmentIndex)
    }

    /// Reference rows covered by this segment: `[k*160, (k+1)*160)`.
    pub fn row_range(self) -> Range<usize> {
        let start = self.0 as usize * SEGMENT_STEPS;
        start..start + SEGMENT_STEPS
    }
}

impl fmt::Display for SegmentIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.0, SEGMENT_COUNT)
    }
}

/// Insulin action for one simulator step: basal in U/min, bolus in U.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct Action {
    pub basal: f64,
    pub bolus: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct Observation {
    pub glucose: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepInfo {
    pub elapsed_minutes: u32,
    pub blood_glucose: f64,
    pub meal_grams: f64,
    pub delivered_insulin: f64,
    pub risk: f64,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct StepOutcome {
    pub observation: Observation,
    pub reward: f64,
    pub done: bool,
    pub info: StepInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceRow {
    pub timestamp: NaiveDateTime,
    pub blood_glucose: f64,
    pub cgm: f64,
    pub carbohydrate: f64,
    pub insulin: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceSeries {
    pub rows: Vec<ReferenceRow>,
}

impl ReferenceSeries {
    pub fn new(rows: Vec<ReferenceRow>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn segment(&self, index: SegmentIndex) -> Option<&[ReferenceRow]> {
        self.rows.get(index.row_range())
    }

    /// Rows spanning every segment of the day, in order.
    pub fn day(&self) -> Option<&[ReferenceRow]> {
        let start = SegmentIndex::FIRST.row_range().start;
        let end = SegmentIndex::LAST.row_range().end;
        self.rows.get(start..end)
    }

    pub fn required_rows() -> usize {
        SegmentIndex::LAST.row_range().end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientParams {
    pub name: PatientId,
    pub body_weight: f64,
    pub basal_glucose: f64,
    pub basal_insulin: f64,
    pub p1: f64,
    pub p2: f64,
    pub p3: f64,
    pub insulin_clearance: f64,
    pub insulin_volume: f64,
    pub glucose_volume: f64,
    pub meal_absorption: f64,
    pub insulin_absorption: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct DoseSetting {
    pub bolus: f64,
    pub basal: f64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GlucoseStatus {
    Low,
    Normal,
    High,
}

impl GlucoseStatus {
    pub fn classify(reading: f64) -> Self {
        if reading < RANGE_LOW {
            GlucoseStatus::Low
        } else if reading > RANGE_HIGH {
            GlucoseStatus::High
        } else {
            GlucoseStatus::Normal
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlucoseEvent {
    pub status: GlucoseStatus,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
}

/// Tunables of the dosing wizard. Built and validated by the API layer.
#[derive(Debug, Clone, PartialEq)]
pub struct WizardConfig {
    pub meal_threshold_grams: f64,
    pub bolus_lead_steps: usize,
    pub default_bolus: f64,
    pub default_basal: f64,
    pub max_bolus: f64,
    pub max_basal: f64,
    pub target_glucose: f64,
    pub correction_factor: f64,
    pub carb_ratio: f64,
}

impl Default for WizardConfig {
    fn default() -> Self {
        Self {
            meal_threshold_grams: 10.0,
            bolus_lead_steps: 10,
            default_bolus: 1.0,
            default_basal: 0.02,
            max_bolus: 5.0,
            max_basal: 0.05,
            target_glucose: 110.0,
            correction_factor: 50.0,
            carb_ratio: 10.0,
        }
    }
}
