use chrono::NaiveDateTime;
use serde::Serialize;

use super::types::{DoseSetting, ReferenceRow, WizardConfig};

/// Bolus timing for one segment: a single injection `lead_steps` before the
/// first meal at or above the carbohydrate threshold.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BolusPlan {
    pub meal_step: Option<usize>,
    pub bolus_step: Option<usize>,
}

impl BolusPlan {
    pub fn for_rows(rows: &[ReferenceRow], threshold_grams: f64, lead_steps: usize) -> Self {
        let meal_step = rows.iter().position(|r| r.carbohydrate >= threshold_grams);
        Self {
            meal_step,
            bolus_step: meal_step.map(|idx| idx.saturating_sub(lead_steps)),
        }
    }

    pub fn from_config(rows: &[ReferenceRow], config: &WizardConfig) -> Self {
        Self::for_rows(rows, config.meal_threshold_grams, config.bolus_lead_steps)
    }

    pub fn bolus_at(&self, step: usize, dose: DoseSetting) -> f64 {
        if self.bolus_step == Some(step) {
            dose.bolus
        } else {
            0.0
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PortionBand {
    Snack,
    Light,
    Small,
    Medium,
    Regular,
    Large,
    Feast,
}

impl PortionBand {
    pub fn for_grams(grams: f64) -> Self {
        match grams {
            g if g < 10.0 => PortionBand::Snack,
            g if g < 20.0 => PortionBand::Light,
            g if g < 30.0 => PortionBand::Small,
            g if g < 40.0 => PortionBand::Medium,
            g if g < 55.0 => PortionBand::Regular,
            g if g < 70.0 => PortionBand::Large,
            _ => PortionBand::Feast,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MealEntry {
    pub step: usize,
    pub time: NaiveDateTime,
    pub carbohydrate: f64,
    pub kilocalories: f64,
    pub portion: PortionBand,
}

pub fn meals_in(rows: &[ReferenceRow]) -> Vec<MealEntry> {
    rows.iter()
        .enumerate()
        .filter(|(_, r)| r.carbohydrate > 0.0)
        .map(|(step, r)| MealEntry {
            step,
            time: r.timestamp,
            carbohydrate: round_to(r.carbohydrate, 1),
            kilocalories: (r.carbohydrate * 4.0).floor(),
            portion: PortionBand::for_grams(r.carbohydrate),
        })
        .collect()
}

pub fn total_carbohydrate(rows: &[ReferenceRow]) -> f64 {
    rows.iter().map(|r| r.carbohydrate).sum()
}

/// Correction above target plus carbohydrate coverage, rounded to 0.01 U.
pub fn recommended_bolus(glucose: f64, carbohydrate: f64, config: &WizardConfig) -> f64 {
    let correction = (glucose - config.target_glucose).max(0.0) / config.correction_factor;
    let meal = carbohydrate / config.carb_ratio;
    round_to(correction + meal, 2)
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}
