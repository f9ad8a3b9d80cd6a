use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::Serialize;

use super::error::{Result, WizardError};
use super::segment::SegmentResult;
use super::types::{
    GlucoseEvent, GlucoseStatus, RANGE_HIGH, RANGE_LOW, ReferenceSeries, STEP_MINUTES,
    SegmentIndex,
};

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Variability {
    pub mean: f64,
    pub standard_deviation: f64,
    pub coefficient_of_variation: f64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Verdict {
    UserAhead,
    ReferenceAhead,
    Tied,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentSummary {
    pub segment: SegmentIndex,
    pub time_in_range: f64,
    pub total_insulin: f64,
    pub variability: Variability,
    pub events: Vec<GlucoseEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrajectorySummary {
    pub glucose: Vec<f64>,
    pub timestamps: Vec<NaiveDateTime>,
    pub time_in_range: f64,
    /// Units delivered over the trajectory.
    pub total_insulin: f64,
    pub variability: Variability,
    pub events: Vec<GlucoseEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DaySummary {
    pub segments: Vec<SegmentSummary>,
    pub mean_segment_time_in_range: f64,
    pub user: TrajectorySummary,
    pub reference: TrajectorySummary,
    pub verdict: Verdict,
}

/// Percentage of readings within `[70, 180]` mg/dL.
pub fn time_in_range(series: &[f64]) -> Result<f64> {
    if series.is_empty() {
        return Err(WizardError::EmptySeries);
    }
    let in_range = series
        .iter()
        .filter(|g| (RANGE_LOW..=RANGE_HIGH).contains(*g))
        .count();
    Ok(in_range as f64 / series.len() as f64 * 100.0)
}

/// Population mean, standard deviation and `cv = 100 * std / mean`.
pub fn variability(series: &[f64]) -> Result<Variability> {
    if series.is_empty() {
        return Err(WizardError::EmptySeries);
    }
    let n = series.len() as f64;
    let mean = series.iter().sum::<f64>() / n;
    if mean == 0.0 {
        return Err(WizardError::ZeroMean);
    }
    let variance = series.iter().map(|g| (g - mean).powi(2)).sum::<f64>() / n;
    let standard_deviation = variance.sqrt();
    Ok(Variability {
        mean,
        standard_deviation,
        coefficient_of_variation: 100.0 * standard_deviation / mean,
    })
}

/// One event per maximal run of low or high readings. Normal runs separate
/// events and are never reported.
pub fn classify_events(series: &[f64], timestamps: &[NaiveDateTime]) -> Result<Vec<GlucoseEvent>> {
    if series.len() != timestamps.len() {
        return Err(WizardError::validation(format!(
            "glucose series has {} readings but {} timestamps",
            series.len(),
            timestamps.len()
        )));
    }

    let mut events = Vec::new();
    let mut open: Option<GlucoseEvent> = None;
    for (&reading, &time) in series.iter().zip(timestamps) {
        let status = GlucoseStatus::classify(reading);
        match open.as_mut() {
            Some(event) if event.status == status => event.end_time = time,
            _ => {
                if let Some(done) = open.take() {
                    events.push(done);
                }
                if status != GlucoseStatus::Normal {
                    open = Some(GlucoseEvent {
                        status,
                        start_time: time,
                        end_time: time,
                    });
                }
            }
        }
    }
    events.extend(open);
    Ok(events)
}

pub fn summarize_day(
    results: &BTreeMap<SegmentIndex, SegmentResult>,
    reference: &ReferenceSeries,
) -> Result<DaySummary> {
    let mut segments = Vec::with_capacity(results.len());
    let mut glucose = Vec::new();
    let mut timestamps = Vec::new();
    for segment in SegmentIndex::all() {
        let Some(result) = results.get(&segment) else {
            return Err(WizardError::validation(format!(
                "segment {segment} has not been run yet"
            )));
        };
        segments.push(SegmentSummary {
            segment,
            time_in_range: time_in_range(&result.glucose)?,
            total_insulin: result.total_insulin(),
            variability: variability(&result.glucose)?,
            events: classify_events(&result.glucose, &result.timestamps)?,
        });
        glucose.extend_from_slice(&result.glucose);
        timestamps.extend_from_slice(&result.timestamps);
    }

    let mean_segment_time_in_range =
        segments.iter().map(|s| s.time_in_range).sum::<f64>() / segments.len() as f64;
    let user_insulin = segments.iter().map(|s| s.total_insulin).sum();
    let user = summarize_trajectory(glucose, timestamps, user_insulin)?;

    let rows = reference.day().ok_or(WizardError::EmptySeries)?;
    let reference = summarize_trajectory(
        rows.iter().map(|r| r.blood_glucose).collect(),
        rows.iter().map(|r| r.timestamp).collect(),
        rows.iter().map(|r| r.insulin * STEP_MINUTES as f64).sum(),
    )?;

    let verdict = if user.time_in_range > reference.time_in_range {
        Verdict::UserAhead
    } else if user.time_in_range < reference.time_in_range {
        Verdict::ReferenceAhead
    } else {
        Verdict::Tied
    };

    Ok(DaySummary {
        segments,
        mean_segment_time_in_range,
        user,
        reference,
        verdict,
    })
}

fn summarize_trajectory(
    glucose: Vec<f64>,
    timestamps: Vec<NaiveDateTime>,
    total_insulin: f64,
) -> Result<TrajectorySummary> {
    Ok(TrajectorySummary {
        time_in_range: time_in_range(&glucose)?,
        total_insulin,
        variability: variability(&glucose)?,
        events: classify_events(&glucose, &timestamps)?,
        glucose,
        timestamps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Action, ReferenceRow, SEGMENT_STEPS};
    use chrono::{Duration, NaiveDate};
    use proptest::prelude::{prop_assert, prop_assert_eq, proptest};
    use proptest::collection::vec;

    const EPS: f64 = 1e-9;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn midnight() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .expect("valid date")
    }

    fn clock(count: usize) -> Vec<NaiveDateTime> {
        (0..count)
            .map(|i| midnight() + Duration::minutes(3 * i as i64))
            .collect()
    }

    fn at(minutes: i64) -> NaiveDateTime {
        midnight() + Duration::minutes(minutes)
    }

    #[test]
    fn time_in_range_rejects_empty_series() {
        assert!(matches!(time_in_range(&[]), Err(WizardError::EmptySeries)));
        assert!(matches!(variability(&[]), Err(WizardError::EmptySeries)));
    }

    #[test]
    fn time_in_range_counts_inclusive_bounds() {
        let tir = time_in_range(&[69.0, 70.0, 180.0, 181.0]).expect("non-empty");
        assert_approx(tir, 50.0);
    }

    #[test]
    fn variability_matches_hand_calculation() {
        let stats = variability(&[100.0, 120.0, 140.0, 160.0]).expect("non-empty");
        assert_approx(stats.mean, 130.0);
        assert_approx(stats.standard_deviation, 500.0_f64.sqrt());
        assert_approx(stats.coefficient_of_variation, 100.0 * 500.0_f64.sqrt() / 130.0);
    }

    #[test]
    fn variability_rejects_zero_mean() {
        assert!(matches!(variability(&[0.0, 0.0]), Err(WizardError::ZeroMean)));
    }

    #[test]
    fn classify_events_reports_high_then_low_and_skips_normal() {
        let series = [200.0, 200.0, 60.0, 60.0, 150.0, 150.0];
        let events = classify_events(&series, &clock(series.len())).expect("aligned");
        assert_eq!(
            events,
            vec![
                GlucoseEvent {
                    status: GlucoseStatus::High,
                    start_time: at(0),
                    end_time: at(3),
                },
                GlucoseEvent {
                    status: GlucoseStatus::Low,
                    start_time: at(6),
                    end_time: at(9),
                },
            ]
        );
    }

    #[test]
    fn classify_events_keeps_runs_split_by_normal_gap() {
        let series = [50.0, 100.0, 55.0, 65.0];
        let events = classify_events(&series, &clock(series.len())).expect("aligned");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].start_time, at(0));
        assert_eq!(events[0].end_time, at(0));
        assert_eq!(events[1].start_time, at(6));
        assert_eq!(events[1].end_time, at(9));
    }

    #[test]
    fn classify_events_rejects_misaligned_inputs() {
        let err = classify_events(&[100.0, 100.0], &clock(1)).expect_err("misaligned");
        assert!(matches!(err, WizardError::Validation(_)));
    }

    fn flat_result(value: f64, start_minutes: i64) -> SegmentResult {
        SegmentResult {
            glucose: vec![value; SEGMENT_STEPS],
            timestamps: (0..SEGMENT_STEPS)
                .map(|i| at(start_minutes + 3 * i as i64))
                .collect(),
            actions: Vec::new(),
            bolus_step: None,
        }
    }

    fn reference_with(value: f64) -> ReferenceSeries {
        ReferenceSeries::new(
            (0..ReferenceSeries::required_rows())
                .map(|i| ReferenceRow {
                    timestamp: at(3 * i as i64),
                    blood_glucose: value,
                    cgm: value,
                    carbohydrate: 0.0,
                    insulin: 0.01,
                })
                .collect(),
        )
    }

    #[test]
    fn summarize_day_aggregates_all_segments() {
        let mut results = BTreeMap::new();
        results.insert(SegmentIndex::FIRST, flat_result(120.0, 480));
        results.insert(SegmentIndex::new(2).expect("valid"), flat_result(250.0, 960));
        results.insert(SegmentIndex::LAST, flat_result(120.0, 1440));

        let summary = summarize_day(&results, &reference_with(140.0)).expect("complete day");
        assert_eq!(summary.segments.len(), 3);
        assert_eq!(summary.user.glucose.len(), 3 * SEGMENT_STEPS);
        assert_eq!(summary.reference.glucose.len(), 3 * SEGMENT_STEPS);
        assert_approx(summary.mean_segment_time_in_range, 200.0 / 3.0);
        assert_approx(summary.user.time_in_range, 200.0 / 3.0);
        assert_approx(summary.reference.time_in_range, 100.0);
        assert_eq!(summary.verdict, Verdict::ReferenceAhead);
        assert_eq!(summary.user.events.len(), 1);
        assert_eq!(summary.user.events[0].status, GlucoseStatus::High);
    }

    #[test]
    fn summarize_day_totals_insulin_per_segment_and_day() {
        let mut results = BTreeMap::new();
        for (number, start) in [(1, 480), (2, 960), (3, 1440)] {
            let mut result = flat_result(120.0, start);
            result.actions = vec![Action { basal: 0.02, bolus: 0.0 }; SEGMENT_STEPS];
            if number == 2 {
                result.actions[40].bolus = 3.0;
            }
            results.insert(SegmentIndex::new(number).expect("valid"), result);
        }

        let summary = summarize_day(&results, &reference_with(140.0)).expect("complete day");
        let per_segment = summary
            .segments
            .iter()
            .map(|s| s.total_insulin)
            .collect::<Vec<_>>();
        assert_approx(per_segment[0], 9.6);
        assert_approx(per_segment[1], 12.6);
        assert_approx(per_segment[2], 9.6);
        assert_approx(summary.user.total_insulin, 31.8);
        assert_approx(summary.reference.total_insulin, 14.4);
    }

    #[test]
    fn summarize_day_requires_every_segment() {
        let mut results = BTreeMap::new();
        results.insert(SegmentIndex::FIRST, flat_result(120.0, 480));
        let err = summarize_day(&results, &reference_with(120.0)).expect_err("incomplete");
        assert!(matches!(err, WizardError::Validation(_)));
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(64))]

        #[test]
        fn prop_in_range_series_scores_full_time_in_range(values in vec(70.0f64..=180.0, 160)) {
            prop_assert_eq!(time_in_range(&values).expect("non-empty"), 100.0);
        }

        #[test]
        fn prop_low_series_scores_zero_time_in_range(values in vec(1.0f64..69.99, 160)) {
            prop_assert_eq!(time_in_range(&values).expect("non-empty"), 0.0);
        }

        #[test]
        fn prop_time_in_range_ignores_ordering(mut values in vec(20.0f64..400.0, 1..200)) {
            let before = time_in_range(&values).expect("non-empty");
            values.reverse();
            let mid = values.len() / 2;
            values.rotate_left(mid);
            let after = time_in_range(&values).expect("non-empty");
            prop_assert_eq!(before, after);
            prop_assert!((0.0..=100.0).contains(&after));
        }

        #[test]
        fn prop_cv_is_scaled_std_over_mean(values in vec(1.0f64..500.0, 1..200)) {
            let stats = variability(&values).expect("positive mean");
            prop_assert_eq!(
                stats.coefficient_of_variation,
                100.0 * stats.standard_deviation / stats.mean
            );
        }

        #[test]
        fn prop_events_never_report_normal_and_are_ordered(values in vec(30.0f64..300.0, 1..120)) {
            let times = clock(values.len());
            let events = classify_events(&values, &times).expect("aligned");
            for pair in events.windows(2) {
                prop_assert!(pair[0].end_time < pair[1].start_time);
            }
            for event in &events {
                prop_assert!(event.status != GlucoseStatus::Normal);
                prop_assert!(event.start_time <= event.end_time);
            }
        }
    }
}
