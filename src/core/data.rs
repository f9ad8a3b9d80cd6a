use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use csv::ReaderBuilder;
use serde::Deserialize;
use tracing::debug;

use super::error::{Result, WizardError};
use super::types::{PatientId, PatientParams, ReferenceRow, ReferenceSeries};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Deserialize)]
struct TrajectoryRow {
    #[serde(rename = "Time")]
    time: String,
    #[serde(rename = "BG")]
    blood_glucose: f64,
    #[serde(rename = "CGM")]
    cgm: f64,
    #[serde(rename = "CHO")]
    carbohydrate: f64,
    insulin: f64,
}

#[derive(Debug, Deserialize)]
struct ParamsRow {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "BW")]
    body_weight: f64,
    #[serde(rename = "Gb")]
    basal_glucose: f64,
    #[serde(rename = "Ib")]
    basal_insulin: f64,
    p1: f64,
    p2: f64,
    p3: f64,
    n: f64,
    #[serde(rename = "Vi")]
    insulin_volume: f64,
    #[serde(rename = "Vg")]
    glucose_volume: f64,
    kabs: f64,
    kd: f64,
}

impl From<ParamsRow> for PatientParams {
    fn from(row: ParamsRow) -> Self {
        PatientParams {
            name: PatientId::new(row.name.trim()),
            body_weight: row.body_weight,
            basal_glucose: row.basal_glucose,
            basal_insulin: row.basal_insulin,
            p1: row.p1,
            p2: row.p2,
            p3: row.p3,
            insulin_clearance: row.n,
            insulin_volume: row.insulin_volume,
            glucose_volume: row.glucose_volume,
            meal_absorption: row.kabs,
            insulin_absorption: row.kd,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatientTable {
    rows: Vec<PatientParams>,
}

impl PatientTable {
    pub fn new(rows: Vec<PatientParams>) -> Self {
        Self { rows }
    }

    pub fn get(&self, patient: &PatientId) -> Option<&PatientParams> {
        self.rows.iter().find(|p| &p.name == patient)
    }

    pub fn ids(&self) -> Vec<PatientId> {
        self.rows.iter().map(|p| p.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn data_error(path: &Path, detail: impl ToString) -> WizardError {
    WizardError::Data {
        path: path.display().to_string(),
        detail: detail.to_string(),
    }
}

/// Reads a `Time,BG,CGM,CHO,insulin` trajectory; extra columns are ignored.
pub fn load_reference_series(path: &Path) -> Result<ReferenceSeries> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| data_error(path, e))?;

    let mut rows = Vec::new();
    for (line, record) in reader.deserialize::<TrajectoryRow>().enumerate() {
        let row = record.map_err(|e| data_error(path, e))?;
        let timestamp = NaiveDateTime::parse_from_str(&row.time, TIME_FORMAT).map_err(|e| {
            data_error(path, format!("row {}: bad timestamp {:?}: {e}", line + 1, row.time))
        })?;
        rows.push(ReferenceRow {
            timestamp,
            blood_glucose: row.blood_glucose,
            cgm: row.cgm,
            carbohydrate: row.carbohydrate,
            insulin: row.insulin,
        });
    }
    debug!(path = %path.display(), rows = rows.len(), "reference series loaded");
    Ok(ReferenceSeries::new(rows))
}

/// Reads a `Name,BW,Gb,Ib,p1,p2,p3,n,Vi,Vg,kabs,kd` parameter table.
pub fn load_patient_table(path: &Path) -> Result<PatientTable> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| data_error(path, e))?;

    let rows = reader
        .deserialize::<ParamsRow>()
        .map(|record| record.map(PatientParams::from).map_err(|e| data_error(path, e)))
        .collect::<Result<Vec<_>>>()?;
    debug!(path = %path.display(), patients = rows.len(), "patient table loaded");
    Ok(PatientTable::new(rows))
}

pub trait PatientDataSource: Send + Sync {
    fn patients(&self) -> Vec<PatientId>;

    /// Fails with `DataNotFound` when the patient has no trajectory.
    fn reference_series(&self, patient: &PatientId) -> Result<ReferenceSeries>;

    fn patient_params(&self, patient: &PatientId) -> Result<PatientParams>;
}

/// Trajectories stored as `<data_dir>/<patient>.csv` next to one shared
/// parameter table.
#[derive(Debug, Clone)]
pub struct CsvDataSource {
    data_dir: PathBuf,
    table: PatientTable,
}

impl CsvDataSource {
    pub fn open(data_dir: impl Into<PathBuf>, params_path: &Path) -> Result<Self> {
        let table = load_patient_table(params_path)?;
        Ok(Self {
            data_dir: data_dir.into(),
            table,
        })
    }

    pub fn table(&self) -> &PatientTable {
        &self.table
    }

    /// Only ids listed in the parameter table map to a file.
    fn trajectory_path(&self, patient: &PatientId) -> Result<PathBuf> {
        if self.table.get(patient).is_none() || !patient.is_plain_name() {
            return Err(WizardError::PatientNotFound(patient.to_string()));
        }
        Ok(self.data_dir.join(patient.data_key()))
    }
}

impl PatientDataSource for CsvDataSource {
    fn patients(&self) -> Vec<PatientId> {
        self.table.ids()
    }

    fn reference_series(&self, patient: &PatientId) -> Result<ReferenceSeries> {
        let path = self.trajectory_path(patient)?;
        if !path.is_file() {
            return Err(WizardError::DataNotFound {
                patient: patient.to_string(),
                detail: format!("{} does not exist", path.display()),
            });
        }
        load_reference_series(&path)
    }

    fn patient_params(&self, patient: &PatientId) -> Result<PatientParams> {
        self.table
            .get(patient)
            .cloned()
            .ok_or_else(|| WizardError::PatientNotFound(patient.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use super::*;

    #[derive(Debug, Default)]
    pub struct MemorySource {
        pub table: PatientTable,
        pub series: HashMap<PatientId, ReferenceSeries>,
    }

    impl PatientDataSource for MemorySource {
        fn patients(&self) -> Vec<PatientId> {
            self.table.ids()
        }

        fn reference_series(&self, patient: &PatientId) -> Result<ReferenceSeries> {
            self.series
                .get(patient)
                .cloned()
                .ok_or_else(|| WizardError::DataNotFound {
                    patient: patient.to_string(),
                    detail: "no series in memory".to_string(),
                })
        }

        fn patient_params(&self, patient: &PatientId) -> Result<PatientParams> {
            self.table
                .get(patient)
                .cloned()
                .ok_or_else(|| WizardError::PatientNotFound(patient.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const PARAMS: &str = "\
Name,BW,Gb,Ib,p1,p2,p3,n,Vi,Vg,kabs,kd
adult#001,102.3,138.6,20.1,0.03,0.025,1.3e-05,0.09,0.12,1.6,0.05,0.018
adolescent#002, 48.5 ,149.2,21.7,0.028,0.022,1.1e-05,0.1,0.13,1.7,0.055,0.02
";

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).expect("write fixture");
        path
    }

    #[test]
    fn parameter_table_maps_short_column_names() {
        let dir = tempdir().expect("tempdir");
        let path = write(dir.path(), "vpatient_params.csv", PARAMS);
        let table = load_patient_table(&path).expect("table loads");

        assert_eq!(table.len(), 2);
        let teen = table
            .get(&PatientId::new("adolescent#002"))
            .expect("present");
        assert_eq!(teen.body_weight, 48.5);
        assert_eq!(teen.insulin_clearance, 0.1);
        assert_eq!(teen.insulin_absorption, 0.02);
        assert!(table.get(&PatientId::new("child#001")).is_none());
    }

    #[test]
    fn trajectory_ignores_extra_columns_and_parses_timestamps() {
        let dir = tempdir().expect("tempdir");
        let path = write(
            dir.path(),
            "adult#001.csv",
            "Time,BG,CGM,CHO,insulin,LBGI,HBGI,Risk\n\
             2018-01-01 00:00:00,149.0,151.2,0.0,0.013,0.0,3.1,3.1\n\
             2018-01-01 00:03:00,148.1,150.0,45.0,0.013,0.0,3.0,3.0\n",
        );
        let series = load_reference_series(&path).expect("series loads");
        assert_eq!(series.len(), 2);
        assert_eq!(series.rows[1].carbohydrate, 45.0);
        assert_eq!(
            series.rows[1].timestamp.format(TIME_FORMAT).to_string(),
            "2018-01-01 00:03:00"
        );
    }

    #[test]
    fn malformed_timestamp_is_a_data_error_naming_the_row() {
        let dir = tempdir().expect("tempdir");
        let path = write(
            dir.path(),
            "bad.csv",
            "Time,BG,CGM,CHO,insulin\n01/01/2018 00:00,149,151,0,0.01\n",
        );
        let err = load_reference_series(&path).expect_err("bad timestamp");
        match err {
            WizardError::Data { detail, .. } => assert!(detail.contains("row 1")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn csv_source_reports_missing_trajectory_as_data_not_found() {
        let dir = tempdir().expect("tempdir");
        let params = write(dir.path(), "vpatient_params.csv", PARAMS);
        let source = CsvDataSource::open(dir.path(), &params).expect("opens");

        assert_eq!(
            source.patients(),
            vec![PatientId::new("adult#001"), PatientId::new("adolescent#002")]
        );
        let err = source
            .reference_series(&PatientId::new("adult#001"))
            .expect_err("no trajectory written");
        assert!(matches!(err, WizardError::DataNotFound { patient, .. } if patient == "adult#001"));

        let unknown = source
            .patient_params(&PatientId::new("adult#404"))
            .expect_err("not in table");
        assert!(matches!(unknown, WizardError::PatientNotFound(_)));
        assert!(unknown.aborts_run());
    }

    #[test]
    fn csv_source_only_reads_files_of_listed_patients() {
        let root = tempdir().expect("tempdir");
        let data_dir = root.path().join("data");
        fs::create_dir(&data_dir).expect("data dir");
        let params = write(&data_dir, "vpatient_params.csv", PARAMS);
        write(
            root.path(),
            "secret.csv",
            "Time,BG,CGM,CHO,insulin
TOP-SECRET-VALUE,1,1,0,0
",
        );
        let source = CsvDataSource::open(&data_dir, &params).expect("opens");

        for id in ["../secret", "vpatient_params"] {
            let err = source
                .reference_series(&PatientId::new(id))
                .expect_err("not a listed patient");
            assert!(matches!(err, WizardError::PatientNotFound(_)));
            assert!(!err.to_string().contains("TOP-SECRET"));
        }
    }

    #[test]
    fn missing_parameter_file_fails_to_open() {
        let dir = tempdir().expect("tempdir");
        let err = CsvDataSource::open(dir.path(), &dir.path().join("nope.csv"))
            .expect_err("no params file");
        assert!(matches!(err, WizardError::Data { .. }));
    }
}
