use thiserror::Error;

use super::types::SegmentIndex;

#[derive(Debug, Error)]
pub enum WizardError {
    #[error("{0}")]
    Validation(String),
    #[error("no data for patient {patient}: {detail}")]
    DataNotFound { patient: String, detail: String },
    #[error("no physiological parameters for patient {0}")]
    PatientNotFound(String),
    #[error("no environment checkpoint captured for segment {0}")]
    NoCheckpoint(SegmentIndex),
    #[error("cannot compute glucose metrics over an empty series")]
    EmptySeries,
    #[error("mean glucose is zero, coefficient of variation is undefined")]
    ZeroMean,
    #[error("malformed data in {path}: {detail}")]
    Data { path: String, detail: String },
}

impl WizardError {
    pub fn validation(msg: impl Into<String>) -> Self {
        WizardError::Validation(msg.into())
    }

    /// Invariant violations; the session that produced one must be discarded.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            WizardError::NoCheckpoint(_) | WizardError::EmptySeries | WizardError::ZeroMean
        )
    }

    /// Data and environment failures end the current run and send the user
    /// back to patient selection.
    pub fn aborts_run(&self) -> bool {
        matches!(
            self,
            WizardError::DataNotFound { .. }
                | WizardError::PatientNotFound(_)
                | WizardError::Data { .. }
        )
    }
}

pub type Result<T, E = WizardError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_partitions_error_kinds() {
        let validation = WizardError::validation("pick a patient");
        assert!(!validation.is_programming_error());
        assert!(!validation.aborts_run());

        let missing = WizardError::DataNotFound {
            patient: "adult#001".to_string(),
            detail: "file absent".to_string(),
        };
        assert!(missing.aborts_run());
        assert!(!missing.is_programming_error());

        let checkpoint = WizardError::NoCheckpoint(SegmentIndex::FIRST);
        assert!(checkpoint.is_programming_error());
        assert!(!checkpoint.aborts_run());
        assert!(WizardError::EmptySeries.is_programming_error());
    }

    #[test]
    fn messages_name_the_offending_item() {
        let err = WizardError::NoCheckpoint(SegmentIndex::LAST);
        assert_eq!(
            err.to_string(),
            "no environment checkpoint captured for segment 3/3"
        );
        let err = WizardError::PatientNotFound("adult#009".to_string());
        assert!(err.to_string().contains("adult#009"));
    }
}
