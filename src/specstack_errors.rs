use thiserror::Error;

use crate::constants::{FrameId, SubInstrumentId};

/// Coarse classification of [`SpecStackError`], used to decide whether a partition is skipped,
/// degraded, or whether the whole run has to stop before any numeric work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    DataUnavailable,
    ExternalTool,
    InsufficientData,
    Storage,
}

#[derive(Error, Debug)]
pub enum SpecStackError {
    #[error("Invalid configuration parameter: {0}")]
    InvalidParameter(String),

    #[error("Wavelength interval '{0}' is already registered in this partition")]
    DuplicateInterval(String),

    #[error("Unknown instrument: {0}")]
    UnknownInstrument(String),

    #[error("Array shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Invalid epoch: {0}")]
    InvalidEpoch(String),

    #[error("Frame not found: {0}")]
    FrameNotFound(FrameId),

    #[error("Required data is not available: {0}")]
    DataUnavailable(String),

    #[error("External tool failed: {0}")]
    ExternalTool(String),

    #[error("{sub_instrument} has {valid} valid observations, at least {required} are needed")]
    InsufficientData {
        sub_instrument: SubInstrumentId,
        valid: usize,
        required: usize,
    },

    #[error("No stored template matches: {0}")]
    TemplateNotFound(String),

    #[error("Stored template is corrupted: {0}")]
    CorruptTemplate(String),

    #[error("Unable to perform file operation: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parquet error: {0}")]
    ParquetError(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    ArrowError(#[from] arrow_schema::ArrowError),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("ndarray shape error: {0}")]
    NdarrayShapeError(#[from] ndarray::ShapeError),
}

impl SpecStackError {
    /// Map the error to its [`ErrorKind`].
    pub fn kind(&self) -> ErrorKind {
        use SpecStackError::*;
        match self {
            InvalidParameter(_) | DuplicateInterval(_) | UnknownInstrument(_)
            | ShapeMismatch(_) | InvalidEpoch(_) | NdarrayShapeError(_) => ErrorKind::Configuration,
            FrameNotFound(_) | DataUnavailable(_) | TemplateNotFound(_) => {
                ErrorKind::DataUnavailable
            }
            ExternalTool(_) => ErrorKind::ExternalTool,
            InsufficientData { .. } => ErrorKind::InsufficientData,
            CorruptTemplate(_) | IoError(_) | ParquetError(_) | ArrowError(_) | JsonError(_)
            | CsvError(_) => ErrorKind::Storage,
        }
    }
}

impl PartialEq for SpecStackError {
    fn eq(&self, other: &Self) -> bool {
        use SpecStackError::*;
        match (self, other) {
            (InvalidParameter(a), InvalidParameter(b)) => a == b,
            (DuplicateInterval(a), DuplicateInterval(b)) => a == b,
            (UnknownInstrument(a), UnknownInstrument(b)) => a == b,
            (ShapeMismatch(a), ShapeMismatch(b)) => a == b,
            (InvalidEpoch(a), InvalidEpoch(b)) => a == b,
            (FrameNotFound(a), FrameNotFound(b)) => a == b,
            (DataUnavailable(a), DataUnavailable(b)) => a == b,
            (ExternalTool(a), ExternalTool(b)) => a == b,
            (
                InsufficientData {
                    sub_instrument: s1,
                    valid: v1,
                    required: r1,
                },
                InsufficientData {
                    sub_instrument: s2,
                    valid: v2,
                    required: r2,
                },
            ) => s1 == s2 && v1 == v2 && r1 == r2,
            (TemplateNotFound(a), TemplateNotFound(b)) => a == b,
            (CorruptTemplate(a), CorruptTemplate(b)) => a == b,

            // wrapped library errors are not comparable: same variant is enough
            (IoError(_), IoError(_)) => true,
            (ParquetError(_), ParquetError(_)) => true,
            (ArrowError(_), ArrowError(_)) => true,
            (JsonError(_), JsonError(_)) => true,
            (CsvError(_), CsvError(_)) => true,
            (NdarrayShapeError(_), NdarrayShapeError(_)) => true,

            _ => false,
        }
    }
}
