//! # tagwp-core
//!
//! This is the library behind the `tagwp` command-line tool. It turns many event files
//! produced by an upstream selection stage into cached columnar samples and derives
//! per-category working points for a displaced-jet tagger from them.
//!
//! The pipeline runs leaf-first:
//!
//! 1. A [`ProcessRegistry`] describes each physics process by its files, cross-section and
//!    generator-weight integral.
//! 2. An [`EventChain`] presents the files of one process as a single addressable sequence
//!    and loads fields lazily, one column per open file.
//! 3. A [`SampleExtractor`] applies a [`Selection`] to every chain entry and projects the
//!    passing events into an [`ExtractedSample`], memoized on disk.
//! 4. A [`ThresholdCalibrator`] derives a [`ThresholdSet`] from the background sample.
//! 5. A [`YieldEvaluator`] re-applies it to background and signal samples.
#![warn(clippy::perf, clippy::style)]
#![allow(clippy::excessive_precision)]

use thiserror::Error;

/// Working-point derivation from weighted score quantiles.
pub mod calibrate;
/// A virtual dataset spanning many event files.
pub mod chain;
/// Columnar samples, the event field contract and file backends.
pub mod data;
/// Yield tables for calibrated thresholds.
pub mod evaluate;
/// Projection of event chains into cached samples.
pub mod extract;
/// Process descriptors and their discovery from a directory layout.
pub mod registry;
/// Filter expressions evaluated against events or sample rows.
pub mod selection;
/// Utility enums and helpers
pub mod utils;

pub use crate::calibrate::{
    CalibrationConfig, StratumWorkingPoint, ThresholdCalibrator, ThresholdSet,
};
pub use crate::chain::EventChain;
pub use crate::data::io::{FileReader, ParquetReader, RootReader};
pub use crate::data::{
    Column, EventScalars, EventSchema, EventTable, ExtractedSample, FieldRef, SampleRow,
    TableReader,
};
pub use crate::evaluate::{CategoryYield, ReportSection, YieldEvaluator, YieldReport, YieldTable};
pub use crate::extract::{MassPointSelection, SampleExtractor};
pub use crate::registry::{FolderWeights, GenWeights, MassPoint, ProcessDescriptor, ProcessRegistry};
pub use crate::selection::{Comparison, FieldSource, Selection};
pub use crate::utils::enums::{EmptyStratumPolicy, JetBand, ReportCategory, TaggerVariant};

pub type TagwpResult<T> = Result<T, TagwpError>;

/// The error type used by all `tagwp` internal methods
#[derive(Error, Debug)]
pub enum TagwpError {
    /// An alias for [`std::io::Error`].
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),
    /// An alias for [`parquet::errors::ParquetError`].
    #[error("Parquet Error: {0}")]
    ParquetError(#[from] parquet::errors::ParquetError),
    /// An alias for [`arrow::error::ArrowError`].
    #[error("Arrow Error: {0}")]
    ArrowError(#[from] arrow::error::ArrowError),
    /// An alias for [`serde_json::Error`].
    #[error("JSON Error: {0}")]
    JsonError(#[from] serde_json::Error),
    /// An alias for [`shellexpand::LookupError`].
    #[error("Failed to expand path: {0}")]
    LookupError(#[from] shellexpand::LookupError<std::env::VarError>),
    /// An input file could not be opened or is not a readable event file.
    #[error("Failed to open \"{path}\": {reason}")]
    FileOpen {
        /// Path of the offending file
        path: String,
        /// Message from the backend
        reason: String,
    },
    /// An input file does not contain the requested event table.
    #[error("File \"{path}\" has no event table named \"{table}\"")]
    MissingTable {
        /// Path of the offending file
        path: String,
        /// Name of the table which was requested
        table: String,
    },
    /// The active event table has no field by the requested name.
    #[error("Field \"{name}\" not found in \"{path}\"")]
    FieldNotFound {
        /// Name of the missing field
        name: String,
        /// Path of the file which was searched
        path: String,
    },
    /// The active entry lies beyond the loaded column, meaning the declared event count of a
    /// file disagrees with the length of one of its columns.
    #[error("Entry {entry} of field \"{name}\" is out of range (column length {length})")]
    OutOfRange {
        /// Name of the field
        name: String,
        /// Local entry which was requested
        entry: usize,
        /// Number of values in the loaded column
        length: usize,
    },
    /// A seek was attempted on a chain without any events.
    #[error("Cannot seek in an event chain with no events")]
    EmptyChain,
    /// A process has no usable normalization integral.
    #[error("Process \"{process}\" has a zero normalization integral")]
    Unnormalized {
        /// Name of the process
        process: String,
    },
    /// A process was requested which the registry does not know.
    #[error("No registered process with name \"{name}\"!")]
    UnknownProcess {
        /// Name of the process which failed lookup
        name: String,
    },
    /// A signal process has no generator-weight integral for the requested mass point.
    #[error("Process \"{process}\" has no integral for mass point (llp={llp}, lsp={lsp})")]
    MissingMassPoint {
        /// Name of the process
        process: String,
        /// Heavy-state mass
        llp: u32,
        /// Light-state mass
        lsp: u32,
    },
    /// A failure while iterating the events of a process.
    #[error("Extraction of process \"{process}\" failed: {source}")]
    Extraction {
        /// Name of the process being extracted
        process: String,
        /// Underlying failure
        #[source]
        source: Box<TagwpError>,
    },
    /// A calibration stratum had no entries to derive a working point from.
    #[error("Working point undefined: {reason}")]
    CalibrationUndefined {
        /// Which stratum (or strata) caused the failure
        reason: String,
    },
    /// A field reference could not be parsed.
    #[error("Invalid field reference \"{0}\"")]
    InvalidField(String),
    /// An error which occurs when the user tries to parse an invalid string of text, typically
    /// into an enum variant.
    #[error("Failed to parse string: \"{name}\" does not correspond to a valid \"{object}\"!")]
    ParseError {
        /// The string which was parsed
        name: String,
        /// The name of the object it failed to parse into
        object: String,
    },
    /// Two columns which must share a length do not.
    #[error("Length mismatch for {context}: expected {expected}, got {actual}")]
    LengthMismatch {
        /// Where the mismatch was found
        context: String,
        /// Expected number of values
        expected: usize,
        /// Number of values found
        actual: usize,
    },
    /// A cache artifact exists but does not have the layout written by [`SampleExtractor`].
    #[error("Malformed cache artifact \"{path}\": {reason}")]
    CacheFormat {
        /// Path of the artifact
        path: String,
        /// What was wrong with it
        reason: String,
    },
    /// A custom fallback error for errors too complex or too infrequent to warrant their own error
    /// category.
    #[error("{0}")]
    Custom(String),
}

impl TagwpError {
    /// Wrap an error raised while extracting `process`.
    pub(crate) fn in_process(self, process: &str) -> Self {
        match self {
            err @ TagwpError::Extraction { .. } => err,
            err => TagwpError::Extraction {
                process: process.to_string(),
                source: Box::new(err),
            },
        }
    }
}
