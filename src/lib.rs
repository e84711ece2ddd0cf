//! # dimuon
//!
//! Selection and aggregation of dimuon invariant-mass spectra.
//!
//! Event records (already reconstructed muons, their identification flags and the trigger
//! decisions of the event) go in, named histograms and cut-flow reports come out. The pipeline
//! pairs opposite-sign muons that pass a [`QualityGate`](crate::selection::QualityGate),
//! computes their invariant mass, classifies each pair into any number of overlapping
//! [`Category`](crate::classify::Category)s, and fills linear and log-mass histograms. Derived,
//! stacked histograms are built afterwards by a
//! [`Combination`](crate::combine::Combination) graph.
//!
//! ```ignore
//! use dimuon::prelude::*;
//!
//! let analysis = Analysis::new(AnalysisConfig::default())?;
//! let output = analysis.run(&dataset)?;
//! for (name, report) in &output.cutflows {
//!     println!("{name}\n{report}");
//! }
//! ```
#![warn(clippy::perf, clippy::style)]
#![allow(clippy::excessive_precision)]

use thiserror::Error;

/// Construction of the run, the accumulators, and the merge of partial results.
pub mod analysis;
/// The rule table which assigns dimuon candidates to named categories.
pub mod classify;
/// Derived histograms built by adding category histograms together.
pub mod combine;
/// Ordered counters of events surviving each selection stage.
pub mod cutflow;
/// Muons, events, dimuon candidates, and the columnar ingestion interface.
pub mod data;
/// Weighted one-dimensional histograms and named collections of them.
pub mod histogram;
/// Single-muon monitoring histograms.
pub mod monitor;
/// Muon quality gates and the pair selector.
pub mod selection;
/// Utility functions, enums, and vectors.
pub mod utils;

/// Commonly used items, re-exported for convenience.
pub mod prelude {
    pub use crate::analysis::{
        Accumulator, Analysis, AnalysisConfig, AnalysisOutput, SharedAccumulator, ThreadPolicy,
    };
    pub use crate::classify::{CandidateRule, Category, CategoryThresholds, Condition, MassWindow};
    pub use crate::combine::{Combination, STACK_ORDER};
    pub use crate::cutflow::{CutFlow, CutFlowReport};
    pub use crate::data::{Dataset, DimuonCandidate, Event, EventColumns, Muon};
    pub use crate::histogram::{Binning, Histogram, HistogramSet};
    pub use crate::selection::{PairBuffer, PairSelector, PairingMode, QualityGate};
    pub use crate::utils::enums::{Charge, MuonId};
    pub use crate::utils::vectors::{mass_of_pair, Vec3, Vec4};
    pub use crate::{DimuonError, DimuonResult};
}

pub use crate::analysis::{Analysis, AnalysisConfig, AnalysisOutput};
pub use crate::data::{Dataset, Event, Muon};
pub use crate::histogram::{Histogram, HistogramSet};
pub use crate::utils::vectors::{mass_of_pair, Vec3, Vec4};

/// Shorthand for results returned by this crate.
pub type DimuonResult<T> = Result<T, DimuonError>;

/// The error type used by all `dimuon` internal methods
#[derive(Error, Debug)]
pub enum DimuonError {
    /// A required numeric field was not supplied for an event (flags are never reported here
    /// since a missing flag reads as `false`).
    #[error("Missing required field \"{field}\"")]
    MissingField {
        /// Name of the missing field
        field: String,
    },
    /// Two per-muon (or per-candidate) arrays of the same event disagree in length.
    #[error("Field \"{field}\" has {found} entries but {expected} were expected")]
    MismatchedLength {
        /// Name of the offending field
        field: String,
        /// Length implied by the muon (or candidate) count
        expected: usize,
        /// Actual length of the field
        found: usize,
    },
    /// A precomputed dimuon candidate points outside the muon array of its event.
    #[error("Dimuon leg index {index} is out of bounds for an event with {n_muons} muons")]
    MalformedPairIndex {
        /// The offending index
        index: usize,
        /// Number of muons in the event
        n_muons: usize,
    },
    /// A muon charge other than `+1` or `-1`.
    #[error("Invalid muon charge {charge}")]
    InvalidCharge {
        /// The offending value
        charge: i32,
    },
    /// Invalid thresholds, binning, or category/combination configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// An error which occurs when a histogram is requested by a name which was never booked.
    #[error("No histogram with name \"{name}\"!")]
    UnknownHistogram {
        /// Name of the histogram which failed lookup
        name: String,
    },
    /// An error which occurs when two histograms with different bin edges are added.
    #[error("Histograms \"{left}\" and \"{right}\" do not share the same binning")]
    IncompatibleBinning {
        /// Name of the left-hand histogram
        left: String,
        /// Name of the right-hand histogram
        right: String,
    },
    /// An error which occurs when the user tries to parse an invalid string of text, typically
    /// into an enum variant.
    #[error("Failed to parse string: \"{name}\" does not correspond to a valid \"{object}\"!")]
    ParseError {
        /// The string which was parsed
        name: String,
        /// The name of the object it failed to parse into
        object: String,
    },
    /// An error type for [`rayon`] thread pools
    #[cfg(feature = "rayon")]
    #[error("Error building thread pool: {0}")]
    ThreadPoolError(#[from] rayon::ThreadPoolBuildError),
    /// A custom fallback error for errors too complex or too infrequent to warrant their own error
    /// category.
    #[error("{0}")]
    Custom(String),
}

impl DimuonError {
    /// Whether the error only invalidates the event it was raised for.
    ///
    /// Event-level errors are counted and skipped by the pipeline, everything else aborts
    /// construction.
    pub fn is_event_level(&self) -> bool {
        matches!(
            self,
            DimuonError::MissingField { .. }
                | DimuonError::MismatchedLength { .. }
                | DimuonError::MalformedPairIndex { .. }
                | DimuonError::InvalidCharge { .. }
        )
    }
}

impl Clone for DimuonError {
    // variants which are not event-level collapse into `Custom` with the rendered message
    fn clone(&self) -> Self {
        match self {
            DimuonError::MissingField { field } => DimuonError::MissingField {
                field: field.clone(),
            },
            DimuonError::MismatchedLength {
                field,
                expected,
                found,
            } => DimuonError::MismatchedLength {
                field: field.clone(),
                expected: *expected,
                found: *found,
            },
            DimuonError::InvalidCharge { charge } => DimuonError::InvalidCharge { charge: *charge },
            DimuonError::MalformedPairIndex { index, n_muons } => {
                DimuonError::MalformedPairIndex {
                    index: *index,
                    n_muons: *n_muons,
                }
            }
            other => DimuonError::Custom(other.to_string()),
        }
    }
}
