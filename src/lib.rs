//! Decoder, validator and batch converter for binary CFD snapshot series.
//!
//! A case directory holds one snapshot file per output timestep
//! (`<problem>.<step>.<ext>`).  The pipeline is:
//!
//! 1. [`discover`] builds a [`SnapshotIndex`] from file names alone.
//! 2. [`validate`] reads every header and reports issues as data.
//! 3. [`decode`] / [`extract`] read one snapshot fully and query it.
//! 4. [`convert`] re-encodes a batch, in process or via an external tool.

mod cursor;

pub mod catalog;
pub mod config;
pub mod convert;
pub mod extract;
pub mod index;
pub mod snapshot;
pub mod validate;
pub mod zone;

pub use catalog::{CatalogHeader, FormatError, VariableCatalog};
pub use config::{CaseConfig, ConfigError};
pub use convert::{
    convert, CancelToken, ConversionJob, ConversionOutcome, ConversionResult, EnvironmentalError,
    Strategy, TargetFormat, ToolLocation,
};
pub use extract::{extract, BoundingBox, ExtractRequest, ExtractSource, Extraction, ExtractionError};
pub use index::{discover, IndexError, SnapshotFile, SnapshotIndex};
pub use snapshot::{decode, SnapshotDecode, SnapshotWriter};
pub use validate::{validate, IssueKind, ValidationReport};
pub use zone::{DataLayout, FieldValues, ZoneDescriptor, ZoneKind};
