//! Data carried out of the pipeline

/// The run report handed to the reporting layer.
pub mod report;
