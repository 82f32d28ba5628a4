//! This crate contains a mid-level abstraction for reading and writing
//! DICOM data sets.
//!
//! - [`read`] holds the resumable data set stream reader,
//!   which tolerates partial buffers and suspends with a
//!   "need more data" status instead of failing;
//! - [`write`] holds the data set writer.
#![deny(unsafe_code)]

pub mod read;
pub mod write;

pub use read::{
    parse_data_set, parse_data_set_with_options, DataSetReader, ReadOptions, ReadStatus,
};
pub use write::encode_data_set;

#[cfg(test)]
mod tests;
