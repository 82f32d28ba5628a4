//! This crate contains the Vesalius core data model:
//! attribute tags, value representations, element headers,
//! primitive values, attribute collections,
//! and the read-only attribute dictionary.
//!
//! The crate is the foundation for the encoding, parsing,
//! and upper-layer networking crates of the tool kit.
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod collection;
pub mod dictionary;
pub mod header;
pub mod value;

pub use collection::{
    Attribute, AttributeCollection, AttributeValue, FileReference, Fragment, FragmentSequence,
};
pub use dictionary::{DataDictionary, DictionaryEntry, StandardDictionary};
pub use header::{DataElementHeader, HasLength, Header, Length, SequenceItemHeader, Tag, VR};
pub use value::PrimitiveValue;
