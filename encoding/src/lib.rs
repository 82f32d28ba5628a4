//! This crate contains the encoding and decoding primitives of the
//! Vesalius tool kit: endian-aware byte codecs, a growable byte buffer
//! with in-place swapping and bounded bulk copies, text codecs for the
//! DICOM character repertoires, and the transfer syntax registry.
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod buffer;
pub mod decode;
pub mod encode;
pub mod text;
pub mod transfer_syntax;

pub use buffer::{ByteBuffer, MAX_WRITE_CHUNK};
pub use byteordered::Endianness;
pub use decode::{BasicDecode, BasicDecoder};
pub use encode::{BasicEncode, BasicEncoder};
pub use text::{SpecificCharacterSet, TextCodec};
pub use transfer_syntax::{
    TransferSyntax, EXPLICIT_VR_BIG_ENDIAN, EXPLICIT_VR_LITTLE_ENDIAN, IMPLICIT_VR_LITTLE_ENDIAN,
};
