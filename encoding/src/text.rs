//! Text encoding and decoding under the DICOM character repertoires.
//!
//! The default character repertoire is decoded as ISO 8859-1,
//! which is a superset of the basic G0 set. Data sets may switch
//! to another repertoire through the Specific Character Set attribute;
//! the defined terms supported here are the ones this tool kit
//! is exercised with.

use encoding::all::{ISO_8859_1, UTF_8};
use encoding::{DecoderTrap, EncoderTrap, Encoding};
use snafu::Snafu;

/// An error from decoding a sequence of bytes into text.
#[derive(Debug, Snafu)]
#[snafu(display("could not decode text: {}", message))]
pub struct DecodeTextError {
    message: String,
}

/// An error from encoding text into a sequence of bytes.
#[derive(Debug, Snafu)]
#[snafu(display("could not encode text: {}", message))]
pub struct EncodeTextError {
    message: String,
}

type DecodeResult<T> = Result<T, DecodeTextError>;
type EncodeResult<T> = Result<T, EncodeTextError>;

/// A holder of a text encoding and decoding mechanism.
pub trait TextCodec {
    /// The name of the character repertoire, as a Specific Character Set
    /// defined term.
    fn name(&self) -> &'static str;

    /// Decode the given byte sequence into a string.
    fn decode(&self, text: &[u8]) -> DecodeResult<String>;

    /// Encode a text value into a byte sequence.
    fn encode(&self, text: &str) -> EncodeResult<Vec<u8>>;
}

impl<T: TextCodec + ?Sized> TextCodec for &T {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn decode(&self, text: &[u8]) -> DecodeResult<String> {
        (**self).decode(text)
    }

    fn encode(&self, text: &str) -> EncodeResult<Vec<u8>> {
        (**self).encode(text)
    }
}

/// The default character repertoire.
///
/// Decoded as ISO 8859-1 because it is a superset of the default
/// repertoire, keeping values readable when data sets omit the
/// Specific Character Set attribute they should have carried.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DefaultCharacterSetCodec;

impl TextCodec for DefaultCharacterSetCodec {
    fn name(&self) -> &'static str {
        "ISO_IR 6"
    }

    fn decode(&self, text: &[u8]) -> DecodeResult<String> {
        ISO_8859_1
            .decode(text, DecoderTrap::Strict)
            .map_err(|message| DecodeTextError {
                message: message.into_owned(),
            })
    }

    fn encode(&self, text: &str) -> EncodeResult<Vec<u8>> {
        ISO_8859_1
            .encode(text, EncoderTrap::Strict)
            .map_err(|message| EncodeTextError {
                message: message.into_owned(),
            })
    }
}

/// The ISO 8859-1 (Latin alphabet No. 1) character repertoire.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IsoIr100CharacterSetCodec;

impl TextCodec for IsoIr100CharacterSetCodec {
    fn name(&self) -> &'static str {
        "ISO_IR 100"
    }

    fn decode(&self, text: &[u8]) -> DecodeResult<String> {
        ISO_8859_1
            .decode(text, DecoderTrap::Strict)
            .map_err(|message| DecodeTextError {
                message: message.into_owned(),
            })
    }

    fn encode(&self, text: &str) -> EncodeResult<Vec<u8>> {
        ISO_8859_1
            .encode(text, EncoderTrap::Strict)
            .map_err(|message| EncodeTextError {
                message: message.into_owned(),
            })
    }
}

/// The Unicode UTF-8 character repertoire.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Utf8CharacterSetCodec;

impl TextCodec for Utf8CharacterSetCodec {
    fn name(&self) -> &'static str {
        "ISO_IR 192"
    }

    fn decode(&self, text: &[u8]) -> DecodeResult<String> {
        UTF_8
            .decode(text, DecoderTrap::Strict)
            .map_err(|message| DecodeTextError {
                message: message.into_owned(),
            })
    }

    fn encode(&self, text: &str) -> EncodeResult<Vec<u8>> {
        UTF_8
            .encode(text, EncoderTrap::Strict)
            .map_err(|message| EncodeTextError {
                message: message.into_owned(),
            })
    }
}

/// An enum type for the supported character sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecificCharacterSet {
    /// The default character set.
    Default,
    /// ISO 8859-1: the Latin alphabet No. 1 (defined term `ISO_IR 100`)
    IsoIr100,
    /// UTF-8: the Unicode character set (defined term `ISO_IR 192`)
    IsoIr192,
}

impl Default for SpecificCharacterSet {
    fn default() -> Self {
        SpecificCharacterSet::Default
    }
}

impl SpecificCharacterSet {
    /// Obtain the character set from a Specific Character Set defined term.
    ///
    /// An unrecognized term yields `None`; callers typically fall back
    /// to the default repertoire.
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim_end() {
            "Default" | "ISO_IR 6" | "ISO 2022 IR 6" | "" => Some(SpecificCharacterSet::Default),
            "ISO_IR 100" | "ISO 2022 IR 100" => Some(SpecificCharacterSet::IsoIr100),
            "ISO_IR 192" => Some(SpecificCharacterSet::IsoIr192),
            _ => None,
        }
    }
}

impl TextCodec for SpecificCharacterSet {
    fn name(&self) -> &'static str {
        match self {
            SpecificCharacterSet::Default => DefaultCharacterSetCodec.name(),
            SpecificCharacterSet::IsoIr100 => IsoIr100CharacterSetCodec.name(),
            SpecificCharacterSet::IsoIr192 => Utf8CharacterSetCodec.name(),
        }
    }

    fn decode(&self, text: &[u8]) -> DecodeResult<String> {
        match self {
            SpecificCharacterSet::Default => DefaultCharacterSetCodec.decode(text),
            SpecificCharacterSet::IsoIr100 => IsoIr100CharacterSetCodec.decode(text),
            SpecificCharacterSet::IsoIr192 => Utf8CharacterSetCodec.decode(text),
        }
    }

    fn encode(&self, text: &str) -> EncodeResult<Vec<u8>> {
        match self {
            SpecificCharacterSet::Default => DefaultCharacterSetCodec.encode(text),
            SpecificCharacterSet::IsoIr100 => IsoIr100CharacterSetCodec.encode(text),
            SpecificCharacterSet::IsoIr192 => Utf8CharacterSetCodec.encode(text),
        }
    }
}
