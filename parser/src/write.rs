//! The data set writer.
//!
//! Encodes an attribute collection under a transfer syntax.
//! Sequences and items are emitted with computed definite lengths;
//! fragment sequences keep their mandatory undefined length and
//! delimitation items. Values of odd length are padded to an even
//! number of bytes, with a space for text and a null byte otherwise.

use snafu::{Backtrace, ResultExt, Snafu};
use vesalius_core::{
    Attribute, AttributeCollection, AttributeValue, Fragment, PrimitiveValue, Tag, VR,
};
use vesalius_encoding::encode::BasicEncode;
use vesalius_encoding::text::{DefaultCharacterSetCodec, EncodeTextError, TextCodec};
use vesalius_encoding::transfer_syntax::TransferSyntax;
use vesalius_encoding::{BasicEncoder, SpecificCharacterSet};

/// An error from encoding a data set.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// A text value could not be encoded under the active character set.
    #[snafu(display("Could not encode text value of element {}", tag))]
    EncodeText {
        tag: Tag,
        source: EncodeTextError,
        backtrace: Backtrace,
    },

    /// A value is too long for the 16-bit length field of its VR.
    #[snafu(display("Value of element {} is too long for its VR ({} bytes)", tag, len))]
    ValueTooLong {
        tag: Tag,
        len: usize,
        backtrace: Backtrace,
    },

    /// Deferred (file reference) values must be materialized
    /// before encoding.
    #[snafu(display("Cannot encode deferred value of element {}", tag))]
    CannotEncodeDeferredValue { tag: Tag, backtrace: Backtrace },
}

/// Type alias for encoding results.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Encode a whole data set under the given transfer syntax.
pub fn encode_data_set(
    dataset: &AttributeCollection,
    syntax: &TransferSyntax,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    encode_collection(&mut out, dataset, syntax)?;
    Ok(out)
}

fn encode_collection(
    out: &mut Vec<u8>,
    dataset: &AttributeCollection,
    syntax: &TransferSyntax,
) -> Result<()> {
    let charset = dataset
        .specific_character_set()
        .and_then(SpecificCharacterSet::from_code)
        .unwrap_or_default();
    for attribute in dataset {
        encode_element(out, attribute, charset, syntax)?;
    }
    Ok(())
}

fn encode_element(
    out: &mut Vec<u8>,
    attribute: &Attribute,
    charset: SpecificCharacterSet,
    syntax: &TransferSyntax,
) -> Result<()> {
    let encoder = BasicEncoder::new(syntax.endianness);

    match &attribute.value {
        AttributeValue::Primitive(value) => {
            let bytes = encode_primitive(attribute.tag, attribute.vr, value, charset, syntax)?;
            write_header(out, attribute.tag, attribute.vr, bytes.len(), syntax)?;
            out.extend_from_slice(&bytes);
        }
        AttributeValue::Sequence(items) => {
            // encode items up front so the sequence length is definite
            let mut body = Vec::new();
            for item in items {
                let mut item_body = Vec::new();
                encode_collection(&mut item_body, item, syntax)?;
                encoder
                    .encode_tag(&mut body, Tag::ITEM.group(), Tag::ITEM.element())
                    .ok();
                encoder.encode_ul(&mut body, item_body.len() as u32).ok();
                body.extend_from_slice(&item_body);
            }
            write_header(out, attribute.tag, VR::SQ, body.len(), syntax)?;
            out.extend_from_slice(&body);
        }
        AttributeValue::Fragments(sequence) => {
            write_undefined_header(out, attribute.tag, attribute.vr, syntax);
            // basic offset table item
            encoder
                .encode_tag(&mut *out, Tag::ITEM.group(), Tag::ITEM.element())
                .ok();
            encoder
                .encode_ul(&mut *out, (sequence.offset_table.len() * 4) as u32)
                .ok();
            for entry in &sequence.offset_table {
                encoder.encode_ul(&mut *out, *entry).ok();
            }
            for fragment in &sequence.fragments {
                let data = match fragment {
                    Fragment::Loaded(data) => data,
                    Fragment::Deferred(_) => {
                        return CannotEncodeDeferredValueSnafu {
                            tag: attribute.tag,
                        }
                        .fail()
                    }
                };
                encoder
                    .encode_tag(&mut *out, Tag::ITEM.group(), Tag::ITEM.element())
                    .ok();
                encoder.encode_ul(&mut *out, data.len() as u32).ok();
                out.extend_from_slice(data);
            }
            encoder
                .encode_tag(
                    &mut *out,
                    Tag::SEQUENCE_DELIMITER.group(),
                    Tag::SEQUENCE_DELIMITER.element(),
                )
                .ok();
            encoder.encode_ul(&mut *out, 0).ok();
        }
        AttributeValue::Deferred(_) => {
            return CannotEncodeDeferredValueSnafu {
                tag: attribute.tag,
            }
            .fail()
        }
    }
    Ok(())
}

/// Write a tag, VR and definite length header.
fn write_header(
    out: &mut Vec<u8>,
    tag: Tag,
    vr: VR,
    len: usize,
    syntax: &TransferSyntax,
) -> Result<()> {
    let encoder = BasicEncoder::new(syntax.endianness);
    encoder.encode_tag(&mut *out, tag.group(), tag.element()).ok();

    if syntax.explicit_vr {
        out.extend_from_slice(&vr.to_bytes());
        if vr.is_short_length() {
            if len > usize::from(u16::MAX) {
                return ValueTooLongSnafu { tag, len }.fail();
            }
            encoder.encode_us(&mut *out, len as u16).ok();
        } else {
            out.extend_from_slice(&[0, 0]);
            encoder.encode_ul(&mut *out, len as u32).ok();
        }
    } else {
        encoder.encode_ul(&mut *out, len as u32).ok();
    }
    Ok(())
}

/// Write a tag, VR and undefined length header
/// for an encapsulated pixel data element.
fn write_undefined_header(out: &mut Vec<u8>, tag: Tag, vr: VR, syntax: &TransferSyntax) {
    let encoder = BasicEncoder::new(syntax.endianness);
    encoder.encode_tag(&mut *out, tag.group(), tag.element()).ok();
    if syntax.explicit_vr {
        out.extend_from_slice(&vr.to_bytes());
        out.extend_from_slice(&[0, 0]);
    }
    encoder.encode_ul(&mut *out, 0xFFFF_FFFF).ok();
}

/// Encode a primitive value to bytes, with even-length padding.
fn encode_primitive(
    tag: Tag,
    vr: VR,
    value: &PrimitiveValue,
    charset: SpecificCharacterSet,
    syntax: &TransferSyntax,
) -> Result<Vec<u8>> {
    let encoder = BasicEncoder::new(syntax.endianness);
    let mut bytes = match value {
        PrimitiveValue::Empty => Vec::new(),
        PrimitiveValue::Str(text) => encode_text(tag, vr, text, charset)?,
        PrimitiveValue::Strs(parts) => {
            let joined = parts.join("\\");
            encode_text(tag, vr, &joined, charset)?
        }
        PrimitiveValue::Tags(tags) => {
            let mut out = Vec::with_capacity(tags.len() * 4);
            for t in tags {
                encoder.encode_tag(&mut out, t.group(), t.element()).ok();
            }
            out
        }
        PrimitiveValue::U8(values) => values.to_vec(),
        PrimitiveValue::I16(values) => {
            let mut out = Vec::with_capacity(values.len() * 2);
            for v in values {
                encoder.encode_ss(&mut out, *v).ok();
            }
            out
        }
        PrimitiveValue::U16(values) => {
            let mut out = Vec::with_capacity(values.len() * 2);
            for v in values {
                encoder.encode_us(&mut out, *v).ok();
            }
            out
        }
        PrimitiveValue::I32(values) => {
            let mut out = Vec::with_capacity(values.len() * 4);
            for v in values {
                encoder.encode_sl(&mut out, *v).ok();
            }
            out
        }
        PrimitiveValue::U32(values) => {
            let mut out = Vec::with_capacity(values.len() * 4);
            for v in values {
                encoder.encode_ul(&mut out, *v).ok();
            }
            out
        }
        PrimitiveValue::I64(values) => {
            let mut out = Vec::with_capacity(values.len() * 8);
            for v in values {
                encoder.encode_sv(&mut out, *v).ok();
            }
            out
        }
        PrimitiveValue::U64(values) => {
            let mut out = Vec::with_capacity(values.len() * 8);
            for v in values {
                encoder.encode_uv(&mut out, *v).ok();
            }
            out
        }
        PrimitiveValue::F32(values) => {
            let mut out = Vec::with_capacity(values.len() * 4);
            for v in values {
                encoder.encode_fl(&mut out, *v).ok();
            }
            out
        }
        PrimitiveValue::F64(values) => {
            let mut out = Vec::with_capacity(values.len() * 8);
            for v in values {
                encoder.encode_fd(&mut out, *v).ok();
            }
            out
        }
    };

    if bytes.len() % 2 != 0 {
        bytes.push(padding_for(vr));
    }
    Ok(bytes)
}

fn encode_text(
    tag: Tag,
    vr: VR,
    text: &str,
    charset: SpecificCharacterSet,
) -> Result<Vec<u8>> {
    if vr.uses_character_set() {
        charset.encode(text).context(EncodeTextSnafu { tag })
    } else {
        DefaultCharacterSetCodec
            .encode(text)
            .context(EncodeTextSnafu { tag })
    }
}

/// The padding byte for values of odd length:
/// text values take a trailing space, except UIDs,
/// which take null padding like binary values.
fn padding_for(vr: VR) -> u8 {
    if vr.is_text() && vr != VR::UI {
        b' '
    } else {
        0x00
    }
}
