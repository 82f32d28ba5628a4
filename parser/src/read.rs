//! The data set stream reader.
//!
//! [`DataSetReader`] consumes a linear byte stream under a given
//! transfer syntax and populates a tree of attribute collections.
//! The reader is resumable: callers append bytes with [`supply`]
//! and re-invoke [`read`]; whenever the buffered bytes are not enough
//! to complete the field being read, the call returns
//! [`ReadStatus::NeedMoreData`] without consuming anything, and the
//! partially-read state (current tag, VR, length, sequence stack)
//! is retained for the next invocation.
//!
//! [`supply`]: DataSetReader::supply
//! [`read`]: DataSetReader::read

use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use std::path::PathBuf;
use tracing::warn;
use vesalius_core::collection::{FILE_META_GROUP_LENGTH, PIXEL_DATA, TRANSFER_SYNTAX_UID};
use vesalius_core::dictionary::{DataDictionary, StandardDictionary};
use vesalius_core::value::C;
use vesalius_core::{
    Attribute, AttributeCollection, AttributeValue, FileReference, Fragment, FragmentSequence,
    Length, PrimitiveValue, Tag, VR,
};
use vesalius_encoding::decode::BasicDecode;
use vesalius_encoding::text::{DecodeTextError, DefaultCharacterSetCodec, TextCodec};
use vesalius_encoding::transfer_syntax::{self, TransferSyntax};
use vesalius_encoding::{BasicDecoder, Endianness, SpecificCharacterSet};

/// An error which interrupts the parsing of a data set.
///
/// These are terminal for the data set at hand;
/// resumption with more bytes is signalled through
/// [`ReadStatus::NeedMoreData`] instead.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// Unexpected tag while reading encapsulated pixel data items.
    #[snafu(display("Unexpected tag {} while reading pixel data fragments", tag))]
    UnexpectedFragmentTag { tag: Tag, backtrace: Backtrace },

    /// Fragment items must have a defined length.
    #[snafu(display("Undefined length in pixel data fragment item"))]
    UndefinedFragmentLength { backtrace: Backtrace },

    /// The data set requested a switch to a transfer syntax
    /// which is not in the registry.
    #[snafu(display("Unsupported transfer syntax `{}`", uid))]
    UnsupportedTransferSyntax { uid: String, backtrace: Backtrace },

    /// The file meta group ended without a transfer syntax attribute.
    #[snafu(display("Missing transfer syntax in file meta group"))]
    MissingTransferSyntax { backtrace: Backtrace },

    /// An unknown element with undefined length cannot be parsed
    /// under an explicit VR syntax.
    #[snafu(display("Undefined length in element {} of unknown representation", tag))]
    UnresolvedUndefinedLength { tag: Tag, backtrace: Backtrace },

    /// A text value could not be decoded under the active character set.
    #[snafu(display("Could not decode text value of element {}", tag))]
    DecodeText {
        tag: Tag,
        source: DecodeTextError,
        backtrace: Backtrace,
    },

    /// The source ended in the middle of a field and no more data
    /// can arrive.
    #[snafu(display("Data set truncated: {} more bytes needed", needed))]
    Truncated { needed: u32, backtrace: Backtrace },
}

/// Type alias for parsing results.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The outcome of one invocation of [`DataSetReader::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The reader consumed the buffered bytes up to a clean element
    /// boundary, or reached the stop tag.
    Complete,
    /// At least this many more bytes are needed to make progress.
    /// Nothing was consumed from the partially read field.
    NeedMoreData(u32),
}

/// Behavioural flags for the data set reader.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    /// Keep group length elements (element number 0x0000)
    /// instead of dropping them.
    pub keep_group_lengths: bool,
    /// Record large pixel data values as file references
    /// instead of loading them, when the source path is known.
    pub store_pixel_data_references: bool,
    /// Allow peeking ahead in the buffered data to disambiguate
    /// private elements of unknown representation.
    /// Must be left unset for non-seekable (network) sources.
    pub allow_seeking_for_context: bool,
}

impl ReadOptions {
    /// Options suitable for reading from a file.
    pub fn file() -> Self {
        ReadOptions {
            allow_seeking_for_context: true,
            ..ReadOptions::default()
        }
    }

    /// Keep group length elements.
    pub fn keep_group_lengths(mut self) -> Self {
        self.keep_group_lengths = true;
        self
    }

    /// Defer pixel data values to file references.
    pub fn store_pixel_data_references(mut self) -> Self {
        self.store_pixel_data_references = true;
        self
    }
}

/// A record of one sequence being parsed,
/// kept in an explicit stack so that the parser state
/// can survive suspension between partial reads.
#[derive(Debug)]
struct SequenceRecord {
    /// the tag of the sequence element
    tag: Tag,
    /// the declared length of the sequence value
    len: Length,
    /// absolute offset where the sequence value begins
    base: u64,
    /// items of this sequence are read with implicit VR little endian
    /// (the element was encoded with VR UN)
    implicit_items: bool,
    /// the items collected so far
    items: Vec<AttributeCollection>,
    /// the item under construction:
    /// its collection, declared length, and value base offset
    current: Option<(AttributeCollection, Length, u64)>,
}

/// Pixel data fragments being collected for the element
/// currently being read.
#[derive(Debug)]
struct PendingFragments {
    tag: Tag,
    vr: VR,
    sequence: FragmentSequence,
}

/// A stateful reader of data set bytes.
///
/// See the [module documentation](self) for the reading model.
#[derive(Debug)]
pub struct DataSetReader {
    /// the active transfer syntax; switched in place when the
    /// file meta group ends
    syntax: &'static TransferSyntax,
    options: ReadOptions,
    /// the path of the source file, enabling deferred value references
    source_path: Option<PathBuf>,

    /// buffered input not yet consumed
    buf: Vec<u8>,
    /// read cursor within `buf`
    pos: usize,
    /// absolute number of bytes consumed since the reader was created
    read: u64,

    /// the tag of the element being read, if already decoded
    tag: Option<Tag>,
    /// the dictionary VR for that tag
    entry_vr: VR,
    /// the resolved VR of the element being read
    vr: Option<VR>,
    /// the resolved VR stands in for an unknown one
    vr_from_unknown: bool,
    /// the declared value length of the element being read
    len: Option<Length>,

    /// currently inside the file meta group
    in_meta_group: bool,
    /// absolute offset at which the file meta group ends
    meta_group_end: u64,

    /// the stack of open sequences
    records: Vec<SequenceRecord>,
    /// the encapsulated pixel data element being collected
    fragment: Option<PendingFragments>,
}

impl DataSetReader {
    /// Create a reader for a data set under the given transfer syntax.
    pub fn new(syntax: &'static TransferSyntax) -> Self {
        Self::with_options(syntax, ReadOptions::default())
    }

    /// Create a reader with the given behavioural options.
    pub fn with_options(syntax: &'static TransferSyntax, options: ReadOptions) -> Self {
        DataSetReader {
            syntax,
            options,
            source_path: None,
            buf: Vec::new(),
            pos: 0,
            read: 0,
            tag: None,
            entry_vr: VR::UN,
            vr: None,
            vr_from_unknown: false,
            len: None,
            in_meta_group: false,
            meta_group_end: 0,
            records: Vec::new(),
            fragment: None,
        }
    }

    /// Record the path of the source file,
    /// enabling deferred pixel data references.
    pub fn source_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.source_path = Some(path.into());
        self
    }

    /// The transfer syntax currently in effect.
    pub fn transfer_syntax(&self) -> &'static TransferSyntax {
        self.syntax
    }

    /// The absolute number of bytes consumed so far.
    pub fn bytes_read(&self) -> u64 {
        self.read
    }

    /// The tag read last, retained between invocations.
    pub fn last_tag_read(&self) -> Option<Tag> {
        self.tag
    }

    /// Append more source bytes to the reader's buffer.
    pub fn supply(&mut self, bytes: &[u8]) {
        // discard the consumed prefix before growing
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Read the data set from the buffered bytes into `dataset`.
    ///
    /// Parsing stops when the next tag at the root level is greater
    /// than or equal to `stop_tag` (if one is given), or when the
    /// buffered bytes are exhausted at a clean element boundary.
    pub fn read(
        &mut self,
        dataset: &mut AttributeCollection,
        stop_tag: Option<Tag>,
    ) -> Result<ReadStatus> {
        loop {
            // transfer syntax switch at the end of the file meta group
            if self.in_meta_group && self.read >= self.meta_group_end {
                self.in_meta_group = false;
                let uid = dataset
                    .get(TRANSFER_SYNTAX_UID)
                    .and_then(Attribute::string)
                    .map(str::to_owned)
                    .context(MissingTransferSyntaxSnafu)?;
                self.syntax = transfer_syntax::lookup(&uid)
                    .context(UnsupportedTransferSyntaxSnafu { uid })?;
            }

            // 1. group and element numbers
            if self.tag.is_none() {
                if self.remaining() == 0 {
                    return Ok(self.end_of_buffer_status());
                }
                if self.remaining() < 4 {
                    return Ok(self.need(4));
                }
                let (group, element) = self
                    .decoder()
                    .decode_tag(&self.buf[self.pos..])
                    .map_err(|_| TruncatedSnafu { needed: 4_u32 }.build())?;
                self.consume(4);
                let tag = Tag(group, element);
                self.tag = Some(tag);
                self.entry_vr = StandardDictionary.vr_of(tag);
                self.vr_from_unknown = false;
            }
            let tag = self.tag.expect("tag was just ensured above");

            // 2. the stop tag is only honored at the root level
            if let Some(stop) = stop_tag {
                if tag >= stop && self.records.is_empty() && self.fragment.is_none() {
                    return Ok(ReadStatus::Complete);
                }
            }

            // 3. value representation
            if self.vr.is_none() {
                if let Some(status) = self.resolve_vr(tag)? {
                    return Ok(status);
                }
            }

            // 4. value length
            if self.len.is_none() {
                if let Some(status) = self.read_length(tag)? {
                    return Ok(status);
                }
            }
            let mut vr = self.vr.expect("VR was resolved above");
            let len = self.len.expect("length was read above");

            // a private creator of unknown representation is a long
            // string; the reclassification happens only after the
            // length field was read with the original representation
            if vr == VR::UN && tag.is_private_creator() {
                vr = VR::LO;
                self.vr = Some(vr);
            }

            // 5. dispatch on the element kind
            if self.fragment.is_some() {
                if let Some(status) = self.read_fragment_item(dataset, tag, len)? {
                    return Ok(status);
                }
            } else if !self.records.is_empty() && tag.is_item_marker() {
                self.handle_item_marker(dataset, tag, len);
            } else if tag == Tag::ITEM_DELIMITER || tag == Tag::SEQUENCE_DELIMITER {
                warn!(
                    "delimitation item {} outside of a sequence at offset {}",
                    tag, self.read
                );
            } else if len.is_undefined() {
                self.begin_undefined_length(tag, vr)?;
            } else if vr == VR::SQ {
                if len == Length(0) {
                    // a zero length sequence becomes a null attribute
                    Self::insert_target(&mut self.records, dataset)
                        .put(Attribute::empty(tag, VR::SQ));
                } else {
                    let implicit_items = self.vr_from_unknown;
                    self.push_record(tag, len, implicit_items);
                }
            } else if let Some(status) = self.read_value(dataset, tag, vr, len)? {
                return Ok(status);
            }

            // element complete
            self.tag = None;
            self.vr = None;
            self.len = None;
            self.unwind(dataset);
        }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn need(&self, total: usize) -> ReadStatus {
        ReadStatus::NeedMoreData((total - self.remaining()) as u32)
    }

    /// Whether element headers are currently read with an explicit VR.
    fn active_explicit_vr(&self) -> bool {
        if self.records.iter().any(|r| r.implicit_items) {
            false
        } else {
            self.syntax.explicit_vr
        }
    }

    /// The byte order currently in effect.
    fn active_endianness(&self) -> Endianness {
        if self.records.iter().any(|r| r.implicit_items) {
            Endianness::Little
        } else {
            self.syntax.endianness
        }
    }

    fn decoder(&self) -> BasicDecoder {
        BasicDecoder::new(self.active_endianness())
    }

    /// Consume `n` bytes from the buffer.
    /// The caller must have checked availability.
    fn consume(&mut self, n: usize) {
        self.pos += n;
        self.read += n as u64;
    }

    /// Parsing status for an exhausted buffer:
    /// a clean boundary with no open sequences is completion,
    /// anything else needs at least another element header.
    fn end_of_buffer_status(&self) -> ReadStatus {
        if self.records.is_empty() && self.fragment.is_none() {
            ReadStatus::Complete
        } else {
            ReadStatus::NeedMoreData(8)
        }
    }

    /// Resolve the VR of the current element.
    /// Returns a status when more bytes are needed.
    fn resolve_vr(&mut self, tag: Tag) -> Result<Option<ReadStatus>> {
        if tag.is_item_marker() {
            // items and delimiters carry no VR
            self.vr = Some(VR::UN);
            return Ok(None);
        }

        let mut vr = if self.active_explicit_vr() {
            if self.remaining() < 2 {
                return Ok(Some(self.need(2)));
            }
            let code = [self.buf[self.pos], self.buf[self.pos + 1]];
            self.consume(2);
            match VR::from_binary(code) {
                Some(wire_vr) => {
                    if self.entry_vr != VR::UN
                        && wire_vr != self.entry_vr
                        && !tag.is_private()
                    {
                        warn!(
                            "element {} read with VR {} but the dictionary says {}",
                            tag, wire_vr, self.entry_vr
                        );
                        // the wire wins
                    }
                    wire_vr
                }
                None => {
                    warn!(
                        "element {} carries an invalid VR code {:?}, using {}",
                        tag, code, self.entry_vr
                    );
                    self.entry_vr
                }
            }
        } else {
            self.entry_vr
        };

        if vr == VR::UN && tag.is_private() {
            // best-effort disambiguation of private elements:
            // an undefined length hiding behind the unknown VR
            // means the element is really a sequence
            if self.options.allow_seeking_for_context {
                let peek_at = if self.active_explicit_vr() {
                    // 2 reserved bytes precede the 32-bit length
                    self.pos + 2
                } else {
                    self.pos
                };
                if self.buf.len() >= peek_at + 4 {
                    if let Ok(peeked) = self.decoder().decode_ul(&self.buf[peek_at..]) {
                        if Length(peeked).is_undefined() {
                            vr = VR::SQ;
                            self.vr_from_unknown = true;
                        }
                    }
                }
            }
            if vr == VR::UN && tag.is_private_creator() && !self.active_explicit_vr() {
                vr = VR::LO;
            }
        }

        self.vr = Some(vr);
        Ok(None)
    }

    /// Read the value length field of the current element.
    /// Returns a status when more bytes are needed.
    fn read_length(&mut self, tag: Tag) -> Result<Option<ReadStatus>> {
        let vr = self.vr.expect("VR must be resolved before the length");

        let len = if tag.is_item_marker() || !self.active_explicit_vr() {
            // item markers and implicit VR always use a 32-bit length
            if self.remaining() < 4 {
                return Ok(Some(self.need(4)));
            }
            let len = self
                .decoder()
                .decode_ul(&self.buf[self.pos..])
                .map_err(|_| TruncatedSnafu { needed: 4_u32 }.build())?;
            self.consume(4);
            Length(len)
        } else if vr.is_short_length() {
            if self.remaining() < 2 {
                return Ok(Some(self.need(2)));
            }
            let len = self
                .decoder()
                .decode_us(&self.buf[self.pos..])
                .map_err(|_| TruncatedSnafu { needed: 2_u32 }.build())?;
            self.consume(2);
            Length(u32::from(len))
        } else {
            // 2 reserved bytes, then a 32-bit length
            if self.remaining() < 6 {
                return Ok(Some(self.need(6)));
            }
            let len = self
                .decoder()
                .decode_ul(&self.buf[self.pos + 2..])
                .map_err(|_| TruncatedSnafu { needed: 6_u32 }.build())?;
            self.consume(6);
            Length(len)
        };

        self.len = Some(len);
        Ok(None)
    }

    /// Handle an item, item delimiter or sequence delimiter
    /// while inside encapsulated pixel data.
    fn read_fragment_item(
        &mut self,
        dataset: &mut AttributeCollection,
        tag: Tag,
        len: Length,
    ) -> Result<Option<ReadStatus>> {
        match tag {
            Tag::ITEM => {
                let len = len.get().context(UndefinedFragmentLengthSnafu)? as usize;
                if self.remaining() < len {
                    return Ok(Some(self.need(len)));
                }
                let has_offset_table = self
                    .fragment
                    .as_ref()
                    .expect("fragment mode was checked by the caller")
                    .sequence
                    .has_offset_table;

                if !has_offset_table {
                    // the first item is the basic offset table
                    let mut table = vec![0u32; len / 4];
                    self.decoder()
                        .decode_ul_into(&self.buf[self.pos..self.pos + len], &mut table)
                        .map_err(|_| TruncatedSnafu { needed: len as u32 }.build())?;
                    self.consume(len);
                    let fragment = self
                        .fragment
                        .as_mut()
                        .expect("fragment mode was checked by the caller");
                    fragment.sequence.offset_table = table;
                    fragment.sequence.has_offset_table = true;
                } else if self.options.store_pixel_data_references && self.source_path.is_some() {
                    let reference = FileReference {
                        path: self
                            .source_path
                            .clone()
                            .expect("source path presence was checked above"),
                        offset: self.read,
                        length: len as u32,
                    };
                    self.consume(len);
                    self.fragment
                        .as_mut()
                        .expect("fragment mode was checked by the caller")
                        .sequence
                        .fragments
                        .push(Fragment::Deferred(reference));
                } else {
                    let data = self.buf[self.pos..self.pos + len].to_vec();
                    self.consume(len);
                    self.fragment
                        .as_mut()
                        .expect("fragment mode was checked by the caller")
                        .sequence
                        .fragments
                        .push(Fragment::Loaded(data));
                }
                Ok(None)
            }
            Tag::SEQUENCE_DELIMITER => {
                let fragment = self
                    .fragment
                    .take()
                    .expect("fragment mode was checked by the caller");
                let attribute = Attribute::fragments(fragment.tag, fragment.vr, fragment.sequence);
                Self::insert_target(&mut self.records, dataset).put(attribute);
                Ok(None)
            }
            tag => UnexpectedFragmentTagSnafu { tag }.fail(),
        }
    }

    /// Handle an item, item delimiter or sequence delimiter
    /// at sequence level.
    fn handle_item_marker(
        &mut self,
        dataset: &mut AttributeCollection,
        tag: Tag,
        len: Length,
    ) {
        match tag {
            Tag::ITEM => {
                // the new item inherits the character set in effect
                // at the sequence's parent, unless a sibling already
                // overrode it
                let below = self.records.len() - 1;
                let parent_charset = self.records[..below]
                    .iter()
                    .rev()
                    .find_map(|r| {
                        r.current
                            .as_ref()
                            .map(|(item, _, _)| item.specific_character_set().map(str::to_owned))
                    })
                    .unwrap_or_else(|| dataset.specific_character_set().map(str::to_owned));

                let mut item = AttributeCollection::new();
                if let Some(code) = parent_charset {
                    item.set_specific_character_set(code);
                }

                let base = self.read;
                let top = self
                    .records
                    .last_mut()
                    .expect("item markers are only handled inside a sequence");
                if let Some((finished, _, _)) = top.current.take() {
                    // an item start also closes an undelimited open item
                    top.items.push(finished);
                }
                top.current = Some((item, len, base));
            }
            Tag::ITEM_DELIMITER => {
                let read = self.read;
                let top = self
                    .records
                    .last_mut()
                    .expect("item markers are only handled inside a sequence");
                match top.current.take() {
                    Some((item, _, _)) => top.items.push(item),
                    None => warn!(
                        "item delimiter with no open item in sequence {} at offset {}",
                        top.tag, read
                    ),
                }
            }
            Tag::SEQUENCE_DELIMITER => {
                let mut record = self
                    .records
                    .pop()
                    .expect("item markers are only handled inside a sequence");
                if let Some((item, _, _)) = record.current.take() {
                    record.items.push(item);
                }
                let attribute = Self::finish_record(record);
                Self::insert_target(&mut self.records, dataset).put(attribute);
            }
            _ => unreachable!("not an item marker"),
        }
    }

    /// Open a sequence or enter fragment mode for an element
    /// with undefined length.
    fn begin_undefined_length(&mut self, tag: Tag, vr: VR) -> Result<()> {
        let mut vr = vr;
        if vr == VR::UN {
            if self.active_explicit_vr() {
                // resolving this would mean switching the whole parser
                // to implicit VR for the duration of the element
                return UnresolvedUndefinedLengthSnafu { tag }.fail();
            }
            vr = VR::SQ;
            self.vr_from_unknown = true;
        }

        if vr == VR::SQ {
            let implicit_items = self.vr_from_unknown;
            self.push_record(tag, Length::UNDEFINED, implicit_items);
        } else {
            // encapsulated pixel data: offset table first, then fragments
            self.fragment = Some(PendingFragments {
                tag,
                vr,
                sequence: FragmentSequence::new(),
            });
        }
        Ok(())
    }

    fn push_record(&mut self, tag: Tag, len: Length, implicit_items: bool) {
        self.records.push(SequenceRecord {
            tag,
            len,
            base: self.read,
            implicit_items,
            items: Vec::new(),
            current: None,
        });
    }

    /// Read a defined-length primitive value and store the attribute.
    /// Returns a status when more bytes are needed.
    fn read_value(
        &mut self,
        dataset: &mut AttributeCollection,
        tag: Tag,
        vr: VR,
        len: Length,
    ) -> Result<Option<ReadStatus>> {
        let len = len.get().expect("caller dispatches undefined lengths") as usize;
        if self.remaining() < len {
            return Ok(Some(self.need(len)));
        }

        // deferred pixel data of defined length
        if tag == PIXEL_DATA
            && self.options.store_pixel_data_references
            && self.source_path.is_some()
        {
            let reference = FileReference {
                path: self
                    .source_path
                    .clone()
                    .expect("source path presence was checked above"),
                offset: self.read,
                length: len as u32,
            };
            self.consume(len);
            Self::insert_target(&mut self.records, dataset).put(Attribute {
                tag,
                vr,
                value: AttributeValue::Deferred(reference),
            });
            return Ok(None);
        }

        let charset = Self::insert_target(&mut self.records, dataset)
            .specific_character_set()
            .and_then(SpecificCharacterSet::from_code)
            .unwrap_or_default();
        let endianness = self.active_endianness();
        let bytes = self.buf[self.pos..self.pos + len].to_vec();
        self.consume(len);
        let value = build_value(tag, vr, bytes, endianness, charset)?;

        // the file meta group length arms a transfer syntax switch
        // once that many more bytes have been consumed
        if tag == FILE_META_GROUP_LENGTH && self.records.is_empty() {
            if let Some(group_len) = value.u32() {
                self.in_meta_group = true;
                self.meta_group_end = self.read + u64::from(group_len);
            }
        }

        if tag.is_group_length() && !self.options.keep_group_lengths {
            return Ok(None);
        }

        Self::insert_target(&mut self.records, dataset).put(Attribute {
            tag,
            vr,
            value: AttributeValue::Primitive(value),
        });
        Ok(None)
    }

    /// The collection which receives the next completed attribute:
    /// the item under construction of the innermost sequence,
    /// or the root data set.
    fn insert_target<'a>(
        records: &'a mut [SequenceRecord],
        dataset: &'a mut AttributeCollection,
    ) -> &'a mut AttributeCollection {
        for record in records.iter_mut().rev() {
            if let Some((item, _, _)) = record.current.as_mut() {
                return item;
            }
        }
        dataset
    }

    /// Turn a closed sequence record into an attribute.
    /// A sequence which produced no items becomes a null attribute.
    fn finish_record(record: SequenceRecord) -> Attribute {
        if record.items.is_empty() {
            Attribute::empty(record.tag, VR::SQ)
        } else {
            Attribute::sequence(record.tag, record.items)
        }
    }

    /// Close items and sequences whose declared lengths
    /// have been consumed.
    fn unwind(&mut self, dataset: &mut AttributeCollection) {
        loop {
            let read = self.read;
            let (close_item, close_seq) = match self.records.last() {
                Some(top) => {
                    let close_item = top
                        .current
                        .as_ref()
                        .and_then(|(_, len, base)| {
                            len.get().map(|l| read >= base + u64::from(l))
                        })
                        .unwrap_or(false);
                    let close_seq = !close_item
                        && top
                            .len
                            .get()
                            .map(|l| read >= top.base + u64::from(l))
                            .unwrap_or(false);
                    (close_item, close_seq)
                }
                None => break,
            };

            if close_item {
                let top = self
                    .records
                    .last_mut()
                    .expect("stack top was matched above");
                let (item, _, _) = top
                    .current
                    .take()
                    .expect("an open item was matched above");
                top.items.push(item);
                continue;
            }

            if close_seq {
                let mut record = self.records.pop().expect("stack top was matched above");
                if let Some((item, _, _)) = record.current.take() {
                    record.items.push(item);
                }
                let attribute = Self::finish_record(record);
                Self::insert_target(&mut self.records, dataset).put(attribute);
                continue;
            }

            break;
        }
    }
}

/// Construct a primitive value from raw value bytes,
/// according to the value representation, byte order
/// and character set in effect.
fn build_value(
    tag: Tag,
    vr: VR,
    bytes: Vec<u8>,
    endianness: Endianness,
    charset: SpecificCharacterSet,
) -> Result<PrimitiveValue> {
    if bytes.is_empty() {
        return Ok(PrimitiveValue::Empty);
    }
    let decoder = BasicDecoder::new(endianness);

    let value = match vr {
        VR::AE | VR::AS | VR::CS | VR::DA | VR::DS | VR::DT | VR::IS | VR::TM | VR::UI => {
            // textual, default repertoire, possibly multi-valued
            let text = DefaultCharacterSetCodec
                .decode(&bytes)
                .context(DecodeTextSnafu { tag })?;
            split_strings(text)
        }
        VR::LO | VR::PN | VR::SH | VR::UC => {
            // textual under the specific character set, possibly multi-valued
            let text = charset.decode(&bytes).context(DecodeTextSnafu { tag })?;
            split_strings(text)
        }
        VR::LT | VR::ST | VR::UT => {
            // text blobs do not admit multiplicity
            let text = charset.decode(&bytes).context(DecodeTextSnafu { tag })?;
            PrimitiveValue::Str(text)
        }
        VR::UR => {
            let text = DefaultCharacterSetCodec
                .decode(&bytes)
                .context(DecodeTextSnafu { tag })?;
            PrimitiveValue::Str(text)
        }
        VR::AT => {
            let mut tags: C<Tag> = C::new();
            let mut slice = &bytes[..];
            while slice.len() >= 4 {
                match decoder.decode_tag(&mut slice) {
                    Ok((group, element)) => tags.push(Tag(group, element)),
                    Err(_) => break,
                }
            }
            PrimitiveValue::Tags(tags)
        }
        VR::US | VR::OW => {
            let mut out = vec![0u16; bytes.len() / 2];
            match decoder.decode_us_into(&bytes[..out.len() * 2], &mut out) {
                Ok(()) => PrimitiveValue::U16(out.into()),
                Err(_) => PrimitiveValue::U8(bytes.into()),
            }
        }
        VR::SS => {
            let mut slice = &bytes[..];
            let mut out: C<i16> = C::with_capacity(bytes.len() / 2);
            for _ in 0..bytes.len() / 2 {
                match decoder.decode_ss(&mut slice) {
                    Ok(v) => out.push(v),
                    Err(_) => break,
                }
            }
            PrimitiveValue::I16(out)
        }
        VR::UL | VR::OL => {
            let mut out = vec![0u32; bytes.len() / 4];
            match decoder.decode_ul_into(&bytes[..out.len() * 4], &mut out) {
                Ok(()) => PrimitiveValue::U32(out.into()),
                Err(_) => PrimitiveValue::U8(bytes.into()),
            }
        }
        VR::SL => {
            let mut slice = &bytes[..];
            let mut out: C<i32> = C::with_capacity(bytes.len() / 4);
            for _ in 0..bytes.len() / 4 {
                match decoder.decode_sl(&mut slice) {
                    Ok(v) => out.push(v),
                    Err(_) => break,
                }
            }
            PrimitiveValue::I32(out)
        }
        VR::UV | VR::OV => {
            let mut slice = &bytes[..];
            let mut out: C<u64> = C::with_capacity(bytes.len() / 8);
            for _ in 0..bytes.len() / 8 {
                match decoder.decode_uv(&mut slice) {
                    Ok(v) => out.push(v),
                    Err(_) => break,
                }
            }
            PrimitiveValue::U64(out)
        }
        VR::SV => {
            let mut slice = &bytes[..];
            let mut out: C<i64> = C::with_capacity(bytes.len() / 8);
            for _ in 0..bytes.len() / 8 {
                match decoder.decode_sv(&mut slice) {
                    Ok(v) => out.push(v),
                    Err(_) => break,
                }
            }
            PrimitiveValue::I64(out)
        }
        VR::FL | VR::OF => {
            let mut slice = &bytes[..];
            let mut out: C<f32> = C::with_capacity(bytes.len() / 4);
            for _ in 0..bytes.len() / 4 {
                match decoder.decode_fl(&mut slice) {
                    Ok(v) => out.push(v),
                    Err(_) => break,
                }
            }
            PrimitiveValue::F32(out)
        }
        VR::FD | VR::OD => {
            let mut slice = &bytes[..];
            let mut out: C<f64> = C::with_capacity(bytes.len() / 8);
            for _ in 0..bytes.len() / 8 {
                match decoder.decode_fd(&mut slice) {
                    Ok(v) => out.push(v),
                    Err(_) => break,
                }
            }
            PrimitiveValue::F64(out)
        }
        // OB, UN and anything else: raw bytes
        _ => PrimitiveValue::U8(bytes.into()),
    };
    Ok(value)
}

/// Split a decoded text value on backslashes into its components.
/// Single-valued text stays a plain string.
fn split_strings(text: String) -> PrimitiveValue {
    if text.contains('\\') {
        PrimitiveValue::Strs(text.split('\\').map(str::to_owned).collect())
    } else {
        PrimitiveValue::Str(text)
    }
}

/// Parse a complete, fully buffered data set.
///
/// A `NeedMoreData` outcome is reported as a
/// [`Truncated`](Error::Truncated) error, since no further bytes
/// can arrive.
pub fn parse_data_set(
    bytes: &[u8],
    syntax: &'static TransferSyntax,
) -> Result<AttributeCollection> {
    parse_data_set_with_options(bytes, syntax, ReadOptions::default())
}

/// Parse a complete, fully buffered data set with the given options.
pub fn parse_data_set_with_options(
    bytes: &[u8],
    syntax: &'static TransferSyntax,
    options: ReadOptions,
) -> Result<AttributeCollection> {
    let mut reader = DataSetReader::with_options(syntax, options);
    reader.supply(bytes);
    let mut dataset = AttributeCollection::new();
    match reader.read(&mut dataset, None)? {
        ReadStatus::Complete => Ok(dataset),
        ReadStatus::NeedMoreData(needed) => TruncatedSnafu { needed }.fail(),
    }
}
