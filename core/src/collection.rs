//! In-memory representation of DICOM data sets:
//! attributes, ordered attribute collections,
//! and encapsulated pixel data fragment sequences.

use crate::header::{Tag, VR};
use crate::value::PrimitiveValue;
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::iter::FromIterator;
use std::path::PathBuf;

/// The tag of the Specific Character Set attribute.
pub const SPECIFIC_CHARACTER_SET: Tag = Tag(0x0008, 0x0005);

/// The tag of the Pixel Data attribute.
pub const PIXEL_DATA: Tag = Tag(0x7FE0, 0x0010);

/// The tag of the File Meta Information Group Length attribute.
pub const FILE_META_GROUP_LENGTH: Tag = Tag(0x0002, 0x0000);

/// The tag of the Transfer Syntax UID attribute.
pub const TRANSFER_SYNTAX_UID: Tag = Tag(0x0002, 0x0010);

/// A reference to a range of bytes in a file,
/// standing in for value data that was deliberately not loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReference {
    /// the path to the file holding the data
    pub path: PathBuf,
    /// the offset of the first value byte in the file
    pub offset: u64,
    /// the length of the value data in bytes
    pub length: u32,
}

/// One fragment of an encapsulated pixel data element:
/// either held in memory or deferred to a file reference.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    /// the fragment data, loaded in memory
    Loaded(Vec<u8>),
    /// the fragment data stays in the source file until requested
    Deferred(FileReference),
}

impl Fragment {
    /// The byte length of the fragment data.
    pub fn len(&self) -> u32 {
        match self {
            Fragment::Loaded(data) => data.len() as u32,
            Fragment::Deferred(r) => r.length,
        }
    }

    /// Whether the fragment holds no data.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The contents of an encapsulated (undefined length) pixel data element:
/// a basic offset table followed by an ordered list of opaque fragments.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FragmentSequence {
    /// the basic offset table entries
    pub offset_table: Vec<u32>,
    /// whether the offset table item has been read,
    /// even if it carried no entries
    pub has_offset_table: bool,
    /// the pixel data fragments in order of appearance
    pub fragments: Vec<Fragment>,
}

impl FragmentSequence {
    /// Create an empty fragment sequence.
    pub fn new() -> Self {
        FragmentSequence::default()
    }
}

/// The value of a data set attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    /// a primitive, fully decoded value (may be empty, the null marker)
    Primitive(PrimitiveValue),
    /// a nested sequence of data set items
    Sequence(Vec<AttributeCollection>),
    /// encapsulated pixel data fragments
    Fragments(FragmentSequence),
    /// a value deliberately left in the source file
    Deferred(FileReference),
}

/// A single data set attribute: a tag, a value representation
/// and the attribute value. Owned by exactly one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    /// the attribute tag
    pub tag: Tag,
    /// the value representation
    pub vr: VR,
    /// the attribute value
    pub value: AttributeValue,
}

impl Attribute {
    /// Create an attribute with a primitive value.
    pub fn new<T>(tag: Tag, vr: VR, value: T) -> Self
    where
        T: Into<PrimitiveValue>,
    {
        Attribute {
            tag,
            vr,
            value: AttributeValue::Primitive(value.into()),
        }
    }

    /// Create an attribute with no value (the null marker).
    pub fn empty(tag: Tag, vr: VR) -> Self {
        Attribute {
            tag,
            vr,
            value: AttributeValue::Primitive(PrimitiveValue::Empty),
        }
    }

    /// Create a sequence attribute from its items.
    pub fn sequence(tag: Tag, items: Vec<AttributeCollection>) -> Self {
        Attribute {
            tag,
            vr: VR::SQ,
            value: AttributeValue::Sequence(items),
        }
    }

    /// Create a pixel data attribute from its fragments.
    pub fn fragments(tag: Tag, vr: VR, fragments: FragmentSequence) -> Self {
        Attribute {
            tag,
            vr,
            value: AttributeValue::Fragments(fragments),
        }
    }

    /// Whether the attribute holds no value.
    pub fn is_null(&self) -> bool {
        matches!(
            self.value,
            AttributeValue::Primitive(PrimitiveValue::Empty)
        )
    }

    /// Retrieve the primitive value, if the attribute holds one.
    pub fn primitive(&self) -> Option<&PrimitiveValue> {
        match &self.value {
            AttributeValue::Primitive(v) => Some(v),
            _ => None,
        }
    }

    /// Retrieve the sequence items, if the attribute holds a sequence.
    pub fn items(&self) -> Option<&[AttributeCollection]> {
        match &self.value {
            AttributeValue::Sequence(items) => Some(items),
            _ => None,
        }
    }

    /// Retrieve the first string of this attribute's value, if textual.
    pub fn string(&self) -> Option<&str> {
        self.primitive().and_then(PrimitiveValue::string)
    }
}

/// An ordered collection of data set attributes, keyed by tag.
///
/// A collection may carry a specific character set code which is
/// inherited by child sequence items unless they override it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AttributeCollection {
    entries: BTreeMap<Tag, Attribute>,
    /// the specific character set defined term (e.g. "ISO_IR 100"),
    /// if the data set declares or inherits one
    specific_character_set: Option<String>,
}

impl AttributeCollection {
    /// Create an empty collection.
    pub fn new() -> Self {
        AttributeCollection::default()
    }

    /// Insert an attribute, replacing any previous attribute
    /// with the same tag.
    pub fn put(&mut self, attribute: Attribute) {
        if attribute.tag == SPECIFIC_CHARACTER_SET {
            if let Some(code) = attribute.string() {
                self.specific_character_set = Some(code.trim().to_owned());
            }
        }
        self.entries.insert(attribute.tag, attribute);
    }

    /// Retrieve the attribute with the given tag, if present.
    pub fn get<T: Into<Tag>>(&self, tag: T) -> Option<&Attribute> {
        self.entries.get(&tag.into())
    }

    /// Remove and return the attribute with the given tag.
    pub fn remove<T: Into<Tag>>(&mut self, tag: T) -> Option<Attribute> {
        self.entries.remove(&tag.into())
    }

    /// Whether an attribute with the given tag is present.
    pub fn contains<T: Into<Tag>>(&self, tag: T) -> bool {
        self.entries.contains_key(&tag.into())
    }

    /// The number of attributes in this collection
    /// (not counting nested item contents).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the collection holds no attributes.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over the attributes in ascending tag order.
    pub fn iter(&self) -> btree_map::Values<'_, Tag, Attribute> {
        self.entries.values()
    }

    /// The specific character set code in effect for this collection.
    pub fn specific_character_set(&self) -> Option<&str> {
        self.specific_character_set.as_deref()
    }

    /// Define the specific character set code for this collection
    /// without inserting an attribute. Used for inheritance into
    /// sequence items.
    pub fn set_specific_character_set<S: Into<String>>(&mut self, code: S) {
        self.specific_character_set = Some(code.into());
    }

    /// Create an empty item collection inheriting this collection's
    /// specific character set.
    pub fn new_item(&self) -> AttributeCollection {
        AttributeCollection {
            entries: BTreeMap::new(),
            specific_character_set: self.specific_character_set.clone(),
        }
    }
}

impl<'a> IntoIterator for &'a AttributeCollection {
    type Item = &'a Attribute;
    type IntoIter = btree_map::Values<'a, Tag, Attribute>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.values()
    }
}

impl IntoIterator for AttributeCollection {
    type Item = Attribute;
    type IntoIter = btree_map::IntoValues<Tag, Attribute>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_values()
    }
}

impl FromIterator<Attribute> for AttributeCollection {
    fn from_iter<I: IntoIterator<Item = Attribute>>(iter: I) -> Self {
        let mut collection = AttributeCollection::new();
        for attribute in iter {
            collection.put(attribute);
        }
        collection
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_is_tag_ordered() {
        let mut collection = AttributeCollection::new();
        collection.put(Attribute::new(Tag(0x0010, 0x0010), VR::PN, "DOE^JOHN"));
        collection.put(Attribute::new(Tag(0x0008, 0x0060), VR::CS, "MR"));
        collection.put(Attribute::new(Tag(0x0010, 0x0020), VR::LO, "12345"));

        let tags: Vec<_> = collection.iter().map(|a| a.tag).collect();
        assert_eq!(
            tags,
            vec![
                Tag(0x0008, 0x0060),
                Tag(0x0010, 0x0010),
                Tag(0x0010, 0x0020),
            ],
        );
    }

    #[test]
    fn put_replaces_same_tag() {
        let mut collection = AttributeCollection::new();
        collection.put(Attribute::new(Tag(0x0010, 0x0020), VR::LO, "A"));
        collection.put(Attribute::new(Tag(0x0010, 0x0020), VR::LO, "B"));
        assert_eq!(collection.len(), 1);
        assert_eq!(
            collection.get(Tag(0x0010, 0x0020)).unwrap().string(),
            Some("B"),
        );
    }

    #[test]
    fn character_set_propagation() {
        let mut collection = AttributeCollection::new();
        collection.put(Attribute::new(
            SPECIFIC_CHARACTER_SET,
            VR::CS,
            "ISO_IR 100",
        ));
        assert_eq!(collection.specific_character_set(), Some("ISO_IR 100"));

        let item = collection.new_item();
        assert_eq!(item.specific_character_set(), Some("ISO_IR 100"));
    }

    #[test]
    fn null_attribute() {
        let attribute = Attribute::empty(Tag(0x0008, 0x1032), VR::SQ);
        assert!(attribute.is_null());
        assert_eq!(attribute.items(), None);
    }
}
