//! Representation of primitive attribute values.
//!
//! Values are kept as close to their wire form as possible:
//! text is decoded into strings, word-sized binary data is read
//! into typed arrays according to the source byte order,
//! and no further interpretation (dates, numbers in strings) is applied.

use crate::header::Tag;
use smallvec::SmallVec;
use std::fmt;

/// Type alias for the in-memory storage of multi-valued data.
pub type C<T> = SmallVec<[T; 2]>;

/// An enum representing a primitive value from a DICOM element.
/// The result of decoding an element's data value.
///
/// Multiple elements are contained in a [`smallvec`] vector,
/// conveniently aliased to the type [`C`].
#[derive(Debug, PartialEq, Clone)]
pub enum PrimitiveValue {
    /// No data. Usually employed for zero-length values.
    Empty,

    /// A sequence of strings.
    /// Used for many textual VRs, which admit multiple values
    /// separated by backslashes.
    Strs(C<String>),

    /// A single string.
    /// Used for textual VRs which do not admit multiplicity
    /// (ST, LT, UT, UR).
    Str(String),

    /// A sequence of attribute tags (VR AT).
    Tags(C<Tag>),

    /// The value is a sequence of unsigned 8-bit integers (OB, UN).
    U8(C<u8>),

    /// The value is a sequence of signed 16-bit integers (SS).
    I16(C<i16>),

    /// A sequence of unsigned 16-bit integers (US, OW).
    U16(C<u16>),

    /// A sequence of signed 32-bit integers (SL).
    I32(C<i32>),

    /// A sequence of unsigned 32-bit integers (UL, OL).
    U32(C<u32>),

    /// A sequence of signed 64-bit integers (SV).
    I64(C<i64>),

    /// A sequence of unsigned 64-bit integers (UV, OV).
    U64(C<u64>),

    /// A sequence of 32-bit floating point numbers (FL, OF).
    F32(C<f32>),

    /// A sequence of 64-bit floating point numbers (FD, OD).
    F64(C<f64>),
}

impl PrimitiveValue {
    /// Obtain the number of individual values.
    pub fn multiplicity(&self) -> u32 {
        use PrimitiveValue::*;
        match self {
            Empty => 0,
            Str(_) => 1,
            Strs(c) => c.len() as u32,
            Tags(c) => c.len() as u32,
            U8(c) => c.len() as u32,
            I16(c) => c.len() as u32,
            U16(c) => c.len() as u32,
            I32(c) => c.len() as u32,
            U32(c) => c.len() as u32,
            I64(c) => c.len() as u32,
            U64(c) => c.len() as u32,
            F32(c) => c.len() as u32,
            F64(c) => c.len() as u32,
        }
    }

    /// Whether the value holds no data.
    pub fn is_empty(&self) -> bool {
        self.multiplicity() == 0
    }

    /// Retrieve the first string of this value, if textual.
    pub fn string(&self) -> Option<&str> {
        match self {
            PrimitiveValue::Str(s) => Some(s),
            PrimitiveValue::Strs(s) => s.first().map(String::as_str),
            _ => None,
        }
    }

    /// Join the textual components of this value with backslashes,
    /// as they appear on the wire.
    pub fn to_str(&self) -> String {
        match self {
            PrimitiveValue::Str(s) => s.clone(),
            PrimitiveValue::Strs(s) => s.join("\\"),
            _ => String::new(),
        }
    }

    /// Retrieve the first unsigned 16-bit integer, if applicable.
    pub fn u16(&self) -> Option<u16> {
        match self {
            PrimitiveValue::U16(c) => c.first().copied(),
            _ => None,
        }
    }

    /// Retrieve the first unsigned 32-bit integer, if applicable.
    /// US values are widened for convenience.
    pub fn u32(&self) -> Option<u32> {
        match self {
            PrimitiveValue::U32(c) => c.first().copied(),
            PrimitiveValue::U16(c) => c.first().map(|&v| u32::from(v)),
            _ => None,
        }
    }

    /// Obtain the raw bytes of this value, if stored as such.
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            PrimitiveValue::U8(c) => Some(c),
            _ => None,
        }
    }
}

impl fmt::Display for PrimitiveValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use PrimitiveValue::*;

        fn join<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
            let mut first = true;
            for item in items {
                if !first {
                    f.write_str("\\")?;
                }
                first = false;
                write!(f, "{}", item)?;
            }
            Ok(())
        }

        match self {
            Empty => Ok(()),
            Str(s) => f.write_str(s),
            Strs(c) => join(f, c),
            Tags(c) => join(f, c),
            U8(c) => join(f, c),
            I16(c) => join(f, c),
            U16(c) => join(f, c),
            I32(c) => join(f, c),
            U32(c) => join(f, c),
            I64(c) => join(f, c),
            U64(c) => join(f, c),
            F32(c) => join(f, c),
            F64(c) => join(f, c),
        }
    }
}

impl From<&str> for PrimitiveValue {
    fn from(value: &str) -> Self {
        PrimitiveValue::Str(value.to_owned())
    }
}

impl From<String> for PrimitiveValue {
    fn from(value: String) -> Self {
        PrimitiveValue::Str(value)
    }
}

impl From<u16> for PrimitiveValue {
    fn from(value: u16) -> Self {
        PrimitiveValue::U16(smallvec::smallvec![value])
    }
}

impl From<u32> for PrimitiveValue {
    fn from(value: u32) -> Self {
        PrimitiveValue::U32(smallvec::smallvec![value])
    }
}

impl From<Vec<u8>> for PrimitiveValue {
    fn from(value: Vec<u8>) -> Self {
        PrimitiveValue::U8(value.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn multiplicity() {
        assert_eq!(PrimitiveValue::Empty.multiplicity(), 0);
        assert_eq!(PrimitiveValue::from("DOE^JOHN").multiplicity(), 1);
        let v = PrimitiveValue::Strs(smallvec!["ORIGINAL".to_owned(), "PRIMARY".to_owned()]);
        assert_eq!(v.multiplicity(), 2);
        assert_eq!(v.to_str(), "ORIGINAL\\PRIMARY");
    }

    #[test]
    fn numeric_accessors() {
        let v = PrimitiveValue::U16(smallvec![0x8001]);
        assert_eq!(v.u16(), Some(0x8001));
        assert_eq!(v.u32(), Some(0x8001));
        assert_eq!(v.string(), None);

        let v = PrimitiveValue::U32(smallvec![194]);
        assert_eq!(v.u32(), Some(194));
        assert_eq!(v.u16(), None);
    }
}
