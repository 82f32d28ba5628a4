//! Transfer syntax descriptors and the built-in registry.
//!
//! A transfer syntax governs how the data set parser reads
//! tags, value representations and lengths. Entries are immutable
//! and looked up by UID string. The registry covers the native
//! (uncompressed) syntaxes; encapsulated syntaxes with pixel data
//! codecs are out of scope for this tool kit.

use byteordered::Endianness;

/// A descriptor of a DICOM transfer syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSyntax {
    /// the unique identifier of the transfer syntax
    pub uid: &'static str,
    /// a human readable name for the transfer syntax
    pub name: &'static str,
    /// whether element headers carry an explicit value representation
    pub explicit_vr: bool,
    /// the byte order of the data set
    pub endianness: Endianness,
}

/// Implicit VR Little Endian: the default transfer syntax.
pub const IMPLICIT_VR_LITTLE_ENDIAN: TransferSyntax = TransferSyntax {
    uid: "1.2.840.10008.1.2",
    name: "Implicit VR Little Endian",
    explicit_vr: false,
    endianness: Endianness::Little,
};

/// Explicit VR Little Endian.
pub const EXPLICIT_VR_LITTLE_ENDIAN: TransferSyntax = TransferSyntax {
    uid: "1.2.840.10008.1.2.1",
    name: "Explicit VR Little Endian",
    explicit_vr: true,
    endianness: Endianness::Little,
};

/// Explicit VR Big Endian (retired, still found in the wild).
pub const EXPLICIT_VR_BIG_ENDIAN: TransferSyntax = TransferSyntax {
    uid: "1.2.840.10008.1.2.2",
    name: "Explicit VR Big Endian",
    explicit_vr: true,
    endianness: Endianness::Big,
};

static REGISTRY: &[&TransferSyntax] = &[
    &IMPLICIT_VR_LITTLE_ENDIAN,
    &EXPLICIT_VR_LITTLE_ENDIAN,
    &EXPLICIT_VR_BIG_ENDIAN,
];

/// Trim trailing characters which have no significance in a UID value:
/// whitespace and null padding.
pub fn trim_uid(uid: &str) -> &str {
    uid.trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
}

/// Look up a transfer syntax by its UID.
///
/// Trailing whitespace and null padding in the given UID
/// are not significant.
pub fn lookup(uid: &str) -> Option<&'static TransferSyntax> {
    let uid = trim_uid(uid);
    REGISTRY.iter().find(|ts| ts.uid == uid).copied()
}

/// Check whether the registry supports the given transfer syntax UID,
/// meaning that data sets under it can be parsed and encoded.
pub fn is_supported(uid: &str) -> bool {
    lookup(uid).is_some()
}

/// From a sequence of transfer syntax UIDs, choose the first
/// supported by the registry.
pub fn choose_supported<I, T>(it: I) -> Option<T>
where
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
{
    it.into_iter().find(|ts| is_supported(ts.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_uid() {
        assert_eq!(
            lookup("1.2.840.10008.1.2"),
            Some(&IMPLICIT_VR_LITTLE_ENDIAN),
        );
        assert_eq!(
            lookup("1.2.840.10008.1.2.1"),
            Some(&EXPLICIT_VR_LITTLE_ENDIAN),
        );
        assert_eq!(lookup("1.2.840.10008.1.2.4.50"), None);
    }

    #[test]
    fn lookup_trims_padding() {
        assert_eq!(
            lookup("1.2.840.10008.1.2.1\0"),
            Some(&EXPLICIT_VR_LITTLE_ENDIAN),
        );
        assert_eq!(
            lookup("1.2.840.10008.1.2.2 "),
            Some(&EXPLICIT_VR_BIG_ENDIAN),
        );
    }

    #[test]
    fn choose_first_supported() {
        assert_eq!(
            choose_supported(vec!["1.2.840.10008.1.2.4.50", "1.2.840.10008.1.2"]),
            Some("1.2.840.10008.1.2"),
        );
        assert_eq!(choose_supported(vec!["1.1.1.1"]), None);
    }
}
