//! Tests for the data set reader and writer.

use crate::read::{self, DataSetReader, ReadOptions, ReadStatus};
use crate::write::encode_data_set;
use matches::assert_matches;
use smallvec::smallvec;
use vesalius_core::collection::SPECIFIC_CHARACTER_SET;
use vesalius_core::{
    Attribute, AttributeCollection, AttributeValue, Fragment, PrimitiveValue, Tag, VR,
};
use vesalius_encoding::transfer_syntax::{
    TransferSyntax, EXPLICIT_VR_BIG_ENDIAN, EXPLICIT_VR_LITTLE_ENDIAN, IMPLICIT_VR_LITTLE_ENDIAN,
};

fn parse(data: &[u8], syntax: &'static TransferSyntax) -> AttributeCollection {
    read::parse_data_set(data, syntax).expect("parsing should succeed")
}

/// Feed the same bytes one at a time and compare against the
/// one-shot outcome.
fn parse_byte_by_byte(data: &[u8], syntax: &'static TransferSyntax) -> AttributeCollection {
    let mut reader = DataSetReader::new(syntax);
    let mut dataset = AttributeCollection::new();
    for byte in data {
        reader.supply(std::slice::from_ref(byte));
        match reader.read(&mut dataset, None).expect("no parse error") {
            ReadStatus::Complete | ReadStatus::NeedMoreData(_) => {}
        }
    }
    assert_eq!(
        reader.read(&mut dataset, None).expect("no parse error"),
        ReadStatus::Complete,
    );
    dataset
}

#[test]
fn read_patient_name_explicit_le() {
    #[rustfmt::skip]
    static DATA: &[u8] = &[
        0x10, 0x00, 0x10, 0x00, // (0010,0010) PatientName
        b'P', b'N', // VR
        0x08, 0x00, // length: 8
        b'D', b'O', b'E', b'^', b'J', b'O', b'H', b'N',
    ];

    let dataset = parse(DATA, &EXPLICIT_VR_LITTLE_ENDIAN);
    let attribute = dataset.get(Tag(0x0010, 0x0010)).expect("attribute present");
    assert_eq!(attribute.vr, VR::PN);
    assert_eq!(attribute.string(), Some("DOE^JOHN"));

    // re-encoding must reproduce the original 16 bytes
    let encoded = encode_data_set(&dataset, &EXPLICIT_VR_LITTLE_ENDIAN).unwrap();
    assert_eq!(encoded, DATA);
}

#[test]
fn round_trip_all_native_syntaxes() {
    let mut dataset = AttributeCollection::new();
    dataset.put(Attribute::new(Tag(0x0008, 0x0060), VR::CS, "MR"));
    dataset.put(Attribute::new(
        Tag(0x0008, 0x0008),
        VR::CS,
        PrimitiveValue::Strs(smallvec!["ORIGINAL".to_owned(), "PRIMARY".to_owned()]),
    ));
    dataset.put(Attribute::new(Tag(0x0010, 0x0010), VR::PN, "DOE^JANE"));
    dataset.put(Attribute::new(
        Tag(0x0028, 0x0010),
        VR::US,
        PrimitiveValue::U16(smallvec![512]),
    ));
    dataset.put(Attribute::new(
        Tag(0x0020, 0x000D),
        VR::UI,
        "1.2.840.10008.1.1\0",
    ));
    let mut item = AttributeCollection::new();
    item.put(Attribute::new(Tag(0x0008, 0x0100), VR::SH, "T-D1213 "));
    dataset.put(Attribute::sequence(Tag(0x0008, 0x1032), vec![item]));

    for syntax in [
        &IMPLICIT_VR_LITTLE_ENDIAN,
        &EXPLICIT_VR_LITTLE_ENDIAN,
        &EXPLICIT_VR_BIG_ENDIAN,
    ] {
        let encoded = encode_data_set(&dataset, syntax).unwrap();
        let decoded = parse(&encoded, syntax);
        assert_eq!(decoded, dataset, "round trip under {}", syntax.name);
    }
}

#[test]
fn resumability_chunked_input_is_equivalent() {
    let mut dataset = AttributeCollection::new();
    dataset.put(Attribute::new(Tag(0x0008, 0x0060), VR::CS, "US"));
    dataset.put(Attribute::new(Tag(0x0010, 0x0010), VR::PN, "DOE^JOHN"));
    let mut item = AttributeCollection::new();
    item.put(Attribute::new(
        Tag(0x0018, 0x6012),
        VR::US,
        PrimitiveValue::U16(smallvec![1]),
    ));
    dataset.put(Attribute::sequence(Tag(0x0018, 0x6011), vec![item]));

    for syntax in [&IMPLICIT_VR_LITTLE_ENDIAN, &EXPLICIT_VR_LITTLE_ENDIAN] {
        let encoded = encode_data_set(&dataset, syntax).unwrap();
        let one_shot = parse(&encoded, syntax);
        let trickled = parse_byte_by_byte(&encoded, syntax);
        assert_eq!(one_shot, trickled);
        assert_eq!(trickled, dataset);
    }
}

#[test]
fn need_more_data_does_not_consume() {
    #[rustfmt::skip]
    static DATA: &[u8] = &[
        0x10, 0x00, 0x10, 0x00, // (0010,0010)
        b'P', b'N',
        0x08, 0x00,
        b'D', b'O', b'E', b'^', b'J', b'O', b'H', b'N',
    ];

    let mut reader = DataSetReader::new(&EXPLICIT_VR_LITTLE_ENDIAN);
    let mut dataset = AttributeCollection::new();

    // tag alone: the reader should ask for the VR bytes
    reader.supply(&DATA[..4]);
    assert_eq!(
        reader.read(&mut dataset, None).unwrap(),
        ReadStatus::NeedMoreData(2),
    );
    assert_eq!(reader.last_tag_read(), Some(Tag(0x0010, 0x0010)));

    // VR and length, but only part of the value
    reader.supply(&DATA[4..12]);
    assert_eq!(
        reader.read(&mut dataset, None).unwrap(),
        ReadStatus::NeedMoreData(4),
    );

    reader.supply(&DATA[12..]);
    assert_eq!(reader.read(&mut dataset, None).unwrap(), ReadStatus::Complete);
    assert_eq!(
        dataset.get(Tag(0x0010, 0x0010)).unwrap().string(),
        Some("DOE^JOHN"),
    );
}

#[test]
fn sequence_undefined_and_definite_lengths_parse_identically() {
    // (0018,6011) sequence with two items; the logical content is
    // expressed once with undefined lengths and once all-definite
    #[rustfmt::skip]
    static UNDEFINED: &[u8] = &[
        0x18, 0x00, 0x11, 0x60, b'S', b'Q', 0x00, 0x00,
        0xFF, 0xFF, 0xFF, 0xFF, // undefined sequence length
        0xFE, 0xFF, 0x00, 0xE0, 0xFF, 0xFF, 0xFF, 0xFF, // item, undefined
        0x18, 0x00, 0x12, 0x60, b'U', b'S', 0x02, 0x00, 0x01, 0x00,
        0xFE, 0xFF, 0x0D, 0xE0, 0x00, 0x00, 0x00, 0x00, // item delimiter
        0xFE, 0xFF, 0x00, 0xE0, 0x0A, 0x00, 0x00, 0x00, // item, length 10
        0x18, 0x00, 0x12, 0x60, b'U', b'S', 0x02, 0x00, 0x04, 0x00,
        0xFE, 0xFF, 0xDD, 0xE0, 0x00, 0x00, 0x00, 0x00, // sequence delimiter
    ];

    #[rustfmt::skip]
    static DEFINITE: &[u8] = &[
        0x18, 0x00, 0x11, 0x60, b'S', b'Q', 0x00, 0x00,
        0x24, 0x00, 0x00, 0x00, // sequence length: 36
        0xFE, 0xFF, 0x00, 0xE0, 0x0A, 0x00, 0x00, 0x00, // item, length 10
        0x18, 0x00, 0x12, 0x60, b'U', b'S', 0x02, 0x00, 0x01, 0x00,
        0xFE, 0xFF, 0x00, 0xE0, 0x0A, 0x00, 0x00, 0x00, // item, length 10
        0x18, 0x00, 0x12, 0x60, b'U', b'S', 0x02, 0x00, 0x04, 0x00,
    ];

    let from_undefined = parse(UNDEFINED, &EXPLICIT_VR_LITTLE_ENDIAN);
    let from_definite = parse(DEFINITE, &EXPLICIT_VR_LITTLE_ENDIAN);
    assert_eq!(from_undefined, from_definite);

    let sequence = from_definite.get(Tag(0x0018, 0x6011)).unwrap();
    let items = sequence.items().expect("a sequence attribute");
    assert_eq!(items.len(), 2);
    assert_eq!(
        items[0].get(Tag(0x0018, 0x6012)).unwrap().primitive(),
        Some(&PrimitiveValue::U16(smallvec![1])),
    );
    assert_eq!(
        items[1].get(Tag(0x0018, 0x6012)).unwrap().primitive(),
        Some(&PrimitiveValue::U16(smallvec![4])),
    );
}

#[test]
fn zero_length_sequence_becomes_null_attribute() {
    #[rustfmt::skip]
    static DATA: &[u8] = &[
        0x40, 0x00, 0x55, 0x05, b'S', b'Q', 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, // length 0
    ];

    let dataset = parse(DATA, &EXPLICIT_VR_LITTLE_ENDIAN);
    let attribute = dataset.get(Tag(0x0040, 0x0555)).unwrap();
    assert_eq!(attribute.vr, VR::SQ);
    assert!(attribute.is_null());
}

#[test]
fn empty_undefined_sequence_becomes_null_attribute() {
    #[rustfmt::skip]
    static DATA: &[u8] = &[
        0x40, 0x00, 0x55, 0x05, b'S', b'Q', 0x00, 0x00,
        0xFF, 0xFF, 0xFF, 0xFF, // undefined length
        0xFE, 0xFF, 0xDD, 0xE0, 0x00, 0x00, 0x00, 0x00, // sequence delimiter
    ];

    let dataset = parse(DATA, &EXPLICIT_VR_LITTLE_ENDIAN);
    assert!(dataset.get(Tag(0x0040, 0x0555)).unwrap().is_null());
}

#[test]
fn group_lengths_are_dropped_unless_requested() {
    #[rustfmt::skip]
    static DATA: &[u8] = &[
        0x08, 0x00, 0x00, 0x00, b'U', b'L', 0x04, 0x00, // (0008,0000)
        0x0A, 0x00, 0x00, 0x00,
        0x08, 0x00, 0x60, 0x00, b'C', b'S', 0x02, 0x00, // (0008,0060)
        b'C', b'T',
    ];

    let dataset = parse(DATA, &EXPLICIT_VR_LITTLE_ENDIAN);
    assert!(!dataset.contains(Tag(0x0008, 0x0000)));
    assert_eq!(dataset.get(Tag(0x0008, 0x0060)).unwrap().string(), Some("CT"));

    let kept = read::parse_data_set_with_options(
        DATA,
        &EXPLICIT_VR_LITTLE_ENDIAN,
        ReadOptions::default().keep_group_lengths(),
    )
    .unwrap();
    assert_eq!(
        kept.get(Tag(0x0008, 0x0000)).unwrap().primitive(),
        Some(&PrimitiveValue::U32(smallvec![10])),
    );
}

#[test]
fn specific_character_set_governs_following_text() {
    // ISO_IR 100 with a Latin-1 encoded patient name
    #[rustfmt::skip]
    static DATA: &[u8] = &[
        0x08, 0x00, 0x05, 0x00, b'C', b'S', 0x0A, 0x00, // (0008,0005)
        b'I', b'S', b'O', b'_', b'I', b'R', b' ', b'1', b'0', b'0',
        0x10, 0x00, 0x10, 0x00, b'P', b'N', 0x0C, 0x00, // (0010,0010)
        b'S', b'i', b'm', 0xF5, b'e', b's', b'^', b'J', b'o', 0xE3, b'o', b' ',
    ];

    let dataset = parse(DATA, &EXPLICIT_VR_LITTLE_ENDIAN);
    assert_eq!(dataset.specific_character_set(), Some("ISO_IR 100"));
    assert_eq!(
        dataset.get(Tag(0x0010, 0x0010)).unwrap().string(),
        Some("Simões^João "),
    );
}

#[test]
fn character_set_is_inherited_by_items() {
    let mut dataset = AttributeCollection::new();
    dataset.put(Attribute::new(SPECIFIC_CHARACTER_SET, VR::CS, "ISO_IR 100"));
    let mut item = dataset.new_item();
    item.put(Attribute::new(Tag(0x0008, 0x0104), VR::LO, "região"));
    dataset.put(Attribute::sequence(Tag(0x0008, 0x1032), vec![item]));

    let encoded = encode_data_set(&dataset, &EXPLICIT_VR_LITTLE_ENDIAN).unwrap();
    let decoded = parse(&encoded, &EXPLICIT_VR_LITTLE_ENDIAN);
    let items = decoded.get(Tag(0x0008, 0x1032)).unwrap().items().unwrap();
    assert_eq!(
        items[0].get(Tag(0x0008, 0x0104)).unwrap().string(),
        Some("região"),
    );
    assert_eq!(decoded, dataset);
}

#[test]
fn read_encapsulated_pixel_data_fragments() {
    #[rustfmt::skip]
    static DATA: &[u8] = &[
        0xE0, 0x7F, 0x10, 0x00, // (7FE0,0010) PixelData
        b'O', b'B', 0x00, 0x00,
        0xFF, 0xFF, 0xFF, 0xFF, // undefined length
        // basic offset table with one entry
        0xFE, 0xFF, 0x00, 0xE0, 0x04, 0x00, 0x00, 0x00,
        0x10, 0x00, 0x00, 0x00,
        // first fragment, 32 bytes
        0xFE, 0xFF, 0x00, 0xE0, 0x20, 0x00, 0x00, 0x00,
        0x99, 0x99, 0x99, 0x99, 0x99, 0x99, 0x99, 0x99,
        0x99, 0x99, 0x99, 0x99, 0x99, 0x99, 0x99, 0x99,
        0x99, 0x99, 0x99, 0x99, 0x99, 0x99, 0x99, 0x99,
        0x99, 0x99, 0x99, 0x99, 0x99, 0x99, 0x99, 0x99,
        // end of pixel data
        0xFE, 0xFF, 0xDD, 0xE0, 0x00, 0x00, 0x00, 0x00,
    ];

    let dataset = parse(DATA, &EXPLICIT_VR_LITTLE_ENDIAN);
    let attribute = dataset.get(Tag(0x7FE0, 0x0010)).unwrap();
    match &attribute.value {
        AttributeValue::Fragments(sequence) => {
            assert_eq!(sequence.offset_table, vec![16]);
            assert_eq!(sequence.fragments.len(), 1);
            assert_eq!(
                sequence.fragments[0],
                Fragment::Loaded(vec![0x99; 32]),
            );
        }
        other => panic!("expected fragments, got {:?}", other),
    }

    // fragment sequences keep their wire form through re-encoding
    let encoded = encode_data_set(&dataset, &EXPLICIT_VR_LITTLE_ENDIAN).unwrap();
    assert_eq!(encoded, DATA);
}

#[test]
fn deferred_pixel_data_fragments_keep_file_references() {
    #[rustfmt::skip]
    static DATA: &[u8] = &[
        0xE0, 0x7F, 0x10, 0x00,
        b'O', b'B', 0x00, 0x00,
        0xFF, 0xFF, 0xFF, 0xFF,
        0xFE, 0xFF, 0x00, 0xE0, 0x00, 0x00, 0x00, 0x00, // empty offset table
        0xFE, 0xFF, 0x00, 0xE0, 0x08, 0x00, 0x00, 0x00, // fragment, 8 bytes
        1, 2, 3, 4, 5, 6, 7, 8,
        0xFE, 0xFF, 0xDD, 0xE0, 0x00, 0x00, 0x00, 0x00,
    ];

    let mut reader = DataSetReader::with_options(
        &EXPLICIT_VR_LITTLE_ENDIAN,
        ReadOptions::file().store_pixel_data_references(),
    )
    .source_path("/tmp/image.dcm");
    reader.supply(DATA);
    let mut dataset = AttributeCollection::new();
    assert_eq!(reader.read(&mut dataset, None).unwrap(), ReadStatus::Complete);

    let attribute = dataset.get(Tag(0x7FE0, 0x0010)).unwrap();
    match &attribute.value {
        AttributeValue::Fragments(sequence) => {
            assert_eq!(sequence.fragments.len(), 1);
            match &sequence.fragments[0] {
                Fragment::Deferred(reference) => {
                    // the fragment value starts after the two item headers
                    assert_eq!(reference.offset, 28);
                    assert_eq!(reference.length, 8);
                    assert_eq!(reference.path.to_str(), Some("/tmp/image.dcm"));
                }
                other => panic!("expected a deferred fragment, got {:?}", other),
            }
        }
        other => panic!("expected fragments, got {:?}", other),
    }
}

#[test]
fn private_un_with_undefined_length_is_reclassified_by_peek() {
    // (0009,0010), dictionary unknown, undefined length:
    // under implicit VR the dictionary says UN, and the peek
    // resolves the element into a sequence
    #[rustfmt::skip]
    static DATA: &[u8] = &[
        0x09, 0x00, 0x10, 0x00, // (0009,0010) private
        0xFF, 0xFF, 0xFF, 0xFF, // undefined length
        0xFE, 0xFF, 0x00, 0xE0, 0xFF, 0xFF, 0xFF, 0xFF, // item, undefined
        0xFE, 0xFF, 0x0D, 0xE0, 0x00, 0x00, 0x00, 0x00, // item delimiter
        0xFE, 0xFF, 0xDD, 0xE0, 0x00, 0x00, 0x00, 0x00, // sequence delimiter
    ];

    let dataset = read::parse_data_set_with_options(
        DATA,
        &IMPLICIT_VR_LITTLE_ENDIAN,
        ReadOptions::file(),
    )
    .unwrap();
    let attribute = dataset.get(Tag(0x0009, 0x0010)).unwrap();
    assert_eq!(attribute.vr, VR::SQ);
    assert_eq!(attribute.items().map(|items| items.len()), Some(1));
}

#[test]
fn explicit_un_undefined_length_needs_seekable_source() {
    // the same element under explicit VR with wire VR UN:
    // without seeking support the element cannot be resolved
    #[rustfmt::skip]
    static DATA: &[u8] = &[
        0x09, 0x00, 0x00, 0x10, // (0009,1000) private, not a creator
        b'U', b'N', 0x00, 0x00,
        0xFF, 0xFF, 0xFF, 0xFF, // undefined length
        0xFE, 0xFF, 0x00, 0xE0, 0x00, 0x00, 0x00, 0x00, // item, empty
        0xFE, 0xFF, 0xDD, 0xE0, 0x00, 0x00, 0x00, 0x00, // sequence delimiter
    ];

    // seekable source: the peek turns the element into a sequence
    let dataset = read::parse_data_set_with_options(
        DATA,
        &EXPLICIT_VR_LITTLE_ENDIAN,
        ReadOptions::file(),
    )
    .unwrap();
    assert_eq!(dataset.get(Tag(0x0009, 0x1000)).unwrap().vr, VR::SQ);

    // network source: unresolvable, a terminal structural error
    let outcome = read::parse_data_set(DATA, &EXPLICIT_VR_LITTLE_ENDIAN);
    assert_matches!(outcome, Err(read::Error::UnresolvedUndefinedLength { .. }));
}

#[test]
fn private_creator_is_read_as_long_string() {
    #[rustfmt::skip]
    static DATA: &[u8] = &[
        0x09, 0x00, 0x10, 0x00, // (0009,0010) private creator
        0x08, 0x00, 0x00, 0x00, // length 8 (implicit VR)
        b'A', b'C', b'M', b'E', b' ', b'1', b'.', b'0',
    ];

    let dataset = parse(DATA, &IMPLICIT_VR_LITTLE_ENDIAN);
    let attribute = dataset.get(Tag(0x0009, 0x0010)).unwrap();
    assert_eq!(attribute.vr, VR::LO);
    assert_eq!(attribute.string(), Some("ACME 1.0"));
}

#[test]
fn wire_vr_wins_over_dictionary() {
    // (0028,0010) Rows is US in the dictionary, the wire says SS
    #[rustfmt::skip]
    static DATA: &[u8] = &[
        0x28, 0x00, 0x10, 0x00, b'S', b'S', 0x02, 0x00,
        0xFE, 0xFF, // -2 as i16
    ];

    let dataset = parse(DATA, &EXPLICIT_VR_LITTLE_ENDIAN);
    let attribute = dataset.get(Tag(0x0028, 0x0010)).unwrap();
    assert_eq!(attribute.vr, VR::SS);
    assert_eq!(attribute.primitive(), Some(&PrimitiveValue::I16(smallvec![-2])));
}

#[test]
fn file_meta_group_switches_transfer_syntax() {
    // file meta information in explicit VR LE announcing an
    // implicit VR LE data set
    #[rustfmt::skip]
    static META_AND_DATA: &[u8] = &[
        // (0002,0000) group length: 38 bytes follow
        0x02, 0x00, 0x00, 0x00, b'U', b'L', 0x04, 0x00,
        0x26, 0x00, 0x00, 0x00,
        // (0002,0010) TransferSyntaxUID = 1.2.840.10008.1.2 (18 bytes padded)
        0x02, 0x00, 0x10, 0x00, b'U', b'I', 0x12, 0x00,
        b'1', b'.', b'2', b'.', b'8', b'4', b'0', b'.', b'1', b'0',
        b'0', b'0', b'8', b'.', b'1', b'.', b'2', 0x00,
        // (0002,0013) ImplementationVersionName
        0x02, 0x00, 0x13, 0x00, b'S', b'H', 0x04, 0x00,
        b'V', b'S', b'0', b'1',
        // data set, implicit VR: (0008,0060) Modality = "MR"
        0x08, 0x00, 0x60, 0x00, 0x02, 0x00, 0x00, 0x00,
        b'M', b'R',
    ];

    let dataset = parse(META_AND_DATA, &EXPLICIT_VR_LITTLE_ENDIAN);
    assert_eq!(
        dataset.get(Tag(0x0002, 0x0010)).unwrap().string(),
        Some("1.2.840.10008.1.2\0"),
    );
    assert_eq!(dataset.get(Tag(0x0008, 0x0060)).unwrap().string(), Some("MR"));
}

#[test]
fn stop_tag_halts_at_root_level() {
    #[rustfmt::skip]
    static DATA: &[u8] = &[
        0x08, 0x00, 0x60, 0x00, b'C', b'S', 0x02, 0x00, b'C', b'R',
        0x10, 0x00, 0x10, 0x00, b'P', b'N', 0x08, 0x00,
        b'D', b'O', b'E', b'^', b'J', b'O', b'H', b'N',
    ];

    let mut reader = DataSetReader::new(&EXPLICIT_VR_LITTLE_ENDIAN);
    reader.supply(DATA);
    let mut dataset = AttributeCollection::new();

    // stop before the patient module
    assert_eq!(
        reader.read(&mut dataset, Some(Tag(0x0010, 0x0000))).unwrap(),
        ReadStatus::Complete,
    );
    assert_eq!(dataset.len(), 1);
    assert!(dataset.contains(Tag(0x0008, 0x0060)));

    // resuming with a higher stop tag picks up the retained tag
    assert_eq!(
        reader.read(&mut dataset, None).unwrap(),
        ReadStatus::Complete,
    );
    assert_eq!(dataset.get(Tag(0x0010, 0x0010)).unwrap().string(), Some("DOE^JOHN"));
}

#[test]
fn truncated_data_set_is_a_terminal_error() {
    #[rustfmt::skip]
    static DATA: &[u8] = &[
        0x10, 0x00, 0x10, 0x00, b'P', b'N', 0x08, 0x00,
        b'D', b'O', b'E', // 5 bytes missing
    ];

    let outcome = read::parse_data_set(DATA, &EXPLICIT_VR_LITTLE_ENDIAN);
    assert_matches!(outcome, Err(read::Error::Truncated { needed: 5, .. }));
}

#[test]
fn unexpected_tag_in_fragment_mode_is_a_structural_error() {
    #[rustfmt::skip]
    static DATA: &[u8] = &[
        0xE0, 0x7F, 0x10, 0x00, b'O', b'B', 0x00, 0x00,
        0xFF, 0xFF, 0xFF, 0xFF,
        // a regular element where an item was expected
        0x08, 0x00, 0x60, 0x00, 0x02, 0x00, 0x00, 0x00, b'M', b'R',
    ];

    let outcome = read::parse_data_set(DATA, &EXPLICIT_VR_LITTLE_ENDIAN);
    assert_matches!(
        outcome,
        Err(read::Error::UnexpectedFragmentTag { tag: Tag(0x0008, 0x0060), .. })
    );
}

#[test]
fn nested_sequences_round_trip() {
    let mut inner_item = AttributeCollection::new();
    inner_item.put(Attribute::new(
        Tag(0x0008, 0x1150),
        VR::UI,
        "1.2.840.10008.5.1.4.1.1.7\0",
    ));
    let mut outer_item = AttributeCollection::new();
    outer_item.put(Attribute::sequence(Tag(0x0008, 0x1140), vec![inner_item]));
    let mut dataset = AttributeCollection::new();
    dataset.put(Attribute::sequence(Tag(0x0008, 0x1115), vec![outer_item]));
    dataset.put(Attribute::new(Tag(0x2050, 0x0020), VR::CS, "IDENTITY"));

    for syntax in [&IMPLICIT_VR_LITTLE_ENDIAN, &EXPLICIT_VR_LITTLE_ENDIAN] {
        let encoded = encode_data_set(&dataset, syntax).unwrap();
        assert_eq!(parse(&encoded, syntax), dataset);
        assert_eq!(parse_byte_by_byte(&encoded, syntax), dataset);
    }
}
