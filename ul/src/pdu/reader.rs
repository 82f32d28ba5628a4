//! PDU reader module
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, ReadBytesExt};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use std::io::{Cursor, ErrorKind, Read};
use tracing::warn;
use vesalius_encoding::text::{DecodeTextError, DefaultCharacterSetCodec, TextCodec};

/// An error reading a PDU from a data source.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Invalid max PDU length {}", max_pdu_length))]
    InvalidMaxPdu {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("No PDU available"))]
    NoPduAvailable { backtrace: Backtrace },

    #[snafu(display("Could not read PDU"))]
    ReadPdu {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read PDU item"))]
    ReadPduItem {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read PDU field `{}`", field))]
    ReadPduField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid item length {} (must be >= 2)", length))]
    InvalidItemLength { length: u32 },

    #[snafu(display(
        "Incoming PDU was too large: length {}, maximum is {}",
        pdu_length,
        max_pdu_length
    ))]
    PduTooLarge {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("PDU contained an invalid value {:?}", var_item))]
    InvalidPduVariable {
        var_item: PduVariableItem,
        backtrace: Backtrace,
    },
    #[snafu(display("Multiple transfer syntaxes were accepted"))]
    MultipleTransferSyntaxesAccepted { backtrace: Backtrace },
    #[snafu(display("Invalid reject source or reason"))]
    InvalidRejectSourceOrReason { backtrace: Backtrace },
    #[snafu(display("Invalid abort source or reason"))]
    InvalidAbortSourceOrReason { backtrace: Backtrace },
    #[snafu(display("Invalid presentation context result reason"))]
    InvalidPresentationContextResultReason { backtrace: Backtrace },
    #[snafu(display("Invalid transfer syntax sub-item"))]
    InvalidTransferSyntaxSubItem { backtrace: Backtrace },
    #[snafu(display("Unknown presentation context sub-item"))]
    UnknownPresentationContextSubItem { backtrace: Backtrace },
    #[snafu(display("Could not decode text field `{}`", field))]
    DecodeText {
        field: &'static str,
        source: DecodeTextError,
        backtrace: Backtrace,
    },
    #[snafu(display("Missing application context name"))]
    MissingApplicationContextName { backtrace: Backtrace },
    #[snafu(display("Missing abstract syntax"))]
    MissingAbstractSyntax { backtrace: Backtrace },
    #[snafu(display("Missing transfer syntax"))]
    MissingTransferSyntax { backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Read a PDU from the given source.
///
/// When `strict` is set, a PDU longer than `max_pdu_length` is an
/// error; otherwise such PDUs are admitted up to the standard maximum
/// with a warning.
pub fn read_pdu<R>(reader: &mut R, max_pdu_length: u32, strict: bool) -> Result<Pdu>
where
    R: Read,
{
    ensure!(
        (MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&max_pdu_length),
        InvalidMaxPduSnafu { max_pdu_length }
    );

    // If 2 bytes cannot be read here, no PDU has even begun to arrive.
    // This case is distinguished from an unexpected end of stream
    // in the middle of a PDU, which is a true error.
    let mut bytes = [0; 2];
    if let Err(e) = reader.read_exact(&mut bytes) {
        ensure!(e.kind() != ErrorKind::UnexpectedEof, NoPduAvailableSnafu);
        return Err(e).context(ReadPduFieldSnafu { field: "type" });
    }

    let pdu_type = bytes[0];
    let pdu_length = reader
        .read_u32::<BigEndian>()
        .context(ReadPduFieldSnafu { field: "length" })?;

    if strict {
        ensure!(
            pdu_length <= max_pdu_length,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length
            }
        );
    } else if pdu_length > max_pdu_length {
        ensure!(
            pdu_length <= MAXIMUM_PDU_SIZE,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length: MAXIMUM_PDU_SIZE
            }
        );
        warn!(
            "incoming PDU is larger than the negotiated maximum ({} > {})",
            pdu_length, max_pdu_length
        );
    }

    let bytes = read_n(reader, pdu_length as usize).context(ReadPduSnafu)?;
    let mut cursor = Cursor::new(bytes);
    let codec = DefaultCharacterSetCodec;

    match pdu_type {
        0x01 | 0x02 => {
            // A-ASSOCIATE-RQ / A-ASSOCIATE-AC
            let protocol_version = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Protocol-version",
            })?;
            // 2 reserved bytes
            cursor
                .read_u16::<BigEndian>()
                .context(ReadPduFieldSnafu { field: "Reserved" })?;

            let called_ae_title = read_ae_title(&mut cursor, &codec, "Called-AE-title")?;
            let calling_ae_title = read_ae_title(&mut cursor, &codec, "Calling-AE-title")?;

            // 32 reserved bytes
            let mut reserved = [0u8; 32];
            cursor
                .read_exact(&mut reserved)
                .context(ReadPduFieldSnafu { field: "Reserved" })?;

            let mut application_context_name: Option<String> = None;
            let mut presentation_contexts_proposed = vec![];
            let mut presentation_contexts_results = vec![];
            let mut user_variables = vec![];

            while cursor.position() < cursor.get_ref().len() as u64 {
                match read_pdu_variable(&mut cursor, &codec)? {
                    PduVariableItem::ApplicationContext(val) => {
                        application_context_name = Some(val);
                    }
                    PduVariableItem::PresentationContextProposed(val) => {
                        presentation_contexts_proposed.push(val);
                    }
                    PduVariableItem::PresentationContextResult(val) => {
                        presentation_contexts_results.push(val);
                    }
                    PduVariableItem::UserVariables(val) => {
                        user_variables = val;
                    }
                    var_item => {
                        return InvalidPduVariableSnafu { var_item }.fail();
                    }
                }
            }

            let application_context_name =
                application_context_name.context(MissingApplicationContextNameSnafu)?;

            if pdu_type == 0x01 {
                ensure!(
                    presentation_contexts_results.is_empty(),
                    InvalidPduVariableSnafu {
                        var_item: PduVariableItem::PresentationContextResult(
                            presentation_contexts_results.swap_remove(0)
                        )
                    }
                );
                Ok(Pdu::AssociationRQ(AssociationRQ {
                    protocol_version,
                    calling_ae_title,
                    called_ae_title,
                    application_context_name,
                    presentation_contexts: presentation_contexts_proposed,
                    user_variables,
                }))
            } else {
                ensure!(
                    presentation_contexts_proposed.is_empty(),
                    InvalidPduVariableSnafu {
                        var_item: PduVariableItem::PresentationContextProposed(
                            presentation_contexts_proposed.swap_remove(0)
                        )
                    }
                );
                Ok(Pdu::AssociationAC(AssociationAC {
                    protocol_version,
                    calling_ae_title,
                    called_ae_title,
                    application_context_name,
                    presentation_contexts: presentation_contexts_results,
                    user_variables,
                }))
            }
        }
        0x03 => {
            // A-ASSOCIATE-RJ: 1 reserved byte, result, source, reason
            cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "Reserved" })?;
            let result = AssociationRJResult::from(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Result" })?,
            )
            .context(InvalidRejectSourceOrReasonSnafu)?;
            let source = AssociationRJSource::from(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Source" })?,
                cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Reason/Diag.",
                })?,
            )
            .context(InvalidRejectSourceOrReasonSnafu)?;

            Ok(Pdu::AssociationRJ(AssociationRJ { result, source }))
        }
        0x04 => {
            // P-DATA-TF: one or more presentation data value items
            let mut values = vec![];
            while cursor.position() < cursor.get_ref().len() as u64 {
                let item_length = cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;
                ensure!(
                    item_length >= 2,
                    InvalidItemLengthSnafu {
                        length: item_length
                    }
                );

                let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Presentation-context-ID",
                })?;

                // message control header: bit 0 for command vs data,
                // bit 1 for last fragment
                let header = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Message Control Header",
                })?;
                let value_type = if header & 0x01 > 0 {
                    PDataValueType::Command
                } else {
                    PDataValueType::Data
                };
                let is_last = (header & 0x02) > 0;

                let data =
                    read_n(&mut cursor, (item_length - 2) as usize).context(ReadPduFieldSnafu {
                        field: "Presentation-data-value",
                    })?;

                values.push(PDataValue {
                    presentation_context_id,
                    value_type,
                    is_last,
                    data,
                });
            }
            Ok(Pdu::PData { data: values })
        }
        0x05 => {
            // A-RELEASE-RQ: 4 reserved bytes
            cursor
                .read_u32::<BigEndian>()
                .context(ReadPduFieldSnafu { field: "Reserved" })?;
            Ok(Pdu::ReleaseRQ)
        }
        0x06 => {
            // A-RELEASE-RP: 4 reserved bytes
            cursor
                .read_u32::<BigEndian>()
                .context(ReadPduFieldSnafu { field: "Reserved" })?;
            Ok(Pdu::ReleaseRP)
        }
        0x07 => {
            // A-ABORT: 2 reserved bytes, source, reason
            let mut buf = [0u8; 2];
            cursor
                .read_exact(&mut buf)
                .context(ReadPduFieldSnafu { field: "Reserved" })?;
            let source = AbortRQSource::from(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Source" })?,
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Reason/Diag" })?,
            )
            .context(InvalidAbortSourceOrReasonSnafu)?;
            Ok(Pdu::AbortRQ { source })
        }
        _ => {
            let data = read_n(&mut cursor, pdu_length as usize)
                .context(ReadPduFieldSnafu { field: "Unknown" })?;
            Ok(Pdu::Unknown { pdu_type, data })
        }
    }
}

fn read_n<R>(reader: &mut R, bytes_to_read: usize) -> std::io::Result<Vec<u8>>
where
    R: Read,
{
    let mut result = Vec::with_capacity(bytes_to_read.min(MAXIMUM_PDU_SIZE as usize));
    reader.take(bytes_to_read as u64).read_to_end(&mut result)?;
    if result.len() < bytes_to_read {
        return Err(std::io::Error::new(
            ErrorKind::UnexpectedEof,
            "not enough bytes in PDU",
        ));
    }
    Ok(result)
}

fn read_ae_title<R>(
    reader: &mut R,
    codec: &DefaultCharacterSetCodec,
    field: &'static str,
) -> Result<String>
where
    R: Read,
{
    // 16 characters, space padded
    let mut ae_bytes = [0; 16];
    reader
        .read_exact(&mut ae_bytes)
        .context(ReadPduFieldSnafu { field })?;
    Ok(codec
        .decode(&ae_bytes)
        .context(DecodeTextSnafu { field })?
        .trim()
        .to_string())
}

fn decode_uid_field(
    bytes: Vec<u8>,
    codec: &DefaultCharacterSetCodec,
    field: &'static str,
) -> Result<String> {
    Ok(codec
        .decode(&bytes)
        .context(DecodeTextSnafu { field })?
        .trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_string())
}

fn read_pdu_variable<R>(reader: &mut R, codec: &DefaultCharacterSetCodec) -> Result<PduVariableItem>
where
    R: Read,
{
    let item_type = reader
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Item-type" })?;
    reader
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Reserved" })?;
    let item_length = reader.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Item-length",
    })?;

    let bytes = read_n(reader, item_length as usize).context(ReadPduItemSnafu)?;
    let mut cursor = Cursor::new(bytes);

    match item_type {
        0x10 => {
            // Application Context Item
            let val = decode_uid_field(
                cursor.into_inner(),
                codec,
                "Application-context-name",
            )?;
            Ok(PduVariableItem::ApplicationContext(val))
        }
        0x20 => {
            // Presentation Context Item (proposed)
            let mut abstract_syntax: Option<String> = None;
            let mut transfer_syntaxes = vec![];

            let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;
            // 3 reserved bytes
            let mut reserved = [0u8; 3];
            cursor
                .read_exact(&mut reserved)
                .context(ReadPduFieldSnafu { field: "Reserved" })?;

            while cursor.position() < cursor.get_ref().len() as u64 {
                let item_type = cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Item-type" })?;
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Reserved" })?;
                let item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;

                match item_type {
                    0x30 => {
                        // Abstract Syntax Sub-Item
                        let bytes = read_n(&mut cursor, item_length as usize).context(
                            ReadPduFieldSnafu {
                                field: "Abstract-syntax-name",
                            },
                        )?;
                        abstract_syntax =
                            Some(decode_uid_field(bytes, codec, "Abstract-syntax-name")?);
                    }
                    0x40 => {
                        // Transfer Syntax Sub-Item
                        let bytes = read_n(&mut cursor, item_length as usize).context(
                            ReadPduFieldSnafu {
                                field: "Transfer-syntax-name",
                            },
                        )?;
                        transfer_syntaxes.push(decode_uid_field(
                            bytes,
                            codec,
                            "Transfer-syntax-name",
                        )?);
                    }
                    _ => {
                        return UnknownPresentationContextSubItemSnafu.fail();
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextProposed(
                PresentationContextProposed {
                    id: presentation_context_id,
                    abstract_syntax: abstract_syntax.context(MissingAbstractSyntaxSnafu)?,
                    transfer_syntaxes,
                },
            ))
        }
        0x21 => {
            // Presentation Context Item (result)
            let mut transfer_syntax: Option<String> = None;

            let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;
            cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "Reserved" })?;
            let reason = PresentationContextResultReason::from(cursor.read_u8().context(
                ReadPduFieldSnafu {
                    field: "Result/Reason",
                },
            )?)
            .context(InvalidPresentationContextResultReasonSnafu)?;
            cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "Reserved" })?;

            while cursor.position() < cursor.get_ref().len() as u64 {
                let item_type = cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Item-type" })?;
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Reserved" })?;
                let item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;

                match item_type {
                    0x40 => {
                        if transfer_syntax.is_some() {
                            // only one transfer syntax may be accepted
                            return MultipleTransferSyntaxesAcceptedSnafu.fail();
                        }
                        let bytes = read_n(&mut cursor, item_length as usize).context(
                            ReadPduFieldSnafu {
                                field: "Transfer-syntax-name",
                            },
                        )?;
                        transfer_syntax =
                            Some(decode_uid_field(bytes, codec, "Transfer-syntax-name")?);
                    }
                    _ => {
                        return InvalidTransferSyntaxSubItemSnafu.fail();
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextResult(
                PresentationContextResult {
                    id: presentation_context_id,
                    reason,
                    transfer_syntax: transfer_syntax.context(MissingTransferSyntaxSnafu)?,
                },
            ))
        }
        0x50 => {
            // User Information Item
            let mut user_variables = vec![];

            while cursor.position() < cursor.get_ref().len() as u64 {
                let item_type = cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Item-type" })?;
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Reserved" })?;
                let item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;

                match item_type {
                    0x51 => {
                        // Maximum Length Sub-Item
                        user_variables.push(UserVariableItem::MaxLength(
                            cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Maximum-length-received",
                            })?,
                        ));
                    }
                    0x52 => {
                        // Implementation Class UID Sub-Item
                        let bytes = read_n(&mut cursor, item_length as usize).context(
                            ReadPduFieldSnafu {
                                field: "Implementation-class-uid",
                            },
                        )?;
                        user_variables.push(UserVariableItem::ImplementationClassUID(
                            decode_uid_field(bytes, codec, "Implementation-class-uid")?,
                        ));
                    }
                    0x55 => {
                        // Implementation Version Name Sub-Item
                        let bytes = read_n(&mut cursor, item_length as usize).context(
                            ReadPduFieldSnafu {
                                field: "Implementation-version-name",
                            },
                        )?;
                        user_variables.push(UserVariableItem::ImplementationVersionName(
                            decode_uid_field(bytes, codec, "Implementation-version-name")?,
                        ));
                    }
                    _ => {
                        warn!("unknown user information sub-item type {:#04x}", item_type);
                        user_variables.push(UserVariableItem::Unknown(
                            item_type,
                            read_n(&mut cursor, item_length as usize)
                                .context(ReadPduFieldSnafu { field: "Unknown" })?,
                        ));
                    }
                }
            }

            Ok(PduVariableItem::UserVariables(user_variables))
        }
        _ => Ok(PduVariableItem::Unknown(item_type)),
    }
}
