//! PDU writer module
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, WriteBytesExt};
use snafu::{ensure, Backtrace, ResultExt, Snafu};
use std::io::Write;
use vesalius_encoding::text::{EncodeTextError, DefaultCharacterSetCodec, TextCodec};

/// An error writing a PDU to a data sink.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Could not write PDU field `{}`", field))]
    WriteField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not encode text field `{}`", field))]
    EncodeText {
        field: &'static str,
        source: EncodeTextError,
        backtrace: Backtrace,
    },

    #[snafu(display("AE title `{}` is too long ({} characters)", ae_title, len))]
    AeTitleTooLong {
        ae_title: String,
        len: usize,
        backtrace: Backtrace,
    },

    #[snafu(display("Presentation data value is too long ({} bytes)", length))]
    PdvTooLong { length: usize, backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Write a PDU to the given sink, per the standard byte layout:
/// a 1-byte type code, 1 reserved byte, a 4-byte big endian length,
/// and the type-specific fields.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: Write,
{
    match pdu {
        Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            let mut body = Vec::with_capacity(128);
            body.write_u16::<BigEndian>(*protocol_version)
                .context(WriteFieldSnafu {
                    field: "Protocol-version",
                })?;
            body.write_u16::<BigEndian>(0).context(WriteFieldSnafu {
                field: "Reserved",
            })?;
            write_ae_title(&mut body, called_ae_title)?;
            write_ae_title(&mut body, calling_ae_title)?;
            body.extend_from_slice(&[0u8; 32]);

            write_application_context(&mut body, application_context_name)?;
            for context in presentation_contexts {
                write_presentation_context_proposed(&mut body, context)?;
            }
            write_user_variables(&mut body, user_variables)?;

            write_pdu_header(writer, 0x01, body.len() as u32)?;
            writer.write_all(&body).context(WriteFieldSnafu {
                field: "A-ASSOCIATE-RQ",
            })
        }
        Pdu::AssociationAC(AssociationAC {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            let mut body = Vec::with_capacity(128);
            body.write_u16::<BigEndian>(*protocol_version)
                .context(WriteFieldSnafu {
                    field: "Protocol-version",
                })?;
            body.write_u16::<BigEndian>(0).context(WriteFieldSnafu {
                field: "Reserved",
            })?;
            // both AE title fields are reserved in the AC PDU,
            // echoed from the request
            write_ae_title(&mut body, called_ae_title)?;
            write_ae_title(&mut body, calling_ae_title)?;
            body.extend_from_slice(&[0u8; 32]);

            write_application_context(&mut body, application_context_name)?;
            for context in presentation_contexts {
                write_presentation_context_result(&mut body, context)?;
            }
            write_user_variables(&mut body, user_variables)?;

            write_pdu_header(writer, 0x02, body.len() as u32)?;
            writer.write_all(&body).context(WriteFieldSnafu {
                field: "A-ASSOCIATE-AC",
            })
        }
        Pdu::AssociationRJ(AssociationRJ { result, source }) => {
            write_pdu_header(writer, 0x03, 4)?;
            let (source_code, reason_code) = reject_codes(source);
            let bytes = [
                0,
                match result {
                    AssociationRJResult::Permanent => 1,
                    AssociationRJResult::Transient => 2,
                },
                source_code,
                reason_code,
            ];
            writer.write_all(&bytes).context(WriteFieldSnafu {
                field: "A-ASSOCIATE-RJ",
            })
        }
        Pdu::PData { data } => {
            let length: usize = data.iter().map(|pdv| pdv.data.len() + 6).sum();
            write_pdu_header(writer, 0x04, length as u32)?;
            for pdv in data {
                ensure!(
                    pdv.data.len() + 2 <= u32::MAX as usize,
                    PdvTooLongSnafu {
                        length: pdv.data.len()
                    }
                );
                writer
                    .write_u32::<BigEndian>(pdv.data.len() as u32 + 2)
                    .context(WriteFieldSnafu {
                        field: "Item-length",
                    })?;
                writer
                    .write_u8(pdv.presentation_context_id)
                    .context(WriteFieldSnafu {
                        field: "Presentation-context-ID",
                    })?;
                let mut header = 0u8;
                if pdv.value_type == PDataValueType::Command {
                    header |= 0x01;
                }
                if pdv.is_last {
                    header |= 0x02;
                }
                writer.write_u8(header).context(WriteFieldSnafu {
                    field: "Message Control Header",
                })?;
                writer.write_all(&pdv.data).context(WriteFieldSnafu {
                    field: "Presentation-data-value",
                })?;
            }
            Ok(())
        }
        Pdu::ReleaseRQ => {
            write_pdu_header(writer, 0x05, 4)?;
            writer.write_all(&[0u8; 4]).context(WriteFieldSnafu {
                field: "A-RELEASE-RQ",
            })
        }
        Pdu::ReleaseRP => {
            write_pdu_header(writer, 0x06, 4)?;
            writer.write_all(&[0u8; 4]).context(WriteFieldSnafu {
                field: "A-RELEASE-RP",
            })
        }
        Pdu::AbortRQ { source } => {
            write_pdu_header(writer, 0x07, 4)?;
            let (source_code, reason_code) = abort_codes(source);
            writer
                .write_all(&[0, 0, source_code, reason_code])
                .context(WriteFieldSnafu { field: "A-ABORT" })
        }
        Pdu::Unknown { pdu_type, data } => {
            write_pdu_header(writer, *pdu_type, data.len() as u32)?;
            writer
                .write_all(data)
                .context(WriteFieldSnafu { field: "Unknown" })
        }
    }
}

fn write_pdu_header<W>(writer: &mut W, pdu_type: u8, length: u32) -> Result<()>
where
    W: Write,
{
    writer
        .write_u8(pdu_type)
        .context(WriteFieldSnafu { field: "type" })?;
    writer
        .write_u8(0)
        .context(WriteFieldSnafu { field: "Reserved" })?;
    writer
        .write_u32::<BigEndian>(length)
        .context(WriteFieldSnafu { field: "length" })
}

fn write_ae_title<W>(writer: &mut W, ae_title: &str) -> Result<()>
where
    W: Write,
{
    let bytes = DefaultCharacterSetCodec
        .encode(ae_title)
        .context(EncodeTextSnafu { field: "AE-title" })?;
    ensure!(
        bytes.len() <= 16,
        AeTitleTooLongSnafu {
            ae_title,
            len: bytes.len()
        }
    );
    let mut padded = [b' '; 16];
    padded[..bytes.len()].copy_from_slice(&bytes);
    writer
        .write_all(&padded)
        .context(WriteFieldSnafu { field: "AE-title" })
}

fn write_item_header<W>(writer: &mut W, item_type: u8, length: u16) -> Result<()>
where
    W: Write,
{
    writer
        .write_u8(item_type)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0)
        .context(WriteFieldSnafu { field: "Reserved" })?;
    writer
        .write_u16::<BigEndian>(length)
        .context(WriteFieldSnafu {
            field: "Item-length",
        })
}

fn write_uid_item<W>(writer: &mut W, item_type: u8, uid: &str, field: &'static str) -> Result<()>
where
    W: Write,
{
    let bytes = DefaultCharacterSetCodec
        .encode(uid)
        .context(EncodeTextSnafu { field })?;
    write_item_header(writer, item_type, bytes.len() as u16)?;
    writer.write_all(&bytes).context(WriteFieldSnafu { field })
}

fn write_application_context<W>(writer: &mut W, name: &str) -> Result<()>
where
    W: Write,
{
    write_uid_item(writer, 0x10, name, "Application-context-name")
}

fn write_presentation_context_proposed<W>(
    writer: &mut W,
    context: &PresentationContextProposed,
) -> Result<()>
where
    W: Write,
{
    let mut body = Vec::with_capacity(64);
    body.extend_from_slice(&[context.id, 0, 0, 0]);
    write_uid_item(&mut body, 0x30, &context.abstract_syntax, "Abstract-syntax-name")?;
    for transfer_syntax in &context.transfer_syntaxes {
        write_uid_item(&mut body, 0x40, transfer_syntax, "Transfer-syntax-name")?;
    }

    write_item_header(writer, 0x20, body.len() as u16)?;
    writer.write_all(&body).context(WriteFieldSnafu {
        field: "Presentation-context",
    })
}

fn write_presentation_context_result<W>(
    writer: &mut W,
    context: &PresentationContextResult,
) -> Result<()>
where
    W: Write,
{
    let mut body = Vec::with_capacity(32);
    body.extend_from_slice(&[
        context.id,
        0,
        context.reason.clone() as u8,
        0,
    ]);
    write_uid_item(&mut body, 0x40, &context.transfer_syntax, "Transfer-syntax-name")?;

    write_item_header(writer, 0x21, body.len() as u16)?;
    writer.write_all(&body).context(WriteFieldSnafu {
        field: "Presentation-context",
    })
}

fn write_user_variables<W>(writer: &mut W, user_variables: &[UserVariableItem]) -> Result<()>
where
    W: Write,
{
    let mut body = Vec::with_capacity(64);
    for variable in user_variables {
        match variable {
            UserVariableItem::MaxLength(max_length) => {
                write_item_header(&mut body, 0x51, 4)?;
                body.write_u32::<BigEndian>(*max_length)
                    .context(WriteFieldSnafu {
                        field: "Maximum-length-received",
                    })?;
            }
            UserVariableItem::ImplementationClassUID(uid) => {
                write_uid_item(&mut body, 0x52, uid, "Implementation-class-uid")?;
            }
            UserVariableItem::ImplementationVersionName(name) => {
                write_uid_item(&mut body, 0x55, name, "Implementation-version-name")?;
            }
            UserVariableItem::Unknown(item_type, data) => {
                write_item_header(&mut body, *item_type, data.len() as u16)?;
                body.extend_from_slice(data);
            }
        }
    }

    write_item_header(writer, 0x50, body.len() as u16)?;
    writer.write_all(&body).context(WriteFieldSnafu {
        field: "User-information",
    })
}

fn reject_codes(source: &AssociationRJSource) -> (u8, u8) {
    match source {
        AssociationRJSource::ServiceUser(reason) => (
            1,
            match reason {
                AssociationRJServiceUserReason::NoReasonGiven => 1,
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported => 2,
                AssociationRJServiceUserReason::CallingAETitleNotRecognized => 3,
                AssociationRJServiceUserReason::CalledAETitleNotRecognized => 7,
                AssociationRJServiceUserReason::Reserved(code) => *code,
            },
        ),
        AssociationRJSource::ServiceProviderAsce(reason) => (
            2,
            match reason {
                AssociationRJServiceProviderAsceReason::NoReasonGiven => 1,
                AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported => 2,
            },
        ),
        AssociationRJSource::ServiceProviderPresentation(reason) => (
            3,
            match reason {
                AssociationRJServiceProviderPresentationReason::TemporaryCongestion => 1,
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => 2,
                AssociationRJServiceProviderPresentationReason::Reserved(code) => *code,
            },
        ),
    }
}

fn abort_codes(source: &AbortRQSource) -> (u8, u8) {
    match source {
        AbortRQSource::ServiceUser => (0, 0),
        AbortRQSource::Reserved => (1, 0),
        AbortRQSource::ServiceProvider(reason) => (
            2,
            match reason {
                AbortRQServiceProviderReason::ReasonNotSpecified => 0,
                AbortRQServiceProviderReason::UnrecognizedPdu => 1,
                AbortRQServiceProviderReason::UnexpectedPdu => 2,
                AbortRQServiceProviderReason::Reserved => 3,
                AbortRQServiceProviderReason::UnrecognizedPduParameter => 4,
                AbortRQServiceProviderReason::UnexpectedPduParameter => 5,
                AbortRQServiceProviderReason::InvalidPduParameter => 6,
            },
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::write_pdu;
    use crate::pdu::reader::read_pdu;
    use crate::pdu::*;
    use std::io::Cursor;

    fn round_trip(pdu: Pdu) {
        let mut bytes = Vec::new();
        write_pdu(&mut bytes, &pdu).expect("writing should succeed");
        let mut cursor = Cursor::new(&bytes);
        let read_back =
            read_pdu(&mut cursor, MAXIMUM_PDU_SIZE, false).expect("reading should succeed");
        assert_eq!(read_back, pdu);
        assert_eq!(cursor.position(), bytes.len() as u64);
    }

    #[test]
    fn round_trip_association_rq() {
        round_trip(Pdu::AssociationRQ(AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "ECHO-SCU".to_string(),
            called_ae_title: "MAIN-STORAGE".to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: vec![
                PresentationContextProposed {
                    id: 1,
                    abstract_syntax: "1.2.840.10008.1.1".to_string(),
                    transfer_syntaxes: vec![
                        "1.2.840.10008.1.2".to_string(),
                        "1.2.840.10008.1.2.1".to_string(),
                    ],
                },
                PresentationContextProposed {
                    id: 3,
                    abstract_syntax: "1.2.840.10008.5.1.4.1.1.7".to_string(),
                    transfer_syntaxes: vec!["1.2.840.10008.1.2.1".to_string()],
                },
            ],
            user_variables: vec![
                UserVariableItem::MaxLength(DEFAULT_MAX_PDU),
                UserVariableItem::ImplementationClassUID(crate::IMPLEMENTATION_CLASS_UID.to_string()),
                UserVariableItem::ImplementationVersionName(
                    crate::IMPLEMENTATION_VERSION_NAME.to_string(),
                ),
            ],
        }));
    }

    #[test]
    fn round_trip_association_ac() {
        round_trip(Pdu::AssociationAC(AssociationAC {
            protocol_version: 1,
            calling_ae_title: "ECHO-SCU".to_string(),
            called_ae_title: "MAIN-STORAGE".to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: vec![PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            }],
            user_variables: vec![UserVariableItem::MaxLength(8192)],
        }));
    }

    #[test]
    fn round_trip_association_rj() {
        round_trip(Pdu::AssociationRJ(AssociationRJ {
            result: AssociationRJResult::Permanent,
            source: AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized,
            ),
        }));
    }

    #[test]
    fn round_trip_p_data() {
        round_trip(Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0x55; 384],
            }],
        });
        round_trip(Pdu::PData {
            data: vec![
                PDataValue {
                    presentation_context_id: 3,
                    value_type: PDataValueType::Data,
                    is_last: false,
                    data: vec![0x42; 128],
                },
                PDataValue {
                    presentation_context_id: 3,
                    value_type: PDataValueType::Data,
                    is_last: true,
                    data: vec![0x24; 32],
                },
            ],
        });
    }

    #[test]
    fn round_trip_release_and_abort() {
        round_trip(Pdu::ReleaseRQ);
        round_trip(Pdu::ReleaseRP);
        round_trip(Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        });
        round_trip(Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnexpectedPdu,
            ),
        });
    }

    #[test]
    fn ae_titles_are_space_padded_and_trimmed() {
        let pdu = Pdu::AssociationRQ(AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "SCU".to_string(),
            called_ae_title: "SCP".to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: vec![],
            user_variables: vec![],
        });
        let mut bytes = Vec::new();
        write_pdu(&mut bytes, &pdu).unwrap();
        // called AE title field starts at offset 10 and spans 16 bytes
        assert_eq!(&bytes[10..26], b"SCP             ");
        assert_eq!(&bytes[26..42], b"SCU             ");

        let read_back = read_pdu(&mut Cursor::new(&bytes), MAXIMUM_PDU_SIZE, false).unwrap();
        assert_eq!(read_back, pdu);
    }
}
