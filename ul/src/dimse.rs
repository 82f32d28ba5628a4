//! DIMSE message support.
//!
//! A DIMSE message is a command attribute collection and an optional
//! data set collection, correlated to a presentation context.
//! Command sets travel in implicit VR little endian regardless of the
//! negotiated transfer syntax; data sets use the syntax negotiated
//! for their presentation context.
//!
//! [`MessageAssembler`] reassembles messages from presentation data
//! values in strict arrival order, honoring the last-fragment flag.

use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use vesalius_core::{Attribute, AttributeCollection, PrimitiveValue, Tag, VR};
use vesalius_encoding::transfer_syntax::{self, TransferSyntax, IMPLICIT_VR_LITTLE_ENDIAN};
use vesalius_parser::read::parse_data_set;
use vesalius_parser::write::encode_data_set;

use crate::pdu::{PDataValue, PDataValueType, PresentationContextNegotiated,
    PresentationContextResultReason};

/// Command Field (0000,0100) value for a C-ECHO request.
pub const C_ECHO_RQ: u16 = 0x0030;
/// Command Field (0000,0100) value for a C-ECHO response.
pub const C_ECHO_RSP: u16 = 0x8030;
/// Command Field (0000,0100) value for a C-STORE request.
pub const C_STORE_RQ: u16 = 0x0001;
/// Command Field (0000,0100) value for a C-STORE response.
pub const C_STORE_RSP: u16 = 0x8001;

/// Command Data Set Type (0000,0800) value marking
/// the absence of a data set.
pub const NO_DATA_SET: u16 = 0x0101;

/// Status (0000,0900) value for success.
pub const STATUS_SUCCESS: u16 = 0x0000;

const COMMAND_GROUP_LENGTH: Tag = Tag(0x0000, 0x0000);
const COMMAND_FIELD: Tag = Tag(0x0000, 0x0100);
const MESSAGE_ID: Tag = Tag(0x0000, 0x0110);
const MESSAGE_ID_BEING_RESPONDED_TO: Tag = Tag(0x0000, 0x0120);
const COMMAND_DATA_SET_TYPE: Tag = Tag(0x0000, 0x0800);
const STATUS: Tag = Tag(0x0000, 0x0900);

/// An error at the DIMSE message level.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// The command set bytes could not be parsed.
    #[snafu(display("Could not decode command set"))]
    DecodeCommandSet {
        source: vesalius_parser::read::Error,
        backtrace: Backtrace,
    },

    /// The data set bytes could not be parsed.
    #[snafu(display("Could not decode data set"))]
    DecodeDataSet {
        source: vesalius_parser::read::Error,
        backtrace: Backtrace,
    },

    /// A message part could not be encoded.
    #[snafu(display("Could not encode message"))]
    EncodeSet {
        source: vesalius_parser::write::Error,
        backtrace: Backtrace,
    },

    /// A PDV arrived for a presentation context
    /// which was not accepted.
    #[snafu(display("Presentation context {} was not accepted", id))]
    UnacceptedPresentationContext { id: u8, backtrace: Backtrace },

    /// The negotiated transfer syntax is not in the registry.
    #[snafu(display("Unsupported transfer syntax `{}`", uid))]
    UnsupportedTransferSyntax { uid: String, backtrace: Backtrace },

    /// A data set fragment arrived before its command set completed.
    #[snafu(display("Data set fragment arrived before the command set completed"))]
    DataBeforeCommand { backtrace: Backtrace },

    /// PDVs of different presentation contexts were interleaved
    /// within one message.
    #[snafu(display(
        "PDV for context {} interleaved with a message on context {}",
        got,
        expected
    ))]
    InterleavedMessages {
        expected: u8,
        got: u8,
        backtrace: Backtrace,
    },
}

/// Type alias for DIMSE results.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A complete DIMSE message.
#[derive(Debug, Clone, PartialEq)]
pub struct DimseMessage {
    /// the presentation context the message belongs to
    pub presentation_context_id: u8,
    /// the command set
    pub command: AttributeCollection,
    /// the data set, if the command announces one
    pub data: Option<AttributeCollection>,
}

impl DimseMessage {
    /// Create a message with no data set.
    pub fn new(presentation_context_id: u8, command: AttributeCollection) -> Self {
        DimseMessage {
            presentation_context_id,
            command,
            data: None,
        }
    }

    /// Attach a data set to the message.
    pub fn with_data(mut self, data: AttributeCollection) -> Self {
        self.data = Some(data);
        self
    }

    /// The Command Field value, identifying the operation.
    pub fn command_field(&self) -> Option<u16> {
        self.command
            .get(COMMAND_FIELD)
            .and_then(Attribute::primitive)
            .and_then(PrimitiveValue::u16)
    }

    /// The message identifier (request) of this message.
    pub fn message_id(&self) -> Option<u16> {
        self.command
            .get(MESSAGE_ID)
            .and_then(Attribute::primitive)
            .and_then(PrimitiveValue::u16)
    }

    /// The message identifier being responded to, for responses.
    pub fn message_id_being_responded_to(&self) -> Option<u16> {
        self.command
            .get(MESSAGE_ID_BEING_RESPONDED_TO)
            .and_then(Attribute::primitive)
            .and_then(PrimitiveValue::u16)
    }

    /// The status value, for responses.
    pub fn status(&self) -> Option<u16> {
        self.command
            .get(STATUS)
            .and_then(Attribute::primitive)
            .and_then(PrimitiveValue::u16)
    }
}

/// Whether the given command set announces an accompanying data set.
pub fn command_has_data_set(command: &AttributeCollection) -> bool {
    command
        .get(COMMAND_DATA_SET_TYPE)
        .and_then(Attribute::primitive)
        .and_then(PrimitiveValue::u16)
        .map(|v| v != NO_DATA_SET)
        .unwrap_or(false)
}

/// Look up the transfer syntax negotiated for a presentation context.
pub fn negotiated_syntax(
    contexts: &[PresentationContextNegotiated],
    presentation_context_id: u8,
) -> Result<&'static TransferSyntax> {
    let context = contexts
        .iter()
        .find(|pc| {
            pc.id == presentation_context_id
                && pc.reason == PresentationContextResultReason::Acceptance
        })
        .context(UnacceptedPresentationContextSnafu {
            id: presentation_context_id,
        })?;
    transfer_syntax::lookup(&context.transfer_syntax).context(UnsupportedTransferSyntaxSnafu {
        uid: context.transfer_syntax.clone(),
    })
}

/// Encode a command set in implicit VR little endian,
/// preceded by a freshly computed Command Group Length element.
pub fn encode_command_set(command: &AttributeCollection) -> Result<Vec<u8>> {
    // the group length is always recomputed, never trusted
    let mut command = command.clone();
    command.remove(COMMAND_GROUP_LENGTH);
    let body = encode_data_set(&command, &IMPLICIT_VR_LITTLE_ENDIAN).context(EncodeSetSnafu)?;

    let mut group_length = AttributeCollection::new();
    group_length.put(Attribute::new(
        COMMAND_GROUP_LENGTH,
        VR::UL,
        PrimitiveValue::from(body.len() as u32),
    ));
    let mut full =
        encode_data_set(&group_length, &IMPLICIT_VR_LITTLE_ENDIAN).context(EncodeSetSnafu)?;
    full.extend_from_slice(&body);
    Ok(full)
}

/// Encode a data set with the given transfer syntax.
pub fn encode_data_set_with(
    data: &AttributeCollection,
    syntax: &'static TransferSyntax,
) -> Result<Vec<u8>> {
    encode_data_set(data, syntax).context(EncodeSetSnafu)
}

/// Command set builders for the verification service,
/// mostly useful for tests and smoke checks.
pub mod commands {
    use super::*;

    /// Build a C-ECHO request command set.
    pub fn echo_rq(message_id: u16) -> AttributeCollection {
        let mut command = AttributeCollection::new();
        command.put(Attribute::new(
            Tag(0x0000, 0x0002),
            VR::UI,
            "1.2.840.10008.1.1\0",
        ));
        command.put(Attribute::new(
            COMMAND_FIELD,
            VR::US,
            PrimitiveValue::from(C_ECHO_RQ),
        ));
        command.put(Attribute::new(
            MESSAGE_ID,
            VR::US,
            PrimitiveValue::from(message_id),
        ));
        command.put(Attribute::new(
            COMMAND_DATA_SET_TYPE,
            VR::US,
            PrimitiveValue::from(NO_DATA_SET),
        ));
        command
    }

    /// Build a C-ECHO response command set.
    pub fn echo_rsp(message_id: u16, status: u16) -> AttributeCollection {
        let mut command = AttributeCollection::new();
        command.put(Attribute::new(
            Tag(0x0000, 0x0002),
            VR::UI,
            "1.2.840.10008.1.1\0",
        ));
        command.put(Attribute::new(
            COMMAND_FIELD,
            VR::US,
            PrimitiveValue::from(C_ECHO_RSP),
        ));
        command.put(Attribute::new(
            MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            PrimitiveValue::from(message_id),
        ));
        command.put(Attribute::new(
            COMMAND_DATA_SET_TYPE,
            VR::US,
            PrimitiveValue::from(NO_DATA_SET),
        ));
        command.put(Attribute::new(
            STATUS,
            VR::US,
            PrimitiveValue::from(status),
        ));
        command
    }
}

/// A DIMSE message in the process of being reassembled.
#[derive(Debug)]
struct InProgress {
    presentation_context_id: u8,
    command_bytes: Vec<u8>,
    command: Option<AttributeCollection>,
    data_bytes: Vec<u8>,
}

/// Reassembles DIMSE messages from presentation data values.
///
/// Fragments must arrive in order; a value item's last-fragment flag
/// marks the completion of the command or data part.
#[derive(Debug)]
pub struct MessageAssembler {
    /// (context id, transfer syntax UID) of the accepted contexts
    contexts: Vec<PresentationContextNegotiated>,
    current: Option<InProgress>,
}

impl MessageAssembler {
    /// Create an assembler for an association
    /// with the given negotiated presentation contexts.
    pub fn new(contexts: &[PresentationContextNegotiated]) -> Self {
        MessageAssembler {
            contexts: contexts.to_vec(),
            current: None,
        }
    }

    /// Feed one presentation data value.
    ///
    /// Returns a completed message once its final fragment arrives.
    pub fn offer(&mut self, pdv: PDataValue) -> Result<Option<DimseMessage>> {
        let current = self.current.get_or_insert_with(|| InProgress {
            presentation_context_id: pdv.presentation_context_id,
            command_bytes: Vec::new(),
            command: None,
            data_bytes: Vec::new(),
        });
        if current.presentation_context_id != pdv.presentation_context_id {
            return InterleavedMessagesSnafu {
                expected: current.presentation_context_id,
                got: pdv.presentation_context_id,
            }
            .fail();
        }

        match pdv.value_type {
            PDataValueType::Command => {
                current.command_bytes.extend_from_slice(&pdv.data);
                if pdv.is_last {
                    let command =
                        parse_data_set(&current.command_bytes, &IMPLICIT_VR_LITTLE_ENDIAN)
                            .context(DecodeCommandSetSnafu)?;
                    if command_has_data_set(&command) {
                        current.command = Some(command);
                    } else {
                        let pcid = current.presentation_context_id;
                        self.current = None;
                        return Ok(Some(DimseMessage::new(pcid, command)));
                    }
                }
                Ok(None)
            }
            PDataValueType::Data => {
                if current.command.is_none() {
                    return DataBeforeCommandSnafu.fail();
                }
                current.data_bytes.extend_from_slice(&pdv.data);
                if pdv.is_last {
                    let syntax =
                        negotiated_syntax(&self.contexts, current.presentation_context_id)?;
                    let data = parse_data_set(&current.data_bytes, syntax)
                        .context(DecodeDataSetSnafu)?;
                    let finished = self
                        .current
                        .take()
                        .expect("a message is in progress");
                    let command = finished
                        .command
                        .expect("the command part was completed above");
                    return Ok(Some(
                        DimseMessage::new(finished.presentation_context_id, command)
                            .with_data(data),
                    ));
                }
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accepted_context(id: u8) -> PresentationContextNegotiated {
        PresentationContextNegotiated {
            id,
            reason: PresentationContextResultReason::Acceptance,
            transfer_syntax: "1.2.840.10008.1.2".to_string(),
            abstract_syntax: "1.2.840.10008.1.1".to_string(),
        }
    }

    #[test]
    fn echo_command_round_trip() {
        let command = commands::echo_rq(7);
        let bytes = encode_command_set(&command).unwrap();

        let mut assembler = MessageAssembler::new(&[accepted_context(1)]);
        let message = assembler
            .offer(PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: bytes,
            })
            .unwrap()
            .expect("the command set is complete");

        assert_eq!(message.presentation_context_id, 1);
        assert_eq!(message.command_field(), Some(C_ECHO_RQ));
        assert_eq!(message.message_id(), Some(7));
        assert_eq!(message.data, None);
        // group lengths are dropped on decode; the payload survives
        assert_eq!(message.command, command);
    }

    #[test]
    fn fragmented_command_set_is_reassembled() {
        let bytes = encode_command_set(&commands::echo_rsp(9, STATUS_SUCCESS)).unwrap();
        let (first, second) = bytes.split_at(bytes.len() / 2);

        let mut assembler = MessageAssembler::new(&[accepted_context(1)]);
        assert_eq!(
            assembler
                .offer(PDataValue {
                    presentation_context_id: 1,
                    value_type: PDataValueType::Command,
                    is_last: false,
                    data: first.to_vec(),
                })
                .unwrap(),
            None,
        );
        let message = assembler
            .offer(PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: second.to_vec(),
            })
            .unwrap()
            .expect("the command set is complete");
        assert_eq!(message.command_field(), Some(C_ECHO_RSP));
        assert_eq!(message.message_id_being_responded_to(), Some(9));
        assert_eq!(message.status(), Some(STATUS_SUCCESS));
    }

    #[test]
    fn command_with_data_set() {
        use vesalius_core::Tag;

        let mut command = commands::echo_rq(3);
        command.put(Attribute::new(
            COMMAND_DATA_SET_TYPE,
            VR::US,
            PrimitiveValue::from(0x0000_u16),
        ));
        let command_bytes = encode_command_set(&command).unwrap();

        let mut data = AttributeCollection::new();
        data.put(Attribute::new(Tag(0x0008, 0x0060), VR::CS, "OT"));
        let data_bytes =
            encode_data_set_with(&data, &IMPLICIT_VR_LITTLE_ENDIAN).unwrap();

        let mut assembler = MessageAssembler::new(&[accepted_context(1)]);
        assert_eq!(
            assembler
                .offer(PDataValue {
                    presentation_context_id: 1,
                    value_type: PDataValueType::Command,
                    is_last: true,
                    data: command_bytes,
                })
                .unwrap(),
            None,
        );
        let message = assembler
            .offer(PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Data,
                is_last: true,
                data: data_bytes,
            })
            .unwrap()
            .expect("message complete after the data set");
        assert_eq!(message.data, Some(data));
    }

    #[test]
    fn data_before_command_is_an_error() {
        let mut assembler = MessageAssembler::new(&[accepted_context(1)]);
        let outcome = assembler.offer(PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: true,
            data: vec![0; 8],
        });
        assert!(matches!(outcome, Err(Error::DataBeforeCommand { .. })));
    }

    #[test]
    fn unaccepted_context_is_rejected() {
        let mut contexts = vec![accepted_context(1)];
        contexts[0].reason = PresentationContextResultReason::TransferSyntaxesNotSupported;
        let outcome = negotiated_syntax(&contexts, 1);
        assert!(matches!(
            outcome,
            Err(Error::UnacceptedPresentationContext { id: 1, .. })
        ));
    }
}
