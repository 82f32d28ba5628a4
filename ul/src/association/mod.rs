//! DICOM association module
//!
//! This module contains the value objects describing a proposed or
//! negotiated association, the presentation context negotiation
//! function, and the [`Association`] type: the connection-level
//! engine which sends and receives PDUs under the association state
//! machine, reassembles DIMSE messages, and tears the connection
//! down idempotently.
//!
//! As an association requester, see [`ClientAssociationOptions`].
//! As an acceptor, associations are handed out by the
//! [`server`](crate::server) module.
//!
//! [`ClientAssociationOptions`]: client::ClientAssociationOptions
pub mod client;
pub mod pdata;

use bytes::BytesMut;
use snafu::{Backtrace, ResultExt, Snafu};
use std::io::{Cursor, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;
use tracing::{debug, warn};

use crate::dimse::{self, DimseMessage, MessageAssembler};
use crate::machine::{self, AssociationState};
use crate::pdu::{
    read_pdu, write_pdu, AbortRQServiceProviderReason, AbortRQSource, AssociationRJ,
    PDataValue, PDataValueType, Pdu, PresentationContextNegotiated, PresentationContextProposed,
    PresentationContextResultReason, MAXIMUM_PDU_SIZE, PDU_HEADER_SIZE,
};
use pdata::PDataWriter;

/// An error during association negotiation or data transfer.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// At least one presentation context must be configured.
    #[snafu(display("No presentation context configured"))]
    MissingAbstractSyntax { backtrace: Backtrace },

    /// Failed to connect to the peer node.
    #[snafu(display("Could not connect to the peer node"))]
    Connect {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// Failed to configure the socket.
    #[snafu(display("Could not configure the socket"))]
    ConfigureSocket {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// Failed to encode an outbound PDU.
    #[snafu(display("Could not encode PDU"))]
    SendPdu {
        source: crate::pdu::writer::Error,
        backtrace: Backtrace,
    },

    /// Failed to send PDU bytes over the wire.
    #[snafu(display("Could not send PDU on the wire"))]
    WireSend {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// Failed to decode an inbound PDU.
    #[snafu(display("Could not read PDU"))]
    ReceivePdu {
        source: crate::pdu::reader::Error,
        backtrace: Backtrace,
    },

    /// Failed to read PDU bytes from the wire.
    #[snafu(display("Could not read from the wire"))]
    WireRead {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// No PDU arrived within the configured read timeout.
    #[snafu(display("No PDU activity within the read timeout"))]
    Timeout {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// The transport connection was closed by the peer.
    #[snafu(display("Connection closed by the peer"))]
    ConnectionClosed { backtrace: Backtrace },

    /// An incoming PDU exceeds the admissible length.
    #[snafu(display("Incoming PDU too large ({} bytes)", pdu_length))]
    PduTooLarge {
        pdu_length: u32,
        backtrace: Backtrace,
    },

    /// An outbound P-Data PDU exceeds the peer's maximum PDU length.
    #[snafu(display(
        "PDU is too large to be sent ({} bytes, peer maximum is {})",
        length,
        peer_max_pdu_length
    ))]
    SendTooLongPdu {
        length: usize,
        peer_max_pdu_length: u32,
        backtrace: Backtrace,
    },

    /// The association request was rejected by the peer.
    #[snafu(display("Association rejected by the peer: {}", association_rj.source))]
    Rejected {
        association_rj: AssociationRJ,
        backtrace: Backtrace,
    },

    /// The association was aborted.
    #[snafu(display("Association aborted"))]
    Aborted { backtrace: Backtrace },

    /// The peer requested an orderly release.
    #[snafu(display("Association released by the peer"))]
    Released { backtrace: Backtrace },

    /// A PDU arrived which is not legal in the current state.
    #[snafu(display("Unexpected PDU `{}`", pdu.short_description()))]
    UnexpectedPdu { pdu: Box<Pdu>, backtrace: Backtrace },

    /// A PDU of an unrecognized type arrived.
    #[snafu(display("Unrecognized PDU type"))]
    UnknownPdu { pdu: Box<Pdu>, backtrace: Backtrace },

    /// No presentation context was accepted by the acceptor.
    #[snafu(display("No presentation context was accepted"))]
    NoAcceptedPresentationContexts { backtrace: Backtrace },

    /// Failure at the DIMSE message level.
    #[snafu(display("DIMSE message failure"))]
    Dimse {
        source: dimse::Error,
        backtrace: Backtrace,
    },
}

/// Type alias for association operation results.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Options for the underlying TCP socket of an association.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SocketOptions {
    /// timeout for individual socket reads
    pub read_timeout: Option<Duration>,
    /// timeout for individual socket writes
    pub write_timeout: Option<Duration>,
    /// disable Nagle's algorithm (TCP_NODELAY)
    pub disable_nagle: bool,
}

/// The parameters of a proposed or negotiated association.
///
/// Built by the caller before connecting or listening; the
/// negotiation only fills in the negotiated subset (accepted transfer
/// syntaxes and result codes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationParameters {
    /// the AE title of the requesting node
    pub calling_ae_title: String,
    /// the AE title of the node being addressed
    pub called_ae_title: String,
    /// the local endpoint of the connection, when known
    pub local_endpoint: Option<SocketAddr>,
    /// the remote endpoint of the connection, when known
    pub remote_endpoint: Option<SocketAddr>,
    /// the negotiated presentation contexts
    pub presentation_contexts: Vec<PresentationContextNegotiated>,
    /// the maximum PDU length this node is willing to receive
    pub max_pdu_length: u32,
    /// the maximum PDU length the peer is willing to receive
    pub peer_max_pdu_length: u32,
    /// socket options in effect
    pub socket_options: SocketOptions,
}

/// Negotiate presentation contexts:
/// for each proposed context, find a supported context with the same
/// abstract syntax, then accept with the first transfer syntax (in
/// the proposed order) which that context also offers.
///
/// Rejections distinguish a missing abstract syntax from a transfer
/// syntax mismatch. Whether the whole association should be rejected
/// (no context accepted) is the caller's decision via
/// [`any_accepted`].
pub fn negotiate_contexts(
    proposed: &[PresentationContextProposed],
    supported: &[PresentationContextProposed],
) -> Vec<PresentationContextNegotiated> {
    proposed
        .iter()
        .map(|pc| {
            let server_context = supported
                .iter()
                .find(|sc| sc.abstract_syntax == pc.abstract_syntax);

            match server_context {
                None => PresentationContextNegotiated {
                    id: pc.id,
                    reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                    transfer_syntax: "1.2.840.10008.1.2".to_string(),
                    abstract_syntax: pc.abstract_syntax.clone(),
                },
                Some(sc) => match pc
                    .transfer_syntaxes
                    .iter()
                    .find(|ts| sc.transfer_syntaxes.contains(ts))
                {
                    Some(ts) => PresentationContextNegotiated {
                        id: pc.id,
                        reason: PresentationContextResultReason::Acceptance,
                        transfer_syntax: ts.clone(),
                        abstract_syntax: pc.abstract_syntax.clone(),
                    },
                    None => PresentationContextNegotiated {
                        id: pc.id,
                        reason: PresentationContextResultReason::TransferSyntaxesNotSupported,
                        transfer_syntax: "1.2.840.10008.1.2".to_string(),
                        abstract_syntax: pc.abstract_syntax.clone(),
                    },
                },
            }
        })
        .collect()
}

/// Whether at least one presentation context was accepted.
pub fn any_accepted(contexts: &[PresentationContextNegotiated]) -> bool {
    contexts
        .iter()
        .any(|pc| pc.reason == PresentationContextResultReason::Acceptance)
}

/// Read one full PDU from the wire, buffering partial reads.
pub(crate) fn read_pdu_from_wire<R>(
    reader: &mut R,
    buffer: &mut BytesMut,
    max_pdu_length: u32,
    strict: bool,
) -> Result<Pdu>
where
    R: Read,
{
    loop {
        if buffer.len() >= PDU_HEADER_SIZE as usize {
            let pdu_length =
                u32::from_be_bytes([buffer[2], buffer[3], buffer[4], buffer[5]]);
            let limit = if strict {
                max_pdu_length
            } else {
                MAXIMUM_PDU_SIZE
            };
            // reject oversized PDUs before waiting for the whole body
            if pdu_length > limit {
                return PduTooLargeSnafu { pdu_length }.fail();
            }
            let total = pdu_length as usize + PDU_HEADER_SIZE as usize;
            if buffer.len() >= total {
                let msg = buffer.split_to(total);
                return read_pdu(&mut Cursor::new(&msg[..]), max_pdu_length, strict)
                    .context(ReceivePduSnafu);
            }
        }

        let mut chunk = [0u8; 16 * 1024];
        let n = match reader.read(&mut chunk) {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(e).context(TimeoutSnafu);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context(WireReadSnafu),
        };
        if n == 0 {
            return ConnectionClosedSnafu.fail();
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
}

/// The role a node takes in an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// the node which requested the association
    Requester,
    /// the node which accepted the association
    Acceptor,
}

/// An established DICOM upper layer association.
///
/// The same engine serves both roles: it sends and receives PDUs
/// under the association state machine, splits outbound DIMSE
/// messages into presentation data values bounded by the peer's
/// maximum PDU length, reassembles inbound ones, and tears the
/// transport down exactly once no matter how many times teardown
/// is requested.
///
/// When the value falls out of scope,
/// the underlying TCP connection is shut down.
#[derive(Debug)]
pub struct Association {
    socket: TcpStream,
    role: Role,
    state: AssociationState,
    params: AssociationParameters,
    strict: bool,
    read_buffer: BytesMut,
    write_buffer: Vec<u8>,
    closed: bool,
}

impl Association {
    pub(crate) fn new(
        socket: TcpStream,
        role: Role,
        params: AssociationParameters,
        strict: bool,
        read_buffer: BytesMut,
    ) -> Self {
        Association {
            socket,
            role,
            state: AssociationState::DataTransfer,
            params,
            strict,
            read_buffer,
            write_buffer: Vec::with_capacity(PDU_HEADER_SIZE as usize + 1024),
            closed: false,
        }
    }

    /// The role of this node in the association.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The current state of the association state machine.
    pub fn state(&self) -> AssociationState {
        self.state
    }

    /// The parameters this association was established with.
    pub fn parameters(&self) -> &AssociationParameters {
        &self.params
    }

    /// Obtain a view of the negotiated presentation contexts.
    pub fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
        &self.params.presentation_contexts
    }

    /// Obtain the remote node's application entity title.
    pub fn peer_ae_title(&self) -> &str {
        match self.role {
            Role::Requester => &self.params.called_ae_title,
            Role::Acceptor => &self.params.calling_ae_title,
        }
    }

    /// The maximum PDU length the peer is willing to receive.
    pub fn peer_max_pdu_length(&self) -> u32 {
        self.params.peer_max_pdu_length
    }

    /// The maximum PDU length this node is willing to receive.
    pub fn max_pdu_length(&self) -> u32 {
        self.params.max_pdu_length
    }

    /// Whether the association has been torn down.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Send a PDU message to the peer.
    ///
    /// Sending on a closed association is a no-op,
    /// keeping teardown paths idempotent.
    pub fn send(&mut self, pdu: &Pdu) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        if let Pdu::PData { data } = pdu {
            let length: usize = data.iter().map(|pdv| pdv.data.len() + 6).sum();
            if length > self.params.peer_max_pdu_length as usize {
                return SendTooLongPduSnafu {
                    length,
                    peer_max_pdu_length: self.params.peer_max_pdu_length,
                }
                .fail();
            }
        }

        self.write_buffer.clear();
        write_pdu(&mut self.write_buffer, pdu).context(SendPduSnafu)?;
        match self.socket.write_all(&self.write_buffer) {
            Ok(()) => {
                self.state = machine::state_after_sending(self.state, pdu);
                Ok(())
            }
            Err(e) => {
                self.shutdown();
                Err(e).context(WireSendSnafu)
            }
        }
    }

    /// Read the next PDU from the peer.
    ///
    /// A PDU which is not legal in the current state triggers an
    /// A-ABORT with reason "unexpected PDU" and an error.
    /// Transport errors tear the association down.
    pub fn receive(&mut self) -> Result<Pdu> {
        if self.closed {
            return ConnectionClosedSnafu.fail();
        }

        match read_pdu_from_wire(
            &mut self.socket,
            &mut self.read_buffer,
            self.params.max_pdu_length,
            self.strict,
        ) {
            Ok(pdu @ Pdu::Unknown { .. }) => {
                self.abort_with(AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::UnrecognizedPdu,
                ));
                UnknownPduSnafu { pdu: Box::new(pdu) }.fail()
            }
            Ok(pdu) => {
                if !machine::pdu_legal_in(self.state, &pdu) {
                    warn!(
                        "{} not legal in association state {:?}",
                        pdu.short_description(),
                        self.state
                    );
                    self.abort_with(AbortRQSource::ServiceProvider(
                        AbortRQServiceProviderReason::UnexpectedPdu,
                    ));
                    return UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail();
                }
                self.state = machine::state_after_receiving(self.state, &pdu);
                if let Pdu::AbortRQ { .. } = pdu {
                    self.shutdown();
                }
                Ok(pdu)
            }
            // a timeout leaves the association open; the caller decides
            Err(e @ Error::Timeout { .. }) => Err(e),
            Err(e) => {
                self.shutdown();
                Err(e)
            }
        }
    }

    /// Gracefully terminate the association,
    /// sending an A-RELEASE-RQ and waiting for the peer's reply.
    pub fn release(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.send(&Pdu::ReleaseRQ)?;
        let result = loop {
            match self.receive() {
                Ok(Pdu::ReleaseRP) => break Ok(()),
                // data still in flight is discarded during release
                Ok(Pdu::PData { .. }) => continue,
                Ok(Pdu::ReleaseRQ) => {
                    // release collision: answer and be done
                    let _ = self.send(&Pdu::ReleaseRP);
                    break Ok(());
                }
                Ok(_) | Err(Error::Aborted { .. }) => break AbortedSnafu.fail(),
                Err(e) => break Err(e),
            }
        };
        self.shutdown();
        result
    }

    /// Abort the association and close the transport immediately.
    ///
    /// May be issued from any state, any number of times;
    /// only the first call has an effect.
    pub fn abort(&mut self) -> Result<()> {
        self.abort_with(AbortRQSource::ServiceUser);
        Ok(())
    }

    fn abort_with(&mut self, source: AbortRQSource) {
        if self.closed {
            return;
        }
        let mut buffer = Vec::with_capacity(16);
        if write_pdu(&mut buffer, &Pdu::AbortRQ { source }).is_ok() {
            // a failed send here is no worse than an abrupt close
            if let Err(e) = self.socket.write_all(&buffer) {
                debug!("failed to send abort PDU: {}", e);
            }
        }
        self.shutdown();
    }

    /// Shut the transport down. Idempotent.
    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.socket.shutdown(std::net::Shutdown::Both) {
            debug!("socket shutdown: {}", e);
        }
        self.closed = true;
        self.state = AssociationState::Idle;
    }

    /// Send a DIMSE message over the given presentation context.
    ///
    /// The command set is encoded with implicit VR little endian and
    /// is not split across P-DATA PDUs unless it cannot fit in one;
    /// the data set is encoded with the transfer syntax negotiated
    /// for the context and split into presentation data values
    /// bounded by the peer's maximum PDU length.
    pub fn send_message(&mut self, message: &DimseMessage) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let pcid = message.presentation_context_id;
        let max_data_len = self.max_pdv_data_length();

        let command_bytes = dimse::encode_command_set(&message.command).context(DimseSnafu)?;
        for pdu in chunk_pdvs(&command_bytes, pcid, PDataValueType::Command, max_data_len) {
            self.send(&pdu)?;
        }

        if let Some(data) = &message.data {
            let syntax = dimse::negotiated_syntax(self.presentation_contexts(), pcid)
                .context(DimseSnafu)?;
            let data_bytes = dimse::encode_data_set_with(data, syntax).context(DimseSnafu)?;
            for pdu in chunk_pdvs(&data_bytes, pcid, PDataValueType::Data, max_data_len) {
                self.send(&pdu)?;
            }
        }
        Ok(())
    }

    /// Receive one full DIMSE message,
    /// reassembling presentation data values in arrival order.
    pub fn receive_message(&mut self) -> Result<DimseMessage> {
        let mut assembler = MessageAssembler::new(self.presentation_contexts());
        loop {
            match self.receive()? {
                Pdu::PData { data } => {
                    for pdv in data {
                        if let Some(message) = assembler.offer(pdv).context(DimseSnafu)? {
                            return Ok(message);
                        }
                    }
                }
                Pdu::AbortRQ { .. } => return AbortedSnafu.fail(),
                Pdu::ReleaseRQ => {
                    let _ = self.send(&Pdu::ReleaseRP);
                    self.shutdown();
                    return ReleasedSnafu.fail();
                }
                pdu => return UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail(),
            }
        }
    }

    /// Prepare a P-Data writer for sending a data set
    /// as a sequence of P-DATA PDUs bounded by the peer's
    /// maximum PDU length.
    pub fn send_pdata(&mut self, presentation_context_id: u8) -> PDataWriter<&mut TcpStream> {
        PDataWriter::new(
            &mut self.socket,
            presentation_context_id,
            self.params.peer_max_pdu_length,
        )
    }

    /// The maximum payload of one presentation data value,
    /// given the peer's maximum PDU length.
    fn max_pdv_data_length(&self) -> usize {
        self.params.peer_max_pdu_length as usize - 6
    }
}

impl Drop for Association {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Split a message part into P-DATA PDUs with payloads no larger
/// than `max_data_len`, marking the final fragment as last.
/// An empty part still produces one (empty, last) fragment.
pub(crate) fn chunk_pdvs(
    bytes: &[u8],
    presentation_context_id: u8,
    value_type: PDataValueType,
    max_data_len: usize,
) -> Vec<Pdu> {
    let mut pdus = Vec::with_capacity(1 + bytes.len() / max_data_len.max(1));
    let mut chunks = bytes.chunks(max_data_len.max(1)).peekable();
    if chunks.peek().is_none() {
        pdus.push(Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type,
                is_last: true,
                data: Vec::new(),
            }],
        });
        return pdus;
    }
    while let Some(chunk) = chunks.next() {
        pdus.push(Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type,
                is_last: chunks.peek().is_none(),
                data: chunk.to_vec(),
            }],
        });
    }
    pdus
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposed(
        abstract_syntax: &str,
        transfer_syntaxes: &[&str],
        id: u8,
    ) -> PresentationContextProposed {
        PresentationContextProposed {
            id,
            abstract_syntax: abstract_syntax.to_string(),
            transfer_syntaxes: transfer_syntaxes.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn negotiation_accepts_first_proposed_transfer_syntax() {
        // proposed [A:{ts1,ts2}], server offers [A:{ts2}]: accept ts2
        let results = negotiate_contexts(
            &[proposed("A", &["ts1", "ts2"], 1)],
            &[proposed("A", &["ts2"], 1)],
        );
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].reason, PresentationContextResultReason::Acceptance);
        assert_eq!(results[0].transfer_syntax, "ts2");
        assert!(any_accepted(&results));
    }

    #[test]
    fn negotiation_rejects_unknown_abstract_syntax() {
        // server offers [B:{ts1}]: abstract syntax not supported
        let results = negotiate_contexts(
            &[proposed("A", &["ts1", "ts2"], 1)],
            &[proposed("B", &["ts1"], 1)],
        );
        assert_eq!(
            results[0].reason,
            PresentationContextResultReason::AbstractSyntaxNotSupported,
        );
        assert!(!any_accepted(&results));
    }

    #[test]
    fn negotiation_rejects_transfer_syntax_mismatch() {
        let results = negotiate_contexts(
            &[proposed("A", &["ts1"], 1)],
            &[proposed("A", &["ts2"], 1)],
        );
        assert_eq!(
            results[0].reason,
            PresentationContextResultReason::TransferSyntaxesNotSupported,
        );
        assert!(!any_accepted(&results));
    }

    #[test]
    fn negotiation_respects_proposed_order() {
        // the server supports both, the requester prefers ts1
        let results = negotiate_contexts(
            &[proposed("A", &["ts1", "ts2"], 1)],
            &[proposed("A", &["ts2", "ts1"], 1)],
        );
        assert_eq!(results[0].transfer_syntax, "ts1");
    }

    #[test]
    fn chunking_respects_max_data_length() {
        let bytes = vec![0u8; 10];
        let pdus = chunk_pdvs(&bytes, 1, PDataValueType::Data, 4);
        assert_eq!(pdus.len(), 3);
        let lengths: Vec<_> = pdus
            .iter()
            .map(|pdu| match pdu {
                Pdu::PData { data } => (data[0].data.len(), data[0].is_last),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(lengths, vec![(4, false), (4, false), (2, true)]);
    }

    #[test]
    fn chunking_of_empty_part_is_one_last_fragment() {
        let pdus = chunk_pdvs(&[], 1, PDataValueType::Command, 64);
        assert_eq!(pdus.len(), 1);
        match &pdus[0] {
            Pdu::PData { data } => {
                assert!(data[0].is_last);
                assert!(data[0].data.is_empty());
            }
            _ => unreachable!(),
        }
    }
}
