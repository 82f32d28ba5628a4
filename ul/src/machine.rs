//! The association state machine.
//!
//! A subset of the 13 states of the standard upper layer protocol
//! machine, covering association establishment, data transfer,
//! orderly release and abrupt teardown. Each inbound PDU type is
//! legal only in specific states; receiving a PDU outside of them
//! is a protocol error which triggers an abort with reason
//! "unexpected PDU".

use crate::pdu::Pdu;

/// The lifecycle state of an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationState {
    /// No association and no transport connection (Sta1).
    Idle,
    /// Requester: transport connection being opened (Sta4).
    AwaitingTransportOpen,
    /// Requester: A-ASSOCIATE-RQ sent,
    /// awaiting the peer's answer (Sta5).
    AwaitingAssociateResponse,
    /// Acceptor: transport connection open,
    /// awaiting an A-ASSOCIATE-RQ (Sta2).
    AwaitingAssociateRequest,
    /// Association established; DIMSE messages may flow (Sta6).
    DataTransfer,
    /// A-RELEASE-RQ sent, awaiting the peer's A-RELEASE-RP (Sta7).
    AwaitingReleaseResponse,
    /// A-RELEASE-RQ received, awaiting the local A-RELEASE-RP (Sta8).
    AwaitingReleaseConfirmation,
    /// Teardown in progress, awaiting transport close (Sta13).
    AwaitingTransportClose,
}

impl AssociationState {
    /// Whether the association is established and may carry
    /// DIMSE traffic.
    pub fn is_established(self) -> bool {
        self == AssociationState::DataTransfer
    }

    /// Whether the state machine has returned to rest.
    pub fn is_idle(self) -> bool {
        self == AssociationState::Idle
    }
}

/// Whether the receipt of the given PDU is legal in the given state.
///
/// An abort is unconditional: it may arrive in any non-idle state.
pub fn pdu_legal_in(state: AssociationState, pdu: &Pdu) -> bool {
    use AssociationState::*;
    match pdu {
        Pdu::AbortRQ { .. } => state != Idle,
        Pdu::AssociationRQ { .. } => state == AwaitingAssociateRequest,
        Pdu::AssociationAC { .. } | Pdu::AssociationRJ { .. } => {
            state == AwaitingAssociateResponse
        }
        Pdu::PData { .. } => {
            // data may still arrive while a release collision resolves
            state == DataTransfer || state == AwaitingReleaseResponse
        }
        Pdu::ReleaseRQ => state == DataTransfer || state == AwaitingReleaseResponse,
        Pdu::ReleaseRP => state == AwaitingReleaseResponse,
        Pdu::Unknown { .. } => false,
    }
}

/// The state after receiving a legal PDU in the given state.
pub fn state_after_receiving(state: AssociationState, pdu: &Pdu) -> AssociationState {
    use AssociationState::*;
    match pdu {
        Pdu::AbortRQ { .. } => Idle,
        Pdu::AssociationRQ { .. } => DataTransfer,
        Pdu::AssociationAC { .. } => DataTransfer,
        Pdu::AssociationRJ { .. } => AwaitingTransportClose,
        Pdu::PData { .. } => state,
        Pdu::ReleaseRQ => AwaitingReleaseConfirmation,
        Pdu::ReleaseRP => AwaitingTransportClose,
        Pdu::Unknown { .. } => state,
    }
}

/// The state after sending the given PDU in the given state.
pub fn state_after_sending(state: AssociationState, pdu: &Pdu) -> AssociationState {
    use AssociationState::*;
    match pdu {
        Pdu::AbortRQ { .. } => AwaitingTransportClose,
        Pdu::AssociationRQ { .. } => AwaitingAssociateResponse,
        Pdu::AssociationAC { .. } => DataTransfer,
        Pdu::AssociationRJ { .. } => AwaitingTransportClose,
        Pdu::PData { .. } => state,
        Pdu::ReleaseRQ => AwaitingReleaseResponse,
        Pdu::ReleaseRP => AwaitingTransportClose,
        Pdu::Unknown { .. } => state,
    }
}
