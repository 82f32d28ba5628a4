//! Association requester module
//!
//! The module provides an abstraction for establishing a DICOM
//! association to a remote node, usually taking the role of a
//! service class user (SCU). See [`ClientAssociationOptions`].

use bytes::BytesMut;
use snafu::{ensure, ResultExt};
use std::borrow::Cow;
use std::convert::TryInto;
use std::net::{TcpStream, ToSocketAddrs};

use crate::address::AeAddr;
use crate::association::{
    read_pdu_from_wire, AbortedSnafu, Association, AssociationParameters, ConfigureSocketSnafu,
    ConnectSnafu, Error, MissingAbstractSyntaxSnafu, NoAcceptedPresentationContextsSnafu,
    RejectedSnafu, Result, Role, SocketOptions, UnexpectedPduSnafu, UnknownPduSnafu,
};
use crate::pdu::{
    AssociationRQ, Pdu, PresentationContextNegotiated, PresentationContextProposed,
    PresentationContextResultReason, UserVariableItem, DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE,
    PDU_HEADER_SIZE,
};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

/// A DICOM association builder for a requesting node.
///
/// The minimum required properties are the called AE title and at
/// least one presentation context; the remaining options have
/// sensible defaults.
///
/// # Example
///
/// ```no_run
/// # use vesalius_ul::association::client::ClientAssociationOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let mut association = ClientAssociationOptions::new()
///     .calling_ae_title("ECHO-SCU")
///     .called_ae_title("MAIN-STORAGE")
///     .with_presentation_context(
///         "1.2.840.10008.1.1",
///         vec!["1.2.840.10008.1.2"],
///     )
///     .establish("192.168.1.99:104")?;
/// association.release()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ClientAssociationOptions<'a> {
    /// the AE title of this node
    calling_ae_title: Cow<'a, str>,
    /// the AE title of the node being addressed
    called_ae_title: Cow<'a, str>,
    /// the application context name
    application_context_name: Cow<'a, str>,
    /// the presentation contexts to propose
    presentation_contexts: Vec<(Cow<'a, str>, Vec<Cow<'a, str>>)>,
    /// the maximum PDU length this node is willing to receive
    max_pdu_length: u32,
    /// whether to receive PDUs in strict mode
    strict: bool,
    /// options for the underlying TCP socket
    socket_options: SocketOptions,
}

impl Default for ClientAssociationOptions<'_> {
    fn default() -> Self {
        ClientAssociationOptions {
            calling_ae_title: "THIS-SCU".into(),
            called_ae_title: "ANY-SCP".into(),
            application_context_name: "1.2.840.10008.3.1.1.1".into(),
            presentation_contexts: Vec::new(),
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            socket_options: SocketOptions::default(),
        }
    }
}

impl<'a> ClientAssociationOptions<'a> {
    /// Create a new set of options for establishing an association.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the application entity title referring to this node.
    /// The default is `THIS-SCU`.
    pub fn calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the application entity title of the node to reach.
    pub fn called_ae_title<T>(mut self, called_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.called_ae_title = called_ae_title.into();
        self
    }

    /// Propose a presentation context:
    /// one abstract syntax with a list of candidate transfer
    /// syntaxes in order of preference.
    pub fn with_presentation_context<T, U>(
        mut self,
        abstract_syntax: T,
        transfer_syntaxes: Vec<U>,
    ) -> Self
    where
        T: Into<Cow<'a, str>>,
        U: Into<Cow<'a, str>>,
    {
        self.presentation_contexts.push((
            abstract_syntax.into(),
            transfer_syntaxes.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Override the maximum PDU length this node will admit.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Override strict mode:
    /// whether receiving PDUs must not surpass
    /// the negotiated maximum PDU length.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Set the read timeout for the underlying TCP socket.
    pub fn read_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.socket_options.read_timeout = Some(timeout);
        self
    }

    /// Set the write timeout for the underlying TCP socket.
    pub fn write_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.socket_options.write_timeout = Some(timeout);
        self
    }

    /// Disable Nagle's algorithm on the socket (TCP_NODELAY).
    pub fn disable_nagle(mut self) -> Self {
        self.socket_options.disable_nagle = true;
        self
    }

    /// Initiate the TCP connection to the given address
    /// and request a new DICOM association.
    pub fn establish<A: ToSocketAddrs>(self, address: A) -> Result<Association> {
        ensure!(
            !self.presentation_contexts.is_empty(),
            MissingAbstractSyntaxSnafu
        );

        let ClientAssociationOptions {
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            max_pdu_length,
            strict,
            socket_options,
        } = self;

        let presentation_contexts: Vec<_> = presentation_contexts
            .into_iter()
            .enumerate()
            .map(|(i, (abstract_syntax, transfer_syntaxes))| PresentationContextProposed {
                // identifiers must be odd integers between 1 and 255
                id: (i as u8) * 2 + 1,
                abstract_syntax: abstract_syntax.to_string(),
                transfer_syntaxes: transfer_syntaxes
                    .iter()
                    .map(|ts| ts.to_string())
                    .collect(),
            })
            .collect();

        let mut socket = TcpStream::connect(address).context(ConnectSnafu)?;
        socket
            .set_read_timeout(socket_options.read_timeout)
            .context(ConfigureSocketSnafu)?;
        socket
            .set_write_timeout(socket_options.write_timeout)
            .context(ConfigureSocketSnafu)?;
        if socket_options.disable_nagle {
            socket.set_nodelay(true).context(ConfigureSocketSnafu)?;
        }

        let rq = Pdu::AssociationRQ(AssociationRQ {
            protocol_version: 1,
            calling_ae_title: calling_ae_title.to_string(),
            called_ae_title: called_ae_title.to_string(),
            application_context_name: application_context_name.to_string(),
            presentation_contexts: presentation_contexts.clone(),
            user_variables: vec![
                UserVariableItem::MaxLength(max_pdu_length),
                UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
                UserVariableItem::ImplementationVersionName(
                    IMPLEMENTATION_VERSION_NAME.to_string(),
                ),
            ],
        });

        let mut write_buffer = Vec::with_capacity((DEFAULT_MAX_PDU + PDU_HEADER_SIZE) as usize);
        crate::pdu::write_pdu(&mut write_buffer, &rq)
            .context(crate::association::SendPduSnafu)?;
        std::io::Write::write_all(&mut socket, &write_buffer)
            .context(crate::association::WireSendSnafu)?;

        let mut read_buffer = BytesMut::with_capacity((DEFAULT_MAX_PDU + PDU_HEADER_SIZE) as usize);
        // the association response may legitimately exceed
        // this node's data max PDU length
        let msg = read_pdu_from_wire(&mut socket, &mut read_buffer, MAXIMUM_PDU_SIZE, false)?;

        match msg {
            Pdu::AssociationAC(ac) => {
                let peer_max_pdu_length = ac
                    .user_variables
                    .iter()
                    .find_map(|item| match item {
                        UserVariableItem::MaxLength(len) => Some(*len),
                        _ => None,
                    })
                    .unwrap_or(DEFAULT_MAX_PDU);
                // zero means practically unlimited
                let peer_max_pdu_length = if peer_max_pdu_length == 0 {
                    u32::MAX
                } else {
                    peer_max_pdu_length
                };

                // correlate the results with the proposed contexts
                let negotiated: Vec<PresentationContextNegotiated> = ac
                    .presentation_contexts
                    .iter()
                    .filter_map(|result| {
                        presentation_contexts
                            .iter()
                            .find(|proposed| proposed.id == result.id)
                            .map(|proposed| PresentationContextNegotiated {
                                id: result.id,
                                reason: result.reason.clone(),
                                transfer_syntax: result.transfer_syntax.clone(),
                                abstract_syntax: proposed.abstract_syntax.clone(),
                            })
                    })
                    .collect();

                ensure!(
                    negotiated
                        .iter()
                        .any(|pc| pc.reason == PresentationContextResultReason::Acceptance),
                    NoAcceptedPresentationContextsSnafu
                );

                let params = AssociationParameters {
                    calling_ae_title: calling_ae_title.to_string(),
                    called_ae_title: called_ae_title.to_string(),
                    local_endpoint: socket.local_addr().ok(),
                    remote_endpoint: socket.peer_addr().ok(),
                    presentation_contexts: negotiated,
                    max_pdu_length,
                    peer_max_pdu_length,
                    socket_options,
                };
                Ok(Association::new(
                    socket,
                    Role::Requester,
                    params,
                    strict,
                    read_buffer,
                ))
            }
            Pdu::AssociationRJ(association_rj) => {
                RejectedSnafu { association_rj }.fail()
            }
            Pdu::AbortRQ { .. } => AbortedSnafu.fail(),
            pdu @ Pdu::Unknown { .. } => {
                send_abort(&mut socket, true);
                UnknownPduSnafu { pdu: Box::new(pdu) }.fail()
            }
            pdu => {
                send_abort(&mut socket, false);
                UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail()
            }
        }
    }

    /// Request an association to a full application entity address
    /// (`AE-TITLE@host:port`), overriding the called AE title.
    pub fn establish_with(self, ae_address: &str) -> Result<Association> {
        match ae_address.try_into() {
            Ok(AeAddr {
                ae_title,
                socket_address,
            }) => self
                .called_ae_title(ae_title)
                .establish(socket_address.as_str()),
            Err(_) => self.establish(ae_address),
        }
    }
}

/// Best-effort abort during establishment; the connection is
/// dropped right after.
fn send_abort(socket: &mut TcpStream, unrecognized: bool) {
    use crate::pdu::{AbortRQServiceProviderReason, AbortRQSource};
    let reason = if unrecognized {
        AbortRQServiceProviderReason::UnrecognizedPdu
    } else {
        AbortRQServiceProviderReason::UnexpectedPdu
    };
    let mut buffer = Vec::with_capacity(16);
    if crate::pdu::write_pdu(
        &mut buffer,
        &Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(reason),
        },
    )
    .is_ok()
    {
        let _ = std::io::Write::write_all(socket, &buffer);
    }
    let _ = socket.shutdown(std::net::Shutdown::Both);
}
