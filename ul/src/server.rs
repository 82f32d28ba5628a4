//! Listener and connection dispatch module.
//!
//! An application entity registers itself under a local endpoint and
//! a called AE title, together with a handler factory. One listener
//! is kept per bound endpoint; multiple applications distinguished by
//! called AE title may share it. The last unregistration for an
//! endpoint stops the accept thread and closes the socket.
//!
//! Each accepted connection is served on its own thread: the
//! association request is read, the called AE title is resolved,
//! presentation contexts are negotiated, and the established
//! [`Association`] is driven until it reaches a terminal state.
//! The handler receives exactly one terminal callback per
//! association: release, abort, or network error.

use bytes::BytesMut;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::association::{
    any_accepted, negotiate_contexts, read_pdu_from_wire, Association, AssociationParameters,
    Error, Role, SocketOptions,
};
use crate::dimse::{DimseMessage, MessageAssembler};
use crate::pdu::{
    write_pdu, AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRJ,
    AssociationRJResult, AssociationRJServiceProviderAsceReason, AssociationRJServiceUserReason,
    AssociationRJSource, Pdu, PresentationContextProposed, PresentationContextResult,
    UserVariableItem, DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE, PDU_HEADER_SIZE,
};
use vesalius_encoding::transfer_syntax::{
    EXPLICIT_VR_BIG_ENDIAN, EXPLICIT_VR_LITTLE_ENDIAN, IMPLICIT_VR_LITTLE_ENDIAN,
};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

/// How often the accept thread polls for pending connections.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// What the handler wants done with the association
/// after processing a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// keep the association open and wait for the next message
    Continue,
    /// request an orderly release
    Release,
    /// abort the association immediately
    Abort,
}

/// The capability interface invoked by the transport layer
/// for a server-side association.
///
/// One handler instance is created per accepted association
/// (see [`ServerHandlerFactory`]) and dropped when the association
/// reaches a terminal state. Exactly one of [`on_release`],
/// [`on_abort`], or [`on_network_error`] is called per association.
///
/// [`on_release`]: ServerHandler::on_release
/// [`on_abort`]: ServerHandler::on_abort
/// [`on_network_error`]: ServerHandler::on_network_error
pub trait ServerHandler: Send {
    /// Called once after the association is negotiated and
    /// acknowledged, before any message arrives.
    fn on_established(&mut self, _association: &mut Association) {}

    /// Called for each complete DIMSE message.
    ///
    /// The handler may send messages through the association
    /// (for instance a response) and decides whether the
    /// association continues, releases, or aborts.
    fn on_message(
        &mut self,
        association: &mut Association,
        message: DimseMessage,
    ) -> Disposition;

    /// Called when no PDU activity occurred within the configured
    /// read timeout while the association was established.
    ///
    /// Return `true` to keep waiting; the default implementation
    /// returns `false`, which aborts the association.
    fn on_dimse_timeout(&mut self, _association: &mut Association) -> bool {
        false
    }

    /// Terminal callback: the association was released in an
    /// orderly manner.
    fn on_release(&mut self, _parameters: &AssociationParameters) {}

    /// Terminal callback: the association was aborted,
    /// by either side.
    fn on_abort(&mut self, _parameters: &AssociationParameters) {}

    /// Terminal callback: the transport failed.
    fn on_network_error(&mut self, _parameters: &AssociationParameters, _error: &Error) {}
}

/// A factory of per-association handlers.
///
/// Invoked by the listener once for every association it accepts,
/// after negotiation succeeds. Closures of the matching signature
/// implement this trait.
pub trait ServerHandlerFactory: Send + Sync {
    /// Create the handler for a newly established association.
    fn create(&self, parameters: &AssociationParameters) -> Box<dyn ServerHandler>;
}

impl<F> ServerHandlerFactory for F
where
    F: Fn(&AssociationParameters) -> Box<dyn ServerHandler> + Send + Sync,
{
    fn create(&self, parameters: &AssociationParameters) -> Box<dyn ServerHandler> {
        (self)(parameters)
    }
}

/// The negotiation and socket parameters of a registered
/// application entity.
///
/// Unlike client options, a value of this type is reused for every
/// connection accepted on behalf of its application entity.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// the accepted application context name
    application_context_name: String,
    /// the abstract syntaxes this application accepts
    abstract_syntax_uids: Vec<String>,
    /// the transfer syntaxes offered for every abstract syntax
    transfer_syntax_uids: Vec<String>,
    /// the expected protocol version
    protocol_version: u16,
    /// the maximum PDU length this node is willing to receive
    max_pdu_length: u32,
    /// whether to receive PDUs in strict mode
    strict: bool,
    /// options applied to each accepted socket
    socket_options: SocketOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            abstract_syntax_uids: Vec::new(),
            transfer_syntax_uids: Vec::new(),
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            socket_options: SocketOptions::default(),
        }
    }
}

impl ServerOptions {
    /// Create a new set of server options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Include this abstract syntax
    /// in the list of accepted presentation contexts.
    pub fn with_abstract_syntax<T>(mut self, abstract_syntax_uid: T) -> Self
    where
        T: Into<String>,
    {
        self.abstract_syntax_uids.push(abstract_syntax_uid.into());
        self
    }

    /// Offer this transfer syntax in each accepted presentation
    /// context. When no transfer syntax is given, all native
    /// syntaxes of the registry are offered.
    pub fn with_transfer_syntax<T>(mut self, transfer_syntax_uid: T) -> Self
    where
        T: Into<String>,
    {
        self.transfer_syntax_uids.push(transfer_syntax_uid.into());
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

    /// Set the read timeout applied to each accepted socket.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.socket_options.read_timeout = Some(timeout);
        self
    }

    /// Set the write timeout applied to each accepted socket.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.socket_options.write_timeout = Some(timeout);
        self
    }

    /// Disable Nagle's algorithm on each accepted socket
    /// (TCP_NODELAY).
    pub fn disable_nagle(mut self) -> Self {
        self.socket_options.disable_nagle = true;
        self
    }

    fn offered_transfer_syntaxes(&self) -> Vec<String> {
        if self.transfer_syntax_uids.is_empty() {
            vec![
                IMPLICIT_VR_LITTLE_ENDIAN.uid.to_string(),
                EXPLICIT_VR_LITTLE_ENDIAN.uid.to_string(),
                EXPLICIT_VR_BIG_ENDIAN.uid.to_string(),
            ]
        } else {
            self.transfer_syntax_uids.clone()
        }
    }
}

/// One registered application entity on a listener.
#[derive(Clone)]
struct Registration {
    options: ServerOptions,
    factory: Arc<dyn ServerHandlerFactory>,
}

/// The lifecycle of a listener's accept thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerState {
    Starting,
    Started,
    Stopping,
    Stopped,
}

/// A listener bound to one local endpoint,
/// shared by all applications registered on it.
struct ListenerHandle {
    applications: Arc<Mutex<BTreeMap<String, Registration>>>,
    state: Arc<Mutex<ListenerState>>,
    thread: Option<JoinHandle<()>>,
}

/// The process-wide listener registration table.
///
/// The lock is held only for register, unregister, and called-AE
/// lookup; never during per-association I/O.
static LISTENERS: Mutex<BTreeMap<SocketAddr, ListenerHandle>> = Mutex::new(BTreeMap::new());

/// Acquire a mutex without propagating poisoning:
/// a panic on another thread must not wedge the listener table.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Register an application entity under a local endpoint and a
/// called AE title.
///
/// The first registration for an endpoint binds the socket and
/// starts its accept thread; later registrations share it. Returns
/// `false` when the (endpoint, AE title) pair is already taken or
/// the socket could not be bound.
pub fn register<F>(
    local_endpoint: SocketAddr,
    called_ae_title: &str,
    options: ServerOptions,
    factory: F,
) -> bool
where
    F: ServerHandlerFactory + 'static,
{
    let registration = Registration {
        options,
        factory: Arc::new(factory),
    };

    let mut listeners = lock(&LISTENERS);
    match listeners.entry(local_endpoint) {
        Entry::Occupied(entry) => {
            let mut applications = lock(&entry.get().applications);
            if applications.contains_key(called_ae_title) {
                error!(
                    "already listening with AE {} on {}",
                    called_ae_title, local_endpoint
                );
                return false;
            }
            applications.insert(called_ae_title.to_string(), registration);
            info!(
                "listening with AE {} on existing endpoint {}",
                called_ae_title, local_endpoint
            );
            true
        }
        Entry::Vacant(entry) => {
            let state = Arc::new(Mutex::new(ListenerState::Starting));
            let listener = match TcpListener::bind(local_endpoint) {
                Ok(listener) => listener,
                Err(e) => {
                    error!("could not bind listener on {}: {}", local_endpoint, e);
                    return false;
                }
            };
            if let Err(e) = listener.set_nonblocking(true) {
                error!("could not configure listener on {}: {}", local_endpoint, e);
                return false;
            }

            let applications = Arc::new(Mutex::new(BTreeMap::from([(
                called_ae_title.to_string(),
                registration,
            )])));
            *lock(&state) = ListenerState::Started;

            let thread = {
                let applications = Arc::clone(&applications);
                let state = Arc::clone(&state);
                thread::Builder::new()
                    .name(format!("dicom-listen-{}", local_endpoint))
                    .spawn(move || accept_loop(listener, applications, state, local_endpoint))
            };
            let thread = match thread {
                Ok(thread) => thread,
                Err(e) => {
                    error!("could not start accept thread on {}: {}", local_endpoint, e);
                    return false;
                }
            };

            entry.insert(ListenerHandle {
                applications,
                state,
                thread: Some(thread),
            });
            info!(
                "listening with AE {} on endpoint {}",
                called_ae_title, local_endpoint
            );
            true
        }
    }
}

/// Remove the registration of an application entity.
///
/// The last unregistration for an endpoint stops its accept thread
/// and closes the listening socket. Returns `false` when the
/// endpoint or the AE title was not registered.
pub fn unregister(local_endpoint: SocketAddr, called_ae_title: &str) -> bool {
    let mut listeners = lock(&LISTENERS);
    let handle = match listeners.get(&local_endpoint) {
        Some(handle) => handle,
        None => {
            error!("no listener registered on endpoint {}", local_endpoint);
            return false;
        }
    };

    let remaining = {
        let mut applications = lock(&handle.applications);
        if applications.remove(called_ae_title).is_none() {
            error!(
                "AE {} was not registered on endpoint {}",
                called_ae_title, local_endpoint
            );
            return false;
        }
        applications.len()
    };
    info!(
        "no longer listening with AE {} on {}",
        called_ae_title, local_endpoint
    );

    if remaining == 0 {
        if let Some(mut handle) = listeners.remove(&local_endpoint) {
            *lock(&handle.state) = ListenerState::Stopping;
            // join outside the table lock so that registrations on
            // other endpoints are not held up by the stop
            drop(listeners);
            if let Some(thread) = handle.thread.take() {
                let _ = thread.join();
            }
            *lock(&handle.state) = ListenerState::Stopped;
            info!("listener on {} stopped", local_endpoint);
        }
    }
    true
}

/// The accept loop of one listener.
///
/// Polls for pending connections so that the stop request is
/// observed promptly; every accepted connection is served on its
/// own thread and cannot hold up this loop.
fn accept_loop(
    listener: TcpListener,
    applications: Arc<Mutex<BTreeMap<String, Registration>>>,
    state: Arc<Mutex<ListenerState>>,
    local_endpoint: SocketAddr,
) {
    debug!("accept loop on {} running", local_endpoint);
    loop {
        if *lock(&state) != ListenerState::Started {
            break;
        }
        match listener.accept() {
            Ok((socket, peer)) => {
                let applications = Arc::clone(&applications);
                let spawned = thread::Builder::new()
                    .name(format!("dicom-assoc-{}", peer))
                    .spawn(move || serve_connection(socket, applications));
                if let Err(e) = spawned {
                    error!("could not start association thread for {}: {}", peer, e);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("accept failed on {}: {}", local_endpoint, e);
                break;
            }
        }
    }
    debug!("accept loop on {} finished", local_endpoint);
}

/// Send a rejection PDU and close the connection.
fn send_reject(socket: &mut TcpStream, source: AssociationRJSource) {
    let pdu = Pdu::AssociationRJ(AssociationRJ {
        result: AssociationRJResult::Permanent,
        source,
    });
    let mut buffer = Vec::with_capacity(16);
    if write_pdu(&mut buffer, &pdu).is_ok() {
        if let Err(e) = socket.write_all(&buffer) {
            debug!("failed to send rejection PDU: {}", e);
        }
    }
    let _ = socket.shutdown(Shutdown::Both);
}

/// Send an abort PDU and close the connection.
fn send_abort(socket: &mut TcpStream, reason: AbortRQServiceProviderReason) {
    let pdu = Pdu::AbortRQ {
        source: AbortRQSource::ServiceProvider(reason),
    };
    let mut buffer = Vec::with_capacity(16);
    if write_pdu(&mut buffer, &pdu).is_ok() {
        if let Err(e) = socket.write_all(&buffer) {
            debug!("failed to send abort PDU: {}", e);
        }
    }
    let _ = socket.shutdown(Shutdown::Both);
}

/// Serve one accepted connection:
/// read the association request, resolve the called AE title,
/// negotiate, acknowledge, and drive the association to completion.
fn serve_connection(
    mut socket: TcpStream,
    applications: Arc<Mutex<BTreeMap<String, Registration>>>,
) {
    // the listening socket is non-blocking; its children must not be
    if let Err(e) = socket.set_nonblocking(false) {
        debug!("could not configure accepted socket: {}", e);
        return;
    }

    let mut read_buffer = BytesMut::with_capacity((DEFAULT_MAX_PDU + PDU_HEADER_SIZE) as usize);
    // the request may exceed this node's own maximum PDU length
    let msg = match read_pdu_from_wire(&mut socket, &mut read_buffer, MAXIMUM_PDU_SIZE, false) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("could not read association request: {}", e);
            return;
        }
    };
    let rq = match msg {
        Pdu::AssociationRQ(rq) => rq,
        Pdu::Unknown { .. } => {
            warn!("unrecognized PDU while awaiting an association request");
            send_abort(&mut socket, AbortRQServiceProviderReason::UnrecognizedPdu);
            return;
        }
        pdu => {
            warn!(
                "{} while awaiting an association request",
                pdu.short_description()
            );
            send_abort(&mut socket, AbortRQServiceProviderReason::UnexpectedPdu);
            return;
        }
    };

    // the called AE title is resolved before any negotiation
    let registration = lock(&applications).get(&rq.called_ae_title).cloned();
    let Registration { options, factory } = match registration {
        Some(registration) => registration,
        None => {
            warn!(
                "rejecting association from {}: called AE {} not recognized",
                rq.calling_ae_title, rq.called_ae_title
            );
            send_reject(
                &mut socket,
                AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::CalledAETitleNotRecognized,
                ),
            );
            return;
        }
    };

    if rq.protocol_version != options.protocol_version {
        warn!(
            "rejecting association from {}: protocol version {} not supported",
            rq.calling_ae_title, rq.protocol_version
        );
        send_reject(
            &mut socket,
            AssociationRJSource::ServiceProviderAsce(
                AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported,
            ),
        );
        return;
    }
    if rq.application_context_name != options.application_context_name {
        warn!(
            "rejecting association from {}: application context `{}` not supported",
            rq.calling_ae_title, rq.application_context_name
        );
        send_reject(
            &mut socket,
            AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            ),
        );
        return;
    }

    let transfer_syntaxes = options.offered_transfer_syntaxes();
    let supported: Vec<PresentationContextProposed> = options
        .abstract_syntax_uids
        .iter()
        .enumerate()
        .map(|(i, uid)| PresentationContextProposed {
            id: (i as u8) * 2 + 1,
            abstract_syntax: uid.clone(),
            transfer_syntaxes: transfer_syntaxes.clone(),
        })
        .collect();
    let negotiated = negotiate_contexts(&rq.presentation_contexts, &supported);

    if !any_accepted(&negotiated) {
        warn!(
            "rejecting association from {}: no presentation context accepted",
            rq.calling_ae_title
        );
        send_reject(
            &mut socket,
            AssociationRJSource::ServiceProviderAsce(
                AssociationRJServiceProviderAsceReason::NoReasonGiven,
            ),
        );
        return;
    }

    if let Err(e) = configure_socket(&socket, &options.socket_options) {
        error!("could not configure accepted socket: {}", e);
        let _ = socket.shutdown(Shutdown::Both);
        return;
    }

    let peer_max_pdu_length = rq
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

    let ac = Pdu::AssociationAC(AssociationAC {
        protocol_version: options.protocol_version,
        calling_ae_title: rq.calling_ae_title.clone(),
        called_ae_title: rq.called_ae_title.clone(),
        application_context_name: rq.application_context_name,
        presentation_contexts: negotiated
            .iter()
            .map(|pc| PresentationContextResult {
                id: pc.id,
                reason: pc.reason.clone(),
                transfer_syntax: pc.transfer_syntax.clone(),
            })
            .collect(),
        user_variables: vec![
            UserVariableItem::MaxLength(options.max_pdu_length),
            UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ],
    });
    let mut write_buffer = Vec::with_capacity((DEFAULT_MAX_PDU + PDU_HEADER_SIZE) as usize);
    if let Err(e) = write_pdu(&mut write_buffer, &ac) {
        error!("could not encode association acknowledgement: {}", e);
        let _ = socket.shutdown(Shutdown::Both);
        return;
    }
    if let Err(e) = socket.write_all(&write_buffer) {
        debug!("could not send association acknowledgement: {}", e);
        return;
    }

    let params = AssociationParameters {
        calling_ae_title: rq.calling_ae_title,
        called_ae_title: rq.called_ae_title,
        local_endpoint: socket.local_addr().ok(),
        remote_endpoint: socket.peer_addr().ok(),
        presentation_contexts: negotiated,
        max_pdu_length: options.max_pdu_length,
        peer_max_pdu_length,
        socket_options: options.socket_options,
    };
    info!(
        "association established: {} -> {} ({:?})",
        params.calling_ae_title, params.called_ae_title, params.remote_endpoint
    );

    let association = Association::new(socket, Role::Acceptor, params, options.strict, read_buffer);
    let handler = factory.create(association.parameters());
    run_association(association, handler);
}

fn configure_socket(socket: &TcpStream, options: &SocketOptions) -> std::io::Result<()> {
    socket.set_read_timeout(options.read_timeout)?;
    socket.set_write_timeout(options.write_timeout)?;
    if options.disable_nagle {
        socket.set_nodelay(true)?;
    }
    Ok(())
}

/// How the association ended, for the terminal handler callback.
enum Outcome {
    Released,
    Aborted,
    TransportError(Error),
}

/// Drive an established association until a terminal state,
/// delivering reassembled DIMSE messages to the handler.
///
/// Exactly one terminal callback is issued no matter how the
/// association ends.
fn run_association(mut association: Association, mut handler: Box<dyn ServerHandler>) {
    handler.on_established(&mut association);
    let mut assembler = MessageAssembler::new(association.presentation_contexts());

    let outcome = 'run: loop {
        match association.receive() {
            Ok(Pdu::PData { data }) => {
                for pdv in data {
                    match assembler.offer(pdv) {
                        Ok(Some(message)) => {
                            match handler.on_message(&mut association, message) {
                                Disposition::Continue => {}
                                Disposition::Release => {
                                    break 'run match association.release() {
                                        Ok(()) => Outcome::Released,
                                        Err(Error::Aborted { .. }) => Outcome::Aborted,
                                        Err(e) => Outcome::TransportError(e),
                                    };
                                }
                                Disposition::Abort => {
                                    let _ = association.abort();
                                    break 'run Outcome::Aborted;
                                }
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!("message reassembly failed: {}", e);
                            let _ = association.abort();
                            break 'run Outcome::Aborted;
                        }
                    }
                }
            }
            Ok(Pdu::ReleaseRQ) => {
                let _ = association.send(&Pdu::ReleaseRP);
                break Outcome::Released;
            }
            Ok(Pdu::AbortRQ { .. }) => break Outcome::Aborted,
            Ok(pdu) => {
                warn!("unhandled {} during data transfer", pdu.short_description());
                let _ = association.abort();
                break Outcome::Aborted;
            }
            Err(Error::Timeout { .. }) => {
                if handler.on_dimse_timeout(&mut association) {
                    continue;
                }
                let _ = association.abort();
                break Outcome::Aborted;
            }
            // the engine already aborted on the protocol violation
            Err(Error::UnexpectedPdu { .. }) | Err(Error::UnknownPdu { .. }) => {
                break Outcome::Aborted;
            }
            Err(e) => break Outcome::TransportError(e),
        }
    };

    let params = association.parameters();
    match outcome {
        Outcome::Released => {
            info!(
                "association released: {} -> {}",
                params.calling_ae_title, params.called_ae_title
            );
            handler.on_release(params);
        }
        Outcome::Aborted => {
            info!(
                "association aborted: {} -> {}",
                params.calling_ae_title, params.called_ae_title
            );
            handler.on_abort(params);
        }
        Outcome::TransportError(e) => {
            warn!(
                "association transport failure: {} -> {}: {}",
                params.calling_ae_title, params.called_ae_title, e
            );
            handler.on_network_error(params, &e);
        }
    }
}
