//! End-to-end loopback tests:
//! a registered listener on 127.0.0.1 serving echo associations,
//! exercised by a requester in the same process.

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use vesalius_ul::association::client::ClientAssociationOptions;
use vesalius_ul::association::{Association, AssociationParameters, Error};
use vesalius_ul::dimse::{self, DimseMessage};
use vesalius_ul::pdu::{AssociationRJServiceUserReason, AssociationRJSource};
use vesalius_ul::server::{self, Disposition, ServerHandler, ServerOptions};

const VERIFICATION: &str = "1.2.840.10008.1.1";
const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

/// Grab a free local endpoint for a test listener.
fn free_endpoint() -> SocketAddr {
    let probe = TcpListener::bind("127.0.0.1:0").expect("probe bind");
    let endpoint = probe.local_addr().expect("probe local addr");
    drop(probe);
    endpoint
}

/// Poll a condition for up to five seconds.
fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[derive(Default)]
struct Counters {
    released: AtomicUsize,
    aborted: AtomicUsize,
    errors: AtomicUsize,
}

impl Counters {
    fn terminal_total(&self) -> usize {
        self.released.load(Ordering::SeqCst)
            + self.aborted.load(Ordering::SeqCst)
            + self.errors.load(Ordering::SeqCst)
    }
}

/// Responds to C-ECHO requests and counts terminal callbacks.
struct EchoHandler {
    counters: Arc<Counters>,
}

impl ServerHandler for EchoHandler {
    fn on_message(
        &mut self,
        association: &mut Association,
        message: DimseMessage,
    ) -> Disposition {
        if message.command_field() == Some(dimse::C_ECHO_RQ) {
            let message_id = message.message_id().unwrap_or(0);
            let response = DimseMessage::new(
                message.presentation_context_id,
                dimse::commands::echo_rsp(message_id, dimse::STATUS_SUCCESS),
            );
            if association.send_message(&response).is_err() {
                return Disposition::Abort;
            }
        }
        Disposition::Continue
    }

    fn on_release(&mut self, _parameters: &AssociationParameters) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }

    fn on_abort(&mut self, _parameters: &AssociationParameters) {
        self.counters.aborted.fetch_add(1, Ordering::SeqCst);
    }

    fn on_network_error(&mut self, _parameters: &AssociationParameters, _error: &Error) {
        self.counters.errors.fetch_add(1, Ordering::SeqCst);
    }
}

fn register_echo(endpoint: SocketAddr, ae_title: &str) -> Arc<Counters> {
    let counters = Arc::new(Counters::default());
    let shared = Arc::clone(&counters);
    let registered = server::register(
        endpoint,
        ae_title,
        ServerOptions::new()
            .with_abstract_syntax(VERIFICATION)
            .read_timeout(Duration::from_secs(5)),
        move |_: &AssociationParameters| -> Box<dyn ServerHandler> {
            Box::new(EchoHandler {
                counters: Arc::clone(&shared),
            })
        },
    );
    assert!(registered, "registration failed on {}", endpoint);
    counters
}

fn echo_client(endpoint: SocketAddr, called_ae_title: &str) -> Result<Association, Error> {
    ClientAssociationOptions::new()
        .calling_ae_title("ECHO-SCU")
        .called_ae_title(called_ae_title.to_string())
        .with_presentation_context(VERIFICATION, vec![IMPLICIT_VR_LE])
        .read_timeout(Duration::from_secs(5))
        .establish(endpoint)
}

#[test]
fn echo_round_trip_and_release() {
    let endpoint = free_endpoint();
    let counters = register_echo(endpoint, "ECHO-SCP");

    let mut association = echo_client(endpoint, "ECHO-SCP").expect("association");
    let pc_id = association.presentation_contexts()[0].id;

    association
        .send_message(&DimseMessage::new(pc_id, dimse::commands::echo_rq(17)))
        .expect("send echo request");
    let response = association.receive_message().expect("echo response");
    assert_eq!(response.command_field(), Some(dimse::C_ECHO_RSP));
    assert_eq!(response.message_id_being_responded_to(), Some(17));
    assert_eq!(response.status(), Some(dimse::STATUS_SUCCESS));
    assert_eq!(response.data, None);

    association.release().expect("orderly release");
    assert!(wait_until(|| counters.released.load(Ordering::SeqCst) == 1));
    assert_eq!(counters.terminal_total(), 1);

    assert!(server::unregister(endpoint, "ECHO-SCP"));
}

#[test]
fn unknown_called_ae_title_is_rejected() {
    let endpoint = free_endpoint();
    let _counters = register_echo(endpoint, "KNOWN-SCP");

    let outcome = echo_client(endpoint, "NOWHERE");
    match outcome {
        Err(Error::Rejected { association_rj, .. }) => {
            assert!(matches!(
                association_rj.source,
                AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::CalledAETitleNotRecognized,
                )
            ));
        }
        Err(e) => panic!("expected a rejection, got {}", e),
        Ok(_) => panic!("expected a rejection, got an association"),
    }

    assert!(server::unregister(endpoint, "KNOWN-SCP"));
}

#[test]
fn unsupported_abstract_syntax_rejects_the_association() {
    let endpoint = free_endpoint();
    let _counters = register_echo(endpoint, "ECHO-SCP");

    // secondary capture storage, which the echo service does not accept
    let outcome = ClientAssociationOptions::new()
        .called_ae_title("ECHO-SCP")
        .with_presentation_context("1.2.840.10008.5.1.4.1.1.7", vec![IMPLICIT_VR_LE])
        .read_timeout(Duration::from_secs(5))
        .establish(endpoint);
    assert!(
        matches!(outcome, Err(Error::Rejected { .. })),
        "a proposal with no acceptable context must reject the whole association",
    );

    assert!(server::unregister(endpoint, "ECHO-SCP"));
}

#[test]
fn negotiation_prefers_the_first_proposed_transfer_syntax() {
    let endpoint = free_endpoint();
    let _counters = register_echo(endpoint, "ECHO-SCP");

    let mut association = ClientAssociationOptions::new()
        .called_ae_title("ECHO-SCP")
        .with_presentation_context(VERIFICATION, vec![EXPLICIT_VR_LE, IMPLICIT_VR_LE])
        .read_timeout(Duration::from_secs(5))
        .establish(endpoint)
        .expect("association");

    let contexts = association.presentation_contexts();
    assert_eq!(contexts.len(), 1);
    assert_eq!(contexts[0].transfer_syntax, EXPLICIT_VR_LE);

    association.release().expect("orderly release");
    assert!(server::unregister(endpoint, "ECHO-SCP"));
}

#[test]
fn repeated_abort_notifies_the_handler_exactly_once() {
    let endpoint = free_endpoint();
    let counters = register_echo(endpoint, "ECHO-SCP");

    let mut association = echo_client(endpoint, "ECHO-SCP").expect("association");
    association.abort().expect("abort");
    // a second abort is a no-op on the closed association
    association.abort().expect("repeated abort");
    assert!(association.is_closed());

    assert!(wait_until(|| counters.aborted.load(Ordering::SeqCst) == 1));
    // give a duplicate notification a chance to surface
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(counters.aborted.load(Ordering::SeqCst), 1);
    assert_eq!(counters.terminal_total(), 1);

    assert!(server::unregister(endpoint, "ECHO-SCP"));
}

#[test]
fn listeners_are_shared_and_reference_counted() {
    let endpoint = free_endpoint();
    let _first = register_echo(endpoint, "FIRST-SCP");
    let _second = register_echo(endpoint, "SECOND-SCP");

    // the pair (endpoint, AE title) may only be taken once
    assert!(!server::register(
        endpoint,
        "FIRST-SCP",
        ServerOptions::new().with_abstract_syntax(VERIFICATION),
        move |_: &AssociationParameters| -> Box<dyn ServerHandler> {
            unreachable!("a duplicate registration must not accept connections")
        },
    ));

    // removing one application keeps the shared socket alive
    assert!(server::unregister(endpoint, "FIRST-SCP"));
    let mut association = echo_client(endpoint, "SECOND-SCP").expect("association");
    association.release().expect("orderly release");

    // the last unregistration closes the socket
    assert!(server::unregister(endpoint, "SECOND-SCP"));
    assert!(!server::unregister(endpoint, "SECOND-SCP"));
    assert!(matches!(
        echo_client(endpoint, "SECOND-SCP"),
        Err(Error::Connect { .. })
    ));
}
