//! This crate contains the types and methods needed to interact
//! with DICOM nodes through the upper layer protocol.
//!
//! - The [`address`] module
//!   provides an abstraction for working with compound addresses
//!   referring to application entities in a network.
//! - The [`pdu`] module
//!   provides data structures representing _protocol data units_,
//!   which are passed around as part of the DICOM network
//!   communication support, as well as readers and writers for them.
//! - The [`machine`] module
//!   holds the association state machine: the lifecycle states and
//!   the PDU legality and transition tables.
//! - The [`association`] module
//!   comprises abstractions for establishing and negotiating
//!   associations between application entities over TCP,
//!   and the established [`Association`] engine itself.
//! - The [`dimse`] module
//!   provides DIMSE message types and the fragment reassembler.
//! - The [`server`] module
//!   provides the listener subsystem: application entities register
//!   a handler under a local endpoint and a called AE title, and
//!   every accepted connection is served on its own thread.
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod address;
pub mod association;
pub mod dimse;
pub mod machine;
pub mod pdu;
pub mod server;

/// The current implementation class UID generically referring to
/// the Vesalius tool kit.
///
/// This UID may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.305828676556193373053589769418266461235";

/// The current implementation version name generically referring to
/// the Vesalius tool kit.
///
/// This name may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_VERSION_NAME: &str = "Vesalius 0.1.0";

// re-exports

pub use address::AeAddr;
pub use association::client::ClientAssociationOptions;
pub use association::{Association, AssociationParameters, Role};
pub use dimse::DimseMessage;
pub use machine::AssociationState;
pub use pdu::read_pdu;
pub use pdu::write_pdu;
pub use pdu::Pdu;
pub use server::{register, unregister, ServerHandler, ServerOptions};
