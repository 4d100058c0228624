//! # tidesync Protocol
//!
//! Operation payloads, session fingerprints and sync envelopes for
//! tidesync.
//!
//! This crate defines what travels between the engine and its transport
//! collaborators: opaque graph-query [`Operation`]s, the deterministic
//! session [`Fingerprint`] that keys persisted sync bookkeeping, the
//! response envelopes carrying decomposed records for the normalized
//! cache, and the **structured** conflict indicator a transport must
//! return when a conditional write is rejected (never an error-message
//! substring).

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod fingerprint;
mod message;
mod operation;

pub use conflict::ConflictState;
pub use fingerprint::Fingerprint;
pub use message::{AttachmentDescriptor, MutationResponse, QueryResponse, SubscriptionMessage};
pub use operation::{Operation, OperationKind};
