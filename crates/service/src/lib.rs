//! HTTP surface of the signature broker.
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `/fireService` | Signature protocol, served by [`Dispatcher`](sigbroker::Dispatcher) |
//! | `/chooseOrigin` | Browser step between transaction creation and signing |
//! | `/retrieveService` | One-shot retrieval of temporary documents, polled cross-origin |
//! | `/health` | Liveness of the broker and its shared store |
//!
//! Signing is delegated to a remote gateway through [`RemoteSigningBackend`].

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod remote_signer;
pub mod server;

pub use config::ServiceConfig;
pub use error::ServiceError;
pub use remote_signer::RemoteSigningBackend;
pub use server::{create_router, run};
