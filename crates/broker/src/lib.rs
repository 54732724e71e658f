//! Core of the signature broker.
//!
//! Client applications never talk to a signing backend directly. They open a
//! transaction here, the user picks a certificate provider in the browser,
//! and the application then asks the broker to sign one document or a whole
//! batch. Everything between those calls lives in a session, and documents
//! in flight live in a two-tier temporary store that lets any node of a
//! cluster pick up a transaction another node started.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                            │
//! │   (envelope checks, app / certificate validation, errors)    │
//! ├──────────────────────────────────────────────────────────────┤
//! │                    Operation managers                        │
//! │   SIGN · RECOVER_* · CREATE_BATCH · ADD_DOCUMENT · SIGN_BATCH │
//! ├───────────────┬────────────────────┬────────────────────────┤
//! │ SessionStore  │ TempDocumentStore  │ BatchOrchestrator      │
//! │ (locks, keys) │ (moka + shared)    │ (per-document states)  │
//! ├───────────────┴────────────────────┴────────────────────────┤
//! │  sigbroker-storage: MemoryBackend | FsBackend (shared dir)   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use sigbroker::{
//!     BrokerConfig, BrokerContext, Dispatcher, InboundRequest, RequestParameters,
//!     signer::SigningBackend,
//! };
//!
//! # async fn run(signer: Arc<dyn SigningBackend>) -> Result<(), Box<dyn std::error::Error>> {
//! let context = BrokerContext::builder()
//!     .config(BrokerConfig::builder().build()?)
//!     .signer(signer)
//!     .build()
//!     .await?;
//! let dispatcher = Dispatcher::new(Arc::new(context));
//!
//! let params: RequestParameters = [
//!     ("appId", "APP1"),
//!     ("operation", "create_batch"),
//!     ("cop", "sign"),
//!     ("algorithm", "SHA256withRSA"),
//!     ("format", "CAdES"),
//! ]
//! .into_iter()
//! .collect();
//! let response = dispatcher.dispatch(InboundRequest::new(params)).await?;
//! # let _ = response;
//! # Ok(())
//! # }
//! ```
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module with a scripted signer,
//!   in-memory audit and alarm sinks, and a fully wired test broker.
//! - **`failpoints`**: Activates `fail` injection points in the audit sink
//!   and the purge worker.

#![deny(unsafe_code)]

pub mod alarms;
pub mod audit;
pub mod batch;
pub mod browser;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod documents;
pub mod error;
pub mod ids;
mod managers;
pub mod operation;
pub mod origin;
pub mod request;
pub mod response;
pub mod retrieve;
pub mod session;
pub mod signer;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod testutil;
pub mod validation;

pub use alarms::{Alarm, AlarmNotifier, TracingAlarmNotifier};
pub use audit::{AuditRecord, AuditRecorder, AuditSink, FileAuditSink};
pub use config::BrokerConfig;
pub use context::BrokerContext;
pub use dispatcher::Dispatcher;
pub use error::{BrokerError, BrokerResult, ErrorKind, FireError};
pub use operation::Operation;
pub use request::{InboundRequest, RequestParameters};
pub use response::FireResponse;
pub use retrieve::RetrieveError;
pub use signer::{SignParameters, SigningBackend, SigningFailure};
