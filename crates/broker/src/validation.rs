//! Application and client-certificate validation.
//!
//! The dispatcher consults an [`ApplicationRegistry`] when application checks
//! are enabled and a [`CertificateValidator`] when certificate checks are
//! enabled. Both are traits so a deployment can back them with its own
//! datastore; [`StaticApplicationRegistry`] implements both from
//! configuration.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{config::ApplicationConfig, error::FireError};

/// Tag byte of a DER `SEQUENCE`, the outer element of every X.509 certificate.
const DER_SEQUENCE: u8 = 0x30;

/// Errors raised while validating an application or client certificate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ValidationError {
    /// The application id is not registered.
    #[error("unknown application {app_id}")]
    UnknownApplication {
        /// The rejected application id.
        app_id: String,
    },

    /// The application is registered but disabled.
    #[error("application {app_id} is disabled")]
    DisabledApplication {
        /// The rejected application id.
        app_id: String,
    },

    /// No client certificate was presented.
    #[error("no client certificate presented")]
    CertificateNeeded,

    /// A presented certificate could not be decoded.
    #[error("invalid client certificate: {reason}")]
    CertificateInvalid {
        /// Why decoding failed.
        reason: String,
    },

    /// None of the presented certificates is registered for the application.
    #[error("client certificate not trusted for application")]
    CertificateNotTrusted,

    /// The validation datastore could not be reached.
    #[error("validation datastore unavailable: {message}")]
    Datastore {
        /// Description of the failure.
        message: String,
    },
}

impl ValidationError {
    /// Returns `true` if the datastore, not the request, is at fault.
    #[must_use]
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Datastore { .. })
    }

    /// Protocol error reported for this failure.
    #[must_use]
    pub fn fire_error(&self) -> FireError {
        match self {
            Self::UnknownApplication { .. } | Self::DisabledApplication { .. } => {
                FireError::Unauthorized
            },
            Self::CertificateNeeded => FireError::CertificateNeeded,
            Self::CertificateInvalid { .. } => FireError::CertificateInvalid,
            Self::CertificateNotTrusted => FireError::CertificateNotTrusted,
            Self::Datastore { .. } => FireError::InternalError,
        }
    }
}

/// Resolves application ids to active applications.
#[async_trait]
pub trait ApplicationRegistry: Send + Sync {
    /// Returns the application name if `app_id` names an active application.
    async fn check_application(&self, app_id: &str) -> Result<String, ValidationError>;
}

#[async_trait]
impl<R: ApplicationRegistry + ?Sized> ApplicationRegistry for Arc<R> {
    async fn check_application(&self, app_id: &str) -> Result<String, ValidationError> {
        (**self).check_application(app_id).await
    }
}

/// Decides whether presented client certificates are trusted for an application.
#[async_trait]
pub trait CertificateValidator: Send + Sync {
    /// Succeeds if at least one DER certificate in `certificates` is trusted for `app_id`.
    async fn check_certificate(
        &self,
        app_id: &str,
        certificates: &[Vec<u8>],
    ) -> Result<(), ValidationError>;
}

#[async_trait]
impl<V: CertificateValidator + ?Sized> CertificateValidator for Arc<V> {
    async fn check_certificate(
        &self,
        app_id: &str,
        certificates: &[Vec<u8>],
    ) -> Result<(), ValidationError> {
        (**self).check_certificate(app_id, certificates).await
    }
}

/// SHA-256 fingerprint of a DER certificate as lowercase hex.
#[must_use]
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Normalizes a configured fingerprint: strips separators and lowercases.
fn normalize_fingerprint(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_hexdigit()).map(|c| c.to_ascii_lowercase()).collect()
}

#[derive(Debug, Clone)]
struct RegisteredApplication {
    name: String,
    enabled: bool,
    fingerprints: Vec<String>,
}

/// Application registry and certificate validator backed by configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticApplicationRegistry {
    applications: HashMap<String, RegisteredApplication>,
}

impl StaticApplicationRegistry {
    /// Builds the registry from configured applications.
    #[must_use]
    pub fn new(applications: &[ApplicationConfig]) -> Self {
        let applications = applications
            .iter()
            .map(|app| {
                let registered = RegisteredApplication {
                    name: app.name.clone(),
                    enabled: app.enabled,
                    fingerprints: app
                        .certificates
                        .iter()
                        .map(|f| normalize_fingerprint(f))
                        .collect(),
                };
                (app.id.clone(), registered)
            })
            .collect();
        Self { applications }
    }

    fn lookup(&self, app_id: &str) -> Result<&RegisteredApplication, ValidationError> {
        let app = self
            .applications
            .get(app_id)
            .ok_or_else(|| ValidationError::UnknownApplication { app_id: app_id.to_owned() })?;
        if !app.enabled {
            return Err(ValidationError::DisabledApplication { app_id: app_id.to_owned() });
        }
        Ok(app)
    }
}

#[async_trait]
impl ApplicationRegistry for StaticApplicationRegistry {
    async fn check_application(&self, app_id: &str) -> Result<String, ValidationError> {
        self.lookup(app_id).map(|app| app.name.clone())
    }
}

#[async_trait]
impl CertificateValidator for StaticApplicationRegistry {
    async fn check_certificate(
        &self,
        app_id: &str,
        certificates: &[Vec<u8>],
    ) -> Result<(), ValidationError> {
        if certificates.is_empty() {
            return Err(ValidationError::CertificateNeeded);
        }
        for der in certificates {
            if der.first() != Some(&DER_SEQUENCE) {
                return Err(ValidationError::CertificateInvalid {
                    reason: "not a DER encoded certificate".into(),
                });
            }
        }
        let app = self.lookup(app_id).map_err(|_| ValidationError::CertificateNotTrusted)?;
        let trusted = certificates
            .iter()
            .map(|der| fingerprint(der))
            .any(|presented| app.fingerprints.iter().any(|f| *f == presented));
        if trusted { Ok(()) } else { Err(ValidationError::CertificateNotTrusted) }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn cert(tag: u8) -> Vec<u8> {
        vec![DER_SEQUENCE, 0x03, tag, tag, tag]
    }

    fn registry() -> StaticApplicationRegistry {
        let colon_separated = fingerprint(&cert(1))
            .to_uppercase()
            .as_bytes()
            .chunks(2)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect::<Vec<_>>()
            .join(":");
        StaticApplicationRegistry::new(&[
            ApplicationConfig::builder()
                .id("APP1")
                .name("Portal")
                .certificates(vec![colon_separated])
                .build(),
            ApplicationConfig::builder().id("OLD").name("Legacy").enabled(false).build(),
        ])
    }

    #[tokio::test]
    async fn known_application_resolves_name() {
        assert_eq!(registry().check_application("APP1").await.unwrap(), "Portal");
    }

    #[tokio::test]
    async fn unknown_and_disabled_applications_are_unauthorized() {
        let registry = registry();
        let unknown = registry.check_application("NOPE").await.unwrap_err();
        let disabled = registry.check_application("OLD").await.unwrap_err();
        assert_eq!(unknown.fire_error(), FireError::Unauthorized);
        assert_eq!(disabled.fire_error(), FireError::Unauthorized);
        assert!(!unknown.is_infrastructure());
    }

    #[tokio::test]
    async fn trusted_certificate_passes() {
        registry().check_certificate("APP1", &[cert(9), cert(1)]).await.unwrap();
    }

    #[tokio::test]
    async fn certificate_errors_are_distinct() {
        let registry = registry();
        assert_eq!(
            registry.check_certificate("APP1", &[]).await.unwrap_err(),
            ValidationError::CertificateNeeded
        );
        assert!(matches!(
            registry.check_certificate("APP1", &[b"garbage".to_vec()]).await.unwrap_err(),
            ValidationError::CertificateInvalid { .. }
        ));
        assert_eq!(
            registry.check_certificate("APP1", &[cert(2)]).await.unwrap_err(),
            ValidationError::CertificateNotTrusted
        );
    }

    #[test]
    fn datastore_failure_is_infrastructure() {
        let err = ValidationError::Datastore { message: "refused".into() };
        assert!(err.is_infrastructure());
        assert_eq!(err.fire_error(), FireError::InternalError);
    }
}
