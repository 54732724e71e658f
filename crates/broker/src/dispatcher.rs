//! Request dispatcher.
//!
//! The single entry point of the protocol. [`Dispatcher::dispatch`] checks
//! the request envelope in a fixed order, stopping at the first failure:
//!
//! 1. the broker context is available (lazily loaded on first use)
//! 2. `appId` is present
//! 3. the application is known and active, when application checks are on
//! 4. a trusted client certificate was presented, when certificate checks are on
//! 5. `operation` is present and names a supported operation
//!
//! It then runs the operation manager on its own task, so a client that
//! disconnects mid-request does not cancel a session mutation halfway.
//! Every [`BrokerError`] is mapped to a [`FireError`] exactly once, here.

use std::{future::Future, pin::Pin, sync::Arc};

use bytes::Bytes;
use tokio::sync::OnceCell;
use tracing::Instrument;

use crate::{
    alarms::{Alarm, AlarmNotifier, TracingAlarmNotifier},
    context::BrokerContext,
    error::{BrokerError, BrokerResult, ErrorKind, FireError},
    managers::{self, Caller},
    operation::Operation,
    origin::{self, OriginChosen},
    request::{InboundRequest, RequestParameters, params},
    response::FireResponse,
    retrieve::{self, RetrieveError},
    validation::ValidationError,
};

/// Future produced by a [`ContextLoader`].
pub type ContextFuture = Pin<Box<dyn Future<Output = BrokerResult<BrokerContext>> + Send>>;

/// Builds the broker context on first use.
pub type ContextLoader = Box<dyn Fn() -> ContextFuture + Send + Sync>;

/// Routes protocol requests to the operation managers.
pub struct Dispatcher {
    context: OnceCell<Arc<BrokerContext>>,
    loader: Option<ContextLoader>,
    alarms: Arc<dyn AlarmNotifier>,
}

impl Dispatcher {
    /// Creates a dispatcher over an already built context.
    pub fn new(context: Arc<BrokerContext>) -> Self {
        let alarms = Arc::clone(context.alarms());
        Self { context: OnceCell::new_with(Some(context)), loader: None, alarms }
    }

    /// Creates a dispatcher that builds its context on the first request.
    ///
    /// A failed load is retried on the next request.
    pub fn lazy<F, Fut>(loader: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BrokerResult<BrokerContext>> + Send + 'static,
    {
        let loader: ContextLoader = Box::new(move || Box::pin(loader()));
        Self {
            context: OnceCell::new(),
            loader: Some(loader),
            alarms: Arc::new(TracingAlarmNotifier),
        }
    }

    /// Replaces the notifier used for alarms raised before a context exists.
    #[must_use]
    pub fn with_alarms(mut self, alarms: Arc<dyn AlarmNotifier>) -> Self {
        self.alarms = alarms;
        self
    }

    /// Returns the context, loading it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`FireError::InternalError`] if the context cannot be loaded.
    pub async fn context(&self) -> Result<&Arc<BrokerContext>, FireError> {
        let result = self
            .context
            .get_or_try_init(|| async {
                match &self.loader {
                    Some(loader) => loader().await.map(Arc::new),
                    None => Err(BrokerError::internal("no broker context loader")),
                }
            })
            .await;
        result.map_err(|err| {
            tracing::error!(error = %err, "broker context unavailable");
            self.alarms.notify(Alarm::ResourceConfig, &err.to_string());
            FireError::InternalError
        })
    }

    /// Returns the context if it has already been loaded.
    #[must_use]
    pub fn loaded_context(&self) -> Option<&Arc<BrokerContext>> {
        self.context.get()
    }

    /// Handles one protocol request.
    ///
    /// # Errors
    ///
    /// Returns the protocol error to report to the client.
    pub async fn dispatch(&self, request: InboundRequest) -> Result<FireResponse, FireError> {
        let span = tracing::info_span!(
            "dispatch",
            app_id = request.params.get(params::APP_ID).unwrap_or("-"),
            transaction_id = request.params.get(params::TRANSACTION_ID).unwrap_or("-"),
        );
        self.dispatch_inner(request).instrument(span).await
    }

    async fn dispatch_inner(&self, request: InboundRequest) -> Result<FireResponse, FireError> {
        let context = Arc::clone(self.context().await?);

        let Some(app_id) = request.params.get(params::APP_ID).map(str::to_owned) else {
            tracing::warn!("request without application id");
            return Err(FireError::ParameterAppIdNeeded);
        };
        let app_name = check_application(&context, &app_id).await?;
        if context.config().check_certificate() {
            let checked = match request.decode_certificates() {
                Ok(certificates) => {
                    context.certificates().check_certificate(&app_id, &certificates).await
                },
                Err(err) => Err(err),
            };
            if let Err(err) = checked {
                return Err(validation_failure(&context, &err));
            }
        }

        let Some(operation) = request.params.get(params::OPERATION) else {
            tracing::warn!("request without operation");
            return Err(FireError::ParameterOperationNeeded);
        };
        let operation: Operation = operation.parse().map_err(|err| {
            tracing::warn!(error = %err, "unsupported operation");
            FireError::ParameterOperationNotSupported
        })?;

        let caller = Caller { app_id, app_name };
        let task = tokio::spawn(
            managers::run(Arc::clone(&context), operation, caller, request)
                .instrument(tracing::Span::current()),
        );
        match task.await {
            Ok(Ok(response)) => {
                tracing::debug!(operation = %operation, "operation completed");
                Ok(response)
            },
            Ok(Err(err)) => Err(classify(&context, operation, &err)),
            Err(join_err) => {
                tracing::error!(operation = %operation, error = %join_err, "operation task failed");
                Err(FireError::InternalError)
            },
        }
    }

    /// Handles the choose-origin step of a transaction.
    ///
    /// # Errors
    ///
    /// Returns the protocol error to report to the user.
    pub async fn choose_origin(&self, request: InboundRequest) -> Result<OriginChosen, FireError> {
        let span = tracing::info_span!(
            "choose_origin",
            transaction_id = request.params.get(params::TRANSACTION_ID).unwrap_or("-"),
        );
        async {
            let context = self.context().await?;
            origin::choose_origin(context, &request)
                .await
                .map_err(|err| classify(context, Operation::Other, &err))
        }
        .instrument(span)
        .await
    }

    /// Handles the document retrieval sub-protocol.
    ///
    /// # Errors
    ///
    /// Returns the error line to send back.
    pub async fn retrieve(&self, params: &RequestParameters) -> Result<Bytes, RetrieveError> {
        let context = self.context().await.map_err(|_| RetrieveError::InvalidData)?;
        retrieve::retrieve(context.documents(), params).await
    }
}

async fn check_application(
    context: &BrokerContext,
    app_id: &str,
) -> Result<Option<String>, FireError> {
    if !context.config().check_application() {
        return Ok(None);
    }
    match context.applications().check_application(app_id).await {
        Ok(name) => Ok(Some(name)),
        Err(err) => Err(validation_failure(context, &err)),
    }
}

fn validation_failure(context: &BrokerContext, err: &ValidationError) -> FireError {
    if err.is_infrastructure() {
        tracing::error!(error = %err, "validation datastore unavailable");
        context.alarms().notify(Alarm::ConnectionDb, &err.to_string());
        return FireError::InternalError;
    }
    tracing::error!(error = %err, "request rejected");
    err.fire_error()
}

/// Logs `err` at the severity of its kind, raises its alarm, and maps it.
fn classify(context: &BrokerContext, operation: Operation, err: &BrokerError) -> FireError {
    match err.kind() {
        ErrorKind::Request => {
            tracing::warn!(operation = %operation, error = %err, "request failed");
        },
        ErrorKind::Authorization => {
            tracing::error!(operation = %operation, error = %err, "request not authorized");
        },
        ErrorKind::Infrastructure => {
            tracing::error!(operation = %operation, error = %err, "infrastructure failure");
            if let Some(alarm) = err.alarm() {
                context.alarms().notify(alarm, &err.to_string());
            }
        },
        ErrorKind::Internal => {
            tracing::warn!(operation = %operation, error = %err, "unexpected operation failure");
        },
    }
    err.to_fire()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        config::{ApplicationConfig, BrokerConfig},
        testutil::{MemoryAlarmNotifier, ScriptedSigner},
    };

    async fn dispatcher(config: BrokerConfig) -> (Dispatcher, Arc<MemoryAlarmNotifier>) {
        let alarms = Arc::new(MemoryAlarmNotifier::new());
        let context = BrokerContext::builder()
            .config(config)
            .signer(Arc::new(ScriptedSigner::new()))
            .alarms(alarms.clone())
            .build()
            .await
            .unwrap();
        (Dispatcher::new(Arc::new(context)), alarms)
    }

    fn request(pairs: &[(&str, &str)]) -> InboundRequest {
        InboundRequest::new(pairs.iter().copied().collect())
    }

    #[tokio::test]
    async fn missing_app_id_fails_first() {
        let (d, _) = dispatcher(BrokerConfig::builder().build().unwrap()).await;
        let err = d.dispatch(request(&[("operation", "sign")])).await.unwrap_err();
        assert_eq!(err, FireError::ParameterAppIdNeeded);
    }

    #[tokio::test]
    async fn operation_is_required_and_parsed() {
        let (d, _) = dispatcher(BrokerConfig::builder().build().unwrap()).await;
        let err = d.dispatch(request(&[("appId", "APP1")])).await.unwrap_err();
        assert_eq!(err, FireError::ParameterOperationNeeded);
        let err =
            d.dispatch(request(&[("appId", "APP1"), ("operation", "fly")])).await.unwrap_err();
        assert_eq!(err, FireError::ParameterOperationNotSupported);
        let err =
            d.dispatch(request(&[("appId", "APP1"), ("operation", "other")])).await.unwrap_err();
        assert_eq!(err, FireError::ParameterOperationNotSupported);
    }

    #[tokio::test]
    async fn unknown_application_is_unauthorized() {
        let config = BrokerConfig::builder()
            .check_application(true)
            .applications(vec![ApplicationConfig::builder().id("APP1").name("One").build()])
            .build()
            .unwrap();
        let (d, alarms) = dispatcher(config).await;
        let err =
            d.dispatch(request(&[("appId", "NOPE"), ("operation", "sign")])).await.unwrap_err();
        assert_eq!(err, FireError::Unauthorized);
        assert!(alarms.raised().is_empty());
    }

    #[tokio::test]
    async fn certificate_is_required_when_checked() {
        let config = BrokerConfig::builder()
            .check_certificate(true)
            .applications(vec![ApplicationConfig::builder().id("APP1").name("One").build()])
            .build()
            .unwrap();
        let (d, _) = dispatcher(config).await;
        let err =
            d.dispatch(request(&[("appId", "APP1"), ("operation", "sign")])).await.unwrap_err();
        assert_eq!(err, FireError::CertificateNeeded);
    }

    #[tokio::test]
    async fn undecodable_certificate_is_invalid_when_checked() {
        let config = BrokerConfig::builder()
            .check_certificate(true)
            .applications(vec![ApplicationConfig::builder().id("APP1").name("One").build()])
            .build()
            .unwrap();
        let (d, _) = dispatcher(config).await;
        let req = request(&[("appId", "APP1"), ("operation", "sign")]).with_certificate("%%%");
        assert_eq!(d.dispatch(req).await.unwrap_err(), FireError::CertificateInvalid);

        let req = request(&[("operation", "sign")]).with_certificate("%%%");
        assert_eq!(d.dispatch(req).await.unwrap_err(), FireError::ParameterAppIdNeeded);
    }

    #[tokio::test]
    async fn certificates_are_ignored_when_unchecked() {
        let (d, _) = dispatcher(BrokerConfig::builder().build().unwrap()).await;
        let req = request(&[("appId", "APP1")]).with_certificate("%%%not-base64");
        assert_eq!(d.dispatch(req).await.unwrap_err(), FireError::ParameterOperationNeeded);
    }

    #[tokio::test]
    async fn failed_lazy_load_is_internal_error_with_alarm() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let alarms = Arc::new(MemoryAlarmNotifier::new());
        let d = Dispatcher::lazy(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(BrokerError::internal("config missing")) }
        })
        .with_alarms(alarms.clone());

        let err = d.dispatch(request(&[("appId", "APP1")])).await.unwrap_err();
        assert_eq!(err, FireError::InternalError);
        let _ = d.dispatch(request(&[("appId", "APP1")])).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(alarms.raised()[0].0, Alarm::ResourceConfig);
    }

    #[tokio::test]
    async fn lazy_load_happens_once() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let d = Dispatcher::lazy(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                BrokerContext::builder()
                    .config(BrokerConfig::builder().build()?)
                    .signer(Arc::new(ScriptedSigner::new()))
                    .build()
                    .await
            }
        });
        for _ in 0..3 {
            let err = d.dispatch(request(&[("operation", "sign")])).await.unwrap_err();
            assert_eq!(err, FireError::ParameterAppIdNeeded);
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn manager_request_errors_pass_through() {
        let (d, _) = dispatcher(BrokerConfig::builder().build().unwrap()).await;
        let err = d
            .dispatch(request(&[("appId", "APP1"), ("operation", "recover_sign")]))
            .await
            .unwrap_err();
        assert_eq!(err, FireError::ParameterTransactionIdNeeded);
    }
}
