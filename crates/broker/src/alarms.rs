//! Operational alarms.
//!
//! Alarms notify operators of infrastructure problems independently of the
//! response sent to any single client. They are raised alongside, never
//! instead of, the user-facing error.

use std::{fmt, sync::Arc};

/// Kind of operational alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Alarm {
    /// The application or certificate datastore could not be reached.
    ConnectionDb,
    /// Configuration is invalid.
    ResourceConfig,
    /// A required resource (configuration file, directory) is missing.
    ResourceNotFound,
    /// The shared high-availability store failed.
    SharedStore,
}

impl Alarm {
    /// Stable identifier used in alarm events.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionDb => "connection_db",
            Self::ResourceConfig => "resource_config",
            Self::ResourceNotFound => "resource_not_found",
            Self::SharedStore => "shared_store",
        }
    }
}

impl fmt::Display for Alarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination for operational alarms.
///
/// Implementations must not block for long: alarms are raised on the request
/// path.
pub trait AlarmNotifier: Send + Sync {
    /// Raises an alarm with a short free-form detail.
    fn notify(&self, alarm: Alarm, detail: &str);
}

impl<N: AlarmNotifier + ?Sized> AlarmNotifier for Arc<N> {
    fn notify(&self, alarm: Alarm, detail: &str) {
        (**self).notify(alarm, detail);
    }
}

/// Alarm notifier that emits `error` level `tracing` events.
///
/// Field mapping:
/// - `alarm.kind`: the alarm identifier (e.g. `"shared_store"`)
/// - `alarm.detail`: free-form detail
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlarmNotifier;

impl AlarmNotifier for TracingAlarmNotifier {
    fn notify(&self, alarm: Alarm, detail: &str) {
        tracing::error!(alarm.kind = %alarm, alarm.detail = %detail, "operational_alarm");
    }
}
