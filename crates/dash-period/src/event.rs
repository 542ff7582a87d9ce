use std::{fmt, sync::Arc};

use url::Url;

use crate::error::DashError;

/// Kind of data carried by a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Manifest,
    TimeSynchronization,
    MediaInitialization,
    Media,
    Unknown,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Manifest => "manifest",
            Self::TimeSynchronization => "time-synchronization",
            Self::MediaInitialization => "media-initialization",
            Self::Media => "media",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Timing and transfer metadata attached to every load notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadEventInfo {
    pub uri: Url,
    pub data_type: DataType,
    /// Elapsed realtime at which the event happened.
    pub elapsed_realtime_ms: i64,
    /// Time spent on the current attempt so far.
    pub load_duration_ms: i64,
    pub bytes_loaded: u64,
}

/// Observer of network loads issued by a session.
///
/// Every method defaults to a no-op. Notifications are delivered on the session's
/// owner, in order.
pub trait MediaSourceEventListener: Send + Sync {
    fn on_load_started(&self, _uri: &Url, _data_type: DataType, _elapsed_realtime_ms: i64) {}

    fn on_load_completed(&self, _info: &LoadEventInfo) {}

    fn on_load_canceled(&self, _info: &LoadEventInfo) {}

    fn on_load_error(&self, _info: &LoadEventInfo, _error: &DashError, _is_fatal: bool) {}
}

/// Fans load notifications out to tracing and to an optional listener.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    listener: Option<Arc<dyn MediaSourceEventListener>>,
}

impl EventDispatcher {
    pub fn new(listener: Option<Arc<dyn MediaSourceEventListener>>) -> Self {
        Self { listener }
    }

    pub fn load_started(&self, uri: &Url, data_type: DataType, elapsed_realtime_ms: i64) {
        tracing::debug!(%uri, %data_type, elapsed_realtime_ms, "Load started");
        if let Some(listener) = &self.listener {
            listener.on_load_started(uri, data_type, elapsed_realtime_ms);
        }
    }

    pub fn load_completed(&self, info: &LoadEventInfo) {
        tracing::debug!(
            uri = %info.uri,
            data_type = %info.data_type,
            bytes = info.bytes_loaded,
            duration_ms = info.load_duration_ms,
            "Load completed"
        );
        if let Some(listener) = &self.listener {
            listener.on_load_completed(info);
        }
    }

    pub fn load_canceled(&self, info: &LoadEventInfo) {
        tracing::debug!(
            uri = %info.uri,
            data_type = %info.data_type,
            bytes = info.bytes_loaded,
            duration_ms = info.load_duration_ms,
            "Load canceled"
        );
        if let Some(listener) = &self.listener {
            listener.on_load_canceled(info);
        }
    }

    pub fn load_error(&self, info: &LoadEventInfo, error: &DashError, is_fatal: bool) {
        tracing::warn!(
            uri = %info.uri,
            data_type = %info.data_type,
            bytes = info.bytes_loaded,
            duration_ms = info.load_duration_ms,
            is_fatal,
            "Load error: {error}"
        );
        if let Some(listener) = &self.listener {
            listener.on_load_error(info, error, is_fatal);
        }
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}
