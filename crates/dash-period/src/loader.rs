//! Retrying background loads whose outcomes are posted back to a single owner.
//!
//! Each [`Loader::start_loading`] spawns a tokio task running one
//! [`ParsingLoadable`]. Completions and errors are wrapped into the owner's message
//! type and sent over an unbounded channel; an error carries a oneshot reply through
//! which the owner answers with a [`LoadErrorAction`], so the retry decision is
//! always taken by the owner.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::BytesMut;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    clock::Clock,
    error::{DashError, DashResult},
    event::{DataType, LoadEventInfo},
    upstream::DataSource,
};

/// Turns the body of a load into a value.
pub trait Parser<T>: Send + Sync {
    fn parse(&self, uri: &Url, data: &[u8]) -> DashResult<T>;
}

/// Reads a whole URI through a [`DataSource`] and parses it.
pub struct ParsingLoadable<T> {
    data_source: Arc<dyn DataSource>,
    uri: Url,
    data_type: DataType,
    parser: Arc<dyn Parser<T>>,
}

impl<T> ParsingLoadable<T> {
    pub fn new(
        data_source: Arc<dyn DataSource>,
        uri: Url,
        data_type: DataType,
        parser: Arc<dyn Parser<T>>,
    ) -> Self {
        Self {
            data_source,
            uri,
            data_type,
            parser,
        }
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    async fn load(&self, bytes_loaded: &AtomicU64) -> DashResult<T> {
        let mut stream = self.data_source.open(&self.uri).await?;
        let mut data = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            bytes_loaded.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            data.extend_from_slice(&chunk);
        }
        self.parser.parse(&self.uri, &data)
    }
}

/// Answer of the owner to a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadErrorAction {
    Retry,
    DontRetry,
    DontRetryFatal,
}

impl LoadErrorAction {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DontRetryFatal)
    }
}

pub enum LoaderEvent<T> {
    Completed {
        result: T,
        info: LoadEventInfo,
    },
    Error {
        error: Arc<DashError>,
        /// Number of failed attempts so far, starting at 1.
        error_count: u32,
        /// Whether `error_count` went past the retry budget of the load.
        retries_exhausted: bool,
        info: LoadEventInfo,
        reply: oneshot::Sender<LoadErrorAction>,
    },
}

/// Delay before the next attempt after `error_count` failures.
pub fn retry_delay(error_count: u32) -> Duration {
    let millis = (error_count.saturating_sub(1) as u64 * 1000).min(5000);
    Duration::from_millis(millis)
}

struct InFlight {
    uri: Url,
    data_type: DataType,
    started_ms: i64,
    bytes_loaded: Arc<AtomicU64>,
}

type InFlightLoads = Arc<Mutex<HashMap<u64, InFlight>>>;

pub struct Loader<M> {
    sender: mpsc::UnboundedSender<M>,
    clock: Arc<dyn Clock>,
    token: CancellationToken,
    in_flight: InFlightLoads,
    next_id: AtomicU64,
}

impl<M: Send + 'static> Loader<M> {
    pub fn new(sender: mpsc::UnboundedSender<M>, clock: Arc<dyn Clock>) -> Self {
        Self {
            sender,
            clock,
            token: CancellationToken::new(),
            in_flight: Default::default(),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight
            .lock()
            .map(|loads| !loads.is_empty())
            .unwrap_or_default()
    }

    /// Spawns `loadable` and returns the elapsed realtime at which it started.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_loading<T, F>(
        &self,
        loadable: ParsingLoadable<T>,
        min_retry_count: u32,
        wrap: F,
    ) -> i64
    where
        T: Send + 'static,
        F: Fn(LoaderEvent<T>) -> M + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let start_ms = self.clock.elapsed_realtime_ms();
        let bytes_loaded = Arc::new(AtomicU64::new(0));
        if let Ok(mut loads) = self.in_flight.lock() {
            loads.insert(
                id,
                InFlight {
                    uri: loadable.uri.clone(),
                    data_type: loadable.data_type,
                    started_ms: start_ms,
                    bytes_loaded: bytes_loaded.clone(),
                },
            );
        }

        let task = LoadTask {
            id,
            loadable,
            min_retry_count,
            bytes_loaded,
            sender: self.sender.clone(),
            clock: self.clock.clone(),
            token: self.token.clone(),
            in_flight: self.in_flight.clone(),
        };
        tokio::spawn(task.run(start_ms, wrap));

        start_ms
    }

    /// Cancels every load and returns what the canceled ones had achieved.
    pub fn release(&self) -> Vec<LoadEventInfo> {
        self.token.cancel();

        let now = self.clock.elapsed_realtime_ms();
        let Ok(mut loads) = self.in_flight.lock() else {
            return Vec::new();
        };
        let mut canceled: Vec<_> = loads.drain().collect();
        canceled.sort_by_key(|(id, _)| *id);
        canceled
            .into_iter()
            .map(|(_, load)| LoadEventInfo {
                uri: load.uri,
                data_type: load.data_type,
                elapsed_realtime_ms: now,
                load_duration_ms: now - load.started_ms,
                bytes_loaded: load.bytes_loaded.load(Ordering::Relaxed),
            })
            .collect()
    }
}

impl<M> Drop for Loader<M> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct LoadTask<T, M> {
    id: u64,
    loadable: ParsingLoadable<T>,
    min_retry_count: u32,
    bytes_loaded: Arc<AtomicU64>,
    sender: mpsc::UnboundedSender<M>,
    clock: Arc<dyn Clock>,
    token: CancellationToken,
    in_flight: InFlightLoads,
}

impl<T, M> LoadTask<T, M>
where
    T: Send + 'static,
    M: Send + 'static,
{
    async fn run<F>(self, start_ms: i64, wrap: F)
    where
        F: Fn(LoaderEvent<T>) -> M,
    {
        let mut error_count = 0;

        loop {
            let result = tokio::select! {
                biased;
                _ = self.token.cancelled() => return,
                result = self.loadable.load(&self.bytes_loaded) => result,
            };
            // durations cover every attempt of the load
            let info = self.event_info(start_ms);

            let error = match result {
                Ok(result) => {
                    // A load already reported as canceled must not complete.
                    if self.finish() {
                        _ = self.sender.send(wrap(LoaderEvent::Completed { result, info }));
                    }
                    return;
                }
                Err(error) => error,
            };

            error_count += 1;
            let (reply, answer) = oneshot::channel();
            let event = LoaderEvent::Error {
                error: Arc::new(error),
                error_count,
                retries_exhausted: error_count > self.min_retry_count,
                info,
                reply,
            };
            if self.sender.send(wrap(event)).is_err() {
                self.finish();
                return;
            }

            let action = tokio::select! {
                biased;
                _ = self.token.cancelled() => return,
                action = answer => action.unwrap_or(LoadErrorAction::DontRetry),
            };
            if action != LoadErrorAction::Retry {
                self.finish();
                return;
            }

            let delay = retry_delay(error_count);
            tracing::warn!(
                uri = %self.loadable.uri,
                error_count,
                delay_ms = delay.as_millis() as u64,
                "Retrying load"
            );
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            self.bytes_loaded.store(0, Ordering::Relaxed);
        }
    }

    fn event_info(&self, started_ms: i64) -> LoadEventInfo {
        let now = self.clock.elapsed_realtime_ms();
        LoadEventInfo {
            uri: self.loadable.uri.clone(),
            data_type: self.loadable.data_type,
            elapsed_realtime_ms: now,
            load_duration_ms: now - started_ms,
            bytes_loaded: self.bytes_loaded.load(Ordering::Relaxed),
        }
    }

    /// Removes the load from the in-flight set, returning whether it was still there.
    fn finish(&self) -> bool {
        self.in_flight
            .lock()
            .map(|mut loads| loads.remove(&self.id).is_some())
            .unwrap_or_default()
    }
}
