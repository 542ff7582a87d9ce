//! Single-period DASH media source.
//!
//! [`DashMediaSource`] loads the manifest, optionally synchronizes with the server
//! clock, exposes the track groups of the first period and keeps one sample stream
//! per selected track group. Live manifests are refreshed in the background.
//!
//! Everything happens on the owner of the source: background loads and timers only
//! post messages, which are handled by [`DashMediaSource::process_next`] or
//! [`DashMediaSource::process_pending`].

mod streams;

use std::{sync::Arc, time::Duration};

use tokio::{sync::mpsc, task::JoinHandle};
use url::Url;

pub use streams::SampleStreamId;
use streams::StreamSet;

use crate::{
    chunk::{
        AdaptiveEvaluator, ChunkSourceFactory, ChunkSourceParams, ContinueLoadingNotifier,
        SampleStream, SampleStreamFactory, SampleStreamParams, SequenceableLoader,
    },
    clock::{Clock, SystemClock},
    config::{DashPeriodConfig, MANIFEST_REFRESH_FLOOR_MS, UTC_TIMING_RETRY_COUNT},
    error::{DashError, DashResult},
    event::{DataType, EventDispatcher, MediaSourceEventListener},
    loader::{LoadErrorAction, Loader, LoaderEvent, Parser, ParsingLoadable},
    manifest::{Manifest, MpdParser, UtcTiming},
    timing::{resolve_direct, Iso8601Parser, UtcTimingScheme, XsDateTimeParser},
    track::{TrackGroup, TrackSelection, TrackTopology},
    upstream::{Allocator, BandwidthMeter, DataSource, DataSourceFactory, DefaultBandwidthMeter},
};

/// Receives the session milestones, on the owner of the source.
pub trait PeriodCallback: Send + Sync {
    fn on_period_prepared(&self);

    /// The buffering scheduler should call
    /// [`DashMediaSource::continue_loading`] again.
    fn on_continue_loading_requested(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodState {
    Idle,
    LoadingManifest,
    SyncingClock,
    Prepared,
    RefreshScheduled,
    Failed,
    Released,
}

enum PeriodMessage {
    Manifest(LoaderEvent<Manifest>),
    UtcTiming(LoaderEvent<i64>),
    RefreshManifest,
    ContinueLoadingRequested,
}

/// Resources living from `prepare` to `release`.
struct Session {
    callback: Arc<dyn PeriodCallback>,
    allocator: Arc<dyn Allocator>,
    loader: Loader<PeriodMessage>,
    sender: mpsc::UnboundedSender<PeriodMessage>,
    receiver: mpsc::UnboundedReceiver<PeriodMessage>,
    manifest_data_source: Arc<dyn DataSource>,
}

struct PendingRefresh {
    handle: JoinHandle<()>,
    delay: Duration,
}

/// Delay before the manifest loaded at `load_start_ms` should be refreshed.
///
/// A `min_update_period_ms` of zero means "as often as possible", which is capped
/// to [`MANIFEST_REFRESH_FLOOR_MS`].
pub fn manifest_refresh_delay(load_start_ms: i64, min_update_period_ms: u64, now_ms: i64) -> u64 {
    let min_update_period_ms = match min_update_period_ms {
        0 => MANIFEST_REFRESH_FLOOR_MS,
        period => period,
    };
    let next_load_ms = load_start_ms.saturating_add(min_update_period_ms as i64);
    next_load_ms.saturating_sub(now_ms).max(0) as u64
}

pub struct DashMediaSource {
    manifest_uri: Url,
    config: DashPeriodConfig,
    data_source_factory: Arc<dyn DataSourceFactory>,
    chunk_source_factory: Arc<dyn ChunkSourceFactory>,
    sample_stream_factory: Arc<dyn SampleStreamFactory>,
    manifest_parser: Arc<dyn Parser<Manifest>>,
    bandwidth_meter: Arc<dyn BandwidthMeter>,
    clock: Arc<dyn Clock>,
    event_dispatcher: EventDispatcher,

    state: PeriodState,
    prepared: bool,
    session: Option<Session>,
    manifest: Option<Arc<Manifest>>,
    manifest_load_start_ms: i64,
    manifest_load_end_ms: i64,
    elapsed_realtime_offset_ms: i64,
    duration_us: Option<i64>,
    topology: TrackTopology,
    streams: StreamSet,
    refresh: Option<PendingRefresh>,
    fatal_error: Option<Arc<DashError>>,
}

impl DashMediaSource {
    pub fn new(
        manifest_uri: Url,
        data_source_factory: Arc<dyn DataSourceFactory>,
        chunk_source_factory: Arc<dyn ChunkSourceFactory>,
        sample_stream_factory: Arc<dyn SampleStreamFactory>,
    ) -> Self {
        Self {
            manifest_uri,
            config: DashPeriodConfig::default(),
            data_source_factory,
            chunk_source_factory,
            sample_stream_factory,
            manifest_parser: Arc::new(MpdParser),
            bandwidth_meter: Arc::new(DefaultBandwidthMeter::new()),
            clock: Arc::new(SystemClock::new()),
            event_dispatcher: EventDispatcher::default(),

            state: PeriodState::Idle,
            prepared: false,
            session: None,
            manifest: None,
            manifest_load_start_ms: 0,
            manifest_load_end_ms: 0,
            elapsed_realtime_offset_ms: 0,
            duration_us: None,
            topology: TrackTopology::default(),
            streams: StreamSet::default(),
            refresh: None,
            fatal_error: None,
        }
    }

    pub fn with_config(mut self, config: DashPeriodConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_event_listener(mut self, listener: Arc<dyn MediaSourceEventListener>) -> Self {
        self.event_dispatcher = EventDispatcher::new(Some(listener));
        self
    }

    pub fn with_bandwidth_meter(mut self, bandwidth_meter: Arc<dyn BandwidthMeter>) -> Self {
        self.bandwidth_meter = bandwidth_meter;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_manifest_parser(mut self, parser: Arc<dyn Parser<Manifest>>) -> Self {
        self.manifest_parser = parser;
        self
    }

    /// Starts loading the manifest. Must be called from within a tokio runtime.
    pub fn prepare(
        &mut self,
        callback: Arc<dyn PeriodCallback>,
        allocator: Arc<dyn Allocator>,
        position_us: i64,
    ) -> DashResult<()> {
        if !matches!(self.state, PeriodState::Idle | PeriodState::Released) {
            return Err(DashError::AlreadyPrepared);
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        self.session = Some(Session {
            callback,
            allocator,
            loader: Loader::new(sender.clone(), self.clock.clone()),
            sender,
            receiver,
            manifest_data_source: self.data_source_factory.create_data_source(None),
        });

        tracing::info!(uri = %self.manifest_uri, position_us, "Preparing period");
        self.start_loading_manifest();
        Ok(())
    }

    /// Returns the error that stopped the manifest from loading, if any.
    pub fn maybe_throw_prepare_error(&self) -> DashResult<()> {
        match &self.fatal_error {
            Some(error) => Err(DashError::LoadFailed(error.clone())),
            None => Ok(()),
        }
    }

    pub fn state(&self) -> PeriodState {
        self.state
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Duration of the period, unknown for live presentations.
    pub fn duration_us(&self) -> Option<i64> {
        self.duration_us
    }

    pub fn track_groups(&self) -> &[TrackGroup] {
        self.topology.groups()
    }

    pub fn track_topology(&self) -> &TrackTopology {
        &self.topology
    }

    pub fn manifest(&self) -> Option<&Arc<Manifest>> {
        self.manifest.as_ref()
    }

    /// URI the next manifest load will target.
    pub fn manifest_uri(&self) -> &Url {
        &self.manifest_uri
    }

    pub fn elapsed_realtime_offset_ms(&self) -> i64 {
        self.elapsed_realtime_offset_ms
    }

    /// Clock that timestamps loads and that the server clock offset applies to.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Delay of the scheduled manifest refresh, while it has not fired yet.
    pub fn pending_refresh_delay(&self) -> Option<Duration> {
        self.refresh
            .as_ref()
            .filter(|refresh| !refresh.handle.is_finished())
            .map(|refresh| refresh.delay)
    }

    pub fn period_count(&self) -> usize {
        1
    }

    /// Sample streams of this source never report discontinuities.
    pub fn read_discontinuity(&self) -> Option<i64> {
        None
    }

    /// Replaces the sample streams of `old_streams` by streams of `new_selections`.
    ///
    /// An active stream with the same selection as one of `new_selections` is
    /// released as well, and a fresh stream takes its place.
    ///
    /// Returns the handles of the new streams, in the order of `new_selections`.
    /// Nothing changes when an error is returned.
    pub fn select_tracks(
        &mut self,
        old_streams: &[SampleStreamId],
        new_selections: &[TrackSelection],
        position_us: i64,
    ) -> DashResult<Vec<SampleStreamId>> {
        let (Some(session), Some(manifest)) = (&self.session, &self.manifest) else {
            return Err(DashError::NotPrepared);
        };
        if !self.prepared {
            return Err(DashError::NotPrepared);
        }
        if let Some(id) = old_streams.iter().find(|id| !self.streams.contains(**id)) {
            return Err(DashError::UnknownSampleStream(*id));
        }
        for selection in new_selections {
            self.topology.validate(selection)?;
        }

        let mut created = Vec::with_capacity(new_selections.len());
        for selection in new_selections {
            let stream = self.build_sample_stream(session, manifest, selection, position_us)?;
            created.push((selection.clone(), stream));
        }

        // An active stream matching a new selection is replaced, never reused.
        let mut dropped = old_streams.to_vec();
        dropped.extend(
            self.streams
                .matching(new_selections)
                .filter(|id| !old_streams.contains(id)),
        );
        self.streams.release(&dropped);
        let ids = created
            .into_iter()
            .map(|(selection, stream)| self.streams.push(selection, stream))
            .collect::<Vec<_>>();
        tracing::debug!(
            released = dropped.len(),
            created = ids.len(),
            active = self.streams.len(),
            "Track selection updated"
        );
        Ok(ids)
    }

    fn build_sample_stream(
        &self,
        session: &Session,
        manifest: &Arc<Manifest>,
        selection: &TrackSelection,
        position_us: i64,
    ) -> DashResult<Box<dyn SampleStream>> {
        let invalid = || DashError::InvalidSelection(format!("group {}", selection.group));
        let track_group = self.topology.group(selection.group).ok_or_else(invalid)?;
        let adaptation_set_index = self
            .topology
            .adaptation_set_index(selection.group)
            .ok_or_else(invalid)?;

        let data_source = self
            .data_source_factory
            .create_data_source(Some(self.bandwidth_meter.clone()));
        let adaptive_evaluator = selection
            .is_adaptive()
            .then(|| AdaptiveEvaluator::new(self.bandwidth_meter.clone()));
        let chunk_source = self
            .chunk_source_factory
            .create_chunk_source(ChunkSourceParams {
                manifest: manifest.clone(),
                adaptation_set_index,
                track_group: track_group.clone(),
                selected_tracks: selection.tracks.clone(),
                data_source,
                adaptive_evaluator,
                elapsed_realtime_offset_ms: self.elapsed_realtime_offset_ms,
                clock: self.clock.clone(),
            });

        let sender = session.sender.clone();
        let continue_loading = ContinueLoadingNotifier::new(move || {
            _ = sender.send(PeriodMessage::ContinueLoadingRequested);
        });
        Ok(self
            .sample_stream_factory
            .create_sample_stream(SampleStreamParams {
                track_type: track_group.track_type,
                chunk_source,
                allocator: session.allocator.clone(),
                position_us,
                min_loadable_retry_count: self.config.min_loadable_retry_count,
                event_dispatcher: self.event_dispatcher.clone(),
                continue_loading,
            }))
    }

    pub fn sample_stream_ids(&self) -> Vec<SampleStreamId> {
        self.streams.ids().collect()
    }

    pub fn selection(&self, id: SampleStreamId) -> Option<&TrackSelection> {
        self.streams.selection(id)
    }

    pub fn sample_stream(&self, id: SampleStreamId) -> Option<&dyn SampleStream> {
        self.streams.get(id)
    }

    pub fn sample_stream_mut(
        &mut self,
        id: SampleStreamId,
    ) -> Option<&mut (dyn SampleStream + 'static)> {
        self.streams.get_mut(id)
    }

    pub fn continue_loading(&mut self, position_us: i64) -> bool {
        self.streams.loader().continue_loading(position_us)
    }

    pub fn next_load_position_us(&self) -> i64 {
        self.streams.next_load_position_us()
    }

    pub fn buffered_position_us(&self) -> i64 {
        self.streams.buffered_position_us()
    }

    pub fn seek_to_us(&mut self, position_us: i64) -> i64 {
        self.streams.seek_to_us(position_us);
        position_us
    }

    /// Cancels every load and the pending refresh, then releases all sample streams.
    ///
    /// Messages posted by loads that were still running are never handled.
    pub fn release(&mut self) {
        if let Some(refresh) = self.refresh.take() {
            refresh.handle.abort();
        }
        if let Some(session) = self.session.take() {
            for info in session.loader.release() {
                self.event_dispatcher.load_canceled(&info);
            }
        }
        self.streams.release_all();

        self.prepared = false;
        self.manifest = None;
        self.manifest_load_start_ms = 0;
        self.manifest_load_end_ms = 0;
        self.elapsed_realtime_offset_ms = 0;
        self.duration_us = None;
        self.topology = TrackTopology::default();
        self.fatal_error = None;
        self.state = PeriodState::Released;
        tracing::info!(uri = %self.manifest_uri, "Period released");
    }

    /// Waits for the next message and handles it.
    ///
    /// Returns `false` once the source has no session anymore.
    pub async fn process_next(&mut self) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        let Some(message) = session.receiver.recv().await else {
            return false;
        };
        self.handle_message(message);
        true
    }

    /// Handles the messages already queued and returns how many there were.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Some(message) = self
            .session
            .as_mut()
            .and_then(|session| session.receiver.try_recv().ok())
        {
            self.handle_message(message);
            handled += 1;
        }
        handled
    }

    /// Handles messages until the period is prepared or preparation failed.
    pub async fn run_until_prepared(&mut self) -> DashResult<()> {
        loop {
            if self.prepared {
                return Ok(());
            }
            self.maybe_throw_prepare_error()?;
            if !self.process_next().await {
                return Err(DashError::NotPrepared);
            }
        }
    }

    fn handle_message(&mut self, message: PeriodMessage) {
        match message {
            PeriodMessage::Manifest(event) => self.on_manifest_event(event),
            PeriodMessage::UtcTiming(event) => self.on_utc_timing_event(event),
            PeriodMessage::RefreshManifest => {
                self.refresh = None;
                if self.state == PeriodState::RefreshScheduled {
                    self.start_loading_manifest();
                }
            }
            PeriodMessage::ContinueLoadingRequested => {
                if let Some(session) = &self.session {
                    session.callback.on_continue_loading_requested();
                }
            }
        }
    }

    fn start_loading_manifest(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        let loadable = ParsingLoadable::new(
            session.manifest_data_source.clone(),
            self.manifest_uri.clone(),
            DataType::Manifest,
            self.manifest_parser.clone(),
        );
        let started_ms = session.loader.start_loading(
            loadable,
            self.config.min_loadable_retry_count,
            PeriodMessage::Manifest,
        );
        self.event_dispatcher
            .load_started(&self.manifest_uri, DataType::Manifest, started_ms);
        self.state = PeriodState::LoadingManifest;
    }

    fn on_manifest_event(&mut self, event: LoaderEvent<Manifest>) {
        match event {
            LoaderEvent::Completed { result, info } => {
                self.event_dispatcher.load_completed(&info);
                self.manifest_load_end_ms = info.elapsed_realtime_ms;
                self.manifest_load_start_ms = info.elapsed_realtime_ms - info.load_duration_ms;
                self.on_manifest_loaded(Arc::new(result));
            }
            LoaderEvent::Error {
                error,
                error_count,
                retries_exhausted,
                info,
                reply,
            } => {
                let action = if error.is_parse_failure() || retries_exhausted {
                    LoadErrorAction::DontRetryFatal
                } else {
                    LoadErrorAction::Retry
                };
                self.event_dispatcher
                    .load_error(&info, &error, action.is_fatal());
                _ = reply.send(action);

                if action.is_fatal() {
                    let error = if error.is_parse_failure() {
                        error
                    } else {
                        Arc::new(DashError::RetriesExhausted {
                            attempts: error_count,
                            source: error,
                        })
                    };
                    self.fail(error);
                }
            }
        }
    }

    fn on_manifest_loaded(&mut self, manifest: Arc<Manifest>) {
        if let Some(location) = &manifest.location {
            if *location != self.manifest_uri {
                tracing::info!(from = %self.manifest_uri, to = %location, "Manifest relocated");
                self.manifest_uri = location.clone();
            }
        }
        self.manifest = Some(manifest.clone());

        if self.prepared {
            self.streams.update_manifest(&manifest);
            if let Some(session) = &self.session {
                session.callback.on_continue_loading_requested();
            }
            self.state = PeriodState::Prepared;
            self.schedule_manifest_refresh();
            return;
        }

        self.duration_us = if manifest.dynamic {
            None
        } else {
            manifest.period_duration_us(0)
        };
        self.topology = manifest
            .period(0)
            .map(TrackTopology::build)
            .unwrap_or_default();
        tracing::debug!(
            dynamic = manifest.dynamic,
            track_groups = self.topology.len(),
            "Manifest loaded"
        );

        match &manifest.utc_timing {
            Some(timing) => self.resolve_utc_timing(timing),
            None => self.finish_prepare(),
        }
    }

    fn resolve_utc_timing(&mut self, timing: &UtcTiming) {
        self.state = PeriodState::SyncingClock;
        match UtcTimingScheme::from(timing) {
            UtcTimingScheme::Direct => match resolve_direct(timing, self.manifest_load_end_ms) {
                Ok(offset) => self.on_utc_timestamp_resolved(offset),
                Err(e) => self.on_utc_timestamp_resolution_error(&e),
            },
            UtcTimingScheme::HttpIso8601 => {
                self.resolve_utc_timing_http(timing, Arc::new(Iso8601Parser))
            }
            UtcTimingScheme::HttpXsDate => {
                self.resolve_utc_timing_http(timing, Arc::new(XsDateTimeParser))
            }
            UtcTimingScheme::Unsupported(scheme) => {
                self.on_utc_timestamp_resolution_error(&DashError::InvalidTimingSchema(scheme))
            }
        }
    }

    fn resolve_utc_timing_http(&mut self, timing: &UtcTiming, parser: Arc<dyn Parser<i64>>) {
        let uri = match self.manifest_uri.join(timing.value.trim()) {
            Ok(uri) => uri,
            Err(e) => return self.on_utc_timestamp_resolution_error(&DashError::from(e)),
        };
        let Some(session) = &self.session else {
            return;
        };

        let loadable = ParsingLoadable::new(
            session.manifest_data_source.clone(),
            uri.clone(),
            DataType::TimeSynchronization,
            parser,
        );
        let started_ms =
            session
                .loader
                .start_loading(loadable, UTC_TIMING_RETRY_COUNT, PeriodMessage::UtcTiming);
        self.event_dispatcher
            .load_started(&uri, DataType::TimeSynchronization, started_ms);
    }

    fn on_utc_timing_event(&mut self, event: LoaderEvent<i64>) {
        if self.state != PeriodState::SyncingClock {
            return;
        }
        match event {
            LoaderEvent::Completed { result, info } => {
                self.event_dispatcher.load_completed(&info);
                self.on_utc_timestamp_resolved(result - info.elapsed_realtime_ms);
            }
            LoaderEvent::Error {
                error, info, reply, ..
            } => {
                let action = LoadErrorAction::DontRetry;
                self.event_dispatcher
                    .load_error(&info, &error, action.is_fatal());
                _ = reply.send(action);
                self.on_utc_timestamp_resolution_error(&error);
            }
        }
    }

    fn on_utc_timestamp_resolved(&mut self, elapsed_realtime_offset_ms: i64) {
        tracing::info!(
            offset_milliseconds = elapsed_realtime_offset_ms,
            "Server clock synchronized"
        );
        self.elapsed_realtime_offset_ms = elapsed_realtime_offset_ms;
        self.finish_prepare();
    }

    fn on_utc_timestamp_resolution_error(&mut self, error: &DashError) {
        tracing::warn!("Failed to resolve UtcTiming element: {error}");
        // Keep going with the device clock.
        self.finish_prepare();
    }

    fn finish_prepare(&mut self) {
        self.prepared = true;
        self.state = PeriodState::Prepared;
        tracing::info!(
            track_groups = self.topology.len(),
            duration_us = ?self.duration_us,
            "Period prepared"
        );
        if let Some(session) = &self.session {
            session.callback.on_period_prepared();
        }
        self.schedule_manifest_refresh();
    }

    fn schedule_manifest_refresh(&mut self) {
        let Some(manifest) = &self.manifest else {
            return;
        };
        if !manifest.dynamic {
            return;
        }
        let Some(session) = &self.session else {
            return;
        };

        let delay = Duration::from_millis(manifest_refresh_delay(
            self.manifest_load_start_ms,
            manifest.min_update_period_ms,
            self.clock.elapsed_realtime_ms(),
        ));
        let sender = session.sender.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            _ = sender.send(PeriodMessage::RefreshManifest);
        });
        if let Some(previous) = self.refresh.replace(PendingRefresh { handle, delay }) {
            previous.handle.abort();
        }

        tracing::debug!(delay_ms = delay.as_millis() as u64, "Manifest refresh scheduled");
        self.state = PeriodState::RefreshScheduled;
    }

    fn fail(&mut self, error: Arc<DashError>) {
        tracing::error!(uri = %self.manifest_uri, "Manifest load failed: {error}");
        if let Some(refresh) = self.refresh.take() {
            refresh.handle.abort();
        }
        self.fatal_error = Some(error);
        self.state = PeriodState::Failed;
    }
}

impl Drop for DashMediaSource {
    fn drop(&mut self) {
        if let Some(refresh) = self.refresh.take() {
            refresh.handle.abort();
        }
    }
}
