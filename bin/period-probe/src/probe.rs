use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use dash_period::{
    chunk::{
        ChunkSource, ChunkSourceFactory, ChunkSourceParams, SampleStream, SampleStreamFactory,
        SampleStreamParams, SequenceableLoader,
    },
    manifest::TrackType,
    DataType, LoadEventInfo, Manifest, MediaSourceEventListener, PeriodCallback,
    END_OF_SOURCE_US,
};
use url::Url;

/// Chunk source that only reports the manifest snapshots it receives.
pub struct LoggingChunkSource {
    adaptation_set_index: usize,
    representations: Vec<String>,
    refreshes: Arc<AtomicUsize>,
}

impl ChunkSource for LoggingChunkSource {
    fn update_manifest(&mut self, manifest: Arc<Manifest>) {
        let count = self.refreshes.fetch_add(1, Ordering::Relaxed) + 1;
        let available = manifest
            .period(0)
            .and_then(|p| p.adaptation_sets.get(self.adaptation_set_index))
            .map(|set| set.representations.len())
            .unwrap_or_default();
        tracing::info!(
            adaptation_set = self.adaptation_set_index,
            representations = ?self.representations,
            available,
            count,
            "Manifest refreshed"
        );
    }
}

#[derive(Default)]
pub struct LoggingChunkSourceFactory {
    refreshes: Arc<AtomicUsize>,
}

impl LoggingChunkSourceFactory {
    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::Relaxed)
    }
}

impl ChunkSourceFactory for LoggingChunkSourceFactory {
    fn create_chunk_source(&self, params: ChunkSourceParams) -> Box<dyn ChunkSource> {
        let representations = params
            .selected_tracks
            .iter()
            .filter_map(|i| params.track_group.format(*i))
            .map(|format| format.id.clone().unwrap_or_else(|| "-".to_string()))
            .collect();
        tracing::debug!(
            adaptation_set = params.adaptation_set_index,
            adaptive = params.adaptive_evaluator.is_some(),
            server_time_ms = params.server_time_ms(),
            "Chunk source created"
        );

        Box::new(LoggingChunkSource {
            adaptation_set_index: params.adaptation_set_index,
            representations,
            refreshes: self.refreshes.clone(),
        })
    }
}

/// Sample stream that never fetches media: the probe only cares about the manifest.
pub struct ProbeSampleStream {
    track_type: TrackType,
    position_us: i64,
    chunk_source: Box<dyn ChunkSource>,
}

impl SequenceableLoader for ProbeSampleStream {
    fn next_load_position_us(&self) -> i64 {
        END_OF_SOURCE_US
    }

    fn continue_loading(&mut self, _position_us: i64) -> bool {
        false
    }
}

impl SampleStream for ProbeSampleStream {
    fn buffered_position_us(&self) -> i64 {
        END_OF_SOURCE_US
    }

    fn seek_to_us(&mut self, position_us: i64) {
        self.position_us = position_us;
    }

    fn release(&mut self) {
        tracing::debug!(
            track_type = ?self.track_type,
            position_us = self.position_us,
            "Sample stream released"
        );
    }

    fn chunk_source_mut(&mut self) -> &mut dyn ChunkSource {
        self.chunk_source.as_mut()
    }
}

pub struct ProbeSampleStreamFactory;

impl SampleStreamFactory for ProbeSampleStreamFactory {
    fn create_sample_stream(&self, params: SampleStreamParams) -> Box<dyn SampleStream> {
        Box::new(ProbeSampleStream {
            track_type: params.track_type,
            position_us: params.position_us,
            chunk_source: params.chunk_source,
        })
    }
}

pub struct ProbeCallback;

impl PeriodCallback for ProbeCallback {
    fn on_period_prepared(&self) {
        tracing::info!("Period prepared");
    }

    fn on_continue_loading_requested(&self) {
        tracing::debug!("Continue loading requested");
    }
}

/// Logs manifest and clock loads at info level.
pub struct LoadLogger;

impl MediaSourceEventListener for LoadLogger {
    fn on_load_started(&self, uri: &Url, data_type: DataType, _elapsed_realtime_ms: i64) {
        tracing::info!(%uri, %data_type, "Loading");
    }

    fn on_load_completed(&self, info: &LoadEventInfo) {
        tracing::info!(
            uri = %info.uri,
            bytes = info.bytes_loaded,
            duration_ms = info.load_duration_ms,
            "Loaded"
        );
    }
}
