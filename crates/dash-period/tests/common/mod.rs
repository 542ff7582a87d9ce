//! In-memory collaborators for driving a [`DashMediaSource`] without a network.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use bytes::Bytes;
use dash_period::{
    chunk::{
        ChunkSource, ChunkSourceFactory, ChunkSourceParams, ContinueLoadingNotifier, SampleStream,
        SampleStreamFactory, SampleStreamParams, SequenceableLoader,
    },
    loader::Parser,
    manifest::{AdaptationSet, Format, Period, Representation, TrackType, UtcTiming},
    upstream::{BandwidthMeter, ByteStream, DataSource, DataSourceFactory, DefaultAllocator},
    DashError, DashMediaSource, DashPeriodConfig, DashResult, DataType, LoadEventInfo, Manifest,
    MediaSourceEventListener, PeriodCallback, END_OF_SOURCE_US,
};
use futures::{stream, StreamExt};
use reqwest::StatusCode;
use url::Url;

pub const MANIFEST_URL: &str = "https://cdn.example.com/live/manifest.mpd";

pub fn setup_tracing() {
    _ = tracing_subscriber::fmt()
        .with_env_filter("dash_period=debug")
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone)]
pub enum Response {
    Body(&'static str),
    Status(u16),
    /// Never answers.
    Stall,
}

/// Serves canned responses per URL. The last response of a queue is sticky.
#[derive(Default)]
pub struct MemoryDataSource {
    responses: Mutex<HashMap<String, VecDeque<Response>>>,
    requests: Mutex<HashMap<String, usize>>,
}

impl MemoryDataSource {
    pub fn respond(&self, url: &str, responses: impl IntoIterator<Item = Response>) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), responses.into_iter().collect());
    }

    pub fn requests(&self, url: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .get(url)
            .copied()
            .unwrap_or_default()
    }

    fn next_response(&self, url: &str) -> Option<Response> {
        let mut responses = self.responses.lock().unwrap();
        let queue = responses.get_mut(url)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait::async_trait]
impl DataSource for MemoryDataSource {
    async fn open(&self, uri: &Url) -> DashResult<ByteStream> {
        *self
            .requests
            .lock()
            .unwrap()
            .entry(uri.to_string())
            .or_default() += 1;

        match self.next_response(uri.as_str()) {
            Some(Response::Body(body)) => {
                let chunks: Vec<DashResult<Bytes>> = body
                    .as_bytes()
                    .chunks(8)
                    .map(|c| Ok(Bytes::copy_from_slice(c)))
                    .collect();
                Ok(stream::iter(chunks).boxed())
            }
            Some(Response::Status(status)) => Err(DashError::HttpError(
                StatusCode::from_u16(status).unwrap(),
            )),
            Some(Response::Stall) => futures::future::pending().await,
            None => Err(DashError::HttpError(StatusCode::NOT_FOUND)),
        }
    }
}

/// Hands out the same [`MemoryDataSource`], remembering which requests were
/// bandwidth-aware.
#[derive(Default)]
pub struct MemoryDataSourceFactory {
    pub source: Arc<MemoryDataSource>,
    with_meter: Mutex<Vec<bool>>,
}

impl MemoryDataSourceFactory {
    pub fn with_meter(&self) -> Vec<bool> {
        self.with_meter.lock().unwrap().clone()
    }
}

impl DataSourceFactory for MemoryDataSourceFactory {
    fn create_data_source(
        &self,
        bandwidth_meter: Option<Arc<dyn BandwidthMeter>>,
    ) -> Arc<dyn DataSource> {
        self.with_meter
            .lock()
            .unwrap()
            .push(bandwidth_meter.is_some());
        self.source.clone()
    }
}

/// Maps manifest bodies to prebuilt manifests. Unknown bodies fail to parse.
#[derive(Default)]
pub struct FakeManifestParser {
    manifests: Mutex<HashMap<String, Manifest>>,
}

impl FakeManifestParser {
    pub fn register(&self, body: &str, manifest: Manifest) {
        self.manifests
            .lock()
            .unwrap()
            .insert(body.to_string(), manifest);
    }
}

impl Parser<Manifest> for FakeManifestParser {
    fn parse(&self, _uri: &Url, data: &[u8]) -> DashResult<Manifest> {
        let body = String::from_utf8_lossy(data);
        self.manifests
            .lock()
            .unwrap()
            .get(body.as_ref())
            .cloned()
            .ok_or_else(|| DashError::ManifestParsing(format!("unknown manifest {body:?}")))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatedChunkSource {
    pub adaptation_set_index: usize,
    pub selected_tracks: Vec<usize>,
    pub adaptive: bool,
    pub elapsed_realtime_offset_ms: i64,
}

/// Records every chunk source it builds and every manifest they receive.
#[derive(Default)]
pub struct RecordingChunkSourceFactory {
    created: Mutex<Vec<CreatedChunkSource>>,
    server_times_ms: Mutex<Vec<i64>>,
    updates: Arc<Mutex<Vec<(usize, Arc<Manifest>)>>>,
}

impl RecordingChunkSourceFactory {
    pub fn created(&self) -> Vec<CreatedChunkSource> {
        self.created.lock().unwrap().clone()
    }

    /// Server time each chunk source computed from its clock and offset when created.
    pub fn server_times_ms(&self) -> Vec<i64> {
        self.server_times_ms.lock().unwrap().clone()
    }

    /// `(adaptation set index, manifest)` of every `update_manifest` call.
    pub fn updates(&self) -> Vec<(usize, Arc<Manifest>)> {
        self.updates.lock().unwrap().clone()
    }
}

struct RecordingChunkSource {
    adaptation_set_index: usize,
    updates: Arc<Mutex<Vec<(usize, Arc<Manifest>)>>>,
}

impl ChunkSource for RecordingChunkSource {
    fn update_manifest(&mut self, manifest: Arc<Manifest>) {
        self.updates
            .lock()
            .unwrap()
            .push((self.adaptation_set_index, manifest));
    }
}

impl ChunkSourceFactory for RecordingChunkSourceFactory {
    fn create_chunk_source(&self, params: ChunkSourceParams) -> Box<dyn ChunkSource> {
        self.created.lock().unwrap().push(CreatedChunkSource {
            adaptation_set_index: params.adaptation_set_index,
            selected_tracks: params.selected_tracks.clone(),
            adaptive: params.adaptive_evaluator.is_some(),
            elapsed_realtime_offset_ms: params.elapsed_realtime_offset_ms,
        });
        self.server_times_ms
            .lock()
            .unwrap()
            .push(params.server_time_ms());
        Box::new(RecordingChunkSource {
            adaptation_set_index: params.adaptation_set_index,
            updates: self.updates.clone(),
        })
    }
}

/// Loads one-second chunks from the start position up to a per-type end.
pub struct FakeSampleStream {
    pub track_type: TrackType,
    loaded_us: i64,
    end_us: i64,
    released: Arc<AtomicUsize>,
    chunk_source: Box<dyn ChunkSource>,
    continue_loading: ContinueLoadingNotifier,
}

impl SequenceableLoader for FakeSampleStream {
    fn next_load_position_us(&self) -> i64 {
        if self.loaded_us >= self.end_us {
            END_OF_SOURCE_US
        } else {
            self.loaded_us
        }
    }

    fn continue_loading(&mut self, _position_us: i64) -> bool {
        if self.loaded_us >= self.end_us {
            return false;
        }
        self.loaded_us += 1_000_000;
        if self.loaded_us >= self.end_us {
            self.continue_loading.notify();
        }
        true
    }
}

impl SampleStream for FakeSampleStream {
    fn buffered_position_us(&self) -> i64 {
        self.next_load_position_us()
    }

    fn seek_to_us(&mut self, position_us: i64) {
        self.loaded_us = position_us;
    }

    fn release(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn chunk_source_mut(&mut self) -> &mut dyn ChunkSource {
        self.chunk_source.as_mut()
    }
}

pub struct FakeSampleStreamFactory {
    pub released: Arc<AtomicUsize>,
    created: Mutex<Vec<(TrackType, i64, u32)>>,
    end_us: Mutex<HashMap<TrackType, i64>>,
}

impl Default for FakeSampleStreamFactory {
    fn default() -> Self {
        Self {
            released: Default::default(),
            created: Default::default(),
            end_us: Mutex::new(HashMap::from([
                (TrackType::Video, 10_000_000),
                (TrackType::Audio, 10_000_000),
                (TrackType::Text, 10_000_000),
            ])),
        }
    }
}

impl FakeSampleStreamFactory {
    pub fn set_end_us(&self, track_type: TrackType, end_us: i64) {
        self.end_us.lock().unwrap().insert(track_type, end_us);
    }

    /// `(track type, start position, retry count)` of every stream built.
    pub fn created(&self) -> Vec<(TrackType, i64, u32)> {
        self.created.lock().unwrap().clone()
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl SampleStreamFactory for FakeSampleStreamFactory {
    fn create_sample_stream(&self, params: SampleStreamParams) -> Box<dyn SampleStream> {
        self.created.lock().unwrap().push((
            params.track_type,
            params.position_us,
            params.min_loadable_retry_count,
        ));
        let end_us = self
            .end_us
            .lock()
            .unwrap()
            .get(&params.track_type)
            .copied()
            .unwrap_or_default();
        Box::new(FakeSampleStream {
            track_type: params.track_type,
            loaded_us: params.position_us,
            end_us,
            released: self.released.clone(),
            chunk_source: params.chunk_source,
            continue_loading: params.continue_loading,
        })
    }
}

#[derive(Default)]
pub struct RecordingCallback {
    prepared: AtomicUsize,
    continue_loading: AtomicUsize,
}

impl RecordingCallback {
    pub fn prepared(&self) -> usize {
        self.prepared.load(Ordering::SeqCst)
    }

    pub fn continue_loading_requests(&self) -> usize {
        self.continue_loading.load(Ordering::SeqCst)
    }
}

impl PeriodCallback for RecordingCallback {
    fn on_period_prepared(&self) {
        self.prepared.fetch_add(1, Ordering::SeqCst);
    }

    fn on_continue_loading_requested(&self) {
        self.continue_loading.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadEvent {
    Started(Url, DataType),
    Completed(LoadEventInfo),
    Canceled(LoadEventInfo),
    Error(LoadEventInfo, bool),
}

#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<LoadEvent>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<LoadEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<bool> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                LoadEvent::Error(_, is_fatal) => Some(is_fatal),
                _ => None,
            })
            .collect()
    }
}

impl MediaSourceEventListener for RecordingListener {
    fn on_load_started(&self, uri: &Url, data_type: DataType, _elapsed_realtime_ms: i64) {
        self.events
            .lock()
            .unwrap()
            .push(LoadEvent::Started(uri.clone(), data_type));
    }

    fn on_load_completed(&self, info: &LoadEventInfo) {
        self.events
            .lock()
            .unwrap()
            .push(LoadEvent::Completed(info.clone()));
    }

    fn on_load_canceled(&self, info: &LoadEventInfo) {
        self.events
            .lock()
            .unwrap()
            .push(LoadEvent::Canceled(info.clone()));
    }

    fn on_load_error(&self, info: &LoadEventInfo, _error: &DashError, is_fatal: bool) {
        self.events
            .lock()
            .unwrap()
            .push(LoadEvent::Error(info.clone(), is_fatal));
    }
}

pub fn format(id: &str, bitrate: u64) -> Format {
    Format {
        id: Some(id.to_string()),
        bitrate: Some(bitrate),
        ..Default::default()
    }
}

fn adaptation_set(track_type: TrackType, formats: Vec<Format>) -> AdaptationSet {
    AdaptationSet {
        id: None,
        track_type,
        representations: formats
            .into_iter()
            .map(|format| Representation { format })
            .collect(),
    }
}

/// One 30 second period:
///
/// | adaptation set | type    | representations | group |
/// |----------------|---------|-----------------|-------|
/// | 0              | video   | 3               | 0     |
/// | 1              | unknown | 1               | -     |
/// | 2              | audio   | 0               | -     |
/// | 3              | audio   | 2               | 1     |
/// | 4              | text    | 1               | 2     |
pub fn static_manifest() -> Manifest {
    Manifest {
        dynamic: false,
        min_update_period_ms: 0,
        duration_ms: Some(30_000),
        location: None,
        utc_timing: None,
        periods: vec![Period {
            id: Some("p0".into()),
            duration_ms: None,
            adaptation_sets: vec![
                adaptation_set(
                    TrackType::Video,
                    vec![
                        format("v360", 800_000),
                        format("v720", 2_400_000),
                        format("v1080", 4_800_000),
                    ],
                ),
                adaptation_set(TrackType::Unknown, vec![format("thumbs", 1_000)]),
                adaptation_set(TrackType::Audio, vec![]),
                adaptation_set(
                    TrackType::Audio,
                    vec![format("a64", 64_000), format("a128", 128_000)],
                ),
                adaptation_set(TrackType::Text, vec![format("en", 2_000)]),
            ],
        }],
    }
}

pub fn dynamic_manifest(min_update_period_ms: u64) -> Manifest {
    Manifest {
        dynamic: true,
        min_update_period_ms,
        duration_ms: None,
        ..static_manifest()
    }
}

pub fn with_utc_timing(manifest: Manifest, scheme: &str, value: &str) -> Manifest {
    Manifest {
        utc_timing: Some(UtcTiming::new(scheme, value)),
        ..manifest
    }
}

pub struct Harness {
    pub source: DashMediaSource,
    pub data: Arc<MemoryDataSource>,
    pub data_sources: Arc<MemoryDataSourceFactory>,
    pub parser: Arc<FakeManifestParser>,
    pub chunk_sources: Arc<RecordingChunkSourceFactory>,
    pub sample_streams: Arc<FakeSampleStreamFactory>,
    pub callback: Arc<RecordingCallback>,
    pub listener: Arc<RecordingListener>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(DashPeriodConfig::default())
    }

    pub fn with_config(config: DashPeriodConfig) -> Self {
        setup_tracing();

        let data_sources = Arc::new(MemoryDataSourceFactory::default());
        let parser = Arc::new(FakeManifestParser::default());
        let chunk_sources = Arc::new(RecordingChunkSourceFactory::default());
        let sample_streams = Arc::new(FakeSampleStreamFactory::default());
        let listener = Arc::new(RecordingListener::default());

        let source = DashMediaSource::new(
            Url::parse(MANIFEST_URL).unwrap(),
            data_sources.clone(),
            chunk_sources.clone(),
            sample_streams.clone(),
        )
        .with_config(config)
        .with_manifest_parser(parser.clone())
        .with_event_listener(listener.clone());

        Self {
            source,
            data: data_sources.source.clone(),
            data_sources,
            parser,
            chunk_sources,
            sample_streams,
            callback: Default::default(),
            listener,
        }
    }

    /// Serves `manifest` at [`MANIFEST_URL`] under the body `body`.
    pub fn serve_manifest(&self, body: &'static str, manifest: Manifest) {
        self.parser.register(body, manifest);
        self.data.respond(MANIFEST_URL, [Response::Body(body)]);
    }

    pub fn prepare(&mut self) -> DashResult<()> {
        self.source.prepare(
            self.callback.clone(),
            Arc::new(DefaultAllocator::default()),
            0,
        )
    }

    pub async fn prepared(mut self) -> Self {
        self.prepare().unwrap();
        self.source.run_until_prepared().await.unwrap();
        self
    }
}
