//! Contracts of the per-track collaborators driven by a session: chunk sources,
//! sample streams and the loaders they expose to the buffering scheduler.

use std::{fmt, sync::Arc};

use crate::{
    clock::Clock,
    event::EventDispatcher,
    manifest::{Manifest, TrackType},
    track::TrackGroup,
    upstream::{Allocator, BandwidthMeter, DataSource},
    END_OF_SOURCE_US,
};

/// Picks the chunks of one adaptation set.
pub trait ChunkSource: Send {
    /// Swaps in a refreshed manifest without interrupting playback.
    fn update_manifest(&mut self, manifest: Arc<Manifest>);
}

pub struct ChunkSourceParams {
    pub manifest: Arc<Manifest>,
    pub adaptation_set_index: usize,
    pub track_group: TrackGroup,
    /// Indices into `track_group`, in selection order.
    pub selected_tracks: Vec<usize>,
    pub data_source: Arc<dyn DataSource>,
    /// Present when more than one track was selected.
    pub adaptive_evaluator: Option<AdaptiveEvaluator>,
    /// Offset from `clock` to server time, in milliseconds.
    pub elapsed_realtime_offset_ms: i64,
    /// Timeline of the session, shared with every chunk source it creates.
    pub clock: Arc<dyn Clock>,
}

impl ChunkSourceParams {
    /// Current server time in milliseconds since the Unix epoch, once the clock
    /// was synchronized. Device-relative otherwise.
    pub fn server_time_ms(&self) -> i64 {
        self.clock.elapsed_realtime_ms() + self.elapsed_realtime_offset_ms
    }
}

pub trait ChunkSourceFactory: Send + Sync {
    fn create_chunk_source(&self, params: ChunkSourceParams) -> Box<dyn ChunkSource>;
}

/// Bandwidth hint handed to chunk sources switching between several formats.
#[derive(Clone)]
pub struct AdaptiveEvaluator {
    bandwidth_meter: Arc<dyn BandwidthMeter>,
    bandwidth_fraction: f64,
}

impl AdaptiveEvaluator {
    pub const DEFAULT_BANDWIDTH_FRACTION: f64 = 0.75;

    pub fn new(bandwidth_meter: Arc<dyn BandwidthMeter>) -> Self {
        Self {
            bandwidth_meter,
            bandwidth_fraction: Self::DEFAULT_BANDWIDTH_FRACTION,
        }
    }

    pub fn bandwidth_meter(&self) -> &Arc<dyn BandwidthMeter> {
        &self.bandwidth_meter
    }

    /// Share of the estimated bandwidth a format may use, in bits per second.
    pub fn allowed_bitrate(&self) -> Option<u64> {
        self.bandwidth_meter
            .bitrate_estimate()
            .map(|estimate| (estimate as f64 * self.bandwidth_fraction) as u64)
    }
}

impl fmt::Debug for AdaptiveEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptiveEvaluator")
            .field("bandwidth_fraction", &self.bandwidth_fraction)
            .finish()
    }
}

/// Something that loads media ahead of the playback position.
pub trait SequenceableLoader {
    /// Position of the next load, or [`END_OF_SOURCE_US`] when everything is loaded.
    fn next_load_position_us(&self) -> i64;

    /// Attempts to load more; returns whether progress was made.
    fn continue_loading(&mut self, position_us: i64) -> bool;
}

impl<L: SequenceableLoader + ?Sized> SequenceableLoader for Box<L> {
    fn next_load_position_us(&self) -> i64 {
        (**self).next_load_position_us()
    }

    fn continue_loading(&mut self, position_us: i64) -> bool {
        (**self).continue_loading(position_us)
    }
}

/// Buffered media of one track selection.
pub trait SampleStream: SequenceableLoader + Send {
    /// Buffered position, or [`END_OF_SOURCE_US`] when the track is fully buffered.
    fn buffered_position_us(&self) -> i64;

    fn seek_to_us(&mut self, position_us: i64);

    fn release(&mut self);

    fn chunk_source_mut(&mut self) -> &mut dyn ChunkSource;
}

/// Asks the session owner to let the scheduler re-evaluate loading.
#[derive(Clone)]
pub struct ContinueLoadingNotifier {
    notify: Arc<dyn Fn() + Send + Sync>,
}

impl ContinueLoadingNotifier {
    pub fn new(notify: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            notify: Arc::new(notify),
        }
    }

    pub fn notify(&self) {
        (self.notify)()
    }
}

impl fmt::Debug for ContinueLoadingNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ContinueLoadingNotifier")
    }
}

pub struct SampleStreamParams {
    pub track_type: TrackType,
    pub chunk_source: Box<dyn ChunkSource>,
    pub allocator: Arc<dyn Allocator>,
    pub position_us: i64,
    pub min_loadable_retry_count: u32,
    pub event_dispatcher: EventDispatcher,
    pub continue_loading: ContinueLoadingNotifier,
}

pub trait SampleStreamFactory: Send + Sync {
    fn create_sample_stream(&self, params: SampleStreamParams) -> Box<dyn SampleStream>;
}

/// Drives several loaders so that the one lagging behind loads first.
pub struct CompositeSequenceableLoader<'a, L> {
    loaders: &'a mut [L],
}

impl<'a, L: SequenceableLoader> CompositeSequenceableLoader<'a, L> {
    pub fn new(loaders: &'a mut [L]) -> Self {
        Self { loaders }
    }
}

/// Smallest next load position among `loaders` that have something left to load.
pub fn min_next_load_position_us<L: SequenceableLoader>(loaders: &[L]) -> i64 {
    loaders
        .iter()
        .map(|l| l.next_load_position_us())
        .filter(|p| *p != END_OF_SOURCE_US)
        .min()
        .unwrap_or(END_OF_SOURCE_US)
}

impl<L: SequenceableLoader> SequenceableLoader for CompositeSequenceableLoader<'_, L> {
    fn next_load_position_us(&self) -> i64 {
        min_next_load_position_us(&*self.loaders)
    }

    fn continue_loading(&mut self, position_us: i64) -> bool {
        let mut made_progress = false;
        loop {
            let next_load_position_us = self.next_load_position_us();
            if next_load_position_us == END_OF_SOURCE_US {
                break;
            }

            let mut made_progress_this_iteration = false;
            for loader in self.loaders.iter_mut() {
                if loader.next_load_position_us() == next_load_position_us {
                    made_progress_this_iteration |= loader.continue_loading(position_us);
                }
            }

            made_progress |= made_progress_this_iteration;
            if !made_progress_this_iteration {
                break;
            }
        }
        made_progress
    }
}
