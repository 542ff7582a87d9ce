use std::{fmt, sync::Arc};

use crate::{
    chunk::{min_next_load_position_us, CompositeSequenceableLoader, SampleStream},
    manifest::Manifest,
    track::TrackSelection,
    END_OF_SOURCE_US,
};

/// Opaque handle of a sample stream created by
/// [`DashMediaSource::select_tracks`](super::DashMediaSource::select_tracks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SampleStreamId(u64);

impl fmt::Display for SampleStreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Sample streams of the current track selection.
///
/// `entries` and `streams` are parallel: the streams are kept contiguous so the
/// composite loader can borrow them as a slice.
#[derive(Default)]
pub(crate) struct StreamSet {
    entries: Vec<(SampleStreamId, TrackSelection)>,
    streams: Vec<Box<dyn SampleStream>>,
    next_id: u64,
}

impl StreamSet {
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn contains(&self, id: SampleStreamId) -> bool {
        self.position(id).is_some()
    }

    pub fn ids(&self) -> impl Iterator<Item = SampleStreamId> + '_ {
        self.entries.iter().map(|(id, _)| *id)
    }

    pub fn selection(&self, id: SampleStreamId) -> Option<&TrackSelection> {
        self.position(id).map(|i| &self.entries[i].1)
    }

    pub fn get(&self, id: SampleStreamId) -> Option<&dyn SampleStream> {
        self.position(id).map(|i| self.streams[i].as_ref())
    }

    pub fn get_mut(&mut self, id: SampleStreamId) -> Option<&mut (dyn SampleStream + 'static)> {
        self.position(id).map(|i| self.streams[i].as_mut())
    }

    /// Streams whose selection is one of `selections`.
    pub fn matching<'a>(
        &'a self,
        selections: &'a [TrackSelection],
    ) -> impl Iterator<Item = SampleStreamId> + 'a {
        self.entries
            .iter()
            .filter(|(_, selection)| selections.contains(selection))
            .map(|(id, _)| *id)
    }

    fn position(&self, id: SampleStreamId) -> Option<usize> {
        self.entries.iter().position(|(entry, _)| *entry == id)
    }

    /// Releases and forgets every listed stream, keeping the others in order.
    pub fn release(&mut self, ids: &[SampleStreamId]) {
        let mut index = 0;
        while index < self.entries.len() {
            if ids.contains(&self.entries[index].0) {
                let (id, selection) = self.entries.remove(index);
                let mut stream = self.streams.remove(index);
                tracing::debug!(%id, group = selection.group, "Releasing sample stream");
                stream.release();
            } else {
                index += 1;
            }
        }
    }

    pub fn release_all(&mut self) {
        for mut stream in self.streams.drain(..) {
            stream.release();
        }
        self.entries.clear();
    }

    /// Appends a stream and returns its freshly allocated handle.
    pub fn push(
        &mut self,
        selection: TrackSelection,
        stream: Box<dyn SampleStream>,
    ) -> SampleStreamId {
        let id = SampleStreamId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, selection));
        self.streams.push(stream);
        id
    }

    pub fn loader(&mut self) -> CompositeSequenceableLoader<'_, Box<dyn SampleStream>> {
        CompositeSequenceableLoader::new(&mut self.streams)
    }

    pub fn next_load_position_us(&self) -> i64 {
        min_next_load_position_us(&self.streams)
    }

    /// Smallest buffered position among the streams that are not fully buffered.
    pub fn buffered_position_us(&self) -> i64 {
        self.streams
            .iter()
            .map(|s| s.buffered_position_us())
            .filter(|p| *p != END_OF_SOURCE_US)
            .min()
            .unwrap_or(END_OF_SOURCE_US)
    }

    pub fn seek_to_us(&mut self, position_us: i64) {
        for stream in self.streams.iter_mut() {
            stream.seek_to_us(position_us);
        }
    }

    pub fn update_manifest(&mut self, manifest: &Arc<Manifest>) {
        for stream in self.streams.iter_mut() {
            stream.chunk_source_mut().update_manifest(manifest.clone());
        }
    }
}
