use serde::Serialize;

use crate::{
    error::{DashError, DashResult},
    manifest::{Format, Period, TrackType},
};

/// Interchangeable variants of one adaptation set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackGroup {
    pub track_type: TrackType,
    /// Whether playback may switch between the formats of the group.
    pub adaptive: bool,
    pub formats: Vec<Format>,
}

impl TrackGroup {
    pub fn new(track_type: TrackType, formats: Vec<Format>) -> Self {
        Self {
            track_type,
            adaptive: track_type == TrackType::Video,
            formats,
        }
    }

    pub fn len(&self) -> usize {
        self.formats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }

    pub fn format(&self, index: usize) -> Option<&Format> {
        self.formats.get(index)
    }
}

/// Tracks of one group requested by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackSelection {
    pub group: usize,
    pub tracks: Vec<usize>,
}

impl TrackSelection {
    pub fn new(group: usize, tracks: Vec<usize>) -> Self {
        Self { group, tracks }
    }

    pub fn single(group: usize, track: usize) -> Self {
        Self::new(group, vec![track])
    }

    /// More than one track means the stream switches between them.
    pub fn is_adaptive(&self) -> bool {
        self.tracks.len() > 1
    }
}

/// Selectable track groups of a period and the adaptation set each one came from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackTopology {
    groups: Vec<TrackGroup>,
    adaptation_set_indices: Vec<usize>,
}

impl TrackTopology {
    /// Keeps every adaptation set of a supported type with at least one
    /// representation, in manifest order.
    pub fn build(period: &Period) -> Self {
        let mut topology = Self::default();
        for (index, adaptation_set) in period.adaptation_sets.iter().enumerate() {
            if adaptation_set.representations.is_empty()
                || !adaptation_set.track_type.is_supported()
            {
                tracing::debug!(
                    index,
                    track_type = ?adaptation_set.track_type,
                    "Skipping adaptation set"
                );
                continue;
            }

            let formats = adaptation_set
                .representations
                .iter()
                .map(|r| r.format.clone())
                .collect();
            topology
                .groups
                .push(TrackGroup::new(adaptation_set.track_type, formats));
            topology.adaptation_set_indices.push(index);
        }
        topology
    }

    pub fn groups(&self) -> &[TrackGroup] {
        &self.groups
    }

    pub fn group(&self, index: usize) -> Option<&TrackGroup> {
        self.groups.get(index)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn adaptation_set_index(&self, group: usize) -> Option<usize> {
        self.adaptation_set_indices.get(group).copied()
    }

    pub fn adaptation_set_indices(&self) -> &[usize] {
        &self.adaptation_set_indices
    }

    pub fn validate(&self, selection: &TrackSelection) -> DashResult<()> {
        let Some(group) = self.group(selection.group) else {
            return Err(DashError::InvalidSelection(format!(
                "group {} out of {}",
                selection.group,
                self.len()
            )));
        };
        if selection.tracks.is_empty() {
            return Err(DashError::InvalidSelection(format!(
                "no track selected in group {}",
                selection.group
            )));
        }
        if let Some(track) = selection.tracks.iter().find(|t| **t >= group.len()) {
            return Err(DashError::InvalidSelection(format!(
                "track {track} out of {} in group {}",
                group.len(),
                selection.group
            )));
        }
        Ok(())
    }
}
