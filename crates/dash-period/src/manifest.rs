//! Immutable snapshot of a media presentation description.
//!
//! A [`Manifest`] is produced by a [`Parser`](crate::loader::Parser) every time the
//! presentation is (re)loaded and is shared as `Arc<Manifest>`. Sessions never mutate
//! it: a refresh swaps in a whole new snapshot.

pub mod parser;

use serde::Serialize;
use url::Url;

pub use parser::MpdParser;

#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    /// `MPD@type == "dynamic"`: a live presentation that must be refreshed.
    pub dynamic: bool,
    /// `MPD@minimumUpdatePeriod`, zero when absent.
    pub min_update_period_ms: u64,
    /// `MPD@mediaPresentationDuration`
    pub duration_ms: Option<u64>,
    /// `MPD.Location`, resolved against the URI the manifest was loaded from.
    pub location: Option<Url>,
    pub utc_timing: Option<UtcTiming>,
    pub periods: Vec<Period>,
}

impl Manifest {
    pub fn period(&self, index: usize) -> Option<&Period> {
        self.periods.get(index)
    }

    /// Duration of the period at `index` in microseconds.
    ///
    /// The declared `Period@duration` wins; the last period falls back to the
    /// presentation duration.
    pub fn period_duration_us(&self, index: usize) -> Option<i64> {
        let period = self.period(index)?;
        let duration_ms = match period.duration_ms {
            Some(duration) => duration,
            None if index + 1 == self.periods.len() => self.duration_ms?,
            None => return None,
        };
        i64::try_from(duration_ms).ok()?.checked_mul(1000)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Period {
    pub id: Option<String>,
    pub duration_ms: Option<u64>,
    pub adaptation_sets: Vec<AdaptationSet>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdaptationSet {
    pub id: Option<String>,
    pub track_type: TrackType,
    pub representations: Vec<Representation>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Representation {
    pub format: Format,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackType {
    Audio,
    Video,
    Text,
    #[default]
    Unknown,
}

impl TrackType {
    const TEXT_MIME_TYPES: [&'static str; 3] =
        ["application/ttml+xml", "application/x-subrip", "application/cea-608"];

    pub fn from_content_type(content_type: &str) -> Self {
        match content_type {
            "audio" => Self::Audio,
            "video" => Self::Video,
            "text" => Self::Text,
            _ => Self::Unknown,
        }
    }

    pub fn from_mime_type(mime_type: Option<&str>, codecs: Option<&str>) -> Self {
        let Some(mime_type) = mime_type else {
            return Self::Unknown;
        };

        if mime_type.starts_with("video") {
            Self::Video
        } else if mime_type.starts_with("audio") {
            Self::Audio
        } else if mime_type.starts_with("text") || Self::TEXT_MIME_TYPES.contains(&mime_type) {
            Self::Text
        } else if mime_type == "application/mp4" {
            // Fragmented subtitles carried in ISO BMFF
            match codecs {
                Some(codecs) if codecs.starts_with("stpp") || codecs.starts_with("wvtt") => {
                    Self::Text
                }
                _ => Self::Unknown,
            }
        } else {
            Self::Unknown
        }
    }

    pub fn is_supported(&self) -> bool {
        matches!(self, Self::Audio | Self::Video | Self::Text)
    }
}

/// Static description of one encoded variant.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Format {
    pub id: Option<String>,
    pub mime_type: Option<String>,
    pub codecs: Option<String>,
    pub bitrate: Option<u64>,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub frame_rate: Option<f32>,
    pub audio_sampling_rate: Option<u64>,
    pub language: Option<String>,
}

impl Format {
    /// Parses `@frameRate`, which is either an integer or a `num/den` fraction.
    pub fn parse_frame_rate(value: &str) -> Option<f32> {
        match value.split_once('/') {
            Some((numerator, denominator)) => {
                let numerator: f32 = numerator.trim().parse().ok()?;
                let denominator: f32 = denominator.trim().parse().ok()?;
                (denominator != 0.).then(|| numerator / denominator)
            }
            None => value.trim().parse().ok(),
        }
    }
}

/// `UTCTiming` descriptor of a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtcTiming {
    pub scheme_id_uri: String,
    pub value: String,
}

impl UtcTiming {
    pub fn new(scheme_id_uri: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            scheme_id_uri: scheme_id_uri.into(),
            value: value.into(),
        }
    }
}
