use url::Url;

use super::{AdaptationSet, Format, Manifest, Period, Representation, TrackType, UtcTiming};
use crate::{
    error::{DashError, DashResult},
    loader::Parser,
};

/// [`Parser`] turning an MPD document into a [`Manifest`], backed by `dash-mpd`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MpdParser;

impl Parser<Manifest> for MpdParser {
    fn parse(&self, uri: &Url, data: &[u8]) -> DashResult<Manifest> {
        let text = std::str::from_utf8(data)
            .map_err(|e| DashError::ManifestParsing(format!("MPD is not valid UTF-8: {e}")))?;
        let mpd = dash_mpd::parse(text)?;
        from_mpd(mpd, uri)
    }
}

fn from_mpd(mpd: dash_mpd::MPD, uri: &Url) -> DashResult<Manifest> {
    let location = match mpd.locations.first() {
        Some(location) => Some(uri.join(location.url.trim()).map_err(|e| {
            DashError::ManifestParsing(format!("Invalid Location {:?}: {e}", location.url))
        })?),
        None => None,
    };

    // `schemeIdUri` is optional in some dash-mpd releases
    let utc_timing = mpd.UTCTiming.iter().find_map(|timing| {
        let scheme = Option::<String>::from(timing.schemeIdUri.clone())?;
        Some(UtcTiming::new(
            scheme,
            timing.value.clone().unwrap_or_default(),
        ))
    });

    Ok(Manifest {
        dynamic: mpd.mpdtype.as_deref() == Some("dynamic"),
        min_update_period_ms: mpd
            .minimumUpdatePeriod
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0),
        duration_ms: mpd.mediaPresentationDuration.map(|d| d.as_millis() as u64),
        location,
        utc_timing,
        periods: mpd.periods.iter().map(convert_period).collect(),
    })
}

fn convert_period(period: &dash_mpd::Period) -> Period {
    Period {
        id: period.id.clone(),
        duration_ms: period.duration.map(|d| d.as_millis() as u64),
        adaptation_sets: period.adaptations.iter().map(convert_adaptation).collect(),
    }
}

fn convert_adaptation(adaptation: &dash_mpd::AdaptationSet) -> AdaptationSet {
    AdaptationSet {
        id: adaptation.id.as_ref().map(ToString::to_string),
        track_type: adaptation_track_type(adaptation),
        representations: adaptation
            .representations
            .iter()
            .map(|representation| Representation {
                format: convert_format(adaptation, representation),
            })
            .collect(),
    }
}

fn adaptation_track_type(adaptation: &dash_mpd::AdaptationSet) -> TrackType {
    if let Some(content_type) = adaptation.contentType.as_deref() {
        let track_type = TrackType::from_content_type(content_type);
        if track_type != TrackType::Unknown {
            return track_type;
        }
    }

    let track_type =
        TrackType::from_mime_type(adaptation.mimeType.as_deref(), adaptation.codecs.as_deref());
    if track_type != TrackType::Unknown {
        return track_type;
    }

    adaptation
        .representations
        .first()
        .map(|r| match r.contentType.as_deref() {
            Some(content_type) => TrackType::from_content_type(content_type),
            None => TrackType::from_mime_type(
                r.mimeType.as_deref(),
                r.codecs.as_deref().or(adaptation.codecs.as_deref()),
            ),
        })
        .unwrap_or_default()
}

fn convert_format(
    adaptation: &dash_mpd::AdaptationSet,
    representation: &dash_mpd::Representation,
) -> Format {
    Format {
        id: representation.id.clone(),
        mime_type: representation
            .mimeType
            .clone()
            .or_else(|| adaptation.mimeType.clone()),
        codecs: representation
            .codecs
            .clone()
            .or_else(|| adaptation.codecs.clone()),
        bitrate: representation.bandwidth,
        width: representation.width,
        height: representation.height,
        frame_rate: representation
            .frameRate
            .as_deref()
            .or(adaptation.frameRate.as_deref())
            .and_then(Format::parse_frame_rate),
        audio_sampling_rate: representation
            .audioSamplingRate
            .as_ref()
            .or(adaptation.audioSamplingRate.as_ref())
            .and_then(|rate| rate.to_string().trim().parse().ok()),
        language: adaptation.lang.clone(),
    }
}
