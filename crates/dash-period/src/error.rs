use std::sync::Arc;

use thiserror::Error;

use crate::period::SampleStreamId;

#[derive(Error, Debug)]
pub enum DashError {
    #[error("HTTP error: {0}")]
    HttpError(reqwest::StatusCode),

    #[error(transparent)]
    RequestError(#[from] reqwest::Error),

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    // Manifest errors
    #[error(transparent)]
    MpdParseError(#[from] dash_mpd::DashMpdError),

    #[error("Invalid manifest: {0}")]
    ManifestParsing(String),

    // Clock synchronization errors
    #[error("Invalid timing schema: {0:?}")]
    InvalidTimingSchema(String),

    #[error("Invalid date time: {0:?}")]
    DateTimeParsing(String),

    // Session misuse
    #[error("Invalid track selection: {0}")]
    InvalidSelection(String),

    #[error("Sample stream {0} is not active")]
    UnknownSampleStream(SampleStreamId),

    #[error("Period is not prepared")]
    NotPrepared,

    #[error("Period has already been prepared")]
    AlreadyPrepared,

    #[error("Load failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Arc<DashError>,
    },

    #[error(transparent)]
    LoadFailed(Arc<DashError>),

    #[error(transparent)]
    ConfigError(#[from] toml::de::Error),
}

impl DashError {
    /// Whether the error comes from malformed content rather than from the transport.
    pub fn is_parse_failure(&self) -> bool {
        match self {
            Self::MpdParseError(_) | Self::ManifestParsing(_) | Self::DateTimeParsing(_) => true,
            Self::LoadFailed(inner) => inner.is_parse_failure(),
            _ => false,
        }
    }
}

pub type DashResult<T> = Result<T, DashError>;
