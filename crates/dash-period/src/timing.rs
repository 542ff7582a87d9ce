//! `UTCTiming` schemes used to estimate the offset between the local clock and the
//! server clock of a live presentation.
//!
//! References:
//! - [DASH-IF: Clock synchronization](https://dashif.org/Guidelines-TimingModel/#clock-sync)
//! - ISO/IEC 23009-1, 5.8.5.7 UTC Timing Descriptor
use chrono::{DateTime, NaiveDateTime};
use url::Url;

use crate::{
    error::{DashError, DashResult},
    loader::Parser,
    manifest::UtcTiming,
};

/// Clock synchronization method named by `UTCTiming@schemeIdUri`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UtcTimingScheme {
    /// `@value` carries an xs:dateTime.
    Direct,
    /// `@value` is a URL serving `yyyy-MM-dd'T'HH:mm:ss'Z'`.
    HttpIso8601,
    /// `@value` is a URL serving an xs:dateTime.
    HttpXsDate,
    Unsupported(String),
}

impl UtcTimingScheme {
    pub const DIRECT_2012: &'static str = "urn:mpeg:dash:utc:direct:2012";
    pub const HTTP_ISO_2014: &'static str = "urn:mpeg:dash:utc:http-iso:2014";
    pub const HTTP_XSDATE_2012: &'static str = "urn:mpeg:dash:utc:http-xsdate:2012";
    pub const HTTP_XSDATE_2014: &'static str = "urn:mpeg:dash:utc:http-xsdate:2014";

    pub fn from_scheme_id_uri(scheme: &str) -> Self {
        match scheme {
            Self::DIRECT_2012 => Self::Direct,
            Self::HTTP_ISO_2014 => Self::HttpIso8601,
            Self::HTTP_XSDATE_2012 | Self::HTTP_XSDATE_2014 => Self::HttpXsDate,
            others => Self::Unsupported(others.to_string()),
        }
    }
}

impl From<&UtcTiming> for UtcTimingScheme {
    fn from(timing: &UtcTiming) -> Self {
        Self::from_scheme_id_uri(&timing.scheme_id_uri)
    }
}

/// Offset for the direct scheme: the server time carried by the manifest minus the
/// elapsed realtime at which the manifest finished loading.
pub fn resolve_direct(timing: &UtcTiming, manifest_load_end_ms: i64) -> DashResult<i64> {
    Ok(parse_xs_date_time(&timing.value)? - manifest_load_end_ms)
}

/// Parses an xs:dateTime into milliseconds since the Unix epoch.
///
/// Accepts an optional fraction and an optional `Z`/`±hh:mm`/`±hhmm` zone; a value
/// without zone is read as UTC.
pub fn parse_xs_date_time(value: &str) -> DashResult<i64> {
    let value = value.trim();
    if let Ok(datetime) = DateTime::parse_from_rfc3339(value) {
        return Ok(datetime.timestamp_millis());
    }
    if let Ok(datetime) = DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Ok(datetime.timestamp_millis());
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|datetime| datetime.and_utc().timestamp_millis())
        .map_err(|e| DashError::DateTimeParsing(format!("{value}: {e}")))
}

/// Parses the strict `yyyy-MM-dd'T'HH:mm:ss'Z'` form served by `http-iso` time servers.
pub fn parse_iso8601(value: &str) -> DashResult<i64> {
    let value = value.trim();
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%SZ")
        .map(|datetime| datetime.and_utc().timestamp_millis())
        .map_err(|e| DashError::DateTimeParsing(format!("{value}: {e}")))
}

fn first_line(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .lines()
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Reads the first line of a time server response as an xs:dateTime.
#[derive(Debug, Clone, Copy, Default)]
pub struct XsDateTimeParser;

impl Parser<i64> for XsDateTimeParser {
    fn parse(&self, _uri: &Url, data: &[u8]) -> DashResult<i64> {
        parse_xs_date_time(&first_line(data))
    }
}

/// Reads the first line of a time server response as an ISO-8601 UTC timestamp.
#[derive(Debug, Clone, Copy, Default)]
pub struct Iso8601Parser;

impl Parser<i64> for Iso8601Parser {
    fn parse(&self, _uri: &Url, data: &[u8]) -> DashResult<i64> {
        parse_iso8601(&first_line(data))
    }
}
