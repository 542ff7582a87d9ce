//! Single-period DASH media source: manifest loading and refresh, server clock
//! synchronization, track groups and the sample streams of the selected tracks.
//!
//! ```text
//! ┌──────────────┐  prepare   ┌─────────────────┐   UTCTiming    ┌──────────────┐
//! │              ├────────────►                 ├────────────────►              │
//! │     Idle     │            │ LoadingManifest │                │ SyncingClock │
//! │              │     ┌──────►                 │                │              │
//! └──────────────┘     │      └───┬─────────┬───┘                └──────┬───────┘
//!                      │  fatal   │         │ no UTCTiming              │
//!              refresh │  ┌───────▼──┐   ┌──▼───────┐     offset or 0   │
//!                timer │  │  Failed  │   │ Prepared ◄───────────────────┘
//!                      │  └──────────┘   └──┬───────┘
//!                      │                    │ dynamic manifest
//!              ┌───────┴──────────┐         │
//!              │ RefreshScheduled ◄─────────┘
//!              └──────────────────┘
//! ```

pub mod chunk;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod loader;
pub mod manifest;
pub mod period;
pub mod timing;
pub mod track;
pub mod upstream;

pub use period::{DashMediaSource, PeriodCallback, PeriodState, SampleStreamId};

pub use config::DashPeriodConfig;
pub use error::{DashError, DashResult};
pub use event::{DataType, LoadEventInfo, MediaSourceEventListener};
pub use manifest::{Manifest, MpdParser};
pub use track::{TrackGroup, TrackSelection, TrackTopology};

/// Position reported once everything up to the end of the source is loaded or buffered.
pub const END_OF_SOURCE_US: i64 = i64::MIN;

/// Marker of a time that is not known.
pub const TIME_UNSET: i64 = i64::MIN + 1;
