//! Transport and memory collaborators shared by every load of a session.

pub mod http;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use url::Url;

use crate::error::DashResult;

pub use http::{HttpClient, HttpDataSource, HttpDataSourceFactory};

pub type ByteStream = BoxStream<'static, DashResult<Bytes>>;

/// A transport handle able to stream the body behind a URI.
#[async_trait::async_trait]
pub trait DataSource: Send + Sync {
    async fn open(&self, uri: &Url) -> DashResult<ByteStream>;
}

pub trait DataSourceFactory: Send + Sync {
    /// Creates a data source, reporting its transfers to `bandwidth_meter` when given.
    fn create_data_source(
        &self,
        bandwidth_meter: Option<Arc<dyn BandwidthMeter>>,
    ) -> Arc<dyn DataSource>;
}

/// Estimates the available network bandwidth from observed transfers.
pub trait BandwidthMeter: Send + Sync {
    /// Estimated bitrate in bits per second, if any transfer has been observed.
    fn bitrate_estimate(&self) -> Option<u64>;

    fn on_transfer(&self, bytes: u64, elapsed: Duration);
}

/// Exponentially weighted moving average of the observed transfer rates.
#[derive(Debug)]
pub struct DefaultBandwidthMeter {
    weight: f64,
    estimate: Mutex<Option<f64>>,
}

impl DefaultBandwidthMeter {
    pub const DEFAULT_WEIGHT: f64 = 0.3;

    pub fn new() -> Self {
        Self::with_weight(Self::DEFAULT_WEIGHT)
    }

    /// `weight` is the share of the newest sample in the estimate, clamped to `(0, 1]`.
    pub fn with_weight(weight: f64) -> Self {
        Self {
            weight: weight.clamp(f64::EPSILON, 1.),
            estimate: Mutex::new(None),
        }
    }
}

impl Default for DefaultBandwidthMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl BandwidthMeter for DefaultBandwidthMeter {
    fn bitrate_estimate(&self) -> Option<u64> {
        let estimate = self.estimate.lock().ok()?;
        estimate.map(|bps| bps as u64)
    }

    fn on_transfer(&self, bytes: u64, elapsed: Duration) {
        let seconds = elapsed.as_secs_f64();
        if bytes == 0 || seconds <= 0. {
            return;
        }
        let sample = bytes as f64 * 8. / seconds;

        let Ok(mut estimate) = self.estimate.lock() else {
            return;
        };
        *estimate = Some(match *estimate {
            Some(previous) => previous + self.weight * (sample - previous),
            None => sample,
        });
    }
}

/// Source of media buffers, shared by every sample stream of a session.
pub trait Allocator: Send + Sync {
    fn allocate(&self) -> BytesMut;

    fn release(&self, allocation: BytesMut);

    fn total_bytes_allocated(&self) -> usize;

    fn individual_allocation_length(&self) -> usize;
}

/// Pooling allocator handing out fixed-size buffers.
#[derive(Debug)]
pub struct DefaultAllocator {
    individual_allocation_length: usize,
    allocated_count: AtomicUsize,
    available: Mutex<Vec<BytesMut>>,
}

impl DefaultAllocator {
    pub const DEFAULT_INDIVIDUAL_ALLOCATION_LENGTH: usize = 64 * 1024;

    pub fn new(individual_allocation_length: usize) -> Self {
        Self {
            individual_allocation_length,
            allocated_count: AtomicUsize::new(0),
            available: Mutex::new(Vec::new()),
        }
    }

    /// Number of released buffers kept for reuse.
    pub fn pooled(&self) -> usize {
        self.available.lock().map(|a| a.len()).unwrap_or_default()
    }
}

impl Default for DefaultAllocator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INDIVIDUAL_ALLOCATION_LENGTH)
    }
}

impl Allocator for DefaultAllocator {
    fn allocate(&self) -> BytesMut {
        self.allocated_count.fetch_add(1, Ordering::Relaxed);
        let reused = self.available.lock().ok().and_then(|mut a| a.pop());
        reused.unwrap_or_else(|| BytesMut::with_capacity(self.individual_allocation_length))
    }

    fn release(&self, mut allocation: BytesMut) {
        self.allocated_count.fetch_sub(1, Ordering::Relaxed);
        allocation.clear();
        if let Ok(mut available) = self.available.lock() {
            available.push(allocation);
        }
    }

    fn total_bytes_allocated(&self) -> usize {
        self.allocated_count.load(Ordering::Relaxed) * self.individual_allocation_length
    }

    fn individual_allocation_length(&self) -> usize {
        self.individual_allocation_length
    }
}
