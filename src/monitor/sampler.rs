//! Point samplers: each produces one `(value, time)` observation on demand.
//! `RequestSampler` is the one concrete, non-CPU sampler in scope here; it
//! diffs the proxy's own served-request counter between ticks.

use std::time::Instant;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("not enough data yet")]
    NotEnoughData,
}

#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub value: f64,
    pub time: Instant,
}

pub trait Sampler: Send + Sync {
    fn sample(&mut self, ts: Instant) -> Result<Sample, SamplerError>;
}

/// A point-in-time snapshot of the proxy's coarse request counters, as
/// published by `proxy::Server::request_stats`.
#[derive(Debug, Clone, Copy)]
pub struct RequestStats {
    pub requested: i64,
    pub served: i64,
    pub time: Instant,
}

/// Anything that can hand back its current request counters; implemented
/// by `proxy::Server` so `RequestSampler` doesn't need to depend on the
/// concrete proxy type.
pub trait RequestStatsSource: Send + Sync {
    fn request_stats(&self) -> RequestStats;
}

/// The served-request count the proxy reports between two samples
/// underestimates true throughput: requests in flight at the sample
/// boundary are attributed to whichever sample observes their response.
/// This is intentional, to err on the side of over-estimating per-request
/// cost rather than under-estimating it.
pub struct RequestSampler<S: RequestStatsSource> {
    proxy: S,
    last: Option<RequestStats>,
}

impl<S: RequestStatsSource> RequestSampler<S> {
    pub fn new(proxy: S) -> Self {
        RequestSampler { proxy, last: None }
    }
}

impl<S: RequestStatsSource> Sampler for RequestSampler<S> {
    fn sample(&mut self, _ts: Instant) -> Result<Sample, SamplerError> {
        let stats = self.proxy.request_stats();
        let result = match self.last {
            None => Err(SamplerError::NotEnoughData),
            Some(last) => Ok(Sample {
                value: (stats.served - last.served) as f64,
                time: stats.time,
            }),
        };
        self.last = Some(stats);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    struct FakeProxy(Arc<AtomicI64>);

    impl RequestStatsSource for FakeProxy {
        fn request_stats(&self) -> RequestStats {
            RequestStats {
                requested: 0,
                served: self.0.load(Ordering::SeqCst),
                time: Instant::now(),
            }
        }
    }

    #[test]
    fn first_sample_is_not_enough_data() {
        let served = Arc::new(AtomicI64::new(5));
        let mut sampler = RequestSampler::new(FakeProxy(served));
        let err = sampler.sample(Instant::now()).unwrap_err();
        assert!(matches!(err, SamplerError::NotEnoughData));
    }

    #[test]
    fn subsequent_sample_reports_served_delta() {
        let served = Arc::new(AtomicI64::new(5));
        let mut sampler = RequestSampler::new(FakeProxy(served.clone()));
        sampler.sample(Instant::now()).unwrap_err();
        served.store(17, Ordering::SeqCst);
        let sample = sampler.sample(Instant::now()).unwrap();
        assert_eq!(sample.value, 12.0);
    }
}
