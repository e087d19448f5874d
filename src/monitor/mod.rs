pub mod analyser;
pub mod interval_monitor;
pub mod latency_reporter;
pub mod sampler;

pub use analyser::{ResourceAnalyser, ResourceEvent};
pub use interval_monitor::IntervalMonitor;
pub use latency_reporter::LatencyReporter;
pub use sampler::{RequestSampler, RequestStats, RequestStatsSource, Sample, Sampler, SamplerError};
