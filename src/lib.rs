pub mod admin;
pub mod config;
pub mod error;
pub mod flash;
pub mod http;
pub mod logging;
pub mod monitor;
pub mod profiler;
pub mod proxy;
pub mod scheduler;
pub mod stats;
pub mod version;
