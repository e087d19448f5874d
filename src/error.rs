//! Typed errors for the scheduler/proxy core. `anyhow` is reserved for the
//! process entry point, where there is no structured caller left to hand a
//! typed error back to.

use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("operation not valid in current scheduler status")]
    StatusTransition,

    #[error("operation deferred until scheduler leaves LAUNCHING")]
    StatusPending,

    #[error("scheduler is busy with another operation")]
    Busying,

    #[error("no idle worker available")]
    NotAvailable,

    #[error("port {0} is not a registered worker")]
    Unregistered(u16),

    #[error("specialization request failed: {0}")]
    Specialization(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("fprocess is required (set the `fprocess` environment variable)")]
    MissingFprocess,

    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("server already listening")]
    AlreadyListening,

    #[error("server closed")]
    Closed,

    #[error("failed to resolve remote address: {0}")]
    Resolve(#[from] std::io::Error),

    #[error("no remote address configured")]
    NoRemote,
}

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("all writers failed")]
    WriteToAny,

    #[error("connect to remote {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}
