//! Environment-driven configuration, loaded once at process startup.
//!
//! Field names and defaults are load-bearing: they mirror the watchdog
//! configuration contract workers and deployment tooling already expect.

use std::time::Duration;

use crate::error::ConfigError;

/// Abstraction over environment lookup so config loading can be exercised
/// with a fake environment in tests, without mutating process-global state.
pub trait EnvSource {
    fn getenv(&self, key: &str) -> Option<String>;
}

pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn getenv(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl<F> EnvSource for F
where
    F: Fn(&str) -> Option<String>,
{
    fn getenv(&self, key: &str) -> Option<String> {
        self(key)
    }
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Command template for launching a worker; formatted with the worker's
    /// local port substituted for `%d`.
    pub fprocess: String,
    pub instances: u16,
    pub port: u16,
    pub admin_port: u16,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub exec_timeout: Duration,
    pub write_debug: bool,
    pub cgi_headers: bool,
    pub debug_headers: bool,
    pub marshal_request: bool,
    pub suppress_lock: bool,
    pub content_type: String,
    pub combine_output: bool,
    pub profile: Option<String>,
    pub faas_base_path: String,
    pub faas: Option<String>,
}

impl WatchdogConfig {
    pub fn read(env: &impl EnvSource) -> Result<Self, ConfigError> {
        let fprocess = env.getenv("fprocess").ok_or(ConfigError::MissingFprocess)?;
        if fprocess.trim().is_empty() {
            return Err(ConfigError::MissingFprocess);
        }

        Ok(WatchdogConfig {
            fprocess,
            instances: parse_int_value(env.getenv("instances").as_deref(), 2),
            port: parse_int_value(env.getenv("port").as_deref(), 8080),
            admin_port: parse_int_value(env.getenv("admin_port").as_deref(), 8079),
            read_timeout: parse_int_or_duration_value(
                env.getenv("read_timeout").as_deref(),
                Duration::from_secs(5),
            ),
            write_timeout: parse_int_or_duration_value(
                env.getenv("write_timeout").as_deref(),
                Duration::from_secs(5),
            ),
            exec_timeout: parse_int_or_duration_value(
                env.getenv("exec_timeout").as_deref(),
                Duration::from_secs(0),
            ),
            write_debug: override_bool_if_set(env.getenv("write_debug").as_deref(), false),
            cgi_headers: override_bool_if_set(env.getenv("cgi_headers").as_deref(), true),
            debug_headers: parse_bool_value(env.getenv("debug_headers").as_deref()),
            marshal_request: parse_bool_value(env.getenv("marshal_request").as_deref()),
            suppress_lock: parse_bool_value(env.getenv("suppress_lock").as_deref()),
            content_type: env.getenv("content_type").unwrap_or_default(),
            combine_output: override_bool_if_set(env.getenv("combine_output").as_deref(), true),
            profile: env.getenv("profile").filter(|s| !s.is_empty()),
            faas_base_path: env
                .getenv("faasBasePath")
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| ".".to_string()),
            faas: env.getenv("faas").filter(|s| !s.is_empty()),
        })
    }
}

/// `"true"` is the only string that parses as set-true; anything else
/// (including unset) is false. Not a general boolean parser.
fn parse_bool_value(val: Option<&str>) -> bool {
    val == Some("true")
}

fn is_bool_value_set(val: Option<&str>) -> bool {
    matches!(val, Some("true") | Some("false"))
}

/// Only overrides `default` when the env var was explicitly `"true"` or
/// `"false"`; any other value (including unset) keeps `default`.
fn override_bool_if_set(val: Option<&str>, default: bool) -> bool {
    if is_bool_value_set(val) {
        val == Some("true")
    } else {
        default
    }
}

fn parse_int_value<T>(val: Option<&str>, fallback: T) -> T
where
    T: std::str::FromStr,
{
    match val {
        Some(v) => v.trim().parse().unwrap_or(fallback),
        None => fallback,
    }
}

/// Accepts either a non-negative bare integer (interpreted as seconds) or a
/// `humantime` duration literal (`"1m30s"`); falls back to `default`
/// otherwise.
fn parse_int_or_duration_value(val: Option<&str>, default: Duration) -> Duration {
    let Some(v) = val else { return default };
    let v = v.trim();
    if let Ok(secs) = v.parse::<u64>() {
        return Duration::from_secs(secs);
    }
    humantime::parse_duration(v).unwrap_or(default)
}

#[derive(Debug, Clone, clap::Parser)]
#[command(version = crate::version::VERSION, about = "function scheduler and proxy")]
pub struct CliArgs {
    /// Admin HTTP port to listen on.
    #[clap(long = "port", default_value_t = 0)]
    pub port: u16,

    /// Optional `<entity>[.<entry>]` function to specialize on start.
    #[clap(long = "specialize")]
    pub specialize: Option<String>,

    /// Print version and exit.
    #[clap(long = "version", action = clap::ArgAction::SetTrue)]
    pub version: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn missing_fprocess_is_fatal() {
        let env = env_of(&[]);
        let result = WatchdogConfig::read(&|k: &str| env.get(k).cloned());
        assert!(matches!(result, Err(ConfigError::MissingFprocess)));
    }

    #[test]
    fn defaults_match_documented_values() {
        let env = env_of(&[("fprocess", "worker --port %d")]);
        let cfg = WatchdogConfig::read(&|k: &str| env.get(k).cloned()).unwrap();
        assert_eq!(cfg.instances, 2);
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.admin_port, 8079);
        assert_eq!(cfg.read_timeout, Duration::from_secs(5));
        assert_eq!(cfg.write_timeout, Duration::from_secs(5));
        assert_eq!(cfg.exec_timeout, Duration::from_secs(0));
        assert!(!cfg.write_debug);
        assert!(cfg.cgi_headers);
        assert!(cfg.combine_output);
        assert_eq!(cfg.faas_base_path, ".");
        assert!(cfg.profile.is_none());
        assert!(cfg.faas.is_none());
    }

    #[test]
    fn duration_accepts_integer_seconds_or_literal() {
        let env = env_of(&[
            ("fprocess", "worker"),
            ("read_timeout", "30"),
            ("write_timeout", "1m30s"),
        ]);
        let cfg = WatchdogConfig::read(&|k: &str| env.get(k).cloned()).unwrap();
        assert_eq!(cfg.read_timeout, Duration::from_secs(30));
        assert_eq!(cfg.write_timeout, Duration::from_secs(90));
    }

    #[test]
    fn unset_faas_base_path_keeps_documented_default() {
        let env = env_of(&[("fprocess", "worker")]);
        let cfg = WatchdogConfig::read(&|k: &str| env.get(k).cloned()).unwrap();
        assert_eq!(cfg.faas_base_path, ".");
    }

    #[test]
    fn bool_values_only_true_literal_is_truthy() {
        let env = env_of(&[
            ("fprocess", "worker"),
            ("suppress_lock", "yes"),
            ("marshal_request", "true"),
        ]);
        let cfg = WatchdogConfig::read(&|k: &str| env.get(k).cloned()).unwrap();
        assert!(!cfg.suppress_lock);
        assert!(cfg.marshal_request);
    }
}
