//! A single function-executor subprocess: launch, readiness, specialize,
//! terminate.

use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::error::SchedulerError;

#[derive(Serialize)]
struct SpecializeRequest<'a> {
    filepath: &'a str,
    #[serde(rename = "functionName")]
    function_name: &'a str,
}

pub struct WorkerProcess {
    child: Child,
    pub port: u16,
    pub addr: SocketAddr,
    ready: AtomicBool,
}

impl WorkerProcess {
    /// Formats `fprocess`'s one `%d` placeholder with `port` and spawns it
    /// under a shell, the way the teacher's own subprocess launches do.
    /// Stdout/stderr lines are relayed as structured `tracing` events
    /// carrying `port`, the Rust-native analogue of the original's
    /// `"Environment <port>: "` line prefix.
    pub fn launch(fprocess: &str, port: u16) -> std::io::Result<Self> {
        let cmd = fprocess.replace("%d", &port.to_string());
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&cmd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(relay_lines(stdout, port, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(relay_lines(stderr, port, true));
        }

        let addr: SocketAddr = format!("127.0.0.1:{port}")
            .parse()
            .expect("formatted loopback address is always valid");

        Ok(WorkerProcess {
            child,
            port,
            addr,
            ready: AtomicBool::new(false),
        })
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub async fn terminate(mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!(port = self.port, error = %e, "failed to signal worker for termination");
        }
        if let Err(e) = self.child.wait().await {
            warn!(port = self.port, error = %e, "failed to reap worker process");
        }
    }

    /// `POST`s `{"filepath": base_path, "functionName": name}` to
    /// `http://127.0.0.1:<port>/v2/specialize`. Any 2xx is success.
    pub async fn specialize(
        &self,
        client: &reqwest::Client,
        base_path: &str,
        function_name: &str,
    ) -> Result<(), SchedulerError> {
        specialize_worker(client, self.addr, self.port, base_path, function_name).await
    }
}

/// Free-standing form of [`WorkerProcess::specialize`] that borrows nothing
/// from the worker map, so callers don't need to hold it across the HTTP
/// round trip.
pub async fn specialize_worker(
    client: &reqwest::Client,
    addr: SocketAddr,
    port: u16,
    base_path: &str,
    function_name: &str,
) -> Result<(), SchedulerError> {
    let url = format!("http://{addr}/v2/specialize");
    let body = SpecializeRequest {
        filepath: base_path,
        function_name,
    };
    let resp = client
        .post(&url)
        .header("Content-Type", "application/json")
        .json(&body)
        .send()
        .await?;
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(SchedulerError::Specialization(format!(
            "worker on port {port} returned {}",
            resp.status()
        )))
    }
}

async fn relay_lines<R: tokio::io::AsyncRead + Unpin>(reader: R, port: u16, is_stderr: bool) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if is_stderr {
                    warn!(port, "{}", line);
                } else {
                    info!(port, "{}", line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(port, error = %e, "worker output stream error");
                break;
            }
        }
    }
}
