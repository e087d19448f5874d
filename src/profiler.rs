//! Optional CSV action profiler: appends one line per recorded action to a
//! file named by the `profile` environment variable.

use std::io;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

pub struct Profiler {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl Profiler {
    pub async fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        Ok(Profiler {
            path,
            file: Mutex::new(Some(file)),
        })
    }

    /// Appends `"scheduler,<action>,<unix>.<nsec>\n"`. Write failures are
    /// logged, never fatal: profiling is diagnostic, not load-bearing.
    pub async fn record(&self, action: &str) {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        let line = format!("scheduler,{},{}.{:09}\n", action, now.as_secs(), now.subsec_nanos());
        let mut guard = self.file.lock().await;
        if let Some(file) = guard.as_mut() {
            if let Err(e) = file.write_all(line.as_bytes()).await {
                warn!(path = %self.path.display(), error = %e, "failed to write profile line");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_appends_a_csv_line() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.csv");
        let profiler = Profiler::open(path.as_std_path()).await.unwrap();
        profiler.record("serve").await;
        profiler.record("swap").await;
        let contents = tokio::fs::read_to_string(path.as_std_path()).await.unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("scheduler,serve,"));
        assert!(lines[1].starts_with("scheduler,swap,"));
    }
}
