//! Installing rendered artifacts and reloading the proxy.
//!
//! Files are written to a temporary file in the destination directory and
//! renamed into place, so HAProxy never reads a partially written config.
//! Write failures abort the pass; reload failures are only logged because the
//! new configuration is already on disk.

use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::metrics;
use crate::render::RenderedConfig;

/// Signals the supervised proxy process to reload its configuration.
#[async_trait]
pub trait ProxyReloader: Send + Sync {
    /// Gracefully reload `unit`. Must not drop established connections.
    async fn reload(&self, unit: &str) -> Result<(), SyncError>;
}

/// Reloads a systemd unit through `systemctl`.
#[derive(Debug, Clone)]
pub struct SystemdReloader {
    timeout: Duration,
}

impl SystemdReloader {
    /// Create a reloader whose calls are bounded by `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ProxyReloader for SystemdReloader {
    async fn reload(&self, unit: &str) -> Result<(), SyncError> {
        let output = Command::new("systemctl")
            .args(["reload", "--job-mode=ignore-dependencies", unit])
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| {
                SyncError::Reload(format!("systemctl timed out after {:?}", self.timeout))
            })??;

        if output.status.success() {
            Ok(())
        } else {
            Err(SyncError::Reload(format!(
                "systemctl exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

/// Result of installing one rendered configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Number of certificate files written.
    pub certs_written: usize,
    /// Whether the reload signal succeeded.
    pub reloaded: bool,
}

/// Installs rendered artifacts and triggers the reload.
pub struct Orchestrator {
    config_path: PathBuf,
    unit: String,
    reloader: Arc<dyn ProxyReloader>,
}

impl Orchestrator {
    /// Create an orchestrator for the given config file and supervisor unit.
    pub fn new(config_path: PathBuf, unit: String, reloader: Arc<dyn ProxyReloader>) -> Self {
        Self {
            config_path,
            unit,
            reloader,
        }
    }

    /// Path of the live configuration file.
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Write certificates, swap in the new config and reload the proxy.
    pub async fn apply(&self, rendered: &RenderedConfig) -> Result<ApplyOutcome, SyncError> {
        let config_path = self.config_path.clone();
        let files = rendered.clone();
        tokio::task::spawn_blocking(move || install(&config_path, &files))
            .await
            .map_err(|e| SyncError::Io(std::io::Error::other(e)))??;
        info!(
            path = %self.config_path.display(),
            bytes = rendered.document.len(),
            certs = rendered.certs.len(),
            "proxy configuration installed"
        );

        let reloaded = match self.reloader.reload(&self.unit).await {
            Ok(()) => {
                info!(unit = %self.unit, "proxy reloaded");
                true
            }
            Err(e) => {
                warn!(
                    unit = %self.unit,
                    error = %e,
                    "proxy reload failed; new config stays on disk"
                );
                false
            }
        };
        metrics::record_reload(reloaded);

        Ok(ApplyOutcome {
            certs_written: rendered.certs.len(),
            reloaded,
        })
    }
}

/// Certificates first, so the new document never references a missing file.
fn install(config_path: &Path, rendered: &RenderedConfig) -> Result<(), SyncError> {
    for cert in &rendered.certs {
        write_atomic(&cert.path, cert.contents.as_bytes())?;
        debug!(path = %cert.path.display(), "certificate written");
    }
    write_atomic(config_path, rendered.document.as_bytes())
}

/// Replace `path` with `contents` via a same-directory temporary file and rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), SyncError> {
    let install_err = |source: std::io::Error| SyncError::Install {
        path: path.display().to_string(),
        source,
    };

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(install_err)?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(install_err)?;
    tmp.write_all(contents).map_err(install_err)?;
    tmp.as_file().sync_all().map_err(install_err)?;
    tmp.persist(path).map_err(|e| install_err(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::CertFile;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingReloader {
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl ProxyReloader for RecordingReloader {
        async fn reload(&self, unit: &str) -> Result<(), SyncError> {
            self.calls.lock().push(unit.to_string());
            if self.fail {
                Err(SyncError::Reload("unit not found".into()))
            } else {
                Ok(())
            }
        }
    }

    fn rendered(dir: &Path) -> RenderedConfig {
        RenderedConfig {
            document: "global\n".into(),
            certs: vec![CertFile {
                path: dir.join("certs").join("web.pem"),
                contents: "PEM".into(),
            }],
        }
    }

    #[tokio::test]
    async fn test_apply_writes_files_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let reloader = Arc::new(RecordingReloader::default());
        let orchestrator = Orchestrator::new(
            dir.path().join("haproxy.cfg"),
            "haproxy.cycore@i-1".into(),
            reloader.clone(),
        );

        let outcome = orchestrator.apply(&rendered(dir.path())).await.unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome {
                certs_written: 1,
                reloaded: true
            }
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("haproxy.cfg")).unwrap(),
            "global\n"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("certs/web.pem")).unwrap(),
            "PEM"
        );
        assert_eq!(*reloader.calls.lock(), vec!["haproxy.cycore@i-1".to_string()]);
    }

    #[tokio::test]
    async fn test_reload_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let reloader = Arc::new(RecordingReloader {
            fail: true,
            ..Default::default()
        });
        let orchestrator =
            Orchestrator::new(dir.path().join("haproxy.cfg"), "unit".into(), reloader);

        let outcome = orchestrator.apply(&rendered(dir.path())).await.unwrap();
        assert!(!outcome.reloaded);
        assert!(dir.path().join("haproxy.cfg").exists());
    }

    #[tokio::test]
    async fn test_write_failure_skips_reload() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the certs directory should be
        std::fs::write(dir.path().join("certs"), "not a dir").unwrap();
        let reloader = Arc::new(RecordingReloader::default());
        let orchestrator = Orchestrator::new(
            dir.path().join("haproxy.cfg"),
            "unit".into(),
            reloader.clone(),
        );

        let err = orchestrator.apply(&rendered(dir.path())).await.unwrap_err();
        assert!(matches!(err, SyncError::Install { .. }));
        assert!(reloader.calls.lock().is_empty());
        assert!(!dir.path().join("haproxy.cfg").exists());
    }

    #[test]
    fn test_write_atomic_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("haproxy.cfg");
        std::fs::write(&path, "old").unwrap();

        write_atomic(&path, b"new").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
        // Only the target remains; the temporary file was renamed
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
