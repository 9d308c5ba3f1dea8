//! Data directory and cluster initialization.
//!
//! Idempotence hinges on a single signal: the `PG_VERSION` marker `initdb`
//! drops at the cluster root. Present means initialized, absent means run
//! `initdb`. No deeper integrity validation is attempted.

use std::path::Path;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    control::SUPERUSER,
    error::{BootstrapError, BootstrapResult},
};

/// Marker file `initdb` writes at the cluster root.
const VERSION_MARKER: &str = "PG_VERSION";

/// UTF-8 locales probed for, most preferred first. Collation is fixed at
/// `initdb` time, so the choice happens before initialization.
const PREFERRED_LOCALES: [&str; 2] = ["en_US.UTF-8", "en_US.utf8"];

/// Portable fallback when no preferred locale is installed.
const FALLBACK_LOCALE: &str = "C.UTF-8";

/// Whether `data_dir` already holds an initialized cluster.
pub fn is_initialized(data_dir: &Path) -> bool {
    data_dir.join(VERSION_MARKER).is_file()
}

/// Pick the cluster locale from the system's available locales.
pub fn choose_locale<'a>(available: impl IntoIterator<Item = &'a str>) -> String {
    let names: Vec<&str> = available.into_iter().map(str::trim).collect();
    for candidate in PREFERRED_LOCALES {
        if names.contains(&candidate) {
            return candidate.to_string();
        }
    }
    FALLBACK_LOCALE.to_string()
}

/// Ensures the data directory exists, is private, and holds a cluster.
pub struct StorageInitializer<'a> {
    config: &'a Config,
    bin_dir: &'a Path,
}

impl<'a> StorageInitializer<'a> {
    pub fn new(config: &'a Config, bin_dir: &'a Path) -> Self {
        Self { config, bin_dir }
    }

    /// Idempotent: creates and secures the directory every run, initializes
    /// the cluster only when the version marker is absent. Initialization
    /// failure is fatal; the recovery path is fixing the environment and
    /// re-running the whole pipeline.
    pub async fn ensure(&self) -> BootstrapResult<()> {
        let data_dir = &self.config.data_dir;
        tokio::fs::create_dir_all(data_dir).await?;
        self.restrict_permissions(data_dir).await?;
        self.fix_ownership(data_dir).await;

        if is_initialized(data_dir) {
            debug!(data_dir = %data_dir.display(), "cluster already initialized");
            return Ok(());
        }

        let locale = self.probe_locale().await;
        info!(data_dir = %data_dir.display(), %locale, "initializing cluster");

        let output = Command::new(self.bin_dir.join("initdb"))
            .arg("-D")
            .arg(data_dir)
            .arg("-U")
            .arg(SUPERUSER)
            .arg("--encoding=UTF8")
            .arg(format!("--locale={locale}"))
            .output()
            .await
            .map_err(|err| {
                BootstrapError::initialization(format!("failed to launch initdb: {err}"))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BootstrapError::initialization(format!(
                "initdb exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(())
    }

    async fn restrict_permissions(&self, data_dir: &Path) -> BootstrapResult<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(data_dir, std::fs::Permissions::from_mode(0o700)).await?;
        }
        #[cfg(not(unix))]
        {
            let _ = data_dir;
        }
        Ok(())
    }

    /// The server refuses to run against a directory it does not own. Failure
    /// here is a warning, not fatal: when the pipeline already runs as the
    /// cluster owner there is nothing to fix and often no permission to try.
    async fn fix_ownership(&self, data_dir: &Path) {
        let result = Command::new("chown")
            .arg("-R")
            .arg(format!("{SUPERUSER}:{SUPERUSER}"))
            .arg(data_dir)
            .output()
            .await;
        match result {
            Ok(output) if output.status.success() => {}
            Ok(output) => {
                warn!(
                    status = %output.status,
                    "chown of data directory failed; continuing"
                );
            }
            Err(err) => {
                warn!(%err, "could not run chown; continuing");
            }
        }
    }

    async fn probe_locale(&self) -> String {
        match Command::new("locale").arg("-a").output().await {
            Ok(output) if output.status.success() => {
                let text = String::from_utf8_lossy(&output.stdout);
                choose_locale(text.lines())
            }
            _ => {
                warn!("locale probe failed; falling back to {FALLBACK_LOCALE}");
                FALLBACK_LOCALE.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    #[test]
    fn marker_file_is_the_idempotence_signal() {
        let dir = TempDir::new().unwrap();
        assert!(!is_initialized(dir.path()));

        std::fs::write(dir.path().join(VERSION_MARKER), "16\n").unwrap();
        assert!(is_initialized(dir.path()));
    }

    #[test]
    fn prefers_us_english_utf8() {
        let available = ["C", "POSIX", "en_US.utf8", "C.UTF-8"];
        assert_eq!(choose_locale(available), "en_US.utf8");
    }

    #[test]
    fn falls_back_to_portable_utf8() {
        let available = ["C", "POSIX"];
        assert_eq!(choose_locale(available), "C.UTF-8");
    }

    #[test]
    fn locale_probe_output_may_carry_whitespace() {
        assert_eq!(choose_locale(["  en_US.UTF-8  "]), "en_US.UTF-8");
    }
}
