//! The sequential bootstrap pipeline.
//!
//! locate → storage → config convergence → start (skippable when already
//! accepting connections) → readiness poll → identity convergence →
//! connection artifacts → final readiness re-check. Every step is fatal on
//! failure; idempotence of the individual steps is the only recovery
//! mechanism, so a failed run is resumed by running the pipeline again.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{error, info};

use crate::{
    artifacts::ConnectionArtifacts,
    config::{Config, LOOPBACK_HOST},
    control::{HealthChecker, PgCtl, PgIsReady, Psql, QueryRunner, Supervisor},
    error::{BootstrapError, BootstrapResult},
    identity::IdentityConverger,
    locate,
    pgconf::ConfigConverger,
    readiness::ReadinessPoller,
    storage::StorageInitializer,
};

/// Lines of server log echoed when a step fails.
const LOG_TAIL_LINES: usize = 50;

pub struct Bootstrap<S, H, Q> {
    config: Config,
    bin_dir: PathBuf,
    supervisor: S,
    health: H,
    query: Q,
    poller: ReadinessPoller,
}

impl Bootstrap<PgCtl, PgIsReady, Psql> {
    /// Wire up the stock command-line adapters after locating the toolchain.
    pub fn with_cli_adapters(config: Config) -> BootstrapResult<Self> {
        let bin_dir = locate::find_bin_dir(Some(Path::new(locate::WELL_KNOWN_ROOT)))?;
        info!(bin_dir = %bin_dir.display(), "located postgres toolchain");
        let supervisor = PgCtl::new(&bin_dir, &config);
        let health = PgIsReady::new(&bin_dir);
        let query = Psql::new(&bin_dir, config.port);
        Ok(Self::new(config, bin_dir, supervisor, health, query))
    }
}

impl<S, H, Q> Bootstrap<S, H, Q>
where
    S: Supervisor,
    H: HealthChecker,
    Q: QueryRunner,
{
    pub fn new(config: Config, bin_dir: PathBuf, supervisor: S, health: H, query: Q) -> Self {
        Self {
            config,
            bin_dir,
            supervisor,
            health,
            query,
            poller: ReadinessPoller::default(),
        }
    }

    pub fn with_poller(mut self, poller: ReadinessPoller) -> Self {
        self.poller = poller;
        self
    }

    /// Run the whole pipeline to convergence.
    pub async fn run(&self) -> BootstrapResult<()> {
        let port = self.config.port;
        info!(
            database = %self.config.database,
            user = %self.config.user,
            port,
            data_dir = %self.config.data_dir.display(),
            "starting postgres bootstrap"
        );

        StorageInitializer::new(&self.config, &self.bin_dir)
            .ensure()
            .await?;

        ConfigConverger::new(port)
            .converge(&self.config.data_dir)
            .await?;

        if self.health.is_ready(LOOPBACK_HOST, port).await {
            info!(port, "postgres already accepting connections; skipping start");
        } else if let Err(err) = self.supervisor.start().await {
            self.dump_diagnostics().await;
            return Err(BootstrapError::server_start(format!("{err:#}")));
        }

        if let Err(err) = self.poller.wait_ready(&self.health, LOOPBACK_HOST, port).await {
            self.dump_diagnostics().await;
            return Err(err);
        }

        IdentityConverger::from_config(&self.config)
            .converge(&self.query)
            .await?;

        ConnectionArtifacts::new(&self.config).write().await?;

        // Re-verify before declaring success; identity convergence may have
        // been talking to an instance that has since died.
        if !self.health.is_ready(LOOPBACK_HOST, port).await {
            self.dump_diagnostics().await;
            return Err(BootstrapError::ReadinessTimeout { attempts: 1, port });
        }

        info!(url = %self.config.connection_url(), "postgres bootstrap complete");
        Ok(())
    }

    /// Echo the server log tail and a data-directory listing to stderr.
    async fn dump_diagnostics(&self) {
        let log_file = self.config.log_file();
        match log_tail(&log_file, LOG_TAIL_LINES).await {
            Some(tail) => {
                eprintln!("--- last {LOG_TAIL_LINES} lines of {} ---", log_file.display());
                eprintln!("{tail}");
            }
            None => error!(path = %log_file.display(), "no server log to dump"),
        }
        if let Some(listing) = dir_listing(&self.config.data_dir).await {
            eprintln!("--- contents of {} ---", self.config.data_dir.display());
            eprintln!("{listing}");
        }
    }
}

/// Last `lines` lines of a text file, if it exists.
pub async fn log_tail(path: &Path, lines: usize) -> Option<String> {
    let text = fs::read_to_string(path).await.ok()?;
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    Some(all[start..].join("\n"))
}

/// Sorted one-name-per-line listing of a directory, if readable.
pub async fn dir_listing(path: &Path) -> Option<String> {
    let mut entries = fs::read_dir(path).await.ok()?;
    let mut names = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Some(names.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    #[tokio::test]
    async fn log_tail_returns_last_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("postgres.log");
        let body: String = (1..=100).map(|n| format!("line {n}\n")).collect();
        std::fs::write(&path, body).unwrap();

        let tail = log_tail(&path, 3).await.unwrap();
        assert_eq!(tail, "line 98\nline 99\nline 100");
    }

    #[tokio::test]
    async fn log_tail_of_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(log_tail(&dir.path().join("nope.log"), 10).await.is_none());
    }

    #[tokio::test]
    async fn dir_listing_is_sorted() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b"), "").unwrap();
        std::fs::write(dir.path().join("a"), "").unwrap();

        let listing = dir_listing(dir.path()).await.unwrap();
        assert_eq!(listing, "a\nb");
    }
}
