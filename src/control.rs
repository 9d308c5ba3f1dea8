//! Capability seams over the postgres management toolchain.
//!
//! The pipeline never runs the server's foreground binary. Everything goes
//! through three narrow interfaces — process supervision, connectivity
//! health checks, and catalog queries — implemented here as adapters over the
//! stock command-line tools (`pg_ctl`, `pg_isready`, `psql`). Tests swap in
//! stubs.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::{config::Config, identity::quote_literal};

/// Cluster superuser created by `initdb -U`.
pub const SUPERUSER: &str = "postgres";

/// Maintenance database catalog queries and DDL run against.
pub const MAINTENANCE_DB: &str = "postgres";

/// Starts and stops the engine as a managed background process.
#[async_trait]
pub trait Supervisor: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn is_started(&self) -> Result<bool>;
}

/// Connectivity probe against a host:port pair.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn is_ready(&self, host: &str, port: u16) -> bool;
}

/// Catalog entity kinds the pipeline checks for existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogKind {
    Role,
    Database,
}

/// Boolean existence checks plus DDL/DCL execution.
#[async_trait]
pub trait QueryRunner: Send + Sync {
    async fn exists(&self, kind: CatalogKind, name: &str) -> Result<bool>;

    /// Execute one statement connected to `database`. Schema-level grants must
    /// run inside the target database, so the connection database is explicit.
    async fn execute(&self, database: &str, statement: &str) -> Result<()>;
}

/// `pg_ctl` adapter: background start with log redirection, fast-mode stop.
pub struct PgCtl {
    bin_dir: PathBuf,
    data_dir: PathBuf,
    log_file: PathBuf,
    port: u16,
}

impl PgCtl {
    pub fn new(bin_dir: &Path, config: &Config) -> Self {
        Self {
            bin_dir: bin_dir.to_path_buf(),
            data_dir: config.data_dir.clone(),
            log_file: config.log_file(),
            port: config.port,
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(self.bin_dir.join("pg_ctl"));
        command.arg("-D").arg(&self.data_dir);
        command
    }
}

#[async_trait]
impl Supervisor for PgCtl {
    async fn start(&self) -> Result<()> {
        if let Some(parent) = self.log_file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create log directory {}", parent.display()))?;
        }

        // -w waits for the postmaster to fork, not for readiness; readiness
        // is the poller's job.
        let output = self
            .command()
            .arg("start")
            .arg("-w")
            .arg("-l")
            .arg(&self.log_file)
            .arg("-o")
            .arg(format!("-p {} -h {}", self.port, crate::pgconf::LISTEN_ALL))
            .output()
            .await
            .context("failed to launch pg_ctl")?;

        if !output.status.success() {
            bail!(
                "pg_ctl start exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let output = self
            .command()
            .arg("stop")
            .arg("-m")
            .arg("fast")
            .output()
            .await
            .context("failed to launch pg_ctl")?;

        if !output.status.success() {
            bail!(
                "pg_ctl stop exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn is_started(&self) -> Result<bool> {
        // pg_ctl status: 0 running, 3 no server, 4 inaccessible data dir
        let output = self
            .command()
            .arg("status")
            .output()
            .await
            .context("failed to launch pg_ctl")?;
        Ok(output.status.success())
    }
}

/// `pg_isready` adapter. Any launch or probe failure reads as "not ready".
pub struct PgIsReady {
    bin_dir: PathBuf,
}

impl PgIsReady {
    pub fn new(bin_dir: &Path) -> Self {
        Self {
            bin_dir: bin_dir.to_path_buf(),
        }
    }
}

#[async_trait]
impl HealthChecker for PgIsReady {
    async fn is_ready(&self, host: &str, port: u16) -> bool {
        let result = Command::new(self.bin_dir.join("pg_isready"))
            .arg("-h")
            .arg(host)
            .arg("-p")
            .arg(port.to_string())
            .arg("-q")
            .output()
            .await;
        match result {
            Ok(output) => output.status.success(),
            Err(err) => {
                debug!(%err, "pg_isready launch failed");
                false
            }
        }
    }
}

/// `psql` adapter connecting over the Unix socket as the superuser.
///
/// The socket path rides on the `local all all trust` access rule, so it works
/// before the application role's password exists; loopback TCP already
/// requires md5 by then.
pub struct Psql {
    bin_dir: PathBuf,
    port: u16,
}

impl Psql {
    pub fn new(bin_dir: &Path, port: u16) -> Self {
        Self {
            bin_dir: bin_dir.to_path_buf(),
            port,
        }
    }

    fn command(&self, database: &str) -> Command {
        let mut command = Command::new(self.bin_dir.join("psql"));
        command
            .arg("-p")
            .arg(self.port.to_string())
            .arg("-U")
            .arg(SUPERUSER)
            .arg("-d")
            .arg(database)
            .arg("-X")
            .arg("-v")
            .arg("ON_ERROR_STOP=1");
        command
    }
}

#[async_trait]
impl QueryRunner for Psql {
    async fn exists(&self, kind: CatalogKind, name: &str) -> Result<bool> {
        let sql = match kind {
            CatalogKind::Role => format!(
                "SELECT 1 FROM pg_roles WHERE rolname = {}",
                quote_literal(name)
            ),
            CatalogKind::Database => format!(
                "SELECT 1 FROM pg_database WHERE datname = {}",
                quote_literal(name)
            ),
        };

        let output = self
            .command(MAINTENANCE_DB)
            .arg("-tA")
            .arg("-c")
            .arg(&sql)
            .output()
            .await
            .context("failed to launch psql")?;

        if !output.status.success() {
            bail!(
                "psql exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim() == "1")
    }

    async fn execute(&self, database: &str, statement: &str) -> Result<()> {
        let output = self
            .command(database)
            .arg("-c")
            .arg(statement)
            .output()
            .await
            .context("failed to launch psql")?;

        if !output.status.success() {
            bail!(
                "psql exited with {} running {statement:?}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        debug!(database, statement, "executed");
        Ok(())
    }
}
