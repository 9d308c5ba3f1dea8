//! pgbelay - idempotent PostgreSQL bootstrap for containerized deployments.
//!
//! Locates the installed toolchain, initializes the cluster if absent,
//! converges the server configuration, starts the server through `pg_ctl`,
//! polls readiness, and converges a login role, a database, and its grants.
//! Every step detects existing state and re-running the pipeline is always
//! safe.

pub mod artifacts;
pub mod bootstrap;
pub mod config;
pub mod control;
pub mod error;
pub mod identity;
pub mod locate;
pub mod pgconf;
pub mod readiness;
pub mod storage;

pub use artifacts::ConnectionArtifacts;
pub use bootstrap::Bootstrap;
pub use config::{Config, LOOPBACK_HOST};
pub use control::{
    CatalogKind, HealthChecker, PgCtl, PgIsReady, Psql, QueryRunner, Supervisor,
};
pub use error::{BootstrapError, BootstrapResult};
pub use identity::IdentityConverger;
pub use pgconf::ConfigConverger;
pub use readiness::ReadinessPoller;
pub use storage::StorageInitializer;
