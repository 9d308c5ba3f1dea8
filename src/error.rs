//! Error taxonomy for the bootstrap pipeline.
//!
//! Every variant is fatal within a single invocation. Recovery is re-running
//! the whole pipeline: each step is idempotent, so a partial failure leaves
//! state the next run converges from.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("postgres binaries not found (searched {searched})")]
    BinariesNotFound { searched: String },

    #[error("cluster initialization failed: {reason}")]
    InitializationFailed { reason: String },

    #[error("postgres failed to start: {reason}")]
    ServerStartFailed { reason: String },

    #[error("postgres not ready on port {port} after {attempts} attempts")]
    ReadinessTimeout { attempts: u32, port: u16 },

    #[error("role/database convergence failed: {reason}")]
    IdentityConvergenceFailed { reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type BootstrapResult<T> = Result<T, BootstrapError>;

impl BootstrapError {
    pub fn initialization(reason: impl Into<String>) -> Self {
        Self::InitializationFailed {
            reason: reason.into(),
        }
    }

    pub fn server_start(reason: impl Into<String>) -> Self {
        Self::ServerStartFailed {
            reason: reason.into(),
        }
    }

    pub fn identity(reason: impl Into<String>) -> Self {
        Self::IdentityConvergenceFailed {
            reason: reason.into(),
        }
    }
}
